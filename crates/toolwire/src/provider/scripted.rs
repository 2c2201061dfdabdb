//! An in-memory provider that replays a script.
//!
//! Each call to `generate` or `generate_stream` pops the next
//! [`ScriptStep`]. Streaming emulates the configured wire style: OpenAI
//! style splits text and tool-call arguments into fragments, Gemini style
//! delivers calls whole. Every conversation the provider was sent is
//! recorded for assertions.

use super::{
    BoxFuture, Delta, DeltaStream, FinishReason, GenerateRequest, Provider, ProviderKind, Reply,
    Round,
};
use crate::tools::executor::{ToolCallRequest, ToolCallResult};
use crate::{Error, Prompt, TransportError, Usage};
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// One conversation turn as the scripted provider sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptTurn {
    System(String),
    User(String),
    Model {
        text: String,
        calls: Vec<ToolCallRequest>,
    },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply {
        text: String,
        calls: Vec<ToolCallRequest>,
        usage: Option<Usage>,
    },
    /// Fail the request with a transport error.
    Fail(String),
    /// Stream `text`, then fail mid-stream with a transport error carrying
    /// `message`. Non-streaming requests fail outright.
    Interrupted { text: String, message: String },
}

impl ScriptStep {
    /// A final answer.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Reply {
            text: text.into(),
            calls: Vec::new(),
            usage: None,
        }
    }

    /// A round requesting one call. The id is left empty, so the usual
    /// `"{name}_{index}"` id is synthesized.
    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self::text("").with_call(name, arguments)
    }

    /// Add another call to this round.
    pub fn with_call(self, name: impl Into<String>, arguments: Value) -> Self {
        let raw = arguments.to_string();
        self.with_request(ToolCallRequest::from_raw("", name, &raw))
    }

    /// Add a fully specified call (explicit id, or malformed arguments).
    pub fn with_request(mut self, request: ToolCallRequest) -> Self {
        if let Self::Reply { calls, .. } = &mut self {
            calls.push(request);
        }
        self
    }

    pub fn with_usage(mut self, u: Usage) -> Self {
        if let Self::Reply { usage, .. } = &mut self {
            *usage = Some(u);
        }
        self
    }
}

/// A provider that replays queued [`ScriptStep`]s.
#[derive(Debug)]
pub struct ScriptedProvider {
    kind: ProviderKind,
    steps: Mutex<VecDeque<ScriptStep>>,
    fallback: Option<ScriptStep>,
    requests: Mutex<Vec<Vec<ScriptTurn>>>,
    response_schemas: Mutex<Vec<Option<Value>>>,
    chunk_size: usize,
    delay: Duration,
}

impl ScriptedProvider {
    /// Empty script emulating `kind`'s streaming style.
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            steps: Mutex::new(VecDeque::new()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            response_schemas: Mutex::new(Vec::new()),
            chunk_size: 8,
            delay: Duration::ZERO,
        }
    }

    pub fn with_step(self, step: ScriptStep) -> Self {
        self.push(step);
        self
    }

    pub fn with_steps(self, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        for step in steps {
            self.push(step);
        }
        self
    }

    /// Step replayed whenever the queue is empty.
    pub fn with_fallback(mut self, step: ScriptStep) -> Self {
        self.fallback = Some(step);
        self
    }

    /// Characters per streamed text or argument fragment (minimum 1).
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Pause before every streamed delta.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, step: ScriptStep) {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
    }

    /// Every conversation sent so far, oldest first.
    pub fn requests(&self) -> Vec<Vec<ScriptTurn>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The response schema each request asked for, oldest first.
    pub fn response_schemas(&self) -> Vec<Option<Value>> {
        self.response_schemas
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of generate calls made so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Steps still queued.
    pub fn remaining(&self) -> usize {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next_step(
        &self,
        turns: &[ScriptTurn],
        request: &GenerateRequest<'_>,
    ) -> Result<ScriptStep, Error> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(turns.to_vec());
        self.response_schemas
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.response_schema.cloned());
        let step = self
            .steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .or_else(|| self.fallback.clone());
        match step {
            Some(ScriptStep::Fail(message)) => Err(TransportError::new(message).into()),
            Some(step) => Ok(step),
            None => Err(Error::InvalidResponse("script exhausted".into())),
        }
    }

    fn stream_deltas(&self, text: &str, calls: Vec<ToolCallRequest>, usage: Option<Usage>) -> Vec<Delta> {
        let mut deltas: Vec<Delta> = chunks(text, self.chunk_size)
            .into_iter()
            .map(Delta::Text)
            .collect();
        let reason = if calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        match self.kind {
            ProviderKind::OpenAi => {
                for (index, call) in calls.into_iter().enumerate() {
                    let id = (!call.id.is_empty()).then_some(call.id);
                    let mut pieces = chunks(&call.raw_arguments, self.chunk_size).into_iter();
                    deltas.push(Delta::ToolCallFragment {
                        index,
                        id,
                        name: Some(call.name),
                        arguments: pieces.next().unwrap_or_default(),
                    });
                    deltas.extend(pieces.map(|arguments| Delta::ToolCallFragment {
                        index,
                        id: None,
                        name: None,
                        arguments,
                    }));
                }
            }
            ProviderKind::Gemini => {
                if !calls.is_empty() {
                    deltas.push(Delta::ToolCalls(calls));
                }
            }
        }
        deltas.push(Delta::Finish { reason });
        if let Some(u) = usage {
            deltas.push(Delta::Usage(u));
        }
        deltas
    }
}

/// Split on character boundaries into pieces of at most `size` chars.
fn chunks(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

impl Provider for ScriptedProvider {
    type Turn = ScriptTurn;

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn prompt_turns(&self, prompt: &Prompt) -> Vec<ScriptTurn> {
        let mut turns = Vec::with_capacity(2);
        if let Some(system) = &prompt.system {
            turns.push(ScriptTurn::System(system.clone()));
        }
        turns.push(ScriptTurn::User(prompt.input.clone()));
        turns
    }

    fn generate<'a>(
        &'a self,
        turns: &'a [ScriptTurn],
        request: GenerateRequest<'a>,
    ) -> BoxFuture<'a, Result<Reply, Error>> {
        Box::pin(async move {
            let (text, calls, usage) = match self.next_step(turns, &request)? {
                ScriptStep::Reply { text, calls, usage } => (text, calls, usage),
                ScriptStep::Interrupted { message, .. } | ScriptStep::Fail(message) => {
                    return Err(TransportError::new(message).into());
                }
            };
            // Through the builder so missing ids are filled as in streamed
            // rounds.
            let mut builder = super::round::RoundBuilder::new();
            builder.push(&Delta::Text(text));
            if !calls.is_empty() {
                builder.push(&Delta::ToolCalls(calls));
            }
            let Reply { round, .. } = builder.finish();
            Ok(Reply { round, usage })
        })
    }

    fn generate_stream<'a>(
        &'a self,
        turns: &'a [ScriptTurn],
        request: GenerateRequest<'a>,
    ) -> BoxFuture<'a, Result<DeltaStream, Error>> {
        Box::pin(async move {
            let items: Vec<Result<Delta, Error>> = match self.next_step(turns, &request)? {
                ScriptStep::Reply { text, calls, usage } => self
                    .stream_deltas(&text, calls, usage)
                    .into_iter()
                    .map(Ok)
                    .collect(),
                ScriptStep::Interrupted { text, message } => chunks(&text, self.chunk_size)
                    .into_iter()
                    .map(|t| Ok(Delta::Text(t)))
                    .chain(std::iter::once(Err(TransportError::new(message).into())))
                    .collect(),
                ScriptStep::Fail(message) => return Err(TransportError::new(message).into()),
            };
            let delay = self.delay;
            let stream = futures::stream::iter(items).then(move |d| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                d
            });
            Ok(Box::pin(stream) as DeltaStream)
        })
    }

    fn model_turn(&self, text: &str, calls: &[ToolCallRequest]) -> ScriptTurn {
        ScriptTurn::Model {
            text: text.to_string(),
            calls: calls.to_vec(),
        }
    }

    fn tool_result_turns(&self, results: &[ToolCallResult]) -> Vec<ScriptTurn> {
        results
            .iter()
            .map(|r| ScriptTurn::ToolResult {
                call_id: r.call_id.clone(),
                name: r.name.clone(),
                content: r.content_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::collect_round;
    use serde_json::json;

    #[tokio::test]
    async fn replays_steps_in_order_and_records_requests() {
        let p = ScriptedProvider::new(ProviderKind::Gemini)
            .with_step(ScriptStep::tool_call("clock", json!({})))
            .with_step(ScriptStep::text("done"));
        let turns = p.prompt_turns(&Prompt::new("time?"));
        let req = GenerateRequest::new("m", &[]);

        let first = p.generate(&turns, req).await.unwrap();
        assert_eq!(first.round.calls()[0].id, "clock_0");
        let second = p.generate(&turns, req).await.unwrap();
        assert_eq!(second.round, Round::FinalAnswer { text: "done".into() });
        assert!(matches!(
            p.generate(&turns, req).await,
            Err(Error::InvalidResponse(_))
        ));
        assert_eq!(p.call_count(), 3);
        assert_eq!(p.requests()[0], vec![ScriptTurn::User("time?".into())]);
    }

    #[tokio::test]
    async fn openai_style_stream_fragments_arguments() {
        let p = ScriptedProvider::new(ProviderKind::OpenAi)
            .with_chunk_size(4)
            .with_step(
                ScriptStep::tool_call("search", json!({"query": "rust async"}))
                    .with_usage(Usage::new(7, 3)),
            );
        let stream = p
            .generate_stream(&[], GenerateRequest::new("m", &[]))
            .await
            .unwrap();
        let mut fragments = 0;
        let reply = collect_round(stream, |d| {
            if matches!(d, Delta::ToolCallFragment { .. }) {
                fragments += 1;
            }
        })
        .await
        .unwrap();
        assert!(fragments > 1);
        let call = &reply.round.calls()[0];
        assert_eq!(call.id, "search_0");
        assert_eq!(call.arguments["query"], "rust async");
        assert_eq!(reply.usage, Some(Usage::new(7, 3)));
    }

    #[tokio::test]
    async fn gemini_style_stream_delivers_whole_calls() {
        let p = ScriptedProvider::new(ProviderKind::Gemini)
            .with_step(ScriptStep::text("héllo wörld").with_call("clock", json!({})));
        let stream = p
            .generate_stream(&[], GenerateRequest::new("m", &[]))
            .await
            .unwrap();
        let deltas: Vec<Delta> = stream.map(|d| d.unwrap()).collect().await;
        assert!(deltas.iter().any(|d| matches!(d, Delta::ToolCalls(c) if c.len() == 1)));
        let text: String = deltas
            .iter()
            .filter_map(|d| match d {
                Delta::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "héllo wörld");
    }

    #[tokio::test]
    async fn fail_step_and_fallback() {
        let p = ScriptedProvider::new(ProviderKind::OpenAi)
            .with_step(ScriptStep::Fail("503".into()))
            .with_fallback(ScriptStep::text("again"));
        let req = GenerateRequest::new("m", &[]);
        assert!(matches!(p.generate(&[], req).await, Err(Error::Transport(_))));
        for _ in 0..3 {
            assert_eq!(p.generate(&[], req).await.unwrap().round.text(), "again");
        }
    }

    #[tokio::test]
    async fn interrupted_step_streams_text_then_fails() {
        let p = ScriptedProvider::new(ProviderKind::Gemini)
            .with_chunk_size(4)
            .with_steps([
                ScriptStep::Interrupted {
                    text: "partial".into(),
                    message: "quota exceeded".into(),
                },
                ScriptStep::Interrupted {
                    text: "x".into(),
                    message: "down".into(),
                },
            ]);
        let req = GenerateRequest::new("m", &[]);
        let items: Vec<Result<Delta, Error>> =
            p.generate_stream(&[], req).await.unwrap().collect().await;
        assert!(matches!(&items[0], Ok(Delta::Text(t)) if t == "part"));
        assert!(matches!(&items[1], Ok(Delta::Text(t)) if t == "ial"));
        assert!(matches!(&items[2], Err(Error::Transport(t)) if t.message == "quota exceeded"));
        assert_eq!(items.len(), 3);

        assert!(matches!(p.generate(&[], req).await, Err(Error::Transport(_))));
    }
}
