//! The round loop: a multi-round tool-calling conversation on top of any
//! [`Provider`].
//!
//! Each round sends the conversation and gets back a [`Round`]. A final
//! answer ends the run. A tool-call batch is executed through the
//! [`ToolExecutor`], the model's turn and the result turns are appended,
//! and the next round starts. The model gets at most `max_rounds` rounds;
//! asking for round `max_rounds + 1` fails with
//! [`Error::ToolRoundLimitExceeded`] before anything is sent.

use super::config::LoopConfig;
use super::events::{EventHandler, LoopEvent, NoopHandler};
use crate::provider::{Delta, GenerateRequest, Provider, Reply, Round, collect_round};
use crate::tools::executor::{ToolCallResult, ToolExecutor};
use crate::{Error, Prompt, ToolError, Usage, generate_trace_id};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct LoopResult<T> {
    /// Correlates the run's log lines.
    pub trace_id: String,
    /// The final answer.
    pub text: String,
    /// Usage summed over every round.
    pub usage: Usage,
    pub rounds_used: u32,
    /// The full conversation, including the opening turns.
    pub turns: Vec<T>,
    /// Every tool result, in execution order.
    pub tool_results: Vec<ToolCallResult>,
    /// The final answer parsed as JSON, when a response schema was
    /// configured and the answer parsed.
    pub structured: Option<Value>,
}

impl<T> LoopResult<T> {
    /// The final answer parsed as JSON. Tolerates a surrounding Markdown
    /// code fence.
    pub fn json(&self) -> Option<Value> {
        let text = self.text.trim();
        if let Ok(v) = serde_json::from_str(text) {
            return Some(v);
        }
        let inner = text
            .strip_prefix("```json")
            .or_else(|| text.strip_prefix("```"))?
            .strip_suffix("```")?;
        serde_json::from_str(inner.trim()).ok()
    }
}

/// Drives one conversation.
///
/// ```ignore
/// let executor = ToolExecutor::new(&tools, config.executor.clone());
/// let handler = LoggingHandler;
/// let result = ToolLoop::new(&provider, &executor, config)
///     .with_event_handler(&handler)
///     .run(Prompt::new("What time is it in Tokyo?"))
///     .await?;
/// ```
///
/// The provider, executor and handler are borrowed and must outlive
/// `.run()`. The conversation itself is owned by the run and never shared.
pub struct ToolLoop<'a, P: Provider> {
    provider: &'a P,
    executor: &'a ToolExecutor,
    config: LoopConfig,
    event_handler: &'a dyn EventHandler,
    cancel: CancellationToken,
}

impl<'a, P: Provider> ToolLoop<'a, P> {
    pub fn new(provider: &'a P, executor: &'a ToolExecutor, config: LoopConfig) -> Self {
        Self {
            provider,
            executor,
            config,
            event_handler: &NoopHandler,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.event_handler = handler;
        self
    }

    /// Abort the run (provider call or tool batch) when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Run a conversation from a prompt.
    pub async fn run(self, prompt: Prompt) -> Result<LoopResult<P::Turn>, Error> {
        let turns = self.provider.prompt_turns(&prompt);
        self.run_turns(turns).await
    }

    /// Run a conversation from existing turns (for example, a previous
    /// result's `turns` plus a new user turn).
    pub async fn run_turns(self, mut turns: Vec<P::Turn>) -> Result<LoopResult<P::Turn>, Error> {
        let trace_id = generate_trace_id();
        let max_rounds = self.config.max_rounds;
        info!(
            "Loop run started: trace_id={trace_id}, provider={}, model={}, tools={}",
            self.provider.kind(),
            self.config.model,
            self.executor.specs().len()
        );

        let mut usage = Usage::default();
        let mut tool_results = Vec::new();
        let mut round: u32 = 0;

        loop {
            round += 1;
            if round > max_rounds {
                self.event_handler
                    .on_event(&LoopEvent::RoundLimitReached { max_rounds });
                warn!("Round limit ({max_rounds}) exceeded: trace_id={trace_id}");
                return Err(Error::ToolRoundLimitExceeded { max_rounds });
            }
            self.event_handler
                .on_event(&LoopEvent::RoundStart { round, max_rounds });

            let reply = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                reply = self.fetch(&turns) => reply?,
            };

            if let Some(u) = reply.usage {
                usage.add(&u);
                self.event_handler.on_event(&LoopEvent::TokenUsage(u));
            }
            if !reply.round.text().is_empty() {
                self.event_handler
                    .on_event(&LoopEvent::Text(reply.round.text()));
            }

            let (text, calls) = match reply.round {
                Round::FinalAnswer { text } => {
                    self.event_handler
                        .on_event(&LoopEvent::Finished { rounds_used: round });
                    info!(
                        "Loop run finished: trace_id={trace_id}, rounds={round}, tokens={}",
                        usage.total_tokens
                    );
                    let mut result = LoopResult {
                        trace_id,
                        text,
                        usage,
                        rounds_used: round,
                        turns,
                        tool_results,
                        structured: None,
                    };
                    if self.config.response_schema.is_some() {
                        result.structured = result.json();
                        if result.structured.is_none() {
                            warn!(
                                "Final answer is not valid JSON despite a response schema [{}]",
                                result.trace_id
                            );
                        }
                    }
                    return Ok(result);
                }
                Round::ToolCallBatch { text, calls } => (text, calls),
            };

            self.event_handler.on_event(&LoopEvent::ToolCallsReceived {
                round,
                count: calls.len(),
            });
            info!("Round {round}: {} tool call(s) [{trace_id}]", calls.len());

            let results = match self.executor.execute_batch(&self.cancel, &calls).await {
                Ok(results) => results,
                Err(e) if e.source == ToolError::Cancelled && self.cancel.is_cancelled() => {
                    return Err(Error::Cancelled);
                }
                Err(e) => {
                    warn!("Tool batch aborted in round {round}: {e}");
                    return Err(e.into());
                }
            };
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            for r in &results {
                self.event_handler.on_event(&LoopEvent::ToolResult(r));
            }

            turns.push(self.provider.model_turn(&text, &calls));
            turns.extend(self.provider.tool_result_turns(&results));
            tool_results.extend(results);
        }
    }

    async fn fetch(&self, turns: &[P::Turn]) -> Result<Reply, Error> {
        let request = GenerateRequest {
            model: &self.config.model,
            tools: self.executor.specs(),
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_output_tokens,
            include_usage: true,
            response_schema: self.config.response_schema.as_ref(),
        };
        if !self.config.streaming {
            return self.provider.generate(turns, request).await;
        }
        let stream = self.provider.generate_stream(turns, request).await?;
        let reply = collect_round(stream, |delta| {
            if let Delta::Text(t) = delta {
                self.event_handler.on_event(&LoopEvent::TextDelta(t));
            }
        })
        .await?;
        debug!("Streamed round reassembled: {} call(s)", reply.round.calls().len());
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::FnEventHandler;
    use crate::provider::{ProviderKind, ScriptStep, ScriptTurn, ScriptedProvider};
    use crate::tools::executor::ExecutorConfig;
    use crate::tools::handler::{FnHandler, ToolSet};
    use crate::tools::spec::ToolSpec;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn clock_tools(calls: Arc<AtomicU32>) -> ToolSet {
        ToolSet::new().with(
            ToolSpec::new("clock", "Current time", json!({"type": "object", "properties": {}})),
            FnHandler::new(move |_c, _a| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!("12:00")) }
            }),
        )
    }

    #[tokio::test]
    async fn tool_round_then_final_answer() {
        let provider = ScriptedProvider::new(ProviderKind::OpenAi).with_steps([
            ScriptStep::tool_call("clock", json!({})).with_usage(Usage::new(10, 2)),
            ScriptStep::text("It is noon.").with_usage(Usage::new(15, 4)),
        ]);
        let runs = Arc::new(AtomicU32::new(0));
        let tools = clock_tools(runs.clone());
        let executor = ToolExecutor::new(&tools, ExecutorConfig::default());

        let result = ToolLoop::new(&provider, &executor, LoopConfig::new("m"))
            .run(Prompt::new("time?"))
            .await
            .unwrap();

        assert_eq!(result.text, "It is noon.");
        assert_eq!(result.rounds_used, 2);
        assert_eq!(result.usage, Usage::new(25, 6));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(result.tool_results.len(), 1);

        // Second request carries the model's call and the tool result.
        let second = &provider.requests()[1];
        assert_eq!(second.len(), 3);
        assert!(matches!(&second[1], ScriptTurn::Model { calls, .. } if calls[0].id == "clock_0"));
        assert_eq!(
            second[2],
            ScriptTurn::ToolResult {
                call_id: "clock_0".into(),
                name: "clock".into(),
                content: "12:00".into()
            }
        );
    }

    #[tokio::test]
    async fn round_limit_fails_at_max_plus_one() {
        let provider = ScriptedProvider::new(ProviderKind::Gemini)
            .with_fallback(ScriptStep::tool_call("clock", json!({})));
        let runs = Arc::new(AtomicU32::new(0));
        let tools = clock_tools(runs.clone());
        let executor = ToolExecutor::new(&tools, ExecutorConfig::default());

        let err = ToolLoop::new(&provider, &executor, LoopConfig::new("m").with_max_rounds(3))
            .run(Prompt::new("loop forever"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ToolRoundLimitExceeded { max_rounds: 3 }));
        assert_eq!(provider.call_count(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn final_answer_on_last_allowed_round_succeeds() {
        let provider = ScriptedProvider::new(ProviderKind::OpenAi).with_steps([
            ScriptStep::tool_call("clock", json!({})),
            ScriptStep::text("done"),
        ]);
        let tools = clock_tools(Arc::new(AtomicU32::new(0)));
        let executor = ToolExecutor::new(&tools, ExecutorConfig::default());
        let result = ToolLoop::new(&provider, &executor, LoopConfig::new("m").with_max_rounds(2))
            .run(Prompt::new("q"))
            .await
            .unwrap();
        assert_eq!(result.rounds_used, 2);
    }

    #[tokio::test]
    async fn batch_failure_aborts_under_stop_on_error() {
        let provider = ScriptedProvider::new(ProviderKind::OpenAi)
            .with_steps([ScriptStep::tool_call("missing", json!({})), ScriptStep::text("x")]);
        let executor = ToolExecutor::new(&ToolSet::new(), ExecutorConfig::default());
        let err = ToolLoop::new(&provider, &executor, LoopConfig::new("m"))
            .run(Prompt::new("q"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Batch(ref b) if b.tool == "missing"));
    }

    #[tokio::test]
    async fn errors_reach_the_model_without_stop_on_error() {
        let provider = ScriptedProvider::new(ProviderKind::OpenAi)
            .with_steps([ScriptStep::tool_call("missing", json!({})), ScriptStep::text("sorry")]);
        let executor = ToolExecutor::new(
            &ToolSet::new(),
            ExecutorConfig::default().with_stop_on_error(false),
        );
        let result = ToolLoop::new(&provider, &executor, LoopConfig::new("m"))
            .run(Prompt::new("q"))
            .await
            .unwrap();
        assert_eq!(result.text, "sorry");
        let last = provider.requests()[1].last().cloned().unwrap();
        assert!(
            matches!(last, ScriptTurn::ToolResult { content, .. } if content.starts_with("Error: unknown tool"))
        );
    }

    #[tokio::test]
    async fn streaming_rounds_emit_text_deltas() {
        let provider = ScriptedProvider::new(ProviderKind::OpenAi)
            .with_chunk_size(3)
            .with_steps([
                ScriptStep::tool_call("clock", json!({"tz": "UTC"})),
                ScriptStep::text("It is noon."),
            ]);
        let tools = clock_tools(Arc::new(AtomicU32::new(0)));
        let executor = ToolExecutor::new(&tools, ExecutorConfig::default());
        let deltas = Arc::new(Mutex::new(String::new()));
        let sink = deltas.clone();
        let handler = FnEventHandler::new(move |e| {
            if let LoopEvent::TextDelta(t) = e {
                sink.lock().unwrap().push_str(t);
            }
        });

        let result = ToolLoop::new(&provider, &executor, LoopConfig::new("m").with_streaming(true))
            .with_event_handler(&handler)
            .run(Prompt::new("time?"))
            .await
            .unwrap();

        assert_eq!(result.text, "It is noon.");
        assert_eq!(*deltas.lock().unwrap(), "It is noon.");
        assert_eq!(result.tool_results[0].call_id, "clock_0");
    }

    #[tokio::test]
    async fn transport_errors_pass_through() {
        let provider =
            ScriptedProvider::new(ProviderKind::Gemini).with_step(ScriptStep::Fail("HTTP 500".into()));
        let executor = ToolExecutor::new(&ToolSet::new(), ExecutorConfig::default());
        let err = ToolLoop::new(&provider, &executor, LoopConfig::new("m"))
            .run(Prompt::new("q"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(ref t) if t.message == "HTTP 500"));
    }

    #[tokio::test]
    async fn streamed_round_interrupted_by_provider_error() {
        let provider = ScriptedProvider::new(ProviderKind::OpenAi).with_steps([
            ScriptStep::tool_call("clock", json!({})),
            ScriptStep::Interrupted {
                text: "It is".into(),
                message: "API error: overloaded".into(),
            },
        ]);
        let tools = clock_tools(Arc::new(AtomicU32::new(0)));
        let executor = ToolExecutor::new(&tools, ExecutorConfig::default());
        let err = ToolLoop::new(&provider, &executor, LoopConfig::new("m").with_streaming(true))
            .run(Prompt::new("time?"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(ref t) if t.message == "API error: overloaded"));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn response_schema_reaches_provider_and_parses_answer() {
        let schema = json!({
            "type": "object",
            "properties": {"time": {"type": "string"}},
            "required": ["time"]
        });
        let provider = ScriptedProvider::new(ProviderKind::Gemini).with_steps([
            ScriptStep::tool_call("clock", json!({})),
            ScriptStep::text("{\"time\": \"12:00\"}"),
        ]);
        let tools = clock_tools(Arc::new(AtomicU32::new(0)));
        let executor = ToolExecutor::new(&tools, ExecutorConfig::default());
        let config = LoopConfig::new("m").with_response_schema(schema.clone());

        let result = ToolLoop::new(&provider, &executor, config)
            .run(Prompt::new("time?"))
            .await
            .unwrap();

        assert_eq!(result.structured, Some(json!({"time": "12:00"})));
        assert_eq!(provider.response_schemas(), vec![Some(schema.clone()), Some(schema)]);
    }

    #[tokio::test]
    async fn unstructured_runs_leave_structured_empty() {
        let provider =
            ScriptedProvider::new(ProviderKind::OpenAi).with_step(ScriptStep::text("{\"a\": 1}"));
        let executor = ToolExecutor::new(&ToolSet::new(), ExecutorConfig::default());
        let result = ToolLoop::new(&provider, &executor, LoopConfig::new("m"))
            .run(Prompt::new("q"))
            .await
            .unwrap();
        assert!(result.structured.is_none());
        assert_eq!(provider.response_schemas(), vec![None]);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let provider = ScriptedProvider::new(ProviderKind::OpenAi).with_step(ScriptStep::text("x"));
        let executor = ToolExecutor::new(&ToolSet::new(), ExecutorConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ToolLoop::new(&provider, &executor, LoopConfig::new("m"))
            .with_cancellation(cancel)
            .run(Prompt::new("q"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn json_helper_accepts_fenced_output() {
        let mut result = LoopResult::<ScriptTurn> {
            trace_id: String::new(),
            text: "```json\n{\"ok\": true}\n```".into(),
            usage: Usage::default(),
            rounds_used: 1,
            turns: vec![],
            tool_results: vec![],
            structured: None,
        };
        assert_eq!(result.json(), Some(json!({"ok": true})));
        result.text = "not json".into();
        assert_eq!(result.json(), None);
    }
}
