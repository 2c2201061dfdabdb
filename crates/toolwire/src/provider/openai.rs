//! OpenAI-style chat completions.
//!
//! Tool calls come back on the assistant message with a string of JSON
//! arguments. When streamed, each call arrives as a series of fragments
//! keyed by `index`, which [`RoundBuilder`](super::RoundBuilder)
//! reassembles. Tool results go back as one `tool` message per call.

use super::sse::delta_stream;
use super::{
    BoxFuture, Delta, DeltaStream, FinishReason, GenerateRequest, Provider, ProviderKind, Reply,
    Round, fallback_call_id,
};
use crate::tools::executor::{ToolCallRequest, ToolCallResult};
use crate::{Error, Prompt, TransportError, Usage};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

// ── Wire types ─────────────────────────────────────────────────────

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: WireFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireError {
    message: String,
}

#[derive(Deserialize, Debug, Clone, Copy)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct StreamToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async client for an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("toolwire/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| TransportError::new(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
        })
    }

    /// Point at a compatible server (proxy, local model, test double).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, Error> {
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(TransportError::from)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::http(status.as_u16(), text).into());
        }
        Ok(resp)
    }

    async fn chat(&self, messages: &[ChatMessage], request: GenerateRequest<'_>) -> Result<Reply, Error> {
        debug!(
            "LLM request: model={}, messages={}, tools={}",
            request.model,
            messages.len(),
            request.tools.len()
        );
        let body = request_body(messages, &request, false);
        let start = Instant::now();
        let resp = self.post(&body).await?;
        let text = resp.text().await.map_err(TransportError::from)?;
        debug!(
            "LLM response in {:.1}s ({} bytes)",
            start.elapsed().as_secs_f64(),
            text.len()
        );
        parse_response(&text)
    }
}

impl Provider for OpenAiProvider {
    type Turn = ChatMessage;

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn prompt_turns(&self, prompt: &Prompt) -> Vec<ChatMessage> {
        let mut turns = Vec::with_capacity(2);
        if let Some(system) = &prompt.system {
            turns.push(ChatMessage::system(system.clone()));
        }
        turns.push(ChatMessage::user(prompt.input.clone()));
        turns
    }

    fn generate<'a>(
        &'a self,
        turns: &'a [ChatMessage],
        request: GenerateRequest<'a>,
    ) -> BoxFuture<'a, Result<Reply, Error>> {
        Box::pin(self.chat(turns, request))
    }

    fn generate_stream<'a>(
        &'a self,
        turns: &'a [ChatMessage],
        request: GenerateRequest<'a>,
    ) -> BoxFuture<'a, Result<DeltaStream, Error>> {
        Box::pin(async move {
            debug!(
                "Sending streaming chat request: model={}, messages={}",
                request.model,
                turns.len()
            );
            let body = request_body(turns, &request, true);
            let resp = self.post(&body).await?;
            Ok(delta_stream(resp, parse_stream_chunk))
        })
    }

    fn model_turn(&self, text: &str, calls: &[ToolCallRequest]) -> ChatMessage {
        ChatMessage {
            role: "assistant".to_string(),
            content: (!text.is_empty()).then(|| text.to_string()),
            tool_calls: Some(
                calls
                    .iter()
                    .map(|c| WireToolCall {
                        id: c.id.clone(),
                        kind: function_type(),
                        function: WireFunction {
                            name: c.name.clone(),
                            arguments: c.raw_arguments.clone(),
                        },
                    })
                    .collect(),
            ),
            tool_call_id: None,
        }
    }

    fn tool_result_turns(&self, results: &[ToolCallResult]) -> Vec<ChatMessage> {
        results
            .iter()
            .map(|r| ChatMessage {
                role: "tool".to_string(),
                content: Some(r.content_string()),
                tool_calls: None,
                tool_call_id: Some(r.call_id.clone()),
            })
            .collect()
    }
}

// ── Encoding and decoding ──────────────────────────────────────────

fn request_body(messages: &[ChatMessage], request: &GenerateRequest<'_>, stream: bool) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(max) = request.max_output_tokens {
        body["max_tokens"] = json!(max);
    }
    if let Some(schema) = request.response_schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": { "name": "response", "schema": schema },
        });
    }
    if stream {
        body["stream"] = json!(true);
        if request.include_usage {
            body["stream_options"] = json!({ "include_usage": true });
        }
    }
    body
}

fn parse_response(text: &str) -> Result<Reply, Error> {
    let parsed: ChatResponse = serde_json::from_str(text)
        .map_err(|e| Error::InvalidResponse(format!("failed to parse response: {e}")))?;
    if let Some(err) = parsed.error {
        return Err(TransportError::new(format!("API error: {}", err.message)).into());
    }
    let usage = parsed.usage.map(Usage::from);
    if let Some(u) = &usage {
        debug!(
            "Token usage: prompt={}, completion={}, total={}",
            u.prompt_tokens, u.completion_tokens, u.total_tokens
        );
    }

    let Some(choice) = parsed.choices.into_iter().next() else {
        debug!("LLM output: empty (no choices)");
        return Ok(Reply {
            round: Round::FinalAnswer {
                text: String::new(),
            },
            usage,
        });
    };
    trace!("finish_reason: {:?}", choice.finish_reason);

    let calls: Vec<ToolCallRequest> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, tc)| {
            let id = if tc.id.is_empty() {
                fallback_call_id(&tc.function.name, i)
            } else {
                tc.id
            };
            ToolCallRequest::from_raw(id, tc.function.name, &tc.function.arguments)
        })
        .collect();
    let text = choice.message.content.unwrap_or_default();
    debug!("LLM output: {} chars text, {} tool call(s)", text.len(), calls.len());

    Ok(Reply {
        round: Round::from_parts(text, calls),
        usage,
    })
}

/// Decode one SSE payload. An `error` payload or undecodable JSON ends the
/// stream with an error.
fn parse_stream_chunk(data: &str) -> Result<Vec<Delta>, Error> {
    let chunk = serde_json::from_str::<StreamChunk>(data).map_err(|e| {
        warn!("Failed to parse SSE chunk: {e} (data: {data})");
        Error::InvalidResponse(format!("failed to parse stream chunk: {e}"))
    })?;
    if let Some(err) = chunk.error {
        warn!("Stream reported error: {}", err.message);
        return Err(TransportError::new(format!("API error: {}", err.message)).into());
    }

    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content
                && !content.is_empty()
            {
                deltas.push(Delta::Text(content));
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                deltas.push(Delta::ToolCallFragment {
                    index: tc.index.unwrap_or(0),
                    id: tc.id,
                    name,
                    arguments,
                });
            }
        }
        if let Some(reason) = choice.finish_reason {
            deltas.push(Delta::Finish {
                reason: FinishReason::from_wire(&reason),
            });
        }
    }
    if let Some(usage) = chunk.usage {
        deltas.push(Delta::Usage(usage.into()));
    }
    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolError;
    use crate::provider::RoundBuilder;
    use crate::tools::spec::ToolSpec;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new("sk-test").unwrap()
    }

    #[test]
    fn prompt_turns_include_system_when_set() {
        let p = provider();
        let turns = p.prompt_turns(&Prompt::new("hi").with_system("be terse"));
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "system");
        assert_eq!(turns[1], ChatMessage::user("hi"));
        assert_eq!(p.prompt_turns(&Prompt::new("hi")).len(), 1);
    }

    #[test]
    fn request_body_shape() {
        let tools = vec![ToolSpec::new("clock", "Current time", json!({"type": "object"}))];
        let mut req = GenerateRequest::new("gpt-test", &tools);
        req.temperature = Some(0.5);
        req.max_output_tokens = Some(64);
        let body = request_body(&[ChatMessage::user("hi")], &req, true);

        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["tools"][0]["function"]["name"], "clock");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body["messages"][0].get("tool_calls").is_none());

        let body = request_body(&[], &GenerateRequest::new("m", &[]), false);
        assert!(body.get("tools").is_none());
        assert!(body.get("stream").is_none());
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn response_schema_becomes_json_schema_format() {
        let schema = json!({"type": "object", "properties": {"ok": {"type": "boolean"}}});
        let mut req = GenerateRequest::new("m", &[]);
        req.response_schema = Some(&schema);
        let body = request_body(&[ChatMessage::user("hi")], &req, false);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "response");
        assert_eq!(body["response_format"]["json_schema"]["schema"], schema);
    }

    #[test]
    fn parses_tool_call_response() {
        let reply = parse_response(
            r#"{
              "choices": [{
                "message": {"role": "assistant", "content": null, "tool_calls": [
                  {"id": "call_1", "type": "function", "function": {"name": "clock", "arguments": "{\"tz\":\"UTC\"}"}},
                  {"type": "function", "function": {"name": "clock", "arguments": ""}}
                ]},
                "finish_reason": "tool_calls"
              }],
              "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
            }"#,
        )
        .unwrap();

        assert_eq!(reply.usage, Some(Usage::new(12, 3)));
        let calls = reply.round.calls();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].arguments["tz"], "UTC");
        assert_eq!(calls[1].id, "clock_1");
        assert!(calls[1].arguments.is_empty());
    }

    #[test]
    fn parses_final_answer_and_api_errors() {
        let reply = parse_response(
            r#"{"choices": [{"message": {"role": "assistant", "content": "42"}, "finish_reason": "stop"}]}"#,
        )
        .unwrap();
        assert_eq!(reply.round, Round::FinalAnswer { text: "42".into() });

        let err = parse_response(r#"{"error": {"message": "bad key"}}"#).unwrap_err();
        assert!(matches!(err, Error::Transport(ref t) if t.message.contains("bad key")));
        assert!(matches!(parse_response("not json"), Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn stream_chunks_reassemble_into_calls() {
        let chunks = [
            r#"{"choices":[{"delta":{"role":"assistant","content":"Let me check. "}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"clock","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"tz\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"UTC\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":4,"total_tokens":13}}"#,
        ];
        let mut b = RoundBuilder::new();
        for c in chunks {
            for d in parse_stream_chunk(c).unwrap() {
                b.push(&d);
            }
        }
        assert_eq!(b.finish_reason(), Some(&FinishReason::ToolCalls));
        let reply = b.finish();
        assert_eq!(reply.usage, Some(Usage::new(9, 4)));
        assert_eq!(reply.round.text(), "Let me check. ");
        let calls = reply.round.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["tz"], "UTC");
    }

    #[test]
    fn stream_error_payload_is_an_error() {
        let err = parse_stream_chunk(r#"{"error":{"message":"rate limited","type":"requests"}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Transport(ref t) if t.message.contains("rate limited")));
        assert!(matches!(
            parse_stream_chunk("garbage"),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn tool_results_become_tool_messages() {
        let p = provider();
        let results = vec![
            ToolCallResult {
                call_id: "call_a".into(),
                name: "clock".into(),
                outcome: Ok(json!("12:00")),
                cached: false,
            },
            ToolCallResult {
                call_id: "call_b".into(),
                name: "clock".into(),
                outcome: Err(ToolError::failed("no tz")),
                cached: false,
            },
        ];
        let turns = p.tool_result_turns(&results);
        assert_eq!(turns[0].role, "tool");
        assert_eq!(turns[0].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(turns[0].content.as_deref(), Some("12:00"));
        assert_eq!(turns[1].content.as_deref(), Some("Error: no tz"));

        let call = ToolCallRequest::from_raw("call_a", "clock", r#"{"tz":"UTC"}"#);
        let model = p.model_turn("", std::slice::from_ref(&call));
        assert_eq!(model.role, "assistant");
        assert!(model.content.is_none());
        let wire = model.tool_calls.unwrap();
        assert_eq!(wire[0].function.arguments, r#"{"tz":"UTC"}"#);
    }
}
