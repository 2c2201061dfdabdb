//! Gemini `generateContent`.
//!
//! Function calls arrive whole, as `functionCall` parts with structured
//! `args`, both in one-shot and streamed responses. Results go back in a
//! single `user` turn of `functionResponse` parts. The API has no call ids,
//! so ids are synthesized as `"{name}_{index}"`.

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

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// Role used for the system instruction while it sits in the turn list. It
// is lifted into `systemInstruction` when the request is built.
const SYSTEM_ROLE: &str = "system";

// ── Wire types ─────────────────────────────────────────────────────

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<WireError>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireError {
    message: String,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl From<UsageMetadata> for Usage {
    fn from(u: UsageMetadata) -> Self {
        Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Async client for the Gemini API.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("toolwire/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| TransportError::new(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: GEMINI_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn post(&self, url: String, body: &Value) -> Result<reqwest::Response, Error> {
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
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

    async fn generate_content(
        &self,
        turns: &[Content],
        request: GenerateRequest<'_>,
    ) -> Result<Reply, Error> {
        debug!(
            "LLM request: model={}, contents={}, tools={}",
            request.model,
            turns.len(),
            request.tools.len()
        );
        let url = format!("{}/models/{}:generateContent", self.base_url, request.model);
        let start = Instant::now();
        let resp = self.post(url, &request_body(turns, &request)).await?;
        let text = resp.text().await.map_err(TransportError::from)?;
        debug!(
            "LLM response in {:.1}s ({} bytes)",
            start.elapsed().as_secs_f64(),
            text.len()
        );
        parse_response(&text)
    }
}

impl Provider for GeminiProvider {
    type Turn = Content;

    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn prompt_turns(&self, prompt: &Prompt) -> Vec<Content> {
        let mut turns = Vec::with_capacity(2);
        if let Some(system) = &prompt.system {
            turns.push(Content {
                role: SYSTEM_ROLE.to_string(),
                parts: vec![Part::text(system.clone())],
            });
        }
        turns.push(Content {
            role: "user".to_string(),
            parts: vec![Part::text(prompt.input.clone())],
        });
        turns
    }

    fn generate<'a>(
        &'a self,
        turns: &'a [Content],
        request: GenerateRequest<'a>,
    ) -> BoxFuture<'a, Result<Reply, Error>> {
        Box::pin(self.generate_content(turns, request))
    }

    fn generate_stream<'a>(
        &'a self,
        turns: &'a [Content],
        request: GenerateRequest<'a>,
    ) -> BoxFuture<'a, Result<DeltaStream, Error>> {
        Box::pin(async move {
            debug!(
                "Sending streaming request: model={}, contents={}",
                request.model,
                turns.len()
            );
            let url = format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url, request.model
            );
            let resp = self.post(url, &request_body(turns, &request)).await?;
            let mut next_index = 0;
            Ok(delta_stream(resp, move |data| {
                parse_stream_chunk(data, &mut next_index)
            }))
        })
    }

    fn model_turn(&self, text: &str, calls: &[ToolCallRequest]) -> Content {
        let mut parts = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
        parts.extend(calls.iter().map(|c| Part {
            function_call: Some(FunctionCall {
                name: c.name.clone(),
                args: Value::Object(c.arguments.clone()),
            }),
            ..Default::default()
        }));
        Content {
            role: "model".to_string(),
            parts,
        }
    }

    fn tool_result_turns(&self, results: &[ToolCallResult]) -> Vec<Content> {
        if results.is_empty() {
            return Vec::new();
        }
        vec![Content {
            role: "user".to_string(),
            parts: results
                .iter()
                .map(|r| Part {
                    function_response: Some(FunctionResponse {
                        name: r.name.clone(),
                        response: r.response_object(),
                    }),
                    ..Default::default()
                })
                .collect(),
        }]
    }
}

// ── Encoding and decoding ──────────────────────────────────────────

fn request_body(turns: &[Content], request: &GenerateRequest<'_>) -> Value {
    let (system, contents): (Vec<&Content>, Vec<&Content>) =
        turns.iter().partition(|c| c.role == SYSTEM_ROLE);

    let mut body = json!({ "contents": contents });
    let system_parts: Vec<&Part> = system.iter().flat_map(|c| &c.parts).collect();
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({ "parts": system_parts });
    }
    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": sanitize_schema(&t.parameters),
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
        body["toolConfig"] = json!({ "functionCallingConfig": { "mode": "AUTO" } });
    }

    let mut generation = serde_json::Map::new();
    if let Some(t) = request.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(max) = request.max_output_tokens {
        generation.insert("maxOutputTokens".into(), json!(max));
    }
    if let Some(schema) = request.response_schema {
        generation.insert("responseMimeType".into(), json!("application/json"));
        generation.insert("responseSchema".into(), sanitize_schema(schema));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

/// Drop JSON Schema keywords the function-declaration schema rejects.
/// Keys of `properties` maps are parameter names, not keywords, and are
/// always kept.
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !matches!(k.as_str(), "$schema" | "additionalProperties" | "title"))
                .map(|(k, v)| {
                    let v = match k.as_str() {
                        "properties" | "$defs" | "definitions" => sanitize_named(v),
                        _ => sanitize_schema(v),
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

/// Sanitize each schema in a name -> schema map, keeping every name.
fn sanitize_named(map: &Value) -> Value {
    match map {
        Value::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(name, schema)| (name.clone(), sanitize_schema(schema)))
                .collect(),
        ),
        other => sanitize_schema(other),
    }
}

/// Split a candidate's parts into text and calls. `next_index` numbers
/// calls across a whole streamed response.
fn split_parts(parts: Vec<Part>, next_index: &mut usize) -> (String, Vec<ToolCallRequest>) {
    let mut text = String::new();
    let mut calls = Vec::new();
    for part in parts {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(fc) = part.function_call {
            let id = fallback_call_id(&fc.name, *next_index);
            *next_index += 1;
            let call = match fc.args {
                Value::Object(map) => ToolCallRequest::new(id, fc.name, map),
                Value::Null => ToolCallRequest::new(id, fc.name, serde_json::Map::new()),
                other => ToolCallRequest::from_raw(id, fc.name, &other.to_string()),
            };
            calls.push(call);
        }
    }
    (text, calls)
}

fn parse_response(text: &str) -> Result<Reply, Error> {
    let parsed: GenerateResponse = serde_json::from_str(text)
        .map_err(|e| Error::InvalidResponse(format!("failed to parse response: {e}")))?;
    if let Some(err) = parsed.error {
        return Err(TransportError::new(format!("API error: {}", err.message)).into());
    }
    let usage = parsed.usage_metadata.map(Usage::from);
    let candidate = parsed.candidates.into_iter().next();
    if let Some(reason) = candidate.as_ref().and_then(|c| c.finish_reason.as_deref()) {
        trace!("finishReason: {reason}");
    }
    let parts = candidate
        .and_then(|c| c.content)
        .map(|c| c.parts)
        .unwrap_or_default();
    let (text, calls) = split_parts(parts, &mut 0);
    debug!("LLM output: {} chars text, {} tool call(s)", text.len(), calls.len());
    Ok(Reply {
        round: Round::from_parts(text, calls),
        usage,
    })
}

/// Decode one SSE payload. An `error` payload or undecodable JSON ends the
/// stream with an error.
fn parse_stream_chunk(data: &str, next_index: &mut usize) -> Result<Vec<Delta>, Error> {
    let chunk = serde_json::from_str::<GenerateResponse>(data).map_err(|e| {
        warn!("Failed to parse SSE chunk: {e} (data: {data})");
        Error::InvalidResponse(format!("failed to parse stream chunk: {e}"))
    })?;
    if let Some(err) = chunk.error {
        warn!("Stream reported error: {}", err.message);
        return Err(TransportError::new(format!("API error: {}", err.message)).into());
    }

    let mut deltas = Vec::new();
    if let Some(candidate) = chunk.candidates.into_iter().next() {
        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        let (text, calls) = split_parts(parts, next_index);
        if !text.is_empty() {
            deltas.push(Delta::Text(text));
        }
        if !calls.is_empty() {
            deltas.push(Delta::ToolCalls(calls));
        }
        if let Some(reason) = candidate.finish_reason {
            deltas.push(Delta::Finish {
                reason: FinishReason::from_wire(&reason),
            });
        }
    }
    if let Some(usage) = chunk.usage_metadata {
        deltas.push(Delta::Usage(usage.into()));
    }
    Ok(deltas)
}
