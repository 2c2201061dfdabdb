//! The provider seam.
//!
//! A [`Provider`] owns one wire protocol. It turns a [`Prompt`] into its own
//! turn representation, sends a conversation and returns either a whole
//! [`Reply`] or a stream of [`Delta`]s, and encodes tool calls and results
//! back into turns. Everything above this module works on [`Round`]s and
//! never sees a wire format.

pub mod gemini;
pub mod openai;
pub mod round;
pub mod scripted;
mod sse;

use crate::tools::executor::{ToolCallRequest, ToolCallResult};
use crate::tools::spec::ToolSpec;
use crate::{Error, Prompt, Usage};
use futures::Stream;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use round::{RoundBuilder, collect_round};
pub use scripted::{ScriptStep, ScriptTurn, ScriptedProvider};

/// Boxed `Send` future returned by provider operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Stream of deltas for one streamed round.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<Delta, Error>> + Send>>;

/// Which wire protocol a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Chat completions; streamed tool calls arrive as indexed fragments.
    OpenAi,
    /// generateContent; tool calls arrive whole.
    Gemini,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

impl FinishReason {
    /// Map a wire value from either protocol.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "stop" | "STOP" => Self::Stop,
            "tool_calls" | "function_call" => Self::ToolCalls,
            "length" | "MAX_TOKENS" => Self::Length,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One unit of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// Incremental answer text.
    Text(String),
    /// Part of a tool call. Fragments with the same `index` concatenate;
    /// `id` and `name` usually arrive only on the first one.
    ToolCallFragment {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// Complete tool calls.
    ToolCalls(Vec<ToolCallRequest>),
    /// Token usage so far. A later report supersedes an earlier one.
    Usage(Usage),
    Finish { reason: FinishReason },
}

/// The provider-agnostic outcome of one round.
#[derive(Debug, Clone, PartialEq)]
pub enum Round {
    /// No tool calls: the conversation is done.
    FinalAnswer { text: String },
    /// The model wants tools run. `text` is any prose that came with the
    /// calls (often empty).
    ToolCallBatch {
        text: String,
        calls: Vec<ToolCallRequest>,
    },
}

impl Round {
    /// Build a round from text and calls: no calls means a final answer.
    pub fn from_parts(text: String, calls: Vec<ToolCallRequest>) -> Self {
        if calls.is_empty() {
            Self::FinalAnswer { text }
        } else {
            Self::ToolCallBatch { text, calls }
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::FinalAnswer { text } | Self::ToolCallBatch { text, .. } => text,
        }
    }

    pub fn calls(&self) -> &[ToolCallRequest] {
        match self {
            Self::FinalAnswer { .. } => &[],
            Self::ToolCallBatch { calls, .. } => calls,
        }
    }
}

/// A non-streamed response.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub round: Round,
    pub usage: Option<Usage>,
}

/// Per-round request parameters.
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub tools: &'a [ToolSpec],
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// Ask for usage on streamed responses.
    pub include_usage: bool,
    /// Constrain the final answer to JSON matching this schema.
    pub response_schema: Option<&'a serde_json::Value>,
}

impl<'a> GenerateRequest<'a> {
    pub fn new(model: &'a str, tools: &'a [ToolSpec]) -> Self {
        Self {
            model,
            tools,
            temperature: None,
            max_output_tokens: None,
            include_usage: true,
            response_schema: None,
        }
    }
}

/// A model backend.
///
/// Implementations must be cheap to share: the streaming orchestrator
/// holds one behind an `Arc` for the life of a session.
pub trait Provider: Send + Sync {
    /// One entry of this provider's conversation representation.
    type Turn: Clone + fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> ProviderKind;

    /// Opening turns for a conversation.
    fn prompt_turns(&self, prompt: &Prompt) -> Vec<Self::Turn>;

    /// Send the conversation and wait for the whole reply.
    fn generate<'a>(
        &'a self,
        turns: &'a [Self::Turn],
        request: GenerateRequest<'a>,
    ) -> BoxFuture<'a, Result<Reply, Error>>;

    /// Send the conversation and stream the reply.
    fn generate_stream<'a>(
        &'a self,
        turns: &'a [Self::Turn],
        request: GenerateRequest<'a>,
    ) -> BoxFuture<'a, Result<DeltaStream, Error>>;

    /// The model's own turn for a round that requested `calls`.
    fn model_turn(&self, text: &str, calls: &[ToolCallRequest]) -> Self::Turn;

    /// Turns carrying tool results back to the model.
    fn tool_result_turns(&self, results: &[ToolCallResult]) -> Vec<Self::Turn>;
}

/// Call id for a call the provider sent without one.
pub(crate) fn fallback_call_id(name: &str, index: usize) -> String {
    format!("{name}_{index}")
}
