//! Multi-round tool-calling engine for LLM conversations.
//!
//! `toolwire` drives conversations in which a language model may ask the
//! caller to run functions ("tools") before it produces a final answer. It
//! sits between caller-supplied tool handlers and a provider transport and
//! owns everything in the middle:
//!
//! - **Argument validation** against each tool's declared JSON schema
//!   ([`tools::validator`]).
//! - **Result caching** keyed on the tool name and canonicalized arguments,
//!   with TTL expiry and oldest-first eviction ([`tools::cache`]).
//! - **Retry** with bounded exponential backoff ([`tools::retry`]).
//! - **Batch execution**, serial or parallel, with a stop-on-error policy and
//!   per-executor metrics ([`tools::executor`]).
//! - **The round loop**: send the conversation, execute any requested tools,
//!   append the results, repeat until a final answer or the round limit
//!   ([`agent::tool_loop`]).
//! - **Streaming sessions** that turn provider deltas into one ordered event
//!   channel, executing tools inline or pausing for externally submitted
//!   results ([`agent::stream`]).
//!
//! Providers plug in through the [`Provider`](provider::Provider) trait.
//! Two wire styles ship with the crate: [`OpenAiProvider`](provider::openai::OpenAiProvider)
//! (tool calls arrive as fragments reassembled by index) and
//! [`GeminiProvider`](provider::gemini::GeminiProvider) (tool calls arrive
//! whole). [`ScriptedProvider`](provider::scripted::ScriptedProvider) replays
//! canned rounds for tests.
//!
//! # Getting started
//!
//! ```ignore
//! use toolwire::prelude::*;
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct WeatherArgs {
//!     /// City name.
//!     city: String,
//! }
//!
//! let tools = ToolSet::new().with_fn(
//!     "get_weather",
//!     "Current weather for a city",
//!     |_cancel, args: WeatherArgs| async move { Ok(serde_json::json!({"city": args.city, "temp_c": 21})) },
//! );
//!
//! let provider = OpenAiProvider::new(std::env::var("OPENAI_API_KEY")?)?;
//! let config = LoopConfig::new("gpt-4o-mini").with_max_rounds(4);
//! let executor = ToolExecutor::new(&tools, config.executor.clone());
//!
//! let result = ToolLoop::new(&provider, &executor, config)
//!     .run(Prompt::new("What's the weather in Oslo?"))
//!     .await?;
//! println!("{}", result.text);
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`tools`] | Specs, schema builder, handlers, validator, cache, retry, batch executor |
//! | [`provider`] | Provider trait, deltas and rounds, OpenAI / Gemini / scripted adapters |
//! | [`agent`] | Round loop, streaming orchestrator, configuration, loop events |
//! | [`error`] | [`ToolError`](error::ToolError), [`Error`](error::Error), transport errors |

pub mod agent;
pub mod error;
pub mod prelude;
pub mod provider;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

pub use error::{BatchError, Error, ToolError, TransportError};

// Re-export schemars for downstream crates.
pub use schemars;

/// Argument map passed to tool handlers.
pub type Arguments = serde_json::Map<String, serde_json::Value>;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use toolwire::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct GrepArgs {
///     pattern: String,
///     #[serde(default)]
///     path: Option<String>,
/// }
///
/// let schema = json_schema_for::<GrepArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"pattern".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Prompt and usage ───────────────────────────────────────────────

/// The caller's input for one conversation: optional system text plus the
/// user message. Providers turn this into their opening turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prompt {
    pub system: Option<String>,
    pub input: String,
}

impl Prompt {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            system: None,
            input: input.into(),
        }
    }

    /// Set the system instruction (builder pattern). Blank text is ignored.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        let system = system.into();
        self.system = if system.trim().is_empty() {
            None
        } else {
            Some(system)
        };
        self
    }
}

/// Token usage reported by a provider. Values add across rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Accumulate another round's usage into this total.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

// ── Trace ids ──────────────────────────────────────────────────────

/// Generate a unique id for a loop run or streaming session, used to
/// correlate log lines.
pub fn generate_trace_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("tw-{ts:x}-{count:04x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_unique() {
        let a = generate_trace_id();
        let b = generate_trace_id();
        assert!(a.starts_with("tw-"));
        assert_ne!(a, b);
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage::new(10, 5));
        total.add(&Usage::new(3, 2));
        assert_eq!(total, Usage::new(13, 7));
        assert_eq!(total.total_tokens, 20);
    }

    #[test]
    fn blank_system_prompt_is_dropped() {
        let prompt = Prompt::new("hi").with_system("   ");
        assert!(prompt.system.is_none());
        let prompt = Prompt::new("hi").with_system("be brief");
        assert_eq!(prompt.system.as_deref(), Some("be brief"));
    }
}
