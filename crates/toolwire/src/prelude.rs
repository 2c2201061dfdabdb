//! Convenience re-exports for common `toolwire` types.
//!
//! ```ignore
//! use toolwire::prelude::*;
//! ```
//!
//! Covers tool registration, execution, both conversation drivers and the
//! shipped providers. Wire-level types (deltas, round builders, provider
//! turn structs) stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Arguments, Error, Prompt, ToolError, Usage, json_schema_for};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{
    CacheConfig, ExecutorConfig, FnHandler, RetryConfig, Schema, ToolCallRequest, ToolCallResult,
    ToolExecutor, ToolHandler, ToolSet, ToolSpec,
};

// ── Providers ───────────────────────────────────────────────────────
pub use crate::provider::{
    GeminiProvider, OpenAiProvider, Provider, ProviderKind, ScriptStep, ScriptedProvider,
};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    EventHandler, LoggingHandler, LoopConfig, LoopEvent, LoopResult, StreamEvent,
    StreamEventKind, StreamHandle, StreamOptions, ToolExecutionMode, ToolLoop, ToolStream,
};

pub use tokio_util::sync::CancellationToken;
