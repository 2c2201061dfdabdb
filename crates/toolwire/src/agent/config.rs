//! Configuration for the round loop and streaming sessions.
//!
//! Both are plain structs with `Default` and chained `with_*` builders:
//!
//! ```ignore
//! let config = LoopConfig::new("gpt-4o-mini")
//!     .with_max_rounds(8)
//!     .with_streaming(true)
//!     .with_executor(ExecutorConfig::default().with_parallel(true));
//!
//! let options = StreamOptions::default()
//!     .with_tool_execution_mode(ToolExecutionMode::Pause);
//! ```

use crate::tools::executor::ExecutorConfig;
use schemars::JsonSchema;
use serde_json::Value;
use std::time::Duration;

/// Default cap on rounds per conversation.
pub const DEFAULT_MAX_ROUNDS: u32 = 5;

/// Default event channel capacity for streaming sessions.
pub const DEFAULT_STREAM_BUFFER: usize = 100;

/// Configuration for one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    /// Model identifier passed to the provider.
    pub model: String,
    /// Rounds allowed before [`Error::ToolRoundLimitExceeded`](crate::Error::ToolRoundLimitExceeded).
    pub max_rounds: u32,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// Fetch each round of [`ToolLoop::run`](super::ToolLoop::run) through
    /// the provider's streaming endpoint.
    pub streaming: bool,
    /// Settings for the executor built from this config.
    pub executor: ExecutorConfig,
    /// Ask the provider for a JSON final answer matching this schema.
    pub response_schema: Option<Value>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            temperature: None,
            max_output_tokens: None,
            streaming: false,
            executor: ExecutorConfig::default(),
            response_schema: None,
        }
    }
}

impl LoopConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Request structured output. An object schema is expected; the final
    /// answer is then parsed into [`LoopResult::structured`](super::LoopResult::structured).
    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    /// Request structured output shaped like `T`.
    pub fn with_response_schema_for<T: JsonSchema>(self) -> Self {
        self.with_response_schema(crate::json_schema_for::<T>())
    }
}

/// How a streaming session handles tool calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolExecutionMode {
    /// Run calls one at a time; each request event is followed by its
    /// result event.
    #[default]
    Auto,
    /// Emit every request, run the batch concurrently, then emit results in
    /// call order.
    Parallel,
    /// Emit each request and wait for the caller to submit its result.
    Pause,
}

/// Streaming session options.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    /// Event channel capacity. A full channel stalls the session.
    pub buffer_size: usize,
    /// Ask the provider for usage and forward it as events.
    pub include_usage: bool,
    /// Minimum spacing between chunk events. Zero disables pacing.
    pub flush_interval: Duration,
    /// Run (or pause for) tool calls. When off, requests are emitted and the
    /// session ends.
    pub enable_tool_execution: bool,
    pub tool_execution_mode: ToolExecutionMode,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_STREAM_BUFFER,
            include_usage: true,
            flush_interval: Duration::ZERO,
            enable_tool_execution: true,
            tool_execution_mode: ToolExecutionMode::Auto,
        }
    }
}

impl StreamOptions {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_usage(mut self, include: bool) -> Self {
        self.include_usage = include;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_tool_execution(mut self, enabled: bool) -> Self {
        self.enable_tool_execution = enabled;
        self
    }

    pub fn with_tool_execution_mode(mut self, mode: ToolExecutionMode) -> Self {
        self.tool_execution_mode = mode;
        self
    }
}
