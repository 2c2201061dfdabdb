//! Error types for tool calls and whole operations.
//!
//! Two layers:
//!
//! - [`ToolError`] describes why a single tool call failed. It is `Clone`
//!   because outcomes (including failures) are memoized in the
//!   [`ResultCache`](crate::tools::cache::ResultCache) and replayed on hits.
//! - [`Error`] is returned by batch execution, the round loop, and streaming
//!   sessions. Transport failures are wrapped opaquely in
//!   [`TransportError`]; cancellation is its own variant so callers can tell
//!   it apart from a real failure.

use crate::tools::executor::ToolCallResult;
use std::fmt;

/// JSON type names accepted in a parameter schema's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl JsonType {
    /// Parse a schema `type` keyword. Unknown keywords return `None` and are
    /// not type-checked.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    /// The schema keyword for this type.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Failure of a single tool call.
///
/// Handlers return [`ToolError::Failed`] (usually via [`ToolError::failed`]
/// or [`ToolError::with_code`]) for their own errors. The remaining variants
/// are produced by the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ToolError {
    /// No schema is registered for the tool name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// A field listed in the schema's `required` array is absent.
    #[error("tool {tool:?}: missing required parameter {parameter:?}")]
    MissingParameter { tool: String, parameter: String },

    /// An argument's runtime JSON type differs from the declared type.
    #[error("tool {tool:?}: parameter {parameter:?} should be {expected}, got {actual}")]
    TypeMismatch {
        tool: String,
        parameter: String,
        expected: JsonType,
        actual: &'static str,
    },

    /// Full JSON Schema validation (strict mode) rejected the arguments.
    #[error("tool {tool:?}: argument validation failed:\n{details}")]
    SchemaViolation { tool: String, details: String },

    /// The arguments could not be decoded (bad JSON, or a typed handler could
    /// not deserialize them).
    #[error("tool {tool:?}: invalid arguments: {message}")]
    InvalidArguments { tool: String, message: String },

    /// The name passed validation but no handler is registered for it.
    #[error("no handler registered for tool {0:?}")]
    NoHandler(String),

    /// A paused call reused the id of a call still awaiting its result.
    #[error("duplicate tool call id {0:?}")]
    DuplicateCallId(String),

    /// The call exceeded its time limit.
    #[error("tool call timed out")]
    Timeout,

    /// The call was cancelled through its cancellation token.
    #[error("tool call cancelled")]
    Cancelled,

    /// A handler-reported failure. `code` is an optional machine-readable
    /// class that retry configuration can match on.
    #[error("{message}")]
    Failed {
        code: Option<String>,
        message: String,
    },

    /// The handler failed with an error the retry policy does not retry.
    #[error("non-retryable error: {0}")]
    NonRetryable(Box<ToolError>),

    /// Every retry attempt failed.
    #[error("max retry attempts ({attempts}) exceeded: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ToolError> },
}

impl ToolError {
    /// A handler failure without a code.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            code: None,
            message: message.into(),
        }
    }

    /// A handler failure tagged with a retry-matchable code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Machine-readable class of this error.
    ///
    /// `Failed` errors report their own code (or `"failed"` when none was
    /// given); every other variant reports a fixed snake_case name.
    pub fn code(&self) -> &str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::MissingParameter { .. } => "missing_parameter",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::SchemaViolation { .. } => "schema_violation",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::NoHandler(_) => "no_handler",
            Self::DuplicateCallId(_) => "duplicate_call_id",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Failed { code, .. } => code.as_deref().unwrap_or("failed"),
            Self::NonRetryable(_) => "non_retryable",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }

    /// Whether this is a validation-class failure (the handler never ran).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownTool(_)
                | Self::MissingParameter { .. }
                | Self::TypeMismatch { .. }
                | Self::SchemaViolation { .. }
                | Self::InvalidArguments { .. }
        )
    }

    /// Timeout and cancellation are the default retryable class.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Cancelled)
    }
}

/// Opaque failure from a provider transport.
///
/// The engine never interprets these; it only propagates them.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    /// HTTP status, when the request got that far.
    pub status: Option<u16>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn http(status: u16, body: impl fmt::Display) -> Self {
        Self {
            message: format!("HTTP {status}: {body}"),
            status: Some(status),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self {
            message: format!("request failed: {e}"),
            status: e.status().map(|s| s.as_u16()),
        }
    }
}

/// A tool batch aborted under stop-on-error.
///
/// `results` holds whatever completed before the abort: in serial mode the
/// calls up to and including the failing one, in parallel mode every call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("tool {tool:?} failed: {source}")]
pub struct BatchError {
    pub tool: String,
    #[source]
    pub source: ToolError,
    pub results: Vec<ToolCallResult>,
}

/// Operation-level error for batches, round loops, and streaming sessions.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// The model kept requesting tools past the configured round limit.
    #[error("exceeded maximum tool call rounds ({max_rounds})")]
    ToolRoundLimitExceeded { max_rounds: u32 },

    /// `submit_tool_result` named a call that is not waiting (unknown, or
    /// already resolved).
    #[error("no pending tool call with id {0:?}")]
    NoPendingCall(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The provider answered with something the adapter could not decode.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// Whether this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Batch(b) => b.source == ToolError::Cancelled,
            _ => false,
        }
    }
}
