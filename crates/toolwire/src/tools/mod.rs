//! Tool definitions and execution.
//!
//! - [`spec`] / [`schema`]: what the model sees.
//! - [`handler`]: what runs, and the [`ToolSet`] registry pairing the two.
//! - [`validator`], [`cache`], [`retry`]: the per-call pipeline stages.
//! - [`executor`]: batches of calls, serial or parallel.

pub mod cache;
pub mod executor;
pub mod handler;
pub mod retry;
pub mod schema;
pub mod spec;
pub mod validator;

pub use cache::{CacheConfig, ResultCache, canonical_json};
pub use executor::{ExecutorConfig, ExecutorMetrics, ToolCallRequest, ToolCallResult, ToolExecutor};
pub use handler::{FnHandler, HandlerFuture, ToolHandler, ToolSet};
pub use retry::{RetryConfig, RetryHandler, call_with_retry};
pub use schema::Schema;
pub use spec::{ToolSpec, ToolSpecBuilder};
pub use validator::ArgumentValidator;
