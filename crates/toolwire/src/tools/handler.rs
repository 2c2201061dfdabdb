//! Tool handlers and the [`ToolSet`] registry.
//!
//! A [`ToolHandler`] is an async function from (cancellation token, argument
//! map) to a JSON result. The caller owns the handlers; the engine only
//! holds shared references for the lifetime of a conversation. A
//! [`ToolSet`] pairs each handler with the [`ToolSpec`] the model sees.

use super::spec::ToolSpec;
use crate::{Arguments, ToolError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Boxed future returned by [`ToolHandler::call`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// An async tool implementation.
///
/// Handlers should watch `cancel` in long-running work and return
/// [`ToolError::Cancelled`] when it fires. The boxed future keeps the trait
/// dyn-compatible.
///
/// # Example
///
/// ```ignore
/// struct Clock;
///
/// impl ToolHandler for Clock {
///     fn call(&self, _cancel: CancellationToken, _args: Arguments) -> HandlerFuture<'_> {
///         Box::pin(async { Ok(serde_json::json!(chrono::Utc::now().to_rfc3339())) })
///     }
/// }
/// ```
pub trait ToolHandler: Send + Sync {
    fn call(&self, cancel: CancellationToken, arguments: Arguments) -> HandlerFuture<'_>;
}

/// Type-erased async closure behind [`FnHandler`].
type ErasedHandler = Box<
    dyn Fn(CancellationToken, Arguments) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// A closure-based handler.
///
/// [`FnHandler::new`] takes the raw argument map; [`FnHandler::typed`]
/// deserializes it into a struct first and serializes the return value.
pub struct FnHandler {
    handler: ErasedHandler,
}

impl FnHandler {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(CancellationToken, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |cancel, args| Box::pin(handler(cancel, args))),
        }
    }

    /// Wrap a handler taking typed arguments. Arguments that do not
    /// deserialize into `A` fail with [`ToolError::InvalidArguments`] naming
    /// `tool`.
    pub fn typed<A, R, F, Fut>(tool: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CancellationToken, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ToolError>> + Send + 'static,
    {
        let tool = tool.into();
        let erased = move |cancel: CancellationToken,
                           raw: Arguments|
              -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>> {
            let args: A = match serde_json::from_value(Value::Object(raw)) {
                Ok(a) => a,
                Err(e) => {
                    let err = ToolError::InvalidArguments {
                        tool: tool.clone(),
                        message: e.to_string(),
                    };
                    return Box::pin(async move { Err(err) });
                }
            };
            let fut = handler(cancel, args);
            Box::pin(async move {
                let out = fut.await?;
                serde_json::to_value(out)
                    .map_err(|e| ToolError::failed(format!("failed to serialize result: {e}")))
            })
        };
        Self {
            handler: Box::new(erased),
        }
    }
}

impl ToolHandler for FnHandler {
    fn call(&self, cancel: CancellationToken, arguments: Arguments) -> HandlerFuture<'_> {
        (self.handler)(cancel, arguments)
    }
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

struct ToolEntry {
    spec: ToolSpec,
    handler: Option<Arc<dyn ToolHandler>>,
}

/// Specs and handlers for one conversation, keyed by unique tool name.
///
/// Specs are reported in registration order. A spec may be declared without
/// a handler (the model can see it, but calling it fails with
/// [`ToolError::NoHandler`]); this is how pause-mode streaming tools are
/// usually declared.
///
/// ```ignore
/// let tools = ToolSet::new()
///     .with(ToolSpec::new("now", "Current time", Schema::object().to_value()), Clock)
///     .with_if(allow_writes, write_spec(), WriteRecord::new(db))
///     .with_spec(approve_spec());
/// ```
#[derive(Default)]
pub struct ToolSet {
    entries: Vec<ToolEntry>,
    index: HashMap<String, usize>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field(
                "tools",
                &self.entries.iter().map(|e| &e.spec.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec and its handler. Replaces any tool with the same name.
    pub fn register(&mut self, spec: ToolSpec, handler: impl ToolHandler + 'static) {
        self.insert(spec, Some(Arc::new(handler)));
    }

    /// Register a spec with an already shared handler.
    pub fn register_shared(&mut self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) {
        self.insert(spec, Some(handler));
    }

    /// Declare a spec with no handler.
    pub fn declare(&mut self, spec: ToolSpec) {
        self.insert(spec, None);
    }

    fn insert(&mut self, spec: ToolSpec, handler: Option<Arc<dyn ToolHandler>>) {
        let entry = ToolEntry { spec, handler };
        match self.index.get(&entry.spec.name) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(entry.spec.name.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, spec: ToolSpec, handler: impl ToolHandler + 'static) -> Self {
        self.register(spec, handler);
        self
    }

    /// Conditionally register a tool (builder pattern).
    pub fn with_if(self, condition: bool, spec: ToolSpec, handler: impl ToolHandler + 'static) -> Self {
        if condition { self.with(spec, handler) } else { self }
    }

    /// Declare a handler-less spec (builder pattern).
    pub fn with_spec(mut self, spec: ToolSpec) -> Self {
        self.declare(spec);
        self
    }

    /// Register a typed closure tool whose parameter schema is derived from
    /// `A` via `schemars`.
    pub fn with_fn<A, R, F, Fut>(self, name: &str, description: &str, handler: F) -> Self
    where
        A: DeserializeOwned + schemars::JsonSchema + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CancellationToken, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ToolError>> + Send + 'static,
    {
        let spec = ToolSpec::builder(name)
            .description(description)
            .parameters_for::<A>()
            .build();
        self.with(spec, FnHandler::typed(name, handler))
    }

    /// All specs in registration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.entries.iter().map(|e| e.spec.clone()).collect()
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.index.get(name).map(|&i| &self.entries[i].spec)
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.index
            .get(name)
            .and_then(|&i| self.entries[i].handler.clone())
    }

    /// `(name, handler)` pairs for every tool that has a handler.
    pub fn handlers(&self) -> impl Iterator<Item = (&str, &Arc<dyn ToolHandler>)> {
        self.entries
            .iter()
            .filter_map(|e| e.handler.as_ref().map(|h| (e.spec.name.as_str(), h)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &Arguments) {
    let rendered = Value::Object(arguments.clone()).to_string();
    let args_preview: String = rendered.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if rendered.len() > 120 { "..." } else { "" }
    );
    debug!("[tool] {name} full args ({} bytes)", rendered.len());
    trace!("[tool] {name} arguments: {rendered}");
}
