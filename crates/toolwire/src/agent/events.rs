//! Events emitted by [`ToolLoop`](super::ToolLoop) and their handlers.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::Usage;
use crate::tools::executor::ToolCallResult;
use tracing::{debug, info};

/// Lifecycle events of a loop run.
#[derive(Debug)]
pub enum LoopEvent<'a> {
    /// A round is about to be sent. Rounds count from 1.
    RoundStart { round: u32, max_rounds: u32 },
    /// Incremental text (streaming rounds only).
    TextDelta(&'a str),
    /// The round's complete text, when non-empty.
    Text(&'a str),
    /// The model requested tool calls this round.
    ToolCallsReceived { round: u32, count: usize },
    /// One tool call settled.
    ToolResult(&'a ToolCallResult),
    /// Usage reported for the round.
    TokenUsage(Usage),
    /// The model produced a final answer.
    Finished { rounds_used: u32 },
    /// The model was still requesting tools when the limit was hit.
    RoundLimitReached { max_rounds: u32 },
}

/// Observer for [`LoopEvent`]s. The default ignores everything.
///
/// ```ignore
/// struct Printer;
///
/// impl EventHandler for Printer {
///     fn on_event(&self, event: &LoopEvent<'_>) {
///         if let LoopEvent::TextDelta(t) = event {
///             print!("{t}");
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &LoopEvent<'_>) {
        let _ = event;
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&LoopEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&LoopEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&LoopEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &LoopEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner handler in registration order.
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler to the chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &LoopEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events through `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &LoopEvent<'_>) {
        match event {
            LoopEvent::RoundStart { round, max_rounds } => info!("[round {round}/{max_rounds}]"),
            LoopEvent::TextDelta(_) => {}
            LoopEvent::Text(text) => {
                let preview: String = text.chars().take(200).collect();
                debug!(
                    "LLM text: {preview}{}",
                    if text.chars().count() > 200 { "..." } else { "" }
                );
            }
            LoopEvent::ToolCallsReceived { round, count } => {
                debug!("{count} tool call(s) in round {round}");
            }
            LoopEvent::ToolResult(r) => match &r.outcome {
                Ok(_) => debug!(
                    "Tool {} ({}) ok{}",
                    r.name,
                    r.call_id,
                    if r.cached { " [cached]" } else { "" }
                ),
                Err(e) => debug!("Tool {} ({}) failed: {e}", r.name, r.call_id),
            },
            LoopEvent::TokenUsage(u) => debug!(
                "Tokens: prompt={}, completion={}",
                u.prompt_tokens, u.completion_tokens
            ),
            LoopEvent::Finished { rounds_used } => {
                info!("Finished after {rounds_used} round(s)")
            }
            LoopEvent::RoundLimitReached { max_rounds } => {
                info!("Hit round limit ({max_rounds})")
            }
        }
    }
}
