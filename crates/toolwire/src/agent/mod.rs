//! Conversation drivers built on the tool executor and a [`Provider`](crate::provider::Provider).
//!
//! - [`tool_loop::ToolLoop`] runs a conversation to completion and returns a
//!   [`LoopResult`]. Start here.
//! - [`stream::ToolStream`] runs the same rounds in a background task and
//!   reports progress as [`StreamEvent`]s on a bounded channel, optionally
//!   pausing for caller-supplied tool results.
//! - [`config`] holds [`LoopConfig`] and [`StreamOptions`].
//! - [`events`] defines the [`EventHandler`] hooks the round loop fires.

pub mod config;
pub mod events;
pub mod stream;
pub mod tool_loop;

pub use config::{LoopConfig, StreamOptions, ToolExecutionMode};
pub use events::{
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, LoopEvent, NoopHandler,
};
pub use stream::{StreamEvent, StreamEventKind, StreamHandle, ToolResultSubmitter, ToolStream};
pub use tool_loop::{LoopResult, ToolLoop};
