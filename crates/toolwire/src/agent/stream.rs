//! Streaming sessions.
//!
//! [`ToolStream::start`] spawns one background task per session and returns
//! a [`StreamHandle`]. The task streams each round from the provider,
//! forwards text as [`StreamEventKind::Chunk`] events, reassembles tool
//! calls, runs them according to the [`ToolExecutionMode`], and opens the
//! next round with the results, until the model answers without tools.
//!
//! Every session ends with exactly one terminal event, `Done` or `Error`,
//! after which the channel closes. Cancellation stops the task at its next
//! suspension point (provider read, tool call, rendezvous wait, or a send
//! on a full channel); a final `Error(Cancelled)` is offered only if the
//! channel has room.
//!
//! In [`ToolExecutionMode::Pause`] the session registers a rendezvous for
//! each call before emitting its request, then waits for the caller to
//! resolve it with [`StreamHandle::submit_tool_result`] or
//! [`StreamHandle::submit_tool_error`].

use super::config::{LoopConfig, StreamOptions, ToolExecutionMode};
use crate::provider::{Delta, GenerateRequest, Provider, ProviderKind, Round, RoundBuilder};
use crate::tools::executor::{ToolCallRequest, ToolCallResult, ToolExecutor};
use crate::{BatchError, Error, Prompt, ToolError, Usage, generate_trace_id};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// What happened.
#[derive(Debug)]
pub enum StreamEventKind {
    /// A piece of answer text.
    Chunk(String),
    /// The model asked for a tool call.
    ToolCallRequest(ToolCallRequest),
    /// A tool call settled (executed, or resolved by the caller).
    ToolCallResult(ToolCallResult),
    /// Usage for the round that just ended.
    Usage(Usage),
    /// The session finished normally. Terminal.
    Done { model: String },
    /// The session failed. Terminal.
    Error(Error),
}

/// One event of a streaming session.
#[derive(Debug)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    pub provider: ProviderKind,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    fn new(kind: StreamEventKind, provider: ProviderKind) -> Self {
        Self {
            kind,
            provider,
            timestamp: Utc::now(),
        }
    }

    /// Whether this is the session's last event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            StreamEventKind::Done { .. } | StreamEventKind::Error(_)
        )
    }
}

// ── Rendezvous ─────────────────────────────────────────────────────

type PendingSender = oneshot::Sender<Result<Value, ToolError>>;

/// Single-use rendezvous points keyed by call id.
#[derive(Debug, Default)]
struct PendingCalls {
    waiting: Mutex<HashMap<String, PendingSender>>,
}

impl PendingCalls {
    /// Open a wait for `id`. Returns `None` if a wait for the same id is
    /// already open; the existing waiter is left untouched.
    fn register(&self, id: &str) -> Option<oneshot::Receiver<Result<Value, ToolError>>> {
        let mut waiting = self.waiting.lock().unwrap_or_else(|e| e.into_inner());
        if waiting.contains_key(id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        waiting.insert(id.to_string(), tx);
        Some(rx)
    }

    fn resolve(&self, id: &str, outcome: Result<Value, ToolError>) -> Result<(), Error> {
        let sender = self
            .waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match sender {
            Some(tx) => tx
                .send(outcome)
                .map_err(|_| Error::NoPendingCall(id.to_string())),
            None => Err(Error::NoPendingCall(id.to_string())),
        }
    }

    fn forget(&self, id: &str) {
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    fn clear(&self) {
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Resolves paused tool calls. Cheap to clone and usable from any task.
#[derive(Debug, Clone)]
pub struct ToolResultSubmitter {
    pending: Arc<PendingCalls>,
}

impl ToolResultSubmitter {
    /// Deliver a result for a paused call. Fails with
    /// [`Error::NoPendingCall`] if `id` is unknown or already resolved.
    pub fn submit_tool_result(&self, id: &str, value: Value) -> Result<(), Error> {
        self.pending.resolve(id, Ok(value))
    }

    /// Deliver a failure for a paused call.
    pub fn submit_tool_error(&self, id: &str, message: impl Into<String>) -> Result<(), Error> {
        self.pending.resolve(id, Err(ToolError::failed(message)))
    }
}

// ── Handle ─────────────────────────────────────────────────────────

/// The caller's side of a streaming session.
///
/// Also a [`Stream`] of [`StreamEvent`]s. Dropping the handle cancels the
/// session.
#[derive(Debug)]
pub struct StreamHandle {
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    submitter: ToolResultSubmitter,
}

impl StreamHandle {
    /// Next event, or `None` once the session has closed the channel.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Stop the session.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn submit_tool_result(&self, id: &str, value: Value) -> Result<(), Error> {
        self.submitter.submit_tool_result(id, value)
    }

    pub fn submit_tool_error(&self, id: &str, message: impl Into<String>) -> Result<(), Error> {
        self.submitter.submit_tool_error(id, message)
    }

    /// A submitter for resolving paused calls from another task.
    pub fn submitter(&self) -> ToolResultSubmitter {
        self.submitter.clone()
    }
}

impl Stream for StreamHandle {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Session ────────────────────────────────────────────────────────

/// Starts streaming sessions.
///
/// ```ignore
/// let provider = Arc::new(OpenAiProvider::new(key)?);
/// let executor = Arc::new(ToolExecutor::new(&tools, ExecutorConfig::default()));
/// let mut handle = ToolStream::new(provider, executor, LoopConfig::new("gpt-4o-mini"))
///     .with_options(StreamOptions::default())
///     .start(Prompt::new("Summarize the weather in three cities"));
///
/// while let Some(event) = handle.next().await {
///     if let StreamEventKind::Chunk(text) = event.kind {
///         print!("{text}");
///     }
/// }
/// ```
pub struct ToolStream<P: Provider> {
    provider: Arc<P>,
    executor: Arc<ToolExecutor>,
    config: LoopConfig,
    options: StreamOptions,
    cancel: CancellationToken,
}

impl<P: Provider + 'static> ToolStream<P> {
    pub fn new(provider: Arc<P>, executor: Arc<ToolExecutor>, config: LoopConfig) -> Self {
        Self {
            provider,
            executor,
            config,
            options: StreamOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Tie the session to an outer token: cancelling `parent` cancels the
    /// session (but not the other way round).
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Spawn the session on the current Tokio runtime.
    pub fn start(self, prompt: Prompt) -> StreamHandle {
        let (tx, rx) = mpsc::channel(self.options.buffer_size.max(1));
        let pending = Arc::new(PendingCalls::default());
        let session = Session {
            kind: self.provider.kind(),
            provider: self.provider,
            executor: self.executor,
            config: self.config,
            options: self.options,
            events: tx,
            cancel: self.cancel.clone(),
            pending: pending.clone(),
            last_chunk: None,
        };
        tokio::spawn(session.run(prompt));
        StreamHandle {
            events: rx,
            cancel: self.cancel,
            submitter: ToolResultSubmitter { pending },
        }
    }
}

struct Session<P: Provider> {
    provider: Arc<P>,
    kind: ProviderKind,
    executor: Arc<ToolExecutor>,
    config: LoopConfig,
    options: StreamOptions,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    pending: Arc<PendingCalls>,
    last_chunk: Option<Instant>,
}

impl<P: Provider + 'static> Session<P> {
    async fn run(mut self, prompt: Prompt) {
        let trace_id = generate_trace_id();
        info!(
            "Stream session started: trace_id={trace_id}, provider={}, model={}",
            self.kind, self.config.model
        );

        let outcome = self.drive(prompt).await;
        self.pending.clear();
        match outcome {
            Ok(()) => {
                info!("Stream session finished: trace_id={trace_id}");
                let model = self.config.model.clone();
                // A cancelled send just means nobody is listening.
                let _ = self.emit(StreamEventKind::Done { model }).await;
            }
            Err(e) if e.is_cancelled() || self.cancel.is_cancelled() => {
                debug!("Stream session cancelled: trace_id={trace_id}");
                let _ = self.events.try_send(StreamEvent::new(
                    StreamEventKind::Error(Error::Cancelled),
                    self.kind,
                ));
            }
            Err(e) => {
                warn!("Stream session failed: trace_id={trace_id}: {e}");
                let _ = self.emit(StreamEventKind::Error(e)).await;
            }
        }
        // Dropping `self.events` closes the channel.
    }

    async fn drive(&mut self, prompt: Prompt) -> Result<(), Error> {
        let mut turns = self.provider.prompt_turns(&prompt);
        let max_rounds = self.config.max_rounds;
        let mut round: u32 = 0;

        loop {
            round += 1;
            if round > max_rounds {
                return Err(Error::ToolRoundLimitExceeded { max_rounds });
            }
            debug!("Stream round {round}/{max_rounds}");

            let request = GenerateRequest {
                model: &self.config.model,
                tools: self.executor.specs(),
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
                include_usage: self.options.include_usage,
                response_schema: self.config.response_schema.as_ref(),
            };
            let mut stream = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                s = self.provider.generate_stream(&turns, request) => s?,
            };

            let mut builder = RoundBuilder::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    d = stream.next() => d,
                };
                let Some(delta) = next else { break };
                let delta = delta?;
                if let Delta::Text(t) = &delta
                    && !t.is_empty()
                {
                    self.emit_chunk(t.clone()).await?;
                }
                builder.push(&delta);
            }

            let reply = builder.finish();
            if self.options.include_usage
                && let Some(u) = reply.usage
            {
                self.emit(StreamEventKind::Usage(u)).await?;
            }

            let (text, calls) = match reply.round {
                Round::FinalAnswer { .. } => return Ok(()),
                Round::ToolCallBatch { text, calls } => (text, calls),
            };
            info!("Stream round {round}: {} tool call(s)", calls.len());

            if !self.options.enable_tool_execution {
                for call in &calls {
                    self.emit(StreamEventKind::ToolCallRequest(call.clone()))
                        .await?;
                }
                return Ok(());
            }

            let results = match self.options.tool_execution_mode {
                ToolExecutionMode::Auto => self.run_auto(&calls).await?,
                ToolExecutionMode::Parallel => self.run_parallel(&calls).await?,
                ToolExecutionMode::Pause => self.run_paused(&calls).await?,
            };

            turns.push(self.provider.model_turn(&text, &calls));
            turns.extend(self.provider.tool_result_turns(&results));
        }
    }

    /// One call at a time: request, execute, result.
    async fn run_auto(&self, calls: &[ToolCallRequest]) -> Result<Vec<ToolCallResult>, Error> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            self.emit(StreamEventKind::ToolCallRequest(call.clone()))
                .await?;
            let result = self.executor.execute_one(&self.cancel, call).await;
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let failure = result.error().cloned();
            self.emit(StreamEventKind::ToolCallResult(result.clone()))
                .await?;
            results.push(result);
            if self.executor.config().stop_on_error
                && let Some(source) = failure
            {
                return Err(BatchError {
                    tool: call.name.clone(),
                    source,
                    results,
                }
                .into());
            }
        }
        Ok(results)
    }

    /// All requests, then the batch concurrently, then results in call order.
    async fn run_parallel(
        &self,
        calls: &[ToolCallRequest],
    ) -> Result<Vec<ToolCallResult>, Error> {
        for call in calls {
            self.emit(StreamEventKind::ToolCallRequest(call.clone()))
                .await?;
        }
        let batch = self.executor.execute_parallel(&self.cancel, calls).await;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (results, failure) = match batch {
            Ok(results) => (results, None),
            Err(e) => (e.results.clone(), Some(e)),
        };
        for result in &results {
            self.emit(StreamEventKind::ToolCallResult(result.clone()))
                .await?;
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(results),
        }
    }

    /// Wait for the caller to resolve each call. Submitted failures go back
    /// to the model; they never end the session.
    async fn run_paused(&self, calls: &[ToolCallRequest]) -> Result<Vec<ToolCallResult>, Error> {
        let mut waits = Vec::with_capacity(calls.len());
        for call in calls {
            let wait = self.pending.register(&call.id);
            if wait.is_none() {
                warn!("Duplicate call id {} in paused round; failing the repeat", call.id);
            } else {
                self.emit(StreamEventKind::ToolCallRequest(call.clone()))
                    .await?;
            }
            waits.push(wait);
        }

        let mut results = Vec::with_capacity(calls.len());
        for (call, wait) in calls.iter().zip(waits) {
            let Some(wait) = wait else {
                let result = ToolCallResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    outcome: Err(ToolError::DuplicateCallId(call.id.clone())),
                    cached: false,
                };
                self.emit(StreamEventKind::ToolCallResult(result.clone()))
                    .await?;
                results.push(result);
                continue;
            };
            debug!("Waiting for submitted result of {} ({})", call.name, call.id);
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.pending.forget(&call.id);
                    return Err(Error::Cancelled);
                }
                r = wait => r.map_err(|_| Error::Cancelled)?,
            };
            let result = ToolCallResult {
                call_id: call.id.clone(),
                name: call.name.clone(),
                outcome,
                cached: false,
            };
            self.emit(StreamEventKind::ToolCallResult(result.clone()))
                .await?;
            results.push(result);
        }
        Ok(results)
    }

    async fn emit_chunk(&mut self, text: String) -> Result<(), Error> {
        let interval = self.options.flush_interval;
        if !interval.is_zero()
            && let Some(last) = self.last_chunk
        {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(last + interval) => {}
            }
        }
        self.emit(StreamEventKind::Chunk(text)).await?;
        self.last_chunk = Some(Instant::now());
        Ok(())
    }

    /// Send an event, giving up if the session is cancelled or the receiver
    /// is gone.
    async fn emit(&self, kind: StreamEventKind) -> Result<(), Error> {
        let event = StreamEvent::new(kind, self.kind);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            sent = self.events.send(event) => sent.map_err(|_| Error::Cancelled),
        }
    }
}
