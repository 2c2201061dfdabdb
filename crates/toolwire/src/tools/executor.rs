//! Batch execution of tool calls.
//!
//! Each call goes through the same pipeline:
//!
//! 1. argument decoding and validation (when a validator is configured),
//! 2. cache lookup (a hit short-circuits and is marked `cached`),
//! 3. handler lookup ([`ToolError::NoHandler`] when unregistered),
//! 4. the handler itself, wrapped in timeout and retry when configured,
//! 5. write-back of the outcome to the cache.
//!
//! Batches run serially in request order or all at once. Under
//! stop-on-error a serial batch stops at the first failure; a parallel batch
//! always waits for every call and then reports the first failure that was
//! recorded. Results always line up index-for-index with the requests.

use super::cache::{CacheConfig, ResultCache};
use super::handler::{HandlerFuture, ToolHandler, ToolSet, log_tool_call};
use super::retry::{RetryConfig, RetryHandler};
use super::spec::ToolSpec;
use super::validator::ArgumentValidator;
use crate::{Arguments, BatchError, ToolError};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

// ── Calls and results ──────────────────────────────────────────────

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRequest {
    /// Provider call id, or a synthesized `"{name}_{index}"`.
    pub id: String,
    pub name: String,
    pub arguments: Arguments,
    /// Arguments as the provider sent them.
    pub raw_arguments: String,
    /// Set when `raw_arguments` was not a JSON object. Such calls fail with
    /// [`ToolError::InvalidArguments`] without reaching a handler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Arguments) -> Self {
        let raw_arguments = Value::Object(arguments.clone()).to_string();
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            raw_arguments,
            parse_error: None,
        }
    }

    /// Decode a raw argument string. Empty input means no arguments.
    pub fn from_raw(id: impl Into<String>, name: impl Into<String>, raw: &str) -> Self {
        let (arguments, parse_error) = if raw.trim().is_empty() {
            (Arguments::new(), None)
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => (map, None),
                Ok(other) => (
                    Arguments::new(),
                    Some(format!("expected a JSON object, got {other}")),
                ),
                Err(e) => (Arguments::new(), Some(e.to_string())),
            }
        };
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            raw_arguments: raw.to_string(),
            parse_error,
        }
    }
}

/// Outcome of one [`ToolCallRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub call_id: String,
    pub name: String,
    pub outcome: Result<Value, ToolError>,
    /// Served from the result cache.
    pub cached: bool,
}

impl ToolCallResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&ToolError> {
        self.outcome.as_ref().err()
    }

    /// Text form for providers that take tool results as strings. String
    /// values are passed through unquoted; failures read `Error: ...` so the
    /// model can self-correct.
    pub fn content_string(&self) -> String {
        match &self.outcome {
            Ok(Value::String(s)) => s.clone(),
            Ok(v) => v.to_string(),
            Err(e) => format!("Error: {e}"),
        }
    }

    /// Object form for providers that take tool results as JSON objects.
    /// Non-object values are wrapped as `{"result": value}` and failures as
    /// `{"error": message}`.
    pub fn response_object(&self) -> Value {
        match &self.outcome {
            Ok(v @ Value::Object(_)) => v.clone(),
            Ok(v) => json!({ "result": v }),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }
}

// ── Configuration ──────────────────────────────────────────────────

/// Executor behavior.
///
/// ```ignore
/// let config = ExecutorConfig::default()
///     .with_parallel(true)
///     .with_cache(CacheConfig::default().with_ttl(Duration::from_secs(60)))
///     .with_retry(RetryConfig::with_attempts(4));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Run batches concurrently. Default: `false`.
    pub parallel: bool,
    /// Abort (serial) or report (parallel) on the first failure. Default: `true`.
    pub stop_on_error: bool,
    /// Validate arguments against the tool schemas. Default: `true`.
    pub validate: bool,
    /// Run full JSON Schema validation in addition to the basic check.
    /// Default: `false`.
    pub strict_schema: bool,
    /// Result caching. Default: disabled.
    pub cache: Option<CacheConfig>,
    /// Retry policy for every handler. Default: disabled.
    pub retry: Option<RetryConfig>,
    /// Per-attempt time limit. Default: none.
    pub timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            stop_on_error: true,
            validate: true,
            strict_schema: false,
            cache: None,
            retry: None,
            timeout: None,
        }
    }
}

impl ExecutorConfig {
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn with_strict_schema(mut self, strict: bool) -> Self {
        self.strict_schema = strict;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// Snapshot of an executor's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub cached_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl ExecutorMetrics {
    /// Cache hits over lookups (0.0 with no lookups).
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    /// Successful calls over total calls (0.0 with no calls).
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.successful_calls as f64 / self.total_calls as f64
        }
    }
}

// ── Executor ───────────────────────────────────────────────────────

/// Applies a per-attempt time limit to the wrapped handler.
struct TimeoutHandler {
    inner: Arc<dyn ToolHandler>,
    limit: Duration,
}

impl ToolHandler for TimeoutHandler {
    fn call(&self, cancel: CancellationToken, arguments: Arguments) -> HandlerFuture<'_> {
        Box::pin(async move {
            tokio::time::timeout(self.limit, self.inner.call(cancel, arguments))
                .await
                .unwrap_or(Err(ToolError::Timeout))
        })
    }
}

/// Runs tool-call batches for one conversation (or a family of
/// conversations that should share a cache and metrics).
pub struct ToolExecutor {
    specs: Vec<ToolSpec>,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    validator: Option<ArgumentValidator>,
    cache: Option<ResultCache>,
    config: ExecutorConfig,
    metrics: Mutex<ExecutorMetrics>,
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("tools", &self.specs.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ToolExecutor {
    /// Build an executor over the specs and handlers in `tools`. Handlers are
    /// wrapped in timeout and retry here, once.
    pub fn new(tools: &ToolSet, config: ExecutorConfig) -> Self {
        let specs = tools.specs();
        let handlers = tools
            .handlers()
            .map(|(name, handler)| (name.to_string(), wrap_handler(handler.clone(), &config)))
            .collect();
        let validator = config.validate.then(|| {
            let v = ArgumentValidator::new(&specs);
            if config.strict_schema { v.strict() } else { v }
        });
        let cache = config.cache.clone().map(ResultCache::new);
        Self {
            specs,
            handlers,
            validator,
            cache,
            config,
            metrics: Mutex::new(ExecutorMetrics::default()),
        }
    }

    /// Specs of every tool this executor knows, in registration order.
    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&ResultCache> {
        self.cache.as_ref()
    }

    /// Whether a handler is registered for `name`.
    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run a batch in the configured mode.
    pub async fn execute_batch(
        &self,
        cancel: &CancellationToken,
        calls: &[ToolCallRequest],
    ) -> Result<Vec<ToolCallResult>, BatchError> {
        if self.config.parallel {
            self.execute_parallel(cancel, calls).await
        } else {
            self.execute_serial(cancel, calls).await
        }
    }

    /// Run calls one after another in request order.
    pub async fn execute_serial(
        &self,
        cancel: &CancellationToken,
        calls: &[ToolCallRequest],
    ) -> Result<Vec<ToolCallResult>, BatchError> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let result = self.execute_one(cancel, call).await;
            let failure = result.error().cloned();
            results.push(result);
            if self.config.stop_on_error
                && let Some(source) = failure
            {
                debug!(
                    "Stopping batch after {} of {} call(s): {} failed",
                    results.len(),
                    calls.len(),
                    call.name
                );
                return Err(BatchError {
                    tool: call.name.clone(),
                    source,
                    results,
                });
            }
        }
        Ok(results)
    }

    /// Run every call concurrently and wait for all of them. Results keep
    /// request order; under stop-on-error the first failure to complete is
    /// reported after the whole batch settles.
    pub async fn execute_parallel(
        &self,
        cancel: &CancellationToken,
        calls: &[ToolCallRequest],
    ) -> Result<Vec<ToolCallResult>, BatchError> {
        let first_error: Mutex<Option<(String, ToolError)>> = Mutex::new(None);
        let futures = calls.iter().map(|call| {
            let first_error = &first_error;
            async move {
                let result = self.execute_one(cancel, call).await;
                if let Some(e) = result.error() {
                    let mut slot = first_error.lock().unwrap_or_else(|e| e.into_inner());
                    if slot.is_none() {
                        *slot = Some((call.name.clone(), e.clone()));
                    }
                }
                result
            }
        });
        let results = futures::future::join_all(futures).await;

        let first_error = first_error.into_inner().unwrap_or_else(|e| e.into_inner());
        match first_error {
            Some((tool, source)) if self.config.stop_on_error => Err(BatchError {
                tool,
                source,
                results,
            }),
            _ => Ok(results),
        }
    }

    /// Run a single call through the full pipeline. Never fails: the
    /// outcome is in the returned result.
    pub async fn execute_one(
        &self,
        cancel: &CancellationToken,
        call: &ToolCallRequest,
    ) -> ToolCallResult {
        let (outcome, cached) = self.run_pipeline(cancel, call).await;
        self.record(&outcome, cached);
        ToolCallResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            outcome,
            cached,
        }
    }

    async fn run_pipeline(
        &self,
        cancel: &CancellationToken,
        call: &ToolCallRequest,
    ) -> (Result<Value, ToolError>, bool) {
        if let Some(message) = &call.parse_error {
            return (
                Err(ToolError::InvalidArguments {
                    tool: call.name.clone(),
                    message: message.clone(),
                }),
                false,
            );
        }

        if let Some(validator) = &self.validator
            && let Err(e) = validator.validate(&call.name, &call.arguments)
        {
            debug!("Validation failed for {}: {e}", call.name);
            return (Err(e), false);
        }

        if let Some(cache) = &self.cache
            && let Some(outcome) = cache.get(&call.name, &call.arguments)
        {
            debug!("Tool {} served from cache", call.name);
            return (outcome, true);
        }

        let Some(handler) = self.handlers.get(&call.name) else {
            return (Err(ToolError::NoHandler(call.name.clone())), false);
        };

        log_tool_call(&call.name, &call.arguments);
        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            r = handler.call(cancel.child_token(), call.arguments.clone()) => r,
        };
        let elapsed = start.elapsed();
        match &outcome {
            Ok(v) => {
                debug!(
                    "Tool {} completed in {:.0}ms",
                    call.name,
                    elapsed.as_secs_f64() * 1000.0
                );
                trace!("Tool {} result: {v}", call.name);
            }
            Err(e) => info!(
                "Tool {} failed after {:.0}ms: {e}",
                call.name,
                elapsed.as_secs_f64() * 1000.0
            ),
        }

        if let Some(cache) = &self.cache
            && !matches!(outcome, Err(ToolError::Cancelled))
        {
            cache.set(&call.name, &call.arguments, outcome.clone());
        }
        (outcome, false)
    }

    fn record(&self, outcome: &Result<Value, ToolError>, cached: bool) {
        let mut m = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        m.total_calls += 1;
        if outcome.is_ok() {
            m.successful_calls += 1;
        } else {
            m.failed_calls += 1;
        }
        if cached {
            m.cached_calls += 1;
        }
    }

    /// Snapshot of the call counters plus the cache's hit/miss counts.
    pub fn metrics(&self) -> ExecutorMetrics {
        let mut m = *self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cache) = &self.cache {
            (m.cache_hits, m.cache_misses) = cache.stats();
        }
        m
    }

    /// Zero every counter. Must not race with an in-flight batch.
    pub fn reset_metrics(&self) {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner()) = ExecutorMetrics::default();
        if let Some(cache) = &self.cache {
            cache.reset_stats();
        }
    }
}

fn wrap_handler(handler: Arc<dyn ToolHandler>, config: &ExecutorConfig) -> Arc<dyn ToolHandler> {
    let handler = match config.timeout {
        Some(limit) => Arc::new(TimeoutHandler {
            inner: handler,
            limit,
        }) as Arc<dyn ToolHandler>,
        None => handler,
    };
    match &config.retry {
        Some(retry) => Arc::new(RetryHandler::new(handler, retry.clone())),
        None => handler,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::handler::FnHandler;
    use crate::tools::schema::Schema;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spec(name: &str) -> ToolSpec {
        ToolSpec::new(
            name,
            "",
            Schema::object().property("n", Schema::integer(), false).to_value(),
        )
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest::new(id, name, args.as_object().cloned().unwrap())
    }

    /// Returns its `value` argument after `delay_ms`, counting invocations.
    fn echo_tools(counter: Arc<AtomicU32>) -> ToolSet {
        let spec = ToolSpec::new(
            "echo",
            "",
            Schema::object()
                .property("value", Schema::string(), true)
                .property("delay_ms", Schema::integer(), false)
                .to_value(),
        );
        ToolSet::new().with(
            spec,
            FnHandler::new(move |_c, args: Arguments| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let delay = args.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(args["value"].clone())
                }
            }),
        )
    }

    fn ok_fail_ok() -> (ToolSet, Arc<AtomicU32>) {
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let tools = ToolSet::new()
            .with(
                spec("ok"),
                FnHandler::new(move |_c, _a| {
                    r.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!("fine")) }
                }),
            )
            .with(
                spec("fail"),
                FnHandler::new(|_c, _a| async { Err(ToolError::failed("boom")) }),
            );
        (tools, runs)
    }

    fn batch() -> Vec<ToolCallRequest> {
        vec![
            call("1", "ok", json!({})),
            call("2", "fail", json!({})),
            call("3", "ok", json!({})),
        ]
    }

    #[tokio::test]
    async fn serial_stop_on_error_truncates() {
        let (tools, runs) = ok_fail_ok();
        let exec = ToolExecutor::new(&tools, ExecutorConfig::default());
        let err = exec
            .execute_batch(&CancellationToken::new(), &batch())
            .await
            .unwrap_err();

        assert_eq!(err.tool, "fail");
        assert_eq!(err.source, ToolError::failed("boom"));
        assert_eq!(err.results.len(), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 1, "third call must not run");
    }

    #[tokio::test]
    async fn serial_without_stop_runs_everything() {
        let (tools, runs) = ok_fail_ok();
        let exec = ToolExecutor::new(&tools, ExecutorConfig::default().with_stop_on_error(false));
        let results = exec
            .execute_batch(&CancellationToken::new(), &batch())
            .await
            .unwrap();

        let oks: Vec<bool> = results.iter().map(|r| r.is_ok()).collect();
        assert_eq!(oks, vec![true, false, true]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let ids: Vec<&str> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_results_keep_request_order() {
        let tools = echo_tools(Arc::new(AtomicU32::new(0)));
        let exec = ToolExecutor::new(&tools, ExecutorConfig::default().with_parallel(true));
        let calls = vec![
            call("a", "echo", json!({"value": "result1", "delay_ms": 60})),
            call("b", "echo", json!({"value": "result2", "delay_ms": 5})),
            call("c", "echo", json!({"value": "result3", "delay_ms": 30})),
        ];
        let results = exec
            .execute_batch(&CancellationToken::new(), &calls)
            .await
            .unwrap();

        let values: Vec<Value> = results.iter().map(|r| r.outcome.clone().unwrap()).collect();
        assert_eq!(values, vec![json!("result1"), json!("result2"), json!("result3")]);
    }

    #[tokio::test]
    async fn parallel_runs_concurrently() {
        let tools = echo_tools(Arc::new(AtomicU32::new(0)));
        let exec = ToolExecutor::new(&tools, ExecutorConfig::default().with_parallel(true));
        let calls: Vec<_> = (0..4)
            .map(|i| call(&i.to_string(), "echo", json!({"value": "x", "delay_ms": 100})))
            .collect();
        let started = Instant::now();
        exec.execute_batch(&CancellationToken::new(), &calls)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(350));
    }

    #[tokio::test]
    async fn parallel_stop_on_error_waits_for_all() {
        let (tools, runs) = ok_fail_ok();
        let exec = ToolExecutor::new(&tools, ExecutorConfig::default().with_parallel(true));
        let err = exec
            .execute_batch(&CancellationToken::new(), &batch())
            .await
            .unwrap_err();
        assert_eq!(err.tool, "fail");
        assert_eq!(err.results.len(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_short_circuits_second_call() {
        let counter = Arc::new(AtomicU32::new(0));
        let tools = echo_tools(counter.clone());
        let exec = ToolExecutor::new(
            &tools,
            ExecutorConfig::default().with_cache(CacheConfig::default()),
        );
        let cancel = CancellationToken::new();
        let first = exec
            .execute_one(&cancel, &call("1", "echo", json!({"value": "v"})))
            .await;
        let second = exec
            .execute_one(&cancel, &call("2", "echo", json!({"value": "v"})))
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(second.call_id, "2");

        let m = exec.metrics();
        assert_eq!(m.total_calls, 2);
        assert_eq!(m.cached_calls, 1);
        assert_eq!((m.cache_hits, m.cache_misses), (1, 1));
        assert!((m.cache_hit_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn expired_cache_entry_reinvokes_handler() {
        let counter = Arc::new(AtomicU32::new(0));
        let tools = echo_tools(counter.clone());
        let exec = ToolExecutor::new(
            &tools,
            ExecutorConfig::default()
                .with_cache(CacheConfig::default().with_ttl(Duration::from_millis(20))),
        );
        let cancel = CancellationToken::new();
        let c = call("1", "echo", json!({"value": "v"}));
        exec.execute_one(&cancel, &c).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = exec.execute_one(&cancel, &c).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(!again.cached);
    }

    #[tokio::test]
    async fn validation_errors_are_per_call() {
        let counter = Arc::new(AtomicU32::new(0));
        let tools = echo_tools(counter.clone());
        let exec = ToolExecutor::new(&tools, ExecutorConfig::default().with_stop_on_error(false));
        let results = exec
            .execute_batch(
                &CancellationToken::new(),
                &[
                    call("1", "echo", json!({})),
                    call("2", "echo", json!({"value": 3})),
                    call("3", "missing", json!({})),
                    call("4", "echo", json!({"value": "fine"})),
                ],
            )
            .await
            .unwrap();

        assert!(matches!(results[0].error(), Some(ToolError::MissingParameter { .. })));
        assert!(matches!(results[1].error(), Some(ToolError::TypeMismatch { .. })));
        assert_eq!(results[2].error(), Some(&ToolError::UnknownTool("missing".into())));
        assert!(results[3].is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_handler_without_validation() {
        let tools = ToolSet::new().with_spec(spec("declared"));
        let exec = ToolExecutor::new(&tools, ExecutorConfig::default());
        let result = exec
            .execute_one(&CancellationToken::new(), &call("1", "declared", json!({})))
            .await;
        assert_eq!(result.error(), Some(&ToolError::NoHandler("declared".into())));

        let exec = ToolExecutor::new(&tools, ExecutorConfig::default().with_validation(false));
        let result = exec
            .execute_one(&CancellationToken::new(), &call("1", "ghost", json!({})))
            .await;
        assert_eq!(result.error(), Some(&ToolError::NoHandler("ghost".into())));
    }

    #[tokio::test]
    async fn malformed_arguments_never_reach_handler() {
        let counter = Arc::new(AtomicU32::new(0));
        let exec = ToolExecutor::new(&echo_tools(counter.clone()), ExecutorConfig::default());
        let bad = ToolCallRequest::from_raw("1", "echo", "{\"value\": ");
        let result = exec.execute_one(&CancellationToken::new(), &bad).await;
        assert!(matches!(result.error(), Some(ToolError::InvalidArguments { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_is_retried_then_exhausted() {
        let counter = Arc::new(AtomicU32::new(0));
        let exec = ToolExecutor::new(
            &echo_tools(counter.clone()),
            ExecutorConfig::default()
                .with_timeout(Duration::from_millis(10))
                .with_retry(
                    RetryConfig::with_attempts(2)
                        .with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
                ),
        );
        let result = exec
            .execute_one(
                &CancellationToken::new(),
                &call("1", "echo", json!({"value": "slow", "delay_ms": 500})),
            )
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(matches!(
            result.error(),
            Some(ToolError::RetriesExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_call() {
        let exec = ToolExecutor::new(&echo_tools(Arc::new(AtomicU32::new(0))), ExecutorConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = exec
            .execute_one(&cancel, &call("1", "echo", json!({"value": "v", "delay_ms": 5000})))
            .await;
        assert_eq!(result.error(), Some(&ToolError::Cancelled));
    }

    #[tokio::test]
    async fn metrics_count_outcomes_and_reset() {
        let (tools, _) = ok_fail_ok();
        let exec = ToolExecutor::new(&tools, ExecutorConfig::default().with_stop_on_error(false));
        exec.execute_batch(&CancellationToken::new(), &batch())
            .await
            .unwrap();
        let m = exec.metrics();
        assert_eq!((m.total_calls, m.successful_calls, m.failed_calls), (3, 2, 1));
        assert!((m.success_rate() - 2.0 / 3.0).abs() < 1e-9);

        exec.reset_metrics();
        assert_eq!(exec.metrics(), ExecutorMetrics::default());
    }

    #[test]
    fn result_rendering() {
        let ok = ToolCallResult {
            call_id: "1".into(),
            name: "t".into(),
            outcome: Ok(json!("plain")),
            cached: false,
        };
        assert_eq!(ok.content_string(), "plain");
        assert_eq!(ok.response_object(), json!({"result": "plain"}));

        let obj = ToolCallResult {
            outcome: Ok(json!({"temp": 3})),
            ..ok.clone()
        };
        assert_eq!(obj.content_string(), r#"{"temp":3}"#);
        assert_eq!(obj.response_object(), json!({"temp": 3}));

        let err = ToolCallResult {
            outcome: Err(ToolError::failed("nope")),
            ..ok
        };
        assert_eq!(err.content_string(), "Error: nope");
        assert_eq!(err.response_object(), json!({"error": "nope"}));
    }

    #[test]
    fn raw_argument_parsing() {
        let c = ToolCallRequest::from_raw("1", "t", "");
        assert!(c.arguments.is_empty() && c.parse_error.is_none());
        let c = ToolCallRequest::from_raw("1", "t", "[1,2]");
        assert!(c.parse_error.is_some());
        let c = ToolCallRequest::from_raw("1", "t", r#"{"a":1}"#);
        assert_eq!(c.arguments["a"], json!(1));
    }
}
