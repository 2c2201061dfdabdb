//! Retry with exponential backoff for tool handlers.
//!
//! [`RetryHandler`] wraps any [`ToolHandler`]. Failures whose
//! [`code`](ToolError::code) is in the configured retryable set (by default
//! only timeouts and cancellations) are retried after
//! `min(initial * multiplier^attempt, max)`; anything else fails at once
//! with [`ToolError::NonRetryable`]. Backoff sleeps end early when the
//! call's cancellation token fires.

use super::handler::{HandlerFuture, ToolHandler};
use crate::{Arguments, ToolError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first (0 is treated as 1).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Backoff multiplier (typically 2.0 for exponential backoff).
    pub multiplier: f64,
    /// Scale delays down by a fixed per-attempt factor to spread out
    /// simultaneous retries.
    pub jitter: bool,
    /// Error codes that may be retried. `None` means timeouts and
    /// cancellations only.
    pub retryable: Option<Vec<String>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
            retryable: None,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given number of attempts. Uses sensible
    /// defaults for everything else.
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retry errors with these codes (see [`ToolError::code`]).
    pub fn retry_on<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable = Some(codes.into_iter().map(Into::into).collect());
        self
    }

    /// Calculate the delay after a failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        if self.jitter {
            // Fixed factors rather than a random source.
            let jitter_factor = match attempt % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                _ => 0.85,
            };
            Duration::from_secs_f64(capped * jitter_factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }

    /// Whether `error` may be retried under this config.
    pub fn is_retryable(&self, error: &ToolError) -> bool {
        match &self.retryable {
            Some(codes) => codes.iter().any(|c| c == error.code()),
            None => error.is_transient(),
        }
    }
}

/// A handler wrapped with retry.
pub struct RetryHandler {
    inner: Arc<dyn ToolHandler>,
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(inner: Arc<dyn ToolHandler>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

impl ToolHandler for RetryHandler {
    fn call(&self, cancel: CancellationToken, arguments: Arguments) -> HandlerFuture<'_> {
        Box::pin(call_with_retry(
            self.inner.as_ref(),
            &self.config,
            cancel,
            arguments,
        ))
    }
}

/// Invoke `handler` under `config`'s retry policy.
pub async fn call_with_retry(
    handler: &dyn ToolHandler,
    config: &RetryConfig,
    cancel: CancellationToken,
    arguments: Arguments,
) -> Result<serde_json::Value, ToolError> {
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let err = match handler.call(cancel.clone(), arguments.clone()).await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        if !config.is_retryable(&err) {
            debug!("Non-retryable tool error ({}): {err}", err.code());
            return Err(ToolError::NonRetryable(Box::new(err)));
        }

        attempt += 1;
        if attempt >= attempts {
            return Err(ToolError::RetriesExhausted {
                attempts,
                last: Box::new(err),
            });
        }

        let delay = config.delay_for_attempt(attempt - 1);
        warn!("Retryable tool error (attempt {attempt}/{attempts}): {err}. Retrying in {delay:?}...");
        tokio::select! {
            _ = cancel.cancelled() => return Err(ToolError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::handler::FnHandler;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig::default().with_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn counting(
        calls: Arc<AtomicU32>,
        fail_with: impl Fn(u32) -> Option<ToolError> + Send + Sync + 'static,
    ) -> Arc<dyn ToolHandler> {
        Arc::new(FnHandler::new(move |_c, _a| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let outcome = match fail_with(n) {
                Some(e) => Err(e),
                None => Ok(json!("ok")),
            };
            async move { outcome }
        }))
    }

    #[test]
    fn default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_backoff, Duration::from_millis(100));
        assert_eq!(config.max_backoff, Duration::from_secs(10));
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn delay_increases_exponentially() {
        let config = RetryConfig::with_attempts(5);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn delay_capped_at_max() {
        let config = RetryConfig::with_attempts(10)
            .with_backoff(Duration::from_millis(100), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(2));
    }

    #[test]
    fn jitter_reduces_delay() {
        let plain = RetryConfig::default();
        let jittered = RetryConfig::default().with_jitter(true);
        assert!(jittered.delay_for_attempt(2) <= plain.delay_for_attempt(2));
    }

    #[test]
    fn default_retryable_class() {
        let config = RetryConfig::default();
        assert!(config.is_retryable(&ToolError::Timeout));
        assert!(config.is_retryable(&ToolError::Cancelled));
        assert!(!config.is_retryable(&ToolError::failed("boom")));
    }

    #[test]
    fn explicit_retryable_set_replaces_default() {
        let config = RetryConfig::default().retry_on(["rate_limited"]);
        assert!(config.is_retryable(&ToolError::with_code("rate_limited", "429")));
        assert!(!config.is_retryable(&ToolError::Timeout));
    }

    #[tokio::test]
    async fn always_retryable_failure_runs_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = RetryHandler::new(
            counting(calls.clone(), |_| Some(ToolError::Timeout)),
            fast(),
        );
        let err = handler
            .call(CancellationToken::new(), Arguments::new())
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            err,
            ToolError::RetriesExhausted {
                attempts: 3,
                last: Box::new(ToolError::Timeout)
            }
        );
    }

    #[tokio::test]
    async fn non_retryable_failure_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = RetryHandler::new(
            counting(calls.clone(), |_| Some(ToolError::failed("bad input"))),
            fast(),
        );
        let err = handler
            .call(CancellationToken::new(), Arguments::new())
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            err,
            ToolError::NonRetryable(Box::new(ToolError::failed("bad input")))
        );
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = RetryHandler::new(
            counting(calls.clone(), |n| (n < 2).then_some(ToolError::Timeout)),
            fast(),
        );
        let out = handler
            .call(CancellationToken::new(), Arguments::new())
            .await
            .unwrap();
        assert_eq!(out, Value::from("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_attempts_behaves_as_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig {
            max_attempts: 0,
            ..fast()
        };
        let handler = RetryHandler::new(counting(calls.clone(), |_| Some(ToolError::Timeout)), config);
        let err = handler
            .call(CancellationToken::new(), Arguments::new())
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ToolError::RetriesExhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::default()
            .with_backoff(Duration::from_secs(30), Duration::from_secs(30));
        let handler = RetryHandler::new(counting(calls.clone(), |_| Some(ToolError::Timeout)), config);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = handler.call(cancel, Arguments::new()).await.unwrap_err();
        assert_eq!(err, ToolError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
