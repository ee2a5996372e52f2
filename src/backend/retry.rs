//! Retry configuration, delay calculation, and the retrying decorator.
//!
//! [`RetryingBackend`] wraps any [`Backend`] with automatic retry on
//! transient errors. All methods delegate to the shared `with_retry()`
//! helper, keeping retry logic in a single place.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{AccountMeta, Backend, ResultSet};
use crate::telemetry;
use crate::{HuginnError, Result};

/// Configuration for retry behaviour on transient errors.
///
/// Exponential backoff with full jitter: the actual delay is drawn
/// uniformly from `[0, backoff]`, which avoids synchronised retry storms.
///
/// ```rust
/// # use huginn::backend::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(200));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial request).
    /// 1 = no retry. Default: 3.
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 500ms.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 30s.
    pub max_delay: Duration,
    /// Whether to apply full jitter. Default: true.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Backoff for a given attempt (0-indexed), before jitter:
    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// The delay actually slept: a provider `retry_after` hint wins;
    /// otherwise the capped backoff, with full jitter when enabled.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let backoff = self.delay_for_attempt(attempt);
        if self.jitter && !backoff.is_zero() {
            let micros = backoff.as_micros() as u64;
            Duration::from_micros(rand::thread_rng().gen_range(0..=micros))
        } else {
            backoff
        }
    }
}

/// Execute an async operation with retry logic.
///
/// Retries on transient errors (as classified by
/// [`HuginnError::is_transient()`]) up to `config.max_attempts`, honouring
/// `retry_after` hints. Timeouts get at most one retry regardless of the
/// remaining budget. Permanent errors and cancellation return immediately.
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: &str,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    let mut timeout_retries = 0u32;
    for attempt in 0..config.max_attempts {
        if cancel.is_cancelled() {
            return Err(HuginnError::Cancelled);
        }
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() => {
                if matches!(e, HuginnError::Timeout(_)) {
                    timeout_retries += 1;
                    if timeout_retries > 1 {
                        return Err(e);
                    }
                }
                metrics::counter!(telemetry::BACKEND_RETRIES_TOTAL,
                    "operation" => operation.to_owned(),
                )
                .increment(1);
                if attempt + 1 < config.max_attempts {
                    let delay = config.effective_delay(attempt, e.retry_after());
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(HuginnError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| HuginnError::Internal("retry loop without attempts".into())))
}

/// Decorator that wraps a [`Backend`] with retry logic.
///
/// On transient errors, retries with exponential backoff and full jitter up
/// to `config.max_attempts`, respecting `retry_after` hints. Non-transient
/// errors are returned immediately; only idempotent operations exist on
/// this interface, so every method retries.
pub struct RetryingBackend {
    inner: Arc<dyn Backend>,
    config: RetryConfig,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn Backend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Backend for RetryingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn graphql(&self, cancel: &CancellationToken, query: &str, vars: Value) -> Result<Value> {
        with_retry(&self.config, cancel, "graphql", || {
            self.inner.graphql(cancel, query, vars.clone())
        })
        .await
    }

    async fn querylang(
        &self,
        cancel: &CancellationToken,
        statement: &str,
        account: i64,
        timeout: Duration,
    ) -> Result<ResultSet> {
        with_retry(&self.config, cancel, "querylang", || {
            self.inner.querylang(cancel, statement, account, timeout)
        })
        .await
    }

    async fn account_info(&self, cancel: &CancellationToken, account: i64) -> Result<AccountMeta> {
        with_retry(&self.config, cancel, "account", || {
            self.inner.account_info(cancel, account)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig::new()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_hint_wins() {
        let config = RetryConfig::new().jitter(false);
        let hint = Some(Duration::from_millis(42));
        assert_eq!(config.effective_delay(3, hint), Duration::from_millis(42));
    }

    #[test]
    fn jitter_stays_within_backoff() {
        let config = RetryConfig::new().initial_delay(Duration::from_millis(100));
        for _ in 0..50 {
            assert!(config.effective_delay(0, None) <= Duration::from_millis(100));
        }
    }
}
