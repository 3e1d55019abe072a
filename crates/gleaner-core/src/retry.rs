//! Bounded retries with exponential backoff, jitter and adaptive escalation.
//!
//! Each [`RetryExecutor`] owns the [`RetryState`] of one logical operation
//! class (scraping a store, fetching details, classifying batches). Executors
//! for different classes never share failure counters, so a classifier that
//! is being rate limited does not slow down detail fetches.
//!
//! # Delay schedule
//!
//! ```text
//! delay = base * 2^attempt + jitter            (attempt is 0-indexed)
//! delay = delay * escalation_factor            (once consecutive failures > threshold)
//! delay = min(delay, max_delay)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Source of random jitter, injectable for deterministic tests.
pub trait JitterSource: Send + Sync {
    /// Returns a value in `[0, max_ms)`, or 0 when `max_ms` is 0.
    fn sample(&self, max_ms: u64) -> u64;
}

/// Xorshift jitter seeded from the clock. Good enough for spreading retries, not crypto.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClockJitter;

impl JitterSource for ClockJitter {
    fn sample(&self, max_ms: u64) -> u64 {
        if max_ms == 0 {
            return 0;
        }
        let mut x = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        x % max_ms
    }
}

/// Always returns the same jitter (clamped below `max_ms`).
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedJitter(pub u64);

impl JitterSource for FixedJitter {
    fn sample(&self, max_ms: u64) -> u64 {
        if max_ms == 0 {
            return 0;
        }
        self.0.min(max_ms - 1)
    }
}

/// Retry configuration for one operation class. Value object.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform random jitter added to each delay.
    pub jitter: Duration,
    pub max_delay: Duration,
    /// Consecutive failures tolerated before backoff escalates.
    pub escalation_threshold: u32,
    pub escalation_factor: u32,
    /// Per-attempt timeout; an elapsed timeout is an ordinary retryable failure.
    pub attempt_timeout: Option<Duration>,
    retry_on: fn(&AppError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            jitter: Duration::from_millis(500),
            max_delay: Duration::from_secs(120),
            escalation_threshold: 3,
            escalation_factor: 4,
            attempt_timeout: None,
            retry_on: AppError::is_retryable,
        }
    }
}

impl RetryPolicy {
    /// Policy for whole harvest jobs: any error that is not fatal is retried.
    pub fn for_jobs(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_on: |e: &AppError| !e.is_fatal(),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_escalation(mut self, threshold: u32, factor: u32) -> Self {
        self.escalation_threshold = threshold;
        self.escalation_factor = factor.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_retry_on(mut self, predicate: fn(&AppError) -> bool) -> Self {
        self.retry_on = predicate;
        self
    }

    pub fn is_retryable(&self, error: &AppError) -> bool {
        (self.retry_on)(error)
    }

    /// Backoff before retry number `attempt + 1`.
    ///
    /// Pure in its inputs: the caller samples `jitter_ms` from a [`JitterSource`].
    pub fn backoff_delay(&self, attempt: u32, consecutive_failures: u32, jitter_ms: u64) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        let mut delay_ms = exp_ms.saturating_add(jitter_ms);
        if consecutive_failures > self.escalation_threshold {
            delay_ms = delay_ms.saturating_mul(u64::from(self.escalation_factor));
        }
        std::cmp::min(Duration::from_millis(delay_ms), self.max_delay)
    }
}

/// Failure counter of one executor.
#[derive(Debug, Default)]
pub struct RetryState {
    consecutive_failures: AtomicU32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Rate limits jump straight past the escalation threshold.
    pub fn record_rate_limit(&self, threshold: u32) -> u32 {
        let escalated = threshold.saturating_add(1);
        let previous = self
            .consecutive_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(std::cmp::max(n.saturating_add(1), escalated))
            })
            .unwrap_or(0);
        std::cmp::max(previous.saturating_add(1), escalated)
    }
}

/// A successful result together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Retried<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Runs fallible operations of one class with bounded retries.
#[derive(Clone)]
pub struct RetryExecutor {
    operation: String,
    state: Arc<RetryState>,
    jitter: Arc<dyn JitterSource>,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            state: Arc::new(RetryState::new()),
            jitter: Arc::new(ClockJitter),
            cancel: CancellationToken::new(),
        }
    }

    /// Share an existing failure counter (e.g. across clones owned by different tasks).
    pub fn with_state(mut self, state: Arc<RetryState>) -> Self {
        self.state = state;
        self
    }

    pub fn with_jitter_source(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff waits end early with [`AppError::Cancelled`] once the token fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn state(&self) -> &Arc<RetryState> {
        &self.state
    }

    /// Run `operation` until it succeeds, fails non-retryably, or retries run out.
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        operation: F,
    ) -> Result<Retried<T>, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.execute_with(policy, operation, |_, _, _| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_retry(attempt, error, delay)`
    /// before each backoff wait. `attempt` is the 1-indexed attempt that failed.
    pub async fn execute_with<T, F, Fut, R>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
        mut on_retry: R,
    ) -> Result<Retried<T>, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
        R: FnMut(u32, &AppError, Duration),
    {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let result = match policy.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(inner) => inner,
                    Err(_) => Err(AppError::Timeout(limit.as_millis() as u64)),
                },
                None => operation().await,
            };

            let error = match result {
                Ok(value) => {
                    self.state.record_success();
                    return Ok(Retried {
                        value,
                        attempts: attempt + 1,
                    });
                }
                Err(e) => e,
            };

            if !policy.is_retryable(&error) {
                tracing::debug!(
                    operation = %self.operation,
                    attempt = attempt + 1,
                    error = %error,
                    "Non-retryable failure"
                );
                if attempt == 0 {
                    return Err(error);
                }
                return Err(self.exhausted(attempt + 1, error));
            }

            let failures = if error.is_rate_limit() {
                self.state.record_rate_limit(policy.escalation_threshold)
            } else {
                self.state.record_failure()
            };

            if attempt >= policy.max_retries {
                tracing::warn!(
                    operation = %self.operation,
                    attempts = attempt + 1,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(self.exhausted(attempt + 1, error));
            }

            let jitter_ms = self.jitter.sample(policy.jitter.as_millis() as u64);
            let delay = policy.backoff_delay(attempt, failures, jitter_ms);
            tracing::warn!(
                operation = %self.operation,
                attempt = attempt + 1,
                consecutive_failures = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, backing off"
            );
            on_retry(attempt + 1, &error, delay);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => return Err(AppError::Cancelled),
            }
            attempt += 1;
        }
    }

    fn exhausted(&self, attempts: u32, last_error: AppError) -> AppError {
        AppError::RetriesExhausted {
            operation: self.operation.clone(),
            attempts,
            last_error: Box::new(last_error),
        }
    }
}
