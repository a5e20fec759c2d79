//! Bounded exponential backoff shared by uploads, fetches and manifest reads.
//!
//! Attempt `n` (1-based) that fails transiently waits `min(base * 2^(n-1), max)`
//! before attempt `n + 1`. Only errors for which
//! [`StreamError::is_retryable`] holds are retried; anything else returns
//! immediately as [`RetryError::Fatal`].
//!
//! Cancellation is observed between attempts and during the backoff sleep,
//! never in the middle of an attempt, so an in-flight write is always allowed
//! to finish.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::StreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Delay to wait after `attempt` failed. Attempt 0 has not happened yet and
    /// waits nothing.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base.saturating_mul(multiplier);
        std::cmp::min(delay, self.max)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError {
    /// Non-retryable error, returned on the attempt that produced it.
    Fatal(StreamError),
    /// Every allowed attempt failed transiently.
    Exhausted { attempts: u32, last: StreamError },
    Cancelled,
}

impl RetryError {
    /// Collapse into the underlying error.
    pub fn into_error(self) -> StreamError {
        match self {
            RetryError::Fatal(err) => err,
            RetryError::Exhausted { last, .. } => last,
            RetryError::Cancelled => StreamError::Cancelled,
        }
    }
}

/// Run `op` until it succeeds, fails fatally, exhausts the policy or the
/// token is cancelled.
///
/// `op` receives the 1-based attempt number. `on_retry` is told about each
/// transient failure that will be retried, with the delay about to be slept.
pub async fn retry<T, F, Fut, R>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut op: F,
    mut on_retry: R,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StreamError>>,
    R: FnMut(u32, &StreamError, Duration),
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt = attempt.saturating_add(1);

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(RetryError::Fatal(err)),
            Err(err) => err,
        };

        if policy.exhausted(attempt) {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.backoff_for_attempt(attempt);
        on_retry(attempt, &err, delay);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
