// Fixed-delay retry shared by manifest polling, key fetching and segment fetching.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::DownloadError;

/// Bounded fixed-delay retry policy.
///
/// `retryable` decides which failures earn another attempt; anything else is
/// returned immediately.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Pause between two consecutive attempts.
    pub delay: Duration,
    pub retryable: fn(&DownloadError) -> bool,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Policy retrying every transient [`DownloadError`].
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            retryable: DownloadError::is_transient,
        }
    }

    pub fn with_predicate(mut self, retryable: fn(&DownloadError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn is_retryable(&self, err: &DownloadError) -> bool {
        (self.retryable)(err)
    }

    /// Run `operation` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// The closure receives the 1-based attempt number. On exhaustion the last
    /// retryable error is returned unchanged so the caller can escalate it.
    pub async fn run<F, Fut, T>(
        &self,
        token: &CancellationToken,
        mut operation: F,
    ) -> Result<T, DownloadError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !self.is_retryable(&err) || attempt >= max_attempts {
                return Err(err);
            }

            warn!(
                attempt,
                max = max_attempts,
                delay_ms = self.delay.as_millis() as u64,
                error = %err,
                "Retrying after transient error"
            );
            tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Classify a reqwest error as a connection-level hiccup worth retrying.
pub fn is_transient_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}
