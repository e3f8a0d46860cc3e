//! Bounded retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Maximum number of attempts, the first one included.
pub const MAX_RETRIES: u32 = 3;

/// Initial backoff duration for retries (doubles with each attempt).
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff duration for retries.
pub const MAX_BACKOFF_MS: u64 = 5000;

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    /// Pause after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound for the pause.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

/// The last error of a retried operation and how many attempts were made.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Error returned by the final attempt.
    pub error: E,
    /// Attempts made.
    pub attempts: u32,
}

impl RetryPolicy {
    /// A policy with `max_attempts` and the default backoff.
    #[must_use]
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the final error with the number of attempts made.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        operation: &str,
        mut op: F,
        is_retryable: R,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;

                    if attempt >= self.max_attempts || !is_retryable(&e) {
                        tracing::warn!(
                            operation = %operation,
                            attempt = %attempt,
                            error = %e,
                            "Operation failed, giving up"
                        );
                        return Err(Exhausted {
                            error: e,
                            attempts: attempt,
                        });
                    }

                    tracing::debug!(
                        operation = %operation,
                        attempt = %attempt,
                        backoff_ms = %backoff.as_millis(),
                        error = %e,
                        "Operation failed, retrying"
                    );

                    tokio::time::sleep(backoff).await;

                    // Exponential backoff with cap
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }
    }
}
