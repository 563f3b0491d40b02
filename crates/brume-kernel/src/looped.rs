//! Retry driver with explicit failure classification.
//!
//! An attempt returns `Err(Looped::Retry(e))` for a transient fault worth
//! another try after a backoff, `Err(Looped::Skip(e))` for a non-fatal miss
//! that is retried immediately, and `Err(Looped::Cancel(e))` to stop the loop
//! at once. [`try_loop`] interprets the classification and surfaces the last
//! error when attempts run out.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::constants::{RETRY_BASE_DELAY, RETRY_MAX_ATTEMPTS, RETRY_MAX_DELAY};

/// How an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Looped<E> {
    /// Transient: back off, then try again (usually with another resource).
    Retry(E),
    /// Terminal: abort the whole loop.
    Cancel(E),
    /// Non-fatal: move on to the next attempt without waiting.
    Skip(E),
}

impl<E> Looped<E> {
    pub fn into_inner(self) -> E {
        match self {
            Looped::Retry(e) | Looped::Cancel(e) | Looped::Skip(e) => e,
        }
    }

    pub fn map<F, U>(self, f: F) -> Looped<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            Looped::Retry(e) => Looped::Retry(f(e)),
            Looped::Cancel(e) => Looped::Cancel(f(e)),
            Looped::Skip(e) => Looped::Skip(f(e)),
        }
    }
}

/// Why a loop gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError<E> {
    #[error("cancelled: {0}")]
    Cancelled(E),

    #[error("too many retries: {0}")]
    TooManyRetries(E),
}

impl<E> LoopError<E> {
    /// The error of the attempt that ended the loop.
    pub fn into_inner(self) -> E {
        match self {
            LoopError::Cancelled(e) | LoopError::TooManyRetries(e) => e,
        }
    }
}

/// Bounds of a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_delay: RETRY_BASE_DELAY,
            max_delay: RETRY_MAX_DELAY,
        }
    }
}

impl RetrySettings {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts, base_delay: Duration::ZERO, max_delay: Duration::ZERO }
    }

    /// Exponential backoff: base, 2×base, 4×base, ... capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `attempt` until it succeeds, is cancelled, or attempts run out.
///
/// The closure receives the zero-based attempt number.
pub async fn try_loop<T, E, F, Fut>(settings: &RetrySettings, mut attempt: F) -> Result<T, LoopError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Looped<E>>>,
{
    let max_attempts = settings.max_attempts.max(1);
    let mut i = 0;

    loop {
        let failure = match attempt(i).await {
            Ok(value) => return Ok(value),
            Err(Looped::Cancel(e)) => return Err(LoopError::Cancelled(e)),
            Err(failure) => failure,
        };

        i += 1;
        if i >= max_attempts {
            return Err(LoopError::TooManyRetries(failure.into_inner()));
        }

        if let Looped::Retry(_) = failure {
            let delay = settings.backoff_delay(i - 1);
            debug!(attempt = i, delay_ms = delay.as_millis() as u64, "retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = RetrySettings::default();
        assert_eq!(settings.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(settings.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(settings.backoff_delay(4), Duration::from_secs(16));
        assert_eq!(settings.backoff_delay(5), Duration::from_secs(30));
        assert_eq!(settings.backoff_delay(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, LoopError<&str>> = try_loop(&RetrySettings::immediate(3), |i| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { if i < 2 { Err(Looped::Retry("flaky")) } else { Ok(i) } }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), LoopError<&str>> = try_loop(&RetrySettings::immediate(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Looped::Cancel("fatal")) }
        })
        .await;
        assert_eq!(result, Err(LoopError::Cancelled("fatal")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let result: Result<(), LoopError<u32>> =
            try_loop(&RetrySettings::immediate(3), |i| async move { Err(Looped::Skip(i)) }).await;
        assert_eq!(result, Err(LoopError::TooManyRetries(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_backoff() {
        let settings = RetrySettings {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        };
        let start = tokio::time::Instant::now();
        let _: Result<(), LoopError<()>> = try_loop(&settings, |_| async { Err(Looped::Retry(())) }).await;
        // 1s after the first failure, 2s after the second, none after the last
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }
}
