//! Shared retry policy for transient failures.
//!
//! One policy object is injected into the sync manager and the transport
//! instead of each module growing its own retry loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier between retries.
    pub multiplier: f64,
    /// Ceiling for any single delay, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    /// Delays to sleep between attempts. Yields `max_attempts - 1` entries.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let initial = self.initial_backoff_ms as f64;
        let cap = self.max_backoff_ms as f64;
        let multiplier = self.multiplier;
        (0..self.max_attempts.saturating_sub(1)).map(move |attempt| {
            let ms = (initial * multiplier.powi(attempt as i32)).min(cap);
            Duration::from_millis(ms as u64)
        })
    }

    /// Run `op` until it succeeds or attempts are exhausted.
    ///
    /// Sleeps the backoff delay between attempts and logs each retry.
    ///
    /// # Errors
    /// Returns the last error once all attempts are exhausted.
    pub async fn run<F, Fut, T, E>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut delays = self.delays();
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match delays.next() {
                    Some(delay) => {
                        tracing::warn!(%err, attempt, ?delay, "{label} failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        tracing::warn!(%err, attempt, "{label} failed, retries exhausted");
                        return Err(err);
                    }
                },
            }
        }
    }
}
