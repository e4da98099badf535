//! Retries with exponential backoff for calls to remote services.
//!
//! Errors opt in by implementing [`Retryable`]. A server that names its own
//! wait (e.g. `Retry-After` on a 429) is honoured when that wait is longer
//! than the computed backoff, up to `max_backoff`.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Wait the remote side asked for before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each wait.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self::with_max_retries(0)
    }

    /// Short waits for interactive paths.
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let scaled = self
            .initial_backoff
            .mul_f64(self.backoff_multiplier.powi(attempt as i32));
        let base = scaled.min(self.max_backoff);

        if !self.add_jitter {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..0.25);
        base + base.mul_f64(factor)
    }

    /// Wait before retry number `attempt + 1` after `err`.
    fn delay_for<E: Retryable>(&self, attempt: u32, err: &E) -> Duration {
        let computed = self.backoff_duration(attempt);
        match err.retry_after() {
            Some(requested) => computed.max(requested.min(self.max_backoff)),
            None => computed,
        }
    }
}

/// Run `f` until it succeeds, fails permanently or runs out of retries.
///
/// Only use this for calls that are safe to repeat: reads, or writes that
/// carry an idempotency key.
pub async fn retry_call<F, Fut, T, E>(config: &RetryConfig, operation_name: &str, f: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        let err = match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempts = attempt + 1, "Call succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= config.max_retries {
            warn!(
                operation = operation_name,
                attempts = attempt + 1,
                retryable = err.is_retryable(),
                error = %err,
                "Call failed, giving up"
            );
            return Err(err);
        }

        let delay = config.delay_for(attempt, &err);
        warn!(
            operation = operation_name,
            attempt = attempt + 1,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Call failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
