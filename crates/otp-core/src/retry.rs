//! Retry policy for provider calls and per-account cooldowns.

use crate::config::RetryConfig;
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use telephony_client::ProviderError;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Exponential backoff around a provider call.
///
/// Only rate-limit and transient errors are retried. Funding exhaustion
/// and invalid requests return on the first failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    warn!("{} failed after {} attempts: {}", operation, attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("{} failed (attempt {}): {}", operation, attempt, e);
                }
            }

            debug!("Retrying {} after {:?} backoff", operation, backoff);
            sleep(backoff).await;
            // Exponential backoff with cap
            backoff = (backoff * 2).min(self.max_backoff);
            attempt += 1;
        }
    }

    /// Same as [`run`](Self::run) with the error mapped into the engine taxonomy.
    pub async fn call<T, F, Fut>(&self, operation: &str, op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.run(operation, op).await.map_err(EngineError::from)
    }
}

/// Time left before `window` has elapsed since `last`, if any.
pub fn cooldown_remaining(
    last: Option<DateTime<Utc>>,
    window: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let elapsed = now.signed_duration_since(last?).to_std().unwrap_or(Duration::ZERO);
    window.checked_sub(elapsed).filter(|d| !d.is_zero())
}

/// Fail with `CooldownActive` while the window is open.
pub fn check_cooldown(
    last: Option<DateTime<Utc>>,
    window: Duration,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    match cooldown_remaining(last, window, now) {
        Some(remaining) => Err(EngineError::CooldownActive { remaining }),
        None => Ok(()),
    }
}
