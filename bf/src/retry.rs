//! Exponential backoff retry helpers.
//!
//! Two flavors cover the whole system: `with_retry` re-raises the final
//! error (critical paths like report LLM calls), `with_graceful_retry`
//! returns a caller-supplied default instead (non-critical paths like the
//! forum moderator, where one failing dependency must not take down the
//! run).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Backoff parameters for one retry policy
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Policy for main LLM calls: few long waits, providers rate-limit hard.
    pub fn llm() -> Self {
        Self {
            max_retries: 6,
            initial_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(600),
        }
    }

    /// Policy for auxiliary API calls (moderator, search).
    pub fn auxiliary() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 1.6,
            max_delay: Duration::from_secs(25),
        }
    }

    /// Policy for local store operations.
    pub fn store() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Delay before retry number `attempt` (0-based):
    /// `min(initial * factor^attempt, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `op` with exponential backoff, re-raising the last error on
/// exhaustion. Every error is considered retryable: LLM clients surface a
/// broad range of transport and provider failures, and the callers that
/// need finer discrimination use [`with_retry_if`].
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, label: &str, op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_if(config, label, |_| true, op).await
}

/// Run `op` with exponential backoff, retrying only errors accepted by
/// `is_retryable`. A rejected error is re-raised immediately.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    label: &str,
    is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(label, attempt = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !is_retryable(&e) => {
                warn!(label, error = %e, "non-retryable error");
                return Err(e);
            }
            Err(e) if attempt >= config.max_retries => {
                warn!(label, attempts = attempt + 1, error = %e, "retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_for(attempt);
                warn!(
                    label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Run `op` with exponential backoff; on exhaustion return `default`
/// instead of an error. The system keeps running.
pub async fn with_graceful_retry<T, E, F, Fut>(
    config: &RetryConfig,
    label: &str,
    default: T,
    op: F,
) -> T
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match with_retry(config, label, op).await {
        Ok(value) => value,
        Err(e) => {
            warn!(label, error = %e, "falling back to default after exhausted retries");
            debug!(label, "with_graceful_retry: returning default");
            default
        }
    }
}
