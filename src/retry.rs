//! Shared retry helper for transport connects.
//!
//! Session and broker connects retry through this single helper so timing
//! edge cases are testable in one place. The wait between attempts is fixed;
//! callers that need backoff growth can layer it via the policy.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// `None` retries forever (broker connects from agents).
    pub attempts: Option<u32>,
    pub wait: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn bounded(attempts: u32, wait: Duration) -> Self {
        Self {
            attempts: Some(attempts),
            wait,
        }
    }

    #[must_use]
    pub const fn unbounded(wait: Duration) -> Self {
        Self {
            attempts: None,
            wait,
        }
    }
}

/// Runs `op` until it succeeds or the attempt budget is exhausted.
///
/// The final error is returned unchanged; intermediate failures are logged
/// at debug level with the attempt count.
///
/// # Errors
///
/// Returns the last error once `policy.attempts` attempts have failed.
pub async fn retry<TValue, TError, TOp, TFut>(
    policy: RetryPolicy,
    label: &str,
    mut op: TOp,
) -> Result<TValue, TError>
where
    TOp: FnMut() -> TFut,
    TFut: Future<Output = Result<TValue, TError>>,
    TError: Display,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                if let Some(max_attempts) = policy.attempts
                    && attempt >= max_attempts
                {
                    return Err(err);
                }
                debug!("{} attempt {} failed: {}", label, attempt, err);
            }
        }
        tokio::time::sleep(policy.wait).await;
    }
}
