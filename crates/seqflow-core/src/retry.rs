//! Fixed-backoff retry for transient backend errors.
//!
//! Broker submission, job status polling and cluster pool startup can all
//! fail because a remote service is briefly unreachable. Those operations are
//! wrapped in `retry_transient`, which re-runs them while the error reports
//! itself as transient and the attempt budget lasts. Stage failures are never
//! retried here.

use std::future::Future;

use seqflow_types::config::RetryPolicy;
use tokio_util::sync::CancellationToken;

/// Errors that can tell whether a retry might succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Stateless retry decisions.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed.
    ///
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < policy.max_attempts
    }
}

/// Run `op` until it succeeds, fails permanently or the budget runs out.
///
/// Cancellation during a backoff sleep returns the last error immediately.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && RetryHandler::should_retry(policy, attempt) => {
                tracing::warn!(
                    operation = what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(policy.backoff()) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
