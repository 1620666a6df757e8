//! Retry executor.
//!
//! Wraps a single fallible exchange call in a bounded, fixed-delay retry
//! loop. The operation is re-invoked with identical parameters, so a call
//! that succeeded at the exchange but whose response was lost can be
//! submitted twice; callers accept that risk for loan/transfer/repay.

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::types::StepResult;

/// Default number of invocations per step.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default fixed delay between invocations.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(2000);

/// Fixed-delay retry policy.
///
/// `max_attempts` counts invocations, not retries: an operation that always
/// fails is called exactly `max_attempts` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next invocation after `last` failed.
    ///
    /// A `Retry-After` hint longer than the fixed backoff replaces it; the
    /// two are not added together.
    pub fn delay_after(&self, last: &StepResult) -> Duration {
        match last.retry_after() {
            Some(hint) => hint.max(self.backoff),
            None => self.backoff,
        }
    }
}

/// What the executor hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    /// The successful result, or the last failure unmodified.
    pub result: StepResult,
    /// Invocations issued, including the final one.
    pub attempts: u32,
}

impl RetryOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

/// Invoke `operation` until it succeeds or `policy.max_attempts` is spent.
///
/// Suspends (cooperatively) between attempts. Never loops past the bound,
/// even for a zero `max_attempts`, which is treated as one attempt.
pub async fn execute_with_retry<F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> RetryOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StepResult>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        info!(step = label, attempt, max_attempts, "Attempting exchange call");
        let result = operation().await;

        match &result {
            StepResult::Success { transaction_id } => {
                info!(step = label, attempt, tran_id = %transaction_id, "Exchange call succeeded");
                return RetryOutcome {
                    result,
                    attempts: attempt,
                };
            }
            StepResult::Failure(failure) => {
                warn!(
                    step = label,
                    attempt,
                    max_attempts,
                    http_status = ?failure.http_status,
                    code = result.error_code().unwrap_or("-"),
                    rate_limited = failure.is_rate_limited(),
                    message = %failure.message,
                    "Exchange call failed"
                );
            }
        }

        if attempt >= max_attempts {
            return RetryOutcome {
                result,
                attempts: attempt,
            };
        }

        let delay = policy.delay_after(&result);
        info!(
            step = label,
            delay_ms = delay.as_millis() as u64,
            next_attempt = attempt + 1,
            "Backing off before retry"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
