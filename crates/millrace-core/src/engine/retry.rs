//! Attempt-counted retry loop for tool invocations.
//!
//! The controller owns only the counting and the sleeping; recording each
//! attempt is left to the attempt closure so every attempt gets its own
//! `StepRun`.

use std::future::Future;

use millrace_types::flow::RetryPolicy;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Ok(Value),
    Err(String),
    Cancelled,
}

/// Result of the whole retry loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Succeeded { output: Value, attempts: u32 },
    /// Every attempt failed; carries the last error.
    Failed { error: String, attempts: u32 },
    Cancelled { attempts: u32 },
}

/// Stateless retry driver.
pub struct RetryController;

impl RetryController {
    /// Total attempts allowed; a step without a policy gets exactly one.
    pub fn max_attempts(policy: Option<&RetryPolicy>) -> u32 {
        policy.map(|p| p.attempts.max(1)).unwrap_or(1)
    }

    /// Whether another attempt follows a failure of `attempt` (1-based).
    pub fn should_retry(policy: Option<&RetryPolicy>, attempt: u32) -> bool {
        attempt < Self::max_attempts(policy)
    }

    /// Invoke `attempt_fn` until it succeeds, the attempts run out, or the
    /// token is cancelled. Delays between attempts follow the policy's
    /// backoff and are cut short by cancellation.
    pub async fn run<F, Fut>(
        policy: Option<&RetryPolicy>,
        cancel: &CancellationToken,
        step: &str,
        mut attempt_fn: F,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptResult>,
    {
        let max = Self::max_attempts(policy);
        let mut attempt = 1;
        loop {
            match attempt_fn(attempt).await {
                AttemptResult::Ok(output) => {
                    return RetryOutcome::Succeeded {
                        output,
                        attempts: attempt,
                    };
                }
                AttemptResult::Cancelled => return RetryOutcome::Cancelled { attempts: attempt },
                AttemptResult::Err(error) => {
                    if attempt >= max {
                        return RetryOutcome::Failed {
                            error,
                            attempts: attempt,
                        };
                    }

                    let delay = policy.map(|p| p.delay_after(attempt)).unwrap_or_default();
                    tracing::warn!(
                        step,
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "step attempt failed, retrying"
                    );

                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return RetryOutcome::Cancelled { attempts: attempt };
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    if cancel.is_cancelled() {
                        return RetryOutcome::Cancelled { attempts: attempt };
                    }
                    attempt += 1;
                }
            }
        }
    }
}
