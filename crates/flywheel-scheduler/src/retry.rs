use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::action::{ActionContext, ActionError, JobAction};
use crate::types::{CompletionStatus, RetryPolicy};

/// Exponential backoff state for one instance's retry sequence.
///
/// The k-th delay (k starting at 0) is `min(max_delay, base * 2^k)`, then a
/// uniform ±jitter fraction is applied and the result clamped non-negative.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            base: policy.base_delay,
            max: policy.max_delay,
            jitter: policy.jitter,
            attempt: 0,
        }
    }

    /// Delay before the next retry. Advances the internal attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt));
        let capped = exp.min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        self.apply_jitter(capped)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let range = delay.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-range..=range);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

/// Final outcome of driving one instance through its retry budget.
#[derive(Debug)]
pub struct RetryOutcome {
    pub status: CompletionStatus,
    /// Attempts actually made, including the successful or final one.
    pub attempts: u32,
    /// Error text of the last failed attempt.
    pub error: Option<String>,
}

/// Drive `action` until success, a fatal error, or the attempt budget is
/// spent. Backoff sleeps happen on the calling worker task only — other
/// workers and the tick loop are never stalled by a retrying job.
pub async fn run_with_retry(
    policy: &RetryPolicy,
    action: &dyn JobAction,
    ctx: &mut ActionContext,
) -> RetryOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = Backoff::new(policy);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        ctx.attempt = attempt;

        match action.execute(ctx).await {
            Ok(()) => {
                return RetryOutcome {
                    status: CompletionStatus::Succeeded,
                    attempts: attempt,
                    error: None,
                };
            }
            Err(ActionError::Fatal(reason)) => {
                return RetryOutcome {
                    status: CompletionStatus::Failed,
                    attempts: attempt,
                    error: Some(reason),
                };
            }
            Err(ActionError::Transient(reason)) => {
                if attempt >= max_attempts {
                    return RetryOutcome {
                        status: CompletionStatus::Failed,
                        attempts: attempt,
                        error: Some(reason),
                    };
                }
                let delay = backoff.next_delay();
                warn!(
                    job_id = %ctx.job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying: {reason}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
