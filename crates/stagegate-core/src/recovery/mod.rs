//! Error recovery — bounded retry with failure classification.
//!
//! Handlers classify their own failures: `Transient` failures are retried
//! with exponential backoff up to the attempt budget, `Fatal` ones
//! escalate immediately. Exhausting the budget yields
//! `HaltedForReview`, which the coordinator surfaces as a blocking
//! condition for a human; the controller never auto-resolves a halt.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::registry::{HandlerOutput, StepContext, StepHandler};

/// How a step execution failed, as reported by the handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepFailure {
    /// Recoverable (rate limit, flaky upstream); eligible for retry.
    #[error("transient step failure: {0}")]
    Transient(String),

    /// Not worth retrying (bad input, missing capability).
    #[error("fatal step failure: {0}")]
    Fatal(String),
}

/// Retry policy: attempt budget plus exponential backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total execution attempts, first try included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub ceiling: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier,
            ceiling: Duration::from_millis(config.backoff_ceiling_ms),
        }
    }

    /// Override the attempt budget (per-step template setting).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Backoff delay before the given retry (attempt numbers start at 1;
    /// the delay is applied before attempts 2..=max).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2);
        let factor = self.multiplier.powi(exponent as i32);
        let raw_ms = (self.base_delay.as_millis() as f64) * factor;
        let capped = raw_ms.min(self.ceiling.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Terminal result of an execute-with-retry cycle.
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// The handler produced output on attempt `attempts`.
    Success {
        output: HandlerOutput,
        attempts: u32,
    },
    /// Transient failures exhausted the budget; a human has to look.
    HaltedForReview {
        attempts: u32,
        errors: Vec<String>,
    },
    /// A fatal failure stopped the cycle without retrying.
    Fatal { error: String, attempts: u32 },
}

/// Execute a step handler under the retry policy.
///
/// Only `Transient` failures are retried; the first `Fatal` failure ends
/// the cycle. The context's `attempt` field carries the 1-based attempt
/// number into the handler.
pub async fn execute_with_retry(
    handler: Arc<dyn StepHandler>,
    ctx: &StepContext,
    policy: &RetryPolicy,
) -> RecoveryOutcome {
    let mut errors: Vec<String> = Vec::new();

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            let delay = policy.delay_before(attempt);
            tracing::debug!(
                step = %ctx.step_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }

        let mut attempt_ctx = ctx.clone();
        attempt_ctx.attempt = attempt;

        match handler.execute(attempt_ctx).await {
            Ok(output) => {
                return RecoveryOutcome::Success { output, attempts: attempt };
            }
            Err(StepFailure::Transient(msg)) => {
                tracing::warn!(
                    step = %ctx.step_id,
                    attempt,
                    "transient failure: {}",
                    msg
                );
                errors.push(msg);
            }
            Err(StepFailure::Fatal(msg)) => {
                tracing::error!(step = %ctx.step_id, attempt, "fatal failure: {}", msg);
                return RecoveryOutcome::Fatal {
                    error: msg,
                    attempts: attempt,
                };
            }
        }
    }

    tracing::error!(
        step = %ctx.step_id,
        attempts = policy.max_attempts,
        "retry budget exhausted, halting for review"
    );
    RecoveryOutcome::HaltedForReview {
        attempts: policy.max_attempts,
        errors,
    }
}
