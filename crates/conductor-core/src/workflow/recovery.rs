//! Recovery policy: whether and how a failed stage is retried.
//!
//! The policy belongs to the worker (retry behaviour is a property of the
//! implementation), the retry budget to the stage. The effective budget is
//! the smaller of the two.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::worker::Worker;
use crate::workflow::schema::StageSpec;

// ─── Policy ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// First failure is final.
    #[default]
    None,
    /// Retry the same input, sleeping `base_ms * 2^n` before the n-th retry
    /// (n starting at 0).
    BoundedBackoff { base_ms: u64, max_retries: u32 },
    /// Retry with an input relaxed by [`Worker::degrade`].
    DegradedRequirements { max_retries: u32 },
}

/// What the scheduler should do next after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPlan {
    /// Input for the next attempt.
    pub input: Value,
    /// Sleep before the next attempt.
    pub delay: Duration,
}

/// A failed attempt as seen by the recovery policy.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
}

impl RecoveryPolicy {
    pub fn bounded_backoff(base: Duration, max_retries: u32) -> Self {
        Self::BoundedBackoff {
            base_ms: base.as_millis() as u64,
            max_retries,
        }
    }

    pub fn degraded(max_retries: u32) -> Self {
        Self::DegradedRequirements { max_retries }
    }

    /// Retries the worker declares it can make.
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::BoundedBackoff { max_retries, .. } => *max_retries,
            Self::DegradedRequirements { max_retries } => *max_retries,
        }
    }

    /// `min(stage.max_retries, worker max_retries)`.
    pub fn retry_budget(&self, stage: &StageSpec) -> u32 {
        stage.max_retries.min(self.max_retries())
    }

    /// Delay before retry number `retry_index` (0-based), capped at `max`.
    pub fn backoff(&self, retry_index: u32, max: Duration) -> Duration {
        match self {
            Self::BoundedBackoff { base_ms, .. } => {
                let factor = 1u64.checked_shl(retry_index).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor)).min(max)
            }
            _ => Duration::ZERO,
        }
    }

    /// Decide on a retry after `failure`. `None` means recovery is
    /// exhausted and the stage's failure is final.
    pub fn attempt_recovery(
        &self,
        stage: &StageSpec,
        failure: &StageFailure,
        input: &Value,
        worker: &dyn Worker,
        max_backoff: Duration,
    ) -> Option<RetryPlan> {
        if !failure.kind.is_retryable() {
            return None;
        }

        let budget = self.retry_budget(stage);
        let retries_used = failure.attempt.saturating_sub(1);
        if retries_used >= budget {
            tracing::debug!(
                "[Recovery] {} exhausted after {} attempt(s) (budget {})",
                stage.name,
                failure.attempt,
                budget
            );
            return None;
        }

        let plan = match self {
            Self::None => None,
            Self::BoundedBackoff { .. } => Some(RetryPlan {
                input: input.clone(),
                delay: self.backoff(retries_used, max_backoff),
            }),
            Self::DegradedRequirements { .. } => {
                worker.degrade(input, failure.attempt).map(|relaxed| RetryPlan {
                    input: relaxed,
                    delay: Duration::ZERO,
                })
            }
        };

        match &plan {
            Some(p) => tracing::info!(
                "[Recovery] {} retry {}/{} after {}: {} (delay {}ms)",
                stage.name,
                retries_used + 1,
                budget,
                failure.kind,
                failure.message,
                p.delay.as_millis()
            ),
            None => tracing::debug!("[Recovery] {} has no further recovery", stage.name),
        }
        plan
    }
}
