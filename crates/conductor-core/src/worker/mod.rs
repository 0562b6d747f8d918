//! Worker contract: the only boundary business logic plugs into.
//!
//! Every stage of a workflow names a `worker_id`; the scheduler looks the
//! implementation up in a [`WorkerRegistry`] and drives it through the
//! contract below:
//!
//! ```text
//! validate(input) ──► Err ──► stage failed (validation_error, never retried)
//!        │
//!        ▼ Ok
//! execute(input, ctx) ──► WorkerResult ──► normalized by the scheduler
//!        │
//!        └─ deadline exceeded ──► task aborted, timeout result synthesized
//! ```
//!
//! Workers may have arbitrary side effects. They are expected to watch
//! `ctx.cancel` / `ctx.deadline` and stop early; if they don't, the
//! scheduler aborts the task that runs them.

pub mod circuit_breaker;
pub mod registry;
pub mod result;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ValidationError;
use crate::workflow::recovery::RecoveryPolicy;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpen, CircuitState};
pub use registry::{WorkerHandle, WorkerHealth, WorkerOptions, WorkerRegistry, WorkerStats};
pub use result::WorkerResult;

/// Per-attempt information handed to [`Worker::execute`].
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Name of the stage being executed.
    pub stage: String,
    /// 1-based attempt number (1 = initial attempt).
    pub attempt: u32,
    /// Point in time after which the scheduler will abort the attempt.
    pub deadline: Instant,
    /// Fires on deadline expiry, workflow cancellation, or global timeout.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Contract every stage implementation satisfies.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable identifier used for logging.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str {
        self.id()
    }

    /// Cheap, synchronous structural check of the stage input. The default
    /// rejects only a `null` input.
    fn validate(&self, input: &Value) -> Result<(), ValidationError> {
        if input.is_null() {
            return Err(ValidationError::new("input is null"));
        }
        Ok(())
    }

    /// Perform the unit of work.
    async fn execute(&self, input: Value, ctx: ExecutionContext) -> WorkerResult;

    /// Relax the input for a `degraded_requirements` retry. `None` means
    /// the worker cannot degrade any further and recovery is exhausted.
    fn degrade(&self, _input: &Value, _attempt: u32) -> Option<Value> {
        None
    }

    /// Retry strategy for failures of this worker.
    fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy::None
    }

    /// Weight applied to this worker's confidence in the overall verdict.
    fn confidence_weight(&self) -> f64 {
        1.0
    }
}
