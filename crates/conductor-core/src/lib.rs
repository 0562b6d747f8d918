//! Conductor Core: dependency-aware coordination of pluggable workers.
//!
//! A workflow template declares named stages, the worker each one runs on,
//! their priorities, dependencies, and quality gates. The [`Scheduler`]
//! layers the stages into waves, runs each wave concurrently against the
//! injected [`WorkerRegistry`], retries failures per the worker's
//! [`RecoveryPolicy`], and folds the outcome into a [`WorkflowReport`].
//!
//! Business logic lives entirely behind the [`Worker`] trait; this crate
//! has no knowledge of what a stage actually does.
//!
//! ```no_run
//! use std::sync::Arc;
//! use conductor_core::{CoordinatorConfig, RunOptions, Scheduler, WorkerRegistry, WorkflowTemplate};
//!
//! # async fn demo(registry: WorkerRegistry) -> conductor_core::Result<()> {
//! let template = WorkflowTemplate::from_file("resume.yaml")?;
//! let scheduler = Scheduler::new(Arc::new(registry), CoordinatorConfig::default());
//! let instance = scheduler
//!     .run(template, serde_json::json!({"document": "cv.pdf"}), RunOptions::default())
//!     .await;
//! println!("{}", instance.to_json_pretty()?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub(crate) mod duration_ms;
pub mod error;
pub mod worker;
pub mod workflow;

// Convenience re-exports
pub use config::{AggregationConfig, CoordinatorConfig};
pub use error::{CoordinationError, ErrorKind, ErrorRecord, Result, ValidationError};
pub use worker::{
    CircuitBreakerConfig, ExecutionContext, Worker, WorkerOptions, WorkerRegistry, WorkerResult,
};
pub use workflow::{
    ExecutionPlan, GateOutcome, Priority, QualityGateSpec, RecoveryPolicy, RunOptions, Scheduler,
    StageSpec, StageState, TaskGraph, WorkflowInstance, WorkflowReport, WorkflowStatus,
    WorkflowTemplate,
};
