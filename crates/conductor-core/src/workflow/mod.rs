//! Workflow engine: dependency-aware execution of stage templates.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► WorkflowTemplate ──► TaskGraph ──► ExecutionPlan (waves)
//!                                                          │
//!                         WorkerRegistry ──────────────► Scheduler ◄── RecoveryPolicy
//!                                                          │
//!                                              QualityGateValidator
//!                                                          │
//!                                               WorkflowAggregator
//!                                                          │
//!                                                  WorkflowInstance
//! ```

pub mod aggregator;
pub mod gates;
pub mod graph;
pub mod instance;
pub mod recovery;
pub mod scheduler;
pub mod schema;

pub use aggregator::{Bottleneck, Impact, QualityDistribution, WorkflowAggregator, WorkflowReport};
pub use gates::{GateMetric, GateOutcome, QualityGateValidator};
pub use graph::{BrokenEdge, ExecutionPlan, TaskGraph};
pub use instance::{StageState, WorkflowInstance, WorkflowStatus};
pub use recovery::{RecoveryPolicy, RetryPlan, StageFailure};
pub use scheduler::{RunOptions, Scheduler};
pub use schema::{Priority, QualityGateSpec, StageSpec, WorkflowTemplate};
