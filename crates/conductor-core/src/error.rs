//! Error types for the coordination core.
//!
//! `CoordinationError` covers everything that can go wrong *before* a stage
//! runs (template authoring, registry lookups, configuration). Failures that
//! happen while a workflow is running never surface as `Err`. They are
//! recorded on the `WorkflowInstance` as [`ErrorRecord`]s tagged with an
//! [`ErrorKind`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("Invalid template: {}", .0.join("; "))]
    InvalidTemplate(Vec<String>),

    #[error("Stage '{stage}' references unknown worker '{worker_id}'")]
    UnknownWorker { stage: String, worker_id: String },

    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Structural rejection of a stage input by [`crate::worker::Worker::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .messages.join("; "))]
pub struct ValidationError {
    pub messages: Vec<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }

    pub fn from_messages(messages: Vec<String>) -> Self {
        Self { messages }
    }
}

/// Classification of every error recorded during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Stage input rejected by the worker's `validate`; never retried.
    ValidationError,
    /// Attempt exceeded the stage timeout.
    TimeoutError,
    /// Worker reported failure, panicked, or its circuit was open.
    WorkerInternalError,
    /// Stage succeeded but its gate metric fell below threshold.
    QualityGateMiss,
    /// A dependency failed or was skipped, so the stage was skipped.
    DependencyFailure,
    /// A dependency edge was dropped to break a cycle.
    CycleBreakWarning,
    /// In-flight attempt interrupted by workflow cancellation or global timeout.
    Cancelled,
    /// The run could not start (invalid template, unknown worker, bad input).
    TemplateError,
}

impl ErrorKind {
    /// Whether the recovery policy may retry a failure of this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TimeoutError | Self::WorkerInternalError)
    }

    /// Informational kinds do not represent a stage failure.
    pub fn is_informational(self) -> bool {
        matches!(self, Self::QualityGateMiss | Self::CycleBreakWarning)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ValidationError => "validation_error",
            Self::TimeoutError => "timeout_error",
            Self::WorkerInternalError => "worker_internal_error",
            Self::QualityGateMiss => "quality_gate_miss",
            Self::DependencyFailure => "dependency_failure",
            Self::CycleBreakWarning => "cycle_break_warning",
            Self::Cancelled => "cancelled",
            Self::TemplateError => "template_error",
        };
        f.write_str(s)
    }
}

/// One entry in a workflow instance's ordered error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    /// 1-based attempt number for execution failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(stage: Option<&str>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage: stage.map(str::to_string),
            kind,
            message: message.into(),
            attempt: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_stage(stage: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(Some(stage), kind, message)
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_template_joins_messages() {
        let err = CoordinationError::InvalidTemplate(vec![
            "duplicate stage 'a'".into(),
            "stage 'b' depends on unknown stage 'z'".into(),
        ]);
        assert_eq!(
            err.to_string(),
            "Invalid template: duplicate stage 'a'; stage 'b' depends on unknown stage 'z'"
        );
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::TimeoutError.is_retryable());
        assert!(ErrorKind::WorkerInternalError.is_retryable());
        assert!(!ErrorKind::ValidationError.is_retryable());
        assert!(!ErrorKind::DependencyFailure.is_retryable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CycleBreakWarning).unwrap();
        assert_eq!(json, "\"cycle_break_warning\"");
        assert_eq!(ErrorKind::TimeoutError.to_string(), "timeout_error");
    }
}
