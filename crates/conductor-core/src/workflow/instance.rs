//! One execution of a workflow template.
//!
//! The instance is created by the scheduler when a run starts and is
//! written only by the orchestrating control flow. Once its status is
//! `Completed` or `Failed` it is handed to the caller and never mutated
//! again, so all public access is read-only.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ErrorRecord};
use crate::worker::WorkerResult;
use crate::workflow::aggregator::WorkflowReport;
use crate::workflow::gates::GateOutcome;
use crate::workflow::graph::ExecutionPlan;
use crate::workflow::schema::WorkflowTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initialized,
    Running,
    /// The scheduler finished every reachable stage.
    Completed,
    /// The run could not start.
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Running its n-th retry.
    Retried(u32),
    Skipped,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Retried(n) => write!(f, "retried({})", n),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowInstance {
    id: String,
    #[serde(skip)]
    template: Arc<WorkflowTemplate>,
    template_name: String,
    status: WorkflowStatus,
    stage_state: BTreeMap<String, StageState>,
    results: BTreeMap<String, WorkerResult>,
    quality_gate_outcomes: BTreeMap<String, GateOutcome>,
    errors: Vec<ErrorRecord>,
    #[serde(with = "crate::duration_ms::map")]
    timings: BTreeMap<String, Duration>,
    retries: BTreeMap<String, u32>,
    plan: ExecutionPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<WorkflowReport>,
    started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub(crate) fn new(template: Arc<WorkflowTemplate>) -> Self {
        let stage_state = template
            .stages
            .iter()
            .map(|s| (s.name.clone(), StageState::Pending))
            .collect();
        Self {
            id: generate_instance_id(),
            template_name: template.name.clone(),
            template,
            status: WorkflowStatus::Initialized,
            stage_state,
            results: BTreeMap::new(),
            quality_gate_outcomes: BTreeMap::new(),
            errors: Vec::new(),
            timings: BTreeMap::new(),
            retries: BTreeMap::new(),
            plan: ExecutionPlan::default(),
            report: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    // ─── Read access ────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template(&self) -> &WorkflowTemplate {
        &self.template
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn stage_state(&self, stage: &str) -> Option<StageState> {
        self.stage_state.get(stage).copied()
    }

    pub fn stage_states(&self) -> &BTreeMap<String, StageState> {
        &self.stage_state
    }

    pub fn result(&self, stage: &str) -> Option<&WorkerResult> {
        self.results.get(stage)
    }

    pub fn results(&self) -> &BTreeMap<String, WorkerResult> {
        &self.results
    }

    pub fn gate_outcome(&self, stage: &str) -> Option<&GateOutcome> {
        self.quality_gate_outcomes.get(stage)
    }

    pub fn gate_outcomes(&self) -> &BTreeMap<String, GateOutcome> {
        &self.quality_gate_outcomes
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn errors_of_kind(&self, kind: ErrorKind) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }

    pub fn timing(&self, stage: &str) -> Option<Duration> {
        self.timings.get(stage).copied()
    }

    pub fn timings(&self) -> &BTreeMap<String, Duration> {
        &self.timings
    }

    /// Retries performed for `stage` (0 when it never retried).
    pub fn retries(&self, stage: &str) -> u32 {
        self.retries.get(stage).copied().unwrap_or(0)
    }

    pub fn retry_counts(&self) -> &BTreeMap<String, u32> {
        &self.retries
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn report(&self) -> Option<&WorkflowReport> {
        self.report.as_ref()
    }

    /// `false` when the run failed to start or produced no report.
    pub fn overall_success(&self) -> bool {
        self.report.as_ref().is_some_and(|r| r.overall_success)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn to_json_pretty(&self) -> crate::error::Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::CoordinationError::Parse(e.to_string()))
    }

    // ─── Orchestrator-only mutation ─────────────────────────────────────

    pub(crate) fn set_status(&mut self, status: WorkflowStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub(crate) fn set_plan(&mut self, plan: ExecutionPlan) {
        self.plan = plan;
    }

    pub(crate) fn set_stage_state(&mut self, stage: &str, state: StageState) {
        if let Some(current) = self.stage_state.get_mut(stage) {
            *current = state;
        }
    }

    pub(crate) fn record_result(&mut self, stage: &str, result: WorkerResult) {
        self.results.insert(stage.to_string(), result);
    }

    pub(crate) fn record_gate(&mut self, stage: &str, outcome: GateOutcome) {
        self.quality_gate_outcomes.insert(stage.to_string(), outcome);
    }

    pub(crate) fn record_error(&mut self, error: ErrorRecord) {
        self.errors.push(error);
    }

    pub(crate) fn record_timing(&mut self, stage: &str, elapsed: Duration) {
        self.timings.insert(stage.to_string(), elapsed);
    }

    pub(crate) fn record_retries(&mut self, stage: &str, retries: u32) {
        if retries > 0 {
            self.retries.insert(stage.to_string(), retries);
        }
    }

    pub(crate) fn set_report(&mut self, report: WorkflowReport) {
        self.report = Some(report);
    }
}

/// `wf_<UTC timestamp>_<8 hex chars>`.
fn generate_instance_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "wf_{}_{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        &suffix[..8]
    )
}
