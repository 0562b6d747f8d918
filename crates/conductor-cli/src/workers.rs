//! Simulated workers for dry-running templates from the command line.
//!
//! ```yaml
//! workers:
//!   ocr:
//!     confidence: 0.85
//!     delay_ms: 200
//!     metadata: { text_length: 1834 }
//!   parser:
//!     fail_attempts: 1          # first attempt fails, the retry succeeds
//!     recovery:
//!       bounded_backoff: { base_ms: 100, max_retries: 2 }
//!   skill_analysis:
//!     fail_mode: timeout
//!     fail_attempts: 1
//!     required_fields: [parse_result]
//!     weight: 0.9
//! ```
//!
//! Any `worker_id` a template uses but the file does not list gets a
//! default simulated worker (confidence 0.9, no delay, never fails).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::{
    CircuitBreakerConfig, ExecutionContext, RecoveryPolicy, ValidationError, Worker,
    WorkerOptions, WorkerRegistry, WorkerResult, WorkflowTemplate,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Return a failed result.
    #[default]
    Error,
    /// Block until the stage deadline (or cancellation) ends the attempt.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedWorkerSpec {
    pub confidence: f64,
    pub delay_ms: u64,
    /// Number of initial attempts that fail.
    pub fail_attempts: u32,
    pub fail_mode: FailMode,
    pub metadata: serde_json::Map<String, Value>,
    pub required_fields: Vec<String>,
    pub recovery: Option<RecoveryPolicy>,
    pub weight: Option<f64>,
}

impl Default for SimulatedWorkerSpec {
    fn default() -> Self {
        Self {
            confidence: 0.9,
            delay_ms: 0,
            fail_attempts: 0,
            fail_mode: FailMode::Error,
            metadata: serde_json::Map::new(),
            required_fields: Vec::new(),
            recovery: None,
            weight: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkersFile {
    #[serde(default)]
    pub workers: BTreeMap<String, SimulatedWorkerSpec>,
}

impl WorkersFile {
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse workers YAML: {}", e))
    }

    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read workers file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }
}

pub struct SimulatedWorker {
    id: String,
    spec: SimulatedWorkerSpec,
    calls: AtomicU32,
}

impl SimulatedWorker {
    pub fn new(id: impl Into<String>, spec: SimulatedWorkerSpec) -> Self {
        Self {
            id: id.into(),
            spec,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for SimulatedWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self, input: &Value) -> Result<(), ValidationError> {
        let missing: Vec<String> = self
            .spec
            .required_fields
            .iter()
            .filter(|f| input.get(f.as_str()).map_or(true, Value::is_null))
            .map(|f| format!("missing required field '{}'", f))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::from_messages(missing))
        }
    }

    async fn execute(&self, input: Value, ctx: ExecutionContext) -> WorkerResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("[Simulated] {} executing {} (call {})", self.id, ctx.stage, call);

        if self.spec.delay_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.spec.delay_ms)) => {}
                _ = ctx.cancel.cancelled() => return WorkerResult::failure("interrupted"),
            }
        }

        if call <= self.spec.fail_attempts {
            return match self.spec.fail_mode {
                FailMode::Error => {
                    WorkerResult::failure(format!("{} simulated failure on call {}", self.id, call))
                }
                FailMode::Timeout => {
                    ctx.cancel.cancelled().await;
                    WorkerResult::failure("interrupted")
                }
            };
        }

        let mut result = WorkerResult::success(
            json!({
                "worker": self.id,
                "stage": ctx.stage,
                "attempt": ctx.attempt,
                "degraded": input.get("degraded").cloned().unwrap_or(Value::Bool(false)),
            }),
            self.spec.confidence,
        );
        for (k, v) in &self.spec.metadata {
            result = result.with_metadata(k.clone(), v.clone());
        }
        result
    }

    fn degrade(&self, input: &Value, attempt: u32) -> Option<Value> {
        let mut relaxed = input.clone();
        let obj = relaxed.as_object_mut()?;
        obj.insert("degraded".to_string(), Value::Bool(true));
        obj.insert("degrade_level".to_string(), json!(attempt));
        Some(relaxed)
    }

    fn recovery_policy(&self) -> RecoveryPolicy {
        self.spec.recovery.clone().unwrap_or_default()
    }

    fn confidence_weight(&self) -> f64 {
        self.spec.weight.unwrap_or(1.0)
    }
}

/// Registry with one simulated worker per id listed in `workers` or used
/// by `template`.
pub fn build_registry(
    template: &WorkflowTemplate,
    workers: &WorkersFile,
    circuit_breaker: Option<CircuitBreakerConfig>,
) -> Result<WorkerRegistry, String> {
    let mut registry = match circuit_breaker {
        Some(cfg) => WorkerRegistry::with_circuit_breaker(cfg),
        None => WorkerRegistry::new(),
    };

    let ids: BTreeSet<&str> = workers
        .workers
        .keys()
        .map(String::as_str)
        .chain(template.stages.iter().map(|s| s.worker_id.as_str()))
        .filter(|id| !id.trim().is_empty())
        .collect();

    for id in ids {
        let spec = workers.workers.get(id).cloned().unwrap_or_default();
        let options = WorkerOptions {
            recovery: spec.recovery.clone(),
            weight: spec.weight,
        };
        registry
            .register_with(id, Arc::new(SimulatedWorker::new(id, spec)), options)
            .map_err(|e| e.to_string())?;
    }
    Ok(registry)
}
