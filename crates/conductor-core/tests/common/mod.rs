//! Scripted workers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::{
    CoordinatorConfig, ExecutionContext, RecoveryPolicy, Scheduler, ValidationError, Worker,
    WorkerRegistry, WorkerResult,
};
use serde_json::{json, Value};

/// Start/end events and concurrency peak across every worker of a test.
#[derive(Default)]
pub struct Tracker {
    events: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    fn start(self: &Arc<Self>, stage: &str) -> ActiveGuard {
        self.events.lock().unwrap().push(format!("start:{}", stage));
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard {
            tracker: Arc::clone(self),
            stage: stage.to_string(),
            finished: false,
        }
    }
}

/// Decrements the active count even when the attempt is aborted.
struct ActiveGuard {
    tracker: Arc<Tracker>,
    stage: String,
    finished: bool,
}

impl ActiveGuard {
    fn finish(mut self) {
        self.finished = true;
        self.tracker
            .events
            .lock()
            .unwrap()
            .push(format!("end:{}", self.stage));
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
        if !self.finished {
            self.tracker
                .events
                .lock()
                .unwrap()
                .push(format!("abort:{}", self.stage));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    Succeed,
    /// Fail the first n attempts, then succeed.
    FailFirst(u32),
    AlwaysFail,
    /// Never return; only a timeout or cancellation ends the attempt.
    Hang,
    Panic,
    /// Fail unless the input carries `"relaxed": true`.
    NeedsRelaxed,
    /// Fail the first call, hang on the second, then succeed.
    FailThenHangOnce,
}

pub struct ScriptedWorker {
    id: String,
    confidence: f64,
    delay: Duration,
    behavior: Behavior,
    policy: RecoveryPolicy,
    weight: f64,
    required: Vec<String>,
    metadata: serde_json::Map<String, Value>,
    tracker: Arc<Tracker>,
    calls: AtomicU32,
    inputs: Mutex<Vec<Value>>,
}

impl ScriptedWorker {
    pub fn new(id: &str, tracker: &Arc<Tracker>) -> Self {
        Self {
            id: id.to_string(),
            confidence: 0.9,
            delay: Duration::ZERO,
            behavior: Behavior::Succeed,
            policy: RecoveryPolicy::None,
            weight: 1.0,
            required: Vec::new(),
            metadata: serde_json::Map::new(),
            tracker: Arc::clone(tracker),
            calls: AtomicU32::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn require(mut self, field: &str) -> Self {
        self.required.push(field.to_string());
        self
    }

    pub fn metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self, input: &Value) -> Result<(), ValidationError> {
        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|f| input.get(f.as_str()).is_none())
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
        self.inputs.lock().unwrap().push(input.clone());
        let guard = self.tracker.start(&ctx.stage);

        match self.behavior {
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Behavior::FailThenHangOnce if call == 2 => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Behavior::Panic => panic!("scripted panic in {}", self.id),
            _ => {}
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failed = match self.behavior {
            Behavior::FailFirst(n) => call <= n,
            Behavior::AlwaysFail => true,
            Behavior::NeedsRelaxed => input.get("relaxed") != Some(&json!(true)),
            Behavior::FailThenHangOnce => call == 1,
            _ => false,
        };
        guard.finish();

        if failed {
            return WorkerResult::failure(format!("{} reported failure", self.id));
        }
        let mut result = WorkerResult::success(json!({"worker": self.id, "stage": ctx.stage}), self.confidence);
        for (k, v) in &self.metadata {
            result = result.with_metadata(k.clone(), v.clone());
        }
        result
    }

    fn degrade(&self, input: &Value, _attempt: u32) -> Option<Value> {
        let mut relaxed = input.clone();
        relaxed.as_object_mut()?.insert("relaxed".into(), json!(true));
        Some(relaxed)
    }

    fn recovery_policy(&self) -> RecoveryPolicy {
        self.policy.clone()
    }

    fn confidence_weight(&self) -> f64 {
        self.weight
    }
}

pub fn registry(workers: &[&Arc<ScriptedWorker>]) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    for w in workers {
        let worker: Arc<dyn Worker> = Arc::clone(*w) as Arc<dyn Worker>;
        registry.register(w.id.clone(), worker).unwrap();
    }
    registry
}

pub fn scheduler(workers: &[&Arc<ScriptedWorker>]) -> Scheduler {
    Scheduler::new(Arc::new(registry(workers)), CoordinatorConfig::default())
}
