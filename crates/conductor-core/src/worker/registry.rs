//! Worker registry. Built once by the caller, then shared (read-only)
//! with the scheduler behind an `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::Worker;
use crate::error::{CoordinationError, Result};
use crate::workflow::recovery::RecoveryPolicy;

/// Success rate below which a worker is reported unhealthy.
const HEALTHY_SUCCESS_RATE: f64 = 0.8;

/// Overrides applied at registration time.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub recovery: Option<RecoveryPolicy>,
    pub weight: Option<f64>,
}

/// Running totals across every run that used the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    #[serde(with = "crate::duration_ms")]
    pub total_elapsed: Duration,
    #[serde(with = "crate::duration_ms")]
    pub last_elapsed: Duration,
}

impl WorkerStats {
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            0.0
        } else {
            self.successes as f64 / self.invocations as f64
        }
    }

    pub fn mean_elapsed(&self) -> Duration {
        if self.invocations == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total_elapsed.as_nanos() / u128::from(self.invocations);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub healthy: bool,
    pub success_rate: f64,
    pub invocations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitState>,
}

/// Everything the scheduler needs to drive one registered worker.
#[derive(Clone)]
pub struct WorkerHandle {
    worker_id: String,
    worker: Arc<dyn Worker>,
    policy: RecoveryPolicy,
    weight: f64,
    stats: Arc<Mutex<WorkerStats>>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("name", &self.worker.name())
            .field("policy", &self.policy)
            .field("weight", &self.weight)
            .finish()
    }
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_deref()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Record one executed attempt (validation rejections are not counted).
    /// An attempt admitted by the breaker ended without an outcome.
    pub fn abandon_attempt(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.release_trial();
        }
    }

    pub fn record_attempt(&self, succeeded: bool, elapsed: Duration) {
        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.invocations += 1;
            if succeeded {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            stats.total_elapsed += elapsed;
            stats.last_elapsed = elapsed;
        }
        if let Some(breaker) = &self.breaker {
            if succeeded {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    pub fn health(&self) -> WorkerHealth {
        let stats = self.stats();
        // An unused worker has no evidence against it.
        let success_rate = if stats.invocations == 0 {
            1.0
        } else {
            stats.success_rate()
        };
        let circuit = self.breaker.as_ref().map(|b| b.state());
        WorkerHealth {
            worker_id: self.worker_id.clone(),
            healthy: success_rate >= HEALTHY_SUCCESS_RATE && circuit != Some(CircuitState::Open),
            success_rate,
            invocations: stats.invocations,
            circuit,
        }
    }
}

/// Worker implementations keyed by `worker_id`.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerHandle>,
    breaker_config: Option<CircuitBreakerConfig>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose workers are each guarded by a circuit breaker.
    pub fn with_circuit_breaker(config: CircuitBreakerConfig) -> Self {
        Self {
            workers: HashMap::new(),
            breaker_config: Some(config),
        }
    }

    /// Register a worker under `worker_id`, using the recovery policy and
    /// confidence weight the worker declares.
    pub fn register(&mut self, worker_id: impl Into<String>, worker: Arc<dyn Worker>) -> Result<()> {
        self.register_with(worker_id, worker, WorkerOptions::default())
    }

    pub fn register_with(
        &mut self,
        worker_id: impl Into<String>,
        worker: Arc<dyn Worker>,
        options: WorkerOptions,
    ) -> Result<()> {
        let worker_id = worker_id.into();
        if self.workers.contains_key(&worker_id) {
            return Err(CoordinationError::DuplicateWorker(worker_id));
        }

        let policy = options.recovery.unwrap_or_else(|| worker.recovery_policy());
        let weight = sanitize_weight(options.weight.unwrap_or_else(|| worker.confidence_weight()));
        let breaker = self
            .breaker_config
            .clone()
            .map(|cfg| Arc::new(CircuitBreaker::new(worker_id.clone(), cfg)));

        tracing::debug!(
            "[Registry] Registered worker '{}' ({}) policy={:?} weight={}",
            worker_id,
            worker.name(),
            policy,
            weight
        );

        self.workers.insert(
            worker_id.clone(),
            WorkerHandle {
                worker_id,
                worker,
                policy,
                weight,
                stats: Arc::new(Mutex::new(WorkerStats::default())),
                breaker,
            },
        );
        Ok(())
    }

    /// Override the confidence weight of an already registered worker.
    pub fn set_weight(&mut self, worker_id: &str, weight: f64) -> Result<()> {
        let handle = self.workers.get_mut(worker_id).ok_or_else(|| {
            CoordinationError::InvalidInput(format!("no worker registered as '{}'", worker_id))
        })?;
        handle.weight = sanitize_weight(weight);
        Ok(())
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerHandle> {
        self.workers.get(worker_id)
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.workers.contains_key(worker_id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Health of every registered worker, sorted by id.
    pub fn health(&self) -> Vec<WorkerHealth> {
        let mut out: Vec<WorkerHealth> = self.workers.values().map(WorkerHandle::health).collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }
}

fn sanitize_weight(weight: f64) -> f64 {
    if weight.is_finite() {
        weight.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{ExecutionContext, WorkerResult};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Constant(&'static str);

    #[async_trait]
    impl Worker for Constant {
        fn id(&self) -> &str {
            self.0
        }

        async fn execute(&self, _input: Value, _ctx: ExecutionContext) -> WorkerResult {
            WorkerResult::success(Value::Null, 1.0)
        }

        fn confidence_weight(&self) -> f64 {
            0.9
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut reg = WorkerRegistry::new();
        reg.register("ocr", Arc::new(Constant("ocr"))).unwrap();
        let err = reg.register("ocr", Arc::new(Constant("ocr"))).unwrap_err();
        assert!(matches!(err, CoordinationError::DuplicateWorker(id) if id == "ocr"));
    }

    #[test]
    fn declared_weight_and_override() {
        let mut reg = WorkerRegistry::new();
        reg.register("ocr", Arc::new(Constant("ocr"))).unwrap();
        assert_eq!(reg.get("ocr").unwrap().weight(), 0.9);

        reg.set_weight("ocr", 4.0).unwrap();
        assert_eq!(reg.get("ocr").unwrap().weight(), 1.0);
        assert!(reg.set_weight("missing", 0.5).is_err());
    }

    #[test]
    fn options_override_policy() {
        let mut reg = WorkerRegistry::new();
        reg.register_with(
            "parser",
            Arc::new(Constant("parser")),
            WorkerOptions {
                recovery: Some(RecoveryPolicy::DegradedRequirements { max_retries: 2 }),
                weight: None,
            },
        )
        .unwrap();
        assert_eq!(
            reg.get("parser").unwrap().policy(),
            &RecoveryPolicy::DegradedRequirements { max_retries: 2 }
        );
    }

    #[test]
    fn stats_and_health() {
        let mut reg = WorkerRegistry::new();
        reg.register("ocr", Arc::new(Constant("ocr"))).unwrap();
        let handle = reg.get("ocr").unwrap().clone();
        assert!(handle.health().healthy);

        handle.record_attempt(true, Duration::from_millis(10));
        handle.record_attempt(false, Duration::from_millis(30));
        let stats = handle.stats();
        assert_eq!(stats.invocations, 2);
        assert_eq!(stats.success_rate(), 0.5);
        assert_eq!(stats.mean_elapsed(), Duration::from_millis(20));
        assert!(!reg.health()[0].healthy);
    }

    #[test]
    fn breaker_attached_when_configured() {
        let mut reg = WorkerRegistry::with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        reg.register("ocr", Arc::new(Constant("ocr"))).unwrap();
        let handle = reg.get("ocr").unwrap();
        handle.record_attempt(false, Duration::ZERO);
        assert!(handle.breaker().unwrap().check().is_err());
        assert_eq!(handle.health().circuit, Some(CircuitState::Open));
    }

    #[test]
    fn mean_elapsed_survives_huge_invocation_counts() {
        let stats = WorkerStats {
            invocations: 1 << 32,
            total_elapsed: Duration::from_secs(1 << 32),
            ..Default::default()
        };
        assert_eq!(stats.mean_elapsed(), Duration::from_secs(1));
    }

    #[test]
    fn abandoned_trial_frees_the_half_open_slot() {
        let mut reg = WorkerRegistry::with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 0,
            half_open_max_attempts: 1,
        });
        reg.register("ocr", Arc::new(Constant("ocr"))).unwrap();
        let handle = reg.get("ocr").unwrap();
        handle.record_attempt(false, Duration::ZERO);

        let breaker = handle.breaker().unwrap();
        assert!(breaker.check().is_ok());
        handle.abandon_attempt();
        assert!(breaker.check().is_ok());
    }
}
