//! Coordinator configuration.
//!
//! Every field has a default, so an empty YAML document is a valid config:
//!
//! ```yaml
//! max_concurrency: 4
//! global_timeout_ms: 600000
//! max_backoff_ms: 30000
//! aggregation:
//!   min_success_rate: 0.8
//!   min_gate_pass_rate: 0.8
//! circuit_breaker:
//!   failure_threshold: 5
//!   reset_timeout_ms: 60000
//! worker_weights:
//!   ocr: 0.9
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};
use crate::worker::CircuitBreakerConfig;

pub const ENV_MAX_CONCURRENCY: &str = "CONDUCTOR_MAX_CONCURRENCY";
pub const ENV_GLOBAL_TIMEOUT_MS: &str = "CONDUCTOR_GLOBAL_TIMEOUT_MS";

/// Thresholds used by the workflow aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// `overall_success` requires at least this stage success rate.
    pub min_success_rate: f64,
    /// `overall_success` requires at least this quality gate pass rate.
    pub min_gate_pass_rate: f64,
    /// A stage slower than `factor × mean` stage time is a bottleneck.
    pub bottleneck_factor: f64,
    /// Below this overall confidence a recommendation is emitted.
    pub low_confidence_threshold: f64,
    /// Below this success rate a reliability recommendation is emitted.
    pub reliability_warning_rate: f64,
    /// More total retries than this triggers a recommendation.
    pub excessive_retry_count: u32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_success_rate: 0.8,
            min_gate_pass_rate: 0.8,
            bottleneck_factor: 1.5,
            low_confidence_threshold: 0.8,
            reliability_warning_rate: 0.9,
            excessive_retry_count: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Stages of one wave running at once (0 = unbounded).
    pub max_concurrency: usize,
    /// Wall-clock limit for a whole run.
    pub global_timeout_ms: Option<u64>,
    pub aggregation: AggregationConfig,
    /// Cap on any recovery sleep.
    pub max_backoff_ms: u64,
    /// Per-worker circuit breaker; disabled when absent.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Confidence weight overrides keyed by worker id.
    pub worker_weights: HashMap<String, f64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            global_timeout_ms: None,
            aggregation: AggregationConfig::default(),
            max_backoff_ms: 30_000,
            circuit_breaker: None,
            worker_weights: HashMap::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
            .map_err(|e| CoordinationError::Parse(format!("Failed to parse config YAML: {}", e)))
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordinationError::Io(format!("Failed to read config file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Apply `CONDUCTOR_MAX_CONCURRENCY` / `CONDUCTOR_GLOBAL_TIMEOUT_MS`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::apply_env_overrides`] with an explicit lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_CONCURRENCY) {
            self.max_concurrency = raw.trim().parse().map_err(|_| {
                CoordinationError::InvalidInput(format!(
                    "{} must be a non-negative integer, got '{}'",
                    ENV_MAX_CONCURRENCY, raw
                ))
            })?;
        }
        if let Some(raw) = lookup(ENV_GLOBAL_TIMEOUT_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                CoordinationError::InvalidInput(format!(
                    "{} must be milliseconds, got '{}'",
                    ENV_GLOBAL_TIMEOUT_MS, raw
                ))
            })?;
            self.global_timeout_ms = (ms > 0).then_some(ms);
        }
        Ok(())
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout_ms.map(Duration::from_millis)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
