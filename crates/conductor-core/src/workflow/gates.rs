//! Quality gates: non-blocking post-hoc checks on stage output.
//!
//! A gate never halts the pipeline or forces a retry. Its outcome is a
//! diagnostic signal the aggregator folds into the final verdict.
//!
//! Metric extraction rules (the `result.` prefix is optional):
//!
//! | rule                                   | observed value                        |
//! |----------------------------------------|---------------------------------------|
//! | `confidence`                           | `result.confidence`                   |
//! | `metadata.key` / `metadata['key']`     | numeric metadata value (bool → 0/1)   |
//! | `count(metadata.key)`                  | length of an array, object, or string |
//!
//! Anything missing or of the wrong shape observes `0`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::worker::WorkerResult;
use crate::workflow::schema::StageSpec;

// ─── Metric ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GateMetric {
    #[default]
    Confidence,
    Metadata(String),
    Count(String),
}

const METADATA_PATTERN: &str = r#"(?:result\.)?metadata(?:\.([A-Za-z0-9_\-]+)|\[\s*['"]([^'"]+)['"]\s*\])"#;

impl GateMetric {
    pub fn parse(rule: &str) -> Result<Self, String> {
        let rule = rule.trim();
        if rule == "confidence" || rule == "result.confidence" {
            return Ok(Self::Confidence);
        }

        let count_re = Regex::new(&format!(r"^count\(\s*{}\s*\)$", METADATA_PATTERN))
            .map_err(|e| e.to_string())?;
        if let Some(caps) = count_re.captures(rule) {
            if let Some(key) = caps.get(1).or_else(|| caps.get(2)) {
                return Ok(Self::Count(key.as_str().to_string()));
            }
        }

        let metadata_re =
            Regex::new(&format!("^{}$", METADATA_PATTERN)).map_err(|e| e.to_string())?;
        if let Some(caps) = metadata_re.captures(rule) {
            if let Some(key) = caps.get(1).or_else(|| caps.get(2)) {
                return Ok(Self::Metadata(key.as_str().to_string()));
            }
        }

        Err(format!(
            "unsupported gate metric '{}' (expected confidence, metadata.<key>, or count(metadata.<key>))",
            rule
        ))
    }

    /// Observed value of this metric on `result`.
    pub fn observe(&self, result: &WorkerResult) -> f64 {
        match self {
            Self::Confidence => result.confidence,
            Self::Metadata(key) => match result.metadata.get(key) {
                Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                Some(Value::Bool(b)) => f64::from(u8::from(*b)),
                Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
                _ => 0.0,
            },
            Self::Count(key) => match result.metadata.get(key) {
                Some(Value::Array(items)) => items.len() as f64,
                Some(Value::Object(map)) => map.len() as f64,
                Some(Value::String(s)) => s.chars().count() as f64,
                _ => 0.0,
            },
        }
    }
}

impl TryFrom<String> for GateMetric {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<GateMetric> for String {
    fn from(metric: GateMetric) -> Self {
        metric.to_string()
    }
}

impl std::fmt::Display for GateMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confidence => write!(f, "confidence"),
            Self::Metadata(key) => write!(f, "metadata.{}", key),
            Self::Count(key) => write!(f, "count(metadata.{})", key),
        }
    }
}

// ─── Outcome ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate_id: String,
    pub threshold: f64,
    pub observed: f64,
    pub passed: bool,
    pub metric: GateMetric,
}

// ─── Validator ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct QualityGateValidator;

impl QualityGateValidator {
    /// Evaluate the stage's gate against its result. `None` when the stage
    /// declares no gate.
    pub fn evaluate(stage: &StageSpec, result: &WorkerResult) -> Option<GateOutcome> {
        let gate = stage.quality_gate.as_ref()?;
        let observed = gate.metric.observe(result);
        let passed = observed >= gate.threshold;

        if passed {
            tracing::debug!(
                "[QualityGate] {} gate '{}' passed ({} = {:.3} >= {:.3})",
                stage.name,
                gate.id,
                gate.metric,
                observed,
                gate.threshold
            );
        } else {
            tracing::warn!(
                "[QualityGate] {} gate '{}' missed ({} = {:.3} < {:.3})",
                stage.name,
                gate.id,
                gate.metric,
                observed,
                gate.threshold
            );
        }

        Some(GateOutcome {
            gate_id: gate.id.clone(),
            threshold: gate.threshold,
            observed,
            passed,
            metric: gate.metric.clone(),
        })
    }
}
