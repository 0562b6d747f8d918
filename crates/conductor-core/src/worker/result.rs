use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one worker invocation.
///
/// A failed result never carries a payload or a non-zero confidence; call
/// [`WorkerResult::normalized`] (the scheduler always does) to enforce that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub succeeded: bool,

    /// Worker-specific output, opaque to the scheduler.
    #[serde(default)]
    pub payload: Value,

    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f64,

    /// Wall time of the attempt, as measured by the scheduler.
    #[serde(with = "crate::duration_ms", default)]
    pub elapsed: Duration,

    /// Free-form diagnostic data; quality gates may read metrics from here.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl WorkerResult {
    pub fn success(payload: Value, confidence: f64) -> Self {
        Self {
            succeeded: true,
            payload,
            confidence,
            elapsed: Duration::ZERO,
            metadata: serde_json::Map::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            payload: Value::Null,
            confidence: 0.0,
            elapsed: Duration::ZERO,
            metadata: serde_json::Map::new(),
            errors: vec![message.into()],
            warnings: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Enforce the result invariants: confidence is clamped to `[0, 1]`
    /// (NaN becomes 0), and a failed result has no payload and zero
    /// confidence.
    pub fn normalized(mut self) -> Self {
        if !self.confidence.is_finite() {
            self.confidence = 0.0;
        }
        self.confidence = self.confidence.clamp(0.0, 1.0);
        if !self.succeeded {
            self.confidence = 0.0;
            self.payload = Value::Null;
        }
        self
    }

    /// First error message, or a generic one when the worker gave none.
    pub fn error_summary(&self) -> String {
        self.errors
            .first()
            .cloned()
            .unwrap_or_else(|| "worker reported failure without a message".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalized_clears_failed_payload() {
        let mut r = WorkerResult::success(json!({"a": 1}), 0.7);
        r.succeeded = false;
        let r = r.normalized();
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.payload, Value::Null);
    }

    #[test]
    fn normalized_clamps_confidence() {
        assert_eq!(WorkerResult::success(Value::Null, 1.7).normalized().confidence, 1.0);
        assert_eq!(WorkerResult::success(Value::Null, -0.2).normalized().confidence, 0.0);
        assert_eq!(WorkerResult::success(Value::Null, f64::NAN).normalized().confidence, 0.0);
    }

    #[test]
    fn error_summary_falls_back() {
        let mut r = WorkerResult::failure("boom");
        assert_eq!(r.error_summary(), "boom");
        r.errors.clear();
        assert!(r.error_summary().contains("without a message"));
    }

    #[test]
    fn elapsed_serializes_as_millis() {
        let r = WorkerResult::success(json!("ok"), 0.9).with_elapsed(Duration::from_millis(1500));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["elapsed"], 1500);
        assert!(v.get("metadata").is_none());
    }
}
