//! YAML schema types for workflow templates.
//!
//! A template is authored once and reused across runs:
//!
//! ```yaml
//! name: "Resume Pipeline"
//! description: "Extract, parse, and analyse an uploaded resume"
//! version: "1.0"
//! required_inputs: [document]
//!
//! stages:
//!   - name: extract
//!     worker_id: ocr
//!     priority: critical
//!     timeout_ms: 30000
//!     quality_gate: { id: ocr_quality, threshold: 0.8 }
//!
//!   - name: parse
//!     worker_id: parser
//!     priority: critical
//!     depends_on: [extract]
//!     max_retries: 2
//!
//!   - name: skills
//!     worker_id: skill_analysis
//!     priority: high
//!     depends_on: [parse]
//!     quality_gate:
//!       id: skill_count
//!       threshold: 5
//!       metric: "count(metadata.technical_skills)"
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};
use crate::workflow::gates::GateMetric;

/// Stage urgency. Declaration order is significant: `Critical` sorts first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Numeric rank, lower is more urgent.
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Post-execution threshold check declared on a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateSpec {
    /// Gate identifier, reported in outcomes and recommendations.
    pub id: String,

    /// Minimum observed value for the gate to pass.
    pub threshold: f64,

    /// Where the observed value comes from (default: the result confidence).
    #[serde(default)]
    pub metric: GateMetric,
}

impl QualityGateSpec {
    pub fn confidence(id: impl Into<String>, threshold: f64) -> Self {
        Self {
            id: id.into(),
            threshold,
            metric: GateMetric::Confidence,
        }
    }
}

/// One node of a workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name, unique within the template.
    pub name: String,

    /// Registry key of the worker that executes this stage.
    pub worker_id: String,

    #[serde(default)]
    pub priority: Priority,

    /// Names of stages this one depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_gate: Option<QualityGateSpec>,

    /// Per-attempt timeout in milliseconds (default: 300000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum recovery attempts after the initial one (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Static stage input merged over the run input.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_version() -> String {
    "1.0".to_string()
}

impl StageSpec {
    pub fn new(name: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker_id: worker_id.into(),
            priority: Priority::default(),
            depends_on: Vec::new(),
            quality_gate: None,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            params: serde_json::Map::new(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn gate(mut self, gate: QualityGateSpec) -> Self {
        self.quality_gate = Some(gate);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Named, ordered collection of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    /// Keys the run input object must contain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_inputs: Vec<String>,

    pub stages: Vec<StageSpec>,
}

impl WorkflowTemplate {
    pub fn new(name: impl Into<String>, stages: Vec<StageSpec>) -> Self {
        Self {
            name: name.into(),
            description: None,
            version: default_version(),
            required_inputs: Vec::new(),
            stages,
        }
    }

    pub fn require_input(mut self, key: impl Into<String>) -> Self {
        self.required_inputs.push(key.into());
        self
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CoordinationError::Parse(format!("Failed to parse workflow YAML: {}", e)))
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordinationError::Io(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Structural validation. Every problem is reported, not just the first.
    ///
    /// Dependency cycles are *not* an error here: they are broken at
    /// planning time.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("template name is empty".to_string());
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                problems.push("stage with empty name".to_string());
            } else if !seen.insert(stage.name.as_str()) {
                problems.push(format!("duplicate stage '{}'", stage.name));
            }
            if stage.worker_id.trim().is_empty() {
                problems.push(format!("stage '{}' has an empty worker_id", stage.name));
            }
            if stage.timeout_ms == 0 {
                problems.push(format!("stage '{}' has a zero timeout", stage.name));
            }
            if let Some(gate) = &stage.quality_gate {
                if !gate.threshold.is_finite() || gate.threshold < 0.0 {
                    problems.push(format!(
                        "stage '{}' gate '{}' has invalid threshold {}",
                        stage.name, gate.id, gate.threshold
                    ));
                }
            }
        }

        for stage in &self.stages {
            for dep in &stage.depends_on {
                if !seen.contains(dep.as_str()) {
                    problems.push(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dep
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoordinationError::InvalidTemplate(problems))
        }
    }

    /// Check the run input against `required_inputs`.
    pub fn validate_input(&self, input: &serde_json::Value) -> Result<()> {
        if self.required_inputs.is_empty() {
            return Ok(());
        }
        let obj = input.as_object().ok_or_else(|| {
            CoordinationError::InvalidInput(format!(
                "template '{}' requires an object input with keys {:?}",
                self.name, self.required_inputs
            ))
        })?;
        let missing: Vec<&str> = self
            .required_inputs
            .iter()
            .filter(|k| obj.get(k.as_str()).map_or(true, |v| v.is_null()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoordinationError::InvalidInput(format!(
                "missing required input(s): {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_minimal_template() {
        let yaml = r#"
name: "Minimal"
stages:
  - name: extract
    worker_id: ocr
"#;
        let t = WorkflowTemplate::from_yaml(yaml).unwrap();
        assert_eq!(t.version, "1.0");
        let s = &t.stages[0];
        assert_eq!(s.priority, Priority::Medium);
        assert_eq!(s.timeout_ms, 300_000);
        assert_eq!(s.max_retries, 3);
        assert!(s.quality_gate.is_none());
        t.validate().unwrap();
    }

    #[test]
    fn parse_full_template() {
        let yaml = r#"
name: "Resume Pipeline"
description: "end to end"
version: "2.0"
required_inputs: [document]
stages:
  - name: extract
    worker_id: ocr
    priority: critical
    timeout_ms: 1000
    quality_gate: { id: ocr_quality, threshold: 0.8 }
  - name: skills
    worker_id: skill_analysis
    priority: high
    depends_on: [extract]
    max_retries: 1
    params:
      domains: [technical]
    quality_gate:
      id: skill_count
      threshold: 5
      metric: "count(metadata.technical_skills)"
"#;
        let t = WorkflowTemplate::from_yaml(yaml).unwrap();
        assert_eq!(t.version, "2.0");
        assert_eq!(t.required_inputs, vec!["document"]);
        let skills = t.stage("skills").unwrap();
        assert_eq!(skills.depends_on, vec!["extract"]);
        assert_eq!(skills.params["domains"], json!(["technical"]));
        let gate = skills.quality_gate.as_ref().unwrap();
        assert_eq!(gate.metric, GateMetric::Count("technical_skills".into()));
        assert_eq!(t.stage("extract").unwrap().priority, Priority::Critical);
    }

    #[test]
    fn priority_orders_critical_first() {
        let mut ps = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        ps.sort();
        assert_eq!(
            ps,
            vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
        );
        assert_eq!(Priority::Critical.rank(), 0);
    }

    #[test]
    fn validate_reports_every_problem() {
        let t = WorkflowTemplate::new(
            "broken",
            vec![
                StageSpec::new("a", "w"),
                StageSpec::new("a", ""),
                StageSpec::new("b", "w").depends_on(["zzz"]),
            ],
        );
        match t.validate() {
            Err(CoordinationError::InvalidTemplate(problems)) => {
                assert_eq!(problems.len(), 3, "{:?}", problems);
                assert!(problems.iter().any(|p| p.contains("duplicate stage 'a'")));
                assert!(problems.iter().any(|p| p.contains("empty worker_id")));
                assert!(problems.iter().any(|p| p.contains("unknown stage 'zzz'")));
            }
            other => panic!("expected InvalidTemplate, got {:?}", other),
        }
    }

    #[test]
    fn cycles_are_not_validation_errors() {
        let t = WorkflowTemplate::new(
            "cyclic",
            vec![
                StageSpec::new("a", "w").depends_on(["b"]),
                StageSpec::new("b", "w").depends_on(["a"]),
            ],
        );
        assert!(t.validate().is_ok());
    }

    #[test]
    fn required_inputs_checked() {
        let t = WorkflowTemplate::new("t", vec![StageSpec::new("a", "w")]).require_input("document");
        assert!(t.validate_input(&json!({"document": "cv.pdf"})).is_ok());
        assert!(t.validate_input(&json!({"document": null})).is_err());
        assert!(t.validate_input(&json!("cv.pdf")).is_err());
    }

    #[test]
    fn from_file_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.yaml");
        std::fs::write(&path, "name: f\nstages:\n  - name: a\n    worker_id: w\n").unwrap();
        let t = WorkflowTemplate::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(t.stages.len(), 1);

        let err = WorkflowTemplate::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, CoordinationError::Io(_)));
    }
}
