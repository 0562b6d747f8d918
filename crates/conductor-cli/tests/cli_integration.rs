//! Integration tests for the CLI commands.
//!
//! The commands are called directly rather than by spawning the binary.

use std::path::PathBuf;

use conductor_cli::commands::run::{execute, RunArgs};
use conductor_cli::commands::{plan, validate};
use conductor_core::{ErrorKind, StageState, WorkflowStatus};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const RESUME_TEMPLATE: &str = r#"
name: resume-pipeline
required_inputs: [document]
stages:
  - name: extract
    worker_id: ocr
    priority: critical
    quality_gate: { id: ocr_quality, threshold: 0.8 }
  - name: parse
    worker_id: parser
    depends_on: [extract]
  - name: skills
    worker_id: skill_analysis
    depends_on: [parse]
    quality_gate:
      id: skill_count
      threshold: 3
      metric: "count(metadata.technical_skills)"
  - name: report
    worker_id: reporter
    priority: low
    depends_on: [skills]
"#;

const WORKERS: &str = r#"
workers:
  ocr:
    confidence: 0.92
  parser:
    fail_attempts: 1
    recovery:
      bounded_backoff: { base_ms: 5, max_retries: 2 }
  skill_analysis:
    metadata:
      technical_skills: [rust, tokio, serde, sql]
  reporter:
    confidence: 0.8
"#;

fn write(dir: &TempDir, name: &str, content: &str) -> String {
    let path: PathBuf = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

fn args(dir: &TempDir, template: &str) -> RunArgs {
    RunArgs {
        template: write(dir, "template.yaml", template),
        input: Some(r#"{"document": "cv.pdf"}"#.to_string()),
        workers: Some(write(dir, "workers.yaml", WORKERS)),
        quiet: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_run_resume_pipeline() {
    let dir = TempDir::new().unwrap();
    let instance = execute(&args(&dir, RESUME_TEMPLATE), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(instance.status(), WorkflowStatus::Completed);
    assert!(instance
        .stage_states()
        .values()
        .all(|s| *s == StageState::Succeeded));
    assert_eq!(instance.retries("parse"), 1);
    assert_eq!(instance.result("parse").unwrap().payload["attempt"], 2);

    let gate = instance.gate_outcome("skills").unwrap();
    assert!(gate.passed);
    assert_eq!(gate.observed, 4.0);

    let report = instance.report().unwrap();
    assert!(report.overall_success);
    assert_eq!(report.total_retries, 1);
    assert!(report.overall_confidence > 0.8 && report.overall_confidence <= 1.0);
}

#[tokio::test]
async fn test_run_writes_instance_json() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("instance.json");
    let mut run_args = args(&dir, RESUME_TEMPLATE);
    run_args.output = Some(output.to_string_lossy().into_owned());

    conductor_cli::commands::run::run(run_args).await.unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(json["status"], "completed");
    assert_eq!(json["stage_state"]["report"], "succeeded");
    assert!(json["id"].as_str().unwrap().starts_with("wf_"));
}

#[tokio::test]
async fn test_run_missing_input_fails_before_start() {
    let dir = TempDir::new().unwrap();
    let mut run_args = args(&dir, RESUME_TEMPLATE);
    run_args.input = None;

    let instance = execute(&run_args, CancellationToken::new()).await.unwrap();
    assert_eq!(instance.status(), WorkflowStatus::Failed);
    assert!(instance.report().is_none());
    assert_eq!(instance.errors()[0].kind, ErrorKind::TemplateError);

    let err = conductor_cli::commands::run::run(run_args).await.unwrap_err();
    assert!(err.contains("document"), "{}", err);
}

#[tokio::test]
async fn test_run_gate_miss_is_unsuccessful() {
    let dir = TempDir::new().unwrap();
    let strict = RESUME_TEMPLATE.replace("threshold: 3", "threshold: 10");
    let run_args = args(&dir, &strict);

    let instance = execute(&run_args, CancellationToken::new()).await.unwrap();
    assert_eq!(instance.status(), WorkflowStatus::Completed);
    assert_eq!(instance.stage_state("report"), Some(StageState::Succeeded));
    assert!(!instance.gate_outcome("skills").unwrap().passed);
    assert!(!instance.overall_success());
    assert_eq!(instance.errors_of_kind(ErrorKind::QualityGateMiss).count(), 1);

    let err = conductor_cli::commands::run::run(run_args).await.unwrap_err();
    assert!(err.contains("did not succeed"), "{}", err);
}

#[tokio::test]
async fn test_run_flags_override_config_file() {
    let dir = TempDir::new().unwrap();
    let mut run_args = args(&dir, RESUME_TEMPLATE);
    run_args.config = Some(write(&dir, "config.yaml", "max_concurrency: 4\nglobal_timeout_ms: 60000\n"));
    run_args.max_concurrency = Some(1);

    let config = conductor_cli::commands::run::load_config(&run_args).unwrap();
    assert_eq!(config.max_concurrency, 1);
    assert_eq!(config.global_timeout_ms, Some(60_000));
}

#[test]
fn test_validate_template() {
    let dir = TempDir::new().unwrap();
    let template = write(&dir, "template.yaml", RESUME_TEMPLATE);
    let workers = write(&dir, "workers.yaml", WORKERS);

    assert!(validate::validate(&template, None).is_ok());
    assert!(validate::validate(&template, Some(&workers)).is_ok());

    let partial = write(&dir, "partial.yaml", "workers:\n  ocr: {}\n");
    let err = validate::validate(&template, Some(&partial)).unwrap_err();
    assert!(err.contains("3 problem(s)"), "{}", err);
}

#[test]
fn test_validate_rejects_broken_template() {
    let dir = TempDir::new().unwrap();
    let template = write(
        &dir,
        "broken.yaml",
        r#"
name: broken
stages:
  - name: a
    worker_id: w
    depends_on: [missing]
  - name: a
    worker_id: w
"#,
    );
    assert!(validate::validate(&template, None).is_err());
    assert!(validate::validate("/nonexistent/template.yaml", None).is_err());
}

#[test]
fn test_plan_waves_and_cycle() {
    let dir = TempDir::new().unwrap();
    let template = write(&dir, "template.yaml", RESUME_TEMPLATE);
    let plan = plan::plan(&template, false).unwrap();
    assert_eq!(plan.waves, vec![vec!["extract"], vec!["parse"], vec!["skills"], vec!["report"]]);

    let cyclic = write(
        &dir,
        "cyclic.yaml",
        r#"
name: cyclic
stages:
  - name: a
    worker_id: w
    depends_on: [b]
  - name: b
    worker_id: w
    priority: critical
    depends_on: [a]
"#,
    );
    let plan = plan::plan(&cyclic, true).unwrap();
    assert_eq!(plan.waves, vec![vec!["b"], vec!["a"]]);
    assert_eq!(plan.broken_edges.len(), 1);
    assert_eq!(plan.broken_edges[0].stage, "b");
}
