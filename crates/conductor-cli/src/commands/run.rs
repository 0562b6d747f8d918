//! `conductor run`: execute a template against simulated workers.

use std::sync::Arc;
use std::time::Duration;

use conductor_core::{
    CoordinatorConfig, RunOptions, Scheduler, StageState, WorkflowInstance, WorkflowStatus,
};
use console::style;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{load_template, print_header};
use crate::workers::{build_registry, WorkersFile};

#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub template: String,
    /// Path to a JSON file, or an inline JSON document.
    pub input: Option<String>,
    pub workers: Option<String>,
    pub config: Option<String>,
    pub max_concurrency: Option<usize>,
    pub global_timeout_ms: Option<u64>,
    /// Write the instance JSON here.
    pub output: Option<String>,
    pub quiet: bool,
}

/// Run a template and print its summary. Fails when the workflow did not
/// succeed overall.
pub async fn run(args: RunArgs) -> Result<(), String> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("[CLI] Interrupted, cancelling workflow");
            on_interrupt.cancel();
        }
    });

    let instance = execute(&args, cancel).await?;

    if !args.quiet {
        print_summary(&instance);
    }

    if let Some(path) = &args.output {
        let json = instance
            .to_json_pretty()
            .map_err(|e| format!("Failed to serialize instance: {}", e))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write '{}': {}", path, e))?;
        println!("📝 Instance written to {}", path);
    }

    if instance.status() == WorkflowStatus::Failed {
        let reasons: Vec<String> = instance.errors().iter().map(|e| e.message.clone()).collect();
        return Err(format!("Workflow could not start: {}", reasons.join("; ")));
    }
    if instance.overall_success() {
        println!("\n🎉 Workflow completed successfully!");
        Ok(())
    } else {
        let failed: Vec<&str> = instance
            .stage_states()
            .iter()
            .filter(|(_, s)| !matches!(s, StageState::Succeeded))
            .map(|(name, _)| name.as_str())
            .collect();
        Err(format!(
            "Workflow did not succeed. Unsuccessful stages: {}",
            if failed.is_empty() { "none (quality gates)".to_string() } else { failed.join(", ") }
        ))
    }
}

/// Load everything `args` names and run the workflow to completion.
pub async fn execute(args: &RunArgs, cancel: CancellationToken) -> Result<WorkflowInstance, String> {
    let template = load_template(&args.template)?;
    if !args.quiet {
        print_header(&template, &args.template);
    }

    let config = load_config(args)?;
    let workers = match &args.workers {
        Some(path) => WorkersFile::from_file(path)?,
        None => WorkersFile::default(),
    };
    let input = parse_input(args.input.as_deref())?;

    let registry = build_registry(&template, &workers, config.circuit_breaker.clone())?;
    let options = RunOptions::from_config(&config);
    let scheduler = Scheduler::new(Arc::new(registry), config);

    tracing::info!(
        "[CLI] Running '{}' (max_concurrency={}, global_timeout={:?})",
        template.name,
        options.max_concurrency,
        options.global_timeout
    );
    Ok(scheduler.run_with_cancel(template, input, options, cancel).await)
}

/// Config file, then `CONDUCTOR_*` environment overrides, then explicit flags.
pub fn load_config(args: &RunArgs) -> Result<CoordinatorConfig, String> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_file(path).map_err(|e| e.to_string())?,
        None => CoordinatorConfig::default(),
    };
    config.apply_env_overrides().map_err(|e| e.to_string())?;
    apply_flags(args, &mut config);
    Ok(config)
}

fn apply_flags(args: &RunArgs, config: &mut CoordinatorConfig) {
    if let Some(n) = args.max_concurrency {
        config.max_concurrency = n;
    }
    if let Some(ms) = args.global_timeout_ms {
        config.global_timeout_ms = (ms > 0).then_some(ms);
    }
}

/// `None` is an empty object. A value naming an existing file is read
/// from disk; anything else must be inline JSON.
pub fn parse_input(raw: Option<&str>) -> Result<Value, String> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    let text = if std::path::Path::new(raw).is_file() {
        std::fs::read_to_string(raw).map_err(|e| format!("Failed to read input '{}': {}", raw, e))?
    } else {
        raw.to_string()
    };
    serde_json::from_str(&text).map_err(|e| format!("Invalid input JSON: {}", e))
}

fn print_summary(instance: &WorkflowInstance) {
    let Some(report) = instance.report() else {
        for err in instance.errors() {
            println!("  {} {}", style("✗").red(), err.message);
        }
        return;
    };

    println!("┌──────────────────────────┬─────────────┬────────────┬──────────┬─────────┐");
    println!("│ Stage                    │ State       │ Confidence │ Elapsed  │ Retries │");
    println!("├──────────────────────────┼─────────────┼────────────┼──────────┼─────────┤");
    for (name, state) in instance.stage_states() {
        let confidence = instance
            .result(name)
            .filter(|r| r.succeeded)
            .map(|r| format!("{:.2}", r.confidence))
            .unwrap_or_else(|| "-".to_string());
        let elapsed = instance
            .timing(name)
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        let state_text = format!("{:<11}", state.to_string());
        let state_cell = match state {
            StageState::Succeeded => style(state_text).green(),
            StageState::Failed => style(state_text).red(),
            _ => style(state_text).yellow(),
        };
        println!(
            "│ {:<24} │ {} │ {:>10} │ {:>8} │ {:>7} │",
            truncate(name, 24),
            state_cell,
            confidence,
            elapsed,
            instance.retries(name)
        );
    }
    println!("└──────────────────────────┴─────────────┴────────────┴──────────┴─────────┘");
    println!();

    println!(
        "   Success rate: {:.0}%  Confidence: {:.2}  Gates: {}/{} passed  Elapsed: {}",
        report.agent_success_rate * 100.0,
        report.overall_confidence,
        report.gates_passed,
        report.gates_evaluated,
        format_duration(report.total_elapsed)
    );
    if !report.bottlenecks.is_empty() {
        let names: Vec<&str> = report.bottlenecks.iter().map(|b| b.stage.as_str()).collect();
        println!("   Bottlenecks: {}", names.join(", "));
    }
    for rec in &report.recommendations {
        println!("   {} {}", style("💡").cyan(), rec);
    }
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() >= 1 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max - 1).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_and_missing_input() {
        assert_eq!(parse_input(None).unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_input(Some(r#"{"resume": "cv.pdf"}"#)).unwrap()["resume"],
            "cv.pdf"
        );
        assert!(parse_input(Some("{not json")).is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let args = RunArgs {
            max_concurrency: Some(3),
            global_timeout_ms: Some(0),
            ..Default::default()
        };
        let mut config = CoordinatorConfig::default();
        apply_flags(&args, &mut config);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.global_timeout_ms, None);
    }

    #[test]
    fn flags_win_over_environment() {
        let env = |key: &str| match key {
            conductor_core::config::ENV_MAX_CONCURRENCY => Some("8".to_string()),
            conductor_core::config::ENV_GLOBAL_TIMEOUT_MS => Some("2500".to_string()),
            _ => None,
        };
        let mut config = CoordinatorConfig::default();
        config.apply_overrides_from(env).unwrap();
        apply_flags(
            &RunArgs {
                max_concurrency: Some(2),
                ..Default::default()
            },
            &mut config,
        );
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.global_timeout_ms, Some(2500));
    }

    #[test]
    fn durations_and_names_format_compactly() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(truncate("short", 24), "short");
        assert_eq!(truncate("abcdef", 4).chars().count(), 4);
    }
}
