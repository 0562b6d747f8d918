//! `conductor validate`: check a template without running it.

use conductor_core::TaskGraph;
use console::style;

use super::{load_template, print_header};
use crate::workers::WorkersFile;

/// Validate a template file. With `workers_file`, also check that every
/// stage's worker is defined there.
pub fn validate(template_file: &str, workers_file: Option<&str>) -> Result<(), String> {
    let template = load_template(template_file)?;
    print_header(&template, template_file);

    let mut problems = match template.validate() {
        Ok(()) => Vec::new(),
        Err(conductor_core::CoordinationError::InvalidTemplate(messages)) => messages,
        Err(e) => vec![e.to_string()],
    };

    if let Some(path) = workers_file {
        let workers = WorkersFile::from_file(path)?;
        for stage in &template.stages {
            if !stage.worker_id.trim().is_empty() && !workers.workers.contains_key(&stage.worker_id) {
                problems.push(format!(
                    "Stage '{}' references worker '{}' not defined in {}",
                    stage.name, stage.worker_id, path
                ));
            }
        }
    }

    if !problems.is_empty() {
        for p in &problems {
            println!("  {} {}", style("✗").red(), p);
        }
        return Err(format!(
            "Workflow '{}' is invalid ({} problem(s))",
            template.name,
            problems.len()
        ));
    }

    for (i, stage) in template.stages.iter().enumerate() {
        let deps = if stage.depends_on.is_empty() {
            String::new()
        } else {
            format!(" ← {}", stage.depends_on.join(", "))
        };
        let gate = stage
            .quality_gate
            .as_ref()
            .map(|g| format!(" [gate {} ≥ {}]", g.id, g.threshold))
            .unwrap_or_default();
        println!(
            "  {}. {} ({}, {}){}{}",
            i + 1,
            style(&stage.name).bold(),
            stage.worker_id,
            stage.priority,
            deps,
            gate
        );
    }
    println!();

    if let Some(cycle) = TaskGraph::new(&template).find_cycle() {
        println!(
            "{} dependency cycle: {} (it will be broken at run time)",
            style("⚠️").yellow(),
            cycle.join(" → ")
        );
    }

    println!("✅ Workflow '{}' is valid", template.name);
    Ok(())
}
