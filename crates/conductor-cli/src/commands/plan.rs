//! `conductor plan`: show the waves a template would run in.

use conductor_core::{ExecutionPlan, TaskGraph};
use console::style;

use super::{load_template, print_header};

pub fn plan(template_file: &str, json: bool) -> Result<ExecutionPlan, String> {
    let template = load_template(template_file)?;
    template.validate().map_err(|e| e.to_string())?;
    let plan = TaskGraph::new(&template).plan();

    if json {
        let out = serde_json::to_string_pretty(&plan)
            .map_err(|e| format!("Failed to serialize plan: {}", e))?;
        println!("{}", out);
        return Ok(plan);
    }

    print_header(&template, template_file);
    for (i, wave) in plan.waves.iter().enumerate() {
        println!("  {} {}", style(format!("Wave {}:", i + 1)).cyan().bold(), wave.join(", "));
    }
    if !plan.broken_edges.is_empty() {
        println!();
        for edge in &plan.broken_edges {
            println!("  {} broken cycle edge {}", style("⚠️").yellow(), edge);
        }
    }
    Ok(plan)
}
