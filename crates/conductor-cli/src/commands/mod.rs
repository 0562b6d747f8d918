pub mod plan;
pub mod run;
pub mod validate;

use conductor_core::WorkflowTemplate;

/// Load a template file, mapping the error to the CLI's string form.
pub fn load_template(path: &str) -> Result<WorkflowTemplate, String> {
    WorkflowTemplate::from_file(path).map_err(|e| e.to_string())
}

/// Print the `📄 Loaded ...` header shared by every subcommand.
pub fn print_header(template: &WorkflowTemplate, path: &str) {
    println!("📄 Loaded workflow: {} ({})", template.name, path);
    if let Some(description) = &template.description {
        println!("   {}", description);
    }
    println!("   {} stage(s), version {}", template.stages.len(), template.version);
    println!();
}
