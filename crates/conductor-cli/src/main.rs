//! Conductor CLI: run, validate, and plan stage workflows.

use clap::{Parser, Subcommand};
use conductor_cli::commands;
use conductor_cli::commands::run::RunArgs;

/// Conductor: staged workflow coordination
#[derive(Parser)]
#[command(name = "conductor", version, about = "Conductor: staged workflow coordination")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow template against simulated workers
    Run {
        /// Path to the workflow template YAML file
        template: String,

        /// Run input: a JSON file path or an inline JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// YAML file describing the simulated workers
        #[arg(short, long)]
        workers: Option<String>,

        /// Coordinator config YAML file
        #[arg(long, env = "CONDUCTOR_CONFIG")]
        config: Option<String>,

        /// Stages of one wave running at once (0 = unbounded).
        /// Overrides CONDUCTOR_MAX_CONCURRENCY
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Wall-clock limit for the whole run in milliseconds (0 = none).
        /// Overrides CONDUCTOR_GLOBAL_TIMEOUT_MS
        #[arg(long)]
        global_timeout_ms: Option<u64>,

        /// Write the workflow instance as JSON to this path
        #[arg(short, long)]
        output: Option<String>,

        /// Skip the stage table and report
        #[arg(short, long)]
        quiet: bool,
    },

    /// Validate a workflow template without running it
    Validate {
        /// Path to the workflow template YAML file
        template: String,

        /// Also check worker ids against this workers YAML file
        #[arg(short, long)]
        workers: Option<String>,
    },

    /// Print the execution waves of a workflow template
    Plan {
        /// Path to the workflow template YAML file
        template: String,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor_core=info,conductor_cli=info".into()),
        )
        .init();

    let result = match cli.command {
        Commands::Run {
            template,
            input,
            workers,
            config,
            max_concurrency,
            global_timeout_ms,
            output,
            quiet,
        } => {
            commands::run::run(RunArgs {
                template,
                input,
                workers,
                config,
                max_concurrency,
                global_timeout_ms,
                output,
                quiet,
            })
            .await
        }
        Commands::Validate { template, workers } => {
            commands::validate::validate(&template, workers.as_deref())
        }
        Commands::Plan { template, json } => commands::plan::plan(&template, json).map(|_| ()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
