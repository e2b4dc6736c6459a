//! specflow CLI: run declarative multi-phase agent workflows.
//!
//! A thin front end over `specflow-core`: argument parsing, environment
//! loading and logging setup live here, everything else in the core crate.

use clap::{Parser, Subcommand};

use specflow_cli::commands::{self, workflow::RunOptions, DefinitionDirs};

/// specflow: declarative agent workflows
#[derive(Parser)]
#[command(name = "specflow", version, about = "specflow: declarative multi-phase agent workflows")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run, validate and inspect YAML-defined workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Execute a workflow file
    Run {
        /// Path to the workflow YAML file
        file: String,
        /// Invocation parameter as key=value (repeatable). Values that parse
        /// as JSON are passed as JSON.
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
        /// Shorthand for --param specPath=<path>
        #[arg(long)]
        spec: Option<String>,
        #[command(flatten)]
        dirs: DefinitionDirs,
        /// Messages API key
        #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
        /// Messages API base URL
        #[arg(long, env = "ANTHROPIC_BASE_URL")]
        base_url: Option<String>,
        /// Fallback model when neither step, agent nor workflow names one
        #[arg(long, env = "ANTHROPIC_MODEL")]
        model: Option<String>,
        /// Print the run outcome as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Validate a workflow file without executing it
    Validate {
        /// Path to the workflow YAML file
        file: String,
    },

    /// List agents, gates, prompts and schemas resolvable from the
    /// definition directories
    Agents {
        #[command(flatten)]
        dirs: DefinitionDirs,
    },
}

#[tokio::main]
async fn main() {
    // .env.local wins over .env; neither overrides the real environment
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "specflow_core=info,specflow_cli=info".into()),
        )
        .init();

    let result = match cli.command {
        Some(Commands::Workflow { action }) => match action {
            WorkflowAction::Run {
                file,
                params,
                spec,
                dirs,
                api_key,
                base_url,
                model,
                json,
            } => {
                let options = RunOptions {
                    params,
                    spec,
                    dirs,
                    api_key,
                    base_url,
                    model,
                    json,
                };
                commands::workflow::run(&file, options).await
            }
            WorkflowAction::Validate { file } => commands::workflow::validate(&file),
            WorkflowAction::Agents { dirs } => commands::workflow::agents(&dirs),
        },
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
