//! Conductor CLI — run and inspect agent workflows from the command line.
//!
//! Every command builds the same `AppState` from conductor-core: a SQLite
//! database for definitions and execution history plus an agent registry
//! populated from the config file.

use clap::{Parser, Subcommand};

use conductor_cli::commands;

/// Conductor CLI — agent dispatch and workflow orchestration
#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Conductor CLI — agent dispatch and workflow orchestration"
)]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "CONDUCTOR_DB_PATH")]
    db: Option<String>,

    /// Path to a YAML config file (agents and engine settings)
    #[arg(long, env = "CONDUCTOR_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Define, run and inspect workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Inspect registered agents
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Run a workflow from a YAML file and wait for it to finish
    Run {
        /// Path to the workflow YAML file
        file: String,
        /// Workflow input as key=value (repeatable; values are parsed as JSON when possible)
        #[arg(long = "input", short = 'i')]
        inputs: Vec<String>,
        /// Recorded as the execution's initiator
        #[arg(long, default_value = "cli")]
        executed_by: String,
    },
    /// Validate a workflow YAML file without executing it
    Validate {
        /// Path to the workflow YAML file
        file: String,
    },
    /// Show the layers a workflow would run in
    Plan {
        /// Path to the workflow YAML file
        file: String,
    },
    /// Store a workflow definition from a YAML file
    Create {
        /// Path to the workflow YAML file
        file: String,
    },
    /// List stored workflow definitions
    List,
    /// Delete a stored workflow definition
    Delete {
        /// Workflow ID
        #[arg(long)]
        id: String,
    },
    /// Run a stored workflow and wait for it to finish
    Start {
        /// Workflow ID
        #[arg(long)]
        id: String,
        /// Workflow input as key=value (repeatable)
        #[arg(long = "input", short = 'i')]
        inputs: Vec<String>,
        /// Recorded as the execution's initiator
        #[arg(long, default_value = "cli")]
        executed_by: String,
    },
    /// List execution history
    Executions {
        /// Only executions of this workflow
        #[arg(long)]
        workflow_id: Option<String>,
    },
    /// Show one execution record
    Execution {
        /// Execution ID
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// List registered agents
    List,
    /// Show the health of every registered agent
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor_core=warn,conductor_cli=info".into()),
        )
        .init();

    let result = if let Some(command) = cli.command {
        match commands::init_state(cli.db.as_deref(), cli.config.as_deref()).await {
            Err(e) => Err(e),
            Ok(state) => {
                let outcome = match command {
                    Commands::Workflow { action } => match action {
                        WorkflowAction::Run {
                            file,
                            inputs,
                            executed_by,
                        } => commands::workflow::run(&state, &file, &inputs, &executed_by).await,
                        WorkflowAction::Validate { file } => {
                            commands::workflow::validate(&state, &file).await
                        }
                        WorkflowAction::Plan { file } => commands::workflow::plan(&file).await,
                        WorkflowAction::Create { file } => {
                            commands::workflow::create(&state, &file).await
                        }
                        WorkflowAction::List => commands::workflow::list(&state).await,
                        WorkflowAction::Delete { id } => {
                            commands::workflow::delete(&state, &id).await
                        }
                        WorkflowAction::Start {
                            id,
                            inputs,
                            executed_by,
                        } => commands::workflow::start(&state, &id, &inputs, &executed_by).await,
                        WorkflowAction::Executions { workflow_id } => {
                            commands::workflow::executions(&state, workflow_id.as_deref()).await
                        }
                        WorkflowAction::Execution { id } => {
                            commands::workflow::execution(&state, &id).await
                        }
                    },

                    Commands::Agent { action } => match action {
                        AgentAction::List => commands::agent::list(&state).await,
                        AgentAction::Health => commands::agent::health(&state).await,
                    },
                };
                state.registry.stop_all().await;
                outcome
            }
        }
    } else {
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        Ok(())
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
