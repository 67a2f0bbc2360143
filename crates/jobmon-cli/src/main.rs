//! The `jobmon` status tool.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use jobmon_client::Requester;

#[derive(Parser)]
#[command(name = "jobmon", about = "Jobmon workflow status tool", version)]
struct Cli {
    /// State server url; defaults to JOBMON_SERVICE_URL.
    #[arg(long, global = true)]
    service_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a workflow and its task counts.
    WorkflowStatus {
        #[arg(short = 'w', long)]
        workflow_id: i64,
        /// Emit JSON instead of text.
        #[arg(short = 'n', long)]
        json: bool,
    },

    /// List a workflow's tasks.
    WorkflowTasks {
        #[arg(short = 'w', long)]
        workflow_id: i64,
        /// Filter by status codes, comma separated (e.g. "R,F").
        #[arg(short = 's', long)]
        status: Option<String>,
        #[arg(short = 'l', long, default_value_t = 50)]
        limit: usize,
        #[arg(short = 'n', long)]
        json: bool,
    },

    /// Show tasks with their most recent attempt and error.
    TaskStatus {
        /// Task ids, comma separated.
        #[arg(short = 't', long)]
        task_ids: String,
        #[arg(short = 'n', long)]
        json: bool,
    },

    /// Override task statuses (admin reset).
    UpdateTaskStatus {
        #[arg(short = 't', long)]
        task_ids: String,
        #[arg(short = 'w', long)]
        workflow_id: i64,
        /// Target status code (e.g. "G" to reset, "D" to mark done).
        #[arg(short = 's', long)]
        new_status: String,
        /// When resetting, also reset the downstream closure.
        #[arg(long)]
        recursive: bool,
    },

    /// Change a workflow's concurrency cap.
    ConcurrencyLimit {
        #[arg(short = 'w', long)]
        workflow_id: i64,
        /// New maximum number of concurrently running tasks.
        #[arg(short = 'm', long)]
        max_tasks: i64,
    },

    /// Show a task's upstream and downstream tasks.
    TaskDependencies {
        #[arg(short = 't', long)]
        task_id: i64,
    },

    /// Signal resume and reset the unfinished tasks of a workflow.
    WorkflowReset {
        #[arg(short = 'w', long)]
        workflow_id: i64,
    },

    /// Signal a resume so a new workflow run can take over.
    WorkflowResume {
        #[arg(short = 'w', long)]
        workflow_id: i64,
        /// Also reset tasks that are currently running.
        #[arg(long)]
        reset_running_jobs: bool,
    },

    /// Print the client version.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let requester = match &cli.service_url {
        Some(url) => Requester::new(url),
        None => Requester::from_defaults(),
    };

    match cli.command {
        Commands::WorkflowStatus { workflow_id, json } => {
            commands::workflow_status(&requester, workflow_id, json).await
        }
        Commands::WorkflowTasks {
            workflow_id,
            status,
            limit,
            json,
        } => commands::workflow_tasks(&requester, workflow_id, status, limit, json).await,
        Commands::TaskStatus { task_ids, json } => {
            commands::task_status(&requester, &task_ids, json).await
        }
        Commands::UpdateTaskStatus {
            task_ids,
            workflow_id,
            new_status,
            recursive,
        } => {
            commands::update_task_status(&requester, &task_ids, workflow_id, &new_status, recursive)
                .await
        }
        Commands::ConcurrencyLimit {
            workflow_id,
            max_tasks,
        } => commands::concurrency_limit(&requester, workflow_id, max_tasks).await,
        Commands::TaskDependencies { task_id } => {
            commands::task_dependencies(&requester, task_id).await
        }
        Commands::WorkflowReset { workflow_id } => {
            commands::workflow_reset(&requester, workflow_id).await
        }
        Commands::WorkflowResume {
            workflow_id,
            reset_running_jobs,
        } => commands::workflow_resume(&requester, workflow_id, reset_running_jobs).await,
        Commands::Version => {
            println!("jobmon {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
