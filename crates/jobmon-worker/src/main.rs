//! jobmon-worker binary.
//!
//! Invoked by the cluster as the batch step for one task instance. The
//! instance id comes from the command line or, for array steps, from the
//! `JOBMON_TASK_INSTANCE_ID` environment the submission set up.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobmon_client::Requester;
use jobmon_core::config::WorkerConfig;
use jobmon_core::constants::TaskInstanceStatus;
use jobmon_worker::{LocalWorkerNode, WorkerNodeTaskInstance};

#[derive(Parser)]
#[command(name = "jobmon-worker", about = "Jobmon task-instance runtime")]
struct Args {
    /// The task instance to execute.
    #[arg(long)]
    task_instance_id: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobmon_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let task_instance_id = match args.task_instance_id {
        Some(task_instance_id) => task_instance_id,
        None => match std::env::var("JOBMON_TASK_INSTANCE_ID") {
            Ok(raw) => raw.parse()?,
            Err(_) => bail!("no task instance id on the command line or in the environment"),
        },
    };

    let mut task_instance = WorkerNodeTaskInstance::new(
        Requester::from_defaults(),
        Arc::new(LocalWorkerNode),
        task_instance_id,
        WorkerConfig::from_env(),
    );

    let status = task_instance.run().await?;
    if status == TaskInstanceStatus::Done {
        Ok(())
    } else {
        bail!("task instance {task_instance_id} finished in status {status}")
    }
}
