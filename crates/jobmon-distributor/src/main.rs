//! jobmon-distributor binary.
//!
//! Attaches to a workflow run and dispatches its task instances to the
//! configured cluster until signaled to stop.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobmon_client::Requester;
use jobmon_core::cluster::ClusterDistributor;
use jobmon_core::config::DistributorConfig;
use jobmon_distributor::{DistributorService, LocalProcessCluster};

#[derive(Parser)]
#[command(name = "jobmon-distributor", about = "Jobmon cluster dispatcher")]
struct Args {
    /// The workflow run to dispatch for.
    #[arg(long)]
    workflow_run_id: i64,

    /// Cluster plugin to use.
    #[arg(long, default_value = "local_process")]
    cluster: String,

    /// Worker-node invocation for the local_process cluster.
    #[arg(long, default_value = "jobmon-worker")]
    worker_command: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobmon_distributor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let cluster: Arc<dyn ClusterDistributor> = match args.cluster.as_str() {
        "local_process" => Arc::new(LocalProcessCluster::new(args.worker_command)),
        other => bail!("unknown cluster plugin '{other}'"),
    };

    let requester = Requester::from_defaults();
    let shutdown = jobmon_distributor::signals::install().context("failed to install signals")?;

    let mut service =
        DistributorService::new(cluster, requester, DistributorConfig::from_env());
    service.set_workflow_run(args.workflow_run_id).await?;
    service.run(shutdown).await?;
    Ok(())
}
