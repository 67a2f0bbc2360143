//! jobmon-server binary.
//!
//! Serves the FSM API. `DATABASE_URL` selects PostgreSQL; without it the
//! server runs on the in-memory store (single-process deployments, demos).

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobmon_server::storage::{MemoryStateStore, PostgresStateStore, StateStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobmon_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn StateStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = sqlx::PgPool::connect(&database_url)
                .await
                .context("failed to connect to PostgreSQL")?;
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("failed to run migrations")?;
            info!("using PostgreSQL state store");
            Arc::new(PostgresStateStore::new(pool))
        }
        Err(_) => {
            info!("DATABASE_URL not set, using in-memory state store");
            Arc::new(MemoryStateStore::new())
        }
    };

    let app = jobmon_server::build_app(store);

    let bind_addr =
        std::env::var("JOBMON_SERVER_BIND").unwrap_or_else(|_| "0.0.0.0:8070".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("jobmon state server listening on {bind_addr}");

    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}
