//! FSM and status-query HTTP routes, one module per resource.

pub mod array;
pub mod cli;
pub mod dag;
pub mod task;
pub mod task_instance;
pub mod workflow;
pub mod workflow_run;

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use jobmon_core::contracts::ServerTimeResponse;

use crate::error::ServerError;
use crate::storage::StateStore;

/// App state shared across routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// `GET /health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /time`: the clock every agent treats as authoritative.
pub async fn server_time(
    State(state): State<AppState>,
) -> Result<Json<ServerTimeResponse>, ServerError> {
    let time: DateTime<Utc> = state.store.now().await?;
    Ok(Json(ServerTimeResponse { time }))
}
