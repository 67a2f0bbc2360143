//! Dag routes: topology seeding shared across workflows with the same hash.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};

use jobmon_core::contracts::*;

use crate::error::ServerError;

use super::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/dag", post(add_dag))
        .route("/dag/:dag_id/edges", post(add_edges))
        .with_state(state)
}

pub async fn add_dag(
    State(state): State<AppState>,
    Json(request): Json<AddDagRequest>,
) -> Result<Json<AddDagResponse>, ServerError> {
    let (dag_id, newly_created) = state.store.add_dag(&request.hash).await?;
    Ok(Json(AddDagResponse {
        dag_id,
        newly_created,
    }))
}

pub async fn add_edges(
    State(state): State<AppState>,
    Path(dag_id): Path<i64>,
    Json(request): Json<AddEdgesRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.store.add_edges(dag_id, request.edges).await?;
    Ok(Json(serde_json::json!({})))
}
