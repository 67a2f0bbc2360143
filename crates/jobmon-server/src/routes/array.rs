//! Array routes: the batch-oriented half of the task-instance lifecycle.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use jobmon_core::contracts::*;

use crate::error::ServerError;

use super::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/array", post(add_array))
        .route("/array/:array_id/queue_task_batch", post(queue_task_batch))
        .route("/array/:array_id/transition_to_launched", post(transition_to_launched))
        .route("/array/:array_id/transition_to_killed", post(transition_to_killed))
        .route("/array/:array_id/log_distributor_id", post(log_distributor_id))
        .route(
            "/array/:array_id/get_array_max_concurrently_running",
            get(get_array_max_concurrently_running),
        )
        .with_state(state)
}

pub async fn add_array(
    State(state): State<AppState>,
    Json(request): Json<AddArrayRequest>,
) -> Result<Json<AddArrayResponse>, ServerError> {
    let array_id = state.store.add_array(request).await?;
    Ok(Json(AddArrayResponse { array_id }))
}

pub async fn queue_task_batch(
    State(state): State<AppState>,
    Path(array_id): Path<i64>,
    Json(request): Json<QueueTaskBatchRequest>,
) -> Result<Json<TasksByStatusResponse>, ServerError> {
    let tasks_by_status = state
        .store
        .queue_task_batch(
            array_id,
            request.task_ids,
            request.task_resources_id,
            request.workflow_run_id,
        )
        .await?;
    Ok(Json(TasksByStatusResponse { tasks_by_status }))
}

pub async fn transition_to_launched(
    State(state): State<AppState>,
    Path(array_id): Path<i64>,
    Json(request): Json<TransitionBatchToLaunchedRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .store
        .transition_batch_to_launched(array_id, request.batch_number, request.next_report_increment)
        .await?;
    Ok(Json(serde_json::json!({})))
}

pub async fn transition_to_killed(
    State(state): State<AppState>,
    Path(array_id): Path<i64>,
    Json(request): Json<TransitionBatchToKilledRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .store
        .transition_batch_to_killed(array_id, request.batch_number)
        .await?;
    Ok(Json(serde_json::json!({})))
}

pub async fn log_distributor_id(
    State(state): State<AppState>,
    Path(array_id): Path<i64>,
    Json(request): Json<LogArrayDistributorIdRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .store
        .log_array_distributor_ids(array_id, request.distributor_ids)
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn get_array_max_concurrently_running(
    State(state): State<AppState>,
    Path(array_id): Path<i64>,
) -> Result<Json<MaxConcurrentlyRunningResponse>, ServerError> {
    let max_concurrently_running = state.store.array_max_concurrently_running(array_id).await?;
    Ok(Json(MaxConcurrentlyRunningResponse {
        max_concurrently_running,
    }))
}
