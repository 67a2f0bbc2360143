//! Status-query routes backing the `jobmon` CLI.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use jobmon_core::constants::TaskStatus;
use jobmon_core::contracts::*;

use crate::error::ServerError;
use crate::storage::StoreError;

use super::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/cli/workflow_status/:workflow_id", get(workflow_status))
        .route("/cli/workflow_tasks/:workflow_id", get(workflow_tasks))
        .route("/cli/task_status", get(task_status))
        .with_state(state)
}

pub async fn workflow_status(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> Result<Json<WorkflowStatusRow>, ServerError> {
    Ok(Json(state.store.workflow_status_row(workflow_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct WorkflowTasksParams {
    /// Comma-separated status codes.
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn workflow_tasks(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Query(params): Query<WorkflowTasksParams>,
) -> Result<Json<WorkflowTasksResponse>, ServerError> {
    let statuses = params
        .status
        .map(|raw| {
            raw.split(',')
                .map(|code| {
                    TaskStatus::parse(code.trim()).ok_or_else(|| {
                        StoreError::InvalidArgument(format!("bad task status code '{code}'"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;
    let tasks = state
        .store
        .workflow_tasks(workflow_id, statuses, params.limit)
        .await?;
    Ok(Json(WorkflowTasksResponse { tasks }))
}

#[derive(Debug, Deserialize)]
pub struct TaskStatusParams {
    /// Comma-separated task ids.
    pub task_ids: String,
}

pub async fn task_status(
    State(state): State<AppState>,
    Query(params): Query<TaskStatusParams>,
) -> Result<Json<TaskStatusRowsResponse>, ServerError> {
    let task_ids = params
        .task_ids
        .split(',')
        .filter_map(|id| id.trim().parse().ok())
        .collect();
    let task_instances = state.store.task_status_rows(task_ids).await?;
    Ok(Json(TaskStatusRowsResponse { task_instances }))
}
