//! Workflow routes.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use jobmon_core::contracts::*;

use crate::error::ServerError;

use super::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflow", post(bind_workflow))
        .route("/workflow/:workflow_id/fetch_workflow_metadata", get(fetch_workflow_metadata))
        .route("/workflow/:workflow_id/is_resumable", get(is_resumable))
        .route("/workflow/:workflow_id/set_resume", post(set_resume))
        .route(
            "/workflow/:workflow_id/get_max_concurrently_running",
            get(get_max_concurrently_running),
        )
        .route(
            "/workflow/:workflow_id/update_max_concurrently_running",
            put(update_max_concurrently_running),
        )
        .route(
            "/workflow/:workflow_id/update_array_max_concurrently_running",
            put(update_array_max_concurrently_running),
        )
        .route("/workflow/get_tasks/:workflow_id", get(get_tasks))
        .route("/workflow/:workflow_id/task_status_updates", post(task_status_updates))
        .with_state(state)
}

/// POST /workflow - upsert a workflow by its identity tuple
#[utoipa::path(
    post,
    path = "/workflow",
    request_body = BindWorkflowRequest,
    responses(
        (status = 200, description = "Workflow bound", body = BindWorkflowResponse),
        (status = 500, description = "Internal server error")
    ),
    tag = "workflow"
)]
pub async fn bind_workflow(
    State(state): State<AppState>,
    Json(request): Json<BindWorkflowRequest>,
) -> Result<Json<BindWorkflowResponse>, ServerError> {
    let (workflow_id, status, newly_created) = state.store.bind_workflow(request).await?;
    Ok(Json(BindWorkflowResponse {
        workflow_id,
        status,
        newly_created,
    }))
}

pub async fn fetch_workflow_metadata(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> Result<Json<WorkflowMetadataResponse>, ServerError> {
    let workflow = state.store.workflow_metadata(workflow_id).await?;
    Ok(Json(WorkflowMetadataResponse { workflow }))
}

pub async fn is_resumable(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> Result<Json<IsResumableResponse>, ServerError> {
    let workflow_is_resumable = state.store.is_resumable(workflow_id).await?;
    Ok(Json(IsResumableResponse {
        workflow_is_resumable,
    }))
}

/// POST /workflow/{id}/set_resume - signal active runs to stand down
#[utoipa::path(
    post,
    path = "/workflow/{workflow_id}/set_resume",
    request_body = SetResumeRequest,
    responses(
        (status = 200, description = "Resume signaled"),
        (status = 401, description = "Caller does not own the latest run"),
        (status = 404, description = "No such workflow")
    ),
    tag = "workflow"
)]
pub async fn set_resume(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Json(request): Json<SetResumeRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .store
        .set_resume(workflow_id, request.reset_running_jobs, &request.user)
        .await?;
    Ok(Json(serde_json::json!({})))
}

pub async fn get_max_concurrently_running(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> Result<Json<MaxConcurrentlyRunningResponse>, ServerError> {
    let max_concurrently_running = state.store.max_concurrently_running(workflow_id).await?;
    Ok(Json(MaxConcurrentlyRunningResponse {
        max_concurrently_running,
    }))
}

pub async fn update_max_concurrently_running(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Json(request): Json<UpdateMaxConcurrentlyRunningRequest>,
) -> Result<Json<MessageResponse>, ServerError> {
    let updated = state
        .store
        .update_max_concurrently_running(workflow_id, request.max_tasks, &request.user)
        .await?;
    let message = if updated == 0 {
        format!("no update performed for workflow {workflow_id}")
    } else {
        format!(
            "workflow {workflow_id} max concurrently running updated to {}",
            request.max_tasks
        )
    };
    Ok(Json(MessageResponse { message }))
}

pub async fn update_array_max_concurrently_running(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Json(request): Json<UpdateArrayMaxConcurrentlyRunningRequest>,
) -> Result<Json<MessageResponse>, ServerError> {
    let updated = state
        .store
        .update_array_max_concurrently_running(
            workflow_id,
            request.array_id,
            request.max_tasks,
            &request.user,
        )
        .await?;
    let message = if updated == 0 {
        format!(
            "error updating max_concurrently_running for array {} in workflow {workflow_id}",
            request.array_id
        )
    } else {
        format!(
            "array {} max concurrently running updated to {}",
            request.array_id, request.max_tasks
        )
    };
    Ok(Json(MessageResponse { message }))
}

#[derive(Debug, Deserialize)]
pub struct GetTasksParams {
    #[serde(default)]
    pub max_task_id: i64,
    pub chunk_size: usize,
}

/// GET /workflow/get_tasks/{id} - paginated resume fetch of non-DONE tasks
#[utoipa::path(
    get,
    path = "/workflow/get_tasks/{workflow_id}",
    params(
        ("max_task_id" = i64, Query, description = "Exclusive task-id cursor"),
        ("chunk_size" = usize, Query, description = "Max rows to return")
    ),
    responses(
        (status = 200, description = "Task metadata chunk", body = GetTasksResponse)
    ),
    tag = "workflow"
)]
pub async fn get_tasks(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Query(params): Query<GetTasksParams>,
) -> Result<Json<GetTasksResponse>, ServerError> {
    let tasks = state
        .store
        .get_tasks(workflow_id, params.max_task_id, params.chunk_size)
        .await?;
    Ok(Json(GetTasksResponse { tasks }))
}

pub async fn task_status_updates(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Json(request): Json<TaskStatusUpdatesRequest>,
) -> Result<Json<TaskStatusUpdatesResponse>, ServerError> {
    let (tasks_by_status, time) = state
        .store
        .task_status_updates(workflow_id, request.last_sync)
        .await?;
    Ok(Json(TaskStatusUpdatesResponse {
        tasks_by_status,
        time,
    }))
}
