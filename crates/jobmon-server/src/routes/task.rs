//! Task routes: binding, edge queries, resume reset and admin overrides.

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};

use jobmon_core::contracts::*;

use crate::error::ServerError;

use super::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/task/bind_tasks", put(bind_tasks))
        .route("/task/bind_resources", post(bind_resources))
        .route("/task_resources/:task_resources_id", get(get_task_resources))
        .route("/task/get_downstream_tasks", post(get_downstream_tasks))
        .route("/task/:workflow_id/set_resume_state", post(set_resume_state))
        .route("/task/update_statuses", put(update_statuses))
        .route("/task/:task_id/most_recent_ti_error", get(most_recent_ti_error))
        .route("/task_dependencies/:task_id", get(task_dependencies))
        .route("/tasks_recursive/:direction", put(tasks_recursive))
        .with_state(state)
}

pub async fn bind_tasks(
    State(state): State<AppState>,
    Json(request): Json<BindTasksRequest>,
) -> Result<Json<BindTasksResponse>, ServerError> {
    let tasks = state
        .store
        .bind_tasks(request.workflow_id, request.tasks)
        .await?;
    Ok(Json(BindTasksResponse { tasks }))
}

pub async fn bind_resources(
    State(state): State<AppState>,
    Json(request): Json<BindTaskResourcesRequest>,
) -> Result<Json<BindTaskResourcesResponse>, ServerError> {
    let task_resources_id = state
        .store
        .bind_task_resources(
            &request.queue_name,
            &request.cluster_name,
            request.requested_resources,
        )
        .await?;
    Ok(Json(BindTaskResourcesResponse { task_resources_id }))
}

pub async fn get_task_resources(
    State(state): State<AppState>,
    Path(task_resources_id): Path<i64>,
) -> Result<Json<TaskResourcesWire>, ServerError> {
    Ok(Json(state.store.task_resources(task_resources_id).await?))
}

pub async fn get_downstream_tasks(
    State(state): State<AppState>,
    Json(request): Json<GetDownstreamTasksRequest>,
) -> Result<Json<GetDownstreamTasksResponse>, ServerError> {
    let downstream_tasks = state
        .store
        .get_downstream_tasks(request.task_ids, request.dag_id)
        .await?;
    Ok(Json(GetDownstreamTasksResponse { downstream_tasks }))
}

pub async fn set_resume_state(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Json(request): Json<SetTaskResumeStateRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let reset = state
        .store
        .set_task_resume_state(workflow_id, request.reset_if_running)
        .await?;
    Ok(Json(serde_json::json!({ "reset": reset })))
}

pub async fn update_statuses(
    State(state): State<AppState>,
    Json(request): Json<UpdateTaskStatusesRequest>,
) -> Result<Json<MessageResponse>, ServerError> {
    let updated = state
        .store
        .update_task_statuses(request.task_ids, request.new_status, request.workflow_id)
        .await?;
    Ok(Json(MessageResponse {
        message: format!("{updated} task statuses updated to {}", request.new_status),
    }))
}

pub async fn most_recent_ti_error(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<MostRecentErrorResponse>, ServerError> {
    let error = state.store.most_recent_ti_error(task_id).await?;
    let (error_description, task_instance_id) = match error {
        Some((description, task_instance_id)) => (description, Some(task_instance_id)),
        None => (String::new(), None),
    };
    Ok(Json(MostRecentErrorResponse {
        error_description,
        task_instance_id,
    }))
}

pub async fn task_dependencies(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskDependenciesResponse>, ServerError> {
    let (up, down) = state.store.task_dependencies(task_id).await?;
    Ok(Json(TaskDependenciesResponse { up, down }))
}

pub async fn tasks_recursive(
    State(state): State<AppState>,
    Path(direction): Path<String>,
    Json(request): Json<TasksRecursiveRequest>,
) -> Result<Json<TasksRecursiveResponse>, ServerError> {
    let downstream = match direction.as_str() {
        "down" => true,
        "up" => false,
        other => {
            return Err(ServerError(crate::storage::StoreError::InvalidArgument(
                format!("direction must be 'up' or 'down', got '{other}'"),
            )))
        }
    };
    let task_ids = state
        .store
        .tasks_recursive(request.task_ids, downstream)
        .await?;
    Ok(Json(TasksRecursiveResponse { task_ids }))
}
