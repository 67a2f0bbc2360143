//! Workflow-run routes: registration, heartbeats, status sync, triage sweep.

use axum::extract::{Path, State};
use axum::routing::{post, put};
use axum::{Json, Router};

use jobmon_core::contracts::*;

use crate::error::ServerError;

use super::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflow_run", post(register_workflow_run))
        .route("/workflow_run/:workflow_run_id/update_status", put(update_status))
        .route("/workflow_run/:workflow_run_id/log_heartbeat", post(log_heartbeat))
        .route("/workflow_run/:workflow_run_id/sync_status", post(sync_status))
        .route(
            "/workflow_run/:workflow_run_id/set_status_for_triaging",
            post(set_status_for_triaging),
        )
        .route(
            "/workflow_run/:workflow_run_id/terminate_task_instances",
            post(terminate_task_instances),
        )
        .with_state(state)
}

/// POST /workflow_run - create a run; refuses while another run is live
#[utoipa::path(
    post,
    path = "/workflow_run",
    request_body = RegisterWorkflowRunRequest,
    responses(
        (status = 200, description = "Run registered", body = RegisterWorkflowRunResponse),
        (status = 409, description = "Another run is active and unresumed")
    ),
    tag = "workflow_run"
)]
pub async fn register_workflow_run(
    State(state): State<AppState>,
    Json(request): Json<RegisterWorkflowRunRequest>,
) -> Result<Json<RegisterWorkflowRunResponse>, ServerError> {
    let (workflow_run_id, status) = state
        .store
        .register_workflow_run(
            request.workflow_id,
            &request.user,
            &request.jobmon_version,
            request.next_report_increment,
        )
        .await?;
    Ok(Json(RegisterWorkflowRunResponse {
        workflow_run_id,
        status,
    }))
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(workflow_run_id): Path<i64>,
    Json(request): Json<UpdateWorkflowRunStatusRequest>,
) -> Result<Json<WorkflowRunStatusResponse>, ServerError> {
    let status = state
        .store
        .update_workflow_run_status(workflow_run_id, request.status)
        .await?;
    Ok(Json(WorkflowRunStatusResponse { status }))
}

/// POST /workflow_run/{id}/log_heartbeat - extend liveness, detect resume
#[utoipa::path(
    post,
    path = "/workflow_run/{workflow_run_id}/log_heartbeat",
    request_body = LogHeartbeatRequest,
    responses(
        (status = 200, description = "Authoritative run status", body = WorkflowRunStatusResponse)
    ),
    tag = "workflow_run"
)]
pub async fn log_heartbeat(
    State(state): State<AppState>,
    Path(workflow_run_id): Path<i64>,
    Json(request): Json<LogHeartbeatRequest>,
) -> Result<Json<WorkflowRunStatusResponse>, ServerError> {
    let status = state
        .store
        .log_workflow_run_heartbeat(workflow_run_id, request.status, request.next_report_increment)
        .await?;
    Ok(Json(WorkflowRunStatusResponse { status }))
}

pub async fn sync_status(
    State(state): State<AppState>,
    Path(workflow_run_id): Path<i64>,
    Json(request): Json<SyncStatusRequest>,
) -> Result<Json<SyncStatusResponse>, ServerError> {
    let status_updates = state
        .store
        .sync_status(workflow_run_id, request.status, request.task_instance_ids)
        .await?;
    Ok(Json(SyncStatusResponse { status_updates }))
}

pub async fn set_status_for_triaging(
    State(state): State<AppState>,
    Path(workflow_run_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let moved = state.store.set_status_for_triaging(workflow_run_id).await?;
    Ok(Json(serde_json::json!({ "moved": moved })))
}

pub async fn terminate_task_instances(
    State(state): State<AppState>,
    Path(workflow_run_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let flagged = state.store.terminate_task_instances(workflow_run_id).await?;
    Ok(Json(serde_json::json!({ "flagged": flagged })))
}
