//! Task-instance routes: the worker and distributor sides of the FSM.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use jobmon_core::contracts::*;

use crate::error::ServerError;
use crate::storage::{RunningReport, WorkerReport};

use super::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/task_instance/instantiate_task_instances",
            post(instantiate_task_instances),
        )
        .route("/task_instance/:task_instance_id/log_running", post(log_running))
        .route("/task_instance/:task_instance_id/log_done", post(log_done))
        .route(
            "/task_instance/:task_instance_id/log_error_worker_node",
            post(log_error_worker_node),
        )
        .route("/task_instance/:task_instance_id/log_report_by", post(log_report_by))
        .route("/task_instance/log_report_by/batch", post(log_report_by_batch))
        .route(
            "/task_instance/:task_instance_id/log_distributor_id",
            post(log_distributor_id),
        )
        .route(
            "/task_instance/:task_instance_id/log_no_distributor_id",
            post(log_no_distributor_id),
        )
        .route("/task_instance/:task_instance_id/log_known_error", post(log_known_error))
        .route(
            "/task_instance/:task_instance_id/log_unknown_error",
            post(log_unknown_error),
        )
        .route(
            "/task_instance/:task_instance_id/task_instance_error_log",
            get(task_instance_error_log),
        )
        .with_state(state)
}

pub async fn instantiate_task_instances(
    State(state): State<AppState>,
    Json(request): Json<InstantiateTaskInstancesRequest>,
) -> Result<Json<InstantiateTaskInstancesResponse>, ServerError> {
    let task_instance_batches = state
        .store
        .instantiate_task_instances(request.task_instance_ids)
        .await?;
    Ok(Json(InstantiateTaskInstancesResponse {
        task_instance_batches,
    }))
}

pub async fn log_running(
    State(state): State<AppState>,
    Path(task_instance_id): Path<i64>,
    Json(request): Json<LogRunningRequest>,
) -> Result<Json<LogRunningResponse>, ServerError> {
    let task_instance = state
        .store
        .log_running(
            task_instance_id,
            RunningReport {
                nodename: request.nodename,
                process_group_id: request.process_group_id,
                next_report_increment: request.next_report_increment,
                distributor_id: request.distributor_id,
            },
        )
        .await?;
    Ok(Json(LogRunningResponse { task_instance }))
}

pub async fn log_done(
    State(state): State<AppState>,
    Path(task_instance_id): Path<i64>,
    Json(request): Json<LogDoneRequest>,
) -> Result<Json<TaskInstanceStatusResponse>, ServerError> {
    let status = state
        .store
        .log_done(
            task_instance_id,
            WorkerReport {
                distributor_id: request.distributor_id,
                nodename: request.nodename,
                stdout: request.stdout,
                stderr: request.stderr,
                stdout_log: request.stdout_log,
                stderr_log: request.stderr_log,
            },
        )
        .await?;
    Ok(Json(TaskInstanceStatusResponse { status }))
}

pub async fn log_error_worker_node(
    State(state): State<AppState>,
    Path(task_instance_id): Path<i64>,
    Json(request): Json<LogErrorWorkerNodeRequest>,
) -> Result<Json<TaskInstanceStatusResponse>, ServerError> {
    let status = state
        .store
        .log_error_worker_node(
            task_instance_id,
            request.error_state,
            request.error_description,
            WorkerReport {
                distributor_id: request.distributor_id,
                nodename: request.nodename,
                stdout: request.stdout,
                stderr: request.stderr,
                stdout_log: request.stdout_log,
                stderr_log: request.stderr_log,
            },
        )
        .await?;
    Ok(Json(TaskInstanceStatusResponse { status }))
}

pub async fn log_report_by(
    State(state): State<AppState>,
    Path(task_instance_id): Path<i64>,
    Json(request): Json<LogReportByRequest>,
) -> Result<Json<TaskInstanceStatusResponse>, ServerError> {
    let status = state
        .store
        .log_report_by(
            task_instance_id,
            request.next_report_increment,
            WorkerReport {
                distributor_id: request.distributor_id,
                stdout: request.stdout,
                stderr: request.stderr,
                ..Default::default()
            },
        )
        .await?;
    Ok(Json(TaskInstanceStatusResponse { status }))
}

pub async fn log_report_by_batch(
    State(state): State<AppState>,
    Json(request): Json<LogReportByBatchRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .store
        .log_report_by_batch(request.task_instance_ids, request.next_report_increment)
        .await?;
    Ok(Json(serde_json::json!({})))
}

pub async fn log_distributor_id(
    State(state): State<AppState>,
    Path(task_instance_id): Path<i64>,
    Json(request): Json<LogDistributorIdRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .store
        .log_distributor_id(
            task_instance_id,
            &request.distributor_id,
            request.next_report_increment,
        )
        .await?;
    Ok(Json(serde_json::json!({})))
}

pub async fn log_no_distributor_id(
    State(state): State<AppState>,
    Path(task_instance_id): Path<i64>,
    Json(request): Json<LogNoDistributorIdRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .store
        .log_no_distributor_id(task_instance_id, &request.no_id_err_msg)
        .await?;
    Ok(Json(serde_json::json!({})))
}

pub async fn log_known_error(
    State(state): State<AppState>,
    Path(task_instance_id): Path<i64>,
    Json(request): Json<LogTriageErrorRequest>,
) -> Result<Json<TaskInstanceStatusResponse>, ServerError> {
    let status = state
        .store
        .log_triage_error(
            task_instance_id,
            request.error_state,
            request.error_message,
            request.distributor_id,
            request.nodename,
            false,
        )
        .await?;
    Ok(Json(TaskInstanceStatusResponse { status }))
}

/// Unknown errors race against late heartbeats: the transition only applies
/// if the report-by deadline has really elapsed.
pub async fn log_unknown_error(
    State(state): State<AppState>,
    Path(task_instance_id): Path<i64>,
    Json(request): Json<LogTriageErrorRequest>,
) -> Result<Json<TaskInstanceStatusResponse>, ServerError> {
    let status = state
        .store
        .log_triage_error(
            task_instance_id,
            request.error_state,
            request.error_message,
            request.distributor_id,
            request.nodename,
            true,
        )
        .await?;
    Ok(Json(TaskInstanceStatusResponse { status }))
}

pub async fn task_instance_error_log(
    State(state): State<AppState>,
    Path(task_instance_id): Path<i64>,
) -> Result<Json<TaskInstanceErrorLogResponse>, ServerError> {
    let task_instance_error_log = state.store.task_instance_error_log(task_instance_id).await?;
    Ok(Json(TaskInstanceErrorLogResponse {
        task_instance_error_log,
    }))
}
