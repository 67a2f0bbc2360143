//! Typed server operations scoped to one workflow run.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value;

use jobmon_client::{Requester, RequesterError};
use jobmon_core::constants::{TaskStatus, WorkflowRunStatus};
use jobmon_core::contracts::*;

/// The swarm's wire to the state server.
///
/// A thin, typed layer over the [`Requester`]: every method is one endpoint,
/// scoped to the gateway's workflow and run ids.
#[derive(Debug, Clone)]
pub struct ServerGateway {
    pub requester: Requester,
    pub workflow_id: i64,
    pub workflow_run_id: i64,
}

impl ServerGateway {
    pub fn new(requester: Requester, workflow_id: i64, workflow_run_id: i64) -> Self {
        Self {
            requester,
            workflow_id,
            workflow_run_id,
        }
    }

    pub async fn server_time(&self) -> Result<DateTime<Utc>, RequesterError> {
        self.requester.server_time().await
    }

    pub async fn log_heartbeat(
        &self,
        status: WorkflowRunStatus,
        next_report_increment: f64,
    ) -> Result<WorkflowRunStatus, RequesterError> {
        let response: WorkflowRunStatusResponse = self
            .requester
            .post(
                &format!("/workflow_run/{}/log_heartbeat", self.workflow_run_id),
                &LogHeartbeatRequest {
                    status,
                    next_report_increment,
                },
            )
            .await?;
        Ok(response.status)
    }

    pub async fn update_status(
        &self,
        status: WorkflowRunStatus,
    ) -> Result<WorkflowRunStatus, RequesterError> {
        let response: WorkflowRunStatusResponse = self
            .requester
            .put(
                &format!("/workflow_run/{}/update_status", self.workflow_run_id),
                &UpdateWorkflowRunStatusRequest { status },
            )
            .await?;
        Ok(response.status)
    }

    pub async fn bind_task_resources(
        &self,
        queue_name: &str,
        cluster_name: &str,
        requested_resources: BTreeMap<String, Value>,
    ) -> Result<i64, RequesterError> {
        let response: BindTaskResourcesResponse = self
            .requester
            .post(
                "/task/bind_resources",
                &BindTaskResourcesRequest {
                    queue_name: queue_name.to_string(),
                    cluster_name: cluster_name.to_string(),
                    requested_resources,
                },
            )
            .await?;
        Ok(response.task_resources_id)
    }

    pub async fn queue_task_batch(
        &self,
        array_id: i64,
        task_ids: Vec<i64>,
        task_resources_id: i64,
    ) -> Result<HashMap<TaskStatus, Vec<i64>>, RequesterError> {
        let response: TasksByStatusResponse = self
            .requester
            .post(
                &format!("/array/{array_id}/queue_task_batch"),
                &QueueTaskBatchRequest {
                    task_ids,
                    task_resources_id,
                    workflow_run_id: self.workflow_run_id,
                },
            )
            .await?;
        Ok(response.tasks_by_status)
    }

    pub async fn set_status_for_triaging(&self) -> Result<(), RequesterError> {
        let _: Value = self
            .requester
            .post(
                &format!(
                    "/workflow_run/{}/set_status_for_triaging",
                    self.workflow_run_id
                ),
                &Value::Object(Default::default()),
            )
            .await?;
        Ok(())
    }

    pub async fn task_status_updates(
        &self,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<TaskStatusUpdatesResponse, RequesterError> {
        self.requester
            .post(
                &format!("/workflow/{}/task_status_updates", self.workflow_id),
                &TaskStatusUpdatesRequest { last_sync },
            )
            .await
    }

    pub async fn max_concurrently_running(&self) -> Result<i64, RequesterError> {
        let response: MaxConcurrentlyRunningResponse = self
            .requester
            .get(&format!(
                "/workflow/{}/get_max_concurrently_running",
                self.workflow_id
            ))
            .await?;
        Ok(response.max_concurrently_running)
    }

    pub async fn array_max_concurrently_running(
        &self,
        array_id: i64,
    ) -> Result<i64, RequesterError> {
        let response: MaxConcurrentlyRunningResponse = self
            .requester
            .get(&format!(
                "/array/{array_id}/get_array_max_concurrently_running"
            ))
            .await?;
        Ok(response.max_concurrently_running)
    }

    /// Flag the run's in-flight instances for termination (resume path).
    pub async fn terminate_task_instances(&self) -> Result<(), RequesterError> {
        let _: Value = self
            .requester
            .post(
                &format!(
                    "/workflow_run/{}/terminate_task_instances",
                    self.workflow_run_id
                ),
                &Value::Object(Default::default()),
            )
            .await?;
        Ok(())
    }
}
