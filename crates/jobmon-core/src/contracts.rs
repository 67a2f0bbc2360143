//! Wire contracts for the state-server HTTP API.
//!
//! Every request and response body exchanged between the server and the
//! swarm, distributor, worker and CLI lives here so the shapes cannot
//! drift apart. Maps keyed by numeric ids serialize with string keys, which
//! is what JSON requires and what serde does for integer-keyed maps.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::constants::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};

/// Standard error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

/// `GET /time`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServerTimeResponse {
    pub time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// `POST /workflow`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BindWorkflowRequest {
    pub tool_version_id: i64,
    pub dag_id: i64,
    pub workflow_args_hash: String,
    pub task_hash: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub max_concurrently_running: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BindWorkflowResponse {
    pub workflow_id: i64,
    pub status: WorkflowStatus,
    pub newly_created: bool,
}

/// `GET /workflow/{id}/fetch_workflow_metadata`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowMetadata {
    pub workflow_id: i64,
    pub dag_id: i64,
    pub max_concurrently_running: i64,
    pub status: WorkflowStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowMetadataResponse {
    pub workflow: Option<WorkflowMetadata>,
}

/// `POST /workflow/{id}/set_resume`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SetResumeRequest {
    pub reset_running_jobs: bool,
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IsResumableResponse {
    pub workflow_is_resumable: bool,
}

/// `PUT /workflow/{id}/update_max_concurrently_running`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateMaxConcurrentlyRunningRequest {
    pub max_tasks: i64,
    pub user: String,
}

/// `PUT /workflow/{id}/update_array_max_concurrently_running`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateArrayMaxConcurrentlyRunningRequest {
    pub array_id: i64,
    pub max_tasks: i64,
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MaxConcurrentlyRunningResponse {
    pub max_concurrently_running: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

/// One row of the paginated resume fetch
/// (`GET /workflow/get_tasks/{id}`).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskMetadata {
    pub array_id: i64,
    pub status: TaskStatus,
    pub max_attempts: i64,
    /// Persisted scaling strategies, JSON-encoded at bind time.
    pub resource_scales: BTreeMap<String, Value>,
    pub fallback_queues: Vec<String>,
    pub requested_resources: BTreeMap<String, Value>,
    pub cluster_name: String,
    pub queue_name: String,
    pub array_max_concurrently_running: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GetTasksResponse {
    /// Keyed by task id, ascending.
    pub tasks: BTreeMap<i64, TaskMetadata>,
}

/// `POST /workflow/{id}/task_status_updates`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskStatusUpdatesRequest {
    /// Omitted for a full sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskStatusUpdatesResponse {
    pub tasks_by_status: HashMap<TaskStatus, Vec<i64>>,
    /// Server clock at query time; the caller stores it as its next
    /// `last_sync` so agent clock skew never matters.
    pub time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflow run
// ---------------------------------------------------------------------------

/// `POST /workflow_run`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterWorkflowRunRequest {
    pub workflow_id: i64,
    pub user: String,
    pub jobmon_version: String,
    pub next_report_increment: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterWorkflowRunResponse {
    pub workflow_run_id: i64,
    pub status: WorkflowRunStatus,
}

/// `PUT /workflow_run/{id}/update_status`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateWorkflowRunStatusRequest {
    pub status: WorkflowRunStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowRunStatusResponse {
    pub status: WorkflowRunStatus,
}

/// `POST /workflow_run/{id}/log_heartbeat`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogHeartbeatRequest {
    pub status: WorkflowRunStatus,
    pub next_report_increment: f64,
}

/// `POST /workflow_run/{id}/sync_status`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SyncStatusRequest {
    /// The status the caller believes these instances hold.
    pub status: TaskInstanceStatus,
    pub task_instance_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SyncStatusResponse {
    /// Corrections and newcomers: instances whose real status differs from
    /// the submitted one, plus instances in the submitted status the caller
    /// did not know about.
    pub status_updates: HashMap<TaskInstanceStatus, Vec<i64>>,
}

// ---------------------------------------------------------------------------
// Array
// ---------------------------------------------------------------------------

/// `POST /array`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddArrayRequest {
    pub workflow_id: i64,
    pub task_template_version_id: i64,
    pub name: String,
    pub max_concurrently_running: i64,
    /// Where worker nodes write their capture files.
    #[serde(default = "default_log_dir")]
    pub stdout_dir: String,
    #[serde(default = "default_log_dir")]
    pub stderr_dir: String,
}

fn default_log_dir() -> String {
    "/tmp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddArrayResponse {
    pub array_id: i64,
}

/// `POST /array/{id}/queue_task_batch`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueueTaskBatchRequest {
    pub task_ids: Vec<i64>,
    pub task_resources_id: i64,
    pub workflow_run_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TasksByStatusResponse {
    /// Current status of every input task id, including those whose
    /// transition was a no-op.
    pub tasks_by_status: HashMap<TaskStatus, Vec<i64>>,
}

/// `POST /array/{id}/transition_to_launched`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransitionBatchToLaunchedRequest {
    pub batch_number: i64,
    pub next_report_increment: f64,
}

/// `POST /array/{id}/transition_to_killed`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransitionBatchToKilledRequest {
    pub batch_number: i64,
}

/// `POST /array/{id}/log_distributor_id`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogArrayDistributorIdRequest {
    /// task_instance_id -> cluster distributor id.
    pub distributor_ids: HashMap<i64, String>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One task of a `PUT /task/bind_tasks` request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BindTaskRequest {
    pub node_id: i64,
    pub array_id: i64,
    pub task_args_hash: String,
    pub task_resources_id: i64,
    pub name: String,
    pub command: String,
    pub max_attempts: i64,
    #[serde(default)]
    pub resource_scales: BTreeMap<String, Value>,
    #[serde(default)]
    pub fallback_queues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BindTasksRequest {
    pub workflow_id: i64,
    pub tasks: Vec<BindTaskRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BoundTask {
    pub task_id: i64,
    pub node_id: i64,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BindTasksResponse {
    pub tasks: Vec<BoundTask>,
}

/// `POST /task/bind_resources`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BindTaskResourcesRequest {
    pub queue_name: String,
    pub cluster_name: String,
    pub requested_resources: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BindTaskResourcesResponse {
    pub task_resources_id: i64,
}

/// `GET /task_resources/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskResourcesWire {
    pub task_resources_id: i64,
    pub queue_name: String,
    pub cluster_name: String,
    pub requested_resources: BTreeMap<String, Value>,
}

/// `POST /task/get_downstream_tasks`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GetDownstreamTasksRequest {
    pub task_ids: Vec<i64>,
    pub dag_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DownstreamTask {
    pub node_id: i64,
    pub downstream_node_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GetDownstreamTasksResponse {
    /// Keyed by the input task ids.
    pub downstream_tasks: HashMap<i64, DownstreamTask>,
}

/// `POST /task/{workflow_id}/set_resume_state`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SetTaskResumeStateRequest {
    pub reset_if_running: bool,
}

/// `PUT /task/update_statuses`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateTaskStatusesRequest {
    pub task_ids: Vec<i64>,
    pub new_status: TaskStatus,
    pub workflow_id: i64,
}

/// `PUT /tasks_recursive/{direction}`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TasksRecursiveRequest {
    pub task_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TasksRecursiveResponse {
    /// The transitive closure, including the input tasks.
    pub task_ids: Vec<i64>,
}

/// `GET /task/{id}/most_recent_ti_error`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MostRecentErrorResponse {
    pub error_description: String,
    pub task_instance_id: Option<i64>,
}

/// `GET /task_dependencies/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskDependenciesResponse {
    pub up: Vec<TaskSummary>,
    pub down: Vec<TaskSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskSummary {
    pub task_id: i64,
    pub name: String,
    pub status: TaskStatus,
}

// ---------------------------------------------------------------------------
// Task instance
// ---------------------------------------------------------------------------

/// `POST /task_instance/instantiate_task_instances`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InstantiateTaskInstancesRequest {
    pub task_instance_ids: Vec<i64>,
}

/// One (array, batch) group of freshly instantiated task instances.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskInstanceBatchWire {
    pub array_id: i64,
    pub array_name: String,
    pub array_batch_num: i64,
    pub task_resources_id: i64,
    pub task_instance_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InstantiateTaskInstancesResponse {
    pub task_instance_batches: Vec<TaskInstanceBatchWire>,
}

/// `POST /task_instance/{id}/log_running`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogRunningRequest {
    pub nodename: String,
    pub process_group_id: i64,
    pub next_report_increment: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributor_id: Option<String>,
}

/// What a worker needs to run its command, returned by `log_running`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkerTaskInstance {
    pub task_instance_id: i64,
    pub status: TaskInstanceStatus,
    pub workflow_id: i64,
    pub workflow_run_id: i64,
    pub task_id: i64,
    pub array_id: i64,
    pub name: String,
    pub command: String,
    pub stdout_dir: String,
    pub stderr_dir: String,
}

impl WorkerTaskInstance {
    /// The `JOBMON_*` environment handed to the subprocess.
    pub fn command_env(&self) -> HashMap<String, String> {
        HashMap::from([
            ("JOBMON_WORKFLOW_ID".to_string(), self.workflow_id.to_string()),
            (
                "JOBMON_WORKFLOW_RUN_ID".to_string(),
                self.workflow_run_id.to_string(),
            ),
            ("JOBMON_TASK_ID".to_string(), self.task_id.to_string()),
            (
                "JOBMON_TASK_INSTANCE_ID".to_string(),
                self.task_instance_id.to_string(),
            ),
            ("JOBMON_ARRAY_ID".to_string(), self.array_id.to_string()),
        ])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogRunningResponse {
    pub task_instance: WorkerTaskInstance,
}

/// `POST /task_instance/{id}/log_done`
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct LogDoneRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_log: Option<String>,
}

/// `POST /task_instance/{id}/log_error_worker_node`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogErrorWorkerNodeRequest {
    pub error_state: TaskInstanceStatus,
    pub error_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_log: Option<String>,
}

/// `POST /task_instance/{id}/log_report_by`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogReportByRequest {
    pub next_report_increment: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributor_id: Option<String>,
}

/// `POST /task_instance/log_report_by/batch`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogReportByBatchRequest {
    pub task_instance_ids: Vec<i64>,
    pub next_report_increment: f64,
}

/// `POST /task_instance/{id}/log_distributor_id`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogDistributorIdRequest {
    pub distributor_id: String,
    pub next_report_increment: f64,
}

/// `POST /task_instance/{id}/log_no_distributor_id`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogNoDistributorIdRequest {
    pub no_id_err_msg: String,
}

/// `POST /task_instance/{id}/log_known_error` and `log_unknown_error`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogTriageErrorRequest {
    pub error_state: TaskInstanceStatus,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskInstanceStatusResponse {
    pub status: TaskInstanceStatus,
}

/// One row of the append-only error trail.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskInstanceErrorLogWire {
    pub task_instance_id: i64,
    pub error_time: DateTime<Utc>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskInstanceErrorLogResponse {
    pub task_instance_error_log: Vec<TaskInstanceErrorLogWire>,
}

// ---------------------------------------------------------------------------
// Dag / catalog seeding
// ---------------------------------------------------------------------------

/// `POST /dag`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddDagRequest {
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddDagResponse {
    pub dag_id: i64,
    pub newly_created: bool,
}

/// One edge row: a node with its neighbors, scoped to a dag.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeWire {
    pub node_id: i64,
    #[serde(default)]
    pub upstream_node_ids: Vec<i64>,
    #[serde(default)]
    pub downstream_node_ids: Vec<i64>,
}

/// `POST /dag/{id}/edges`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddEdgesRequest {
    pub edges: Vec<EdgeWire>,
}

// ---------------------------------------------------------------------------
// CLI status queries
// ---------------------------------------------------------------------------

/// `GET /cli/workflow_status/{workflow_id}`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowStatusRow {
    pub workflow_id: i64,
    pub name: String,
    pub status: WorkflowStatus,
    pub created_date: DateTime<Utc>,
    /// Task counts by status code.
    pub task_counts: HashMap<TaskStatus, i64>,
}

/// `GET /cli/workflow_tasks/{workflow_id}`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowTaskRow {
    pub task_id: i64,
    pub name: String,
    pub status: TaskStatus,
    pub num_attempts: i64,
    pub max_attempts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowTasksResponse {
    pub tasks: Vec<WorkflowTaskRow>,
}

/// `GET /cli/task_status?task_ids=1,2,3`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskStatusRow {
    pub task_id: i64,
    pub name: String,
    pub status: TaskStatus,
    pub task_instance_id: Option<i64>,
    pub task_instance_status: Option<TaskInstanceStatus>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskStatusRowsResponse {
    pub task_instances: Vec<TaskStatusRow>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_keyed_maps_use_wire_codes() {
        let response = TasksByStatusResponse {
            tasks_by_status: HashMap::from([
                (TaskStatus::Queued, vec![1, 2]),
                (TaskStatus::Done, vec![3]),
            ]),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["tasks_by_status"]["Q"], json!([1, 2]));
        assert_eq!(value["tasks_by_status"]["D"], json!([3]));

        let parsed: TasksByStatusResponse = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.tasks_by_status[&TaskStatus::Queued], vec![1, 2]);
    }

    #[test]
    fn id_keyed_maps_round_trip_through_string_keys() {
        let response = GetDownstreamTasksResponse {
            downstream_tasks: HashMap::from([(
                42,
                DownstreamTask {
                    node_id: 7,
                    downstream_node_ids: vec![8, 9],
                },
            )]),
        };
        let text = serde_json::to_string(&response).unwrap();
        assert!(text.contains("\"42\""));
        let parsed: GetDownstreamTasksResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.downstream_tasks[&42].downstream_node_ids, vec![8, 9]);
    }

    #[test]
    fn worker_task_instance_env_is_prefixed() {
        let wire = WorkerTaskInstance {
            task_instance_id: 11,
            status: TaskInstanceStatus::Running,
            workflow_id: 1,
            workflow_run_id: 2,
            task_id: 3,
            array_id: 4,
            name: "t1".to_string(),
            command: "echo hi".to_string(),
            stdout_dir: "/tmp".to_string(),
            stderr_dir: "/tmp".to_string(),
        };
        let env = wire.command_env();
        assert_eq!(env["JOBMON_TASK_INSTANCE_ID"], "11");
        assert_eq!(env["JOBMON_WORKFLOW_RUN_ID"], "2");
        assert!(env.keys().all(|k| k.starts_with("JOBMON_")));
    }

    #[test]
    fn optional_fields_are_omitted_from_the_wire() {
        let body = LogDoneRequest {
            nodename: Some("node1".to_string()),
            ..Default::default()
        };
        let text = serde_json::to_string(&body).unwrap();
        assert!(text.contains("nodename"));
        assert!(!text.contains("stdout_log"));
    }
}
