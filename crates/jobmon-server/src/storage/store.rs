//! StateStore trait definition and row model.
//!
//! A backend owns all persistence *and* the coupled Task / TaskInstance
//! update semantics, so that each operation is atomic per backend
//! (a single lock scope in memory, a transaction in PostgreSQL).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use jobmon_core::constants::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};
use jobmon_core::contracts::{
    AddArrayRequest, BindTaskRequest, BindWorkflowRequest, BoundTask, DownstreamTask, EdgeWire,
    TaskInstanceBatchWire, TaskInstanceErrorLogWire, TaskMetadata, TaskResourcesWire,
    TaskStatusRow, TaskSummary, WorkerTaskInstance, WorkflowMetadata, WorkflowStatusRow,
    WorkflowTaskRow,
};

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    /// A strict transition request that was neither legal nor a repeat.
    #[error("illegal {entity} transition for id {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: i64,
        from: String,
        to: String,
    },

    /// Malformed request input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller identity does not match the run owner.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A new workflow run was requested while another is active, or a resume
    /// was requested in a non-resumable state.
    #[error("workflow {workflow_id} is not resumable: {reason}")]
    NotResumable { workflow_id: i64, reason: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkflowRow {
    pub id: i64,
    pub tool_version_id: i64,
    pub dag_id: i64,
    pub workflow_args_hash: String,
    pub task_hash: String,
    pub name: String,
    pub description: String,
    pub max_concurrently_running: i64,
    pub status: WorkflowStatus,
    pub created_date: DateTime<Utc>,
    pub status_date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WorkflowRunRow {
    pub id: i64,
    pub workflow_id: i64,
    pub user: String,
    pub jobmon_version: String,
    pub status: WorkflowRunStatus,
    pub created_date: DateTime<Utc>,
    pub status_date: DateTime<Utc>,
    pub heartbeat_date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DagRow {
    pub id: i64,
    pub hash: String,
    pub created_date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub dag_id: i64,
    pub node_id: i64,
    pub upstream_node_ids: Vec<i64>,
    pub downstream_node_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct ArrayRow {
    pub id: i64,
    pub workflow_id: i64,
    pub task_template_version_id: i64,
    pub name: String,
    pub max_concurrently_running: i64,
    pub stdout_dir: String,
    pub stderr_dir: String,
    pub created_date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub workflow_id: i64,
    pub array_id: i64,
    pub node_id: i64,
    pub name: String,
    pub command: String,
    pub status: TaskStatus,
    pub num_attempts: i64,
    pub max_attempts: i64,
    pub task_args_hash: String,
    pub task_resources_id: i64,
    pub resource_scales: BTreeMap<String, Value>,
    pub fallback_queues: Vec<String>,
    pub status_date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TaskInstanceRow {
    pub id: i64,
    pub task_id: i64,
    pub workflow_run_id: i64,
    pub array_id: i64,
    pub array_batch_num: i64,
    pub array_step_id: i64,
    pub task_resources_id: i64,
    pub status: TaskInstanceStatus,
    pub distributor_id: Option<String>,
    pub nodename: Option<String>,
    pub process_group_id: Option<i64>,
    pub submitted_date: Option<DateTime<Utc>>,
    pub report_by_date: Option<DateTime<Utc>>,
    pub status_date: DateTime<Utc>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
    pub wallclock: Option<f64>,
    pub maxrss: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct TaskResourcesRow {
    pub id: i64,
    pub queue_name: String,
    pub cluster_name: String,
    pub requested_resources: BTreeMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Operation inputs shared by the backends
// ---------------------------------------------------------------------------

/// Worker `log_running` fields.
#[derive(Debug, Clone)]
pub struct RunningReport {
    pub nodename: String,
    pub process_group_id: i64,
    pub next_report_increment: f64,
    pub distributor_id: Option<String>,
}

/// Worker completion/error fields that piggyback on most worker endpoints.
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub distributor_id: Option<String>,
    pub nodename: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
}

/// Store for the workflow / task / task-instance state machines.
///
/// Implementations must be thread-safe; every method is one atomic unit.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// The store clock, authoritative for sync timestamps.
    async fn now(&self) -> Result<DateTime<Utc>, StoreError>;

    // =========================================================================
    // Catalog seeding (dag / array / resources / tasks)
    // =========================================================================

    /// Upsert a dag by hash. Returns (dag_id, newly_created).
    async fn add_dag(&self, hash: &str) -> Result<(i64, bool), StoreError>;

    async fn add_edges(&self, dag_id: i64, edges: Vec<EdgeWire>) -> Result<(), StoreError>;

    /// Upsert an array by (workflow, task template version); refreshes its
    /// concurrency cap when it already exists.
    async fn add_array(&self, request: AddArrayRequest) -> Result<i64, StoreError>;

    async fn bind_task_resources(
        &self,
        queue_name: &str,
        cluster_name: &str,
        requested_resources: BTreeMap<String, Value>,
    ) -> Result<i64, StoreError>;

    async fn task_resources(&self, task_resources_id: i64)
        -> Result<TaskResourcesWire, StoreError>;

    /// Upsert tasks by (workflow, node, args-hash); new tasks start
    /// REGISTERING.
    async fn bind_tasks(
        &self,
        workflow_id: i64,
        tasks: Vec<BindTaskRequest>,
    ) -> Result<Vec<BoundTask>, StoreError>;

    // =========================================================================
    // Workflow
    // =========================================================================

    /// Upsert by (tool version, dag, args-hash, task-hash).
    /// Returns (workflow_id, status, newly_created).
    async fn bind_workflow(
        &self,
        request: BindWorkflowRequest,
    ) -> Result<(i64, WorkflowStatus, bool), StoreError>;

    async fn workflow_metadata(
        &self,
        workflow_id: i64,
    ) -> Result<Option<WorkflowMetadata>, StoreError>;

    async fn is_resumable(&self, workflow_id: i64) -> Result<bool, StoreError>;

    /// Signal resume: drives active runs to COLD_RESUME / HOT_RESUME.
    /// The caller's username must match the latest run's user.
    async fn set_resume(
        &self,
        workflow_id: i64,
        reset_running_jobs: bool,
        user: &str,
    ) -> Result<(), StoreError>;

    async fn max_concurrently_running(&self, workflow_id: i64) -> Result<i64, StoreError>;

    /// Returns the number of rows updated.
    async fn update_max_concurrently_running(
        &self,
        workflow_id: i64,
        max_tasks: i64,
        user: &str,
    ) -> Result<u64, StoreError>;

    async fn update_array_max_concurrently_running(
        &self,
        workflow_id: i64,
        array_id: i64,
        max_tasks: i64,
        user: &str,
    ) -> Result<u64, StoreError>;

    async fn array_max_concurrently_running(&self, array_id: i64) -> Result<i64, StoreError>;

    /// Paginated resume fetch: non-DONE tasks with id above the cursor, in
    /// id order, with their array / queue / cluster / resource metadata.
    async fn get_tasks(
        &self,
        workflow_id: i64,
        max_task_id: i64,
        chunk_size: usize,
    ) -> Result<BTreeMap<i64, TaskMetadata>, StoreError>;

    /// Tasks whose status changed since `last_sync` (all tasks when `None`),
    /// plus the server time to use as the next cursor.
    async fn task_status_updates(
        &self,
        workflow_id: i64,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<(HashMap<TaskStatus, Vec<i64>>, DateTime<Utc>), StoreError>;

    // =========================================================================
    // Workflow run
    // =========================================================================

    /// Create a run; refuses while another run is active and unresumed.
    async fn register_workflow_run(
        &self,
        workflow_id: i64,
        user: &str,
        jobmon_version: &str,
        next_report_increment: f64,
    ) -> Result<(i64, WorkflowRunStatus), StoreError>;

    /// Strict run transition; mirrors into the workflow status.
    async fn update_workflow_run_status(
        &self,
        workflow_run_id: i64,
        status: WorkflowRunStatus,
    ) -> Result<WorkflowRunStatus, StoreError>;

    /// Extend the run's heartbeat and return the authoritative status
    /// (which may be a resume signal the caller must act on).
    async fn log_workflow_run_heartbeat(
        &self,
        workflow_run_id: i64,
        status: WorkflowRunStatus,
        next_report_increment: f64,
    ) -> Result<WorkflowRunStatus, StoreError>;

    /// Reconcile the caller's belief about a status set. Returns corrections
    /// (submitted ids whose status differs) and newcomers (instances in the
    /// submitted status the caller did not list).
    async fn sync_status(
        &self,
        workflow_run_id: i64,
        status: TaskInstanceStatus,
        task_instance_ids: Vec<i64>,
    ) -> Result<HashMap<TaskInstanceStatus, Vec<i64>>, StoreError>;

    /// Move overdue LAUNCHED/RUNNING instances to TRIAGING; overdue LAUNCHED
    /// instances with no distributor id have nothing to probe and go to
    /// NO_HEARTBEAT. Returns the number of instances moved.
    async fn set_status_for_triaging(&self, workflow_run_id: i64) -> Result<u64, StoreError>;

    /// Flag the run's in-flight instances KILL_SELF and, if the run carries
    /// a resume signal, terminate it. Returns the number of flagged
    /// instances.
    async fn terminate_task_instances(&self, workflow_run_id: i64) -> Result<u64, StoreError>;

    // =========================================================================
    // Array batches
    // =========================================================================

    /// The queue contract: transition {REGISTERING, ADJUSTING_RESOURCES}
    /// tasks to QUEUED (bumping attempts), insert one QUEUED instance per
    /// transitioned task under a fresh batch number, and return the current
    /// status of every input task id.
    async fn queue_task_batch(
        &self,
        array_id: i64,
        task_ids: Vec<i64>,
        task_resources_id: i64,
        workflow_run_id: i64,
    ) -> Result<HashMap<TaskStatus, Vec<i64>>, StoreError>;

    /// QUEUED -> INSTANTIATED for instances whose task made QUEUED ->
    /// INSTANTIATING, grouped for array submission.
    async fn instantiate_task_instances(
        &self,
        task_instance_ids: Vec<i64>,
    ) -> Result<Vec<TaskInstanceBatchWire>, StoreError>;

    async fn transition_batch_to_launched(
        &self,
        array_id: i64,
        batch_number: i64,
        next_report_increment: f64,
    ) -> Result<(), StoreError>;

    async fn transition_batch_to_killed(
        &self,
        array_id: i64,
        batch_number: i64,
    ) -> Result<(), StoreError>;

    async fn log_array_distributor_ids(
        &self,
        array_id: i64,
        distributor_ids: HashMap<i64, String>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Task instance lifecycle
    // =========================================================================

    /// Worker handshake. Applies the RUNNING transition (with the KILL_SELF
    /// and NO_HEARTBEAT special cases) and returns what the worker needs to
    /// run; the returned status may differ from RUNNING.
    async fn log_running(
        &self,
        task_instance_id: i64,
        report: RunningReport,
    ) -> Result<WorkerTaskInstance, StoreError>;

    async fn log_done(
        &self,
        task_instance_id: i64,
        report: WorkerReport,
    ) -> Result<TaskInstanceStatus, StoreError>;

    async fn log_error_worker_node(
        &self,
        task_instance_id: i64,
        error_state: TaskInstanceStatus,
        error_description: String,
        report: WorkerReport,
    ) -> Result<TaskInstanceStatus, StoreError>;

    /// Worker heartbeat; a TRIAGING instance that heartbeats returns to
    /// RUNNING.
    async fn log_report_by(
        &self,
        task_instance_id: i64,
        next_report_increment: f64,
        report: WorkerReport,
    ) -> Result<TaskInstanceStatus, StoreError>;

    /// Distributor heartbeat for submitted instances; only LAUNCHED rows are
    /// extended.
    async fn log_report_by_batch(
        &self,
        task_instance_ids: Vec<i64>,
        next_report_increment: f64,
    ) -> Result<(), StoreError>;

    async fn log_distributor_id(
        &self,
        task_instance_id: i64,
        distributor_id: &str,
        next_report_increment: f64,
    ) -> Result<(), StoreError>;

    async fn log_no_distributor_id(
        &self,
        task_instance_id: i64,
        no_id_err_msg: &str,
    ) -> Result<(), StoreError>;

    /// Triage outcome from the distributor. When `require_overdue` is set
    /// the transition only applies if the report-by deadline has actually
    /// elapsed (a late heartbeat wins the race).
    async fn log_triage_error(
        &self,
        task_instance_id: i64,
        error_state: TaskInstanceStatus,
        error_message: String,
        distributor_id: Option<String>,
        nodename: Option<String>,
        require_overdue: bool,
    ) -> Result<TaskInstanceStatus, StoreError>;

    async fn task_instance_error_log(
        &self,
        task_instance_id: i64,
    ) -> Result<Vec<TaskInstanceErrorLogWire>, StoreError>;

    // =========================================================================
    // Task queries and admin
    // =========================================================================

    /// Edge info for the given tasks: each task's node and downstream nodes.
    async fn get_downstream_tasks(
        &self,
        task_ids: Vec<i64>,
        dag_id: i64,
    ) -> Result<HashMap<i64, DownstreamTask>, StoreError>;

    /// Bulk reset for resume: non-DONE tasks (optionally sparing RUNNING)
    /// back to REGISTERING with attempts cleared. Requires a resumable
    /// workflow. Returns the number of rows reset.
    async fn set_task_resume_state(
        &self,
        workflow_id: i64,
        reset_if_running: bool,
    ) -> Result<u64, StoreError>;

    /// Admin CLI status override. Resetting to REGISTERING clears attempts
    /// and flags live instances KILL_SELF.
    async fn update_task_statuses(
        &self,
        task_ids: Vec<i64>,
        new_status: TaskStatus,
        workflow_id: i64,
    ) -> Result<u64, StoreError>;

    async fn most_recent_ti_error(
        &self,
        task_id: i64,
    ) -> Result<Option<(String, i64)>, StoreError>;

    /// Transitive upstream or downstream closure over the DAG edges,
    /// including the input tasks.
    async fn tasks_recursive(
        &self,
        task_ids: Vec<i64>,
        downstream: bool,
    ) -> Result<Vec<i64>, StoreError>;

    async fn task_dependencies(
        &self,
        task_id: i64,
    ) -> Result<(Vec<TaskSummary>, Vec<TaskSummary>), StoreError>;

    // =========================================================================
    // CLI status queries
    // =========================================================================

    async fn workflow_status_row(&self, workflow_id: i64) -> Result<WorkflowStatusRow, StoreError>;

    async fn workflow_tasks(
        &self,
        workflow_id: i64,
        statuses: Option<Vec<TaskStatus>>,
        limit: usize,
    ) -> Result<Vec<WorkflowTaskRow>, StoreError>;

    async fn task_status_rows(
        &self,
        task_ids: Vec<i64>,
    ) -> Result<Vec<TaskStatusRow>, StoreError>;
}
