//! In-memory implementation of StateStore.
//!
//! Used by the test suites and single-process deployments. All data lives
//! behind one `parking_lot::RwLock`, so every operation is trivially atomic
//! and provides the same semantics as the PostgreSQL implementation.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{error, warn};

use jobmon_core::constants::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};
use jobmon_core::contracts::{
    AddArrayRequest, BindTaskRequest, BindWorkflowRequest, BoundTask, DownstreamTask, EdgeWire,
    TaskInstanceBatchWire, TaskInstanceErrorLogWire, TaskMetadata, TaskResourcesWire,
    TaskStatusRow, TaskSummary, WorkerTaskInstance, WorkflowMetadata, WorkflowStatusRow,
    WorkflowTaskRow,
};

use super::fsm::{classify_instance_transition, task_followup, TransitionOutcome};
use super::store::*;

#[derive(Debug, Clone)]
struct ErrorLogRow {
    id: i64,
    task_instance_id: i64,
    error_time: DateTime<Utc>,
    description: String,
}

#[derive(Debug, Default)]
struct Sequences {
    workflow: i64,
    workflow_run: i64,
    dag: i64,
    array: i64,
    task: i64,
    task_instance: i64,
    task_resources: i64,
    error_log: i64,
}

fn next(seq: &mut i64) -> i64 {
    *seq += 1;
    *seq
}

#[derive(Default)]
struct Inner {
    workflows: BTreeMap<i64, WorkflowRow>,
    workflow_runs: BTreeMap<i64, WorkflowRunRow>,
    dags: BTreeMap<i64, DagRow>,
    edges: HashMap<(i64, i64), EdgeRow>,
    arrays: BTreeMap<i64, ArrayRow>,
    tasks: BTreeMap<i64, TaskRow>,
    task_instances: BTreeMap<i64, TaskInstanceRow>,
    task_resources: BTreeMap<i64, TaskResourcesRow>,
    error_logs: Vec<ErrorLogRow>,
    seq: Sequences,
}

/// In-memory implementation of [`StateStore`].
///
/// # Example
///
/// ```
/// use jobmon_server::storage::MemoryStateStore;
///
/// let store = MemoryStateStore::new();
/// ```
#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of task instances currently held (for tests).
    pub fn task_instance_count(&self) -> usize {
        self.inner.read().task_instances.len()
    }

    /// Backdate an instance's status_date, bypassing the FSM (for wedge
    /// tests).
    pub fn backdate_task_status(&self, task_id: i64, status: TaskStatus, minutes_ago: i64) {
        let mut inner = self.inner.write();
        if let Some(task) = inner.tasks.get_mut(&task_id) {
            task.status = status;
            task.status_date = Utc::now() - Duration::minutes(minutes_ago);
        }
    }
}

impl Inner {
    fn add_seconds(at: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
        at + Duration::milliseconds((seconds * 1000.0) as i64)
    }

    /// Apply an instance transition plus its coupled task update.
    fn transition_instance(
        &mut self,
        task_instance_id: i64,
        target: TaskInstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let (outcome, task_id) = {
            let instance = self.task_instances.get_mut(&task_instance_id).ok_or(
                StoreError::NotFound {
                    entity: "task_instance",
                    id: task_instance_id,
                },
            )?;
            let outcome = classify_instance_transition(instance.status, target);
            match outcome {
                TransitionOutcome::Applied => {
                    instance.status = target;
                    instance.status_date = now;
                    if target.is_terminal() {
                        if let Some(submitted) = instance.submitted_date {
                            instance.wallclock = Some((now - submitted).num_seconds() as f64);
                        }
                    }
                }
                TransitionOutcome::Repeat => {
                    warn!(
                        task_instance_id,
                        status = %target,
                        "attempted transition into the current status"
                    );
                }
                TransitionOutcome::Illegal => {
                    error!(
                        task_instance_id,
                        from = %instance.status,
                        to = %target,
                        "illegal task instance transition"
                    );
                }
            }
            (outcome, instance.task_id)
        };

        if outcome == TransitionOutcome::Applied {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                if let Some(next_status) =
                    task_followup(target, task.status, task.num_attempts, task.max_attempts)
                {
                    task.status = next_status;
                    task.status_date = now;
                }
            }
        }
        Ok(outcome)
    }

    fn push_error_log(&mut self, task_instance_id: i64, description: String, now: DateTime<Utc>) {
        let id = next(&mut self.seq.error_log);
        self.error_logs.push(ErrorLogRow {
            id,
            task_instance_id,
            error_time: now,
            description,
        });
    }

    fn apply_worker_report(&mut self, task_instance_id: i64, report: &WorkerReport) {
        if let Some(instance) = self.task_instances.get_mut(&task_instance_id) {
            if let Some(v) = &report.distributor_id {
                instance.distributor_id = Some(v.clone());
            }
            if let Some(v) = &report.nodename {
                instance.nodename = Some(v.clone());
            }
            if let Some(v) = &report.stdout {
                instance.stdout = Some(v.clone());
            }
            if let Some(v) = &report.stderr {
                instance.stderr = Some(v.clone());
            }
            if let Some(v) = &report.stdout_log {
                instance.stdout_log = Some(v.clone());
            }
            if let Some(v) = &report.stderr_log {
                instance.stderr_log = Some(v.clone());
            }
        }
    }

    /// Strict workflow-run transition; mirrors into the workflow status.
    fn transition_run(
        &mut self,
        workflow_run_id: i64,
        target: WorkflowRunStatus,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRunStatus, StoreError> {
        let run = self
            .workflow_runs
            .get_mut(&workflow_run_id)
            .ok_or(StoreError::NotFound {
                entity: "workflow_run",
                id: workflow_run_id,
            })?;
        if run.status == target {
            return Ok(run.status);
        }
        if !run.status.can_transition_to(target) {
            return Err(StoreError::InvalidTransition {
                entity: "workflow_run",
                id: workflow_run_id,
                from: run.status.to_string(),
                to: target.to_string(),
            });
        }
        run.status = target;
        run.status_date = now;
        let workflow_id = run.workflow_id;

        if let Some(workflow_status) = WorkflowStatus::from_run_status(target) {
            if let Some(workflow) = self.workflows.get_mut(&workflow_id) {
                workflow.status = workflow_status;
                workflow.status_date = now;
            }
        }
        Ok(target)
    }

    fn task_summary(&self, task_id: i64) -> Option<TaskSummary> {
        self.tasks.get(&task_id).map(|t| TaskSummary {
            task_id: t.id,
            name: t.name.clone(),
            status: t.status,
        })
    }

    /// node_id -> task_id for one workflow.
    fn node_task_map(&self, workflow_id: i64) -> HashMap<i64, i64> {
        self.tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .map(|t| (t.node_id, t.id))
            .collect()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        Ok(Utc::now())
    }

    // =========================================================================
    // Catalog seeding
    // =========================================================================

    async fn add_dag(&self, hash: &str) -> Result<(i64, bool), StoreError> {
        let mut inner = self.inner.write();
        if let Some(dag) = inner.dags.values().find(|d| d.hash == hash) {
            return Ok((dag.id, false));
        }
        let id = next(&mut inner.seq.dag);
        inner.dags.insert(
            id,
            DagRow {
                id,
                hash: hash.to_string(),
                created_date: Utc::now(),
            },
        );
        Ok((id, true))
    }

    async fn add_edges(&self, dag_id: i64, edges: Vec<EdgeWire>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.dags.contains_key(&dag_id) {
            return Err(StoreError::NotFound {
                entity: "dag",
                id: dag_id,
            });
        }
        for edge in edges {
            inner.edges.insert(
                (dag_id, edge.node_id),
                EdgeRow {
                    dag_id,
                    node_id: edge.node_id,
                    upstream_node_ids: edge.upstream_node_ids,
                    downstream_node_ids: edge.downstream_node_ids,
                },
            );
        }
        Ok(())
    }

    async fn add_array(&self, request: AddArrayRequest) -> Result<i64, StoreError> {
        let mut inner = self.inner.write();
        let existing = inner.arrays.values().find(|a| {
            a.workflow_id == request.workflow_id
                && a.task_template_version_id == request.task_template_version_id
        });
        if let Some(array) = existing {
            let id = array.id;
            inner.arrays.get_mut(&id).unwrap().max_concurrently_running =
                request.max_concurrently_running;
            return Ok(id);
        }
        let id = next(&mut inner.seq.array);
        inner.arrays.insert(
            id,
            ArrayRow {
                id,
                workflow_id: request.workflow_id,
                task_template_version_id: request.task_template_version_id,
                name: request.name,
                max_concurrently_running: request.max_concurrently_running,
                stdout_dir: request.stdout_dir,
                stderr_dir: request.stderr_dir,
                created_date: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn bind_task_resources(
        &self,
        queue_name: &str,
        cluster_name: &str,
        requested_resources: BTreeMap<String, Value>,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.write();
        let id = next(&mut inner.seq.task_resources);
        inner.task_resources.insert(
            id,
            TaskResourcesRow {
                id,
                queue_name: queue_name.to_string(),
                cluster_name: cluster_name.to_string(),
                requested_resources,
            },
        );
        Ok(id)
    }

    async fn task_resources(
        &self,
        task_resources_id: i64,
    ) -> Result<TaskResourcesWire, StoreError> {
        let inner = self.inner.read();
        inner
            .task_resources
            .get(&task_resources_id)
            .map(|row| TaskResourcesWire {
                task_resources_id: row.id,
                queue_name: row.queue_name.clone(),
                cluster_name: row.cluster_name.clone(),
                requested_resources: row.requested_resources.clone(),
            })
            .ok_or(StoreError::NotFound {
                entity: "task_resources",
                id: task_resources_id,
            })
    }

    async fn bind_tasks(
        &self,
        workflow_id: i64,
        tasks: Vec<BindTaskRequest>,
    ) -> Result<Vec<BoundTask>, StoreError> {
        let mut inner = self.inner.write();
        if !inner.workflows.contains_key(&workflow_id) {
            return Err(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            });
        }
        let now = Utc::now();
        let mut bound = Vec::with_capacity(tasks.len());
        for request in tasks {
            let existing = inner
                .tasks
                .values()
                .find(|t| {
                    t.workflow_id == workflow_id
                        && t.node_id == request.node_id
                        && t.task_args_hash == request.task_args_hash
                })
                .map(|t| t.id);
            let task_id = match existing {
                Some(task_id) => {
                    let task = inner.tasks.get_mut(&task_id).unwrap();
                    task.name = request.name;
                    task.command = request.command;
                    task.max_attempts = request.max_attempts;
                    task_id
                }
                None => {
                    let id = next(&mut inner.seq.task);
                    inner.tasks.insert(
                        id,
                        TaskRow {
                            id,
                            workflow_id,
                            array_id: request.array_id,
                            node_id: request.node_id,
                            name: request.name,
                            command: request.command,
                            status: TaskStatus::Registering,
                            num_attempts: 0,
                            max_attempts: request.max_attempts,
                            task_args_hash: request.task_args_hash,
                            task_resources_id: request.task_resources_id,
                            resource_scales: request.resource_scales,
                            fallback_queues: request.fallback_queues,
                            status_date: now,
                        },
                    );
                    id
                }
            };
            let task = &inner.tasks[&task_id];
            bound.push(BoundTask {
                task_id,
                node_id: task.node_id,
                status: task.status,
            });
        }
        Ok(bound)
    }

    // =========================================================================
    // Workflow
    // =========================================================================

    async fn bind_workflow(
        &self,
        request: BindWorkflowRequest,
    ) -> Result<(i64, WorkflowStatus, bool), StoreError> {
        let mut inner = self.inner.write();
        let existing = inner
            .workflows
            .values()
            .find(|w| {
                w.tool_version_id == request.tool_version_id
                    && w.dag_id == request.dag_id
                    && w.workflow_args_hash == request.workflow_args_hash
                    && w.task_hash == request.task_hash
            })
            .map(|w| w.id);

        if let Some(workflow_id) = existing {
            let workflow = inner.workflows.get_mut(&workflow_id).unwrap();
            workflow.name = request.name;
            workflow.description = request.description;
            workflow.max_concurrently_running = request.max_concurrently_running;
            return Ok((workflow_id, workflow.status, false));
        }

        let now = Utc::now();
        let id = next(&mut inner.seq.workflow);
        inner.workflows.insert(
            id,
            WorkflowRow {
                id,
                tool_version_id: request.tool_version_id,
                dag_id: request.dag_id,
                workflow_args_hash: request.workflow_args_hash,
                task_hash: request.task_hash,
                name: request.name,
                description: request.description,
                max_concurrently_running: request.max_concurrently_running,
                status: WorkflowStatus::Registering,
                created_date: now,
                status_date: now,
            },
        );
        Ok((id, WorkflowStatus::Registering, true))
    }

    async fn workflow_metadata(
        &self,
        workflow_id: i64,
    ) -> Result<Option<WorkflowMetadata>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.workflows.get(&workflow_id).map(|w| WorkflowMetadata {
            workflow_id: w.id,
            dag_id: w.dag_id,
            max_concurrently_running: w.max_concurrently_running,
            status: w.status,
        }))
    }

    async fn is_resumable(&self, workflow_id: i64) -> Result<bool, StoreError> {
        let inner = self.inner.read();
        if !inner.workflows.contains_key(&workflow_id) {
            return Err(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            });
        }
        Ok(inner
            .workflow_runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .all(|r| r.status.is_terminal()))
    }

    async fn set_resume(
        &self,
        workflow_id: i64,
        reset_running_jobs: bool,
        user: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.workflows.contains_key(&workflow_id) {
            return Err(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            });
        }
        let latest_user = inner
            .workflow_runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .max_by_key(|r| r.id)
            .map(|r| r.user.clone());
        if let Some(latest_user) = latest_user {
            if latest_user != user {
                return Err(StoreError::Unauthorized(format!(
                    "resume requested by '{user}' but the latest run belongs to '{latest_user}'"
                )));
            }
        }

        let now = Utc::now();
        let target = if reset_running_jobs {
            WorkflowRunStatus::ColdResume
        } else {
            WorkflowRunStatus::HotResume
        };
        let active_runs: Vec<i64> = inner
            .workflow_runs
            .values()
            .filter(|r| r.workflow_id == workflow_id && r.status.is_active())
            .map(|r| r.id)
            .collect();
        for run_id in active_runs {
            inner.transition_run(run_id, target, now)?;
        }
        Ok(())
    }

    async fn max_concurrently_running(&self, workflow_id: i64) -> Result<i64, StoreError> {
        let inner = self.inner.read();
        inner
            .workflows
            .get(&workflow_id)
            .map(|w| w.max_concurrently_running)
            .ok_or(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            })
    }

    async fn update_max_concurrently_running(
        &self,
        workflow_id: i64,
        max_tasks: i64,
        user: &str,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let latest_user = inner
            .workflow_runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .max_by_key(|r| r.id)
            .map(|r| r.user.clone());
        if let Some(latest_user) = latest_user {
            if latest_user != user {
                return Err(StoreError::Unauthorized(format!(
                    "limit change requested by '{user}' but the latest run belongs to '{latest_user}'"
                )));
            }
        }
        match inner.workflows.get_mut(&workflow_id) {
            Some(workflow) => {
                workflow.max_concurrently_running = max_tasks;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn update_array_max_concurrently_running(
        &self,
        workflow_id: i64,
        array_id: i64,
        max_tasks: i64,
        _user: &str,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        match inner.arrays.get_mut(&array_id) {
            Some(array) if array.workflow_id == workflow_id => {
                array.max_concurrently_running = max_tasks;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn array_max_concurrently_running(&self, array_id: i64) -> Result<i64, StoreError> {
        let inner = self.inner.read();
        inner
            .arrays
            .get(&array_id)
            .map(|a| a.max_concurrently_running)
            .ok_or(StoreError::NotFound {
                entity: "array",
                id: array_id,
            })
    }

    async fn get_tasks(
        &self,
        workflow_id: i64,
        max_task_id: i64,
        chunk_size: usize,
    ) -> Result<BTreeMap<i64, TaskMetadata>, StoreError> {
        let inner = self.inner.read();
        let mut result = BTreeMap::new();
        if chunk_size == 0 {
            return Ok(result);
        }
        for task in inner.tasks.values() {
            if task.workflow_id != workflow_id
                || task.status == TaskStatus::Done
                || task.id <= max_task_id
            {
                continue;
            }
            let resources =
                inner
                    .task_resources
                    .get(&task.task_resources_id)
                    .ok_or(StoreError::NotFound {
                        entity: "task_resources",
                        id: task.task_resources_id,
                    })?;
            let array = inner.arrays.get(&task.array_id).ok_or(StoreError::NotFound {
                entity: "array",
                id: task.array_id,
            })?;
            result.insert(
                task.id,
                TaskMetadata {
                    array_id: task.array_id,
                    status: task.status,
                    max_attempts: task.max_attempts,
                    resource_scales: task.resource_scales.clone(),
                    fallback_queues: task.fallback_queues.clone(),
                    requested_resources: resources.requested_resources.clone(),
                    cluster_name: resources.cluster_name.clone(),
                    queue_name: resources.queue_name.clone(),
                    array_max_concurrently_running: array.max_concurrently_running,
                },
            );
            if result.len() >= chunk_size {
                break;
            }
        }
        Ok(result)
    }

    async fn task_status_updates(
        &self,
        workflow_id: i64,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<(HashMap<TaskStatus, Vec<i64>>, DateTime<Utc>), StoreError> {
        let inner = self.inner.read();
        let now = Utc::now();
        let mut tasks_by_status: HashMap<TaskStatus, Vec<i64>> = HashMap::new();
        for task in inner.tasks.values() {
            if task.workflow_id != workflow_id {
                continue;
            }
            if let Some(since) = last_sync {
                if task.status_date < since {
                    continue;
                }
            }
            tasks_by_status.entry(task.status).or_default().push(task.id);
        }
        Ok((tasks_by_status, now))
    }

    // =========================================================================
    // Workflow run
    // =========================================================================

    async fn register_workflow_run(
        &self,
        workflow_id: i64,
        user: &str,
        jobmon_version: &str,
        next_report_increment: f64,
    ) -> Result<(i64, WorkflowRunStatus), StoreError> {
        let mut inner = self.inner.write();
        if !inner.workflows.contains_key(&workflow_id) {
            return Err(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            });
        }
        let blocker = inner
            .workflow_runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .find(|r| r.status.is_active() || r.status.is_resume());
        if let Some(run) = blocker {
            let reason = if run.status.is_resume() {
                format!("workflow run {} is still resuming ({})", run.id, run.status)
            } else {
                format!("workflow run {} is active ({})", run.id, run.status)
            };
            return Err(StoreError::NotResumable {
                workflow_id,
                reason,
            });
        }

        let now = Utc::now();
        let id = next(&mut inner.seq.workflow_run);
        inner.workflow_runs.insert(
            id,
            WorkflowRunRow {
                id,
                workflow_id,
                user: user.to_string(),
                jobmon_version: jobmon_version.to_string(),
                status: WorkflowRunStatus::Registered,
                created_date: now,
                status_date: now,
                heartbeat_date: Inner::add_seconds(now, next_report_increment),
            },
        );
        Ok((id, WorkflowRunStatus::Registered))
    }

    async fn update_workflow_run_status(
        &self,
        workflow_run_id: i64,
        status: WorkflowRunStatus,
    ) -> Result<WorkflowRunStatus, StoreError> {
        let mut inner = self.inner.write();
        inner.transition_run(workflow_run_id, status, Utc::now())
    }

    async fn log_workflow_run_heartbeat(
        &self,
        workflow_run_id: i64,
        status: WorkflowRunStatus,
        next_report_increment: f64,
    ) -> Result<WorkflowRunStatus, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let run = inner
            .workflow_runs
            .get_mut(&workflow_run_id)
            .ok_or(StoreError::NotFound {
                entity: "workflow_run",
                id: workflow_run_id,
            })?;
        run.heartbeat_date = Inner::add_seconds(now, next_report_increment);

        // The stored status is authoritative: a resume signal must reach the
        // caller, and anything else only moves along legal arcs.
        if run.status.is_resume() || run.status == status {
            return Ok(run.status);
        }
        if run.status.can_transition_to(status) {
            inner.transition_run(workflow_run_id, status, now)
        } else {
            Ok(inner.workflow_runs[&workflow_run_id].status)
        }
    }

    async fn sync_status(
        &self,
        workflow_run_id: i64,
        status: TaskInstanceStatus,
        task_instance_ids: Vec<i64>,
    ) -> Result<HashMap<TaskInstanceStatus, Vec<i64>>, StoreError> {
        let inner = self.inner.read();
        let known: HashSet<i64> = task_instance_ids.iter().copied().collect();
        let mut status_updates: HashMap<TaskInstanceStatus, Vec<i64>> = HashMap::new();

        for id in &task_instance_ids {
            if let Some(instance) = inner.task_instances.get(id) {
                if instance.status != status {
                    status_updates.entry(instance.status).or_default().push(*id);
                }
            }
        }
        for instance in inner.task_instances.values() {
            if instance.workflow_run_id == workflow_run_id
                && instance.status == status
                && !known.contains(&instance.id)
            {
                status_updates.entry(status).or_default().push(instance.id);
            }
        }
        for ids in status_updates.values_mut() {
            ids.sort_unstable();
        }
        Ok(status_updates)
    }

    async fn set_status_for_triaging(&self, workflow_run_id: i64) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let overdue: Vec<(i64, TaskInstanceStatus, bool)> = inner
            .task_instances
            .values()
            .filter(|i| {
                i.workflow_run_id == workflow_run_id
                    && matches!(
                        i.status,
                        TaskInstanceStatus::Launched | TaskInstanceStatus::Running
                    )
                    && i.report_by_date.is_some_and(|d| d <= now)
            })
            .map(|i| (i.id, i.status, i.distributor_id.is_none()))
            .collect();

        let mut moved = 0;
        for (id, status, no_distributor) in overdue {
            let target = if status == TaskInstanceStatus::Launched && no_distributor {
                TaskInstanceStatus::NoHeartbeat
            } else {
                TaskInstanceStatus::Triaging
            };
            if inner.transition_instance(id, target, now)? == TransitionOutcome::Applied {
                if target == TaskInstanceStatus::NoHeartbeat {
                    inner.push_error_log(
                        id,
                        "task instance never logged a heartbeat and has no distributor id"
                            .to_string(),
                        now,
                    );
                }
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn terminate_task_instances(&self, workflow_run_id: i64) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        if !inner.workflow_runs.contains_key(&workflow_run_id) {
            return Err(StoreError::NotFound {
                entity: "workflow_run",
                id: workflow_run_id,
            });
        }

        let in_flight: Vec<i64> = inner
            .task_instances
            .values()
            .filter(|i| {
                i.workflow_run_id == workflow_run_id
                    && matches!(
                        i.status,
                        TaskInstanceStatus::Queued
                            | TaskInstanceStatus::Instantiated
                            | TaskInstanceStatus::Launched
                            | TaskInstanceStatus::Running
                    )
            })
            .map(|i| i.id)
            .collect();
        let mut flagged = 0;
        for id in &in_flight {
            if inner.transition_instance(*id, TaskInstanceStatus::KillSelf, now)?
                == TransitionOutcome::Applied
            {
                flagged += 1;
            }
        }

        if inner.workflow_runs[&workflow_run_id].status.is_resume() {
            inner.transition_run(workflow_run_id, WorkflowRunStatus::Terminated, now)?;
        }
        Ok(flagged)
    }

    // =========================================================================
    // Array batches
    // =========================================================================

    async fn queue_task_batch(
        &self,
        array_id: i64,
        task_ids: Vec<i64>,
        task_resources_id: i64,
        workflow_run_id: i64,
    ) -> Result<HashMap<TaskStatus, Vec<i64>>, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let queueable: Vec<i64> = task_ids
            .iter()
            .copied()
            .filter(|id| {
                inner.tasks.get(id).is_some_and(|t| {
                    matches!(
                        t.status,
                        TaskStatus::Registering | TaskStatus::AdjustingResources
                    )
                })
            })
            .collect();

        if !queueable.is_empty() {
            let batch_num = inner
                .task_instances
                .values()
                .filter(|i| i.array_id == array_id)
                .map(|i| i.array_batch_num)
                .max()
                .unwrap_or(0)
                + 1;

            let mut transitioned: Vec<i64> = Vec::with_capacity(queueable.len());
            for id in &queueable {
                let task = inner.tasks.get_mut(id).unwrap();
                task.status = TaskStatus::Queued;
                task.status_date = now;
                task.num_attempts += 1;
                transitioned.push(*id);
            }
            transitioned.sort_unstable();

            for (step_id, task_id) in transitioned.iter().enumerate() {
                let id = next(&mut inner.seq.task_instance);
                inner.task_instances.insert(
                    id,
                    TaskInstanceRow {
                        id,
                        task_id: *task_id,
                        workflow_run_id,
                        array_id,
                        array_batch_num: batch_num,
                        array_step_id: step_id as i64,
                        task_resources_id,
                        status: TaskInstanceStatus::Queued,
                        distributor_id: None,
                        nodename: None,
                        process_group_id: None,
                        submitted_date: None,
                        report_by_date: None,
                        status_date: now,
                        stdout: None,
                        stderr: None,
                        stdout_log: None,
                        stderr_log: None,
                        wallclock: None,
                        maxrss: None,
                    },
                );
            }
        }

        // Always report the current status of every input task, including
        // no-op transitions.
        let mut tasks_by_status: HashMap<TaskStatus, Vec<i64>> = HashMap::new();
        for id in &task_ids {
            if let Some(task) = inner.tasks.get(id) {
                tasks_by_status.entry(task.status).or_default().push(*id);
            }
        }
        for ids in tasks_by_status.values_mut() {
            ids.sort_unstable();
        }
        Ok(tasks_by_status)
    }

    async fn instantiate_task_instances(
        &self,
        task_instance_ids: Vec<i64>,
    ) -> Result<Vec<TaskInstanceBatchWire>, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let ids: HashSet<i64> = task_instance_ids.iter().copied().collect();

        // Tasks first: QUEUED -> INSTANTIATING where an input instance points
        // at them.
        let task_ids: Vec<i64> = inner
            .task_instances
            .values()
            .filter(|i| ids.contains(&i.id))
            .map(|i| i.task_id)
            .collect();
        for task_id in task_ids {
            if let Some(task) = inner.tasks.get_mut(&task_id) {
                if task.status == TaskStatus::Queued {
                    task.status = TaskStatus::Instantiating;
                    task.status_date = now;
                }
            }
        }

        // Then the inner-join gate: only instances whose task actually made
        // it to INSTANTIATING become INSTANTIATED.
        let eligible: Vec<i64> = inner
            .task_instances
            .values()
            .filter(|i| {
                ids.contains(&i.id)
                    && i.status == TaskInstanceStatus::Queued
                    && inner
                        .tasks
                        .get(&i.task_id)
                        .is_some_and(|t| t.status == TaskStatus::Instantiating)
            })
            .map(|i| i.id)
            .collect();
        for id in &eligible {
            let instance = inner.task_instances.get_mut(id).unwrap();
            instance.status = TaskInstanceStatus::Instantiated;
            instance.status_date = now;
        }

        // Group what actually transitioned for array submission.
        let mut grouped: BTreeMap<(i64, i64, i64), Vec<i64>> = BTreeMap::new();
        for id in &ids {
            if let Some(instance) = inner.task_instances.get(id) {
                if instance.status == TaskInstanceStatus::Instantiated {
                    grouped
                        .entry((
                            instance.array_id,
                            instance.array_batch_num,
                            instance.task_resources_id,
                        ))
                        .or_default()
                        .push(*id);
                }
            }
        }

        let mut batches = Vec::with_capacity(grouped.len());
        for ((array_id, array_batch_num, task_resources_id), mut batch_ids) in grouped {
            batch_ids.sort_unstable();
            let array_name = inner
                .arrays
                .get(&array_id)
                .map(|a| a.name.clone())
                .unwrap_or_default();
            batches.push(TaskInstanceBatchWire {
                array_id,
                array_name,
                array_batch_num,
                task_resources_id,
                task_instance_ids: batch_ids,
            });
        }
        Ok(batches)
    }

    async fn transition_batch_to_launched(
        &self,
        array_id: i64,
        batch_number: i64,
        next_report_increment: f64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let batch_task_ids: HashSet<i64> = inner
            .task_instances
            .values()
            .filter(|i| i.array_id == array_id && i.array_batch_num == batch_number)
            .map(|i| i.task_id)
            .collect();
        for task_id in batch_task_ids {
            if let Some(task) = inner.tasks.get_mut(&task_id) {
                if task.status == TaskStatus::Instantiating {
                    task.status = TaskStatus::Launched;
                    task.status_date = now;
                }
            }
        }

        let report_by = Inner::add_seconds(now, next_report_increment);
        for instance in inner.task_instances.values_mut() {
            if instance.array_id == array_id
                && instance.array_batch_num == batch_number
                && instance.status == TaskInstanceStatus::Instantiated
            {
                instance.status = TaskInstanceStatus::Launched;
                instance.status_date = now;
                instance.submitted_date = Some(now);
                instance.report_by_date = Some(report_by);
            }
        }
        Ok(())
    }

    async fn transition_batch_to_killed(
        &self,
        array_id: i64,
        batch_number: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let kill_flagged: Vec<(i64, i64)> = inner
            .task_instances
            .values()
            .filter(|i| {
                i.array_id == array_id
                    && i.array_batch_num == batch_number
                    && i.status == TaskInstanceStatus::KillSelf
            })
            .map(|i| (i.id, i.task_id))
            .collect();

        for (_, task_id) in &kill_flagged {
            if let Some(task) = inner.tasks.get_mut(task_id) {
                if matches!(task.status, TaskStatus::Launched | TaskStatus::Running) {
                    task.status = TaskStatus::ErrorFatal;
                    task.status_date = now;
                }
            }
        }
        for (instance_id, _) in &kill_flagged {
            inner.transition_instance(*instance_id, TaskInstanceStatus::ErrorFatal, now)?;
        }
        Ok(())
    }

    async fn log_array_distributor_ids(
        &self,
        array_id: i64,
        distributor_ids: HashMap<i64, String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for (task_instance_id, distributor_id) in distributor_ids {
            if let Some(instance) = inner.task_instances.get_mut(&task_instance_id) {
                if instance.array_id == array_id {
                    instance.distributor_id = Some(distributor_id);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Task instance lifecycle
    // =========================================================================

    async fn log_running(
        &self,
        task_instance_id: i64,
        report: RunningReport,
    ) -> Result<WorkerTaskInstance, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        {
            let instance = inner.task_instances.get_mut(&task_instance_id).ok_or(
                StoreError::NotFound {
                    entity: "task_instance",
                    id: task_instance_id,
                },
            )?;
            if let Some(distributor_id) = &report.distributor_id {
                instance.distributor_id = Some(distributor_id.clone());
            }
            instance.nodename = Some(report.nodename.clone());
            instance.process_group_id = Some(report.process_group_id);
        }

        let current = inner.task_instances[&task_instance_id].status;
        match classify_instance_transition(current, TaskInstanceStatus::Running) {
            TransitionOutcome::Applied => {
                inner.transition_instance(task_instance_id, TaskInstanceStatus::Running, now)?;
                let instance = inner.task_instances.get_mut(&task_instance_id).unwrap();
                instance.report_by_date =
                    Some(Inner::add_seconds(now, report.next_report_increment));
            }
            TransitionOutcome::Repeat => {
                warn!(task_instance_id, "log_running on an already-running instance");
            }
            TransitionOutcome::Illegal => match current {
                // A kill flag observed at startup is acted on by the server
                // itself; the worker sees the fatal status and exits.
                TaskInstanceStatus::KillSelf => {
                    inner.transition_instance(
                        task_instance_id,
                        TaskInstanceStatus::ErrorFatal,
                        now,
                    )?;
                }
                TaskInstanceStatus::NoHeartbeat => {
                    inner.transition_instance(task_instance_id, TaskInstanceStatus::Error, now)?;
                }
                _ => {
                    error!(
                        task_instance_id,
                        from = %current,
                        "illegal log_running transition"
                    );
                }
            },
        }

        let instance = &inner.task_instances[&task_instance_id];
        let task = inner
            .tasks
            .get(&instance.task_id)
            .ok_or(StoreError::NotFound {
                entity: "task",
                id: instance.task_id,
            })?;
        let array = inner.arrays.get(&task.array_id).ok_or(StoreError::NotFound {
            entity: "array",
            id: task.array_id,
        })?;
        Ok(WorkerTaskInstance {
            task_instance_id,
            status: instance.status,
            workflow_id: task.workflow_id,
            workflow_run_id: instance.workflow_run_id,
            task_id: task.id,
            array_id: task.array_id,
            name: task.name.clone(),
            command: task.command.clone(),
            stdout_dir: array.stdout_dir.clone(),
            stderr_dir: array.stderr_dir.clone(),
        })
    }

    async fn log_done(
        &self,
        task_instance_id: i64,
        report: WorkerReport,
    ) -> Result<TaskInstanceStatus, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        inner.apply_worker_report(task_instance_id, &report);
        inner.transition_instance(task_instance_id, TaskInstanceStatus::Done, now)?;
        Ok(inner.task_instances[&task_instance_id].status)
    }

    async fn log_error_worker_node(
        &self,
        task_instance_id: i64,
        error_state: TaskInstanceStatus,
        error_description: String,
        report: WorkerReport,
    ) -> Result<TaskInstanceStatus, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        inner.apply_worker_report(task_instance_id, &report);
        let outcome = inner.transition_instance(task_instance_id, error_state, now)?;
        if outcome == TransitionOutcome::Applied {
            inner.push_error_log(task_instance_id, error_description, now);
        }
        Ok(inner.task_instances[&task_instance_id].status)
    }

    async fn log_report_by(
        &self,
        task_instance_id: i64,
        next_report_increment: f64,
        report: WorkerReport,
    ) -> Result<TaskInstanceStatus, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        inner.apply_worker_report(task_instance_id, &report);
        {
            let instance = inner.task_instances.get_mut(&task_instance_id).ok_or(
                StoreError::NotFound {
                    entity: "task_instance",
                    id: task_instance_id,
                },
            )?;
            instance.report_by_date = Some(Inner::add_seconds(now, next_report_increment));
        }
        // A late heartbeat wins the triage race.
        if inner.task_instances[&task_instance_id].status == TaskInstanceStatus::Triaging {
            inner.transition_instance(task_instance_id, TaskInstanceStatus::Running, now)?;
        }
        Ok(inner.task_instances[&task_instance_id].status)
    }

    async fn log_report_by_batch(
        &self,
        task_instance_ids: Vec<i64>,
        next_report_increment: f64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let report_by = Inner::add_seconds(Utc::now(), next_report_increment);
        for id in task_instance_ids {
            if let Some(instance) = inner.task_instances.get_mut(&id) {
                if matches!(
                    instance.status,
                    TaskInstanceStatus::Launched | TaskInstanceStatus::Running
                ) {
                    instance.report_by_date = Some(report_by);
                }
            }
        }
        Ok(())
    }

    async fn log_distributor_id(
        &self,
        task_instance_id: i64,
        distributor_id: &str,
        next_report_increment: f64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        // Per-instance launch path (array fallback): move the parent task
        // along as the batch route would have.
        let task_id = inner
            .task_instances
            .get(&task_instance_id)
            .map(|i| i.task_id)
            .ok_or(StoreError::NotFound {
                entity: "task_instance",
                id: task_instance_id,
            })?;
        if let Some(task) = inner.tasks.get_mut(&task_id) {
            if task.status == TaskStatus::Instantiating {
                task.status = TaskStatus::Launched;
                task.status_date = now;
            }
        }

        inner.transition_instance(task_instance_id, TaskInstanceStatus::Launched, now)?;
        let instance = inner.task_instances.get_mut(&task_instance_id).unwrap();
        instance.distributor_id = Some(distributor_id.to_string());
        instance.submitted_date = Some(now);
        instance.report_by_date = Some(Inner::add_seconds(now, next_report_increment));
        Ok(())
    }

    async fn log_no_distributor_id(
        &self,
        task_instance_id: i64,
        no_id_err_msg: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let outcome = inner.transition_instance(
            task_instance_id,
            TaskInstanceStatus::NoDistributorId,
            now,
        )?;
        if outcome == TransitionOutcome::Applied {
            inner.push_error_log(task_instance_id, no_id_err_msg.to_string(), now);
        }
        Ok(())
    }

    async fn log_triage_error(
        &self,
        task_instance_id: i64,
        error_state: TaskInstanceStatus,
        error_message: String,
        distributor_id: Option<String>,
        nodename: Option<String>,
        require_overdue: bool,
    ) -> Result<TaskInstanceStatus, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        {
            let instance = inner.task_instances.get_mut(&task_instance_id).ok_or(
                StoreError::NotFound {
                    entity: "task_instance",
                    id: task_instance_id,
                },
            )?;
            if require_overdue && instance.report_by_date.is_some_and(|d| d > now) {
                // A heartbeat arrived since the reconciler looked; leave it.
                return Ok(instance.status);
            }
            if let Some(distributor_id) = distributor_id {
                instance.distributor_id = Some(distributor_id);
            }
            if let Some(nodename) = nodename {
                instance.nodename = Some(nodename);
            }
        }
        let outcome = inner.transition_instance(task_instance_id, error_state, now)?;
        if outcome == TransitionOutcome::Applied {
            inner.push_error_log(task_instance_id, error_message, now);
        }
        Ok(inner.task_instances[&task_instance_id].status)
    }

    async fn task_instance_error_log(
        &self,
        task_instance_id: i64,
    ) -> Result<Vec<TaskInstanceErrorLogWire>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .error_logs
            .iter()
            .filter(|e| e.task_instance_id == task_instance_id)
            .map(|e| TaskInstanceErrorLogWire {
                task_instance_id: e.task_instance_id,
                error_time: e.error_time,
                description: e.description.clone(),
            })
            .collect())
    }

    // =========================================================================
    // Task queries and admin
    // =========================================================================

    async fn get_downstream_tasks(
        &self,
        task_ids: Vec<i64>,
        dag_id: i64,
    ) -> Result<HashMap<i64, DownstreamTask>, StoreError> {
        let inner = self.inner.read();
        let mut result = HashMap::new();
        for task_id in task_ids {
            let Some(task) = inner.tasks.get(&task_id) else {
                continue;
            };
            let downstream_node_ids = inner
                .edges
                .get(&(dag_id, task.node_id))
                .map(|e| e.downstream_node_ids.clone())
                .unwrap_or_default();
            result.insert(
                task_id,
                DownstreamTask {
                    node_id: task.node_id,
                    downstream_node_ids,
                },
            );
        }
        Ok(result)
    }

    async fn set_task_resume_state(
        &self,
        workflow_id: i64,
        reset_if_running: bool,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let resumable = inner
            .workflow_runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .all(|r| r.status.is_terminal());
        if !resumable {
            return Err(StoreError::NotResumable {
                workflow_id,
                reason: "an active workflow run still holds this workflow".to_string(),
            });
        }

        let mut reset = 0;
        for task in inner.tasks.values_mut() {
            if task.workflow_id != workflow_id {
                continue;
            }
            let excluded = matches!(task.status, TaskStatus::Done | TaskStatus::Registering)
                || (!reset_if_running && task.status == TaskStatus::Running);
            if excluded {
                continue;
            }
            task.status = TaskStatus::Registering;
            task.num_attempts = 0;
            task.status_date = now;
            reset += 1;
        }
        Ok(reset)
    }

    async fn update_task_statuses(
        &self,
        task_ids: Vec<i64>,
        new_status: TaskStatus,
        workflow_id: i64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let mut updated = 0;
        let mut to_kill: Vec<i64> = Vec::new();

        for task_id in &task_ids {
            let Some(task) = inner.tasks.get_mut(task_id) else {
                continue;
            };
            if task.workflow_id != workflow_id {
                continue;
            }
            task.status = new_status;
            task.status_date = now;
            if new_status == TaskStatus::Registering {
                task.num_attempts = 0;
            }
            updated += 1;
        }
        if new_status == TaskStatus::Registering {
            to_kill.extend(
                inner
                    .task_instances
                    .values()
                    .filter(|i| {
                        task_ids.contains(&i.task_id)
                            && !i.status.is_terminal()
                            && i.status != TaskInstanceStatus::KillSelf
                    })
                    .map(|i| i.id),
            );
        }
        for instance_id in to_kill {
            inner.transition_instance(instance_id, TaskInstanceStatus::KillSelf, now)?;
        }
        Ok(updated)
    }

    async fn most_recent_ti_error(
        &self,
        task_id: i64,
    ) -> Result<Option<(String, i64)>, StoreError> {
        let inner = self.inner.read();
        let latest_instance = inner
            .task_instances
            .values()
            .filter(|i| i.task_id == task_id)
            .max_by_key(|i| i.id);
        let Some(instance) = latest_instance else {
            return Ok(None);
        };
        Ok(inner
            .error_logs
            .iter()
            .filter(|e| e.task_instance_id == instance.id)
            .max_by_key(|e| e.id)
            .map(|e| (e.description.clone(), e.task_instance_id)))
    }

    async fn tasks_recursive(
        &self,
        task_ids: Vec<i64>,
        downstream: bool,
    ) -> Result<Vec<i64>, StoreError> {
        let inner = self.inner.read();
        let mut closure: HashSet<i64> = HashSet::new();
        let mut frontier: Vec<i64> = task_ids;

        while let Some(task_id) = frontier.pop() {
            if !closure.insert(task_id) {
                continue;
            }
            let Some(task) = inner.tasks.get(&task_id) else {
                continue;
            };
            let Some(workflow) = inner.workflows.get(&task.workflow_id) else {
                continue;
            };
            let node_map = inner.node_task_map(task.workflow_id);
            if let Some(edge) = inner.edges.get(&(workflow.dag_id, task.node_id)) {
                let neighbors = if downstream {
                    &edge.downstream_node_ids
                } else {
                    &edge.upstream_node_ids
                };
                frontier.extend(neighbors.iter().filter_map(|node_id| node_map.get(node_id)));
            }
        }
        let mut closure: Vec<i64> = closure.into_iter().collect();
        closure.sort_unstable();
        Ok(closure)
    }

    async fn task_dependencies(
        &self,
        task_id: i64,
    ) -> Result<(Vec<TaskSummary>, Vec<TaskSummary>), StoreError> {
        let inner = self.inner.read();
        let task = inner.tasks.get(&task_id).ok_or(StoreError::NotFound {
            entity: "task",
            id: task_id,
        })?;
        let workflow = inner
            .workflows
            .get(&task.workflow_id)
            .ok_or(StoreError::NotFound {
                entity: "workflow",
                id: task.workflow_id,
            })?;
        let node_map = inner.node_task_map(task.workflow_id);
        let edge = inner.edges.get(&(workflow.dag_id, task.node_id));

        let mut up = Vec::new();
        let mut down = Vec::new();
        if let Some(edge) = edge {
            for node_id in &edge.upstream_node_ids {
                if let Some(summary) = node_map.get(node_id).and_then(|id| inner.task_summary(*id))
                {
                    up.push(summary);
                }
            }
            for node_id in &edge.downstream_node_ids {
                if let Some(summary) = node_map.get(node_id).and_then(|id| inner.task_summary(*id))
                {
                    down.push(summary);
                }
            }
        }
        up.sort_by_key(|t| t.task_id);
        down.sort_by_key(|t| t.task_id);
        Ok((up, down))
    }

    // =========================================================================
    // CLI status queries
    // =========================================================================

    async fn workflow_status_row(&self, workflow_id: i64) -> Result<WorkflowStatusRow, StoreError> {
        let inner = self.inner.read();
        let workflow = inner.workflows.get(&workflow_id).ok_or(StoreError::NotFound {
            entity: "workflow",
            id: workflow_id,
        })?;
        let mut task_counts: HashMap<TaskStatus, i64> = HashMap::new();
        for task in inner.tasks.values() {
            if task.workflow_id == workflow_id {
                *task_counts.entry(task.status).or_default() += 1;
            }
        }
        Ok(WorkflowStatusRow {
            workflow_id,
            name: workflow.name.clone(),
            status: workflow.status,
            created_date: workflow.created_date,
            task_counts,
        })
    }

    async fn workflow_tasks(
        &self,
        workflow_id: i64,
        statuses: Option<Vec<TaskStatus>>,
        limit: usize,
    ) -> Result<Vec<WorkflowTaskRow>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .filter(|t| {
                statuses
                    .as_ref()
                    .map_or(true, |wanted| wanted.contains(&t.status))
            })
            .take(limit)
            .map(|t| WorkflowTaskRow {
                task_id: t.id,
                name: t.name.clone(),
                status: t.status,
                num_attempts: t.num_attempts,
                max_attempts: t.max_attempts,
            })
            .collect())
    }

    async fn task_status_rows(
        &self,
        task_ids: Vec<i64>,
    ) -> Result<Vec<TaskStatusRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows = Vec::new();
        for task_id in task_ids {
            let Some(task) = inner.tasks.get(&task_id) else {
                continue;
            };
            let latest_instance = inner
                .task_instances
                .values()
                .filter(|i| i.task_id == task_id)
                .max_by_key(|i| i.id);
            let error_description = latest_instance.and_then(|instance| {
                inner
                    .error_logs
                    .iter()
                    .filter(|e| e.task_instance_id == instance.id)
                    .max_by_key(|e| e.id)
                    .map(|e| e.description.clone())
            });
            rows.push(TaskStatusRow {
                task_id,
                name: task.name.clone(),
                status: task.status,
                task_instance_id: latest_instance.map(|i| i.id),
                task_instance_status: latest_instance.map(|i| i.status),
                error_description,
            });
        }
        Ok(rows)
    }
}
