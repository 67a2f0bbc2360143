//! SwarmBuilder: constructs SwarmState for new runs and resumes.
//!
//! New runs build from an in-memory [`WorkflowDescription`] the binding
//! layer produced. Resumes rebuild from the database: workflow metadata,
//! then non-DONE tasks in id-ordered chunks, then downstream edges in
//! chunks, heartbeating throughout so the run stays alive during long
//! fetches.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info};

use jobmon_client::Requester;
use jobmon_core::config::HeartbeatConfig;
use jobmon_core::constants::{TaskStatus, WorkflowRunStatus};
use jobmon_core::contracts::{
    GetDownstreamTasksRequest, GetDownstreamTasksResponse, GetTasksResponse, LogHeartbeatRequest,
    WorkflowMetadataResponse, WorkflowRunStatusResponse,
};
use jobmon_core::resources::{ComputeResourcesCallable, ResourceScaler, TaskResources};
use jobmon_core::CoreError;
use jobmon_core::RESUME_CHUNK_SIZE;

use crate::array::SwarmArray;
use crate::error::SwarmError;
use crate::gateway::ServerGateway;
use crate::state::SwarmState;
use crate::task::SwarmTask;

/// In-memory description of a bound workflow, for new runs.
#[derive(Clone)]
pub struct WorkflowDescription {
    pub workflow_id: i64,
    pub dag_id: i64,
    pub max_concurrently_running: i64,
    pub arrays: Vec<ArrayDescription>,
    pub tasks: Vec<TaskDescription>,
}

#[derive(Clone)]
pub struct ArrayDescription {
    pub array_id: i64,
    pub name: String,
    pub max_concurrently_running: i64,
}

#[derive(Clone)]
pub struct TaskDescription {
    pub task_id: i64,
    pub array_id: i64,
    pub status: TaskStatus,
    pub max_attempts: i64,
    pub upstream_task_ids: Vec<i64>,
    pub downstream_task_ids: Vec<i64>,
    pub cluster_name: String,
    pub queue_name: String,
    pub requested_resources: BTreeMap<String, Value>,
    pub resource_scales: BTreeMap<String, Value>,
    pub fallback_queues: Vec<String>,
    pub compute_resources_callable: Option<ComputeResourcesCallable>,
}

/// Builds fully initialized swarm state; hand the result to
/// [`crate::orchestrator::WorkflowRunOrchestrator`].
pub struct SwarmBuilder {
    requester: Requester,
    workflow_run_id: i64,
    heartbeat: HeartbeatConfig,
    status: WorkflowRunStatus,
    last_heartbeat: Option<Instant>,
}

impl SwarmBuilder {
    pub fn new(requester: Requester, workflow_run_id: i64, heartbeat: HeartbeatConfig) -> Self {
        Self {
            requester,
            workflow_run_id,
            heartbeat,
            status: WorkflowRunStatus::Registered,
            last_heartbeat: None,
        }
    }

    /// Build state from an in-memory workflow (new run).
    pub async fn build_from_workflow(
        &mut self,
        workflow: WorkflowDescription,
    ) -> Result<SwarmState, SwarmError> {
        let last_sync = self.requester.server_time().await?;
        let mut state = SwarmState::new(
            workflow.workflow_id,
            self.workflow_run_id,
            workflow.dag_id,
            workflow.max_concurrently_running,
            WorkflowRunStatus::Bound,
            last_sync,
        );

        for array in workflow.arrays {
            state.add_array(SwarmArray::new(
                array.array_id,
                array.max_concurrently_running,
                array.name,
            ));
        }

        for task in workflow.tasks {
            let scales = ResourceScaler::from_persisted(&task.resource_scales)?;
            state.add_task(SwarmTask {
                task_id: task.task_id,
                array_id: task.array_id,
                status: task.status,
                max_attempts: task.max_attempts,
                num_upstreams: task.upstream_task_ids.len(),
                num_upstreams_done: 0,
                downstream_task_ids: task.downstream_task_ids.iter().copied().collect(),
                cluster_name: task.cluster_name,
                task_resources: TaskResources::new(task.queue_name, task.requested_resources),
                resource_scales: scales,
                fallback_queues: task.fallback_queues,
                compute_resources_callable: task.compute_resources_callable,
            });
        }

        state.compute_initial_upstream_done_counts();
        self.update_status(WorkflowRunStatus::Bound).await?;
        Ok(state)
    }

    /// Rebuild state from the database (resume).
    pub async fn build_from_workflow_id(
        &mut self,
        workflow_id: i64,
    ) -> Result<SwarmState, SwarmError> {
        // Keep the run alive before starting potentially long fetches.
        self.log_heartbeat().await?;

        let response: WorkflowMetadataResponse = self
            .requester
            .get(&format!("/workflow/{workflow_id}/fetch_workflow_metadata"))
            .await?;
        let metadata = response
            .workflow
            .ok_or(CoreError::EmptyWorkflow(workflow_id))?;
        let last_sync = self.requester.server_time().await?;

        let mut state = SwarmState::new(
            metadata.workflow_id,
            self.workflow_run_id,
            metadata.dag_id,
            metadata.max_concurrently_running,
            self.status,
            last_sync,
        );

        self.fetch_tasks(&mut state, workflow_id).await?;
        self.fetch_downstreams(&mut state).await?;

        self.update_status(WorkflowRunStatus::Bound).await?;
        state.status = WorkflowRunStatus::Bound;
        info!(
            tasks = state.tasks.len(),
            arrays = state.arrays.len(),
            "task DAG fully constructed, swarm is ready to run"
        );
        Ok(state)
    }

    /// Fetch non-DONE tasks in id-ordered chunks, heartbeating as we go.
    async fn fetch_tasks(
        &mut self,
        state: &mut SwarmState,
        workflow_id: i64,
    ) -> Result<(), SwarmError> {
        // Cluster bindings are shared across tasks, memoized by name.
        let mut cluster_registry: HashSet<String> = HashSet::new();
        let mut max_task_id = 0i64;

        info!("fetching tasks from the database");
        loop {
            self.maybe_heartbeat().await?;
            if !state.tasks.is_empty() && state.tasks.len() % 1000 == 0 {
                info!(collected = state.tasks.len(), "still fetching tasks");
            }

            let response: GetTasksResponse = self
                .requester
                .get(&format!(
                    "/workflow/get_tasks/{workflow_id}?max_task_id={max_task_id}&chunk_size={RESUME_CHUNK_SIZE}"
                ))
                .await?;
            if response.tasks.is_empty() {
                break;
            }
            let chunk_len = response.tasks.len();
            max_task_id = *response.tasks.keys().max().expect("non-empty chunk");

            for (task_id, metadata) in response.tasks {
                let scales = ResourceScaler::from_persisted(&metadata.resource_scales)
                    .map_err(|e| SwarmError::Rebuild(e.to_string()))?;

                if cluster_registry.insert(metadata.cluster_name.clone()) {
                    debug!(cluster = %metadata.cluster_name, "binding cluster");
                }

                if !state.arrays.contains_key(&metadata.array_id) {
                    state.add_array(SwarmArray::new(
                        metadata.array_id,
                        metadata.array_max_concurrently_running,
                        String::new(),
                    ));
                }

                state.add_task(SwarmTask {
                    task_id,
                    array_id: metadata.array_id,
                    status: metadata.status,
                    max_attempts: metadata.max_attempts,
                    num_upstreams: 0,
                    num_upstreams_done: 0,
                    downstream_task_ids: BTreeSet::new(),
                    cluster_name: metadata.cluster_name,
                    task_resources: TaskResources::new(
                        metadata.queue_name,
                        metadata.requested_resources,
                    ),
                    resource_scales: scales,
                    fallback_queues: metadata.fallback_queues,
                    compute_resources_callable: None,
                });
            }

            if chunk_len < RESUME_CHUNK_SIZE {
                break;
            }
        }
        info!(total = state.tasks.len(), "all tasks fetched");
        Ok(())
    }

    /// Fetch downstream edges in chunks and rebuild the topology.
    ///
    /// DONE tasks were never loaded, so upstream counts are recomputed
    /// purely from the edges between loaded tasks; the initial scan and
    /// later incremental propagation therefore agree by construction.
    async fn fetch_downstreams(&mut self, state: &mut SwarmState) -> Result<(), SwarmError> {
        let task_ids: Vec<i64> = state.tasks.keys().copied().collect();
        let mut node_task_map: HashMap<i64, i64> = HashMap::new();
        let mut task_edge_map: HashMap<i64, Vec<i64>> = HashMap::new();

        info!("setting dependencies on tasks");
        for chunk in task_ids.chunks(RESUME_CHUNK_SIZE) {
            self.maybe_heartbeat().await?;

            let response: GetDownstreamTasksResponse = self
                .requester
                .post(
                    "/task/get_downstream_tasks",
                    &GetDownstreamTasksRequest {
                        task_ids: chunk.to_vec(),
                        dag_id: state.dag_id,
                    },
                )
                .await?;

            for (task_id, downstream) in response.downstream_tasks {
                node_task_map.insert(downstream.node_id, task_id);
                task_edge_map.insert(task_id, downstream.downstream_node_ids);
            }
        }

        for (task_id, downstream_node_ids) in task_edge_map {
            for node_id in downstream_node_ids {
                let Some(&downstream_task_id) = node_task_map.get(&node_id) else {
                    // Downstream of a DONE task fetch gap, or the node's
                    // task is already DONE; either way it is not ours.
                    continue;
                };
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.downstream_task_ids.insert(downstream_task_id);
                }
                if let Some(downstream) = state.tasks.get_mut(&downstream_task_id) {
                    downstream.num_upstreams += 1;
                }
            }
        }
        Ok(())
    }

    async fn update_status(&mut self, status: WorkflowRunStatus) -> Result<(), SwarmError> {
        let response: WorkflowRunStatusResponse = self
            .requester
            .put(
                &format!("/workflow_run/{}/update_status", self.workflow_run_id),
                &jobmon_core::contracts::UpdateWorkflowRunStatusRequest { status },
            )
            .await?;
        self.status = response.status;
        Ok(())
    }

    async fn log_heartbeat(&mut self) -> Result<(), SwarmError> {
        let response: WorkflowRunStatusResponse = self
            .requester
            .post(
                &format!("/workflow_run/{}/log_heartbeat", self.workflow_run_id),
                &LogHeartbeatRequest {
                    status: self.status,
                    next_report_increment: self.heartbeat.workflow_run_report_increment(),
                },
            )
            .await?;
        self.status = response.status;
        self.last_heartbeat = Some(Instant::now());
        Ok(())
    }

    async fn maybe_heartbeat(&mut self) -> Result<(), SwarmError> {
        let due = match self.last_heartbeat {
            None => true,
            Some(at) => at.elapsed() >= self.heartbeat.workflow_run_interval,
        };
        if due {
            self.log_heartbeat().await?;
        }
        Ok(())
    }

    /// The gateway bound to the built state's ids.
    pub fn gateway(&self, state: &SwarmState) -> ServerGateway {
        ServerGateway::new(
            self.requester.clone(),
            state.workflow_id,
            self.workflow_run_id,
        )
    }
}
