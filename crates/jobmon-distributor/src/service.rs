//! The distributor service loop.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use jobmon_client::{Requester, RequesterError};
use jobmon_core::cluster::{ClusterDistributor, ClusterError, WorkerNodeTarget};
use jobmon_core::config::DistributorConfig;
use jobmon_core::constants::{TaskInstanceStatus, WorkflowRunStatus};
use jobmon_core::contracts::*;

use crate::batch::TaskInstanceBatch;
use crate::task_instance::DistributorTaskInstance;

/// Statuses the distributor owns, in processing order.
const WORK_ORDER: [TaskInstanceStatus; 6] = [
    TaskInstanceStatus::Queued,
    TaskInstanceStatus::Instantiated,
    TaskInstanceStatus::Launched,
    TaskInstanceStatus::Running,
    TaskInstanceStatus::Triaging,
    TaskInstanceStatus::KillSelf,
];

/// Claim size for QUEUED instances.
const INSTANTIATE_CHUNK_SIZE: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum DistributorError {
    #[error(transparent)]
    Requester(#[from] RequesterError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Signal-driven shutdown; unwinds to a clean `cluster.stop()`.
    #[error("distributor interrupted: {0}")]
    Interrupted(String),

    #[error("no workflow run attached; call set_workflow_run first")]
    NotAttached,
}

/// The cluster dispatcher for one workflow run.
pub struct DistributorService {
    requester: Requester,
    cluster: Arc<dyn ClusterDistributor>,
    config: DistributorConfig,

    workflow_run_id: Option<i64>,
    task_instances: HashMap<i64, DistributorTaskInstance>,
    batches: HashMap<(i64, i64), TaskInstanceBatch>,
    status_sets: HashMap<TaskInstanceStatus, BTreeSet<i64>>,
    last_heartbeat: Instant,
}

impl DistributorService {
    pub fn new(
        cluster: Arc<dyn ClusterDistributor>,
        requester: Requester,
        config: DistributorConfig,
    ) -> Self {
        let status_sets = WORK_ORDER
            .iter()
            .map(|status| (*status, BTreeSet::new()))
            .collect();
        Self {
            requester,
            cluster,
            config,
            workflow_run_id: None,
            task_instances: HashMap::new(),
            batches: HashMap::new(),
            status_sets,
            last_heartbeat: Instant::now(),
        }
    }

    fn next_report_increment(&self) -> f64 {
        self.config.heartbeat.task_instance_report_increment()
    }

    fn workflow_run_id(&self) -> Result<i64, DistributorError> {
        self.workflow_run_id.ok_or(DistributorError::NotAttached)
    }

    /// Instances currently tracked in a status (for tests and logging).
    pub fn tracked(&self, status: TaskInstanceStatus) -> Vec<i64> {
        self.status_sets
            .get(&status)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Attach to a workflow run and announce ourselves.
    pub async fn set_workflow_run(&mut self, workflow_run_id: i64) -> Result<(), DistributorError> {
        self.workflow_run_id = Some(workflow_run_id);
        let _: WorkflowRunStatusResponse = self
            .requester
            .put(
                &format!("/workflow_run/{workflow_run_id}/update_status"),
                &UpdateWorkflowRunStatusRequest {
                    status: WorkflowRunStatus::Instantiated,
                },
            )
            .await?;
        Ok(())
    }

    /// The service loop: sweep statuses until the heartbeat budget is
    /// spent, heartbeat, repeat. Runs until a shutdown signal arrives.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), DistributorError> {
        let workflow_run_id = self.workflow_run_id()?;
        let result = self.run_inner(&mut shutdown).await;

        // Wind down the cluster no matter how the loop ended, and leave the
        // liveness marker a parent process watches for.
        if let Err(e) = self.cluster.stop().await {
            warn!("cluster stop failed: {e}");
        }
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "SHUTDOWN");
        let _ = stderr.flush();

        match result {
            Err(DistributorError::Interrupted(reason)) => {
                info!(workflow_run_id, "distributor interrupted: {reason}");
                Ok(())
            }
            other => other,
        }
    }

    async fn run_inner(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DistributorError> {
        self.cluster.start().await?;
        let workflow_run_id = self.workflow_run_id()?;
        let _: WorkflowRunStatusResponse = self
            .requester
            .put(
                &format!("/workflow_run/{workflow_run_id}/update_status"),
                &UpdateWorkflowRunStatusRequest {
                    status: WorkflowRunStatus::Launched,
                },
            )
            .await?;

        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "ALIVE");
        let _ = stderr.flush();

        loop {
            if *shutdown.borrow() {
                return Err(DistributorError::Interrupted("shutdown signal".to_string()));
            }
            self.tick(shutdown).await?;

            let elapsed = self.last_heartbeat.elapsed();
            if elapsed < self.config.poll_interval {
                let sleep = self.config.poll_interval - elapsed;
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// One sweep over every status followed by the heartbeat step. Public
    /// so tests can drive the service deterministically.
    pub async fn tick(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DistributorError> {
        let budget = self.config.heartbeat.workflow_run_interval;
        let sweep_started = Instant::now();

        for status in WORK_ORDER {
            if *shutdown.borrow() {
                return Err(DistributorError::Interrupted("shutdown signal".to_string()));
            }
            let status_started = Instant::now();
            self.refresh_status_from_db(status).await?;
            match status {
                TaskInstanceStatus::Queued => self.process_queued().await?,
                TaskInstanceStatus::Instantiated => self.process_instantiated().await?,
                TaskInstanceStatus::Triaging => self.process_triaging().await?,
                TaskInstanceStatus::KillSelf => self.process_kill_self().await?,
                // LAUNCHED and RUNNING only need their refresh; liveness is
                // handled by the heartbeat step below.
                _ => {}
            }
            debug!(
                status = %status,
                elapsed_ms = status_started.elapsed().as_millis() as u64,
                "status processed"
            );
            if sweep_started.elapsed() >= budget {
                // Out of budget: heartbeat now, resume the sweep next tick.
                break;
            }
        }

        self.log_task_instance_report_by().await?;
        Ok(())
    }

    /// Reconcile one status set against the server.
    async fn refresh_status_from_db(
        &mut self,
        status: TaskInstanceStatus,
    ) -> Result<(), DistributorError> {
        let workflow_run_id = self.workflow_run_id()?;
        let known = self.tracked(status);
        let response: SyncStatusResponse = self
            .requester
            .post(
                &format!("/workflow_run/{workflow_run_id}/sync_status"),
                &SyncStatusRequest {
                    status,
                    task_instance_ids: known,
                },
            )
            .await?;

        for (new_status, task_instance_ids) in response.status_updates {
            for task_instance_id in task_instance_ids {
                let previous = self
                    .task_instances
                    .get(&task_instance_id)
                    .map(|instance| instance.status);
                if let Some(previous) = previous {
                    if let Some(set) = self.status_sets.get_mut(&previous) {
                        set.remove(&task_instance_id);
                    }
                }

                let instance = self
                    .task_instances
                    .entry(task_instance_id)
                    .or_insert_with(|| {
                        DistributorTaskInstance::new(task_instance_id, workflow_run_id, new_status)
                    });
                instance.status = new_status;

                match self.status_sets.get_mut(&new_status) {
                    Some(set) => {
                        set.insert(task_instance_id);
                    }
                    None => {
                        // Terminal: expire it from the distributor.
                        self.task_instances.remove(&task_instance_id);
                    }
                }
            }
        }
        Ok(())
    }

    /// QUEUED -> INSTANTIATED in chunks; group the results into batches.
    async fn process_queued(&mut self) -> Result<(), DistributorError> {
        let queued = self.tracked(TaskInstanceStatus::Queued);
        for chunk in queued.chunks(INSTANTIATE_CHUNK_SIZE) {
            let response: InstantiateTaskInstancesResponse = self
                .requester
                .post(
                    "/task_instance/instantiate_task_instances",
                    &InstantiateTaskInstancesRequest {
                        task_instance_ids: chunk.to_vec(),
                    },
                )
                .await?;

            for batch_wire in response.task_instance_batches {
                let key = (batch_wire.array_id, batch_wire.array_batch_num);
                let batch = self.batches.entry(key).or_insert_with(|| {
                    TaskInstanceBatch::new(
                        batch_wire.array_id,
                        batch_wire.array_name.clone(),
                        batch_wire.array_batch_num,
                        batch_wire.task_resources_id,
                    )
                });
                for task_instance_id in batch_wire.task_instance_ids {
                    batch.add_task_instance(task_instance_id);
                    if let Some(instance) = self.task_instances.get_mut(&task_instance_id) {
                        instance.status = TaskInstanceStatus::Instantiated;
                        instance.batch_key = Some(key);
                    }
                    self.status_sets
                        .get_mut(&TaskInstanceStatus::Queued)
                        .expect("tracked status")
                        .remove(&task_instance_id);
                    self.status_sets
                        .get_mut(&TaskInstanceStatus::Instantiated)
                        .expect("tracked status")
                        .insert(task_instance_id);
                }
            }
        }
        Ok(())
    }

    /// Launch every batch with instantiated members.
    async fn process_instantiated(&mut self) -> Result<(), DistributorError> {
        let instantiated = self.tracked(TaskInstanceStatus::Instantiated);
        let mut batch_keys: BTreeSet<(i64, i64)> = BTreeSet::new();
        for task_instance_id in instantiated {
            if let Some(key) = self
                .task_instances
                .get(&task_instance_id)
                .and_then(|instance| instance.batch_key)
            {
                batch_keys.insert(key);
            }
        }

        for key in batch_keys {
            if let Err(e) = self.launch_batch(key).await {
                if self.config.raise_on_error {
                    return Err(e);
                }
                error!(array_id = key.0, batch_number = key.1, "batch launch failed: {e}");
            }
        }
        Ok(())
    }

    async fn launch_batch(&mut self, key: (i64, i64)) -> Result<(), DistributorError> {
        let Some(mut batch) = self.batches.remove(&key) else {
            return Ok(());
        };

        if batch.requested_resources.is_none() {
            let wire: TaskResourcesWire = self
                .requester
                .get(&format!("/task_resources/{}", batch.task_resources_id))
                .await?;
            batch.requested_resources = Some(wire.requested_resources);
        }
        let requested_resources = batch.requested_resources.clone().unwrap_or_default();

        let command = self.cluster.build_worker_node_command(WorkerNodeTarget::ArrayBatch {
            array_id: batch.array_id,
            batch_number: batch.batch_number,
        });

        match self
            .cluster
            .submit_array_to_batch_distributor(
                &command,
                &batch.submission_name(),
                &requested_resources,
                batch.task_instance_ids.len(),
            )
            .await
        {
            Ok(distributor_id_map) => {
                let by_instance = batch.distributor_ids_by_instance(&distributor_id_map);
                let _: Value = self
                    .requester
                    .post(
                        &format!("/array/{}/log_distributor_id", batch.array_id),
                        &LogArrayDistributorIdRequest {
                            distributor_ids: by_instance.clone(),
                        },
                    )
                    .await?;
                let _: Value = self
                    .requester
                    .post(
                        &format!("/array/{}/transition_to_launched", batch.array_id),
                        &TransitionBatchToLaunchedRequest {
                            batch_number: batch.batch_number,
                            next_report_increment: self.next_report_increment(),
                        },
                    )
                    .await?;
                for (task_instance_id, distributor_id) in by_instance {
                    self.mark_launched(task_instance_id, distributor_id);
                }
                info!(
                    array_id = batch.array_id,
                    batch_number = batch.batch_number,
                    size = batch.task_instance_ids.len(),
                    "array batch launched"
                );
            }
            Err(ClusterError::ArrayNotImplemented) => {
                debug!(
                    array_id = batch.array_id,
                    "cluster has no array support, launching per instance"
                );
                for task_instance_id in batch.task_instance_ids.clone() {
                    self.launch_task_instance(task_instance_id, &batch, &requested_resources)
                        .await?;
                }
            }
            Err(e) => {
                // A failed submission consumes an attempt on every member.
                for task_instance_id in batch.task_instance_ids.clone() {
                    self.transition_to_no_distributor_id(task_instance_id, &e.to_string())
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Per-instance submission, used when the cluster lacks array support.
    async fn launch_task_instance(
        &mut self,
        task_instance_id: i64,
        batch: &TaskInstanceBatch,
        requested_resources: &std::collections::BTreeMap<String, Value>,
    ) -> Result<(), DistributorError> {
        let command = self
            .cluster
            .build_worker_node_command(WorkerNodeTarget::TaskInstance(task_instance_id));
        let name = format!("{}-{task_instance_id}", batch.array_name);

        match self
            .cluster
            .submit_to_batch_distributor(&command, &name, requested_resources)
            .await
        {
            Ok(distributor_id) => {
                let _: Value = self
                    .requester
                    .post(
                        &format!("/task_instance/{task_instance_id}/log_distributor_id"),
                        &LogDistributorIdRequest {
                            distributor_id: distributor_id.clone(),
                            next_report_increment: self.next_report_increment(),
                        },
                    )
                    .await?;
                self.mark_launched(task_instance_id, distributor_id);
            }
            Err(e) => {
                self.transition_to_no_distributor_id(task_instance_id, &e.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    fn mark_launched(&mut self, task_instance_id: i64, distributor_id: String) {
        if let Some(instance) = self.task_instances.get_mut(&task_instance_id) {
            instance.status = TaskInstanceStatus::Launched;
            instance.distributor_id = Some(distributor_id);
        }
        self.status_sets
            .get_mut(&TaskInstanceStatus::Instantiated)
            .expect("tracked status")
            .remove(&task_instance_id);
        self.status_sets
            .get_mut(&TaskInstanceStatus::Launched)
            .expect("tracked status")
            .insert(task_instance_id);
    }

    async fn transition_to_no_distributor_id(
        &mut self,
        task_instance_id: i64,
        no_id_err_msg: &str,
    ) -> Result<(), DistributorError> {
        warn!(task_instance_id, "submission failed: {no_id_err_msg}");
        let _: Value = self
            .requester
            .post(
                &format!("/task_instance/{task_instance_id}/log_no_distributor_id"),
                &LogNoDistributorIdRequest {
                    no_id_err_msg: no_id_err_msg.to_string(),
                },
            )
            .await?;
        self.status_sets
            .get_mut(&TaskInstanceStatus::Instantiated)
            .expect("tracked status")
            .remove(&task_instance_id);
        self.task_instances.remove(&task_instance_id);
        Ok(())
    }

    /// Resolve TRIAGING instances through the cluster's exit info.
    async fn process_triaging(&mut self) -> Result<(), DistributorError> {
        for task_instance_id in self.tracked(TaskInstanceStatus::Triaging) {
            let distributor_id = self
                .task_instances
                .get(&task_instance_id)
                .and_then(|instance| instance.distributor_id.clone());

            let (error_state, message) = match &distributor_id {
                Some(distributor_id) => self.cluster.get_remote_exit_info(distributor_id).await?,
                None => (
                    TaskInstanceStatus::UnknownError,
                    "task instance stopped reporting before submission was recorded".to_string(),
                ),
            };

            let _: TaskInstanceStatusResponse = self
                .requester
                .post(
                    &format!("/task_instance/{task_instance_id}/log_known_error"),
                    &LogTriageErrorRequest {
                        error_state,
                        error_message: message,
                        distributor_id,
                        nodename: None,
                    },
                )
                .await?;
            self.expire(task_instance_id, TaskInstanceStatus::Triaging);
        }
        Ok(())
    }

    /// Kill flagged instances on the cluster and fail them.
    async fn process_kill_self(&mut self) -> Result<(), DistributorError> {
        for task_instance_id in self.tracked(TaskInstanceStatus::KillSelf) {
            let distributor_id = self
                .task_instances
                .get(&task_instance_id)
                .and_then(|instance| instance.distributor_id.clone());
            if let Some(distributor_id) = &distributor_id {
                self.cluster
                    .terminate_task_instances(std::slice::from_ref(distributor_id))
                    .await?;
            }
            let _: TaskInstanceStatusResponse = self
                .requester
                .post(
                    &format!("/task_instance/{task_instance_id}/log_known_error"),
                    &LogTriageErrorRequest {
                        error_state: TaskInstanceStatus::ErrorFatal,
                        error_message: "task instance was self-killed".to_string(),
                        distributor_id,
                        nodename: None,
                    },
                )
                .await?;
            self.expire(task_instance_id, TaskInstanceStatus::KillSelf);
        }
        Ok(())
    }

    fn expire(&mut self, task_instance_id: i64, from: TaskInstanceStatus) {
        if let Some(set) = self.status_sets.get_mut(&from) {
            set.remove(&task_instance_id);
        }
        self.task_instances.remove(&task_instance_id);
    }

    /// Heartbeat every LAUNCHED instance the cluster still vouches for.
    async fn log_task_instance_report_by(&mut self) -> Result<(), DistributorError> {
        let launched = self.tracked(TaskInstanceStatus::Launched);
        let distributor_ids: Vec<String> = launched
            .iter()
            .filter_map(|task_instance_id| {
                self.task_instances
                    .get(task_instance_id)
                    .and_then(|instance| instance.distributor_id.clone())
            })
            .collect();
        let alive = self.cluster.get_submitted_or_running(&distributor_ids).await?;

        let to_heartbeat: Vec<i64> = launched
            .into_iter()
            .filter(|task_instance_id| {
                self.task_instances
                    .get(task_instance_id)
                    .and_then(|instance| instance.distributor_id.as_ref())
                    .is_some_and(|distributor_id| alive.contains(distributor_id))
            })
            .collect();

        debug!(count = to_heartbeat.len(), "logging batch heartbeat");
        let _: Value = self
            .requester
            .post(
                "/task_instance/log_report_by/batch",
                &LogReportByBatchRequest {
                    task_instance_ids: to_heartbeat,
                    next_report_increment: self.next_report_increment(),
                },
            )
            .await?;
        self.last_heartbeat = Instant::now();
        Ok(())
    }
}
