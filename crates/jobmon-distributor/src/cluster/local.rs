//! Single-node cluster plugin: task instances run as local subprocesses.
//!
//! Each submission shells out to the worker-node binary; the "distributor
//! id" is the child's pid. Array submission is deliberately unimplemented
//! so this plugin also exercises the distributor's per-instance fallback.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use jobmon_core::cluster::{ClusterDistributor, ClusterError, WorkerNodeTarget};
use jobmon_core::constants::TaskInstanceStatus;

pub struct LocalProcessCluster {
    /// How to invoke the worker node, e.g. `jobmon-worker`.
    worker_command: String,
    children: Mutex<HashMap<String, Child>>,
}

impl LocalProcessCluster {
    pub fn new(worker_command: impl Into<String>) -> Self {
        Self {
            worker_command: worker_command.into(),
            children: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ClusterDistributor for LocalProcessCluster {
    fn cluster_name(&self) -> &str {
        "local_process"
    }

    async fn start(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClusterError> {
        let mut children = self.children.lock();
        for (distributor_id, child) in children.iter_mut() {
            if let Err(e) = child.start_kill() {
                warn!(%distributor_id, "failed to kill local worker: {e}");
            }
        }
        children.clear();
        Ok(())
    }

    async fn submit_to_batch_distributor(
        &self,
        command: &str,
        name: &str,
        _requested_resources: &BTreeMap<String, Value>,
    ) -> Result<String, ClusterError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .spawn()
            .map_err(|e| ClusterError::Submission(format!("failed to spawn '{name}': {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| ClusterError::Submission(format!("'{name}' exited before tracking")))?;
        let distributor_id = pid.to_string();
        debug!(%distributor_id, name, "local worker spawned");
        self.children.lock().insert(distributor_id.clone(), child);
        Ok(distributor_id)
    }

    async fn terminate_task_instances(
        &self,
        distributor_ids: &[String],
    ) -> Result<(), ClusterError> {
        let mut children = self.children.lock();
        for distributor_id in distributor_ids {
            if let Some(child) = children.get_mut(distributor_id) {
                child.start_kill().ok();
            }
        }
        Ok(())
    }

    async fn get_remote_exit_info(
        &self,
        distributor_id: &str,
    ) -> Result<(TaskInstanceStatus, String), ClusterError> {
        let mut children = self.children.lock();
        let Some(child) = children.get_mut(distributor_id) else {
            return Ok((
                TaskInstanceStatus::UnknownError,
                format!("pid {distributor_id} is not tracked by this distributor"),
            ));
        };
        match child.try_wait() {
            Ok(Some(status)) => Ok((
                TaskInstanceStatus::Error,
                format!("local worker {distributor_id} exited with {status}"),
            )),
            Ok(None) => Ok((
                TaskInstanceStatus::UnknownError,
                format!("local worker {distributor_id} is still running but stopped reporting"),
            )),
            Err(e) => Err(ClusterError::Other(e.to_string())),
        }
    }

    async fn get_submitted_or_running(
        &self,
        distributor_ids: &[String],
    ) -> Result<HashSet<String>, ClusterError> {
        let mut children = self.children.lock();
        let mut running = HashSet::new();
        for distributor_id in distributor_ids {
            if let Some(child) = children.get_mut(distributor_id) {
                if matches!(child.try_wait(), Ok(None)) {
                    running.insert(distributor_id.clone());
                }
            }
        }
        Ok(running)
    }

    fn build_worker_node_command(&self, target: WorkerNodeTarget) -> String {
        match target {
            WorkerNodeTarget::TaskInstance(task_instance_id) => {
                format!("{} --task-instance-id {task_instance_id}", self.worker_command)
            }
            WorkerNodeTarget::ArrayBatch {
                array_id,
                batch_number,
            } => format!(
                "{} --array-id {array_id} --batch-number {batch_number}",
                self.worker_command
            ),
        }
    }
}
