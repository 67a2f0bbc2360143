//! Cluster plugin interface.
//!
//! The distributor and worker talk to a batch scheduler exclusively through
//! these traits. Concrete plugins (Slurm, a local-process backend, test
//! doubles) live with the components that drive them.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;

use crate::constants::TaskInstanceStatus;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The plugin does not support array submission; the distributor falls
    /// back to per-instance submission.
    #[error("array submission is not implemented by this cluster")]
    ArrayNotImplemented,

    #[error("cluster submission failed: {0}")]
    Submission(String),

    #[error("cluster error: {0}")]
    Other(String),
}

/// Target of a worker-node command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerNodeTarget {
    /// A single task instance.
    TaskInstance(i64),

    /// One array batch; the worker resolves its own step id from the
    /// cluster environment.
    ArrayBatch { array_id: i64, batch_number: i64 },
}

/// Distributor-side cluster operations.
///
/// Array submission is an optional capability: the distributor probes it by
/// attempting the call and catching [`ClusterError::ArrayNotImplemented`].
#[async_trait]
pub trait ClusterDistributor: Send + Sync {
    fn cluster_name(&self) -> &str;

    async fn start(&self) -> Result<(), ClusterError>;

    async fn stop(&self) -> Result<(), ClusterError>;

    /// Submit a single command; returns the cluster-assigned distributor id.
    async fn submit_to_batch_distributor(
        &self,
        command: &str,
        name: &str,
        requested_resources: &BTreeMap<String, Value>,
    ) -> Result<String, ClusterError>;

    /// Submit an array job; returns `array_step_id -> distributor_id`.
    async fn submit_array_to_batch_distributor(
        &self,
        _command: &str,
        _name: &str,
        _requested_resources: &BTreeMap<String, Value>,
        _array_length: usize,
    ) -> Result<HashMap<i64, String>, ClusterError> {
        Err(ClusterError::ArrayNotImplemented)
    }

    async fn terminate_task_instances(
        &self,
        distributor_ids: &[String],
    ) -> Result<(), ClusterError>;

    /// Why did a submitted job stop heartbeating? Returns the terminal error
    /// status to apply plus a description.
    async fn get_remote_exit_info(
        &self,
        distributor_id: &str,
    ) -> Result<(TaskInstanceStatus, String), ClusterError>;

    /// Which of the given jobs are still alive on the cluster.
    async fn get_submitted_or_running(
        &self,
        distributor_ids: &[String],
    ) -> Result<HashSet<String>, ClusterError>;

    /// Build the command line the cluster runs on the worker node.
    fn build_worker_node_command(&self, target: WorkerNodeTarget) -> String;
}

/// Worker-side cluster operations.
pub trait ClusterWorkerNode: Send + Sync {
    /// The cluster job id, if the environment exposes one.
    fn distributor_id(&self) -> Option<String>;

    /// Resolve the path for a stdout/stderr capture file.
    fn initialize_logfile(&self, kind: &str, dir: &str, name: &str) -> String;

    /// Map a nonzero exit code (plus the stderr tail) to a terminal error
    /// status and message.
    fn get_exit_info(&self, returncode: i32, stderr_tail: &str) -> (TaskInstanceStatus, String);
}
