//! Scriptable cluster test double.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use jobmon_core::cluster::{ClusterDistributor, ClusterError, WorkerNodeTarget};
use jobmon_core::constants::TaskInstanceStatus;

/// One recorded submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub command: String,
    pub name: String,
    pub array_length: Option<usize>,
}

/// A cluster whose behavior the test scripts: array support can be toggled,
/// submissions can be made to fail, jobs can be marked dead with a chosen
/// exit classification.
pub struct FakeCluster {
    array_support: bool,
    fail_submissions_with: Mutex<Option<String>>,
    submissions: Mutex<Vec<Submission>>,
    alive: Mutex<HashSet<String>>,
    exit_info: Mutex<HashMap<String, (TaskInstanceStatus, String)>>,
    terminated: Mutex<Vec<String>>,
    counter: AtomicI64,
}

impl FakeCluster {
    pub fn new(array_support: bool) -> Self {
        Self {
            array_support,
            fail_submissions_with: Mutex::new(None),
            submissions: Mutex::new(Vec::new()),
            alive: Mutex::new(HashSet::new()),
            exit_info: Mutex::new(HashMap::new()),
            terminated: Mutex::new(Vec::new()),
            counter: AtomicI64::new(0),
        }
    }

    /// Every subsequent submission fails with this message.
    pub fn fail_submissions(&self, message: &str) {
        *self.fail_submissions_with.lock() = Some(message.to_string());
    }

    /// Mark a job dead with the exit classification triage should find.
    pub fn mark_dead(&self, distributor_id: &str, status: TaskInstanceStatus, message: &str) {
        self.alive.lock().remove(distributor_id);
        self.exit_info
            .lock()
            .insert(distributor_id.to_string(), (status, message.to_string()));
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().clone()
    }

    fn next_job_id(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl ClusterDistributor for FakeCluster {
    fn cluster_name(&self) -> &str {
        "fake"
    }

    async fn start(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn submit_to_batch_distributor(
        &self,
        command: &str,
        name: &str,
        _requested_resources: &BTreeMap<String, Value>,
    ) -> Result<String, ClusterError> {
        if let Some(message) = self.fail_submissions_with.lock().clone() {
            return Err(ClusterError::Submission(message));
        }
        self.submissions.lock().push(Submission {
            command: command.to_string(),
            name: name.to_string(),
            array_length: None,
        });
        let distributor_id = format!("fake-{}", self.next_job_id());
        self.alive.lock().insert(distributor_id.clone());
        Ok(distributor_id)
    }

    async fn submit_array_to_batch_distributor(
        &self,
        command: &str,
        name: &str,
        _requested_resources: &BTreeMap<String, Value>,
        array_length: usize,
    ) -> Result<HashMap<i64, String>, ClusterError> {
        if !self.array_support {
            return Err(ClusterError::ArrayNotImplemented);
        }
        if let Some(message) = self.fail_submissions_with.lock().clone() {
            return Err(ClusterError::Submission(message));
        }
        self.submissions.lock().push(Submission {
            command: command.to_string(),
            name: name.to_string(),
            array_length: Some(array_length),
        });
        let job_id = self.next_job_id();
        let mut alive = self.alive.lock();
        Ok((0..array_length as i64)
            .map(|step_id| {
                let distributor_id = format!("fake-{job_id}_{step_id}");
                alive.insert(distributor_id.clone());
                (step_id, distributor_id)
            })
            .collect())
    }

    async fn terminate_task_instances(
        &self,
        distributor_ids: &[String],
    ) -> Result<(), ClusterError> {
        let mut alive = self.alive.lock();
        let mut terminated = self.terminated.lock();
        for distributor_id in distributor_ids {
            alive.remove(distributor_id);
            terminated.push(distributor_id.clone());
        }
        Ok(())
    }

    async fn get_remote_exit_info(
        &self,
        distributor_id: &str,
    ) -> Result<(TaskInstanceStatus, String), ClusterError> {
        Ok(self
            .exit_info
            .lock()
            .get(distributor_id)
            .cloned()
            .unwrap_or((
                TaskInstanceStatus::UnknownError,
                format!("no exit info recorded for {distributor_id}"),
            )))
    }

    async fn get_submitted_or_running(
        &self,
        distributor_ids: &[String],
    ) -> Result<HashSet<String>, ClusterError> {
        let alive = self.alive.lock();
        Ok(distributor_ids
            .iter()
            .filter(|id| alive.contains(*id))
            .cloned()
            .collect())
    }

    fn build_worker_node_command(&self, target: WorkerNodeTarget) -> String {
        match target {
            WorkerNodeTarget::TaskInstance(task_instance_id) => {
                format!("fake-worker --task-instance-id {task_instance_id}")
            }
            WorkerNodeTarget::ArrayBatch {
                array_id,
                batch_number,
            } => format!("fake-worker --array-id {array_id} --batch-number {batch_number}"),
        }
    }
}
