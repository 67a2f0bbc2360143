//! The distributor's view of one task instance.

use jobmon_core::constants::TaskInstanceStatus;

/// Tracking record for a task instance between QUEUED and terminal.
#[derive(Debug, Clone)]
pub struct DistributorTaskInstance {
    pub task_instance_id: i64,
    pub workflow_run_id: i64,
    pub status: TaskInstanceStatus,

    /// Cluster job id, known once submission succeeds.
    pub distributor_id: Option<String>,

    /// The (array_id, batch_number) this instance launches under.
    pub batch_key: Option<(i64, i64)>,
}

impl DistributorTaskInstance {
    pub fn new(task_instance_id: i64, workflow_run_id: i64, status: TaskInstanceStatus) -> Self {
        Self {
            task_instance_id,
            workflow_run_id,
            status,
            distributor_id: None,
            batch_key: None,
        }
    }
}
