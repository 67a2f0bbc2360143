//! The swarm's view of one array.

use std::collections::BTreeSet;

/// An array groups tasks sharing a task-template version; it is the unit of
/// cluster-array submission and carries its own concurrency cap.
#[derive(Debug, Clone)]
pub struct SwarmArray {
    pub array_id: i64,
    pub max_concurrently_running: i64,
    pub array_name: String,
    pub task_ids: BTreeSet<i64>,
}

impl SwarmArray {
    pub fn new(array_id: i64, max_concurrently_running: i64, array_name: impl Into<String>) -> Self {
        Self {
            array_id,
            max_concurrently_running,
            array_name: array_name.into(),
            task_ids: BTreeSet::new(),
        }
    }

    pub fn add_task(&mut self, task_id: i64) {
        self.task_ids.insert(task_id);
    }
}
