//! The swarm's view of one task.

use std::collections::{BTreeMap, BTreeSet};

use jobmon_core::constants::TaskStatus;
use jobmon_core::resources::{ComputeResourcesCallable, ResourceScaler, TaskResources};

/// One task in the swarm arena.
///
/// Topology is held as id sets, not object references: the arena
/// (`SwarmState.tasks`) is the single owner and edges are resolved through
/// it, so the upstream/downstream cycle never needs back-pointers.
pub struct SwarmTask {
    pub task_id: i64,
    pub array_id: i64,
    pub status: TaskStatus,
    pub max_attempts: i64,

    /// Total upstream edges, from the DAG.
    pub num_upstreams: usize,

    /// Upstreams observed DONE so far.
    pub num_upstreams_done: usize,

    pub downstream_task_ids: BTreeSet<i64>,

    pub cluster_name: String,
    pub task_resources: TaskResources,
    pub resource_scales: BTreeMap<String, ResourceScaler>,
    pub fallback_queues: Vec<String>,

    /// Evaluated once, at fringe initialization, to produce the initial
    /// resource request.
    pub compute_resources_callable: Option<ComputeResourcesCallable>,
}

impl SwarmTask {
    pub fn all_upstreams_done(&self) -> bool {
        self.num_upstreams_done >= self.num_upstreams
    }

    /// Eligible to enter the ready queue when its upstreams finish.
    pub fn is_schedulable(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Registering | TaskStatus::AdjustingResources
        )
    }

    /// Derive the next attempt's resource request from the scaling rules,
    /// falling back to the next queue when one is configured.
    pub fn adjust_resources(&mut self) -> Result<(), jobmon_core::CoreError> {
        let mut scaled = self.task_resources.scale(&mut self.resource_scales)?;
        if !self.fallback_queues.is_empty() {
            scaled.queue_name = self.fallback_queues.remove(0);
        }
        self.task_resources = scaled;
        Ok(())
    }
}

impl std::fmt::Debug for SwarmTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmTask")
            .field("task_id", &self.task_id)
            .field("array_id", &self.array_id)
            .field("status", &self.status)
            .field("num_upstreams", &self.num_upstreams)
            .field("num_upstreams_done", &self.num_upstreams_done)
            .field("downstream_task_ids", &self.downstream_task_ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> SwarmTask {
        SwarmTask {
            task_id: 1,
            array_id: 1,
            status: TaskStatus::Registering,
            max_attempts: 3,
            num_upstreams: 2,
            num_upstreams_done: 0,
            downstream_task_ids: BTreeSet::new(),
            cluster_name: "sequential".to_string(),
            task_resources: TaskResources::new(
                "all.q",
                BTreeMap::from([("memory".to_string(), json!(10))]),
            ),
            resource_scales: BTreeMap::from([("memory".to_string(), ResourceScaler::Factor(0.5))]),
            fallback_queues: vec!["long.q".to_string()],
            compute_resources_callable: None,
        }
    }

    #[test]
    fn upstream_counting_gates_readiness() {
        let mut task = task();
        assert!(!task.all_upstreams_done());
        task.num_upstreams_done = 2;
        assert!(task.all_upstreams_done());
    }

    #[test]
    fn adjust_resources_scales_and_rotates_queue() {
        let mut task = task();
        task.adjust_resources().unwrap();
        assert_eq!(task.task_resources.requested_resources["memory"], json!(15));
        assert_eq!(task.task_resources.queue_name, "long.q");
        assert!(task.fallback_queues.is_empty());
        assert!(!task.task_resources.is_bound());
    }
}
