//! Capacity-checked batching of ready tasks into queue requests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use jobmon_core::MAX_BATCH_SIZE;

use crate::error::SwarmError;
use crate::gateway::ServerGateway;
use crate::state::SwarmState;
use crate::task::SwarmTask;
use crate::update::StateUpdate;

/// One queue-batch request: tasks sharing (array, resource request,
/// cluster), capped at [`MAX_BATCH_SIZE`].
#[derive(Debug, Clone)]
pub struct TaskBatch {
    pub array_id: i64,
    pub cluster_name: String,
    pub task_ids: Vec<i64>,
}

/// Schedules ready tasks against the workflow and array concurrency caps.
pub struct Scheduler {
    gateway: ServerGateway,
}

impl Scheduler {
    pub fn new(gateway: ServerGateway) -> Self {
        Self { gateway }
    }

    /// Workflow-level slots remaining.
    pub fn available_capacity(&self, state: &SwarmState) -> usize {
        (state.max_concurrently_running as usize).saturating_sub(state.active_task_count())
    }

    /// Array-level slots remaining.
    pub fn array_capacity(&self, state: &SwarmState, array_id: i64) -> usize {
        let Some(array) = state.arrays.get(&array_id) else {
            return 0;
        };
        (array.max_concurrently_running as usize).saturating_sub(state.array_active_count(array_id))
    }

    pub fn has_work(&self, state: &SwarmState) -> bool {
        !state.ready_to_run.is_empty() && self.available_capacity(state) > 0
    }

    /// Drain the ready queue into batches, respecting both caps.
    ///
    /// Tasks that do not fit this tick go back to the ready queue in their
    /// original order.
    pub fn generate_batches(&self, state: &mut SwarmState) -> Vec<TaskBatch> {
        let mut workflow_capacity = self.available_capacity(state);
        let mut array_capacity: HashMap<i64, usize> = HashMap::new();
        let mut groups: HashMap<(i64, String), Vec<i64>> = HashMap::new();
        let mut deferred: Vec<i64> = Vec::new();

        while let Some(task_id) = state.ready_to_run.pop_front() {
            let Some(task) = state.tasks.get(&task_id) else {
                continue;
            };
            // A stale queue entry (e.g. an admin override landed since the
            // task became ready) is dropped, not re-queued.
            if !task.is_schedulable() {
                continue;
            }
            if workflow_capacity == 0 {
                deferred.push(task_id);
                continue;
            }
            let slots = array_capacity
                .entry(task.array_id)
                .or_insert_with(|| self.array_capacity(state, task.array_id));
            if *slots == 0 {
                deferred.push(task_id);
                continue;
            }
            *slots -= 1;
            workflow_capacity -= 1;
            groups
                .entry((task.array_id, Self::batch_key(task)))
                .or_default()
                .push(task_id);
        }

        state.ready_to_run.extend(deferred);

        let mut batches: Vec<TaskBatch> = Vec::new();
        let mut keyed: Vec<_> = groups.into_iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        for ((array_id, _), task_ids) in keyed {
            let cluster_name = state.tasks[&task_ids[0]].cluster_name.clone();
            for chunk in task_ids.chunks(MAX_BATCH_SIZE) {
                batches.push(TaskBatch {
                    array_id,
                    cluster_name: cluster_name.clone(),
                    task_ids: chunk.to_vec(),
                });
            }
        }
        batches
    }

    /// Queue one batch: bind its resource request on first use, then POST
    /// and fold the returned statuses into a StateUpdate.
    pub async fn queue_batch(
        &self,
        state: &mut SwarmState,
        batch: &TaskBatch,
    ) -> Result<StateUpdate, SwarmError> {
        let lead = &state.tasks[&batch.task_ids[0]];
        let task_resources_id = match lead.task_resources.id {
            Some(id) => id,
            None => {
                let id = self
                    .gateway
                    .bind_task_resources(
                        &lead.task_resources.queue_name,
                        &lead.cluster_name,
                        lead.task_resources.requested_resources.clone(),
                    )
                    .await?;
                for task_id in &batch.task_ids {
                    if let Some(task) = state.tasks.get_mut(task_id) {
                        task.task_resources.id = Some(id);
                    }
                }
                id
            }
        };

        debug!(
            array_id = batch.array_id,
            size = batch.task_ids.len(),
            task_resources_id,
            "queueing task batch"
        );
        let tasks_by_status = self
            .gateway
            .queue_task_batch(batch.array_id, batch.task_ids.clone(), task_resources_id)
            .await?;

        let mut update = StateUpdate::default();
        for (status, task_ids) in tasks_by_status {
            for task_id in task_ids {
                update.task_statuses.insert(task_id, status);
            }
        }
        Ok(update)
    }

    /// One scheduling pass: batch everything that fits and queue it.
    ///
    /// The timeout bounds how long the pass keeps issuing requests; tasks
    /// of unsent batches return to the ready queue.
    pub async fn tick(
        &self,
        state: &mut SwarmState,
        timeout: Option<Duration>,
    ) -> Result<StateUpdate, SwarmError> {
        let start = Instant::now();
        let mut update = StateUpdate::default();

        let batches = self.generate_batches(state);
        for (i, batch) in batches.iter().enumerate() {
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    for batch in &batches[i..] {
                        state.ready_to_run.extend(batch.task_ids.iter().copied());
                    }
                    break;
                }
            }
            update = update.merge(self.queue_batch(state, batch).await?);
        }
        Ok(update)
    }

    /// Grouping key: tasks may share a queue request only when the whole
    /// resource request matches. Bound requests compare by id.
    fn batch_key(task: &SwarmTask) -> String {
        match task.task_resources.id {
            Some(id) => format!("bound:{id}:{}", task.cluster_name),
            None => format!(
                "{}:{}:{}",
                task.cluster_name,
                task.task_resources.queue_name,
                serde_json::to_string(&task.task_resources.requested_resources)
                    .unwrap_or_default()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet, VecDeque};

    use chrono::Utc;
    use serde_json::json;

    use jobmon_client::Requester;
    use jobmon_core::constants::{TaskStatus, WorkflowRunStatus};
    use jobmon_core::resources::TaskResources;

    use crate::array::SwarmArray;

    fn scheduler() -> Scheduler {
        // The gateway is never called by the batching tests.
        Scheduler::new(ServerGateway::new(Requester::new("http://localhost:1"), 1, 10))
    }

    fn state(max_concurrently_running: i64) -> SwarmState {
        SwarmState::new(
            1,
            10,
            5,
            max_concurrently_running,
            WorkflowRunStatus::Bound,
            Utc::now(),
        )
    }

    fn add_task(state: &mut SwarmState, task_id: i64, array_id: i64, memory: i64) {
        state.add_task(SwarmTask {
            task_id,
            array_id,
            status: TaskStatus::Registering,
            max_attempts: 3,
            num_upstreams: 0,
            num_upstreams_done: 0,
            downstream_task_ids: BTreeSet::new(),
            cluster_name: "sequential".to_string(),
            task_resources: TaskResources::new(
                "all.q",
                BTreeMap::from([("memory".to_string(), json!(memory))]),
            ),
            resource_scales: BTreeMap::new(),
            fallback_queues: vec![],
            compute_resources_callable: None,
        });
    }

    #[test]
    fn compatible_tasks_group_into_one_batch() {
        let mut state = state(100);
        state.add_array(SwarmArray::new(1, 100, "a"));
        for task_id in 1..=3 {
            add_task(&mut state, task_id, 1, 8);
            state.ready_to_run.push_back(task_id);
        }

        let batches = scheduler().generate_batches(&mut state);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].task_ids, vec![1, 2, 3]);
        assert!(state.ready_to_run.is_empty());
    }

    #[test]
    fn different_arrays_and_resources_split_batches() {
        let mut state = state(100);
        state.add_array(SwarmArray::new(1, 100, "a"));
        state.add_array(SwarmArray::new(2, 100, "b"));
        add_task(&mut state, 1, 1, 8);
        add_task(&mut state, 2, 1, 16); // same array, bigger request
        add_task(&mut state, 3, 2, 8); // other array
        state.ready_to_run.extend([1, 2, 3]);

        let batches = scheduler().generate_batches(&mut state);
        assert_eq!(batches.len(), 3);
    }

    #[test]
    fn workflow_capacity_defers_the_overflow() {
        let mut state = state(2);
        state.add_array(SwarmArray::new(1, 100, "a"));
        for task_id in 1..=5 {
            add_task(&mut state, task_id, 1, 8);
            state.ready_to_run.push_back(task_id);
        }

        let batches = scheduler().generate_batches(&mut state);
        let scheduled: usize = batches.iter().map(|b| b.task_ids.len()).sum();
        assert_eq!(scheduled, 2);
        assert_eq!(state.ready_to_run, VecDeque::from([3, 4, 5]));
    }

    #[test]
    fn array_capacity_defers_independently() {
        let mut state = state(100);
        state.add_array(SwarmArray::new(1, 1, "a"));
        state.add_array(SwarmArray::new(2, 100, "b"));
        add_task(&mut state, 1, 1, 8);
        add_task(&mut state, 2, 1, 8);
        add_task(&mut state, 3, 2, 8);
        state.ready_to_run.extend([1, 2, 3]);

        let batches = scheduler().generate_batches(&mut state);
        let scheduled: Vec<i64> = batches.iter().flat_map(|b| b.task_ids.clone()).collect();
        assert!(scheduled.contains(&1));
        assert!(!scheduled.contains(&2));
        assert!(scheduled.contains(&3));
        assert_eq!(state.ready_to_run, VecDeque::from([2]));
    }

    #[test]
    fn active_tasks_consume_capacity() {
        let mut state = state(3);
        state.add_array(SwarmArray::new(1, 100, "a"));
        add_task(&mut state, 1, 1, 8);
        state.add_task(SwarmTask {
            task_id: 2,
            array_id: 1,
            status: TaskStatus::Running,
            max_attempts: 3,
            num_upstreams: 0,
            num_upstreams_done: 0,
            downstream_task_ids: BTreeSet::new(),
            cluster_name: "sequential".to_string(),
            task_resources: TaskResources::new("all.q", BTreeMap::new()),
            resource_scales: BTreeMap::new(),
            fallback_queues: vec![],
            compute_resources_callable: None,
        });

        let scheduler = scheduler();
        assert_eq!(scheduler.available_capacity(&state), 2);
        assert_eq!(scheduler.array_capacity(&state, 1), 99);
        state.ready_to_run.push_back(1);
        assert!(scheduler.has_work(&state));
    }

    #[test]
    fn oversized_groups_split_at_max_batch_size() {
        let mut state = state(2000);
        state.add_array(SwarmArray::new(1, 2000, "a"));
        for task_id in 1..=(MAX_BATCH_SIZE as i64 + 10) {
            add_task(&mut state, task_id, 1, 8);
            state.ready_to_run.push_back(task_id);
        }

        let batches = scheduler().generate_batches(&mut state);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].task_ids.len(), MAX_BATCH_SIZE);
        assert_eq!(batches[1].task_ids.len(), 10);
    }
}
