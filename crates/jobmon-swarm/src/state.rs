//! SwarmState: the task arena, status index and ready queue.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use jobmon_core::constants::{TaskStatus, WorkflowRunStatus};
use jobmon_core::resources::evaluate_compute_resources;
use jobmon_core::CoreError;

use crate::array::SwarmArray;
use crate::task::SwarmTask;
use crate::update::StateUpdate;

/// All statuses a swarm task can hold, used to pre-populate the index.
const TRACKED_STATUSES: [TaskStatus; 8] = [
    TaskStatus::Registering,
    TaskStatus::AdjustingResources,
    TaskStatus::Queued,
    TaskStatus::Instantiating,
    TaskStatus::Launched,
    TaskStatus::Running,
    TaskStatus::Done,
    TaskStatus::ErrorFatal,
];

/// The in-memory view of one workflow run.
///
/// Tasks live in a single id-keyed arena; edges are id sets resolved through
/// it. The status index is the primary structure for counting and must stay
/// consistent with every task's `status` field; all mutation goes through
/// [`SwarmState::apply_update`].
pub struct SwarmState {
    pub workflow_id: i64,
    pub workflow_run_id: i64,
    pub dag_id: i64,
    pub max_concurrently_running: i64,
    pub status: WorkflowRunStatus,

    pub tasks: HashMap<i64, SwarmTask>,
    pub arrays: HashMap<i64, SwarmArray>,

    task_status_map: HashMap<TaskStatus, HashSet<i64>>,

    /// Tasks whose upstreams are all DONE, waiting for capacity.
    pub ready_to_run: VecDeque<i64>,

    /// Tasks that can never run because an upstream failed fatally. They
    /// stay REGISTERING but never enter the ready queue.
    unreachable: HashSet<i64>,

    pub last_sync: DateTime<Utc>,
}

impl SwarmState {
    pub fn new(
        workflow_id: i64,
        workflow_run_id: i64,
        dag_id: i64,
        max_concurrently_running: i64,
        status: WorkflowRunStatus,
        last_sync: DateTime<Utc>,
    ) -> Self {
        let task_status_map = TRACKED_STATUSES
            .iter()
            .map(|status| (*status, HashSet::new()))
            .collect();
        Self {
            workflow_id,
            workflow_run_id,
            dag_id,
            max_concurrently_running,
            status,
            tasks: HashMap::new(),
            arrays: HashMap::new(),
            task_status_map,
            ready_to_run: VecDeque::new(),
            unreachable: HashSet::new(),
            last_sync,
        }
    }

    pub fn add_array(&mut self, array: SwarmArray) {
        self.arrays.insert(array.array_id, array);
    }

    /// Insert a task and index it by status.
    pub fn add_task(&mut self, task: SwarmTask) {
        self.task_status_map
            .entry(task.status)
            .or_default()
            .insert(task.task_id);
        if let Some(array) = self.arrays.get_mut(&task.array_id) {
            array.add_task(task.task_id);
        }
        self.tasks.insert(task.task_id, task);
    }

    pub fn get_task(&self, task_id: i64) -> Option<&SwarmTask> {
        self.tasks.get(&task_id)
    }

    pub fn tasks_in(&self, status: TaskStatus) -> &HashSet<i64> {
        self.task_status_map
            .get(&status)
            .expect("status index is pre-populated for every tracked status")
    }

    /// Tasks counting against the workflow concurrency cap.
    pub fn active_task_count(&self) -> usize {
        TRACKED_STATUSES
            .iter()
            .filter(|s| s.is_active())
            .map(|s| self.tasks_in(*s).len())
            .sum()
    }

    /// Active tasks within one array.
    pub fn array_active_count(&self, array_id: i64) -> usize {
        let Some(array) = self.arrays.get(&array_id) else {
            return 0;
        };
        array
            .task_ids
            .iter()
            .filter(|task_id| {
                self.tasks
                    .get(task_id)
                    .is_some_and(|t| t.status.is_active())
            })
            .count()
    }

    pub fn done_count(&self) -> usize {
        self.tasks_in(TaskStatus::Done).len()
    }

    pub fn failed_count(&self) -> usize {
        self.tasks_in(TaskStatus::ErrorFatal).len()
    }

    pub fn is_unreachable(&self, task_id: i64) -> bool {
        self.unreachable.contains(&task_id)
    }

    /// Every task is terminal or provably never-runnable, and nothing is
    /// waiting for capacity.
    pub fn all_tasks_final(&self) -> bool {
        self.ready_to_run.is_empty()
            && self.tasks.values().all(|task| {
                task.status.is_terminal() || self.unreachable.contains(&task.task_id)
            })
    }

    /// Initial propagation for states built from an in-memory workflow:
    /// every DONE task bumps its downstreams' completion counts.
    pub fn compute_initial_upstream_done_counts(&mut self) {
        let done_downstreams: Vec<i64> = self
            .tasks_in(TaskStatus::Done)
            .iter()
            .flat_map(|task_id| {
                self.tasks[task_id]
                    .downstream_task_ids
                    .iter()
                    .copied()
                    .collect::<Vec<_>>()
            })
            .collect();
        for task_id in done_downstreams {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.num_upstreams_done += 1;
            }
        }
    }

    /// Evaluate deferred resource callables and seed the ready queue.
    ///
    /// Fails fast on an invalid compute-resources return, before anything
    /// is submitted to the cluster.
    pub fn set_initial_fringe(&mut self) -> Result<(), CoreError> {
        let mut ready: Vec<i64> = Vec::new();
        for task in self.tasks.values_mut() {
            if let Some(callable) = task.compute_resources_callable.take() {
                let resources = evaluate_compute_resources(task.task_id, &callable)?;
                task.task_resources.requested_resources = resources.into_iter().collect();
            }
            if task.is_schedulable() && task.all_upstreams_done() {
                ready.push(task.task_id);
            }
        }
        ready.sort_unstable();
        self.ready_to_run
            .extend(ready.into_iter().filter(|id| !self.unreachable.contains(id)));
        debug!(fringe = self.ready_to_run.len(), "initial fringe seeded");
        Ok(())
    }

    /// Apply a merged server update. Returns the number of tasks whose
    /// status actually changed (no-op reports do not count).
    pub fn apply_update(&mut self, update: StateUpdate) -> usize {
        if let Some(max) = update.max_concurrently_running {
            self.max_concurrently_running = max;
        }
        for (array_id, limit) in update.array_limits {
            if let Some(array) = self.arrays.get_mut(&array_id) {
                array.max_concurrently_running = limit;
            }
        }
        if let Some(run_status) = update.workflow_run_status {
            self.status = run_status;
        }
        if let Some(sync_time) = update.sync_time {
            self.last_sync = sync_time;
        }

        let mut changed = 0;
        for (task_id, new_status) in update.task_statuses {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            let old_status = task.status;
            if old_status == new_status {
                continue;
            }
            task.status = new_status;
            self.task_status_map
                .entry(old_status)
                .or_default()
                .remove(&task_id);
            self.task_status_map
                .entry(new_status)
                .or_default()
                .insert(task_id);
            changed += 1;

            match new_status {
                TaskStatus::Done => self.propagate_completion(task_id),
                TaskStatus::ErrorFatal => self.mark_downstreams_unreachable(task_id),
                TaskStatus::AdjustingResources => {
                    // A recoverable failure: derive the next attempt's
                    // resources and put the task back in line.
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        if let Err(e) = task.adjust_resources() {
                            warn!(task_id, "resource adjustment failed: {e}");
                        }
                    }
                    self.ready_to_run.push_back(task_id);
                }
                _ => {}
            }
        }
        changed
    }

    /// A task finished: bump downstream counts and enqueue the newly ready.
    fn propagate_completion(&mut self, task_id: i64) {
        let downstreams: Vec<i64> = self.tasks[&task_id]
            .downstream_task_ids
            .iter()
            .copied()
            .collect();
        for downstream_id in downstreams {
            let unreachable = self.unreachable.contains(&downstream_id);
            let Some(downstream) = self.tasks.get_mut(&downstream_id) else {
                continue;
            };
            downstream.num_upstreams_done += 1;
            if downstream.all_upstreams_done()
                && downstream.status == TaskStatus::Registering
                && !unreachable
            {
                debug!(task_id = downstream_id, "task ready to run");
                self.ready_to_run.push_back(downstream_id);
            }
        }
    }

    /// A task failed fatally: its entire downstream subtree can never run.
    fn mark_downstreams_unreachable(&mut self, task_id: i64) {
        let mut frontier: Vec<i64> = self.tasks[&task_id]
            .downstream_task_ids
            .iter()
            .copied()
            .collect();
        while let Some(task_id) = frontier.pop() {
            if !self.unreachable.insert(task_id) {
                continue;
            }
            if let Some(task) = self.tasks.get(&task_id) {
                frontier.extend(task.downstream_task_ids.iter().copied());
            }
        }
    }
}
