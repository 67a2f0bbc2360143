//! StateUpdate: the value object every sync and scheduling call folds into.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use jobmon_core::constants::{TaskStatus, WorkflowRunStatus};

/// A partial view of server-side changes. Every field is optional; merging
/// takes the newer side's value where present.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub task_statuses: HashMap<i64, TaskStatus>,
    pub max_concurrently_running: Option<i64>,
    pub array_limits: HashMap<i64, i64>,
    pub workflow_run_status: Option<WorkflowRunStatus>,
    pub sync_time: Option<DateTime<Utc>>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.task_statuses.is_empty()
            && self.max_concurrently_running.is_none()
            && self.array_limits.is_empty()
            && self.workflow_run_status.is_none()
            && self.sync_time.is_none()
    }

    /// Build from a `task_status_updates` response.
    pub fn from_task_status_response(
        tasks_by_status: HashMap<TaskStatus, Vec<i64>>,
        sync_time: DateTime<Utc>,
    ) -> Self {
        let mut task_statuses = HashMap::new();
        for (status, task_ids) in tasks_by_status {
            for task_id in task_ids {
                task_statuses.insert(task_id, status);
            }
        }
        Self {
            task_statuses,
            sync_time: Some(sync_time),
            ..Default::default()
        }
    }

    /// Fold `other` into `self`; `other` wins wherever both carry a value.
    pub fn merge(mut self, other: StateUpdate) -> Self {
        self.task_statuses.extend(other.task_statuses);
        if other.max_concurrently_running.is_some() {
            self.max_concurrently_running = other.max_concurrently_running;
        }
        self.array_limits.extend(other.array_limits);
        if other.workflow_run_status.is_some() {
            self.workflow_run_status = other.workflow_run_status;
        }
        if other.sync_time.is_some() {
            self.sync_time = other.sync_time;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_update_is_empty() {
        let update = StateUpdate::default();
        assert!(update.is_empty());
    }

    #[test]
    fn from_task_status_response_flattens_buckets() {
        let now = Utc::now();
        let update = StateUpdate::from_task_status_response(
            HashMap::from([
                (TaskStatus::Done, vec![1, 2, 3]),
                (TaskStatus::Running, vec![4, 5]),
            ]),
            now,
        );
        assert!(!update.is_empty());
        assert_eq!(update.task_statuses[&1], TaskStatus::Done);
        assert_eq!(update.task_statuses[&4], TaskStatus::Running);
        assert_eq!(update.sync_time, Some(now));
    }

    #[test]
    fn merge_overrides_with_the_newer_side() {
        let older = StateUpdate {
            task_statuses: HashMap::from([
                (1, TaskStatus::Running),
                (2, TaskStatus::Queued),
            ]),
            max_concurrently_running: Some(100),
            ..Default::default()
        };
        let newer = StateUpdate {
            task_statuses: HashMap::from([(2, TaskStatus::Running), (3, TaskStatus::Done)]),
            max_concurrently_running: Some(200),
            workflow_run_status: Some(WorkflowRunStatus::Done),
            ..Default::default()
        };

        let merged = older.merge(newer);
        assert_eq!(merged.task_statuses[&1], TaskStatus::Running);
        assert_eq!(merged.task_statuses[&2], TaskStatus::Running);
        assert_eq!(merged.task_statuses[&3], TaskStatus::Done);
        assert_eq!(merged.max_concurrently_running, Some(200));
        assert_eq!(merged.workflow_run_status, Some(WorkflowRunStatus::Done));
    }

    #[test]
    fn merge_keeps_older_values_where_newer_is_silent() {
        let older = StateUpdate {
            max_concurrently_running: Some(200),
            array_limits: HashMap::from([(1, 10), (2, 20)]),
            ..Default::default()
        };
        let newer = StateUpdate {
            array_limits: HashMap::from([(2, 25), (3, 30)]),
            ..Default::default()
        };

        let merged = older.merge(newer);
        assert_eq!(merged.max_concurrently_running, Some(200));
        assert_eq!(merged.array_limits[&1], 10);
        assert_eq!(merged.array_limits[&2], 25);
        assert_eq!(merged.array_limits[&3], 30);
    }
}
