//! Pure transition semantics shared by the storage backends.

use jobmon_core::constants::{TaskInstanceStatus, TaskStatus};

/// What happened when a transition was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The transition was legal and applied.
    Applied,

    /// The entity is already in the target status. Idempotent: callers log
    /// at WARN and report success.
    Repeat,

    /// Neither legal nor a repeat. Callers log at ERROR and report the
    /// current status so the requesting agent can reconverge.
    Illegal,
}

/// Classify an instance transition request against the legal table.
pub fn classify_instance_transition(
    current: TaskInstanceStatus,
    target: TaskInstanceStatus,
) -> TransitionOutcome {
    if current == target {
        TransitionOutcome::Repeat
    } else if current.can_transition_to(target) {
        TransitionOutcome::Applied
    } else {
        TransitionOutcome::Illegal
    }
}

/// The coupled Task update implied by an applied instance transition.
///
/// Error states consult the attempt budget: a recoverable error with
/// attempts remaining re-enters the scheduler via ADJUSTING_RESOURCES,
/// otherwise the task is fatally failed.
pub fn task_followup(
    applied_instance_status: TaskInstanceStatus,
    task_status: TaskStatus,
    num_attempts: i64,
    max_attempts: i64,
) -> Option<TaskStatus> {
    if task_status.is_terminal() {
        return None;
    }

    let target = match applied_instance_status {
        TaskInstanceStatus::Running => TaskStatus::Running,
        TaskInstanceStatus::Done => TaskStatus::Done,
        TaskInstanceStatus::ErrorFatal => TaskStatus::ErrorFatal,
        status if status.is_error() => {
            if num_attempts < max_attempts {
                TaskStatus::AdjustingResources
            } else {
                TaskStatus::ErrorFatal
            }
        }
        // QUEUED/INSTANTIATED/LAUNCHED mirrors run through their own batch
        // endpoints; TRIAGING and KILL_SELF leave the task alone.
        _ => return None,
    };

    (task_status != target && task_status.can_transition_to(target)).then_some(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_and_illegal_moves_are_classified() {
        assert_eq!(
            classify_instance_transition(TaskInstanceStatus::Running, TaskInstanceStatus::Done),
            TransitionOutcome::Applied
        );
        assert_eq!(
            classify_instance_transition(TaskInstanceStatus::Done, TaskInstanceStatus::Done),
            TransitionOutcome::Repeat
        );
        assert_eq!(
            classify_instance_transition(TaskInstanceStatus::Queued, TaskInstanceStatus::Running),
            TransitionOutcome::Illegal
        );
    }

    #[test]
    fn recoverable_error_respects_attempt_budget() {
        let followup = task_followup(TaskInstanceStatus::Error, TaskStatus::Running, 1, 3);
        assert_eq!(followup, Some(TaskStatus::AdjustingResources));

        let followup = task_followup(TaskInstanceStatus::Error, TaskStatus::Running, 3, 3);
        assert_eq!(followup, Some(TaskStatus::ErrorFatal));
    }

    #[test]
    fn fatal_instance_always_fails_the_task() {
        let followup = task_followup(TaskInstanceStatus::ErrorFatal, TaskStatus::Launched, 1, 3);
        assert_eq!(followup, Some(TaskStatus::ErrorFatal));
    }

    #[test]
    fn terminal_tasks_are_left_alone() {
        assert_eq!(
            task_followup(TaskInstanceStatus::Done, TaskStatus::Done, 1, 3),
            None
        );
        assert_eq!(
            task_followup(TaskInstanceStatus::Error, TaskStatus::ErrorFatal, 3, 3),
            None
        );
    }

    #[test]
    fn bookkeeping_states_do_not_touch_the_task() {
        assert_eq!(
            task_followup(TaskInstanceStatus::Triaging, TaskStatus::Running, 1, 3),
            None
        );
        assert_eq!(
            task_followup(TaskInstanceStatus::KillSelf, TaskStatus::Running, 1, 3),
            None
        );
    }
}
