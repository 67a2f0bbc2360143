//! Status alphabets and legal-transition tables.
//!
//! The one-letter codes are persisted in the database and travel on the wire.
//! They are stable identifiers: renaming a variant is fine, changing a code is
//! a breaking schema change.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Status of a logical unit of work.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub enum TaskStatus {
    /// Bound to the workflow, waiting on upstreams.
    #[serde(rename = "G")]
    Registering,

    /// A recoverable error consumed an attempt; resources are being rescaled.
    #[serde(rename = "A")]
    AdjustingResources,

    /// Accepted by the swarm, waiting for the distributor.
    #[serde(rename = "Q")]
    Queued,

    /// Distributor claimed the current task instance.
    #[serde(rename = "I")]
    Instantiating,

    /// Submitted to the cluster.
    #[serde(rename = "O")]
    Launched,

    /// The worker reported in.
    #[serde(rename = "R")]
    Running,

    /// At least one task instance finished successfully.
    #[serde(rename = "D")]
    Done,

    /// Out of attempts, or killed without retry.
    #[serde(rename = "F")]
    ErrorFatal,
}

impl TaskStatus {
    /// One-letter wire code.
    pub fn code(self) -> char {
        match self {
            Self::Registering => 'G',
            Self::AdjustingResources => 'A',
            Self::Queued => 'Q',
            Self::Instantiating => 'I',
            Self::Launched => 'O',
            Self::Running => 'R',
            Self::Done => 'D',
            Self::ErrorFatal => 'F',
        }
    }

    /// Human-readable name, matching the database label table.
    pub fn label(self) -> &'static str {
        match self {
            Self::Registering => "REGISTERING",
            Self::AdjustingResources => "ADJUSTING_RESOURCES",
            Self::Queued => "QUEUED",
            Self::Instantiating => "INSTANTIATING",
            Self::Launched => "LAUNCHED",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::ErrorFatal => "ERROR_FATAL",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::ErrorFatal)
    }

    /// Counts against workflow and array concurrency caps.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Queued
                | Self::Instantiating
                | Self::Launched
                | Self::Running
                | Self::AdjustingResources
        )
    }

    /// Legal successor states.
    pub fn valid_next(self) -> &'static [TaskStatus] {
        match self {
            Self::Registering => &[Self::Queued, Self::ErrorFatal],
            Self::AdjustingResources => &[Self::Queued, Self::ErrorFatal],
            // An instance can die before launch (kill flag, submission
            // failure), so queued and instantiating tasks keep a retry arc.
            Self::Queued => &[Self::Instantiating, Self::AdjustingResources, Self::ErrorFatal],
            Self::Instantiating => &[Self::Launched, Self::AdjustingResources, Self::ErrorFatal],
            Self::Launched => &[
                Self::Running,
                Self::Done,
                Self::AdjustingResources,
                Self::ErrorFatal,
            ],
            Self::Running => &[Self::Done, Self::AdjustingResources, Self::ErrorFatal],
            Self::Done => &[],
            Self::ErrorFatal => &[],
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        self.valid_next().contains(&next)
    }

    pub fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "G" => Self::Registering,
            "A" => Self::AdjustingResources,
            "Q" => Self::Queued,
            "I" => Self::Instantiating,
            "O" => Self::Launched,
            "R" => Self::Running,
            "D" => Self::Done,
            "F" => Self::ErrorFatal,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown task status code: {s}"))
    }
}

/// Status of one on-cluster attempt at a task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub enum TaskInstanceStatus {
    /// Inserted by the swarm alongside the task's QUEUED transition.
    #[serde(rename = "Q")]
    Queued,

    /// Claimed by the distributor.
    #[serde(rename = "I")]
    Instantiated,

    /// Submitted to the cluster; cluster job id recorded.
    #[serde(rename = "O")]
    Launched,

    /// The worker reported in and is heartbeating.
    #[serde(rename = "R")]
    Running,

    /// Report-by deadline elapsed; distributor is deciding the outcome.
    #[serde(rename = "T")]
    Triaging,

    #[serde(rename = "D")]
    Done,

    /// Recoverable error; consumes an attempt.
    #[serde(rename = "E")]
    Error,

    /// Cluster reported death without a recognizable cause.
    #[serde(rename = "U")]
    UnknownError,

    /// Killed by the cluster for exceeding its resource request.
    #[serde(rename = "Z")]
    ResourceError,

    /// Submission never produced a cluster job id.
    #[serde(rename = "W")]
    NoDistributorId,

    /// Flagged for termination; the worker or distributor must act on it.
    #[serde(rename = "K")]
    KillSelf,

    #[serde(rename = "F")]
    ErrorFatal,

    /// Launched but never heartbeated and nothing to probe.
    #[serde(rename = "H")]
    NoHeartbeat,
}

impl TaskInstanceStatus {
    pub fn code(self) -> char {
        match self {
            Self::Queued => 'Q',
            Self::Instantiated => 'I',
            Self::Launched => 'O',
            Self::Running => 'R',
            Self::Triaging => 'T',
            Self::Done => 'D',
            Self::Error => 'E',
            Self::UnknownError => 'U',
            Self::ResourceError => 'Z',
            Self::NoDistributorId => 'W',
            Self::KillSelf => 'K',
            Self::ErrorFatal => 'F',
            Self::NoHeartbeat => 'H',
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Instantiated => "INSTANTIATED",
            Self::Launched => "LAUNCHED",
            Self::Running => "RUNNING",
            Self::Triaging => "TRIAGING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::ResourceError => "RESOURCE_ERROR",
            Self::NoDistributorId => "NO_DISTRIBUTOR_ID",
            Self::KillSelf => "KILL_SELF",
            Self::ErrorFatal => "ERROR_FATAL",
            Self::NoHeartbeat => "NO_HEARTBEAT",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done
                | Self::Error
                | Self::UnknownError
                | Self::ResourceError
                | Self::NoDistributorId
                | Self::ErrorFatal
                | Self::NoHeartbeat
        )
    }

    /// Terminal error states that consume one of the task's attempts.
    pub fn is_error(self) -> bool {
        self.is_terminal() && self != Self::Done
    }

    /// Legal successor states.
    pub fn valid_next(self) -> &'static [TaskInstanceStatus] {
        match self {
            Self::Queued => &[Self::Instantiated, Self::KillSelf],
            Self::Instantiated => &[Self::Launched, Self::NoDistributorId, Self::KillSelf],
            Self::Launched => &[
                Self::Running,
                Self::Triaging,
                Self::KillSelf,
                Self::NoHeartbeat,
            ],
            Self::Running => &[
                Self::Done,
                Self::Error,
                Self::ErrorFatal,
                Self::ResourceError,
                Self::UnknownError,
                Self::Triaging,
                Self::KillSelf,
            ],
            Self::Triaging => &[
                Self::Running,
                Self::Error,
                Self::ResourceError,
                Self::UnknownError,
            ],
            Self::KillSelf => &[Self::ErrorFatal, Self::Error],
            _ => &[],
        }
    }

    pub fn can_transition_to(self, next: TaskInstanceStatus) -> bool {
        self.valid_next().contains(&next)
    }

    pub fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "Q" => Self::Queued,
            "I" => Self::Instantiated,
            "O" => Self::Launched,
            "R" => Self::Running,
            "T" => Self::Triaging,
            "D" => Self::Done,
            "E" => Self::Error,
            "U" => Self::UnknownError,
            "Z" => Self::ResourceError,
            "W" => Self::NoDistributorId,
            "K" => Self::KillSelf,
            "F" => Self::ErrorFatal,
            "H" => Self::NoHeartbeat,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TaskInstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::str::FromStr for TaskInstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown task instance status code: {s}"))
    }
}

/// Status of one attempt to execute a workflow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub enum WorkflowRunStatus {
    #[serde(rename = "G")]
    Registered,

    /// Claiming the workflow from a previous run.
    #[serde(rename = "L")]
    Linking,

    /// Swarm state fully constructed.
    #[serde(rename = "B")]
    Bound,

    /// Distributor attached.
    #[serde(rename = "I")]
    Instantiated,

    /// Cluster interface started.
    #[serde(rename = "O")]
    Launched,

    #[serde(rename = "R")]
    Running,

    /// Resume requested; running work must be reset.
    #[serde(rename = "C")]
    ColdResume,

    /// Resume requested; running work may keep going.
    #[serde(rename = "H")]
    HotResume,

    /// Reaped after a resume signal.
    #[serde(rename = "T")]
    Terminated,

    #[serde(rename = "D")]
    Done,

    #[serde(rename = "E")]
    Error,
}

impl WorkflowRunStatus {
    pub fn code(self) -> char {
        match self {
            Self::Registered => 'G',
            Self::Linking => 'L',
            Self::Bound => 'B',
            Self::Instantiated => 'I',
            Self::Launched => 'O',
            Self::Running => 'R',
            Self::ColdResume => 'C',
            Self::HotResume => 'H',
            Self::Terminated => 'T',
            Self::Done => 'D',
            Self::Error => 'E',
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Registered => "REGISTERED",
            Self::Linking => "LINKING",
            Self::Bound => "BOUND",
            Self::Instantiated => "INSTANTIATED",
            Self::Launched => "LAUNCHED",
            Self::Running => "RUNNING",
            Self::ColdResume => "COLD_RESUME",
            Self::HotResume => "HOT_RESUME",
            Self::Terminated => "TERMINATED",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Done | Self::Error)
    }

    /// A run in one of these states holds the workflow.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Registered
                | Self::Linking
                | Self::Bound
                | Self::Instantiated
                | Self::Launched
                | Self::Running
        )
    }

    /// Resume has been requested and acknowledged.
    pub fn is_resume(self) -> bool {
        matches!(self, Self::ColdResume | Self::HotResume)
    }

    pub fn valid_next(self) -> &'static [WorkflowRunStatus] {
        match self {
            Self::Registered => &[
                Self::Linking,
                Self::Bound,
                Self::ColdResume,
                Self::HotResume,
                Self::Error,
            ],
            Self::Linking => &[Self::Bound, Self::ColdResume, Self::HotResume, Self::Error],
            Self::Bound => &[
                Self::Instantiated,
                Self::ColdResume,
                Self::HotResume,
                Self::Error,
            ],
            Self::Instantiated => &[
                Self::Launched,
                Self::ColdResume,
                Self::HotResume,
                Self::Error,
            ],
            Self::Launched => &[
                Self::Running,
                Self::ColdResume,
                Self::HotResume,
                Self::Error,
            ],
            Self::Running => &[Self::Done, Self::Error, Self::ColdResume, Self::HotResume],
            Self::ColdResume => &[Self::Terminated, Self::Error],
            Self::HotResume => &[Self::Terminated, Self::Error],
            Self::Terminated => &[],
            Self::Done => &[],
            Self::Error => &[],
        }
    }

    pub fn can_transition_to(self, next: WorkflowRunStatus) -> bool {
        self.valid_next().contains(&next)
    }

    pub fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "G" => Self::Registered,
            "L" => Self::Linking,
            "B" => Self::Bound,
            "I" => Self::Instantiated,
            "O" => Self::Launched,
            "R" => Self::Running,
            "C" => Self::ColdResume,
            "H" => Self::HotResume,
            "T" => Self::Terminated,
            "D" => Self::Done,
            "E" => Self::Error,
            _ => return None,
        })
    }
}

impl std::fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::str::FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown workflow run status code: {s}"))
    }
}

/// Status of a workflow (the DAG instance itself, across runs).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub enum WorkflowStatus {
    #[serde(rename = "G")]
    Registering,

    /// Binding died before the first run launched.
    #[serde(rename = "A")]
    Aborted,

    #[serde(rename = "Q")]
    Queued,

    #[serde(rename = "I")]
    Instantiating,

    #[serde(rename = "O")]
    Launched,

    #[serde(rename = "R")]
    Running,

    #[serde(rename = "D")]
    Done,

    /// The active run was resumed away.
    #[serde(rename = "H")]
    Halted,

    #[serde(rename = "F")]
    Failed,
}

impl WorkflowStatus {
    pub fn code(self) -> char {
        match self {
            Self::Registering => 'G',
            Self::Aborted => 'A',
            Self::Queued => 'Q',
            Self::Instantiating => 'I',
            Self::Launched => 'O',
            Self::Running => 'R',
            Self::Done => 'D',
            Self::Halted => 'H',
            Self::Failed => 'F',
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Registering => "REGISTERING",
            Self::Aborted => "ABORTED",
            Self::Queued => "QUEUED",
            Self::Instantiating => "INSTANTIATING",
            Self::Launched => "LAUNCHED",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Halted => "HALTED",
            Self::Failed => "FAILED",
        }
    }

    /// States a fresh run may be started from (after a resume signal where
    /// one is required).
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Queued | Self::Halted | Self::Failed | Self::Done)
    }

    pub fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "G" => Self::Registering,
            "A" => Self::Aborted,
            "Q" => Self::Queued,
            "I" => Self::Instantiating,
            "O" => Self::Launched,
            "R" => Self::Running,
            "D" => Self::Done,
            "H" => Self::Halted,
            "F" => Self::Failed,
            _ => return None,
        })
    }

    /// The workflow status mirrored from its active run's status.
    pub fn from_run_status(run_status: WorkflowRunStatus) -> Option<Self> {
        match run_status {
            WorkflowRunStatus::Bound => Some(Self::Queued),
            WorkflowRunStatus::Instantiated => Some(Self::Instantiating),
            WorkflowRunStatus::Launched => Some(Self::Launched),
            WorkflowRunStatus::Running => Some(Self::Running),
            WorkflowRunStatus::Done => Some(Self::Done),
            WorkflowRunStatus::Error => Some(Self::Failed),
            WorkflowRunStatus::Terminated => Some(Self::Halted),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown workflow status code: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_codes_round_trip() {
        for status in [
            TaskStatus::Registering,
            TaskStatus::AdjustingResources,
            TaskStatus::Queued,
            TaskStatus::Instantiating,
            TaskStatus::Launched,
            TaskStatus::Running,
            TaskStatus::Done,
            TaskStatus::ErrorFatal,
        ] {
            let code = status.code().to_string();
            assert_eq!(TaskStatus::parse(&code), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{code}\""));
            assert_eq!(serde_json::from_str::<TaskStatus>(&json).unwrap(), status);
        }
    }

    #[test]
    fn task_instance_codes_round_trip() {
        for code in ["Q", "I", "O", "R", "T", "D", "E", "U", "Z", "W", "K", "F", "H"] {
            let status = TaskInstanceStatus::parse(code).unwrap();
            assert_eq!(status.code().to_string(), code);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(serde_json::from_str::<TaskInstanceStatus>(&json).unwrap(), status);
        }
    }

    #[test]
    fn task_transitions_follow_the_table() {
        assert!(TaskStatus::Registering.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::AdjustingResources.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Instantiating));
        assert!(TaskStatus::Launched.can_transition_to(TaskStatus::Done));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::AdjustingResources));

        assert!(!TaskStatus::Registering.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::ErrorFatal.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn task_instance_transitions_follow_the_table() {
        use TaskInstanceStatus::*;

        assert!(Queued.can_transition_to(Instantiated));
        assert!(Queued.can_transition_to(KillSelf));
        assert!(Instantiated.can_transition_to(NoDistributorId));
        assert!(Launched.can_transition_to(Triaging));
        assert!(Launched.can_transition_to(NoHeartbeat));
        assert!(Running.can_transition_to(Done));
        assert!(Triaging.can_transition_to(Running));
        assert!(KillSelf.can_transition_to(ErrorFatal));

        assert!(!Queued.can_transition_to(Launched));
        assert!(!Running.can_transition_to(Instantiated));
        assert!(!Done.can_transition_to(Running));
        for terminal in [Done, Error, UnknownError, ResourceError, NoDistributorId, ErrorFatal, NoHeartbeat] {
            assert!(terminal.is_terminal());
            assert!(terminal.valid_next().is_empty());
        }
    }

    #[test]
    fn error_states_consume_attempts() {
        assert!(TaskInstanceStatus::Error.is_error());
        assert!(TaskInstanceStatus::ResourceError.is_error());
        assert!(TaskInstanceStatus::NoHeartbeat.is_error());
        assert!(!TaskInstanceStatus::Done.is_error());
        assert!(!TaskInstanceStatus::Triaging.is_error());
    }

    #[test]
    fn workflow_run_resume_paths() {
        use WorkflowRunStatus::*;

        for active in [Registered, Linking, Bound, Instantiated, Launched, Running] {
            assert!(active.is_active());
            assert!(active.can_transition_to(ColdResume));
            assert!(active.can_transition_to(HotResume));
        }
        assert!(ColdResume.can_transition_to(Terminated));
        assert!(HotResume.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Done.can_transition_to(Error));
    }

    #[test]
    fn workflow_status_mirrors_run_status() {
        assert_eq!(
            WorkflowStatus::from_run_status(WorkflowRunStatus::Running),
            Some(WorkflowStatus::Running)
        );
        assert_eq!(
            WorkflowStatus::from_run_status(WorkflowRunStatus::Error),
            Some(WorkflowStatus::Failed)
        );
        assert_eq!(WorkflowStatus::from_run_status(WorkflowRunStatus::Linking), None);
    }
}
