//! Errors shared across the execution core.
//!
//! Component-specific failures (requester retries, cluster submission,
//! worker transitions, distributor interruption) live with their owners;
//! this is only what crosses crate boundaries.

/// Errors that cross component boundaries.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A resume target with no persisted metadata.
    #[error("no workflow found for workflow id {0}")]
    EmptyWorkflow(i64),

    /// A compute-resources callable returned something other than a JSON
    /// object.
    #[error("compute resources callable for task {task_id} returned {got} instead of an object")]
    InvalidComputeResources { task_id: i64, got: String },

    /// A resource scale could not be applied or reconstructed.
    #[error("invalid resource scale for '{resource}': {reason}")]
    ResourceScale { resource: String, reason: String },
}
