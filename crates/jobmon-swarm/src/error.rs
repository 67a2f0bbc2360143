//! Swarm error taxonomy.

use jobmon_client::RequesterError;
use jobmon_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    /// The server wire failed beyond the requester's retries; the
    /// scheduling tick aborts and the run remains resumable.
    #[error(transparent)]
    Requester(#[from] RequesterError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// `seconds_until_timeout` elapsed; no transition is forced and a
    /// future resume picks the run back up.
    #[error("workflow run {workflow_run_id} did not finish within {timeout_seconds} seconds")]
    Timeout {
        workflow_run_id: i64,
        timeout_seconds: f64,
    },

    /// Resume reconstruction hit malformed persisted metadata.
    #[error("cannot rebuild swarm state: {0}")]
    Rebuild(String),
}
