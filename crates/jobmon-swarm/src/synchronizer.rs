//! Periodic reconciliation with the state server.
//!
//! One synchronizer tick requests a triage sweep, pulls task-status changes
//! since the last sync (or everything, for a full sync), and refreshes the
//! workflow and array concurrency caps. The sub-requests run concurrently
//! and a failing one degrades to an empty partial update: the next tick
//! catches up.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::warn;

use crate::gateway::ServerGateway;
use crate::state::SwarmState;
use crate::update::StateUpdate;

pub struct Synchronizer {
    gateway: ServerGateway,
}

impl Synchronizer {
    pub fn new(gateway: ServerGateway) -> Self {
        Self { gateway }
    }

    /// Ask the server to sweep overdue instances into triage.
    async fn request_triage(&self) -> StateUpdate {
        if let Err(e) = self.gateway.set_status_for_triaging().await {
            warn!("triage sweep request failed: {e}");
        }
        StateUpdate::default()
    }

    /// Task statuses changed since `last_sync`; `None` forces a full sync.
    async fn task_updates(&self, last_sync: Option<DateTime<Utc>>) -> StateUpdate {
        match self.gateway.task_status_updates(last_sync).await {
            Ok(response) => {
                StateUpdate::from_task_status_response(response.tasks_by_status, response.time)
            }
            Err(e) => {
                warn!("task status sync failed: {e}");
                StateUpdate::default()
            }
        }
    }

    /// Current workflow-level concurrency cap.
    async fn workflow_concurrency(&self) -> StateUpdate {
        match self.gateway.max_concurrently_running().await {
            Ok(max) => StateUpdate {
                max_concurrently_running: Some(max),
                ..Default::default()
            },
            Err(e) => {
                warn!("workflow concurrency sync failed: {e}");
                StateUpdate::default()
            }
        }
    }

    /// Current per-array caps; a failing array degrades individually.
    async fn array_concurrency(&self, array_ids: Vec<i64>) -> StateUpdate {
        let limits = join_all(array_ids.iter().map(|array_id| async move {
            match self.gateway.array_max_concurrently_running(*array_id).await {
                Ok(limit) => Some((*array_id, limit)),
                Err(e) => {
                    warn!(array_id, "array concurrency sync failed: {e}");
                    None
                }
            }
        }))
        .await;

        StateUpdate {
            array_limits: limits.into_iter().flatten().collect(),
            ..Default::default()
        }
    }

    /// One full reconciliation pass.
    ///
    /// `full_sync` ignores `last_sync` and re-reads every task; it is the
    /// wedge-recovery path for statuses that changed without a fresh
    /// `status_date`.
    pub async fn tick(&self, state: &SwarmState, full_sync: bool) -> StateUpdate {
        let since = if full_sync {
            None
        } else {
            Some(state.last_sync)
        };
        let array_ids: Vec<i64> = state.arrays.keys().copied().collect();

        let (triage, tasks, workflow_limit, array_limits) = tokio::join!(
            self.request_triage(),
            self.task_updates(since),
            self.workflow_concurrency(),
            self.array_concurrency(array_ids),
        );

        triage.merge(tasks).merge(workflow_limit).merge(array_limits)
    }
}
