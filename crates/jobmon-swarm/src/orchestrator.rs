//! The workflow-run loop.

use std::time::Instant;

use tracing::{info, warn};

use jobmon_core::config::SwarmConfig;
use jobmon_core::constants::WorkflowRunStatus;

use crate::error::SwarmError;
use crate::gateway::ServerGateway;
use crate::heartbeat::HeartbeatService;
use crate::scheduler::Scheduler;
use crate::state::SwarmState;
use crate::synchronizer::Synchronizer;

/// Drives a built [`SwarmState`] to completion.
///
/// Each pass schedules what fits, applies server updates, and periodically
/// reconciles. The loop ends when every task is final, when a resume signal
/// arrives, or when the caller's timeout elapses (in which case nothing is
/// transitioned and a future resume picks the run back up).
pub struct WorkflowRunOrchestrator {
    state: SwarmState,
    gateway: ServerGateway,
    scheduler: Scheduler,
    synchronizer: Synchronizer,
    heartbeat: HeartbeatService,
    config: SwarmConfig,
}

impl WorkflowRunOrchestrator {
    pub fn new(state: SwarmState, gateway: ServerGateway, config: SwarmConfig) -> Self {
        let scheduler = Scheduler::new(gateway.clone());
        let synchronizer = Synchronizer::new(gateway.clone());
        let heartbeat = HeartbeatService::new(gateway.clone(), config.heartbeat.clone(), state.status);
        Self {
            state,
            gateway,
            scheduler,
            synchronizer,
            heartbeat,
            config,
        }
    }

    pub fn state(&self) -> &SwarmState {
        &self.state
    }

    /// Run until the workflow settles. Returns the terminal run status.
    pub async fn run(
        &mut self,
        seconds_until_timeout: Option<f64>,
    ) -> Result<WorkflowRunStatus, SwarmError> {
        let started = Instant::now();
        self.state.set_initial_fringe()?;

        // No progress for longer than the wedge interval forces a full
        // sync, recovering from status changes with stale status_dates.
        let mut last_progress = Instant::now();
        let mut fail_fast_tripped = false;

        loop {
            // 1. Schedule everything that fits.
            if self.scheduler.has_work(&self.state) && !fail_fast_tripped {
                let update = self.scheduler.tick(&mut self.state, None).await?;
                if self.state.apply_update(update) > 0 {
                    last_progress = Instant::now();
                }
            }

            // 2. Reconcile with the server at the heartbeat cadence.
            if self.heartbeat.is_due() {
                let wedged = self.config.wedged_workflow_sync_interval >= 0.0
                    && last_progress.elapsed().as_secs_f64()
                        > self.config.wedged_workflow_sync_interval
                    || self.config.wedged_workflow_sync_interval < 0.0;
                if wedged {
                    warn!("no progress observed, forcing a full status sync");
                }
                let sync_update = self.synchronizer.tick(&self.state, wedged).await;
                let heartbeat_update = self.heartbeat.beat().await.unwrap_or_default();
                let changed = self
                    .state
                    .apply_update(sync_update.merge(heartbeat_update));
                if changed > 0 {
                    last_progress = Instant::now();
                }
                self.heartbeat.set_status(self.state.status);
            }

            // 3. Once the distributor has launched, the run is RUNNING.
            if self.state.status == WorkflowRunStatus::Launched {
                let status = self.gateway.update_status(WorkflowRunStatus::Running).await?;
                self.state.status = status;
                self.heartbeat.set_status(status);
            }

            // 4. Resume request: terminate our in-flight work and stand
            // down; the resuming client rebuilds from the database.
            if self.state.status.is_resume() {
                info!(status = %self.state.status, "resume signaled, terminating run");
                self.gateway.terminate_task_instances().await?;
                return Ok(self.state.status);
            }

            // 5. Fail-fast: stop scheduling new work, let in-flight finish.
            if self.config.fail_fast && self.state.failed_count() > 0 {
                if !fail_fast_tripped {
                    warn!("fail-fast tripped, no further tasks will be scheduled");
                }
                fail_fast_tripped = true;
                self.state.ready_to_run.clear();
            }

            // 6. Termination. Under fail-fast, tasks that were never
            // scheduled no longer count: the run settles once nothing is
            // in flight.
            let settled = self.state.all_tasks_final()
                || (fail_fast_tripped && self.state.active_task_count() == 0);
            if settled {
                let terminal = if self.state.failed_count() == 0 {
                    WorkflowRunStatus::Done
                } else {
                    WorkflowRunStatus::Error
                };
                info!(
                    done = self.state.done_count(),
                    failed = self.state.failed_count(),
                    status = %terminal,
                    "workflow run settled"
                );
                let status = self.gateway.update_status(terminal).await?;
                self.state.status = status;
                return Ok(status);
            }

            // 7. Caller timeout: surface without forcing any transition.
            if let Some(timeout) = seconds_until_timeout {
                if started.elapsed().as_secs_f64() > timeout {
                    return Err(SwarmError::Timeout {
                        workflow_run_id: self.state.workflow_run_id,
                        timeout_seconds: timeout,
                    });
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
