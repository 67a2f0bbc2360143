//! Workflow-run heartbeats.

use std::time::Instant;

use tracing::debug;

use jobmon_client::RequesterError;
use jobmon_core::config::HeartbeatConfig;
use jobmon_core::constants::WorkflowRunStatus;

use crate::gateway::ServerGateway;
use crate::update::StateUpdate;

/// Posts `log_heartbeat` at the configured cadence and surfaces the
/// authoritative run status, which is how resume signals reach the swarm.
pub struct HeartbeatService {
    gateway: ServerGateway,
    config: HeartbeatConfig,
    status: WorkflowRunStatus,
    last_heartbeat: Option<Instant>,
}

impl HeartbeatService {
    pub fn new(gateway: ServerGateway, config: HeartbeatConfig, status: WorkflowRunStatus) -> Self {
        Self {
            gateway,
            config,
            status,
            last_heartbeat: None,
        }
    }

    pub fn set_status(&mut self, status: WorkflowRunStatus) {
        self.status = status;
    }

    pub fn is_due(&self) -> bool {
        match self.last_heartbeat {
            None => true,
            Some(at) => at.elapsed() >= self.config.workflow_run_interval,
        }
    }

    /// Heartbeat unconditionally.
    pub async fn beat(&mut self) -> Result<StateUpdate, RequesterError> {
        let status = self
            .gateway
            .log_heartbeat(self.status, self.config.workflow_run_report_increment())
            .await?;
        self.last_heartbeat = Some(Instant::now());
        let mut update = StateUpdate::default();
        if status != self.status {
            debug!(%status, "server reports a different workflow run status");
            self.status = status;
            update.workflow_run_status = Some(status);
        }
        Ok(update)
    }

    /// Heartbeat only if the interval has elapsed.
    pub async fn tick(&mut self) -> Result<StateUpdate, RequesterError> {
        if self.is_due() {
            self.beat().await
        } else {
            Ok(StateUpdate::default())
        }
    }
}
