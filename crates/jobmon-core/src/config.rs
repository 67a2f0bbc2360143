//! Runtime configuration.
//!
//! Every component reads the same `JOBMON_*` environment variables (a
//! `.env` file is honored via dotenvy in the binaries). Tests construct the
//! config structs directly.

use std::time::Duration;

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Where the state server lives.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub url: String,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("JOBMON_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8070".to_string()),
        }
    }
}

/// Heartbeat cadence shared by the swarm, distributor and worker.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often a workflow run proves liveness.
    pub workflow_run_interval: Duration,

    /// How often a task instance proves liveness.
    pub task_instance_interval: Duration,

    /// Multiplier applied to the interval when computing `report_by_date`,
    /// so one missed heartbeat does not trip triage.
    pub report_by_buffer: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            workflow_run_interval: Duration::from_secs(30),
            task_instance_interval: Duration::from_secs(90),
            report_by_buffer: 1.5,
        }
    }
}

impl HeartbeatConfig {
    pub fn from_env() -> Self {
        Self {
            workflow_run_interval: Duration::from_secs(env_u64(
                "JOBMON_HEARTBEAT_WORKFLOW_RUN_INTERVAL",
                30,
            )),
            task_instance_interval: Duration::from_secs(env_u64(
                "JOBMON_HEARTBEAT_TASK_INSTANCE_INTERVAL",
                90,
            )),
            report_by_buffer: env_f64("JOBMON_HEARTBEAT_REPORT_BY_BUFFER", 1.5),
        }
    }

    /// Seconds granted on each successful heartbeat.
    pub fn task_instance_report_increment(&self) -> f64 {
        self.task_instance_interval.as_secs_f64() * self.report_by_buffer
    }

    pub fn workflow_run_report_increment(&self) -> f64 {
        self.workflow_run_interval.as_secs_f64() * self.report_by_buffer
    }
}

/// Distributor-specific knobs.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub heartbeat: HeartbeatConfig,

    /// Sleep between work sweeps when there is nothing to do.
    pub poll_interval: Duration,

    /// Abort a status sweep on the first command error instead of logging
    /// and continuing. Used by tests.
    pub raise_on_error: bool,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            poll_interval: Duration::from_secs(10),
            raise_on_error: false,
        }
    }
}

impl DistributorConfig {
    pub fn from_env() -> Self {
        Self {
            heartbeat: HeartbeatConfig::from_env(),
            poll_interval: Duration::from_secs(env_u64("JOBMON_DISTRIBUTOR_POLL_INTERVAL", 10)),
            raise_on_error: false,
        }
    }
}

/// Worker-node knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub heartbeat: HeartbeatConfig,

    /// How long to wait after SIGINT before killing the subprocess outright.
    pub command_interrupt_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            command_interrupt_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            heartbeat: HeartbeatConfig::from_env(),
            command_interrupt_timeout: Duration::from_secs(env_u64(
                "JOBMON_WORKER_COMMAND_INTERRUPT_TIMEOUT",
                10,
            )),
        }
    }
}

/// Swarm-specific knobs.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub heartbeat: HeartbeatConfig,

    /// Sleep between scheduling passes when nothing is ready.
    pub poll_interval: Duration,

    /// Full-sync fallback when no status change has been observed for this
    /// long. Negative disables the grace period (next sync is full), which
    /// tests use to exercise wedge recovery.
    pub wedged_workflow_sync_interval: f64,

    /// Stop scheduling new work as soon as any task is fatally failed.
    pub fail_fast: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            poll_interval: Duration::from_millis(500),
            wedged_workflow_sync_interval: 600.0,
            fail_fast: false,
        }
    }
}

impl SwarmConfig {
    pub fn from_env() -> Self {
        Self {
            heartbeat: HeartbeatConfig::from_env(),
            poll_interval: Duration::from_millis(env_u64("JOBMON_SWARM_POLL_INTERVAL_MS", 500)),
            wedged_workflow_sync_interval: env_f64("JOBMON_WEDGED_WORKFLOW_SYNC_INTERVAL", 600.0),
            fail_fast: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_increment_applies_buffer() {
        let config = HeartbeatConfig {
            workflow_run_interval: Duration::from_secs(30),
            task_instance_interval: Duration::from_secs(90),
            report_by_buffer: 1.5,
        };
        assert_eq!(config.task_instance_report_increment(), 135.0);
        assert_eq!(config.workflow_run_report_increment(), 45.0);
    }
}
