//! The task-instance runtime.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use jobmon_client::{Requester, RequesterError};
use jobmon_core::cluster::ClusterWorkerNode;
use jobmon_core::config::WorkerConfig;
use jobmon_core::constants::TaskInstanceStatus;
use jobmon_core::contracts::*;

/// How much of each stream is kept in memory for the final status report.
const TAIL_CHARS: usize = 10_000;

/// Block size for pipe reads; small so heartbeats interleave with chatty
/// commands.
const READ_BLOCK: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum WorkerNodeError {
    #[error(transparent)]
    Requester(#[from] RequesterError),

    /// The server holds a status that forbids continuing (e.g. KILL_SELF
    /// observed at a heartbeat).
    #[error("task instance {task_instance_id} is in status {actual}, expected {expected}")]
    Transition {
        task_instance_id: i64,
        expected: TaskInstanceStatus,
        actual: TaskInstanceStatus,
    },

    #[error("subprocess error: {0}")]
    Subprocess(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The FQDN this worker reports as its nodename.
fn fqdn() -> String {
    let mut buffer = [0u8; 256];
    let rc = unsafe { libc::gethostname(buffer.as_mut_ptr() as *mut libc::c_char, buffer.len()) };
    if rc == 0 {
        let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
        String::from_utf8_lossy(&buffer[..end]).into_owned()
    } else {
        "localhost".to_string()
    }
}

/// One task instance, executing on a worker node.
pub struct WorkerNodeTaskInstance {
    requester: Requester,
    cluster: Arc<dyn ClusterWorkerNode>,
    config: WorkerConfig,

    task_instance_id: i64,
    distributor_id: Option<String>,
    nodename: String,
    process_group_id: i64,

    // Set by log_running.
    wire: Option<WorkerTaskInstance>,
    stdout_path: Option<String>,
    stderr_path: Option<String>,

    // Set once the subprocess finishes.
    returncode: Option<i32>,
    stdout_tail: String,
    stderr_tail: String,

    last_heartbeat: Instant,
}

impl WorkerNodeTaskInstance {
    pub fn new(
        requester: Requester,
        cluster: Arc<dyn ClusterWorkerNode>,
        task_instance_id: i64,
        config: WorkerConfig,
    ) -> Self {
        let distributor_id = cluster.distributor_id();
        Self {
            requester,
            cluster,
            config,
            task_instance_id,
            distributor_id,
            nodename: fqdn(),
            process_group_id: std::process::id() as i64,
            wire: None,
            stdout_path: None,
            stderr_path: None,
            returncode: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            last_heartbeat: Instant::now(),
        }
    }

    pub fn task_instance_id(&self) -> i64 {
        self.task_instance_id
    }

    /// The command's exit code, once it has run.
    pub fn command_returncode(&self) -> Option<i32> {
        self.returncode
    }

    pub fn stdout_path(&self) -> Option<&str> {
        self.stdout_path.as_deref()
    }

    pub fn stderr_path(&self) -> Option<&str> {
        self.stderr_path.as_deref()
    }

    fn next_report_increment(&self) -> f64 {
        self.config.heartbeat.task_instance_report_increment()
    }

    fn wire(&self) -> &WorkerTaskInstance {
        self.wire
            .as_ref()
            .expect("log_running must succeed before the command runs")
    }

    /// Report RUNNING and receive the command to execute.
    pub async fn log_running(&mut self) -> Result<(), WorkerNodeError> {
        info!(task_instance_id = self.task_instance_id, "logging running");
        let response: LogRunningResponse = self
            .requester
            .post(
                &format!("/task_instance/{}/log_running", self.task_instance_id),
                &LogRunningRequest {
                    nodename: self.nodename.clone(),
                    process_group_id: self.process_group_id,
                    next_report_increment: self.next_report_increment(),
                    distributor_id: self.distributor_id.clone(),
                },
            )
            .await?;
        self.last_heartbeat = Instant::now();

        let wire = response.task_instance;
        self.stdout_path = Some(self.cluster.initialize_logfile(
            "stdout",
            &wire.stdout_dir,
            &wire.name,
        ));
        self.stderr_path = Some(self.cluster.initialize_logfile(
            "stderr",
            &wire.stderr_dir,
            &wire.name,
        ));
        let status = wire.status;
        self.wire = Some(wire);

        if status != TaskInstanceStatus::Running {
            return Err(WorkerNodeError::Transition {
                task_instance_id: self.task_instance_id,
                expected: TaskInstanceStatus::Running,
                actual: status,
            });
        }
        Ok(())
    }

    /// Heartbeat; errors if the server no longer holds RUNNING so the run
    /// loop can decide what to do (KILL_SELF leads to a graceful kill).
    pub async fn log_report_by(&mut self) -> Result<(), WorkerNodeError> {
        debug!(task_instance_id = self.task_instance_id, "logging heartbeat");
        let response: TaskInstanceStatusResponse = self
            .requester
            .post(
                &format!("/task_instance/{}/log_report_by", self.task_instance_id),
                &LogReportByRequest {
                    next_report_increment: self.next_report_increment(),
                    stdout: self.stdout_path.clone(),
                    stderr: self.stderr_path.clone(),
                    distributor_id: self.distributor_id.clone(),
                },
            )
            .await?;
        self.last_heartbeat = Instant::now();

        if response.status != TaskInstanceStatus::Running {
            return Err(WorkerNodeError::Transition {
                task_instance_id: self.task_instance_id,
                expected: TaskInstanceStatus::Running,
                actual: response.status,
            });
        }
        Ok(())
    }

    async fn log_done(&mut self) -> Result<TaskInstanceStatus, WorkerNodeError> {
        info!(task_instance_id = self.task_instance_id, "logging done");
        let response: TaskInstanceStatusResponse = self
            .requester
            .post(
                &format!("/task_instance/{}/log_done", self.task_instance_id),
                &LogDoneRequest {
                    distributor_id: self.distributor_id.clone(),
                    nodename: Some(self.nodename.clone()),
                    stdout: self.stdout_path.clone(),
                    stderr: self.stderr_path.clone(),
                    stdout_log: Some(self.stdout_tail.clone()),
                    stderr_log: Some(self.stderr_tail.clone()),
                },
            )
            .await?;
        if response.status != TaskInstanceStatus::Done {
            return Err(WorkerNodeError::Transition {
                task_instance_id: self.task_instance_id,
                expected: TaskInstanceStatus::Done,
                actual: response.status,
            });
        }
        Ok(response.status)
    }

    async fn log_error(
        &mut self,
        error_state: TaskInstanceStatus,
        description: String,
    ) -> Result<TaskInstanceStatus, WorkerNodeError> {
        info!(
            task_instance_id = self.task_instance_id,
            error_state = %error_state,
            "logging error"
        );
        let response: TaskInstanceStatusResponse = self
            .requester
            .post(
                &format!(
                    "/task_instance/{}/log_error_worker_node",
                    self.task_instance_id
                ),
                &LogErrorWorkerNodeRequest {
                    error_state,
                    error_description: description,
                    distributor_id: self.distributor_id.clone(),
                    nodename: Some(self.nodename.clone()),
                    stdout: self.stdout_path.clone(),
                    stderr: self.stderr_path.clone(),
                    stdout_log: Some(self.stdout_tail.clone()),
                    stderr_log: Some(self.stderr_tail.clone()),
                },
            )
            .await?;
        if response.status != error_state {
            return Err(WorkerNodeError::Transition {
                task_instance_id: self.task_instance_id,
                expected: error_state,
                actual: response.status,
            });
        }
        Ok(response.status)
    }

    /// Execute the task instance end to end; returns the terminal status
    /// that was reported.
    pub async fn run(&mut self) -> Result<TaskInstanceStatus, WorkerNodeError> {
        // A fast-booting worker can outrun the distributor's launch
        // bookkeeping; wait out instances that have not reached LAUNCHED.
        let mut attempt = 0;
        loop {
            match self.log_running().await {
                Ok(()) => break,
                Err(WorkerNodeError::Transition { actual, .. })
                    if matches!(
                        actual,
                        TaskInstanceStatus::Queued | TaskInstanceStatus::Instantiated
                    ) && attempt < 50 =>
                {
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e),
            }
        }

        match self.run_cmd().await {
            Ok(()) => {
                let returncode = self.returncode.unwrap_or(-1);
                if returncode == 0 {
                    info!(command = %self.wire().command, "command finished successfully");
                    self.log_done().await
                } else {
                    info!(
                        command = %self.wire().command,
                        returncode,
                        "command exited nonzero"
                    );
                    let (error_state, message) =
                        self.cluster.get_exit_info(returncode, &self.stderr_tail);
                    self.log_error(error_state, message).await
                }
            }
            // Some other agent moved us out of RUNNING mid-flight. A kill
            // flag is the expected path: the subprocess is already down,
            // report the fatal error. Anything else is real trouble.
            Err(WorkerNodeError::Transition { actual, .. })
                if actual == TaskInstanceStatus::KillSelf =>
            {
                let message = format!(
                    "command '{}' got a KILL_SELF event; process shut down with exit code {:?}",
                    self.wire().command,
                    self.returncode
                );
                error!("{message}");
                self.log_error(TaskInstanceStatus::ErrorFatal, message).await
            }
            Err(e) => Err(e),
        }
    }

    /// Spawn the command and shepherd it: two stream copies plus the
    /// heartbeating poller, all cooperative.
    async fn run_cmd(&mut self) -> Result<(), WorkerNodeError> {
        let wire = self.wire().clone();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&wire.command)
            .envs(wire.command_env())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WorkerNodeError::Subprocess(format!("failed to spawn command: {e}")))?;

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| WorkerNodeError::Subprocess("child stdout was not piped".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| WorkerNodeError::Subprocess("child stderr was not piped".into()))?;

        let stdout_file = tokio::fs::File::create(self.stdout_path.clone().unwrap_or_default())
            .await?;
        let stderr_file = tokio::fs::File::create(self.stderr_path.clone().unwrap_or_default())
            .await?;

        let stdout_task = tokio::spawn(communicate(stdout_pipe, stdout_file));
        let stderr_task = tokio::spawn(communicate(stderr_pipe, stderr_file));

        let poll_outcome = self.process_poller(&mut child).await;

        let poll_error = match poll_outcome {
            Ok(returncode) => {
                self.returncode = Some(returncode);
                None
            }
            Err(e) => {
                // Attempt a graceful shutdown, then a violent one.
                self.shutdown_subprocess(&mut child).await;
                self.returncode = child.try_wait().ok().flatten().map(exit_code);
                Some(e)
            }
        };

        // The pipes close with the child, so the copies finish on their own.
        self.stdout_tail = stdout_task
            .await
            .map_err(|e| WorkerNodeError::Subprocess(e.to_string()))??;
        self.stderr_tail = stderr_task
            .await
            .map_err(|e| WorkerNodeError::Subprocess(e.to_string()))??;

        match poll_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Await the subprocess, heartbeating every time the wait outlives the
    /// remaining heartbeat budget.
    async fn process_poller(&mut self, child: &mut Child) -> Result<i32, WorkerNodeError> {
        loop {
            let interval = self.config.heartbeat.task_instance_interval;
            let remaining = interval.saturating_sub(self.last_heartbeat.elapsed());

            match tokio::time::timeout(remaining, child.wait()).await {
                Ok(status) => {
                    let status = status
                        .map_err(|e| WorkerNodeError::Subprocess(e.to_string()))?;
                    return Ok(exit_code(status));
                }
                Err(_) => {
                    // Still running: prove liveness. A non-RUNNING response
                    // surfaces as a Transition error to the caller.
                    self.log_report_by().await?;
                }
            }
        }
    }

    /// SIGINT, bounded wait, then SIGKILL.
    async fn shutdown_subprocess(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
        }
        let graceful =
            tokio::time::timeout(self.config.command_interrupt_timeout, child.wait()).await;
        if graceful.is_err() {
            warn!("subprocess ignored SIGINT, killing it");
            child.kill().await.ok();
        }
    }
}

/// Exit code of a finished process; signal deaths map to 128+signal, the
/// shell convention batch schedulers expect.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// Read the pipe in small blocks, write through to the capture file, and
/// keep the last [`TAIL_CHARS`] characters in memory.
async fn communicate<R>(mut reader: R, mut file: tokio::fs::File) -> Result<String, WorkerNodeError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut tail = String::new();
    let mut buffer = [0u8; READ_BLOCK];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n]).await?;
        tail.push_str(&String::from_utf8_lossy(&buffer[..n]));
        if tail.len() > TAIL_CHARS {
            let mut cut = tail.len() - TAIL_CHARS;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }
    file.flush().await?;
    Ok(tail)
}
