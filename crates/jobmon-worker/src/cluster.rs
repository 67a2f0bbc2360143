//! Worker-side cluster plugin for local execution.

use std::path::Path;

use jobmon_core::cluster::ClusterWorkerNode;
use jobmon_core::constants::TaskInstanceStatus;

/// Exit code the batch scheduler uses for jobs killed over resource limits.
/// Matches the 128+SIGKILL convention used by cgroup OOM kills.
const OOM_EXIT_CODE: i32 = 137;

/// Worker-node plugin for locally spawned processes.
pub struct LocalWorkerNode;

impl ClusterWorkerNode for LocalWorkerNode {
    fn distributor_id(&self) -> Option<String> {
        std::env::var("JOBMON_DISTRIBUTOR_ID").ok()
    }

    fn initialize_logfile(&self, kind: &str, dir: &str, name: &str) -> String {
        Path::new(dir)
            .join(format!("{name}.{kind}"))
            .to_string_lossy()
            .into_owned()
    }

    fn get_exit_info(&self, returncode: i32, stderr_tail: &str) -> (TaskInstanceStatus, String) {
        match returncode {
            OOM_EXIT_CODE => (
                TaskInstanceStatus::ResourceError,
                format!("command was killed over its resource request: {stderr_tail}"),
            ),
            code if code > 128 || code < 0 => (
                TaskInstanceStatus::UnknownError,
                format!("command died with signal-derived exit code {code}: {stderr_tail}"),
            ),
            code => (
                TaskInstanceStatus::Error,
                format!("command exited with code {code}: {stderr_tail}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_classify_into_error_states() {
        let node = LocalWorkerNode;

        let (status, _) = node.get_exit_info(1, "boom");
        assert_eq!(status, TaskInstanceStatus::Error);

        let (status, message) = node.get_exit_info(137, "");
        assert_eq!(status, TaskInstanceStatus::ResourceError);
        assert!(message.contains("resource request"));

        let (status, _) = node.get_exit_info(139, "segfault");
        assert_eq!(status, TaskInstanceStatus::UnknownError);
    }

    #[test]
    fn logfiles_are_named_by_task_and_kind() {
        let node = LocalWorkerNode;
        let path = node.initialize_logfile("stdout", "/var/log/jobmon", "t1");
        assert_eq!(path, "/var/log/jobmon/t1.stdout");
    }
}
