//! # Jobmon worker node
//!
//! The runtime wrapped around one task instance on the cluster. It reports
//! itself RUNNING, spawns the user command as a subprocess with piped
//! stdout/stderr, keeps the last 10k characters of each stream in memory
//! while writing through to the capture files, heartbeats whenever the
//! subprocess outlives the heartbeat interval, and reports the terminal
//! status, including noticing a KILL_SELF flag at a heartbeat and tearing
//! the subprocess down.

pub mod cluster;
pub mod worker_node;

pub use cluster::LocalWorkerNode;
pub use worker_node::{WorkerNodeError, WorkerNodeTaskInstance};
