//! # Jobmon distributor
//!
//! One distributor per workflow run. It owns every task instance between
//! QUEUED and RUNNING-or-terminal:
//!
//! - QUEUED instances are claimed in chunks and instantiated
//! - INSTANTIATED instances launch as array batches (falling back to
//!   per-instance submission when the cluster has no array support)
//! - LAUNCHED instances are heartbeated on the cluster's behalf
//! - TRIAGING instances are resolved through the cluster's exit info
//! - KILL_SELF instances are terminated and failed
//!
//! Cluster jobs belong to the distributor alone; workers never submit or
//! kill anything on the cluster.

pub mod batch;
pub mod cluster;
pub mod service;
pub mod signals;
pub mod task_instance;

pub use batch::TaskInstanceBatch;
pub use cluster::{FakeCluster, LocalProcessCluster};
pub use service::{DistributorService, DistributorError};
pub use task_instance::DistributorTaskInstance;
