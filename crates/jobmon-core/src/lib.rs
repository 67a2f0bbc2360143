//! # Jobmon Core
//!
//! Shared foundation for the jobmon execution core.
//!
//! The execution core is a tripartite runtime around a central state server:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Swarm                               │
//! │  (DAG readiness, concurrency caps, queue-batch requests)     │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       State server                           │
//! │  (task / task-instance state machines, report-by deadlines)  │
//! └──────────────────────────────────────────────────────────────┘
//!                  ▲                           ▲
//!                  │                           │
//! ┌────────────────┴─────────┐   ┌─────────────┴────────────────┐
//! │       Distributor        │   │           Worker             │
//! │ (batch submit, triage)   │   │ (subprocess + heartbeats)    │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! This crate holds everything those components agree on: the status
//! alphabets and their legal transitions, the wire contracts, the cluster
//! plugin interface, resource modeling, and configuration.

pub mod cluster;
pub mod config;
pub mod constants;
pub mod contracts;
pub mod error;
pub mod resources;

pub use cluster::{ClusterDistributor, ClusterError, ClusterWorkerNode};
pub use constants::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};
pub use error::CoreError;
pub use resources::{ResourceScaler, TaskResources};

/// Largest number of tasks queued or instantiated in a single server call.
pub const MAX_BATCH_SIZE: usize = 500;

/// Chunk size for paginated resume fetches (tasks and edges).
pub const RESUME_CHUNK_SIZE: usize = 500;
