//! # Jobmon swarm
//!
//! The DAG scheduler for one workflow run. The swarm holds the only
//! in-memory view of the workflow's tasks and drives them from readiness
//! through queueing, reacting to status changes the state server reports.
//!
//! The moving parts:
//!
//! - [`state::SwarmState`]: the task arena, status index and ready queue
//! - [`builder::SwarmBuilder`]: constructs state from an in-memory
//!   description (new runs) or from the database (resume)
//! - [`scheduler::Scheduler`]: capacity math and queue-batch requests
//! - [`synchronizer::Synchronizer`]: triage sweeps plus incremental status
//!   and concurrency-limit sync
//! - [`orchestrator::WorkflowRunOrchestrator`]: the run loop tying the
//!   above together, with wedge recovery and resume detection
//!
//! There is no handshake between the swarm and the distributor: the swarm
//! writes QUEUED and the distributor observes it at its next sweep. The
//! server is the meeting point.

pub mod array;
pub mod builder;
pub mod error;
pub mod gateway;
pub mod heartbeat;
pub mod orchestrator;
pub mod scheduler;
pub mod state;
pub mod synchronizer;
pub mod task;
pub mod update;

pub use array::SwarmArray;
pub use builder::{ArrayDescription, SwarmBuilder, TaskDescription, WorkflowDescription};
pub use error::SwarmError;
pub use gateway::ServerGateway;
pub use orchestrator::WorkflowRunOrchestrator;
pub use state::SwarmState;
pub use task::SwarmTask;
pub use update::StateUpdate;
