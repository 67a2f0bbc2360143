//! Persistence for the state server.
//!
//! The [`StateStore`] trait owns the coupled Task / TaskInstance update
//! semantics; backends differ only in how they make each operation atomic.

mod fsm;
mod memory;
mod postgres;
mod store;

pub use fsm::{classify_instance_transition, task_followup, TransitionOutcome};
pub use memory::MemoryStateStore;
pub use postgres::PostgresStateStore;
pub use store::{
    ArrayRow, DagRow, EdgeRow, RunningReport, StateStore, StoreError, TaskInstanceRow,
    TaskResourcesRow, TaskRow, WorkerReport, WorkflowRow, WorkflowRunRow,
};
