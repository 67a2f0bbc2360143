//! Cluster plugin implementations shipped with the distributor.
//!
//! Real batch schedulers plug in through the same
//! [`jobmon_core::ClusterDistributor`] trait; these two cover local
//! execution and tests.

mod fake;
mod local;

pub use fake::{FakeCluster, Submission};
pub use local::LocalProcessCluster;
