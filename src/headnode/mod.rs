//! Coordinator role.
//!
//! The headnode keeps track of the clusnodes reporting to it, stores jobs
//! and runs them across the selected nodes.
//!
//! # Components
//!
//! - [`NodeLiveness`]: heartbeat bookkeeping and identity validation
//! - [`NodeGroups`]: named node sets used to scope dispatch
//! - [`JobStore`]: durable job list with crash recovery
//! - [`Dispatcher`]: fan-out, output relay and cancellation
//! - [`sweep`]: per-node integer substitution

pub mod dispatch;
pub mod groups;
pub mod job;
pub mod liveness;
pub mod store;
pub mod sweep;

pub use dispatch::Dispatcher;
pub use groups::NodeGroups;
pub use job::{Job, JobSpec, JobState};
pub use liveness::{NodeLiveness, NodeState};
pub use store::JobStore;
