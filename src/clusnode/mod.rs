//! Worker role.
//!
//! A clusnode reports to one or more headnodes and runs the commands they
//! dispatch:
//! - [`JobExecutor`]: runs a command as a process group, streams its output
//!   and kills the group on cancel
//! - [`HeadnodeReporter`]: one heartbeat task per configured headnode

pub mod executor;
pub mod heartbeat;

pub use executor::{job_label, JobExecutor, Output};
pub use heartbeat::HeadnodeReporter;
