//! The marking job queue.
//!
//! - [`store`]: job table access, including the locked claim and reclaim
//! - [`coordinator`]: per-node workers and the stale-claim reaper
//! - [`executor`]: the contract marking backends implement
//! - [`sandbox`]: a Docker-backed executor
//! - [`producer`]: job submission with cluster wake-up

pub mod coordinator;
pub mod executor;
pub mod job;
pub mod producer;
pub mod sandbox;
pub mod store;

pub use coordinator::{Coordinator, CoordinatorConfig, WakeHandler};
pub use executor::{ExecutorError, ExecutorRegistry, MarkOutcome, MarkingExecutor};
pub use job::{Job, JobStatus};
pub use producer::JobProducer;
pub use sandbox::SandboxExecutor;
pub use store::{Completion, JobStore};
