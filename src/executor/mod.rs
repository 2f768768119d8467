//! Task scheduling backends.
//!
//! An [`Executor`] takes the partitions of a run and returns a [`TaskStream`] that
//! yields task results as they complete, in no particular order. Each backend drives
//! an [`AttemptTable`] so that every partition is attempted at least once, transient
//! failures are retried up to the retry budget, and at most one result per partition
//! is ever yielded.
//!
//! - [`LocalExecutor`]: a bounded rayon worker pool on this process
//! - [`ClusterExecutor`]: independent tasks on a [`ClusterClient`]
//! - [`SimulatedCluster`]: an in-process [`ClusterClient`] with fault injection

pub mod attempts;
pub mod cluster;
pub mod local;
pub mod simulated;

pub use attempts::{AttemptTable, Completion, FailureAction, TaskState};
pub use cluster::{ClusterClient, ClusterEvent, ClusterExecutor, RemoteTask, TaskHandle};
pub use local::LocalExecutor;
pub use simulated::{ClusterStats, FaultPlan, SimulatedCluster};

use crate::error::Result;
use crate::index::PartitionDescriptor;
use crate::task::{RunContext, TaskResult};
use std::sync::Arc;

/// Completed tasks of one run, delivered as they finish.
///
/// The stream ends after the last partition's result, or right after the first error
/// it yields.
pub trait TaskStream: Iterator<Item = Result<TaskResult>> + Send {
    /// Stop scheduling. In-flight tasks get a best-effort cancel signal and whatever
    /// they still return is discarded.
    fn cancel(&mut self);

    /// Retries scheduled so far.
    fn retries(&self) -> u64;

    /// Duplicate results dropped so far.
    fn duplicates(&self) -> u64;
}

/// A task scheduling backend.
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Schedule every partition of `run`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start the run.
    fn submit(&self, run: Arc<RunContext>, partitions: Vec<PartitionDescriptor>) -> Result<Box<dyn TaskStream>>;
}
