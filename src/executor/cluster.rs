//! Distributed backend.
//!
//! Partitions run as independent tasks on a cluster reached through a
//! [`ClusterClient`]. The only thing a task sends back is its serialized
//! [`TaskResult`]. Worker loss is reported as an event and handled by the
//! [`AttemptTable`]: the partition is resubmitted until the retry budget is spent,
//! after which the run fails with [`EngineError::WorkerExhausted`].
//!
//! Scheduling is pull-driven: at most `max_in_flight` tasks are outstanding and a new
//! one is submitted whenever an event frees a slot.

use super::attempts::{AttemptTable, Completion, FailureAction};
use super::{Executor, TaskStream};
use crate::error::{EngineError, Result};
use crate::ids::PartitionId;
use crate::index::PartitionDescriptor;
use crate::task::{RunContext, TaskResult};
use crossbeam::channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handle of one submitted task (the cluster's "future").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

impl Display for TaskHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "task-{}", self.0)
    }
}

/// One unit of work shipped to the cluster.
#[derive(Clone)]
pub struct RemoteTask {
    pub run: Arc<RunContext>,
    pub partition: PartitionDescriptor,
    pub attempt: u32,
}

/// Notifications a cluster sends back for submitted tasks.
#[derive(Debug)]
pub enum ClusterEvent {
    /// The task finished; `payload` is the postcard-encoded [`TaskResult`].
    Finished {
        handle: TaskHandle,
        partition: PartitionId,
        attempt: u32,
        payload: Vec<u8>,
    },
    /// The task ran and failed.
    Failed {
        handle: TaskHandle,
        partition: PartitionId,
        attempt: u32,
        error: EngineError,
    },
    /// The worker running the task went away.
    WorkerLost {
        handle: TaskHandle,
        partition: PartitionId,
        attempt: u32,
        worker: usize,
    },
}

/// Client side of a cluster scheduler.
pub trait ClusterClient: Send + Sync {
    /// Number of workers currently attached.
    fn workers(&self) -> usize;

    /// Submit `task`; every event about it is sent on `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler rejects the task.
    fn submit_task(&self, task: RemoteTask, events: Sender<ClusterEvent>) -> Result<TaskHandle>;

    /// Ask the cluster to stop `handle`. Best effort: the task may still finish and
    /// report.
    fn cancel(&self, handle: TaskHandle);
}

/// Runs each partition as an independent cluster task.
pub struct ClusterExecutor {
    client: Arc<dyn ClusterClient>,
    retry_limit: u32,
    max_in_flight: Option<usize>,
}

impl ClusterExecutor {
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>, retry_limit: u32) -> Self {
        Self {
            client,
            retry_limit,
            max_in_flight: None,
        }
    }

    /// Cap on outstanding tasks (default `2 * workers`).
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight.max(1));
        self
    }
}

impl Executor for ClusterExecutor {
    fn name(&self) -> &str {
        "distributed"
    }

    fn submit(&self, run: Arc<RunContext>, partitions: Vec<PartitionDescriptor>) -> Result<Box<dyn TaskStream>> {
        let max_in_flight = self
            .max_in_flight
            .unwrap_or_else(|| 2 * self.client.workers().max(1));
        let (events_tx, events_rx) = unbounded();
        info!(
            run = %run.run_id,
            partitions = partitions.len(),
            workers = self.client.workers(),
            max_in_flight,
            "submitting run to cluster"
        );
        let mut stream = ClusterStream {
            client: Arc::clone(&self.client),
            run,
            table: AttemptTable::new(partitions.len(), self.retry_limit),
            partitions,
            handles: HashMap::new(),
            events_tx,
            events_rx,
            max_in_flight,
            finished: false,
        };
        stream.fill()?;
        Ok(Box::new(stream))
    }
}

struct ClusterStream {
    client: Arc<dyn ClusterClient>,
    run: Arc<RunContext>,
    table: AttemptTable,
    partitions: Vec<PartitionDescriptor>,
    handles: HashMap<(usize, u32), TaskHandle>,
    events_tx: Sender<ClusterEvent>,
    events_rx: Receiver<ClusterEvent>,
    max_in_flight: usize,
    finished: bool,
}

impl ClusterStream {
    /// Submit pending partitions until the in-flight cap is reached.
    fn fill(&mut self) -> Result<()> {
        while self.table.in_flight() < self.max_in_flight {
            let Some((i, attempt)) = self.table.next_pending() else {
                return Ok(());
            };
            let task = RemoteTask {
                run: Arc::clone(&self.run),
                partition: self.partitions[i].clone(),
                attempt,
            };
            match self.client.submit_task(task, self.events_tx.clone()) {
                Ok(handle) => {
                    debug!(partition = %self.partitions[i].id, attempt, %handle, "submitted task");
                    self.handles.insert((i, attempt), handle);
                }
                Err(error) => self.on_failure(self.partitions[i].id, attempt, error)?,
            }
        }
        Ok(())
    }

    /// Apply a failed attempt to the table; `Err` ends the run.
    fn on_failure(&mut self, partition: PartitionId, attempt: u32, error: EngineError) -> Result<()> {
        match self.table.fail(partition, attempt, &error) {
            FailureAction::Retry { attempt: next } => {
                warn!(%partition, attempt, next, %error, "rescheduling partition");
                Ok(())
            }
            FailureAction::Exhausted(exhausted) => Err(exhausted),
            FailureAction::Abort => Err(error),
            FailureAction::Ignored => Ok(()),
        }
    }

    fn on_event(&mut self, event: ClusterEvent) -> Result<Option<TaskResult>> {
        match event {
            ClusterEvent::Finished {
                partition,
                attempt,
                payload,
                ..
            } => {
                self.handles.remove(&(partition.index(), attempt));
                let result: TaskResult = match postcard::from_bytes(&payload) {
                    Ok(result) => result,
                    Err(e) => {
                        let error = EngineError::Worker(format!("undecodable result: {e}"));
                        self.on_failure(partition, attempt, error)?;
                        return Ok(None);
                    }
                };
                match self.table.complete(partition) {
                    Completion::Accepted => {
                        self.cancel_superseded(partition);
                        Ok(Some(result))
                    }
                    Completion::Duplicate => {
                        warn!(%partition, attempt, "dropping duplicate result");
                        Ok(None)
                    }
                    Completion::Discarded => Ok(None),
                }
            }
            ClusterEvent::Failed {
                partition,
                attempt,
                error,
                ..
            } => {
                self.handles.remove(&(partition.index(), attempt));
                self.on_failure(partition, attempt, error).map(|()| None)
            }
            ClusterEvent::WorkerLost {
                partition,
                attempt,
                worker,
                ..
            } => {
                self.handles.remove(&(partition.index(), attempt));
                let error = EngineError::Worker(format!("worker {worker} lost while running {partition}"));
                self.on_failure(partition, attempt, error).map(|()| None)
            }
        }
    }

    /// Cancel other attempts of a partition that already has a result.
    fn cancel_superseded(&mut self, partition: PartitionId) {
        let superseded: Vec<_> = self
            .handles
            .keys()
            .filter(|(i, _)| *i == partition.index())
            .copied()
            .collect();
        for key in superseded {
            if let Some(handle) = self.handles.remove(&key) {
                debug!(%partition, attempt = key.1, %handle, "cancelling superseded attempt");
                self.client.cancel(handle);
            }
        }
    }

    fn abort(&mut self, error: EngineError) -> Option<Result<TaskResult>> {
        self.cancel();
        Some(Err(error))
    }
}

impl Iterator for ClusterStream {
    type Item = Result<TaskResult>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.table.is_done() {
                self.finished = true;
                return None;
            }
            if self.table.in_flight() == 0 {
                if let Err(e) = self.fill() {
                    return self.abort(e);
                }
                if self.table.in_flight() == 0 {
                    return self.abort(EngineError::Worker("no tasks could be scheduled".to_string()));
                }
            }
            // The stream holds a sender itself, so this only returns on an event.
            let Ok(event) = self.events_rx.recv() else {
                return self.abort(EngineError::Worker("cluster event channel closed".to_string()));
            };
            let outcome = self.on_event(event).and_then(|result| {
                self.fill()?;
                Ok(result)
            });
            match outcome {
                Ok(Some(result)) => return Some(Ok(result)),
                Ok(None) => {}
                Err(e) => return self.abort(e),
            }
        }
    }
}

impl TaskStream for ClusterStream {
    fn cancel(&mut self) {
        self.finished = true;
        self.table.cancel_all();
        for (_, handle) in self.handles.drain() {
            self.client.cancel(handle);
        }
    }

    fn retries(&self) -> u64 {
        self.table.retries()
    }

    fn duplicates(&self) -> u64 {
        self.table.duplicates()
    }
}
