//! In-process stand-in for a cluster scheduler.
//!
//! Tasks run on a private rayon pool of `workers` threads. Nothing is shared with the
//! submitting side except what a real cluster would return: every result crosses a
//! postcard serialization boundary before it is reported.
//!
//! A [`FaultPlan`] injects infrastructure failures:
//! - `lose_worker(p, n)`: the first `n` attempts of partition `p` report
//!   [`ClusterEvent::WorkerLost`] instead of their result
//! - `deliver_late(p)`: a lost attempt of `p` still delivers its result afterwards,
//!   like a worker that was presumed dead but was only slow

use super::cluster::{ClusterClient, ClusterEvent, RemoteTask, TaskHandle};
use crate::error::{EngineError, Result};
use crate::ids::PartitionId;
use crate::merge::panic_message;
use crate::task::run_task;
use crossbeam::channel::Sender;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

/// Faults to inject, keyed by partition.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    /// Number of attempts still to lose, per partition.
    lose: HashMap<PartitionId, u32>,
    late: HashSet<PartitionId>,
}

impl FaultPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lose the worker of the first `attempts` attempts of `partition`.
    #[must_use]
    pub fn lose_worker(mut self, partition: PartitionId, attempts: u32) -> Self {
        self.lose.insert(partition, attempts);
        self
    }

    /// Lose every attempt of `partition`.
    #[must_use]
    pub fn lose_always(self, partition: PartitionId) -> Self {
        self.lose_worker(partition, u32::MAX)
    }

    /// Let lost attempts of `partition` deliver their result after the loss report.
    #[must_use]
    pub fn deliver_late(mut self, partition: PartitionId) -> Self {
        self.late.insert(partition);
        self
    }

    /// Consume one loss for `partition`; returns `(lost, deliver_late)`.
    fn take(&mut self, partition: PartitionId) -> (bool, bool) {
        match self.lose.get_mut(&partition) {
            Some(left) if *left > 0 => {
                *left -= 1;
                (true, self.late.contains(&partition))
            }
            _ => (false, false),
        }
    }
}

/// Counters of a [`SimulatedCluster`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub submitted: usize,
    pub cancel_requests: usize,
    pub workers_lost: usize,
    /// Submitted tasks that have not finished yet.
    pub in_flight: usize,
}

struct Shared {
    faults: Mutex<FaultPlan>,
    /// Unfinished tasks and whether they were cancelled.
    tasks: Mutex<HashMap<TaskHandle, bool>>,
    submitted: AtomicUsize,
    cancel_requests: AtomicUsize,
    workers_lost: AtomicUsize,
    next_worker: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A cluster simulated with a local thread pool.
pub struct SimulatedCluster {
    workers: usize,
    pool: ThreadPool,
    next_handle: AtomicU64,
    shared: Arc<Shared>,
}

impl SimulatedCluster {
    /// # Errors
    ///
    /// Returns [`EngineError::Worker`] if the worker threads cannot be started.
    pub fn new(workers: usize) -> Result<Self> {
        Self::with_faults(workers, FaultPlan::default())
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Worker`] if the worker threads cannot be started.
    pub fn with_faults(workers: usize, faults: FaultPlan) -> Result<Self> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("ironframe-sim-{i}"))
            .panic_handler(|panic| error!(panic = %panic_message(&*panic), "simulated worker panicked"))
            .build()
            .map_err(|e| EngineError::Worker(format!("cannot start simulated cluster: {e}")))?;
        Ok(Self {
            workers,
            pool,
            next_handle: AtomicU64::new(1),
            shared: Arc::new(Shared {
                faults: Mutex::new(faults),
                tasks: Mutex::new(HashMap::new()),
                submitted: AtomicUsize::new(0),
                cancel_requests: AtomicUsize::new(0),
                workers_lost: AtomicUsize::new(0),
                next_worker: AtomicUsize::new(0),
            }),
        })
    }

    /// Replace the fault plan for subsequent tasks.
    pub fn set_faults(&self, faults: FaultPlan) {
        *lock(&self.shared.faults) = faults;
    }

    #[must_use]
    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            cancel_requests: self.shared.cancel_requests.load(Ordering::Relaxed),
            workers_lost: self.shared.workers_lost.load(Ordering::Relaxed),
            in_flight: lock(&self.shared.tasks).len(),
        }
    }
}

impl ClusterClient for SimulatedCluster {
    fn workers(&self) -> usize {
        self.workers
    }

    fn submit_task(&self, task: RemoteTask, events: Sender<ClusterEvent>) -> Result<TaskHandle> {
        let handle = TaskHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.tasks).insert(handle, false);
        let shared = Arc::clone(&self.shared);
        let workers = self.workers;
        self.pool.spawn(move || {
            let skip = {
                let mut tasks = lock(&shared.tasks);
                let cancelled = tasks.get(&handle) == Some(&true);
                if cancelled {
                    tasks.remove(&handle);
                }
                cancelled
            };
            if skip {
                debug!(%handle, "skipping cancelled task");
                return;
            }
            let worker = shared.next_worker.fetch_add(1, Ordering::Relaxed) % workers;
            let partition = task.partition.id;
            let attempt = task.attempt;
            let outcome = catch_unwind(AssertUnwindSafe(|| run_task(&task.run, &task.partition, attempt)))
                .unwrap_or_else(|panic| {
                    Err(EngineError::Worker(format!("task panicked: {}", panic_message(&*panic))))
                })
                .and_then(|result| Ok(postcard::to_allocvec(&result)?));
            lock(&shared.tasks).remove(&handle);
            let (lost, late) = lock(&shared.faults).take(partition);

            let send = |event| {
                // The executor may be gone; nobody is left to tell.
                let _ = events.send(event);
            };
            if lost {
                shared.workers_lost.fetch_add(1, Ordering::Relaxed);
                debug!(%handle, %partition, attempt, worker, "simulating worker loss");
                send(ClusterEvent::WorkerLost {
                    handle,
                    partition,
                    attempt,
                    worker,
                });
                if !late {
                    return;
                }
            }
            send(match outcome {
                Ok(payload) => ClusterEvent::Finished {
                    handle,
                    partition,
                    attempt,
                    payload,
                },
                Err(error) => ClusterEvent::Failed {
                    handle,
                    partition,
                    attempt,
                    error,
                },
            });
        });
        Ok(handle)
    }

    fn cancel(&self, handle: TaskHandle) {
        self.shared.cancel_requests.fetch_add(1, Ordering::Relaxed);
        // Finished tasks are gone from the table; cancelling them is a no-op.
        if let Some(cancelled) = lock(&self.shared.tasks).get_mut(&handle) {
            *cancelled = true;
        }
    }
}
