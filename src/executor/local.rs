//! Thread-pool backend.
//!
//! `workers` rayon threads pull `(partition, attempt)` pairs from a shared crossbeam
//! queue and run them to completion one at a time. Results go back through a bounded
//! channel, so at most `2 * workers` partitions are held in memory: workers block on
//! send until the merger catches up.

use super::attempts::{AttemptTable, Completion, FailureAction};
use super::{Executor, TaskStream};
use crate::error::{EngineError, Result};
use crate::ids::PartitionId;
use crate::index::PartitionDescriptor;
use crate::merge::panic_message;
use crate::task::{RunContext, TaskResult, run_task};
use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

type Job = (PartitionDescriptor, u32);
type Outcome = (PartitionId, u32, Result<TaskResult>);

/// Runs tasks on a bounded pool of local threads.
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    workers: usize,
    retry_limit: u32,
}

impl LocalExecutor {
    #[must_use]
    pub fn new(workers: usize, retry_limit: u32) -> Self {
        Self {
            workers: workers.max(1),
            retry_limit,
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(num_cpus::get(), 3)
    }
}

impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    fn submit(&self, run: Arc<RunContext>, partitions: Vec<PartitionDescriptor>) -> Result<Box<dyn TaskStream>> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("ironframe-worker-{i}"))
            .panic_handler(|panic| error!(panic = %panic_message(&*panic), "worker thread panicked"))
            .build()
            .map_err(|e| EngineError::Worker(format!("cannot start worker pool: {e}")))?;
        let (job_tx, job_rx) = unbounded::<Job>();
        let (result_tx, result_rx) = bounded::<Outcome>(self.workers);
        let cancelled = Arc::new(AtomicBool::new(false));

        for _ in 0..self.workers {
            let run = Arc::clone(&run);
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let cancelled = Arc::clone(&cancelled);
            pool.spawn(move || worker_loop(&run, &jobs, &results, &cancelled));
        }

        let mut table = AttemptTable::new(partitions.len(), self.retry_limit);
        while let Some((i, attempt)) = table.next_pending() {
            job_tx
                .send((partitions[i].clone(), attempt))
                .map_err(|_| EngineError::Worker("worker pool stopped".to_string()))?;
        }
        debug!(run = %run.run_id, partitions = partitions.len(), workers = self.workers, "submitted run");

        Ok(Box::new(LocalStream {
            table,
            partitions,
            jobs: Some(job_tx),
            results: result_rx,
            cancelled,
            _pool: pool,
            finished: false,
        }))
    }
}

fn worker_loop(run: &RunContext, jobs: &Receiver<Job>, results: &Sender<Outcome>, cancelled: &AtomicBool) {
    for (partition, attempt) in jobs {
        if cancelled.load(Ordering::Acquire) {
            break;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| run_task(run, &partition, attempt))).unwrap_or_else(|panic| {
            Err(EngineError::Worker(format!("task panicked: {}", panic_message(&*panic))))
        });
        if results.send((partition.id, attempt, outcome)).is_err() {
            break;
        }
    }
}

struct LocalStream {
    table: AttemptTable,
    partitions: Vec<PartitionDescriptor>,
    /// Dropping the sender lets idle workers exit.
    jobs: Option<Sender<Job>>,
    results: Receiver<Outcome>,
    cancelled: Arc<AtomicBool>,
    _pool: ThreadPool,
    finished: bool,
}

impl LocalStream {
    fn shutdown(&mut self) {
        self.finished = true;
        self.jobs = None;
    }

    fn requeue(&mut self) -> Result<()> {
        while let Some((i, attempt)) = self.table.next_pending() {
            let sent = self
                .jobs
                .as_ref()
                .is_some_and(|jobs| jobs.send((self.partitions[i].clone(), attempt)).is_ok());
            if !sent {
                return Err(EngineError::Worker("worker pool stopped".to_string()));
            }
        }
        Ok(())
    }
}

impl Iterator for LocalStream {
    type Item = Result<TaskResult>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.table.is_done() {
                self.shutdown();
                return None;
            }
            let Ok((partition, attempt, outcome)) = self.results.recv() else {
                self.shutdown();
                return Some(Err(EngineError::Worker("worker pool stopped".to_string())));
            };
            match outcome {
                Ok(result) => match self.table.complete(partition) {
                    Completion::Accepted => return Some(Ok(result)),
                    Completion::Duplicate | Completion::Discarded => {
                        warn!(%partition, attempt, "discarding result");
                    }
                },
                Err(error) => match self.table.fail(partition, attempt, &error) {
                    FailureAction::Retry { attempt: next } => {
                        warn!(%partition, attempt, next, %error, "retrying partition");
                        if let Err(e) = self.requeue() {
                            self.shutdown();
                            return Some(Err(e));
                        }
                    }
                    FailureAction::Exhausted(exhausted) => {
                        self.cancel();
                        return Some(Err(exhausted));
                    }
                    FailureAction::Abort => {
                        self.cancel();
                        return Some(Err(error));
                    }
                    FailureAction::Ignored => {}
                },
            }
        }
    }
}

impl TaskStream for LocalStream {
    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.table.cancel_all();
        self.shutdown();
    }

    fn retries(&self) -> u64 {
        self.table.retries()
    }

    fn duplicates(&self) -> u64 {
        self.table.duplicates()
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
    }
}
