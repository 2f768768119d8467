//! Task-attempt state machine shared by all backends.
//!
//! ```text
//! Pending --dispatch--> Dispatched(attempt) --complete--> Completed
//!    ^                        |
//!    +------ transient -------+--- deterministic / budget spent --> Failed
//! ```
//!
//! A partition is dispatched at most `1 + retry_limit` times. The first completion of
//! any attempt is accepted; every later completion of the same partition is a
//! duplicate. Completions and failures after cancellation are discarded.

use crate::error::EngineError;
use crate::ids::PartitionId;
use std::collections::VecDeque;

/// State of one partition's task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Dispatched { attempt: u32 },
    Completed,
    Failed,
    Cancelled,
}

/// What to do with a reported completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Accepted,
    /// The partition already has an accepted result.
    Duplicate,
    /// The run was cancelled or already failed.
    Discarded,
}

/// What to do after a reported failure.
#[derive(Debug)]
pub enum FailureAction {
    /// The partition is pending again; dispatch it as `attempt`.
    Retry { attempt: u32 },
    /// The retry budget is spent; the run fails with this error.
    Exhausted(EngineError),
    /// The error is deterministic; the run fails with it.
    Abort,
    /// The failure belongs to an attempt that no longer matters.
    Ignored,
}

/// Attempt bookkeeping for all partitions of one run.
#[derive(Debug)]
pub struct AttemptTable {
    states: Vec<TaskState>,
    /// Attempts dispatched so far, per partition.
    attempts: Vec<u32>,
    queue: VecDeque<usize>,
    retry_limit: u32,
    completed: usize,
    retries: u64,
    duplicates: u64,
}

impl AttemptTable {
    /// All `partitions` pending, in partition order.
    #[must_use]
    pub fn new(partitions: usize, retry_limit: u32) -> Self {
        Self {
            states: vec![TaskState::Pending; partitions],
            attempts: vec![0; partitions],
            queue: (0..partitions).collect(),
            retry_limit,
            completed: 0,
            retries: 0,
            duplicates: 0,
        }
    }

    /// Move the next pending partition to `Dispatched`, returning it and its attempt
    /// number (1-based).
    pub fn next_pending(&mut self) -> Option<(usize, u32)> {
        while let Some(i) = self.queue.pop_front() {
            if self.states[i] != TaskState::Pending {
                continue;
            }
            self.attempts[i] += 1;
            let attempt = self.attempts[i];
            self.states[i] = TaskState::Dispatched { attempt };
            return Some((i, attempt));
        }
        None
    }

    /// Record a successful attempt.
    pub fn complete(&mut self, partition: PartitionId) -> Completion {
        let i = partition.index();
        match self.states.get(i) {
            None | Some(TaskState::Cancelled | TaskState::Failed) => Completion::Discarded,
            Some(TaskState::Completed) => {
                self.duplicates += 1;
                Completion::Duplicate
            }
            Some(TaskState::Pending | TaskState::Dispatched { .. }) => {
                self.states[i] = TaskState::Completed;
                self.completed += 1;
                Completion::Accepted
            }
        }
    }

    /// Record a failed attempt.
    pub fn fail(&mut self, partition: PartitionId, attempt: u32, error: &EngineError) -> FailureAction {
        let i = partition.index();
        match self.states.get(i) {
            Some(TaskState::Dispatched { attempt: current }) if *current == attempt => {}
            _ => return FailureAction::Ignored,
        }
        if !error.is_transient() {
            self.states[i] = TaskState::Failed;
            return FailureAction::Abort;
        }
        if self.attempts[i] > self.retry_limit {
            self.states[i] = TaskState::Failed;
            return FailureAction::Exhausted(EngineError::WorkerExhausted {
                partition,
                attempts: self.attempts[i],
                last_error: error.to_string(),
            });
        }
        self.states[i] = TaskState::Pending;
        self.queue.push_back(i);
        self.retries += 1;
        FailureAction::Retry {
            attempt: self.attempts[i] + 1,
        }
    }

    /// Cancel everything not yet completed; returns the partitions that were in flight.
    pub fn cancel_all(&mut self) -> Vec<(usize, u32)> {
        let mut in_flight = Vec::new();
        for (i, state) in self.states.iter_mut().enumerate() {
            match *state {
                TaskState::Dispatched { attempt } => {
                    in_flight.push((i, attempt));
                    *state = TaskState::Cancelled;
                }
                TaskState::Pending => *state = TaskState::Cancelled,
                _ => {}
            }
        }
        self.queue.clear();
        in_flight
    }

    #[must_use]
    pub fn state(&self, partition: PartitionId) -> Option<TaskState> {
        self.states.get(partition.index()).copied()
    }

    #[must_use]
    pub fn attempts(&self, partition: PartitionId) -> u32 {
        self.attempts.get(partition.index()).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.states
            .iter()
            .filter(|s| matches!(s, TaskState::Dispatched { .. }))
            .count()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.completed == self.states.len()
    }

    /// Retries scheduled so far.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// Duplicate completions dropped so far.
    #[must_use]
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}
