//! Lightweight identifiers for partitions and runs.
//!
//! Each partition produced by the [`DatasetIndex`](crate::index::DatasetIndex) gets a
//! sequential `PartitionId` that doubles as its position in the partition list.
//! They're small, `Copy`, and hashable, so the scheduler and the merger use them
//! directly as table keys.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a partition within one run.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct PartitionId(u32);

impl PartitionId {
    #[must_use]
    pub fn new(v: u32) -> Self {
        Self(v)
    }

    /// Return the underlying numeric value.
    #[must_use]
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Position of this partition in the ordered partition list.
    #[must_use]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a run, unique within the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct RunId(u64);

static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

impl RunId {
    pub(crate) fn next() -> Self {
        Self(NEXT_RUN.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "run-{}", self.0)
    }
}
