//! Streaming merge of per-partition buffer sets into the run's global result.
//!
//! [`ResultMerger`] is owned by the submitting side and consumes task results in
//! arrival order. Each accepted partition is folded in through [`merge_buffer`], the
//! single place where the [`BufferKind`] policy is dispatched. A per-partition merged
//! marker drops duplicate results (retries, late arrivals).
//!
//! Snapshots share the accumulated buffers through an [`Arc`]; the merger clones them
//! only when it has to mutate while a snapshot is still held, so every snapshot a
//! caller keeps stays immutable.

use crate::buffer::{BufferKind, BufferSet, BufferSpec, Extent, ResultBuffer};
use crate::dataset::DataSetMeta;
use crate::error::{EngineError, Result};
use crate::ids::PartitionId;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};

/// Fold `incoming` (one task's buffer) into `acc` (the global buffer).
///
/// `first` is true when no partition has been merged into `acc` yet; CUSTOM buffers
/// take the first incoming buffer as is and call their merge function afterwards.
///
/// # Errors
///
/// - [`EngineError::BufferMismatch`] if `incoming` does not fit `acc`
/// - [`EngineError::ValueOverwrite`] if a REPLACE element was already written
/// - [`EngineError::UdfUser`] if a CUSTOM merge function fails or panics
pub fn merge_buffer(
    udf: &str,
    partition: PartitionId,
    spec: &BufferSpec,
    acc: &mut ResultBuffer,
    incoming: &ResultBuffer,
    first: bool,
) -> Result<()> {
    check_compatible(spec, acc, incoming)?;
    match &spec.kind {
        BufferKind::Replace => {
            check_replace(udf, partition, spec, acc, incoming)?;
            merge_replace(acc, incoming)
        }
        BufferKind::Sum => acc.data_mut().add_at(incoming.origin(), incoming.data()),
        BufferKind::Custom(merge_fn) => {
            if first {
                *acc.data_mut() = incoming.data().clone();
                return Ok(());
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| merge_fn(acc.data_mut(), incoming.data())));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(EngineError::udf(udf, partition, e)),
                Err(panic) => {
                    return Err(EngineError::udf(
                        udf,
                        partition,
                        anyhow::anyhow!("merge of '{}' panicked: {}", spec.name, panic_message(&*panic)),
                    ));
                }
            }
            if acc.data().dtype() != spec.dtype || acc.len() != incoming.len() {
                return Err(EngineError::BufferMismatch(format!(
                    "merge function of '{}' changed the buffer layout",
                    spec.name
                )));
            }
            Ok(())
        }
    }
}

fn check_compatible(spec: &BufferSpec, acc: &ResultBuffer, incoming: &ResultBuffer) -> Result<()> {
    if incoming.dtype() != spec.dtype || acc.dtype() != spec.dtype {
        return Err(EngineError::BufferMismatch(format!(
            "buffer '{}' declared {}, got {}",
            spec.name,
            spec.dtype,
            incoming.dtype()
        )));
    }
    let fits = match spec.extent {
        Extent::Global => incoming.origin() == 0 && incoming.len() == acc.len(),
        Extent::PerFrame => incoming.origin() + incoming.len() <= acc.len(),
    };
    if !fits {
        return Err(EngineError::BufferMismatch(format!(
            "buffer '{}': {} elements at offset {} do not fit {} global elements",
            spec.name,
            incoming.len(),
            incoming.origin(),
            acc.len()
        )));
    }
    Ok(())
}

fn check_replace(
    udf: &str,
    partition: PartitionId,
    spec: &BufferSpec,
    acc: &ResultBuffer,
    incoming: &ResultBuffer,
) -> Result<()> {
    let (Some(seen), Some(marks)) = (acc.written(), incoming.written()) else {
        return Err(EngineError::BufferMismatch(format!(
            "buffer '{}' is missing its write marks",
            spec.name
        )));
    };
    let origin = incoming.origin();
    if let Some(i) = marks
        .iter()
        .enumerate()
        .position(|(i, &w)| w && seen[origin + i])
    {
        return Err(EngineError::ValueOverwrite {
            udf: udf.to_string(),
            buffer: spec.name.clone(),
            index: origin + i,
            partition,
        });
    }
    Ok(())
}

fn merge_replace(acc: &mut ResultBuffer, incoming: &ResultBuffer) -> Result<()> {
    let origin = incoming.origin();
    let marks = incoming.written().unwrap_or_default();
    for (i, _) in marks.iter().enumerate().filter(|(_, w)| **w) {
        acc.copy_element_from(origin + i, incoming, i)?;
    }
    if let Some(seen) = acc.written_mut() {
        for (i, _) in marks.iter().enumerate().filter(|(_, w)| **w) {
            seen[origin + i] = true;
        }
    }
    Ok(())
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Outcome of [`ResultMerger::accept`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStatus {
    Merged,
    /// The partition had already been merged; the result was dropped.
    Duplicate,
}

/// Merged buffers of one UDF.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UdfResult {
    pub name: String,
    pub buffers: BufferSet,
}

/// Immutable view of the merged buffers at one point of a run.
#[derive(Clone, Debug)]
pub struct Snapshot {
    results: Arc<Vec<UdfResult>>,
    merged: usize,
    total: usize,
}

impl Snapshot {
    /// Fraction of partitions merged so far, in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.merged as f64 / self.total as f64
        }
    }

    #[must_use]
    pub fn partitions_merged(&self) -> usize {
        self.merged
    }

    #[must_use]
    pub fn partitions_total(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.merged == self.total
    }

    /// Results in UDF order.
    #[must_use]
    pub fn results(&self) -> &[UdfResult] {
        &self.results
    }

    /// Buffers of the UDF called `udf`.
    #[must_use]
    pub fn udf(&self, udf: &str) -> Option<&BufferSet> {
        self.results.iter().find(|r| r.name == udf).map(|r| &r.buffers)
    }

    /// One merged buffer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BufferMismatch`] if the UDF or buffer does not exist.
    pub fn buffer(&self, udf: &str, buffer: &str) -> Result<&ResultBuffer> {
        self.udf(udf)
            .ok_or_else(|| EngineError::BufferMismatch(format!("no UDF named '{udf}'")))?
            .get(buffer)
    }
}

/// Single-threaded accumulator of task results.
pub struct ResultMerger {
    names: Vec<String>,
    specs: Vec<Vec<BufferSpec>>,
    results: Arc<Vec<UdfResult>>,
    merged_marks: Vec<bool>,
    merged: usize,
}

impl ResultMerger {
    /// Empty global buffers for the UDFs `(name, specs)` over `partitions` partitions.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if a buffer spec is invalid.
    pub fn new(udfs: Vec<(String, Vec<BufferSpec>)>, meta: &DataSetMeta, partitions: usize) -> Result<Self> {
        let mut names = Vec::with_capacity(udfs.len());
        let mut specs = Vec::with_capacity(udfs.len());
        let mut results = Vec::with_capacity(udfs.len());
        for (name, udf_specs) in udfs {
            results.push(UdfResult {
                name: name.clone(),
                buffers: BufferSet::for_global(&udf_specs, meta)?,
            });
            names.push(name);
            specs.push(udf_specs);
        }
        Ok(Self {
            names,
            specs,
            results: Arc::new(results),
            merged_marks: vec![false; partitions],
            merged: 0,
        })
    }

    /// Merge the buffer sets (one per UDF, in UDF order) of `partition`.
    ///
    /// Either every UDF's buffers are merged or, on a validation error, none are.
    ///
    /// # Errors
    ///
    /// See [`merge_buffer`]; also [`EngineError::BufferMismatch`] for an unknown
    /// partition or a wrong number of buffer sets.
    pub fn accept(&mut self, partition: PartitionId, incoming: &[BufferSet]) -> Result<MergeStatus> {
        let Some(&already) = self.merged_marks.get(partition.index()) else {
            return Err(EngineError::BufferMismatch(format!("unknown partition {partition}")));
        };
        if already {
            warn!(%partition, "dropping duplicate result");
            return Ok(MergeStatus::Duplicate);
        }
        if incoming.len() != self.specs.len() {
            return Err(EngineError::BufferMismatch(format!(
                "partition {partition} returned {} buffer sets for {} UDFs",
                incoming.len(),
                self.specs.len()
            )));
        }
        self.validate(partition, incoming)?;

        let first = self.merged == 0;
        let results = Arc::make_mut(&mut self.results);
        for ((result, specs), set) in results.iter_mut().zip(&self.specs).zip(incoming) {
            let globals = result.buffers.buffers_mut();
            for ((spec, acc), buffer) in specs.iter().zip(globals).zip(set.buffers()) {
                merge_buffer(&result.name, partition, spec, acc, buffer, first)?;
            }
        }
        self.merged_marks[partition.index()] = true;
        self.merged += 1;
        debug!(%partition, merged = self.merged, total = self.merged_marks.len(), "merged partition");
        Ok(MergeStatus::Merged)
    }

    /// Checks that can fail without side effects, run before anything is mutated.
    fn validate(&self, partition: PartitionId, incoming: &[BufferSet]) -> Result<()> {
        for (((name, specs), result), set) in self.names.iter().zip(&self.specs).zip(self.results.iter()).zip(incoming) {
            if set.len() != specs.len() {
                return Err(EngineError::BufferMismatch(format!(
                    "UDF '{name}' returned {} buffers, declared {}",
                    set.len(),
                    specs.len()
                )));
            }
            for ((spec, acc), buffer) in specs.iter().zip(result.buffers.buffers()).zip(set.buffers()) {
                check_compatible(spec, acc, buffer)?;
                match &spec.kind {
                    BufferKind::Replace => check_replace(name, partition, spec, acc, buffer)?,
                    BufferKind::Sum => acc.data().check_add_at(buffer.origin(), buffer.data())?,
                    BufferKind::Custom(_) => {}
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn is_merged(&self, partition: PartitionId) -> bool {
        self.merged_marks.get(partition.index()).copied().unwrap_or(false)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.merged == self.merged_marks.len()
    }

    /// The current state as an immutable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            results: Arc::clone(&self.results),
            merged: self.merged,
            total: self.merged_marks.len(),
        }
    }

    /// The final result.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Worker`] if some partition never contributed a result.
    pub fn finish(self) -> Result<Snapshot> {
        if !self.is_complete() {
            let missing = self.merged_marks.iter().filter(|m| !**m).count();
            return Err(EngineError::Worker(format!(
                "{missing} partitions finished without a result"
            )));
        }
        Ok(self.snapshot())
    }
}
