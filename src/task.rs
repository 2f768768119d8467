//! Execution of one (UDF set, partition) task.
//!
//! [`run_task`] is what every backend runs on a worker. It reads the partition into a
//! pooled buffer, resolves kernels, streams tiles through the UDFs and returns the
//! per-task buffers as a [`TaskResult`]. Tiles of one partition are processed
//! sequentially by the calling thread.

use crate::buffer::{BufferSet, BufferSpec};
use crate::compile_cache::CompileCache;
use crate::dataset::Dataset;
use crate::error::{EngineError, Result};
use crate::ids::{PartitionId, RunId};
use crate::index::PartitionDescriptor;
use crate::kernel::CompiledKernel;
use crate::merge::panic_message;
use crate::pool::BufferPool;
use crate::tiling::PartitionData;
use crate::udf::{TaskContext, Udf};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Everything a worker needs to run tasks of one run.
pub struct RunContext {
    pub run_id: RunId,
    pub dataset: Arc<dyn Dataset>,
    pub udfs: Vec<Arc<dyn Udf>>,
    /// Buffer specs per UDF, fixed when the run was submitted.
    pub specs: Vec<Vec<BufferSpec>>,
    pub cache: Arc<CompileCache>,
    pub pool: BufferPool,
}

/// The outcome of one successful task attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub partition: PartitionId,
    pub attempt: u32,
    /// One buffer set per UDF, in UDF order.
    pub buffers: Vec<BufferSet>,
    pub tiles: usize,
    pub elapsed: Duration,
}

/// Run `partition` through every UDF of `run`.
///
/// # Errors
///
/// - [`EngineError::Read`] (transient) if the partition cannot be read
/// - [`EngineError::Compile`] if a kernel fails to compile
/// - [`EngineError::UdfUser`] if a UDF returns an error or panics
///
/// Panics in UDF, compiler or reader code are reported as the matching error.
pub fn run_task(run: &RunContext, partition: &PartitionDescriptor, attempt: u32) -> Result<TaskResult> {
    let started = Instant::now();
    let meta = run.dataset.meta();
    debug!(run = %run.run_id, %partition, attempt, "starting task");

    let kernels = run
        .udfs
        .iter()
        .map(|udf| {
            let source = guarded(udf.name(), partition.id, || Ok(udf.kernel()))?;
            source.map(|k| run.cache.get_or_compile(&k)).transpose()
        })
        .collect::<Result<Vec<Option<Arc<CompiledKernel>>>>>()?;

    let mut raw = run.pool.allocate(partition.byte_len)?;
    catch_unwind(AssertUnwindSafe(|| run.dataset.read_partition_into(partition, &mut raw)))
        .unwrap_or_else(|panic| {
            Err(EngineError::Read {
                partition: partition.id,
                message: format!("reader panicked: {}", panic_message(&*panic)),
            })
        })
        .map_err(|e| match e {
            EngineError::Read { .. } => e,
            other => EngineError::Read {
                partition: partition.id,
                message: other.to_string(),
            },
        })?;
    let data = PartitionData::new(partition, meta, &raw)?;

    let mut buffers = run
        .specs
        .iter()
        .map(|specs| BufferSet::for_task(specs, partition))
        .collect::<Result<Vec<_>>>()?;
    let contexts: Vec<TaskContext<'_>> = kernels
        .iter()
        .map(|k| TaskContext::new(partition, meta, attempt, k.as_deref()))
        .collect();

    let mut tiles = 0;
    for tile in data.tiles() {
        for ((udf, set), ctx) in run.udfs.iter().zip(buffers.iter_mut()).zip(&contexts) {
            guarded(udf.name(), partition.id, || udf.process_tile(&tile, set, ctx))?;
        }
        trace!(%partition, tile = tile.descriptor().index, "processed tile");
        tiles += 1;
    }
    for ((udf, set), ctx) in run.udfs.iter().zip(buffers.iter_mut()).zip(&contexts) {
        guarded(udf.name(), partition.id, || udf.postprocess_partition(set, ctx))?;
    }

    let elapsed = started.elapsed();
    debug!(%partition, attempt, tiles, elapsed_ms = elapsed.as_millis(), "finished task");
    Ok(TaskResult {
        partition: partition.id,
        attempt,
        buffers,
        tiles,
        elapsed,
    })
}

/// Run UDF code, turning errors and panics into [`EngineError::UdfUser`].
fn guarded<T, F>(udf: &str, partition: PartitionId, f: F) -> Result<T>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(EngineError::udf(udf, partition, e)),
        Err(panic) => Err(EngineError::udf(
            udf,
            partition,
            anyhow::anyhow!("panicked: {}", panic_message(&*panic)),
        )),
    }
}
