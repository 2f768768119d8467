//! The contract a user analysis object satisfies.
//!
//! Per task the engine:
//! 1. allocates fresh buffers from the specs returned by [`Udf::buffer_specs`]
//!    (asked once per run, so specs cannot change mid-run)
//! 2. resolves [`Udf::kernel`] through the compile cache
//! 3. calls [`Udf::process_tile`] once per tile, in tile order
//! 4. calls [`Udf::postprocess_partition`] once after the last tile
//!
//! and hands the buffers back for merging. Buffers are private to the task, so UDF code
//! never needs synchronization.

use crate::buffer::{BufferSet, BufferSpec};
use crate::dataset::DataSetMeta;
use crate::index::PartitionDescriptor;
use crate::kernel::{CompiledKernel, KernelSource};
use crate::tiling::Tile;

/// A user-defined function applied to every partition of a dataset.
pub trait Udf: Send + Sync {
    /// Unique name of this UDF within a run; results are looked up by it.
    fn name(&self) -> &str;

    /// The result buffers this UDF writes.
    fn buffer_specs(&self, meta: &DataSetMeta) -> Vec<BufferSpec>;

    /// Kernel to compile before the first tile, if any.
    fn kernel(&self) -> Option<KernelSource> {
        None
    }

    /// Fold one tile into this task's buffers.
    ///
    /// # Errors
    ///
    /// Any error aborts the run as [`EngineError::UdfUser`](crate::EngineError::UdfUser).
    fn process_tile(&self, tile: &Tile<'_>, buffers: &mut BufferSet, ctx: &TaskContext<'_>) -> anyhow::Result<()>;

    /// Runs once per task after the last tile.
    ///
    /// # Errors
    ///
    /// Any error aborts the run as [`EngineError::UdfUser`](crate::EngineError::UdfUser).
    fn postprocess_partition(&self, buffers: &mut BufferSet, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        let _ = (buffers, ctx);
        Ok(())
    }
}

/// What a UDF sees about the task it runs in.
#[derive(Clone, Copy)]
pub struct TaskContext<'a> {
    pub partition: &'a PartitionDescriptor,
    pub meta: &'a DataSetMeta,
    pub attempt: u32,
    kernel: Option<&'a CompiledKernel>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        partition: &'a PartitionDescriptor,
        meta: &'a DataSetMeta,
        attempt: u32,
        kernel: Option<&'a CompiledKernel>,
    ) -> Self {
        Self {
            partition,
            meta,
            attempt,
            kernel,
        }
    }

    /// The compiled form of [`Udf::kernel`].
    ///
    /// # Errors
    ///
    /// Returns an error if the UDF did not declare a kernel.
    pub fn kernel(&self) -> anyhow::Result<&'a CompiledKernel> {
        self.kernel
            .ok_or_else(|| anyhow::anyhow!("no kernel was declared for this UDF"))
    }
}
