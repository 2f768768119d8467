//! Datasets, compilers and configurations for tests.

use crate::config::EngineConfig;
use crate::dataset::{DataSetMeta, Dataset, MemoryDataset};
use crate::error::{EngineError, Result};
use crate::ids::PartitionId;
use crate::index::PartitionDescriptor;
use crate::kernel::{ExprCompiler, KernelCompiler, KernelSource, Program};
use crate::shape::Shape;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::sleep;
use std::time::Duration;

/// An `f32` dataset of the given shape filled with ones.
///
/// # Errors
///
/// Returns an error if the shape is invalid.
///
/// # Example
///
/// ```
/// use ironframe::testing::ones_dataset;
///
/// let ds = ones_dataset(&[2, 3, 4, 4], 2).unwrap();
/// assert_eq!(ds.meta().num_frames(), 6);
/// ```
pub fn ones_dataset(dims: &[usize], sig_dims: usize) -> Result<Arc<dyn Dataset>> {
    let shape = Shape::new(dims, sig_dims)?;
    let values = vec![1.0f32; shape.size()];
    Ok(MemoryDataset::from_values(shape, &values)?.into_arc())
}

/// An `f32` dataset whose elements hold their own flat index (0, 1, 2, ...).
///
/// Values stay exact in `f32` up to 2^24 elements.
///
/// # Errors
///
/// Returns an error if the shape is invalid.
#[allow(clippy::cast_precision_loss)]
pub fn ramp_dataset(dims: &[usize], sig_dims: usize) -> Result<Arc<dyn Dataset>> {
    let shape = Shape::new(dims, sig_dims)?;
    let values: Vec<f32> = (0..shape.size()).map(|i| i as f32).collect();
    Ok(MemoryDataset::from_values(shape, &values)?.into_arc())
}

/// An engine configuration with a fixed partition size, for deterministic layouts.
#[must_use]
pub fn test_config(num_workers: usize, frames_per_partition: usize) -> EngineConfig {
    EngineConfig {
        num_workers,
        frames_per_partition: Some(frames_per_partition),
        ..Default::default()
    }
}

/* ===================== FlakyDataset ===================== */

/// Wraps a dataset and fails reads of chosen partitions with a transient
/// [`EngineError::Read`].
pub struct FlakyDataset {
    inner: Arc<dyn Dataset>,
    failures: Mutex<HashMap<PartitionId, u32>>,
    reads: AtomicUsize,
}

impl FlakyDataset {
    #[must_use]
    pub fn new(inner: Arc<dyn Dataset>) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
        }
    }

    /// Fail the next `times` reads of `partition`.
    #[must_use]
    pub fn fail_reads(self, partition: PartitionId, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition, times);
        self
    }

    /// Fail every read of `partition`.
    #[must_use]
    pub fn fail_always(self, partition: PartitionId) -> Self {
        self.fail_reads(partition, u32::MAX)
    }

    /// Read attempts so far, failed ones included.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn check(&self, partition: &PartitionDescriptor) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        match failures.get_mut(&partition.id) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(EngineError::Read {
                    partition: partition.id,
                    message: "injected read failure".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl Dataset for FlakyDataset {
    fn meta(&self) -> &DataSetMeta {
        self.inner.meta()
    }

    fn get_partition_data(&self, partition: &PartitionDescriptor) -> Result<Vec<u8>> {
        self.check(partition)?;
        self.inner.get_partition_data(partition)
    }

    fn read_partition_into(&self, partition: &PartitionDescriptor, out: &mut [u8]) -> Result<()> {
        self.check(partition)?;
        self.inner.read_partition_into(partition, out)
    }
}

/* ===================== CountingCompiler ===================== */

/// An [`ExprCompiler`] that counts compilations and can be slowed down to widen
/// race windows.
#[derive(Default)]
pub struct CountingCompiler {
    inner: ExprCompiler,
    delay: Duration,
    compilations: AtomicUsize,
    sources: Mutex<Vec<String>>,
}

impl CountingCompiler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every compilation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    /// Names of the compiled kernels, in compilation order.
    #[must_use]
    pub fn compiled(&self) -> Vec<String> {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl KernelCompiler for CountingCompiler {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn compile(&self, source: &KernelSource) -> std::result::Result<Program, String> {
        self.compilations.fetch_add(1, Ordering::SeqCst);
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source.name.clone());
        if !self.delay.is_zero() {
            sleep(self.delay);
        }
        self.inner.compile(source)
    }
}
