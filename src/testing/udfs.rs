//! Reference UDFs.
//!
//! Each one exercises a single engine feature so tests can combine them freely:
//!
//! | UDF                       | buffer        | kind     | extent    |
//! |---------------------------|---------------|----------|-----------|
//! | [`SumAllUdf`]             | `total`       | sum      | global    |
//! | [`SigSumUdf`]             | `sig_sum`     | sum      | global    |
//! | [`TileCounterUdf`]        | `tiles`       | sum, u64 | global    |
//! | [`FrameSumUdf`]           | `intensity`   | replace  | per frame |
//! | [`MaxUdf`]                | `max`         | custom   | global    |
//! | [`OverlappingReplaceUdf`] | `last`        | replace  | global    |
//! | [`KernelUdf`]             | `total`       | sum      | global    |
//! | [`FailingUdf`]            | `total`       | sum      | global    |

use crate::buffer::{BufferSet, BufferSpec};
use crate::dataset::DataSetMeta;
use crate::dtype::DType;
use crate::ids::PartitionId;
use crate::kernel::KernelSource;
use crate::tiling::Tile;
use crate::udf::{TaskContext, Udf};
use anyhow::{anyhow, bail};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::Duration;

/// Sum of every element of the dataset, as a scalar `f64`.
pub struct SumAllUdf {
    name: String,
}

impl SumAllUdf {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn arc(name: impl Into<String>) -> Arc<dyn Udf> {
        Arc::new(Self::new(name))
    }
}

impl Udf for SumAllUdf {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffer_specs(&self, _meta: &DataSetMeta) -> Vec<BufferSpec> {
        vec![BufferSpec::sum("total", [], DType::F64)]
    }

    fn process_tile(&self, tile: &Tile<'_>, buffers: &mut BufferSet, _ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        let sum: f64 = tile.to_f64().iter().sum();
        buffers.get_mut("total")?.values_mut::<f64>()?[0] += sum;
        Ok(())
    }
}

/// Sum over all frames, keeping the signature shape.
pub struct SigSumUdf {
    name: String,
}

impl SigSumUdf {
    pub fn arc(name: impl Into<String>) -> Arc<dyn Udf> {
        Arc::new(Self { name: name.into() })
    }
}

impl Udf for SigSumUdf {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffer_specs(&self, meta: &DataSetMeta) -> Vec<BufferSpec> {
        vec![BufferSpec::sum("sig_sum", meta.shape.sig(), DType::F64)]
    }

    fn process_tile(&self, tile: &Tile<'_>, buffers: &mut BufferSet, _ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        let values = tile.to_f64();
        let acc = buffers.get_mut("sig_sum")?.values_mut::<f64>()?;
        for frame in values.chunks_exact(tile.frame_len()) {
            for (a, v) in acc.iter_mut().zip(frame) {
                *a += v;
            }
        }
        Ok(())
    }
}

/// Counts `process_tile` calls, optionally sleeping in each.
pub struct TileCounterUdf {
    name: String,
    delay: Duration,
}

impl TileCounterUdf {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
        }
    }

    /// Sleep for `delay` in every tile, to keep runs in flight.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn arc(name: impl Into<String>) -> Arc<dyn Udf> {
        Arc::new(Self::new(name))
    }
}

impl Udf for TileCounterUdf {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffer_specs(&self, _meta: &DataSetMeta) -> Vec<BufferSpec> {
        vec![BufferSpec::sum("tiles", [], DType::U64)]
    }

    fn process_tile(&self, _tile: &Tile<'_>, buffers: &mut BufferSet, _ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            sleep(self.delay);
        }
        buffers.get_mut("tiles")?.values_mut::<u64>()?[0] += 1;
        Ok(())
    }
}

/// Sum of each frame, written into a per-frame replace buffer shaped like the
/// navigation axes.
pub struct FrameSumUdf {
    name: String,
}

impl FrameSumUdf {
    pub fn arc(name: impl Into<String>) -> Arc<dyn Udf> {
        Arc::new(Self { name: name.into() })
    }
}

impl Udf for FrameSumUdf {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffer_specs(&self, _meta: &DataSetMeta) -> Vec<BufferSpec> {
        vec![BufferSpec::replace("intensity", [], DType::F64).per_frame()]
    }

    fn process_tile(&self, tile: &Tile<'_>, buffers: &mut BufferSet, _ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        let values = tile.to_f64();
        let out = buffers.get_mut("intensity")?;
        for (i, frame) in values.chunks_exact(tile.frame_len()).enumerate() {
            out.frame_mut::<f64>(tile.start_frame() + i)?[0] = frame.iter().sum();
        }
        Ok(())
    }
}

/// Largest element of the dataset, merged with a custom max function.
pub struct MaxUdf {
    name: String,
}

impl MaxUdf {
    pub fn arc(name: impl Into<String>) -> Arc<dyn Udf> {
        Arc::new(Self { name: name.into() })
    }
}

impl Udf for MaxUdf {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffer_specs(&self, _meta: &DataSetMeta) -> Vec<BufferSpec> {
        let spec = BufferSpec::custom("max", [], DType::F64, |acc, incoming| {
            let (Some(acc), Some(incoming)) = (acc.as_f64_mut(), incoming.as_f64()) else {
                bail!("max buffers must hold f64 values");
            };
            for (a, v) in acc.iter_mut().zip(incoming) {
                *a = a.max(*v);
            }
            Ok(())
        });
        vec![spec.with_fill(f64::NEG_INFINITY)]
    }

    fn process_tile(&self, tile: &Tile<'_>, buffers: &mut BufferSet, _ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        let max = tile.to_f64().into_iter().fold(f64::NEG_INFINITY, f64::max);
        let acc = &mut buffers.get_mut("max")?.values_mut::<f64>()?[0];
        *acc = acc.max(max);
        Ok(())
    }
}

/// Writes the first frame index of every tile into the same element of a global
/// replace buffer. Runs with more than one partition fail with
/// [`EngineError::ValueOverwrite`](crate::EngineError::ValueOverwrite).
pub struct OverlappingReplaceUdf {
    name: String,
}

impl OverlappingReplaceUdf {
    pub fn arc(name: impl Into<String>) -> Arc<dyn Udf> {
        Arc::new(Self { name: name.into() })
    }
}

impl Udf for OverlappingReplaceUdf {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffer_specs(&self, _meta: &DataSetMeta) -> Vec<BufferSpec> {
        vec![BufferSpec::replace("last", [1], DType::F64)]
    }

    #[allow(clippy::cast_precision_loss)]
    fn process_tile(&self, tile: &Tile<'_>, buffers: &mut BufferSet, _ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        buffers.get_mut("last")?.set(0, tile.start_frame() as f64)?;
        Ok(())
    }
}

/// Sum of a compiled expression applied to every element.
pub struct KernelUdf {
    name: String,
    kernel: KernelSource,
}

impl KernelUdf {
    /// A UDF evaluating `expr` (an expression in `x`) on every element.
    pub fn new(name: impl Into<String>, expr: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kernel: KernelSource::new(name.clone(), expr),
            name,
        }
    }

    pub fn arc(name: impl Into<String>, expr: impl Into<String>) -> Arc<dyn Udf> {
        Arc::new(Self::new(name, expr))
    }
}

impl Udf for KernelUdf {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffer_specs(&self, _meta: &DataSetMeta) -> Vec<BufferSpec> {
        vec![BufferSpec::sum("total", [], DType::F64)]
    }

    fn kernel(&self) -> Option<KernelSource> {
        Some(self.kernel.clone())
    }

    fn process_tile(&self, tile: &Tile<'_>, buffers: &mut BufferSet, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        let kernel = ctx.kernel()?;
        let mut values = tile.to_f64();
        kernel.program.apply(&mut values);
        buffers.get_mut("total")?.values_mut::<f64>()?[0] += values.iter().sum::<f64>();
        Ok(())
    }
}

/// Fails (or panics) while processing one partition and sums everything else.
pub struct FailingUdf {
    name: String,
    partition: PartitionId,
    panic: bool,
    calls: AtomicUsize,
}

impl FailingUdf {
    pub fn new(name: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            name: name.into(),
            partition,
            panic: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Panic instead of returning an error.
    #[must_use]
    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    /// Times the failing partition was processed.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Udf for FailingUdf {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffer_specs(&self, _meta: &DataSetMeta) -> Vec<BufferSpec> {
        vec![BufferSpec::sum("total", [], DType::F64)]
    }

    fn process_tile(&self, tile: &Tile<'_>, buffers: &mut BufferSet, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        if ctx.partition.id == self.partition {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("tile {} of partition {} is cursed", tile.descriptor().index, self.partition);
            }
            return Err(anyhow!("partition {} is cursed", self.partition));
        }
        buffers.get_mut("total")?.values_mut::<f64>()?[0] += tile.to_f64().iter().sum::<f64>();
        Ok(())
    }
}
