//! # Ironframe
//!
//! A **partitioned UDF engine** for large multi-dimensional detector datasets: stacks of
//! 2D frames laid out on one or more navigation axes (for example a 4D STEM scan of
//! shape `[scan_y, scan_x, det_y, det_x]`).
//!
//! ## Key Features
//!
//! - **Deterministic partitioning** - whole-frame partitions sized by a byte hint
//! - **User-defined functions** - per-tile callbacks writing into typed result buffers
//! - **Merge semantics** - sum, replace (with overwrite detection) and custom merges
//! - **Local and distributed execution** - a rayon worker pool, or independent tasks on
//!   a cluster with retries and duplicate suppression
//! - **Streaming results** - an immutable snapshot after every merged partition
//! - **Shared kernel cache** - compile each kernel once per signature, across workers
//!   and processes
//!
//! ## Quick Start
//!
//! ```
//! use ironframe::prelude::*;
//! use ironframe::testing::{SumAllUdf, ones_dataset};
//!
//! # fn main() -> ironframe::Result<()> {
//! // 4x4 scan of 2x2 frames, all ones
//! let dataset = ones_dataset(&[4, 4, 2, 2], 2)?;
//!
//! let engine = Engine::new(EngineConfig {
//!     num_workers: 4,
//!     frames_per_partition: Some(4),
//!     ..Default::default()
//! })?;
//! let result = engine.run(dataset, vec![SumAllUdf::arc("sum")])?;
//! assert_eq!(result.buffer("sum", "total")?.values::<f64>()?, &[64.0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Datasets and partitions
//!
//! A [`Dataset`] exposes its [`DataSetMeta`] (shape, dtype, chunking hint) and raw
//! partition bytes. [`DatasetIndex`] splits it into [`PartitionDescriptor`]s that cover
//! every frame exactly once; each partition is further cut into tiles of whole frames.
//!
//! ### UDFs and buffers
//!
//! A [`Udf`] declares named [`BufferSpec`]s and folds tiles into task-local buffers.
//! The engine merges the buffers of every task into the global result:
//! - **sum** - elementwise addition
//! - **replace** - each element written by exactly one partition, a second write is an
//!   [`EngineError::ValueOverwrite`]
//! - **custom** - a user merge function, which must be associative and commutative
//!
//! ### Execution
//!
//! [`Engine::run`] blocks until the merged [`Snapshot`] is ready;
//! [`Engine::run_streaming`] returns a [`RunStream`] yielding one snapshot per merged
//! partition. The [`Backend`] picks the local pool or the cluster executor.
//!
//! ## Logging
//!
//! The engine logs through `tracing`. With the default `fmt-logging` feature,
//! [`logging::init`] installs a subscriber controlled by the `IRONFRAME_LOG`
//! environment variable.

pub mod buffer;
pub mod compile_cache;
pub mod config;
pub mod dataset;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ids;
pub mod index;
pub mod kernel;
#[cfg(feature = "fmt-logging")]
pub mod logging;
pub mod merge;
pub mod metrics;
pub mod pool;
pub mod shape;
pub mod task;
pub mod testing;
pub mod tiling;
pub mod udf;

// General re-exports
pub use buffer::{BufferData, BufferKind, BufferSet, BufferSpec, Extent, ResultBuffer};
pub use compile_cache::{CacheStats, CompileCache};
pub use config::{Backend, EngineConfig};
pub use dataset::{DataSetMeta, Dataset, DatasetReader, MemoryDataset, RawFileConfig, RawFileReader};
pub use dtype::DType;
pub use engine::{Engine, EngineBuilder, RunStream, run};
pub use error::{EngineError, Result};
pub use ids::{PartitionId, RunId};
pub use index::{DatasetIndex, PartitionDescriptor, PartitionOptions};
pub use kernel::{CompiledKernel, ExprCompiler, KernelCompiler, KernelSource};
pub use merge::{Snapshot, UdfResult};
pub use metrics::MetricsCollector;
pub use shape::{Shape, Slice};
pub use tiling::Tile;
pub use udf::{TaskContext, Udf};

/// The types needed to write UDFs and run them.
pub mod prelude {
    pub use crate::buffer::{BufferData, BufferSet, BufferSpec};
    pub use crate::config::{Backend, EngineConfig};
    pub use crate::dataset::{DataSetMeta, Dataset, MemoryDataset};
    pub use crate::dtype::DType;
    pub use crate::engine::{Engine, RunStream};
    pub use crate::error::{EngineError, Result};
    pub use crate::ids::PartitionId;
    pub use crate::index::{DatasetIndex, PartitionDescriptor};
    pub use crate::kernel::KernelSource;
    pub use crate::merge::Snapshot;
    pub use crate::shape::Shape;
    pub use crate::tiling::Tile;
    pub use crate::udf::{TaskContext, Udf};
}
