//! Testing utilities for engine users and for this crate's own tests.
//!
//! - [`fixtures`]: small in-memory datasets, a dataset that fails reads on demand and
//!   a compiler that counts its invocations
//! - [`udfs`]: reference UDFs covering every buffer kind and failure mode
//! - [`assertions`]: comparisons of run results and partition layouts
//!
//! # Example
//!
//! ```
//! use ironframe::prelude::*;
//! use ironframe::testing::{FrameSumUdf, assert_partitions_cover, ones_dataset, test_config};
//!
//! # fn main() -> ironframe::Result<()> {
//! let dataset = ones_dataset(&[4, 4], 1)?;
//! let config = test_config(2, 2);
//! assert_partitions_cover(&DatasetIndex::partition_with(dataset.meta(), &config.partition_options())?, 4);
//!
//! let result = Engine::new(config)?.run(dataset, vec![FrameSumUdf::arc("frames")])?;
//! assert_eq!(result.buffer("frames", "intensity")?.values::<f64>()?, &[4.0; 4]);
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod fixtures;
pub mod udfs;

pub use assertions::*;
pub use fixtures::*;
pub use udfs::*;
