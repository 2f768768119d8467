//! The dataset-reader interface consumed by the engine, plus two reference readers.
//!
//! Concrete detector formats live outside this crate. They plug in by implementing
//! [`Dataset`] (metadata plus raw partition bytes) and, optionally, a
//! [`DatasetReader`] that opens a dataset from its own configuration type.
//!
//! - [`MemoryDataset`] keeps the raw bytes in memory (tests, small acquisitions)
//! - [`RawFileDataset`] reads a flat little-endian binary file with a header offset

use crate::dtype::{DType, Element};
use crate::error::{EngineError, Result};
use crate::index::PartitionDescriptor;
use crate::shape::Shape;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

/// Immutable description of a dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetMeta {
    pub shape: Shape,
    pub dtype: DType,
    /// Native chunking hint: number of frames stored together by the source.
    pub chunk_frames: Option<usize>,
}

impl DataSetMeta {
    #[must_use]
    pub fn new(shape: Shape, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            chunk_frames: None,
        }
    }

    #[must_use]
    pub fn with_chunk_frames(mut self, frames: usize) -> Self {
        self.chunk_frames = Some(frames);
        self
    }

    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.shape.nav_size()
    }

    /// Size of one frame in bytes.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.shape.sig_size() * self.dtype.size()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.num_frames() * self.frame_bytes()
    }
}

/// A dataset the engine can partition and read.
///
/// Implementations must be safe to read from many workers at once; reads never
/// mutate dataset state.
pub trait Dataset: Send + Sync {
    fn meta(&self) -> &DataSetMeta;

    /// Raw little-endian bytes of the frames covered by `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Read`] (transient) if the data cannot be fetched.
    fn get_partition_data(&self, partition: &PartitionDescriptor) -> Result<Vec<u8>>;

    /// Read the partition into a caller-provided buffer of exactly
    /// `partition.byte_len` bytes. The default copies from
    /// [`get_partition_data`](Dataset::get_partition_data).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Read`] if the data cannot be fetched or has the wrong size.
    fn read_partition_into(&self, partition: &PartitionDescriptor, out: &mut [u8]) -> Result<()> {
        let data = self.get_partition_data(partition)?;
        if data.len() != out.len() {
            return Err(EngineError::Read {
                partition: partition.id,
                message: format!("expected {} bytes, got {}", out.len(), data.len()),
            });
        }
        out.copy_from_slice(&data);
        Ok(())
    }
}

/// Opens datasets from a reader-specific configuration.
pub trait DatasetReader {
    type Config;

    /// # Errors
    ///
    /// Returns an error if the dataset cannot be opened or its layout is invalid.
    fn open(&self, config: &Self::Config) -> Result<Arc<dyn Dataset>>;
}

/* ===================== MemoryDataset ===================== */

/// A dataset held entirely in memory.
pub struct MemoryDataset {
    meta: DataSetMeta,
    raw: Arc<[u8]>,
}

impl MemoryDataset {
    /// # Errors
    ///
    /// Returns [`EngineError::DatasetShape`] if `raw` does not match the shape.
    pub fn from_raw(meta: DataSetMeta, raw: Vec<u8>) -> Result<Self> {
        if raw.len() != meta.total_bytes() {
            return Err(EngineError::DatasetShape(format!(
                "{} raw bytes do not match shape {} of {} ({} bytes expected)",
                raw.len(),
                meta.shape,
                meta.dtype,
                meta.total_bytes()
            )));
        }
        Ok(Self {
            meta,
            raw: raw.into(),
        })
    }

    /// Build from typed values; the dtype follows `T`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DatasetShape`] if the value count does not match the shape.
    pub fn from_values<T: Element>(shape: Shape, values: &[T]) -> Result<Self> {
        Self::from_raw(DataSetMeta::new(shape, T::DTYPE), T::to_le_bytes_vec(values))
    }

    #[must_use]
    pub fn with_chunk_frames(mut self, frames: usize) -> Self {
        self.meta.chunk_frames = Some(frames);
        self
    }

    #[must_use]
    pub fn into_arc(self) -> Arc<dyn Dataset> {
        Arc::new(self)
    }

    fn range(&self, partition: &PartitionDescriptor) -> Result<&[u8]> {
        self.raw
            .get(partition.byte_offset..partition.byte_offset + partition.byte_len)
            .ok_or_else(|| EngineError::Read {
                partition: partition.id,
                message: "byte range outside dataset".to_string(),
            })
    }
}

impl Dataset for MemoryDataset {
    fn meta(&self) -> &DataSetMeta {
        &self.meta
    }

    fn get_partition_data(&self, partition: &PartitionDescriptor) -> Result<Vec<u8>> {
        Ok(self.range(partition)?.to_vec())
    }

    fn read_partition_into(&self, partition: &PartitionDescriptor, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self.range(partition)?);
        Ok(())
    }
}

/* ===================== RawFileDataset ===================== */

/// Configuration of a flat binary file: frames stored back to back after `offset`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawFileConfig {
    pub path: PathBuf,
    pub shape: Vec<usize>,
    pub sig_dims: usize,
    pub dtype: DType,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub chunk_frames: Option<usize>,
}

/// A dataset backed by a raw binary file.
pub struct RawFileDataset {
    meta: DataSetMeta,
    path: PathBuf,
    offset: u64,
}

impl Dataset for RawFileDataset {
    fn meta(&self) -> &DataSetMeta {
        &self.meta
    }

    fn get_partition_data(&self, partition: &PartitionDescriptor) -> Result<Vec<u8>> {
        let mut out = vec![0u8; partition.byte_len];
        self.read_partition_into(partition, &mut out)?;
        Ok(out)
    }

    fn read_partition_into(&self, partition: &PartitionDescriptor, out: &mut [u8]) -> Result<()> {
        let read_err = |e: std::io::Error| EngineError::Read {
            partition: partition.id,
            message: format!("{}: {e}", self.path.display()),
        };
        let mut file = File::open(&self.path).map_err(read_err)?;
        file.seek(SeekFrom::Start(self.offset + partition.byte_offset as u64))
            .map_err(read_err)?;
        file.read_exact(out).map_err(read_err)
    }
}

/// Opens [`RawFileDataset`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawFileReader;

impl DatasetReader for RawFileReader {
    type Config = RawFileConfig;

    fn open(&self, config: &RawFileConfig) -> Result<Arc<dyn Dataset>> {
        let shape = Shape::new(config.shape.clone(), config.sig_dims)?;
        let meta = DataSetMeta {
            shape,
            dtype: config.dtype,
            chunk_frames: config.chunk_frames,
        };
        let len = std::fs::metadata(&config.path)?.len();
        let needed = config.offset + meta.total_bytes() as u64;
        if len < needed {
            return Err(EngineError::DatasetShape(format!(
                "{} holds {len} bytes, shape {} needs {needed}",
                config.path.display(),
                meta.shape
            )));
        }
        Ok(Arc::new(RawFileDataset {
            meta,
            path: config.path.clone(),
            offset: config.offset,
        }))
    }
}
