//! Tile-level delivery of partition data.
//!
//! A [`TilingScheme`] fixes how many frames go into one tile. [`PartitionData`] is a
//! read-only view of one partition's raw bytes; every call to
//! [`PartitionData::tiles`] starts a fresh, lazy pass over it, so iterating twice
//! yields the same tiles in the same order and never touches the dataset again.

use crate::dataset::DataSetMeta;
use crate::dtype::{DType, Element};
use crate::error::{EngineError, Result};
use crate::ids::PartitionId;
use crate::index::PartitionDescriptor;
use crate::shape::Slice;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Default tile size target: roughly an L2 cache worth of raw data.
pub const DEFAULT_TILE_BYTES: usize = 1 << 20;

/// Frames per tile for one partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilingScheme {
    /// Number of frames in one tile (the last tile may hold fewer).
    pub depth: usize,
    pub frame_bytes: usize,
}

impl TilingScheme {
    /// `depth = clamp(tile_bytes / frame_bytes, 1, partition_frames)`.
    #[must_use]
    pub fn for_partition(frame_bytes: usize, partition_frames: usize, tile_bytes: usize) -> Self {
        let depth = (tile_bytes / frame_bytes.max(1)).clamp(1, partition_frames.max(1));
        Self { depth, frame_bytes }
    }

    #[must_use]
    pub fn tile_bytes(&self) -> usize {
        self.depth * self.frame_bytes
    }

    /// Tile descriptors covering frames `start..end`, in order.
    pub fn tile_ranges(&self, start: usize, end: usize) -> impl Iterator<Item = TileDescriptor> {
        let depth = self.depth.max(1);
        (start..end)
            .step_by(depth)
            .enumerate()
            .map(move |(index, s)| TileDescriptor {
                index,
                start_frame: s,
                end_frame: (s + depth).min(end),
            })
    }
}

/// Position of a tile within its partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileDescriptor {
    /// Sequence number within the partition.
    pub index: usize,
    pub start_frame: usize,
    pub end_frame: usize,
}

impl TileDescriptor {
    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.end_frame - self.start_frame
    }
}

/// Read-only view of one partition's raw bytes.
pub struct PartitionData<'a> {
    descriptor: &'a PartitionDescriptor,
    meta: &'a DataSetMeta,
    raw: &'a [u8],
}

impl<'a> PartitionData<'a> {
    /// # Errors
    ///
    /// Returns [`EngineError::Read`] if `raw` does not hold exactly the partition's bytes.
    pub fn new(
        descriptor: &'a PartitionDescriptor,
        meta: &'a DataSetMeta,
        raw: &'a [u8],
    ) -> Result<Self> {
        if raw.len() != descriptor.byte_len {
            return Err(EngineError::Read {
                partition: descriptor.id,
                message: format!(
                    "partition data holds {} bytes, expected {}",
                    raw.len(),
                    descriptor.byte_len
                ),
            });
        }
        Ok(Self {
            descriptor,
            meta,
            raw,
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> &PartitionDescriptor {
        self.descriptor
    }

    /// Start a new pass over the tiles of this partition.
    #[must_use]
    pub fn tiles(&self) -> Tiles<'a> {
        Tiles {
            descriptor: self.descriptor,
            meta: self.meta,
            raw: self.raw,
            next: 0,
        }
    }
}

/// Lazy iterator over the tiles of one partition.
pub struct Tiles<'a> {
    descriptor: &'a PartitionDescriptor,
    meta: &'a DataSetMeta,
    raw: &'a [u8],
    next: usize,
}

impl<'a> Iterator for Tiles<'a> {
    type Item = Tile<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let depth = self.descriptor.tiling.depth.max(1);
        let start = self.descriptor.start_frame + self.next * depth;
        if start >= self.descriptor.end_frame {
            return None;
        }
        let end = (start + depth).min(self.descriptor.end_frame);
        let frame_bytes = self.meta.frame_bytes();
        let lo = (start - self.descriptor.start_frame) * frame_bytes;
        let hi = (end - self.descriptor.start_frame) * frame_bytes;
        let tile = Tile {
            partition: self.descriptor.id,
            descriptor: TileDescriptor {
                index: self.next,
                start_frame: start,
                end_frame: end,
            },
            slice: Slice::frames(start, end, self.meta.shape.sig()),
            sig_shape: self.meta.shape.sig(),
            dtype: self.meta.dtype,
            raw: &self.raw[lo..hi],
        };
        self.next += 1;
        Some(tile)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let depth = self.descriptor.tiling.depth.max(1);
        let total = self.descriptor.num_frames().div_ceil(depth);
        let left = total.saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Tiles<'_> {}

/// A run of whole frames handed to one `process_tile` call.
pub struct Tile<'a> {
    partition: PartitionId,
    descriptor: TileDescriptor,
    slice: Slice,
    sig_shape: &'a [usize],
    dtype: DType,
    raw: &'a [u8],
}

impl<'a> Tile<'a> {
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    #[must_use]
    pub fn descriptor(&self) -> TileDescriptor {
        self.descriptor
    }

    /// Region of this tile in flat-nav dataset coordinates.
    #[must_use]
    pub fn slice(&self) -> &Slice {
        &self.slice
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn sig_shape(&self) -> &[usize] {
        self.sig_shape
    }

    /// Global index of the first frame.
    #[must_use]
    pub fn start_frame(&self) -> usize {
        self.descriptor.start_frame
    }

    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.descriptor.num_frames()
    }

    /// Elements per frame.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        self.sig_shape.iter().product()
    }

    /// The raw little-endian bytes of this tile.
    #[must_use]
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    /// Iterate `(global_frame_index, raw_frame_bytes)`.
    pub fn frames(&self) -> impl Iterator<Item = (usize, &'a [u8])> + 'a {
        let start = self.descriptor.start_frame;
        let frame_bytes = self.frame_len() * self.dtype.size();
        self.raw
            .chunks_exact(frame_bytes.max(1))
            .enumerate()
            .map(move |(i, f)| (start + i, f))
    }

    /// Typed view of the tile. Borrows when the bytes are suitably aligned.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BufferMismatch`] if `T` does not match the dataset dtype.
    pub fn values<T: Element>(&self) -> Result<Cow<'a, [T]>> {
        if T::DTYPE != self.dtype {
            return Err(EngineError::BufferMismatch(format!(
                "tile holds {} values, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(match bytemuck::try_cast_slice::<u8, T>(self.raw) {
            Ok(v) => Cow::Borrowed(v),
            Err(_) => Cow::Owned(bytemuck::pod_collect_to_vec(self.raw)),
        })
    }

    /// Decode into `f64`, reusing `out`'s allocation.
    pub fn decode_f64_into(&self, out: &mut Vec<f64>) {
        out.clear();
        out.resize(self.raw.len() / self.dtype.size(), 0.0);
        self.dtype.decode_into_f64(self.raw, out);
    }

    #[must_use]
    pub fn to_f64(&self) -> Vec<f64> {
        let mut out = Vec::new();
        self.decode_f64_into(&mut out);
        out
    }

    #[must_use]
    pub fn to_f32(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.raw.len() / self.dtype.size()];
        self.dtype.decode_into_f32(self.raw, &mut out);
        out
    }
}
