//! Partitioning of a dataset into independently schedulable frame ranges.
//!
//! [`DatasetIndex::partition`] turns a dataset description and a size hint into an
//! ordered list of [`PartitionDescriptor`]s that cover every frame exactly once.
//! The result is a pure function of its inputs, so every worker (and every retry)
//! sees the same partitioning.
//!
//! Sizing rules:
//! - a partition is a run of whole frames on the flattened navigation axis
//! - frames per partition = `target_bytes / frame_bytes` (or an explicit override)
//! - with a native chunking hint, partitions are cut on chunk boundaries
//! - otherwise frames are spread evenly across `ceil(frames / per_partition)` parts

use crate::dataset::DataSetMeta;
use crate::error::{EngineError, Result};
use crate::ids::PartitionId;
use crate::shape::Slice;
use crate::tiling::{DEFAULT_TILE_BYTES, TileDescriptor, TilingScheme};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

/// Descriptor of one partition. Cheap to clone and serializable, so it can be
/// shipped to remote workers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub id: PartitionId,
    /// First frame (inclusive) on the flattened navigation axis.
    pub start_frame: usize,
    /// Last frame (exclusive).
    pub end_frame: usize,
    /// Region in flat-nav dataset coordinates.
    pub slice: Slice,
    /// Offset of the first byte within the dataset's raw data.
    pub byte_offset: usize,
    pub byte_len: usize,
    pub tiling: TilingScheme,
}

impl PartitionDescriptor {
    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.end_frame - self.start_frame
    }

    /// The ordered tile descriptors of this partition.
    pub fn tiles(&self) -> impl Iterator<Item = TileDescriptor> + '_ {
        self.tiling.tile_ranges(self.start_frame, self.end_frame)
    }
}

impl Display for PartitionDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(
            f,
            "<Partition {} frames {}..{}>",
            self.id, self.start_frame, self.end_frame
        )
    }
}

/// Knobs for [`DatasetIndex::partition_with`].
#[derive(Clone, Debug)]
pub struct PartitionOptions {
    /// Target working-set size of one partition in bytes.
    pub target_bytes: usize,
    /// Overrides the byte heuristic with a fixed number of frames per partition.
    pub frames_per_partition: Option<usize>,
    /// Target size of one tile in bytes.
    pub tile_bytes: usize,
}

impl PartitionOptions {
    #[must_use]
    pub fn new(target_bytes: usize) -> Self {
        Self {
            target_bytes,
            frames_per_partition: None,
            tile_bytes: DEFAULT_TILE_BYTES,
        }
    }
}

/// Deterministic partitioner.
pub struct DatasetIndex;

impl DatasetIndex {
    /// Partition `meta` so that each partition holds at most `target_partition_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DatasetShape`] if the dataset is empty or a single frame
    /// (the minimum viable tile) is larger than the size hint.
    pub fn partition(
        meta: &DataSetMeta,
        target_partition_size: usize,
    ) -> Result<Vec<PartitionDescriptor>> {
        Self::partition_with(meta, &PartitionOptions::new(target_partition_size))
    }

    /// Partition `meta` according to `opts`.
    ///
    /// # Errors
    ///
    /// See [`DatasetIndex::partition`].
    pub fn partition_with(
        meta: &DataSetMeta,
        opts: &PartitionOptions,
    ) -> Result<Vec<PartitionDescriptor>> {
        let frames = meta.num_frames();
        let frame_bytes = meta.frame_bytes();
        if frames == 0 || frame_bytes == 0 {
            return Err(EngineError::DatasetShape(format!(
                "cannot partition empty dataset {}",
                meta.shape
            )));
        }

        let per_partition = match opts.frames_per_partition {
            Some(0) => {
                return Err(EngineError::DatasetShape(
                    "frames_per_partition must be at least 1".to_string(),
                ));
            }
            Some(n) => n,
            None => {
                if opts.target_bytes < frame_bytes {
                    return Err(EngineError::DatasetShape(format!(
                        "partition size hint of {} bytes is below one frame ({frame_bytes} bytes)",
                        opts.target_bytes
                    )));
                }
                opts.target_bytes / frame_bytes
            }
        }
        .min(frames);

        let bounds = match meta.chunk_frames.filter(|c| *c > 0 && per_partition >= *c) {
            Some(chunk) => fixed_bounds(frames, per_partition / chunk * chunk),
            None if opts.frames_per_partition.is_some() => fixed_bounds(frames, per_partition),
            None => balanced_bounds(frames, per_partition),
        };

        if u32::try_from(bounds.len()).is_err() {
            return Err(EngineError::DatasetShape(format!(
                "{} partitions exceed the supported maximum",
                bounds.len()
            )));
        }

        let sig = meta.shape.sig();
        let parts = bounds
            .into_iter()
            .enumerate()
            .map(|(i, (start, end))| {
                #[allow(clippy::cast_possible_truncation)]
                let id = PartitionId::new(i as u32);
                PartitionDescriptor {
                    id,
                    start_frame: start,
                    end_frame: end,
                    slice: Slice::frames(start, end, sig),
                    byte_offset: start * frame_bytes,
                    byte_len: (end - start) * frame_bytes,
                    tiling: TilingScheme::for_partition(frame_bytes, end - start, opts.tile_bytes),
                }
            })
            .collect();
        Ok(parts)
    }
}

/// Cut `frames` into runs of exactly `step` (the last may be shorter).
fn fixed_bounds(frames: usize, step: usize) -> Vec<(usize, usize)> {
    (0..frames)
        .step_by(step)
        .map(|start| (start, (start + step).min(frames)))
        .collect()
}

/// Spread `frames` evenly so that no run is longer than `max_per_part`.
fn balanced_bounds(frames: usize, max_per_part: usize) -> Vec<(usize, usize)> {
    let n = frames.div_ceil(max_per_part);
    (0..n)
        .map(|i| (i * frames / n, (i + 1) * frames / n))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_bounds_cover_everything() {
        let b = balanced_bounds(10, 3);
        assert_eq!(b, vec![(0, 2), (2, 5), (5, 7), (7, 10)]);
        assert!(b.iter().all(|(s, e)| e - s <= 3));
    }

    #[test]
    fn fixed_bounds_last_run_is_short() {
        assert_eq!(fixed_bounds(7, 3), vec![(0, 3), (3, 6), (6, 7)]);
    }
}
