//! Tests for partitioning and tiling.

use anyhow::Result;
use ironframe::dataset::DataSetMeta;
use ironframe::index::{DatasetIndex, PartitionOptions};
use ironframe::testing::{assert_partitions_cover, ones_dataset, ramp_dataset};
use ironframe::tiling::PartitionData;
use ironframe::{DType, EngineError, Shape};


/// 10 frames of 8x8 f32 (256 bytes each).
fn meta_10_frames() -> DataSetMeta {
    DataSetMeta::new(Shape::new([10, 8, 8], 2).unwrap(), DType::F32)
}

fn bounds(parts: &[ironframe::PartitionDescriptor]) -> Vec<(usize, usize)> {
    parts.iter().map(|p| (p.start_frame, p.end_frame)).collect()
}

#[test]
fn test_partitions_cover_dataset() -> Result<()> {
    let meta = meta_10_frames();
    let parts = DatasetIndex::partition(&meta, 3 * 256)?;
    assert_partitions_cover(&parts, 10);
    assert_eq!(bounds(&parts), vec![(0, 2), (2, 5), (5, 7), (7, 10)]);
    assert!(parts.iter().all(|p| p.byte_len <= 3 * 256));
    Ok(())
}

#[test]
fn test_partitioning_is_deterministic() -> Result<()> {
    let meta = meta_10_frames();
    let a = DatasetIndex::partition(&meta, 1000)?;
    let b = DatasetIndex::partition(&meta, 1000)?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_single_partition_when_hint_is_large() -> Result<()> {
    let parts = DatasetIndex::partition(&meta_10_frames(), 1 << 30)?;
    assert_eq!(bounds(&parts), vec![(0, 10)]);
    assert_eq!(parts[0].byte_len, 10 * 256);
    Ok(())
}

#[test]
fn test_chunk_boundaries_are_respected() -> Result<()> {
    let meta = meta_10_frames().with_chunk_frames(4);
    let parts = DatasetIndex::partition(&meta, 9 * 256)?;
    assert_eq!(bounds(&parts), vec![(0, 8), (8, 10)]);
    assert_partitions_cover(&parts, 10);
    Ok(())
}

#[test]
fn test_fixed_frames_per_partition() -> Result<()> {
    let opts = PartitionOptions {
        frames_per_partition: Some(3),
        ..PartitionOptions::new(1 << 20)
    };
    let parts = DatasetIndex::partition_with(&meta_10_frames(), &opts)?;
    assert_eq!(bounds(&parts), vec![(0, 3), (3, 6), (6, 9), (9, 10)]);
    assert_eq!(parts[3].byte_offset, 9 * 256);
    Ok(())
}

#[test]
fn test_frame_larger_than_hint_is_rejected() {
    let err = DatasetIndex::partition(&meta_10_frames(), 100).unwrap_err();
    assert!(matches!(err, EngineError::DatasetShape(_)), "{err}");
}

#[test]
fn test_empty_dataset_is_rejected() {
    let meta = DataSetMeta::new(Shape::new([0, 8, 8], 2).unwrap(), DType::F32);
    let err = DatasetIndex::partition(&meta, 1 << 20).unwrap_err();
    assert!(matches!(err, EngineError::DatasetShape(_)));
}

#[test]
fn test_multi_dimensional_nav_is_flattened() -> Result<()> {
    let ds = ones_dataset(&[3, 5, 2, 2], 2)?;
    let parts = DatasetIndex::partition(ds.meta(), 4 * 16)?;
    assert_partitions_cover(&parts, 15);
    assert!(parts.iter().all(|p| p.num_frames() <= 4));
    Ok(())
}

#[test]
fn test_tiles_follow_tile_size_hint() -> Result<()> {
    let meta = meta_10_frames();
    let opts = PartitionOptions {
        frames_per_partition: Some(5),
        tile_bytes: 2 * 256,
        ..PartitionOptions::new(1 << 20)
    };
    let parts = DatasetIndex::partition_with(&meta, &opts)?;
    let tiles: Vec<_> = parts[1].tiles().map(|t| (t.index, t.start_frame, t.end_frame)).collect();
    assert_eq!(tiles, vec![(0, 5, 7), (1, 7, 9), (2, 9, 10)]);
    Ok(())
}

#[test]
fn test_tiny_tile_hint_still_yields_whole_frames() -> Result<()> {
    let opts = PartitionOptions {
        tile_bytes: 1,
        ..PartitionOptions::new(1 << 20)
    };
    let parts = DatasetIndex::partition_with(&meta_10_frames(), &opts)?;
    assert_eq!(parts[0].tiling.depth, 1);
    assert_eq!(parts[0].tiles().count(), 10);
    Ok(())
}

#[test]
fn test_tile_iteration_is_repeatable() -> Result<()> {
    let ds = ramp_dataset(&[6, 2, 2], 2)?;
    let opts = PartitionOptions {
        frames_per_partition: Some(3),
        tile_bytes: 2 * 16,
        ..PartitionOptions::new(1 << 20)
    };
    let parts = DatasetIndex::partition_with(ds.meta(), &opts)?;
    let raw = ds.get_partition_data(&parts[1])?;
    let data = PartitionData::new(&parts[1], ds.meta(), &raw)?;

    let first: Vec<Vec<f32>> = data.tiles().map(|t| t.to_f32()).collect();
    let second: Vec<Vec<f32>> = data.tiles().map(|t| t.to_f32()).collect();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    // Frames 3..6 of a ramp with 4 elements per frame.
    assert_eq!(first[0], (12..20).map(|v| v as f32).collect::<Vec<_>>());
    assert_eq!(first[1], (20..24).map(|v| v as f32).collect::<Vec<_>>());

    let tile = data.tiles().nth(1).unwrap();
    assert_eq!(tile.start_frame(), 5);
    assert_eq!(tile.num_frames(), 1);
    assert_eq!(tile.frame_len(), 4);
    assert_approx_eq!(tile.to_f64().iter().sum::<f64>(), 86.0);
    Ok(())
}

#[test]
fn test_partition_data_rejects_wrong_length() -> Result<()> {
    let ds = ones_dataset(&[4, 2, 2], 2)?;
    let parts = DatasetIndex::partition(ds.meta(), 1 << 20)?;
    let short = vec![0u8; 3];
    let err = PartitionData::new(&parts[0], ds.meta(), &short).err().unwrap();
    assert!(err.is_transient());
    Ok(())
}

#[test]
fn test_typed_tile_view_checks_dtype() -> Result<()> {
    let ds = ones_dataset(&[2, 2, 2], 2)?;
    let parts = DatasetIndex::partition(ds.meta(), 1 << 20)?;
    let raw = ds.get_partition_data(&parts[0])?;
    let data = PartitionData::new(&parts[0], ds.meta(), &raw)?;
    let tile = data.tiles().next().unwrap();
    assert_eq!(&*tile.values::<f32>()?, &[1.0f32; 8]);
    assert!(matches!(tile.values::<u16>(), Err(EngineError::BufferMismatch(_))));
    Ok(())
}
