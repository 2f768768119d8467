//! Tests for buffer merging.

use anyhow::Result;
use ironframe::buffer::{BufferSet, BufferSpec};
use ironframe::dataset::DataSetMeta;
use ironframe::index::{DatasetIndex, PartitionDescriptor, PartitionOptions};
use ironframe::merge::{MergeStatus, ResultMerger};
use ironframe::{DType, EngineError, Shape};


/// 6 frames of 2x2 f32, split into 3 partitions of 2 frames.
fn layout() -> (DataSetMeta, Vec<PartitionDescriptor>) {
    let meta = DataSetMeta::new(Shape::new([6, 2, 2], 2).unwrap(), DType::F32);
    let opts = PartitionOptions {
        frames_per_partition: Some(2),
        ..PartitionOptions::new(1 << 20)
    };
    let parts = DatasetIndex::partition_with(&meta, &opts).unwrap();
    (meta, parts)
}

fn merger(specs: Vec<BufferSpec>, meta: &DataSetMeta, parts: usize) -> ResultMerger {
    ResultMerger::new(vec![("udf".to_string(), specs)], meta, parts).unwrap()
}

#[test]
fn test_sum_buffers_add_up() -> Result<()> {
    let (meta, parts) = layout();
    let specs = vec![BufferSpec::sum("acc", [2], DType::F64)];
    let mut m = merger(specs.clone(), &meta, parts.len());

    for (i, p) in parts.iter().enumerate() {
        let mut set = BufferSet::for_task(&specs, p)?;
        set.get_mut("acc")?.values_mut::<f64>()?.copy_from_slice(&[1.0, i as f64]);
        assert_eq!(m.accept(p.id, &[set])?, MergeStatus::Merged);
    }
    let result = m.finish()?;
    assert_eq!(result.buffer("udf", "acc")?.values::<f64>()?, &[3.0, 3.0]);
    assert!(result.is_complete());
    Ok(())
}

#[test]
fn test_merge_order_does_not_matter_for_sums() -> Result<()> {
    let (meta, parts) = layout();
    let specs = vec![BufferSpec::sum("n", [], DType::U64)];
    let run = |order: &[usize]| -> Result<Vec<u64>> {
        let mut m = merger(specs.clone(), &meta, parts.len());
        for &i in order {
            let mut set = BufferSet::for_task(&specs, &parts[i])?;
            set.get_mut("n")?.values_mut::<u64>()?[0] = 10u64.pow(i as u32);
            m.accept(parts[i].id, &[set])?;
        }
        Ok(m.finish()?.buffer("udf", "n")?.values::<u64>()?.to_vec())
    };
    assert_eq!(run(&[0, 1, 2])?, vec![111]);
    assert_eq!(run(&[2, 0, 1])?, run(&[1, 2, 0])?);
    Ok(())
}

#[test]
fn test_duplicate_partition_is_dropped() -> Result<()> {
    let (meta, parts) = layout();
    let specs = vec![BufferSpec::sum("acc", [], DType::F64)];
    let mut m = merger(specs.clone(), &meta, parts.len());

    let mut set = BufferSet::for_task(&specs, &parts[1])?;
    set.get_mut("acc")?.values_mut::<f64>()?[0] = 5.0;
    assert_eq!(m.accept(parts[1].id, &[set.clone()])?, MergeStatus::Merged);
    assert_eq!(m.accept(parts[1].id, &[set])?, MergeStatus::Duplicate);

    let snapshot = m.snapshot();
    assert_eq!(snapshot.partitions_merged(), 1);
    assert_eq!(snapshot.buffer("udf", "acc")?.values::<f64>()?, &[5.0]);
    assert!(m.is_merged(parts[1].id));
    assert!(!m.is_merged(parts[0].id));
    Ok(())
}

#[test]
fn test_per_frame_replace_buffers_fill_their_rows() -> Result<()> {
    let (meta, parts) = layout();
    let specs = vec![BufferSpec::replace("row", [2], DType::F32).per_frame()];
    let mut m = merger(specs.clone(), &meta, parts.len());

    for p in parts.iter().rev() {
        let mut set = BufferSet::for_task(&specs, p)?;
        let buf = set.get_mut("row")?;
        assert_eq!(buf.shape(), &[2, 2]);
        for frame in p.start_frame..p.end_frame {
            buf.frame_mut::<f32>(frame)?.copy_from_slice(&[frame as f32, -(frame as f32)]);
        }
        m.accept(p.id, &[set])?;
    }
    let result = m.finish()?;
    let row = result.buffer("udf", "row")?;
    assert_eq!(row.shape(), &[6, 2]);
    assert_eq!(
        row.values::<f32>()?,
        &[0.0, -0.0, 1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0, 5.0, -5.0]
    );
    assert!(row.written().unwrap().iter().all(|w| *w));
    Ok(())
}

#[test]
fn test_overlapping_replace_is_an_error() -> Result<()> {
    let (meta, parts) = layout();
    let specs = vec![BufferSpec::replace("out", [4], DType::F64)];
    let mut m = merger(specs.clone(), &meta, parts.len());

    let mut a = BufferSet::for_task(&specs, &parts[0])?;
    a.get_mut("out")?.set(1, 1.0f64)?;
    let mut b = BufferSet::for_task(&specs, &parts[1])?;
    b.get_mut("out")?.set(2, 2.0f64)?;
    let mut c = BufferSet::for_task(&specs, &parts[2])?;
    c.get_mut("out")?.set(1, 3.0f64)?;

    m.accept(parts[0].id, &[a])?;
    m.accept(parts[1].id, &[b])?;
    let err = m.accept(parts[2].id, &[c]).unwrap_err();
    match err {
        EngineError::ValueOverwrite { udf, buffer, index, partition } => {
            assert_eq!((udf.as_str(), buffer.as_str(), index), ("udf", "out", 1));
            assert_eq!(partition, parts[2].id);
        }
        other => panic!("expected ValueOverwrite, got {other}"),
    }
    // The failed merge left the state untouched.
    let snapshot = m.snapshot();
    assert_eq!(snapshot.partitions_merged(), 2);
    assert_eq!(snapshot.buffer("udf", "out")?.values::<f64>()?, &[0.0, 1.0, 2.0, 0.0]);
    Ok(())
}

#[test]
fn test_untouched_replace_elements_keep_their_fill() -> Result<()> {
    let (meta, parts) = layout();
    let specs = vec![BufferSpec::replace("out", [3], DType::I64).with_fill(-1.0)];
    let mut m = merger(specs.clone(), &meta, parts.len());
    for (i, p) in parts.iter().enumerate() {
        let mut set = BufferSet::for_task(&specs, p)?;
        if i != 1 {
            set.get_mut("out")?.set(i, i as i64 * 10)?;
        }
        m.accept(p.id, &[set])?;
    }
    let result = m.finish()?;
    assert_eq!(result.buffer("udf", "out")?.values::<i64>()?, &[0, -1, 20]);
    Ok(())
}

#[test]
fn test_custom_merge_function() -> Result<()> {
    let (meta, parts) = layout();
    let specs = vec![BufferSpec::custom("max", [2], DType::F64, |acc, incoming| {
        let (Some(acc), Some(incoming)) = (acc.as_f64_mut(), incoming.as_f64()) else {
            anyhow::bail!("wrong dtype");
        };
        for (a, v) in acc.iter_mut().zip(incoming) {
            *a = a.max(*v);
        }
        Ok(())
    })];
    let mut m = merger(specs.clone(), &meta, parts.len());
    let values = [[-5.0, 1.0], [-7.0, 9.0], [-6.0, 3.0]];
    for (p, v) in parts.iter().zip(values) {
        let mut set = BufferSet::for_task(&specs, p)?;
        set.get_mut("max")?.values_mut::<f64>()?.copy_from_slice(&v);
        m.accept(p.id, &[set])?;
    }
    // The first partition is taken as is, so negative maxima survive.
    assert_eq!(m.finish()?.buffer("udf", "max")?.values::<f64>()?, &[-5.0, 9.0]);
    Ok(())
}

#[test]
fn test_failing_custom_merge_is_a_udf_error() -> Result<()> {
    let (meta, parts) = layout();
    let specs = vec![BufferSpec::custom("bad", [], DType::F64, |_, _| {
        Err(anyhow::anyhow!("cannot merge"))
    })];
    let mut m = merger(specs.clone(), &meta, parts.len());
    m.accept(parts[0].id, &[BufferSet::for_task(&specs, &parts[0])?])?;
    let err = m
        .accept(parts[1].id, &[BufferSet::for_task(&specs, &parts[1])?])
        .unwrap_err();
    assert!(matches!(err, EngineError::UdfUser { .. }), "{err}");
    assert!(!err.is_transient());
    Ok(())
}

#[test]
fn test_panicking_custom_merge_is_a_udf_error() -> Result<()> {
    let (meta, parts) = layout();
    let specs = vec![BufferSpec::custom("boom", [], DType::F64, |_, _| panic!("merge exploded"))];
    let mut m = merger(specs.clone(), &meta, parts.len());
    m.accept(parts[0].id, &[BufferSet::for_task(&specs, &parts[0])?])?;
    let err = m
        .accept(parts[1].id, &[BufferSet::for_task(&specs, &parts[1])?])
        .unwrap_err();
    assert!(err.to_string().contains("merge exploded"), "{err}");
    assert!(matches!(err, EngineError::UdfUser { .. }));
    Ok(())
}

#[test]
fn test_mismatched_buffer_is_rejected() -> Result<()> {
    let (meta, parts) = layout();
    let declared = vec![BufferSpec::sum("acc", [2], DType::F64)];
    let produced = vec![BufferSpec::sum("acc", [3], DType::F64)];
    let mut m = merger(declared, &meta, parts.len());
    let err = m
        .accept(parts[0].id, &[BufferSet::for_task(&produced, &parts[0])?])
        .unwrap_err();
    assert!(matches!(err, EngineError::BufferMismatch(_)));
    Ok(())
}

#[test]
fn test_snapshots_are_immutable() -> Result<()> {
    let (meta, parts) = layout();
    let specs = vec![BufferSpec::sum("acc", [], DType::F64)];
    let mut m = merger(specs.clone(), &meta, parts.len());

    let mut set = BufferSet::for_task(&specs, &parts[0])?;
    set.get_mut("acc")?.values_mut::<f64>()?[0] = 1.5;
    m.accept(parts[0].id, &[set.clone()])?;
    let early = m.snapshot();
    m.accept(parts[1].id, &[set])?;

    assert_approx_eq!(early.buffer("udf", "acc")?.values::<f64>()?[0], 1.5);
    assert_approx_eq!(early.progress(), 1.0 / 3.0);
    assert_approx_eq!(m.snapshot().buffer("udf", "acc")?.values::<f64>()?[0], 3.0);
    Ok(())
}

#[test]
fn test_finish_requires_every_partition() -> Result<()> {
    let (meta, parts) = layout();
    let specs = vec![BufferSpec::sum("acc", [], DType::F64)];
    let mut m = merger(specs.clone(), &meta, parts.len());
    m.accept(parts[0].id, &[BufferSet::for_task(&specs, &parts[0])?])?;
    assert!(m.finish().is_err());
    Ok(())
}

#[test]
fn test_invalid_buffer_specs_are_rejected() {
    let (meta, parts) = layout();
    let bad_dtype = vec![BufferSpec::sum("acc", [], DType::U8)];
    assert!(matches!(
        ResultMerger::new(vec![("udf".into(), bad_dtype)], &meta, parts.len()),
        Err(EngineError::Config(_))
    ));
    let per_frame_custom = vec![BufferSpec::custom("c", [], DType::F64, |_, _| Ok(())).per_frame()];
    assert!(matches!(
        ResultMerger::new(vec![("udf".into(), per_frame_custom)], &meta, parts.len()),
        Err(EngineError::Config(_))
    ));
    // Every task would add its fill into the result.
    let filled_sum = vec![BufferSpec::sum("acc", [], DType::F64).with_fill(1.0)];
    assert!(matches!(
        ResultMerger::new(vec![("udf".into(), filled_sum.clone())], &meta, parts.len()),
        Err(EngineError::Config(_))
    ));
    assert!(matches!(BufferSet::for_task(&filled_sum, &parts[0]), Err(EngineError::Config(_))));
}

#[test]
fn test_integer_sum_overflow_leaves_the_result_untouched() -> Result<()> {
    let (meta, parts) = layout();
    let floats = vec![BufferSpec::sum("acc", [], DType::F64)];
    let counts = vec![BufferSpec::sum("count", [], DType::U64)];
    let mut m = ResultMerger::new(
        vec![("a".to_string(), floats.clone()), ("b".to_string(), counts.clone())],
        &meta,
        parts.len(),
    )?;
    let sets = |value: u64, p: &PartitionDescriptor| -> Result<Vec<BufferSet>> {
        let mut a = BufferSet::for_task(&floats, p)?;
        a.get_mut("acc")?.values_mut::<f64>()?[0] = 1.0;
        let mut b = BufferSet::for_task(&counts, p)?;
        b.get_mut("count")?.values_mut::<u64>()?[0] = value;
        Ok(vec![a, b])
    };

    m.accept(parts[0].id, &sets(u64::MAX, &parts[0])?)?;
    let err = m.accept(parts[1].id, &sets(1, &parts[1])?).unwrap_err();
    assert!(matches!(err, EngineError::BufferMismatch(ref msg) if msg.contains("overflow")), "{err}");

    // Neither UDF saw the rejected partition.
    assert!(!m.is_merged(parts[1].id));
    let snapshot = m.snapshot();
    assert_approx_eq!(snapshot.buffer("a", "acc")?.values::<f64>()?[0], 1.0);
    assert_eq!(snapshot.buffer("b", "count")?.values::<u64>()?, &[u64::MAX]);

    // A sum that fits still merges.
    m.accept(parts[1].id, &sets(0, &parts[1])?)?;
    assert_approx_eq!(m.snapshot().buffer("a", "acc")?.values::<f64>()?[0], 2.0);
    Ok(())
}
