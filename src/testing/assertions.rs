//! Assertions over run results and partition layouts.
//!
//! All of them panic with a message that names the offending UDF, buffer or
//! partition, so failures are readable straight from test output.

use crate::buffer::BufferData;
use crate::index::PartitionDescriptor;
use crate::merge::Snapshot;

/// Assert that two snapshots hold the same UDFs and buffers with bit-identical data.
///
/// Floating-point values are compared by bit pattern, so `NaN`s compare equal to
/// themselves and `0.0` differs from `-0.0`.
///
/// # Panics
///
/// Panics on the first UDF, buffer, shape or element that differs.
pub fn assert_snapshots_identical(actual: &Snapshot, expected: &Snapshot) {
    let names = |s: &Snapshot| s.results().iter().map(|r| r.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(actual), names(expected), "UDF lists differ");

    for (a, e) in actual.results().iter().zip(expected.results()) {
        let a_names: Vec<_> = a.buffers.names().collect();
        let e_names: Vec<_> = e.buffers.names().collect();
        assert_eq!(a_names, e_names, "buffer lists of UDF '{}' differ", a.name);

        for ((name, ab), (_, eb)) in a.buffers.iter().zip(e.buffers.iter()) {
            assert_eq!(
                ab.shape(),
                eb.shape(),
                "shape mismatch in {}/{name}",
                a.name
            );
            if let Some(i) = first_difference(ab.data(), eb.data()) {
                panic!(
                    "{}/{name} differs at element {i}:\n  Expected: {:?}\n  Actual: {:?}",
                    a.name,
                    eb.data().get_f64(i),
                    ab.data().get_f64(i)
                );
            }
        }
    }
}

/// Index of the first element whose bits differ, or the shorter length if the
/// lengths differ.
fn first_difference(a: &BufferData, b: &BufferData) -> Option<usize> {
    fn diff<T: PartialEq>(a: &[T], b: &[T]) -> Option<usize> {
        a.iter()
            .zip(b)
            .position(|(x, y)| x != y)
            .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
    }
    match (a, b) {
        (BufferData::F32(a), BufferData::F32(b)) => {
            diff(&bits(a, |v| u64::from(v.to_bits())), &bits(b, |v| u64::from(v.to_bits())))
        }
        (BufferData::F64(a), BufferData::F64(b)) => diff(&bits(a, f64::to_bits), &bits(b, f64::to_bits)),
        (BufferData::I64(a), BufferData::I64(b)) => diff(a, b),
        (BufferData::U64(a), BufferData::U64(b)) => diff(a, b),
        _ => Some(0),
    }
}

fn bits<T: Copy>(values: &[T], f: impl Fn(T) -> u64) -> Vec<u64> {
    values.iter().map(|v| f(*v)).collect()
}

/// Assert that `actual` matches `expected` within `epsilon` per element.
///
/// # Panics
///
/// Panics if the lengths differ or any element is further than `epsilon` away.
pub fn assert_values_approx_eq(actual: &[f64], expected: &[f64], epsilon: f64) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch:\n  Expected: {expected:?}\n  Actual: {actual:?}"
    );
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= epsilon,
            "mismatch at index {i}: expected {e}, got {a} (epsilon {epsilon})"
        );
    }
}

/// Assert that `partitions` cover frames `0..num_frames` exactly once, in order,
/// with sequential ids and contiguous byte ranges.
///
/// # Panics
///
/// Panics on the first gap, overlap or out-of-order partition.
pub fn assert_partitions_cover(partitions: &[PartitionDescriptor], num_frames: usize) {
    let mut next_frame = 0;
    let mut next_byte = 0;
    for (i, p) in partitions.iter().enumerate() {
        assert_eq!(p.id.index(), i, "partition {p} is out of order");
        assert!(p.num_frames() > 0, "partition {p} is empty");
        assert_eq!(
            p.start_frame, next_frame,
            "partition {p} starts at frame {}, expected {next_frame}",
            p.start_frame
        );
        assert_eq!(
            p.byte_offset, next_byte,
            "partition {p} starts at byte {}, expected {next_byte}",
            p.byte_offset
        );
        next_frame = p.end_frame;
        next_byte = p.byte_offset + p.byte_len;
    }
    assert_eq!(
        next_frame, num_frames,
        "partitions end at frame {next_frame}, dataset has {num_frames}"
    );
}

/// Assert that every element of a replace buffer was written.
///
/// # Panics
///
/// Panics if the buffer has no write marks or any element is unwritten.
pub fn assert_fully_written(snapshot: &Snapshot, udf: &str, buffer: &str) {
    let buf = match snapshot.buffer(udf, buffer) {
        Ok(buf) => buf,
        Err(e) => panic!("{udf}/{buffer}: {e}"),
    };
    let Some(written) = buf.written() else {
        panic!("{udf}/{buffer} is not a replace buffer");
    };
    if let Some(i) = written.iter().position(|w| !w) {
        panic!("{udf}/{buffer}: element {i} was never written");
    }
}
