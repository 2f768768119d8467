//! Element types of raw dataset bytes.
//!
//! Raw data is stored little-endian. Tiles decode it on demand into `f32`/`f64`
//! working arrays; [`DType::decode_into_f64`] and [`DType::decode_into_f32`] do the
//! conversion without intermediate allocations.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

/// Element type of a dataset or result buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    U16,
    U32,
    U64,
    I16,
    I32,
    I64,
    F32,
    F64,
}

macro_rules! decode_le {
    ($raw:expr, $out:expr, $src:ty, $dst:ty) => {{
        const W: usize = std::mem::size_of::<$src>();
        for (dst, chunk) in $out.iter_mut().zip($raw.chunks_exact(W)) {
            let mut b = [0u8; W];
            b.copy_from_slice(chunk);
            *dst = <$src>::from_le_bytes(b) as $dst;
        }
    }};
}

impl DType {
    /// Size of one element in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Decode little-endian `raw` into `out`; `out.len()` elements are written.
    pub fn decode_into_f64(self, raw: &[u8], out: &mut [f64]) {
        debug_assert!(raw.len() >= out.len() * self.size());
        match self {
            DType::U8 => decode_le!(raw, out, u8, f64),
            DType::U16 => decode_le!(raw, out, u16, f64),
            DType::U32 => decode_le!(raw, out, u32, f64),
            #[allow(clippy::cast_precision_loss)]
            DType::U64 => decode_le!(raw, out, u64, f64),
            DType::I16 => decode_le!(raw, out, i16, f64),
            DType::I32 => decode_le!(raw, out, i32, f64),
            #[allow(clippy::cast_precision_loss)]
            DType::I64 => decode_le!(raw, out, i64, f64),
            DType::F32 => decode_le!(raw, out, f32, f64),
            DType::F64 => decode_le!(raw, out, f64, f64),
        }
    }

    /// Decode little-endian `raw` into `out`, narrowing to `f32`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn decode_into_f32(self, raw: &[u8], out: &mut [f32]) {
        debug_assert!(raw.len() >= out.len() * self.size());
        match self {
            DType::U8 => decode_le!(raw, out, u8, f32),
            DType::U16 => decode_le!(raw, out, u16, f32),
            DType::U32 => decode_le!(raw, out, u32, f32),
            DType::U64 => decode_le!(raw, out, u64, f32),
            DType::I16 => decode_le!(raw, out, i16, f32),
            DType::I32 => decode_le!(raw, out, i32, f32),
            DType::I64 => decode_le!(raw, out, i64, f32),
            DType::F32 => decode_le!(raw, out, f32, f32),
            DType::F64 => decode_le!(raw, out, f64, f32),
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        let name = match self {
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Rust element types with a matching [`DType`].
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    const DTYPE: DType;

    /// Encode a slice as little-endian bytes.
    fn to_le_bytes_vec(values: &[Self]) -> Vec<u8>;
}

macro_rules! impl_element {
    ($($t:ty => $d:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$d;

                fn to_le_bytes_vec(values: &[Self]) -> Vec<u8> {
                    values.iter().flat_map(|v| v.to_le_bytes()).collect()
                }
            }
        )*
    };
}

impl_element!(u8 => U8, u16 => U16, u32 => U32, u64 => U64, i16 => I16, i32 => I32, i64 => I64, f32 => F32, f64 => F64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_f32_and_u16() {
        let raw = f32::to_le_bytes_vec(&[1.5, -2.0]);
        let mut out = [0.0f64; 2];
        DType::F32.decode_into_f64(&raw, &mut out);
        assert_eq!(out, [1.5, -2.0]);

        let raw = u16::to_le_bytes_vec(&[7, 65535]);
        let mut out = [0.0f32; 2];
        DType::U16.decode_into_f32(&raw, &mut out);
        assert_eq!(out, [7.0, 65535.0]);
    }
}
