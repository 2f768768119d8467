//! Result buffers declared by UDFs.
//!
//! A UDF declares its outputs as a list of [`BufferSpec`]s. For every task the engine
//! allocates a fresh [`BufferSet`] from those specs, the UDF fills it tile by tile,
//! and the merger folds it into the run's global buffers according to the spec's
//! [`BufferKind`]:
//!
//! - `Replace`: each element is owned by exactly one partition; writes are tracked
//!   per element so overlapping writes can be detected at merge time
//! - `Sum`: elementwise accumulation
//! - `Custom`: a user merge function, which must be associative and commutative
//!
//! The [`Extent`] decides what a buffer covers. `Global` buffers have the declared
//! shape in every task. `PerFrame` buffers get one row of the declared shape per
//! frame (a spatial map); each task only allocates the rows of its own frames.

use crate::dataset::DataSetMeta;
use crate::dtype::DType;
use crate::error::{EngineError, Result};
use crate::index::PartitionDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::sync::Arc;

/// User-supplied merge function for [`BufferKind::Custom`] buffers.
///
/// Receives the accumulated data and one incoming task's data (same dtype and
/// length) and folds the latter into the former.
pub type MergeFn = Arc<dyn Fn(&mut BufferData, &BufferData) -> anyhow::Result<()> + Send + Sync>;

/// Merge policy of a buffer.
#[derive(Clone)]
pub enum BufferKind {
    Replace,
    Sum,
    Custom(MergeFn),
}

impl Debug for BufferKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            BufferKind::Replace => f.write_str("Replace"),
            BufferKind::Sum => f.write_str("Sum"),
            BufferKind::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// What a buffer covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Extent {
    /// The declared shape, once per run.
    Global,
    /// The declared shape once per frame.
    PerFrame,
}

/// Declaration of one named result buffer.
#[derive(Clone, Debug)]
pub struct BufferSpec {
    pub name: String,
    /// Shape of the buffer (of one row for `PerFrame` buffers). Empty means scalar.
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub kind: BufferKind,
    pub extent: Extent,
    /// Initial value of every element of a fresh task buffer. Must be zero for
    /// `Sum` buffers, where every task's fill would be added into the result.
    pub fill: f64,
}

impl BufferSpec {
    fn new(name: impl Into<String>, shape: Vec<usize>, dtype: DType, kind: BufferKind) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            kind,
            extent: Extent::Global,
            fill: 0.0,
        }
    }

    /// An elementwise-summed buffer.
    pub fn sum(name: impl Into<String>, shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self::new(name, shape.into(), dtype, BufferKind::Sum)
    }

    /// A buffer whose elements are each written by exactly one partition.
    pub fn replace(name: impl Into<String>, shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self::new(name, shape.into(), dtype, BufferKind::Replace)
    }

    /// A buffer merged by `merge`, which must be associative and commutative.
    pub fn custom<F>(name: impl Into<String>, shape: impl Into<Vec<usize>>, dtype: DType, merge: F) -> Self
    where
        F: Fn(&mut BufferData, &BufferData) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(name, shape.into(), dtype, BufferKind::Custom(Arc::new(merge)))
    }

    /// Make this a per-frame buffer.
    #[must_use]
    pub fn per_frame(mut self) -> Self {
        self.extent = Extent::PerFrame;
        self
    }

    /// Initial value of fresh task buffers (unwritten elements of `Replace` buffers,
    /// starting point of `Custom` buffers). `Sum` buffers reject a non-zero fill.
    #[must_use]
    pub fn with_fill(mut self, fill: f64) -> Self {
        self.fill = fill;
        self
    }

    /// Elements per row (the whole buffer for `Global` extent).
    #[must_use]
    pub fn row_len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Shape of the merged buffer for a dataset.
    #[must_use]
    pub fn global_shape(&self, meta: &DataSetMeta) -> Vec<usize> {
        match self.extent {
            Extent::Global => self.shape.clone(),
            Extent::PerFrame => meta.shape.nav().iter().chain(&self.shape).copied().collect(),
        }
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for unsupported dtypes or kind/extent combinations.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.dtype, DType::F32 | DType::F64 | DType::I64 | DType::U64) {
            return Err(EngineError::Config(format!(
                "buffer '{}': dtype {} is not supported for result buffers",
                self.name, self.dtype
            )));
        }
        if matches!(self.kind, BufferKind::Custom(_)) && self.extent == Extent::PerFrame {
            return Err(EngineError::Config(format!(
                "buffer '{}': custom merge requires a global extent",
                self.name
            )));
        }
        if matches!(self.kind, BufferKind::Sum) && self.fill != 0.0 {
            return Err(EngineError::Config(format!(
                "buffer '{}': sum buffers must start at zero, got fill {}",
                self.name, self.fill
            )));
        }
        Ok(())
    }
}

/// Typed storage of a buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BufferData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
    U64(Vec<u64>),
}

/// Element types a result buffer can hold.
pub trait BufferElement: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn slice(data: &BufferData) -> Option<&[Self]>;
    fn slice_mut(data: &mut BufferData) -> Option<&mut [Self]>;
}

macro_rules! buffer_elements {
    ($($t:ty => $variant:ident),* $(,)?) => {
        paste::paste! {
            $(
                impl BufferElement for $t {
                    const DTYPE: DType = DType::$variant;

                    fn slice(data: &BufferData) -> Option<&[Self]> {
                        match data {
                            BufferData::$variant(v) => Some(v),
                            _ => None,
                        }
                    }

                    fn slice_mut(data: &mut BufferData) -> Option<&mut [Self]> {
                        match data {
                            BufferData::$variant(v) => Some(v),
                            _ => None,
                        }
                    }
                }

                impl BufferData {
                    #[must_use]
                    pub fn [<as_ $t>](&self) -> Option<&[$t]> {
                        <$t as BufferElement>::slice(self)
                    }

                    pub fn [<as_ $t _mut>](&mut self) -> Option<&mut [$t]> {
                        <$t as BufferElement>::slice_mut(self)
                    }
                }
            )*
        }
    };
}

buffer_elements!(f32 => F32, f64 => F64, i64 => I64, u64 => U64);

/// Addition that reports integer overflow instead of wrapping.
trait SumElement: Copy {
    fn checked_sum(self, other: Self) -> Option<Self>;
}

macro_rules! sum_elements {
    (float: $($f:ty),*; int: $($i:ty),*) => {
        $(
            impl SumElement for $f {
                fn checked_sum(self, other: Self) -> Option<Self> {
                    Some(self + other)
                }
            }
        )*
        $(
            impl SumElement for $i {
                fn checked_sum(self, other: Self) -> Option<Self> {
                    self.checked_add(other)
                }
            }
        )*
    };
}

sum_elements!(float: f32, f64; int: i64, u64);

/// Index into `dst` of the first element whose sum with `src` overflows.
fn first_overflow<T: SumElement>(dst: &[T], src: &[T]) -> Option<usize> {
    dst.iter().zip(src).position(|(&d, &s)| d.checked_sum(s).is_none())
}

/// Apply `$body` with `$v` bound to the inner vector, whatever the variant.
macro_rules! with_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            BufferData::F32($v) => $body,
            BufferData::F64($v) => $body,
            BufferData::I64($v) => $body,
            BufferData::U64($v) => $body,
        }
    };
}

/// Apply `$body` to two buffers of the same variant; `$else` otherwise.
macro_rules! with_pair {
    ($a:expr, $b:expr, ($x:ident, $y:ident) => $body:expr, $else:expr) => {
        match ($a, $b) {
            (BufferData::F32($x), BufferData::F32($y)) => $body,
            (BufferData::F64($x), BufferData::F64($y)) => $body,
            (BufferData::I64($x), BufferData::I64($y)) => $body,
            (BufferData::U64($x), BufferData::U64($y)) => $body,
            _ => $else,
        }
    };
}

impl BufferData {
    /// `len` elements of `dtype`, all set to `fill`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for dtypes buffers cannot hold.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn filled(dtype: DType, len: usize, fill: f64) -> Result<Self> {
        Ok(match dtype {
            DType::F32 => BufferData::F32(vec![fill as f32; len]),
            DType::F64 => BufferData::F64(vec![fill; len]),
            DType::I64 => BufferData::I64(vec![fill as i64; len]),
            DType::U64 => BufferData::U64(vec![fill as u64; len]),
            other => {
                return Err(EngineError::Config(format!(
                    "dtype {other} is not supported for result buffers"
                )));
            }
        })
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            BufferData::F32(_) => DType::F32,
            BufferData::F64(_) => DType::F64,
            BufferData::I64(_) => DType::I64,
            BufferData::U64(_) => DType::U64,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        with_data!(self, v => v.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `index` widened to `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        match self {
            BufferData::F32(v) => v.get(index).map(|x| f64::from(*x)),
            BufferData::F64(v) => v.get(index).copied(),
            BufferData::I64(v) => v.get(index).map(|x| *x as f64),
            BufferData::U64(v) => v.get(index).map(|x| *x as f64),
        }
    }

    /// Check that [`add_at`](Self::add_at) would succeed, without changing anything.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BufferMismatch`] on dtype mismatch, out-of-range offset
    /// or integer overflow.
    pub fn check_add_at(&self, offset: usize, other: &BufferData) -> Result<()> {
        let (dtype, len) = (self.dtype(), self.len());
        if offset + other.len() > len {
            return Err(EngineError::BufferMismatch(format!(
                "cannot add {} elements at offset {offset} into {len}",
                other.len()
            )));
        }
        let overflow = with_pair!(
            self,
            other,
            (dst, src) => first_overflow(&dst[offset..offset + src.len()], src),
            return Err(EngineError::BufferMismatch(format!(
                "cannot add {} data into {dtype} buffer",
                other.dtype()
            )))
        );
        match overflow {
            Some(i) => Err(EngineError::BufferMismatch(format!(
                "{dtype} sum overflows at element {}",
                offset + i
            ))),
            None => Ok(()),
        }
    }

    /// Add `other` elementwise into `self[offset..offset + other.len()]`.
    ///
    /// Integer sums never wrap: if any element would overflow, nothing is added.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BufferMismatch`] on dtype mismatch, out-of-range offset
    /// or integer overflow.
    pub fn add_at(&mut self, offset: usize, other: &BufferData) -> Result<()> {
        self.check_add_at(offset, other)?;
        let dtype = self.dtype();
        with_pair!(
            self,
            other,
            (dst, src) => {
                for (d, s) in dst[offset..offset + src.len()].iter_mut().zip(src.iter()) {
                    *d += *s;
                }
                Ok(())
            },
            Err(EngineError::BufferMismatch(format!(
                "cannot add {} data into {dtype} buffer",
                other.dtype()
            )))
        )
    }

    /// Copy `other[src_index]` to `self[dst_index]`.
    fn copy_element(&mut self, dst_index: usize, other: &BufferData, src_index: usize) -> Result<()> {
        let dtype = self.dtype();
        with_pair!(
            self,
            other,
            (dst, src) => {
                dst[dst_index] = src[src_index];
                Ok(())
            },
            Err(EngineError::BufferMismatch(format!(
                "cannot copy {} data into {dtype} buffer",
                other.dtype()
            )))
        )
    }
}

/// One buffer instance: a task-local buffer or the merged global buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultBuffer {
    shape: Vec<usize>,
    data: BufferData,
    /// Elements per frame row.
    row_len: usize,
    /// Offset of element 0 within the global buffer.
    origin: usize,
    /// Per-element write marks (`Replace` buffers only).
    written: Option<Vec<bool>>,
}

impl ResultBuffer {
    /// Allocate the task-local buffer of `spec` for `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the spec is invalid.
    pub fn for_task(spec: &BufferSpec, partition: &PartitionDescriptor) -> Result<Self> {
        spec.validate()?;
        let row_len = spec.row_len();
        let (shape, origin, len) = match spec.extent {
            Extent::Global => (spec.shape.clone(), 0, row_len),
            Extent::PerFrame => {
                let mut shape = vec![partition.num_frames()];
                shape.extend_from_slice(&spec.shape);
                (shape, partition.start_frame * row_len, partition.num_frames() * row_len)
            }
        };
        Ok(Self {
            shape,
            data: BufferData::filled(spec.dtype, len, spec.fill)?,
            row_len,
            origin,
            written: matches!(spec.kind, BufferKind::Replace).then(|| vec![false; len]),
        })
    }

    /// Allocate the empty global (merged) buffer of `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the spec is invalid.
    pub fn for_global(spec: &BufferSpec, meta: &DataSetMeta) -> Result<Self> {
        spec.validate()?;
        let shape = spec.global_shape(meta);
        let len = shape.iter().product();
        let fill = match spec.kind {
            BufferKind::Replace => spec.fill,
            BufferKind::Sum | BufferKind::Custom(_) => 0.0,
        };
        Ok(Self {
            shape,
            data: BufferData::filled(spec.dtype, len, fill)?,
            row_len: spec.row_len(),
            origin: 0,
            written: matches!(spec.kind, BufferKind::Replace).then(|| vec![false; len]),
        })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &BufferData {
        &self.data
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset of element 0 within the global buffer.
    #[must_use]
    pub fn origin(&self) -> usize {
        self.origin
    }

    #[must_use]
    pub fn written(&self) -> Option<&[bool]> {
        self.written.as_deref()
    }

    /// Read access to the elements.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BufferMismatch`] if `T` is not the buffer's dtype.
    pub fn values<T: BufferElement>(&self) -> Result<&[T]> {
        T::slice(&self.data).ok_or_else(|| self.type_error::<T>())
    }

    /// Write access to all elements. On `Replace` buffers this claims every element
    /// of this buffer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BufferMismatch`] if `T` is not the buffer's dtype.
    pub fn values_mut<T: BufferElement>(&mut self) -> Result<&mut [T]> {
        if T::DTYPE != self.data.dtype() {
            return Err(self.type_error::<T>());
        }
        if let Some(written) = self.written.as_mut() {
            written.fill(true);
        }
        let dtype = self.data.dtype();
        T::slice_mut(&mut self.data).ok_or_else(|| EngineError::BufferMismatch(format!("buffer holds {dtype} values")))
    }

    /// Write access to the row of global frame `frame` (per-frame buffers).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BufferMismatch`] if the frame is outside this buffer or
    /// `T` is not the buffer's dtype.
    pub fn frame_mut<T: BufferElement>(&mut self, frame: usize) -> Result<&mut [T]> {
        let range = self.local_range(frame * self.row_len, self.row_len)?;
        if T::DTYPE != self.data.dtype() {
            return Err(self.type_error::<T>());
        }
        if let Some(written) = self.written.as_mut() {
            written[range.clone()].fill(true);
        }
        let dtype = self.data.dtype();
        let values = T::slice_mut(&mut self.data)
            .ok_or_else(|| EngineError::BufferMismatch(format!("buffer holds {dtype} values")))?;
        Ok(&mut values[range])
    }

    /// Set the element at global flat `index`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BufferMismatch`] if the index is outside this buffer or
    /// `T` is not the buffer's dtype.
    pub fn set<T: BufferElement>(&mut self, index: usize, value: T) -> Result<()> {
        let range = self.local_range(index, 1)?;
        if T::DTYPE != self.data.dtype() {
            return Err(self.type_error::<T>());
        }
        if let Some(written) = self.written.as_mut() {
            written[range.start] = true;
        }
        if let Some(values) = T::slice_mut(&mut self.data) {
            values[range.start] = value;
        }
        Ok(())
    }

    fn local_range(&self, global_start: usize, len: usize) -> Result<std::ops::Range<usize>> {
        let start = global_start
            .checked_sub(self.origin)
            .filter(|s| s + len <= self.len())
            .ok_or_else(|| {
                EngineError::BufferMismatch(format!(
                    "elements {global_start}..{} are outside this buffer ({}..{})",
                    global_start + len,
                    self.origin,
                    self.origin + self.len()
                ))
            })?;
        Ok(start..start + len)
    }

    fn type_error<T: BufferElement>(&self) -> EngineError {
        EngineError::BufferMismatch(format!(
            "buffer holds {} values, requested {}",
            self.data.dtype(),
            T::DTYPE
        ))
    }

    pub(crate) fn data_mut(&mut self) -> &mut BufferData {
        &mut self.data
    }

    pub(crate) fn written_mut(&mut self) -> Option<&mut Vec<bool>> {
        self.written.as_mut()
    }

    pub(crate) fn copy_element_from(&mut self, dst: usize, other: &ResultBuffer, src: usize) -> Result<()> {
        self.data.copy_element(dst, &other.data, src)
    }
}

/// The buffers of one UDF, in declaration order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferSet {
    names: Vec<String>,
    buffers: Vec<ResultBuffer>,
}

impl BufferSet {
    /// Fresh task buffers for `partition` (the `get_result_buffers` step).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if a spec is invalid.
    pub fn for_task(specs: &[BufferSpec], partition: &PartitionDescriptor) -> Result<Self> {
        let buffers = specs
            .iter()
            .map(|s| ResultBuffer::for_task(s, partition))
            .collect::<Result<_>>()?;
        Ok(Self {
            names: specs.iter().map(|s| s.name.clone()).collect(),
            buffers,
        })
    }

    /// Empty global buffers.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if a spec is invalid.
    pub fn for_global(specs: &[BufferSpec], meta: &DataSetMeta) -> Result<Self> {
        let buffers = specs
            .iter()
            .map(|s| ResultBuffer::for_global(s, meta))
            .collect::<Result<_>>()?;
        Ok(Self {
            names: specs.iter().map(|s| s.name.clone()).collect(),
            buffers,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::BufferMismatch`] if no buffer is called `name`.
    pub fn get(&self, name: &str) -> Result<&ResultBuffer> {
        self.position(name).map(|i| &self.buffers[i])
    }

    /// # Errors
    ///
    /// Returns [`EngineError::BufferMismatch`] if no buffer is called `name`.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut ResultBuffer> {
        self.position(name).map(|i| &mut self.buffers[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResultBuffer)> {
        self.names.iter().map(String::as_str).zip(&self.buffers)
    }

    pub(crate) fn buffers(&self) -> &[ResultBuffer] {
        &self.buffers
    }

    pub(crate) fn buffers_mut(&mut self) -> &mut [ResultBuffer] {
        &mut self.buffers
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| EngineError::BufferMismatch(format!("no buffer named '{name}'")))
    }
}
