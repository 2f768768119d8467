//! Dataset geometry: shapes split into navigation and signal dimensions, and
//! rectangular slices.
//!
//! A detector dataset is a stack of frames. The leading *navigation* dimensions
//! index scan positions (one frame each); the trailing *signal* dimensions are the
//! frame itself. Partitions and tiles always hold whole frames, so most of the engine
//! works on the flattened navigation axis.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

/// Shape of a dataset with a navigation/signal split.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
    sig_dims: usize,
}

impl Shape {
    /// Build a shape whose last `sig_dims` dimensions are the signal (frame) part.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DatasetShape`] if there is no navigation or no signal
    /// dimension.
    pub fn new(dims: impl Into<Vec<usize>>, sig_dims: usize) -> Result<Self> {
        let dims = dims.into();
        if sig_dims == 0 || sig_dims >= dims.len() {
            return Err(EngineError::DatasetShape(format!(
                "shape {dims:?} needs at least one navigation and one signal dimension (sig_dims = {sig_dims})"
            )));
        }
        Ok(Self { dims, sig_dims })
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn sig_dims(&self) -> usize {
        self.sig_dims
    }

    /// Navigation dimensions (scan positions).
    #[must_use]
    pub fn nav(&self) -> &[usize] {
        &self.dims[..self.dims.len() - self.sig_dims]
    }

    /// Signal dimensions (one frame).
    #[must_use]
    pub fn sig(&self) -> &[usize] {
        &self.dims[self.dims.len() - self.sig_dims..]
    }

    /// Number of frames.
    #[must_use]
    pub fn nav_size(&self) -> usize {
        self.nav().iter().product()
    }

    /// Number of elements in one frame.
    #[must_use]
    pub fn sig_size(&self) -> usize {
        self.sig().iter().product()
    }

    /// Total number of elements.
    #[must_use]
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /// The same data viewed with a single, flattened navigation dimension.
    #[must_use]
    pub fn flat_nav(&self) -> Self {
        let mut dims = Vec::with_capacity(self.sig_dims + 1);
        dims.push(self.nav_size());
        dims.extend_from_slice(self.sig());
        Self {
            dims,
            sig_dims: self.sig_dims,
        }
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "{:?} (nav {:?}, sig {:?})", self.dims, self.nav(), self.sig())
    }
}

/// A box in dataset coordinates, given by its origin and extent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slice {
    pub origin: Vec<usize>,
    pub shape: Vec<usize>,
}

impl Slice {
    #[must_use]
    pub fn new(origin: Vec<usize>, shape: Vec<usize>) -> Self {
        debug_assert_eq!(origin.len(), shape.len());
        Self { origin, shape }
    }

    /// A slice over frames `start..end` of a flat-nav dataset with the given frame shape.
    #[must_use]
    pub fn frames(start: usize, end: usize, sig: &[usize]) -> Self {
        let mut origin = vec![start];
        origin.extend(std::iter::repeat_n(0, sig.len()));
        let mut shape = vec![end - start];
        shape.extend_from_slice(sig);
        Self { origin, shape }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Intersection of two slices of the same rank, if non-empty.
    #[must_use]
    pub fn intersection(&self, other: &Slice) -> Option<Slice> {
        if self.origin.len() != other.origin.len() {
            return None;
        }
        let mut origin = Vec::with_capacity(self.origin.len());
        let mut shape = Vec::with_capacity(self.origin.len());
        for d in 0..self.origin.len() {
            let lo = self.origin[d].max(other.origin[d]);
            let hi = (self.origin[d] + self.shape[d]).min(other.origin[d] + other.shape[d]);
            if hi <= lo {
                return None;
            }
            origin.push(lo);
            shape.push(hi - lo);
        }
        Some(Slice { origin, shape })
    }

    #[must_use]
    pub fn intersects(&self, other: &Slice) -> bool {
        self.intersection(other).is_some()
    }

    /// Whether `other` lies fully inside `self`.
    #[must_use]
    pub fn contains(&self, other: &Slice) -> bool {
        self.origin.len() == other.origin.len()
            && (0..self.origin.len()).all(|d| {
                other.origin[d] >= self.origin[d]
                    && other.origin[d] + other.shape[d] <= self.origin[d] + self.shape[d]
            })
    }
}

impl Display for Slice {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "Slice(origin={:?}, shape={:?})", self.origin, self.shape)
    }
}
