//! Logical tensor shapes and the host padding rule.

use crate::error::Error;
use std::fmt;
use std::ops::Index;

/// Default host column alignment, in `f32` elements (32 bytes).
pub const DEFAULT_HOST_ALIGNMENT: usize = 8;

/// Rounds `cols` up to the next multiple of `alignment`.
///
/// This is the only place the host padding rule lives; every padded size in
/// the crate is derived from it.
pub fn padded_cols(cols: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return cols;
    }
    cols.div_ceil(alignment) * alignment
}

/// Dimension sizes ordered outermost to innermost.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Result<Self, Error> {
        if dims.is_empty() || dims.contains(&0) {
            return Err(Error::InvalidShape(dims.to_vec()));
        }
        Ok(Self {
            dims: dims.to_vec(),
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn at(&self, axis: usize) -> Result<usize, Error> {
        self.dims.get(axis).copied().ok_or(Error::InvalidAxis {
            axis,
            rank: self.rank(),
        })
    }

    /// Second-to-last dimension, or 1 for rank-1 shapes.
    pub fn rows(&self) -> usize {
        if self.dims.len() < 2 {
            1
        } else {
            self.dims[self.dims.len() - 2]
        }
    }

    pub fn cols(&self) -> usize {
        self.dims[self.dims.len() - 1]
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of rows in the flattened `[outer, cols]` view.
    pub fn outer_count(&self) -> usize {
        self.size() / self.cols()
    }

    /// Product of all dimensions except the trailing `required_dims`.
    pub fn batch_size(&self, required_dims: usize) -> usize {
        let keep = self.dims.len().saturating_sub(required_dims);
        self.dims[..keep].iter().product()
    }

    /// Left-pads with 1s until the rank is at least `rank`.
    pub fn expand(&mut self, rank: usize) {
        if self.dims.len() >= rank {
            return;
        }
        let mut dims = vec![1; rank - self.dims.len()];
        dims.extend_from_slice(&self.dims);
        self.dims = dims;
    }

    pub fn expanded(&self, rank: usize) -> Shape {
        let mut shape = self.clone();
        shape.expand(rank);
        shape
    }

    /// Copy of this shape with the last dimension replaced by `cols`.
    ///
    /// Used for size arithmetic over padded host buffers.
    pub fn with_cols(&self, cols: usize) -> Shape {
        let mut dims = self.dims.clone();
        let last = dims.len() - 1;
        dims[last] = cols;
        Shape { dims }
    }

    /// Copy with the last two dimensions swapped; rank-1 shapes become `[n, 1]`.
    pub fn transposed(&self) -> Shape {
        let mut shape = self.expanded(2);
        let rank = shape.dims.len();
        shape.dims.swap(rank - 1, rank - 2);
        shape
    }

    pub fn set_dim(&mut self, axis: usize, size: usize) -> Result<(), Error> {
        if size == 0 {
            return Err(Error::InvalidShape(self.dims.clone()));
        }
        let rank = self.rank();
        let dim = self
            .dims
            .get_mut(axis)
            .ok_or(Error::InvalidAxis { axis, rank })?;
        *dim = size;
        Ok(())
    }
}

impl Index<usize> for Shape {
    type Output = usize;

    fn index(&self, axis: usize) -> &usize {
        &self.dims[axis]
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

impl TryFrom<&[usize]> for Shape {
    type Error = Error;

    fn try_from(dims: &[usize]) -> Result<Self, Self::Error> {
        Shape::new(dims)
    }
}

impl TryFrom<Vec<usize>> for Shape {
    type Error = Error;

    fn try_from(dims: Vec<usize>) -> Result<Self, Self::Error> {
        Shape::new(&dims)
    }
}
