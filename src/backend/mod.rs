//! Backend trait definition and module structure.
//!
//! A backend is a set of kernels for one [`Mode`]. Kernels receive borrowed
//! slices positioned at the start of a tile plus the [`Tile`] describing how
//! rows are laid out in that slice; they never keep a slice past the call.

use crate::device::{Device, Mode};
use crate::error::Error;
use crate::storage::TensorStorage;

pub mod accelerator;
pub mod host;

pub use accelerator::AcceleratorBackend;
pub use host::HostBackend;

/// A 2-D block of one operand as a kernel sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub rows: usize,
    pub cols: usize,
    pub row_stride: usize,
}

impl Tile {
    pub fn new(rows: usize, cols: usize, row_stride: usize) -> Self {
        Self {
            rows,
            cols,
            row_stride,
        }
    }

    /// Number of buffer elements spanned by the tile, trailing padding excluded.
    pub fn extent(&self) -> usize {
        (self.rows - 1) * self.row_stride + self.cols
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Scale(f32),
    Pow(f32),
    Log,
    Log10,
    Reciprocal,
}

impl UnaryOp {
    pub(crate) fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Scale(factor) => x * factor,
            UnaryOp::Pow(exponent) => x.powf(exponent),
            UnaryOp::Log => x.ln(),
            UnaryOp::Log10 => x.log10(),
            UnaryOp::Reciprocal => 1.0 / x,
        }
    }
}

impl BinaryOp {
    pub(crate) fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
        }
    }
}

/// Dimensions of one gemm block: `y[m×n] = a[m×k] · b[k×n] (+ c)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmDims {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// Per-operand flags for the single-call batched gemm: a broadcast operand
/// reuses its one matrix for every batch element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchedGemm {
    pub dims: GemmDims,
    pub batch: usize,
    pub broadcast_a: bool,
    pub broadcast_b: bool,
    pub broadcast_c: bool,
    /// `c` holds one row that is repeated across the `m` rows.
    pub c_row_broadcast: bool,
}

/// Arguments of the mean reduction over one axis, in logical units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeanDims {
    pub axis: usize,
    /// Number of output elements.
    pub out_size: usize,
    /// Extent of the reduced axis in the input.
    pub unit_size: usize,
    /// Product of the output sizes from the reduced axis to the last one.
    pub stride: usize,
}

pub trait Backend {
    const MODE: Mode;

    /// Makes `device` the target of subsequent kernels.
    fn select(device: &Device) -> Result<(), Error>;

    fn buffer(storage: &TensorStorage) -> Result<&[f32], Error>;

    fn buffer_mut(storage: &mut TensorStorage) -> Result<&mut [f32], Error>;

    /// `y = op(a, b)`. An input tile with one column is read as a column broadcast.
    fn binary(
        op: BinaryOp,
        y: &mut [f32],
        yt: Tile,
        a: &[f32],
        at: Tile,
        b: &[f32],
        bt: Tile,
    ) -> Result<(), Error>;

    /// `y = op(x)`. An input tile with one column is read as a column broadcast.
    fn unary(op: UnaryOp, y: &mut [f32], yt: Tile, x: &[f32], xt: Tile) -> Result<(), Error>;

    /// `dst += src`, summing columns of `src` into a one-column `dst`.
    fn accumulate(dst: &mut [f32], dt: Tile, src: &[f32], st: Tile) -> Result<(), Error>;

    /// `y = a · b + c`, or `y = a · b` without `c`. A one-row `c` is repeated over rows.
    fn gemm(
        y: &mut [f32],
        yt: Tile,
        a: &[f32],
        at: Tile,
        b: &[f32],
        bt: Tile,
        c: Option<(&[f32], Tile)>,
    ) -> Result<(), Error>;

    /// Runs `batch.batch` gemm blocks in one call over unpadded buffers.
    fn gemm_batched(
        _y: &mut [f32],
        _a: &[f32],
        _b: &[f32],
        _c: Option<&[f32]>,
        _batch: BatchedGemm,
    ) -> Result<(), Error> {
        Err(Error::unsupported("batched gemm", Self::MODE))
    }

    /// `y = xᵀ` for one block; `yt` is `xt` with rows and columns swapped.
    fn transpose(y: &mut [f32], yt: Tile, x: &[f32], xt: Tile) -> Result<(), Error>;

    /// Mean over one axis. Strides are the row strides of the whole buffers.
    fn reduce_mean(
        y: &mut [f32],
        y_shape: &[usize],
        y_row_stride: usize,
        x: &[f32],
        x_shape: &[usize],
        x_row_stride: usize,
        dims: MeanDims,
    ) -> Result<(), Error>;

    /// `dx += dy / unit_size` along the reduced axis.
    fn reduce_mean_backward(
        dx: &mut [f32],
        dx_shape: &[usize],
        dx_row_stride: usize,
        dy: &[f32],
        dy_shape: &[usize],
        dy_row_stride: usize,
        dims: MeanDims,
    ) -> Result<(), Error>;

    /// `da += dy * b`, `db += dy * a`, summing over replicated columns.
    #[allow(clippy::too_many_arguments)]
    fn elementwise_product_backward(
        _da: &mut [f32],
        _dat: Tile,
        _db: &mut [f32],
        _dbt: Tile,
        _dy: &[f32],
        _dyt: Tile,
        _a: &[f32],
        _at: Tile,
        _b: &[f32],
        _bt: Tile,
    ) -> Result<(), Error> {
        Err(Error::unsupported("elementwise product backward", Self::MODE))
    }
}
