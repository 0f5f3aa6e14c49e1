//! Accelerator backend.
//!
//! Device memory is unpadded and contiguous. Kernels are written one logical
//! thread per output element: each iteration of the outer loop computes the
//! element at a flat index from nothing but that index and the tile
//! geometry, the way a launch over `len()` threads would.

mod buffer;

pub use buffer::DeviceBuffer;

use crate::backend::{Backend, BatchedGemm, BinaryOp, GemmDims, MeanDims, Tile, UnaryOp};
use crate::device::{Device, Mode};
use crate::error::Error;
use crate::storage::TensorStorage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorBackend;

/// Buffer index of logical `(row, col)` in `t`, reading column 0 of a
/// one-column tile.
#[inline]
fn at(t: Tile, row: usize, col: usize) -> usize {
    let col = if t.cols == 1 { 0 } else { col };
    row * t.row_stride + col
}

/// Same as [`at`] for a tile with one row repeated over every row.
#[inline]
fn at_row_broadcast(t: Tile, row: usize, col: usize) -> usize {
    let row = if t.rows == 1 { 0 } else { row };
    at(t, row, col)
}

fn gemm_block(
    y: &mut [f32],
    yt: Tile,
    a: &[f32],
    at_: Tile,
    b: &[f32],
    bt: Tile,
    c: Option<(&[f32], Tile)>,
) {
    let k_len = at_.cols;
    for idx in 0..yt.len() {
        let (row, col) = (idx / yt.cols, idx % yt.cols);
        let mut acc = match c {
            Some((c, ct)) => c[at_row_broadcast(ct, row, col)],
            None => 0.0,
        };
        for k in 0..k_len {
            acc += a[row * at_.row_stride + k] * b[k * bt.row_stride + col];
        }
        y[row * yt.row_stride + col] = acc;
    }
}

fn contiguous(name: &str, shape: &[usize], row_stride: usize) -> Result<(), Error> {
    match shape.last() {
        Some(&cols) if cols == row_stride => Ok(()),
        _ => Err(Error::InternalLogicError(format!(
            "{name} on the accelerator needs an unpadded buffer, got {shape:?} with stride {row_stride}"
        ))),
    }
}

impl Backend for AcceleratorBackend {
    const MODE: Mode = Mode::Accelerator;

    fn select(device: &Device) -> Result<(), Error> {
        if !device.is_accelerator() {
            return Err(Error::InvalidOperation(format!(
                "{device} cannot run accelerator kernels"
            )));
        }
        tracing::trace!(%device, "accelerator selected");
        Ok(())
    }

    fn buffer(storage: &TensorStorage) -> Result<&[f32], Error> {
        storage.device_data()
    }

    fn buffer_mut(storage: &mut TensorStorage) -> Result<&mut [f32], Error> {
        storage.device_data_mut()
    }

    fn binary(
        op: BinaryOp,
        y: &mut [f32],
        yt: Tile,
        a: &[f32],
        at_: Tile,
        b: &[f32],
        bt: Tile,
    ) -> Result<(), Error> {
        for idx in 0..yt.len() {
            let (row, col) = (idx / yt.cols, idx % yt.cols);
            y[row * yt.row_stride + col] = op.apply(a[at(at_, row, col)], b[at(bt, row, col)]);
        }
        Ok(())
    }

    fn unary(op: UnaryOp, y: &mut [f32], yt: Tile, x: &[f32], xt: Tile) -> Result<(), Error> {
        for idx in 0..yt.len() {
            let (row, col) = (idx / yt.cols, idx % yt.cols);
            y[row * yt.row_stride + col] = op.apply(x[at(xt, row, col)]);
        }
        Ok(())
    }

    fn accumulate(dst: &mut [f32], dt: Tile, src: &[f32], st: Tile) -> Result<(), Error> {
        // One thread per destination element, looping over the columns it absorbs.
        for idx in 0..dt.len() {
            let (row, col) = (idx / dt.cols, idx % dt.cols);
            let sum: f32 = if dt.cols == st.cols {
                src[row * st.row_stride + col]
            } else {
                (0..st.cols).map(|c| src[row * st.row_stride + c]).sum()
            };
            dst[row * dt.row_stride + col] += sum;
        }
        Ok(())
    }

    fn gemm(
        y: &mut [f32],
        yt: Tile,
        a: &[f32],
        at_: Tile,
        b: &[f32],
        bt: Tile,
        c: Option<(&[f32], Tile)>,
    ) -> Result<(), Error> {
        gemm_block(y, yt, a, at_, b, bt, c);
        Ok(())
    }

    fn gemm_batched(
        y: &mut [f32],
        a: &[f32],
        b: &[f32],
        c: Option<&[f32]>,
        batch: BatchedGemm,
    ) -> Result<(), Error> {
        let GemmDims { m, n, k } = batch.dims;
        let c_rows = if batch.c_row_broadcast { 1 } else { m };
        let (yt, at_, bt, ct) = (
            Tile::new(m, n, n),
            Tile::new(m, k, k),
            Tile::new(k, n, n),
            Tile::new(c_rows, n, n),
        );
        let offset = |broadcast: bool, i: usize, block: usize| if broadcast { 0 } else { i * block };
        for i in 0..batch.batch {
            let a_off = offset(batch.broadcast_a, i, m * k);
            let b_off = offset(batch.broadcast_b, i, k * n);
            let c_block = c.map(|c| {
                let c_off = offset(batch.broadcast_c, i, c_rows * n);
                (&c[c_off..c_off + c_rows * n], ct)
            });
            gemm_block(
                &mut y[i * m * n..(i + 1) * m * n],
                yt,
                &a[a_off..a_off + m * k],
                at_,
                &b[b_off..b_off + k * n],
                bt,
                c_block,
            );
        }
        Ok(())
    }

    fn transpose(y: &mut [f32], yt: Tile, x: &[f32], xt: Tile) -> Result<(), Error> {
        for idx in 0..xt.len() {
            let (row, col) = (idx / xt.cols, idx % xt.cols);
            y[col * yt.row_stride + row] = x[row * xt.row_stride + col];
        }
        Ok(())
    }

    fn reduce_mean(
        y: &mut [f32],
        y_shape: &[usize],
        y_row_stride: usize,
        x: &[f32],
        x_shape: &[usize],
        x_row_stride: usize,
        dims: MeanDims,
    ) -> Result<(), Error> {
        contiguous("reduce_mean", y_shape, y_row_stride)?;
        contiguous("reduce_mean", x_shape, x_row_stride)?;
        let MeanDims {
            out_size,
            unit_size,
            stride,
            ..
        } = dims;
        for i in 0..out_size {
            let base = (i / stride) * stride * unit_size + i % stride;
            let sum: f32 = (0..unit_size).map(|j| x[base + j * stride]).sum();
            y[i] = sum / unit_size as f32;
        }
        Ok(())
    }

    fn reduce_mean_backward(
        dx: &mut [f32],
        dx_shape: &[usize],
        dx_row_stride: usize,
        dy: &[f32],
        dy_shape: &[usize],
        dy_row_stride: usize,
        dims: MeanDims,
    ) -> Result<(), Error> {
        contiguous("reduce_mean_backward", dx_shape, dx_row_stride)?;
        contiguous("reduce_mean_backward", dy_shape, dy_row_stride)?;
        let MeanDims {
            out_size,
            unit_size,
            stride,
            ..
        } = dims;
        for i in 0..out_size {
            let base = (i / stride) * stride * unit_size + i % stride;
            let share = dy[i] / unit_size as f32;
            for j in 0..unit_size {
                dx[base + j * stride] += share;
            }
        }
        Ok(())
    }

    fn elementwise_product_backward(
        da: &mut [f32],
        dat: Tile,
        db: &mut [f32],
        dbt: Tile,
        dy: &[f32],
        dyt: Tile,
        a: &[f32],
        at_: Tile,
        b: &[f32],
        bt: Tile,
    ) -> Result<(), Error> {
        for idx in 0..dyt.len() {
            let (row, col) = (idx / dyt.cols, idx % dyt.cols);
            let g = dy[row * dyt.row_stride + col];
            da[at(dat, row, col)] += g * b[at(bt, row, col)];
            db[at(dbt, row, col)] += g * a[at(at_, row, col)];
        }
        Ok(())
    }
}
