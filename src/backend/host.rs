//! Host backend: kernels over column-padded buffers using `ndarray` views.
//!
//! Every kernel builds strided views whose row stride is the padded column
//! count, so padding elements are never read or written.

use crate::backend::{Backend, BinaryOp, MeanDims, Tile, UnaryOp};
use crate::device::{Device, Mode};
use crate::error::Error;
use crate::storage::TensorStorage;
use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewD, ArrayViewMut2, ArrayViewMutD, Axis, IxDyn, ShapeBuilder, Zip};

/// Marker struct for the host backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBackend;

fn layout_error(e: ndarray::ShapeError) -> Error {
    Error::InternalLogicError(format!("host tile does not fit its buffer: {e}"))
}

fn view(buf: &[f32], t: Tile) -> Result<ArrayView2<'_, f32>, Error> {
    ArrayView2::from_shape((t.rows, t.cols).strides((t.row_stride, 1)), buf).map_err(layout_error)
}

fn view_mut(buf: &mut [f32], t: Tile) -> Result<ArrayViewMut2<'_, f32>, Error> {
    ArrayViewMut2::from_shape((t.rows, t.cols).strides((t.row_stride, 1)), buf)
        .map_err(layout_error)
}

/// Widens a one-column (or one-row) view to `rows × cols`.
fn widen<'v>(v: &'v ArrayView2<'_, f32>, rows: usize, cols: usize) -> Result<ArrayView2<'v, f32>, Error> {
    let from = v.dim();
    v.broadcast((rows, cols)).ok_or_else(|| {
        Error::InternalLogicError(format!("cannot broadcast tile {from:?} to ({rows}, {cols})"))
    })
}

/// Element strides of a padded host buffer viewed with its logical shape.
fn nd_strides(shape: &[usize], row_stride: usize) -> Vec<usize> {
    let rank = shape.len();
    let mut strides = vec![1; rank];
    if rank >= 2 {
        strides[rank - 2] = row_stride;
        for d in (0..rank - 2).rev() {
            strides[d] = strides[d + 1] * shape[d + 1];
        }
    }
    strides
}

fn nd_view<'a>(buf: &'a [f32], shape: &[usize], row_stride: usize) -> Result<ArrayViewD<'a, f32>, Error> {
    let strides = nd_strides(shape, row_stride);
    ArrayViewD::from_shape(IxDyn(shape).strides(IxDyn(&strides)), buf).map_err(layout_error)
}

fn nd_view_mut<'a>(
    buf: &'a mut [f32],
    shape: &[usize],
    row_stride: usize,
) -> Result<ArrayViewMutD<'a, f32>, Error> {
    let strides = nd_strides(shape, row_stride);
    ArrayViewMutD::from_shape(IxDyn(shape).strides(IxDyn(&strides)), buf).map_err(layout_error)
}

impl Backend for HostBackend {
    const MODE: Mode = Mode::Host;

    fn select(_device: &Device) -> Result<(), Error> {
        Ok(())
    }

    fn buffer(storage: &TensorStorage) -> Result<&[f32], Error> {
        storage.host()
    }

    fn buffer_mut(storage: &mut TensorStorage) -> Result<&mut [f32], Error> {
        storage.host_mut()
    }

    fn binary(
        op: BinaryOp,
        y: &mut [f32],
        yt: Tile,
        a: &[f32],
        at: Tile,
        b: &[f32],
        bt: Tile,
    ) -> Result<(), Error> {
        let a = view(a, at)?;
        let b = view(b, bt)?;
        let a = widen(&a, yt.rows, yt.cols)?;
        let b = widen(&b, yt.rows, yt.cols)?;
        let mut y = view_mut(y, yt)?;
        Zip::from(&mut y)
            .and(&a)
            .and(&b)
            .for_each(|y, &a, &b| *y = op.apply(a, b));
        Ok(())
    }

    fn unary(op: UnaryOp, y: &mut [f32], yt: Tile, x: &[f32], xt: Tile) -> Result<(), Error> {
        let x = view(x, xt)?;
        let x = widen(&x, yt.rows, yt.cols)?;
        let mut y = view_mut(y, yt)?;
        Zip::from(&mut y).and(&x).for_each(|y, &x| *y = op.apply(x));
        Ok(())
    }

    fn accumulate(dst: &mut [f32], dt: Tile, src: &[f32], st: Tile) -> Result<(), Error> {
        let src = view(src, st)?;
        let mut dst = view_mut(dst, dt)?;
        if dt.cols == st.cols {
            dst += &src;
        } else {
            let sums = src.sum_axis(Axis(1));
            let mut column = dst.column_mut(0);
            column += &sums;
        }
        Ok(())
    }

    fn gemm(
        y: &mut [f32],
        yt: Tile,
        a: &[f32],
        at: Tile,
        b: &[f32],
        bt: Tile,
        c: Option<(&[f32], Tile)>,
    ) -> Result<(), Error> {
        let a = view(a, at)?;
        let b = view(b, bt)?;
        let mut y = view_mut(y, yt)?;
        match c {
            Some((c, ct)) => {
                let c = view(c, ct)?;
                let c = widen(&c, yt.rows, yt.cols)?;
                y.assign(&c);
                general_mat_mul(1.0, &a, &b, 1.0, &mut y);
            }
            None => general_mat_mul(1.0, &a, &b, 0.0, &mut y),
        }
        Ok(())
    }

    fn transpose(y: &mut [f32], yt: Tile, x: &[f32], xt: Tile) -> Result<(), Error> {
        let x = view(x, xt)?;
        let mut y = view_mut(y, yt)?;
        y.assign(&x.t());
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
        let x = nd_view(x, x_shape, x_row_stride)?;
        let mut y = nd_view_mut(y, y_shape, y_row_stride)?;
        let mean = x
            .mean_axis(Axis(dims.axis))
            .ok_or_else(|| Error::InternalLogicError("mean over an empty axis".to_string()))?;
        y.index_axis_mut(Axis(dims.axis), 0).assign(&mean);
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
        let dy = nd_view(dy, dy_shape, dy_row_stride)?;
        let dy = dy.index_axis(Axis(dims.axis), 0);
        let mut dx = nd_view_mut(dx, dx_shape, dx_row_stride)?;
        let scale = 1.0 / dims.unit_size as f32;
        for mut lane in dx.axis_iter_mut(Axis(dims.axis)) {
            lane.scaled_add(scale, &dy);
        }
        Ok(())
    }
}
