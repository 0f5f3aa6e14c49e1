//! Dispatch layer: one entry point per operation.
//!
//! Every entry point follows the same template. Operands are checked to share
//! the output's mode (and, on the accelerator, its device), shapes are
//! validated, and only then is the output written, by the host kernels over
//! padded rows or the accelerator kernels over unpadded memory.

pub mod broadcast;

pub use broadcast::BroadcastPlan;

use crate::backend::{
    AcceleratorBackend, Backend, BatchedGemm, BinaryOp, GemmDims, HostBackend, MeanDims, UnaryOp,
};
use crate::device::Mode;
use crate::error::Error;
use crate::shape::Shape;
use crate::storage::TensorStorage;
use crate::util::{broadcast_shapes, same_expanded};
use broadcast::{span, span_mut};

fn check_operands(op: &str, y: &TensorStorage, inputs: &[&TensorStorage]) -> Result<(), Error> {
    for input in inputs {
        if input.mode() != y.mode() {
            return Err(Error::ModeMismatch {
                op: op.to_string(),
                expected: y.mode(),
                actual: input.mode(),
            });
        }
        if y.mode() == Mode::Accelerator && input.device() != y.device() {
            return Err(Error::DeviceMismatch {
                op: op.to_string(),
                expected: y.device().clone(),
                actual: input.device().clone(),
            });
        }
    }
    Ok(())
}

/// Returns the mode of `y` after making its device current.
fn select(y: &TensorStorage) -> Result<Mode, Error> {
    if y.mode() == Mode::Accelerator {
        AcceleratorBackend::select(y.device())?;
    }
    Ok(y.mode())
}

fn expect_same_shape(op: &str, y: &Shape, x: &Shape) -> Result<(), Error> {
    if !same_expanded(y, x) {
        return Err(Error::shape_mismatch(op, format!("output {y} for input {x}")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Elementwise
// ---------------------------------------------------------------------------

fn binary(op: BinaryOp, y: &mut TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<(), Error> {
    let name = format!("{op:?}");
    check_operands(&name, y, &[a, b])?;
    let expected = broadcast_shapes(a.shape(), b.shape())?;
    expect_same_shape(&name, y.shape(), &expected)?;
    tracing::trace!(op = %name, y = %y.shape(), a = %a.shape(), b = %b.shape(), mode = %y.mode(), "dispatch");
    match select(y)? {
        Mode::Host => binary_impl::<HostBackend>(op, y, a, b),
        Mode::Accelerator => binary_impl::<AcceleratorBackend>(op, y, a, b),
    }
}

fn binary_impl<B: Backend>(
    op: BinaryOp,
    y: &mut TensorStorage,
    a: &TensorStorage,
    b: &TensorStorage,
) -> Result<(), Error> {
    let plan = BroadcastPlan::new(&y.layout(), &[&a.layout(), &b.layout()], 1)?;
    let (yt, at, bt) = (plan.tile(0), plan.tile(1), plan.tile(2));
    let (a_buf, b_buf) = (B::buffer(a)?, B::buffer(b)?);
    let y_buf = B::buffer_mut(y)?;
    plan.for_each(|o| {
        B::binary(
            op,
            span_mut(y_buf, o[0], yt)?,
            yt,
            span(a_buf, o[1], at)?,
            at,
            span(b_buf, o[2], bt)?,
            bt,
        )
    })
}

fn unary(op: UnaryOp, y: &mut TensorStorage, x: &TensorStorage) -> Result<(), Error> {
    let name = format!("{op:?}");
    check_operands(&name, y, &[x])?;
    expect_same_shape(&name, y.shape(), x.shape())?;
    match select(y)? {
        Mode::Host => unary_impl::<HostBackend>(op, y, x),
        Mode::Accelerator => unary_impl::<AcceleratorBackend>(op, y, x),
    }
}

fn unary_impl<B: Backend>(op: UnaryOp, y: &mut TensorStorage, x: &TensorStorage) -> Result<(), Error> {
    let plan = BroadcastPlan::new(&y.layout(), &[&x.layout()], 1)?;
    let (yt, xt) = (plan.tile(0), plan.tile(1));
    let x_buf = B::buffer(x)?;
    let y_buf = B::buffer_mut(y)?;
    plan.for_each(|o| B::unary(op, span_mut(y_buf, o[0], yt)?, yt, span(x_buf, o[1], xt)?, xt))
}

/// `y = a + b` with broadcasting.
pub fn add(y: &mut TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<(), Error> {
    binary(BinaryOp::Add, y, a, b)
}

/// `y = a - b` with broadcasting.
pub fn sub(y: &mut TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<(), Error> {
    binary(BinaryOp::Sub, y, a, b)
}

/// `y = a ⊙ b` with broadcasting.
pub fn elementwise_product(y: &mut TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<(), Error> {
    binary(BinaryOp::Mul, y, a, b)
}

pub fn scale(y: &mut TensorStorage, x: &TensorStorage, factor: f32) -> Result<(), Error> {
    unary(UnaryOp::Scale(factor), y, x)
}

pub fn pow(y: &mut TensorStorage, x: &TensorStorage, exponent: f32) -> Result<(), Error> {
    unary(UnaryOp::Pow(exponent), y, x)
}

/// Natural logarithm.
pub fn log(y: &mut TensorStorage, x: &TensorStorage) -> Result<(), Error> {
    unary(UnaryOp::Log, y, x)
}

pub fn log10(y: &mut TensorStorage, x: &TensorStorage) -> Result<(), Error> {
    unary(UnaryOp::Log10, y, x)
}

pub fn reciprocal(y: &mut TensorStorage, x: &TensorStorage) -> Result<(), Error> {
    unary(UnaryOp::Reciprocal, y, x)
}

/// Sets every logical element of `y` to `value`.
pub fn fill(y: &mut TensorStorage, value: f32) -> Result<(), Error> {
    y.fill(value)
}

/// `grad += contribution`, summing over every axis along which `grad` is
/// broadcast in `contribution`.
pub fn accumulate(grad: &mut TensorStorage, contribution: &TensorStorage) -> Result<(), Error> {
    check_accumulate(grad, contribution)?;
    match grad.mode() {
        Mode::Host => accumulate_impl::<HostBackend>(grad, contribution),
        Mode::Accelerator => accumulate_impl::<AcceleratorBackend>(grad, contribution),
    }
}

/// Runs every check [`accumulate`] makes without writing `grad`.
pub fn check_accumulate(grad: &TensorStorage, contribution: &TensorStorage) -> Result<(), Error> {
    check_operands("accumulate", grad, &[contribution])?;
    BroadcastPlan::new(&contribution.layout(), &[&grad.layout()], 1)?;
    select(grad).map(|_| ())
}

fn accumulate_impl<B: Backend>(grad: &mut TensorStorage, contribution: &TensorStorage) -> Result<(), Error> {
    let plan = BroadcastPlan::new(&contribution.layout(), &[&grad.layout()], 1)?;
    let (st, dt) = (plan.tile(0), plan.tile(1));
    let src = B::buffer(contribution)?;
    let dst = B::buffer_mut(grad)?;
    plan.for_each(|o| B::accumulate(span_mut(dst, o[1], dt)?, dt, span(src, o[0], st)?, st))
}

/// Gradients of `y = a ⊙ b`: `da += dy ⊙ b`, `db += dy ⊙ a`, reduced over
/// broadcast axes.
///
/// Only the accelerator implements this; on the host it fails with
/// [`Error::UnsupportedOnHost`] and nothing is written.
pub fn elementwise_product_backward(
    da: &mut TensorStorage,
    db: &mut TensorStorage,
    dy: &TensorStorage,
    a: &TensorStorage,
    b: &TensorStorage,
) -> Result<(), Error> {
    const OP: &str = "elementwise_product_backward";
    check_operands(OP, dy, &[&*da, &*db, a, b])?;
    expect_same_shape(OP, da.shape(), a.shape())?;
    expect_same_shape(OP, db.shape(), b.shape())?;
    expect_same_shape(OP, dy.shape(), &broadcast_shapes(a.shape(), b.shape())?)?;
    match select(dy)? {
        Mode::Host => product_backward_impl::<HostBackend>(da, db, dy, a, b),
        Mode::Accelerator => product_backward_impl::<AcceleratorBackend>(da, db, dy, a, b),
    }
}

fn product_backward_impl<B: Backend>(
    da: &mut TensorStorage,
    db: &mut TensorStorage,
    dy: &TensorStorage,
    a: &TensorStorage,
    b: &TensorStorage,
) -> Result<(), Error> {
    let plan = BroadcastPlan::new(
        &dy.layout(),
        &[&da.layout(), &db.layout(), &a.layout(), &b.layout()],
        1,
    )?;
    let tiles: Vec<_> = (0..5).map(|i| plan.tile(i)).collect();
    let (dy_buf, a_buf, b_buf) = (B::buffer(dy)?, B::buffer(a)?, B::buffer(b)?);
    let da_buf = B::buffer_mut(da)?;
    let db_buf = B::buffer_mut(db)?;
    plan.for_each(|o| {
        B::elementwise_product_backward(
            span_mut(da_buf, o[1], tiles[1])?,
            tiles[1],
            span_mut(db_buf, o[2], tiles[2])?,
            tiles[2],
            span(dy_buf, o[0], tiles[0])?,
            tiles[0],
            span(a_buf, o[3], tiles[3])?,
            tiles[3],
            span(b_buf, o[4], tiles[4])?,
            tiles[4],
        )
    })
}

// ---------------------------------------------------------------------------
// Matrix operations
// ---------------------------------------------------------------------------

/// `y = a · b + c` over the trailing two dimensions, broadcasting batch
/// dimensions. `c` is `M×N` or a single row `1×N` repeated over `M`.
///
/// On the accelerator, when every operand either matches the output's batch
/// or has no batch at all, the whole batch runs as one kernel call.
pub fn matmul_add(
    y: &mut TensorStorage,
    a: &TensorStorage,
    b: &TensorStorage,
    c: &TensorStorage,
) -> Result<(), Error> {
    gemm(y, a, b, Some(c), true)
}

/// `y = a · b`.
pub fn matmul(y: &mut TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<(), Error> {
    gemm(y, a, b, None, true)
}

/// [`matmul_add`] that always walks the batch one block at a time.
pub fn matmul_add_generic(
    y: &mut TensorStorage,
    a: &TensorStorage,
    b: &TensorStorage,
    c: &TensorStorage,
) -> Result<(), Error> {
    gemm(y, a, b, Some(c), false)
}

pub fn matmul_generic(y: &mut TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<(), Error> {
    gemm(y, a, b, None, false)
}

fn gemm_dims(y: &Shape, a: &Shape, b: &Shape, c: Option<&Shape>) -> Result<GemmDims, Error> {
    let (m, k) = (a.rows(), a.cols());
    let (k_b, n) = (b.rows(), b.cols());
    if k != k_b {
        return Err(Error::shape_mismatch(
            "matmul",
            format!("inner dimensions differ: {a} · {b}"),
        ));
    }
    if y.rows() != m || y.cols() != n {
        return Err(Error::shape_mismatch(
            "matmul",
            format!("output {y} for {a} · {b}, expected {m}×{n} blocks"),
        ));
    }
    if let Some(c) = c {
        if (c.rows() != m && c.rows() != 1) || c.cols() != n {
            return Err(Error::shape_mismatch(
                "matmul",
                format!("addend {c} for {m}×{n} blocks"),
            ));
        }
    }
    Ok(GemmDims { m, n, k })
}

fn gemm(
    y: &mut TensorStorage,
    a: &TensorStorage,
    b: &TensorStorage,
    c: Option<&TensorStorage>,
    allow_batched: bool,
) -> Result<(), Error> {
    let mut inputs = vec![a, b];
    inputs.extend(c);
    check_operands("matmul", y, &inputs)?;
    let dims = gemm_dims(y.shape(), a.shape(), b.shape(), c.map(TensorStorage::shape))?;

    let layouts: Vec<_> = inputs.iter().map(|s| s.layout()).collect();
    let refs: Vec<_> = layouts.iter().collect();
    let plan = BroadcastPlan::new(&y.layout(), &refs, 2)?;

    match select(y)? {
        Mode::Host => gemm_loop::<HostBackend>(&plan, y, a, b, c),
        Mode::Accelerator => {
            if let Some(batch) = batched_gemm(&plan, dims, c).filter(|_| allow_batched) {
                tracing::trace!(batch = batch.batch, ?dims, "batched gemm");
                let c_buf = c.map(AcceleratorBackend::buffer).transpose()?;
                let (a_buf, b_buf) = (AcceleratorBackend::buffer(a)?, AcceleratorBackend::buffer(b)?);
                return AcceleratorBackend::gemm_batched(
                    AcceleratorBackend::buffer_mut(y)?,
                    a_buf,
                    b_buf,
                    c_buf,
                    batch,
                );
            }
            gemm_loop::<AcceleratorBackend>(&plan, y, a, b, c)
        }
    }
}

/// Batch description for the single-call gemm, when the operands allow it.
fn batched_gemm(plan: &BroadcastPlan, dims: GemmDims, c: Option<&TensorStorage>) -> Option<BatchedGemm> {
    let batch = plan.batch_size();
    if batch <= 1 {
        return None;
    }
    let broadcast_c = match c {
        Some(_) => plan.batch_broadcast(3)?,
        None => false,
    };
    Some(BatchedGemm {
        dims,
        batch,
        broadcast_a: plan.batch_broadcast(1)?,
        broadcast_b: plan.batch_broadcast(2)?,
        broadcast_c,
        c_row_broadcast: c.is_some_and(|c| c.shape().rows() == 1),
    })
}

fn gemm_loop<B: Backend>(
    plan: &BroadcastPlan,
    y: &mut TensorStorage,
    a: &TensorStorage,
    b: &TensorStorage,
    c: Option<&TensorStorage>,
) -> Result<(), Error> {
    let (yt, at, bt) = (plan.tile(0), plan.tile(1), plan.tile(2));
    let (a_buf, b_buf) = (B::buffer(a)?, B::buffer(b)?);
    let c_buf = c.map(B::buffer).transpose()?;
    let y_buf = B::buffer_mut(y)?;
    plan.for_each(|o| {
        let c_block = match c_buf {
            Some(buf) => {
                let ct = plan.tile(3);
                Some((span(buf, o[3], ct)?, ct))
            }
            None => None,
        };
        B::gemm(
            span_mut(y_buf, o[0], yt)?,
            yt,
            span(a_buf, o[1], at)?,
            at,
            span(b_buf, o[2], bt)?,
            bt,
            c_block,
        )
    })
}

/// `y = xᵀ` over the trailing two dimensions. A batch of `x` that is all
/// ones (or has size-1 dims) is repeated across the batch of `y`.
pub fn transpose(y: &mut TensorStorage, x: &TensorStorage) -> Result<(), Error> {
    check_operands("transpose", y, &[x])?;
    let block = x.shape().transposed();
    if y.shape().rows() != block.rows() || y.shape().cols() != block.cols() {
        return Err(Error::shape_mismatch(
            "transpose",
            format!("output {} for input {}", y.shape(), x.shape()),
        ));
    }
    // Catches a batch of x that does not broadcast to y before anything is written.
    BroadcastPlan::new(&y.layout(), &[&x.layout()], 2)?;
    match select(y)? {
        Mode::Host => transpose_impl::<HostBackend>(y, x),
        Mode::Accelerator => transpose_impl::<AcceleratorBackend>(y, x),
    }
}

fn transpose_impl<B: Backend>(y: &mut TensorStorage, x: &TensorStorage) -> Result<(), Error> {
    let plan = BroadcastPlan::new(&y.layout(), &[&x.layout()], 2)?;
    let (yt, xt) = (plan.tile(0), plan.tile(1));
    let x_buf = B::buffer(x)?;
    let y_buf = B::buffer_mut(y)?;
    plan.for_each(|o| B::transpose(span_mut(y_buf, o[0], yt)?, yt, span(x_buf, o[1], xt)?, xt))
}

// ---------------------------------------------------------------------------
// Reductions
// ---------------------------------------------------------------------------

/// Validates a reduction of `full` into `reduced` along `dim`.
fn mean_dims(op: &str, reduced: &Shape, full: &Shape, dim: usize) -> Result<MeanDims, Error> {
    if dim >= full.rank() {
        return Err(Error::InvalidAxis {
            axis: dim,
            rank: full.rank(),
        });
    }
    if reduced.rank() != full.rank() {
        return Err(Error::shape_mismatch(
            op,
            format!("rank of {reduced} differs from {full}"),
        ));
    }
    if reduced[dim] != 1 {
        return Err(Error::DimensionNotReduced {
            dim,
            shape: reduced.dims().to_vec(),
        });
    }
    if (0..full.rank()).any(|d| d != dim && reduced[d] != full[d]) {
        return Err(Error::shape_mismatch(
            op,
            format!("{reduced} is not {full} reduced along {dim}"),
        ));
    }
    Ok(MeanDims {
        axis: dim,
        out_size: reduced.size(),
        unit_size: full[dim],
        stride: reduced.dims()[dim..].iter().product(),
    })
}

/// `y = mean(x)` along `dim`; `y` keeps the axis with size 1.
pub fn reduce_mean(y: &mut TensorStorage, x: &TensorStorage, dim: usize) -> Result<(), Error> {
    check_operands("reduce_mean", y, &[x])?;
    let dims = mean_dims("reduce_mean", y.shape(), x.shape(), dim)?;
    match select(y)? {
        Mode::Host => reduce_mean_impl::<HostBackend>(y, x, dims),
        Mode::Accelerator => reduce_mean_impl::<AcceleratorBackend>(y, x, dims),
    }
}

fn reduce_mean_impl<B: Backend>(y: &mut TensorStorage, x: &TensorStorage, dims: MeanDims) -> Result<(), Error> {
    let (y_layout, x_layout) = (y.layout(), x.layout());
    B::reduce_mean(
        B::buffer_mut(y)?,
        y_layout.shape.dims(),
        y_layout.row_stride,
        B::buffer(x)?,
        x_layout.shape.dims(),
        x_layout.row_stride,
        dims,
    )
}

/// `dx += dy / n` for every element along `dim`, where `n = dx.shape[dim]`.
pub fn reduce_mean_backward(dx: &mut TensorStorage, dy: &TensorStorage, dim: usize) -> Result<(), Error> {
    check_operands("reduce_mean_backward", dx, &[dy])?;
    let dims = mean_dims("reduce_mean_backward", dy.shape(), dx.shape(), dim)?;
    match select(dx)? {
        Mode::Host => reduce_mean_backward_impl::<HostBackend>(dx, dy, dims),
        Mode::Accelerator => reduce_mean_backward_impl::<AcceleratorBackend>(dx, dy, dims),
    }
}

fn reduce_mean_backward_impl<B: Backend>(
    dx: &mut TensorStorage,
    dy: &TensorStorage,
    dims: MeanDims,
) -> Result<(), Error> {
    let (dx_layout, dy_layout) = (dx.layout(), dy.layout());
    B::reduce_mean_backward(
        B::buffer_mut(dx)?,
        dx_layout.shape.dims(),
        dx_layout.row_stride,
        B::buffer(dy)?,
        dy_layout.shape.dims(),
        dy_layout.row_stride,
        dims,
    )
}
