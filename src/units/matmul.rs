use super::{expect_arity, gemm, transposed, Unit};
use crate::compute;
use crate::error::Error;
use crate::graph::{backward_fn, BackwardContext, Contributions};
use crate::registry::Tensor;
use crate::session::Session;
use crate::shape::Shape;
use crate::storage::TensorStorage;
use crate::util::broadcast_shapes;

/// Output shape of `a · b`: the broadcast batch of both operands followed by
/// `a.rows() × b.cols()`.
pub(crate) fn matmul_shape(unit: &str, a: &Shape, b: &Shape) -> Result<Shape, Error> {
    if a.cols() != b.rows() {
        return Err(Error::ArgumentShapeMismatch {
            unit: unit.to_string(),
            detail: format!("cannot multiply {a} by {b}"),
        });
    }
    let (a2, b2) = (a.expanded(2), b.expanded(2));
    // Batch dims plus a trailing 1 so rank-2 operands still form a valid shape.
    let batch_of = |s: &Shape| {
        let mut dims = s.dims()[..s.rank() - 2].to_vec();
        dims.push(1);
        Shape::new(&dims)
    };
    let batch = broadcast_shapes(&batch_of(&a2)?, &batch_of(&b2)?)?;
    let mut dims = batch.dims()[..batch.rank() - 1].to_vec();
    dims.extend([a.rows(), b.cols()]);
    Shape::new(&dims)
}

/// `da = dy · bᵀ`, `db = aᵀ · dy`, each at the full output batch; the
/// accumulation into the input gradients sums broadcast batch elements.
fn matmul_backward(ctx: &BackwardContext<'_>, batched: bool) -> Result<(TensorStorage, TensorStorage), Error> {
    let (a, b, dy) = (ctx.input(0)?, ctx.input(1)?, ctx.output_grad(0)?);
    let mut da = dy.zeros_with_shape(dy.shape().with_cols(a.shape().cols()))?;
    gemm(batched, &mut da, dy, &transposed(b)?, None)?;

    let mut db_shape = dy.shape().with_cols(b.shape().cols());
    let rank = db_shape.rank();
    db_shape.set_dim(rank - 2, b.shape().rows())?;
    let mut db = dy.zeros_with_shape(db_shape)?;
    gemm(batched, &mut db, &transposed(a)?, dy, None)?;
    Ok((da, db))
}

// --- Transpose ---

/// Swaps the trailing two dimensions.
#[derive(Debug, Clone)]
pub struct Transpose {
    name: String,
}

impl Transpose {
    pub fn new(session: &mut Session) -> Self {
        Self {
            name: format!("Transpose{}", session.next_unit_id()),
        }
    }
}

impl Unit for Transpose {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, _session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 1)
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let y = transposed(session.storage(inputs[0])?)?;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(|ctx| {
                let mut dx = ctx.input(0)?.zeros_like()?;
                compute::transpose(&mut dx, ctx.output_grad(0)?)?;
                Ok(vec![Some(dx)])
            }),
        )
    }
}

// --- MatMul ---

/// `y = a · b` over the trailing two dimensions with batch broadcasting.
#[derive(Debug, Clone)]
pub struct MatMul {
    name: String,
}

impl MatMul {
    pub fn new(session: &mut Session) -> Self {
        Self {
            name: format!("MatMul{}", session.next_unit_id()),
        }
    }
}

impl Unit for MatMul {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 2)?;
        matmul_shape(&self.name, session.shape(inputs[0])?, session.shape(inputs[1])?).map(|_| ())
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let batched = session.config().batched_gemm_fast_path;
        let (a, b) = (session.storage(inputs[0])?, session.storage(inputs[1])?);
        let mut y = a.zeros_with_shape(matmul_shape(&self.name, a.shape(), b.shape())?)?;
        gemm(batched, &mut y, a, b, None)?;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(move |ctx| -> Result<Contributions, Error> {
                let (da, db) = matmul_backward(ctx, batched)?;
                Ok(vec![Some(da), Some(db)])
            }),
        )
    }
}

// --- MatMulAdd ---

/// `y = a · b + c`, where `c` has the output's blocks or a single row.
#[derive(Debug, Clone)]
pub struct MatMulAdd {
    name: String,
}

impl MatMulAdd {
    pub fn new(session: &mut Session) -> Self {
        Self {
            name: format!("MatMulAdd{}", session.next_unit_id()),
        }
    }
}

impl Unit for MatMulAdd {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 3)?;
        let y = matmul_shape(&self.name, session.shape(inputs[0])?, session.shape(inputs[1])?)?;
        let c = session.shape(inputs[2])?;
        if (c.rows() != y.rows() && c.rows() != 1) || c.cols() != y.cols() {
            return Err(Error::ArgumentShapeMismatch {
                unit: self.name.clone(),
                detail: format!("addend {c} does not fit output {y}"),
            });
        }
        Ok(())
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let batched = session.config().batched_gemm_fast_path;
        let a = session.storage(inputs[0])?;
        let b = session.storage(inputs[1])?;
        let c = session.storage(inputs[2])?;
        let shape = matmul_shape(&self.name, a.shape(), b.shape())?;
        let shape = broadcast_shapes(&shape, c.shape())?;
        let mut y = a.zeros_with_shape(shape)?;
        gemm(batched, &mut y, a, b, Some(c))?;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(move |ctx| -> Result<Contributions, Error> {
                let (da, db) = matmul_backward(ctx, batched)?;
                Ok(vec![Some(da), Some(db), Some(ctx.output_grad(0)?.clone())])
            }),
        )
    }
}
