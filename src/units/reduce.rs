use super::{expect_arity, Unit};
use crate::compute;
use crate::error::Error;
use crate::graph::backward_fn;
use crate::registry::Tensor;
use crate::session::Session;

/// Mean along one axis. The output keeps the axis with size 1.
#[derive(Debug, Clone)]
pub struct Mean {
    name: String,
    dim: usize,
}

impl Mean {
    pub fn new(session: &mut Session, dim: usize) -> Self {
        Self {
            name: format!("Mean{}", session.next_unit_id()),
            dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Unit for Mean {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 1)?;
        session.shape(inputs[0])?.at(self.dim).map(|_| ())
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let x = session.storage(inputs[0])?;
        let mut shape = x.shape().clone();
        shape.set_dim(self.dim, 1)?;
        let mut y = x.zeros_with_shape(shape)?;
        compute::reduce_mean(&mut y, x, self.dim)?;
        let dim = self.dim;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(move |ctx| {
                let mut dx = ctx.input(0)?.zeros_like()?;
                compute::reduce_mean_backward(&mut dx, ctx.output_grad(0)?, dim)?;
                Ok(vec![Some(dx)])
            }),
        )
    }
}
