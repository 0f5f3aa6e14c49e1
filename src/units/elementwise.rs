use super::{expect_arity, Unit};
use crate::compute;
use crate::error::Error;
use crate::graph::backward_fn;
use crate::registry::Tensor;
use crate::session::Session;
use crate::util::broadcast_shapes;
use std::f32::consts::LN_10;

fn unit_name(kind: &str, session: &mut Session) -> String {
    format!("{kind}{}", session.next_unit_id())
}

/// Fails with `ShapeMismatch` unless the two inputs broadcast against each other.
fn check_broadcastable(session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
    broadcast_shapes(session.shape(inputs[0])?, session.shape(inputs[1])?).map(|_| ())
}

// --- Add ---

#[derive(Debug, Clone)]
pub struct Add {
    name: String,
}

impl Add {
    pub fn new(session: &mut Session) -> Self {
        Self {
            name: unit_name("Add", session),
        }
    }
}

impl Unit for Add {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 2)?;
        check_broadcastable(session, inputs)
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let (a, b) = (session.storage(inputs[0])?, session.storage(inputs[1])?);
        let mut y = a.zeros_with_shape(broadcast_shapes(a.shape(), b.shape())?)?;
        compute::add(&mut y, a, b)?;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(|ctx| {
                let dy = ctx.output_grad(0)?;
                Ok(vec![Some(dy.clone()), Some(dy.clone())])
            }),
        )
    }
}

// --- Sub ---

#[derive(Debug, Clone)]
pub struct Sub {
    name: String,
}

impl Sub {
    pub fn new(session: &mut Session) -> Self {
        Self {
            name: unit_name("Sub", session),
        }
    }
}

impl Unit for Sub {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 2)?;
        check_broadcastable(session, inputs)
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let (a, b) = (session.storage(inputs[0])?, session.storage(inputs[1])?);
        let mut y = a.zeros_with_shape(broadcast_shapes(a.shape(), b.shape())?)?;
        compute::sub(&mut y, a, b)?;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(|ctx| {
                let dy = ctx.output_grad(0)?;
                let mut negated = dy.zeros_like()?;
                compute::scale(&mut negated, dy, -1.0)?;
                Ok(vec![Some(dy.clone()), Some(negated)])
            }),
        )
    }
}

// --- Multiply ---

/// Elementwise product. Its gradient is only available on the accelerator.
#[derive(Debug, Clone)]
pub struct Multiply {
    name: String,
}

impl Multiply {
    pub fn new(session: &mut Session) -> Self {
        Self {
            name: unit_name("Multiply", session),
        }
    }
}

impl Unit for Multiply {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 2)?;
        check_broadcastable(session, inputs)
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let (a, b) = (session.storage(inputs[0])?, session.storage(inputs[1])?);
        let mut y = a.zeros_with_shape(broadcast_shapes(a.shape(), b.shape())?)?;
        compute::elementwise_product(&mut y, a, b)?;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(|ctx| {
                let (a, b) = (ctx.input(0)?, ctx.input(1)?);
                let (mut da, mut db) = (a.zeros_like()?, b.zeros_like()?);
                compute::elementwise_product_backward(&mut da, &mut db, ctx.output_grad(0)?, a, b)?;
                Ok(vec![Some(da), Some(db)])
            }),
        )
    }
}

// --- Scale ---

#[derive(Debug, Clone)]
pub struct Scale {
    name: String,
    factor: f32,
}

impl Scale {
    pub fn new(session: &mut Session, factor: f32) -> Self {
        Self {
            name: unit_name("Scale", session),
            factor,
        }
    }
}

impl Unit for Scale {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, _session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 1)
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let x = session.storage(inputs[0])?;
        let mut y = x.zeros_like()?;
        compute::scale(&mut y, x, self.factor)?;
        let factor = self.factor;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(move |ctx| {
                let dy = ctx.output_grad(0)?;
                let mut dx = ctx.input(0)?.zeros_like()?;
                compute::scale(&mut dx, dy, factor)?;
                Ok(vec![Some(dx)])
            }),
        )
    }
}

// --- Power ---

/// `y = x^p` for a constant exponent `p`.
#[derive(Debug, Clone)]
pub struct Power {
    name: String,
    exponent: f32,
}

impl Power {
    pub fn new(session: &mut Session, exponent: f32) -> Self {
        Self {
            name: unit_name("Power", session),
            exponent,
        }
    }
}

impl Unit for Power {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, _session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 1)
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let x = session.storage(inputs[0])?;
        let mut y = x.zeros_like()?;
        compute::pow(&mut y, x, self.exponent)?;
        let exponent = self.exponent;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(move |ctx| {
                // dx = dy * p * x^(p - 1)
                let x = ctx.input(0)?;
                let mut lowered = x.zeros_like()?;
                compute::pow(&mut lowered, x, exponent - 1.0)?;
                let mut local = x.zeros_like()?;
                compute::scale(&mut local, &lowered, exponent)?;
                let mut dx = x.zeros_like()?;
                compute::elementwise_product(&mut dx, ctx.output_grad(0)?, &local)?;
                Ok(vec![Some(dx)])
            }),
        )
    }
}

// --- Log / Log10 ---

/// Natural logarithm.
#[derive(Debug, Clone)]
pub struct Log {
    name: String,
}

impl Log {
    pub fn new(session: &mut Session) -> Self {
        Self {
            name: unit_name("Log", session),
        }
    }
}

impl Unit for Log {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, _session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 1)
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let x = session.storage(inputs[0])?;
        let mut y = x.zeros_like()?;
        compute::log(&mut y, x)?;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(|ctx| {
                let x = ctx.input(0)?;
                let mut inverse = x.zeros_like()?;
                compute::reciprocal(&mut inverse, x)?;
                let mut dx = x.zeros_like()?;
                compute::elementwise_product(&mut dx, ctx.output_grad(0)?, &inverse)?;
                Ok(vec![Some(dx)])
            }),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Log10 {
    name: String,
}

impl Log10 {
    pub fn new(session: &mut Session) -> Self {
        Self {
            name: unit_name("Log10", session),
        }
    }
}

impl Unit for Log10 {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, _session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 1)
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let x = session.storage(inputs[0])?;
        let mut y = x.zeros_like()?;
        compute::log10(&mut y, x)?;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(|ctx| {
                // dx = dy / (x ln 10)
                let x = ctx.input(0)?;
                let mut inverse = x.zeros_like()?;
                compute::reciprocal(&mut inverse, x)?;
                let mut local = x.zeros_like()?;
                compute::scale(&mut local, &inverse, 1.0 / LN_10)?;
                let mut dx = x.zeros_like()?;
                compute::elementwise_product(&mut dx, ctx.output_grad(0)?, &local)?;
                Ok(vec![Some(dx)])
            }),
        )
    }
}

// --- Reciprocal ---

#[derive(Debug, Clone)]
pub struct Reciprocal {
    name: String,
}

impl Reciprocal {
    pub fn new(session: &mut Session) -> Self {
        Self {
            name: unit_name("Reciprocal", session),
        }
    }
}

impl Unit for Reciprocal {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, _session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 1)
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let x = session.storage(inputs[0])?;
        let mut y = x.zeros_like()?;
        compute::reciprocal(&mut y, x)?;
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(|ctx| {
                // d(1/x)/dx = -(1/x)^2, and 1/x is the recorded output.
                let y = ctx.output(0)?;
                let mut squared = y.zeros_like()?;
                compute::pow(&mut squared, y, 2.0)?;
                let mut local = y.zeros_like()?;
                compute::scale(&mut local, &squared, -1.0)?;
                let mut dx = ctx.input(0)?.zeros_like()?;
                compute::elementwise_product(&mut dx, ctx.output_grad(0)?, &local)?;
                Ok(vec![Some(dx)])
            }),
        )
    }
}
