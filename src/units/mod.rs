//! Operation modules ("units").
//!
//! A unit validates its arguments, computes its output into fresh storage,
//! and records a gradient node whose backward function owns everything it
//! needs beyond the node's own inputs and outputs. Units that keep auxiliary
//! tensors between calls do so in a [`UnitCache`].

use crate::compute;
use crate::error::Error;
use crate::registry::Tensor;
use crate::session::Session;
use crate::shape::Shape;
use crate::storage::TensorStorage;
use std::collections::HashMap;

mod elementwise;
mod linear;
mod matmul;
mod reduce;

pub use elementwise::{Add, Log, Log10, Multiply, Power, Reciprocal, Scale, Sub};
pub use linear::Linear;
pub use matmul::{MatMul, MatMulAdd, Transpose};
pub use reduce::Mean;

pub trait Unit {
    fn name(&self) -> &str;

    /// Unit-specific validation run before anything is computed.
    fn check_arguments(&self, session: &Session, inputs: &[Tensor]) -> Result<(), Error>;

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error>;
}

/// Named scratch tensors owned by one unit.
///
/// An entry is created on first request and recreated whenever the requested
/// shape, mode or device no longer matches.
#[derive(Debug, Default)]
pub struct UnitCache {
    entries: HashMap<String, TensorStorage>,
}

impl UnitCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry `name` with `shape`, laid out like `template`.
    pub fn get_or_create(
        &mut self,
        name: &str,
        shape: &Shape,
        template: &TensorStorage,
    ) -> Result<&mut TensorStorage, Error> {
        let stale = self.entries.get(name).map_or(true, |entry| {
            entry.shape() != shape
                || entry.mode() != template.mode()
                || entry.device() != template.device()
        });
        if stale {
            tracing::trace!(name, %shape, "creating cache entry");
            self.entries
                .insert(name.to_string(), template.zeros_with_shape(shape.clone())?);
        }
        self.entries
            .get_mut(name)
            .ok_or_else(|| Error::InternalLogicError(format!("cache entry {name} vanished")))
    }

    pub fn get(&self, name: &str) -> Option<&TensorStorage> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub(crate) fn expect_arity(unit: &str, inputs: &[Tensor], expected: usize) -> Result<(), Error> {
    if inputs.len() != expected {
        return Err(Error::InvalidOperation(format!(
            "{unit} takes {expected} inputs, got {}",
            inputs.len()
        )));
    }
    Ok(())
}

/// `y = a · b (+ c)`, batched in one call when `batched` allows it.
pub(crate) fn gemm(
    batched: bool,
    y: &mut TensorStorage,
    a: &TensorStorage,
    b: &TensorStorage,
    c: Option<&TensorStorage>,
) -> Result<(), Error> {
    match (c, batched) {
        (Some(c), true) => compute::matmul_add(y, a, b, c),
        (Some(c), false) => compute::matmul_add_generic(y, a, b, c),
        (None, true) => compute::matmul(y, a, b),
        (None, false) => compute::matmul_generic(y, a, b),
    }
}

/// Transposed copy of `x`.
pub(crate) fn transposed(x: &TensorStorage) -> Result<TensorStorage, Error> {
    let mut y = x.zeros_with_shape(x.shape().transposed())?;
    compute::transpose(&mut y, x)?;
    Ok(y)
}

/// Copy of `x` viewed with `shape`.
pub(crate) fn reshaped(x: &TensorStorage, shape: Shape) -> Result<TensorStorage, Error> {
    let mut y = x.clone();
    y.reshape(shape)?;
    Ok(y)
}
