//! Functional entry points: each call runs a fresh unit once and records
//! its gradient node in the session.
//!
//! ```rust
//! use dual_tensor_lib::{ops, Session};
//!
//! fn main() -> Result<(), dual_tensor_lib::Error> {
//!     let mut session = Session::default();
//!     let a = session.tensor_from_vec(&[2, 2], &[1.0, 2.0, 3.0, 4.0])?;
//!     let b = session.tensor_from_vec(&[2], &[10.0, 20.0])?;
//!     let y = ops::add(&mut session, a, b)?;
//!     assert_eq!(session.values(y)?, vec![11.0, 22.0, 13.0, 24.0]);
//!
//!     session.backward(y)?;
//!     assert_eq!(session.grad_values(b)?, vec![2.0, 2.0]);
//!     Ok(())
//! }
//! ```

use crate::error::Error;
use crate::registry::Tensor;
use crate::session::Session;
use crate::units::{
    Add, Log, Log10, MatMul, MatMulAdd, Mean, Multiply, Power, Reciprocal, Scale, Sub, Transpose,
    Unit,
};

pub fn add(session: &mut Session, a: Tensor, b: Tensor) -> Result<Tensor, Error> {
    Add::new(session).forward(session, &[a, b])
}

pub fn sub(session: &mut Session, a: Tensor, b: Tensor) -> Result<Tensor, Error> {
    Sub::new(session).forward(session, &[a, b])
}

/// Elementwise product. Back-propagating through it requires accelerator mode.
pub fn mul(session: &mut Session, a: Tensor, b: Tensor) -> Result<Tensor, Error> {
    Multiply::new(session).forward(session, &[a, b])
}

pub fn scale(session: &mut Session, x: Tensor, factor: f32) -> Result<Tensor, Error> {
    Scale::new(session, factor).forward(session, &[x])
}

pub fn pow(session: &mut Session, x: Tensor, exponent: f32) -> Result<Tensor, Error> {
    Power::new(session, exponent).forward(session, &[x])
}

pub fn log(session: &mut Session, x: Tensor) -> Result<Tensor, Error> {
    Log::new(session).forward(session, &[x])
}

pub fn log10(session: &mut Session, x: Tensor) -> Result<Tensor, Error> {
    Log10::new(session).forward(session, &[x])
}

pub fn reciprocal(session: &mut Session, x: Tensor) -> Result<Tensor, Error> {
    Reciprocal::new(session).forward(session, &[x])
}

pub fn transpose(session: &mut Session, x: Tensor) -> Result<Tensor, Error> {
    Transpose::new(session).forward(session, &[x])
}

pub fn matmul(session: &mut Session, a: Tensor, b: Tensor) -> Result<Tensor, Error> {
    MatMul::new(session).forward(session, &[a, b])
}

/// `a · b + c`.
pub fn matmul_add(session: &mut Session, a: Tensor, b: Tensor, c: Tensor) -> Result<Tensor, Error> {
    MatMulAdd::new(session).forward(session, &[a, b, c])
}

/// Mean along `dim`, keeping the axis with size 1.
pub fn mean(session: &mut Session, x: Tensor, dim: usize) -> Result<Tensor, Error> {
    Mean::new(session, dim).forward(session, &[x])
}
