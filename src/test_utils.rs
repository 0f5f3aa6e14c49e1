//! Helpers for comparing host and accelerator results on random inputs.
//!
//! The parity checks build random rank-5 inputs, run an operation in host
//! mode, copy the same inputs to an accelerator, run it again and compare
//! the logical values element by element.

use crate::device::{Device, Mode};
use crate::error::Error;
use crate::shape::Shape;
use crate::storage::TensorStorage;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

/// Default tolerance for host/accelerator comparisons.
pub const PARITY_TOLERANCE: f32 = 1e-5;

/// Random shape of `rank` dimensions, each in `1..=max_dim`.
pub fn random_shape<R: Rng>(rng: &mut R, rank: usize, max_dim: usize) -> Result<Shape, Error> {
    let dims: Vec<usize> = (0..rank).map(|_| rng.random_range(1..=max_dim)).collect();
    Shape::new(&dims)
}

/// Host-mode storage filled from N(0, 1). On an accelerator device the
/// device buffer holds the same values.
pub fn random_storage<R: Rng>(rng: &mut R, shape: &Shape, device: &Device) -> Result<TensorStorage, Error> {
    let dist = Normal::new(0.0f32, 1.0).map_err(|e| Error::InvalidOperation(e.to_string()))?;
    let data: Vec<f32> = (0..shape.size()).map(|_| dist.sample(rng)).collect();
    TensorStorage::from_vec(shape.clone(), &data, device)
}

/// Like [`random_storage`] with values in `[low, high)`, for operations
/// defined only on part of the real line.
pub fn random_storage_in<R: Rng>(
    rng: &mut R,
    shape: &Shape,
    device: &Device,
    low: f32,
    high: f32,
) -> Result<TensorStorage, Error> {
    let dist = Uniform::new(low, high).map_err(|e| Error::InvalidOperation(e.to_string()))?;
    let data: Vec<f32> = (0..shape.size()).map(|_| dist.sample(rng)).collect();
    TensorStorage::from_vec(shape.clone(), &data, device)
}

/// Copy of `storage` switched to accelerator mode with its device buffer
/// refreshed from the host buffer.
pub fn on_accelerator(storage: &TensorStorage) -> Result<TensorStorage, Error> {
    let mut copy = storage.clone();
    copy.to_accelerator()?;
    copy.set_mode(Mode::Accelerator)?;
    Ok(copy)
}

/// Fails with the first index where `actual` and `expected` differ by more
/// than `tolerance`.
pub fn check_close(actual: &[f32], expected: &[f32], tolerance: f32) -> Result<(), Error> {
    if actual.len() != expected.len() {
        return Err(Error::InvalidOperation(format!(
            "length {} differs from expected {}",
            actual.len(),
            expected.len()
        )));
    }
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let diff = (a - e).abs();
        if diff > tolerance || diff.is_nan() {
            return Err(Error::InvalidOperation(format!(
                "element {i}: {a} vs {e} (difference {diff} > {tolerance})"
            )));
        }
    }
    Ok(())
}

/// Runs `op(y, x)` with a random rank-5 `x` on the host and on `device`, and
/// compares the outputs. The output has the shape `output_shape(x)`.
pub fn check_one_argument_parity<R, S, F>(
    rng: &mut R,
    device: &Device,
    output_shape: S,
    op: F,
) -> Result<(), Error>
where
    R: Rng,
    S: Fn(&Shape) -> Result<Shape, Error>,
    F: Fn(&mut TensorStorage, &TensorStorage) -> Result<(), Error>,
{
    let shape = random_shape(rng, 5, 6)?;
    let x = random_storage_in(rng, &shape, device, 0.5, 2.0)?;
    let mut y_host = x.zeros_with_shape(output_shape(&shape)?)?;
    op(&mut y_host, &x)?;

    let x_acc = on_accelerator(&x)?;
    let mut y_acc = on_accelerator(&y_host.zeros_like()?)?;
    op(&mut y_acc, &x_acc)?;

    check_close(&y_acc.to_vec()?, &y_host.to_vec()?, PARITY_TOLERANCE)
}

/// Runs `op(y, a, b)` with random same-shape rank-5 `a`, `b` on the host and
/// on `device`, and compares the outputs.
pub fn check_two_argument_parity<R, F>(rng: &mut R, device: &Device, op: F) -> Result<(), Error>
where
    R: Rng,
    F: Fn(&mut TensorStorage, &TensorStorage, &TensorStorage) -> Result<(), Error>,
{
    let shape = random_shape(rng, 5, 6)?;
    let a = random_storage(rng, &shape, device)?;
    let b = random_storage(rng, &shape, device)?;
    let mut y_host = a.zeros_like()?;
    op(&mut y_host, &a, &b)?;

    let (a_acc, b_acc) = (on_accelerator(&a)?, on_accelerator(&b)?);
    let mut y_acc = on_accelerator(&y_host.zeros_like()?)?;
    op(&mut y_acc, &a_acc, &b_acc)?;

    check_close(&y_acc.to_vec()?, &y_host.to_vec()?, PARITY_TOLERANCE)
}
