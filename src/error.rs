use crate::device::{Device, Mode};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid shape {0:?}: every shape needs at least one dimension and no zero-sized dimensions")]
    InvalidShape(Vec<usize>),

    #[error("Shape mismatch in {op}: {detail}")]
    ShapeMismatch { op: String, detail: String },

    #[error("Mode mismatch in {op}: expected {expected}, got {actual}")]
    ModeMismatch {
        op: String,
        expected: Mode,
        actual: Mode,
    },

    #[error("Device mismatch in {op}: {expected} and {actual}")]
    DeviceMismatch {
        op: String,
        expected: Device,
        actual: Device,
    },

    #[error("Unknown tensor descriptor key {0}")]
    UnknownDescriptor(usize),

    #[error("Tensor descriptor {0} is still referenced by a gradient node")]
    DescriptorInUse(usize),

    #[error("Argument shape mismatch for {unit}: {detail}")]
    ArgumentShapeMismatch { unit: String, detail: String },

    #[error("{0} is not implemented on the host")]
    UnsupportedOnHost(String),

    #[error("{0} is not implemented on the accelerator")]
    UnsupportedOnAccelerator(String),

    #[error("Dimension {dim} of the output must be 1 for reduction, got shape {shape:?}")]
    DimensionNotReduced { dim: usize, shape: Vec<usize> },

    #[error("Axis {axis} is out of range for rank {rank}")]
    InvalidAxis { axis: usize, rank: usize },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal logic error: {0}")]
    InternalLogicError(String),
}

impl Error {
    pub(crate) fn shape_mismatch(op: &str, detail: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            op: op.to_string(),
            detail: detail.into(),
        }
    }

    /// The error returned when an operation has no kernel for `mode`.
    pub(crate) fn unsupported(op: &str, mode: Mode) -> Self {
        match mode {
            Mode::Host => Error::UnsupportedOnHost(op.to_string()),
            Mode::Accelerator => Error::UnsupportedOnAccelerator(op.to_string()),
        }
    }
}
