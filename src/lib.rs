//! A dual host/accelerator tensor substrate with broadcasting dispatch and
//! gradient recording.
//!
//! This library provides:
//! - Tensor storage holding a column-padded host buffer and an unpadded
//!   device buffer, with an explicit mode flag selecting the authoritative one
//! - A broadcast engine shared by elementwise operations, batched matrix
//!   products and gradient reduction
//! - A dispatch layer with host kernels over strided `ndarray` views and an
//!   emulated accelerator with its own flat-index kernels
//! - A descriptor registry, operation units and a gradient history driven by
//!   [`Session::backward`]
//!
//! # Example
//! ```rust
//! use dual_tensor_lib::{ops, Device, Session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = Session::default();
//!     let acc = Device::accelerator(0, "acc0");
//!     let a = session.tensor_on(&acc, &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
//!     let b = session.tensor_on(&acc, &[3], &[1.0, 1.0, 1.0])?;
//!     session.to_accelerator(a)?;
//!     session.to_accelerator(b)?;
//!
//!     let y = ops::mul(&mut session, a, b)?;
//!     let loss = ops::mean(&mut session, y, 1)?;
//!     session.backward(loss)?;
//!
//!     session.to_host(a)?;
//!     println!("d loss / d a = {:?}", session.grad_values(a)?);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod compute;
pub mod config;
pub mod device;
pub mod error;
pub mod graph;
pub mod ops;
pub mod registry;
pub mod session;
pub mod shape;
pub mod storage;
pub mod units;
pub mod util;

// Used by the integration tests and benches as well as unit tests.
pub mod test_utils;

pub use backend::{AcceleratorBackend, Backend, HostBackend};
pub use config::SessionConfig;
pub use device::{Device, Mode};
pub use error::Error;
pub use graph::{GradientNode, History};
pub use registry::{DescriptorKey, DescriptorRegistry, ElementType, Tensor, TensorDescriptor};
pub use session::Session;
pub use shape::Shape;
pub use storage::{Layout, TensorStorage};
pub use units::{Unit, UnitCache};
