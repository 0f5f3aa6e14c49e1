//! Dual host/device tensor storage.

use crate::backend::accelerator::DeviceBuffer;
use crate::device::{Device, Mode};
use crate::error::Error;
use crate::shape::{padded_cols, Shape, DEFAULT_HOST_ALIGNMENT};

/// Logical shape plus the row stride of the buffer it is laid out in.
///
/// Host layouts use the padded column count as stride, device layouts the
/// logical column count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub shape: Shape,
    pub row_stride: usize,
}

/// Tensor values held in a column-padded host buffer and, for storages on an
/// accelerator device, an unpadded device buffer.
///
/// `mode` selects which buffer the raw accessors hand out. Nothing is kept in
/// sync implicitly: callers copy with [`TensorStorage::to_accelerator`] or
/// [`TensorStorage::to_host`] before switching modes when contents matter.
#[derive(Debug, Clone)]
pub struct TensorStorage {
    shape: Shape,
    device: Device,
    mode: Mode,
    alignment: usize,
    padded_cols: usize,
    host: Vec<f32>,
    device_buffer: Option<DeviceBuffer>,
}

impl TensorStorage {
    /// Zero-initialized storage in host mode.
    pub fn new(shape: Shape, device: &Device) -> Result<Self, Error> {
        Self::with_alignment(shape, device, DEFAULT_HOST_ALIGNMENT)
    }

    pub fn with_alignment(shape: Shape, device: &Device, alignment: usize) -> Result<Self, Error> {
        if alignment == 0 {
            return Err(Error::InvalidOperation(
                "host alignment must be at least 1".to_string(),
            ));
        }
        let padded_cols = padded_cols(shape.cols(), alignment);
        let host = vec![0.0; shape.outer_count() * padded_cols];
        let device_buffer = if device.is_accelerator() {
            Some(DeviceBuffer::zeroed(device, shape.size())?)
        } else {
            None
        };
        Ok(Self {
            shape,
            device: device.clone(),
            mode: Mode::Host,
            alignment,
            padded_cols,
            host,
            device_buffer,
        })
    }

    /// Builds host-mode storage from row-major logical values.
    ///
    /// On an accelerator device the values are also copied to the device
    /// buffer, so either mode can be selected right away.
    pub fn from_vec(shape: Shape, data: &[f32], device: &Device) -> Result<Self, Error> {
        let mut storage = Self::new(shape, device)?;
        storage.copy_from_slice(data)?;
        if storage.device_buffer.is_some() {
            storage.to_accelerator()?;
        }
        Ok(storage)
    }

    /// Zeroed storage with the same shape, device, alignment and mode.
    pub fn zeros_like(&self) -> Result<Self, Error> {
        self.zeros_with_shape(self.shape.clone())
    }

    /// Zeroed storage with another shape but this storage's device, alignment and mode.
    pub fn zeros_with_shape(&self, shape: Shape) -> Result<Self, Error> {
        let mut storage = Self::with_alignment(shape, &self.device, self.alignment)?;
        storage.mode = self.mode;
        Ok(storage)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn padded_cols(&self) -> usize {
        self.padded_cols
    }

    /// Length of the host buffer, padding included.
    pub fn host_len(&self) -> usize {
        self.host.len()
    }

    /// Layout of the buffer selected by the current mode.
    pub fn layout(&self) -> Layout {
        Layout {
            shape: self.shape.clone(),
            row_stride: match self.mode {
                Mode::Host => self.padded_cols,
                Mode::Accelerator => self.shape.cols(),
            },
        }
    }

    /// Switches the authoritative buffer without copying.
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), Error> {
        if mode == Mode::Accelerator && self.device_buffer.is_none() {
            return Err(no_device_buffer(&self.device));
        }
        self.mode = mode;
        Ok(())
    }

    /// Copies the host contents into the device buffer.
    ///
    /// Rows are compacted into a staging buffer first, so the transfer itself
    /// moves exactly the logical elements.
    pub fn to_accelerator(&mut self) -> Result<(), Error> {
        let cols = self.shape.cols();
        let mut staging = Vec::with_capacity(self.shape.size());
        for row in self.host.chunks_exact(self.padded_cols) {
            staging.extend_from_slice(&row[..cols]);
        }
        self.device_buffer
            .as_mut()
            .ok_or_else(|| no_device_buffer(&self.device))?
            .copy_from_host(&staging)?;
        tracing::trace!(shape = %self.shape, "copied host to accelerator");
        Ok(())
    }

    /// Copies the device contents into the host buffer, leaving padding as is.
    pub fn to_host(&mut self) -> Result<(), Error> {
        let cols = self.shape.cols();
        let mut staging = vec![0.0; self.shape.size()];
        self.device_buffer
            .as_ref()
            .ok_or_else(|| no_device_buffer(&self.device))?
            .copy_to_host(&mut staging)?;
        for (dst_row, src_row) in self.host.chunks_exact_mut(self.padded_cols).zip(staging.chunks_exact(cols)) {
            dst_row[..cols].copy_from_slice(src_row);
        }
        tracing::trace!(shape = %self.shape, "copied accelerator to host");
        Ok(())
    }

    pub fn host(&self) -> Result<&[f32], Error> {
        self.expect_mode(Mode::Host, "host access")?;
        Ok(&self.host)
    }

    pub fn host_mut(&mut self) -> Result<&mut [f32], Error> {
        self.expect_mode(Mode::Host, "host access")?;
        Ok(&mut self.host)
    }

    pub fn device_data(&self) -> Result<&[f32], Error> {
        self.expect_mode(Mode::Accelerator, "device access")?;
        self.device_buffer
            .as_ref()
            .map(DeviceBuffer::as_slice)
            .ok_or_else(|| Error::InternalLogicError("accelerator mode without buffer".to_string()))
    }

    pub fn device_data_mut(&mut self) -> Result<&mut [f32], Error> {
        self.expect_mode(Mode::Accelerator, "device access")?;
        self.device_buffer
            .as_mut()
            .map(DeviceBuffer::as_mut_slice)
            .ok_or_else(|| Error::InternalLogicError("accelerator mode without buffer".to_string()))
    }

    /// Row-major logical values read from the authoritative buffer.
    pub fn to_vec(&self) -> Result<Vec<f32>, Error> {
        match self.mode {
            Mode::Host => {
                let cols = self.shape.cols();
                let mut out = Vec::with_capacity(self.shape.size());
                for row in self.host.chunks_exact(self.padded_cols) {
                    out.extend_from_slice(&row[..cols]);
                }
                Ok(out)
            }
            Mode::Accelerator => Ok(self.device_data()?.to_vec()),
        }
    }

    /// Writes row-major logical values into the authoritative buffer.
    pub fn copy_from_slice(&mut self, data: &[f32]) -> Result<(), Error> {
        if data.len() != self.shape.size() {
            return Err(Error::shape_mismatch(
                "copy_from_slice",
                format!("{} values for shape {}", data.len(), self.shape),
            ));
        }
        let cols = self.shape.cols();
        match self.mode {
            Mode::Host => {
                let padded = self.padded_cols;
                for (dst, src) in self.host.chunks_exact_mut(padded).zip(data.chunks_exact(cols)) {
                    dst[..cols].copy_from_slice(src);
                }
            }
            Mode::Accelerator => self.device_data_mut()?.copy_from_slice(data),
        }
        Ok(())
    }

    /// Sets every logical element of the authoritative buffer to `value`.
    pub fn fill(&mut self, value: f32) -> Result<(), Error> {
        let cols = self.shape.cols();
        match self.mode {
            Mode::Host => {
                let padded = self.padded_cols;
                for row in self.host.chunks_exact_mut(padded) {
                    row[..cols].fill(value);
                }
            }
            Mode::Accelerator => self.device_data_mut()?.fill(value),
        }
        Ok(())
    }

    /// Reinterprets the storage with a shape of equal size and equal column count.
    ///
    /// Both buffers keep their layout, so no data moves.
    pub fn reshape(&mut self, shape: Shape) -> Result<(), Error> {
        if shape.size() != self.shape.size() || shape.cols() != self.shape.cols() {
            return Err(Error::shape_mismatch(
                "reshape",
                format!("cannot view {} as {}", self.shape, shape),
            ));
        }
        self.shape = shape;
        Ok(())
    }

    fn expect_mode(&self, mode: Mode, op: &str) -> Result<(), Error> {
        if self.mode != mode {
            return Err(Error::ModeMismatch {
                op: op.to_string(),
                expected: mode,
                actual: self.mode,
            });
        }
        Ok(())
    }
}

fn no_device_buffer(device: &Device) -> Error {
    Error::InvalidOperation(format!("storage on {device} has no device buffer"))
}
