use crate::device::Device;
use crate::error::Error;

/// Memory owned by an accelerator device.
///
/// Device buffers are unpadded: their length is exactly the logical element
/// count of the tensor they back. Kernels only ever see borrowed slices of the
/// buffer for the duration of one call.
#[derive(Clone)]
pub struct DeviceBuffer {
    device: Device,
    data: Box<[f32]>,
}

impl DeviceBuffer {
    pub fn zeroed(device: &Device, len: usize) -> Result<Self, Error> {
        if !device.is_accelerator() {
            return Err(Error::InvalidOperation(format!(
                "cannot allocate device memory on {device}"
            )));
        }
        tracing::trace!(%device, len, "allocating device buffer");
        Ok(Self {
            device: device.clone(),
            data: vec![0.0; len].into_boxed_slice(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Blocking host-to-device copy of exactly `len()` elements.
    pub fn copy_from_host(&mut self, src: &[f32]) -> Result<(), Error> {
        if src.len() != self.data.len() {
            return Err(Error::InternalLogicError(format!(
                "host-to-device copy of {} elements into a buffer of {}",
                src.len(),
                self.data.len()
            )));
        }
        self.data.copy_from_slice(src);
        Ok(())
    }

    /// Blocking device-to-host copy of exactly `len()` elements.
    pub fn copy_to_host(&self, dst: &mut [f32]) -> Result<(), Error> {
        if dst.len() != self.data.len() {
            return Err(Error::InternalLogicError(format!(
                "device-to-host copy of {} elements into a buffer of {}",
                self.data.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(&self.data);
        Ok(())
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device)
            .field("len", &self.data.len())
            .finish()
    }
}
