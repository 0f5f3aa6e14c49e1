//! Session-level configuration.

use crate::device::Device;
use crate::error::Error;
use crate::shape::DEFAULT_HOST_ALIGNMENT;

pub const ENV_HOST_ALIGNMENT: &str = "DUAL_TENSOR_HOST_ALIGNMENT";
pub const ENV_BATCHED_GEMM: &str = "DUAL_TENSOR_BATCHED_GEMM";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Host buffers pad their last dimension to a multiple of this many floats.
    pub host_alignment: usize,
    /// Allow the single-call batched gemm on the accelerator.
    pub batched_gemm_fast_path: bool,
    /// Device used by `Session::tensor_from_vec` when none is given.
    pub default_device: Device,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_alignment: DEFAULT_HOST_ALIGNMENT,
            batched_gemm_fast_path: true,
            default_device: Device::host(),
        }
    }
}

impl SessionConfig {
    pub fn with_host_alignment(mut self, alignment: usize) -> Self {
        self.host_alignment = alignment;
        self
    }

    pub fn with_batched_gemm(mut self, enabled: bool) -> Self {
        self.batched_gemm_fast_path = enabled;
        self
    }

    pub fn with_default_device(mut self, device: Device) -> Self {
        self.default_device = device;
        self
    }

    /// Reads overrides from the environment on top of the defaults.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(ENV_HOST_ALIGNMENT) {
            config.host_alignment = raw.trim().parse().map_err(|_| {
                Error::InvalidOperation(format!("{ENV_HOST_ALIGNMENT}={raw} is not an integer"))
            })?;
        }
        if let Ok(raw) = std::env::var(ENV_BATCHED_GEMM) {
            config.batched_gemm_fast_path = match raw.trim() {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                other => {
                    return Err(Error::InvalidOperation(format!(
                        "{ENV_BATCHED_GEMM}={other} is not a boolean"
                    )))
                }
            };
        }
        config.validate()?;
        tracing::debug!(?config, "session config loaded from environment");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.host_alignment == 0 || !self.host_alignment.is_power_of_two() {
            return Err(Error::InvalidOperation(format!(
                "host alignment must be a power of two, got {}",
                self.host_alignment
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let config = SessionConfig::default().with_host_alignment(6);
        assert!(matches!(config.validate(), Err(Error::InvalidOperation(_))));
    }
}
