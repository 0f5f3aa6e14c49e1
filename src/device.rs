//! Compute targets and the host/accelerator mode flag.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Which physical buffer of a storage object is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Host,
    Accelerator,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Host => write!(f, "Host"),
            Mode::Accelerator => write!(f, "Accelerator"),
        }
    }
}

/// Identifies a compute target.
///
/// Two handles are equal when kind and index match; the name is only a label.
/// There is exactly one host device, so every host handle compares equal.
#[derive(Debug, Clone)]
pub struct Device {
    kind: Mode,
    id: u32,
    name: String,
}

impl Device {
    pub fn host() -> Self {
        Self {
            kind: Mode::Host,
            id: 0,
            name: "host".to_string(),
        }
    }

    pub fn accelerator(id: u32, name: impl Into<String>) -> Self {
        Self {
            kind: Mode::Accelerator,
            id,
            name: name.into(),
        }
    }

    pub fn kind(&self) -> Mode {
        self.kind
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_accelerator(&self) -> bool {
        self.kind == Mode::Accelerator
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::host()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        match (self.kind, other.kind) {
            (Mode::Host, Mode::Host) => true,
            (Mode::Accelerator, Mode::Accelerator) => self.id == other.id,
            _ => false,
        }
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        if self.kind == Mode::Accelerator {
            self.id.hash(state);
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Mode::Host => write!(f, "Host"),
            Mode::Accelerator => write!(f, "Accelerator({}, {})", self.id, self.name),
        }
    }
}
