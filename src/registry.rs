//! Descriptor registry: the single owner of every tensor's storage.

use crate::device::{Device, Mode};
use crate::error::Error;
use crate::shape::Shape;
use crate::storage::TensorStorage;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorKey(pub usize);

impl fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementType {
    #[default]
    Dense,
}

/// Handle to a registered tensor. Copying the handle never copies data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tensor {
    key: DescriptorKey,
}

impl Tensor {
    pub(crate) fn new(key: DescriptorKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> DescriptorKey {
        self.key
    }
}

/// Forward value and gradient accumulator of one tensor.
#[derive(Debug, Clone)]
pub struct TensorDescriptor {
    key: DescriptorKey,
    ty: ElementType,
    pub forward: TensorStorage,
    pub backward: TensorStorage,
}

impl TensorDescriptor {
    pub fn key(&self) -> DescriptorKey {
        self.key
    }

    pub fn element_type(&self) -> ElementType {
        self.ty
    }

    pub fn shape(&self) -> &Shape {
        self.forward.shape()
    }

    pub fn device(&self) -> &Device {
        self.forward.device()
    }

    pub fn mode(&self) -> Mode {
        self.forward.mode()
    }

    /// Switches both storages without copying.
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), Error> {
        self.forward.set_mode(mode)?;
        self.backward.set_mode(mode)
    }

    /// Copies both storages to the device buffers and selects them.
    pub fn to_accelerator(&mut self) -> Result<(), Error> {
        for storage in [&mut self.forward, &mut self.backward] {
            if storage.mode() == Mode::Host {
                storage.to_accelerator()?;
            }
            storage.set_mode(Mode::Accelerator)?;
        }
        Ok(())
    }

    /// Copies both storages back to the host buffers and selects them.
    pub fn to_host(&mut self) -> Result<(), Error> {
        for storage in [&mut self.forward, &mut self.backward] {
            if storage.mode() == Mode::Accelerator {
                storage.to_host()?;
            }
            storage.set_mode(Mode::Host)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct DescriptorRegistry {
    alignment: usize,
    descriptors: HashMap<DescriptorKey, TensorDescriptor>,
    next_key: usize,
}

impl DescriptorRegistry {
    pub fn new(alignment: usize) -> Self {
        Self {
            alignment,
            descriptors: HashMap::new(),
            next_key: 0,
        }
    }

    /// Registers a zero-initialized tensor in host mode.
    pub fn register(&mut self, shape: Shape, ty: ElementType, device: &Device) -> Result<DescriptorKey, Error> {
        let forward = TensorStorage::with_alignment(shape, device, self.alignment)?;
        self.register_storage(forward, ty)
    }

    /// Registers already computed forward values. The gradient accumulator
    /// starts at zero in the same mode.
    pub fn register_storage(&mut self, forward: TensorStorage, ty: ElementType) -> Result<DescriptorKey, Error> {
        let backward = forward.zeros_like()?;
        let key = DescriptorKey(self.next_key);
        self.next_key += 1;
        tracing::debug!(%key, shape = %forward.shape(), mode = %forward.mode(), "registered descriptor");
        self.descriptors.insert(
            key,
            TensorDescriptor {
                key,
                ty,
                forward,
                backward,
            },
        );
        Ok(key)
    }

    pub fn get(&self, key: DescriptorKey) -> Result<&TensorDescriptor, Error> {
        self.descriptors.get(&key).ok_or(Error::UnknownDescriptor(key.0))
    }

    pub fn get_mut(&mut self, key: DescriptorKey) -> Result<&mut TensorDescriptor, Error> {
        self.descriptors
            .get_mut(&key)
            .ok_or(Error::UnknownDescriptor(key.0))
    }

    pub fn release(&mut self, key: DescriptorKey) -> Result<TensorDescriptor, Error> {
        let descriptor = self
            .descriptors
            .remove(&key)
            .ok_or(Error::UnknownDescriptor(key.0))?;
        tracing::debug!(%key, "released descriptor");
        Ok(descriptor)
    }

    pub fn contains(&self, key: DescriptorKey) -> bool {
        self.descriptors.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub(crate) fn descriptors_mut(&mut self) -> impl Iterator<Item = &mut TensorDescriptor> {
        self.descriptors.values_mut()
    }
}
