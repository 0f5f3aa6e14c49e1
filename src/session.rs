//! The session owns every tensor, the gradient history and the configuration
//! that units run under.

use crate::compute;
use crate::config::SessionConfig;
use crate::device::{Device, Mode};
use crate::error::Error;
use crate::graph::{BackwardFn, GradientNode, History};
use crate::registry::{DescriptorKey, DescriptorRegistry, ElementType, Tensor, TensorDescriptor};
use crate::shape::Shape;
use crate::storage::TensorStorage;
use std::collections::HashSet;

#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    registry: DescriptorRegistry,
    history: History,
    next_unit_id: usize,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            registry: DescriptorRegistry::new(SessionConfig::default().host_alignment),
            config: SessionConfig::default(),
            history: History::new(),
            next_unit_id: 0,
        }
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            registry: DescriptorRegistry::new(config.host_alignment),
            config,
            history: History::new(),
            next_unit_id: 0,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Allocates the id a new unit names itself with.
    pub fn next_unit_id(&mut self) -> usize {
        let id = self.next_unit_id;
        self.next_unit_id += 1;
        id
    }

    // --- Tensor creation and access ---

    /// Zero-filled tensor on `device`, in host mode.
    pub fn zeros(&mut self, dims: &[usize], device: &Device) -> Result<Tensor, Error> {
        let key = self
            .registry
            .register(Shape::new(dims)?, ElementType::Dense, device)?;
        Ok(Tensor::new(key))
    }

    /// Tensor holding `data` (row-major) on the configured default device.
    pub fn tensor_from_vec(&mut self, dims: &[usize], data: &[f32]) -> Result<Tensor, Error> {
        let device = self.config.default_device.clone();
        self.tensor_on(&device, dims, data)
    }

    /// Tensor holding `data` on `device`. Accelerator tensors get both
    /// buffers filled and start in host mode.
    pub fn tensor_on(&mut self, device: &Device, dims: &[usize], data: &[f32]) -> Result<Tensor, Error> {
        let tensor = self.zeros(dims, device)?;
        let descriptor = self.registry.get_mut(tensor.key())?;
        descriptor.forward.copy_from_slice(data)?;
        if device.is_accelerator() {
            descriptor.forward.to_accelerator()?;
        }
        Ok(tensor)
    }

    pub fn descriptor(&self, tensor: Tensor) -> Result<&TensorDescriptor, Error> {
        self.registry.get(tensor.key())
    }

    pub fn descriptor_mut(&mut self, tensor: Tensor) -> Result<&mut TensorDescriptor, Error> {
        self.registry.get_mut(tensor.key())
    }

    pub fn storage(&self, tensor: Tensor) -> Result<&TensorStorage, Error> {
        Ok(&self.descriptor(tensor)?.forward)
    }

    pub fn grad(&self, tensor: Tensor) -> Result<&TensorStorage, Error> {
        Ok(&self.descriptor(tensor)?.backward)
    }

    pub fn shape(&self, tensor: Tensor) -> Result<&Shape, Error> {
        Ok(self.storage(tensor)?.shape())
    }

    /// Logical forward values.
    pub fn values(&self, tensor: Tensor) -> Result<Vec<f32>, Error> {
        self.storage(tensor)?.to_vec()
    }

    /// Logical gradient values.
    pub fn grad_values(&self, tensor: Tensor) -> Result<Vec<f32>, Error> {
        self.grad(tensor)?.to_vec()
    }

    /// Overwrites the forward values in the current mode.
    pub fn set_values(&mut self, tensor: Tensor, data: &[f32]) -> Result<(), Error> {
        self.descriptor_mut(tensor)?.forward.copy_from_slice(data)
    }

    pub fn set_mode(&mut self, tensor: Tensor, mode: Mode) -> Result<(), Error> {
        self.descriptor_mut(tensor)?.set_mode(mode)
    }

    pub fn to_accelerator(&mut self, tensor: Tensor) -> Result<(), Error> {
        self.descriptor_mut(tensor)?.to_accelerator()
    }

    pub fn to_host(&mut self, tensor: Tensor) -> Result<(), Error> {
        self.descriptor_mut(tensor)?.to_host()
    }

    /// Drops a tensor. Fails while a recorded gradient node still refers to it.
    pub fn release(&mut self, tensor: Tensor) -> Result<(), Error> {
        let key = tensor.key();
        if self.history.references(key) {
            return Err(Error::DescriptorInUse(key.0));
        }
        self.registry.release(key).map(|_| ())
    }

    // --- Graph recording ---

    /// Registers `output` and records the node that produced it.
    pub fn record(
        &mut self,
        name: impl Into<String>,
        inputs: &[Tensor],
        output: TensorStorage,
        backward: BackwardFn,
    ) -> Result<Tensor, Error> {
        for input in inputs {
            self.registry.get(input.key())?;
        }
        let key = self.registry.register_storage(output, ElementType::Dense)?;
        let node = GradientNode::new(
            name,
            inputs.iter().map(Tensor::key).collect(),
            vec![key],
            backward,
        );
        tracing::debug!(node = %node.name, inputs = ?node.inputs, output = %key, "recorded gradient node");
        self.history.push(node);
        Ok(Tensor::new(key))
    }

    /// Resets every gradient accumulator to zero.
    pub fn zero_grad(&mut self) -> Result<(), Error> {
        for descriptor in self.registry.descriptors_mut() {
            descriptor.backward.fill(0.0)?;
        }
        Ok(())
    }

    /// Back-propagates from `root`.
    ///
    /// The gradient of `root` is overwritten with ones rather than summed
    /// into, so a call retried after an error seeds the same value. Nodes
    /// then run newest first.
    /// A node runs only when one of its outputs has been reached; its
    /// contributions are summed into the input gradients, and the node is
    /// removed from the history. Nodes that were not reached stay recorded.
    /// A node whose contributions cannot all be summed writes none of them
    /// and stays recorded.
    pub fn backward(&mut self, root: Tensor) -> Result<(), Error> {
        let _span = tracing::info_span!("backward", root = %root.key()).entered();
        self.registry.get_mut(root.key())?.backward.fill(1.0)?;

        let mut reached: HashSet<DescriptorKey> = HashSet::from([root.key()]);
        let mut pending = Vec::new();
        let mut nodes = self.history.take();
        let mut result: Result<(), Error> = Ok(());

        while let Some(node) = nodes.pop() {
            if result.is_err() || !node.outputs.iter().any(|key| reached.contains(key)) {
                pending.push(node);
                continue;
            }
            result = self.run_node(&node, &mut reached);
            if result.is_err() {
                pending.push(node);
            }
        }

        pending.reverse();
        self.history.restore(pending);
        result
    }

    fn run_node(&mut self, node: &GradientNode, reached: &mut HashSet<DescriptorKey>) -> Result<(), Error> {
        let _span = tracing::info_span!("node", name = %node.name).entered();
        let contributions: Vec<(DescriptorKey, TensorStorage)> = node
            .inputs
            .iter()
            .zip(node.run(&self.registry)?)
            .filter_map(|(key, contribution)| contribution.map(|c| (*key, c)))
            .collect();
        // A node is committed as a whole or not at all.
        for (key, contribution) in &contributions {
            compute::check_accumulate(&self.registry.get(*key)?.backward, contribution)?;
        }
        for (key, contribution) in contributions {
            compute::accumulate(&mut self.registry.get_mut(key)?.backward, &contribution)?;
            reached.insert(key);
        }
        tracing::trace!("gradient node consumed");
        Ok(())
    }
}
