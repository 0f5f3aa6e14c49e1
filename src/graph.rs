//! Gradient nodes and the history they are recorded in.

use crate::error::Error;
use crate::registry::{DescriptorKey, DescriptorRegistry};
use crate::storage::TensorStorage;
use std::fmt;

/// One gradient contribution per node input; `None` when the input receives
/// nothing from this node.
pub type Contributions = Vec<Option<TensorStorage>>;

pub type BackwardFn = Box<dyn Fn(&BackwardContext<'_>) -> Result<Contributions, Error>>;

/// Boxes a closure as a [`BackwardFn`], fixing its signature for inference.
pub fn backward_fn<F>(f: F) -> BackwardFn
where
    F: Fn(&BackwardContext<'_>) -> Result<Contributions, Error> + 'static,
{
    Box::new(f)
}

/// Read access to the tensors a node was recorded with, handed to its
/// backward function.
pub struct BackwardContext<'a> {
    registry: &'a DescriptorRegistry,
    node: &'a GradientNode,
}

impl<'a> BackwardContext<'a> {
    pub(crate) fn new(registry: &'a DescriptorRegistry, node: &'a GradientNode) -> Self {
        Self { registry, node }
    }

    /// Forward value of input `index`.
    pub fn input(&self, index: usize) -> Result<&'a TensorStorage, Error> {
        let key = self.key(&self.node.inputs, index)?;
        Ok(&self.registry.get(key)?.forward)
    }

    /// Forward value of output `index`.
    pub fn output(&self, index: usize) -> Result<&'a TensorStorage, Error> {
        let key = self.key(&self.node.outputs, index)?;
        Ok(&self.registry.get(key)?.forward)
    }

    /// Accumulated gradient of output `index`.
    pub fn output_grad(&self, index: usize) -> Result<&'a TensorStorage, Error> {
        let key = self.key(&self.node.outputs, index)?;
        Ok(&self.registry.get(key)?.backward)
    }

    fn key(&self, keys: &[DescriptorKey], index: usize) -> Result<DescriptorKey, Error> {
        keys.get(index).copied().ok_or_else(|| {
            Error::InternalLogicError(format!(
                "{} has no tensor at position {index}",
                self.node.name
            ))
        })
    }
}

pub struct GradientNode {
    pub name: String,
    pub inputs: Vec<DescriptorKey>,
    pub outputs: Vec<DescriptorKey>,
    backward: BackwardFn,
}

impl GradientNode {
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<DescriptorKey>,
        outputs: Vec<DescriptorKey>,
        backward: BackwardFn,
    ) -> Self {
        Self {
            name: name.into(),
            inputs,
            outputs,
            backward,
        }
    }

    pub fn references(&self, key: DescriptorKey) -> bool {
        self.inputs.contains(&key) || self.outputs.contains(&key)
    }

    /// Runs the backward function. The result holds exactly one entry per input.
    pub fn run(&self, registry: &DescriptorRegistry) -> Result<Contributions, Error> {
        let contributions = (self.backward)(&BackwardContext::new(registry, self))?;
        if contributions.len() != self.inputs.len() {
            return Err(Error::InternalLogicError(format!(
                "{} returned {} gradients for {} inputs",
                self.name,
                contributions.len(),
                self.inputs.len()
            )));
        }
        Ok(contributions)
    }
}

impl fmt::Debug for GradientNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradientNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Gradient nodes in creation order.
#[derive(Debug, Default)]
pub struct History {
    nodes: Vec<GradientNode>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: GradientNode) {
        self.nodes.push(node);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GradientNode> {
        self.nodes.iter()
    }

    pub fn references(&self, key: DescriptorKey) -> bool {
        self.nodes.iter().any(|node| node.references(key))
    }

    /// Removes and returns every node, oldest first.
    pub(crate) fn take(&mut self) -> Vec<GradientNode> {
        std::mem::take(&mut self.nodes)
    }

    /// Puts back nodes returned by `take` that were not consumed, oldest first.
    pub(crate) fn restore(&mut self, mut nodes: Vec<GradientNode>) {
        nodes.append(&mut self.nodes);
        self.nodes = nodes;
    }
}
