//! Execution context handed to [`Task::execute`](crate::node::Task::execute).

use anyhow::{anyhow, Result};
use indexmap::IndexMap;

use crate::ids::{DeviceIndex, NodeId};
use crate::memory::{BlockKey, DeviceMemory};

/// Resolved block keys of one node, captured when the plan is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeBindings {
    pub node: NodeId,
    pub name: String,
    pub inputs: IndexMap<String, BlockKey>,
}

impl NodeBindings {
    pub fn input_key(&self, input: &str) -> Result<&BlockKey> {
        self.inputs
            .get(input)
            .ok_or_else(|| anyhow!("node '{}' has no input '{input}'", self.name))
    }

    pub fn output_key(&self, output: &str) -> BlockKey {
        BlockKey::new(self.node, output)
    }
}

/// Memory and step information visible to a running task.
pub struct TaskContext<'a> {
    device: DeviceIndex,
    step: u64,
    bindings: &'a NodeBindings,
    memory: &'a mut DeviceMemory,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        device: DeviceIndex,
        step: u64,
        bindings: &'a NodeBindings,
        memory: &'a mut DeviceMemory,
    ) -> Self {
        Self {
            device,
            step,
            bindings,
            memory,
        }
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    /// Simulation step being executed.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn node(&self) -> NodeId {
        self.bindings.node
    }

    pub fn node_name(&self) -> &str {
        &self.bindings.name
    }

    pub fn input(&self, input: &str) -> Result<&[f32]> {
        let key = self.bindings.input_key(input)?;
        self.memory
            .get(key)
            .ok_or_else(|| anyhow!("block {key} is not allocated on device {}", self.device))
    }

    pub fn output(&mut self, output: &str) -> Result<&mut [f32]> {
        let key = self.bindings.output_key(output);
        let device = self.device;
        self.memory
            .get_mut(&key)
            .ok_or_else(|| anyhow!("block {key} is not allocated on device {device}"))
    }

    /// Write `output` while reading inputs through `reader`.
    pub fn with_output<R>(
        &mut self,
        output: &str,
        f: impl FnOnce(&BlockReader<'_>, &mut [f32]) -> Result<R>,
    ) -> Result<R> {
        let key = self.bindings.output_key(output);
        let mut buffer = self
            .memory
            .take(&key)
            .ok_or_else(|| anyhow!("block {key} is not allocated on device {}", self.device))?;
        let reader = BlockReader {
            device: self.device,
            bindings: self.bindings,
            memory: &*self.memory,
        };
        let result = f(&reader, &mut buffer);
        self.memory.put(key, buffer);
        result
    }
}

/// Read-only access to the inputs of a node while one of its outputs is borrowed.
pub struct BlockReader<'a> {
    device: DeviceIndex,
    bindings: &'a NodeBindings,
    memory: &'a DeviceMemory,
}

impl BlockReader<'_> {
    pub fn input(&self, input: &str) -> Result<&[f32]> {
        let key = self.bindings.input_key(input)?;
        self.memory
            .get(key)
            .ok_or_else(|| anyhow!("block {key} is not allocated on device {}", self.device))
    }
}
