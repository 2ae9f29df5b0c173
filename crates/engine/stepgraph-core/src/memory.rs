//! Memory blocks, per-device buffers and the fixed-point sizing pass.
//!
//! Block *metadata* (size, shape hint, persistence flags) lives with the owning node in the
//! [`NodeGraph`]; the *buffers* live in per-device [`DeviceMemory`] and are managed by
//! [`MemoryManager`]. Sizes are recomputed by [`update_memory_model`] before every allocation.

use std::fmt;

use hashbrown::HashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::device::{lock_device, SharedDevice};
use crate::error::BuildError;
use crate::graph::{NodeEntry, NodeGraph};
use crate::ids::{DeviceIndex, NodeId};
use crate::node::SizingContext;

/// Dimension hint attached to a block. Purely informational for the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn vector(len: usize) -> Self {
        Self { dims: vec![len] }
    }

    /// Product of all dimensions; `None` for an empty hint.
    pub fn element_count(&self) -> Option<usize> {
        if self.dims.is_empty() {
            None
        } else {
            Some(self.dims.iter().product())
        }
    }
}

/// Current size of a block as seen by consumers during sizing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockSize {
    pub count: usize,
    pub shape: Shape,
}

/// Declaration of an output block, returned by [`Node::memory_blocks`](crate::node::Node::memory_blocks).
#[derive(Clone, Debug)]
pub struct BlockDecl {
    pub name: String,
    pub count: usize,
    pub persistable: bool,
    pub shared: bool,
}

impl BlockDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: 0,
            persistable: false,
            shared: false,
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Mark the block for load/save through [`BlockSerializer`](crate::persistence::BlockSerializer).
    pub fn persistable(mut self) -> Self {
        self.persistable = true;
        self
    }

    /// Mirror the block to every device at step boundaries.
    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }
}

/// Output block metadata owned by exactly one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    pub name: String,
    pub count: usize,
    pub shape: Shape,
    pub persistable: bool,
    pub shared: bool,
    prev_count: usize,
    prev_shape: Shape,
}

impl MemoryBlock {
    pub fn from_decl(decl: BlockDecl) -> Self {
        Self {
            name: decl.name,
            count: decl.count,
            shape: Shape::default(),
            persistable: decl.persistable,
            shared: decl.shared,
            prev_count: decl.count,
            prev_shape: Shape::default(),
        }
    }

    pub fn size(&self) -> BlockSize {
        BlockSize {
            count: self.count,
            shape: self.shape.clone(),
        }
    }

    /// Remember the current size so [`size_changed`](Self::size_changed) can compare after an update.
    pub fn push_size(&mut self) {
        self.prev_count = self.count;
        self.prev_shape = self.shape.clone();
    }

    pub fn size_changed(&self) -> bool {
        self.count != self.prev_count || self.shape != self.prev_shape
    }
}

/// Key of a buffer inside device memory: owning node plus block name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub node: NodeId,
    pub block: String,
}

impl BlockKey {
    pub fn new(node: NodeId, block: impl Into<String>) -> Self {
        Self {
            node,
            block: block.into(),
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.block)
    }
}

/// Buffers allocated on one device.
#[derive(Debug, Default)]
pub struct DeviceMemory {
    buffers: HashMap<BlockKey, Vec<f32>>,
}

impl DeviceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &BlockKey) -> Option<&[f32]> {
        self.buffers.get(key).map(Vec::as_slice)
    }

    pub fn get_mut(&mut self, key: &BlockKey) -> Option<&mut [f32]> {
        self.buffers.get_mut(key).map(Vec::as_mut_slice)
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.buffers.contains_key(key)
    }

    /// Insert a zeroed buffer, or resize an existing one in place.
    pub fn ensure(&mut self, key: BlockKey, count: usize) {
        let buffer = self.buffers.entry(key).or_default();
        buffer.resize(count, 0.0);
    }

    pub fn remove(&mut self, key: &BlockKey) -> Option<Vec<f32>> {
        self.buffers.remove(key)
    }

    /// Temporarily move a buffer out so it can be written while other buffers are read.
    pub(crate) fn take(&mut self, key: &BlockKey) -> Option<Vec<f32>> {
        self.buffers.remove(key)
    }

    pub(crate) fn put(&mut self, key: BlockKey, buffer: Vec<f32>) {
        self.buffers.insert(key, buffer);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total number of allocated elements.
    pub fn allocated_elements(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }
}

/// Allocates, frees and synchronizes node buffers across device memories.
///
/// Only the coordinating thread calls into the manager, and only between steps.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    devices: Vec<SharedDevice>,
}

impl MemoryManager {
    pub fn new(devices: Vec<SharedDevice>) -> Self {
        Self { devices }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn target_devices(&self, owner: DeviceIndex, shared: bool) -> &[SharedDevice] {
        if shared {
            &self.devices
        } else {
            self.devices.get(owner..=owner).unwrap_or(&[])
        }
    }

    /// Allocate (or resize) every output block of `node` on the devices that hold it.
    ///
    /// A node placed on a device that does not exist gets no local buffers; validation
    /// reports such nodes before allocation.
    pub fn allocate_blocks(&self, node: &NodeEntry) {
        if node.device() >= self.devices.len() {
            log::warn!(
                "node '{}' ({}) is placed on missing device {}",
                node.name(),
                node.id(),
                node.device()
            );
        }
        for block in node.outputs().values() {
            let key = BlockKey::new(node.id(), block.name.clone());
            for device in self.target_devices(node.device(), block.shared) {
                lock_device(device).memory.ensure(key.clone(), block.count);
            }
        }
        log::debug!(
            "allocated {} block(s) for node '{}' ({})",
            node.outputs().len(),
            node.name(),
            node.id()
        );
    }

    /// Drop every buffer owned by `node` on every device.
    pub fn free_blocks(&self, node: &NodeEntry) {
        for block in node.outputs().values() {
            let key = BlockKey::new(node.id(), block.name.clone());
            for device in &self.devices {
                lock_device(device).memory.remove(&key);
            }
        }
    }

    /// Copy shared blocks from the owning device to every other device.
    pub fn synchronize_shared_blocks(&self, node: &NodeEntry) {
        if self.devices.len() < 2 {
            return;
        }
        let owner = node.device();
        if owner >= self.devices.len() {
            return;
        }
        for block in node.outputs().values().filter(|b| b.shared) {
            let key = BlockKey::new(node.id(), block.name.clone());
            let Some(data) = self.read(owner, &key) else {
                continue;
            };
            for (index, device) in self.devices.iter().enumerate() {
                if index != owner {
                    lock_device(device).memory.put(key.clone(), data.clone());
                }
            }
        }
    }

    /// Snapshot a buffer from a device.
    pub fn read(&self, device: DeviceIndex, key: &BlockKey) -> Option<Vec<f32>> {
        let state = lock_device(self.devices.get(device)?);
        state.memory.get(key).map(<[f32]>::to_vec)
    }

    /// Overwrite a buffer on a device. Returns `false` when the buffer is not allocated there.
    pub fn write(&self, device: DeviceIndex, key: &BlockKey, data: &[f32]) -> bool {
        let Some(shared) = self.devices.get(device) else {
            return false;
        };
        let mut state = lock_device(shared);
        match state.memory.get_mut(key) {
            Some(buffer) if buffer.len() == data.len() => {
                buffer.copy_from_slice(data);
                true
            }
            _ => false,
        }
    }

    pub fn is_allocated(&self, device: DeviceIndex, key: &BlockKey) -> bool {
        self.devices
            .get(device)
            .map(|d| lock_device(d).memory.contains(key))
            .unwrap_or(false)
    }

    pub fn allocated_elements(&self, device: DeviceIndex) -> usize {
        self.devices
            .get(device)
            .map(|d| lock_device(d).memory.allocated_elements())
            .unwrap_or(0)
    }
}

/// Run sizing passes until no output block changes size.
///
/// Each pass visits the world node first and then `order`. Returns the number of passes
/// performed, or [`BuildError::SizingDidNotConverge`] once `max_attempts` passes still
/// produced changes.
pub fn update_memory_model(
    graph: &mut NodeGraph,
    order: &[NodeId],
    max_attempts: usize,
) -> Result<usize, BuildError> {
    let world = graph.world();
    let visit: Vec<NodeId> = world
        .into_iter()
        .chain(order.iter().copied().filter(|id| Some(*id) != world))
        .collect();
    if visit.is_empty() {
        return Ok(0);
    }

    for attempt in 1..=max_attempts {
        let mut any_changed = false;
        for &id in &visit {
            any_changed |= update_and_check_change(graph, id)?;
        }
        if !any_changed {
            log::debug!("memory model converged after {attempt} pass(es)");
            return Ok(attempt);
        }
    }

    log::error!("memory model did not converge after {max_attempts} passes");
    Err(BuildError::SizingDidNotConverge {
        attempts: max_attempts,
    })
}

fn update_and_check_change(graph: &mut NodeGraph, id: NodeId) -> Result<bool, BuildError> {
    let inputs: IndexMap<String, Option<BlockSize>> = graph.input_sizes(id)?;
    let entry = graph.entry_mut(id)?;
    let (behavior, outputs) = entry.sizing_parts();
    for block in outputs.values_mut() {
        block.push_size();
    }
    let mut ctx = SizingContext::new(id, &inputs, outputs);
    behavior
        .update_memory_blocks(&mut ctx)
        .map_err(|e| BuildError::Sizing(id, e))?;
    Ok(outputs.values().any(MemoryBlock::size_changed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_tracks_size_changes() {
        let mut block = MemoryBlock::from_decl(BlockDecl::new("out").with_count(4));
        block.push_size();
        assert!(!block.size_changed());
        block.count = 5;
        assert!(block.size_changed());
        block.push_size();
        block.shape = Shape::vector(5);
        assert!(block.size_changed());
    }

    #[test]
    fn device_memory_resizes_in_place() {
        let mut mem = DeviceMemory::new();
        let key = BlockKey::new(NodeId(1), "out");
        mem.ensure(key.clone(), 3);
        mem.get_mut(&key).expect("allocated")[0] = 2.0;
        mem.ensure(key.clone(), 5);
        let data = mem.get(&key).expect("allocated");
        assert_eq!(data, &[2.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(mem.allocated_elements(), 5);
    }

    #[test]
    fn shape_element_count() {
        assert_eq!(Shape::new(vec![2, 3]).element_count(), Some(6));
        assert_eq!(Shape::default().element_count(), None);
    }
}
