//! Identifiers and simple allocators for graph entities and plan blocks.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GraphError;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskId(pub u32);

/// Index of a compute device; one worker thread serves each device.
pub type DeviceIndex = usize;

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Which of the two plan trees a block belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    Init,
    Standard,
}

/// Identity of a branch in a plan tree.
///
/// Derived from the node that owns the grouping (`None` for the plan root), so a
/// rebuild of an unchanged graph hands out the same identities.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub node: Option<NodeId>,
    pub plan: PlanKind,
}

impl BlockId {
    pub fn root(plan: PlanKind) -> Self {
        Self { node: None, plan }
    }

    pub fn for_node(node: NodeId, plan: PlanKind) -> Self {
        Self {
            node: Some(node),
            plan,
        }
    }
}

/// Identity of anything that can sit in a plan tree: a task leaf or a branch.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ExecutableId {
    Task(TaskId),
    Block(BlockId),
}

impl From<TaskId> for ExecutableId {
    fn from(id: TaskId) -> Self {
        ExecutableId::Task(id)
    }
}

impl From<BlockId> for ExecutableId {
    fn from(id: BlockId) -> Self {
        ExecutableId::Block(id)
    }
}

/// Monotonic allocator for NodeId and TaskId.
/// Handles are never reused, so a stale id cannot alias a newer node.
#[derive(Default, Debug, Clone)]
pub struct IdAllocator {
    next_node: u32,
    next_task: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn alloc_node(&mut self) -> Result<NodeId, GraphError> {
        let id = NodeId(self.next_node);
        self.next_node = self
            .next_node
            .checked_add(1)
            .ok_or(GraphError::IdsExhausted("node"))?;
        Ok(id)
    }

    #[inline]
    pub fn alloc_task(&mut self) -> Result<TaskId, GraphError> {
        let id = TaskId(self.next_task);
        self.next_task = self
            .next_task
            .checked_add(1)
            .ok_or(GraphError::IdsExhausted("task"))?;
        Ok(id)
    }
}
