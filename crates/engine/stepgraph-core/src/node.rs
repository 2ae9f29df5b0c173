//! Capability contract between the engine and graph-node collaborators.
//!
//! A node is sizable ([`Node::update_memory_blocks`]), initializable ([`Node::init_tasks`]),
//! executable (through the [`Task`]s it declares) and optionally a model-changing group
//! ([`Node::as_model_changer`]). Dispatch is static through these traits; the engine never
//! inspects concrete node types.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use indexmap::IndexMap;

use crate::context::TaskContext;
use crate::events::SimulationState;
use crate::ids::{DeviceIndex, NodeId};
use crate::memory::{BlockDecl, BlockSize, MemoryBlock, Shape};
use crate::model_change::ModelChanger;
use crate::validation::ValidationContext;

/// Atomic unit of work owned by a node.
pub trait Task: Send {
    /// Prepare the task for the device it will run on.
    fn init(&mut self, _device: DeviceIndex) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<()>;
}

/// Shared handle through which plans and the graph reach the same task object.
pub type TaskHandle = Arc<Mutex<Box<dyn Task>>>;

/// A task as declared by its node.
pub struct TaskDecl {
    pub name: String,
    /// One-shot tasks run once, from the init plan.
    pub one_shot: bool,
    pub enabled: bool,
    pub task: Box<dyn Task>,
}

impl TaskDecl {
    pub fn new(name: impl Into<String>, task: impl Task + 'static) -> Self {
        Self {
            name: name.into(),
            one_shot: false,
            enabled: true,
            task: Box::new(task),
        }
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl std::fmt::Debug for TaskDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDecl")
            .field("name", &self.name)
            .field("one_shot", &self.one_shot)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Behavior of a graph node.
pub trait Node: Send {
    /// Output blocks this node owns. Called once when the node enters a graph.
    fn memory_blocks(&self) -> Vec<BlockDecl> {
        Vec::new()
    }

    /// Recompute output sizes from the current input sizes. Must be a pure function of
    /// those sizes and the node's own configuration.
    fn update_memory_blocks(&mut self, _ctx: &mut SizingContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Tasks in execution order. Called once when the node enters a graph.
    fn tasks(&mut self) -> Vec<TaskDecl> {
        Vec::new()
    }

    fn init_tasks(&mut self) {}

    fn clear_signals(&mut self) {}

    /// Called after the node's memory has been freed.
    fn cleanup(&mut self) {}

    fn validate(&self, _ctx: &mut ValidationContext<'_>) {}

    fn load_on_start(&self) -> bool {
        false
    }

    fn save_on_stop(&self) -> bool {
        false
    }

    fn on_state_changed(&mut self, _from: SimulationState, _to: SimulationState) {}

    /// Group capability: nodes that restructure their children between steps.
    fn as_model_changer(&mut self) -> Option<&mut dyn ModelChanger> {
        None
    }
}

/// Behavior for a plain group that only hosts children.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeGroup;

impl Node for NodeGroup {}

/// View handed to [`Node::update_memory_blocks`].
pub struct SizingContext<'a> {
    node: NodeId,
    inputs: &'a IndexMap<String, Option<BlockSize>>,
    outputs: &'a mut IndexMap<String, MemoryBlock>,
}

impl<'a> SizingContext<'a> {
    pub(crate) fn new(
        node: NodeId,
        inputs: &'a IndexMap<String, Option<BlockSize>>,
        outputs: &'a mut IndexMap<String, MemoryBlock>,
    ) -> Self {
        Self {
            node,
            inputs,
            outputs,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Size of the block bound to `input`, if bound and the source exists.
    pub fn input(&self, input: &str) -> Option<&BlockSize> {
        self.inputs.get(input).and_then(Option::as_ref)
    }

    /// Element count of `input`, zero when unbound.
    pub fn input_count(&self, input: &str) -> usize {
        self.input(input).map(|s| s.count).unwrap_or(0)
    }

    pub fn output_count(&self, output: &str) -> Option<usize> {
        self.outputs.get(output).map(|b| b.count)
    }

    pub fn set_output_count(&mut self, output: &str, count: usize) -> Result<()> {
        let block = self.output_mut(output)?;
        block.count = count;
        Ok(())
    }

    pub fn set_output_shape(&mut self, output: &str, shape: Shape) -> Result<()> {
        let block = self.output_mut(output)?;
        if let Some(count) = shape.element_count() {
            block.count = count;
        }
        block.shape = shape;
        Ok(())
    }

    fn output_mut(&mut self, output: &str) -> Result<&mut MemoryBlock> {
        let node = self.node;
        self.outputs
            .get_mut(output)
            .ok_or_else(|| anyhow!("node {node} has no output block '{output}'"))
    }
}
