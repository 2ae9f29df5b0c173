//! Node graph model: an arena of nodes addressed by stable [`NodeId`] handles.
//!
//! Nodes live at the top level or inside a group; a group is itself a node and counts as
//! one member of its parent's ordering. Inputs bind to output blocks of other nodes by
//! `(source node, block name)`.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::error::GraphError;
use crate::ids::{DeviceIndex, IdAllocator, NodeId, TaskId};
use crate::memory::{BlockKey, BlockSize, MemoryBlock};
use crate::node::{Node, TaskHandle};

/// Where an input binding reads from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Node(NodeId),
    /// Index of a node added earlier in the same change request.
    Pending(usize),
}

/// Declarative description of a node to insert.
pub struct NodeSpec {
    pub(crate) name: String,
    pub(crate) behavior: Box<dyn Node>,
    pub(crate) device: DeviceIndex,
    pub(crate) inputs: Vec<(String, Source, String)>,
    pub(crate) group: bool,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, behavior: impl Node + 'static) -> Self {
        Self {
            name: name.into(),
            behavior: Box::new(behavior),
            device: 0,
            inputs: Vec::new(),
            group: false,
        }
    }

    /// A node that owns a nested sub-graph.
    pub fn group(name: impl Into<String>, behavior: impl Node + 'static) -> Self {
        Self {
            group: true,
            ..Self::new(name, behavior)
        }
    }

    pub fn on_device(mut self, device: DeviceIndex) -> Self {
        self.device = device;
        self
    }

    pub fn input(mut self, input: impl Into<String>, node: NodeId, block: impl Into<String>) -> Self {
        self.inputs
            .push((input.into(), Source::Node(node), block.into()));
        self
    }

    pub fn input_pending(
        mut self,
        input: impl Into<String>,
        pending: usize,
        block: impl Into<String>,
    ) -> Self {
        self.inputs
            .push((input.into(), Source::Pending(pending), block.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("inputs", &self.inputs)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

/// A task registered in the graph.
#[derive(Clone)]
pub struct TaskEntry {
    pub id: TaskId,
    pub name: String,
    pub one_shot: bool,
    pub enabled: bool,
    pub handle: TaskHandle,
}

impl std::fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("one_shot", &self.one_shot)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// A node inside the graph together with its engine-side metadata.
pub struct NodeEntry {
    id: NodeId,
    name: String,
    device: DeviceIndex,
    parent: Option<NodeId>,
    children: Option<Vec<NodeId>>,
    inputs: IndexMap<String, BlockKey>,
    outputs: IndexMap<String, MemoryBlock>,
    tasks: Vec<TaskEntry>,
    behavior: Box<dyn Node>,
}

impl NodeEntry {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_group(&self) -> bool {
        self.children.is_some()
    }

    pub fn children(&self) -> &[NodeId] {
        self.children.as_deref().unwrap_or(&[])
    }

    /// Input bindings: input name to the source block.
    pub fn inputs(&self) -> &IndexMap<String, BlockKey> {
        &self.inputs
    }

    pub fn outputs(&self) -> &IndexMap<String, MemoryBlock> {
        &self.outputs
    }

    pub fn output(&self, block: &str) -> Option<&MemoryBlock> {
        self.outputs.get(block)
    }

    pub fn tasks(&self) -> &[TaskEntry] {
        &self.tasks
    }

    pub fn behavior(&self) -> &dyn Node {
        self.behavior.as_ref()
    }

    pub fn behavior_mut(&mut self) -> &mut dyn Node {
        self.behavior.as_mut()
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut [TaskEntry] {
        &mut self.tasks
    }

    pub(crate) fn sizing_parts(&mut self) -> (&mut dyn Node, &mut IndexMap<String, MemoryBlock>) {
        (self.behavior.as_mut(), &mut self.outputs)
    }
}

impl std::fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("device", &self.device)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

/// Nodes removed from a graph, kept around until their memory is released.
#[derive(Debug)]
pub struct DetachedNode {
    parent: Option<NodeId>,
    position: usize,
    /// The detached node first, then its descendants depth-first.
    entries: Vec<NodeEntry>,
}

impl DetachedNode {
    pub fn root(&self) -> NodeId {
        self.entries[0].id
    }

    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [NodeEntry] {
        &mut self.entries
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().map(|e| e.id)
    }
}

#[derive(Default)]
pub struct NodeGraph {
    ids: IdAllocator,
    task_ids: IdAllocator,
    nodes: IndexMap<NodeId, NodeEntry>,
    top_level: Vec<NodeId>,
    world: Option<NodeId>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the world node. It is sized and executed before every other node.
    pub fn set_world(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        let id = self.insert(None, spec, &[])?;
        self.world = Some(id);
        Ok(id)
    }

    pub fn add_node(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        self.insert(None, spec, &[])
    }

    pub fn add_child(&mut self, group: NodeId, spec: NodeSpec) -> Result<NodeId, GraphError> {
        self.insert(Some(group), spec, &[])
    }

    /// Insert a node whose [`Source::Pending`] inputs resolve through `pending`.
    pub(crate) fn insert(
        &mut self,
        parent: Option<NodeId>,
        spec: NodeSpec,
        pending: &[NodeId],
    ) -> Result<NodeId, GraphError> {
        if let Some(group) = parent {
            let entry = self.nodes.get(&group).ok_or(GraphError::UnknownNode(group))?;
            if !entry.is_group() {
                return Err(GraphError::NotAGroup(group));
            }
        }

        let id = self.ids.alloc_node()?;
        let NodeSpec {
            name,
            mut behavior,
            device,
            inputs: input_specs,
            group,
        } = spec;

        let mut inputs = IndexMap::new();
        for (input, source, block) in input_specs {
            let source = match source {
                Source::Node(node) => node,
                Source::Pending(index) => *pending
                    .get(index)
                    .ok_or(GraphError::UnknownPending(index))?,
            };
            if inputs
                .insert(input.clone(), BlockKey::new(source, block))
                .is_some()
            {
                return Err(GraphError::DuplicateInput { node: id, input });
            }
        }

        let mut outputs = IndexMap::new();
        for decl in behavior.memory_blocks() {
            let block = decl.name.clone();
            if outputs
                .insert(block.clone(), MemoryBlock::from_decl(decl))
                .is_some()
            {
                return Err(GraphError::DuplicateBlock { node: id, block });
            }
        }

        let tasks = behavior
            .tasks()
            .into_iter()
            .map(|decl| {
                Ok(TaskEntry {
                    id: self.task_ids.alloc_task()?,
                    name: decl.name,
                    one_shot: decl.one_shot,
                    enabled: decl.enabled,
                    handle: Arc::new(Mutex::new(decl.task)),
                })
            })
            .collect::<Result<Vec<_>, GraphError>>()?;

        let entry = NodeEntry {
            id,
            name,
            device,
            parent,
            children: group.then(Vec::new),
            inputs,
            outputs,
            tasks,
            behavior,
        };
        self.nodes.insert(id, entry);
        self.sibling_list_mut(parent).push(id);
        Ok(id)
    }

    /// Bind (or rebind) an input of `node` to `block` of `source`.
    pub fn connect(
        &mut self,
        node: NodeId,
        input: impl Into<String>,
        source: NodeId,
        block: impl Into<String>,
    ) -> Result<(), GraphError> {
        let entry = self.entry_mut(node)?;
        entry
            .inputs
            .insert(input.into(), BlockKey::new(source, block));
        Ok(())
    }

    pub fn disconnect(&mut self, node: NodeId, input: &str) -> Result<(), GraphError> {
        self.entry_mut(node)?.inputs.shift_remove(input);
        Ok(())
    }

    pub fn world(&self) -> Option<NodeId> {
        self.world
    }

    pub fn top_level(&self) -> &[NodeId] {
        &self.top_level
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(&id)
    }

    pub(crate) fn entry(&self, id: NodeId) -> Result<&NodeEntry, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    pub(crate) fn entry_mut(&mut self, id: NodeId) -> Result<&mut NodeEntry, GraphError> {
        self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|entry| entry.name == name)
            .map(|entry| entry.id)
    }

    pub fn find_task(&self, task: TaskId) -> Option<(NodeId, &TaskEntry)> {
        self.nodes.values().find_map(|entry| {
            entry
                .tasks
                .iter()
                .find(|t| t.id == task)
                .map(|t| (entry.id, t))
        })
    }

    pub(crate) fn task_mut(&mut self, task: TaskId) -> Option<&mut TaskEntry> {
        self.nodes
            .values_mut()
            .flat_map(|entry| entry.tasks.iter_mut())
            .find(|t| t.id == task)
    }

    pub fn children(&self, group: NodeId) -> &[NodeId] {
        self.nodes
            .get(&group)
            .map(NodeEntry::children)
            .unwrap_or(&[])
    }

    /// `id` followed by all of its descendants, depth-first.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !self.contains(next) {
                continue;
            }
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    /// Groups enclosing `id`, innermost first.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.node(id).and_then(NodeEntry::parent);
        while let Some(parent) = current {
            out.push(parent);
            current = self.node(parent).and_then(NodeEntry::parent);
        }
        out
    }

    /// Sizes of every bound input of `id`; `None` for bindings whose source block is missing.
    pub fn input_sizes(&self, id: NodeId) -> Result<IndexMap<String, Option<BlockSize>>, GraphError> {
        let entry = self.entry(id)?;
        Ok(entry
            .inputs
            .iter()
            .map(|(input, key)| {
                let size = self
                    .nodes
                    .get(&key.node)
                    .and_then(|source| source.outputs.get(&key.block))
                    .map(MemoryBlock::size);
                (input.clone(), size)
            })
            .collect())
    }

    /// Remove `id` and its descendants. The entries are handed back so their memory can be
    /// released, or reattached by [`reattach`](Self::reattach).
    pub fn detach(&mut self, id: NodeId) -> Result<DetachedNode, GraphError> {
        let parent = self.entry(id)?.parent;
        if self.world == Some(id) {
            return Err(GraphError::WorldRemoval);
        }
        let siblings = self.sibling_list_mut(parent);
        let position = siblings.iter().position(|n| *n == id).unwrap_or(siblings.len());
        siblings.retain(|n| *n != id);

        let entries = self
            .subtree(id)
            .into_iter()
            .filter_map(|node| self.nodes.shift_remove(&node))
            .collect();
        Ok(DetachedNode {
            parent,
            position,
            entries,
        })
    }

    /// Undo a [`detach`](Self::detach). Detached nodes must be reattached in reverse order.
    pub fn reattach(&mut self, detached: DetachedNode) {
        let DetachedNode {
            parent,
            position,
            entries,
        } = detached;
        let Some(root) = entries.first().map(|e| e.id) else {
            return;
        };
        let siblings = self.sibling_list_mut(parent);
        let position = position.min(siblings.len());
        siblings.insert(position, root);
        for entry in entries {
            self.nodes.insert(entry.id, entry);
        }
        self.nodes.sort_keys();
    }

    fn sibling_list_mut(&mut self, parent: Option<NodeId>) -> &mut Vec<NodeId> {
        match parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(entry) => entry.children.get_or_insert_with(Vec::new),
            None => &mut self.top_level,
        }
    }
}

impl std::fmt::Debug for NodeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGraph")
            .field("nodes", &self.nodes)
            .field("top_level", &self.top_level)
            .field("world", &self.world)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BlockDecl;
    use crate::node::NodeGroup;

    struct Source4;

    impl Node for Source4 {
        fn memory_blocks(&self) -> Vec<BlockDecl> {
            vec![BlockDecl::new("out").with_count(4)]
        }
    }

    #[test]
    fn groups_nest_children() {
        let mut g = NodeGraph::new();
        let group = g.add_node(NodeSpec::group("g", NodeGroup)).unwrap();
        let a = g.add_child(group, NodeSpec::new("a", Source4)).unwrap();
        let b = g.add_child(group, NodeSpec::new("b", NodeGroup).input("in", a, "out")).unwrap();

        assert_eq!(g.children(group), &[a, b]);
        assert_eq!(g.ancestors(b), vec![group]);
        assert_eq!(g.subtree(group), vec![group, a, b]);
        let sizes = g.input_sizes(b).unwrap();
        assert_eq!(sizes["in"].as_ref().map(|s| s.count), Some(4));
    }

    #[test]
    fn children_require_group() {
        let mut g = NodeGraph::new();
        let plain = g.add_node(NodeSpec::new("plain", Source4)).unwrap();
        assert_eq!(
            g.add_child(plain, NodeSpec::new("x", Source4)).unwrap_err(),
            GraphError::NotAGroup(plain)
        );
    }

    #[test]
    fn detach_and_reattach_restore_position() {
        let mut g = NodeGraph::new();
        let a = g.add_node(NodeSpec::new("a", Source4)).unwrap();
        let group = g.add_node(NodeSpec::group("g", NodeGroup)).unwrap();
        let inner = g.add_child(group, NodeSpec::new("inner", Source4)).unwrap();
        let c = g.add_node(NodeSpec::new("c", Source4)).unwrap();

        let detached = g.detach(group).unwrap();
        assert_eq!(detached.ids().collect::<Vec<_>>(), vec![group, inner]);
        assert_eq!(g.top_level(), &[a, c]);
        assert!(!g.contains(inner));

        g.reattach(detached);
        assert_eq!(g.top_level(), &[a, group, c]);
        assert_eq!(g.children(group), &[inner]);
    }

    #[test]
    fn pending_sources_resolve_through_list() {
        let mut g = NodeGraph::new();
        let a = g.add_node(NodeSpec::new("a", Source4)).unwrap();
        let b = g
            .insert(None, NodeSpec::new("b", NodeGroup).input_pending("in", 0, "out"), &[a])
            .unwrap();
        assert_eq!(g.node(b).unwrap().inputs()["in"], BlockKey::new(a, "out"));
        assert_eq!(
            g.insert(None, NodeSpec::new("c", NodeGroup).input_pending("in", 3, "out"), &[a])
                .unwrap_err(),
            GraphError::UnknownPending(3)
        );
    }
}
