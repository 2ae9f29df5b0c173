//! Structural changes requested by model-changing groups between steps.
//!
//! Requests are collected from every changer in execution order and applied to the graph
//! immediately, so a downstream group already sees what an upstream group did. The
//! resulting [`ModelChangeRecord`] drives validation, memory and plan updates in
//! [`Simulation::perform_model_changes`](crate::simulation::Simulation::perform_model_changes),
//! and can be undone with [`rollback`] while the removed nodes still hold their memory.

use crate::error::GraphError;
use crate::graph::{DetachedNode, NodeGraph, NodeSpec};
use crate::ids::NodeId;

/// Group capability: restructure the group's children.
pub trait ModelChanger {
    /// Return the children to add and remove. An empty request means "no change".
    fn change_model(&mut self, view: &GroupView) -> ModelChangeRequest;
}

/// Snapshot of a group's children handed to [`ModelChanger::change_model`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupView {
    pub group: NodeId,
    pub name: String,
    pub step: u64,
    pub children: Vec<ChildView>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildView {
    pub id: NodeId,
    pub name: String,
    pub is_group: bool,
    pub outputs: Vec<String>,
}

impl GroupView {
    pub fn of(graph: &NodeGraph, group: NodeId, step: u64) -> Result<Self, GraphError> {
        let entry = graph.entry(group)?;
        let children = entry
            .children()
            .iter()
            .filter_map(|id| graph.node(*id))
            .map(|child| ChildView {
                id: child.id(),
                name: child.name().to_string(),
                is_group: child.is_group(),
                outputs: child.outputs().keys().cloned().collect(),
            })
            .collect();
        Ok(Self {
            group,
            name: entry.name().to_string(),
            step,
            children,
        })
    }

    pub fn find(&self, name: &str) -> Option<&ChildView> {
        self.children.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Default)]
pub struct ModelChangeRequest {
    /// Inserted in order; [`Source::Pending`](crate::graph::Source::Pending) indexes this list.
    pub add: Vec<NodeSpec>,
    pub remove: Vec<NodeId>,
}

impl ModelChangeRequest {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn add(mut self, spec: NodeSpec) -> Self {
        self.add.push(spec);
        self
    }

    pub fn remove(mut self, node: NodeId) -> Self {
        self.remove.push(node);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Everything one model-change pass did to the graph.
#[derive(Debug, Default)]
pub struct ModelChangeRecord {
    /// Detached subtrees, in removal order. Their memory is still allocated.
    pub removed: Vec<DetachedNode>,
    /// Added nodes in insertion order (descendants of added groups included).
    pub added: Vec<NodeId>,
    /// Groups that reported a change.
    pub changed: Vec<NodeId>,
}

impl ModelChangeRecord {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn removed_ids(&self) -> Vec<NodeId> {
        self.removed.iter().flat_map(DetachedNode::ids).collect()
    }
}

/// Ask every changer in order and apply its request. On a structural error everything
/// applied so far is rolled back.
pub fn collect_model_changes(
    graph: &mut NodeGraph,
    changers: &[NodeId],
    step: u64,
) -> Result<ModelChangeRecord, GraphError> {
    let mut record = ModelChangeRecord::default();
    for &group in changers {
        if !graph.contains(group) {
            continue;
        }
        let view = GroupView::of(graph, group, step)?;
        let request = match graph.entry_mut(group)?.behavior_mut().as_model_changer() {
            Some(changer) => changer.change_model(&view),
            None => continue,
        };
        if request.is_empty() {
            continue;
        }
        if let Err(err) = apply(graph, group, request, &mut record) {
            rollback(graph, record);
            return Err(err);
        }
        record.changed.push(group);
    }
    Ok(record)
}

fn apply(
    graph: &mut NodeGraph,
    group: NodeId,
    request: ModelChangeRequest,
    record: &mut ModelChangeRecord,
) -> Result<(), GraphError> {
    for node in request.remove {
        if node == group || !graph.ancestors(node).contains(&group) {
            return Err(GraphError::NotAChild { group, node });
        }
        record.removed.push(graph.detach(node)?);
    }
    let mut pending = Vec::with_capacity(request.add.len());
    for spec in request.add {
        let id = graph.insert(Some(group), spec, &pending)?;
        pending.push(id);
        record.added.push(id);
    }
    Ok(())
}

/// Undo a collected change: detach the added nodes, reattach the removed ones.
pub fn rollback(graph: &mut NodeGraph, record: ModelChangeRecord) {
    for id in record.added.into_iter().rev() {
        if graph.contains(id) {
            if let Err(err) = graph.detach(id) {
                log::warn!("rollback could not remove added node {id}: {err}");
            }
        }
    }
    for detached in record.removed.into_iter().rev() {
        graph.reattach(detached);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BlockDecl;
    use crate::node::{Node, NodeGroup};

    struct Leaf;

    impl Node for Leaf {
        fn memory_blocks(&self) -> Vec<BlockDecl> {
            vec![BlockDecl::new("out").with_count(1)]
        }
    }

    /// Replaces a child named "old" with a child named "new" once.
    struct Swapper;

    impl Node for Swapper {
        fn as_model_changer(&mut self) -> Option<&mut dyn ModelChanger> {
            Some(self)
        }
    }

    impl ModelChanger for Swapper {
        fn change_model(&mut self, view: &GroupView) -> ModelChangeRequest {
            match view.find("old") {
                Some(old) => ModelChangeRequest::none()
                    .remove(old.id)
                    .add(NodeSpec::new("new", Leaf)),
                None => ModelChangeRequest::none(),
            }
        }
    }

    /// Tries to remove a node it does not own.
    struct Thief(NodeId);

    impl Node for Thief {
        fn as_model_changer(&mut self) -> Option<&mut dyn ModelChanger> {
            Some(self)
        }
    }

    impl ModelChanger for Thief {
        fn change_model(&mut self, _view: &GroupView) -> ModelChangeRequest {
            ModelChangeRequest::none().remove(self.0)
        }
    }

    #[test]
    fn it_should_apply_and_roll_back_requests() {
        let mut g = NodeGraph::new();
        let group = g.add_node(NodeSpec::group("swap", Swapper)).unwrap();
        let old = g.add_child(group, NodeSpec::new("old", Leaf)).unwrap();

        let record = collect_model_changes(&mut g, &[group], 3).unwrap();
        assert_eq!(record.changed, vec![group]);
        assert_eq!(record.removed_ids(), vec![old]);
        assert_eq!(record.added.len(), 1);
        assert!(!g.contains(old));
        assert_eq!(g.children(group), record.added.as_slice());

        rollback(&mut g, record);
        assert_eq!(g.children(group), &[old]);
        assert!(g.find_by_name("new").is_none());

        let again = collect_model_changes(&mut g, &[group], 4).unwrap();
        assert!(!again.is_empty());
        let idle = collect_model_changes(&mut g, &[group], 5).unwrap();
        assert!(idle.is_empty());
    }

    #[test]
    fn it_should_reject_removing_foreign_nodes() {
        let mut g = NodeGraph::new();
        let outsider = g.add_node(NodeSpec::new("outsider", Leaf)).unwrap();
        let plain = g.add_node(NodeSpec::group("plain", NodeGroup)).unwrap();
        let thief = g.add_node(NodeSpec::group("thief", Thief(outsider))).unwrap();

        let err = collect_model_changes(&mut g, &[plain, thief], 0).unwrap_err();
        assert_eq!(err, GraphError::NotAChild { group: thief, node: outsider });
        assert!(g.contains(outsider));
    }

    #[test]
    fn rollback_keeps_nodes_it_cannot_detach() {
        let mut g = NodeGraph::new();
        let world = g.set_world(NodeSpec::new("world", Leaf)).unwrap();
        let extra = g.add_node(NodeSpec::new("extra", Leaf)).unwrap();
        let record = ModelChangeRecord {
            added: vec![world, extra],
            ..ModelChangeRecord::default()
        };

        rollback(&mut g, record);
        assert!(g.contains(world));
        assert!(!g.contains(extra));
    }
}
