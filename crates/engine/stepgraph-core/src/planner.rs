//! Execution plan builder.
//!
//! Every grouping level (the top level and the children of each group) is ordered with
//! Kahn's algorithm; dependencies between descendants of two members lift to an edge
//! between those members. Ties resolve by member order so an unchanged graph always
//! produces the same plan.

use std::collections::BTreeSet;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

use crate::block::{Executable, ExecutionBlock, TaskLeaf};
use crate::context::NodeBindings;
use crate::error::BuildError;
use crate::graph::{NodeEntry, NodeGraph};
use crate::ids::{BlockId, DeviceIndex, ExecutableId, NodeId, PlanKind};

/// The init and standard plan trees of one schedule.
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    pub init: ExecutionBlock,
    pub standard: ExecutionBlock,
}

impl ExecutionPlan {
    pub fn root(&self, plan: PlanKind) -> &ExecutionBlock {
        match plan {
            PlanKind::Init => &self.init,
            PlanKind::Standard => &self.standard,
        }
    }

    pub fn root_mut(&mut self, plan: PlanKind) -> &mut ExecutionBlock {
        match plan {
            PlanKind::Init => &mut self.init,
            PlanKind::Standard => &mut self.standard,
        }
    }

    pub fn contains(&self, id: ExecutableId) -> bool {
        self.init.contains(id) || self.standard.contains(id)
    }

    pub fn reset(&mut self) {
        self.init.reset();
        self.standard.reset();
    }

    /// Per-device copy; see [`ExecutionBlock::for_device`].
    pub fn for_device(&self, device: DeviceIndex) -> ExecutionPlan {
        ExecutionPlan {
            init: self.init.for_device(device),
            standard: self.standard.for_device(device),
        }
    }

    pub fn adopt_profiling(&mut self, previous: &ExecutionPlan) {
        self.init.adopt_profiling(&previous.init);
        self.standard.adopt_profiling(&previous.standard);
    }

    pub fn clean_profiling_times(&mut self) {
        self.init.clean_profiling_times();
        self.standard.clean_profiling_times();
    }
}

pub struct PlanBuilder<'a> {
    graph: &'a NodeGraph,
    previous: Option<&'a ExecutionPlan>,
    /// Nodes whose branches must be rebuilt; `None` rebuilds everything.
    affected: Option<HashSet<NodeId>>,
}

impl<'a> PlanBuilder<'a> {
    /// Build both plans for `graph`.
    ///
    /// With `previous` and `changed`, only the branches of changed nodes and their enclosing
    /// groups are rebuilt; every other branch is taken from `previous`.
    pub fn build(
        graph: &'a NodeGraph,
        previous: Option<&'a ExecutionPlan>,
        changed: Option<&[NodeId]>,
    ) -> Result<ExecutionPlan, BuildError> {
        let affected = match (previous, changed) {
            (Some(_), Some(changed)) => {
                let mut set = HashSet::new();
                for &id in changed {
                    set.insert(id);
                    set.extend(graph.ancestors(id));
                }
                Some(set)
            }
            _ => None,
        };
        let builder = PlanBuilder {
            graph,
            previous,
            affected,
        };

        let top = order_level(graph, graph.top_level())?;
        let mut init = ExecutionBlock::new(BlockId::root(PlanKind::Init), "init");
        let mut standard = ExecutionBlock::new(BlockId::root(PlanKind::Standard), "standard");
        for &id in &top {
            if let Some(branch) = builder.branch(id, PlanKind::Init)? {
                init.push(Executable::Block(branch));
            }
            if let Some(branch) = builder.branch(id, PlanKind::Standard)? {
                standard.push(Executable::Block(branch));
            }
        }
        log::debug!(
            "built plans: {} init leaf(s), {} standard leaf(s)",
            init.leaf_ids().len(),
            standard.leaf_ids().len()
        );
        Ok(ExecutionPlan { init, standard })
    }

    fn reusable(&self, id: NodeId, plan: PlanKind) -> Option<ExecutionBlock> {
        let affected = self.affected.as_ref()?;
        if affected.contains(&id) {
            return None;
        }
        let mut block = self
            .previous?
            .root(plan)
            .find_block(BlockId::for_node(id, plan))?
            .clone();
        block.reset();
        Some(block)
    }

    /// Branch of one node: its own leaves, then the branches of its children in level order.
    /// Init branches without leaves are left out.
    fn branch(&self, id: NodeId, plan: PlanKind) -> Result<Option<ExecutionBlock>, BuildError> {
        if let Some(block) = self.reusable(id, plan) {
            return Ok(Some(block));
        }
        let entry = self.graph.entry(id)?;
        let mut block = ExecutionBlock::new(BlockId::for_node(id, plan), entry.name());
        for leaf in leaves(entry, plan) {
            block.push(Executable::Task(leaf));
        }
        if entry.is_group() {
            for child in order_level(self.graph, entry.children())? {
                if let Some(branch) = self.branch(child, plan)? {
                    block.push(Executable::Block(branch));
                }
            }
        }
        if plan == PlanKind::Init && block.leaf_ids().is_empty() {
            return Ok(None);
        }
        Ok(Some(block))
    }
}

fn leaves(entry: &NodeEntry, plan: PlanKind) -> Vec<TaskLeaf> {
    let bindings = Arc::new(NodeBindings {
        node: entry.id(),
        name: entry.name().to_string(),
        inputs: entry.inputs().clone(),
    });
    entry
        .tasks()
        .iter()
        .filter(|task| task.enabled && task.one_shot == (plan == PlanKind::Init))
        .map(|task| {
            TaskLeaf::new(
                task.id,
                task.name.clone(),
                entry.device(),
                bindings.clone(),
                task.handle.clone(),
            )
        })
        .collect()
}

/// Order the members of one grouping level. The world node, when it is a member, comes
/// first and its own inputs are ignored: they read the previous step's data.
pub fn order_level(graph: &NodeGraph, members: &[NodeId]) -> Result<Vec<NodeId>, BuildError> {
    let world = graph.world().filter(|w| members.contains(w));

    let mut owner: HashMap<NodeId, usize> = HashMap::new();
    for (index, &member) in members.iter().enumerate() {
        for node in graph.subtree(member) {
            owner.insert(node, index);
        }
    }

    let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); members.len()];
    let mut indegree = vec![0usize; members.len()];
    for (index, &member) in members.iter().enumerate() {
        if Some(member) == world {
            continue;
        }
        for node in graph.subtree(member) {
            let Some(entry) = graph.node(node) else {
                continue;
            };
            for key in entry.inputs().values() {
                let Some(&source) = owner.get(&key.node) else {
                    continue;
                };
                if source == index || Some(members[source]) == world {
                    continue;
                }
                if edges[source].insert(index) {
                    indegree[index] += 1;
                }
            }
        }
    }

    let mut order = Vec::with_capacity(members.len());
    let mut ready: BTreeSet<usize> = BTreeSet::new();
    for (index, &member) in members.iter().enumerate() {
        if Some(member) == world {
            order.push(member);
        } else if indegree[index] == 0 {
            ready.insert(index);
        }
    }

    while let Some(index) = ready.pop_first() {
        order.push(members[index]);
        for &next in &edges[index] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != members.len() {
        let mut nodes: Vec<NodeId> = members
            .iter()
            .enumerate()
            .filter(|(index, _)| indegree[*index] > 0)
            .map(|(_, &member)| member)
            .collect();
        nodes.sort();
        return Err(BuildError::Cycle { nodes });
    }
    Ok(order)
}

/// Every node of the graph in execution order: the world first, groups before their
/// children.
pub fn order_nodes(graph: &NodeGraph) -> Result<Vec<NodeId>, BuildError> {
    let mut out = Vec::with_capacity(graph.len());
    flatten(graph, graph.top_level(), &mut out)?;
    Ok(out)
}

fn flatten(graph: &NodeGraph, members: &[NodeId], out: &mut Vec<NodeId>) -> Result<(), BuildError> {
    for id in order_level(graph, members)? {
        out.push(id);
        let children = graph.children(id);
        if !children.is_empty() {
            flatten(graph, children, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContext;
    use crate::graph::NodeSpec;
    use crate::memory::BlockDecl;
    use crate::node::{Node, NodeGroup, Task, TaskDecl};

    struct Noop;

    impl Task for Noop {
        fn execute(&mut self, _ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Worker {
        one_shot: bool,
    }

    impl Node for Worker {
        fn memory_blocks(&self) -> Vec<BlockDecl> {
            vec![BlockDecl::new("out").with_count(1)]
        }

        fn tasks(&mut self) -> Vec<TaskDecl> {
            let mut tasks = vec![TaskDecl::new("run", Noop)];
            if self.one_shot {
                tasks.push(TaskDecl::new("setup", Noop).one_shot());
            }
            tasks
        }
    }

    fn worker() -> Worker {
        Worker { one_shot: false }
    }

    #[test]
    fn it_should_order_by_dependencies_with_stable_ties() {
        let mut g = NodeGraph::new();
        let c = g.add_node(NodeSpec::new("c", worker())).unwrap();
        let a = g.add_node(NodeSpec::new("a", worker())).unwrap();
        let b = g.add_node(NodeSpec::new("b", worker()).input("in", a, "out")).unwrap();
        g.connect(c, "in", b, "out").unwrap();
        let d = g.add_node(NodeSpec::new("d", worker())).unwrap();

        assert_eq!(order_nodes(&g).unwrap(), vec![a, b, c, d]);
    }

    #[test]
    fn it_should_report_cycles() {
        let mut g = NodeGraph::new();
        let a = g.add_node(NodeSpec::new("a", worker())).unwrap();
        let b = g.add_node(NodeSpec::new("b", worker()).input("in", a, "out")).unwrap();
        let free = g.add_node(NodeSpec::new("free", worker())).unwrap();
        g.connect(a, "in", b, "out").unwrap();

        match order_nodes(&g) {
            Err(BuildError::Cycle { nodes }) => assert_eq!(nodes, vec![a, b]),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(order_level(&g, &[free]).is_ok());
    }

    #[test]
    fn world_goes_first_and_feedback_into_it_is_ignored() {
        let mut g = NodeGraph::new();
        let a = g.add_node(NodeSpec::new("a", worker())).unwrap();
        let world = g.set_world(NodeSpec::new("world", worker()).input("in", a, "out")).unwrap();
        g.connect(a, "in", world, "out").unwrap();
        assert_eq!(order_nodes(&g).unwrap(), vec![world, a]);
    }

    #[test]
    fn group_edges_lift_to_members() {
        let mut g = NodeGraph::new();
        let group = g.add_node(NodeSpec::group("g", NodeGroup)).unwrap();
        let consumer = g.add_node(NodeSpec::new("consumer", worker())).unwrap();
        let inner = g.add_child(group, NodeSpec::new("inner", worker())).unwrap();
        g.connect(inner, "in", consumer, "out").unwrap();
        assert_eq!(order_nodes(&g).unwrap(), vec![consumer, group, inner]);
    }

    #[test]
    fn plans_split_one_shot_tasks_and_are_reproducible() {
        let mut g = NodeGraph::new();
        let a = g.add_node(NodeSpec::new("a", Worker { one_shot: true })).unwrap();
        let group = g.add_node(NodeSpec::group("g", NodeGroup)).unwrap();
        g.add_child(group, NodeSpec::new("inner", worker()).input("in", a, "out"))
            .unwrap();

        let plan = PlanBuilder::build(&g, None, None).unwrap();
        assert_eq!(plan.init.leaf_ids().len(), 1);
        assert_eq!(plan.standard.leaf_ids().len(), 2);
        assert!(plan.contains(ExecutableId::Block(BlockId::for_node(group, PlanKind::Standard))));
        assert!(!plan.contains(ExecutableId::Block(BlockId::for_node(group, PlanKind::Init))));

        let again = PlanBuilder::build(&g, None, None).unwrap();
        assert_eq!(plan.standard.shape(), again.standard.shape());
        assert_eq!(plan.init.shape(), again.init.shape());
    }

    #[test]
    fn disabled_tasks_get_no_leaf() {
        let mut g = NodeGraph::new();
        let a = g.add_node(NodeSpec::new("a", worker())).unwrap();
        let task = g.node(a).unwrap().tasks()[0].id;
        g.task_mut(task).unwrap().enabled = false;
        let plan = PlanBuilder::build(&g, None, None).unwrap();
        assert!(plan.standard.leaf_ids().is_empty());
        assert!(plan.contains(ExecutableId::Block(BlockId::for_node(a, PlanKind::Standard))));
    }
}
