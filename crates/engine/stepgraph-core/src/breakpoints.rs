//! Breakpoint set for interactive runs, keyed by plan element.
//!
//! Entries that no longer name anything in the installed plan are dropped on every
//! reschedule.

use hashbrown::HashSet;

use crate::block::Visit;
use crate::ids::ExecutableId;
use crate::planner::ExecutionPlan;

/// Plan elements at which an interactive run pauses before executing them.
#[derive(Clone, Debug, Default)]
pub struct Breakpoints {
    set: HashSet<ExecutableId>,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: impl Into<ExecutableId>) -> bool {
        self.set.insert(id.into())
    }

    pub fn remove(&mut self, id: impl Into<ExecutableId>) -> bool {
        self.set.remove(&id.into())
    }

    pub fn contains(&self, id: ExecutableId) -> bool {
        self.set.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn clear(&mut self) {
        self.set.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutableId> {
        self.set.iter()
    }

    /// Drop every breakpoint not present in the standard plan. Returns how many were removed.
    pub fn prune(&mut self, plan: &ExecutionPlan) -> usize {
        let mut present = HashSet::new();
        plan.standard.iterate(&mut |visit: Visit<'_>| {
            present.insert(visit.id());
        });
        let before = self.set.len();
        self.set.retain(|id| present.contains(id));
        before - self.set.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ExecutionBlock;
    use crate::ids::{BlockId, NodeId, PlanKind, TaskId};

    #[test]
    fn prune_keeps_only_blocks_of_the_standard_plan() {
        let kept = BlockId::for_node(NodeId(1), PlanKind::Standard);
        let mut standard = ExecutionBlock::new(BlockId::root(PlanKind::Standard), "standard");
        standard.push(crate::block::Executable::Block(ExecutionBlock::new(kept, "a")));
        let plan = ExecutionPlan {
            init: ExecutionBlock::new(BlockId::root(PlanKind::Init), "init"),
            standard,
        };

        let mut bps = Breakpoints::new();
        bps.add(kept);
        bps.add(BlockId::for_node(NodeId(2), PlanKind::Standard));
        bps.add(TaskId(9));
        assert_eq!(bps.prune(&plan), 2);
        assert_eq!(bps.len(), 1);
        assert!(bps.contains(kept.into()));
    }
}
