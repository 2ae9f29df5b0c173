//! Execution blocks: the recursive unit of an execution plan.
//!
//! A branch ([`ExecutionBlock`]) owns an ordered list of children, each either a task leaf or
//! a nested branch, plus a resumption cursor pointing at the next child to run. Normal
//! execution ([`ExecutionBlock::execute`]) and interactive stepping
//! ([`ExecutionBlock::execute_step`], driven by [`PlanCursor`](crate::cursor::PlanCursor))
//! walk the same tree.

use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::Serialize;

use crate::context::{NodeBindings, TaskContext};
use crate::error::ExecutionError;
use crate::ids::{BlockId, DeviceIndex, ExecutableId, NodeId, TaskId};
use crate::memory::DeviceMemory;
use crate::node::TaskHandle;

/// Device-local state threaded through execution.
pub struct ExecContext<'a> {
    pub device: DeviceIndex,
    pub step: u64,
    pub memory: &'a mut DeviceMemory,
}

/// Leaf wrapping exactly one task.
#[derive(Clone)]
pub struct TaskLeaf {
    id: TaskId,
    name: String,
    device: DeviceIndex,
    /// False in device copies for leaves placed on another device; such leaves keep their
    /// position in the tree but do not run.
    local: bool,
    bindings: Arc<NodeBindings>,
    handle: TaskHandle,
}

impl TaskLeaf {
    pub fn new(
        id: TaskId,
        name: impl Into<String>,
        device: DeviceIndex,
        bindings: Arc<NodeBindings>,
        handle: TaskHandle,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            device,
            local: true,
            bindings,
            handle,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> NodeId {
        self.bindings.node
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Run the task once, returning its wall time. Leaves of other devices are skipped.
    pub fn run(&self, ctx: &mut ExecContext<'_>) -> Result<Option<Duration>, ExecutionError> {
        if !self.local {
            return Ok(None);
        }
        let started = Instant::now();
        let mut task = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let mut task_ctx = TaskContext::new(ctx.device, ctx.step, &self.bindings, ctx.memory);
        task.execute(&mut task_ctx).map_err(|source| ExecutionError {
            device: ctx.device,
            task: self.id,
            task_name: format!("{}.{}", self.bindings.name, self.name),
            source,
        })?;
        Ok(Some(started.elapsed()))
    }
}

impl std::fmt::Debug for TaskLeaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLeaf")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("node", &self.bindings.node)
            .field("device", &self.device)
            .field("local", &self.local)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum Executable {
    Task(TaskLeaf),
    Block(ExecutionBlock),
}

impl Executable {
    pub fn id(&self) -> ExecutableId {
        match self {
            Executable::Task(leaf) => ExecutableId::Task(leaf.id),
            Executable::Block(block) => ExecutableId::Block(block.id),
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Executable::Block(_))
    }

    pub fn as_block(&self) -> Option<&ExecutionBlock> {
        match self {
            Executable::Block(block) => Some(block),
            Executable::Task(_) => None,
        }
    }

    pub fn as_block_mut(&mut self) -> Option<&mut ExecutionBlock> {
        match self {
            Executable::Block(block) => Some(block),
            Executable::Task(_) => None,
        }
    }
}

/// What a single [`ExecutionBlock::execute_step`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// A leaf ran; the block stays current.
    Advanced,
    /// The child at this index is a branch, freshly reset; it becomes current.
    Entered(usize),
    /// No children left; control returns to the parent.
    Exhausted,
}

/// Accumulated execution time of one leaf.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProfilingSample {
    pub total: Duration,
    pub last: Duration,
    pub count: u64,
}

impl ProfilingSample {
    fn record(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.last = elapsed;
        self.count += 1;
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64)
    }
}

/// Depth-first visit target for [`ExecutionBlock::iterate`].
#[derive(Clone, Copy, Debug)]
pub enum Visit<'a> {
    Block(&'a ExecutionBlock),
    Task(&'a TaskLeaf),
}

impl Visit<'_> {
    pub fn id(&self) -> ExecutableId {
        match self {
            Visit::Block(block) => ExecutableId::Block(block.id),
            Visit::Task(leaf) => ExecutableId::Task(leaf.id),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionBlock {
    id: BlockId,
    name: String,
    children: Vec<Executable>,
    next: usize,
    profiling: IndexMap<TaskId, ProfilingSample>,
}

impl ExecutionBlock {
    pub fn new(id: BlockId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            children: Vec::new(),
            next: 0,
            profiling: IndexMap::new(),
        }
    }

    pub fn with_children(id: BlockId, name: impl Into<String>, children: Vec<Executable>) -> Self {
        Self {
            children,
            ..Self::new(id, name)
        }
    }

    pub fn push(&mut self, child: Executable) {
        self.children.push(child);
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[Executable] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child_block(&self, index: usize) -> Option<&ExecutionBlock> {
        self.children.get(index).and_then(Executable::as_block)
    }

    pub fn child_block_mut(&mut self, index: usize) -> Option<&mut ExecutionBlock> {
        self.children.get_mut(index).and_then(Executable::as_block_mut)
    }

    /// The child the cursor will run next, `None` when the block is exhausted.
    pub fn current_child(&self) -> Option<&Executable> {
        self.children.get(self.next)
    }

    pub fn current_child_id(&self) -> Option<ExecutableId> {
        self.current_child().map(Executable::id)
    }

    /// Rewind the cursor to before the first child, recursively.
    pub fn reset(&mut self) {
        self.next = 0;
        for child in &mut self.children {
            if let Executable::Block(block) = child {
                block.reset();
            }
        }
    }

    /// Run every descendant leaf once, in order. Does not move the cursor.
    pub fn execute(&mut self, ctx: &mut ExecContext<'_>) -> Result<(), ExecutionError> {
        for child in &mut self.children {
            match child {
                Executable::Task(leaf) => {
                    if let Some(elapsed) = leaf.run(ctx)? {
                        self.profiling.entry(leaf.id).or_default().record(elapsed);
                    }
                }
                Executable::Block(block) => block.execute(ctx)?,
            }
        }
        Ok(())
    }

    /// Advance by one child: run one leaf, or enter one child branch.
    pub fn execute_step(&mut self, ctx: &mut ExecContext<'_>) -> Result<StepResult, ExecutionError> {
        let index = self.next;
        let Some(child) = self.children.get_mut(index) else {
            return Ok(StepResult::Exhausted);
        };
        self.next += 1;
        match child {
            Executable::Task(leaf) => {
                if let Some(elapsed) = leaf.run(ctx)? {
                    self.profiling.entry(leaf.id).or_default().record(elapsed);
                }
                Ok(StepResult::Advanced)
            }
            Executable::Block(block) => {
                block.reset();
                Ok(StepResult::Entered(index))
            }
        }
    }

    /// Depth-first, pre-order visit of this block and everything below it.
    pub fn iterate(&self, f: &mut dyn FnMut(Visit<'_>)) {
        f(Visit::Block(self));
        for child in &self.children {
            match child {
                Executable::Task(leaf) => f(Visit::Task(leaf)),
                Executable::Block(block) => block.iterate(f),
            }
        }
    }

    pub fn contains(&self, id: ExecutableId) -> bool {
        let mut found = false;
        self.iterate(&mut |visit| found |= visit.id() == id);
        found
    }

    /// Find a branch anywhere below (or at) this block.
    pub fn find_block(&self, id: BlockId) -> Option<&ExecutionBlock> {
        if self.id == id {
            return Some(self);
        }
        self.children
            .iter()
            .filter_map(Executable::as_block)
            .find_map(|block| block.find_block(id))
    }

    /// Task ids of every leaf that runs on this copy, in execution order.
    pub fn leaf_ids(&self) -> Vec<TaskId> {
        let mut out = Vec::new();
        self.iterate(&mut |visit| {
            if let Visit::Task(leaf) = visit {
                if leaf.local {
                    out.push(leaf.id);
                }
            }
        });
        out
    }

    pub fn profiling(&self) -> &IndexMap<TaskId, ProfilingSample> {
        &self.profiling
    }

    /// Carry samples over from a previous tree for leaves that are still present.
    pub fn adopt_profiling(&mut self, previous: &ExecutionBlock) {
        if let Some(old) = previous.find_block(self.id) {
            for child in &self.children {
                if let Executable::Task(leaf) = child {
                    if let Some(sample) = old.profiling.get(&leaf.id) {
                        self.profiling.insert(leaf.id, *sample);
                    }
                }
            }
        }
        for child in &mut self.children {
            if let Executable::Block(block) = child {
                block.adopt_profiling(previous);
            }
        }
    }

    /// Clear profiling samples of this block and every nested block.
    pub fn clean_profiling_times(&mut self) {
        self.profiling.clear();
        for child in &mut self.children {
            if let Executable::Block(block) = child {
                block.clean_profiling_times();
            }
        }
    }

    /// Copy of this tree for one device: only leaves placed on `device` run. The shape is
    /// identical on every device so debug cursors advance in lock-step.
    pub fn for_device(&self, device: DeviceIndex) -> ExecutionBlock {
        let children = self
            .children
            .iter()
            .map(|child| match child {
                Executable::Task(leaf) => Executable::Task(TaskLeaf {
                    local: leaf.local && leaf.device == device,
                    ..leaf.clone()
                }),
                Executable::Block(block) => Executable::Block(block.for_device(device)),
            })
            .collect();
        let mut copy = ExecutionBlock::with_children(self.id, self.name.clone(), children);
        copy.profiling = self.profiling.clone();
        copy
    }

    /// Structural fingerprint: ids in depth-first order. Equal for isomorphic plans.
    pub fn shape(&self) -> Vec<ExecutableId> {
        let mut out = Vec::new();
        self.iterate(&mut |visit| out.push(visit.id()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PlanKind;
    use crate::node::Task;
    use std::sync::Mutex;

    struct Record(Arc<Mutex<Vec<u32>>>, u32);

    impl Task for Record {
        fn execute(&mut self, _ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(self.1);
            Ok(())
        }
    }

    fn leaf(log: &Arc<Mutex<Vec<u32>>>, id: u32) -> Executable {
        let bindings = Arc::new(NodeBindings {
            node: NodeId(id),
            name: format!("n{id}"),
            inputs: IndexMap::new(),
        });
        let task: Box<dyn Task> = Box::new(Record(log.clone(), id));
        Executable::Task(TaskLeaf::new(TaskId(id), "t", 0, bindings, Arc::new(Mutex::new(task))))
    }

    fn block(node: u32, children: Vec<Executable>) -> ExecutionBlock {
        ExecutionBlock::with_children(
            BlockId::for_node(NodeId(node), PlanKind::Standard),
            format!("b{node}"),
            children,
        )
    }

    #[test]
    fn execute_runs_leaves_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = block(10, vec![leaf(&log, 2), leaf(&log, 3)]);
        let mut root = block(0, vec![leaf(&log, 1), Executable::Block(inner), leaf(&log, 4)]);

        let mut mem = DeviceMemory::new();
        let mut ctx = ExecContext { device: 0, step: 0, memory: &mut mem };
        root.execute(&mut ctx).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(root.profiling()[&TaskId(1)].count, 1);
        assert_eq!(root.leaf_ids(), vec![TaskId(1), TaskId(2), TaskId(3), TaskId(4)]);
    }

    #[test]
    fn execute_step_enters_and_exhausts() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = block(10, vec![leaf(&log, 2)]);
        let mut root = block(0, vec![leaf(&log, 1), Executable::Block(inner)]);
        let mut mem = DeviceMemory::new();
        let mut ctx = ExecContext { device: 0, step: 0, memory: &mut mem };

        assert_eq!(root.current_child_id(), Some(ExecutableId::Task(TaskId(1))));
        assert_eq!(root.execute_step(&mut ctx).unwrap(), StepResult::Advanced);
        assert_eq!(root.execute_step(&mut ctx).unwrap(), StepResult::Entered(1));
        assert_eq!(root.execute_step(&mut ctx).unwrap(), StepResult::Exhausted);
        assert!(root.current_child().is_none());
        assert_eq!(*log.lock().unwrap(), vec![1]);

        root.reset();
        assert_eq!(root.current_child_id(), Some(ExecutableId::Task(TaskId(1))));
    }

    #[test]
    fn device_copy_keeps_shape_but_skips_foreign_leaves() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut foreign = leaf(&log, 5);
        if let Executable::Task(l) = &mut foreign {
            l.device = 1;
        }
        let root = block(0, vec![leaf(&log, 1), foreign, Executable::Block(block(3, vec![]))]);
        let mut copy = root.for_device(0);
        assert_eq!(copy.shape(), root.shape());
        assert_eq!(copy.leaf_ids(), vec![TaskId(1)]);
        assert_eq!(root.for_device(1).leaf_ids(), vec![TaskId(5)]);

        let mut mem = DeviceMemory::new();
        let mut ctx = ExecContext { device: 0, step: 0, memory: &mut mem };
        copy.execute(&mut ctx).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert!(!copy.profiling().contains_key(&TaskId(5)));
    }

    #[test]
    fn clean_profiling_is_recursive() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = block(10, vec![leaf(&log, 2)]);
        let mut root = block(0, vec![leaf(&log, 1), Executable::Block(inner)]);
        let mut mem = DeviceMemory::new();
        let mut ctx = ExecContext { device: 0, step: 0, memory: &mut mem };
        root.execute(&mut ctx).unwrap();
        assert!(!root.child_block(1).unwrap().profiling().is_empty());
        root.clean_profiling_times();
        assert!(root.profiling().is_empty());
        assert!(root.child_block(1).unwrap().profiling().is_empty());
    }

    #[test]
    fn mean_handles_counts_beyond_u32() {
        let sample = ProfilingSample {
            total: Duration::from_secs(1 << 33),
            last: Duration::from_secs(2),
            count: 1 << 32,
        };
        assert_eq!(sample.mean(), Duration::from_secs(2));
        assert_eq!(ProfilingSample::default().mean(), Duration::ZERO);
    }
}
