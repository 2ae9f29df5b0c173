//! Resumption cursor over a plan tree.
//!
//! [`PlanCursor`] remembers the path (child indices from the root) to the block that will
//! continue execution. Each [`step`](PlanCursor::step) is one [`ExecutionBlock::execute_step`]
//! on that block and yields the next block to resume from.

use serde::{Deserialize, Serialize};

use crate::block::{ExecContext, ExecutionBlock, StepResult};
use crate::error::ExecutionError;
use crate::ids::{BlockId, ExecutableId, PlanKind};

/// Where an interactive run is paused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugPosition {
    pub plan: PlanKind,
    /// Block that will continue execution.
    pub block: BlockId,
    pub parent: Option<BlockId>,
    /// Next child `block` will run, if any.
    pub current_child: Option<ExecutableId>,
    pub current_child_is_block: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanCursor {
    plan: PlanKind,
    path: Vec<usize>,
    done: bool,
}

impl PlanCursor {
    /// Cursor at the root of a freshly reset plan.
    pub fn at_root(plan: PlanKind) -> Self {
        Self {
            plan,
            path: Vec::new(),
            done: false,
        }
    }

    pub fn plan(&self) -> PlanKind {
        self.plan
    }

    /// True once the root was exhausted.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// The block this cursor resumes from.
    pub fn block<'a>(&self, root: &'a ExecutionBlock) -> Option<&'a ExecutionBlock> {
        if self.done {
            return None;
        }
        self.path
            .iter()
            .try_fold(root, |block, &index| block.child_block(index))
    }

    fn block_mut<'a>(&self, root: &'a mut ExecutionBlock) -> Option<&'a mut ExecutionBlock> {
        if self.done {
            return None;
        }
        self.path
            .iter()
            .try_fold(root, |block, &index| block.child_block_mut(index))
    }

    fn parent<'a>(&self, root: &'a ExecutionBlock) -> Option<&'a ExecutionBlock> {
        let (_, prefix) = self.path.split_last()?;
        prefix
            .iter()
            .try_fold(root, |block, &index| block.child_block(index))
    }

    /// Advance one child of the current block. Returns the block to resume from: the same
    /// block after a leaf ran, the child after entering it, the parent when the block is
    /// exhausted, and `None` when the root itself is exhausted.
    pub fn step(
        &mut self,
        root: &mut ExecutionBlock,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Option<BlockId>, ExecutionError> {
        let Some(block) = self.block_mut(root) else {
            return Ok(None);
        };
        match block.execute_step(ctx)? {
            StepResult::Advanced => Ok(Some(block.id())),
            StepResult::Entered(index) => {
                let entered = block.child_block(index).map(ExecutionBlock::id);
                self.path.push(index);
                Ok(entered)
            }
            StepResult::Exhausted => {
                if self.path.pop().is_none() {
                    self.done = true;
                    return Ok(None);
                }
                Ok(self.block(root).map(ExecutionBlock::id))
            }
        }
    }

    pub fn position(&self, root: &ExecutionBlock) -> Option<DebugPosition> {
        let block = self.block(root)?;
        let current = block.current_child();
        Some(DebugPosition {
            plan: self.plan,
            block: block.id(),
            parent: self.parent(root).map(ExecutionBlock::id),
            current_child: current.map(|c| c.id()),
            current_child_is_block: current.map(|c| c.is_block()).unwrap_or(false),
        })
    }
}
