//! Interactive stepping.
//!
//! [`DebugController`] is the single-writer step-mode state machine owned by the coordinator.
//! Its transitions are pure; the traversal itself ([`debug_traverse`]) runs on each device
//! against a [`DebugRequest`] snapshot and reports a [`TraversalOutcome`] that the
//! controller resolves into "pause" or "keep going".

use serde::{Deserialize, Serialize};

use crate::block::ExecContext;
use crate::breakpoints::Breakpoints;
use crate::cursor::{DebugPosition, PlanCursor};
use crate::error::ExecutionError;
use crate::ids::{BlockId, PlanKind};
use crate::planner::ExecutionPlan;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugStepMode {
    #[default]
    None,
    StepInto,
    StepOver,
    StepOut,
}

/// Step mode and target as seen by the workers for one resume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugRequest {
    pub mode: DebugStepMode,
    /// Block whose re-entry by the cursor ends a step-over or step-out.
    pub target: Option<BlockId>,
    /// Step 0 ends with the init plan instead of continuing into the standard plan.
    pub skip_standard_on_init: bool,
}

/// Result of one debug granule on one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraversalOutcome {
    pub position: Option<DebugPosition>,
    /// The cursor returned to the target block, or a plan was exhausted.
    pub leaving_target: bool,
    /// The standard plan was run to its end.
    pub step_complete: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugController {
    mode: DebugStepMode,
    target: Option<BlockId>,
}

impl DebugController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> DebugStepMode {
        self.mode
    }

    pub fn target(&self) -> Option<BlockId> {
        self.target
    }

    /// Pause after the next granule.
    pub fn step_into(&mut self) {
        self.mode = DebugStepMode::StepInto;
        self.target = None;
    }

    /// Run the branch under the cursor without pausing inside it. On a leaf this is
    /// [`step_into`](Self::step_into).
    pub fn step_over(&mut self, position: Option<&DebugPosition>) {
        match position {
            Some(position) if position.current_child_is_block => {
                self.mode = DebugStepMode::StepOver;
                self.target = Some(position.block);
            }
            _ => self.step_into(),
        }
    }

    /// Run until control returns to the parent of the current block.
    pub fn step_out(&mut self, position: Option<&DebugPosition>) {
        self.mode = DebugStepMode::StepOut;
        self.target = position.and_then(|p| p.parent);
    }

    pub fn cancel(&mut self) {
        self.mode = DebugStepMode::None;
        self.target = None;
    }

    pub fn request(&self) -> DebugRequest {
        DebugRequest {
            mode: self.mode,
            target: self.target,
            skip_standard_on_init: false,
        }
    }

    /// Decide whether the granules just run should pause the run. Firing resets the mode.
    pub fn resolve(&mut self, outcomes: &[TraversalOutcome], breakpoints: &Breakpoints) -> bool {
        let leaving = outcomes.iter().any(|o| o.leaving_target);
        let at_breakpoint = outcomes.iter().any(|o| {
            o.position
                .and_then(|p| p.current_child)
                .is_some_and(|child| breakpoints.contains(child))
        });
        let fire = (self.mode != DebugStepMode::None && leaving)
            || self.mode == DebugStepMode::StepInto
            || at_breakpoint;
        if fire {
            self.cancel();
        }
        fire
    }
}

/// Cursor state a device keeps between debug granules.
#[derive(Clone, Debug, Default)]
pub struct DebugCursor {
    pub cursor: Option<PlanCursor>,
    pub init_in_progress: bool,
}

impl DebugCursor {
    pub fn clear(&mut self) {
        self.cursor = None;
        self.init_in_progress = false;
    }
}

/// Run one debug granule: step until the cursor rests on a block that still has a child to
/// run. The first granule of a run (step 0, no cursor) enters the init plan. Exhausting the
/// init plan continues with the standard plan without completing a step, unless the request
/// skips the standard plan on step 0, in which case step 0 completes there.
pub fn debug_traverse(
    plan: &mut ExecutionPlan,
    state: &mut DebugCursor,
    request: &DebugRequest,
    ctx: &mut ExecContext<'_>,
) -> Result<TraversalOutcome, ExecutionError> {
    let mut step_complete = true;
    if ctx.step == 0 && state.cursor.is_none() {
        state.init_in_progress = true;
        plan.init.reset();
        state.cursor = Some(PlanCursor::at_root(PlanKind::Init));
        step_complete = false;
    }
    let cursor = state.cursor.get_or_insert_with(|| {
        plan.standard.reset();
        PlanCursor::at_root(PlanKind::Standard)
    });

    let mut leaving_target = false;
    loop {
        let next = cursor.step(plan.root_mut(cursor.plan()), ctx)?;
        if request.target.is_some() && next == request.target {
            leaving_target = true;
        }
        let has_child = cursor
            .block(plan.root(cursor.plan()))
            .is_some_and(|block| block.current_child().is_some());
        if next.is_none() || has_child {
            break;
        }
    }

    if cursor.is_done() {
        if state.init_in_progress {
            step_complete = request.skip_standard_on_init;
        }
        state.init_in_progress = false;
        plan.standard.reset();
        *cursor = PlanCursor::at_root(PlanKind::Standard);
        leaving_target = true;
    } else {
        step_complete = false;
    }

    Ok(TraversalOutcome {
        position: cursor.position(plan.root(cursor.plan())),
        leaving_target,
        step_complete,
    })
}
