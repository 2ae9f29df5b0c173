//! Per-device execution state and the work a device performs for one resume.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::block::ExecContext;
use crate::debug::{debug_traverse, DebugCursor, DebugRequest, TraversalOutcome};
use crate::error::SimulationError;
use crate::ids::DeviceIndex;
use crate::memory::DeviceMemory;
use crate::planner::ExecutionPlan;

/// Everything a device owns. Locked by its worker during a step and by the coordinator
/// only between steps.
#[derive(Debug)]
pub struct DeviceState {
    pub index: DeviceIndex,
    /// Device copy of the installed plan.
    pub plan: Option<ExecutionPlan>,
    pub debug: DebugCursor,
    pub memory: DeviceMemory,
    /// Set after a task failed on this device; cleared by a device reset.
    pub dead: bool,
}

impl DeviceState {
    pub fn new(index: DeviceIndex) -> Self {
        Self {
            index,
            plan: None,
            debug: DebugCursor::default(),
            memory: DeviceMemory::new(),
            dead: false,
        }
    }
}

pub type SharedDevice = Arc<Mutex<DeviceState>>;

pub fn shared_devices(count: usize) -> Vec<SharedDevice> {
    (0..count)
        .map(|index| Arc::new(Mutex::new(DeviceState::new(index))))
        .collect()
}

/// Lock a device, recovering the state if a previous holder panicked.
pub fn lock_device(device: &SharedDevice) -> MutexGuard<'_, DeviceState> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobMode {
    /// Run whole plans.
    Normal { run_init: bool, run_standard: bool },
    /// Run one debug granule.
    Debug(DebugRequest),
}

/// Immutable description of one resume, shared by every worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepJob {
    pub step: u64,
    pub mode: JobMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceReport {
    Completed,
    Debug(TraversalOutcome),
}

/// Worker body: run `job` against the device's own plan copy and memory.
///
/// A task failure marks the device dead and is handed back to the coordinator.
pub fn execute_core(device: &SharedDevice, job: &StepJob) -> Result<DeviceReport, SimulationError> {
    let mut guard = lock_device(device);
    let state = &mut *guard;
    if state.dead {
        return Err(SimulationError::DeviceDead(state.index));
    }
    let Some(plan) = state.plan.as_mut() else {
        return Err(SimulationError::control(format!(
            "no execution plan installed on device {}",
            state.index
        )));
    };
    let mut ctx = ExecContext {
        device: state.index,
        step: job.step,
        memory: &mut state.memory,
    };

    let result = match job.mode {
        JobMode::Normal {
            run_init,
            run_standard,
        } => {
            let init = if run_init {
                plan.init.execute(&mut ctx)
            } else {
                Ok(())
            };
            init.and_then(|()| {
                if run_standard {
                    plan.standard.execute(&mut ctx)
                } else {
                    Ok(())
                }
            })
            .map(|()| DeviceReport::Completed)
        }
        JobMode::Debug(request) => {
            debug_traverse(plan, &mut state.debug, &request, &mut ctx).map(DeviceReport::Debug)
        }
    };

    result.map_err(|err| {
        log::error!("step {} failed: {err}", job.step);
        state.dead = true;
        SimulationError::Execution(err)
    })
}
