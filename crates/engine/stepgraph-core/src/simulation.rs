//! The coordinator: owns the graph, the installed plan, the device workers and all
//! debugging state, and drives them through schedule, allocation, stepping, model changes
//! and shutdown.
//!
//! All mutation happens on the coordinating thread between steps. Workers only ever see
//! their own [`DeviceState`](crate::device::DeviceState) and an immutable [`StepJob`].

use std::sync::mpsc::Receiver;

use hashbrown::HashSet;
use serde::Serialize;

use crate::block::{ProfilingSample, Visit};
use crate::breakpoints::Breakpoints;
use crate::config::SimulationConfig;
use crate::cursor::{DebugPosition, PlanCursor};
use crate::debug::{DebugController, DebugStepMode, TraversalOutcome};
use crate::device::{
    execute_core, lock_device, shared_devices, DeviceReport, JobMode, SharedDevice, StepJob,
};
use crate::error::{Result, SimulationError};
use crate::events::{EventBus, SimulationEvent, SimulationState};
use crate::graph::NodeGraph;
use crate::ids::{BlockId, DeviceIndex, ExecutableId, NodeId, PlanKind, TaskId};
use crate::memory::{update_memory_model, BlockKey, MemoryManager};
use crate::model_change::{collect_model_changes, rollback};
use crate::persistence::{load_blocks, save_blocks, BlockSerializer};
use crate::planner::{order_nodes, ExecutionPlan, PlanBuilder};
use crate::pool::WorkerPool;
use crate::validation::{
    validate_graph, validate_mandatory, validate_node, validate_placement, ValidationMessage,
    Validator,
};

type DevicePool = WorkerPool<StepJob, Result<DeviceReport>>;

/// One profiled leaf on one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProfilingEntry {
    pub device: DeviceIndex,
    pub block: BlockId,
    pub task: TaskId,
    pub sample: ProfilingSample,
}

pub struct Simulation {
    config: SimulationConfig,
    pool: DevicePool,
    devices: Vec<SharedDevice>,
    memory: MemoryManager,
    serializer: BlockSerializer,

    graph: Option<NodeGraph>,
    plan: Option<ExecutionPlan>,
    /// Execution order of every node, world first. `None` until scheduled.
    all_nodes: Option<Vec<NodeId>>,
    model_changers: Vec<NodeId>,

    breakpoints: Breakpoints,
    debug: DebugController,
    validator: Validator,
    events: EventBus,

    step: u64,
    in_debug_mode: bool,
    debug_step_complete: bool,
    memory_allocated: bool,
    finished: bool,
}

impl Simulation {
    /// Start one worker per configured device.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        let devices = shared_devices(config.devices.max(1));
        let workers = devices.clone();
        let pool = WorkerPool::start(
            devices.len(),
            |device| log::debug!("device {device} worker ready"),
            move |device, job: &StepJob| execute_core(&workers[device], job),
        )?;
        Ok(Self {
            serializer: BlockSerializer::new(config.data_folder.clone()),
            memory: MemoryManager::new(devices.clone()),
            config,
            pool,
            devices,
            graph: None,
            plan: None,
            all_nodes: None,
            model_changers: Vec::new(),
            breakpoints: Breakpoints::new(),
            debug: DebugController::new(),
            validator: Validator::new(),
            events: EventBus::new(),
            step: 0,
            in_debug_mode: false,
            debug_step_complete: true,
            memory_allocated: false,
            finished: false,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn graph(&self) -> Option<&NodeGraph> {
        self.graph.as_ref()
    }

    pub fn plan(&self) -> Option<&ExecutionPlan> {
        self.plan.as_ref()
    }

    pub fn all_nodes(&self) -> Option<&[NodeId]> {
        self.all_nodes.as_deref()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn breakpoints(&self) -> &Breakpoints {
        &self.breakpoints
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_memory_allocated(&self) -> bool {
        self.memory_allocated
    }

    pub fn in_debug_mode(&self) -> bool {
        self.in_debug_mode
    }

    pub fn debug_mode(&self) -> DebugStepMode {
        self.debug.mode()
    }

    /// False while an interactive run is paused in the middle of a step.
    pub fn is_step_finished(&self) -> bool {
        self.debug_step_complete
    }

    pub fn is_device_dead(&self, device: DeviceIndex) -> bool {
        self.devices
            .get(device)
            .map(|d| lock_device(d).dead)
            .unwrap_or(false)
    }

    pub fn subscribe(&mut self) -> Receiver<SimulationEvent> {
        self.events.subscribe()
    }

    /// Snapshot of a block from the device that owns its node.
    pub fn read_block(&self, node: NodeId, block: &str) -> Option<Vec<f32>> {
        let device = self.graph.as_ref()?.node(node)?.device();
        self.memory.read(device, &BlockKey::new(node, block))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.finished {
            return Err(SimulationError::control("the simulation has been finished"));
        }
        Ok(())
    }

    /// Structural changes are only allowed while no interactive step is half done.
    fn ensure_between_steps(&self, action: &str) -> Result<()> {
        if !self.debug_step_complete {
            return Err(SimulationError::control(format!(
                "cannot {action} while step {} is paused mid-way",
                self.step
            )));
        }
        Ok(())
    }

    fn graph_ref(&self) -> Result<&NodeGraph> {
        self.graph
            .as_ref()
            .ok_or_else(|| SimulationError::control("no graph has been scheduled"))
    }

    fn scheduled_nodes(&self) -> Result<Vec<NodeId>> {
        self.all_nodes
            .clone()
            .ok_or_else(|| SimulationError::control("the execution plan is not set up"))
    }

    // ---------------------------------------------------------------- scheduling

    /// Take ownership of `graph` and build its plans. A graph with nodes placed on
    /// devices this simulation does not have is refused.
    pub fn schedule(&mut self, graph: NodeGraph) -> Result<()> {
        self.ensure_running()?;
        self.ensure_between_steps("schedule a graph")?;
        let mut validator = Validator::new();
        validate_placement(&graph, self.devices.len(), &mut validator);
        if !validator.is_successful() {
            let errors = validator.errors();
            self.validator = validator;
            return Err(SimulationError::Validation(errors));
        }
        self.graph = Some(graph);
        self.install_schedule(None)
    }

    /// Rebuild only the branches of `new_nodes` (and their groups), reusing the rest of
    /// the installed plan.
    pub fn schedule_changes(&mut self, new_nodes: &[NodeId]) -> Result<()> {
        self.ensure_running()?;
        self.ensure_between_steps("reschedule")?;
        self.install_schedule(Some(new_nodes))
    }

    /// Rebuild the whole plan from the current graph.
    pub fn reschedule(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.ensure_between_steps("reschedule")?;
        self.install_schedule(None)
    }

    fn install_schedule(&mut self, changed: Option<&[NodeId]>) -> Result<()> {
        let graph = self
            .graph
            .as_ref()
            .ok_or_else(|| SimulationError::control("no graph has been scheduled"))?;
        let built = PlanBuilder::build(graph, self.plan.as_ref(), changed)
            .and_then(|plan| order_nodes(graph).map(|order| (plan, order)));
        let (plan, order) = match built {
            Ok(built) => built,
            Err(err) => {
                self.uninstall_plan();
                return Err(err.into());
            }
        };

        let mut model_changers = Vec::new();
        if let Some(graph) = self.graph.as_mut() {
            for &id in &order {
                if let Some(entry) = graph.node_mut(id) {
                    if entry.behavior_mut().as_model_changer().is_some() {
                        model_changers.push(id);
                    }
                }
            }
        }

        let pruned = self.breakpoints.prune(&plan);
        if pruned > 0 {
            log::debug!("pruned {pruned} stale breakpoint(s)");
        }
        for (index, device) in self.devices.iter().enumerate() {
            let mut state = lock_device(device);
            let mut copy = plan.for_device(index);
            if let Some(previous) = state.plan.as_ref() {
                copy.adopt_profiling(previous);
            }
            state.plan = Some(copy);
            state.debug.clear();
        }
        log::info!(
            "schedule installed: {} node(s), {} standard task(s), {} model changer(s)",
            order.len(),
            plan.standard.leaf_ids().len(),
            model_changers.len()
        );
        self.plan = Some(plan);
        self.all_nodes = Some(order);
        self.model_changers = model_changers;
        Ok(())
    }

    /// Dropping the plan also abandons a step paused mid-way.
    fn uninstall_plan(&mut self) {
        self.plan = None;
        self.all_nodes = None;
        self.model_changers.clear();
        self.debug_step_complete = true;
        for device in &self.devices {
            let mut state = lock_device(device);
            state.plan = None;
            state.debug.clear();
        }
    }

    /// Drop the installed plan. The graph is kept for a later reschedule.
    pub fn clear(&mut self) {
        self.uninstall_plan();
    }

    /// Hand the graph back, dropping the plan.
    pub fn take_graph(&mut self) -> Option<NodeGraph> {
        self.uninstall_plan();
        self.graph.take()
    }

    // ---------------------------------------------------------------- validation

    /// Validate the whole graph: world first, then every node.
    pub fn validate(&mut self) -> Result<()> {
        let devices = self.devices.len();
        let graph = self.graph_ref()?;
        let mut validator = Validator::new();
        validate_graph(graph, devices, &mut validator);
        self.validator = validator;
        if self.validator.is_successful() {
            Ok(())
        } else {
            Err(SimulationError::Validation(self.validator.errors()))
        }
    }

    pub fn validation_messages(&self) -> &[ValidationMessage] {
        self.validator.messages()
    }

    // ---------------------------------------------------------------- lifecycle

    /// Size every block to a fixed point, then allocate it on its devices.
    pub fn allocate_memory(&mut self) -> Result<()> {
        self.ensure_running()?;
        let order = self.scheduled_nodes()?;
        let max_attempts = self.config.max_sizing_attempts;
        let graph = self
            .graph
            .as_mut()
            .ok_or_else(|| SimulationError::control("no graph has been scheduled"))?;
        let passes = update_memory_model(graph, &order, max_attempts)?;
        for id in &order {
            if let Some(entry) = graph.node(*id) {
                self.memory.allocate_blocks(entry);
            }
        }
        self.memory_allocated = true;
        log::debug!("memory allocated after {passes} sizing pass(es)");
        Ok(())
    }

    /// Rewind to step 0 and initialize every node and task.
    pub fn init(&mut self) -> Result<()> {
        self.ensure_running()?;
        let order = self.scheduled_nodes()?;
        self.step = 0;
        self.debug_step_complete = true;
        self.debug.cancel();
        for device in &self.devices {
            lock_device(device).debug.clear();
        }
        let graph = self
            .graph
            .as_mut()
            .ok_or_else(|| SimulationError::control("no graph has been scheduled"))?;
        for id in order {
            init_node(graph, id)?;
        }
        Ok(())
    }

    /// Save what nodes want saved, then free every block.
    pub fn free_memory(&mut self) -> Result<()> {
        let Some(order) = self.all_nodes.clone() else {
            return Ok(());
        };
        if !self.memory_allocated {
            return Ok(());
        }
        let graph = self.graph_ref()?;
        let saved = save_blocks(
            &self.serializer,
            graph,
            &self.memory,
            &order,
            self.config.save_all_nodes_data,
        )?;
        if saved > 0 {
            log::info!("saved {saved} block(s) to {}", self.serializer.folder().display());
        }
        if let Some(graph) = self.graph.as_mut() {
            for id in &order {
                if let Some(entry) = graph.node_mut(*id) {
                    self.memory.free_blocks(entry);
                    entry.behavior_mut().cleanup();
                }
            }
        }
        self.memory_allocated = false;
        Ok(())
    }

    /// Free memory, stop the workers and drop the plan. The simulation cannot be used
    /// afterwards.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let freed = self.free_memory();
        self.pool.finish();
        self.clear();
        self.finished = true;
        freed
    }

    /// Clear dead flags and debug cursors on every device. A reschedule is still needed
    /// before stepping again.
    pub fn reset_devices(&mut self) {
        for device in &self.devices {
            let mut state = lock_device(device);
            state.dead = false;
            state.debug.clear();
        }
        self.debug_step_complete = true;
    }

    // ---------------------------------------------------------------- stepping

    /// Run one step. In debug mode this runs one debug granule and completes the step
    /// only when the standard plan was exhausted.
    pub fn perform_step(&mut self, step_by_step: bool) -> Result<()> {
        self.ensure_running()?;
        if self.plan.is_none() {
            return Err(SimulationError::control("the execution plan is not set up"));
        }
        if !self.memory_allocated {
            return Err(SimulationError::control("memory has not been allocated"));
        }
        if let Some(dead) = (0..self.devices.len()).find(|d| self.is_device_dead(*d)) {
            return Err(SimulationError::DeviceDead(dead));
        }

        let mode = if self.in_debug_mode {
            let mut request = self.debug.request();
            request.skip_standard_on_init = !self.config.standard_on_init_step;
            JobMode::Debug(request)
        } else {
            JobMode::Normal {
                run_init: self.step == 0,
                run_standard: self.step != 0 || self.config.standard_on_init_step,
            }
        };
        let results = self.pool.resume(StepJob {
            step: self.step,
            mode,
        })?;

        let mut outcomes: Vec<TraversalOutcome> = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (device, result) in results.into_iter().enumerate() {
            match result {
                Ok(Ok(DeviceReport::Debug(outcome))) => outcomes.push(outcome),
                Ok(Ok(DeviceReport::Completed)) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(panic) => {
                    log::error!("worker for device {device} panicked: {}", panic.message);
                    lock_device(&self.devices[device]).dead = true;
                    first_error.get_or_insert(SimulationError::WorkerPanic {
                        device: panic.device,
                        message: panic.message,
                    });
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        if self.in_debug_mode {
            self.debug_step_complete = outcomes.iter().all(|o| o.step_complete);
            if step_by_step {
                self.synchronize_all();
            }
            if self.debug.resolve(&outcomes, &self.breakpoints) {
                let position = outcomes.first().and_then(|o| o.position);
                self.events.emit(SimulationEvent::DebugTargetReached {
                    step: self.step,
                    position,
                });
            }
        } else {
            self.debug_step_complete = true;
        }

        if !self.in_debug_mode || self.debug_step_complete {
            self.complete_step()?;
        }
        Ok(())
    }

    fn complete_step(&mut self) -> Result<()> {
        let order = self.scheduled_nodes()?;
        let autosave = self.config.is_autosave_step(self.step);
        let graph = self.graph_ref()?;
        if self.step == 0 {
            let loaded = load_blocks(
                &self.serializer,
                graph,
                &self.memory,
                &order,
                self.config.load_all_nodes_data,
            )?;
            if loaded > 0 {
                log::info!("loaded {loaded} block(s) from {}", self.serializer.folder().display());
            }
        }
        if autosave {
            log::info!("autosave ({} steps)", self.step);
            save_blocks(
                &self.serializer,
                graph,
                &self.memory,
                &order,
                self.config.save_all_nodes_data,
            )?;
        }
        self.synchronize_all();
        self.step += 1;
        self.events
            .emit(SimulationEvent::StepCompleted { step: self.step });
        Ok(())
    }

    fn synchronize_all(&self) {
        let (Some(graph), Some(order)) = (self.graph.as_ref(), self.all_nodes.as_ref()) else {
            return;
        };
        for id in order {
            if let Some(entry) = graph.node(*id) {
                self.memory.synchronize_shared_blocks(entry);
            }
        }
    }

    // ---------------------------------------------------------------- model changes

    /// Let every model-changing group restructure its children, then validate, release,
    /// resize, allocate and reschedule. Returns whether anything changed.
    ///
    /// Only valid between completed steps of an engine whose memory is allocated.
    pub fn perform_model_changes(&mut self) -> Result<bool> {
        self.ensure_running()?;
        self.scheduled_nodes()?;
        if !self.memory_allocated {
            return Err(SimulationError::control("model changes need allocated memory"));
        }
        self.ensure_between_steps("change the model")?;
        let devices = self.devices.len();
        let step = self.step;
        let max_attempts = self.config.max_sizing_attempts;
        let changers = self.model_changers.clone();
        let graph = self
            .graph
            .as_mut()
            .ok_or_else(|| SimulationError::control("no graph has been scheduled"))?;

        let mut record = collect_model_changes(graph, &changers, step)?;
        if record.is_empty() {
            return Ok(false);
        }

        // validation, while the removed nodes can still be put back
        self.validator.clear();
        let added: Vec<NodeId> = record.added.clone();
        for &id in &added {
            validate_node(graph, id, devices, &mut self.validator);
        }
        let added_set: HashSet<NodeId> = added.iter().copied().collect();
        let others: Vec<NodeId> = graph
            .iter()
            .map(|e| e.id())
            .filter(|id| !added_set.contains(id))
            .collect();
        for id in others {
            validate_mandatory(graph, id, devices, &mut self.validator);
        }
        if !self.validator.is_successful() {
            rollback(graph, record);
            log::warn!("model change rejected by validation; previous schedule stays active");
            return Err(SimulationError::Validation(self.validator.errors()));
        }

        for detached in &mut record.removed {
            for entry in detached.entries_mut() {
                self.memory.free_blocks(entry);
                entry.behavior_mut().cleanup();
            }
        }

        let sized = order_nodes(graph)
            .and_then(|order| update_memory_model(graph, &order, max_attempts).map(|_| order));
        let order = match sized {
            Ok(order) => order,
            Err(err) => {
                self.uninstall_plan();
                return Err(err.into());
            }
        };
        for id in &order {
            if let Some(entry) = graph.node(*id) {
                self.memory.allocate_blocks(entry);
            }
        }
        for &id in &added {
            init_node(graph, id)?;
        }

        let mut changed = added;
        changed.extend(record.changed.iter().copied());
        log::info!(
            "model changed: {} group(s), {} node(s) removed, {} node(s) added",
            record.changed.len(),
            record.removed_ids().len(),
            record.added.len()
        );
        self.schedule_changes(&changed)?;
        for node in record.changed {
            self.events.emit(SimulationEvent::ModelChanged { node });
        }
        Ok(true)
    }

    // ---------------------------------------------------------------- debugging

    pub fn set_debug_mode(&mut self, enabled: bool) {
        if self.in_debug_mode == enabled {
            return;
        }
        self.in_debug_mode = enabled;
        if !enabled {
            self.debug.cancel();
            for device in &self.devices {
                lock_device(device).debug.clear();
            }
            self.debug_step_complete = true;
        }
    }

    pub fn add_breakpoint(&mut self, id: impl Into<ExecutableId>) -> bool {
        self.breakpoints.add(id)
    }

    pub fn remove_breakpoint(&mut self, id: impl Into<ExecutableId>) -> bool {
        self.breakpoints.remove(id)
    }

    pub fn step_into(&mut self) {
        self.debug.step_into();
    }

    pub fn step_over(&mut self) {
        let position = self.current_debug_position();
        self.debug.step_over(position.as_ref());
    }

    pub fn step_out(&mut self) {
        let position = self.current_debug_position();
        self.debug.step_out(position.as_ref());
    }

    /// Where the first device's debug cursor rests. Before the first granule of a run this
    /// is the start of the plan that granule will enter.
    pub fn current_debug_position(&self) -> Option<DebugPosition> {
        let state = lock_device(self.devices.first()?);
        let plan = state.plan.as_ref()?;
        match state.debug.cursor.as_ref() {
            Some(cursor) => cursor.position(plan.root(cursor.plan())),
            None => {
                let kind = if self.step == 0 {
                    PlanKind::Init
                } else {
                    PlanKind::Standard
                };
                PlanCursor::at_root(kind).position(plan.root(kind))
            }
        }
    }

    // ---------------------------------------------------------------- maintenance

    /// Prune breakpoints against the installed plan and clear profiling samples.
    pub fn clean_temporary_block_data(&mut self) {
        if let Some(plan) = self.plan.as_ref() {
            self.breakpoints.prune(plan);
        }
        for device in &self.devices {
            if let Some(plan) = lock_device(device).plan.as_mut() {
                plan.clean_profiling_times();
            }
        }
    }

    /// Profiling samples of every leaf that ran, per device, in plan order.
    pub fn profiling_report(&self) -> Vec<ProfilingEntry> {
        let mut out = Vec::new();
        for device in &self.devices {
            let state = lock_device(device);
            let Some(plan) = state.plan.as_ref() else {
                continue;
            };
            for root in [&plan.init, &plan.standard] {
                root.iterate(&mut |visit| {
                    if let Visit::Block(block) = visit {
                        for (task, sample) in block.profiling() {
                            out.push(ProfilingEntry {
                                device: state.index,
                                block: block.id(),
                                task: *task,
                                sample: *sample,
                            });
                        }
                    }
                });
            }
        }
        out
    }

    /// Enable or disable a task. An installed plan is rebuilt right away.
    pub fn set_task_enabled(&mut self, task: TaskId, enabled: bool) -> Result<()> {
        self.ensure_between_steps("toggle a task")?;
        let graph = self
            .graph
            .as_mut()
            .ok_or_else(|| SimulationError::control("no graph has been scheduled"))?;
        let entry = graph
            .task_mut(task)
            .ok_or_else(|| SimulationError::control(format!("unknown task {task}")))?;
        if entry.enabled == enabled {
            return Ok(());
        }
        entry.enabled = enabled;
        if self.plan.is_some() {
            self.install_schedule(None)?;
        }
        Ok(())
    }

    /// Forward a run-state change to every node.
    pub fn notify_state_changed(&mut self, from: SimulationState, to: SimulationState) {
        let Some(graph) = self.graph.as_mut() else {
            return;
        };
        let ids: Vec<NodeId> = graph.iter().map(|e| e.id()).collect();
        for id in ids {
            if let Some(entry) = graph.node_mut(id) {
                entry.behavior_mut().on_state_changed(from, to);
            }
        }
    }
}

/// Clear signals, initialize the node and each of its tasks on the node's device.
fn init_node(graph: &mut NodeGraph, id: NodeId) -> Result<()> {
    let entry = graph.entry_mut(id)?;
    entry.behavior_mut().clear_signals();
    entry.behavior_mut().init_tasks();
    let device = entry.device();
    for task in entry.tasks_mut() {
        let mut handle = task
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        handle
            .init(device)
            .map_err(|source| SimulationError::TaskInit { node: id, source })?;
    }
    Ok(())
}
