use std::sync::mpsc::Receiver;

use anyhow::{bail, Result};
use stepgraph::{NodeGraph, Simulation, SimulationConfig, SimulationEvent, SimulationState};

use crate::config::RunnerConfig;

/// What one call into the handler did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Steps completed during the call.
    pub steps_performed: u64,
    /// Step counter once the call returned.
    pub final_step: u64,
    /// Debug targets reached during the call.
    pub pauses: u64,
    pub events: Vec<SimulationEvent>,
}

/// Owns a simulation and its run state.
pub struct SimulationHandler {
    sim: Simulation,
    config: RunnerConfig,
    state: SimulationState,
    events: Receiver<SimulationEvent>,
    started: bool,
}

impl SimulationHandler {
    /// Start the device workers and schedule `graph`.
    pub fn new(sim_config: SimulationConfig, config: RunnerConfig, graph: NodeGraph) -> Result<Self> {
        let mut sim = Simulation::new(sim_config)?;
        let events = sim.subscribe();
        sim.schedule(graph)?;
        Ok(Self {
            sim,
            config,
            state: SimulationState::Stopped,
            events,
            started: false,
        })
    }

    pub fn state(&self) -> SimulationState {
        self.state
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn simulation(&self) -> &Simulation {
        &self.sim
    }

    /// Direct access for breakpoints, step modes and inspection.
    pub fn simulation_mut(&mut self) -> &mut Simulation {
        &mut self.sim
    }

    fn set_state(&mut self, to: SimulationState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.sim.notify_state_changed(from, to);
        self.state = to;
        log::info!("simulation {from:?} -> {to:?} at step {}", self.sim.step());
    }

    /// Validate, allocate and initialize on the first start; afterwards just resume.
    pub fn start_simulation(&mut self) -> Result<()> {
        if self.state == SimulationState::Running {
            return Ok(());
        }
        if !self.started {
            if self.sim.plan().is_none() {
                self.sim.reschedule()?;
            }
            self.sim.validate()?;
            self.sim.allocate_memory()?;
            self.sim.init()?;
            self.started = true;
        }
        self.sim.set_debug_mode(self.config.debug);
        self.set_state(SimulationState::Running);
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state == SimulationState::Running {
            self.set_state(SimulationState::Paused);
        }
    }

    /// Save what nodes want saved, free everything and stop the workers. Terminal.
    pub fn stop(&mut self) -> Result<()> {
        let finished = if self.sim.is_finished() {
            Ok(())
        } else {
            self.sim.finish()
        };
        self.started = false;
        self.set_state(SimulationState::Stopped);
        finished.map_err(Into::into)
    }

    /// Run until `steps` more steps completed, a debug target was reached or
    /// `max_steps` was hit.
    pub fn run(&mut self, steps: u64) -> Result<RunReport> {
        if self.state != SimulationState::Running {
            bail!("simulation is {:?}, not running", self.state);
        }
        let mut report = RunReport::default();
        let mut target = self.sim.step().saturating_add(steps);
        if let Some(max) = self.config.max_steps {
            target = target.min(max);
        }
        while self.state == SimulationState::Running && self.sim.step() < target {
            self.advance(&mut report)?;
        }
        self.finish_report(&mut report)?;
        Ok(report)
    }

    /// One engine call while paused: a single granule in debug mode, a whole step otherwise.
    pub fn step_once(&mut self) -> Result<RunReport> {
        match self.state {
            SimulationState::Paused => {}
            SimulationState::Running => bail!("pause the simulation before stepping it"),
            SimulationState::Stopped => bail!("simulation is not started"),
        }
        let mut report = RunReport::default();
        self.advance(&mut report)?;
        self.finish_report(&mut report)?;
        Ok(report)
    }

    fn advance(&mut self, report: &mut RunReport) -> Result<()> {
        let before = self.sim.step();
        if let Err(err) = self.sim.perform_step(self.config.debug) {
            log::error!("step {before} failed: {err}");
            self.drain(report);
            self.pause();
            return Err(err.into());
        }
        self.drain(report);
        if self.sim.step() > before && self.config.perform_model_changes {
            self.sim.perform_model_changes()?;
            self.drain(report);
        }
        Ok(())
    }

    fn drain(&mut self, report: &mut RunReport) {
        let events: Vec<SimulationEvent> = self.events.try_iter().collect();
        for event in events {
            match &event {
                SimulationEvent::StepCompleted { step } => {
                    report.steps_performed += 1;
                    let interval = self.config.report_interval;
                    if interval > 0 && step % interval == 0 {
                        log::info!("completed step {step}");
                    }
                }
                SimulationEvent::DebugTargetReached { step, position } => {
                    report.pauses += 1;
                    log::info!("debug target reached on step {step} at {position:?}");
                    self.pause();
                }
                SimulationEvent::ModelChanged { node } => {
                    log::debug!("model changed under {node}");
                }
            }
            report.events.push(event);
        }
    }

    fn finish_report(&mut self, report: &mut RunReport) -> Result<()> {
        report.final_step = self.sim.step();
        if let Some(max) = self.config.max_steps {
            if report.final_step >= max && self.state != SimulationState::Stopped {
                log::info!("reached max_steps ({max}); stopping");
                self.stop()?;
            }
        }
        Ok(())
    }
}
