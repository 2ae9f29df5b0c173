//! stepgraph-runner
//!
//! Drives a [`Simulation`](stepgraph::Simulation) the way an interactive host does: start it,
//! run it for a number of steps, pause on debug targets, step single granules and stop.

pub mod config;
pub mod handler;

pub use crate::config::RunnerConfig;
pub use crate::handler::{RunReport, SimulationHandler};
pub use stepgraph::SimulationState as RunState;
