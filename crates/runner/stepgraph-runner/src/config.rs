use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How a [`SimulationHandler`](crate::SimulationHandler) drives its simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Stop (save and free) once this many steps have completed.
    pub max_steps: Option<u64>,
    /// Run in debug mode: one granule per engine call, pausing on debug targets.
    pub debug: bool,
    /// Let model-changing groups restructure the graph after every completed step.
    pub perform_model_changes: bool,
    /// Log progress every N completed steps. Zero disables progress logging.
    pub report_interval: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            max_steps: None,
            debug: false,
            perform_model_changes: true,
            report_interval: 0,
        }
    }
}

impl RunnerConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse runner config")
    }
}
