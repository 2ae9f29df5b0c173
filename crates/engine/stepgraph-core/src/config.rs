//! Engine configuration.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for device count, sizing bounds and persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of compute devices; one worker thread is started per device.
    pub devices: usize,
    /// Upper bound on memory-model sizing passes before reporting a sizing cycle.
    pub max_sizing_attempts: usize,
    /// Save persistable blocks every N completed steps. Zero disables autosave.
    pub autosave_interval: u64,
    /// Load every persistable block on the first step, regardless of node flags.
    pub load_all_nodes_data: bool,
    /// Save every persistable block on stop/autosave, regardless of node flags.
    pub save_all_nodes_data: bool,
    /// Folder holding persisted memory block records.
    pub data_folder: PathBuf,
    /// Run the standard plan on step 0 as well as the init plan.
    pub standard_on_init_step: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            max_sizing_attempts: 20,
            autosave_interval: 0,
            load_all_nodes_data: false,
            save_all_nodes_data: false,
            data_folder: PathBuf::from("data"),
            standard_on_init_step: true,
        }
    }
}

impl SimulationConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse simulation config")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read simulation config at {}", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_data_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.data_folder = folder.into();
        self
    }

    pub fn with_autosave_interval(mut self, interval: u64) -> Self {
        self.autosave_interval = interval;
        self
    }

    /// Autosave fires on completed steps that are a positive multiple of the interval.
    pub fn is_autosave_step(&self, step: u64) -> bool {
        step > 0 && self.autosave_interval > 0 && step % self.autosave_interval == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg = SimulationConfig::from_json_str(r#"{ "devices": 2, "autosave_interval": 5 }"#)
            .expect("config parses");
        assert_eq!(cfg.devices, 2);
        assert_eq!(cfg.autosave_interval, 5);
        assert_eq!(cfg.max_sizing_attempts, 20);
        assert!(cfg.standard_on_init_step);
    }

    #[test]
    fn autosave_steps() {
        let cfg = SimulationConfig::default().with_autosave_interval(3);
        assert!(!cfg.is_autosave_step(0));
        assert!(!cfg.is_autosave_step(2));
        assert!(cfg.is_autosave_step(3));
        assert!(cfg.is_autosave_step(6));
        assert!(!SimulationConfig::default().is_autosave_step(3));
    }
}
