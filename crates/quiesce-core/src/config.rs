//! Configuration loaded from TOML
//!
//! ```toml
//! [machine]
//! ncpu = 4
//! tick_us = 1000
//! ipi = "deliver"
//!
//! [torture]
//! writers = 2
//! duration_ms = 500
//! ```

use crate::torture::TortureConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Errors produced while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid TOML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values are out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How the machine delivers cross-calls
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpiMode {
    /// Idle CPUs are switched immediately, busy CPUs are asked to reschedule
    #[default]
    Deliver,
    /// Cross-calls are only counted; context switches are driven by hand
    Record,
}

/// Shape of the hosted machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Number of virtual CPUs (0 = number of host CPUs)
    pub ncpu: usize,

    /// Length of one scheduler tick in microseconds
    pub tick_us: u64,

    /// Cross-call delivery mode
    pub ipi: IpiMode,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ncpu: 0,
            tick_us: 1000,
            ipi: IpiMode::Deliver,
        }
    }
}

impl MachineConfig {
    /// Config with a fixed CPU count and default tick
    pub fn with_cpus(ncpu: usize) -> Self {
        Self {
            ncpu,
            ..Self::default()
        }
    }

    /// CPU count with `0` resolved to the host's CPU count
    pub fn effective_ncpu(&self) -> usize {
        if self.ncpu == 0 {
            num_cpus::get()
        } else {
            self.ncpu
        }
    }

    /// One scheduler tick
    pub fn tick(&self) -> Duration {
        Duration::from_micros(self.tick_us)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Machine shape
    pub machine: MachineConfig,

    /// Torture harness parameters
    pub torture: TortureConfig,
}

impl Config {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.machine.tick_us == 0 {
            return Err(ConfigError::Invalid("machine.tick_us must be positive".into()));
        }
        if self.torture.writers == 0 {
            return Err(ConfigError::Invalid("torture.writers must be positive".into()));
        }
        if self.torture.nodes < self.torture.writers + 2 {
            return Err(ConfigError::Invalid(format!(
                "torture.nodes must be at least writers + 2 ({})",
                self.torture.writers + 2
            )));
        }
        Ok(())
    }
}
