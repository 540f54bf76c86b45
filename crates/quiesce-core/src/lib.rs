//! Quiesce core
//!
//! Cross-CPU synchronization substrate of a multiprocessor kernel, hosted
//! as a library:
//! - Passive serialization: lock-free readers, writers that wait for every
//!   CPU to pass through two context switches before reclaiming old data
//! - Workqueues: FIFO deferred work on dedicated per-queue kernel threads
//! - A hosted `Machine` that models the CPUs, cross-calls, kernel threads
//!   and context-switch hook those subsystems consume
//! - A torture harness that checks grace periods under load

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod cpu;
pub mod platform;
pub mod pserialize;
pub mod spl;
pub mod torture;
pub mod workqueue;

pub use config::{Config, ConfigError, IpiMode, MachineConfig};
pub use cpu::{CpuId, CpuSet};
pub use platform::{Kthread, KthreadSpec, Machine, OnCpu, Platform, Priority, SwitchObserver};
pub use pserialize::{Checkpoint, Engine, EngineStats, ReadGuard, ReadToken, Stage};
pub use spl::Ipl;
pub use torture::{TortureConfig, TortureReport};
pub use workqueue::{Work, Workqueue, WorkqueueAttrs, WorkqueueStats, WqFlags};

/// Errors returned by fallible constructors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Allocation failed
    #[error("Out of memory allocating {0}")]
    NoMemory(&'static str),

    /// CPU index outside the machine
    #[error("CPU {0} is not present")]
    NoSuchCpu(CpuId),

    /// Kernel thread could not be started
    #[error("Failed to create kernel thread {name}: {source}")]
    Kthread {
        /// Thread name
        name: String,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
