//! Subcommand implementations

pub mod torture;
pub mod workqueue;
