//! I/O helpers for task execution.

pub mod agent;
pub mod artifacts;
pub mod config;
pub mod explorer;
pub mod harness;
pub mod inputs;
pub mod process;
pub mod prompt;
pub mod skeleton;
