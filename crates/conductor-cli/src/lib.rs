//! Command implementations behind the `conductor` binary.
//!
//! Kept as a library so the integration tests can drive the commands
//! without spawning a process.

pub mod commands;
pub mod workers;
