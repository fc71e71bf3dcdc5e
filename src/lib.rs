//! Dependency-ordered init daemon and service supervisor for Linux.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binaries (src/bin/)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
#[cfg(test)]
use tempfile as _;

/// CLI parsing.
pub mod cli;

/// Config loading.
pub mod config;

/// Constants.
pub mod constants;

/// Control server.
pub mod control;

/// Dependency sorter.
pub mod deps;

/// Errors.
pub mod error;

/// Getty pool.
pub mod getty;

/// IPC with the control CLI.
pub mod ipc;

/// Process launching.
pub mod launcher;

/// Logging sinks.
pub mod logging;

/// Mount shell-outs.
pub mod mount;

/// Zombie reaping.
pub mod reaper;

/// Re-exec state preservation.
pub mod reexec;

/// Service records and table.
pub mod service;

/// Shutdown and kill-all.
pub mod shutdown;

/// Runtime stats.
pub mod stats;

/// Service supervisor.
pub mod supervisor;
