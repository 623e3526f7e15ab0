//! Command-line interface for fleet-scheduler.
//!
//! Provides commands for store administration, configuration validation
//! and metrics export.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
