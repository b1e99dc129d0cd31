//! Command-line interface for prp-relay.
//!
//! Provides the `run` entry point plus operator commands for submitting
//! PRPs and inspecting queues, agents and the watchdog.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
