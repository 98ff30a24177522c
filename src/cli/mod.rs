//! Command-line interface for birthday-courier.
//!
//! Provides commands for person management, scheduling, running the
//! delivery workers and inspecting the queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
