//! CLI module for the gcpgpu tool.
//!
//! This module provides the command-line interface for planning, applying
//! and inspecting deployments.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
