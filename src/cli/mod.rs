//! CLI module for the Terrastack planner.
//!
//! This module provides the command-line interface for validating stacks,
//! planning, applying and maintaining the state backend.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
