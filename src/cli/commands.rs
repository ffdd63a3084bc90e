//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Terrastack - cross-stack infrastructure planner.
#[derive(Parser, Debug)]
#[command(name = "terrastack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "TERRASTACK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new Terrastack project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration and the dependency graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the resource dependency graph.
    Graph,

    /// Compute and display the plan.
    Plan {
        /// Write the plan document as JSON to this file.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Plan and apply through an external engine.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Engine command line, overriding `apply.engine`.
        #[arg(long, env = "TERRASTACK_ENGINE")]
        engine: Option<String>,

        /// Maximum concurrent operations.
        #[arg(long)]
        parallelism: Option<usize>,

        /// Per-operation timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Inspect and maintain the state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the current snapshot.
    Show,

    /// Acquire the lock and print its token.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Release the lock.
    Unlock {
        /// Token printed by `state lock`.
        #[arg(long)]
        token: Option<String>,

        /// Remove the lock whoever holds it.
        #[arg(long)]
        force: bool,
    },

    /// Extend a held lock's expiry.
    Renew {
        /// Token printed by `state lock`.
        #[arg(long)]
        token: String,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_flags() {
        let cli = Cli::try_parse_from([
            "terrastack",
            "--output",
            "json",
            "apply",
            "--yes",
            "--engine",
            "./engine --dry-run",
            "--parallelism",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Apply {
                yes,
                engine,
                parallelism,
                timeout,
            } => {
                assert!(yes);
                assert_eq!(engine.as_deref(), Some("./engine --dry-run"));
                assert_eq!(parallelism, Some(2));
                assert_eq!(timeout, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_state_subcommands() {
        let cli = Cli::try_parse_from(["terrastack", "state", "renew", "--token", "abc"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Renew { ref token }
            } if token == "abc"
        ));
    }
}
