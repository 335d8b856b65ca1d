//! CLI command definitions for the `weft` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod inspect;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run and inspect workflow graphs.
#[derive(Parser)]
#[command(name = "weft", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for engine debug logs, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true, env = "WEFT_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow once.
    Run {
        /// Workflow file (.json, .yaml or .yml).
        file: PathBuf,

        /// Run input as JSON (plain text is passed as a string).
        #[arg(long)]
        input: Option<String>,

        /// Context values readable as `context.<key>` (repeatable, key=value).
        #[arg(long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,

        /// Engine configuration file.
        #[arg(long, env = "WEFT_CONFIG", default_value = "weft.toml")]
        config: PathBuf,
    },

    /// Check a workflow file without running it.
    Validate {
        /// Workflow file (.json, .yaml or .yml).
        file: PathBuf,
    },

    /// Show the execution plan: order, scopes and sinks.
    Inspect {
        /// Workflow file (.json, .yaml or .yml).
        file: PathBuf,
    },
}
