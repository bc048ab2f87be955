//! Command-line interface for Watchkeeper
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::sickbay::{CheckType, Priority};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use std::path::PathBuf;

/// Watchkeeper - health checks and guest channel watch for a VM fleet
#[derive(Parser)]
#[command(name = "watchkeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "watchkeeper.toml", global = true)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon: roll call, lookout, rounds and the queue pump
    Run,

    /// Queue a health check for a machine
    Enqueue {
        /// Machine id
        machine: String,

        /// Check type (e.g. disk-space, overall-status, custom)
        check: CheckType,

        /// low, medium, high or critical
        #[arg(short, long, default_value = "medium")]
        priority: Priority,

        /// JSON payload forwarded to the guest agent
        #[arg(long, value_parser = parse_json)]
        payload: Option<Value>,
    },

    /// Run the next eligible task of a machine now
    Process {
        /// Machine id
        machine: String,
    },

    /// Show task counts by status
    Queue {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List machines with their latest health snapshot
    Machines {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Ping machines and show guest connection statistics
    Connections {
        /// Machine ids to ping (all known machines if none given)
        machines: Vec<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Diagnose a machine's guest channel
    Diagnose {
        /// Machine id
        machine: String,
    },

    /// Check whether the guest agent service is installed and running
    Agent {
        /// Machine id
        machine: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration
    Check,

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {}", e))
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "watchkeeper", &mut std::io::stdout());
    }
}
