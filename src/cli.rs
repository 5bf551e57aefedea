//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the taskmesh node.

use clap::{Parser, Subcommand};

/// taskmesh - LAN-local distributed task-execution fabric
///
/// Discovers peer nodes on the local network, exchanges hardware telemetry
/// over persistent TCP links, and routes submitted tasks to peers with
/// spare capacity.
#[derive(Parser, Debug)]
#[command(name = "taskmesh")]
#[command(author, version, about = "taskmesh - LAN-local distributed task-execution fabric", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the node
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the node (discovers peers and serves tasks)
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "TASKMESH_CONFIG")]
        config: Option<String>,
    },

    /// Display version information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
