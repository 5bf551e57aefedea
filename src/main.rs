//! taskmesh - LAN-local distributed task-execution fabric
//!
//! Main entry point for the taskmesh binary. The node discovers peers over
//! UDP broadcast, serves tasks to other nodes over TCP, and accepts local
//! submissions through the library API.

use clap::Parser;
use tracing::info;

use taskmesh::cli::{Cli, Commands, ConfigSubcommand};
use taskmesh::config::{init_config, NodeConfig};
use taskmesh::error::{Error, Result};
use taskmesh::logging;
use taskmesh::Node;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            // Config commands use minimal logging
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Run { config } => {
            let config = NodeConfig::load(config.as_deref())?;

            // The guards must be kept alive for the lifetime of the program
            let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

            info!(
                version = env!("CARGO_PKG_VERSION"),
                hostname = %config.hostname(),
                "Starting taskmesh node"
            );

            run_node(config)
        }
    }
}

/// Print version and build information
fn print_version() {
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    println!("{}", env!("CARGO_PKG_DESCRIPTION"));
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let config = NodeConfig::load(config.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigSubcommand::Init { path, force } => init_config(path.as_deref(), force),
        ConfigSubcommand::Validate { config } => {
            NodeConfig::load(config.as_deref())?;
            println!("Configuration is valid");
            Ok(())
        }
    }
}

/// Run the node until interrupted
fn run_node(config: NodeConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(if config.node.worker_threads > 0 {
            config.node.worker_threads as usize
        } else {
            num_cpus::get().min(8)
        })
        .thread_name("taskmesh")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async {
        let node = Node::new(config);
        node.start().await?;

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Internal(format!("Failed to listen for shutdown: {}", e)))?;
        info!("Received shutdown signal");

        node.stop();
        Ok(())
    })
}
