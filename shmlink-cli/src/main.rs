// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! shmlink CLI
//!
//! Command-line tools for exercising shmlink endpoints.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shmlink_core::{ConfigLoader, TransportConfig, UnicastAddress};
use tracing_subscriber::EnvFilter;

mod commands;

/// shmlink - shared memory IPC transport tools
#[derive(Parser)]
#[command(name = "shmlink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (YAML). Defaults and SHMLINK_BUFFER_SIZE apply without it.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an echo server on an address
    Listen {
        /// Address in the form <domain>:<port>
        #[arg(short, long)]
        address: UnicastAddress,

        /// Server-to-client buffer size in bytes (0 = configured default)
        #[arg(short, long, default_value_t = 0)]
        buffer_size: usize,
    },

    /// Measure round trips against an echo server
    Ping {
        /// Address in the form <domain>:<port>
        #[arg(short, long)]
        address: UnicastAddress,

        /// Number of round trips
        #[arg(short = 'n', long, default_value_t = 1000)]
        count: usize,

        /// Payload size in bytes
        #[arg(short, long, default_value_t = 64)]
        size: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send one notification to a server
    Notify {
        /// Address in the form <domain>:<port>
        #[arg(short, long)]
        address: UnicastAddress,

        /// Notification value (0-249)
        #[arg(long)]
        value: u8,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<TransportConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(ConfigLoader::load_file(path)?),
        None => Ok(TransportConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Listen {
            address,
            buffer_size,
        } => {
            let config = load_config(cli.config.as_ref())?;
            commands::listen::execute(config, address, buffer_size).await
        }
        Commands::Ping {
            address,
            count,
            size,
            json,
        } => {
            let config = load_config(cli.config.as_ref())?;
            commands::ping::execute(config, address, count, size, json).await
        }
        Commands::Notify { address, value } => {
            let config = load_config(cli.config.as_ref())?;
            commands::notify::execute(config, address, value).await
        }
        Commands::Validate { file } => commands::validate::execute(&file).await,
    }
}
