//! CLI argument parsing for the `magccd` tool
//!
//! # Design Principles (KISS)
//! - clap derive, one subcommand per controller server operation
//! - Endpoint overrides (`--host`, `--port`, `--demo`) win over the config file

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// Arguments shared by every subcommand
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "magccd.toml", global = true)]
    pub config_file: String,

    /// Controller server host (skips discovery)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Controller server port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Demo mode: canned replies, no network traffic
    #[arg(long, global = true)]
    pub demo: bool,
}

impl CommonArgs {
    /// Apply endpoint overrides to a loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.camserver.host = host.clone();
        }
        if let Some(port) = self.port {
            config.camserver.port = port;
        }
        if self.demo {
            config.camserver.demo = true;
        }
    }
}

/// Magellan CCD controller server client
#[derive(Parser, Debug, Clone)]
#[command(name = "magccd", about = "Magellan CCD controller server client")]
pub struct MagccdArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: MagccdCommand,
}

/// Controller server operations
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum MagccdCommand {
    /// Echo a message from the controller server
    Echo {
        /// Message text (default: test message)
        message: Option<String>,
    },
    /// Read a parameter
    Get { name: String },
    /// Set a parameter
    Set { name: String, value: String },
    /// Upload DSP code and load it into a board
    Load { board: u32, file: PathBuf },
    /// Shut the controller server down
    Close,
    /// Restart the controller server
    Restart,
    /// Reset the controller server
    Reset,
    /// List controller servers answering the ID broadcast
    Discover {
        /// Resolve only this host name
        #[arg(long = "name")]
        name: Option<String>,
    },
}
