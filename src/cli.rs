//! Command-line interface for the init daemon.
use clap::{Parser, Subcommand};

use crate::constants::CONFIG_BASE_DIR;

/// Command-line interface for lutrainit.
#[derive(Parser)]
#[command(name = "lutrainit", version, author)]
#[command(about = "lutra init daemon", long_about = None)]
pub struct Cli {
    /// Lutrainit configuration directory.
    #[arg(long, value_name = "DIR", default_value = CONFIG_BASE_DIR, global = true)]
    pub confdir: String,

    /// The command to execute. PID 1 is invoked with no arguments, which
    /// means `sysinit`.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands for lutrainit.
#[derive(Subcommand)]
pub enum Commands {
    /// Boot userspace and supervise it. The default.
    Sysinit,

    /// Parse the unit files and list the services.
    ServicesList,

    /// Parse the unit files and print the computed boot order.
    ServicesTree,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
