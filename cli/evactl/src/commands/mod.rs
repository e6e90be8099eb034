//! CLI commands.

mod host;
mod send;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// evactl - Drive the EVA control channel from a terminal.
#[derive(Debug, Parser)]
#[command(name = "evactl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level when RUST_LOG is unset.
    #[arg(long, global = true, env = "EVA_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a control host and acknowledge every command.
    Host(host::HostCommand),

    /// Connect as controller and send one command.
    Send(send::SendCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    pub fn log_level(&self) -> String {
        self.log_level.clone()
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Host(cmd) => cmd.run().await,
            Commands::Send(cmd) => cmd.run().await,
            Commands::Version => {
                println!("evactl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}
