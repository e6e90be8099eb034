//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Command must be a JSON object: {0}")]
    InvalidCommand(String),

    #[error("Could not connect to control host {host}:{port} ({reason})")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Control host rejected the connection: {reason}")]
    Rejected { reason: String },
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::Connect { reason, .. } if reason == "refused" => {
                eprintln!(
                    "\n{}",
                    "Hint: Is a host running? Start one with `evactl host --port <PORT>`.".yellow()
                );
            }
            CliError::Rejected { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: The host already has a controller attached.".yellow()
                );
            }
            _ => {}
        }
    }
}
