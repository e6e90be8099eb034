//! Output formatting for CLI commands.

use colored::Colorize;
use eva_control_channel::JsonObject;

/// Print a frame as a single JSON line on stdout.
pub fn print_frame(frame: &JsonObject) {
    match serde_json::to_string(frame) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("{} {}", "Warning:".yellow().bold(), e),
    }
}

/// Print an info message.
pub fn print_info(message: &str) {
    eprintln!("{} {}", "Info:".blue().bold(), message);
}
