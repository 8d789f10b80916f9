//! Human-facing status lines on stderr; stdout is reserved for reports.

use colored::Colorize;

pub fn success(message: &str) {
    eprintln!("{} {message}", "✓".green().bold());
}

/// One red line for a failed command, including the error's causes.
pub fn failure(err: &anyhow::Error) {
    eprintln!("{} {err:#}", "error:".red().bold());
}
