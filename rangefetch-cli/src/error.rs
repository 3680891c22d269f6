//! CLI error type.

use std::fmt;

/// Errors surfaced to the command line with an exit code.
#[derive(Debug)]
pub enum CliError {
    Config(String),
    Store(String),
    Download(String),
    Canceled,
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "configuration error: {msg}"),
            CliError::Store(msg) => write!(f, "breakpoint store error: {msg}"),
            CliError::Download(msg) => write!(f, "download failed: {msg}"),
            CliError::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::error::Error for CliError {}
