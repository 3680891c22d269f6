//! rangefetch CLI - resumable multi-connection downloads from the shell.

mod commands;
mod error;
mod progress;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rangefetch", version, about = "Resumable multi-connection downloader")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download one or more URLs, resuming interrupted transfers
    Fetch(commands::fetch::FetchArgs),
    /// List resumable downloads recorded in a journal
    Jobs(commands::jobs::JobsArgs),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Fetch(args) => commands::fetch::run(args),
        Command::Jobs(args) => commands::jobs::run(args),
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(match err {
            error::CliError::Canceled => 130,
            _ => 1,
        });
    }
}
