//! Jobs command - list resumable downloads recorded in a journal.

use std::path::PathBuf;

use clap::Args;
use rangefetch::JournalBreakpointStore;

use crate::error::CliError;

/// Arguments for the jobs command.
#[derive(Debug, Args)]
pub struct JobsArgs {
    /// Directory whose journal to inspect
    #[arg(short = 'd', long, default_value = ".")]
    pub dir: PathBuf,

    /// Path of the resume journal
    #[arg(long)]
    pub journal: Option<PathBuf>,
}

/// Run the jobs command.
pub fn run(args: JobsArgs) -> Result<(), CliError> {
    let journal_path = args
        .journal
        .unwrap_or_else(|| args.dir.join(".rangefetch-journal.json"));
    let store = JournalBreakpointStore::open(&journal_path)
        .map_err(|err| CliError::Store(err.to_string()))?;

    let infos = store.snapshot();
    if infos.is_empty() {
        println!("No resumable downloads in {}", journal_path.display());
        return Ok(());
    }
    for info in infos {
        let total = info.total_length();
        let offset = info.total_offset();
        let percent = if total > 0 {
            (offset as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        println!(
            "[{}] {} -> {} ({offset}/{total} bytes, {percent:.1}%)",
            info.id(),
            info.url(),
            info.filename().unwrap_or_else(|| "<undetermined>".to_string()),
        );
    }
    Ok(())
}
