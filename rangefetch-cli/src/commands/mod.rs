//! CLI commands.

pub mod fetch;
pub mod jobs;
