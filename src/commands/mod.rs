/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint.

- `sessions`: schema setup, sessions, records, conversations and sweeps
- `jobs`: generation jobs and their content

Handlers open the database described by the loaded configuration and print
tables with `prettytable`.
*/

use crate::config::Config;
use crate::error::Result;
use crate::storage::Database;

pub mod jobs;
pub mod sessions;

/// Open the configured database, creating and migrating it if needed
pub fn open_database(config: &Config) -> Result<Database> {
    let db = Database::from_config(&config.storage)?;
    tracing::debug!(path = %db.path().display(), "Opened database");
    Ok(db)
}

/// Shorten `text` to `max` characters for table cells
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}
