//! Test utilities for Chapterflow
//!
//! Temporary databases and small assertion helpers shared by unit tests.

use crate::config::Config;
use crate::error::{error_kind, ErrorKind};
use crate::storage::Database;
use tempfile::TempDir;

/// Create a migrated database inside a fresh temporary directory
///
/// The returned `TempDir` must be kept alive for as long as the database is used.
pub fn temp_database() -> (TempDir, Database) {
    let dir = TempDir::new().expect("Failed to create temporary directory");
    let db = Database::new_with_path(dir.path().join("chapterflow.db"))
        .expect("Failed to open temporary database");
    (dir, db)
}

/// Assert that a result failed with the given error kind
///
/// # Panics
///
/// Panics if the result is `Ok` or carries a different kind
pub fn assert_error_kind<T: std::fmt::Debug>(result: crate::Result<T>, expected: ErrorKind) {
    match result {
        Ok(value) => panic!("Expected {:?} error, got Ok({:?})", expected, value),
        Err(err) => assert_eq!(
            error_kind(&err),
            expected,
            "unexpected error kind for: {}",
            err
        ),
    }
}

/// Configuration pointing at a temporary database
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.db_path = Some(dir.path().join("chapterflow.db"));
    config.storage.default_max_history = 5;
    config
}
