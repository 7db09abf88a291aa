//! SQLite-backed persistence for sessions, records, messages and generation jobs
//!
//! A [`Database`] is a cheap, cloneable handle (path plus busy timeout). Each
//! store operation opens its own connection, so concurrent callers behave like
//! independent processes sharing one database file.

use crate::config::StorageConfig;
use crate::error::{ChapterflowError, Result};
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use directories::ProjectDirs;
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod jobs;
pub mod messages;
pub mod records;
pub mod sessions;
pub mod types;
pub mod users;

pub use jobs::GenerationJobTracker;
pub use messages::MessageSequencer;
pub use records::RecordStore;
pub use sessions::SessionStore;
pub use types::{
    ChapterReferences, ConversationMessage, GenerationChunk, GenerationJob, HistoryRecord,
    JobStatistics, JobStatus, MessageRole, RecordSummary, Reference, References, Session,
    SessionStatus, SessionSummary, User,
};
pub use users::UserStore;

/// Latest schema version written to `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 2;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Handle to the relational store shared by every component
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Open the database in the user's data directory
    ///
    /// `CHAPTERFLOW_DB` overrides the location.
    pub fn new() -> Result<Self> {
        if let Ok(override_path) = std::env::var("CHAPTERFLOW_DB") {
            return Self::new_with_path(override_path);
        }

        let proj_dirs = ProjectDirs::from("com", "chapterflow", "chapterflow")
            .ok_or_else(|| ChapterflowError::Config("Could not determine data directory".into()))?;

        Self::new_with_path(proj_dirs.data_dir().join("chapterflow.db"))
    }

    /// Open (and migrate) the database at a specific path
    ///
    /// # Examples
    ///
    /// ```
    /// use chapterflow::storage::Database;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let db = Database::new_with_path(dir.path().join("store.db")).unwrap();
    /// assert!(db.path().exists());
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        Self::open(db_path.into(), DEFAULT_BUSY_TIMEOUT)
    }

    /// Open the database described by the storage section of the config
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match &config.db_path {
            Some(path) => Self::open(path.clone(), config.busy_timeout()),
            None => {
                let db = Self::new()?;
                Ok(db.with_busy_timeout(config.busy_timeout()))
            }
        }
    }

    fn open(path: PathBuf, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create parent directory for database")?;
            }
        }

        let db = Self { path, busy_timeout };
        db.init()?;
        Ok(db)
    }

    /// Replace the busy timeout used by new connections
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a configured connection
    pub fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to open database"))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to set busy timeout"))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to enable WAL"))?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to enable foreign keys"))?;
        Ok(conn)
    }

    /// Current schema version of the database file
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.connection()?;
        let version = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to query schema version"))?;
        Ok(version)
    }

    fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        run_migrations(&conn)
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    let mut version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("Failed to query schema version")?;

    if version < 1 {
        conn.execute_batch(
            "BEGIN;
             CREATE TABLE IF NOT EXISTS sessions (
                key TEXT PRIMARY KEY,
                max_history INTEGER NOT NULL DEFAULT 30,
                current_record_id INTEGER
                    REFERENCES history_records(id) ON DELETE SET NULL,
                lock_version INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                owner_user_id INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS history_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_key TEXT NOT NULL
                    REFERENCES sessions(key) ON DELETE CASCADE,
                record_position INTEGER NOT NULL DEFAULT 0,
                topic TEXT,
                outline TEXT,
                article_chapters TEXT NOT NULL DEFAULT '[]',
                references_data TEXT NOT NULL DEFAULT '{}',
                next_message_order INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS conversation_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id INTEGER NOT NULL
                    REFERENCES history_records(id) ON DELETE CASCADE,
                message_id TEXT NOT NULL UNIQUE,
                message_order INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (record_id, message_order)
             );

             CREATE TABLE IF NOT EXISTS generation_jobs (
                id TEXT PRIMARY KEY,
                session_key TEXT NOT NULL
                    REFERENCES sessions(key) ON DELETE CASCADE,
                record_id INTEGER
                    REFERENCES history_records(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'queued',
                topic TEXT,
                outline_snapshot_hash TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
             );

             CREATE TABLE IF NOT EXISTS generation_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL
                    REFERENCES generation_jobs(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                chapter_index INTEGER,
                content TEXT NOT NULL,
                is_final_chunk INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE (job_id, seq)
             );

             CREATE INDEX IF NOT EXISTS idx_history_records_session
                ON history_records(session_key, created_at, id);
             CREATE INDEX IF NOT EXISTS idx_generation_jobs_session
                ON generation_jobs(session_key, created_at);
             CREATE INDEX IF NOT EXISTS idx_generation_jobs_record
                ON generation_jobs(record_id);
             CREATE INDEX IF NOT EXISTS idx_sessions_updated
                ON sessions(updated_at DESC);

             PRAGMA user_version = 1;
             COMMIT;",
        )
        .context("Failed to apply schema migration v1")?;
        version = 1;
    }

    if version < 2 {
        conn.execute_batch(
            "BEGIN;
             CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                last_login_at TEXT,
                backfilled_at TEXT
             );

             CREATE TABLE IF NOT EXISTS identity_links (
                alias_key TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL
                    REFERENCES users(id) ON DELETE CASCADE,
                linked_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_identity_links_user
                ON identity_links(user_id);
             CREATE INDEX IF NOT EXISTS idx_sessions_owner
                ON sessions(owner_user_id);

             PRAGMA user_version = 2;
             COMMIT;",
        )
        .context("Failed to apply schema migration v2")?;
        version = 2;
    }

    tracing::debug!(version, "Database schema up to date");
    Ok(())
}

/// Timestamp text for a moment, RFC 3339 UTC with microseconds
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current moment truncated to the stored precision
pub(crate) fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Timestamp text for the current moment
pub(crate) fn now_timestamp() -> String {
    format_timestamp(now_utc())
}

/// Read a non-null timestamp column
pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw, idx)
}

/// Read a nullable timestamp column
pub(crate) fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| parse_timestamp(&value, idx)).transpose()
}

fn parse_timestamp(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Decode a JSON text column
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Decode a text column holding an enum name
pub(crate) fn enum_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown value '{}'", raw).into(),
        )
    })
}
