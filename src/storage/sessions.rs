//! Session rows and the optimistic-lock protected current-record pointer

use super::types::{Session, SessionStatus, SessionSummary};
use super::{enum_column, now_timestamp, timestamp_column, Database};
use crate::error::{is_unique_violation, ChapterflowError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};

const SESSION_COLUMNS: &str = "key, max_history, current_record_id, lock_version, status, \
     owner_user_id, created_at, updated_at";

/// Owns `Session` rows
#[derive(Debug, Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Return the session for `key`, creating it when absent
    ///
    /// Two callers racing to create the same key both receive the winner's row.
    pub fn get_or_create(&self, key: &str, max_history: u32) -> Result<Session> {
        if key.trim().is_empty() {
            return Err(ChapterflowError::Validation("session key must not be empty".into()).into());
        }
        if max_history == 0 {
            return Err(
                ChapterflowError::Validation("max_history must be greater than 0".into()).into(),
            );
        }

        let conn = self.db.connection()?;
        if let Some(session) = load_session(&conn, key)? {
            return Ok(session);
        }

        let now = now_timestamp();
        match conn.execute(
            "INSERT INTO sessions (key, max_history, status, lock_version, created_at, updated_at)
             VALUES (?1, ?2, 'active', 0, ?3, ?3)",
            params![key, max_history, now],
        ) {
            Ok(_) => info!(session_key = key, max_history, "Created session"),
            Err(e) if is_unique_violation(&e) => {
                debug!(session_key = key, "Session created concurrently, re-reading");
            }
            Err(e) => return Err(ChapterflowError::from_sqlite(e, "Failed to create session").into()),
        }

        load_session(&conn, key)?.ok_or_else(|| ChapterflowError::not_found("session", key).into())
    }

    pub fn get(&self, key: &str) -> Result<Option<Session>> {
        let conn = self.db.connection()?;
        load_session(&conn, key)
    }

    /// Session row with its record count
    pub fn get_summary(&self, key: &str) -> Result<Option<SessionSummary>> {
        let conn = self.db.connection()?;
        conn.query_row(
            "SELECT s.key, s.status, s.max_history, s.current_record_id,
                    (SELECT COUNT(*) FROM history_records r WHERE r.session_key = s.key),
                    s.created_at, s.updated_at
             FROM sessions s WHERE s.key = ?1",
            params![key],
            summary_from_row,
        )
        .optional()
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to load session summary").into())
    }

    /// Point the session at `record_id` (or clear it)
    ///
    /// Optimistic: the version is read without taking the write lock and the
    /// write only lands if no other writer bumped it in between. Returns
    /// `false` on such a lost race and leaves the row untouched; retrying is
    /// up to the caller. The only wait is SQLite's busy timeout for the
    /// short write itself.
    pub fn update_current_record(&self, key: &str, record_id: Option<i64>) -> Result<bool> {
        let version = {
            let conn = self.db.connection()?;
            current_version(&conn, key)?
        };
        self.set_pointer(key, record_id, version)
    }

    /// Conditional write for callers that already hold a version
    ///
    /// Returns `false`, leaving the row untouched, when another writer bumped
    /// the version since `expected_version` was read. Nothing is retried here.
    pub fn update_current_record_if_version(
        &self,
        key: &str,
        record_id: Option<i64>,
        expected_version: i64,
    ) -> Result<bool> {
        self.set_pointer(key, record_id, expected_version)
    }

    fn set_pointer(
        &self,
        key: &str,
        record_id: Option<i64>,
        expected_version: i64,
    ) -> Result<bool> {
        let mut conn = self.db.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to start transaction"))?;
        // the owner check and the swap see the same snapshot
        current_version(&tx, key)?;
        ensure_record_owner(&tx, key, record_id)?;
        let swapped = compare_and_swap(&tx, key, record_id, expected_version)?;
        tx.commit()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to commit current record"))?;
        Ok(swapped)
    }

    pub fn get_status(&self, key: &str) -> Result<SessionStatus> {
        let conn = self.db.connection()?;
        conn.query_row(
            "SELECT status FROM sessions WHERE key = ?1",
            params![key],
            |row| enum_column(row, 0, SessionStatus::from_str_opt),
        )
        .optional()
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to load session status"))?
        .ok_or_else(|| ChapterflowError::not_found("session", key).into())
    }

    /// Returns `false` if the session does not exist
    pub fn set_status(&self, key: &str, status: SessionStatus) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn
            .execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE key = ?3",
                params![status.as_str(), now_timestamp(), key],
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to update session status"))?;
        if changed > 0 {
            info!(session_key = key, status = %status, "Session status updated");
        }
        Ok(changed > 0)
    }

    /// Link the session to an authenticated user
    pub fn set_owner(&self, key: &str, user_id: i64) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn
            .execute(
                "UPDATE sessions SET owner_user_id = ?1, updated_at = ?2 WHERE key = ?3",
                params![user_id, now_timestamp(), key],
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to set session owner"))?;
        Ok(changed > 0)
    }

    /// Most recently updated sessions first
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        let conn = self.db.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT s.key, s.status, s.max_history, s.current_record_id,
                        (SELECT COUNT(*) FROM history_records r WHERE r.session_key = s.key),
                        s.created_at, s.updated_at
                 FROM sessions s
                 ORDER BY s.updated_at DESC, s.key
                 LIMIT ?1",
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to prepare session listing"))?;
        let rows = stmt
            .query_map(params![limit as i64], summary_from_row)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to list sessions"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read session row").into())
    }

    pub fn delete_session(&self, key: &str) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn
            .execute("DELETE FROM sessions WHERE key = ?1", params![key])
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to delete session"))?;
        if changed > 0 {
            info!(session_key = key, "Deleted session");
        }
        Ok(changed > 0)
    }

    /// Keep the `max_sessions` most recently updated sessions, delete the rest
    ///
    /// Records, messages, jobs and chunks of deleted sessions cascade.
    pub fn cleanup_old_sessions(&self, max_sessions: u32) -> Result<usize> {
        let conn = self.db.connection()?;
        let deleted = conn
            .execute(
                "DELETE FROM sessions WHERE key IN (
                    SELECT key FROM sessions
                    ORDER BY updated_at DESC, key
                    LIMIT -1 OFFSET ?1
                 )",
                params![max_sessions],
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to clean up sessions"))?;
        if deleted > 0 {
            info!(deleted, max_sessions, "Cleaned up old sessions");
        }
        Ok(deleted)
    }
}

/// Bump `updated_at` on a session without touching its lock version
pub(crate) fn touch_session(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET updated_at = ?1 WHERE key = ?2",
        params![now_timestamp(), key],
    )
    .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to touch session"))?;
    Ok(())
}

pub(crate) fn load_session(conn: &Connection, key: &str) -> Result<Option<Session>> {
    conn.query_row(
        &format!("SELECT {} FROM sessions WHERE key = ?1", SESSION_COLUMNS),
        params![key],
        session_from_row,
    )
    .optional()
    .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to load session").into())
}

fn current_version(conn: &Connection, key: &str) -> Result<i64> {
    conn.query_row(
        "SELECT lock_version FROM sessions WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read lock version"))?
    .ok_or_else(|| ChapterflowError::not_found("session", key).into())
}

fn ensure_record_owner(conn: &Connection, key: &str, record_id: Option<i64>) -> Result<()> {
    let Some(record_id) = record_id else {
        return Ok(());
    };
    let owner: Option<String> = conn
        .query_row(
            "SELECT session_key FROM history_records WHERE id = ?1",
            params![record_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to check record owner"))?;
    match owner {
        Some(owner) if owner == key => Ok(()),
        _ => Err(ChapterflowError::Validation(format!(
            "record {} does not belong to session {}",
            record_id, key
        ))
        .into()),
    }
}

fn compare_and_swap(
    conn: &Connection,
    key: &str,
    record_id: Option<i64>,
    expected_version: i64,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE sessions
             SET current_record_id = ?1, lock_version = lock_version + 1, updated_at = ?2
             WHERE key = ?3 AND lock_version = ?4",
            params![record_id, now_timestamp(), key, expected_version],
        )
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to update current record"))?;

    if changed == 0 {
        warn!(
            session_key = key,
            expected_version, "Current record update lost: version conflict"
        );
        return Ok(false);
    }

    info!(session_key = key, record_id, "Updated current record");
    Ok(true)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        key: row.get(0)?,
        max_history: row.get(1)?,
        current_record_id: row.get(2)?,
        lock_version: row.get(3)?,
        status: enum_column(row, 4, SessionStatus::from_str_opt)?,
        owner_user_id: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        updated_at: timestamp_column(row, 7)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SessionSummary> {
    let record_count: i64 = row.get(4)?;
    Ok(SessionSummary {
        key: row.get(0)?,
        status: enum_column(row, 1, SessionStatus::from_str_opt)?,
        max_history: row.get(2)?,
        current_record_id: row.get(3)?,
        record_count: record_count as usize,
        created_at: timestamp_column(row, 5)?,
        updated_at: timestamp_column(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::RecordStore;
    use crate::test_utils::{assert_error_kind, temp_database};

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (_dir, db) = temp_database();
        let store = SessionStore::new(db);

        let first = store.get_or_create("u1", 30).unwrap();
        let second = store.get_or_create("u1", 10).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.max_history, 30);
        assert_eq!(second.lock_version, 0);
        assert_eq!(second.status, SessionStatus::Active);
        assert_eq!(second.current_record_id, None);
    }

    #[test]
    fn test_get_or_create_rejects_empty_key() {
        let (_dir, db) = temp_database();
        let store = SessionStore::new(db);
        assert_error_kind(store.get_or_create("  ", 30), ErrorKind::Validation);
        assert_error_kind(store.get_or_create("u1", 0), ErrorKind::Validation);
    }

    #[test]
    fn test_concurrent_get_or_create_returns_same_row() {
        let (_dir, db) = temp_database();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = SessionStore::new(db.clone());
                std::thread::spawn(move || store.get_or_create("shared", 30).unwrap())
            })
            .collect();
        let sessions: Vec<Session> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(sessions.iter().all(|s| s == &sessions[0]));
    }

    #[test]
    fn test_update_current_record_bumps_version() {
        let (_dir, db) = temp_database();
        let store = SessionStore::new(db.clone());
        let records = RecordStore::new(db);
        store.get_or_create("u1", 30).unwrap();
        let record = records.create_record("u1").unwrap();

        let before = store.get("u1").unwrap().unwrap();
        assert!(store.update_current_record("u1", None).unwrap());
        let cleared = store.get("u1").unwrap().unwrap();
        assert_eq!(cleared.current_record_id, None);
        assert_eq!(cleared.lock_version, before.lock_version + 1);

        assert!(store.update_current_record("u1", Some(record.id)).unwrap());
        let after = store.get("u1").unwrap().unwrap();
        assert_eq!(after.current_record_id, Some(record.id));
        assert_eq!(after.lock_version, before.lock_version + 2);
    }

    #[test]
    fn test_stale_version_leaves_row_unchanged() {
        let (_dir, db) = temp_database();
        let store = SessionStore::new(db.clone());
        let records = RecordStore::new(db);
        store.get_or_create("u1", 30).unwrap();
        let first = records.create_record("u1").unwrap();
        let second = records.create_record("u1").unwrap();

        let current = store.get("u1").unwrap().unwrap();
        let stale = current.lock_version - 1;
        let applied = store
            .update_current_record_if_version("u1", Some(first.id), stale)
            .unwrap();

        assert!(!applied);
        let unchanged = store.get("u1").unwrap().unwrap();
        assert_eq!(unchanged.current_record_id, Some(second.id));
        assert_eq!(unchanged.lock_version, current.lock_version);
    }

    #[test]
    fn test_racing_pointer_updates_only_count_landed_writes() {
        const WRITERS: usize = 8;
        let (_dir, db) = temp_database();
        let store = SessionStore::new(db.clone());
        store.get_or_create("u1", 30).unwrap();
        let record = RecordStore::new(db.clone()).create_record("u1").unwrap();
        let start = store.get("u1").unwrap().unwrap().lock_version;

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(WRITERS));
        let handles: Vec<_> = (0..WRITERS)
            .map(|_| {
                let store = SessionStore::new(db.clone());
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    store.update_current_record("u1", Some(record.id)).unwrap()
                })
            })
            .collect();
        let landed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|swapped| *swapped)
            .count();

        // every `true` bumped the version once, every `false` left it alone
        assert!(landed >= 1);
        let session = store.get("u1").unwrap().unwrap();
        assert_eq!(session.lock_version, start + landed as i64);
        assert_eq!(session.current_record_id, Some(record.id));
    }

    #[test]
    fn test_update_current_record_rejects_foreign_record() {
        let (_dir, db) = temp_database();
        let store = SessionStore::new(db.clone());
        let records = RecordStore::new(db);
        store.get_or_create("u1", 30).unwrap();
        store.get_or_create("u2", 30).unwrap();
        let other = records.create_record("u2").unwrap();

        assert_error_kind(
            store.update_current_record("u1", Some(other.id)),
            ErrorKind::Validation,
        );
        assert_error_kind(
            store.update_current_record("missing", None),
            ErrorKind::NotFound,
        );
    }

    #[test]
    fn test_status_roundtrip() {
        let (_dir, db) = temp_database();
        let store = SessionStore::new(db);
        store.get_or_create("u1", 30).unwrap();

        assert_eq!(store.get_status("u1").unwrap(), SessionStatus::Active);
        assert!(store.set_status("u1", SessionStatus::Archived).unwrap());
        assert_eq!(store.get_status("u1").unwrap(), SessionStatus::Archived);
        assert!(!store.set_status("missing", SessionStatus::Inactive).unwrap());
        assert_error_kind(store.get_status("missing"), ErrorKind::NotFound);
    }

    #[test]
    fn test_summary_counts_records() {
        let (_dir, db) = temp_database();
        let store = SessionStore::new(db.clone());
        let records = RecordStore::new(db);
        store.get_or_create("u1", 30).unwrap();
        records.create_record("u1").unwrap();
        records.create_record("u1").unwrap();

        let summary = store.get_summary("u1").unwrap().unwrap();
        assert_eq!(summary.record_count, 2);
        assert!(summary.current_record_id.is_some());
        assert!(store.get_summary("missing").unwrap().is_none());
    }

    #[test]
    fn test_cleanup_old_sessions_keeps_most_recent() {
        let (_dir, db) = temp_database();
        let store = SessionStore::new(db.clone());
        let records = RecordStore::new(db);
        for key in ["a", "b", "c"] {
            store.get_or_create(key, 30).unwrap();
            records.create_record(key).unwrap();
        }

        let deleted = store.cleanup_old_sessions(2).unwrap();

        assert_eq!(deleted, 1);
        assert!(store.get("a").unwrap().is_none());
        assert!(store.get("c").unwrap().is_some());
        assert_eq!(records.count_records("a").unwrap(), 0);
        assert_eq!(store.list_sessions(10).unwrap().len(), 2);
    }
}
