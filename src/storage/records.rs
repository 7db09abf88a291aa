//! History records: outline, article chapters and references per session
//!
//! Records are kept in creation order. The ordinal position callers see is
//! the rank of a record in that order and is recomputed on every read, so it
//! shifts when older records are pruned or deleted.

use super::sessions::{load_session, SessionStore};
use super::types::{ChapterReferences, HistoryRecord, RecordSummary, References};
use super::{json_column, now_timestamp, timestamp_column, Database};
use crate::error::{ChapterflowError, Result};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};

/// Character budget of the outline preview in summaries
pub const OUTLINE_PREVIEW_CHARS: usize = 100;
/// Character budget of the topic preview in summaries
pub const TOPIC_PREVIEW_CHARS: usize = 50;

const CURRENT_POINTER_ATTEMPTS: usize = 3;

const RECORD_COLUMNS: &str = "id, session_key, topic, outline, article_chapters, references_data, \
     next_message_order, created_at, updated_at";

/// Owns `HistoryRecord` rows and per-session retention pruning
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: Database,
    sessions: SessionStore,
}

impl RecordStore {
    pub fn new(db: Database) -> Self {
        let sessions = SessionStore::new(db.clone());
        Self { db, sessions }
    }

    /// Append a record to the session, make it current, then prune
    ///
    /// Records beyond the session's `max_history` are deleted oldest first,
    /// together with their messages and jobs.
    pub fn create_record(&self, session_key: &str) -> Result<HistoryRecord> {
        let conn = self.db.connection()?;
        let session = load_session(&conn, session_key)?
            .ok_or_else(|| ChapterflowError::not_found("session", session_key))?;

        let position = count(&conn, session_key)?;
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO history_records
                (session_key, record_position, article_chapters, references_data,
                 next_message_order, created_at, updated_at)
             VALUES (?1, ?2, '[]', '{}', 1, ?3, ?3)",
            params![session_key, position as i64, now],
        )
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to create record"))?;
        let record_id = conn.last_insert_rowid();
        info!(session_key, record_id, position, "Created history record");

        let mut pointed = false;
        for _ in 0..CURRENT_POINTER_ATTEMPTS {
            if self.sessions.update_current_record(session_key, Some(record_id))? {
                pointed = true;
                break;
            }
        }
        if !pointed {
            warn!(
                session_key,
                record_id, "Could not make new record current after repeated conflicts"
            );
        }

        self.cleanup_old_records(session_key, session.max_history)?;

        load_record(&conn, record_id)?
            .ok_or_else(|| ChapterflowError::not_found("record", record_id).into())
    }

    pub fn get_record(&self, record_id: i64) -> Result<Option<HistoryRecord>> {
        let conn = self.db.connection()?;
        load_record(&conn, record_id)
    }

    /// Records of a session in creation order, optionally only the first `limit`
    pub fn list_records(&self, session_key: &str, limit: Option<usize>) -> Result<Vec<HistoryRecord>> {
        let conn = self.db.connection()?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM history_records
                 WHERE session_key = ?1
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2",
                RECORD_COLUMNS
            ))
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to prepare record listing"))?;
        let rows = stmt
            .query_map(params![session_key, limit], record_from_row)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to list records"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read record row").into())
    }

    pub fn latest_record(&self, session_key: &str) -> Result<Option<HistoryRecord>> {
        let conn = self.db.connection()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM history_records
                 WHERE session_key = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                RECORD_COLUMNS
            ),
            params![session_key],
            record_from_row,
        )
        .optional()
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to load latest record").into())
    }

    pub fn count_records(&self, session_key: &str) -> Result<usize> {
        let conn = self.db.connection()?;
        count(&conn, session_key)
    }

    pub fn update_outline(&self, record_id: i64, outline: &str) -> Result<bool> {
        self.update_field(record_id, "outline", &outline)
    }

    pub fn update_topic(&self, record_id: i64, topic: &str) -> Result<bool> {
        self.update_field(record_id, "topic", &topic)
    }

    pub fn update_article_chapters(&self, record_id: i64, chapters: &[String]) -> Result<bool> {
        let json = serde_json::to_string(chapters)?;
        self.update_field(record_id, "article_chapters", &json)
    }

    pub fn update_references(&self, record_id: i64, references: &References) -> Result<bool> {
        let json = serde_json::to_string(references)?;
        self.update_field(record_id, "references_data", &json)
    }

    /// Append one chapter to the record's article
    pub fn append_article_chapter(&self, record_id: i64, chapter: &str) -> Result<bool> {
        self.modify_json::<Vec<String>, _>(record_id, "article_chapters", |chapters| {
            chapters.push(chapter.to_string());
        })
    }

    /// Write `chapter` into slot `index`, padding missing slots with `""`
    pub fn set_article_chapter(&self, record_id: i64, index: usize, chapter: &str) -> Result<bool> {
        self.modify_json::<Vec<String>, _>(record_id, "article_chapters", |chapters| {
            if chapters.len() <= index {
                chapters.resize(index + 1, String::new());
            }
            chapters[index] = chapter.to_string();
        })
    }

    /// Replace the reference map of a single chapter
    pub fn update_chapter_references(
        &self,
        record_id: i64,
        chapter_index: usize,
        references: ChapterReferences,
    ) -> Result<bool> {
        self.modify_json::<References, _>(record_id, "references_data", move |all| {
            all.insert(chapter_index, references);
        })
    }

    /// Delete a record along with its messages and jobs
    pub fn delete_record(&self, record_id: i64) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn
            .execute("DELETE FROM history_records WHERE id = ?1", params![record_id])
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to delete record"))?;
        if changed > 0 {
            info!(record_id, "Deleted history record");
        }
        Ok(changed > 0)
    }

    /// Keep the `max_records` newest records of a session, delete the rest
    pub fn cleanup_old_records(&self, session_key: &str, max_records: u32) -> Result<usize> {
        let conn = self.db.connection()?;
        let deleted = conn
            .execute(
                "DELETE FROM history_records WHERE id IN (
                    SELECT id FROM history_records
                    WHERE session_key = ?1
                    ORDER BY created_at DESC, id DESC
                    LIMIT -1 OFFSET ?2
                 )",
                params![session_key, max_records],
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to prune records"))?;
        if deleted > 0 {
            info!(session_key, deleted, max_records, "Pruned old history records");
        }
        Ok(deleted)
    }

    /// One summary per record in creation order with recomputed positions
    pub fn get_records_summary(&self, session_key: &str) -> Result<Vec<RecordSummary>> {
        let current = self
            .sessions
            .get(session_key)?
            .and_then(|session| session.current_record_id);
        let records = self.list_records(session_key, None)?;
        Ok(summarize(&records, current))
    }

    fn update_field(&self, record_id: i64, column: &str, value: &dyn ToSql) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE history_records SET {} = ?1, updated_at = ?2 WHERE id = ?3",
                    column
                ),
                params![value, now_timestamp(), record_id],
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to update record"))?;
        if changed == 0 {
            debug!(record_id, column, "Update skipped: record not found");
            return Ok(false);
        }
        info!(record_id, column, "Updated history record");
        Ok(true)
    }

    fn modify_json<T, F>(&self, record_id: i64, column: &str, apply: F) -> Result<bool>
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
        F: FnOnce(&mut T),
    {
        let mut conn = self.db.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to start transaction"))?;

        let current: Option<T> = tx
            .query_row(
                &format!("SELECT {} FROM history_records WHERE id = ?1", column),
                params![record_id],
                |row| json_column(row, 0),
            )
            .optional()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read record"))?;
        let Some(mut value) = current else {
            return Ok(false);
        };

        apply(&mut value);
        let json = serde_json::to_string(&value)?;
        tx.execute(
            &format!(
                "UPDATE history_records SET {} = ?1, updated_at = ?2 WHERE id = ?3",
                column
            ),
            params![json, now_timestamp(), record_id],
        )
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to update record"))?;
        tx.commit()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to commit record update"))?;

        info!(record_id, column, "Updated history record");
        Ok(true)
    }
}

/// Build summaries for records already sorted by creation time
pub fn summarize(records: &[HistoryRecord], current_record_id: Option<i64>) -> Vec<RecordSummary> {
    records
        .iter()
        .enumerate()
        .map(|(position, record)| {
            let outline = record.outline.as_deref().unwrap_or("");
            let topic = record.topic.as_deref().unwrap_or("");
            RecordSummary {
                id: record.id,
                position,
                created_at: record.created_at,
                updated_at: record.updated_at,
                has_outline: !outline.is_empty(),
                has_article: !record.article_chapters.is_empty(),
                has_topic: !topic.is_empty(),
                article_count: record.article_chapters.len(),
                outline_preview: preview(outline, OUTLINE_PREVIEW_CHARS),
                topic_preview: preview(topic, TOPIC_PREVIEW_CHARS),
                is_current: current_record_id == Some(record.id),
            }
        })
        .collect()
}

fn preview(text: &str, budget: usize) -> String {
    if text.chars().count() > budget {
        let mut truncated: String = text.chars().take(budget).collect();
        truncated.push_str("...");
        truncated
    } else {
        text.to_string()
    }
}

fn count(conn: &Connection, session_key: &str) -> Result<usize> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM history_records WHERE session_key = ?1",
            params![session_key],
            |row| row.get(0),
        )
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to count records"))?;
    Ok(count as usize)
}

pub(crate) fn load_record(conn: &Connection, record_id: i64) -> Result<Option<HistoryRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM history_records WHERE id = ?1", RECORD_COLUMNS),
        params![record_id],
        record_from_row,
    )
    .optional()
    .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to load record").into())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        session_key: row.get(1)?,
        topic: row.get(2)?,
        outline: row.get(3)?,
        article_chapters: json_column(row, 4)?,
        references: json_column(row, 5)?,
        next_message_order: row.get(6)?,
        created_at: timestamp_column(row, 7)?,
        updated_at: timestamp_column(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::types::Reference;
    use crate::storage::SessionStore;
    use crate::test_utils::{assert_error_kind, temp_database};

    fn setup(max_history: u32) -> (tempfile::TempDir, SessionStore, RecordStore) {
        let (dir, db) = temp_database();
        let sessions = SessionStore::new(db.clone());
        sessions.get_or_create("u1", max_history).unwrap();
        (dir, sessions, RecordStore::new(db))
    }

    #[test]
    fn test_create_record_becomes_current() {
        let (_dir, sessions, records) = setup(30);

        let record = records.create_record("u1").unwrap();

        assert_eq!(record.session_key, "u1");
        assert_eq!(record.next_message_order, 1);
        assert!(record.article_chapters.is_empty());
        let session = sessions.get("u1").unwrap().unwrap();
        assert_eq!(session.current_record_id, Some(record.id));
        assert_eq!(session.lock_version, 1);
    }

    #[test]
    fn test_create_record_requires_session() {
        let (_dir, _sessions, records) = setup(30);
        assert_error_kind(records.create_record("nobody"), ErrorKind::NotFound);
    }

    #[test]
    fn test_create_record_prunes_oldest() {
        let (_dir, _sessions, records) = setup(3);

        let created: Vec<i64> = (0..5)
            .map(|_| records.create_record("u1").unwrap().id)
            .collect();

        let remaining: Vec<i64> = records
            .list_records("u1", None)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(remaining, created[2..].to_vec());
        assert!(records.get_record(created[0]).unwrap().is_none());
    }

    #[test]
    fn test_update_fields_and_missing_record() {
        let (_dir, _sessions, records) = setup(30);
        let record = records.create_record("u1").unwrap();

        assert!(records.update_outline(record.id, "# A\n# B").unwrap());
        assert!(records.update_topic(record.id, "Rust").unwrap());
        assert!(records
            .update_article_chapters(record.id, &["one".to_string()])
            .unwrap());
        assert!(!records.update_outline(9999, "nothing").unwrap());

        let loaded = records.get_record(record.id).unwrap().unwrap();
        assert_eq!(loaded.outline.as_deref(), Some("# A\n# B"));
        assert_eq!(loaded.topic.as_deref(), Some("Rust"));
        assert_eq!(loaded.article_chapters, vec!["one".to_string()]);
        assert!(loaded.updated_at >= record.updated_at);
    }

    #[test]
    fn test_append_chapter_and_chapter_references() {
        let (_dir, _sessions, records) = setup(30);
        let record = records.create_record("u1").unwrap();

        assert!(records.append_article_chapter(record.id, "first").unwrap());
        assert!(records.append_article_chapter(record.id, "second").unwrap());

        let mut refs = ChapterReferences::new();
        refs.insert(
            "1".to_string(),
            Reference {
                content: "snippet".to_string(),
                title: "Source".to_string(),
                url: "https://example.com".to_string(),
            },
        );
        assert!(records.update_chapter_references(record.id, 1, refs.clone()).unwrap());
        assert!(!records.append_article_chapter(9999, "lost").unwrap());

        let loaded = records.get_record(record.id).unwrap().unwrap();
        assert_eq!(loaded.article_chapters, vec!["first", "second"]);
        assert_eq!(loaded.references.get(&1), Some(&refs));
        assert_eq!(loaded.article_text(), "first\n\nsecond");
    }

    #[test]
    fn test_set_article_chapter_replaces_or_pads() {
        let (_dir, _sessions, records) = setup(30);
        let record = records.create_record("u1").unwrap();
        records
            .update_article_chapters(record.id, &["old0".to_string(), "old1".to_string()])
            .unwrap();

        assert!(records.set_article_chapter(record.id, 1, "new1").unwrap());
        let loaded = records.get_record(record.id).unwrap().unwrap();
        assert_eq!(loaded.article_chapters, vec!["old0", "new1"]);

        assert!(records.set_article_chapter(record.id, 3, "new3").unwrap());
        let loaded = records.get_record(record.id).unwrap().unwrap();
        assert_eq!(loaded.article_chapters, vec!["old0", "new1", "", "new3"]);

        assert!(!records.set_article_chapter(9999, 0, "lost").unwrap());
    }

    #[test]
    fn test_records_summary_previews() {
        let (_dir, _sessions, records) = setup(30);
        let first = records.create_record("u1").unwrap();
        let second = records.create_record("u1").unwrap();
        records.update_outline(first.id, &"x".repeat(120)).unwrap();
        records.update_topic(first.id, &"é".repeat(60)).unwrap();

        let summary = records.get_records_summary("u1").unwrap();

        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].position, 0);
        assert_eq!(summary[0].outline_preview, format!("{}...", "x".repeat(100)));
        assert_eq!(summary[0].topic_preview, format!("{}...", "é".repeat(50)));
        assert!(summary[0].has_outline);
        assert!(!summary[0].is_current);
        assert_eq!(summary[1].id, second.id);
        assert!(summary[1].is_current);
        assert!(!summary[1].has_outline);
        assert_eq!(summary[1].outline_preview, "");
    }

    #[test]
    fn test_delete_record_shifts_positions() {
        let (_dir, _sessions, records) = setup(30);
        let first = records.create_record("u1").unwrap();
        let second = records.create_record("u1").unwrap();

        assert!(records.delete_record(first.id).unwrap());

        let summary = records.get_records_summary("u1").unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].id, second.id);
        assert_eq!(summary[0].position, 0);
    }

    #[test]
    fn test_deleting_current_record_clears_pointer() {
        let (_dir, sessions, records) = setup(30);
        let record = records.create_record("u1").unwrap();

        records.delete_record(record.id).unwrap();

        let session = sessions.get("u1").unwrap().unwrap();
        assert_eq!(session.current_record_id, None);
        assert!(records.latest_record("u1").unwrap().is_none());
    }
}
