//! Gap-free ordering of conversation messages within a record

use super::types::{ConversationMessage, MessageRole};
use super::{enum_column, format_timestamp, now_utc, timestamp_column, Database};
use crate::error::{is_unique_violation, ChapterflowError, Result};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::{info, warn};

/// Allocates `message_order` values under the record's write lock
#[derive(Debug, Clone)]
pub struct MessageSequencer {
    db: Database,
}

impl MessageSequencer {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message to a record's conversation
    ///
    /// The order counter is read and advanced inside a `BEGIN IMMEDIATE`
    /// transaction, so concurrent callers on the same record are serialized
    /// and receive contiguous orders starting at 1. A `message_id` that was
    /// already used is a Conflict and consumes no order. When `message_id` is
    /// `None` a UUID v4 is generated.
    pub fn add_message(
        &self,
        record_id: i64,
        role: MessageRole,
        content: &str,
        message_id: Option<&str>,
    ) -> Result<ConversationMessage> {
        let message_id = message_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut conn = self.db.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to lock record"))?;

        let order: i64 = tx
            .query_row(
                "SELECT next_message_order FROM history_records WHERE id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read message order"))?
            .ok_or_else(|| ChapterflowError::not_found("record", record_id))?;

        let created_at = now_utc();
        let now = format_timestamp(created_at);
        tx.execute(
            "UPDATE history_records SET next_message_order = ?1, updated_at = ?2 WHERE id = ?3",
            params![order + 1, now, record_id],
        )
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to advance message order"))?;

        match tx.execute(
            "INSERT INTO conversation_messages
                (record_id, message_id, message_order, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![record_id, message_id, order, role.as_str(), content, now],
        ) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                warn!(record_id, message_id = %message_id, "Duplicate message rejected");
                return Err(ChapterflowError::Conflict(format!(
                    "message {} already recorded",
                    message_id
                ))
                .into());
            }
            Err(e) => return Err(ChapterflowError::from_sqlite(e, "Failed to insert message").into()),
        }
        let id = tx.last_insert_rowid();

        tx.commit()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to commit message"))?;

        info!(record_id, message_order = order, role = role.as_str(), "Added message");
        Ok(ConversationMessage {
            id,
            record_id,
            message_id,
            message_order: order,
            role,
            content: content.to_string(),
            created_at,
        })
    }

    /// Messages of a record in `message_order`
    pub fn get_messages(&self, record_id: i64) -> Result<Vec<ConversationMessage>> {
        let conn = self.db.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, record_id, message_id, message_order, role, content, created_at
                 FROM conversation_messages
                 WHERE record_id = ?1
                 ORDER BY message_order ASC",
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to prepare message query"))?;
        let rows = stmt
            .query_map(params![record_id], message_from_row)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to load messages"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read message row").into())
    }

    pub fn count_messages(&self, record_id: i64) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversation_messages WHERE record_id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to count messages"))?;
        Ok(count as usize)
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationMessage> {
    Ok(ConversationMessage {
        id: row.get(0)?,
        record_id: row.get(1)?,
        message_id: row.get(2)?,
        message_order: row.get(3)?,
        role: enum_column(row, 4, MessageRole::from_str_opt)?,
        content: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::{RecordStore, SessionStore};
    use crate::test_utils::{assert_error_kind, temp_database};

    fn setup() -> (tempfile::TempDir, RecordStore, MessageSequencer, i64) {
        let (dir, db) = temp_database();
        SessionStore::new(db.clone()).get_or_create("u1", 30).unwrap();
        let records = RecordStore::new(db.clone());
        let record = records.create_record("u1").unwrap();
        (dir, records, MessageSequencer::new(db), record.id)
    }

    #[test]
    fn test_orders_start_at_one() {
        let (_dir, records, messages, record_id) = setup();

        let first = messages
            .add_message(record_id, MessageRole::User, "hi", Some("m-1"))
            .unwrap();
        let second = messages
            .add_message(record_id, MessageRole::Assistant, "hello", None)
            .unwrap();

        assert_eq!(first.message_order, 1);
        assert_eq!(second.message_order, 2);
        assert_eq!(second.message_id.len(), 36);
        let record = records.get_record(record_id).unwrap().unwrap();
        assert_eq!(record.next_message_order, 3);

        let listed = messages.get_messages(record_id).unwrap();
        assert_eq!(listed, vec![first, second]);
    }

    #[test]
    fn test_duplicate_message_id_is_conflict() {
        let (_dir, records, messages, record_id) = setup();
        messages
            .add_message(record_id, MessageRole::User, "first", Some("dup"))
            .unwrap();

        assert_error_kind(
            messages.add_message(record_id, MessageRole::User, "second", Some("dup")),
            ErrorKind::Conflict,
        );

        assert_eq!(messages.count_messages(record_id).unwrap(), 1);
        let record = records.get_record(record_id).unwrap().unwrap();
        assert_eq!(record.next_message_order, 2);
    }

    #[test]
    fn test_missing_record_is_not_found() {
        let (_dir, _records, messages, _record_id) = setup();
        assert_error_kind(
            messages.add_message(4242, MessageRole::User, "x", None),
            ErrorKind::NotFound,
        );
    }

    #[test]
    fn test_orders_are_per_record() {
        let (_dir, records, messages, first_record) = setup();
        let second_record = records.create_record("u1").unwrap().id;

        messages
            .add_message(first_record, MessageRole::User, "a", None)
            .unwrap();
        let other = messages
            .add_message(second_record, MessageRole::User, "b", None)
            .unwrap();

        assert_eq!(other.message_order, 1);
    }
}
