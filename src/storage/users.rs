//! Authenticated users and the alias keys linked to them

use super::types::User;
use super::{now_timestamp, optional_timestamp_column, timestamp_column, Database};
use crate::error::{is_unique_violation, ChapterflowError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

const USER_COLUMNS: &str = "id, email, created_at, last_login_at, backfilled_at";

/// Canonical form of an email used as a session key
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct UserStore {
    db: Database,
}

impl UserStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get_or_create_by_email(&self, email: &str) -> Result<User> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(ChapterflowError::Validation("email must not be empty".into()).into());
        }

        let conn = self.db.connection()?;
        if let Some(user) = load_by_email(&conn, &email)? {
            return Ok(user);
        }

        match conn.execute(
            "INSERT INTO users (email, created_at) VALUES (?1, ?2)",
            params![email, now_timestamp()],
        ) {
            Ok(_) => info!(email = %email, "Created user"),
            Err(e) if is_unique_violation(&e) => debug!(email = %email, "User created concurrently"),
            Err(e) => return Err(ChapterflowError::from_sqlite(e, "Failed to create user").into()),
        }

        load_by_email(&conn, &email)?.ok_or_else(|| ChapterflowError::not_found("user", email).into())
    }

    pub fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.db.connection()?;
        load_by_email(&conn, &normalize_email(email))
    }

    pub fn record_login(&self, user_id: i64) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn
            .execute(
                "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
                params![now_timestamp(), user_id],
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to record login"))?;
        Ok(changed > 0)
    }

    /// Link `alias_key` to the user
    ///
    /// Returns `true` when a new link was written and `false` when the alias
    /// was already linked to this user. An alias owned by another user is a
    /// Conflict.
    pub fn link_identity(&self, alias_key: &str, user_id: i64) -> Result<bool> {
        let conn = self.db.connection()?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT user_id FROM identity_links WHERE alias_key = ?1",
                params![alias_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read identity link"))?;

        match existing {
            Some(owner) if owner == user_id => Ok(false),
            Some(owner) => {
                warn!(alias_key, owner, user_id, "Alias already linked to another user");
                Err(ChapterflowError::Conflict(format!(
                    "alias {} is linked to another user",
                    alias_key
                ))
                .into())
            }
            None => {
                conn.execute(
                    "INSERT INTO identity_links (alias_key, user_id, linked_at) VALUES (?1, ?2, ?3)",
                    params![alias_key, user_id, now_timestamp()],
                )
                .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to link identity"))?;
                info!(alias_key, user_id, "Linked identity");
                Ok(true)
            }
        }
    }

    /// Alias keys linked to a user, oldest link first
    pub fn linked_aliases(&self, user_id: i64) -> Result<Vec<String>> {
        let conn = self.db.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT alias_key FROM identity_links
                 WHERE user_id = ?1
                 ORDER BY linked_at, alias_key",
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to prepare alias query"))?;
        let rows = stmt
            .query_map(params![user_id], |row| row.get(0))
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to list aliases"))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read alias row").into())
    }

    pub fn mark_backfilled(&self, user_id: i64) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn
            .execute(
                "UPDATE users SET backfilled_at = ?1 WHERE id = ?2",
                params![now_timestamp(), user_id],
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to mark backfill"))?;
        Ok(changed > 0)
    }
}

fn load_by_email(conn: &Connection, email: &str) -> Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
        params![email],
        user_from_row,
    )
    .optional()
    .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to load user").into())
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        created_at: timestamp_column(row, 2)?,
        last_login_at: optional_timestamp_column(row, 3)?,
        backfilled_at: optional_timestamp_column(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::{assert_error_kind, temp_database};

    #[test]
    fn test_get_or_create_normalizes_email() {
        let (_dir, db) = temp_database();
        let users = UserStore::new(db);

        let created = users.get_or_create_by_email("  Alice@Example.COM ").unwrap();
        let again = users.get_or_create_by_email("alice@example.com").unwrap();

        assert_eq!(created.email, "alice@example.com");
        assert_eq!(created.id, again.id);
        assert_eq!(created.last_login_at, None);
        assert_eq!(users.get_by_email("ALICE@example.com").unwrap(), Some(created));
    }

    #[test]
    fn test_login_and_backfill_markers() {
        let (_dir, db) = temp_database();
        let users = UserStore::new(db);
        let user = users.get_or_create_by_email("bob@example.com").unwrap();

        assert!(users.record_login(user.id).unwrap());
        assert!(users.mark_backfilled(user.id).unwrap());
        assert!(!users.record_login(9999).unwrap());

        let user = users.get_by_email("bob@example.com").unwrap().unwrap();
        assert!(user.last_login_at.is_some());
        assert!(user.backfilled_at.is_some());
    }

    #[test]
    fn test_link_identity() {
        let (_dir, db) = temp_database();
        let users = UserStore::new(db);
        let alice = users.get_or_create_by_email("alice@example.com").unwrap();
        let bob = users.get_or_create_by_email("bob@example.com").unwrap();

        assert!(users.link_identity("anon-1", alice.id).unwrap());
        assert!(!users.link_identity("anon-1", alice.id).unwrap());
        assert_error_kind(users.link_identity("anon-1", bob.id), ErrorKind::Conflict);

        assert_eq!(users.linked_aliases(alice.id).unwrap(), vec!["anon-1"]);
        assert!(users.linked_aliases(bob.id).unwrap().is_empty());
    }

    #[test]
    fn test_empty_email_rejected() {
        let (_dir, db) = temp_database();
        let users = UserStore::new(db);
        assert_error_kind(users.get_or_create_by_email("   "), ErrorKind::Validation);
    }
}
