//! Merging anonymous history into an authenticated identity
//!
//! Aliases recorded in `identity_links` are merged every time. The
//! string-matching heuristics (owner links, key substrings, orphaned records)
//! run once per user as a backfill and are then marked done on the user row.

use super::resolver::SessionKey;
use crate::error::{error_kind, ChapterflowError, ErrorKind, Result};
use crate::storage::{now_timestamp, Database, User, UserStore};
use rusqlite::{params, Connection, TransactionBehavior};
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

/// Outcome of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Keys whose records were moved to the canonical key
    pub merged_keys: Vec<String>,
    /// Number of records re-keyed
    pub records_moved: usize,
    /// Records deleted to bring the canonical session back to `max_history`
    pub records_pruned: usize,
    /// Whether the one-time backfill ran in this pass
    pub backfilled: bool,
}

/// Re-keys history created under other keys to a canonical identity
#[derive(Debug, Clone)]
pub struct IdentityReconciler {
    db: Database,
    users: UserStore,
    default_max_history: u32,
}

impl IdentityReconciler {
    pub fn new(db: Database, default_max_history: u32) -> Self {
        let users = UserStore::new(db.clone());
        Self {
            db,
            users,
            default_max_history,
        }
    }

    /// Merge everything that belongs to `canonical` into it
    ///
    /// Never fails: errors are logged and an empty report is returned, so
    /// session access continues unaffected.
    pub fn reconcile(&self, canonical: &SessionKey) -> ReconcileReport {
        match self.try_reconcile(canonical) {
            Ok(report) => report,
            Err(e) => {
                error!(
                    session_key = %canonical,
                    kind = ?error_kind(&e),
                    error = %e,
                    "Identity reconciliation failed"
                );
                ReconcileReport::default()
            }
        }
    }

    fn try_reconcile(&self, canonical: &SessionKey) -> Result<ReconcileReport> {
        let Some(user) = self.users.get_by_email(canonical.as_str())? else {
            debug!(session_key = %canonical, "No user for key, nothing to reconcile");
            return Ok(ReconcileReport::default());
        };

        let mut candidates: BTreeSet<String> = self
            .users
            .linked_aliases(user.id)?
            .into_iter()
            .collect();

        let backfilled = user.backfilled_at.is_none();
        if backfilled {
            let conn = self.db.connection()?;
            for key in backfill_candidates(&conn, &user, canonical.as_str())? {
                match self.users.link_identity(&key, user.id) {
                    Ok(_) => {
                        candidates.insert(key);
                    }
                    Err(e) if error_kind(&e) == ErrorKind::Conflict => {
                        warn!(alias_key = %key, "Skipping alias claimed by another user");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        candidates.remove(canonical.as_str());

        let mut report = ReconcileReport {
            backfilled,
            ..Default::default()
        };
        if !candidates.is_empty() {
            let (merged_keys, moved, pruned) = self.merge_into(canonical.as_str(), &candidates)?;
            report.merged_keys = merged_keys;
            report.records_moved = moved;
            report.records_pruned = pruned;
        }

        if backfilled {
            self.users.mark_backfilled(user.id)?;
        }

        if report.records_moved > 0 {
            info!(
                session_key = %canonical,
                records = report.records_moved,
                pruned = report.records_pruned,
                keys = report.merged_keys.len(),
                "Merged history into canonical identity"
            );
        }
        Ok(report)
    }

    fn merge_into(
        &self,
        canonical: &str,
        aliases: &BTreeSet<String>,
    ) -> Result<(Vec<String>, usize, usize)> {
        let mut conn = self.db.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to start identity merge"))?;
        let now = now_timestamp();

        tx.execute(
            "INSERT OR IGNORE INTO sessions
                (key, max_history, status, lock_version, created_at, updated_at)
             VALUES (?1, ?2, 'active', 0, ?3, ?3)",
            params![canonical, self.default_max_history, now],
        )
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to create canonical session"))?;

        let mut merged = Vec::new();
        let mut moved = 0;
        for alias in aliases {
            let records = tx
                .execute(
                    "UPDATE history_records SET session_key = ?1 WHERE session_key = ?2",
                    params![canonical, alias],
                )
                .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to re-key records"))?;
            tx.execute(
                "UPDATE generation_jobs SET session_key = ?1 WHERE session_key = ?2",
                params![canonical, alias],
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to re-key jobs"))?;
            let sessions = tx
                .execute("DELETE FROM sessions WHERE key = ?1", params![alias])
                .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to delete alias session"))?;
            if records > 0 || sessions > 0 {
                debug!(alias_key = %alias, records, "Re-keyed alias");
                merged.push(alias.clone());
                moved += records;
            }
        }

        let mut pruned = 0;
        if moved > 0 {
            // Same retention rule as record creation: newest max_history survive
            pruned = tx
                .execute(
                    "DELETE FROM history_records WHERE id IN (
                        SELECT id FROM history_records
                        WHERE session_key = ?1
                        ORDER BY created_at DESC, id DESC
                        LIMIT -1 OFFSET (SELECT max_history FROM sessions WHERE key = ?1)
                     )",
                    params![canonical],
                )
                .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to prune merged records"))?;

            tx.execute(
                "UPDATE sessions
                 SET current_record_id = (
                        SELECT id FROM history_records
                        WHERE session_key = ?1
                        ORDER BY created_at DESC, id DESC
                        LIMIT 1
                     ),
                     lock_version = lock_version + 1,
                     updated_at = ?2
                 WHERE key = ?1 AND current_record_id IS NULL",
                params![canonical, now],
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to point canonical session"))?;
        }

        tx.commit()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to commit identity merge"))?;
        Ok((merged, moved, pruned))
    }
}

/// Keys found by the one-time heuristics: owner links, keys containing the
/// canonical key, and orphaned record keys containing the email's local part
fn backfill_candidates(conn: &Connection, user: &User, canonical: &str) -> Result<Vec<String>> {
    let mut keys = BTreeSet::new();
    let lookup = |e| ChapterflowError::from_sqlite(e, "Failed to scan backfill candidates");

    collect_keys(
        conn,
        "SELECT key FROM sessions WHERE owner_user_id = ?1",
        params![user.id],
        &mut keys,
    )
    .map_err(lookup)?;

    collect_keys(
        conn,
        "SELECT key FROM sessions WHERE instr(key, ?1) > 0
         UNION
         SELECT DISTINCT session_key FROM history_records WHERE instr(session_key, ?1) > 0",
        params![canonical],
        &mut keys,
    )
    .map_err(lookup)?;

    let local_part = canonical.split('@').next().unwrap_or_default();
    if !local_part.is_empty() {
        collect_keys(
            conn,
            "SELECT DISTINCT r.session_key FROM history_records r
             LEFT JOIN sessions s ON s.key = r.session_key
             WHERE s.key IS NULL AND instr(r.session_key, ?1) > 0",
            params![local_part],
            &mut keys,
        )
        .map_err(lookup)?;
    }

    keys.remove(canonical);
    Ok(keys.into_iter().collect())
}

fn collect_keys(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
    keys: &mut BTreeSet<String>,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    for key in stmt.query_map(args, |row| row.get::<_, String>(0))? {
        keys.insert(key?);
    }
    Ok(())
}
