//! Generation job lifecycle and ordered chunk storage
//!
//! A job moves `queued → running → {succeeded | failed | canceled}`.
//! Chunks receive `seq = max(seq) + 1`; the `UNIQUE (job_id, seq)` index
//! detects two writers that computed the same number, and the loser retries
//! with a fresh sequence.

use super::types::{GenerationChunk, GenerationJob, JobStatistics, JobStatus};
use super::{
    enum_column, format_timestamp, now_timestamp, now_utc, optional_timestamp_column,
    timestamp_column, Database,
};
use crate::error::{is_unique_violation, ChapterflowError, Result};
use chrono::Duration;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Default number of attempts for a chunk insert that loses a sequence race
pub const DEFAULT_CHUNK_INSERT_RETRIES: u32 = 3;

const JOB_COLUMNS: &str = "id, session_key, record_id, status, topic, outline_snapshot_hash, \
     created_at, updated_at, completed_at";

const CHUNK_COLUMNS: &str = "id, job_id, seq, chapter_index, content, is_final_chunk, created_at";

/// SHA-256 hex digest of an outline, stored on jobs to detect drift
pub fn outline_hash(outline: &str) -> String {
    let digest = Sha256::digest(outline.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Tracks generation jobs and their streamed chunks
#[derive(Debug, Clone)]
pub struct GenerationJobTracker {
    db: Database,
    chunk_insert_retries: u32,
}

impl GenerationJobTracker {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            chunk_insert_retries: DEFAULT_CHUNK_INSERT_RETRIES,
        }
    }

    pub fn with_chunk_insert_retries(mut self, retries: u32) -> Self {
        self.chunk_insert_retries = retries.max(1);
        self
    }

    /// Create a queued job with a generated id
    pub fn create_job(
        &self,
        session_key: &str,
        record_id: Option<i64>,
        topic: Option<&str>,
        outline_snapshot_hash: Option<&str>,
    ) -> Result<GenerationJob> {
        let job_id = uuid::Uuid::new_v4().to_string();
        self.create_job_with_id(&job_id, session_key, record_id, topic, outline_snapshot_hash)
    }

    /// Create a queued job under a caller-supplied id
    pub fn create_job_with_id(
        &self,
        job_id: &str,
        session_key: &str,
        record_id: Option<i64>,
        topic: Option<&str>,
        outline_snapshot_hash: Option<&str>,
    ) -> Result<GenerationJob> {
        let conn = self.db.connection()?;

        let session_exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sessions WHERE key = ?1",
                params![session_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to look up session"))?;
        if session_exists.is_none() {
            return Err(ChapterflowError::not_found("session", session_key).into());
        }

        if let Some(record_id) = record_id {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT session_key FROM history_records WHERE id = ?1",
                    params![record_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to look up record"))?;
            if owner.as_deref() != Some(session_key) {
                return Err(ChapterflowError::Validation(format!(
                    "record {} does not belong to session {}",
                    record_id, session_key
                ))
                .into());
            }
        }

        let now = now_timestamp();
        conn.execute(
            "INSERT INTO generation_jobs
                (id, session_key, record_id, status, topic, outline_snapshot_hash,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6, ?6)",
            params![job_id, session_key, record_id, topic, outline_snapshot_hash, now],
        )
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to create generation job"))?;

        info!(job_id, session_key, record_id, "Created generation job");
        load_job(&conn, job_id)?.ok_or_else(|| ChapterflowError::not_found("job", job_id).into())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<GenerationJob>> {
        let conn = self.db.connection()?;
        load_job(&conn, job_id)
    }

    /// Jobs of a session, newest first
    pub fn get_session_jobs(
        &self,
        session_key: &str,
        status: Option<JobStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<GenerationJob>> {
        let conn = self.db.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM generation_jobs
                 WHERE session_key = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, id
                 LIMIT ?3",
                JOB_COLUMNS
            ))
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to prepare job listing"))?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt
            .query_map(
                params![session_key, status.map(JobStatus::as_str), limit],
                job_from_row,
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to list jobs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read job row").into())
    }

    /// Move a job to `status`, optionally binding it to a record
    ///
    /// Returns `false` if the job does not exist. Transitions out of a
    /// terminal status are rejected with a Conflict and leave the row
    /// untouched; non-terminal statuses are simply overwritten. `completed_at` is written on the
    /// transition into a terminal status.
    pub fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        record_id: Option<i64>,
    ) -> Result<bool> {
        let mut conn = self.db.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to start transaction"))?;

        let current: Option<JobStatus> = tx
            .query_row(
                "SELECT status FROM generation_jobs WHERE id = ?1",
                params![job_id],
                |row| enum_column(row, 0, JobStatus::from_str_opt),
            )
            .optional()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read job status"))?;
        let Some(current) = current else {
            return Ok(false);
        };

        if !current.can_transition_to(status) {
            warn!(job_id, from = %current, to = %status, "Rejected job status transition");
            return Err(ChapterflowError::Conflict(format!(
                "job {} cannot move from {} to {}",
                job_id, current, status
            ))
            .into());
        }

        let now = now_timestamp();
        let completed_at = status.is_terminal().then(|| now.clone());
        tx.execute(
            "UPDATE generation_jobs
             SET status = ?1,
                 updated_at = ?2,
                 completed_at = COALESCE(?3, completed_at),
                 record_id = COALESCE(?4, record_id)
             WHERE id = ?5",
            params![status.as_str(), now, completed_at, record_id, job_id],
        )
        .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to update job status"))?;
        tx.commit()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to commit job status"))?;

        info!(job_id, status = %status, "Updated generation job status");
        Ok(true)
    }

    /// Mark a job canceled
    ///
    /// Only the status flag changes; work already in flight is not interrupted.
    /// Returns `false` when the job is missing or already finished.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        match self.get_job(job_id)? {
            Some(job) if !job.status.is_terminal() => {
                self.update_status(job_id, JobStatus::Canceled, None)
            }
            _ => Ok(false),
        }
    }

    /// Append a chunk with the next sequence number
    pub fn add_chunk(
        &self,
        job_id: &str,
        content: &str,
        chapter_index: Option<usize>,
        is_final_chunk: bool,
    ) -> Result<GenerationChunk> {
        let conn = self.db.connection()?;
        if load_job(&conn, job_id)?.is_none() {
            return Err(ChapterflowError::not_found("job", job_id).into());
        }

        let chapter = chapter_index.map(|c| c as i64);
        for attempt in 1..=self.chunk_insert_retries {
            let seq = next_seq(&conn, job_id)?;
            let created_at = now_utc();
            match conn.execute(
                "INSERT INTO generation_chunks
                    (job_id, seq, chapter_index, content, is_final_chunk, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    job_id,
                    seq,
                    chapter,
                    content,
                    is_final_chunk,
                    format_timestamp(created_at)
                ],
            ) {
                Ok(_) => {
                    debug!(job_id, seq, is_final_chunk, "Added generation chunk");
                    return Ok(GenerationChunk {
                        id: conn.last_insert_rowid(),
                        job_id: job_id.to_string(),
                        seq,
                        chapter_index,
                        content: content.to_string(),
                        is_final_chunk,
                        created_at,
                    });
                }
                Err(e) if is_unique_violation(&e) => {
                    warn!(job_id, seq, attempt, "Chunk sequence taken by another writer");
                }
                Err(e) => {
                    return Err(ChapterflowError::from_sqlite(e, "Failed to add chunk").into())
                }
            }
        }

        Err(ChapterflowError::Conflict(format!(
            "could not allocate a chunk sequence for job {} after {} attempts",
            job_id, self.chunk_insert_retries
        ))
        .into())
    }

    /// Chunks of a job in `seq` order, optionally for one chapter only
    pub fn get_job_chunks(
        &self,
        job_id: &str,
        chapter_index: Option<usize>,
    ) -> Result<Vec<GenerationChunk>> {
        self.query_chunks(
            &format!(
                "SELECT {} FROM generation_chunks
                 WHERE job_id = ?1 AND (?2 IS NULL OR chapter_index = ?2)
                 ORDER BY seq",
                CHUNK_COLUMNS
            ),
            params![job_id, chapter_index.map(|c| c as i64)],
        )
    }

    /// Chunks with `seq > after_seq`, for readers resuming a stream
    pub fn get_chunks_since(&self, job_id: &str, after_seq: i64) -> Result<Vec<GenerationChunk>> {
        self.query_chunks(
            &format!(
                "SELECT {} FROM generation_chunks
                 WHERE job_id = ?1 AND seq > ?2
                 ORDER BY seq",
                CHUNK_COLUMNS
            ),
            params![job_id, after_seq],
        )
    }

    /// All chunk contents concatenated in `seq` order
    pub fn get_job_content(&self, job_id: &str) -> Result<String> {
        Ok(self
            .get_job_chunks(job_id, None)?
            .into_iter()
            .map(|chunk| chunk.content)
            .collect())
    }

    /// Chunk contents concatenated per chapter; chunks without a chapter count as chapter 0
    pub fn get_job_content_by_chapter(&self, job_id: &str) -> Result<BTreeMap<usize, String>> {
        let mut by_chapter: BTreeMap<usize, String> = BTreeMap::new();
        for chunk in self.get_job_chunks(job_id, None)? {
            by_chapter
                .entry(chunk.chapter_index.unwrap_or(0))
                .or_default()
                .push_str(&chunk.content);
        }
        Ok(by_chapter)
    }

    /// Whether the job reached a terminal status; missing jobs are not completed
    pub fn is_job_completed(&self, job_id: &str) -> Result<bool> {
        Ok(self
            .get_job(job_id)?
            .map(|job| job.status.is_terminal())
            .unwrap_or(false))
    }

    pub fn has_final_chunk(&self, job_id: &str) -> Result<bool> {
        let conn = self.db.connection()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM generation_chunks WHERE job_id = ?1 AND is_final_chunk = 1 LIMIT 1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to look up final chunk"))?;
        Ok(found.is_some())
    }

    /// Whether `current_outline` differs from the outline the job started from
    ///
    /// Jobs created without a snapshot hash never report drift.
    pub fn outline_changed(&self, job_id: &str, current_outline: &str) -> Result<bool> {
        let job = self
            .get_job(job_id)?
            .ok_or_else(|| ChapterflowError::not_found("job", job_id))?;
        Ok(job
            .outline_snapshot_hash
            .map(|hash| hash != outline_hash(current_outline))
            .unwrap_or(false))
    }

    /// Delete terminal jobs that completed more than `retention_days` ago
    pub fn cleanup_old_jobs(&self, retention_days: u32) -> Result<usize> {
        let conn = self.db.connection()?;
        let cutoff = format_timestamp(now_utc() - Duration::days(i64::from(retention_days)));
        let deleted = conn
            .execute(
                "DELETE FROM generation_jobs
                 WHERE status IN ('succeeded', 'failed', 'canceled')
                   AND completed_at IS NOT NULL
                   AND completed_at < ?1",
                params![cutoff],
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to clean up jobs"))?;
        if deleted > 0 {
            info!(deleted, retention_days, "Cleaned up expired generation jobs");
        }
        Ok(deleted)
    }

    /// Job counts per status for a session
    pub fn get_job_statistics(&self, session_key: &str) -> Result<JobStatistics> {
        let conn = self.db.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*) FROM generation_jobs
                 WHERE session_key = ?1
                 GROUP BY status",
            )
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to prepare job statistics"))?;
        let rows = stmt
            .query_map(params![session_key], |row| {
                Ok((
                    enum_column(row, 0, JobStatus::from_str_opt)?,
                    row.get::<_, i64>(1)?,
                ))
            })
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to compute job statistics"))?;

        let mut stats = JobStatistics::default();
        for row in rows {
            let (status, count) =
                row.map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read job statistics"))?;
            let count = count as usize;
            stats.total_jobs += count;
            match status {
                JobStatus::Queued => stats.queued = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Succeeded => stats.succeeded = count,
                JobStatus::Failed => stats.failed = count,
                JobStatus::Canceled => stats.canceled = count,
            }
        }
        Ok(stats)
    }

    fn query_chunks(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<GenerationChunk>> {
        let conn = self.db.connection()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to prepare chunk query"))?;
        let rows = stmt
            .query_map(params, chunk_from_row)
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to load chunks"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to read chunk row").into())
    }
}

fn next_seq(conn: &Connection, job_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM generation_chunks WHERE job_id = ?1",
        params![job_id],
        |row| row.get(0),
    )
    .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to compute chunk sequence").into())
}

fn load_job(conn: &Connection, job_id: &str) -> Result<Option<GenerationJob>> {
    conn.query_row(
        &format!("SELECT {} FROM generation_jobs WHERE id = ?1", JOB_COLUMNS),
        params![job_id],
        job_from_row,
    )
    .optional()
    .map_err(|e| ChapterflowError::from_sqlite(e, "Failed to load job").into())
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<GenerationJob> {
    Ok(GenerationJob {
        id: row.get(0)?,
        session_key: row.get(1)?,
        record_id: row.get(2)?,
        status: enum_column(row, 3, JobStatus::from_str_opt)?,
        topic: row.get(4)?,
        outline_snapshot_hash: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        updated_at: timestamp_column(row, 7)?,
        completed_at: optional_timestamp_column(row, 8)?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<GenerationChunk> {
    let chapter_index: Option<i64> = row.get(3)?;
    Ok(GenerationChunk {
        id: row.get(0)?,
        job_id: row.get(1)?,
        seq: row.get(2)?,
        chapter_index: chapter_index.map(|c| c as usize),
        content: row.get(4)?,
        is_final_chunk: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
    })
}
