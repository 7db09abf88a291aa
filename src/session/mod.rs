//! Session facade: the single entry point used by request handlers
//!
//! The facade resolves client contexts to canonical keys, caches session
//! views per key, and exposes ordinal record positions on top of the
//! record-id based stores. Positions are recomputed from creation order on
//! every call and shift when older records are pruned or deleted.

pub mod cache;
pub mod identity;
pub mod resolver;

pub use cache::{InProcessSessionCache, SessionCache, SessionView};
pub use identity::{IdentityReconciler, ReconcileReport};
pub use resolver::{ClientContext, SessionKey, SessionResolver};

use crate::config::Config;
use crate::error::{error_kind, ChapterflowError, ErrorKind, Result};
use crate::storage::jobs::outline_hash;
use crate::storage::records::summarize;
use crate::storage::{
    ChapterReferences, ConversationMessage, Database, GenerationJob, GenerationJobTracker,
    HistoryRecord, MessageRole, MessageSequencer, RecordStore, RecordSummary, References, Session,
    SessionStore, UserStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Counts removed by a retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_deleted: usize,
    pub jobs_deleted: usize,
}

/// Public surface over the session, record, message and job stores
pub struct SessionFacade {
    sessions: SessionStore,
    records: RecordStore,
    messages: MessageSequencer,
    jobs: GenerationJobTracker,
    users: UserStore,
    reconciler: IdentityReconciler,
    resolver: SessionResolver,
    cache: Arc<dyn SessionCache>,
    default_max_history: u32,
}

impl SessionFacade {
    /// Build a facade over `db` using the cache and retention settings in `config`
    pub fn new(db: Database, config: &Config) -> Self {
        let staleness = if config.cache.enabled {
            Duration::from_secs(config.cache.staleness_secs)
        } else {
            Duration::ZERO
        };
        let default_max_history = config.storage.default_max_history;

        Self {
            sessions: SessionStore::new(db.clone()),
            records: RecordStore::new(db.clone()),
            messages: MessageSequencer::new(db.clone()),
            jobs: GenerationJobTracker::new(db.clone())
                .with_chunk_insert_retries(config.generation.chunk_insert_retries),
            users: UserStore::new(db.clone()),
            reconciler: IdentityReconciler::new(db, default_max_history),
            resolver: SessionResolver::new(),
            cache: Arc::new(InProcessSessionCache::new(staleness)),
            default_max_history,
        }
    }

    /// Replace the session view cache
    pub fn with_cache(mut self, cache: Arc<dyn SessionCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn sequencer(&self) -> &MessageSequencer {
        &self.messages
    }

    pub fn jobs(&self) -> &GenerationJobTracker {
        &self.jobs
    }

    // --- identity ---

    /// Resolve the client's canonical key and make sure its session exists
    ///
    /// The first access under an authenticated key reconciles earlier history.
    pub fn resolve(&self, context: &mut ClientContext) -> Result<SessionKey> {
        let key = self.resolver.resolve(context);
        let existed = self.sessions.get(key.as_str())?.is_some();
        self.sessions
            .get_or_create(key.as_str(), self.default_max_history)?;

        if context.is_authenticated() && !existed {
            self.reconciler.reconcile(&key);
            self.cache.invalidate(&key);
        }
        Ok(key)
    }

    /// Switch the client to the account identified by `email`
    ///
    /// The previous anonymous token is linked to the user so its history is
    /// merged now and on any later reconciliation.
    pub fn login(&self, context: &mut ClientContext, email: &str) -> Result<SessionKey> {
        let previous = context.session_token.clone();
        let user = self.users.get_or_create_by_email(email)?;
        self.users.record_login(user.id)?;

        if let Some(previous) = previous.filter(|token| *token != user.email) {
            match self.users.link_identity(&previous, user.id) {
                Ok(_) => {}
                Err(e) if error_kind(&e) == ErrorKind::Conflict => {
                    warn!(alias_key = %previous, "Previous token belongs to another user");
                }
                Err(e) => return Err(e),
            }
            self.sessions.set_owner(&previous, user.id)?;
            self.cache.invalidate(&SessionKey::new(previous));
        }

        context.authenticated_email = Some(user.email.clone());
        let key = self.resolver.resolve(context);
        self.sessions
            .get_or_create(key.as_str(), self.default_max_history)?;
        self.reconciler.reconcile(&key);
        self.cache.invalidate(&key);

        info!(session_key = %key, user_id = user.id, "User logged in");
        Ok(key)
    }

    pub fn logout(&self, context: &mut ClientContext) {
        if let Some(token) = context.session_token.take() {
            self.cache.invalidate(&SessionKey::new(token));
        }
        context.authenticated_email = None;
    }

    // --- session views ---

    /// Get or create the session for an already-canonical key
    pub fn open(&self, key: &SessionKey) -> Result<Session> {
        self.sessions
            .get_or_create(key.as_str(), self.default_max_history)
    }

    /// Session row and records, from the cache when fresh enough
    pub fn view(&self, key: &SessionKey) -> Result<SessionView> {
        if let Some(view) = self.cache.get(key) {
            return Ok(view);
        }
        let view = self.load_view(key)?;
        self.cache.put(key, view.clone());
        Ok(view)
    }

    /// Drop the cached view so the next read goes to the database
    pub fn refresh(&self, key: &SessionKey) {
        self.cache.invalidate(key);
    }

    pub fn session(&self, key: &SessionKey) -> Result<Session> {
        Ok(self.view(key)?.session)
    }

    // --- records by position ---

    /// Append a record and make it current
    pub fn create_record(&self, key: &SessionKey) -> Result<HistoryRecord> {
        let record = self.records.create_record(key.as_str());
        self.cache.invalidate(key);
        record
    }

    pub fn list_records(&self, key: &SessionKey) -> Result<Vec<HistoryRecord>> {
        Ok(self.view(key)?.records)
    }

    pub fn get_record(&self, key: &SessionKey, position: usize) -> Result<HistoryRecord> {
        let view = self.view(key)?;
        view.record_at(position)
            .cloned()
            .ok_or_else(|| out_of_range(position, view.records.len()))
    }

    pub fn current_record(&self, key: &SessionKey) -> Result<Option<HistoryRecord>> {
        let view = self.view(key)?;
        Ok(view
            .current_position()
            .and_then(|position| view.records.get(position).cloned()))
    }

    /// Ordinal position of the current record, `None` when nothing is current
    pub fn get_current_position(&self, key: &SessionKey) -> Result<Option<usize>> {
        Ok(self.view(key)?.current_position())
    }

    /// Point the session at the record at `position`
    ///
    /// Returns `false` when another writer changed the pointer first.
    pub fn set_current_position(&self, key: &SessionKey, position: usize) -> Result<bool> {
        self.cache.invalidate(key);
        let view = self.load_view(key)?;
        let record = view
            .record_at(position)
            .ok_or_else(|| out_of_range(position, view.records.len()))?;

        let applied = self.sessions.update_current_record_if_version(
            key.as_str(),
            Some(record.id),
            view.session.lock_version,
        )?;
        self.cache.invalidate(key);
        Ok(applied)
    }

    pub fn update_outline(&self, key: &SessionKey, position: usize, outline: &str) -> Result<bool> {
        let record_id = self.record_id_at(key, position)?;
        self.mutated(key, self.records.update_outline(record_id, outline))
    }

    pub fn update_topic(&self, key: &SessionKey, position: usize, topic: &str) -> Result<bool> {
        let record_id = self.record_id_at(key, position)?;
        self.mutated(key, self.records.update_topic(record_id, topic))
    }

    pub fn update_article_chapters(
        &self,
        key: &SessionKey,
        position: usize,
        chapters: &[String],
    ) -> Result<bool> {
        let record_id = self.record_id_at(key, position)?;
        self.mutated(key, self.records.update_article_chapters(record_id, chapters))
    }

    pub fn update_references(
        &self,
        key: &SessionKey,
        position: usize,
        references: &References,
    ) -> Result<bool> {
        let record_id = self.record_id_at(key, position)?;
        self.mutated(key, self.records.update_references(record_id, references))
    }

    pub fn append_article_chapter(
        &self,
        key: &SessionKey,
        position: usize,
        chapter: &str,
    ) -> Result<bool> {
        let record_id = self.record_id_at(key, position)?;
        self.mutated(key, self.records.append_article_chapter(record_id, chapter))
    }

    /// References of one chapter; empty when the chapter has none
    pub fn chapter_references(
        &self,
        key: &SessionKey,
        position: usize,
        chapter_index: usize,
    ) -> Result<ChapterReferences> {
        let record = self.get_record(key, position)?;
        Ok(record
            .references
            .get(&chapter_index)
            .cloned()
            .unwrap_or_default())
    }

    pub fn update_chapter_references(
        &self,
        key: &SessionKey,
        position: usize,
        chapter_index: usize,
        references: ChapterReferences,
    ) -> Result<bool> {
        let record_id = self.record_id_at(key, position)?;
        self.mutated(
            key,
            self.records
                .update_chapter_references(record_id, chapter_index, references),
        )
    }

    /// Article chapters joined by blank lines
    pub fn article_text(&self, key: &SessionKey, position: usize) -> Result<String> {
        Ok(self.get_record(key, position)?.article_text())
    }

    pub fn records_summary(&self, key: &SessionKey) -> Result<Vec<RecordSummary>> {
        let view = self.view(key)?;
        Ok(summarize(&view.records, view.session.current_record_id))
    }

    // --- current-record convenience writers ---

    /// Write the outline to the current record, creating one if needed
    pub fn save_outline_to_current(&self, key: &SessionKey, outline: &str) -> Result<i64> {
        let record_id = self.current_or_new_record(key)?;
        self.mutated(key, self.records.update_outline(record_id, outline))?;
        Ok(record_id)
    }

    pub fn save_article_to_current(&self, key: &SessionKey, chapters: &[String]) -> Result<i64> {
        let record_id = self.current_or_new_record(key)?;
        self.mutated(key, self.records.update_article_chapters(record_id, chapters))?;
        Ok(record_id)
    }

    pub fn save_topic_to_current(&self, key: &SessionKey, topic: &str) -> Result<i64> {
        let record_id = self.current_or_new_record(key)?;
        self.mutated(key, self.records.update_topic(record_id, topic))?;
        Ok(record_id)
    }

    // --- conversation ---

    pub fn add_message(
        &self,
        key: &SessionKey,
        position: usize,
        role: MessageRole,
        content: &str,
        message_id: Option<&str>,
    ) -> Result<ConversationMessage> {
        let record_id = self.record_id_at(key, position)?;
        let message = self
            .messages
            .add_message(record_id, role, content, message_id);
        self.cache.invalidate(key);
        message
    }

    pub fn messages(&self, key: &SessionKey, position: usize) -> Result<Vec<ConversationMessage>> {
        let record_id = self.record_id_at(key, position)?;
        self.messages.get_messages(record_id)
    }

    // --- jobs and retention ---

    /// Create a queued job, bound to the record at `position` when given
    ///
    /// The outline is hashed so readers can later detect drift.
    pub fn create_job(
        &self,
        key: &SessionKey,
        position: Option<usize>,
        topic: Option<&str>,
        outline: Option<&str>,
    ) -> Result<GenerationJob> {
        let record_id = position
            .map(|position| self.record_id_at(key, position))
            .transpose()?;
        let hash = outline.map(outline_hash);
        self.jobs
            .create_job(key.as_str(), record_id, topic, hash.as_deref())
    }

    /// Run both retention sweeps and drop every cached view
    pub fn sweep(&self, max_sessions: u32, retention_days: u32) -> Result<SweepReport> {
        let report = SweepReport {
            jobs_deleted: self.jobs.cleanup_old_jobs(retention_days)?,
            sessions_deleted: self.sessions.cleanup_old_sessions(max_sessions)?,
        };
        self.cache.clear();
        Ok(report)
    }

    fn load_view(&self, key: &SessionKey) -> Result<SessionView> {
        let session = self
            .sessions
            .get(key.as_str())?
            .ok_or_else(|| ChapterflowError::not_found("session", key))?;
        let records = self.records.list_records(key.as_str(), None)?;
        Ok(SessionView { session, records })
    }

    fn record_id_at(&self, key: &SessionKey, position: usize) -> Result<i64> {
        let view = self.view(key)?;
        view.record_at(position)
            .map(|record| record.id)
            .ok_or_else(|| out_of_range(position, view.records.len()))
    }

    fn current_or_new_record(&self, key: &SessionKey) -> Result<i64> {
        match self.current_record(key)? {
            Some(record) => Ok(record.id),
            None => Ok(self.create_record(key)?.id),
        }
    }

    fn mutated(&self, key: &SessionKey, result: Result<bool>) -> Result<bool> {
        self.cache.invalidate(key);
        result
    }
}

fn out_of_range(position: usize, len: usize) -> anyhow::Error {
    ChapterflowError::Validation(format!(
        "position {} out of range ({} records)",
        position, len
    ))
    .into()
}
