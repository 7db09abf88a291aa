//! Process-local cache of loaded session views
//!
//! Entries are not kept consistent with the database. A write made by
//! another process becomes visible once the entry expires after the
//! staleness window or is invalidated explicitly.

use super::resolver::SessionKey;
use crate::storage::{HistoryRecord, Session};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// A session row together with its records in creation order
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session: Session,
    pub records: Vec<HistoryRecord>,
}

impl SessionView {
    /// Ordinal position of the current record, if any
    pub fn current_position(&self) -> Option<usize> {
        let current = self.session.current_record_id?;
        self.records.iter().position(|record| record.id == current)
    }

    pub fn record_at(&self, position: usize) -> Option<&HistoryRecord> {
        self.records.get(position)
    }
}

/// Cache interface used by the session facade
pub trait SessionCache: Send + Sync {
    /// Cached view, if present and younger than the staleness window
    fn get(&self, key: &SessionKey) -> Option<SessionView>;

    fn put(&self, key: &SessionKey, view: SessionView);

    fn invalidate(&self, key: &SessionKey);

    fn clear(&self);

    /// Maximum age of an entry before it is reloaded
    fn staleness(&self) -> Duration;
}

/// Default [`SessionCache`]: a lock-protected map with time-based expiry
#[derive(Debug)]
pub struct InProcessSessionCache {
    entries: RwLock<HashMap<SessionKey, (SessionView, Instant)>>,
    staleness: Duration,
}

impl InProcessSessionCache {
    pub fn new(staleness: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            staleness,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionCache for InProcessSessionCache {
    fn get(&self, key: &SessionKey) -> Option<SessionView> {
        {
            let entries = self.entries.read().ok()?;
            let (view, cached_at) = entries.get(key)?;
            if cached_at.elapsed() < self.staleness {
                tracing::trace!(session_key = %key, "Session cache hit");
                return Some(view.clone());
            }
        }

        // Expired: drop it so idle keys do not accumulate
        if let Ok(mut entries) = self.entries.write() {
            let expired = entries
                .get(key)
                .is_some_and(|(_, cached_at)| cached_at.elapsed() >= self.staleness);
            if expired {
                entries.remove(key);
            }
        }
        None
    }

    fn put(&self, key: &SessionKey, view: SessionView) {
        if self.staleness.is_zero() {
            return;
        }
        if let Ok(mut entries) = self.entries.write() {
            let staleness = self.staleness;
            entries.retain(|_, (_, cached_at)| cached_at.elapsed() < staleness);
            entries.insert(key.clone(), (view, Instant::now()));
        }
    }

    fn invalidate(&self, key: &SessionKey) {
        if let Ok(mut entries) = self.entries.write() {
            if entries.remove(key).is_some() {
                tracing::debug!(session_key = %key, "Session cache entry invalidated");
            }
        }
    }

    fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    fn staleness(&self) -> Duration {
        self.staleness
    }
}
