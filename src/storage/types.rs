use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Inactive,
    Archived,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Archived => "archived",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str_opt(status: &str) -> Option<Self> {
        match status {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable identity for one visitor's ongoing work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Canonical storage key
    pub key: String,
    /// Records kept before the oldest are pruned
    pub max_history: u32,
    /// Record currently being edited
    pub current_record_id: Option<i64>,
    /// Optimistic lock version of `current_record_id`
    pub lock_version: i64,
    pub status: SessionStatus,
    /// Owning user for authenticated sessions
    pub owner_user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Session row plus the number of records it holds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub key: String,
    pub status: SessionStatus,
    pub max_history: u32,
    pub current_record_id: Option<i64>,
    pub record_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One cited source inside a chapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

/// Reference id → reference, for one chapter
pub type ChapterReferences = BTreeMap<String, Reference>;

/// Chapter index → that chapter's references
pub type References = BTreeMap<usize, ChapterReferences>;

/// One outline/article/reference snapshot within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub session_key: String,
    pub topic: Option<String>,
    pub outline: Option<String>,
    /// Article text, one entry per chapter
    pub article_chapters: Vec<String>,
    pub references: References,
    /// Order the next conversation message will receive
    pub next_message_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// All chapters joined by blank lines
    pub fn article_text(&self) -> String {
        self.article_chapters.join("\n\n")
    }
}

/// Listing entry for one record, with its recomputed ordinal position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: i64,
    /// Rank among the session's records by creation time; not stable across pruning
    pub position: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub has_outline: bool,
    pub has_article: bool,
    pub has_topic: bool,
    pub article_count: usize,
    pub outline_preview: String,
    pub topic_preview: String,
    pub is_current: bool,
}

/// Author of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str_opt(role: &str) -> Option<Self> {
        match role {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// A message in a record's conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: i64,
    pub record_id: i64,
    /// Caller-supplied identifier, unique across all records
    pub message_id: String,
    /// 1-based, contiguous within the record
    pub message_order: i64,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Status of a generation job
///
/// `Queued → Running → {Succeeded | Failed | Canceled}`; terminal states
/// have no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 3] = [Self::Succeeded, Self::Failed, Self::Canceled];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str_opt(status: &str) -> Option<Self> {
        match status {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Whether a job currently in `self` may move to `next`
    ///
    /// Only terminal states are final; any other status may be overwritten.
    pub fn can_transition_to(self, _next: JobStatus) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A streaming content-generation task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    pub session_key: String,
    pub record_id: Option<i64>,
    pub status: JobStatus,
    pub topic: Option<String>,
    /// Hash of the outline the job was started from
    pub outline_snapshot_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only when the job reaches a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

/// One ordered output fragment of a generation job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationChunk {
    pub id: i64,
    pub job_id: String,
    /// Strictly increasing per job, starting at 1
    pub seq: i64,
    pub chapter_index: Option<usize>,
    pub content: String,
    pub is_final_chunk: bool,
    pub created_at: DateTime<Utc>,
}

/// Job counts per status for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total_jobs: usize,
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
}

/// An authenticated account that sessions can be re-keyed to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    /// When the one-time identity backfill ran for this user
    pub backfilled_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip_and_terminal() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::from_str_opt(status.as_str()), Some(status));
        }
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert_eq!(JobStatus::from_str_opt("done"), None);
    }

    #[test]
    fn test_job_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Succeeded));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Canceled.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn test_references_serialize_with_string_chapter_keys() {
        let mut chapter = ChapterReferences::new();
        chapter.insert(
            "1".to_string(),
            Reference {
                content: "snippet".to_string(),
                title: "Title".to_string(),
                url: "https://example.com".to_string(),
            },
        );
        let mut refs = References::new();
        refs.insert(2, chapter);

        let json = serde_json::to_string(&refs).unwrap();
        assert!(json.starts_with("{\"2\":"));
        let back: References = serde_json::from_str(&json).unwrap();
        assert_eq!(back, refs);
    }

    #[test]
    fn test_article_text_joins_chapters() {
        let now = Utc::now();
        let record = HistoryRecord {
            id: 1,
            session_key: "u1".to_string(),
            topic: None,
            outline: None,
            article_chapters: vec!["One".to_string(), "Two".to_string()],
            references: References::new(),
            next_message_order: 1,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(record.article_text(), "One\n\nTwo");
    }
}
