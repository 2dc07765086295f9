//! nudge-storage: persistence for reminder definitions.
//!
//! The engine only talks to the [`ReminderStore`] trait. [`SqliteReminderStore`]
//! is the bundled implementation.

mod sqlite;

pub use sqlite::SqliteReminderStore;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::stream::BoxStream;

use nudge_types::{
    AgentType, ListRemindersQuery, Reminder, ReminderPayload, ReminderStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt reminder row {id}: {message}")]
    Corrupt { id: String, message: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Timestamps are persisted with microsecond precision; values compared
/// against stored ones must go through this first.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Fields of a reminder supplied at insert time. Everything else is store-managed.
#[derive(Debug, Clone)]
pub struct NewReminder {
    pub owner_id: String,
    pub agent_type: AgentType,
    pub payload: ReminderPayload,
    pub repeat: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub max_occurrences: Option<u32>,
    pub stop_after: Option<DateTime<Utc>>,
}

/// Column changes applied by [`ReminderStore::update`]. `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct ReminderPatch {
    pub payload: Option<ReminderPayload>,
    pub repeat: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: Option<ReminderStatus>,
    pub occurrence_count: Option<u32>,
    pub max_occurrences: Option<u32>,
    pub stop_after: Option<DateTime<Utc>>,
    pub failed_attempts: Option<u32>,
    /// `Some(None)` clears the column.
    pub last_error: Option<Option<String>>,
    pub conversation_id: Option<String>,
}

impl ReminderPatch {
    pub fn status(status: ReminderStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
            && self.repeat.is_none()
            && self.scheduled_at.is_none()
            && self.status.is_none()
            && self.occurrence_count.is_none()
            && self.max_occurrences.is_none()
            && self.stop_after.is_none()
            && self.failed_attempts.is_none()
            && self.last_error.is_none()
            && self.conversation_id.is_none()
    }
}

/// Preconditions checked in the same statement as the update.
///
/// An update whose guard does not hold changes nothing and reports `false`.
#[derive(Debug, Clone, Default)]
pub struct UpdateGuard {
    /// Current status must be one of these (empty: any).
    pub status_in: Vec<ReminderStatus>,
    /// Current `scheduled_at` must equal this.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl UpdateGuard {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn status(status: ReminderStatus) -> Self {
        Self {
            status_in: vec![status],
            scheduled_at: None,
        }
    }

    /// Current status must be non-terminal.
    pub fn active() -> Self {
        Self {
            status_in: vec![ReminderStatus::Scheduled, ReminderStatus::Paused],
            scheduled_at: None,
        }
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(normalize_timestamp(scheduled_at));
        self
    }
}

/// Persistence interface consumed by the scheduler and executor.
///
/// `owner_id` scopes every lookup and write when given; internal executor
/// paths pass `None` and address reminders by id alone.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    /// Insert a new reminder in `scheduled` status. Returns the assigned id.
    async fn insert(&self, reminder: NewReminder) -> Result<String>;

    async fn get(&self, id: &str, owner_id: Option<&str>) -> Result<Option<Reminder>>;

    /// Atomically apply `patch` if `guard` holds. Returns whether a row changed.
    async fn update(
        &self,
        id: &str,
        owner_id: Option<&str>,
        patch: &ReminderPatch,
        guard: &UpdateGuard,
    ) -> Result<bool>;

    /// Owner-scoped listing ordered by `scheduled_at`.
    async fn list(&self, query: &ListRemindersQuery) -> Result<Vec<Reminder>>;

    /// Stream every reminder in `scheduled` status, page by page.
    fn scan_scheduled(&self) -> BoxStream<'_, Result<Reminder>>;
}
