use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ──────────────────── Reminder Types ────────────────────

/// Which kind of work a reminder performs when it fires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Deliver a fixed title/body notification.
    Static,
    /// Hand the instructions to an AI agent and deliver its answer.
    AiAgent,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Static => "static",
            AgentType::AiAgent => "ai_agent",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(AgentType::Static),
            "ai_agent" => Ok(AgentType::AiAgent),
            other => Err(format!("unknown agent type: {other}")),
        }
    }
}

/// Reminder payload. The variant must agree with the reminder's [`AgentType`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReminderPayload {
    Static { title: String, body: String },
    AiAgent { instructions: String },
}

impl ReminderPayload {
    /// The agent type this payload shape belongs to.
    pub fn agent_type(&self) -> AgentType {
        match self {
            ReminderPayload::Static { .. } => AgentType::Static,
            ReminderPayload::AiAgent { .. } => AgentType::AiAgent,
        }
    }
}

/// Lifecycle status of a reminder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    /// Waiting for its next firing.
    Scheduled,
    /// Recurrence exhausted or one-time reminder consumed.
    Completed,
    /// Cancelled by the owner or by an unrecoverable payload failure.
    Cancelled,
    /// Suspended; keeps its occurrence bookkeeping.
    Paused,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Scheduled => "scheduled",
            ReminderStatus::Completed => "completed",
            ReminderStatus::Cancelled => "cancelled",
            ReminderStatus::Paused => "paused",
        }
    }

    /// Completed and cancelled reminders never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReminderStatus::Completed | ReminderStatus::Cancelled)
    }
}

impl fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReminderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ReminderStatus::Scheduled),
            "completed" => Ok(ReminderStatus::Completed),
            "cancelled" => Ok(ReminderStatus::Cancelled),
            "paused" => Ok(ReminderStatus::Paused),
            other => Err(format!("unknown reminder status: {other}")),
        }
    }
}

/// A persisted reminder definition, one-time or recurring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reminder {
    /// Store-assigned identifier.
    pub id: String,
    /// Owning user; store operations are scoped by it.
    pub owner_id: String,
    pub agent_type: AgentType,
    pub payload: ReminderPayload,
    /// Cron expression. `None` means the reminder fires once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<String>,
    /// Next (or only) firing time.
    pub scheduled_at: DateTime<Utc>,
    pub status: ReminderStatus,
    /// Successful firings so far.
    pub occurrence_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_occurrences: Option<u32>,
    /// The series ends once the next computed firing would land at or after this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_after: Option<DateTime<Utc>>,
    /// Consecutive retryable failures for the pending firing.
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Conversation created by an AI agent run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reminder {
    pub fn is_recurring(&self) -> bool {
        self.repeat.is_some()
    }

    /// True once `occurrence_count` has hit `max_occurrences`.
    pub fn occurrences_exhausted(&self) -> bool {
        self.max_occurrences
            .is_some_and(|max| self.occurrence_count >= max)
    }
}

/// Full reminder record returned to callers.
pub type ReminderResponse = Reminder;

// ──────────────────── Request Types ────────────────────

/// Request to create a reminder for the calling owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReminderRequest {
    pub agent_type: AgentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<String>,
    /// First firing time. Computed from `repeat` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_occurrences: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_after: Option<DateTime<Utc>>,
    pub payload: ReminderPayload,
}

/// Partial update. Only fields that are `Some` are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateReminderRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReminderStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_occurrences: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ReminderPayload>,
}

impl UpdateReminderRequest {
    pub fn is_empty(&self) -> bool {
        self.repeat.is_none()
            && self.scheduled_at.is_none()
            && self.status.is_none()
            && self.max_occurrences.is_none()
            && self.stop_after.is_none()
            && self.payload.is_none()
    }
}

/// Listing query, always scoped to one owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRemindersQuery {
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReminderStatus>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<AgentType>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub skip: u32,
}

/// Upper bound applied to `ListRemindersQuery::limit`.
pub const MAX_LIST_LIMIT: u32 = 500;

fn default_limit() -> u32 {
    50
}

impl ListRemindersQuery {
    pub fn for_owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            status: None,
            agent_type: None,
            limit: default_limit(),
            skip: 0,
        }
    }

    /// `limit` clamped to `1..=MAX_LIST_LIMIT`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }
}
