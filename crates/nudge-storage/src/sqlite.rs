//! SQLite-backed reminder storage.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use nudge_types::{ListRemindersQuery, Reminder, ReminderStatus};

use crate::{
    NewReminder, ReminderPatch, ReminderStore, Result, StorageError, UpdateGuard,
    normalize_timestamp,
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS reminders (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        agent_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        repeat TEXT,
        scheduled_at TEXT NOT NULL,
        status TEXT NOT NULL,
        occurrence_count INTEGER NOT NULL DEFAULT 0,
        max_occurrences INTEGER,
        stop_after TEXT,
        failed_attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        conversation_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_reminders_owner_status
        ON reminders (owner_id, status);
    CREATE INDEX IF NOT EXISTS idx_reminders_status_scheduled
        ON reminders (status, scheduled_at);";

const SELECT_COLUMNS: &str = "id, owner_id, agent_type, payload, repeat, scheduled_at, status,
    occurrence_count, max_occurrences, stop_after, failed_attempts, last_error,
    conversation_id, created_at, updated_at";

/// Rows fetched per page by [`ReminderStore::scan_scheduled`].
const SCAN_PAGE_SIZE: u32 = 200;

/// SQLite-based reminder store.
#[derive(Clone)]
pub struct SqliteReminderStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReminderStore {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Reminder store opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await?
    }

    /// One keyset page of scheduled reminders with ids greater than `after`.
    ///
    /// Returns the converted rows and the last raw id seen, so a corrupt row
    /// does not stall the scan.
    async fn scheduled_page(&self, after: String) -> Result<(Vec<Result<Reminder>>, Option<String>)> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM reminders
                 WHERE status = ?1 AND id > ?2
                 ORDER BY id ASC LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let raws = stmt
                .query_map(
                    rusqlite::params![ReminderStatus::Scheduled.as_str(), after, SCAN_PAGE_SIZE],
                    RawRow::from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let last_id = raws.last().map(|r| r.id.clone());
            Ok((raws.into_iter().map(RawRow::into_reminder).collect(), last_id))
        })
        .await
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    normalize_timestamp(ts).to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn corrupt(id: &str, message: impl Into<String>) -> StorageError {
    StorageError::Corrupt {
        id: id.to_string(),
        message: message.into(),
    }
}

fn parse_ts(id: &str, column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| corrupt(id, format!("{column}: {e}")))
}

fn to_u32(id: &str, column: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| corrupt(id, format!("{column} out of range: {value}")))
}

/// Untyped row as read from SQLite.
struct RawRow {
    id: String,
    owner_id: String,
    agent_type: String,
    payload: String,
    repeat: Option<String>,
    scheduled_at: String,
    status: String,
    occurrence_count: i64,
    max_occurrences: Option<i64>,
    stop_after: Option<String>,
    failed_attempts: i64,
    last_error: Option<String>,
    conversation_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            agent_type: row.get(2)?,
            payload: row.get(3)?,
            repeat: row.get(4)?,
            scheduled_at: row.get(5)?,
            status: row.get(6)?,
            occurrence_count: row.get(7)?,
            max_occurrences: row.get(8)?,
            stop_after: row.get(9)?,
            failed_attempts: row.get(10)?,
            last_error: row.get(11)?,
            conversation_id: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_reminder(self) -> Result<Reminder> {
        let id = self.id;
        Ok(Reminder {
            owner_id: self.owner_id,
            agent_type: self.agent_type.parse().map_err(|e: String| corrupt(&id, e))?,
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| corrupt(&id, format!("payload: {e}")))?,
            repeat: self.repeat,
            scheduled_at: parse_ts(&id, "scheduled_at", &self.scheduled_at)?,
            status: self.status.parse().map_err(|e: String| corrupt(&id, e))?,
            occurrence_count: to_u32(&id, "occurrence_count", self.occurrence_count)?,
            max_occurrences: self
                .max_occurrences
                .map(|v| to_u32(&id, "max_occurrences", v))
                .transpose()?,
            stop_after: self
                .stop_after
                .as_deref()
                .map(|v| parse_ts(&id, "stop_after", v))
                .transpose()?,
            failed_attempts: to_u32(&id, "failed_attempts", self.failed_attempts)?,
            last_error: self.last_error,
            conversation_id: self.conversation_id,
            created_at: parse_ts(&id, "created_at", &self.created_at)?,
            updated_at: parse_ts(&id, "updated_at", &self.updated_at)?,
            id,
        })
    }
}

/// Build the guarded `UPDATE` statement and its positional parameters.
fn build_update(
    id: &str,
    owner_id: Option<&str>,
    patch: &ReminderPatch,
    guard: &UpdateGuard,
) -> Result<(String, Vec<Value>)> {
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(payload) = &patch.payload {
        sets.push("payload = ?");
        values.push(Value::Text(serde_json::to_string(payload)?));
    }
    if let Some(repeat) = &patch.repeat {
        sets.push("repeat = ?");
        values.push(Value::Text(repeat.clone()));
    }
    if let Some(scheduled_at) = patch.scheduled_at {
        sets.push("scheduled_at = ?");
        values.push(Value::Text(fmt_ts(scheduled_at)));
    }
    if let Some(status) = patch.status {
        sets.push("status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(count) = patch.occurrence_count {
        sets.push("occurrence_count = ?");
        values.push(Value::Integer(i64::from(count)));
    }
    if let Some(max) = patch.max_occurrences {
        sets.push("max_occurrences = ?");
        values.push(Value::Integer(i64::from(max)));
    }
    if let Some(stop_after) = patch.stop_after {
        sets.push("stop_after = ?");
        values.push(Value::Text(fmt_ts(stop_after)));
    }
    if let Some(attempts) = patch.failed_attempts {
        sets.push("failed_attempts = ?");
        values.push(Value::Integer(i64::from(attempts)));
    }
    if let Some(last_error) = &patch.last_error {
        sets.push("last_error = ?");
        values.push(match last_error {
            Some(msg) => Value::Text(msg.clone()),
            None => Value::Null,
        });
    }
    if let Some(conversation_id) = &patch.conversation_id {
        sets.push("conversation_id = ?");
        values.push(Value::Text(conversation_id.clone()));
    }

    sets.push("updated_at = ?");
    values.push(Value::Text(fmt_ts(Utc::now())));

    let mut sql = format!("UPDATE reminders SET {} WHERE id = ?", sets.join(", "));
    values.push(Value::Text(id.to_string()));

    if let Some(owner_id) = owner_id {
        sql.push_str(" AND owner_id = ?");
        values.push(Value::Text(owner_id.to_string()));
    }
    if !guard.status_in.is_empty() {
        let placeholders = vec!["?"; guard.status_in.len()].join(", ");
        sql.push_str(&format!(" AND status IN ({placeholders})"));
        values.extend(
            guard
                .status_in
                .iter()
                .map(|s| Value::Text(s.as_str().to_string())),
        );
    }
    if let Some(scheduled_at) = guard.scheduled_at {
        sql.push_str(" AND scheduled_at = ?");
        values.push(Value::Text(fmt_ts(scheduled_at)));
    }

    Ok((sql, values))
}

#[async_trait]
impl ReminderStore for SqliteReminderStore {
    async fn insert(&self, reminder: NewReminder) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&reminder.payload)?;
        let now = fmt_ts(Utc::now());
        let row_id = id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO reminders
                    (id, owner_id, agent_type, payload, repeat, scheduled_at, status,
                     occurrence_count, max_occurrences, stop_after, failed_attempts,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, 0, ?10, ?10)",
                rusqlite::params![
                    row_id,
                    reminder.owner_id,
                    reminder.agent_type.as_str(),
                    payload,
                    reminder.repeat,
                    fmt_ts(reminder.scheduled_at),
                    ReminderStatus::Scheduled.as_str(),
                    reminder.max_occurrences.map(i64::from),
                    reminder.stop_after.map(fmt_ts),
                    now,
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn get(&self, id: &str, owner_id: Option<&str>) -> Result<Option<Reminder>> {
        let id = id.to_string();
        let owner_id = owner_id.map(String::from);
        let raw = self
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM reminders
                     WHERE id = ?1 AND (?2 IS NULL OR owner_id = ?2)"
                );
                let raw = conn
                    .query_row(&sql, rusqlite::params![id, owner_id], RawRow::from_row)
                    .optional()?;
                Ok(raw)
            })
            .await?;
        raw.map(RawRow::into_reminder).transpose()
    }

    async fn update(
        &self,
        id: &str,
        owner_id: Option<&str>,
        patch: &ReminderPatch,
        guard: &UpdateGuard,
    ) -> Result<bool> {
        if patch.is_empty() {
            return Ok(false);
        }
        let (sql, values) = build_update(id, owner_id, patch, guard)?;
        let changed = self
            .with_conn(move |conn| {
                let changed = conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
                Ok(changed)
            })
            .await?;
        Ok(changed > 0)
    }

    async fn list(&self, query: &ListRemindersQuery) -> Result<Vec<Reminder>> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM reminders WHERE owner_id = ?");
        let mut values = vec![Value::Text(query.owner_id.clone())];
        if let Some(status) = query.status {
            sql.push_str(" AND status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(agent_type) = query.agent_type {
            sql.push_str(" AND agent_type = ?");
            values.push(Value::Text(agent_type.as_str().to_string()));
        }
        sql.push_str(" ORDER BY scheduled_at ASC, id ASC LIMIT ? OFFSET ?");
        values.push(Value::Integer(i64::from(query.effective_limit())));
        values.push(Value::Integer(i64::from(query.skip)));

        let raws = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(values.iter()), RawRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        raws.into_iter().map(RawRow::into_reminder).collect()
    }

    fn scan_scheduled(&self) -> BoxStream<'_, Result<Reminder>> {
        let store = self.clone();
        stream::unfold(Some(String::new()), move |cursor| {
            let store = store.clone();
            async move {
                let after = cursor?;
                match store.scheduled_page(after).await {
                    Ok((page, last_id)) => {
                        if page.is_empty() {
                            return None;
                        }
                        let next = if page.len() < SCAN_PAGE_SIZE as usize {
                            None
                        } else {
                            last_id
                        };
                        Some((page, next))
                    }
                    Err(e) => Some((vec![Err(e)], None)),
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }
}
