//! Delayed work queue: run a registered handler at or after a given time.
//!
//! [`TimerQueue`] keeps jobs as tokio timers inside the current process, so
//! pending jobs do not survive a restart; start-up reconciliation re-enqueues
//! them from the store. [`HandoffQueue`] accepts jobs without running them,
//! for short-lived processes whose work is picked up by a serving process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Task name under which the reminder executor is registered.
pub const PROCESS_REMINDER: &str = "process_reminder";

/// Arguments of a `process_reminder` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderJobArgs {
    pub reminder_id: String,
    /// The reminder's `scheduled_at` when the job was enqueued. Jobs whose
    /// value no longer matches the reminder are stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl ReminderJobArgs {
    pub fn new(reminder_id: impl Into<String>, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            reminder_id: reminder_id.into(),
            scheduled_for: Some(scheduled_for),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!(self)
    }
}

/// A job handed to a [`JobHandler`] when it fires.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub task_name: String,
    pub args: Value,
    pub fire_at: DateTime<Utc>,
}

/// Receipt for an accepted job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub job_id: String,
    pub task_name: String,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is shut down")]
    Closed,
    #[error("no handler registered for task '{0}'")]
    UnknownTask(String),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Handler invoked by the queue. Handlers never ask for redelivery: whatever
/// happens inside is theirs to log or absorb.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job);
}

/// Transport that defers work until a given time, at-least-once.
#[async_trait]
pub trait DelayedQueue: Send + Sync {
    /// Register the handler for `task_name`, replacing any previous one.
    fn register(&self, task_name: &str, handler: Arc<dyn JobHandler>);

    async fn enqueue(
        &self,
        task_name: &str,
        args: Value,
        fire_at: DateTime<Utc>,
    ) -> Result<JobHandle, QueueError>;

    /// Stop accepting jobs, drop pending timers and wait for running handlers.
    async fn shutdown(&self);
}

/// In-process delayed queue built on tokio timers.
///
/// Pending jobs are keyed by task name and arguments; enqueueing an identical
/// job while one is pending or running returns the existing handle.
pub struct TimerQueue {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    pending: Arc<Mutex<HashMap<String, JobHandle>>>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TimerQueue {
    /// Create a queue running at most `max_concurrent` handlers at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Number of jobs waiting or running.
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn handler(&self, task_name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_name)
            .cloned()
    }
}

#[async_trait]
impl DelayedQueue for TimerQueue {
    fn register(&self, task_name: &str, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_name.to_string(), handler);
        debug!(task = task_name, "Registered job handler");
    }

    async fn enqueue(
        &self,
        task_name: &str,
        args: Value,
        fire_at: DateTime<Utc>,
    ) -> Result<JobHandle, QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Closed);
        }
        let handler = self
            .handler(task_name)
            .ok_or_else(|| QueueError::UnknownTask(task_name.to_string()))?;

        let key = format!("{task_name}:{args}");
        let handle = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = pending.get(&key) {
                debug!(job_id = %existing.job_id, task = task_name, "Job already pending");
                return Ok(existing.clone());
            }
            let handle = JobHandle {
                job_id: uuid::Uuid::new_v4().to_string(),
                task_name: task_name.to_string(),
                fire_at,
            };
            pending.insert(key.clone(), handle.clone());
            handle
        };

        let delay = fire_at
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        debug!(
            job_id = %handle.job_id,
            task = task_name,
            fire_at = %fire_at,
            delay_secs = delay.as_secs(),
            "Enqueued job"
        );

        let job = Job {
            id: handle.job_id.clone(),
            task_name: task_name.to_string(),
            args,
            fire_at,
        };
        let pending = self.pending.clone();
        let semaphore = self.semaphore.clone();
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            let deadline = Instant::now() + delay;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let permit = tokio::select! {
                        permit = semaphore.acquire_owned() => permit.ok(),
                        _ = cancel.cancelled() => None,
                    };
                    if let Some(_permit) = permit {
                        handler.handle(job).await;
                    }
                }
                _ = cancel.cancelled() => {
                    debug!(job_id = %job.id, "Timer cancelled");
                }
            }
            pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        });

        Ok(handle)
    }

    async fn shutdown(&self) {
        info!("Timer queue shutting down");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Timer queue stopped");
    }
}

/// Queue for processes that only mutate reminders and exit.
///
/// Jobs are accepted and dropped; a serving process's reconciliation sweep
/// schedules them from the store.
#[derive(Debug, Default)]
pub struct HandoffQueue;

#[async_trait]
impl DelayedQueue for HandoffQueue {
    fn register(&self, task_name: &str, _handler: Arc<dyn JobHandler>) {
        warn!(task = task_name, "Handoff queue never runs handlers");
    }

    async fn enqueue(
        &self,
        task_name: &str,
        args: Value,
        fire_at: DateTime<Utc>,
    ) -> Result<JobHandle, QueueError> {
        debug!(task = task_name, %args, fire_at = %fire_at, "Handing job off to serving process");
        Ok(JobHandle {
            job_id: uuid::Uuid::new_v4().to_string(),
            task_name: task_name.to_string(),
            fire_at,
        })
    }

    async fn shutdown(&self) {}
}
