//! Reminder executor: the `process_reminder` job handler.
//!
//! One firing: load, check eligibility, dispatch, then write the next state
//! with a compare-and-swap on `(status, scheduled_at)`. Only the worker whose
//! write lands notifies. Nothing is ever raised back to the queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use nudge_config::RetryConfig;
use nudge_storage::{ReminderPatch, ReminderStore, UpdateGuard, normalize_timestamp};
use nudge_types::{Reminder, ReminderStatus};

use crate::dispatch::{DispatchError, DispatchOutcome, DispatchRequest, PayloadDispatcher};
use crate::notify::{Notification, NotificationSink};
use crate::queue::{DelayedQueue, Job, JobHandler, PROCESS_REMINDER, ReminderJobArgs};
use crate::recurrence;

/// What a single job did. Returned for logging and tests; the queue ignores it.
#[derive(Debug, Clone, PartialEq)]
pub enum FiringOutcome {
    /// No reminder with that id.
    Missing,
    /// Reminder was not SCHEDULED.
    Ineligible(ReminderStatus),
    /// Reminder has moved to another time since the job was enqueued.
    Stale,
    /// Reminder reached its end and is now COMPLETED.
    Completed,
    /// Recurring reminder set up for its next occurrence.
    Rescheduled(DateTime<Utc>),
    /// Retryable failure; another attempt is due at the given time.
    Retrying(DateTime<Utc>),
    /// Payload failed for good.
    Cancelled(String),
    /// Another worker already handled this firing.
    Superseded,
    /// Storage failure; the reminder was left as it was.
    Failed(String),
}

/// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped.
pub fn retry_backoff(retry: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let secs = retry
        .base_delay_secs
        .saturating_mul(factor)
        .min(retry.max_delay_secs);
    Duration::from_secs(secs)
}

/// Next occurrence after a firing of `scheduled_at`. A late firing skips
/// straight to the first occurrence after `now`.
fn next_occurrence(
    repeat: &str,
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, recurrence::RecurrenceError> {
    let next = recurrence::next_fire_time(repeat, scheduled_at)?;
    if next > now {
        Ok(next)
    } else {
        recurrence::next_fire_time(repeat, now)
    }
}

pub struct ReminderExecutor {
    store: Arc<dyn ReminderStore>,
    queue: Arc<dyn DelayedQueue>,
    dispatcher: Arc<dyn PayloadDispatcher>,
    sink: Arc<dyn NotificationSink>,
    retry: RetryConfig,
}

impl ReminderExecutor {
    pub fn new(
        store: Arc<dyn ReminderStore>,
        queue: Arc<dyn DelayedQueue>,
        dispatcher: Arc<dyn PayloadDispatcher>,
        sink: Arc<dyn NotificationSink>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            queue,
            dispatcher,
            sink,
            retry,
        }
    }

    /// Run one firing of a reminder.
    pub async fn process(&self, args: &ReminderJobArgs) -> FiringOutcome {
        let id = args.reminder_id.as_str();

        let reminder = match self.store.get(id, None).await {
            Ok(Some(reminder)) => reminder,
            Ok(None) => {
                warn!(reminder_id = %id, "Reminder not found, dropping job");
                return FiringOutcome::Missing;
            }
            Err(e) => {
                error!(reminder_id = %id, "Failed to load reminder: {e}");
                return FiringOutcome::Failed(e.to_string());
            }
        };

        if reminder.status != ReminderStatus::Scheduled {
            info!(reminder_id = %id, status = %reminder.status, "Reminder not scheduled, skipping");
            return FiringOutcome::Ineligible(reminder.status);
        }
        if let Some(scheduled_for) = args.scheduled_for
            && normalize_timestamp(scheduled_for) != reminder.scheduled_at
        {
            debug!(
                reminder_id = %id,
                scheduled_for = %scheduled_for,
                scheduled_at = %reminder.scheduled_at,
                "Stale job, skipping"
            );
            return FiringOutcome::Stale;
        }

        let guard =
            UpdateGuard::status(ReminderStatus::Scheduled).with_scheduled_at(reminder.scheduled_at);

        if reminder.occurrences_exhausted() {
            info!(reminder_id = %id, "Occurrence limit already reached, completing");
            let patch = ReminderPatch::status(ReminderStatus::Completed);
            return match self.store.update(id, None, &patch, &guard).await {
                Ok(true) => FiringOutcome::Completed,
                Ok(false) => FiringOutcome::Superseded,
                Err(e) => {
                    error!(reminder_id = %id, "Failed to complete reminder: {e}");
                    FiringOutcome::Failed(e.to_string())
                }
            };
        }

        let request = DispatchRequest {
            reminder_id: reminder.id.clone(),
            owner_id: reminder.owner_id.clone(),
            agent_type: reminder.agent_type,
            payload: reminder.payload.clone(),
            conversation_id: reminder.conversation_id.clone(),
        };

        match self.dispatcher.execute(&request).await {
            Ok(outcome) => self.on_success(&reminder, &guard, outcome).await,
            Err(err) => self.on_failure(&reminder, &guard, err).await,
        }
    }

    async fn on_success(
        &self,
        reminder: &Reminder,
        guard: &UpdateGuard,
        outcome: DispatchOutcome,
    ) -> FiringOutcome {
        let now = Utc::now();
        let occurrence_count = reminder.occurrence_count + 1;

        let mut patch = ReminderPatch {
            occurrence_count: Some(occurrence_count),
            failed_attempts: Some(0),
            last_error: Some(None),
            ..Default::default()
        };
        if reminder.conversation_id.is_none() {
            patch.conversation_id = outcome.conversation_id.clone();
        }

        let next = match &reminder.repeat {
            None => None,
            Some(_) if reminder.max_occurrences.is_some_and(|max| occurrence_count >= max) => None,
            Some(repeat) => match next_occurrence(repeat, reminder.scheduled_at, now) {
                Ok(next) if reminder.stop_after.is_some_and(|stop| next >= stop) => None,
                Ok(next) => Some(next),
                Err(e) => {
                    warn!(reminder_id = %reminder.id, "No further occurrence: {e}");
                    None
                }
            },
        };

        match next {
            Some(next) => {
                patch.scheduled_at = Some(next);
            }
            None => {
                patch.status = Some(ReminderStatus::Completed);
            }
        }

        match self.store.update(&reminder.id, None, &patch, guard).await {
            Ok(true) => {}
            Ok(false) => {
                info!(reminder_id = %reminder.id, "Firing already handled elsewhere");
                return FiringOutcome::Superseded;
            }
            Err(e) => {
                error!(reminder_id = %reminder.id, "Failed to record firing: {e}");
                return FiringOutcome::Failed(e.to_string());
            }
        }

        if let Some(next) = next {
            self.enqueue(&reminder.id, next).await;
        }

        let notification = Notification {
            owner_id: reminder.owner_id.clone(),
            reminder_id: reminder.id.clone(),
            title: outcome.title,
            body: outcome.body,
        };
        if let Err(e) = self.sink.notify(notification).await {
            warn!(reminder_id = %reminder.id, "Notification failed: {e}");
        }

        match next {
            Some(next) => {
                info!(reminder_id = %reminder.id, occurrence_count, next = %next, "Reminder fired, rescheduled");
                FiringOutcome::Rescheduled(next)
            }
            None => {
                info!(reminder_id = %reminder.id, occurrence_count, "Reminder fired, completed");
                FiringOutcome::Completed
            }
        }
    }

    async fn on_failure(
        &self,
        reminder: &Reminder,
        guard: &UpdateGuard,
        err: DispatchError,
    ) -> FiringOutcome {
        let attempts = reminder.failed_attempts + 1;
        let message = err.to_string();

        if err.is_retryable() && attempts < self.retry.max_attempts {
            let delay = chrono::Duration::from_std(retry_backoff(&self.retry, reminder.failed_attempts))
                .unwrap_or_else(|_| chrono::Duration::zero());
            let retry_at = Utc::now() + delay;
            if reminder.stop_after.is_some_and(|stop| retry_at >= stop) {
                return self.complete_after_failure(reminder, guard, attempts, message).await;
            }
            let patch = ReminderPatch {
                scheduled_at: Some(retry_at),
                failed_attempts: Some(attempts),
                last_error: Some(Some(message.clone())),
                ..Default::default()
            };
            return match self.store.update(&reminder.id, None, &patch, guard).await {
                Ok(true) => {
                    warn!(
                        reminder_id = %reminder.id,
                        attempt = attempts,
                        retry_at = %retry_at,
                        "Payload failed, will retry: {message}"
                    );
                    self.enqueue(&reminder.id, retry_at).await;
                    FiringOutcome::Retrying(retry_at)
                }
                Ok(false) => FiringOutcome::Superseded,
                Err(e) => {
                    error!(reminder_id = %reminder.id, "Failed to record retry: {e}");
                    FiringOutcome::Failed(e.to_string())
                }
            };
        }

        let patch = ReminderPatch {
            status: Some(ReminderStatus::Cancelled),
            failed_attempts: Some(attempts),
            last_error: Some(Some(message.clone())),
            ..Default::default()
        };
        match self.store.update(&reminder.id, None, &patch, guard).await {
            Ok(true) => {
                error!(reminder_id = %reminder.id, attempts, "Payload failed, reminder cancelled: {message}");
                FiringOutcome::Cancelled(message)
            }
            Ok(false) => FiringOutcome::Superseded,
            Err(e) => {
                error!(reminder_id = %reminder.id, "Failed to cancel reminder: {e}");
                FiringOutcome::Failed(e.to_string())
            }
        }
    }

    /// The retry would land past `stop_after`: the window is over, so the
    /// reminder completes with the failure recorded.
    async fn complete_after_failure(
        &self,
        reminder: &Reminder,
        guard: &UpdateGuard,
        attempts: u32,
        message: String,
    ) -> FiringOutcome {
        let patch = ReminderPatch {
            status: Some(ReminderStatus::Completed),
            failed_attempts: Some(attempts),
            last_error: Some(Some(message.clone())),
            ..Default::default()
        };
        match self.store.update(&reminder.id, None, &patch, guard).await {
            Ok(true) => {
                warn!(
                    reminder_id = %reminder.id,
                    attempt = attempts,
                    "Payload failed and no retry fits before stop_after, reminder completed: {message}"
                );
                FiringOutcome::Completed
            }
            Ok(false) => FiringOutcome::Superseded,
            Err(e) => {
                error!(reminder_id = %reminder.id, "Failed to complete reminder: {e}");
                FiringOutcome::Failed(e.to_string())
            }
        }
    }

    async fn enqueue(&self, reminder_id: &str, fire_at: DateTime<Utc>) {
        let args = ReminderJobArgs::new(reminder_id, normalize_timestamp(fire_at));
        if let Err(e) = self
            .queue
            .enqueue(PROCESS_REMINDER, args.to_value(), fire_at)
            .await
        {
            warn!(reminder_id = %reminder_id, "Failed to enqueue next firing: {e}");
        }
    }
}

#[async_trait]
impl JobHandler for ReminderExecutor {
    async fn handle(&self, job: Job) {
        let args: ReminderJobArgs = match serde_json::from_value(job.args) {
            Ok(args) => args,
            Err(e) => {
                warn!(job_id = %job.id, "Malformed job arguments: {e}");
                return;
            }
        };
        let outcome = self.process(&args).await;
        debug!(job_id = %job.id, reminder_id = %args.reminder_id, ?outcome, "Job finished");
    }
}
