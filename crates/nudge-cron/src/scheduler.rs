//! Reminder scheduler: the request/response surface over the store and queue.
//!
//! Every mutation validates first, writes the store, then enqueues. Enqueue
//! failures are logged and swallowed; reconciliation picks those reminders up.
//! Jobs are never revoked: outdated ones are discarded by the executor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use nudge_config::OverduePolicy;
use nudge_storage::{NewReminder, ReminderPatch, ReminderStore, UpdateGuard, normalize_timestamp};
use nudge_types::{
    CreateReminderRequest, ListRemindersQuery, Reminder, ReminderPayload, ReminderStatus,
    UpdateReminderRequest,
};

use crate::error::{Result, SchedulerError};
use crate::queue::{DelayedQueue, PROCESS_REMINDER, ReminderJobArgs};
use crate::recurrence;

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// SCHEDULED reminders seen.
    pub scanned: usize,
    /// Future reminders enqueued at their time.
    pub enqueued: usize,
    /// Overdue reminders enqueued to fire now.
    pub fired_now: usize,
    /// Overdue recurring reminders moved to their next occurrence.
    pub advanced: usize,
    /// Overdue recurring reminders completed because nothing is left to fire.
    pub completed: usize,
    /// Overdue reminders left alone.
    pub skipped: usize,
    /// Rows that could not be read, updated or enqueued.
    pub failed: usize,
}

/// Manages reminder definitions and their queued firings.
pub struct ReminderScheduler {
    store: Arc<dyn ReminderStore>,
    queue: Arc<dyn DelayedQueue>,
    overdue_policy: OverduePolicy,
}

fn validate_repeat(repeat: &str) -> Result<()> {
    recurrence::parse(repeat)?;
    Ok(())
}

fn validate_max_occurrences(max: Option<u32>) -> Result<()> {
    if max == Some(0) {
        return Err(SchedulerError::InvalidSchedule(
            "max_occurrences must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_stop_after(stop_after: Option<DateTime<Utc>>, scheduled_at: DateTime<Utc>) -> Result<()> {
    match stop_after {
        Some(stop) if stop <= scheduled_at => Err(SchedulerError::InvalidSchedule(format!(
            "stop_after {stop} is not after the first occurrence {scheduled_at}"
        ))),
        _ => Ok(()),
    }
}

fn validate_payload_contents(payload: &ReminderPayload) -> Result<()> {
    let empty = match payload {
        ReminderPayload::Static { title, body } => title.trim().is_empty() && body.trim().is_empty(),
        ReminderPayload::AiAgent { instructions } => instructions.trim().is_empty(),
    };
    if empty {
        return Err(SchedulerError::InvalidPayload(format!(
            "{} payload has no content",
            payload.agent_type()
        )));
    }
    Ok(())
}

impl ReminderScheduler {
    pub fn new(
        store: Arc<dyn ReminderStore>,
        queue: Arc<dyn DelayedQueue>,
        overdue_policy: OverduePolicy,
    ) -> Self {
        Self {
            store,
            queue,
            overdue_policy,
        }
    }

    /// Create a reminder and enqueue its first firing. Returns the new id.
    pub async fn create(&self, owner_id: &str, request: CreateReminderRequest) -> Result<String> {
        if request.payload.agent_type() != request.agent_type {
            return Err(SchedulerError::InvalidPayload(format!(
                "payload type {} does not match agent type {}",
                request.payload.agent_type(),
                request.agent_type
            )));
        }
        validate_payload_contents(&request.payload)?;
        validate_max_occurrences(request.max_occurrences)?;
        if let Some(repeat) = &request.repeat {
            validate_repeat(repeat)?;
        }

        let scheduled_at = match (request.scheduled_at, &request.repeat) {
            (Some(at), _) => at,
            (None, Some(repeat)) => recurrence::next_fire_time(repeat, Utc::now())?,
            (None, None) => {
                return Err(SchedulerError::InvalidSchedule(
                    "either scheduled_at or repeat is required".to_string(),
                ));
            }
        };
        validate_stop_after(request.stop_after, scheduled_at)?;

        let id = self
            .store
            .insert(NewReminder {
                owner_id: owner_id.to_string(),
                agent_type: request.agent_type,
                payload: request.payload,
                repeat: request.repeat,
                scheduled_at,
                max_occurrences: request.max_occurrences,
                stop_after: request.stop_after,
            })
            .await?;

        info!(reminder_id = %id, owner_id, scheduled_at = %scheduled_at, "Reminder created");
        self.enqueue(&id, scheduled_at).await;
        Ok(id)
    }

    pub async fn get(&self, id: &str, owner_id: &str) -> Result<Reminder> {
        self.store
            .get(id, Some(owner_id))
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    pub async fn list(&self, query: &ListRemindersQuery) -> Result<Vec<Reminder>> {
        Ok(self.store.list(query).await?)
    }

    /// Apply a partial update. Returns `false` when the reminder is terminal
    /// or changed concurrently, and `NotFound` when the owner has no such
    /// reminder.
    pub async fn update(
        &self,
        id: &str,
        owner_id: &str,
        request: UpdateReminderRequest,
    ) -> Result<bool> {
        let current = self.get(id, owner_id).await?;
        if current.status.is_terminal() {
            debug!(reminder_id = %id, status = %current.status, "Terminal reminder, update rejected");
            return Ok(false);
        }
        if request.is_empty() {
            return Ok(false);
        }

        if let Some(payload) = &request.payload {
            if payload.agent_type() != current.agent_type {
                return Err(SchedulerError::InvalidPayload(format!(
                    "payload type {} does not match agent type {}",
                    payload.agent_type(),
                    current.agent_type
                )));
            }
            validate_payload_contents(payload)?;
        }
        validate_max_occurrences(request.max_occurrences)?;
        let mut status_request = request.status;
        if let Some(max) = request.max_occurrences {
            if max < current.occurrence_count {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "max_occurrences {max} is below the {} occurrences already fired",
                    current.occurrence_count
                )));
            }
            if max == current.occurrence_count {
                status_request = Some(ReminderStatus::Completed);
            }
        }
        if let Some(repeat) = &request.repeat {
            validate_repeat(repeat)?;
        }

        let repeat_changed = request
            .repeat
            .as_ref()
            .is_some_and(|r| current.repeat.as_ref() != Some(r));
        let scheduled_at = match (request.scheduled_at, &request.repeat) {
            (Some(at), _) => Some(at),
            (None, Some(repeat)) if repeat_changed => {
                Some(recurrence::next_fire_time(repeat, Utc::now())?)
            }
            _ => None,
        };

        if request.stop_after.is_some() || scheduled_at.is_some() {
            validate_stop_after(
                request.stop_after.or(current.stop_after),
                scheduled_at.unwrap_or(current.scheduled_at),
            )?;
        }

        let patch = ReminderPatch {
            payload: request.payload,
            repeat: request.repeat,
            scheduled_at,
            status: status_request,
            max_occurrences: request.max_occurrences,
            stop_after: request.stop_after,
            ..Default::default()
        };
        let guard = UpdateGuard::active();
        if !self.store.update(id, Some(owner_id), &patch, &guard).await? {
            return Ok(false);
        }

        let status = status_request.unwrap_or(current.status);
        let status_changed = status != current.status;
        let new_scheduled_at = scheduled_at.unwrap_or(current.scheduled_at);
        info!(reminder_id = %id, status = %status, scheduled_at = %new_scheduled_at, "Reminder updated");

        if status == ReminderStatus::Scheduled && (scheduled_at.is_some() || status_changed) {
            self.enqueue(id, new_scheduled_at).await;
        }
        Ok(true)
    }

    /// Cancel a reminder unless it already finished.
    pub async fn cancel(&self, id: &str, owner_id: &str) -> Result<bool> {
        let applied = self
            .store
            .update(
                id,
                Some(owner_id),
                &ReminderPatch::status(ReminderStatus::Cancelled),
                &UpdateGuard::active(),
            )
            .await?;
        if applied {
            info!(reminder_id = %id, "Reminder cancelled");
        } else {
            self.get(id, owner_id).await?;
        }
        Ok(applied)
    }

    /// SCHEDULED → PAUSED. `scheduled_at` is kept.
    pub async fn pause(&self, id: &str, owner_id: &str) -> Result<bool> {
        let applied = self
            .store
            .update(
                id,
                Some(owner_id),
                &ReminderPatch::status(ReminderStatus::Paused),
                &UpdateGuard::status(ReminderStatus::Scheduled),
            )
            .await?;
        if applied {
            info!(reminder_id = %id, "Reminder paused");
        } else {
            self.get(id, owner_id).await?;
        }
        Ok(applied)
    }

    /// PAUSED → SCHEDULED. Recurring reminders continue from their next
    /// occurrence after now; one-time reminders keep their time.
    pub async fn resume(&self, id: &str, owner_id: &str) -> Result<bool> {
        let current = self.get(id, owner_id).await?;
        if current.status != ReminderStatus::Paused {
            return Ok(false);
        }
        let guard = UpdateGuard::status(ReminderStatus::Paused);

        let scheduled_at = match &current.repeat {
            Some(repeat) => match recurrence::next_fire_time(repeat, Utc::now()) {
                Ok(next) if current.stop_after.is_none_or(|stop| next < stop) => next,
                Ok(_) | Err(recurrence::RecurrenceError::Exhausted(_)) => {
                    let applied = self
                        .store
                        .update(
                            id,
                            Some(owner_id),
                            &ReminderPatch::status(ReminderStatus::Completed),
                            &guard,
                        )
                        .await?;
                    if applied {
                        info!(reminder_id = %id, "Nothing left to fire, reminder completed on resume");
                    }
                    return Ok(applied);
                }
                Err(e) => return Err(e.into()),
            },
            None => current.scheduled_at,
        };

        let patch = ReminderPatch {
            status: Some(ReminderStatus::Scheduled),
            scheduled_at: Some(scheduled_at),
            ..Default::default()
        };
        if !self.store.update(id, Some(owner_id), &patch, &guard).await? {
            return Ok(false);
        }
        info!(reminder_id = %id, scheduled_at = %scheduled_at, "Reminder resumed");
        self.enqueue(id, scheduled_at).await;
        Ok(true)
    }

    /// Upcoming fire times of an expression, starting now.
    pub fn preview(&self, cron_expr: &str, n: usize) -> Result<Vec<DateTime<Utc>>> {
        Ok(recurrence::next_n_fire_times(cron_expr, Utc::now(), n)?)
    }

    /// Make sure every SCHEDULED reminder has a job, applying the overdue
    /// policy to those whose time has already passed.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let now = Utc::now();
        let mut report = ReconcileReport::default();
        let mut reminders = self.store.scan_scheduled();

        while let Some(item) = reminders.next().await {
            let reminder = match item {
                Ok(reminder) => reminder,
                Err(e) => {
                    warn!("Skipping unreadable reminder during reconciliation: {e}");
                    report.failed += 1;
                    continue;
                }
            };
            report.scanned += 1;

            if reminder.scheduled_at > now {
                self.count_enqueue(&mut report, &reminder.id, reminder.scheduled_at, |r| {
                    &mut r.enqueued
                })
                .await;
                continue;
            }

            match (self.overdue_policy, &reminder.repeat) {
                (OverduePolicy::Skip, _) => {
                    debug!(reminder_id = %reminder.id, scheduled_at = %reminder.scheduled_at, "Overdue reminder skipped");
                    report.skipped += 1;
                }
                (OverduePolicy::FireNow, _) | (OverduePolicy::Advance, None) => {
                    self.count_enqueue(&mut report, &reminder.id, reminder.scheduled_at, |r| {
                        &mut r.fired_now
                    })
                    .await;
                }
                (OverduePolicy::Advance, Some(repeat)) => {
                    self.advance(&mut report, &reminder, repeat, now).await;
                }
            }
        }

        info!(
            scanned = report.scanned,
            enqueued = report.enqueued,
            fired_now = report.fired_now,
            advanced = report.advanced,
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Roll an overdue recurring reminder forward to its next future occurrence.
    async fn advance(
        &self,
        report: &mut ReconcileReport,
        reminder: &Reminder,
        repeat: &str,
        now: DateTime<Utc>,
    ) {
        let guard = UpdateGuard::status(ReminderStatus::Scheduled)
            .with_scheduled_at(reminder.scheduled_at);
        let next = recurrence::next_fire_time(repeat, now)
            .ok()
            .filter(|next| reminder.stop_after.is_none_or(|stop| *next < stop));

        let patch = match next {
            Some(next) => ReminderPatch {
                scheduled_at: Some(next),
                ..Default::default()
            },
            None => ReminderPatch::status(ReminderStatus::Completed),
        };

        match self.store.update(&reminder.id, None, &patch, &guard).await {
            Ok(true) => match next {
                Some(next) => {
                    debug!(reminder_id = %reminder.id, next = %next, "Overdue reminder advanced");
                    self.count_enqueue(report, &reminder.id, next, |r| &mut r.advanced)
                        .await;
                }
                None => {
                    debug!(reminder_id = %reminder.id, "Overdue reminder completed");
                    report.completed += 1;
                }
            },
            Ok(false) => {
                debug!(reminder_id = %reminder.id, "Reminder changed during reconciliation");
            }
            Err(e) => {
                warn!(reminder_id = %reminder.id, "Failed to advance overdue reminder: {e}");
                report.failed += 1;
            }
        }
    }

    async fn count_enqueue(
        &self,
        report: &mut ReconcileReport,
        id: &str,
        scheduled_at: DateTime<Utc>,
        counter: impl FnOnce(&mut ReconcileReport) -> &mut usize,
    ) {
        if self.enqueue(id, scheduled_at).await {
            *counter(report) += 1;
        } else {
            report.failed += 1;
        }
    }

    /// Enqueue the firing of `id` at `scheduled_at`. Failures are logged only.
    async fn enqueue(&self, id: &str, scheduled_at: DateTime<Utc>) -> bool {
        let args = ReminderJobArgs::new(id, normalize_timestamp(scheduled_at));
        match self
            .queue
            .enqueue(PROCESS_REMINDER, args.to_value(), scheduled_at)
            .await
        {
            Ok(handle) => {
                debug!(reminder_id = %id, job_id = %handle.job_id, fire_at = %handle.fire_at, "Firing enqueued");
                true
            }
            Err(e) => {
                warn!(reminder_id = %id, "Failed to enqueue firing, reconciliation will retry: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use nudge_storage::SqliteReminderStore;
    use nudge_types::AgentType;

    use crate::testing::RecordingQueue;

    fn setup(policy: OverduePolicy) -> (Arc<SqliteReminderStore>, Arc<RecordingQueue>, ReminderScheduler) {
        let store = Arc::new(SqliteReminderStore::open_in_memory().unwrap());
        let queue = Arc::new(RecordingQueue::default());
        let scheduler = ReminderScheduler::new(store.clone(), queue.clone(), policy);
        (store, queue, scheduler)
    }

    fn static_payload() -> ReminderPayload {
        ReminderPayload::Static {
            title: "Stand-up".into(),
            body: "Daily sync".into(),
        }
    }

    fn one_time(at: DateTime<Utc>) -> CreateReminderRequest {
        CreateReminderRequest {
            agent_type: AgentType::Static,
            repeat: None,
            scheduled_at: Some(at),
            max_occurrences: None,
            stop_after: None,
            payload: static_payload(),
        }
    }

    fn recurring(repeat: &str) -> CreateReminderRequest {
        CreateReminderRequest {
            repeat: Some(repeat.into()),
            scheduled_at: None,
            ..one_time(Utc::now())
        }
    }

    #[tokio::test]
    async fn test_create_one_time_enqueues() {
        let (_store, queue, scheduler) = setup(OverduePolicy::FireNow);
        let at = Utc::now() + Duration::hours(1);
        let id = scheduler.create("u1", one_time(at)).await.unwrap();

        let reminder = scheduler.get(&id, "u1").await.unwrap();
        assert_eq!(reminder.status, ReminderStatus::Scheduled);
        assert_eq!(reminder.occurrence_count, 0);
        assert_eq!(reminder.scheduled_at, normalize_timestamp(at));

        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].reminder_id, id);
        assert_eq!(jobs[0].scheduled_for, Some(reminder.scheduled_at));
    }

    #[tokio::test]
    async fn test_create_recurring_computes_first_time() {
        let (_store, _queue, scheduler) = setup(OverduePolicy::FireNow);
        let before = Utc::now();
        let id = scheduler.create("u1", recurring("0 9 * * *")).await.unwrap();
        let reminder = scheduler.get(&id, "u1").await.unwrap();
        assert!(reminder.scheduled_at > before);
        assert_eq!(
            reminder.scheduled_at,
            recurrence::next_fire_time("0 9 * * *", before).unwrap()
        );
    }

    #[tokio::test]
    async fn test_create_validation() {
        let (store, queue, scheduler) = setup(OverduePolicy::FireNow);

        let err = scheduler.create("u1", recurring("bogus")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));

        let neither = CreateReminderRequest {
            scheduled_at: None,
            ..one_time(Utc::now())
        };
        let err = scheduler.create("u1", neither).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));

        let mismatched = CreateReminderRequest {
            agent_type: AgentType::AiAgent,
            ..one_time(Utc::now())
        };
        let err = scheduler.create("u1", mismatched).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidPayload(_)));

        let zero = CreateReminderRequest {
            max_occurrences: Some(0),
            ..recurring("0 9 * * *")
        };
        let err = scheduler.create("u1", zero).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));

        let at = Utc::now() + Duration::hours(2);
        let stop_first = CreateReminderRequest {
            stop_after: Some(at - Duration::hours(1)),
            ..one_time(at)
        };
        let err = scheduler.create("u1", stop_first).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));

        // Nothing reached the store or the queue.
        let listed = store.list(&ListRemindersQuery::for_owner("u1")).await.unwrap();
        assert!(listed.is_empty());
        assert!(queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_create_survives_enqueue_failure() {
        let (_store, queue, scheduler) = setup(OverduePolicy::FireNow);
        queue.set_failing(true);
        let id = scheduler
            .create("u1", one_time(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();
        let reminder = scheduler.get(&id, "u1").await.unwrap();
        assert_eq!(reminder.status, ReminderStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_get_is_owner_scoped() {
        let (_store, _queue, scheduler) = setup(OverduePolicy::FireNow);
        let id = scheduler
            .create("u1", one_time(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();
        let err = scheduler.get(&id, "u2").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
        let err = scheduler.cancel(&id, "u2").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
        assert_eq!(
            scheduler.get(&id, "u1").await.unwrap().status,
            ReminderStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn test_unknown_reminder_is_not_found() {
        let (_store, queue, scheduler) = setup(OverduePolicy::FireNow);
        let request = UpdateReminderRequest {
            scheduled_at: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        };
        let err = scheduler.update("missing", "u1", request).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
        let err = scheduler.cancel("missing", "u1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
        let err = scheduler.pause("missing", "u1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
        let err = scheduler.resume("missing", "u1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
        assert!(queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_other_owner_cannot_change_reminder() {
        let (_store, _queue, scheduler) = setup(OverduePolicy::FireNow);
        let id = scheduler.create("u1", recurring("0 9 * * *")).await.unwrap();

        let err = scheduler
            .update(&id, "u2", UpdateReminderRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
        let err = scheduler.pause(&id, "u2").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));

        assert!(scheduler.pause(&id, "u1").await.unwrap());
        let err = scheduler.resume(&id, "u2").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
        assert_eq!(
            scheduler.get(&id, "u1").await.unwrap().status,
            ReminderStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_update_repeat_recomputes_time() {
        let (_store, queue, scheduler) = setup(OverduePolicy::FireNow);
        let id = scheduler.create("u1", recurring("0 9 * * *")).await.unwrap();

        let before = Utc::now();
        let request = UpdateReminderRequest {
            repeat: Some("30 18 * * *".into()),
            ..Default::default()
        };
        assert!(scheduler.update(&id, "u1", request).await.unwrap());

        let reminder = scheduler.get(&id, "u1").await.unwrap();
        assert_eq!(reminder.repeat.as_deref(), Some("30 18 * * *"));
        assert_eq!(
            reminder.scheduled_at,
            recurrence::next_fire_time("30 18 * * *", before).unwrap()
        );
        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].scheduled_for, Some(reminder.scheduled_at));
    }

    #[tokio::test]
    async fn test_update_payload_only_does_not_enqueue() {
        let (_store, queue, scheduler) = setup(OverduePolicy::FireNow);
        let id = scheduler
            .create("u1", one_time(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();
        let request = UpdateReminderRequest {
            payload: Some(ReminderPayload::Static {
                title: "Renamed".into(),
                body: "New body".into(),
            }),
            ..Default::default()
        };
        assert!(scheduler.update(&id, "u1", request).await.unwrap());
        assert_eq!(queue.jobs().len(), 1);

        let wrong_type = UpdateReminderRequest {
            payload: Some(ReminderPayload::AiAgent {
                instructions: "do things".into(),
            }),
            ..Default::default()
        };
        let err = scheduler.update(&id, "u1", wrong_type).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidPayload(_)));

        let bad_repeat = UpdateReminderRequest {
            repeat: Some("nope".into()),
            ..Default::default()
        };
        let err = scheduler.update(&id, "u1", bad_repeat).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn test_update_terminal_rejected() {
        let (_store, _queue, scheduler) = setup(OverduePolicy::FireNow);
        let id = scheduler
            .create("u1", one_time(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();
        assert!(scheduler.cancel(&id, "u1").await.unwrap());

        let request = UpdateReminderRequest {
            scheduled_at: Some(Utc::now() + Duration::hours(3)),
            ..Default::default()
        };
        assert!(!scheduler.update(&id, "u1", request).await.unwrap());
        assert!(!scheduler.cancel(&id, "u1").await.unwrap());
        assert_eq!(
            scheduler.get(&id, "u1").await.unwrap().status,
            ReminderStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_update_max_occurrences_below_fired_count_rejected() {
        let (store, _queue, scheduler) = setup(OverduePolicy::FireNow);
        let id = scheduler.create("u1", recurring("0 9 * * *")).await.unwrap();
        let fired = ReminderPatch {
            occurrence_count: Some(5),
            ..Default::default()
        };
        store
            .update(&id, None, &fired, &UpdateGuard::none())
            .await
            .unwrap();

        let request = UpdateReminderRequest {
            max_occurrences: Some(2),
            ..Default::default()
        };
        let err = scheduler.update(&id, "u1", request).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        let reminder = scheduler.get(&id, "u1").await.unwrap();
        assert_eq!(reminder.max_occurrences, None);
        assert_eq!(reminder.status, ReminderStatus::Scheduled);

        let raised = UpdateReminderRequest {
            max_occurrences: Some(8),
            ..Default::default()
        };
        assert!(scheduler.update(&id, "u1", raised).await.unwrap());
        assert_eq!(scheduler.get(&id, "u1").await.unwrap().max_occurrences, Some(8));
    }

    #[tokio::test]
    async fn test_update_max_occurrences_to_fired_count_completes() {
        let (store, queue, scheduler) = setup(OverduePolicy::FireNow);
        let id = scheduler.create("u1", recurring("0 9 * * *")).await.unwrap();
        let fired = ReminderPatch {
            occurrence_count: Some(3),
            ..Default::default()
        };
        store
            .update(&id, None, &fired, &UpdateGuard::none())
            .await
            .unwrap();

        let request = UpdateReminderRequest {
            max_occurrences: Some(3),
            ..Default::default()
        };
        assert!(scheduler.update(&id, "u1", request).await.unwrap());
        let reminder = scheduler.get(&id, "u1").await.unwrap();
        assert_eq!(reminder.status, ReminderStatus::Completed);
        assert_eq!(reminder.max_occurrences, Some(3));
        assert_eq!(queue.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_resume_recurring_moves_to_future() {
        let (store, queue, scheduler) = setup(OverduePolicy::FireNow);
        let id = scheduler.create("u1", recurring("0 9 * * *")).await.unwrap();
        assert!(scheduler.pause(&id, "u1").await.unwrap());
        assert!(!scheduler.pause(&id, "u1").await.unwrap());

        // Paused long enough for the stored time to go stale.
        let overdue = ReminderPatch {
            scheduled_at: Some(Utc::now() - Duration::days(3)),
            ..Default::default()
        };
        store
            .update(&id, None, &overdue, &UpdateGuard::none())
            .await
            .unwrap();

        let now = Utc::now();
        assert!(scheduler.resume(&id, "u1").await.unwrap());
        let reminder = scheduler.get(&id, "u1").await.unwrap();
        assert_eq!(reminder.status, ReminderStatus::Scheduled);
        assert!(reminder.scheduled_at > now);
        assert_eq!(queue.jobs().last().unwrap().scheduled_for, Some(reminder.scheduled_at));

        assert!(!scheduler.resume(&id, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_one_time_keeps_time() {
        let (_store, _queue, scheduler) = setup(OverduePolicy::FireNow);
        let at = Utc::now() + Duration::hours(5);
        let id = scheduler.create("u1", one_time(at)).await.unwrap();
        assert!(scheduler.pause(&id, "u1").await.unwrap());
        assert_eq!(
            scheduler.get(&id, "u1").await.unwrap().status,
            ReminderStatus::Paused
        );
        assert!(scheduler.resume(&id, "u1").await.unwrap());
        assert_eq!(
            scheduler.get(&id, "u1").await.unwrap().scheduled_at,
            normalize_timestamp(at)
        );
    }

    #[tokio::test]
    async fn test_resume_past_stop_after_completes() {
        let (store, _queue, scheduler) = setup(OverduePolicy::FireNow);
        let id = scheduler.create("u1", recurring("0 9 * * *")).await.unwrap();
        assert!(scheduler.pause(&id, "u1").await.unwrap());
        let window_closed = ReminderPatch {
            scheduled_at: Some(Utc::now() - Duration::days(5)),
            stop_after: Some(Utc::now() - Duration::days(1)),
            ..Default::default()
        };
        store
            .update(&id, None, &window_closed, &UpdateGuard::none())
            .await
            .unwrap();

        assert!(scheduler.resume(&id, "u1").await.unwrap());
        assert_eq!(
            scheduler.get(&id, "u1").await.unwrap().status,
            ReminderStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_preview() {
        let (_store, _queue, scheduler) = setup(OverduePolicy::FireNow);
        let times = scheduler.preview("*/15 * * * *", 4).unwrap();
        assert_eq!(times.len(), 4);
        assert!(times.windows(2).all(|w| w[1] - w[0] == Duration::minutes(15)));
        assert!(scheduler.preview("whenever", 3).is_err());
    }

    async fn insert_overdue(store: &SqliteReminderStore, repeat: Option<&str>) -> String {
        store
            .insert(NewReminder {
                owner_id: "u1".into(),
                agent_type: AgentType::Static,
                payload: static_payload(),
                repeat: repeat.map(String::from),
                scheduled_at: Utc::now() - Duration::hours(30),
                max_occurrences: None,
                stop_after: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reconcile_fire_now() {
        let (store, queue, scheduler) = setup(OverduePolicy::FireNow);
        let future = scheduler
            .create("u1", one_time(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();
        let overdue = insert_overdue(&store, Some("0 9 * * *")).await;
        let paused = scheduler.create("u1", recurring("0 9 * * *")).await.unwrap();
        scheduler.pause(&paused, "u1").await.unwrap();

        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.fired_now, 1);

        let jobs = queue.jobs();
        assert!(jobs.iter().any(|j| j.reminder_id == future));
        assert!(jobs.iter().any(|j| j.reminder_id == overdue));
    }

    #[tokio::test]
    async fn test_reconcile_skip() {
        let (store, queue, scheduler) = setup(OverduePolicy::Skip);
        insert_overdue(&store, None).await;
        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_advance() {
        let (store, queue, scheduler) = setup(OverduePolicy::Advance);
        let recurring_id = insert_overdue(&store, Some("0 9 * * *")).await;
        let one_time_id = insert_overdue(&store, None).await;

        let now = Utc::now();
        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.advanced, 1);
        assert_eq!(report.fired_now, 1);

        let advanced = store.get(&recurring_id, None).await.unwrap().unwrap();
        assert!(advanced.scheduled_at > now);
        assert_eq!(advanced.status, ReminderStatus::Scheduled);

        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 2);
        let job = jobs.iter().find(|j| j.reminder_id == recurring_id).unwrap();
        assert_eq!(job.scheduled_for, Some(advanced.scheduled_at));
        assert!(jobs.iter().any(|j| j.reminder_id == one_time_id));
    }

    #[tokio::test]
    async fn test_reconcile_advance_completes_past_stop_after() {
        let (store, queue, scheduler) = setup(OverduePolicy::Advance);
        let id = insert_overdue(&store, Some("0 9 * * *")).await;
        let patch = ReminderPatch {
            stop_after: Some(Utc::now() - Duration::hours(1)),
            ..Default::default()
        };
        store.update(&id, None, &patch, &UpdateGuard::none()).await.unwrap();

        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(queue.jobs().is_empty());
        assert_eq!(
            store.get(&id, None).await.unwrap().unwrap().status,
            ReminderStatus::Completed
        );
    }
}
