//! Reminder engine: wires store, queue, dispatcher and sink together.
//!
//! Construct one per process with explicit handles, call [`ReminderEngine::start`]
//! in the process that should run reminders, and [`ReminderEngine::shutdown`]
//! before exit. Short-lived processes can use the scheduler without starting.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use nudge_config::NudgeConfig;
use nudge_storage::ReminderStore;

use crate::dispatch::PayloadDispatcher;
use crate::error::Result;
use crate::executor::ReminderExecutor;
use crate::notify::NotificationSink;
use crate::queue::{DelayedQueue, PROCESS_REMINDER};
use crate::scheduler::{ReconcileReport, ReminderScheduler};

pub struct ReminderEngine {
    scheduler: Arc<ReminderScheduler>,
    executor: Arc<ReminderExecutor>,
    queue: Arc<dyn DelayedQueue>,
    sweep_interval: Option<Duration>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ReminderEngine {
    pub fn new(
        config: &NudgeConfig,
        store: Arc<dyn ReminderStore>,
        queue: Arc<dyn DelayedQueue>,
        dispatcher: Arc<dyn PayloadDispatcher>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let scheduler = Arc::new(ReminderScheduler::new(
            store.clone(),
            queue.clone(),
            config.reconcile.overdue_policy,
        ));
        let executor = Arc::new(ReminderExecutor::new(
            store,
            queue.clone(),
            dispatcher,
            sink,
            config.retry.clone(),
        ));
        let sweep_interval =
            (config.reconcile.interval_secs > 0).then(|| Duration::from_secs(config.reconcile.interval_secs));

        Self {
            scheduler,
            executor,
            queue,
            sweep_interval,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn scheduler(&self) -> &Arc<ReminderScheduler> {
        &self.scheduler
    }

    pub fn executor(&self) -> &Arc<ReminderExecutor> {
        &self.executor
    }

    /// Register the executor, reconcile once and start the periodic sweep.
    pub async fn start(&self) -> Result<ReconcileReport> {
        self.queue
            .register(PROCESS_REMINDER, self.executor.clone());
        let report = self.scheduler.reconcile().await?;

        if let Some(interval) = self.sweep_interval {
            let scheduler = self.scheduler.clone();
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move {
                info!(interval_secs = interval.as_secs(), "Reconciliation sweep started");
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = scheduler.reconcile().await {
                                warn!("Reconciliation sweep failed: {e}");
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
                info!("Reconciliation sweep stopped");
            });
        }

        info!("Reminder engine started");
        Ok(report)
    }

    /// Stop the sweep, then the queue.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.queue.shutdown().await;
        info!("Reminder engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use nudge_storage::{NewReminder, SqliteReminderStore};
    use nudge_types::{AgentType, CreateReminderRequest, ReminderPayload, ReminderStatus};

    use crate::dispatch::StaticDispatcher;
    use crate::notify::ChannelSink;
    use crate::queue::TimerQueue;

    fn payload(title: &str) -> ReminderPayload {
        ReminderPayload::Static {
            title: title.into(),
            body: "body".into(),
        }
    }

    fn engine(
        store: Arc<SqliteReminderStore>,
        interval_secs: u64,
    ) -> (
        ReminderEngine,
        tokio::sync::mpsc::UnboundedReceiver<crate::notify::Notification>,
    ) {
        let mut config = NudgeConfig::default();
        config.reconcile.interval_secs = interval_secs;
        let (sink, rx) = ChannelSink::channel();
        let engine = ReminderEngine::new(
            &config,
            store,
            Arc::new(TimerQueue::new(2)),
            Arc::new(StaticDispatcher),
            Arc::new(sink),
        );
        (engine, rx)
    }

    #[tokio::test]
    async fn test_created_reminder_fires_end_to_end() {
        let store = Arc::new(SqliteReminderStore::open_in_memory().unwrap());
        let (engine, mut rx) = engine(store.clone(), 0);
        engine.start().await.unwrap();

        let id = engine
            .scheduler()
            .create(
                "u1",
                CreateReminderRequest {
                    agent_type: AgentType::Static,
                    repeat: None,
                    scheduled_at: Some(Utc::now()),
                    max_occurrences: None,
                    stop_after: None,
                    payload: payload("Now"),
                },
            )
            .await
            .unwrap();

        let note = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.reminder_id, id);
        assert_eq!(note.title, "Now");

        engine.shutdown().await;
        let done = store.get(&id, None).await.unwrap().unwrap();
        assert_eq!(done.status, ReminderStatus::Completed);
    }

    #[tokio::test]
    async fn test_start_picks_up_existing_reminders() {
        let store = Arc::new(SqliteReminderStore::open_in_memory().unwrap());
        // Written by another process while no engine was running.
        let id = store
            .insert(NewReminder {
                owner_id: "u1".into(),
                agent_type: AgentType::Static,
                payload: payload("Missed"),
                repeat: None,
                scheduled_at: Utc::now() - ChronoDuration::minutes(10),
                max_occurrences: None,
                stop_after: None,
            })
            .await
            .unwrap();

        let (engine, mut rx) = engine(store.clone(), 0);
        let report = engine.start().await.unwrap();
        assert_eq!(report.fired_now, 1);

        let note = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.reminder_id, id);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_picks_up_reminders_added_later() {
        let store = Arc::new(SqliteReminderStore::open_in_memory().unwrap());
        let (engine, mut rx) = engine(store.clone(), 1);
        let report = engine.start().await.unwrap();
        assert_eq!(report.scanned, 0);

        let id = store
            .insert(NewReminder {
                owner_id: "u1".into(),
                agent_type: AgentType::Static,
                payload: payload("Later"),
                repeat: None,
                scheduled_at: Utc::now(),
                max_occurrences: None,
                stop_after: None,
            })
            .await
            .unwrap();

        let note = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.reminder_id, id);
        engine.shutdown().await;
    }
}
