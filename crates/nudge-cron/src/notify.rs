//! Notification sinks: where fired reminders end up.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

/// A delivered reminder.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub owner_id: String,
    pub reminder_id: String,
    pub title: String,
    pub body: String,
}

/// Fire-and-forget delivery. Errors are logged by the caller, never retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Writes each notification to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        info!(
            owner_id = %notification.owner_id,
            reminder_id = %notification.reminder_id,
            title = %notification.title,
            body = %notification.body,
            "Reminder delivered"
        );
        Ok(())
    }
}

/// Forwards notifications to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<Notification>) -> Self {
        Self { sender }
    }

    /// Create a sink together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        self.sender
            .send(notification)
            .map_err(|e| anyhow::anyhow!("notification receiver dropped: {}", e.0.reminder_id))
    }
}
