//! nudge-cron: recurring reminder scheduling.
//!
//! [`ReminderScheduler`] validates and stores reminder definitions and
//! enqueues their firings on a [`DelayedQueue`]. When a firing comes due the
//! queue runs the [`ReminderExecutor`], which dispatches the payload, notifies
//! the owner and schedules the next occurrence. [`ReminderEngine`] wires the
//! pieces together for a process.

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod notify;
pub mod queue;
pub mod recurrence;
pub mod scheduler;

pub use dispatch::{
    AgentRouter, DispatchError, DispatchOutcome, DispatchRequest, HttpAgentDispatcher,
    PayloadDispatcher, StaticDispatcher,
};
pub use engine::ReminderEngine;
pub use error::{Result, SchedulerError};
pub use executor::{FiringOutcome, ReminderExecutor};
pub use notify::{ChannelSink, LogSink, Notification, NotificationSink};
pub use queue::{DelayedQueue, HandoffQueue, JobHandler, PROCESS_REMINDER, ReminderJobArgs, TimerQueue};
pub use scheduler::{ReconcileReport, ReminderScheduler};
