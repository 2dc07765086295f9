use nudge_storage::StorageError;

use crate::recurrence::RecurrenceError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("reminder not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<RecurrenceError> for SchedulerError {
    fn from(err: RecurrenceError) -> Self {
        SchedulerError::InvalidSchedule(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
