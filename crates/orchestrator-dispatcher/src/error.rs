//! Dispatcher-visible failure taxonomy (§4.7).

use orchestrator_types::ScheduleId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatcherError {
    #[error("schedule {0} not found")]
    NotFound(ScheduleId),
    #[error("invalid schedule: {0}")]
    Validation(String),
    #[error("lost primary lock")]
    LostPrimary,
    #[error(transparent)]
    Clock(#[from] orchestrator_clock::ClockError),
    #[error(transparent)]
    Store(#[from] orchestrator_store::StoreError),
    #[error(transparent)]
    Lock(#[from] orchestrator_lock::LockError),
}

pub type DispatcherResult<T> = Result<T, DispatcherError>;
