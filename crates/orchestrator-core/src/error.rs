//! Facade-level failure taxonomy: glue errors from every wired crate.

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] orchestrator_config::ConfigError),
    #[error(transparent)]
    Store(#[from] orchestrator_store::StoreError),
    #[error(transparent)]
    Lock(#[from] orchestrator_lock::LockError),
    #[error(transparent)]
    Engine(#[from] orchestrator_engine::EngineError),
    #[error(transparent)]
    Dispatcher(#[from] orchestrator_dispatcher::DispatcherError),
    #[error(transparent)]
    Plan(#[from] orchestrator_plan::PlanError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("audit log error: {0}")]
    Audit(String),
    #[error("invalid schedule: {0}")]
    Validation(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
