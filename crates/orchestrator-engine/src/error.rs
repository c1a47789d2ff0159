//! Engine-visible failure taxonomy (§4.6/§7).

use orchestrator_types::{NodeId, RunId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed for pipeline submission: {0}")]
    Validation(String),
    #[error("pipeline {0} is disabled")]
    PipelineDisabled(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("run {0} is already terminal")]
    AlreadyTerminal(RunId),
    #[error("duplicate submission, original run is {0}")]
    Conflict(RunId),
    #[error("circuit open for {0}")]
    CircuitOpen(String),
    #[error("node {node} timed out after its per-attempt budget")]
    AttemptTimeout { node: NodeId },
    #[error("run {0} exceeded its overall timeout")]
    OverallTimeout(RunId),
    #[error("run {0} was cancelled")]
    Cancelled(RunId),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal failure: {0}")]
    Fatal(String),
    #[error("waiting for run {0} timed out")]
    WaitTimeout(RunId),
    #[error(transparent)]
    Store(#[from] orchestrator_store::StoreError),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_)) || matches!(self, EngineError::Store(e) if e.is_transient())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
