//! Durable state store contract for pipelines, runs, schedules, and locks.
//!
//! This crate defines the `StateStore` trait only — the filesystem-backed
//! implementation lives in `orchestrator-storage`, so the engine and
//! dispatcher can depend on this contract without caring which backend
//! is behind it. Implementations are synchronous (the reference backend is
//! a handful of JSON files); the engine and dispatcher call through
//! `tokio::task::spawn_blocking` at their suspension points so a slow disk
//! never stalls the worker pool's other in-flight runs.

use chrono::{DateTime, Utc};
use orchestrator_types::{
    CircuitBreaker, Lock, Node, NodeResult, Pipeline, Run, RunStatus, Schedule, ScheduleRun,
};

pub use orchestrator_types::{NodeId, PipelineId, RunId, ScheduleId, ScheduleRunId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient store error, caller may retry: {0}")]
    Transient(String),
    #[error("fatal store error, caller must stop: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filter for the historical-runs query.
#[derive(Debug, Clone, Default)]
pub struct RunHistoryFilter {
    pub pipeline_id: Option<PipelineId>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
}

/// CRUD + conditional-update contract for the durable state store (C1).
///
/// Conditional updates use an optimistic-concurrency `expected_version`:
/// the write only applies if the stored record's `version` still matches,
/// otherwise [`StoreError::Conflict`] is returned and the caller re-reads.
pub trait StateStore: Send + Sync {
    // -- Pipelines --------------------------------------------------
    fn put_pipeline(&self, pipeline: &Pipeline) -> StoreResult<()>;
    fn get_pipeline(&self, id: PipelineId, version: u32) -> StoreResult<Pipeline>;
    fn latest_pipeline_version(&self, id: PipelineId) -> StoreResult<Pipeline>;
    fn find_pipeline_by_name(&self, name: &str) -> StoreResult<Option<Pipeline>>;

    // -- Runs ---------------------------------------------------------
    fn put_run(&self, run: &Run) -> StoreResult<()>;
    fn get_run(&self, id: RunId) -> StoreResult<Run>;
    fn find_run_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Run>>;
    /// CAS: apply `mutate` to the persisted run only if its `version`
    /// still equals `expected_version`; persist the bumped result.
    fn cas_update_run(
        &self,
        id: RunId,
        expected_version: u64,
        mutate: &mut dyn FnMut(&mut Run),
    ) -> StoreResult<Run>;
    fn history(&self, filter: &RunHistoryFilter, limit: usize, offset: usize) -> StoreResult<Vec<Run>>;
    /// Runs left `Running` whose owning `run.<id>` lock has expired —
    /// candidates for crash recovery on engine startup.
    fn stale_running_runs(&self) -> StoreResult<Vec<Run>>;

    // -- Node results ---------------------------------------------------
    fn put_node_result(&self, result: &NodeResult) -> StoreResult<()>;
    fn get_node_result(&self, run_id: RunId, node_id: &NodeId) -> StoreResult<Option<NodeResult>>;
    fn node_results_for_run(&self, run_id: RunId) -> StoreResult<Vec<NodeResult>>;
    fn cas_update_node_result(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        expected_version: u64,
        mutate: &mut dyn FnMut(&mut NodeResult),
    ) -> StoreResult<NodeResult>;

    // -- Circuit breakers -------------------------------------------
    fn get_breaker(&self, key: &str) -> StoreResult<Option<CircuitBreaker>>;
    fn cas_update_breaker(
        &self,
        key: &str,
        expected_version: Option<u64>,
        mutate: &mut dyn FnMut(&mut CircuitBreaker),
        default: &dyn Fn() -> CircuitBreaker,
    ) -> StoreResult<CircuitBreaker>;

    // -- Schedules --------------------------------------------------
    fn put_schedule(&self, schedule: &Schedule) -> StoreResult<()>;
    fn get_schedule(&self, id: ScheduleId) -> StoreResult<Schedule>;
    fn list_schedules(&self) -> StoreResult<Vec<Schedule>>;
    /// `enabled AND next_fire_at <= now`, ordered by `next_fire_at`,
    /// `offset`/`limit` for fair batching across ticks.
    fn due_schedules(&self, now: DateTime<Utc>, limit: usize, offset: usize) -> StoreResult<Vec<Schedule>>;
    fn cas_update_schedule(
        &self,
        id: ScheduleId,
        expected_version: u64,
        mutate: &mut dyn FnMut(&mut Schedule),
    ) -> StoreResult<Schedule>;

    // -- Schedule runs ------------------------------------------------
    fn put_schedule_run(&self, run: &ScheduleRun) -> StoreResult<()>;
    fn get_schedule_run(&self, id: ScheduleRunId) -> StoreResult<ScheduleRun>;
    fn schedule_runs_for(&self, schedule_id: ScheduleId) -> StoreResult<Vec<ScheduleRun>>;
    fn non_terminal_schedule_run(&self, schedule_id: ScheduleId) -> StoreResult<Option<ScheduleRun>>;
    fn cas_update_schedule_run(
        &self,
        id: ScheduleRunId,
        expected_version: u64,
        mutate: &mut dyn FnMut(&mut ScheduleRun),
    ) -> StoreResult<ScheduleRun>;

    // -- Locks --------------------------------------------------------
    fn get_lock(&self, key: &str) -> StoreResult<Option<Lock>>;
    fn put_lock(&self, lock: &Lock) -> StoreResult<()>;
    fn delete_lock(&self, key: &str) -> StoreResult<()>;
}

/// Human-readable label for a node's kind, used in logging.
pub fn node_label(node: &Node) -> &'static str {
    node.kind.label()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_transience() {
        assert!(StoreError::Transient("disk busy".into()).is_transient());
        assert!(!StoreError::Fatal("corrupt".into()).is_transient());
        assert!(!StoreError::Conflict("version mismatch".into()).is_transient());
    }
}
