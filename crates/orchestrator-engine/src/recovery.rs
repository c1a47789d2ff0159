//! Crash recovery (§4.6 "Crash recovery"): on startup, find runs left
//! `running` whose owning `run.<id>` lock has expired and either resume
//! them or mark them `failed` with reason `stale`.

use std::sync::Arc;

use chrono::Utc;
use orchestrator_store::StateStore;
use orchestrator_types::{PipelineStatus, Run, RunStatus};

use crate::error::EngineResult;

/// What recovery decided for one stale run.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Pipeline version is intact; the run was resumed (re-submitted to
    /// the worker pool, continuing from persisted `NodeResult`s).
    Resumed,
    /// The owning pipeline version is archived; the run was marked failed.
    MarkedStale,
}

/// Find runs eligible for recovery. Does not itself resume them — the
/// caller (`PipelineEngine::recover`) does that so this function stays
/// store-only and unit-testable without an engine instance.
pub async fn stale_running_runs(store: Arc<dyn StateStore>) -> EngineResult<Vec<Run>> {
    let runs = tokio::task::spawn_blocking(move || store.stale_running_runs())
        .await
        .expect("blocking task panicked")?;
    Ok(runs)
}

/// Decide whether `run`'s pipeline version can still be resumed.
pub async fn classify(store: Arc<dyn StateStore>, run: &Run) -> EngineResult<RecoveryAction> {
    let pipeline_id = run.pipeline_id;
    let version = run.pipeline_version;
    let pipeline = tokio::task::spawn_blocking(move || store.get_pipeline(pipeline_id, version))
        .await
        .expect("blocking task panicked")?;

    if pipeline.status == PipelineStatus::Archived {
        Ok(RecoveryAction::MarkedStale)
    } else {
        Ok(RecoveryAction::Resumed)
    }
}

/// Mark `run` failed with `stale` as its error summary, bumping its version.
pub async fn mark_stale(store: Arc<dyn StateStore>, run_id: orchestrator_types::RunId, expected_version: u64) -> EngineResult<()> {
    tokio::task::spawn_blocking(move || {
        store.cas_update_run(run_id, expected_version, &mut |r: &mut Run| {
            r.status = RunStatus::Failed;
            r.error_summary = Some("stale".to_string());
            r.finished_at = Some(Utc::now());
        })
    })
    .await
    .expect("blocking task panicked")?;
    Ok(())
}
