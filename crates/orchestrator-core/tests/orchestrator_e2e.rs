//! End-to-end tests driving the `Orchestrator` facade directly against a
//! temporary filesystem-backed state directory.

use std::sync::Arc;
use std::time::Duration;

use orchestrator_agent::ScriptedAgentExecutor;
use orchestrator_core::{Config, ConfigOverrides, Orchestrator};
use orchestrator_types::{PipelineStatus, RunStatus, Schedule};
use serde_json::json;
use tempfile::tempdir;

fn orchestrator(dir: &std::path::Path) -> Orchestrator {
    let config = orchestrator_config::load_config(dir, ConfigOverrides { store_dir: Some(dir.to_path_buf()), ..Default::default() })
        .expect("load config");
    Orchestrator::new(&config, Arc::new(ScriptedAgentExecutor::new())).expect("build orchestrator")
}

fn trigger_only_pipeline(id: &str) -> orchestrator_types::Pipeline {
    serde_json::from_value(json!({
        "id": id,
        "name": "demo",
        "version": 1,
        "nodes": [
            { "id": "start", "kind": { "kind": "trigger" } }
        ],
        "edges": [],
        "status": "active",
    }))
    .expect("pipeline fixture parses")
}

#[tokio::test]
async fn register_submit_and_await_a_trigger_only_pipeline() {
    let td = tempdir().unwrap();
    let orchestrator = orchestrator(td.path());

    let id = orchestrator_types::PipelineId::new();
    let pipeline = trigger_only_pipeline(&id.to_string());
    orchestrator.register_pipeline(&pipeline).expect("register pipeline");

    let fetched = orchestrator.latest_pipeline(id).expect("latest pipeline");
    assert_eq!(fetched.status, PipelineStatus::Active);

    let run_id = orchestrator.submit_pipeline(id, json!({"hello": "world"}), None).await.expect("submit");
    let snapshot = orchestrator.await_run(run_id, Duration::from_secs(5)).await.expect("await run");

    assert_eq!(snapshot.run.id, run_id);
    assert_eq!(snapshot.run.status, RunStatus::Succeeded);
    assert!(snapshot.node_errors.is_empty());
}

#[tokio::test]
async fn cancel_run_reports_true_before_status_succeeds() {
    let td = tempdir().unwrap();
    let orchestrator = orchestrator(td.path());

    let id = orchestrator_types::PipelineId::new();
    orchestrator.register_pipeline(&trigger_only_pipeline(&id.to_string())).expect("register pipeline");

    let run_id = orchestrator.submit_pipeline(id, json!(null), None).await.expect("submit");
    // Whether cancellation wins the race against the trigger-only run's
    // near-instant completion isn't deterministic; either outcome is a
    // valid status afterwards.
    let _ = orchestrator.cancel_run(run_id).await.expect("cancel does not error");
    let snapshot = orchestrator.run_status(run_id).await.expect("status after cancel");
    assert!(matches!(snapshot.run.status, RunStatus::Succeeded | RunStatus::Cancelled | RunStatus::Running));
}

#[tokio::test]
async fn schedule_register_list_and_toggle_roundtrip() {
    let td = tempdir().unwrap();
    let orchestrator = orchestrator(td.path());

    let pipeline_id = orchestrator_types::PipelineId::new();
    orchestrator.register_pipeline(&trigger_only_pipeline(&pipeline_id.to_string())).expect("register pipeline");

    let schedule: Schedule = serde_json::from_value(json!({
        "id": orchestrator_types::ScheduleId::new().to_string(),
        "action_kind": "execute_pipeline",
        "action_payload": { "pipeline_id": pipeline_id.to_string(), "input": null },
        "trigger": { "kind": "interval", "period": "1h" },
        "enabled": true,
    }))
    .expect("schedule fixture parses");
    orchestrator.register_schedule(&schedule).expect("register schedule");

    let listed = orchestrator.list_schedules().expect("list schedules");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, schedule.id);

    let disabled = orchestrator.set_schedule_enabled(schedule.id, false).expect("disable");
    assert!(!disabled.enabled);
    let enabled = orchestrator.set_schedule_enabled(schedule.id, true).expect("enable");
    assert!(enabled.enabled);
}

#[tokio::test]
async fn audit_log_starts_empty_on_a_fresh_state_dir() {
    let td = tempdir().unwrap();
    let orchestrator = orchestrator(td.path());

    // No run or schedule has ever touched this state dir, so nothing has
    // been appended to the durable audit trail yet.
    let log = orchestrator.read_audit_log().expect("read audit log");
    assert!(log.is_empty());
}

#[tokio::test]
async fn audit_log_records_run_and_node_transitions() {
    let td = tempdir().unwrap();
    let orchestrator = orchestrator(td.path());

    let id = orchestrator_types::PipelineId::new();
    orchestrator.register_pipeline(&trigger_only_pipeline(&id.to_string())).expect("register pipeline");
    let run_id = orchestrator.submit_pipeline(id, json!(null), None).await.expect("submit");
    orchestrator.await_run(run_id, Duration::from_secs(5)).await.expect("await run");

    let log = orchestrator.read_audit_log().expect("read audit log");
    assert!(!log.is_empty());
    assert!(!log.for_run(run_id).is_empty());
}

#[tokio::test]
async fn resubmitting_an_idempotency_key_returns_the_original_run() {
    let td = tempdir().unwrap();
    let orchestrator = orchestrator(td.path());

    let id = orchestrator_types::PipelineId::new();
    orchestrator.register_pipeline(&trigger_only_pipeline(&id.to_string())).expect("register pipeline");

    let first = orchestrator.submit_pipeline(id, json!(null), Some("dedup-key".to_string())).await.expect("submit");
    let err = orchestrator
        .submit_pipeline(id, json!(null), Some("dedup-key".to_string()))
        .await
        .expect_err("duplicate idempotency key must be rejected");
    match err {
        orchestrator_core::OrchestratorError::Engine(orchestrator_engine::EngineError::Conflict(run_id)) => {
            assert_eq!(run_id, first);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_run_status_returns_an_error() {
    let td = tempdir().unwrap();
    let orchestrator = orchestrator(td.path());

    let bogus = orchestrator_types::RunId::new();
    assert!(orchestrator.run_status(bogus).await.is_err());
}

#[test]
fn recover_on_a_fresh_state_dir_is_a_no_op() {
    let td = tempdir().unwrap();
    let orchestrator = orchestrator(td.path());

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    rt.block_on(orchestrator.recover()).expect("recover succeeds with no in-flight runs");
}
