//! Facade crate wiring the orchestration core into a single handle.
//!
//! [`Orchestrator::new`] builds the filesystem-backed [`StateStore`], the
//! file-based [`LockService`], the in-process [`EventBus`], the
//! [`HandlerRegistry`] for both the engine and the dispatcher, the
//! [`PipelineEngine`] (C6), and the [`Dispatcher`] (C7) from one
//! [`Config`]. [`Orchestrator::run`] drives the dispatcher's primary-election
//! loop until cancelled; the engine itself has no background loop to drive
//! (it only runs work while a `Run` is in flight).

pub mod error;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator_config::{Config, ConfigOverrides, StoreBackend};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use orchestrator_agent::AgentExecutor;
use orchestrator_bus::EventBus;
use orchestrator_clock::{Clock, SystemClock};
use orchestrator_dispatcher::{Dispatcher, DispatcherConfig};
use orchestrator_engine::{EngineConfig, PipelineEngine};
use orchestrator_environment::InstanceId;
use orchestrator_events::EventLog;
use orchestrator_handlers::{
    ActionHandler, CallApiHandler, HandlerError, HandlerOutcome, HandlerRegistry,
    HandlerRegistryBuilder, NotificationPort, RunTaskHandler, SendNotificationHandler,
    WebhookNotificationPort,
};
use orchestrator_lock::{FileLockService, LockService};
use orchestrator_sanitizer::SanitizerConfig;
use orchestrator_storage::FileSystemBackend;
use orchestrator_store::StateStore;
use orchestrator_types::{ActionKind, Pipeline, PipelineId, RunId, RunSnapshot, Schedule, ScheduleId};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Routes a dispatcher-side `execute_pipeline` action back through the
/// engine's own `submit`. Kept out of `orchestrator-handlers` so that crate
/// doesn't need a dependency on `orchestrator-engine`.
struct EngineExecutePipelineHandler {
    engine: PipelineEngine,
}

#[async_trait]
impl ActionHandler for EngineExecutePipelineHandler {
    fn validate(&self, payload: &Value) -> Result<(), HandlerError> {
        if payload.get("pipeline_id").and_then(Value::as_str).is_none() {
            return Err(HandlerError::InvalidPayload {
                kind: ActionKind::ExecutePipeline,
                reason: "missing string field `pipeline_id`".into(),
            });
        }
        Ok(())
    }

    async fn dispatch(&self, payload: &Value, _cancel: &CancellationToken) -> HandlerOutcome {
        let raw_id = payload["pipeline_id"].as_str().unwrap_or_default();
        let input = payload.get("input").cloned().unwrap_or(Value::Null);
        let pipeline_id = match raw_id.parse::<PipelineId>() {
            Ok(id) => id,
            Err(_) => return HandlerOutcome::Fatal { reason: format!("invalid pipeline_id {raw_id:?}") },
        };
        let idempotency_key = payload.get("idempotency_key").and_then(Value::as_str).map(String::from);
        match self.engine.submit(pipeline_id, input, idempotency_key).await {
            Ok(run_id) => HandlerOutcome::Success {
                output: serde_json::json!({ "run_id": run_id.to_string() }),
                idempotency_key: Some(format!("execute_pipeline:{raw_id}")),
            },
            Err(orchestrator_engine::EngineError::Conflict(run_id)) => HandlerOutcome::Success {
                output: serde_json::json!({ "run_id": run_id.to_string() }),
                idempotency_key: Some(format!("execute_pipeline:{raw_id}")),
            },
            Err(e) => HandlerOutcome::Transient { reason: e.to_string() },
        }
    }
}

/// Reject a schedule whose trigger can never fire sanely: a malformed cron
/// expression, an interval below the 1-second floor, a one-shot already in
/// the past, or an event trigger with an empty name.
fn validate_schedule(schedule: &Schedule) -> OrchestratorResult<()> {
    match &schedule.trigger {
        orchestrator_types::TriggerSpec::Cron { expr } => {
            orchestrator_clock::validate_cron(expr).map_err(|e| OrchestratorError::Validation(e.to_string()))?;
        }
        orchestrator_types::TriggerSpec::Interval { period } => {
            if period.as_duration() < std::time::Duration::from_secs(1) {
                return Err(OrchestratorError::Validation(
                    "interval period must be at least 1 second".to_string(),
                ));
            }
        }
        orchestrator_types::TriggerSpec::OneShot { fire_at } => {
            if *fire_at <= chrono::Utc::now() {
                return Err(OrchestratorError::Validation("one_shot fire_at must be in the future".to_string()));
            }
        }
        orchestrator_types::TriggerSpec::Event { name } => {
            if name.trim().is_empty() {
                return Err(OrchestratorError::Validation("event trigger name must not be empty".to_string()));
            }
        }
    }
    Ok(())
}

/// The `run_task`/`send_notification`/`call_api` handlers both the engine
/// and the dispatcher resolve action nodes/schedules through. Built twice
/// (once per registry) since `HandlerRegistry` has no shared-entry story;
/// the handlers themselves are cheap, `Arc`-wrapped ports underneath.
fn base_handlers(
    agent_executor: Arc<dyn AgentExecutor>,
    notifications: Arc<dyn NotificationPort>,
    sanitizer: SanitizerConfig,
    call_api_max_response_bytes: usize,
) -> HandlerRegistryBuilder {
    HandlerRegistry::builder()
        .register(ActionKind::RunTask, Arc::new(RunTaskHandler::new(agent_executor, sanitizer.clone())))
        .register(ActionKind::SendNotification, Arc::new(SendNotificationHandler::new(notifications)))
        .register(
            ActionKind::CallApi,
            Arc::new(CallApiHandler::new(reqwest::Client::new(), call_api_max_response_bytes, sanitizer)),
        )
}

/// The orchestration core's public entry point: one process-wide handle
/// wrapping the store, locks, bus, engine, and dispatcher built from a
/// single [`Config`]. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    pub engine: PipelineEngine,
    pub dispatcher: Arc<Dispatcher>,
    pub bus: EventBus,
    events_path: std::path::PathBuf,
}

impl Orchestrator {
    /// Build every C1-C7 component from `config`, using `agent_executor`
    /// as the Agent Executor Port for `run_task` actions. Does not start
    /// the dispatcher's tick loop — call [`Orchestrator::run`] for that,
    /// and [`Orchestrator::recover`] once at process startup beforehand.
    pub fn new(config: &Config, agent_executor: Arc<dyn AgentExecutor>) -> OrchestratorResult<Self> {
        config.validate()?;
        let StoreBackend::FileSystem { dir } = &config.store;

        let store: Arc<dyn StateStore> = Arc::new(FileSystemBackend::new(dir).map_err(OrchestratorError::Store)?);
        let locks: Arc<dyn LockService> =
            Arc::new(FileLockService::new(dir.join("locks")).map_err(OrchestratorError::Lock)?);
        let bus = EventBus::new();
        let events_path = orchestrator_events::events_path(dir);
        let audit = Arc::new(orchestrator_events::AuditSink::new(events_path.clone()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(bus.clone()));
        let instance = InstanceId::generate();

        let notifications: Arc<dyn NotificationPort> = Arc::new(WebhookNotificationPort::new(
            reqwest::Client::new(),
            config.notifications.channel_webhooks.clone(),
            config.notifications.signing_secret.clone().unwrap_or_default(),
        ));
        let sanitizer = SanitizerConfig::default();

        let dispatcher_agent_executor = agent_executor.clone();
        let engine_handlers = Arc::new(
            base_handlers(
                agent_executor.clone(),
                notifications.clone(),
                sanitizer.clone(),
                config.notifications.call_api_max_response_bytes,
            )
            .build(),
        );

        let engine = PipelineEngine::new(
            store.clone(),
            locks.clone(),
            agent_executor,
            engine_handlers,
            bus.clone(),
            EngineConfig {
                w_proc: config.worker_pool.w_proc,
                w_run: config.worker_pool.w_run,
                instance: instance.clone(),
                run_lock_lease: config.dispatcher.lock_lease.as_duration(),
            },
        )
        .with_audit(audit.clone());

        let dispatcher_handlers = Arc::new(
            base_handlers(
                dispatcher_agent_executor,
                notifications,
                sanitizer,
                config.notifications.call_api_max_response_bytes,
            )
            .register(ActionKind::ExecutePipeline, Arc::new(EngineExecutePipelineHandler { engine: engine.clone() }))
            .build(),
        );

        let mut dispatcher_config = DispatcherConfig {
            instance,
            ..DispatcherConfig::default()
        };
        dispatcher_config.primary_lock_lease = config.dispatcher.lock_lease.as_duration();
        dispatcher_config.tick_max = config.dispatcher.tick_max.as_duration();
        dispatcher_config.due_batch_size = config.dispatcher.batch_size;

        let dispatcher = Arc::new(
            Dispatcher::new(store.clone(), locks, clock, dispatcher_handlers, bus.clone(), dispatcher_config)
                .with_audit(audit),
        );

        Ok(Self { store, engine, dispatcher, bus, events_path })
    }

    /// Crash recovery for both the engine (runs left `running`) and the
    /// dispatcher (schedule runs left `claimed`). Call once at startup,
    /// before `run` or accepting new submissions.
    pub async fn recover(&self) -> OrchestratorResult<()> {
        self.engine.recover().await?;
        self.dispatcher.recover().await?;
        Ok(())
    }

    /// Drive the dispatcher's primary-election/tick loop until `cancel`
    /// fires. The engine needs no equivalent background loop.
    pub async fn run(&self, cancel: CancellationToken) -> OrchestratorResult<()> {
        self.dispatcher.run(cancel).await?;
        Ok(())
    }

    /// Validate and persist a new pipeline definition (or a new version of
    /// an existing one).
    pub fn register_pipeline(&self, pipeline: &Pipeline) -> OrchestratorResult<()> {
        orchestrator_plan::validate(pipeline)?;
        self.store.put_pipeline(pipeline).map_err(OrchestratorError::Store)?;
        Ok(())
    }

    pub fn latest_pipeline(&self, id: PipelineId) -> OrchestratorResult<Pipeline> {
        self.store.latest_pipeline_version(id).map_err(OrchestratorError::Store)
    }

    pub async fn submit_pipeline(&self, id: PipelineId, input: Value, idempotency_key: Option<String>) -> OrchestratorResult<RunId> {
        self.engine.submit(id, input, idempotency_key).await.map_err(OrchestratorError::Engine)
    }

    pub async fn run_status(&self, run_id: RunId) -> OrchestratorResult<RunSnapshot> {
        self.engine.status(run_id).await.map_err(OrchestratorError::Engine)
    }

    pub async fn cancel_run(&self, run_id: RunId) -> OrchestratorResult<bool> {
        self.engine.cancel(run_id).await.map_err(OrchestratorError::Engine)
    }

    pub async fn await_run(&self, run_id: RunId, timeout: std::time::Duration) -> OrchestratorResult<RunSnapshot> {
        self.engine.await_run(run_id, timeout).await.map_err(OrchestratorError::Engine)
    }

    /// Validate, then persist a new schedule. `next_fire_at` should already
    /// be set by the caller for `cron`/`interval`/`one_shot` triggers (the
    /// CLI resolves it via `orchestrator-clock`); event-triggered schedules
    /// leave it `None`.
    pub fn register_schedule(&self, schedule: &Schedule) -> OrchestratorResult<()> {
        validate_schedule(schedule)?;
        self.store.put_schedule(schedule).map_err(OrchestratorError::Store)
    }

    pub fn list_schedules(&self) -> OrchestratorResult<Vec<Schedule>> {
        self.store.list_schedules().map_err(OrchestratorError::Store)
    }

    pub fn set_schedule_enabled(&self, id: ScheduleId, enabled: bool) -> OrchestratorResult<Schedule> {
        let schedule = self.store.get_schedule(id).map_err(OrchestratorError::Store)?;
        self.store
            .cas_update_schedule(id, schedule.version, &mut |s| s.enabled = enabled)
            .map_err(OrchestratorError::Store)
    }

    /// Read the durable audit trail accumulated so far. The engine and
    /// dispatcher publish every transition on `self.bus`; an operator tool
    /// (or the CLI) wanting the durable copy on disk reads it here rather
    /// than racing the in-memory bus's bounded history.
    pub fn read_audit_log(&self) -> OrchestratorResult<EventLog> {
        EventLog::read_from_file(&self.events_path).map_err(|e| OrchestratorError::Audit(e.to_string()))
    }

    pub fn state_dir(&self) -> &Path {
        self.events_path.parent().unwrap_or(Path::new("."))
    }
}
