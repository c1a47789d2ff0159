//! The Schedule Dispatcher (C7): primary election, tick loop, per-schedule
//! concurrency guard, missed-fire policy, event-triggered fires.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use orchestrator_clock::Clock;
use orchestrator_environment::InstanceId;
use orchestrator_handlers::{HandlerOutcome, HandlerRegistry};
use orchestrator_lock::{LockGuard, LockService};
use orchestrator_store::{StateStore, StoreError};
use orchestrator_types::{
    Lock, Schedule, ScheduleFailurePolicy, ScheduleRun, ScheduleRunStatus, ScheduleStatus, TriggerSpec,
};
use tokio_util::sync::CancellationToken;

use crate::error::{DispatcherError, DispatcherResult};
use crate::missed;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub instance: InstanceId,
    pub primary_lock_lease: StdDuration,
    /// How long to sleep between attempts to become primary while another
    /// instance holds `scheduler.primary`.
    pub primary_retry_interval: StdDuration,
    /// Upper bound on how long the tick loop sleeps between polls of
    /// `due_schedules`, even with nothing due.
    pub tick_max: StdDuration,
    pub due_batch_size: usize,
    /// How far `backoff` pushes `next_fire_at` after a handler failure.
    pub failure_backoff: StdDuration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            instance: InstanceId::generate(),
            primary_lock_lease: StdDuration::from_secs(30),
            primary_retry_interval: StdDuration::from_secs(5),
            tick_max: StdDuration::from_secs(1),
            due_batch_size: 100,
            failure_backoff: StdDuration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    locks: Arc<dyn LockService>,
    clock: Arc<dyn Clock>,
    handlers: Arc<HandlerRegistry>,
    bus: orchestrator_bus::EventBus,
    config: Arc<DispatcherConfig>,
    audit: Option<Arc<orchestrator_events::AuditSink>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        locks: Arc<dyn LockService>,
        clock: Arc<dyn Clock>,
        handlers: Arc<HandlerRegistry>,
        bus: orchestrator_bus::EventBus,
        config: DispatcherConfig,
    ) -> Self {
        Self { store, locks, clock, handlers, bus, config: Arc::new(config), audit: None }
    }

    /// Attach the durable audit-trail sink schedule-fire/dispatch
    /// transitions get appended to.
    pub fn with_audit(mut self, audit: Arc<orchestrator_events::AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn audit_event(&self, event: orchestrator_events::AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event);
        }
    }

    async fn store_call<T, F>(&self, f: F) -> DispatcherResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StateStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .expect("store task panicked");
        Ok(result?)
    }

    /// Scan for `ScheduleRun`s left `claimed` whose owning instance crashed
    /// before recording an outcome; mark them `missed`. Call once at
    /// startup before `run`.
    pub async fn recover(&self) -> DispatcherResult<()> {
        let schedules = self.store_call(|s| s.list_schedules()).await?;
        let now = self.clock.now();
        let staleness = chrono::Duration::from_std(self.config.primary_lock_lease * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        for schedule in schedules {
            let runs = self
                .store_call({
                    let id = schedule.id;
                    move |s| s.schedule_runs_for(id)
                })
                .await?;
            for run in runs {
                if run.status != ScheduleRunStatus::Claimed {
                    continue;
                }
                let stale = run.claim_at.map(|t| now - t > staleness).unwrap_or(true);
                if !stale {
                    continue;
                }
                let run_id = run.id;
                let version = run.version;
                self.store_call(move |s| {
                    s.cas_update_schedule_run(run_id, version, &mut |r: &mut ScheduleRun| {
                        r.status = ScheduleRunStatus::Missed;
                        r.completed_at = Some(now);
                        r.result_summary = Some("stale".to_string());
                    })
                })
                .await?;
                self.audit_event(orchestrator_events::AuditEvent::ScheduleRunStatusChanged {
                    schedule_id: schedule.id,
                    fire_at: run.fire_at,
                    to: ScheduleRunStatus::Missed,
                });
                tracing::warn!(schedule = %schedule.id, run = %run_id, "marked stale schedule run as missed during recovery");
            }
        }
        Ok(())
    }

    /// Run forever, alternating between idling (not primary) and ticking
    /// (primary), until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> DispatcherResult<()> {
        while !cancel.is_cancelled() {
            match LockGuard::acquire(
                self.locks.as_ref(),
                Lock::PRIMARY_KEY,
                self.config.instance.clone(),
                self.config.primary_lock_lease,
            )? {
                Some(guard) => {
                    tracing::info!(instance = %self.config.instance, "became primary dispatcher");
                    match self.run_as_primary(guard, &cancel).await {
                        Ok(()) => {}
                        Err(DispatcherError::LostPrimary) => {
                            tracing::warn!("lost primary lock, will re-attempt election");
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.primary_retry_interval) => {}
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_as_primary(&self, guard: LockGuard<'_>, cancel: &CancellationToken) -> DispatcherResult<()> {
        let stint_cancel = cancel.child_token();
        let event_names = self.event_schedule_names().await?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let mut listeners = tokio::task::JoinSet::new();
        for name in event_names {
            let clock = self.clock.clone();
            let tx = tx.clone();
            let token = stint_cancel.clone();
            listeners.spawn(async move {
                let mut sub = clock.subscribe_event(&name);
                while let Some(_event) = orchestrator_clock::await_event(&mut sub, &token).await {
                    if tx.send(name.clone()).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut renew_tick = tokio::time::interval(self.config.primary_lock_lease / 2);
        renew_tick.tick().await;

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            let now = self.clock.now();
            let batch = self.config.due_batch_size;
            let due = self.store_call(move |s| s.due_schedules(now, batch, 0)).await?;
            for schedule in due {
                self.dispatch_due(schedule).await?;
            }
            let wait = self.next_wake(now).await?;

            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = renew_tick.tick() => {
                    if !guard.renew(self.config.primary_lock_lease).unwrap_or(false) {
                        break Err(DispatcherError::LostPrimary);
                    }
                }
                Some(name) = rx.recv() => {
                    if let Err(e) = self.dispatch_event_schedules(&name).await {
                        break Err(e);
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        };

        stint_cancel.cancel();
        while listeners.join_next().await.is_some() {}
        result
    }

    async fn event_schedule_names(&self) -> DispatcherResult<Vec<String>> {
        let schedules = self.store_call(|s| s.list_schedules()).await?;
        let mut names: Vec<String> = schedules
            .into_iter()
            .filter(|s| s.enabled)
            .filter_map(|s| match s.trigger {
                TriggerSpec::Event { name } => Some(name),
                _ => None,
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn next_wake(&self, now: DateTime<Utc>) -> DispatcherResult<StdDuration> {
        let schedules = self.store_call(|s| s.list_schedules()).await?;
        let earliest = schedules.iter().filter(|s| s.enabled).filter_map(|s| s.next_fire_at).min();
        let wait = match earliest {
            Some(t) if t > now => (t - now).to_std().unwrap_or(self.config.tick_max),
            _ => StdDuration::ZERO,
        };
        Ok(wait.min(self.config.tick_max))
    }

    /// Claim a cron/interval/one_shot schedule found due, resolve its
    /// missed-fire policy, and dispatch every resulting instant.
    async fn dispatch_due(&self, schedule: Schedule) -> DispatcherResult<()> {
        let now = self.clock.now();
        let original = schedule.next_fire_at.unwrap_or(now);
        let decision = missed::resolve(
            self.clock.as_ref(),
            &schedule.trigger,
            original,
            now,
            schedule.missed_fire_policy,
            schedule.max_missed_backfill,
        );

        let is_one_shot = matches!(schedule.trigger, TriggerSpec::OneShot { .. });
        let schedule_id = schedule.id;
        let version = schedule.version;
        let resume_at = decision.resume_at;
        let claimed = self
            .store_call(move |s| {
                s.cas_update_schedule(schedule_id, version, &mut |sch: &mut Schedule| {
                    sch.last_fire_at = Some(now);
                    sch.next_fire_at = if is_one_shot { None } else { resume_at };
                    if is_one_shot {
                        sch.enabled = false;
                        sch.status = Some(ScheduleStatus::Completed);
                    }
                })
            })
            .await;
        let mut schedule = match claimed {
            Ok(s) => s,
            Err(DispatcherError::Store(StoreError::Conflict(_))) => return Ok(()),
            Err(e) => return Err(e),
        };

        for fire_at in decision.fire_at {
            schedule = self.dispatch_one(schedule, fire_at).await?;
        }
        Ok(())
    }

    /// Fire every enabled `event`-kind schedule subscribed to `name`.
    async fn dispatch_event_schedules(&self, name: &str) -> DispatcherResult<()> {
        let schedules = self.store_call(|s| s.list_schedules()).await?;
        let now = self.clock.now();
        for schedule in schedules {
            if !schedule.enabled {
                continue;
            }
            let matches_name = matches!(&schedule.trigger, TriggerSpec::Event { name: n } if n == name);
            if !matches_name {
                continue;
            }
            let id = schedule.id;
            let version = schedule.version;
            let claimed = self
                .store_call(move |s| {
                    s.cas_update_schedule(id, version, &mut |sch: &mut Schedule| {
                        sch.last_fire_at = Some(now);
                    })
                })
                .await;
            let schedule = match claimed {
                Ok(s) => s,
                Err(DispatcherError::Store(StoreError::Conflict(_))) => continue,
                Err(e) => return Err(e),
            };
            self.dispatch_one(schedule, now).await?;
        }
        Ok(())
    }

    /// Enforce the per-schedule concurrency guard, create a `ScheduleRun`,
    /// dispatch through the handler registry, and record the outcome.
    /// Returns the schedule, possibly updated by the failure policy.
    async fn dispatch_one(&self, schedule: Schedule, fire_at: DateTime<Utc>) -> DispatcherResult<Schedule> {
        let in_flight = self
            .store_call({
                let id = schedule.id;
                move |s| s.schedule_runs_for(id)
            })
            .await?
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .count();
        if in_flight as u32 >= schedule.max_concurrency {
            tracing::warn!(
                schedule = %schedule.id,
                fire_at = %fire_at,
                "skipping fire: schedule already at max_concurrency"
            );
            return Ok(schedule);
        }

        let run = ScheduleRun::claim(schedule.id, fire_at, self.config.instance.clone(), self.clock.now());
        self.store_call({
            let run = run.clone();
            move |s| s.put_schedule_run(&run)
        })
        .await?;
        self.bus
            .publish(
                orchestrator_bus::kind::SCHEDULE_CLAIMED,
                None,
                serde_json::json!({ "schedule_id": schedule.id.to_string(), "fire_at": fire_at }),
            )
            .await;
        self.audit_event(orchestrator_events::AuditEvent::ScheduleFired { schedule_id: schedule.id, fire_at });
        self.audit_event(orchestrator_events::AuditEvent::ScheduleRunStatusChanged {
            schedule_id: schedule.id,
            fire_at,
            to: ScheduleRunStatus::Claimed,
        });

        let handler = match self.handlers.get(schedule.action_kind) {
            Ok(h) => h.clone(),
            Err(e) => return Err(DispatcherError::Validation(e.to_string())),
        };
        let cancel = CancellationToken::new();
        let outcome = handler.dispatch(&schedule.action_payload, &cancel).await;
        let now = self.clock.now();

        match outcome {
            HandlerOutcome::Success { output, .. } => {
                self.store_call({
                    let run_id = run.id;
                    let version = run.version;
                    move |s| {
                        s.cas_update_schedule_run(run_id, version, &mut |r: &mut ScheduleRun| {
                            r.status = ScheduleRunStatus::Succeeded;
                            r.completed_at = Some(now);
                            r.result_summary = Some(output.to_string());
                        })
                    }
                })
                .await?;
                self.bus
                    .publish(
                        orchestrator_bus::kind::SCHEDULE_DISPATCHED,
                        None,
                        serde_json::json!({ "schedule_id": schedule.id.to_string() }),
                    )
                    .await;
                self.audit_event(orchestrator_events::AuditEvent::ScheduleRunStatusChanged {
                    schedule_id: schedule.id,
                    fire_at,
                    to: ScheduleRunStatus::Succeeded,
                });
                Ok(schedule)
            }
            HandlerOutcome::Transient { reason } | HandlerOutcome::Fatal { reason } => {
                self.store_call({
                    let run_id = run.id;
                    let version = run.version;
                    let reason = reason.clone();
                    move |s| {
                        s.cas_update_schedule_run(run_id, version, &mut |r: &mut ScheduleRun| {
                            r.status = ScheduleRunStatus::Failed;
                            r.completed_at = Some(now);
                            r.result_summary = Some(reason.clone());
                        })
                    }
                })
                .await?;
                self.bus
                    .publish(
                        orchestrator_bus::kind::SCHEDULE_FAILED,
                        None,
                        serde_json::json!({ "schedule_id": schedule.id.to_string(), "error": reason }),
                    )
                    .await;
                self.audit_event(orchestrator_events::AuditEvent::ScheduleRunStatusChanged {
                    schedule_id: schedule.id,
                    fire_at,
                    to: ScheduleRunStatus::Failed,
                });
                self.apply_failure_policy(schedule).await
            }
        }
    }

    async fn apply_failure_policy(&self, schedule: Schedule) -> DispatcherResult<Schedule> {
        match schedule.failure_policy {
            ScheduleFailurePolicy::RetryNextTick => Ok(schedule),
            ScheduleFailurePolicy::Disable => {
                let id = schedule.id;
                let version = schedule.version;
                self.store_call(move |s| {
                    s.cas_update_schedule(id, version, &mut |sch: &mut Schedule| {
                        sch.enabled = false;
                        sch.status = Some(ScheduleStatus::Disabled);
                    })
                })
                .await
            }
            ScheduleFailurePolicy::Backoff => {
                let id = schedule.id;
                let version = schedule.version;
                let now = self.clock.now();
                let backoff = chrono::Duration::from_std(self.config.failure_backoff)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                self.store_call(move |s| {
                    s.cas_update_schedule(id, version, &mut |sch: &mut Schedule| {
                        sch.next_fire_at = Some(now + backoff);
                    })
                })
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use orchestrator_bus::EventBus;
    use orchestrator_clock::SystemClock;
    use orchestrator_handlers::{ActionHandler, HandlerError, HandlerOutcome};
    use orchestrator_lock::FileLockService;
    use orchestrator_storage::FileSystemBackend;
    use orchestrator_types::{ActionKind, ScheduleFailurePolicy, ScheduleId, ScheduleRun, ScheduleRunStatus};
    use tempfile::tempdir;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        outcome: HandlerOutcome,
    }

    #[async_trait]
    impl ActionHandler for CountingHandler {
        fn validate(&self, _payload: &serde_json::Value) -> Result<(), HandlerError> {
            Ok(())
        }

        async fn dispatch(&self, _payload: &serde_json::Value, _cancel: &CancellationToken) -> HandlerOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn make_dispatcher(
        dir: &std::path::Path,
        outcome: HandlerOutcome,
        calls: Arc<AtomicUsize>,
        config: DispatcherConfig,
    ) -> Dispatcher {
        let store: Arc<dyn StateStore> = Arc::new(FileSystemBackend::new(dir).expect("filesystem backend"));
        let locks: Arc<dyn LockService> =
            Arc::new(FileLockService::new(dir.join("locks")).expect("file lock service"));
        let bus = EventBus::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(bus.clone()));
        let handlers = Arc::new(
            HandlerRegistry::builder()
                .register(ActionKind::SendNotification, Arc::new(CountingHandler { calls, outcome }))
                .build(),
        );
        Dispatcher::new(store, locks, clock, handlers, bus, config)
    }

    fn due_schedule(id: ScheduleId, now: DateTime<Utc>) -> Schedule {
        Schedule {
            id,
            action_kind: ActionKind::SendNotification,
            action_payload: serde_json::json!({}),
            trigger: TriggerSpec::Interval { period: orchestrator_duration::HumanDuration::from_secs(3600) },
            next_fire_at: Some(now - chrono::Duration::seconds(1)),
            last_fire_at: None,
            enabled: true,
            status: None,
            failure_policy: ScheduleFailurePolicy::RetryNextTick,
            missed_fire_policy: Default::default(),
            max_concurrency: 1,
            max_missed_backfill: 10,
            tags: Vec::new(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn run_as_primary_fires_a_due_schedule_then_stops_on_cancel() {
        let td = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let config = DispatcherConfig { tick_max: StdDuration::from_millis(20), ..DispatcherConfig::default() };
        let dispatcher = make_dispatcher(
            td.path(),
            HandlerOutcome::Success { output: serde_json::json!({}), idempotency_key: None },
            calls.clone(),
            config,
        );

        let schedule = due_schedule(ScheduleId::new(), Utc::now());
        dispatcher.store.put_schedule(&schedule).expect("seed schedule");

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(200)).await;
            cancel_clone.cancel();
        });
        dispatcher.run(cancel).await.expect("dispatcher run exits cleanly");

        assert!(calls.load(Ordering::SeqCst) >= 1);
        let runs = dispatcher.store.schedule_runs_for(schedule.id).expect("runs for schedule");
        assert!(!runs.is_empty());
        assert!(runs.iter().any(|r| r.status == ScheduleRunStatus::Succeeded));
    }

    #[tokio::test]
    async fn disabled_failure_policy_turns_off_the_schedule_after_a_failure() {
        let td = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let config = DispatcherConfig { tick_max: StdDuration::from_millis(20), ..DispatcherConfig::default() };
        let dispatcher = make_dispatcher(
            td.path(),
            HandlerOutcome::Fatal { reason: "boom".to_string() },
            calls.clone(),
            config,
        );

        let mut schedule = due_schedule(ScheduleId::new(), Utc::now());
        schedule.failure_policy = ScheduleFailurePolicy::Disable;
        dispatcher.store.put_schedule(&schedule).expect("seed schedule");

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(200)).await;
            cancel_clone.cancel();
        });
        dispatcher.run(cancel).await.expect("dispatcher run exits cleanly");

        assert!(calls.load(Ordering::SeqCst) >= 1);
        let stored = dispatcher.store.get_schedule(schedule.id).expect("schedule still present");
        assert!(!stored.enabled);
    }

    #[tokio::test]
    async fn recover_marks_stale_claimed_runs_as_missed() {
        let td = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = make_dispatcher(
            td.path(),
            HandlerOutcome::Success { output: serde_json::json!({}), idempotency_key: None },
            calls,
            DispatcherConfig::default(),
        );

        let schedule = due_schedule(ScheduleId::new(), Utc::now());
        dispatcher.store.put_schedule(&schedule).expect("seed schedule");

        let stale_claim = Utc::now() - chrono::Duration::hours(1);
        let mut run = ScheduleRun::claim(schedule.id, stale_claim, dispatcher.config.instance.clone(), stale_claim);
        run.claim_at = Some(stale_claim);
        dispatcher.store.put_schedule_run(&run).expect("seed stale run");

        dispatcher.recover().await.expect("recover succeeds");

        let recovered = dispatcher.store.get_schedule_run(run.id).expect("run still present");
        assert_eq!(recovered.status, ScheduleRunStatus::Missed);
    }
}
