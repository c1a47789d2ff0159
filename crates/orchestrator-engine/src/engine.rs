//! The Pipeline Engine (C6): DAG traversal, bounded concurrency, retries,
//! circuit breakers, timeouts, cancellation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use orchestrator_agent::AgentExecutor;
use orchestrator_environment::InstanceId;
use orchestrator_execution::{breaker_admits, breaker_record_failure, breaker_record_success, run_with_retry, AttemptError, Outcome};
use orchestrator_handlers::HandlerRegistry;
use orchestrator_lock::{LockGuard, LockService};
use orchestrator_plan::{self as plan};
use orchestrator_store::{StateStore, StoreError};
use orchestrator_types::{
    CircuitBreaker, EdgeGuard, FailureMode, Lock, Node, NodeId, NodeResult, NodeStatus, Pipeline, PipelineId, Run, RunId,
    RunSnapshot, RunStatus,
};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::evaluators::evaluate_attempt;

/// Tunables that aren't part of a single node's policy: the engine's own
/// worker pool widths and this instance's lock ownership identity.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Process-wide ready-node worker pool width.
    pub w_proc: usize,
    /// Per-run concurrency cap.
    pub w_run: usize,
    pub instance: InstanceId,
    pub run_lock_lease: StdDuration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            w_proc: 64,
            w_run: 8,
            instance: InstanceId::generate(),
            run_lock_lease: StdDuration::from_secs(30),
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    done: Arc<Notify>,
}

/// The engine handle. Cheap to clone (everything inside is `Arc`-wrapped);
/// typically held once per process and shared with the dispatcher and CLI.
#[derive(Clone)]
pub struct PipelineEngine {
    store: Arc<dyn StateStore>,
    locks: Arc<dyn LockService>,
    agent_executor: Arc<dyn AgentExecutor>,
    handlers: Arc<HandlerRegistry>,
    bus: orchestrator_bus::EventBus,
    config: Arc<EngineConfig>,
    proc_semaphore: Arc<Semaphore>,
    run_handles: Arc<AsyncMutex<BTreeMap<RunId, Arc<RunHandle>>>>,
    audit: Option<Arc<orchestrator_events::AuditSink>>,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        locks: Arc<dyn LockService>,
        agent_executor: Arc<dyn AgentExecutor>,
        handlers: Arc<HandlerRegistry>,
        bus: orchestrator_bus::EventBus,
        config: EngineConfig,
    ) -> Self {
        let proc_semaphore = Arc::new(Semaphore::new(config.w_proc));
        Self {
            store,
            locks,
            agent_executor,
            handlers,
            bus,
            config: Arc::new(config),
            proc_semaphore,
            run_handles: Arc::new(AsyncMutex::new(BTreeMap::new())),
            audit: None,
        }
    }

    /// Attach the durable audit-trail sink every run/node transition gets
    /// appended to. Without one, transitions are still published on `bus`
    /// but never durably recorded.
    pub fn with_audit(mut self, audit: Arc<orchestrator_events::AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn audit_event(&self, event: orchestrator_events::AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event);
        }
    }

    async fn store_call<T, F>(&self, f: F) -> EngineResult<T>
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

    /// Validate and persist a new pipeline submission, then spawn its
    /// execution task. A repeated `idempotency_key` short-circuits to the
    /// original run instead of starting a second one.
    pub async fn submit(&self, pipeline_id: PipelineId, input: Value, idempotency_key: Option<String>) -> EngineResult<RunId> {
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.store_call({
                let key = key.clone();
                move |s| s.find_run_by_idempotency_key(&key)
            })
            .await?
            {
                return Err(EngineError::Conflict(existing.id));
            }
        }

        let pipeline = self
            .store_call(move |s| s.latest_pipeline_version(pipeline_id))
            .await?;

        if !pipeline.is_active() {
            return Err(EngineError::PipelineDisabled(pipeline.name.clone()));
        }
        plan::validate(&pipeline).map_err(|e| EngineError::Validation(e.to_string()))?;
        validate_policies(&pipeline)?;

        let mut run = Run::new(pipeline.id, pipeline.version, input);
        run.idempotency_key = idempotency_key;
        let run_id = run.id;
        self.store_call({
            let run = run.clone();
            move |s| s.put_run(&run)
        })
        .await?;
        self.audit_event(orchestrator_events::AuditEvent::RunCreated {
            run_id,
            pipeline_id: pipeline.id,
            pipeline_version: pipeline.version,
        });

        self.spawn_run(pipeline, run).await;
        Ok(run_id)
    }

    /// Request cancellation of `run_id`. Returns `true` if the run was
    /// non-terminal and the cancel flag was set.
    pub async fn cancel(&self, run_id: RunId) -> EngineResult<bool> {
        let run = self.store_call(move |s| s.get_run(run_id)).await?;
        if run.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(run_id));
        }
        let version = run.version;
        self.store_call(move |s| {
            s.cas_update_run(run_id, version, &mut |r: &mut Run| {
                r.cancel_requested = true;
            })
        })
        .await?;

        let handles = self.run_handles.lock().await;
        if let Some(handle) = handles.get(&run_id) {
            handle.cancel.cancel();
        }
        Ok(true)
    }

    pub async fn status(&self, run_id: RunId) -> EngineResult<RunSnapshot> {
        self.snapshot(run_id).await
    }

    /// Block until `run_id` reaches a terminal state or `timeout` elapses.
    pub async fn await_run(&self, run_id: RunId, timeout: StdDuration) -> EngineResult<RunSnapshot> {
        let snapshot = self.snapshot(run_id).await?;
        if snapshot.run.status.is_terminal() {
            return Ok(snapshot);
        }

        let notify = {
            let handles = self.run_handles.lock().await;
            handles.get(&run_id).map(|h| h.done.clone())
        };
        match notify {
            Some(notify) => match tokio::time::timeout(timeout, notify.notified()).await {
                Ok(()) => self.snapshot(run_id).await,
                Err(_) => Err(EngineError::WaitTimeout(run_id)),
            },
            // Not (or no longer) in-memory: either already finished before
            // we looked, or this process didn't start it (post-recovery).
            None => {
                let snapshot = self.snapshot(run_id).await?;
                if snapshot.run.status.is_terminal() {
                    Ok(snapshot)
                } else {
                    Err(EngineError::WaitTimeout(run_id))
                }
            }
        }
    }

    async fn snapshot(&self, run_id: RunId) -> EngineResult<RunSnapshot> {
        let run = self.store_call(move |s| s.get_run(run_id)).await?;
        let results = self.store_call(move |s| s.node_results_for_run(run_id)).await?;
        let mut node_statuses = BTreeMap::new();
        let mut node_errors = Vec::new();
        for r in results {
            node_statuses.insert(r.node_id.clone(), r.status);
            if let Some(message) = &r.error {
                node_errors.push(orchestrator_types::NodeErrorEntry {
                    node_id: r.node_id.clone(),
                    kind: format!("{:?}", r.status),
                    message: message.clone(),
                    attempt_count: r.attempts,
                    last_attempt_at: r.finished_at,
                });
            }
        }
        Ok(RunSnapshot { run, node_statuses, node_errors })
    }

    /// Scan for runs crashed mid-flight and either resume or fail them.
    /// Call once at process startup before accepting new submissions.
    pub async fn recover(&self) -> EngineResult<()> {
        let stale = crate::recovery::stale_running_runs(self.store.clone()).await?;
        for run in stale {
            match crate::recovery::classify(self.store.clone(), &run).await? {
                crate::recovery::RecoveryAction::MarkedStale => {
                    crate::recovery::mark_stale(self.store.clone(), run.id, run.version).await?;
                }
                crate::recovery::RecoveryAction::Resumed => {
                    let pipeline = self
                        .store_call({
                            let pipeline_id = run.pipeline_id;
                            let version = run.pipeline_version;
                            move |s| s.get_pipeline(pipeline_id, version)
                        })
                        .await?;
                    self.spawn_run(pipeline, run).await;
                }
            }
        }
        Ok(())
    }

    async fn spawn_run(&self, pipeline: Pipeline, run: Run) {
        let run_id = run.id;
        let cancel = CancellationToken::new();
        let done = Arc::new(Notify::new());
        {
            let mut handles = self.run_handles.lock().await;
            handles.insert(run_id, Arc::new(RunHandle { cancel: cancel.clone(), done: done.clone() }));
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .bus
                .publish(
                    orchestrator_bus::kind::RUN_STARTED,
                    Some(run_id),
                    serde_json::json!({ "pipeline_id": pipeline.id.to_string() }),
                )
                .await;
            let outcome = engine.run_to_completion(&pipeline, run, cancel).await;
            if let Err(e) = outcome {
                tracing::warn!(run = %run_id, error = %e, "run task ended with an engine error");
            }
            engine.bus.publish(orchestrator_bus::kind::RUN_FINISHED, Some(run_id), serde_json::json!({})).await;
            done.notify_waiters();
            engine.run_handles.lock().await.remove(&run_id);
        });
    }

    /// The traversal algorithm (§4.6, steps 1-5).
    async fn run_to_completion(&self, pipeline: &Pipeline, mut run: Run, cancel: CancellationToken) -> EngineResult<()> {
        let run_id = run.id;
        let lock_key = Lock::run_key(run_id);
        let _run_lock = LockGuard::acquire(self.locks.as_ref(), lock_key.clone(), self.config.instance.clone(), self.config.run_lock_lease)
            .map_err(|e| EngineError::Transient(e.to_string()))?
            .ok_or_else(|| EngineError::Transient(format!("run lock {lock_key} held by another instance")))?;

        let previous_status = run.status;
        let version = run.version;
        run = self
            .store_call(move |s| {
                s.cas_update_run(run_id, version, &mut |r: &mut Run| {
                    r.status = RunStatus::Running;
                    r.started_at = Some(Utc::now());
                })
            })
            .await?;
        self.audit_event(orchestrator_events::AuditEvent::RunStatusChanged {
            run_id,
            from: previous_status,
            to: RunStatus::Running,
        });

        let overall_timeout = pipeline.default_policy.overall_timeout;
        let deadline = tokio::time::sleep(overall_timeout);
        tokio::pin!(deadline);

        // Resume support: load whatever `NodeResult`s already made it to
        // disk before a prior crash, so the replay pass below can fold
        // them into the traversal instead of re-executing (and
        // overwriting) already-terminal nodes.
        let existing_results: BTreeMap<NodeId, NodeResult> = self
            .store_call(move |s| s.node_results_for_run(run_id))
            .await?
            .into_iter()
            .map(|r| (r.node_id.clone(), r))
            .collect();

        let mut traversal = Traversal::new(pipeline);
        let run_sem = Arc::new(Semaphore::new(self.config.w_run.max(1)));
        let mut in_flight: tokio::task::JoinSet<(NodeId, NodeOutcome)> = tokio::task::JoinSet::new();

        // Trigger nodes are never scheduled as worker tasks; queue them
        // alongside whatever other in-degree-0 nodes `Traversal::new`
        // already seeded so the replay pass below handles both uniformly.
        for node in &pipeline.nodes {
            if matches!(node.kind, orchestrator_types::NodeKind::Trigger) && traversal.in_degree(&node.id) == 0 {
                traversal.enqueue(node.id.clone());
            }
        }

        // Replay pass: drain the ready queue, resolving each node from its
        // persisted `NodeResult` when one exists (triggers get a fresh one
        // synthesized from the run's input, since they're never executed
        // for real) rather than scheduling it for execution. Nodes this
        // replays as succeeded enqueue their own successors the normal
        // way, so a resumed run's frontier surfaces here exactly as it
        // would have on a fresh run — only nodes with no persisted result
        // are left in `pending_execution` for the worker loop below.
        let mut pending_execution = VecDeque::new();
        while let Some(node_id) = traversal.pop_ready() {
            let node = pipeline.node(&node_id).expect("ready node exists in pipeline").clone();
            let is_trigger = matches!(node.kind, orchestrator_types::NodeKind::Trigger);

            let resolved = if let Some(existing) = existing_results.get(&node_id) {
                Some(existing.clone())
            } else if is_trigger {
                let now = Utc::now();
                let result = NodeResult {
                    run_id,
                    node_id: node_id.clone(),
                    status: NodeStatus::Succeeded,
                    attempts: 0,
                    started_at: Some(now),
                    finished_at: Some(now),
                    output: Some(run.input.clone()),
                    error: None,
                    version: 0,
                };
                self.store_call({
                    let result = result.clone();
                    move |s| s.put_node_result(&result)
                })
                .await?;
                Some(result)
            } else {
                None
            };

            match resolved {
                None => pending_execution.push_back(node_id),
                Some(result) if result.status == NodeStatus::Succeeded => {
                    let bool_tag = if matches!(node.kind, orchestrator_types::NodeKind::Condition { .. }) {
                        result.output.as_ref().and_then(Value::as_bool)
                    } else {
                        None
                    };
                    traversal.record_output(&node_id, result.output.clone(), bool_tag);
                    let mut ready = Vec::new();
                    let skipped = traversal.propagate_success(pipeline, &node_id, |n| ready.push(n));
                    self.persist_skipped(run_id, &skipped).await?;
                    for n in ready {
                        traversal.enqueue(n);
                    }
                }
                Some(result) if result.status == NodeStatus::Skipped => {
                    // A node only reaches `ready` here via a satisfied
                    // guard or as an initial orphan/trigger, neither of
                    // which a skip cascade can produce, so this arm is
                    // unreachable in practice; no-op defensively rather
                    // than re-deriving a cascade that already ran.
                }
                Some(result) => {
                    // Terminal but not succeeded: a prior failure (or a
                    // cancellation, recorded the same way) whose
                    // downstream consequences we need to replay.
                    let was_cancelled = result.status == NodeStatus::Failed && result.error.as_deref() == Some("cancelled");
                    if was_cancelled {
                        traversal.mark_fatal_failure();
                    } else {
                        match node_failure_mode(pipeline, &node) {
                            FailureMode::FailRun => {
                                traversal.mark_fatal_failure();
                                cancel.cancel();
                            }
                            FailureMode::SkipBranch | FailureMode::Continue => {
                                let skipped = traversal.skip_descendants(pipeline, &node_id);
                                self.persist_skipped(run_id, &skipped).await?;
                            }
                        }
                    }
                }
            }
        }
        for node_id in pending_execution {
            traversal.enqueue(node_id);
        }

        let mut renew_tick = tokio::time::interval(self.config.run_lock_lease / 2);
        renew_tick.tick().await;

        loop {
            while let Some(node_id) = traversal.pop_ready() {
                let node = pipeline.node(&node_id).expect("ready node exists in pipeline").clone();
                let engine = self.clone();
                let run_input = run.input.clone();
                let upstream = traversal.upstream_outputs(pipeline, &node_id);
                let cancel = cancel.clone();
                let proc_permit_fut = self.proc_semaphore.clone();
                let run_permit_fut = run_sem.clone();
                let default_policy = pipeline.default_policy;
                let pipeline_id = pipeline.id;

                in_flight.spawn(async move {
                    let _proc_permit = proc_permit_fut.acquire_owned().await;
                    let _run_permit = run_permit_fut.acquire_owned().await;
                    let outcome = engine.execute_node(run_id, pipeline_id, &node, &run_input, &upstream, default_policy, &cancel).await;
                    (node_id, outcome)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut deadline => {
                    cancel.cancel();
                    run = self.finalize(run, RunStatus::TimedOut, &mut in_flight).await?;
                    return Ok(());
                }
                _ = renew_tick.tick() => {
                    if !_run_lock.renew(self.config.run_lock_lease).unwrap_or(false) {
                        tracing::warn!(run = %run_id, "failed to renew run lock, another instance may take over");
                    }
                    continue;
                }
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (node_id, outcome) = joined.expect("node task panicked");
                    self.apply_node_outcome(pipeline, &mut traversal, &mut run, &node_id, outcome, &cancel).await?;
                }
            }

            if run.cancel_requested && !cancel.is_cancelled() {
                cancel.cancel();
            }
        }

        let final_status = if traversal.any_fatal_failure() {
            RunStatus::Failed
        } else if cancel.is_cancelled() && run.cancel_requested {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        };
        self.finalize(run, final_status, &mut in_flight).await?;
        Ok(())
    }

    async fn execute_node(
        &self,
        run_id: RunId,
        pipeline_id: PipelineId,
        node: &Node,
        run_input: &Value,
        upstream: &BTreeMap<NodeId, Value>,
        default_policy: orchestrator_policy::EffectivePolicy,
        cancel: &CancellationToken,
    ) -> NodeOutcome {
        let policy = node.effective_policy(&default_policy);
        let breaker_key = CircuitBreaker::node_key(pipeline_id, &node.id);

        let mut breaker = match self
            .store_call({
                let key = breaker_key.clone();
                let threshold = policy.breaker.cb_threshold;
                let cooldown = orchestrator_duration::HumanDuration::new(policy.breaker.cb_cooldown);
                move |s| {
                    s.cas_update_breaker(&key, None, &mut |_b: &mut CircuitBreaker| {}, &move || {
                        CircuitBreaker::closed(key.clone(), threshold, cooldown)
                    })
                }
            })
            .await
        {
            Ok(b) => b,
            Err(e) => return NodeOutcome::Failed(e.to_string()),
        };

        if !breaker_admits(&mut breaker, Utc::now()) {
            return NodeOutcome::CircuitOpen;
        }

        let node = node.clone();
        let run_input = run_input.clone();
        let upstream = upstream.clone();
        let agent_executor = self.agent_executor.clone();
        let handlers = self.handlers.clone();
        let cancel_for_attempt = cancel.clone();

        let per_attempt_timeout = policy.per_attempt_timeout;
        let outcome = run_with_retry(
            &policy.retry,
            move |_attempt| {
                let node = node.clone();
                let run_input = run_input.clone();
                let upstream = upstream.clone();
                let agent_executor = agent_executor.clone();
                let handlers = handlers.clone();
                let cancel = cancel_for_attempt.clone();
                async move {
                    match tokio::time::timeout(
                        per_attempt_timeout,
                        evaluate_attempt(&node, &run_input, &upstream, &agent_executor, &handlers, &cancel),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(AttemptError::Timeout),
                    }
                }
            },
            |d| tokio::time::sleep(d),
        )
        .await;

        let now = Utc::now();
        match &outcome {
            Outcome::Success(_) => breaker_record_success(&mut breaker),
            Outcome::Transient(_) | Outcome::Timeout => {
                breaker_record_failure(&mut breaker, now, policy.breaker.cb_cooldown)
            }
            _ => {}
        }
        let _ = self
            .store_call({
                let key = breaker_key.clone();
                let expected = breaker.version;
                let state = breaker.state;
                let consecutive_failures = breaker.consecutive_failures;
                let opened_at = breaker.opened_at;
                let next_probe_at = breaker.next_probe_at;
                let default_breaker = breaker.clone();
                move |s| {
                    s.cas_update_breaker(
                        &key,
                        Some(expected),
                        &mut move |b: &mut CircuitBreaker| {
                            b.state = state;
                            b.consecutive_failures = consecutive_failures;
                            b.opened_at = opened_at;
                            b.next_probe_at = next_probe_at;
                        },
                        &move || default_breaker.clone(),
                    )
                }
            })
            .await;

        match outcome {
            Outcome::Success(eval) => NodeOutcome::Success(eval.output, eval.bool_tag),
            Outcome::Transient(m) => NodeOutcome::Failed(m),
            Outcome::Fatal(m) => NodeOutcome::Failed(m),
            Outcome::CircuitOpen => NodeOutcome::CircuitOpen,
            Outcome::Timeout => NodeOutcome::Failed("attempt timed out".to_string()),
            Outcome::Cancelled => NodeOutcome::Cancelled,
        }
    }

    async fn apply_node_outcome(
        &self,
        pipeline: &Pipeline,
        traversal: &mut Traversal,
        run: &mut Run,
        node_id: &NodeId,
        outcome: NodeOutcome,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let run_id = run.id;
        let node = pipeline.node(node_id).expect("node exists");
        let now = Utc::now();

        match outcome {
            NodeOutcome::Success(output, bool_tag) => {
                let result = NodeResult {
                    run_id,
                    node_id: node_id.clone(),
                    status: NodeStatus::Succeeded,
                    attempts: 1,
                    started_at: Some(now),
                    finished_at: Some(now),
                    output: output.clone(),
                    error: None,
                    version: 0,
                };
                self.store_call({
                    let result = result.clone();
                    move |s| s.put_node_result(&result)
                })
                .await?;
                self.bus
                    .publish(
                        orchestrator_bus::kind::RUN_NODE_SUCCEEDED,
                        Some(run_id),
                        serde_json::json!({ "node_id": node_id.0 }),
                    )
                    .await;
                self.audit_event(orchestrator_events::AuditEvent::NodeStatusChanged {
                    run_id,
                    node_id: node_id.clone(),
                    from: NodeStatus::Running,
                    to: NodeStatus::Succeeded,
                    attempt: result.attempts,
                });
                traversal.record_output(node_id, output, bool_tag);
                let mut ready = Vec::new();
                let skipped = traversal.propagate_success(pipeline, node_id, |n| ready.push(n));
                self.persist_skipped(run_id, &skipped).await?;
                for n in ready {
                    traversal.enqueue(n);
                }
            }
            NodeOutcome::Cancelled => {
                let result = NodeResult {
                    run_id,
                    node_id: node_id.clone(),
                    status: NodeStatus::Failed,
                    attempts: 1,
                    started_at: Some(now),
                    finished_at: Some(now),
                    output: None,
                    error: Some("cancelled".to_string()),
                    version: 0,
                };
                self.store_call(move |s| s.put_node_result(&result)).await?;
                self.audit_event(orchestrator_events::AuditEvent::NodeStatusChanged {
                    run_id,
                    node_id: node_id.clone(),
                    from: NodeStatus::Running,
                    to: NodeStatus::Failed,
                    attempt: 1,
                });
                traversal.mark_fatal_failure();
            }
            NodeOutcome::CircuitOpen | NodeOutcome::Failed(_) => {
                let message = match &outcome {
                    NodeOutcome::CircuitOpen => "circuit open".to_string(),
                    NodeOutcome::Failed(m) => m.clone(),
                    _ => unreachable!(),
                };
                let result = NodeResult {
                    run_id,
                    node_id: node_id.clone(),
                    status: NodeStatus::Failed,
                    attempts: 1,
                    started_at: Some(now),
                    finished_at: Some(now),
                    output: None,
                    error: Some(message.clone()),
                    version: 0,
                };
                self.store_call({
                    let result = result.clone();
                    move |s| s.put_node_result(&result)
                })
                .await?;
                self.bus
                    .publish(
                        orchestrator_bus::kind::RUN_NODE_FAILED,
                        Some(run_id),
                        serde_json::json!({ "node_id": node_id.0, "error": message }),
                    )
                    .await;
                self.audit_event(orchestrator_events::AuditEvent::NodeStatusChanged {
                    run_id,
                    node_id: node_id.clone(),
                    from: NodeStatus::Running,
                    to: NodeStatus::Failed,
                    attempt: result.attempts,
                });

                match node_failure_mode(pipeline, node) {
                    FailureMode::FailRun => {
                        traversal.mark_fatal_failure();
                        cancel.cancel();
                    }
                    FailureMode::SkipBranch | FailureMode::Continue => {
                        let skipped = traversal.skip_descendants(pipeline, node_id);
                        self.persist_skipped(run_id, &skipped).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Persist a `Skipped` `NodeResult` for every id in `node_ids` — both a
    /// direct guard-skip and the transitive descendants a skip cascades
    /// into need a durable record, or a resumed run can't tell "skipped"
    /// apart from "never reached" when replaying from disk.
    async fn persist_skipped(&self, run_id: RunId, node_ids: &[NodeId]) -> EngineResult<()> {
        for node_id in node_ids {
            let result = NodeResult {
                run_id,
                node_id: node_id.clone(),
                status: NodeStatus::Skipped,
                attempts: 0,
                started_at: None,
                finished_at: Some(Utc::now()),
                output: None,
                error: None,
                version: 0,
            };
            self.store_call(move |s| s.put_node_result(&result)).await?;
            self.audit_event(orchestrator_events::AuditEvent::NodeStatusChanged {
                run_id,
                node_id: node_id.clone(),
                from: NodeStatus::Pending,
                to: NodeStatus::Skipped,
                attempt: 0,
            });
        }
        Ok(())
    }

    async fn finalize(&self, run: Run, status: RunStatus, in_flight: &mut tokio::task::JoinSet<(NodeId, NodeOutcome)>) -> EngineResult<Run> {
        // Bounded drain: give in-flight evaluators a chance to unwind
        // cooperatively before we finalize the run record.
        let drain = tokio::time::timeout(StdDuration::from_secs(5), async {
            while in_flight.join_next().await.is_some() {}
        });
        let _ = drain.await;

        let run_id = run.id;
        let previous_status = run.status;
        let version = run.version;
        let updated = self
            .store_call(move |s| {
                s.cas_update_run(run_id, version, &mut |r: &mut Run| {
                    r.status = status;
                    r.finished_at = Some(Utc::now());
                })
            })
            .await?;
        self.audit_event(orchestrator_events::AuditEvent::RunStatusChanged {
            run_id,
            from: previous_status,
            to: status,
        });
        Ok(updated)
    }
}

fn node_failure_mode(pipeline: &Pipeline, _node: &Node) -> FailureMode {
    pipeline.default_failure_mode
}

/// Reject a submission whose policy bounds can never be satisfied: a zero
/// per-attempt timeout, an overall timeout shorter than it, or a breaker
/// threshold of zero, on the pipeline default or any node's merged override.
fn validate_policies(pipeline: &Pipeline) -> EngineResult<()> {
    pipeline
        .default_policy
        .validate()
        .map_err(|e| EngineError::Validation(format!("default policy: {e}")))?;
    for node in &pipeline.nodes {
        node.effective_policy(&pipeline.default_policy)
            .validate()
            .map_err(|e| EngineError::Validation(format!("node {}: {e}", node.id.0)))?;
    }
    Ok(())
}

/// What running one node to terminal outcome produced.
#[derive(Debug, Clone)]
enum NodeOutcome {
    Success(Option<Value>, Option<bool>),
    Failed(String),
    CircuitOpen,
    Cancelled,
}

/// In-memory traversal bookkeeping for a single run: outstanding
/// predecessor counts, per-node outputs/bool-tags, and the ready queue.
/// Touched only by the single task owning this run (§5's "no locking
/// needed" guarantee), so no synchronization here.
struct Traversal {
    remaining: BTreeMap<NodeId, usize>,
    satisfied: BTreeMap<NodeId, bool>,
    outputs: BTreeMap<NodeId, Value>,
    bool_tags: BTreeMap<NodeId, Option<bool>>,
    ready: VecDeque<NodeId>,
    skipped: BTreeSet<NodeId>,
    fatal: bool,
}

impl Traversal {
    fn new(pipeline: &Pipeline) -> Self {
        let mut remaining = BTreeMap::new();
        for node in &pipeline.nodes {
            remaining.insert(node.id.clone(), pipeline.edges_to(&node.id).count());
        }
        let mut t = Self {
            remaining,
            satisfied: BTreeMap::new(),
            outputs: BTreeMap::new(),
            bool_tags: BTreeMap::new(),
            ready: VecDeque::new(),
            skipped: BTreeSet::new(),
            fatal: false,
        };
        for node in &pipeline.nodes {
            if !matches!(node.kind, orchestrator_types::NodeKind::Trigger) && t.in_degree(&node.id) == 0 {
                t.ready.push_back(node.id.clone());
            }
        }
        t
    }

    fn in_degree(&self, id: &NodeId) -> usize {
        *self.remaining.get(id).unwrap_or(&0)
    }

    fn pop_ready(&mut self) -> Option<NodeId> {
        self.ready.pop_front()
    }

    fn enqueue(&mut self, id: NodeId) {
        self.ready.push_back(id);
    }

    fn upstream_outputs(&self, pipeline: &Pipeline, node_id: &NodeId) -> BTreeMap<NodeId, Value> {
        let mut map = BTreeMap::new();
        for edge in pipeline.edges_to(node_id) {
            if let Some(v) = self.outputs.get(&edge.from) {
                map.insert(edge.from.clone(), v.clone());
            }
        }
        map
    }

    fn record_output(&mut self, node_id: &NodeId, output: Option<Value>, bool_tag: Option<bool>) {
        if let Some(v) = output {
            self.outputs.insert(node_id.clone(), v);
        }
        self.bool_tags.insert(node_id.clone(), bool_tag);
    }

    /// Decrement outstanding-predecessor counts on every successor of
    /// `node_id`; collect those ready to run (count hit zero and at least
    /// one incoming edge is guard-satisfied) via `on_ready`. Successors
    /// whose count hits zero with no satisfied edge are skipped instead,
    /// and the skip cascades transitively (an unresolved branch's nodes
    /// never run, but the run still reaches a terminal state).
    #[must_use]
    fn propagate_success(&mut self, pipeline: &Pipeline, node_id: &NodeId, mut on_ready: impl FnMut(NodeId)) -> Vec<NodeId> {
        let source_tag = self.bool_tags.get(node_id).copied().flatten();
        let successors: Vec<(NodeId, EdgeGuard)> =
            pipeline.edges_from(node_id).map(|e| (e.to.clone(), e.guard)).collect();

        let mut newly_skipped = Vec::new();
        for (to, guard) in successors {
            if self.skipped.contains(&to) {
                continue;
            }
            if guard.satisfied_by(source_tag) {
                self.satisfied.insert(to.clone(), true);
            }
            let count = self.remaining.entry(to.clone()).or_insert(0);
            if *count > 0 {
                *count -= 1;
            }
            if *count == 0 {
                if *self.satisfied.get(&to).unwrap_or(&false) {
                    on_ready(to);
                } else {
                    self.skipped.insert(to.clone());
                    newly_skipped.push(to.clone());
                    newly_skipped.extend(self.skip_descendants(pipeline, &to));
                }
            }
        }
        newly_skipped
    }

    fn mark_fatal_failure(&mut self) {
        self.fatal = true;
    }

    fn any_fatal_failure(&self) -> bool {
        self.fatal
    }

    #[must_use]
    fn skip_descendants(&mut self, pipeline: &Pipeline, node_id: &NodeId) -> Vec<NodeId> {
        let mut newly_skipped = Vec::new();
        let mut stack = vec![node_id.clone()];
        while let Some(current) = stack.pop() {
            for edge in pipeline.edges_from(&current) {
                if self.skipped.insert(edge.to.clone()) {
                    newly_skipped.push(edge.to.clone());
                    stack.push(edge.to.clone());
                }
            }
        }
        newly_skipped
    }
}
