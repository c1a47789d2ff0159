//! Core data model for the orchestration core.
//!
//! This crate is the shared vocabulary every other crate in the workspace
//! speaks: [`Pipeline`]/[`Node`]/[`Edge`] definitions, [`Run`]/[`NodeResult`]
//! execution state, [`Schedule`]/[`ScheduleRun`] dispatch state,
//! [`CircuitBreaker`] state, and [`Lock`] records. It intentionally carries
//! no behavior beyond small accessors and constructors — DAG validation
//! lives in `orchestrator-plan`, retry/backoff math in `orchestrator-retry`,
//! and the state machines that mutate these records live in
//! `orchestrator-engine` and `orchestrator-dispatcher`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use orchestrator_duration::HumanDuration;
use orchestrator_environment::InstanceId;
use orchestrator_policy::{EffectivePolicy, PolicyOverride};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(PipelineId);
uuid_id!(RunId);
uuid_id!(ScheduleId);
uuid_id!(ScheduleRunId);

/// A node identity, unique within its owning pipeline. Unlike the other
/// identifiers this is author-chosen (e.g. `"fetch_docs"`), not generated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------
// Pipeline definition
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Active,
    Disabled,
    Archived,
}

/// The four action kinds `action`-typed nodes and schedules can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RunTask,
    ExecutePipeline,
    SendNotification,
    CallApi,
}

/// A minimal boolean expression language for `condition` nodes, evaluated
/// against the JSON outputs of upstream nodes in the same run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConditionExpr {
    /// `upstream_outputs[node][path] == value`, where `path` is a
    /// dot-separated JSON pointer-lite (`"result.ok"`).
    FieldEquals {
        node: NodeId,
        path: String,
        value: serde_json::Value,
    },
    /// The field at `path` is present and not `false`/`null`/`0`/`""`.
    FieldTruthy { node: NodeId, path: String },
    Not(Box<ConditionExpr>),
    And(Vec<ConditionExpr>),
    Or(Vec<ConditionExpr>),
    /// Always evaluates to this literal; useful for stub/test pipelines.
    Literal(bool),
}

/// Kind-specific node configuration. This is the typed replacement for a
/// dynamic config bag: each variant carries exactly the fields its kind
/// needs, so a malformed config is a deserialization error at submit time
/// rather than a runtime KeyError.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// Injection point for the run's input payload. Never invoked; only
    /// valid at in-degree 0.
    Trigger,
    /// Invokes the Agent Executor Port.
    Agent {
        agent_ref: String,
        /// Rendered against upstream outputs to build the agent's task
        /// spec; kept as an opaque JSON template here.
        task_template: serde_json::Value,
    },
    /// Evaluates `expr` and tags this node's output `true`/`false`.
    Condition { expr: ConditionExpr },
    /// Delegates to an Action Handler.
    Action {
        action_kind: ActionKind,
        payload: serde_json::Value,
    },
    /// Structural fan-out marker; the engine does not require it to exist
    /// for concurrency and performs no computation for it.
    Parallel,
    /// Suspends for `duration`; produces no output value.
    Delay { duration: HumanDuration },
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "trigger",
            NodeKind::Agent { .. } => "agent",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Action { .. } => "action",
            NodeKind::Parallel => "parallel",
            NodeKind::Delay { .. } => "delay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub policy_override: PolicyOverride,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            policy_override: PolicyOverride::default(),
        }
    }

    pub fn with_policy_override(mut self, over: PolicyOverride) -> Self {
        self.policy_override = over;
        self
    }

    pub fn effective_policy(&self, default: &EffectivePolicy) -> EffectivePolicy {
        self.policy_override.apply(default)
    }
}

/// Which outgoing edges of a `condition` node are live for a given boolean
/// output. Unconditional edges (from any node kind) are always live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeGuard {
    True,
    False,
    Unconditional,
}

impl EdgeGuard {
    /// Is this edge live given the source node's boolean output (if any)?
    pub fn satisfied_by(&self, source_output: Option<bool>) -> bool {
        match self {
            EdgeGuard::Unconditional => true,
            EdgeGuard::True => source_output == Some(true),
            EdgeGuard::False => source_output == Some(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default = "default_guard")]
    pub guard: EdgeGuard,
}

fn default_guard() -> EdgeGuard {
    EdgeGuard::Unconditional
}

impl Edge {
    pub fn unconditional(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: EdgeGuard::Unconditional,
        }
    }

    pub fn guarded(from: impl Into<NodeId>, to: impl Into<NodeId>, guard: EdgeGuard) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard,
        }
    }
}

/// How the engine reacts when a node exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Mark the run failed, cancel siblings, drain in-flight work.
    FailRun,
    /// Mark transitive dependents `skipped`; unrelated branches continue.
    SkipBranch,
    /// Same dependent-skipping behavior as `skip_branch`, phrased for
    /// pipelines that want to keep running best-effort.
    Continue,
}

impl Default for FailureMode {
    fn default() -> Self {
        FailureMode::FailRun
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub version: u32,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub default_policy: EffectivePolicy,
    #[serde(default)]
    pub default_failure_mode: FailureMode,
    pub status: PipelineStatus,
}

impl Pipeline {
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(|n| &n.id)
    }

    pub fn edges_from(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| &e.from == id)
    }

    pub fn edges_to(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| &e.to == id)
    }

    pub fn is_active(&self) -> bool {
        self.status == PipelineStatus::Active
    }
}

// ---------------------------------------------------------------------
// Run / NodeResult
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub pipeline_id: PipelineId,
    pub pipeline_version: u32,
    pub input: serde_json::Value,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_summary: Option<String>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Optimistic-concurrency counter; bumped on every store write.
    #[serde(default)]
    pub version: u64,
}

impl Run {
    pub fn new(pipeline_id: PipelineId, pipeline_version: u32, input: serde_json::Value) -> Self {
        Self {
            id: RunId::new(),
            pipeline_id,
            pipeline_version,
            input,
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            error_summary: None,
            output: None,
            idempotency_key: None,
            cancel_requested: false,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub version: u64,
}

impl NodeResult {
    pub fn pending(run_id: RunId, node_id: NodeId) -> Self {
        Self {
            run_id,
            node_id,
            status: NodeStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
            version: 0,
        }
    }

    /// Read this node's output as a boolean tag, for `condition`-sourced
    /// guard evaluation. `{"result": true}` and a bare `true` both count.
    pub fn boolean_output(&self) -> Option<bool> {
        match &self.output {
            Some(serde_json::Value::Bool(b)) => Some(*b),
            Some(serde_json::Value::Object(map)) => map.get("result").and_then(|v| v.as_bool()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    /// `"<pipeline_id>/<node_id>"` for per-node breakers, or `"<pipeline_id>"`
    /// for pipeline-wide ones.
    pub key: String,
    pub state: BreakerState,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_probe_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub cooldown: HumanDuration,
    #[serde(default)]
    pub version: u64,
}

impl CircuitBreaker {
    pub fn closed(key: impl Into<String>, failure_threshold: u32, cooldown: HumanDuration) -> Self {
        Self {
            key: key.into(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_probe_at: None,
            failure_threshold,
            cooldown,
            version: 0,
        }
    }

    pub fn node_key(pipeline_id: PipelineId, node_id: &NodeId) -> String {
        format!("{pipeline_id}/{node_id}")
    }
}

// ---------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    Cron { expr: String },
    Interval { period: HumanDuration },
    OneShot { fire_at: DateTime<Utc> },
    Event { name: String },
}

impl TriggerSpec {
    pub fn label(&self) -> &'static str {
        match self {
            TriggerSpec::Cron { .. } => "cron",
            TriggerSpec::Interval { .. } => "interval",
            TriggerSpec::OneShot { .. } => "one_shot",
            TriggerSpec::Event { .. } => "event",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedFirePolicy {
    Coalesce,
    FireAll,
    SkipMissed,
}

impl Default for MissedFirePolicy {
    fn default() -> Self {
        MissedFirePolicy::Coalesce
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFailurePolicy {
    RetryNextTick,
    Backoff,
    Disable,
}

impl Default for ScheduleFailurePolicy {
    fn default() -> Self {
        ScheduleFailurePolicy::RetryNextTick
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Waiting,
    Disabled,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub action_kind: ActionKind,
    pub action_payload: serde_json::Value,
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub next_fire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_fire_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    #[serde(default)]
    pub status: Option<ScheduleStatus>,
    #[serde(default)]
    pub failure_policy: ScheduleFailurePolicy,
    #[serde(default)]
    pub missed_fire_policy: MissedFirePolicy,
    /// In-flight ScheduleRuns allowed for this schedule at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    /// Upper bound on how many missed instances `fire_all` will backfill.
    #[serde(default = "default_max_missed_backfill")]
    pub max_missed_backfill: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: u64,
}

fn default_max_concurrency() -> u32 {
    1
}

fn default_max_missed_backfill() -> u32 {
    10
}

impl Schedule {
    pub fn new(action_kind: ActionKind, action_payload: serde_json::Value, trigger: TriggerSpec) -> Self {
        Self {
            id: ScheduleId::new(),
            action_kind,
            action_payload,
            trigger,
            next_fire_at: None,
            last_fire_at: None,
            enabled: true,
            status: None,
            failure_policy: ScheduleFailurePolicy::default(),
            missed_fire_policy: MissedFirePolicy::default(),
            max_concurrency: default_max_concurrency(),
            max_missed_backfill: default_max_missed_backfill(),
            tags: Vec::new(),
            version: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at.map(|t| t <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRunStatus {
    Claimed,
    Running,
    Succeeded,
    Failed,
    Missed,
}

impl ScheduleRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduleRunStatus::Succeeded | ScheduleRunStatus::Failed | ScheduleRunStatus::Missed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: ScheduleRunId,
    pub schedule_id: ScheduleId,
    pub fire_at: DateTime<Utc>,
    #[serde(default)]
    pub claim_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ScheduleRunStatus,
    #[serde(default)]
    pub result_summary: Option<String>,
    #[serde(default)]
    pub claimed_by: Option<InstanceId>,
    /// Stable key handed to the action handler so at-least-once retries of
    /// this fire don't duplicate a non-idempotent side effect.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub version: u64,
}

impl ScheduleRun {
    pub fn claim(schedule_id: ScheduleId, fire_at: DateTime<Utc>, claimed_by: InstanceId, now: DateTime<Utc>) -> Self {
        Self {
            id: ScheduleRunId::new(),
            schedule_id,
            fire_at,
            claim_at: Some(now),
            dispatched_at: None,
            completed_at: None,
            status: ScheduleRunStatus::Claimed,
            result_summary: None,
            claimed_by: Some(claimed_by),
            idempotency_key: Some(format!("{schedule_id}@{}", fire_at.timestamp_millis())),
            version: 0,
        }
    }
}

// ---------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub key: String,
    pub owner: InstanceId,
    pub acquired_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.lease_expires_at
    }

    pub const PRIMARY_KEY: &'static str = "scheduler.primary";

    pub fn run_key(run_id: RunId) -> String {
        format!("run.{run_id}")
    }
}

/// Per-node error entry surfaced in a run's status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeErrorEntry {
    pub node_id: NodeId,
    pub kind: String,
    pub message: String,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// A read-only projection of a run's state, as returned by `status`/`await`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub node_statuses: BTreeMap<NodeId, NodeStatus>,
    pub node_errors: Vec<NodeErrorEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pipeline() -> Pipeline {
        Pipeline {
            id: PipelineId::new(),
            name: "sample".into(),
            version: 1,
            nodes: vec![
                Node::new("t", NodeKind::Trigger),
                Node::new(
                    "a",
                    NodeKind::Agent {
                        agent_ref: "writer".into(),
                        task_template: serde_json::json!({}),
                    },
                ),
            ],
            edges: vec![Edge::unconditional("t", "a")],
            input_schema: None,
            default_policy: EffectivePolicy::default(),
            default_failure_mode: FailureMode::default(),
            status: PipelineStatus::Active,
        }
    }

    #[test]
    fn pipeline_lookup_helpers() {
        let p = sample_pipeline();
        assert!(p.node(&NodeId::new("t")).is_some());
        assert!(p.node(&NodeId::new("missing")).is_none());
        assert_eq!(p.edges_from(&NodeId::new("t")).count(), 1);
    }

    #[test]
    fn guard_satisfaction() {
        assert!(EdgeGuard::Unconditional.satisfied_by(None));
        assert!(EdgeGuard::True.satisfied_by(Some(true)));
        assert!(!EdgeGuard::True.satisfied_by(Some(false)));
        assert!(!EdgeGuard::False.satisfied_by(None));
    }

    #[test]
    fn node_result_boolean_output_variants() {
        let mut r = NodeResult::pending(RunId::new(), NodeId::new("c"));
        r.output = Some(serde_json::json!(true));
        assert_eq!(r.boolean_output(), Some(true));
        r.output = Some(serde_json::json!({"result": false}));
        assert_eq!(r.boolean_output(), Some(false));
        r.output = Some(serde_json::json!({"other": 1}));
        assert_eq!(r.boolean_output(), None);
    }

    #[test]
    fn run_status_terminality() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn schedule_is_due_requires_enabled_and_past_fire_time() {
        let mut s = Schedule::new(
            ActionKind::RunTask,
            serde_json::json!({}),
            TriggerSpec::Interval {
                period: HumanDuration::from_secs(60),
            },
        );
        let now = Utc::now();
        assert!(!s.is_due(now));
        s.next_fire_at = Some(now - chrono::Duration::seconds(1));
        assert!(s.is_due(now));
        s.enabled = false;
        assert!(!s.is_due(now));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = RunId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }

    #[test]
    fn lock_expiry() {
        let now = Utc::now();
        let lock = Lock {
            key: "x".into(),
            owner: InstanceId::generate(),
            acquired_at: now - chrono::Duration::seconds(10),
            lease_expires_at: now - chrono::Duration::seconds(1),
        };
        assert!(lock.is_expired(now));
    }
}
