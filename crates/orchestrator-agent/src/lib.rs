//! Agent Executor Port (C4): the capability contract that agent-typed
//! pipeline nodes invoke. This crate defines the trait only; concrete
//! implementations (an HTTP-backed agent runtime, a subprocess runner, ...)
//! live outside the orchestration core. A deterministic test double is
//! included for engine tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Opaque identity of an invokable agent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentRef(pub String);

impl std::fmt::Display for AgentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The task handed to an agent: a prompt-like body plus free-form metadata
/// built from node config and upstream node outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub prompt: String,
    pub metadata: BTreeMap<String, Value>,
}

impl TaskSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), metadata: BTreeMap::new() }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub body: Value,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum AgentError {
    /// The agent declined the task outright; not worth retrying.
    #[error("agent {agent_ref} refused the task: {reason}")]
    AgentRefused { agent_ref: String, reason: String },
    /// A transient failure (network blip, rate limit); safe to retry.
    #[error("agent {agent_ref} transient failure: {reason}")]
    AgentTransient { agent_ref: String, reason: String },
    /// A fatal failure (malformed task, unrecoverable internal error).
    #[error("agent {agent_ref} fatal failure: {reason}")]
    AgentFatal { agent_ref: String, reason: String },
    /// The agent did not respond before `per_attempt_timeout` elapsed.
    #[error("agent {agent_ref} timed out after {elapsed_ms}ms")]
    AgentTimeout { agent_ref: String, elapsed_ms: u64 },
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::AgentTransient { .. } | AgentError::AgentTimeout { .. })
    }
}

/// The C4 contract: invoke `agent_ref` with `task_spec`, observing
/// cooperative cancellation. No scheduling guarantees beyond invocation
/// ordering per `(agent_ref, run)`.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        agent_ref: &AgentRef,
        task_spec: &TaskSpec,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, AgentError>;
}

/// Deterministic test double: returns a scripted response (or error) for
/// each agent_ref, in call order, looping the last entry once exhausted.
pub struct ScriptedAgentExecutor {
    scripts: tokio::sync::Mutex<BTreeMap<String, Vec<Result<Value, AgentError>>>>,
}

impl ScriptedAgentExecutor {
    pub fn new() -> Self {
        Self { scripts: tokio::sync::Mutex::new(BTreeMap::new()) }
    }

    pub fn script(mut self, agent_ref: &str, responses: Vec<Result<Value, AgentError>>) -> Self {
        self.scripts.get_mut().insert(agent_ref.to_string(), responses);
        self
    }
}

impl Default for ScriptedAgentExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgentExecutor {
    async fn execute(
        &self,
        agent_ref: &AgentRef,
        _task_spec: &TaskSpec,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::AgentFatal {
                agent_ref: agent_ref.0.clone(),
                reason: "cancelled before dispatch".into(),
            });
        }
        let mut scripts = self.scripts.lock().await;
        let entries = scripts.get_mut(&agent_ref.0).ok_or_else(|| AgentError::AgentFatal {
            agent_ref: agent_ref.0.clone(),
            reason: "no script registered".into(),
        })?;
        let next = if entries.len() > 1 { entries.remove(0) } else { entries[0].clone() };
        next.map(|body| AgentOutput { body, elapsed: Duration::from_millis(1) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_executor_replays_in_order_then_repeats_last() {
        let exec = ScriptedAgentExecutor::new().script(
            "a",
            vec![Ok(serde_json::json!({"n": 1})), Ok(serde_json::json!({"n": 2}))],
        );
        let agent_ref = AgentRef("a".to_string());
        let task = TaskSpec::new("hi");
        let cancel = CancellationToken::new();

        let first = exec.execute(&agent_ref, &task, &cancel).await.unwrap();
        assert_eq!(first.body["n"], 1);
        let second = exec.execute(&agent_ref, &task, &cancel).await.unwrap();
        assert_eq!(second.body["n"], 2);
        let third = exec.execute(&agent_ref, &task, &cancel).await.unwrap();
        assert_eq!(third.body["n"], 2);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_dispatch() {
        let exec = ScriptedAgentExecutor::new().script("a", vec![Ok(serde_json::json!({}))]);
        let agent_ref = AgentRef("a".to_string());
        let task = TaskSpec::new("hi");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = exec.execute(&agent_ref, &task, &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::AgentFatal { .. }));
    }

    #[test]
    fn retryable_classification() {
        let transient = AgentError::AgentTransient { agent_ref: "a".into(), reason: "x".into() };
        let refused = AgentError::AgentRefused { agent_ref: "a".into(), reason: "x".into() };
        assert!(transient.is_retryable());
        assert!(!refused.is_retryable());
    }
}
