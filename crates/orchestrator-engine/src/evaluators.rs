//! Node-kind evaluators (§4.6). Each evaluator runs a single attempt of a
//! node and classifies its result as one [`orchestrator_execution::AttemptError`]
//! variant or a success value. The attempt loop (retries, breaker,
//! timeouts) lives in [`crate::engine`]; this module only knows how to run
//! one attempt of one node kind.

use std::collections::BTreeMap;
use std::sync::Arc;

use orchestrator_agent::{AgentExecutor, AgentRef, TaskSpec};
use orchestrator_execution::AttemptError;
use orchestrator_handlers::{HandlerOutcome, HandlerRegistry};
use orchestrator_types::{ActionKind, ConditionExpr, Node, NodeKind};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// What evaluating a node produced: a JSON-shaped output and, for
/// `condition` nodes, the boolean tag used to gate guarded edges.
#[derive(Debug, Clone, Default)]
pub struct EvalOutput {
    pub output: Option<Value>,
    pub bool_tag: Option<bool>,
}

impl EvalOutput {
    fn value(v: Value) -> Self {
        Self { output: Some(v), bool_tag: None }
    }

    fn bool_tag(tag: bool) -> Self {
        Self { output: Some(Value::Bool(tag)), bool_tag: Some(tag) }
    }
}

/// Read a dot-separated path (`"result.ok"`) out of a JSON value.
fn read_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn eval_condition(expr: &ConditionExpr, upstream_outputs: &BTreeMap<orchestrator_types::NodeId, Value>) -> bool {
    match expr {
        ConditionExpr::Literal(b) => *b,
        ConditionExpr::FieldEquals { node, path, value } => upstream_outputs
            .get(node)
            .and_then(|v| read_path(v, path))
            .map(|v| v == value)
            .unwrap_or(false),
        ConditionExpr::FieldTruthy { node, path } => upstream_outputs
            .get(node)
            .and_then(|v| read_path(v, path))
            .map(is_truthy)
            .unwrap_or(false),
        ConditionExpr::Not(inner) => !eval_condition(inner, upstream_outputs),
        ConditionExpr::And(exprs) => exprs.iter().all(|e| eval_condition(e, upstream_outputs)),
        ConditionExpr::Or(exprs) => exprs.iter().any(|e| eval_condition(e, upstream_outputs)),
    }
}

fn render_task_template(template: &Value, upstream_outputs: &BTreeMap<orchestrator_types::NodeId, Value>) -> Value {
    serde_json::json!({
        "template": template,
        "upstream": upstream_outputs,
    })
}

/// Evaluate one attempt of `node` given the run's input and upstream
/// node outputs.
pub async fn evaluate_attempt(
    node: &Node,
    run_input: &Value,
    upstream_outputs: &BTreeMap<orchestrator_types::NodeId, Value>,
    agent_executor: &Arc<dyn AgentExecutor>,
    handlers: &HandlerRegistry,
    cancel: &CancellationToken,
) -> Result<EvalOutput, AttemptError> {
    if cancel.is_cancelled() {
        return Err(AttemptError::Cancelled);
    }

    match &node.kind {
        NodeKind::Trigger => Ok(EvalOutput::value(run_input.clone())),

        NodeKind::Agent { agent_ref, task_template } => {
            let rendered = render_task_template(task_template, upstream_outputs);
            let prompt = rendered.get("prompt").and_then(Value::as_str).unwrap_or("").to_string();
            let task = TaskSpec::new(prompt).with_metadata("rendered", rendered);
            match agent_executor.execute(&AgentRef(agent_ref.clone()), &task, cancel).await {
                Ok(out) => Ok(EvalOutput::value(out.body)),
                Err(e) if e.is_retryable() => Err(match e {
                    orchestrator_agent::AgentError::AgentTimeout { .. } => AttemptError::Timeout,
                    other => AttemptError::Transient(other.to_string()),
                }),
                Err(e) => Err(AttemptError::Fatal(e.to_string())),
            }
        }

        NodeKind::Condition { expr } => {
            let tag = eval_condition(expr, upstream_outputs);
            Ok(EvalOutput::bool_tag(tag))
        }

        NodeKind::Action { action_kind, payload } => {
            let handler = handlers.get(*action_kind).map_err(|e| AttemptError::Fatal(e.to_string()))?;
            handler.validate(payload).map_err(|e| AttemptError::Fatal(e.to_string()))?;
            match handler.dispatch(payload, cancel).await {
                HandlerOutcome::Success { output, .. } => Ok(EvalOutput::value(output)),
                HandlerOutcome::Transient { reason } => Err(AttemptError::Transient(reason)),
                HandlerOutcome::Fatal { reason } => Err(AttemptError::Fatal(reason)),
            }
        }

        NodeKind::Parallel => Ok(EvalOutput::default()),

        NodeKind::Delay { duration } => {
            tokio::select! {
                _ = tokio::time::sleep(duration.as_duration()) => Ok(EvalOutput::default()),
                _ = cancel.cancelled() => Err(AttemptError::Cancelled),
            }
        }
    }
}

/// `call_api`'s `ActionKind` is covered by the handler registry; this
/// constant documents which kinds require a handler at all (every kind but
/// the ones with inline evaluators).
pub const HANDLER_BACKED_ACTION_KINDS: [ActionKind; 4] = [
    ActionKind::RunTask,
    ActionKind::ExecutePipeline,
    ActionKind::SendNotification,
    ActionKind::CallApi,
];

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_types::NodeId;

    #[test]
    fn field_equals_reads_nested_path() {
        let mut outputs = BTreeMap::new();
        outputs.insert(NodeId::from("a"), serde_json::json!({"result": {"ok": true}}));
        let expr = ConditionExpr::FieldEquals {
            node: NodeId::from("a"),
            path: "result.ok".to_string(),
            value: serde_json::json!(true),
        };
        assert!(eval_condition(&expr, &outputs));
    }

    #[test]
    fn field_truthy_handles_missing_path() {
        let outputs = BTreeMap::new();
        let expr = ConditionExpr::FieldTruthy { node: NodeId::from("a"), path: "x".to_string() };
        assert!(!eval_condition(&expr, &outputs));
    }

    #[test]
    fn and_or_not_compose() {
        let outputs = BTreeMap::new();
        let expr = ConditionExpr::And(vec![
            ConditionExpr::Literal(true),
            ConditionExpr::Not(Box::new(ConditionExpr::Literal(false))),
        ]);
        assert!(eval_condition(&expr, &outputs));

        let expr2 = ConditionExpr::Or(vec![ConditionExpr::Literal(false), ConditionExpr::Literal(true)]);
        assert!(eval_condition(&expr2, &outputs));
    }
}
