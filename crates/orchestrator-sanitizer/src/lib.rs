//! Output sanitization: bounds the size of handler/agent output before it
//! is persisted or logged, and redacts configured secret values out of it.
//!
//! Applies to `call_api` response bodies, `run_task` captured output, and
//! anything else written into `NodeResult.output` or `ScheduleRun`'s result
//! summary — the audit trail is append-only and effectively permanent, so
//! nothing that reaches it should be unbounded or carry a credential.

const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024;
const REDACTED_PLACEHOLDER: &str = "***REDACTED***";

#[derive(Debug, Clone)]
pub struct SanitizerConfig {
    pub max_output_bytes: usize,
    pub secrets: Vec<String>,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self { max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES, secrets: Vec::new() }
    }
}

impl SanitizerConfig {
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }
}

/// Truncate `text` to its last `max_bytes` bytes (on a char boundary),
/// prefixing a marker noting how much was dropped.
pub fn truncate_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let dropped = text.len() - max_bytes;
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...[{dropped} bytes truncated]...{}", &text[start..])
}

/// Replace every occurrence of a configured secret value with a fixed
/// placeholder. Longest secrets are matched first so one secret cannot
/// mask a redaction of a shorter one it contains.
pub fn redact_secrets(text: &str, secrets: &[String]) -> String {
    let mut sorted: Vec<&String> = secrets.iter().filter(|s| !s.is_empty()).collect();
    sorted.sort_by_key(|s| std::cmp::Reverse(s.len()));
    let mut out = text.to_string();
    for secret in sorted {
        if !out.contains(secret.as_str()) {
            continue;
        }
        out = out.replace(secret.as_str(), REDACTED_PLACEHOLDER);
    }
    out
}

/// Apply truncation then redaction, in that order: truncation first means a
/// secret straddling the cut boundary is dropped outright rather than
/// risking a half-redacted fragment leaking through.
pub fn sanitize(text: &str, config: &SanitizerConfig) -> String {
    let truncated = truncate_tail(text, config.max_output_bytes);
    redact_secrets(&truncated, &config.secrets)
}

/// Sanitize a JSON value's string leaves in place, leaving structure intact.
pub fn sanitize_json(value: &serde_json::Value, config: &SanitizerConfig) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(sanitize(s, config)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| sanitize_json(v, config)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), sanitize_json(v, config))).collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_unchanged() {
        assert_eq!(truncate_tail("hello", 100), "hello");
    }

    #[test]
    fn long_text_keeps_only_the_tail() {
        let text = "a".repeat(100);
        let result = truncate_tail(&text, 10);
        assert!(result.ends_with(&"a".repeat(10)));
        assert!(result.starts_with("...["));
    }

    #[test]
    fn redaction_hides_configured_secrets() {
        let out = redact_secrets("key=sk-live-abc123 ok", &["sk-live-abc123".to_string()]);
        assert_eq!(out, "key=***REDACTED*** ok");
    }

    #[test]
    fn longer_secret_is_redacted_before_shorter_substring() {
        let secrets = vec!["abc".to_string(), "abcdef".to_string()];
        let out = redact_secrets("token abcdef end", &secrets);
        assert_eq!(out, "token ***REDACTED*** end");
    }

    #[test]
    fn sanitize_json_walks_nested_strings() {
        let config = SanitizerConfig::default().with_secret("topsecret");
        let value = serde_json::json!({"a": ["topsecret", "fine"], "b": "topsecret"});
        let out = sanitize_json(&value, &config);
        assert_eq!(out["a"][0], "***REDACTED***");
        assert_eq!(out["b"], "***REDACTED***");
        assert_eq!(out["a"][1], "fine");
    }
}
