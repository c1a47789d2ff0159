//! Per-node retry, timeout, and circuit-breaker policy for the pipeline
//! engine.
//!
//! A [`Pipeline`](orchestrator_types) carries a default [`EffectivePolicy`];
//! individual nodes may override any subset of its fields via
//! [`PolicyOverride`]. [`PolicyOverride::apply`] merges an override onto a
//! default to produce the policy the engine actually runs a node under.

use std::time::Duration;

use orchestrator_retry::RetryConfig;
use serde::{Deserialize, Serialize};

/// Circuit-breaker thresholds. The breaker itself (state machine) lives in
/// `orchestrator-engine`; this is just the tunable configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerPolicy {
    /// Consecutive failures before the breaker opens.
    pub cb_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub cb_cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            cb_threshold: 5,
            cb_cooldown: Duration::from_secs(60),
        }
    }
}

impl BreakerPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.cb_threshold == 0 {
            return Err(PolicyError::ZeroBreakerThreshold);
        }
        Ok(())
    }
}

/// The fully-resolved policy a node's attempt loop runs under: no more
/// `Option`s, every field has a concrete value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectivePolicy {
    pub retry: RetryConfig,
    #[serde(with = "humantime_serde")]
    pub per_attempt_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub overall_timeout: Duration,
    pub breaker: BreakerPolicy,
}

impl Default for EffectivePolicy {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            per_attempt_timeout: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(900),
            breaker: BreakerPolicy::default(),
        }
    }
}

impl EffectivePolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        self.retry.validate().map_err(PolicyError::Retry)?;
        self.breaker.validate()?;
        if self.per_attempt_timeout.is_zero() {
            return Err(PolicyError::ZeroAttemptTimeout);
        }
        if self.overall_timeout < self.per_attempt_timeout {
            return Err(PolicyError::OverallBelowAttemptTimeout);
        }
        Ok(())
    }
}

/// A node-level override: any field left `None` inherits the pipeline
/// default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    pub retry: Option<RetryConfig>,
    #[serde(with = "humantime_serde::option")]
    pub per_attempt_timeout: Option<Duration>,
    #[serde(with = "humantime_serde::option")]
    pub overall_timeout: Option<Duration>,
    pub breaker: Option<BreakerPolicy>,
}

impl PolicyOverride {
    pub fn apply(&self, default: &EffectivePolicy) -> EffectivePolicy {
        EffectivePolicy {
            retry: self.retry.unwrap_or(default.retry),
            per_attempt_timeout: self.per_attempt_timeout.unwrap_or(default.per_attempt_timeout),
            overall_timeout: self.overall_timeout.unwrap_or(default.overall_timeout),
            breaker: self.breaker.unwrap_or(default.breaker),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("retry policy invalid: {0}")]
    Retry(#[from] orchestrator_retry::RetryConfigError),
    #[error("cb_threshold must be at least 1")]
    ZeroBreakerThreshold,
    #[error("per_attempt_timeout must be non-zero")]
    ZeroAttemptTimeout,
    #[error("overall_timeout must be at least per_attempt_timeout")]
    OverallBelowAttemptTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_with_all_none_is_identity() {
        let default = EffectivePolicy::default();
        let merged = PolicyOverride::default().apply(&default);
        assert_eq!(merged, default);
    }

    #[test]
    fn override_replaces_only_set_fields() {
        let default = EffectivePolicy::default();
        let over = PolicyOverride {
            per_attempt_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let merged = over.apply(&default);
        assert_eq!(merged.per_attempt_timeout, Duration::from_secs(5));
        assert_eq!(merged.overall_timeout, default.overall_timeout);
        assert_eq!(merged.retry, default.retry);
    }

    #[test]
    fn default_policy_validates() {
        assert!(EffectivePolicy::default().validate().is_ok());
    }

    #[test]
    fn overall_below_attempt_timeout_is_rejected() {
        let mut p = EffectivePolicy::default();
        p.overall_timeout = Duration::from_secs(1);
        p.per_attempt_timeout = Duration::from_secs(10);
        assert_eq!(p.validate(), Err(PolicyError::OverallBelowAttemptTimeout));
    }
}
