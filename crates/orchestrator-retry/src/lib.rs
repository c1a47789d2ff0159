//! Retry strategies, backoff policies, and error classification for the
//! pipeline engine's per-node attempt loop.
//!
//! A node's effective [`RetryConfig`] decides, for each failed attempt,
//! whether another attempt is allowed and how long to wait before it. The
//! actual attempt loop lives in `orchestrator-execution`; this crate only
//! computes delays and classifies which outcomes are worth retrying.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How a node's error is classified for retry purposes.
///
/// `Ambiguous` covers attempts whose side effect may or may not have landed
/// (e.g. a `call_api` node that timed out after the request was already
/// sent) — by default these are retried less eagerly than a clean
/// `Transient` failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Ambiguous,
    Fatal,
}

/// Backoff shape applied between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between attempts.
    Immediate,
    /// `delay_n = min(backoff_cap, backoff_base * 2^(n-1))`.
    #[default]
    Exponential,
    /// `delay_n = backoff_base * n`, capped at `backoff_cap`.
    Linear,
    /// `delay_n = backoff_base`, every attempt.
    Constant,
}

/// Named presets over [`RetryConfig`] so pipeline authors don't have to
/// hand-tune every field for common cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPreset {
    #[default]
    Default,
    Aggressive,
    Conservative,
}

impl RetryPreset {
    pub fn to_config(self) -> RetryConfig {
        match self {
            RetryPreset::Default => RetryConfig {
                max_attempts: 3,
                strategy: RetryStrategyType::Exponential,
                backoff_base: Duration::from_millis(200),
                backoff_cap: Duration::from_secs(30),
                jitter_fraction: 0.1,
                retry_ambiguous: true,
            },
            RetryPreset::Aggressive => RetryConfig {
                max_attempts: 6,
                strategy: RetryStrategyType::Exponential,
                backoff_base: Duration::from_millis(50),
                backoff_cap: Duration::from_secs(10),
                jitter_fraction: 0.2,
                retry_ambiguous: true,
            },
            RetryPreset::Conservative => RetryConfig {
                max_attempts: 2,
                strategy: RetryStrategyType::Linear,
                backoff_base: Duration::from_secs(1),
                backoff_cap: Duration::from_secs(60),
                jitter_fraction: 0.1,
                retry_ambiguous: false,
            },
        }
    }
}

/// A node or pipeline's effective retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub strategy: RetryStrategyType,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_cap: Duration,
    /// Fraction of `delay_n` added as uniform jitter, e.g. `0.1` for ±10%.
    pub jitter_fraction: f64,
    /// Whether `Ambiguous`-classified outcomes are retried like `Transient`
    /// ones. `Fatal` is never retried regardless of this setting.
    pub retry_ambiguous: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryPreset::Default.to_config()
    }
}

impl RetryConfig {
    /// Validate the fields an admin is allowed to tune: non-negative,
    /// within sane bounds. Mirrors the submit-time validation the pipeline
    /// engine runs over node policy overrides.
    pub fn validate(&self) -> Result<(), RetryConfigError> {
        if self.max_attempts == 0 {
            return Err(RetryConfigError::ZeroMaxAttempts);
        }
        if self.max_attempts > 100 {
            return Err(RetryConfigError::MaxAttemptsTooLarge(self.max_attempts));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(RetryConfigError::CapBelowBase {
                base: self.backoff_base,
                cap: self.backoff_cap,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(RetryConfigError::JitterOutOfRange(self.jitter_fraction));
        }
        Ok(())
    }

    /// Should an outcome of this class be retried at all (ignoring the
    /// attempt budget)?
    pub fn should_retry(&self, class: ErrorClass) -> bool {
        match class {
            ErrorClass::Transient => true,
            ErrorClass::Ambiguous => self.retry_ambiguous,
            ErrorClass::Fatal => false,
        }
    }

    /// Compute the delay before attempt number `next_attempt` (1-indexed:
    /// the delay awaited *before* making that attempt), including jitter.
    pub fn delay_for_attempt(&self, next_attempt: u32) -> Duration {
        let base = self.backoff_base.as_secs_f64();
        let cap = self.backoff_cap.as_secs_f64();
        let n = next_attempt.max(1) as f64;

        let raw = match self.strategy {
            RetryStrategyType::Immediate => 0.0,
            RetryStrategyType::Exponential => base * 2f64.powf(n - 1.0),
            RetryStrategyType::Linear => base * n,
            RetryStrategyType::Constant => base,
        };
        let capped = raw.min(cap).max(0.0);
        let jitter = if capped > 0.0 && self.jitter_fraction > 0.0 {
            rand::rng().random_range(0.0..=(capped * self.jitter_fraction))
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum RetryConfigError {
    #[error("max_attempts must be at least 1")]
    ZeroMaxAttempts,
    #[error("max_attempts {0} exceeds the admin-configured bound of 100")]
    MaxAttemptsTooLarge(u32),
    #[error("backoff_cap {cap:?} is below backoff_base {base:?}")]
    CapBelowBase { base: Duration, cap: Duration },
    #[error("jitter_fraction {0} must be within [0.0, 1.0]")]
    JitterOutOfRange(f64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn immediate_strategy_never_delays() {
        let cfg = RetryConfig {
            strategy: RetryStrategyType::Immediate,
            jitter_fraction: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(cfg.delay_for_attempt(5), Duration::ZERO);
    }

    #[test]
    fn exponential_delay_is_capped() {
        let cfg = RetryConfig {
            strategy: RetryStrategyType::Exponential,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(500),
            jitter_fraction: 0.0,
            ..RetryConfig::default()
        };
        // 100, 200, 400, 800(capped to 500), ...
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(cfg.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn fatal_is_never_retried() {
        let cfg = RetryConfig::default();
        assert!(!cfg.should_retry(ErrorClass::Fatal));
    }

    #[test]
    fn ambiguous_honors_config_flag() {
        let mut cfg = RetryConfig::default();
        cfg.retry_ambiguous = false;
        assert!(!cfg.should_retry(ErrorClass::Ambiguous));
        cfg.retry_ambiguous = true;
        assert!(cfg.should_retry(ErrorClass::Ambiguous));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut cfg = RetryConfig::default();
        cfg.max_attempts = 0;
        assert_eq!(cfg.validate(), Err(RetryConfigError::ZeroMaxAttempts));
    }

    #[test]
    fn validate_rejects_cap_below_base() {
        let mut cfg = RetryConfig::default();
        cfg.backoff_base = Duration::from_secs(10);
        cfg.backoff_cap = Duration::from_secs(1);
        assert!(cfg.validate().is_err());
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_nondecreasing_before_cap(base_ms in 1u64..100, n in 1u32..8) {
            let cfg = RetryConfig {
                strategy: RetryStrategyType::Exponential,
                backoff_base: Duration::from_millis(base_ms),
                backoff_cap: Duration::from_secs(3600),
                jitter_fraction: 0.0,
                ..RetryConfig::default()
            };
            let d_n = cfg.delay_for_attempt(n);
            let d_next = cfg.delay_for_attempt(n + 1);
            prop_assert!(d_next >= d_n);
        }

        #[test]
        fn jitter_never_exceeds_bound(base_ms in 1u64..1000, jitter in 0.0f64..1.0) {
            let cfg = RetryConfig {
                strategy: RetryStrategyType::Constant,
                backoff_base: Duration::from_millis(base_ms),
                backoff_cap: Duration::from_secs(3600),
                jitter_fraction: jitter,
                ..RetryConfig::default()
            };
            let d = cfg.delay_for_attempt(1);
            let max_allowed = Duration::from_secs_f64(base_ms as f64 / 1000.0 * (1.0 + jitter));
            prop_assert!(d <= max_allowed + Duration::from_micros(1));
        }
    }
}
