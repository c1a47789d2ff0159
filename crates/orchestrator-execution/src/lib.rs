//! Shared attempt-loop and outcome classification used by the pipeline
//! engine's node evaluators and the dispatcher's handler invocations.
//!
//! Both callers share the same shape: attempt a fallible async operation,
//! classify its failure, retry transient failures per [`orchestrator_retry`]
//! policy, and give up on fatal ones. This crate factors that loop out so
//! the engine's `agent`/`action` evaluators and the dispatcher's handler
//! dispatch don't each reimplement backoff and circuit-breaker bookkeeping.

use std::time::Duration;

use orchestrator_duration::HumanDuration;
use orchestrator_retry::{ErrorClass, RetryConfig};
use orchestrator_types::{BreakerState, CircuitBreaker};

/// The outcome of a single node/handler execution, after retries are
/// exhausted or a non-retryable condition is hit.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    /// Exhausted retries on a transient error.
    Transient(String),
    /// Non-retryable failure.
    Fatal(String),
    /// Short-circuited by an open circuit breaker.
    CircuitOpen,
    /// The per-attempt timeout elapsed.
    Timeout,
    /// Cooperative cancellation was observed.
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_terminal_failure(&self) -> bool {
        !self.is_success()
    }
}

/// What an attempt classifier returns for a single failed attempt.
#[derive(Debug, Clone)]
pub enum AttemptError {
    Transient(String),
    Ambiguous(String),
    Fatal(String),
    Timeout,
    Cancelled,
}

impl AttemptError {
    pub fn error_class(&self) -> ErrorClass {
        match self {
            AttemptError::Transient(_) | AttemptError::Timeout => ErrorClass::Transient,
            AttemptError::Ambiguous(_) => ErrorClass::Ambiguous,
            AttemptError::Fatal(_) | AttemptError::Cancelled => ErrorClass::Fatal,
        }
    }
}

/// Breaker admission check: consult `breaker` as of `now`, transitioning
/// `open` -> `half_open` if the cooldown has elapsed. Returns `false` if the
/// attempt must be short-circuited.
pub fn breaker_admits(breaker: &mut CircuitBreaker, now: chrono::DateTime<chrono::Utc>) -> bool {
    match breaker.state {
        BreakerState::Closed => true,
        BreakerState::HalfOpen => true,
        BreakerState::Open => {
            if let Some(probe_at) = breaker.next_probe_at {
                if now >= probe_at {
                    breaker.state = BreakerState::HalfOpen;
                    return true;
                }
            }
            false
        }
    }
}

/// Record a successful attempt against the breaker: closes it and resets
/// the consecutive-failure counter.
pub fn breaker_record_success(breaker: &mut CircuitBreaker) {
    breaker.state = BreakerState::Closed;
    breaker.consecutive_failures = 0;
    breaker.opened_at = None;
    breaker.next_probe_at = None;
}

/// Record a failed attempt against the breaker, opening it once the
/// consecutive-failure count reaches `cb_threshold`.
pub fn breaker_record_failure(
    breaker: &mut CircuitBreaker,
    now: chrono::DateTime<chrono::Utc>,
    cooldown: Duration,
) {
    breaker.consecutive_failures += 1;
    if breaker.state == BreakerState::HalfOpen || breaker.consecutive_failures >= breaker.failure_threshold {
        breaker.state = BreakerState::Open;
        breaker.opened_at = Some(now);
        breaker.next_probe_at = Some(now + chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::zero()));
    }
}

/// Run a fallible attempt function up to `config.max_attempts` times,
/// sleeping `config.delay_for_attempt` between attempts via `sleep`, and
/// classifying the result through `config.should_retry`.
///
/// `sleep` is injected so tests can use a fake clock; production callers
/// pass `tokio::time::sleep`.
pub async fn run_with_retry<T, F, Fut, S, SFut>(
    config: &RetryConfig,
    mut attempt: F,
    mut sleep: S,
) -> Outcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, AttemptError>>,
    S: FnMut(Duration) -> SFut,
    SFut: std::future::Future<Output = ()>,
{
    let mut last_error = String::new();
    for n in 1..=config.max_attempts {
        match attempt(n).await {
            Ok(value) => return Outcome::Success(value),
            Err(AttemptError::Cancelled) => return Outcome::Cancelled,
            Err(AttemptError::Timeout) if n == config.max_attempts => return Outcome::Timeout,
            Err(err) => {
                let class = err.error_class();
                last_error = match &err {
                    AttemptError::Transient(m) | AttemptError::Ambiguous(m) | AttemptError::Fatal(m) => m.clone(),
                    AttemptError::Timeout => "attempt timed out".to_string(),
                    AttemptError::Cancelled => unreachable!(),
                };
                if !config.should_retry(class) || n == config.max_attempts {
                    return match err {
                        AttemptError::Fatal(m) => Outcome::Fatal(m),
                        AttemptError::Timeout => Outcome::Timeout,
                        _ => Outcome::Transient(last_error),
                    };
                }
                sleep(config.delay_for_attempt(n)).await;
            }
        }
    }
    Outcome::Transient(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_retry::RetryPreset;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_sleep(_: Duration) -> std::future::Ready<()> {
        std::future::ready(())
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let config = RetryPreset::Default.to_config();
        let outcome = run_with_retry(&config, |_n| async { Ok::<_, AttemptError>(42) }, no_sleep).await;
        assert_eq!(outcome, Outcome::Success(42));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let config = RetryConfig { max_attempts: 3, ..RetryPreset::Aggressive.to_config() };
        let calls = AtomicU32::new(0);
        let outcome = run_with_retry(
            &config,
            |_n| {
                let seen = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if seen < 2 {
                        Err(AttemptError::Transient("not yet".into()))
                    } else {
                        Ok(99)
                    }
                }
            },
            no_sleep,
        )
        .await;
        assert_eq!(outcome, Outcome::Success(99));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_stops_immediately() {
        let config = RetryConfig { max_attempts: 5, ..RetryPreset::Default.to_config() };
        let calls = AtomicU32::new(0);
        let outcome = run_with_retry::<i32, _, _, _, _>(
            &config,
            |_n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptError::Fatal("nope".into())) }
            },
            no_sleep,
        )
        .await;
        assert_eq!(outcome, Outcome::Fatal("nope".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker {
            key: "k".into(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_probe_at: None,
            failure_threshold: 2,
            cooldown: HumanDuration::from_secs(30),
            version: 0,
        };
        let now = chrono::Utc::now();
        breaker_record_failure(&mut breaker, now, Duration::from_secs(30));
        assert_eq!(breaker.state, BreakerState::Closed);
        breaker_record_failure(&mut breaker, now, Duration::from_secs(30));
        assert_eq!(breaker.state, BreakerState::Open);
    }

    #[test]
    fn half_open_allows_exactly_one_probe_then_resets_on_success() {
        let mut breaker = CircuitBreaker {
            key: "k".into(),
            state: BreakerState::Open,
            consecutive_failures: 2,
            opened_at: Some(chrono::Utc::now()),
            next_probe_at: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
            failure_threshold: 2,
            cooldown: HumanDuration::from_secs(30),
            version: 0,
        };
        let now = chrono::Utc::now();
        assert!(breaker_admits(&mut breaker, now));
        assert_eq!(breaker.state, BreakerState::HalfOpen);
        breaker_record_success(&mut breaker);
        assert_eq!(breaker.state, BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures, 0);
    }
}
