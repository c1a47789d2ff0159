//! Clock & Trigger Source (C2): cron/interval/one-shot fire-time
//! computation, cancellable sleeps, and event-name subscriptions for the
//! dispatcher.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use orchestrator_bus::{BusEvent, EventBus};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCron(String, String),
    #[error("unknown time zone {0:?}")]
    UnknownTimeZone(String),
    #[error("cron expression {0:?} has no future fire time after {1}")]
    NoFutureFire(String, DateTime<Utc>),
}

pub type ClockResult<T> = Result<T, ClockError>;

/// Outcome of a cancellable sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Fired,
    Cancelled,
}

/// The C2 contract: everything the dispatcher needs to know about time and
/// external event triggers, abstracted so tests can swap in a fake clock.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn next_fire(&self, cron_expr: &str, after: DateTime<Utc>, tz: &str) -> ClockResult<DateTime<Utc>>;

    fn subscribe_event(&self, event_name: &str) -> orchestrator_bus::Subscription;

    async fn sleep_until(&self, ts: DateTime<Utc>, cancel: &CancellationToken) -> SleepOutcome;
}

pub struct SystemClock {
    bus: EventBus,
}

impl SystemClock {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

fn parse_tz(tz: &str) -> ClockResult<Tz> {
    Tz::from_str(tz).map_err(|_| ClockError::UnknownTimeZone(tz.to_string()))
}

/// Schedules are specified in the standard 5-field cron format (minute,
/// hour, day-of-month, month, day-of-week); the `cron` crate requires a
/// leading seconds field, so a 5-field expression gets `"0 "` prepended
/// before parsing. 6-field expressions (and anything else) pass through
/// untouched and let the parser report malformed input directly.
fn normalize_cron(cron_expr: &str) -> String {
    if cron_expr.split_whitespace().count() == 5 {
        format!("0 {cron_expr}")
    } else {
        cron_expr.to_string()
    }
}

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn next_fire(&self, cron_expr: &str, after: DateTime<Utc>, tz: &str) -> ClockResult<DateTime<Utc>> {
        let schedule = CronSchedule::from_str(&normalize_cron(cron_expr))
            .map_err(|e| ClockError::InvalidCron(cron_expr.to_string(), e.to_string()))?;
        let zone = parse_tz(tz)?;
        let after_in_tz = after.with_timezone(&zone);
        schedule
            .after(&after_in_tz)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| ClockError::NoFutureFire(cron_expr.to_string(), after))
    }

    fn subscribe_event(&self, event_name: &str) -> orchestrator_bus::Subscription {
        self.bus.subscribe(vec![event_name.to_string()])
    }

    async fn sleep_until(&self, ts: DateTime<Utc>, cancel: &CancellationToken) -> SleepOutcome {
        let now = Utc::now();
        let delta = (ts - now).to_std().unwrap_or(StdDuration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(delta) => SleepOutcome::Fired,
            _ = cancel.cancelled() => SleepOutcome::Cancelled,
        }
    }
}

/// Convenience helper: validate a cron expression eagerly (used by config
/// loading and `submit_schedule` input validation).
pub fn validate_cron(cron_expr: &str) -> ClockResult<()> {
    CronSchedule::from_str(&normalize_cron(cron_expr))
        .map(|_| ())
        .map_err(|e| ClockError::InvalidCron(cron_expr.to_string(), e.to_string()))
}

/// Wait for the next bus event matching `event_name`, honoring cancellation.
pub async fn await_event(
    sub: &mut orchestrator_bus::Subscription,
    cancel: &CancellationToken,
) -> Option<BusEvent> {
    loop {
        tokio::select! {
            delivery = sub.recv() => {
                match delivery {
                    Some(orchestrator_bus::Delivery::Event(e)) => return Some(e),
                    Some(orchestrator_bus::Delivery::Lagged { .. }) => continue,
                    None => return None,
                }
            }
            _ = cancel.cancelled() => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_fire_every_minute_advances_by_sixty_seconds() {
        let clock = SystemClock::new(EventBus::new());
        let after = Utc::now();
        let first = clock.next_fire("* * * * *", after, "UTC").unwrap();
        let second = clock.next_fire("* * * * *", first + chrono::Duration::milliseconds(1), "UTC").unwrap();
        assert!((second - first).num_seconds() >= 1);
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let clock = SystemClock::new(EventBus::new());
        assert!(clock.next_fire("not a cron", Utc::now(), "UTC").is_err());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let clock = SystemClock::new(EventBus::new());
        assert!(matches!(
            clock.next_fire("* * * * *", Utc::now(), "Mars/Phobos"),
            Err(ClockError::UnknownTimeZone(_))
        ));
    }

    #[test]
    fn six_field_cron_with_explicit_seconds_still_parses() {
        let clock = SystemClock::new(EventBus::new());
        assert!(clock.next_fire("* * * * * *", Utc::now(), "UTC").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_fires_at_target_time() {
        let clock = SystemClock::new(EventBus::new());
        let cancel = CancellationToken::new();
        let target = clock.now() + chrono::Duration::milliseconds(50);
        let outcome = clock.sleep_until(target, &cancel).await;
        assert_eq!(outcome, SleepOutcome::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_can_be_cancelled() {
        let clock = SystemClock::new(EventBus::new());
        let cancel = CancellationToken::new();
        let target = clock.now() + chrono::Duration::seconds(30);
        cancel.cancel();
        let outcome = clock.sleep_until(target, &cancel).await;
        assert_eq!(outcome, SleepOutcome::Cancelled);
    }
}
