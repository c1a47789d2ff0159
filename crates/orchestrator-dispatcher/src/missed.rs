//! Missed-fire policy (§4.7): when a schedule's `next_fire_at` is found
//! behind `now` by more than one period, decide which instants to dispatch.

use chrono::{DateTime, Utc};
use orchestrator_clock::Clock;
use orchestrator_types::{MissedFirePolicy, TriggerSpec};

/// Default time zone used for cron computation. `Schedule`/`TriggerSpec`
/// don't carry a per-schedule zone, so every cron expression in this
/// deployment is interpreted in UTC.
pub const DEFAULT_TZ: &str = "UTC";

fn next_after(clock: &dyn Clock, trigger: &TriggerSpec, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        TriggerSpec::Cron { expr } => clock.next_fire(expr, after, DEFAULT_TZ).ok(),
        TriggerSpec::Interval { period } => Some(after + chrono::Duration::from_std(period.as_duration()).ok()?),
        TriggerSpec::OneShot { .. } => None,
        TriggerSpec::Event { .. } => None,
    }
}

/// The instants a schedule whose `next_fire_at` is `original` (already
/// `<= now`) should actually fire at, given `policy`, plus the fire time
/// to resume ticking from afterward.
pub struct MissedFireDecision {
    /// Fire instants to dispatch, in order. Empty for `skip_missed`.
    pub fire_at: Vec<DateTime<Utc>>,
    /// `next_fire_at` to persist once these fires are dispatched.
    pub resume_at: Option<DateTime<Utc>>,
}

pub fn resolve(
    clock: &dyn Clock,
    trigger: &TriggerSpec,
    original: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: MissedFirePolicy,
    max_backfill: u32,
) -> MissedFireDecision {
    // one_shot/event schedules never have more than one fire pending;
    // the normal claim path already handles them without this machinery.
    if matches!(trigger, TriggerSpec::OneShot { .. } | TriggerSpec::Event { .. }) {
        return MissedFireDecision { fire_at: vec![original], resume_at: None };
    }

    let mut instants = vec![original];
    let mut cursor = original;
    while instants.len() < max_backfill as usize + 1 {
        match next_after(clock, trigger, cursor + chrono::Duration::milliseconds(1)) {
            Some(next) if next <= now => {
                instants.push(next);
                cursor = next;
            }
            _ => break,
        }
    }
    let resume_at = next_after(clock, trigger, cursor + chrono::Duration::milliseconds(1));

    match policy {
        MissedFirePolicy::Coalesce => MissedFireDecision {
            fire_at: instants.last().cloned().into_iter().collect(),
            resume_at,
        },
        MissedFirePolicy::FireAll => MissedFireDecision { fire_at: instants, resume_at },
        MissedFirePolicy::SkipMissed => MissedFireDecision { fire_at: Vec::new(), resume_at },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_bus::EventBus;
    use orchestrator_clock::SystemClock;

    #[test]
    fn coalesce_keeps_only_the_most_recent_instant() {
        let clock = SystemClock::new(EventBus::new());
        let now = Utc::now();
        let original = now - chrono::Duration::minutes(5);
        let trigger = TriggerSpec::Cron { expr: "* * * * *".to_string() };
        let decision = resolve(&clock, &trigger, original, now, MissedFirePolicy::Coalesce, 10);
        assert_eq!(decision.fire_at.len(), 1);
        assert!(decision.fire_at[0] > original);
    }

    #[test]
    fn fire_all_is_bounded_by_max_backfill() {
        let clock = SystemClock::new(EventBus::new());
        let now = Utc::now();
        let original = now - chrono::Duration::minutes(5);
        let trigger = TriggerSpec::Cron { expr: "* * * * *".to_string() };
        let decision = resolve(&clock, &trigger, original, now, MissedFirePolicy::FireAll, 2);
        assert!(decision.fire_at.len() <= 3);
    }

    #[test]
    fn skip_missed_produces_no_fires() {
        let clock = SystemClock::new(EventBus::new());
        let now = Utc::now();
        let original = now - chrono::Duration::minutes(5);
        let trigger = TriggerSpec::Cron { expr: "* * * * *".to_string() };
        let decision = resolve(&clock, &trigger, original, now, MissedFirePolicy::SkipMissed, 10);
        assert!(decision.fire_at.is_empty());
        assert!(decision.resume_at.is_some());
    }
}
