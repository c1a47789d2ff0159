//! In-process publish/subscribe event bus (C4).
//!
//! Publishers emit [`BusEvent`]s tagged by a stable kind name (`run.started`,
//! `schedule.claimed`, ...); subscribers receive every event whose kind they
//! asked for, in publish order per publisher — cross-publisher order is not
//! guaranteed. A bounded ring of the most recent events (default 1000) is
//! kept so a subscriber that joins late can `replay_from` a sequence number.
//! Delivery is best-effort and in-memory only; nothing here is durable —
//! durable history is `orchestrator-events`'s job.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use orchestrator_types::RunId;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Stable event kind names emitted on the bus.
pub mod kind {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_NODE_STARTED: &str = "run.node_started";
    pub const RUN_NODE_SUCCEEDED: &str = "run.node_succeeded";
    pub const RUN_NODE_FAILED: &str = "run.node_failed";
    pub const RUN_FINISHED: &str = "run.finished";
    pub const SCHEDULE_CLAIMED: &str = "schedule.claimed";
    pub const SCHEDULE_DISPATCHED: &str = "schedule.dispatched";
    pub const SCHEDULE_FAILED: &str = "schedule.failed";
    pub const BREAKER_OPENED: &str = "breaker.opened";
    pub const BREAKER_CLOSED: &str = "breaker.closed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub seq: u64,
    pub kind: String,
    pub at: DateTime<Utc>,
    pub run_id: Option<RunId>,
    pub payload: serde_json::Value,
}

/// Delivered to a subscriber: either the next live event, or notice that
/// delivery fell behind the bounded history and some events were dropped.
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(BusEvent),
    Lagged { missed: u64 },
}

struct Inner {
    history: VecDeque<BusEvent>,
    capacity: usize,
    next_seq: u64,
}

/// The shared bus. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(Inner { history: VecDeque::with_capacity(capacity), capacity, next_seq: 0 })),
            sender,
        }
    }

    /// Publish an event tagged `kind`, returning its assigned sequence number.
    pub async fn publish(&self, kind: impl Into<String>, run_id: Option<RunId>, payload: serde_json::Value) -> u64 {
        self.publish_at(kind, run_id, payload, Utc::now()).await
    }

    pub async fn publish_at(
        &self,
        kind: impl Into<String>,
        run_id: Option<RunId>,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> u64 {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let event = BusEvent { seq, kind: kind.into(), at, run_id, payload };
        inner.history.push_back(event.clone());
        while inner.history.len() > inner.capacity {
            inner.history.pop_front();
        }
        drop(inner);
        // No active receivers is not an error: events are still recorded in history.
        let _ = self.sender.send(event);
        seq
    }

    /// Subscribe to every event whose `kind` is in `kinds` (empty = all kinds).
    pub fn subscribe(&self, kinds: Vec<String>) -> Subscription {
        Subscription { receiver: self.sender.subscribe(), kinds }
    }

    /// Return the retained history for kinds in `kinds` (empty = all) with
    /// `seq > after`, oldest first. Used by a subscriber that wants to
    /// replay before resuming live delivery.
    pub async fn replay_from(&self, after: u64, kinds: &[String]) -> Vec<BusEvent> {
        let inner = self.inner.lock().await;
        inner
            .history
            .iter()
            .filter(|e| e.seq > after)
            .filter(|e| kinds.is_empty() || kinds.contains(&e.kind))
            .cloned()
            .collect()
    }

    pub async fn oldest_retained_seq(&self) -> Option<u64> {
        self.inner.lock().await.history.front().map(|e| e.seq)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<BusEvent>,
    kinds: Vec<String>,
}

impl Subscription {
    /// Wait for the next matching event. Returns `Delivery::Lagged` if the
    /// receiver fell behind the broadcast channel's buffer before a
    /// matching event arrived.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.kinds.is_empty() || self.kinds.contains(&event.kind) {
                        return Some(Delivery::Event(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some(Delivery::Lagged { missed });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_only_requested_kinds() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(vec![kind::RUN_STARTED.to_string()]);
        bus.publish(kind::RUN_FINISHED, None, serde_json::json!({})).await;
        bus.publish(kind::RUN_STARTED, None, serde_json::json!({"a": 1})).await;

        match sub.recv().await.unwrap() {
            Delivery::Event(e) => assert_eq!(e.kind, kind::RUN_STARTED),
            Delivery::Lagged { .. } => panic!("unexpected lag"),
        }
    }

    #[tokio::test]
    async fn history_is_bounded_and_replayable() {
        let bus = EventBus::with_capacity(3);
        for i in 0..5 {
            bus.publish(kind::RUN_STARTED, None, serde_json::json!({"i": i})).await;
        }
        let replay = bus.replay_from(0, &[]).await;
        assert_eq!(replay.len(), 3);
        assert_eq!(replay.first().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag_notification() {
        let bus = EventBus::with_capacity(1000);
        let mut sub = bus.subscribe(vec![]);
        // Force the broadcast channel itself to overflow with a tiny capacity bus.
        let tiny = EventBus::with_capacity(2);
        let mut tiny_sub = tiny.subscribe(vec![]);
        for i in 0..10 {
            tiny.publish(kind::RUN_STARTED, None, serde_json::json!({"i": i})).await;
        }
        let mut saw_lag = false;
        while let Some(delivery) = tokio::time::timeout(std::time::Duration::from_millis(50), tiny_sub.recv())
            .await
            .ok()
            .flatten()
        {
            if matches!(delivery, Delivery::Lagged { .. }) {
                saw_lag = true;
                break;
            }
        }
        assert!(saw_lag);
        // Original bus/sub still usable, unaffected by the tiny one.
        bus.publish(kind::RUN_FINISHED, None, serde_json::json!({})).await;
        assert!(sub.recv().await.is_some());
    }
}
