// SPDX-License-Identifier: MIT
//! Lifecycle event bus with SSE fan-out support.
//!
//! `publish` assigns strictly increasing event ids, keeps the last
//! [`RING_CAPACITY`] events for reconnect replay, and pushes into every
//! subscriber's bounded queue. A subscriber whose queue overflows is slow
//! and gets dropped; the gateway closes its response so the browser
//! reconnects with `Last-Event-ID`.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sessions::{Engine, SessionStatus};

/// Number of events retained for replay.
pub const RING_CAPACITY: usize = 1000;
/// Per-subscriber outbound queue bound; overflow marks the subscriber slow.
pub const SUBSCRIBER_QUEUE: usize = 256;

// ─── Event types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    SessionStarted {
        session_id: String,
        engine: Engine,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    SessionPaused {
        session_id: String,
        signal_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
    },
    SessionResumed {
        session_id: String,
        signal_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    SessionFinished {
        session_id: String,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Heartbeat {
        session_id: String,
        llm_calls_delta: u64,
        tokens_delta: u64,
        tool_calls_delta: u64,
        current_span_count: u64,
    },
    Progress {
        session_id: String,
        operation_id: String,
        percent: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    WaitingOnSignal {
        session_id: String,
        signal_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
    },
    /// Exporter alert: the traces disk is full; spans are being dropped.
    DiskSpaceLow { path: String },
    /// Exporter note: a peer process holds the writer lock.
    ExporterDisabled { reason: String },
}

/// An event plus the bus-assigned id and timestamp, exactly as serialized
/// into an SSE `data:` line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: u64,
    pub timestamp: String,
    #[serde(flatten)]
    pub event: Event,
}

// ─── Bus ──────────────────────────────────────────────────────────────────────

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<EventEnvelope>,
}

#[derive(Default)]
struct Inner {
    counter: u64,
    ring: VecDeque<EventEnvelope>,
    subscribers: Vec<SubscriberSlot>,
    next_subscriber: u64,
}

/// Returned by [`EventStream::subscribe`]: events missed since
/// `last_event_id` (as far as the ring reaches) plus the live queue.
pub struct EventSubscription {
    pub id: u64,
    pub replay: Vec<EventEnvelope>,
    pub rx: mpsc::Receiver<EventEnvelope>,
}

/// The process-wide lifecycle event bus.
#[derive(Default)]
pub struct EventStream {
    inner: Mutex<Inner>,
}

impl EventStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next id, record for replay, and enqueue to every
    /// subscriber. Slow subscribers (full queue) are dropped here; their
    /// streams end and the client reconnects.
    pub fn publish(&self, event: Event) -> u64 {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.counter += 1;
        let envelope = EventEnvelope {
            event_id: inner.counter,
            timestamp: Utc::now().to_rfc3339(),
            event,
        };

        inner.ring.push_back(envelope.clone());
        while inner.ring.len() > RING_CAPACITY {
            inner.ring.pop_front();
        }

        inner.subscribers.retain(|sub| {
            match sub.tx.try_send(envelope.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = sub.id, "slow SSE subscriber dropped");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = sub.id, "SSE subscriber disconnected");
                    false
                }
            }
        });

        envelope.event_id
    }

    /// Register a subscriber. When `last_event_id` is given, every retained
    /// event with a greater id is returned for replay before the live queue
    /// takes over; events older than the ring are gone and are not
    /// fabricated.
    pub fn subscribe(&self, last_event_id: Option<u64>) -> EventSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.next_subscriber += 1;
        let id = inner.next_subscriber;

        let replay = match last_event_id {
            Some(n) => inner
                .ring
                .iter()
                .filter(|e| e.event_id > n)
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        inner.subscribers.push(SubscriberSlot { id, tx });
        EventSubscription { id, replay, rx }
    }

    /// Drop every subscriber queue so their SSE streams end. Used at
    /// shutdown; each stream emits one final comment before closing.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.subscribers.clear();
    }

    pub fn unsubscribe(&self, subscriber_id: u64) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.subscribers.retain(|sub| sub.id != subscriber_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .expect("event bus poisoned")
            .subscribers
            .len()
    }

    /// Highest id assigned so far (0 before the first publish).
    pub fn last_event_id(&self) -> u64 {
        self.inner.lock().expect("event bus poisoned").counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(session: &str) -> Event {
        Event::Heartbeat {
            session_id: session.to_string(),
            llm_calls_delta: 0,
            tokens_delta: 0,
            tool_calls_delta: 0,
            current_span_count: 0,
        }
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let bus = EventStream::new();
        let a = bus.publish(heartbeat("s1"));
        let b = bus.publish(heartbeat("s1"));
        let c = bus.publish(heartbeat("s2"));
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn live_subscriber_receives_in_order() {
        let bus = EventStream::new();
        let mut sub = bus.subscribe(None);
        assert!(sub.replay.is_empty());

        bus.publish(heartbeat("s1"));
        bus.publish(heartbeat("s1"));

        let first = sub.rx.recv().await.unwrap();
        let second = sub.rx.recv().await.unwrap();
        assert_eq!(first.event_id + 1, second.event_id);
    }

    #[tokio::test]
    async fn replay_covers_gap_exactly_once() {
        let bus = EventStream::new();
        for _ in 0..10 {
            bus.publish(heartbeat("s1"));
        }
        let sub = bus.subscribe(Some(4));
        let ids: Vec<u64> = sub.replay.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![5, 6, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn ring_eviction_bounds_replay() {
        let bus = EventStream::new();
        for _ in 0..(RING_CAPACITY + 500) {
            bus.publish(heartbeat("s1"));
        }
        // Ring now holds ids 501..=1500; a client that stopped at 480 gets
        // everything the ring still has.
        let sub = bus.subscribe(Some(480));
        assert_eq!(sub.replay.len(), RING_CAPACITY);
        assert_eq!(sub.replay.first().unwrap().event_id, 501);
        assert_eq!(sub.replay.last().unwrap().event_id, 1500);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped() {
        let bus = EventStream::new();
        let _sub = bus.subscribe(None);
        assert_eq!(bus.subscriber_count(), 1);

        // Never drain: queue fills, then one more publish drops the slot.
        for _ in 0..(SUBSCRIBER_QUEUE + 1) {
            bus.publish(heartbeat("s1"));
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_slot() {
        let bus = EventStream::new();
        let sub = bus.subscribe(None);
        bus.unsubscribe(sub.id);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn envelope_serializes_flat() {
        let envelope = EventEnvelope {
            event_id: 7,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            event: Event::SessionStarted {
                session_id: "abcdef".to_string(),
                engine: Engine::Local,
                title: Some("demo".to_string()),
                metadata: None,
            },
        };
        let json: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "SessionStarted");
        assert_eq!(json["event_id"], 7);
        assert_eq!(json["session_id"], "abcdef");
        assert_eq!(json["engine"], "local");
    }
}
