// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! In-process typed publish/subscribe event bus with bounded history.
//!
//! Delivery is synchronous on the publisher's context; subscribers must not
//! block on I/O. A subscriber that panics is isolated via `catch_unwind` so
//! one bad callback does not take down fan-out to its peers.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

const MAX_HISTORY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MachineStateChanged,
    CameraStatusChanged,
    RecordingStarted,
    RecordingStopped,
    RecordingError,
    BusConnected,
    BusDisconnected,
    SystemShutdown,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::MachineStateChanged,
        EventType::CameraStatusChanged,
        EventType::RecordingStarted,
        EventType::RecordingStopped,
        EventType::RecordingError,
        EventType::BusConnected,
        EventType::BusDisconnected,
        EventType::SystemShutdown,
    ];

    fn index(&self) -> usize {
        Self::ALL.iter().position(|t| t == self).unwrap()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub source: String,
    pub data: Value,
    pub timestamp: DateTime<FixedOffset>,
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

struct Inner {
    subscribers: Vec<Vec<Subscriber>>,
    history: VecDeque<Event>,
}

/// Typed, in-process event bus. Cheap to clone (`Arc` inside).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                subscribers: (0..EventType::ALL.len()).map(|_| Vec::new()).collect(),
                history: VecDeque::with_capacity(MAX_HISTORY),
            })),
        }
    }

    /// Register a callback for `event_type`. Returns nothing identifying the
    /// subscription; this bus does not support unsubscribing, matching the
    /// originating system's fire-and-forget subscription model.
    pub fn subscribe<F>(&self, event_type: EventType, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        inner.subscribers[event_type.index()].push(Arc::new(callback));
    }

    /// Publish an event: append to history, then fan out synchronously to
    /// every subscriber of this type. A subscriber panic is caught, logged,
    /// and does not prevent delivery to the remaining subscribers.
    pub fn publish(
        &self,
        event_type: EventType,
        source: impl Into<String>,
        data: Value,
        now: DateTime<FixedOffset>,
    ) {
        let event = Event {
            event_type,
            source: source.into(),
            data,
            timestamp: now,
        };

        // Snapshot the subscriber list and push history under one short lock,
        // then invoke callbacks with the lock released so a subscriber that
        // calls back into publish()/subscribe() cannot deadlock.
        let callbacks: Vec<Subscriber> = {
            let mut inner = self.inner.lock();
            if inner.history.len() == MAX_HISTORY {
                inner.history.pop_front();
            }
            inner.history.push_back(event.clone());
            inner.subscribers[event_type.index()].clone()
        };

        for (i, callback) in callbacks.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| callback(&event)));
            if let Err(panic) = result {
                let message = panic_message(&panic);
                error!(
                    event_type = ?event.event_type,
                    subscriber_index = i,
                    error = %message,
                    "event subscriber panicked"
                );
            }
        }
    }

    /// Return the last `limit` events (oldest first) plus the total number
    /// of events ever retained (bounded by `MAX_HISTORY`).
    pub fn recent(&self, limit: usize) -> (Vec<Event>, usize) {
        let inner = self.inner.lock();
        let total = inner.history.len();
        let events: Vec<Event> = inner
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        (events, total)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Clamp a `limit` query parameter into `[1, max]`, defaulting to `default`
/// when absent. Used by both `/mqtt/events` ([1,50]) and `/storage/files`
/// ([1,1000]).
pub fn clamp_limit(limit: Option<usize>, default: usize, max: usize) -> usize {
    limit.unwrap_or(default).clamp(1, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<FixedOffset> {
        chrono::Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap())
    }

    #[test]
    fn subscribers_receive_published_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(EventType::MachineStateChanged, move |e| {
            seen_clone.lock().push(e.source.clone());
        });
        bus.publish(EventType::MachineStateChanged, "a", Value::Null, now());
        bus.publish(EventType::MachineStateChanged, "b", Value::Null, now());
        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn panicking_subscriber_does_not_block_peers() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventType::RecordingError, |_| panic!("boom"));
        let seen_clone = seen.clone();
        bus.subscribe(EventType::RecordingError, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(EventType::RecordingError, "recorder", Value::Null, now());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn history_is_bounded_and_in_publish_order() {
        let bus = EventBus::new();
        for i in 0..(MAX_HISTORY + 10) {
            bus.publish(
                EventType::SystemShutdown,
                format!("s{i}"),
                Value::Null,
                now(),
            );
        }
        let (events, total) = bus.recent(5);
        assert_eq!(total, MAX_HISTORY);
        assert_eq!(events.len(), 5);
        assert_eq!(
            events.last().unwrap().source,
            format!("s{}", MAX_HISTORY + 9)
        );
    }

    #[test]
    fn clamp_limit_respects_bounds() {
        assert_eq!(clamp_limit(None, 20, 50), 20);
        assert_eq!(clamp_limit(Some(0), 20, 50), 1);
        assert_eq!(clamp_limit(Some(1000), 20, 50), 50);
        assert_eq!(clamp_limit(Some(10), 20, 50), 10);
    }
}
