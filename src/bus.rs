// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Bus Client: connects to the plant message bus, maps topics to machine
//! names, and republishes machine state changes onto the in-process
//! `EventBus`. The wire transport is abstracted behind `BusTransport` so the
//! rest of the crate never depends on a specific broker client (§1); the
//! vendor MQTT broker is out of scope, `SimulatedBroker` stands in for it in
//! tests and in the reference deployment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::BusConfig;
use crate::events::{Event, EventBus, EventType};
use crate::state::StateStore;

const LOOP_IDLE_DELAY: Duration = Duration::from_millis(100);

/// A single bus message as delivered by the transport.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

/// Wire transport abstraction. A real implementation would wrap an MQTT
/// client; `connect`/`subscribe` may block briefly but must not spin.
pub trait BusTransport: Send + Sync {
    fn connect(&self) -> Result<(), String>;
    fn disconnect(&self);
    fn subscribe(&self, topic: &str) -> Result<(), String>;
    /// Non-blocking receive of the next message, if any arrived since the
    /// last poll.
    fn try_recv(&self) -> Option<BusMessage>;
    fn publish(&self, topic: &str, payload: &str) -> Result<(), String>;
    fn is_connected(&self) -> bool;
}

/// In-process broker for tests and the reference deployment: messages
/// `inject`ed by a test (or a local admin endpoint) are delivered to
/// whichever topics are currently subscribed.
pub struct SimulatedBroker {
    connected: Mutex<bool>,
    subscriptions: Mutex<Vec<String>>,
    inbox: Mutex<Vec<BusMessage>>,
    /// When set, the next N `connect()` calls fail, to exercise the
    /// reconnect/backoff path.
    fail_next_connects: Mutex<u32>,
}

impl SimulatedBroker {
    pub fn new() -> Self {
        Self {
            connected: Mutex::new(false),
            subscriptions: Mutex::new(Vec::new()),
            inbox: Mutex::new(Vec::new()),
            fail_next_connects: Mutex::new(0),
        }
    }

    pub fn fail_next_connects(&self, count: u32) {
        *self.fail_next_connects.lock() = count;
    }

    /// Test/admin hook: deliver a message on `topic` if something is
    /// subscribed to it.
    pub fn inject(&self, topic: &str, payload: &str) {
        if self.subscriptions.lock().iter().any(|t| t == topic) {
            self.inbox.lock().push(BusMessage {
                topic: topic.to_string(),
                payload: payload.to_string(),
            });
        }
    }
}

impl Default for SimulatedBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BusTransport for SimulatedBroker {
    fn connect(&self) -> Result<(), String> {
        let mut remaining = self.fail_next_connects.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err("simulated connect failure".to_string());
        }
        *self.connected.lock() = true;
        Ok(())
    }

    fn disconnect(&self) {
        *self.connected.lock() = false;
        self.subscriptions.lock().clear();
    }

    fn subscribe(&self, topic: &str) -> Result<(), String> {
        if !*self.connected.lock() {
            return Err("not connected".to_string());
        }
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    fn try_recv(&self) -> Option<BusMessage> {
        let mut inbox = self.inbox.lock();
        if inbox.is_empty() {
            None
        } else {
            Some(inbox.remove(0))
        }
    }

    fn publish(&self, _topic: &str, _payload: &str) -> Result<(), String> {
        if !*self.connected.lock() {
            return Err("not connected".to_string());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }
}

enum Command {
    Shutdown,
}

/// Snapshot of the bus client's connection and traffic counters, as exposed
/// by `GET /mqtt/status`.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub connected: bool,
    pub broker_address: String,
    pub topics: Vec<String>,
    pub message_count: u64,
    pub error_count: u64,
    pub last_message_time: Option<DateTime<FixedOffset>>,
    pub uptime_seconds: f64,
}

/// Owns the bus connection lifecycle: connect, subscribe, poll, reconnect
/// with backoff, and republish `machine_state_changed` onto the event bus.
pub struct BusClient {
    transport: Arc<dyn BusTransport>,
    topic_to_machine: HashMap<String, String>,
    broker_address: String,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    message_count: AtomicU64,
    error_count: AtomicU64,
    last_message_time: Mutex<Option<DateTime<FixedOffset>>>,
    connected_since: Mutex<Option<Instant>>,
}

impl BusClient {
    pub fn new(transport: Arc<dyn BusTransport>, config: &BusConfig) -> Self {
        let topic_to_machine = config
            .topics
            .iter()
            .map(|(machine, topic)| (topic.clone(), machine.clone()))
            .collect();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            topic_to_machine,
            broker_address: format!("{}:{}", config.broker_host, config.broker_port),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_seconds),
            max_reconnect_attempts: config.max_reconnect_attempts,
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_message_time: Mutex::new(None),
            connected_since: Mutex::new(None),
        }
    }

    /// Current connection and traffic counters.
    pub fn stats(&self) -> BusStats {
        let uptime_seconds = self
            .connected_since
            .lock()
            .map(|since| since.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        BusStats {
            connected: self.transport.is_connected(),
            broker_address: self.broker_address.clone(),
            topics: self.topic_to_machine.keys().cloned().collect(),
            message_count: self.message_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_message_time: *self.last_message_time.lock(),
            uptime_seconds,
        }
    }

    /// Spawns the connect/poll/reconnect loop as a background task. The
    /// returned handle resolves once `shutdown()` is called or the loop
    /// gives up after exhausting reconnect attempts.
    pub fn spawn(
        self: Arc<Self>,
        state: Arc<StateStore>,
        events: Arc<EventBus>,
        clock: Arc<Clock>,
    ) -> JoinHandle<()> {
        let mut command_rx = self
            .command_rx
            .lock()
            .take()
            .expect("BusClient::spawn called more than once");
        tokio::spawn(async move {
            let mut reconnect_attempts: u32 = 0;

            'outer: loop {
                if !self.transport.is_connected() {
                    match self.transport.connect() {
                        Ok(()) => {
                            reconnect_attempts = 0;
                            *self.connected_since.lock() = Some(Instant::now());
                            state.set_bus_connected(true);
                            events.publish(
                                EventType::BusConnected,
                                "bus_client",
                                json!({}),
                                clock.now(),
                            );
                            for topic in self.topic_to_machine.keys() {
                                if let Err(err) = self.transport.subscribe(topic) {
                                    self.error_count.fetch_add(1, Ordering::Relaxed);
                                    error!(topic, error = %err, "failed to subscribe to bus topic");
                                }
                            }
                        }
                        Err(err) => {
                            self.error_count.fetch_add(1, Ordering::Relaxed);
                            reconnect_attempts += 1;
                            warn!(
                                attempt = reconnect_attempts,
                                max = self.max_reconnect_attempts,
                                error = %err,
                                "bus connect failed"
                            );
                            if reconnect_attempts >= self.max_reconnect_attempts {
                                error!("bus client giving up after max reconnect attempts");
                                *self.connected_since.lock() = None;
                                state.set_bus_connected(false);
                                events.publish(
                                    EventType::BusDisconnected,
                                    "bus_client",
                                    json!({ "fatal": true }),
                                    clock.now(),
                                );
                                break 'outer;
                            }
                            if wait_or_shutdown(&mut command_rx, self.reconnect_delay).await {
                                break 'outer;
                            }
                            continue;
                        }
                    }
                }

                if let Some(message) = self.transport.try_recv() {
                    self.handle_message(message, &state, &events, &clock);
                }

                if !self.transport.is_connected() {
                    *self.connected_since.lock() = None;
                    state.set_bus_connected(false);
                    events.publish(
                        EventType::BusDisconnected,
                        "bus_client",
                        json!({ "fatal": false }),
                        clock.now(),
                    );
                    continue;
                }

                if wait_or_shutdown(&mut command_rx, LOOP_IDLE_DELAY).await {
                    break 'outer;
                }
            }

            self.transport.disconnect();
            info!("bus client loop ended");
        })
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }

    pub fn publish(&self, topic: &str, payload: &str) -> Result<(), String> {
        self.transport.publish(topic, payload)
    }

    fn handle_message(
        &self,
        message: BusMessage,
        state: &StateStore,
        events: &EventBus,
        clock: &Clock,
    ) {
        let now = clock.now();
        debug!(topic = %message.topic, payload = %message.payload, "bus message received");
        self.message_count.fetch_add(1, Ordering::Relaxed);
        *self.last_message_time.lock() = Some(now);

        let Some(machine_name) = self.topic_to_machine.get(&message.topic).cloned() else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %message.topic, "message on unmapped topic");
            return;
        };

        let (normalized, warning) = crate::state::normalize_payload(&message.payload);
        if let Some(warning) = warning {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %message.topic, payload = %message.payload, warning, "unrecognized bus payload");
        }
        state.add_bus_event(&machine_name, &message.topic, &message.payload, normalized, now);
        state.update_machine(&machine_name, &message.payload, &message.topic, now);
        events.publish(
            EventType::MachineStateChanged,
            "bus_client",
            json!({
                "machine_name": machine_name,
                "raw_payload": message.payload,
                "state": format!("{normalized:?}"),
            }),
            now,
        );
    }
}

/// Waits for either the delay to elapse or a shutdown command; returns
/// `true` if shutdown was requested.
async fn wait_or_shutdown(rx: &mut mpsc::UnboundedReceiver<Command>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        cmd = rx.recv() => matches!(cmd, Some(Command::Shutdown) | None),
    }
}

/// Builds a closure suitable for `EventBus::subscribe` that forwards machine
/// state changes into downstream camera logic; kept free of any direct
/// dependency on the camera manager to avoid a module cycle.
pub fn log_machine_state_changes() -> impl Fn(&Event) + Send + Sync + 'static {
    |event: &Event| {
        debug!(?event.event_type, source = %event.source, "event observed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use std::sync::Arc;

    fn test_config() -> BusConfig {
        let mut topics = HashMap::new();
        topics.insert("press1".to_string(), "plant/press1/state".to_string());
        BusConfig {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            username: None,
            password: None,
            topics,
            reconnect_delay_seconds: 0,
            max_reconnect_attempts: 3,
        }
    }

    #[tokio::test]
    async fn connects_subscribes_and_routes_message() {
        let broker = Arc::new(SimulatedBroker::new());
        let config = test_config();
        let client = Arc::new(BusClient::new(broker.clone(), &config));
        let state = Arc::new(StateStore::new());
        let events = Arc::new(EventBus::new());
        let clock = Arc::new(Clock::utc());

        let handle = client
            .clone()
            .spawn(state.clone(), events.clone(), clock.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.inject("plant/press1/state", "on");
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(state.machine("press1").is_some());
        client.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn gives_up_after_max_reconnect_attempts() {
        let broker = Arc::new(SimulatedBroker::new());
        broker.fail_next_connects(100);
        let config = test_config();
        let client = Arc::new(BusClient::new(broker.clone(), &config));
        let state = Arc::new(StateStore::new());
        let events = Arc::new(EventBus::new());
        let clock = Arc::new(Clock::utc());

        let handle = client.spawn(state.clone(), events, clock);
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok());
        assert!(!state.system_summary(0.0).bus_connected);
    }
}
