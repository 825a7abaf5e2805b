// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Thread-safe registry of machine states, camera statuses, recording
//! sessions and the bus-event ring. A single mutex guards everything;
//! readers get immutable snapshots, never references into the store.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use serde::Serialize;

const BUS_EVENT_RING_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Unknown,
    On,
    Off,
    Error,
    /// An unrecognized payload that still needs to be surfaced somewhere.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraStatus {
    Unknown,
    Available,
    Busy,
    Error,
    Disconnected,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Recording,
    Stopping,
    Idle,
    Error,
}

/// Normalize a raw bus payload per the case-insensitive/trimmed table. The
/// raw text is lowercased only for comparison; callers retain the original
/// payload for the bus-event ring.
pub fn normalize_payload(raw: &str) -> (MachineState, Option<&'static str>) {
    let trimmed = raw.trim().to_ascii_lowercase();
    match trimmed.as_str() {
        "on" | "true" | "1" | "start" | "running" | "active" => (MachineState::On, None),
        "off" | "false" | "0" | "stop" | "stopped" | "inactive" => (MachineState::Off, None),
        "error" | "fault" | "alarm" => (MachineState::Error, None),
        _ => (MachineState::Raw, Some("unrecognized payload folded to raw state")),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineInfo {
    pub name: String,
    pub state: MachineState,
    pub last_updated: DateTime<FixedOffset>,
    pub last_message: Option<String>,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub name: String,
    pub status: CameraStatus,
    pub last_checked: DateTime<FixedOffset>,
    pub last_error: Option<String>,
    pub device_info: Option<serde_json::Value>,
    pub current_recording_filename: Option<String>,
    pub recording_start_time: Option<DateTime<FixedOffset>>,
    pub auto_recording_enabled: bool,
    pub auto_recording_active: bool,
    pub auto_recording_failure_count: u32,
    pub auto_recording_last_attempt: Option<DateTime<FixedOffset>>,
    pub auto_recording_last_error: Option<String>,
}

impl CameraInfo {
    fn new(name: &str, now: DateTime<FixedOffset>) -> Self {
        Self {
            name: name.to_string(),
            status: CameraStatus::Unknown,
            last_checked: now,
            last_error: None,
            device_info: None,
            current_recording_filename: None,
            recording_start_time: None,
            auto_recording_enabled: false,
            auto_recording_active: false,
            auto_recording_failure_count: 0,
            auto_recording_last_attempt: None,
            auto_recording_last_error: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.current_recording_filename.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingSession {
    pub id: u64,
    pub camera_name: String,
    pub filename: String,
    pub start_time: DateTime<FixedOffset>,
    pub state: SessionState,
    pub end_time: Option<DateTime<FixedOffset>>,
    pub bytes_written: u64,
    pub frames_written: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusEventRecord {
    pub sequence: u64,
    pub machine_name: String,
    pub topic: String,
    pub raw_payload: String,
    pub normalized_state: MachineState,
    pub timestamp: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemSummary {
    pub system_started: bool,
    pub bus_connected: bool,
    pub last_bus_message: Option<DateTime<FixedOffset>>,
    pub uptime_seconds: f64,
    pub active_recordings: usize,
    pub total_recordings: usize,
    pub machines: HashMap<String, MachineInfo>,
    pub cameras: HashMap<String, CameraInfo>,
}

struct Inner {
    machines: HashMap<String, MachineInfo>,
    cameras: HashMap<String, CameraInfo>,
    sessions: HashMap<u64, RecordingSession>,
    next_session_id: u64,
    total_recordings: usize,
    bus_events: VecDeque<BusEventRecord>,
    next_bus_sequence: u64,
    system_started: bool,
    bus_connected: bool,
    last_bus_message: Option<DateTime<FixedOffset>>,
}

/// Single mutex-guarded registry. All public methods take `&self`; internal
/// helpers reuse the same guard rather than re-locking, since
/// `parking_lot::Mutex` is not reentrant.
pub struct StateStore {
    inner: Mutex<Inner>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                machines: HashMap::new(),
                cameras: HashMap::new(),
                sessions: HashMap::new(),
                next_session_id: 1,
                total_recordings: 0,
                bus_events: VecDeque::with_capacity(BUS_EVENT_RING_SIZE),
                next_bus_sequence: 1,
                system_started: false,
                bus_connected: false,
                last_bus_message: None,
            }),
        }
    }

    pub fn mark_started(&self) {
        self.inner.lock().system_started = true;
    }

    pub fn set_bus_connected(&self, connected: bool) {
        self.inner.lock().bus_connected = connected;
    }

    /// Normalize `raw_payload`, update (or create) the machine record, and
    /// report whether the normalized state differs from the prior one.
    pub fn update_machine(
        &self,
        name: &str,
        raw_payload: &str,
        topic: &str,
        now: DateTime<FixedOffset>,
    ) -> bool {
        let (state, _warning) = normalize_payload(raw_payload);
        let mut inner = self.inner.lock();
        let changed = match inner.machines.get(name) {
            Some(existing) => existing.state != state,
            None => true,
        };
        inner.machines.insert(
            name.to_string(),
            MachineInfo {
                name: name.to_string(),
                state,
                last_updated: now,
                last_message: Some(raw_payload.to_string()),
                topic: Some(topic.to_string()),
            },
        );
        changed
    }

    pub fn update_camera(
        &self,
        name: &str,
        status: CameraStatus,
        error: Option<String>,
        device_info: Option<serde_json::Value>,
        now: DateTime<FixedOffset>,
    ) -> bool {
        let mut inner = self.inner.lock();
        let changed = inner
            .cameras
            .get(name)
            .map(|c| c.status != status)
            .unwrap_or(true);
        let entry = inner
            .cameras
            .entry(name.to_string())
            .or_insert_with(|| CameraInfo::new(name, now));
        entry.status = status;
        entry.last_checked = now;
        if error.is_some() {
            entry.last_error = error;
        }
        if device_info.is_some() {
            entry.device_info = device_info;
        }
        changed
    }

    /// Enforce `is_recording ⇔ current_recording_filename ≠ None`.
    pub fn set_camera_recording(
        &self,
        name: &str,
        recording: bool,
        filename: Option<String>,
        now: DateTime<FixedOffset>,
    ) {
        let mut inner = self.inner.lock();
        let entry = inner
            .cameras
            .entry(name.to_string())
            .or_insert_with(|| CameraInfo::new(name, now));
        if recording {
            entry.current_recording_filename = filename;
            entry.recording_start_time = Some(now);
        } else {
            entry.current_recording_filename = None;
            entry.recording_start_time = None;
        }
    }

    pub fn set_auto_recording_enabled(&self, name: &str, enabled: bool, now: DateTime<FixedOffset>) {
        let mut inner = self.inner.lock();
        let entry = inner
            .cameras
            .entry(name.to_string())
            .or_insert_with(|| CameraInfo::new(name, now));
        entry.auto_recording_enabled = enabled;
    }

    pub fn record_auto_recording_attempt(
        &self,
        name: &str,
        success: bool,
        error: Option<String>,
        now: DateTime<FixedOffset>,
    ) {
        let mut inner = self.inner.lock();
        let entry = inner
            .cameras
            .entry(name.to_string())
            .or_insert_with(|| CameraInfo::new(name, now));
        entry.auto_recording_last_attempt = Some(now);
        if success {
            entry.auto_recording_active = true;
            entry.auto_recording_failure_count = 0;
            entry.auto_recording_last_error = None;
        } else {
            entry.auto_recording_failure_count += 1;
            entry.auto_recording_last_error = error;
        }
    }

    pub fn mark_auto_recording_stopped(&self, name: &str, now: DateTime<FixedOffset>) {
        let mut inner = self.inner.lock();
        let entry = inner
            .cameras
            .entry(name.to_string())
            .or_insert_with(|| CameraInfo::new(name, now));
        entry.auto_recording_active = false;
    }

    pub fn start_session(&self, camera: &str, filename: &str, now: DateTime<FixedOffset>) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_session_id;
        inner.next_session_id += 1;
        inner.total_recordings += 1;
        inner.sessions.insert(
            id,
            RecordingSession {
                id,
                camera_name: camera.to_string(),
                filename: filename.to_string(),
                start_time: now,
                state: SessionState::Recording,
                end_time: None,
                bytes_written: 0,
                frames_written: 0,
                error_message: None,
            },
        );
        id
    }

    pub fn stop_session(&self, id: u64, bytes: u64, frames: u64, now: DateTime<FixedOffset>) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.state = SessionState::Idle;
            session.end_time = Some(now);
            session.bytes_written = bytes;
            session.frames_written = frames;
        }
    }

    pub fn error_session(&self, id: u64, message: &str, now: DateTime<FixedOffset>) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.state = SessionState::Error;
            session.end_time = Some(now);
            session.error_message = Some(message.to_string());
        }
    }

    pub fn session(&self, id: u64) -> Option<RecordingSession> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    pub fn add_bus_event(
        &self,
        machine_name: &str,
        topic: &str,
        raw_payload: &str,
        normalized_state: MachineState,
        now: DateTime<FixedOffset>,
    ) {
        let mut inner = self.inner.lock();
        let sequence = inner.next_bus_sequence;
        inner.next_bus_sequence += 1;
        inner.last_bus_message = Some(now);
        if inner.bus_events.len() == BUS_EVENT_RING_SIZE {
            inner.bus_events.pop_front();
        }
        inner.bus_events.push_back(BusEventRecord {
            sequence,
            machine_name: machine_name.to_string(),
            topic: topic.to_string(),
            raw_payload: raw_payload.to_string(),
            normalized_state,
            timestamp: now,
        });
    }

    pub fn recent_bus_events(&self, limit: usize) -> (Vec<BusEventRecord>, usize) {
        let inner = self.inner.lock();
        let total = inner.bus_events.len();
        let events = inner
            .bus_events
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

    pub fn machine(&self, name: &str) -> Option<MachineInfo> {
        self.inner.lock().machines.get(name).cloned()
    }

    pub fn camera(&self, name: &str) -> Option<CameraInfo> {
        self.inner.lock().cameras.get(name).cloned()
    }

    pub fn machines(&self) -> HashMap<String, MachineInfo> {
        self.inner.lock().machines.clone()
    }

    pub fn cameras(&self) -> HashMap<String, CameraInfo> {
        self.inner.lock().cameras.clone()
    }

    /// Immutable snapshot suitable for serialization to `/system/status`.
    pub fn system_summary(&self, uptime_seconds: f64) -> SystemSummary {
        let inner = self.inner.lock();
        let active_recordings = inner
            .cameras
            .values()
            .filter(|c| c.is_recording())
            .count();
        SystemSummary {
            system_started: inner.system_started,
            bus_connected: inner.bus_connected,
            last_bus_message: inner.last_bus_message,
            uptime_seconds,
            active_recordings,
            total_recordings: inner.total_recordings,
            machines: inner.machines.clone(),
            cameras: inner.cameras.clone(),
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<FixedOffset> {
        chrono::Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap())
    }

    #[test]
    fn payload_normalization_table() {
        assert_eq!(normalize_payload("ON").0, MachineState::On);
        assert_eq!(normalize_payload(" on ").0, MachineState::On);
        assert_eq!(normalize_payload("1").0, MachineState::On);
        assert_eq!(normalize_payload("off").0, MachineState::Off);
        assert_eq!(normalize_payload("FAULT").0, MachineState::Error);
        assert_eq!(normalize_payload("gibberish").0, MachineState::Raw);
    }

    #[test]
    fn update_machine_reports_change_only_on_transition() {
        let store = StateStore::new();
        assert!(store.update_machine("m1", "on", "t1", now()));
        assert!(!store.update_machine("m1", "ON", "t1", now()));
        assert!(store.update_machine("m1", "off", "t1", now()));
    }

    #[test]
    fn recording_invariant_holds_through_start_and_stop() {
        let store = StateStore::new();
        store.set_camera_recording("camera1", true, Some("clip.mp4".into()), now());
        assert!(store.camera("camera1").unwrap().is_recording());
        store.set_camera_recording("camera1", false, None, now());
        assert!(!store.camera("camera1").unwrap().is_recording());
    }

    #[test]
    fn bus_event_ring_is_bounded_with_increasing_sequence() {
        let store = StateStore::new();
        for i in 0..(BUS_EVENT_RING_SIZE + 5) {
            store.add_bus_event("m", "t", &format!("{i}"), MachineState::On, now());
        }
        let (events, total) = store.recent_bus_events(BUS_EVENT_RING_SIZE + 5);
        assert_eq!(total, BUS_EVENT_RING_SIZE);
        assert_eq!(events.len(), BUS_EVENT_RING_SIZE);
        for pair in events.windows(2) {
            assert!(pair[1].sequence > pair[0].sequence);
        }
    }

    #[test]
    fn system_summary_counts_active_recordings() {
        let store = StateStore::new();
        store.set_camera_recording("camera1", true, Some("a.mp4".into()), now());
        store.set_camera_recording("camera2", false, None, now());
        let summary = store.system_summary(1.0);
        assert_eq!(summary.active_recordings, 1);
        assert_eq!(summary.cameras.len(), 2);
    }
}
