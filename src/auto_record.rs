// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Auto-Record Controller: turns machine on/off events into recorder
//! start/stop calls, with bounded per-camera retry when a start attempt
//! fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::camera_manager::CameraManager;
use crate::clock::Clock;
use crate::config::Config;
use crate::events::{Event, EventBus, EventType};
use crate::recorder::StartOverrides;
use crate::state::StateStore;

const RETRY_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct RetryEntry {
    camera_name: String,
    attempt_count: u32,
    max_retries: u32,
    delay: Duration,
    next_attempt_at: std::time::Instant,
    exposure_ms: f64,
    gain: f64,
    target_fps: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryStatus {
    pub attempt_count: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoRecordStatus {
    pub enabled: bool,
    pub retry_queue: HashMap<String, RetryStatus>,
}

struct Inner {
    machine_to_cameras: HashMap<String, Vec<String>>,
    retry_queue: HashMap<String, RetryEntry>,
}

/// Policy engine subscribed to `machine_state_changed`; a single background
/// ticker drains the per-camera retry queue once a second.
pub struct AutoRecordController {
    camera_manager: Arc<CameraManager>,
    state_store: Arc<StateStore>,
    events: Arc<EventBus>,
    clock: Arc<Clock>,
    enabled: bool,
    inner: Mutex<Inner>,
}

impl AutoRecordController {
    pub fn new(
        config: &Config,
        camera_manager: Arc<CameraManager>,
        state_store: Arc<StateStore>,
        events: Arc<EventBus>,
        clock: Arc<Clock>,
    ) -> Arc<Self> {
        let mut machine_to_cameras: HashMap<String, Vec<String>> = HashMap::new();
        for camera in &config.cameras {
            if camera.enabled && camera.auto_start_recording_enabled {
                machine_to_cameras
                    .entry(camera.machine_topic.clone())
                    .or_default()
                    .push(camera.name.clone());
            }
        }

        Arc::new(Self {
            camera_manager,
            state_store,
            events,
            clock,
            enabled: config.system.auto_recording_enabled,
            inner: Mutex::new(Inner {
                machine_to_cameras,
                retry_queue: HashMap::new(),
            }),
        })
    }

    /// Subscribes to the event bus and spawns the retry ticker. Returns the
    /// ticker's `JoinHandle` so the caller can abort it during shutdown.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        if self.enabled {
            let controller = self.clone();
            self.events
                .subscribe(EventType::MachineStateChanged, move |event: &Event| {
                    controller.on_machine_state_changed(event);
                });
        }

        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RETRY_TICK).await;
                controller.process_due_retries().await;
            }
        })
    }

    fn on_machine_state_changed(self: &Arc<Self>, event: &Event) {
        let Some(machine_name) = event.data.get("machine_name").and_then(Value::as_str) else {
            return;
        };
        let Some(state) = event.data.get("state").and_then(Value::as_str) else {
            return;
        };

        let cameras = {
            let inner = self.inner.lock();
            inner
                .machine_to_cameras
                .get(machine_name)
                .cloned()
                .unwrap_or_default()
        };
        if cameras.is_empty() {
            return;
        }

        match state {
            "On" => {
                for camera_name in cameras {
                    let controller = self.clone();
                    tokio::spawn(async move {
                        controller.handle_machine_on(&camera_name).await;
                    });
                }
            }
            "Off" | "Error" => {
                for camera_name in cameras {
                    self.inner.lock().retry_queue.remove(&camera_name);
                    let controller = self.clone();
                    tokio::spawn(async move {
                        controller.handle_machine_off(&camera_name).await;
                    });
                }
            }
            _ => {}
        }
    }

    async fn handle_machine_on(&self, camera_name: &str) {
        if self.camera_manager.is_recording(camera_name) {
            info!(camera = camera_name, "already recording, skipping auto-start");
            return;
        }

        let now = self.clock.now();
        match self
            .camera_manager
            .start_recording(camera_name, StartOverrides::default())
            .await
        {
            Ok(filename) => {
                info!(camera = camera_name, filename = %filename, "auto-recording started");
                self.state_store
                    .record_auto_recording_attempt(camera_name, true, None, now);
            }
            Err(err) => {
                warn!(camera = camera_name, error = %err, "auto-recording start failed, enqueueing retry");
                self.state_store
                    .record_auto_recording_attempt(camera_name, false, Some(err.to_string()), now);
                self.enqueue_retry(camera_name);
            }
        }
    }

    async fn handle_machine_off(&self, camera_name: &str) {
        let now = self.clock.now();
        self.state_store.mark_auto_recording_stopped(camera_name, now);
        if let Err(err) = self.camera_manager.stop_recording(camera_name).await {
            warn!(camera = camera_name, error = %err, "auto-recording stop failed");
        }
    }

    fn enqueue_retry(&self, camera_name: &str) {
        let Some(config) = self.camera_manager.camera_config(camera_name) else {
            return;
        };
        let delay = Duration::from_secs(config.auto_recording_retry_delay_seconds);
        let mut inner = self.inner.lock();
        let entry = inner
            .retry_queue
            .entry(camera_name.to_string())
            .or_insert_with(|| RetryEntry {
                camera_name: camera_name.to_string(),
                attempt_count: 0,
                max_retries: config.auto_recording_max_retries,
                delay,
                next_attempt_at: std::time::Instant::now() + delay,
                exposure_ms: config.exposure_ms,
                gain: config.gain,
                target_fps: config.target_fps,
            });
        entry.next_attempt_at = std::time::Instant::now() + entry.delay;
    }

    async fn process_due_retries(self: &Arc<Self>) {
        let now = std::time::Instant::now();
        let due: Vec<RetryEntry> = {
            let inner = self.inner.lock();
            inner
                .retry_queue
                .values()
                .filter(|entry| entry.next_attempt_at <= now)
                .cloned()
                .collect()
        };

        for mut entry in due {
            entry.attempt_count += 1;
            let camera_name = entry.camera_name.clone();
            let now_wall = self.clock.now();
            self.state_store
                .record_auto_recording_attempt(&camera_name, false, None, now_wall);

            let overrides = StartOverrides {
                filename: None,
                exposure_ms: Some(entry.exposure_ms).filter(|v| *v > 0.0),
                gain: Some(entry.gain).filter(|v| *v > 0.0),
                target_fps: Some(entry.target_fps).filter(|v| *v > 0),
            };

            match self.camera_manager.start_recording(&camera_name, overrides).await {
                Ok(_) => {
                    info!(camera = %camera_name, attempt = entry.attempt_count, "retry succeeded");
                    self.state_store
                        .record_auto_recording_attempt(&camera_name, true, None, self.clock.now());
                    self.inner.lock().retry_queue.remove(&camera_name);
                }
                Err(err) => {
                    if entry.attempt_count >= entry.max_retries {
                        error!(camera = %camera_name, "auto-recording retries exhausted");
                        self.state_store.record_auto_recording_attempt(
                            &camera_name,
                            false,
                            Some(format!("retries exhausted: {err}")),
                            self.clock.now(),
                        );
                        self.state_store
                            .mark_auto_recording_stopped(&camera_name, self.clock.now());
                        self.inner.lock().retry_queue.remove(&camera_name);
                    } else {
                        warn!(camera = %camera_name, attempt = entry.attempt_count, error = %err, "retry failed, rescheduling");
                        let mut inner = self.inner.lock();
                        if let Some(queued) = inner.retry_queue.get_mut(&camera_name) {
                            queued.attempt_count = entry.attempt_count;
                            queued.next_attempt_at = std::time::Instant::now() + entry.delay;
                        }
                    }
                }
            }
        }
    }

    pub fn status(&self) -> AutoRecordStatus {
        let inner = self.inner.lock();
        AutoRecordStatus {
            enabled: self.enabled,
            retry_queue: inner
                .retry_queue
                .iter()
                .map(|(name, entry)| {
                    (
                        name.clone(),
                        RetryStatus {
                            attempt_count: entry.attempt_count,
                            max_retries: entry.max_retries,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, CameraConfig, StorageConfig, SystemConfig};
    use crate::device::SimulatedDeviceAdapter;
    use crate::storage::index::StorageIndex;
    use std::collections::HashMap as StdHashMap;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            bus: BusConfig::default(),
            storage: StorageConfig {
                base_path: dir.to_path_buf(),
                max_file_size_mb: 2048,
                max_recording_duration_minutes: 60,
                cleanup_older_than_days: 30,
            },
            system: SystemConfig {
                auto_recording_enabled: true,
                ..SystemConfig::default()
            },
            cameras: vec![CameraConfig {
                name: "camera1".into(),
                machine_topic: "press1".into(),
                storage_path: dir.to_path_buf(),
                enabled: true,
                exposure_ms: 20.0,
                gain: 1.0,
                target_fps: 0,
                video_format: "mp4".into(),
                video_codec: "h264".into(),
                video_quality: 80,
                auto_start_recording_enabled: true,
                auto_recording_max_retries: 3,
                auto_recording_retry_delay_seconds: 5,
                sharpness: 100,
                contrast: 100,
                saturation: 100,
                gamma: 100,
                noise_filter_enabled: false,
                denoise_3d_enabled: false,
                auto_white_balance: true,
                color_temperature_preset: 0,
                wb_red_gain: 1.0,
                wb_green_gain: 1.0,
                wb_blue_gain: 1.0,
                anti_flicker_enabled: false,
                light_frequency: 0,
                bit_depth: 8,
                hdr_enabled: false,
                hdr_gain_mode: 0,
            }],
        }
    }

    #[tokio::test]
    async fn machine_on_starts_recording_for_mapped_camera() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let adapter: Arc<dyn crate::device::DeviceAdapter> =
            Arc::new(SimulatedDeviceAdapter::new(1));
        let state_store = Arc::new(StateStore::new());
        let events = Arc::new(EventBus::new());
        let clock = Arc::new(Clock::utc());
        let index = Arc::new(StorageIndex::new(
            dir.path().join("file_index.json"),
            config.storage.clone(),
        ));
        let camera_manager = CameraManager::new(
            &config,
            adapter,
            state_store.clone(),
            events.clone(),
            index,
            clock.clone(),
        )
        .unwrap();

        let controller =
            AutoRecordController::new(&config, camera_manager.clone(), state_store, events.clone(), clock.clone());
        let _ticker = controller.spawn();

        events.publish(
            EventType::MachineStateChanged,
            "bus_client",
            serde_json::json!({ "machine_name": "press1", "state": "On" }),
            clock.now(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(camera_manager.is_recording("camera1"));
    }

    #[tokio::test]
    async fn exhausted_retries_clear_the_queue_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let adapter: Arc<dyn crate::device::DeviceAdapter> =
            Arc::new(SimulatedDeviceAdapter::new(1));
        let state_store = Arc::new(StateStore::new());
        let events = Arc::new(EventBus::new());
        let clock = Arc::new(Clock::utc());
        let index = Arc::new(StorageIndex::new(
            dir.path().join("file_index.json"),
            config.storage.clone(),
        ));
        let camera_manager = CameraManager::new(
            &config,
            adapter,
            state_store.clone(),
            events.clone(),
            index,
            clock.clone(),
        )
        .unwrap();
        let controller = AutoRecordController::new(
            &config,
            camera_manager,
            state_store,
            events,
            clock,
        );
        controller.enqueue_retry("camera1");
        assert_eq!(controller.status().retry_queue.len(), 1);
    }
}
