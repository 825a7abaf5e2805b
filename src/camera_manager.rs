// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Camera Manager: discovers physical devices, maps them to configured
//! logical cameras by positional index, owns each camera's Recorder and
//! Streamer, and reacts to machine state changes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{CameraConfig, Config};
use crate::device::{CaptureSettings, DeviceAdapter, DeviceHandle, LiveSettingsUpdate};
use crate::error::{CoordinatorError, Result};
use crate::events::{Event, EventBus, EventType};
use crate::recorder::{Recorder, StartOverrides};
use crate::state::{CameraStatus, StateStore};
use crate::storage::index::StorageIndex;
use crate::streamer::Streamer;

struct CameraEntry {
    config: CameraConfig,
    recorder: Arc<Recorder>,
    streamer: Arc<Streamer>,
}

/// Owns per-camera `Recorder`/`Streamer` pairs and mediates every operation
/// that touches a physical device. No dedicated worker of its own: it
/// operates on the context of whoever calls it, including the event
/// subscriber callback registered in `new`.
pub struct CameraManager {
    adapter: Arc<dyn DeviceAdapter>,
    cameras: Mutex<HashMap<String, Arc<CameraEntry>>>,
    state_store: Arc<StateStore>,
    events: Arc<EventBus>,
    index: Arc<StorageIndex>,
    clock: Arc<Clock>,
}

impl CameraManager {
    /// Discovers devices, maps each enabled camera in `config.cameras` to a
    /// device by positional index (`cameraN` → device index `N-1`, per
    /// SPEC_FULL §9), and registers its initial status in the State Store.
    pub fn new(
        config: &Config,
        adapter: Arc<dyn DeviceAdapter>,
        state_store: Arc<StateStore>,
        events: Arc<EventBus>,
        index: Arc<StorageIndex>,
        clock: Arc<Clock>,
    ) -> Result<Arc<Self>> {
        adapter.global_init()?;
        let devices = adapter.enumerate()?;
        let manager = Arc::new(Self {
            adapter,
            cameras: Mutex::new(HashMap::new()),
            state_store,
            events,
            index,
            clock,
        });
        manager.discover_and_register(config, &devices);
        Ok(manager)
    }

    fn discover_and_register(&self, config: &Config, devices: &[DeviceHandle]) {
        let mut cameras = self.cameras.lock();
        let now = self.clock.now();
        for camera_config in &config.cameras {
            if !camera_config.enabled {
                continue;
            }
            let Some(device_index) = positional_device_index(&camera_config.name) else {
                warn!(camera = %camera_config.name, "camera name does not follow the cameraN convention; skipping");
                continue;
            };
            let Some(device) = devices.get(device_index).copied() else {
                warn!(camera = %camera_config.name, device_index, "no physical camera at this position");
                self.state_store.update_camera(
                    &camera_config.name,
                    CameraStatus::NotFound,
                    None,
                    None,
                    now,
                );
                continue;
            };

            let settings = capture_settings_from_config(camera_config);
            let recorder = Arc::new(Recorder::new(
                camera_config.name.clone(),
                self.adapter.clone(),
                device,
                settings,
                camera_config.storage_path.clone(),
                camera_config.video_format.clone(),
                camera_config.target_fps,
                self.state_store.clone(),
                self.events.clone(),
                self.index.clone(),
                self.clock.clone(),
            ));
            let streamer = Arc::new(Streamer::new(
                camera_config.name.clone(),
                self.adapter.clone(),
                device,
            ));

            self.state_store.update_camera(
                &camera_config.name,
                CameraStatus::Available,
                None,
                Some(Value::String(format!("device index {device_index}"))),
                now,
            );
            self.state_store
                .set_auto_recording_enabled(&camera_config.name, camera_config.auto_start_recording_enabled, now);

            cameras.insert(
                camera_config.name.clone(),
                Arc::new(CameraEntry {
                    config: camera_config.clone(),
                    recorder,
                    streamer,
                }),
            );
        }
    }

    /// Re-enumerates physical devices without tearing down existing
    /// recorders/streamers; returns the number of devices found. Mitigates
    /// (without structurally fixing) the positional mapping's fragility.
    pub fn refresh_camera_discovery(&self) -> Result<usize> {
        let devices = self.adapter.enumerate()?;
        let now = self.clock.now();
        let cameras = self.cameras.lock();
        for (name, entry) in cameras.iter() {
            if let Some(device_index) = positional_device_index(name) {
                let status = if devices.len() > device_index {
                    CameraStatus::Available
                } else {
                    CameraStatus::NotFound
                };
                self.state_store.update_camera(name, status, None, None, now);
            }
            let _ = entry;
        }
        Ok(devices.len())
    }

    pub fn registered_cameras(&self) -> Vec<String> {
        self.cameras.lock().keys().cloned().collect()
    }

    pub fn camera_config(&self, camera_name: &str) -> Option<CameraConfig> {
        self.cameras.lock().get(camera_name).map(|e| e.config.clone())
    }

    fn entry(&self, camera_name: &str) -> Result<Arc<CameraEntry>> {
        self.cameras
            .lock()
            .get(camera_name)
            .cloned()
            .ok_or_else(|| CoordinatorError::CameraNotFound {
                name: camera_name.to_string(),
            })
    }

    pub async fn start_recording(&self, camera_name: &str, overrides: StartOverrides) -> Result<String> {
        let entry = self.entry(camera_name)?;
        entry.recorder.start(overrides).await
    }

    pub async fn stop_recording(&self, camera_name: &str) -> Result<()> {
        let entry = self.entry(camera_name)?;
        entry.recorder.stop().await;
        Ok(())
    }

    pub fn is_recording(&self, camera_name: &str) -> bool {
        self.cameras
            .lock()
            .get(camera_name)
            .map(|e| e.recorder.is_recording())
            .unwrap_or(false)
    }

    pub fn start_stream(&self, camera_name: &str) -> Result<()> {
        self.entry(camera_name)?.streamer.start()
    }

    pub async fn stop_stream(&self, camera_name: &str) -> Result<()> {
        self.entry(camera_name)?.streamer.stop().await;
        Ok(())
    }

    pub fn streamer(&self, camera_name: &str) -> Result<Arc<Streamer>> {
        Ok(self.entry(camera_name)?.streamer.clone())
    }

    pub fn update_live_settings(&self, camera_name: &str, update: &LiveSettingsUpdate) -> Result<()> {
        self.entry(camera_name)?.recorder.reconfigure(update)
    }

    /// Replaces the stored configuration for `camera_name`; takes effect
    /// only once `apply_config` rebuilds the Recorder/Streamer against it.
    pub fn update_config(&self, camera_name: &str, config: CameraConfig) -> Result<()> {
        let mut cameras = self.cameras.lock();
        let entry = cameras
            .get(camera_name)
            .cloned()
            .ok_or_else(|| CoordinatorError::CameraNotFound {
                name: camera_name.to_string(),
            })?;
        cameras.insert(
            camera_name.to_string(),
            Arc::new(CameraEntry {
                config,
                recorder: entry.recorder.clone(),
                streamer: entry.streamer.clone(),
            }),
        );
        Ok(())
    }

    /// Reinitializes the Recorder/Streamer pair for `camera_name` against its
    /// currently stored configuration. Stops an in-progress recording first.
    pub async fn apply_config(&self, camera_name: &str) -> Result<()> {
        let device_index = positional_device_index(camera_name).ok_or_else(|| {
            CoordinatorError::CameraNotFound {
                name: camera_name.to_string(),
            }
        })?;
        let entry = self.entry(camera_name)?;
        if entry.recorder.is_recording() {
            entry.recorder.stop().await;
        }
        entry.streamer.stop().await;

        let device = DeviceHandle(device_index);
        let settings = capture_settings_from_config(&entry.config);
        let recorder = Arc::new(Recorder::new(
            entry.config.name.clone(),
            self.adapter.clone(),
            device,
            settings,
            entry.config.storage_path.clone(),
            entry.config.video_format.clone(),
            entry.config.target_fps,
            self.state_store.clone(),
            self.events.clone(),
            self.index.clone(),
            self.clock.clone(),
        ));
        let streamer = Arc::new(Streamer::new(entry.config.name.clone(), self.adapter.clone(), device));

        self.cameras.lock().insert(
            camera_name.to_string(),
            Arc::new(CameraEntry {
                config: entry.config.clone(),
                recorder,
                streamer,
            }),
        );
        info!(camera = camera_name, "camera configuration reapplied");
        Ok(())
    }

    /// Forwards a recovery operation (`test_connection`/`reconnect`/
    /// `restart_grab`/`reset_timestamp`/`full_reset`/`reinitialize`) to the
    /// adapter for manual operator intervention, per SPEC_FULL §2b.
    pub fn recovery_op(&self, camera_name: &str, op: &str) -> Result<()> {
        let entry = self.entry(camera_name)?;
        let device = positional_device_index(camera_name)
            .map(DeviceHandle)
            .ok_or_else(|| CoordinatorError::CameraNotFound {
                name: camera_name.to_string(),
            })?;

        if op == "test_connection" {
            return self.adapter.test_connection(device);
        }

        let session = entry.recorder.device_session_handle().ok_or_else(|| {
            CoordinatorError::InvalidRequest(format!(
                "camera '{camera_name}' has no active session for '{op}'"
            ))
        })?;
        match op {
            "reconnect" => self.adapter.reconnect(session),
            "restart_grab" => self.adapter.restart_grab(session),
            "reset_timestamp" => self.adapter.reset_timestamp(session),
            "full_reset" | "reinitialize" => self.adapter.full_reset(device, session),
            other => Err(CoordinatorError::InvalidRequest(format!(
                "unsupported recovery operation '{other}'"
            ))),
        }
    }

    /// Subscribes this manager's reaction to `machine_state_changed` on the
    /// shared event bus. Delegation to the Auto-Record Controller happens
    /// there, not here: this handler only stops recordings on `off`/`error`
    /// (§4.8 — starting is the controller's policy, stopping is immediate).
    pub fn subscribe(self: &Arc<Self>, events: &EventBus) {
        let manager = self.clone();
        events.subscribe(EventType::MachineStateChanged, move |event: &Event| {
            let Some(machine_name) = event.data.get("machine_name").and_then(Value::as_str) else {
                return;
            };
            let Some(state) = event.data.get("state").and_then(Value::as_str) else {
                return;
            };
            if !matches!(state, "Off" | "Error") {
                return;
            }
            let Some(camera_name) = manager.camera_for_machine(machine_name) else {
                return;
            };
            if !manager.is_recording(&camera_name) {
                return;
            }
            let manager = manager.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.stop_recording(&camera_name).await {
                    warn!(camera = %camera_name, error = %err, "failed to stop recording on machine-off event");
                } else {
                    info!(camera = %camera_name, "recording stopped on machine-off event");
                }
            });
        });
    }

    fn camera_for_machine(&self, machine_name: &str) -> Option<String> {
        self.cameras
            .lock()
            .values()
            .find(|entry| entry.config.machine_topic == machine_name)
            .map(|entry| entry.config.name.clone())
    }
}

/// `camera1` → `Some(0)`, `camera2` → `Some(1)`, etc; anything else is
/// rejected (Open Question 3, kept as a documented limitation).
fn positional_device_index(camera_name: &str) -> Option<usize> {
    let suffix = camera_name.strip_prefix("camera")?;
    let n: usize = suffix.parse().ok()?;
    n.checked_sub(1)
}

fn capture_settings_from_config(config: &CameraConfig) -> CaptureSettings {
    CaptureSettings {
        bit_depth: config.bit_depth,
        pixel_kind_is_color: true,
        exposure_ms: config.exposure_ms,
        gain: config.gain,
        sharpness: config.sharpness,
        contrast: config.contrast,
        saturation: config.saturation,
        gamma: config.gamma,
        noise_filter_enabled: config.noise_filter_enabled,
        denoise_3d_enabled: config.denoise_3d_enabled,
        auto_white_balance: config.auto_white_balance,
        color_temperature_preset: config.color_temperature_preset,
        wb_red_gain: config.wb_red_gain,
        wb_green_gain: config.wb_green_gain,
        wb_blue_gain: config.wb_blue_gain,
        anti_flicker_enabled: config.anti_flicker_enabled,
        light_frequency: config.light_frequency,
        hdr_enabled: config.hdr_enabled,
        hdr_gain_mode: config.hdr_gain_mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::device::SimulatedDeviceAdapter;
    use std::collections::HashMap as StdHashMap;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut topics = StdHashMap::new();
        topics.insert("press1".to_string(), "plant/press1".to_string());
        Config {
            bus: crate::config::BusConfig {
                topics,
                ..Default::default()
            },
            storage: StorageConfig {
                base_path: dir.to_path_buf(),
                max_file_size_mb: 2048,
                max_recording_duration_minutes: 60,
                cleanup_older_than_days: 30,
            },
            system: crate::config::SystemConfig::default(),
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

    fn test_manager(dir: &std::path::Path) -> Arc<CameraManager> {
        let config = test_config(dir);
        let adapter: Arc<dyn DeviceAdapter> = Arc::new(SimulatedDeviceAdapter::new(1));
        let state_store = Arc::new(StateStore::new());
        let events = Arc::new(EventBus::new());
        let clock = Arc::new(Clock::utc());
        let index = Arc::new(StorageIndex::new(dir.join("file_index.json"), config.storage.clone()));
        CameraManager::new(&config, adapter, state_store, events, index, clock).unwrap()
    }

    #[test]
    fn discovers_configured_camera_by_position() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        assert_eq!(manager.registered_cameras(), vec!["camera1".to_string()]);
    }

    #[tokio::test]
    async fn start_and_stop_recording_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager
            .start_recording("camera1", StartOverrides::default())
            .await
            .unwrap();
        assert!(manager.is_recording("camera1"));
        manager.stop_recording("camera1").await.unwrap();
        assert!(!manager.is_recording("camera1"));
    }

    #[test]
    fn unknown_camera_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        assert!(matches!(
            manager.start_stream("nope"),
            Err(CoordinatorError::CameraNotFound { .. })
        ));
    }

    #[test]
    fn positional_mapping_parses_camera_index() {
        assert_eq!(positional_device_index("camera1"), Some(0));
        assert_eq!(positional_device_index("camera4"), Some(3));
        assert_eq!(positional_device_index("camera0"), None);
        assert_eq!(positional_device_index("weird"), None);
    }
}
