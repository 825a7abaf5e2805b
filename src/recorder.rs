// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Recorder: the per-camera capture lifecycle. Lazily acquires a device
//! session, runs a dedicated capture task, writes frames through a
//! `ContainerWriter`, and reports into the State Store / Event Bus / Storage
//! Index. This is the subsystem the rest of the crate exists to drive.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::device::{
    decode_to_bgr8, CaptureSettings, DeviceAdapter, DeviceHandle, GrabOutcome, LiveSettingsUpdate,
    SessionHandle,
};
use crate::error::{CoordinatorError, Result};
use crate::events::{EventBus, EventType};
use crate::state::StateStore;
use crate::storage::index::StorageIndex;

const GRAB_TIMEOUT: Duration = Duration::from_millis(200);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Out-of-scope video muxing is represented by this trait; the default
/// `RawContainerWriter` writes a simple length-prefixed frame stream. A real
/// deployment swaps in a proper muxer behind the same trait.
pub trait ContainerWriter: Send {
    fn write_frame(&mut self, bgr: &[u8]) -> std::io::Result<()>;
    fn finalize(&mut self) -> std::io::Result<u64>;
}

pub struct RawContainerWriter {
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl RawContainerWriter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }
}

impl ContainerWriter for RawContainerWriter {
    fn write_frame(&mut self, bgr: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(&(bgr.len() as u32).to_le_bytes())?;
        self.writer.write_all(bgr)?;
        self.bytes_written += 4 + bgr.len() as u64;
        Ok(())
    }

    fn finalize(&mut self) -> std::io::Result<u64> {
        self.writer.flush()?;
        Ok(self.bytes_written)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Opening,
    Running,
    Stopping,
    Error,
}

/// Parameters accepted by a manual `start_recording` call; `None` fields
/// fall back to the camera's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct StartOverrides {
    pub filename: Option<String>,
    pub exposure_ms: Option<f64>,
    pub gain: Option<f64>,
    pub target_fps: Option<u32>,
}

struct RunningSession {
    worker: JoinHandle<()>,
    stop_flag: Arc<AtomicBool>,
    session_id: u64,
}

pub struct Recorder {
    camera_name: String,
    adapter: Arc<dyn DeviceAdapter>,
    device: DeviceHandle,
    base_settings: CaptureSettings,
    storage_path: PathBuf,
    video_extension: String,
    target_fps: u32,
    state: Arc<Mutex<RecorderState>>,
    running: AsyncMutex<Option<RunningSession>>,
    device_session: Mutex<Option<SessionHandle>>,
    bytes_written: Arc<AtomicU64>,
    frames_written: Arc<AtomicU64>,
    state_store: Arc<StateStore>,
    events: Arc<EventBus>,
    index: Arc<StorageIndex>,
    clock: Arc<Clock>,
}

impl Recorder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera_name: impl Into<String>,
        adapter: Arc<dyn DeviceAdapter>,
        device: DeviceHandle,
        base_settings: CaptureSettings,
        storage_path: PathBuf,
        video_extension: String,
        target_fps: u32,
        state_store: Arc<StateStore>,
        events: Arc<EventBus>,
        index: Arc<StorageIndex>,
        clock: Arc<Clock>,
    ) -> Self {
        Self {
            camera_name: camera_name.into(),
            adapter,
            device,
            base_settings,
            storage_path,
            video_extension,
            target_fps,
            state: Arc::new(Mutex::new(RecorderState::Idle)),
            running: AsyncMutex::new(None),
            device_session: Mutex::new(None),
            bytes_written: Arc::new(AtomicU64::new(0)),
            frames_written: Arc::new(AtomicU64::new(0)),
            state_store,
            events,
            index,
            clock,
        }
    }

    pub fn state(&self) -> RecorderState {
        *self.state.lock()
    }

    /// The device session currently backing this recorder, if any. Used by
    /// recovery operations (`reconnect`/`restart_grab`/`reset_timestamp`/
    /// `full_reset`) that must target a live session.
    pub fn device_session_handle(&self) -> Option<SessionHandle> {
        *self.device_session.lock()
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecorderState::Running
    }

    /// `start` is rejected from any state except `Idle`.
    pub async fn start(&self, overrides: StartOverrides) -> Result<String> {
        {
            let mut state = self.state.lock();
            if *state != RecorderState::Idle {
                return Err(CoordinatorError::InvalidRecorderState {
                    name: self.camera_name.clone(),
                    state: format!("{:?}", *state),
                    reason: "start is only valid from Idle".into(),
                });
            }
            *state = RecorderState::Opening;
        }

        let result = self.start_inner(overrides).await;
        if let Err(ref err) = result {
            *self.state.lock() = RecorderState::Idle;
            error!(camera = %self.camera_name, error = %err, "recorder start failed");
            self.events.publish(
                EventType::RecordingError,
                self.camera_name.clone(),
                json!({ "error": err.to_string() }),
                self.clock.now(),
            );
        }
        result
    }

    async fn start_inner(&self, overrides: StartOverrides) -> Result<String> {
        let filename = self.build_filename(overrides.filename.as_deref());
        let full_path = self.storage_path.join(&filename);

        let session = self.adapter.open(self.device)?;
        let mut settings = self.base_settings.clone();
        if let Some(exposure) = overrides.exposure_ms {
            settings.exposure_ms = exposure;
        }
        if let Some(gain) = overrides.gain {
            settings.gain = gain;
        }
        if let Err(err) = self.adapter.configure(session, &settings) {
            let _ = self.adapter.close(session);
            return Err(err);
        }
        if let Err(err) = self.adapter.play(session) {
            let _ = self.adapter.close(session);
            return Err(err);
        }

        // Pre-flight grab verifies the session before committing to it.
        match self.adapter.grab(session, Duration::from_millis(1000)) {
            Ok(GrabOutcome::Frame { .. }) => {}
            Ok(GrabOutcome::Timeout) => {
                let _ = self.adapter.stop(session);
                let _ = self.adapter.close(session);
                return Err(CoordinatorError::GrabFatal {
                    name: self.camera_name.clone(),
                    reason: "pre-flight grab timed out".into(),
                });
            }
            Err(err) => {
                let _ = self.adapter.stop(session);
                let _ = self.adapter.close(session);
                return Err(err);
            }
        }

        let writer = RawContainerWriter::create(&full_path).map_err(CoordinatorError::Io)?;

        let now = self.clock.now();
        self.index
            .register(&self.camera_name, &filename, &full_path, now)?;
        let session_id = self.state_store.start_session(&self.camera_name, &filename, now);
        self.state_store
            .set_camera_recording(&self.camera_name, true, Some(filename.clone()), now);
        *self.device_session.lock() = Some(session);
        self.bytes_written.store(0, Ordering::SeqCst);
        self.frames_written.store(0, Ordering::SeqCst);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let worker = self.spawn_capture_loop(session, stop_flag.clone(), writer, session_id, self.state.clone());

        *self.running.lock().await = Some(RunningSession {
            worker,
            stop_flag,
            session_id,
        });
        *self.state.lock() = RecorderState::Running;

        info!(camera = %self.camera_name, filename = %filename, "recording started");
        self.events.publish(
            EventType::RecordingStarted,
            self.camera_name.clone(),
            json!({ "filename": filename }),
            now,
        );

        Ok(filename)
    }

    fn spawn_capture_loop(
        &self,
        session: SessionHandle,
        stop_flag: Arc<AtomicBool>,
        mut writer: RawContainerWriter,
        session_id: u64,
        state: Arc<Mutex<RecorderState>>,
    ) -> JoinHandle<()> {
        let adapter = self.adapter.clone();
        let camera_name = self.camera_name.clone();
        let target_fps = self.target_fps;
        let bytes_written = self.bytes_written.clone();
        let frames_written = self.frames_written.clone();
        let state_store = self.state_store.clone();
        let events = self.events.clone();
        let clock = self.clock.clone();
        let index = self.index.clone();

        tokio::task::spawn_blocking(move || {
            let sleep_duration = if target_fps > 0 {
                Some(Duration::from_millis(1000 / target_fps as u64))
            } else {
                None
            };

            let mut fatal_error: Option<String> = None;
            while !stop_flag.load(Ordering::SeqCst) {
                match adapter.grab(session, GRAB_TIMEOUT) {
                    Ok(GrabOutcome::Timeout) => continue,
                    Ok(GrabOutcome::Frame { raw, header }) => {
                        let bgr = decode_to_bgr8(&raw, &header);
                        if let Err(err) = writer.write_frame(&bgr) {
                            fatal_error = Some(format!("write failure: {err}"));
                            break;
                        }
                        frames_written.fetch_add(1, Ordering::SeqCst);
                        if let Some(delay) = sleep_duration {
                            std::thread::sleep(delay);
                        }
                    }
                    Err(err) => {
                        fatal_error = Some(err.to_string());
                        break;
                    }
                }
            }

            let total_bytes = writer.finalize().unwrap_or(0);
            bytes_written.store(total_bytes, Ordering::SeqCst);
            let _ = adapter.stop(session);
            let _ = adapter.close(session);

            let now = clock.now();
            let frames = frames_written.load(Ordering::SeqCst);
            if let Some(message) = fatal_error {
                error!(camera = %camera_name, error = %message, "capture loop ended fatally");
                state_store.error_session(session_id, &message, now);
                events.publish(
                    EventType::RecordingError,
                    camera_name.clone(),
                    json!({ "error": message }),
                    now,
                );
                // Running -> Error -> Idle: the worker is the only place that
                // learns about a fatal capture failure, so it must settle the
                // recorder back to Idle itself rather than leaving it stuck
                // in Running for whoever called `start`/`stop` next.
                *state.lock() = RecorderState::Error;
            } else {
                state_store.stop_session(session_id, total_bytes, frames, now);
            }
            if let Err(err) = index.finalize(&camera_name, total_bytes, now) {
                warn!(camera = %camera_name, error = %err, "failed to finalize storage index entry");
            }
            state_store.set_camera_recording(&camera_name, false, None, now);
            events.publish(
                EventType::RecordingStopped,
                camera_name.clone(),
                json!({ "bytes_written": total_bytes, "frames_written": frames }),
                now,
            );
            *state.lock() = RecorderState::Idle;
        })
    }

    /// Idempotent: `stop` from `Idle` is a no-op with a warning.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == RecorderState::Idle {
                warn!(camera = %self.camera_name, "stop called while idle");
                return;
            }
            *state = RecorderState::Stopping;
        }

        let session = self.running.lock().await.take();
        if let Some(running) = session {
            running.stop_flag.store(true, Ordering::SeqCst);
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, running.worker)
                .await
                .is_err()
            {
                warn!(camera = %self.camera_name, "capture worker did not join within timeout; forcing teardown");
                if let Some(session) = self.device_session.lock().take() {
                    let _ = self.adapter.close(session);
                }
            }
        }
        *self.device_session.lock() = None;
        *self.state.lock() = RecorderState::Idle;
    }

    /// Applies a subset of settings to the live session; rejects with
    /// `RequiresRestart` for teardown-only fields.
    pub fn reconfigure(&self, update: &LiveSettingsUpdate) -> Result<()> {
        let session = self
            .device_session
            .lock()
            .ok_or_else(|| CoordinatorError::InvalidRecorderState {
                name: self.camera_name.clone(),
                state: format!("{:?}", self.state()),
                reason: "no active session to reconfigure".into(),
            })?;
        self.adapter.apply_live_update(session, update)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::SeqCst)
    }

    fn build_filename(&self, supplied: Option<&str>) -> String {
        let ts = self.clock.format_filename_timestamp();
        match supplied {
            Some(name) => format!("{ts}_{name}"),
            None => format!("{}_recording_{ts}.{}", self.camera_name, self.video_extension),
        }
    }
}

/// Last-recorded timestamp helper used by callers that need to stamp a
/// manual-start filename without a supplied name.
pub fn default_video_extension() -> String {
    "mp4".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::device::SimulatedDeviceAdapter;
    use std::path::PathBuf;

    fn test_recorder(dir: &Path) -> Recorder {
        test_recorder_with_adapter(dir, Arc::new(SimulatedDeviceAdapter::new(1)))
    }

    fn test_recorder_with_adapter(dir: &Path, adapter: Arc<SimulatedDeviceAdapter>) -> Recorder {
        let adapter: Arc<dyn DeviceAdapter> = adapter;
        let state_store = Arc::new(StateStore::new());
        let events = Arc::new(EventBus::new());
        let clock = Arc::new(Clock::utc());
        let index = Arc::new(StorageIndex::new(
            dir.join("index.json"),
            StorageConfig {
                base_path: dir.to_path_buf(),
                max_file_size_mb: 2048,
                max_recording_duration_minutes: 60,
                cleanup_older_than_days: 30,
            },
        ));
        Recorder::new(
            "camera1",
            adapter,
            DeviceHandle(0),
            crate::device::CaptureSettings {
                bit_depth: 8,
                pixel_kind_is_color: true,
                exposure_ms: 20.0,
                gain: 1.0,
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
                hdr_enabled: false,
                hdr_gain_mode: 0,
            },
            dir.to_path_buf(),
            "mp4".to_string(),
            0,
            state_store,
            events,
            index,
            clock,
        )
    }

    #[tokio::test]
    async fn start_then_stop_produces_recording_file() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = test_recorder(dir.path());
        let filename = recorder.start(StartOverrides::default()).await.unwrap();
        assert!(recorder.is_recording());
        tokio::time::sleep(Duration::from_millis(50)).await;
        recorder.stop().await;
        assert!(!recorder.is_recording());
        assert!(dir.path().join(&filename).exists());
        assert!(recorder.bytes_written() > 0);
    }

    #[tokio::test]
    async fn start_rejected_while_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = test_recorder(dir.path());
        recorder.start(StartOverrides::default()).await.unwrap();
        let second = recorder.start(StartOverrides::default()).await;
        assert!(matches!(
            second,
            Err(CoordinatorError::InvalidRecorderState { .. })
        ));
        recorder.stop().await;
    }

    #[tokio::test]
    async fn stop_from_idle_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = test_recorder(dir.path());
        recorder.stop().await;
        assert_eq!(recorder.state(), RecorderState::Idle);
    }

    #[tokio::test]
    async fn fatal_capture_failure_settles_back_to_idle() {
        // Regression: spawn_capture_loop used to update its own local copy of
        // the running state and never touched `self.state`, so a fatal grab
        // error left the recorder stuck reporting Running/is_recording()
        // forever, rejecting every subsequent start().
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(SimulatedDeviceAdapter::new(1));
        let recorder = test_recorder_with_adapter(dir.path(), adapter.clone());

        recorder.start(StartOverrides::default()).await.unwrap();
        let session = recorder.device_session_handle().unwrap();
        adapter.fail_grab_after(session, 0);

        for _ in 0..50 {
            if !recorder.is_recording() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!recorder.is_recording());
        assert_eq!(recorder.state(), RecorderState::Idle);

        let restarted = recorder.start(StartOverrides::default()).await;
        assert!(restarted.is_ok());
        recorder.stop().await;
    }

    #[test]
    fn manual_filename_prefixes_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = test_recorder(dir.path());
        let name = recorder.build_filename(Some("clip.mp4"));
        assert!(name.ends_with("_clip.mp4"));
    }

    #[test]
    fn default_filename_uses_camera_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = test_recorder(dir.path());
        let name = recorder.build_filename(None);
        assert!(name.starts_with("camera1_recording_"));
        assert!(name.ends_with(".mp4"));
    }
}
