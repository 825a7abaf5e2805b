// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Camera Device Adapter: a thin, isolated capability surface standing in
//! for the vendor camera SDK. The real SDK is out of scope for this crate
//! (§1); `DeviceAdapter` is the trait boundary, and `SimulatedDeviceAdapter`
//! is an in-process reference implementation that synthesizes frames so the
//! Recorder, Streamer and Camera Manager are fully testable without
//! physical hardware attached.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};

/// Opaque handle returned by `enumerate`, identifying one physical device by
/// its positional index (see DESIGN.md Open Question 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub usize);

/// Opaque handle to one open session (either a Recorder's or a Streamer's).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelKind {
    Mono,
    Color,
}

/// The full configure surface named in §4.5/§6, applied at `configure()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureSettings {
    pub bit_depth: u8,
    pub pixel_kind_is_color: bool,
    pub exposure_ms: f64,
    pub gain: f64,
    pub sharpness: u32,
    pub contrast: u32,
    pub saturation: u32,
    pub gamma: u32,
    pub noise_filter_enabled: bool,
    pub denoise_3d_enabled: bool,
    pub auto_white_balance: bool,
    pub color_temperature_preset: u32,
    pub wb_red_gain: f64,
    pub wb_green_gain: f64,
    pub wb_blue_gain: f64,
    pub anti_flicker_enabled: bool,
    pub light_frequency: u8,
    pub hdr_enabled: bool,
    pub hdr_gain_mode: u8,
}

/// Settings that may be changed on a live session (§4.6 dynamic
/// reconfiguration). Fields left `None` are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiveSettingsUpdate {
    pub exposure_ms: Option<f64>,
    pub gain: Option<f64>,
    pub sharpness: Option<u32>,
    pub contrast: Option<u32>,
    pub saturation: Option<u32>,
    pub gamma: Option<u32>,
    pub auto_white_balance: Option<bool>,
    pub color_temperature_preset: Option<u32>,
    pub wb_red_gain: Option<f64>,
    pub wb_green_gain: Option<f64>,
    pub wb_blue_gain: Option<f64>,
    pub anti_flicker_enabled: Option<bool>,
    pub light_frequency: Option<u8>,
    pub hdr_enabled: Option<bool>,
    pub hdr_gain_mode: Option<u8>,
    /// Settings requiring teardown (bit-depth, noise-filter engine) — if
    /// set, this update is rejected with `RequiresRestart`.
    pub bit_depth: Option<u8>,
    pub noise_filter_enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub pixel_kind: PixelKind,
}

impl FrameHeader {
    /// Bytes needed to hold one raw frame at this header's bit depth.
    pub fn bytes_per_frame(&self) -> usize {
        let bytes_per_sample = if self.bit_depth > 8 { 2 } else { 1 };
        self.width as usize * self.height as usize * bytes_per_sample
    }
}

pub enum GrabOutcome {
    Frame { raw: Vec<u8>, header: FrameHeader },
    Timeout,
}

/// Trait boundary standing in for the vendor SDK. Implementors may hold
/// arbitrary internal state behind `&self` (interior mutability), since
/// sessions are shared across the async capture-loop tasks.
pub trait DeviceAdapter: Send + Sync {
    /// Idempotent process-wide initialization. Real adapters would also
    /// redirect SDK stderr here; advisory and a no-op in the reference
    /// implementation (§9).
    fn global_init(&self) -> Result<()>;

    fn enumerate(&self) -> Result<Vec<DeviceHandle>>;

    /// Opens an exclusive session. At most one Recorder session and one
    /// Streamer session may be open concurrently per device (§5); a third
    /// concurrent open attempt fails with `DeviceBusy`.
    fn open(&self, device: DeviceHandle) -> Result<SessionHandle>;

    fn configure(&self, session: SessionHandle, settings: &CaptureSettings) -> Result<()>;

    /// Applies a live settings update; returns `RequiresRestart` if any
    /// teardown-only field was set.
    fn apply_live_update(&self, session: SessionHandle, update: &LiveSettingsUpdate) -> Result<()>;

    fn play(&self, session: SessionHandle) -> Result<()>;
    fn stop(&self, session: SessionHandle) -> Result<()>;
    fn close(&self, session: SessionHandle) -> Result<()>;

    fn grab(&self, session: SessionHandle, timeout: Duration) -> Result<GrabOutcome>;

    fn test_connection(&self, device: DeviceHandle) -> Result<()>;
    fn reconnect(&self, session: SessionHandle) -> Result<()>;
    fn restart_grab(&self, session: SessionHandle) -> Result<()>;
    fn reset_timestamp(&self, session: SessionHandle) -> Result<()>;
    fn full_reset(&self, device: DeviceHandle, session: SessionHandle) -> Result<()>;
}

struct SimulatedSession {
    device: DeviceHandle,
    settings: CaptureSettings,
    frame_counter: u64,
    is_recorder: bool,
}

/// In-process reference `DeviceAdapter`. Synthesizes a deterministic test
/// pattern frame on every `grab`; never times out and never fails unless
/// explicitly instructed to via `fail_open_for`/`busy_for`, which tests use
/// to exercise the retry and busy-handling paths.
pub struct SimulatedDeviceAdapter {
    device_count: usize,
    width: u32,
    height: u32,
    sessions: Mutex<HashMap<u64, SimulatedSession>>,
    open_sessions_per_device: Mutex<HashMap<usize, Vec<(u64, bool)>>>,
    next_session_id: Mutex<u64>,
    fail_open_for: Mutex<HashMap<usize, u32>>,
    fail_grab_after: Mutex<HashMap<u64, u32>>,
}

impl SimulatedDeviceAdapter {
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            width: 64,
            height: 48,
            sessions: Mutex::new(HashMap::new()),
            open_sessions_per_device: Mutex::new(HashMap::new()),
            next_session_id: Mutex::new(1),
            fail_open_for: Mutex::new(HashMap::new()),
            fail_grab_after: Mutex::new(HashMap::new()),
        }
    }

    /// Test hook: the next `count` `open()` calls against `device` return
    /// `DeviceBusy` before succeeding. Used to ground the retry-on-busy
    /// scenario (§8 scenario 2).
    pub fn fail_next_opens(&self, device: DeviceHandle, count: u32) {
        self.fail_open_for.lock().insert(device.0, count);
    }

    /// Test hook: after `count` successful grabs on `session`, every
    /// subsequent `grab` call against it returns a fatal error, to ground
    /// the "capture loop ends fatally" path.
    pub fn fail_grab_after(&self, session: SessionHandle, count: u32) {
        self.fail_grab_after.lock().insert(session.0, count);
    }

    fn session_is_recorder(&self, session: SessionHandle) -> bool {
        self.sessions
            .lock()
            .get(&session.0)
            .map(|s| s.is_recorder)
            .unwrap_or(false)
    }
}

impl DeviceAdapter for SimulatedDeviceAdapter {
    fn global_init(&self) -> Result<()> {
        Ok(())
    }

    fn enumerate(&self) -> Result<Vec<DeviceHandle>> {
        Ok((0..self.device_count).map(DeviceHandle).collect())
    }

    fn open(&self, device: DeviceHandle) -> Result<SessionHandle> {
        if device.0 >= self.device_count {
            return Err(CoordinatorError::DeviceNotFound {
                name: format!("device index {}", device.0),
            });
        }

        {
            let mut fail_map = self.fail_open_for.lock();
            if let Some(remaining) = fail_map.get_mut(&device.0) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(CoordinatorError::DeviceBusy {
                        name: format!("device index {}", device.0),
                    });
                }
            }
        }

        let mut open_map = self.open_sessions_per_device.lock();
        let existing = open_map.entry(device.0).or_default();
        // At most one recorder + one streamer session per device.
        let is_recorder = !existing.iter().any(|(_, recorder)| *recorder);
        if existing.len() >= 2 {
            return Err(CoordinatorError::DeviceBusy {
                name: format!("device index {}", device.0),
            });
        }

        let mut next_id = self.next_session_id.lock();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        existing.push((id, is_recorder));
        self.sessions.lock().insert(
            id,
            SimulatedSession {
                device,
                settings: default_settings(),
                frame_counter: 0,
                is_recorder,
            },
        );
        Ok(SessionHandle(id))
    }

    fn configure(&self, session: SessionHandle, settings: &CaptureSettings) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(&session.0)
            .ok_or_else(|| CoordinatorError::InvalidRequest("unknown session".into()))?;
        entry.settings = settings.clone();
        Ok(())
    }

    fn apply_live_update(&self, session: SessionHandle, update: &LiveSettingsUpdate) -> Result<()> {
        if update.bit_depth.is_some() {
            return Err(CoordinatorError::RequiresRestart {
                setting: "bit_depth".into(),
            });
        }
        if update.noise_filter_enabled.is_some() {
            return Err(CoordinatorError::RequiresRestart {
                setting: "noise_filter_enabled".into(),
            });
        }
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(&session.0)
            .ok_or_else(|| CoordinatorError::InvalidRequest("unknown session".into()))?;
        let s = &mut entry.settings;
        macro_rules! apply {
            ($field:ident) => {
                if let Some(v) = update.$field {
                    s.$field = v;
                }
            };
        }
        apply!(exposure_ms);
        apply!(gain);
        apply!(sharpness);
        apply!(contrast);
        apply!(saturation);
        apply!(gamma);
        apply!(auto_white_balance);
        apply!(color_temperature_preset);
        apply!(wb_red_gain);
        apply!(wb_green_gain);
        apply!(wb_blue_gain);
        apply!(anti_flicker_enabled);
        apply!(light_frequency);
        apply!(hdr_enabled);
        apply!(hdr_gain_mode);
        Ok(())
    }

    fn play(&self, _session: SessionHandle) -> Result<()> {
        Ok(())
    }

    fn stop(&self, _session: SessionHandle) -> Result<()> {
        Ok(())
    }

    fn close(&self, session: SessionHandle) -> Result<()> {
        let removed = self.sessions.lock().remove(&session.0);
        if let Some(session_data) = removed {
            let mut open_map = self.open_sessions_per_device.lock();
            if let Some(list) = open_map.get_mut(&session_data.device.0) {
                list.retain(|(id, _)| *id != session.0);
            }
        }
        Ok(())
    }

    fn grab(&self, session: SessionHandle, _timeout: Duration) -> Result<GrabOutcome> {
        {
            let mut fail_after = self.fail_grab_after.lock();
            if let Some(remaining) = fail_after.get_mut(&session.0) {
                if *remaining == 0 {
                    return Err(CoordinatorError::GrabFatal {
                        name: format!("session {}", session.0),
                        reason: "simulated fatal grab failure".into(),
                    });
                }
                *remaining -= 1;
            }
        }
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(&session.0)
            .ok_or_else(|| CoordinatorError::InvalidRequest("unknown session".into()))?;
        entry.frame_counter += 1;
        let bit_depth = entry.settings.bit_depth;
        let pixel_kind = if entry.settings.pixel_kind_is_color {
            PixelKind::Color
        } else {
            PixelKind::Mono
        };
        let header = FrameHeader {
            width: self.width,
            height: self.height,
            bit_depth,
            pixel_kind,
        };
        let channels = match pixel_kind {
            PixelKind::Mono => 1,
            PixelKind::Color => 3,
        };
        let bytes_per_sample = if bit_depth > 8 { 2 } else { 1 };
        let size = self.width as usize * self.height as usize * channels * bytes_per_sample;
        let fill = (entry.frame_counter % 256) as u8;
        Ok(GrabOutcome::Frame {
            raw: vec![fill; size],
            header,
        })
    }

    fn test_connection(&self, device: DeviceHandle) -> Result<()> {
        if device.0 >= self.device_count {
            return Err(CoordinatorError::DeviceNotFound {
                name: format!("device index {}", device.0),
            });
        }
        Ok(())
    }

    fn reconnect(&self, _session: SessionHandle) -> Result<()> {
        Ok(())
    }

    fn restart_grab(&self, session: SessionHandle) -> Result<()> {
        if let Some(entry) = self.sessions.lock().get_mut(&session.0) {
            entry.frame_counter = 0;
        }
        Ok(())
    }

    fn reset_timestamp(&self, _session: SessionHandle) -> Result<()> {
        Ok(())
    }

    fn full_reset(&self, device: DeviceHandle, session: SessionHandle) -> Result<()> {
        let was_recorder = self.session_is_recorder(session);
        self.close(session)?;
        let new_session = self.open(device)?;
        if was_recorder {
            // Reference adapter doesn't need to do anything extra; real
            // hardware would re-run configure() here, which callers do.
        }
        let _ = new_session;
        Ok(())
    }
}

fn default_settings() -> CaptureSettings {
    CaptureSettings {
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
    }
}

/// Decode a raw frame (from `grab`/`process`) to BGR8 bytes per the policy
/// table in §4.6: 8-bit mono promotes via channel replication, 8-bit color
/// is already BGR, and ≥10-bit is interpreted as 16-bit then downshifted.
pub fn decode_to_bgr8(raw: &[u8], header: &FrameHeader) -> Vec<u8> {
    let pixels = header.width as usize * header.height as usize;
    match (header.bit_depth, header.pixel_kind) {
        (8, PixelKind::Mono) => {
            let mut out = Vec::with_capacity(pixels * 3);
            for &sample in raw.iter().take(pixels) {
                out.extend_from_slice(&[sample, sample, sample]);
            }
            out
        }
        (8, PixelKind::Color) => raw.to_vec(),
        (bit_depth, pixel_kind) => {
            let shift = bit_depth.saturating_sub(8);
            let channels = match pixel_kind {
                PixelKind::Mono => 1,
                PixelKind::Color => 3,
            };
            let mut out = Vec::with_capacity(pixels * 3);
            let samples = pixels * channels;
            let mut downshifted = Vec::with_capacity(samples);
            for chunk in raw.chunks_exact(2).take(samples) {
                let sample16 = u16::from_le_bytes([chunk[0], chunk[1]]);
                downshifted.push((sample16 >> shift) as u8);
            }
            match pixel_kind {
                PixelKind::Mono => {
                    for &sample in &downshifted {
                        out.extend_from_slice(&[sample, sample, sample]);
                    }
                }
                PixelKind::Color => out.extend_from_slice(&downshifted),
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_returns_configured_device_count() {
        let adapter = SimulatedDeviceAdapter::new(3);
        assert_eq!(adapter.enumerate().unwrap().len(), 3);
    }

    #[test]
    fn open_fails_on_unknown_device() {
        let adapter = SimulatedDeviceAdapter::new(1);
        assert!(matches!(
            adapter.open(DeviceHandle(5)),
            Err(CoordinatorError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn third_concurrent_open_is_busy() {
        let adapter = SimulatedDeviceAdapter::new(1);
        let _s1 = adapter.open(DeviceHandle(0)).unwrap();
        let _s2 = adapter.open(DeviceHandle(0)).unwrap();
        assert!(matches!(
            adapter.open(DeviceHandle(0)),
            Err(CoordinatorError::DeviceBusy { .. })
        ));
    }

    #[test]
    fn fail_next_opens_then_succeeds() {
        let adapter = SimulatedDeviceAdapter::new(1);
        adapter.fail_next_opens(DeviceHandle(0), 2);
        assert!(adapter.open(DeviceHandle(0)).is_err());
        assert!(adapter.open(DeviceHandle(0)).is_err());
        assert!(adapter.open(DeviceHandle(0)).is_ok());
    }

    #[test]
    fn grab_produces_frame_sized_for_header() {
        let adapter = SimulatedDeviceAdapter::new(1);
        let session = adapter.open(DeviceHandle(0)).unwrap();
        adapter.configure(session, &default_settings()).unwrap();
        match adapter.grab(session, Duration::from_millis(200)).unwrap() {
            GrabOutcome::Frame { raw, header } => {
                assert_eq!(raw.len(), 64 * 48 * 3);
                assert_eq!(header.width, 64);
            }
            GrabOutcome::Timeout => panic!("expected a frame"),
        }
    }

    #[test]
    fn live_update_rejects_bit_depth_change() {
        let adapter = SimulatedDeviceAdapter::new(1);
        let session = adapter.open(DeviceHandle(0)).unwrap();
        let mut update = LiveSettingsUpdate::default();
        update.bit_depth = Some(16);
        assert!(matches!(
            adapter.apply_live_update(session, &update),
            Err(CoordinatorError::RequiresRestart { .. })
        ));
    }

    #[test]
    fn decode_mono_8bit_replicates_channels() {
        let header = FrameHeader {
            width: 1,
            height: 1,
            bit_depth: 8,
            pixel_kind: PixelKind::Mono,
        };
        let out = decode_to_bgr8(&[42], &header);
        assert_eq!(out, vec![42, 42, 42]);
    }

    #[test]
    fn decode_16bit_downshifts_to_8bit() {
        let header = FrameHeader {
            width: 1,
            height: 1,
            bit_depth: 16,
            pixel_kind: PixelKind::Mono,
        };
        // 0x1234 >> 8 == 0x12
        let out = decode_to_bgr8(&[0x34, 0x12], &header);
        assert_eq!(out, vec![0x12, 0x12, 0x12]);
    }
}
