// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Streamer: an independent, low-rate preview session per camera. Opens its
//! own device session (never the Recorder's), JPEG-encodes frames into a
//! bounded drop-oldest ring, and exposes them as a lazy multipart byte
//! stream for the HTTP layer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{ImageBuffer, Rgb};
use parking_lot::{Condvar, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::device::{decode_to_bgr8, DeviceAdapter, DeviceHandle, GrabOutcome};
use crate::error::{CoordinatorError, Result};

const RING_CAPACITY: usize = 5;
const DEFAULT_PREVIEW_FPS: u32 = 10;
const DEFAULT_JPEG_QUALITY: u8 = 70;
const GRAB_TIMEOUT: Duration = Duration::from_millis(200);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct RingFrame {
    seq: usize,
    jpeg: Arc<Vec<u8>>,
}

struct FrameRing {
    frames: Mutex<VecDeque<RingFrame>>,
    condvar: Condvar,
    next_seq: std::sync::atomic::AtomicUsize,
}

impl FrameRing {
    fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            condvar: Condvar::new(),
            next_seq: std::sync::atomic::AtomicUsize::new(1),
        }
    }

    fn push(&self, jpeg: Vec<u8>) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut frames = self.frames.lock();
        if frames.len() == RING_CAPACITY {
            frames.pop_front();
        }
        frames.push_back(RingFrame { seq, jpeg: Arc::new(jpeg) });
        self.condvar.notify_all();
    }

    /// Blocks (off the async executor — callers run this via
    /// `spawn_blocking`) until a frame with a sequence number greater than
    /// `last_seen` is available, or `timeout` elapses. `last_seen` is a
    /// monotonic sequence, not a ring position, so it stays valid across
    /// drop-oldest evictions.
    fn wait_for_next(&self, last_seen: usize, timeout: Duration) -> Option<(usize, Arc<Vec<u8>>)> {
        let mut frames = self.frames.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = frames.back() {
                if frame.seq > last_seen {
                    return Some((frame.seq, frame.jpeg.clone()));
                }
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let result = self.condvar.wait_for(&mut frames, remaining);
            if result.timed_out() {
                return None;
            }
        }
    }
}

pub struct Streamer {
    camera_name: String,
    adapter: Arc<dyn DeviceAdapter>,
    device: DeviceHandle,
    preview_fps: u32,
    jpeg_quality: u8,
    ring: Arc<FrameRing>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    frame_count: Arc<Mutex<usize>>,
}

impl Streamer {
    pub fn new(
        camera_name: impl Into<String>,
        adapter: Arc<dyn DeviceAdapter>,
        device: DeviceHandle,
    ) -> Self {
        Self {
            camera_name: camera_name.into(),
            adapter,
            device,
            preview_fps: DEFAULT_PREVIEW_FPS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            ring: Arc::new(FrameRing::new()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            frame_count: Arc::new(Mutex::new(0)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Idempotent: returns `Ok(())` immediately if already running. Opens a
    /// second device session independent of any Recorder session; if the
    /// adapter refuses the concurrent open, surfaces `DeviceBusy`.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let session = match self.adapter.open(self.device) {
            Ok(session) => session,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        if let Err(err) = self.adapter.play(session) {
            let _ = self.adapter.close(session);
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let adapter = self.adapter.clone();
        let ring = self.ring.clone();
        let running = self.running.clone();
        let frame_count = self.frame_count.clone();
        let camera_name = self.camera_name.clone();
        let preview_fps = self.preview_fps.max(1);
        let jpeg_quality = self.jpeg_quality;
        let frame_interval = Duration::from_millis(1000 / preview_fps as u64);

        let handle = tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                match adapter.grab(session, GRAB_TIMEOUT) {
                    Ok(GrabOutcome::Timeout) => continue,
                    Ok(GrabOutcome::Frame { raw, header }) => {
                        let bgr = decode_to_bgr8(&raw, &header);
                        match encode_jpeg(&bgr, header.width, header.height, jpeg_quality) {
                            Ok(jpeg) => {
                                ring.push(jpeg);
                                *frame_count.lock() += 1;
                            }
                            Err(err) => {
                                warn!(camera = %camera_name, error = %err, "jpeg encode failed, dropping frame");
                            }
                        }
                    }
                    Err(err) => {
                        error!(camera = %camera_name, error = %err, "streamer grab failed fatally");
                        break;
                    }
                }
                std::thread::sleep(frame_interval);
            }
            running.store(false, Ordering::SeqCst);
            let _ = adapter.stop(session);
            let _ = adapter.close(session);
            info!(camera = %camera_name, "streamer session closed");
        });

        *self.worker.lock() = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!(camera = %self.camera_name, "streamer worker did not join in time");
            }
        }
    }

    /// Blocking wait for the next frame after the reader's last-seen
    /// sequence number; intended to be called from a `spawn_blocking`
    /// context by the HTTP layer while assembling the multipart body.
    /// Returns the frame's sequence number alongside its bytes so the
    /// caller can track `last_seen` across calls.
    pub fn wait_for_frame(&self, last_seen: usize, timeout: Duration) -> Option<(usize, Arc<Vec<u8>>)> {
        self.ring.wait_for_next(last_seen, timeout)
    }

    pub fn frame_count(&self) -> usize {
        *self.frame_count.lock()
    }

    pub fn camera_name(&self) -> &str {
        &self.camera_name
    }
}

/// Wraps one JPEG frame in the multipart/x-mixed-replace boundary format.
pub fn wrap_multipart_frame(jpeg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(jpeg.len() + 64);
    out.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    out.extend_from_slice(jpeg);
    out.extend_from_slice(b"\r\n");
    out
}

fn encode_jpeg(bgr: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let mut rgb = Vec::with_capacity(bgr.len());
    for chunk in bgr.chunks_exact(3) {
        rgb.push(chunk[2]);
        rgb.push(chunk[1]);
        rgb.push(chunk[0]);
    }
    let buffer: ImageBuffer<Rgb<u8>, _> = ImageBuffer::from_raw(width, height, rgb)
        .ok_or_else(|| CoordinatorError::WriteFailure {
            name: "streamer".into(),
            reason: "frame buffer size mismatch".into(),
        })?;
    let mut bytes = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut bytes);
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality);
    encoder
        .write_image(
            buffer.as_raw(),
            width,
            height,
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| CoordinatorError::WriteFailure {
            name: "streamer".into(),
            reason: e.to_string(),
        })?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDeviceAdapter;

    #[tokio::test]
    async fn start_stop_produces_frames() {
        let adapter: Arc<dyn DeviceAdapter> = Arc::new(SimulatedDeviceAdapter::new(1));
        let streamer = Streamer::new("camera1", adapter, DeviceHandle(0));
        streamer.start().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(streamer.frame_count() > 0);
        streamer.stop().await;
        assert!(!streamer.is_running());
    }

    #[tokio::test]
    async fn stream_keeps_delivering_past_ring_capacity() {
        // Regression: last_seen used to be compared against the ring's
        // length (capped at RING_CAPACITY), so once more than RING_CAPACITY
        // frames had ever been pushed, every wait_for_frame call returned
        // None forever. Sequence numbers must keep advancing instead.
        let adapter: Arc<dyn DeviceAdapter> = Arc::new(SimulatedDeviceAdapter::new(1));
        let streamer = Streamer::new("camera1", adapter, DeviceHandle(0));
        streamer.start().unwrap();

        let mut last_seen = 0usize;
        let mut delivered = 0;
        for _ in 0..(RING_CAPACITY * 3) {
            if let Some((seq, _jpeg)) = streamer.wait_for_frame(last_seen, Duration::from_secs(1)) {
                assert!(seq > last_seen);
                last_seen = seq;
                delivered += 1;
            }
        }
        assert_eq!(delivered, RING_CAPACITY * 3);
        streamer.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let adapter: Arc<dyn DeviceAdapter> = Arc::new(SimulatedDeviceAdapter::new(1));
        let streamer = Streamer::new("camera1", adapter, DeviceHandle(0));
        streamer.start().unwrap();
        streamer.start().unwrap();
        streamer.stop().await;
    }

    #[test]
    fn multipart_wrapping_has_expected_boundary() {
        let wrapped = wrap_multipart_frame(b"abc");
        let text = String::from_utf8_lossy(&wrapped);
        assert!(text.starts_with("--frame\r\n"));
        assert!(text.contains("Content-Type: image/jpeg\r\n\r\n"));
        assert!(text.ends_with("abc\r\n"));
    }

    #[test]
    fn jpeg_encode_roundtrips_through_image_crate() {
        let bgr = vec![10u8; 4 * 4 * 3];
        let jpeg = encode_jpeg(&bgr, 4, 4, 70).unwrap();
        assert!(!jpeg.is_empty());
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
