// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

/// Crate-wide error type. Variants map onto the error-kind table of the
/// coordination design: transient conditions are usually handled locally and
/// never reach a caller as one of these; these are the kinds that do cross a
/// component boundary.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("config validation failed: {0}")]
    ConfigValidation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bus disconnected (transient)")]
    TransientBusDisconnect,

    #[error("bus client gave up after {attempts} attempts")]
    FatalBusGiveUp { attempts: u32 },

    #[error("camera '{name}' device not found")]
    DeviceNotFound { name: String },

    #[error("camera '{name}' device busy")]
    DeviceBusy { name: String },

    #[error("camera '{name}' device access denied: {reason}")]
    DeviceAccessDenied { name: String, reason: String },

    #[error("camera '{name}' grab fatal: {reason}")]
    GrabFatal { name: String, reason: String },

    #[error("camera '{name}' write failure: {reason}")]
    WriteFailure { name: String, reason: String },

    #[error("storage index write failed: {0}")]
    IndexWriteFailure(String),

    #[error("auto-recording retries exhausted for camera '{name}'")]
    AutoRetryExhausted { name: String },

    #[error("camera '{name}' not found")]
    CameraNotFound { name: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("recorder '{name}' rejected operation from state {state}: {reason}")]
    InvalidRecorderState {
        name: String,
        state: String,
        reason: String,
    },

    #[error("setting '{setting}' requires a session restart and cannot be applied live")]
    RequiresRestart { setting: String },
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
