//! Typed configuration for the coordinator: bus, storage, system and
//! per-camera settings, persisted as JSON with a round-trip `load`/`save`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub bus: BusConfig,
    pub storage: StorageConfig,
    pub system: SystemConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// machine_name -> topic string
    #[serde(default)]
    pub topics: HashMap<String, String>,
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            username: None,
            password: None,
            topics: HashMap::new(),
            reconnect_delay_seconds: default_reconnect_delay_seconds(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

fn default_broker_host() -> String {
    "localhost".to_string()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_reconnect_delay_seconds() -> u64 {
    5
}
fn default_max_reconnect_attempts() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_max_recording_duration_minutes")]
    pub max_recording_duration_minutes: u64,
    #[serde(default = "default_cleanup_older_than_days")]
    pub cleanup_older_than_days: u64,
}

fn default_max_file_size_mb() -> u64 {
    2048
}
fn default_max_recording_duration_minutes() -> u64 {
    60
}
fn default_cleanup_older_than_days() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    #[serde(default = "default_camera_check_interval_seconds")]
    pub camera_check_interval_seconds: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_true")]
    pub enable_api: bool,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub auto_recording_enabled: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            camera_check_interval_seconds: default_camera_check_interval_seconds(),
            log_level: default_log_level(),
            log_file: None,
            api_host: default_api_host(),
            api_port: default_api_port(),
            enable_api: true,
            timezone: default_timezone(),
            auto_recording_enabled: true,
        }
    }
}

fn default_camera_check_interval_seconds() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8000
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_true() -> bool {
    true
}

/// Per-camera configuration. Field set matches the richer of the coexisting
/// source implementations (see DESIGN.md Open Question 1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub name: String,
    pub machine_topic: String,
    pub storage_path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: f64,
    #[serde(default = "default_gain")]
    pub gain: f64,
    /// 0 means "as fast as possible" (no inter-frame sleep).
    #[serde(default)]
    pub target_fps: u32,

    #[serde(default = "default_video_format")]
    pub video_format: String,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_video_quality")]
    pub video_quality: u8,

    #[serde(default = "default_true")]
    pub auto_start_recording_enabled: bool,
    #[serde(default = "default_max_retries")]
    pub auto_recording_max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub auto_recording_retry_delay_seconds: u64,

    #[serde(default = "default_sharpness")]
    pub sharpness: u32,
    #[serde(default = "default_contrast")]
    pub contrast: u32,
    #[serde(default = "default_saturation")]
    pub saturation: u32,
    #[serde(default = "default_gamma")]
    pub gamma: u32,

    #[serde(default)]
    pub noise_filter_enabled: bool,
    #[serde(default)]
    pub denoise_3d_enabled: bool,

    #[serde(default = "default_true")]
    pub auto_white_balance: bool,
    #[serde(default = "default_color_temperature_preset")]
    pub color_temperature_preset: u32,
    #[serde(default = "default_wb_gain")]
    pub wb_red_gain: f64,
    #[serde(default = "default_wb_gain")]
    pub wb_green_gain: f64,
    #[serde(default = "default_wb_gain")]
    pub wb_blue_gain: f64,

    #[serde(default)]
    pub anti_flicker_enabled: bool,
    /// 0 = 50Hz, 1 = 60Hz
    #[serde(default)]
    pub light_frequency: u8,

    #[serde(default = "default_bit_depth")]
    pub bit_depth: u8,

    #[serde(default)]
    pub hdr_enabled: bool,
    #[serde(default)]
    pub hdr_gain_mode: u8,
}

fn default_exposure_ms() -> f64 {
    20.0
}
fn default_gain() -> f64 {
    1.0
}
fn default_video_format() -> String {
    "mp4".to_string()
}
fn default_video_codec() -> String {
    "h264".to_string()
}
fn default_video_quality() -> u8 {
    80
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    5
}
fn default_sharpness() -> u32 {
    100
}
fn default_contrast() -> u32 {
    100
}
fn default_saturation() -> u32 {
    100
}
fn default_gamma() -> u32 {
    100
}
fn default_color_temperature_preset() -> u32 {
    0
}
fn default_wb_gain() -> f64 {
    1.0
}
fn default_bit_depth() -> u8 {
    8
}

impl CameraConfig {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoordinatorError::ConfigValidation(
                "camera name must not be empty".into(),
            ));
        }
        if !matches!(self.bit_depth, 8 | 10 | 12 | 16) {
            return Err(CoordinatorError::ConfigValidation(format!(
                "camera '{}': bit_depth must be one of 8/10/12/16, got {}",
                self.name, self.bit_depth
            )));
        }
        if self.sharpness > 200 || self.contrast > 200 || self.saturation > 200 {
            return Err(CoordinatorError::ConfigValidation(format!(
                "camera '{}': sharpness/contrast/saturation must be in 0..=200",
                self.name
            )));
        }
        if self.gamma > 300 {
            return Err(CoordinatorError::ConfigValidation(format!(
                "camera '{}': gamma must be in 0..=300",
                self.name
            )));
        }
        if self.color_temperature_preset > 10 {
            return Err(CoordinatorError::ConfigValidation(format!(
                "camera '{}': color_temperature_preset must be in 0..=10",
                self.name
            )));
        }
        for (field, value) in [
            ("wb_red_gain", self.wb_red_gain),
            ("wb_green_gain", self.wb_green_gain),
            ("wb_blue_gain", self.wb_blue_gain),
        ] {
            if !(0.0..=3.99).contains(&value) {
                return Err(CoordinatorError::ConfigValidation(format!(
                    "camera '{}': {field} must be in 0.0..=3.99",
                    self.name
                )));
            }
        }
        if self.light_frequency > 1 {
            return Err(CoordinatorError::ConfigValidation(format!(
                "camera '{}': light_frequency must be 0 (50Hz) or 1 (60Hz)",
                self.name
            )));
        }
        if self.hdr_gain_mode > 3 {
            return Err(CoordinatorError::ConfigValidation(format!(
                "camera '{}': hdr_gain_mode must be in 0..=3",
                self.name
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`, validating every
    /// constraint before returning. A validation failure aborts startup
    /// (§7: ConfigValidationFailure).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoordinatorError::Config(format!("cannot read config file: {e}")))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| CoordinatorError::Config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Persist configuration to `path` as pretty JSON. Round-trips with
    /// `from_file` (`Config::from_file(save(c)) == c`).
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.base_path.as_os_str().is_empty() {
            return Err(CoordinatorError::ConfigValidation(
                "storage.base_path must be set".into(),
            ));
        }
        if self.system.api_port == 0 {
            return Err(CoordinatorError::ConfigValidation(
                "system.api_port must be nonzero".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            camera.validate()?;
            if !seen.insert(camera.name.clone()) {
                return Err(CoordinatorError::ConfigValidation(format!(
                    "duplicate camera name '{}'",
                    camera.name
                )));
            }
        }
        Ok(())
    }

    pub fn get_camera_by_name(&self, name: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.name == name)
    }

    pub fn get_camera_by_topic(&self, topic: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.machine_topic == topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        let mut topics = HashMap::new();
        topics.insert(
            "vibratory_conveyor".to_string(),
            "vision/vibratory_conveyor/state".to_string(),
        );
        Config {
            bus: BusConfig {
                topics,
                ..Default::default()
            },
            storage: StorageConfig {
                base_path: PathBuf::from("/var/lib/coordinator"),
                max_file_size_mb: default_max_file_size_mb(),
                max_recording_duration_minutes: default_max_recording_duration_minutes(),
                cleanup_older_than_days: default_cleanup_older_than_days(),
            },
            system: SystemConfig::default(),
            cameras: vec![CameraConfig {
                name: "camera1".into(),
                machine_topic: "vibratory_conveyor".into(),
                storage_path: PathBuf::from("/var/lib/coordinator/camera1"),
                enabled: true,
                exposure_ms: default_exposure_ms(),
                gain: default_gain(),
                target_fps: 15,
                video_format: default_video_format(),
                video_codec: default_video_codec(),
                video_quality: default_video_quality(),
                auto_start_recording_enabled: true,
                auto_recording_max_retries: default_max_retries(),
                auto_recording_retry_delay_seconds: default_retry_delay(),
                sharpness: default_sharpness(),
                contrast: default_contrast(),
                saturation: default_saturation(),
                gamma: default_gamma(),
                noise_filter_enabled: false,
                denoise_3d_enabled: false,
                auto_white_balance: true,
                color_temperature_preset: default_color_temperature_preset(),
                wb_red_gain: default_wb_gain(),
                wb_green_gain: default_wb_gain(),
                wb_blue_gain: default_wb_gain(),
                anti_flicker_enabled: false,
                light_frequency: 0,
                bit_depth: 8,
                hdr_enabled: false,
                hdr_gain_mode: 0,
            }],
        }
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = sample_config();
        config.save(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn rejects_bad_bit_depth() {
        let mut config = sample_config();
        config.cameras[0].bit_depth = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_camera_names() {
        let mut config = sample_config();
        let dup = config.cameras[0].clone();
        config.cameras.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_wb_gain() {
        let mut config = sample_config();
        config.cameras[0].wb_red_gain = 4.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn lookup_by_topic_and_name() {
        let config = sample_config();
        assert!(config.get_camera_by_name("camera1").is_some());
        assert!(config.get_camera_by_topic("vibratory_conveyor").is_some());
        assert!(config.get_camera_by_topic("nope").is_none());
    }
}
