use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{IrisError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interval_ms: u64,
    pub jpeg_quality: u8,
    /// Longest edge in pixels; larger samples are downscaled before encoding.
    pub max_frame_size: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            jpeg_quality: 80,
            max_frame_size: 640,
        }
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub url: String,
    pub client_id: Option<String>,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
    pub metrics_poll_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5001/ws".into(),
            client_id: None,
            backoff_initial_ms: 500,
            backoff_multiplier: 2.0,
            backoff_max_ms: 30_000,
            metrics_poll_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub max_in_flight: usize,
    pub timeout_ms: u64,
    pub min_send_interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            timeout_ms: 1_000,
            min_send_interval_ms: 0,
        }
    }
}

impl ThrottleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn min_send_interval(&self) -> Duration {
        Duration::from_millis(self.min_send_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub window_size: usize,
    pub fps_window_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window_size: 30,
            fps_window_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrivacyConfig {
    pub enable_age: bool,
    pub enable_gender: bool,
    pub enable_emotion: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            enable_age: true,
            enable_gender: true,
            enable_emotion: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub log_level: String,
    pub preferences_path: Option<String>,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            preferences_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IrisConfig {
    pub capture: CaptureConfig,
    pub network: NetworkConfig,
    pub throttle: ThrottleConfig,
    pub stats: StatsConfig,
    pub privacy: PrivacyConfig,
    pub ops: OpsConfig,
}

impl IrisConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|err| {
            IrisError::Configuration(format!(
                "unable to read config file {}: {err}",
                path_ref.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|err| {
            IrisError::Configuration(format!(
                "failed to parse config file {}: {err}",
                path_ref.display()
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.interval_ms == 0 {
            return Err(IrisError::Configuration(
                "capture.interval_ms must be greater than zero".into(),
            ));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(IrisError::Configuration(
                "capture.jpeg_quality must be between 1 and 100".into(),
            ));
        }
        if self.capture.max_frame_size == 0 {
            return Err(IrisError::Configuration(
                "capture.max_frame_size must be greater than zero".into(),
            ));
        }
        if self.network.url.trim().is_empty() {
            return Err(IrisError::Configuration(
                "network.url must not be empty".into(),
            ));
        }
        if self.network.backoff_initial_ms == 0
            || self.network.backoff_initial_ms > self.network.backoff_max_ms
        {
            return Err(IrisError::Configuration(
                "network.backoff_initial_ms must be in 1..=backoff_max_ms".into(),
            ));
        }
        let multiplier = self.network.backoff_multiplier;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(IrisError::Configuration(
                "network.backoff_multiplier must be a finite number of at least 1.0".into(),
            ));
        }
        if self.throttle.max_in_flight == 0 {
            return Err(IrisError::Configuration(
                "throttle.max_in_flight must be greater than zero".into(),
            ));
        }
        if self.throttle.timeout_ms == 0 {
            return Err(IrisError::Configuration(
                "throttle.timeout_ms must be greater than zero".into(),
            ));
        }
        if self.stats.window_size == 0 || self.stats.fps_window_ms == 0 {
            return Err(IrisError::Configuration(
                "stats.window_size and stats.fps_window_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
