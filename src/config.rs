use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{CoachError, camera::CaptureHints};

const CONFIG_DIR_NAME: &str = "repcoach";
const CONFIG_FILE_NAME: &str = "config.json";

pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:5000";
pub const REFRESH_INTERVAL_MS: u64 = 16;
pub const DISPATCH_INTERVAL_MS: u64 = 40;
pub const JPEG_QUALITY: u8 = 65;
pub const COUNTDOWN_UNITS: u32 = 7;
pub const COUNTDOWN_UNIT_MS: u64 = 1000;
pub const SETTLE_DELAY_MS: u64 = 100;
pub const RECONNECT_WAIT_MS: u64 = 200;

/// Tunables for the coach. Every field has a default so partial config files
/// keep working across versions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CoachConfig {
    /// Address of the analysis service for the TCP transport
    pub server_addr: String,
    /// Render loop period, roughly one display refresh
    pub refresh_interval_ms: u64,
    /// Minimum time between two analysis requests
    pub dispatch_interval_ms: u64,
    /// JPEG quality used when encoding sampled frames (1-100)
    pub jpeg_quality: u8,
    pub capture: CaptureHints,
    /// Length of each calibration countdown, in units. Must be at least 1,
    /// config files with 0 are rejected when loaded.
    pub countdown_units: u32,
    pub countdown_unit_ms: u64,
    /// Grace period after a finalize signal for the service result to arrive
    pub settle_delay_ms: u64,
    pub reconnect_wait_ms: u64,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            refresh_interval_ms: REFRESH_INTERVAL_MS,
            dispatch_interval_ms: DISPATCH_INTERVAL_MS,
            jpeg_quality: JPEG_QUALITY,
            capture: CaptureHints::default(),
            countdown_units: COUNTDOWN_UNITS,
            countdown_unit_ms: COUNTDOWN_UNIT_MS,
            settle_delay_ms: SETTLE_DELAY_MS,
            reconnect_wait_ms: RECONNECT_WAIT_MS,
        }
    }
}

impl CoachConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }

    pub fn countdown_unit(&self) -> Duration {
        Duration::from_millis(self.countdown_unit_ms.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    /// Loads the config from the user's config directory, `Ok(None)` when no
    /// file was saved yet.
    pub fn from_local_file() -> Result<Option<Self>, CoachError> {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(None);
        };
        let config_path = config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);

        if config_path.exists() {
            Self::from_file(&config_path).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, CoachError> {
        let file =
            std::fs::File::open(path).map_err(|e| CoachError::ConfigIOError { source: e })?;
        let config: Self = serde_json::from_reader(file)
            .map_err(|e| CoachError::ConfigSerializeError { source: e })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make a calibration phase end immediately or
    /// produce unusable frames.
    pub fn validate(&self) -> Result<(), CoachError> {
        if self.countdown_units == 0 {
            return Err(CoachError::InvalidConfig {
                reason: "countdown_units must be at least 1".to_string(),
            });
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(CoachError::InvalidConfig {
                reason: format!("jpeg_quality {} is not between 1 and 100", self.jpeg_quality),
            });
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), CoachError> {
        let config_path = dirs::config_dir()
            .ok_or(CoachError::NoConfigDir)?
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME);
        self.save_to(&config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), CoachError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CoachError::ConfigIOError { source: e })?;
            }
        }

        let file =
            std::fs::File::create(path).map_err(|e| CoachError::ConfigIOError { source: e })?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| CoachError::ConfigSerializeError { source: e })
    }
}
