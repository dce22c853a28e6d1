//! Capture configuration, optionally loaded from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::format::FrameTimeout;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this structure.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for camera handles and the capture engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Frame buffers in the pool shared with the consumer.
    pub buffer_count: usize,
    /// Read deadline in milliseconds; `-1` waits forever, `0` never waits.
    pub frame_timeout_ms: i64,
    /// Enumeration stops after this many devices.
    pub max_devices: usize,
    /// Kernel mmap buffers for device-file streams.
    pub stream_buffers: u32,
    /// How often the capture thread samples the sensor temperature.
    pub temperature_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_count: 1,
            frame_timeout_ms: 100,
            max_devices: 32,
            stream_buffers: 4,
            temperature_interval_ms: 2000,
        }
    }
}

impl CaptureConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_count == 0 {
            return Err(ConfigError::Invalid("buffer_count must be at least 1".to_owned()));
        }
        if self.stream_buffers == 0 {
            return Err(ConfigError::Invalid("stream_buffers must be at least 1".to_owned()));
        }
        if self.max_devices == 0 {
            return Err(ConfigError::Invalid("max_devices must be at least 1".to_owned()));
        }
        if self.frame_timeout_ms < -1 {
            return Err(ConfigError::Invalid(format!(
                "frame_timeout_ms must be -1, 0 or positive, got {}",
                self.frame_timeout_ms
            )));
        }
        Ok(())
    }

    /// Read deadline as a [`FrameTimeout`].
    pub fn frame_timeout(&self) -> FrameTimeout {
        FrameTimeout::from_millis(self.frame_timeout_ms)
    }

    /// Temperature sampling period.
    pub const fn temperature_interval(&self) -> Duration {
        Duration::from_millis(self.temperature_interval_ms)
    }
}
