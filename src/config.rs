//! Capture configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::format::{FrameRate, PixelDimension, PixelFormat};

/// Conventional path of the first capture device.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/video0";
/// Buffer count used when none is configured.
pub const DEFAULT_BUFFER_COUNT: u32 = 4;
/// Smallest accepted buffer count.
pub const MIN_BUFFER_COUNT: u32 = 2;
/// Largest accepted buffer count.
pub const MAX_BUFFER_COUNT: u32 = 32;

/// What to capture and from where.
///
/// The engine owns its copy once constructed; after negotiation it records
/// the confirmed encoding and the buffer count the driver actually granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Device node, e.g. `/dev/video0`.
    pub device_path: PathBuf,
    /// Requested resolution.
    pub dimension: PixelDimension,
    /// Requested pixel encoding.
    pub format: PixelFormat,
    /// Requested frame rate.
    pub fps: FrameRate,
    /// Number of mapped buffers to request; the driver may grant fewer.
    pub buffer_count: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            dimension: PixelDimension::default(),
            format: PixelFormat::default(),
            fps: FrameRate::default(),
            buffer_count: DEFAULT_BUFFER_COUNT,
        }
    }
}

impl CaptureConfig {
    /// Default configuration for the given device node.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(device_path: P) -> Self {
        Self {
            device_path: device_path.into(),
            ..Self::default()
        }
    }

    /// Set the resolution.
    #[must_use]
    pub const fn with_dimension(mut self, dimension: PixelDimension) -> Self {
        self.dimension = dimension;
        self
    }

    /// Set the pixel encoding.
    #[must_use]
    pub const fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the frame rate.
    #[must_use]
    pub const fn with_fps(mut self, fps: FrameRate) -> Self {
        self.fps = fps;
        self
    }

    /// Set the requested buffer count.
    #[must_use]
    pub const fn with_buffer_count(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Check values that the type system does not already constrain.
    pub fn validate(&self) -> Result<()> {
        if self.device_path.as_os_str().is_empty() {
            return Err(CaptureError::Config("device path is empty".to_owned()));
        }
        if !(MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT).contains(&self.buffer_count) {
            return Err(CaptureError::Config(format!(
                "buffer count {} outside {MIN_BUFFER_COUNT}..={MAX_BUFFER_COUNT}",
                self.buffer_count
            )));
        }
        Ok(())
    }

    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
