//! Error type for capture operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::camera::CameraState;
use crate::format::FourCC;

/// Error type for capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device node could not be opened (missing, permissions, ...).
    #[error("failed to open {}: {source}", path.display())]
    Open {
        /// Device path.
        path: PathBuf,
        /// Underlying OS error.
        source: io::Error,
    },

    /// The device is exclusively held by another process.
    #[error("device {} is busy during {operation}: {source}", path.display())]
    DeviceBusy {
        /// Device path.
        path: PathBuf,
        /// Operation that reported `EBUSY`.
        operation: &'static str,
        /// Underlying OS error.
        source: io::Error,
    },

    /// The device cannot serve this engine.
    #[error("device {} does not support {capability}", path.display())]
    MissingCapability {
        /// Device path.
        path: PathBuf,
        /// Human readable name of the missing capability.
        capability: &'static str,
    },

    /// Pixel encoding outside the supported set.
    #[error("unsupported pixel format '{0}'")]
    UnsupportedFormat(FourCC),

    /// The driver rejected or silently replaced the requested encoding.
    #[error("driver format mismatch after {operation}: requested '{requested}', got '{actual}'")]
    FormatMismatch {
        /// Operation whose result disagreed with the request.
        operation: &'static str,
        /// Encoding asked for.
        requested: FourCC,
        /// Encoding the driver reported.
        actual: FourCC,
    },

    /// A device-level ioctl failed.
    #[error("{operation} failed: {source}")]
    Ioctl {
        /// Ioctl name, e.g. `VIDIOC_S_FMT`.
        operation: &'static str,
        /// Underlying OS error.
        source: io::Error,
    },

    /// A per-buffer operation (query, map, queue) failed.
    #[error("{operation} failed for buffer {index}: {source}")]
    Buffer {
        /// Operation name, e.g. `mmap`.
        operation: &'static str,
        /// Kernel buffer index.
        index: u32,
        /// Underlying OS error.
        source: io::Error,
    },

    /// The driver granted zero buffers.
    #[error("driver granted no buffers (requested {requested})")]
    NoBuffers {
        /// Buffer count asked for.
        requested: u32,
    },

    /// The driver dequeued an index outside of the mapped pool.
    #[error("driver returned buffer index {index}, pool holds {count} buffers")]
    InvalidBufferIndex {
        /// Index reported by the driver.
        index: u32,
        /// Number of mapped buffers.
        count: usize,
    },

    /// The driver reported more used bytes than the buffer holds.
    #[error("driver reported {bytes_used} bytes used in buffer {index} of {length} bytes")]
    BufferOverrun {
        /// Kernel buffer index.
        index: u32,
        /// Used length reported by the driver.
        bytes_used: usize,
        /// Mapped length of the buffer.
        length: usize,
    },

    /// A frame is already checked out and must be released first.
    #[error("buffer {0} is still outstanding, release it before capturing again")]
    FrameOutstanding(u32),

    /// Operation called in the wrong lifecycle state.
    #[error("cannot {operation} while camera is {state}")]
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// State the camera was in.
        state: CameraState,
    },

    /// Sampling the host monotonic clock failed.
    #[error("clock_gettime(CLOCK_MONOTONIC) failed: {0}")]
    Clock(#[from] nix::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A recorded frame sequence failed a check.
    #[error("frame validation failed: {0}")]
    Validation(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CaptureError {
    /// Whether this error reports a device held by someone else.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::DeviceBusy { .. })
    }
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
