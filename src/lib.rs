//! mmap-capture: zero-copy V4L2 frame capture.
//!
//! A [`Camera`] opens a capture device, negotiates format and frame rate,
//! maps the driver's buffers into process memory and hands out one
//! timestamped [`FrameView`] at a time. The kernel interface sits behind the
//! [`Driver`]/[`VideoDevice`] traits, so the engine can be driven by a mock
//! in tests.

pub mod buffer;
pub mod camera;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use camera::{monotonic_us, Camera, CameraState, CapabilitySnapshot, FrameRecord, FrameView};
pub use config::CaptureConfig;
pub use device::{V4l2Device, V4l2Driver};
pub use error::{CaptureError, Result};
pub use format::{
    pack_dimensions, unpack_dimensions, Format, FourCC, FrameRate, PixelDimension, PixelFormat,
};
pub use traits::{
    BufferLayout, DequeuedBuffer, DeviceCapabilities, Driver, TimestampSource, VideoDevice,
};
