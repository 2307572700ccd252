//! Abstraction over the kernel video-capture interface.
//!
//! The capture engine only talks to hardware through these traits, in the
//! order the V4L2 streaming protocol requires:
//!
//! query-capability, (optional) timestamp-source control, set-format,
//! get-format, set-frame-interval, request-buffers, query-buffer + map for
//! each granted buffer, queue all, stream-on, dequeue/queue repeatedly,
//! stream-off, unmap all, close.
//!
//! Closing the device is the `Drop` of the [`Driver::Device`] value.

use std::io;
use std::path::Path;

use crate::buffer::MappedBuffer;
use crate::format::Format;

/// Capability flags and identity reported by the device.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming I/O.
    pub can_stream: bool,
}

/// Where in the frame lifetime the driver samples its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    /// End of frame (usually the driver default).
    EndOfFrame,
    /// Start of exposure.
    StartOfExposure,
}

/// Kernel-side placement of one buffer, as returned by a buffer query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Kernel buffer index.
    pub index: u32,
    /// Buffer length in bytes.
    pub length: u32,
    /// Offset to pass to `mmap`.
    pub offset: u32,
}

/// A buffer handed back by the driver after it finished filling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Kernel buffer index.
    pub index: u32,
    /// Bytes of payload actually written.
    pub bytes_used: u32,
    /// Driver frame sequence number.
    pub sequence: u32,
    /// Driver timestamp in microseconds (device clock domain).
    pub timestamp_us: u64,
}

/// Opens device nodes.
pub trait Driver {
    /// The device handle produced by [`Driver::open`].
    type Device: VideoDevice;

    /// Open the node at `path` for exclusive read/write access.
    fn open(&self, path: &Path) -> io::Result<Self::Device>;
}

/// Operations on an open capture device.
pub trait VideoDevice {
    /// Query identity and capability flags.
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities>;

    /// Succeeds when the timestamp-source control exists on this device.
    fn query_timestamp_source(&self) -> io::Result<()>;

    /// Select the timestamp source.
    fn set_timestamp_source(&mut self, source: TimestampSource) -> io::Result<()>;

    /// Request a format. Returns what the driver actually accepted.
    fn set_format(&mut self, format: &Format) -> io::Result<Format>;

    /// Read back the live format.
    fn format(&self) -> io::Result<Format>;

    /// Request a time per frame. Returns the interval the driver settled on.
    fn set_frame_interval(&mut self, interval: v4l::Fraction) -> io::Result<v4l::Fraction>;

    /// Ask for `count` memory-mapped buffers. Returns the granted count.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Free every buffer the driver allocated. All mappings must be gone first.
    fn release_buffers(&mut self) -> io::Result<()> {
        self.request_buffers(0).map(drop)
    }

    /// Query length and mapping offset of buffer `index`.
    fn query_buffer(&self, index: u32) -> io::Result<BufferLayout>;

    /// Map a queried buffer into process memory.
    fn map_buffer(&self, layout: &BufferLayout) -> io::Result<MappedBuffer>;

    /// Unmap a region previously returned by [`VideoDevice::map_buffer`].
    fn unmap_buffer(&self, buffer: &MappedBuffer) -> io::Result<()>;

    /// Hand buffer `index` to the driver for filling.
    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    /// Block until the driver has a filled buffer and take it.
    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer>;

    /// Start streaming.
    fn stream_on(&mut self) -> io::Result<()>;

    /// Stop streaming.
    fn stream_off(&mut self) -> io::Result<()>;
}
