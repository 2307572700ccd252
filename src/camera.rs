//! The capture engine.
//!
//! A [`Camera`] walks the device through
//! `Closed -> Opened -> Configured -> Streaming -> Stopped` and hands out at
//! most one [`FrameView`] at a time. A view borrows the camera, so the
//! borrow checker rejects [`Camera::release`] while a view is still alive.
//!
//! Teardown (unmap and free every buffer, then close the device) runs from
//! [`Camera::close`] and from `Drop`, whatever state was reached.

use std::fmt;
use std::io;
use std::mem;
use std::path::Path;

use nix::time::{clock_gettime, ClockId};
use tracing::{debug, info, trace, warn};

use crate::buffer::BufferPool;
use crate::config::CaptureConfig;
use crate::device::V4l2Driver;
use crate::error::{CaptureError, Result};
use crate::format::{Format, PixelFormat};
use crate::traits::{Driver, TimestampSource, VideoDevice};

/// Lifecycle state of a [`Camera`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    /// No device handle.
    Closed,
    /// Device open and capabilities checked.
    Opened,
    /// Format negotiated, buffers mapped and queued.
    Configured,
    /// Stream on; frames can be captured.
    Streaming,
    /// Stream off. Restarting requires a new camera.
    Stopped,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opened => "opened",
            Self::Configured => "configured",
            Self::Streaming => "streaming",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Device identity recorded at open time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    /// Driver name, e.g. `uvcvideo`.
    pub driver: String,
    /// Card/model name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
}

/// A zero-copy view into the buffer the driver just filled.
///
/// Valid until the matching [`Camera::release`]; the borrow on the camera
/// enforces that.
pub struct FrameView<'a> {
    /// Payload, `bytes_used` long as reported by the driver.
    pub data: &'a [u8],
    /// Configured frame width.
    pub width: u32,
    /// Configured frame height.
    pub height: u32,
    /// Confirmed pixel encoding.
    pub format: PixelFormat,
    /// Host `CLOCK_MONOTONIC` sampled right after dequeue, in microseconds.
    pub timestamp_monotonic_us: u64,
    /// Driver timestamp in microseconds (device clock domain).
    pub driver_timestamp_us: u64,
    /// Driver frame sequence number.
    pub sequence: u32,
    /// Kernel buffer index backing this view.
    pub index: u32,
}

impl FrameView<'_> {
    /// Payload length in bytes.
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the driver delivered an empty payload.
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Host monotonic time minus driver timestamp.
    ///
    /// Only meaningful when the driver stamps buffers from `CLOCK_MONOTONIC`,
    /// which is what UVC and vivid do.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn host_offset_us(&self) -> i64 {
        (self.timestamp_monotonic_us as i64).wrapping_sub(self.driver_timestamp_us as i64)
    }

    /// Copy the metadata out so it can outlive the release.
    pub const fn record(&self) -> FrameRecord {
        FrameRecord {
            width: self.width,
            height: self.height,
            format: self.format,
            timestamp_monotonic_us: self.timestamp_monotonic_us,
            driver_timestamp_us: self.driver_timestamp_us,
            sequence: self.sequence,
            index: self.index,
            bytes_used: self.data.len(),
        }
    }
}

impl fmt::Debug for FrameView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameView")
            .field("len", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("timestamp_monotonic_us", &self.timestamp_monotonic_us)
            .field("driver_timestamp_us", &self.driver_timestamp_us)
            .field("sequence", &self.sequence)
            .field("index", &self.index)
            .finish()
    }
}

/// Owned metadata of one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Pixel encoding.
    pub format: PixelFormat,
    /// Host monotonic timestamp in microseconds.
    pub timestamp_monotonic_us: u64,
    /// Driver timestamp in microseconds.
    pub driver_timestamp_us: u64,
    /// Driver frame sequence number.
    pub sequence: u32,
    /// Kernel buffer index.
    pub index: u32,
    /// Payload length in bytes.
    pub bytes_used: usize,
}

impl FrameRecord {
    /// Host monotonic time minus driver timestamp.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn host_offset_us(&self) -> i64 {
        (self.timestamp_monotonic_us as i64).wrapping_sub(self.driver_timestamp_us as i64)
    }
}

/// Sample `CLOCK_MONOTONIC` in microseconds.
pub fn monotonic_us() -> Result<u64> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    let secs = u64::try_from(now.tv_sec()).unwrap_or(0);
    let nanos = u64::try_from(now.tv_nsec()).unwrap_or(0);
    Ok(secs * 1_000_000 + nanos / 1_000)
}

fn same_interval(a: v4l::Fraction, b: v4l::Fraction) -> bool {
    u64::from(a.numerator) * u64::from(b.denominator)
        == u64::from(b.numerator) * u64::from(a.denominator)
}

/// `EBUSY` becomes [`CaptureError::DeviceBusy`]; anything else stays an ioctl failure.
fn busy_or_ioctl(path: &Path, operation: &'static str, source: io::Error) -> CaptureError {
    if source.raw_os_error() == Some(libc::EBUSY) {
        warn!(path = %path.display(), operation, "device is busy");
        CaptureError::DeviceBusy {
            path: path.to_path_buf(),
            operation,
            source,
        }
    } else {
        CaptureError::Ioctl { operation, source }
    }
}

/// Unmap every buffer, then free the driver's allocation if there was one.
fn release_pool<V: VideoDevice>(pool: &mut BufferPool, device: &mut V) {
    let allocated = pool.len() > 0;
    pool.unmap_all(&*device);
    if allocated {
        if let Err(err) = device.release_buffers() {
            warn!(error = %err, "freeing driver buffers failed");
        }
    }
}

/// Give a dequeued buffer straight back to the driver.
fn requeue<V: VideoDevice>(device: &mut V, index: u32) {
    if let Err(err) = device.queue_buffer(index) {
        warn!(index, error = %err, "requeue failed");
    }
}

/// Zero-copy capture engine for one device.
pub struct Camera<D: Driver = V4l2Driver> {
    driver: D,
    config: CaptureConfig,
    state: CameraState,
    device: Option<D::Device>,
    capabilities: CapabilitySnapshot,
    pool: BufferPool,
    outstanding: Option<u32>,
}

impl Camera<V4l2Driver> {
    /// Camera on a real V4L2 device. Nothing is opened yet.
    #[must_use]
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_driver(V4l2Driver, config)
    }
}

impl<D: Driver> Camera<D> {
    /// Camera opening its device through `driver`.
    pub const fn with_driver(driver: D, config: CaptureConfig) -> Self {
        Self {
            driver,
            config,
            state: CameraState::Closed,
            device: None,
            capabilities: CapabilitySnapshot {
                driver: String::new(),
                card: String::new(),
                bus_info: String::new(),
            },
            pool: BufferPool::new(),
            outstanding: None,
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> CameraState {
        self.state
    }

    /// Configuration, including the encoding and buffer count confirmed by
    /// the driver once configured.
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Identity recorded at open time. Empty before that.
    pub const fn capabilities(&self) -> &CapabilitySnapshot {
        &self.capabilities
    }

    /// Whether a captured frame still has to be released.
    pub const fn has_outstanding_frame(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Number of mapped buffers.
    pub fn buffer_count(&self) -> usize {
        self.pool.len()
    }

    /// Open the device and check it can stream video.
    pub fn open(&mut self) -> Result<()> {
        if self.state != CameraState::Closed {
            return Err(CaptureError::InvalidState {
                operation: "open",
                state: self.state,
            });
        }

        let path = self.config.device_path.clone();
        let device = self.driver.open(&path).map_err(|source| {
            if source.raw_os_error() == Some(libc::EBUSY) {
                warn!(path = %path.display(), "device is already in use");
                CaptureError::DeviceBusy {
                    path: path.clone(),
                    operation: "open",
                    source,
                }
            } else {
                CaptureError::Open {
                    path: path.clone(),
                    source,
                }
            }
        })?;

        let caps = device
            .query_capabilities()
            .map_err(|source| CaptureError::Ioctl {
                operation: "VIDIOC_QUERYCAP",
                source,
            })?;
        if !caps.can_capture {
            return Err(CaptureError::MissingCapability {
                path,
                capability: "video capture",
            });
        }
        if !caps.can_stream {
            return Err(CaptureError::MissingCapability {
                path,
                capability: "streaming I/O",
            });
        }

        info!(
            path = %path.display(),
            driver = %caps.driver,
            card = %caps.card,
            bus = %caps.bus_info,
            "device opened"
        );
        self.capabilities = CapabilitySnapshot {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus_info,
        };
        self.device = Some(device);
        self.state = CameraState::Opened;
        Ok(())
    }

    /// Switch driver timestamps to start of exposure if the device allows it.
    ///
    /// Returns `false` when the control is missing or rejected; that is a
    /// normal outcome, not an error.
    pub fn try_start_of_exposure(&mut self) -> bool {
        let Some(device) = self.device.as_mut() else {
            return false;
        };
        if let Err(err) = device.query_timestamp_source() {
            debug!(error = %err, "timestamp source control not available");
            return false;
        }
        match device.set_timestamp_source(TimestampSource::StartOfExposure) {
            Ok(()) => {
                info!("timestamp source set to start of exposure");
                true
            }
            Err(err) => {
                debug!(error = %err, "start-of-exposure timestamps rejected");
                false
            }
        }
    }

    /// Negotiate format and frame rate, then map and queue the buffers.
    ///
    /// Does nothing unless the camera is [`CameraState::Opened`]. On failure
    /// every buffer mapped so far is unmapped, the driver's buffers are freed
    /// and the camera stays opened, so configure can be retried.
    pub fn configure(&mut self) -> Result<()> {
        if self.state != CameraState::Opened {
            debug!(state = %self.state, "configure skipped");
            return Ok(());
        }
        self.config.validate()?;

        if let Err(err) = self.negotiate() {
            if let Some(device) = self.device.as_mut() {
                release_pool(&mut self.pool, device);
            }
            return Err(err);
        }
        self.state = CameraState::Configured;
        Ok(())
    }

    fn negotiate(&mut self) -> Result<()> {
        let path = self.config.device_path.clone();
        let Some(device) = self.device.as_mut() else {
            return Err(CaptureError::InvalidState {
                operation: "configure",
                state: self.state,
            });
        };

        let requested = Format::new(
            self.config.dimension.width(),
            self.config.dimension.height(),
            self.config.format.fourcc(),
        );
        let accepted = device
            .set_format(&requested)
            .map_err(|source| busy_or_ioctl(&path, "VIDIOC_S_FMT", source))?;
        if accepted.fourcc != requested.fourcc {
            return Err(CaptureError::FormatMismatch {
                operation: "VIDIOC_S_FMT",
                requested: requested.fourcc,
                actual: accepted.fourcc,
            });
        }
        self.config.format = PixelFormat::try_from(accepted.fourcc)?;
        if accepted.width != requested.width || accepted.height != requested.height {
            warn!(
                requested = %self.config.dimension,
                width = accepted.width,
                height = accepted.height,
                "driver adjusted frame geometry"
            );
        }

        let live = device.format().map_err(|source| CaptureError::Ioctl {
            operation: "VIDIOC_G_FMT",
            source,
        })?;
        if live.fourcc != accepted.fourcc {
            return Err(CaptureError::FormatMismatch {
                operation: "VIDIOC_G_FMT",
                requested: accepted.fourcc,
                actual: live.fourcc,
            });
        }

        let interval = self.config.fps.interval();
        let actual = device
            .set_frame_interval(interval)
            .map_err(|source| CaptureError::Ioctl {
                operation: "VIDIOC_S_PARM",
                source,
            })?;
        if !same_interval(interval, actual) {
            warn!(requested = %interval, actual = %actual, "driver adjusted frame interval");
        }

        let requested_count = self.config.buffer_count;
        let granted = device
            .request_buffers(requested_count)
            .map_err(|source| busy_or_ioctl(&path, "VIDIOC_REQBUFS", source))?;
        if granted == 0 {
            return Err(CaptureError::NoBuffers {
                requested: requested_count,
            });
        }
        if granted != requested_count {
            info!(requested = requested_count, granted, "driver changed buffer count");
        }

        self.pool.allocate(granted as usize);
        for index in 0..granted {
            let layout = device
                .query_buffer(index)
                .map_err(|source| CaptureError::Buffer {
                    operation: "VIDIOC_QUERYBUF",
                    index,
                    source,
                })?;
            self.pool.map(&*device, &layout)?;
        }
        for index in 0..granted {
            device
                .queue_buffer(index)
                .map_err(|source| CaptureError::Buffer {
                    operation: "VIDIOC_QBUF",
                    index,
                    source,
                })?;
        }
        self.config.buffer_count = granted;

        info!(
            format = %self.config.format,
            dimension = %self.config.dimension,
            fps = %self.config.fps,
            buffers = granted,
            "capture configured"
        );
        Ok(())
    }

    /// Turn the stream on.
    pub fn start(&mut self) -> Result<()> {
        let path = self.config.device_path.clone();
        let device = match (self.state, self.device.as_mut()) {
            (CameraState::Configured, Some(device)) => device,
            (state, _) => {
                return Err(CaptureError::InvalidState {
                    operation: "start",
                    state,
                })
            }
        };
        device
            .stream_on()
            .map_err(|source| busy_or_ioctl(&path, "VIDIOC_STREAMON", source))?;
        self.state = CameraState::Streaming;
        debug!("stream on");
        Ok(())
    }

    /// Block until the driver fills a buffer and return a view into it.
    ///
    /// The previous frame must have been released.
    pub fn capture(&mut self) -> Result<FrameView<'_>> {
        self.capture_with(monotonic_us)
    }

    /// [`Camera::capture`] with the host clock supplied by the caller.
    fn capture_with<C: FnOnce() -> Result<u64>>(&mut self, clock: C) -> Result<FrameView<'_>> {
        if let Some(index) = self.outstanding {
            return Err(CaptureError::FrameOutstanding(index));
        }
        let device = match (self.state, self.device.as_mut()) {
            (CameraState::Streaming, Some(device)) => device,
            (state, _) => {
                return Err(CaptureError::InvalidState {
                    operation: "capture",
                    state,
                })
            }
        };

        let dequeued = device
            .dequeue_buffer()
            .map_err(|source| CaptureError::Ioctl {
                operation: "VIDIOC_DQBUF",
                source,
            })?;
        let timestamp_monotonic_us = match clock() {
            Ok(now) => now,
            Err(err) => {
                requeue(device, dequeued.index);
                return Err(err);
            }
        };

        let data = match self.pool.view(dequeued.index, dequeued.bytes_used) {
            Ok(data) => data,
            Err(err) => {
                // The index is real, only the length is bogus: give the buffer back.
                if matches!(err, CaptureError::BufferOverrun { .. }) {
                    requeue(device, dequeued.index);
                }
                return Err(err);
            }
        };
        self.outstanding = Some(dequeued.index);

        trace!(
            index = dequeued.index,
            sequence = dequeued.sequence,
            bytes_used = dequeued.bytes_used,
            "frame dequeued"
        );
        Ok(FrameView {
            data,
            width: self.config.dimension.width(),
            height: self.config.dimension.height(),
            format: self.config.format,
            timestamp_monotonic_us,
            driver_timestamp_us: dequeued.timestamp_us,
            sequence: dequeued.sequence,
            index: dequeued.index,
        })
    }

    /// Give the outstanding buffer back to the driver.
    ///
    /// With nothing outstanding this logs a warning and does nothing.
    pub fn release(&mut self) -> Result<()> {
        let Some(index) = self.outstanding else {
            warn!("release called with no outstanding frame");
            return Ok(());
        };
        let Some(device) = self.device.as_mut() else {
            return Err(CaptureError::InvalidState {
                operation: "release",
                state: self.state,
            });
        };
        device
            .queue_buffer(index)
            .map_err(|source| CaptureError::Buffer {
                operation: "VIDIOC_QBUF",
                index,
                source,
            })?;
        self.outstanding = None;
        Ok(())
    }

    /// Turn the stream off. An unreleased frame stays outstanding.
    ///
    /// Stopping twice is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        let device = match (self.state, self.device.as_mut()) {
            (CameraState::Stopped, _) => return Ok(()),
            (CameraState::Streaming, Some(device)) => device,
            (state, _) => {
                return Err(CaptureError::InvalidState {
                    operation: "stop",
                    state,
                })
            }
        };
        device
            .stream_off()
            .map_err(|source| CaptureError::Ioctl {
                operation: "VIDIOC_STREAMOFF",
                source,
            })?;
        if let Some(index) = self.outstanding {
            warn!(index, "stream stopped with an unreleased frame");
        }
        self.state = CameraState::Stopped;
        debug!("stream off");
        Ok(())
    }

    /// Unmap and free every buffer, then close the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            if self.state == CameraState::Streaming {
                if let Err(err) = device.stream_off() {
                    warn!(error = %err, "stream off during teardown failed");
                }
            }
            release_pool(&mut self.pool, &mut device);
            drop(device);
            info!(path = %self.config.device_path.display(), "device closed");
        }
        self.outstanding = None;
        self.state = CameraState::Closed;
    }

    /// Move everything into a new camera, leaving this one closed and empty.
    #[must_use]
    pub fn take(&mut self) -> Self
    where
        D: Clone,
    {
        let empty = Self::with_driver(self.driver.clone(), self.config.clone());
        mem::replace(self, empty)
    }
}

impl<D: Driver> Drop for Camera<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: Driver> fmt::Debug for Camera<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("device_path", &self.config.device_path)
            .field("state", &self.state)
            .field("buffers", &self.pool.len())
            .field("outstanding", &self.outstanding)
            .finish_non_exhaustive()
    }
}
