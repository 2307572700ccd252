//! Mock driver for testing without hardware.
//!
//! The driver and every device it opens share one state block, so tests can
//! script driver misbehaviour up front and inspect kernel-side effects
//! (mapped regions, queue contents, stream state) after the engine is done.

#![allow(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer::MappedBuffer;
use crate::format::{Format, FourCC};
use crate::traits::{
    BufferLayout, DequeuedBuffer, DeviceCapabilities, Driver, TimestampSource, VideoDevice,
};

/// First driver timestamp handed out, in microseconds.
pub const FIRST_TIMESTAMP_US: u64 = 1_000_000;
/// Driver timestamp step between frames (~30fps).
pub const FRAME_STEP_US: u64 = 33_333;

#[derive(Debug)]
struct MockState {
    capabilities: DeviceCapabilities,
    missing: bool,
    busy: bool,
    open: bool,
    close_calls: usize,

    timestamp_control: bool,
    timestamp_source: Option<TimestampSource>,

    format: Format,
    substituted: Option<FourCC>,
    reverted: Option<FourCC>,
    adjusted_geometry: Option<(u32, u32)>,
    interval: Option<v4l::Fraction>,
    adjusted_interval: Option<v4l::Fraction>,

    grant_limit: Option<u32>,
    requests: Vec<u32>,
    granted: u32,
    failing_query_at: Option<u32>,
    failing_map_at: Option<u32>,
    regions: HashMap<usize, usize>,
    addresses: HashMap<u32, usize>,
    map_calls: usize,
    unmap_calls: usize,

    queued: VecDeque<u32>,
    queue_calls: Vec<u32>,
    failing_queue_at: Option<u32>,
    streaming: bool,
    failing_stream_on: bool,
    stream_on_calls: usize,
    stream_off_calls: usize,
    failing_dequeue: bool,
    bogus_index: Option<u32>,
    bytes_used: Option<u32>,
    sequence: u32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            missing: false,
            busy: false,
            open: false,
            close_calls: 0,
            timestamp_control: true,
            timestamp_source: None,
            format: Format::new(640, 480, FourCC::YUYV),
            substituted: None,
            reverted: None,
            adjusted_geometry: None,
            interval: None,
            adjusted_interval: None,
            grant_limit: None,
            requests: Vec::new(),
            granted: 0,
            failing_query_at: None,
            failing_map_at: None,
            regions: HashMap::new(),
            addresses: HashMap::new(),
            map_calls: 0,
            unmap_calls: 0,
            queued: VecDeque::new(),
            queue_calls: Vec::new(),
            failing_queue_at: None,
            streaming: false,
            failing_stream_on: false,
            stream_on_calls: 0,
            stream_off_calls: 0,
            failing_dequeue: false,
            bogus_index: None,
            bytes_used: None,
            sequence: 0,
        }
    }
}

impl Drop for MockState {
    fn drop(&mut self) {
        // Nothing can borrow the regions once the last handle is gone.
        for (addr, len) in self.regions.drain() {
            // SAFETY: produced by `Box::into_raw` in `map_buffer` with this length.
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(addr as *mut u8, len)) });
        }
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Mock driver. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    /// Create a mock driver for a well-behaved capture device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    fn configure<F: FnOnce(&mut MockState)>(self, apply: F) -> Self {
        apply(&mut self.state());
        self
    }

    /// Report these capabilities.
    #[must_use]
    pub fn with_capabilities(self, capabilities: DeviceCapabilities) -> Self {
        self.configure(|s| s.capabilities = capabilities)
    }

    /// Fail every open with `ENOENT`.
    #[must_use]
    pub fn with_missing_node(self) -> Self {
        self.configure(|s| s.missing = true)
    }

    /// Fail every open with `EBUSY`, as if another process held the node.
    #[must_use]
    pub fn with_busy(self) -> Self {
        self.configure(|s| s.busy = true)
    }

    /// Whether the timestamp-source control exists.
    #[must_use]
    pub fn with_timestamp_control(self, supported: bool) -> Self {
        self.configure(|s| s.timestamp_control = supported)
    }

    /// Answer every format request with this encoding.
    #[must_use]
    pub fn with_substituted_format(self, fourcc: FourCC) -> Self {
        self.configure(|s| s.substituted = Some(fourcc))
    }

    /// Accept format requests, then report this encoding on readback.
    #[must_use]
    pub fn with_reverted_format(self, fourcc: FourCC) -> Self {
        self.configure(|s| s.reverted = Some(fourcc))
    }

    /// Clamp requested geometry to `width`x`height`.
    #[must_use]
    pub fn with_adjusted_geometry(self, width: u32, height: u32) -> Self {
        self.configure(|s| s.adjusted_geometry = Some((width, height)))
    }

    /// Settle on this frame interval regardless of the request.
    #[must_use]
    pub fn with_adjusted_interval(self, interval: v4l::Fraction) -> Self {
        self.configure(|s| s.adjusted_interval = Some(interval))
    }

    /// Grant at most `count` buffers.
    #[must_use]
    pub fn with_granted_buffers(self, count: u32) -> Self {
        self.configure(|s| s.grant_limit = Some(count))
    }

    /// Fail querying the buffer at `index` with `EINVAL`.
    #[must_use]
    pub fn with_failing_query_at(self, index: u32) -> Self {
        self.configure(|s| s.failing_query_at = Some(index))
    }

    /// Fail mapping the buffer at `index`.
    #[must_use]
    pub fn with_failing_map_at(self, index: u32) -> Self {
        self.configure(|s| s.failing_map_at = Some(index))
    }

    /// Fail queueing the buffer at `index` with `EIO`.
    #[must_use]
    pub fn with_failing_queue_at(self, index: u32) -> Self {
        self.configure(|s| s.failing_queue_at = Some(index))
    }

    /// Fail every stream-on with `EIO`.
    #[must_use]
    pub fn with_failing_stream_on(self) -> Self {
        self.configure(|s| s.failing_stream_on = true)
    }

    /// Change the map failure on a driver already in use.
    pub fn set_failing_map_at(&self, index: Option<u32>) {
        self.state().failing_map_at = index;
    }

    /// Change the queue failure on a driver already in use.
    pub fn set_failing_queue_at(&self, index: Option<u32>) {
        self.state().failing_queue_at = index;
    }

    /// Report `index` for every dequeued buffer.
    #[must_use]
    pub fn with_bogus_index(self, index: u32) -> Self {
        self.configure(|s| s.bogus_index = Some(index))
    }

    /// Report `bytes` used for every dequeued buffer.
    #[must_use]
    pub fn with_bytes_used(self, bytes: u32) -> Self {
        self.configure(|s| s.bytes_used = Some(bytes))
    }

    /// Fail every dequeue with `EIO`.
    #[must_use]
    pub fn with_failing_dequeue(self) -> Self {
        self.configure(|s| s.failing_dequeue = true)
    }

    /// Whether a device handle is currently open.
    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// How many device handles were closed.
    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }

    /// Number of regions currently mapped.
    pub fn mapped_regions(&self) -> usize {
        self.state().regions.len()
    }

    /// Number of map calls, failed ones included.
    pub fn map_calls(&self) -> usize {
        self.state().map_calls
    }

    /// Number of successful unmap calls.
    pub fn unmap_calls(&self) -> usize {
        self.state().unmap_calls
    }

    /// Buffer counts passed to buffer requests, in order.
    pub fn buffer_requests(&self) -> Vec<u32> {
        self.state().requests.clone()
    }

    /// Indices waiting in the driver's incoming queue.
    pub fn queued(&self) -> Vec<u32> {
        self.state().queued.iter().copied().collect()
    }

    /// Every index ever queued, in order.
    pub fn queue_calls(&self) -> Vec<u32> {
        self.state().queue_calls.clone()
    }

    /// Whether the device is streaming.
    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    /// Number of stream-on calls.
    pub fn stream_on_calls(&self) -> usize {
        self.state().stream_on_calls
    }

    /// Number of stream-off calls.
    pub fn stream_off_calls(&self) -> usize {
        self.state().stream_off_calls
    }

    /// Selected timestamp source, if any was set.
    pub fn timestamp_source(&self) -> Option<TimestampSource> {
        self.state().timestamp_source
    }

    /// Last format the driver accepted.
    pub fn format(&self) -> Format {
        self.state().format.clone()
    }

    /// Last frame interval the driver settled on.
    pub fn interval(&self) -> Option<v4l::Fraction> {
        self.state().interval
    }
}

impl Driver for MockDriver {
    type Device = MockDevice;

    fn open(&self, _path: &Path) -> io::Result<MockDevice> {
        let mut state = self.state();
        if state.missing {
            return Err(errno(libc::ENOENT));
        }
        if state.busy || state.open {
            return Err(errno(libc::EBUSY));
        }
        state.open = true;
        Ok(MockDevice {
            state: Arc::clone(&self.state),
        })
    }
}

/// Device handle produced by [`MockDriver`]. Dropping it closes the device.
#[derive(Debug)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.open = false;
            state.streaming = false;
            state.close_calls += 1;
        }
    }
}

/// Fill a buffer the way the encoding would look to a consumer.
///
/// YUYV gets a horizontal luma ramp shifted by the sequence number with
/// neutral chroma. MJPEG gets start/end-of-image markers around a filler.
fn fill_payload(data: &mut [u8], fourcc: FourCC, sequence: u32) {
    #[allow(clippy::cast_possible_truncation)]
    let shift = sequence as u8;
    if fourcc == FourCC::MJPG {
        data.fill(shift);
        if data.len() >= 4 {
            let end = data.len();
            data[..2].copy_from_slice(&[0xFF, 0xD8]);
            data[end - 2..].copy_from_slice(&[0xFF, 0xD9]);
        }
        return;
    }
    for (i, pair) in data.chunks_exact_mut(2).enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let luma = (i as u8).wrapping_add(shift);
        pair[0] = luma;
        pair[1] = 128;
    }
}

impl VideoDevice for MockDevice {
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        Ok(self.state().capabilities.clone())
    }

    fn query_timestamp_source(&self) -> io::Result<()> {
        if self.state().timestamp_control {
            Ok(())
        } else {
            Err(errno(libc::EINVAL))
        }
    }

    fn set_timestamp_source(&mut self, source: TimestampSource) -> io::Result<()> {
        let mut state = self.state();
        if !state.timestamp_control {
            return Err(errno(libc::EINVAL));
        }
        state.timestamp_source = Some(source);
        Ok(())
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        let mut state = self.state();
        // The queue is locked while buffers are allocated.
        if state.streaming || state.granted > 0 {
            return Err(errno(libc::EBUSY));
        }
        let (width, height) = state
            .adjusted_geometry
            .unwrap_or((format.width, format.height));
        let fourcc = state.substituted.unwrap_or(format.fourcc);
        state.format = Format {
            width,
            height,
            fourcc,
            stride: width * 2,
            size: width * height * 2,
        };
        Ok(state.format.clone())
    }

    fn format(&self) -> io::Result<Format> {
        let state = self.state();
        let mut format = state.format.clone();
        if let Some(fourcc) = state.reverted {
            format.fourcc = fourcc;
        }
        Ok(format)
    }

    fn set_frame_interval(&mut self, interval: v4l::Fraction) -> io::Result<v4l::Fraction> {
        let mut state = self.state();
        let actual = state.adjusted_interval.unwrap_or(interval);
        state.interval = Some(actual);
        Ok(actual)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut state = self.state();
        if !state.regions.is_empty() {
            return Err(errno(libc::EBUSY));
        }
        state.requests.push(count);
        state.granted = state.grant_limit.map_or(count, |limit| count.min(limit));
        // Reallocation drops whatever was queued.
        state.queued.clear();
        Ok(state.granted)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferLayout> {
        let state = self.state();
        if index >= state.granted || state.failing_query_at == Some(index) {
            return Err(errno(libc::EINVAL));
        }
        Ok(BufferLayout {
            index,
            length: state.format.size,
            offset: index * state.format.size,
        })
    }

    fn map_buffer(&self, layout: &BufferLayout) -> io::Result<MappedBuffer> {
        let mut state = self.state();
        state.map_calls += 1;
        if state.failing_map_at == Some(layout.index) {
            return Err(errno(libc::ENOMEM));
        }

        let len = layout.length as usize;
        let data = Box::into_raw(vec![0u8; len].into_boxed_slice()).cast::<u8>();
        state.regions.insert(data as usize, len);
        state.addresses.insert(layout.index, data as usize);
        // SAFETY: the allocation lives until `unmap_buffer` or the state is dropped.
        Ok(unsafe { MappedBuffer::from_raw_parts(data, len) })
    }

    fn unmap_buffer(&self, buffer: &MappedBuffer) -> io::Result<()> {
        let mut state = self.state();
        let addr = buffer.as_ptr() as usize;
        let len = state.regions.remove(&addr).ok_or_else(|| errno(libc::EINVAL))?;
        state.addresses.retain(|_, mapped| *mapped != addr);
        state.unmap_calls += 1;
        // SAFETY: produced by `Box::into_raw` in `map_buffer` with this length.
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(addr as *mut u8, len)) });
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut state = self.state();
        if index >= state.granted || state.queued.contains(&index) {
            return Err(errno(libc::EINVAL));
        }
        if state.failing_queue_at == Some(index) {
            return Err(errno(libc::EIO));
        }
        state.queued.push_back(index);
        state.queue_calls.push(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut state = self.state();
        if state.failing_dequeue {
            return Err(errno(libc::EIO));
        }
        if !state.streaming {
            return Err(errno(libc::EINVAL));
        }
        let index = state.queued.pop_front().ok_or_else(|| errno(libc::EAGAIN))?;

        let sequence = state.sequence;
        state.sequence += 1;

        let format = state.format.clone();
        let default_used = if format.fourcc == FourCC::MJPG {
            format.size / 4
        } else {
            format.size
        };
        let bytes_used = state.bytes_used.unwrap_or(default_used);

        if let Some(&addr) = state.addresses.get(&index) {
            let len = state.regions.get(&addr).copied().unwrap_or(0);
            let fill = len.min(bytes_used as usize);
            // SAFETY: the region is mapped and the engine only reads it after dequeue.
            let data = unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, fill) };
            fill_payload(data, format.fourcc, sequence);
        }

        Ok(DequeuedBuffer {
            index: state.bogus_index.unwrap_or(index),
            bytes_used,
            sequence,
            timestamp_us: FIRST_TIMESTAMP_US + u64::from(sequence) * FRAME_STEP_US,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut state = self.state();
        state.stream_on_calls += 1;
        if state.failing_stream_on {
            return Err(errno(libc::EIO));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut state = self.state();
        state.stream_off_calls += 1;
        state.streaming = false;
        // Stream-off returns every buffer to userspace.
        state.queued.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(driver: &MockDriver) -> MockDevice {
        driver.open(Path::new("/dev/video0")).expect("open failed")
    }

    #[test]
    fn test_second_open_is_busy() {
        let driver = MockDriver::new();
        let device = open(&driver);
        let err = driver.open(Path::new("/dev/video0")).expect_err("should be busy");
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

        drop(device);
        assert!(!driver.is_open());
        assert_eq!(driver.close_calls(), 1);
        let _device = open(&driver);
    }

    #[test]
    fn test_grant_limit() {
        let driver = MockDriver::new().with_granted_buffers(2);
        let mut device = open(&driver);
        assert_eq!(device.request_buffers(4).expect("reqbufs failed"), 2);
        assert!(device.query_buffer(1).is_ok());
        assert!(device.query_buffer(2).is_err());
    }

    #[test]
    fn test_format_locked_while_buffers_allocated() {
        let driver = MockDriver::new();
        let mut device = open(&driver);
        let format = Format::new(1280, 720, FourCC::YUYV);
        device.set_format(&format).expect("s_fmt failed");

        device.request_buffers(2).expect("reqbufs failed");
        device.queue_buffer(0).expect("qbuf failed");
        let err = device.set_format(&format).expect_err("queue should be busy");
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

        device.release_buffers().expect("release failed");
        assert_eq!(driver.buffer_requests(), vec![2, 0]);
        assert!(driver.queued().is_empty());
        device.set_format(&format).expect("s_fmt after release failed");
    }

    #[test]
    fn test_yuyv_payload_ramp() {
        let mut data = vec![0u8; 8];
        fill_payload(&mut data, FourCC::YUYV, 1);
        assert_eq!(data, [1, 128, 2, 128, 3, 128, 4, 128]);
    }

    #[test]
    fn test_mjpeg_payload_markers() {
        let mut data = vec![0u8; 16];
        fill_payload(&mut data, FourCC::MJPG, 0);
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        assert_eq!(&data[14..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_dequeue_requires_streaming() {
        let driver = MockDriver::new();
        let mut device = open(&driver);
        device.request_buffers(2).expect("reqbufs failed");
        device.queue_buffer(0).expect("qbuf failed");
        assert!(device.dequeue_buffer().is_err());

        device.stream_on().expect("streamon failed");
        let buf = device.dequeue_buffer().expect("dqbuf failed");
        assert_eq!(buf.index, 0);
        assert_eq!(buf.timestamp_us, FIRST_TIMESTAMP_US);
    }
}
