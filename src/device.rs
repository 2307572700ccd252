//! V4L2 device implementation using the raw ioctl layer of the v4l crate.
//!
//! The high-level `v4l::io::mmap::Stream` hides buffer indices and opens
//! devices non-blocking, so the engine drives the ioctls itself.

#![allow(unsafe_code)]

use std::os::raw::{c_int, c_void};
use std::path::Path;
use std::{io, mem, ptr};

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{
    v4l2_buffer, v4l2_capability, v4l2_control, v4l2_format, v4l2_queryctrl,
    v4l2_requestbuffers, v4l2_streamparm,
};

use crate::buffer::MappedBuffer;
use crate::format::{Format, FourCC};
use crate::traits::{
    BufferLayout, DequeuedBuffer, DeviceCapabilities, Driver, TimestampSource, VideoDevice,
};

const V4L2_CID_USER_BASE: u32 = 0x0098_0900;
/// Timestamp-source control; older kernel headers do not define it.
const V4L2_CID_TIMESTAMP_SOURCE: u32 = V4L2_CID_USER_BASE + 0x1029;
const V4L2_TIMESTAMP_SRC_EOF: i32 = 0;
const V4L2_TIMESTAMP_SRC_SOE: i32 = 1;
const V4L2_FIELD_NONE: u32 = 1;
const V4L2_COLORSPACE_JPEG: u32 = 7;

const CAPTURE: u32 = Type::VideoCapture as u32;
const MMAP: u32 = Memory::Mmap as u32;

/// Opens `/dev/video*` nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Driver;

impl Driver for V4l2Driver {
    type Device = V4l2Device;

    fn open(&self, path: &Path) -> io::Result<V4l2Device> {
        // Blocking mode: dequeue waits for the driver instead of returning EAGAIN.
        let fd = v4l2::open(path, libc::O_RDWR)?;
        debug!(path = %path.display(), fd, "device opened");
        Ok(V4l2Device { fd })
    }
}

/// An open V4L2 capture device. The file descriptor is closed on drop.
#[derive(Debug)]
pub struct V4l2Device {
    fd: c_int,
}

impl V4l2Device {
    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        // SAFETY: `arg` is the exclusively borrowed structure matching `request`.
        unsafe { v4l2::ioctl(self.fd, request, (arg as *mut T).cast::<c_void>()) }
    }

    fn buffer_request(index: u32) -> v4l2_buffer {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = CAPTURE;
        buf.memory = MMAP;
        buf.index = index;
        buf
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if let Err(err) = v4l2::close(self.fd) {
            warn!(fd = self.fd, error = %err, "failed to close device");
        }
    }
}

fn format_from_raw(raw: &v4l2_format) -> Format {
    // SAFETY: `type_` is VIDEO_CAPTURE, so `pix` is the active union member.
    let pix = unsafe { raw.fmt.pix };
    Format {
        width: pix.width,
        height: pix.height,
        fourcc: FourCC::from_u32(pix.pixelformat),
        stride: pix.bytesperline,
        size: pix.sizeimage,
    }
}

// Negative timestamps never come out of a sane driver; clamp instead of wrapping.
#[allow(clippy::cast_sign_loss)]
fn timeval_to_us(sec: i64, usec: i64) -> u64 {
    (sec.max(0) as u64) * 1_000_000 + usec.max(0) as u64
}

impl VideoDevice for V4l2Device {
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut raw: v4l2_capability = unsafe { mem::zeroed() };
        self.ioctl(vidioc::VIDIOC_QUERYCAP, &mut raw)?;

        let caps = v4l::Capabilities::from(raw);
        Ok(DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(Flags::STREAMING),
        })
    }

    fn query_timestamp_source(&self) -> io::Result<()> {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut query: v4l2_queryctrl = unsafe { mem::zeroed() };
        query.id = V4L2_CID_TIMESTAMP_SOURCE;
        self.ioctl(vidioc::VIDIOC_QUERYCTRL, &mut query)
    }

    fn set_timestamp_source(&mut self, source: TimestampSource) -> io::Result<()> {
        let mut control = v4l2_control {
            id: V4L2_CID_TIMESTAMP_SOURCE,
            value: match source {
                TimestampSource::EndOfFrame => V4L2_TIMESTAMP_SRC_EOF,
                TimestampSource::StartOfExposure => V4L2_TIMESTAMP_SRC_SOE,
            },
        };
        self.ioctl(vidioc::VIDIOC_S_CTRL, &mut control)
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut raw: v4l2_format = unsafe { mem::zeroed() };
        raw.type_ = CAPTURE;
        // SAFETY: writing the `pix` member selected by `type_`.
        unsafe {
            raw.fmt.pix.width = format.width;
            raw.fmt.pix.height = format.height;
            raw.fmt.pix.pixelformat = format.fourcc.to_u32();
            raw.fmt.pix.field = V4L2_FIELD_NONE;
            raw.fmt.pix.bytesperline = format.stride;
            raw.fmt.pix.sizeimage = format.size;
            raw.fmt.pix.colorspace = V4L2_COLORSPACE_JPEG;
        }
        self.ioctl(vidioc::VIDIOC_S_FMT, &mut raw)?;
        Ok(format_from_raw(&raw))
    }

    fn format(&self) -> io::Result<Format> {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut raw: v4l2_format = unsafe { mem::zeroed() };
        raw.type_ = CAPTURE;
        self.ioctl(vidioc::VIDIOC_G_FMT, &mut raw)?;
        Ok(format_from_raw(&raw))
    }

    fn set_frame_interval(&mut self, interval: v4l::Fraction) -> io::Result<v4l::Fraction> {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = CAPTURE;
        // SAFETY: `capture` is the member selected by `type_`.
        unsafe {
            parm.parm.capture.timeperframe.numerator = interval.numerator;
            parm.parm.capture.timeperframe.denominator = interval.denominator;
        }
        self.ioctl(vidioc::VIDIOC_S_PARM, &mut parm)?;

        // SAFETY: as above, the driver filled in the `capture` member.
        let actual = unsafe { parm.parm.capture.timeperframe };
        Ok(v4l::Fraction::new(actual.numerator, actual.denominator))
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = CAPTURE;
        req.memory = MMAP;
        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferLayout> {
        let mut buf = Self::buffer_request(index);
        self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buf)?;
        Ok(BufferLayout {
            index,
            length: buf.length,
            // SAFETY: MMAP buffers report their mapping cookie in `offset`.
            offset: unsafe { buf.m.offset },
        })
    }

    fn map_buffer(&self, layout: &BufferLayout) -> io::Result<MappedBuffer> {
        let length = layout.length as usize;
        let offset = libc::off_t::try_from(layout.offset).map_err(io::Error::other)?;
        // SAFETY: a fresh shared mapping of the kernel buffer at the queried offset.
        let data = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset,
            )?
        };
        // SAFETY: mmap succeeded, the region stays mapped until `unmap_buffer`.
        Ok(unsafe { MappedBuffer::from_raw_parts(data.cast::<u8>(), length) })
    }

    fn unmap_buffer(&self, buffer: &MappedBuffer) -> io::Result<()> {
        // SAFETY: the buffer came from `map_buffer` and the pool drops it right after.
        unsafe { v4l2::munmap(buffer.as_ptr().cast::<c_void>(), buffer.len()) }
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buf = Self::buffer_request(index);
        self.ioctl(vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut buf = Self::buffer_request(0);
        self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf)?;

        // timeval fields are 32-bit on some targets.
        #[allow(clippy::useless_conversion)]
        let timestamp_us = timeval_to_us(
            i64::from(buf.timestamp.tv_sec),
            i64::from(buf.timestamp.tv_usec),
        );
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp_us,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut typ = CAPTURE;
        self.ioctl(vidioc::VIDIOC_STREAMON, &mut typ)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut typ = CAPTURE;
        self.ioctl(vidioc::VIDIOC_STREAMOFF, &mut typ)
    }
}
