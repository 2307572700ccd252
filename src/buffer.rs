//! Memory-mapped kernel buffers.
//!
//! The pool owns one entry per buffer the driver granted. Entries are
//! invalid until mapped and become invalid again once unmapped, so teardown
//! can run from any point of a partially completed setup.

#![allow(unsafe_code)]

use std::{io, ptr, slice};

use tracing::{trace, warn};

use crate::error::{CaptureError, Result};
use crate::traits::{BufferLayout, VideoDevice};

/// One kernel buffer mapped into process memory.
#[derive(Debug)]
pub struct MappedBuffer {
    data: *mut u8,
    len: usize,
}

// SAFETY: the region is plain shared memory owned by the mapping, not by the
// creating thread. Access is serialized by the owning pool.
unsafe impl Send for MappedBuffer {}

impl MappedBuffer {
    /// An entry that holds no mapping.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
        }
    }

    /// Wrap a mapped region.
    ///
    /// # Safety
    ///
    /// `data` must point to `len` bytes that stay mapped and readable until the
    /// buffer is passed to [`VideoDevice::unmap_buffer`] of the device that mapped it.
    #[must_use]
    pub const unsafe fn from_raw_parts(data: *mut u8, len: usize) -> Self {
        Self { data, len }
    }

    /// Base address of the mapping.
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.data
    }

    /// Mapped length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping has zero length.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Non-null and not the `MAP_FAILED` sentinel.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.data.is_null() && self.data.cast::<libc::c_void>() != libc::MAP_FAILED
    }
}

impl Default for MappedBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

/// Fixed-size set of mapped buffers, indexed by kernel buffer index.
#[derive(Debug, Default)]
pub(crate) struct BufferPool {
    buffers: Vec<MappedBuffer>,
}

impl BufferPool {
    pub(crate) const fn new() -> Self {
        Self {
            buffers: Vec::new(),
        }
    }

    /// Size the pool to the granted buffer count. All entries start unmapped.
    pub(crate) fn allocate(&mut self, count: usize) {
        debug_assert_eq!(self.mapped_count(), 0, "pool resized while buffers are mapped");
        self.buffers.clear();
        self.buffers.resize_with(count, MappedBuffer::empty);
    }

    /// Number of entries, mapped or not.
    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Number of entries currently holding a mapping.
    pub(crate) fn mapped_count(&self) -> usize {
        self.buffers.iter().filter(|buf| buf.is_valid()).count()
    }

    #[cfg(test)]
    pub(crate) fn is_valid(&self, index: usize) -> bool {
        self.buffers.get(index).is_some_and(MappedBuffer::is_valid)
    }

    /// Map the buffer described by `layout` into its slot.
    pub(crate) fn map<D: VideoDevice>(&mut self, device: &D, layout: &BufferLayout) -> Result<()> {
        let count = self.buffers.len();
        let slot = self
            .buffers
            .get_mut(layout.index as usize)
            .ok_or(CaptureError::InvalidBufferIndex {
                index: layout.index,
                count,
            })?;

        let mapped = device
            .map_buffer(layout)
            .map_err(|source| CaptureError::Buffer {
                operation: "mmap",
                index: layout.index,
                source,
            })?;
        if !mapped.is_valid() {
            return Err(CaptureError::Buffer {
                operation: "mmap",
                index: layout.index,
                source: io::Error::other("mapping returned an invalid address"),
            });
        }

        trace!(index = layout.index, length = mapped.len(), "buffer mapped");
        *slot = mapped;
        Ok(())
    }

    /// Unmap one entry. Failures are logged; the entry is cleared either way.
    pub(crate) fn unmap<D: VideoDevice>(&mut self, device: &D, index: usize) {
        let Some(slot) = self.buffers.get_mut(index) else {
            return;
        };
        if !slot.is_valid() {
            return;
        }

        if let Err(err) = device.unmap_buffer(slot) {
            warn!(index, error = %err, "munmap failed");
        }
        *slot = MappedBuffer::empty();
    }

    /// Unmap every valid entry and shrink the pool to zero.
    pub(crate) fn unmap_all<D: VideoDevice>(&mut self, device: &D) {
        for index in 0..self.buffers.len() {
            self.unmap(device, index);
        }
        self.buffers.clear();
    }

    /// Borrow the first `bytes_used` bytes of buffer `index`.
    pub(crate) fn view(&self, index: u32, bytes_used: u32) -> Result<&[u8]> {
        let buffer = self
            .buffers
            .get(index as usize)
            .filter(|buf| buf.is_valid())
            .ok_or(CaptureError::InvalidBufferIndex {
                index,
                count: self.buffers.len(),
            })?;

        let used = bytes_used as usize;
        if used > buffer.len {
            return Err(CaptureError::BufferOverrun {
                index,
                bytes_used: used,
                length: buffer.len,
            });
        }

        // SAFETY: the entry is valid, so `data` points to `len` mapped bytes that
        // stay mapped until `unmap`, which needs `&mut self` and therefore cannot
        // run while the returned slice borrows the pool.
        Ok(unsafe { slice::from_raw_parts(buffer.data, used) })
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let leaked = self.mapped_count();
        if leaked > 0 {
            warn!(leaked, "buffer pool dropped with mapped buffers");
        }
    }
}
