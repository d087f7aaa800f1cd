//! Caller-owned transfer buffers
//!
//! The core's DMA engine addresses memory through 32-bit bus addresses, so a
//! buffer is tracked as a raw pointer plus length for as long as a transfer
//! is in flight.

use core::ptr::NonNull;

/// A region of memory handed to the controller for one transfer
///
/// The buffer does not own its memory. Constructors either take a `'static`
/// borrow or require the caller to guarantee the region outlives the transfer.
#[derive(Debug)]
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the buffer is only touched by whichever context owns the transfer
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// Zero-length buffer, used for status stages and empty pool slots
    pub const fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
        }
    }

    /// Wrap a statically allocated buffer
    pub fn from_static(buf: &'static mut [u8]) -> Self {
        let len = buf.len();
        // A slice pointer is never null
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self { ptr, len }
    }

    /// Wrap a raw region
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes until the
    /// transfer using this buffer completes or is cancelled, and must not be
    /// accessed by the CPU while the core owns it.
    pub const unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length in bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length buffer
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bus address of the first byte
    pub fn dma_addr(&self) -> u32 {
        self.ptr.as_ptr() as usize as u32
    }

    /// Bus address `offset` bytes into the buffer
    pub fn dma_addr_at(&self, offset: u32) -> u32 {
        self.dma_addr().wrapping_add(offset)
    }

    /// CPU view of the buffer
    pub fn as_slice(&self) -> &[u8] {
        // Safety: constructors guarantee `ptr` is valid for `len` bytes
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable CPU view of the buffer
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: constructors guarantee `ptr` is valid for `len` bytes
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Alias `len` bytes starting at `offset`
    ///
    /// The window shares memory with `self`; the owner must not touch that
    /// range while the window is in flight.
    pub(crate) fn window(&self, offset: usize, len: usize) -> Option<Self> {
        if offset.checked_add(len)? > self.len {
            return None;
        }
        // Safety: bounds checked above, offset stays inside the allocation
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
        Some(Self { ptr, len })
    }

    /// Take the buffer out, leaving an empty one behind
    pub fn take(&mut self) -> Self {
        core::mem::replace(self, Self::empty())
    }

    /// Clean the data cache before the core reads the buffer
    pub fn sync_for_device(&self) {
        super::cache::prepare_for_device(self.ptr.as_ptr() as usize, self.len);
    }

    /// Invalidate the data cache after the core wrote the buffer
    pub fn sync_for_cpu(&self) {
        super::cache::prepare_for_cpu(self.ptr.as_ptr() as usize, self.len);
    }
}
