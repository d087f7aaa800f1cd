//! Zero-allocation transfer request pool with compile-time sizing

use crate::dma::DmaBuffer;
use crate::error::{Result, UsbError};
use crate::transfer::TransferRequest;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Handle to a pooled transfer request
///
/// The generation changes every time a slot is reused, so a handle kept past
/// its request's completion is rejected instead of aliasing a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferHandle {
    index: u16,
    generation: u16,
}

impl TransferHandle {
    /// Slot index
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    /// Slot generation at allocation time
    pub const fn generation(&self) -> u16 {
        self.generation
    }
}

/// Storage the engines look requests up in
///
/// Lets endpoint and channel code stay independent of the pool's size.
pub trait RequestStore {
    /// Borrow a live request
    fn request(&mut self, handle: TransferHandle) -> Result<&mut TransferRequest>;

    /// Release a request's slot
    fn release(&mut self, handle: TransferHandle) -> Result<TransferRequest>;
}

impl<const N: usize> RequestStore for TransferPool<N> {
    fn request(&mut self, handle: TransferHandle) -> Result<&mut TransferRequest> {
        self.get_mut(handle)
    }

    fn release(&mut self, handle: TransferHandle) -> Result<TransferRequest> {
        self.free(handle)
    }
}

/// Bounded pool of transfer requests
pub struct TransferPool<const N: usize> {
    requests: [TransferRequest; N],
    allocated: [AtomicBool; N],
    generations: [u16; N],
    peak: AtomicU32,
    failures: AtomicU32,
}

impl<const N: usize> TransferPool<N> {
    /// Create an empty pool (const-compatible)
    pub const fn new() -> Self {
        const EMPTY: TransferRequest = TransferRequest::EMPTY;
        const ATOMIC_FALSE: AtomicBool = AtomicBool::new(false);

        Self {
            requests: [EMPTY; N],
            allocated: [ATOMIC_FALSE; N],
            generations: [0; N],
            peak: AtomicU32::new(0),
            failures: AtomicU32::new(0),
        }
    }

    /// Claim a slot and store `request` in it
    pub fn alloc(&mut self, request: TransferRequest) -> Result<TransferHandle> {
        for (i, allocated) in self.allocated.iter().enumerate() {
            if !allocated.swap(true, Ordering::Acquire) {
                self.generations[i] = self.generations[i].wrapping_add(1);
                self.requests[i] = request;
                let used = self.in_use() as u32;
                self.peak.fetch_max(used, Ordering::Relaxed);
                return Ok(TransferHandle {
                    index: i as u16,
                    generation: self.generations[i],
                });
            }
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "defmt")]
        defmt::warn!("Transfer pool exhausted ({} slots)", N);
        Err(UsbError::NoResources)
    }

    fn check(&self, handle: TransferHandle) -> Result<usize> {
        let i = handle.index();
        if i < N && self.allocated[i].load(Ordering::Acquire) && self.generations[i] == handle.generation {
            Ok(i)
        } else {
            Err(UsbError::InvalidParameter)
        }
    }

    /// True while `handle` refers to a live request
    pub fn contains(&self, handle: TransferHandle) -> bool {
        self.check(handle).is_ok()
    }

    /// Borrow a live request
    pub fn get(&self, handle: TransferHandle) -> Result<&TransferRequest> {
        let i = self.check(handle)?;
        Ok(&self.requests[i])
    }

    /// Mutably borrow a live request
    pub fn get_mut(&mut self, handle: TransferHandle) -> Result<&mut TransferRequest> {
        let i = self.check(handle)?;
        Ok(&mut self.requests[i])
    }

    /// Release a slot, returning the request it held
    pub fn free(&mut self, handle: TransferHandle) -> Result<TransferRequest> {
        let i = self.check(handle)?;
        let request = core::mem::replace(&mut self.requests[i], TransferRequest::EMPTY);
        self.allocated[i].store(false, Ordering::Release);
        Ok(request)
    }

    /// Move the buffer out of a live request
    pub fn take_buffer(&mut self, handle: TransferHandle) -> Result<DmaBuffer> {
        Ok(self.get_mut(handle)?.buffer.take())
    }

    /// Slots currently allocated
    pub fn in_use(&self) -> usize {
        self.allocated.iter().filter(|a| a.load(Ordering::Relaxed)).count()
    }

    /// Get pool utilization statistics
    pub fn stats(&self) -> PoolStats {
        let used = self.in_use();
        PoolStats {
            total: N,
            available: N - used,
            peak: self.peak.load(Ordering::Relaxed) as usize,
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl<const N: usize> Default for TransferPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool utilization statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolStats {
    /// Slots in the pool
    pub total: usize,
    /// Slots free now
    pub available: usize,
    /// Highest number of slots used at once
    pub peak: usize,
    /// Allocations refused because the pool was full
    pub failures: u32,
}

impl PoolStats {
    /// Check if the pool is getting low on slots
    pub fn is_low(&self) -> bool {
        self.total > 0 && self.available * 5 < self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(len: u32) -> TransferRequest {
        TransferRequest::new(DmaBuffer::empty(), len, false, 0)
    }

    #[test]
    fn test_alloc_until_exhausted() {
        let mut pool: TransferPool<2> = TransferPool::new();
        let a = pool.alloc(request(1)).unwrap();
        let b = pool.alloc(request(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.alloc(request(3)), Err(UsbError::NoResources));
        let stats = pool.stats();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.failures, 1);
        assert!(stats.is_low());
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut pool: TransferPool<1> = TransferPool::new();
        let first = pool.alloc(request(8)).unwrap();
        assert_eq!(pool.free(first).unwrap().length, 8);
        let second = pool.alloc(request(16)).unwrap();
        assert_eq!(first.index(), second.index());
        assert_eq!(pool.get(first).err(), Some(UsbError::InvalidParameter));
        assert_eq!(pool.get(second).unwrap().length, 16);
        assert_eq!(pool.stats().peak, 1);
    }

    #[test]
    fn test_double_free_rejected() {
        let mut pool: TransferPool<4> = TransferPool::new();
        let h = pool.alloc(request(1)).unwrap();
        assert!(pool.free(h).is_ok());
        assert!(pool.free(h).is_err());
        assert_eq!(pool.stats().available, 4);
    }
}
