//! DMA memory for transfers: buffers, descriptor chains and the request pool

pub mod buffer;
pub mod descriptor;
pub mod pools;

pub use buffer::DmaBuffer;
pub use descriptor::{
    BufferStatus, ChainResult, DescriptorChain, DmaDescriptor, HostStatus, IsoInStatus, IsoOutStatus, NonIsoStatus,
};
pub use pools::{PoolStats, RequestStore, TransferHandle, TransferPool};

/// Alignment the core's AHB master requires for buffer and descriptor addresses
pub const DMA_ALIGNMENT: usize = 4;

/// Round `addr` up to the DMA alignment
#[inline]
pub const fn align_dma(addr: usize) -> usize {
    (addr + DMA_ALIGNMENT - 1) & !(DMA_ALIGNMENT - 1)
}

/// Check if an address satisfies the DMA alignment
#[inline]
pub const fn is_dma_aligned(addr: usize) -> bool {
    addr & (DMA_ALIGNMENT - 1) == 0
}

/// Data cache maintenance around DMA transfers
///
/// Only active with the `dcache` feature on Cortex-M7 class parts; on
/// cache-less cores and on the host these are no-ops.
pub mod cache {
    #[cfg(all(feature = "dcache", target_arch = "arm", target_os = "none"))]
    mod imp {
        use cortex_m::asm::{dsb, isb};

        const DCACHE_LINE_SIZE: usize = 32;

        const SCB_DCCMVAC: *mut u32 = 0xE000_EF68 as *mut u32;
        const SCB_DCIMVAC: *mut u32 = 0xE000_EF5C as *mut u32;

        fn by_line(reg: *mut u32, addr: usize, size: usize) {
            dsb();
            let start = addr & !(DCACHE_LINE_SIZE - 1);
            let end = (addr + size + DCACHE_LINE_SIZE - 1) & !(DCACHE_LINE_SIZE - 1);
            for line in (start..end).step_by(DCACHE_LINE_SIZE) {
                // Safety: SCB maintenance registers are always mapped on Cortex-M7
                unsafe { core::ptr::write_volatile(reg, line as u32) };
            }
            dsb();
            isb();
        }

        pub fn clean(addr: usize, size: usize) {
            by_line(SCB_DCCMVAC, addr, size);
        }

        pub fn invalidate(addr: usize, size: usize) {
            by_line(SCB_DCIMVAC, addr, size);
        }
    }

    #[cfg(not(all(feature = "dcache", target_arch = "arm", target_os = "none")))]
    mod imp {
        pub fn clean(_addr: usize, _size: usize) {}
        pub fn invalidate(_addr: usize, _size: usize) {}
    }

    /// Write back CPU writes before the core reads the memory
    #[inline]
    pub fn prepare_for_device(addr: usize, size: usize) {
        imp::clean(addr, size);
    }

    /// Drop stale lines before the CPU reads memory the core wrote
    #[inline]
    pub fn prepare_for_cpu(addr: usize, size: usize) {
        imp::invalidate(addr, size);
    }
}
