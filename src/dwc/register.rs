//! Register access for the DWC OTG core
//!
//! All controller state lives behind 32-bit memory-mapped registers. Access goes
//! through [`RegisterAccess`] so the same protocol code drives real silicon
//! ([`Mmio`]) and the register-file mocks used by the tests.

use crate::error::{Result, UsbError};
use embedded_hal::delay::DelayNs;

/// Word-wide access to the controller register window, addressed by byte offset
///
/// Implementations must perform every access as a single volatile 32-bit
/// operation. The trait is object safe; protocol code takes `&dyn RegisterAccess`.
pub trait RegisterAccess {
    /// Read the register at `offset`
    fn read(&self, offset: usize) -> u32;

    /// Write the register at `offset`
    fn write(&self, offset: usize, value: u32);

    /// Read-modify-write: clear `clear` bits, then set `set` bits
    #[inline(always)]
    fn modify_bits(&self, offset: usize, clear: u32, set: u32) {
        let current = self.read(offset);
        self.write(offset, (current & !clear) | set);
    }

    /// Set bits in a read-write register
    #[inline(always)]
    fn set_bits(&self, offset: usize, mask: u32) {
        self.modify_bits(offset, 0, mask);
    }

    /// Clear bits in a read-write register
    #[inline(always)]
    fn clear_bits(&self, offset: usize, mask: u32) {
        self.modify_bits(offset, mask, 0);
    }

    /// Write-1-to-clear operation for status registers
    #[inline(always)]
    fn write_1_to_clear(&self, offset: usize, mask: u32) {
        self.write(offset, mask);
    }
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for &T {
    #[inline(always)]
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    #[inline(always)]
    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}

/// Memory-mapped register window of one physical controller
///
/// Reads and writes are volatile and fenced on ARM targets so control writes
/// are not reordered against status reads by the weakly-ordered bus.
#[derive(Debug)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Create an accessor for the controller at `base`
    ///
    /// # Safety
    ///
    /// `base` must be the start of a DWC OTG register window that stays mapped
    /// for the lifetime of the accessor, and the caller must not create a second
    /// accessor for the same controller.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// Base address of the register window
    pub const fn base(&self) -> usize {
        self.base
    }
}

#[inline(always)]
fn barrier_before() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::dmb();
}

#[inline(always)]
fn barrier_after_write() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::dsb();
}

impl RegisterAccess for Mmio {
    #[inline(always)]
    fn read(&self, offset: usize) -> u32 {
        debug_assert!(offset % 4 == 0, "unaligned register offset {:#x}", offset);
        let addr = (self.base + offset) as *const u32;
        barrier_before();
        // Safety: construction guarantees `base` maps a live register window
        let value = unsafe { core::ptr::read_volatile(addr) };
        barrier_before();
        value
    }

    #[inline(always)]
    fn write(&self, offset: usize, value: u32) {
        debug_assert!(offset % 4 == 0, "unaligned register offset {:#x}", offset);
        let addr = (self.base + offset) as *mut u32;
        barrier_before();
        // Safety: construction guarantees `base` maps a live register window
        unsafe { core::ptr::write_volatile(addr, value) };
        barrier_after_write();
    }
}

/// Bounded busy-wait used for reset, FIFO flush and mode switch polling
///
/// The bound is an explicit iteration count with a fixed delay per iteration, so
/// the worst-case wait is `iterations * step_us` microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PollBudget {
    /// Maximum number of polls
    pub iterations: u32,
    /// Delay between polls in microseconds (0 spins)
    pub step_us: u32,
}

impl PollBudget {
    /// Create a poll budget
    pub const fn new(iterations: u32, step_us: u32) -> Self {
        Self { iterations, step_us }
    }

    /// Poll `condition` until it holds or the budget is exhausted
    pub fn wait_for<D, F>(&self, delay: &mut D, mut condition: F) -> Result<()>
    where
        D: DelayNs + ?Sized,
        F: FnMut() -> bool,
    {
        for _ in 0..self.iterations {
            if condition() {
                return Ok(());
            }
            if self.step_us > 0 {
                delay.delay_us(self.step_us);
            }
        }
        if condition() {
            Ok(())
        } else {
            Err(UsbError::Timeout)
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Register file used by the unit tests

    use super::RegisterAccess;
    use crate::dwc::offsets;
    use core::cell::RefCell;
    use std::collections::{HashMap, VecDeque};
    use std::vec::Vec;

    /// Sparse register file with write-1-to-clear and self-clearing bits
    #[derive(Default)]
    pub struct MockRegisters {
        values: RefCell<HashMap<usize, u32>>,
        pops: RefCell<HashMap<usize, VecDeque<u32>>>,
        log: RefCell<Vec<(usize, u32)>>,
    }

    impl MockRegisters {
        pub fn new() -> Self {
            let mock = Self::default();
            mock.set(offsets::GSNPSID, 0x4F54_310A);
            mock
        }

        /// Backdoor write that bypasses register semantics and the log
        pub fn set(&self, offset: usize, value: u32) {
            self.values.borrow_mut().insert(offset, value);
        }

        pub fn get(&self, offset: usize) -> u32 {
            self.values.borrow().get(&offset).copied().unwrap_or(0)
        }

        /// Queue a value returned by the next read of `offset`
        pub fn push_read(&self, offset: usize, value: u32) {
            self.pops.borrow_mut().entry(offset).or_default().push_back(value);
        }

        pub fn writes_to(&self, offset: usize) -> Vec<u32> {
            self.log
                .borrow()
                .iter()
                .filter(|(o, _)| *o == offset)
                .map(|(_, v)| *v)
                .collect()
        }

        pub fn clear_log(&self) {
            self.log.borrow_mut().clear();
        }
    }

    impl RegisterAccess for MockRegisters {
        fn read(&self, offset: usize) -> u32 {
            if let Some(queue) = self.pops.borrow_mut().get_mut(&offset) {
                if let Some(value) = queue.pop_front() {
                    return value;
                }
            }
            self.get(offset)
        }

        fn write(&self, offset: usize, value: u32) {
            self.log.borrow_mut().push((offset, value));
            let current = self.get(offset);
            let stored = match offsets::write_semantics(offset) {
                offsets::WriteSemantics::Plain => value,
                offsets::WriteSemantics::WriteOneToClear(mask) => current & !(value & mask),
                offsets::WriteSemantics::SelfClearing(mask, sticky) => (value & !mask) | sticky,
                offsets::WriteSemantics::FifoPush => current,
            };
            self.set(offset, stored);
        }
    }
}
