//! Tx FIFO assignment for device IN endpoints

use crate::error::{Result, UsbError};
use crate::transfer::TransferType;

/// Tracks which Tx FIFOs are held by enabled IN endpoints
///
/// With dedicated FIFOs every IN endpoint gets its own FIFO. In shared mode
/// non-periodic endpoints share FIFO 0 and periodic endpoints claim one of the
/// periodic FIFOs. FIFO 0 is never tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxFifoAllocator {
    dedicated: bool,
    count: u8,
    used: u16,
}

impl TxFifoAllocator {
    /// Allocator for `count` FIFOs numbered 1..=count
    pub const fn new(dedicated: bool, count: u8) -> Self {
        Self {
            dedicated,
            count: if count > 15 { 15 } else { count },
            used: 0,
        }
    }

    /// Claim a FIFO for an IN endpoint of `ep_type`
    pub fn assign(&mut self, ep_type: TransferType) -> Result<u8> {
        if !self.dedicated && !ep_type.is_periodic() {
            return Ok(0);
        }
        for n in 1..=self.count {
            let bit = 1u16 << n;
            if self.used & bit == 0 {
                self.used |= bit;
                return Ok(n);
            }
        }
        #[cfg(feature = "defmt")]
        defmt::warn!("No free Tx FIFO ({} in use)", self.used.count_ones());
        Err(UsbError::NoResources)
    }

    /// Return a FIFO claimed by [`assign`](Self::assign)
    pub fn release(&mut self, fifo: u8) {
        if fifo != 0 && fifo <= self.count {
            self.used &= !(1u16 << fifo);
        }
    }

    /// FIFOs currently held
    pub fn in_use(&self) -> u32 {
        self.used.count_ones()
    }

    /// Drop every assignment
    pub fn clear(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedicated_assign_and_release() {
        let mut fifos = TxFifoAllocator::new(true, 2);
        assert_eq!(fifos.assign(TransferType::Bulk), Ok(1));
        assert_eq!(fifos.assign(TransferType::Interrupt), Ok(2));
        assert_eq!(fifos.assign(TransferType::Bulk), Err(UsbError::NoResources));
        fifos.release(1);
        assert_eq!(fifos.assign(TransferType::Isochronous), Ok(1));
        assert_eq!(fifos.in_use(), 2);
    }

    #[test]
    fn test_shared_mode_only_tracks_periodic() {
        let mut fifos = TxFifoAllocator::new(false, 1);
        assert_eq!(fifos.assign(TransferType::Bulk), Ok(0));
        assert_eq!(fifos.assign(TransferType::Isochronous), Ok(1));
        assert_eq!(fifos.assign(TransferType::Interrupt), Err(UsbError::NoResources));
        fifos.release(0);
        assert_eq!(fifos.in_use(), 1);
        fifos.release(1);
        assert_eq!(fifos.in_use(), 0);
    }
}
