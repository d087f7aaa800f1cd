//! Data FIFO partitioning
//!
//! The core carves one shared data RAM into an Rx FIFO, a non-periodic Tx FIFO
//! and either per-endpoint Tx FIFOs (device) or one periodic Tx FIFO (host).
//! Regions are laid out back to back starting at word 0.

use super::{offsets, FifoSize, RegisterAccess};
use crate::error::{Result, UsbError};

/// Maximum number of additional Tx FIFOs (device FIFOs 1..=15)
pub const MAX_TX_FIFOS: usize = 15;

/// Requested FIFO depths in 32-bit words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FifoRequest {
    /// Rx FIFO depth
    pub rx: u16,
    /// Non-periodic Tx FIFO depth (device EP0 / host non-periodic)
    pub nperio_tx: u16,
    /// Additional Tx FIFO depths: device FIFOs 1.. or the host periodic FIFO
    pub tx: [u16; MAX_TX_FIFOS],
    /// Number of valid entries in `tx`
    pub tx_count: usize,
}

impl FifoRequest {
    /// Request with Rx and non-periodic Tx regions only
    pub const fn new(rx: u16, nperio_tx: u16) -> Self {
        Self {
            rx,
            nperio_tx,
            tx: [0; MAX_TX_FIFOS],
            tx_count: 0,
        }
    }

    /// Append one Tx FIFO region
    pub fn push_tx(&mut self, depth: u16) -> Result<()> {
        if self.tx_count >= MAX_TX_FIFOS {
            return Err(UsbError::NoResources);
        }
        self.tx[self.tx_count] = depth;
        self.tx_count += 1;
        Ok(())
    }

    /// Sum of all requested depths
    pub fn total(&self) -> u32 {
        self.tx[..self.tx_count]
            .iter()
            .fold(self.rx as u32 + self.nperio_tx as u32, |acc, &d| acc + d as u32)
    }
}

/// Resolved FIFO layout, guaranteed to fit the hardware depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FifoPartition {
    /// Rx FIFO region
    pub rx: FifoSize,
    /// Non-periodic Tx FIFO region
    pub nperio_tx: FifoSize,
    /// Additional Tx FIFO regions
    pub tx: [FifoSize; MAX_TX_FIFOS],
    /// Number of valid entries in `tx`
    pub tx_count: usize,
    /// Set when at least one request was reduced to fit
    pub clamped: bool,
}

impl FifoPartition {
    /// Lay out `request` inside `total_depth` words
    ///
    /// Regions are granted in order (Rx, non-periodic Tx, then each Tx FIFO);
    /// a region that does not fit is shrunk to the space left, possibly to zero.
    pub fn compute(request: &FifoRequest, total_depth: u16) -> Self {
        let mut remaining = total_depth as u32;
        let mut start = 0u32;
        let mut clamped = false;

        let mut grant = |wanted: u16| -> FifoSize {
            let depth = (wanted as u32).min(remaining);
            if depth < wanted as u32 {
                clamped = true;
            }
            let region = FifoSize::new(start, depth);
            start += depth;
            remaining -= depth;
            region
        };

        let rx = grant(request.rx);
        let nperio_tx = grant(request.nperio_tx);
        let mut tx = [FifoSize::empty(); MAX_TX_FIFOS];
        for (slot, &depth) in tx.iter_mut().zip(request.tx[..request.tx_count].iter()) {
            *slot = grant(depth);
        }

        if clamped {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "FIFO request of {} words exceeds depth {}, clamped",
                request.total(),
                total_depth
            );
        }

        Self {
            rx,
            nperio_tx,
            tx,
            tx_count: request.tx_count,
            clamped,
        }
    }

    /// Total words allocated
    pub fn allocated(&self) -> u32 {
        self.tx[..self.tx_count]
            .iter()
            .fold(self.rx.depth() + self.nperio_tx.depth(), |acc, r| acc + r.depth())
    }

    /// Configuration error to report, if the request had to be clamped
    pub fn status(&self) -> Result<()> {
        if self.clamped {
            Err(UsbError::FifoOverAllocation)
        } else {
            Ok(())
        }
    }

    /// Program the device layout: GRXFSIZ, GNPTXFSIZ and DIEPTXF1..n
    pub fn apply_device(&self, regs: &dyn RegisterAccess) {
        regs.write(offsets::GRXFSIZ, self.rx.depth());
        regs.write(offsets::GNPTXFSIZ, self.nperio_tx.bits());
        for (n, region) in self.tx[..self.tx_count].iter().enumerate() {
            regs.write(offsets::dieptxf(n + 1), region.bits());
        }
    }

    /// Program the host layout: GRXFSIZ, GNPTXFSIZ and HPTXFSIZ
    pub fn apply_host(&self, regs: &dyn RegisterAccess) {
        regs.write(offsets::GRXFSIZ, self.rx.depth());
        regs.write(offsets::GNPTXFSIZ, self.nperio_tx.bits());
        if self.tx_count > 0 {
            regs.write(offsets::HPTXFSIZ, self.tx[0].bits());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_accumulates_start_addresses() {
        let mut req = FifoRequest::new(512, 64);
        req.push_tx(128).unwrap();
        req.push_tx(256).unwrap();
        let part = FifoPartition::compute(&req, 1024);
        assert!(!part.clamped);
        assert_eq!(part.nperio_tx.start(), 512);
        assert_eq!(part.tx[0].start(), 576);
        assert_eq!(part.tx[1].start(), 704);
        assert_eq!(part.tx[1].depth(), 256);
        assert_eq!(part.allocated(), 960);
        assert!(part.status().is_ok());
    }

    #[test]
    fn test_over_allocation_is_clamped_and_flagged() {
        let mut req = FifoRequest::new(800, 200);
        req.push_tx(200).unwrap();
        req.push_tx(200).unwrap();
        let part = FifoPartition::compute(&req, 1100);
        assert!(part.clamped);
        assert_eq!(part.tx[0].depth(), 100);
        assert_eq!(part.tx[1].depth(), 0);
        assert_eq!(part.allocated(), 1100);
        assert_eq!(part.status(), Err(UsbError::FifoOverAllocation));
    }

    #[test]
    fn test_budget_holds_for_arbitrary_requests() {
        for total in [0u16, 17, 256, 1000, 4096] {
            for rx in [0u16, 100, 3000] {
                let mut req = FifoRequest::new(rx, 300);
                for depth in [50u16, 700, 1] {
                    req.push_tx(depth).unwrap();
                }
                let part = FifoPartition::compute(&req, total);
                assert!(part.allocated() <= total as u32);
                assert_eq!(part.clamped, req.total() > total as u32);
            }
        }
    }

    #[test]
    fn test_push_tx_capacity() {
        let mut req = FifoRequest::new(0, 0);
        for _ in 0..MAX_TX_FIFOS {
            req.push_tx(1).unwrap();
        }
        assert_eq!(req.push_tx(1), Err(UsbError::NoResources));
    }
}
