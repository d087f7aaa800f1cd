//! Scatter-gather DMA descriptors
//!
//! In descriptor DMA mode the core walks a list of two-word descriptors. The
//! buffer status field (bits 31:30) is the handoff between software and the
//! DMA engine: software only writes a descriptor it sees as `HostBusy` or
//! `DmaDone`, and publishes it by switching to `HostReady` last.

use crate::error::{Result, UsbError};
use core::ptr::{read_volatile, write_volatile};

/// Buffer status (BS) field of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BufferStatus {
    /// Software handed the descriptor to the core
    HostReady = 0,
    /// The DMA engine is processing it
    DmaBusy = 1,
    /// The DMA engine finished it
    DmaDone = 2,
    /// Software owns it and is editing it
    HostBusy = 3,
}

impl BufferStatus {
    const SHIFT: u32 = 30;
    const MASK: u32 = 0x3 << Self::SHIFT;

    const fn from_word(word: u32) -> Self {
        match (word & Self::MASK) >> Self::SHIFT {
            0 => Self::HostReady,
            1 => Self::DmaBusy,
            2 => Self::DmaDone,
            _ => Self::HostBusy,
        }
    }

    const fn to_word(self) -> u32 {
        (self as u32) << Self::SHIFT
    }
}

const IOC: u32 = 1 << 25;
const SP: u32 = 1 << 26;
const L: u32 = 1 << 27;
const STS_SHIFT: u32 = 28;
const STS_MASK: u32 = 0x3 << STS_SHIFT;

/// Quadlet 0 of a bulk/interrupt/control device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NonIsoStatus(pub u32);

impl NonIsoStatus {
    /// Multiple transfer (OUT)
    pub const MTRF: u32 = 1 << 23;
    /// SETUP packet received (OUT)
    pub const SR: u32 = 1 << 24;

    /// Byte count: bytes to send, or buffer bytes left after reception
    pub const fn bytes(&self) -> u32 {
        self.0 & 0xFFFF
    }

    /// Rx/Tx status, 0 on success
    pub const fn sts(&self) -> u32 {
        (self.0 & STS_MASK) >> STS_SHIFT
    }

    /// Last descriptor of the chain
    pub const fn is_last(&self) -> bool {
        self.0 & L != 0
    }

    /// Buffer status
    pub const fn buffer_status(&self) -> BufferStatus {
        BufferStatus::from_word(self.0)
    }

    /// Build a status word
    pub const fn new(bytes: u32, last: bool, ioc: bool, short: bool, bs: BufferStatus) -> Self {
        let mut word = (bytes & 0xFFFF) | bs.to_word();
        if last {
            word |= L;
        }
        if ioc {
            word |= IOC;
        }
        if short {
            word |= SP;
        }
        Self(word)
    }
}

/// Quadlet 0 of an isochronous IN descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IsoInStatus(pub u32);

impl IsoInStatus {
    /// Build a status word
    pub const fn new(txbytes: u32, framenum: u16, pid: u8, last: bool, ioc: bool, short: bool) -> Self {
        let mut word = (txbytes & 0xFFF)
            | ((framenum as u32 & 0x7FF) << 12)
            | ((pid as u32 & 0x3) << 23)
            | BufferStatus::HostReady.to_word();
        if last {
            word |= L;
        }
        if ioc {
            word |= IOC;
        }
        if short {
            word |= SP;
        }
        Self(word)
    }

    /// Bytes left unsent
    pub const fn txbytes(&self) -> u32 {
        self.0 & 0xFFF
    }

    /// Frame the packet is scheduled for
    pub const fn framenum(&self) -> u16 {
        ((self.0 >> 12) & 0x7FF) as u16
    }

    /// Packets per frame
    pub const fn pid(&self) -> u8 {
        ((self.0 >> 23) & 0x3) as u8
    }

    /// Tx status, 0 on success
    pub const fn sts(&self) -> u32 {
        (self.0 & STS_MASK) >> STS_SHIFT
    }

    /// Buffer status
    pub const fn buffer_status(&self) -> BufferStatus {
        BufferStatus::from_word(self.0)
    }
}

/// Quadlet 0 of an isochronous OUT descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IsoOutStatus(pub u32);

impl IsoOutStatus {
    /// Build a status word
    pub const fn new(rxbytes: u32, last: bool, ioc: bool) -> Self {
        let mut word = (rxbytes & 0x7FF) | BufferStatus::HostReady.to_word();
        if last {
            word |= L;
        }
        if ioc {
            word |= IOC;
        }
        Self(word)
    }

    /// Buffer bytes left after reception
    pub const fn rxbytes(&self) -> u32 {
        self.0 & 0x7FF
    }

    /// Rx status, 0 on success
    pub const fn sts(&self) -> u32 {
        (self.0 & STS_MASK) >> STS_SHIFT
    }

    /// Buffer status
    pub const fn buffer_status(&self) -> BufferStatus {
        BufferStatus::from_word(self.0)
    }
}

/// Quadlet 0 of a host channel descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostStatus(pub u32);

impl HostStatus {
    const ACTIVE: u32 = 1 << 31;
    const EOL: u32 = 1 << 26;

    /// Build a status word for `n_bytes`
    pub const fn new(n_bytes: u32, ioc: bool, eol: bool) -> Self {
        let mut word = (n_bytes & 0x1_FFFF) | Self::ACTIVE;
        if ioc {
            word |= IOC;
        }
        if eol {
            word |= Self::EOL;
        }
        Self(word)
    }

    /// Bytes not transferred
    pub const fn n_bytes(&self) -> u32 {
        self.0 & 0x1_FFFF
    }

    /// Core still owns the descriptor
    pub const fn is_active(&self) -> bool {
        self.0 & Self::ACTIVE != 0
    }

    /// Completion status, 0 on success
    pub const fn sts(&self) -> u32 {
        (self.0 & STS_MASK) >> STS_SHIFT
    }
}

/// One hardware descriptor: status quadlet then buffer address
#[repr(C, align(8))]
#[derive(Debug)]
pub struct DmaDescriptor {
    status: u32,
    buf: u32,
}

impl DmaDescriptor {
    /// Descriptor owned by software
    pub const fn new() -> Self {
        Self {
            status: BufferStatus::HostBusy.to_word(),
            buf: 0,
        }
    }

    /// Volatile read of the status quadlet
    pub fn status(&self) -> u32 {
        // Safety: reference guarantees a valid aligned location
        unsafe { read_volatile(&self.status) }
    }

    /// Buffer address
    pub fn buf(&self) -> u32 {
        // Safety: reference guarantees a valid aligned location
        unsafe { read_volatile(&self.buf) }
    }

    /// Ownership field of the status quadlet
    pub fn buffer_status(&self) -> BufferStatus {
        BufferStatus::from_word(self.status())
    }

    /// Publish a descriptor: address first, status last
    pub fn publish(&mut self, buf: u32, status: u32) {
        // Safety: reference guarantees a valid aligned location
        unsafe {
            write_volatile(&mut self.status, (status & !BufferStatus::MASK) | BufferStatus::HostBusy.to_word());
            write_volatile(&mut self.buf, buf);
        }
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        cortex_m::asm::dmb();
        // Safety: as above
        unsafe { write_volatile(&mut self.status, status) };
    }

    /// Return the descriptor to software ownership
    pub fn reclaim(&mut self) {
        // Safety: reference guarantees a valid aligned location
        unsafe { write_volatile(&mut self.status, BufferStatus::HostBusy.to_word()) };
    }

    /// Bus address of this descriptor
    pub fn dma_addr(&self) -> u32 {
        self as *const Self as usize as u32
    }
}

impl Default for DmaDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a finished descriptor chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChainResult {
    /// Bytes the chain did not transfer
    pub residual: u32,
    /// Some descriptor reported a non-zero status
    pub error: bool,
    /// The chain ended early on a short packet
    pub short: bool,
}

/// Descriptor list owned by one endpoint or channel
///
/// A chain is rebuilt for every transfer. At most one build is armed at a
/// time, matching the one-active-transfer rule for the owner.
#[derive(Debug)]
pub struct DescriptorChain {
    descs: &'static mut [DmaDescriptor],
    count: usize,
    armed: bool,
}

impl DescriptorChain {
    /// Wrap a descriptor array
    pub fn new(descs: &'static mut [DmaDescriptor]) -> Result<Self> {
        if descs.is_empty() {
            return Err(UsbError::InvalidParameter);
        }
        for d in descs.iter_mut() {
            d.reclaim();
        }
        Ok(Self {
            descs,
            count: 0,
            armed: false,
        })
    }

    /// Number of descriptors available
    pub fn capacity(&self) -> usize {
        self.descs.len()
    }

    /// Descriptors used by the current build
    pub fn len(&self) -> usize {
        self.count
    }

    /// True when nothing has been built
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// A build is handed to the core
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Bus address of the first descriptor
    pub fn dma_addr(&self) -> u32 {
        self.descs[0].dma_addr()
    }

    /// Read access for status inspection
    pub fn descriptors(&self) -> &[DmaDescriptor] {
        &self.descs[..self.count]
    }

    /// Mutable access for callers that lay out their own chains
    pub(crate) fn raw(&mut self) -> &mut [DmaDescriptor] {
        self.descs
    }

    /// Largest per-descriptor byte count that keeps packets whole
    pub const fn max_per_desc(mps: u16) -> u32 {
        let mps = if mps == 0 { 1 } else { mps as u32 };
        0xFFFF - 0xFFFF % mps
    }

    /// Bytes one full build can cover
    pub fn max_bytes(&self, mps: u16) -> u32 {
        Self::max_per_desc(mps).saturating_mul(self.descs.len() as u32)
    }

    fn claim(&mut self) -> Result<()> {
        if self.armed || self.descs.iter().any(|d| d.buffer_status() == BufferStatus::DmaBusy) {
            return Err(UsbError::TransferActive);
        }
        Ok(())
    }

    /// Build an IN chain for `len` bytes at `addr`
    ///
    /// Returns the number of bytes covered, which is less than `len` when the
    /// chain is too short. The short packet flag marks a final chunk that is
    /// not a whole number of packets.
    pub fn build_in(&mut self, addr: u32, len: u32, mps: u16) -> Result<u32> {
        self.claim()?;
        let per = Self::max_per_desc(mps);
        let covered = len.min(self.max_bytes(mps));
        let count = if covered == 0 {
            1
        } else {
            covered.div_ceil(per) as usize
        };

        let mps32 = mps.max(1) as u32;
        let mut offset = 0;
        for i in 0..count {
            let bytes = (covered - offset).min(per);
            let last = i + 1 == count;
            let short = last && bytes % mps32 != 0;
            let status = NonIsoStatus::new(bytes, last, last, short, BufferStatus::HostReady);
            self.descs[i].publish(addr.wrapping_add(offset), status.0);
            offset += bytes;
        }
        self.count = count;
        self.armed = true;
        Ok(covered)
    }

    /// Build an OUT chain for `len` bytes at `addr`
    ///
    /// Each descriptor's byte count is rounded up to whole packets, so the
    /// buffer must have room for the rounded length.
    pub fn build_out(&mut self, addr: u32, len: u32, mps: u16) -> Result<u32> {
        self.claim()?;
        let per = Self::max_per_desc(mps);
        let covered = len.min(self.max_bytes(mps));
        let count = if covered == 0 {
            1
        } else {
            covered.div_ceil(per) as usize
        };

        let mps32 = mps.max(1) as u32;
        let mut offset = 0;
        for i in 0..count {
            let bytes = (covered - offset).min(per);
            let rounded = if bytes == 0 { mps32 } else { bytes.div_ceil(mps32) * mps32 };
            let last = i + 1 == count;
            let status = NonIsoStatus::new(rounded, last, last, false, BufferStatus::HostReady);
            self.descs[i].publish(addr.wrapping_add(offset), status.0);
            offset += bytes;
        }
        self.count = count;
        self.armed = true;
        Ok(covered)
    }

    /// Build a host channel chain
    pub fn build_host(&mut self, addr: u32, len: u32, mps: u16) -> Result<u32> {
        self.claim()?;
        let per = Self::max_per_desc(mps);
        let covered = len.min(self.max_bytes(mps));
        let count = if covered == 0 {
            1
        } else {
            covered.div_ceil(per) as usize
        };

        let mut offset = 0;
        for i in 0..count {
            let bytes = (covered - offset).min(per);
            let last = i + 1 == count;
            let status = HostStatus::new(bytes, last, last);
            self.descs[i].publish(addr.wrapping_add(offset), status.0);
            offset += bytes;
        }
        self.count = count;
        self.armed = true;
        Ok(covered)
    }

    /// Mark an externally laid out build as armed
    pub(crate) fn arm(&mut self, count: usize) -> Result<()> {
        self.claim()?;
        if count == 0 || count > self.descs.len() {
            return Err(UsbError::InvalidParameter);
        }
        self.count = count;
        self.armed = true;
        Ok(())
    }

    /// Collect the result of a device chain and return it to software
    ///
    /// Descriptors the core never reached still count their bytes as residual.
    pub fn complete(&mut self) -> ChainResult {
        let mut result = ChainResult {
            residual: 0,
            error: false,
            short: false,
        };
        for d in self.descs[..self.count].iter_mut() {
            let status = NonIsoStatus(d.status());
            result.residual += status.bytes();
            if status.sts() != 0 {
                result.error = true;
            }
            if status.buffer_status() == BufferStatus::DmaDone && status.bytes() != 0 && !status.is_last() {
                result.short = true;
            }
            d.reclaim();
        }
        self.armed = false;
        result
    }

    /// Collect the result of a host chain and return it to software
    pub fn complete_host(&mut self) -> ChainResult {
        let mut result = ChainResult {
            residual: 0,
            error: false,
            short: false,
        };
        for d in self.descs[..self.count].iter_mut() {
            let status = HostStatus(d.status());
            result.residual += status.n_bytes();
            if status.sts() != 0 {
                result.error = true;
            }
            d.reclaim();
        }
        self.armed = false;
        result
    }

    /// Drop an armed build without reading it, after the owner was disabled
    pub fn abandon(&mut self) {
        for d in self.descs[..self.count].iter_mut() {
            d.reclaim();
        }
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec::Vec;

    fn chain(n: usize) -> DescriptorChain {
        let descs: Vec<DmaDescriptor> = (0..n).map(|_| DmaDescriptor::new()).collect();
        DescriptorChain::new(Box::leak(descs.into_boxed_slice())).unwrap()
    }

    #[test]
    fn test_in_chain_marks_last_and_short() {
        let mut c = chain(4);
        let covered = c.build_in(0x2000_0000, 1000, 512).unwrap();
        assert_eq!(covered, 1000);
        assert_eq!(c.len(), 1);
        let s = NonIsoStatus(c.descriptors()[0].status());
        assert_eq!(s.bytes(), 1000);
        assert!(s.is_last());
        assert_eq!(s.0 & SP, SP);
        assert_eq!(s.buffer_status(), BufferStatus::HostReady);
    }

    #[test]
    fn test_long_transfer_spans_descriptors() {
        let mut c = chain(4);
        let per = DescriptorChain::max_per_desc(512);
        assert_eq!(per, 65_024);
        let covered = c.build_in(0x1000, per * 2 + 512, 512).unwrap();
        assert_eq!(covered, per * 2 + 512);
        assert_eq!(c.len(), 3);
        let first = NonIsoStatus(c.descriptors()[0].status());
        assert!(!first.is_last());
        assert_eq!(first.0 & IOC, 0);
        let last = NonIsoStatus(c.descriptors()[2].status());
        assert_eq!(last.bytes(), 512);
        assert_eq!(last.0 & SP, 0);
        assert_eq!(c.descriptors()[1].buf(), 0x1000 + per);
    }

    #[test]
    fn test_out_chain_rounds_to_packets() {
        let mut c = chain(2);
        c.build_out(0x4000, 100, 64).unwrap();
        assert_eq!(NonIsoStatus(c.descriptors()[0].status()).bytes(), 128);
    }

    #[test]
    fn test_armed_chain_refuses_rebuild() {
        let mut c = chain(2);
        c.build_in(0, 10, 64).unwrap();
        assert_eq!(c.build_in(0, 10, 64), Err(UsbError::TransferActive));
        let res = c.complete();
        assert!(!c.is_armed());
        assert_eq!(res.residual, 10);
        assert!(c.build_in(0, 10, 64).is_ok());
    }

    #[test]
    fn test_busy_descriptor_is_not_touched() {
        let mut c = chain(2);
        c.raw()[1].publish(0, BufferStatus::DmaBusy.to_word());
        assert_eq!(c.build_out(0, 64, 64), Err(UsbError::TransferActive));
    }

    #[test]
    fn test_zero_length_in_uses_one_descriptor() {
        let mut c = chain(2);
        assert_eq!(c.build_in(0x10, 0, 64).unwrap(), 0);
        assert_eq!(c.len(), 1);
        assert!(NonIsoStatus(c.descriptors()[0].status()).is_last());
    }

    #[test]
    fn test_iso_status_fields() {
        let s = IsoInStatus::new(188, 0x7FE, 1, false, true, true);
        assert_eq!(s.txbytes(), 188);
        assert_eq!(s.framenum(), 0x7FE);
        assert_eq!(s.pid(), 1);
        let o = IsoOutStatus::new(192, true, true);
        assert_eq!(o.rxbytes(), 192);
        assert_eq!(o.buffer_status(), BufferStatus::HostReady);
    }
}
