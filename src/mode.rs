//! Data movement engines
//!
//! The core moves data in one of three ways, fixed at init: the CPU pushes and
//! pops packets through the FIFOs (slave), the core's DMA master follows one
//! buffer address (buffer DMA), or it walks a descriptor list (descriptor DMA).
//! Everything that differs between the three lives behind [`TransferMode`];
//! endpoint and channel logic is written once against it.

use crate::dma::DescriptorChain;
use crate::dwc::{offsets, DepCtl, DepTsiz, DmaMode, Dsts, GintSts, HcChar, HcInt, HcTsiz, RegisterAccess};
use crate::error::{Result, UsbError};
use crate::transfer::{packet_count, Chunk, Direction, TransferLimits, TransferType};

/// Runtime facts every engine needs, captured at init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EngineConfig {
    /// Selected data movement mode
    pub mode: DmaMode,
    /// Transfer size register ceilings
    pub limits: TransferLimits,
    /// One Tx FIFO per IN endpoint
    pub dedicated_fifos: bool,
    /// Periodic transfer interrupt enhancement
    pub pti: bool,
}

impl EngineConfig {
    /// Engine implementing the configured mode
    pub fn engine(&self) -> &'static dyn TransferMode {
        self.mode.engine()
    }
}

impl DmaMode {
    /// Engine implementing this mode
    pub fn engine(self) -> &'static dyn TransferMode {
        match self {
            DmaMode::Slave => &SlaveMode,
            DmaMode::BufferDma => &BufferDmaMode,
            DmaMode::DescriptorDma => &DescriptorDmaMode,
        }
    }
}

/// One device endpoint transfer to program
pub struct EndpointJob<'a> {
    /// Endpoint number
    pub num: usize,
    /// Direction
    pub dir: Direction,
    /// Transfer type
    pub ep_type: TransferType,
    /// Max packet size
    pub mps: u16,
    /// Bytes to program; the engine may cover fewer
    pub length: u32,
    /// Bus address of the first byte
    pub dma_addr: u32,
    /// Descriptor list, required in descriptor DMA mode
    pub chain: Option<&'a mut DescriptorChain>,
}

/// What an engine actually programmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Armed {
    /// Bytes covered by this programming
    pub size: u32,
    /// Packets covered by this programming
    pub packets: u32,
}

/// One host channel transfer to program
pub struct ChannelJob<'a> {
    /// Channel number
    pub ch: usize,
    /// Static characteristics, CHEN/CHDIS/ODDFRM already resolved
    pub hcchar: HcChar,
    /// Bytes to program
    pub size: u32,
    /// Packets to program
    pub packets: u32,
    /// Starting data PID
    pub pid: u32,
    /// Max packet size
    pub mps: u16,
    /// Bus address of the first byte
    pub dma_addr: u32,
    /// Issue a PING before the data
    pub do_ping: bool,
    /// First packet of an OUT transfer, pushed by the CPU in slave mode
    pub first_packet: Option<&'a [u8]>,
    /// Descriptor list, required in descriptor DMA mode
    pub chain: Option<&'a mut DescriptorChain>,
}

/// Channel facts that select the interrupt mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelSetup {
    /// Transfer type
    pub ep_type: TransferType,
    /// IN channel
    pub is_in: bool,
    /// `Some(complete)` for a split transaction
    pub split: Option<bool>,
    /// A transaction error occurred on the previous attempt
    pub error_state: bool,
    /// PING protocol active
    pub do_ping: bool,
}

/// Mode-specific part of the transfer engine
pub trait TransferMode: Sync {
    /// Mode this engine implements
    fn kind(&self) -> DmaMode;

    /// Program and enable an endpoint transfer
    fn arm_endpoint(&self, regs: &dyn RegisterAccess, cfg: &EngineConfig, job: EndpointJob<'_>) -> Result<Armed>;

    /// Bytes of the last programming the core did not move
    fn endpoint_residual(
        &self,
        regs: &dyn RegisterAccess,
        num: usize,
        dir: Direction,
        chain: Option<&mut DescriptorChain>,
    ) -> u32;

    /// Program and enable a host channel
    fn arm_channel(&self, regs: &dyn RegisterAccess, job: ChannelJob<'_>) -> Result<()>;

    /// Channel interrupts to unmask for `setup`
    fn channel_interrupts(&self, setup: &ChannelSetup) -> HcInt;

    /// A halt must wait for request queue space before disabling
    fn halt_needs_queue_space(&self) -> bool {
        false
    }

    /// A halt writes CHEN along with CHDIS
    fn halt_sets_enable(&self) -> bool {
        true
    }

    /// The CPU moves packet data itself
    fn cpu_moves_data(&self) -> bool {
        false
    }
}

/// Slave mode: CPU-driven FIFO access
#[derive(Debug, Clone, Copy)]
pub struct SlaveMode;

/// Buffer DMA mode: one address per programming
#[derive(Debug, Clone, Copy)]
pub struct BufferDmaMode;

/// Descriptor DMA mode: scatter/gather lists
#[derive(Debug, Clone, Copy)]
pub struct DescriptorDmaMode;

fn ctl_offset(num: usize, dir: Direction) -> usize {
    match dir {
        Direction::In => offsets::diepctl(num),
        Direction::Out => offsets::doepctl(num),
    }
}

fn tsiz_offset(num: usize, dir: Direction) -> usize {
    match dir {
        Direction::In => offsets::dieptsiz(num),
        Direction::Out => offsets::doeptsiz(num),
    }
}

fn dma_offset(num: usize, dir: Direction) -> usize {
    match dir {
        Direction::In => offsets::diepdma(num),
        Direction::Out => offsets::doepdma(num),
    }
}

/// Size and packet count for one endpoint programming in slave or buffer DMA
fn plan_endpoint(cfg: &EngineConfig, job: &EndpointJob<'_>) -> Armed {
    if job.num == 0 {
        // EP0 moves one packet per programming
        let size = job.length.min(job.mps.max(1) as u32);
        return Armed { size, packets: 1 };
    }
    let chunk = Chunk::plan(job.length, job.mps, cfg.limits, None);
    Armed {
        size: chunk.size,
        packets: chunk.packets,
    }
}

fn endpoint_tsiz(job: &EndpointJob<'_>, armed: Armed) -> DepTsiz {
    let mps = job.mps.max(1) as u32;
    match job.dir {
        Direction::In => {
            let tsiz = DepTsiz::new(armed.size, armed.packets);
            if job.ep_type == TransferType::Isochronous {
                tsiz.with_mc(armed.packets.min(3))
            } else {
                tsiz
            }
        }
        // OUT sizes are whole packets so a full-size last packet fits
        Direction::Out => DepTsiz::new(armed.packets * mps, armed.packets),
    }
}

/// Enable bits for an endpoint, with the frame parity for isochronous
pub(crate) fn enable_bits(regs: &dyn RegisterAccess, ep_type: TransferType) -> DepCtl {
    let mut bits = DepCtl::EPENA | DepCtl::CNAK;
    if ep_type == TransferType::Isochronous {
        let dsts = Dsts(regs.read(offsets::DSTS));
        if dsts.soffn() & 1 == 0 {
            bits |= DepCtl::SETD1PID;
        } else {
            bits |= DepCtl::SETD0PID;
        }
    }
    bits
}

fn channel_mask_dma(setup: &ChannelSetup, buffer_dma: bool) -> HcInt {
    let mut mask = HcInt::CHHLTD;
    if buffer_dma {
        mask |= HcInt::AHBERR;
    } else if setup.ep_type == TransferType::Isochronous {
        mask |= HcInt::XFERCOMPL;
    }
    if setup.error_state && setup.split.is_none() && setup.ep_type != TransferType::Isochronous {
        mask |= HcInt::ACK;
        if setup.is_in {
            mask |= HcInt::DATATGLERR;
            if setup.ep_type != TransferType::Interrupt {
                mask |= HcInt::NAK;
            }
        }
    }
    mask
}

impl TransferMode for SlaveMode {
    fn kind(&self) -> DmaMode {
        DmaMode::Slave
    }

    fn arm_endpoint(&self, regs: &dyn RegisterAccess, cfg: &EngineConfig, job: EndpointJob<'_>) -> Result<Armed> {
        let armed = plan_endpoint(cfg, &job);
        regs.write(tsiz_offset(job.num, job.dir), endpoint_tsiz(&job, armed).bits());
        regs.set_bits(ctl_offset(job.num, job.dir), enable_bits(regs, job.ep_type).bits());

        if job.dir == Direction::In && armed.size > 0 {
            if cfg.dedicated_fifos {
                regs.set_bits(offsets::DIEPEMPMSK, 1 << job.num);
            } else if job.ep_type.is_periodic() {
                regs.set_bits(offsets::GINTMSK, GintSts::PTXFEMPTY.bits());
            } else {
                regs.set_bits(offsets::GINTMSK, GintSts::NPTXFEMPTY.bits());
            }
        }
        Ok(armed)
    }

    fn endpoint_residual(
        &self,
        regs: &dyn RegisterAccess,
        num: usize,
        dir: Direction,
        _chain: Option<&mut DescriptorChain>,
    ) -> u32 {
        residual_from_tsiz(regs, num, dir)
    }

    fn arm_channel(&self, regs: &dyn RegisterAccess, job: ChannelJob<'_>) -> Result<()> {
        if job.do_ping {
            regs.write(offsets::hctsiz(job.ch), (HcTsiz::new(0, 1, job.pid) | HcTsiz::DOPNG).bits());
            regs.write(offsets::hcchar(job.ch), job.hcchar.bits());
            return Ok(());
        }
        regs.write(offsets::hctsiz(job.ch), HcTsiz::new(job.size, job.packets, job.pid).bits());
        regs.write(offsets::hcchar(job.ch), job.hcchar.bits());
        if !job.hcchar.contains(HcChar::EPDIR) {
            if let Some(packet) = job.first_packet {
                write_fifo(regs, job.ch, packet);
            }
        }
        Ok(())
    }

    fn channel_interrupts(&self, setup: &ChannelSetup) -> HcInt {
        let mut mask = HcInt::CHHLTD;
        match setup.ep_type {
            TransferType::Control | TransferType::Bulk => {
                mask |= HcInt::XFERCOMPL | HcInt::STALL | HcInt::XACTERR | HcInt::DATATGLERR;
                if setup.is_in {
                    mask |= HcInt::BBLERR;
                } else {
                    mask |= HcInt::NAK | HcInt::NYET;
                    if setup.do_ping {
                        mask |= HcInt::ACK;
                    }
                }
                if let Some(complete) = setup.split {
                    mask |= HcInt::NAK;
                    if complete {
                        mask |= HcInt::NYET;
                    } else {
                        mask |= HcInt::ACK;
                    }
                }
                if setup.error_state {
                    mask |= HcInt::ACK;
                }
            }
            TransferType::Interrupt => {
                mask |= HcInt::XFERCOMPL
                    | HcInt::NAK
                    | HcInt::STALL
                    | HcInt::XACTERR
                    | HcInt::DATATGLERR
                    | HcInt::FRMOVRUN;
                if setup.is_in {
                    mask |= HcInt::BBLERR;
                }
                if setup.error_state {
                    mask |= HcInt::ACK;
                }
                if let Some(complete) = setup.split {
                    if complete {
                        mask |= HcInt::NYET;
                    } else {
                        mask |= HcInt::ACK;
                    }
                }
            }
            TransferType::Isochronous => {
                mask |= HcInt::XFERCOMPL | HcInt::FRMOVRUN | HcInt::ACK;
                if setup.is_in {
                    mask |= HcInt::XACTERR | HcInt::BBLERR;
                }
            }
        }
        mask
    }

    fn halt_needs_queue_space(&self) -> bool {
        true
    }

    fn cpu_moves_data(&self) -> bool {
        true
    }
}

impl TransferMode for BufferDmaMode {
    fn kind(&self) -> DmaMode {
        DmaMode::BufferDma
    }

    fn arm_endpoint(&self, regs: &dyn RegisterAccess, cfg: &EngineConfig, job: EndpointJob<'_>) -> Result<Armed> {
        let armed = plan_endpoint(cfg, &job);
        regs.write(tsiz_offset(job.num, job.dir), endpoint_tsiz(&job, armed).bits());
        regs.write(dma_offset(job.num, job.dir), job.dma_addr);
        regs.set_bits(ctl_offset(job.num, job.dir), enable_bits(regs, job.ep_type).bits());
        Ok(armed)
    }

    fn endpoint_residual(
        &self,
        regs: &dyn RegisterAccess,
        num: usize,
        dir: Direction,
        _chain: Option<&mut DescriptorChain>,
    ) -> u32 {
        residual_from_tsiz(regs, num, dir)
    }

    fn arm_channel(&self, regs: &dyn RegisterAccess, job: ChannelJob<'_>) -> Result<()> {
        let mut tsiz = HcTsiz::new(job.size, job.packets, job.pid);
        if job.do_ping {
            tsiz |= HcTsiz::DOPNG;
        }
        regs.write(offsets::hctsiz(job.ch), tsiz.bits());
        regs.write(offsets::hcdma(job.ch), job.dma_addr);
        regs.write(offsets::hcchar(job.ch), job.hcchar.bits());
        Ok(())
    }

    fn channel_interrupts(&self, setup: &ChannelSetup) -> HcInt {
        channel_mask_dma(setup, true)
    }
}

impl TransferMode for DescriptorDmaMode {
    fn kind(&self) -> DmaMode {
        DmaMode::DescriptorDma
    }

    fn arm_endpoint(&self, regs: &dyn RegisterAccess, _cfg: &EngineConfig, job: EndpointJob<'_>) -> Result<Armed> {
        let chain = job.chain.ok_or(UsbError::NoResources)?;
        let length = if job.num == 0 {
            job.length.min(job.mps as u32)
        } else {
            job.length
        };
        let size = match job.dir {
            Direction::In => chain.build_in(job.dma_addr, length, job.mps)?,
            Direction::Out => chain.build_out(job.dma_addr, length, job.mps)?,
        };
        regs.write(dma_offset(job.num, job.dir), chain.dma_addr());
        regs.set_bits(ctl_offset(job.num, job.dir), enable_bits(regs, job.ep_type).bits());
        Ok(Armed {
            size,
            packets: packet_count(size, job.mps),
        })
    }

    fn endpoint_residual(
        &self,
        _regs: &dyn RegisterAccess,
        _num: usize,
        _dir: Direction,
        chain: Option<&mut DescriptorChain>,
    ) -> u32 {
        chain.map(|c| c.complete().residual).unwrap_or(0)
    }

    fn arm_channel(&self, regs: &dyn RegisterAccess, job: ChannelJob<'_>) -> Result<()> {
        let chain = job.chain.ok_or(UsbError::NoResources)?;
        chain.build_host(job.dma_addr, job.size, job.mps)?;
        let ntd = chain.len() as u32;
        regs.write(offsets::hctsiz(job.ch), HcTsiz::new_ddma(0xFF, ntd, job.pid).bits());
        regs.write(offsets::hcdma(job.ch), chain.dma_addr());
        regs.write(offsets::hcchar(job.ch), job.hcchar.bits());
        Ok(())
    }

    fn channel_interrupts(&self, setup: &ChannelSetup) -> HcInt {
        channel_mask_dma(setup, false)
    }

    fn halt_sets_enable(&self) -> bool {
        false
    }
}

fn residual_from_tsiz(regs: &dyn RegisterAccess, num: usize, dir: Direction) -> u32 {
    let tsiz = DepTsiz::from_bits_retain(regs.read(tsiz_offset(num, dir)));
    if num == 0 {
        tsiz.ep0_xfersize()
    } else {
        tsiz.xfersize()
    }
}

/// Push `data` into Tx FIFO `fifo`, padding the last word with zeros
pub fn write_fifo(regs: &dyn RegisterAccess, fifo: usize, data: &[u8]) {
    let window = offsets::fifo(fifo);
    for word in data.chunks(4) {
        let mut bytes = [0u8; 4];
        bytes[..word.len()].copy_from_slice(word);
        regs.write(window, u32::from_le_bytes(bytes));
    }
}

/// Pop `count` bytes from the Rx FIFO into `data`
///
/// Whole words are always popped; bytes beyond `data` are discarded.
pub fn read_fifo(regs: &dyn RegisterAccess, data: &mut [u8], count: usize) {
    let window = offsets::fifo(0);
    let words = count.div_ceil(4);
    for i in 0..words {
        let bytes = regs.read(window).to_le_bytes();
        let start = i * 4;
        for (j, byte) in bytes.iter().enumerate() {
            let at = start + j;
            if at < count && at < data.len() {
                data[at] = *byte;
            }
        }
    }
}

/// Words needed to hold `len` bytes
pub const fn words(len: u32) -> u32 {
    len.div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwc::register::mock::MockRegisters;
    use crate::dma::DmaDescriptor;
    use std::boxed::Box;
    use std::vec::Vec;

    fn cfg(mode: DmaMode) -> EngineConfig {
        EngineConfig {
            mode,
            limits: TransferLimits {
                max_transfer_size: 65_535,
                max_packet_count: 511,
            },
            dedicated_fifos: true,
            pti: false,
        }
    }

    fn job<'a>(num: usize, dir: Direction, length: u32) -> EndpointJob<'a> {
        EndpointJob {
            num,
            dir,
            ep_type: TransferType::Bulk,
            mps: 512,
            length,
            dma_addr: 0x2000_0000,
            chain: None,
        }
    }

    #[test]
    fn test_buffer_dma_programs_whole_transfer() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::BufferDma);
        let armed = c.engine().arm_endpoint(&regs, &c, job(1, Direction::Out, 1536)).unwrap();
        assert_eq!(armed, Armed { size: 1536, packets: 3 });
        let tsiz = DepTsiz::from_bits_retain(regs.get(offsets::doeptsiz(1)));
        assert_eq!(tsiz.pktcnt(), 3);
        assert_eq!(tsiz.xfersize(), 1536);
        assert_eq!(regs.get(offsets::doepdma(1)), 0x2000_0000);
        let ctl = DepCtl::from_bits_retain(regs.get(offsets::doepctl(1)));
        assert!(ctl.contains(DepCtl::EPENA | DepCtl::CNAK));
    }

    #[test]
    fn test_out_size_rounded_to_packets() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::BufferDma);
        c.engine().arm_endpoint(&regs, &c, job(2, Direction::Out, 100)).unwrap();
        let tsiz = DepTsiz::from_bits_retain(regs.get(offsets::doeptsiz(2)));
        assert_eq!(tsiz.xfersize(), 512);
        assert_eq!(tsiz.pktcnt(), 1);
    }

    #[test]
    fn test_slave_in_enables_fifo_empty_interrupt() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::Slave);
        c.engine().arm_endpoint(&regs, &c, job(3, Direction::In, 64)).unwrap();
        assert_eq!(regs.get(offsets::DIEPEMPMSK), 1 << 3);
        assert_eq!(regs.get(offsets::diepdma(3)), 0);

        let shared = EngineConfig {
            dedicated_fifos: false,
            ..c
        };
        let regs = MockRegisters::new();
        shared.engine().arm_endpoint(&regs, &shared, job(1, Direction::In, 64)).unwrap();
        assert_ne!(regs.get(offsets::GINTMSK) & GintSts::NPTXFEMPTY.bits(), 0);
    }

    #[test]
    fn test_ep0_moves_single_packet() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::BufferDma);
        let mut j = job(0, Direction::In, 100);
        j.mps = 64;
        let armed = c.engine().arm_endpoint(&regs, &c, j).unwrap();
        assert_eq!(armed.size, 64);
        assert_eq!(armed.packets, 1);
    }

    #[test]
    fn test_descriptor_mode_requires_chain() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::DescriptorDma);
        let err = c.engine().arm_endpoint(&regs, &c, job(1, Direction::In, 64));
        assert_eq!(err, Err(UsbError::NoResources));

        let descs: Vec<DmaDescriptor> = (0..2).map(|_| DmaDescriptor::new()).collect();
        let mut chain = DescriptorChain::new(Box::leak(descs.into_boxed_slice())).unwrap();
        let mut j = job(1, Direction::In, 700);
        j.chain = Some(&mut chain);
        let armed = c.engine().arm_endpoint(&regs, &c, j).unwrap();
        assert_eq!(armed.size, 700);
        assert_eq!(regs.get(offsets::diepdma(1)), chain.dma_addr());
        assert!(chain.is_armed());
    }

    #[test]
    fn test_slave_split_masks() {
        let setup = ChannelSetup {
            ep_type: TransferType::Bulk,
            is_in: true,
            split: Some(false),
            error_state: false,
            do_ping: false,
        };
        let mask = SlaveMode.channel_interrupts(&setup);
        assert!(mask.contains(HcInt::NAK | HcInt::ACK | HcInt::BBLERR));
        assert!(!mask.contains(HcInt::NYET));

        let csplit = ChannelSetup {
            split: Some(true),
            ep_type: TransferType::Interrupt,
            ..setup
        };
        let mask = SlaveMode.channel_interrupts(&csplit);
        assert!(mask.contains(HcInt::NYET | HcInt::FRMOVRUN));
        assert!(!mask.contains(HcInt::ACK));
    }

    #[test]
    fn test_dma_error_state_masks() {
        let setup = ChannelSetup {
            ep_type: TransferType::Bulk,
            is_in: true,
            split: None,
            error_state: true,
            do_ping: false,
        };
        let mask = BufferDmaMode.channel_interrupts(&setup);
        assert_eq!(mask, HcInt::CHHLTD | HcInt::AHBERR | HcInt::ACK | HcInt::DATATGLERR | HcInt::NAK);
        let iso = ChannelSetup {
            ep_type: TransferType::Isochronous,
            error_state: false,
            ..setup
        };
        assert_eq!(DescriptorDmaMode.channel_interrupts(&iso), HcInt::CHHLTD | HcInt::XFERCOMPL);
    }

    #[test]
    fn test_fifo_padding() {
        let regs = MockRegisters::new();
        write_fifo(&regs, 1, &[1, 2, 3, 4, 5]);
        assert_eq!(regs.writes_to(offsets::fifo(1)), [0x0403_0201, 0x0000_0005]);

        regs.push_read(offsets::fifo(0), 0x4433_2211);
        regs.push_read(offsets::fifo(0), 0x8877_6655);
        let mut buf = [0u8; 5];
        read_fifo(&regs, &mut buf, 6);
        assert_eq!(buf, [0x11, 0x22, 0x33, 0x44, 0x55]);
    }
}
