//! Isochronous double-buffer streams
//!
//! A stream alternates between two caller buffers. While the core fills or
//! drains one, the other belongs to the application; `proc_buf_num` names
//! the buffer the core is working on. Every finished buffer is reported
//! through [`UsbHandler::iso_buffer_ready`] with per-packet results.
//!
//! Three schedulers cover the data movement modes:
//! - descriptor DMA: both buffers are laid out as one descriptor ring and
//!   each half is rebuilt as soon as the core moves on to the other half
//! - buffer DMA with periodic transfer interrupts: one programming per buffer
//! - everything else: one programming per (micro)frame

use crate::device::endpoint::{Endpoint, Progress};
use crate::dma::{DescriptorChain, DmaBuffer, IsoInStatus, IsoOutStatus};
use crate::dwc::{offsets, DepCtl, DepTsiz, DmaMode, Dsts, RegisterAccess};
use crate::error::{Result, UsbError};
use crate::handler::UsbHandler;
use crate::mode::{enable_bits, EngineConfig};
use crate::transfer::{Direction, TransferType};

/// Packet records kept per buffer
pub const MAX_ISO_PACKETS: usize = 64;

const FRAME_MASK: u32 = 0x3FFF;
const DESC_FRAME_MASK: u32 = 0x7FF;

/// Result of one packet (or frame) of a finished buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IsoPacketInfo {
    /// Byte offset inside the buffer
    pub offset: u32,
    /// Bytes moved
    pub length: u32,
    /// Packet was dropped or reported an error
    pub error: bool,
}

/// How a stream is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IsoScheduler {
    /// Descriptor ring over both buffers
    Descriptor,
    /// One buffer DMA programming per buffer (periodic transfer interrupt)
    Buffer,
    /// One programming per frame
    Frame,
}

impl IsoScheduler {
    /// Scheduler for the configured engine
    pub fn select(cfg: &EngineConfig) -> Self {
        match cfg.mode {
            DmaMode::DescriptorDma => Self::Descriptor,
            DmaMode::BufferDma if cfg.pti => Self::Buffer,
            _ => Self::Frame,
        }
    }
}

/// Validated geometry of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IsoLayout {
    scheduler: IsoScheduler,
    dir: Direction,
    mps: u16,
    /// Frames between packets (bInterval decoded)
    pub interval: u32,
    /// Frames covered by one buffer
    pub frames: u32,
    /// Packets per frame
    pub pkt_per_frame: u32,
    /// Bytes per frame
    pub data_per_frame: u32,
    pkt_size: u32,
    /// Records per buffer
    pub entries: usize,
}

impl IsoLayout {
    /// Check a stream request against the endpoint and the engine
    ///
    /// `buf_proc_intrvl` is the number of frames one buffer covers and must be
    /// a multiple of the endpoint's interval.
    pub fn plan(
        ep: &Endpoint,
        cfg: &EngineConfig,
        data_per_frame: u32,
        buf_proc_intrvl: u32,
        buffer_len: usize,
    ) -> Result<Self> {
        if ep.ep_type() != TransferType::Isochronous || !ep.is_enabled() {
            return Err(UsbError::InvalidState);
        }
        let interval = 1u32 << (ep.interval().clamp(1, 16) - 1);
        if buf_proc_intrvl == 0 || buf_proc_intrvl % interval != 0 {
            return Err(UsbError::InvalidParameter);
        }
        let frames = buf_proc_intrvl / interval;
        let mps = ep.mps();
        let pkt_per_frame = ep.transactions();
        if data_per_frame == 0 || data_per_frame > pkt_per_frame * mps as u32 {
            return Err(UsbError::InvalidParameter);
        }
        let pkt_size = data_per_frame.div_ceil(pkt_per_frame);

        let scheduler = IsoScheduler::select(cfg);
        let dir = ep.direction();
        let entries = match (scheduler, dir) {
            (IsoScheduler::Frame, _) | (IsoScheduler::Descriptor, Direction::In) => frames,
            _ => frames * pkt_per_frame,
        } as usize;
        if entries > MAX_ISO_PACKETS {
            return Err(UsbError::NoResources);
        }
        if scheduler == IsoScheduler::Descriptor {
            let capacity = ep.chain.as_ref().map(|c| c.capacity()).unwrap_or(0);
            if capacity < 2 * entries {
                return Err(UsbError::NoResources);
            }
        }

        let mut needed = frames * data_per_frame;
        if dir == Direction::Out {
            // Room for a full last packet
            needed += mps as u32;
        }
        if buffer_len < needed as usize {
            return Err(UsbError::BufferOverflow);
        }

        Ok(Self {
            scheduler,
            dir,
            mps,
            interval,
            frames,
            pkt_per_frame,
            data_per_frame,
            pkt_size,
            entries,
        })
    }

    /// Scheduler in use
    pub fn scheduler(&self) -> IsoScheduler {
        self.scheduler
    }

    /// Planned offset and length of record `i`
    fn slot(&self, i: usize) -> (u32, u32) {
        let i = i as u32;
        let per_frame_records = match (self.scheduler, self.dir) {
            (IsoScheduler::Frame, _) | (IsoScheduler::Descriptor, Direction::In) => 1,
            _ => self.pkt_per_frame,
        };
        if per_frame_records == 1 {
            return (i * self.data_per_frame, self.data_per_frame);
        }
        let frame = i / per_frame_records;
        let k = i % per_frame_records;
        let offset = frame * self.data_per_frame + k * self.pkt_size;
        let length = if k + 1 == per_frame_records {
            self.data_per_frame.saturating_sub(k * self.pkt_size)
        } else {
            self.pkt_size.min(self.data_per_frame.saturating_sub(k * self.pkt_size))
        };
        (offset, length)
    }

    fn buffer_bytes(&self) -> u32 {
        self.frames * self.data_per_frame
    }
}

/// One running isochronous stream
#[derive(Debug)]
pub struct IsoStream {
    address: u8,
    layout: IsoLayout,
    buffers: [DmaBuffer; 2],
    info: [[IsoPacketInfo; MAX_ISO_PACKETS]; 2],
    proc_buf_num: usize,
    next_frame: u32,
    cur_frame: u32,
    armed: bool,
    chain: Option<DescriptorChain>,
    completed: u32,
}

impl IsoStream {
    /// Stream for `ep` over `buffers`
    ///
    /// In descriptor DMA mode the endpoint's descriptor list moves into the
    /// stream until [`stop`](Self::stop).
    pub fn new(ep: &mut Endpoint, layout: IsoLayout, buffers: [DmaBuffer; 2]) -> Self {
        let chain = if layout.scheduler == IsoScheduler::Descriptor {
            ep.chain.take()
        } else {
            None
        };
        Self {
            address: ep.address(),
            layout,
            buffers,
            info: [[IsoPacketInfo::default(); MAX_ISO_PACKETS]; 2],
            proc_buf_num: 0,
            next_frame: 0,
            cur_frame: 0,
            armed: false,
            chain,
            completed: 0,
        }
    }

    /// Endpoint address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Buffer the core is working on
    pub fn proc_buf_num(&self) -> usize {
        self.proc_buf_num
    }

    /// Buffers finished so far
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Frame number the next programming targets
    pub fn next_frame(&self) -> u32 {
        self.next_frame
    }

    /// Records of buffer `n` from its last completion
    pub fn packets(&self, n: usize) -> &[IsoPacketInfo] {
        &self.info[n & 1][..self.layout.entries]
    }

    fn num(&self) -> usize {
        (self.address & 0x0F) as usize
    }

    fn ctl(&self) -> usize {
        match self.layout.dir {
            Direction::In => offsets::diepctl(self.num()),
            Direction::Out => offsets::doepctl(self.num()),
        }
    }

    /// First frame on or after the next one that falls on an interval boundary
    pub fn first_frame(soffn: u32, interval: u32) -> u32 {
        let next = soffn + 1;
        let interval = interval.max(1);
        (next.div_ceil(interval) * interval) & FRAME_MASK
    }

    /// Start moving data
    pub fn start(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        ep: &mut Endpoint,
        start_frame: Option<u16>,
    ) -> Result<()> {
        let soffn = Dsts(regs.read(offsets::DSTS)).soffn();
        self.next_frame = match start_frame {
            Some(f) => f as u32 & FRAME_MASK,
            None => Self::first_frame(soffn, self.layout.interval),
        };
        self.proc_buf_num = 0;
        self.cur_frame = 0;

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "ISO {:02x} start: {} frames/buffer, interval {}, first frame {}",
            self.address,
            self.layout.frames,
            self.layout.interval,
            self.next_frame
        );

        match self.layout.scheduler {
            IsoScheduler::Descriptor => self.arm_ring(regs),
            IsoScheduler::Buffer => {
                self.program_buffer(regs, 0);
                Ok(())
            }
            IsoScheduler::Frame => {
                if self.layout.interval == 1 {
                    self.program_frame(regs, cfg, ep)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn arm_ring(&mut self, regs: &dyn RegisterAccess) -> Result<()> {
        let entries = self.layout.entries;
        match self.chain.as_mut() {
            Some(chain) => chain.abandon(),
            None => return Err(UsbError::NoResources),
        }
        self.build_half(0);
        self.build_half(1);
        let dma = match self.layout.dir {
            Direction::In => offsets::diepdma(self.num()),
            Direction::Out => offsets::doepdma(self.num()),
        };
        let chain = self.chain.as_mut().ok_or(UsbError::NoResources)?;
        chain.arm(2 * entries)?;
        regs.write(dma, chain.dma_addr());
        regs.set_bits(self.ctl(), (DepCtl::EPENA | DepCtl::CNAK).bits());
        self.armed = true;
        Ok(())
    }

    /// Lay out the descriptors of buffer `half`
    fn build_half(&mut self, half: usize) {
        let layout = self.layout;
        let entries = layout.entries;
        let buffer = &self.buffers[half];
        if layout.dir == Direction::In {
            buffer.sync_for_device();
        }
        let Some(chain) = self.chain.as_mut() else {
            return;
        };
        let descs = chain.raw();
        let mut frame = self.next_frame;
        for i in 0..entries {
            let (offset, length) = layout.slot(i);
            let end_of_half = i + 1 == entries;
            let last = half == 1 && end_of_half;
            let status = match layout.dir {
                Direction::In => {
                    let status = IsoInStatus::new(
                        length,
                        (frame & DESC_FRAME_MASK) as u16,
                        layout.pkt_per_frame as u8,
                        last,
                        end_of_half,
                        false,
                    );
                    frame = (frame + layout.interval) & FRAME_MASK;
                    status.0
                }
                Direction::Out => IsoOutStatus::new(length, last, end_of_half).0,
            };
            if let Some(desc) = descs.get_mut(half * entries + i) {
                desc.publish(buffer.dma_addr_at(offset), status);
            }
        }
        self.next_frame = (self.next_frame + layout.frames * layout.interval) & FRAME_MASK;
    }

    /// Collect the finished half of the ring into the packet records
    fn collect_half(&mut self, half: usize) {
        let layout = self.layout;
        let entries = layout.entries;
        let Some(chain) = self.chain.as_mut() else {
            return;
        };
        let descs = chain.raw();
        for i in 0..entries {
            let (offset, planned) = layout.slot(i);
            let Some(desc) = descs.get_mut(half * entries + i) else {
                break;
            };
            let word = desc.status();
            let (left, sts) = match layout.dir {
                Direction::In => {
                    let s = IsoInStatus(word);
                    (s.txbytes(), s.sts())
                }
                Direction::Out => {
                    let s = IsoOutStatus(word);
                    (s.rxbytes(), s.sts())
                }
            };
            self.info[half][i] = IsoPacketInfo {
                offset,
                length: planned.saturating_sub(left),
                error: sts != 0,
            };
            desc.reclaim();
        }
        if layout.dir == Direction::Out {
            self.buffers[half].sync_for_cpu();
        }
    }

    fn program_buffer(&mut self, regs: &dyn RegisterAccess, half: usize) {
        let layout = self.layout;
        let num = self.num();
        let packets = layout.frames * layout.pkt_per_frame;
        let total = layout.buffer_bytes();
        let buffer = &self.buffers[half];
        match layout.dir {
            Direction::In => {
                buffer.sync_for_device();
                let tsiz = DepTsiz::new(total, packets).with_mc(layout.pkt_per_frame);
                regs.write(offsets::dieptsiz(num), tsiz.bits());
                regs.write(offsets::diepdma(num), buffer.dma_addr());
            }
            Direction::Out => {
                let mps = layout.mps.max(1) as u32;
                let tsiz = DepTsiz::new(total.div_ceil(mps) * mps, packets);
                regs.write(offsets::doeptsiz(num), tsiz.bits());
                regs.write(offsets::doepdma(num), buffer.dma_addr());
            }
        }
        regs.set_bits(self.ctl(), enable_bits(regs, TransferType::Isochronous).bits());
        self.armed = true;
    }

    /// Turn the transfer size left in the register into packet records
    ///
    /// OUT data lands back to back, so only the surviving packet count and
    /// byte count are known; dropped packets are the ones the counter never
    /// reached.
    fn collect_buffer(&mut self, regs: &dyn RegisterAccess, half: usize) {
        let layout = self.layout;
        let num = self.num();
        let packets = layout.frames * layout.pkt_per_frame;
        match layout.dir {
            Direction::In => {
                let tsiz = DepTsiz::from_bits_retain(regs.read(offsets::dieptsiz(num)));
                let sent = packets.saturating_sub(tsiz.pktcnt()) as usize;
                for i in 0..layout.entries {
                    let (offset, length) = layout.slot(i);
                    self.info[half][i] = IsoPacketInfo {
                        offset,
                        length: if i < sent { length } else { 0 },
                        error: i >= sent,
                    };
                }
            }
            Direction::Out => {
                let tsiz = DepTsiz::from_bits_retain(regs.read(offsets::doeptsiz(num)));
                let mps = layout.mps.max(1) as u32;
                let programmed = layout.buffer_bytes().div_ceil(mps) * mps;
                let arrived = packets.saturating_sub(tsiz.pktcnt()) as usize;
                let mut left = programmed.saturating_sub(tsiz.xfersize());
                let mut offset = 0;
                for i in 0..layout.entries {
                    let record = if i < arrived {
                        let (_, planned) = layout.slot(i);
                        let length = if i + 1 == arrived { left } else { planned.min(left) };
                        left -= length;
                        IsoPacketInfo {
                            offset,
                            length,
                            error: false,
                        }
                    } else {
                        IsoPacketInfo {
                            offset,
                            length: 0,
                            error: true,
                        }
                    };
                    offset += record.length;
                    self.info[half][i] = record;
                }
                self.buffers[half].sync_for_cpu();
            }
        }
    }

    fn program_frame(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig, ep: &mut Endpoint) -> Result<()> {
        let layout = self.layout;
        let (offset, length) = layout.slot(self.cur_frame as usize);
        let buffer = &self.buffers[self.proc_buf_num];
        let span = match layout.dir {
            Direction::In => length as usize,
            Direction::Out => ep.out_capacity(length, false).min(buffer.len().saturating_sub(offset as usize)),
        };
        let window = buffer.window(offset as usize, span).ok_or(UsbError::BufferOverflow)?;
        ep.start(regs, cfg, None, window, length, false).map_err(|(e, _)| e)?;
        self.armed = true;
        Ok(())
    }

    /// Flip buffers and report the one that just finished
    fn finish_buffer(&mut self) -> usize {
        let done = self.proc_buf_num;
        self.proc_buf_num ^= 1;
        self.completed = self.completed.wrapping_add(1);
        done
    }

    /// Transfer complete (or BNA in descriptor mode) on the stream's endpoint
    pub(crate) fn on_transfer_complete(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        ep: &mut Endpoint,
        handler: &mut dyn UsbHandler,
    ) -> Result<()> {
        match self.layout.scheduler {
            IsoScheduler::Descriptor => {
                let done = self.proc_buf_num;
                self.collect_half(done);
                self.finish_buffer();
                // The core is on the other half now; refill this one behind it
                self.build_half(done);
                handler.iso_buffer_ready(self.address, done, self.packets(done));
                Ok(())
            }
            IsoScheduler::Buffer => {
                let done = self.proc_buf_num;
                self.collect_buffer(regs, done);
                self.finish_buffer();
                self.program_buffer(regs, self.proc_buf_num);
                handler.iso_buffer_ready(self.address, done, self.packets(done));
                Ok(())
            }
            IsoScheduler::Frame => {
                let finished = match ep.complete_chunk(regs, cfg)? {
                    Progress::Done(f) => f,
                    Progress::Continue => return Ok(()),
                };
                self.armed = false;
                let (offset, _) = self.layout.slot(self.cur_frame as usize);
                self.info[self.proc_buf_num][self.cur_frame as usize] = IsoPacketInfo {
                    offset,
                    length: finished.actual,
                    error: false,
                };
                self.advance_frame(regs, cfg, ep, handler)
            }
        }
    }

    fn advance_frame(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        ep: &mut Endpoint,
        handler: &mut dyn UsbHandler,
    ) -> Result<()> {
        self.next_frame = (self.next_frame + self.layout.interval) & FRAME_MASK;
        self.cur_frame += 1;
        let mut done = None;
        if self.cur_frame >= self.layout.frames {
            self.cur_frame = 0;
            done = Some(self.finish_buffer());
        }
        if self.layout.interval == 1 {
            self.program_frame(regs, cfg, ep)?;
        }
        if let Some(done) = done {
            handler.iso_buffer_ready(self.address, done, self.packets(done));
        }
        Ok(())
    }

    /// Descriptor ring ran dry (BNA): collect the current half and restart
    pub(crate) fn on_buffer_not_available(
        &mut self,
        regs: &dyn RegisterAccess,
        handler: &mut dyn UsbHandler,
    ) -> Result<()> {
        if self.layout.scheduler != IsoScheduler::Descriptor {
            return Ok(());
        }
        #[cfg(feature = "defmt")]
        defmt::warn!("ISO {:02x}: descriptor ring not available", self.address);
        let done = self.proc_buf_num;
        self.collect_half(done);
        self.finish_buffer();
        handler.iso_buffer_ready(self.address, done, self.packets(done));
        let soffn = Dsts(regs.read(offsets::DSTS)).soffn();
        self.next_frame = Self::first_frame(soffn, self.layout.interval);
        self.proc_buf_num = 0;
        self.arm_ring(regs)
    }

    /// The frame programmed last was not serviced (incomplete isochronous)
    pub(crate) fn on_incomplete(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        ep: &mut Endpoint,
        handler: &mut dyn UsbHandler,
    ) -> Result<()> {
        if self.layout.scheduler != IsoScheduler::Frame || !self.armed {
            return Ok(());
        }
        let ctl = DepCtl::from_bits_retain(regs.read(self.ctl()));
        if ctl.contains(DepCtl::EPENA) {
            regs.write(self.ctl(), (ctl | DepCtl::EPDIS | DepCtl::SNAK).bits());
        }
        ep.abort();
        self.armed = false;
        let (offset, _) = self.layout.slot(self.cur_frame as usize);
        self.info[self.proc_buf_num][self.cur_frame as usize] = IsoPacketInfo {
            offset,
            length: 0,
            error: true,
        };
        self.advance_frame(regs, cfg, ep, handler)
    }

    /// Start of frame: program frame-mode streams with an interval above one
    pub(crate) fn on_sof(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig, ep: &mut Endpoint, frame: u32) {
        if self.layout.scheduler != IsoScheduler::Frame || self.armed || self.layout.interval == 1 {
            return;
        }
        if (frame + 1) & FRAME_MASK == self.next_frame && self.program_frame(regs, cfg, ep).is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("ISO {:02x}: frame {} not programmed", self.address, self.next_frame);
        }
    }

    /// Stop the stream and hand the buffers back
    pub fn stop(mut self, regs: &dyn RegisterAccess, ep: &mut Endpoint) -> [DmaBuffer; 2] {
        let ctl = DepCtl::from_bits_retain(regs.read(self.ctl()));
        if ctl.contains(DepCtl::EPENA) {
            regs.write(self.ctl(), (ctl | DepCtl::EPDIS | DepCtl::SNAK).bits());
        }
        ep.abort();
        if let Some(mut chain) = self.chain.take() {
            chain.abandon();
            ep.set_chain(chain);
        }
        #[cfg(feature = "defmt")]
        defmt::debug!("ISO {:02x} stopped after {} buffers", self.address, self.completed);
        self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::config::EndpointConfig;
    use crate::dma::DmaDescriptor;
    use crate::dwc::register::mock::MockRegisters;
    use crate::transfer::TransferLimits;
    use std::boxed::Box;
    use std::vec::Vec;

    #[derive(Default)]
    struct Recorder {
        ready: Vec<(u8, usize, Vec<IsoPacketInfo>)>,
    }

    impl UsbHandler for Recorder {
        fn iso_buffer_ready(&mut self, ep_addr: u8, buffer: usize, packets: &[IsoPacketInfo]) {
            self.ready.push((ep_addr, buffer, packets.to_vec()));
        }
    }

    fn cfg(mode: DmaMode, pti: bool) -> EngineConfig {
        EngineConfig {
            mode,
            limits: TransferLimits {
                max_transfer_size: 65_535,
                max_packet_count: 511,
            },
            dedicated_fifos: true,
            pti,
        }
    }

    fn buffer(len: usize) -> DmaBuffer {
        DmaBuffer::from_static(Box::leak(std::vec![0u8; len].into_boxed_slice()))
    }

    fn iso_ep(regs: &MockRegisters, address: u8, interval: u8) -> Endpoint {
        let mut ep = Endpoint::new(address & 0x0F, Direction::from_address(address));
        ep.activate(regs, &EndpointConfig::new(address, TransferType::Isochronous, 192, interval), 1)
            .unwrap();
        ep
    }

    #[test]
    fn test_first_frame_rounds_to_interval() {
        assert_eq!(IsoStream::first_frame(10, 1), 11);
        assert_eq!(IsoStream::first_frame(10, 4), 12);
        assert_eq!(IsoStream::first_frame(11, 4), 12);
        assert_eq!(IsoStream::first_frame(12, 4), 16);
    }

    #[test]
    fn test_layout_rejects_misaligned_interval() {
        let regs = MockRegisters::new();
        let ep = iso_ep(&regs, 0x81, 2);
        let c = cfg(DmaMode::BufferDma, false);
        assert_eq!(IsoLayout::plan(&ep, &c, 192, 3, 4096).unwrap_err(), UsbError::InvalidParameter);
        let layout = IsoLayout::plan(&ep, &c, 192, 8, 4096).unwrap();
        assert_eq!(layout.interval, 2);
        assert_eq!(layout.frames, 4);
        assert_eq!(layout.scheduler(), IsoScheduler::Frame);
    }

    #[test]
    fn test_frame_mode_alternates_buffers() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::BufferDma, false);
        let mut ep = iso_ep(&regs, 0x81, 1);
        let layout = IsoLayout::plan(&ep, &c, 100, 2, 200).unwrap();
        let mut stream = IsoStream::new(&mut ep, layout, [buffer(200), buffer(200)]);
        let mut rec = Recorder::default();
        stream.start(&regs, &c, &mut ep, None).unwrap();

        for _ in 0..4 {
            regs.set(offsets::dieptsiz(1), 0);
            stream.on_transfer_complete(&regs, &c, &mut ep, &mut rec).unwrap();
        }
        let order: Vec<usize> = rec.ready.iter().map(|r| r.1).collect();
        assert_eq!(order, [0, 1]);
        assert_eq!(stream.proc_buf_num(), 0);
        assert_eq!(rec.ready[0].2.len(), 2);
        assert_eq!(rec.ready[0].2[1], IsoPacketInfo { offset: 100, length: 100, error: false });
    }

    #[test]
    fn test_pti_out_recomputes_dropped_packets() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::BufferDma, true);
        let mut ep = iso_ep(&regs, 0x02, 1);
        let layout = IsoLayout::plan(&ep, &c, 192, 4, 4 * 192 + 192).unwrap();
        let mut stream = IsoStream::new(&mut ep, layout, [buffer(960), buffer(960)]);
        let mut rec = Recorder::default();
        stream.start(&regs, &c, &mut ep, None).unwrap();
        assert_eq!(DepTsiz::from_bits_retain(regs.get(offsets::doeptsiz(2))).pktcnt(), 4);

        // Three packets arrived, 500 bytes in total; one packet never came
        regs.set(offsets::doeptsiz(2), DepTsiz::new(768 - 500, 1).bits());
        stream.on_transfer_complete(&regs, &c, &mut ep, &mut rec).unwrap();
        let (_, buf, packets) = &rec.ready[0];
        assert_eq!(*buf, 0);
        assert_eq!(packets[0].length, 192);
        assert_eq!(packets[1].length, 192);
        assert_eq!(packets[2], IsoPacketInfo { offset: 384, length: 116, error: false });
        assert!(packets[3].error);
        assert_eq!(stream.proc_buf_num(), 1);
        assert_eq!(regs.get(offsets::doepdma(2)), stream.buffers[1].dma_addr());
    }

    #[test]
    fn test_descriptor_ring_reports_completed_half() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::DescriptorDma, false);
        let mut ep = iso_ep(&regs, 0x81, 1);
        let descs: Vec<DmaDescriptor> = (0..8).map(|_| DmaDescriptor::new()).collect();
        ep.set_chain(DescriptorChain::new(Box::leak(descs.into_boxed_slice())).unwrap());
        let layout = IsoLayout::plan(&ep, &c, 192, 4, 768).unwrap();
        let mut stream = IsoStream::new(&mut ep, layout, [buffer(768), buffer(768)]);
        let mut rec = Recorder::default();
        regs.set(offsets::DSTS, 100 << 8);
        stream.start(&regs, &c, &mut ep, None).unwrap();

        let chain = stream.chain.as_ref().unwrap();
        assert_eq!(regs.get(offsets::diepdma(1)), chain.dma_addr());
        let ring = chain.descriptors();
        assert_eq!(ring.len(), 8);
        assert_eq!(IsoInStatus(ring[0].status()).framenum(), 101);
        assert_eq!(IsoInStatus(ring[4].status()).framenum(), 105);

        stream.on_transfer_complete(&regs, &c, &mut ep, &mut rec).unwrap();
        assert_eq!(rec.ready[0].1, 0);
        assert_eq!(stream.proc_buf_num(), 1);
        // Rebuilt half 0 targets the frames after half 1
        let ring = stream.chain.as_ref().unwrap().descriptors();
        assert_eq!(IsoInStatus(ring[0].status()).framenum(), 109);
        stream.on_transfer_complete(&regs, &c, &mut ep, &mut rec).unwrap();
        assert_eq!(rec.ready[1].1, 1);

        let buffers = stream.stop(&regs, &mut ep);
        assert_eq!(buffers[0].len(), 768);
        assert!(ep.chain.is_some());
    }
}
