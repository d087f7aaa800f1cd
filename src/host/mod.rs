//! Host mode
//!
//! Upper layers open a [`PipeHandle`] per device endpoint and queue requests
//! on it. [`Host`] hands each pipe with work a free channel, round robin, and
//! gives the channel back when the transfer retires. A pipe keeps its data
//! toggle and PING state between transfers so consecutive requests continue
//! the sequence.

pub mod channel;
pub mod port;

pub use channel::{ControlStage, HaltReason, HaltState, HostChannel, SETUP_LEN};
pub use port::PortStatus;

use crate::dma::{DescriptorChain, DmaBuffer, TransferHandle};
use crate::dwc::params::MAX_CHANNELS;
use crate::dwc::{offsets, CoreParams, GintSts, GrxSts, Hfnum};
use crate::error::{Result, UsbError};
use crate::handler::Context;
use crate::recovery::{DataPid, RecoveryStats};
use crate::transfer::{TransferStatus, TransferType, UsbSpeed};
use channel::{ChannelEvent, ChannelTransfer};
use heapless::Deque;

/// Pipes that may be open at once
pub const MAX_PIPES: usize = 16;
/// Requests that may wait on one pipe
pub const PIPE_QUEUE_DEPTH: usize = 8;

/// Handle to an open pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeHandle(u8);

impl PipeHandle {
    /// Slot index
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Transaction translator a full/low-speed device sits behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HubPort {
    /// Address of the high-speed hub
    pub hub_addr: u8,
    /// Hub port the device is attached to
    pub port: u8,
}

/// Target of a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeConfig {
    /// Device address
    pub dev_addr: u8,
    /// Endpoint address with the direction bit
    pub ep_addr: u8,
    /// Transfer type
    pub ep_type: TransferType,
    /// wMaxPacketSize, including the high-bandwidth bits
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
    /// Device speed
    pub speed: UsbSpeed,
    /// Split transactions through a hub's transaction translator
    pub hub: Option<HubPort>,
}

impl PipeConfig {
    /// Pipe to a directly attached endpoint
    pub const fn new(
        dev_addr: u8,
        ep_addr: u8,
        ep_type: TransferType,
        max_packet_size: u16,
        interval: u8,
        speed: UsbSpeed,
    ) -> Self {
        Self {
            dev_addr,
            ep_addr,
            ep_type,
            max_packet_size,
            interval,
            speed,
            hub: None,
        }
    }

    /// Route through a high-speed hub
    pub const fn with_hub(mut self, hub: HubPort) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Endpoint number
    pub const fn number(&self) -> u8 {
        self.ep_addr & 0x0F
    }

    /// IN endpoint
    pub const fn is_in(&self) -> bool {
        self.ep_addr & 0x80 != 0
    }

    /// Packet size without the high-bandwidth bits
    pub const fn mps(&self) -> u16 {
        self.max_packet_size & 0x7FF
    }

    /// Transactions per (micro)frame
    pub const fn transactions(&self) -> u32 {
        let extra = ((self.max_packet_size >> 11) & 0x3) as u32;
        if extra > 2 {
            3
        } else {
            extra + 1
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dev_addr > 127 || self.mps() == 0 || self.mps() > 1024 {
            return Err(UsbError::InvalidParameter);
        }
        if self.ep_type == TransferType::Control && self.number() != self.ep_addr {
            return Err(UsbError::InvalidParameter);
        }
        match self.speed {
            UsbSpeed::Low if matches!(self.ep_type, TransferType::Bulk | TransferType::Isochronous) => {
                Err(UsbError::InvalidParameter)
            }
            UsbSpeed::High if self.hub.is_some() => Err(UsbError::InvalidParameter),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
struct Pipe {
    config: PipeConfig,
    toggle: DataPid,
    ping: bool,
    queue: Deque<TransferHandle, PIPE_QUEUE_DEPTH>,
    channel: Option<u8>,
    closing: bool,
}

impl Pipe {
    fn remove_queued(&mut self, handle: TransferHandle) -> bool {
        let mut found = false;
        for _ in 0..self.queue.len() {
            if let Some(h) = self.queue.pop_front() {
                if h == handle && !found {
                    found = true;
                } else {
                    let _ = self.queue.push_back(h);
                }
            }
        }
        found
    }

    fn is_waiting(&self) -> bool {
        self.channel.is_none() && !self.closing && !self.queue.is_empty()
    }
}

/// Host-side state: pipes, channels and error statistics
pub struct Host {
    channels: [HostChannel; MAX_CHANNELS],
    num_channels: usize,
    pipes: [Option<Pipe>; MAX_PIPES],
    next_pipe: usize,
    stats: RecoveryStats,
}

impl Host {
    /// Host state for the channels the core provides
    pub fn new(params: &CoreParams) -> Self {
        Self {
            channels: core::array::from_fn(|i| HostChannel::new(i as u8)),
            num_channels: (params.host_channels as usize).min(MAX_CHANNELS),
            pipes: core::array::from_fn(|_| None),
            next_pipe: 0,
            stats: RecoveryStats::new(),
        }
    }

    /// Usable channels
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Channel `ch`
    pub fn channel(&self, ch: usize) -> Option<&HostChannel> {
        self.channels[..self.num_channels].get(ch)
    }

    /// Error and halt counters
    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    /// Configuration of an open pipe
    pub fn pipe_config(&self, pipe: PipeHandle) -> Option<&PipeConfig> {
        self.pipes.get(pipe.index())?.as_ref().map(|p| &p.config)
    }

    /// Requests waiting on `pipe`, not counting the one in flight
    pub fn queued(&self, pipe: PipeHandle) -> usize {
        self.pipe(pipe).map_or(0, |p| p.queue.len())
    }

    fn pipe(&self, pipe: PipeHandle) -> Result<&Pipe> {
        self.pipes
            .get(pipe.index())
            .and_then(|p| p.as_ref())
            .ok_or(UsbError::InvalidParameter)
    }

    fn pipe_mut(&mut self, pipe: PipeHandle) -> Result<&mut Pipe> {
        self.pipes
            .get_mut(pipe.index())
            .and_then(|p| p.as_mut())
            .ok_or(UsbError::InvalidParameter)
    }

    /// Attach a descriptor list to a channel (descriptor DMA)
    pub(crate) fn set_channel_chain(&mut self, ch: usize, chain: DescriptorChain) -> Result<()> {
        let channel = self.channels[..self.num_channels]
            .get_mut(ch)
            .ok_or(UsbError::InvalidParameter)?;
        if channel.is_busy() {
            return Err(UsbError::TransferActive);
        }
        channel.chain = Some(chain);
        Ok(())
    }

    /// Open a pipe
    pub(crate) fn open_pipe(&mut self, config: PipeConfig) -> Result<PipeHandle> {
        config.validate()?;
        let slot = self
            .pipes
            .iter()
            .position(|p| p.is_none())
            .ok_or(UsbError::NoResources)?;
        self.pipes[slot] = Some(Pipe {
            config,
            toggle: DataPid::Data0,
            ping: false,
            queue: Deque::new(),
            channel: None,
            closing: false,
        });
        #[cfg(feature = "defmt")]
        defmt::debug!("Pipe {} open: {}", slot, config);
        Ok(PipeHandle(slot as u8))
    }

    /// Close a pipe, cancelling its requests
    ///
    /// A transfer in flight is halted first; the slot frees once the halt
    /// completes.
    pub(crate) fn close_pipe(&mut self, cx: &mut Context<'_>, pipe: PipeHandle) -> Result<()> {
        let entry = self.pipe_mut(pipe)?;
        entry.closing = true;
        let mut drained: Deque<TransferHandle, PIPE_QUEUE_DEPTH> = Deque::new();
        core::mem::swap(&mut drained, &mut entry.queue);
        let channel = entry.channel;
        while let Some(handle) = drained.pop_front() {
            fail(cx, handle, TransferStatus::Cancelled);
        }
        match channel {
            Some(ch) => self.dequeue_channel(cx, ch as usize),
            None => self.pipes[pipe.index()] = None,
        }
        Ok(())
    }

    /// Clear the toggle after the device's endpoint halt was cleared
    pub(crate) fn reset_toggle(&mut self, pipe: PipeHandle) -> Result<()> {
        let entry = self.pipe_mut(pipe)?;
        if entry.channel.is_some() {
            return Err(UsbError::TransferActive);
        }
        entry.toggle = DataPid::Data0;
        entry.ping = false;
        Ok(())
    }

    /// Queue a request on a pipe
    ///
    /// Control requests carry the 8-byte SETUP packet at the front of the
    /// buffer; the request length counts only the data stage.
    pub(crate) fn submit(&mut self, cx: &mut Context<'_>, pipe: PipeHandle, handle: TransferHandle) -> Result<()> {
        if !port::status(cx.regs).connected {
            return Err(UsbError::DeviceDisconnected);
        }
        let entry = self.pipe_mut(pipe)?;
        if entry.closing {
            return Err(UsbError::InvalidState);
        }
        let request = cx.store.request(handle)?;
        let base = if entry.config.ep_type == TransferType::Control {
            SETUP_LEN
        } else {
            0
        };
        if request.buffer.len() < (base + request.length) as usize {
            return Err(UsbError::BufferOverflow);
        }
        entry.queue.push_back(handle).map_err(|_| UsbError::NoResources)?;
        self.schedule(cx);
        Ok(())
    }

    /// Cancel a queued or in-flight request
    pub(crate) fn cancel(&mut self, cx: &mut Context<'_>, handle: TransferHandle) -> Result<()> {
        for index in 0..MAX_PIPES {
            let Some(pipe) = self.pipes[index].as_mut() else {
                continue;
            };
            if pipe.remove_queued(handle) {
                let idle = pipe.queue.is_empty() && pipe.channel.is_none();
                fail(cx, handle, TransferStatus::Cancelled);
                if idle {
                    cx.handler.pipe_idle(PipeHandle(index as u8));
                }
                return Ok(());
            }
        }
        let found = self.channels[..self.num_channels]
            .iter()
            .position(|c| c.active_handle() == Some(handle));
        match found {
            Some(ch) => {
                self.dequeue_channel(cx, ch);
                Ok(())
            }
            None => Err(UsbError::InvalidParameter),
        }
    }

    fn dequeue_channel(&mut self, cx: &mut Context<'_>, ch: usize) {
        let state = self.channels[ch].halt(cx.regs, &cx.cfg, HaltReason::Dequeued, &self.stats);
        if state == HaltState::Halted {
            let event = self.channels[ch].resolve_if_halted(cx.regs, &cx.cfg, &self.stats);
            self.on_event(cx, ch, event);
            self.schedule(cx);
        }
    }

    fn free_channel(&self) -> Option<usize> {
        self.channels[..self.num_channels].iter().position(|c| c.is_free())
    }

    /// Give free channels to waiting pipes, round robin
    fn schedule(&mut self, cx: &mut Context<'_>) {
        let first = self.next_pipe;
        for step in 0..MAX_PIPES {
            let index = (first + step) % MAX_PIPES;
            if !self.pipes[index].as_ref().is_some_and(Pipe::is_waiting) {
                continue;
            }
            let Some(ch) = self.free_channel() else {
                #[cfg(feature = "defmt")]
                defmt::trace!("All {} channels busy", self.num_channels);
                break;
            };
            self.next_pipe = (index + 1) % MAX_PIPES;
            self.start_on(cx, index, ch);
        }
    }

    fn start_on(&mut self, cx: &mut Context<'_>, index: usize, ch: usize) {
        let Some(pipe) = self.pipes[index].as_mut() else {
            return;
        };
        let Some(handle) = pipe.queue.pop_front() else {
            return;
        };
        let Ok(loaded) = cx.load(handle) else {
            #[cfg(feature = "defmt")]
            defmt::warn!("Pipe {}: dropped stale request", index);
            return;
        };
        let control = pipe.config.ep_type == TransferType::Control;
        let channel = &mut self.channels[ch];
        channel.assign(pipe.config, pipe.toggle, pipe.ping);
        pipe.channel = Some(ch as u8);
        let xfer = ChannelTransfer::new(handle, loaded.buffer, loaded.length, loaded.zero, control);
        if let Err((e, xfer)) = channel.start(cx.regs, &cx.cfg, xfer) {
            let (toggle, ping) = channel.release(cx.regs);
            pipe.toggle = toggle;
            pipe.ping = ping;
            pipe.channel = None;
            cx.complete(handle, xfer.buffer, 0, TransferStatus::Error(e));
        }
    }

    fn pipe_of(&self, ch: usize) -> Option<usize> {
        self.pipes
            .iter()
            .position(|p| p.as_ref().is_some_and(|p| p.channel == Some(ch as u8)))
    }

    /// Hand a retired transfer back and free its channel
    fn on_event(&mut self, cx: &mut Context<'_>, ch: usize, event: ChannelEvent) {
        let ChannelEvent::Retired(retired) = event else {
            return;
        };
        let owner = self.pipe_of(ch);
        let (toggle, ping) = self.channels[ch].release(cx.regs);
        let mut idle = None;
        if let Some(index) = owner {
            if let Some(pipe) = self.pipes[index].as_mut() {
                pipe.toggle = toggle;
                pipe.ping = ping;
                pipe.channel = None;
                if pipe.closing {
                    self.pipes[index] = None;
                } else if retired.status == TransferStatus::Cancelled && pipe.queue.is_empty() {
                    idle = Some(PipeHandle(index as u8));
                }
            }
        }
        cx.complete(retired.handle, retired.buffer, retired.actual, retired.status);
        if let Some(pipe) = idle {
            cx.handler.pipe_idle(pipe);
        }
    }

    /// Channel interrupts (GINTSTS.HChInt)
    pub(crate) fn on_channels(&mut self, cx: &mut Context<'_>) {
        let haint = cx.regs.read(offsets::HAINT) & cx.regs.read(offsets::HAINTMSK);
        for ch in 0..self.num_channels {
            if haint & (1 << ch) == 0 {
                continue;
            }
            let event = self.channels[ch].on_interrupt(cx.regs, &cx.cfg, &self.stats);
            self.on_event(cx, ch, event);
        }
        self.schedule(cx);
    }

    /// Slave mode: one entry of the receive status queue
    pub(crate) fn on_rx_fifo(&mut self, cx: &mut Context<'_>) {
        let regs = cx.regs;
        regs.clear_bits(offsets::GINTMSK, GintSts::RXSTSQLVL.bits());
        let status = GrxSts::from_bits_retain(regs.read(offsets::GRXSTSP));
        let ch = status.epnum();
        let bcnt = status.bcnt();
        if status.pktsts() == GrxSts::PKTSTS_IN_DATA && bcnt > 0 {
            if let Some(channel) = self.channels[..self.num_channels].get_mut(ch) {
                channel.receive_packet(regs, bcnt);
            }
        }
        regs.set_bits(offsets::GINTMSK, GintSts::RXSTSQLVL.bits());
    }

    /// Slave mode: request queue or Tx FIFO space freed up
    pub(crate) fn on_tx_fifo_empty(&mut self, cx: &mut Context<'_>, periodic: bool) {
        let mut more = false;
        for channel in self.channels[..self.num_channels].iter_mut() {
            if channel.is_free() || channel.periodic() != periodic {
                continue;
            }
            if channel.halt_state() == HaltState::Queued && !channel.retry_queued_halt(cx.regs, &cx.cfg, &self.stats) {
                more = true;
            }
            if channel.continue_out(cx.regs) {
                more = true;
            }
        }
        if !more {
            let irq = if periodic {
                GintSts::PTXFEMPTY
            } else {
                GintSts::NPTXFEMPTY
            };
            cx.regs.clear_bits(offsets::GINTMSK, irq.bits());
        }
    }

    /// Root port interrupt
    pub(crate) fn on_port(&mut self, cx: &mut Context<'_>, params: &CoreParams) -> PortStatus {
        let status = port::on_interrupt(cx.regs, params);
        #[cfg(feature = "defmt")]
        defmt::debug!("Port: {}", status);
        if status.enable_changed && !status.enabled && self.busy() {
            // Port dropped out from under running transfers
            self.on_disconnect(cx);
        }
        cx.handler.host_port_changed(status);
        status
    }

    fn busy(&self) -> bool {
        self.channels[..self.num_channels].iter().any(HostChannel::is_busy)
            || self.pipes.iter().flatten().any(|p| !p.queue.is_empty())
    }

    /// Device gone: fail everything with `DeviceDisconnected`
    ///
    /// Channels are stopped without waiting for their halt; pipes stay open
    /// with their toggles reset.
    pub(crate) fn on_disconnect(&mut self, cx: &mut Context<'_>) {
        let status = TransferStatus::Error(UsbError::DeviceDisconnected);
        let mut drained = [false; MAX_PIPES];
        for ch in 0..self.num_channels {
            if self.channels[ch].is_free() {
                continue;
            }
            let owner = self.pipe_of(ch);
            let aborted = self.channels[ch].abort(cx.regs);
            self.channels[ch].release(cx.regs);
            if let Some(index) = owner {
                if let Some(pipe) = self.pipes[index].as_mut() {
                    pipe.channel = None;
                }
                drained[index] = true;
            }
            if let Some(xfer) = aborted {
                let actual = xfer.actual();
                cx.complete(xfer.handle, xfer.buffer, actual, status);
            }
        }
        for (index, slot) in self.pipes.iter_mut().enumerate() {
            let Some(pipe) = slot.as_mut() else {
                continue;
            };
            pipe.toggle = DataPid::Data0;
            pipe.ping = false;
            while let Some(handle) = pipe.queue.pop_front() {
                drained[index] = true;
                fail(cx, handle, status);
            }
            if pipe.closing {
                *slot = None;
            }
        }
        for (index, was_busy) in drained.iter().enumerate() {
            if *was_busy && self.pipes[index].is_some() {
                cx.handler.pipe_idle(PipeHandle(index as u8));
            }
        }
    }

    /// Host start-of-frame
    pub(crate) fn on_sof(&mut self, cx: &mut Context<'_>) {
        let frame = Hfnum(cx.regs.read(offsets::HFNUM)).frnum();
        cx.handler.start_of_frame(frame as u16);
    }

    /// Leave host mode: fail all work and close every pipe
    pub(crate) fn stop(&mut self, cx: &mut Context<'_>) {
        self.on_disconnect(cx);
        for slot in self.pipes.iter_mut() {
            *slot = None;
        }
        self.next_pipe = 0;
    }
}

fn fail(cx: &mut Context<'_>, handle: TransferHandle, status: TransferStatus) {
    let buffer = cx
        .store
        .request(handle)
        .map(|r| r.buffer.take())
        .unwrap_or(DmaBuffer::empty());
    cx.complete(handle, buffer, 0, status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{RequestStore, TransferPool};
    use crate::dwc::register::mock::MockRegisters;
    use crate::dwc::{CoreParamsBuilder, DmaMode, HcInt, HcTsiz, Hprt0};
    use crate::handler::UsbHandler;
    use crate::mode::EngineConfig;
    use crate::transfer::{Completion, TransferLimits, TransferRequest};
    use std::boxed::Box;
    use std::vec::Vec;

    #[derive(Default)]
    struct Recorder {
        done: Vec<(TransferHandle, TransferStatus, u32)>,
        idle: Vec<PipeHandle>,
    }

    impl UsbHandler for Recorder {
        fn transfer_complete(&mut self, completion: Completion, _buffer: DmaBuffer) {
            self.done.push((completion.handle, completion.status, completion.actual));
        }

        fn pipe_idle(&mut self, pipe: PipeHandle) {
            self.idle.push(pipe);
        }
    }

    fn cfg() -> EngineConfig {
        EngineConfig {
            mode: DmaMode::BufferDma,
            limits: TransferLimits {
                max_transfer_size: 65_535,
                max_packet_count: 511,
            },
            dedicated_fifos: true,
            pti: false,
        }
    }

    fn request(len: usize) -> TransferRequest {
        let buffer = DmaBuffer::from_static(Box::leak(std::vec![0u8; len].into_boxed_slice()));
        TransferRequest::new(buffer, len as u32, false, 0)
    }

    fn connected() -> MockRegisters {
        let regs = MockRegisters::new();
        regs.set(offsets::HPRT0, (Hprt0::PRTCONNSTS | Hprt0::PRTENA | Hprt0::PRTPWR).bits());
        regs
    }

    fn host(channels: u8) -> Host {
        Host::new(&CoreParamsBuilder::new().host_channels(channels).build())
    }

    fn bulk_in() -> PipeConfig {
        PipeConfig::new(1, 0x81, TransferType::Bulk, 512, 0, UsbSpeed::High)
    }

    #[test]
    fn test_pipe_config_validation() {
        let mut host = host(4);
        let ls_bulk = PipeConfig::new(1, 0x81, TransferType::Bulk, 8, 0, UsbSpeed::Low);
        assert_eq!(host.open_pipe(ls_bulk), Err(UsbError::InvalidParameter));
        let hs_split = bulk_in().with_hub(HubPort { hub_addr: 1, port: 1 });
        assert_eq!(host.open_pipe(hs_split), Err(UsbError::InvalidParameter));
        let hb = PipeConfig::new(1, 0x81, TransferType::Isochronous, 1024 | (2 << 11), 1, UsbSpeed::High);
        assert_eq!(hb.transactions(), 3);
        assert_eq!(hb.mps(), 1024);
        assert!(host.open_pipe(hb).is_ok());
    }

    #[test]
    fn test_requests_share_channels_and_keep_toggle() {
        let regs = connected();
        let mut pool: TransferPool<4> = TransferPool::new();
        let mut handler = Recorder::default();
        let mut host = host(1);
        let a = pool.alloc(request(512)).unwrap();
        let b = pool.alloc(request(512)).unwrap();
        let mut cx = Context {
            regs: &regs,
            cfg: cfg(),
            store: &mut pool,
            handler: &mut handler,
        };
        let pipe = host.open_pipe(bulk_in()).unwrap();
        host.submit(&mut cx, pipe, a).unwrap();
        host.submit(&mut cx, pipe, b).unwrap();
        assert_eq!(host.channel(0).and_then(HostChannel::active_handle), Some(a));
        assert_eq!(host.queued(pipe), 1);

        // First transfer done, core left DATA1 as the next PID
        regs.set(offsets::hctsiz(0), HcTsiz::new(0, 0, DataPid::Data1.bits()).bits());
        regs.set(offsets::hcint(0), (HcInt::CHHLTD | HcInt::XFERCOMPL).bits());
        regs.set(offsets::HAINT, 1);
        host.on_channels(&mut cx);
        assert_eq!(host.channel(0).and_then(HostChannel::active_handle), Some(b));
        let tsiz = HcTsiz::from_bits_retain(regs.get(offsets::hctsiz(0)));
        assert_eq!(tsiz.pid(), DataPid::Data1.bits());
        drop(cx);
        assert_eq!(handler.done, std::vec![(a, TransferStatus::Complete, 512)]);
    }

    #[test]
    fn test_cancel_queued_and_active() {
        let regs = connected();
        let mut pool: TransferPool<4> = TransferPool::new();
        let mut handler = Recorder::default();
        let mut host = host(1);
        let a = pool.alloc(request(512)).unwrap();
        let b = pool.alloc(request(512)).unwrap();
        let mut cx = Context {
            regs: &regs,
            cfg: cfg(),
            store: &mut pool,
            handler: &mut handler,
        };
        let pipe = host.open_pipe(bulk_in()).unwrap();
        host.submit(&mut cx, pipe, a).unwrap();
        host.submit(&mut cx, pipe, b).unwrap();

        host.cancel(&mut cx, b).unwrap();
        host.cancel(&mut cx, a).unwrap();
        assert_eq!(host.channel(0).map(HostChannel::halt_state), Some(HaltState::Pending));
        // Cancelling again while the halt is pending writes nothing new
        let halts = host.stats().halts();
        host.cancel(&mut cx, a).unwrap();
        assert_eq!(host.stats().halts(), halts);

        regs.set(offsets::hcint(0), HcInt::CHHLTD.bits());
        regs.set(offsets::HAINT, 1);
        host.on_channels(&mut cx);
        assert!(host.channel(0).is_some_and(HostChannel::is_free));
        assert_eq!(cx.store.request(a).err(), Some(UsbError::InvalidParameter));
        drop(cx);
        assert_eq!(handler.done.len(), 2);
        assert_eq!(handler.done[0], (b, TransferStatus::Cancelled, 0));
        assert_eq!(handler.done[1].1, TransferStatus::Cancelled);
        assert_eq!(handler.idle, std::vec![pipe]);
    }

    #[test]
    fn test_disconnect_fails_everything() {
        let regs = connected();
        let mut pool: TransferPool<4> = TransferPool::new();
        let mut handler = Recorder::default();
        let mut host = host(1);
        let a = pool.alloc(request(512)).unwrap();
        let b = pool.alloc(request(512)).unwrap();
        let mut cx = Context {
            regs: &regs,
            cfg: cfg(),
            store: &mut pool,
            handler: &mut handler,
        };
        let pipe = host.open_pipe(bulk_in()).unwrap();
        host.submit(&mut cx, pipe, a).unwrap();
        host.submit(&mut cx, pipe, b).unwrap();
        host.on_disconnect(&mut cx);
        assert!(host.channel(0).is_some_and(HostChannel::is_free));
        assert_eq!(host.queued(pipe), 0);
        let status = TransferStatus::Error(UsbError::DeviceDisconnected);

        regs.set(offsets::HPRT0, 0);
        assert_eq!(host.submit(&mut cx, pipe, a), Err(UsbError::DeviceDisconnected));
        drop(cx);
        assert_eq!(handler.done.len(), 2);
        assert!(handler.done.iter().all(|d| d.1 == status));
        assert_eq!(handler.idle, std::vec![pipe]);
    }

    #[test]
    fn test_control_buffer_must_hold_setup() {
        let regs = connected();
        let mut pool: TransferPool<2> = TransferPool::new();
        let mut handler = Recorder::default();
        let mut host = host(2);
        let mut req = request(8);
        req.length = 8;
        let a = pool.alloc(req).unwrap();
        let mut cx = Context {
            regs: &regs,
            cfg: cfg(),
            store: &mut pool,
            handler: &mut handler,
        };
        let ep0 = host
            .open_pipe(PipeConfig::new(0, 0, TransferType::Control, 64, 0, UsbSpeed::High))
            .unwrap();
        assert_eq!(host.submit(&mut cx, ep0, a), Err(UsbError::BufferOverflow));
    }
}
