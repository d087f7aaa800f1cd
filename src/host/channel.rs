//! Host channel engine
//!
//! A channel carries one pipe's active transfer. Control transfers walk the
//! SETUP, data and status stages on the same channel. Every halt goes through
//! [`HostChannel::halt`], which records the reason and writes CHDIS at most
//! once; the channel-halted interrupt then resolves the reason into a retry,
//! the next stage or a finished transfer.

use super::PipeConfig;
use crate::dma::{DescriptorChain, DmaBuffer, TransferHandle};
use crate::dwc::{offsets, DmaMode, GintSts, HcChar, HcInt, HcSplt, HcTsiz, Hfnum, RegisterAccess, TxSts};
use crate::error::{Result, UsbError};
use crate::mode::{read_fifo, words, write_fifo, ChannelJob, ChannelSetup, EngineConfig};
use crate::recovery::{ping_applies, DataPid, ErrorCounter, ErrorType, RecoveryAction, RecoveryStats};
use crate::transfer::{needs_zlp, Chunk, TransferStatus, TransferType, UsbSpeed};

/// SETUP packet at the front of every control request buffer
pub const SETUP_LEN: u32 = 8;

/// Split transaction carries the whole payload
const XACT_POS_ALL: u32 = 3;

/// Why a channel was halted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HaltReason {
    /// Transfer or stage finished
    Complete,
    /// Device answered STALL
    Stall,
    /// Device answered NAK
    Nak,
    /// Device answered NYET
    Nyet,
    /// ACK seen where the engine has to change course
    Ack,
    /// CRC, timeout or bit stuff error
    TransactionError,
    /// Device babbled past the packet end
    Babble,
    /// Periodic transaction missed its frame
    FrameOverrun,
    /// Unexpected data toggle
    DataToggleError,
    /// DMA bus error
    AhbError,
    /// The request was cancelled
    Dequeued,
}

impl HaltReason {
    /// Fault class counted against the retry budget, `None` for handshakes
    pub const fn fault(self) -> Option<ErrorType> {
        match self {
            Self::TransactionError => Some(ErrorType::TransactionError),
            Self::Stall => Some(ErrorType::Stall),
            Self::Babble => Some(ErrorType::Babble),
            Self::FrameOverrun => Some(ErrorType::FrameOverrun),
            Self::DataToggleError => Some(ErrorType::DataToggle),
            Self::AhbError => Some(ErrorType::AhbError),
            Self::Complete | Self::Nak | Self::Nyet | Self::Ack | Self::Dequeued => None,
        }
    }
}

/// Halt handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HaltState {
    /// Running or idle, no halt requested
    NoHalt,
    /// Halt waiting for request queue space (slave mode)
    Queued,
    /// CHDIS written, waiting for the channel-halted interrupt
    Pending,
    /// Channel stopped
    Halted,
}

/// Control transfer stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlStage {
    /// SETUP packet
    Setup,
    /// Data stage, also the only stage of non-control transfers
    Data,
    /// Zero-length handshake
    Status,
}

/// Transfer in flight on a channel
#[derive(Debug)]
pub(crate) struct ChannelTransfer {
    pub handle: TransferHandle,
    pub buffer: DmaBuffer,
    pub length: u32,
    zero: bool,
    control_in: bool,
    stage: ControlStage,
    done: u32,
    chunk: u32,
    programmed: u32,
    packets: u32,
    offset: u32,
    stage_in: bool,
    pushed: u32,
    received: u32,
    zlp_sent: bool,
}

impl ChannelTransfer {
    /// Wrap a loaded request; control buffers start with the SETUP packet
    pub fn new(handle: TransferHandle, buffer: DmaBuffer, length: u32, zero: bool, control: bool) -> Self {
        let control_in = control && buffer.as_slice().first().is_some_and(|b| b & 0x80 != 0);
        Self {
            handle,
            buffer,
            length,
            zero,
            control_in,
            stage: if control { ControlStage::Setup } else { ControlStage::Data },
            done: 0,
            chunk: 0,
            programmed: 0,
            packets: 0,
            offset: 0,
            stage_in: false,
            pushed: 0,
            received: 0,
            zlp_sent: false,
        }
    }

    /// Data bytes moved so far
    pub fn actual(&self) -> u32 {
        self.done.min(self.length)
    }
}

/// A transfer leaving its channel
#[derive(Debug)]
pub(crate) struct Retired {
    pub handle: TransferHandle,
    pub buffer: DmaBuffer,
    pub actual: u32,
    pub status: TransferStatus,
}

/// Result of servicing a channel interrupt
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    /// Nothing for the pipe layer to do
    None,
    /// The transfer finished; the channel can be released
    Retired(Retired),
}

/// Geometry of the stage about to be programmed
struct StagePlan {
    is_in: bool,
    ep_type: TransferType,
    offset: u32,
    remaining: u32,
    pid: DataPid,
}

fn plan_stage(config: &PipeConfig, xfer: &ChannelTransfer, pid: DataPid) -> StagePlan {
    let control = config.ep_type == TransferType::Control;
    match xfer.stage {
        ControlStage::Setup => StagePlan {
            is_in: false,
            ep_type: TransferType::Control,
            offset: 0,
            remaining: SETUP_LEN,
            pid: DataPid::MdataSetup,
        },
        ControlStage::Data => StagePlan {
            is_in: if control { xfer.control_in } else { config.is_in() },
            ep_type: config.ep_type,
            offset: if control { SETUP_LEN } else { 0 } + xfer.done,
            remaining: if xfer.zlp_sent { 0 } else { xfer.length - xfer.done },
            pid,
        },
        // The handshake runs opposite to the data, IN when there is none
        ControlStage::Status => StagePlan {
            is_in: !(xfer.control_in && xfer.length > 0),
            ep_type: TransferType::Control,
            offset: SETUP_LEN,
            remaining: 0,
            pid: DataPid::Data1,
        },
    }
}

/// Cause of a halt the core raised on its own
fn reason_from(raw: HcInt) -> HaltReason {
    if raw.contains(HcInt::AHBERR) {
        HaltReason::AhbError
    } else if raw.contains(HcInt::XFERCOMPL) {
        HaltReason::Complete
    } else if raw.contains(HcInt::STALL) {
        HaltReason::Stall
    } else if raw.contains(HcInt::XACTERR) {
        HaltReason::TransactionError
    } else if raw.contains(HcInt::BBLERR) {
        HaltReason::Babble
    } else if raw.contains(HcInt::FRMOVRUN) {
        HaltReason::FrameOverrun
    } else if raw.contains(HcInt::DATATGLERR) {
        HaltReason::DataToggleError
    } else if raw.contains(HcInt::NYET) {
        HaltReason::Nyet
    } else if raw.contains(HcInt::ACK) {
        HaltReason::Ack
    } else {
        // NAK, or a halt with no recorded cause: try again
        HaltReason::Nak
    }
}

/// One host channel
#[derive(Debug)]
pub struct HostChannel {
    num: u8,
    config: Option<PipeConfig>,
    pub(crate) xfer: Option<ChannelTransfer>,
    halt: HaltState,
    halt_reason: Option<HaltReason>,
    errors: ErrorCounter,
    pid: DataPid,
    do_ping: bool,
    complete_split: bool,
    pub(crate) chain: Option<DescriptorChain>,
}

impl HostChannel {
    /// Idle channel `num`
    pub const fn new(num: u8) -> Self {
        Self {
            num,
            config: None,
            xfer: None,
            halt: HaltState::NoHalt,
            halt_reason: None,
            errors: ErrorCounter::new(),
            pid: DataPid::Data0,
            do_ping: false,
            complete_split: false,
            chain: None,
        }
    }

    /// Channel number
    pub fn number(&self) -> usize {
        self.num as usize
    }

    /// No pipe owns the channel
    pub fn is_free(&self) -> bool {
        self.config.is_none()
    }

    /// A transfer is in flight
    pub fn is_busy(&self) -> bool {
        self.xfer.is_some()
    }

    /// Halt handshake state
    pub fn halt_state(&self) -> HaltState {
        self.halt
    }

    /// Reason recorded by the last halt request
    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.halt_reason
    }

    /// Consecutive transaction errors
    pub fn error_count(&self) -> u8 {
        self.errors.count()
    }

    /// Data PID the next data packet uses
    pub fn data_pid(&self) -> DataPid {
        self.pid
    }

    /// The next transaction is a complete split
    pub fn is_complete_split(&self) -> bool {
        self.complete_split
    }

    /// PING precedes the next OUT data
    pub fn ping_pending(&self) -> bool {
        self.do_ping
    }

    /// Handle of the transfer in flight
    pub fn active_handle(&self) -> Option<TransferHandle> {
        self.xfer.as_ref().map(|x| x.handle)
    }

    /// Bind the channel to a pipe, resuming its toggle and PING state
    pub(crate) fn assign(&mut self, config: PipeConfig, pid: DataPid, ping: bool) {
        self.config = Some(config);
        self.pid = pid;
        self.do_ping = ping;
        self.errors.clear();
        self.complete_split = false;
        self.halt = HaltState::NoHalt;
        self.halt_reason = None;
    }

    /// Unbind from the pipe, returning the toggle and PING state to keep
    pub(crate) fn release(&mut self, regs: &dyn RegisterAccess) -> (DataPid, bool) {
        let ch = self.number();
        regs.write(offsets::hcintmsk(ch), 0);
        regs.clear_bits(offsets::HAINTMSK, 1 << ch);
        self.config = None;
        self.xfer = None;
        self.halt = HaltState::NoHalt;
        self.halt_reason = None;
        self.complete_split = false;
        (self.pid, self.do_ping)
    }

    /// Begin a transfer
    pub(crate) fn start(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        xfer: ChannelTransfer,
    ) -> core::result::Result<(), (UsbError, ChannelTransfer)> {
        if self.xfer.is_some() {
            return Err((UsbError::TransferActive, xfer));
        }
        self.xfer = Some(xfer);
        self.halt = HaltState::NoHalt;
        self.halt_reason = None;
        match self.program(regs, cfg) {
            Ok(()) => Ok(()),
            Err(e) => match self.xfer.take() {
                Some(x) => Err((e, x)),
                None => Ok(()),
            },
        }
    }

    pub(crate) fn periodic(&self) -> bool {
        self.config.is_some_and(|c| c.ep_type.is_periodic())
    }

    fn split(&self) -> bool {
        self.config.is_some_and(|c| c.hub.is_some())
    }

    /// Program the current stage of the transfer and enable the channel
    fn program(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig) -> Result<()> {
        let config = self.config.ok_or(UsbError::InvalidState)?;
        let ch = self.number();
        let engine = cfg.engine();
        let xfer = self.xfer.as_mut().ok_or(UsbError::InvalidState)?;
        let plan = plan_stage(&config, xfer, self.pid);

        let mps = config.mps();
        let periodic = plan.ep_type.is_periodic();
        let chunk = if plan.remaining == 0 {
            Chunk::zero_length()
        } else if config.hub.is_some() {
            // One packet per start/complete split pair
            Chunk {
                size: plan.remaining.min(mps as u32),
                packets: 1,
            }
        } else {
            Chunk::plan(plan.remaining, mps, cfg.limits, periodic.then_some(config.transactions()))
        };
        // IN channels accept whole packets
        let programmed = if plan.is_in && chunk.size > 0 {
            chunk.packets * mps as u32
        } else {
            chunk.size
        };
        if plan.offset as usize + programmed as usize > xfer.buffer.len() {
            return Err(UsbError::BufferOverflow);
        }
        if programmed > 0 {
            if let Some(window) = xfer.buffer.window(plan.offset as usize, programmed as usize) {
                window.sync_for_device();
            }
        }

        let do_ping = self.do_ping
            && ping_applies(config.speed == UsbSpeed::High, plan.is_in, periodic, config.hub.is_some());
        let multi_count = if periodic && config.hub.is_none() {
            config.transactions()
        } else {
            1
        };
        let mut hcchar = HcChar::new(
            config.dev_addr,
            config.number(),
            plan.is_in,
            config.speed == UsbSpeed::Low,
            plan.ep_type.bits(),
            mps,
        )
        .with_multi_count(multi_count)
            | HcChar::CHEN;
        // Periodic transactions go out in the next (micro)frame
        if periodic && Hfnum(regs.read(offsets::HFNUM)).next_is_odd() {
            hcchar |= HcChar::ODDFRM;
        }

        let hcsplt = match config.hub {
            Some(hub) => HcSplt::new(hub.hub_addr, hub.port, XACT_POS_ALL, self.complete_split) | HcSplt::SPLTENA,
            None => HcSplt::empty(),
        };
        regs.write(offsets::hcsplt(ch), hcsplt.bits());

        let setup = ChannelSetup {
            ep_type: plan.ep_type,
            is_in: plan.is_in,
            split: config.hub.map(|_| self.complete_split),
            error_state: self.errors.in_error_state(),
            do_ping,
        };
        regs.write(offsets::hcint(ch), u32::MAX);
        regs.write(offsets::hcintmsk(ch), engine.channel_interrupts(&setup).bits());
        regs.set_bits(offsets::HAINTMSK, 1 << ch);

        let first_len = if engine.cpu_moves_data() && !plan.is_in && !do_ping {
            chunk.size.min(mps as u32)
        } else {
            0
        };
        let start = plan.offset as usize;
        let first_packet = if first_len > 0 {
            xfer.buffer.as_slice().get(start..start + first_len as usize)
        } else {
            None
        };
        let job = ChannelJob {
            ch,
            hcchar,
            size: programmed,
            packets: chunk.packets,
            pid: plan.pid.bits(),
            mps,
            dma_addr: xfer.buffer.dma_addr_at(plan.offset),
            do_ping,
            first_packet,
            chain: self.chain.as_mut(),
        };
        engine.arm_channel(regs, job)?;
        if first_len > 0 && first_len < chunk.size {
            // The rest of the chunk goes out from the FIFO-empty interrupt
            let irq = if periodic { GintSts::PTXFEMPTY } else { GintSts::NPTXFEMPTY };
            regs.set_bits(offsets::GINTMSK, irq.bits());
        }

        xfer.chunk = chunk.size;
        xfer.programmed = programmed;
        xfer.packets = chunk.packets;
        xfer.offset = plan.offset;
        xfer.stage_in = plan.is_in;
        xfer.pushed = first_len;
        xfer.received = 0;
        if plan.remaining == 0 && xfer.stage == ControlStage::Data {
            xfer.zlp_sent = true;
        }

        #[cfg(feature = "defmt")]
        defmt::trace!(
            "ch{} armed: {} {} bytes, split={} ping={}",
            ch,
            xfer.stage,
            programmed,
            config.hub.is_some(),
            do_ping
        );
        Ok(())
    }

    fn queue_status(&self, regs: &dyn RegisterAccess) -> (TxSts, GintSts) {
        if self.periodic() {
            (TxSts::from_bits_retain(regs.read(offsets::HPTXSTS)), GintSts::PTXFEMPTY)
        } else {
            (TxSts::from_bits_retain(regs.read(offsets::GNPTXSTS)), GintSts::NPTXFEMPTY)
        }
    }

    /// Request a halt
    ///
    /// Only the first request of a halt cycle touches the hardware; later
    /// calls return the state already in progress. A cancellation overrides
    /// the recorded reason unless the transfer already completed.
    pub(crate) fn halt(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        reason: HaltReason,
        stats: &RecoveryStats,
    ) -> HaltState {
        if self.halt != HaltState::NoHalt {
            if reason == HaltReason::Dequeued && self.halt_reason != Some(HaltReason::Complete) {
                self.halt_reason = Some(reason);
            }
            return self.halt;
        }
        self.halt_reason = Some(reason);

        let ch = self.number();
        let hcchar = HcChar::from_bits_retain(regs.read(offsets::hcchar(ch)));
        if !hcchar.contains(HcChar::CHEN) {
            self.halt = HaltState::Halted;
            return self.halt;
        }

        let engine = cfg.engine();
        if engine.halt_needs_queue_space() {
            let (sts, empty_irq) = self.queue_status(regs);
            if sts.queue_space() == 0 {
                regs.set_bits(offsets::GINTMSK, empty_irq.bits());
                self.halt = HaltState::Queued;
                return self.halt;
            }
        }
        self.write_halt(regs, cfg, hcchar);
        stats.record_halt();
        self.halt = HaltState::Pending;

        #[cfg(feature = "defmt")]
        defmt::debug!("ch{} halt: {}", ch, reason);

        self.halt
    }

    fn write_halt(&self, regs: &dyn RegisterAccess, cfg: &EngineConfig, hcchar: HcChar) {
        let ch = self.number();
        let engine = cfg.engine();
        let mut value = hcchar | HcChar::CHDIS;
        value.set(HcChar::CHEN, engine.halt_sets_enable());
        if engine.cpu_moves_data() {
            // Only the halt confirmation matters from here on
            regs.write(offsets::hcintmsk(ch), HcInt::CHHLTD.bits());
        }
        regs.write(offsets::hcchar(ch), value.bits());
    }

    /// Issue a halt that was waiting for queue space; true once written
    pub(crate) fn retry_queued_halt(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        stats: &RecoveryStats,
    ) -> bool {
        if self.halt != HaltState::Queued {
            return false;
        }
        let (sts, _) = self.queue_status(regs);
        if sts.queue_space() == 0 {
            return false;
        }
        let hcchar = HcChar::from_bits_retain(regs.read(offsets::hcchar(self.number())));
        self.write_halt(regs, cfg, hcchar);
        stats.record_halt();
        self.halt = HaltState::Pending;
        true
    }

    /// A halt already reached the Halted state without an interrupt
    pub(crate) fn resolve_if_halted(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        stats: &RecoveryStats,
    ) -> ChannelEvent {
        if self.halt != HaltState::Halted || self.xfer.is_none() {
            return ChannelEvent::None;
        }
        let reason = self.halt_reason.take().unwrap_or(HaltReason::Dequeued);
        self.resolve(regs, cfg, reason, stats)
    }

    /// Service this channel's bit in HAINT
    pub(crate) fn on_interrupt(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        stats: &RecoveryStats,
    ) -> ChannelEvent {
        let ch = self.number();
        let raw = HcInt::from_bits_retain(regs.read(offsets::hcint(ch)));
        let mask = HcInt::from_bits_retain(regs.read(offsets::hcintmsk(ch)));
        regs.write(offsets::hcint(ch), raw.bits());
        if self.xfer.is_none() {
            return ChannelEvent::None;
        }

        if raw.contains(HcInt::CHHLTD) {
            self.halt = HaltState::Halted;
            let reason = match self.halt_reason.take() {
                Some(reason) => reason,
                None => reason_from(raw),
            };
            return self.resolve(regs, cfg, reason, stats);
        }
        if cfg.mode.uses_dma() {
            if raw.contains(HcInt::AHBERR) {
                self.halt(regs, cfg, HaltReason::AhbError, stats);
            }
            return ChannelEvent::None;
        }
        self.on_transaction(regs, cfg, raw & mask, stats);
        ChannelEvent::None
    }

    /// Slave mode: the core reports each handshake and the CPU halts
    fn on_transaction(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig, pending: HcInt, stats: &RecoveryStats) {
        let reason = if pending.contains(HcInt::XFERCOMPL) {
            HaltReason::Complete
        } else if pending.contains(HcInt::STALL) {
            HaltReason::Stall
        } else if pending.contains(HcInt::BBLERR) {
            HaltReason::Babble
        } else if pending.contains(HcInt::AHBERR) {
            HaltReason::AhbError
        } else if pending.contains(HcInt::FRMOVRUN) {
            HaltReason::FrameOverrun
        } else if pending.contains(HcInt::XACTERR) {
            HaltReason::TransactionError
        } else if pending.contains(HcInt::DATATGLERR) {
            HaltReason::DataToggleError
        } else if pending.contains(HcInt::NYET) {
            if self.complete_split && self.periodic() {
                // Hub has no data yet: repeat the complete split next frame
                self.rearm_next_frame(regs);
                return;
            }
            HaltReason::Nyet
        } else if pending.contains(HcInt::NAK) {
            HaltReason::Nak
        } else if pending.contains(HcInt::ACK) {
            if !self.split() && !self.do_ping {
                // Recovery handshake after an error, the transfer keeps running
                self.errors.clear();
                regs.clear_bits(offsets::hcintmsk(self.number()), HcInt::ACK.bits());
                return;
            }
            HaltReason::Ack
        } else {
            return;
        };
        self.halt(regs, cfg, reason, stats);
    }

    /// Re-enable the channel for the next (micro)frame without halting
    fn rearm_next_frame(&self, regs: &dyn RegisterAccess) {
        let ch = self.number();
        let mut hcchar = HcChar::from_bits_retain(regs.read(offsets::hcchar(ch)));
        hcchar.remove(HcChar::CHDIS);
        hcchar.insert(HcChar::CHEN);
        hcchar.set(HcChar::ODDFRM, Hfnum(regs.read(offsets::HFNUM)).next_is_odd());
        regs.write(offsets::hcchar(ch), hcchar.bits());
    }

    /// Bytes the last programming moved, updating the data toggle
    fn collect(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig) -> u32 {
        let ch = self.number();
        let mps = self.config.map_or(1, |c| c.mps().max(1) as u32);
        let Some(xfer) = self.xfer.as_mut() else {
            return 0;
        };
        let moved = if cfg.mode == DmaMode::DescriptorDma {
            let residual = self.chain.as_mut().map_or(xfer.programmed, |c| c.complete_host().residual);
            let moved = xfer.programmed.saturating_sub(residual);
            if xfer.stage == ControlStage::Data {
                // A zero-length packet still flips the toggle
                let packets = if xfer.chunk == 0 { 1 } else { moved.div_ceil(mps) };
                self.pid = self.pid.advance(packets);
            }
            moved
        } else {
            let tsiz = HcTsiz::from_bits_retain(regs.read(offsets::hctsiz(ch)));
            if xfer.stage == ControlStage::Data {
                self.pid = DataPid::from_bits(tsiz.pid());
            }
            if xfer.stage_in {
                xfer.programmed.saturating_sub(tsiz.xfersize())
            } else {
                (xfer.packets.saturating_sub(tsiz.pktcnt()) * mps).min(xfer.chunk)
            }
        };
        if xfer.stage_in && moved > 0 {
            if let Some(window) = xfer.buffer.window(xfer.offset as usize, moved as usize) {
                window.sync_for_cpu();
            }
        }
        moved
    }

    /// Turn a confirmed halt into the next step
    fn resolve(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        reason: HaltReason,
        stats: &RecoveryStats,
    ) -> ChannelEvent {
        let moved = self.collect(regs, cfg);
        let in_data = self.xfer.as_ref().is_some_and(|x| x.stage == ControlStage::Data);
        let data_moved = if in_data { moved } else { 0 };
        let high_speed_out = self.config.is_some_and(|c| c.speed == UsbSpeed::High)
            && self.xfer.as_ref().is_some_and(|x| !x.stage_in);

        match reason {
            HaltReason::Complete => {
                self.errors.clear();
                self.complete_split = false;
                self.advance(regs, cfg, moved)
            }
            HaltReason::Ack => {
                self.errors.clear();
                if self.split() && !self.complete_split {
                    self.complete_split = true;
                } else if self.do_ping {
                    self.do_ping = false;
                } else {
                    self.add_progress(data_moved);
                }
                self.rearm(regs, cfg)
            }
            HaltReason::Nak => {
                self.errors.clear();
                if self.split() {
                    self.complete_split = false;
                } else {
                    self.add_progress(data_moved);
                    if high_speed_out {
                        self.do_ping = true;
                    }
                }
                self.rearm(regs, cfg)
            }
            HaltReason::Nyet => {
                self.errors.clear();
                if !self.split() {
                    // Packet accepted, the device is short on room for more
                    self.add_progress(data_moved);
                    if high_speed_out {
                        self.do_ping = true;
                    }
                }
                self.rearm(regs, cfg)
            }
            HaltReason::TransactionError
            | HaltReason::FrameOverrun
            | HaltReason::DataToggleError
            | HaltReason::Babble
            | HaltReason::AhbError
            | HaltReason::Stall => {
                let Some(error) = reason.fault() else {
                    return ChannelEvent::None;
                };
                if error == ErrorType::DataToggle {
                    self.errors.clear();
                }
                match self.errors.strike(error, stats) {
                    RecoveryAction::Retry => {
                        if self.split() {
                            self.complete_split = false;
                        } else {
                            self.add_progress(data_moved);
                            if high_speed_out && error == ErrorType::TransactionError {
                                self.do_ping = true;
                            }
                        }
                        self.rearm(regs, cfg)
                    }
                    RecoveryAction::ResetEndpoint => {
                        self.add_progress(data_moved);
                        self.pid = DataPid::Data0;
                        self.retire(TransferStatus::Error(error.as_error()))
                    }
                    RecoveryAction::HaltChannel | RecoveryAction::Fatal => {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("ch{}: {} ends transfer after {} strikes", self.num, error, self.errors.count());
                        self.add_progress(data_moved);
                        self.retire(TransferStatus::Error(error.as_error()))
                    }
                }
            }
            HaltReason::Dequeued => {
                self.add_progress(data_moved);
                self.retire(TransferStatus::Cancelled)
            }
        }
    }

    fn add_progress(&mut self, moved: u32) {
        if let Some(xfer) = self.xfer.as_mut() {
            xfer.done = (xfer.done + moved).min(xfer.length);
        }
    }

    /// A stage completed: program the next one or finish
    fn advance(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig, moved: u32) -> ChannelEvent {
        let control = self.config.is_some_and(|c| c.ep_type == TransferType::Control);
        let mps = self.config.map_or(0, |c| c.mps());
        let Some(xfer) = self.xfer.as_mut() else {
            return ChannelEvent::None;
        };
        match xfer.stage {
            ControlStage::Setup => {
                self.pid = DataPid::Data1;
                xfer.stage = if xfer.length > 0 {
                    ControlStage::Data
                } else {
                    ControlStage::Status
                };
                self.rearm(regs, cfg)
            }
            ControlStage::Data => {
                let short = xfer.stage_in && moved < xfer.chunk;
                xfer.done = (xfer.done + moved).min(xfer.length);
                let finished = short || xfer.zlp_sent || xfer.done >= xfer.length;
                if !finished {
                    return self.rearm(regs, cfg);
                }
                if !control && !xfer.stage_in && !xfer.zlp_sent && needs_zlp(xfer.length, mps, xfer.zero) {
                    xfer.zlp_sent = true;
                    return self.rearm(regs, cfg);
                }
                if control {
                    xfer.stage = ControlStage::Status;
                    return self.rearm(regs, cfg);
                }
                self.retire(TransferStatus::Complete)
            }
            ControlStage::Status => self.retire(TransferStatus::Complete),
        }
    }

    fn rearm(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig) -> ChannelEvent {
        self.halt = HaltState::NoHalt;
        self.halt_reason = None;
        match self.program(regs, cfg) {
            Ok(()) => ChannelEvent::None,
            Err(e) => self.retire(TransferStatus::Error(e)),
        }
    }

    fn retire(&mut self, status: TransferStatus) -> ChannelEvent {
        self.halt = HaltState::NoHalt;
        self.halt_reason = None;
        self.complete_split = false;
        match self.xfer.take() {
            Some(xfer) => ChannelEvent::Retired(Retired {
                handle: xfer.handle,
                actual: xfer.actual(),
                buffer: xfer.buffer,
                status,
            }),
            None => ChannelEvent::None,
        }
    }

    /// Slave mode: push more OUT packets; true while data remains
    pub(crate) fn continue_out(&mut self, regs: &dyn RegisterAccess) -> bool {
        let ch = self.number();
        let mps = self.config.map_or(0, |c| c.mps() as u32);
        let sts_offset = if self.periodic() {
            offsets::HPTXSTS
        } else {
            offsets::GNPTXSTS
        };
        let Some(xfer) = self.xfer.as_mut() else {
            return false;
        };
        if xfer.stage_in || mps == 0 || self.halt != HaltState::NoHalt {
            return false;
        }
        while xfer.pushed < xfer.chunk {
            let len = (xfer.chunk - xfer.pushed).min(mps);
            let sts = TxSts::from_bits_retain(regs.read(sts_offset));
            if sts.queue_space() == 0 || sts.fifo_space() < words(len) {
                return true;
            }
            let start = (xfer.offset + xfer.pushed) as usize;
            match xfer.buffer.as_slice().get(start..start + len as usize) {
                Some(packet) => write_fifo(regs, ch, packet),
                None => return false,
            }
            xfer.pushed += len;
        }
        false
    }

    /// Slave mode: drain one received IN packet from the RX FIFO
    pub(crate) fn receive_packet(&mut self, regs: &dyn RegisterAccess, bcnt: u32) {
        let count = bcnt as usize;
        let Some(xfer) = self.xfer.as_mut() else {
            let mut sink = [0u8; 0];
            read_fifo(regs, &mut sink, count);
            return;
        };
        let start = (xfer.offset + xfer.received) as usize;
        let end = (start + count).min(xfer.buffer.len());
        let slice = xfer.buffer.as_mut_slice();
        read_fifo(regs, &mut slice[start.min(end)..end], count);
        xfer.received += bcnt;
    }

    /// Stop the channel without waiting for the halt, dropping the transfer
    pub(crate) fn abort(&mut self, regs: &dyn RegisterAccess) -> Option<ChannelTransfer> {
        let ch = self.number();
        let hcchar = HcChar::from_bits_retain(regs.read(offsets::hcchar(ch)));
        if hcchar.contains(HcChar::CHEN) {
            regs.write(offsets::hcchar(ch), ((hcchar | HcChar::CHDIS) - HcChar::CHEN).bits());
        }
        if let Some(chain) = self.chain.as_mut() {
            if chain.is_armed() {
                chain.abandon();
            }
        }
        self.halt = HaltState::NoHalt;
        self.halt_reason = None;
        self.complete_split = false;
        self.xfer.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::TransferPool;
    use crate::dwc::register::mock::MockRegisters;
    use crate::host::HubPort;
    use crate::transfer::{TransferLimits, TransferRequest};
    use std::boxed::Box;

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

    fn buffer(len: usize) -> DmaBuffer {
        DmaBuffer::from_static(Box::leak(std::vec![0u8; len].into_boxed_slice()))
    }

    fn handle() -> TransferHandle {
        let mut pool: TransferPool<1> = TransferPool::new();
        pool.alloc(TransferRequest::new(DmaBuffer::empty(), 0, false, 0)).unwrap()
    }

    fn channel(config: PipeConfig) -> HostChannel {
        let mut ch = HostChannel::new(1);
        ch.assign(config, DataPid::Data0, false);
        ch
    }

    fn bulk_in() -> PipeConfig {
        PipeConfig::new(3, 0x81, TransferType::Bulk, 512, 0, UsbSpeed::High)
    }

    #[test]
    fn test_halt_is_idempotent() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::BufferDma);
        let stats = RecoveryStats::new();
        let mut ch = channel(bulk_in());
        ch.start(&regs, &c, ChannelTransfer::new(handle(), buffer(512), 512, false, false))
            .unwrap();
        regs.clear_log();

        assert_eq!(ch.halt(&regs, &c, HaltReason::Dequeued, &stats), HaltState::Pending);
        assert_eq!(ch.halt(&regs, &c, HaltReason::Dequeued, &stats), HaltState::Pending);
        assert_eq!(regs.writes_to(offsets::hcchar(1)).len(), 1);
        assert_eq!(stats.halts(), 1);
        let written = HcChar::from_bits_retain(regs.get(offsets::hcchar(1)));
        assert!(written.contains(HcChar::CHDIS | HcChar::CHEN));

        regs.set(offsets::hcint(1), HcInt::CHHLTD.bits());
        match ch.on_interrupt(&regs, &c, &stats) {
            ChannelEvent::Retired(r) => assert_eq!(r.status, TransferStatus::Cancelled),
            ChannelEvent::None => panic!("expected retirement"),
        }
        // A second halted interrupt finds nothing to complete
        regs.set(offsets::hcint(1), HcInt::CHHLTD.bits());
        assert!(matches!(ch.on_interrupt(&regs, &c, &stats), ChannelEvent::None));
    }

    #[test]
    fn test_descriptor_dma_halt_clears_enable() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::DescriptorDma);
        let stats = RecoveryStats::new();
        let mut ch = channel(bulk_in());
        let descs: std::vec::Vec<_> = (0..4).map(|_| crate::dma::DmaDescriptor::new()).collect();
        ch.chain = Some(DescriptorChain::new(Box::leak(descs.into_boxed_slice())).unwrap());
        ch.start(&regs, &c, ChannelTransfer::new(handle(), buffer(512), 512, false, false))
            .unwrap();
        ch.halt(&regs, &c, HaltReason::Dequeued, &stats);
        let written = HcChar::from_bits_retain(regs.get(offsets::hcchar(1)));
        assert!(written.contains(HcChar::CHDIS));
        assert!(!written.contains(HcChar::CHEN));
    }

    #[test]
    fn test_slave_halt_waits_for_queue_space() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::Slave);
        let stats = RecoveryStats::new();
        let mut ch = channel(bulk_in());
        ch.start(&regs, &c, ChannelTransfer::new(handle(), buffer(512), 512, false, false))
            .unwrap();
        regs.set(offsets::GNPTXSTS, 0x0000_0100);
        assert_eq!(ch.halt(&regs, &c, HaltReason::Dequeued, &stats), HaltState::Queued);
        assert_ne!(regs.get(offsets::GINTMSK) & GintSts::NPTXFEMPTY.bits(), 0);
        assert!(!HcChar::from_bits_retain(regs.get(offsets::hcchar(1))).contains(HcChar::CHDIS));

        regs.set(offsets::GNPTXSTS, 0x0008_0100);
        assert!(ch.retry_queued_halt(&regs, &c, &stats));
        assert_eq!(ch.halt_state(), HaltState::Pending);
        assert!(HcChar::from_bits_retain(regs.get(offsets::hcchar(1))).contains(HcChar::CHDIS));
    }

    #[test]
    fn test_three_transaction_errors_then_failure() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::BufferDma);
        let stats = RecoveryStats::new();
        let mut ch = channel(bulk_in());
        ch.start(&regs, &c, ChannelTransfer::new(handle(), buffer(512), 512, false, false))
            .unwrap();
        regs.set(offsets::hctsiz(1), HcTsiz::new(512, 1, 0).bits());

        for strike in 1..=3 {
            regs.set(offsets::hcint(1), (HcInt::CHHLTD | HcInt::XACTERR).bits());
            assert!(matches!(ch.on_interrupt(&regs, &c, &stats), ChannelEvent::None));
            assert_eq!(ch.error_count(), strike);
            // Re-armed with ACK unmasked to catch the recovery
            let mask = HcInt::from_bits_retain(regs.get(offsets::hcintmsk(1)));
            assert!(mask.contains(HcInt::ACK));
        }
        regs.set(offsets::hcint(1), (HcInt::CHHLTD | HcInt::XACTERR).bits());
        match ch.on_interrupt(&regs, &c, &stats) {
            ChannelEvent::Retired(r) => {
                assert_eq!(r.status, TransferStatus::Error(UsbError::TransactionError));
            }
            ChannelEvent::None => panic!("fourth error should end the transfer"),
        }
    }

    #[test]
    fn test_complete_split_nyet_retries_next_frame() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::Slave);
        let stats = RecoveryStats::new();
        let config = PipeConfig::new(5, 0x81, TransferType::Interrupt, 8, 1, UsbSpeed::Full).with_hub(HubPort {
            hub_addr: 2,
            port: 3,
        });
        let mut ch = channel(config);
        regs.set(offsets::HPTXSTS, 0x0008_0100);
        ch.start(&regs, &c, ChannelTransfer::new(handle(), buffer(8), 8, false, false))
            .unwrap();

        // Start split acknowledged by the hub
        regs.set(offsets::hcint(1), HcInt::ACK.bits());
        ch.on_interrupt(&regs, &c, &stats);
        assert_eq!(ch.halt_state(), HaltState::Pending);
        regs.set(offsets::hcint(1), HcInt::CHHLTD.bits());
        ch.on_interrupt(&regs, &c, &stats);
        assert!(ch.is_complete_split());
        assert!(HcSplt::from_bits_retain(regs.get(offsets::hcsplt(1))).contains(HcSplt::COMPSPLT));

        // Hub not ready: same complete split, next frame, no halt
        regs.clear_log();
        regs.set(offsets::HFNUM, 6);
        regs.set(offsets::hcint(1), HcInt::NYET.bits());
        let halts = stats.halts();
        ch.on_interrupt(&regs, &c, &stats);
        assert_eq!(ch.halt_state(), HaltState::NoHalt);
        assert_eq!(stats.halts(), halts);
        assert_eq!(ch.error_count(), 0);
        let hcchar = HcChar::from_bits_retain(regs.get(offsets::hcchar(1)));
        assert!(hcchar.contains(HcChar::CHEN | HcChar::ODDFRM));
        assert!(!hcchar.contains(HcChar::CHDIS));
        assert!(ch.is_complete_split());
    }

    #[test]
    fn test_control_transfer_walks_stages() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::BufferDma);
        let stats = RecoveryStats::new();
        let config = PipeConfig::new(0, 0x00, TransferType::Control, 64, 0, UsbSpeed::High);
        let mut ch = channel(config);
        let mut buf = buffer(8 + 64);
        buf.as_mut_slice()[..8].copy_from_slice(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        ch.start(&regs, &c, ChannelTransfer::new(handle(), buf, 18, false, true))
            .unwrap();
        let tsiz = HcTsiz::from_bits_retain(regs.get(offsets::hctsiz(1)));
        assert_eq!(tsiz.pid(), DataPid::MdataSetup.bits());
        assert_eq!(tsiz.xfersize(), 8);

        // SETUP done, data stage IN with DATA1
        regs.set(offsets::hctsiz(1), HcTsiz::new(0, 0, 3).bits());
        regs.set(offsets::hcint(1), (HcInt::CHHLTD | HcInt::XFERCOMPL).bits());
        ch.on_interrupt(&regs, &c, &stats);
        let hcchar = HcChar::from_bits_retain(regs.get(offsets::hcchar(1)));
        assert!(hcchar.contains(HcChar::EPDIR));
        let tsiz = HcTsiz::from_bits_retain(regs.get(offsets::hctsiz(1)));
        assert_eq!(tsiz.pid(), DataPid::Data1.bits());
        assert_eq!(tsiz.xfersize(), 64);

        // 18 bytes arrived, short packet ends the data stage
        regs.set(offsets::hctsiz(1), HcTsiz::new(64 - 18, 0, 0).bits());
        regs.set(offsets::hcint(1), (HcInt::CHHLTD | HcInt::XFERCOMPL).bits());
        ch.on_interrupt(&regs, &c, &stats);
        let hcchar = HcChar::from_bits_retain(regs.get(offsets::hcchar(1)));
        assert!(!hcchar.contains(HcChar::EPDIR), "status stage is OUT");

        regs.set(offsets::hcint(1), (HcInt::CHHLTD | HcInt::XFERCOMPL).bits());
        match ch.on_interrupt(&regs, &c, &stats) {
            ChannelEvent::Retired(r) => {
                assert_eq!(r.status, TransferStatus::Complete);
                assert_eq!(r.actual, 18);
            }
            ChannelEvent::None => panic!("expected completion"),
        }
    }

    #[test]
    fn test_high_speed_out_nak_enables_ping() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::BufferDma);
        let stats = RecoveryStats::new();
        let config = PipeConfig::new(3, 0x02, TransferType::Bulk, 512, 0, UsbSpeed::High);
        let mut ch = channel(config);
        ch.start(&regs, &c, ChannelTransfer::new(handle(), buffer(1024), 1024, false, false))
            .unwrap();
        regs.set(offsets::hctsiz(1), HcTsiz::new(1024, 1, 2).bits());
        regs.set(offsets::hcint(1), (HcInt::CHHLTD | HcInt::NAK).bits());
        ch.on_interrupt(&regs, &c, &stats);
        assert!(ch.ping_pending());
        let tsiz = HcTsiz::from_bits_retain(regs.get(offsets::hctsiz(1)));
        assert!(tsiz.contains(HcTsiz::DOPNG));
        // One packet went through before the NAK, toggle resumes at DATA1
        assert_eq!(tsiz.xfersize(), 512);
        assert_eq!(tsiz.pid(), DataPid::Data1.bits());
    }

    #[test]
    fn test_stall_resets_toggle() {
        let regs = MockRegisters::new();
        let c = cfg(DmaMode::BufferDma);
        let stats = RecoveryStats::new();
        let mut ch = channel(bulk_in());
        ch.start(&regs, &c, ChannelTransfer::new(handle(), buffer(512), 512, false, false))
            .unwrap();
        regs.set(offsets::hctsiz(1), HcTsiz::new(512, 1, 2).bits());
        regs.set(offsets::hcint(1), (HcInt::CHHLTD | HcInt::STALL).bits());
        match ch.on_interrupt(&regs, &c, &stats) {
            ChannelEvent::Retired(r) => assert_eq!(r.status, TransferStatus::Error(UsbError::Stall)),
            ChannelEvent::None => panic!("stall should end the transfer"),
        }
        assert_eq!(ch.data_pid(), DataPid::Data0);
    }

    #[test]
    fn test_halt_reason_fault_class() {
        let halted = HcInt::CHHLTD | HcInt::XACTERR | HcInt::AHBERR;
        assert_eq!(reason_from(halted).fault(), Some(ErrorType::AhbError));
        assert_eq!(reason_from(HcInt::CHHLTD | HcInt::DATATGLERR).fault(), Some(ErrorType::DataToggle));
        assert_eq!(reason_from(HcInt::CHHLTD | HcInt::XFERCOMPL).fault(), None);
        assert_eq!(HaltReason::Nak.fault(), None);
        assert_eq!(HaltReason::Dequeued.fault(), None);
    }
}
