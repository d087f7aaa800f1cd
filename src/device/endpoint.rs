//! Device endpoint transfer engine
//!
//! An endpoint owns at most one active transfer and a FIFO of queued request
//! handles. A transfer is programmed in chunks that fit the transfer size
//! registers; each transfer-complete interrupt either programs the next chunk,
//! the trailing zero-length packet, or finishes the transfer.

use crate::device::config::EndpointConfig;
use crate::dma::{DescriptorChain, DmaBuffer, TransferHandle};
use crate::dwc::{offsets, DepCtl, RegisterAccess, TxSts};
use crate::error::{Result, UsbError};
use crate::mode::{read_fifo, words, write_fifo, EndpointJob, EngineConfig};
use crate::transfer::{needs_zlp, Direction, TransferType};
use heapless::Deque;

/// Requests that may wait behind the active one
pub const ENDPOINT_QUEUE_DEPTH: usize = 8;

/// Endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointState {
    /// Not part of the current configuration
    Disabled,
    /// Enabled, nothing in flight
    Idle,
    /// A transfer is programmed
    Active,
    /// Disable requested, waiting for the endpoint-disabled interrupt
    HaltPending,
    /// Functional stall
    Stalled,
}

/// In-flight transfer bookkeeping
#[derive(Debug)]
pub(crate) struct ActiveTransfer {
    pub handle: Option<TransferHandle>,
    pub buffer: DmaBuffer,
    pub length: u32,
    pub done: u32,
    pub chunk: u32,
    pub programmed: u32,
    pub zero: bool,
    pub zlp_sent: bool,
    pub pushed: u32,
    pub received: u32,
}

/// A transfer leaving the endpoint
#[derive(Debug)]
pub struct Finished {
    /// Pool handle, `None` for internal EP0 stages
    pub handle: Option<TransferHandle>,
    /// Buffer handed back to the owner
    pub buffer: DmaBuffer,
    /// Bytes moved
    pub actual: u32,
}

/// Result of a transfer-complete interrupt
#[derive(Debug)]
pub enum Progress {
    /// Another chunk or the zero-length packet was programmed
    Continue,
    /// The transfer is finished
    Done(Finished),
}

/// One device endpoint in one direction
#[derive(Debug)]
pub struct Endpoint {
    num: u8,
    dir: Direction,
    ep_type: TransferType,
    mps: u16,
    transactions: u32,
    interval: u8,
    tx_fifo: u8,
    state: EndpointState,
    pub(crate) active: Option<ActiveTransfer>,
    queue: Deque<TransferHandle, ENDPOINT_QUEUE_DEPTH>,
    pub(crate) chain: Option<DescriptorChain>,
    cancel_pending: bool,
}

impl Endpoint {
    /// Disabled endpoint `num`
    pub const fn new(num: u8, dir: Direction) -> Self {
        Self {
            num,
            dir,
            ep_type: if num == 0 {
                TransferType::Control
            } else {
                TransferType::Bulk
            },
            mps: 64,
            transactions: 1,
            interval: 0,
            tx_fifo: 0,
            state: EndpointState::Disabled,
            active: None,
            queue: Deque::new(),
            chain: None,
            cancel_pending: false,
        }
    }

    /// Endpoint number
    pub fn number(&self) -> usize {
        self.num as usize
    }

    /// Endpoint address with the direction bit
    pub fn address(&self) -> u8 {
        match self.dir {
            Direction::In => self.num | 0x80,
            Direction::Out => self.num,
        }
    }

    /// Direction
    pub fn direction(&self) -> Direction {
        self.dir
    }

    /// Transfer type
    pub fn ep_type(&self) -> TransferType {
        self.ep_type
    }

    /// Max packet size
    pub fn mps(&self) -> u16 {
        self.mps
    }

    /// Transactions per microframe
    pub fn transactions(&self) -> u32 {
        self.transactions
    }

    /// bInterval
    pub fn interval(&self) -> u8 {
        self.interval
    }

    /// Assigned Tx FIFO (IN only, 0 for the non-periodic FIFO)
    pub fn tx_fifo(&self) -> u8 {
        self.tx_fifo
    }

    /// Current state
    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Enabled as part of the configuration
    pub fn is_enabled(&self) -> bool {
        self.state != EndpointState::Disabled
    }

    /// Functionally halted
    pub fn is_stalled(&self) -> bool {
        self.state == EndpointState::Stalled
    }

    /// A transfer is programmed
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// Requests waiting behind the active one
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Attach the descriptor list used in descriptor DMA mode
    pub fn set_chain(&mut self, chain: DescriptorChain) {
        self.chain = Some(chain);
    }

    fn ctl(&self) -> usize {
        match self.dir {
            Direction::In => offsets::diepctl(self.number()),
            Direction::Out => offsets::doepctl(self.number()),
        }
    }

    fn daint_bit(&self) -> u32 {
        match self.dir {
            Direction::In => 1 << self.num,
            Direction::Out => 1 << (16 + self.num),
        }
    }

    /// Enable the endpoint for `config`
    pub(crate) fn activate(&mut self, regs: &dyn RegisterAccess, config: &EndpointConfig, tx_fifo: u8) -> Result<()> {
        if self.num == 0 || config.mps() == 0 {
            return Err(UsbError::InvalidParameter);
        }
        if self.is_enabled() {
            return Err(UsbError::InvalidState);
        }
        self.ep_type = config.ep_type;
        self.mps = config.mps();
        self.transactions = config.transactions();
        self.interval = config.interval;
        self.tx_fifo = tx_fifo;

        let mut ctl = DepCtl::from_bits_retain(regs.read(self.ctl()));
        if !ctl.contains(DepCtl::USBACTEP) {
            ctl = ctl.with_mps(self.mps as u32).with_type(self.ep_type.bits());
            if self.dir == Direction::In {
                ctl = ctl.with_txfnum(tx_fifo as u32);
            }
            ctl |= DepCtl::SETD0PID | DepCtl::USBACTEP;
            regs.write(self.ctl(), ctl.bits());
        }
        regs.set_bits(offsets::DAINTMSK, self.daint_bit());
        self.state = EndpointState::Idle;

        #[cfg(feature = "defmt")]
        defmt::debug!("EP {:02x} activated, mps {} fifo {}", self.address(), self.mps, tx_fifo);
        Ok(())
    }

    /// Program EP0 for the enumerated speed
    pub(crate) fn activate_ep0(&mut self, regs: &dyn RegisterAccess, mps: u16) {
        self.mps = mps;
        self.ep_type = TransferType::Control;
        if self.dir == Direction::In {
            let code = if mps == 8 { DepCtl::EP0_MPS_8 } else { DepCtl::EP0_MPS_64 };
            regs.modify_bits(self.ctl(), DepCtl::MPS_MASK.bits(), code);
        }
        regs.set_bits(offsets::DAINTMSK, self.daint_bit());
        self.state = EndpointState::Idle;
    }

    /// Disable the endpoint, returning the Tx FIFO it held
    pub(crate) fn deactivate(&mut self, regs: &dyn RegisterAccess) -> u8 {
        let mut ctl = DepCtl::from_bits_retain(regs.read(self.ctl()));
        if ctl.contains(DepCtl::EPENA) {
            ctl |= DepCtl::EPDIS | DepCtl::SNAK;
        }
        ctl.remove(DepCtl::USBACTEP);
        regs.write(self.ctl(), ctl.bits());
        regs.clear_bits(offsets::DAINTMSK, self.daint_bit());
        if let Some(chain) = self.chain.as_mut() {
            chain.abandon();
        }
        self.state = EndpointState::Disabled;
        self.cancel_pending = false;
        core::mem::replace(&mut self.tx_fifo, 0)
    }

    /// Queue a pooled request behind the active one
    pub(crate) fn enqueue(&mut self, handle: TransferHandle) -> Result<()> {
        self.queue.push_back(handle).map_err(|_| UsbError::NoResources)
    }

    /// Next queued request
    pub(crate) fn dequeue(&mut self) -> Option<TransferHandle> {
        self.queue.pop_front()
    }

    /// Drop `handle` from the queue, returning true if it was there
    pub(crate) fn remove_queued(&mut self, handle: TransferHandle) -> bool {
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

    /// Bytes an OUT buffer needs for a transfer of `length`
    pub fn out_capacity(&self, length: u32, zero: bool) -> usize {
        let mps = self.mps.max(1) as u32;
        let mut need = length.div_ceil(mps) * mps;
        if length == 0 || needs_zlp(length, self.mps, zero) {
            need += mps;
        }
        need as usize
    }

    /// Start a transfer
    pub(crate) fn start(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        handle: Option<TransferHandle>,
        buffer: DmaBuffer,
        length: u32,
        zero: bool,
    ) -> core::result::Result<(), (UsbError, DmaBuffer)> {
        if self.active.is_some() {
            return Err((UsbError::TransferActive, buffer));
        }
        match self.state {
            EndpointState::Disabled | EndpointState::HaltPending => return Err((UsbError::InvalidState, buffer)),
            EndpointState::Stalled => return Err((UsbError::EndpointHalted, buffer)),
            _ => {}
        }
        if (buffer.len() as u32) < length {
            return Err((UsbError::BufferOverflow, buffer));
        }
        if self.dir == Direction::Out && buffer.len() < self.out_capacity(length, zero) {
            return Err((UsbError::InvalidParameter, buffer));
        }
        self.active = Some(ActiveTransfer {
            handle,
            buffer,
            length,
            done: 0,
            chunk: 0,
            programmed: 0,
            zero,
            zlp_sent: false,
            pushed: 0,
            received: 0,
        });
        self.state = EndpointState::Active;
        if let Err(e) = self.program(regs, cfg) {
            self.state = EndpointState::Idle;
            let buffer = self.active.take().map(|a| a.buffer).unwrap_or(DmaBuffer::empty());
            return Err((e, buffer));
        }
        Ok(())
    }

    /// Program the next chunk of the active transfer
    fn program(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig) -> Result<()> {
        let num = self.number();
        let (dir, ep_type, mps) = (self.dir, self.ep_type, self.mps);
        let active = self.active.as_mut().ok_or(UsbError::InvalidState)?;
        let remaining = active.length - active.done;
        if remaining == 0 && active.done > 0 {
            active.zlp_sent = true;
        }
        if dir == Direction::In {
            if let Some(window) = active.buffer.window(active.done as usize, remaining as usize) {
                window.sync_for_device();
            }
        }

        let job = EndpointJob {
            num,
            dir,
            ep_type,
            mps,
            length: remaining,
            dma_addr: active.buffer.dma_addr_at(active.done),
            chain: self.chain.as_mut(),
        };
        let armed = cfg.engine().arm_endpoint(regs, cfg, job)?;
        active.chunk = armed.size;
        active.programmed = match dir {
            Direction::In => armed.size,
            Direction::Out => armed.packets * mps.max(1) as u32,
        };
        active.pushed = 0;
        active.received = 0;

        if cfg.engine().cpu_moves_data() && dir == Direction::In && armed.size > 0 && !cfg.dedicated_fifos {
            // Shared FIFO: the first packets go in right away
            self.fill_tx_fifo(regs, cfg);
        }
        Ok(())
    }

    /// Handle transfer-complete for this endpoint
    pub(crate) fn complete_chunk(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig) -> Result<Progress> {
        let num = self.number();
        let dir = self.dir;
        let mps = self.mps.max(1) as u32;
        let residual = {
            let chain = self.chain.as_mut();
            cfg.engine().endpoint_residual(regs, num, dir, chain)
        };
        let active = self.active.as_mut().ok_or(UsbError::InvalidState)?;

        let moved = active.programmed.saturating_sub(residual);
        let short = dir == Direction::Out && moved < active.programmed;
        let capacity = active.buffer.len() as u32;
        active.done = (active.done + moved).min(capacity);
        if dir == Direction::Out {
            if let Some(window) = active.buffer.window(0, active.done as usize) {
                window.sync_for_cpu();
            }
        }

        let finished = if active.zlp_sent {
            true
        } else if short || active.done >= active.length {
            !(active.done == active.length && needs_zlp(active.length, mps as u16, active.zero) && !short)
        } else {
            false
        };

        if finished {
            return Ok(Progress::Done(self.finish()));
        }
        self.program(regs, cfg)?;
        Ok(Progress::Continue)
    }

    fn finish(&mut self) -> Finished {
        self.state = EndpointState::Idle;
        match self.active.take() {
            Some(a) => Finished {
                handle: a.handle,
                actual: a.done.min(a.length),
                buffer: a.buffer,
            },
            None => Finished {
                handle: None,
                buffer: DmaBuffer::empty(),
                actual: 0,
            },
        }
    }

    /// Push pending IN packets while the Tx FIFO has room; true once the chunk is in
    pub(crate) fn fill_tx_fifo(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig) -> bool {
        let num = self.number();
        let mps = self.mps.max(1) as u32;
        let periodic = self.ep_type.is_periodic();
        let Some(active) = self.active.as_mut() else {
            return true;
        };

        while active.pushed < active.chunk {
            let len = (active.chunk - active.pushed).min(mps);
            let space = if cfg.dedicated_fifos {
                TxSts::from_bits_retain(regs.read(offsets::dtxfsts(num))).fifo_space()
            } else if periodic {
                u32::MAX
            } else {
                TxSts::from_bits_retain(regs.read(offsets::GNPTXSTS)).fifo_space()
            };
            if words(len) > space {
                break;
            }
            let start = (active.done + active.pushed) as usize;
            let end = start + len as usize;
            match active.buffer.as_slice().get(start..end) {
                Some(data) => write_fifo(regs, num, data),
                None => break,
            }
            active.pushed += len;
        }

        let complete = active.pushed >= active.chunk;
        if complete && cfg.dedicated_fifos {
            regs.clear_bits(offsets::DIEPEMPMSK, 1 << num);
        }
        complete
    }

    /// Pop one received OUT packet of `bcnt` bytes from the Rx FIFO
    pub(crate) fn receive_packet(&mut self, regs: &dyn RegisterAccess, bcnt: u32) {
        match self.active.as_mut() {
            Some(active) => {
                let start = ((active.done + active.received) as usize).min(active.buffer.len());
                let data = &mut active.buffer.as_mut_slice()[start..];
                read_fifo(regs, data, bcnt as usize);
                active.received += bcnt;
            }
            None => read_fifo(regs, &mut [], bcnt as usize),
        }
    }

    /// Functional stall
    pub(crate) fn set_stall(&mut self, regs: &dyn RegisterAccess) {
        let mut ctl = DepCtl::from_bits_retain(regs.read(self.ctl()));
        if self.dir == Direction::In && ctl.contains(DepCtl::EPENA) {
            ctl |= DepCtl::EPDIS;
        }
        ctl |= DepCtl::STALL;
        regs.write(self.ctl(), ctl.bits());
        if self.num != 0 {
            self.state = EndpointState::Stalled;
        }
        #[cfg(feature = "defmt")]
        defmt::debug!("EP {:02x} stalled", self.address());
    }

    /// Clear a functional stall and reset the data toggle
    pub(crate) fn clear_stall(&mut self, regs: &dyn RegisterAccess) {
        let mut ctl = DepCtl::from_bits_retain(regs.read(self.ctl()));
        ctl.remove(DepCtl::STALL);
        if matches!(self.ep_type, TransferType::Bulk | TransferType::Interrupt) {
            ctl |= DepCtl::SETD0PID;
        }
        regs.write(self.ctl(), ctl.bits());
        if self.state == EndpointState::Stalled {
            self.state = if self.active.is_some() {
                EndpointState::Active
            } else {
                EndpointState::Idle
            };
        }
    }

    /// Ask the core to disable the endpoint; completion arrives as EPDISABLED
    ///
    /// Returns false when the endpoint was not enabled in hardware, in which
    /// case no interrupt will follow.
    pub(crate) fn request_disable(&mut self, regs: &dyn RegisterAccess) -> bool {
        if self.cancel_pending {
            return true;
        }
        let ctl = DepCtl::from_bits_retain(regs.read(self.ctl()));
        if !ctl.contains(DepCtl::EPENA) {
            return false;
        }
        regs.write(self.ctl(), (ctl | DepCtl::EPDIS | DepCtl::SNAK).bits());
        self.state = EndpointState::HaltPending;
        self.cancel_pending = true;
        true
    }

    /// The core confirmed the disable
    pub(crate) fn disabled(&mut self) -> Option<Finished> {
        self.cancel_pending = false;
        if self.state == EndpointState::HaltPending {
            self.state = EndpointState::Idle;
        }
        self.abort()
    }

    /// Drop the active transfer without touching the hardware
    pub(crate) fn abort(&mut self) -> Option<Finished> {
        if let Some(chain) = self.chain.as_mut() {
            if chain.is_armed() {
                chain.abandon();
            }
        }
        let active = self.active.take()?;
        if self.state == EndpointState::Active {
            self.state = EndpointState::Idle;
        }
        Some(Finished {
            handle: active.handle,
            actual: active.done.min(active.length),
            buffer: active.buffer,
        })
    }

    /// Handle of the active transfer
    pub fn active_handle(&self) -> Option<TransferHandle> {
        self.active.as_ref().and_then(|a| a.handle)
    }
}
