//! Device (peripheral) mode
//!
//! [`Device`] owns the EP0 control pipe, the endpoint tables and the
//! isochronous streams. Submission calls arrive from the controller inside its
//! critical section; interrupt routines arrive from the dispatcher. Both run
//! against a [`Context`] carrying the register block, the engine
//! configuration, the request pool and the upper-layer handler.

pub mod config;
pub mod control;
pub mod endpoint;
pub mod isochronous;
mod requests;
pub mod txfifo;

pub use config::{Configuration, EndpointConfig, InterfaceConfig};
pub use control::{ControlBuffers, DescriptorKind, Ep0State, Recipient, RequestKind, SetupPacket};
pub use endpoint::{EndpointState, Finished, Progress};
pub use isochronous::{IsoLayout, IsoPacketInfo, IsoScheduler, MAX_ISO_PACKETS};
pub use txfifo::TxFifoAllocator;

use crate::dma::{DescriptorChain, DmaBuffer, TransferHandle};
use crate::dwc::params::MAX_EPS;
use crate::dwc::{
    offsets, CoreParams, Dcfg, Dctl, DepCtl, DiepInt, DoepInt, DmaMode, Dsts, GrxSts, GusbCfg, HwConfig,
    RegisterAccess, Speed,
};
use crate::error::{Result, UsbError};
use crate::handler::Context;
use crate::mode::EngineConfig;
use crate::transfer::{Direction, TransferStatus, TransferType, UsbSpeed};
use control::{Ep0, Ep0Event};
use endpoint::Endpoint;
use heapless::Vec;
use isochronous::IsoStream;

/// Isochronous streams that may run at once
pub const MAX_ISO_STREAMS: usize = 4;

/// OTG features granted by the host through SET_FEATURE
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OtgFeatures {
    /// b_hnp_enable: the A-device allows this B-device to become host
    pub b_hnp_enable: bool,
    /// a_hnp_support: the A-device port supports HNP
    pub a_hnp_support: bool,
    /// a_alt_hnp_support: another A-device port supports HNP
    pub a_alt_hnp_support: bool,
}

/// Device mode state
pub struct Device {
    ep0: Ep0,
    in_eps: [Endpoint; MAX_EPS],
    out_eps: [Endpoint; MAX_EPS],
    iso: Vec<IsoStream, MAX_ISO_STREAMS>,
    fifos: TxFifoAllocator,
    max_ep: usize,
    config: Option<&'static Configuration>,
    config_value: u8,
    alt_settings: [u8; MAX_EPS],
    address: u8,
    speed: UsbSpeed,
    dual_speed: bool,
    utmi_16bit: bool,
    remote_wakeup: bool,
    otg: OtgFeatures,
    suspended: bool,
    pending_test_mode: Option<u8>,
}

fn endpoint_of<'a>(in_eps: &'a mut [Endpoint; MAX_EPS], out_eps: &'a mut [Endpoint; MAX_EPS], addr: u8) -> &'a mut Endpoint {
    let num = (addr & 0x0F) as usize;
    match Direction::from_address(addr) {
        Direction::In => &mut in_eps[num],
        Direction::Out => &mut out_eps[num],
    }
}

impl Device {
    /// Device state sized for `hw` and `params`
    pub fn new(control: &'static mut ControlBuffers, hw: &HwConfig, params: &CoreParams) -> Self {
        let fifo_count = if hw.dedicated_fifos {
            hw.num_in_eps
        } else {
            hw.num_dev_perio_in_ep
        };
        let mut ep0 = Ep0::new(control);
        let mut in_eps: [Endpoint; MAX_EPS] = core::array::from_fn(|n| Endpoint::new(n as u8, Direction::In));
        let mut out_eps: [Endpoint; MAX_EPS] = core::array::from_fn(|n| Endpoint::new(n as u8, Direction::Out));
        if let Some((in_chain, out_chain)) = ep0.take_chains() {
            in_eps[0].set_chain(in_chain);
            out_eps[0].set_chain(out_chain);
        }
        Self {
            ep0,
            in_eps,
            out_eps,
            iso: Vec::new(),
            fifos: TxFifoAllocator::new(hw.dedicated_fifos, fifo_count),
            max_ep: (params.dev_endpoints as usize).min(MAX_EPS - 1),
            config: None,
            config_value: 0,
            alt_settings: [0; MAX_EPS],
            address: 0,
            speed: UsbSpeed::Full,
            dual_speed: params.speed == Speed::High,
            utmi_16bit: params.phy_utmi_width == 16,
            remote_wakeup: false,
            otg: OtgFeatures::default(),
            suspended: false,
            pending_test_mode: None,
        }
    }

    /// EP0 state
    pub fn ep0_state(&self) -> Ep0State {
        self.ep0.state()
    }

    /// Active configuration value, 0 when not configured
    pub fn configuration(&self) -> u8 {
        self.config_value
    }

    /// Assigned bus address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Enumerated speed
    pub fn speed(&self) -> UsbSpeed {
        self.speed
    }

    /// Remote wakeup enabled by the host
    pub fn remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup
    }

    /// OTG features granted by the host
    pub fn otg_features(&self) -> OtgFeatures {
        self.otg
    }

    /// Bus is suspended
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Tx FIFOs held by enabled IN endpoints
    pub fn tx_fifos_in_use(&self) -> u32 {
        self.fifos.in_use()
    }

    /// State of the endpoint at `addr`
    pub fn endpoint_state(&self, addr: u8) -> Option<EndpointState> {
        let num = (addr & 0x0F) as usize;
        if num > self.max_ep {
            return None;
        }
        let ep = match Direction::from_address(addr) {
            Direction::In => &self.in_eps[num],
            Direction::Out => &self.out_eps[num],
        };
        Some(ep.state())
    }

    fn check_address(&self, addr: u8) -> Result<()> {
        let num = (addr & 0x0F) as usize;
        if num == 0 || num > self.max_ep || addr & 0x70 != 0 {
            return Err(UsbError::InvalidParameter);
        }
        Ok(())
    }

    fn endpoint(&mut self, addr: u8) -> Result<&mut Endpoint> {
        self.check_address(addr)?;
        Ok(endpoint_of(&mut self.in_eps, &mut self.out_eps, addr))
    }

    fn streaming(&self, addr: u8) -> bool {
        self.iso.iter().any(|s| s.address() == addr)
    }

    /// Attach a descriptor list to a non-control endpoint (descriptor DMA)
    pub(crate) fn set_endpoint_chain(&mut self, addr: u8, chain: DescriptorChain) -> Result<()> {
        let ep = self.endpoint(addr)?;
        if ep.is_busy() {
            return Err(UsbError::TransferActive);
        }
        ep.set_chain(chain);
        Ok(())
    }

    /// Queue `handle` on `addr`, starting it when the endpoint is idle
    pub(crate) fn submit(&mut self, cx: &mut Context<'_>, addr: u8, handle: TransferHandle) -> Result<()> {
        if self.streaming(addr) {
            return Err(UsbError::InvalidState);
        }
        let ep = self.endpoint(addr)?;
        if !ep.is_enabled() {
            return Err(UsbError::InvalidState);
        }
        if ep.is_busy() || ep.queued() > 0 || ep.state() != EndpointState::Idle {
            return ep.enqueue(handle);
        }
        Self::start_request(cx, ep, handle)
    }

    fn start_request(cx: &mut Context<'_>, ep: &mut Endpoint, handle: TransferHandle) -> Result<()> {
        let loaded = cx.load(handle)?;
        ep.start(cx.regs, &cx.cfg, Some(handle), loaded.buffer, loaded.length, loaded.zero)
            .map_err(|(e, buffer)| {
                if let Ok(request) = cx.store.request(handle) {
                    request.buffer = buffer;
                }
                e
            })
    }

    /// Complete a request that never reached the hardware
    fn fail(cx: &mut Context<'_>, handle: TransferHandle, status: TransferStatus) {
        let buffer = cx
            .store
            .request(handle)
            .map(|r| r.buffer.take())
            .unwrap_or(DmaBuffer::empty());
        cx.complete(handle, buffer, 0, status);
    }

    fn finish(cx: &mut Context<'_>, finished: Finished, status: TransferStatus) {
        if let Some(handle) = finished.handle {
            cx.complete(handle, finished.buffer, finished.actual, status);
        }
    }

    /// Start queued requests until one is accepted
    fn start_next(cx: &mut Context<'_>, ep: &mut Endpoint) {
        if ep.is_busy() || ep.state() != EndpointState::Idle {
            return;
        }
        while let Some(handle) = ep.dequeue() {
            match Self::start_request(cx, ep, handle) {
                Ok(()) => break,
                Err(e) => Self::fail(cx, handle, TransferStatus::Error(e)),
            }
        }
    }

    /// Cancel a queued or active request
    ///
    /// An active request is disabled in hardware first and completes with
    /// [`TransferStatus::Cancelled`] once the core confirms.
    pub(crate) fn cancel(&mut self, cx: &mut Context<'_>, handle: TransferHandle) -> Result<()> {
        for ep in self.in_eps.iter_mut().chain(self.out_eps.iter_mut()) {
            if ep.active_handle() == Some(handle) {
                if !ep.request_disable(cx.regs) {
                    if let Some(finished) = ep.abort() {
                        Self::finish(cx, finished, TransferStatus::Cancelled);
                    }
                    Self::start_next(cx, ep);
                }
                return Ok(());
            }
            if ep.remove_queued(handle) {
                Self::fail(cx, handle, TransferStatus::Cancelled);
                return Ok(());
            }
        }
        Err(UsbError::InvalidParameter)
    }

    /// Enable an endpoint outside of SET_CONFIGURATION
    pub(crate) fn enable_endpoint(&mut self, regs: &dyn RegisterAccess, config: &EndpointConfig) -> Result<()> {
        self.check_address(config.address)?;
        if config.ep_type == TransferType::Control {
            return Err(UsbError::Unsupported);
        }
        let fifo = match config.direction() {
            Direction::In => self.fifos.assign(config.ep_type)?,
            Direction::Out => 0,
        };
        let ep = endpoint_of(&mut self.in_eps, &mut self.out_eps, config.address);
        if let Err(e) = ep.activate(regs, config, fifo) {
            self.fifos.release(fifo);
            return Err(e);
        }
        Ok(())
    }

    /// Disable an endpoint, completing its requests as cancelled
    pub(crate) fn disable_endpoint(&mut self, cx: &mut Context<'_>, addr: u8) -> Result<()> {
        if self.streaming(addr) {
            return Err(UsbError::InvalidState);
        }
        let ep = self.endpoint(addr)?;
        if !ep.is_enabled() {
            return Err(UsbError::InvalidState);
        }
        let fifo = Self::shut_down(cx, ep, TransferStatus::Cancelled);
        self.fifos.release(fifo);
        Ok(())
    }

    /// Abort, drain and deactivate one endpoint, returning its Tx FIFO
    fn shut_down(cx: &mut Context<'_>, ep: &mut Endpoint, status: TransferStatus) -> u8 {
        if let Some(finished) = ep.abort() {
            Self::finish(cx, finished, status);
        }
        while let Some(handle) = ep.dequeue() {
            Self::fail(cx, handle, status);
        }
        ep.deactivate(cx.regs)
    }

    /// Disable every non-control endpoint and forget the configuration
    fn deconfigure(&mut self, cx: &mut Context<'_>, status: TransferStatus) {
        while let Some(stream) = self.iso.pop() {
            let ep = endpoint_of(&mut self.in_eps, &mut self.out_eps, stream.address());
            let _ = stream.stop(cx.regs, ep);
        }
        for ep in self.in_eps[1..].iter_mut().chain(self.out_eps[1..].iter_mut()) {
            if ep.is_enabled() {
                let fifo = Self::shut_down(cx, ep, status);
                self.fifos.release(fifo);
            }
        }
        self.config = None;
        self.config_value = 0;
        self.alt_settings = [0; MAX_EPS];
    }

    /// Functional stall on a non-control endpoint
    pub(crate) fn set_stall(&mut self, regs: &dyn RegisterAccess, addr: u8) -> Result<()> {
        let ep = self.endpoint(addr)?;
        if !ep.is_enabled() {
            return Err(UsbError::InvalidState);
        }
        ep.set_stall(regs);
        Ok(())
    }

    /// Clear a functional stall and resume the queue
    pub(crate) fn clear_stall(&mut self, cx: &mut Context<'_>, addr: u8) -> Result<()> {
        let ep = self.endpoint(addr)?;
        if !ep.is_enabled() {
            return Err(UsbError::InvalidState);
        }
        ep.clear_stall(cx.regs);
        Self::start_next(cx, ep);
        Ok(())
    }

    /// Signal remote wakeup; the caller clears it after 1 to 15 ms
    pub(crate) fn remote_wakeup(&mut self, regs: &dyn RegisterAccess) -> Result<()> {
        if !self.remote_wakeup || !self.suspended {
            return Err(UsbError::InvalidState);
        }
        regs.set_bits(offsets::DCTL, Dctl::RMTWKUPSIG.bits());
        Ok(())
    }

    /// Start an isochronous stream on `addr`
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn iso_start(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        addr: u8,
        buffers: [DmaBuffer; 2],
        data_per_frame: u32,
        buf_proc_intrvl: u32,
        start_frame: Option<u16>,
    ) -> core::result::Result<(), (UsbError, [DmaBuffer; 2])> {
        if let Err(e) = self.check_address(addr) {
            return Err((e, buffers));
        }
        if self.streaming(addr) {
            return Err((UsbError::InvalidState, buffers));
        }
        if self.iso.is_full() {
            return Err((UsbError::NoResources, buffers));
        }
        let ep = endpoint_of(&mut self.in_eps, &mut self.out_eps, addr);
        if ep.is_busy() || ep.queued() > 0 {
            return Err((UsbError::TransferActive, buffers));
        }
        let len = buffers[0].len().min(buffers[1].len());
        let layout = match IsoLayout::plan(ep, cfg, data_per_frame, buf_proc_intrvl, len) {
            Ok(layout) => layout,
            Err(e) => return Err((e, buffers)),
        };
        let mut stream = IsoStream::new(ep, layout, buffers);
        if let Err(e) = stream.start(regs, cfg, ep, start_frame) {
            return Err((e, stream.stop(regs, ep)));
        }
        // Capacity checked above
        let _ = self.iso.push(stream);
        Ok(())
    }

    /// Stop the stream on `addr` and hand its buffers back
    pub(crate) fn iso_stop(&mut self, regs: &dyn RegisterAccess, addr: u8) -> Result<[DmaBuffer; 2]> {
        let index = self
            .iso
            .iter()
            .position(|s| s.address() == addr)
            .ok_or(UsbError::InvalidState)?;
        let stream = self.iso.swap_remove(index);
        let ep = endpoint_of(&mut self.in_eps, &mut self.out_eps, addr);
        Ok(stream.stop(regs, ep))
    }

    /// Buffer the core is working on for the stream at `addr`
    pub fn iso_proc_buf_num(&self, addr: u8) -> Option<usize> {
        self.iso.iter().find(|s| s.address() == addr).map(|s| s.proc_buf_num())
    }

    fn iso_index(&self, addr: u8) -> Option<usize> {
        self.iso.iter().position(|s| s.address() == addr)
    }

    // Interrupt routines

    /// DAINT: IN endpoint interrupts
    pub(crate) fn on_in_endpoints(&mut self, cx: &mut Context<'_>) {
        let daint = cx.regs.read(offsets::DAINT) & cx.regs.read(offsets::DAINTMSK);
        for num in 0..=self.max_ep {
            if daint & (1 << num) != 0 {
                self.on_in_endpoint(cx, num);
            }
        }
    }

    /// DAINT: OUT endpoint interrupts
    pub(crate) fn on_out_endpoints(&mut self, cx: &mut Context<'_>) {
        let daint = cx.regs.read(offsets::DAINT) & cx.regs.read(offsets::DAINTMSK);
        for num in 0..=self.max_ep {
            if daint & (1 << (16 + num)) != 0 {
                self.on_out_endpoint(cx, num);
            }
        }
    }

    fn on_in_endpoint(&mut self, cx: &mut Context<'_>, num: usize) {
        let regs = cx.regs;
        let mut mask = DiepInt::from_bits_retain(regs.read(offsets::DIEPMSK));
        if regs.read(offsets::DIEPEMPMSK) & (1 << num) != 0 {
            mask |= DiepInt::TXFEMPTY;
        }
        let status = DiepInt::from_bits_retain(regs.read(offsets::diepint(num))) & mask;
        regs.write(offsets::diepint(num), status.bits());
        let addr = num as u8 | 0x80;

        if status.contains(DiepInt::XFERCOMPL) {
            regs.clear_bits(offsets::DIEPEMPMSK, 1 << num);
            if num == 0 {
                self.ep0_in_complete(cx);
            } else if let Some(i) = self.iso_index(addr) {
                let ep = &mut self.in_eps[num];
                if let Err(_e) = self.iso[i].on_transfer_complete(regs, &cx.cfg, ep, cx.handler) {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("ISO {:02x}: {}", addr, _e);
                }
            } else {
                self.transfer_complete(cx, Direction::In, num);
            }
        }
        if status.contains(DiepInt::EPDISABLED) {
            self.endpoint_disabled(cx, Direction::In, num);
        }
        if status.contains(DiepInt::AHBERR) {
            self.endpoint_error(cx, Direction::In, num, UsbError::AhbError);
        }
        if status.contains(DiepInt::TIMEOUT) {
            #[cfg(feature = "defmt")]
            defmt::warn!("EP {:02x}: IN token timeout", addr);
        }
        if status.contains(DiepInt::TXFEMPTY) {
            let ep = &mut self.in_eps[num];
            if ep.fill_tx_fifo(regs, &cx.cfg) {
                regs.clear_bits(offsets::DIEPEMPMSK, 1 << num);
            }
        }
        if status.contains(DiepInt::BNA) {
            self.buffer_not_available(cx, addr);
        }
    }

    fn on_out_endpoint(&mut self, cx: &mut Context<'_>, num: usize) {
        let regs = cx.regs;
        let mask = DoepInt::from_bits_retain(regs.read(offsets::DOEPMSK));
        let status = DoepInt::from_bits_retain(regs.read(offsets::doepint(num))) & mask;
        regs.write(offsets::doepint(num), status.bits());
        let addr = num as u8;

        if status.contains(DoepInt::XFERCOMPL) {
            if num == 0 {
                // SETUP reception also raises XFERCOMPL with no stage in flight
                if self.out_eps[0].is_busy() {
                    self.ep0_out_complete(cx);
                }
            } else if let Some(i) = self.iso_index(addr) {
                let ep = &mut self.out_eps[num];
                if let Err(_e) = self.iso[i].on_transfer_complete(regs, &cx.cfg, ep, cx.handler) {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("ISO {:02x}: {}", addr, _e);
                }
            } else {
                self.transfer_complete(cx, Direction::Out, num);
            }
        }
        if status.contains(DoepInt::SETUP) && num == 0 {
            self.handle_setup(cx);
        }
        if status.contains(DoepInt::EPDISABLED) {
            self.endpoint_disabled(cx, Direction::Out, num);
        }
        if status.contains(DoepInt::AHBERR) {
            self.endpoint_error(cx, Direction::Out, num, UsbError::AhbError);
        }
        if status.contains(DoepInt::STSPHSERCVD) {
            #[cfg(feature = "defmt")]
            defmt::trace!("EP0 status phase received");
        }
        if status.contains(DoepInt::BNA) {
            self.buffer_not_available(cx, addr);
        }
    }

    fn transfer_complete(&mut self, cx: &mut Context<'_>, dir: Direction, num: usize) {
        let ep = match dir {
            Direction::In => &mut self.in_eps[num],
            Direction::Out => &mut self.out_eps[num],
        };
        if !ep.is_busy() {
            return;
        }
        match ep.complete_chunk(cx.regs, &cx.cfg) {
            Ok(Progress::Continue) => {}
            Ok(Progress::Done(finished)) => {
                Self::finish(cx, finished, TransferStatus::Complete);
                Self::start_next(cx, ep);
            }
            Err(e) => {
                if let Some(finished) = ep.abort() {
                    Self::finish(cx, finished, TransferStatus::Error(e));
                }
                Self::start_next(cx, ep);
            }
        }
    }

    fn endpoint_disabled(&mut self, cx: &mut Context<'_>, dir: Direction, num: usize) {
        let ep = match dir {
            Direction::In => &mut self.in_eps[num],
            Direction::Out => &mut self.out_eps[num],
        };
        if ep.state() != EndpointState::HaltPending {
            return;
        }
        if let Some(finished) = ep.disabled() {
            Self::finish(cx, finished, TransferStatus::Cancelled);
        }
        Self::start_next(cx, ep);
    }

    fn endpoint_error(&mut self, cx: &mut Context<'_>, dir: Direction, num: usize, error: UsbError) {
        #[cfg(feature = "defmt")]
        defmt::error!("EP {} {}: {}", num, dir, error);
        if num == 0 {
            self.ep0_stall(cx);
            return;
        }
        let ep = match dir {
            Direction::In => &mut self.in_eps[num],
            Direction::Out => &mut self.out_eps[num],
        };
        if let Some(finished) = ep.abort() {
            Self::finish(cx, finished, TransferStatus::Error(error));
        }
        Self::start_next(cx, ep);
    }

    fn buffer_not_available(&mut self, cx: &mut Context<'_>, addr: u8) {
        match self.iso_index(addr) {
            Some(i) => {
                if let Err(_e) = self.iso[i].on_buffer_not_available(cx.regs, cx.handler) {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("ISO {:02x} restart failed: {}", addr, _e);
                }
            }
            None => {
                #[cfg(feature = "defmt")]
                defmt::warn!("EP {:02x}: buffer not available", addr);
            }
        }
    }

    fn ep0_in_complete(&mut self, cx: &mut Context<'_>) {
        let (in0, out0) = (&mut self.in_eps[0], &mut self.out_eps[0]);
        if !in0.is_busy() {
            return;
        }
        let event = match in0.complete_chunk(cx.regs, &cx.cfg) {
            Ok(Progress::Done(finished)) => self.ep0.in_complete(cx.regs, &cx.cfg, in0, out0, finished),
            Ok(Progress::Continue) => Ok(Ep0Event::None),
            Err(e) => Err(e),
        };
        self.ep0_event(cx, event);
    }

    fn ep0_out_complete(&mut self, cx: &mut Context<'_>) {
        let out0 = &mut self.out_eps[0];
        let event = match out0.complete_chunk(cx.regs, &cx.cfg) {
            Ok(Progress::Done(finished)) => self.ep0.out_complete(cx.regs, &cx.cfg, out0, finished),
            Ok(Progress::Continue) => Ok(Ep0Event::None),
            Err(e) => Err(e),
        };
        self.ep0_event(cx, event);
    }

    fn ep0_stall(&mut self, cx: &mut Context<'_>) {
        let (in0, out0) = (&mut self.in_eps[0], &mut self.out_eps[0]);
        self.ep0.stall(cx.regs, &cx.cfg, in0, out0);
    }

    /// Rx status queue level (slave mode)
    pub(crate) fn on_rx_fifo(&mut self, cx: &mut Context<'_>) {
        let regs = cx.regs;
        regs.clear_bits(offsets::GINTMSK, crate::dwc::GintSts::RXSTSQLVL.bits());
        let status = GrxSts::from_bits_retain(regs.read(offsets::GRXSTSP));
        let num = status.epnum();
        let bcnt = status.bcnt();
        match status.pktsts() {
            GrxSts::PKTSTS_OUT_DATA if bcnt > 0 => {
                if let Some(ep) = self.out_eps.get_mut(num) {
                    ep.receive_packet(regs, bcnt);
                }
            }
            GrxSts::PKTSTS_SETUP_DATA => self.ep0.read_setup_fifo(regs, bcnt),
            _ => {}
        }
        regs.set_bits(offsets::GINTMSK, crate::dwc::GintSts::RXSTSQLVL.bits());
    }

    /// USB reset; the caller flushes the Tx FIFOs first
    pub(crate) fn on_usb_reset(&mut self, cx: &mut Context<'_>) {
        let regs = cx.regs;
        #[cfg(feature = "defmt")]
        defmt::info!("USB reset");
        regs.clear_bits(offsets::DCTL, Dctl::RMTWKUPSIG.bits());
        for num in 0..=self.max_ep {
            regs.set_bits(offsets::doepctl(num), DepCtl::SNAK.bits());
        }
        self.deconfigure(cx, TransferStatus::Error(UsbError::DeviceDisconnected));

        regs.write(offsets::DAINTMSK, (1 << 16) | 1);
        let doepmsk = DoepInt::SETUP | DoepInt::XFERCOMPL | DoepInt::AHBERR | DoepInt::EPDISABLED | DoepInt::STSPHSERCVD;
        let diepmsk = DiepInt::XFERCOMPL | DiepInt::TIMEOUT | DiepInt::AHBERR | DiepInt::EPDISABLED;
        if cx.cfg.mode == DmaMode::DescriptorDma {
            regs.write(offsets::DOEPMSK, (doepmsk | DoepInt::BNA).bits());
            regs.write(offsets::DIEPMSK, (diepmsk | DiepInt::BNA).bits());
        } else {
            regs.write(offsets::DOEPMSK, doepmsk.bits());
            regs.write(offsets::DIEPMSK, diepmsk.bits());
        }
        regs.modify_bits(offsets::DCFG, Dcfg::DEVADDR_MASK.bits(), 0);

        self.address = 0;
        self.remote_wakeup = false;
        self.otg = OtgFeatures::default();
        self.suspended = false;
        self.pending_test_mode = None;

        let (in0, out0) = (&mut self.in_eps[0], &mut self.out_eps[0]);
        self.ep0.reset(in0, out0);
        self.ep0.arm_setup(regs, &cx.cfg, out0);
        cx.handler.bus_reset();
    }

    /// Enumeration done: EP0 sized for the negotiated speed
    pub(crate) fn on_enum_done(&mut self, cx: &mut Context<'_>) {
        let regs = cx.regs;
        let dsts = Dsts(regs.read(offsets::DSTS));
        self.speed = UsbSpeed::from_enum_speed(dsts.enumspd());
        let mps = self.speed.ep0_mps();
        self.in_eps[0].activate_ep0(regs, mps);
        self.out_eps[0].activate_ep0(regs, mps);
        self.ep0.set_mps(mps);
        regs.set_bits(offsets::DCTL, Dctl::CGNPINNAK.bits());

        let turnaround = if self.speed == UsbSpeed::High && !self.utmi_16bit { 9 } else { 5 };
        let usbcfg = GusbCfg::from_bits_retain(regs.read(offsets::GUSBCFG)).with_turnaround(turnaround);
        regs.write(offsets::GUSBCFG, usbcfg.bits());

        #[cfg(feature = "defmt")]
        defmt::info!("Enumerated at {}, EP0 mps {}", self.speed, mps);
        cx.handler.enumerated(self.speed);
    }

    pub(crate) fn on_early_suspend(&mut self) {
        #[cfg(feature = "defmt")]
        defmt::debug!("Early suspend");
    }

    pub(crate) fn on_suspend(&mut self, cx: &mut Context<'_>) {
        if !Dsts(cx.regs.read(offsets::DSTS)).suspended() || self.suspended {
            return;
        }
        self.suspended = true;
        cx.handler.suspend();
    }

    pub(crate) fn on_wakeup(&mut self, cx: &mut Context<'_>) {
        cx.regs.clear_bits(offsets::DCTL, Dctl::RMTWKUPSIG.bits());
        if self.suspended {
            self.suspended = false;
            cx.handler.resume();
        }
    }

    pub(crate) fn on_sof(&mut self, cx: &mut Context<'_>) {
        let frame = Dsts(cx.regs.read(offsets::DSTS)).soffn();
        for stream in self.iso.iter_mut() {
            let ep = endpoint_of(&mut self.in_eps, &mut self.out_eps, stream.address());
            stream.on_sof(cx.regs, &cx.cfg, ep, frame);
        }
        cx.handler.start_of_frame(frame as u16);
    }

    /// Incomplete isochronous transfer in the last (micro)frame
    pub(crate) fn on_incomplete_iso(&mut self, cx: &mut Context<'_>, dir: Direction) {
        for stream in self.iso.iter_mut() {
            if Direction::from_address(stream.address()) != dir {
                continue;
            }
            let ep = endpoint_of(&mut self.in_eps, &mut self.out_eps, stream.address());
            if let Err(_e) = stream.on_incomplete(cx.regs, &cx.cfg, ep, cx.handler) {
                #[cfg(feature = "defmt")]
                defmt::warn!("ISO {:02x}: {}", stream.address(), _e);
            }
        }
    }

    /// Shared Tx FIFO has room (slave mode without dedicated FIFOs)
    pub(crate) fn on_tx_fifo_empty(&mut self, cx: &mut Context<'_>, periodic: bool) {
        let mut more = false;
        for ep in self.in_eps[..=self.max_ep].iter_mut() {
            if !ep.is_busy() || ep.ep_type().is_periodic() != periodic {
                continue;
            }
            if !ep.fill_tx_fifo(cx.regs, &cx.cfg) {
                more = true;
            }
        }
        if !more {
            let irq = if periodic {
                crate::dwc::GintSts::PTXFEMPTY
            } else {
                crate::dwc::GintSts::NPTXFEMPTY
            };
            cx.regs.clear_bits(offsets::GINTMSK, irq.bits());
        }
    }

    pub(crate) fn on_iso_out_drop(&mut self) {
        #[cfg(feature = "defmt")]
        defmt::warn!("Isochronous OUT packet dropped");
    }

    pub(crate) fn on_end_of_periodic_frame(&mut self) {
        #[cfg(feature = "defmt")]
        defmt::trace!("End of periodic frame");
    }

    pub(crate) fn on_endpoint_mismatch(&mut self) {
        #[cfg(feature = "defmt")]
        defmt::warn!("IN token for an endpoint other than the FIFO head");
    }

    /// Session gone or cable pulled
    pub(crate) fn on_disconnect(&mut self, cx: &mut Context<'_>) {
        self.deconfigure(cx, TransferStatus::Error(UsbError::DeviceDisconnected));
        let (in0, out0) = (&mut self.in_eps[0], &mut self.out_eps[0]);
        self.ep0.disconnect(in0, out0);
        self.address = 0;
        self.suspended = false;
        cx.handler.disconnect();
    }

    fn ep0_event(&mut self, cx: &mut Context<'_>, event: Result<Ep0Event>) {
        match event {
            Ok(Ep0Event::None) => {}
            Ok(Ep0Event::OutDataReady) => self.control_out(cx),
            Ok(Ep0Event::StatusDone) => {
                if let Some(selector) = self.pending_test_mode.take() {
                    let dctl = Dctl::from_bits_retain(cx.regs.read(offsets::DCTL)).with_test_mode(selector as u32);
                    cx.regs.write(offsets::DCTL, dctl.bits());
                    #[cfg(feature = "defmt")]
                    defmt::info!("Test mode {}", selector);
                }
            }
            Err(_e) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("EP0 stage failed: {}", _e);
                self.ep0_stall(cx);
            }
        }
    }
}
