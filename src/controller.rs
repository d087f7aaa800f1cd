//! Controller: one DWC OTG core with its device, host and OTG state
//!
//! [`Controller`] owns the register block, the upper-layer handler, the
//! delay provider and every engine. Thread-context calls (submit, cancel,
//! endpoint and pipe management) run with the core's global interrupt gate
//! (GAHBCFG.GlblIntrMsk) closed, which is the only lock between them and
//! [`Controller::on_interrupt`].

use crate::device::{ControlBuffers, Device, EndpointConfig, SetupPacket};
use crate::dma::{DescriptorChain, DmaBuffer, PoolStats, RequestStore, TransferHandle, TransferPool};
use crate::dwc::{
    init, offsets, CoreParams, Dctl, FifoPartition, GintSts, GrstCtl, HwConfig, RegisterAccess,
};
use crate::error::{Result, UsbError};
use crate::handler::{Context, UsbHandler};
use crate::host::{port, Host, PipeConfig, PipeHandle, PortStatus, SETUP_LEN};
use crate::interrupt::{self, InterruptSink, InterruptStats, Source};
use crate::mode::EngineConfig;
use crate::otg::{self, Otg, OtgRole, RoleAction};
use crate::transfer::{Direction, TransferLimits, TransferRequest};
use core::sync::atomic::{compiler_fence, Ordering};
use embedded_hal::delay::DelayNs;

/// How long RmtWkUpSig is driven, within the 1 to 15 ms window
pub const REMOTE_WAKEUP_MS: u32 = 10;

/// Engine currently driving the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Engine {
    /// Not initialized, or stopped after a session end
    Stopped,
    /// Device (peripheral) engine
    Device,
    /// Host engine
    Host,
}

/// A DWC USB 2.0 OTG core
///
/// `N` bounds the number of transfer requests in flight across all endpoints
/// and pipes.
pub struct Controller<R: RegisterAccess, H: UsbHandler, D: DelayNs, const N: usize> {
    regs: R,
    handler: H,
    delay: D,
    params: CoreParams,
    hw: HwConfig,
    cfg: EngineConfig,
    pool: TransferPool<N>,
    device: Device,
    host: Host,
    otg: Otg,
    engine: Engine,
    phy_init_done: bool,
    partition: Option<FifoPartition>,
    stats: InterruptStats,
}

/// Split borrow of a controller, used by the interrupt path
struct Core<'a> {
    regs: &'a dyn RegisterAccess,
    cfg: EngineConfig,
    store: &'a mut dyn RequestStore,
    handler: &'a mut dyn UsbHandler,
    delay: &'a mut dyn DelayNs,
    params: &'a CoreParams,
    hw: &'a HwConfig,
    device: &'a mut Device,
    host: &'a mut Host,
    otg: &'a mut Otg,
    engine: &'a mut Engine,
    phy_init_done: &'a mut bool,
    partition: &'a mut Option<FifoPartition>,
    stats: &'a InterruptStats,
}

macro_rules! cx {
    ($core:expr) => {
        Context {
            regs: $core.regs,
            cfg: $core.cfg,
            store: &mut *$core.store,
            handler: &mut *$core.handler,
        }
    };
}

impl<R: RegisterAccess, H: UsbHandler, D: DelayNs, const N: usize> Controller<R, H, D, N> {
    /// Identify the core and size the engines
    ///
    /// Fails with [`UsbError::Unsupported`] when GSNPSID does not identify an
    /// OTG 2.x core. `params` are reconciled with what the hardware reports.
    pub fn new(
        regs: R,
        handler: H,
        delay: D,
        params: CoreParams,
        control: &'static mut ControlBuffers,
    ) -> Result<Self> {
        let hw = HwConfig::read(&regs)?;
        let params = params.reconcile(&hw);
        let cfg = EngineConfig {
            mode: params.dma_mode(),
            limits: TransferLimits {
                max_transfer_size: params.max_transfer_size,
                max_packet_count: params.max_packet_count,
            },
            dedicated_fifos: hw.dedicated_fifos,
            pti: params.pti_enable,
        };
        let otg = Otg::from_hardware(&regs);
        Ok(Self {
            device: Device::new(control, &hw, &params),
            host: Host::new(&params),
            regs,
            handler,
            delay,
            params,
            hw,
            cfg,
            pool: TransferPool::new(),
            otg,
            engine: Engine::Stopped,
            phy_init_done: false,
            partition: None,
            stats: InterruptStats::new(),
        })
    }

    fn core(&mut self) -> Core<'_> {
        Core {
            regs: &self.regs,
            cfg: self.cfg,
            store: &mut self.pool,
            handler: &mut self.handler,
            delay: &mut self.delay,
            params: &self.params,
            hw: &self.hw,
            device: &mut self.device,
            host: &mut self.host,
            otg: &mut self.otg,
            engine: &mut self.engine,
            phy_init_done: &mut self.phy_init_done,
            partition: &mut self.partition,
            stats: &self.stats,
        }
    }

    /// Run `f` with the core's interrupt output gated off
    fn critical<T>(&mut self, f: impl FnOnce(&mut Core<'_>) -> T) -> T {
        let was_enabled = init::global_interrupts_enabled(&self.regs);
        init::disable_global_interrupts(&self.regs);
        compiler_fence(Ordering::SeqCst);
        let result = f(&mut self.core());
        compiler_fence(Ordering::SeqCst);
        if was_enabled {
            init::enable_global_interrupts(&self.regs);
        }
        result
    }

    /// Initialize the core and start the engine for the current role
    ///
    /// A FIFO layout that had to be clamped still brings the core up; see
    /// [`Controller::fifo_status`].
    pub fn init(&mut self) -> Result<()> {
        if self.engine != Engine::Stopped {
            return Err(UsbError::AlreadyInitialized);
        }
        init::disable_global_interrupts(&self.regs);
        let mut core = self.core();
        let host = init::core_init(core.regs, core.params, core.hw, &mut *core.delay, &mut *core.phy_init_done)?;
        *core.otg = Otg::from_hardware(core.regs);
        core.start_engine(host)?;
        init::enable_global_interrupts(&self.regs);

        #[cfg(feature = "defmt")]
        defmt::info!("Core up in {} mode, role {}", self.engine, self.otg.role());
        Ok(())
    }

    /// Stop both engines and gate the core's interrupt output
    pub fn shutdown(&mut self) {
        init::disable_global_interrupts(&self.regs);
        let mut core = self.core();
        core.stop_engine();
        core.regs.set_bits(offsets::DCTL, Dctl::SFTDISCON.bits());
    }

    /// Service the core's interrupt line
    ///
    /// Call from the USB interrupt handler. Returns the sources that were
    /// pending.
    pub fn on_interrupt(&mut self) -> GintSts {
        let mut core = self.core();
        let regs = core.regs;
        let stats = core.stats;
        interrupt::dispatch(regs, &mut core, stats)
    }

    // Device API

    /// Queue a transfer on device endpoint `addr`
    ///
    /// The buffer comes back through [`UsbHandler::transfer_complete`], or
    /// with the error if the request is refused.
    pub fn submit(
        &mut self,
        addr: u8,
        buffer: DmaBuffer,
        length: u32,
        zero: bool,
        context: usize,
    ) -> core::result::Result<TransferHandle, (UsbError, DmaBuffer)> {
        if self.engine != Engine::Device {
            return Err((UsbError::InvalidState, buffer));
        }
        if length as usize > buffer.len() {
            return Err((UsbError::BufferOverflow, buffer));
        }
        let handle = self.allocate(buffer, length, zero, context)?;
        let result = self.critical(|core| core.device.submit(&mut cx!(core), addr, handle));
        self.accepted(handle, result)
    }

    fn allocate(
        &mut self,
        buffer: DmaBuffer,
        length: u32,
        zero: bool,
        context: usize,
    ) -> core::result::Result<TransferHandle, (UsbError, DmaBuffer)> {
        if self.pool.stats().available == 0 {
            return Err((UsbError::NoResources, buffer));
        }
        self.pool
            .alloc(TransferRequest::new(buffer, length, zero, context))
            .map_err(|e| (e, DmaBuffer::empty()))
    }

    fn accepted(
        &mut self,
        handle: TransferHandle,
        result: Result<()>,
    ) -> core::result::Result<TransferHandle, (UsbError, DmaBuffer)> {
        match result {
            Ok(()) => Ok(handle),
            Err(e) => {
                let buffer = self.pool.free(handle).map(|r| r.buffer).unwrap_or(DmaBuffer::empty());
                Err((e, buffer))
            }
        }
    }

    /// Cancel a queued or in-flight request
    ///
    /// The request completes with [`TransferStatus::Cancelled`] once the
    /// hardware confirms the endpoint disable or channel halt.
    pub fn cancel(&mut self, handle: TransferHandle) -> Result<()> {
        if !self.pool.contains(handle) {
            return Err(UsbError::InvalidParameter);
        }
        self.critical(|core| match *core.engine {
            Engine::Device => core.device.cancel(&mut cx!(core), handle),
            Engine::Host => core.host.cancel(&mut cx!(core), handle),
            Engine::Stopped => Err(UsbError::InvalidState),
        })
    }

    /// Enable a device endpoint outside of SET_CONFIGURATION
    pub fn enable_endpoint(&mut self, config: &EndpointConfig) -> Result<()> {
        self.device_call(|core| core.device.enable_endpoint(core.regs, config))
    }

    /// Disable a device endpoint; its requests complete as cancelled
    pub fn disable_endpoint(&mut self, addr: u8) -> Result<()> {
        self.device_call(|core| core.device.disable_endpoint(&mut cx!(core), addr))
    }

    /// Functional stall on endpoint `addr`
    pub fn set_stall(&mut self, addr: u8) -> Result<()> {
        self.device_call(|core| core.device.set_stall(core.regs, addr))
    }

    /// Clear a functional stall; resets the data toggle
    pub fn clear_stall(&mut self, addr: u8) -> Result<()> {
        self.device_call(|core| core.device.clear_stall(&mut cx!(core), addr))
    }

    /// Give endpoint `addr` a descriptor list for descriptor DMA
    pub fn set_endpoint_chain(&mut self, addr: u8, chain: DescriptorChain) -> Result<()> {
        self.critical(|core| core.device.set_endpoint_chain(addr, chain))
    }

    fn device_call<T>(&mut self, f: impl FnOnce(&mut Core<'_>) -> Result<T>) -> Result<T> {
        if self.engine != Engine::Device {
            return Err(UsbError::InvalidState);
        }
        self.critical(f)
    }

    /// Wake a suspended host, if it enabled remote wakeup
    ///
    /// Blocks for [`REMOTE_WAKEUP_MS`] while resume signaling is driven.
    pub fn remote_wakeup(&mut self) -> Result<()> {
        self.device_call(|core| core.device.remote_wakeup(core.regs))?;
        self.delay.delay_ms(REMOTE_WAKEUP_MS);
        self.regs.clear_bits(offsets::DCTL, Dctl::RMTWKUPSIG.bits());
        Ok(())
    }

    /// Start double-buffered streaming on isochronous endpoint `addr`
    ///
    /// The endpoint must already be enabled. `data_per_frame` bytes move
    /// every service interval; each buffer covers `buf_proc_intrvl`
    /// intervals. `start_frame` pins the first (micro)frame, otherwise the
    /// stream starts at the next interval boundary.
    pub fn iso_start(
        &mut self,
        addr: u8,
        buffers: [DmaBuffer; 2],
        data_per_frame: u32,
        buf_proc_intrvl: u32,
        start_frame: Option<u16>,
    ) -> core::result::Result<(), (UsbError, [DmaBuffer; 2])> {
        if self.engine != Engine::Device {
            return Err((UsbError::InvalidState, buffers));
        }
        self.critical(|core| {
            core.device
                .iso_start(core.regs, &core.cfg, addr, buffers, data_per_frame, buf_proc_intrvl, start_frame)
        })
    }

    /// Stop the stream on `addr` and take its buffers back
    pub fn iso_stop(&mut self, addr: u8) -> Result<[DmaBuffer; 2]> {
        self.critical(|core| core.device.iso_stop(core.regs, addr))
    }

    // OTG API

    /// Ask the A-device to start a session (SRP)
    pub fn initiate_srp(&mut self) -> Result<()> {
        otg::initiate_srp(&self.regs)
    }

    /// Ask for the host role (HNP); needs b_hnp_enable from the A-device
    pub fn request_hnp(&mut self) -> Result<()> {
        otg::request_hnp(&self.regs)
    }

    // Host API

    /// Open a pipe to an endpoint of an attached device
    pub fn open_pipe(&mut self, config: PipeConfig) -> Result<PipeHandle> {
        self.critical(|core| core.host.open_pipe(config))
    }

    /// Close a pipe, cancelling its requests
    pub fn close_pipe(&mut self, pipe: PipeHandle) -> Result<()> {
        self.critical(|core| core.host.close_pipe(&mut cx!(core), pipe))
    }

    /// Reset a pipe's data toggle to DATA0 (after CLEAR_FEATURE(HALT))
    pub fn reset_toggle(&mut self, pipe: PipeHandle) -> Result<()> {
        self.critical(|core| core.host.reset_toggle(pipe))
    }

    /// Give channel `ch` a descriptor list for descriptor DMA
    pub fn set_channel_chain(&mut self, ch: usize, chain: DescriptorChain) -> Result<()> {
        self.critical(|core| core.host.set_channel_chain(ch, chain))
    }

    /// Queue a bulk, interrupt or isochronous transfer on `pipe`
    pub fn submit_pipe(
        &mut self,
        pipe: PipeHandle,
        buffer: DmaBuffer,
        length: u32,
        zero: bool,
        context: usize,
    ) -> core::result::Result<TransferHandle, (UsbError, DmaBuffer)> {
        if self.engine != Engine::Host {
            return Err((UsbError::InvalidState, buffer));
        }
        let handle = self.allocate(buffer, length, zero, context)?;
        let result = self.critical(|core| core.host.submit(&mut cx!(core), pipe, handle));
        self.accepted(handle, result)
    }

    /// Queue a control transfer on `pipe`
    ///
    /// `setup` is written to the first 8 bytes of `buffer`; the data stage
    /// uses the bytes after it, `setup.length` of them.
    pub fn submit_control(
        &mut self,
        pipe: PipeHandle,
        setup: &SetupPacket,
        mut buffer: DmaBuffer,
        context: usize,
    ) -> core::result::Result<TransferHandle, (UsbError, DmaBuffer)> {
        match buffer.as_mut_slice().get_mut(..SETUP_LEN as usize) {
            Some(head) => head.copy_from_slice(&setup.to_bytes()),
            None => return Err((UsbError::BufferOverflow, buffer)),
        }
        self.submit_pipe(pipe, buffer, setup.length as u32, false, context)
    }

    /// Drive USB reset on the root port
    ///
    /// Blocks for the reset and recovery time.
    pub fn port_reset(&mut self) -> Result<()> {
        if self.engine != Engine::Host {
            return Err(UsbError::InvalidState);
        }
        port::reset(&self.regs, &mut self.delay);
        Ok(())
    }

    /// Switch root port power
    pub fn port_power(&mut self, on: bool) -> Result<()> {
        if self.engine != Engine::Host {
            return Err(UsbError::InvalidState);
        }
        port::set_power(&self.regs, on);
        Ok(())
    }

    /// Root port status
    pub fn port_status(&self) -> PortStatus {
        port::status(&self.regs)
    }

    // Accessors

    /// Engine driving the core
    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// OTG role
    pub fn role(&self) -> OtgRole {
        self.otg.role()
    }

    /// Device mode state
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Host mode state
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Upper-layer handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Upper-layer handler, mutably
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Register block
    pub fn regs(&self) -> &R {
        &self.regs
    }

    /// Parameters after reconciling with the hardware
    pub fn params(&self) -> &CoreParams {
        &self.params
    }

    /// Capabilities the hardware reported
    pub fn hw_config(&self) -> &HwConfig {
        &self.hw
    }

    /// Engine configuration in use
    pub fn engine_config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// FIFO layout last programmed
    pub fn fifo_partition(&self) -> Option<&FifoPartition> {
        self.partition.as_ref()
    }

    /// [`UsbError::FifoOverAllocation`] when the requested FIFO sizes had to
    /// be clamped to the hardware depth
    pub fn fifo_status(&self) -> Result<()> {
        self.partition.as_ref().map_or(Ok(()), FifoPartition::status)
    }

    /// Interrupt counters
    pub fn interrupt_stats(&self) -> &InterruptStats {
        &self.stats
    }

    /// Request pool usage
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl Core<'_> {
    /// Program the core for `host` and start that engine
    fn start_engine(&mut self, host: bool) -> Result<()> {
        let partition = if host {
            let power = self.otg.role().is_a_device();
            init::host_init(self.regs, self.params, self.hw, &mut *self.delay, power)?
        } else {
            init::device_init(self.regs, self.params, self.hw, &mut *self.delay)?
        };
        if let Some(p) = partition.as_ref() {
            if let Err(_e) = p.status() {
                #[cfg(feature = "defmt")]
                defmt::error!("FIFO request clamped: {}", _e);
            }
        }
        *self.partition = partition;
        if host {
            *self.engine = Engine::Host;
            self.handler.host_start();
        } else {
            *self.engine = Engine::Device;
            self.handler.device_start();
        }
        Ok(())
    }

    fn stop_engine(&mut self) {
        match *self.engine {
            Engine::Device => {
                self.device.on_disconnect(&mut cx!(self));
                self.handler.device_stop();
            }
            Engine::Host => {
                self.host.stop(&mut cx!(self));
                init::disable_host_interrupts(self.regs);
                self.handler.host_stop();
            }
            Engine::Stopped => {}
        }
        *self.engine = Engine::Stopped;
    }

    fn switch_engine(&mut self, host: bool) {
        self.stop_engine();
        if let Err(_e) = self.start_engine(host) {
            #[cfg(feature = "defmt")]
            defmt::error!("Engine start failed: {}", _e);
        }
    }

    /// Connector ID change: full re-init in the new role
    fn reinit(&mut self, host: bool) -> Result<()> {
        self.stop_engine();
        otg::wait_for_mode(self.regs, host, self.params.mode_switch_budget, &mut *self.delay)?;
        let now_host = init::core_init(self.regs, self.params, self.hw, &mut *self.delay, &mut *self.phy_init_done)?;
        debug_assert_eq!(now_host, host);
        self.start_engine(now_host)
    }

    fn apply(&mut self, action: RoleAction) {
        match action {
            RoleAction::None => return,
            RoleAction::Reinit { host } => {
                if let Err(_e) = self.reinit(host) {
                    #[cfg(feature = "defmt")]
                    defmt::error!("Role switch failed: {}", _e);
                    debug_assert!(false, "role switch failed");
                }
            }
            RoleAction::StartHost => self.switch_engine(true),
            RoleAction::StartDevice => self.switch_engine(false),
            RoleAction::StopDevice => {
                if *self.engine == Engine::Device {
                    self.stop_engine();
                }
            }
        }
        #[cfg(feature = "defmt")]
        defmt::debug!("OTG action {}", action);
        self.handler.role_changed(self.otg.role());
    }

    fn usb_reset(&mut self) {
        if let Err(_e) = init::flush_tx_fifo(self.regs, GrstCtl::ALL_TX_FIFOS, self.params.flush_budget, &mut *self.delay) {
            #[cfg(feature = "defmt")]
            defmt::warn!("Tx FIFO flush on reset: {}", _e);
        }
        self.device.on_usb_reset(&mut cx!(self));
    }
}

impl InterruptSink for Core<'_> {
    fn service(&mut self, source: Source, host: bool) -> bool {
        match source {
            Source::ModeMismatch => {
                #[cfg(feature = "defmt")]
                defmt::warn!("Mode mismatch: register access for the other mode");
            }
            Source::Otg => {
                let action = self.otg.on_otg_interrupt(self.regs);
                self.apply(action);
            }
            Source::ConnectorIdChange => {
                let action = self.otg.on_connector_id_change(self.regs);
                self.apply(action);
            }
            Source::Disconnect => {
                if *self.engine == Engine::Host {
                    self.host.on_disconnect(&mut cx!(self));
                    self.handler.disconnect();
                }
                let action = self.otg.on_disconnect();
                self.apply(action);
            }
            Source::SessionRequest => {
                if host {
                    // SRP from the B-device: power the bus
                    port::set_power(self.regs, true);
                } else {
                    self.handler.resume();
                }
            }
            Source::Wakeup => {
                if host {
                    self.otg.on_bus_resumed();
                } else {
                    self.device.on_wakeup(&mut cx!(self));
                }
            }
            Source::Suspend => {
                if host {
                    self.otg.on_bus_suspended(self.regs);
                } else {
                    self.device.on_suspend(&mut cx!(self));
                }
            }
            _ if host != (*self.engine == Engine::Host) => {
                // Stale source from before a role switch in this dispatch
                #[cfg(feature = "defmt")]
                defmt::debug!("Dropping {} after role switch", source);
            }
            Source::StartOfFrame if host => self.host.on_sof(&mut cx!(self)),
            Source::RxFifoLevel if host => self.host.on_rx_fifo(&mut cx!(self)),
            Source::NonPeriodicTxEmpty if host => self.host.on_tx_fifo_empty(&mut cx!(self), false),
            Source::PeriodicTxEmpty if host => self.host.on_tx_fifo_empty(&mut cx!(self), true),
            Source::Port => {
                self.host.on_port(&mut cx!(self), self.params);
            }
            Source::Channels => self.host.on_channels(&mut cx!(self)),
            Source::StartOfFrame => self.device.on_sof(&mut cx!(self)),
            Source::RxFifoLevel => self.device.on_rx_fifo(&mut cx!(self)),
            Source::NonPeriodicTxEmpty => self.device.on_tx_fifo_empty(&mut cx!(self), false),
            Source::PeriodicTxEmpty => self.device.on_tx_fifo_empty(&mut cx!(self), true),
            Source::EarlySuspend => self.device.on_early_suspend(),
            Source::UsbReset => self.usb_reset(),
            Source::EnumerationDone => self.device.on_enum_done(&mut cx!(self)),
            Source::IsoOutDrop => self.device.on_iso_out_drop(),
            Source::EndOfPeriodicFrame => self.device.on_end_of_periodic_frame(),
            Source::EndpointMismatch => self.device.on_endpoint_mismatch(),
            Source::InEndpoints => self.device.on_in_endpoints(&mut cx!(self)),
            Source::OutEndpoints => self.device.on_out_endpoints(&mut cx!(self)),
            Source::IncompleteIsoIn => self.device.on_incomplete_iso(&mut cx!(self), Direction::In),
            Source::IncompleteIsoOut => self.device.on_incomplete_iso(&mut cx!(self), Direction::Out),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwc::register::mock::MockRegisters;
    use crate::dwc::{CoreParamsBuilder, GotgCtl};
    use crate::handler::NullHandler;
    use std::boxed::Box;

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    fn control() -> &'static mut ControlBuffers {
        Box::leak(Box::new(ControlBuffers::new()))
    }

    fn device_regs() -> MockRegisters {
        let regs = MockRegisters::new();
        // Internal DMA, HNP/SRP, UTMI+, 4 EPs, 8 channels, dynamic FIFO
        regs.set(offsets::GHWCFG2, (2 << 3) | (1 << 6) | (4 << 10) | (7 << 14) | (1 << 19));
        regs.set(offsets::GHWCFG3, (4096 << 16) | (6 << 4) | 8);
        regs.set(offsets::GHWCFG4, (1 << 25) | (4 << 26));
        regs.set(offsets::GRSTCTL, GrstCtl::AHBIDLE.bits());
        regs.set(offsets::GOTGCTL, GotgCtl::CONIDSTS.bits());
        regs
    }

    #[test]
    fn test_rejects_unknown_core() {
        let regs = MockRegisters::new();
        regs.set(offsets::GSNPSID, 0x1234_5678);
        let result = Controller::<_, _, _, 4>::new(regs, NullHandler, NoDelay, CoreParamsBuilder::new().build(), control());
        assert_eq!(result.err(), Some(UsbError::Unsupported));
    }

    #[test]
    fn test_init_starts_device_engine() {
        let mut ctrl =
            Controller::<_, _, _, 4>::new(device_regs(), NullHandler, NoDelay, CoreParamsBuilder::new().build(), control())
                .unwrap();
        ctrl.init().unwrap();
        assert_eq!(ctrl.engine(), Engine::Device);
        assert_eq!(ctrl.role(), OtgRole::BPeripheral);
        assert!(init::global_interrupts_enabled(ctrl.regs()));
        assert_eq!(ctrl.init(), Err(UsbError::AlreadyInitialized));
    }

    #[test]
    fn test_submit_outside_device_mode_returns_buffer() {
        let mut ctrl =
            Controller::<_, _, _, 4>::new(device_regs(), NullHandler, NoDelay, CoreParamsBuilder::new().build(), control())
                .unwrap();
        let buffer = DmaBuffer::from_static(Box::leak(Box::new([0u8; 64])));
        let (err, back) = ctrl.submit(0x81, buffer, 64, false, 0).unwrap_err();
        assert_eq!(err, UsbError::InvalidState);
        assert_eq!(back.len(), 64);
    }

    #[test]
    fn test_critical_section_restores_gate() {
        let mut ctrl =
            Controller::<_, _, _, 4>::new(device_regs(), NullHandler, NoDelay, CoreParamsBuilder::new().build(), control())
                .unwrap();
        ctrl.init().unwrap();
        ctrl.regs().clear_log();
        let _ = ctrl.set_stall(0x81);
        let writes = ctrl.regs().writes_to(offsets::GAHBCFG);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0] & 1, 0);
        assert_eq!(writes[1] & 1, 1);
    }
}
