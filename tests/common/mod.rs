//! Shared test utilities for dwc-otg-core tests
//!
//! Builds controllers on top of the register-file model, records what the
//! core reports to the layer above and plays the hardware's side of the
//! interrupt handshakes.

#![allow(dead_code)]

pub mod mock_hardware;

pub use mock_hardware::MockRegisters;

use dwc_otg_core::device::{ControlBuffers, DescriptorKind, IsoPacketInfo};
use dwc_otg_core::dwc::{offsets, DiepInt, DoepInt, GintSts, GotgCtl, GrstCtl, HcInt};
use dwc_otg_core::{
    Completion, Configuration, Controller, CoreParams, CoreParamsBuilder, DmaBuffer, EndpointConfig, InterfaceConfig,
    OtgRole, PipeHandle, PortStatus, SetupPacket, TransferType, UsbError, UsbHandler, UsbSpeed,
};
use embedded_hal::delay::DelayNs;

/// Delay provider that returns immediately
pub struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// Controller under test: 8 requests in flight
pub type TestController = Controller<MockRegisters, Recorder, NoDelay, 8>;

/// GHWCFG2 architecture field values
pub const SLAVE_ONLY: u32 = 0;
pub const INTERNAL_DMA: u32 = 2;

pub static DEVICE_DESC: [u8; 18] = [
    18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 1, 2, 3, 1,
];

pub const BULK_IN: EndpointConfig = EndpointConfig::new(0x81, TransferType::Bulk, 512, 0);
pub const BULK_OUT: EndpointConfig = EndpointConfig::new(0x02, TransferType::Bulk, 512, 0);
static BULK_EPS: [EndpointConfig; 2] = [BULK_IN, BULK_OUT];
static ALTS: [&[EndpointConfig]; 1] = [&BULK_EPS];
static IFACES: [InterfaceConfig; 1] = [InterfaceConfig {
    number: 0,
    alternates: &ALTS,
}];
pub static CONFIG: Configuration = Configuration {
    value: 1,
    self_powered: true,
    remote_wakeup: true,
    interfaces: &IFACES,
};

/// Vendor IN request answered by [`Recorder`]
pub const VENDOR_IN: u8 = 0x01;
/// Vendor OUT request accepted by [`Recorder`]
pub const VENDOR_OUT: u8 = 0x02;

/// Something the core reported
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceStart,
    DeviceStop,
    HostStart,
    HostStop,
    BusReset,
    Enumerated(UsbSpeed),
    Configured(u8),
    InterfaceChanged(u8, u8),
    Suspend,
    Resume,
    Disconnect,
    RoleChanged(OtgRole),
    PortChanged(PortStatus),
    PipeIdle(PipeHandle),
    IsoReady { ep: u8, buffer: usize, packets: Vec<IsoPacketInfo> },
    ControlOut(Vec<u8>),
}

/// Handler that records every callback
#[derive(Default)]
pub struct Recorder {
    pub events: Vec<Event>,
    pub completions: Vec<(Completion, DmaBuffer)>,
    pub frames: Vec<u16>,
}

impl Recorder {
    pub fn saw(&self, event: &Event) -> bool {
        self.events.contains(event)
    }

    /// Take the completions recorded so far
    pub fn drain(&mut self) -> Vec<(Completion, DmaBuffer)> {
        std::mem::take(&mut self.completions)
    }
}

impl UsbHandler for Recorder {
    fn transfer_complete(&mut self, completion: Completion, buffer: DmaBuffer) {
        self.completions.push((completion, buffer));
    }

    fn descriptor(&mut self, kind: DescriptorKind, _index: u8, _lang_id: u16, _high_speed: bool) -> Option<&'static [u8]> {
        match kind {
            DescriptorKind::Device => Some(&DEVICE_DESC),
            _ => None,
        }
    }

    fn configuration(&mut self, value: u8, _high_speed: bool) -> Option<&'static Configuration> {
        (value == CONFIG.value).then_some(&CONFIG)
    }

    fn control_in(&mut self, setup: &SetupPacket, reply: &mut [u8]) -> dwc_otg_core::Result<usize> {
        if setup.request_type == 0xC0 && setup.request == VENDOR_IN {
            reply[..3].copy_from_slice(b"dwc");
            return Ok(3);
        }
        Err(UsbError::Stall)
    }

    fn control_out(&mut self, setup: &SetupPacket, data: &[u8]) -> dwc_otg_core::Result<()> {
        if setup.request_type == 0x40 && setup.request == VENDOR_OUT {
            self.events.push(Event::ControlOut(data.to_vec()));
            return Ok(());
        }
        Err(UsbError::Stall)
    }

    fn configured(&mut self, value: u8) {
        self.events.push(Event::Configured(value));
    }

    fn interface_changed(&mut self, interface: u8, alternate: u8) {
        self.events.push(Event::InterfaceChanged(interface, alternate));
    }

    fn bus_reset(&mut self) {
        self.events.push(Event::BusReset);
    }

    fn enumerated(&mut self, speed: UsbSpeed) {
        self.events.push(Event::Enumerated(speed));
    }

    fn suspend(&mut self) {
        self.events.push(Event::Suspend);
    }

    fn resume(&mut self) {
        self.events.push(Event::Resume);
    }

    fn disconnect(&mut self) {
        self.events.push(Event::Disconnect);
    }

    fn start_of_frame(&mut self, frame: u16) {
        self.frames.push(frame);
    }

    fn iso_buffer_ready(&mut self, ep_addr: u8, buffer: usize, packets: &[IsoPacketInfo]) {
        self.events.push(Event::IsoReady {
            ep: ep_addr,
            buffer,
            packets: packets.to_vec(),
        });
    }

    fn host_start(&mut self) {
        self.events.push(Event::HostStart);
    }

    fn host_stop(&mut self) {
        self.events.push(Event::HostStop);
    }

    fn device_start(&mut self) {
        self.events.push(Event::DeviceStart);
    }

    fn device_stop(&mut self) {
        self.events.push(Event::DeviceStop);
    }

    fn role_changed(&mut self, role: OtgRole) {
        self.events.push(Event::RoleChanged(role));
    }

    fn host_port_changed(&mut self, status: PortStatus) {
        self.events.push(Event::PortChanged(status));
    }

    fn pipe_idle(&mut self, pipe: PipeHandle) {
        self.events.push(Event::PipeIdle(pipe));
    }
}

/// Leak a zeroed buffer of `len` bytes
pub fn buffer(len: usize) -> DmaBuffer {
    DmaBuffer::from_static(Box::leak(vec![0u8; len].into_boxed_slice()))
}

/// Leak a buffer holding `data`
pub fn buffer_with(data: &[u8]) -> DmaBuffer {
    DmaBuffer::from_static(Box::leak(data.to_vec().into_boxed_slice()))
}

pub fn control_buffers() -> &'static mut ControlBuffers {
    Box::leak(Box::new(ControlBuffers::new()))
}

/// Register file of a core with HNP/SRP, a UTMI+ PHY, 4 device endpoints,
/// 8 host channels and 1024 words of dynamic dedicated FIFO
pub fn core_regs(architecture: u32) -> MockRegisters {
    let regs = MockRegisters::new();
    regs.set(
        offsets::GHWCFG2,
        (architecture << 3) | (1 << 6) | (4 << 10) | (7 << 14) | (1 << 19),
    );
    regs.set(offsets::GHWCFG3, (4096 << 16) | (6 << 4) | 8);
    regs.set(offsets::GHWCFG4, (1 << 25) | (4 << 26));
    regs.set(offsets::GRSTCTL, GrstCtl::AHBIDLE.bits());
    regs
}

/// B-device with a valid session, core in device mode
pub fn device_regs(architecture: u32) -> MockRegisters {
    let regs = core_regs(architecture);
    regs.set(offsets::GOTGCTL, (GotgCtl::CONIDSTS | GotgCtl::BSESVLD).bits());
    regs
}

/// A-device, core in host mode
pub fn host_regs(architecture: u32) -> MockRegisters {
    let regs = core_regs(architecture);
    regs.set(offsets::GOTGCTL, GotgCtl::ASESVLD.bits());
    regs.set(offsets::GINTSTS, GintSts::CURMODE_HOST.bits());
    regs
}

pub fn controller(regs: MockRegisters, params: CoreParams) -> TestController {
    let mut ctrl = Controller::new(regs, Recorder::default(), NoDelay, params, control_buffers())
        .expect("controller construction failed");
    ctrl.init().expect("core init failed");
    ctrl
}

/// Device-mode controller in slave mode
pub fn slave_device() -> TestController {
    controller(device_regs(SLAVE_ONLY), CoreParamsBuilder::new().build())
}

/// Raise `sources` in GINTSTS and run the interrupt handler
///
/// GINTSTS.CurMod is kept; DAINT and HAINT are emptied afterwards the way
/// the core does once the per-endpoint status is cleared.
pub fn fire(ctrl: &mut TestController, sources: GintSts) -> GintSts {
    let regs = ctrl.regs();
    let mode = regs.get(offsets::GINTSTS) & GintSts::CURMODE_HOST.bits();
    regs.set(offsets::GINTSTS, sources.bits() | mode);
    let seen = ctrl.on_interrupt();
    let regs = ctrl.regs();
    let mode = regs.get(offsets::GINTSTS) & GintSts::CURMODE_HOST.bits();
    regs.set(offsets::GINTSTS, mode);
    regs.set(offsets::DAINT, 0);
    regs.set(offsets::HAINT, 0);
    seen
}

/// USB reset followed by enumeration at high speed
pub fn bus_reset(ctrl: &mut TestController) {
    fire(ctrl, GintSts::USBRESET);
    ctrl.regs().set(offsets::DSTS, 0);
    fire(ctrl, GintSts::ENUMDONE);
}

/// Deliver a SETUP packet through the Rx FIFO (slave mode)
pub fn send_setup(ctrl: &mut TestController, setup: [u8; 8]) {
    let regs = ctrl.regs();
    regs.push_read(offsets::GRXSTSP, (8 << 4) | (6 << 17));
    regs.queue_rx_data(&setup);
    fire(ctrl, GintSts::RXSTSQLVL);
    let regs = ctrl.regs();
    regs.set(offsets::doepint(0), DoepInt::SETUP.bits());
    regs.set(offsets::DAINT, 1 << 16);
    fire(ctrl, GintSts::OUTEPINTR);
}

/// Give IN endpoint `num` FIFO room and let the core push its data
pub fn tx_room(ctrl: &mut TestController, num: usize) {
    let regs = ctrl.regs();
    regs.set(offsets::dtxfsts(num), 0x200);
    regs.set(offsets::diepint(num), DiepInt::TXFEMPTY.bits());
    regs.set(offsets::DAINT, 1 << num);
    fire(ctrl, GintSts::INEPINTR);
}

/// IN endpoint `num` sent everything it was programmed with
pub fn in_complete(ctrl: &mut TestController, num: usize) {
    let regs = ctrl.regs();
    regs.set(offsets::dieptsiz(num), 0);
    regs.set(offsets::diepint(num), DiepInt::XFERCOMPL.bits());
    regs.set(offsets::DAINT, 1 << num);
    fire(ctrl, GintSts::INEPINTR);
}

/// Deliver one OUT packet to endpoint `num` through the Rx FIFO (slave mode)
///
/// DOEPTSIZ is left with `residual` bytes outstanding.
pub fn receive_out(ctrl: &mut TestController, num: usize, data: &[u8], residual: u32) {
    let regs = ctrl.regs();
    regs.push_read(offsets::GRXSTSP, num as u32 | ((data.len() as u32) << 4) | (2 << 17));
    regs.queue_rx_data(data);
    fire(ctrl, GintSts::RXSTSQLVL);
    let regs = ctrl.regs();
    let tsiz = regs.get(offsets::doeptsiz(num));
    regs.set(offsets::doeptsiz(num), (tsiz & !0x7_FFFF) | residual);
}

/// OUT endpoint `num` finished its programmed transfer
pub fn out_complete(ctrl: &mut TestController, num: usize) {
    let regs = ctrl.regs();
    regs.set(offsets::doepint(num), DoepInt::XFERCOMPL.bits());
    regs.set(offsets::DAINT, 1 << (16 + num));
    fire(ctrl, GintSts::OUTEPINTR);
}

/// Channel `ch` halted with `status` and `residual` bytes left in HCTSIZ
pub fn channel_halted(ctrl: &mut TestController, ch: usize, status: HcInt, residual: u32) {
    let regs = ctrl.regs();
    let tsiz = regs.get(offsets::hctsiz(ch));
    regs.set(offsets::hctsiz(ch), (tsiz & !0x7_FFFF) | residual);
    regs.set(offsets::hcint(ch), (status | HcInt::CHHLTD).bits());
    regs.set(offsets::HAINT, 1 << ch);
    fire(ctrl, GintSts::HCINTR);
}

/// Standard SETUP packet bytes
pub fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let v = value.to_le_bytes();
    let i = index.to_le_bytes();
    let l = length.to_le_bytes();
    [request_type, request, v[0], v[1], i[0], i[1], l[0], l[1]]
}
