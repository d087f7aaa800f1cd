//! Chapter 9 standard requests and the configuration activator

use super::control::{feature, request, Source, REPLY_CAPACITY};
use super::{Device, EndpointConfig, EndpointState};
use crate::device::{DescriptorKind, Recipient, RequestKind, SetupPacket};
use crate::dwc::{offsets, Dcfg, GotgCtl};
use crate::error::{Result, UsbError};
use crate::handler::Context;
use crate::transfer::{Direction, TransferStatus, UsbSpeed};

/// How EP0 answers a request
#[derive(Debug, Clone, Copy)]
enum Outcome {
    /// No data stage, IN status ZLP
    Ack,
    /// IN data stage
    Data(Source, usize),
    /// OUT data stage into the reply buffer
    ExpectOut,
    Stall,
    /// Not handled here, ask the upper layer
    Delegate,
}

impl Device {
    /// A SETUP packet arrived on EP0
    pub(crate) fn handle_setup(&mut self, cx: &mut Context<'_>) {
        let (in0, out0) = (&mut self.in_eps[0], &mut self.out_eps[0]);
        let Some(setup) = self.ep0.latch_setup(cx.regs, &cx.cfg, out0) else {
            self.ep0_stall(cx);
            return;
        };
        self.ep0.begin(setup, in0, out0);

        #[cfg(feature = "defmt")]
        defmt::trace!(
            "SETUP {:02x} {:02x} {:04x} {:04x} {}",
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            setup.length
        );

        let outcome = match setup.kind() {
            RequestKind::Standard => self.standard_request(cx, &setup),
            _ => Outcome::Delegate,
        };
        let outcome = match outcome {
            Outcome::Delegate => self.delegate(cx, &setup),
            other => other,
        };
        self.answer(cx, outcome);
    }

    fn delegate(&mut self, cx: &mut Context<'_>, setup: &SetupPacket) -> Outcome {
        if setup.direction() == Direction::Out && setup.length > 0 {
            if setup.length as usize > REPLY_CAPACITY {
                return Outcome::Stall;
            }
            return Outcome::ExpectOut;
        }
        match cx.handler.control_in(setup, self.ep0.reply_mut()) {
            Ok(_) if setup.length == 0 => Outcome::Ack,
            Ok(len) => Outcome::Data(Source::Reply, len),
            Err(_) => Outcome::Stall,
        }
    }

    fn answer(&mut self, cx: &mut Context<'_>, outcome: Outcome) {
        let (in0, out0) = (&mut self.in_eps[0], &mut self.out_eps[0]);
        let result = match outcome {
            Outcome::Ack => self.ep0.status_in(cx.regs, &cx.cfg, in0),
            Outcome::Data(source, len) => self.ep0.reply_in(cx.regs, &cx.cfg, in0, source, len),
            Outcome::ExpectOut => self.ep0.expect_out(cx.regs, &cx.cfg, out0),
            Outcome::Stall | Outcome::Delegate => Err(UsbError::Stall),
        };
        if result.is_err() {
            self.ep0_stall(cx);
        }
    }

    /// The OUT data stage of a delegated request is complete
    pub(super) fn control_out(&mut self, cx: &mut Context<'_>) {
        let Some(setup) = self.ep0.request().copied() else {
            self.ep0_stall(cx);
            return;
        };
        let outcome = match cx.handler.control_out(&setup, self.ep0.out_data()) {
            Ok(()) => Outcome::Ack,
            Err(_) => Outcome::Stall,
        };
        self.answer(cx, outcome);
    }

    fn reply(&mut self, bytes: &[u8]) -> Outcome {
        let reply = self.ep0.reply_mut();
        reply[..bytes.len()].copy_from_slice(bytes);
        Outcome::Data(Source::Reply, bytes.len())
    }

    fn standard_request(&mut self, cx: &mut Context<'_>, setup: &SetupPacket) -> Outcome {
        match setup.request {
            request::GET_STATUS => self.get_status(setup),
            request::CLEAR_FEATURE => self.clear_feature(cx, setup),
            request::SET_FEATURE => self.set_feature(cx, setup),
            request::SET_ADDRESS => self.set_address(cx, setup),
            request::GET_DESCRIPTOR => self.get_descriptor(cx, setup),
            request::GET_CONFIGURATION => {
                let value = self.config_value;
                self.reply(&[value])
            }
            request::SET_CONFIGURATION => match self.set_configuration(cx, setup.value as u8) {
                Ok(()) => Outcome::Ack,
                Err(_) => Outcome::Stall,
            },
            request::GET_INTERFACE => self.get_interface(setup),
            request::SET_INTERFACE => match self.set_interface(cx, setup.index as u8, setup.value as u8) {
                Ok(()) => Outcome::Ack,
                Err(_) => Outcome::Stall,
            },
            _ => Outcome::Delegate,
        }
    }

    fn get_status(&mut self, setup: &SetupPacket) -> Outcome {
        if setup.length > 2 {
            return Outcome::Stall;
        }
        let status: u16 = match setup.recipient() {
            Recipient::Device => {
                let self_powered = self.config.map(|c| c.self_powered).unwrap_or(false);
                (self_powered as u16) | ((self.remote_wakeup as u16) << 1)
            }
            Recipient::Interface => 0,
            Recipient::Endpoint => {
                let addr = setup.index as u8;
                if addr & 0x0F == 0 {
                    0
                } else if self.check_address(addr).is_err() {
                    return Outcome::Stall;
                } else {
                    match self.endpoint_state(addr) {
                        Some(state) => (state == EndpointState::Stalled) as u16,
                        None => return Outcome::Stall,
                    }
                }
            }
            Recipient::Other => return Outcome::Delegate,
        };
        self.reply(&status.to_le_bytes())
    }

    fn clear_feature(&mut self, cx: &mut Context<'_>, setup: &SetupPacket) -> Outcome {
        match (setup.recipient(), setup.value) {
            (Recipient::Device, feature::DEVICE_REMOTE_WAKEUP) => {
                self.remote_wakeup = false;
                Outcome::Ack
            }
            (Recipient::Endpoint, feature::ENDPOINT_HALT) => {
                let addr = setup.index as u8;
                if addr & 0x0F == 0 {
                    return Outcome::Ack;
                }
                match self.clear_stall(cx, addr) {
                    Ok(()) => Outcome::Ack,
                    Err(_) => Outcome::Stall,
                }
            }
            (Recipient::Interface, _) | (Recipient::Other, _) => Outcome::Delegate,
            _ => Outcome::Stall,
        }
    }

    fn set_feature(&mut self, cx: &mut Context<'_>, setup: &SetupPacket) -> Outcome {
        match (setup.recipient(), setup.value) {
            (Recipient::Device, feature::DEVICE_REMOTE_WAKEUP) => {
                self.remote_wakeup = true;
                Outcome::Ack
            }
            (Recipient::Device, feature::TEST_MODE) => {
                let selector = (setup.index >> 8) as u8;
                if !(1..=5).contains(&selector) {
                    return Outcome::Stall;
                }
                // Entered once the status stage is out
                self.pending_test_mode = Some(selector);
                Outcome::Ack
            }
            (Recipient::Device, feature::B_HNP_ENABLE) => {
                self.otg.b_hnp_enable = true;
                cx.regs.set_bits(offsets::GOTGCTL, GotgCtl::DEVHNPEN.bits());
                Outcome::Ack
            }
            (Recipient::Device, feature::A_HNP_SUPPORT) => {
                self.otg.a_hnp_support = true;
                Outcome::Ack
            }
            (Recipient::Device, feature::A_ALT_HNP_SUPPORT) => {
                self.otg.a_alt_hnp_support = true;
                Outcome::Ack
            }
            (Recipient::Endpoint, feature::ENDPOINT_HALT) => {
                let addr = setup.index as u8;
                if addr & 0x0F == 0 {
                    return Outcome::Ack;
                }
                match self.set_stall(cx.regs, addr) {
                    Ok(()) => Outcome::Ack,
                    Err(_) => Outcome::Stall,
                }
            }
            (Recipient::Interface, _) | (Recipient::Other, _) => Outcome::Delegate,
            _ => Outcome::Stall,
        }
    }

    fn set_address(&mut self, cx: &mut Context<'_>, setup: &SetupPacket) -> Outcome {
        if setup.value > 127 || setup.recipient() != Recipient::Device {
            return Outcome::Stall;
        }
        let address = setup.value as u8;
        let dcfg = Dcfg::from_bits_retain(cx.regs.read(offsets::DCFG)).with_address(address);
        cx.regs.write(offsets::DCFG, dcfg.bits());
        self.address = address;
        #[cfg(feature = "defmt")]
        defmt::debug!("Address {}", address);
        Outcome::Ack
    }

    fn get_descriptor(&mut self, cx: &mut Context<'_>, setup: &SetupPacket) -> Outcome {
        let (kind, index) = setup.descriptor();
        let high_speed = self.speed == UsbSpeed::High;
        let high_speed = match kind {
            DescriptorKind::DeviceQualifier | DescriptorKind::OtherSpeedConfiguration if !self.dual_speed => {
                return Outcome::Stall;
            }
            DescriptorKind::DeviceQualifier | DescriptorKind::OtherSpeedConfiguration => !high_speed,
            _ => high_speed,
        };
        match cx.handler.descriptor(kind, index, setup.index, high_speed) {
            Some(bytes) => Outcome::Data(Source::Static(bytes), bytes.len()),
            None => Outcome::Delegate,
        }
    }

    fn get_interface(&mut self, setup: &SetupPacket) -> Outcome {
        let Some(config) = self.config else {
            return Outcome::Stall;
        };
        let interface = setup.index as u8;
        if config.interface(interface).is_none() {
            return Outcome::Stall;
        }
        let alt = self.alt_settings.get(interface as usize).copied().unwrap_or(0);
        self.reply(&[alt])
    }

    /// Enable every endpoint of `endpoints`, undoing the ones opened on failure
    fn open_endpoints(&mut self, cx: &mut Context<'_>, endpoints: &[EndpointConfig]) -> Result<()> {
        for (i, ep) in endpoints.iter().enumerate() {
            if let Err(e) = self.enable_endpoint(cx.regs, ep) {
                #[cfg(feature = "defmt")]
                defmt::warn!("EP {:02x} enable failed: {}", ep.address, e);
                self.close_endpoints(cx, &endpoints[..i]);
                return Err(e);
            }
        }
        Ok(())
    }

    fn close_endpoints(&mut self, cx: &mut Context<'_>, endpoints: &[EndpointConfig]) {
        for ep in endpoints {
            if self.iso_stop(cx.regs, ep.address).is_ok() {
                #[cfg(feature = "defmt")]
                defmt::debug!("ISO {:02x} stopped by interface change", ep.address);
            }
            if let Err(_e) = self.disable_endpoint(cx, ep.address) {
                #[cfg(feature = "defmt")]
                defmt::warn!("EP {:02x} disable failed: {}", ep.address, _e);
            }
        }
    }

    /// SET_CONFIGURATION: bring up every default interface of `value`
    ///
    /// Any endpoint failing to enable rolls the whole configuration back to
    /// the unconfigured state.
    pub(crate) fn set_configuration(&mut self, cx: &mut Context<'_>, value: u8) -> Result<()> {
        self.deconfigure(cx, TransferStatus::Cancelled);
        if value == 0 {
            cx.handler.configured(0);
            return Ok(());
        }
        let high_speed = self.speed == UsbSpeed::High;
        let config = cx.handler.configuration(value, high_speed).ok_or(UsbError::Stall)?;
        for interface in config.interfaces {
            let endpoints = interface.alternates.first().copied().unwrap_or(&[]);
            if let Err(e) = self.open_endpoints(cx, endpoints) {
                self.deconfigure(cx, TransferStatus::Cancelled);
                cx.handler.configured(0);
                return Err(e);
            }
        }
        self.config = Some(config);
        self.config_value = value;
        #[cfg(feature = "defmt")]
        defmt::info!("Configuration {} active", value);
        cx.handler.configured(value);
        Ok(())
    }

    /// SET_INTERFACE: swap the endpoints of one interface
    pub(crate) fn set_interface(&mut self, cx: &mut Context<'_>, interface: u8, alternate: u8) -> Result<()> {
        let config = self.config.ok_or(UsbError::InvalidState)?;
        let iface = config.interface(interface).ok_or(UsbError::InvalidParameter)?;
        let next = *iface.alternates.get(alternate as usize).ok_or(UsbError::InvalidParameter)?;
        let slot = self
            .alt_settings
            .get_mut(interface as usize)
            .ok_or(UsbError::InvalidParameter)?;
        let current = *slot;
        if let Some(old) = iface.alternates.get(current as usize) {
            self.close_endpoints(cx, old);
        }
        self.open_endpoints(cx, next)?;
        self.alt_settings[interface as usize] = alternate;
        cx.handler.interface_changed(interface, alternate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Configuration, ControlBuffers, Ep0State, InterfaceConfig};
    use crate::dma::TransferPool;
    use crate::dwc::register::mock::MockRegisters;
    use crate::dwc::{CoreParamsBuilder, DepCtl, DepTsiz, DmaMode, HwConfig};
    use crate::handler::UsbHandler;
    use crate::mode::EngineConfig;
    use crate::transfer::{TransferLimits, TransferType};
    use std::boxed::Box;
    use std::vec::Vec;

    const BULK_IN: EndpointConfig = EndpointConfig::new(0x81, TransferType::Bulk, 512, 0);
    const BULK_OUT: EndpointConfig = EndpointConfig::new(0x02, TransferType::Bulk, 512, 0);
    const BAD_EP: EndpointConfig = EndpointConfig::new(0x0E, TransferType::Bulk, 512, 0);
    static GOOD: [InterfaceConfig; 1] = [InterfaceConfig {
        number: 0,
        alternates: &[&[BULK_IN, BULK_OUT]],
    }];
    static BROKEN: [InterfaceConfig; 1] = [InterfaceConfig {
        number: 0,
        alternates: &[&[BULK_IN, BAD_EP]],
    }];
    static CONFIG_1: Configuration = Configuration {
        value: 1,
        self_powered: true,
        remote_wakeup: true,
        interfaces: &GOOD,
    };
    static CONFIG_2: Configuration = Configuration {
        value: 2,
        self_powered: false,
        remote_wakeup: false,
        interfaces: &BROKEN,
    };

    #[derive(Default)]
    struct Host {
        configured: Vec<u8>,
    }

    impl UsbHandler for Host {
        fn configuration(&mut self, value: u8, _high_speed: bool) -> Option<&'static Configuration> {
            match value {
                1 => Some(&CONFIG_1),
                2 => Some(&CONFIG_2),
                _ => None,
            }
        }
        fn configured(&mut self, value: u8) {
            self.configured.push(value);
        }
    }

    /// Device with EP0 enumerated at high speed
    fn device(regs: &MockRegisters) -> Device {
        let hw = HwConfig::decode(0x4F54_310A, 0, (2 << 3) | (1 << 6) | (4 << 10) | (1 << 19), 0x0400_0000, (1 << 25) | (4 << 26));
        let params = CoreParamsBuilder::new().build().reconcile(&hw);
        let mut dev = Device::new(Box::leak(Box::new(ControlBuffers::new())), &hw, &params);
        dev.in_eps[0].activate_ep0(regs, 64);
        dev.out_eps[0].activate_ep0(regs, 64);
        dev.ep0.set_mps(64);
        dev
    }

    fn engine() -> EngineConfig {
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

    /// Place a SETUP in the buffer and run the request layer
    fn setup(dev: &mut Device, cx: &mut Context<'_>, bytes: [u8; 8]) {
        dev.ep0.inject_setup(&bytes);
        // One SETUP stored: SUPCnt 3 -> 2
        cx.regs.write(offsets::doeptsiz(0), DepTsiz::new(0, 0).with_mc(2).bits());
        dev.handle_setup(cx);
    }

    #[test]
    fn test_set_configuration_enables_default_interfaces() {
        let regs = MockRegisters::new();
        let mut pool: TransferPool<1> = TransferPool::new();
        let mut host = Host::default();
        let mut dev = device(&regs);
        let mut cx = Context {
            regs: &regs,
            cfg: engine(),
            store: &mut pool,
            handler: &mut host,
        };
        setup(&mut dev, &mut cx, [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(dev.configuration(), 1);
        assert!(DepCtl::from_bits_retain(regs.get(offsets::diepctl(1))).contains(DepCtl::USBACTEP));
        assert!(DepCtl::from_bits_retain(regs.get(offsets::doepctl(2))).contains(DepCtl::USBACTEP));
        assert_eq!(dev.ep0_state(), Ep0State::InStatus);
        drop(cx);
        assert_eq!(host.configured, [1]);
    }

    #[test]
    fn test_failed_configuration_rolls_back_and_stalls() {
        let regs = MockRegisters::new();
        let mut pool: TransferPool<1> = TransferPool::new();
        let mut host = Host::default();
        let mut dev = device(&regs);
        let mut cx = Context {
            regs: &regs,
            cfg: engine(),
            store: &mut pool,
            handler: &mut host,
        };
        setup(&mut dev, &mut cx, [0x00, 0x09, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(dev.configuration(), 0);
        assert_eq!(dev.tx_fifos_in_use(), 0);
        assert_eq!(dev.endpoint_state(0x81), Some(EndpointState::Disabled));
        assert_eq!(dev.ep0_state(), Ep0State::Stall);
    }

    #[test]
    fn test_set_interface_survives_failed_disable() {
        let regs = MockRegisters::new();
        let mut pool: TransferPool<1> = TransferPool::new();
        let mut host = Host::default();
        let mut dev = device(&regs);
        let mut cx = Context {
            regs: &regs,
            cfg: engine(),
            store: &mut pool,
            handler: &mut host,
        };
        dev.set_configuration(&mut cx, 1).unwrap();
        dev.disable_endpoint(&mut cx, 0x81).unwrap();
        // 0x81 is already down, closing the old alternate skips it
        dev.set_interface(&mut cx, 0, 0).unwrap();
        assert_eq!(dev.endpoint_state(0x81), Some(EndpointState::Idle));
        assert_eq!(dev.endpoint_state(0x02), Some(EndpointState::Idle));
        assert_eq!(dev.tx_fifos_in_use(), 1);
    }

    #[test]
    fn test_get_status_reports_halt() {
        let regs = MockRegisters::new();
        let mut pool: TransferPool<1> = TransferPool::new();
        let mut host = Host::default();
        let mut dev = device(&regs);
        let mut cx = Context {
            regs: &regs,
            cfg: engine(),
            store: &mut pool,
            handler: &mut host,
        };
        setup(&mut dev, &mut cx, [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        setup(&mut dev, &mut cx, [0x02, 0x03, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00]);
        assert!(dev.in_eps[1].is_stalled());
        setup(&mut dev, &mut cx, [0x82, 0x00, 0x00, 0x00, 0x81, 0x00, 0x02, 0x00]);
        assert_eq!(dev.ep0_state(), Ep0State::InData);
        assert_eq!(&dev.ep0.reply_mut()[..2], &[1, 0]);

        // wLength above two stalls
        setup(&mut dev, &mut cx, [0x82, 0x00, 0x00, 0x00, 0x81, 0x00, 0x04, 0x00]);
        assert_eq!(dev.ep0_state(), Ep0State::Stall);
    }

    #[test]
    fn test_set_address_writes_dcfg() {
        let regs = MockRegisters::new();
        let mut pool: TransferPool<1> = TransferPool::new();
        let mut host = Host::default();
        let mut dev = device(&regs);
        let mut cx = Context {
            regs: &regs,
            cfg: engine(),
            store: &mut pool,
            handler: &mut host,
        };
        setup(&mut dev, &mut cx, [0x00, 0x05, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(Dcfg::from_bits_retain(regs.get(offsets::DCFG)).address(), 0x2A);
        assert_eq!(dev.address(), 0x2A);
        assert_eq!(dev.ep0_state(), Ep0State::InStatus);
    }

    #[test]
    fn test_b_hnp_enable_sets_devhnpen() {
        let regs = MockRegisters::new();
        let mut pool: TransferPool<1> = TransferPool::new();
        let mut host = Host::default();
        let mut dev = device(&regs);
        let mut cx = Context {
            regs: &regs,
            cfg: engine(),
            store: &mut pool,
            handler: &mut host,
        };
        setup(&mut dev, &mut cx, [0x00, 0x03, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(dev.otg_features().b_hnp_enable);
        assert_ne!(regs.get(offsets::GOTGCTL) & GotgCtl::DEVHNPEN.bits(), 0);
    }

    #[test]
    fn test_unknown_class_request_stalls_by_default() {
        let regs = MockRegisters::new();
        let mut pool: TransferPool<1> = TransferPool::new();
        let mut host = Host::default();
        let mut dev = device(&regs);
        let mut cx = Context {
            regs: &regs,
            cfg: engine(),
            store: &mut pool,
            handler: &mut host,
        };
        setup(&mut dev, &mut cx, [0xA1, 0x01, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00]);
        assert_eq!(dev.ep0_state(), Ep0State::Stall);
    }
}
