//! Root port control (HPRT0)

use crate::dwc::{offsets, CoreParams, Hcfg, Hprt0, PhyType, RegisterAccess};
use crate::transfer::UsbSpeed;
use embedded_hal::delay::DelayNs;

/// PrtRst assertion time in milliseconds
pub const PORT_RESET_MS: u32 = 50;
/// Recovery time after reset before the first transaction
pub const RESET_RECOVERY_MS: u32 = 10;

/// Root port status with the change bits of the last interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortStatus {
    /// A device is attached
    pub connected: bool,
    /// The port is enabled (reset completed)
    pub enabled: bool,
    /// Port power is on
    pub powered: bool,
    /// Overcurrent is active
    pub overcurrent: bool,
    /// The port is suspended
    pub suspended: bool,
    /// Reset in progress
    pub resetting: bool,
    /// Speed of the attached device
    pub speed: UsbSpeed,
    /// Connect detected since the last report
    pub connect_changed: bool,
    /// Enable state changed since the last report
    pub enable_changed: bool,
    /// Overcurrent state changed since the last report
    pub overcurrent_changed: bool,
}

impl PortStatus {
    /// Decode a raw HPRT0 value
    pub fn from_raw(hprt: Hprt0) -> Self {
        Self {
            connected: hprt.contains(Hprt0::PRTCONNSTS),
            enabled: hprt.contains(Hprt0::PRTENA),
            powered: hprt.contains(Hprt0::PRTPWR),
            overcurrent: hprt.contains(Hprt0::PRTOVRCURRACT),
            suspended: hprt.contains(Hprt0::PRTSUSP),
            resetting: hprt.contains(Hprt0::PRTRST),
            speed: UsbSpeed::from_enum_speed(hprt.speed()),
            connect_changed: hprt.contains(Hprt0::PRTCONNDET),
            enable_changed: hprt.contains(Hprt0::PRTENCHNG),
            overcurrent_changed: hprt.contains(Hprt0::PRTOVRCURRCHNG),
        }
    }

    /// Any change bit set
    pub fn changed(&self) -> bool {
        self.connect_changed || self.enable_changed || self.overcurrent_changed
    }
}

/// Current port status without touching the change bits
pub fn status(regs: &dyn RegisterAccess) -> PortStatus {
    PortStatus::from_raw(Hprt0::from_bits_retain(regs.read(offsets::HPRT0)))
}

fn write_control(regs: &dyn RegisterAccess, update: impl FnOnce(Hprt0) -> Hprt0) {
    let hprt = Hprt0::from_bits_retain(regs.read(offsets::HPRT0)).preserve();
    regs.write(offsets::HPRT0, update(hprt).bits());
}

/// Switch port power
pub fn set_power(regs: &dyn RegisterAccess, on: bool) {
    write_control(regs, |h| if on { h | Hprt0::PRTPWR } else { h - Hprt0::PRTPWR });
}

/// Drive USB reset on the port for [`PORT_RESET_MS`]
pub fn reset<D: DelayNs + ?Sized>(regs: &dyn RegisterAccess, delay: &mut D) {
    write_control(regs, |h| h | Hprt0::PRTRST);
    delay.delay_ms(PORT_RESET_MS);
    write_control(regs, |h| h - Hprt0::PRTRST);
    delay.delay_ms(RESET_RECOVERY_MS);
    #[cfg(feature = "defmt")]
    defmt::debug!("Port reset done: {}", status(regs));
}

/// Disable the port; writing 1 to PrtEna disables it
pub fn disable(regs: &dyn RegisterAccess) {
    let hprt = Hprt0::from_bits_retain(regs.read(offsets::HPRT0)).preserve();
    regs.write(offsets::HPRT0, (hprt | Hprt0::PRTENA).bits());
}

/// Service a port interrupt
///
/// Clears the change bits, reprograms the FS/LS PHY clock for the attached
/// device's speed and cuts port power on overcurrent. Returns the status seen
/// before clearing.
pub fn on_interrupt(regs: &dyn RegisterAccess, params: &CoreParams) -> PortStatus {
    let hprt = Hprt0::from_bits_retain(regs.read(offsets::HPRT0));
    let status = PortStatus::from_raw(hprt);
    let mut ack = hprt.preserve();

    if status.connect_changed {
        ack |= Hprt0::PRTCONNDET;
    }
    if status.enable_changed {
        ack |= Hprt0::PRTENCHNG;
        if status.enabled {
            program_fsls_clock(regs, params, status.speed);
        }
    }
    if status.overcurrent_changed {
        ack |= Hprt0::PRTOVRCURRCHNG;
        if status.overcurrent {
            #[cfg(feature = "defmt")]
            defmt::error!("Port overcurrent, power removed");
            ack.remove(Hprt0::PRTPWR);
        }
    }
    regs.write(offsets::HPRT0, ack.bits());
    status
}

/// FS/LS devices on a full-speed PHY need the 48 or 6 MHz PHY clock
fn program_fsls_clock(regs: &dyn RegisterAccess, params: &CoreParams, speed: UsbSpeed) {
    let fs_phy = params.phy_type == PhyType::FullSpeed || (params.phy_type == PhyType::Ulpi && params.ulpi_fs_ls);
    if !fs_phy || speed == UsbSpeed::High {
        return;
    }
    let clk = if speed == UsbSpeed::Low && params.host_ls_low_power_phy_clk {
        Hcfg::CLK_6_MHZ
    } else {
        Hcfg::CLK_48_MHZ
    };
    regs.modify_bits(offsets::HCFG, Hcfg::FSLSPCLKSEL_MASK.bits(), clk);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwc::register::mock::MockRegisters;
    use crate::dwc::CoreParamsBuilder;

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    #[test]
    fn test_connect_change_is_acknowledged() {
        let regs = MockRegisters::new();
        regs.set(
            offsets::HPRT0,
            (Hprt0::PRTCONNSTS | Hprt0::PRTCONNDET | Hprt0::PRTPWR).bits() | (1 << 17),
        );
        let params = CoreParamsBuilder::new().build();
        let status = on_interrupt(&regs, &params);
        assert!(status.connected && status.connect_changed);
        assert_eq!(status.speed, UsbSpeed::Full);
        let written = Hprt0::from_bits_retain(regs.writes_to(offsets::HPRT0)[0]);
        assert!(written.contains(Hprt0::PRTCONNDET | Hprt0::PRTPWR));
        assert!(!written.contains(Hprt0::PRTENA));
    }

    #[test]
    fn test_overcurrent_cuts_power() {
        let regs = MockRegisters::new();
        regs.set(
            offsets::HPRT0,
            (Hprt0::PRTPWR | Hprt0::PRTOVRCURRACT | Hprt0::PRTOVRCURRCHNG).bits(),
        );
        let params = CoreParamsBuilder::new().build();
        on_interrupt(&regs, &params);
        let written = Hprt0::from_bits_retain(regs.writes_to(offsets::HPRT0)[0]);
        assert!(!written.contains(Hprt0::PRTPWR));
        assert!(written.contains(Hprt0::PRTOVRCURRCHNG));
    }

    #[test]
    fn test_reset_pulses_prtrst_without_disabling() {
        let regs = MockRegisters::new();
        regs.set(offsets::HPRT0, (Hprt0::PRTCONNSTS | Hprt0::PRTENA | Hprt0::PRTPWR).bits());
        reset(&regs, &mut NoDelay);
        let writes = regs.writes_to(offsets::HPRT0);
        assert_eq!(writes.len(), 2);
        assert!(Hprt0::from_bits_retain(writes[0]).contains(Hprt0::PRTRST));
        assert!(!Hprt0::from_bits_retain(writes[1]).contains(Hprt0::PRTRST));
        for w in writes {
            assert!(!Hprt0::from_bits_retain(w).contains(Hprt0::PRTENA));
        }
    }
}
