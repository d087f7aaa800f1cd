//! OTG role negotiation
//!
//! Tracks the session role from the connector ID pin, session end, and the
//! HNP/SRP status changes the core reports through GOTGINT. The state machine
//! only decides; re-initializing the core and starting or stopping the host
//! and device engines is left to the controller, which acts on the returned
//! [`RoleAction`].

use crate::dwc::{offsets, GintSts, GotgCtl, GotgInt, PollBudget, RegisterAccess};
use crate::error::{Result, UsbError};
use embedded_hal::delay::DelayNs;

/// Session role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtgRole {
    /// A-device (ID grounded) acting as host
    AHost,
    /// A-device handed the host role to the B-device
    APeripheral,
    /// A-device suspended the bus with HNP enabled
    ASuspend,
    /// B-device acting as peripheral
    BPeripheral,
    /// B-device acting as host after HNP
    BHost,
}

impl OtgRole {
    /// The core drives the bus in this role
    pub const fn is_host(self) -> bool {
        matches!(self, Self::AHost | Self::ASuspend | Self::BHost)
    }

    /// A-device roles
    pub const fn is_a_device(self) -> bool {
        matches!(self, Self::AHost | Self::APeripheral | Self::ASuspend)
    }
}

/// What the controller has to do after an OTG event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RoleAction {
    /// Nothing
    None,
    /// Connector ID changed: re-initialize the core in the new role and start
    /// that role's engine
    Reinit {
        /// The new role is host
        host: bool,
    },
    /// HNP handed us the host role: stop the device engine, start the host
    StartHost,
    /// Back to peripheral: stop the host engine, start the device
    StartDevice,
    /// Session over while a peripheral: reset and stop the device engine
    StopDevice,
}

/// Session and role state
#[derive(Debug)]
pub struct Otg {
    role: OtgRole,
    b_device: bool,
}

impl Otg {
    /// Role as read from the hardware
    pub fn from_hardware(regs: &dyn RegisterAccess) -> Self {
        let b_device = GotgCtl::from_bits_retain(regs.read(offsets::GOTGCTL)).contains(GotgCtl::CONIDSTS);
        let host = GintSts::from_bits_retain(regs.read(offsets::GINTSTS)).contains(GintSts::CURMODE_HOST);
        let role = match (b_device, host) {
            (false, true) => OtgRole::AHost,
            (false, false) => OtgRole::APeripheral,
            (true, false) => OtgRole::BPeripheral,
            (true, true) => OtgRole::BHost,
        };
        Self { role, b_device }
    }

    /// Current role
    pub fn role(&self) -> OtgRole {
        self.role
    }

    fn set_role(&mut self, role: OtgRole) {
        if self.role != role {
            #[cfg(feature = "defmt")]
            defmt::info!("OTG role {} -> {}", self.role, role);
            self.role = role;
        }
    }

    /// Connector ID status change
    ///
    /// Returns [`RoleAction::Reinit`] once per real change of the ID pin.
    pub(crate) fn on_connector_id_change(&mut self, regs: &dyn RegisterAccess) -> RoleAction {
        let b_device = GotgCtl::from_bits_retain(regs.read(offsets::GOTGCTL)).contains(GotgCtl::CONIDSTS);
        if b_device == self.b_device {
            #[cfg(feature = "defmt")]
            defmt::debug!("Connector ID interrupt without a change");
            return RoleAction::None;
        }
        self.b_device = b_device;
        if b_device {
            self.set_role(OtgRole::BPeripheral);
            RoleAction::Reinit { host: false }
        } else {
            self.set_role(OtgRole::AHost);
            RoleAction::Reinit { host: true }
        }
    }

    /// GOTGINT events
    pub(crate) fn on_otg_interrupt(&mut self, regs: &dyn RegisterAccess) -> RoleAction {
        let gotgint = GotgInt::from_bits_retain(regs.read(offsets::GOTGINT));
        let gotgctl = GotgCtl::from_bits_retain(regs.read(offsets::GOTGCTL));
        let mut action = RoleAction::None;

        if gotgint.contains(GotgInt::SESENDDET) {
            regs.clear_bits(offsets::GOTGCTL, GotgCtl::DEVHNPEN.bits());
            action = match self.role {
                OtgRole::BHost => {
                    self.set_role(OtgRole::BPeripheral);
                    RoleAction::StartDevice
                }
                OtgRole::BPeripheral | OtgRole::APeripheral => RoleAction::StopDevice,
                _ => RoleAction::None,
            };
        }

        if gotgint.contains(GotgInt::SESREQSUCSTSCHNG) {
            if gotgctl.contains(GotgCtl::SESREQSCS) {
                #[cfg(feature = "defmt")]
                defmt::info!("Session request succeeded");
                regs.clear_bits(offsets::GOTGCTL, GotgCtl::SESREQ.bits());
            } else {
                #[cfg(feature = "defmt")]
                defmt::warn!("Session request failed");
            }
        }

        if gotgint.contains(GotgInt::HSTNEGSUCSTSCHNG) {
            if gotgctl.contains(GotgCtl::HSTNEGSCS) {
                let host = GintSts::from_bits_retain(regs.read(offsets::GINTSTS)).contains(GintSts::CURMODE_HOST);
                regs.clear_bits(offsets::GOTGCTL, GotgCtl::HNPREQ.bits());
                if host && self.role == OtgRole::BPeripheral {
                    self.set_role(OtgRole::BHost);
                    action = RoleAction::StartHost;
                }
            } else {
                regs.set_bits(offsets::GOTGCTL, (GotgCtl::HNPREQ | GotgCtl::DEVHNPEN).bits());
                #[cfg(feature = "defmt")]
                defmt::error!("HNP failed: device not responding");
            }
        }

        if gotgint.contains(GotgInt::HSTNEGDET) {
            // The B-device asked for the bus while we were host
            if self.role.is_a_device() {
                self.set_role(OtgRole::APeripheral);
                action = RoleAction::StartDevice;
            }
        }

        if gotgint.contains(GotgInt::ADEVTOUTCHNG) {
            #[cfg(feature = "defmt")]
            defmt::debug!("A-device wait-for-B-connect timeout");
        }
        if gotgint.contains(GotgInt::DEBDONE) {
            #[cfg(feature = "defmt")]
            defmt::debug!("Connect debounce done");
        }

        regs.write(offsets::GOTGINT, gotgint.bits());
        action
    }

    /// Disconnect interrupt
    ///
    /// In `BHost` the peer is gone and the core falls back to peripheral; in
    /// `AHost` it is a plain device disconnect.
    pub(crate) fn on_disconnect(&mut self) -> RoleAction {
        match self.role {
            OtgRole::BHost => {
                self.set_role(OtgRole::BPeripheral);
                RoleAction::StartDevice
            }
            _ => RoleAction::None,
        }
    }

    /// The host suspended the bus; with HNP enabled the A-device may now
    /// hand over the host role
    pub(crate) fn on_bus_suspended(&mut self, regs: &dyn RegisterAccess) {
        let gotgctl = GotgCtl::from_bits_retain(regs.read(offsets::GOTGCTL));
        if self.role == OtgRole::AHost && gotgctl.contains(GotgCtl::HSTSETHNPEN) {
            self.set_role(OtgRole::ASuspend);
        }
    }

    /// Bus resumed out of `ASuspend`
    pub(crate) fn on_bus_resumed(&mut self) {
        if self.role == OtgRole::ASuspend {
            self.set_role(OtgRole::AHost);
        }
    }

    /// Record a role the controller entered on its own
    pub(crate) fn enter(&mut self, role: OtgRole) {
        self.set_role(role);
    }
}

/// Ask the A-device to power the bus (SRP)
///
/// Only a B-device without a valid session may request one.
pub fn initiate_srp(regs: &dyn RegisterAccess) -> Result<()> {
    let gotgctl = GotgCtl::from_bits_retain(regs.read(offsets::GOTGCTL));
    if !gotgctl.contains(GotgCtl::CONIDSTS) || gotgctl.contains(GotgCtl::BSESVLD) {
        return Err(UsbError::InvalidState);
    }
    regs.set_bits(offsets::GOTGCTL, GotgCtl::SESREQ.bits());
    Ok(())
}

/// Request the host role from the A-device (HNP)
///
/// The A-device must have granted b_hnp_enable first.
pub fn request_hnp(regs: &dyn RegisterAccess) -> Result<()> {
    let gotgctl = GotgCtl::from_bits_retain(regs.read(offsets::GOTGCTL));
    if !gotgctl.contains(GotgCtl::CONIDSTS | GotgCtl::DEVHNPEN) {
        return Err(UsbError::InvalidState);
    }
    regs.set_bits(offsets::GOTGCTL, GotgCtl::HNPREQ.bits());
    Ok(())
}

/// Wait for GINTSTS.CurMod to report the requested mode
pub fn wait_for_mode<D: DelayNs + ?Sized>(
    regs: &dyn RegisterAccess,
    host: bool,
    budget: PollBudget,
    delay: &mut D,
) -> Result<()> {
    budget
        .wait_for(delay, || {
            GintSts::from_bits_retain(regs.read(offsets::GINTSTS)).contains(GintSts::CURMODE_HOST) == host
        })
        .map_err(|_| {
            #[cfg(feature = "defmt")]
            defmt::error!("Core never switched to {} mode", if host { "host" } else { "device" });
            UsbError::ModeSwitchTimeout
        })
}
