//! Logical configuration map supplied by the upper layer
//!
//! Descriptor parsing happens above the core. What the core needs to bring a
//! configuration up is the list of endpoints per interface and alternate
//! setting, given here as static tables.

use crate::transfer::{Direction, TransferType};

/// One endpoint of an interface alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointConfig {
    /// bEndpointAddress
    pub address: u8,
    /// Transfer type from bmAttributes
    pub ep_type: TransferType,
    /// wMaxPacketSize including the additional transaction bits [12:11]
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
}

impl EndpointConfig {
    /// Build an endpoint entry
    pub const fn new(address: u8, ep_type: TransferType, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address,
            ep_type,
            max_packet_size,
            interval,
        }
    }

    /// Endpoint number
    pub const fn number(&self) -> usize {
        (self.address & 0x0F) as usize
    }

    /// Direction from bit 7 of the address
    pub const fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    /// Packet size without the transaction bits
    pub const fn mps(&self) -> u16 {
        self.max_packet_size & 0x7FF
    }

    /// Transactions per microframe for high-bandwidth periodic endpoints
    pub const fn transactions(&self) -> u32 {
        ((self.max_packet_size >> 11) & 0x3) as u32 + 1
    }
}

/// One interface with its alternate settings
#[derive(Debug, Clone, Copy)]
pub struct InterfaceConfig {
    /// bInterfaceNumber
    pub number: u8,
    /// Endpoint lists indexed by alternate setting, 0 is the default
    pub alternates: &'static [&'static [EndpointConfig]],
}

/// One configuration value
#[derive(Debug, Clone, Copy)]
pub struct Configuration {
    /// bConfigurationValue
    pub value: u8,
    /// bmAttributes self-powered bit
    pub self_powered: bool,
    /// bmAttributes remote wakeup bit
    pub remote_wakeup: bool,
    /// Interfaces of the configuration
    pub interfaces: &'static [InterfaceConfig],
}

impl Configuration {
    /// Interface by number
    pub fn interface(&self, number: u8) -> Option<&InterfaceConfig> {
        self.interfaces.iter().find(|i| i.number == number)
    }
}
