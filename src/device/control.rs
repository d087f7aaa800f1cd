//! EP0 control transfer state machine
//!
//! SETUP packets land in a dedicated buffer re-armed after every request.
//! Data stages move one max-packet at a time through a staging buffer owned
//! by EP0, which keeps the transfer engine's single-packet EP0 rule and lets
//! replies come from either static descriptor tables or the reply buffer.

use crate::device::endpoint::{Endpoint, Finished};
use crate::dma::{DescriptorChain, DmaBuffer, DmaDescriptor};
use crate::dwc::{offsets, DepCtl, DepTsiz, DmaMode, RegisterAccess};
use crate::error::{Result, UsbError};
use crate::mode::{read_fifo, EngineConfig};
use crate::transfer::Direction;

/// Largest OUT data stage or generated IN reply
pub const REPLY_CAPACITY: usize = 256;

/// Standard request codes (bRequest)
#[allow(missing_docs)]
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
    pub const SYNCH_FRAME: u8 = 0x0C;
}

/// Feature selectors (wValue of SET_FEATURE / CLEAR_FEATURE)
#[allow(missing_docs)]
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
    pub const TEST_MODE: u16 = 2;
    pub const B_HNP_ENABLE: u16 = 3;
    pub const A_HNP_SUPPORT: u16 = 4;
    pub const A_ALT_HNP_SUPPORT: u16 = 5;
}

/// EP0 state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ep0State {
    /// No bus reset seen yet
    Disconnected,
    /// Waiting for SETUP
    Idle,
    /// Sending the IN data stage
    InData,
    /// Receiving the OUT data stage
    OutData,
    /// Sending the IN status ZLP
    InStatus,
    /// Receiving the OUT status ZLP
    OutStatus,
    /// Protocol stall until the next SETUP
    Stall,
}

/// bmRequestType type field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    /// Chapter 9 request
    Standard,
    /// Class request
    Class,
    /// Vendor request
    Vendor,
    /// Reserved type value
    Reserved,
}

/// bmRequestType recipient field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    /// Device
    Device,
    /// Interface in wIndex
    Interface,
    /// Endpoint address in wIndex
    Endpoint,
    /// Anything else
    Other,
}

/// An 8-byte SETUP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Decode the wire format (little-endian fields)
    pub const fn parse(bytes: &[u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Encode to the wire format
    pub const fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Decode from a slice of at least 8 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: &[u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(Self::parse(raw))
    }

    /// Data stage direction
    pub const fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }

    /// Standard, class or vendor
    pub const fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0x3 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    /// Request target
    pub const fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }

    /// Descriptor type and index of GET_DESCRIPTOR
    pub const fn descriptor(&self) -> (DescriptorKind, u8) {
        (DescriptorKind::from_u8((self.value >> 8) as u8), self.value as u8)
    }
}

/// Descriptor types requested by GET_DESCRIPTOR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum DescriptorKind {
    Device,
    Configuration,
    String,
    Interface,
    Endpoint,
    DeviceQualifier,
    OtherSpeedConfiguration,
    Bos,
    /// Class or vendor specific type
    Other(u8),
}

impl DescriptorKind {
    /// Map bDescriptorType
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Device,
            2 => Self::Configuration,
            3 => Self::String,
            4 => Self::Interface,
            5 => Self::Endpoint,
            6 => Self::DeviceQualifier,
            7 => Self::OtherSpeedConfiguration,
            15 => Self::Bos,
            other => Self::Other(other),
        }
    }
}

/// DMA-visible memory used by EP0
///
/// Place one instance in DMA-capable RAM and hand it to the controller as a
/// `&'static mut`.
#[repr(C, align(32))]
pub struct ControlBuffers {
    in_desc: [DmaDescriptor; 1],
    out_desc: [DmaDescriptor; 1],
    setup: [u8; 64],
    staging: [u8; 64],
    reply: [u8; REPLY_CAPACITY],
}

impl ControlBuffers {
    /// Zeroed buffers
    pub const fn new() -> Self {
        Self {
            in_desc: [DmaDescriptor::new()],
            out_desc: [DmaDescriptor::new()],
            setup: [0; 64],
            staging: [0; 64],
            reply: [0; REPLY_CAPACITY],
        }
    }
}

impl Default for ControlBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Where IN data stage bytes come from
#[derive(Debug, Clone, Copy)]
pub(crate) enum Source {
    None,
    Static(&'static [u8]),
    Reply,
}

/// What a finished EP0 stage asks of the request layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ep0Event {
    None,
    /// The OUT data stage is in the reply buffer
    OutDataReady,
    /// The status stage finished and SETUP is re-armed
    StatusDone,
}

/// EP0 control pipe
pub struct Ep0 {
    state: Ep0State,
    setup_buf: DmaBuffer,
    staging: Option<DmaBuffer>,
    reply: DmaBuffer,
    request: Option<SetupPacket>,
    source: Source,
    total: u32,
    offset: u32,
    zlp: bool,
    mps: u16,
    chains: Option<(DescriptorChain, DescriptorChain)>,
}

impl Ep0 {
    /// Split `buffers` into the EP0 working areas
    pub fn new(buffers: &'static mut ControlBuffers) -> Self {
        let ControlBuffers {
            in_desc,
            out_desc,
            setup,
            staging,
            reply,
        } = buffers;
        let chains = match (DescriptorChain::new(in_desc), DescriptorChain::new(out_desc)) {
            (Ok(i), Ok(o)) => Some((i, o)),
            _ => None,
        };
        Self {
            state: Ep0State::Disconnected,
            setup_buf: DmaBuffer::from_static(setup),
            staging: Some(DmaBuffer::from_static(staging)),
            reply: DmaBuffer::from_static(reply),
            request: None,
            source: Source::None,
            total: 0,
            offset: 0,
            zlp: false,
            mps: 64,
            chains,
        }
    }

    /// Current state
    pub fn state(&self) -> Ep0State {
        self.state
    }

    /// Request being processed
    pub fn request(&self) -> Option<&SetupPacket> {
        self.request.as_ref()
    }

    /// Descriptor lists for EP0 IN and OUT, handed out once
    pub(crate) fn take_chains(&mut self) -> Option<(DescriptorChain, DescriptorChain)> {
        self.chains.take()
    }

    pub(crate) fn set_mps(&mut self, mps: u16) {
        self.mps = mps;
    }

    pub(crate) fn mps(&self) -> u16 {
        self.mps
    }

    /// Reply buffer for generated IN data
    pub(crate) fn reply_mut(&mut self) -> &mut [u8] {
        self.reply.as_mut_slice()
    }

    /// OUT data stage contents
    pub(crate) fn out_data(&self) -> &[u8] {
        let len = (self.total as usize).min(self.reply.len());
        &self.reply.as_slice()[..len]
    }

    fn reclaim(&mut self, in0: &mut Endpoint, out0: &mut Endpoint) {
        for ep in [in0, out0] {
            if let Some(finished) = ep.abort() {
                if self.staging.is_none() && !finished.buffer.is_empty() {
                    self.staging = Some(finished.buffer);
                }
            }
        }
    }

    /// Back to Idle after a bus reset
    pub(crate) fn reset(&mut self, in0: &mut Endpoint, out0: &mut Endpoint) {
        self.reclaim(in0, out0);
        self.request = None;
        self.source = Source::None;
        self.state = Ep0State::Idle;
    }

    /// Cable gone
    pub(crate) fn disconnect(&mut self, in0: &mut Endpoint, out0: &mut Endpoint) {
        self.reset(in0, out0);
        self.state = Ep0State::Disconnected;
    }

    /// Prepare DOEPTSIZ0 for up to three back-to-back SETUP packets
    pub(crate) fn arm_setup(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig, out0: &mut Endpoint) {
        regs.write(offsets::doeptsiz(0), DepTsiz::new(24, 1).with_mc(3).bits());
        let enable = (DepCtl::EPENA | DepCtl::USBACTEP).bits();
        match cfg.mode {
            DmaMode::Slave => {}
            DmaMode::BufferDma => {
                regs.write(offsets::doepdma(0), self.setup_buf.dma_addr());
                regs.set_bits(offsets::doepctl(0), enable);
            }
            DmaMode::DescriptorDma => {
                let Some(chain) = out0.chain.as_mut() else {
                    return;
                };
                chain.abandon();
                if chain.build_out(self.setup_buf.dma_addr(), 8, 64).is_ok() {
                    regs.write(offsets::doepdma(0), chain.dma_addr());
                    regs.set_bits(offsets::doepctl(0), enable);
                }
            }
        }
    }

    /// Pop a SETUP data packet from the Rx FIFO (slave mode)
    pub(crate) fn read_setup_fifo(&mut self, regs: &dyn RegisterAccess, bcnt: u32) {
        let slot = &mut self.setup_buf.as_mut_slice()[..8];
        read_fifo(regs, slot, bcnt as usize);
    }

    /// Fetch the most recent SETUP packet from the setup buffer
    pub(crate) fn latch_setup(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        out0: &mut Endpoint,
    ) -> Option<SetupPacket> {
        let offset = match cfg.mode {
            DmaMode::BufferDma => {
                // The core counts SUPCnt down from 3 for every SETUP it stores
                let supcnt = DepTsiz::from_bits_retain(regs.read(offsets::doeptsiz(0))).mc();
                (3u32.saturating_sub(supcnt).max(1) - 1) as usize * 8
            }
            DmaMode::DescriptorDma => {
                if let Some(chain) = out0.chain.as_mut() {
                    if chain.is_armed() {
                        chain.complete();
                    }
                }
                0
            }
            DmaMode::Slave => 0,
        };
        if let Some(window) = self.setup_buf.window(offset, 8) {
            window.sync_for_cpu();
        }
        SetupPacket::from_slice(self.setup_buf.as_slice().get(offset..)?)
    }

    #[cfg(test)]
    pub(crate) fn inject_setup(&mut self, bytes: &[u8; 8]) {
        self.setup_buf.as_mut_slice()[..8].copy_from_slice(bytes);
    }

    /// Start processing `setup`, dropping whatever stage was in flight
    pub(crate) fn begin(&mut self, setup: SetupPacket, in0: &mut Endpoint, out0: &mut Endpoint) {
        self.reclaim(in0, out0);
        self.request = Some(setup);
        self.source = Source::None;
        self.total = 0;
        self.offset = 0;
        self.zlp = false;
    }

    /// Answer with an IN data stage of `len` bytes from `source`
    ///
    /// The reply is truncated to wLength. A short reply that ends on a packet
    /// boundary is terminated with a zero-length packet.
    pub(crate) fn reply_in(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        in0: &mut Endpoint,
        source: Source,
        len: usize,
    ) -> Result<()> {
        let w_length = self.request.map(|r| r.length as u32).unwrap_or(0);
        if w_length == 0 {
            return self.status_in(regs, cfg, in0);
        }
        let available = match source {
            Source::None => 0,
            Source::Static(s) => s.len(),
            Source::Reply => self.reply.len(),
        };
        self.source = source;
        self.total = (len.min(available) as u32).min(w_length);
        self.offset = 0;
        self.zlp = self.total > 0 && self.total < w_length && self.total % self.mps.max(1) as u32 == 0;
        self.state = Ep0State::InData;
        self.send_next(regs, cfg, in0)
    }

    fn send_next(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig, in0: &mut Endpoint) -> Result<()> {
        let len = (self.total - self.offset).min(self.mps as u32) as usize;
        let mut staging = self.staging.take().ok_or(UsbError::InvalidState)?;
        let start = self.offset as usize;
        let src: &[u8] = match self.source {
            Source::None => &[],
            Source::Static(s) => s,
            Source::Reply => self.reply.as_slice(),
        };
        if let (Some(from), Some(to)) = (src.get(start..start + len), staging.as_mut_slice().get_mut(..len)) {
            to.copy_from_slice(from);
        }
        in0.start(regs, cfg, None, staging, len as u32, false).map_err(|(e, buffer)| {
            self.staging = Some(buffer);
            e
        })
    }

    /// Expect an OUT data stage of wLength bytes
    pub(crate) fn expect_out(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig, out0: &mut Endpoint) -> Result<()> {
        let w_length = self.request.map(|r| r.length as u32).unwrap_or(0);
        if w_length as usize > self.reply.len() {
            return Err(UsbError::BufferOverflow);
        }
        self.total = w_length;
        self.offset = 0;
        self.state = Ep0State::OutData;
        self.receive_next(regs, cfg, out0)
    }

    fn receive_next(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig, out0: &mut Endpoint) -> Result<()> {
        let len = (self.total - self.offset).min(self.mps as u32);
        let staging = self.staging.take().ok_or(UsbError::InvalidState)?;
        out0.start(regs, cfg, None, staging, len, false).map_err(|(e, buffer)| {
            self.staging = Some(buffer);
            e
        })
    }

    /// Send the IN status ZLP
    pub(crate) fn status_in(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig, in0: &mut Endpoint) -> Result<()> {
        self.state = Ep0State::InStatus;
        let staging = self.staging.take().ok_or(UsbError::InvalidState)?;
        in0.start(regs, cfg, None, staging, 0, false).map_err(|(e, buffer)| {
            self.staging = Some(buffer);
            e
        })
    }

    fn status_out(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig, out0: &mut Endpoint) -> Result<()> {
        self.state = Ep0State::OutStatus;
        let staging = self.staging.take().ok_or(UsbError::InvalidState)?;
        out0.start(regs, cfg, None, staging, 0, false).map_err(|(e, buffer)| {
            self.staging = Some(buffer);
            e
        })
    }

    /// Protocol stall on both directions until the next SETUP
    pub(crate) fn stall(&mut self, regs: &dyn RegisterAccess, cfg: &EngineConfig, in0: &mut Endpoint, out0: &mut Endpoint) {
        self.reclaim(in0, out0);
        in0.set_stall(regs);
        out0.set_stall(regs);
        self.state = Ep0State::Stall;
        #[cfg(feature = "defmt")]
        {
            if let Some(r) = self.request {
                defmt::debug!("EP0 stall: type {:02x} request {:02x}", r.request_type, r.request);
            }
        }
        self.arm_setup(regs, cfg, out0);
    }

    /// An EP0 IN stage finished
    pub(crate) fn in_complete(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        in0: &mut Endpoint,
        out0: &mut Endpoint,
        finished: Finished,
    ) -> Result<Ep0Event> {
        self.staging = Some(finished.buffer);
        match self.state {
            Ep0State::InData => {
                self.offset += finished.actual;
                if self.offset < self.total {
                    self.send_next(regs, cfg, in0)?;
                } else if self.zlp {
                    self.zlp = false;
                    self.send_next(regs, cfg, in0)?;
                } else {
                    self.status_out(regs, cfg, out0)?;
                }
                Ok(Ep0Event::None)
            }
            Ep0State::InStatus => {
                self.state = Ep0State::Idle;
                self.arm_setup(regs, cfg, out0);
                Ok(Ep0Event::StatusDone)
            }
            _ => Ok(Ep0Event::None),
        }
    }

    /// An EP0 OUT stage finished
    pub(crate) fn out_complete(
        &mut self,
        regs: &dyn RegisterAccess,
        cfg: &EngineConfig,
        out0: &mut Endpoint,
        finished: Finished,
    ) -> Result<Ep0Event> {
        match self.state {
            Ep0State::OutData => {
                let got = finished.actual as usize;
                let at = self.offset as usize;
                if let (Some(from), Some(to)) = (
                    finished.buffer.as_slice().get(..got),
                    self.reply.as_mut_slice().get_mut(at..at + got),
                ) {
                    to.copy_from_slice(from);
                }
                self.staging = Some(finished.buffer);
                self.offset += finished.actual;
                if finished.actual < self.mps as u32 || self.offset >= self.total {
                    self.total = self.offset;
                    return Ok(Ep0Event::OutDataReady);
                }
                self.receive_next(regs, cfg, out0)?;
                Ok(Ep0Event::None)
            }
            Ep0State::OutStatus => {
                self.staging = Some(finished.buffer);
                self.state = Ep0State::Idle;
                self.arm_setup(regs, cfg, out0);
                Ok(Ep0Event::StatusDone)
            }
            _ => {
                self.staging = Some(finished.buffer);
                Ok(Ep0Event::None)
            }
        }
    }
}
