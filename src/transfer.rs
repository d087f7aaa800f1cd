//! Transfer requests and packetization
//!
//! A [`TransferRequest`] is the unit of work queued on a device endpoint or a
//! host pipe. The helpers here decide how a request is cut into packets and
//! into chunks that fit the transfer size registers.

use crate::dma::{DmaBuffer, TransferHandle};
use crate::error::UsbError;

/// USB transfer types, discriminants match the EPType register encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransferType {
    /// Control
    Control = 0,
    /// Isochronous
    Isochronous = 1,
    /// Bulk
    Bulk = 2,
    /// Interrupt
    Interrupt = 3,
}

impl TransferType {
    /// EPType field value
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Decode an EPType field or bmAttributes transfer type
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }

    /// Interrupt and isochronous transfers are scheduled per (micro)frame
    pub const fn is_periodic(self) -> bool {
        matches!(self, Self::Interrupt | Self::Isochronous)
    }
}

/// Transfer direction, relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction from bit 7 of an endpoint address or bmRequestType
    pub const fn from_address(addr: u8) -> Self {
        if addr & 0x80 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }

    /// True for IN
    pub const fn is_in(self) -> bool {
        matches!(self, Self::In)
    }
}

/// Negotiated bus speed of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbSpeed {
    /// 480 Mb/s
    High,
    /// 12 Mb/s
    Full,
    /// 1.5 Mb/s
    Low,
}

impl UsbSpeed {
    /// Decode DSTS.EnumSpd or HPRT0.PrtSpd
    pub const fn from_enum_speed(value: u32) -> Self {
        match value {
            0 => Self::High,
            2 => Self::Low,
            _ => Self::Full,
        }
    }

    /// EP0 max packet size for a device enumerated at this speed
    pub const fn ep0_mps(self) -> u16 {
        match self {
            Self::High | Self::Full => 64,
            Self::Low => 8,
        }
    }
}

/// Lifecycle status of a transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferStatus {
    /// Queued or in flight
    Pending,
    /// Finished, `actual` bytes moved
    Complete,
    /// Aborted by the caller
    Cancelled,
    /// Deadline expired
    Timeout,
    /// Finished with an error
    Error(UsbError),
}

impl TransferStatus {
    /// Status carried by a finished transfer
    pub const fn from_result(result: core::result::Result<u32, UsbError>) -> Self {
        match result {
            Ok(_) => Self::Complete,
            Err(UsbError::Cancelled) => Self::Cancelled,
            Err(UsbError::Timeout) => Self::Timeout,
            Err(e) => Self::Error(e),
        }
    }
}

/// Number of packets needed for `len` bytes; a zero-length transfer is one packet
pub const fn packet_count(len: u32, mps: u16) -> u32 {
    let mps = mps as u32;
    if len == 0 || mps == 0 {
        1
    } else {
        len.div_ceil(mps)
    }
}

/// True when a trailing zero-length packet terminates the transfer
pub const fn needs_zlp(len: u32, mps: u16, zero: bool) -> bool {
    zero && len > 0 && mps > 0 && len % mps as u32 == 0
}

/// Packet layout of a whole transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketPlan {
    /// Data packets, at least one
    pub packets: u32,
    /// Size of the final data packet
    pub last_packet: u32,
    /// A zero-length packet follows the data
    pub zlp: bool,
}

impl PacketPlan {
    /// Plan `len` bytes with max packet size `mps`
    pub const fn new(len: u32, mps: u16, zero: bool) -> Self {
        let packets = packet_count(len, mps);
        let last_packet = if len == 0 {
            0
        } else {
            len - (packets - 1) * mps as u32
        };
        Self {
            packets,
            last_packet,
            zlp: needs_zlp(len, mps, zero),
        }
    }

    /// Packets on the wire including the trailing zero-length packet
    pub const fn total_packets(&self) -> u32 {
        self.packets + self.zlp as u32
    }
}

/// Register field ceilings applied when a transfer is programmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferLimits {
    /// Largest XferSize value
    pub max_transfer_size: u32,
    /// Largest PktCnt value
    pub max_packet_count: u32,
}

/// One programming of the transfer size register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Chunk {
    /// Bytes programmed into XferSize
    pub size: u32,
    /// Packets programmed into PktCnt
    pub packets: u32,
}

impl Chunk {
    /// Largest chunk of `remaining` bytes that fits the register fields
    ///
    /// Periodic transfers pass `multi_count` to cap the chunk at one
    /// (micro)frame's worth of packets. A chunk shorter than `remaining` is
    /// always a whole number of packets.
    pub fn plan(remaining: u32, mps: u16, limits: TransferLimits, multi_count: Option<u32>) -> Self {
        let mps32 = (mps as u32).max(1);
        let mut size = remaining.min(limits.max_transfer_size);
        if let Some(mc) = multi_count {
            size = size.min(mc.max(1) * mps32);
        }
        size = size.min(limits.max_packet_count.max(1) * mps32);
        if size < remaining {
            size -= size % mps32;
        }
        Self {
            size,
            packets: packet_count(size, mps),
        }
    }

    /// Zero-length chunk
    pub const fn zero_length() -> Self {
        Self { size: 0, packets: 1 }
    }
}

/// A queued or in-flight transfer
#[derive(Debug)]
pub struct TransferRequest {
    /// Data buffer
    pub buffer: DmaBuffer,
    /// Requested length in bytes
    pub length: u32,
    /// Bytes moved so far
    pub actual: u32,
    /// Terminate an exact multiple of the max packet size with a zero-length packet
    pub zero: bool,
    /// Current status
    pub status: TransferStatus,
    /// Opaque value handed back in the completion callback
    pub context: usize,
}

impl TransferRequest {
    /// Unused pool slot
    pub const EMPTY: Self = Self {
        buffer: DmaBuffer::empty(),
        length: 0,
        actual: 0,
        zero: false,
        status: TransferStatus::Pending,
        context: 0,
    };

    /// New pending request for `length` bytes of `buffer`
    pub const fn new(buffer: DmaBuffer, length: u32, zero: bool, context: usize) -> Self {
        Self {
            buffer,
            length,
            actual: 0,
            zero,
            status: TransferStatus::Pending,
            context,
        }
    }

    /// Bytes still to move
    pub const fn remaining(&self) -> u32 {
        self.length.saturating_sub(self.actual)
    }
}

/// Completion report delivered to the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    /// Request that finished
    pub handle: TransferHandle,
    /// Final status
    pub status: TransferStatus,
    /// Bytes transferred
    pub actual: u32,
    /// Context value given at submission
    pub context: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: TransferLimits = TransferLimits {
        max_transfer_size: 65_535,
        max_packet_count: 511,
    };

    #[test]
    fn test_packet_count_matches_ceiling() {
        for mps in [8u16, 64, 512, 1023] {
            for len in [0u32, 1, 7, 8, 63, 64, 65, 511, 512, 513, 1536, 4096] {
                let plan = PacketPlan::new(len, mps, false);
                let expected = if len == 0 { 1 } else { (len + mps as u32 - 1) / mps as u32 };
                assert_eq!(plan.packets, expected);
                if len > 0 {
                    let rem = len % mps as u32;
                    assert_eq!(plan.last_packet, if rem == 0 { mps as u32 } else { rem });
                }
            }
        }
    }

    #[test]
    fn test_zlp_only_for_exact_multiples() {
        assert!(PacketPlan::new(1024, 512, true).zlp);
        assert_eq!(PacketPlan::new(1024, 512, true).total_packets(), 3);
        assert!(!PacketPlan::new(1024, 512, false).zlp);
        assert!(!PacketPlan::new(1000, 512, true).zlp);
        assert!(!PacketPlan::new(0, 512, true).zlp);
    }

    #[test]
    fn test_chunk_clamps_to_whole_packets() {
        let small = TransferLimits {
            max_transfer_size: 1000,
            max_packet_count: 511,
        };
        let chunk = Chunk::plan(4096, 512, small, None);
        assert_eq!(chunk.size, 512);
        assert_eq!(chunk.packets, 1);

        let chunk = Chunk::plan(1536, 512, LIMITS, None);
        assert_eq!(chunk, Chunk { size: 1536, packets: 3 });
    }

    #[test]
    fn test_periodic_chunk_limited_to_one_frame() {
        let chunk = Chunk::plan(3000, 1024, LIMITS, Some(2));
        assert_eq!(chunk.size, 2048);
        assert_eq!(chunk.packets, 2);
    }

    #[test]
    fn test_packet_count_limit() {
        let limits = TransferLimits {
            max_transfer_size: 65_535,
            max_packet_count: 3,
        };
        let chunk = Chunk::plan(10_000, 64, limits, None);
        assert_eq!(chunk.size, 192);
        assert_eq!(chunk.packets, 3);
    }

    #[test]
    fn test_status_from_result() {
        assert_eq!(TransferStatus::from_result(Ok(3)), TransferStatus::Complete);
        assert_eq!(TransferStatus::from_result(Err(UsbError::Cancelled)), TransferStatus::Cancelled);
        assert_eq!(
            TransferStatus::from_result(Err(UsbError::Stall)),
            TransferStatus::Error(UsbError::Stall)
        );
    }
}
