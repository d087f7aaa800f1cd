//! USB error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// USB error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// Controller already initialized
    AlreadyInitialized,
    /// Peer disconnected or bus reset while a request was queued
    DeviceDisconnected,
    /// USB stall condition
    Stall,
    /// Data toggle mismatch
    DataToggleMismatch,
    /// Operation did not complete before its deadline
    Timeout,
    /// Request cancelled by the caller
    Cancelled,
    /// Babble detected (peer sent past the packet boundary)
    Babble,
    /// Transaction error (CRC, bit stuff, timeout, bad PID)
    TransactionError,
    /// Periodic transfer missed its (micro)frame
    FrameOverrun,
    /// AHB bus error during DMA
    AhbError,
    /// Receive buffer overflow
    BufferOverflow,
    /// Invalid parameter
    InvalidParameter,
    /// Invalid state for operation
    InvalidState,
    /// No free transfer object, channel or descriptor
    NoResources,
    /// A transfer is already active on this endpoint or channel
    TransferActive,
    /// Unsupported operation or hardware
    Unsupported,
    /// Endpoint halted
    EndpointHalted,
    /// Soft reset did not complete within its poll budget
    CoreResetTimeout,
    /// Tx or Rx FIFO flush did not complete within its poll budget
    FifoFlushTimeout,
    /// Core did not reach the requested host/device mode
    ModeSwitchTimeout,
    /// Requested FIFO partition exceeds the hardware depth (clamped)
    FifoOverAllocation,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "Controller already initialized"),
            Self::DeviceDisconnected => write!(f, "Device disconnected"),
            Self::Stall => write!(f, "USB stall"),
            Self::DataToggleMismatch => write!(f, "Data toggle mismatch"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Babble => write!(f, "Babble detected"),
            Self::TransactionError => write!(f, "Transaction error"),
            Self::FrameOverrun => write!(f, "Frame overrun"),
            Self::AhbError => write!(f, "AHB bus error"),
            Self::BufferOverflow => write!(f, "Buffer overflow"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::NoResources => write!(f, "No resources available"),
            Self::TransferActive => write!(f, "Transfer already active"),
            Self::Unsupported => write!(f, "Unsupported operation"),
            Self::EndpointHalted => write!(f, "Endpoint halted"),
            Self::CoreResetTimeout => write!(f, "Core soft reset timed out"),
            Self::FifoFlushTimeout => write!(f, "FIFO flush timed out"),
            Self::ModeSwitchTimeout => write!(f, "Host/device mode switch timed out"),
            Self::FifoOverAllocation => write!(f, "FIFO partition exceeds hardware depth"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for UsbError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn test_display_names_the_failure() {
        assert_eq!(UsbError::FifoOverAllocation.to_string(), "FIFO partition exceeds hardware depth");
        assert_eq!(UsbError::Stall.to_string(), "USB stall");
    }
}
