//! Error classification and retry bookkeeping for channels and endpoints
//!
//! The host channel engine classifies each failed transaction into an
//! [`ErrorType`], counts consecutive failures in an [`ErrorCounter`] and asks
//! [`ErrorCounter::strike`] what to do next. Counters in [`RecoveryStats`] are
//! lock-free so they can be read from thread context while the interrupt
//! handler updates them.

use crate::error::UsbError;
use core::sync::atomic::{AtomicU32, Ordering};

/// Fault seen on a channel or endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorType {
    /// CRC, bit stuff, timeout or false EOP
    TransactionError,
    /// Protocol STALL handshake
    Stall,
    /// Device sent past the end of the packet
    Babble,
    /// Unexpected data PID
    DataToggle,
    /// Periodic transaction missed its (micro)frame
    FrameOverrun,
    /// AHB bus error on a DMA access
    AhbError,
}

/// What the engine does about a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecoveryAction {
    /// Re-issue the transaction
    Retry,
    /// Reset the data toggle and restart the endpoint
    ResetEndpoint,
    /// Halt the channel and complete the request with an error
    HaltChannel,
    /// Complete the request with an error, no retry
    Fatal,
}

const ERROR_TYPES: usize = 6;

impl ErrorType {
    /// Action once the retry budget is spent
    pub const fn recovery_action(&self) -> RecoveryAction {
        match self {
            Self::TransactionError => RecoveryAction::HaltChannel,
            Self::Stall => RecoveryAction::ResetEndpoint,
            Self::DataToggle | Self::FrameOverrun => RecoveryAction::Retry,
            Self::Babble | Self::AhbError => RecoveryAction::Fatal,
        }
    }

    /// Consecutive occurrences retried before escalating
    pub const fn max_retries(&self) -> u8 {
        match self {
            Self::TransactionError => 3,
            // Stalls are never retried
            Self::Stall => 0,
            Self::Babble | Self::AhbError => 0,
            Self::DataToggle | Self::FrameOverrun => u8::MAX,
        }
    }

    /// Error reported to the caller when the request fails
    pub const fn as_error(&self) -> UsbError {
        match self {
            Self::TransactionError => UsbError::TransactionError,
            Self::Stall => UsbError::Stall,
            Self::Babble => UsbError::Babble,
            Self::DataToggle => UsbError::DataToggleMismatch,
            Self::FrameOverrun => UsbError::FrameOverrun,
            Self::AhbError => UsbError::AhbError,
        }
    }

    const fn index(&self) -> usize {
        *self as usize
    }
}

/// Consecutive error count for one channel
///
/// Any successful handshake clears it; three transaction errors in a row end
/// the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorCounter {
    count: u8,
}

impl ErrorCounter {
    /// No errors recorded
    pub const fn new() -> Self {
        Self { count: 0 }
    }

    /// Consecutive errors so far
    pub const fn count(&self) -> u8 {
        self.count
    }

    /// The previous attempt ended in an error
    pub const fn in_error_state(&self) -> bool {
        self.count > 0
    }

    /// Record `error` and decide the next step
    pub fn strike(&mut self, error: ErrorType, stats: &RecoveryStats) -> RecoveryAction {
        stats.record_error(error);
        if error == ErrorType::TransactionError {
            self.count = self.count.saturating_add(1);
        }
        let retries = match error {
            ErrorType::TransactionError => self.count,
            _ => 1,
        };
        let action = if retries <= error.max_retries() {
            stats.record_retry();
            RecoveryAction::Retry
        } else {
            stats.record_escalation();
            error.recovery_action()
        };

        #[cfg(feature = "defmt")]
        defmt::debug!("Recovery: {} -> {} (strike {})", error, action, self.count);

        action
    }

    /// A handshake succeeded
    pub fn clear(&mut self) {
        self.count = 0;
    }
}

/// Lock-free error counters
pub struct RecoveryStats {
    by_type: [AtomicU32; ERROR_TYPES],
    total_errors: AtomicU32,
    retries: AtomicU32,
    escalations: AtomicU32,
    halts: AtomicU32,
}

impl RecoveryStats {
    /// All counters at zero
    pub const fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            by_type: [ZERO; ERROR_TYPES],
            total_errors: AtomicU32::new(0),
            retries: AtomicU32::new(0),
            escalations: AtomicU32::new(0),
            halts: AtomicU32::new(0),
        }
    }

    fn record_error(&self, error: ErrorType) {
        self.by_type[error.index()].fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_escalation(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_halt(&self) {
        self.halts.fetch_add(1, Ordering::Relaxed);
    }

    /// Occurrences of `error`
    pub fn count(&self, error: ErrorType) -> u32 {
        self.by_type[error.index()].load(Ordering::Relaxed)
    }

    /// Faults of any type
    pub fn total_errors(&self) -> u32 {
        self.total_errors.load(Ordering::Relaxed)
    }

    /// Faults answered with a retry
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Faults that exhausted their retry budget
    pub fn escalations(&self) -> u32 {
        self.escalations.load(Ordering::Relaxed)
    }

    /// Channel halts issued
    pub fn halts(&self) -> u32 {
        self.halts.load(Ordering::Relaxed)
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in &self.by_type {
            counter.store(0, Ordering::Relaxed);
        }
        self.total_errors.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.escalations.store(0, Ordering::Relaxed);
        self.halts.store(0, Ordering::Relaxed);
    }
}

impl Default for RecoveryStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Data PID as encoded in HCTSIZ.Pid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataPid {
    /// DATA0
    Data0 = 0,
    /// DATA2, high-bandwidth isochronous
    Data2 = 1,
    /// DATA1
    Data1 = 2,
    /// MDATA for OUT, SETUP for control
    MdataSetup = 3,
}

impl DataPid {
    /// Decode the two-bit field
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Data0,
            1 => Self::Data2,
            2 => Self::Data1,
            _ => Self::MdataSetup,
        }
    }

    /// Field value
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Toggle after `packets` acknowledged packets
    pub const fn advance(self, packets: u32) -> Self {
        match self {
            Self::Data0 | Self::Data1 if packets % 2 == 0 => self,
            Self::Data0 => Self::Data1,
            Self::Data1 => Self::Data0,
            other => other,
        }
    }
}

/// High-speed bulk and control OUT use PING after a NAK or NYET
pub const fn ping_applies(high_speed: bool, is_in: bool, periodic: bool, split: bool) -> bool {
    high_speed && !is_in && !periodic && !split
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_transaction_errors_escalate() {
        let stats = RecoveryStats::new();
        let mut counter = ErrorCounter::new();
        assert_eq!(counter.strike(ErrorType::TransactionError, &stats), RecoveryAction::Retry);
        assert_eq!(counter.strike(ErrorType::TransactionError, &stats), RecoveryAction::Retry);
        assert_eq!(counter.strike(ErrorType::TransactionError, &stats), RecoveryAction::Retry);
        assert_eq!(counter.strike(ErrorType::TransactionError, &stats), RecoveryAction::HaltChannel);
        assert_eq!(stats.count(ErrorType::TransactionError), 4);
        assert_eq!(stats.retries(), 3);
        assert_eq!(stats.escalations(), 1);
    }

    #[test]
    fn test_success_clears_strikes() {
        let stats = RecoveryStats::new();
        let mut counter = ErrorCounter::new();
        counter.strike(ErrorType::TransactionError, &stats);
        counter.strike(ErrorType::TransactionError, &stats);
        assert!(counter.in_error_state());
        counter.clear();
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.strike(ErrorType::TransactionError, &stats), RecoveryAction::Retry);
    }

    #[test]
    fn test_fatal_errors_never_retry() {
        let stats = RecoveryStats::new();
        let mut counter = ErrorCounter::new();
        assert_eq!(counter.strike(ErrorType::Babble, &stats), RecoveryAction::Fatal);
        assert_eq!(counter.strike(ErrorType::AhbError, &stats), RecoveryAction::Fatal);
        assert_eq!(counter.strike(ErrorType::Stall, &stats), RecoveryAction::ResetEndpoint);
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn test_stats_count_each_type() {
        let stats = RecoveryStats::new();
        let all = [
            ErrorType::TransactionError,
            ErrorType::Stall,
            ErrorType::Babble,
            ErrorType::DataToggle,
            ErrorType::FrameOverrun,
            ErrorType::AhbError,
        ];
        for (n, error) in all.iter().enumerate() {
            for _ in 0..=n {
                stats.record_error(*error);
            }
        }
        for (n, error) in all.iter().enumerate() {
            assert_eq!(stats.count(*error), n as u32 + 1);
        }
        assert_eq!(stats.total_errors(), 21);
    }

    #[test]
    fn test_data_toggle_advance() {
        assert_eq!(DataPid::Data0.advance(3), DataPid::Data1);
        assert_eq!(DataPid::Data1.advance(2), DataPid::Data1);
        assert_eq!(DataPid::from_bits(2), DataPid::Data1);
        assert_eq!(DataPid::MdataSetup.advance(1), DataPid::MdataSetup);
    }
}
