//! Top-level interrupt dispatch
//!
//! [`dispatch`] reads GINTSTS against GINTMSK once, walks the pending sources
//! in a fixed order and hands each one to an [`InterruptSink`]. Sources whose
//! status bit is write-1-to-clear are acknowledged right after their handler
//! ran; the rest clear at their own source register (GOTGINT, DAINT, HAINT,
//! HPRT0, the FIFOs).

use crate::dwc::{offsets, GintSts, RegisterAccess};
use core::sync::atomic::{AtomicU32, Ordering};

/// One GINTSTS interrupt source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Source {
    /// Register access for the other mode
    ModeMismatch,
    /// GOTGINT has events
    Otg,
    /// Connector ID pin changed
    ConnectorIdChange,
    /// Device disconnected (host) or session lost
    Disconnect,
    /// Session request or new session detected
    SessionRequest,
    /// Resume or remote wakeup
    Wakeup,
    /// Bus suspend
    Suspend,
    /// Rx status queue not empty (slave mode)
    RxFifoLevel,
    /// Non-periodic Tx FIFO has room (slave mode)
    NonPeriodicTxEmpty,
    /// Periodic Tx FIFO has room (slave mode)
    PeriodicTxEmpty,
    /// Start of (micro)frame
    StartOfFrame,
    /// Root port change
    Port,
    /// Host channel interrupts in HAINT
    Channels,
    /// 3 ms of idle bus
    EarlySuspend,
    /// USB reset
    UsbReset,
    /// Speed enumeration done
    EnumerationDone,
    /// Isochronous OUT packet dropped for lack of Rx FIFO space
    IsoOutDrop,
    /// End of the periodic frame interval
    EndOfPeriodicFrame,
    /// IN token for an endpoint other than the head of the shared FIFO
    EndpointMismatch,
    /// IN endpoint interrupts in DAINT
    InEndpoints,
    /// OUT endpoint interrupts in DAINT
    OutEndpoints,
    /// Isochronous IN transfer missed its frame
    IncompleteIsoIn,
    /// Isochronous OUT transfer missed its frame
    IncompleteIsoOut,
}

impl Source {
    /// GINTSTS bit of this source
    pub const fn bit(self) -> GintSts {
        match self {
            Self::ModeMismatch => GintSts::MODEMISMATCH,
            Self::Otg => GintSts::OTGINTR,
            Self::ConnectorIdChange => GintSts::CONIDSTSCHNG,
            Self::Disconnect => GintSts::DISCONNECT,
            Self::SessionRequest => GintSts::SESSREQINTR,
            Self::Wakeup => GintSts::WKUPINTR,
            Self::Suspend => GintSts::USBSUSPEND,
            Self::RxFifoLevel => GintSts::RXSTSQLVL,
            Self::NonPeriodicTxEmpty => GintSts::NPTXFEMPTY,
            Self::PeriodicTxEmpty => GintSts::PTXFEMPTY,
            Self::StartOfFrame => GintSts::SOFINTR,
            Self::Port => GintSts::PORTINTR,
            Self::Channels => GintSts::HCINTR,
            Self::EarlySuspend => GintSts::ERLYSUSPEND,
            Self::UsbReset => GintSts::USBRESET,
            Self::EnumerationDone => GintSts::ENUMDONE,
            Self::IsoOutDrop => GintSts::ISOOUTDROP,
            Self::EndOfPeriodicFrame => GintSts::EOPFRAME,
            Self::EndpointMismatch => GintSts::EPMISMATCH,
            Self::InEndpoints => GintSts::INEPINTR,
            Self::OutEndpoints => GintSts::OUTEPINTR,
            Self::IncompleteIsoIn => GintSts::INCOMPLISOIN,
            Self::IncompleteIsoOut => GintSts::INCOMPLISOOUT,
        }
    }

    /// The status bit clears at its source rather than by writing GINTSTS
    pub const fn cleared_at_source(self) -> bool {
        matches!(
            self,
            Self::Otg
                | Self::RxFifoLevel
                | Self::NonPeriodicTxEmpty
                | Self::PeriodicTxEmpty
                | Self::Port
                | Self::Channels
                | Self::InEndpoints
                | Self::OutEndpoints
        )
    }
}

const SOURCE_COUNT: usize = 23;

/// Sources serviced in either mode, highest priority first
const COMMON_ORDER: [Source; 7] = [
    Source::ModeMismatch,
    Source::Otg,
    Source::ConnectorIdChange,
    Source::Disconnect,
    Source::SessionRequest,
    Source::Wakeup,
    Source::Suspend,
];

const DEVICE_ORDER: [Source; 14] = [
    Source::StartOfFrame,
    Source::RxFifoLevel,
    Source::NonPeriodicTxEmpty,
    Source::PeriodicTxEmpty,
    Source::EarlySuspend,
    Source::UsbReset,
    Source::EnumerationDone,
    Source::IsoOutDrop,
    Source::EndOfPeriodicFrame,
    Source::EndpointMismatch,
    Source::InEndpoints,
    Source::OutEndpoints,
    Source::IncompleteIsoIn,
    Source::IncompleteIsoOut,
];

const HOST_ORDER: [Source; 6] = [
    Source::StartOfFrame,
    Source::RxFifoLevel,
    Source::NonPeriodicTxEmpty,
    Source::PeriodicTxEmpty,
    Source::Port,
    Source::Channels,
];

/// Receiver of dispatched interrupt sources
pub trait InterruptSink {
    /// Service `source`; false when nothing handles it
    ///
    /// `host` is the core mode latched when the dispatch started.
    fn service(&mut self, source: Source, host: bool) -> bool;
}

/// Lock-free interrupt counters
pub struct InterruptStats {
    by_source: [AtomicU32; SOURCE_COUNT],
    dispatches: AtomicU32,
    spurious: AtomicU32,
    unhandled: AtomicU32,
}

impl InterruptStats {
    /// All counters at zero
    pub const fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            by_source: [ZERO; SOURCE_COUNT],
            dispatches: AtomicU32::new(0),
            spurious: AtomicU32::new(0),
            unhandled: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    fn record(&self, source: Source) {
        self.by_source[source as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Times `source` was serviced
    pub fn count(&self, source: Source) -> u32 {
        self.by_source[source as usize].load(Ordering::Relaxed)
    }

    /// Calls into [`dispatch`]
    pub fn dispatches(&self) -> u32 {
        self.dispatches.load(Ordering::Relaxed)
    }

    /// Dispatches that found nothing pending
    pub fn spurious(&self) -> u32 {
        self.spurious.load(Ordering::Relaxed)
    }

    /// Pending sources nothing serviced
    pub fn unhandled(&self) -> u32 {
        self.unhandled.load(Ordering::Relaxed)
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in &self.by_source {
            counter.store(0, Ordering::Relaxed);
        }
        self.dispatches.store(0, Ordering::Relaxed);
        self.spurious.store(0, Ordering::Relaxed);
        self.unhandled.store(0, Ordering::Relaxed);
    }
}

impl Default for InterruptStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending and unmasked interrupt sources
pub fn pending(regs: &dyn RegisterAccess) -> GintSts {
    GintSts::from_bits_retain(regs.read(offsets::GINTSTS) & regs.read(offsets::GINTMSK)) - GintSts::CURMODE_HOST
}

/// Service every pending source once
///
/// Returns the sources that were pending on entry. A pending bit with no
/// handler is acknowledged and counted; debug builds assert on it.
pub fn dispatch(regs: &dyn RegisterAccess, sink: &mut dyn InterruptSink, stats: &InterruptStats) -> GintSts {
    stats.dispatches.fetch_add(1, Ordering::Relaxed);
    let raw = GintSts::from_bits_retain(regs.read(offsets::GINTSTS));
    let pending = (raw & GintSts::from_bits_retain(regs.read(offsets::GINTMSK))) - GintSts::CURMODE_HOST;
    if pending.is_empty() {
        stats.spurious.fetch_add(1, Ordering::Relaxed);
        return pending;
    }

    let host = raw.contains(GintSts::CURMODE_HOST);
    let mode_order: &[Source] = if host { &HOST_ORDER } else { &DEVICE_ORDER };
    let mut seen = GintSts::empty();

    for &source in COMMON_ORDER.iter().chain(mode_order) {
        let bit = source.bit();
        if !pending.contains(bit) {
            continue;
        }
        seen |= bit;
        stats.record(source);
        if !sink.service(source, host) {
            unhandled(stats, source);
        }
        if !source.cleared_at_source() {
            regs.write(offsets::GINTSTS, bit.bits());
        }
    }

    // Masked in, but not a source of the current mode
    let stray = pending - seen;
    if !stray.is_empty() {
        #[cfg(feature = "defmt")]
        defmt::warn!("Interrupt bits {:#010x} not serviced in {} mode", stray.bits(), if host { "host" } else { "device" });
        stats.unhandled.fetch_add(stray.bits().count_ones(), Ordering::Relaxed);
        regs.write(offsets::GINTSTS, stray.bits());
        debug_assert!(stray.is_empty(), "unserviced interrupt bits {:#010x}", stray.bits());
    }
    pending
}

fn unhandled(stats: &InterruptStats, _source: Source) {
    stats.unhandled.fetch_add(1, Ordering::Relaxed);
    #[cfg(feature = "defmt")]
    defmt::warn!("Unhandled interrupt source {}", _source);
    debug_assert!(false, "unhandled interrupt source {:?}", _source);
}
