//! DesignWare USB 2.0 OTG core register interface
//!
//! This module provides the register offsets and bit definitions for the
//! DWC OTG controller, plus the core bring-up sequence shared by host and
//! device mode.
//!
//! # Register Memory Layout
//!
//! The controller exposes one flat 32-bit register window:
//! - Core global registers (offset 0x000-0x0FF)
//! - Tx FIFO size registers (offset 0x100-0x13F)
//! - Host registers and host channels (offset 0x400-0x6FF)
//! - Device registers and endpoints (offset 0x800-0xCFF)
//! - Power and clock gating (offset 0xE00)
//! - Data FIFO push/pop windows (offset 0x1000, one 4 KiB window per FIFO)
//!
//! Field layout is fixed by the hardware. Multi-bit fields are described by a
//! `_MASK` flag and read through the inherent accessors on each register type.

pub mod fifo;
pub mod hwcfg;
pub mod init;
pub mod params;
pub mod register;

pub use fifo::{FifoPartition, FifoRequest};
pub use hwcfg::{Architecture, HwConfig, OtgOpMode};
pub use params::{CoreParams, CoreParamsBuilder, DmaMode, OtgCapability, PhyType, Speed};
pub use register::{Mmio, PollBudget, RegisterAccess};

use bitflags::bitflags;

/// Extract `width` bits starting at `shift`
#[inline(always)]
pub const fn field(value: u32, shift: u32, width: u32) -> u32 {
    (value >> shift) & low_mask(width)
}

/// Place `value` into a `width`-bit field at `shift`, truncating excess bits
#[inline(always)]
pub const fn place(value: u32, shift: u32, width: u32) -> u32 {
    (value & low_mask(width)) << shift
}

#[inline(always)]
const fn low_mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

/// Byte offsets of every register used by the core
pub mod offsets {
    /// OTG Control and Status
    pub const GOTGCTL: usize = 0x000;
    /// OTG Interrupt
    pub const GOTGINT: usize = 0x004;
    /// AHB Configuration
    pub const GAHBCFG: usize = 0x008;
    /// USB Configuration
    pub const GUSBCFG: usize = 0x00C;
    /// Reset Control
    pub const GRSTCTL: usize = 0x010;
    /// Core Interrupt Status
    pub const GINTSTS: usize = 0x014;
    /// Core Interrupt Mask
    pub const GINTMSK: usize = 0x018;
    /// Receive Status Debug Read
    pub const GRXSTSR: usize = 0x01C;
    /// Receive Status Read and Pop
    pub const GRXSTSP: usize = 0x020;
    /// Receive FIFO Size
    pub const GRXFSIZ: usize = 0x024;
    /// Non-periodic Transmit FIFO Size
    pub const GNPTXFSIZ: usize = 0x028;
    /// Non-periodic Transmit FIFO/Queue Status
    pub const GNPTXSTS: usize = 0x02C;
    /// Synopsys ID
    pub const GSNPSID: usize = 0x040;
    /// User HW Config1 (endpoint directions)
    pub const GHWCFG1: usize = 0x044;
    /// User HW Config2
    pub const GHWCFG2: usize = 0x048;
    /// User HW Config3
    pub const GHWCFG3: usize = 0x04C;
    /// User HW Config4
    pub const GHWCFG4: usize = 0x050;
    /// Host Periodic Transmit FIFO Size
    pub const HPTXFSIZ: usize = 0x100;

    /// Host Configuration
    pub const HCFG: usize = 0x400;
    /// Host Frame Interval
    pub const HFIR: usize = 0x404;
    /// Host Frame Number / Frame Time Remaining
    pub const HFNUM: usize = 0x408;
    /// Host Periodic Transmit FIFO/Queue Status
    pub const HPTXSTS: usize = 0x410;
    /// Host All Channels Interrupt
    pub const HAINT: usize = 0x414;
    /// Host All Channels Interrupt Mask
    pub const HAINTMSK: usize = 0x418;
    /// Host Port Control and Status
    pub const HPRT0: usize = 0x440;

    /// Device Configuration
    pub const DCFG: usize = 0x800;
    /// Device Control
    pub const DCTL: usize = 0x804;
    /// Device Status
    pub const DSTS: usize = 0x808;
    /// Device IN Endpoint Common Interrupt Mask
    pub const DIEPMSK: usize = 0x810;
    /// Device OUT Endpoint Common Interrupt Mask
    pub const DOEPMSK: usize = 0x814;
    /// Device All Endpoints Interrupt
    pub const DAINT: usize = 0x818;
    /// Device All Endpoints Interrupt Mask
    pub const DAINTMSK: usize = 0x81C;
    /// Device Threshold Control
    pub const DTHRCTL: usize = 0x830;
    /// Device IN Endpoint FIFO Empty Interrupt Mask
    pub const DIEPEMPMSK: usize = 0x834;

    /// Power and Clock Gating Control
    pub const PCGCCTL: usize = 0xE00;

    const CHANNEL_BASE: usize = 0x500;
    const IN_EP_BASE: usize = 0x900;
    const OUT_EP_BASE: usize = 0xB00;
    const STRIDE: usize = 0x20;

    /// Device IN endpoint Tx FIFO size register for FIFO `n` (1-based)
    pub const fn dieptxf(n: usize) -> usize {
        0x104 + 4 * (n - 1)
    }

    /// Host channel characteristics
    pub const fn hcchar(ch: usize) -> usize {
        CHANNEL_BASE + STRIDE * ch
    }
    /// Host channel split control
    pub const fn hcsplt(ch: usize) -> usize {
        CHANNEL_BASE + STRIDE * ch + 0x04
    }
    /// Host channel interrupt
    pub const fn hcint(ch: usize) -> usize {
        CHANNEL_BASE + STRIDE * ch + 0x08
    }
    /// Host channel interrupt mask
    pub const fn hcintmsk(ch: usize) -> usize {
        CHANNEL_BASE + STRIDE * ch + 0x0C
    }
    /// Host channel transfer size
    pub const fn hctsiz(ch: usize) -> usize {
        CHANNEL_BASE + STRIDE * ch + 0x10
    }
    /// Host channel DMA address
    pub const fn hcdma(ch: usize) -> usize {
        CHANNEL_BASE + STRIDE * ch + 0x14
    }

    /// Device IN endpoint control
    pub const fn diepctl(ep: usize) -> usize {
        IN_EP_BASE + STRIDE * ep
    }
    /// Device IN endpoint interrupt
    pub const fn diepint(ep: usize) -> usize {
        IN_EP_BASE + STRIDE * ep + 0x08
    }
    /// Device IN endpoint transfer size
    pub const fn dieptsiz(ep: usize) -> usize {
        IN_EP_BASE + STRIDE * ep + 0x10
    }
    /// Device IN endpoint DMA address
    pub const fn diepdma(ep: usize) -> usize {
        IN_EP_BASE + STRIDE * ep + 0x14
    }
    /// Device IN endpoint Tx FIFO status
    pub const fn dtxfsts(ep: usize) -> usize {
        IN_EP_BASE + STRIDE * ep + 0x18
    }

    /// Device OUT endpoint control
    pub const fn doepctl(ep: usize) -> usize {
        OUT_EP_BASE + STRIDE * ep
    }
    /// Device OUT endpoint interrupt
    pub const fn doepint(ep: usize) -> usize {
        OUT_EP_BASE + STRIDE * ep + 0x08
    }
    /// Device OUT endpoint transfer size
    pub const fn doeptsiz(ep: usize) -> usize {
        OUT_EP_BASE + STRIDE * ep + 0x10
    }
    /// Device OUT endpoint DMA address
    pub const fn doepdma(ep: usize) -> usize {
        OUT_EP_BASE + STRIDE * ep + 0x14
    }

    /// Data FIFO push/pop window for endpoint or channel `n`
    pub const fn fifo(n: usize) -> usize {
        0x1000 * (n + 1)
    }

    /// How the core treats a write to a register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum WriteSemantics {
        /// Ordinary read/write storage
        Plain,
        /// Bits in the mask are cleared by writing 1; other bits are read-only
        WriteOneToClear(u32),
        /// Bits in the first mask self-clear; bits in the second always read back set
        SelfClearing(u32, u32),
        /// Data FIFO push; the value is consumed by the core
        FifoPush,
    }

    /// Write semantics of the register at `offset`
    ///
    /// Used by register-file models of the core.
    pub const fn write_semantics(offset: usize) -> WriteSemantics {
        // GINTSTS: status bits that are only cleared at their source
        const GINTSTS_W1C: u32 = !((1 << 0)
            | (1 << 4)
            | (1 << 5)
            | (1 << 6)
            | (1 << 7)
            | (1 << 18)
            | (1 << 19)
            | (1 << 24)
            | (1 << 25)
            | (1 << 26));
        match offset {
            GINTSTS => WriteSemantics::WriteOneToClear(GINTSTS_W1C),
            GOTGINT | DAINT | HAINT => WriteSemantics::WriteOneToClear(u32::MAX),
            GRSTCTL => WriteSemantics::SelfClearing(0x3F, 1 << 31),
            o if o >= 0x1000 => WriteSemantics::FifoPush,
            o if o >= CHANNEL_BASE && o < CHANNEL_BASE + 16 * STRIDE && (o - CHANNEL_BASE) % STRIDE == 0x08 => {
                WriteSemantics::WriteOneToClear(u32::MAX)
            }
            o if o >= IN_EP_BASE && o < OUT_EP_BASE + 16 * STRIDE && (o - IN_EP_BASE) % STRIDE == 0x08 => {
                WriteSemantics::WriteOneToClear(u32::MAX)
            }
            _ => WriteSemantics::Plain,
        }
    }
}

bitflags! {
    /// OTG Control and Status Register (GOTGCTL) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GotgCtl: u32 {
        /// Session Request Success (SesReqScs) - Bit 0
        const SESREQSCS = 1 << 0;
        /// Session Request (SesReq) - Bit 1
        const SESREQ = 1 << 1;
        /// Host Negotiation Success (HstNegScs) - Bit 8
        const HSTNEGSCS = 1 << 8;
        /// HNP Request (HNPReq) - Bit 9
        const HNPREQ = 1 << 9;
        /// Host Set HNP Enable (HstSetHNPEn) - Bit 10
        const HSTSETHNPEN = 1 << 10;
        /// Device HNP Enabled (DevHNPEn) - Bit 11
        const DEVHNPEN = 1 << 11;
        /// Connector ID Status (ConIDSts) - Bit 16, set for B-device
        const CONIDSTS = 1 << 16;
        /// A-Session Valid (ASesVld) - Bit 18
        const ASESVLD = 1 << 18;
        /// B-Session Valid (BSesVld) - Bit 19
        const BSESVLD = 1 << 19;
    }
}

bitflags! {
    /// OTG Interrupt Register (GOTGINT) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GotgInt: u32 {
        /// Session End Detected (SesEndDet) - Bit 2
        const SESENDDET = 1 << 2;
        /// Session Request Success Status Change - Bit 8
        const SESREQSUCSTSCHNG = 1 << 8;
        /// Host Negotiation Success Status Change - Bit 9
        const HSTNEGSUCSTSCHNG = 1 << 9;
        /// Host Negotiation Detected (HstNegDet) - Bit 17
        const HSTNEGDET = 1 << 17;
        /// A-Device Timeout Change (ADevTOUTChg) - Bit 18
        const ADEVTOUTCHNG = 1 << 18;
        /// Debounce Done (DbnceDone) - Bit 19
        const DEBDONE = 1 << 19;
    }
}

bitflags! {
    /// AHB Configuration Register (GAHBCFG) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GahbCfg: u32 {
        /// Global Interrupt Mask (GlblIntrMsk) - Bit 0
        const GLBLINTRMSK = 1 << 0;
        /// Burst Length/Type (HBstLen) - Bits [4:1]
        const HBURSTLEN_MASK = 0xF << 1;
        /// DMA Enable (DMAEn) - Bit 5
        const DMAENABLE = 1 << 5;
        /// Non-Periodic TxFIFO Empty Level, set for completely empty - Bit 7
        const NPTXFEMPLVL = 1 << 7;
        /// Periodic TxFIFO Empty Level, set for completely empty - Bit 8
        const PTXFEMPLVL = 1 << 8;
    }
}

impl GahbCfg {
    /// INCR burst type used by internal-DMA cores
    pub const BURST_INCR: u32 = 1;

    /// Encode the burst length field
    pub const fn with_burst(self, hburstlen: u32) -> Self {
        Self::from_bits_retain((self.bits() & !Self::HBURSTLEN_MASK.bits()) | place(hburstlen, 1, 4))
    }

    /// Burst length field
    pub const fn burst(self) -> u32 {
        field(self.bits(), 1, 4)
    }
}

bitflags! {
    /// USB Configuration Register (GUSBCFG) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GusbCfg: u32 {
        /// HS/FS Timeout Calibration - Bits [2:0]
        const TOUTCAL_MASK = 0x7;
        /// PHY Interface 16-bit (PHYIf) - Bit 3
        const PHYIF = 1 << 3;
        /// ULPI or UTMI+ Select, set for ULPI (ULPI_UTMI_Sel) - Bit 4
        const ULPI_UTMI_SEL = 1 << 4;
        /// Full-Speed Serial Interface Select (FSIntf) - Bit 5
        const FSINTF = 1 << 5;
        /// USB 1.1 Full-Speed Serial Transceiver Select (PHYSel) - Bit 6
        const PHYSEL = 1 << 6;
        /// ULPI DDR Select (DDRSel) - Bit 7
        const DDRSEL = 1 << 7;
        /// SRP-Capable (SRPCap) - Bit 8
        const SRPCAP = 1 << 8;
        /// HNP-Capable (HNPCap) - Bit 9
        const HNPCAP = 1 << 9;
        /// USB Turnaround Time (USBTrdTim) - Bits [13:10]
        const USBTRDTIM_MASK = 0xF << 10;
        /// ULPI FS/LS Select (ULPIFsLs) - Bit 17
        const ULPI_FSLS = 1 << 17;
        /// ULPI Clock SuspendM (ULPIClkSusM) - Bit 19
        const ULPI_CLK_SUS_M = 1 << 19;
        /// ULPI External VBUS Drive (ULPIExtVbusDrv) - Bit 20
        const ULPI_EXT_VBUS_DRV = 1 << 20;
        /// TermSel DLine Pulsing Selection (TermSelDLPulse) - Bit 22
        const TERM_SEL_DL_PULSE = 1 << 22;
        /// Force Host Mode (ForceHstMode) - Bit 29
        const FORCE_HOST_MODE = 1 << 29;
        /// Force Device Mode (ForceDevMode) - Bit 30
        const FORCE_DEV_MODE = 1 << 30;
    }
}

impl GusbCfg {
    /// Replace the USB turnaround time field
    pub const fn with_turnaround(self, trdtim: u32) -> Self {
        Self::from_bits_retain((self.bits() & !Self::USBTRDTIM_MASK.bits()) | place(trdtim, 10, 4))
    }

    /// USB turnaround time field
    pub const fn turnaround(self) -> u32 {
        field(self.bits(), 10, 4)
    }
}

bitflags! {
    /// Reset Control Register (GRSTCTL) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GrstCtl: u32 {
        /// Core Soft Reset (CSftRst) - Bit 0
        const CSFTRST = 1 << 0;
        /// HClk Soft Reset (HSftRst) - Bit 1
        const HSFTRST = 1 << 1;
        /// Host Frame Counter Reset (FrmCntrRst) - Bit 2
        const FRMCNTRRST = 1 << 2;
        /// IN Token Sequence Learning Queue Flush (INTknQFlsh) - Bit 3
        const INTKNQFLSH = 1 << 3;
        /// RxFIFO Flush (RxFFlsh) - Bit 4
        const RXFFLSH = 1 << 4;
        /// TxFIFO Flush (TxFFlsh) - Bit 5
        const TXFFLSH = 1 << 5;
        /// TxFIFO Number (TxFNum) - Bits [10:6]
        const TXFNUM_MASK = 0x1F << 6;
        /// DMA Request Signal (DMAReq) - Bit 30
        const DMAREQ = 1 << 30;
        /// AHB Master Idle (AHBIdle) - Bit 31
        const AHBIDLE = 1 << 31;
    }
}

impl GrstCtl {
    /// TxFNum value selecting every Tx FIFO
    pub const ALL_TX_FIFOS: u32 = 0x10;

    /// Tx FIFO flush request for FIFO `num`
    pub const fn tx_flush(num: u32) -> Self {
        Self::from_bits_retain(Self::TXFFLSH.bits() | place(num, 6, 5))
    }
}

bitflags! {
    /// Core Interrupt Register (GINTSTS / GINTMSK) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GintSts: u32 {
        /// Current Mode of Operation, set in host mode (CurMod) - Bit 0
        const CURMODE_HOST = 1 << 0;
        /// Mode Mismatch Interrupt (ModeMis) - Bit 1
        const MODEMISMATCH = 1 << 1;
        /// OTG Interrupt (OTGInt) - Bit 2
        const OTGINTR = 1 << 2;
        /// Start of (micro)Frame (Sof) - Bit 3
        const SOFINTR = 1 << 3;
        /// RxFIFO Non-Empty (RxFLvl) - Bit 4
        const RXSTSQLVL = 1 << 4;
        /// Non-periodic TxFIFO Empty (NPTxFEmp) - Bit 5
        const NPTXFEMPTY = 1 << 5;
        /// Global IN Non-periodic NAK Effective (GINNakEff) - Bit 6
        const GINNAKEFF = 1 << 6;
        /// Global OUT NAK Effective (GOUTNakEff) - Bit 7
        const GOUTNAKEFF = 1 << 7;
        /// Early Suspend (ErlySusp) - Bit 10
        const ERLYSUSPEND = 1 << 10;
        /// USB Suspend (USBSusp) - Bit 11
        const USBSUSPEND = 1 << 11;
        /// USB Reset (USBRst) - Bit 12
        const USBRESET = 1 << 12;
        /// Enumeration Done (EnumDone) - Bit 13
        const ENUMDONE = 1 << 13;
        /// Isochronous OUT Packet Dropped (ISOOutDrop) - Bit 14
        const ISOOUTDROP = 1 << 14;
        /// End of Periodic Frame (EOPF) - Bit 15
        const EOPFRAME = 1 << 15;
        /// Endpoint Mismatch (EPMis) - Bit 17
        const EPMISMATCH = 1 << 17;
        /// IN Endpoints Interrupt (IEPInt) - Bit 18
        const INEPINTR = 1 << 18;
        /// OUT Endpoints Interrupt (OEPInt) - Bit 19
        const OUTEPINTR = 1 << 19;
        /// Incomplete Isochronous IN Transfer (incompISOIN) - Bit 20
        const INCOMPLISOIN = 1 << 20;
        /// Incomplete Isochronous OUT / Periodic Transfer (incomplP) - Bit 21
        const INCOMPLISOOUT = 1 << 21;
        /// Host Port Interrupt (PrtInt) - Bit 24
        const PORTINTR = 1 << 24;
        /// Host Channels Interrupt (HChInt) - Bit 25
        const HCINTR = 1 << 25;
        /// Periodic TxFIFO Empty (PTxFEmp) - Bit 26
        const PTXFEMPTY = 1 << 26;
        /// Connector ID Status Change (ConIDStsChng) - Bit 28
        const CONIDSTSCHNG = 1 << 28;
        /// Disconnect Detected (DisconnInt) - Bit 29
        const DISCONNECT = 1 << 29;
        /// Session Request/New Session Detected (SessReqInt) - Bit 30
        const SESSREQINTR = 1 << 30;
        /// Resume/Remote Wakeup Detected (WkUpInt) - Bit 31
        const WKUPINTR = 1 << 31;
    }
}

impl GintSts {
    /// Interrupts serviced in both host and device mode
    pub const COMMON: Self = Self::from_bits_retain(0xF100_0806);
}

bitflags! {
    /// Receive Status Register (GRXSTSR / GRXSTSP) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GrxSts: u32 {
        /// Endpoint or channel number - Bits [3:0]
        const EPNUM_MASK = 0xF;
        /// Byte Count (BCnt) - Bits [14:4]
        const BCNT_MASK = 0x7FF << 4;
        /// Data PID (DPID) - Bits [16:15]
        const DPID_MASK = 0x3 << 15;
        /// Packet Status (PktSts) - Bits [20:17]
        const PKTSTS_MASK = 0xF << 17;
    }
}

impl GrxSts {
    /// Device: OUT data packet received
    pub const PKTSTS_OUT_DATA: u32 = 2;
    /// Device: OUT transfer completed
    pub const PKTSTS_OUT_COMPLETE: u32 = 3;
    /// Device: SETUP transaction completed
    pub const PKTSTS_SETUP_COMPLETE: u32 = 4;
    /// Device: SETUP data packet received
    pub const PKTSTS_SETUP_DATA: u32 = 6;
    /// Host: IN data packet received
    pub const PKTSTS_IN_DATA: u32 = 2;
    /// Host: IN transfer completed
    pub const PKTSTS_IN_COMPLETE: u32 = 3;
    /// Host: data toggle error
    pub const PKTSTS_DATA_TOGGLE_ERR: u32 = 5;
    /// Host: channel halted
    pub const PKTSTS_CH_HALTED: u32 = 7;

    /// Endpoint or channel number
    pub const fn epnum(self) -> usize {
        field(self.bits(), 0, 4) as usize
    }
    /// Byte count of the popped packet
    pub const fn bcnt(self) -> u32 {
        field(self.bits(), 4, 11)
    }
    /// Packet status
    pub const fn pktsts(self) -> u32 {
        field(self.bits(), 17, 4)
    }
}

bitflags! {
    /// FIFO size registers (GRXFSIZ, GNPTXFSIZ, HPTXFSIZ, DIEPTXFn)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FifoSize: u32 {
        /// Start address in words - Bits [15:0]
        const START_MASK = 0xFFFF;
        /// Depth in words - Bits [31:16]
        const DEPTH_MASK = 0xFFFF << 16;
    }
}

impl FifoSize {
    /// Encode a start/depth pair
    pub const fn new(start: u32, depth: u32) -> Self {
        Self::from_bits_retain(place(start, 0, 16) | place(depth, 16, 16))
    }
    /// Start address in words
    pub const fn start(self) -> u32 {
        field(self.bits(), 0, 16)
    }
    /// Depth in words
    pub const fn depth(self) -> u32 {
        field(self.bits(), 16, 16)
    }
}

bitflags! {
    /// Transmit FIFO/Queue Status (GNPTXSTS, HPTXSTS) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxSts: u32 {
        /// FIFO space available in words - Bits [15:0]
        const FSPCAVAIL_MASK = 0xFFFF;
        /// Request queue space available - Bits [23:16]
        const QSPCAVAIL_MASK = 0xFF << 16;
    }
}

impl TxSts {
    /// Words free in the Tx FIFO
    pub const fn fifo_space(self) -> u32 {
        field(self.bits(), 0, 16)
    }
    /// Free request queue entries
    pub const fn queue_space(self) -> u32 {
        field(self.bits(), 16, 8)
    }
}

bitflags! {
    /// Host Configuration Register (HCFG) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Hcfg: u32 {
        /// FS/LS PHY Clock Select (FSLSPclkSel) - Bits [1:0]
        const FSLSPCLKSEL_MASK = 0x3;
        /// FS- and LS-Only Support (FSLSSupp) - Bit 2
        const FSLSSUPP = 1 << 2;
        /// Enable Scatter/Gather DMA in Host mode (DescDMA) - Bit 23
        const DESCDMA = 1 << 23;
    }
}

impl Hcfg {
    /// PHY clock 30/60 MHz
    pub const CLK_30_60_MHZ: u32 = 0;
    /// PHY clock 48 MHz
    pub const CLK_48_MHZ: u32 = 1;
    /// PHY clock 6 MHz
    pub const CLK_6_MHZ: u32 = 2;
}

/// Host Frame Number register (HFNUM) view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Hfnum(pub u32);

impl Hfnum {
    /// Current (micro)frame number
    pub const fn frnum(self) -> u32 {
        field(self.0, 0, 16)
    }
    /// Time remaining in the current frame
    pub const fn frrem(self) -> u32 {
        field(self.0, 16, 16)
    }
    /// True when the next (micro)frame is odd
    pub const fn next_is_odd(self) -> bool {
        self.frnum() & 1 == 0
    }
}

bitflags! {
    /// Host Port Control and Status Register (HPRT0) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Hprt0: u32 {
        /// Port Connect Status (PrtConnSts) - Bit 0
        const PRTCONNSTS = 1 << 0;
        /// Port Connect Detected (PrtConnDet) - Bit 1, write 1 to clear
        const PRTCONNDET = 1 << 1;
        /// Port Enable (PrtEna) - Bit 2, write 1 disables the port
        const PRTENA = 1 << 2;
        /// Port Enable/Disable Change (PrtEnChng) - Bit 3, write 1 to clear
        const PRTENCHNG = 1 << 3;
        /// Port Overcurrent Active (PrtOvrCurrAct) - Bit 4
        const PRTOVRCURRACT = 1 << 4;
        /// Port Overcurrent Change (PrtOvrCurrChng) - Bit 5, write 1 to clear
        const PRTOVRCURRCHNG = 1 << 5;
        /// Port Resume (PrtRes) - Bit 6
        const PRTRES = 1 << 6;
        /// Port Suspend (PrtSusp) - Bit 7
        const PRTSUSP = 1 << 7;
        /// Port Reset (PrtRst) - Bit 8
        const PRTRST = 1 << 8;
        /// Port Line Status (PrtLnSts) - Bits [11:10]
        const PRTLNSTS_MASK = 0x3 << 10;
        /// Port Power (PrtPwr) - Bit 12
        const PRTPWR = 1 << 12;
        /// Port Test Control (PrtTstCtl) - Bits [16:13]
        const PRTTSTCTL_MASK = 0xF << 13;
        /// Port Speed (PrtSpd) - Bits [18:17]
        const PRTSPD_MASK = 0x3 << 17;
    }
}

impl Hprt0 {
    /// Bits that must be written as zero during a read-modify-write
    pub const W1C_BITS: Self = Self::from_bits_retain(
        Self::PRTCONNDET.bits() | Self::PRTENA.bits() | Self::PRTENCHNG.bits() | Self::PRTOVRCURRCHNG.bits(),
    );

    /// Value safe to write back after changing control bits
    pub const fn preserve(self) -> Self {
        Self::from_bits_retain(self.bits() & !Self::W1C_BITS.bits())
    }

    /// Port speed field (0 high, 1 full, 2 low)
    pub const fn speed(self) -> u32 {
        field(self.bits(), 17, 2)
    }
}

bitflags! {
    /// Host Channel Characteristics Register (HCCHARn) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcChar: u32 {
        /// Maximum Packet Size (MPS) - Bits [10:0]
        const MPS_MASK = 0x7FF;
        /// Endpoint Number (EPNum) - Bits [14:11]
        const EPNUM_MASK = 0xF << 11;
        /// Endpoint Direction, set for IN (EPDir) - Bit 15
        const EPDIR = 1 << 15;
        /// Low-Speed Device (LSpdDev) - Bit 17
        const LSPDDEV = 1 << 17;
        /// Endpoint Type (EPType) - Bits [19:18]
        const EPTYPE_MASK = 0x3 << 18;
        /// Multi Count (MC/EC) - Bits [21:20]
        const MULTICNT_MASK = 0x3 << 20;
        /// Device Address (DevAddr) - Bits [28:22]
        const DEVADDR_MASK = 0x7F << 22;
        /// Odd Frame (OddFrm) - Bit 29
        const ODDFRM = 1 << 29;
        /// Channel Disable (ChDis) - Bit 30
        const CHDIS = 1 << 30;
        /// Channel Enable (ChEna) - Bit 31
        const CHEN = 1 << 31;
    }
}

impl HcChar {
    /// Compose the static characteristics of a channel
    pub const fn new(dev_addr: u8, ep_num: u8, is_in: bool, low_speed: bool, ep_type: u32, mps: u16) -> Self {
        let mut bits = place(mps as u32, 0, 11)
            | place(ep_num as u32, 11, 4)
            | place(ep_type, 18, 2)
            | place(dev_addr as u32, 22, 7);
        if is_in {
            bits |= Self::EPDIR.bits();
        }
        if low_speed {
            bits |= Self::LSPDDEV.bits();
        }
        Self::from_bits_retain(bits)
    }

    /// Replace the multi count field
    pub const fn with_multi_count(self, mc: u32) -> Self {
        Self::from_bits_retain((self.bits() & !Self::MULTICNT_MASK.bits()) | place(mc, 20, 2))
    }

    /// Maximum packet size
    pub const fn mps(self) -> u32 {
        field(self.bits(), 0, 11)
    }
    /// Device address
    pub const fn dev_addr(self) -> u32 {
        field(self.bits(), 22, 7)
    }
    /// Multi count
    pub const fn multi_count(self) -> u32 {
        field(self.bits(), 20, 2)
    }
}

bitflags! {
    /// Host Channel Split Control Register (HCSPLTn) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcSplt: u32 {
        /// Port Address (PrtAddr) - Bits [6:0]
        const PRTADDR_MASK = 0x7F;
        /// Hub Address (HubAddr) - Bits [13:7]
        const HUBADDR_MASK = 0x7F << 7;
        /// Transaction Position (XactPos) - Bits [15:14]
        const XACTPOS_MASK = 0x3 << 14;
        /// Do Complete Split (CompSplt) - Bit 16
        const COMPSPLT = 1 << 16;
        /// Split Enable (SpltEna) - Bit 31
        const SPLTENA = 1 << 31;
    }
}

impl HcSplt {
    /// Compose the split parameters of a channel
    pub const fn new(hub_addr: u8, port_addr: u8, xact_pos: u32, complete: bool) -> Self {
        let mut bits = place(port_addr as u32, 0, 7) | place(hub_addr as u32, 7, 7) | place(xact_pos, 14, 2);
        if complete {
            bits |= Self::COMPSPLT.bits();
        }
        Self::from_bits_retain(bits)
    }
}

bitflags! {
    /// Host Channel Interrupt Register (HCINTn / HCINTMSKn) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcInt: u32 {
        /// Transfer Completed (XferCompl) - Bit 0
        const XFERCOMPL = 1 << 0;
        /// Channel Halted (ChHltd) - Bit 1
        const CHHLTD = 1 << 1;
        /// AHB Error (AHBErr) - Bit 2
        const AHBERR = 1 << 2;
        /// STALL Response Received - Bit 3
        const STALL = 1 << 3;
        /// NAK Response Received - Bit 4
        const NAK = 1 << 4;
        /// ACK Response Received/Transmitted - Bit 5
        const ACK = 1 << 5;
        /// NYET Response Received - Bit 6
        const NYET = 1 << 6;
        /// Transaction Error (XactErr) - Bit 7
        const XACTERR = 1 << 7;
        /// Babble Error (BblErr) - Bit 8
        const BBLERR = 1 << 8;
        /// Frame Overrun (FrmOvrun) - Bit 9
        const FRMOVRUN = 1 << 9;
        /// Data Toggle Error (DataTglErr) - Bit 10
        const DATATGLERR = 1 << 10;
        /// Buffer Not Available (BNA) - Bit 11
        const BNA = 1 << 11;
        /// Excessive Transaction Error - Bit 12
        const XCS_XACT = 1 << 12;
        /// Descriptor List Rollover - Bit 13
        const DESC_LST_ROLL = 1 << 13;
    }
}

bitflags! {
    /// Host Channel Transfer Size Register (HCTSIZn) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcTsiz: u32 {
        /// Transfer Size (XferSize) - Bits [18:0]
        const XFERSIZE_MASK = 0x7FFFF;
        /// Packet Count (PktCnt) - Bits [28:19]
        const PKTCNT_MASK = 0x3FF << 19;
        /// PID (Pid) - Bits [30:29]
        const PID_MASK = 0x3 << 29;
        /// Do Ping (DoPng) - Bit 31
        const DOPNG = 1 << 31;
    }
}

impl HcTsiz {
    /// Buffer/slave layout: transfer size, packet count and starting PID
    pub const fn new(xfersize: u32, pktcnt: u32, pid: u32) -> Self {
        Self::from_bits_retain(place(xfersize, 0, 19) | place(pktcnt, 19, 10) | place(pid, 29, 2))
    }

    /// Descriptor-DMA layout: schedule info, descriptor count and starting PID
    pub const fn new_ddma(schinfo: u8, ntd: u32, pid: u32) -> Self {
        Self::from_bits_retain(place(schinfo as u32, 0, 8) | place(ntd.saturating_sub(1), 8, 8) | place(pid, 29, 2))
    }

    /// Remaining transfer size
    pub const fn xfersize(self) -> u32 {
        field(self.bits(), 0, 19)
    }
    /// Remaining packet count
    pub const fn pktcnt(self) -> u32 {
        field(self.bits(), 19, 10)
    }
    /// Next data PID
    pub const fn pid(self) -> u32 {
        field(self.bits(), 29, 2)
    }
}

bitflags! {
    /// Device Configuration Register (DCFG) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dcfg: u32 {
        /// Device Speed (DevSpd) - Bits [1:0]
        const DEVSPD_MASK = 0x3;
        /// Non-Zero-Length Status OUT Handshake (NZStsOUTHShk) - Bit 2
        const NZSTSOUTHSHK = 1 << 2;
        /// Device Address (DevAddr) - Bits [10:4]
        const DEVADDR_MASK = 0x7F << 4;
        /// Periodic Frame Interval (PerFrInt) - Bits [12:11]
        const PERFRINT_MASK = 0x3 << 11;
        /// Enable Scatter/Gather DMA in Device mode (DescDMA) - Bit 23
        const DESCDMA = 1 << 23;
    }
}

impl Dcfg {
    /// DevSpd: high speed with a UTMI+/ULPI PHY
    pub const SPEED_HIGH: u32 = 0;
    /// DevSpd: full speed with a UTMI+/ULPI PHY
    pub const SPEED_FULL_HS_PHY: u32 = 1;
    /// DevSpd: full speed with a dedicated FS PHY
    pub const SPEED_FULL_FS_PHY: u32 = 3;
    /// PerFrInt: 80 % of the (micro)frame interval
    pub const PERFRINT_80: u32 = 0;

    /// Replace the device address field
    pub const fn with_address(self, addr: u8) -> Self {
        Self::from_bits_retain((self.bits() & !Self::DEVADDR_MASK.bits()) | place(addr as u32, 4, 7))
    }
    /// Device address field
    pub const fn address(self) -> u8 {
        field(self.bits(), 4, 7) as u8
    }
}

bitflags! {
    /// Device Control Register (DCTL) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dctl: u32 {
        /// Remote Wakeup Signaling (RmtWkUpSig) - Bit 0
        const RMTWKUPSIG = 1 << 0;
        /// Soft Disconnect (SftDiscon) - Bit 1
        const SFTDISCON = 1 << 1;
        /// Test Control (TstCtl) - Bits [6:4]
        const TSTCTL_MASK = 0x7 << 4;
        /// Set Global Non-periodic IN NAK (SGNPInNak) - Bit 7
        const SGNPINNAK = 1 << 7;
        /// Clear Global Non-periodic IN NAK (CGNPInNak) - Bit 8
        const CGNPINNAK = 1 << 8;
        /// Set Global OUT NAK (SGOUTNak) - Bit 9
        const SGOUTNAK = 1 << 9;
        /// Clear Global OUT NAK (CGOUTNak) - Bit 10
        const CGOUTNAK = 1 << 10;
        /// Ignore Frame Number for isochronous endpoints (IgnrFrmNum) - Bit 15
        const IFRMNUM = 1 << 15;
    }
}

impl Dctl {
    /// Test mode selector value
    pub const fn with_test_mode(self, selector: u32) -> Self {
        Self::from_bits_retain((self.bits() & !Self::TSTCTL_MASK.bits()) | place(selector, 4, 3))
    }
}

/// Device Status register (DSTS) view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Dsts(pub u32);

impl Dsts {
    /// Enumerated speed: high speed 30/60 MHz
    pub const ENUMSPD_HS: u32 = 0;
    /// Enumerated speed: full speed on HS PHY
    pub const ENUMSPD_FS_HS_PHY: u32 = 1;
    /// Enumerated speed: low speed
    pub const ENUMSPD_LS: u32 = 2;
    /// Enumerated speed: full speed 48 MHz
    pub const ENUMSPD_FS_48: u32 = 3;

    /// Suspend status
    pub const fn suspended(self) -> bool {
        self.0 & 1 != 0
    }
    /// Enumerated speed field
    pub const fn enumspd(self) -> u32 {
        field(self.0, 1, 2)
    }
    /// Frame number of the received SOF
    pub const fn soffn(self) -> u32 {
        field(self.0, 8, 14)
    }
}

bitflags! {
    /// Device IN Endpoint Interrupt (DIEPINTn / DIEPMSK) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiepInt: u32 {
        /// Transfer Completed (XferCompl) - Bit 0
        const XFERCOMPL = 1 << 0;
        /// Endpoint Disabled (EPDisbld) - Bit 1
        const EPDISABLED = 1 << 1;
        /// AHB Error (AHBErr) - Bit 2
        const AHBERR = 1 << 2;
        /// Timeout Condition (TimeOUT) - Bit 3
        const TIMEOUT = 1 << 3;
        /// IN Token Received When TxFIFO is Empty (INTknTXFEmp) - Bit 4
        const INTKNTXFEMP = 1 << 4;
        /// IN Token Received with EP Mismatch (INTknEPMis) - Bit 5
        const INTKNEPMIS = 1 << 5;
        /// IN Endpoint NAK Effective (INEPNakEff) - Bit 6
        const INEPNAKEFF = 1 << 6;
        /// Transmit FIFO Empty (TxFEmp) - Bit 7
        const TXFEMPTY = 1 << 7;
        /// Fifo Underrun (TxfifoUndrn) - Bit 8
        const TXFIFOUNDRN = 1 << 8;
        /// Buffer Not Available (BNAIntr) - Bit 9
        const BNA = 1 << 9;
        /// NAK Interrupt - Bit 13
        const NAK = 1 << 13;
    }
}

bitflags! {
    /// Device OUT Endpoint Interrupt (DOEPINTn / DOEPMSK) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DoepInt: u32 {
        /// Transfer Completed (XferCompl) - Bit 0
        const XFERCOMPL = 1 << 0;
        /// Endpoint Disabled (EPDisbld) - Bit 1
        const EPDISABLED = 1 << 1;
        /// AHB Error (AHBErr) - Bit 2
        const AHBERR = 1 << 2;
        /// SETUP Phase Done (SetUp) - Bit 3
        const SETUP = 1 << 3;
        /// OUT Token Received When Endpoint Disabled - Bit 4
        const OUTTKNEPDIS = 1 << 4;
        /// Status Phase Received for Control Write - Bit 5
        const STSPHSERCVD = 1 << 5;
        /// Back-to-Back SETUP Packets Received - Bit 6
        const BACK2BACKSETUP = 1 << 6;
        /// OUT Packet Error - Bit 8
        const OUTPKTERR = 1 << 8;
        /// Buffer Not Available (BNAIntr) - Bit 9
        const BNA = 1 << 9;
        /// Babble Error - Bit 12
        const BABBLE = 1 << 12;
        /// NAK Interrupt - Bit 13
        const NAK = 1 << 13;
        /// NYET Interrupt - Bit 14
        const NYET = 1 << 14;
    }
}

bitflags! {
    /// Device Endpoint Control Register (DIEPCTLn / DOEPCTLn) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DepCtl: u32 {
        /// Maximum Packet Size (MPS) - Bits [10:0]; EP0 uses a 2-bit code
        const MPS_MASK = 0x7FF;
        /// Next Endpoint, shared FIFO mode (NextEp) - Bits [14:11]
        const NEXTEP_MASK = 0xF << 11;
        /// USB Active Endpoint (USBActEP) - Bit 15
        const USBACTEP = 1 << 15;
        /// Endpoint Data PID / Even-Odd Frame (DPID) - Bit 16
        const DPID = 1 << 16;
        /// NAK Status (NAKSts) - Bit 17
        const NAKSTS = 1 << 17;
        /// Endpoint Type (EPType) - Bits [19:18]
        const EPTYPE_MASK = 0x3 << 18;
        /// Snoop Mode (Snp) - Bit 20
        const SNP = 1 << 20;
        /// STALL Handshake (Stall) - Bit 21
        const STALL = 1 << 21;
        /// TxFIFO Number (TxFNum) - Bits [25:22]
        const TXFNUM_MASK = 0xF << 22;
        /// Clear NAK (CNAK) - Bit 26
        const CNAK = 1 << 26;
        /// Set NAK (SNAK) - Bit 27
        const SNAK = 1 << 27;
        /// Set DATA0 PID / Set Even Frame (SetD0PID) - Bit 28
        const SETD0PID = 1 << 28;
        /// Set DATA1 PID / Set Odd Frame (SetD1PID) - Bit 29
        const SETD1PID = 1 << 29;
        /// Endpoint Disable (EPDis) - Bit 30
        const EPDIS = 1 << 30;
        /// Endpoint Enable (EPEna) - Bit 31
        const EPENA = 1 << 31;
    }
}

impl DepCtl {
    /// EP0 max packet size code for 64 bytes
    pub const EP0_MPS_64: u32 = 0;
    /// EP0 max packet size code for 8 bytes
    pub const EP0_MPS_8: u32 = 3;

    /// Replace the max packet size field
    pub const fn with_mps(self, mps: u32) -> Self {
        Self::from_bits_retain((self.bits() & !Self::MPS_MASK.bits()) | place(mps, 0, 11))
    }
    /// Replace the endpoint type field
    pub const fn with_type(self, ep_type: u32) -> Self {
        Self::from_bits_retain((self.bits() & !Self::EPTYPE_MASK.bits()) | place(ep_type, 18, 2))
    }
    /// Replace the Tx FIFO number field
    pub const fn with_txfnum(self, fifo: u32) -> Self {
        Self::from_bits_retain((self.bits() & !Self::TXFNUM_MASK.bits()) | place(fifo, 22, 4))
    }
    /// Replace the next-endpoint field
    pub const fn with_nextep(self, ep: u32) -> Self {
        Self::from_bits_retain((self.bits() & !Self::NEXTEP_MASK.bits()) | place(ep, 11, 4))
    }
    /// Max packet size field
    pub const fn mps(self) -> u32 {
        field(self.bits(), 0, 11)
    }
    /// Endpoint type field
    pub const fn ep_type(self) -> u32 {
        field(self.bits(), 18, 2)
    }
    /// Tx FIFO number field
    pub const fn txfnum(self) -> u32 {
        field(self.bits(), 22, 4)
    }
}

bitflags! {
    /// Device Endpoint Transfer Size Register (DIEPTSIZn / DOEPTSIZn) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DepTsiz: u32 {
        /// Transfer Size (XferSize) - Bits [18:0]
        const XFERSIZE_MASK = 0x7FFFF;
        /// Packet Count (PktCnt) - Bits [28:19]
        const PKTCNT_MASK = 0x3FF << 19;
        /// Multi Count (IN) / SETUP Packet Count (EP0 OUT) - Bits [30:29]
        const MC_MASK = 0x3 << 29;
    }
}

impl DepTsiz {
    /// Compose transfer size and packet count
    pub const fn new(xfersize: u32, pktcnt: u32) -> Self {
        Self::from_bits_retain(place(xfersize, 0, 19) | place(pktcnt, 19, 10))
    }
    /// Replace the multi count / SETUP count field
    pub const fn with_mc(self, mc: u32) -> Self {
        Self::from_bits_retain((self.bits() & !Self::MC_MASK.bits()) | place(mc, 29, 2))
    }
    /// Remaining transfer size
    pub const fn xfersize(self) -> u32 {
        field(self.bits(), 0, 19)
    }
    /// Remaining packet count
    pub const fn pktcnt(self) -> u32 {
        field(self.bits(), 19, 10)
    }
    /// Remaining EP0 transfer size (7-bit field)
    pub const fn ep0_xfersize(self) -> u32 {
        field(self.bits(), 0, 7)
    }
    /// Multi count / SETUP count
    pub const fn mc(self) -> u32 {
        field(self.bits(), 29, 2)
    }
}

bitflags! {
    /// Device Threshold Control Register (DTHRCTL) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DthrCtl: u32 {
        /// Non-ISO IN Endpoints Threshold Enable - Bit 0
        const NON_ISO_THR_EN = 1 << 0;
        /// ISO IN Endpoints Threshold Enable - Bit 1
        const ISO_THR_EN = 1 << 1;
        /// Transmit Threshold Length - Bits [10:2]
        const TX_THR_LEN_MASK = 0x1FF << 2;
        /// Receive Threshold Enable - Bit 16
        const RX_THR_EN = 1 << 16;
        /// Receive Threshold Length - Bits [25:17]
        const RX_THR_LEN_MASK = 0x1FF << 17;
    }
}

impl DthrCtl {
    /// Compose thresholding control from the enable bitmap and lengths
    ///
    /// `thr_ctl` bit 0 enables non-ISO Tx, bit 1 ISO Tx, bit 2 Rx thresholding.
    pub const fn new(thr_ctl: u8, tx_len: u32, rx_len: u32) -> Self {
        let mut bits = place(tx_len, 2, 9) | place(rx_len, 17, 9);
        if thr_ctl & 0b001 != 0 {
            bits |= Self::NON_ISO_THR_EN.bits();
        }
        if thr_ctl & 0b010 != 0 {
            bits |= Self::ISO_THR_EN.bits();
        }
        if thr_ctl & 0b100 != 0 {
            bits |= Self::RX_THR_EN.bits();
        }
        Self::from_bits_retain(bits)
    }
}

/// Default poll budgets for the bounded hardware waits
pub mod timeouts {
    use super::register::PollBudget;

    /// AHB master idle before soft reset
    pub const AHB_IDLE: PollBudget = PollBudget::new(100_000, 1);
    /// Soft reset self-clear
    pub const CORE_RESET: PollBudget = PollBudget::new(10_000, 1);
    /// Tx/Rx FIFO flush self-clear
    pub const FIFO_FLUSH: PollBudget = PollBudget::new(10_000, 1);
    /// Host channel disable during host init
    pub const CHANNEL_HALT: PollBudget = PollBudget::new(1_000, 1);
    /// Current-mode bit after a connector ID change (100 ms steps)
    pub const MODE_SWITCH: PollBudget = PollBudget::new(10_000, 100_000);
    /// Settle time after soft reset in microseconds
    pub const POST_RESET_SETTLE_US: u32 = 100_000;
    /// Settle time after a FIFO flush in microseconds
    pub const POST_FLUSH_SETTLE_US: u32 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitflag_definitions() {
        assert_eq!(GintSts::WKUPINTR.bits(), 1 << 31);
        assert_eq!(GintSts::COMMON.bits(), 0xF100_0806);
        assert!(GintSts::COMMON.contains(GintSts::OTGINTR | GintSts::CONIDSTSCHNG | GintSts::DISCONNECT));
        assert_eq!(DepCtl::EPENA.bits(), 1 << 31);
        assert_eq!(HcChar::CHDIS.bits(), 1 << 30);
    }

    #[test]
    fn test_register_offsets() {
        assert_eq!(offsets::diepctl(0), 0x900);
        assert_eq!(offsets::doeptsiz(2), 0xB50);
        assert_eq!(offsets::hcint(3), 0x568);
        assert_eq!(offsets::dieptxf(1), 0x104);
        assert_eq!(offsets::dieptxf(4), 0x110);
        assert_eq!(offsets::fifo(0), 0x1000);
    }

    #[test]
    fn test_field_accessors() {
        let tsiz = DepTsiz::new(1536, 3);
        assert_eq!(tsiz.xfersize(), 1536);
        assert_eq!(tsiz.pktcnt(), 3);

        let hcchar = HcChar::new(5, 2, true, false, 3, 64).with_multi_count(1);
        assert_eq!(hcchar.mps(), 64);
        assert_eq!(hcchar.dev_addr(), 5);
        assert_eq!(hcchar.multi_count(), 1);
        assert!(hcchar.contains(HcChar::EPDIR));

        let dsts = Dsts(0x1234 << 8 | 0b010);
        assert_eq!(dsts.soffn(), 0x1234);
        assert_eq!(dsts.enumspd(), 1);
    }

    #[test]
    fn test_hprt0_preserve_masks_change_bits() {
        let hprt = Hprt0::PRTPWR | Hprt0::PRTENA | Hprt0::PRTCONNDET;
        assert_eq!(hprt.preserve(), Hprt0::PRTPWR);
    }

    #[test]
    fn test_write_semantics() {
        use offsets::WriteSemantics;
        assert!(matches!(offsets::write_semantics(offsets::hcint(0)), WriteSemantics::WriteOneToClear(_)));
        assert!(matches!(offsets::write_semantics(offsets::doepint(5)), WriteSemantics::WriteOneToClear(_)));
        assert_eq!(offsets::write_semantics(offsets::doepctl(5)), WriteSemantics::Plain);
        assert_eq!(offsets::write_semantics(offsets::fifo(1)), WriteSemantics::FifoPush);
    }
}
