//! Core configuration parameters
//!
//! Parameters are requested by the integrator through [`CoreParamsBuilder`] and
//! reconciled with the decoded [`HwConfig`] at init. Requests the hardware
//! cannot honour fall back to the nearest supported setting.

use super::hwcfg::{Architecture, HwConfig};
use super::register::PollBudget;
use super::timeouts;

/// Maximum number of device endpoints per direction, EP0 included
pub const MAX_EPS: usize = 16;

/// Maximum number of host channels
pub const MAX_CHANNELS: usize = 16;

/// Requested bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    /// High speed when the PHY supports it
    High,
    /// Full speed only
    Full,
}

/// PHY interface selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PhyType {
    /// Dedicated full-speed serial transceiver
    FullSpeed,
    /// UTMI+ parallel interface
    Utmi,
    /// ULPI interface
    Ulpi,
}

/// Requested OTG capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtgCapability {
    /// Host negotiation and session request
    HnpSrp,
    /// Session request only
    SrpOnly,
    /// Neither
    None,
}

/// Data movement mode, fixed after init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaMode {
    /// CPU moves every packet through the data FIFOs
    Slave,
    /// Core DMA master with one buffer address per transfer
    BufferDma,
    /// Core walks a descriptor list (scatter/gather)
    DescriptorDma,
}

impl DmaMode {
    /// True for either DMA mode
    pub const fn uses_dma(self) -> bool {
        !matches!(self, Self::Slave)
    }
}

/// Controller configuration, fixed after init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CoreParams {
    /// Use a DMA mode when the hardware has a DMA master
    pub dma_enable: bool,
    /// Use scatter/gather descriptor DMA when supported
    pub dma_desc_enable: bool,
    /// AHB burst size in 32-bit words (external DMA only)
    pub dma_burst_size: u32,
    /// Requested bus speed
    pub speed: Speed,
    /// PHY interface
    pub phy_type: PhyType,
    /// UTMI+ data width in bits (8 or 16)
    pub phy_utmi_width: u8,
    /// ULPI double data rate
    pub phy_ulpi_ddr: bool,
    /// ULPI PHY drives VBUS through an external supply
    pub phy_ulpi_ext_vbus: bool,
    /// ULPI FS/LS serial mode when the hardware supports it
    pub ulpi_fs_ls: bool,
    /// TermSel DLine pulsing for SRP
    pub ts_dline: bool,
    /// 6 MHz PHY clock for low-speed-only host operation
    pub host_ls_low_power_phy_clk: bool,
    /// Requested OTG capability
    pub otg_cap: OtgCapability,
    /// Device Rx FIFO depth in words
    pub dev_rx_fifo_size: u16,
    /// Device non-periodic (EP0) Tx FIFO depth in words
    pub dev_nperio_tx_fifo_size: u16,
    /// Per-IN-endpoint Tx FIFO depth in words, index 0 is FIFO 1
    pub dev_tx_fifo_size: [u16; MAX_EPS - 1],
    /// Host Rx FIFO depth in words
    pub host_rx_fifo_size: u16,
    /// Host non-periodic Tx FIFO depth in words
    pub host_nperio_tx_fifo_size: u16,
    /// Host periodic Tx FIFO depth in words
    pub host_perio_tx_fifo_size: u16,
    /// Upper bound on a single programmed transfer
    pub max_transfer_size: u32,
    /// Upper bound on a single programmed packet count
    pub max_packet_count: u32,
    /// Host channels to use
    pub host_channels: u8,
    /// Device endpoints to use, EP0 excluded
    pub dev_endpoints: u8,
    /// Thresholding enable bitmap (bit 0 non-ISO Tx, bit 1 ISO Tx, bit 2 Rx)
    pub thr_ctl: u8,
    /// Tx threshold length in words
    pub tx_thr_length: u32,
    /// Rx threshold length in words
    pub rx_thr_length: u32,
    /// Periodic transfer interrupt enhancement (suppresses incomplete-ISO interrupts)
    pub pti_enable: bool,
    /// Bound on the AHB idle wait before soft reset
    pub ahb_idle_budget: PollBudget,
    /// Bound on the soft reset wait
    pub reset_budget: PollBudget,
    /// Bound on FIFO flush waits
    pub flush_budget: PollBudget,
    /// Bound on the current-mode wait after a connector ID change
    pub mode_switch_budget: PollBudget,
}

impl Default for CoreParams {
    fn default() -> Self {
        CoreParamsBuilder::new().build()
    }
}

impl CoreParams {
    /// Reconcile the requested parameters with the hardware
    pub fn reconcile(mut self, hw: &HwConfig) -> Self {
        if matches!(hw.architecture, Architecture::SlaveOnly) {
            self.dma_enable = false;
        }
        if !self.dma_enable || !hw.desc_dma {
            if self.dma_desc_enable {
                #[cfg(feature = "defmt")]
                defmt::warn!("Descriptor DMA not available, falling back to buffer DMA");
            }
            self.dma_desc_enable = false;
        }
        if self.speed == Speed::High && hw.hs_phy_type == 0 {
            self.speed = Speed::Full;
        }
        if hw.hs_phy_type == 0 {
            self.phy_type = PhyType::FullSpeed;
        }
        self.max_transfer_size = self.max_transfer_size.min(hw.max_transfer_size());
        self.max_packet_count = self.max_packet_count.min(hw.max_packet_count());
        self.host_channels = self.host_channels.min(hw.num_host_channels).min(MAX_CHANNELS as u8);
        self.dev_endpoints = self.dev_endpoints.min(hw.num_dev_eps).min(MAX_EPS as u8 - 1);
        self
    }

    /// Data movement mode selected by the (reconciled) parameters
    pub const fn dma_mode(&self) -> DmaMode {
        match (self.dma_enable, self.dma_desc_enable) {
            (false, _) => DmaMode::Slave,
            (true, false) => DmaMode::BufferDma,
            (true, true) => DmaMode::DescriptorDma,
        }
    }

    /// Tx FIFO depth requested for FIFO `n` (1-based)
    pub fn tx_fifo_size(&self, n: usize) -> u16 {
        self.dev_tx_fifo_size.get(n.wrapping_sub(1)).copied().unwrap_or(0)
    }
}

/// Builder for [`CoreParams`]
#[derive(Debug, Clone, Copy)]
pub struct CoreParamsBuilder {
    params: CoreParams,
}

impl CoreParamsBuilder {
    /// Start from the defaults: buffer DMA, high speed UTMI+ 8-bit, HNP/SRP,
    /// 1024-word device Rx FIFO and 256-word Tx FIFOs
    pub const fn new() -> Self {
        Self {
            params: CoreParams {
                dma_enable: true,
                dma_desc_enable: false,
                dma_burst_size: 32,
                speed: Speed::High,
                phy_type: PhyType::Utmi,
                phy_utmi_width: 8,
                phy_ulpi_ddr: false,
                phy_ulpi_ext_vbus: false,
                ulpi_fs_ls: false,
                ts_dline: false,
                host_ls_low_power_phy_clk: false,
                otg_cap: OtgCapability::HnpSrp,
                dev_rx_fifo_size: 1024,
                dev_nperio_tx_fifo_size: 256,
                dev_tx_fifo_size: [256; MAX_EPS - 1],
                host_rx_fifo_size: 1024,
                host_nperio_tx_fifo_size: 1024,
                host_perio_tx_fifo_size: 1024,
                max_transfer_size: 65_535,
                max_packet_count: 511,
                host_channels: 8,
                dev_endpoints: 8,
                thr_ctl: 0,
                tx_thr_length: 64,
                rx_thr_length: 64,
                pti_enable: false,
                ahb_idle_budget: timeouts::AHB_IDLE,
                reset_budget: timeouts::CORE_RESET,
                flush_budget: timeouts::FIFO_FLUSH,
                mode_switch_budget: timeouts::MODE_SWITCH,
            },
        }
    }

    /// Enable or disable DMA
    pub const fn dma(mut self, enabled: bool) -> Self {
        self.params.dma_enable = enabled;
        self
    }

    /// Enable or disable scatter/gather descriptor DMA
    pub const fn descriptor_dma(mut self, enabled: bool) -> Self {
        self.params.dma_desc_enable = enabled;
        self
    }

    /// AHB burst size in words
    pub const fn dma_burst_size(mut self, words: u32) -> Self {
        self.params.dma_burst_size = words;
        self
    }

    /// Requested bus speed
    pub const fn speed(mut self, speed: Speed) -> Self {
        self.params.speed = speed;
        self
    }

    /// PHY interface
    pub const fn phy(mut self, phy_type: PhyType) -> Self {
        self.params.phy_type = phy_type;
        self
    }

    /// UTMI+ data width in bits
    pub const fn utmi_width(mut self, bits: u8) -> Self {
        self.params.phy_utmi_width = bits;
        self
    }

    /// ULPI double data rate
    pub const fn ulpi_ddr(mut self, enabled: bool) -> Self {
        self.params.phy_ulpi_ddr = enabled;
        self
    }

    /// ULPI external VBUS drive
    pub const fn ulpi_ext_vbus(mut self, enabled: bool) -> Self {
        self.params.phy_ulpi_ext_vbus = enabled;
        self
    }

    /// ULPI FS/LS serial mode
    pub const fn ulpi_fs_ls(mut self, enabled: bool) -> Self {
        self.params.ulpi_fs_ls = enabled;
        self
    }

    /// TermSel DLine pulsing
    pub const fn ts_dline(mut self, enabled: bool) -> Self {
        self.params.ts_dline = enabled;
        self
    }

    /// 6 MHz PHY clock for low-speed-only hosts
    pub const fn host_ls_low_power_phy_clk(mut self, enabled: bool) -> Self {
        self.params.host_ls_low_power_phy_clk = enabled;
        self
    }

    /// OTG capability
    pub const fn otg_capability(mut self, cap: OtgCapability) -> Self {
        self.params.otg_cap = cap;
        self
    }

    /// Device Rx and non-periodic Tx FIFO depths in words
    pub const fn device_fifos(mut self, rx: u16, nperio_tx: u16) -> Self {
        self.params.dev_rx_fifo_size = rx;
        self.params.dev_nperio_tx_fifo_size = nperio_tx;
        self
    }

    /// Tx FIFO depth for device FIFO `n` (1-based)
    pub const fn device_tx_fifo(mut self, n: usize, depth: u16) -> Self {
        if n >= 1 && n < MAX_EPS {
            self.params.dev_tx_fifo_size[n - 1] = depth;
        }
        self
    }

    /// Host Rx, non-periodic Tx and periodic Tx FIFO depths in words
    pub const fn host_fifos(mut self, rx: u16, nperio_tx: u16, perio_tx: u16) -> Self {
        self.params.host_rx_fifo_size = rx;
        self.params.host_nperio_tx_fifo_size = nperio_tx;
        self.params.host_perio_tx_fifo_size = perio_tx;
        self
    }

    /// Transfer size and packet count ceilings
    pub const fn transfer_limits(mut self, max_transfer_size: u32, max_packet_count: u32) -> Self {
        self.params.max_transfer_size = max_transfer_size;
        self.params.max_packet_count = max_packet_count;
        self
    }

    /// Host channels to use
    pub const fn host_channels(mut self, count: u8) -> Self {
        self.params.host_channels = count;
        self
    }

    /// Device endpoints to use, EP0 excluded
    pub const fn device_endpoints(mut self, count: u8) -> Self {
        self.params.dev_endpoints = count;
        self
    }

    /// Thresholding control
    pub const fn thresholding(mut self, thr_ctl: u8, tx_len: u32, rx_len: u32) -> Self {
        self.params.thr_ctl = thr_ctl;
        self.params.tx_thr_length = tx_len;
        self.params.rx_thr_length = rx_len;
        self
    }

    /// Periodic transfer interrupt enhancement
    pub const fn pti(mut self, enabled: bool) -> Self {
        self.params.pti_enable = enabled;
        self
    }

    /// Bound on the soft reset and AHB idle waits
    pub const fn reset_budget(mut self, ahb_idle: PollBudget, reset: PollBudget) -> Self {
        self.params.ahb_idle_budget = ahb_idle;
        self.params.reset_budget = reset;
        self
    }

    /// Bound on FIFO flush waits
    pub const fn flush_budget(mut self, budget: PollBudget) -> Self {
        self.params.flush_budget = budget;
        self
    }

    /// Bound on the mode switch wait
    pub const fn mode_switch_budget(mut self, budget: PollBudget) -> Self {
        self.params.mode_switch_budget = budget;
        self
    }

    /// Finish the configuration
    pub const fn build(self) -> CoreParams {
        self.params
    }
}

impl Default for CoreParamsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
