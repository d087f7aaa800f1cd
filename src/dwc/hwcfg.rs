//! Hardware capability decoding (GHWCFG1..4, GSNPSID)

use super::{field, offsets, RegisterAccess};
use crate::error::{Result, UsbError};

/// Synopsys ID prefix of OTG 2.x cores ("OT")
pub const SNPSID_OTG_PREFIX: u32 = 0x4F54_0000;

/// Hardware architecture (GHWCFG2.OtgArch)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Architecture {
    /// FIFO access only, no DMA master
    SlaveOnly,
    /// External DMA controller
    ExternalDma,
    /// Internal AHB DMA master
    InternalDma,
}

/// OTG capability of the synthesized core (GHWCFG2.OtgMode)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OtgOpMode {
    /// HNP and SRP capable OTG device
    HnpSrpCapable = 0,
    /// SRP-only OTG device
    SrpOnlyCapable = 1,
    /// Non-HNP, non-SRP OTG device
    NoHnpSrpCapable = 2,
    /// SRP-capable peripheral
    SrpCapableDevice = 3,
    /// Non-OTG peripheral
    NoSrpCapableDevice = 4,
    /// SRP-capable host
    SrpCapableHost = 5,
    /// Non-OTG host
    NoSrpCapableHost = 6,
}

impl OtgOpMode {
    const fn from_field(value: u32) -> Self {
        match value {
            0 => Self::HnpSrpCapable,
            1 => Self::SrpOnlyCapable,
            2 => Self::NoHnpSrpCapable,
            3 => Self::SrpCapableDevice,
            4 => Self::NoSrpCapableDevice,
            5 => Self::SrpCapableHost,
            _ => Self::NoSrpCapableHost,
        }
    }
}

/// Endpoint direction capability from GHWCFG1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EpDirCapability {
    /// IN and OUT
    Bidirectional,
    /// IN only
    In,
    /// OUT only
    Out,
}

/// Decoded hardware configuration, read once at init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HwConfig {
    /// Raw Synopsys ID
    pub snpsid: u32,
    /// Raw GHWCFG1 (two direction bits per endpoint)
    pub ep_dirs: u32,
    /// OTG capability
    pub op_mode: OtgOpMode,
    /// DMA architecture
    pub architecture: Architecture,
    /// High-speed PHY interface (0 none, 1 UTMI+, 2 ULPI, 3 both)
    pub hs_phy_type: u8,
    /// Full-speed PHY interface
    pub fs_phy_type: u8,
    /// Device endpoints excluding EP0
    pub num_dev_eps: u8,
    /// Host channels
    pub num_host_channels: u8,
    /// Dynamic FIFO sizing enabled
    pub dynamic_fifo: bool,
    /// Total data FIFO depth in 32-bit words
    pub total_fifo_depth: u16,
    /// Width of the transfer size counters
    pub xfer_size_width: u8,
    /// Width of the packet counters
    pub packet_size_width: u8,
    /// Device periodic IN endpoints (shared FIFO mode)
    pub num_dev_perio_in_ep: u8,
    /// Dedicated Tx FIFO per IN endpoint
    pub dedicated_fifos: bool,
    /// Device IN endpoints supported with dedicated FIFOs
    pub num_in_eps: u8,
    /// Scatter/gather descriptor DMA supported
    pub desc_dma: bool,
    /// UTMI+ data width (0 8-bit, 1 16-bit, 2 selectable)
    pub utmi_phy_data_width: u8,
}

impl HwConfig {
    /// Read and decode the capability registers
    ///
    /// Fails with [`UsbError::Unsupported`] when GSNPSID does not identify an
    /// OTG 2.x core.
    pub fn read(regs: &dyn RegisterAccess) -> Result<Self> {
        let snpsid = regs.read(offsets::GSNPSID);
        if snpsid & 0xFFFF_0000 != SNPSID_OTG_PREFIX {
            #[cfg(feature = "defmt")]
            defmt::error!("Unsupported core: GSNPSID={:#010x}", snpsid);
            return Err(UsbError::Unsupported);
        }
        Ok(Self::decode(
            snpsid,
            regs.read(offsets::GHWCFG1),
            regs.read(offsets::GHWCFG2),
            regs.read(offsets::GHWCFG3),
            regs.read(offsets::GHWCFG4),
        ))
    }

    /// Decode raw capability register values
    pub const fn decode(snpsid: u32, hwcfg1: u32, hwcfg2: u32, hwcfg3: u32, hwcfg4: u32) -> Self {
        let architecture = match field(hwcfg2, 3, 2) {
            0 => Architecture::SlaveOnly,
            1 => Architecture::ExternalDma,
            _ => Architecture::InternalDma,
        };
        Self {
            snpsid,
            ep_dirs: hwcfg1,
            op_mode: OtgOpMode::from_field(field(hwcfg2, 0, 3)),
            architecture,
            hs_phy_type: field(hwcfg2, 6, 2) as u8,
            fs_phy_type: field(hwcfg2, 8, 2) as u8,
            num_dev_eps: field(hwcfg2, 10, 4) as u8,
            num_host_channels: field(hwcfg2, 14, 4) as u8 + 1,
            dynamic_fifo: field(hwcfg2, 19, 1) != 0,
            total_fifo_depth: field(hwcfg3, 16, 16) as u16,
            xfer_size_width: field(hwcfg3, 0, 4) as u8,
            packet_size_width: field(hwcfg3, 4, 3) as u8,
            num_dev_perio_in_ep: field(hwcfg4, 0, 4) as u8,
            dedicated_fifos: field(hwcfg4, 25, 1) != 0,
            num_in_eps: field(hwcfg4, 26, 4) as u8,
            desc_dma: field(hwcfg4, 30, 1) != 0,
            utmi_phy_data_width: field(hwcfg4, 14, 2) as u8,
        }
    }

    /// Largest value the transfer size fields accept
    pub const fn max_transfer_size(&self) -> u32 {
        (1u32 << (self.xfer_size_width as u32 + 11)) - 1
    }

    /// Largest value the packet count fields accept
    pub const fn max_packet_count(&self) -> u32 {
        (1u32 << (self.packet_size_width as u32 + 4)) - 1
    }

    /// Direction capability of endpoint `ep`
    pub const fn ep_direction(&self, ep: usize) -> EpDirCapability {
        match field(self.ep_dirs, (ep as u32) * 2, 2) {
            0 => EpDirCapability::Bidirectional,
            1 => EpDirCapability::In,
            _ => EpDirCapability::Out,
        }
    }

    /// Number of device IN endpoints excluding EP0
    pub fn device_in_endpoints(&self) -> usize {
        (1..=self.num_dev_eps as usize)
            .filter(|&ep| self.ep_direction(ep) != EpDirCapability::Out)
            .count()
    }

    /// Number of device OUT endpoints excluding EP0
    pub fn device_out_endpoints(&self) -> usize {
        (1..=self.num_dev_eps as usize)
            .filter(|&ep| self.ep_direction(ep) != EpDirCapability::In)
            .count()
    }

    /// True when any DMA master is present
    pub const fn has_dma(&self) -> bool {
        !matches!(self.architecture, Architecture::SlaveOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Internal DMA, HNP/SRP, ULPI HS PHY + dedicated FS PHY, 8 device EPs,
    // 12 channels, 4096-word FIFO, dedicated FIFOs, descriptor DMA.
    const HWCFG2: u32 = (2 << 3) | (2 << 6) | (1 << 8) | (8 << 10) | (11 << 14) | (1 << 19);
    const HWCFG3: u32 = (4096 << 16) | (6 << 4) | 8;
    const HWCFG4: u32 = (1 << 25) | (8 << 26) | (1 << 30);

    #[test]
    fn test_decode_capabilities() {
        let hw = HwConfig::decode(0x4F54_310A, 0, HWCFG2, HWCFG3, HWCFG4);
        assert_eq!(hw.architecture, Architecture::InternalDma);
        assert_eq!(hw.op_mode, OtgOpMode::HnpSrpCapable);
        assert_eq!(hw.hs_phy_type, 2);
        assert_eq!(hw.fs_phy_type, 1);
        assert_eq!(hw.num_dev_eps, 8);
        assert_eq!(hw.num_host_channels, 12);
        assert_eq!(hw.total_fifo_depth, 4096);
        assert!(hw.dedicated_fifos);
        assert!(hw.desc_dma);
        assert_eq!(hw.max_transfer_size(), (1 << 19) - 1);
        assert_eq!(hw.max_packet_count(), (1 << 10) - 1);
    }

    #[test]
    fn test_endpoint_directions() {
        // EP1 IN only, EP2 OUT only, EP3 bidirectional
        let hwcfg1 = (1 << 2) | (2 << 4);
        let hwcfg2 = 3 << 10;
        let hw = HwConfig::decode(0x4F54_310A, hwcfg1, hwcfg2, 0, 0);
        assert_eq!(hw.device_in_endpoints(), 2);
        assert_eq!(hw.device_out_endpoints(), 2);
    }

    #[test]
    fn test_rejects_foreign_core() {
        use crate::dwc::register::mock::MockRegisters;
        let regs = MockRegisters::new();
        regs.set(offsets::GSNPSID, 0x1234_5678);
        assert_eq!(HwConfig::read(&regs), Err(UsbError::Unsupported));
    }
}
