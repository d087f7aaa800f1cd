//! Core bring-up: soft reset, PHY selection, AHB/DMA setup, FIFO layout and
//! the host and device mode initialization sequences

use super::fifo::{FifoPartition, FifoRequest};
use super::hwcfg::{Architecture, HwConfig, OtgOpMode};
use super::params::{CoreParams, DmaMode, OtgCapability, PhyType, Speed};
use super::register::PollBudget;
use super::{
    offsets, timeouts, Dcfg, Dctl, DepCtl, DiepInt, DthrCtl, GahbCfg, GintSts, GotgCtl, GrstCtl, GusbCfg, HcChar,
    Hcfg, Hprt0, RegisterAccess,
};
use crate::error::{Result, UsbError};
use embedded_hal::delay::DelayNs;

/// True when the core currently operates in host mode
pub fn is_host_mode(regs: &dyn RegisterAccess) -> bool {
    GintSts::from_bits_retain(regs.read(offsets::GINTSTS)).contains(GintSts::CURMODE_HOST)
}

/// Set the global interrupt gate (GAHBCFG.GlblIntrMsk)
pub fn enable_global_interrupts(regs: &dyn RegisterAccess) {
    regs.set_bits(offsets::GAHBCFG, GahbCfg::GLBLINTRMSK.bits());
}

/// Clear the global interrupt gate
pub fn disable_global_interrupts(regs: &dyn RegisterAccess) {
    regs.clear_bits(offsets::GAHBCFG, GahbCfg::GLBLINTRMSK.bits());
}

/// True when the global interrupt gate is open
pub fn global_interrupts_enabled(regs: &dyn RegisterAccess) -> bool {
    GahbCfg::from_bits_retain(regs.read(offsets::GAHBCFG)).contains(GahbCfg::GLBLINTRMSK)
}

/// Soft-reset the core
///
/// Waits for the AHB master to go idle, asserts CSftRst and waits for the core
/// to clear it, then lets the PHY clock settle.
pub fn core_reset<D: DelayNs + ?Sized>(regs: &dyn RegisterAccess, params: &CoreParams, delay: &mut D) -> Result<()> {
    params
        .ahb_idle_budget
        .wait_for(delay, || {
            GrstCtl::from_bits_retain(regs.read(offsets::GRSTCTL)).contains(GrstCtl::AHBIDLE)
        })
        .map_err(|_| {
            #[cfg(feature = "defmt")]
            defmt::error!("AHB master never went idle: GRSTCTL={:#010x}", regs.read(offsets::GRSTCTL));
            UsbError::CoreResetTimeout
        })?;

    regs.set_bits(offsets::GRSTCTL, GrstCtl::CSFTRST.bits());
    params
        .reset_budget
        .wait_for(delay, || {
            !GrstCtl::from_bits_retain(regs.read(offsets::GRSTCTL)).contains(GrstCtl::CSFTRST)
        })
        .map_err(|_| {
            #[cfg(feature = "defmt")]
            defmt::error!("Core soft reset stuck: GRSTCTL={:#010x}", regs.read(offsets::GRSTCTL));
            UsbError::CoreResetTimeout
        })?;

    delay.delay_us(timeouts::POST_RESET_SETTLE_US);
    Ok(())
}

/// Flush Tx FIFO `num`, or every Tx FIFO with [`GrstCtl::ALL_TX_FIFOS`]
pub fn flush_tx_fifo<D: DelayNs + ?Sized>(
    regs: &dyn RegisterAccess,
    num: u32,
    budget: PollBudget,
    delay: &mut D,
) -> Result<()> {
    regs.write(offsets::GRSTCTL, GrstCtl::tx_flush(num).bits());
    wait_flush(regs, GrstCtl::TXFFLSH, budget, delay)
}

/// Flush the Rx FIFO
pub fn flush_rx_fifo<D: DelayNs + ?Sized>(regs: &dyn RegisterAccess, budget: PollBudget, delay: &mut D) -> Result<()> {
    regs.write(offsets::GRSTCTL, GrstCtl::RXFFLSH.bits());
    wait_flush(regs, GrstCtl::RXFFLSH, budget, delay)
}

fn wait_flush<D: DelayNs + ?Sized>(
    regs: &dyn RegisterAccess,
    bit: GrstCtl,
    budget: PollBudget,
    delay: &mut D,
) -> Result<()> {
    budget
        .wait_for(delay, || !GrstCtl::from_bits_retain(regs.read(offsets::GRSTCTL)).intersects(bit))
        .map_err(|_| {
            #[cfg(feature = "defmt")]
            defmt::warn!("FIFO flush hang: GRSTCTL={:#010x}", regs.read(offsets::GRSTCTL));
            UsbError::FifoFlushTimeout
        })?;
    delay.delay_us(timeouts::POST_FLUSH_SETTLE_US);
    Ok(())
}

/// True when the full-speed 48 MHz PHY clock is in use
fn uses_fs_phy_clock(params: &CoreParams, hw: &HwConfig) -> bool {
    (hw.hs_phy_type == 2 && hw.fs_phy_type == 1 && params.ulpi_fs_ls) || params.phy_type == PhyType::FullSpeed
}

/// Program DCFG.DevSpd from the PHY and requested speed
pub fn init_device_speed(regs: &dyn RegisterAccess, params: &CoreParams, hw: &HwConfig) {
    let speed = if uses_fs_phy_clock(params, hw) {
        Dcfg::SPEED_FULL_FS_PHY
    } else if params.speed == Speed::Full {
        Dcfg::SPEED_FULL_HS_PHY
    } else {
        Dcfg::SPEED_HIGH
    };
    regs.modify_bits(offsets::DCFG, Dcfg::DEVSPD_MASK.bits(), speed);
}

/// Program HCFG.FSLSPclkSel from the PHY type
pub fn init_fsls_clock(regs: &dyn RegisterAccess, params: &CoreParams, hw: &HwConfig) {
    let clk = if params.host_ls_low_power_phy_clk {
        Hcfg::CLK_6_MHZ
    } else if uses_fs_phy_clock(params, hw) {
        Hcfg::CLK_48_MHZ
    } else {
        Hcfg::CLK_30_60_MHZ
    };
    regs.modify_bits(offsets::HCFG, Hcfg::FSLSPCLKSEL_MASK.bits(), clk);
}

/// Clear pending OTG and core interrupts and unmask the interrupts serviced
/// in both modes
pub fn enable_common_interrupts(regs: &dyn RegisterAccess, mode: DmaMode) {
    regs.write(offsets::GOTGINT, u32::MAX);
    regs.write(offsets::GINTSTS, u32::MAX);
    let mut mask = GintSts::MODEMISMATCH
        | GintSts::OTGINTR
        | GintSts::CONIDSTSCHNG
        | GintSts::DISCONNECT
        | GintSts::SESSREQINTR
        | GintSts::WKUPINTR
        | GintSts::USBSUSPEND;
    if mode == DmaMode::Slave {
        mask |= GintSts::RXSTSQLVL;
    }
    regs.write(offsets::GINTMSK, mask.bits());
}

/// Unmask the device-mode interrupts on top of the common set
pub fn enable_device_interrupts(regs: &dyn RegisterAccess, params: &CoreParams, mode: DmaMode, dedicated_fifos: bool) {
    regs.write(offsets::GINTMSK, 0);
    enable_common_interrupts(regs, mode);

    let mut mask = GintSts::USBRESET
        | GintSts::ENUMDONE
        | GintSts::INEPINTR
        | GintSts::OUTEPINTR
        | GintSts::ERLYSUSPEND
        | GintSts::ISOOUTDROP;
    if !dedicated_fifos {
        mask |= GintSts::EPMISMATCH;
    }
    match mode {
        DmaMode::BufferDma if params.pti_enable => regs.set_bits(offsets::DCTL, Dctl::IFRMNUM.bits()),
        DmaMode::DescriptorDma => {}
        _ => mask |= GintSts::INCOMPLISOIN | GintSts::INCOMPLISOOUT,
    }
    regs.set_bits(offsets::GINTMSK, mask.bits());
}

/// Unmask the host-mode interrupts on top of the common set
pub fn enable_host_interrupts(regs: &dyn RegisterAccess, mode: DmaMode) {
    regs.write(offsets::GINTMSK, 0);
    enable_common_interrupts(regs, mode);
    let mut mask = GintSts::PORTINTR | GintSts::HCINTR;
    if mode != DmaMode::DescriptorDma {
        mask |= GintSts::SOFINTR;
    }
    regs.set_bits(offsets::GINTMSK, mask.bits());
}

/// Mask every host-only interrupt
pub fn disable_host_interrupts(regs: &dyn RegisterAccess) {
    let mask = GintSts::SOFINTR | GintSts::PORTINTR | GintSts::HCINTR | GintSts::PTXFEMPTY | GintSts::NPTXFEMPTY;
    regs.clear_bits(offsets::GINTMSK, mask.bits());
}

/// Mode-independent core initialization
///
/// Resets the core, selects the PHY (once per power cycle, tracked through
/// `phy_init_done`), programs the AHB burst and DMA enable, the HNP/SRP
/// capability bits and clears soft disconnect. Returns true when the core came
/// up in host mode.
pub fn core_init<D: DelayNs + ?Sized>(
    regs: &dyn RegisterAccess,
    params: &CoreParams,
    hw: &HwConfig,
    delay: &mut D,
    phy_init_done: &mut bool,
) -> Result<bool> {
    let mut usbcfg = GusbCfg::from_bits_retain(regs.read(offsets::GUSBCFG));
    usbcfg.set(GusbCfg::ULPI_EXT_VBUS_DRV, params.phy_ulpi_ext_vbus);
    usbcfg.set(GusbCfg::TERM_SEL_DL_PULSE, params.ts_dline);
    regs.write(offsets::GUSBCFG, usbcfg.bits());

    core_reset(regs, params, delay)?;

    if params.speed == Speed::Full && params.phy_type == PhyType::FullSpeed {
        if !*phy_init_done {
            *phy_init_done = true;
            regs.set_bits(offsets::GUSBCFG, GusbCfg::PHYSEL.bits());
            core_reset(regs, params, delay)?;
        }
        if is_host_mode(regs) {
            init_fsls_clock(regs, params, hw);
        } else {
            init_device_speed(regs, params, hw);
        }
    } else if !*phy_init_done {
        *phy_init_done = true;
        let mut usbcfg = GusbCfg::from_bits_retain(regs.read(offsets::GUSBCFG));
        match params.phy_type {
            PhyType::Ulpi => {
                usbcfg.insert(GusbCfg::ULPI_UTMI_SEL);
                usbcfg.remove(GusbCfg::PHYIF);
                usbcfg.set(GusbCfg::DDRSEL, params.phy_ulpi_ddr);
            }
            PhyType::Utmi => {
                usbcfg.remove(GusbCfg::ULPI_UTMI_SEL);
                usbcfg.set(GusbCfg::PHYIF, params.phy_utmi_width == 16);
            }
            PhyType::FullSpeed => {
                #[cfg(feature = "defmt")]
                defmt::error!("Full-speed PHY requested for a high-speed configuration");
            }
        }
        regs.write(offsets::GUSBCFG, usbcfg.bits());
        core_reset(regs, params, delay)?;
    }

    let fsls = GusbCfg::ULPI_FSLS | GusbCfg::ULPI_CLK_SUS_M;
    if hw.hs_phy_type == 2 && hw.fs_phy_type == 1 && params.ulpi_fs_ls {
        regs.set_bits(offsets::GUSBCFG, fsls.bits());
    } else {
        regs.clear_bits(offsets::GUSBCFG, fsls.bits());
    }

    let mode = params.dma_mode();
    let mut ahbcfg = GahbCfg::empty();
    match hw.architecture {
        Architecture::SlaveOnly => {}
        Architecture::ExternalDma => {
            // HBstLen holds log2 of the burst size in words
            let burst = params.dma_burst_size.max(1);
            ahbcfg = ahbcfg.with_burst(31 - burst.leading_zeros());
        }
        Architecture::InternalDma => ahbcfg = ahbcfg.with_burst(GahbCfg::BURST_INCR),
    }
    ahbcfg.set(GahbCfg::DMAENABLE, mode.uses_dma());
    regs.write(offsets::GAHBCFG, ahbcfg.bits());

    #[cfg(feature = "defmt")]
    defmt::info!("Core mode {} (architecture {})", mode, hw.architecture);

    let mut usbcfg = GusbCfg::from_bits_retain(regs.read(offsets::GUSBCFG));
    let (hnp, srp) = otg_capability_bits(hw.op_mode, params.otg_cap);
    usbcfg.set(GusbCfg::HNPCAP, hnp);
    usbcfg.set(GusbCfg::SRPCAP, srp);
    regs.write(offsets::GUSBCFG, usbcfg.bits());

    regs.clear_bits(offsets::DCTL, Dctl::SFTDISCON.bits());
    enable_common_interrupts(regs, mode);

    Ok(is_host_mode(regs))
}

/// HNP and SRP capability bits allowed by the synthesized op mode
pub const fn otg_capability_bits(op_mode: OtgOpMode, cap: OtgCapability) -> (bool, bool) {
    let srp_requested = !matches!(cap, OtgCapability::None);
    match op_mode {
        OtgOpMode::HnpSrpCapable => (matches!(cap, OtgCapability::HnpSrp), srp_requested),
        OtgOpMode::SrpOnlyCapable | OtgOpMode::SrpCapableDevice | OtgOpMode::SrpCapableHost => {
            (false, srp_requested)
        }
        OtgOpMode::NoHnpSrpCapable | OtgOpMode::NoSrpCapableDevice | OtgOpMode::NoSrpCapableHost => (false, false),
    }
}

/// Device FIFO layout requested by the parameters
pub fn device_fifo_request(params: &CoreParams, hw: &HwConfig) -> FifoRequest {
    let mut request = FifoRequest::new(params.dev_rx_fifo_size, params.dev_nperio_tx_fifo_size);
    let count = if hw.dedicated_fifos {
        hw.num_in_eps
    } else {
        hw.num_dev_perio_in_ep
    };
    for n in 1..=count as usize {
        if request.push_tx(params.tx_fifo_size(n)).is_err() {
            break;
        }
    }
    request
}

/// Host FIFO layout requested by the parameters
pub fn host_fifo_request(params: &CoreParams) -> FifoRequest {
    let mut request = FifoRequest::new(params.host_rx_fifo_size, params.host_nperio_tx_fifo_size);
    // one entry, never over capacity
    let _ = request.push_tx(params.host_perio_tx_fifo_size);
    request
}

/// Device mode initialization
///
/// Returns the FIFO layout that was programmed. A clamped layout is still
/// applied; the caller reports [`FifoPartition::status`].
pub fn device_init<D: DelayNs + ?Sized>(
    regs: &dyn RegisterAccess,
    params: &CoreParams,
    hw: &HwConfig,
    delay: &mut D,
) -> Result<Option<FifoPartition>> {
    let mode = params.dma_mode();
    regs.write(offsets::PCGCCTL, 0);
    init_device_speed(regs, params, hw);

    let mut dcfg = Dcfg::from_bits_retain(regs.read(offsets::DCFG));
    dcfg.set(Dcfg::DESCDMA, mode == DmaMode::DescriptorDma);
    dcfg.remove(Dcfg::PERFRINT_MASK);
    dcfg |= Dcfg::from_bits_retain(Dcfg::PERFRINT_80 << 11);
    regs.write(offsets::DCFG, dcfg.bits());

    let partition = if hw.dynamic_fifo {
        let partition = FifoPartition::compute(&device_fifo_request(params, hw), hw.total_fifo_depth);
        partition.apply_device(regs);
        Some(partition)
    } else {
        None
    };

    flush_tx_fifo(regs, GrstCtl::ALL_TX_FIFOS, params.flush_budget, delay)?;
    flush_rx_fifo(regs, params.flush_budget, delay)?;
    regs.write(offsets::GRSTCTL, GrstCtl::INTKNQFLSH.bits());

    regs.write(offsets::DIEPMSK, 0);
    regs.write(offsets::DOEPMSK, 0);
    regs.write(offsets::DAINT, u32::MAX);
    regs.write(offsets::DAINTMSK, 0);

    let in_eps = hw.device_in_endpoints();
    let out_eps = hw.device_out_endpoints();
    for ep in 0..=in_eps {
        disable_endpoint_at_init(regs, offsets::diepctl(ep));
        if mode != DmaMode::DescriptorDma {
            regs.write(offsets::dieptsiz(ep), 0);
        }
        regs.write(offsets::diepdma(ep), 0);
        regs.write(offsets::diepint(ep), 0xFF);
    }
    for ep in 0..=out_eps {
        disable_endpoint_at_init(regs, offsets::doepctl(ep));
        if mode != DmaMode::DescriptorDma {
            regs.write(offsets::doeptsiz(ep), 0);
        }
        regs.write(offsets::doepdma(ep), 0);
        regs.write(offsets::doepint(ep), 0xFF);
    }

    if hw.dedicated_fifos && mode.uses_dma() {
        let dthrctl = DthrCtl::new(params.thr_ctl, params.tx_thr_length, params.rx_thr_length);
        regs.write(offsets::DTHRCTL, dthrctl.bits());
    }

    enable_device_interrupts(regs, params, mode, hw.dedicated_fifos);
    regs.set_bits(offsets::DIEPMSK, DiepInt::TXFIFOUNDRN.bits());
    Ok(partition)
}

fn disable_endpoint_at_init(regs: &dyn RegisterAccess, ctl: usize) {
    let depctl = DepCtl::from_bits_retain(regs.read(ctl));
    let value = if depctl.contains(DepCtl::EPENA) {
        DepCtl::EPDIS | DepCtl::SNAK
    } else {
        DepCtl::empty()
    };
    regs.write(ctl, value.bits());
}

/// Host mode initialization
///
/// `power_port` turns on port power when the core acts as an A-device host.
pub fn host_init<D: DelayNs + ?Sized>(
    regs: &dyn RegisterAccess,
    params: &CoreParams,
    hw: &HwConfig,
    delay: &mut D,
    power_port: bool,
) -> Result<Option<FifoPartition>> {
    let mode = params.dma_mode();
    regs.write(offsets::PCGCCTL, 0);
    init_fsls_clock(regs, params, hw);
    if params.speed == Speed::Full {
        regs.set_bits(offsets::HCFG, Hcfg::FSLSSUPP.bits());
    }
    if mode == DmaMode::DescriptorDma {
        regs.set_bits(offsets::HCFG, Hcfg::DESCDMA.bits());
    }

    let partition = if hw.dynamic_fifo {
        let partition = FifoPartition::compute(&host_fifo_request(params), hw.total_fifo_depth);
        partition.apply_host(regs);
        Some(partition)
    } else {
        None
    };

    regs.clear_bits(offsets::GOTGCTL, GotgCtl::HSTSETHNPEN.bits());
    flush_tx_fifo(regs, GrstCtl::ALL_TX_FIFOS, params.flush_budget, delay)?;
    flush_rx_fifo(regs, params.flush_budget, delay)?;

    if mode != DmaMode::DescriptorDma {
        let channels = params.host_channels as usize;
        for ch in 0..channels {
            regs.modify_bits(
                offsets::hcchar(ch),
                (HcChar::CHEN | HcChar::EPDIR).bits(),
                HcChar::CHDIS.bits(),
            );
        }
        for ch in 0..channels {
            regs.modify_bits(offsets::hcchar(ch), HcChar::EPDIR.bits(), (HcChar::CHEN | HcChar::CHDIS).bits());
            let halted = timeouts::CHANNEL_HALT.wait_for(delay, || {
                !HcChar::from_bits_retain(regs.read(offsets::hcchar(ch))).contains(HcChar::CHEN)
            });
            if halted.is_err() {
                #[cfg(feature = "defmt")]
                defmt::error!("Unable to clear halt on channel {}", ch);
            }
        }
    }

    if power_port {
        let hprt = Hprt0::from_bits_retain(regs.read(offsets::HPRT0));
        if !hprt.contains(Hprt0::PRTPWR) {
            regs.write(offsets::HPRT0, (hprt.preserve() | Hprt0::PRTPWR).bits());
        }
    }

    enable_host_interrupts(regs, mode);
    Ok(partition)
}
