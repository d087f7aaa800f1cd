//! Core bring-up tests
//!
//! Hardware configuration decoding, DMA mode selection, FIFO layout and the
//! interrupt gate around API calls.

mod common;

use common::*;
use dwc_otg_core::dwc::{offsets, Architecture, Dctl, GahbCfg, GintSts};
use dwc_otg_core::{Controller, CoreParamsBuilder, DmaMode, Engine, UsbError};

#[cfg(test)]
mod tests {
    use super::*;

    fn gahbcfg(ctrl: &TestController) -> GahbCfg {
        GahbCfg::from_bits_retain(ctrl.regs().get(offsets::GAHBCFG))
    }

    #[test]
    fn test_unknown_core_rejected() {
        let regs = device_regs(INTERNAL_DMA);
        regs.set(offsets::GSNPSID, 0x4E54_310A);
        let result = TestController::new(
            regs,
            Recorder::default(),
            NoDelay,
            CoreParamsBuilder::new().build(),
            control_buffers(),
        );
        assert_eq!(result.err(), Some(UsbError::Unsupported));
    }

    #[test]
    fn test_slave_only_core_runs_without_dma() {
        let ctrl = slave_device();
        assert_eq!(ctrl.hw_config().architecture, Architecture::SlaveOnly);
        assert_eq!(ctrl.engine_config().mode, DmaMode::Slave);
        assert!(!gahbcfg(&ctrl).contains(GahbCfg::DMAENABLE));
        assert!(gahbcfg(&ctrl).contains(GahbCfg::GLBLINTRMSK));
        // The CPU drains the Rx FIFO
        assert_ne!(ctrl.regs().get(offsets::GINTMSK) & GintSts::RXSTSQLVL.bits(), 0);
    }

    #[test]
    fn test_internal_dma_core_uses_buffer_dma() {
        let ctrl = controller(device_regs(INTERNAL_DMA), CoreParamsBuilder::new().build());
        assert_eq!(ctrl.engine_config().mode, DmaMode::BufferDma);
        assert!(gahbcfg(&ctrl).contains(GahbCfg::DMAENABLE));
        assert_eq!(ctrl.regs().get(offsets::GINTMSK) & GintSts::RXSTSQLVL.bits(), 0);
    }

    #[test]
    fn test_descriptor_dma_falls_back_without_support() {
        // GHWCFG4 of the test core does not advertise descriptor DMA
        let ctrl = controller(device_regs(INTERNAL_DMA), CoreParamsBuilder::new().descriptor_dma(true).build());
        assert_eq!(ctrl.engine_config().mode, DmaMode::BufferDma);
    }

    #[test]
    fn test_device_fifo_layout() {
        let ctrl = slave_device();
        let partition = ctrl.fifo_partition().copied().expect("dynamic FIFO core");
        assert_eq!(ctrl.fifo_status(), Ok(()));
        assert!(partition.allocated() <= 4096);
        assert_eq!(ctrl.regs().get(offsets::GRXFSIZ), partition.rx.depth());
        assert_eq!(partition.tx_count, 4);
    }

    #[test]
    fn test_oversized_fifo_request_still_starts() {
        let params = CoreParamsBuilder::new().dma(false).device_fifos(4000, 512).build();
        let ctrl = controller(device_regs(SLAVE_ONLY), params);
        assert_eq!(ctrl.fifo_status(), Err(UsbError::FifoOverAllocation));
        assert_eq!(ctrl.engine(), Engine::Device);
        assert!(ctrl.fifo_partition().is_some_and(|p| p.allocated() <= 4096));
    }

    #[test]
    fn test_host_fifo_layout() {
        let ctrl = controller(host_regs(INTERNAL_DMA), CoreParamsBuilder::new().build());
        let partition = ctrl.fifo_partition().copied().expect("dynamic FIFO core");
        assert_eq!(partition.tx_count, 1);
        assert_ne!(ctrl.regs().get(offsets::HPTXFSIZ), 0);
    }

    #[test]
    fn test_init_twice_rejected() {
        let mut ctrl = slave_device();
        assert_eq!(ctrl.init(), Err(UsbError::AlreadyInitialized));
    }

    #[test]
    fn test_api_calls_restore_interrupt_gate() {
        let mut ctrl = slave_device();
        ctrl.regs().clear_log();
        let _ = ctrl.set_stall(0x81);

        let writes = ctrl.regs().writes_to(offsets::GAHBCFG);
        assert!(!GahbCfg::from_bits_retain(writes[0]).contains(GahbCfg::GLBLINTRMSK));
        assert!(gahbcfg(&ctrl).contains(GahbCfg::GLBLINTRMSK));
    }

    #[test]
    fn test_shutdown_disconnects() {
        let mut ctrl = slave_device();
        ctrl.shutdown();
        assert_eq!(ctrl.engine(), Engine::Stopped);
        assert!(ctrl.handler().saw(&Event::DeviceStop));
        assert!(Dctl::from_bits_retain(ctrl.regs().get(offsets::DCTL)).contains(Dctl::SFTDISCON));
        assert!(!gahbcfg(&ctrl).contains(GahbCfg::GLBLINTRMSK));

        // Nothing runs after shutdown
        assert_eq!(ctrl.set_stall(0x81), Err(UsbError::InvalidState));
    }

    #[test]
    fn test_spurious_interrupt_counted() {
        let mut ctrl = slave_device();
        assert!(fire(&mut ctrl, GintSts::empty()).is_empty());
        assert_eq!(ctrl.interrupt_stats().spurious(), 1);
    }

    #[test]
    fn test_controller_type_is_generic_over_pool_size() {
        let ctrl: Controller<_, _, _, 2> = Controller::new(
            slave_regs(),
            Recorder::default(),
            NoDelay,
            CoreParamsBuilder::new().build(),
            control_buffers(),
        )
        .expect("known core");
        assert_eq!(ctrl.pool_stats().available, 2);
    }

    fn slave_regs() -> MockRegisters {
        device_regs(SLAVE_ONLY)
    }
}
