//! Device endpoint transfer tests
//!
//! Bulk requests through the pool, per-endpoint queues, cancellation and
//! stall handling on a configured slave-mode device.

mod common;

use common::*;
use dwc_otg_core::device::EndpointState;
use dwc_otg_core::dwc::{offsets, DepCtl, DiepInt, GintSts};
use dwc_otg_core::{EndpointConfig, TransferStatus, TransferType, UsbError};

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> TestController {
        let mut ctrl = slave_device();
        bus_reset(&mut ctrl);
        send_setup(&mut ctrl, setup(0x00, 9, 1, 0, 0));
        in_complete(&mut ctrl, 0);
        ctrl.handler_mut().events.clear();
        ctrl
    }

    #[test]
    fn test_bulk_in_single_packet() {
        let mut ctrl = configured();
        let handle = ctrl.submit(0x81, buffer_with(&[0xA5; 100]), 100, false, 7).unwrap();
        let ctl = DepCtl::from_bits_retain(ctrl.regs().get(offsets::diepctl(1)));
        assert!(ctl.contains(DepCtl::EPENA | DepCtl::CNAK));
        assert_eq!(ctrl.pool_stats().available, 7);

        ctrl.regs().clear_log();
        tx_room(&mut ctrl, 1);
        assert_eq!(&ctrl.regs().fifo_bytes(1)[..100], &[0xA5; 100][..]);

        in_complete(&mut ctrl, 1);
        let done = ctrl.handler_mut().drain();
        assert_eq!(done.len(), 1);
        let (completion, buffer) = &done[0];
        assert_eq!(completion.handle, handle);
        assert_eq!(completion.status, TransferStatus::Complete);
        assert_eq!(completion.actual, 100);
        assert_eq!(completion.context, 7);
        assert_eq!(buffer.len(), 100);
        assert_eq!(ctrl.pool_stats().available, 8);
    }

    #[test]
    fn test_bulk_in_multi_packet_with_zlp() {
        let mut ctrl = configured();
        ctrl.submit(0x81, buffer(1024), 1024, true, 0).unwrap();
        // Two full packets in one programming
        let tsiz = ctrl.regs().get(offsets::dieptsiz(1));
        assert_eq!(tsiz & 0x7_FFFF, 1024);
        assert_eq!((tsiz >> 19) & 0x3FF, 2);

        in_complete(&mut ctrl, 1);
        assert!(ctrl.handler().completions.is_empty());
        // The terminating zero-length packet
        assert_eq!(ctrl.regs().get(offsets::dieptsiz(1)) & 0x7_FFFF, 0);
        assert_eq!((ctrl.regs().get(offsets::dieptsiz(1)) >> 19) & 0x3FF, 1);

        in_complete(&mut ctrl, 1);
        let done = ctrl.handler_mut().drain();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0.actual, 1024);
    }

    #[test]
    fn test_bulk_out_short_packet_ends_transfer() {
        let mut ctrl = configured();
        ctrl.submit(0x02, buffer(1024), 1024, false, 3).unwrap();
        receive_out(&mut ctrl, 2, &[0x5A; 64], 1024 - 64);
        out_complete(&mut ctrl, 2);

        let done = ctrl.handler_mut().drain();
        assert_eq!(done.len(), 1);
        let (completion, buffer) = &done[0];
        assert_eq!(completion.status, TransferStatus::Complete);
        assert_eq!(completion.actual, 64);
        assert_eq!(&buffer.as_slice()[..64], &[0x5A; 64][..]);
    }

    #[test]
    fn test_out_buffer_must_hold_whole_packets() {
        let mut ctrl = configured();
        let (err, back) = ctrl.submit(0x02, buffer(100), 100, false, 0).unwrap_err();
        assert_eq!(err, UsbError::InvalidParameter);
        assert_eq!(back.len(), 100);
        assert_eq!(ctrl.pool_stats().available, 8);
    }

    #[test]
    fn test_queued_requests_run_in_order() {
        let mut ctrl = configured();
        let first = ctrl.submit(0x81, buffer(64), 64, false, 1).unwrap();
        let second = ctrl.submit(0x81, buffer(32), 32, false, 2).unwrap();

        in_complete(&mut ctrl, 1);
        // The second request is now programmed
        assert_eq!(ctrl.regs().get(offsets::dieptsiz(1)) & 0x7_FFFF, 32);
        in_complete(&mut ctrl, 1);

        let done = ctrl.handler_mut().drain();
        let order: Vec<_> = done.iter().map(|(c, _)| c.handle).collect();
        assert_eq!(order, vec![first, second]);
        assert_eq!(done[1].0.actual, 32);
    }

    #[test]
    fn test_cancel_active_waits_for_disable() {
        let mut ctrl = configured();
        let handle = ctrl.submit(0x81, buffer(64), 64, false, 0).unwrap();
        ctrl.cancel(handle).unwrap();

        let ctl = DepCtl::from_bits_retain(ctrl.regs().get(offsets::diepctl(1)));
        assert!(ctl.contains(DepCtl::EPDIS | DepCtl::SNAK));
        assert_eq!(ctrl.device().endpoint_state(0x81), Some(EndpointState::HaltPending));
        assert!(ctrl.handler().completions.is_empty());

        let regs = ctrl.regs();
        regs.set(offsets::diepint(1), DiepInt::EPDISABLED.bits());
        regs.set(offsets::DAINT, 1 << 1);
        fire(&mut ctrl, GintSts::INEPINTR);

        let done = ctrl.handler_mut().drain();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0.status, TransferStatus::Cancelled);
        assert_eq!(ctrl.device().endpoint_state(0x81), Some(EndpointState::Idle));
    }

    #[test]
    fn test_cancel_queued_completes_immediately() {
        let mut ctrl = configured();
        ctrl.submit(0x81, buffer(64), 64, false, 0).unwrap();
        let queued = ctrl.submit(0x81, buffer(64), 64, false, 9).unwrap();
        ctrl.cancel(queued).unwrap();

        let done = ctrl.handler_mut().drain();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0.handle, queued);
        assert_eq!(done[0].0.status, TransferStatus::Cancelled);
        assert_eq!(done[0].0.context, 9);
        assert_eq!(ctrl.cancel(queued), Err(UsbError::InvalidParameter));
    }

    #[test]
    fn test_pool_exhaustion_returns_buffer() {
        let mut ctrl = configured();
        for i in 0..8 {
            ctrl.submit(0x81, buffer(8), 8, false, i).unwrap();
        }
        let (err, back) = ctrl.submit(0x81, buffer(16), 16, false, 8).unwrap_err();
        assert_eq!(err, UsbError::NoResources);
        assert_eq!(back.len(), 16);
        assert_eq!(ctrl.pool_stats().available, 0);
    }

    #[test]
    fn test_submit_to_disabled_endpoint() {
        let mut ctrl = configured();
        let (err, _) = ctrl.submit(0x83, buffer(8), 8, false, 0).unwrap_err();
        assert_eq!(err, UsbError::InvalidState);
        let (err, _) = ctrl.submit(0x8F, buffer(8), 8, false, 0).unwrap_err();
        assert_eq!(err, UsbError::InvalidParameter);
    }

    #[test]
    fn test_stall_holds_queue_until_cleared() {
        let mut ctrl = configured();
        ctrl.set_stall(0x81).unwrap();
        assert_eq!(ctrl.device().endpoint_state(0x81), Some(EndpointState::Stalled));

        // Queued behind the stall
        ctrl.submit(0x81, buffer(8), 8, false, 0).unwrap();
        assert!(!DepCtl::from_bits_retain(ctrl.regs().get(offsets::diepctl(1))).contains(DepCtl::EPENA));

        ctrl.clear_stall(0x81).unwrap();
        let ctl = DepCtl::from_bits_retain(ctrl.regs().get(offsets::diepctl(1)));
        assert!(!ctl.contains(DepCtl::STALL));
        assert!(ctl.contains(DepCtl::EPENA));
    }

    #[test]
    fn test_disable_endpoint_cancels_requests() {
        let mut ctrl = configured();
        ctrl.submit(0x02, buffer(512), 512, false, 0).unwrap();
        ctrl.submit(0x02, buffer(512), 512, false, 1).unwrap();
        ctrl.disable_endpoint(0x02).unwrap();

        let done = ctrl.handler_mut().drain();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|(c, _)| c.status == TransferStatus::Cancelled));
        assert_eq!(ctrl.device().endpoint_state(0x02), Some(EndpointState::Disabled));
        assert_eq!(ctrl.pool_stats().available, 8);
    }

    #[test]
    fn test_enable_endpoint_outside_configuration() {
        let mut ctrl = configured();
        let ep = EndpointConfig::new(0x83, TransferType::Interrupt, 64, 4);
        ctrl.enable_endpoint(&ep).unwrap();
        assert_eq!(ctrl.device().endpoint_state(0x83), Some(EndpointState::Idle));
        assert_eq!(ctrl.device().tx_fifos_in_use(), 2);
        assert_eq!(ctrl.enable_endpoint(&ep), Err(UsbError::InvalidState));
    }

    #[test]
    fn test_bus_reset_fails_inflight_requests() {
        let mut ctrl = configured();
        ctrl.submit(0x81, buffer(64), 64, false, 0).unwrap();
        bus_reset(&mut ctrl);

        let done = ctrl.handler_mut().drain();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0.status, TransferStatus::Error(UsbError::DeviceDisconnected));
    }
}
