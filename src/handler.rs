//! Callbacks into the layer above the core
//!
//! Every method runs in interrupt context, from inside
//! [`Controller::on_interrupt`](crate::Controller::on_interrupt) or from a
//! submission call that completed synchronously. Implementations must not
//! block or call back into the controller.

use crate::device::{Configuration, DescriptorKind, IsoPacketInfo, SetupPacket};
use crate::dma::{DmaBuffer, RequestStore, TransferHandle};
use crate::dwc::RegisterAccess;
use crate::error::{Result, UsbError};
use crate::host::{PipeHandle, PortStatus};
use crate::mode::EngineConfig;
use crate::otg::OtgRole;
use crate::transfer::{Completion, TransferStatus, UsbSpeed};

/// Upper-layer hooks for device, host and OTG events
///
/// All methods have empty defaults so an integration only implements what it
/// uses. Requests the handler does not recognise should return
/// `Err(UsbError::Stall)`, which stalls EP0.
#[allow(unused_variables)]
pub trait UsbHandler {
    /// A transfer finished; the buffer is handed back
    fn transfer_complete(&mut self, completion: Completion, buffer: DmaBuffer) {}

    /// Descriptor bytes for GET_DESCRIPTOR
    ///
    /// `high_speed` selects between the high-speed and full-speed variants of
    /// configuration descriptors.
    fn descriptor(&mut self, kind: DescriptorKind, index: u8, lang_id: u16, high_speed: bool) -> Option<&'static [u8]> {
        None
    }

    /// Logical endpoint map of configuration `value`
    fn configuration(&mut self, value: u8, high_speed: bool) -> Option<&'static Configuration> {
        None
    }

    /// Class, vendor or unknown standard request with an IN data stage or none
    ///
    /// Write the reply into `reply` and return its length.
    fn control_in(&mut self, setup: &SetupPacket, reply: &mut [u8]) -> Result<usize> {
        Err(UsbError::Stall)
    }

    /// Class, vendor or unknown standard request with an OUT data stage
    fn control_out(&mut self, setup: &SetupPacket, data: &[u8]) -> Result<()> {
        Err(UsbError::Stall)
    }

    /// Configuration `value` is active (0 when deconfigured)
    fn configured(&mut self, value: u8) {}

    /// Interface `interface` switched to alternate setting `alternate`
    fn interface_changed(&mut self, interface: u8, alternate: u8) {}

    /// USB reset seen on the bus
    fn bus_reset(&mut self) {}

    /// Enumeration finished at `speed`
    fn enumerated(&mut self, speed: UsbSpeed) {}

    /// Bus suspended
    fn suspend(&mut self) {}

    /// Bus resumed, or a session request succeeded
    fn resume(&mut self) {}

    /// Peer disconnected
    fn disconnect(&mut self) {}

    /// Start of frame
    fn start_of_frame(&mut self, frame: u16) {}

    /// One isochronous buffer was processed
    fn iso_buffer_ready(&mut self, ep_addr: u8, buffer: usize, packets: &[IsoPacketInfo]) {}

    /// Host engine started
    fn host_start(&mut self) {}

    /// Host engine stopped
    fn host_stop(&mut self) {}

    /// Device engine started
    fn device_start(&mut self) {}

    /// Device engine stopped
    fn device_stop(&mut self) {}

    /// OTG role changed
    fn role_changed(&mut self, role: OtgRole) {}

    /// Root port status changed
    fn host_port_changed(&mut self, status: PortStatus) {}

    /// A pipe's queue drained after a disconnect or cancel
    fn pipe_idle(&mut self, pipe: PipeHandle) {}
}

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl UsbHandler for NullHandler {}

/// What interrupt-path code needs besides its own state
pub(crate) struct Context<'a> {
    pub regs: &'a dyn RegisterAccess,
    pub cfg: EngineConfig,
    pub store: &'a mut dyn RequestStore,
    pub handler: &'a mut dyn UsbHandler,
}

/// A pooled request ready to be programmed
pub(crate) struct Loaded {
    pub buffer: DmaBuffer,
    pub length: u32,
    pub zero: bool,
}

impl Context<'_> {
    /// Move a queued request's buffer out for programming
    pub fn load(&mut self, handle: TransferHandle) -> Result<Loaded> {
        let request = self.store.request(handle)?;
        Ok(Loaded {
            buffer: request.buffer.take(),
            length: request.length,
            zero: request.zero,
        })
    }

    /// Free a finished request and report it upward
    pub fn complete(&mut self, handle: TransferHandle, buffer: DmaBuffer, actual: u32, status: TransferStatus) {
        match self.store.release(handle) {
            Ok(request) => {
                let completion = Completion {
                    handle,
                    status,
                    actual,
                    context: request.context,
                };
                self.handler.transfer_complete(completion, buffer);
            }
            Err(_) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("Completion for stale handle {}", handle.index());
            }
        }
    }
}
