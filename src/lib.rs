#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! Control core for Synopsys DesignWare USB 2.0 OTG controllers
//!
//! The crate drives the controller through its register block: core reset
//! and FIFO partitioning, device endpoints and the EP0 control pipe,
//! double-buffered isochronous streaming, host channels with halt and retry
//! handling, and OTG role switching through HNP and SRP.
//!
//! # Core Components
//!
//! - [`controller`] - [`Controller`], the owner of everything below
//! - [`dwc`] - register map, hardware capabilities, parameters and core init
//! - [`mode`] - slave, buffer DMA and descriptor DMA engines behind one trait
//! - [`device`] - endpoints, EP0 state machine, standard requests, isochronous streams
//! - [`host`] - pipes, channels and the root port
//! - [`otg`] - session role state machine
//! - [`interrupt`] - top-level interrupt dispatch
//! - [`dma`] - DMA buffers, descriptor chains and the transfer request pool
//! - [`recovery`] - error classification and retry accounting
//!
//! # Concurrency
//!
//! There are no threads. [`Controller::on_interrupt`] runs to completion from
//! the controller's interrupt line; every other call closes the core's global
//! interrupt gate while it touches shared state. Completions and bus events
//! reach the layer above through [`UsbHandler`].

#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(feature = "defmt")]
use defmt as _;

pub mod controller;
pub mod device;
pub mod dma;
pub mod dwc;
pub mod error;
pub mod handler;
pub mod host;
pub mod interrupt;
pub mod mode;
pub mod otg;
pub mod recovery;
pub mod transfer;

pub use controller::{Controller, Engine};
pub use device::{Configuration, EndpointConfig, InterfaceConfig, SetupPacket};
pub use dma::{DescriptorChain, DmaBuffer, TransferHandle};
pub use dwc::{CoreParams, CoreParamsBuilder, DmaMode, Mmio, RegisterAccess};
pub use error::{Result, UsbError};
pub use handler::{NullHandler, UsbHandler};
pub use host::{PipeConfig, PipeHandle, PortStatus};
pub use otg::OtgRole;
pub use transfer::{Completion, Direction, TransferStatus, TransferType, UsbSpeed};
