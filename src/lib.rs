//! ehci-hc - EHCI (USB 2.0) host-controller driver core
//!
//! This crate implements the asynchronous and periodic transfer schedules,
//! URB lifecycle, and root-hub port model of an EHCI host controller. It does
//! not own PCI enumeration or the firmware's event/timer facility: those are
//! modeled as the [`bus::Bus`] and [`platform::Platform`] traits so the core
//! logic can be driven by a real firmware backend or exercised host-side
//! under `cargo test`.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::too_many_arguments)]

extern crate alloc;

pub mod bus;
pub mod controller;
pub mod descriptor;
pub mod dma;
pub mod error;
pub mod platform;
pub mod regs;
pub mod roothub;
pub mod schedule;
pub mod urb;

pub use bus::Bus;
pub use controller::{Controller, Usb2Hc, Usb2HcConfig};
pub use error::{UsbError, UsbResultCode};
pub use platform::Platform;
