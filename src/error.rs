//! Error taxonomy surfaced to callers of the host-controller service.
//!
//! Mirrors the split already used by [`crate::controller`]'s sibling bus
//! drivers in this codebase: a small `Copy` status enum for the outcome of a
//! call, plus a parallel bitfield describing the USB-level cause of a
//! transfer failure.

use bitflags::bitflags;

/// Status returned by every public operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// A caller-supplied argument failed validation before the controller
    /// was touched.
    InvalidParameter,
    /// The requested operation is not implemented (isochronous transfers,
    /// debug reset/state kinds, suspend).
    Unsupported,
    /// A coherent allocation or DMA mapping could not be satisfied.
    OutOfResources,
    /// The controller is halted, reported a system error, or a register
    /// poll timed out.
    DeviceError,
    /// A caller deadline, the reset self-clear poll, or the IAAD handshake
    /// exceeded its bound.
    Timeout,
}

bitflags! {
    /// Per-transfer USB-level result, parallel to [`UsbError`].
    ///
    /// `NO_ERROR` is the only bit set on a clean completion; the others are
    /// mutually informative but not mutually exclusive, matching the way the
    /// QTD overlay's status byte can carry more than one error bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbResultCode: u32 {
        const NO_ERROR        = 0;
        const STALL           = 1 << 0;
        const BUFFER_ERROR    = 1 << 1;
        const BABBLE          = 1 << 2;
        const TRANSACTION_ERROR = 1 << 3;
        const DATA_BUFFER_ERROR = 1 << 4;
        const NOT_EXECUTED    = 1 << 5;
        const SYSTEM_ERROR    = 1 << 6;
        const TIMEOUT         = 1 << 7;
    }
}

impl Default for UsbResultCode {
    fn default() -> Self {
        UsbResultCode::NO_ERROR
    }
}

pub type UsbResult<T> = Result<T, UsbError>;
