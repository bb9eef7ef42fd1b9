//! Typed access to EHCI capability and operational registers.
//!
//! Bit layouts are grounded in the capability/operational register tables
//! of the EHCI 1.0 specification, following the `tock-registers`
//! `register_bitfields!` idiom already used for this exact register set
//! elsewhere in this codebase. Reads/writes go through [`crate::bus::Bus`]
//! rather than a raw memory-mapped struct, since controller access must be
//! serializable against a software test double as well as a real BAR.

use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::bus::Bus;

register_bitfields![u32,
    pub HCSPARAMS [
        N_PORTS OFFSET(0) NUMBITS(4) [],
        PPC OFFSET(4) NUMBITS(1) [],
        N_PCC OFFSET(8) NUMBITS(4) [],
        N_CC OFFSET(12) NUMBITS(4) [],
        P_INDICATOR OFFSET(16) NUMBITS(1) [],
        DEBUG_PORT_NUMBER OFFSET(20) NUMBITS(4) [],
    ],
    pub HCCPARAMS [
        AC64 OFFSET(0) NUMBITS(1) [],
        PFLF OFFSET(1) NUMBITS(1) [],
        ASPC OFFSET(2) NUMBITS(1) [],
        IST OFFSET(4) NUMBITS(4) [],
        EECP OFFSET(8) NUMBITS(8) [],
    ],
    pub USBCMD [
        RS OFFSET(0) NUMBITS(1) [],
        HCRESET OFFSET(1) NUMBITS(1) [],
        FLS OFFSET(2) NUMBITS(2) [
            Size1024 = 0,
            Size512 = 1,
            Size256 = 2,
        ],
        PSE OFFSET(4) NUMBITS(1) [],
        ASE OFFSET(5) NUMBITS(1) [],
        IAAD OFFSET(6) NUMBITS(1) [],
        LHCRESET OFFSET(7) NUMBITS(1) [],
        ITC OFFSET(16) NUMBITS(8) [],
    ],
    pub USBSTS [
        USBINT OFFSET(0) NUMBITS(1) [],
        USBERRINT OFFSET(1) NUMBITS(1) [],
        PCD OFFSET(2) NUMBITS(1) [],
        FLR OFFSET(3) NUMBITS(1) [],
        HSE OFFSET(4) NUMBITS(1) [],
        IAA OFFSET(5) NUMBITS(1) [],
        HCHALTED OFFSET(12) NUMBITS(1) [],
        RECLAMATION OFFSET(13) NUMBITS(1) [],
        PSS OFFSET(14) NUMBITS(1) [],
        ASS OFFSET(15) NUMBITS(1) [],
    ],
    pub PORTSC [
        CCS OFFSET(0) NUMBITS(1) [],
        CSC OFFSET(1) NUMBITS(1) [],
        PE OFFSET(2) NUMBITS(1) [],
        PEC OFFSET(3) NUMBITS(1) [],
        OCA OFFSET(4) NUMBITS(1) [],
        OCC OFFSET(5) NUMBITS(1) [],
        FPR OFFSET(6) NUMBITS(1) [],
        SUSPEND OFFSET(7) NUMBITS(1) [],
        PR OFFSET(8) NUMBITS(1) [],
        LS OFFSET(10) NUMBITS(2) [
            Se0 = 0,
            KState = 1,
            JState = 2,
        ],
        PP OFFSET(12) NUMBITS(1) [],
        PO OFFSET(13) NUMBITS(1) [],
        PIC OFFSET(14) NUMBITS(2) [],
        PTC OFFSET(16) NUMBITS(4) [],
        WKCNNT_E OFFSET(20) NUMBITS(1) [],
        WKDSCNNT_E OFFSET(21) NUMBITS(1) [],
        WKOC_E OFFSET(22) NUMBITS(1) [],
    ],
];

/// Write-1-to-clear bits of PORTSC that must not be re-asserted by a
/// read-modify-write of unrelated state (§4.A, §4.G).
pub const PORTSC_WC_MASK: u32 =
    (1 << PORTSC::CSC.shift) | (1 << PORTSC::PEC.shift) | (1 << PORTSC::OCC.shift);

/// Fixed capability-register offsets (§6 register map).
pub mod cap {
    pub const CAPLENGTH: usize = 0x00;
    pub const HCIVERSION: usize = 0x02;
    pub const HCSPARAMS: usize = 0x04;
    pub const HCCPARAMS: usize = 0x08;
}

/// Operational-register offsets, relative to `base + CapLen`.
pub mod op {
    pub const USBCMD: usize = 0x00;
    pub const USBSTS: usize = 0x04;
    pub const USBINTR: usize = 0x08;
    pub const FRINDEX: usize = 0x0C;
    pub const CTRLDSSEGMENT: usize = 0x10;
    pub const PERIODICLISTBASE: usize = 0x14;
    pub const ASYNCLISTADDR: usize = 0x18;
    pub const CONFIGFLAG: usize = 0x40;
    pub const PORTSC_BASE: usize = 0x44;
    pub const PORTSC_STRIDE: usize = 0x04;
}

pub const USBLEGSUP_CAP_ID: u32 = 0x01;
pub mod usblegsup {
    pub const HC_BIOS_OWNED: u32 = 1 << 16;
    pub const HC_OS_OWNED: u32 = 1 << 24;
}

/// A read/write window over the capability and operational register blocks
/// of a single EHCI function, addressed through a [`Bus`].
pub struct RegisterWindow<'a, B: Bus> {
    bus: &'a B,
    cap_length: usize,
}

impl<'a, B: Bus> RegisterWindow<'a, B> {
    /// Reads `CAPLENGTH` and returns a window with the operational base
    /// already resolved.
    pub fn new(bus: &'a B) -> Self {
        let caplen_hciver = bus.mmio_read32(cap::CAPLENGTH) & 0xFF;
        RegisterWindow {
            bus,
            cap_length: caplen_hciver as usize,
        }
    }

    pub fn cap_length(&self) -> usize {
        self.cap_length
    }

    pub fn hcsparams(&self) -> LocalRegisterCopy<u32, HCSPARAMS::Register> {
        LocalRegisterCopy::new(self.bus.mmio_read32(cap::HCSPARAMS))
    }

    pub fn hccparams(&self) -> LocalRegisterCopy<u32, HCCPARAMS::Register> {
        LocalRegisterCopy::new(self.bus.mmio_read32(cap::HCCPARAMS))
    }

    fn op_offset(&self, offset: usize) -> usize {
        self.cap_length + offset
    }

    pub fn read_op(&self, offset: usize) -> u32 {
        self.bus.mmio_read32(self.op_offset(offset))
    }

    pub fn write_op(&self, offset: usize, value: u32) {
        self.bus.mmio_write32(self.op_offset(offset), value);
    }

    pub fn usbcmd(&self) -> LocalRegisterCopy<u32, USBCMD::Register> {
        LocalRegisterCopy::new(self.read_op(op::USBCMD))
    }

    pub fn set_usbcmd(&self, value: LocalRegisterCopy<u32, USBCMD::Register>) {
        self.write_op(op::USBCMD, value.get());
    }

    pub fn usbsts(&self) -> LocalRegisterCopy<u32, USBSTS::Register> {
        LocalRegisterCopy::new(self.read_op(op::USBSTS))
    }

    /// Acknowledges the given interrupt status bits by writing them back
    /// (write-1-to-clear); other status register bits are read-only status
    /// or not write-1-to-clear, so writing only the requested mask is safe.
    pub fn ack_usbsts(&self, mask: u32) {
        self.write_op(op::USBSTS, mask);
    }

    pub fn bit_set(&self, offset: usize, mask: u32) {
        let v = self.read_op(offset);
        self.write_op(offset, v | mask);
    }

    pub fn bit_clear(&self, offset: usize, mask: u32) {
        let v = self.read_op(offset);
        self.write_op(offset, v & !mask);
    }

    /// Spin-waits until `(read(offset) & mask) == expected`, bounded by
    /// `timeout_us`. Polling granularity follows the ~50us design note via
    /// the caller-supplied stall function.
    pub fn poll_bit(
        &self,
        offset: usize,
        mask: u32,
        expected: u32,
        timeout_us: u64,
        stall: impl Fn(u64),
        now_us: impl Fn() -> u64,
    ) -> Result<(), ()> {
        let deadline = now_us().saturating_add(timeout_us);
        loop {
            if (self.read_op(offset) & mask) == expected {
                return Ok(());
            }
            if now_us() >= deadline {
                return Err(());
            }
            stall(50);
        }
    }

    pub fn port_count(&self) -> u32 {
        self.hcsparams().read(HCSPARAMS::N_PORTS)
    }

    pub fn is_64bit(&self) -> bool {
        self.hccparams().is_set(HCCPARAMS::AC64)
    }

    /// Raw PORTSC read for port `index` (0-based).
    pub fn portsc(&self, index: usize) -> u32 {
        self.read_op(op::PORTSC_BASE + index * op::PORTSC_STRIDE)
    }

    /// Writes PORTSC for port `index`, masking off every write-1-to-clear
    /// change bit not explicitly requested in `value` so a feature
    /// set/clear cannot spuriously clear an unrelated change bit (§4.A,
    /// §4.G).
    pub fn write_portsc_preserving_changes(&self, index: usize, value: u32) {
        let masked = value & !PORTSC_WC_MASK;
        self.write_op(op::PORTSC_BASE + index * op::PORTSC_STRIDE, masked);
    }

    pub fn write_portsc_raw(&self, index: usize, value: u32) {
        self.write_op(op::PORTSC_BASE + index * op::PORTSC_STRIDE, value);
    }
}

/// Decodes a raw overlay/QH/QTD token outside of MMIO space, reusing the
/// same `tock-registers` field-extraction idiom as the register window.
pub fn local_reg<R: tock_registers::RegisterLongName>(value: u32) -> LocalRegisterCopy<u32, R> {
    LocalRegisterCopy::new(value)
}
