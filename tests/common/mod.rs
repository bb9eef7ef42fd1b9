//! Software doubles for [`ehci_hc::Bus`] and [`ehci_hc::Platform`], enough
//! to drive `Controller::start`/`stop`/`reset` and the root-hub operations
//! without real hardware.
//!
//! The register model is intentionally shallow: `HCHALTED` always tracks
//! `RS` and `HCRESET` self-clears on the next read, so every `poll_bit` loop
//! in `controller.rs` resolves on its first iteration. This is enough to
//! exercise the driver's own logic; it does not model queued-transfer
//! execution, since nothing on this side of the `Bus` seam ever runs a QTD.

use std::cell::{Cell, RefCell};

use ehci_hc::bus::{Bus, CoherentAlloc, DmaDirection, DmaMapping, PciAttributes, Width};
use ehci_hc::platform::{ExitBootCallback, Platform, PriorityLevel, TimerCallback, TimerHandle};

pub const CAP_LENGTH: u32 = 0x20;
const MEM_LEN: usize = 0x100;

const USBCMD_RS: u32 = 1 << 0;
const USBCMD_HCRESET: u32 = 1 << 1;
const USBSTS_HCHALTED: u32 = 1 << 12;

pub struct FakeBus {
    config: RefCell<[u8; 256]>,
    mem: RefCell<Vec<u8>>,
    attrs: Cell<PciAttributes>,
    coherent_allocs: RefCell<Vec<(*mut u8, usize)>>,
}

impl FakeBus {
    /// Builds a bus reporting `port_count` ports and the given PCI class
    /// triple, with no USBLEGSUP capability (EECP=0) so `start` never walks
    /// config space looking for one.
    pub fn new(port_count: u32, base_class: u8, sub_class: u8, prog_if: u8) -> Self {
        let mut config = [0u8; 256];
        config[0x09] = prog_if;
        config[0x0A] = sub_class;
        config[0x0B] = base_class;

        let mut mem = vec![0u8; MEM_LEN];
        mem[0] = CAP_LENGTH as u8;
        let hcsparams = port_count & 0xF;
        mem[4..8].copy_from_slice(&hcsparams.to_le_bytes());
        // HCCPARAMS: EECP = 0, AC64 = 0.
        mem[8..12].copy_from_slice(&0u32.to_le_bytes());

        FakeBus {
            config: RefCell::new(config),
            mem: RefCell::new(mem),
            attrs: Cell::new(0),
            coherent_allocs: RefCell::new(Vec::new()),
        }
    }

    pub fn ehci() -> Self {
        // Base class 0x0C (serial bus), sub-class 0x03 (USB), prog-if 0x20 (EHCI).
        FakeBus::new(2, 0x0C, 0x03, 0x20)
    }

    fn read_raw32(&self, offset: usize) -> u32 {
        let mem = self.mem.borrow();
        let bytes = [mem[offset], mem[offset + 1], mem[offset + 2], mem[offset + 3]];
        u32::from_le_bytes(bytes)
    }

    fn write_raw32(&self, offset: usize, value: u32) {
        let mut mem = self.mem.borrow_mut();
        mem[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Directly pokes a PORTSC register for a test scenario (e.g. "device
    /// connected"); not part of the `Bus` seam, only used by test setup.
    pub fn set_portsc_raw(&self, port_index: usize, value: u32) {
        let offset = CAP_LENGTH as usize + 0x44 + port_index * 4;
        self.write_raw32(offset, value);
    }

    pub fn portsc_raw(&self, port_index: usize) -> u32 {
        let offset = CAP_LENGTH as usize + 0x44 + port_index * 4;
        self.read_raw32(offset)
    }
}

impl Bus for FakeBus {
    fn pci_read_config(&self, offset: u16, width: Width) -> u32 {
        let config = self.config.borrow();
        let offset = offset as usize;
        match width {
            Width::Byte => config[offset] as u32,
            Width::Word => u16::from_le_bytes([config[offset], config[offset + 1]]) as u32,
            Width::Dword => u32::from_le_bytes([
                config[offset],
                config[offset + 1],
                config[offset + 2],
                config[offset + 3],
            ]),
        }
    }

    fn pci_write_config(&self, offset: u16, width: Width, value: u32) {
        let mut config = self.config.borrow_mut();
        let offset = offset as usize;
        match width {
            Width::Byte => config[offset] = value as u8,
            Width::Word => config[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes()),
            Width::Dword => config[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
        }
    }

    fn pci_attributes_get(&self) -> PciAttributes {
        self.attrs.get()
    }

    fn pci_attributes_set(&self, attrs: PciAttributes) -> Result<(), ehci_hc::UsbError> {
        self.attrs.set(attrs);
        Ok(())
    }

    fn mmio_read32(&self, offset: usize) -> u32 {
        let usbsts_offset = CAP_LENGTH as usize + 0x04;
        if offset == usbsts_offset {
            let usbcmd_offset = CAP_LENGTH as usize + 0x00;
            let cmd = self.read_raw32(usbcmd_offset);
            let mut sts = self.read_raw32(offset);
            if cmd & USBCMD_RS == 0 {
                sts |= USBSTS_HCHALTED;
            } else {
                sts &= !USBSTS_HCHALTED;
            }
            return sts;
        }
        self.read_raw32(offset)
    }

    fn mmio_write32(&self, offset: usize, value: u32) {
        let usbcmd_offset = CAP_LENGTH as usize + 0x00;
        if offset == usbcmd_offset {
            // HCRESET self-clears immediately: this software model has no
            // reset latency to simulate.
            self.write_raw32(offset, value & !USBCMD_HCRESET);
            return;
        }
        self.write_raw32(offset, value);
    }

    fn pci_map_dma(
        &self,
        direction: DmaDirection,
        host_ptr: *const u8,
        len: usize,
    ) -> Result<DmaMapping, ehci_hc::UsbError> {
        Ok(DmaMapping {
            bus_addr: host_ptr as usize as u32,
            len,
            direction,
            handle: 0,
        })
    }

    fn pci_unmap(&self, _mapping: DmaMapping) {}

    fn pci_allocate_coherent(&self, pages: usize) -> Result<CoherentAlloc, ehci_hc::UsbError> {
        let len = pages * 4096;
        let mut buf = vec![0u8; len].into_boxed_slice();
        let host_ptr = buf.as_mut_ptr();
        self.coherent_allocs.borrow_mut().push((host_ptr, len));
        core::mem::forget(buf);
        Ok(CoherentAlloc {
            host_ptr,
            bus_addr: host_ptr as usize as u32,
            len,
        })
    }

    fn pci_free_coherent(&self, alloc: CoherentAlloc) {
        let mut allocs = self.coherent_allocs.borrow_mut();
        if let Some(pos) = allocs.iter().position(|&(p, _)| p == alloc.host_ptr) {
            let (ptr, len) = allocs.swap_remove(pos);
            // SAFETY: this pointer was produced by `pci_allocate_coherent`
            // above via a leaked boxed slice of exactly this length.
            unsafe {
                drop(Box::from_raw(core::slice::from_raw_parts_mut(ptr, len)));
            }
        }
    }

    fn pci_flush(&self) {}
}

pub struct FakePlatform {
    micros: Cell<u64>,
}

impl FakePlatform {
    pub fn new() -> Self {
        FakePlatform { micros: Cell::new(0) }
    }
}

impl Platform for FakePlatform {
    type PriorityToken = ();

    fn raise_priority(&self, _level: PriorityLevel) -> Self::PriorityToken {}
    fn restore_priority(&self, _token: Self::PriorityToken) {}

    fn create_timer(&self, _callback: TimerCallback, _ctx: *mut ()) -> TimerHandle {
        TimerHandle(0)
    }
    fn arm_timer(&self, _handle: TimerHandle, _periodic_interval_ms: u32) {}
    fn cancel_timer(&self, _handle: TimerHandle) {}

    fn create_exit_boot_event(&self, _callback: ExitBootCallback, _ctx: *mut ()) {}

    fn monotonic_micros(&self) -> u64 {
        let v = self.micros.get();
        self.micros.set(v + 100);
        v
    }

    fn stall(&self, _micros: u64) {
        let v = self.micros.get();
        self.micros.set(v + 100);
    }
}
