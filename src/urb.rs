//! URB (USB Request Block) lifecycle: build, submit & poll, teardown, and
//! the async-interrupt poller (§4.E).

use crate::bus::{Bus, DmaDirection};
use crate::descriptor::{
    EndpointContext, Pid, QhArena, QtdArena, QueueHead, QueueTransferDescriptor, Speed,
    QTD_MAX_TRANSFER_BYTES,
};
use crate::dma::BufferMapping;
use crate::error::{UsbError, UsbResultCode};
use crate::platform::Platform;

/// Selects the QTD-chain builder (design note: "a tagged variant selecting
/// the QTD-chain builder").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Bulk,
    InterruptSync,
    InterruptAsync,
}

pub type AsyncInterruptCallback = fn(data: &[u8], completed_len: usize, ctx: *mut (), result: UsbResultCode);

/// Ephemeral bookkeeping for one in-flight (or, for async-interrupt,
/// long-lived) transfer.
pub struct Urb {
    pub qh_index: usize,
    pub qtd_chain: heapless::Vec<usize, 12>,
    pub endpoint: EndpointContext,
    pub direction_in: bool,
    pub data_mapping: Option<BufferMapping>,
    pub setup_mapping: Option<BufferMapping>,
    /// Caller-owned host pointer backing `data_mapping`, retained so the
    /// async-interrupt poller can remap a fresh buffer span on each
    /// reactivation without the caller re-supplying it (§4.E).
    pub data_host_ptr: *mut u8,
    pub requested_len: usize,
    pub completed_len: usize,
    pub result: UsbResultCode,
    pub kind: TransferKind,
    pub interval_ms: u32,
    pub periodic_bucket: u32,
    pub callback: Option<AsyncInterruptCallback>,
    pub ctx: *mut (),
}

// SAFETY: `ctx` is an opaque caller-supplied context pointer; this crate
// never dereferences it, only hands it back to the caller's callback under
// the same priority elevation the caller used to submit it.
unsafe impl Send for Urb {}

impl Urb {
    fn qtd_count_for_len(len: usize) -> usize {
        if len == 0 {
            1
        } else {
            len.div_ceil(QTD_MAX_TRANSFER_BYTES)
        }
    }

    /// Builds a QH + QTD chain for a control transfer: SETUP (toggle 0),
    /// zero or more DATA stages, STATUS (opposite direction, toggle 1).
    pub fn build_control<B: Bus>(
        bus: &B,
        qhs: &mut QhArena,
        qtds: &mut QtdArena,
        endpoint: EndpointContext,
        setup_buf: *const u8,
        data_buf: *const u8,
        data_len: usize,
        direction_in: bool,
    ) -> Result<Self, UsbError> {
        let qh = QueueHead::new_for_endpoint(&endpoint);
        let qh_index = qhs.alloc(qh)?;

        let setup_mapping = BufferMapping::map(bus, DmaDirection::HostToDevice, setup_buf, 8)?;
        let setup_qtd = QueueTransferDescriptor::setup(false, setup_mapping.bus_addr());
        let mut chain: heapless::Vec<usize, 12> = heapless::Vec::new();
        chain
            .push(qtds.alloc(setup_qtd)?)
            .map_err(|_| UsbError::OutOfResources)?;

        let mut data_mapping = None;
        let mut toggle = true;
        if data_len > 0 {
            let dir = if direction_in {
                DmaDirection::DeviceToHost
            } else {
                DmaDirection::HostToDevice
            };
            let mapping = BufferMapping::map(bus, dir, data_buf, data_len)?;
            let data_pid = if direction_in { Pid::In } else { Pid::Out };
            let n = Self::qtd_count_for_len(data_len);
            let mut remaining = data_len;
            let mut addr = mapping.bus_addr();
            for _ in 0..n {
                let chunk = remaining.min(QTD_MAX_TRANSFER_BYTES);
                // IOC is carried by the status stage, not the data stage.
                let qtd = QueueTransferDescriptor::data(data_pid, toggle, addr, chunk, false);
                chain
                    .push(qtds.alloc(qtd)?)
                    .map_err(|_| UsbError::OutOfResources)?;
                toggle = !toggle;
                addr = addr.wrapping_add(chunk as u32);
                remaining -= chunk;
            }
            data_mapping = Some(mapping);
        }

        // Status stage is the opposite direction of the data stage, or IN
        // if there is no data stage at all (SET_ADDRESS, SET_CONFIGURATION, ...).
        let status_pid = if data_len == 0 {
            Pid::In
        } else if direction_in {
            Pid::Out
        } else {
            Pid::In
        };
        let status_qtd = QueueTransferDescriptor::status(status_pid, true);
        chain
            .push(qtds.alloc(status_qtd)?)
            .map_err(|_| UsbError::OutOfResources)?;

        link_chain(qtds, &chain);
        attach_chain_to_qh(qhs, qh_index, &chain);

        Ok(Urb {
            qh_index,
            qtd_chain: chain,
            endpoint,
            direction_in,
            data_mapping,
            setup_mapping: Some(setup_mapping),
            data_host_ptr: data_buf as *mut u8,
            requested_len: data_len,
            completed_len: 0,
            result: UsbResultCode::NO_ERROR,
            kind: TransferKind::Control,
            interval_ms: 0,
            periodic_bucket: 0,
            callback: None,
            ctx: core::ptr::null_mut(),
        })
    }

    /// Builds a single DATA-PID QTD chain against a freshly mapped buffer,
    /// toggle continuing from the caller-supplied value, IOC on the last
    /// QTD. Shared by [`Self::build_data_only`] (fresh QH) and
    /// [`Self::rebuild_data_chain`] (existing QH, for async-interrupt
    /// reactivation).
    fn build_data_qtd_chain<B: Bus>(
        bus: &B,
        qtds: &mut QtdArena,
        data_buf: *const u8,
        data_len: usize,
        direction_in: bool,
        initial_toggle: bool,
    ) -> Result<(heapless::Vec<usize, 12>, BufferMapping), UsbError> {
        let dir = if direction_in {
            DmaDirection::DeviceToHost
        } else {
            DmaDirection::HostToDevice
        };
        let mapping = BufferMapping::map(bus, dir, data_buf, data_len.max(1))?;
        let pid = if direction_in { Pid::In } else { Pid::Out };
        let n = Self::qtd_count_for_len(data_len);

        let mut chain: heapless::Vec<usize, 12> = heapless::Vec::new();
        let mut remaining = data_len;
        let mut addr = mapping.bus_addr();
        let mut toggle = initial_toggle;
        for i in 0..n {
            let chunk = remaining.min(QTD_MAX_TRANSFER_BYTES);
            let ioc = i + 1 == n;
            let qtd = QueueTransferDescriptor::data(pid, toggle, addr, chunk, ioc);
            chain
                .push(qtds.alloc(qtd)?)
                .map_err(|_| UsbError::OutOfResources)?;
            toggle = !toggle;
            addr = addr.wrapping_add(chunk as u32);
            remaining -= chunk;
        }
        Ok((chain, mapping))
    }

    /// Builds a QH + QTD chain for a bulk or (sync/async) interrupt
    /// transfer: a single DATA-PID chain, toggle continuing from the
    /// caller-supplied value, IOC on the last QTD.
    pub fn build_data_only<B: Bus>(
        bus: &B,
        qhs: &mut QhArena,
        qtds: &mut QtdArena,
        endpoint: EndpointContext,
        data_buf: *const u8,
        data_len: usize,
        direction_in: bool,
        initial_toggle: bool,
        kind: TransferKind,
        interval_ms: u32,
    ) -> Result<Self, UsbError> {
        let qh = QueueHead::new_for_endpoint(&endpoint);
        let qh_index = qhs.alloc(qh)?;

        let (chain, mapping) =
            Self::build_data_qtd_chain(bus, qtds, data_buf, data_len, direction_in, initial_toggle)?;

        link_chain(qtds, &chain);
        attach_chain_to_qh(qhs, qh_index, &chain);

        Ok(Urb {
            qh_index,
            qtd_chain: chain,
            endpoint,
            direction_in,
            data_mapping: Some(mapping),
            setup_mapping: None,
            data_host_ptr: data_buf as *mut u8,
            requested_len: data_len,
            completed_len: 0,
            result: UsbResultCode::NO_ERROR,
            kind,
            interval_ms,
            periodic_bucket: 0,
            callback: None,
            ctx: core::ptr::null_mut(),
        })
    }

    /// Rebuilds this URB's QTD chain in place against its existing QH,
    /// for async-interrupt reactivation (§4.E). The QH is left untouched
    /// so periodic-schedule linkage (bucket/frame-list entries keyed on
    /// `qh_index`) stays valid across repeated completions, matching
    /// EDK2's `EhcMonitorAsyncRequests` reinitializing the overlay in
    /// place rather than reallocating a queue head.
    ///
    /// Caller must have already freed the old `qtd_chain` entries and
    /// released `data_mapping`.
    pub fn rebuild_data_chain<B: Bus>(
        &mut self,
        bus: &B,
        qtds: &mut QtdArena,
        qhs: &mut QhArena,
        data_buf: *const u8,
        data_len: usize,
        initial_toggle: bool,
    ) -> Result<(), UsbError> {
        let (chain, mapping) = Self::build_data_qtd_chain(
            bus,
            qtds,
            data_buf,
            data_len,
            self.direction_in,
            initial_toggle,
        )?;
        link_chain(qtds, &chain);
        attach_chain_to_qh(qhs, self.qh_index, &chain);

        self.qtd_chain = chain;
        self.data_mapping = Some(mapping);
        self.data_host_ptr = data_buf as *mut u8;
        self.requested_len = data_len;
        self.completed_len = 0;
        self.result = UsbResultCode::NO_ERROR;
        Ok(())
    }

    /// Examines the QTD chain: if every QTD is complete, sums completed
    /// bytes; if any QTD reports an error, translates the status bits to a
    /// [`UsbResultCode`] and stops at the first errored QTD (§4.E, §8
    /// invariant 3).
    pub fn check_result(&mut self, qtds: &QtdArena) -> TransferPoll {
        let mut completed = 0usize;
        for &idx in self.qtd_chain.iter() {
            let qtd = qtds.get(idx);
            if qtd.is_active() {
                self.completed_len = completed;
                return TransferPoll::Pending;
            }
            if qtd.has_error() {
                self.result = translate_error(qtd.token);
                self.completed_len = completed;
                return TransferPoll::Done;
            }
            completed += qtd.bytes_transferred() as usize;
        }
        self.completed_len = completed;
        self.result = UsbResultCode::NO_ERROR;
        TransferPoll::Done
    }

    /// Polls `check_result` until completion or `timeout_ms` elapses.
    /// `timeout_ms == 0` is treated as the default internal bound per the
    /// resolved open question in SPEC_FULL.md.
    pub fn poll_until_done<P: Platform>(
        &mut self,
        qtds: &QtdArena,
        platform: &P,
        timeout_ms: u32,
    ) -> TransferPoll {
        const DEFAULT_TRANSFER_TIMEOUT_MS: u32 = 5000;
        let bound_ms = if timeout_ms == 0 {
            DEFAULT_TRANSFER_TIMEOUT_MS
        } else {
            timeout_ms
        };
        let deadline = platform
            .monotonic_micros()
            .saturating_add((bound_ms as u64) * 1000);
        loop {
            match self.check_result(qtds) {
                TransferPoll::Done => return TransferPoll::Done,
                TransferPoll::Pending => {
                    if platform.monotonic_micros() >= deadline {
                        self.result |= UsbResultCode::TIMEOUT;
                        return TransferPoll::TimedOut;
                    }
                    platform.stall(50);
                }
                TransferPoll::TimedOut => unreachable!(),
            }
        }
    }

    /// Releases DMA mappings; QH/QTD arena slots are freed by the caller
    /// after unlinking (§4.D/§4.E teardown ordering).
    pub fn release_mappings<B: Bus>(&mut self, bus: &B) {
        if let Some(m) = self.data_mapping.take() {
            m.unmap(bus);
        }
        if let Some(m) = self.setup_mapping.take() {
            m.unmap(bus);
        }
    }

    pub fn free_descriptors(&self, qhs: &mut QhArena, qtds: &mut QtdArena) {
        for &idx in self.qtd_chain.iter() {
            qtds.free(idx);
        }
        qhs.free(self.qh_index);
    }

    /// Snapshots the current data toggle from the last QTD's token, for
    /// reporting back on bulk/interrupt completion or async-interrupt
    /// cancel. Must be called while still holding the priority elevation
    /// acquired for the operation (§9 open-question resolution).
    pub fn snapshot_toggle(&self, qtds: &QtdArena) -> bool {
        match self.qtd_chain.last() {
            Some(&idx) => qtds.get(idx).toggle(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPoll {
    Pending,
    Done,
    TimedOut,
}

fn link_chain(qtds: &mut QtdArena, chain: &[usize]) {
    for w in chain.windows(2) {
        qtds.get_mut(w[0]).link_next(w[1]);
    }
}

fn attach_chain_to_qh(qhs: &mut QhArena, qh_index: usize, chain: &[usize]) {
    if let Some(&first) = chain.first() {
        let qh = qhs.get_mut(qh_index);
        qh.next_qtd = Some(first);
        qh.overlay_token &= !crate::descriptor::qtd_token::STATUS_HALTED;
    }
}

fn translate_error(token: u32) -> UsbResultCode {
    use crate::descriptor::qtd_token::*;
    let mut result = UsbResultCode::NO_ERROR;
    if token & STATUS_BABBLE != 0 {
        result |= UsbResultCode::BABBLE;
    }
    if token & STATUS_XACT_ERR != 0 {
        result |= UsbResultCode::TRANSACTION_ERROR;
    }
    if token & STATUS_BUFFER_ERR != 0 {
        result |= UsbResultCode::BUFFER_ERROR;
    }
    if token & STATUS_HALTED != 0 && result == UsbResultCode::NO_ERROR {
        result |= UsbResultCode::STALL;
    }
    if token & (CERR_MASK) == 0 && token & STATUS_HALTED != 0 {
        result |= UsbResultCode::DATA_BUFFER_ERROR;
    }
    result
}

/// Standard max-packet / speed parameter validation (§4.H tables).
pub fn validate_control_max_packet(speed: Speed, max_packet: u16) -> Result<(), UsbError> {
    if speed == Speed::Low && max_packet != 8 {
        return Err(UsbError::InvalidParameter);
    }
    match max_packet {
        8 | 16 | 32 | 64 => Ok(()),
        _ => Err(UsbError::InvalidParameter),
    }
}

pub fn validate_bulk_max_packet(speed: Speed, max_packet: u16) -> Result<(), UsbError> {
    match speed {
        Speed::Low => Err(UsbError::InvalidParameter),
        Speed::Full if max_packet <= 64 => Ok(()),
        Speed::High if max_packet <= 512 => Ok(()),
        _ => Err(UsbError::InvalidParameter),
    }
}

pub fn validate_sync_interrupt_max_packet(speed: Speed, max_packet: u16) -> Result<(), UsbError> {
    match speed {
        Speed::High if max_packet <= 3072 => Ok(()),
        Speed::Full if max_packet <= 64 => Ok(()),
        Speed::Low if max_packet == 8 => Ok(()),
        _ => Err(UsbError::InvalidParameter),
    }
}

pub fn validate_async_interrupt(direction_in: bool, interval_ms: u32) -> Result<(), UsbError> {
    if !direction_in {
        return Err(UsbError::InvalidParameter);
    }
    if interval_ms == 0 || interval_ms > 255 {
        return Err(UsbError::InvalidParameter);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{CoherentAlloc, Width};
    use crate::platform::{ExitBootCallback, PriorityLevel, TimerCallback, TimerHandle};
    use std::cell::Cell;

    /// Bare-minimum [`Bus`] double: only the DMA-mapping calls `Urb`
    /// builders make are ever exercised here, everything else panics if
    /// reached.
    struct StubBus;

    impl Bus for StubBus {
        fn pci_read_config(&self, _offset: u16, _width: Width) -> u32 {
            unreachable!()
        }
        fn pci_write_config(&self, _offset: u16, _width: Width, _value: u32) {
            unreachable!()
        }
        fn pci_attributes_get(&self) -> crate::bus::PciAttributes {
            unreachable!()
        }
        fn pci_attributes_set(&self, _attrs: crate::bus::PciAttributes) -> Result<(), UsbError> {
            unreachable!()
        }
        fn mmio_read32(&self, _offset: usize) -> u32 {
            unreachable!()
        }
        fn mmio_write32(&self, _offset: usize, _value: u32) {
            unreachable!()
        }
        fn pci_map_dma(
            &self,
            direction: DmaDirection,
            host_ptr: *const u8,
            len: usize,
        ) -> Result<crate::bus::DmaMapping, UsbError> {
            Ok(crate::bus::DmaMapping {
                bus_addr: host_ptr as usize as u32,
                len,
                direction,
                handle: 0,
            })
        }
        fn pci_unmap(&self, _mapping: crate::bus::DmaMapping) {}
        fn pci_allocate_coherent(&self, _pages: usize) -> Result<CoherentAlloc, UsbError> {
            unreachable!()
        }
        fn pci_free_coherent(&self, _alloc: CoherentAlloc) {
            unreachable!()
        }
        fn pci_flush(&self) {}
    }

    struct StubPlatform {
        micros: Cell<u64>,
    }

    impl StubPlatform {
        fn new() -> Self {
            StubPlatform { micros: Cell::new(0) }
        }
    }

    impl Platform for StubPlatform {
        type PriorityToken = ();
        fn raise_priority(&self, _level: PriorityLevel) {}
        fn restore_priority(&self, _token: ()) {}
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

    fn control_endpoint() -> EndpointContext {
        EndpointContext {
            device_addr: 1,
            endpoint: 0,
            speed: Speed::High,
            max_packet: 64,
            control: true,
            hub_addr: 0,
            port_num: 0,
            s_mask: 0,
            c_mask: 0,
            mult: 1,
        }
    }

    fn bulk_endpoint() -> EndpointContext {
        EndpointContext {
            device_addr: 1,
            endpoint: 1,
            speed: Speed::High,
            max_packet: 512,
            control: false,
            hub_addr: 0,
            port_num: 0,
            s_mask: 0,
            c_mask: 0,
            mult: 1,
        }
    }

    /// Marks every QTD in `chain` as retired with its full requested length
    /// transferred and no error, mirroring the controller clearing Active
    /// and zeroing the remaining-length field (cf.
    /// `descriptor::tests::bytes_transferred_is_requested_minus_remaining`).
    fn retire_chain(qtds: &mut QtdArena, chain: &[usize]) {
        for &idx in chain {
            let qtd = qtds.get_mut(idx);
            qtd.token &= !crate::descriptor::qtd_token::BYTES_MASK;
            qtd.token &= !crate::descriptor::qtd_token::STATUS_ACTIVE;
        }
    }

    /// PID field occupies token bits 8:9 (0=OUT, 1=IN, 2=SETUP).
    fn pid_field(token: u32) -> u32 {
        (token >> 8) & 0x3
    }

    #[test]
    fn status_stage_is_in_for_no_data_control_transfer() {
        let bus = StubBus;
        let mut qhs = QhArena::new();
        let mut qtds = QtdArena::new();
        let setup = [0u8; 8];
        let urb = Urb::build_control(
            &bus,
            &mut qhs,
            &mut qtds,
            control_endpoint(),
            setup.as_ptr(),
            core::ptr::null(),
            0,
            true,
        )
        .unwrap();
        let status_idx = *urb.qtd_chain.last().unwrap();
        assert_eq!(pid_field(qtds.get(status_idx).token), 1 /* IN */);
    }

    #[test]
    fn status_stage_is_out_for_in_data_control_transfer() {
        let bus = StubBus;
        let mut qhs = QhArena::new();
        let mut qtds = QtdArena::new();
        let setup = [0u8; 8];
        let mut data = [0u8; 18];
        let urb = Urb::build_control(
            &bus,
            &mut qhs,
            &mut qtds,
            control_endpoint(),
            setup.as_ptr(),
            data.as_mut_ptr(),
            data.len(),
            true,
        )
        .unwrap();
        let status_idx = *urb.qtd_chain.last().unwrap();
        assert_eq!(pid_field(qtds.get(status_idx).token), 0 /* OUT */);
    }

    #[test]
    fn control_transfer_completes_end_to_end_once_qtds_are_retired() {
        let bus = StubBus;
        let mut qhs = QhArena::new();
        let mut qtds = QtdArena::new();
        let platform = StubPlatform::new();
        let setup = [0u8; 8];
        let mut data = [0u8; 18];

        let mut urb = Urb::build_control(
            &bus,
            &mut qhs,
            &mut qtds,
            control_endpoint(),
            setup.as_ptr(),
            data.as_mut_ptr(),
            data.len(),
            true,
        )
        .unwrap();

        assert_eq!(urb.check_result(&qtds), TransferPoll::Pending);

        let chain = urb.qtd_chain.clone();
        retire_chain(&mut qtds, &chain);

        let poll = urb.poll_until_done(&qtds, &platform, 100);
        assert_eq!(poll, TransferPoll::Done);
        assert_eq!(urb.completed_len, 18);
        assert_eq!(urb.result, UsbResultCode::NO_ERROR);
    }

    #[test]
    fn bulk_transfer_completes_end_to_end_once_qtd_is_retired() {
        let bus = StubBus;
        let mut qhs = QhArena::new();
        let mut qtds = QtdArena::new();
        let platform = StubPlatform::new();
        let mut data = [0u8; 4096];

        let mut urb = Urb::build_data_only(
            &bus,
            &mut qhs,
            &mut qtds,
            bulk_endpoint(),
            data.as_mut_ptr(),
            data.len(),
            true,
            false,
            TransferKind::Bulk,
            0,
        )
        .unwrap();

        // 4096 bytes fits in a single QTD (QTD_MAX_TRANSFER_BYTES is ~20KiB).
        assert_eq!(urb.qtd_chain.len(), 1);

        let chain = urb.qtd_chain.clone();
        retire_chain(&mut qtds, &chain);

        let poll = urb.poll_until_done(&qtds, &platform, 100);
        assert_eq!(poll, TransferPoll::Done);
        assert_eq!(urb.completed_len, 4096);
    }

    #[test]
    fn async_interrupt_reactivation_reuses_the_same_qh_index() {
        let bus = StubBus;
        let mut qhs = QhArena::new();
        let mut qtds = QtdArena::new();
        let mut data = [0u8; 8];

        let mut urb = Urb::build_data_only(
            &bus,
            &mut qhs,
            &mut qtds,
            bulk_endpoint(),
            data.as_mut_ptr(),
            data.len(),
            true,
            false,
            TransferKind::InterruptAsync,
            8,
        )
        .unwrap();
        let original_qh_index = urb.qh_index;

        let chain = urb.qtd_chain.clone();
        retire_chain(&mut qtds, &chain);
        assert_eq!(urb.check_result(&qtds), TransferPoll::Done);

        let next_toggle = urb.snapshot_toggle(&qtds);
        if let Some(mapping) = urb.data_mapping.take() {
            mapping.unmap(&bus);
        }
        for &idx in &chain {
            qtds.free(idx);
        }
        urb.rebuild_data_chain(&bus, &mut qtds, &mut qhs, data.as_mut_ptr(), data.len(), next_toggle)
            .unwrap();

        assert_eq!(urb.qh_index, original_qh_index);
        assert_eq!(urb.check_result(&qtds), TransferPoll::Pending);
    }
}
