//! Schedule manager: the asynchronous ring and the periodic frame list
//! (§4.D).
//!
//! The IAAD unlink handshake and the periodic bucket-propagation rule are
//! grounded in `EhcUnlinkQhFromAsync`/`EhcLinkQhToPeriod` in
//! `original_source/MdeModulePkg/Bus/Pci/EhciDxe/Ehci.c`.

use heapless::Vec;

use crate::descriptor::{LinkTag, QhArena};
use crate::dma::{CoherentPool, FRAME_LIST_LEN};
use crate::error::UsbError;
use crate::platform::Platform;
use crate::regs::{self, RegisterWindow};
use crate::bus::Bus;

/// Bounded wait for the IAAD handshake (§4.D step 3); on timeout the caller
/// falls back to halting the async schedule around the unlink (§7).
pub const IAAD_TIMEOUT_US: u64 = 100_000;

/// Interval buckets are powers of two from 1 to 256 ms (§4.D).
pub const INTERVAL_BUCKETS: [u32; 9] = [1, 2, 4, 8, 16, 32, 64, 128, 256];

fn bucket_for_interval(interval_ms: u32) -> u32 {
    let capped = interval_ms.min(256).max(1);
    let mut chosen = 1;
    for &b in INTERVAL_BUCKETS.iter() {
        if b <= capped {
            chosen = b;
        }
    }
    chosen
}

/// The async-schedule ring: a circular list of QHs anchored at a head QH
/// with the H-bit set.
pub struct AsyncSchedule {
    head: usize,
}

impl AsyncSchedule {
    /// Allocates the head QH (link-to-self, H-bit set) and returns the
    /// schedule handle.
    pub fn init(qhs: &mut QhArena) -> Result<Self, UsbError> {
        let head = qhs.alloc(crate::descriptor::QueueHead::blank())?;
        let head_qh = crate::descriptor::QueueHead::new_async_head(head);
        *qhs.get_mut(head) = head_qh;
        Ok(AsyncSchedule { head })
    }

    pub fn head_index(&self) -> usize {
        self.head
    }

    /// Links `qh_index` into the ring right after the head (§4.D linking
    /// protocol: the new QH's link is set first, then the head's link is
    /// published, so the controller — which only ever reads — observes
    /// either the old or the fully-linked ring).
    pub fn link(&self, qhs: &mut QhArena, qh_index: usize) {
        let head_link = qhs.get(self.head).horizontal;
        qhs.get_mut(qh_index).horizontal = head_link;
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        qhs.get_mut(self.head).horizontal = LinkTag::Qh(qh_index);
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    /// Unlinks `qh_index` from the ring following the §4.D protocol:
    /// splice out, ring the IAAD doorbell, wait for IAA (falling back to
    /// halting the schedule on timeout), then acknowledge.
    pub fn unlink<B: Bus, P: Platform>(
        &self,
        qhs: &mut QhArena,
        qh_index: usize,
        regs: &RegisterWindow<B>,
        platform: &P,
    ) -> Result<(), UsbError> {
        // Step 1: splice out by finding the predecessor.
        let mut pred = self.head;
        loop {
            let next = qhs.get(pred).horizontal;
            match next {
                LinkTag::Qh(idx) if idx == qh_index => break,
                LinkTag::Qh(idx) => pred = idx,
                _ => return Err(UsbError::InvalidParameter),
            }
        }
        let removed_link = qhs.get(qh_index).horizontal;
        qhs.get_mut(pred).horizontal = removed_link;
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);

        // Step 2/3: doorbell + bounded wait for IAA.
        regs.bit_set(regs::op::USBCMD, 1 << regs::USBCMD::IAAD.shift);
        let waited = regs.poll_bit(
            regs::op::USBSTS,
            1 << regs::USBSTS::IAA.shift,
            1 << regs::USBSTS::IAA.shift,
            IAAD_TIMEOUT_US,
            |us| platform.stall(us),
            || platform.monotonic_micros(),
        );

        if waited.is_err() {
            // Fallback: halt the async schedule around the unlink (§7).
            regs.bit_clear(regs::op::USBCMD, 1 << regs::USBCMD::ASE.shift);
            let _ = regs.poll_bit(
                regs::op::USBSTS,
                1 << regs::USBSTS::ASS.shift,
                0,
                IAAD_TIMEOUT_US,
                |us| platform.stall(us),
                || platform.monotonic_micros(),
            );
            regs.bit_set(regs::op::USBCMD, 1 << regs::USBCMD::ASE.shift);
        } else {
            // Step 4: acknowledge.
            regs.ack_usbsts(1 << regs::USBSTS::IAA.shift);
        }

        Ok(())
    }
}

/// Upper bound on concurrently linked periodic QHs: bounded above by the
/// QH arena's own capacity, since a QH must be allocated before it can be
/// linked here.
const MAX_PERIODIC_MEMBERS: usize = 48;

/// Per-bucket head QHs for the periodic schedule, plus the 1024-entry
/// frame list.
///
/// A frame-list slot whose index is divisible by a bucket's interval must
/// transitively reach that bucket's QHs (§4.D); since buckets are powers
/// of two, the set of buckets dividing a given slot nests (whatever
/// divides the largest also divides every smaller one), so bucket chains
/// are threaded from the smallest (1ms) bucket up to the largest: each
/// bucket's member chain terminates by cross-linking into the nearest
/// smaller *populated* bucket instead of unconditionally terminating.
/// `link`/`unlink` track flat membership and reconstruct the horizontal
/// chain and frame list from scratch, which is cheap given the small
/// bound on concurrently linked periodic QHs.
pub struct PeriodicSchedule {
    members: Vec<(usize, u32), MAX_PERIODIC_MEMBERS>,
    bucket_heads: [Option<usize>; INTERVAL_BUCKETS.len()],
}

impl PeriodicSchedule {
    pub fn init(pool: &CoherentPool) -> Self {
        for i in 0..FRAME_LIST_LEN {
            // SAFETY: pool was just allocated and sized for the frame list.
            unsafe { pool.write_frame(i, 1 /* terminate bit */) };
        }
        PeriodicSchedule {
            members: Vec::new(),
            bucket_heads: [None; INTERVAL_BUCKETS.len()],
        }
    }

    /// Re-terminates every frame-list slot and forgets all bucket
    /// memberships, matching `init` without a fresh coherent allocation
    /// (§4.F reset).
    pub fn reset(&mut self, pool: &CoherentPool) {
        for i in 0..FRAME_LIST_LEN {
            // SAFETY: pool sized for FRAME_LIST_LEN entries.
            unsafe { pool.write_frame(i, 1) };
        }
        self.members.clear();
        self.bucket_heads = [None; INTERVAL_BUCKETS.len()];
    }

    /// Largest bucket interval dividing `slot`, capped at the largest
    /// defined bucket (256ms). Slot 0 is a multiple of every bucket, so it
    /// is pinned to the largest.
    fn largest_dividing_bucket_index(slot: usize) -> usize {
        if slot == 0 {
            return INTERVAL_BUCKETS.len() - 1;
        }
        let largest_pow2 = (slot as u32) & (slot as u32).wrapping_neg();
        match INTERVAL_BUCKETS.iter().rposition(|&b| b <= largest_pow2) {
            Some(idx) => idx,
            None => 0,
        }
    }

    /// Rebuilds `bucket_heads`, every member QH's horizontal link, and the
    /// full frame list from `self.members`.
    fn rebuild(&mut self, qhs: &mut QhArena, pool: &CoherentPool) {
        self.bucket_heads = [None; INTERVAL_BUCKETS.len()];

        // Chain each bucket's own members (most-recently-linked first),
        // then cross-link the bucket's tail into `cross_target`, the
        // nearest smaller populated bucket (or terminate). Built smallest
        // bucket to largest so `cross_target` always reflects everything
        // populated at or below the bucket just processed.
        let mut effective_head: [LinkTag; INTERVAL_BUCKETS.len()] =
            [LinkTag::Terminate; INTERVAL_BUCKETS.len()];
        let mut cross_target = LinkTag::Terminate;
        for (idx, &bucket) in INTERVAL_BUCKETS.iter().enumerate() {
            let mut bucket_members = self
                .members
                .iter()
                .filter(|&&(_, b)| b == bucket)
                .map(|&(qh, _)| qh);
            let head = match bucket_members.next() {
                Some(first) => {
                    let mut tail = first;
                    for next in bucket_members {
                        qhs.get_mut(tail).horizontal = LinkTag::Qh(next);
                        tail = next;
                    }
                    qhs.get_mut(tail).horizontal = cross_target;
                    Some(first)
                }
                None => None,
            };
            self.bucket_heads[idx] = head;
            effective_head[idx] = match head {
                Some(h) => LinkTag::Qh(h),
                None => cross_target,
            };
            cross_target = effective_head[idx];
        }

        for slot in 0..FRAME_LIST_LEN {
            let idx = Self::largest_dividing_bucket_index(slot);
            let tag = match effective_head[idx] {
                LinkTag::Qh(h) => ((h as u32) << 5) | (1 << 1) /* TYPE_QH */,
                _ => 1 /* terminate bit */,
            };
            // SAFETY: pool sized for FRAME_LIST_LEN entries.
            unsafe { pool.write_frame(slot, tag) };
        }
    }

    /// Links `qh_index` into the bucket chosen for `interval_ms`, chaining
    /// buckets so every frame-list slot whose index is divisible by a
    /// bucket's interval transitively reaches that bucket (§4.D).
    pub fn link(
        &mut self,
        qhs: &mut QhArena,
        pool: &CoherentPool,
        qh_index: usize,
        interval_ms: u32,
    ) -> u32 {
        let bucket = bucket_for_interval(interval_ms);
        // The arena bounds concurrent QHs well below MAX_PERIODIC_MEMBERS;
        // a full arena would already have failed QH allocation.
        let _ = self.members.push((qh_index, bucket));
        self.rebuild(qhs, pool);
        bucket
    }

    /// Splices `qh_index` out of its bucket and rebuilds the chain and
    /// frame list so only the slots that depended on it (directly, or
    /// transitively through a finer bucket that cross-linked through it)
    /// change. The caller must wait at least one full frame (>= 1ms) after
    /// this call before freeing the QH (§4.D).
    pub fn unlink(&mut self, qhs: &mut QhArena, pool: &CoherentPool, qh_index: usize, bucket: u32) {
        let _ = bucket;
        if let Some(pos) = self.members.iter().position(|&(qh, _)| qh == qh_index) {
            self.members.swap_remove(pos);
        }
        self.rebuild(qhs, pool);
    }
}

/// Bookkeeping for the live async-interrupt URBs the poller walks each
/// tick (§4.E).
pub struct AsyncInterruptList {
    urb_indices: Vec<usize, 32>,
}

impl AsyncInterruptList {
    pub fn new() -> Self {
        AsyncInterruptList {
            urb_indices: Vec::new(),
        }
    }

    pub fn insert(&mut self, urb_index: usize) -> Result<(), UsbError> {
        self.urb_indices
            .push(urb_index)
            .map_err(|_| UsbError::OutOfResources)
    }

    pub fn remove(&mut self, urb_index: usize) {
        if let Some(pos) = self.urb_indices.iter().position(|&i| i == urb_index) {
            self.urb_indices.swap_remove(pos);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.urb_indices.iter().copied()
    }

    /// Drops every membership record without touching the URBs themselves;
    /// used by `Controller::reset` after the caller has torn each one down.
    pub fn clear(&mut self) {
        self.urb_indices.clear();
    }
}

impl Default for AsyncInterruptList {
    fn default() -> Self {
        Self::new()
    }
}
