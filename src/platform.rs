//! The out-of-scope boot-service event/timer/priority collaborator.
//!
//! The firmware's task-priority-level (TPL) discipline and timer/event
//! machinery live outside this crate. [`Platform`] exposes exactly the
//! operations §4.H's priority-elevation protocol and the async-interrupt
//! poller need.

/// Firmware task-priority levels relevant to this driver, ordered low to
/// high. The controller's own elevated level (`Ehc`) must sit strictly
/// above `Callback`, the level the async-interrupt poller timer runs at, so
/// a public operation excludes the poller for its whole duration (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityLevel {
    Application,
    Callback,
    Ehc,
    Notify,
}

pub type TimerCallback = fn(ctx: *mut ());
pub type ExitBootCallback = fn(ctx: *mut ());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(pub u64);

pub trait Platform {
    /// Opaque token proving priority was raised; dropped by
    /// `restore_priority` to return to the previous level. Implementations
    /// that track a TPL stack can make this the saved previous level.
    type PriorityToken;

    fn raise_priority(&self, level: PriorityLevel) -> Self::PriorityToken;
    fn restore_priority(&self, token: Self::PriorityToken);

    fn create_timer(&self, callback: TimerCallback, ctx: *mut ()) -> TimerHandle;
    fn arm_timer(&self, handle: TimerHandle, periodic_interval_ms: u32);
    fn cancel_timer(&self, handle: TimerHandle);

    fn create_exit_boot_event(&self, callback: ExitBootCallback, ctx: *mut ());

    /// Monotonic microsecond clock used to compute busy-wait deadlines.
    fn monotonic_micros(&self) -> u64;

    /// Busy-wait for roughly `micros` microseconds. The default spins on
    /// `monotonic_micros`, matching the "tick granularity ~50us" design
    /// note; platforms with a cheaper primitive may override it.
    fn stall(&self, micros: u64) {
        let deadline = self.monotonic_micros().saturating_add(micros);
        while self.monotonic_micros() < deadline {
            core::hint::spin_loop();
        }
    }
}
