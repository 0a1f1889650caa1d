// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time: the monotonic clock and quantum accounting.
//!
//! The timer interrupt fires [`SUBTICKS_PER_MS`] times per millisecond --
//! finer than the smallest quantum unit, so a quantum of one millisecond
//! still means at least a full millisecond of runtime regardless of where in
//! a tick period the task was resumed. Every `SUBTICKS_PER_MS`th sub-tick
//! advances the millisecond counter and charges the running task's quantum.
//!
//! All of the clock state is written from a single, non-nested exception
//! priority level (the timer tick and the switch commit both run there), so
//! relaxed atomics are sufficient; the atomics exist for interior mutability
//! and for lock-free readers in task context, not for cross-path ordering.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::dispatch::NextTask;

/// In-kernel timestamp representation, in milliseconds since boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<[u32; 2]> for Timestamp {
    fn from(v: [u32; 2]) -> Self {
        Self::from(u64::from(v[0]) | u64::from(v[1]) << 32)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// Timer interrupts per millisecond. Two, so the millisecond clock keeps its
/// resolution with rounding safety.
pub const SUBTICKS_PER_MS: u32 = 2;

/// The clock and quantum state. One static instance serves the system; the
/// type exists separately so the accounting can be tested on owned instances
/// without touching global state.
pub struct SystemClock {
    /// Milliseconds since boot. A pair of `AtomicU32` because (1) we want the
    /// interior mutability of the atomic types but (2) ARMv7-M doesn't have
    /// any 64-bit atomic operations. `ticks[0]` is the least significant
    /// half. Never reset except at power-on.
    ticks: [AtomicU32; 2],
    /// Sub-tick phase within the current millisecond, `0..SUBTICKS_PER_MS`.
    subtick: AtomicU32,
    /// The running task's remaining time budget, in milliseconds. Zero means
    /// "do not preempt" -- deliberately, not as a degenerate case: a task
    /// with no quantum runs until it yields or other kernel code forces a
    /// switch.
    quantum: AtomicU32,
}

impl SystemClock {
    pub const fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        SystemClock {
            ticks: [ZERO, ZERO],
            subtick: AtomicU32::new(0),
            quantum: AtomicU32::new(0),
        }
    }

    /// Accounts one timer interrupt. Returns `NextTask::Other` exactly when
    /// this tick exhausted the running task's quantum; the caller turns that
    /// into the pending-switch condition.
    ///
    /// On exhaustion the quantum parks at zero, so it cannot retrigger until
    /// a new budget is armed.
    pub fn tick(&self) -> NextTask {
        let phase = self.subtick.load(Ordering::Relaxed) + 1;
        if phase < SUBTICKS_PER_MS {
            self.subtick.store(phase, Ordering::Relaxed);
            return NextTask::Same;
        }
        self.subtick.store(0, Ordering::Relaxed);

        // Advance the millisecond counter by one. Laboriously, across the
        // two halves. We use checked addition for the high half because it
        // overflowing would mean half a billion years of uptime, which we'd
        // like to hear about.
        let t0 = self.ticks[0].load(Ordering::Relaxed);
        if let Some(t0p) = t0.checked_add(1) {
            self.ticks[0].store(t0p, Ordering::Relaxed);
        } else {
            let t1 = self.ticks[1].load(Ordering::Relaxed);
            self.ticks[0].store(0, Ordering::Relaxed);
            self.ticks[1].store(t1 + 1, Ordering::Relaxed);
        }

        match self.quantum.load(Ordering::Relaxed) {
            0 => NextTask::Same,
            1 => {
                self.quantum.store(0, Ordering::Relaxed);
                NextTask::Other
            }
            q => {
                self.quantum.store(q - 1, Ordering::Relaxed);
                NextTask::Same
            }
        }
    }

    /// Arms the running task's time budget.
    ///
    /// The scheduler must call this for every task it resumes (its
    /// `provide_stack` is the natural place); a task resumed without a fresh
    /// quantum is silently unpreemptible. `ms == 0` switches preemption off
    /// on purpose.
    pub fn set_quantum(&self, ms: u32) {
        self.quantum.store(ms, Ordering::Relaxed);
    }

    /// Reads the full-width clock.
    ///
    /// The two halves are read nonatomically. The timer tick cannot preempt
    /// kernel code (everything runs at one priority level), and a task-mode
    /// reader that gets preempted between the halves can observe a torn value
    /// only at the 49.7-day rollover of the low half; callers that care
    /// re-read until stable via `now_milliseconds`, which is single-word.
    pub fn now(&self) -> Timestamp {
        Timestamp::from([
            self.ticks[0].load(Ordering::Relaxed),
            self.ticks[1].load(Ordering::Relaxed),
        ])
    }

    /// Reads the low word of the clock: milliseconds since boot, wrapping.
    pub fn now_milliseconds(&self) -> u32 {
        self.ticks[0].load(Ordering::Relaxed)
    }

    #[cfg(not(target_arch = "arm"))]
    pub(crate) fn reset(&self) {
        self.ticks[0].store(0, Ordering::Relaxed);
        self.ticks[1].store(0, Ordering::Relaxed);
        self.subtick.store(0, Ordering::Relaxed);
        self.quantum.store(0, Ordering::Relaxed);
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The system instance, fed by the architecture layer's timer interrupt.
static SYSTEM_CLOCK: SystemClock = SystemClock::new();

/// One timer interrupt's worth of accounting; called from the tick ISR (or
/// its simulated equivalent).
pub(crate) fn system_tick() -> NextTask {
    SYSTEM_CLOCK.tick()
}

/// Arms the running task's time budget; see [`SystemClock::set_quantum`].
pub fn set_quantum(ms: u32) {
    SYSTEM_CLOCK.set_quantum(ms)
}

/// Reads the monotonic clock.
pub fn now() -> Timestamp {
    SYSTEM_CLOCK.now()
}

/// Reads the monotonic clock's millisecond word.
pub fn now_milliseconds() -> u32 {
    SYSTEM_CLOCK.now_milliseconds()
}

/// Raises the pending-switch condition, voluntarily handing off the
/// processor. Safe from any context once the kernel is started: it only pokes
/// the (hardware or simulated) pending bit, and the switch itself happens at
/// the switch trap's priority.
pub fn request_switch() {
    crate::arch::pend_switch()
}

#[cfg(not(target_arch = "arm"))]
pub(crate) fn reset_for_harness() {
    SYSTEM_CLOCK.reset()
}
