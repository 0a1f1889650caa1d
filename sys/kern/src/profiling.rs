// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel online profiling support.
//!
//! This is intended to help measure the timing of kernel events -- tick
//! overhead, switch duration, preemption rate -- as an aid to debugging or
//! optimization work.
//!
//! Because the kernel is SoC-independent, this module does not assume any
//! particular way of getting profiling information out. A target that wants
//! profiling populates an [`EventsTable`] and hands it to
//! [`configure_events_table`] from its startup routine. A typical
//! implementation sets and clears GPIOs from the hooks, where a logic
//! analyzer can see them. Keep the hooks fast, and keep them away from the
//! switch machinery: calling back into the kernel from a hook is not
//! supported.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks provided by board setup code to observe kernel events.
///
/// If you provide an `EventsTable`, you have to provide every hook; stub the
/// ones you don't care about with `|| ()`. This keeps the per-event cost to
/// one null-pointer check on the table, rather than one per hook.
pub struct EventsTable {
    /// Called on entry to the quantum timer's tick handler.
    pub timer_isr_enter: fn(),
    /// Called on exit from the tick handler.
    pub timer_isr_exit: fn(),
    /// Called when the switch handler begins, before any scheduler
    /// involvement.
    pub switch_enter: fn(),
    /// Called when the switch handler has chosen and installed the incoming
    /// stack.
    pub switch_exit: fn(),
    /// Called whenever the running task changes, with the incoming stack
    /// pointer.
    pub context_switch: fn(usize),
    /// Called once, from the bootstrap trap, just before the first task
    /// starts.
    pub bootstrap: fn(),
}

/// Supplies the kernel with an events table.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Internal pointer written by `configure_events_table`. If this is null, no
/// event table has been provided.
///
/// All accesses use `Relaxed` ordering: the pointer is written once at
/// startup and read many times, and memory barriers have non-zero cost.
static EVENTS_TABLE: AtomicPtr<EventsTable> = AtomicPtr::new(core::ptr::null_mut());

/// Grabs a reference to the configured table, if any.
fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // We only write this pointer from a valid `&'static`, and we're
        // handing out a shared reference, so this should be ok...
        unsafe { Some(&*p) }
    }
}

pub(crate) fn event_timer_isr_enter() {
    if let Some(t) = table() {
        (t.timer_isr_enter)()
    }
}

pub(crate) fn event_timer_isr_exit() {
    if let Some(t) = table() {
        (t.timer_isr_exit)()
    }
}

pub(crate) fn event_switch_enter() {
    if let Some(t) = table() {
        (t.switch_enter)()
    }
}

pub(crate) fn event_switch_exit() {
    if let Some(t) = table() {
        (t.switch_exit)()
    }
}

pub(crate) fn event_context_switch(sp: usize) {
    if let Some(t) = table() {
        (t.context_switch)(sp)
    }
}

pub(crate) fn event_bootstrap() {
    if let Some(t) = table() {
        (t.bootstrap)()
    }
}
