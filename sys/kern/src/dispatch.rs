// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Context-switch dispatch: the portable half of the switch protocol.
//!
//! The architecture layer owns the save/restore of registers; everything in
//! between -- recording the outgoing stack pointer, consulting the scheduler,
//! honoring a termination request, installing the incoming stack -- lives
//! here and runs unmodified on the simulator.
//!
//! The full protocol, per switch:
//!
//! 1. The switch trap fires at the lowest exception priority, so no second
//!    kernel entry can begin while this one is in flight.
//! 2. The architecture layer pushes the software-defined register segment
//!    onto the outgoing task's stack and reads the live stack pointer.
//! 3. [`switch_stacks`] records that pointer into the outgoing descriptor,
//!    asks the [`Scheduler`] for the next stack (routing a terminated task to
//!    [`Scheduler::task_terminated`] instead), and returns the incoming
//!    descriptor's stack pointer.
//! 4. The architecture layer installs that pointer, pops the software
//!    segment, and trap-returns; the hardware segment pop resumes the
//!    incoming task exactly where it left off, or at its entry function if it
//!    has never run. Both cases are the same pop -- that is the point of the
//!    frame built by `init_stack`.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use abi::StackDesc;

/// Return value for operations that can have scheduling implications. Marked
/// `must_use` because dropping one means dropping a required context switch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever task we were just running.
    Same,
    /// A switch is due; which task runs next is the scheduler's decision.
    Other,
}

/// The execution core's view of the scheduler.
///
/// Implementations own the set of stack descriptors and decide policy; the
/// core only performs the mechanics of a switch. Both methods are called with
/// interrupts masked at the kernel's priority level, mid-switch, so they must
/// not block, must not take long, and must not call back into the switch
/// machinery. Arming the next time budget (via [`crate::time::set_quantum`])
/// *is* legal here, and in fact required: a scheduler that does not rearm the
/// quantum after a switch leaves the incoming task unpreemptible.
///
/// Returning a descriptor whose stack does not hold a valid frame (never
/// initialized, already terminated elsewhere, or clobbered) is a contract
/// violation with undefined behavior; the core performs no validation beyond
/// the descriptor's own lifecycle assertions.
pub trait Scheduler {
    /// Chooses the stack to resume.
    ///
    /// `outgoing` is the descriptor of the task that was just suspended, with
    /// its stack pointer freshly recorded -- reclaim it for later resumption.
    /// It is `None` exactly when the outgoing task was terminated, in which
    /// case the descriptor was already handed to `task_terminated`.
    fn provide_stack(
        &mut self,
        outgoing: Option<&'static mut StackDesc>,
    ) -> &'static mut StackDesc;

    /// Notification that the outgoing task was terminated rather than
    /// suspended. The stack no longer holds a resumable frame; the
    /// implementation typically recycles the descriptor and backing memory.
    fn task_terminated(&mut self, stack: &'static mut StackDesc);
}

/// The dispatcher: the kernel context created at startup and alive for the
/// rest of the system's life. It is the one place that knows which stack is
/// currently live in the hardware.
pub(crate) struct Dispatcher {
    pub sched: &'static mut dyn Scheduler,
    pub current: Option<&'static mut StackDesc>,
}

/// Tracks when a mutable reference to the dispatcher is floating around in
/// kernel code, to prevent production of a second one.
///
/// Notice that this begins life set. This prevents use of `with_dispatcher`
/// before startup has installed the dispatcher; `install_dispatcher` clears
/// it.
static DISPATCHER_IN_USE: AtomicBool = AtomicBool::new(true);

static mut DISPATCHER: MaybeUninit<Dispatcher> = MaybeUninit::uninit();

/// Pending-termination request for the currently running task, set by
/// [`terminate_current_task`] and consumed by the next switch. Like the
/// quantum, it is only ever written from the kernel's single, non-nested
/// priority level (or from task code racing *toward* that level, which the
/// swap in `switch_stacks` makes harmless), so a relaxed atomic suffices.
static TERMINATE_PENDING: AtomicBool = AtomicBool::new(false);

pub(crate) fn install_dispatcher(d: Dispatcher) {
    // Safety: our caller (startup) runs before multitasking begins and has
    // latched against being run twice concurrently; with DISPATCHER_IN_USE
    // still set from reset, nothing else can be holding a reference.
    unsafe {
        core::ptr::addr_of_mut!(DISPATCHER).write(MaybeUninit::new(d));
    }
    DISPATCHER_IN_USE.store(false, Ordering::Release);
}

/// Runs `body` with a reference to the dispatcher.
///
/// To preserve uniqueness of the `&mut` reference passed into `body`, this
/// function will detect any attempts to call it recursively and panic. That
/// situation is structurally impossible given the exception priority setup,
/// so the panic is a tripwire, not a code path.
fn with_dispatcher<R>(body: impl FnOnce(&mut Dispatcher) -> R) -> R {
    if DISPATCHER_IN_USE.swap(true, Ordering::Acquire) {
        panic!(); // switch requested before startup, or reentered
    }
    // Safety: we have observed DISPATCHER_IN_USE being false, which means the
    // dispatcher is installed (at reset it starts out true) and we're not
    // already within a call to with_dispatcher. Thus, we can produce a
    // reference without aliasing.
    let d = unsafe { (*core::ptr::addr_of_mut!(DISPATCHER)).assume_init_mut() };
    let r = body(d);
    DISPATCHER_IN_USE.store(false, Ordering::Release);
    r
}

/// Requests that the currently running task never be resumed.
///
/// The actual retirement happens inside the next switch: the task keeps
/// running until its quantum expires or someone requests a switch, at which
/// point its descriptor goes to [`Scheduler::task_terminated`] instead of
/// back into circulation. This call raises the switch request itself, so the
/// handoff is normally immediate.
pub fn terminate_current_task() {
    TERMINATE_PENDING.store(true, Ordering::Relaxed);
    crate::arch::pend_switch();
}

/// The portable core of the context switch; see the module docs for where
/// this sits in the protocol. Called by the architecture layer with the
/// outgoing task's stack pointer, after the register save; returns the stack
/// pointer to install for the restore.
pub(crate) fn switch_stacks(outgoing_sp: usize) -> usize {
    crate::profiling::event_switch_enter();
    let incoming_sp = with_dispatcher(|d| {
        let Some(outgoing) = d.current.take() else {
            panic!(); // switch trap before the first task was dispatched
        };

        let incoming = if TERMINATE_PENDING.swap(false, Ordering::Relaxed) {
            outgoing.retire(outgoing_sp);
            d.sched.task_terminated(outgoing);
            d.sched.provide_stack(None)
        } else {
            outgoing.suspend_at(outgoing_sp);
            d.sched.provide_stack(Some(outgoing))
        };

        let sp = incoming.resume();
        d.current = Some(incoming);
        sp
    });
    crate::profiling::event_context_switch(incoming_sp);
    crate::profiling::event_switch_exit();
    incoming_sp
}

#[cfg(not(target_arch = "arm"))]
pub(crate) fn reset_for_harness() {
    DISPATCHER_IN_USE.store(true, Ordering::Release);
    TERMINATE_PENDING.store(false, Ordering::Relaxed);
}
