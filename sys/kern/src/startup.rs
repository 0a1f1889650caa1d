// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup: the one-way transition from single-stack initialization
//! into multitasked execution.
//!
//! Board bring-up code prepares task stacks with [`crate::stack::init_stack`],
//! builds its scheduler, optionally arms the first quantum, and then calls
//! [`enter_thread_mode`] exactly once. From that point on the boot stack is
//! abandoned, interrupts and traps run on the dedicated exception stack, and
//! task code runs unprivileged on task stacks. There is no way back.

use core::sync::atomic::{AtomicBool, Ordering};

use abi::StackDesc;

use crate::dispatch::{self, Dispatcher, Scheduler};

/// Configuration for the quantum tick source.
pub struct ClockConfig {
    /// Machine clocks per timer interrupt. With the timer firing
    /// [`crate::time::SUBTICKS_PER_MS`] times per millisecond, this is the
    /// core clock in Hz divided by (1000 × `SUBTICKS_PER_MS`).
    pub reload: u32,
}

/// Latches that `enter_thread_mode` has run. Never cleared on a real target.
static KERNEL_STARTED: AtomicBool = AtomicBool::new(false);

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        /// Moves the system from initialization into multitasked execution.
        /// Callable exactly once, from privileged thread mode, and never
        /// returns: execution continues inside `first_task`'s entry function.
        ///
        /// - `exception_stack` becomes the stack on which all future
        ///   interrupts and traps are serviced; task stacks are never again
        ///   used for handler-mode execution.
        /// - `sched` is consulted on every subsequent switch.
        /// - `first_task` must have been prepared by `init_stack`.
        ///
        /// # Panics
        ///
        /// Fatally, if called a second time or from interrupt context.
        pub fn enter_thread_mode(
            exception_stack: &'static mut StackDesc,
            sched: &'static mut dyn Scheduler,
            first_task: &'static mut StackDesc,
            clock: ClockConfig,
        ) -> ! {
            let (sp, handler_top) = prepare(exception_stack, sched, first_task);
            crate::arch::bootstrap_first_task(sp, handler_top, clock)
        }
    } else {
        /// Moves the simulated system from initialization into multitasked
        /// execution. Same contract as the real version, except that
        /// "execution continues inside the first task" is reported back to
        /// the driving harness as a [`crate::arch::ResumedContext`] rather
        /// than by actually transferring control.
        pub fn enter_thread_mode(
            exception_stack: &'static mut StackDesc,
            sched: &'static mut dyn Scheduler,
            first_task: &'static mut StackDesc,
            clock: ClockConfig,
        ) -> crate::arch::ResumedContext {
            let (sp, handler_top) = prepare(exception_stack, sched, first_task);
            crate::arch::bootstrap_first_task(sp, handler_top, clock)
        }
    }
}

/// The architecture-neutral part of thread-mode entry: the latch and context
/// checks, and publication of the dispatcher. Returns the first task's stack
/// pointer and the exception stack's reset pointer for the architecture
/// layer to install.
fn prepare(
    exception_stack: &'static mut StackDesc,
    sched: &'static mut dyn Scheduler,
    first_task: &'static mut StackDesc,
) -> (usize, usize) {
    if KERNEL_STARTED.swap(true, Ordering::SeqCst) {
        panic!("enter_thread_mode called twice");
    }
    uassert!(!crate::arch::in_interrupt_context());

    // From here until the architecture layer finishes the stack/privilege
    // flip, the stack-pointer configuration is inconsistent; nothing may
    // observe it. The quantum timer doesn't run yet (the bootstrap trap
    // starts it), and masking covers everything else.
    crate::arch::mask_interrupts();

    let handler_top = exception_stack.top();
    let sp = first_task.resume();
    dispatch::install_dispatcher(Dispatcher {
        sched,
        current: Some(first_task),
    });
    (sp, handler_top)
}

#[cfg(not(target_arch = "arm"))]
pub(crate) fn reset_for_harness() {
    KERNEL_STARTED.store(false, Ordering::SeqCst);
}
