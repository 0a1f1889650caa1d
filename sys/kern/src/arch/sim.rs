// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated machine for host-side testing.
//!
//! This module stands in for `arm_m` when the crate is built for anything
//! other than a real target. It models the pieces of the machine the
//! execution core cares about -- the register file, the two stack pointers,
//! the privilege/handler state, and the pending-switch bit -- as plain
//! memory, so the entire switch protocol can be exercised deterministically
//! by ordinary tests, without real interrupts.
//!
//! The simulation is driven, not free-running: a test harness calls
//! [`timer_fire`] to deliver a tick and [`service_pending_switch`] to let a
//! pended switch happen, mirroring the points where the hardware would take
//! the corresponding exceptions. Task code never actually executes; a "task"
//! here *is* its register state, and a resumption is reported to the harness
//! as a [`ResumedContext`] naming the program counter, argument, and link
//! slot that a real trap return would have made live.
//!
//! Frames pushed by the simulated switch have the same two-segment shape as
//! on the real machine (software segment below hardware segment, stacks
//! descending), just with host-width words.

use core::mem::size_of;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

bitflags! {
    /// Simulated CONTROL register.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Control: usize {
        /// Thread mode runs unprivileged.
        const NPRIV = 1 << 0;
        /// Thread mode uses the process stack pointer.
        const SPSEL = 1 << 1;
    }
}

/// The software-defined segment of a task's stack frame, as pushed by the
/// simulated switch. Matches the real machine's layout, in host-width words.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct SavedFrame {
    pub r4: usize,
    pub r5: usize,
    pub r6: usize,
    pub r7: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub exc_return: usize,
}

/// The hardware-defined segment: what the simulated exception entry stacks
/// and the simulated trap return consumes.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct HardwareFrame {
    pub r0: usize,
    pub r1: usize,
    pub r2: usize,
    pub r3: usize,
    pub r12: usize,
    pub lr: usize,
    pub pc: usize,
    pub xpsr: usize,
}

const_assert_eq!(size_of::<SavedFrame>(), 9 * size_of::<usize>());
const_assert_eq!(size_of::<HardwareFrame>(), 8 * size_of::<usize>());

/// Total size of the initial frame `build_initial_frame` lays down.
pub const FRAME_SIZE: usize = size_of::<SavedFrame>() + size_of::<HardwareFrame>();

/// Initial status word: just the Thumb bit, as on the real machine.
pub const INITIAL_PSR: usize = 1 << 24;

/// Exception-return word describing a task with a basic frame, resuming in
/// thread mode on the process stack.
pub const EXC_RETURN_TASK: usize = 0xFFFF_FFFD;

/// The simulated processor.
///
/// All fields are public so a test harness can plant register values before
/// a switch (simulating task progress) and inspect them after a resumption.
#[derive(Debug)]
pub struct SimCpu {
    /// Callee-saved register file, r4 through r11.
    pub regs: [usize; 8],
    pub r0: usize,
    pub r1: usize,
    pub r2: usize,
    pub r3: usize,
    pub r12: usize,
    pub lr: usize,
    pub pc: usize,
    pub xpsr: usize,
    /// Process (task) stack pointer.
    pub psp: usize,
    /// Main (handler) stack pointer.
    pub msp: usize,
    pub control: Control,
    /// True while a simulated exception is being serviced.
    pub in_handler: bool,
    /// Simulated PRIMASK: when set, neither the timer nor a pended switch is
    /// delivered.
    pub primask: bool,
    /// The pending-switch flag.
    pub switch_pending: bool,
    /// Set by the bootstrap; latches that the kernel is running.
    pub started: bool,
    pub timer_enabled: bool,
    pub tick_reload: u32,
}

impl SimCpu {
    const fn at_reset() -> Self {
        SimCpu {
            regs: [0; 8],
            r0: 0,
            r1: 0,
            r2: 0,
            r3: 0,
            r12: 0,
            lr: 0,
            pc: 0,
            xpsr: 0,
            psp: 0,
            msp: 0,
            control: Control::empty(),
            in_handler: false,
            primask: false,
            switch_pending: false,
            started: false,
            timer_enabled: false,
            tick_reload: 0,
        }
    }
}

/// What a simulated trap return made live: where execution would resume, and
/// with what argument and link slot. This is the simulator's stand-in for
/// "control transfers to the task".
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ResumedContext {
    /// Program counter popped from the hardware segment.
    pub pc: usize,
    /// First argument register (the `init_stack` argument, for a task that
    /// has never run).
    pub arg: usize,
    /// Link register (the exit function, for a task that has never run).
    pub link: usize,
    /// The stack pointer after the frame was consumed.
    pub sp: usize,
}

static CPU_IN_USE: AtomicBool = AtomicBool::new(false);
static mut CPU: SimCpu = SimCpu::at_reset();

/// Runs `body` with exclusive access to the simulated processor.
///
/// Detects recursive use and panics, the same way the dispatcher guards its
/// own state; a profiling hook or scheduler implementation must not call back
/// into the simulator.
pub fn with_cpu<R>(body: impl FnOnce(&mut SimCpu) -> R) -> R {
    if CPU_IN_USE.swap(true, Ordering::Acquire) {
        panic!(); // recursive use of the simulated machine
    }
    // Safety: the flag above ensures we are not producing an aliasing &mut.
    let cpu = unsafe { &mut *core::ptr::addr_of_mut!(CPU) };
    let r = body(cpu);
    CPU_IN_USE.store(false, Ordering::Release);
    r
}

/// Pushes `value` onto a descending stack at `*sp`.
fn push<T: IntoBytes + Immutable>(sp: &mut usize, value: &T) {
    *sp -= size_of::<T>();
    // Safety: `*sp` stays within a stack region covered by a StackDesc, whose
    // construction contract guarantees exclusive, writable memory.
    let dest = unsafe { core::slice::from_raw_parts_mut(*sp as *mut u8, size_of::<T>()) };
    value.write_to(dest).unwrap_or_else(|_| panic!());
}

/// Pops a `T` from a descending stack at `*sp`.
fn pop<T: FromBytes>(sp: &mut usize) -> T {
    // Safety: as in `push`.
    let src = unsafe { core::slice::from_raw_parts(*sp as *const u8, size_of::<T>()) };
    let value = T::read_from_bytes(src).unwrap_or_else(|_| panic!());
    *sp += size_of::<T>();
    value
}

/// Writes a task's initial frame at the top of its stack and returns the
/// stack pointer value that makes it live. Same contract as the `arm_m`
/// version; no Thumb bit here, since simulated addresses are compared
/// verbatim.
pub fn build_initial_frame(
    top: usize,
    entry: abi::TaskEntry,
    exit: abi::TaskExit,
    arg: usize,
) -> usize {
    uassert!(top % abi::STACK_ALIGN == 0);

    let mut sp = top;
    push(
        &mut sp,
        &HardwareFrame {
            r0: arg,
            pc: entry as usize,
            lr: exit as usize,
            xpsr: INITIAL_PSR,
            ..HardwareFrame::default()
        },
    );
    push(
        &mut sp,
        &SavedFrame {
            exc_return: EXC_RETURN_TASK,
            ..SavedFrame::default()
        },
    );
    sp
}

/// Raises the pending-switch condition. The switch itself happens when the
/// harness next calls [`service_pending_switch`], which is how the simulator
/// models "PendSV fires once nothing higher-priority is running".
pub fn pend_switch() {
    with_cpu(|cpu| cpu.switch_pending = true);
}

pub fn mask_interrupts() {
    with_cpu(|cpu| cpu.primask = true);
}

/// # Safety
///
/// Caller asserts that the kernel data structures are in a consistent state.
pub unsafe fn unmask_interrupts() {
    with_cpu(|cpu| cpu.primask = false);
}

pub fn in_interrupt_context() -> bool {
    with_cpu(|cpu| cpu.in_handler)
}

/// Simulated counterpart of the ARM bootstrap: installs the exception stack,
/// starts the timer, unstacks task 0's initial frame, drops privilege, and
/// "returns" into the task -- which on the simulator means returning the
/// resumption record to the driving harness.
pub fn bootstrap_first_task(
    sp: usize,
    exception_stack_top: usize,
    clock: crate::startup::ClockConfig,
) -> ResumedContext {
    let ctx = with_cpu(|cpu| {
        uassert!(!cpu.started);
        cpu.started = true;
        cpu.msp = exception_stack_top;
        cpu.tick_reload = clock.reload;
        cpu.timer_enabled = true;

        // The bootstrap trap: handler mode, pop the software segment, shed
        // privileges, exception return.
        cpu.in_handler = true;
        cpu.psp = sp;
        let sw: SavedFrame = pop(&mut cpu.psp);
        uassert!(sw.exc_return == EXC_RETURN_TASK);
        load_saved(cpu, &sw);
        cpu.control = Control::NPRIV | Control::SPSEL;
        cpu.primask = false;
        trap_return(cpu)
    });
    crate::profiling::event_bootstrap();
    ctx
}

/// Delivers one tick of the quantum timer, as the SysTick handler would.
pub fn timer_fire() {
    let deliverable = with_cpu(|cpu| {
        uassert!(cpu.timer_enabled);
        if cpu.primask {
            return false;
        }
        cpu.in_handler = true;
        true
    });
    if !deliverable {
        return;
    }
    crate::profiling::event_timer_isr_enter();
    if crate::time::system_tick() == crate::dispatch::NextTask::Other {
        with_cpu(|cpu| cpu.switch_pending = true);
    }
    crate::profiling::event_timer_isr_exit();
    with_cpu(|cpu| cpu.in_handler = false);
}

/// Services a pended switch, if any: the simulated PendSV.
///
/// Pushes the running task's hardware and software segments onto its stack,
/// runs the portable dispatch code, rebuilds the register file from the
/// incoming stack, and performs the trap return. Returns the resumption
/// record, or `None` if no switch was pending (or interrupts are masked).
pub fn service_pending_switch() -> Option<ResumedContext> {
    let outgoing_sp = with_cpu(|cpu| {
        if !cpu.switch_pending || cpu.primask {
            return None;
        }
        cpu.switch_pending = false;
        cpu.in_handler = true;

        // Exception entry stacks the hardware segment...
        push(
            &mut cpu.psp,
            &HardwareFrame {
                r0: cpu.r0,
                r1: cpu.r1,
                r2: cpu.r2,
                r3: cpu.r3,
                r12: cpu.r12,
                lr: cpu.lr,
                pc: cpu.pc,
                xpsr: cpu.xpsr,
            },
        );
        // ...and the handler stacks the software segment below it.
        push(
            &mut cpu.psp,
            &SavedFrame {
                r4: cpu.regs[0],
                r5: cpu.regs[1],
                r6: cpu.regs[2],
                r7: cpu.regs[3],
                r8: cpu.regs[4],
                r9: cpu.regs[5],
                r10: cpu.regs[6],
                r11: cpu.regs[7],
                exc_return: EXC_RETURN_TASK,
            },
        );
        Some(cpu.psp)
    })?;

    // The portable dispatch code runs outside the machine borrow, exactly as
    // the real handler calls out of the assembly into Rust.
    let incoming_sp = crate::dispatch::switch_stacks(outgoing_sp);

    Some(with_cpu(|cpu| {
        cpu.psp = incoming_sp;
        let sw: SavedFrame = pop(&mut cpu.psp);
        uassert!(sw.exc_return == EXC_RETURN_TASK);
        load_saved(cpu, &sw);
        trap_return(cpu)
    }))
}

/// Resets the machine and all kernel state to power-on, so a test scenario
/// can start from a clean boot.
pub fn power_on_reset() {
    with_cpu(|cpu| *cpu = SimCpu::at_reset());
    crate::time::reset_for_harness();
    crate::dispatch::reset_for_harness();
    crate::startup::reset_for_harness();
}

fn load_saved(cpu: &mut SimCpu, sw: &SavedFrame) {
    cpu.regs = [
        sw.r4, sw.r5, sw.r6, sw.r7, sw.r8, sw.r9, sw.r10, sw.r11,
    ];
}

fn trap_return(cpu: &mut SimCpu) -> ResumedContext {
    let hw: HardwareFrame = pop(&mut cpu.psp);
    cpu.r0 = hw.r0;
    cpu.r1 = hw.r1;
    cpu.r2 = hw.r2;
    cpu.r3 = hw.r3;
    cpu.r12 = hw.r12;
    cpu.lr = hw.lr;
    cpu.pc = hw.pc;
    cpu.xpsr = hw.xpsr;
    cpu.in_handler = false;
    ResumedContext {
        pc: hw.pc,
        arg: hw.r0,
        link: hw.lr,
        sp: cpu.psp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_through_memory() {
        let mut buf = [0u8; FRAME_SIZE];
        let top = buf.as_mut_ptr() as usize + FRAME_SIZE;
        let mut sp = top;

        let hw = HardwareFrame {
            r0: 0xAA,
            pc: 0x4000,
            lr: 0x5000,
            xpsr: INITIAL_PSR,
            ..HardwareFrame::default()
        };
        let sw = SavedFrame {
            r7: 7,
            exc_return: EXC_RETURN_TASK,
            ..SavedFrame::default()
        };
        push(&mut sp, &hw);
        push(&mut sp, &sw);
        assert_eq!(sp, top - FRAME_SIZE);

        let sw2: SavedFrame = pop(&mut sp);
        let hw2: HardwareFrame = pop(&mut sp);
        assert_eq!(sw2, sw);
        assert_eq!(hw2, hw);
        assert_eq!(sp, top);
    }
}
