// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M (Cortex-M3/M4/M4F, the profile our
//! controller boards use).
//!
//! # ARM-M timer
//!
//! We use the system tick timer as the quantum timer. Its counter is small
//! and only counts down, so it's good for exactly one thing: periodic
//! interrupts. At each SysTick interrupt we advance the kernel clock by one
//! sub-tick; the clock module turns sub-ticks into milliseconds and quantum
//! accounting. The upside of paying for these regular interrupts is that we
//! need no SoC-specific timer support at all.
//!
//! # Notes on ARM-M interrupts
//!
//! Three exception vectors belong to this core:
//!
//! - `SVCall` is used exactly once, as the trap that carries the processor
//!   from privileged single-stack startup into the first task.
//! - `SysTick` maintains the clock and quantum.
//! - `PendSV` performs deferred context switches.
//!
//! The split between SysTick and PendSV is the standard Cortex-M latency
//! trick: a tick that exhausts a quantum doesn't switch on the spot (the
//! tick's entry sequence hasn't saved enough state for that). Instead it
//! pokes the PendSV pending bit -- the pending-switch flag lives *in the
//! hardware* on this architecture -- and PendSV runs once every
//! higher-priority interrupt in progress has finished. All three vectors are
//! programmed to the lowest exception priority, so kernel code never nests
//! with itself, and device interrupts are never delayed by a switch.
//!
//! On exception entry the hardware stacks r0-r3, r12, lr, pc and xPSR onto
//! the task's stack. PendSV pushes the remaining registers (r4-r11, the
//! exception-return word, and the high FPU registers when the task used the
//! FPU) directly below that, so a suspended task's entire register image
//! lives contiguously on its own stack and the stack pointer alone is the
//! task's saved state.

use core::arch::{self, global_asm};
use core::mem::size_of;
use core::sync::atomic::{AtomicU32, Ordering};

use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, KnownLayout};

macro_rules! uassert {
    ($cond : expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// The software-defined segment of a task's stack frame: registers the
/// hardware does not stack for us, written and read only by the switch code.
///
/// `exc_return` rides along so the restore path knows which frame format the
/// hardware will unstack (basic or FPU-extended).
#[derive(Debug, FromBytes, Immutable, KnownLayout, Default)]
#[repr(C)]
pub struct SavedFrame {
    // NOTE: field order must match the PendSV store/load multiple below.
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    exc_return: u32,
}

/// The hardware-defined segment: what exception entry stacks and exception
/// return consumes, in the order the hardware dictates.
#[derive(Debug, FromBytes, Immutable, KnownLayout, Default)]
#[repr(C)]
pub struct HardwareFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

// The switch assembly and the frame builder must agree on these layouts; a
// mismatch is immediately fatal on the next switch, so pin them down.
const_assert_eq!(size_of::<SavedFrame>(), 9 * 4);
const_assert_eq!(size_of::<HardwareFrame>(), 8 * 4);

/// Total size of the initial frame `build_initial_frame` lays down.
pub const FRAME_SIZE: usize = size_of::<SavedFrame>() + size_of::<HardwareFrame>();

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// EXC_RETURN value describing a task that has never run: return to thread
/// mode, resume on the process stack, basic (no-FPU) frame.
const EXC_RETURN_TASK: u32 = 0xFFFF_FFFD;

/// Address the handler-mode stack pointer is moved to during bootstrap.
/// `no_mangle` so the value can be recovered from a debugger.
#[no_mangle]
static EXCEPTION_STACK_TOP: AtomicU32 = AtomicU32::new(0);

/// SysTick reload value in machine clocks per sub-tick. Stored before the
/// bootstrap trap (which programs the timer) and kept around so debuggers can
/// determine the tick rate.
#[no_mangle]
static TICK_RELOAD: AtomicU32 = AtomicU32::new(0);

/// Writes a task's initial frame at the top of its stack and returns the
/// stack pointer value that makes it live.
///
/// The caller is responsible for bounds and alignment checks; this routine
/// only does the layout.
pub fn build_initial_frame(
    top: usize,
    entry: abi::TaskEntry,
    exit: abi::TaskExit,
    arg: usize,
) -> usize {
    uassert!(top & 0x7 == 0);

    let hw = (top - size_of::<HardwareFrame>()) as *mut HardwareFrame;
    // Safety: init_stack has verified that `top - FRAME_SIZE` is in bounds
    // for memory exclusively owned by the descriptor.
    unsafe {
        hw.write(HardwareFrame {
            r0: arg as u32,
            pc: entry as usize as u32 | 1, // for thumb
            lr: exit as usize as u32 | 1,  // entry returning lands in exit
            xpsr: INITIAL_PSR,
            ..HardwareFrame::default()
        });
    }

    let sw = (top - FRAME_SIZE) as *mut SavedFrame;
    // Safety: as above.
    unsafe {
        sw.write(SavedFrame {
            exc_return: EXC_RETURN_TASK,
            ..SavedFrame::default()
        });
    }
    sw as usize
}

/// Raises the pending-switch condition.
///
/// This sets the bit that pends a PendSV exception. PendSV will fire once the
/// current handler (if any) and all higher-priority handlers have returned,
/// and perform the context switch. Safe from any context.
pub fn pend_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

pub fn mask_interrupts() {
    cortex_m::interrupt::disable();
}

/// # Safety
///
/// Caller asserts that the kernel data structures are in a consistent state,
/// i.e. this is not being used to unmask partway through a switch sequence.
pub unsafe fn unmask_interrupts() {
    unsafe {
        cortex_m::interrupt::enable();
    }
}

/// Checks whether we're executing in handler (interrupt/trap) context.
pub fn in_interrupt_context() -> bool {
    // The identity of the active exception sits in the bottom 9 bits of IPSR;
    // zero means thread mode.
    //
    // Safety: we're just reading the PSR.
    let ipsr: u32;
    unsafe {
        arch::asm!(
            "mrs {}, IPSR",
            out(reg) ipsr,
            options(pure, nomem, preserves_flags, nostack),
        );
    }
    ipsr & 0x1FF != 0
}

/// Performs the final, indivisible stage of thread-mode entry: flips the
/// processor from privileged single-stack startup onto task 0's stack in
/// unprivileged thread mode. Never returns.
///
/// `startup::prepare` has already latched against reentry and published the
/// dispatcher; all that remains is architecture work.
pub fn bootstrap_first_task(
    sp: usize,
    exception_stack_top: usize,
    clock: crate::startup::ClockConfig,
) -> ! {
    // Push the kernel's exception vectors down to the lowest priority. Kernel
    // entries therefore never preempt one another -- this is what makes the
    // switch protocol single-threaded without a lock -- while device
    // interrupts keep their configured priorities and always complete before
    // a switch is finalized.
    //
    // Safety: we're purely lowering priorities from their defaults, so this
    // can't cause any surprise preemption; the operations are `unsafe` in the
    // `cortex_m` crate only because they're raw register pokes.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // SVCall.
        scb.shpr[7].write(0xFF);
        // PendSV and SysTick.
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);
    }

    EXCEPTION_STACK_TOP.store(exception_stack_top as u32, Ordering::Relaxed);
    TICK_RELOAD.store(clock.reload, Ordering::Relaxed);

    // Safety: setting the process stack pointer has no effect while we're
    // still running on the main stack.
    unsafe {
        cortex_m::register::psp::write(sp as u32);
    }

    // Trap into handler mode. The SVCall handler recognizes a call from
    // thread mode on the main stack as this bootstrap (the only place that
    // can produce one), starts the quantum timer, retargets MSP at the
    // dedicated exception stack, unstacks task 0's software segment, sheds
    // privileges, and exception-returns into task 0's entry function.
    //
    // Interrupts must be enabled when we hit the SVC instruction -- an SVC
    // taken while masked escalates to HardFault -- and that's fine, because
    // the quantum timer isn't running yet and nothing else pends PendSV
    // before the system is up.
    unsafe {
        arch::asm!(
            "
            cpsie i
            svc #0xFF
            @ noreturn generates a UDF here in case that should return.
            ",
            options(noreturn),
        )
    }
}

// Handler that gets linked into the vector table for the Supervisor Call
// (SVC) instruction. (Name is dictated by the `cortex_m` crate.)
//
// This core defines no syscalls, so the only legitimate SVC is the one-shot
// bootstrap trap, recognizable because it is the only SVC that can ever
// arrive from thread mode on the main stack. Anything else is a programming
// error and is routed to a fatal stop.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Inspect LR to figure out the caller's mode.
        mov r0, lr
        mov r1, #0xFFFFFFF3
        bic r0, r1
        @ Is the call coming from thread mode + main stack, i.e.
        @ from the kernel startup routine?
        cmp r0, #0x8
        beq 1f
        b unexpected_svc

    1:  @ Starting up the first task. Let the Rust side kick off the quantum
        @ timer while we're still non-preemptable; it hands back the address
        @ of the dedicated exception stack.
        bl bootstrap_entry
        @ All future exceptions run on the dedicated stack; the boot stack is
        @ abandoned from this instruction on.
        msr MSP, r0
        @ Unstack the software segment of task 0's initial frame.
        mrs r0, PSP
        ldm r0!, {{r4-r11, lr}}
        msr PSP, r0
        @ Shed privileges in thread mode.
        movs r0, #1
        msr CONTROL, r0
        @ note: no barrier here because exc return serves as barrier
        bx lr
    ",
}

/// The Rust side of the bootstrap trap. Runs in handler mode, where SysTick
/// and PendSV cannot preempt us, so starting the timer here guarantees the
/// first tick is taken against a fully-configured task stack.
#[no_mangle]
unsafe extern "C" fn bootstrap_entry() -> u32 {
    // Safety: register pokes on the SYST block; this is the only place that
    // configures it.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(TICK_RELOAD.load(Ordering::Relaxed) - 1);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt.
        syst.csr.modify(|v| v | 0b111);
    }
    crate::profiling::event_bootstrap();
    EXCEPTION_STACK_TOP.load(Ordering::Relaxed)
}

#[no_mangle]
extern "C" fn unexpected_svc() -> ! {
    panic!("SVC outside bootstrap");
}

// Handler that gets linked into the vector table for the System Tick Timer
// overflow interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::profiling::event_timer_isr_enter();
    if crate::time::system_tick() == crate::dispatch::NextTask::Other {
        // The quantum ran out. The entry sequence to this ISR hasn't saved
        // enough state to switch here, so defer to PendSV.
        pend_switch();
    }
    crate::profiling::event_timer_isr_exit();
}

// Handler that gets linked into the vector table for PendSV: the context
// switch itself.
//
// On entry the hardware has stacked the caller-saved registers onto the
// outgoing task's stack. We push the software segment below them, hand the
// resulting stack pointer to the portable dispatch code, and rebuild the
// incoming task's registers from whatever stack pointer it hands back.
// Exception return then unstacks the incoming task's hardware segment and it
// resumes exactly where it left off -- or at its entry function, if the frame
// was built by `init_stack` and the task has never run.
cfg_if::cfg_if! {
    if #[cfg(armfpu)] {
        global_asm! {"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                mrs r0, PSP
                @ Did the outgoing task use the FPU? (bit 4 of LR clear)
                tst lr, #0x10
                it eq
                vstmdbeq r0!, {{s16-s31}}
                @ Store the software segment: callee-saved set plus LR, which
                @ holds the exception-return word describing the frame format.
                stmdb r0!, {{r4-r11, lr}}
                @ r0 is the outgoing stack pointer; the portable side returns
                @ the incoming one in r0.
                bl switch_entry
                ldm r0!, {{r4-r11, lr}}
                @ Same test for the incoming task's frame format.
                tst lr, #0x10
                it eq
                vldmiaeq r0!, {{s16-s31}}
                msr PSP, r0
                bx lr
            ",
        }
    } else {
        global_asm! {"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                mrs r0, PSP
                @ Store the software segment: callee-saved set plus LR, which
                @ holds the exception-return word.
                stmdb r0!, {{r4-r11, lr}}
                @ r0 is the outgoing stack pointer; the portable side returns
                @ the incoming one in r0.
                bl switch_entry
                ldm r0!, {{r4-r11, lr}}
                msr PSP, r0
                bx lr
            ",
        }
    }
}

/// The Rust side of the PendSV handler, after the outgoing task's registers
/// have been deposited on its stack.
#[no_mangle]
unsafe extern "C" fn switch_entry(outgoing_sp: u32) -> u32 {
    crate::dispatch::switch_stacks(outgoing_sp as usize) as u32
}
