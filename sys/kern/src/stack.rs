// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stack initialization: making a never-run task resumable.
//!
//! A task that has never executed gets a synthetic frame at the top of its
//! stack, laid out exactly as if the task had just been switched out. The
//! switch path can then resume it with the ordinary restore-and-trap-return
//! sequence and never needs a "first run" special case: control lands on the
//! entry function with its argument in the right register, and the link slot
//! points at the exit function so an entry that returns falls into it.

use abi::{StackDesc, TaskEntry, TaskExit, STACK_ALIGN};

/// Pattern written to the unused words of a freshly initialized stack, to
/// make peak stack usage visible in a debugger. This is a diagnostic aid
/// only; nothing checks it at runtime.
pub const STACK_FILL: u32 = 0xbadd_cafe;

/// Builds the initial frame for a task on `desc`'s stack and rewinds the
/// descriptor to "never run".
///
/// After this call, installing `desc.sp()` as the active stack and executing
/// a trap return transfers control to `entry` with `arg` as its argument. If
/// `entry` ever returns, control transfers to `exit`; `exit` is a backstop
/// and must not return, which its signature enforces.
///
/// The caller must ensure the backing memory is large enough for this frame
/// *plus the task's worst-case call depth*; only the frame itself is checked
/// here. There is no headroom or overflow detection in this kernel.
///
/// # Panics
///
/// If the stack cannot hold even the initial frame, or the descriptor's
/// reset pointer is misaligned. Both mean the descriptor is corrupt, which
/// is fatal by design.
pub fn init_stack(desc: &mut StackDesc, entry: TaskEntry, exit: TaskExit, arg: usize) {
    uassert!(desc.top() % STACK_ALIGN == 0);
    uassert!(desc.top() - desc.low() >= crate::arch::FRAME_SIZE);

    let sp = crate::arch::build_initial_frame(desc.top(), entry, exit, arg);
    desc.reset_to(sp);

    // Zap the words below the frame with a distinct (and storied) pattern.
    let mut addr = (desc.low() + 3) & !3;
    while addr + 4 <= sp {
        // Safety: the descriptor's construction contract gives it exclusive
        // ownership of low..top, and addr stays below the frame we just laid
        // down.
        unsafe {
            (addr as *mut u32).write(STACK_FILL);
        }
        addr += 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{self, HardwareFrame, SavedFrame, FRAME_SIZE};
    use abi::{Stack, TaskState};
    use core::mem::size_of;
    use zerocopy::FromBytes;

    extern "C" fn demo_entry(_arg: usize) {}

    extern "C" fn demo_exit() -> ! {
        unreachable!()
    }

    fn read_frames(desc: &StackDesc) -> (SavedFrame, HardwareFrame) {
        let sw_bytes = unsafe {
            core::slice::from_raw_parts(desc.sp() as *const u8, size_of::<SavedFrame>())
        };
        let hw_bytes = unsafe {
            core::slice::from_raw_parts(
                (desc.sp() + size_of::<SavedFrame>()) as *const u8,
                size_of::<HardwareFrame>(),
            )
        };
        (
            SavedFrame::read_from_bytes(sw_bytes).unwrap(),
            HardwareFrame::read_from_bytes(hw_bytes).unwrap(),
        )
    }

    #[test]
    fn minimal_stack_holds_exactly_one_frame() {
        // FRAME_SIZE is a multiple of STACK_ALIGN on the simulator, so a
        // buffer of exactly that size works.
        let desc = Box::leak(Box::new(Stack::<{ FRAME_SIZE }>::new()));
        let mut desc = desc.descriptor();
        init_stack(&mut desc, demo_entry, demo_exit, 7);
        assert_eq!(desc.sp(), desc.low());
        assert_eq!(desc.sp(), desc.top() - FRAME_SIZE);
    }

    #[test]
    fn frame_dispatches_to_entry_with_argument() {
        let desc = Box::leak(Box::new(Stack::<512>::new()));
        let mut desc = desc.descriptor();
        init_stack(&mut desc, demo_entry, demo_exit, 0xC0FFEE);

        assert_eq!(desc.state(), TaskState::NotStarted);
        let (sw, hw) = read_frames(&desc);
        assert_eq!(hw.pc, demo_entry as usize);
        assert_eq!(hw.r0, 0xC0FFEE);
        assert_eq!(hw.lr, demo_exit as usize);
        assert_eq!(hw.xpsr, arch::INITIAL_PSR);
        assert_eq!(sw.exc_return, arch::EXC_RETURN_TASK);
        assert_eq!(sw.r4, 0);
        assert_eq!(sw.r11, 0);
    }

    #[test]
    fn unused_words_carry_the_fill_pattern() {
        let desc = Box::leak(Box::new(Stack::<512>::new()));
        let mut desc = desc.descriptor();
        init_stack(&mut desc, demo_entry, demo_exit, 0);

        let mut addr = desc.low();
        while addr + 4 <= desc.sp() {
            let word = unsafe { (addr as *const u32).read() };
            assert_eq!(word, STACK_FILL, "at offset {}", addr - desc.low());
            addr += 4;
        }
    }

    #[test]
    fn reinitialization_resets_a_used_stack() {
        let desc = Box::leak(Box::new(Stack::<512>::new()));
        let mut desc = desc.descriptor();
        init_stack(&mut desc, demo_entry, demo_exit, 1);

        // Pretend the task ran and was suspended deep in its stack.
        let _ = desc.resume();
        desc.suspend_at(desc.top() - 256);

        init_stack(&mut desc, demo_entry, demo_exit, 2);
        assert_eq!(desc.state(), TaskState::NotStarted);
        assert_eq!(desc.sp(), desc.top() - FRAME_SIZE);
        let (_, hw) = read_frames(&desc);
        assert_eq!(hw.r0, 2);
    }

    #[test]
    fn any_size_at_or_above_the_frame_works() {
        // Carve descriptors of every size from one frame up to one frame
        // plus 32 words out of a single backing buffer.
        let buf = Box::leak(Box::new(Stack::<4096>::new()));
        let low = buf as *mut _ as usize;
        for extra in (0..=256).step_by(STACK_ALIGN) {
            let top = (low + FRAME_SIZE + extra) & !(STACK_ALIGN - 1);
            // Safety: the buffer is leaked and each descriptor is used and
            // dropped before the next is carved.
            let mut desc = unsafe { StackDesc::from_raw(low, top) };
            init_stack(&mut desc, demo_entry, demo_exit, extra);
            assert_eq!(desc.sp(), top - FRAME_SIZE);
            let (_, hw) = read_frames(&desc);
            assert_eq!(hw.pc, demo_entry as usize);
            assert_eq!(hw.r0, extra);
        }
    }

    #[test]
    #[should_panic]
    fn stack_smaller_than_a_frame_is_fatal() {
        let desc = Box::leak(Box::new(Stack::<16>::new()));
        let mut desc = desc.descriptor();
        init_stack(&mut desc, demo_entry, demo_exit, 0);
    }
}
