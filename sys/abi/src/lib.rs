// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stride execution-core ABI definitions, shared between the kernel and the
//! rest of the firmware.
//!
//! This crate holds the types that cross the boundary between the execution
//! core and the code that feeds it work: stack descriptors, stack backing
//! storage, and the task entry/exit calling convention. It deliberately has no
//! dependencies so that firmware components can use these types without
//! dragging in the kernel.

#![cfg_attr(not(test), no_std)]

/// Alignment required of every stack's reset pointer, in bytes.
///
/// The AAPCS requires an 8-byte-aligned stack pointer at every public
/// interface, and the exception entry sequence relies on it. We impose the
/// same requirement on the host simulator so that the two environments agree
/// about frame layout.
pub const STACK_ALIGN: usize = 8;

/// Signature of a task's entry function.
///
/// The single argument is the word passed to `init_stack` when the task's
/// stack was prepared. Entry functions are allowed to return; doing so
/// transfers control to the task's exit function.
pub type TaskEntry = extern "C" fn(usize);

/// Signature of a task's exit function.
///
/// The exit function is entered if (and only if) the entry function returns.
/// It must not return -- there is nothing on the stack to return to, and the
/// type makes that structural.
pub type TaskExit = extern "C" fn() -> !;

/// Lifecycle state of the task owning a stack.
///
/// The context switch is a transition function over this enum:
///
/// ```text
///   NotStarted --resume--> Running --suspend--> Suspended --resume--> Running
///                             |
///                         terminate
///                             v
///                         Terminated
/// ```
///
/// `NotStarted` and `Suspended` resume through exactly the same mechanism --
/// a freshly initialized stack carries the same frame shape that a suspension
/// leaves behind -- so the switch code never needs to distinguish the two.
/// A `Terminated` stack is never resumed; the descriptor is handed back to the
/// scheduler for reclamation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Stack holds an initial frame built by `init_stack`; the task has never
    /// been dispatched.
    NotStarted,
    /// The task's register state is live in the (real or simulated) hardware.
    Running,
    /// The task's register state is saved on its stack and it can be resumed.
    Suspended,
    /// The task was retired; its stack no longer holds a resumable frame.
    Terminated,
}

/// Describes one task's stack region and its live stack pointer.
///
/// A `StackDesc` is created and owned by whatever allocated the stack memory
/// (typically the scheduler); the execution core only reads it and moves the
/// live pointer during `init_stack` and context switches. The core never
/// allocates or frees backing memory.
///
/// # Invariants
///
/// `low() <= sp() <= top()` at all times, and `top()` is `STACK_ALIGN`ed.
/// Stacks are full-descending: the pointer moves toward `low()` as data is
/// pushed.
#[derive(Debug)]
pub struct StackDesc {
    /// Address of the lowest usable byte. Constant after creation.
    low: usize,
    /// One past the highest usable position; the value the stack pointer
    /// takes when the task has never run. Constant after creation.
    top: usize,
    /// The live stack pointer.
    sp: usize,
    /// Lifecycle state of the owning task.
    state: TaskState,
}

impl StackDesc {
    /// Creates a descriptor over the memory range `low..top`.
    ///
    /// # Safety
    ///
    /// `low..top` must be a valid, writable memory region for the `'static`
    /// lifetime of the descriptor, and nothing else may read or write it
    /// while the descriptor exists. Firmware that carves stacks out of
    /// linker-defined regions uses this directly; everything else should go
    /// through [`Stack::descriptor`].
    pub unsafe fn from_raw(low: usize, top: usize) -> Self {
        assert!(low <= top);
        assert_eq!(top % STACK_ALIGN, 0);
        StackDesc {
            low,
            top,
            sp: top,
            state: TaskState::NotStarted,
        }
    }

    /// Address of the lowest usable byte of the stack.
    pub fn low(&self) -> usize {
        self.low
    }

    /// The reset pointer: one past the highest usable stack position.
    pub fn top(&self) -> usize {
        self.top
    }

    /// The live stack pointer.
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// The owning task's lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Rewinds the descriptor to "never run": live pointer at `sp`, state
    /// `NotStarted`. Called by the kernel's stack initializer after it has
    /// laid down an initial frame ending at `sp`.
    pub fn reset_to(&mut self, sp: usize) {
        assert!(self.low <= sp && sp <= self.top);
        self.sp = sp;
        self.state = TaskState::NotStarted;
    }

    /// Records that the owning task was switched out with its register state
    /// saved at `sp`.
    ///
    /// # Panics
    ///
    /// If `sp` is outside the stack's bounds, or the task was not `Running` --
    /// either indicates switch-protocol corruption, which is fatal by design.
    pub fn suspend_at(&mut self, sp: usize) {
        assert!(self.low <= sp && sp <= self.top);
        assert_eq!(self.state, TaskState::Running);
        self.sp = sp;
        self.state = TaskState::Suspended;
    }

    /// Marks the owning task as live in the hardware and yields the stack
    /// pointer to install, consuming the saved frame.
    ///
    /// # Panics
    ///
    /// If the task is not in a resumable state (`NotStarted` or `Suspended`).
    pub fn resume(&mut self) -> usize {
        assert!(matches!(
            self.state,
            TaskState::NotStarted | TaskState::Suspended
        ));
        self.state = TaskState::Running;
        self.sp
    }

    /// Retires the owning task. The stack is no longer treated as holding a
    /// resumable frame; only `init_stack` can bring it back.
    pub fn retire(&mut self, sp: usize) {
        assert!(self.low <= sp && sp <= self.top);
        assert_eq!(self.state, TaskState::Running);
        self.sp = sp;
        self.state = TaskState::Terminated;
    }
}

/// Statically-allocatable stack backing storage.
///
/// ```ignore
/// static STACK: Stack<1024> = Stack::new();
/// ```
///
/// The alignment attribute keeps the top of the buffer legal as a reset
/// pointer no matter where the linker places it.
#[repr(C, align(8))]
pub struct Stack<const N: usize>([u8; N]);

impl<const N: usize> Stack<N> {
    pub const fn new() -> Self {
        Stack([0; N])
    }

    /// Produces the descriptor for this backing buffer.
    ///
    /// Takes `&'static mut` so that exactly one descriptor can ever be made
    /// per buffer, which is what makes `StackDesc::from_raw`'s exclusivity
    /// requirement hold.
    pub fn descriptor(&'static mut self) -> StackDesc {
        let low = self.0.as_mut_ptr() as usize;
        // Round the top down so it meets the alignment invariant even for
        // buffer lengths that aren't multiples of STACK_ALIGN.
        let top = (low + N) & !(STACK_ALIGN - 1);
        // Safety: we hold the only &mut to this buffer, it's 'static, and we
        // never touch self.0 again -- the descriptor becomes the sole owner.
        unsafe { StackDesc::from_raw(low, top) }
    }
}

impl<const N: usize> Default for Stack<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_desc<const N: usize>() -> StackDesc {
        Box::leak(Box::new(Stack::<N>::new())).descriptor()
    }

    #[test]
    fn descriptor_is_aligned_and_ordered() {
        let desc = leaked_desc::<256>();
        assert_eq!(desc.top() % STACK_ALIGN, 0);
        assert!(desc.low() <= desc.top());
        assert_eq!(desc.sp(), desc.top());
        assert_eq!(desc.state(), TaskState::NotStarted);
    }

    #[test]
    fn odd_sized_buffer_rounds_top_down() {
        let desc = leaked_desc::<261>();
        assert_eq!(desc.top() % STACK_ALIGN, 0);
        assert!(desc.top() - desc.low() <= 261);
    }

    #[test]
    fn lifecycle_transitions() {
        let mut desc = leaked_desc::<256>();
        let sp = desc.resume();
        assert_eq!(sp, desc.top());
        assert_eq!(desc.state(), TaskState::Running);

        desc.suspend_at(sp - 64);
        assert_eq!(desc.state(), TaskState::Suspended);
        assert_eq!(desc.sp(), sp - 64);

        assert_eq!(desc.resume(), sp - 64);
        desc.retire(sp - 64);
        assert_eq!(desc.state(), TaskState::Terminated);
    }

    #[test]
    #[should_panic]
    fn terminated_stack_cannot_resume() {
        let mut desc = leaked_desc::<256>();
        desc.resume();
        desc.retire(desc.top());
        desc.resume();
    }

    #[test]
    #[should_panic]
    fn suspend_outside_bounds_is_fatal() {
        let mut desc = leaked_desc::<256>();
        desc.resume();
        desc.suspend_at(desc.low() - 8);
    }
}
