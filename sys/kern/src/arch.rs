// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, tailored for the current target. For this to work, each
//! architecture support module must define the same set of names:
//!
//! - `SavedFrame` / `HardwareFrame` -- the two segments of a task's stack
//!   frame, and `FRAME_SIZE`, their combined size.
//! - `build_initial_frame` -- lay down a frame that a trap return will enter.
//! - `pend_switch` -- raise the pending-switch condition.
//! - `mask_interrupts` / `unmask_interrupts`.
//! - `in_interrupt_context`.
//! - `bootstrap_first_task` -- the stack/privilege flip of thread-mode entry.
//!
//! When not building for a real target, the `sim` module provides a machine
//! whose register file and stack pointer are plain memory, so the switch
//! protocol can be exercised by ordinary host tests.

cfg_if::cfg_if! {
    if #[cfg(armv7m)] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(target_arch = "arm")] {
        compile_error!("unsupported M-profile for this port");
    } else {
        #[macro_use]
        pub mod sim;
        pub use sim::*;
    }
}
