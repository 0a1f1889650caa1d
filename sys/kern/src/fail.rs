// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel failures such that they can be found by
//! tooling.
//!
//! Every failure in this kernel is fatal by design: there is nothing below
//! the execution core that could attempt a recovery. What we *can* do is
//! leave a legible corpse. This module defines a small binary interface for
//! debuggers:
//!
//! - `KERNEL_HAS_FAILED` is a `bool`, zero until the kernel reaches [`die`]
//!   (explicitly or via `panic!`), one afterward. Any other value means
//!   memory corrupted on the way down.
//! - `KERNEL_EPITAPH` is a byte buffer into which the failure reason is
//!   written as UTF-8, truncated to fit, padded with NULs.
//!
//! Only compiled for bare-metal builds; host builds (the simulator) get
//! std's panic machinery, which is strictly better at explaining itself.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

#[cfg(target_os = "none")]
use core::{
    fmt::{Display, Write},
    sync::atomic::Ordering,
};

/// Flag that gets set by all failure paths, giving tools a one-stop shop for
/// triage.
#[cfg(target_os = "none")]
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

#[cfg(target_os = "none")]
const EPITAPH_LEN: usize = 128;

#[cfg(target_os = "none")]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Records `msg` as the kernel's last words and parks the core.
#[cfg(target_os = "none")]
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    // We'd love to use an AtomicBool for the failure flag, but we want the
    // flag readable as a plain bool from debuggers, so: raw pointer swap.
    //
    // Safety: this is the only site that touches the flag, and it runs with
    // further failure reporting cut off below.
    let second_failure = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if second_failure {
        // A panic inside the panic path. Writing the epitaph again would
        // only shred the evidence; just stop.
        park();
    }

    // Safety: the flag above ensures only one execution ever gets here, so
    // the mutable reference is unique.
    let buf = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) };
    let mut w = Epitaph { dest: buf };
    write!(w, "{msg}").ok();

    park()
}

#[cfg(target_os = "none")]
fn park() -> ! {
    loop {
        // Platform-independent NOP
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(target_os = "none")]
struct Epitaph {
    dest: &'static mut [u8],
}

#[cfg(target_os = "none")]
impl Write for Epitaph {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
