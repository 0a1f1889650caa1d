// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exposes the target's M-profile (and FPU presence) as `cfg`s, because Cargo
//! only lets us condition on `target_arch = "arm"`, which doesn't distinguish
//! the profiles we care about.

use std::env;

fn main() {
    println!("cargo:rustc-check-cfg=cfg(armv7m)");
    println!("cargo:rustc-check-cfg=cfg(armfpu)");

    let target = env::var("TARGET").unwrap();

    if target.starts_with("thumbv7m") || target.starts_with("thumbv7em") {
        println!("cargo:rustc-cfg=armv7m");
    }
    if target.ends_with("eabihf") {
        println!("cargo:rustc-cfg=armfpu");
    }
}
