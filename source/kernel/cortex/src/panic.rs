// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler emitting the fatal diagnostic and resetting the machine
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: trap::last_trap(), console::raw_writer(), sbi-rt system reset
//! INVARIANTS: No allocations; the reset reports SystemFailure

use core::{fmt::Write, panic::PanicInfo};

use crate::{console, trap};

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut w = console::raw_writer();
    let _ = w.write_str("\nPANIC: ");
    if let Some(location) = info.location() {
        let _ = write!(w, "{}:{}: ", location.file(), location.line());
    }
    let _ = writeln!(w, "{}", info.message());

    if let Some(frame) = trap::last_trap() {
        let _ = w.write_str("PANIC: last trap:\n");
        let _ = trap::fmt_trap(&frame, &mut w);
    }

    let _ = sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::SystemFailure);
    loop {
        #[allow(unused_unsafe)]
        unsafe {
            riscv::asm::wfi()
        };
    }
}
