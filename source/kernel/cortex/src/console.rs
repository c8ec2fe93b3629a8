// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel console sink used by the logger and the panic path.
//!
//! On the bare-metal target bytes go out through the firmware console. Host
//! builds append to a bounded capture buffer so tests can inspect log output.

use core::fmt::{self, Write};
use spin::Mutex;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
extern crate alloc;
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
use alloc::{string::String, vec::Vec};

/// Capture buffer ceiling; the oldest half is dropped once exceeded.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
const CAPTURE_LIMIT: usize = 256 * 1024;

static CONSOLE: Mutex<KernelConsole> = Mutex::new(KernelConsole::new());

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
static CAPTURE: Mutex<Vec<u8>> = Mutex::new(Vec::new());

/// Console writer capable of formatted output.
pub struct KernelConsole {
    _private: (),
}

impl KernelConsole {
    const fn new() -> Self {
        Self { _private: () }
    }

    /// Returns a guard for the console singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelConsole> {
        CONSOLE.lock()
    }

    /// Writes raw bytes to the sink.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        emit_bytes(bytes);
    }
}

impl Write for KernelConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Lock-free writer for panic and fatal-trap paths where the console mutex
/// may already be held.
pub struct RawConsole;

impl Write for RawConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        emit_bytes(s.as_bytes());
        Ok(())
    }
}

pub fn raw_writer() -> RawConsole {
    RawConsole
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn emit_bytes(bytes: &[u8]) {
    for &byte in bytes {
        if byte == b'\n' {
            sbi_rt::legacy::console_putchar(b'\r' as usize);
        }
        sbi_rt::legacy::console_putchar(byte as usize);
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn emit_bytes(bytes: &[u8]) {
    let mut capture = CAPTURE.lock();
    capture.extend_from_slice(bytes);
    if capture.len() > CAPTURE_LIMIT {
        let excess = capture.len() - CAPTURE_LIMIT / 2;
        capture.drain(..excess);
    }
}

/// Returns a copy of everything captured so far (host builds only).
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn captured_text() -> String {
    String::from_utf8_lossy(&CAPTURE.lock()).into_owned()
}
