// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.
//!
//! The core never touches CSRs or firmware directly; it calls through these
//! traits so the same scheduling and fault paths run on QEMU `virt` and on
//! the host test doubles.

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub mod host;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod sbi;

use crate::task::TaskContext;

/// System reset types understood by the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetKind {
    Shutdown,
    ColdReboot,
    WarmReboot,
}

/// Reason reported alongside a reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetReason {
    NoReason,
    SystemFailure,
}

/// Firmware call interface.
pub trait Firmware {
    /// Writes raw bytes to the firmware console.
    fn console_write(&mut self, bytes: &[u8]);
    /// Programs the timer for the next scheduler tick.
    fn set_next_tick(&mut self);
    /// Resets or powers off the machine.
    fn system_reset(&mut self, kind: ResetKind, reason: ResetReason) -> !;
}

/// TLB management operations.
pub trait Tlb {
    /// Flushes the entire translation cache.
    fn flush_all(&mut self);
    /// Flushes translations for the page containing `va`.
    fn flush_page(&mut self, va: usize);
}

/// Architecture context-switch primitive.
pub trait ContextSwitch {
    /// Saves the running continuation into `prev`, installs `satp` and
    /// resumes `next`. On hardware this returns only once `prev` is
    /// selected again.
    fn switch(&mut self, prev: &mut TaskContext, next: &TaskContext, satp: usize);
}

/// Everything the kernel core needs from the machine it runs on.
pub trait Platform: Firmware + Tlb + ContextSwitch {
    /// Resume address of a freshly forked child.
    fn fork_return_entry(&self) -> usize;
    /// Resume address of a task entering user mode for the first time.
    fn user_entry(&self) -> usize;
}
