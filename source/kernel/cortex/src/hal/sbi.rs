// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementation for QEMU's `virt` machine running under SBI firmware.

use riscv::register::time;

use super::{ContextSwitch, Firmware, Platform, ResetKind, ResetReason, Tlb};
use crate::task::TaskContext;

// Context layout: ra, sp, s0..s11, sepc, sstatus, sscratch (17 dwords).
core::arch::global_asm!(
    r#"
    .section .text
    .globl __switch_to
__switch_to:
    sd ra, 0(a0)
    sd sp, 8(a0)
    sd s0, 16(a0)
    sd s1, 24(a0)
    sd s2, 32(a0)
    sd s3, 40(a0)
    sd s4, 48(a0)
    sd s5, 56(a0)
    sd s6, 64(a0)
    sd s7, 72(a0)
    sd s8, 80(a0)
    sd s9, 88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)
    csrr t0, sepc
    sd t0, 112(a0)
    csrr t0, sstatus
    sd t0, 120(a0)
    csrr t0, sscratch
    sd t0, 128(a0)

    ld ra, 0(a1)
    ld sp, 8(a1)
    ld s0, 16(a1)
    ld s1, 24(a1)
    ld s2, 32(a1)
    ld s3, 40(a1)
    ld s4, 48(a1)
    ld s5, 56(a1)
    ld s6, 64(a1)
    ld s7, 72(a1)
    ld s8, 80(a1)
    ld s9, 88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)
    ld t0, 112(a1)
    csrw sepc, t0
    ld t0, 120(a1)
    csrw sstatus, t0
    ld t0, 128(a1)
    csrw sscratch, t0

    csrw satp, a2
    sfence.vma zero, zero
    ret
"#
);

extern "C" {
    fn __switch_to(prev: *mut TaskContext, next: *const TaskContext, satp: usize);
    /// Provided by the trap exit sequence: restores the child's trap frame.
    fn __ret_from_fork();
    /// Provided by the trap exit sequence: first `sret` into user mode.
    fn __user_entry();
}

/// SBI-backed platform for the `virt` machine.
pub struct SbiPlatform {
    tick_cycles: u64,
}

impl SbiPlatform {
    pub const fn new(tick_cycles: u64) -> Self {
        Self { tick_cycles }
    }
}

impl Firmware for SbiPlatform {
    fn console_write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            #[allow(deprecated)]
            sbi_rt::legacy::console_putchar(byte as usize);
        }
    }

    fn set_next_tick(&mut self) {
        let now = time::read() as u64;
        let _ = sbi_rt::set_timer(now.wrapping_add(self.tick_cycles));
    }

    fn system_reset(&mut self, kind: ResetKind, reason: ResetReason) -> ! {
        let _ = match (kind, reason) {
            (ResetKind::Shutdown, ResetReason::NoReason) => {
                sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::NoReason)
            }
            (ResetKind::Shutdown, ResetReason::SystemFailure) => {
                sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::SystemFailure)
            }
            (ResetKind::ColdReboot, ResetReason::NoReason) => {
                sbi_rt::system_reset(sbi_rt::ColdReboot, sbi_rt::NoReason)
            }
            (ResetKind::ColdReboot, ResetReason::SystemFailure) => {
                sbi_rt::system_reset(sbi_rt::ColdReboot, sbi_rt::SystemFailure)
            }
            (ResetKind::WarmReboot, ResetReason::NoReason) => {
                sbi_rt::system_reset(sbi_rt::WarmReboot, sbi_rt::NoReason)
            }
            (ResetKind::WarmReboot, ResetReason::SystemFailure) => {
                sbi_rt::system_reset(sbi_rt::WarmReboot, sbi_rt::SystemFailure)
            }
        };
        loop {
            // SAFETY: parks the hart if firmware ignored the reset.
            #[allow(unused_unsafe)]
            unsafe {
                riscv::asm::wfi()
            };
        }
    }
}

impl Tlb for SbiPlatform {
    fn flush_all(&mut self) {
        // SAFETY: sfence.vma only drops cached translations.
        unsafe { riscv::asm::sfence_vma_all() }
    }

    fn flush_page(&mut self, va: usize) {
        // SAFETY: as above, limited to one page on every ASID.
        unsafe { riscv::asm::sfence_vma(0, va) }
    }
}

impl ContextSwitch for SbiPlatform {
    fn switch(&mut self, prev: &mut TaskContext, next: &TaskContext, satp: usize) {
        // SAFETY: both contexts live in the task table for the whole switch
        // and `satp` names a table that maps the kernel.
        unsafe { __switch_to(prev, next, satp) }
    }
}

impl Platform for SbiPlatform {
    fn fork_return_entry(&self) -> usize {
        __ret_from_fork as usize
    }

    fn user_entry(&self) -> usize {
        __user_entry as usize
    }
}
