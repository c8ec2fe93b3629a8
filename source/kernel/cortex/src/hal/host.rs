// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Recording HAL used when the kernel core runs on a development host
//! OWNERS: @kernel-team
//! PUBLIC API: HostMachine, SwitchRecord, FORK_RETURN_ENTRY, USER_ENTRY, host_kernel_layout()
//! NOTE: No hardware access. Every firmware, TLB and switch request is recorded
//!       so tests can assert on it; a system reset panics.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use super::{ContextSwitch, Firmware, Platform, ResetKind, ResetReason, Tlb};
use crate::config::{PAGE_SIZE, VM_START};
use crate::mm::{KernelLayout, KernelSegment, PageFlags};
use crate::task::TaskContext;

/// Fake resume address for forked children.
pub const FORK_RETURN_ENTRY: usize = VM_START + 0x1000;
/// Fake resume address for the first entry into user mode.
pub const USER_ENTRY: usize = VM_START + 0x2000;

/// One recorded context switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchRecord {
    pub from_sp: usize,
    pub to_sp: usize,
    pub to_ra: usize,
    pub satp: usize,
}

/// Host double for [`Platform`].
#[derive(Debug, Default)]
pub struct HostMachine {
    console: Vec<u8>,
    ticks: usize,
    full_flushes: usize,
    page_flushes: Vec<usize>,
    switches: Vec<SwitchRecord>,
    satp: usize,
}

impl HostMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written through the firmware console.
    pub fn console(&self) -> &[u8] {
        &self.console
    }

    /// Timer reprogramming requests seen so far.
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    pub fn full_flushes(&self) -> usize {
        self.full_flushes
    }

    pub fn page_flushes(&self) -> &[usize] {
        &self.page_flushes
    }

    pub fn switches(&self) -> &[SwitchRecord] {
        &self.switches
    }

    /// SATP installed by the most recent switch.
    pub fn satp(&self) -> usize {
        self.satp
    }
}

impl Firmware for HostMachine {
    fn console_write(&mut self, bytes: &[u8]) {
        self.console.extend_from_slice(bytes);
    }

    fn set_next_tick(&mut self) {
        self.ticks += 1;
    }

    fn system_reset(&mut self, kind: ResetKind, reason: ResetReason) -> ! {
        panic!("system reset requested: {kind:?} ({reason:?})");
    }
}

impl Tlb for HostMachine {
    fn flush_all(&mut self) {
        self.full_flushes += 1;
    }

    fn flush_page(&mut self, va: usize) {
        self.page_flushes.push(va);
    }
}

impl ContextSwitch for HostMachine {
    fn switch(&mut self, prev: &mut TaskContext, next: &TaskContext, satp: usize) {
        self.switches.push(SwitchRecord {
            from_sp: prev.sp,
            to_sp: next.sp,
            to_ra: next.ra,
            satp,
        });
        self.satp = satp;
    }
}

impl Platform for HostMachine {
    fn fork_return_entry(&self) -> usize {
        FORK_RETURN_ENTRY
    }

    fn user_entry(&self) -> usize {
        USER_ENTRY
    }
}

/// Small kernel image layout: one text page and one data page.
pub fn host_kernel_layout() -> KernelLayout {
    KernelLayout::new(vec![
        KernelSegment {
            va: VM_START,
            len: PAGE_SIZE,
            flags: PageFlags::READ | PageFlags::EXECUTE,
        },
        KernelSegment {
            va: VM_START + PAGE_SIZE,
            len: PAGE_SIZE,
            flags: PageFlags::READ | PageFlags::WRITE,
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_firmware_and_tlb_requests() {
        let mut machine = HostMachine::new();
        machine.console_write(b"hi");
        machine.set_next_tick();
        machine.flush_page(0x4000);
        machine.flush_all();
        assert_eq!(machine.console(), b"hi");
        assert_eq!(machine.ticks(), 1);
        assert_eq!(machine.page_flushes(), &[0x4000]);
        assert_eq!(machine.full_flushes(), 1);
    }

    #[test]
    #[should_panic(expected = "system reset requested")]
    fn reset_panics() {
        HostMachine::new().system_reset(ResetKind::Shutdown, ResetReason::SystemFailure);
    }
}
