// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared harness: boots a host kernel and plays the MMU for user accesses.

#![allow(dead_code)]

use std::sync::Arc;

use cortex::config::{KernelConfig, PAGE_SIZE, PHY_START};
use cortex::fs::MountTable;
use cortex::hal::host::{host_kernel_layout, HostMachine};
use cortex::mm::{FramePool, ImageSource, PageFlags, PhysFrame, Pte};
use cortex::trap::TrapFrame;
use cortex::types::Pid;
use cortex::Kernel;

pub const TIMER: usize = (1 << 63) | 5;
pub const ECALL: usize = 8;
pub const LOAD_FAULT: usize = 13;
pub const STORE_FAULT: usize = 15;

pub fn boot(user_tasks: usize, image: Vec<u8>, mounts: MountTable) -> Kernel<HostMachine> {
    let image: Arc<dyn ImageSource> = Arc::new(image);
    Kernel::init(
        KernelConfig { user_tasks, seed: 11, tick_cycles: 10 },
        FramePool::new(PHY_START + 0x20_0000, 512),
        &host_kernel_layout(),
        image,
        mounts,
        HostMachine::new(),
    )
    .expect("init")
}

/// Leaf entry for `addr` in `pid`'s table.
pub fn pte(kernel: &Kernel<HostMachine>, pid: usize, addr: usize) -> Option<Pte> {
    let space = kernel.scheduler().tasks().get(pid)?.space()?;
    space.page_table().entry(kernel.frames(), addr & !(PAGE_SIZE - 1))
}

/// Delivers timer ticks until `pid` runs.
pub fn run_until(kernel: &mut Kernel<HostMachine>, live: &mut TrapFrame, pid: u32) {
    for _ in 0..256 {
        if kernel.current_pid() == Pid::from_raw(pid) {
            return;
        }
        live.scause = TIMER;
        kernel.handle_trap(live);
    }
    panic!("pid {pid} never scheduled");
}

/// Accesses `addr` as the current task would, raising a page fault first
/// when the entry does not allow it.
fn touch(kernel: &mut Kernel<HostMachine>, live: &mut TrapFrame, addr: usize, needed: PageFlags, cause: usize) -> PhysFrame {
    let pid = kernel.current_pid().as_index();
    for _ in 0..2 {
        if let Some(entry) = pte(kernel, pid, addr) {
            if entry.flags().contains(needed | PageFlags::USER) {
                return entry.frame();
            }
        }
        live.scause = cause;
        live.stval = addr;
        kernel.handle_trap(live);
    }
    panic!("access to 0x{addr:x} still faults");
}

pub fn user_store(kernel: &mut Kernel<HostMachine>, live: &mut TrapFrame, addr: usize, data: &[u8]) {
    let frame = touch(kernel, live, addr, PageFlags::WRITE, STORE_FAULT);
    let offset = addr % PAGE_SIZE;
    let bytes = kernel.frames_mut().bytes_mut(frame).expect("frame");
    bytes[offset..offset + data.len()].copy_from_slice(data);
}

pub fn user_load(kernel: &mut Kernel<HostMachine>, live: &mut TrapFrame, addr: usize, len: usize) -> Vec<u8> {
    let frame = touch(kernel, live, addr, PageFlags::READ, LOAD_FAULT);
    let offset = addr % PAGE_SIZE;
    kernel.frames().bytes(frame).expect("frame")[offset..offset + len].to_vec()
}
