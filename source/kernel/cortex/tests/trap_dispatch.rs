// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end trap dispatch: syscalls, demand paging and fatal faults.

mod common;

use std::sync::Arc;

use common::{boot, pte, user_load, user_store, ECALL, TIMER};
use cortex::config::{PAGE_SIZE, USER_START};
use cortex::fs::{MemFs, MountTable, O_RDONLY};
use cortex::syscall::{errno, EBADF, SYSCALL_GETPID, SYSCALL_OPENAT, SYSCALL_READ, SYSCALL_WRITE};
use cortex::trap::{TrapFrame, REG_A0, REG_A7};

const PATH: usize = 0x100;
const MSG: usize = 0x200;
const TAIL: usize = PAGE_SIZE + 0x10;

fn image() -> Vec<u8> {
    let mut image = vec![0u8; PAGE_SIZE + 0x20];
    image[PATH..PATH + 13].copy_from_slice(b"/fat32/email\0");
    image[MSG..MSG + 3].copy_from_slice(b"hi\n");
    for (i, byte) in image[PAGE_SIZE..].iter_mut().enumerate() {
        *byte = 0xA0 + i as u8;
    }
    image
}

fn started() -> (cortex::Kernel<cortex::hal::host::HostMachine>, TrapFrame) {
    let mut mounts = MountTable::new();
    mounts.mount("/fat32", Arc::new(MemFs::new().with_file("EMAIL", b"subject: hi")));
    let mut kernel = boot(1, image(), mounts);
    let mut live = TrapFrame { scause: TIMER, ..TrapFrame::default() };
    kernel.handle_trap(&mut live);
    (kernel, live)
}

fn syscall(kernel: &mut cortex::Kernel<cortex::hal::host::HostMachine>, live: &mut TrapFrame, number: usize, args: [usize; 3]) -> usize {
    live.scause = ECALL;
    live.x[REG_A7] = number;
    live.x[10..13].copy_from_slice(&args);
    let pc = live.sepc;
    kernel.handle_trap(live);
    assert_eq!(live.sepc, pc + 4);
    live.x[REG_A0]
}

#[test]
fn write_reaches_firmware_console() {
    let (mut kernel, mut live) = started();
    assert_eq!(syscall(&mut kernel, &mut live, SYSCALL_GETPID, [0; 3]), 1);
    assert_eq!(syscall(&mut kernel, &mut live, SYSCALL_WRITE, [1, MSG, 3]), 3);
    assert_eq!(kernel.platform().console(), b"hi\n");
}

#[test]
fn file_read_lands_in_user_memory() {
    let (mut kernel, mut live) = started();
    let fd = syscall(&mut kernel, &mut live, SYSCALL_OPENAT, [0, PATH, O_RDONLY]);
    assert_eq!(fd, 3);
    let buf = cortex::config::USER_END - 64;
    assert_eq!(syscall(&mut kernel, &mut live, SYSCALL_READ, [fd, buf, 64]), 11);
    assert_eq!(user_load(&mut kernel, &mut live, buf, 11), b"subject: hi");
    assert_eq!(syscall(&mut kernel, &mut live, SYSCALL_READ, [7, buf, 1]), errno(EBADF));
}

#[test]
fn image_tail_is_filled_then_zeroed() {
    let (mut kernel, mut live) = started();
    assert!(pte(&kernel, 1, TAIL).is_none());
    let page = user_load(&mut kernel, &mut live, PAGE_SIZE, PAGE_SIZE);
    assert_eq!(&page[..0x20], (0..0x20).map(|i| 0xA0 + i as u8).collect::<Vec<_>>().as_slice());
    assert!(page[0x20..].iter().all(|b| *b == 0));
    assert_eq!(user_load(&mut kernel, &mut live, USER_START + PATH, 6), b"/fat32");
}

#[test]
fn spurious_interrupts_are_ignored() {
    let (mut kernel, mut live) = started();
    let before = live;
    live.scause = (1 << 63) | 9;
    kernel.handle_trap(&mut live);
    assert_eq!(live, TrapFrame { scause: (1 << 63) | 9, ..before });
}

#[test]
#[should_panic(expected = "unhandled page fault")]
fn store_to_read_only_segment_is_fatal() {
    let elf = elf_with_text_only();
    let mut kernel = boot(1, elf, MountTable::new());
    let mut live = TrapFrame { scause: TIMER, ..TrapFrame::default() };
    kernel.handle_trap(&mut live);
    user_store(&mut kernel, &mut live, 0x1_0000, b"x");
}

#[test]
#[should_panic(expected = "unhandled page fault")]
fn access_outside_every_vma_is_fatal() {
    let (mut kernel, mut live) = started();
    let _ = user_load(&mut kernel, &mut live, 0x2000_0000, 1);
}

/// ELF64 image with one R|X segment at 0x10000.
fn elf_with_text_only() -> Vec<u8> {
    let mut out = vec![0u8; 64 + 56];
    out[0..4].copy_from_slice(b"\x7FELF");
    out[4] = 2;
    out[5] = 1;
    out[24..32].copy_from_slice(&0x1_0078u64.to_le_bytes());
    out[32..40].copy_from_slice(&64u64.to_le_bytes());
    out[54..56].copy_from_slice(&56u16.to_le_bytes());
    out[56..58].copy_from_slice(&1u16.to_le_bytes());
    let ph = &mut out[64..120];
    ph[0..4].copy_from_slice(&1u32.to_le_bytes());
    ph[4..8].copy_from_slice(&5u32.to_le_bytes());
    ph[8..16].copy_from_slice(&0u64.to_le_bytes());
    ph[16..24].copy_from_slice(&0x1_0000u64.to_le_bytes());
    ph[32..40].copy_from_slice(&0x100u64.to_le_bytes());
    ph[40..48].copy_from_slice(&0x100u64.to_le_bytes());
    out.resize(0x100, 0x13);
    out
}
