// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel heap backing `alloc` on the bare-metal target.

use linked_list_allocator::LockedHeap;

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Hands `[start, start + size)` to the global allocator.
///
/// # Safety
/// Must be called once, before the first allocation, with a writable region
/// that nothing else uses.
pub unsafe fn init(start: *mut u8, size: usize) {
    // SAFETY: forwarded from the caller.
    unsafe { HEAP.lock().init(start, size) };
}

/// Bytes still available to the allocator.
pub fn free_bytes() -> usize {
    HEAP.lock().free()
}
