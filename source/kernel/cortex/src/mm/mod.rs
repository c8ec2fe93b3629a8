// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for Sv39: frames, page tables, VMAs, address
//! spaces and page-fault resolution.

pub mod address_space;
pub mod fault;
pub mod frame;
pub mod page_table;
pub mod uaccess;
pub mod vma;

pub use crate::config::PAGE_SIZE;
pub use address_space::{AddressSpace, ImageSource};
pub use fault::{FaultError, FaultKind, FaultOutcome};
pub use frame::{FrameError, FramePool, PhysFrame, Release};
pub use page_table::{KernelLayout, KernelSegment, MapError, PageFlags, PageTable, Pte, PteSlot};
pub use vma::{Vma, VmaError, VmaFlags, VmaHandle, VmaList};

/// Rounds `addr` down to its page boundary.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary, `None` on overflow.
#[inline]
pub const fn page_round_up(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests_prop;
