// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for identifiers and addresses crossing module boundaries
//! OWNERS: @kernel-team
//! PUBLIC API: Pid, VirtAddr
//! DEPENDS_ON: mm::page_table::is_canonical_sv39, PAGE_SIZE
//! INVARIANTS: VirtAddr is always canonical Sv39; Pid equals its task-table slot
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt;

use crate::mm::{page_table::is_canonical_sv39, PAGE_SIZE};

/// Process identifier.
///
/// **Ownership**: only the task table and fork hand out PIDs.
/// **Invariant**: PID 0 is the idle task and never runs user code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Idle task PID.
    pub const IDLE: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the PID as a task-table slot index.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical Sv39 virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if is_canonical_sv39(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn page_down(self) -> usize {
        self.0 & !(PAGE_SIZE - 1)
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the three Sv39 VPN slices ordered root first.
    #[inline]
    pub const fn vpn(self) -> [usize; 3] {
        [(self.0 >> 30) & 0x1ff, (self.0 >> 21) & 0x1ff, (self.0 >> 12) & 0x1ff]
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_is_its_slot() {
        let pid = Pid::from_raw(3);
        assert_eq!(pid.as_index(), 3);
        assert_eq!(Pid::IDLE.as_raw(), 0);
    }

    #[test]
    fn virt_addr_rejects_non_canonical() {
        assert!(VirtAddr::new(1 << 40).is_none());
        assert!(VirtAddr::new(0xffff_ffe0_0000_0000).is_some());
    }

    #[test]
    fn vpn_slices_split_nine_bits_each() {
        let va = VirtAddr::new((3 << 30) | (5 << 21) | (7 << 12) | 0x123).expect("canonical");
        assert_eq!(va.vpn(), [3, 5, 7]);
        assert_eq!(va.page_offset(), 0x123);
        assert_eq!(va.page_down(), (3 << 30) | (5 << 21) | (7 << 12));
    }
}
