// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel access to user buffers through the owning page table
//! OWNERS: @kernel-mm-team
//! PUBLIC API: copy_from_user, copy_to_user, read_user_str, UserAccessError
//! DEPENDS_ON: mm::fault (pages not yet present are resolved like a user fault)
//! INVARIANTS: Every byte is checked against [USER_START, USER_END) before any copy;
//!             stores to shared frames go through the COW path first

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use super::address_space::AddressSpace;
use super::fault::{self, FaultError, FaultKind};
use super::frame::{FramePool, PhysFrame};
use super::page_table::PageFlags;
use super::{page_round_down, PAGE_SIZE};
use crate::config::{USER_END, USER_START};
use crate::hal::Tlb;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserAccessError {
    /// Range leaves the user window or wraps.
    BadAddress { addr: usize, len: usize },
    /// A page could not be made present.
    Fault(FaultError),
    /// No NUL within the allowed length.
    Unterminated { max: usize },
    /// String bytes are not UTF-8.
    InvalidUtf8,
}

impl UserAccessError {
    /// Exhausted memory is not the caller's fault and halts the kernel.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::Fault(FaultError::OutOfMemory { .. }))
    }
}

impl From<FaultError> for UserAccessError {
    fn from(value: FaultError) -> Self {
        Self::Fault(value)
    }
}

impl fmt::Display for UserAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAddress { addr, len } => {
                write!(f, "user range 0x{addr:x}+0x{len:x} outside the user window")
            }
            Self::Fault(err) => write!(f, "{err}"),
            Self::Unterminated { max } => write!(f, "string longer than {max} bytes"),
            Self::InvalidUtf8 => f.write_str("string is not valid UTF-8"),
        }
    }
}

fn check_range(addr: usize, len: usize) -> Result<(), UserAccessError> {
    let end = addr.checked_add(len).ok_or(UserAccessError::BadAddress { addr, len })?;
    if addr < USER_START || end > USER_END {
        return Err(UserAccessError::BadAddress { addr, len });
    }
    Ok(())
}

/// Frame backing the page at `page`, faulted in for `kind` if needed.
fn user_frame<T: Tlb + ?Sized>(
    space: &mut AddressSpace,
    pool: &mut FramePool,
    tlb: &mut T,
    page: usize,
    kind: FaultKind,
) -> Result<PhysFrame, UserAccessError> {
    let needed = match kind {
        FaultKind::Store => PageFlags::USER | PageFlags::WRITE,
        FaultKind::Load => PageFlags::USER | PageFlags::READ,
        FaultKind::Instruction => PageFlags::USER | PageFlags::EXECUTE,
    };
    if let Some(pte) = space.page_table().entry(pool, page) {
        if pte.flags().contains(needed) {
            return Ok(pte.frame());
        }
    }
    let _ = fault::resolve(space, pool, tlb, page, kind)?;
    space
        .page_table()
        .entry(pool, page)
        .filter(|pte| pte.flags().contains(needed))
        .map(|pte| pte.frame())
        .ok_or(UserAccessError::Fault(FaultError::NoVma { addr: page, kind }))
}

/// Copies `buf.len()` bytes starting at user address `src`.
pub fn copy_from_user<T: Tlb + ?Sized>(
    space: &mut AddressSpace,
    pool: &mut FramePool,
    tlb: &mut T,
    src: usize,
    buf: &mut [u8],
) -> Result<(), UserAccessError> {
    check_range(src, buf.len())?;
    let mut done = 0;
    while done < buf.len() {
        let addr = src + done;
        let page = page_round_down(addr);
        let offset = addr - page;
        let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
        let frame = user_frame(space, pool, tlb, page, FaultKind::Load)?;
        let bytes = pool.bytes(frame).map_err(|err| {
            UserAccessError::Fault(FaultError::Frame { addr, err })
        })?;
        buf[done..done + chunk].copy_from_slice(&bytes[offset..offset + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Copies `data` to user address `dst`, splitting COW pages on the way.
pub fn copy_to_user<T: Tlb + ?Sized>(
    space: &mut AddressSpace,
    pool: &mut FramePool,
    tlb: &mut T,
    dst: usize,
    data: &[u8],
) -> Result<(), UserAccessError> {
    check_range(dst, data.len())?;
    let mut done = 0;
    while done < data.len() {
        let addr = dst + done;
        let page = page_round_down(addr);
        let offset = addr - page;
        let chunk = (PAGE_SIZE - offset).min(data.len() - done);
        let frame = user_frame(space, pool, tlb, page, FaultKind::Store)?;
        let bytes = pool.bytes_mut(frame).map_err(|err| {
            UserAccessError::Fault(FaultError::Frame { addr, err })
        })?;
        bytes[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Reads a NUL-terminated string of at most `max` bytes (terminator excluded).
pub fn read_user_str<T: Tlb + ?Sized>(
    space: &mut AddressSpace,
    pool: &mut FramePool,
    tlb: &mut T,
    ptr: usize,
    max: usize,
) -> Result<String, UserAccessError> {
    let mut out = Vec::new();
    let mut addr = ptr;
    loop {
        check_range(addr, 1)?;
        let page = page_round_down(addr);
        let frame = user_frame(space, pool, tlb, page, FaultKind::Load)?;
        let bytes = pool.bytes(frame).map_err(|err| {
            UserAccessError::Fault(FaultError::Frame { addr, err })
        })?;
        for byte in &bytes[addr - page..] {
            if *byte == 0 {
                return String::from_utf8(out).map_err(|_| UserAccessError::InvalidUtf8);
            }
            if out.len() == max {
                return Err(UserAccessError::Unterminated { max });
            }
            out.push(*byte);
        }
        addr = page + PAGE_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PHY_START;
    use crate::hal::host::HostMachine;
    use crate::mm::page_table::PageTable;
    use crate::mm::vma::VmaFlags;
    use alloc::sync::Arc;

    fn space_with_data() -> (FramePool, AddressSpace, HostMachine) {
        let mut pool = FramePool::new(PHY_START, 32);
        let table = PageTable::new(&mut pool).expect("root");
        let mut image = alloc::vec![0u8; 2 * PAGE_SIZE];
        image[PAGE_SIZE - 3..PAGE_SIZE + 3].copy_from_slice(b"/a/b\0x");
        let mut space = AddressSpace::with_image(table, Arc::new(image));
        space
            .map_region(0x10000, 2 * PAGE_SIZE, 0, 2 * PAGE_SIZE, VmaFlags::READ)
            .expect("text");
        space
            .map_region(0x20000, 2 * PAGE_SIZE, 0, 0, VmaFlags::READ | VmaFlags::WRITE | VmaFlags::ANON)
            .expect("data");
        (pool, space, HostMachine::new())
    }

    #[test]
    fn string_crossing_a_page_is_read_whole() {
        let (mut pool, mut space, mut tlb) = space_with_data();
        let path = read_user_str(&mut space, &mut pool, &mut tlb, 0x10000 + PAGE_SIZE - 3, 64);
        assert_eq!(path.as_deref(), Ok("/a/b"));
    }

    #[test]
    fn overlong_string_is_rejected() {
        let (mut pool, mut space, mut tlb) = space_with_data();
        let err = read_user_str(&mut space, &mut pool, &mut tlb, 0x10000 + PAGE_SIZE - 3, 2);
        assert_eq!(err, Err(UserAccessError::Unterminated { max: 2 }));
    }

    #[test]
    fn write_then_read_across_pages() {
        let (mut pool, mut space, mut tlb) = space_with_data();
        let addr = 0x20000 + PAGE_SIZE - 4;
        copy_to_user(&mut space, &mut pool, &mut tlb, addr, b"abcdefgh").expect("store");
        let mut back = [0u8; 8];
        copy_from_user(&mut space, &mut pool, &mut tlb, addr, &mut back).expect("load");
        assert_eq!(&back, b"abcdefgh");
    }

    #[test]
    fn store_into_read_only_vma_faults() {
        let (mut pool, mut space, mut tlb) = space_with_data();
        let err = copy_to_user(&mut space, &mut pool, &mut tlb, 0x10000, b"x").expect_err("ro");
        assert!(matches!(err, UserAccessError::Fault(FaultError::AccessViolation { .. })));
    }

    #[test]
    fn kernel_addresses_are_refused() {
        let (mut pool, mut space, mut tlb) = space_with_data();
        let mut buf = [0u8; 4];
        assert_eq!(
            copy_from_user(&mut space, &mut pool, &mut tlb, USER_END - 2, &mut buf),
            Err(UserAccessError::BadAddress { addr: USER_END - 2, len: 4 })
        );
    }

    #[test]
    fn unmapped_address_has_no_vma() {
        let (mut pool, mut space, mut tlb) = space_with_data();
        let mut buf = [0u8; 1];
        let err = copy_from_user(&mut space, &mut pool, &mut tlb, 0x90000, &mut buf).expect_err("no vma");
        assert!(matches!(err, UserAccessError::Fault(FaultError::NoVma { .. })));
        assert!(!err.is_out_of_memory());
    }
}
