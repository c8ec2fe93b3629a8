// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-fault resolution: demand fill from the program image and COW splits
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/fork_cow.rs
//! PUBLIC API: resolve(space, pool, tlb, addr, kind), FaultKind, FaultOutcome, FaultError
//! DEPENDS_ON: mm::address_space, mm::page_table, mm::frame, hal::Tlb
//! INVARIANTS: A fault resolves in one pass or returns an error the trap layer treats as
//!             fatal; a COW split adjusts the frame count together with the write bit
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt;

use super::address_space::AddressSpace;
use super::frame::{FrameError, FramePool, PhysFrame, Release};
use super::page_table::{MapError, PageFlags, Pte, PteSlot};
use super::vma::{Vma, VmaFlags};
use super::{page_round_down, PAGE_SIZE};
use crate::hal::Tlb;

/// Access that raised the fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Instruction,
    Load,
    Store,
}

impl FaultKind {
    /// Maps an `scause` exception code to a fault class.
    pub const fn from_cause(code: usize) -> Option<Self> {
        match code {
            12 => Some(Self::Instruction),
            13 => Some(Self::Load),
            15 => Some(Self::Store),
            _ => None,
        }
    }

    /// VMA permission the access needs.
    pub const fn required(self) -> VmaFlags {
        match self {
            Self::Instruction => VmaFlags::EXEC,
            Self::Load => VmaFlags::READ,
            Self::Store => VmaFlags::WRITE,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Instruction => "instruction",
            Self::Load => "load",
            Self::Store => "store",
        }
    }
}

/// How a fault was resolved.
#[must_use = "fault outcomes should be logged or asserted"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Fresh zero page for an anonymous VMA.
    DemandZero,
    /// Fresh page filled with `copied` bytes of the image, rest zero.
    DemandFile { copied: usize },
    /// Shared frame copied into a private writable frame.
    CowCopied,
    /// Sole owner of a read-only frame; write bit restored in place.
    CowReclaimed,
    /// Entry already allows the access; only the TLB was stale.
    Spurious,
}

/// Unresolvable faults. All of them halt the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// No VMA covers the address.
    NoVma { addr: usize, kind: FaultKind },
    /// The VMA forbids this kind of access.
    AccessViolation { addr: usize, kind: FaultKind, vma: Vma },
    /// No frame left for the page or its tables.
    OutOfMemory { addr: usize },
    /// Page-table update failed.
    Map { addr: usize, err: MapError },
    /// A mapped frame is not owned by the pool.
    Frame { addr: usize, err: FrameError },
}

impl FaultError {
    pub fn addr(&self) -> usize {
        match *self {
            Self::NoVma { addr, .. }
            | Self::AccessViolation { addr, .. }
            | Self::OutOfMemory { addr }
            | Self::Map { addr, .. }
            | Self::Frame { addr, .. } => addr,
        }
    }

    fn map(addr: usize, err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => Self::OutOfMemory { addr },
            err => Self::Map { addr, err },
        }
    }

    fn frame(addr: usize, err: FrameError) -> Self {
        match err {
            FrameError::OutOfFrames => Self::OutOfMemory { addr },
            err => Self::Frame { addr, err },
        }
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoVma { addr, kind } => {
                write!(f, "{} fault at 0x{addr:x}: no VMA covers the address", kind.label())
            }
            Self::AccessViolation { addr, kind, vma } => write!(
                f,
                "{} fault at 0x{addr:x}: access violation against VMA {vma}",
                kind.label()
            ),
            Self::OutOfMemory { addr } => write!(f, "fault at 0x{addr:x}: out of memory"),
            Self::Map { addr, err } => write!(f, "fault at 0x{addr:x}: {err}"),
            Self::Frame { addr, err } => write!(f, "fault at 0x{addr:x}: {err}"),
        }
    }
}

/// Resolves a fault at `addr` inside `space`.
pub fn resolve<T: Tlb + ?Sized>(
    space: &mut AddressSpace,
    pool: &mut FramePool,
    tlb: &mut T,
    addr: usize,
    kind: FaultKind,
) -> Result<FaultOutcome, FaultError> {
    let vma = *space.find_vma(addr).ok_or(FaultError::NoVma { addr, kind })?;
    if !vma.flags.contains(kind.required()) {
        return Err(FaultError::AccessViolation { addr, kind, vma });
    }

    let page = page_round_down(addr);
    let existing = match space.page_table().find_pte(pool, page) {
        Some(slot) => Some((slot, slot.load(pool))).filter(|(_, pte)| pte.is_valid()),
        None => None,
    };

    let outcome = match existing {
        Some((slot, pte)) if kind == FaultKind::Store && !pte.flags().contains(PageFlags::WRITE) => {
            split_cow(space, pool, slot, pte, page)?
        }
        Some(_) => FaultOutcome::Spurious,
        None => demand_fill(space, pool, &vma, page)?,
    };
    tlb.flush_page(page);
    log_debug!(
        target: "fault",
        "PF: {} at 0x{:x} in {} -> {:?}",
        kind.label(),
        addr,
        vma,
        outcome
    );
    Ok(outcome)
}

fn split_cow(
    space: &mut AddressSpace,
    pool: &mut FramePool,
    slot: PteSlot,
    pte: Pte,
    page: usize,
) -> Result<FaultOutcome, FaultError> {
    let old = pte.frame();
    let writable = pte.flags() | PageFlags::WRITE;
    let shares = pool.refcount(old).map_err(|err| FaultError::frame(page, err))?;
    if shares <= 1 {
        slot.store(pool, pte.with_flags(writable)).map_err(|err| FaultError::map(page, err))?;
        return Ok(FaultOutcome::CowReclaimed);
    }

    let copy = pool.alloc_zeroed().map_err(|err| FaultError::frame(page, err))?;
    if let Err(err) = pool.copy_frame(old, copy) {
        let _ = pool.release(copy);
        return Err(FaultError::frame(page, err));
    }
    if let Err(err) = space.page_table_mut().create_mapping(pool, page, copy.addr(), PAGE_SIZE, writable) {
        let _ = pool.release(copy);
        return Err(FaultError::map(page, err));
    }
    match pool.release(old) {
        Ok(Release::Freed) => {
            log_trace!(target: "fault", "COW: frame {} released", old);
        }
        Ok(Release::Shared { remaining }) => {
            log_trace!(target: "fault", "COW: frame {} still shared by {}", old, remaining);
        }
        Err(err) => return Err(FaultError::frame(page, err)),
    }
    Ok(FaultOutcome::CowCopied)
}

fn demand_fill(
    space: &mut AddressSpace,
    pool: &mut FramePool,
    vma: &Vma,
    page: usize,
) -> Result<FaultOutcome, FaultError> {
    let frame = pool.alloc_zeroed().map_err(|err| FaultError::frame(page, err))?;
    let copied = if vma.is_anonymous() {
        0
    } else {
        fill_from_image(space, pool, vma, page, frame)
    };

    if let Err(err) = space.page_table_mut().create_mapping(
        pool,
        page,
        frame.addr(),
        PAGE_SIZE,
        leaf_flags(vma.flags),
    ) {
        let _ = pool.release(frame);
        return Err(FaultError::map(page, err));
    }
    if vma.is_anonymous() {
        Ok(FaultOutcome::DemandZero)
    } else {
        Ok(FaultOutcome::DemandFile { copied })
    }
}

/// Copies the image bytes that back `page`; bytes past `file_len` stay zero.
fn fill_from_image(
    space: &AddressSpace,
    pool: &mut FramePool,
    vma: &Vma,
    page: usize,
    frame: PhysFrame,
) -> usize {
    let image = match space.image() {
        Some(image) => image,
        None => {
            log_warn!(target: "fault", "PF: file-backed {} has no image, leaving page zero", vma);
            return 0;
        }
    };
    let offset_in_vma = page.saturating_sub(vma.start);
    if offset_in_vma >= vma.file_len {
        return 0;
    }
    let want = (vma.file_len - offset_in_vma).min(PAGE_SIZE);
    let bytes = match pool.bytes_mut(frame) {
        Ok(bytes) => bytes,
        Err(_) => return 0,
    };
    image.read_at(vma.file_offset + offset_in_vma, &mut bytes[..want])
}

fn leaf_flags(flags: VmaFlags) -> PageFlags {
    let mut perm = PageFlags::USER;
    if flags.contains(VmaFlags::READ) {
        perm |= PageFlags::READ;
    }
    if flags.contains(VmaFlags::WRITE) {
        perm |= PageFlags::WRITE;
    }
    if flags.contains(VmaFlags::EXEC) {
        perm |= PageFlags::EXECUTE;
    }
    perm
}
