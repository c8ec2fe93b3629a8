// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page tables stored in pool frames, with lazy allocation of
//! intermediate levels and by-value duplication of leaf tables.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use super::frame::{FrameError, FramePool, PhysFrame};
use super::page_round_down;
use crate::config::{PAGE_SIZE, PA2VA_OFFSET};

/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
/// Width of the physical page number stored in an entry.
const PPN_MASK: usize = (1 << 44) - 1;
const SATP_MODE_SV39: usize = 8 << 60;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Address is not canonical Sv39 or the range wraps.
    OutOfRange { va: usize },
    /// Permissions carry none of R/W/X and would read as a table pointer.
    InvalidFlags,
    /// Walk met a superpage leaf above the last level.
    Superpage { va: usize },
    /// No frame was left for an intermediate table.
    OutOfMemory,
    /// A table frame was not owned by the pool.
    Frame(FrameError),
}

impl From<FrameError> for MapError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::OutOfFrames => Self::OutOfMemory,
            other => Self::Frame(other),
        }
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { va } => write!(f, "address 0x{va:x} outside Sv39 range"),
            Self::InvalidFlags => f.write_str("leaf permissions must include R, W or X"),
            Self::Superpage { va } => write!(f, "superpage already covers 0x{va:x}"),
            Self::OutOfMemory => f.write_str("out of frames for page tables"),
            Self::Frame(err) => write!(f, "{err}"),
        }
    }
}

/// One Sv39 page-table entry: `ppn << 10 | flags`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    pub const EMPTY: Self = Self(0);

    pub fn new(frame: PhysFrame, flags: PageFlags) -> Self {
        Self(((frame.ppn() & PPN_MASK) << 10) | flags.bits())
    }

    #[inline]
    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> usize {
        self.0
    }

    #[inline]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & 0xff)
    }

    #[inline]
    pub fn frame(self) -> PhysFrame {
        PhysFrame::from_ppn((self.0 >> 10) & PPN_MASK)
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.flags().contains(PageFlags::VALID)
    }

    #[inline]
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().intersects(LEAF_PERMS)
    }

    /// Same frame, different flags.
    #[inline]
    pub fn with_flags(self, flags: PageFlags) -> Self {
        Self::new(self.frame(), flags)
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte(ppn=0x{:x}, {:?})", self.frame().ppn(), self.flags())
    }
}

/// Location of one entry inside a table frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PteSlot {
    table: PhysFrame,
    index: usize,
    span: usize,
}

impl PteSlot {
    /// Frame of the table holding the entry.
    pub fn table(self) -> PhysFrame {
        self.table
    }

    pub fn index(self) -> usize {
        self.index
    }

    /// Bytes of address space the entry governs (4 KiB unless a superpage).
    pub fn span(self) -> usize {
        self.span
    }

    pub fn load(self, pool: &FramePool) -> Pte {
        entries(pool, self.table).map(|e| Pte(e[self.index])).unwrap_or(Pte::EMPTY)
    }

    pub fn store(self, pool: &mut FramePool, pte: Pte) -> Result<(), MapError> {
        entries_mut(pool, self.table)?[self.index] = pte.bits();
        Ok(())
    }
}

fn entries(pool: &FramePool, table: PhysFrame) -> Result<&[usize; PT_ENTRIES], FrameError> {
    let bytes = pool.bytes(table)?;
    // SAFETY: pool pages are 4 KiB aligned and 4 KiB long; any bit pattern is a valid usize.
    Ok(unsafe { &*(bytes.as_ptr() as *const [usize; PT_ENTRIES]) })
}

fn entries_mut(
    pool: &mut FramePool,
    table: PhysFrame,
) -> Result<&mut [usize; PT_ENTRIES], FrameError> {
    let bytes = pool.bytes_mut(table)?;
    // SAFETY: as in `entries`; the mutable borrow of the pool keeps the view unique.
    Ok(unsafe { &mut *(bytes.as_mut_ptr() as *mut [usize; PT_ENTRIES]) })
}

/// One contiguous kernel image segment mapped into every address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelSegment {
    pub va: usize,
    pub len: usize,
    pub flags: PageFlags,
}

/// Kernel image layout used to build the kernel-shared table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelLayout {
    pub segments: Vec<KernelSegment>,
    /// Offset subtracted from a segment VA to find its physical address.
    pub pa2va_offset: usize,
}

impl KernelLayout {
    /// Layout over the standard direct map.
    pub fn new(segments: Vec<KernelSegment>) -> Self {
        Self { segments, pa2va_offset: PA2VA_OFFSET }
    }
}

/// Three-level Sv39 page table whose table pages live in the frame pool.
#[derive(Debug, PartialEq, Eq)]
pub struct PageTable {
    root: PhysFrame,
}

impl PageTable {
    /// Creates an empty table with a fresh root page.
    pub fn new(pool: &mut FramePool) -> Result<Self, MapError> {
        Ok(Self { root: pool.alloc_zeroed()? })
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Returns the SATP value selecting this table in Sv39 mode.
    pub fn satp(&self) -> usize {
        SATP_MODE_SV39 | self.root.ppn()
    }

    /// Installs leaf entries covering `[va, va + size)` onto `[pa, pa + size)`.
    ///
    /// Both addresses are rounded down to a page first, a zero `size` is a
    /// no-op and an already valid leaf is overwritten. `VALID` is always set.
    pub fn create_mapping(
        &mut self,
        pool: &mut FramePool,
        va: usize,
        pa: usize,
        size: usize,
        perm: PageFlags,
    ) -> Result<(), MapError> {
        if size == 0 {
            return Ok(());
        }
        if !perm.intersects(LEAF_PERMS) {
            return Err(MapError::InvalidFlags);
        }
        let last = va
            .checked_add(size - 1)
            .map(page_round_down)
            .ok_or(MapError::OutOfRange { va })?;
        let leaf = perm | PageFlags::VALID;
        let mut page_va = page_round_down(va);
        let mut page_pa = page_round_down(pa);
        log_trace!(
            target: "mm",
            "PT-MAP: root={} va=0x{:x} pa=0x{:x} size=0x{:x} perm={:?}",
            self.root,
            page_va,
            page_pa,
            size,
            leaf
        );
        loop {
            if !is_canonical_sv39(page_va) {
                return Err(MapError::OutOfRange { va: page_va });
            }
            let slot = self.walk_create(pool, page_va)?;
            slot.store(pool, Pte::new(PhysFrame::containing(page_pa), leaf))?;
            if page_va == last {
                return Ok(());
            }
            page_va += PAGE_SIZE;
            page_pa = page_pa.wrapping_add(PAGE_SIZE);
        }
    }

    /// Returns the entry governing `va`, or `None` if an upper level is invalid.
    ///
    /// The returned slot may hold an invalid leaf. Never allocates.
    pub fn find_pte(&self, pool: &FramePool, va: usize) -> Option<PteSlot> {
        if !is_canonical_sv39(va) {
            return None;
        }
        let vpn = vpn_indices(va);
        let mut table = self.root;
        let mut span = PAGE_SIZE << 18;
        for index in &vpn[..2] {
            let entry = Pte(entries(pool, table).ok()?[*index]);
            if !entry.is_valid() {
                return None;
            }
            if entry.is_leaf() {
                return Some(PteSlot { table, index: *index, span });
            }
            table = entry.frame();
            span >>= 9;
        }
        Some(PteSlot { table, index: vpn[2], span: PAGE_SIZE })
    }

    /// Valid leaf entry governing `va`.
    pub fn entry(&self, pool: &FramePool, va: usize) -> Option<Pte> {
        self.find_pte(pool, va).map(|slot| slot.load(pool)).filter(|pte| pte.is_valid())
    }

    /// Translates `va` to its physical address.
    pub fn translate(&self, pool: &FramePool, va: usize) -> Option<usize> {
        let slot = self.find_pte(pool, va)?;
        let pte = slot.load(pool);
        if !pte.is_leaf() {
            return None;
        }
        let mask = slot.span() - 1;
        Some((pte.frame().addr() & !mask) | (va & mask))
    }

    /// Builds a new table with private copies of the root and middle levels
    /// and leaf tables copied entry by entry. Reference counts are untouched.
    pub fn duplicate_root(&self, pool: &mut FramePool) -> Result<PageTable, MapError> {
        let copy = PageTable::new(pool)?;
        if let Err(err) = copy_level(pool, self.root, copy.root, 0) {
            copy.release_tables(pool);
            return Err(err);
        }
        Ok(copy)
    }

    /// Maps every kernel segment at its direct-map physical address.
    pub fn map_kernel(&mut self, pool: &mut FramePool, layout: &KernelLayout) -> Result<(), MapError> {
        for segment in &layout.segments {
            let pa = segment.va.wrapping_sub(layout.pa2va_offset);
            self.create_mapping(pool, segment.va, pa, segment.len, segment.flags)?;
        }
        Ok(())
    }

    /// Returns the root and intermediate tables to the pool. Leaf frames are
    /// left alone; their owners release them.
    pub fn release_tables(self, pool: &mut FramePool) {
        release_level(pool, self.root, 0);
    }

    fn walk_create(&mut self, pool: &mut FramePool, va: usize) -> Result<PteSlot, MapError> {
        let vpn = vpn_indices(va);
        let mut table = self.root;
        for index in &vpn[..2] {
            let entry = Pte(entries(pool, table)?[*index]);
            if entry.is_valid() {
                if entry.is_leaf() {
                    return Err(MapError::Superpage { va });
                }
                table = entry.frame();
                continue;
            }
            let next = pool.alloc_zeroed()?;
            entries_mut(pool, table)?[*index] = Pte::new(next, PageFlags::VALID).bits();
            table = next;
        }
        Ok(PteSlot { table, index: vpn[2], span: PAGE_SIZE })
    }
}

fn copy_level(
    pool: &mut FramePool,
    src: PhysFrame,
    dst: PhysFrame,
    depth: usize,
) -> Result<(), MapError> {
    if depth == 2 {
        pool.copy_frame(src, dst)?;
        return Ok(());
    }
    for index in 0..PT_ENTRIES {
        let entry = Pte(entries(pool, src)?[index]);
        if !entry.is_valid() {
            continue;
        }
        if entry.is_leaf() {
            entries_mut(pool, dst)?[index] = entry.bits();
            continue;
        }
        let child = pool.alloc_zeroed()?;
        entries_mut(pool, dst)?[index] = Pte::new(child, entry.flags()).bits();
        copy_level(pool, entry.frame(), child, depth + 1)?;
    }
    Ok(())
}

fn release_level(pool: &mut FramePool, table: PhysFrame, depth: usize) {
    if depth < 2 {
        for index in 0..PT_ENTRIES {
            let entry = match entries(pool, table) {
                Ok(e) => Pte(e[index]),
                Err(_) => return,
            };
            if entry.is_valid() && !entry.is_leaf() {
                release_level(pool, entry.frame(), depth + 1);
            }
        }
    }
    let _ = pool.release(table);
}

/// VPN slices of `va`, root level first.
fn vpn_indices(va: usize) -> [usize; 3] {
    [(va >> 30) & 0x1ff, (va >> 21) & 0x1ff, (va >> 12) & 0x1ff]
}

pub fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}
