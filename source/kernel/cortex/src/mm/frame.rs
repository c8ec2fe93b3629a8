// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame pool with atomic per-frame reference counts
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FramePool (alloc_zeroed/share/release/refcount/bytes/copy_frame), PhysFrame, Release
//! DEPENDS_ON: config::PAGE_SIZE
//! INVARIANTS: A frame is on the free list iff its count is zero; allocation hands out
//!             zero-filled frames; callers never touch counts except through share/release
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::PAGE_SIZE;

/// Physical frame named by its page number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysFrame(usize);

impl PhysFrame {
    #[inline]
    pub const fn from_ppn(ppn: usize) -> Self {
        Self(ppn)
    }

    /// Frame holding physical address `pa`.
    #[inline]
    pub const fn containing(pa: usize) -> Self {
        Self(pa / PAGE_SIZE)
    }

    #[inline]
    pub const fn ppn(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0 * PAGE_SIZE
    }
}

impl fmt::Display for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.addr())
    }
}

/// Errors surfaced by the frame pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Every frame is in use.
    OutOfFrames,
    /// Address lies outside the pool.
    NotInPool { pa: usize },
    /// Frame is on the free list.
    NotAllocated { pa: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => f.write_str("out of physical frames"),
            Self::NotInPool { pa } => write!(f, "frame 0x{pa:x} is not managed by the pool"),
            Self::NotAllocated { pa } => write!(f, "frame 0x{pa:x} is not allocated"),
        }
    }
}

/// Result of dropping one reference.
#[must_use = "release outcomes tell whether the frame went back to the pool"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// The last reference was dropped and the frame is free again.
    Freed,
    /// Other mappings still reference the frame.
    Shared { remaining: u32 },
}

/// Backing storage of exactly one page, aligned so page-table words can be
/// read in place.
#[repr(C, align(4096))]
pub struct FrameBytes([u8; PAGE_SIZE]);

impl FrameBytes {
    const fn zeroed() -> Self {
        Self([0; PAGE_SIZE])
    }
}

enum Backing {
    Heap(Box<[FrameBytes]>),
    Region { base: NonNull<FrameBytes>, len: usize },
}

impl Backing {
    fn pages(&self) -> &[FrameBytes] {
        match self {
            Backing::Heap(pages) => &pages[..],
            // SAFETY: `from_region` callers guarantee the region is valid,
            // exclusively owned by the pool and `len` pages long.
            Backing::Region { base, len } => unsafe {
                core::slice::from_raw_parts(base.as_ptr(), *len)
            },
        }
    }

    fn pages_mut(&mut self) -> &mut [FrameBytes] {
        match self {
            Backing::Heap(pages) => &mut pages[..],
            // SAFETY: see `pages`; `&mut self` guarantees exclusive access.
            Backing::Region { base, len } => unsafe {
                core::slice::from_raw_parts_mut(base.as_ptr(), *len)
            },
        }
    }
}

/// Fixed pool of 4 KiB frames starting at a physical base.
pub struct FramePool {
    base_ppn: usize,
    backing: Backing,
    refcounts: Box<[AtomicU32]>,
    free: Vec<usize>,
    #[cfg(feature = "failpoints")]
    fail_after: Option<usize>,
}

impl FramePool {
    /// Creates a heap-backed pool of `frames` frames whose physical numbering
    /// starts at `base_pa` (rounded down to a page).
    pub fn new(base_pa: usize, frames: usize) -> Self {
        let pages: Vec<FrameBytes> = (0..frames).map(|_| FrameBytes::zeroed()).collect();
        Self::with_backing(base_pa, Backing::Heap(pages.into_boxed_slice()), frames)
    }

    /// Creates a pool over a RAM window the kernel reaches through `base`.
    ///
    /// # Safety
    /// `base` must point at `frames` writable, page-aligned pages that nothing
    /// else accesses for the lifetime of the pool, and `base_pa` must be the
    /// physical address of the first page.
    pub unsafe fn from_region(base: NonNull<u8>, base_pa: usize, frames: usize) -> Self {
        let base = base.cast::<FrameBytes>();
        Self::with_backing(base_pa, Backing::Region { base, len: frames }, frames)
    }

    fn with_backing(base_pa: usize, backing: Backing, frames: usize) -> Self {
        let refcounts: Vec<AtomicU32> = (0..frames).map(|_| AtomicU32::new(0)).collect();
        Self {
            base_ppn: base_pa / PAGE_SIZE,
            backing,
            refcounts: refcounts.into_boxed_slice(),
            free: (0..frames).rev().collect(),
            #[cfg(feature = "failpoints")]
            fail_after: None,
        }
    }

    /// Total frames managed by the pool.
    pub fn capacity(&self) -> usize {
        self.refcounts.len()
    }

    /// Frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    /// Returns whether `pa` falls inside the pool.
    pub fn contains(&self, pa: usize) -> bool {
        let ppn = pa / PAGE_SIZE;
        ppn >= self.base_ppn && ppn - self.base_ppn < self.capacity()
    }

    /// Hands out a zero-filled frame with a reference count of one.
    pub fn alloc_zeroed(&mut self) -> Result<PhysFrame, FrameError> {
        #[cfg(feature = "failpoints")]
        if let Some(left) = self.fail_after.as_mut() {
            if *left == 0 {
                return Err(FrameError::OutOfFrames);
            }
            *left -= 1;
        }
        let index = self.free.pop().ok_or(FrameError::OutOfFrames)?;
        self.backing.pages_mut()[index].0.fill(0);
        self.refcounts[index].store(1, Ordering::Release);
        Ok(PhysFrame(self.base_ppn + index))
    }

    /// Hands out `count` physically consecutive zero-filled frames, each with
    /// a reference count of one, and returns the lowest. Counts as a single
    /// allocation for the failpoint.
    pub fn alloc_contiguous_zeroed(&mut self, count: usize) -> Result<PhysFrame, FrameError> {
        #[cfg(feature = "failpoints")]
        if let Some(left) = self.fail_after.as_mut() {
            if *left == 0 {
                return Err(FrameError::OutOfFrames);
            }
            *left -= 1;
        }
        if count == 0 || count > self.capacity() {
            return Err(FrameError::OutOfFrames);
        }
        let is_free = |i: usize| self.refcounts[i].load(Ordering::Acquire) == 0;
        let first = (0..=self.capacity() - count)
            .find(|&start| (start..start + count).all(is_free))
            .ok_or(FrameError::OutOfFrames)?;
        self.free.retain(|&i| i < first || i >= first + count);
        let pages = self.backing.pages_mut();
        for index in first..first + count {
            pages[index].0.fill(0);
            self.refcounts[index].store(1, Ordering::Release);
        }
        Ok(PhysFrame(self.base_ppn + first))
    }

    /// Adds one reference to an allocated frame and returns the new count.
    pub fn share(&self, frame: PhysFrame) -> Result<u32, FrameError> {
        let index = self.allocated_index(frame)?;
        Ok(self.refcounts[index].fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Drops one reference; the frame returns to the free list at zero.
    pub fn release(&mut self, frame: PhysFrame) -> Result<Release, FrameError> {
        let index = self.allocated_index(frame)?;
        let previous = self.refcounts[index].fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.free.push(index);
            Ok(Release::Freed)
        } else {
            Ok(Release::Shared { remaining: previous - 1 })
        }
    }

    /// Current reference count; zero for free frames.
    pub fn refcount(&self, frame: PhysFrame) -> Result<u32, FrameError> {
        let index = self.index(frame)?;
        Ok(self.refcounts[index].load(Ordering::Acquire))
    }

    pub fn bytes(&self, frame: PhysFrame) -> Result<&[u8; PAGE_SIZE], FrameError> {
        let index = self.allocated_index(frame)?;
        Ok(&self.backing.pages()[index].0)
    }

    pub fn bytes_mut(&mut self, frame: PhysFrame) -> Result<&mut [u8; PAGE_SIZE], FrameError> {
        let index = self.allocated_index(frame)?;
        Ok(&mut self.backing.pages_mut()[index].0)
    }

    /// Copies the content of `src` into `dst` byte for byte.
    pub fn copy_frame(&mut self, src: PhysFrame, dst: PhysFrame) -> Result<(), FrameError> {
        let src = self.allocated_index(src)?;
        let dst = self.allocated_index(dst)?;
        if src == dst {
            return Ok(());
        }
        // Disjoint borrows: no page-sized temporary on the kernel stack.
        let pages = self.backing.pages_mut();
        let (lo, hi) = pages.split_at_mut(src.max(dst));
        let (from, to) = if src < dst { (&lo[src], &mut hi[0]) } else { (&hi[0], &mut lo[dst]) };
        to.0.copy_from_slice(&from.0);
        Ok(())
    }

    /// Makes the allocation after the next `n` successful ones fail.
    #[cfg(feature = "failpoints")]
    pub fn fail_allocs_after(&mut self, n: usize) {
        self.fail_after = Some(n);
    }

    /// Clears an armed allocation failure.
    #[cfg(feature = "failpoints")]
    pub fn clear_failpoint(&mut self) {
        self.fail_after = None;
    }

    fn index(&self, frame: PhysFrame) -> Result<usize, FrameError> {
        if !self.contains(frame.addr()) {
            return Err(FrameError::NotInPool { pa: frame.addr() });
        }
        Ok(frame.0 - self.base_ppn)
    }

    fn allocated_index(&self, frame: PhysFrame) -> Result<usize, FrameError> {
        let index = self.index(frame)?;
        if self.refcounts[index].load(Ordering::Acquire) == 0 {
            return Err(FrameError::NotAllocated { pa: frame.addr() });
        }
        Ok(index)
    }
}
