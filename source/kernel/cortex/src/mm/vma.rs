// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Ordered VMA list kept in an arena of handle-linked nodes
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vma, VmaFlags, VmaHandle, VmaList (find/insert/remove/iter)
//! DEPENDS_ON: config::PAGE_SIZE
//! INVARIANTS: Nodes sorted ascending by start; ranges never overlap; next/prev handles
//!             always point at live nodes; a rejected insert leaves the list untouched
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;
use core::num::NonZeroU32;

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Permission and backing flags of a VMA.
    pub struct VmaFlags: u32 {
        /// Zero-filled on first touch instead of read from the program image.
        const ANON = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXEC = 1 << 3;
    }
}

/// One contiguous virtual range `[start, end)` with uniform permissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vma {
    pub start: usize,
    pub end: usize,
    pub flags: VmaFlags,
    /// Offset into the backing image of the byte at `start`.
    pub file_offset: usize,
    /// Bytes of the range backed by the image; the rest reads as zero.
    pub file_len: usize,
}

impl Vma {
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.flags.contains(VmaFlags::ANON)
    }

    #[inline]
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        end > self.start && start < self.end
    }
}

impl fmt::Display for Vma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: VmaFlags, c: char| if self.flags.contains(bit) { c } else { '-' };
        write!(
            f,
            "[0x{:x}, 0x{:x}) {}{}{}{} off=0x{:x} len=0x{:x}",
            self.start,
            self.end,
            flag(VmaFlags::READ, 'r'),
            flag(VmaFlags::WRITE, 'w'),
            flag(VmaFlags::EXEC, 'x'),
            flag(VmaFlags::ANON, 'a'),
            self.file_offset,
            self.file_len
        )
    }
}

/// Handle to a node in a [`VmaList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VmaHandle(NonZeroU32);

impl VmaHandle {
    fn from_index(index: usize) -> Self {
        // SAFETY: index is offset by one, ensuring the raw value is never zero.
        unsafe { Self(NonZeroU32::new_unchecked(index as u32 + 1)) }
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// Errors reported by VMA bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmaError {
    /// Zero-length ranges are not tracked.
    Empty,
    /// `addr + len` overflowed or left the user region.
    OutOfRange { start: usize, len: usize },
    /// Range intersects an existing VMA.
    Overlap { existing: Vma },
    /// Start or length is not a multiple of the page size.
    Unaligned { start: usize, len: usize },
}

impl fmt::Display for VmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty range"),
            Self::OutOfRange { start, len } => {
                write!(f, "range 0x{start:x}+0x{len:x} outside the user region")
            }
            Self::Overlap { existing } => write!(f, "overlaps {existing}"),
            Self::Unaligned { start, len } => {
                write!(f, "range 0x{start:x}+0x{len:x} is not page aligned")
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Node {
    vma: Vma,
    prev: Option<VmaHandle>,
    next: Option<VmaHandle>,
}

/// Sorted, non-overlapping VMA list backed by an arena.
#[derive(Clone, Debug, Default)]
pub struct VmaList {
    nodes: Vec<Option<Node>>,
    vacant: Vec<usize>,
    head: Option<VmaHandle>,
    len: usize,
}

impl VmaList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<VmaHandle> {
        self.head
    }

    pub fn get(&self, handle: VmaHandle) -> Option<&Vma> {
        self.node(handle).map(|node| &node.vma)
    }

    pub fn next(&self, handle: VmaHandle) -> Option<VmaHandle> {
        self.node(handle).and_then(|node| node.next)
    }

    pub fn prev(&self, handle: VmaHandle) -> Option<VmaHandle> {
        self.node(handle).and_then(|node| node.prev)
    }

    /// Iterates VMAs in ascending address order.
    pub fn iter(&self) -> Iter<'_> {
        Iter { list: self, cursor: self.head }
    }

    /// Linear scan for the VMA containing `addr`.
    pub fn find(&self, addr: usize) -> Option<VmaHandle> {
        self.iter().find(|(_, vma)| vma.contains(addr)).map(|(handle, _)| handle)
    }

    /// Links `vma` at its sorted position after checking it overlaps nothing.
    pub fn insert(&mut self, vma: Vma) -> Result<VmaHandle, VmaError> {
        if vma.is_empty() {
            return Err(VmaError::Empty);
        }
        if let Some((_, existing)) = self.iter().find(|(_, v)| v.overlaps(vma.start, vma.end)) {
            return Err(VmaError::Overlap { existing: *existing });
        }

        let mut prev = None;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let node = match self.node(handle) {
                Some(node) => node,
                None => break,
            };
            if node.vma.start > vma.start {
                break;
            }
            prev = Some(handle);
            cursor = node.next;
        }

        let handle = self.alloc_node(Node { vma, prev, next: cursor });
        match prev {
            Some(p) => self.set_next(p, Some(handle)),
            None => self.head = Some(handle),
        }
        if let Some(n) = cursor {
            self.set_prev(n, Some(handle));
        }
        self.len += 1;
        Ok(handle)
    }

    /// Unlinks and returns the VMA behind `handle`.
    pub fn remove(&mut self, handle: VmaHandle) -> Option<Vma> {
        let node = self.nodes.get_mut(handle.index())?.take()?;
        match node.prev {
            Some(p) => self.set_next(p, node.next),
            None => self.head = node.next,
        }
        if let Some(n) = node.next {
            self.set_prev(n, node.prev);
        }
        self.vacant.push(handle.index());
        self.len -= 1;
        Some(node.vma)
    }

    fn node(&self, handle: VmaHandle) -> Option<&Node> {
        self.nodes.get(handle.index()).and_then(Option::as_ref)
    }

    fn alloc_node(&mut self, node: Node) -> VmaHandle {
        if let Some(index) = self.vacant.pop() {
            self.nodes[index] = Some(node);
            return VmaHandle::from_index(index);
        }
        self.nodes.push(Some(node));
        VmaHandle::from_index(self.nodes.len() - 1)
    }

    fn set_next(&mut self, handle: VmaHandle, next: Option<VmaHandle>) {
        if let Some(Some(node)) = self.nodes.get_mut(handle.index()) {
            node.next = next;
        }
    }

    fn set_prev(&mut self, handle: VmaHandle, prev: Option<VmaHandle>) {
        if let Some(Some(node)) = self.nodes.get_mut(handle.index()) {
            node.prev = prev;
        }
    }
}

/// Ordered iterator over a [`VmaList`].
pub struct Iter<'a> {
    list: &'a VmaList,
    cursor: Option<VmaHandle>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (VmaHandle, &'a Vma);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.cursor?;
        let node = self.list.node(handle)?;
        self.cursor = node.next;
        Some((handle, &node.vma))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vma(start: usize, end: usize) -> Vma {
        Vma { start, end, flags: VmaFlags::READ, file_offset: 0, file_len: 0 }
    }

    fn starts(list: &VmaList) -> Vec<usize> {
        list.iter().map(|(_, v)| v.start).collect()
    }

    #[test]
    fn inserts_keep_ascending_order() {
        let mut list = VmaList::new();
        list.insert(vma(0x5000, 0x6000)).expect("middle");
        list.insert(vma(0x1000, 0x2000)).expect("front");
        list.insert(vma(0x9000, 0xa000)).expect("back");
        list.insert(vma(0x3000, 0x4000)).expect("between");
        assert_eq!(starts(&list), vec![0x1000, 0x3000, 0x5000, 0x9000]);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn overlap_is_rejected_and_list_unchanged() {
        let mut list = VmaList::new();
        list.insert(vma(0x1000, 0x3000)).expect("first");
        let before = starts(&list);
        assert_eq!(
            list.insert(vma(0x2000, 0x4000)),
            Err(VmaError::Overlap { existing: vma(0x1000, 0x3000) })
        );
        assert_eq!(starts(&list), before);
        assert!(list.insert(vma(0x3000, 0x4000)).is_ok(), "adjacent ranges do not overlap");
    }

    #[test]
    fn empty_range_rejected() {
        let mut list = VmaList::new();
        assert_eq!(list.insert(vma(0x1000, 0x1000)), Err(VmaError::Empty));
    }

    #[test]
    fn find_uses_half_open_bounds() {
        let mut list = VmaList::new();
        let handle = list.insert(vma(0x1000, 0x2000)).expect("insert");
        assert_eq!(list.find(0x1000), Some(handle));
        assert_eq!(list.find(0x1fff), Some(handle));
        assert_eq!(list.find(0x2000), None);
        assert_eq!(list.find(0x0fff), None);
    }

    #[test]
    fn remove_relinks_neighbours_and_reuses_slots() {
        let mut list = VmaList::new();
        let a = list.insert(vma(0x1000, 0x2000)).expect("a");
        let b = list.insert(vma(0x2000, 0x3000)).expect("b");
        let c = list.insert(vma(0x3000, 0x4000)).expect("c");
        assert_eq!(list.remove(b), Some(vma(0x2000, 0x3000)));
        assert_eq!(list.next(a), Some(c));
        assert_eq!(list.prev(c), Some(a));
        assert_eq!(list.remove(b), None);
        let d = list.insert(vma(0x2000, 0x2800)).expect("d");
        assert_eq!(d, b, "vacant arena slot is reused");
        assert_eq!(starts(&list), vec![0x1000, 0x2000, 0x3000]);
        assert_eq!(list.remove(a), Some(vma(0x1000, 0x2000)));
        assert_eq!(list.head(), Some(d));
        assert_eq!(list.prev(d), None);
    }

    #[test]
    fn display_lists_permissions() {
        let v = Vma {
            start: 0x1000,
            end: 0x3000,
            flags: VmaFlags::READ | VmaFlags::EXEC,
            file_offset: 0x40,
            file_len: 0x1234,
        };
        assert_eq!(format!("{v}"), "[0x1000, 0x3000) r-x- off=0x40 len=0x1234");
    }
}
