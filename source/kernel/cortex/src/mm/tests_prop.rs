// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for page tables and the VMA list
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCENARIOS:
//!   - mapped_pages_translate(): every page of a mapping translates with its offset kept
//!     and its leaf carries exactly the requested permissions plus VALID
//!   - vma_list_stays_sorted_and_disjoint(): random inserts never produce overlap
//!   - overlapping_insert_leaves_list_unchanged(): a rejected insert changes nothing

use super::{FramePool, PageFlags, PageTable, Vma, VmaError, VmaFlags, VmaList, PAGE_SIZE};
use crate::config::PHY_START;
use proptest::prelude::*;

proptest! {
    #[test]
    fn mapped_pages_translate(
        vpn in 0usize..(1 << 20),
        pages in 1usize..8,
        offset in 0usize..PAGE_SIZE,
        rwx in 1usize..8,
        user in any::<bool>(),
    ) {
        let mut pool = FramePool::new(PHY_START, 16);
        let mut table = PageTable::new(&mut pool).unwrap();
        let va = vpn * PAGE_SIZE;
        let pa = 0x9000_0000;
        let mut perm = PageFlags::from_bits_truncate(rwx << 1);
        if user {
            perm |= PageFlags::USER;
        }
        table.create_mapping(&mut pool, va, pa, pages * PAGE_SIZE, perm).unwrap();
        for page in 0..pages {
            let addr = va + page * PAGE_SIZE + offset;
            prop_assert_eq!(table.translate(&pool, addr), Some(pa + page * PAGE_SIZE + offset));
            let leaf = table.find_pte(&pool, addr).unwrap().load(&pool);
            prop_assert_eq!(leaf.flags(), perm | PageFlags::VALID);
            prop_assert_eq!(leaf.frame().addr(), pa + page * PAGE_SIZE);
        }
        prop_assert_eq!(table.translate(&pool, va + pages * PAGE_SIZE), None);
    }

    #[test]
    fn vma_list_stays_sorted_and_disjoint(ranges in proptest::collection::vec((0usize..64, 1usize..8), 1..24)) {
        let mut list = VmaList::new();
        for (page, len) in ranges {
            let start = page * PAGE_SIZE;
            let vma = Vma { start, end: start + len * PAGE_SIZE, flags: VmaFlags::READ, file_offset: 0, file_len: 0 };
            let _ = list.insert(vma);
        }
        let spans: Vec<(usize, usize)> = list.iter().map(|(_, vma)| (vma.start, vma.end)).collect();
        prop_assert_eq!(spans.len(), list.len());
        for pair in spans.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0);
        }
    }

    #[test]
    fn overlapping_insert_leaves_list_unchanged(
        ranges in proptest::collection::vec((0usize..64, 1usize..8), 1..16),
        extra in (0usize..64, 1usize..8),
    ) {
        let vma = |(page, len): (usize, usize)| Vma {
            start: page * PAGE_SIZE,
            end: (page + len) * PAGE_SIZE,
            flags: VmaFlags::READ,
            file_offset: 0,
            file_len: 0,
        };
        let mut list = VmaList::new();
        for range in ranges {
            let _ = list.insert(vma(range));
        }
        let candidate = vma(extra);
        let overlaps = list.iter().any(|(_, v)| v.overlaps(candidate.start, candidate.end));
        prop_assume!(overlaps);
        let before: Vec<Vma> = list.iter().map(|(_, v)| *v).collect();
        let len = list.len();
        let rejected = matches!(list.insert(candidate), Err(VmaError::Overlap { .. }));
        prop_assert!(rejected);
        let after: Vec<Vma> = list.iter().map(|(_, v)| *v).collect();
        prop_assert_eq!(after, before);
        prop_assert_eq!(list.len(), len);
    }
}
