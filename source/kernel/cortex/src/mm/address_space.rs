// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-task address space: page table, VMA list and backing image
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace (find_vma/map_region/teardown/dump_vmas), ImageSource
//! DEPENDS_ON: mm::page_table, mm::vma, mm::frame
//! INVARIANTS: VMAs lie inside [USER_START, USER_END); map_region never touches the page
//!             table (physical backing appears on first fault)
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;

use super::frame::FramePool;
use super::page_table::PageTable;
use super::vma::{Vma, VmaError, VmaFlags, VmaList};
use super::PAGE_SIZE;
use crate::config::{USER_END, USER_START};

/// Byte stream backing file-backed VMAs (the loaded program image).
pub trait ImageSource: Send + Sync {
    fn as_bytes(&self) -> &[u8];

    /// Copies up to `buf.len()` bytes starting at `offset`; returns the count.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let bytes = self.as_bytes();
        if offset >= bytes.len() {
            return 0;
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        n
    }
}

impl<T: AsRef<[u8]> + Send + Sync> ImageSource for T {
    fn as_bytes(&self) -> &[u8] {
        self.as_ref()
    }
}

/// Address space owned by exactly one task.
pub struct AddressSpace {
    table: PageTable,
    vmas: VmaList,
    image: Option<Arc<dyn ImageSource>>,
}

impl AddressSpace {
    /// Wraps a page table (normally a duplicate of the kernel table).
    pub fn new(table: PageTable) -> Self {
        Self { table, vmas: VmaList::new(), image: None }
    }

    pub fn with_image(table: PageTable, image: Arc<dyn ImageSource>) -> Self {
        Self { table, vmas: VmaList::new(), image: Some(image) }
    }

    pub fn image(&self) -> Option<&Arc<dyn ImageSource>> {
        self.image.as_ref()
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    pub fn vmas(&self) -> &VmaList {
        &self.vmas
    }

    pub fn satp(&self) -> usize {
        self.table.satp()
    }

    /// Returns the VMA containing `addr`.
    pub fn find_vma(&self, addr: usize) -> Option<&Vma> {
        self.vmas.find(addr).and_then(|handle| self.vmas.get(handle))
    }

    /// Records a promise to back `[addr, addr + len)`; returns `addr`.
    pub fn map_region(
        &mut self,
        addr: usize,
        len: usize,
        file_offset: usize,
        file_len: usize,
        flags: VmaFlags,
    ) -> Result<usize, VmaError> {
        let end = addr.checked_add(len).ok_or(VmaError::OutOfRange { start: addr, len })?;
        if addr < USER_START || end > USER_END {
            return Err(VmaError::OutOfRange { start: addr, len });
        }
        if addr % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
            return Err(VmaError::Unaligned { start: addr, len });
        }
        let vma = Vma { start: addr, end, flags, file_offset, file_len };
        match self.vmas.insert(vma) {
            Ok(_) => {
                log_debug!(target: "mm", "VMA-MAP: {}", vma);
                Ok(addr)
            }
            Err(err) => {
                log_warn!(target: "mm", "VMA-MAP: rejected {}: {}", vma, err);
                Err(err)
            }
        }
    }

    /// Drops every user frame mapped under a VMA and frees the page tables.
    pub fn teardown(self, pool: &mut FramePool) {
        for (_, vma) in self.vmas.iter() {
            let mut page = vma.start;
            while page < vma.end {
                if let Some(pte) = self.table.entry(pool, page) {
                    let _ = pool.release(pte.frame());
                }
                page += PAGE_SIZE;
            }
        }
        self.table.release_tables(pool);
    }

    /// Formats every VMA, one per line, for fatal diagnostics.
    pub fn dump_vmas(&self) -> VmaDump<'_> {
        VmaDump { vmas: &self.vmas }
    }
}

/// Display adapter returned by [`AddressSpace::dump_vmas`].
pub struct VmaDump<'a> {
    vmas: &'a VmaList,
}

impl fmt::Display for VmaDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.vmas.is_empty() {
            return f.write_str("  <no vmas>");
        }
        for (i, (_, vma)) in self.vmas.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "  {vma}")?;
        }
        Ok(())
    }
}
