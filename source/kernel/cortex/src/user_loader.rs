// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program image loader; turns ELF PT_LOAD segments into VMAs
//! OWNERS: @kernel-team
//! PUBLIC API: parse_segments(bytes), load_program(space, bytes), is_elf(bytes),
//!             ElfImage, LoadSegment, SegmentFlags, UserLoadError
//! DEPENDS_ON: mm::AddressSpace (map_region)
//! INVARIANTS: Loading only records VMAs; no frame is allocated until the first fault.
//!             VMA file offsets are adjusted so page starts line up with image bytes
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::config::{PAGE_SIZE, USER_START};
use crate::mm::{page_round_down, page_round_up, AddressSpace, VmaError, VmaFlags};

const PT_LOAD: u32 = 1;
const EHDR_LEN: usize = 64;
const PHDR_LEN: usize = 56;

bitflags! {
    /// `p_flags` of a program header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const X = 1;
        const W = 2;
        const R = 4;
    }
}

/// Errors surfaced while loading a user ELF image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserLoadError {
    /// Input was shorter than required for the ELF header or program headers.
    Truncated,
    /// ELF magic was not present.
    InvalidElf,
    /// ELF class was not 64-bit.
    WrongClass,
    /// ELF encoding was not little-endian.
    WrongEndian,
    /// Program header table fields were out of range.
    BadPhTable,
    /// Segment bounds were invalid or overflowed.
    SegmentOutOfRange,
    /// The address space refused a segment.
    Vma(VmaError),
}

impl From<VmaError> for UserLoadError {
    fn from(value: VmaError) -> Self {
        Self::Vma(value)
    }
}

impl fmt::Display for UserLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vma(err) => write!(f, "segment rejected: {err}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// One loadable segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadSegment {
    pub vaddr: usize,
    pub mem_size: usize,
    pub file_size: usize,
    pub offset: usize,
    pub flags: SegmentFlags,
}

/// Entry point plus loadable segments of an ELF image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfImage {
    pub entry: usize,
    pub segments: Vec<LoadSegment>,
}

/// True when `bytes` starts with the ELF magic.
pub fn is_elf(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[0..4] == b"\x7FELF"
}

/// Reads the header and PT_LOAD program headers of an ELF64 LE image.
pub fn parse_segments(bytes: &[u8]) -> Result<ElfImage, UserLoadError> {
    if bytes.len() < EHDR_LEN {
        return Err(UserLoadError::Truncated);
    }
    if !is_elf(bytes) {
        return Err(UserLoadError::InvalidElf);
    }
    if bytes[4] != 2 {
        return Err(UserLoadError::WrongClass);
    }
    if bytes[5] != 1 {
        return Err(UserLoadError::WrongEndian);
    }
    let entry = le_u64(&bytes[24..32]) as usize;
    let phoff = le_u64(&bytes[32..40]) as usize;
    let phentsize = le_u16(&bytes[54..56]) as usize;
    let phnum = le_u16(&bytes[56..58]) as usize;
    if phnum > 0 && (phentsize < PHDR_LEN || phoff >= bytes.len()) {
        return Err(UserLoadError::BadPhTable);
    }

    let mut segments = Vec::new();
    for i in 0..phnum {
        let off = phoff
            .checked_add(i * phentsize)
            .ok_or(UserLoadError::BadPhTable)?;
        let ph = bytes.get(off..off + PHDR_LEN).ok_or(UserLoadError::Truncated)?;
        if le_u32(&ph[0..4]) != PT_LOAD {
            continue;
        }
        let segment = LoadSegment {
            flags: SegmentFlags::from_bits_truncate(le_u32(&ph[4..8])),
            offset: le_u64(&ph[8..16]) as usize,
            vaddr: le_u64(&ph[16..24]) as usize,
            file_size: le_u64(&ph[32..40]) as usize,
            mem_size: le_u64(&ph[40..48]) as usize,
        };
        let file_end = segment
            .offset
            .checked_add(segment.file_size)
            .ok_or(UserLoadError::SegmentOutOfRange)?;
        if file_end > bytes.len() || segment.file_size > segment.mem_size {
            return Err(UserLoadError::SegmentOutOfRange);
        }
        segments.push(segment);
    }
    Ok(ElfImage { entry, segments })
}

/// Records one VMA per segment of `image` in `space` and returns the entry
/// point. Images without the ELF magic are mapped whole at `USER_START`.
pub fn load_program(space: &mut AddressSpace, image: &[u8]) -> Result<usize, UserLoadError> {
    if !is_elf(image) {
        let len = page_round_up(image.len().max(1)).ok_or(UserLoadError::SegmentOutOfRange)?;
        space.map_region(USER_START, len, 0, image.len(), VmaFlags::READ | VmaFlags::WRITE | VmaFlags::EXEC)?;
        log_debug!(target: "loader", "raw image of {} bytes at 0x{:x}", image.len(), USER_START);
        return Ok(USER_START);
    }

    let elf = parse_segments(image)?;
    for segment in elf.segments.iter().filter(|s| s.mem_size > 0) {
        map_segment(space, segment)?;
    }
    log_debug!(
        target: "loader",
        "ELF entry=0x{:x} segments={}",
        elf.entry,
        elf.segments.len()
    );
    Ok(elf.entry)
}

fn map_segment(space: &mut AddressSpace, segment: &LoadSegment) -> Result<(), UserLoadError> {
    let start = page_round_down(segment.vaddr);
    let lead = segment.vaddr - start;
    let file_offset = segment.offset.checked_sub(lead).ok_or(UserLoadError::SegmentOutOfRange)?;
    let mem_end = segment
        .vaddr
        .checked_add(segment.mem_size)
        .ok_or(UserLoadError::SegmentOutOfRange)?;
    let end = page_round_up(mem_end).ok_or(UserLoadError::SegmentOutOfRange)?;

    let mut flags = VmaFlags::empty();
    if segment.flags.contains(SegmentFlags::R) {
        flags |= VmaFlags::READ;
    }
    if segment.flags.contains(SegmentFlags::W) {
        flags |= VmaFlags::WRITE;
    }
    if segment.flags.contains(SegmentFlags::X) {
        flags |= VmaFlags::EXEC;
    }
    let file_len = if segment.file_size == 0 {
        flags |= VmaFlags::ANON;
        0
    } else {
        segment.file_size + lead
    };
    space.map_region(start, end - start, file_offset, file_len, flags)?;
    Ok(())
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    u64::from_le_bytes(raw)
}

/// Builds a minimal ELF64 LE image; used by tests across the crate.
#[cfg(test)]
pub(crate) fn build_elf(entry: usize, segments: &[LoadSegment], payload: &[u8]) -> Vec<u8> {
    let mut out = alloc::vec![0u8; EHDR_LEN + segments.len() * PHDR_LEN];
    out[0..4].copy_from_slice(b"\x7FELF");
    out[4] = 2;
    out[5] = 1;
    out[6] = 1;
    out[24..32].copy_from_slice(&(entry as u64).to_le_bytes());
    out[32..40].copy_from_slice(&(EHDR_LEN as u64).to_le_bytes());
    out[52..54].copy_from_slice(&(EHDR_LEN as u16).to_le_bytes());
    out[54..56].copy_from_slice(&(PHDR_LEN as u16).to_le_bytes());
    out[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes());
    for (i, s) in segments.iter().enumerate() {
        let ph = &mut out[EHDR_LEN + i * PHDR_LEN..EHDR_LEN + (i + 1) * PHDR_LEN];
        ph[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        ph[4..8].copy_from_slice(&s.flags.bits().to_le_bytes());
        ph[8..16].copy_from_slice(&(s.offset as u64).to_le_bytes());
        ph[16..24].copy_from_slice(&(s.vaddr as u64).to_le_bytes());
        ph[24..32].copy_from_slice(&(s.vaddr as u64).to_le_bytes());
        ph[32..40].copy_from_slice(&(s.file_size as u64).to_le_bytes());
        ph[40..48].copy_from_slice(&(s.mem_size as u64).to_le_bytes());
        ph[48..56].copy_from_slice(&(PAGE_SIZE as u64).to_le_bytes());
    }
    out.extend_from_slice(payload);
    out
}
