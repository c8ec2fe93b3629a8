// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: File byte-stream abstraction, mount table and per-task file tables
//! OWNERS: @kernel-fs-team
//! PUBLIC API: File, Filesystem, MountTable, FilePerms, Whence, FsError,
//!             FileTable/SharedFiles (file_table), MemFs (memfs)
//! DEPENDS_ON: hal::Firmware (console streams)
//! INVARIANTS: Paths resolve to exactly one mount by longest prefix; the kernel never
//!             parses an on-disk format itself
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

pub mod file_table;
pub mod memfs;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

pub use file_table::{FileTable, SharedFiles};
pub use memfs::MemFs;

/// `open` access-mode mask.
pub const O_ACCMODE: usize = 0o3;
pub const O_RDONLY: usize = 0o0;
pub const O_WRONLY: usize = 0o1;
pub const O_RDWR: usize = 0o2;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Access granted to an open file.
    pub struct FilePerms: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl FilePerms {
    /// Derives permissions from `openat` flags.
    pub fn from_open_flags(flags: usize) -> Result<Self, FsError> {
        match flags & O_ACCMODE {
            O_RDONLY => Ok(Self::READ),
            O_WRONLY => Ok(Self::WRITE),
            O_RDWR => Ok(Self::READ | Self::WRITE),
            _ => Err(FsError::InvalidFlags),
        }
    }
}

/// Reference point of a seek.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(Self::Set),
            1 => Some(Self::Cur),
            2 => Some(Self::End),
            _ => None,
        }
    }
}

/// Errors produced by files, filesystems and file tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    /// No file under the path.
    NotFound,
    /// Path names no mount or no file inside it.
    InvalidPath,
    /// Unsupported access mode.
    InvalidFlags,
    /// Descriptor is out of range or not open.
    BadFd,
    /// Descriptor lacks read permission.
    NotReadable,
    /// Descriptor lacks write permission.
    NotWritable,
    /// Every descriptor slot is taken.
    TooManyOpen,
    /// Seek target is negative or the stream cannot seek.
    InvalidSeek,
    /// Backing store failed.
    Io,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotFound => "file not found",
            Self::InvalidPath => "invalid path",
            Self::InvalidFlags => "invalid open flags",
            Self::BadFd => "file not opened",
            Self::NotReadable => "file not readable",
            Self::NotWritable => "file not writable",
            Self::TooManyOpen => "no available fd",
            Self::InvalidSeek => "invalid seek",
            Self::Io => "i/o error",
        };
        f.write_str(text)
    }
}

/// Byte stream backing an open descriptor.
pub trait File: Send {
    /// Reads at the current offset and advances it.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError>;
    /// Writes at the current offset and advances it.
    fn write(&mut self, data: &[u8]) -> Result<usize, FsError>;
    /// Moves the offset and returns the new absolute position.
    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, FsError>;
}

/// Filesystem registered in the mount table.
pub trait Filesystem: Send + Sync {
    /// Opens `rel_path`, relative to the mount point.
    fn open(&self, rel_path: &str, perms: FilePerms) -> Result<Box<dyn File>, FsError>;
}

/// Mount points resolved by longest matching prefix.
#[derive(Default)]
pub struct MountTable {
    mounts: Vec<(String, Arc<dyn Filesystem>)>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `fs` at `path` (for example `/fat32`), replacing any
    /// filesystem mounted there before.
    pub fn mount(&mut self, path: &str, fs: Arc<dyn Filesystem>) {
        let key = String::from(path.trim_matches('/'));
        log_info!(target: "fs", "mount /{}", key);
        match self.mounts.iter_mut().find(|(mount, _)| *mount == key) {
            Some(entry) => entry.1 = fs,
            None => self.mounts.push((key, fs)),
        }
    }

    /// Finds the filesystem owning `path` and the path inside it.
    pub fn resolve<'a>(&'a self, path: &'a str) -> Result<(&'a dyn Filesystem, &'a str), FsError> {
        let path = path.trim_start_matches('/');
        let mut best: Option<(&Arc<dyn Filesystem>, usize)> = None;
        for (mount, fs) in &self.mounts {
            if mount.is_empty() || !path.starts_with(mount.as_str()) {
                continue;
            }
            let rest = &path[mount.len()..];
            if !rest.is_empty() && !rest.starts_with('/') {
                continue;
            }
            if best.map_or(true, |(_, best_len)| mount.len() > best_len) {
                best = Some((fs, mount.len()));
            }
        }
        let (fs, len) = best.ok_or(FsError::InvalidPath)?;
        let rel = path[len..].trim_start_matches('/');
        if rel.is_empty() {
            return Err(FsError::InvalidPath);
        }
        Ok((&**fs, rel))
    }

    /// Opens `path` through the owning filesystem.
    pub fn open(&self, path: &str, perms: FilePerms) -> Result<Box<dyn File>, FsError> {
        let (fs, rel) = self.resolve(path)?;
        fs.open(rel, perms)
    }
}
