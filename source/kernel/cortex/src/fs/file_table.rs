// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-task descriptor table.
//!
//! Slots 0..=2 are the console streams. A forked child shares the parent's
//! table through [`SharedFiles`], so descriptors opened by either side are
//! visible to both.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use spin::Mutex;

use super::{File, FilePerms, FsError, MountTable, Whence};
use crate::config::MAX_FILES;
use crate::hal::Firmware;

/// Table shared between a task and the children it forks.
pub type SharedFiles = Arc<Mutex<FileTable>>;

pub const STDIN: usize = 0;
pub const STDOUT: usize = 1;
pub const STDERR: usize = 2;

enum Stream {
    Stdin,
    Stdout,
    Stderr,
    File(Box<dyn File>),
}

struct OpenFile {
    perms: FilePerms,
    stream: Stream,
    path: String,
}

pub struct FileTable {
    slots: [Option<OpenFile>; MAX_FILES],
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    /// Table with every slot closed.
    pub fn new() -> Self {
        Self { slots: core::array::from_fn(|_| None) }
    }

    /// Table with stdin, stdout and stderr open.
    pub fn with_stdio() -> Self {
        let mut table = Self::new();
        table.slots[STDIN] = Some(OpenFile {
            perms: FilePerms::READ,
            stream: Stream::Stdin,
            path: String::from("<stdin>"),
        });
        table.slots[STDOUT] = Some(OpenFile {
            perms: FilePerms::WRITE,
            stream: Stream::Stdout,
            path: String::from("<stdout>"),
        });
        table.slots[STDERR] = Some(OpenFile {
            perms: FilePerms::WRITE,
            stream: Stream::Stderr,
            path: String::from("<stderr>"),
        });
        table
    }

    pub fn into_shared(self) -> SharedFiles {
        Arc::new(Mutex::new(self))
    }

    pub fn is_open(&self, fd: usize) -> bool {
        matches!(self.slots.get(fd), Some(Some(_)))
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Path the descriptor was opened with.
    pub fn path(&self, fd: usize) -> Option<&str> {
        self.slots.get(fd)?.as_ref().map(|file| file.path.as_str())
    }

    /// Opens `path` in the lowest free slot.
    pub fn open(&mut self, mounts: &MountTable, path: &str, flags: usize) -> Result<usize, FsError> {
        let fd = self.slots.iter().position(Option::is_none).ok_or(FsError::TooManyOpen)?;
        let perms = FilePerms::from_open_flags(flags)?;
        let file = mounts.open(path, perms)?;
        self.slots[fd] = Some(OpenFile { perms, stream: Stream::File(file), path: String::from(path) });
        log_debug!(target: "fs", "open {} -> fd {}", path, fd);
        Ok(fd)
    }

    pub fn close(&mut self, fd: usize) -> Result<(), FsError> {
        let slot = self.slots.get_mut(fd).ok_or(FsError::BadFd)?;
        match slot.take() {
            Some(file) => {
                log_debug!(target: "fs", "close fd {} ({})", fd, file.path);
                Ok(())
            }
            None => Err(FsError::BadFd),
        }
    }

    pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let file = self.get_mut(fd)?;
        if !file.perms.contains(FilePerms::READ) {
            return Err(FsError::NotReadable);
        }
        match &mut file.stream {
            // No input device is wired to the console.
            Stream::Stdin => Ok(0),
            Stream::Stdout | Stream::Stderr => Err(FsError::NotReadable),
            Stream::File(inner) => inner.read(buf),
        }
    }

    /// Writes `data`; console streams go to `console`.
    pub fn write<C: Firmware + ?Sized>(
        &mut self,
        fd: usize,
        data: &[u8],
        console: &mut C,
    ) -> Result<usize, FsError> {
        let file = self.get_mut(fd)?;
        if !file.perms.contains(FilePerms::WRITE) {
            return Err(FsError::NotWritable);
        }
        match &mut file.stream {
            Stream::Stdout | Stream::Stderr => {
                console.console_write(data);
                Ok(data.len())
            }
            Stream::Stdin => Err(FsError::NotWritable),
            Stream::File(inner) => inner.write(data),
        }
    }

    pub fn lseek(&mut self, fd: usize, offset: i64, whence: Whence) -> Result<u64, FsError> {
        match &mut self.get_mut(fd)?.stream {
            Stream::File(inner) => inner.seek(offset, whence),
            _ => Err(FsError::InvalidSeek),
        }
    }

    fn get_mut(&mut self, fd: usize) -> Result<&mut OpenFile, FsError> {
        self.slots.get_mut(fd).and_then(Option::as_mut).ok_or(FsError::BadFd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemFs, O_RDONLY, O_RDWR};
    use crate::hal::host::HostMachine;

    fn mounts() -> MountTable {
        let mut mounts = MountTable::new();
        mounts.mount("/fat32", Arc::new(MemFs::new().with_file("email", b"hello world")));
        mounts
    }

    #[test]
    fn stdio_is_preopened() {
        let mut table = FileTable::with_stdio();
        let mut console = HostMachine::new();
        assert_eq!(table.open_count(), 3);
        assert_eq!(table.write(STDOUT, b"out", &mut console), Ok(3));
        assert_eq!(table.write(STDERR, b"err", &mut console), Ok(3));
        assert_eq!(console.console(), b"outerr");
        let mut buf = [0u8; 4];
        assert_eq!(table.read(STDIN, &mut buf), Ok(0));
    }

    #[test]
    fn open_takes_lowest_free_slot() {
        let mounts = mounts();
        let mut table = FileTable::with_stdio();
        assert_eq!(table.open(&mounts, "/fat32/email", O_RDONLY), Ok(3));
        assert_eq!(table.open(&mounts, "/fat32/EMAIL", O_RDONLY), Ok(4));
        table.close(3).expect("close");
        assert_eq!(table.open(&mounts, "/fat32/email", O_RDONLY), Ok(3));
        assert_eq!(table.path(4), Some("/fat32/EMAIL"));
    }

    #[test]
    fn full_table_reports_too_many_open() {
        let mounts = mounts();
        let mut table = FileTable::with_stdio();
        for _ in 3..MAX_FILES {
            table.open(&mounts, "/fat32/email", O_RDONLY).expect("open");
        }
        assert_eq!(table.open(&mounts, "/fat32/email", O_RDONLY), Err(FsError::TooManyOpen));
    }

    #[test]
    fn permission_and_openness_are_checked() {
        let mounts = mounts();
        let mut table = FileTable::with_stdio();
        let mut console = HostMachine::new();
        let fd = table.open(&mounts, "/fat32/email", O_RDONLY).expect("open");
        assert_eq!(table.write(fd, b"x", &mut console), Err(FsError::NotWritable));
        assert_eq!(table.write(STDIN, b"x", &mut console), Err(FsError::NotWritable));
        assert_eq!(table.read(9, &mut [0u8; 1]), Err(FsError::BadFd));
        assert_eq!(table.close(9), Err(FsError::BadFd));
        assert_eq!(table.close(MAX_FILES + 1), Err(FsError::BadFd));
        assert_eq!(table.open(&mounts, "/fat32/missing", O_RDONLY), Err(FsError::NotFound));
    }

    #[test]
    fn seek_then_read() {
        let mounts = mounts();
        let mut table = FileTable::with_stdio();
        let fd = table.open(&mounts, "/fat32/email", O_RDWR).expect("open");
        assert_eq!(table.lseek(fd, -5, Whence::End), Ok(6));
        let mut buf = [0u8; 8];
        assert_eq!(table.read(fd, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"world");
        assert_eq!(table.lseek(STDOUT, 0, Whence::Set), Err(FsError::InvalidSeek));
    }
}
