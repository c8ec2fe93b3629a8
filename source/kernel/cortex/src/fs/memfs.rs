// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory filesystem with a flat, case-insensitive namespace.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{File, FilePerms, Filesystem, FsError, Whence};

type Contents = Arc<Mutex<Vec<u8>>>;

/// Largest size a write may grow a file to.
pub const MEMFS_MAX_FILE: u64 = 1 << 20;

#[derive(Default)]
pub struct MemFs {
    files: Mutex<Vec<(String, Contents)>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MemFs::insert`].
    pub fn with_file(self, name: &str, bytes: &[u8]) -> Self {
        self.insert(name, bytes);
        self
    }

    /// Creates or replaces `name`.
    pub fn insert(&self, name: &str, bytes: &[u8]) {
        let mut files = self.files.lock();
        match files.iter_mut().find(|(existing, _)| existing.eq_ignore_ascii_case(name)) {
            Some((_, contents)) => *contents.lock() = bytes.to_vec(),
            None => files.push((String::from(name), Arc::new(Mutex::new(bytes.to_vec())))),
        }
    }

    /// Current content of `name`.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.lookup(name).map(|contents| contents.lock().clone())
    }

    fn lookup(&self, name: &str) -> Option<Contents> {
        self.files
            .lock()
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, contents)| Arc::clone(contents))
    }
}

impl Filesystem for MemFs {
    fn open(&self, rel_path: &str, _perms: FilePerms) -> Result<Box<dyn File>, FsError> {
        if rel_path.contains('/') {
            return Err(FsError::InvalidPath);
        }
        let data = self.lookup(rel_path).ok_or(FsError::NotFound)?;
        Ok(Box::new(MemFile { data, pos: 0 }))
    }
}

struct MemFile {
    data: Contents,
    pos: u64,
}

impl File for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let data = self.data.lock();
        let start = (self.pos as usize).min(data.len());
        let end = start.saturating_add(buf.len()).min(data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&data[start..end]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, FsError> {
        let mut data = self.data.lock();
        let end = self.pos.checked_add(bytes.len() as u64).ok_or(FsError::Io)?;
        if end > MEMFS_MAX_FILE {
            return Err(FsError::Io);
        }
        let (start, end) = (self.pos as usize, end as usize);
        if data.len() < end {
            let len = data.len();
            data.try_reserve(end - len).map_err(|_| FsError::Io)?;
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        self.pos = end as u64;
        Ok(bytes.len())
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, FsError> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.pos as i64,
            Whence::End => self.data.lock().len() as i64,
        };
        let target = base.checked_add(offset).ok_or(FsError::InvalidSeek)?;
        if target < 0 {
            return Err(FsError::InvalidSeek);
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
