// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs, errno constants
//! DEPENDS_ON: fs, mm::uaccess, task::fork, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; Linux RISC-V numbering; recoverable failures
//!             return -errno in a0, everything else is fatal
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod api;

use core::fmt;

use crate::fs::FsError;
use crate::mm::uaccess::UserAccessError;
use crate::task::ForkError;

/// Size of the dispatch window.
const MAX_SYSCALL: usize = 256;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Opens a path relative to a directory descriptor (only absolute paths are served).
pub const SYSCALL_OPENAT: usize = 56;
/// Releases a descriptor.
pub const SYSCALL_CLOSE: usize = 57;
/// Repositions a file offset.
pub const SYSCALL_LSEEK: usize = 62;
/// Reads from a descriptor into a user buffer.
pub const SYSCALL_READ: usize = 63;
/// Writes a user buffer to a descriptor.
pub const SYSCALL_WRITE: usize = 64;
/// Returns the current task PID.
pub const SYSCALL_GETPID: usize = 172;
/// Duplicates the caller; the parent sees the child PID, the child sees 0.
pub const SYSCALL_CLONE: usize = 220;

pub const EPERM: usize = 1;
pub const ENOENT: usize = 2;
pub const EIO: usize = 5;
pub const EBADF: usize = 9;
pub const EAGAIN: usize = 11;
pub const ENOMEM: usize = 12;
pub const EFAULT: usize = 14;
pub const EINVAL: usize = 22;
pub const EMFILE: usize = 24;

/// Encodes `code` the way user space expects a failed call in a0.
#[inline]
pub const fn errno(code: usize) -> usize {
    (-(code as isize)) as usize
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall(usize),
    /// Argument outside its accepted domain.
    InvalidArgument,
    /// File table or filesystem refused the request.
    Fs(FsError),
    /// User buffer could not be reached.
    User(UserAccessError),
    /// Process duplication failed.
    Fork(ForkError),
    /// Dispatch ran without a current user task.
    NoCurrentTask,
}

impl Error {
    /// Halting errors: they indicate a kernel bug or exhausted memory
    /// rather than a bad request.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvalidSyscall(_) | Self::NoCurrentTask => true,
            Self::User(err) => err.is_out_of_memory(),
            Self::Fork(err) => err.is_out_of_memory(),
            Self::InvalidArgument | Self::Fs(_) => false,
        }
    }

    /// Positive errno describing the failure.
    pub fn errno(&self) -> usize {
        match self {
            Self::InvalidSyscall(_) | Self::InvalidArgument => EINVAL,
            Self::Fs(err) => match err {
                FsError::NotFound | FsError::InvalidPath => ENOENT,
                FsError::InvalidFlags | FsError::InvalidSeek => EINVAL,
                FsError::BadFd => EBADF,
                FsError::NotReadable | FsError::NotWritable => EPERM,
                FsError::TooManyOpen => EMFILE,
                FsError::Io => EIO,
            },
            Self::User(UserAccessError::Unterminated { .. } | UserAccessError::InvalidUtf8) => EINVAL,
            Self::User(err) if err.is_out_of_memory() => ENOMEM,
            Self::User(_) => EFAULT,
            Self::Fork(ForkError::NoFreeSlot) => EAGAIN,
            Self::Fork(ForkError::OutOfMemory) => ENOMEM,
            Self::Fork(ForkError::NoAddressSpace) => EPERM,
            Self::Fork(_) => EINVAL,
            Self::NoCurrentTask => EPERM,
        }
    }

    /// Value placed in a0 for a recoverable failure.
    pub fn errno_value(&self) -> usize {
        errno(self.errno())
    }
}

impl From<FsError> for Error {
    fn from(value: FsError) -> Self {
        Self::Fs(value)
    }
}

impl From<UserAccessError> for Error {
    fn from(value: UserAccessError) -> Self {
        Self::User(value)
    }
}

impl From<ForkError> for Error {
    fn from(value: ForkError) -> Self {
        Self::Fork(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSyscall(number) => write!(f, "unknown syscall {number}"),
            Self::Fs(err) => write!(f, "{err}"),
            Self::User(err) => write!(f, "{err}"),
            Self::Fork(err) => write!(f, "fork: {err}"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Table with every kernel syscall registered.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        api::install_handlers(&mut table);
        table
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(&self, number: usize, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall(number))
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}
