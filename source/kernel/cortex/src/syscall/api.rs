// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: task::TaskTable, task::fork, mm::uaccess, fs::{FileTable, MountTable}, hal::Platform
//! INVARIANTS: Decode→Check→Execute; user memory is only touched through uaccess using the
//!             caller's own page table
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::vec;

use super::{
    Args, Error, SysResult, SyscallTable, SYSCALL_CLONE, SYSCALL_CLOSE, SYSCALL_GETPID,
    SYSCALL_LSEEK, SYSCALL_OPENAT, SYSCALL_READ, SYSCALL_WRITE,
};
use crate::config::{PAGE_SIZE, USER_END};
use crate::fs::{MountTable, SharedFiles, Whence};
use crate::hal::Platform;
use crate::mm::uaccess::{self, UserAccessError};
use crate::mm::{AddressSpace, FramePool, PageTable};
use crate::task::{self, TaskTable};
use crate::types::VirtAddr;

/// Longest path accepted by `openat`, terminator excluded.
const PATH_MAX: usize = 256;
/// Largest transfer served by one read or write; longer requests are short.
const IO_CHUNK_MAX: usize = 16 * PAGE_SIZE;

/// Kernel state a handler may touch while serving the current task.
pub struct Context<'a> {
    pub tasks: &'a mut TaskTable,
    pub frames: &'a mut FramePool,
    pub kernel_table: &'a PageTable,
    pub mounts: &'a MountTable,
    pub platform: &'a mut dyn Platform,
}

impl<'a> Context<'a> {
    /// Creates a new context for the current task.
    pub fn new(
        tasks: &'a mut TaskTable,
        frames: &'a mut FramePool,
        kernel_table: &'a PageTable,
        mounts: &'a MountTable,
        platform: &'a mut dyn Platform,
    ) -> Self {
        Self { tasks, frames, kernel_table, mounts, platform }
    }
}

// Typed decoders for Decode→Check→Execute

#[derive(Copy, Clone)]
struct IoArgsTyped {
    fd: usize,
    buf: VirtAddr,
    len: usize,
}

impl IoArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let raw = args.get(1);
        let buf = VirtAddr::new(raw).ok_or(UserAccessError::BadAddress { addr: raw, len: args.get(2) })?;
        Ok(Self { fd: args.get(0), buf, len: args.get(2).min(IO_CHUNK_MAX) })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        let end = self.buf.raw().checked_add(self.len);
        if self.len > 0 && end.map_or(true, |end| end > USER_END) {
            return Err(UserAccessError::BadAddress { addr: self.buf.raw(), len: self.len }.into());
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct OpenArgsTyped {
    path: VirtAddr,
    flags: usize,
}

impl OpenArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        // a0 carries the directory fd; only absolute paths are served.
        let raw = args.get(1);
        let path = VirtAddr::new(raw).ok_or(UserAccessError::BadAddress { addr: raw, len: 1 })?;
        Ok(Self { path, flags: args.get(2) })
    }
}

#[derive(Copy, Clone)]
struct SeekArgsTyped {
    fd: usize,
    offset: i64,
    whence: Whence,
}

impl SeekArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let whence = Whence::from_raw(args.get(2)).ok_or(Error::InvalidArgument)?;
        Ok(Self { fd: args.get(0), offset: args.get(1) as isize as i64, whence })
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_OPENAT, sys_openat);
    table.register(SYSCALL_CLOSE, sys_close);
    table.register(SYSCALL_LSEEK, sys_lseek);
    table.register(SYSCALL_READ, sys_read);
    table.register(SYSCALL_WRITE, sys_write);
    table.register(SYSCALL_GETPID, sys_getpid);
    table.register(SYSCALL_CLONE, sys_clone);
}

/// Address space and file table of the current task.
fn current_io(tasks: &mut TaskTable) -> Result<(&mut AddressSpace, SharedFiles), Error> {
    let task = tasks.current_mut().ok_or(Error::NoCurrentTask)?;
    let files = task.files().cloned().ok_or(Error::NoCurrentTask)?;
    let space = task.space_mut().ok_or(Error::NoCurrentTask)?;
    Ok((space, files))
}

fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.tasks.current_pid().as_raw() as usize)
}

fn sys_write(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = IoArgsTyped::decode(args)?;
    typed.check()?;
    let (space, files) = current_io(ctx.tasks)?;
    let mut data = vec![0u8; typed.len];
    uaccess::copy_from_user(space, ctx.frames, &mut *ctx.platform, typed.buf.raw(), &mut data)?;
    let written = files.lock().write(typed.fd, &data, &mut *ctx.platform)?;
    Ok(written)
}

fn sys_read(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = IoArgsTyped::decode(args)?;
    typed.check()?;
    let (space, files) = current_io(ctx.tasks)?;
    let mut data = vec![0u8; typed.len];
    let read = files.lock().read(typed.fd, &mut data)?;
    if let Err(err) = uaccess::copy_to_user(space, ctx.frames, &mut *ctx.platform, typed.buf.raw(), &data[..read]) {
        // Undelivered bytes stay in the stream.
        if read > 0 {
            let _ = files.lock().lseek(typed.fd, -(read as i64), Whence::Cur);
        }
        return Err(err.into());
    }
    Ok(read)
}

fn sys_openat(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = OpenArgsTyped::decode(args)?;
    let (space, files) = current_io(ctx.tasks)?;
    let path = uaccess::read_user_str(space, ctx.frames, &mut *ctx.platform, typed.path.raw(), PATH_MAX)?;
    let fd = files.lock().open(ctx.mounts, &path, typed.flags)?;
    Ok(fd)
}

fn sys_close(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let (_, files) = current_io(ctx.tasks)?;
    files.lock().close(args.get(0))?;
    Ok(0)
}

fn sys_lseek(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SeekArgsTyped::decode(args)?;
    let (_, files) = current_io(ctx.tasks)?;
    let result = files.lock().lseek(typed.fd, typed.offset, typed.whence);
    Ok(result? as usize)
}

fn sys_clone(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let fork_return = ctx.platform.fork_return_entry();
    let child = task::fork(ctx.tasks, ctx.frames, ctx.kernel_table, &mut *ctx.platform, fork_return)?;
    Ok(child.as_raw() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PHY_START;
    use crate::fs::{MemFs, O_RDONLY, O_RDWR};
    use crate::hal::host::{host_kernel_layout, HostMachine, USER_ENTRY};
    use crate::mm::ImageSource;
    use crate::syscall::{errno, EBADF, EFAULT, EIO, ENOENT};
    use crate::task::{create_user_task, Task};
    use crate::trap::REG_A0;
    use crate::types::Pid;
    use alloc::sync::Arc;

    const MSG: usize = 0x10;
    const PATH: usize = 0x20;
    const MISSING: usize = 0x40;
    const STACK_BUF: usize = USER_END - 64;

    struct World {
        tasks: TaskTable,
        frames: FramePool,
        kernel: PageTable,
        mounts: MountTable,
        machine: HostMachine,
        table: SyscallTable,
    }

    impl World {
        fn new() -> Self {
            let mut frames = FramePool::new(PHY_START + 0x10_0000, 128);
            let mut kernel = PageTable::new(&mut frames).expect("root");
            kernel.map_kernel(&mut frames, &host_kernel_layout()).expect("kernel");
            let mut image = vec![0u8; 0x80];
            image[MSG..MSG + 5].copy_from_slice(b"hello");
            image[PATH..PATH + 13].copy_from_slice(b"/fat32/email\0");
            image[MISSING..MISSING + 12].copy_from_slice(b"/fat32/none\0");
            let image: Arc<dyn ImageSource> = Arc::new(image);
            let task = create_user_task(Pid::from_raw(1), 5, &mut frames, &kernel, image, USER_ENTRY)
                .expect("task");
            let mut tasks = TaskTable::new(Task::idle());
            let _ = tasks.insert(task);
            assert!(tasks.set_current(1));
            let mut mounts = MountTable::new();
            mounts.mount("/fat32", Arc::new(MemFs::new().with_file("email", b"hello world")));
            Self { tasks, frames, kernel, mounts, machine: HostMachine::new(), table: SyscallTable::with_defaults() }
        }

        fn call(&mut self, number: usize, regs: [usize; 6]) -> SysResult<usize> {
            let mut ctx = Context::new(
                &mut self.tasks,
                &mut self.frames,
                &self.kernel,
                &self.mounts,
                &mut self.machine,
            );
            self.table.dispatch(number, &mut ctx, &Args::new(regs))
        }

        fn user_bytes(&mut self, addr: usize, len: usize) -> alloc::vec::Vec<u8> {
            let mut out = vec![0u8; len];
            let space = self.tasks.get_mut(1).and_then(Task::space_mut).expect("space");
            uaccess::copy_from_user(space, &mut self.frames, &mut self.machine, addr, &mut out).expect("read back");
            out
        }
    }

    #[test]
    fn getpid_reports_current_slot() {
        let mut world = World::new();
        assert_eq!(world.call(SYSCALL_GETPID, [0; 6]), Ok(1));
    }

    #[test]
    fn write_to_stdout_reaches_console() {
        let mut world = World::new();
        assert_eq!(world.call(SYSCALL_WRITE, [1, MSG, 5, 0, 0, 0]), Ok(5));
        assert_eq!(world.machine.console(), b"hello");
    }

    #[test]
    fn open_read_seek_close() {
        let mut world = World::new();
        let fd = world.call(SYSCALL_OPENAT, [(-100isize) as usize, PATH, O_RDWR, 0, 0, 0]).expect("open");
        assert_eq!(fd, 3);
        assert_eq!(world.call(SYSCALL_READ, [fd, STACK_BUF, 5, 0, 0, 0]), Ok(5));
        assert_eq!(world.user_bytes(STACK_BUF, 5), b"hello");
        assert_eq!(world.call(SYSCALL_LSEEK, [fd, (-5isize) as usize, 2, 0, 0, 0]), Ok(6));
        assert_eq!(world.call(SYSCALL_READ, [fd, STACK_BUF, 64, 0, 0, 0]), Ok(5));
        assert_eq!(world.user_bytes(STACK_BUF, 5), b"world");
        assert_eq!(world.call(SYSCALL_CLOSE, [fd, 0, 0, 0, 0, 0]), Ok(0));
        let err = world.call(SYSCALL_CLOSE, [fd, 0, 0, 0, 0, 0]).expect_err("closed");
        assert_eq!(err.errno_value(), errno(EBADF));
    }

    #[test]
    fn missing_file_is_enoent() {
        let mut world = World::new();
        let err = world.call(SYSCALL_OPENAT, [0, MISSING, O_RDONLY, 0, 0, 0]).expect_err("missing");
        assert_eq!(err.errno(), ENOENT);
        assert!(!err.is_fatal());
    }

    #[test]
    fn kernel_pointer_is_efault() {
        let mut world = World::new();
        let err = world.call(SYSCALL_WRITE, [1, crate::config::VM_START, 4, 0, 0, 0]).expect_err("efault");
        assert_eq!(err.errno(), EFAULT);
        assert!(world.machine.console().is_empty());
    }

    #[test]
    fn failed_read_copy_keeps_file_offset() {
        let mut world = World::new();
        let fd = world.call(SYSCALL_OPENAT, [(-100isize) as usize, PATH, O_RDONLY, 0, 0, 0]).expect("open");
        let unmapped = 0x10_0000;
        let err = world.call(SYSCALL_READ, [fd, unmapped, 5, 0, 0, 0]).expect_err("efault");
        assert_eq!(err.errno(), EFAULT);
        assert!(!err.is_fatal());
        assert_eq!(world.call(SYSCALL_READ, [fd, STACK_BUF, 5, 0, 0, 0]), Ok(5));
        assert_eq!(world.user_bytes(STACK_BUF, 5), b"hello");
    }

    #[test]
    fn write_past_file_size_cap_is_eio() {
        let mut world = World::new();
        let fd = world.call(SYSCALL_OPENAT, [(-100isize) as usize, PATH, O_RDWR, 0, 0, 0]).expect("open");
        assert_eq!(world.call(SYSCALL_LSEEK, [fd, 1 << 62, 0, 0, 0, 0]), Ok(1 << 62));
        let err = world.call(SYSCALL_WRITE, [fd, MSG, 1, 0, 0, 0]).expect_err("eio");
        assert_eq!(err.errno(), EIO);
        assert!(!err.is_fatal());
    }

    #[test]
    fn bad_whence_is_einval() {
        let mut world = World::new();
        let err = world.call(SYSCALL_LSEEK, [3, 0, 9, 0, 0, 0]).expect_err("whence");
        assert_eq!(err, Error::InvalidArgument);
    }

    #[test]
    fn clone_returns_child_pid() {
        let mut world = World::new();
        assert_eq!(world.call(SYSCALL_CLONE, [0; 6]), Ok(2));
        let child = world.tasks.get(2).expect("child");
        assert_eq!(child.frame().x[REG_A0], 0);
        assert!(world.machine.full_flushes() >= 1);
    }

    #[test]
    fn unknown_number_is_fatal() {
        let mut world = World::new();
        let err = world.call(999, [0; 6]).expect_err("unknown");
        assert_eq!(err, Error::InvalidSyscall(999));
        assert!(err.is_fatal());
    }
}
