// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process duplication with copy-on-write sharing of user frames
//! OWNERS: @kernel-team
//! PUBLIC API: fork(), ForkError
//! DEPENDS_ON: mm (page tables, frame reference counts), hal::Tlb
//! INVARIANTS: After fork every user page present in the parent is mapped read-only in
//!             both tasks and its frame reference count went up by one; the child resumes
//!             after the ecall with a0 = 0

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;

use super::{stash_frame, KernelStack, Task, TaskContext, TaskTable};
use crate::config::PAGE_SIZE;
use crate::hal::Tlb;
use crate::mm::{AddressSpace, FrameError, FramePool, MapError, PageFlags, PageTable, VmaError};
use crate::trap::{REG_A0, REG_SP};
use crate::types::Pid;

/// Reasons a fork can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkError {
    /// Every task slot is taken.
    NoFreeSlot,
    /// Frames ran out while building the child.
    OutOfMemory,
    /// Page-table update failed for another reason.
    Map(MapError),
    /// Child VMA list rejected a parent region.
    Vma(VmaError),
    /// The caller is a kernel-only task.
    NoAddressSpace,
    /// No task is marked current.
    NoCurrent,
}

impl ForkError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}

impl From<MapError> for ForkError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::OutOfMemory,
            other => Self::Map(other),
        }
    }
}

impl From<FrameError> for ForkError {
    fn from(value: FrameError) -> Self {
        MapError::from(value).into()
    }
}

impl From<VmaError> for ForkError {
    fn from(value: VmaError) -> Self {
        Self::Vma(value)
    }
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFreeSlot => f.write_str("task table full"),
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::Map(err) => write!(f, "{err}"),
            Self::Vma(err) => write!(f, "{err}"),
            Self::NoAddressSpace => f.write_str("caller has no address space"),
            Self::NoCurrent => f.write_str("no current task"),
        }
    }
}

/// Duplicates the current task into the lowest free slot.
///
/// The child gets its own kernel stack, a fresh copy of the kernel mappings
/// and the parent's VMAs. Present user pages are shared read-only; the first
/// store from either side splits them in the fault path. Returns the child
/// PID, which the caller hands back to the parent.
pub fn fork<T: Tlb + ?Sized>(
    tasks: &mut TaskTable,
    pool: &mut FramePool,
    kernel_table: &PageTable,
    tlb: &mut T,
    fork_return: usize,
) -> Result<Pid, ForkError> {
    let slot = tasks.free_slot().ok_or(ForkError::NoFreeSlot)?;
    let parent = tasks.current().ok_or(ForkError::NoCurrent)?;
    let parent_space = parent.space().ok_or(ForkError::NoAddressSpace)?;
    let parent_pid = parent.pid();
    let child_pid = Pid::from_raw(slot as u32);

    let mut child = Task::new(child_pid, parent.priority());
    child.counter = parent.counter();
    child.files = parent.files().cloned();

    let stack = KernelStack::alloc(pool)?;
    child.kernel_stack = Some(stack);
    let table = match kernel_table.duplicate_root(pool) {
        Ok(table) => table,
        Err(err) => {
            child.release(pool);
            return Err(err.into());
        }
    };
    let mut space = match parent_space.image() {
        Some(image) => AddressSpace::with_image(table, Arc::clone(image)),
        None => AddressSpace::new(table),
    };
    let shared = share_user_pages(parent_space, &mut space, pool);
    child.space = Some(space);
    if let Err(err) = shared {
        child.release(pool);
        // Parent pages already downgraded stay read-only; the fault path
        // reclaims them in place once their count is back to one.
        tlb.flush_all();
        return Err(err);
    }
    tlb.flush_all();

    let mut frame = *parent.frame();
    frame.x[REG_A0] = 0;
    frame.sepc += 4;
    child.frame = frame;
    let sp = match stash_frame(pool, stack, &frame) {
        Ok(sp) => sp,
        Err(err) => {
            child.release(pool);
            return Err(err.into());
        }
    };
    child.context = TaskContext {
        ra: fork_return,
        sp,
        sepc: frame.sepc,
        sstatus: frame.sstatus,
        sscratch: frame.x[REG_SP],
        ..TaskContext::default()
    };

    match tasks.insert(child) {
        Ok(pid) => {
            log_info!(target: "fork", "[PID = {}] forked from [PID = {}]", pid, parent_pid);
            Ok(pid)
        }
        Err(child) => {
            child.release(pool);
            Err(ForkError::NoFreeSlot)
        }
    }
}

/// Mirrors every parent VMA into `child` and maps each present page into
/// both tables without write permission.
fn share_user_pages(
    parent: &AddressSpace,
    child: &mut AddressSpace,
    pool: &mut FramePool,
) -> Result<(), ForkError> {
    for (_, vma) in parent.vmas().iter() {
        child.map_region(vma.start, vma.len(), vma.file_offset, vma.file_len, vma.flags)?;
        let mut page = vma.start;
        while page < vma.end {
            let present = parent
                .page_table()
                .find_pte(pool, page)
                .map(|slot| (slot, slot.load(pool)))
                .filter(|(_, pte)| pte.is_valid());
            if let Some((slot, pte)) = present {
                let readonly = pte.flags().difference(PageFlags::WRITE);
                let frame = pte.frame();
                pool.share(frame)?;
                if let Err(err) =
                    child.page_table_mut().create_mapping(pool, page, frame.addr(), PAGE_SIZE, readonly)
                {
                    let _ = pool.release(frame);
                    return Err(err.into());
                }
                slot.store(pool, pte.with_flags(readonly))?;
            }
            page += PAGE_SIZE;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PHY_START, USER_END};
    use crate::hal::host::{host_kernel_layout, HostMachine, FORK_RETURN_ENTRY, USER_ENTRY};
    use crate::mm::fault::{self, FaultKind};
    use crate::mm::ImageSource;
    use crate::task::create_user_task;
    use crate::types::Pid;
    use alloc::vec;

    struct Fixture {
        pool: FramePool,
        kernel: PageTable,
        tasks: TaskTable,
        machine: HostMachine,
    }

    fn fixture() -> Fixture {
        let mut pool = FramePool::new(PHY_START + 0x10_0000, 128);
        let mut kernel = PageTable::new(&mut pool).expect("root");
        kernel.map_kernel(&mut pool, &host_kernel_layout()).expect("kernel");
        let image: Arc<dyn ImageSource> = Arc::new(vec![0x13u8; 32]);
        let task = create_user_task(Pid::from_raw(1), 3, &mut pool, &kernel, image, USER_ENTRY)
            .expect("task");
        let mut tasks = TaskTable::new(Task::idle());
        let _ = tasks.insert(task);
        assert!(tasks.set_current(1));
        let mut machine = HostMachine::new();
        let space = tasks.get_mut(1).and_then(Task::space_mut).expect("space");
        let _ = fault::resolve(space, &mut pool, &mut machine, USER_END - 8, FaultKind::Store)
            .expect("stack page");
        Fixture { pool, kernel, tasks, machine }
    }

    #[test]
    fn child_shares_present_pages_read_only() {
        let mut fx = fixture();
        let stack_page = USER_END - PAGE_SIZE;
        let child = fork(&mut fx.tasks, &mut fx.pool, &fx.kernel, &mut fx.machine, FORK_RETURN_ENTRY)
            .expect("fork");
        assert_eq!(child, Pid::from_raw(2));

        let parent_pte = fx.tasks.get(1).and_then(Task::space).and_then(|s| s.page_table().entry(&fx.pool, stack_page));
        let child_pte = fx.tasks.get(2).and_then(Task::space).and_then(|s| s.page_table().entry(&fx.pool, stack_page));
        let (parent_pte, child_pte) = (parent_pte.expect("parent"), child_pte.expect("child"));
        assert_eq!(parent_pte.frame(), child_pte.frame());
        assert!(!parent_pte.flags().contains(PageFlags::WRITE));
        assert!(!child_pte.flags().contains(PageFlags::WRITE));
        assert_eq!(fx.pool.refcount(parent_pte.frame()), Ok(2));
        assert_eq!(fx.machine.full_flushes(), 1);
    }

    #[test]
    fn child_resumes_after_ecall_with_zero() {
        let mut fx = fixture();
        if let Some(parent) = fx.tasks.get_mut(1) {
            parent.frame_mut().sepc = 0x1_0040;
            parent.frame_mut().x[REG_A0] = 220;
            parent.set_counter(6);
        }
        let pid = fork(&mut fx.tasks, &mut fx.pool, &fx.kernel, &mut fx.machine, FORK_RETURN_ENTRY)
            .expect("fork");
        let child = fx.tasks.get(pid.as_index()).expect("child");
        assert_eq!(child.frame().x[REG_A0], 0);
        assert_eq!(child.frame().sepc, 0x1_0044);
        assert_eq!(child.context().ra, FORK_RETURN_ENTRY);
        assert_eq!(child.counter(), 6);
        assert_eq!(child.priority(), 3);
        let parent_files = fx.tasks.get(1).and_then(Task::files).expect("files");
        assert!(Arc::ptr_eq(parent_files, child.files().expect("child files")));
    }

    #[test]
    fn full_table_is_reported() {
        let mut fx = fixture();
        for _ in 2..crate::config::NR_TASKS {
            fork(&mut fx.tasks, &mut fx.pool, &fx.kernel, &mut fx.machine, FORK_RETURN_ENTRY)
                .expect("fork");
        }
        assert_eq!(
            fork(&mut fx.tasks, &mut fx.pool, &fx.kernel, &mut fx.machine, FORK_RETURN_ENTRY),
            Err(ForkError::NoFreeSlot)
        );
    }

    #[test]
    fn kernel_only_task_cannot_fork() {
        let mut fx = fixture();
        assert!(fx.tasks.set_current(0));
        assert_eq!(
            fork(&mut fx.tasks, &mut fx.pool, &fx.kernel, &mut fx.machine, FORK_RETURN_ENTRY),
            Err(ForkError::NoAddressSpace)
        );
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn exhausted_pool_leaves_no_leak() {
        let mut fx = fixture();
        let free = fx.pool.free_frames();
        fx.pool.fail_allocs_after(3);
        let err = fork(&mut fx.tasks, &mut fx.pool, &fx.kernel, &mut fx.machine, FORK_RETURN_ENTRY);
        assert_eq!(err, Err(ForkError::OutOfMemory));
        fx.pool.clear_failpoint();
        assert_eq!(fx.pool.free_frames(), free);
        assert_eq!(fx.tasks.live(), 2);
    }
}
