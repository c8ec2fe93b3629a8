// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task control blocks, the slot-indexed task table and user task creation
//! OWNERS: @kernel-team
//! PUBLIC API: Task, TaskTable, TaskContext, TaskState, SpawnError, create_user_task(),
//!             fork (submodule)
//! DEPENDS_ON: mm (address spaces, frames), fs (file tables), user_loader, trap::TrapFrame
//! INVARIANTS: Slot 0 always holds the idle task; a task's PID equals its slot index;
//!             the current slot is always occupied
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

pub mod fork;

use alloc::sync::Arc;
use core::fmt;
use core::mem::size_of;

use crate::config::{KERNEL_STACK_PAGES, NR_TASKS, PA2VA_OFFSET, PAGE_SIZE, USER_END};
use crate::fs::{FileTable, SharedFiles};
use crate::mm::{
    AddressSpace, FrameError, FramePool, ImageSource, MapError, PageTable, PhysFrame, VmaError,
    VmaFlags,
};
use crate::trap::{TrapFrame, REG_SP};
use crate::types::Pid;
use crate::user_loader::{self, UserLoadError};

pub use fork::{fork, ForkError};

/// Previous privilege was supervisor.
pub const SSTATUS_SPP: usize = 1 << 8;
/// Interrupts enabled after `sret`.
pub const SSTATUS_SPIE: usize = 1 << 5;
/// Supervisor may touch user pages.
pub const SSTATUS_SUM: usize = 1 << 18;

/// Saved continuation exchanged with the context-switch primitive.
///
/// The scheduler treats it as an opaque token; only the platform switch
/// routine reads the fields.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskContext {
    pub ra: usize,
    pub sp: usize,
    pub s: [usize; 12],
    pub sepc: usize,
    pub sstatus: usize,
    pub sscratch: usize,
}

static_assertions::const_assert_eq!(size_of::<TaskContext>(), 17 * 8);

/// Scheduling state. Every live task is runnable in this kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,
}

/// Task control block.
pub struct Task {
    pid: Pid,
    state: TaskState,
    counter: u64,
    priority: u64,
    context: TaskContext,
    frame: TrapFrame,
    kernel_stack: Option<KernelStack>,
    space: Option<AddressSpace>,
    files: Option<SharedFiles>,
}

impl Task {
    /// Kernel-only task with no address space, kernel stack or files.
    pub fn new(pid: Pid, priority: u64) -> Self {
        Self {
            pid,
            state: TaskState::Running,
            counter: 0,
            priority,
            context: TaskContext::default(),
            frame: TrapFrame::default(),
            kernel_stack: None,
            space: None,
            files: None,
        }
    }

    /// The idle task: PID 0, priority 0, never selected while others can run.
    pub fn idle() -> Self {
        Self::new(Pid::IDLE, 0)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Running
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn set_counter(&mut self, counter: u64) {
        self.counter = counter;
    }

    pub fn priority(&self) -> u64 {
        self.priority
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut TaskContext {
        &mut self.context
    }

    /// Saved user registers.
    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    pub fn kernel_stack(&self) -> Option<KernelStack> {
        self.kernel_stack
    }

    pub fn space(&self) -> Option<&AddressSpace> {
        self.space.as_ref()
    }

    pub fn space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.space.as_mut()
    }

    pub fn files(&self) -> Option<&SharedFiles> {
        self.files.as_ref()
    }

    /// Returns every frame the task owns to the pool.
    pub fn release(self, pool: &mut FramePool) {
        if let Some(stack) = self.kernel_stack {
            stack.release(pool);
        }
        if let Some(space) = self.space {
            space.teardown(pool);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("counter", &self.counter)
            .field("priority", &self.priority)
            .field("sepc", &self.frame.sepc)
            .finish()
    }
}

/// Kernel task table managing task control blocks.
pub struct TaskTable {
    slots: [Option<Task>; NR_TASKS],
    current: usize,
}

impl TaskTable {
    /// Creates a table holding only `idle` in slot 0, which is current.
    pub fn new(idle: Task) -> Self {
        let mut slots: [Option<Task>; NR_TASKS] = core::array::from_fn(|_| None);
        slots[0] = Some(idle);
        Self { slots, current: 0 }
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_pid(&self) -> Pid {
        Pid::from_raw(self.current as u32)
    }

    pub fn current(&self) -> Option<&Task> {
        self.get(self.current)
    }

    pub fn current_mut(&mut self) -> Option<&mut Task> {
        self.get_mut(self.current)
    }

    /// Makes `index` current; ignored for empty slots.
    pub fn set_current(&mut self, index: usize) -> bool {
        if self.get(index).is_some() {
            self.current = index;
            true
        } else {
            false
        }
    }

    pub fn get(&self, index: usize) -> Option<&Task> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Task> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Lowest empty slot.
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Stores `task` in the slot named by its PID. Hands the task back if
    /// the slot is taken or out of range.
    pub fn insert(&mut self, task: Task) -> Result<Pid, Task> {
        let pid = task.pid;
        match self.slots.get_mut(pid.as_index()) {
            Some(slot @ None) => {
                *slot = Some(task);
                Ok(pid)
            }
            _ => Err(task),
        }
    }

    /// Removes a non-idle, non-current task.
    pub fn remove(&mut self, index: usize) -> Option<Task> {
        if index == 0 || index == self.current {
            return None;
        }
        self.slots.get_mut(index)?.take()
    }

    /// Live tasks in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Task)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| slot.as_ref().map(|t| (i, t)))
    }

    pub fn live(&self) -> usize {
        self.iter().count()
    }

    /// Mutable access to two distinct tasks at once.
    pub fn pair_mut(&mut self, a: usize, b: usize) -> Option<(&mut Task, &mut Task)> {
        if a == b || a >= NR_TASKS || b >= NR_TASKS {
            return None;
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let (head, tail) = self.slots.split_at_mut(high);
        let low_task = head[low].as_mut()?;
        let high_task = tail[0].as_mut()?;
        if a < b {
            Some((low_task, high_task))
        } else {
            Some((high_task, low_task))
        }
    }
}

/// Errors raised while building a user task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnError {
    /// No frame left for the stack or page tables.
    OutOfMemory,
    /// Page-table construction failed.
    Map(MapError),
    /// Program image could not be turned into VMAs.
    Load(UserLoadError),
    /// Stack VMA was rejected.
    Vma(VmaError),
}

impl From<MapError> for SpawnError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::OutOfMemory,
            other => Self::Map(other),
        }
    }
}

impl From<FrameError> for SpawnError {
    fn from(value: FrameError) -> Self {
        MapError::from(value).into()
    }
}

impl From<UserLoadError> for SpawnError {
    fn from(value: UserLoadError) -> Self {
        Self::Load(value)
    }
}

impl From<VmaError> for SpawnError {
    fn from(value: VmaError) -> Self {
        Self::Vma(value)
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::Map(err) => write!(f, "{err}"),
            Self::Load(err) => write!(f, "{err}"),
            Self::Vma(err) => write!(f, "{err}"),
        }
    }
}

/// Physically contiguous kernel stack of [`KERNEL_STACK_PAGES`] frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelStack {
    base: PhysFrame,
}

impl KernelStack {
    pub fn alloc(pool: &mut FramePool) -> Result<Self, FrameError> {
        pool.alloc_contiguous_zeroed(KERNEL_STACK_PAGES).map(|base| Self { base })
    }

    /// Lowest frame of the stack.
    pub fn base(self) -> PhysFrame {
        self.base
    }

    /// Frame holding the top of the stack, where the trap frame lives.
    pub fn top_frame(self) -> PhysFrame {
        PhysFrame::from_ppn(self.base.ppn() + KERNEL_STACK_PAGES - 1)
    }

    /// Kernel virtual address one past the highest stack byte.
    pub fn top(self) -> usize {
        (self.base.addr() + KERNEL_STACK_PAGES * PAGE_SIZE).wrapping_add(PA2VA_OFFSET)
    }

    pub fn release(self, pool: &mut FramePool) {
        for i in 0..KERNEL_STACK_PAGES {
            let _ = pool.release(PhysFrame::from_ppn(self.base.ppn() + i));
        }
    }
}

/// Copies `frame` to the top of `stack` and returns the kernel VA of the
/// copy, which is where the fork return path expects `sp` to point.
pub fn stash_frame(pool: &mut FramePool, stack: KernelStack, frame: &TrapFrame) -> Result<usize, FrameError> {
    const WORD: usize = size_of::<usize>();
    let bytes = pool.bytes_mut(stack.top_frame())?;
    let base = PAGE_SIZE - size_of::<TrapFrame>();
    let tail = [frame.sepc, frame.sstatus, frame.scause, frame.stval];
    for (i, word) in frame.x.iter().chain(tail.iter()).enumerate() {
        let at = base + i * WORD;
        bytes[at..at + WORD].copy_from_slice(&word.to_le_bytes());
    }
    Ok(stack.top() - size_of::<TrapFrame>())
}

/// Builds a runnable user task from `image` with its own copy of the
/// kernel mappings, one kernel stack and the console file descriptors.
pub fn create_user_task(
    pid: Pid,
    priority: u64,
    pool: &mut FramePool,
    kernel_table: &PageTable,
    image: Arc<dyn ImageSource>,
    user_entry: usize,
) -> Result<Task, SpawnError> {
    let stack = KernelStack::alloc(pool)?;
    let table = match kernel_table.duplicate_root(pool) {
        Ok(table) => table,
        Err(err) => {
            stack.release(pool);
            return Err(err.into());
        }
    };
    let mut space = AddressSpace::with_image(table, Arc::clone(&image));
    let entry = match populate_user_space(&mut space, image.as_bytes()) {
        Ok(entry) => entry,
        Err(err) => {
            space.teardown(pool);
            stack.release(pool);
            return Err(err);
        }
    };

    let mut task = Task::new(pid, priority);
    task.kernel_stack = Some(stack);

    let sstatus = SSTATUS_SPIE | SSTATUS_SUM;
    task.context = TaskContext {
        ra: user_entry,
        sp: stack.top(),
        sepc: entry,
        sstatus,
        sscratch: USER_END,
        ..TaskContext::default()
    };
    task.frame.sepc = entry;
    task.frame.sstatus = sstatus;
    task.frame.x[REG_SP] = USER_END;
    task.files = Some(FileTable::with_stdio().into_shared());
    log_debug!(target: "task", "[PID = {}] created entry=0x{:x} satp=0x{:x}", pid, entry, space.satp());
    task.space = Some(space);
    Ok(task)
}

fn populate_user_space(space: &mut AddressSpace, image: &[u8]) -> Result<usize, SpawnError> {
    let entry = user_loader::load_program(space, image)?;
    space.map_region(
        USER_END - PAGE_SIZE,
        PAGE_SIZE,
        0,
        0,
        VmaFlags::READ | VmaFlags::WRITE | VmaFlags::ANON,
    )?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PHY_START, USER_START};
    use crate::hal::host::{host_kernel_layout, USER_ENTRY};
    use alloc::vec;

    fn kernel(pool: &mut FramePool) -> PageTable {
        let mut table = PageTable::new(pool).expect("root");
        table.map_kernel(pool, &host_kernel_layout()).expect("kernel");
        table
    }

    #[test]
    fn table_starts_with_idle_current() {
        let tasks = TaskTable::new(Task::idle());
        assert_eq!(tasks.current_pid(), Pid::IDLE);
        assert_eq!(tasks.live(), 1);
        assert_eq!(tasks.free_slot(), Some(1));
    }

    #[test]
    fn insert_uses_pid_slot_and_refuses_duplicates() {
        let mut tasks = TaskTable::new(Task::idle());
        assert_eq!(tasks.insert(Task::new(Pid::from_raw(3), 5)).map_err(|t| t.pid()), Ok(Pid::from_raw(3)));
        assert!(tasks.insert(Task::new(Pid::from_raw(3), 1)).is_err());
        assert!(tasks.insert(Task::new(Pid::from_raw(NR_TASKS as u32), 1)).is_err());
        assert_eq!(tasks.get(3).map(Task::priority), Some(5));
    }

    #[test]
    fn pair_mut_returns_requested_order() {
        let mut tasks = TaskTable::new(Task::idle());
        let _ = tasks.insert(Task::new(Pid::from_raw(2), 7));
        let (a, b) = tasks.pair_mut(2, 0).expect("pair");
        assert_eq!((a.pid().as_raw(), b.pid().as_raw()), (2, 0));
        assert!(tasks.pair_mut(1, 0).is_none());
        assert!(tasks.pair_mut(2, 2).is_none());
    }

    #[test]
    fn user_task_enters_at_image_start_with_user_stack() {
        let mut pool = FramePool::new(PHY_START + 0x10_0000, 64);
        let kernel_table = kernel(&mut pool);
        let image: Arc<dyn ImageSource> = Arc::new(vec![0x13u8; 64]);
        let task = create_user_task(Pid::from_raw(1), 4, &mut pool, &kernel_table, image, USER_ENTRY)
            .expect("task");
        assert_eq!(task.frame().sepc, USER_START);
        assert_eq!(task.frame().x[REG_SP], USER_END);
        assert_eq!(task.context().ra, USER_ENTRY);
        assert_eq!(task.context().sstatus & SSTATUS_SPP, 0);
        assert_ne!(task.context().sstatus & SSTATUS_SUM, 0);
        let space = task.space().expect("space");
        assert!(space.find_vma(USER_END - 8).is_some());
        assert!(space.find_vma(USER_START).is_some());
        assert!(space.page_table().translate(&pool, crate::config::VM_START).is_some());
        assert_eq!(task.files().map(|f| f.lock().open_count()), Some(3));
    }

    #[test]
    fn kernel_stack_spans_several_pages() {
        let mut pool = FramePool::new(PHY_START + 0x10_0000, 64);
        let kernel_table = kernel(&mut pool);
        let free = pool.free_frames();
        let image: Arc<dyn ImageSource> = Arc::new(vec![0x13u8; 64]);
        let task = create_user_task(Pid::from_raw(1), 4, &mut pool, &kernel_table, image, USER_ENTRY)
            .expect("task");
        let stack = task.kernel_stack().expect("stack");
        assert_eq!(task.context().sp, stack.top());
        for i in 0..KERNEL_STACK_PAGES {
            assert_eq!(pool.refcount(PhysFrame::from_ppn(stack.base().ppn() + i)), Ok(1));
        }
        task.release(&mut pool);
        assert_eq!(pool.free_frames(), free);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn failed_creation_returns_every_frame() {
        let mut pool = FramePool::new(PHY_START + 0x10_0000, 64);
        let kernel_table = kernel(&mut pool);
        let free = pool.free_frames();
        pool.fail_allocs_after(2);
        let image: Arc<dyn ImageSource> = Arc::new(vec![0u8; 16]);
        let err = create_user_task(Pid::from_raw(1), 1, &mut pool, &kernel_table, image, USER_ENTRY);
        assert_eq!(err.map(|t| t.pid()), Err(SpawnError::OutOfMemory));
        assert_eq!(pool.free_frames(), free);
    }

    #[test]
    fn stashed_frame_sits_below_stack_top() {
        let mut pool = FramePool::new(PHY_START, KERNEL_STACK_PAGES + 1);
        let stack = KernelStack::alloc(&mut pool).expect("stack");
        let mut frame = TrapFrame::default();
        frame.x[10] = 0x1234;
        frame.stval = 0x77;
        let sp = stash_frame(&mut pool, stack, &frame).expect("stash");
        assert_eq!(sp, stack.top() - size_of::<TrapFrame>());
        assert_eq!(stack.top() - stack.base().addr().wrapping_add(PA2VA_OFFSET), KERNEL_STACK_PAGES * PAGE_SIZE);
        let bytes = pool.bytes(stack.top_frame()).expect("bytes");
        let base = PAGE_SIZE - size_of::<TrapFrame>();
        assert_eq!(bytes[base + 10 * 8], 0x34);
        assert_eq!(bytes[PAGE_SIZE - 8], 0x77);
    }
}
