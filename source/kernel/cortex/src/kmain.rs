// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state, bring-up and trap dispatch
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (init/handle_trap/accessors), InitError; kernel_main + trap_handler
//!             on the bare-metal target
//! DEPENDS_ON: sched, task, mm::fault, syscall, fs, hal::Platform
//! INVARIANTS: Trap entry saves the live frame into the current task; trap exit loads the
//!             frame of whichever task is current afterwards. Syscall results land in the
//!             caller's saved a0 with sepc advanced past the ecall
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;

use crate::config::{ConfigError, KernelConfig};
use crate::determinism::{self, PriorityRng};
use crate::fs::MountTable;
use crate::hal::Platform;
use crate::mm::fault::{self, FaultKind};
use crate::mm::{FramePool, ImageSource, KernelLayout, MapError, PageTable};
use crate::sched::Scheduler;
use crate::syscall::{api, Args, SyscallTable};
use crate::task::{create_user_task, SpawnError, Task, TaskTable};
use crate::trap::{self, Exception, Interrupt, Trap, TrapDump, TrapFrame, REG_A0};
use crate::types::{Pid, VirtAddr};

/// Errors raised while bringing the kernel up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitError {
    Config(ConfigError),
    /// Kernel page table could not be built.
    Map(MapError),
    /// An initial user task could not be created.
    Spawn(SpawnError),
}

impl From<ConfigError> for InitError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<MapError> for InitError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl From<SpawnError> for InitError {
    fn from(value: SpawnError) -> Self {
        Self::Spawn(value)
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "config: {err}"),
            Self::Map(err) => write!(f, "kernel table: {err}"),
            Self::Spawn(err) => write!(f, "user task: {err}"),
        }
    }
}

/// Aggregated kernel state. Owned by the trap path; nothing here is global.
pub struct Kernel<P: Platform> {
    scheduler: Scheduler,
    frames: FramePool,
    kernel_table: PageTable,
    mounts: MountTable,
    syscalls: SyscallTable,
    platform: P,
}

impl<P: Platform> Kernel<P> {
    /// Builds the kernel table from `layout`, the idle task and
    /// `config.user_tasks` user tasks running `image`, then arms the timer.
    pub fn init(
        config: KernelConfig,
        mut frames: FramePool,
        layout: &KernelLayout,
        image: Arc<dyn ImageSource>,
        mounts: MountTable,
        mut platform: P,
    ) -> Result<Self, InitError> {
        config.validate()?;
        determinism::set_seed(config.seed);
        determinism::set_tick_cycles(config.tick_cycles);

        let mut kernel_table = PageTable::new(&mut frames)?;
        kernel_table.map_kernel(&mut frames, layout)?;

        let mut tasks = TaskTable::new(Task::idle());
        let mut rng = PriorityRng::new(config.seed);
        for slot in 1..=config.user_tasks {
            let priority = rng.next_priority();
            let task = create_user_task(
                Pid::from_raw(slot as u32),
                priority,
                &mut frames,
                &kernel_table,
                Arc::clone(&image),
                platform.user_entry(),
            )?;
            log_info!(
                target: "task",
                "SET [PID = {} PRIORITY = {} COUNTER = {}]",
                task.pid(),
                task.priority(),
                task.counter()
            );
            if let Err(task) = tasks.insert(task) {
                task.release(&mut frames);
            }
        }

        let scheduler = Scheduler::new(tasks, kernel_table.satp());
        platform.set_next_tick();
        log_info!(
            target: "kmain",
            "kernel up: {} user tasks, {} free frames, satp=0x{:x}",
            config.user_tasks,
            frames.free_frames(),
            kernel_table.satp()
        );
        Ok(Self { scheduler, frames, kernel_table, mounts, syscalls: SyscallTable::with_defaults(), platform })
    }

    /// Serves one trap. `live` is the frame saved by the entry sequence and
    /// is overwritten with the frame to resume.
    pub fn handle_trap(&mut self, live: &mut TrapFrame) {
        trap::record(live);
        if let Some(task) = self.scheduler.tasks_mut().current_mut() {
            *task.frame_mut() = *live;
        }

        match trap::classify(live.scause) {
            Trap::Interrupt(Interrupt::SupervisorTimer) => {
                self.platform.set_next_tick();
                let _ = self.scheduler.tick(&mut self.platform);
            }
            Trap::Interrupt(other) => {
                log_warn!(target: "trap", "ignoring interrupt {:?} at sepc=0x{:x}", other, live.sepc);
            }
            Trap::Exception(Exception::UserEcall) => self.handle_syscall(),
            Trap::Exception(Exception::PageFault(kind)) => {
                self.handle_page_fault(kind, live.stval, live.sepc)
            }
            Trap::Exception(Exception::Other(code)) => trap::fatal(format_args!(
                "[PID = {}] unhandled exception {} ({})\n{}",
                self.scheduler.current_pid(),
                code,
                trap::describe_cause(live.scause),
                TrapDump(live)
            )),
        }

        if let Some(task) = self.scheduler.tasks().current() {
            *live = *task.frame();
        }
    }

    fn handle_syscall(&mut self) {
        let caller = self.scheduler.current_pid();
        let (number, regs) = match self.scheduler.tasks().current() {
            Some(task) => task.frame().syscall_args(),
            None => trap::fatal(format_args!("ecall without a current task")),
        };
        let result = {
            let mut ctx = api::Context::new(
                self.scheduler.tasks_mut(),
                &mut self.frames,
                &self.kernel_table,
                &self.mounts,
                &mut self.platform,
            );
            self.syscalls.dispatch(number, &mut ctx, &Args::new(regs))
        };
        let ret = match result {
            Ok(value) => value,
            Err(err) if err.is_fatal() => trap::fatal(format_args!(
                "[PID = {}] syscall {} failed: {}",
                caller, number, err
            )),
            Err(err) => {
                log_debug!(target: "syscall", "[PID = {}] syscall {} -> {}", caller, number, err);
                err.errno_value()
            }
        };
        if let Some(task) = self.scheduler.tasks_mut().get_mut(caller.as_index()) {
            let frame = task.frame_mut();
            frame.x[REG_A0] = ret;
            frame.sepc += 4;
        }
    }

    fn handle_page_fault(&mut self, kind: FaultKind, addr: usize, sepc: usize) {
        let pid = self.scheduler.current_pid();
        let space = match self.scheduler.tasks_mut().current_mut().and_then(Task::space_mut) {
            Some(space) => space,
            None => trap::fatal(format_args!(
                "[PID = {}] {} fault at 0x{:x} without a user address space, sepc=0x{:x}",
                pid,
                kind.label(),
                addr,
                sepc
            )),
        };
        if let Err(err) = fault::resolve(space, &mut self.frames, &mut self.platform, addr, kind) {
            let stval = VirtAddr::new(addr);
            trap::fatal(format_args!(
                "[PID = {}] unhandled page fault: {}\n sepc=0x{:x} stval=0x{:x} vpn={:?}\n VMAs:\n{}",
                pid,
                err,
                sepc,
                addr,
                stval.map(VirtAddr::vpn),
                space.dump_vmas()
            ));
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn current_pid(&self) -> Pid {
        self.scheduler.current_pid()
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FramePool {
        &mut self.frames
    }

    pub fn kernel_table(&self) -> &PageTable {
        &self.kernel_table
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use self::bare_metal::{kernel_main, BootInfo};

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod bare_metal {
    extern crate alloc;

    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec;
    use core::ptr::NonNull;
    use core::sync::atomic::{AtomicPtr, Ordering};
    use riscv::register::stvec::TrapMode;

    use super::Kernel;
    use crate::config::{KernelConfig, PAGE_SIZE, PA2VA_OFFSET};
    use crate::fs::MountTable;
    use crate::hal::sbi::SbiPlatform;
    use crate::heap;
    use crate::mm::{FramePool, ImageSource, KernelLayout, KernelSegment, PageFlags};
    use crate::trap::{self, TrapDump, TrapFrame};

    static KERNEL: AtomicPtr<Kernel<SbiPlatform>> = AtomicPtr::new(core::ptr::null_mut());

    extern "C" {
        fn __trap_vector();
        static __text_start: u8;
        static __text_end: u8;
        static __rodata_start: u8;
        static __rodata_end: u8;
        static __data_start: u8;
    }

    /// Memory handed over by the boot assembly.
    pub struct BootInfo {
        /// Kernel VA and size of the heap region.
        pub heap_start: usize,
        pub heap_size: usize,
        /// Kernel VA, physical base and frame count of the frame pool.
        pub frames_va: usize,
        pub frames_pa: usize,
        pub frames: usize,
        /// Kernel VA one past the last byte of RAM.
        pub ram_end: usize,
        /// Program image run by every initial user task.
        pub image: &'static [u8],
    }

    fn linker_layout(ram_end: usize) -> KernelLayout {
        // SAFETY: linker-provided symbols; only their addresses are taken.
        let (text, text_end, rodata, rodata_end, data) = unsafe {
            (
                &__text_start as *const u8 as usize,
                &__text_end as *const u8 as usize,
                &__rodata_start as *const u8 as usize,
                &__rodata_end as *const u8 as usize,
                &__data_start as *const u8 as usize,
            )
        };
        KernelLayout::new(vec![
            KernelSegment { va: text, len: text_end - text, flags: PageFlags::READ | PageFlags::EXECUTE },
            KernelSegment { va: rodata, len: rodata_end - rodata, flags: PageFlags::READ },
            KernelSegment { va: data, len: ram_end - data, flags: PageFlags::READ | PageFlags::WRITE },
        ])
    }

    /// Brings the kernel up and idles until the first timer tick schedules
    /// a user task.
    ///
    /// # Safety
    /// Called once by the boot assembly with regions in `boot` that are
    /// mapped, writable and used by nothing else.
    pub unsafe fn kernel_main(boot: BootInfo, mounts: MountTable) -> ! {
        // SAFETY: forwarded from the caller.
        unsafe { heap::init(boot.heap_start as *mut u8, boot.heap_size) };
        let Some(base) = NonNull::new(boot.frames_va as *mut u8) else {
            trap::fatal(format_args!("frame pool at null"));
        };
        // SAFETY: forwarded from the caller.
        let frames = unsafe { FramePool::from_region(base, boot.frames_pa, boot.frames) };
        debug_assert_eq!(boot.frames_va, boot.frames_pa.wrapping_add(PA2VA_OFFSET));
        debug_assert_eq!(boot.frames_va % PAGE_SIZE, 0);

        let config = KernelConfig::default();
        let image: Arc<dyn ImageSource> = Arc::new(boot.image);
        let layout = linker_layout(boot.ram_end);
        let kernel = match Kernel::init(config, frames, &layout, image, mounts, SbiPlatform::new(config.tick_cycles)) {
            Ok(kernel) => kernel,
            Err(err) => trap::fatal(format_args!("init failed: {err}")),
        };
        let satp = kernel.kernel_table().satp();
        KERNEL.store(Box::leak(Box::new(kernel)), Ordering::Release);
        log_info!(target: "kmain", "heap free={} bytes", heap::free_bytes());

        // SAFETY: the new table maps the running kernel at the same addresses;
        // the vector is installed and interrupts enabled only once KERNEL is published.
        unsafe {
            core::arch::asm!("csrw satp, {0}", "sfence.vma zero, zero", in(reg) satp);
            riscv::register::sscratch::write(0);
            riscv::register::stvec::write(__trap_vector as usize, TrapMode::Direct);
            riscv::register::sie::set_stimer();
            riscv::register::sstatus::set_sie();
        }
        loop {
            #[allow(unused_unsafe)]
            unsafe {
                riscv::asm::wfi()
            };
        }
    }

    /// Called by the trap entry sequence with the saved frame.
    #[no_mangle]
    extern "C" fn trap_handler(frame: &mut TrapFrame) {
        let kernel = KERNEL.load(Ordering::Acquire);
        // SAFETY: published once by kernel_main and never freed; traps do not
        // nest on the single hart, so this is the only live reference.
        match unsafe { kernel.as_mut() } {
            Some(kernel) => kernel.handle_trap(frame),
            None => trap::fatal(format_args!("trap before kernel init\n{}", TrapDump(frame))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NR_TASKS, PHY_START, USER_END};
    use crate::hal::host::{host_kernel_layout, HostMachine};
    use crate::syscall::SYSCALL_GETPID;
    use crate::trap::REG_A7;
    use alloc::vec;

    const TIMER: usize = (1 << 63) | 5;
    const ECALL: usize = 8;

    fn kernel(user_tasks: usize) -> Kernel<HostMachine> {
        let config = KernelConfig { user_tasks, seed: 7, tick_cycles: 100 };
        let image: Arc<dyn ImageSource> = Arc::new(vec![0x13u8; 64]);
        Kernel::init(
            config,
            FramePool::new(PHY_START + 0x10_0000, 256),
            &host_kernel_layout(),
            image,
            MountTable::new(),
            HostMachine::new(),
        )
        .expect("init")
    }

    #[test]
    fn init_arms_timer_and_fills_slots() {
        let kernel = kernel(3);
        assert_eq!(kernel.platform().ticks(), 1);
        assert_eq!(kernel.scheduler().tasks().live(), 4);
        assert_eq!(kernel.current_pid(), Pid::IDLE);
        for (_, task) in kernel.scheduler().tasks().iter().skip(1) {
            assert!((1..=10).contains(&task.priority()));
            assert_eq!(task.counter(), 0);
        }
    }

    #[test]
    fn too_many_tasks_is_rejected() {
        let err = Kernel::init(
            KernelConfig { user_tasks: NR_TASKS, seed: 1, tick_cycles: 1 },
            FramePool::new(PHY_START, 16),
            &host_kernel_layout(),
            Arc::new(vec![0u8; 4]),
            MountTable::new(),
            HostMachine::new(),
        );
        assert!(matches!(err, Err(InitError::Config(ConfigError::TooManyTasks { .. }))));
    }

    #[test]
    fn timer_then_ecall_round_trip() {
        let mut kernel = kernel(1);
        let mut live = TrapFrame { scause: TIMER, ..TrapFrame::default() };
        kernel.handle_trap(&mut live);
        assert_eq!(kernel.current_pid(), Pid::from_raw(1));
        assert_eq!(live.x[2], USER_END);
        assert_eq!(kernel.platform().ticks(), 2);

        let entry = live.sepc;
        live.scause = ECALL;
        live.x[REG_A7] = SYSCALL_GETPID;
        kernel.handle_trap(&mut live);
        assert_eq!(live.x[REG_A0], 1);
        assert_eq!(live.sepc, entry + 4);
    }

    #[test]
    #[should_panic(expected = "unhandled exception")]
    fn illegal_instruction_is_fatal() {
        let mut kernel = kernel(1);
        let mut live = TrapFrame { scause: TIMER, ..TrapFrame::default() };
        kernel.handle_trap(&mut live);
        live.scause = 2;
        kernel.handle_trap(&mut live);
    }
}
