// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Decaying-priority preemptive scheduler over the task table
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (new/tick/schedule/tasks), TickOutcome, SwitchOutcome
//! DEPENDS_ON: task (TaskTable, TaskContext), hal::ContextSwitch
//! INVARIANTS: Reselection picks the largest positive counter, lowest slot on ties;
//!             aging runs only when no task has a positive counter; idle runs only
//!             when no user task can
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::marker::PhantomData;

use crate::config::NR_TASKS;
use crate::hal::ContextSwitch;
use crate::mm::AddressSpace;
use crate::task::TaskTable;
use crate::types::Pid;

/// Result of one timer tick.
#[must_use = "tick outcomes report whether the running task changed"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The current task keeps the CPU with `remaining` ticks left.
    Continue { remaining: u64 },
    /// Reselection ran.
    Rescheduled(SwitchOutcome),
}

/// Result of a reselection.
#[must_use = "switch outcomes report which task now runs"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Stayed { pid: Pid },
    Switched { from: Pid, to: Pid },
}

impl SwitchOutcome {
    /// Task running after the reselection.
    pub fn running(self) -> Pid {
        match self {
            Self::Stayed { pid } => pid,
            Self::Switched { to, .. } => to,
        }
    }
}

/// Single-hart scheduler owning the task registry and the current index.
///
/// `!Send` and `!Sync`: it is only ever driven from trap handling on the
/// hart that owns it.
pub struct Scheduler {
    tasks: TaskTable,
    kernel_satp: usize,
    switches: u64,
    _not_send_sync: PhantomData<*mut ()>,
}
static_assertions::assert_not_impl_any!(Scheduler: Send, Sync);

impl Scheduler {
    /// Takes over `tasks`; kernel-only tasks run on `kernel_satp`.
    pub fn new(tasks: TaskTable, kernel_satp: usize) -> Self {
        Self { tasks, kernel_satp, switches: 0, _not_send_sync: PhantomData }
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut TaskTable {
        &mut self.tasks
    }

    pub fn current_pid(&self) -> Pid {
        self.tasks.current_pid()
    }

    /// Context switches performed so far.
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Accounts one timer tick to the current task.
    pub fn tick<C: ContextSwitch + ?Sized>(&mut self, cpu: &mut C) -> TickOutcome {
        let index = self.tasks.current_index();
        if index != 0 {
            if let Some(task) = self.tasks.current_mut() {
                if task.counter() > 0 {
                    let remaining = task.counter() - 1;
                    task.set_counter(remaining);
                    if remaining > 0 {
                        return TickOutcome::Continue { remaining };
                    }
                }
            }
        }
        TickOutcome::Rescheduled(self.schedule(cpu))
    }

    /// Picks the next task, aging counters as often as needed, and
    /// switches to it.
    pub fn schedule<C: ContextSwitch + ?Sized>(&mut self, cpu: &mut C) -> SwitchOutcome {
        loop {
            if let Some(next) = self.select() {
                return self.switch_to(next, cpu);
            }
            if !self.age() {
                return self.switch_to(0, cpu);
            }
        }
    }

    /// Largest positive counter among runnable user tasks; ascending scan
    /// with strict comparison so the lowest slot wins ties.
    fn select(&self) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (index, task) in self.tasks.iter().filter(|(i, _)| *i != 0) {
            if !task.is_runnable() || task.counter() == 0 {
                continue;
            }
            if best.map_or(true, |(_, counter)| task.counter() > counter) {
                best = Some((index, task.counter()));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Replenishes every user task from the last slot down. Returns whether
    /// any counter ended up positive.
    fn age(&mut self) -> bool {
        let mut any = false;
        for index in (1..NR_TASKS).rev() {
            if let Some(task) = self.tasks.get_mut(index) {
                let counter = (task.counter() >> 1) + task.priority();
                task.set_counter(counter);
                any |= counter > 0;
                #[cfg(feature = "trace_sched")]
                log_info!(
                    target: "sched",
                    "SET [PID = {} PRIORITY = {} COUNTER = {}]",
                    task.pid(),
                    task.priority(),
                    counter
                );
            }
        }
        any
    }

    fn switch_to<C: ContextSwitch + ?Sized>(&mut self, next: usize, cpu: &mut C) -> SwitchOutcome {
        let prev = self.tasks.current_index();
        let from = self.tasks.current_pid();
        if next == prev {
            return SwitchOutcome::Stayed { pid: from };
        }
        if !self.tasks.set_current(next) {
            return SwitchOutcome::Stayed { pid: from };
        }
        let kernel_satp = self.kernel_satp;
        let Some((outgoing, incoming)) = self.tasks.pair_mut(prev, next) else {
            return SwitchOutcome::Stayed { pid: from };
        };
        let to = incoming.pid();
        let satp = incoming.space().map_or(kernel_satp, AddressSpace::satp);
        #[cfg(feature = "trace_sched")]
        log_info!(
            target: "sched",
            "switch to [PID = {} PRIORITY = {} COUNTER = {}]",
            to,
            incoming.priority(),
            incoming.counter()
        );
        #[cfg(not(feature = "trace_sched"))]
        log_debug!(target: "sched", "switch to [PID = {}]", to);
        self.switches += 1;
        cpu.switch(outgoing.context_mut(), incoming.context(), satp);
        SwitchOutcome::Switched { from, to }
    }
}
