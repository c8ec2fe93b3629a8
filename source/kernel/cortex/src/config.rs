// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel memory layout constants and boot-time configuration
//! OWNERS: @kernel-team
//! PUBLIC API: layout constants, KernelConfig, ConfigError
//! DEPENDS_ON: determinism (default seed and tick interval)
//! INVARIANTS: User region [USER_START, USER_END) lies in the lower Sv39 half;
//!             kernel direct map is PA + PA2VA_OFFSET
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Task slots including the idle task in slot 0.
pub const NR_TASKS: usize = 1 + 8;
/// Lowest static priority handed to user tasks.
pub const PRIORITY_MIN: u64 = 1;
/// Highest static priority handed to user tasks.
pub const PRIORITY_MAX: u64 = 10;

/// First user virtual address.
pub const USER_START: usize = 0;
/// One past the last user virtual address; the initial user stack ends here.
pub const USER_END: usize = 0x0000_0040_0000_0000;

/// Start of the kernel direct map.
pub const VM_START: usize = 0xffff_ffe0_0000_0000;
/// Start of physical RAM on the `virt` machine.
pub const PHY_START: usize = 0x8000_0000;
/// Offset added to a physical address to reach its direct-map alias.
pub const PA2VA_OFFSET: usize = VM_START - PHY_START;

/// Frames in each task's kernel stack.
pub const KERNEL_STACK_PAGES: usize = 4;
/// Open-file slots per task.
pub const MAX_FILES: usize = 16;
/// Timer cycles between scheduler ticks (1 s at the 10 MHz `virt` clock).
pub const TIMECLOCK: u64 = 10_000_000;
/// Frames handed to the pool when the caller does not size it.
pub const DEFAULT_FRAMES: usize = 2048;

/// Tunables consumed by [`crate::Kernel::init`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of user tasks created from the program image at boot.
    pub user_tasks: usize,
    /// Seed for the priority generator.
    pub seed: u64,
    /// Timer cycles between ticks.
    pub tick_cycles: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            user_tasks: 1,
            seed: crate::determinism::seed(),
            tick_cycles: crate::determinism::tick_cycles(),
        }
    }
}

/// Rejected configuration values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// More user tasks requested than there are non-idle slots.
    TooManyTasks { requested: usize, max: usize },
    /// A zero tick interval would storm the hart with timer interrupts.
    ZeroTick,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyTasks { requested, max } => {
                write!(f, "{requested} user tasks requested, at most {max} fit")
            }
            Self::ZeroTick => f.write_str("tick interval must be non-zero"),
        }
    }
}

impl KernelConfig {
    /// Checks the configuration against the fixed task table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = NR_TASKS - 1;
        if self.user_tasks > max {
            return Err(ConfigError::TooManyTasks { requested: self.user_tasks, max });
        }
        if self.tick_cycles == 0 {
            return Err(ConfigError::ZeroTick);
        }
        Ok(())
    }
}
