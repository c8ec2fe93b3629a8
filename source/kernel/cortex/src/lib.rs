// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: CORTEX process and virtual-memory core for Sv39 RISC-V
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, proptest suites (mm), integration tests under tests/
//! PUBLIC API: Kernel (init/handle_trap), Scheduler, FramePool, PageTable, AddressSpace, fork
//! DEPENDS_ON: hal (firmware, TLB and context-switch primitives supplied by the platform)
//! INVARIANTS: Single hart; kernel logic only runs inside trap handling; no ambient globals
//!             for tasks or page tables
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
mod diag;

pub use diag::log;

pub mod config;
pub mod console;
pub mod determinism;
pub mod fs;
pub mod hal;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod heap;
pub mod kmain;
pub mod mm;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod panic;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;
pub mod user_loader;

pub use kmain::{InitError, Kernel};
