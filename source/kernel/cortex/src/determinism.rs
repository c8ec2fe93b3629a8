// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic boot knobs shared across the kernel
//! OWNERS: @kernel-team
//! PUBLIC API: seed(), set_seed(), tick_cycles(), set_tick_cycles(), PriorityRng
//! DEPENDS_ON: core::sync::atomic, config (priority bounds)
//! INVARIANTS: Relaxed atomics sufficient; same seed yields the same priorities
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! Task priorities are drawn from a seeded generator so that a boot on the
//! host and a boot inside QEMU schedule identically.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::{PRIORITY_MAX, PRIORITY_MIN, TIMECLOCK};

const DEFAULT_SEED: u64 = 2024;

static SEED: AtomicU64 = AtomicU64::new(DEFAULT_SEED);
static TICK_CYCLES: AtomicU64 = AtomicU64::new(TIMECLOCK);

/// Returns the deterministic seed for the priority generator.
#[inline]
pub fn seed() -> u64 {
    SEED.load(Ordering::Relaxed)
}

/// Overrides the deterministic seed.
#[inline]
pub fn set_seed(value: u64) {
    SEED.store(value, Ordering::Relaxed);
}

/// Returns the timer interval between scheduler ticks, in timer cycles.
#[inline]
pub fn tick_cycles() -> u64 {
    TICK_CYCLES.load(Ordering::Relaxed)
}

/// Overrides the timer interval.
#[inline]
pub fn set_tick_cycles(value: u64) {
    TICK_CYCLES.store(value, Ordering::Relaxed);
}

/// xorshift64* generator for static task priorities.
#[derive(Clone, Debug)]
pub struct PriorityRng {
    state: u64,
}

impl PriorityRng {
    pub fn new(seed: u64) -> Self {
        // Zero is a fixed point of xorshift.
        let state = if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed };
        Self { state }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Draws a priority in `[PRIORITY_MIN, PRIORITY_MAX]`.
    pub fn next_priority(&mut self) -> u64 {
        self.next_u64() % (PRIORITY_MAX - PRIORITY_MIN + 1) + PRIORITY_MIN
    }
}
