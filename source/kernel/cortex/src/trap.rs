// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap frame layout, cause classification and fatal diagnostics
//! OWNERS: @kernel-team
//! PUBLIC API: TrapFrame, Trap/Interrupt/Exception, classify(), describe_cause(), fmt_trap(),
//!             record()/last_trap(), fatal()
//! DEPENDS_ON: mm::fault::FaultKind, console
//! INVARIANTS: TrapFrame layout matches the trap entry/exit sequence; every fatal
//!             condition goes through fatal()
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! Dispatch itself lives in [`crate::Kernel::handle_trap`]; this module only
//! knows how to read a trap.

use core::fmt::{self, Write};
use spin::Mutex;

use crate::mm::FaultKind;

// Entry/exit sequence. `sscratch` holds the kernel stack top while a task
// runs in U-mode and zero while the hart is in S-mode.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text
    .globl __trap_vector
    .globl __trap_return
    .globl __ret_from_fork
    .globl __user_entry
    .align 4
__trap_vector:
    csrrw sp, sscratch, sp
    bnez sp, 1f
    csrrw sp, sscratch, sp
    addi sp, sp, -{TF_SIZE}
    sd x5, 40(sp)
    addi x5, sp, {TF_SIZE}
    sd x5, 16(sp)
    j 2f
1:
    addi sp, sp, -{TF_SIZE}
    sd x5, 40(sp)
    csrr x5, sscratch
    sd x5, 16(sp)
    csrw sscratch, zero
2:
    sd x1, 8(sp)
    sd x3, 24(sp)
    sd x4, 32(sp)
    sd x6, 48(sp)
    sd x7, 56(sp)
    sd x8, 64(sp)
    sd x9, 72(sp)
    sd x10, 80(sp)
    sd x11, 88(sp)
    sd x12, 96(sp)
    sd x13, 104(sp)
    sd x14, 112(sp)
    sd x15, 120(sp)
    sd x16, 128(sp)
    sd x17, 136(sp)
    sd x18, 144(sp)
    sd x19, 152(sp)
    sd x20, 160(sp)
    sd x21, 168(sp)
    sd x22, 176(sp)
    sd x23, 184(sp)
    sd x24, 192(sp)
    sd x25, 200(sp)
    sd x26, 208(sp)
    sd x27, 216(sp)
    sd x28, 224(sp)
    sd x29, 232(sp)
    sd x30, 240(sp)
    sd x31, 248(sp)
    csrr t0, sepc
    sd t0, {OFF_SEPC}(sp)
    csrr t0, sstatus
    sd t0, {OFF_SSTATUS}(sp)
    csrr t0, scause
    sd t0, {OFF_SCAUSE}(sp)
    csrr t0, stval
    sd t0, {OFF_STVAL}(sp)
    mv a0, sp
    call trap_handler

__ret_from_fork:
__trap_return:
    ld t0, {OFF_SEPC}(sp)
    csrw sepc, t0
    ld t0, {OFF_SSTATUS}(sp)
    csrw sstatus, t0
    andi t0, t0, {SPP}
    bnez t0, 3f
    addi t0, sp, {TF_SIZE}
    csrw sscratch, t0
3:
    ld x1, 8(sp)
    ld x3, 24(sp)
    ld x4, 32(sp)
    ld x5, 40(sp)
    ld x6, 48(sp)
    ld x7, 56(sp)
    ld x8, 64(sp)
    ld x9, 72(sp)
    ld x10, 80(sp)
    ld x11, 88(sp)
    ld x12, 96(sp)
    ld x13, 104(sp)
    ld x14, 112(sp)
    ld x15, 120(sp)
    ld x16, 128(sp)
    ld x17, 136(sp)
    ld x18, 144(sp)
    ld x19, 152(sp)
    ld x20, 160(sp)
    ld x21, 168(sp)
    ld x22, 176(sp)
    ld x23, 184(sp)
    ld x24, 192(sp)
    ld x25, 200(sp)
    ld x26, 208(sp)
    ld x27, 216(sp)
    ld x28, 224(sp)
    ld x29, 232(sp)
    ld x30, 240(sp)
    ld x31, 248(sp)
    ld sp, 16(sp)
    sret

__user_entry:
    csrrw sp, sscratch, sp
    sret
"#,
    TF_SIZE = const core::mem::size_of::<TrapFrame>(),
    OFF_SEPC = const 32 * 8,
    OFF_SSTATUS = const 33 * 8,
    OFF_SCAUSE = const 34 * 8,
    OFF_STVAL = const 35 * 8,
    SPP = const crate::task::SSTATUS_SPP,
);

const INTERRUPT_FLAG: usize = usize::MAX - (usize::MAX >> 1);

const IRQ_SUPERVISOR_SOFT: usize = 1;
const IRQ_SUPERVISOR_TIMER: usize = 5;
const IRQ_SUPERVISOR_EXTERNAL: usize = 9;
const EXC_ECALL_UMODE: usize = 8;

/// Register index of `sp`.
pub const REG_SP: usize = 2;
/// Register index of `a0`, the syscall return value.
pub const REG_A0: usize = 10;
/// Register index of `a7`, the syscall number.
pub const REG_A7: usize = 17;

static LAST_TRAP: Mutex<Option<TrapFrame>> = Mutex::new(None);

/// Saved register state for an S-mode trap.
/// Must match the trap entry/exit save/restore layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// x0..x31 (x0 is always 0; we never write it).
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
}

static_assertions::const_assert_eq!(core::mem::size_of::<TrapFrame>(), 36 * 8);

impl TrapFrame {
    /// Syscall number and the six argument registers.
    pub fn syscall_args(&self) -> (usize, [usize; 6]) {
        (self.x[REG_A7], [self.x[10], self.x[11], self.x[12], self.x[13], self.x[14], self.x[15]])
    }
}

/// Interrupt classes the kernel distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoft,
    SupervisorTimer,
    SupervisorExternal,
    Unknown(usize),
}

/// Exception classes the kernel distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    UserEcall,
    PageFault(FaultKind),
    Other(usize),
}

/// Decoded `scause`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    Interrupt(Interrupt),
    Exception(Exception),
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

/// Splits `scause` into interrupt/exception and code.
pub fn classify(scause: usize) -> Trap {
    let code = scause & !INTERRUPT_FLAG;
    if is_interrupt(scause) {
        Trap::Interrupt(match code {
            IRQ_SUPERVISOR_SOFT => Interrupt::SupervisorSoft,
            IRQ_SUPERVISOR_TIMER => Interrupt::SupervisorTimer,
            IRQ_SUPERVISOR_EXTERNAL => Interrupt::SupervisorExternal,
            other => Interrupt::Unknown(other),
        })
    } else if code == EXC_ECALL_UMODE {
        Trap::Exception(Exception::UserEcall)
    } else if let Some(kind) = FaultKind::from_cause(code) {
        Trap::Exception(Exception::PageFault(kind))
    } else {
        Trap::Exception(Exception::Other(code))
    }
}

pub fn describe_cause(scause: usize) -> &'static str {
    let code = scause & (usize::MAX >> 1);
    if is_interrupt(scause) {
        match code {
            1 => "SupervisorSoftInt",
            5 => "SupervisorTimerInt",
            9 => "SupervisorExternalInt",
            _ => "Interrupt",
        }
    } else {
        match code {
            0 => "InstructionAddressMisaligned",
            1 => "InstructionAccessFault",
            2 => "IllegalInstruction",
            3 => "Breakpoint",
            4 => "LoadAddressMisaligned",
            5 => "LoadAccessFault",
            6 => "StoreAMOAddressMisaligned",
            7 => "StoreAMOAccessFault",
            8 => "EnvironmentCallFromUMode",
            9 => "EnvironmentCallFromSMode",
            12 => "InstructionPageFault",
            13 => "LoadPageFault",
            15 => "StoreAMOPageFault",
            _ => "Exception",
        }
    }
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " sepc=0x{:016x}", frame.sepc)?;
    writeln!(f, " scause=0x{:016x} ({})", frame.scause, describe_cause(frame.scause))?;
    writeln!(f, " stval=0x{:016x}", frame.stval)?;
    writeln!(f, " a0..a7 = {:016x?}", &frame.x[10..=17])
}

/// Display adapter over [`fmt_trap`].
pub struct TrapDump<'a>(pub &'a TrapFrame);

impl fmt::Display for TrapDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_trap(self.0, f)
    }
}

pub fn record(frame: &TrapFrame) {
    *LAST_TRAP.lock() = Some(*frame);
}

pub fn last_trap() -> Option<TrapFrame> {
    *LAST_TRAP.lock()
}

/// Logs an unrecoverable condition and halts.
#[cold]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    log_error!(target: "trap", "FATAL: {}", args);
    panic!("{}", args);
}
