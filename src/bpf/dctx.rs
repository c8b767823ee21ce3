//! The fixed per-firing context layout shared by every trampoline and
//! every compiled clause.
//!
//! Field offsets here are compile-time constants used as literal store
//! offsets in emitted code.  The layouts are `repr(C)`, the offsets are
//! spelled out, and the tests pin them against the real structs.

use static_assertions::const_assert;
use std::os::raw::c_void;

/// Number of probe argument slots.
pub const DMST_ARGC: usize = 10;

/// The saved register file, in kernel `pt_regs` layout for the build
/// architecture.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Copy, Clone)]
pub struct PtRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Copy, Clone)]
pub struct PtRegs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[repr(C)]
#[derive(Copy, Clone)]
pub struct PtRegs {
    pub regs: [u64; 21],
}

/// Offsets into `pt_regs` of the function parameter registers, the
/// return value register, the instruction pointer and the stack pointer.
#[cfg(target_arch = "x86_64")]
pub mod pt_regs_off {
    pub fn arg(n: usize) -> i16 {
        // rdi, rsi, rdx, rcx, r8, r9
        (match n {
            0 => 14 * 8,
            1 => 13 * 8,
            2 => 12 * 8,
            3 => 11 * 8,
            4 => 9 * 8,
            5 => 8 * 8,
            _ => unreachable!(),
        }) as i16
    }

    pub fn ret() -> i16 {
        10 * 8 // rax
    }

    pub fn ip() -> i16 {
        16 * 8 // rip
    }

    pub fn sp() -> i16 {
        19 * 8 // rsp
    }
}

#[cfg(target_arch = "aarch64")]
pub mod pt_regs_off {
    pub fn arg(n: usize) -> i16 {
        assert!(n < 8);
        (n * 8) as i16
    }

    pub fn ret() -> i16 {
        0 // x0
    }

    pub fn ip() -> i16 {
        32 * 8 // pc
    }

    pub fn sp() -> i16 {
        31 * 8
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub mod pt_regs_off {
    pub fn arg(n: usize) -> i16 {
        (n * 8) as i16
    }
    pub fn ret() -> i16 {
        0
    }
    pub fn ip() -> i16 {
        0
    }
    pub fn sp() -> i16 {
        8
    }
}

/// The per-firing machine state.
#[repr(C)]
pub struct MachineState {
    /// Enabled probe ID.
    pub epid: u32,
    /// Probe ID.
    pub prid: u32,
    /// Clause ID, unique per probe.
    pub clid: u32,
    pub tag: u32,
    /// Current top of scratch space.
    pub scratch_top: u32,
    pub syscall_errno: i32,
    /// Used to scalarize pointers.
    pub scalarizer: u64,
    /// Fault flags.
    pub fault: u64,
    /// Cached timestamp value.
    pub tstamp: u64,
    pub regs: PtRegs,
    /// Probe arguments.
    pub argv: [u64; DMST_ARGC],
}

// repr(C) offsets, used as literal offsets by the emitters.
pub const DMST_EPID: i16 = 0;
pub const DMST_PRID: i16 = 4;
pub const DMST_CLID: i16 = 8;
pub const DMST_TAG: i16 = 12;
pub const DMST_FAULT: i16 = 32;
pub const DMST_TSTAMP: i16 = 40;
pub const DMST_REGS: i16 = 48;

pub fn dmst_arg(n: usize) -> i16 {
    (DMST_REGS as usize + std::mem::size_of::<PtRegs>() + n * 8) as i16
}

pub const MST_SIZE: i16 = std::mem::size_of::<MachineState>() as i16;

/// The context handed by pointer to every compiled clause.
#[repr(C)]
pub struct DtContext {
    /// The raw kernel-provided BPF context.
    pub ctx: *mut c_void,
    /// The per-session activity cell.
    pub act: *mut u32,
    pub mst: *mut MachineState,
    /// Trace output scratch buffer.
    pub buf: *mut u8,
    /// General scratch: stack-trace space and tstring slots (shared),
    /// strtok state, tuple assembly area.
    pub mem: *mut u8,
    /// Scratch space for alloca and friends.
    pub scratchmem: *mut u8,
    /// String constants table.
    pub strtab: *mut u8,
    /// Aggregation data.
    pub agg: *mut u8,
    /// Global variables.
    pub gvars: *mut u8,
    /// Local variables.
    pub lvars: *mut u8,
}

pub const DCTX_CTX: i16 = 0;
pub const DCTX_ACT: i16 = 8;
pub const DCTX_MST: i16 = 16;
pub const DCTX_BUF: i16 = 24;
pub const DCTX_MEM: i16 = 32;
pub const DCTX_SCRATCHMEM: i16 = 40;
pub const DCTX_STRTAB: i16 = 48;
pub const DCTX_AGG: i16 = 56;
pub const DCTX_GVARS: i16 = 64;
pub const DCTX_LVARS: i16 = 72;

pub const DCTX_SIZE: i16 = std::mem::size_of::<DtContext>() as i16;

// The BPF frame pointer points one past the end of the stack; the dctx
// sits right below it, the machine state right below that.
pub const DCTX_FP_BASE: i16 = -DCTX_SIZE;
pub const MST_FP_BASE: i16 = DCTX_FP_BASE - MST_SIZE;

/// Stack slots below the machine state, for provider save/restore use.
pub fn tramp_sp_slot(n: usize) -> i16 {
    MST_FP_BASE - 8 - (n as i16) * 8
}

// Emitted code assumes pointer-sized fields at 8-byte strides.
const_assert!(std::mem::size_of::<*mut c_void>() == 8);
const_assert!(std::mem::size_of::<DtContext>() == 80);

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn dctx_offsets_match_layout() {
        assert_eq!(DCTX_CTX as usize, offset_of!(DtContext, ctx));
        assert_eq!(DCTX_ACT as usize, offset_of!(DtContext, act));
        assert_eq!(DCTX_MST as usize, offset_of!(DtContext, mst));
        assert_eq!(DCTX_BUF as usize, offset_of!(DtContext, buf));
        assert_eq!(DCTX_MEM as usize, offset_of!(DtContext, mem));
        assert_eq!(DCTX_SCRATCHMEM as usize, offset_of!(DtContext, scratchmem));
        assert_eq!(DCTX_STRTAB as usize, offset_of!(DtContext, strtab));
        assert_eq!(DCTX_AGG as usize, offset_of!(DtContext, agg));
        assert_eq!(DCTX_GVARS as usize, offset_of!(DtContext, gvars));
        assert_eq!(DCTX_LVARS as usize, offset_of!(DtContext, lvars));
    }

    #[test]
    fn machine_state_offsets_match_layout() {
        assert_eq!(DMST_EPID as usize, offset_of!(MachineState, epid));
        assert_eq!(DMST_PRID as usize, offset_of!(MachineState, prid));
        assert_eq!(DMST_CLID as usize, offset_of!(MachineState, clid));
        assert_eq!(DMST_TAG as usize, offset_of!(MachineState, tag));
        assert_eq!(DMST_FAULT as usize, offset_of!(MachineState, fault));
        assert_eq!(DMST_TSTAMP as usize, offset_of!(MachineState, tstamp));
        assert_eq!(DMST_REGS as usize, offset_of!(MachineState, regs));
        assert_eq!(dmst_arg(0) as usize, offset_of!(MachineState, argv));
        assert_eq!(dmst_arg(1) - dmst_arg(0), 8);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn pt_regs_offsets_match_layout() {
        assert_eq!(pt_regs_off::arg(0) as usize, offset_of!(PtRegs, rdi));
        assert_eq!(pt_regs_off::arg(1) as usize, offset_of!(PtRegs, rsi));
        assert_eq!(pt_regs_off::arg(2) as usize, offset_of!(PtRegs, rdx));
        assert_eq!(pt_regs_off::arg(3) as usize, offset_of!(PtRegs, rcx));
        assert_eq!(pt_regs_off::arg(4) as usize, offset_of!(PtRegs, r8));
        assert_eq!(pt_regs_off::arg(5) as usize, offset_of!(PtRegs, r9));
        assert_eq!(pt_regs_off::ret() as usize, offset_of!(PtRegs, rax));
        assert_eq!(pt_regs_off::ip() as usize, offset_of!(PtRegs, rip));
        assert_eq!(pt_regs_off::sp() as usize, offset_of!(PtRegs, rsp));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn frame_layout_fits_the_bpf_stack() {
        // dctx + machine state + the provider scratch slots must stay
        // inside the 512-byte BPF frame.
        assert!(-(tramp_sp_slot(DMST_ARGC) as i32) <= 512);
    }
}
