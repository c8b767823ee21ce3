//! Bitness- and machine-dependent operations.
//!
//! A small dispatch table keyed on `(elf64, e_machine)` selects the
//! implementation of the few register-level operations the breakpoint
//! engine and the pid provider need.  A process whose pair is not in the
//! table fails at attach time rather than at first use.

#[cfg(target_arch = "aarch64")]
use goblin::elf::header::EM_AARCH64;
#[cfg(target_arch = "x86_64")]
use goblin::elf::header::{EM_386, EM_X86_64};
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
use nix::errno::Errno;

use super::ptrace;
use super::Process;
use crate::error::{Error, Result};

/// Operations that differ per ISA.
pub trait IsaOps: Sync {
    /// Read the first integer argument of the function at which the
    /// process is stopped.
    fn read_first_arg(&self, p: &mut Process) -> Result<u64>;

    /// The instruction pointer of the instruction that trapped.  On x86
    /// the reported PC has already advanced past the breakpoint byte and
    /// must be walked back.  With `expect_esrch`, an ESRCH is reported as
    /// `Ok(0)` ("not stopped"), not an error.
    fn bkpt_ip(&self, p: &mut Process, expect_esrch: bool) -> Result<u64>;

    /// Write a corrected PC back, where the platform needs it (x86).
    fn reset_bkpt_ip(&self, p: &mut Process, addr: u64) -> Result<()>;

    /// True on platforms without hardware singlestep, where stepping past
    /// a breakpoint means planting a temporary breakpoint at the next IP.
    fn software_singlestep(&self) -> bool {
        false
    }

    /// Compute the next instruction pointer (software-singlestep
    /// platforms only).
    fn next_ip(&self, p: &mut Process) -> Result<u64> {
        let _ = p;
        Err(Error::UnsupportedIsa { elf64: true, machine: 0 })
    }
}

/// Select the ISA ops for a process, or fail with `UnsupportedIsa`.
pub fn lookup(elf64: bool, machine: u16) -> Result<&'static dyn IsaOps> {
    for (e64, m, ops) in DISPATCH {
        if *e64 == elf64 && *m == machine {
            return Ok(*ops);
        }
    }
    Err(Error::UnsupportedIsa { elf64, machine })
}

#[cfg(target_arch = "x86_64")]
pub static DISPATCH: &[(bool, u16, &'static dyn IsaOps)] = &[
    (true, EM_X86_64, &X8664Ops),
    (false, EM_386, &X86Ops),
];

#[cfg(target_arch = "aarch64")]
pub static DISPATCH: &[(bool, u16, &'static dyn IsaOps)] = &[(true, EM_AARCH64, &Aarch64Ops)];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub static DISPATCH: &[(bool, u16, &'static dyn IsaOps)] = &[];

/// The breakpoint instruction for the platform, masked onto the low bytes
/// of the word at the breakpoint address.
#[cfg(target_arch = "x86_64")]
pub const BKPT_INSN: &[u8] = &[0xcc]; // int3

#[cfg(target_arch = "aarch64")]
pub const BKPT_INSN: &[u8] = &[0x00, 0x00, 0x20, 0xd4]; // brk #0

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const BKPT_INSN: &[u8] = &[0x00];

/// Overlay the breakpoint instruction onto the start of a machine word.
pub fn mask_bkpt(word: u64) -> u64 {
    let mut bytes = word.to_ne_bytes();
    bytes[..BKPT_INSN.len()].copy_from_slice(BKPT_INSN);
    u64::from_ne_bytes(bytes)
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::*;
    use crate::proc::ProcessState;

    // Offsets (in words) into the x86-64 user regs area, as laid out for
    // PTRACE_PEEKUSER.
    const RDI: u64 = 14;
    const RIP: u64 = 16;
    const RSP: u64 = 19;

    fn peekuser(p: &mut Process, regno: u64) -> Result<i64> {
        let word = ptrace::ptrace_peek(
            p.ptrace_wrapper(),
            ptrace::PTRACE_PEEKUSER,
            p.pid(),
            regno * 8,
        )?;
        Ok(word as i64)
    }

    pub struct X8664Ops;

    impl IsaOps for X8664Ops {
        fn read_first_arg(&self, p: &mut Process) -> Result<u64> {
            if p.state() == ProcessState::Run || p.state() == ProcessState::Dead {
                return Err(Error::Dead(p.pid()));
            }
            // The first integral argument lives in %rdi.
            Ok(peekuser(p, RDI)? as u64)
        }

        fn bkpt_ip(&self, p: &mut Process, expect_esrch: bool) -> Result<u64> {
            match peekuser(p, RIP) {
                // The trap pushes the PC past the int3 byte.
                Ok(ip) => Ok((ip as u64).wrapping_sub(super::BKPT_INSN.len() as u64)),
                Err(Error::Sys(Errno::ESRCH)) if expect_esrch => Ok(0),
                Err(e) => Err(e),
            }
        }

        fn reset_bkpt_ip(&self, p: &mut Process, addr: u64) -> Result<()> {
            ptrace::ptrace(
                p.ptrace_wrapper(),
                ptrace::PTRACE_POKEUSER,
                p.pid(),
                RIP * 8,
                addr,
            )?;
            Ok(())
        }
    }

    pub struct X86Ops;

    impl IsaOps for X86Ops {
        fn read_first_arg(&self, p: &mut Process) -> Result<u64> {
            if p.state() == ProcessState::Run || p.state() == ProcessState::Dead {
                return Err(Error::Dead(p.pid()));
            }
            // 32-bit x86 passes arguments on the stack: the first one sits
            // just above the return address at %esp.
            let sp = peekuser(p, RSP)? as u64;
            p.read_scalar_quietly(4, 8, sp + 4, true)
        }

        fn bkpt_ip(&self, p: &mut Process, expect_esrch: bool) -> Result<u64> {
            match peekuser(p, RIP) {
                Ok(ip) => Ok((ip as u64).wrapping_sub(super::BKPT_INSN.len() as u64)),
                Err(Error::Sys(Errno::ESRCH)) if expect_esrch => Ok(0),
                Err(e) => Err(e),
            }
        }

        fn reset_bkpt_ip(&self, p: &mut Process, addr: u64) -> Result<()> {
            ptrace::ptrace(
                p.ptrace_wrapper(),
                ptrace::PTRACE_POKEUSER,
                p.pid(),
                RIP * 8,
                addr,
            )?;
            Ok(())
        }
    }
}

#[cfg(target_arch = "x86_64")]
use x86::{X8664Ops, X86Ops};

#[cfg(target_arch = "aarch64")]
mod aarch64 {
    use super::*;
    use crate::proc::ProcessState;
    use std::mem;

    const NT_PRSTATUS: libc::c_int = 1;

    fn getregs(p: &mut Process) -> Result<libc::user_regs_struct> {
        let mut regs: libc::user_regs_struct = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: &mut regs as *mut _ as *mut libc::c_void,
            iov_len: mem::size_of::<libc::user_regs_struct>(),
        };
        ptrace::ptrace(
            p.ptrace_wrapper(),
            libc::PTRACE_GETREGSET,
            p.pid(),
            NT_PRSTATUS as u64,
            &mut iov as *mut _ as u64,
        )?;
        Ok(regs)
    }

    pub struct Aarch64Ops;

    impl IsaOps for Aarch64Ops {
        fn read_first_arg(&self, p: &mut Process) -> Result<u64> {
            if p.state() == ProcessState::Run || p.state() == ProcessState::Dead {
                return Err(Error::Dead(p.pid()));
            }
            Ok(getregs(p)?.regs[0])
        }

        fn bkpt_ip(&self, p: &mut Process, expect_esrch: bool) -> Result<u64> {
            // brk does not advance the PC, so no adjustment is needed.
            match getregs(p) {
                Ok(regs) => Ok(regs.pc),
                Err(Error::Sys(Errno::ESRCH)) if expect_esrch => Ok(0),
                Err(e) => Err(e),
            }
        }

        fn reset_bkpt_ip(&self, _p: &mut Process, _addr: u64) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(target_arch = "aarch64")]
use aarch64::Aarch64Ops;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bkpt_mask_overlays_low_bytes() {
        let word = 0x1122334455667788u64;
        let masked = mask_bkpt(word);
        let bytes = masked.to_ne_bytes();
        assert_eq!(&bytes[..BKPT_INSN.len()], BKPT_INSN);
        // The tail of the word is untouched.
        assert_eq!(
            &bytes[BKPT_INSN.len()..],
            &word.to_ne_bytes()[BKPT_INSN.len()..]
        );
    }

    #[test]
    fn dispatch_rejects_unknown_machines() {
        assert!(lookup(true, 0xffff).is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn dispatch_finds_native() {
        assert!(lookup(true, EM_X86_64).is_ok());
        assert!(lookup(false, EM_386).is_ok());
        assert!(lookup(false, EM_X86_64).is_err());
    }
}
