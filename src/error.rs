use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// Errors produced by the process-control and probe-provider cores.
///
/// A few variants have latching semantics on the process handle:
/// `Dead` is sticky (every later operation on the handle short-circuits
/// with it), and `ExecDetected` indicates that the handle's caches have
/// already been reset by the event dispatch that noticed the exec().
#[derive(Debug, Error)]
pub enum Error {
    /// The target process disappeared (ESRCH or a read that looks like it).
    #[error("process {0} is dead")]
    Dead(libc::pid_t),

    /// An exec() was detected while an operation was in flight.  All
    /// per-address-space state (breakpoints, auxv, mappings, symbol tables)
    /// has been discarded; the process is in trace-stop.  Callers unwind,
    /// clean up their own state, and re-propagate.
    #[error("exec() detected in process {0}")]
    ExecDetected(libc::pid_t),

    /// The handle was grabbed noninvasively; ptrace-dependent operations
    /// are not available.
    #[error("process {0} is attached noninvasively")]
    Noninvasive(libc::pid_t),

    /// A breakpoint instruction not owned by us is already present at the
    /// address (e.g. a competing debugger).
    #[error("address {0:#x} already carries a foreign breakpoint")]
    BkptBusy(u64),

    /// The dynamic linker has not initialized yet; r_brk-dependent
    /// operations cannot run.
    #[error("runtime linker not ready in process {0}")]
    LinkMapsNotReady(libc::pid_t),

    /// No ISA implementation for this (bitness, machine) pair.
    #[error("unsupported target: elf64={elf64}, e_machine={machine}")]
    UnsupportedIsa { elf64: bool, machine: u16 },

    /// Scalar read size constraint violated (narrowing, or > 8 bytes).
    #[error("cannot widen {nbytes}-byte read into {scalar}-byte scalar")]
    BadScalar { nbytes: usize, scalar: usize },

    /// A probe description did not match any known or providable probe.
    #[error("no probe matches {0}")]
    NoProbe(String),

    /// Trampoline construction could not resolve a needed external symbol.
    #[error("unresolved external {0} while emitting trampoline")]
    Unresolved(String),

    /// The kernel's BPF verifier rejected a program.
    #[error("BPF verifier rejected program: {0}")]
    Verifier(String),

    #[error("ELF parse error: {0}")]
    Elf(String),

    #[error(transparent)]
    Sys(#[from] Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error means the target is gone for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Dead(_)) || matches!(self, Error::Sys(Errno::ESRCH))
    }
}

impl From<goblin::error::Error> for Error {
    fn from(e: goblin::error::Error) -> Self {
        Error::Elf(e.to_string())
    }
}
