//! Dynamic-tracing userland core.
//!
//! Two cooperating halves live here.  The process-control core ([`proc`])
//! attaches to or spawns a target, runs a ptrace state machine over it,
//! manages software breakpoints with handler/notifier chains, keeps a
//! symbolic view of the target address space current, and cooperates with
//! the runtime linker to read link maps while the target is mid-`dlopen`.
//! The probe-provider core ([`provider`], [`probe`], [`bpf`]) presents the
//! uniform contract under which probe families advertise, enumerate,
//! enable and arm probes by emitting small BPF trampolines that marshal
//! kernel context into one fixed per-firing layout and call into
//! externally compiled clauses.
//!
//! The D compiler, BPF assembler for user clauses, DOF packaging, CTF
//! readers, buffer consumers and the CLI are external collaborators; they
//! are reached only through the interfaces consumed here (clause function
//! ids, argument descriptors).

#[macro_use]
extern crate lazy_static;

pub mod bpf;
pub mod error;
pub mod probe;
pub mod proc;
pub mod provider;
pub mod session;
pub mod tracefs;

pub use crate::error::{Error, Result};
pub use crate::proc::{Grab, Process, ProcessState, ReleaseMode};
pub use crate::session::Session;
