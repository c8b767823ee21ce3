//! The one place ptrace(2) is called from.
//!
//! Everything in the crate goes through [`Process::ptrace`]-style wrappers
//! defined here so that a multi-threaded embedder can interpose its own
//! serialization: a per-process ptrace wrapper, a process-global lock hook
//! invoked at outermost trace acquisition/release, and a process-global
//! unwinder-pad hook notified when an exec() forces a state reset.

use nix::errno::Errno;
use std::ffi::c_void;
use std::os::raw::{c_long, c_uint};
use std::sync::Mutex;

use crate::error::Result;

pub type Request = c_uint;

pub use libc::{
    PTRACE_CONT, PTRACE_DETACH, PTRACE_GETEVENTMSG, PTRACE_INTERRUPT, PTRACE_LISTEN,
    PTRACE_PEEKDATA, PTRACE_PEEKTEXT, PTRACE_PEEKUSER, PTRACE_POKEDATA, PTRACE_POKETEXT,
    PTRACE_POKEUSER, PTRACE_SEIZE, PTRACE_SETOPTIONS, PTRACE_SINGLESTEP,
};

/// The ptrace options we always trace with: we must hear about exec(),
/// fork()/vfork() (to scrub breakpoints out of children), and impending
/// exits (to catch early-vanishing forked children).  TRACECLONE is added
/// separately and dropped again once the first clone is seen.
pub const TRACE_OPTIONS: libc::c_int = libc::PTRACE_O_TRACEEXEC
    | libc::PTRACE_O_TRACEFORK
    | libc::PTRACE_O_TRACEVFORK
    | libc::PTRACE_O_TRACEEXIT;

pub const TRACE_OPTIONS_CLONE: libc::c_int = TRACE_OPTIONS | libc::PTRACE_O_TRACECLONE;

/// Signature of a ptrace wrapper.  The default simply issues the syscall;
/// an embedder can substitute one that routes the call onto a dedicated
/// thread (ptrace is thread-affine on Linux).
pub type PtraceWrapper =
    fn(request: Request, pid: libc::pid_t, addr: *mut c_void, data: *mut c_void) -> c_long;

/// Signature of a waitpid wrapper, for embedders that must route waits
/// onto the same thread as their ptrace calls.
pub type WaitpidWrapper =
    fn(pid: libc::pid_t, status: *mut libc::c_int, options: libc::c_int) -> libc::pid_t;

pub fn default_waitpid_wrapper(
    pid: libc::pid_t,
    status: *mut libc::c_int,
    options: libc::c_int,
) -> libc::pid_t {
    unsafe { libc::waitpid(pid, status, options) }
}

/// Invoked with `true` when a process's trace count rises from zero, and
/// with `false` when it falls back to zero.  Nested trace requests do not
/// re-invoke it.
pub type PtraceLockHook = fn(pid: libc::pid_t, acquire: bool);

/// Notified when an exec() was detected and the handle's per-address-space
/// state has been reset.  The corresponding control-flow unwind is the
/// `Error::ExecDetected` variant propagating out of the operation.
pub type UnwinderPadHook = fn(pid: libc::pid_t);

pub fn default_ptrace_wrapper(
    request: Request,
    pid: libc::pid_t,
    addr: *mut c_void,
    data: *mut c_void,
) -> c_long {
    unsafe { libc::ptrace(request, pid, addr, data) }
}

lazy_static! {
    static ref LOCK_HOOK: Mutex<Option<PtraceLockHook>> = Mutex::new(None);
    static ref UNWINDER_PAD: Mutex<Option<UnwinderPadHook>> = Mutex::new(None);
    static ref PROCFS_PATH: Mutex<String> = Mutex::new("/proc".to_string());
}

/// Install the process-global ptrace lock hook.  Set once, before any
/// handle is created.
pub fn set_ptrace_lock_hook(hook: PtraceLockHook) {
    *LOCK_HOOK.lock().unwrap() = Some(hook);
}

pub(crate) fn lock_hook(pid: libc::pid_t, acquire: bool) {
    if let Some(hook) = *LOCK_HOOK.lock().unwrap() {
        hook(pid, acquire);
    }
}

/// Install the process-global exec-unwind notification hook.
pub fn set_unwinder_pad(hook: UnwinderPadHook) {
    *UNWINDER_PAD.lock().unwrap() = Some(hook);
}

pub(crate) fn unwinder_pad(pid: libc::pid_t) {
    if let Some(hook) = *UNWINDER_PAD.lock().unwrap() {
        hook(pid);
    }
}

/// Override the procfs mount point (default `/proc`).  Process-global.
pub fn set_procfs_path(path: &str) {
    *PROCFS_PATH.lock().unwrap() = path.to_string();
}

pub fn procfs_path() -> String {
    PROCFS_PATH.lock().unwrap().clone()
}

/// Issue a ptrace request through the given wrapper, converting the
/// -1/errno convention into a `Result`.
pub fn ptrace(
    wrapper: PtraceWrapper,
    request: Request,
    pid: libc::pid_t,
    addr: u64,
    data: u64,
) -> Result<c_long> {
    Errno::clear();
    let ret = wrapper(request, pid, addr as *mut c_void, data as *mut c_void);
    if ret == -1 && Errno::last_raw() != 0 {
        return Err(Errno::last().into());
    }
    Ok(ret)
}

/// PEEK-class requests return the peeked word, so -1 is ambiguous: clear
/// errno first and only treat -1 as an error if errno changed.
pub fn ptrace_peek(
    wrapper: PtraceWrapper,
    request: Request,
    pid: libc::pid_t,
    addr: u64,
) -> Result<c_long> {
    Errno::clear();
    let ret = wrapper(request, pid, addr as *mut c_void, std::ptr::null_mut());
    if ret == -1 && Errno::last_raw() != 0 {
        return Err(Errno::last().into());
    }
    Ok(ret)
}
