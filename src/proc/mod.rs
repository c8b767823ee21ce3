//! The process-control core: attach to or spawn a target, keep a ptrace
//! state machine over it, and expose memory, mapping, symbol, breakpoint
//! and runtime-linker services to the providers above.

use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use crate::error::{Error, Result};

pub mod auxv;
pub mod bkpt;
pub mod isa;
pub mod maps;
pub mod mem;
pub mod ptrace;
pub mod rtld;
pub mod symtab;
pub mod wait;

pub use bkpt::{BkptHandler, BkptNotifier};
pub use maps::{FileInfo, MapPerms, Mapping};
pub use ptrace::{
    set_procfs_path, set_ptrace_lock_hook, set_unwinder_pad, PtraceWrapper, WaitpidWrapper,
};
pub use rtld::RtldAgent;

/// Abstract state of a managed process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessState {
    /// Running, or at least not known to be stopped.
    Run,
    /// Stopped by a stopping signal (job control); state changes are still
    /// observable via PTRACE_LISTEN.
    Stop,
    /// Stopped by ptrace: an interrupt, an event stop, or a breakpoint.
    TraceStop,
    /// Gone.  Sticky.
    Dead,
}

/// How to let go of a process in [`Process::release`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReleaseMode {
    /// Detach and clean up.
    Normal,
    /// SIGKILL, then detach.
    Kill,
    /// Tear down our data structures but leave the tracee attached and
    /// stopped: used when this tracer is about to replace itself.
    NoDetach,
}

/// Noninvasiveness requested of [`Process::grab`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Grab {
    /// ptrace or fail.
    Invasive,
    /// Try to ptrace; fall back to reads-only monitoring on failure.
    InvasiveOrFallBack,
    /// Never ptrace.
    Noninvasive,
}

/// One attached-or-created process.
///
/// Not thread-safe; a consumer calling in from several threads must
/// serialize externally (and can use the ptrace wrapper and lock hooks in
/// [`ptrace`] to do so).  Never reuse a handle after [`Process::release`].
pub struct Process {
    pid: libc::pid_t,
    state: ProcessState,
    released: bool,
    ptraced: bool,
    noninvasive: bool,

    trace_count: usize,
    /// States of enclosing trace requests, pushed at each nesting level.
    trace_states: Vec<ProcessState>,
    trace_halted: bool,
    pending_stops: usize,
    awaiting_pending_stops: usize,
    group_stopped: bool,
    listening: bool,
    /// Detach once no trace requests, breakpoints or linker agent remain.
    detach: bool,

    /// Probably statically linked (no PT_DYNAMIC).
    pub(crate) no_dyn: bool,
    pub(crate) elf64: bool,
    pub(crate) elf_machine: u16,
    isa: Option<&'static dyn isa::IsaOps>,

    memfd: Option<File>,
    map_files_checked: bool,
    map_files_ok: bool,

    pub(crate) info_valid: bool,
    pub(crate) lmids_valid: bool,
    /// Guard against recursion: the lmid walk itself looks up
    /// `_rtld_global` by name, which must not re-enter the walk.
    pub(crate) lmids_updating: bool,
    pub(crate) mappings: Vec<Mapping>,
    /// Mapping indices hashed by backing pathname.
    pub(crate) map_names: HashMap<String, Vec<usize>>,
    /// Mapping indices hashed by (device, inode).
    pub(crate) map_inum: HashMap<(u64, u64), Vec<usize>>,
    pub(crate) files: Vec<Rc<RefCell<FileInfo>>>,
    pub(crate) map_exec: Option<usize>,
    pub(crate) map_ldso: Option<usize>,

    pub(crate) auxv: Option<Vec<(u64, u64)>>,
    pub(crate) r_debug_addr: Option<u64>,

    pub(crate) bkpts: HashMap<u64, bkpt::Breakpoint>,
    /// Address of the breakpoint currently being stepped past, if any.
    pub(crate) tracing_bkpt: u64,
    pub(crate) bkpt_halted: bool,
    /// Consume SIGTRAPs quietly instead of dispatching handlers.
    pub(crate) bkpt_consume: bool,

    pub(crate) rap: Option<Rc<RtldAgent>>,

    ptrace_wrap: PtraceWrapper,
    wait_wrap: ptrace::WaitpidWrapper,
}

impl Process {
    fn new(pid: libc::pid_t, state: ProcessState) -> Process {
        Process {
            pid,
            state,
            released: false,
            ptraced: false,
            noninvasive: false,
            trace_count: 0,
            trace_states: Vec::new(),
            trace_halted: false,
            pending_stops: 0,
            awaiting_pending_stops: 0,
            group_stopped: false,
            listening: false,
            detach: false,
            no_dyn: false,
            elf64: true,
            elf_machine: 0,
            isa: None,
            memfd: None,
            map_files_checked: false,
            map_files_ok: false,
            info_valid: false,
            lmids_valid: false,
            lmids_updating: false,
            mappings: Vec::new(),
            map_names: HashMap::new(),
            map_inum: HashMap::new(),
            files: Vec::new(),
            map_exec: None,
            map_ldso: None,
            auxv: None,
            r_debug_addr: None,
            bkpts: HashMap::new(),
            tracing_bkpt: 0,
            bkpt_halted: false,
            bkpt_consume: false,
            rap: None,
            ptrace_wrap: ptrace::default_ptrace_wrapper,
            wait_wrap: ptrace::default_waitpid_wrapper,
        }
    }

    /// Fork a child, reset its credentials if set-id, hold it on a pipe
    /// until we have seized it with our tracing options, then let it exec.
    /// On return the child is trace-stopped at the exec.
    pub fn create(file: &str, argv: &[&str]) -> Result<Process> {
        let cfile = CString::new(file).map_err(|_| Errno::ENOENT)?;
        let cargs: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(*a).unwrap_or_default())
            .collect();

        let (block_r, block_w) = nix::unistd::pipe().map_err(Error::Sys)?;

        let pid = match unsafe { fork() }.map_err(Error::Sys)? {
            ForkResult::Child => {
                // If running setuid or setgid, reset credentials to
                // normal, then wait for our parent to seize us.
                let gid = nix::unistd::getgid();
                if gid != nix::unistd::getegid() {
                    let _ = nix::unistd::setgid(gid);
                }
                let uid = nix::unistd::getuid();
                if uid != nix::unistd::geteuid() {
                    let _ = nix::unistd::setuid(uid);
                }

                drop(block_w);
                let mut gate = File::from(block_r);
                let mut byte = [0u8; 1];
                let _ = gate.read(&mut byte);
                drop(gate);

                let _ = execvp(&cfile, &cargs);
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => child.as_raw(),
        };
        drop(block_r);

        // We seize explicitly rather than via trace(), so the trace count
        // and lock hook must be maintained by hand.
        let mut p = Process::new(pid, ProcessState::TraceStop);
        p.trace_count = 1;
        p.ptraced = true;
        p.trace_halted = true;
        p.trace_states.push(ProcessState::Run);
        ptrace::lock_hook(pid, true);

        let res = (|| -> Result<()> {
            ptrace::ptrace(
                p.ptrace_wrap,
                ptrace::PTRACE_SEIZE,
                pid,
                0,
                ptrace::TRACE_OPTIONS_CLONE as u64,
            )?;
            drop(block_w); // releases the child into exec()

            let mut status = 0i32;
            let rc = unsafe { libc::waitpid(pid, &mut status, libc::__WALL) };
            let exec_stop = (status >> 8)
                == (libc::SIGTRAP | (libc::PTRACE_EVENT_EXEC << 8));
            if rc != pid || !libc::WIFSTOPPED(status) || !exec_stop {
                debug!("create: exec of {} failed", file);
                return Err(Errno::ENOENT.into());
            }

            p.memfd()?;
            p.read_isa_info()?;
            Ok(())
        })();

        match res {
            Ok(()) => {
                debug!("create: forked off PID {} from {}", pid, file);
                Ok(p)
            }
            Err(e) => {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                ptrace::lock_hook(pid, false);
                Err(e)
            }
        }
    }

    /// Grab an existing process.  Try to force it to stop; failing that is
    /// an error only for `Grab::Invasive`.  If `already_traced`, the
    /// caller has put the process in ptrace trace-stop itself.
    pub fn grab(pid: libc::pid_t, mode: Grab, already_traced: bool) -> Result<Process> {
        kill(Pid::from_raw(pid), None).map_err(Error::Sys)?;

        let mut p = Process::new(
            pid,
            if already_traced {
                ProcessState::TraceStop
            } else {
                ProcessState::Run
            },
        );
        p.detach = true;

        let mut noninvasive = mode == Grab::Noninvasive;
        if !noninvasive {
            match p.memfd() {
                Err(e) if mode == Grab::Invasive => return Err(e),
                Err(_) => noninvasive = true,
                Ok(_) if already_traced => {
                    p.trace_count = 1;
                    p.trace_states.push(ProcessState::Run);
                    p.ptraced = true;
                    p.trace_halted = true;
                }
                Ok(_) => match p.trace(true) {
                    Ok(_) => {}
                    Err(e) if mode == Grab::Invasive => return Err(e),
                    Err(_) => {
                        p.memfd = None;
                        noninvasive = true;
                    }
                },
            }
        }

        if noninvasive {
            debug!("{}: grabbing noninvasively", pid);
            p.noninvasive = true;
        }

        p.read_isa_info()?;
        debug!("grab: grabbed PID {}", pid);
        Ok(p)
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn elf64(&self) -> bool {
        self.elf64
    }

    pub fn elf_machine(&self) -> u16 {
        self.elf_machine
    }

    pub fn traceable(&self) -> bool {
        !self.noninvasive
    }

    pub(crate) fn is_ptraced(&self) -> bool {
        self.ptraced
    }

    pub fn noninvasive(&self) -> bool {
        self.noninvasive
    }

    /// True if the process is probably statically linked.
    pub fn dynamically_linked(&mut self) -> bool {
        let _ = self.r_debug();
        !self.no_dyn
    }

    pub(crate) fn ptrace_wrapper(&self) -> PtraceWrapper {
        self.ptrace_wrap
    }

    /// Substitute the ptrace syscall wrapper (e.g. to route all calls onto
    /// one thread).  Pass `None` to restore the direct syscall.
    pub fn set_ptrace_wrapper(&mut self, wrapper: Option<PtraceWrapper>) {
        self.ptrace_wrap = wrapper.unwrap_or(ptrace::default_ptrace_wrapper);
    }

    /// Substitute the waitpid wrapper, for the same reason.
    pub fn set_wait_wrapper(&mut self, wrapper: Option<ptrace::WaitpidWrapper>) {
        self.wait_wrap = wrapper.unwrap_or(ptrace::default_waitpid_wrapper);
    }

    pub(crate) fn wait_wrapper(&self) -> ptrace::WaitpidWrapper {
        self.wait_wrap
    }

    pub(crate) fn isa(&self) -> Result<&'static dyn isa::IsaOps> {
        self.isa.ok_or(Error::UnsupportedIsa {
            elf64: self.elf64,
            machine: self.elf_machine,
        })
    }

    /// Issue a ptrace request on this process.
    pub(crate) fn pt(&mut self, request: ptrace::Request, addr: u64, data: u64) -> Result<i64> {
        let r = ptrace::ptrace(self.ptrace_wrap, request, self.pid, addr, data)?;
        Ok(r as i64)
    }

    /// PEEK-class ptrace request (result word, errno disambiguation).
    pub(crate) fn pt_peek(&mut self, request: ptrace::Request, addr: u64) -> Result<i64> {
        let r = ptrace::ptrace_peek(self.ptrace_wrap, request, self.pid, addr)?;
        Ok(r as i64)
    }

    /// The memory file descriptor, opening `/proc/<pid>/mem` on first use.
    pub fn memfd(&mut self) -> Result<RawFd> {
        if let Some(f) = &self.memfd {
            return Ok(f.as_raw_fd());
        }
        let path = format!("{}/{}/mem", ptrace::procfs_path(), self.pid);
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .or_else(|_| std::fs::OpenOptions::new().read(true).open(&path))
            .map_err(|e| {
                debug!("{}: cannot open {}: {}", self.pid, path, e);
                Error::Io(e)
            })?;
        self.memfd = Some(f);
        Ok(self.memfd.as_ref().unwrap().as_raw_fd())
    }

    /// Whether the kernel exposes a usable `/proc/<pid>/map_files`
    /// directory (it needs CAP_SYS_ADMIN on older kernels).
    pub(crate) fn map_files_usable(&mut self) -> bool {
        if !self.map_files_checked {
            let path = format!("{}/{}/map_files", ptrace::procfs_path(), self.pid);
            self.map_files_ok = std::fs::read_dir(&path)
                .map(|mut d| d.next().is_some())
                .unwrap_or(false);
            self.map_files_checked = true;
        }
        self.map_files_ok
    }

    /// Sniff the ELF class and machine of the main executable and select
    /// the ISA implementation.
    pub(crate) fn read_isa_info(&mut self) -> Result<()> {
        let path = format!("{}/{}/exe", ptrace::procfs_path(), self.pid);
        let mut hdr = [0u8; 20];
        let mut f = File::open(&path)?;
        f.read_exact(&mut hdr)?;
        if &hdr[..4] != b"\x7fELF" {
            debug!("{} is not an ELF file", path);
            return Err(Error::Elf(format!("{} is not an ELF file", path)));
        }
        self.elf64 = hdr[4] == 2; // EI_CLASS == ELFCLASS64
        self.elf_machine = u16::from_ne_bytes([hdr[18], hdr[19]]);
        self.isa = Some(isa::lookup(self.elf64, self.elf_machine)?);
        Ok(())
    }

    /// If true, detach the process once no trace requests, breakpoints or
    /// linker agent remain.  Otherwise leave it attached but running.
    pub fn set_detached(&mut self, detach: bool) {
        self.detach = detach;
    }

    /// Grab a trace, unless one is already grabbed: increment the trace
    /// count.  With `stopped`, the process is in trace-stop on successful
    /// return (unless it died first).  Callers nest freely.
    pub fn trace(&mut self, stopped: bool) -> Result<()> {
        if self.noninvasive {
            return Err(Error::Noninvasive(self.pid));
        }

        if self.trace_count == 0 {
            ptrace::lock_hook(self.pid, true);
        }
        self.trace_count += 1;
        self.trace_states.push(self.state);

        let res = self.trace_acquire(stopped);
        if res.is_err() {
            self.trace_count -= 1;
            self.trace_states.pop();
            if self.trace_count == 0 {
                ptrace::lock_hook(self.pid, false);
            }
        }
        res
    }

    fn trace_acquire(&mut self, stopped: bool) -> Result<()> {
        if self.ptraced {
            // Drain anything already queued before demanding a stop, and
            // do not try to stop something already trace-stopped.
            self.wait(false)?;
            if let Some(top) = self.trace_states.last_mut() {
                *top = self.state;
            }
            if !stopped || self.state == ProcessState::TraceStop {
                return Ok(());
            }
            if self.state == ProcessState::Dead {
                return Err(Error::Dead(self.pid));
            }

            // If the tracee is in a group-stop we are LISTENing on, only
            // the interrupt event clears the listening state; hang on
            // until it is processed.
            let listen_interrupt = self.listening;
            self.trace_halted = true;

            self.pt(ptrace::PTRACE_INTERRUPT, 0, 0)?;
            self.pending_stops += 1;
            self.awaiting_pending_stops += 1;
            while self.pending_stops > 0
                && (self.state == ProcessState::Run || (listen_interrupt && self.listening))
            {
                let r = self.wait(true);
                if r.is_err() {
                    self.awaiting_pending_stops -= 1;
                    return r.map(|_| ());
                }
            }
            self.awaiting_pending_stops -= 1;
            return Ok(());
        }

        self.pt(
            ptrace::PTRACE_SEIZE,
            0,
            ptrace::TRACE_OPTIONS_CLONE as u64,
        )?;
        self.ptraced = true;

        if stopped {
            self.trace_halted = true;
            if let Err(e) = self.pt(ptrace::PTRACE_INTERRUPT, 0, 0) {
                let _ = self.pt(ptrace::PTRACE_DETACH, 0, 0);
                self.ptraced = false;
                return Err(e);
            }

            // Wait for the interrupt to trickle in.
            self.pending_stops += 1;
            self.awaiting_pending_stops += 1;
            while self.pending_stops > 0 && self.state == ProcessState::Run {
                let r = self.wait(true);
                if r.is_err() {
                    self.awaiting_pending_stops -= 1;
                    return r.map(|_| ());
                }
            }
            self.awaiting_pending_stops -= 1;

            if self.state != ProcessState::TraceStop && self.state != ProcessState::Stop {
                return Err(Error::Dead(self.pid));
            }
        }
        Ok(())
    }

    /// Release one trace request, resuming the process if the balancing
    /// [`Process::trace`] stopped it.  At count zero, resume — through the
    /// breakpoint resumer, in case we are halted at one — or detach
    /// entirely if detaching was requested and nothing pins us.
    ///
    /// With `leave_stopped`, the process is not restarted; resumption is
    /// up to the caller.
    pub fn untrace(&mut self, leave_stopped: bool) {
        if !self.ptraced || self.trace_count == 0 {
            return;
        }

        self.trace_count -= 1;
        let prev_state = self.trace_states.pop().unwrap_or(ProcessState::Run);

        if self.trace_count > 0 || self.bkpt_halted || leave_stopped
            || prev_state != ProcessState::Run
        {
            if prev_state == ProcessState::Run && self.state == ProcessState::TraceStop {
                debug!("{}: continuing: previous state was RUN", self.pid);
                // bkpt_continue() resets our state except when we turn out
                // not to be stopped at a breakpoint at all.
                if !self.bkpt_continue() {
                    self.state = prev_state;
                }
                self.trace_halted = false;
            } else if prev_state == ProcessState::Stop && self.state == ProcessState::TraceStop {
                self.state = prev_state;
                self.group_stopped = true;
                self.listening = true;
                debug!("{}: LISTENing: previous state was STOP", self.pid);
                let _ = self.pt(ptrace::PTRACE_LISTEN, 0, 0);
            }

            if self.trace_count == 0 {
                ptrace::lock_hook(self.pid, false);
            }
            return;
        }

        // At top level, not halted at a breakpoint.
        if !self.detach || self.rap.is_some() || !self.bkpts.is_empty() {
            if self.state == ProcessState::TraceStop {
                debug!("{}: continuing", self.pid);
                if !self.bkpt_continue() {
                    self.state = ProcessState::Run;
                }
                self.trace_halted = false;
                let _ = self.wait(false);
            }
        } else {
            debug!("{}: detaching", self.pid);
            self.state = ProcessState::Run;
            self.ptraced = false;
            if let Err(Error::Sys(Errno::ESRCH)) = self.pt(ptrace::PTRACE_DETACH, 0, 0) {
                self.state = ProcessState::Dead;
            }
            self.trace_halted = false;
            self.info_valid = false;
        }

        ptrace::lock_hook(self.pid, false);
    }

    /// Change the state recorded at the top of the trace-request stack.
    pub(crate) fn set_orig_state(&mut self, state: ProcessState) {
        if let Some(top) = self.trace_states.last_mut() {
            *top = state;
        }
    }

    pub(crate) fn trace_halted(&self) -> bool {
        self.trace_halted
    }

    pub(crate) fn group_stopped(&self) -> bool {
        self.group_stopped
    }

    /// Let go of the process.  The handle may not be used afterwards
    /// except to drop it.
    pub fn release(&mut self, mode: ReleaseMode) {
        if self.released {
            return;
        }

        if let Some(rap) = self.rap.take() {
            rap.release(self);
        }
        self.symtab_release();
        self.trace_states.clear();

        if self.state == ProcessState::Dead {
            debug!("release: releasing handle of dead pid {}", self.pid);
            self.bkpt_flush(None, true);
            self.released = true;
            return;
        }

        self.bkpt_flush(None, mode == ReleaseMode::NoDetach);

        debug!("release: releasing handle, pid {}", self.pid);

        if mode == ReleaseMode::Kill {
            let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
        } else if self.ptraced && mode != ReleaseMode::NoDetach {
            let _ = self.pt(ptrace::PTRACE_DETACH, 0, 0);
        }

        if self.trace_count != 0 && mode != ReleaseMode::NoDetach {
            ptrace::lock_hook(self.pid, false);
        }

        self.state = ProcessState::Dead;
        self.released = true;
    }

    /// Does the process (still) exist?
    pub fn exists(pid: libc::pid_t) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }

    /// The active runtime-linker agent, creating it on first use.
    pub fn rtld_agent(&mut self) -> Result<Rc<RtldAgent>> {
        if let Some(rap) = &self.rap {
            return Ok(Rc::clone(rap));
        }
        let rap = RtldAgent::new(self)?;
        self.rap = Some(Rc::clone(&rap));
        Ok(rap)
    }

    pub(crate) fn procname(&self, leaf: &str) -> String {
        format!("{}/{}/{}", ptrace::procfs_path(), self.pid, leaf)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if !self.released && self.state != ProcessState::Dead {
            self.release(ReleaseMode::Normal);
        }
    }
}
