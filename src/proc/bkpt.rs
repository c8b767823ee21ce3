//! The breakpoint engine.
//!
//! Breakpoints are hashed by address and own the original instruction
//! word, one optional handler, and any number of notifiers.  Handlers run
//! either before the singlestep past the original instruction (the usual
//! case) or after it; their return value decides whether the process
//! stays stopped.  Removal from inside a handler is deferred via
//! `pending_removal` until the handler chain returns, because the chain
//! may call back into the engine on its own breakpoint.

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::rc::Rc;

use super::isa::mask_bkpt;
use super::{ptrace, Process, ProcessState};
use crate::error::{Error, Result};

/// A breakpoint handler: returns the state the process should be left
/// in.  `Run` continues past the breakpoint; `TraceStop` (or `Stop`,
/// which is converted) holds the process at it.
pub type BkptHandler = Rc<dyn Fn(&mut Process, u64) -> ProcessState>;

/// A notifier cannot change control flow.
pub type BkptNotifier = Rc<dyn Fn(&mut Process, u64)>;

pub(crate) struct HandlerEntry {
    pub handler: BkptHandler,
    /// Invoked when the breakpoint is deleted or the handle released.
    pub on_delete: Option<Rc<dyn Fn()>>,
}

pub(crate) struct NotifierEntry {
    pub notify: BkptNotifier,
    pub on_delete: Option<Rc<dyn Fn()>>,
}

pub(crate) struct Breakpoint {
    pub addr: u64,
    pub orig_insn: u64,
    pub handler: Option<HandlerEntry>,
    pub notifiers: Vec<NotifierEntry>,
    /// Call the handler after singlestepping rather than before.
    pub after_singlestep: bool,
    pub in_handler: u32,
    pub pending_removal: bool,
    /// Set on a temporary next-instruction breakpoint (software
    /// singlestep): the address of the breakpoint being stepped past.
    pub singlestep_for: Option<u64>,
}

impl Breakpoint {
    fn run_cleanups(&mut self) {
        for n in self.notifiers.drain(..).rev() {
            if let Some(f) = n.on_delete {
                f();
            }
        }
        if let Some(h) = self.handler.take() {
            if let Some(f) = h.on_delete {
                f();
            }
        }
    }
}

impl Process {
    /// Introduce a breakpoint at `addr` with the given handler.
    /// Re-registering an existing address replaces its handler.
    pub fn bkpt<F>(&mut self, addr: u64, after_singlestep: bool, handler: F) -> Result<()>
    where
        F: Fn(&mut Process, u64) -> ProcessState + 'static,
    {
        self.bkpt_with_cleanup(addr, after_singlestep, Rc::new(handler), None)
    }

    pub fn bkpt_with_cleanup(
        &mut self,
        addr: u64,
        after_singlestep: bool,
        handler: BkptHandler,
        on_delete: Option<Rc<dyn Fn()>>,
    ) -> Result<()> {
        if self.noninvasive() {
            return Err(Error::Noninvasive(self.pid()));
        }
        self.add_bkpt(addr, after_singlestep, None, Some((handler, on_delete)))
    }

    /// Add a notifier at `addr`.  One address carries one breakpoint but
    /// any number of notifiers; they share the breakpoint's instruction
    /// storage and after-singlestep property.
    pub fn bkpt_notifier<F>(&mut self, addr: u64, after_singlestep: bool, notifier: F) -> Result<()>
    where
        F: Fn(&mut Process, u64) + 'static,
    {
        if self.noninvasive() {
            return Err(Error::Noninvasive(self.pid()));
        }
        self.add_bkpt(
            addr,
            after_singlestep,
            Some((Rc::new(notifier) as BkptNotifier, None)),
            None,
        )
    }

    fn add_bkpt(
        &mut self,
        addr: u64,
        after_singlestep: bool,
        notifier: Option<(BkptNotifier, Option<Rc<dyn Fn()>>)>,
        handler: Option<(BkptHandler, Option<Rc<dyn Fn()>>)>,
    ) -> Result<()> {
        // Already present?  Just tweak it.
        if self.bkpts.contains_key(&addr) {
            let b = self.bkpts.get_mut(&addr).unwrap();
            match (notifier, handler) {
                (Some((notify, on_delete)), _) => {
                    b.notifiers.push(NotifierEntry { notify, on_delete });
                }
                (_, Some((h, on_delete))) => {
                    if let Some(old) = b.handler.take() {
                        if let Some(f) = old.on_delete {
                            f();
                        }
                    }
                    b.handler = Some(HandlerEntry {
                        handler: h,
                        on_delete,
                    });
                    b.after_singlestep = after_singlestep;
                }
                _ => {}
            }
            return Ok(());
        }

        self.trace(true)?;

        let res = (|| -> Result<()> {
            let orig_insn = self.pt_peek(ptrace::PTRACE_PEEKTEXT, addr)? as u64;

            // A breakpoint instruction we did not put there: a competing
            // debugger owns this address.
            if orig_insn == mask_bkpt(orig_insn) {
                return Err(Error::BkptBusy(addr));
            }

            self.pt(ptrace::PTRACE_POKETEXT, addr, mask_bkpt(orig_insn))?;

            let mut b = Breakpoint {
                addr,
                orig_insn,
                handler: None,
                notifiers: Vec::new(),
                after_singlestep,
                in_handler: 0,
                pending_removal: false,
                singlestep_for: None,
            };
            match (notifier, handler) {
                (Some((notify, on_delete)), _) => {
                    b.notifiers.push(NotifierEntry { notify, on_delete })
                }
                (_, Some((h, on_delete))) => {
                    b.handler = Some(HandlerEntry {
                        handler: h,
                        on_delete,
                    })
                }
                _ => {}
            }
            self.bkpts.insert(addr, b);
            debug!("{}: added breakpoint on {:#x}", self.pid(), addr);
            Ok(())
        })();

        if let Err(ref e) = res {
            debug!(
                "{}: cannot add breakpoint on {:#x}: {}",
                self.pid(),
                addr,
                e
            );
        }

        // With at least one breakpoint in force this untrace resumes the
        // child if we are topmost, but never detaches.
        self.untrace(false);
        res
    }

    /// Remove the breakpoint at `addr`, or (if we are inside its handler
    /// right now) arrange for removal when the handler returns.
    pub fn unbkpt(&mut self, addr: u64) {
        let orig_trace_halted = self.trace_halted();

        if self.bkpts.is_empty() {
            debug!(
                "{}: unbkpt() called with {:#x}, but no breakpoints are outstanding",
                self.pid(),
                addr
            );
            return;
        }

        if let Err(e) = self.trace(true) {
            debug!(
                "{}: unexpected error {} tracing to remove breakpoint",
                self.pid(),
                e
            );
            return;
        }

        let (in_handler, singlestep_real_in_handler) = match self.bkpts.get(&addr) {
            None => {
                debug!(
                    "{}: unbkpt() called with {:#x}, which is not a known breakpoint",
                    self.pid(),
                    addr
                );
                self.untrace(false);
                return;
            }
            Some(b) => (
                b.in_handler > 0,
                b.singlestep_for
                    .and_then(|real| self.bkpts.get(&real))
                    .map(|real| real.in_handler > 0)
                    .unwrap_or(false),
            ),
        };

        if in_handler || singlestep_real_in_handler {
            self.bkpts.get_mut(&addr).unwrap().pending_removal = true;
            self.untrace(false);
            return;
        }

        // Quiesce before touching the hash, so no trap arrives on a
        // breakpoint we no longer track.
        let _ = self.wait(false);
        let mut b = match self.bkpts.remove(&addr) {
            Some(b) => b,
            None => {
                self.untrace(false);
                return;
            }
        };

        if self.tracing_bkpt != b.addr {
            self.unbkpt_child_poke(None, &b);
        } else {
            debug!(
                "{}: breakpoint at {:#x} already poked back, changing instruction pointer",
                self.pid(),
                b.addr
            );
            let addr = self.tracing_bkpt;
            match self.isa().and_then(|isa| isa.reset_bkpt_ip(self, addr)) {
                Ok(()) => {}
                Err(Error::Sys(Errno::ESRCH)) | Err(Error::Dead(_)) => {
                    debug!("{}: ESRCH, process is dead", self.pid());
                    self.set_state(ProcessState::Dead);
                    return;
                }
                Err(e) => {
                    debug!(
                        "{}: unknown error adjusting IP while removing breakpoint: {}",
                        self.pid(),
                        e
                    );
                }
            }

            self.tracing_bkpt = 0;
            self.bkpt_halted = false;

            // If this breakpoint (not a nested trace request) stopped us,
            // resume on untrace.
            if !orig_trace_halted {
                self.set_orig_state(ProcessState::Run);
            }
        }

        b.run_cleanups();
        self.untrace(false);
        debug!("{}: removed breakpoint on {:#x}", self.pid(), addr);
    }

    /// Poke the pre-breakpoint text back, into our own process or (for
    /// fork cleanup) into `pid`.  Only if the instruction there is still
    /// the breakpoint pattern: if it changed, a new text section was
    /// mapped over it, and it is not ours to touch.
    fn unbkpt_child_poke(&mut self, pid: Option<libc::pid_t>, b: &Breakpoint) {
        let target = pid.unwrap_or_else(|| self.pid());

        let insn = match ptrace::ptrace_peek(
            self.ptrace_wrapper(),
            ptrace::PTRACE_PEEKTEXT,
            target,
            b.addr,
        ) {
            Ok(insn) => insn as u64,
            Err(_) => return,
        };

        if insn != mask_bkpt(insn) {
            return;
        }

        match ptrace::ptrace(
            self.ptrace_wrapper(),
            ptrace::PTRACE_POKETEXT,
            target,
            b.addr,
            b.orig_insn,
        ) {
            Ok(_) => {}
            Err(Error::Sys(Errno::ESRCH)) => {
                debug!("{}: ESRCH, process is dead", target);
                if pid.is_none() {
                    self.set_state(ProcessState::Dead);
                }
            }
            Err(Error::Sys(Errno::EIO)) | Err(Error::Sys(Errno::EFAULT)) => {
                // The address in the child has disappeared.
                debug!(
                    "{}: instruction pokeback into {:#x} failed",
                    target, b.addr
                );
            }
            Err(e) => {
                debug!("{}: unknown error removing breakpoint: {}", target, e);
            }
        }
    }

    /// Discard breakpoint state: on release, on exec (`gone`: the address
    /// space has vanished, do not touch it), or in a freshly forked child
    /// (`pid`: poke the child's text back, leave local state alone).
    pub(crate) fn bkpt_flush(&mut self, pid: Option<libc::pid_t>, gone: bool) {
        debug!("flushing breakpoints");

        if pid.is_none() {
            self.bkpt_consume = true;
        }

        let addrs: Vec<u64> = self.bkpts.keys().copied().collect();
        for addr in addrs {
            if let Some(p) = pid {
                if let Some(b) = self.bkpts.remove(&addr) {
                    self.unbkpt_child_poke(Some(p), &b);
                    self.bkpts.insert(addr, b);
                }
            } else if !gone {
                if let Some(b) = self.bkpts.get_mut(&addr) {
                    // Handlers will never be re-entered: either the handle
                    // is going away or the process has just exec()ed.
                    b.in_handler = 0;
                }
                self.unbkpt(addr);
            } else if let Some(mut b) = self.bkpts.remove(&addr) {
                b.run_cleanups();
            }
        }

        if pid.is_none() {
            // One last wait to consume a trap on the last now-dead
            // breakpoint.
            if !gone {
                let _ = self.wait(false);
            }
            self.bkpt_consume = false;
            self.tracing_bkpt = 0;
            self.bkpt_halted = false;
        }
    }

    /// If we are stopped at a breakpoint, its address; otherwise 0.
    pub fn bkpt_addr(&self) -> u64 {
        self.tracing_bkpt
    }

    /// Number of active breakpoints.
    pub fn num_bkpts(&self) -> usize {
        self.bkpts.len()
    }

    /// Dispatch a SIGTRAP whose address matches a known breakpoint.
    pub(crate) fn bkpt_handle(&mut self, addr: u64) -> ProcessState {
        // Decree trace-stop for the benefit of handlers that rely on it.
        self.set_state(ProcessState::TraceStop);

        if self.tracing_bkpt == addr {
            return self.bkpt_handle_post_singlestep(addr);
        }

        if let Some(real) = self.bkpts.get(&addr).and_then(|b| b.singlestep_for) {
            // The temporary next-instruction breakpoint of a software
            // singlestep.  Drop it and finish the real one.
            self.unbkpt(addr);
            return self.bkpt_handle_post_singlestep(real);
        }

        if self.tracing_bkpt != 0 {
            debug!(
                "{}: nested breakpoint detected, probable bug",
                self.pid()
            );
            // Probably an explicit continue by the caller.  Re-arm the
            // original breakpoint if it is still known; we are long past
            // its address, so no handler can run.
            let prev = self.tracing_bkpt;
            if self.bkpts.contains_key(&prev) {
                if let Ok(orig) = self.pt_peek(ptrace::PTRACE_PEEKTEXT, prev) {
                    let orig = orig as u64;
                    let _ = self.pt(ptrace::PTRACE_POKETEXT, prev, mask_bkpt(orig));
                    // If the "original" is a breakpoint, the caller
                    // overwrote the breakpoint itself: do not remember it.
                    if orig != mask_bkpt(orig) {
                        self.bkpts.get_mut(&prev).unwrap().orig_insn = orig;
                    }
                }
            }
            self.tracing_bkpt = 0;
        }

        self.bkpt_handle_start(addr)
    }

    /// Invoke the pre-singlestep chain for `addr`, then step past it.
    fn bkpt_handle_start(&mut self, addr: u64) -> ProcessState {
        let orig_insn = match self.bkpts.get(&addr) {
            Some(b) => b.orig_insn,
            None => return ProcessState::TraceStop,
        };

        match self.pt(ptrace::PTRACE_POKETEXT, addr, orig_insn) {
            Ok(_) => {
                debug!(
                    "{}: hit {:#x}, setting insn to {:#x}",
                    self.pid(),
                    addr,
                    orig_insn
                );
            }
            Err(Error::Sys(Errno::ESRCH)) => return ProcessState::Dead,
            Err(e) => {
                debug!(
                    "unexpected error removing breakpoint on PID {}: {}",
                    self.pid(),
                    e
                );
                return ProcessState::TraceStop;
            }
        }

        self.tracing_bkpt = addr;

        let after_singlestep = self
            .bkpts
            .get(&addr)
            .map(|b| b.after_singlestep)
            .unwrap_or(false);

        if !after_singlestep {
            self.bkpt_halted = true;
            let state = self.run_bkpt_chain(addr);

            if state != ProcessState::Run {
                return state;
            }
            self.bkpt_halted = false;

            if self
                .bkpts
                .get(&addr)
                .map(|b| b.pending_removal)
                .unwrap_or(false)
            {
                // unbkpt() continues for us.
                self.unbkpt(addr);
                return ProcessState::Run;
            }
        }

        self.bkpt_continue_internal(addr, true)
    }

    /// Run notifiers (in registration order) and then the handler for
    /// `addr`, with in-handler accounting.  Converts `Stop` to
    /// `TraceStop`: a breakpoint-halted process is already interrupted
    /// and will never change state without our connivance, unlike a
    /// SIGSTOP-stopped one.
    fn run_bkpt_chain(&mut self, addr: u64) -> ProcessState {
        let (notifiers, handler) = match self.bkpts.get_mut(&addr) {
            Some(b) => {
                b.in_handler += 1;
                (
                    b.notifiers
                        .iter()
                        .map(|n| Rc::clone(&n.notify))
                        .collect::<Vec<_>>(),
                    b.handler.as_ref().map(|h| Rc::clone(&h.handler)),
                )
            }
            None => return ProcessState::Run,
        };

        for notify in notifiers {
            notify(self, addr);
        }

        let mut state = ProcessState::Run;
        if let Some(handler) = handler {
            state = handler(self, addr);
            if state == ProcessState::Stop {
                state = ProcessState::TraceStop;
            }
            debug!("{}: breakpoint handler returned {:?}", self.pid(), state);
        }

        if let Some(b) = self.bkpts.get_mut(&addr) {
            b.in_handler -= 1;
        }
        state
    }

    /// Continue a process, possibly stopped at a breakpoint.  Returns
    /// false if it left the process state unchanged.
    pub fn bkpt_continue(&mut self) -> bool {
        if !self.is_ptraced() {
            return false;
        }

        if self.tracing_bkpt == 0 || !self.bkpts.contains_key(&self.tracing_bkpt) {
            // We might be stopped at an erased breakpoint, or not stopped
            // at a breakpoint at all.  Just issue a continue.
            if let Err(e) = self.pt(ptrace::PTRACE_CONT, 0, 0) {
                if let Error::Sys(Errno::ESRCH) = e {
                    if kill(Pid::from_raw(self.pid()), None) == Err(Errno::ESRCH) {
                        self.set_state(ProcessState::Dead);
                        return true;
                    }
                }
                // With an outstanding trace request, EPERM here can only
                // mean the process is not stopped.
                if !matches!(e, Error::Sys(Errno::EPERM)) {
                    debug!("{}: unexpected error resuming: {}", self.pid(), e);
                    return true;
                }
            }
            self.set_state(ProcessState::Run);
            return true;
        }

        let addr = self.tracing_bkpt;

        // We could be stopped on the breakpoint locus, past it (already
        // singlestepped, maybe hit by a SIGSTOP meanwhile), or not
        // stopped at all.  Only the current IP can tell.
        let ip = match self.isa().and_then(|isa| isa.bkpt_ip(self, true)) {
            Ok(ip) => ip,
            Err(_) => return true,
        };

        if ip == 0 {
            // Not stopped at all.
            let _ = self.wait(false);
            return false;
        } else if ip == addr {
            // Still need to singlestep.
            let state = self.bkpt_continue_internal(addr, true);
            self.set_state(state);
        } else {
            // No need to singlestep, but maybe a trap to consume.
            self.bkpt_consume = true;
            let _ = self.wait(false);
            self.bkpt_consume = false;
            let state = self.bkpt_continue_internal(addr, false);
            self.set_state(state);
        }
        true
    }

    /// Resume from a breakpoint locus: reset the IP and singlestep (by
    /// hardware, or by planting a temporary breakpoint at the next IP),
    /// or finish up post-singlestep.
    fn bkpt_continue_internal(&mut self, addr: u64, singlestep: bool) -> ProcessState {
        self.bkpt_halted = false;

        if singlestep {
            let isa = match self.isa() {
                Ok(isa) => isa,
                Err(_) => return ProcessState::TraceStop,
            };

            let step = (|| -> Result<()> {
                isa.reset_bkpt_ip(self, addr)?;

                if !isa.software_singlestep() {
                    self.pt(ptrace::PTRACE_SINGLESTEP, 0, 0)?;
                    return Ok(());
                }

                let next_ip = isa.next_ip(self)?;

                // Only drop a temporary breakpoint if there isn't already
                // a breakpoint there.
                if !self.bkpts.contains_key(&next_ip) {
                    let _ = self.add_bkpt(next_ip, false, None, None);
                    if let Some(b) = self.bkpts.get_mut(&next_ip) {
                        b.singlestep_for = Some(addr);
                    }
                }

                // A one-instruction loop cannot be stepped past without
                // emulating the instruction.
                if next_ip == addr {
                    warn!(
                        "{}: breakpoint loops are unimplemented on this platform: \
                         breakpoint at {:#x} deleted",
                        self.pid(),
                        addr
                    );
                    self.unbkpt(addr);
                }

                self.pt(ptrace::PTRACE_CONT, 0, 0)?;
                Ok(())
            })();

            return match step {
                Ok(()) => ProcessState::Run,
                Err(Error::Sys(Errno::ESRCH)) => ProcessState::Dead,
                Err(_) => ProcessState::TraceStop,
            };
        }

        self.bkpt_handle_post_singlestep(addr)
    }

    /// Everything needed after singlestepping past `addr`: the
    /// after-singlestep chain, re-arming the breakpoint (re-peeking the
    /// original instruction to survive self-modifying code such as PLTs),
    /// and resuming.
    fn bkpt_handle_post_singlestep(&mut self, addr: u64) -> ProcessState {
        if !self.bkpts.contains_key(&addr) {
            return ProcessState::Run;
        }

        let after_singlestep = self
            .bkpts
            .get(&addr)
            .map(|b| b.after_singlestep)
            .unwrap_or(false);

        let mut state = ProcessState::Run;
        if after_singlestep {
            state = self.run_bkpt_chain(addr);
        }

        if self
            .bkpts
            .get(&addr)
            .map(|b| b.pending_removal)
            .unwrap_or(false)
        {
            self.unbkpt(addr);
            return ProcessState::Run;
        }

        // A handler asking for a stop keeps us halted here.  (If it set
        // Dead, it killed the process itself.)
        if state != ProcessState::Run {
            self.bkpt_halted = true;
            return state;
        }

        match self.pt_peek(ptrace::PTRACE_PEEKTEXT, addr) {
            Ok(orig) => {
                if let Some(b) = self.bkpts.get_mut(&addr) {
                    b.orig_insn = orig as u64;
                }
            }
            Err(e) => {
                debug!(
                    "unexpected error re-peeking original instruction at {:#x} \
                     on PID {}: {}",
                    addr,
                    self.pid(),
                    e
                );
            }
        }

        let orig = self
            .bkpts
            .get(&addr)
            .map(|b| b.orig_insn)
            .unwrap_or(0);

        // The process could be SIGKILLed at any time, even between these
        // two ptrace calls.
        match self.pt(ptrace::PTRACE_POKETEXT, addr, mask_bkpt(orig)) {
            Ok(_) => {}
            Err(Error::Sys(Errno::ESRCH)) => return ProcessState::Dead,
            Err(Error::Sys(Errno::EIO)) | Err(Error::Sys(Errno::EFAULT)) => {
                // A very unlucky unmap after singlestepping across pages.
                debug!(
                    "{}: post-singlestep at {:#x} but page vanished: unbkpting",
                    self.pid(),
                    addr
                );
                self.unbkpt(addr);
            }
            Err(e) => {
                debug!(
                    "unexpected error reinserting breakpoint on PID {}: {}",
                    self.pid(),
                    e
                );
                return ProcessState::TraceStop;
            }
        }

        self.tracing_bkpt = 0;

        match self.pt(ptrace::PTRACE_CONT, 0, 0) {
            Ok(_) => ProcessState::Run,
            Err(Error::Sys(Errno::ESRCH)) => ProcessState::Dead,
            Err(e) => {
                debug!(
                    "strange error continuing after breakpoint on PID {}: {}",
                    self.pid(),
                    e
                );
                ProcessState::TraceStop
            }
        }
    }
}
