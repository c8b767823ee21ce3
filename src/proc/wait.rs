//! Wait-event servicing: the heart of the process state machine.

use log::debug;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::{ptrace, Process, ProcessState};
use crate::error::{Error, Result};

impl Process {
    /// Wait for the process to stop for any reason.  A blocking wait is
    /// automatically followed by as many nonblocking waits as are needed
    /// to drain the queue of events and leave the tracee able to handle
    /// more ptrace requests, or dead.
    ///
    /// Returns the number of state changes processed.  An exec() observed
    /// here resets the handle's address-space state and surfaces as
    /// `Error::ExecDetected` (see [`crate::error::Error`]); the process is
    /// left in trace-stop with one trace request held, so the caller
    /// can reinitialize and then [`Process::untrace`].
    pub fn wait(&mut self, block: bool) -> Result<usize> {
        let mut block = block;

        // Waiting while stopped at a breakpoint would deadlock against
        // our own stop, especially if the next event is another SIGTRAP.
        if self.bkpt_halted {
            block = false;
        }

        // If we are waiting for a pending stop that another wait already
        // consumed, blocking would hang forever.
        if self.awaiting_pending_stops > 0 && self.pending_stops == 0 {
            block = false;
        }

        // A trace-stopped process will produce no event on its own.
        if self.state == ProcessState::TraceStop {
            block = false;
        }

        // Never wait at all on a dead process: the PID may have been
        // reallocated to someone else entirely.
        if self.state == ProcessState::Dead {
            return Ok(0);
        }

        let mut flags = WaitPidFlag::__WALL;
        if !block {
            flags |= WaitPidFlag::WNOHANG;
        }

        // The raw syscall goes through the wait wrapper, so embedders can
        // route it wherever their ptrace calls live.
        let status = loop {
            let mut raw: libc::c_int = 0;
            let rc = (self.wait_wrapper())(self.pid, &mut raw, flags.bits());
            if rc == 0 {
                return Ok(0);
            }
            if rc < 0 {
                match Errno::last() {
                    Errno::ECHILD => {
                        self.state = ProcessState::Dead;
                        return Ok(0);
                    }
                    Errno::EINTR => continue,
                    e => {
                        debug!("wait: error waiting: {}", e);
                        return Err(e.into());
                    }
                }
            }
            match WaitStatus::from_raw(Pid::from_raw(rc), raw) {
                Ok(WaitStatus::StillAlive) => return Ok(0),
                Ok(status) => break status,
                Err(e) => return Err(e.into()),
            }
        };

        self.handle_wait_status(status)?;

        // Drain whatever else is queued.
        let mut num_waits = 1;
        loop {
            let one = self.wait(false)?;
            num_waits += one;
            if one == 0 {
                break;
            }
        }
        Ok(num_waits)
    }

    /// Apply one waitpid status to the state machine.
    fn handle_wait_status(&mut self, status: WaitStatus) -> Result<()> {
        match status {
            WaitStatus::Continued(_) => {
                debug!("{}: process got SIGCONT", self.pid);
                self.state = ProcessState::Run;
                Ok(())
            }

            // The process is about to die, but its exit record has not
            // fired yet: resume silently, do not mark it dead.
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXIT) => {
                debug!("{}: process status change: exit coming", self.pid);
                let _ = self.pt(ptrace::PTRACE_CONT, 0, 0);
                Ok(())
            }

            WaitStatus::Exited(_, code) => {
                debug!(
                    "{}: process status change: exited with exitcode {}",
                    self.pid, code
                );
                self.state = ProcessState::Dead;
                Ok(())
            }

            WaitStatus::PtraceEvent(_, sig, PTRACE_EVENT_STOP) => {
                self.handle_event_stop(sig);
                Ok(())
            }

            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXEC) => self.handle_exec(),

            WaitStatus::PtraceEvent(_, _, event)
                if event == libc::PTRACE_EVENT_FORK || event == libc::PTRACE_EVENT_VFORK =>
            {
                self.handle_fork();
                Ok(())
            }

            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_CLONE) => {
                self.handle_clone();
                Ok(())
            }

            WaitStatus::PtraceEvent(_, sig, _) => {
                // Unrequested event: reinject the signal and resume.
                let _ = self.pt(ptrace::PTRACE_CONT, 0, sig as u64);
                Ok(())
            }

            WaitStatus::Stopped(_, sig) if sig != Signal::SIGTRAP => {
                // Signal-delivery stop.  Adjust state and reinject.
                match sig {
                    Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => {
                        debug!(
                            "{}: process status change: child got stopping signal {}",
                            self.pid, sig
                        );
                        self.state = ProcessState::Stop;
                    }
                    Signal::SIGCONT => {
                        debug!("{}: process status change: SIGCONT", self.pid);
                        self.state = ProcessState::Run;
                    }
                    _ => {
                        debug!(
                            "{}: process status change: child got signal {}",
                            self.pid, sig
                        );
                    }
                }
                if self.ptraced {
                    let _ = self.pt(ptrace::PTRACE_CONT, 0, sig as u64);
                    self.state = ProcessState::Run;
                }
                Ok(())
            }

            WaitStatus::Signaled(_, sig, _) if sig != Signal::SIGTRAP => {
                debug!(
                    "{}: process status change: child got terminating signal {}",
                    self.pid, sig
                );
                let _ = self.pt(ptrace::PTRACE_CONT, 0, sig as u64);
                Ok(())
            }

            // SIGTRAP, delivered or terminating: a breakpoint, a
            // singlestep completion, or someone else's trap.
            WaitStatus::Stopped(..) | WaitStatus::Signaled(..) => {
                self.handle_trap();
                Ok(())
            }

            WaitStatus::StillAlive | WaitStatus::PtraceSyscall(_) => Ok(()),
        }
    }

    /// PTRACE_EVENT_STOP: an interrupt trickling in, or group-stop
    /// bookkeeping.
    fn handle_event_stop(&mut self, sig: Signal) {
        if sig == Signal::SIGTRAP {
            self.listening = false;
            if self.group_stopped {
                // Flip to RUN immediately so Pstate() callers see the
                // resumption; the SIGCONT's own event usually has no
                // further effect.
                debug!("{}: group-stop ending, SIGCONT expected soon", self.pid);
                let _ = self.pt(ptrace::PTRACE_CONT, 0, 0);
                self.group_stopped = false;
                self.state = ProcessState::Run;
            } else if self.pending_stops > 0 {
                debug!(
                    "{}: process status change: PTRACE_INTERRUPTed",
                    self.pid
                );
                self.pending_stops -= 1;
                self.state = ProcessState::TraceStop;
            } else {
                // Latent interrupt nobody is waiting for.  Resume.
                let _ = self.pt(ptrace::PTRACE_CONT, 0, 0);
                debug!(
                    "{}: unexpected PTRACE_EVENT_STOP, resuming automatically",
                    self.pid
                );
                self.state = ProcessState::Run;
            }
        } else if self.listening && self.pending_stops > 0 {
            // Interrupt during LISTEN: leave group-stop in force but
            // note we are out of the listening state.
            debug!(
                "{}: process status change: no longer LISTENing, PTRACE_INTERRUPTed",
                self.pid
            );
            self.listening = false;
            self.pending_stops -= 1;
            self.state = ProcessState::TraceStop;
        } else if self.state == ProcessState::Run || self.state == ProcessState::Stop {
            // Group-stop.  LISTEN so further state changes (e.g. a
            // SIGCONT) stay visible while the tracee remains stopped.
            debug!(
                "{}: process status change: group-stop: LISTENed",
                self.pid
            );
            self.group_stopped = true;
            self.listening = true;
            self.state = ProcessState::Stop;
            let _ = self.pt(ptrace::PTRACE_LISTEN, 0, 0);
        } else {
            debug!("{}: random PTRACE_EVENT_STOP", self.pid);
        }
    }

    /// TRACEEXEC: the address space we knew is gone.  Flush breakpoints
    /// and caches, re-read ISA info, hold the process in trace-stop with a
    /// fresh trace state, and unwind.
    fn handle_exec(&mut self) -> Result<()> {
        debug!(
            "{}: process status change: exec() detected, resetting...",
            self.pid
        );

        self.state = ProcessState::TraceStop;
        self.memfd = None;
        self.map_files_checked = false;
        self.map_files_ok = false;

        // If this fails there is little we can do; the ELF class and
        // machine rarely change across exec().
        let _ = self.read_isa_info();

        self.bkpt_flush(None, true);

        self.auxv = None;
        self.tracing_bkpt = 0;
        self.bkpt_halted = false;
        self.bkpt_consume = false;
        self.r_debug_addr = None;
        self.info_valid = false;
        self.group_stopped = false;
        self.listening = false;

        if let Some(rap) = &self.rap {
            rap.exec_reset();
        }

        if self.trace_count == 0 {
            ptrace::lock_hook(self.pid, true);
        }
        self.trace_states.clear();
        self.trace_count = 1;
        self.trace_states.push(ProcessState::Run);
        self.ptraced = true;
        self.trace_halted = true;
        self.state = ProcessState::TraceStop;

        ptrace::unwinder_pad(self.pid);
        Err(Error::ExecDetected(self.pid))
    }

    /// TRACEFORK/TRACEVFORK: scrub our breakpoints out of the new child
    /// and detach from it; we do not trace forked children.
    fn handle_fork(&mut self) {
        self.state = ProcessState::TraceStop;
        let mut msg: libc::c_ulong = 0;
        match self
            .pt(ptrace::PTRACE_GETEVENTMSG, 0, &mut msg as *mut _ as u64)
            .map(|_| msg as libc::pid_t)
        {
            Ok(child) => {
                debug!(
                    "{}: process status change: fork() or vfork() detected, \
                     discarding breakpoints in {}...",
                    self.pid, child
                );
                self.ignored_child_wait(child, true, true);
            }
            Err(e) => {
                debug!(
                    "{}: fork()/vfork() detected but child PID unknown: {}; ignoring",
                    self.pid, e
                );
            }
        }
        if self.pt(ptrace::PTRACE_CONT, 0, 0).is_ok() {
            debug!("{}: continued parent", self.pid);
        }
        self.state = ProcessState::Run;
    }

    /// TRACECLONE: threading has begun.  Races between thread creation and
    /// lazy library loading make linker monitoring unsafe from here on, so
    /// suppress it, and stop asking for clone events.
    fn handle_clone(&mut self) {
        debug!(
            "{}: process status change: thread creation detected, \
             suppressing linker events...",
            self.pid
        );
        self.state = ProcessState::TraceStop;

        let mut msg: libc::c_ulong = 0;
        if self
            .pt(ptrace::PTRACE_GETEVENTMSG, 0, &mut msg as *mut _ as u64)
            .is_ok()
        {
            // The thread shares our address space: poking original
            // instructions back would strip the breakpoints out from
            // under the leader.  Keep the thread attached, too, so a
            // breakpoint trap parks it instead of killing the process.
            self.ignored_child_wait(msg as libc::pid_t, false, false);
        }

        if let Some(rap) = self.rap.clone() {
            rap.event_suppress(self);
        }

        let _ = self.pt(ptrace::PTRACE_SETOPTIONS, 0, ptrace::TRACE_OPTIONS as u64);
        self.state = ProcessState::Run;
        let _ = self.pt(ptrace::PTRACE_CONT, 0, 0);
    }

    /// A trap that may be one of our breakpoints.
    fn handle_trap(&mut self) {
        self.state = ProcessState::TraceStop;

        // On hardware-singlestep machines a trap mid-step already tells us
        // the breakpoint address.
        let mut ip = match self.isa() {
            Ok(isa) if !isa.software_singlestep() => self.tracing_bkpt,
            _ => 0,
        };

        if ip == 0 {
            ip = match self.isa().and_then(|isa| isa.bkpt_ip(self, false)) {
                Ok(ip) => ip,
                Err(_) => u64::MAX,
            };
            if ip == u64::MAX || !self.bkpts.contains_key(&ip) {
                // Not a known breakpoint nor a singlestep temporary.
                // Reinject.
                debug!(
                    "wait: {}: trap at address {:#x} does not correspond to \
                     a known breakpoint",
                    self.pid, ip
                );
                self.state = ProcessState::Stop;
                let _ = self.pt(ptrace::PTRACE_CONT, 0, libc::SIGTRAP as u64);
                return;
            }
        }

        if !self.bkpt_consume {
            let state = self.bkpt_handle(ip);
            self.state = state;
        }
    }

    /// Wait for a child we do not otherwise care about to halt, flush our
    /// breakpoints out of it (unless it execs first, or shares our
    /// address space), then let go of it: detach for forked children,
    /// resume-but-stay-attached for threads.  New children it spawns in
    /// the meantime get the same treatment.
    pub(crate) fn ignored_child_wait(&mut self, pid: libc::pid_t, mut flush: bool, detach: bool) {
        debug!("{}: waiting for ignored child {} to halt", self.pid, pid);

        loop {
            let status = match waitpid(
                Pid::from_raw(pid),
                Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD),
            ) {
                Ok(s) => s,
                Err(Errno::EINTR) => continue,
                Err(_) => return,
            };

            match status {
                WaitStatus::PtraceEvent(_, _, PTRACE_EVENT_STOP) => {
                    if flush {
                        self.bkpt_flush(Some(pid), false);
                    }
                    if detach {
                        if ptrace::ptrace(
                            self.ptrace_wrapper(),
                            ptrace::PTRACE_DETACH,
                            pid,
                            0,
                            0,
                        )
                        .is_err()
                        {
                            debug!("cannot detach from ignored {}", pid);
                        }
                    } else {
                        let _ = ptrace::ptrace(
                            self.ptrace_wrapper(),
                            ptrace::PTRACE_CONT,
                            pid,
                            0,
                            0,
                        );
                    }
                    return;
                }
                WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXIT) => {
                    let req = if detach {
                        ptrace::PTRACE_DETACH
                    } else {
                        ptrace::PTRACE_CONT
                    };
                    let _ = ptrace::ptrace(self.ptrace_wrapper(), req, pid, 0, 0);
                    return;
                }
                WaitStatus::PtraceEvent(_, _, event)
                    if event == libc::PTRACE_EVENT_FORK
                        || event == libc::PTRACE_EVENT_VFORK =>
                {
                    let mut msg: libc::c_ulong = 0;
                    if ptrace::ptrace(
                        self.ptrace_wrapper(),
                        ptrace::PTRACE_GETEVENTMSG,
                        pid,
                        0,
                        &mut msg as *mut _ as u64,
                    )
                    .is_ok()
                    {
                        debug!("{}: recursive ignored fork()/clone()", pid);
                        self.ignored_child_wait(msg as libc::pid_t, flush, detach);
                    }
                    let _ = ptrace::ptrace(
                        self.ptrace_wrapper(),
                        ptrace::PTRACE_CONT,
                        pid,
                        0,
                        0,
                    );
                }
                WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXEC) => {
                    // Breakpoints are gone with the old address space:
                    // nothing to fix up any more.
                    flush = false;
                    let _ = ptrace::ptrace(
                        self.ptrace_wrapper(),
                        ptrace::PTRACE_CONT,
                        pid,
                        0,
                        0,
                    );
                }
                WaitStatus::Stopped(_, sig) => {
                    let _ = ptrace::ptrace(
                        self.ptrace_wrapper(),
                        ptrace::PTRACE_CONT,
                        pid,
                        0,
                        sig as u64,
                    );
                }
                WaitStatus::Signaled(_, sig, _) => {
                    let _ = ptrace::ptrace(
                        self.ptrace_wrapper(),
                        ptrace::PTRACE_CONT,
                        pid,
                        0,
                        sig as u64,
                    );
                }
                WaitStatus::Exited(..) => return,
                _ => {}
            }
        }
    }
}

/// `PTRACE_EVENT_STOP` is not among libc's event constants.
pub(crate) const PTRACE_EVENT_STOP: libc::c_int = 128;
