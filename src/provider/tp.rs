//! Shared support for probes backed by kernel tracepoint events: kprobes,
//! uprobes and plain tracepoints all become perf-attachable events once
//! registered, and share this attach/detach path.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::bpf::syscall::{perf_attach_bpf, perf_event_open, PerfEventAttr};
use crate::error::Result;
use crate::probe::TpProbe;
use crate::tracefs;

/// Attach a loaded program to a tracepoint-backed probe: open a perf
/// event for it and associate the program.  A probe with no event id is
/// silently skipped (it was never created at the kernel level).
pub fn tp_attach(tpp: &RefCell<TpProbe>, bpf_fd: RawFd) -> Result<()> {
    let event_id = match tpp.borrow().event_id {
        Some(id) => id,
        None => return Ok(()),
    };

    if tpp.borrow().event_fd.is_none() {
        let attr = PerfEventAttr::tracepoint(event_id as u64);
        let fd = perf_event_open(&attr, -1, 0, -1)?;
        tpp.borrow_mut().event_fd = Some(fd);
    }

    let fd = tpp.borrow().event_fd.unwrap();
    perf_attach_bpf(fd, bpf_fd)
}

/// Detach a tracepoint-backed probe, closing its perf event.
pub fn tp_detach(tpp: &RefCell<TpProbe>) {
    let mut tp = tpp.borrow_mut();
    tp.event_id = None;
    if let Some(fd) = tp.event_fd.take() {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Look up a tracepoint's event id and record it in the probe data.
pub fn tp_resolve(tpp: &RefCell<TpProbe>, root: &Path, group: &str, event: &str) -> Result<u32> {
    if let Some(id) = tpp.borrow().event_id {
        return Ok(id);
    }
    let id = tracefs::event_id(root, group, event)?;
    tpp.borrow_mut().event_id = Some(id);
    Ok(id)
}
