//! The runtime-linker agent.
//!
//! The dynamic linker's link maps are consistent only at particular
//! points:
//!
//! ```text
//! dlopen()/dlclose()
//! .
//! _rtld_global._dl_load_lock taken out        A
//! .
//! r_state = RT_{ADD|DELETE}                   B
//! _r_debug.r_brk()                            C
//! .
//! r_state = RT_CONSISTENT                     D
//! _r_debug.r_brk()                            E
//! .
//! _rtld_global._dl_load_lock released         F
//! .
//! dlopen()/dlclose() returns
//! ```
//!
//! The base link map (`_r_debug.r_map`) is consistent everywhere except
//! C..D, so a breakpoint on `r_brk` that halts the process iff it is
//! about to go inconsistent enforces consistency.  Link maps for lmids
//! other than zero are only consistent in D..E and outside A..F, where
//! the load lock is held -- and that lock is a non-ABI glibc internal
//! whose location must be discovered structurally, and busy-waited on,
//! since it is a private futex in someone else's address space.
//!
//! Everything here is best effort against a known-unstable layout: if
//! the structural probes fail, multi-lmid support is permanently
//! disabled for this handle and single-lmid operation continues.  The
//! only hard dependency is `r_debug.r_brk` itself.

use log::debug;
use nix::errno::Errno;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use super::auxv::{AT_ENTRY, R_DEBUG_NONE};
use super::maps::ObjSpec;
use super::{Process, ProcessState};
use crate::error::{Error, Result};

/// Maximum number of namespaces glibc supports (DL_NNS).
const DL_NNS: u64 = 16;

/// Upper bound on the structural scans.
const SCAN_LIMIT: u64 = 65535;

/// How long to wait on the load lock before declaring the glibc data
/// structure assumptions wrong (nanoseconds).
const LOCAL_MAPS_TIMEOUT_NS: u64 = 7_000_000_000;

// Last-known-good offsets into glibc internals.  These are only scan
// starting points and validity is always checked: a wrong guess costs a
// forward search, never correctness.
const G_DL_NNS_64_OFFSET: u64 = 2240;
const G_DL_NNS_32_OFFSET: u64 = 1120;
const G_DL_LOAD_LOCK_DELTA_64: u64 = 8;
const G_DL_LOAD_LOCK_DELTA_32: u64 = 4;
const LINK_NAMESPACES_64_SIZE: u64 = 560;
const LINK_NAMESPACES_32_SIZE: u64 = 280;
const R_DEBUG_64_SIZE: u64 = 40;
const R_DEBUG_32_SIZE: u64 = 20;
const L_SEARCHLIST_64_OFFSET: u64 = 456;
const L_SEARCHLIST_32_OFFSET: u64 = 228;

/// Consistency states advertised in `_r_debug.r_state`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RdState {
    Consistent,
    Add,
    Delete,
}

impl RdState {
    fn from_raw(raw: u64) -> RdState {
        match raw {
            1 => RdState::Add,
            2 => RdState::Delete,
            _ => RdState::Consistent,
        }
    }
}

/// Events delivered to the DLACTIVITY callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RtldEvent {
    /// The linker entered or left a dlopen()/dlclose() window.
    DlActivity(RdState),
    /// Monitoring is shutting down.
    Shutdown,
}

pub type RtldEventFn = Rc<dyn Fn(&mut Process, RtldEvent)>;

/// One object loaded by the dynamic linker.
#[derive(Clone, Debug, Default)]
pub struct LoadObj {
    pub lmid: u64,
    /// Load bias (`l_addr`).
    pub base: u64,
    /// Address of the object's name string in the target.
    pub nameaddr: u64,
    /// Address of the object's dynamic section.
    pub dyn_addr: u64,
    /// The scope searchlist: addresses of the link maps searched, in
    /// order, for symbols bound from this object.
    pub scope: Vec<u64>,
    /// The scope was empty and defaulted to the primary object's.
    pub default_scope: bool,
}

struct RtldState {
    maps_ready: bool,
    released: bool,
    r_version: u64,
    r_brk_addr: u64,
    rtld_global_addr: u64,
    l_searchlist_offset: u64,
    dl_nns_offset: u64,
    dl_load_lock_offset: u64,
    g_debug_offset: u64,
    link_namespaces_size: u64,
    monitoring: bool,
    monitor_suppressed: bool,
    event_fun: Option<RtldEventFn>,
    /// Transition to an inconsistent state is barred while nonzero.
    no_inconsistent: u32,
    stop_on_consistent: bool,
    ic_transitioned: bool,
    lmid_halted: bool,
    lmid_bkpted: bool,
    lmid_incompatible_glibc: bool,
}

impl RtldState {
    fn new() -> RtldState {
        RtldState {
            maps_ready: false,
            released: false,
            r_version: 0,
            r_brk_addr: 0,
            rtld_global_addr: 0,
            l_searchlist_offset: 0,
            dl_nns_offset: 0,
            dl_load_lock_offset: 0,
            g_debug_offset: 0,
            link_namespaces_size: 0,
            monitoring: false,
            monitor_suppressed: false,
            event_fun: None,
            no_inconsistent: 0,
            stop_on_consistent: false,
            ic_transitioned: false,
            lmid_halted: false,
            lmid_bkpted: false,
            lmid_incompatible_glibc: false,
        }
    }
}

pub struct RtldAgent {
    state: RefCell<RtldState>,
}

// Raw link_map field offsets by ELF class.
fn lm_off(elf64: bool, field: usize) -> u64 {
    // l_addr, l_name, l_ld, l_next, l_prev
    let size = if elf64 { 8 } else { 4 };
    (field as u64) * size
}

fn r_debug_field(elf64: bool, field: usize) -> u64 {
    // r_version; then pointer-aligned r_map, r_brk; then r_state.
    match (elf64, field) {
        (_, 0) => 0,                 // r_version
        (true, 1) => 8,              // r_map
        (true, 2) => 16,             // r_brk
        (true, 3) => 24,             // r_state
        (false, 1) => 4,
        (false, 2) => 8,
        (false, 3) => 12,
        _ => unreachable!(),
    }
}

struct LinkMap {
    l_addr: u64,
    l_name: u64,
    l_ld: u64,
    l_next: u64,
}

impl RtldAgent {
    // Copies out of the state cell, so compound conditions never hold a
    // borrow across calls that re-enter it.
    fn ic_transitioned(&self) -> bool {
        self.state.borrow().ic_transitioned
    }
}

impl RtldAgent {
    /// Activate an agent on a process.  Fails if the process has no
    /// `r_debug` at all; if the linker has not initialized yet, a
    /// notifier on the entry point finishes the job later.
    pub(crate) fn new(p: &mut Process) -> Result<Rc<RtldAgent>> {
        if p.state() == ProcessState::Dead {
            debug!("{}: cannot initialize rtld agent: process is dead", p.pid());
            return Err(Error::Dead(p.pid()));
        }

        let r_debug_addr = p.r_debug();
        if r_debug_addr == R_DEBUG_NONE {
            debug!("{}: cannot initialize rtld agent: no r_debug", p.pid());
            return Err(Error::LinkMapsNotReady(p.pid()));
        }

        let rap = Rc::new(RtldAgent {
            state: RefCell::new(RtldState::new()),
        });

        // Untrace must see the agent, or it may detach under us.
        p.rap = Some(Rc::clone(&rap));

        p.trace(true)?;
        let res = (|| -> Result<()> {
            let mut r_version = 0;
            if r_debug_addr != 0 {
                r_version = p.read_scalar(4, 8, r_debug_addr + r_debug_field(p.elf64(), 0))?;
                if r_version > 1 {
                    debug!("{}: r_version {} unsupported", p.pid(), r_version);
                    return Err(Error::LinkMapsNotReady(p.pid()));
                }
            }

            if r_version > 0 {
                let psize = p.ptr_size();
                let r_brk =
                    p.read_scalar(psize, 8, r_debug_addr + r_debug_field(p.elf64(), 2))?;
                if r_brk == 0 {
                    debug!(
                        "{}: cannot determine dynamic linker breakpoint address",
                        p.pid()
                    );
                    return Err(Error::LinkMapsNotReady(p.pid()));
                }
                {
                    let mut st = rap.state.borrow_mut();
                    st.r_version = r_version;
                    st.r_brk_addr = r_brk;
                    st.maps_ready = true;
                }
                if !p.no_dyn && rap.rtld_global(p) == 0 {
                    debug!(
                        "{}: cannot determine dynamic linker global map address",
                        p.pid()
                    );
                }
            } else if !p.no_dyn {
                // Dynamic linker not initialized yet.  Drop a notifier on
                // the entry address and finish from there.  (Statically
                // linked binaries initialize _r_debug at an unknown
                // distant future point; they stay not-ready until then.)
                let entry = p
                    .getauxval(AT_ENTRY)
                    .ok_or(Error::LinkMapsNotReady(p.pid()))?;
                let agent = Rc::clone(&rap);
                p.bkpt_notifier(entry, false, move |p, addr| {
                    agent.start_trap(p, addr);
                })?;
            }
            Ok(())
        })();

        p.untrace(false);

        match res {
            Ok(()) => {
                debug!("{}: activated rtld agent", p.pid());
                Ok(rap)
            }
            Err(e) => {
                p.rap = None;
                Err(e)
            }
        }
    }

    /// Tripped when the process reaches its entry point: the dynamic
    /// linker is initialized now.
    fn start_trap(self: &Rc<Self>, p: &mut Process, addr: u64) {
        let r_debug_addr = p.r_debug();

        if r_debug_addr == R_DEBUG_NONE {
            debug!("cannot initialize rtld agent for {}: no r_debug", p.pid());
        } else if r_debug_addr == 0 || self.r_brk(p) == 0 {
            debug!(
                "{}: cannot determine dynamic linker load map address",
                p.pid()
            );
        } else if !p.no_dyn && self.rtld_global(p) == 0 {
            debug!(
                "{}: cannot determine dynamic linker global map address",
                p.pid()
            );
        } else {
            // Reactivate monitoring if it should be active (e.g. it was
            // before an exec), firing the initial activity event.
            let (monitoring, r_brk_addr) = {
                let st = self.state.borrow();
                (st.monitoring, st.r_brk_addr)
            };
            if monitoring {
                let agent = Rc::clone(self);
                if p.bkpt(r_brk_addr, false, move |p, _| agent.brk_trap(p)).is_err() {
                    self.state.borrow_mut().monitoring = false;
                } else {
                    debug!("{}: initial rtld activity event fired", p.pid());
                    self.fire_event(p, RtldEvent::DlActivity(RdState::Consistent));
                }
            }
            self.state.borrow_mut().maps_ready = true;
        }

        let r_brk = self.state.borrow().r_brk_addr;
        debug!(
            "{}: hit start trap, r_brk is {:#x}; removing breakpoint",
            p.pid(),
            r_brk
        );
        p.unbkpt(addr);
    }

    /// The rendezvous breakpoint handler: ld.so is about to mutate the
    /// link maps, or has just finished doing so.
    fn brk_trap(self: &Rc<Self>, p: &mut Process) -> ProcessState {
        let consistency = self.consistency(p, None);
        let mut ret = ProcessState::Run;

        let fire = {
            let mut st = self.state.borrow_mut();
            st.ic_transitioned = true;

            debug!(
                "{}: r_brk breakpoint hit, consistency is {:?}",
                p.pid(),
                consistency
            );

            if st.no_inconsistent > 0 {
                if !st.stop_on_consistent && consistency != RdState::Consistent {
                    ret = ProcessState::TraceStop;
                } else if st.stop_on_consistent && consistency == RdState::Consistent {
                    ret = ProcessState::TraceStop;
                }
            }
            st.event_fun.is_some()
        };

        if fire {
            debug!("{}: rtld activity event fired", p.pid());
            self.fire_event(p, RtldEvent::DlActivity(consistency));
        }

        ret
    }

    fn fire_event(&self, p: &mut Process, event: RtldEvent) {
        let fun = self.state.borrow().event_fun.clone();
        if let Some(fun) = fun {
            fun(p, event);
        }
    }

    /// The address of `r_brk`, resolving and caching it on first use.
    /// Zero means the linker is not ready yet; all entry points that
    /// depend on `r_brk_addr` must check this.
    fn r_brk(&self, p: &mut Process) -> u64 {
        {
            let st = self.state.borrow();
            if st.released {
                return 0;
            }
            if st.r_brk_addr != 0 {
                return st.r_brk_addr;
            }
        }

        let r_debug_addr = p.r_debug();
        if r_debug_addr == R_DEBUG_NONE || r_debug_addr == 0 {
            return 0;
        }

        let r_version = match p.read_scalar(4, 8, r_debug_addr + r_debug_field(p.elf64(), 0)) {
            Ok(v) => v,
            Err(_) => return 0,
        };
        if r_version > 1 {
            debug!("{}: r_version {} unsupported", p.pid(), r_version);
            return 0;
        }
        self.state.borrow_mut().r_version = r_version;
        if r_version == 0 {
            return 0;
        }

        let psize = p.ptr_size();
        match p.read_scalar(psize, 8, r_debug_addr + r_debug_field(p.elf64(), 2)) {
            Ok(r_brk) if r_brk != 0 => {
                self.state.borrow_mut().r_brk_addr = r_brk;
                r_brk
            }
            _ => {
                debug!(
                    "{}: cannot determine dynamic linker breakpoint address",
                    p.pid()
                );
                0
            }
        }
    }

    /// The address of `_rtld_global`, if known or discoverable.  Invalid
    /// before the linker is initialized, and meaningless (but unneeded)
    /// in statically linked programs.
    fn rtld_global(&self, p: &mut Process) -> u64 {
        if self.r_brk(p) == 0 {
            return 0;
        }
        {
            let st = self.state.borrow();
            if st.rtld_global_addr != 0 {
                return st.rtld_global_addr;
            }
        }

        match p.xlookup_by_name(Some(0), ObjSpec::Ldso, "_rtld_global") {
            Some(sym) => {
                self.state.borrow_mut().rtld_global_addr = sym.value;
                sym.value
            }
            None => {
                debug!("{}: cannot find _rtld_global", p.pid());
                0
            }
        }
    }

    /// Find the offset of `dl_nns` (and everything derivable from it) in
    /// `_rtld_global` by structural scan: hunt forward for a pair
    /// (pointer-sized zero, integer in 1..=DL_NNS), the guaranteed shape
    /// of an uninitialized namespace next to the live count.
    fn find_dl_nns(&self, p: &mut Process) -> Result<()> {
        debug!("{}: finding dl_nns", p.pid());

        let psize = p.ptr_size() as u64;
        let global = self.rtld_global(p);
        let start = global
            + if p.elf64() {
                G_DL_NNS_64_OFFSET
            } else {
                G_DL_NNS_32_OFFSET
            };

        let mut scan = start;
        loop {
            if scan > start + SCAN_LIMIT {
                return Err(Error::LinkMapsNotReady(p.pid()));
            }
            let scan_next = scan + psize;

            let preceding = p.read_scalar_quietly(psize as usize, 8, scan, true)?;
            let poss_nns = p.read_scalar_quietly(psize as usize, 8, scan_next, true)?;

            if preceding == 0 && poss_nns > 0 && poss_nns <= DL_NNS {
                let mut st = self.state.borrow_mut();
                st.dl_nns_offset = scan_next - global;
                st.dl_load_lock_offset = st.dl_nns_offset
                    + if p.elf64() {
                        G_DL_LOAD_LOCK_DELTA_64
                    } else {
                        G_DL_LOAD_LOCK_DELTA_32
                    };
                // The element size follows directly: the distance from
                // _rtld_global to dl_nns, divided by DL_NNS, rounded to
                // pointer size.
                st.link_namespaces_size = (((scan_next - global) / DL_NNS) / psize) * psize;
                // _ns_debug sits at the end of each element.
                let r_debug_size = if p.elf64() {
                    R_DEBUG_64_SIZE
                } else {
                    R_DEBUG_32_SIZE
                };
                st.g_debug_offset = st.link_namespaces_size.saturating_sub(r_debug_size);

                if st.link_namespaces_size == 0 {
                    return Err(Error::LinkMapsNotReady(p.pid()));
                }
                debug!(
                    "dl_nns_offset is {}, g_debug_offset is {}, element size {}",
                    st.dl_nns_offset, st.g_debug_offset, st.link_namespaces_size
                );
                return Ok(());
            }
            scan = scan_next;
        }
    }

    /// The number of currently-valid namespaces.  Non-shared processes,
    /// processes with unprobeable glibc internals, and processes whose
    /// `_rtld_global` we cannot see always count as one.
    fn dl_nns(&self, p: &mut Process) -> u64 {
        {
            let st = self.state.borrow();
            if st.lmid_incompatible_glibc {
                return 1;
            }
        }
        if p.no_dyn || self.rtld_global(p) == 0 {
            return 1;
        }

        // Compile-time guesstimates; recomputed by find_dl_nns when they
        // turn out not to hold.
        {
            let mut st = self.state.borrow_mut();
            if st.dl_nns_offset == 0 {
                if p.elf64() {
                    st.dl_nns_offset = G_DL_NNS_64_OFFSET;
                    st.dl_load_lock_offset = G_DL_NNS_64_OFFSET + G_DL_LOAD_LOCK_DELTA_64;
                    st.link_namespaces_size = LINK_NAMESPACES_64_SIZE;
                    st.g_debug_offset = LINK_NAMESPACES_64_SIZE - R_DEBUG_64_SIZE;
                } else {
                    st.dl_nns_offset = G_DL_NNS_32_OFFSET;
                    st.dl_load_lock_offset = G_DL_NNS_32_OFFSET + G_DL_LOAD_LOCK_DELTA_32;
                    st.link_namespaces_size = LINK_NAMESPACES_32_SIZE;
                    st.g_debug_offset = LINK_NAMESPACES_32_SIZE - R_DEBUG_32_SIZE;
                }
            }
        }

        let global = self.rtld_global(p);
        let psize = p.ptr_size();
        let mut tried = false;
        loop {
            let off = self.state.borrow().dl_nns_offset;
            match p.read_scalar_quietly(psize, 8, global + off, true) {
                Ok(n) if n > 0 && n < DL_NNS => return n,
                Ok(n) => {
                    // Whatever we are looking at, it is not dl_nns.
                    if tried || self.find_dl_nns(p).is_err() {
                        debug!(
                            "{}: {} namespaces is not valid: probably incompatible glibc",
                            p.pid(),
                            n
                        );
                        self.state.borrow_mut().lmid_incompatible_glibc = true;
                        return 1;
                    }
                    tried = true;
                }
                Err(_) => {
                    debug!("{}: cannot read namespace count", p.pid());
                    return 1;
                }
            }
        }
    }

    /// The address of the Nth namespace's `r_debug`, or 0.
    fn ns_debug_addr(&self, p: &mut Process, lmid: u64) -> u64 {
        if lmid == 0 || p.no_dyn {
            let addr = p.r_debug();
            return if addr == R_DEBUG_NONE { 0 } else { addr };
        }

        let global = self.rtld_global(p);
        if global == 0 || lmid >= self.dl_nns(p) {
            return 0;
        }

        let st = self.state.borrow();
        global + st.link_namespaces_size * lmid + st.g_debug_offset
    }

    /// The address of the first link map in a namespace, or 0.
    fn first_link_map(&self, p: &mut Process, lmid: u64) -> u64 {
        if lmid == 0 {
            let dbg = self.ns_debug_addr(p, 0);
            if dbg == 0 {
                return 0;
            }
            return p
                .read_ptr_quietly(dbg + r_debug_field(p.elf64(), 1))
                .unwrap_or(0);
        }

        let global = self.rtld_global(p);
        if global == 0 || lmid >= self.dl_nns(p) {
            return 0;
        }

        // Fish the link map straight out of _ns_loaded, the first member
        // of the namespace element.
        let elem = global + self.state.borrow().link_namespaces_size * lmid;
        p.read_ptr_quietly(elem).unwrap_or(0)
    }

    /// The load count of namespace N, N > 0.
    fn ns_nloaded(&self, p: &mut Process, lmid: u64) -> u64 {
        let global = self.rtld_global(p);
        let addr =
            global + self.state.borrow().link_namespaces_size * lmid + p.ptr_size() as u64;
        match p.read_scalar_quietly(4, 8, addr, true) {
            Ok(n) => n,
            Err(_) => {
                debug!("{}: cannot read loaded object count", p.pid());
                1
            }
        }
    }

    /// The `_dl_load_lock` count: nonzero whenever a dlopen()/dlclose()
    /// is underway.
    fn load_lock(&self, p: &mut Process) -> Option<u64> {
        let global = self.rtld_global(p);
        if global == 0 {
            return Some(0);
        }
        let off = self.state.borrow().dl_load_lock_offset;
        p.read_scalar_quietly(4, 8, global + off, true).ok()
    }

    fn get_link_map(&self, p: &mut Process, addr: u64) -> Option<LinkMap> {
        let e64 = p.elf64();
        Some(LinkMap {
            l_addr: p.read_ptr_quietly(addr + lm_off(e64, 0)).ok()?,
            l_name: p.read_ptr_quietly(addr + lm_off(e64, 1)).ok()?,
            l_ld: p.read_ptr_quietly(addr + lm_off(e64, 2)).ok()?,
            l_next: p.read_ptr_quietly(addr + lm_off(e64, 3)).ok()?,
        })
    }

    /// All link map addresses in the base namespace, sorted, for
    /// validation of structural scans.
    fn find_link_maps(&self, p: &mut Process) -> Option<Vec<u64>> {
        let first = self.first_link_map(p, 0);
        if first == 0 {
            return None;
        }

        let mut addrs = Vec::new();
        let mut addr = first;
        while addr != 0 && addrs.len() < SCAN_LIMIT as usize {
            addrs.push(addr);
            match self.get_link_map(p, addr) {
                Some(map) => addr = map.l_next,
                None => break,
            }
        }
        debug!("{}: counted {} link maps", p.pid(), addrs.len());
        if addrs.is_empty() {
            return None;
        }
        addrs.sort_unstable();
        Some(addrs)
    }

    /// Find the offset of the scope searchlist in the link map by
    /// structural scan: a (pointer P, count N >= 2) pair where the N
    /// pointers at P are all known link-map addresses.
    fn find_l_searchlist(&self, p: &mut Process) -> Result<()> {
        debug!("{}: finding l_searchlist", p.pid());

        let first = self.first_link_map(p, 0);
        if first == 0 {
            return Err(Error::LinkMapsNotReady(p.pid()));
        }
        let map_addrs = self
            .find_link_maps(p)
            .ok_or(Error::LinkMapsNotReady(p.pid()))?;

        let psize = p.ptr_size() as u64;
        // The integer count field is an unsigned int in all variants.
        let uint_size = 4usize;

        let mut scan = first
            + if p.elf64() {
                L_SEARCHLIST_64_OFFSET
            } else {
                L_SEARCHLIST_32_OFFSET
            };

        loop {
            if scan - first > SCAN_LIMIT {
                break;
            }
            let scan_next = scan + psize;

            let poss_list = match p.read_scalar_quietly(psize as usize, 8, scan, true) {
                Ok(v) => v,
                Err(_) => break,
            };
            let poss_nlist =
                match p.read_scalar_quietly(uint_size, 8, scan_next, true) {
                    Ok(v) => v,
                    Err(_) => break,
                };

            // A possible scope array.  Long enough to validate?
            if poss_nlist >= 2 {
                let mut matched = true;
                for i in 0..poss_nlist {
                    let entry = match p.read_scalar_quietly(
                        psize as usize,
                        8,
                        poss_list + i * psize,
                        true,
                    ) {
                        Ok(v) => v,
                        Err(_) => {
                            matched = false;
                            break;
                        }
                    };
                    if map_addrs.binary_search(&entry).is_err() {
                        matched = false;
                        break;
                    }
                }

                if matched {
                    let off = scan - first;
                    self.state.borrow_mut().l_searchlist_offset = off;
                    debug!("{}: found l_searchlist at offset {}", p.pid(), off);
                    return Ok(());
                }
            }

            scan += uint_size as u64;
        }

        debug!("{}: no searchlist found", p.pid());
        Err(Error::LinkMapsNotReady(p.pid()))
    }

    /// Fill a loadobj from a link map, reading the scope array out of
    /// the target.
    fn get_loadobj(self: &Rc<Self>, p: &mut Process, map: &LinkMap, addr: u64) -> Result<LoadObj> {
        self.consistent_begin(p)?;
        let res = (|| -> Result<LoadObj> {
            if self.state.borrow().l_searchlist_offset == 0 {
                self.find_l_searchlist(p)?;
            }
            let sl_off = self.state.borrow().l_searchlist_offset;

            let mut obj = LoadObj {
                lmid: 0,
                base: map.l_addr,
                nameaddr: map.l_name,
                dyn_addr: map.l_ld,
                scope: Vec::new(),
                default_scope: false,
            };

            let psize = p.ptr_size() as u64;
            let searchlist = p.read_ptr_quietly(addr + sl_off)?;
            let nscopes = p.read_scalar_quietly(4, 8, addr + sl_off + psize, true)?;

            for i in 0..nscopes {
                obj.scope
                    .push(p.read_ptr_quietly(searchlist + i * psize)?);
            }
            Ok(obj)
        })();
        match res {
            Err(Error::ExecDetected(pid)) => {
                debug!("{}: spotted exec() reading loadobj", pid);
                self.exec_reset();
                Err(Error::ExecDetected(pid))
            }
            other => {
                self.consistent_end(p);
                other
            }
        }
    }

    /// Read the consistency state of one lmid, or (with `None`) the most
    /// inconsistent state across all of them.
    ///
    /// `!= Consistent` does not necessarily mean the maps *are*
    /// inconsistent, merely that they may be: we may be stopped on the
    /// rendezvous breakpoint with consistent maps.  Use the consistency
    /// window functions to resolve the ambiguity.
    fn consistency(&self, p: &mut Process, lmid: Option<u64>) -> RdState {
        match lmid {
            Some(lmid) => {
                let addr = self.ns_debug_addr(p, lmid);
                if addr == 0 {
                    return RdState::Consistent;
                }
                match p.read_scalar_quietly(4, 8, addr + r_debug_field(p.elf64(), 3), true) {
                    Ok(raw) => {
                        let state = RdState::from_raw(raw);
                        if state != RdState::Consistent {
                            debug!("{}: map for lmid {} is inconsistent", p.pid(), lmid);
                        }
                        state
                    }
                    // Read failed?  Assume consistent: we must, or we
                    // would block forever.
                    Err(_) => RdState::Consistent,
                }
            }
            None => {
                let nns = self.dl_nns(p);
                for lmid in 0..nns {
                    let state = self.consistency(p, Some(lmid));
                    if state != RdState::Consistent {
                        return state;
                    }
                }
                RdState::Consistent
            }
        }
    }

    /// Open a consistency window: on return (and until
    /// [`RtldAgent::consistent_end`]) the base link map will not be in a
    /// mid-mutation state, though the process may be stopped at any time
    /// to enforce that.  Nested calls are cheap.
    pub fn consistent_begin(self: &Rc<Self>, p: &mut Process) -> Result<()> {
        {
            let mut st = self.state.borrow_mut();
            if st.no_inconsistent > 0 {
                st.no_inconsistent += 1;
                return Ok(());
            }
        }

        // Already stopped (at a breakpoint or otherwise)?  Fine as long
        // as the current state is consistent; if not, we cannot move to
        // a consistent one without causing trouble elsewhere.
        if p.bkpt_halted || p.state() != ProcessState::Run {
            if self.consistency(p, Some(0)) == RdState::Consistent {
                return Ok(());
            }
            return Err(Errno::EDEADLK.into());
        }

        p.trace(false)?;

        {
            let mut st = self.state.borrow_mut();
            st.ic_transitioned = false;
            st.no_inconsistent += 1;
        }

        // Arm the rendezvous breakpoint before the first check, so no
        // transition can slip between check and arm.
        let (monitoring, r_brk_addr) = {
            let st = self.state.borrow();
            (st.monitoring, st.r_brk_addr)
        };
        if !monitoring {
            let agent = Rc::clone(self);
            let res = p.bkpt(r_brk_addr, false, move |p, _| agent.brk_trap(p));
            self.state.borrow_mut().monitoring = true;
            if let Err(e) = res {
                self.state.borrow_mut().no_inconsistent -= 1;
                p.untrace(false);
                return Err(e);
            }
        }

        // Currently inconsistent?  Wait until we transition out, or die.
        // Only one link map can be mid-mutation at a time (the load lock
        // serializes dlopen across lmids), so waiting on the base map's
        // state is enough.
        if self.consistency(p, Some(0)) != RdState::Consistent {
            debug!(
                "{}: link maps inconsistent: waiting for transition",
                p.pid()
            );

            if p.state() == ProcessState::Stop || p.state() == ProcessState::TraceStop {
                p.bkpt_continue();
                self.state.borrow_mut().stop_on_consistent = true;
            }

            let wait_res = (|| -> Result<()> {
                p.wait(false)?;
                while !self.ic_transitioned()
                    && (p.state() == ProcessState::Run || p.group_stopped())
                    && self.consistency(p, Some(0)) != RdState::Consistent
                {
                    p.wait(true)?;
                }
                Ok(())
            })();
            self.state.borrow_mut().stop_on_consistent = false;
            if let Err(e) = wait_res {
                self.state.borrow_mut().no_inconsistent -= 1;
                p.untrace(false);
                return Err(e);
            }
        }

        if p.state() == ProcessState::Dead {
            self.state.borrow_mut().no_inconsistent -= 1;
            p.untrace(false);
            return Err(Error::Dead(p.pid()));
        }
        Ok(())
    }

    /// Close a consistency window.
    pub fn consistent_end(&self, p: &mut Process) {
        {
            let mut st = self.state.borrow_mut();
            // Unbalanced calls, or calls from inside a breakpoint
            // handler.
            if st.no_inconsistent == 0 {
                return;
            }
            st.no_inconsistent -= 1;
            if st.no_inconsistent > 0 {
                return;
            }
        }

        // Disarm the breakpoint unless event monitoring still wants it.
        let (has_event_fun, r_brk_addr) = {
            let st = self.state.borrow();
            (st.event_fun.is_some(), st.r_brk_addr)
        };
        if !has_event_fun {
            p.unbkpt(r_brk_addr);
            self.state.borrow_mut().monitoring = false;
        }

        if p.bkpt_addr() != 0 {
            p.bkpt_continue();
        }
        p.untrace(false);
    }

    /// Require consistency for namespaces other than zero too: wait for
    /// the load lock to drop or the rendezvous breakpoint to fire, then
    /// hold the process stopped.  Must be used inside a
    /// [`RtldAgent::consistent_begin`] window.  Slow (it can busy-wait)
    /// and expensive (it stops the process); only for multi-lmid walks.
    fn nonzero_lmid_consistent_begin(self: &Rc<Self>, p: &mut Process) -> Result<()> {
        if p.bkpt_halted || p.state() != ProcessState::Run {
            if self.consistency(p, None) == RdState::Consistent {
                return Ok(());
            }
            return Err(Errno::EDEADLK.into());
        }

        if self.state.borrow().lmid_incompatible_glibc {
            return Err(Error::LinkMapsNotReady(p.pid()));
        }

        // This time we halt on transition to a *consistent* state.
        self.state.borrow_mut().stop_on_consistent = true;
        p.wait(false)?;

        if p.state() == ProcessState::Dead {
            return Err(Error::Dead(p.pid()));
        }

        // Halted at the breakpoint with a consistent map is acceptable;
        // sanity-check that the load lock is indeed held.
        if self.ic_transitioned()
            && self.consistency(p, None) == RdState::Consistent
            && p.state() != ProcessState::Run
        {
            if self.load_lock(p) == Some(0) {
                let mut st = self.state.borrow_mut();
                st.lmid_incompatible_glibc = true;
                st.stop_on_consistent = false;
                debug!(
                    "{}: definitely inside dynamic linker, but _dl_load_lock appears \
                     zero: probable glibc internal data structure change",
                    p.pid()
                );
                return Err(Error::LinkMapsNotReady(p.pid()));
            }
            return Ok(());
        }

        if self.ic_transitioned() && p.state() != ProcessState::Run {
            // Halted at the breakpoint in what we now know is an
            // inconsistent state: nonzero maps are in flux, get going.
            self.state.borrow_mut().ic_transitioned = false;
            p.bkpt_continue();
        } else {
            // Stop the process while we check the lock.
            p.trace(true)?;

            match self.load_lock(p) {
                None => {
                    debug!("{}: cannot read load lock count", p.pid());
                    p.untrace(false);
                    return Ok(());
                }
                Some(0) => {
                    // Lock not taken: maps consistent as long as we stay
                    // halted.
                    self.state.borrow_mut().lmid_halted = true;
                    return Ok(());
                }
                Some(_) => {}
            }

            self.state.borrow_mut().ic_transitioned = false;
            p.untrace(false);
            if p.state() == ProcessState::TraceStop {
                p.bkpt_continue();
            }
        }

        // The lock is held.  Wait for the breakpoint or for the lock to
        // drop, with exponential backoff: the lock is a private futex in
        // another address space, so polling is all we have.  If it stays
        // held past the timeout, our idea of its location is probably
        // wrong: declare the glibc incompatible and degrade to
        // single-lmid operation.
        loop {
            p.wait(false)?;
            if p.state() != ProcessState::TraceStop {
                break;
            }
        }

        let mut timeout_ns: u64 = 1_000_000;
        while p.state() == ProcessState::Run && self.load_lock(p).unwrap_or(0) > 0 {
            if timeout_ns > LOCAL_MAPS_TIMEOUT_NS {
                p.bkpt_continue();
                let mut st = self.state.borrow_mut();
                st.lmid_incompatible_glibc = true;
                st.stop_on_consistent = false;
                debug!(
                    "{}: timeout waiting for r_brk, probable _dl_load_lock glibc \
                     internal data structure change",
                    p.pid()
                );
                return Err(Error::LinkMapsNotReady(p.pid()));
            }
            p.wait(false)?;
            std::thread::sleep(Duration::from_nanos(timeout_ns));
            timeout_ns *= 2;
        }

        if self.ic_transitioned() && p.state() == ProcessState::TraceStop {
            self.state.borrow_mut().lmid_bkpted = true;
        } else if p.state() == ProcessState::Dead {
            return Err(Error::Dead(p.pid()));
        } else {
            self.state.borrow_mut().lmid_halted = true;
            if let Err(e) = p.trace(true) {
                debug!(
                    "{}: cannot halt the process on entry to lmid-consistent \
                     dynamic linker state: {}",
                    p.pid(),
                    e
                );
            }
        }

        Ok(())
    }

    fn nonzero_lmid_consistent_end(&self, p: &mut Process) {
        let (halted, bkpted) = {
            let st = self.state.borrow();
            (st.lmid_halted, st.lmid_bkpted)
        };
        if halted {
            p.untrace(false);
        } else if bkpted {
            p.bkpt_continue();
        }
        let mut st = self.state.borrow_mut();
        st.stop_on_consistent = false;
        st.lmid_halted = false;
        st.lmid_bkpted = false;
    }

    /// Reset the consistency machinery without touching the child: used
    /// when an exec() has been detected, so that teardown does not
    /// resume the (new) process prematurely.
    pub(crate) fn exec_reset(&self) {
        let mut st = self.state.borrow_mut();
        st.no_inconsistent = 0;
        st.monitoring = false;
        st.stop_on_consistent = false;
        st.lmid_halted = false;
        st.lmid_bkpted = false;
        st.r_brk_addr = 0;
        st.rtld_global_addr = 0;
        st.maps_ready = false;
    }

    /// Iterate over all load objects in all consistent namespaces.  The
    /// callback returns false to stop early.
    ///
    /// `Error::LinkMapsNotReady` can be returned at any time, even after
    /// some objects have been delivered.  An exec() mid-iteration resets
    /// the agent and surfaces as `Error::ExecDetected`.
    pub fn loadobj_iter(
        self: &Rc<Self>,
        p: &mut Process,
        fun: &mut dyn FnMut(&mut Process, &LoadObj) -> bool,
    ) -> Result<()> {
        if self.state.borrow().released {
            return Err(Error::LinkMapsNotReady(p.pid()));
        }

        match self.loadobj_iter_inner(p, fun) {
            Err(Error::ExecDetected(pid)) => {
                debug!("{}: spotted exec() in loadobj_iter()", pid);
                self.exec_reset();
                Err(Error::ExecDetected(pid))
            }
            other => other,
        }
    }

    fn loadobj_iter_inner(
        self: &Rc<Self>,
        p: &mut Process,
        fun: &mut dyn FnMut(&mut Process, &LoadObj) -> bool,
    ) -> Result<()> {
        p.wait(false)?;

        if p.state() == ProcessState::Dead {
            debug!("{}: link map iteration failed: process is dead", p.pid());
            return Err(Error::Dead(p.pid()));
        }

        if self.r_brk(p) == 0 || !self.state.borrow().maps_ready {
            debug!("{}: link map iteration failed: maps are not ready", p.pid());
            return Err(Error::LinkMapsNotReady(p.pid()));
        }

        self.consistent_begin(p)?;

        let mut nonzero_consistent = false;
        let res = (|| -> Result<()> {
            let nns = self.dl_nns(p);
            debug!(
                "{}: iterating over link maps in {} namespaces",
                p.pid(),
                nns
            );

            let mut found_any = false;
            let mut primary_scope: Option<Vec<u64>> = None;

            for lmid in 0..nns {
                if !nonzero_consistent && nns > 1 {
                    nonzero_consistent = true;
                    self.nonzero_lmid_consistent_begin(p)?;
                }

                let nloaded = if lmid > 0 {
                    let n = self.ns_nloaded(p, lmid);
                    debug!("{}: {} objects in lmid {}", p.pid(), n, lmid);
                    n
                } else {
                    0
                };

                p.wait(false)?;

                let mut loadobj = self.first_link_map(p, lmid);
                if lmid == 0 && loadobj == 0 {
                    debug!("{}: link map iteration: no maps", p.pid());
                    return Err(Error::LinkMapsNotReady(p.pid()));
                }

                let mut n = 0u64;
                while loadobj != 0 && (lmid == 0 || n < nloaded) {
                    found_any = true;

                    let map = self
                        .get_link_map(p, loadobj)
                        .ok_or(Error::LinkMapsNotReady(p.pid()))?;
                    let mut obj = self.get_loadobj(p, &map, loadobj)?;
                    obj.lmid = lmid;

                    // The first object's searchlist is the default for
                    // any object that has none of its own.
                    if primary_scope.is_none() {
                        primary_scope = Some(obj.scope.clone());
                    }
                    if obj.scope.is_empty() {
                        if let Some(ps) = &primary_scope {
                            obj.scope = ps.clone();
                            obj.default_scope = true;
                        }
                    }

                    if !fun(p, &obj) {
                        return Ok(());
                    }

                    n += 1;
                    loadobj = map.l_next;
                }

                primary_scope = None;
            }

            if !found_any {
                debug!("{}: link map iteration: no maps", p.pid());
                return Err(Error::LinkMapsNotReady(p.pid()));
            }
            Ok(())
        })();

        if nonzero_consistent {
            self.nonzero_lmid_consistent_end(p);
        }
        self.consistent_end(p);

        res
    }

    /// Read one scope element of a loadobj as a loadobj of its own.
    pub fn get_scope(
        self: &Rc<Self>,
        p: &mut Process,
        obj: &LoadObj,
        scope: usize,
    ) -> Result<Option<LoadObj>> {
        {
            let st = self.state.borrow();
            if st.r_brk_addr == 0 || st.released {
                return Ok(None);
            }
        }
        if p.state() == ProcessState::Dead {
            return Ok(None);
        }
        if scope >= obj.scope.len() {
            return Ok(None);
        }

        let addr = obj.scope[scope];
        let map = match self.get_link_map(p, addr) {
            Some(m) => m,
            None => return Ok(None),
        };
        let mut slo = self.get_loadobj(p, &map, addr)?;
        slo.lmid = obj.lmid;
        Ok(Some(slo))
    }

    /// Install a DLACTIVITY callback, arming the rendezvous breakpoint.
    pub fn event_enable(
        self: &Rc<Self>,
        p: &mut Process,
        fun: RtldEventFn,
    ) -> Result<()> {
        {
            let mut st = self.state.borrow_mut();
            if st.released {
                return Err(Error::LinkMapsNotReady(p.pid()));
            }
            st.event_fun = Some(fun);
            if st.monitoring || st.monitor_suppressed {
                return Ok(());
            }
        }

        if p.state() == ProcessState::Dead {
            return Err(Error::Dead(p.pid()));
        }
        if self.r_brk(p) == 0 || !self.state.borrow().maps_ready {
            return Err(Error::LinkMapsNotReady(p.pid()));
        }

        let r_brk_addr = self.state.borrow().r_brk_addr;
        let agent = Rc::clone(self);
        p.bkpt(r_brk_addr, false, move |p, _| agent.brk_trap(p))?;
        self.state.borrow_mut().monitoring = true;
        debug!("{}: enabled rtld activity monitoring", p.pid());
        Ok(())
    }

    /// Remove the DLACTIVITY callback (notifying it of shutdown first).
    pub fn event_disable(&self, p: &mut Process) {
        if self.state.borrow().released {
            return;
        }
        self.event_teardown(p);
        debug!("{}: disabled rtld activity monitoring", p.pid());
    }

    /// Disable DLACTIVITY monitoring forever: threading has started, and
    /// races between thread creation and lazy loads are unresolvable.
    /// (Monitoring for consistency enforcement still happens.)
    pub fn event_suppress(&self, p: &mut Process) {
        self.event_teardown(p);
        self.state.borrow_mut().monitor_suppressed = true;
        debug!("{}: suppressed rtld activity monitoring", p.pid());
    }

    fn event_teardown(&self, p: &mut Process) {
        self.fire_event(p, RtldEvent::Shutdown);
        let (should_unbkpt, r_brk_addr) = {
            let mut st = self.state.borrow_mut();
            st.event_fun = None;
            let yes = st.monitoring && st.no_inconsistent == 0;
            if yes {
                st.monitoring = false;
            }
            (yes, st.r_brk_addr)
        };
        if should_unbkpt {
            p.unbkpt(r_brk_addr);
        }
    }

    /// Shut the agent down (without dropping it).
    pub(crate) fn release(&self, p: &mut Process) {
        if self.state.borrow().released {
            return;
        }

        loop {
            if self.state.borrow().no_inconsistent == 0 {
                break;
            }
            self.consistent_end(p);
        }

        let maps_ready = self.state.borrow().maps_ready;
        if !maps_ready {
            // The start-trap notifier may still be armed; removing an
            // already-removed breakpoint is harmless.
            if let Some(entry) = p.getauxval(AT_ENTRY) {
                p.unbkpt(entry);
            }
        } else {
            self.event_disable(p);
        }

        self.state.borrow_mut().released = true;
        debug!("{}: deactivated rtld agent", p.pid());
    }

    /// True once the link maps are known to be readable.
    pub fn maps_ready(&self) -> bool {
        self.state.borrow().maps_ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Rc<RtldAgent> {
        Rc::new(RtldAgent {
            state: RefCell::new(RtldState::new()),
        })
    }

    #[test]
    fn r_state_decoding() {
        assert_eq!(RdState::from_raw(0), RdState::Consistent);
        assert_eq!(RdState::from_raw(1), RdState::Add);
        assert_eq!(RdState::from_raw(2), RdState::Delete);
        // Garbage reads default to consistent: blocking forever on a
        // misread is the one unacceptable outcome.
        assert_eq!(RdState::from_raw(77), RdState::Consistent);
    }

    #[test]
    fn link_map_and_r_debug_offsets_track_elf_class() {
        // l_addr, l_name, l_ld, l_next at pointer strides.
        assert_eq!(lm_off(true, 0), 0);
        assert_eq!(lm_off(true, 3), 24);
        assert_eq!(lm_off(false, 3), 12);

        // r_version, r_map, r_brk, r_state.
        assert_eq!(r_debug_field(true, 0), 0);
        assert_eq!(r_debug_field(true, 1), 8);
        assert_eq!(r_debug_field(true, 2), 16);
        assert_eq!(r_debug_field(true, 3), 24);
        assert_eq!(r_debug_field(false, 2), 8);
        assert_eq!(r_debug_field(false, 3), 12);
    }

    #[test]
    fn namespace_offset_guesses_are_self_consistent() {
        // dl_nns() seeds these before any structural scan.  The debug
        // element sits at the end of each namespace element, so the
        // guessed element size must be able to hold one; and dl_nns must
        // lie past the namespace array it counts.
        assert!(R_DEBUG_64_SIZE < LINK_NAMESPACES_64_SIZE);
        assert!(R_DEBUG_32_SIZE < LINK_NAMESPACES_32_SIZE);
        assert!(G_DL_NNS_64_OFFSET >= DL_NNS * (LINK_NAMESPACES_64_SIZE / 8));
        assert!(G_DL_NNS_32_OFFSET >= DL_NNS * (LINK_NAMESPACES_32_SIZE / 8));
        // A stale guess must still fall inside the forward-scan window,
        // or find_dl_nns() could never correct it.
        assert!(SCAN_LIMIT > DL_NNS * LINK_NAMESPACES_64_SIZE);
    }

    #[test]
    fn exec_reset_clears_the_consistency_machinery() {
        let rap = agent();
        {
            let mut st = rap.state.borrow_mut();
            st.maps_ready = true;
            st.monitoring = true;
            st.no_inconsistent = 3;
            st.stop_on_consistent = true;
            st.ic_transitioned = true;
            st.lmid_halted = true;
            st.lmid_bkpted = true;
            st.r_brk_addr = 0x7f00_0000_1000;
            st.rtld_global_addr = 0x7f00_0000_2000;
        }

        rap.exec_reset();

        let st = rap.state.borrow();
        assert!(!st.maps_ready);
        assert!(!st.monitoring);
        assert_eq!(st.no_inconsistent, 0);
        assert!(!st.stop_on_consistent);
        assert!(!st.lmid_halted);
        assert!(!st.lmid_bkpted);
        // The rendezvous addresses belong to the old address space.
        assert_eq!(st.r_brk_addr, 0);
        assert_eq!(st.rtld_global_addr, 0);
    }

    #[test]
    fn exec_reset_preserves_permanent_degradations() {
        let rap = agent();
        rap.state.borrow_mut().lmid_incompatible_glibc = true;
        rap.state.borrow_mut().monitor_suppressed = true;

        rap.exec_reset();

        // Suppression and glibc incompatibility outlive the exec: the
        // conditions that caused them (threading, unprobeable layout)
        // are properties of the program, not of one address space.
        let st = rap.state.borrow();
        assert!(st.monitor_suppressed);
        assert!(st.lmid_incompatible_glibc);
    }

    #[test]
    fn fresh_agents_start_unready_and_unarmed() {
        let rap = agent();
        assert!(!rap.maps_ready());
        assert!(!rap.ic_transitioned());
        let st = rap.state.borrow();
        assert!(!st.monitoring);
        assert!(!st.monitor_suppressed);
        assert_eq!(st.no_inconsistent, 0);
        // Zero means "not discovered yet" and forces the structural
        // scans on first use.
        assert_eq!(st.l_searchlist_offset, 0);
        assert_eq!(st.dl_nns_offset, 0);
    }
}
