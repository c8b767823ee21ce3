//! The uprobe-backed providers: `pid<N>` and USDT probes, and the
//! separate is-enabled pseudo-provider.
//!
//! A request for a pid or USDT probe is satisfied by creating (or
//! finding) an *underlying* probe keyed by `(device, inode, offset)` --
//! the identity of a kernel uprobe -- and mounting a per-pid *overlying*
//! probe on it.  Many pid probes can ride one uprobe; the uprobe's
//! trampoline demultiplexes by the current process id and runs the
//! matching probe's clauses.
//!
//! Underlying probe naming:
//!
//! ```text
//! uprobe:<dev>_<ino>:<function>:<offset>     (entry and offset probes)
//! uprobe:<dev>_<ino>:<function>:return      (return probes)
//! ```

use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

use crate::bpf::dctx::{dmst_arg, tramp_sp_slot, DMST_ARGC};
use crate::bpf::insn::{self, helpers, Insn};
use crate::bpf::{ProgType, TrampolineBuilder};
use crate::error::{Error, Result};
use crate::probe::{ArgDesc, ProbeData, ProbeDesc, ProbeId, TpProbe};
use crate::proc::{Process, ProcessState};
use crate::provider::{tp, ProviderOps, PROV_PID};
use crate::session::Session;
use crate::tracefs;

pub(crate) const PROV_UPROBE: &str = "uprobe";
pub(crate) const PROV_IS_ENABLED: &str = "uprobe__is_enabled";

pub const PP_IS_RETURN: u32 = 0x2;
pub const PP_IS_FUNCALL: u32 = 0x4;
pub const PP_IS_ENABLED: u32 = 0x8;

/// Private state of an underlying uprobe probe.
pub struct UprobeData {
    pub dev: u64,
    pub ino: u64,
    pub off: u64,
    pub flags: u32,
    /// On-disk path of the backing file, for the uprobe_events line.
    pub path: Option<String>,
    pub tp: TpProbe,
    /// The pid/USDT probes this uprobe fires.
    pub probes: Vec<ProbeId>,
}

/// What kind of site a pid probe instrument.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PidProbeType {
    Entry,
    Return,
    /// An instruction offset within a function.
    Offset,
    /// A USDT is-enabled site: the probe writes 1 through the pointer
    /// the site passes.
    IsEnabled,
}

/// A request for a probe on a specific process.
pub struct PidProbeSpec {
    /// Base provider name (`pid`, or the USDT provider name).
    pub prv: String,
    pub pid: libc::pid_t,
    pub ptype: PidProbeType,
    pub module: String,
    pub function: String,
    pub name: String,
    pub dev: u64,
    pub ino: u64,
    pub off: u64,
    pub path: Option<String>,
}

/// Build a pid probe spec for a function (or function+offset) in a live
/// process, resolving through its symbol and mapping caches.
pub fn pid_probespec_from_symbol(
    p: &mut Process,
    prv: &str,
    function: &str,
    ptype: PidProbeType,
) -> Result<PidProbeSpec> {
    if p.state() == ProcessState::Dead {
        return Err(Error::Dead(p.pid()));
    }

    let sym = p
        .lookup_by_name(function)
        .ok_or_else(|| Error::NoProbe(format!("{} in pid {}", function, p.pid())))?;

    let pid = p.pid();

    let m = p
        .addr_to_map(sym.value)
        .ok_or_else(|| Error::NoProbe(format!("{} not mapped in pid {}", function, pid)))?;

    // A uprobe is identified by file offset, not by virtual address.
    let off = sym.value - m.start + m.offset;

    Ok(PidProbeSpec {
        prv: prv.to_string(),
        pid,
        ptype,
        module: m
            .name
            .rsplit('/')
            .next()
            .unwrap_or(&m.name)
            .to_string(),
        function: function.to_string(),
        name: String::new(),
        dev: m.dev,
        ino: m.ino,
        off,
        path: Some(m.name.clone()),
    })
}

fn underlying_desc(psp: &PidProbeSpec) -> ProbeDesc {
    let module = format!("{:x}_{:x}", psp.dev, psp.ino);
    let prb = match psp.ptype {
        PidProbeType::Return => "return".to_string(),
        _ => format!("{:x}", psp.off),
    };
    let prv = if psp.ptype == PidProbeType::IsEnabled {
        PROV_IS_ENABLED
    } else {
        PROV_UPROBE
    };
    ProbeDesc::new(prv, &module, &psp.function, &prb)
}

fn overlying_desc(psp: &PidProbeSpec) -> ProbeDesc {
    let prv = format!("{}{}", psp.prv, psp.pid);
    let prb = match psp.ptype {
        PidProbeType::Entry => "entry".to_string(),
        PidProbeType::Return => "return".to_string(),
        PidProbeType::Offset => format!("{:x}", psp.off),
        PidProbeType::IsEnabled => psp.name.clone(),
    };
    ProbeDesc::new(&prv, &psp.module, &psp.function, &prb)
}

/// The pid of the process an overlying probe serves, from its provider
/// name (`pid1234` -> 1234).
fn probe_pid(desc: &ProbeDesc) -> Option<libc::pid_t> {
    let digits = desc.provider.trim_start_matches(|c: char| !c.is_ascii_digit());
    digits.parse().ok()
}

fn group() -> String {
    format!("dt_{}_uprobe", std::process::id())
}

/// Find (or create) the underlying probe for a spec.
fn create_underlying(stp: &mut Session, psp: &PidProbeSpec) -> Result<ProbeId> {
    let pd = underlying_desc(psp);

    if let Some(id) = stp.registry.lookup(&pd) {
        if let Some(probe) = stp.registry.get(id) {
            if let ProbeData::Uprobe(upp) = &probe.data {
                let mut up = upp.borrow_mut();
                match psp.ptype {
                    PidProbeType::Return => up.flags |= PP_IS_RETURN,
                    PidProbeType::IsEnabled => up.flags |= PP_IS_ENABLED,
                    _ => {}
                }
            }
        }
        return Ok(id);
    }

    let prov = stp
        .provider_lookup(&pd.provider)
        .ok_or_else(|| Error::NoProbe(pd.fqn()))?;

    let mut flags = 0;
    match psp.ptype {
        PidProbeType::Return => flags |= PP_IS_RETURN,
        PidProbeType::IsEnabled => flags |= PP_IS_ENABLED,
        _ => {}
    }

    let data = UprobeData {
        dev: psp.dev,
        ino: psp.ino,
        off: psp.off,
        flags,
        path: psp.path.clone(),
        tp: TpProbe::default(),
        probes: Vec::new(),
    };
    Ok(stp.probe_insert(prov, pd, ProbeData::Uprobe(Rc::new(RefCell::new(data)))))
}

/// Create an overlying pid/USDT probe riding the underlying uprobe.
fn provide_probe(stp: &mut Session, psp: &PidProbeSpec, extra_flags: u32) -> Result<usize> {
    let pd = overlying_desc(psp);

    // Get (or create) the per-pid provider, and mark it pid-based.
    let prov = stp.provider_create(&pd.provider, PROV_PID, Rc::new(PidProvider));
    stp.provider_mark_pid(prov);

    let uprp = create_underlying(stp, psp)?;
    if let Some(ProbeData::Uprobe(upp)) = stp.registry.get(uprp).map(|p| &p.data) {
        upp.borrow_mut().flags |= extra_flags;
    }

    let prp = match stp.registry.lookup(&pd) {
        Some(prp) => {
            // Existing probe: nothing to do if already riding this
            // uprobe.
            if let Some(ProbeData::PidList(list)) = stp.registry.get(prp).map(|p| &p.data) {
                if !list.borrow().contains(&uprp) {
                    list.borrow_mut().push(uprp);
                }
            }
            prp
        }
        None => stp.probe_insert(prov, pd, ProbeData::PidList(RefCell::new(vec![uprp]))),
    };

    if let Some(ProbeData::Uprobe(upp)) = stp.registry.get(uprp).map(|p| &p.data) {
        let mut up = upp.borrow_mut();
        if !up.probes.contains(&prp) {
            up.probes.push(prp);
        }
    }

    debug!(
        "pid: provided {} over uprobe {}",
        stp.registry.get(prp).map(|p| p.desc.fqn()).unwrap_or_default(),
        uprp
    );
    Ok(1)
}

/// The underlying uprobe provider.
pub struct UprobeProvider;

impl ProviderOps for UprobeProvider {
    fn name(&self) -> &'static str {
        PROV_UPROBE
    }

    fn prog_type(&self) -> ProgType {
        ProgType::Kprobe
    }

    fn populate(&self, stp: &mut Session) -> Result<usize> {
        stp.provider_create(PROV_UPROBE, 0, Rc::new(UprobeProvider));
        stp.provider_create(PROV_IS_ENABLED, 0, Rc::new(IsEnabledProvider));
        Ok(0)
    }

    fn provide_pid(&self, stp: &mut Session, psp: &PidProbeSpec) -> Result<usize> {
        match psp.ptype {
            PidProbeType::Entry | PidProbeType::Return | PidProbeType::Offset => {
                provide_probe(stp, psp, 0)
            }
            PidProbeType::IsEnabled => provide_probe(stp, psp, PP_IS_FUNCALL),
        }
    }

    /// The uprobe context is a `pt_regs` at the instrumented
    /// instruction.  After the machine state is filled, emulate the
    /// firing of every pid probe serving the current process.
    fn trampoline(
        &self,
        stp: &Session,
        prp: ProbeId,
        tb: &mut TrampolineBuilder,
    ) -> Result<()> {
        let probe = stp
            .registry
            .get(prp)
            .ok_or_else(|| Error::NoProbe(format!("probe {}", prp)))?;
        let upp = match &probe.data {
            ProbeData::Uprobe(upp) => upp,
            _ => return Err(Error::NoProbe(format!("probe {}", prp))),
        };
        let (flags, riders) = {
            let up = upp.borrow();
            (up.flags, up.probes.clone())
        };

        tb.prologue();
        tb.copy_regs();
        if flags & PP_IS_RETURN != 0 {
            tb.copy_rval_from_regs();
        } else {
            tb.copy_args_from_regs(flags & PP_IS_FUNCALL != 0);
        }

        emit_pid_dispatch(stp, tb, &riders)?;
        Ok(())
    }

    fn attach(&self, stp: &mut Session, prp: ProbeId, bpf_fd: i32) -> Result<()> {
        attach_uprobe(stp, prp, bpf_fd)
    }

    fn detach(&self, stp: &mut Session, prp: ProbeId) {
        detach_uprobe(stp, prp);
    }
}

/// Branch on the current pid and run each rider's clauses.
fn emit_pid_dispatch(
    stp: &Session,
    tb: &mut TrampolineBuilder,
    riders: &[ProbeId],
) -> Result<()> {
    tb.list
        .emit(Insn::call_helper(helpers::BPF_FUNC_GET_CURRENT_PID_TGID));
    tb.list
        .emit(Insn::alu64_imm(insn::BPF_RSH, insn::R0, 32));

    // It is safe to keep the pid in %r0 across the chain: nothing below
    // assigns it between the comparisons.
    let mut emitted = false;
    for &rider in riders {
        let rp = match stp.registry.get(rider) {
            Some(rp) if rp.enabled && !rp.clauses.is_empty() => rp,
            _ => continue,
        };
        let pid = match probe_pid(&rp.desc) {
            Some(pid) => pid,
            None => continue,
        };

        let next = tb.list.new_label();
        tb.list.emit_branch_imm(insn::BPF_JNE, insn::R0, pid, next);
        tb.set_prid(rider as u32);
        tb.call_clauses(&rp.clauses)?;
        tb.goto_exit();
        tb.list.label(next);
        emitted = true;
    }

    if !emitted {
        return Err(Error::Unresolved(
            "uprobe has no enabled pid probes".to_string(),
        ));
    }
    Ok(())
}

fn attach_uprobe(stp: &mut Session, prp: ProbeId, bpf_fd: i32) -> Result<()> {
    let root = stp.tracefs_root.clone();
    let probe = stp
        .registry
        .get(prp)
        .ok_or_else(|| Error::NoProbe(format!("probe {}", prp)))?;
    let upp = match &probe.data {
        ProbeData::Uprobe(upp) => upp,
        _ => return Err(Error::NoProbe(format!("probe {}", prp))),
    };

    let (dev, ino, off, flags, path, have_id) = {
        let up = upp.borrow();
        (
            up.dev,
            up.ino,
            up.off,
            up.flags,
            up.path.clone(),
            up.tp.event_id.is_some(),
        )
    };
    let is_return = flags & PP_IS_RETURN != 0;
    let name = tracefs::uprobe_name(dev, ino, off, is_return);

    if !have_id {
        let path = path.ok_or_else(|| Error::NoProbe(format!("uprobe {} has no path", name)))?;
        let id = tracefs::uprobe_create(&root, &group(), &name, &path, off, is_return)?;
        let mut up = upp.borrow_mut();
        up.tp.event_id = Some(id);
        up.tp.created = true;
    }

    // The perf attach is the same as any tracepoint's.
    let tp_cell = RefCell::new(TpProbe {
        event_id: upp.borrow().tp.event_id,
        event_fd: upp.borrow().tp.event_fd,
        created: upp.borrow().tp.created,
    });
    tp::tp_attach(&tp_cell, bpf_fd)?;
    upp.borrow_mut().tp.event_fd = tp_cell.borrow().event_fd;
    Ok(())
}

fn detach_uprobe(stp: &mut Session, prp: ProbeId) {
    let root = stp.tracefs_root.clone();
    if let Some(probe) = stp.registry.get(prp) {
        if let ProbeData::Uprobe(upp) = &probe.data {
            let mut up = upp.borrow_mut();
            if let Some(fd) = up.tp.event_fd.take() {
                unsafe {
                    libc::close(fd);
                }
            }
            up.tp.event_id = None;
            // Only remove the kernel-side uprobe if this instance wrote
            // it; a helper daemon's lines are not ours to erase.
            if up.tp.created {
                let name =
                    tracefs::uprobe_name(up.dev, up.ino, up.off, up.flags & PP_IS_RETURN != 0);
                let _ = tracefs::uprobe_delete(&root, &group(), &name);
                up.tp.created = false;
            }
        }
    }
}

/// USDT is-enabled probes: a pseudo-provider whose trampoline writes 1
/// through the pointer the instrumentation site passes as its first
/// argument.
pub struct IsEnabledProvider;

impl ProviderOps for IsEnabledProvider {
    fn name(&self) -> &'static str {
        PROV_IS_ENABLED
    }

    fn prog_type(&self) -> ProgType {
        ProgType::Kprobe
    }

    fn populate(&self, _stp: &mut Session) -> Result<usize> {
        Ok(0)
    }

    fn trampoline(
        &self,
        stp: &Session,
        prp: ProbeId,
        tb: &mut TrampolineBuilder,
    ) -> Result<()> {
        let probe = stp
            .registry
            .get(prp)
            .ok_or_else(|| Error::NoProbe(format!("probe {}", prp)))?;
        let riders = match &probe.data {
            ProbeData::Uprobe(upp) => upp.borrow().probes.clone(),
            _ => Vec::new(),
        };

        tb.prologue();
        tb.copy_regs();
        tb.copy_args_from_regs(false);

        // Gate on the current pid: only processes with an enabled USDT
        // probe see a 1.
        tb.list
            .emit(Insn::call_helper(helpers::BPF_FUNC_GET_CURRENT_PID_TGID));
        tb.list
            .emit(Insn::alu64_imm(insn::BPF_RSH, insn::R0, 32));

        let mut emitted = false;
        for &rider in &riders {
            let rp = match stp.registry.get(rider) {
                Some(rp) if rp.enabled => rp,
                _ => continue,
            };
            let pid = match probe_pid(&rp.desc) {
                Some(pid) => pid,
                None => continue,
            };
            let next = tb.list.new_label();
            tb.list.emit_branch_imm(insn::BPF_JNE, insn::R0, pid, next);
            emit_copyout_one(tb);
            tb.goto_exit();
            tb.list.label(next);
            emitted = true;
        }

        if !emitted {
            return Err(Error::Unresolved(
                "is-enabled probe has no enabled USDT probes".to_string(),
            ));
        }
        Ok(())
    }

    fn attach(&self, stp: &mut Session, prp: ProbeId, bpf_fd: i32) -> Result<()> {
        attach_uprobe(stp, prp, bpf_fd)
    }

    fn detach(&self, stp: &mut Session, prp: ProbeId) {
        detach_uprobe(stp, prp);
    }
}

/// Write a 32-bit 1 through the pointer in argv[0]:
/// `bpf_probe_write_user(argv[0], &1, 4)`.
fn emit_copyout_one(tb: &mut TrampolineBuilder) {
    let slot = tramp_sp_slot(DMST_ARGC);
    tb.list
        .emit(Insn::store_imm(insn::BPF_W, insn::FP, slot, 1));
    tb.list
        .emit(Insn::load(insn::BPF_DW, insn::R1, insn::R7, dmst_arg(0)));
    tb.list.emit(Insn::mov_reg(insn::R2, insn::FP));
    tb.list
        .emit(Insn::alu64_imm(insn::BPF_ADD, insn::R2, slot as i32));
    tb.list.emit(Insn::mov_imm(insn::R3, 4));
    tb.list
        .emit(Insn::call_helper(helpers::BPF_FUNC_PROBE_WRITE_USER));
}

/// The per-pid overlay provider (`pid<N>`, USDT).  Overlay probes never
/// load programs of their own; they ride their underlying uprobes.
pub struct PidProvider;

impl ProviderOps for PidProvider {
    fn name(&self) -> &'static str {
        "pid"
    }

    fn populate(&self, _stp: &mut Session) -> Result<usize> {
        Ok(0)
    }

    fn attachable(&self) -> bool {
        false
    }

    /// Enabling a pid probe enables its underlying uprobes, and (for
    /// USDT probes) the matching is-enabled probe.
    fn enable(&self, stp: &mut Session, prp: ProbeId) {
        let (underliers, desc) = match stp.registry.get(prp) {
            Some(p) => match &p.data {
                ProbeData::PidList(list) => (list.borrow().clone(), p.desc.clone()),
                _ => return,
            },
            None => return,
        };

        for uprp in underliers {
            stp.enable_probe_default(uprp);
        }

        // An is-enabled twin shares our description under the
        // is-enabled provider's name.
        let mut twin = desc;
        twin.provider = PROV_IS_ENABLED.to_string();
        if let Some(iep) = stp.registry.lookup(&twin) {
            stp.enable_probe_default(iep);
        }

        stp.enable_probe_default(prp);
    }

    fn trampoline(
        &self,
        _stp: &Session,
        _prp: ProbeId,
        _tb: &mut TrampolineBuilder,
    ) -> Result<()> {
        Ok(())
    }

    fn attach(&self, _stp: &mut Session, _prp: ProbeId, _bpf_fd: i32) -> Result<()> {
        Ok(())
    }

    fn probe_info(&self, _stp: &mut Session, _prp: ProbeId) -> Result<Vec<ArgDesc>> {
        Ok((0..6)
            .map(|i| ArgDesc {
                native: Some("uint64_t".to_string()),
                xlate: None,
                mapping: i as u8,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::Clause;

    fn spec(ptype: PidProbeType, pid: libc::pid_t) -> PidProbeSpec {
        PidProbeSpec {
            prv: "pid".to_string(),
            pid,
            ptype,
            module: "a.out".to_string(),
            function: "main".to_string(),
            name: String::new(),
            dev: 0xfd01,
            ino: 0x1234,
            off: 0x4f0,
            path: Some("/usr/bin/a.out".to_string()),
        }
    }

    fn session() -> Session {
        let mut stp = Session::new();
        UprobeProvider.populate(&mut stp).unwrap();
        stp
    }

    #[test]
    fn pid_probes_share_underlying_uprobes() {
        let mut stp = session();

        stp.provide_pid(&spec(PidProbeType::Entry, 100)).unwrap();
        stp.provide_pid(&spec(PidProbeType::Entry, 200)).unwrap();

        // One uprobe, two riders.
        let under = stp
            .registry
            .lookup(&ProbeDesc::new("uprobe", "fd01_1234", "main", "4f0"))
            .expect("underlying uprobe missing");
        if let ProbeData::Uprobe(upp) = &stp.registry.get(under).unwrap().data {
            assert_eq!(upp.borrow().probes.len(), 2);
        } else {
            panic!("wrong probe data");
        }

        assert!(stp
            .registry
            .lookup(&ProbeDesc::new("pid100", "a.out", "main", "entry"))
            .is_some());
        assert!(stp
            .registry
            .lookup(&ProbeDesc::new("pid200", "a.out", "main", "entry"))
            .is_some());
    }

    #[test]
    fn return_probes_get_their_own_uprobe() {
        let mut stp = session();
        stp.provide_pid(&spec(PidProbeType::Entry, 100)).unwrap();
        stp.provide_pid(&spec(PidProbeType::Return, 100)).unwrap();

        assert!(stp
            .registry
            .lookup(&ProbeDesc::new("uprobe", "fd01_1234", "main", "4f0"))
            .is_some());
        assert!(stp
            .registry
            .lookup(&ProbeDesc::new("uprobe", "fd01_1234", "main", "return"))
            .is_some());
    }

    #[test]
    fn dispatch_branches_on_pid() {
        let mut stp = session();
        stp.provide_pid(&spec(PidProbeType::Entry, 4242)).unwrap();

        let pid_probe = stp
            .registry
            .lookup(&ProbeDesc::new("pid4242", "a.out", "main", "entry"))
            .unwrap();
        stp.enable_probe(pid_probe);
        stp.add_clause(
            pid_probe,
            Clause {
                func_id: 9,
                pred_id: None,
            },
        );

        let under = stp
            .registry
            .lookup(&ProbeDesc::new("uprobe", "fd01_1234", "main", "4f0"))
            .unwrap();
        let prog = stp.build_program(under).unwrap();

        // The program compares against the rider's pid and calls its
        // clause.
        assert!(prog
            .insns
            .iter()
            .any(|i| i.code == 0x55 && i.imm == 4242));
        assert_eq!(prog.relocs.len(), 1);
        assert_eq!(prog.relocs[0].func_id, 9);
    }

    #[test]
    fn enabling_usdt_enables_is_enabled_twin() {
        let mut stp = session();
        let mut s = spec(PidProbeType::Offset, 77);
        s.prv = "usdt_app".to_string();
        stp.provide_pid(&s).unwrap();

        let mut ie = spec(PidProbeType::IsEnabled, 77);
        ie.prv = "usdt_app".to_string();
        ie.name = "4f0".to_string();
        stp.provide_pid(&ie).unwrap();

        let overlying = stp
            .registry
            .lookup(&ProbeDesc::new("usdt_app77", "a.out", "main", "4f0"))
            .unwrap();
        stp.enable_probe(overlying);

        // The is-enabled underlying probe came along.
        let iep = stp
            .registry
            .lookup(&ProbeDesc::new(
                PROV_IS_ENABLED,
                "fd01_1234",
                "main",
                "4f0",
            ))
            .unwrap();
        assert!(stp.registry.get(iep).unwrap().enabled);
    }
}
