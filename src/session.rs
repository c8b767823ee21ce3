//! A tracing session: the provider registry, the probe registry, the
//! enabling list, and the enable → trampoline → load → attach pipeline.

use log::debug;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use crate::bpf::{Clause, Program, TrampolineBuilder};
use crate::error::{Error, Result};
use crate::probe::{ArgDesc, ProbeData, ProbeDesc, ProbeId, ProbeRegistry};
use crate::provider::{self, Provider, ProviderOps};
use crate::tracefs;

pub struct Session {
    pub registry: ProbeRegistry,
    providers: Vec<Provider>,
    providers_by_name: HashMap<String, usize>,
    enablings: Vec<ProbeId>,
    /// Root of the tracefs mount used for event management.
    pub tracefs_root: PathBuf,
    kernel_version: u64,
}

/// Encode a kernel version the way dependency filters expect.
pub const fn kernel_version(major: u64, minor: u64, patch: u64) -> u64 {
    (major << 16) | (minor << 8) | if patch > 255 { 255 } else { patch }
}

fn runtime_kernel_version() -> u64 {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").unwrap_or_default();
    let mut parts = release
        .trim()
        .split(|c: char| !c.is_ascii_digit())
        .map(|s| s.parse::<u64>().unwrap_or(0));
    kernel_version(
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

impl Session {
    /// An empty session: providers registered, no probes yet.
    pub fn new() -> Session {
        Session {
            registry: ProbeRegistry::new(),
            providers: Vec::new(),
            providers_by_name: HashMap::new(),
            enablings: Vec::new(),
            tracefs_root: tracefs::tracefs_root(),
            kernel_version: runtime_kernel_version(),
        }
    }

    /// Open a session: register every built-in provider family and let
    /// each populate its statically-knowable probes.
    pub fn open() -> Result<Session> {
        let mut stp = Session::new();

        let ops: Vec<Rc<dyn ProviderOps>> = vec![
            Rc::new(provider::dtrace::DtraceProvider),
            Rc::new(provider::fbt::FbtProvider),
            Rc::new(provider::syscall_prov::SyscallProvider),
            Rc::new(provider::profile::ProfileProvider),
            Rc::new(provider::rawtp::RawTpProvider),
            Rc::new(provider::cpc::CpcProvider),
            Rc::new(provider::proc::ProcProvider),
            Rc::new(provider::sched::SchedProvider),
            Rc::new(provider::uprobe::UprobeProvider),
        ];

        for op in ops {
            let n = op.populate(&mut stp).unwrap_or(0);
            debug!("provider {} populated {} probes", op.name(), n);
        }

        Ok(stp)
    }

    pub fn kernel_version(&self) -> u64 {
        self.kernel_version
    }

    #[cfg(test)]
    pub(crate) fn set_kernel_version(&mut self, v: u64) {
        self.kernel_version = v;
    }

    /// Register a provider (or return the existing one of that name).
    pub fn provider_create(
        &mut self,
        name: &str,
        flags: u32,
        ops: Rc<dyn ProviderOps>,
    ) -> usize {
        if let Some(&idx) = self.providers_by_name.get(name) {
            return idx;
        }
        let idx = self.providers.len();
        self.providers.push(Provider {
            name: name.to_string(),
            flags,
            ops,
        });
        self.providers_by_name.insert(name.to_string(), idx);
        idx
    }

    pub fn provider_lookup(&self, name: &str) -> Option<usize> {
        self.providers_by_name.get(name).copied()
    }

    pub fn provider(&self, idx: usize) -> Option<&Provider> {
        self.providers.get(idx)
    }

    pub fn provider_mark_pid(&mut self, idx: usize) {
        if let Some(p) = self.providers.get_mut(idx) {
            p.flags |= provider::PROV_PID;
        }
    }

    fn ops_for_probe(&self, id: ProbeId) -> Option<Rc<dyn ProviderOps>> {
        let prov = self.registry.get(id)?.prov;
        Some(Rc::clone(&self.providers.get(prov)?.ops))
    }

    /// Insert a probe owned by the given provider.
    pub fn probe_insert(&mut self, prov: usize, desc: ProbeDesc, data: ProbeData) -> ProbeId {
        self.registry.insert(desc, prov, data)
    }

    /// Attach an externally compiled clause to a probe.
    pub fn add_clause(&mut self, id: ProbeId, clause: Clause) {
        self.registry.add_clause(id, clause);
    }

    /// Enable every probe matching a description, materializing
    /// parametric probes through the providers' `provide` hooks when
    /// nothing matched at populate time.
    pub fn enable(&mut self, desc: &ProbeDesc) -> Result<Vec<ProbeId>> {
        let mut ids = self.registry.iter_matches(desc);

        if ids.is_empty() {
            let all_ops: Vec<Rc<dyn ProviderOps>> = self
                .providers
                .iter()
                .map(|p| Rc::clone(&p.ops))
                .collect();
            for ops in all_ops {
                let _ = ops.provide(self, desc);
            }
            ids = self.registry.iter_matches(desc);
        }

        if ids.is_empty() {
            return Err(Error::NoProbe(desc.fqn()));
        }

        for &id in &ids {
            self.enable_probe(id);
        }
        Ok(ids)
    }

    /// Enable one probe through its provider.
    pub fn enable_probe(&mut self, id: ProbeId) {
        if let Some(ops) = self.ops_for_probe(id) {
            ops.enable(self, id);
        }
    }

    /// The default enable: mark wanted and join the enabling list.
    pub fn enable_probe_default(&mut self, id: ProbeId) {
        if let Some(p) = self.registry.get_mut(id) {
            p.enabled = true;
        }
        if !self.enablings.contains(&id) {
            self.enablings.push(id);
        }
    }

    pub fn enablings(&self) -> &[ProbeId] {
        &self.enablings
    }

    /// Build the complete trampoline program for one enabled probe:
    /// the provider's marshalling code around the attached clauses.
    pub fn build_program(&self, id: ProbeId) -> Result<Program> {
        let ops = self
            .ops_for_probe(id)
            .ok_or_else(|| Error::NoProbe(format!("probe {}", id)))?;
        let mut tb = TrampolineBuilder::new(id as u32);
        ops.trampoline(self, id, &mut tb)?;
        Ok(tb.epilogue())
    }

    /// Emit the calls to a probe's own clauses and then to each
    /// dependent's (with the underlying arguments saved around the
    /// dependent's rewriting).  Providers call this at the tail of their
    /// trampolines.
    pub fn emit_clauses_and_deps(
        &self,
        id: ProbeId,
        tb: &mut TrampolineBuilder,
    ) -> Result<()> {
        let probe = self
            .registry
            .get(id)
            .ok_or_else(|| Error::NoProbe(format!("probe {}", id)))?;

        let mut emitted = false;
        if !probe.clauses.is_empty() {
            tb.call_clauses(&probe.clauses)?;
            emitted = true;
        }

        for &dep in &probe.dependents {
            let dprobe = match self.registry.get(dep) {
                Some(d) if d.enabled => d,
                _ => continue,
            };
            if dprobe.clauses.is_empty() {
                continue;
            }
            let dops = self
                .ops_for_probe(dep)
                .ok_or_else(|| Error::NoProbe(format!("probe {}", dep)))?;

            tb.save_args(crate::bpf::dctx::DMST_ARGC);
            tb.set_prid(dep as u32);
            dops.dep_trampoline(self, dep, tb)?;
            tb.call_clauses(&dprobe.clauses)?;
            tb.restore_args(crate::bpf::dctx::DMST_ARGC);
            emitted = true;
        }

        if !emitted {
            return Err(Error::Unresolved(format!(
                "probe {} has no clauses to call",
                probe.desc
            )));
        }
        Ok(())
    }

    /// Arm every enabled, attachable probe: build its trampoline, load
    /// the program, attach.  An emitter or verifier failure leaves that
    /// probe unenabled without affecting the others.
    pub fn attach_all(&mut self) -> Result<usize> {
        let ids: Vec<ProbeId> = self.enablings.clone();
        let mut armed = 0;
        for id in ids {
            let ops = match self.ops_for_probe(id) {
                Some(ops) if ops.attachable() => ops,
                _ => continue,
            };

            let prog = match self.build_program(id) {
                Ok(p) => p,
                Err(e) => {
                    debug!("probe {}: trampoline failed: {}", id, e);
                    if let Some(p) = self.registry.get_mut(id) {
                        p.enabled = false;
                    }
                    continue;
                }
            };
            let fd = match ops.load_prog(&prog) {
                Ok(fd) => fd,
                Err(e) => {
                    debug!("probe {}: program load failed: {}", id, e);
                    if let Some(p) = self.registry.get_mut(id) {
                        p.enabled = false;
                    }
                    continue;
                }
            };
            if let Some(p) = self.registry.get_mut(id) {
                p.bpf_fd = Some(fd);
            }
            match ops.attach(self, id, fd) {
                Ok(()) => armed += 1,
                Err(e) => {
                    debug!("probe {}: attach failed: {}", id, e);
                    if let Some(p) = self.registry.get_mut(id) {
                        p.enabled = false;
                        p.bpf_fd = None;
                    }
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
        }
        Ok(armed)
    }

    /// Reverse of [`Session::attach_all`], in reverse order.
    pub fn detach_all(&mut self) {
        let ids: Vec<ProbeId> = self.enablings.iter().rev().copied().collect();
        for id in ids {
            if let Some(ops) = self.ops_for_probe(id) {
                ops.detach(self, id);
            }
            if let Some(p) = self.registry.get_mut(id) {
                if let Some(fd) = p.bpf_fd.take() {
                    unsafe {
                        libc::close(fd);
                    }
                }
                p.enabled = false;
            }
        }
        self.enablings.clear();
    }

    /// Argument descriptors for a probe, provider-computed and cached.
    pub fn probe_info(&mut self, id: ProbeId) -> Result<Vec<ArgDesc>> {
        if let Some(p) = self.registry.get(id) {
            if let Some(args) = &p.argdesc {
                return Ok(args.clone());
            }
        }
        let ops = self
            .ops_for_probe(id)
            .ok_or_else(|| Error::NoProbe(format!("probe {}", id)))?;
        let args = ops.probe_info(self, id)?;
        if let Some(p) = self.registry.get_mut(id) {
            p.argdesc = Some(args.clone());
        }
        Ok(args)
    }

    /// Route a pid/USDT probe request to the pid-capable providers.
    pub fn provide_pid(&mut self, psp: &provider::uprobe::PidProbeSpec) -> Result<usize> {
        let all_ops: Vec<Rc<dyn ProviderOps>> = self
            .providers
            .iter()
            .map(|p| Rc::clone(&p.ops))
            .collect();
        let mut n = 0;
        for ops in all_ops {
            if let Ok(c) = ops.provide_pid(self, psp) {
                n += c;
            }
        }
        if n == 0 {
            return Err(Error::NoProbe(format!(
                "{}:{}:{}:{}",
                psp.prv, psp.module, psp.function, psp.name
            )));
        }
        Ok(n)
    }

    /// Tear the session down: detach everything, then let each provider
    /// dispose of its probes' private data.  After this, no probes or
    /// provider allocations remain.
    pub fn close(&mut self) {
        self.detach_all();

        let ids: Vec<ProbeId> = self.registry.iter_ids().collect();
        for id in ids {
            let ops = self.ops_for_probe(id);
            if let Some(probe) = self.registry.delete(id) {
                if let Some(ops) = ops {
                    ops.destroy(probe.data);
                }
            }
        }
        self.providers.clear();
        self.providers_by_name.clear();
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeData;

    struct NullProvider;

    impl ProviderOps for NullProvider {
        fn name(&self) -> &'static str {
            "null"
        }

        fn populate(&self, stp: &mut Session) -> Result<usize> {
            let prov = stp.provider_create("null", 0, Rc::new(NullProvider));
            stp.probe_insert(
                prov,
                ProbeDesc::new("null", "mod", "fun", "one"),
                ProbeData::None,
            );
            stp.probe_insert(
                prov,
                ProbeDesc::new("null", "mod", "fun", "two"),
                ProbeData::None,
            );
            Ok(2)
        }

        fn trampoline(
            &self,
            stp: &Session,
            prp: ProbeId,
            tb: &mut TrampolineBuilder,
        ) -> Result<()> {
            tb.prologue();
            stp.emit_clauses_and_deps(prp, tb)
        }

        fn attach(&self, _stp: &mut Session, _prp: ProbeId, _fd: i32) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn enable_matches_and_marks() {
        let mut stp = Session::new();
        NullProvider.populate(&mut stp).unwrap();

        let ids = stp.enable(&ProbeDesc::parse("null:mod:fun:*")).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(stp.enablings().len(), 2);
        for id in ids {
            assert!(stp.registry.get(id).unwrap().enabled);
        }

        assert!(stp.enable(&ProbeDesc::parse("null:mod:fun:three")).is_err());
    }

    #[test]
    fn programs_need_clauses() {
        let mut stp = Session::new();
        NullProvider.populate(&mut stp).unwrap();
        let id = stp
            .registry
            .lookup(&ProbeDesc::new("null", "mod", "fun", "one"))
            .unwrap();

        assert!(stp.build_program(id).is_err());

        stp.add_clause(
            id,
            Clause {
                func_id: 11,
                pred_id: None,
            },
        );
        let prog = stp.build_program(id).unwrap();
        assert_eq!(prog.relocs.len(), 1);
        assert_eq!(prog.relocs[0].func_id, 11);
    }

    #[test]
    fn close_leaves_nothing_behind() {
        let mut stp = Session::new();
        NullProvider.populate(&mut stp).unwrap();
        assert!(!stp.registry.is_empty());
        stp.close();
        assert!(stp.registry.is_empty());
        assert!(stp.provider_lookup("null").is_none());
    }
}
