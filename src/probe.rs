//! The probe registry: every probe, indexed five ways (by provider,
//! module, function and probe name, and by fully-qualified name), with
//! its argument descriptors, attached clauses, and dependent links.

use log::debug;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::bpf::Clause;
use crate::provider::uprobe::UprobeData;

/// A fully qualified probe description.  Empty components are wildcards
/// in lookups that allow them.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct ProbeDesc {
    pub provider: String,
    pub module: String,
    pub function: String,
    pub name: String,
}

impl ProbeDesc {
    pub fn new(provider: &str, module: &str, function: &str, name: &str) -> ProbeDesc {
        ProbeDesc {
            provider: provider.to_string(),
            module: module.to_string(),
            function: function.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse `provider:module:function:name`.  Missing leading components
    /// are empty.
    pub fn parse(spec: &str) -> ProbeDesc {
        let mut parts: Vec<&str> = spec.split(':').collect();
        while parts.len() < 4 {
            parts.insert(0, "");
        }
        ProbeDesc::new(parts[0], parts[1], parts[2], parts[3])
    }

    pub fn fqn(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.provider, self.module, self.function, self.name
        )
    }

    /// Glob-match against another description; empty components of
    /// `self` match anything.
    pub fn matches(&self, other: &ProbeDesc) -> bool {
        gmatch(&other.provider, &self.provider)
            && gmatch(&other.module, &self.module)
            && gmatch(&other.function, &self.function)
            && gmatch(&other.name, &self.name)
    }
}

impl std::fmt::Display for ProbeDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.fqn())
    }
}

/// One probe argument: native type, optional translated type, and the
/// mapping from translated argument index to native index.
#[derive(Clone, Debug, Default)]
pub struct ArgDesc {
    pub native: Option<String>,
    pub xlate: Option<String>,
    pub mapping: u8,
}

/// Provider-private probe state.
pub enum ProbeData {
    None,
    /// A tracepoint-backed probe: event id and perf fd once created.
    Tp(RefCell<TpProbe>),
    /// profile-n/tick-n timer state.
    Profile(RefCell<ProfileProbe>),
    /// CPU performance counter state.
    Cpc(RefCell<CpcProbe>),
    /// An underlying uprobe, shared by the pid/USDT probes riding it.
    Uprobe(Rc<RefCell<UprobeData>>),
    /// A pid/USDT probe: the underlying uprobe probes that fire it.
    PidList(RefCell<Vec<ProbeId>>),
}

/// Tracepoint-specific probe state (also used for kprobes and uprobes,
/// which become tracepoints once registered).
#[derive(Default)]
pub struct TpProbe {
    pub event_id: Option<u32>,
    pub event_fd: Option<RawFd>,
    /// We wrote the kprobe/uprobe_events line, so we remove it.
    pub created: bool,
}

pub struct ProfileProbe {
    pub kind: ProfileKind,
    pub period_ns: u64,
    pub fds: Vec<RawFd>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProfileKind {
    /// Fires on every CPU.
    Profile,
    /// Fires on one CPU.
    Tick,
}

pub struct CpcProbe {
    pub config: u64,
    pub count: u64,
    pub fds: Vec<RawFd>,
}

pub type ProbeId = usize;

pub struct Probe {
    pub id: ProbeId,
    pub desc: ProbeDesc,
    /// Index of the owning provider in the session's provider table.
    pub prov: usize,
    pub data: ProbeData,
    /// Compiled clauses attached to this probe.
    pub clauses: Vec<Clause>,
    /// Probes mounted on this one: enabling us enables them, and our
    /// trampoline runs theirs after saving the underlying args.
    pub dependents: Vec<ProbeId>,
    pub enabled: bool,
    /// The loaded program attached for this probe, when armed.
    pub bpf_fd: Option<RawFd>,
    pub argdesc: Option<Vec<ArgDesc>>,
}

/// The five-way probe index plus id allocation.
#[derive(Default)]
pub struct ProbeRegistry {
    probes: Vec<Option<Probe>>,
    by_fqn: HashMap<String, ProbeId>,
    by_prv: HashMap<String, Vec<ProbeId>>,
    by_mod: HashMap<String, Vec<ProbeId>>,
    by_fun: HashMap<String, Vec<ProbeId>>,
    by_prb: HashMap<String, Vec<ProbeId>>,
}

impl ProbeRegistry {
    pub fn new() -> ProbeRegistry {
        ProbeRegistry::default()
    }

    pub fn len(&self) -> usize {
        self.by_fqn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fqn.is_empty()
    }

    /// Insert a new probe.  A probe is in all five indexes or in none.
    pub fn insert(&mut self, desc: ProbeDesc, prov: usize, data: ProbeData) -> ProbeId {
        if let Some(&id) = self.by_fqn.get(&desc.fqn()) {
            return id;
        }

        let id = self.probes.len();
        self.by_fqn.insert(desc.fqn(), id);
        self.by_prv.entry(desc.provider.clone()).or_default().push(id);
        self.by_mod.entry(desc.module.clone()).or_default().push(id);
        self.by_fun.entry(desc.function.clone()).or_default().push(id);
        self.by_prb.entry(desc.name.clone()).or_default().push(id);

        self.probes.push(Some(Probe {
            id,
            desc,
            prov,
            data,
            clauses: Vec::new(),
            dependents: Vec::new(),
            enabled: false,
            bpf_fd: None,
            argdesc: None,
        }));
        id
    }

    pub fn get(&self, id: ProbeId) -> Option<&Probe> {
        self.probes.get(id).and_then(|p| p.as_ref())
    }

    pub fn get_mut(&mut self, id: ProbeId) -> Option<&mut Probe> {
        self.probes.get_mut(id).and_then(|p| p.as_mut())
    }

    /// Exact lookup by full description.
    pub fn lookup(&self, desc: &ProbeDesc) -> Option<ProbeId> {
        self.by_fqn.get(&desc.fqn()).copied()
    }

    pub fn lookup_by_name(&self, fqn: &str) -> Option<ProbeId> {
        self.by_fqn.get(fqn).copied()
    }

    /// Remove a probe from all indexes.  Returns its carcass so the
    /// provider can dispose of the private data.
    pub fn delete(&mut self, id: ProbeId) -> Option<Probe> {
        let probe = self.probes.get_mut(id)?.take()?;
        self.by_fqn.remove(&probe.desc.fqn());
        if let Some(v) = self.by_prv.get_mut(&probe.desc.provider) {
            v.retain(|&pid| pid != id);
        }
        if let Some(v) = self.by_mod.get_mut(&probe.desc.module) {
            v.retain(|&pid| pid != id);
        }
        if let Some(v) = self.by_fun.get_mut(&probe.desc.function) {
            v.retain(|&pid| pid != id);
        }
        if let Some(v) = self.by_prb.get_mut(&probe.desc.name) {
            v.retain(|&pid| pid != id);
        }
        Some(probe)
    }

    /// Walk the probes matching a (possibly globbed, possibly partial)
    /// description, narrowing through the cheapest index first.
    pub fn iter_matches(&self, desc: &ProbeDesc) -> Vec<ProbeId> {
        // An exact, glob-free description hits the fqn index directly.
        if !desc.provider.is_empty()
            && !has_glob(&desc.provider)
            && !has_glob(&desc.module)
            && !has_glob(&desc.function)
            && !has_glob(&desc.name)
            && !desc.module.is_empty()
            && !desc.function.is_empty()
            && !desc.name.is_empty()
        {
            return self.lookup(desc).into_iter().collect();
        }

        // Narrow by any exact component.
        let candidates: Vec<ProbeId> = if !desc.name.is_empty() && !has_glob(&desc.name) {
            self.by_prb.get(&desc.name).cloned().unwrap_or_default()
        } else if !desc.function.is_empty() && !has_glob(&desc.function) {
            self.by_fun.get(&desc.function).cloned().unwrap_or_default()
        } else if !desc.provider.is_empty() && !has_glob(&desc.provider) {
            self.by_prv.get(&desc.provider).cloned().unwrap_or_default()
        } else {
            (0..self.probes.len()).collect()
        };

        candidates
            .into_iter()
            .filter(|&id| {
                self.get(id)
                    .map(|p| desc.matches(&p.desc))
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = ProbeId> + '_ {
        self.probes
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_some())
            .map(|(i, _)| i)
    }

    pub fn add_clause(&mut self, id: ProbeId, clause: Clause) {
        if let Some(p) = self.get_mut(id) {
            p.clauses.push(clause);
        }
    }

    /// Register `dep` as a dependent of `under`: enabling `under` arms
    /// `dep`'s clauses on `under`'s firings.
    pub fn add_dependent(&mut self, under: ProbeId, dep: ProbeId) {
        if let Some(p) = self.get_mut(under) {
            if !p.dependents.contains(&dep) {
                p.dependents.push(dep);
                debug!(
                    "probe {} gains dependent {}",
                    under, dep
                );
            }
        }
    }
}

fn has_glob(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

/// Shell-style glob match (`*`, `?`, `[...]` with `!` negation).  An
/// empty pattern matches anything.
pub fn gmatch(s: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    gmatch_bytes(s.as_bytes(), pattern.as_bytes())
}

fn gmatch_bytes(mut s: &[u8], mut p: &[u8]) -> bool {
    loop {
        match p.first() {
            None => return s.is_empty(),
            Some(b'*') => {
                // Collapse runs of stars, then try every split point.
                while p.first() == Some(&b'*') {
                    p = &p[1..];
                }
                if p.is_empty() {
                    return true;
                }
                for i in 0..=s.len() {
                    if gmatch_bytes(&s[i..], p) {
                        return true;
                    }
                }
                return false;
            }
            Some(b'?') => {
                if s.is_empty() {
                    return false;
                }
                s = &s[1..];
                p = &p[1..];
            }
            Some(b'[') => {
                let c = match s.first() {
                    Some(&c) => c,
                    None => return false,
                };
                let negate = p.get(1) == Some(&b'!');
                let body = if negate { 2 } else { 1 };
                // A ']' in first position is a class member, not the
                // closing bracket.
                let close = match p
                    .iter()
                    .enumerate()
                    .skip(body + 1)
                    .find(|&(_, &b)| b == b']')
                {
                    Some((idx, _)) => idx,
                    // Unterminated class: match a literal '['.
                    None => {
                        if c != b'[' {
                            return false;
                        }
                        s = &s[1..];
                        p = &p[1..];
                        continue;
                    }
                };
                let class = &p[body..close];

                let mut hit = false;
                let mut i = 0;
                while i < class.len() {
                    if i + 2 < class.len() && class[i + 1] == b'-' {
                        if class[i] <= c && c <= class[i + 2] {
                            hit = true;
                        }
                        i += 3;
                    } else {
                        if class[i] == c {
                            hit = true;
                        }
                        i += 1;
                    }
                }
                if hit == negate {
                    return false;
                }
                s = &s[1..];
                p = &p[close + 1..];
            }
            Some(&c) => {
                if s.first() != Some(&c) {
                    return false;
                }
                s = &s[1..];
                p = &p[1..];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_basics() {
        assert!(gmatch("vfs_read", "vfs_*"));
        assert!(gmatch("vfs_read", "*"));
        assert!(gmatch("vfs_read", ""));
        assert!(gmatch("vfs_read", "vfs_rea?"));
        assert!(!gmatch("vfs_read", "vfs_rea"));
        assert!(gmatch("tick-5s", "tick-[0-9]s"));
        assert!(!gmatch("tick-Xs", "tick-[0-9]s"));
        assert!(gmatch("a", "[!b]"));
        assert!(!gmatch("b", "[!b]"));
    }

    fn registry_with(descs: &[(&str, &str, &str, &str)]) -> ProbeRegistry {
        let mut reg = ProbeRegistry::new();
        for d in descs {
            reg.insert(ProbeDesc::new(d.0, d.1, d.2, d.3), 0, ProbeData::None);
        }
        reg
    }

    #[test]
    fn five_way_indexing() {
        let mut reg = registry_with(&[
            ("fbt", "vmlinux", "vfs_read", "entry"),
            ("fbt", "vmlinux", "vfs_read", "return"),
            ("fbt", "vmlinux", "vfs_write", "entry"),
            ("syscall", "vmlinux", "read", "entry"),
        ]);

        let exact = ProbeDesc::new("fbt", "vmlinux", "vfs_read", "entry");
        let id = reg.lookup(&exact).expect("exact lookup failed");
        assert_eq!(reg.get(id).unwrap().desc.name, "entry");

        // Globbed iteration.
        let hits = reg.iter_matches(&ProbeDesc::new("fbt", "", "vfs_*", "entry"));
        assert_eq!(hits.len(), 2);

        // Deleting removes from every index.
        reg.delete(id);
        assert!(reg.lookup(&exact).is_none());
        let hits = reg.iter_matches(&ProbeDesc::new("", "", "vfs_read", ""));
        assert_eq!(hits.len(), 1); // only the return probe remains
    }

    #[test]
    fn reinsert_is_idempotent() {
        let mut reg = registry_with(&[("fbt", "vmlinux", "vfs_read", "entry")]);
        let n = reg.len();
        reg.insert(
            ProbeDesc::new("fbt", "vmlinux", "vfs_read", "entry"),
            0,
            ProbeData::None,
        );
        assert_eq!(reg.len(), n);
    }

    #[test]
    fn dependents_accumulate_once() {
        let mut reg = registry_with(&[
            ("rawtp", "sched", "", "sched_process_fork"),
            ("proc", "", "", "create"),
        ]);
        reg.add_dependent(0, 1);
        reg.add_dependent(0, 1);
        assert_eq!(reg.get(0).unwrap().dependents, vec![1]);
    }
}
