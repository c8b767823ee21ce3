//! Support for statically-defined-tracing providers whose probes are
//! "mounted" on probes from other providers.
//!
//! An SDT probe never fires directly.  Its dependency table names one or
//! more underlying probe specifications (possibly globbed, possibly
//! fenced to a kernel version range); enabling the SDT probe resolves
//! the table against the registry, enables each matching underlying
//! probe, and registers the SDT probe as its dependent.  The underlying
//! probe's trampoline then runs the dependent's argument synthesis and
//! clauses after its own, with the underlying arguments saved around it.

use log::debug;

use crate::error::Result;
use crate::probe::{ArgDesc, ProbeData, ProbeDesc, ProbeId};
use crate::session::Session;

/// One dependency of an SDT probe.  Kernel version bounds are encoded
/// with [`crate::session::kernel_version`]; zero means unbounded.
pub struct ProbeDep {
    pub name: &'static str,
    pub spec: &'static str,
    pub kver_min: u64,
    pub kver_max: u64,
}

/// One argument of an SDT probe.  Rows for one probe must be
/// consecutive; a probe with a single row whose `native` is `None`
/// advertises no arguments.
pub struct ProbeArg {
    pub name: &'static str,
    pub argno: usize,
    pub native: Option<&'static str>,
    pub xlate: Option<&'static str>,
    pub mapping: u8,
}

/// Create the provider's probes from its argument table: each distinct
/// `argno == 0` row names one probe.
pub fn sdt_populate(
    stp: &mut Session,
    prov: usize,
    prvname: &str,
    modname: &str,
    probe_args: &[ProbeArg],
) -> usize {
    let mut n = 0;
    for arg in probe_args {
        if arg.argno == 0 {
            stp.probe_insert(
                prov,
                ProbeDesc::new(prvname, modname, "", arg.name),
                ProbeData::None,
            );
            n += 1;
        }
    }
    n
}

/// Enable an SDT probe: resolve its dependency table and mount it on
/// every matching underlying probe that fits the running kernel.
pub fn sdt_enable(stp: &mut Session, prp: ProbeId, deps: &[ProbeDep]) {
    let prb_name = match stp.registry.get(prp) {
        Some(p) => p.desc.name.clone(),
        None => return,
    };

    for dep in deps {
        if dep.name != prb_name {
            continue;
        }
        if dep.kver_min != 0 && stp.kernel_version() < dep.kver_min {
            continue;
        }
        if dep.kver_max != 0 && stp.kernel_version() > dep.kver_max {
            continue;
        }

        let pd = ProbeDesc::parse(dep.spec);
        for under in stp.registry.iter_matches(&pd) {
            debug!(
                "sdt: {} mounted on underlying probe {}",
                prb_name, under
            );
            stp.registry.add_dependent(under, prp);
            stp.enable_probe(under);
        }
    }

    stp.enable_probe_default(prp);
}

/// Argument descriptors for an SDT probe, from its argument table.
pub fn sdt_probe_info(
    stp: &Session,
    prp: ProbeId,
    probe_args: &[ProbeArg],
) -> Result<Vec<ArgDesc>> {
    let prb_name = match stp.registry.get(prp) {
        Some(p) => p.desc.name.clone(),
        None => return Ok(Vec::new()),
    };

    let mut args: Vec<ArgDesc> = Vec::new();
    for arg in probe_args {
        if arg.name != prb_name {
            continue;
        }
        if arg.argno == 0 && arg.native.is_none() {
            break; // advertises no arguments
        }
        if args.len() <= arg.argno {
            args.resize(arg.argno + 1, ArgDesc::default());
        }
        args[arg.argno] = ArgDesc {
            native: arg.native.map(|s| s.to_string()),
            xlate: arg.xlate.map(|s| s.to_string()),
            mapping: arg.mapping,
        };
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::TrampolineBuilder;
    use crate::error::Result;
    use crate::probe::TpProbe;
    use crate::provider::ProviderOps;
    use crate::session::kernel_version;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct UnderProvider;

    impl ProviderOps for UnderProvider {
        fn name(&self) -> &'static str {
            "under"
        }
        fn populate(&self, stp: &mut Session) -> Result<usize> {
            let prov = stp.provider_create("under", 0, Rc::new(UnderProvider));
            stp.probe_insert(
                prov,
                ProbeDesc::new("under", "sched", "", "sched_process_fork"),
                ProbeData::Tp(RefCell::new(TpProbe::default())),
            );
            stp.probe_insert(
                prov,
                ProbeDesc::new("under", "sched", "", "sched_process_exec"),
                ProbeData::Tp(RefCell::new(TpProbe::default())),
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

    const DEPS: &[ProbeDep] = &[
        ProbeDep {
            name: "create",
            spec: "under:sched::sched_process_fork",
            kver_min: 0,
            kver_max: 0,
        },
        ProbeDep {
            name: "future",
            spec: "under:sched::sched_process_exec",
            kver_min: u64::MAX,
            kver_max: 0,
        },
    ];

    #[test]
    fn enabling_mounts_dependents_and_only_those() {
        let mut stp = Session::new();
        UnderProvider.populate(&mut stp).unwrap();
        let prov = stp.provider_lookup("under").unwrap();
        let create = stp.probe_insert(
            prov,
            ProbeDesc::new("proc", "", "", "create"),
            ProbeData::None,
        );
        let future = stp.probe_insert(
            prov,
            ProbeDesc::new("proc", "", "", "future"),
            ProbeData::None,
        );

        stp.set_kernel_version(kernel_version(5, 15, 0));
        sdt_enable(&mut stp, create, DEPS);
        sdt_enable(&mut stp, future, DEPS);

        let fork = stp
            .registry
            .lookup(&ProbeDesc::new("under", "sched", "", "sched_process_fork"))
            .unwrap();
        let exec = stp
            .registry
            .lookup(&ProbeDesc::new("under", "sched", "", "sched_process_exec"))
            .unwrap();

        // "create" mounted on fork; "future"'s kernel fence kept it off
        // exec.
        assert_eq!(stp.registry.get(fork).unwrap().dependents, vec![create]);
        assert!(stp.registry.get(fork).unwrap().enabled);
        assert!(stp.registry.get(exec).unwrap().dependents.is_empty());
        assert!(!stp.registry.get(exec).unwrap().enabled);
    }

    #[test]
    fn dependent_clauses_ride_the_underlying_program() {
        let mut stp = Session::new();
        UnderProvider.populate(&mut stp).unwrap();
        let prov = stp.provider_lookup("under").unwrap();
        let create = stp.probe_insert(
            prov,
            ProbeDesc::new("proc", "", "", "create"),
            ProbeData::None,
        );

        sdt_enable(&mut stp, create, DEPS);
        stp.add_clause(
            create,
            crate::bpf::Clause {
                func_id: 55,
                pred_id: None,
            },
        );

        let fork = stp
            .registry
            .lookup(&ProbeDesc::new("under", "sched", "", "sched_process_fork"))
            .unwrap();
        let prog = stp.build_program(fork).unwrap();
        assert_eq!(prog.relocs.len(), 1);
        assert_eq!(prog.relocs[0].func_id, 55);
    }
}
