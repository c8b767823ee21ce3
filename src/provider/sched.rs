//! The `sched` provider: scheduler probes mounted on raw tracepoints.

use std::rc::Rc;

use crate::bpf::{ProgType, TrampolineBuilder};
use crate::error::Result;
use crate::probe::{ArgDesc, ProbeId};
use crate::provider::sdt::{sdt_enable, sdt_populate, sdt_probe_info, ProbeArg, ProbeDep};
use crate::provider::ProviderOps;
use crate::session::Session;

pub(crate) const PROV_NAME: &str = "sched";
const MOD_NAME: &str = "vmlinux";

const PROBES: &[ProbeDep] = &[
    ProbeDep {
        name: "off-cpu",
        spec: "rawtp:sched::sched_switch",
        kver_min: 0,
        kver_max: 0,
    },
    ProbeDep {
        name: "on-cpu",
        spec: "rawtp:sched::sched_switch",
        kver_min: 0,
        kver_max: 0,
    },
    ProbeDep {
        name: "wakeup",
        spec: "rawtp:sched::sched_wakeup",
        kver_min: 0,
        kver_max: 0,
    },
    ProbeDep {
        name: "enqueue",
        spec: "rawtp:sched::sched_wakeup",
        kver_min: 0,
        kver_max: 0,
    },
    ProbeDep {
        name: "dequeue",
        spec: "rawtp:sched::sched_wakeup_new",
        kver_min: 0,
        kver_max: 0,
    },
    ProbeDep {
        name: "surrender",
        spec: "syscall:vmlinux:sched_yield:entry",
        kver_min: 0,
        kver_max: 0,
    },
];

const PROBE_ARGS: &[ProbeArg] = &[
    ProbeArg {
        name: "off-cpu",
        argno: 0,
        native: Some("struct task_struct *"),
        xlate: Some("lwpsinfo_t *"),
        mapping: 0,
    },
    ProbeArg {
        name: "on-cpu",
        argno: 0,
        native: None,
        xlate: None,
        mapping: 0,
    },
    ProbeArg {
        name: "wakeup",
        argno: 0,
        native: Some("struct task_struct *"),
        xlate: Some("lwpsinfo_t *"),
        mapping: 0,
    },
    ProbeArg {
        name: "enqueue",
        argno: 0,
        native: Some("struct task_struct *"),
        xlate: Some("lwpsinfo_t *"),
        mapping: 0,
    },
    ProbeArg {
        name: "dequeue",
        argno: 0,
        native: Some("struct task_struct *"),
        xlate: Some("lwpsinfo_t *"),
        mapping: 0,
    },
    ProbeArg {
        name: "surrender",
        argno: 0,
        native: None,
        xlate: None,
        mapping: 0,
    },
];

pub struct SchedProvider;

impl ProviderOps for SchedProvider {
    fn name(&self) -> &'static str {
        PROV_NAME
    }

    fn prog_type(&self) -> ProgType {
        ProgType::RawTracepoint
    }

    fn populate(&self, stp: &mut Session) -> Result<usize> {
        let prov = stp.provider_create(PROV_NAME, 0, Rc::new(SchedProvider));
        Ok(sdt_populate(stp, prov, PROV_NAME, MOD_NAME, PROBE_ARGS))
    }

    fn enable(&self, stp: &mut Session, prp: ProbeId) {
        sdt_enable(stp, prp, PROBES);
    }

    fn attachable(&self) -> bool {
        false
    }

    fn trampoline(
        &self,
        _stp: &Session,
        _prp: ProbeId,
        _tb: &mut TrampolineBuilder,
    ) -> Result<()> {
        Ok(())
    }

    /// `sched_switch(preempt, prev, next)`: off-cpu advertises the
    /// incoming task, on-cpu fires with no arguments of its own.
    fn dep_trampoline(
        &self,
        stp: &Session,
        prp: ProbeId,
        tb: &mut TrampolineBuilder,
    ) -> Result<()> {
        let name = stp
            .registry
            .get(prp)
            .map(|p| p.desc.name.clone())
            .unwrap_or_default();

        if name == "off-cpu" {
            tb.swap_args(0, 2);
        }
        Ok(())
    }

    fn attach(&self, _stp: &mut Session, _prp: ProbeId, _bpf_fd: i32) -> Result<()> {
        Ok(())
    }

    fn probe_info(&self, stp: &mut Session, prp: ProbeId) -> Result<Vec<ArgDesc>> {
        sdt_probe_info(stp, prp, PROBE_ARGS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::TrampolineBuilder;
    use crate::probe::{ProbeData, ProbeDesc, ProbeId, TpProbe};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct StubUnderlier;

    impl ProviderOps for StubUnderlier {
        fn name(&self) -> &'static str {
            "rawtp-stub"
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
            tb.prologue();
            stp.emit_clauses_and_deps(prp, tb)
        }
        fn attach(&self, _stp: &mut Session, _prp: ProbeId, _fd: i32) -> Result<()> {
            Ok(())
        }
    }

    fn session_with_underliers() -> Session {
        let mut stp = Session::new();
        SchedProvider.populate(&mut stp).unwrap();
        let prov = stp.provider_create("rawtp-stub", 0, Rc::new(StubUnderlier));
        for event in &["sched_switch", "sched_wakeup", "sched_wakeup_new"] {
            stp.probe_insert(
                prov,
                ProbeDesc::new("rawtp", "sched", "", event),
                ProbeData::Tp(RefCell::new(TpProbe::default())),
            );
        }
        stp
    }

    fn probe(stp: &Session, name: &str) -> ProbeId {
        stp.registry
            .lookup(&ProbeDesc::new(PROV_NAME, MOD_NAME, "", name))
            .expect("probe missing")
    }

    fn underlier(stp: &Session, event: &str) -> ProbeId {
        stp.registry
            .lookup(&ProbeDesc::new("rawtp", "sched", "", event))
            .expect("underlier missing")
    }

    #[test]
    fn context_switch_probes_share_sched_switch() {
        let mut stp = session_with_underliers();
        let off_cpu = probe(&stp, "off-cpu");
        let on_cpu = probe(&stp, "on-cpu");

        stp.enable_probe(off_cpu);
        stp.enable_probe(on_cpu);

        let switch = underlier(&stp, "sched_switch");
        assert!(stp.registry.get(switch).unwrap().enabled);
        assert_eq!(
            stp.registry.get(switch).unwrap().dependents,
            vec![off_cpu, on_cpu]
        );

        // The wakeup tracepoints were not dragged along.
        let wakeup = underlier(&stp, "sched_wakeup");
        assert!(!stp.registry.get(wakeup).unwrap().enabled);
        assert!(stp.registry.get(wakeup).unwrap().dependents.is_empty());
    }

    #[test]
    fn only_off_cpu_rewrites_the_switch_arguments() {
        let stp = session_with_underliers();

        // sched_switch(preempt, prev, next): off-cpu presents the
        // incoming task, so it exchanges argv[0] and argv[2].
        let mut tb = TrampolineBuilder::new(0);
        SchedProvider
            .dep_trampoline(&stp, probe(&stp, "off-cpu"), &mut tb)
            .unwrap();
        assert_eq!(tb.list.len(), 4);

        // on-cpu fires with the underlying shape untouched.
        let mut tb = TrampolineBuilder::new(0);
        SchedProvider
            .dep_trampoline(&stp, probe(&stp, "on-cpu"), &mut tb)
            .unwrap();
        assert!(tb.list.is_empty());
    }
}
