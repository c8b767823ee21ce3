//! The `proc` provider: process lifecycle probes mounted on raw
//! tracepoints and syscall probes.

use std::rc::Rc;

use crate::bpf::{ProgType, TrampolineBuilder};
use crate::error::Result;
use crate::probe::{ArgDesc, ProbeId};
use crate::provider::sdt::{sdt_enable, sdt_populate, sdt_probe_info, ProbeArg, ProbeDep};
use crate::provider::ProviderOps;
use crate::session::{kernel_version, Session};

pub(crate) const PROV_NAME: &str = "proc";
const MOD_NAME: &str = "";

const PROBES: &[ProbeDep] = &[
    ProbeDep {
        name: "create",
        spec: "rawtp:sched::sched_process_fork",
        kver_min: 0,
        kver_max: 0,
    },
    ProbeDep {
        name: "exec",
        spec: "syscall:vmlinux:execve:entry",
        kver_min: 0,
        kver_max: 0,
    },
    ProbeDep {
        name: "exec-success",
        spec: "rawtp:sched::sched_process_exec",
        // sched_process_exec grew its bprm argument in 3.4.
        kver_min: kernel_version(3, 4, 0),
        kver_max: 0,
    },
    ProbeDep {
        name: "exec-failure",
        spec: "syscall:vmlinux:execve:return",
        kver_min: 0,
        kver_max: 0,
    },
    ProbeDep {
        name: "exit",
        spec: "rawtp:sched::sched_process_exit",
        kver_min: 0,
        kver_max: 0,
    },
    ProbeDep {
        name: "start",
        spec: "rawtp:sched::sched_process_exec",
        kver_min: 0,
        kver_max: 0,
    },
    ProbeDep {
        name: "signal-send",
        spec: "rawtp:signal::signal_generate",
        kver_min: 0,
        kver_max: 0,
    },
    ProbeDep {
        name: "signal-handle",
        spec: "rawtp:signal::signal_deliver",
        kver_min: 0,
        kver_max: 0,
    },
];

const PROBE_ARGS: &[ProbeArg] = &[
    ProbeArg {
        name: "create",
        argno: 0,
        native: Some("struct task_struct *"),
        xlate: Some("psinfo_t *"),
        mapping: 0,
    },
    ProbeArg {
        name: "exec",
        argno: 0,
        native: Some("string"),
        xlate: None,
        mapping: 0,
    },
    ProbeArg {
        name: "exec-success",
        argno: 0,
        native: None,
        xlate: None,
        mapping: 0,
    },
    ProbeArg {
        name: "exec-failure",
        argno: 0,
        native: Some("int"),
        xlate: None,
        mapping: 0,
    },
    ProbeArg {
        name: "exit",
        argno: 0,
        native: Some("int"),
        xlate: None,
        mapping: 0,
    },
    ProbeArg {
        name: "start",
        argno: 0,
        native: None,
        xlate: None,
        mapping: 0,
    },
    ProbeArg {
        name: "signal-send",
        argno: 0,
        native: Some("struct task_struct *"),
        xlate: Some("psinfo_t *"),
        mapping: 1,
    },
    ProbeArg {
        name: "signal-send",
        argno: 1,
        native: Some("int"),
        xlate: None,
        mapping: 0,
    },
    ProbeArg {
        name: "signal-handle",
        argno: 0,
        native: Some("int"),
        xlate: None,
        mapping: 0,
    },
];

pub struct ProcProvider;

impl ProviderOps for ProcProvider {
    fn name(&self) -> &'static str {
        PROV_NAME
    }

    fn prog_type(&self) -> ProgType {
        ProgType::RawTracepoint
    }

    fn populate(&self, stp: &mut Session) -> Result<usize> {
        let prov = stp.provider_create(PROV_NAME, 0, Rc::new(ProcProvider));
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
        // Never attached directly; the dependent path below is the only
        // code this provider emits.
        Ok(())
    }

    /// Rearrange the underlying probe's arguments into this probe's
    /// shape.  The underlying values are still in argv when this runs.
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

        match name.as_str() {
            // signal_generate(sig, info, task, ...): probe wants
            // (task, sig).
            "signal-send" => {
                tb.swap_args(0, 2);
            }
            // sched_process_exit carries the task; the probe advertises
            // the exit code, which lives in the task and is fetched by
            // the clause through its argument mapping.
            _ => {}
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
    use crate::session::kernel_version;
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

    /// A session with this provider populated and stand-in probes for
    /// the raw tracepoints its dependency table names.
    fn session_with_underliers() -> Session {
        let mut stp = Session::new();
        ProcProvider.populate(&mut stp).unwrap();
        let prov = stp.provider_create("rawtp-stub", 0, Rc::new(StubUnderlier));
        for (module, event) in &[
            ("sched", "sched_process_fork"),
            ("sched", "sched_process_exec"),
            ("sched", "sched_process_exit"),
            ("signal", "signal_generate"),
        ] {
            stp.probe_insert(
                prov,
                ProbeDesc::new("rawtp", module, "", event),
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

    fn underlier(stp: &Session, module: &str, event: &str) -> ProbeId {
        stp.registry
            .lookup(&ProbeDesc::new("rawtp", module, "", event))
            .expect("underlier missing")
    }

    #[test]
    fn create_mounts_on_fork_and_only_fork() {
        let mut stp = session_with_underliers();
        let create = probe(&stp, "create");

        stp.enable_probe(create);

        let fork = underlier(&stp, "sched", "sched_process_fork");
        assert!(stp.registry.get(fork).unwrap().enabled);
        assert_eq!(stp.registry.get(fork).unwrap().dependents, vec![create]);

        for (module, event) in &[
            ("sched", "sched_process_exec"),
            ("sched", "sched_process_exit"),
            ("signal", "signal_generate"),
        ] {
            let id = underlier(&stp, module, event);
            assert!(!stp.registry.get(id).unwrap().enabled);
            assert!(stp.registry.get(id).unwrap().dependents.is_empty());
        }
    }

    #[test]
    fn exec_success_respects_its_kernel_fence() {
        let mut stp = session_with_underliers();
        let exec_success = probe(&stp, "exec-success");
        let under = underlier(&stp, "sched", "sched_process_exec");

        // Below the fence, sched_process_exec lacks the bprm argument:
        // the dependency must not mount.
        stp.set_kernel_version(kernel_version(3, 2, 0));
        stp.enable_probe(exec_success);
        assert!(stp.registry.get(under).unwrap().dependents.is_empty());
        assert!(!stp.registry.get(under).unwrap().enabled);

        stp.set_kernel_version(kernel_version(5, 15, 0));
        stp.enable_probe(exec_success);
        assert_eq!(
            stp.registry.get(under).unwrap().dependents,
            vec![exec_success]
        );
        assert!(stp.registry.get(under).unwrap().enabled);
    }

    #[test]
    fn signal_send_swaps_task_in_front() {
        let stp = session_with_underliers();

        // signal_generate(sig, info, task, ...) is presented as
        // (task, sig).
        let mut tb = TrampolineBuilder::new(0);
        ProcProvider
            .dep_trampoline(&stp, probe(&stp, "signal-send"), &mut tb)
            .unwrap();
        assert_eq!(tb.list.len(), 4);

        // Probes that keep the underlying shape emit nothing.
        let mut tb = TrampolineBuilder::new(0);
        ProcProvider
            .dep_trampoline(&stp, probe(&stp, "create"), &mut tb)
            .unwrap();
        assert!(tb.list.is_empty());
    }

    #[test]
    fn argument_tables_describe_the_probes() {
        let mut stp = session_with_underliers();

        let sig = probe(&stp, "signal-send");
        let args = ProcProvider.probe_info(&mut stp, sig).unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].native.as_deref(), Some("struct task_struct *"));
        assert_eq!(args[0].xlate.as_deref(), Some("psinfo_t *"));
        assert_eq!(args[0].mapping, 1);
        assert_eq!(args[1].native.as_deref(), Some("int"));

        // exec-success advertises no arguments at all.
        let exec_success = probe(&stp, "exec-success");
        let args = ProcProvider.probe_info(&mut stp, exec_success).unwrap();
        assert!(args.is_empty());
    }
}
