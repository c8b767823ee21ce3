//! The syscall provider: entry and return probes over the kernel's
//! `syscalls:sys_enter_*` / `syscalls:sys_exit_*` tracepoint events.

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use crate::bpf::{ProgType, TrampolineBuilder};
use crate::error::{Error, Result};
use crate::probe::{ArgDesc, ProbeData, ProbeDesc, ProbeId, TpProbe};
use crate::provider::{tp, ProviderOps};
use crate::session::Session;
use crate::tracefs;

pub(crate) const PROV_NAME: &str = "syscall";
const MOD_NAME: &str = "vmlinux";
const GROUP: &str = "syscalls";

/// Offset of the argument array in a syscall tracepoint's context: the
/// common fields and the syscall number precede it.
const SYSCALL_ARGS_OFF: i16 = 16;

/// Number of tracepoint format fields before the syscall arguments (the
/// syscall number).
const SKIP_FIELDS: usize = 1;

fn event_name(desc: &ProbeDesc) -> String {
    if desc.name == "entry" {
        format!("sys_enter_{}", desc.function)
    } else {
        format!("sys_exit_{}", desc.function)
    }
}

pub struct SyscallProvider;

impl ProviderOps for SyscallProvider {
    fn name(&self) -> &'static str {
        PROV_NAME
    }

    fn prog_type(&self) -> ProgType {
        ProgType::Tracepoint
    }

    /// Every `syscalls/sys_enter_<name>` event becomes an entry probe,
    /// every `sys_exit_<name>` a return probe.
    fn populate(&self, stp: &mut Session) -> Result<usize> {
        let prov = stp.provider_create(PROV_NAME, 0, Rc::new(SyscallProvider));

        let dir = tracefs::events_dir(&stp.tracefs_root).join(GROUP);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };

        let mut n = 0;
        for entry in entries.flatten() {
            let event = entry.file_name().to_string_lossy().into_owned();
            let (name, prb) = if let Some(name) = event.strip_prefix("sys_enter_") {
                (name.to_string(), "entry")
            } else if let Some(name) = event.strip_prefix("sys_exit_") {
                (name.to_string(), "return")
            } else {
                continue;
            };

            stp.probe_insert(
                prov,
                ProbeDesc::new(PROV_NAME, MOD_NAME, &name, prb),
                ProbeData::Tp(RefCell::new(TpProbe::default())),
            );
            n += 1;
        }
        Ok(n)
    }

    /// The tracepoint context carries the syscall arguments (or return
    /// value) in a flat array past the common fields.
    fn trampoline(
        &self,
        stp: &Session,
        prp: ProbeId,
        tb: &mut TrampolineBuilder,
    ) -> Result<()> {
        let is_return = stp
            .registry
            .get(prp)
            .map(|p| p.desc.name == "return")
            .unwrap_or(false);

        tb.prologue();
        if is_return {
            tb.copy_args_from_ctx(SYSCALL_ARGS_OFF, 1);
        } else {
            tb.copy_args_from_ctx(SYSCALL_ARGS_OFF, 6);
        }
        stp.emit_clauses_and_deps(prp, tb)
    }

    fn attach(&self, stp: &mut Session, prp: ProbeId, bpf_fd: i32) -> Result<()> {
        let root = stp.tracefs_root.clone();
        let probe = stp
            .registry
            .get(prp)
            .ok_or_else(|| Error::NoProbe(format!("probe {}", prp)))?;
        let event = event_name(&probe.desc);

        let tpp = match &probe.data {
            ProbeData::Tp(tpp) => tpp,
            _ => return Err(Error::NoProbe(format!("probe {}", prp))),
        };
        tp::tp_resolve(tpp, &root, GROUP, &event)?;
        tp::tp_attach(tpp, bpf_fd)
    }

    fn detach(&self, stp: &mut Session, prp: ProbeId) {
        if let Some(probe) = stp.registry.get(prp) {
            if let ProbeData::Tp(tpp) = &probe.data {
                tp::tp_detach(tpp);
            }
        }
    }

    /// Argument types parsed from the event's format file.
    fn probe_info(&self, stp: &mut Session, prp: ProbeId) -> Result<Vec<ArgDesc>> {
        let root = stp.tracefs_root.clone();
        let probe = stp
            .registry
            .get(prp)
            .ok_or_else(|| Error::NoProbe(format!("probe {}", prp)))?;
        let event = event_name(&probe.desc);
        let fmt = tracefs::event_format(&root, GROUP, &event, SKIP_FIELDS)?;
        Ok(fmt.args)
    }
}
