//! The function-boundary tracing provider.
//!
//! FBT probes are kprobes: the kernel lists probeable functions in
//! `available_filter_functions` (mostly core-kernel, some tagged with a
//! module), and a kprobe_events line turns one into a tracepoint event
//! we can perf-attach.
//!
//! Event name to probe name mapping:
//!
//! ```text
//! <name>            fbt:vmlinux:<name>:entry   fbt:vmlinux:<name>:return
//! <name> [<mod>]    fbt:<mod>:<name>:entry     fbt:<mod>:<name>:return
//! ```

use log::debug;
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use crate::bpf::{ProgType, TrampolineBuilder};
use crate::error::{Error, Result};
use crate::probe::{ArgDesc, ProbeData, ProbeDesc, ProbeId, TpProbe};
use crate::provider::{tp, ProviderOps};
use crate::session::Session;
use crate::tracefs;

pub(crate) const PROV_NAME: &str = "fbt";
const MOD_NAME: &str = "vmlinux";

fn group() -> String {
    format!("dt_{}_fbt", std::process::id())
}

pub struct FbtProvider;

impl ProviderOps for FbtProvider {
    fn name(&self) -> &'static str {
        PROV_NAME
    }

    fn prog_type(&self) -> ProgType {
        ProgType::Kprobe
    }

    /// Scan `available_filter_functions` and add entry and return probes
    /// for every function listed.
    fn populate(&self, stp: &mut Session) -> Result<usize> {
        let prov = stp.provider_create(PROV_NAME, 0, Rc::new(FbtProvider));

        let list = stp.tracefs_root.join("available_filter_functions");
        let content = match fs::read_to_string(&list) {
            Ok(c) => c,
            Err(_) => return Ok(0),
        };

        let mut n = 0;
        for line in content.lines() {
            // A line is either "funcname" or "funcname [modname]".
            let mut fields = line.split_whitespace();
            let func = match fields.next() {
                Some(f) => f,
                None => continue,
            };
            let module = fields
                .next()
                .map(|m| m.trim_start_matches('[').trim_end_matches(']'))
                .unwrap_or(MOD_NAME);

            // The file lists some function names more than once (it
            // carries no module disambiguation for them); do not create
            // duplicate probes.
            let pd = ProbeDesc::new(PROV_NAME, module, func, "entry");
            if stp.registry.lookup(&pd).is_some() {
                continue;
            }

            stp.probe_insert(prov, pd, ProbeData::Tp(RefCell::new(TpProbe::default())));
            n += 1;
            stp.probe_insert(
                prov,
                ProbeDesc::new(PROV_NAME, module, func, "return"),
                ProbeData::Tp(RefCell::new(TpProbe::default())),
            );
            n += 1;
        }

        Ok(n)
    }

    /// The kprobe context is a `pt_regs`: entry probes read the six
    /// parameter registers, return probes the call-site PC and return
    /// value register.
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
        tb.copy_regs();
        if is_return {
            tb.copy_rval_from_regs();
        } else {
            tb.copy_args_from_regs(false);
        }
        stp.emit_clauses_and_deps(prp, tb)
    }

    /// Register the kprobe with the tracing subsystem (creating a
    /// tracepoint event), then perf-attach the program to it.
    fn attach(&self, stp: &mut Session, prp: ProbeId, bpf_fd: i32) -> Result<()> {
        let root = stp.tracefs_root.clone();
        let probe = stp
            .registry
            .get(prp)
            .ok_or_else(|| Error::NoProbe(format!("probe {}", prp)))?;
        let is_return = probe.desc.name == "return";
        let func = probe.desc.function.clone();
        let event = format!(
            "{}_{}",
            if is_return { "r" } else { "p" },
            tracefs::encode_name(&func)
        );

        let tpp = match &probe.data {
            ProbeData::Tp(tpp) => tpp,
            _ => return Err(Error::NoProbe(format!("probe {}", prp))),
        };

        if tpp.borrow().event_id.is_none() {
            let id = tracefs::kprobe_create(&root, &group(), &event, &func, is_return)?;
            let mut tp = tpp.borrow_mut();
            tp.event_id = Some(id);
            tp.created = true;
            debug!("fbt: created kprobe {} for {} (id {})", event, func, id);
        }

        tp::tp_attach(tpp, bpf_fd)
    }

    fn detach(&self, stp: &mut Session, prp: ProbeId) {
        let root = stp.tracefs_root.clone();
        if let Some(probe) = stp.registry.get(prp) {
            if let ProbeData::Tp(tpp) = &probe.data {
                let created = tpp.borrow().created;
                let is_return = probe.desc.name == "return";
                let event = format!(
                    "{}_{}",
                    if is_return { "r" } else { "p" },
                    tracefs::encode_name(&probe.desc.function)
                );
                tp::tp_detach(tpp);
                if created {
                    let _ = tracefs::kprobe_delete(&root, &group(), &event);
                }
            }
        }
    }

    /// Function argument types come from kernel type data, which an
    /// external reader supplies; we report untyped 64-bit slots.
    fn probe_info(&self, stp: &mut Session, prp: ProbeId) -> Result<Vec<ArgDesc>> {
        let is_return = stp
            .registry
            .get(prp)
            .map(|p| p.desc.name == "return")
            .unwrap_or(false);
        let n = if is_return { 2 } else { 6 };
        Ok((0..n)
            .map(|i| ArgDesc {
                native: Some("uint64_t".to_string()),
                xlate: None,
                mapping: i as u8,
            })
            .collect())
    }
}
