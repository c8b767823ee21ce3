//! The raw-tracepoint provider: kernel tracepoints attached in raw form,
//! where the context is the tracepoint's argument array itself.
//!
//! The argument count of a raw tracepoint is not exported to userspace.
//! When kernel type data is available an external reader supplies it;
//! otherwise we probe it by trial and error: load a two-instruction
//! program that reads `argv[N-1]` and see whether the verifier accepts
//! it, decrementing N until one does.

use log::debug;
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use crate::bpf::dctx::DMST_ARGC;
use crate::bpf::insn::{self, Insn, InsnList};
use crate::bpf::syscall::{prog_load, raw_tracepoint_open};
use crate::bpf::{ProgType, TrampolineBuilder};
use crate::error::{Error, Result};
use crate::probe::{ArgDesc, ProbeData, ProbeDesc, ProbeId, TpProbe};
use crate::provider::ProviderOps;
use crate::session::Session;

pub(crate) const PROV_NAME: &str = "rawtp";
const MOD_NAME: &str = "vmlinux";

/// Event groups that other providers own.
const FOREIGN_GROUPS: &[&str] = &["kprobes", "syscalls", "uprobes", "pid"];

pub struct RawTpProvider;

impl ProviderOps for RawTpProvider {
    fn name(&self) -> &'static str {
        PROV_NAME
    }

    fn prog_type(&self) -> ProgType {
        ProgType::RawTracepoint
    }

    /// Anything in `available_events` that is a plain kernel tracepoint (not
    /// a kprobe, syscall, uprobe or one of our own groups) gets a probe.
    fn populate(&self, stp: &mut Session) -> Result<usize> {
        let prov = stp.provider_create(PROV_NAME, 0, Rc::new(RawTpProvider));

        let list = stp.tracefs_root.join("available_events");
        let content = match fs::read_to_string(&list) {
            Ok(c) => c,
            Err(_) => return Ok(0),
        };

        let mut n = 0;
        for line in content.lines() {
            let (group, event) = match line.split_once(':') {
                Some(pair) => pair,
                None => (MOD_NAME, line),
            };
            if FOREIGN_GROUPS.contains(&group) || group.starts_with("dt_") {
                continue;
            }

            stp.probe_insert(
                prov,
                ProbeDesc::new(PROV_NAME, group, "", event),
                ProbeData::Tp(RefCell::new(TpProbe::default())),
            );
            n += 1;
        }
        Ok(n)
    }

    /// The raw context is the argument array: copy as many as the probe
    /// advertises straight into argv.
    fn trampoline(
        &self,
        stp: &Session,
        prp: ProbeId,
        tb: &mut TrampolineBuilder,
    ) -> Result<()> {
        let argc = stp
            .registry
            .get(prp)
            .and_then(|p| p.argdesc.as_ref().map(|a| a.len()))
            .unwrap_or(DMST_ARGC);

        tb.prologue();
        tb.copy_args_from_ctx(0, argc);
        stp.emit_clauses_and_deps(prp, tb)
    }

    fn attach(&self, stp: &mut Session, prp: ProbeId, bpf_fd: i32) -> Result<()> {
        let probe = stp
            .registry
            .get(prp)
            .ok_or_else(|| Error::NoProbe(format!("probe {}", prp)))?;
        let name = probe.desc.name.clone();
        let fd = raw_tracepoint_open(&name, bpf_fd)?;
        if let ProbeData::Tp(tpp) = &probe.data {
            tpp.borrow_mut().event_fd = Some(fd);
        }
        Ok(())
    }

    fn detach(&self, stp: &mut Session, prp: ProbeId) {
        if let Some(probe) = stp.registry.get(prp) {
            if let ProbeData::Tp(tpp) = &probe.data {
                if let Some(fd) = tpp.borrow_mut().event_fd.take() {
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
        }
    }

    /// Discover the arity by verifier probe, capped at the argv size.
    fn probe_info(&self, stp: &mut Session, prp: ProbeId) -> Result<Vec<ArgDesc>> {
        let name = stp
            .registry
            .get(prp)
            .map(|p| p.desc.name.clone())
            .ok_or_else(|| Error::NoProbe(format!("probe {}", prp)))?;

        let mut argc = DMST_ARGC;
        while argc > 0 {
            match arg_count_probe(&name, argc) {
                Ok(true) => break,
                // Verifier rejection here is informational, not an
                // error: it just means "fewer arguments than that".
                Ok(false) | Err(Error::Verifier(_)) => argc -= 1,
                Err(e) => return Err(e),
            }
        }

        debug!("rawtp: {} takes {} args", name, argc);
        Ok((0..argc)
            .map(|i| ArgDesc {
                native: Some("uint64_t".to_string()),
                xlate: None,
                mapping: i as u8,
            })
            .collect())
    }
}

/// Try to attach a minimal program that reads argument `argc - 1`.
fn arg_count_probe(name: &str, argc: usize) -> Result<bool> {
    let mut list = InsnList::new();
    list.emit(Insn::load(
        insn::BPF_DW,
        insn::R0,
        insn::R1,
        ((argc - 1) * 8) as i16,
    ));
    list.emit(Insn::exit());
    let prog = list.assemble();

    let bpf_fd = match prog_load(ProgType::RawTracepoint, &prog) {
        Ok(fd) => fd,
        Err(Error::Verifier(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    let res = raw_tracepoint_open(name, bpf_fd);
    unsafe {
        libc::close(bpf_fd);
    }
    match res {
        Ok(fd) => {
            unsafe {
                libc::close(fd);
            }
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}
