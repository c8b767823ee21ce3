//! The CPU performance counter provider.  Probe names are parametric:
//! `<event>-<count>`, firing each time the named hardware counter
//! advances by `count`.

use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

use crate::bpf::syscall::{
    ncpus, perf_attach_bpf, perf_event_open, PerfEventAttr, PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
    PERF_COUNT_HW_BRANCH_MISSES, PERF_COUNT_HW_BUS_CYCLES, PERF_COUNT_HW_CACHE_MISSES,
    PERF_COUNT_HW_CACHE_REFERENCES, PERF_COUNT_HW_CPU_CYCLES, PERF_COUNT_HW_INSTRUCTIONS,
};
use crate::bpf::{ProgType, TrampolineBuilder};
use crate::error::{Error, Result};
use crate::probe::{ArgDesc, CpcProbe, ProbeData, ProbeDesc, ProbeId};
use crate::provider::ProviderOps;
use crate::session::Session;

pub(crate) const PROV_NAME: &str = "cpc";

/// The generic hardware events perf knows without PMU-specific tables.
const EVENTS: &[(&str, u64)] = &[
    ("cpu_cycles", PERF_COUNT_HW_CPU_CYCLES),
    ("instructions", PERF_COUNT_HW_INSTRUCTIONS),
    ("cache_references", PERF_COUNT_HW_CACHE_REFERENCES),
    ("cache_misses", PERF_COUNT_HW_CACHE_MISSES),
    ("branch_instructions", PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    ("branch_misses", PERF_COUNT_HW_BRANCH_MISSES),
    ("bus_cycles", PERF_COUNT_HW_BUS_CYCLES),
];

/// Overflow periods below this would melt the machine.
const MIN_COUNT: u64 = 5000;

fn parse_probe_name(name: &str) -> Option<(u64, u64)> {
    let dash = name.rfind('-')?;
    let event = &name[..dash];
    let count: u64 = name[dash + 1..].parse().ok()?;
    if count < MIN_COUNT {
        return None;
    }
    let config = EVENTS.iter().find(|(n, _)| *n == event)?.1;
    Some((config, count))
}

pub struct CpcProvider;

impl ProviderOps for CpcProvider {
    fn name(&self) -> &'static str {
        PROV_NAME
    }

    fn prog_type(&self) -> ProgType {
        ProgType::PerfEvent
    }

    /// Purely parametric: only the provider is registered up front.
    fn populate(&self, stp: &mut Session) -> Result<usize> {
        stp.provider_create(PROV_NAME, 0, Rc::new(CpcProvider));
        Ok(0)
    }

    fn provide(&self, stp: &mut Session, pdp: &ProbeDesc) -> Result<usize> {
        if pdp.provider != PROV_NAME || !pdp.module.is_empty() || !pdp.function.is_empty() {
            return Ok(0);
        }
        let (config, count) = match parse_probe_name(&pdp.name) {
            Some(pair) => pair,
            None => return Ok(0),
        };
        let prov = match stp.provider_lookup(PROV_NAME) {
            Some(idx) => idx,
            None => return Ok(0),
        };
        stp.probe_insert(
            prov,
            ProbeDesc::new(PROV_NAME, "", "", &pdp.name),
            ProbeData::Cpc(RefCell::new(CpcProbe {
                config,
                count,
                fds: Vec::new(),
            })),
        );
        debug!("cpc: provided {} (config {}, count {})", pdp.name, config, count);
        Ok(1)
    }

    /// Only arg0 and arg1 are set, from the PC pair at overflow.
    fn trampoline(
        &self,
        stp: &Session,
        prp: ProbeId,
        tb: &mut TrampolineBuilder,
    ) -> Result<()> {
        tb.prologue();
        tb.copy_pc_from_regs();
        stp.emit_clauses_and_deps(prp, tb)
    }

    /// One counter per CPU.
    fn attach(&self, stp: &mut Session, prp: ProbeId, bpf_fd: i32) -> Result<()> {
        let probe = stp
            .registry
            .get(prp)
            .ok_or_else(|| Error::NoProbe(format!("probe {}", prp)))?;
        let cp = match &probe.data {
            ProbeData::Cpc(cp) => cp,
            _ => return Err(Error::NoProbe(format!("probe {}", prp))),
        };

        let (config, count) = {
            let c = cp.borrow();
            (c.config, c.count)
        };
        let attr = PerfEventAttr::hardware(config, count);
        for cpu in 0..ncpus() {
            let fd = perf_event_open(&attr, -1, cpu as i32, -1)?;
            perf_attach_bpf(fd, bpf_fd)?;
            cp.borrow_mut().fds.push(fd);
        }
        Ok(())
    }

    fn detach(&self, stp: &mut Session, prp: ProbeId) {
        if let Some(probe) = stp.registry.get(prp) {
            if let ProbeData::Cpc(cp) = &probe.data {
                for fd in cp.borrow_mut().fds.drain(..) {
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
        }
    }

    fn probe_info(&self, _stp: &mut Session, _prp: ProbeId) -> Result<Vec<ArgDesc>> {
        Ok((0..2)
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

    #[test]
    fn probe_names_parse() {
        assert_eq!(
            parse_probe_name("cpu_cycles-1000000"),
            Some((PERF_COUNT_HW_CPU_CYCLES, 1_000_000))
        );
        assert_eq!(parse_probe_name("cache_misses-10000").map(|p| p.1), Some(10000));
        assert!(parse_probe_name("cpu_cycles-10").is_none()); // below floor
        assert!(parse_probe_name("made_up_event-100000").is_none());
        assert!(parse_probe_name("cpu_cycles").is_none());
    }
}
