//! The profile provider: `profile-N` timers that fire on every CPU, and
//! `tick-N` timers that fire on one, backed by perf software clock
//! events.

use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

use crate::bpf::syscall::{ncpus, perf_attach_bpf, perf_event_open, PerfEventAttr};
use crate::bpf::{ProgType, TrampolineBuilder};
use crate::error::{Error, Result};
use crate::probe::{ArgDesc, ProbeData, ProbeDesc, ProbeId, ProfileKind, ProfileProbe};
use crate::provider::ProviderOps;
use crate::session::Session;

pub(crate) const PROV_NAME: &str = "profile";
const MOD_NAME: &str = "";
const FUN_NAME: &str = "";

const PREFIX_PROFILE: &str = "profile-";
const PREFIX_TICK: &str = "tick-";

/// Timer periods below this are refused outright.
const MIN_PERIOD_NS: u64 = 200_000;

/// Parse the period out of a probe name: `profile-97` is 97Hz,
/// `profile-200us` is a 200-microsecond period, and so on.
fn parse_period(name: &str) -> Option<u64> {
    let dash = name.find('-')?;
    let spec = &name[dash + 1..];

    let digits_end = spec
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(spec.len());
    if digits_end == 0 {
        return None;
    }
    let val: u64 = spec[..digits_end].parse().ok()?;
    if val == 0 {
        return None;
    }
    let suffix = &spec[digits_end..];

    let period = match suffix.to_ascii_lowercase().as_str() {
        "" | "hz" => 1_000_000_000 / val,
        "ns" | "nsec" => val,
        "us" | "usec" => val * 1_000,
        "ms" | "msec" => val * 1_000_000,
        "s" | "sec" => val * 1_000_000_000,
        "m" | "min" => val * 60 * 1_000_000_000,
        "h" | "hour" => val * 60 * 60 * 1_000_000_000,
        "d" | "day" => val * 24 * 60 * 60 * 1_000_000_000,
        _ => return None,
    };

    if period < MIN_PERIOD_NS {
        return None;
    }
    Some(period)
}

fn insert_probe(
    stp: &mut Session,
    prov: usize,
    name: &str,
    kind: ProfileKind,
    period_ns: u64,
) -> ProbeId {
    stp.probe_insert(
        prov,
        ProbeDesc::new(PROV_NAME, MOD_NAME, FUN_NAME, name),
        ProbeData::Profile(RefCell::new(ProfileProbe {
            kind,
            period_ns,
            fds: Vec::new(),
        })),
    )
}

pub struct ProfileProvider;

impl ProviderOps for ProfileProvider {
    fn name(&self) -> &'static str {
        PROV_NAME
    }

    fn prog_type(&self) -> ProgType {
        ProgType::PerfEvent
    }

    /// The conventional default rates; anything else is materialized on
    /// demand by `provide`.
    fn populate(&self, stp: &mut Session) -> Result<usize> {
        let prov = stp.provider_create(PROV_NAME, 0, Rc::new(ProfileProvider));
        let mut n = 0;

        for hz in &[97u64, 199, 499, 997, 1999, 4001, 4999] {
            insert_probe(
                stp,
                prov,
                &format!("{}{}", PREFIX_PROFILE, hz),
                ProfileKind::Profile,
                1_000_000_000 / hz,
            );
            n += 1;
        }
        for hz in &[1u64, 10, 100, 500, 1000, 5000] {
            insert_probe(
                stp,
                prov,
                &format!("{}{}", PREFIX_TICK, hz),
                ProfileKind::Tick,
                1_000_000_000 / hz,
            );
            n += 1;
        }
        Ok(n)
    }

    /// Parametric probes: any legal `profile-N<suffix>`/`tick-N<suffix>`
    /// description gets a probe made for it.
    fn provide(&self, stp: &mut Session, pdp: &ProbeDesc) -> Result<usize> {
        if pdp.provider != PROV_NAME || !pdp.module.is_empty() || !pdp.function.is_empty() {
            return Ok(0);
        }
        let kind = if pdp.name.starts_with(PREFIX_PROFILE) {
            ProfileKind::Profile
        } else if pdp.name.starts_with(PREFIX_TICK) {
            ProfileKind::Tick
        } else {
            return Ok(0);
        };
        let period = match parse_period(&pdp.name) {
            Some(p) => p,
            None => return Ok(0),
        };

        let prov = match stp.provider_lookup(PROV_NAME) {
            Some(idx) => idx,
            None => return Ok(0),
        };
        insert_probe(stp, prov, &pdp.name, kind, period);
        debug!("profile: provided {} with period {}ns", pdp.name, period);
        Ok(1)
    }

    /// The perf-event context carries the interrupted `pt_regs` first;
    /// argv[0] is the trapping instruction pointer.
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

    /// Open one clock event per CPU for profile probes, one for tick
    /// probes, and attach the program to each.
    fn attach(&self, stp: &mut Session, prp: ProbeId, bpf_fd: i32) -> Result<()> {
        let probe = stp
            .registry
            .get(prp)
            .ok_or_else(|| Error::NoProbe(format!("probe {}", prp)))?;
        let pp = match &probe.data {
            ProbeData::Profile(pp) => pp,
            _ => return Err(Error::NoProbe(format!("probe {}", prp))),
        };

        let (kind, period) = {
            let p = pp.borrow();
            (p.kind, p.period_ns)
        };
        let cpus = match kind {
            ProfileKind::Profile => ncpus(),
            ProfileKind::Tick => 1,
        };

        let attr = PerfEventAttr::cpu_clock(period);
        for cpu in 0..cpus {
            let fd = perf_event_open(&attr, -1, cpu as i32, -1)?;
            perf_attach_bpf(fd, bpf_fd)?;
            pp.borrow_mut().fds.push(fd);
        }
        Ok(())
    }

    fn detach(&self, stp: &mut Session, prp: ProbeId) {
        if let Some(probe) = stp.registry.get(prp) {
            if let ProbeData::Profile(pp) = &probe.data {
                for fd in pp.borrow_mut().fds.drain(..) {
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
        }
    }

    fn probe_info(&self, _stp: &mut Session, _prp: ProbeId) -> Result<Vec<ArgDesc>> {
        // arg0: kernel PC at the interrupt (arg1, the user PC, needs
        // state the consumer derives).
        Ok(vec![ArgDesc {
            native: Some("uint64_t".to_string()),
            xlate: None,
            mapping: 0,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_parsing() {
        assert_eq!(parse_period("profile-97"), Some(1_000_000_000 / 97));
        assert_eq!(parse_period("profile-1000hz"), Some(1_000_000));
        assert_eq!(parse_period("tick-5s"), Some(5_000_000_000));
        assert_eq!(parse_period("tick-500ms"), Some(500_000_000));
        assert_eq!(parse_period("tick-200us"), Some(200_000));

        // Below the floor, zero, or malformed.
        assert_eq!(parse_period("profile-100us"), None);
        assert_eq!(parse_period("profile-0"), None);
        assert_eq!(parse_period("profile-"), None);
        assert_eq!(parse_period("profile-5parsecs"), None);
    }

    #[test]
    fn provide_is_parametric() {
        let mut stp = Session::new();
        ProfileProvider.populate(&mut stp).unwrap();

        let ids = stp.enable(&ProbeDesc::parse("profile:::profile-297")).unwrap();
        assert_eq!(ids.len(), 1);

        // Refused rates do not materialize.
        assert!(stp.enable(&ProbeDesc::parse("profile:::profile-1ns")).is_err());
    }
}
