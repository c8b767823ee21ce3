//! The provider framework: the ops contract every probe family
//! implements, and the registry of provider instances in a session.

use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::bpf::{syscall, ProgType, Program, TrampolineBuilder};
use crate::error::{Error, Result};
use crate::probe::{ArgDesc, ProbeData, ProbeDesc, ProbeId};
use crate::session::Session;

pub mod cpc;
pub mod dtrace;
pub mod fbt;
pub mod profile;
pub mod proc;
pub mod rawtp;
pub mod sched;
pub mod sdt;
pub mod syscall_prov;
pub mod tp;
pub mod uprobe;

/// Provider flag: probes are process-scoped (pid/USDT).
pub const PROV_PID: u32 = 0x1;

/// A registered provider instance.
pub struct Provider {
    pub name: String,
    pub flags: u32,
    pub ops: Rc<dyn ProviderOps>,
}

/// The contract a probe family implements.  Everything except
/// [`ProviderOps::populate`] and (for concretely attachable providers)
/// [`ProviderOps::trampoline`]/[`ProviderOps::attach`] has a usable
/// default.
pub trait ProviderOps {
    fn name(&self) -> &'static str;

    /// The BPF program type this family's trampolines load as.
    fn prog_type(&self) -> ProgType {
        ProgType::Kprobe
    }

    /// Enumerate all statically-knowable probes at open time.  Returns
    /// the number created.
    fn populate(&self, stp: &mut Session) -> Result<usize>;

    /// Materialize a probe matching a description that populate did not
    /// create (parametric providers: profile-97ms, cpc events).
    fn provide(&self, _stp: &mut Session, _pdp: &ProbeDesc) -> Result<usize> {
        Ok(0)
    }

    /// Materialize a probe for a specific process (pid/USDT).
    fn provide_pid(&self, _stp: &mut Session, _psp: &uprobe::PidProbeSpec) -> Result<usize> {
        Err(Error::NoProbe("provider has no pid probes".to_string()))
    }

    /// Note that this probe is wanted.  Providers with dependent or
    /// underlying probes chain through them here.
    fn enable(&self, stp: &mut Session, prp: ProbeId) {
        stp.enable_probe_default(prp);
    }

    /// Whether this probe gets its own loaded program.  Dependent
    /// families (SDT, pid/USDT overlay probes) ride an underlying
    /// probe's program instead.
    fn attachable(&self) -> bool {
        true
    }

    /// Emit the marshalling trampoline for a probe into the builder.
    fn trampoline(
        &self,
        stp: &Session,
        prp: ProbeId,
        tb: &mut TrampolineBuilder,
    ) -> Result<()>;

    /// For dependent probes: emit the argument synthesis that runs on
    /// the underlying probe's program before this probe's clauses.
    fn dep_trampoline(
        &self,
        _stp: &Session,
        _prp: ProbeId,
        _tb: &mut TrampolineBuilder,
    ) -> Result<()> {
        Ok(())
    }

    /// Load the completed program with this family's program type.
    fn load_prog(&self, prog: &Program) -> Result<RawFd> {
        syscall::prog_load(self.prog_type(), prog)
    }

    /// Perform the kernel-specific attach of a loaded program.
    fn attach(&self, stp: &mut Session, prp: ProbeId, bpf_fd: RawFd) -> Result<()>;

    /// Report native and translated argument types.
    fn probe_info(&self, _stp: &mut Session, _prp: ProbeId) -> Result<Vec<ArgDesc>> {
        Ok(Vec::new())
    }

    /// Reverse [`ProviderOps::attach`].
    fn detach(&self, _stp: &mut Session, _prp: ProbeId) {}

    /// Free provider-private probe state.
    fn destroy(&self, data: ProbeData) {
        drop(data);
    }
}
