//! The `dtrace` provider: the BEGIN, END and ERROR pseudo-probes.
//!
//! These fire from the session's own lifecycle rather than from a kernel
//! event, so their trampolines marshal nothing: the consumer invokes the
//! loaded program at the right moments.

use crate::bpf::{ProgType, TrampolineBuilder};
use crate::error::Result;
use crate::probe::{ProbeData, ProbeDesc, ProbeId};
use crate::provider::ProviderOps;
use crate::session::Session;

pub(crate) const PROV_NAME: &str = "dtrace";

pub struct DtraceProvider;

impl ProviderOps for DtraceProvider {
    fn name(&self) -> &'static str {
        PROV_NAME
    }

    fn prog_type(&self) -> ProgType {
        ProgType::RawTracepoint
    }

    fn populate(&self, stp: &mut Session) -> Result<usize> {
        let prov = stp.provider_create(PROV_NAME, 0, std::rc::Rc::new(DtraceProvider));
        let mut n = 0;
        for name in &["BEGIN", "END", "ERROR"] {
            stp.probe_insert(
                prov,
                ProbeDesc::new(PROV_NAME, "", "", name),
                ProbeData::None,
            );
            n += 1;
        }
        Ok(n)
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

    fn attach(&self, _stp: &mut Session, _prp: ProbeId, _bpf_fd: i32) -> Result<()> {
        // Fired by the consumer, not by a kernel event: the loaded
        // program fd is all the attach there is.
        Ok(())
    }
}
