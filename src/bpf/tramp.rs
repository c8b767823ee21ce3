//! Trampoline emission: the shared prologue/epilogue every provider's
//! probe program is built around, plus the argument-copy helpers the
//! provider families compose.
//!
//! Register conventions after the prologue, relied on by every helper:
//!
//! ```text
//!   %r7 = &dctx.mst
//!   %r8 = dctx.ctx      (the raw kernel context pointer)
//!   %r9 = &dctx
//! ```
//!
//! Any error path jumps to the threaded exit label, which returns 0.

use super::dctx::{
    dmst_arg, pt_regs_off, tramp_sp_slot, DCTX_CTX, DCTX_FP_BASE, DCTX_MST, DMST_EPID,
    DMST_PRID, DMST_ARGC, MST_FP_BASE,
};
use super::insn::{self, Insn, InsnList, Label, Program};
use crate::error::{Error, Result};

/// A compiled clause attached to a probe: an external function id
/// produced by the clause compiler, with an optional predicate function
/// whose nonzero return gates the clause.
#[derive(Copy, Clone, Debug)]
pub struct Clause {
    pub func_id: u32,
    pub pred_id: Option<u32>,
}

/// State threaded through trampoline construction for one probe program.
pub struct TrampolineBuilder {
    pub list: InsnList,
    exitlbl: Label,
    probe_id: u32,
}

impl TrampolineBuilder {
    pub fn new(probe_id: u32) -> TrampolineBuilder {
        let mut list = InsnList::new();
        let exitlbl = list.new_label();
        TrampolineBuilder {
            list,
            exitlbl,
            probe_id,
        }
    }

    pub fn exit_label(&self) -> Label {
        self.exitlbl
    }

    pub fn probe_id(&self) -> u32 {
        self.probe_id
    }

    /// Emit the shared prologue: lay the dctx out on the stack, zero the
    /// argument slots, record the probe identity, and establish the
    /// register conventions.
    pub fn prologue(&mut self) {
        let l = &mut self.list;

        // dctx.ctx = r1
        l.emit(Insn::store(insn::BPF_DW, insn::FP, DCTX_FP_BASE + DCTX_CTX, insn::R1));

        // dctx.mst = fp + MST_FP_BASE
        l.emit(Insn::mov_reg(insn::R0, insn::FP));
        l.emit(Insn::alu64_imm(insn::BPF_ADD, insn::R0, MST_FP_BASE as i32));
        l.emit(Insn::store(insn::BPF_DW, insn::FP, DCTX_FP_BASE + DCTX_MST, insn::R0));

        // mst.epid is filled in by the consumer at attach; mst.prid is
        // this probe.
        l.emit(Insn::store_imm(insn::BPF_W, insn::FP, MST_FP_BASE + DMST_EPID, 0));
        l.emit(Insn::store_imm(
            insn::BPF_W,
            insn::FP,
            MST_FP_BASE + DMST_PRID,
            self.probe_id as i32,
        ));

        // mst.argv[0..10] = 0
        for i in 0..DMST_ARGC {
            l.emit(Insn::store_imm(
                insn::BPF_DW,
                insn::FP,
                MST_FP_BASE + dmst_arg(i),
                0,
            ));
        }

        // r7 = &mst, r8 = ctx, r9 = &dctx
        l.emit(Insn::mov_reg(insn::R7, insn::FP));
        l.emit(Insn::alu64_imm(insn::BPF_ADD, insn::R7, MST_FP_BASE as i32));
        l.emit(Insn::mov_reg(insn::R8, insn::R1));
        l.emit(Insn::mov_reg(insn::R9, insn::FP));
        l.emit(Insn::alu64_imm(insn::BPF_ADD, insn::R9, DCTX_FP_BASE as i32));
    }

    /// Copy the kernel-supplied `pt_regs` (pointed to by `%r8`) into the
    /// machine-state register file, for registers-based probes.
    pub fn copy_regs(&mut self) {
        let words = std::mem::size_of::<super::dctx::PtRegs>() / 8;
        for i in 0..words {
            self.list
                .emit(Insn::load(insn::BPF_DW, insn::R0, insn::R8, (i * 8) as i16));
            self.list.emit(Insn::store(
                insn::BPF_DW,
                insn::R7,
                super::dctx::DMST_REGS + (i * 8) as i16,
                insn::R0,
            ));
        }
    }

    /// argv[0..6] from the platform's parameter registers.  With
    /// `skip_first_arg`, argv[0..5] come from parameter registers 1..6
    /// instead (pid offset probes see the probe site's own frame).
    pub fn copy_args_from_regs(&mut self, skip_first_arg: bool) {
        let base = if skip_first_arg { 1 } else { 0 };
        for i in 0..6 {
            if base + i >= 6 {
                break;
            }
            self.list
                .emit(Insn::load(insn::BPF_DW, insn::R0, insn::R8, pt_regs_off::arg(base + i)));
            self.list.emit(Insn::store(
                insn::BPF_DW,
                insn::R7,
                dmst_arg(i),
                insn::R0,
            ));
        }
    }

    /// For return probes: argv[0] is the call-site PC, argv[1] the
    /// return value register.
    pub fn copy_rval_from_regs(&mut self) {
        self.list
            .emit(Insn::load(insn::BPF_DW, insn::R0, insn::R8, pt_regs_off::ip()));
        self.list
            .emit(Insn::store(insn::BPF_DW, insn::R7, dmst_arg(0), insn::R0));
        self.list
            .emit(Insn::load(insn::BPF_DW, insn::R0, insn::R8, pt_regs_off::ret()));
        self.list
            .emit(Insn::store(insn::BPF_DW, insn::R7, dmst_arg(1), insn::R0));
    }

    /// argv[0] from the trapping instruction pointer (profile/tick).
    pub fn copy_pc_from_regs(&mut self) {
        self.list
            .emit(Insn::load(insn::BPF_DW, insn::R0, insn::R8, pt_regs_off::ip()));
        self.list
            .emit(Insn::store(insn::BPF_DW, insn::R7, dmst_arg(0), insn::R0));
    }

    /// argv[0..n] copied directly from the kernel-supplied data area at
    /// `%r8 + base` (raw tracepoints, syscall tracepoints).
    pub fn copy_args_from_ctx(&mut self, base: i16, n: usize) {
        for i in 0..n.min(DMST_ARGC) {
            self.list.emit(Insn::load(
                insn::BPF_DW,
                insn::R0,
                insn::R8,
                base + (i * 8) as i16,
            ));
            self.list
                .emit(Insn::store(insn::BPF_DW, insn::R7, dmst_arg(i), insn::R0));
        }
    }

    /// Store an immediate into an argv slot.
    pub fn set_arg_imm(&mut self, n: usize, value: i32) {
        self.list.emit(Insn::store_imm(
            insn::BPF_DW,
            insn::FP,
            MST_FP_BASE + dmst_arg(n),
            value,
        ));
    }

    /// Save argv[0..n] into trampoline scratch slots (before running a
    /// dependent probe that rewrites them).
    pub fn save_args(&mut self, n: usize) {
        for i in 0..n.min(DMST_ARGC) {
            self.list
                .emit(Insn::load(insn::BPF_DW, insn::R0, insn::R7, dmst_arg(i)));
            self.list
                .emit(Insn::store(insn::BPF_DW, insn::FP, tramp_sp_slot(i), insn::R0));
        }
    }

    /// Restore argv[0..n] from the scratch slots.
    pub fn restore_args(&mut self, n: usize) {
        for i in 0..n.min(DMST_ARGC) {
            self.list
                .emit(Insn::load(insn::BPF_DW, insn::R0, insn::FP, tramp_sp_slot(i)));
            self.list
                .emit(Insn::store(insn::BPF_DW, insn::R7, dmst_arg(i), insn::R0));
        }
    }

    /// Exchange two argv slots (dependent probes that present the
    /// underlying arguments in a different order).
    pub fn swap_args(&mut self, a: usize, b: usize) {
        self.list
            .emit(Insn::load(insn::BPF_DW, insn::R0, insn::R7, dmst_arg(a)));
        self.list
            .emit(Insn::load(insn::BPF_DW, insn::R1, insn::R7, dmst_arg(b)));
        self.list
            .emit(Insn::store(insn::BPF_DW, insn::R7, dmst_arg(b), insn::R0));
        self.list
            .emit(Insn::store(insn::BPF_DW, insn::R7, dmst_arg(a), insn::R1));
    }

    /// Record a probe identity other than the builder's own (dependent
    /// and pid probes multiplex several probes over one program).
    pub fn set_prid(&mut self, prid: u32) {
        self.list.emit(Insn::store_imm(
            insn::BPF_W,
            insn::FP,
            MST_FP_BASE + DMST_PRID,
            prid as i32,
        ));
    }

    /// Call the given clauses in order, each optionally gated by its
    /// predicate.  The kernel context is re-established in `%r1` and the
    /// dctx pointer passed in `%r2` for every call.
    pub fn call_clauses(&mut self, clauses: &[Clause]) -> Result<()> {
        if clauses.is_empty() {
            return Err(Error::Unresolved("no clauses attached".to_string()));
        }
        for clause in clauses {
            let next = self.list.new_label();

            if let Some(pred) = clause.pred_id {
                self.list.emit(Insn::mov_reg(insn::R1, insn::R8));
                self.list.emit(Insn::mov_reg(insn::R2, insn::R9));
                self.list.emit_call_func(pred);
                self.list
                    .emit_branch_imm(insn::BPF_JEQ, insn::R0, 0, next);
            }

            self.list.emit(Insn::mov_reg(insn::R1, insn::R8));
            self.list.emit(Insn::mov_reg(insn::R2, insn::R9));
            self.list.emit_call_func(clause.func_id);
            self.list.label(next);
        }
        Ok(())
    }

    /// Jump to the exit label.
    pub fn goto_exit(&mut self) {
        let exit = self.exitlbl;
        self.list.emit_jump(exit);
    }

    /// Emit the epilogue and assemble.  The last clause's return value is
    /// returned verbatim; arrivals via the exit label return 0.
    pub fn epilogue(mut self) -> Program {
        // A fresh r0 for fall-through exits is NOT set here: the clause
        // return value must survive.  Error paths entering at the exit
        // label have set r0 themselves or rely on the zeroing below.
        let end = self.list.new_label();
        self.list.emit_jump(end);
        self.list.label(self.exitlbl);
        self.list.emit(Insn::mov_imm(insn::R0, 0));
        self.list.label(end);
        self.list.emit(Insn::exit());
        self.list.assemble()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::insn::{BPF_DW, BPF_MEM, BPF_STX, FP, R7, R8};

    #[test]
    fn prologue_establishes_conventions() {
        let mut tb = TrampolineBuilder::new(7);
        tb.prologue();
        let prog = tb.epilogue();

        // First instruction parks the context pointer in the dctx slot.
        assert_eq!(prog.insns[0].code, BPF_STX | BPF_MEM | BPF_DW);
        assert_eq!(prog.insns[0].dst, FP);
        assert_eq!(prog.insns[0].off, DCTX_FP_BASE + DCTX_CTX);

        // The argv-zeroing stores all land inside the machine state.
        let zeroed: Vec<i16> = prog
            .insns
            .iter()
            .filter(|i| i.code == 0x7a && i.imm == 0 && i.off >= MST_FP_BASE + dmst_arg(0))
            .map(|i| i.off)
            .collect();
        assert_eq!(zeroed.len(), DMST_ARGC);
    }

    #[test]
    fn arg_copy_uses_parameter_registers() {
        let mut tb = TrampolineBuilder::new(1);
        tb.prologue();
        let before = tb.list.len();
        tb.copy_args_from_regs(false);
        assert_eq!(tb.list.len() - before, 12); // six load/store pairs

        let prog = tb.epilogue();
        // Loads come from the context register, stores go through r7.
        let pair: Vec<_> = prog.insns[before..before + 2].to_vec();
        assert_eq!(pair[0].src, R8);
        assert_eq!(pair[0].off, pt_regs_off::arg(0));
        assert_eq!(pair[1].dst, R7);
        assert_eq!(pair[1].off, dmst_arg(0));
    }

    #[test]
    fn clause_calls_are_predicated_and_relocated() {
        let mut tb = TrampolineBuilder::new(1);
        tb.prologue();
        tb.call_clauses(&[Clause {
            func_id: 100,
            pred_id: Some(99),
        }])
        .unwrap();
        let prog = tb.epilogue();

        let ids: Vec<u32> = prog.relocs.iter().map(|r| r.func_id).collect();
        assert_eq!(ids, vec![99, 100]);

        // The predicate branch skips exactly the clause call sequence.
        let pred_pc = prog.relocs[0].pc;
        let branch = prog.insns[pred_pc + 1];
        assert_eq!(branch.off, 3);
    }

    #[test]
    fn no_clauses_is_an_emitter_failure() {
        let mut tb = TrampolineBuilder::new(1);
        tb.prologue();
        assert!(tb.call_clauses(&[]).is_err());
    }
}
