//! A small BPF instruction model: enough to emit trampolines and verify
//! them in tests, with label-based branches and call relocations against
//! externally compiled clause functions.

/// BPF registers.
pub const R0: u8 = 0;
pub const R1: u8 = 1;
pub const R2: u8 = 2;
pub const R3: u8 = 3;
pub const R4: u8 = 4;
pub const R5: u8 = 5;
pub const R6: u8 = 6;
pub const R7: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const FP: u8 = 10;

// Instruction classes.
pub const BPF_LD: u8 = 0x00;
pub const BPF_LDX: u8 = 0x01;
pub const BPF_ST: u8 = 0x02;
pub const BPF_STX: u8 = 0x03;
pub const BPF_ALU: u8 = 0x04;
pub const BPF_JMP: u8 = 0x05;
pub const BPF_ALU64: u8 = 0x07;

// Size modifiers.
pub const BPF_W: u8 = 0x00;
pub const BPF_H: u8 = 0x08;
pub const BPF_B: u8 = 0x10;
pub const BPF_DW: u8 = 0x18;

// Mode modifiers.
pub const BPF_IMM: u8 = 0x00;
pub const BPF_MEM: u8 = 0x60;

// ALU/JMP operation codes.
pub const BPF_ADD: u8 = 0x00;
pub const BPF_SUB: u8 = 0x10;
pub const BPF_MUL: u8 = 0x20;
pub const BPF_DIV: u8 = 0x30;
pub const BPF_OR: u8 = 0x40;
pub const BPF_AND: u8 = 0x50;
pub const BPF_LSH: u8 = 0x60;
pub const BPF_RSH: u8 = 0x70;
pub const BPF_MOV: u8 = 0xb0;
pub const BPF_ARSH: u8 = 0xc0;

pub const BPF_JA: u8 = 0x00;
pub const BPF_JEQ: u8 = 0x10;
pub const BPF_JGT: u8 = 0x20;
pub const BPF_JGE: u8 = 0x30;
pub const BPF_JSET: u8 = 0x40;
pub const BPF_JNE: u8 = 0x50;
pub const BPF_CALL: u8 = 0x80;
pub const BPF_EXIT: u8 = 0x90;

pub const BPF_K: u8 = 0x00;
pub const BPF_X: u8 = 0x08;

/// BPF helper function numbers the emitters use.
pub mod helpers {
    pub const BPF_FUNC_MAP_LOOKUP_ELEM: i32 = 1;
    pub const BPF_FUNC_PROBE_READ: i32 = 4;
    pub const BPF_FUNC_KTIME_GET_NS: i32 = 5;
    pub const BPF_FUNC_GET_CURRENT_PID_TGID: i32 = 14;
    pub const BPF_FUNC_PERF_EVENT_OUTPUT: i32 = 25;
    pub const BPF_FUNC_PROBE_WRITE_USER: i32 = 36;
}

/// One fixed-size BPF instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Insn {
    pub code: u8,
    pub dst: u8,
    pub src: u8,
    pub off: i16,
    pub imm: i32,
}

impl Insn {
    pub fn encode(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[0] = self.code;
        bytes[1] = (self.src << 4) | (self.dst & 0xf);
        bytes[2..4].copy_from_slice(&self.off.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.imm.to_ne_bytes());
        u64::from_ne_bytes(bytes)
    }

    /// dst = *(size *)(src + off)
    pub fn load(size: u8, dst: u8, src: u8, off: i16) -> Insn {
        Insn {
            code: BPF_LDX | BPF_MEM | size,
            dst,
            src,
            off,
            imm: 0,
        }
    }

    /// *(size *)(dst + off) = src
    pub fn store(size: u8, dst: u8, off: i16, src: u8) -> Insn {
        Insn {
            code: BPF_STX | BPF_MEM | size,
            dst,
            src,
            off,
            imm: 0,
        }
    }

    /// *(size *)(dst + off) = imm
    pub fn store_imm(size: u8, dst: u8, off: i16, imm: i32) -> Insn {
        Insn {
            code: BPF_ST | BPF_MEM | size,
            dst,
            src: 0,
            off,
            imm,
        }
    }

    pub fn mov_reg(dst: u8, src: u8) -> Insn {
        Insn {
            code: BPF_ALU64 | BPF_MOV | BPF_X,
            dst,
            src,
            off: 0,
            imm: 0,
        }
    }

    pub fn mov_imm(dst: u8, imm: i32) -> Insn {
        Insn {
            code: BPF_ALU64 | BPF_MOV | BPF_K,
            dst,
            src: 0,
            off: 0,
            imm,
        }
    }

    pub fn alu64_imm(op: u8, dst: u8, imm: i32) -> Insn {
        Insn {
            code: BPF_ALU64 | op | BPF_K,
            dst,
            src: 0,
            off: 0,
            imm,
        }
    }

    pub fn alu64_reg(op: u8, dst: u8, src: u8) -> Insn {
        Insn {
            code: BPF_ALU64 | op | BPF_X,
            dst,
            src,
            off: 0,
            imm: 0,
        }
    }

    /// A helper call.
    pub fn call_helper(helper: i32) -> Insn {
        Insn {
            code: BPF_JMP | BPF_CALL,
            dst: 0,
            src: 0,
            off: 0,
            imm: helper,
        }
    }

    /// A BPF-to-BPF call to an external function; the immediate is a
    /// function id resolved by the external linker via relocation.
    pub fn call_func(func_id: u32) -> Insn {
        Insn {
            code: BPF_JMP | BPF_CALL,
            dst: 0,
            src: 1, // BPF_PSEUDO_CALL
            off: 0,
            imm: func_id as i32,
        }
    }

    pub fn exit() -> Insn {
        Insn {
            code: BPF_JMP | BPF_EXIT,
            dst: 0,
            src: 0,
            off: 0,
            imm: 0,
        }
    }

    fn branch_imm(op: u8, dst: u8, imm: i32) -> Insn {
        Insn {
            code: BPF_JMP | op | BPF_K,
            dst,
            src: 0,
            off: 0,
            imm,
        }
    }

    fn jump() -> Insn {
        Insn {
            code: BPF_JMP | BPF_JA,
            dst: 0,
            src: 0,
            off: 0,
            imm: 0,
        }
    }
}

pub type Label = u32;

/// An external-call relocation: instruction index and the function id it
/// must be resolved against.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reloc {
    pub pc: usize,
    pub func_id: u32,
}

/// An assembled trampoline image.
pub struct Program {
    pub insns: Vec<Insn>,
    pub relocs: Vec<Reloc>,
}

impl Program {
    pub fn encoded(&self) -> Vec<u64> {
        self.insns.iter().map(|i| i.encode()).collect()
    }
}

enum Slot {
    Plain(Insn),
    /// A branch whose offset is a label, patched at assembly.
    Branch(Insn, Label),
    /// An external call recorded as a relocation.
    ExtCall(Insn, u32),
}

/// An instruction list under construction: append-only, with labels
/// resolved to pc-relative offsets at assembly time.
pub struct InsnList {
    slots: Vec<Slot>,
    labels: Vec<(usize, Label)>,
    next_label: Label,
}

impl Default for InsnList {
    fn default() -> Self {
        InsnList::new()
    }
}

impl InsnList {
    pub fn new() -> InsnList {
        InsnList {
            slots: Vec::new(),
            labels: Vec::new(),
            next_label: 0,
        }
    }

    pub fn new_label(&mut self) -> Label {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    /// Attach a label to the next emitted instruction.
    pub fn label(&mut self, label: Label) {
        self.labels.push((self.slots.len(), label));
    }

    pub fn emit(&mut self, insn: Insn) {
        self.slots.push(Slot::Plain(insn));
    }

    pub fn emit_branch_imm(&mut self, op: u8, dst: u8, imm: i32, target: Label) {
        self.slots
            .push(Slot::Branch(Insn::branch_imm(op, dst, imm), target));
    }

    pub fn emit_jump(&mut self, target: Label) {
        self.slots.push(Slot::Branch(Insn::jump(), target));
    }

    /// Call an externally compiled function (a clause or predicate) by
    /// its function id.
    pub fn emit_call_func(&mut self, func_id: u32) {
        self.slots
            .push(Slot::ExtCall(Insn::call_func(func_id), func_id));
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Resolve labels and produce the final image.
    pub fn assemble(self) -> Program {
        let mut label_pc = std::collections::HashMap::new();
        for (pos, label) in &self.labels {
            label_pc.insert(*label, *pos);
        }

        let total = self.slots.len();
        let mut insns = Vec::with_capacity(total);
        let mut relocs = Vec::new();
        for (pc, slot) in self.slots.into_iter().enumerate() {
            match slot {
                Slot::Plain(i) => insns.push(i),
                Slot::Branch(mut i, target) => {
                    // A label never attached to an instruction points one
                    // past the end.
                    let tpc = label_pc.get(&target).copied().unwrap_or(total);
                    i.off = (tpc as i64 - pc as i64 - 1) as i16;
                    insns.push(i);
                }
                Slot::ExtCall(i, func_id) => {
                    relocs.push(Reloc { pc, func_id });
                    insns.push(i);
                }
            }
        }

        Program { insns, relocs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_matches_kernel_layout() {
        // mov r2, r10 encodes class ALU64|MOV|X with regs packed
        // src-high/dst-low.
        let i = Insn::mov_reg(R2, FP);
        let enc = i.encode().to_ne_bytes();
        assert_eq!(enc[0], 0xbf);
        assert_eq!(enc[1], 0xa2);

        let i = Insn::store_imm(BPF_DW, FP, -8, 7);
        let enc = i.encode().to_ne_bytes();
        assert_eq!(enc[0], 0x7a);
        assert_eq!(i16::from_ne_bytes([enc[2], enc[3]]), -8);
        assert_eq!(i32::from_ne_bytes([enc[4], enc[5], enc[6], enc[7]]), 7);
    }

    #[test]
    fn branches_resolve_forward_and_to_end() {
        let mut l = InsnList::new();
        let skip = l.new_label();
        let end = l.new_label();

        l.emit_branch_imm(BPF_JEQ, R0, 0, skip); // 0
        l.emit(Insn::mov_imm(R0, 1)); // 1
        l.emit_jump(end); // 2
        l.label(skip);
        l.emit(Insn::mov_imm(R0, 2)); // 3
        l.label(end);
        l.emit(Insn::exit()); // 4

        let prog = l.assemble();
        assert_eq!(prog.insns[0].off, 2); // 0 -> 3
        assert_eq!(prog.insns[2].off, 1); // 2 -> 4
    }

    #[test]
    fn external_calls_are_relocated() {
        let mut l = InsnList::new();
        l.emit(Insn::mov_reg(R1, R6));
        l.emit_call_func(42);
        l.emit(Insn::exit());
        let prog = l.assemble();
        assert_eq!(prog.relocs, vec![Reloc { pc: 1, func_id: 42 }]);
        assert_eq!(prog.insns[1].src, 1);
    }

    #[test]
    fn exit_label_past_last_insn() {
        let mut l = InsnList::new();
        let exit = l.new_label();
        l.emit_branch_imm(BPF_JNE, R0, 3, exit); // 0 -> 2 (one past end... )
        l.emit(Insn::mov_imm(R0, 0)); // 1
        l.label(exit);
        l.emit(Insn::exit()); // 2
        let prog = l.assemble();
        assert_eq!(prog.insns[0].off, 1);
    }
}
