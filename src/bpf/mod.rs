//! BPF instruction emission, the fixed trampoline context layout, and
//! the program-load/attach syscall layer.

pub mod dctx;
pub mod insn;
pub mod syscall;
pub mod tramp;

pub use insn::{Insn, InsnList, Label, Program, Reloc};
pub use syscall::ProgType;
pub use tramp::{Clause, TrampolineBuilder};
