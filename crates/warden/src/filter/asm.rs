//! Assembler for seccomp-BPF programs.
//!
//! Classic BPF makes linear filters awkward to compose: conditional jumps
//! hold 8-bit forward offsets, so fragments cannot be relocated without
//! re-resolving every jump, and any span beyond 255 instructions needs an
//! intermediate hop. This assembler hides all of that:
//!
//! - code is emitted against symbolic [`Label`]s instead of offsets
//! - a final pass resolves labels to instruction offsets
//! - a conditional jump whose span exceeds 255 instructions is rewritten
//!   into an inverted short jump over a `BPF_JA` trampoline (whose `k`
//!   field is 32 bits wide), transparently to the caller
//!
//! Resolution is a fixpoint: inserting a trampoline widens the program,
//! which may push another jump past the limit. Widths only ever grow, so
//! the loop terminates.
//!
//! [`finish`](BpfAssembler::finish) runs [`validate`] on the emitted
//! program; a program that leaves the assembler is bit-exact installable.

use thiserror::Error;

use warden_sys::bpf::{
    bpf_class, bpf_op, SockFilter, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_JSET, BPF_K,
    BPF_RET,
};

/// Kernel limit on classic-BPF program length.
pub const BPF_MAXINSNS: usize = 4096;

const MAX_SHORT_JUMP: usize = u8::MAX as usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("label {0} was never bound")]
    UnboundLabel(usize),

    #[error("label {0} bound twice")]
    RebindLabel(usize),

    #[error("jump at slot {0} targets an earlier position; BPF jumps are forward-only")]
    BackwardJump(usize),

    #[error("instruction {0} jumps out of program bounds")]
    OutOfBoundsJump(usize),

    #[error("program length {0} exceeds BPF_MAXINSNS ({BPF_MAXINSNS})")]
    ProgramTooLong(usize),

    #[error("program is empty")]
    EmptyProgram,

    #[error("last instruction is not a return")]
    MissingReturn,

    #[error("embedded fragment instruction {0} jumps past the fragment")]
    FragmentOutOfBounds(usize),
}

/// A forward reference into the program being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum Slot {
    Fixed(SockFilter),
    /// Jump to `target` when the comparison holds, else fall through.
    JumpIf { op: u16, k: u32, target: Label },
    /// Fall through when the comparison holds, else jump to `target`.
    JumpUnless { op: u16, k: u32, target: Label },
    Goto(Label),
}

#[derive(Default)]
pub struct BpfAssembler {
    slots: Vec<Slot>,
    labels: Vec<Option<usize>>,
}

impl BpfAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position.
    pub fn bind(&mut self, label: Label) -> Result<(), AssembleError> {
        let slot = self
            .labels
            .get_mut(label.0)
            .ok_or(AssembleError::UnboundLabel(label.0))?;
        if slot.is_some() {
            return Err(AssembleError::RebindLabel(label.0));
        }
        *slot = Some(self.slots.len());
        Ok(())
    }

    /// Emit one fully encoded instruction as-is.
    pub fn push(&mut self, insn: SockFilter) {
        self.slots.push(Slot::Fixed(insn));
    }

    /// Jump to `target` if `A <op> k` holds.
    pub fn jump_if(&mut self, op: u16, k: u32, target: Label) {
        self.slots.push(Slot::JumpIf { op, k, target });
    }

    /// Jump to `target` if `A <op> k` does *not* hold.
    pub fn jump_unless(&mut self, op: u16, k: u32, target: Label) {
        self.slots.push(Slot::JumpUnless { op, k, target });
    }

    pub fn jeq(&mut self, k: u32, target: Label) {
        self.jump_if(BPF_JEQ, k, target);
    }

    pub fn jne(&mut self, k: u32, target: Label) {
        self.jump_unless(BPF_JEQ, k, target);
    }

    pub fn jset(&mut self, k: u32, target: Label) {
        self.jump_if(BPF_JSET, k, target);
    }

    pub fn jgt(&mut self, k: u32, target: Label) {
        self.jump_if(BPF_JGT, k, target);
    }

    pub fn jge(&mut self, k: u32, target: Label) {
        self.jump_if(BPF_JGE, k, target);
    }

    /// Unconditional jump to `target`.
    pub fn jump(&mut self, target: Label) {
        self.slots.push(Slot::Goto(target));
    }

    /// Splice in a pre-built fragment. Its internal jumps must stay inside
    /// the fragment; an offset landing exactly one past the end means "fall
    /// through to whatever is emitted next" and is allowed.
    pub fn append_fragment(&mut self, fragment: &[SockFilter]) -> Result<(), AssembleError> {
        for (i, insn) in fragment.iter().enumerate() {
            if bpf_class(insn.code) == BPF_JMP {
                let next = i + 1;
                let (jt_target, jf_target) = if bpf_op(insn.code) == BPF_JA {
                    (next + insn.k as usize, next)
                } else {
                    (next + insn.jt as usize, next + insn.jf as usize)
                };
                if jt_target > fragment.len() || jf_target > fragment.len() {
                    return Err(AssembleError::FragmentOutOfBounds(i));
                }
            }
        }
        for insn in fragment {
            self.push(*insn);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Resolve all labels and emit the final program.
    pub fn finish(self) -> Result<Vec<SockFilter>, AssembleError> {
        // Every label must be bound before resolution.
        let mut targets = Vec::with_capacity(self.labels.len());
        for (i, bound) in self.labels.iter().enumerate() {
            targets.push(bound.ok_or(AssembleError::UnboundLabel(i))?);
        }

        // Width of each slot in emitted instructions. A conditional jump
        // grows to 2 when its span no longer fits the 8-bit offset.
        let mut widths = vec![1usize; self.slots.len()];
        let mut offsets = vec![0usize; self.slots.len() + 1];
        loop {
            for i in 0..self.slots.len() {
                offsets[i + 1] = offsets[i] + widths[i];
            }

            let mut widened = false;
            for (i, slot) in self.slots.iter().enumerate() {
                let (target, conditional) = match slot {
                    Slot::Fixed(_) => continue,
                    Slot::JumpIf { target, .. } | Slot::JumpUnless { target, .. } => (target, true),
                    Slot::Goto(target) => (target, false),
                };
                let target_slot = targets[target.0];
                if target_slot < i + 1 {
                    return Err(AssembleError::BackwardJump(i));
                }
                if !conditional {
                    continue;
                }
                // Span measured from the instruction after the (short form)
                // jump to the target.
                let span = offsets[target_slot] - (offsets[i] + 1);
                if span > MAX_SHORT_JUMP && widths[i] == 1 {
                    widths[i] = 2;
                    widened = true;
                }
            }
            if !widened {
                break;
            }
        }

        let total = offsets[self.slots.len()];
        let mut prog = Vec::with_capacity(total);
        for (i, slot) in self.slots.iter().enumerate() {
            match *slot {
                Slot::Fixed(insn) => prog.push(insn),
                Slot::Goto(target) => {
                    let span = offsets[targets[target.0]] - (offsets[i] + 1);
                    prog.push(SockFilter::jump(BPF_JMP | BPF_JA, span as u32, 0, 0));
                }
                Slot::JumpIf { op, k, target } => {
                    let span = offsets[targets[target.0]] - (offsets[i] + widths[i]);
                    if widths[i] == 1 {
                        prog.push(SockFilter::jump(BPF_JMP | op | BPF_K, k, span as u8, 0));
                    } else {
                        // Long form: hop over the trampoline when the
                        // condition fails.
                        prog.push(SockFilter::jump(BPF_JMP | op | BPF_K, k, 0, 1));
                        prog.push(SockFilter::jump(BPF_JMP | BPF_JA, span as u32, 0, 0));
                    }
                }
                Slot::JumpUnless { op, k, target } => {
                    let span = offsets[targets[target.0]] - (offsets[i] + widths[i]);
                    if widths[i] == 1 {
                        prog.push(SockFilter::jump(BPF_JMP | op | BPF_K, k, 0, span as u8));
                    } else {
                        prog.push(SockFilter::jump(BPF_JMP | op | BPF_K, k, 1, 0));
                        prog.push(SockFilter::jump(BPF_JMP | BPF_JA, span as u32, 0, 0));
                    }
                }
            }
        }
        debug_assert_eq!(prog.len(), total);

        validate(&prog)?;
        Ok(prog)
    }
}

/// Static checks on an emitted program:
///
/// - non-empty, at most `BPF_MAXINSNS` instructions
/// - every jump target lies inside `[0, len)`
/// - the final instruction is a return
///
/// Together with BPF's forward-only jumps this guarantees every execution
/// path reaches a terminal action.
pub fn validate(prog: &[SockFilter]) -> Result<(), AssembleError> {
    if prog.is_empty() {
        return Err(AssembleError::EmptyProgram);
    }
    if prog.len() > BPF_MAXINSNS {
        return Err(AssembleError::ProgramTooLong(prog.len()));
    }
    for (i, insn) in prog.iter().enumerate() {
        if bpf_class(insn.code) != BPF_JMP {
            continue;
        }
        let next = i + 1;
        if bpf_op(insn.code) == BPF_JA {
            if next + insn.k as usize >= prog.len() {
                return Err(AssembleError::OutOfBoundsJump(i));
            }
        } else {
            if next + insn.jt as usize >= prog.len()
                || next + insn.jf as usize >= prog.len()
            {
                return Err(AssembleError::OutOfBoundsJump(i));
            }
        }
    }
    if bpf_class(prog[prog.len() - 1].code) != BPF_RET {
        return Err(AssembleError::MissingReturn);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::eval::evaluate;
    use warden_sys::bpf::{
        load_syscall_nr, ret, SECCOMP_RET_ALLOW, SECCOMP_RET_KILL_PROCESS,
    };
    use warden_sys::seccomp::SeccompData;

    fn data_for_nr(nr: i32) -> SeccompData {
        SeccompData {
            nr,
            arch: warden_sys::bpf::host_audit_arch(),
            instruction_pointer: 0,
            args: [0; 6],
        }
    }

    #[test]
    fn short_jump_resolution() {
        let mut asm = BpfAssembler::new();
        let allow = asm.label();
        asm.push(load_syscall_nr());
        asm.jeq(42, allow);
        asm.push(ret(SECCOMP_RET_KILL_PROCESS));
        asm.bind(allow).unwrap();
        asm.push(ret(SECCOMP_RET_ALLOW));
        let prog = asm.finish().unwrap();

        assert_eq!(prog.len(), 4);
        assert_eq!(prog[1].jt, 1);
        assert_eq!(evaluate(&prog, &data_for_nr(42)).unwrap(), SECCOMP_RET_ALLOW);
        assert_eq!(
            evaluate(&prog, &data_for_nr(43)).unwrap(),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn long_span_gets_trampoline() {
        let mut asm = BpfAssembler::new();
        let allow = asm.label();
        asm.push(load_syscall_nr());
        asm.jeq(7, allow);
        // Filler far beyond the 255-instruction reach of a short jump.
        for _ in 0..300 {
            asm.push(load_syscall_nr());
        }
        asm.push(ret(SECCOMP_RET_KILL_PROCESS));
        asm.bind(allow).unwrap();
        asm.push(ret(SECCOMP_RET_ALLOW));
        let prog = asm.finish().unwrap();

        // 1 load + 2 (expanded jump) + 300 filler + 2 returns.
        assert_eq!(prog.len(), 305);
        assert_eq!(evaluate(&prog, &data_for_nr(7)).unwrap(), SECCOMP_RET_ALLOW);
        assert_eq!(
            evaluate(&prog, &data_for_nr(8)).unwrap(),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn jump_unless_inverts() {
        let mut asm = BpfAssembler::new();
        let kill = asm.label();
        asm.push(load_syscall_nr());
        asm.jne(1, kill);
        asm.push(ret(SECCOMP_RET_ALLOW));
        asm.bind(kill).unwrap();
        asm.push(ret(SECCOMP_RET_KILL_PROCESS));
        let prog = asm.finish().unwrap();

        assert_eq!(evaluate(&prog, &data_for_nr(1)).unwrap(), SECCOMP_RET_ALLOW);
        assert_eq!(
            evaluate(&prog, &data_for_nr(2)).unwrap(),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn unbound_label_fails() {
        let mut asm = BpfAssembler::new();
        let dangling = asm.label();
        asm.push(load_syscall_nr());
        asm.jeq(1, dangling);
        asm.push(ret(SECCOMP_RET_KILL_PROCESS));
        assert!(matches!(
            asm.finish(),
            Err(AssembleError::UnboundLabel(_))
        ));
    }

    #[test]
    fn backward_jump_rejected() {
        let mut asm = BpfAssembler::new();
        let back = asm.label();
        asm.bind(back).unwrap();
        asm.push(load_syscall_nr());
        asm.jeq(1, back);
        asm.push(ret(SECCOMP_RET_KILL_PROCESS));
        assert!(matches!(asm.finish(), Err(AssembleError::BackwardJump(_))));
    }

    #[test]
    fn fragment_with_oob_jump_rejected() {
        let mut asm = BpfAssembler::new();
        let fragment = [
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 1, 5, 0),
            ret(SECCOMP_RET_ALLOW),
        ];
        assert_eq!(
            asm.append_fragment(&fragment),
            Err(AssembleError::FragmentOutOfBounds(0))
        );
    }

    #[test]
    fn fragment_fallthrough_at_end_allowed() {
        let mut asm = BpfAssembler::new();
        let fragment = [SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, 0)];
        asm.append_fragment(&fragment).unwrap();
        asm.push(ret(SECCOMP_RET_ALLOW));
        let prog = asm.finish().unwrap();
        assert_eq!(prog.len(), 2);
    }

    #[test]
    fn validate_catches_oob_and_missing_return() {
        let oob = [SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 1, 9, 0), ret(0)];
        assert_eq!(validate(&oob), Err(AssembleError::OutOfBoundsJump(0)));

        let no_ret = [load_syscall_nr()];
        assert_eq!(validate(&no_ret), Err(AssembleError::MissingReturn));

        assert_eq!(validate(&[]), Err(AssembleError::EmptyProgram));

        let ok = [load_syscall_nr(), ret(SECCOMP_RET_ALLOW)];
        assert!(validate(&ok).is_ok());
    }

    #[test]
    fn rebind_rejected() {
        let mut asm = BpfAssembler::new();
        let l = asm.label();
        asm.bind(l).unwrap();
        assert_eq!(asm.bind(l), Err(AssembleError::RebindLabel(0)));
    }
}
