//! Userspace interpreter for seccomp-BPF programs.
//!
//! The unotify monitor receives raw `seccomp_data` and must reconstruct
//! which verdict the *original* (untransformed) policy would have produced
//! for it. Running the program here is the only way to do that faithfully.
//! The same interpreter backs the policy tests: a compiled program can be
//! probed against synthetic syscalls without touching the kernel.
//!
//! The instruction set is the classic-BPF subset a seccomp filter can
//! legally contain. Execution is bounds-checked; forward-only jumps make
//! every run terminate.

use thiserror::Error;

use warden_sys::bpf::{
    bpf_op, bpf_src, SockFilter, BPF_A, BPF_ABS, BPF_ADD, BPF_ALU, BPF_AND, BPF_DIV, BPF_IMM,
    BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_JSET, BPF_K, BPF_LD, BPF_LDX, BPF_LEN,
    BPF_LSH, BPF_MEM, BPF_MISC, BPF_MUL, BPF_NEG, BPF_OR, BPF_RET, BPF_RSH, BPF_ST, BPF_STX,
    BPF_SUB, BPF_TAX, BPF_TXA, BPF_W, BPF_X, BPF_XOR,
};
use warden_sys::seccomp::SeccompData;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("execution ran out of program bounds at pc {0}")]
    OutOfBounds(usize),

    #[error("misaligned or out-of-range data read (k={0})")]
    BadDataRead(u32),

    #[error("scratch memory index {0} out of range")]
    BadMemIndex(u32),

    #[error("division by zero at pc {0}")]
    DivByZero(usize),

    #[error("unsupported instruction {0:#06x} at pc {1}")]
    BadInstruction(u16, usize),
}

const SCRATCH_SLOTS: u32 = 16;

/// Read the aligned 32-bit word at byte offset `k` of `seccomp_data`.
fn read_data_word(data: &SeccompData, k: u32) -> Result<u32, EvalError> {
    if k % 4 != 0 || k as usize + 4 > size_of::<SeccompData>() {
        return Err(EvalError::BadDataRead(k));
    }
    Ok(match k {
        0 => data.nr as u32,
        4 => data.arch,
        8 => data.instruction_pointer as u32,
        12 => (data.instruction_pointer >> 32) as u32,
        _ => {
            let arg = (k - 16) / 8;
            let word = data.args[arg as usize];
            if (k - 16) % 8 == 0 {
                word as u32
            } else {
                (word >> 32) as u32
            }
        }
    })
}

fn alu(op: u16, a: u32, b: u32, pc: usize) -> Result<u32, EvalError> {
    Ok(match op {
        BPF_ADD => a.wrapping_add(b),
        BPF_SUB => a.wrapping_sub(b),
        BPF_MUL => a.wrapping_mul(b),
        BPF_DIV => {
            if b == 0 {
                return Err(EvalError::DivByZero(pc));
            }
            a / b
        }
        BPF_OR => a | b,
        BPF_AND => a & b,
        BPF_XOR => a ^ b,
        BPF_LSH => a.wrapping_shl(b),
        BPF_RSH => a.wrapping_shr(b),
        BPF_NEG => a.wrapping_neg(),
        _ => return Err(EvalError::BadInstruction(BPF_ALU | op, pc)),
    })
}

fn compare(op: u16, a: u32, b: u32, pc: usize) -> Result<bool, EvalError> {
    Ok(match op {
        BPF_JEQ => a == b,
        BPF_JGT => a > b,
        BPF_JGE => a >= b,
        BPF_JSET => a & b != 0,
        _ => return Err(EvalError::BadInstruction(BPF_JMP | op, pc)),
    })
}

/// Run `prog` against `data` and return the `SECCOMP_RET_*` verdict.
pub fn evaluate(prog: &[SockFilter], data: &SeccompData) -> Result<u32, EvalError> {
    let mut pc = 0usize;
    let mut acc = 0u32;
    let mut x = 0u32;
    let mut mem = [0u32; SCRATCH_SLOTS as usize];

    loop {
        let insn = prog.get(pc).ok_or(EvalError::OutOfBounds(pc))?;
        let mut offset = 0usize;
        match insn.code {
            code if code == BPF_LD | BPF_W | BPF_ABS => {
                acc = read_data_word(data, insn.k)?;
            }
            code if code == BPF_LD | BPF_W | BPF_LEN => {
                acc = size_of::<SeccompData>() as u32;
            }
            code if code == BPF_LDX | BPF_W | BPF_LEN => {
                x = size_of::<SeccompData>() as u32;
            }
            code if code == BPF_LD | BPF_IMM => acc = insn.k,
            code if code == BPF_LDX | BPF_IMM => x = insn.k,
            code if code == BPF_MISC | BPF_TAX => x = acc,
            code if code == BPF_MISC | BPF_TXA => acc = x,
            code if code == BPF_LD | BPF_MEM => {
                if insn.k >= SCRATCH_SLOTS {
                    return Err(EvalError::BadMemIndex(insn.k));
                }
                acc = mem[insn.k as usize];
            }
            code if code == BPF_LDX | BPF_MEM => {
                if insn.k >= SCRATCH_SLOTS {
                    return Err(EvalError::BadMemIndex(insn.k));
                }
                x = mem[insn.k as usize];
            }
            code if code == BPF_ST => {
                if insn.k >= SCRATCH_SLOTS {
                    return Err(EvalError::BadMemIndex(insn.k));
                }
                mem[insn.k as usize] = acc;
            }
            code if code == BPF_STX => {
                if insn.k >= SCRATCH_SLOTS {
                    return Err(EvalError::BadMemIndex(insn.k));
                }
                mem[insn.k as usize] = x;
            }
            code if code == BPF_RET | BPF_K => return Ok(insn.k),
            code if code == BPF_RET | BPF_A => return Ok(acc),
            code if code & 0x07 == BPF_ALU => {
                let operand = if bpf_src(code) == BPF_K { insn.k } else { x };
                acc = alu(bpf_op(code), acc, operand, pc)?;
            }
            code if code & 0x07 == BPF_JMP && bpf_op(code) == BPF_JA => {
                offset = insn.k as usize;
            }
            code if code & 0x07 == BPF_JMP => {
                let operand = if bpf_src(code) == BPF_X { x } else { insn.k };
                let cond = compare(bpf_op(code), acc, operand, pc)?;
                offset = if cond {
                    insn.jt as usize
                } else {
                    insn.jf as usize
                };
            }
            code => return Err(EvalError::BadInstruction(code, pc)),
        }
        pc = pc
            .checked_add(1)
            .and_then(|p| p.checked_add(offset))
            .ok_or(EvalError::OutOfBounds(pc))?;
        if pc >= prog.len() {
            return Err(EvalError::OutOfBounds(pc));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_sys::bpf::{
        load_arch, load_arg_lo, load_syscall_nr, ret, ret_errno, SECCOMP_RET_ALLOW,
        SECCOMP_RET_ERRNO, SECCOMP_RET_KILL_PROCESS,
    };

    fn data(nr: i32, arch: u32, args: [u64; 6]) -> SeccompData {
        SeccompData {
            nr,
            arch,
            instruction_pointer: 0xdead_beef_0000_1111,
            args,
        }
    }

    #[test]
    fn returns_constant() {
        let prog = [ret(SECCOMP_RET_ALLOW)];
        assert_eq!(
            evaluate(&prog, &data(0, 0, [0; 6])).unwrap(),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn branches_on_syscall_nr() {
        let prog = [
            load_syscall_nr(),
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 60, 0, 1),
            ret(SECCOMP_RET_ALLOW),
            ret(SECCOMP_RET_KILL_PROCESS),
        ];
        assert_eq!(
            evaluate(&prog, &data(60, 0, [0; 6])).unwrap(),
            SECCOMP_RET_ALLOW
        );
        assert_eq!(
            evaluate(&prog, &data(61, 0, [0; 6])).unwrap(),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn reads_arch_and_args() {
        let prog = [
            load_arch(),
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 0x1234, 0, 2),
            load_arg_lo(2),
            ret(SECCOMP_RET_ERRNO | 0x10),
            ret(SECCOMP_RET_KILL_PROCESS),
        ];
        let mut args = [0u64; 6];
        args[2] = 0xffff_ffff_0000_0042;
        assert_eq!(
            evaluate(&prog, &data(0, 0x1234, args)).unwrap(),
            SECCOMP_RET_ERRNO | 0x10
        );
        assert_eq!(
            evaluate(&prog, &data(0, 0x9999, args)).unwrap(),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn arg_high_word_load() {
        let prog = [
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, 20), // args[0] hi
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 0xaabb, 0, 1),
            ret(SECCOMP_RET_ALLOW),
            ret(SECCOMP_RET_KILL_PROCESS),
        ];
        let mut args = [0u64; 6];
        args[0] = 0x0000_aabb_0000_0000;
        assert_eq!(
            evaluate(&prog, &data(0, 0, args)).unwrap(),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn misaligned_read_rejected() {
        let prog = [SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, 3), ret(0)];
        assert_eq!(
            evaluate(&prog, &data(0, 0, [0; 6])),
            Err(EvalError::BadDataRead(3))
        );
    }

    #[test]
    fn falling_off_the_end_rejected() {
        let prog = [load_syscall_nr()];
        assert_eq!(
            evaluate(&prog, &data(0, 0, [0; 6])),
            Err(EvalError::OutOfBounds(1))
        );
    }

    #[test]
    fn oob_jump_rejected() {
        let prog = [
            SockFilter::jump(BPF_JMP | BPF_JA, 10, 0, 0),
            ret(SECCOMP_RET_ALLOW),
        ];
        assert_eq!(
            evaluate(&prog, &data(0, 0, [0; 6])),
            Err(EvalError::OutOfBounds(11))
        );
    }

    #[test]
    fn alu_and_scratch_memory() {
        let prog = [
            SockFilter::stmt(BPF_LD | BPF_IMM, 6),
            SockFilter::stmt(BPF_ALU | BPF_MUL | BPF_K, 7),
            SockFilter::stmt(BPF_ST, 3),
            SockFilter::stmt(BPF_LD | BPF_IMM, 0),
            SockFilter::stmt(BPF_LD | BPF_MEM, 3),
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 42, 0, 1),
            ret(SECCOMP_RET_ALLOW),
            ret(SECCOMP_RET_KILL_PROCESS),
        ];
        assert_eq!(
            evaluate(&prog, &data(0, 0, [0; 6])).unwrap(),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn errno_verdict_carries_payload() {
        let prog = [ret_errno(libc::EPERM as u16)];
        let verdict = evaluate(&prog, &data(0, 0, [0; 6])).unwrap();
        assert_eq!(verdict & 0xffff, libc::EPERM as u32);
    }
}
