//! Register access for traced sandboxees.

use std::io;

use crate::syscall::{CpuArch, Syscall};

/// A snapshot of a stopped tracee's general-purpose registers.
#[derive(Debug, Clone, Copy)]
pub struct Regs {
    pid: libc::pid_t,
    inner: libc::user_regs_struct,
}

impl Regs {
    /// Fetch the registers of a ptrace-stopped process.
    pub fn fetch(pid: libc::pid_t) -> io::Result<Self> {
        // SAFETY: zeroed user_regs_struct is a valid out-buffer.
        let mut inner: libc::user_regs_struct = unsafe { std::mem::zeroed() };

        #[cfg(target_arch = "x86_64")]
        // SAFETY: PTRACE_GETREGS writes sizeof(user_regs_struct) bytes.
        let ret = unsafe { libc::ptrace(libc::PTRACE_GETREGS, pid, 0, &mut inner) };

        #[cfg(not(target_arch = "x86_64"))]
        let ret = {
            let mut iov = libc::iovec {
                iov_base: (&mut inner as *mut libc::user_regs_struct).cast(),
                iov_len: size_of::<libc::user_regs_struct>(),
            };
            const NT_PRSTATUS: libc::c_int = 1;
            // SAFETY: iov describes a live buffer of the right size.
            unsafe { libc::ptrace(libc::PTRACE_GETREGSET, pid, NT_PRSTATUS, &mut iov) }
        };

        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { pid, inner })
    }

    /// The syscall this stop describes, per the seccomp-trace ABI.
    pub fn syscall(&self, arch: CpuArch) -> Syscall {
        #[cfg(target_arch = "x86_64")]
        {
            let r = &self.inner;
            Syscall::new(
                arch,
                r.orig_rax as i64,
                [r.rdi, r.rsi, r.rdx, r.r10, r.r8, r.r9],
                self.pid,
                r.rip,
            )
        }
        #[cfg(target_arch = "aarch64")]
        {
            let r = &self.inner;
            Syscall::new(
                arch,
                r.regs[8] as i64,
                [r.regs[0], r.regs[1], r.regs[2], r.regs[3], r.regs[4], r.regs[5]],
                self.pid,
                r.pc,
            )
        }
    }

    pub fn instruction_pointer(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            self.inner.rip
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.inner.pc
        }
    }

    pub fn frame_pointer(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            self.inner.rbp
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.inner.regs[29]
        }
    }
}
