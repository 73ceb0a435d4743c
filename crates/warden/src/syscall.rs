//! Syscall records as observed by the monitors.

use warden_sys::bpf::{
    host_audit_arch, AUDIT_ARCH_AARCH64, AUDIT_ARCH_ARM, AUDIT_ARCH_I386, AUDIT_ARCH_PPC64LE,
    AUDIT_ARCH_X86_64,
};

/// CPU architecture a syscall was issued under.
///
/// The discriminants double as the `SECCOMP_RET_DATA` payload of trace
/// verdicts, so the ptrace monitor can recover the architecture from the
/// event message without re-reading the filter.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    Unknown = 0,
    X8664 = 1,
    X86 = 2,
    Arm64 = 3,
    Arm = 4,
    Ppc64Le = 5,
}

impl CpuArch {
    pub fn host() -> Self {
        Self::from_audit(host_audit_arch())
    }

    pub fn from_audit(arch: u32) -> Self {
        match arch {
            AUDIT_ARCH_X86_64 => Self::X8664,
            AUDIT_ARCH_I386 => Self::X86,
            AUDIT_ARCH_AARCH64 => Self::Arm64,
            AUDIT_ARCH_ARM => Self::Arm,
            AUDIT_ARCH_PPC64LE => Self::Ppc64Le,
            _ => Self::Unknown,
        }
    }

    pub fn from_trace_data(data: u16) -> Self {
        match data {
            1 => Self::X8664,
            2 => Self::X86,
            3 => Self::Arm64,
            4 => Self::Arm,
            5 => Self::Ppc64Le,
            _ => Self::Unknown,
        }
    }

    pub const fn trace_data(self) -> u16 {
        self as u16
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::X8664 => "x86_64",
            Self::X86 => "x86",
            Self::Arm64 => "arm64",
            Self::Arm => "arm",
            Self::Ppc64Le => "ppc64le",
        }
    }
}

/// One syscall attempt: number, architecture, arguments and the
/// instruction pointer it was issued from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syscall {
    pub arch: CpuArch,
    pub nr: i64,
    pub args: [u64; 6],
    pub pid: libc::pid_t,
    pub ip: u64,
}

impl Syscall {
    pub fn new(arch: CpuArch, nr: i64, args: [u64; 6], pid: libc::pid_t, ip: u64) -> Self {
        Self {
            arch,
            nr,
            args,
            pid,
            ip,
        }
    }

    /// Best-effort name for host-arch syscalls; logging only.
    pub fn name(&self) -> &'static str {
        if self.arch != CpuArch::host() {
            return "foreign-arch";
        }
        syscall_name(self.nr)
    }
}

impl std::fmt::Display for Syscall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}) [{}] pid={} ip={:#x} args=[{:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x}]",
            self.name(),
            self.nr,
            self.arch.name(),
            self.pid,
            self.ip,
            self.args[0],
            self.args[1],
            self.args[2],
            self.args[3],
            self.args[4],
            self.args[5],
        )
    }
}

/// Names for the syscalls that show up in violation reports in practice.
fn syscall_name(nr: i64) -> &'static str {
    match nr {
        libc::SYS_read => "read",
        libc::SYS_write => "write",
        libc::SYS_open => "open",
        libc::SYS_openat => "openat",
        libc::SYS_close => "close",
        libc::SYS_mmap => "mmap",
        libc::SYS_mprotect => "mprotect",
        libc::SYS_munmap => "munmap",
        libc::SYS_brk => "brk",
        libc::SYS_ioctl => "ioctl",
        libc::SYS_socket => "socket",
        libc::SYS_connect => "connect",
        libc::SYS_sendmsg => "sendmsg",
        libc::SYS_recvmsg => "recvmsg",
        libc::SYS_clone => "clone",
        libc::SYS_clone3 => "clone3",
        libc::SYS_fork => "fork",
        libc::SYS_vfork => "vfork",
        libc::SYS_execve => "execve",
        libc::SYS_execveat => "execveat",
        libc::SYS_exit => "exit",
        libc::SYS_exit_group => "exit_group",
        libc::SYS_wait4 => "wait4",
        libc::SYS_kill => "kill",
        libc::SYS_ptrace => "ptrace",
        libc::SYS_bpf => "bpf",
        libc::SYS_seccomp => "seccomp",
        libc::SYS_unshare => "unshare",
        libc::SYS_mount => "mount",
        libc::SYS_pivot_root => "pivot_root",
        libc::SYS_prctl => "prctl",
        libc::SYS_prlimit64 => "prlimit64",
        libc::SYS_memfd_create => "memfd_create",
        libc::SYS_process_vm_readv => "process_vm_readv",
        libc::SYS_process_vm_writev => "process_vm_writev",
        _ => "syscall",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_arch_roundtrip() {
        for arch in [
            CpuArch::X8664,
            CpuArch::X86,
            CpuArch::Arm64,
            CpuArch::Arm,
            CpuArch::Ppc64Le,
        ] {
            assert_eq!(CpuArch::from_trace_data(arch.trace_data()), arch);
        }
        assert_eq!(CpuArch::from_audit(0xdeadbeef), CpuArch::Unknown);
    }

    #[test]
    fn host_arch_is_known() {
        assert_ne!(CpuArch::host(), CpuArch::Unknown);
    }

    #[test]
    fn display_names_ptrace() {
        let call = Syscall::new(CpuArch::host(), libc::SYS_ptrace, [0; 6], 123, 0x1000);
        let text = call.to_string();
        assert!(text.contains("ptrace"));
        assert!(text.contains("pid=123"));
    }

    #[test]
    fn foreign_arch_has_no_host_name() {
        let arch = if CpuArch::host() == CpuArch::X86 {
            CpuArch::Arm
        } else {
            CpuArch::X86
        };
        let call = Syscall::new(arch, 1, [0; 6], 1, 0);
        assert_eq!(call.name(), "foreign-arch");
    }
}
