//! Compiled sandbox policies.
//!
//! A [`Policy`] is produced exactly once by a
//! [`PolicyBuilder`](builder::PolicyBuilder) and is immutable afterwards.
//! It owns the compiled seccomp-BPF program plus the auxiliary tables the
//! rest of the engine consumes: the path allowlist, mount descriptors,
//! capability keep-set, resource limits, network rules and namespace
//! flags.
//!
//! The stored program has *ptrace-flavor* terminals: the default action
//! and hard denies return `KILL`, supervisor-decision points return
//! `TRACE`. Each monitor rewrites the terminals for its own transport
//! before sending the program to the sandboxee; the untouched program
//! stays behind for verdict re-evaluation.

pub mod builder;

pub use builder::{ArgGuard, GuardOp, PolicyBuilder, PolicyError, SyscallAction};

use crate::namespaces::{Mount, NamespaceConfig};
use crate::proxy::AllowedHosts;
use crate::rlimits::RlimitSet;
use crate::syscall::CpuArch;
use warden_sys::bpf::{
    bpf_class, ret, ret_trace, SockFilter, BPF_K, BPF_RET, SECCOMP_RET_ACTION_FULL,
    SECCOMP_RET_DATA, SECCOMP_RET_KILL_PROCESS, SECCOMP_RET_KILL_THREAD, SECCOMP_RET_TRACE,
    SECCOMP_RET_USER_NOTIF,
};

/// Magic value in an otherwise-unused syscall argument slot, marking the
/// launch stub's own `seccomp(2)` and `execveat(2)` calls so an active
/// filter can recognize them.
pub(crate) const LAUNCH_MAGIC: u64 = 0x5afe_ca11;

/// Reserved syscall number for sandbox self-detection: inside the sandbox
/// it fails with [`DETECT_ERRNO`], outside with `ENOSYS`.
pub(crate) const DETECT_SYSCALL: u32 = 0xff5a;

/// Errno returned by the sandbox-detection syscall.
pub(crate) const DETECT_ERRNO: u16 = 0x5a;

/// `SECCOMP_RET_DATA` payload marking the launch stub's final `execveat`.
/// Distinct from every [`CpuArch`] marker.
pub(crate) const TRACE_DATA_EXEC: u16 = 0x10;

/// When stack traces may be collected, per terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StacktraceRule {
    pub on_violation: bool,
    pub on_signal: bool,
    pub on_timeout: bool,
    pub on_kill: bool,
}

impl Default for StacktraceRule {
    fn default() -> Self {
        Self {
            on_violation: true,
            on_signal: true,
            on_timeout: true,
            on_kill: true,
        }
    }
}

/// An immutable, fully compiled sandbox policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub(crate) program: Vec<SockFilter>,
    pub(crate) paths: Vec<String>,
    pub(crate) mounts: Vec<Mount>,
    pub(crate) capabilities: Vec<i32>,
    pub(crate) rlimits: RlimitSet,
    pub(crate) allowed_hosts: AllowedHosts,
    pub(crate) namespaces: NamespaceConfig,
    pub(crate) stacktrace: StacktraceRule,
}

impl Policy {
    /// The compiled program with ptrace-flavor terminals.
    pub fn program(&self) -> &[SockFilter] {
        &self.program
    }

    /// Allowlisted paths, canonical and sorted.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn capabilities(&self) -> &[i32] {
        &self.capabilities
    }

    pub fn rlimits(&self) -> &RlimitSet {
        &self.rlimits
    }

    pub fn allowed_hosts(&self) -> &AllowedHosts {
        &self.allowed_hosts
    }

    pub fn namespaces(&self) -> &NamespaceConfig {
        &self.namespaces
    }

    pub fn stacktrace_rule(&self) -> StacktraceRule {
        self.stacktrace
    }

    /// Whether a run under this policy needs the proxy thread.
    pub(crate) fn wants_network_proxy(&self) -> bool {
        !self.allowed_hosts.is_empty()
    }

    /// Program variant installed under the ptrace monitor: hard kills
    /// become host-arch-tagged `TRACE` so the supervisor records the
    /// violating syscall before killing.
    pub(crate) fn program_for_ptrace(&self) -> Vec<SockFilter> {
        let host_tag = CpuArch::host().trace_data();
        self.program
            .iter()
            .map(|insn| {
                if is_ret_kill(insn) {
                    ret_trace(host_tag)
                } else {
                    *insn
                }
            })
            .collect()
    }

    /// Program variant installed under the unotify monitor: every kill
    /// and every trace becomes `USER_NOTIF`, except the launch stub's
    /// `execveat` marker which no supervisor round-trip can service and
    /// which turns into a plain allow.
    pub(crate) fn program_for_unotify(&self) -> Vec<SockFilter> {
        self.program
            .iter()
            .map(|insn| {
                if is_ret_trace_data(insn, TRACE_DATA_EXEC) {
                    ret(warden_sys::bpf::SECCOMP_RET_ALLOW)
                } else if is_ret_kill(insn) || is_ret_action(insn, SECCOMP_RET_TRACE) {
                    ret(SECCOMP_RET_USER_NOTIF)
                } else {
                    *insn
                }
            })
            .collect()
    }
}

fn is_ret_const(insn: &SockFilter) -> bool {
    bpf_class(insn.code) == BPF_RET && insn.code & 0x18 == BPF_K
}

fn is_ret_kill(insn: &SockFilter) -> bool {
    is_ret_const(insn)
        && (insn.k == SECCOMP_RET_KILL_PROCESS || insn.k == SECCOMP_RET_KILL_THREAD)
}

fn is_ret_action(insn: &SockFilter, action: u32) -> bool {
    is_ret_const(insn) && insn.k & SECCOMP_RET_ACTION_FULL == action
}

fn is_ret_trace_data(insn: &SockFilter, data: u16) -> bool {
    is_ret_action(insn, SECCOMP_RET_TRACE) && insn.k & SECCOMP_RET_DATA == u32::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_sys::bpf::{load_syscall_nr, SECCOMP_RET_ALLOW, SECCOMP_RET_ERRNO};

    fn policy_with_program(program: Vec<SockFilter>) -> Policy {
        Policy {
            program,
            paths: Vec::new(),
            mounts: Vec::new(),
            capabilities: Vec::new(),
            rlimits: RlimitSet::default(),
            allowed_hosts: AllowedHosts::default(),
            namespaces: NamespaceConfig::disabled(),
            stacktrace: StacktraceRule::default(),
        }
    }

    #[test]
    fn ptrace_transform_tags_kills() {
        let policy = policy_with_program(vec![
            load_syscall_nr(),
            ret(SECCOMP_RET_ALLOW),
            ret(SECCOMP_RET_KILL_PROCESS),
            ret(SECCOMP_RET_ERRNO | 5),
        ]);
        let prog = policy.program_for_ptrace();
        assert_eq!(prog[1].k, SECCOMP_RET_ALLOW);
        assert_eq!(prog[2].k & SECCOMP_RET_ACTION_FULL, SECCOMP_RET_TRACE);
        assert_eq!(
            prog[2].k & SECCOMP_RET_DATA,
            u32::from(CpuArch::host().trace_data())
        );
        assert_eq!(prog[3].k, SECCOMP_RET_ERRNO | 5);
    }

    #[test]
    fn unotify_transform_notifies_kills_and_traces() {
        let policy = policy_with_program(vec![
            load_syscall_nr(),
            ret(SECCOMP_RET_KILL_PROCESS),
            ret_trace(CpuArch::X86.trace_data()),
            ret_trace(TRACE_DATA_EXEC),
            ret(SECCOMP_RET_ERRNO | 9),
        ]);
        let prog = policy.program_for_unotify();
        assert_eq!(prog[1].k, SECCOMP_RET_USER_NOTIF);
        assert_eq!(prog[2].k, SECCOMP_RET_USER_NOTIF);
        // The exec marker must not dead-lock the launch handshake.
        assert_eq!(prog[3].k, SECCOMP_RET_ALLOW);
        assert_eq!(prog[4].k, SECCOMP_RET_ERRNO | 9);
    }

    #[test]
    fn exec_marker_distinct_from_arch_markers() {
        for arch in [
            CpuArch::Unknown,
            CpuArch::X8664,
            CpuArch::X86,
            CpuArch::Arm64,
            CpuArch::Arm,
            CpuArch::Ppc64Le,
        ] {
            assert_ne!(arch.trace_data(), TRACE_DATA_EXEC);
        }
    }
}
