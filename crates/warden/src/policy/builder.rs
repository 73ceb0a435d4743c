//! Declarative construction of sandbox policies.
//!
//! The builder is fluent: configuration methods consume and return the
//! builder, invalid input is remembered as a sticky first error and
//! surfaced by [`build`](PolicyBuilder::build). A builder compiles at
//! most one policy; a second `build` call fails with
//! [`PolicyError::AlreadyBuilt`].
//!
//! ## Rule semantics
//!
//! Rules are matched in insertion order, first match wins. A rule that
//! shadows an earlier one is kept in the program but never reached; the
//! builder does not normalize. Two builder verbs behave differently on
//! repetition:
//!
//! - [`allow_syscall`](PolicyBuilder::allow_syscall) is idempotent:
//!   repeated calls for one syscall collapse into a single rule
//! - [`add_policy_on_syscall`](PolicyBuilder::add_policy_on_syscall)
//!   accumulates: every call appends its fragment
//!
//! ## Compiled layout
//!
//! ```text
//! [arch check]               wrong architecture -> TRACE(arch tag)
//! [sandbox detection]        reserved nr -> ERRNO
//! [launch-stub allowances]   seccomp/execveat carrying the magic
//! [hardening]                ptrace, bpf, exec mappings, clone/unshare
//!                            namespace flags, seccomp new-listener
//! [user rules]               insertion order
//! RET KILL                   default deny
//! ```

use std::collections::BTreeSet;

use thiserror::Error;

use crate::filter::asm::{AssembleError, BpfAssembler};
use crate::namespaces::{validate_absolute_path, Mount, NamespaceConfig, PathError};
use crate::policy::{
    Policy, StacktraceRule, DETECT_ERRNO, DETECT_SYSCALL, LAUNCH_MAGIC, TRACE_DATA_EXEC,
};
use crate::proxy::{AllowedHosts, AllowedHostsError};
use crate::rlimits::{Rlimit, RlimitSet};
use crate::syscall::CpuArch;
use warden_sys::bpf::{
    host_audit_arch, load_arch, load_arg_lo, load_syscall_nr, ret, ret_errno, ret_trace,
    SockFilter, AUDIT_ARCH_I386, BPF_JGE, BPF_JGT, BPF_JSET, SECCOMP_RET_ALLOW,
    SECCOMP_RET_KILL_PROCESS, SECCOMP_RET_USER_NOTIF,
};
use warden_sys::seccomp::SECCOMP_FILTER_FLAG_NEW_LISTENER;

const CLONE_NEWNS: u32 = 0x0002_0000;
const CLONE_UNTRACED: u32 = 0x0080_0000;
const CLONE_NEWCGROUP: u32 = 0x0200_0000;
const CLONE_NEWUTS: u32 = 0x0400_0000;
const CLONE_NEWIPC: u32 = 0x0800_0000;
const CLONE_NEWUSER: u32 = 0x1000_0000;
const CLONE_NEWPID: u32 = 0x2000_0000;
const CLONE_NEWNET: u32 = 0x4000_0000;

const NEW_NAMESPACE_FLAGS: u32 = CLONE_NEWNS
    | CLONE_NEWCGROUP
    | CLONE_NEWUTS
    | CLONE_NEWIPC
    | CLONE_NEWUSER
    | CLONE_NEWPID
    | CLONE_NEWNET;

const UNSAFE_CLONE_FLAGS: u32 = NEW_NAMESPACE_FLAGS | CLONE_UNTRACED;

const PROT_EXEC: u32 = 0x4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy was already built from this builder")]
    AlreadyBuilt,

    #[error("syscall list must not be empty")]
    EmptySyscallList,

    #[error(transparent)]
    InvalidPath(#[from] PathError),

    #[error("syscall argument index {0} out of range (0..6)")]
    BadArgIndex(usize),

    #[error(transparent)]
    BadCidr(#[from] AllowedHostsError),

    #[error("policy assembly failed: {0}")]
    Assemble(#[from] AssembleError),
}

/// Terminal action of a syscall rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallAction {
    Allow,
    Errno(u16),
    Kill,
    /// Hand the decision to the supervisor (tagged with the host arch).
    Trace,
    UserNotif,
}

impl SyscallAction {
    fn terminal(self) -> SockFilter {
        match self {
            Self::Allow => ret(SECCOMP_RET_ALLOW),
            Self::Errno(errno) => ret_errno(errno),
            Self::Kill => ret(SECCOMP_RET_KILL_PROCESS),
            Self::Trace => ret_trace(CpuArch::host().trace_data()),
            Self::UserNotif => ret(SECCOMP_RET_USER_NOTIF),
        }
    }
}

/// Comparison applied to the low 32 bits of one syscall argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOp {
    Eq,
    Ne,
    Gt,
    Ge,
    /// At least one of the given bits set.
    HasBits,
    /// None of the given bits set.
    HasNoBits,
}

/// One argument predicate of a guarded rule. All guards of a rule must
/// hold for its action to fire; otherwise matching continues with the
/// next rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgGuard {
    pub arg: usize,
    pub op: GuardOp,
    pub value: u32,
}

impl ArgGuard {
    pub fn new(arg: usize, op: GuardOp, value: u32) -> Self {
        Self { arg, op, value }
    }
}

#[derive(Debug, Clone)]
enum Rule {
    Simple {
        nrs: Vec<i64>,
        action: SyscallAction,
    },
    Guarded {
        nrs: Vec<i64>,
        guards: Vec<ArgGuard>,
        action: SyscallAction,
    },
    Raw {
        nrs: Vec<i64>,
        fragment: Vec<SockFilter>,
    },
}

impl Rule {
    fn covers(&self, nr: i64) -> bool {
        match self {
            Self::Simple { nrs, .. } | Self::Guarded { nrs, .. } | Self::Raw { nrs, .. } => {
                nrs.contains(&nr)
            }
        }
    }
}

pub struct PolicyBuilder {
    rules: Vec<Rule>,
    allowed: BTreeSet<i64>,
    allow_map_exec: bool,
    tracking: bool,
    paths: BTreeSet<String>,
    mounts: Vec<Mount>,
    capabilities: Vec<i32>,
    rlimits: RlimitSet,
    hosts: AllowedHosts,
    namespaces: NamespaceConfig,
    stacktrace: StacktraceRule,
    built: bool,
    error: Option<PolicyError>,
}

impl Default for PolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            allowed: BTreeSet::new(),
            allow_map_exec: false,
            tracking: false,
            paths: BTreeSet::new(),
            mounts: Vec::new(),
            capabilities: Vec::new(),
            rlimits: RlimitSet::default(),
            hosts: AllowedHosts::default(),
            namespaces: NamespaceConfig::default(),
            stacktrace: StacktraceRule::default(),
            built: false,
            error: None,
        }
    }

    fn record_error(&mut self, error: PolicyError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    // ---- syscall rules -----------------------------------------------------

    /// Allow a syscall unconditionally. Idempotent: repeated calls for
    /// the same number do not grow the program.
    pub fn allow_syscall(mut self, nr: i64) -> Self {
        if self.allowed.insert(nr) {
            self.rules.push(Rule::Simple {
                nrs: vec![nr],
                action: SyscallAction::Allow,
            });
        }
        self
    }

    pub fn allow_syscalls(mut self, nrs: impl IntoIterator<Item = i64>) -> Self {
        for nr in nrs {
            self = self.allow_syscall(nr);
        }
        self
    }

    /// Fail a syscall with `errno` instead of killing the sandboxee.
    pub fn block_syscall_with_errno(mut self, nr: i64, errno: u16) -> Self {
        self.rules.push(Rule::Simple {
            nrs: vec![nr],
            action: SyscallAction::Errno(errno),
        });
        self
    }

    pub fn block_syscalls_with_errno(
        mut self,
        nrs: impl IntoIterator<Item = i64>,
        errno: u16,
    ) -> Self {
        let nrs: Vec<i64> = nrs.into_iter().collect();
        if nrs.is_empty() {
            self.record_error(PolicyError::EmptySyscallList);
            return self;
        }
        self.rules.push(Rule::Simple {
            nrs,
            action: SyscallAction::Errno(errno),
        });
        self
    }

    /// Append a guarded rule for one syscall. Always appends, even for a
    /// number that already has rules.
    pub fn add_policy_on_syscall(
        self,
        nr: i64,
        guards: impl IntoIterator<Item = ArgGuard>,
        action: SyscallAction,
    ) -> Self {
        self.add_policy_on_syscalls([nr], guards, action)
    }

    /// Append a guarded rule for a set of syscalls. The set must not be
    /// empty.
    pub fn add_policy_on_syscalls(
        mut self,
        nrs: impl IntoIterator<Item = i64>,
        guards: impl IntoIterator<Item = ArgGuard>,
        action: SyscallAction,
    ) -> Self {
        let nrs: Vec<i64> = nrs.into_iter().collect();
        if nrs.is_empty() {
            self.record_error(PolicyError::EmptySyscallList);
            return self;
        }
        let guards: Vec<ArgGuard> = guards.into_iter().collect();
        for guard in &guards {
            if guard.arg >= 6 {
                self.record_error(PolicyError::BadArgIndex(guard.arg));
                return self;
            }
        }
        self.rules.push(Rule::Guarded {
            nrs,
            guards,
            action,
        });
        self
    }

    /// Append a raw BPF fragment guarding a set of syscalls. On entry the
    /// accumulator holds the syscall number; the fragment may load
    /// arguments and must either return or fall through to the next rule.
    /// Fragments whose internal jumps escape their bounds are rejected at
    /// build time.
    pub fn add_raw_policy_on_syscalls(
        mut self,
        nrs: impl IntoIterator<Item = i64>,
        fragment: &[SockFilter],
    ) -> Self {
        let nrs: Vec<i64> = nrs.into_iter().collect();
        if nrs.is_empty() {
            self.record_error(PolicyError::EmptySyscallList);
            return self;
        }
        self.rules.push(Rule::Raw {
            nrs,
            fragment: fragment.to_vec(),
        });
        self
    }

    // ---- foundation helpers ------------------------------------------------

    /// Process exit.
    pub fn allow_exit(self) -> Self {
        self.allow_syscalls([libc::SYS_exit, libc::SYS_exit_group])
    }

    /// Signal-handler return.
    pub fn allow_sigreturn(self) -> Self {
        self.allow_syscall(libc::SYS_rt_sigreturn)
    }

    /// Syscall restarts after signal delivery.
    pub fn allow_restart(self) -> Self {
        self.allow_syscall(libc::SYS_restart_syscall)
    }

    /// The syscalls a statically linked binary needs to reach `main` and
    /// talk to the supervisor: startup memory management plus the comms
    /// channel the launch stub leaves behind.
    pub fn allow_static_startup(self) -> Self {
        self.allow_exit()
            .allow_sigreturn()
            .allow_restart()
            .allow_syscalls([
                libc::SYS_read,
                libc::SYS_write,
                libc::SYS_close,
                libc::SYS_close_range,
                libc::SYS_getdents64,
                libc::SYS_sendmsg,
                libc::SYS_recvmsg,
                libc::SYS_brk,
                libc::SYS_mmap,
                libc::SYS_munmap,
                libc::SYS_mprotect,
                libc::SYS_arch_prctl,
                libc::SYS_set_tid_address,
                libc::SYS_set_robust_list,
                libc::SYS_rseq,
                libc::SYS_prlimit64,
                libc::SYS_getrandom,
                libc::SYS_futex,
                libc::SYS_rt_sigaction,
                libc::SYS_rt_sigprocmask,
                libc::SYS_sigaltstack,
                libc::SYS_uname,
                libc::SYS_readlink,
                libc::SYS_getpid,
                libc::SYS_gettid,
            ])
    }

    /// Permit `PROT_EXEC` mappings. Off by default: writable-executable
    /// memory defeats most of what seccomp buys.
    pub fn allow_map_exec(mut self) -> Self {
        self.allow_map_exec = true;
        self
    }

    /// Replace the whole program with an arch-tagged trace-everything
    /// filter. Debugging aid; every syscall reaches the supervisor.
    pub fn tracking_policy(mut self) -> Self {
        self.tracking = true;
        self
    }

    // ---- filesystem --------------------------------------------------------

    /// Allowlist an absolute canonical path and bind-mount it read-only
    /// into the sandboxee's tree.
    pub fn add_path(self, path: &str) -> Self {
        self.add_path_inner(path, false)
    }

    /// Like [`add_path`](Self::add_path) but writable.
    pub fn add_path_writable(self, path: &str) -> Self {
        self.add_path_inner(path, true)
    }

    fn add_path_inner(mut self, path: &str, writable: bool) -> Self {
        if let Err(err) = validate_absolute_path(path) {
            self.record_error(err.into());
            return self;
        }
        if self.paths.insert(path.to_string()) {
            self.mounts.push(if writable {
                Mount::bind_rw(path, path)
            } else {
                Mount::bind_ro(path, path)
            });
        }
        self
    }

    /// Bind-mount `src` from the host to `dst` in the sandbox.
    pub fn add_bind_mount(mut self, src: &str, dst: &str, writable: bool) -> Self {
        for p in [src, dst] {
            if let Err(err) = validate_absolute_path(p) {
                self.record_error(err.into());
                return self;
            }
        }
        self.mounts.push(if writable {
            Mount::bind_rw(src, dst)
        } else {
            Mount::bind_ro(src, dst)
        });
        self
    }

    /// Mount a fresh tmpfs of `size` bytes at `dst`.
    pub fn add_tmpfs(mut self, dst: &str, size: usize) -> Self {
        if let Err(err) = validate_absolute_path(dst) {
            self.record_error(err.into());
            return self;
        }
        self.mounts.push(Mount::tmpfs(dst, size));
        self
    }

    // ---- namespaces --------------------------------------------------------

    /// Run without any namespace isolation.
    pub fn no_namespaces(mut self) -> Self {
        self.namespaces = NamespaceConfig::disabled();
        self
    }

    /// Keep the sandboxee in the host network namespace. Without this a
    /// fresh, empty one is created.
    pub fn allow_unrestricted_networking(mut self) -> Self {
        self.namespaces.net = false;
        self
    }

    pub fn set_hostname(mut self, hostname: &str) -> Self {
        self.namespaces.hostname = hostname.to_string();
        self
    }

    // ---- capabilities and limits -------------------------------------------

    /// Keep one capability in the sandboxee's bounding set; everything
    /// else is dropped.
    pub fn keep_capability(mut self, cap: i32) -> Self {
        if !self.capabilities.contains(&cap) {
            self.capabilities.push(cap);
        }
        self
    }

    pub fn set_rlimit(mut self, resource: u32, soft: u64, hard: u64) -> Self {
        self.rlimits.set(Rlimit::new(resource, soft, hard));
        self
    }

    pub fn set_rlimit_as(self, bytes: u64) -> Self {
        self.set_rlimit(libc::RLIMIT_AS as u32, bytes, bytes)
    }

    pub fn set_rlimit_fsize(self, bytes: u64) -> Self {
        self.set_rlimit(libc::RLIMIT_FSIZE as u32, bytes, bytes)
    }

    pub fn set_rlimit_nofile(self, count: u64) -> Self {
        self.set_rlimit(libc::RLIMIT_NOFILE as u32, count, count)
    }

    pub fn set_rlimit_cpu(self, seconds: u64) -> Self {
        self.set_rlimit(libc::RLIMIT_CPU as u32, seconds, seconds)
    }

    // ---- network -----------------------------------------------------------

    /// Allow proxied `connect()` to a CIDR block.
    pub fn allow_connect_to(mut self, cidr: &str) -> Self {
        if let Err(err) = self.hosts.add(cidr) {
            self.record_error(err.into());
        }
        self
    }

    /// Allow proxied `connect()` to any address.
    pub fn allow_all_connections(mut self) -> Self {
        self.hosts = AllowedHosts::allow_all();
        self
    }

    // ---- stack traces ------------------------------------------------------

    pub fn collect_stacktrace_on_violation(mut self, enabled: bool) -> Self {
        self.stacktrace.on_violation = enabled;
        self
    }

    pub fn collect_stacktrace_on_signal(mut self, enabled: bool) -> Self {
        self.stacktrace.on_signal = enabled;
        self
    }

    pub fn collect_stacktrace_on_timeout(mut self, enabled: bool) -> Self {
        self.stacktrace.on_timeout = enabled;
        self
    }

    pub fn collect_stacktrace_on_kill(mut self, enabled: bool) -> Self {
        self.stacktrace.on_kill = enabled;
        self
    }

    // ---- build -------------------------------------------------------------

    /// Compile the policy. Single-shot: a second call fails.
    pub fn build(&mut self) -> Result<Policy, PolicyError> {
        if self.built {
            return Err(PolicyError::AlreadyBuilt);
        }
        if let Some(error) = self.error.take() {
            self.built = true;
            return Err(error);
        }
        self.built = true;

        let program = if self.tracking {
            compile_tracking_program()?
        } else {
            compile_program(&self.rules, self.allow_map_exec)?
        };

        Ok(Policy {
            program,
            paths: self.paths.iter().cloned().collect(),
            mounts: std::mem::take(&mut self.mounts),
            capabilities: std::mem::take(&mut self.capabilities),
            rlimits: std::mem::take(&mut self.rlimits),
            allowed_hosts: std::mem::take(&mut self.hosts),
            namespaces: self.namespaces.clone(),
            stacktrace: self.stacktrace,
        })
    }
}

/// Arch-tagged permit-all program: every syscall traces to the
/// supervisor.
fn compile_tracking_program() -> Result<Vec<SockFilter>, PolicyError> {
    let mut asm = BpfAssembler::new();
    asm.push(load_arch());
    for (audit, arch) in [
        (warden_sys::bpf::AUDIT_ARCH_X86_64, CpuArch::X8664),
        (AUDIT_ARCH_I386, CpuArch::X86),
        (warden_sys::bpf::AUDIT_ARCH_AARCH64, CpuArch::Arm64),
        (warden_sys::bpf::AUDIT_ARCH_PPC64LE, CpuArch::Ppc64Le),
    ] {
        let next = asm.label();
        asm.jne(audit, next);
        asm.push(ret_trace(arch.trace_data()));
        asm.bind(next)?;
    }
    asm.push(ret_trace(CpuArch::Unknown.trace_data()));
    Ok(asm.finish()?)
}

fn compile_program(rules: &[Rule], allow_map_exec: bool) -> Result<Vec<SockFilter>, PolicyError> {
    let mut asm = BpfAssembler::new();

    // Architecture check first. Foreign-arch syscalls are supervisor
    // decisions tagged with the foreign architecture.
    let past_arch = asm.label();
    asm.push(load_arch());
    asm.jeq(host_audit_arch(), past_arch);
    if host_audit_arch() == warden_sys::bpf::AUDIT_ARCH_X86_64 {
        let not_i386 = asm.label();
        asm.jne(AUDIT_ARCH_I386, not_i386);
        asm.push(ret_trace(CpuArch::X86.trace_data()));
        asm.bind(not_i386)?;
    }
    asm.push(ret_trace(CpuArch::Unknown.trace_data()));
    asm.bind(past_arch)?;

    asm.push(load_syscall_nr());

    // Sandbox self-detection: the reserved number fails with a
    // recognizable errno in here, ENOSYS outside.
    emit_simple(
        &mut asm,
        &[i64::from(DETECT_SYSCALL)],
        ret_errno(DETECT_ERRNO),
    )?;

    // The launch stub's own seccomp(2), marked with the magic in the
    // unused fourth argument slot.
    emit_guarded(
        &mut asm,
        &[libc::SYS_seccomp],
        &[ArgGuard::new(3, GuardOp::Eq, LAUNCH_MAGIC as u32)],
        ret(SECCOMP_RET_ALLOW),
    )?;

    // The launch stub's final execveat, marked the same way in the
    // unused sixth slot. A supervisor decision: the ptrace monitor uses
    // it to arm active monitoring.
    emit_guarded(
        &mut asm,
        &[libc::SYS_execveat],
        &[
            ArgGuard::new(4, GuardOp::Eq, libc::AT_EMPTY_PATH as u32),
            ArgGuard::new(5, GuardOp::Eq, LAUNCH_MAGIC as u32),
        ],
        ret_trace(TRACE_DATA_EXEC),
    )?;

    // Hardening. A user rule mentioning ptrace/bpf takes precedence over
    // the blanket deny.
    let user_handles_ptrace = rules.iter().any(|r| r.covers(libc::SYS_ptrace));
    let user_handles_bpf = rules.iter().any(|r| r.covers(libc::SYS_bpf));
    if !user_handles_ptrace {
        emit_simple(&mut asm, &[libc::SYS_ptrace], ret(SECCOMP_RET_KILL_PROCESS))?;
    }
    if !user_handles_bpf {
        emit_simple(&mut asm, &[libc::SYS_bpf], ret(SECCOMP_RET_KILL_PROCESS))?;
    }

    if !allow_map_exec {
        emit_guarded(
            &mut asm,
            &[
                libc::SYS_mmap,
                libc::SYS_mprotect,
                libc::SYS_pkey_mprotect,
            ],
            &[ArgGuard::new(2, GuardOp::HasBits, PROT_EXEC)],
            ret(SECCOMP_RET_KILL_PROCESS),
        )?;
    }

    // clone3 takes its flags through a struct BPF cannot read; ENOSYS
    // makes libcs fall back to clone.
    emit_simple(
        &mut asm,
        &[libc::SYS_clone3],
        ret_errno(libc::ENOSYS as u16),
    )?;
    emit_guarded(
        &mut asm,
        &[libc::SYS_clone],
        &[ArgGuard::new(0, GuardOp::HasBits, UNSAFE_CLONE_FLAGS)],
        ret(SECCOMP_RET_KILL_PROCESS),
    )?;
    emit_guarded(
        &mut asm,
        &[libc::SYS_unshare],
        &[ArgGuard::new(0, GuardOp::HasBits, NEW_NAMESPACE_FLAGS)],
        ret(SECCOMP_RET_KILL_PROCESS),
    )?;
    emit_guarded(
        &mut asm,
        &[libc::SYS_seccomp],
        &[ArgGuard::new(1, GuardOp::HasBits, SECCOMP_FILTER_FLAG_NEW_LISTENER)],
        ret(SECCOMP_RET_KILL_PROCESS),
    )?;

    // User rules, insertion order, first match wins.
    for rule in rules {
        match rule {
            Rule::Simple { nrs, action } => emit_simple(&mut asm, nrs, action.terminal())?,
            Rule::Guarded {
                nrs,
                guards,
                action,
            } => emit_guarded(&mut asm, nrs, guards, action.terminal())?,
            Rule::Raw { nrs, fragment } => emit_raw(&mut asm, nrs, fragment)?,
        }
    }

    // Nothing matched: kill.
    asm.push(ret(SECCOMP_RET_KILL_PROCESS));
    Ok(asm.finish()?)
}

/// `if nr in nrs: terminal` - expects and preserves `A == nr`.
fn emit_simple(
    asm: &mut BpfAssembler,
    nrs: &[i64],
    terminal: SockFilter,
) -> Result<(), PolicyError> {
    let past = asm.label();
    match nrs {
        [] => return Err(PolicyError::EmptySyscallList),
        [nr] => asm.jne(*nr as u32, past),
        [head @ .., last] => {
            let body = asm.label();
            for nr in head {
                asm.jeq(*nr as u32, body);
            }
            asm.jne(*last as u32, past);
            asm.bind(body)?;
        }
    }
    asm.push(terminal);
    asm.bind(past)?;
    Ok(())
}

/// `if nr in nrs and all guards hold: terminal` - reloads the syscall
/// number on the fall-through path because guards clobber the
/// accumulator with argument words.
fn emit_guarded(
    asm: &mut BpfAssembler,
    nrs: &[i64],
    guards: &[ArgGuard],
    terminal: SockFilter,
) -> Result<(), PolicyError> {
    if guards.is_empty() {
        return emit_simple(asm, nrs, terminal);
    }
    let past = asm.label();
    let reload = asm.label();
    match nrs {
        [] => return Err(PolicyError::EmptySyscallList),
        [nr] => asm.jne(*nr as u32, past),
        [head @ .., last] => {
            let body = asm.label();
            for nr in head {
                asm.jeq(*nr as u32, body);
            }
            asm.jne(*last as u32, past);
            asm.bind(body)?;
        }
    }
    for guard in guards {
        asm.push(load_arg_lo(guard.arg));
        match guard.op {
            GuardOp::Eq => asm.jne(guard.value, reload),
            GuardOp::Ne => asm.jeq(guard.value, reload),
            GuardOp::Gt => asm.jump_unless(BPF_JGT, guard.value, reload),
            GuardOp::Ge => asm.jump_unless(BPF_JGE, guard.value, reload),
            GuardOp::HasBits => asm.jump_unless(BPF_JSET, guard.value, reload),
            GuardOp::HasNoBits => asm.jump_if(BPF_JSET, guard.value, reload),
        }
    }
    asm.push(terminal);
    asm.bind(reload)?;
    asm.push(load_syscall_nr());
    asm.bind(past)?;
    Ok(())
}

/// `if nr in nrs: fragment` - the fragment may fall through, after which
/// the syscall number is restored for the next rule.
fn emit_raw(asm: &mut BpfAssembler, nrs: &[i64], fragment: &[SockFilter]) -> Result<(), PolicyError> {
    let past = asm.label();
    match nrs {
        [] => return Err(PolicyError::EmptySyscallList),
        [nr] => asm.jne(*nr as u32, past),
        [head @ .., last] => {
            let body = asm.label();
            for nr in head {
                asm.jeq(*nr as u32, body);
            }
            asm.jne(*last as u32, past);
            asm.bind(body)?;
        }
    }
    asm.append_fragment(fragment)?;
    asm.push(load_syscall_nr());
    asm.bind(past)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::asm::validate;
    use crate::filter::eval::evaluate;
    use warden_sys::bpf::{
        SECCOMP_RET_ACTION_FULL, SECCOMP_RET_DATA, SECCOMP_RET_ERRNO, SECCOMP_RET_TRACE,
    };
    use warden_sys::seccomp::SeccompData;

    fn syscall_data(nr: i64) -> SeccompData {
        SeccompData {
            nr: nr as i32,
            arch: host_audit_arch(),
            instruction_pointer: 0,
            args: [0; 6],
        }
    }

    fn syscall_data_args(nr: i64, args: [u64; 6]) -> SeccompData {
        SeccompData {
            args,
            ..syscall_data(nr)
        }
    }

    fn verdict(policy: &Policy, data: &SeccompData) -> u32 {
        evaluate(policy.program(), data).expect("evaluation")
    }

    fn action_of(v: u32) -> u32 {
        v & SECCOMP_RET_ACTION_FULL
    }

    #[test]
    fn build_is_single_shot() {
        let mut builder = PolicyBuilder::new().allow_exit();
        builder.build().unwrap();
        assert_eq!(builder.build().unwrap_err(), PolicyError::AlreadyBuilt);
    }

    #[test]
    fn every_jump_stays_in_bounds() {
        let mut builder = PolicyBuilder::new()
            .allow_static_startup()
            .block_syscall_with_errno(libc::SYS_socket, libc::EACCES as u16)
            .add_policy_on_syscall(
                libc::SYS_openat,
                [ArgGuard::new(2, GuardOp::HasNoBits, libc::O_WRONLY as u32)],
                SyscallAction::Allow,
            );
        let policy = builder.build().unwrap();
        validate(policy.program()).unwrap();
    }

    #[test]
    fn allowed_syscall_gets_allow_verdict() {
        let mut builder = PolicyBuilder::new().allow_syscall(libc::SYS_write);
        let policy = builder.build().unwrap();
        assert_eq!(
            verdict(&policy, &syscall_data(libc::SYS_write)),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn unknown_syscall_killed_by_default() {
        let mut builder = PolicyBuilder::new().allow_exit();
        let policy = builder.build().unwrap();
        assert_eq!(
            verdict(&policy, &syscall_data(libc::SYS_socket)),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn foreign_arch_traces_with_arch_tag() {
        let mut builder = PolicyBuilder::new().allow_exit();
        let policy = builder.build().unwrap();
        let mut data = syscall_data(1);
        data.arch = 0x1234_5678;
        let v = verdict(&policy, &data);
        assert_eq!(action_of(v), SECCOMP_RET_TRACE);
        assert_eq!(
            v & SECCOMP_RET_DATA,
            u32::from(CpuArch::Unknown.trace_data())
        );
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn i386_arch_traces_as_x86() {
        let mut builder = PolicyBuilder::new().allow_exit();
        let policy = builder.build().unwrap();
        let mut data = syscall_data(1); // 32-bit __NR_exit
        data.arch = AUDIT_ARCH_I386;
        let v = verdict(&policy, &data);
        assert_eq!(action_of(v), SECCOMP_RET_TRACE);
        assert_eq!(v & SECCOMP_RET_DATA, u32::from(CpuArch::X86.trace_data()));
    }

    #[test]
    fn ptrace_denied_by_default_policy() {
        let mut builder = PolicyBuilder::new().allow_static_startup();
        let policy = builder.build().unwrap();
        assert_eq!(
            verdict(&policy, &syscall_data(libc::SYS_ptrace)),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn user_errno_rule_overrides_ptrace_deny() {
        let mut builder = PolicyBuilder::new()
            .allow_static_startup()
            .block_syscalls_with_errno([libc::SYS_ptrace, libc::SYS_bpf], libc::EPERM as u16);
        let policy = builder.build().unwrap();
        let v = verdict(&policy, &syscall_data(libc::SYS_ptrace));
        assert_eq!(action_of(v), SECCOMP_RET_ERRNO);
        assert_eq!(v & SECCOMP_RET_DATA, libc::EPERM as u32);
        let v = verdict(&policy, &syscall_data(libc::SYS_bpf));
        assert_eq!(action_of(v), SECCOMP_RET_ERRNO);
    }

    #[test]
    fn clone_with_untraced_flag_killed() {
        let mut builder = PolicyBuilder::new().allow_syscall(libc::SYS_clone);
        let policy = builder.build().unwrap();

        let mut args = [0u64; 6];
        args[0] = u64::from(CLONE_UNTRACED);
        assert_eq!(
            verdict(&policy, &syscall_data_args(libc::SYS_clone, args)),
            SECCOMP_RET_KILL_PROCESS
        );

        // Plain clone falls through the hardening to the user allow.
        args[0] = 0x11; // CLONE_VM-ish flags, nothing unsafe
        assert_eq!(
            verdict(&policy, &syscall_data_args(libc::SYS_clone, args)),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn clone3_fails_with_enosys() {
        let mut builder = PolicyBuilder::new().allow_exit();
        let policy = builder.build().unwrap();
        let v = verdict(&policy, &syscall_data(libc::SYS_clone3));
        assert_eq!(action_of(v), SECCOMP_RET_ERRNO);
        assert_eq!(v & SECCOMP_RET_DATA, libc::ENOSYS as u32);
    }

    #[test]
    fn exec_mapping_killed_without_opt_in() {
        let mut builder = PolicyBuilder::new().allow_syscall(libc::SYS_mprotect);
        let policy = builder.build().unwrap();
        let mut args = [0u64; 6];
        args[2] = u64::from(PROT_EXEC);
        assert_eq!(
            verdict(&policy, &syscall_data_args(libc::SYS_mprotect, args)),
            SECCOMP_RET_KILL_PROCESS
        );

        let mut builder = PolicyBuilder::new()
            .allow_syscall(libc::SYS_mprotect)
            .allow_map_exec();
        let policy = builder.build().unwrap();
        assert_eq!(
            verdict(&policy, &syscall_data_args(libc::SYS_mprotect, args)),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn allow_syscall_is_size_idempotent() {
        let mut once = PolicyBuilder::new().allow_syscall(libc::SYS_read);
        let mut thrice = PolicyBuilder::new()
            .allow_syscall(libc::SYS_read)
            .allow_syscall(libc::SYS_read)
            .allow_syscall(libc::SYS_read);
        assert_eq!(
            once.build().unwrap().program().len(),
            thrice.build().unwrap().program().len()
        );
    }

    #[test]
    fn add_policy_grows_strictly() {
        let guard = [ArgGuard::new(0, GuardOp::Eq, 1)];
        let mut one = PolicyBuilder::new().add_policy_on_syscall(
            libc::SYS_kill,
            guard,
            SyscallAction::Errno(libc::EPERM as u16),
        );
        let mut two = PolicyBuilder::new()
            .add_policy_on_syscall(
                libc::SYS_kill,
                guard,
                SyscallAction::Errno(libc::EPERM as u16),
            )
            .add_policy_on_syscall(
                libc::SYS_kill,
                guard,
                SyscallAction::Errno(libc::EPERM as u16),
            );
        assert!(
            two.build().unwrap().program().len() > one.build().unwrap().program().len()
        );
    }

    #[test]
    fn conflicting_rules_first_wins_second_shadowed() {
        let mut builder = PolicyBuilder::new()
            .allow_syscall(libc::SYS_kill)
            .block_syscall_with_errno(libc::SYS_kill, libc::EPERM as u16);
        let policy = builder.build().unwrap();
        // Both rules are in the program; the allow shadows the errno.
        assert_eq!(
            verdict(&policy, &syscall_data(libc::SYS_kill)),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn empty_syscall_list_refused() {
        let mut builder =
            PolicyBuilder::new().add_policy_on_syscalls([], [], SyscallAction::Allow);
        assert_eq!(builder.build().unwrap_err(), PolicyError::EmptySyscallList);

        let mut builder = PolicyBuilder::new().block_syscalls_with_errno([], 1);
        assert_eq!(builder.build().unwrap_err(), PolicyError::EmptySyscallList);
    }

    #[test]
    fn non_canonical_path_refused() {
        let mut builder = PolicyBuilder::new().add_path("/usr/../etc");
        assert!(matches!(
            builder.build().unwrap_err(),
            PolicyError::InvalidPath(_)
        ));
    }

    #[test]
    fn raw_fragment_oob_jump_refused() {
        let fragment = [SockFilter::jump(
            warden_sys::bpf::BPF_JMP | warden_sys::bpf::BPF_JEQ | warden_sys::bpf::BPF_K,
            0,
            200,
            0,
        )];
        let mut builder =
            PolicyBuilder::new().add_raw_policy_on_syscalls([libc::SYS_read], &fragment);
        assert!(matches!(
            builder.build().unwrap_err(),
            PolicyError::Assemble(AssembleError::FragmentOutOfBounds(0))
        ));
    }

    #[test]
    fn raw_fragment_fall_through_continues_matching() {
        // Fragment allows kill(pid 7) and falls through otherwise.
        let fragment = [
            load_arg_lo(0),
            SockFilter::jump(
                warden_sys::bpf::BPF_JMP | warden_sys::bpf::BPF_JEQ | warden_sys::bpf::BPF_K,
                7,
                0,
                1,
            ),
            ret(SECCOMP_RET_ALLOW),
        ];
        let mut builder = PolicyBuilder::new()
            .add_raw_policy_on_syscalls([libc::SYS_kill], &fragment)
            .block_syscall_with_errno(libc::SYS_kill, libc::EPERM as u16);
        let policy = builder.build().unwrap();

        let mut args = [0u64; 6];
        args[0] = 7;
        assert_eq!(
            verdict(&policy, &syscall_data_args(libc::SYS_kill, args)),
            SECCOMP_RET_ALLOW
        );
        args[0] = 8;
        assert_eq!(
            action_of(verdict(&policy, &syscall_data_args(libc::SYS_kill, args))),
            SECCOMP_RET_ERRNO
        );
    }

    #[test]
    fn guard_ops_compile_and_match() {
        let mut builder = PolicyBuilder::new().add_policy_on_syscall(
            libc::SYS_kill,
            [
                ArgGuard::new(0, GuardOp::Ge, 100),
                ArgGuard::new(1, GuardOp::Eq, libc::SIGTERM as u32),
            ],
            SyscallAction::Allow,
        );
        let policy = builder.build().unwrap();

        let mut args = [0u64; 6];
        args[0] = 150;
        args[1] = libc::SIGTERM as u64;
        assert_eq!(
            verdict(&policy, &syscall_data_args(libc::SYS_kill, args)),
            SECCOMP_RET_ALLOW
        );
        args[0] = 50;
        assert_eq!(
            verdict(&policy, &syscall_data_args(libc::SYS_kill, args)),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn sandbox_detection_syscall_returns_marker_errno() {
        let mut builder = PolicyBuilder::new().allow_exit();
        let policy = builder.build().unwrap();
        let v = verdict(&policy, &syscall_data(i64::from(DETECT_SYSCALL)));
        assert_eq!(action_of(v), SECCOMP_RET_ERRNO);
        assert_eq!(v & SECCOMP_RET_DATA, u32::from(DETECT_ERRNO));
    }

    #[test]
    fn launch_stub_execveat_traces_with_exec_marker() {
        let mut builder = PolicyBuilder::new().allow_exit();
        let policy = builder.build().unwrap();
        let mut args = [0u64; 6];
        args[4] = libc::AT_EMPTY_PATH as u64;
        args[5] = LAUNCH_MAGIC;
        let v = verdict(&policy, &syscall_data_args(libc::SYS_execveat, args));
        assert_eq!(action_of(v), SECCOMP_RET_TRACE);
        assert_eq!(v & SECCOMP_RET_DATA, u32::from(TRACE_DATA_EXEC));

        // Without the magic the call falls through to the default kill.
        args[5] = 0;
        assert_eq!(
            verdict(&policy, &syscall_data_args(libc::SYS_execveat, args)),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn new_listener_seccomp_killed() {
        let mut builder = PolicyBuilder::new().allow_syscall(libc::SYS_seccomp);
        let policy = builder.build().unwrap();
        let mut args = [0u64; 6];
        args[1] = u64::from(SECCOMP_FILTER_FLAG_NEW_LISTENER);
        assert_eq!(
            verdict(&policy, &syscall_data_args(libc::SYS_seccomp, args)),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn tracking_policy_traces_everything() {
        let mut builder = PolicyBuilder::new().tracking_policy();
        let policy = builder.build().unwrap();
        let v = verdict(&policy, &syscall_data(libc::SYS_socket));
        assert_eq!(action_of(v), SECCOMP_RET_TRACE);
    }

    #[test]
    fn builder_collects_tables() {
        let mut builder = PolicyBuilder::new()
            .allow_exit()
            .add_path("/usr")
            .add_path("/lib")
            .add_path("/usr") // deduplicated
            .add_tmpfs("/tmp", 1 << 20)
            .keep_capability(21)
            .set_rlimit_nofile(128)
            .allow_connect_to("127.0.0.1/32")
            .set_hostname("testbox");
        let policy = builder.build().unwrap();
        assert_eq!(policy.paths(), &["/lib".to_string(), "/usr".to_string()]);
        assert_eq!(policy.mounts().len(), 3);
        assert_eq!(policy.capabilities(), &[21]);
        assert!(!policy.rlimits().is_empty());
        assert!(policy.wants_network_proxy());
        assert_eq!(policy.namespaces().hostname, "testbox");
    }

    #[test]
    fn bad_guard_index_refused() {
        let mut builder = PolicyBuilder::new().add_policy_on_syscall(
            libc::SYS_kill,
            [ArgGuard::new(6, GuardOp::Eq, 0)],
            SyscallAction::Allow,
        );
        assert_eq!(builder.build().unwrap_err(), PolicyError::BadArgIndex(6));
    }
}
