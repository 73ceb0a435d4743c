//! Sandboxee supervision.
//!
//! A monitor owns the sandboxee process for its whole life: it launches
//! it, feeds it the compiled policy, watches for events and produces the
//! final [`RunResult`]. Two variants share this module's state and launch
//! protocol and differ only in their event transport:
//!
//! - [`ptrace`] - every supervisor-relevant syscall arrives as a
//!   `PTRACE_EVENT_SECCOMP` stop
//! - [`unotify`] - syscalls arrive as seccomp user notifications on a
//!   listener fd
//!
//! ## Control flow
//!
//! The caller talks to a running monitor only through [`Shared`]: the
//! atomic deadline, the kill/dump request flags and the result slot.
//! Setting a flag merely *schedules* the action; the monitor thread
//! observes it on its next wake-up and performs the side effect itself.
//! [`Shared::wake`] makes that wake-up prompt: it pokes the variant's
//! eventfd and nudges the monitor thread out of `sigtimedwait` with a
//! directed `SIGCHLD`.

pub mod ptrace;
pub mod unotify;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::comms::CommsError;
use crate::executor::{Executor, SpawnedProcess, TOKEN_GO, TOKEN_SANDBOX_READY};
use crate::policy::{Policy, StacktraceRule};
use crate::proxy::{NetworkProxyServer, ProxyHandle};
use crate::result::{reason, RunResult, Status};
use crate::util::now_unix_millis;
use warden_sys::bpf::SockFilter;
use warden_sys::last_errno;

/// Which supervision transport a sandbox uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorKind {
    /// `PTRACE_EVENT_SECCOMP`-based supervision.
    #[default]
    Ptrace,
    /// Seccomp user-notification supervision.
    Unotify,
}

/// State shared between the caller-facing [`Sandbox`] handle and the
/// monitor thread.
pub(crate) struct Shared {
    /// Wall-clock deadline in Unix millis; 0 disarms.
    pub deadline_ms: AtomicI64,
    pub external_kill: AtomicBool,
    pub dump_stack: AtomicBool,
    /// Main sandboxee pid, once known. 0 before launch.
    pub main_pid: AtomicI32,
    /// Monitor thread id, once known; target for the wake signal.
    monitor_tid: AtomicI32,
    /// Wake fd for poll-based monitors.
    wake_fd: OwnedFd,
    result: Mutex<Option<RunResult>>,
    done: Condvar,
}

impl Shared {
    fn new() -> std::io::Result<Arc<Self>> {
        // SAFETY: eventfd with constant flags.
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Arc::new(Self {
            deadline_ms: AtomicI64::new(0),
            external_kill: AtomicBool::new(false),
            dump_stack: AtomicBool::new(false),
            main_pid: AtomicI32::new(0),
            monitor_tid: AtomicI32::new(0),
            // SAFETY: raw is a fresh eventfd.
            wake_fd: unsafe { OwnedFd::from_raw_fd(raw) },
            result: Mutex::new(None),
            done: Condvar::new(),
        }))
    }

    pub fn wake_fd(&self) -> &OwnedFd {
        &self.wake_fd
    }

    /// Kick the monitor out of its blocking wait.
    pub fn wake(&self) {
        let value = 1u64;
        // SAFETY: writes 8 bytes from a live u64.
        unsafe {
            libc::write(
                self.wake_fd.as_raw_fd(),
                (&value as *const u64).cast(),
                size_of::<u64>(),
            )
        };
        let tid = self.monitor_tid.load(Ordering::Relaxed);
        if tid != 0 {
            // SAFETY: directed signal to our own thread; SIGCHLD is
            // blocked there and only consumed by sigtimedwait.
            unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, libc::SIGCHLD) };
        }
    }

    /// Drain the wake fd after a poll wake-up.
    pub fn drain_wake(&self) {
        let mut value = 0u64;
        // SAFETY: reads 8 bytes into a live u64.
        unsafe {
            libc::read(
                self.wake_fd.as_raw_fd(),
                (&mut value as *mut u64).cast(),
                size_of::<u64>(),
            )
        };
    }

    /// Milliseconds until the deadline: `None` when disarmed,
    /// `Some(0)` when already past.
    pub fn deadline_remaining_ms(&self) -> Option<i64> {
        let deadline = self.deadline_ms.load(Ordering::Relaxed);
        if deadline == 0 {
            return None;
        }
        Some((deadline - now_unix_millis()).max(0))
    }

    fn publish(&self, result: RunResult) {
        let mut slot = self.result.lock().expect("result lock");
        // The result is written exactly once.
        debug_assert!(slot.is_none(), "result published twice");
        if slot.is_none() {
            *slot = Some(result);
        }
        drop(slot);
        self.done.notify_all();
    }
}

/// The caller never sees a raw monitor; this error covers pre-thread
/// failures only.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("monitor resources: {0}")]
    Resources(#[from] std::io::Error),
}

#[derive(Debug, Error)]
#[error("sandbox still running after {0:?}")]
pub struct WaitTimeout(pub Duration);

/// A running (or finished) sandbox: the public face of the monitor.
pub struct Sandbox {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Sandbox {
    /// Launch `executor` under `policy` with the chosen monitor variant.
    /// Returns as soon as the monitor thread is running; launch failures
    /// surface as a `SETUP_ERROR` result.
    pub fn run(
        executor: Executor,
        policy: Policy,
        kind: MonitorKind,
    ) -> Result<Self, SandboxError> {
        let shared = Shared::new()?;
        let thread_shared = Arc::clone(&shared);
        let policy = Arc::new(policy);
        let thread = thread::Builder::new()
            .name("warden-monitor".into())
            .spawn(move || {
                // SAFETY: gettid is always safe.
                let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
                thread_shared.monitor_tid.store(tid, Ordering::Relaxed);
                let result = match kind {
                    MonitorKind::Ptrace => ptrace::run(&executor, &policy, &thread_shared),
                    MonitorKind::Unotify => unotify::run(&executor, &policy, &thread_shared),
                };
                debug!(status = %result.status, "monitor finished");
                thread_shared.publish(result);
            })
            .map_err(SandboxError::Resources)?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Main sandboxee pid, once the launch got that far.
    pub fn pid(&self) -> Option<libc::pid_t> {
        match self.shared.main_pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Schedule a kill. The monitor performs it on its next wake.
    pub fn kill(&self) {
        self.shared.external_kill.store(true, Ordering::Relaxed);
        self.shared.wake();
    }

    /// Schedule a non-destructive stack dump of the main pid.
    pub fn dump_stack_trace(&self) {
        self.shared.dump_stack.store(true, Ordering::Relaxed);
        self.shared.wake();
    }

    /// Arm (or with `None` disarm) the wall-clock limit.
    pub fn set_walltime_limit(&self, limit: Option<Duration>) {
        let deadline = match limit {
            None => 0,
            Some(d) => now_unix_millis() + d.as_millis() as i64,
        };
        self.shared.deadline_ms.store(deadline, Ordering::Relaxed);
        self.shared.wake();
    }

    pub fn is_done(&self) -> bool {
        self.shared.result.lock().expect("result lock").is_some()
    }

    /// Block until the run finishes.
    pub fn wait(mut self) -> RunResult {
        let result = {
            let mut slot = self.shared.result.lock().expect("result lock");
            loop {
                if let Some(result) = (*slot).clone() {
                    break result;
                }
                slot = self.shared.done.wait(slot).expect("result wait");
            }
        };
        self.join_thread();
        result
    }

    /// Block for at most `timeout`. Does not kill the sandboxee on
    /// expiry; the caller decides what a stall means.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<RunResult, WaitTimeout> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.result.lock().expect("result lock");
        loop {
            if let Some(result) = (*slot).clone() {
                return Ok(result);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WaitTimeout(timeout));
            }
            let (guard, _) = self
                .shared
                .done
                .wait_timeout(slot, remaining)
                .expect("result wait");
            slot = guard;
        }
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.thread.take() {
            handle.join().ok();
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.thread.is_some() && !self.is_done() {
            // Dropping a live sandbox kills it; leaking a supervised
            // process is never the right default.
            self.kill();
        }
        self.join_thread();
    }
}

// ---- monitor-internal shared machinery -------------------------------------

/// View a compiled program as the raw bytes sent over comms.
pub(crate) fn program_bytes(program: &[SockFilter]) -> &[u8] {
    // SAFETY: SockFilter is plain old data with no padding surprises.
    unsafe {
        std::slice::from_raw_parts(
            program.as_ptr().cast::<u8>(),
            std::mem::size_of_val(program),
        )
    }
}

#[derive(Debug, Error)]
pub(crate) enum LaunchError {
    #[error("comms handshake: {0}")]
    Comms(#[from] CommsError),

    #[error("unexpected handshake token {0:#x}")]
    BadToken(u32),

    #[error("rlimits: {0}")]
    Limits(#[from] crate::rlimits::RlimitError),
}

impl LaunchError {
    pub fn into_result(self) -> RunResult {
        let code = match &self {
            Self::Comms(_) | Self::BadToken(_) => reason::FAILED_COMMS,
            Self::Limits(_) => reason::FAILED_LIMITS,
        };
        error!(error = %self, "sandboxee launch failed");
        RunResult::new(Status::SetupError, code)
    }
}

/// The supervisor half of the launch protocol: deliver the (transformed)
/// program and cwd, collect the unotify listener when asked to, wait for
/// readiness, apply limits, release the sandboxee.
pub(crate) fn launch_sandboxee(
    process: &mut SpawnedProcess,
    policy: &Policy,
    program: &[SockFilter],
    mode: u32,
    cwd: &str,
    want_listener: bool,
) -> Result<Option<OwnedFd>, LaunchError> {
    process.comms.send_u32(mode)?;
    process.comms.send_bytes(program_bytes(program))?;
    process.comms.send_string(cwd)?;

    let listener = if want_listener {
        Some(process.comms.recv_fd()?)
    } else {
        None
    };

    let token = process.comms.recv_u32()?;
    if token != TOKEN_SANDBOX_READY {
        return Err(LaunchError::BadToken(token));
    }

    policy.rlimits().apply_to(process.main_pid)?;
    process.comms.send_u32(TOKEN_GO)?;
    debug!(
        pid = process.main_pid,
        fork_server = process.fork_server_used,
        namespaces = process.namespaces_applied,
        "sandboxee released"
    );
    Ok(listener)
}

/// Start the proxy thread when the policy asks for one.
pub(crate) fn maybe_spawn_proxy(
    process: &mut SpawnedProcess,
    policy: &Policy,
    shared: &Arc<Shared>,
) -> Option<ProxyHandle> {
    let comms = process.proxy_comms.take()?;
    let waker = Arc::clone(shared);
    Some(NetworkProxyServer::spawn(
        comms,
        policy.allowed_hosts().clone(),
        Box::new(move || waker.wake()),
    ))
}

/// The flag-scheduled work a monitor may find on a wake-up. Exit and
/// violation *events* are not represented here: they arrive through the
/// variant's event transport and are serviced before any of these.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AsyncConditions {
    /// A terminal result is already decided; everything below is moot.
    pub result_pending: bool,
    pub network_violation: bool,
    pub external_kill: bool,
    pub deadline_expired: bool,
    pub dump_stack: bool,
}

/// What a monitor services on this wake-up, in the fixed priority
/// order: network violation, then external kill, then deadline, and a
/// stack-dump request only when nothing above it fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AsyncAction {
    NetworkViolation,
    ExternalKill,
    Deadline,
    DumpStack,
}

pub(crate) fn next_async_action(conditions: AsyncConditions) -> Option<AsyncAction> {
    if conditions.result_pending {
        return None;
    }
    if conditions.network_violation {
        return Some(AsyncAction::NetworkViolation);
    }
    if conditions.external_kill {
        return Some(AsyncAction::ExternalKill);
    }
    if conditions.deadline_expired {
        return Some(AsyncAction::Deadline);
    }
    if conditions.dump_stack {
        return Some(AsyncAction::DumpStack);
    }
    None
}

/// Whether the policy allows collecting a stack trace for this terminal
/// state.
pub(crate) fn stacktrace_allowed(rule: StacktraceRule, status: Status) -> bool {
    match status {
        Status::Violation => rule.on_violation,
        Status::Signaled => rule.on_signal,
        Status::Timeout => rule.on_timeout,
        Status::ExternalKill => rule.on_kill,
        _ => false,
    }
}

/// SIGKILL `main_pid`, escalating to its process group (and the
/// namespace init, if any) when it survives the first second.
pub(crate) fn ensure_killed(process: &SpawnedProcess) {
    // SAFETY: plain kill(2).
    if unsafe { libc::kill(process.main_pid, libc::SIGKILL) } != 0 {
        debug!(pid = process.main_pid, errno = ?last_errno(), "kill failed");
    }

    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        let mut pfd = libc::pollfd {
            fd: process.pidfd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        // SAFETY: polls one live fd.
        let ret = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as i32) };
        if ret > 0 {
            return; // pidfd readable: the process is gone
        }
        if ret == 0 {
            break; // escalation window expired
        }
        if last_errno() != rustix::io::Errno::INTR {
            break;
        }
    }

    warn!(pid = process.main_pid, "escalating kill to process group");
    // SAFETY: kill of a process group / pid.
    unsafe {
        libc::kill(-process.main_pid, libc::SIGKILL);
        if let Some(init_pid) = process.init_pid {
            libc::kill(init_pid, libc::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_bytes_roundtrip() {
        let prog = [
            warden_sys::bpf::load_syscall_nr(),
            warden_sys::bpf::ret(warden_sys::bpf::SECCOMP_RET_ALLOW),
        ];
        let bytes = program_bytes(&prog);
        assert_eq!(bytes.len(), 16);
        // SAFETY: same layout back.
        let back = unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<SockFilter>(), 2) };
        assert_eq!(back, &prog);
    }

    #[test]
    fn async_priority_order_is_fixed() {
        let mut all = AsyncConditions {
            result_pending: false,
            network_violation: true,
            external_kill: true,
            deadline_expired: true,
            dump_stack: true,
        };
        assert_eq!(
            next_async_action(all),
            Some(AsyncAction::NetworkViolation)
        );
        all.network_violation = false;
        assert_eq!(next_async_action(all), Some(AsyncAction::ExternalKill));
        all.external_kill = false;
        assert_eq!(next_async_action(all), Some(AsyncAction::Deadline));
        all.deadline_expired = false;
        assert_eq!(next_async_action(all), Some(AsyncAction::DumpStack));
        all.dump_stack = false;
        assert_eq!(next_async_action(all), None);
    }

    #[test]
    fn decided_result_suppresses_every_request() {
        let all = AsyncConditions {
            result_pending: true,
            network_violation: true,
            external_kill: true,
            deadline_expired: true,
            dump_stack: true,
        };
        assert_eq!(next_async_action(all), None);
    }

    #[test]
    fn dump_stack_never_preempts_a_kill_trigger() {
        // A concurrent stack-dump request must not get serviced ahead
        // of any condition that terminates the sandboxee.
        for kill_trigger in 0..3 {
            let conditions = AsyncConditions {
                result_pending: false,
                network_violation: kill_trigger == 0,
                external_kill: kill_trigger == 1,
                deadline_expired: kill_trigger == 2,
                dump_stack: true,
            };
            assert_ne!(
                next_async_action(conditions),
                Some(AsyncAction::DumpStack),
                "dump-stack preempted kill trigger {kill_trigger}"
            );
        }
    }

    #[test]
    fn stacktrace_gating() {
        let rule = StacktraceRule {
            on_violation: true,
            on_signal: false,
            on_timeout: true,
            on_kill: false,
        };
        assert!(stacktrace_allowed(rule, Status::Violation));
        assert!(!stacktrace_allowed(rule, Status::Signaled));
        assert!(stacktrace_allowed(rule, Status::Timeout));
        assert!(!stacktrace_allowed(rule, Status::ExternalKill));
        assert!(!stacktrace_allowed(rule, Status::Ok));
        assert!(!stacktrace_allowed(rule, Status::SetupError));
    }

    #[test]
    fn shared_deadline_accounting() {
        let shared = Shared::new().unwrap();
        assert_eq!(shared.deadline_remaining_ms(), None);
        shared
            .deadline_ms
            .store(now_unix_millis() + 10_000, Ordering::Relaxed);
        let remaining = shared.deadline_remaining_ms().unwrap();
        assert!(remaining > 8_000 && remaining <= 10_000);
        shared.deadline_ms.store(1, Ordering::Relaxed);
        assert_eq!(shared.deadline_remaining_ms(), Some(0));
    }

    #[test]
    fn wake_fd_roundtrip() {
        let shared = Shared::new().unwrap();
        shared.wake();
        let mut pfd = libc::pollfd {
            fd: shared.wake_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: polls one live fd.
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 0) }, 1);
        shared.drain_wake();
        pfd.revents = 0;
        // SAFETY: polls one live fd.
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 0) }, 0);
    }

    #[test]
    fn publish_and_wait_timeout() {
        let shared = Shared::new().unwrap();
        let waiter = Arc::clone(&shared);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waiter.publish(RunResult::ok(0));
        });
        let mut slot = shared.result.lock().unwrap();
        while slot.is_none() {
            let (guard, timed_out) = shared
                .done
                .wait_timeout(slot, Duration::from_secs(5))
                .unwrap();
            slot = guard;
            assert!(!timed_out.timed_out());
        }
        assert_eq!(slot.as_ref().unwrap().status, Status::Ok);
        drop(slot);
        handle.join().unwrap();
    }
}
