//! Ptrace-based monitor.
//!
//! The sandboxee runs under `PTRACE_SEIZE` with `TRACESECCOMP`; the
//! installed filter turns every deny into an arch-tagged
//! `SECCOMP_RET_TRACE`, so a violation arrives as a
//! `PTRACE_EVENT_SECCOMP` stop with full register state. The monitor
//! thread parks in `sigtimedwait(SIGCHLD)` with a 500 ms wake-up period
//! and reaps every eligible tracee with `wait4(WNOHANG | __WALL)` after
//! each wake.
//!
//! ## The execve latch
//!
//! Until the launch stub's final `execveat` reports `PTRACE_EVENT_EXEC`,
//! the child is still running supervisor-provided code: seccomp events
//! in that window are suppressed (continued) and the wall-clock deadline
//! stays unarmed. The `execveat` itself is recognized by its
//! `TRACE_DATA_EXEC` payload.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::executor::{Executor, SpawnedProcess, MODE_PTRACE};
use crate::monitor::{
    ensure_killed, launch_sandboxee, maybe_spawn_proxy, next_async_action, stacktrace_allowed,
    AsyncAction, AsyncConditions, Shared,
};
use crate::policy::{Policy, TRACE_DATA_EXEC};
use crate::proxy::ProxyHandle;
use crate::regs::Regs;
use crate::result::{reason, ResourceUsage, RunResult, Status};
use crate::stacktrace;
use crate::syscall::CpuArch;
use warden_sys::last_errno;

/// Wake-up period for `sigtimedwait`, bounding how stale an async
/// request can get.
const WAKE_PERIOD_MS: i64 = 500;

const PTRACE_SEIZE_OPTIONS: libc::c_ulong = (libc::PTRACE_O_TRACESECCOMP
    | libc::PTRACE_O_TRACEEXIT
    | libc::PTRACE_O_TRACECLONE
    | libc::PTRACE_O_TRACEFORK
    | libc::PTRACE_O_TRACEVFORK
    | libc::PTRACE_O_TRACEEXEC
    | libc::PTRACE_O_EXITKILL) as libc::c_ulong;

pub(crate) fn run(executor: &Executor, policy: &Policy, shared: &Arc<Shared>) -> RunResult {
    block_sigchld();

    let process = match executor.spawn(policy) {
        Ok(process) => process,
        Err(err) => {
            error!(error = %err, "spawn failed");
            return RunResult::new(Status::SetupError, reason::FAILED_SPAWN);
        }
    };
    shared.main_pid.store(process.main_pid, Ordering::Relaxed);

    let mut monitor = PtraceMonitor {
        policy,
        shared,
        process,
        proxy: None,
        cwd: executor.cwd_string(),
        active: false,
        timed_out: false,
        external_kill_sent: false,
        network_violation: false,
        kill_issued: false,
        pending: None,
    };

    match monitor.launch() {
        Ok(()) => monitor.event_loop(),
        Err(result) => {
            ensure_killed(&monitor.process);
            monitor.process.comms.terminate();
            result
        }
    }
}

struct PtraceMonitor<'a> {
    policy: &'a Policy,
    shared: &'a Arc<Shared>,
    process: SpawnedProcess,
    proxy: Option<ProxyHandle>,
    cwd: String,
    /// Cleared execve latch: true once the sandboxee runs its own code.
    active: bool,
    timed_out: bool,
    external_kill_sent: bool,
    network_violation: bool,
    kill_issued: bool,
    /// Result decided while waiting for the sandboxee to die.
    pending: Option<RunResult>,
}

impl PtraceMonitor<'_> {
    fn launch(&mut self) -> Result<(), RunResult> {
        // Attach before the child can pass its policy handshake; every
        // later fork/clone inherits the seize options.
        // SAFETY: PTRACE_SEIZE with constant options.
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SEIZE,
                self.process.main_pid,
                0,
                PTRACE_SEIZE_OPTIONS,
            )
        };
        if ret != 0 {
            error!(errno = ?last_errno(), "PTRACE_SEIZE failed");
            return Err(RunResult::new(Status::SetupError, reason::FAILED_PTRACE));
        }

        let program = self.policy.program_for_ptrace();
        launch_sandboxee(
            &mut self.process,
            self.policy,
            &program,
            MODE_PTRACE,
            &self.cwd,
            false,
        )
        .map_err(|err| err.into_result())?;

        self.proxy = maybe_spawn_proxy(&mut self.process, self.policy, self.shared);
        Ok(())
    }

    fn event_loop(&mut self) -> RunResult {
        loop {
            // Events first: an observed exit or violation outranks
            // every flag-scheduled action below.
            if let Some(result) = self.reap_all() {
                self.process.comms.terminate();
                return result;
            }
            self.check_async_conditions();
            self.wait_for_signal();
        }
    }

    /// Service the highest-priority asynchronous condition, if any.
    /// Each kill trigger fires once and schedules a kill; the loop then
    /// drains until the exit status arrives.
    fn check_async_conditions(&mut self) {
        let conditions = AsyncConditions {
            result_pending: self.pending.is_some(),
            network_violation: !self.network_violation
                && self
                    .proxy
                    .as_ref()
                    .is_some_and(|proxy| proxy.violation_occurred.load(Ordering::Acquire)),
            external_kill: !self.external_kill_sent
                && self.shared.external_kill.load(Ordering::Relaxed),
            deadline_expired: self.active
                && !self.timed_out
                && self.shared.deadline_remaining_ms() == Some(0),
            dump_stack: self.shared.dump_stack.load(Ordering::Relaxed),
        };
        match next_async_action(conditions) {
            Some(AsyncAction::NetworkViolation) => {
                self.network_violation = true;
                let message = self
                    .proxy
                    .as_ref()
                    .and_then(|proxy| proxy.violation_message.lock().ok())
                    .map(|m| (*m).clone())
                    .unwrap_or_default();
                warn!(message = %message, "network violation");
                let mut result = RunResult::new(Status::Violation, reason::VIOLATION_NETWORK);
                result.violation_message = Some(message);
                self.terminate_with(result);
            }
            Some(AsyncAction::ExternalKill) => {
                self.external_kill_sent = true;
                info!(pid = self.process.main_pid, "external kill requested");
                self.terminate_with(RunResult::new(Status::ExternalKill, 0));
            }
            Some(AsyncAction::Deadline) => {
                self.timed_out = true;
                info!(pid = self.process.main_pid, "wall-time limit hit");
                self.terminate_with(RunResult::new(Status::Timeout, 0));
            }
            Some(AsyncAction::DumpStack) => {
                self.shared.dump_stack.store(false, Ordering::Relaxed);
                self.dump_stack_nondestructive();
            }
            None => {}
        }
    }

    /// Record the terminal result, grab a stack trace if allowed, kill.
    fn terminate_with(&mut self, mut result: RunResult) {
        if stacktrace_allowed(self.policy.stacktrace_rule(), result.status)
            && result.stack_trace.is_empty()
        {
            match self.interrupt_and_capture() {
                Ok(frames) => result.stack_trace = frames,
                Err(err) => debug!(error = %err, "stack capture failed"),
            }
        }
        self.pending = Some(result);
        self.kill_sandboxee();
    }

    /// `PTRACE_KILL` first; when that has no effect inside the bounded
    /// window, plain SIGKILL with group escalation.
    fn kill_sandboxee(&mut self) {
        if self.kill_issued {
            return;
        }
        self.kill_issued = true;
        // SAFETY: PTRACE_KILL on our own tracee.
        unsafe { libc::ptrace(libc::PTRACE_KILL, self.process.main_pid, 0, 0) };
        ensure_killed(&self.process);
    }

    fn wait_for_signal(&self) {
        let mut remaining = WAKE_PERIOD_MS;
        if self.active {
            if let Some(ms) = self.shared.deadline_remaining_ms() {
                remaining = remaining.min(ms.max(1));
            }
        }
        // SAFETY: constructs an empty set and adds one signal.
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGCHLD);
        }
        let timeout = libc::timespec {
            tv_sec: remaining / 1000,
            tv_nsec: (remaining % 1000) * 1_000_000,
        };
        // SAFETY: set and timeout are live locals; info out is unused.
        unsafe { libc::sigtimedwait(&set, std::ptr::null_mut(), &timeout) };
    }

    /// Reap every eligible tracee. Returns the final result once the
    /// main pid's exit status was observed.
    fn reap_all(&mut self) -> Option<RunResult> {
        loop {
            let mut status = 0;
            // SAFETY: zeroed rusage is a valid out-buffer.
            let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
            // SAFETY: status and rusage are live out-pointers.
            let pid = unsafe {
                libc::wait4(-1, &mut status, libc::WNOHANG | libc::__WALL, &mut rusage)
            };
            match pid {
                0 => return None,
                -1 => {
                    if last_errno() == rustix::io::Errno::CHILD {
                        // No children left at all; only plausible after
                        // the main exit was consumed.
                        return self.pending.take();
                    }
                    return None;
                }
                pid if pid == self.process.main_pid => {
                    if libc::WIFEXITED(status) {
                        return Some(self.final_exit(
                            i64::from(libc::WEXITSTATUS(status)),
                            false,
                            &rusage,
                        ));
                    }
                    if libc::WIFSIGNALED(status) {
                        return Some(self.final_exit(
                            i64::from(libc::WTERMSIG(status)),
                            true,
                            &rusage,
                        ));
                    }
                    if libc::WIFSTOPPED(status) {
                        self.handle_stop(pid, status);
                    }
                }
                pid => {
                    if libc::WIFSTOPPED(status) {
                        self.handle_stop(pid, status);
                    }
                    // Exits of auxiliary tracees carry no policy signal.
                }
            }
        }
    }

    fn final_exit(&mut self, code: i64, signaled: bool, rusage: &libc::rusage) -> RunResult {
        self.process.exit_observed = true;
        debug!(
            pid = self.process.main_pid,
            elapsed_ms = self.process.start_time.elapsed().as_millis() as u64,
            "sandboxee exit observed"
        );
        let usage = ResourceUsage::from_rusage(rusage);
        let mut result = match self.pending.take() {
            Some(pending) => pending,
            None if signaled => RunResult::new(Status::Signaled, code),
            None => RunResult::new(Status::Ok, code),
        };
        result.rusage = Some(usage);
        result
    }

    fn handle_stop(&mut self, pid: libc::pid_t, status: i32) {
        let stopsig = libc::WSTOPSIG(status);
        let event = (status >> 16) & 0xff;
        match event {
            libc::PTRACE_EVENT_SECCOMP => self.event_seccomp(pid),
            libc::PTRACE_EVENT_EXEC => {
                if pid == self.process.main_pid && !self.active {
                    self.active = true;
                    debug!(pid, "active monitoring armed");
                }
                self.cont(pid, 0);
            }
            libc::PTRACE_EVENT_EXIT
            | libc::PTRACE_EVENT_CLONE
            | libc::PTRACE_EVENT_FORK
            | libc::PTRACE_EVENT_VFORK => {
                self.cont(pid, 0);
            }
            libc::PTRACE_EVENT_STOP => {
                // Group stop: park the tracee so job control keeps
                // working, without swallowing the stop.
                if matches!(
                    stopsig,
                    libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU
                ) {
                    // SAFETY: PTRACE_LISTEN on a group-stopped tracee.
                    unsafe { libc::ptrace(libc::PTRACE_LISTEN, pid, 0, 0) };
                } else {
                    self.cont(pid, 0);
                }
            }
            0 => self.cont(pid, stopsig),
            _ => self.cont(pid, 0),
        }
    }

    fn event_seccomp(&mut self, pid: libc::pid_t) {
        let mut msg: libc::c_ulong = 0;
        // SAFETY: msg is a live out-pointer.
        let ret = unsafe { libc::ptrace(libc::PTRACE_GETEVENTMSG, pid, 0, &mut msg) };
        if ret != 0 {
            self.cont(pid, 0);
            return;
        }
        let data = msg as u16;

        if data == TRACE_DATA_EXEC {
            // The launch stub's execveat; the EXEC event arms the latch.
            self.cont(pid, 0);
            return;
        }
        if !self.active || self.pending.is_some() {
            // Pre-execve noise from the launch stub, or already dying.
            self.cont(pid, 0);
            return;
        }

        let arch = CpuArch::from_trace_data(data);
        let syscall = match Regs::fetch(pid) {
            Ok(regs) => regs.syscall(arch),
            Err(err) => {
                error!(pid, error = %err, "reading registers failed");
                let result = RunResult::new(Status::InternalError, reason::FAILED_PTRACE);
                self.pending = Some(result);
                self.kill_sandboxee();
                return;
            }
        };

        let arch_switch = arch != CpuArch::host();
        warn!(
            syscall = %syscall,
            arch_switch,
            "SANDBOX VIOLATION"
        );

        let mut result = RunResult::new(Status::Violation, syscall.nr);
        if arch_switch {
            result.violation_message = Some(format!(
                "syscall issued under foreign architecture {}",
                arch.name()
            ));
        }
        if stacktrace_allowed(self.policy.stacktrace_rule(), Status::Violation) {
            match stacktrace::capture_stopped(pid) {
                Ok(frames) => result.stack_trace = frames,
                Err(err) => debug!(error = %err, "stack capture failed"),
            }
        }
        result.syscall = Some(syscall);
        self.pending = Some(result);
        self.kill_sandboxee();
    }

    /// Stop the main pid long enough to walk its stack.
    ///
    /// The stop is only *peeked* (`WNOWAIT`): its wait status stays
    /// queued and the reap loop dispatches it afterwards, so a stop
    /// that is really a queued `PTRACE_EVENT_SECCOMP` keeps its full
    /// classify-and-kill path and is never continued past the policy
    /// here. In that case no frames are captured; the violation
    /// outranks the stack walk.
    fn interrupt_and_capture(&mut self) -> std::io::Result<Vec<String>> {
        let pid = self.process.main_pid;
        // SAFETY: PTRACE_INTERRUPT on our own tracee.
        if unsafe { libc::ptrace(libc::PTRACE_INTERRUPT, pid, 0, 0) } != 0 {
            return Err(std::io::Error::last_os_error());
        }

        // SAFETY: zeroed siginfo is a valid out-buffer.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        loop {
            // SAFETY: info is a live out-pointer.
            let ret = unsafe {
                libc::waitid(
                    libc::P_PID,
                    pid as libc::id_t,
                    &mut info,
                    libc::WSTOPPED | libc::WEXITED | libc::WNOWAIT,
                )
            };
            if ret == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            break;
        }

        if info.si_code != libc::CLD_TRAPPED && info.si_code != libc::CLD_STOPPED {
            // Died before stopping; the reap loop collects the status.
            return Err(std::io::Error::other("sandboxee exited before the stack walk"));
        }
        // For ptrace stops si_status carries the event in its high bits.
        // SAFETY: si_status is valid for child-wait siginfo.
        let event = (unsafe { info.si_status() } >> 8) & 0xff;
        if event == libc::PTRACE_EVENT_SECCOMP {
            return Err(std::io::Error::other("seccomp event pending, not walking stack"));
        }

        // The tracee is in a ptrace-stop; walk it. No resume here: the
        // still-queued stop is consumed and continued by the reap
        // loop's normal dispatch.
        stacktrace::capture_stopped(pid)
    }

    fn dump_stack_nondestructive(&mut self) {
        match self.interrupt_and_capture() {
            Ok(frames) => {
                for (i, frame) in frames.iter().enumerate() {
                    info!(pid = self.process.main_pid, "stack #{i}: {frame}");
                }
            }
            Err(err) => warn!(error = %err, "stack dump failed"),
        }
    }

    fn cont(&self, pid: libc::pid_t, signal: i32) {
        // SAFETY: PTRACE_CONT on a stopped tracee, forwarding `signal`.
        let ret = unsafe { libc::ptrace(libc::PTRACE_CONT, pid, 0, signal) };
        if ret != 0 && last_errno() != rustix::io::Errno::SRCH {
            debug!(pid, errno = ?last_errno(), "PTRACE_CONT failed");
        }
    }
}

fn block_sigchld() {
    // SAFETY: builds a one-signal mask and applies it to this thread.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}
