//! Seccomp-unotify-based monitor.
//!
//! The installed filter answers `USER_NOTIF` wherever the base policy
//! would kill or trace; the violating thread blocks in-kernel while this
//! monitor reads the `seccomp_notif`, re-runs the *untransformed*
//! program on the notification's `seccomp_data` and decides:
//!
//! - base verdict `ALLOW` - answer `SECCOMP_USER_NOTIF_FLAG_CONTINUE`
//! - base verdict `ERRNO` - answer the errno (belt and braces; the
//!   kernel normally short-circuits these without notifying)
//! - base verdict `KILL` or `TRACE` - a violation: record, kill
//!
//! Every response carries the exact id received; a stale id (the target
//! died meanwhile) is ignored. The event pump is a plain `poll` over the
//! sandboxee's pidfd, the notification fd and the monitor wake eventfd,
//! so control-side requests take effect immediately. Flag-scheduled
//! requests are serviced in the shared fixed priority order, with
//! stack-dump requests last.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::executor::{Executor, SpawnedProcess, MODE_UNOTIFY};
use crate::filter::eval::evaluate;
use crate::monitor::{
    ensure_killed, launch_sandboxee, maybe_spawn_proxy, next_async_action, stacktrace_allowed,
    AsyncAction, AsyncConditions, Shared,
};
use crate::policy::Policy;
use crate::proxy::ProxyHandle;
use crate::result::{reason, ResourceUsage, RunResult, Status};
use crate::stacktrace;
use crate::syscall::{CpuArch, Syscall};
use warden_sys::bpf::{
    SECCOMP_RET_ACTION_FULL, SECCOMP_RET_ALLOW, SECCOMP_RET_DATA, SECCOMP_RET_ERRNO,
    SECCOMP_RET_TRACE,
};
use warden_sys::last_errno;
use warden_sys::seccomp::{notif_sizes, NotifBuffers, SECCOMP_USER_NOTIF_FLAG_CONTINUE};

/// Upper bound on one poll round; deadline checks never wait longer.
const MAX_POLL_MS: i64 = 30_000;

pub(crate) fn run(executor: &Executor, policy: &Policy, shared: &Arc<Shared>) -> RunResult {
    let sizes = match notif_sizes() {
        Ok(sizes) => sizes,
        Err(errno) => {
            error!(?errno, "SECCOMP_GET_NOTIF_SIZES failed");
            return RunResult::new(Status::SetupError, reason::FAILED_NOTIFY);
        }
    };

    let process = match executor.spawn(policy) {
        Ok(process) => process,
        Err(err) => {
            error!(error = %err, "spawn failed");
            return RunResult::new(Status::SetupError, reason::FAILED_SPAWN);
        }
    };
    shared.main_pid.store(process.main_pid, Ordering::Relaxed);

    let mut monitor = UnotifyMonitor {
        policy,
        shared,
        process,
        proxy: None,
        listener: None,
        buffers: NotifBuffers::new(&sizes),
        cwd: executor.cwd_string(),
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

struct UnotifyMonitor<'a> {
    policy: &'a Policy,
    shared: &'a Arc<Shared>,
    process: SpawnedProcess,
    proxy: Option<ProxyHandle>,
    listener: Option<OwnedFd>,
    buffers: NotifBuffers,
    cwd: String,
    timed_out: bool,
    external_kill_sent: bool,
    network_violation: bool,
    kill_issued: bool,
    pending: Option<RunResult>,
}

impl UnotifyMonitor<'_> {
    fn launch(&mut self) -> Result<(), RunResult> {
        let program = self.policy.program_for_unotify();
        let listener = launch_sandboxee(
            &mut self.process,
            self.policy,
            &program,
            MODE_UNOTIFY,
            &self.cwd,
            true,
        )
        .map_err(|err| err.into_result())?;

        match listener {
            Some(fd) => self.listener = Some(fd),
            None => {
                error!("launch returned no notification fd");
                return Err(RunResult::new(Status::SetupError, reason::FAILED_NOTIFY));
            }
        }
        self.proxy = maybe_spawn_proxy(&mut self.process, self.policy, self.shared);
        Ok(())
    }

    fn event_loop(&mut self) -> RunResult {
        loop {
            self.check_async_conditions();

            let listener_fd = self
                .listener
                .as_ref()
                .map_or(-1, |fd| fd.as_raw_fd());
            let mut pfds = [
                libc::pollfd {
                    fd: self.process.pidfd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: listener_fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.shared.wake_fd().as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            let mut timeout = MAX_POLL_MS;
            if !self.timed_out {
                if let Some(remaining) = self.shared.deadline_remaining_ms() {
                    timeout = timeout.min(remaining.max(1));
                }
            }

            // SAFETY: pfds is a live array of three descriptors.
            let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout as i32) };
            if ret == -1 {
                if last_errno() == rustix::io::Errno::INTR {
                    continue;
                }
                error!(errno = ?last_errno(), "poll failed");
                self.pending
                    .get_or_insert(RunResult::new(Status::InternalError, reason::FAILED_MONITOR));
                self.kill_sandboxee();
                // Fall through; the pidfd will report the death.
                continue;
            }
            if ret == 0 {
                continue; // deadline or periodic wake; re-check conditions
            }

            if pfds[2].revents & libc::POLLIN != 0 {
                self.shared.drain_wake();
                continue;
            }
            if pfds[0].revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                self.process.comms.terminate();
                return self.collect_exit_status();
            }
            if pfds[1].revents & libc::POLLIN != 0 {
                self.handle_notification();
            }
        }
    }

    /// Service the highest-priority asynchronous condition, if any.
    /// Sandboxee exit and violation notifications outrank all of these
    /// and come in through the poll dispatch instead.
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
            deadline_expired: !self.timed_out && self.shared.deadline_remaining_ms() == Some(0),
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
                match stacktrace::capture_attached(self.process.main_pid) {
                    Ok(frames) => {
                        for (i, frame) in frames.iter().enumerate() {
                            info!(pid = self.process.main_pid, "stack #{i}: {frame}");
                        }
                    }
                    Err(err) => warn!(error = %err, "stack dump failed"),
                }
            }
            None => {}
        }
    }

    fn terminate_with(&mut self, mut result: RunResult) {
        if stacktrace_allowed(self.policy.stacktrace_rule(), result.status)
            && result.stack_trace.is_empty()
        {
            // The target may be blocked in-kernel on a notification or
            // already reaped; both make this best-effort.
            match stacktrace::capture_attached(self.process.main_pid) {
                Ok(frames) => result.stack_trace = frames,
                Err(err) => debug!(error = %err, "stack capture failed"),
            }
        }
        self.pending = Some(result);
        self.kill_sandboxee();
    }

    fn kill_sandboxee(&mut self) {
        if self.kill_issued {
            return;
        }
        self.kill_issued = true;
        ensure_killed(&self.process);
        self.drain_notifications();
    }

    /// After a kill, answer anything still queued with CONTINUE so
    /// blocked threads unwind and the process can die.
    fn drain_notifications(&mut self) {
        let Some(listener) = &self.listener else { return };
        let fd = listener.as_raw_fd();
        loop {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: polls one live fd.
            if unsafe { libc::poll(&mut pfd, 1, 0) } != 1 || pfd.revents & libc::POLLIN == 0 {
                return;
            }
            let id = match self.buffers.recv(fd) {
                Ok(notif) => notif.id,
                Err(_) => return,
            };
            self.buffers
                .send(fd, id, 0, 0, SECCOMP_USER_NOTIF_FLAG_CONTINUE)
                .ok();
        }
    }

    fn handle_notification(&mut self) {
        let Some(listener) = &self.listener else { return };
        let fd = listener.as_raw_fd();

        let (id, data, pid) = match self.buffers.recv(fd) {
            Ok(notif) => (notif.id, notif.data, notif.pid as libc::pid_t),
            Err(errno) => {
                if errno == rustix::io::Errno::NOENT {
                    debug!("notification went stale before receive");
                    return;
                }
                error!(?errno, "notification receive failed");
                self.pending
                    .get_or_insert(RunResult::new(Status::InternalError, reason::FAILED_NOTIFY));
                self.kill_sandboxee();
                return;
            }
        };

        let verdict = match evaluate(self.policy.program(), &data) {
            Ok(verdict) => verdict,
            Err(err) => {
                error!(error = %err, "policy re-evaluation failed");
                self.pending
                    .get_or_insert(RunResult::new(Status::InternalError, reason::FAILED_NOTIFY));
                self.kill_sandboxee();
                return;
            }
        };

        match verdict & SECCOMP_RET_ACTION_FULL {
            SECCOMP_RET_ALLOW => self.respond(id, 0, 0, SECCOMP_USER_NOTIF_FLAG_CONTINUE),
            SECCOMP_RET_ERRNO => {
                let errno = (verdict & SECCOMP_RET_DATA) as i32;
                self.respond(id, 0, -errno, 0);
            }
            action => {
                let arch = if action == SECCOMP_RET_TRACE {
                    CpuArch::from_trace_data((verdict & SECCOMP_RET_DATA) as u16)
                } else {
                    CpuArch::from_audit(data.arch)
                };
                let syscall = Syscall::new(
                    arch,
                    i64::from(data.nr),
                    data.args,
                    pid,
                    data.instruction_pointer,
                );
                self.handle_violation(id, syscall);
            }
        }
    }

    fn handle_violation(&mut self, id: u64, syscall: Syscall) {
        if self.pending.is_some() {
            // Already terminating; just unwind the blocked thread.
            self.respond(id, 0, 0, SECCOMP_USER_NOTIF_FLAG_CONTINUE);
            return;
        }

        let arch_switch = syscall.arch != CpuArch::host();
        warn!(syscall = %syscall, arch_switch, "SANDBOX VIOLATION");

        let mut result = RunResult::new(Status::Violation, syscall.nr);
        if arch_switch {
            result.violation_message = Some(format!(
                "syscall issued under foreign architecture {}",
                syscall.arch.name()
            ));
        }
        if stacktrace_allowed(self.policy.stacktrace_rule(), Status::Violation) {
            match stacktrace::capture_attached(syscall.pid) {
                Ok(frames) => result.stack_trace = frames,
                Err(err) => debug!(error = %err, "stack capture failed"),
            }
        }
        result.syscall = Some(syscall);
        self.pending = Some(result);
        self.kill_sandboxee();
        // Unblock the violating thread; SIGKILL beats the continue.
        self.respond(id, 0, 0, SECCOMP_USER_NOTIF_FLAG_CONTINUE);
    }

    fn respond(&mut self, id: u64, val: i64, error: i32, flags: u32) {
        let Some(listener) = &self.listener else { return };
        let fd = listener.as_raw_fd();
        if let Err(errno) = self.buffers.send(fd, id, val, error, flags) {
            if errno == rustix::io::Errno::NOENT {
                debug!(id, "response to stale notification dropped");
            } else {
                error!(?errno, "notification response failed");
                self.pending
                    .get_or_insert(RunResult::new(Status::InternalError, reason::FAILED_NOTIFY));
                self.kill_sandboxee();
            }
        }
    }

    /// The pidfd fired: reap the sandboxee and fold the exit status with
    /// whatever terminal condition was already pending.
    fn collect_exit_status(&mut self) -> RunResult {
        let mut status = 0;
        // SAFETY: zeroed rusage is a valid out-buffer.
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: live out-pointers; __WALL to cover clone children.
        let pid = unsafe {
            libc::wait4(
                self.process.main_pid,
                &mut status,
                libc::__WALL,
                &mut rusage,
            )
        };
        if pid != self.process.main_pid {
            error!(errno = ?last_errno(), "reaping sandboxee failed");
            return self
                .pending
                .take()
                .unwrap_or_else(|| RunResult::new(Status::InternalError, reason::FAILED_MONITOR));
        }
        self.process.exit_observed = true;
        debug!(
            pid,
            elapsed_ms = self.process.start_time.elapsed().as_millis() as u64,
            "sandboxee exit observed"
        );

        let usage = ResourceUsage::from_rusage(&rusage);
        let mut result = if libc::WIFEXITED(status) {
            match self.pending.take() {
                Some(pending) => pending,
                None => RunResult::new(Status::Ok, i64::from(libc::WEXITSTATUS(status))),
            }
        } else if libc::WIFSIGNALED(status) {
            match self.pending.take() {
                Some(pending) => pending,
                None => RunResult::new(Status::Signaled, i64::from(libc::WTERMSIG(status))),
            }
        } else {
            self.pending
                .take()
                .unwrap_or_else(|| RunResult::new(Status::InternalError, reason::FAILED_MONITOR))
        };
        result.rusage = Some(usage);
        result
    }
}
