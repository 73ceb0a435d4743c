//! The outcome of one sandbox run.

use std::time::Duration;

use crate::syscall::Syscall;

/// Terminal state of a sandbox run. Written exactly once per run, before
/// the done notification fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Sandboxee exited on its own; `reason_code` is the exit code.
    Ok,
    /// Policy violation; `reason_code` is the syscall number, or a
    /// negative code from [`reason`] for non-syscall violations.
    Violation,
    /// Killed by a signal unrelated to the sandbox; `reason_code` is the
    /// signal number.
    Signaled,
    /// Wall-clock deadline expired.
    Timeout,
    /// An external `kill()` request was honored.
    ExternalKill,
    /// Setup failed before the sandboxee ran any of its own code.
    SetupError,
    /// The supervisor hit an unexpected condition.
    InternalError,
}

impl Status {
    /// Exit code for an embedding CLI: success maps to 0, violations to
    /// the SIGSYS convention, timeouts/kills to their signal equivalents,
    /// everything else to a generic failure.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Violation => 128 + libc::SIGSYS,
            Self::Timeout => 128 + libc::SIGALRM,
            Self::ExternalKill => 128 + libc::SIGKILL,
            Self::Signaled | Self::SetupError | Self::InternalError => 1,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Violation => "VIOLATION",
            Self::Signaled => "SIGNALED",
            Self::Timeout => "TIMEOUT",
            Self::ExternalKill => "EXTERNAL_KILL",
            Self::SetupError => "SETUP_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// Non-syscall reason codes.
pub mod reason {
    /// Network proxy flagged a disallowed `connect()`.
    pub const VIOLATION_NETWORK: i64 = -1;
    /// Comms handshake with the sandboxee failed.
    pub const FAILED_COMMS: i64 = -2;
    /// Seccomp-unotify setup or response delivery failed.
    pub const FAILED_NOTIFY: i64 = -3;
    /// The monitor event loop hit an unexpected condition.
    pub const FAILED_MONITOR: i64 = -4;
    /// Attaching or configuring ptrace failed.
    pub const FAILED_PTRACE: i64 = -5;
    /// Applying resource limits failed.
    pub const FAILED_LIMITS: i64 = -6;
    /// Spawning the sandboxee failed.
    pub const FAILED_SPAWN: i64 = -7;
}

/// Resource usage of the sandboxee, condensed from `struct rusage`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub user_time: Duration,
    pub system_time: Duration,
    pub max_rss_kib: i64,
}

impl ResourceUsage {
    pub fn from_rusage(ru: &libc::rusage) -> Self {
        let tv = |t: &libc::timeval| {
            Duration::new(t.tv_sec.max(0) as u64, (t.tv_usec.max(0) as u32) * 1000)
        };
        Self {
            user_time: tv(&ru.ru_utime),
            system_time: tv(&ru.ru_stime),
            max_rss_kib: ru.ru_maxrss,
        }
    }
}

/// Everything known about a finished run. Produced exactly once by the
/// monitor; readable after [`Sandbox::wait`](crate::Sandbox::wait)
/// returns.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: Status,
    pub reason_code: i64,
    /// The violating syscall, when the run ended in a syscall violation.
    pub syscall: Option<Syscall>,
    /// Captured frames, when stack collection was possible and allowed.
    pub stack_trace: Vec<String>,
    pub rusage: Option<ResourceUsage>,
    /// Human-readable detail for network violations.
    pub violation_message: Option<String>,
}

impl RunResult {
    pub fn new(status: Status, reason_code: i64) -> Self {
        Self {
            status,
            reason_code,
            syscall: None,
            stack_trace: Vec::new(),
            rusage: None,
            violation_message: None,
        }
    }

    pub fn ok(exit_code: i32) -> Self {
        Self::new(Status::Ok, i64::from(exit_code))
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// One-line human summary.
    pub fn describe(&self) -> String {
        match self.status {
            Status::Ok => format!("exited with code {}", self.reason_code),
            Status::Violation => match (&self.syscall, &self.violation_message) {
                (_, Some(msg)) => format!("violation: {msg}"),
                (Some(call), None) => format!("syscall violation: {call}"),
                (None, None) => format!("violation, reason code {}", self.reason_code),
            },
            Status::Signaled => format!("killed by signal {}", self.reason_code),
            Status::Timeout => "wall-time limit exceeded".into(),
            Status::ExternalKill => "killed on request".into(),
            Status::SetupError => format!("setup failed, reason code {}", self.reason_code),
            Status::InternalError => format!("internal error, reason code {}", self.reason_code),
        }
    }
}

impl std::fmt::Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::CpuArch;

    #[test]
    fn exit_code_mapping() {
        assert_eq!(Status::Ok.exit_code(), 0);
        assert_eq!(Status::Violation.exit_code(), 128 + 31);
        assert_eq!(Status::Timeout.exit_code(), 128 + 14);
        assert_eq!(Status::ExternalKill.exit_code(), 128 + 9);
        assert_eq!(Status::InternalError.exit_code(), 1);
    }

    #[test]
    fn describe_syscall_violation() {
        let mut result = RunResult::new(Status::Violation, libc::SYS_ptrace);
        result.syscall = Some(Syscall::new(
            CpuArch::host(),
            libc::SYS_ptrace,
            [0; 6],
            42,
            0,
        ));
        assert!(result.describe().contains("ptrace"));
        assert_eq!(result.to_string().split(':').next(), Some("VIOLATION"));
    }

    #[test]
    fn describe_network_violation() {
        let mut result = RunResult::new(Status::Violation, reason::VIOLATION_NETWORK);
        result.violation_message = Some("connect to 8.8.8.8:53 denied".into());
        assert!(result.describe().contains("8.8.8.8"));
    }

    #[test]
    fn rusage_conversion() {
        // SAFETY: zeroed rusage is valid.
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        ru.ru_utime.tv_sec = 1;
        ru.ru_utime.tv_usec = 500_000;
        ru.ru_maxrss = 2048;
        let usage = ResourceUsage::from_rusage(&ru);
        assert_eq!(usage.user_time, Duration::from_millis(1500));
        assert_eq!(usage.max_rss_kib, 2048);
    }
}
