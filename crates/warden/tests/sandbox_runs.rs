//! End-to-end sandbox runs against a live kernel.
//!
//! These need a host where ptrace and seccomp-unotify work from an
//! unprivileged, containerized test runner, which CI often forbids, so
//! the suite is `#[ignore]` like every kernel-facing test here. Run with
//! `cargo test -- --ignored` on a normal machine.

use std::time::Duration;

use warden::{Executor, MonitorKind, PolicyBuilder, Sandbox, Status};

/// `RUST_LOG=debug cargo test -- --ignored --nocapture` shows the
/// monitor's view of a failing run.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A policy broad enough for the dynamic loader plus a trivial binary.
fn loader_policy() -> PolicyBuilder {
    PolicyBuilder::new()
        .no_namespaces()
        .allow_map_exec()
        .allow_static_startup()
        .allow_syscalls([
            libc::SYS_openat,
            libc::SYS_fstat,
            libc::SYS_newfstatat,
            libc::SYS_statx,
            libc::SYS_access,
            libc::SYS_faccessat,
            libc::SYS_pread64,
            libc::SYS_lseek,
            libc::SYS_ioctl,
            libc::SYS_getcwd,
            libc::SYS_dup,
            libc::SYS_execve,
            libc::SYS_nanosleep,
            libc::SYS_clock_nanosleep,
            libc::SYS_clock_gettime,
            libc::SYS_getuid,
            libc::SYS_getgid,
            libc::SYS_geteuid,
            libc::SYS_getegid,
        ])
}

fn run_true(kind: MonitorKind) {
    init_logging();
    let policy = loader_policy().build().expect("policy");
    let executor = Executor::new("/bin/true", Vec::<String>::new());
    let sandbox = Sandbox::run(executor, policy, kind).expect("sandbox");
    let result = sandbox.wait();
    assert_eq!(result.status, Status::Ok, "unexpected: {result}");
    assert_eq!(result.reason_code, 0);
    assert_eq!(result.exit_code(), 0);
    assert!(result.rusage.is_some());
}

#[test]
#[ignore]
fn minimal_ok_under_ptrace() {
    run_true(MonitorKind::Ptrace);
}

#[test]
#[ignore]
fn minimal_ok_under_unotify() {
    run_true(MonitorKind::Unotify);
}

#[test]
#[ignore]
fn exit_code_is_propagated() {
    let policy = loader_policy().build().expect("policy");
    let executor = Executor::new("/bin/false", Vec::<String>::new());
    let sandbox = Sandbox::run(executor, policy, MonitorKind::Ptrace).expect("sandbox");
    let result = sandbox.wait();
    assert_eq!(result.status, Status::Ok);
    assert_eq!(result.reason_code, 1);
}

fn run_sleep_with(kind: MonitorKind) -> Sandbox {
    init_logging();
    let policy = loader_policy().build().expect("policy");
    let executor = Executor::new("/bin/sleep", ["30"]);
    Sandbox::run(executor, policy, kind).expect("sandbox")
}

#[test]
#[ignore]
fn walltime_limit_times_out_ptrace() {
    let sandbox = run_sleep_with(MonitorKind::Ptrace);
    sandbox.set_walltime_limit(Some(Duration::from_millis(300)));
    let result = sandbox
        .wait_timeout(Duration::from_secs(20))
        .expect("monitor should finish well before this");
    assert_eq!(result.status, Status::Timeout, "unexpected: {result}");
    assert_eq!(result.exit_code(), 128 + 14);
}

#[test]
#[ignore]
fn walltime_limit_times_out_unotify() {
    let sandbox = run_sleep_with(MonitorKind::Unotify);
    sandbox.set_walltime_limit(Some(Duration::from_millis(300)));
    let result = sandbox
        .wait_timeout(Duration::from_secs(20))
        .expect("monitor should finish well before this");
    assert_eq!(result.status, Status::Timeout, "unexpected: {result}");
}

#[test]
#[ignore]
fn external_kill_is_reported_as_such() {
    let sandbox = run_sleep_with(MonitorKind::Unotify);
    std::thread::sleep(Duration::from_millis(200));
    sandbox.kill();
    let result = sandbox
        .wait_timeout(Duration::from_secs(20))
        .expect("kill should complete quickly");
    assert_eq!(result.status, Status::ExternalKill, "unexpected: {result}");
    assert_eq!(result.exit_code(), 128 + 9);
}

#[test]
#[ignore]
fn await_timeout_does_not_kill() {
    let sandbox = run_sleep_with(MonitorKind::Ptrace);
    let err = sandbox.wait_timeout(Duration::from_millis(200));
    assert!(err.is_err(), "sleep should still be running");
    // Still alive; now actually end it.
    sandbox.kill();
    let result = sandbox
        .wait_timeout(Duration::from_secs(20))
        .expect("kill should complete");
    assert_eq!(result.status, Status::ExternalKill);
}
