//! Spawning the sandboxee and the child-side launch stub.
//!
//! An [`Executor`] describes what to run: executable path, argv, an
//! explicit environment and an optional working directory. Spawning
//! forks directly (a fork-server integration plugs in at the same seam:
//! anything able to produce a parked child with a comms fd attached).
//!
//! ## Launch protocol
//!
//! The child parks itself in a comms handshake while the supervisor sets
//! it up; everything after `fork` on the child side is async-signal-safe
//! and logs through raw `write(2)` only.
//!
//! ```text
//! child                                supervisor
//! -----                                ----------
//! open exec fd, dup comms to 1023
//! unshare(namespaces)
//! send NS_READY          ------>       (seize, for ptrace runs)
//!                        <------       write uid/gid maps, MAPS_DONE
//! mount tree, pivot_root
//! recv MODE, program, cwd <-----       send policy + cwd
//! drop capabilities
//! install seccomp filter
//! (unotify: send listener fd) -->
//! send SANDBOX_READY     ------>       apply rlimits via prlimit64
//!                        <------       GO
//! close stray fds, execveat(magic)
//! ```
//!
//! The final `execveat` carries [`LAUNCH_MAGIC`] in its unused sixth
//! argument slot so the freshly installed filter recognizes it; under
//! ptrace it doubles as the cue that active monitoring may begin.

use std::ffi::{CString, OsString};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rustix::io::Errno;
use rustix::process::{pidfd_open, Pid, PidfdFlags};
use thiserror::Error;
use tracing::debug;

use crate::comms::{socketpair, Comms, CommsError, DEFAULT_CLIENT_FD};
use crate::namespaces::{self, NamespaceError};
use crate::policy::{Policy, LAUNCH_MAGIC};
use crate::util::raw_log;
use crate::caps;
use warden_sys::bpf::{SockFilter, SockFprog};
use warden_sys::last_errno;
use warden_sys::seccomp::{install_filter, install_filter_listener};

/// FD number the network-proxy channel occupies in the sandboxee.
/// 1022 stays free for the executable-image fd of fork-server setups.
pub const PROXY_CLIENT_FD: RawFd = 1021;

pub(crate) const TOKEN_NS_READY: u32 = 0x4e53_0001;
pub(crate) const TOKEN_MAPS_DONE: u32 = 0x4e53_0002;
pub(crate) const TOKEN_SANDBOX_READY: u32 = 0x4e53_0003;
pub(crate) const TOKEN_GO: u32 = 0x4e53_0004;

pub(crate) const MODE_PTRACE: u32 = 1;
pub(crate) const MODE_UNOTIFY: u32 = 2;

/// Exit code of the child when its own setup fails before `execveat`.
const CHILD_SETUP_EXIT: i32 = 125;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("comms setup failed: {0}")]
    Comms(#[from] CommsError),

    #[error("fork failed: {0}")]
    Fork(Errno),

    #[error("pidfd_open failed: {0}")]
    Pidfd(Errno),

    #[error("executable path contains a NUL byte")]
    BadPath,
}

/// What to run inside the sandbox.
#[derive(Debug, Clone)]
pub struct Executor {
    path: PathBuf,
    argv: Vec<OsString>,
    envp: Vec<OsString>,
    cwd: Option<String>,
}

impl Executor {
    /// Run `path` with the given arguments (argv[0] is implied) and an
    /// empty environment.
    pub fn new(path: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        let path = path.into();
        let mut argv = vec![path.clone().into_os_string()];
        argv.extend(args.into_iter().map(Into::into));
        Self {
            path,
            argv,
            envp: Vec::new(),
            cwd: None,
        }
    }

    /// Add one `KEY=VALUE` environment entry.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envp.push(format!("{key}={value}").into());
        self
    }

    /// Working directory inside the sandboxee (after any pivot).
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn cwd_string(&self) -> String {
        self.cwd.clone().unwrap_or_default()
    }

    /// Fork the sandboxee and drive the namespace half of the launch
    /// protocol. Returns with the child parked waiting for its policy.
    pub(crate) fn spawn(&self, policy: &Policy) -> Result<SpawnedProcess, ExecutorError> {
        let (parent_comms, child_comms) = socketpair()?;
        let proxy_pair = if policy.wants_network_proxy() {
            Some(socketpair()?)
        } else {
            None
        };

        // SAFETY: single-threaded fork contract: the child only runs
        // async-signal-safe code until execveat.
        let child_pid = unsafe { libc::fork() };
        if child_pid < 0 {
            return Err(ExecutorError::Fork(last_errno()));
        }

        if child_pid == 0 {
            drop(parent_comms);
            let proxy_child = proxy_pair.map(|(parent, child)| {
                drop(parent);
                child
            });
            // child_main only returns on failure; exec never comes back.
            match child_main(self, policy, child_comms, proxy_child) {
                Ok(never) => match never {},
                Err(err) => {
                    raw_log(&format!("warden child setup: {err}"));
                    // SAFETY: _exit is async-signal-safe.
                    unsafe { libc::_exit(CHILD_SETUP_EXIT) };
                }
            }
        }

        drop(child_comms);
        let proxy_comms = proxy_pair.map(|(parent, child)| {
            drop(child);
            Comms::from_fd(parent)
        });

        // SAFETY: child_pid is a fresh, positive pid.
        let pid = unsafe { Pid::from_raw_unchecked(child_pid) };
        let pidfd = pidfd_open(pid, PidfdFlags::empty()).map_err(ExecutorError::Pidfd)?;

        let mut comms = Comms::from_fd(parent_comms);

        // Namespace half: the child unshared before announcing itself.
        let token = comms.recv_u32()?;
        debug_assert_eq!(token, TOKEN_NS_READY);
        if policy.namespaces().user {
            if let Err(err) = namespaces::write_id_maps(child_pid) {
                debug!(pid = child_pid, error = %err, "id-map setup failed");
                // The child will fail its mounts and report through the
                // pidfd; keep the protocol moving.
            }
        }
        comms.send_u32(TOKEN_MAPS_DONE)?;

        debug!(pid = child_pid, "sandboxee spawned");
        Ok(SpawnedProcess {
            main_pid: child_pid,
            init_pid: None,
            pidfd,
            comms,
            proxy_comms,
            start_time: Instant::now(),
            fork_server_used: false,
            namespaces_applied: policy.namespaces().any(),
            exit_observed: false,
        })
    }
}

/// A freshly spawned, parked sandboxee. Owned by its monitor and
/// destroyed with it.
pub(crate) struct SpawnedProcess {
    pub main_pid: libc::pid_t,
    /// Init process of the sandboxee's PID namespace, when a fork-server
    /// provided one. Direct spawns have none.
    pub init_pid: Option<libc::pid_t>,
    /// Pidfd of the main process; readable on exit.
    pub pidfd: OwnedFd,
    pub comms: Comms,
    pub proxy_comms: Option<Comms>,
    pub start_time: Instant,
    pub fork_server_used: bool,
    pub namespaces_applied: bool,
    /// Set by the monitor once the exit status was reaped.
    pub exit_observed: bool,
}

#[derive(Debug, Error)]
enum ChildError {
    #[error("comms: {0}")]
    Comms(#[from] CommsError),

    #[error("namespace: {0}")]
    Namespace(#[from] NamespaceError),

    #[error("capability drop: {0}")]
    Caps(#[from] caps::CapError),

    #[error("seccomp install: {0}")]
    Seccomp(Errno),

    #[error("{op}: {errno}")]
    Sys { op: &'static str, errno: Errno },

    #[error("bad policy program length {0}")]
    BadProgram(usize),

    #[error("unexpected token {got:#x}, wanted {want:#x}")]
    BadToken { got: u32, want: u32 },

    #[error("path contains NUL")]
    BadPath,
}

fn sys_err(op: &'static str) -> ChildError {
    ChildError::Sys {
        op,
        errno: last_errno(),
    }
}

enum Never {}

/// Everything the child does between `fork` and `execveat`.
fn child_main(
    executor: &Executor,
    policy: &Policy,
    child_comms: OwnedFd,
    proxy_fd: Option<OwnedFd>,
) -> Result<Never, ChildError> {
    // Undo the supervisor's signal mask; a blocked SIGCHLD must not
    // leak into the sandboxed program.
    // SAFETY: applies an empty mask to this thread.
    unsafe {
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::pthread_sigmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
    }

    // The executable is opened before any pivot so the mount tree does
    // not need to expose it.
    let exec_path =
        CString::new(executor.path.as_os_str().as_bytes()).map_err(|_| ChildError::BadPath)?;
    // SAFETY: O_PATH open of a C string path.
    let exec_fd = unsafe { libc::open(exec_path.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) };
    if exec_fd < 0 {
        return Err(sys_err("open(exec)"));
    }

    // Park the channel at its well-known number.
    let comms_fd = move_to_fd(child_comms, DEFAULT_CLIENT_FD)?;
    let proxy_fd = match proxy_fd {
        Some(fd) => Some(move_to_fd(fd, PROXY_CLIENT_FD)?),
        None => None,
    };
    let mut comms = Comms::from_fd(comms_fd);

    // Namespaces first: id maps are written by the supervisor while we
    // are parked between the two tokens.
    namespaces::enter(policy.namespaces())?;
    comms.send_u32(TOKEN_NS_READY)?;
    expect_token(&mut comms, TOKEN_MAPS_DONE)?;

    if policy.namespaces().mount && !policy.mounts().is_empty() {
        namespaces::setup_mount_tree(Path::new("/tmp"), policy.mounts(), policy.namespaces())?;
    }

    // Policy delivery.
    let mode = comms.recv_u32()?;
    let program_bytes = comms.recv_bytes()?;
    if program_bytes.is_empty() || program_bytes.len() % size_of::<SockFilter>() != 0 {
        return Err(ChildError::BadProgram(program_bytes.len()));
    }
    let cwd = comms.recv_string()?;
    if !cwd.is_empty() {
        let cwd_c = CString::new(cwd).map_err(|_| ChildError::BadPath)?;
        // SAFETY: chdir on a C string path.
        if unsafe { libc::chdir(cwd_c.as_ptr()) } != 0 {
            return Err(sys_err("chdir"));
        }
    }

    caps::drop_all_except(policy.capabilities())?;

    // SAFETY: the byte length is a whole number of instructions and the
    // buffer outlives the install call.
    let program = unsafe {
        std::slice::from_raw_parts(
            program_bytes.as_ptr().cast::<SockFilter>(),
            program_bytes.len() / size_of::<SockFilter>(),
        )
    };
    let fprog = SockFprog {
        len: program.len() as u16,
        filter: program.as_ptr(),
    };

    // From here on every syscall of this process runs under the filter;
    // the policy's launch-stub allowances cover the remaining calls.
    if mode == MODE_UNOTIFY {
        // SAFETY: fprog points at a validated program.
        let listener =
            unsafe { install_filter_listener(&fprog, LAUNCH_MAGIC) }.map_err(ChildError::Seccomp)?;
        comms.send_fd(listener.as_raw_fd())?;
    } else {
        // SAFETY: fprog points at a validated program.
        unsafe { install_filter(&fprog, LAUNCH_MAGIC) }.map_err(ChildError::Seccomp)?;
    }

    comms.send_u32(TOKEN_SANDBOX_READY)?;
    expect_token(&mut comms, TOKEN_GO)?;

    close_stray_fds(&[
        0,
        1,
        2,
        DEFAULT_CLIENT_FD,
        proxy_fd.as_ref().map_or(-1, AsRawFd::as_raw_fd),
        exec_fd,
    ]);

    let argv = cstring_vec(executor.argv.iter().map(|a| a.as_bytes()))?;
    let envp = cstring_vec(executor.envp.iter().map(|e| e.as_bytes()))?;
    let argv_ptrs = ptr_vec(&argv);
    let envp_ptrs = ptr_vec(&envp);

    // SAFETY: execveat with NUL-terminated pointer arrays; the magic
    // rides in the unused sixth syscall argument register.
    unsafe {
        libc::syscall(
            libc::SYS_execveat,
            exec_fd,
            c"".as_ptr(),
            argv_ptrs.as_ptr(),
            envp_ptrs.as_ptr(),
            libc::AT_EMPTY_PATH,
            LAUNCH_MAGIC,
        );
    }
    Err(sys_err("execveat"))
}

fn expect_token(comms: &mut Comms, want: u32) -> Result<(), ChildError> {
    let got = comms.recv_u32()?;
    if got != want {
        return Err(ChildError::BadToken { got, want });
    }
    Ok(())
}

/// Re-home `fd` at exactly `target` with close-on-exec cleared.
fn move_to_fd(fd: OwnedFd, target: RawFd) -> Result<OwnedFd, ChildError> {
    if fd.as_raw_fd() == target {
        // Clear O_CLOEXEC so the fd survives into the sandboxee.
        // SAFETY: fcntl on a live fd.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, 0) } != 0 {
            return Err(sys_err("fcntl(F_SETFD)"));
        }
        return Ok(fd);
    }
    // SAFETY: dup2 to a number outside every open fd we track.
    if unsafe { libc::dup2(fd.as_raw_fd(), target) } != target {
        return Err(sys_err("dup2"));
    }
    drop(fd);
    // SAFETY: target is now owned by us alone.
    Ok(unsafe { OwnedFd::from_raw_fd(target) })
}

/// Close every fd not in `keep`. `/proc` may be the sandboxee's own
/// namespace view or the host's; either lists our open fds.
fn close_stray_fds(keep: &[RawFd]) {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return;
    };
    let mut stray = Vec::new();
    for entry in entries.flatten() {
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
            if !keep.contains(&fd) {
                stray.push(fd);
            }
        }
    }
    for fd in stray {
        // SAFETY: closing fds we do not hold owned handles for.
        unsafe { libc::close(fd) };
    }
}

fn cstring_vec<'a>(
    items: impl Iterator<Item = &'a [u8]>,
) -> Result<Vec<CString>, ChildError> {
    items
        .map(|bytes| CString::new(bytes).map_err(|_| ChildError::BadPath))
        .collect()
}

fn ptr_vec(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_collects_argv_and_env() {
        let executor = Executor::new("/bin/true", ["--quiet"])
            .env("LANG", "C")
            .cwd("/");
        assert_eq!(executor.path(), Path::new("/bin/true"));
        assert_eq!(executor.argv.len(), 2);
        assert_eq!(executor.argv[0], "/bin/true");
        assert_eq!(executor.envp, vec![OsString::from("LANG=C")]);
        assert_eq!(executor.cwd_string(), "/");
    }

    #[test]
    fn empty_args_keep_argv0() {
        let executor = Executor::new("/bin/true", Vec::<String>::new());
        assert_eq!(executor.argv, vec![OsString::from("/bin/true")]);
        assert_eq!(executor.cwd_string(), "");
    }

    #[test]
    fn ptr_vec_is_null_terminated() {
        let strings = vec![CString::new("a").unwrap(), CString::new("b").unwrap()];
        let ptrs = ptr_vec(&strings);
        assert_eq!(ptrs.len(), 3);
        assert!(ptrs[2].is_null());
    }
}
