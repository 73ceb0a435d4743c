//! warden: Linux process isolation.
//!
//! Runs an untrusted executable as a supervised child process confined
//! by layered kernel primitives:
//!
//! - **Seccomp-BPF** - a policy compiled to a single linear filter;
//!   verdicts are bit-exact, jump offsets are resolved and verified
//! - **Namespaces** - user, mount (with `pivot_root`), pid, net, ipc,
//!   uts
//! - **Capability drop** - bounding and ambient sets cleared down to the
//!   policy's keep-set
//! - **Rlimits** - applied from the supervisor via `prlimit64`
//! - **Supervision** - a ptrace monitor or a seccomp-unotify monitor,
//!   sharing one lifecycle contract
//!
//! ## Quick start
//!
//! ```ignore
//! use warden::{Executor, MonitorKind, PolicyBuilder, Sandbox};
//!
//! let policy = PolicyBuilder::new()
//!     .allow_static_startup()
//!     .add_path("/lib")
//!     .add_path("/usr")
//!     .build()?;
//!
//! let executor = Executor::new("/usr/bin/true", Vec::<String>::new());
//! let sandbox = Sandbox::run(executor, policy, MonitorKind::Ptrace)?;
//! let result = sandbox.wait();
//! assert_eq!(result.exit_code(), 0);
//! ```
//!
//! The supervisor talks to the sandboxee over a TLV channel on an
//! `AF_UNIX` socketpair ([`comms`]); `connect()` requests are brokered
//! by a validating proxy ([`proxy`]) when the policy allowlists hosts.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod caps;
pub mod comms;
pub mod executor;
pub mod filter;
pub mod monitor;
pub mod namespaces;
pub mod policy;
pub mod proxy;
pub mod regs;
pub mod result;
pub mod rlimits;
pub mod stacktrace;
pub mod syscall;
pub mod util;

pub use comms::{Comms, CommsError, Creds, Listener, StatusFrame};
pub use executor::{Executor, ExecutorError};
pub use monitor::{MonitorKind, Sandbox, SandboxError, WaitTimeout};
pub use namespaces::{Mount, NamespaceConfig, PathError};
pub use policy::{
    ArgGuard, GuardOp, Policy, PolicyBuilder, PolicyError, StacktraceRule, SyscallAction,
};
pub use proxy::{AllowedHosts, AllowedHostsError};
pub use result::{reason, ResourceUsage, RunResult, Status};
pub use rlimits::{Rlimit, RlimitSet};
pub use syscall::{CpuArch, Syscall};
