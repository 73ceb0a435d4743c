//! Resource limits applied to the sandboxee.
//!
//! Limits are applied *from the supervisor* via `prlimit64(2)` after the
//! sandboxee reports ready, so a hostile sandboxee never runs without
//! them and the child-side launch stub stays minimal.
//!
//! `RLIMIT_AS` is available but not defaulted: runtimes that reserve
//! large virtual ranges (Go, JVM, V8) break under it, and `RLIMIT_DATA`
//! bounds actual memory better.

use rustix::io::Errno;
use thiserror::Error;
use tracing::debug;

use warden_sys::last_errno;

#[derive(Debug, Error)]
#[error("prlimit64(pid={pid}, resource={resource}) failed: {errno}")]
pub struct RlimitError {
    pub pid: libc::pid_t,
    pub resource: u32,
    pub errno: Errno,
}

/// One limit: resource id plus soft and hard values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub resource: u32,
    pub soft: u64,
    pub hard: u64,
}

impl Rlimit {
    pub fn new(resource: u32, soft: u64, hard: u64) -> Self {
        Self {
            resource,
            soft,
            hard,
        }
    }

    pub fn both(resource: u32, limit: u64) -> Self {
        Self::new(resource, limit, limit)
    }
}

/// The set of limits a policy applies. Later entries for the same
/// resource override earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RlimitSet {
    entries: Vec<Rlimit>,
}

impl RlimitSet {
    pub fn set(&mut self, limit: Rlimit) {
        self.entries.retain(|e| e.resource != limit.resource);
        self.entries.push(limit);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Rlimit] {
        &self.entries
    }

    /// Apply every limit to `pid`.
    pub fn apply_to(&self, pid: libc::pid_t) -> Result<(), RlimitError> {
        for limit in &self.entries {
            let rlim = libc::rlimit64 {
                rlim_cur: limit.soft,
                rlim_max: limit.hard,
            };
            // SAFETY: rlim is a valid in-pointer; out-pointer is null.
            let ret = unsafe {
                libc::prlimit64(pid, limit.resource, &rlim, std::ptr::null_mut())
            };
            if ret != 0 {
                return Err(RlimitError {
                    pid,
                    resource: limit.resource,
                    errno: last_errno(),
                });
            }
            debug!(
                pid,
                resource = limit.resource,
                soft = limit.soft,
                hard = limit.hard,
                "applied rlimit"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_entry_overrides() {
        let mut set = RlimitSet::default();
        set.set(Rlimit::both(libc::RLIMIT_NOFILE as u32, 64));
        set.set(Rlimit::both(libc::RLIMIT_NOFILE as u32, 128));
        set.set(Rlimit::both(libc::RLIMIT_CORE as u32, 0));
        assert_eq!(set.entries().len(), 2);
        let nofile = set
            .entries()
            .iter()
            .find(|e| e.resource == libc::RLIMIT_NOFILE as u32)
            .unwrap();
        assert_eq!(nofile.soft, 128);
    }

    #[test]
    fn apply_to_self_is_visible() {
        // Lowering the soft core limit on ourselves is always permitted.
        let mut set = RlimitSet::default();
        set.set(Rlimit::new(libc::RLIMIT_CORE as u32, 0, 0));
        // SAFETY: getpid is always safe.
        let pid = unsafe { libc::getpid() };
        set.apply_to(pid).unwrap();

        let mut rlim = libc::rlimit64 {
            rlim_cur: 77,
            rlim_max: 77,
        };
        // SAFETY: valid out-pointer.
        let ret = unsafe {
            libc::prlimit64(pid, libc::RLIMIT_CORE, std::ptr::null(), &mut rlim)
        };
        assert_eq!(ret, 0);
        assert_eq!(rlim.rlim_cur, 0);
    }
}
