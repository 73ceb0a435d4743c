//! Capability dropping for the sandboxee.
//!
//! Runs in the child between `fork` and `execve`: ambient capabilities
//! are cleared and every capability outside the policy's keep-set is
//! removed from the bounding set, so no file capability or setuid binary
//! can hand privileges back after `execve`. Errors here are fatal to the
//! launch; this is not a best-effort path.

use rustix::io::Errno;
use thiserror::Error;

use warden_sys::last_errno;

/// Highest capability number probed when clearing the bounding set.
/// `PR_CAPBSET_DROP` returns EINVAL past the kernel's last known cap,
/// which ends the loop.
const CAP_PROBE_LIMIT: i32 = 64;

#[derive(Debug, Error)]
pub enum CapError {
    #[error("clearing ambient capabilities failed: {0}")]
    Ambient(Errno),

    #[error("dropping capability {cap} from bounding set failed: {errno}")]
    BoundingDrop { cap: i32, errno: Errno },
}

/// Drop every capability not listed in `keep`.
pub fn drop_all_except(keep: &[i32]) -> Result<(), CapError> {
    // SAFETY: prctl with constant arguments.
    let ret = unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        )
    };
    if ret != 0 {
        return Err(CapError::Ambient(last_errno()));
    }

    for cap in 0..CAP_PROBE_LIMIT {
        if keep.contains(&cap) {
            continue;
        }
        // SAFETY: prctl with a small integer argument.
        let ret = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if ret != 0 {
            let errno = last_errno();
            if errno == Errno::INVAL {
                // Past the last capability this kernel knows.
                break;
            }
            return Err(CapError::BoundingDrop { cap, errno });
        }
    }
    Ok(())
}
