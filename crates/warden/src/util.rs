//! Small shared helpers.

use std::os::fd::RawFd;

/// Retry a syscall-shaped closure while it fails with `EINTR`.
pub fn retry_eintr<T, F>(mut f: F) -> Result<T, rustix::io::Errno>
where
    F: FnMut() -> Result<T, rustix::io::Errno>,
{
    loop {
        match f() {
            Err(rustix::io::Errno::INTR) => continue,
            other => return other,
        }
    }
}

/// Async-signal-safe write of a message to stderr.
///
/// Between `fork` and `execve` the child must not touch buffered stdio or
/// the tracing stack; only a raw `write(2)` is legal there.
pub fn raw_log(msg: &str) {
    raw_log_fd(libc::STDERR_FILENO, msg);
}

fn raw_log_fd(fd: RawFd, msg: &str) {
    let bytes = msg.as_bytes();
    let mut written = 0;
    while written < bytes.len() {
        // SAFETY: writes only bytes we own; fd lifetime is the caller's.
        let ret = unsafe {
            libc::write(
                fd,
                bytes[written..].as_ptr().cast::<libc::c_void>(),
                bytes.len() - written,
            )
        };
        if ret <= 0 {
            // SAFETY: trivially safe errno read.
            if ret < 0 && unsafe { *libc::__errno_location() } == libc::EINTR {
                continue;
            }
            return;
        }
        written += ret as usize;
    }
    // SAFETY: single byte from a static buffer.
    unsafe { libc::write(fd, c"\n".as_ptr().cast(), 1) };
}

/// Current monotonic wall clock in Unix milliseconds.
pub fn now_unix_millis() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_eintr_passes_through() {
        let mut calls = 0;
        let res: Result<i32, rustix::io::Errno> = retry_eintr(|| {
            calls += 1;
            if calls < 3 {
                Err(rustix::io::Errno::INTR)
            } else {
                Ok(7)
            }
        });
        assert_eq!(res, Ok(7));
        assert_eq!(calls, 3);
    }

    #[test]
    fn unix_millis_monotonic_enough() {
        let a = now_unix_millis();
        let b = now_unix_millis();
        assert!(b >= a);
        assert!(a > 1_500_000_000_000); // after 2017
    }
}
