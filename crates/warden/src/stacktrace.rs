//! Best-effort stack traces of a (possibly dying) sandboxee.
//!
//! Capture walks the frame-pointer chain with `PTRACE_PEEKDATA` and
//! attributes each return address to a module from `/proc/<pid>/maps`.
//! Frame pointers may be omitted by the compiler, so the walk is
//! heuristic: it stops at the first implausible frame. Callers treat
//! failure as a logging event, never as a run failure.

use std::fs;
use std::io;

use tracing::debug;

use crate::regs::Regs;

const MAX_FRAMES: usize = 64;

struct Mapping {
    start: u64,
    end: u64,
    offset: u64,
    path: String,
}

fn read_mappings(pid: libc::pid_t) -> io::Result<Vec<Mapping>> {
    let text = fs::read_to_string(format!("/proc/{pid}/maps"))?;
    let mut maps = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(range) = fields.next() else { continue };
        let Some((start, end)) = range.split_once('-') else { continue };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            continue;
        };
        let _perms = fields.next();
        let offset = fields
            .next()
            .and_then(|o| u64::from_str_radix(o, 16).ok())
            .unwrap_or(0);
        let _dev = fields.next();
        let _inode = fields.next();
        let path = fields.next().unwrap_or("").to_string();
        maps.push(Mapping {
            start,
            end,
            offset,
            path,
        });
    }
    Ok(maps)
}

fn symbolize(maps: &[Mapping], addr: u64) -> String {
    for map in maps {
        if addr >= map.start && addr < map.end {
            if map.path.is_empty() {
                return format!("{addr:#x} (anonymous)");
            }
            let module = map.path.rsplit('/').next().unwrap_or(&map.path);
            let offset = addr - map.start + map.offset;
            return format!("{addr:#x} ({module}+{offset:#x})");
        }
    }
    format!("{addr:#x} (unmapped)")
}

fn peek_word(pid: libc::pid_t, addr: u64) -> Option<u64> {
    if addr == 0 || addr % 8 != 0 {
        return None;
    }
    // SAFETY: trivially safe errno write.
    unsafe { *libc::__errno_location() = 0 };
    // SAFETY: PTRACE_PEEKDATA reads a word from the tracee.
    let word = unsafe { libc::ptrace(libc::PTRACE_PEEKDATA, pid, addr, 0) };
    // SAFETY: trivially safe errno read.
    if word == -1 && unsafe { *libc::__errno_location() } != 0 {
        return None;
    }
    Some(word as u64)
}

/// Capture a stack trace from a process already in a ptrace stop.
pub fn capture_stopped(pid: libc::pid_t) -> io::Result<Vec<String>> {
    let regs = Regs::fetch(pid)?;
    let maps = read_mappings(pid)?;

    let mut frames = Vec::new();
    frames.push(symbolize(&maps, regs.instruction_pointer()));

    // Frame record layout on both supported arches: [saved fp, return
    // address] at the frame pointer.
    let mut fp = regs.frame_pointer();
    while frames.len() < MAX_FRAMES {
        let Some(ret_addr) = peek_word(pid, fp.wrapping_add(8)) else {
            break;
        };
        let Some(next_fp) = peek_word(pid, fp) else {
            break;
        };
        if ret_addr == 0 || next_fp <= fp {
            break;
        }
        frames.push(symbolize(&maps, ret_addr));
        fp = next_fp;
    }
    Ok(frames)
}

/// Attach to an untraced process, capture, detach.
///
/// Used by the unotify monitor, which has no standing ptrace
/// relationship. Fails cleanly if the target died first.
pub fn capture_attached(pid: libc::pid_t) -> io::Result<Vec<String>> {
    // SAFETY: PTRACE_ATTACH with no auxiliary arguments.
    if unsafe { libc::ptrace(libc::PTRACE_ATTACH, pid, 0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // Wait for the attach stop without stealing other children's events.
    let mut status = 0;
    loop {
        // SAFETY: status is a valid out-pointer.
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::WUNTRACED | libc::__WALL) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            // SAFETY: detach on the way out.
            unsafe { libc::ptrace(libc::PTRACE_DETACH, pid, 0, 0) };
            return Err(err);
        }
        if libc::WIFSTOPPED(status) {
            break;
        }
    }

    let result = capture_stopped(pid);
    // SAFETY: PTRACE_DETACH with no signal injection.
    if unsafe { libc::ptrace(libc::PTRACE_DETACH, pid, 0, 0) } != 0 {
        debug!(pid, "detach after stack capture failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolize_finds_module() {
        let maps = vec![
            Mapping {
                start: 0x1000,
                end: 0x2000,
                offset: 0x0,
                path: "/usr/lib/libfoo.so".into(),
            },
            Mapping {
                start: 0x5000,
                end: 0x6000,
                offset: 0x0,
                path: String::new(),
            },
        ];
        assert_eq!(symbolize(&maps, 0x1234), "0x1234 (libfoo.so+0x234)");
        assert_eq!(symbolize(&maps, 0x5001), "0x5001 (anonymous)");
        assert_eq!(symbolize(&maps, 0x9999), "0x9999 (unmapped)");
    }

    #[test]
    fn own_mappings_parse() {
        // SAFETY: getpid is always safe.
        let maps = read_mappings(unsafe { libc::getpid() }).unwrap();
        assert!(!maps.is_empty());
        assert!(maps.iter().all(|m| m.end > m.start));
    }

    #[test]
    fn peek_rejects_unaligned() {
        assert_eq!(peek_word(1, 0x1001), None);
        assert_eq!(peek_word(1, 0), None);
    }
}
