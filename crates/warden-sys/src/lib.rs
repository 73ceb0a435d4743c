//! Low-level Linux syscall plumbing for the warden sandbox.
//!
//! This crate provides thin wrappers around the kernel interfaces the
//! sandbox engine is built on and that neither rustix nor libc expose in a
//! usable shape:
//!
//! - **bpf** - classic-BPF instruction encoding (`sock_filter`), seccomp
//!   return actions and audit architecture constants
//! - **seccomp** - the `seccomp(2)` syscall, the user-notification ioctls
//!   and the kernel structs they operate on
//!
//! For everything else (pidfds, pivot_root, errnos) use rustix.
//!
//! # Safety
//!
//! This crate contains raw syscall wrappers. Casts between integer types
//! are unavoidable when interfacing with the kernel ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod bpf;
pub mod seccomp;

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
