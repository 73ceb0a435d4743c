//! The `seccomp(2)` syscall and the user-notification ioctls.
//!
//! Two installation modes are supported:
//!
//! - [`install_filter`] - plain `SECCOMP_SET_MODE_FILTER`; verdicts are
//!   delivered by the kernel (kill, errno, trace)
//! - [`install_filter_listener`] - `SECCOMP_FILTER_FLAG_NEW_LISTENER`;
//!   returns a listener fd on which a supervisor receives a
//!   `seccomp_notif` per intercepted syscall and answers with a
//!   `seccomp_notif_resp`
//!
//! Both set `PR_SET_NO_NEW_PRIVS` first, which the kernel requires for
//! unprivileged filter installation.
//!
//! ## Forward compatibility
//!
//! The kernel may grow `seccomp_notif`/`seccomp_notif_resp`. Buffer sizes
//! must be queried once via `SECCOMP_GET_NOTIF_SIZES` and the buffers heap
//! allocated at the reported size; never stack-allocate these structs for
//! ioctl use. [`NotifBuffers`] owns such a pair.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::os::fd::{FromRawFd, OwnedFd};

use rustix::io::Errno;

use crate::bpf::SockFprog;
use crate::last_errno;

const SECCOMP_SET_MODE_FILTER: u32 = 1;
const SECCOMP_GET_NOTIF_SIZES: u32 = 3;

pub const SECCOMP_FILTER_FLAG_TSYNC: u32 = 1 << 0;
pub const SECCOMP_FILTER_FLAG_NEW_LISTENER: u32 = 1 << 3;

/// Let the notified syscall proceed in the target as if unfiltered.
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

// ioctl numbers for the seccomp notification fd.
pub const SECCOMP_IOCTL_NOTIF_RECV: u64 = 0xc050_2100;
pub const SECCOMP_IOCTL_NOTIF_SEND: u64 = 0xc018_2101;
pub const SECCOMP_IOCTL_NOTIF_ID_VALID: u64 = 0x4008_2102;

/// Mirrors kernel `struct seccomp_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// Mirrors kernel `struct seccomp_notif`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompNotif {
    pub id: u64,
    pub pid: u32,
    pub flags: u32,
    pub data: SeccompData,
}

/// Mirrors kernel `struct seccomp_notif_resp`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotifResp {
    pub id: u64,
    pub val: i64,
    pub error: i32,
    pub flags: u32,
}

/// Mirrors kernel `struct seccomp_notif_sizes`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotifSizes {
    pub seccomp_notif: u16,
    pub seccomp_notif_resp: u16,
    pub seccomp_data: u16,
}

#[inline]
fn sys_seccomp(operation: u32, flags: u32, args: *mut libc::c_void) -> libc::c_long {
    // SAFETY: raw syscall; argument validity is the caller's problem.
    unsafe { libc::syscall(libc::SYS_seccomp, operation, flags, args) }
}

fn set_no_new_privs() -> Result<(), Errno> {
    // SAFETY: prctl with constant arguments.
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Install a seccomp filter on the current thread.
///
/// `magic` is passed in the unused fourth syscall slot so an already active
/// filter can recognize and permit this installation.
///
/// # Safety
///
/// The program must be a valid BPF filter. Installation is irreversible and
/// restricts every later syscall of this thread.
///
/// # Errors
///
/// Returns the raw errno on failure.
pub unsafe fn install_filter(fprog: &SockFprog, magic: u64) -> Result<(), Errno> {
    set_no_new_privs()?;
    // SAFETY: fprog points at a live program for the duration of the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0u32,
            fprog as *const _,
            magic,
        )
    };
    if ret != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Install a seccomp filter with `SECCOMP_FILTER_FLAG_NEW_LISTENER` and
/// return the notification fd.
///
/// # Safety
///
/// Same as [`install_filter`]. Additionally the caller must arrange for a
/// supervisor to service the listener, or notified syscalls block forever.
///
/// # Errors
///
/// Returns the raw errno on failure.
pub unsafe fn install_filter_listener(fprog: &SockFprog, magic: u64) -> Result<OwnedFd, Errno> {
    set_no_new_privs()?;
    // SAFETY: fprog points at a live program for the duration of the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_NEW_LISTENER,
            fprog as *const _,
            magic,
        )
    };
    if ret < 0 {
        return Err(last_errno());
    }
    // SAFETY: on success the return value is a fresh listener fd.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as i32) })
}

/// Query the kernel's notification struct sizes.
pub fn notif_sizes() -> Result<SeccompNotifSizes, Errno> {
    let mut sizes = SeccompNotifSizes::default();
    let ret = sys_seccomp(
        SECCOMP_GET_NOTIF_SIZES,
        0,
        (&mut sizes as *mut SeccompNotifSizes).cast(),
    );
    if ret != 0 {
        return Err(last_errno());
    }
    Ok(sizes)
}

/// Heap-allocated request/response buffers of the kernel-reported size.
///
/// The allocations are at least as large as this crate's struct
/// definitions, so field access through the typed pointers stays in
/// bounds even on kernels that only report the v1 sizes.
pub struct NotifBuffers {
    req: *mut SeccompNotif,
    req_layout: Layout,
    resp: *mut SeccompNotifResp,
    resp_layout: Layout,
}

// The buffers are plain memory; the raw pointers are owned exclusively.
unsafe impl Send for NotifBuffers {}

impl NotifBuffers {
    pub fn new(sizes: &SeccompNotifSizes) -> Self {
        let req_size = (sizes.seccomp_notif as usize).max(size_of::<SeccompNotif>());
        let resp_size = (sizes.seccomp_notif_resp as usize).max(size_of::<SeccompNotifResp>());
        let req_layout = Layout::from_size_align(req_size, align_of::<SeccompNotif>())
            .expect("notif layout");
        let resp_layout = Layout::from_size_align(resp_size, align_of::<SeccompNotifResp>())
            .expect("notif resp layout");
        // SAFETY: both layouts have non-zero size.
        let req = unsafe { alloc_zeroed(req_layout) }.cast::<SeccompNotif>();
        let resp = unsafe { alloc_zeroed(resp_layout) }.cast::<SeccompNotifResp>();
        assert!(!req.is_null() && !resp.is_null(), "notif buffer allocation failed");
        Self {
            req,
            req_layout,
            resp,
            resp_layout,
        }
    }

    /// Zero the request buffer and receive the next notification.
    ///
    /// # Errors
    ///
    /// `Errno::NOENT` means the target died before the notification could
    /// be claimed.
    pub fn recv(&mut self, listener_fd: i32) -> Result<&SeccompNotif, Errno> {
        // SAFETY: req points at req_layout.size() zeroable bytes.
        unsafe { std::ptr::write_bytes(self.req.cast::<u8>(), 0, self.req_layout.size()) };
        // SAFETY: ioctl writes at most the kernel-reported size.
        let ret = unsafe { libc::ioctl(listener_fd, SECCOMP_IOCTL_NOTIF_RECV, self.req) };
        if ret != 0 {
            return Err(last_errno());
        }
        // SAFETY: kernel filled the buffer; struct fields are in bounds.
        Ok(unsafe { &*self.req })
    }

    /// Send a response for notification `id`.
    ///
    /// # Errors
    ///
    /// `Errno::NOENT` means the id went stale (target thread died).
    pub fn send(
        &mut self,
        listener_fd: i32,
        id: u64,
        val: i64,
        error: i32,
        flags: u32,
    ) -> Result<(), Errno> {
        // SAFETY: resp points at resp_layout.size() zeroable bytes.
        unsafe { std::ptr::write_bytes(self.resp.cast::<u8>(), 0, self.resp_layout.size()) };
        // SAFETY: resp is valid for writes of SeccompNotifResp.
        unsafe {
            (*self.resp).id = id;
            (*self.resp).val = val;
            (*self.resp).error = error;
            (*self.resp).flags = flags;
        }
        // SAFETY: ioctl reads at most the kernel-reported size.
        let ret = unsafe { libc::ioctl(listener_fd, SECCOMP_IOCTL_NOTIF_SEND, self.resp) };
        if ret != 0 {
            return Err(last_errno());
        }
        Ok(())
    }
}

impl Drop for NotifBuffers {
    fn drop(&mut self) {
        // SAFETY: pointers were allocated with exactly these layouts.
        unsafe {
            dealloc(self.req.cast(), self.req_layout);
            dealloc(self.resp.cast(), self.resp_layout);
        }
    }
}

/// Check whether a notification id is still alive (TOCTOU protection).
pub fn notif_id_valid(listener_fd: i32, id: u64) -> Result<(), Errno> {
    // SAFETY: passes a pointer to a local u64.
    let ret = unsafe { libc::ioctl(listener_fd, SECCOMP_IOCTL_NOTIF_ID_VALID, &id as *const u64) };
    if ret != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Returns true if the kernel supports seccomp at all.
pub fn seccomp_available() -> bool {
    // SAFETY: read-only prctl.
    unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) >= 0 }
}
