//! Framed message transport between supervisor and sandboxee.
//!
//! A `Comms` wraps one connected `AF_UNIX` `SOCK_STREAM` socket and speaks
//! a tag-length-value protocol: a 16-byte native-endian header (`tag: u32`,
//! padding, `len: u64`) followed by `len` payload bytes. Tags at or above
//! [`RESERVED_TAG_BASE`] are claimed by the built-in typed helpers; user
//! frames must stay below it.
//!
//! Out-of-band data rides on `sendmsg`/`recvmsg` ancillary payloads:
//! file descriptors via `SCM_RIGHTS` (one per frame) and peer credentials
//! via `SCM_CREDENTIALS`. The FD frame carries the TLV header in-band so
//! the ancillary data is anchored to a real byte transfer.
//!
//! The protocol is deliberately native-endian: both ends always live on
//! the same host, connected by a socketpair or an abstract socket. A
//! cross-host deployment would need a negotiation prologue this module
//! does not have.
//!
//! A channel is not internally synchronized; it expects exactly one sender
//! and one receiver. State machine: connected (fd present) → terminated
//! (fd closed); every operation on a terminated channel fails.

use std::mem::offset_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use rustix::io::Errno;
use thiserror::Error;
use tracing::{debug, warn};

use crate::util::retry_eintr;
use warden_sys::last_errno;

/// FD number the sandboxee finds its comms channel on, unless overridden.
pub const DEFAULT_CLIENT_FD: RawFd = 1023;

/// Environment variable overriding [`DEFAULT_CLIENT_FD`] in the sandboxee.
pub const CLIENT_FD_ENV: &str = "WARDEN_COMMS_FD";

/// Tags at or above this value are reserved for built-in frame kinds.
pub const RESERVED_TAG_BASE: u32 = 0x8000_0000;

pub const TAG_BOOL: u32 = 0x8000_0001;
pub const TAG_I8: u32 = 0x8000_0002;
pub const TAG_U8: u32 = 0x8000_0003;
pub const TAG_I16: u32 = 0x8000_0004;
pub const TAG_U16: u32 = 0x8000_0005;
pub const TAG_I32: u32 = 0x8000_0006;
pub const TAG_U32: u32 = 0x8000_0007;
pub const TAG_I64: u32 = 0x8000_0008;
pub const TAG_U64: u32 = 0x8000_0009;
pub const TAG_STRING: u32 = 0x8000_0100;
pub const TAG_BYTES: u32 = 0x8000_0101;
pub const TAG_STATUS: u32 = 0x8000_0102;
pub const TAG_FD: u32 = 0x8000_0201;

const TLV_HEADER_SIZE: usize = 16;

/// Frames above this size are accepted but logged; something is probably
/// wrong on the sending side.
const WARN_MSG_SIZE: usize = 256 << 20;

const DEFAULT_MAX_MSG_SIZE: usize = i32::MAX as usize;

/// Frames whose header and payload fit in this buffer go out in one write.
const SEND_COALESCE_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("channel terminated")]
    Terminated,

    #[error("peer disconnected")]
    Disconnected,

    #[error("short write: {written} of {requested} bytes")]
    ShortWrite { written: usize, requested: usize },

    #[error("message too large: {len} > {max}")]
    Oversize { len: usize, max: usize },

    #[error("tag {0:#010x} is in the reserved range")]
    ReservedTag(u32),

    #[error("expected tag {expected:#010x}, got {got:#010x}")]
    TagMismatch { expected: u32, got: u32 },

    #[error("expected {expected} payload bytes, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("no SCM_RIGHTS payload in fd frame")]
    NoAncillaryFd,

    #[error("no SCM_CREDENTIALS payload")]
    NoAncillaryCreds,

    #[error("socket name too long: {0:?}")]
    NameTooLong(String),

    #[error("payload is not valid UTF-8")]
    BadString,

    #[error("malformed status frame")]
    BadStatus,

    #[error("{op} failed: {errno}")]
    Sys { op: &'static str, errno: Errno },
}

impl CommsError {
    fn sys(op: &'static str) -> Self {
        Self::Sys {
            op,
            errno: last_errno(),
        }
    }
}

/// Errnos that leave the connection unusable. Everything else (EAGAIN,
/// EFAULT, EINTR, EINVAL, ENOMEM) is a soft failure the caller may
/// retry after.
fn is_fatal_errno(errno: Errno) -> bool {
    !matches!(
        errno,
        Errno::AGAIN | Errno::FAULT | Errno::INTR | Errno::INVAL | Errno::NOMEM
    )
}

fn encode_header(tag: u32, len: usize) -> [u8; TLV_HEADER_SIZE] {
    let mut buf = [0u8; TLV_HEADER_SIZE];
    buf[..4].copy_from_slice(&tag.to_ne_bytes());
    buf[8..].copy_from_slice(&(len as u64).to_ne_bytes());
    buf
}

fn decode_header(buf: &[u8; TLV_HEADER_SIZE]) -> (u32, usize) {
    let tag = u32::from_ne_bytes(buf[..4].try_into().expect("header slice"));
    let len = u64::from_ne_bytes(buf[8..].try_into().expect("header slice"));
    (tag, len as usize)
}

/// Peer credentials as delivered by `SCM_CREDENTIALS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Creds {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// A status object exchanged over the channel (setup handshake results).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFrame {
    pub code: u32,
    pub message: String,
}

impl StatusFrame {
    pub fn ok() -> Self {
        Self {
            code: 0,
            message: String::new(),
        }
    }

    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

pub struct Comms {
    fd: Option<OwnedFd>,
    name: String,
    max_msg_size: usize,
}

impl std::fmt::Debug for Comms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comms")
            .field("name", &self.name)
            .field("fd", &self.fd.as_ref().map(AsRawFd::as_raw_fd))
            .finish()
    }
}

impl Comms {
    /// Wrap an already connected socket.
    pub fn from_fd(fd: OwnedFd) -> Self {
        let name = format!("comms:fd={}", fd.as_raw_fd());
        Self {
            fd: Some(fd),
            name,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
        }
    }

    /// The sandboxee side of the channel: the well-known fd number, or the
    /// one named by [`CLIENT_FD_ENV`]. The variable is consumed so it does
    /// not leak into the sandboxed program's environment.
    pub fn client() -> Self {
        let fd = match std::env::var(CLIENT_FD_ENV) {
            Ok(var) => {
                std::env::remove_var(CLIENT_FD_ENV);
                var.parse().unwrap_or(DEFAULT_CLIENT_FD)
            }
            Err(_) => DEFAULT_CLIENT_FD,
        };
        // SAFETY: the launcher guarantees this fd number is the comms socket.
        Self::from_fd(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Connect to a listening UNIX socket (abstract or pathname).
    pub fn connect(socket_name: &str, abstract_uds: bool) -> Result<Self, CommsError> {
        // SAFETY: plain socket(2).
        let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
        if raw < 0 {
            return Err(CommsError::sys("socket(AF_UNIX)"));
        }
        // SAFETY: raw is a fresh, owned socket.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let (sun, slen) = sockaddr_un(socket_name, abstract_uds)?;
        let ret = retry_eintr(|| {
            // SAFETY: sun lives across the call, slen bounds it.
            let r = unsafe {
                libc::connect(
                    fd.as_raw_fd(),
                    (&sun as *const libc::sockaddr_un).cast(),
                    slen,
                )
            };
            if r == -1 {
                Err(last_errno())
            } else {
                Ok(())
            }
        });
        if let Err(errno) = ret {
            return Err(CommsError::Sys {
                op: "connect",
                errno,
            });
        }
        debug!(socket = socket_name, fd = fd.as_raw_fd(), "comms connected");
        let mut comms = Self::from_fd(fd);
        comms.name = format!("comms:{socket_name}");
        Ok(comms)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.fd.is_some()
    }

    /// Cap on the payload length accepted or produced by this channel.
    pub fn set_max_msg_size(&mut self, max: usize) {
        self.max_msg_size = max;
    }

    /// Close the socket and move to the terminal state. Idempotent.
    pub fn terminate(&mut self) {
        self.fd = None;
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn connected_fd(&self) -> Result<RawFd, CommsError> {
        self.raw_fd().ok_or(CommsError::Terminated)
    }

    // ---- raw byte transfer -------------------------------------------------

    fn send_all(&mut self, data: &[u8]) -> Result<(), CommsError> {
        let fd = self.connected_fd()?;
        let mut total = 0;
        while total < data.len() {
            // SAFETY: in-bounds slice of caller-owned data.
            let ret = unsafe {
                libc::write(
                    fd,
                    data[total..].as_ptr().cast::<libc::c_void>(),
                    data.len() - total,
                )
            };
            if ret < 0 {
                let errno = last_errno();
                if errno == Errno::INTR {
                    continue;
                }
                if errno == Errno::PIPE {
                    self.terminate();
                    return Err(CommsError::Disconnected);
                }
                if is_fatal_errno(errno) {
                    self.terminate();
                }
                return Err(CommsError::Sys { op: "write", errno });
            }
            if ret == 0 {
                return Err(CommsError::ShortWrite {
                    written: total,
                    requested: data.len(),
                });
            }
            total += ret as usize;
        }
        Ok(())
    }

    fn recv_all(&mut self, data: &mut [u8]) -> Result<(), CommsError> {
        let fd = self.connected_fd()?;
        let mut total = 0;
        while total < data.len() {
            // SAFETY: in-bounds slice of caller-owned buffer.
            let ret = unsafe {
                libc::read(
                    fd,
                    data[total..].as_mut_ptr().cast::<libc::c_void>(),
                    data.len() - total,
                )
            };
            if ret < 0 {
                let errno = last_errno();
                if errno == Errno::INTR {
                    continue;
                }
                if is_fatal_errno(errno) {
                    self.terminate();
                }
                return Err(CommsError::Sys { op: "read", errno });
            }
            if ret == 0 {
                // The peer may simply have finished its work.
                self.terminate();
                return Err(CommsError::Disconnected);
            }
            total += ret as usize;
        }
        Ok(())
    }

    // ---- TLV framing -------------------------------------------------------

    fn send_tlv_internal(&mut self, tag: u32, value: &[u8]) -> Result<(), CommsError> {
        if value.len() > self.max_msg_size {
            return Err(CommsError::Oversize {
                len: value.len(),
                max: self.max_msg_size,
            });
        }
        if value.len() > WARN_MSG_SIZE {
            warn!(len = value.len(), tag, "oversized TLV frame");
        }

        let header = encode_header(tag, value.len());
        if TLV_HEADER_SIZE + value.len() <= SEND_COALESCE_SIZE {
            // One buffer, one write: a cheap atomicity hint for small frames.
            let mut buf = [0u8; SEND_COALESCE_SIZE];
            buf[..TLV_HEADER_SIZE].copy_from_slice(&header);
            buf[TLV_HEADER_SIZE..TLV_HEADER_SIZE + value.len()].copy_from_slice(value);
            self.send_all(&buf[..TLV_HEADER_SIZE + value.len()])
        } else {
            self.send_all(&header)?;
            self.send_all(value)
        }
    }

    /// Send a user frame. The tag must be below [`RESERVED_TAG_BASE`].
    pub fn send_tlv(&mut self, tag: u32, value: &[u8]) -> Result<(), CommsError> {
        if tag >= RESERVED_TAG_BASE {
            return Err(CommsError::ReservedTag(tag));
        }
        self.send_tlv_internal(tag, value)
    }

    fn recv_tl(&mut self) -> Result<(u32, usize), CommsError> {
        let mut header = [0u8; TLV_HEADER_SIZE];
        self.recv_all(&mut header)?;
        let (tag, len) = decode_header(&header);
        if len > self.max_msg_size {
            return Err(CommsError::Oversize {
                len,
                max: self.max_msg_size,
            });
        }
        if len > WARN_MSG_SIZE {
            warn!(len, tag, "oversized TLV frame");
        }
        Ok((tag, len))
    }

    /// Receive the next frame, whatever its tag.
    pub fn recv_tlv(&mut self) -> Result<(u32, Vec<u8>), CommsError> {
        let (tag, len) = self.recv_tl()?;
        let mut value = vec![0u8; len];
        if len > 0 {
            self.recv_all(&mut value)?;
        }
        Ok((tag, value))
    }

    /// Receive a frame and require a specific tag.
    pub fn recv_tlv_expect(&mut self, expected: u32) -> Result<Vec<u8>, CommsError> {
        let (tag, value) = self.recv_tlv()?;
        if tag != expected {
            return Err(CommsError::TagMismatch { expected, got: tag });
        }
        Ok(value)
    }

    fn recv_fixed(&mut self, expected_tag: u32, len: usize) -> Result<Vec<u8>, CommsError> {
        let value = self.recv_tlv_expect(expected_tag)?;
        if value.len() != len {
            return Err(CommsError::SizeMismatch {
                expected: len,
                got: value.len(),
            });
        }
        Ok(value)
    }

    // ---- typed helpers -----------------------------------------------------

    pub fn send_bool(&mut self, v: bool) -> Result<(), CommsError> {
        self.send_tlv_internal(TAG_BOOL, &[u8::from(v)])
    }

    pub fn recv_bool(&mut self) -> Result<bool, CommsError> {
        let value = self.recv_fixed(TAG_BOOL, 1)?;
        Ok(value[0] != 0)
    }

    pub fn send_string(&mut self, v: &str) -> Result<(), CommsError> {
        self.send_tlv_internal(TAG_STRING, v.as_bytes())
    }

    pub fn recv_string(&mut self) -> Result<String, CommsError> {
        let value = self.recv_tlv_expect(TAG_STRING)?;
        String::from_utf8(value).map_err(|_| CommsError::BadString)
    }

    pub fn send_bytes(&mut self, v: &[u8]) -> Result<(), CommsError> {
        self.send_tlv_internal(TAG_BYTES, v)
    }

    pub fn recv_bytes(&mut self) -> Result<Vec<u8>, CommsError> {
        self.recv_tlv_expect(TAG_BYTES)
    }

    pub fn send_status(&mut self, status: &StatusFrame) -> Result<(), CommsError> {
        let mut payload = Vec::with_capacity(4 + status.message.len());
        payload.extend_from_slice(&status.code.to_ne_bytes());
        payload.extend_from_slice(status.message.as_bytes());
        self.send_tlv_internal(TAG_STATUS, &payload)
    }

    pub fn recv_status(&mut self) -> Result<StatusFrame, CommsError> {
        let payload = self.recv_tlv_expect(TAG_STATUS)?;
        if payload.len() < 4 {
            return Err(CommsError::BadStatus);
        }
        let code = u32::from_ne_bytes(payload[..4].try_into().expect("status code"));
        let message =
            String::from_utf8(payload[4..].to_vec()).map_err(|_| CommsError::BadString)?;
        Ok(StatusFrame { code, message })
    }

    // ---- ancillary data ----------------------------------------------------

    /// Send a file descriptor via `SCM_RIGHTS`. The receiver owns the copy.
    pub fn send_fd(&mut self, fd: RawFd) -> Result<(), CommsError> {
        let sock = self.connected_fd()?;
        let header = encode_header(TAG_FD, 0);

        let iov = libc::iovec {
            iov_base: header.as_ptr() as *mut libc::c_void,
            iov_len: header.len(),
        };

        // SAFETY: CMSG_SPACE over a constant size.
        let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        // SAFETY: zeroed msghdr is a valid initial state.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &iov as *const _ as *mut _;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_space;

        // SAFETY: msg_control points at cmsg_space valid bytes.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize;
            std::ptr::copy_nonoverlapping(
                (&fd as *const RawFd).cast::<u8>(),
                libc::CMSG_DATA(cmsg),
                size_of::<RawFd>(),
            );
        }

        let ret = retry_eintr(|| {
            // SAFETY: msg and its buffers outlive the call.
            let r = unsafe { libc::sendmsg(sock, &msg, 0) };
            if r < 0 {
                Err(last_errno())
            } else {
                Ok(r as usize)
            }
        });
        match ret {
            Err(Errno::PIPE) => {
                self.terminate();
                Err(CommsError::Disconnected)
            }
            Err(errno) => {
                if is_fatal_errno(errno) {
                    self.terminate();
                }
                Err(CommsError::Sys {
                    op: "sendmsg(SCM_RIGHTS)",
                    errno,
                })
            }
            Ok(sent) if sent != header.len() => Err(CommsError::ShortWrite {
                written: sent,
                requested: header.len(),
            }),
            Ok(_) => Ok(()),
        }
    }

    /// Receive a file descriptor sent with [`send_fd`](Self::send_fd).
    /// The returned fd is owned by the caller.
    pub fn recv_fd(&mut self) -> Result<OwnedFd, CommsError> {
        let sock = self.connected_fd()?;
        let mut header = [0u8; TLV_HEADER_SIZE];

        let mut iov = libc::iovec {
            iov_base: header.as_mut_ptr().cast(),
            iov_len: header.len(),
        };

        // SAFETY: CMSG_SPACE over a constant size.
        let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        // SAFETY: zeroed msghdr is a valid initial state.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_space;

        let ret = retry_eintr(|| {
            // SAFETY: msg and its buffers outlive the call.
            let r = unsafe { libc::recvmsg(sock, &mut msg, 0) };
            if r < 0 {
                Err(last_errno())
            } else {
                Ok(r as usize)
            }
        });
        match ret {
            Err(errno) => {
                if is_fatal_errno(errno) {
                    self.terminate();
                }
                return Err(CommsError::Sys {
                    op: "recvmsg(SCM_RIGHTS)",
                    errno,
                });
            }
            Ok(0) => {
                self.terminate();
                return Err(CommsError::Disconnected);
            }
            Ok(n) if n != header.len() => {
                return Err(CommsError::SizeMismatch {
                    expected: header.len(),
                    got: n,
                });
            }
            Ok(_) => {}
        }

        let (tag, _) = decode_header(&header);
        if tag != TAG_FD {
            return Err(CommsError::TagMismatch {
                expected: TAG_FD,
                got: tag,
            });
        }

        // SAFETY: msg_control was populated by a successful recvmsg.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                    && (*cmsg).cmsg_len == libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize
                {
                    let mut fd: RawFd = -1;
                    std::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsg),
                        (&mut fd as *mut RawFd).cast::<u8>(),
                        size_of::<RawFd>(),
                    );
                    return Ok(OwnedFd::from_raw_fd(fd));
                }
                cmsg = libc::CMSG_NXTHDR(&mut msg, cmsg);
            }
        }
        // Usually means the receiving process is out of free descriptors.
        Err(CommsError::NoAncillaryFd)
    }

    /// Enable `SO_PASSCRED` so later receives carry `SCM_CREDENTIALS`.
    pub fn set_passcred(&mut self) -> Result<(), CommsError> {
        let sock = self.connected_fd()?;
        let one: libc::c_int = 1;
        // SAFETY: setsockopt with a pointer to a live int.
        let ret = unsafe {
            libc::setsockopt(
                sock,
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                (&one as *const libc::c_int).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(CommsError::sys("setsockopt(SO_PASSCRED)"));
        }
        Ok(())
    }

    /// Send one plain byte so the peer's `recv_creds` has a message to
    /// attach credentials to.
    pub fn send_creds(&mut self) -> Result<(), CommsError> {
        self.send_all(&[0u8])
    }

    /// Receive the peer's credentials. [`set_passcred`](Self::set_passcred)
    /// must have been called on this side first.
    pub fn recv_creds(&mut self) -> Result<Creds, CommsError> {
        let sock = self.connected_fd()?;
        let mut byte = [0u8; 1];

        let mut iov = libc::iovec {
            iov_base: byte.as_mut_ptr().cast(),
            iov_len: 1,
        };

        // SAFETY: CMSG_SPACE over a constant size.
        let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<libc::ucred>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        // SAFETY: zeroed msghdr is a valid initial state.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_space;

        let ret = retry_eintr(|| {
            // SAFETY: msg and its buffers outlive the call.
            let r = unsafe { libc::recvmsg(sock, &mut msg, 0) };
            if r < 0 {
                Err(last_errno())
            } else {
                Ok(r as usize)
            }
        });
        match ret {
            Err(errno) => {
                if is_fatal_errno(errno) {
                    self.terminate();
                }
                return Err(CommsError::Sys {
                    op: "recvmsg(SCM_CREDENTIALS)",
                    errno,
                });
            }
            Ok(0) => {
                self.terminate();
                return Err(CommsError::Disconnected);
            }
            Ok(_) => {}
        }

        // SAFETY: msg_control was populated by a successful recvmsg.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS
                {
                    let mut uc: libc::ucred = std::mem::zeroed();
                    std::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsg),
                        (&mut uc as *mut libc::ucred).cast::<u8>(),
                        size_of::<libc::ucred>(),
                    );
                    debug!(pid = uc.pid, uid = uc.uid, gid = uc.gid, "received peer creds");
                    return Ok(Creds {
                        pid: uc.pid,
                        uid: uc.uid,
                        gid: uc.gid,
                    });
                }
                cmsg = libc::CMSG_NXTHDR(&mut msg, cmsg);
            }
        }
        Err(CommsError::NoAncillaryCreds)
    }
}

macro_rules! int_helpers {
    ($(($send:ident, $recv:ident, $ty:ty, $tag:expr)),* $(,)?) => {
        impl Comms {
            $(
                pub fn $send(&mut self, v: $ty) -> Result<(), CommsError> {
                    self.send_tlv_internal($tag, &v.to_ne_bytes())
                }

                pub fn $recv(&mut self) -> Result<$ty, CommsError> {
                    let value = self.recv_fixed($tag, size_of::<$ty>())?;
                    Ok(<$ty>::from_ne_bytes(value.as_slice().try_into().expect("fixed size")))
                }
            )*
        }
    };
}

int_helpers!(
    (send_i8, recv_i8, i8, TAG_I8),
    (send_u8, recv_u8, u8, TAG_U8),
    (send_i16, recv_i16, i16, TAG_I16),
    (send_u16, recv_u16, u16, TAG_U16),
    (send_i32, recv_i32, i32, TAG_I32),
    (send_u32, recv_u32, u32, TAG_U32),
    (send_i64, recv_i64, i64, TAG_I64),
    (send_u64, recv_u64, u64, TAG_U64),
);

/// Create a connected `AF_UNIX` stream socketpair, close-on-exec.
pub fn socketpair() -> Result<(OwnedFd, OwnedFd), CommsError> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds is a valid out-array of two ints.
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret != 0 {
        return Err(CommsError::sys("socketpair"));
    }
    // SAFETY: both fds are fresh and owned.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn sockaddr_un(
    name: &str,
    abstract_uds: bool,
) -> Result<(libc::sockaddr_un, libc::socklen_t), CommsError> {
    // SAFETY: all-zero sockaddr_un is valid.
    let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = name.as_bytes();
    let path_len = sun.sun_path.len();
    let base = offset_of!(libc::sockaddr_un, sun_path) as libc::socklen_t;

    let slen = if abstract_uds {
        // Abstract socket: a leading NUL byte, then the name, no terminator.
        if bytes.len() > path_len - 1 {
            return Err(CommsError::NameTooLong(name.into()));
        }
        for (dst, src) in sun.sun_path[1..].iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        base + 1 + bytes.len() as libc::socklen_t
    } else {
        if bytes.len() >= path_len {
            return Err(CommsError::NameTooLong(name.into()));
        }
        for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        base + bytes.len() as libc::socklen_t + 1
    };
    Ok((sun, slen))
}

/// The listening side: binds a UNIX socket and produces one [`Comms`] per
/// accepted connection. Owns the bind fd separately from any connection.
pub struct Listener {
    fd: OwnedFd,
    name: String,
}

impl Listener {
    pub fn bind(socket_name: &str, abstract_uds: bool) -> Result<Self, CommsError> {
        // SAFETY: plain socket(2).
        let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
        if raw < 0 {
            return Err(CommsError::sys("socket(AF_UNIX)"));
        }
        // SAFETY: raw is fresh and owned.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let (sun, slen) = sockaddr_un(socket_name, abstract_uds)?;
        // SAFETY: sun outlives the call, slen bounds it.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&sun as *const libc::sockaddr_un).cast(),
                slen,
            )
        };
        if ret != 0 {
            return Err(CommsError::sys("bind"));
        }
        // SAFETY: bound socket.
        if unsafe { libc::listen(fd.as_raw_fd(), 0) } != 0 {
            return Err(CommsError::sys("listen"));
        }
        debug!(socket = socket_name, "listening");
        Ok(Self {
            fd,
            name: socket_name.into(),
        })
    }

    pub fn accept(&self) -> Result<Comms, CommsError> {
        let ret = retry_eintr(|| {
            // SAFETY: accept with no peer-address capture.
            let r = unsafe { libc::accept(self.fd.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
            if r < 0 {
                Err(last_errno())
            } else {
                Ok(r)
            }
        });
        match ret {
            Err(errno) => Err(CommsError::Sys { op: "accept", errno }),
            Ok(raw) => {
                debug!(socket = %self.name, fd = raw, "accepted connection");
                // SAFETY: fresh connection fd.
                let mut comms = Comms::from_fd(unsafe { OwnedFd::from_raw_fd(raw) });
                comms.name = format!("comms:{}", self.name);
                Ok(comms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Comms, Comms) {
        let (a, b) = socketpair().expect("socketpair");
        (Comms::from_fd(a), Comms::from_fd(b))
    }

    #[test]
    fn header_roundtrip() {
        let buf = encode_header(0x8000_0101, 12345);
        let (tag, len) = decode_header(&buf);
        assert_eq!(tag, 0x8000_0101);
        assert_eq!(len, 12345);
    }

    #[test]
    fn tlv_roundtrip_byte_exact() {
        let (mut tx, mut rx) = pair();
        tx.send_tlv(7, b"hello tlv").unwrap();
        let (tag, value) = rx.recv_tlv().unwrap();
        assert_eq!(tag, 7);
        assert_eq!(value, b"hello tlv");
    }

    #[test]
    fn large_frame_uses_two_writes() {
        let (mut tx, mut rx) = pair();
        let payload = vec![0xabu8; 64 * 1024];
        let expected = payload.clone();
        let sender = std::thread::spawn(move || {
            tx.send_bytes(&payload).unwrap();
        });
        let got = rx.recv_bytes().unwrap();
        sender.join().unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn user_tag_must_be_below_reserved_range() {
        let (mut tx, _rx) = pair();
        let err = tx.send_tlv(RESERVED_TAG_BASE, b"x").unwrap_err();
        assert!(matches!(err, CommsError::ReservedTag(_)));
        assert!(tx.is_connected());
    }

    #[test]
    fn typed_int_roundtrips() {
        let (mut tx, mut rx) = pair();
        tx.send_u8(0xfe).unwrap();
        tx.send_i32(-12345).unwrap();
        tx.send_u64(u64::MAX).unwrap();
        tx.send_bool(true).unwrap();
        assert_eq!(rx.recv_u8().unwrap(), 0xfe);
        assert_eq!(rx.recv_i32().unwrap(), -12345);
        assert_eq!(rx.recv_u64().unwrap(), u64::MAX);
        assert!(rx.recv_bool().unwrap());
    }

    #[test]
    fn tag_mismatch_is_detected() {
        let (mut tx, mut rx) = pair();
        tx.send_u32(1).unwrap();
        let err = rx.recv_u64().unwrap_err();
        assert!(matches!(err, CommsError::TagMismatch { .. }));
    }

    #[test]
    fn string_and_status_roundtrip() {
        let (mut tx, mut rx) = pair();
        tx.send_string("zażółć 🦀").unwrap();
        tx.send_status(&StatusFrame::error(13, "permission denied")).unwrap();
        assert_eq!(rx.recv_string().unwrap(), "zażółć 🦀");
        let status = rx.recv_status().unwrap();
        assert_eq!(status.code, 13);
        assert_eq!(status.message, "permission denied");
        assert!(!status.is_ok());
    }

    #[test]
    fn oversize_frame_rejected_before_allocation() {
        let (mut tx, mut rx) = pair();
        rx.set_max_msg_size(16);
        tx.send_bytes(&[0u8; 64]).unwrap();
        let err = rx.recv_tlv().unwrap_err();
        assert!(matches!(err, CommsError::Oversize { len: 64, max: 16 }));
    }

    #[test]
    fn terminate_is_terminal() {
        let (mut tx, _rx) = pair();
        tx.terminate();
        assert!(!tx.is_connected());
        assert!(matches!(tx.send_u32(0), Err(CommsError::Terminated)));
        assert!(matches!(tx.recv_tlv(), Err(CommsError::Terminated)));
    }

    #[test]
    fn peer_close_is_disconnect() {
        let (mut tx, rx) = pair();
        drop(rx);
        // The first write may succeed into the socket buffer; a recv sees EOF.
        let err = tx.recv_tlv().unwrap_err();
        assert!(matches!(err, CommsError::Disconnected | CommsError::Sys { .. }));
        assert!(!tx.is_connected());
    }

    #[test]
    fn fd_passing_roundtrip() {
        let (mut tx, mut rx) = pair();
        let mut pipe_fds = [0 as RawFd; 2];
        // SAFETY: valid out-array.
        assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);
        // SAFETY: fresh pipe fds.
        let (pipe_r, pipe_w) = unsafe {
            (OwnedFd::from_raw_fd(pipe_fds[0]), OwnedFd::from_raw_fd(pipe_fds[1]))
        };

        tx.send_fd(pipe_r.as_raw_fd()).unwrap();
        let received = rx.recv_fd().unwrap();

        // Write through the original, read through the passed copy.
        // SAFETY: both fds are live.
        unsafe {
            assert_eq!(libc::write(pipe_w.as_raw_fd(), c"ok".as_ptr().cast(), 2), 2);
            let mut buf = [0u8; 2];
            assert_eq!(libc::read(received.as_raw_fd(), buf.as_mut_ptr().cast(), 2), 2);
            assert_eq!(&buf, b"ok");
        }
    }

    #[test]
    fn credential_passing() {
        let (mut tx, mut rx) = pair();
        rx.set_passcred().unwrap();
        tx.send_creds().unwrap();
        let creds = rx.recv_creds().unwrap();
        // SAFETY: getters are always safe.
        unsafe {
            assert_eq!(creds.pid, libc::getpid());
            assert_eq!(creds.uid, libc::getuid());
            assert_eq!(creds.gid, libc::getgid());
        }
    }

    #[test]
    fn pathname_listener_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comms.sock");
        let name = path.to_str().unwrap().to_string();
        let listener = Listener::bind(&name, false).unwrap();
        let client = std::thread::spawn(move || {
            let mut comms = Comms::connect(&name, false).unwrap();
            comms.send_u64(99).unwrap();
        });
        let mut server_side = listener.accept().unwrap();
        assert_eq!(server_side.recv_u64().unwrap(), 99);
        client.join().unwrap();
    }

    #[test]
    fn abstract_listener_accepts() {
        let name = format!("warden-test-{}", std::process::id());
        let listener = Listener::bind(&name, true).unwrap();
        let client_name = name.clone();
        let client = std::thread::spawn(move || {
            let mut comms = Comms::connect(&client_name, true).unwrap();
            comms.send_string("ping").unwrap();
            comms.recv_string().unwrap()
        });
        let mut server_side = listener.accept().unwrap();
        assert_eq!(server_side.recv_string().unwrap(), "ping");
        server_side.send_string("pong").unwrap();
        assert_eq!(client.join().unwrap(), "pong");
    }
}
