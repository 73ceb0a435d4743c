//! Network proxy: validated `connect()` on behalf of the sandboxee.
//!
//! The sandboxee has no network namespace escape; instead it ships the
//! `sockaddr` it wants to reach over a dedicated comms channel. The proxy
//! checks the address against the policy allowlist, performs the
//! `connect()` itself and passes the connected socket back via
//! `SCM_RIGHTS`. Reply protocol: an `i32` status (0, or the connect
//! errno) followed by the fd frame on success.
//!
//! A disallowed address is a sandbox violation, not an errno: the proxy
//! records the peer, raises the violation flag with release ordering and
//! wakes the monitor, which kills the sandboxee.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use ipnet::IpNet;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::comms::{Comms, CommsError};
use crate::util::retry_eintr;
use warden_sys::last_errno;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllowedHostsError {
    #[error("invalid CIDR block {0:?}")]
    BadCidr(String),
}

/// The policy's network allowlist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedHosts {
    allow_all: bool,
    nets: Vec<IpNet>,
}

impl AllowedHosts {
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            nets: Vec::new(),
        }
    }

    /// Add a CIDR block, e.g. `127.0.0.1/32` or `2001:db8::/64`.
    pub fn add(&mut self, cidr: &str) -> Result<(), AllowedHostsError> {
        let net = cidr
            .parse::<IpNet>()
            .or_else(|_| cidr.parse::<IpAddr>().map(IpNet::from))
            .map_err(|_| AllowedHostsError::BadCidr(cidr.into()))?;
        self.nets.push(net);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        !self.allow_all && self.nets.is_empty()
    }

    pub fn is_allowed(&self, addr: &SocketAddr) -> bool {
        self.allow_all || self.nets.iter().any(|net| net.contains(&addr.ip()))
    }
}

/// Parse the raw `sockaddr` bytes a sandboxee sent. Only exactly-sized
/// `sockaddr_in` / `sockaddr_in6` are accepted.
pub(crate) fn parse_sockaddr(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() < 2 {
        return None;
    }
    let family = u16::from_ne_bytes([bytes[0], bytes[1]]);
    if family == libc::AF_INET as u16 && bytes.len() == size_of::<libc::sockaddr_in>() {
        let port = u16::from_be_bytes([bytes[2], bytes[3]]);
        let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
        return Some(SocketAddr::new(IpAddr::V4(ip), port));
    }
    if family == libc::AF_INET6 as u16 && bytes.len() == size_of::<libc::sockaddr_in6>() {
        let port = u16::from_be_bytes([bytes[2], bytes[3]]);
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&bytes[8..24]);
        return Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port));
    }
    None
}

/// Running proxy thread plus the state the monitor watches.
pub(crate) struct ProxyHandle {
    pub violation_occurred: Arc<AtomicBool>,
    pub violation_message: Arc<Mutex<String>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            handle.join().ok();
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.join();
    }
}

pub(crate) struct NetworkProxyServer {
    comms: Comms,
    allowed: AllowedHosts,
    violation_occurred: Arc<AtomicBool>,
    violation_message: Arc<Mutex<String>>,
    notify_monitor: Box<dyn Fn() + Send>,
}

impl NetworkProxyServer {
    /// Start the proxy on its own thread. `notify_monitor` is invoked
    /// (from the proxy thread) after a violation is flagged.
    pub fn spawn(
        comms: Comms,
        allowed: AllowedHosts,
        notify_monitor: Box<dyn Fn() + Send>,
    ) -> ProxyHandle {
        let violation_occurred = Arc::new(AtomicBool::new(false));
        let violation_message = Arc::new(Mutex::new(String::new()));
        let server = Self {
            comms,
            allowed,
            violation_occurred: Arc::clone(&violation_occurred),
            violation_message: Arc::clone(&violation_message),
            notify_monitor,
        };
        let thread = thread::Builder::new()
            .name("warden-net-proxy".into())
            .spawn(move || server.run())
            .expect("spawning proxy thread");
        ProxyHandle {
            violation_occurred,
            violation_message,
            thread: Some(thread),
        }
    }

    fn run(mut self) {
        loop {
            if self.violation_occurred.load(Ordering::Relaxed) {
                break;
            }
            match self.process_request() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    // The channel dies with the sandboxee; that is the
                    // normal shutdown path.
                    debug!(error = %err, "proxy channel closed");
                    break;
                }
            }
        }
        info!("network proxy shut down");
    }

    /// Handle one connect request. `Ok(false)` means a violation ended
    /// the session.
    fn process_request(&mut self) -> Result<bool, CommsError> {
        let raw = self.comms.recv_bytes()?;

        let Some(addr) = parse_sockaddr(&raw) else {
            warn!(len = raw.len(), "malformed sockaddr from sandboxee");
            self.comms.send_i32(libc::EINVAL)?;
            return Ok(true);
        };

        if !self.allowed.is_allowed(&addr) {
            let msg = format!("connection to {addr} denied by policy");
            warn!(%addr, "network violation");
            if let Ok(mut slot) = self.violation_message.lock() {
                *slot = msg;
            }
            self.violation_occurred.store(true, Ordering::Release);
            (self.notify_monitor)();
            return Ok(false);
        }

        match connect_stream(&raw, &addr) {
            Ok(sock) => {
                debug!(%addr, "proxied connection established");
                self.comms.send_i32(0)?;
                self.comms.send_fd(sock.as_raw_fd())?;
            }
            Err(errno) => {
                debug!(%addr, errno, "proxied connect failed");
                self.comms.send_i32(errno)?;
            }
        }
        Ok(true)
    }
}

/// `socket()` + `connect()` using the sandboxee's own sockaddr bytes.
fn connect_stream(raw: &[u8], addr: &SocketAddr) -> Result<OwnedFd, i32> {
    let family = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    // SAFETY: plain socket(2).
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(last_errno().raw_os_error());
    }
    // SAFETY: fd is fresh and owned.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let ret = retry_eintr(|| {
        // SAFETY: raw holds a complete sockaddr of the right size.
        let r = unsafe {
            libc::connect(
                sock.as_raw_fd(),
                raw.as_ptr().cast::<libc::sockaddr>(),
                raw.len() as libc::socklen_t,
            )
        };
        if r != 0 {
            Err(last_errno())
        } else {
            Ok(())
        }
    });
    match ret {
        Ok(()) => Ok(sock),
        Err(errno) => Err(errno.raw_os_error()),
    }
}
