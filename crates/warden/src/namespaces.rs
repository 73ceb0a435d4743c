//! Namespace entry and mount-tree construction for the sandboxee.
//!
//! The child unshares the namespaces its policy asks for, parks while the
//! supervisor writes its UID/GID maps, then builds a private mount tree
//! under a tmpfs staging root and `pivot_root`s into it:
//!
//! ```text
//! <staging tmpfs>
//! ├── <bind mounts from the policy, read-only unless marked writable>
//! ├── <tmpfs mounts from the policy>
//! └── proc/    when a PID namespace was requested
//! ```
//!
//! Everything here runs between `fork` and `execve`: no allocator-heavy
//! work, no buffered stdio, errors reported through plain `Result`s.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use thiserror::Error;

use warden_sys::last_errno;

/// Which namespaces the sandboxee is placed into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    pub user: bool,
    pub mount: bool,
    pub pid: bool,
    pub net: bool,
    pub ipc: bool,
    pub uts: bool,
    /// Hostname inside the UTS namespace.
    pub hostname: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            user: true,
            mount: true,
            pid: true,
            net: true,
            ipc: true,
            uts: true,
            hostname: "warden".into(),
        }
    }
}

impl NamespaceConfig {
    /// No namespaces at all.
    pub fn disabled() -> Self {
        Self {
            user: false,
            mount: false,
            pid: false,
            net: false,
            ipc: false,
            uts: false,
            hostname: String::new(),
        }
    }

    pub fn any(&self) -> bool {
        self.user || self.mount || self.pid || self.net || self.ipc || self.uts
    }

    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }
}

/// One mount in the sandboxee's tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// Bind `src` from the host to `dst` inside the sandbox.
    Bind {
        src: PathBuf,
        dst: PathBuf,
        writable: bool,
    },
    /// Fresh tmpfs at `dst`, `size` bytes.
    Tmpfs { dst: PathBuf, size: usize },
}

impl Mount {
    pub fn bind_ro(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self::Bind {
            src: src.into(),
            dst: dst.into(),
            writable: false,
        }
    }

    pub fn bind_rw(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self::Bind {
            src: src.into(),
            dst: dst.into(),
            writable: true,
        }
    }

    pub fn tmpfs(dst: impl Into<PathBuf>, size: usize) -> Self {
        Self::Tmpfs {
            dst: dst.into(),
            size,
        }
    }

    pub fn dst(&self) -> &Path {
        match self {
            Self::Bind { dst, .. } | Self::Tmpfs { dst, .. } => dst,
        }
    }
}

/// Longest path component accepted by [`validate_absolute_path`].
pub const MAX_PATH_COMPONENT: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path must be absolute: {0:?}")]
    NotAbsolute(String),

    #[error("path contains a {1:?} component: {0:?}")]
    DotComponent(String, &'static str),

    #[error("path contains an empty component (double slash): {0:?}")]
    EmptyComponent(String),

    #[error("path has a trailing slash: {0:?}")]
    TrailingSlash(String),

    #[error("path component longer than {MAX_PATH_COMPONENT} bytes: {0:?}")]
    ComponentTooLong(String),

    #[error("path contains a NUL byte")]
    NulByte,
}

/// Accepts `/` and any canonical absolute path: no `.`/`..`, no empty
/// components, no trailing slash, components length-bounded.
pub fn validate_absolute_path(path: &str) -> Result<(), PathError> {
    if path.contains('\0') {
        return Err(PathError::NulByte);
    }
    if !path.starts_with('/') {
        return Err(PathError::NotAbsolute(path.into()));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(PathError::TrailingSlash(path.into()));
    }
    for component in path[1..].split('/') {
        match component {
            "" => return Err(PathError::EmptyComponent(path.into())),
            "." => return Err(PathError::DotComponent(path.into(), ".")),
            ".." => return Err(PathError::DotComponent(path.into(), "..")),
            c if c.len() > MAX_PATH_COMPONENT => {
                return Err(PathError::ComponentTooLong(path.into()))
            }
            _ => {}
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("unshare failed: {0}")]
    Unshare(nix::Error),

    #[error("mount {what} failed: {errno}")]
    Mount {
        what: String,
        errno: nix::Error,
    },

    #[error("pivot_root failed: {0}")]
    PivotRoot(rustix::io::Errno),

    #[error("sethostname failed: {0}")]
    Hostname(rustix::io::Errno),

    #[error("id map write failed: {0}")]
    IdMap(io::Error),

    #[error("mount point creation failed: {0}")]
    MountPoint(io::Error),

    #[error("invalid path in mount tree")]
    BadPath,
}

/// Enter the configured namespaces. Call in the child, before any mounts.
pub fn enter(config: &NamespaceConfig) -> Result<(), NamespaceError> {
    if !config.any() {
        return Ok(());
    }
    unshare(config.clone_flags()).map_err(NamespaceError::Unshare)?;
    Ok(())
}

/// Write UID/GID maps for `pid` so it appears as root inside its user
/// namespace. Runs in the supervisor; setgroups must be denied before the
/// GID map per kernel rules.
pub fn write_id_maps(pid: libc::pid_t) -> Result<(), NamespaceError> {
    // SAFETY: getuid/getgid are always safe.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    fs::write(format!("/proc/{pid}/setgroups"), "deny\n").map_err(NamespaceError::IdMap)?;
    fs::write(format!("/proc/{pid}/uid_map"), format!("0 {uid} 1\n"))
        .map_err(NamespaceError::IdMap)?;
    fs::write(format!("/proc/{pid}/gid_map"), format!("0 {gid} 1\n"))
        .map_err(NamespaceError::IdMap)?;
    Ok(())
}

/// Build the mount tree under `staging` and pivot into it.
///
/// `staging` must be an empty directory on the host. Requires the mount
/// (and usually user) namespace to have been entered already.
pub fn setup_mount_tree(
    staging: &Path,
    mounts: &[Mount],
    config: &NamespaceConfig,
) -> Result<(), NamespaceError> {
    // Stop mount events from propagating back to the host.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|errno| NamespaceError::Mount {
        what: "make-rprivate /".into(),
        errno,
    })?;

    // A tmpfs staging root everything else hangs off.
    mount(
        Some("tmpfs"),
        staging,
        Some("tmpfs"),
        MsFlags::empty(),
        Some("mode=0755"),
    )
    .map_err(|errno| NamespaceError::Mount {
        what: format!("tmpfs {}", staging.display()),
        errno,
    })?;

    for m in mounts {
        let rel = m
            .dst()
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect::<PathBuf>();
        let target = staging.join(rel);
        match m {
            Mount::Bind { src, writable, .. } => {
                prepare_mount_point(&target, src.is_dir())?;
                bind_mount(src, &target, !writable)?;
            }
            Mount::Tmpfs { size, .. } => {
                prepare_mount_point(&target, true)?;
                mount(
                    Some("tmpfs"),
                    &target,
                    Some("tmpfs"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                    Some(format!("size={size}").as_str()),
                )
                .map_err(|errno| NamespaceError::Mount {
                    what: format!("tmpfs {}", target.display()),
                    errno,
                })?;
            }
        }
    }

    if config.pid {
        let proc_dir = staging.join("proc");
        prepare_mount_point(&proc_dir, true)?;
        mount(
            Some("proc"),
            &proc_dir,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
        .map_err(|errno| NamespaceError::Mount {
            what: "proc".into(),
            errno,
        })?;
    }

    if config.uts && !config.hostname.is_empty() {
        set_hostname(&config.hostname)?;
    }

    pivot_into(staging)
}

fn prepare_mount_point(target: &Path, is_dir: bool) -> Result<(), NamespaceError> {
    if is_dir {
        fs::create_dir_all(target).map_err(NamespaceError::MountPoint)?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(NamespaceError::MountPoint)?;
        }
        if !target.exists() {
            fs::File::create(target).map_err(NamespaceError::MountPoint)?;
        }
    }
    Ok(())
}

fn bind_mount(src: &Path, target: &Path, readonly: bool) -> Result<(), NamespaceError> {
    mount(
        Some(src),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|errno| NamespaceError::Mount {
        what: format!("bind {} -> {}", src.display(), target.display()),
        errno,
    })?;
    if readonly {
        // A bind mount only turns read-only on remount.
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID,
            None::<&str>,
        )
        .map_err(|errno| NamespaceError::Mount {
            what: format!("remount-ro {}", target.display()),
            errno,
        })?;
    }
    Ok(())
}

fn pivot_into(new_root: &Path) -> Result<(), NamespaceError> {
    let old_root = new_root.join(".host");
    fs::create_dir_all(&old_root).map_err(NamespaceError::MountPoint)?;

    let new_c = path_cstr(new_root)?;
    let old_c = path_cstr(&old_root)?;
    rustix::process::pivot_root(new_c.as_c_str(), old_c.as_c_str())
        .map_err(NamespaceError::PivotRoot)?;

    // SAFETY: plain chdir/umount2/rmdir on constant paths.
    unsafe {
        libc::chdir(c"/".as_ptr());
        libc::umount2(c"/.host".as_ptr(), libc::MNT_DETACH);
        libc::rmdir(c"/.host".as_ptr());
    }
    Ok(())
}

fn set_hostname(name: &str) -> Result<(), NamespaceError> {
    // SAFETY: reads name.len() bytes from a live slice.
    let ret = unsafe { libc::sethostname(name.as_ptr().cast::<libc::c_char>(), name.len()) };
    if ret != 0 {
        return Err(NamespaceError::Hostname(last_errno()));
    }
    Ok(())
}

fn path_cstr(path: &Path) -> Result<CString, NamespaceError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| NamespaceError::BadPath)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation_accepts_canonical() {
        assert!(validate_absolute_path("/").is_ok());
        assert!(validate_absolute_path("/usr/lib/x86_64-linux-gnu").is_ok());
        assert!(validate_absolute_path("/a").is_ok());
    }

    #[test]
    fn path_validation_rejects_non_canonical() {
        assert_eq!(
            validate_absolute_path("relative/path"),
            Err(PathError::NotAbsolute("relative/path".into()))
        );
        assert!(matches!(
            validate_absolute_path("/usr/./lib"),
            Err(PathError::DotComponent(_, "."))
        ));
        assert!(matches!(
            validate_absolute_path("/usr/../etc"),
            Err(PathError::DotComponent(_, ".."))
        ));
        assert!(matches!(
            validate_absolute_path("/usr//lib"),
            Err(PathError::EmptyComponent(_))
        ));
        assert!(matches!(
            validate_absolute_path("/usr/lib/"),
            Err(PathError::TrailingSlash(_))
        ));
        let long = format!("/{}", "x".repeat(MAX_PATH_COMPONENT + 1));
        assert!(matches!(
            validate_absolute_path(&long),
            Err(PathError::ComponentTooLong(_))
        ));
    }

    #[test]
    fn namespace_flags_cover_config() {
        let config = NamespaceConfig::default();
        let flags = config.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));

        assert!(!NamespaceConfig::disabled().any());
        assert!(NamespaceConfig::disabled().clone_flags().is_empty());
    }

    #[test]
    fn mount_accessors() {
        let m = Mount::bind_ro("/usr", "/usr");
        assert_eq!(m.dst(), Path::new("/usr"));
        let t = Mount::tmpfs("/tmp", 1 << 20);
        assert_eq!(t.dst(), Path::new("/tmp"));
    }
}
