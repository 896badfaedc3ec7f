//! Default device nodes for a freshly mounted `/dev`.
//!
//! Device nodes are bind-mounted from the host instead of created with
//! `mknod(2)`, which also works inside an unprivileged user namespace.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use nix::mount::{MsFlags, mount};

use runcell_common::error::IsolationError;

/// Character devices every container gets.
pub const DEFAULT_DEVICES: [&str; 6] = ["null", "zero", "full", "random", "urandom", "tty"];

/// Symlinks every container gets, as `(link, target)`.
pub const DEFAULT_SYMLINKS: [(&str, &str); 5] = [
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
    ("ptmx", "pts/ptmx"),
];

fn dev_err(target: &Path, message: impl std::fmt::Display) -> IsolationError {
    IsolationError::Mount {
        target: target.to_path_buf(),
        message: message.to_string(),
    }
}

/// Populates `dev_dir` (the container's `/dev`, seen from the host side).
///
/// Existing entries are left alone so bundle mounts win.
///
/// # Errors
///
/// Returns [`IsolationError::Mount`] if a node or link cannot be created.
pub fn populate(dev_dir: &Path) -> Result<(), IsolationError> {
    for name in DEFAULT_DEVICES {
        let target = dev_dir.join(name);
        if target.exists() {
            continue;
        }
        let _ = fs::File::create(&target).map_err(|e| dev_err(&target, e))?;
        let host = Path::new("/dev").join(name);
        mount(
            Some(host.as_path()),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| dev_err(&target, format!("bind {}: {}", host.display(), e.desc())))?;
    }
    link_defaults(dev_dir)
}

/// Creates the [`DEFAULT_SYMLINKS`] that do not exist yet.
///
/// # Errors
///
/// Returns [`IsolationError::Mount`] if a link cannot be created.
pub fn link_defaults(dev_dir: &Path) -> Result<(), IsolationError> {
    for (link, target) in DEFAULT_SYMLINKS {
        let path = dev_dir.join(link);
        if path.symlink_metadata().is_ok() {
            continue;
        }
        symlink(target, &path).map_err(|e| dev_err(&path, e))?;
    }
    tracing::debug!(dev = %dev_dir.display(), "default devices populated");
    Ok(())
}
