//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! Unlike `chroot`, `pivot_root` replaces the root mount of the namespace,
//! so the old root can be detached entirely.

use std::path::Path;

use nix::mount::{MntFlags, MsFlags, mount, umount2};

use runcell_common::error::IsolationError;

fn pivot_err(what: &str, message: impl std::fmt::Display) -> IsolationError {
    IsolationError::PivotRoot {
        message: format!("{what}: {message}"),
    }
}

/// Makes `new_root` the root of the calling process's mount namespace.
///
/// Uses `pivot_root(".", ".")` from inside the new root, which stacks the
/// old root on top of it without a `put_old` directory. The old root is
/// then made a slave, so unmounting it cannot propagate to the host, and
/// lazily detached.
///
/// # Errors
///
/// Returns [`IsolationError::PivotRoot`] if any step fails. `new_root`
/// must already be a mount point.
pub fn pivot_root(new_root: &Path) -> Result<(), IsolationError> {
    std::env::set_current_dir(new_root).map_err(|e| pivot_err("chdir new root", e))?;
    nix::unistd::pivot_root(".", ".").map_err(|e| pivot_err("pivot_root", e.desc()))?;
    mount(
        None::<&str>,
        ".",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| pivot_err("old root propagation", e.desc()))?;
    umount2(".", MntFlags::MNT_DETACH).map_err(|e| pivot_err("detach old root", e.desc()))?;
    std::env::set_current_dir("/").map_err(|e| pivot_err("chdir /", e))?;
    tracing::info!(new_root = %new_root.display(), "pivot_root complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_new_root_is_reported() {
        let err = pivot_root(Path::new("/nonexistent/runcell/rootfs")).unwrap_err();
        assert!(err.to_string().contains("chdir new root"));
    }
}
