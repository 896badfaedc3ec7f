//! User namespace id mapping.
//!
//! The maps of a new user namespace must be written from outside it, by a
//! process holding the right privileges over the target. The launcher's
//! monitor does this for the intermediate child.

use std::fmt::Write as _;
use std::path::PathBuf;

use nix::unistd::{Gid, Uid, setresgid, setresuid};

use runcell_common::error::IsolationError;
use runcell_spec::container::IdMapping;

/// Renders mappings in the `/proc/<pid>/uid_map` line format.
#[must_use]
pub fn format_mappings(mappings: &[IdMapping]) -> String {
    mappings.iter().fold(String::new(), |mut out, m| {
        let _ = writeln!(out, "{} {} {}", m.container_id, m.host_id, m.size);
        out
    })
}

/// Writes uid and gid maps for the user namespace of `pid`.
///
/// An unprivileged writer must deny `setgroups` before the gid map is
/// accepted; pass `deny_setgroups` in that case.
///
/// # Errors
///
/// Returns [`IsolationError::IdMapping`] naming the file that failed.
pub fn write_id_mappings(
    pid: i32,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
    deny_setgroups: bool,
) -> Result<(), IsolationError> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    let write = |name: &str, contents: &str| {
        let path = proc_dir.join(name);
        std::fs::write(&path, contents).map_err(|source| IsolationError::IdMapping { path, source })
    };

    if !uid_mappings.is_empty() {
        write("uid_map", &format_mappings(uid_mappings))?;
    }
    if deny_setgroups && proc_dir.join("setgroups").exists() {
        write("setgroups", "deny")?;
    }
    if !gid_mappings.is_empty() {
        write("gid_map", &format_mappings(gid_mappings))?;
    }
    tracing::debug!(
        pid,
        uid_maps = uid_mappings.len(),
        gid_maps = gid_mappings.len(),
        "wrote id mappings"
    );
    Ok(())
}

/// Switches the calling process to uid and gid 0 of its user namespace.
///
/// # Errors
///
/// Returns [`IsolationError::Setup`] if either call fails, which happens
/// when root is not mapped.
pub fn become_root() -> Result<(), IsolationError> {
    let root_gid = Gid::from_raw(0);
    let root_uid = Uid::from_raw(0);
    setresgid(root_gid, root_gid, root_gid).map_err(|e| IsolationError::Setup {
        step: "setresgid",
        message: e.desc().to_string(),
    })?;
    setresuid(root_uid, root_uid, root_uid).map_err(|e| IsolationError::Setup {
        step: "setresuid",
        message: e.desc().to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mappings_render_one_per_line() {
        let maps = [
            IdMapping {
                container_id: 0,
                host_id: 1000,
                size: 1,
            },
            IdMapping {
                container_id: 1,
                host_id: 100_000,
                size: 65536,
            },
        ];
        assert_eq!(format_mappings(&maps), "0 1000 1\n1 100000 65536\n");
        assert_eq!(format_mappings(&[]), "");
    }

    #[test]
    fn missing_process_reports_map_path() {
        let maps = [IdMapping {
            container_id: 0,
            host_id: 0,
            size: 1,
        }];
        let err = write_id_mappings(i32::MAX, &maps, &maps, true).unwrap_err();
        assert!(
            matches!(&err, IsolationError::IdMapping { path, .. } if path.ends_with("uid_map")),
            "{err}"
        );
    }
}
