//! Container mount table setup.
//!
//! Runs inside the container's mount namespace. [`prepare_rootfs`] works
//! on host paths before `pivot_root`; [`finish_rootfs`] works on container
//! paths after it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use nix::mount::{MsFlags, mount};
use nix::sys::statvfs::{FsFlags, statvfs};

use runcell_common::error::IsolationError;
use runcell_spec::ContainerSpec;
use runcell_spec::container::MountSpec;

use super::devices;
use crate::namespace::mount::{propagation_flags, set_root_propagation};

/// Parsed `mount(8)` style options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Flags passed to `mount(2)`.
    pub flags: MsFlags,
    /// Propagation changes applied after the mount.
    pub propagation: Vec<MsFlags>,
    /// Filesystem-specific data (`size=64m`, `mode=755`, ...).
    pub data: Vec<String>,
}

impl MountOptions {
    /// Parses option strings. Unknown options become filesystem data.
    #[must_use]
    pub fn parse(options: &[String]) -> Self {
        let mut flags = MsFlags::empty();
        let mut propagation = Vec::new();
        let mut data = Vec::new();
        for opt in options {
            let (set, clear) = match opt.as_str() {
                "defaults" => (MsFlags::empty(), MsFlags::empty()),
                "ro" => (MsFlags::MS_RDONLY, MsFlags::empty()),
                "rw" => (MsFlags::empty(), MsFlags::MS_RDONLY),
                "nosuid" => (MsFlags::MS_NOSUID, MsFlags::empty()),
                "suid" => (MsFlags::empty(), MsFlags::MS_NOSUID),
                "nodev" => (MsFlags::MS_NODEV, MsFlags::empty()),
                "dev" => (MsFlags::empty(), MsFlags::MS_NODEV),
                "noexec" => (MsFlags::MS_NOEXEC, MsFlags::empty()),
                "exec" => (MsFlags::empty(), MsFlags::MS_NOEXEC),
                "sync" => (MsFlags::MS_SYNCHRONOUS, MsFlags::empty()),
                "async" => (MsFlags::empty(), MsFlags::MS_SYNCHRONOUS),
                "dirsync" => (MsFlags::MS_DIRSYNC, MsFlags::empty()),
                "remount" => (MsFlags::MS_REMOUNT, MsFlags::empty()),
                "mand" => (MsFlags::MS_MANDLOCK, MsFlags::empty()),
                "nomand" => (MsFlags::empty(), MsFlags::MS_MANDLOCK),
                "noatime" => (MsFlags::MS_NOATIME, MsFlags::empty()),
                "atime" => (MsFlags::empty(), MsFlags::MS_NOATIME),
                "nodiratime" => (MsFlags::MS_NODIRATIME, MsFlags::empty()),
                "diratime" => (MsFlags::empty(), MsFlags::MS_NODIRATIME),
                "relatime" => (MsFlags::MS_RELATIME, MsFlags::empty()),
                "norelatime" => (MsFlags::empty(), MsFlags::MS_RELATIME),
                "strictatime" => (MsFlags::MS_STRICTATIME, MsFlags::empty()),
                "nostrictatime" => (MsFlags::empty(), MsFlags::MS_STRICTATIME),
                "bind" => (MsFlags::MS_BIND, MsFlags::empty()),
                "rbind" => (MsFlags::MS_BIND | MsFlags::MS_REC, MsFlags::empty()),
                other => {
                    if let Ok(p) = propagation_flags(other) {
                        propagation.push(p);
                    } else {
                        data.push(other.to_string());
                    }
                    continue;
                }
            };
            flags.insert(set);
            flags.remove(clear);
        }
        Self {
            flags,
            propagation,
            data,
        }
    }

    fn data_string(&self) -> Option<String> {
        (!self.data.is_empty()).then(|| self.data.join(","))
    }
}

/// Joins a container path onto `root`, refusing `..` components.
///
/// # Errors
///
/// Returns [`IsolationError::Mount`] if the path climbs out of `root`.
pub fn secure_join(root: &Path, path: &Path) -> Result<PathBuf, IsolationError> {
    let mut out = root.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(IsolationError::Mount {
                    target: path.to_path_buf(),
                    message: "path escapes the root filesystem".into(),
                });
            }
        }
    }
    Ok(out)
}

fn mount_err(target: &Path, what: &str, err: nix::Error) -> IsolationError {
    IsolationError::Mount {
        target: target.to_path_buf(),
        message: format!("{what}: {}", err.desc()),
    }
}

fn io_err(target: &Path, err: &std::io::Error) -> IsolationError {
    IsolationError::Mount {
        target: target.to_path_buf(),
        message: err.to_string(),
    }
}

/// Creates the mount point: a file when `source` is a file, else a directory.
fn ensure_mount_point(target: &Path, source: Option<&Path>) -> Result<(), IsolationError> {
    if target.exists() {
        return Ok(());
    }
    let source_is_file = source
        .and_then(|s| fs::metadata(s).ok())
        .is_some_and(|m| !m.is_dir());
    if source_is_file {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(target, &e))?;
        }
        let _ = fs::File::create(target).map_err(|e| io_err(target, &e))?;
    } else {
        fs::create_dir_all(target).map_err(|e| io_err(target, &e))?;
    }
    Ok(())
}

/// Mounts one spec entry below `rootfs`.
///
/// # Errors
///
/// Returns [`IsolationError::Mount`] if the mount point cannot be created
/// or any `mount(2)` call fails.
pub fn mount_entry(rootfs: &Path, entry: &MountSpec) -> Result<(), IsolationError> {
    let target = secure_join(rootfs, &entry.destination)?;
    let opts = MountOptions::parse(&entry.options);

    if entry.is_bind() {
        let source = entry.source.as_deref().ok_or_else(|| IsolationError::Mount {
            target: entry.destination.clone(),
            message: "bind mount without a source".into(),
        })?;
        ensure_mount_point(&target, Some(source))?;
        let bind_flags = MsFlags::MS_BIND | (opts.flags & MsFlags::MS_REC);
        mount(Some(source), &target, None::<&str>, bind_flags, None::<&str>)
            .map_err(|e| mount_err(&target, "bind", e))?;
        let extra = opts.flags - (MsFlags::MS_BIND | MsFlags::MS_REC);
        if !extra.is_empty() {
            let flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | extra | locked_flags(&target);
            mount(None::<&str>, &target, None::<&str>, flags, None::<&str>)
                .map_err(|e| mount_err(&target, "bind remount", e))?;
        }
    } else {
        let kind = entry.kind.as_deref().ok_or_else(|| IsolationError::Mount {
            target: entry.destination.clone(),
            message: "mount has neither a type nor a bind option".into(),
        })?;
        ensure_mount_point(&target, None)?;
        let source = entry
            .source
            .as_deref()
            .map_or_else(|| PathBuf::from(kind), Path::to_path_buf);
        let data = opts.data_string();
        mount(
            Some(source.as_path()),
            &target,
            Some(kind),
            opts.flags,
            data.as_deref(),
        )
        .map_err(|e| mount_err(&target, kind, e))?;
    }

    for propagation in &opts.propagation {
        mount(None::<&str>, &target, None::<&str>, *propagation, None::<&str>)
            .map_err(|e| mount_err(&target, "propagation", e))?;
    }
    tracing::debug!(destination = %entry.destination.display(), kind = ?entry.kind, "mounted");
    Ok(())
}

/// Flags the kernel refuses to clear on remount inside a user namespace.
fn locked_flags(path: &Path) -> MsFlags {
    let Ok(stat) = statvfs(path) else {
        return MsFlags::empty();
    };
    let fs = stat.flags();
    let mut flags = MsFlags::empty();
    for (st, ms) in [
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if fs.contains(st) {
            flags.insert(ms);
        }
    }
    flags
}

/// Prepares the root filesystem from the host side of `pivot_root`.
///
/// Sets root propagation, bind-mounts the rootfs onto itself so it is a
/// mount point, applies every spec mount in order, and populates `/dev`
/// when the bundle mounts a fresh one.
///
/// # Errors
///
/// Returns [`IsolationError::Mount`] for the first failing step.
pub fn prepare_rootfs(spec: &ContainerSpec) -> Result<(), IsolationError> {
    set_root_propagation(spec.rootfs_propagation.as_deref())?;
    let rootfs = spec.rootfs.as_path();
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err(rootfs, "rootfs bind", e))?;

    for entry in &spec.mounts {
        mount_entry(rootfs, entry)?;
    }
    let fresh_dev = spec
        .mounts
        .iter()
        .any(|m| m.destination == Path::new("/dev") && !m.is_bind());
    if fresh_dev {
        devices::populate(&rootfs.join("dev"))?;
    }
    Ok(())
}

/// Hides a path: `/dev/null` over files, a read-only tmpfs over directories.
///
/// Missing paths are skipped.
///
/// # Errors
///
/// Returns [`IsolationError::Mount`] if the covering mount fails.
pub fn mask_path(path: &Path) -> Result<(), IsolationError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(path, &e)),
    };
    let covered = if meta.is_dir() {
        mount(
            Some("tmpfs"),
            path,
            Some("tmpfs"),
            MsFlags::MS_RDONLY,
            None::<&str>,
        )
    } else {
        mount(
            Some("/dev/null"),
            path,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
    };
    covered.map_err(|e| mount_err(path, "mask", e))
}

/// Makes a path read-only by bind-mounting it onto itself.
///
/// Missing paths are skipped.
///
/// # Errors
///
/// Returns [`IsolationError::Mount`] if either mount call fails.
pub fn readonly_path(path: &Path) -> Result<(), IsolationError> {
    if !path.exists() {
        return Ok(());
    }
    mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err(path, "readonly bind", e))?;
    let flags = MsFlags::MS_BIND
        | MsFlags::MS_REMOUNT
        | MsFlags::MS_RDONLY
        | MsFlags::MS_REC
        | locked_flags(path);
    mount(None::<&str>, path, None::<&str>, flags, None::<&str>)
        .map_err(|e| mount_err(path, "readonly remount", e))
}

/// Completes the mount table after `pivot_root`: masked paths, read-only
/// paths, then the read-only root when requested.
///
/// # Errors
///
/// Returns [`IsolationError::Mount`] for the first failing step.
pub fn finish_rootfs(spec: &ContainerSpec) -> Result<(), IsolationError> {
    for path in &spec.masked_paths {
        mask_path(path)?;
    }
    for path in &spec.readonly_paths {
        readonly_path(path)?;
    }
    if spec.rootfs_readonly {
        let root = Path::new("/");
        let flags =
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | locked_flags(root);
        mount(None::<&str>, root, None::<&str>, flags, None::<&str>)
            .map_err(|e| mount_err(root, "readonly root", e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(list: &[&str]) -> MountOptions {
        let owned: Vec<String> = list.iter().map(|s| (*s).to_string()).collect();
        MountOptions::parse(&owned)
    }

    #[test]
    fn flags_and_data_are_split() {
        let o = opts(&["nosuid", "noexec", "mode=755", "size=65536k"]);
        assert!(o.flags.contains(MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC));
        assert_eq!(o.data_string().as_deref(), Some("mode=755,size=65536k"));
        assert!(o.propagation.is_empty());
    }

    #[test]
    fn later_options_override_earlier_ones() {
        let o = opts(&["ro", "rw"]);
        assert!(!o.flags.contains(MsFlags::MS_RDONLY));
        let o = opts(&["rw", "ro"]);
        assert!(o.flags.contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn rbind_and_propagation_are_recognised() {
        let o = opts(&["rbind", "rslave"]);
        assert!(o.flags.contains(MsFlags::MS_BIND | MsFlags::MS_REC));
        assert_eq!(o.propagation, vec![MsFlags::MS_SLAVE | MsFlags::MS_REC]);
        assert_eq!(o.data_string(), None);
    }

    #[test]
    fn secure_join_stays_under_root() {
        let root = Path::new("/run/rootfs");
        assert_eq!(
            secure_join(root, Path::new("/proc/sys")).unwrap(),
            PathBuf::from("/run/rootfs/proc/sys")
        );
        assert_eq!(
            secure_join(root, Path::new("/./dev")).unwrap(),
            PathBuf::from("/run/rootfs/dev")
        );
        assert!(secure_join(root, Path::new("/../etc")).is_err());
    }

    #[test]
    fn mount_point_matches_source_kind() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("src.conf");
        fs::write(&file, "x").unwrap();
        let file_target = dir.path().join("root/etc/app.conf");
        ensure_mount_point(&file_target, Some(&file)).unwrap();
        assert!(file_target.is_file());
        let dir_target = dir.path().join("root/data");
        ensure_mount_point(&dir_target, Some(dir.path())).unwrap();
        assert!(dir_target.is_dir());
    }

    #[test]
    fn masking_a_missing_path_is_a_no_op() {
        assert!(mask_path(Path::new("/nonexistent/runcell/masked")).is_ok());
        assert!(readonly_path(Path::new("/nonexistent/runcell/ro")).is_ok());
    }
}
