//! Cgroup resource management for v1 and v2 hierarchies.
//!
//! The [`CgroupManager`] owns the placement policy (root, default parent,
//! teardown backoff). Each container gets a [`CgroupHandle`] describing
//! where its cgroup lives, which the runtime persists by relative path
//! and reopens on later commands.

pub mod cpu;
pub mod io;
pub mod memory;
pub mod v1;
pub mod v2;

use std::path::{Component, Path, PathBuf};

use runcell_common::config::{RetryPolicy, RuntimeConfig};
use runcell_common::error::CgroupError;
use runcell_common::types::ResourceLimits;

/// Layout of the mounted cgroup filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierarchyMode {
    /// Single unified hierarchy (cgroup v2).
    Unified,
    /// One hierarchy per controller (cgroup v1).
    Legacy,
}

/// Works out which hierarchy is mounted at `root`.
///
/// # Errors
///
/// Returns [`CgroupError::Unavailable`] when neither layout is found.
pub fn detect(root: &Path) -> Result<HierarchyMode, CgroupError> {
    if root.join("cgroup.controllers").is_file() {
        Ok(HierarchyMode::Unified)
    } else if v1::CONTROLLERS.iter().any(|c| root.join(c).is_dir()) {
        Ok(HierarchyMode::Legacy)
    } else {
        Err(CgroupError::Unavailable {
            root: root.to_path_buf(),
        })
    }
}

/// Rejects limit combinations the kernel would refuse or silently clamp.
///
/// # Errors
///
/// Returns [`CgroupError::ConflictingLimits`] describing the first conflict.
pub fn validate_limits(limits: &ResourceLimits) -> Result<(), CgroupError> {
    let conflict = |message: String| Err(CgroupError::ConflictingLimits { message });
    let limit = limits.memory_limit.filter(|l| *l > 0);

    if let (Some(reservation), Some(limit)) = (limits.memory_reservation, limit)
        && reservation > limit
    {
        return conflict(format!(
            "memory reservation {reservation} exceeds memory limit {limit}"
        ));
    }
    if let Some(swap) = limits.memory_swap.filter(|s| *s >= 0) {
        match limit {
            None => return conflict("memory+swap limit set without a memory limit".into()),
            Some(limit) if swap < limit => {
                return conflict(format!(
                    "memory+swap limit {swap} is below memory limit {limit}"
                ));
            }
            Some(_) => {}
        }
    }
    if limits.cpu_quota.is_some_and(|q| q > 0) && limits.cpu_period == Some(0) {
        return conflict("cpu quota set with a zero period".into());
    }
    if limits.pids_limit == Some(0) {
        return conflict("pids limit of 0 would forbid the init process".into());
    }
    if let Some(weight) = limits.io_weight
        && !(10..=1000).contains(&weight)
    {
        return conflict(format!("block io weight {weight} outside 10..=1000"));
    }
    Ok(())
}

/// Controllers (v2 names) needed to express `limits`.
#[must_use]
pub fn required_controllers(limits: &ResourceLimits) -> Vec<&'static str> {
    let mut needed = Vec::new();
    if limits.cpu_shares.is_some() || limits.cpu_quota.is_some() || limits.cpu_period.is_some() {
        needed.push("cpu");
    }
    if limits.cpuset_cpus.is_some() || limits.cpuset_mems.is_some() {
        needed.push("cpuset");
    }
    if limits.memory_limit.is_some()
        || limits.memory_reservation.is_some()
        || limits.memory_swap.is_some()
    {
        needed.push("memory");
    }
    if limits.pids_limit.is_some() {
        needed.push("pids");
    }
    if limits.io_weight.is_some() {
        needed.push("io");
    }
    needed
}

/// Location of one container's cgroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHandle {
    mode: HierarchyMode,
    root: PathBuf,
    relative: PathBuf,
    controllers: Vec<&'static str>,
}

impl CgroupHandle {
    /// Hierarchy the cgroup lives in.
    #[must_use]
    pub const fn mode(&self) -> HierarchyMode {
        self.mode
    }

    /// Path relative to the cgroup root, as persisted in state.
    #[must_use]
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// Directory of the cgroup, or of its first controller under v1.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        match self.mode {
            HierarchyMode::Unified => self.root.join(&self.relative),
            HierarchyMode::Legacy => self.dir(self.controllers.first().copied().unwrap_or("cpu")),
        }
    }

    /// Directory holding `controller`'s files.
    #[must_use]
    pub fn dir(&self, controller: &str) -> PathBuf {
        match self.mode {
            HierarchyMode::Unified => self.root.join(&self.relative),
            HierarchyMode::Legacy => self
                .root
                .join(v1::controller_dir(controller))
                .join(&self.relative),
        }
    }

    /// Every directory making up this cgroup.
    #[must_use]
    pub fn dirs(&self) -> Vec<PathBuf> {
        match self.mode {
            HierarchyMode::Unified => vec![self.path()],
            HierarchyMode::Legacy => self.controllers.iter().map(|c| self.dir(c)).collect(),
        }
    }

    /// Moves `pid` into the cgroup.
    ///
    /// # Errors
    ///
    /// Returns [`CgroupError::Io`] if a `cgroup.procs` write fails.
    pub fn add_process(&self, pid: i32) -> Result<(), CgroupError> {
        for dir in self.dirs() {
            write_file(&dir, "cgroup.procs", &pid.to_string())?;
        }
        tracing::debug!(pid, cgroup = %self.relative.display(), "process attached to cgroup");
        Ok(())
    }

    /// Pids currently in the cgroup, sorted and deduplicated.
    ///
    /// # Errors
    ///
    /// Returns [`CgroupError::Io`] if `cgroup.procs` exists but cannot be
    /// read.
    pub fn procs(&self) -> Result<Vec<i32>, CgroupError> {
        let mut pids = Vec::new();
        for dir in self.dirs() {
            if let Some(contents) = read_file(&dir, "cgroup.procs")? {
                pids.extend(contents.lines().filter_map(|l| l.trim().parse::<i32>().ok()));
            }
        }
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    fn apply(&self, limits: &ResourceLimits) -> Result<(), CgroupError> {
        match self.mode {
            HierarchyMode::Unified => v2::apply(&self.path(), limits),
            HierarchyMode::Legacy => v1::apply(self, limits),
        }
    }
}

/// Creates, inspects and removes container cgroups.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    root: PathBuf,
    parent: String,
    teardown: RetryPolicy,
}

impl CgroupManager {
    /// Creates a manager for the hierarchy mounted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, parent: impl Into<String>, teardown: RetryPolicy) -> Self {
        Self {
            root: root.into(),
            parent: parent.into(),
            teardown,
        }
    }

    /// Creates a manager from runtime configuration.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.cgroup_root.clone(),
            config.cgroup_parent.clone(),
            config.teardown_retry,
        )
    }

    /// Mount point of the hierarchy.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cgroup path, relative to the root, for a container.
    ///
    /// No `cgroupsPath` places the container at `<parent>/<id>`. An
    /// absolute path is taken from the root; a relative one goes under
    /// the parent.
    ///
    /// # Errors
    ///
    /// Returns [`CgroupError::InvalidPath`] for paths containing `..` or
    /// resolving to the root itself.
    pub fn resolve_path(&self, id: &str, cgroups_path: Option<&Path>) -> Result<PathBuf, CgroupError> {
        let parent = Path::new(&self.parent);
        let joined = match cgroups_path {
            None => parent.join(id),
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => parent.join(path),
        };
        let invalid = || CgroupError::InvalidPath {
            path: joined.display().to_string(),
        };
        let mut relative = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => return Err(invalid()),
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(invalid());
        }
        Ok(relative)
    }

    /// Handle for a cgroup at `relative` without touching it.
    ///
    /// # Errors
    ///
    /// Returns [`CgroupError::Unavailable`] if no hierarchy is mounted.
    pub fn open(&self, relative: &Path) -> Result<CgroupHandle, CgroupError> {
        let mode = detect(&self.root)?;
        let controllers = match mode {
            HierarchyMode::Unified => Vec::new(),
            HierarchyMode::Legacy => v1::CONTROLLERS
                .iter()
                .copied()
                .filter(|c| self.root.join(c).is_dir())
                .collect(),
        };
        Ok(CgroupHandle {
            mode,
            root: self.root.clone(),
            relative: relative.to_path_buf(),
            controllers,
        })
    }

    /// Creates the container's cgroup and writes its limits.
    ///
    /// Calling it again for the same container rewrites the limits.
    ///
    /// # Errors
    ///
    /// Returns [`CgroupError::ConflictingLimits`] or
    /// [`CgroupError::InvalidPath`] before touching the filesystem,
    /// [`CgroupError::Unavailable`] or [`CgroupError::ControllerUnavailable`]
    /// when the host cannot express the limits, and [`CgroupError::Io`]
    /// when a control file write fails.
    pub fn create(
        &self,
        id: &str,
        cgroups_path: Option<&Path>,
        limits: &ResourceLimits,
    ) -> Result<CgroupHandle, CgroupError> {
        validate_limits(limits)?;
        let relative = self.resolve_path(id, cgroups_path)?;
        let handle = self.open(&relative)?;
        let needed = required_controllers(limits);

        match handle.mode {
            HierarchyMode::Unified => {
                let available = v2::available_controllers(&self.root)?;
                if let Some(missing) = needed.iter().find(|c| !available.contains(**c)) {
                    return Err(CgroupError::ControllerUnavailable {
                        controller: (*missing).to_string(),
                    });
                }
                create_dir(&handle.path())?;
                v2::enable_controllers(&self.root, &relative, &needed);
            }
            HierarchyMode::Legacy => {
                if let Some(missing) = needed
                    .iter()
                    .find(|c| !handle.controllers.iter().any(|have| *have == v1::controller_dir(c)))
                {
                    return Err(CgroupError::ControllerUnavailable {
                        controller: (*missing).to_string(),
                    });
                }
                for dir in handle.dirs() {
                    create_dir(&dir)?;
                }
                if handle.controllers.contains(&"cpuset") {
                    v1::inherit_cpuset(&self.root.join("cpuset"), &relative)?;
                }
            }
        }

        handle.apply(limits)?;
        tracing::info!(
            cgroup = %relative.display(),
            mode = ?handle.mode,
            "cgroup created"
        );
        Ok(handle)
    }

    /// Limits currently in effect for `handle`.
    ///
    /// Unlimited values read back as `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CgroupError::Io`] if a control file cannot be read.
    pub fn query(&self, handle: &CgroupHandle) -> Result<ResourceLimits, CgroupError> {
        match handle.mode {
            HierarchyMode::Unified => v2::query(&handle.path()),
            HierarchyMode::Legacy => v1::query(handle),
        }
    }

    /// Removes the cgroup once its processes are gone.
    ///
    /// A cgroup that no longer exists is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CgroupError::Busy`] if processes remain after every
    /// attempt, or [`CgroupError::Io`] if removal fails.
    pub fn destroy(&self, handle: &CgroupHandle) -> Result<(), CgroupError> {
        let attempts = self.teardown.attempts.max(1);
        for attempt in 0..attempts {
            if handle.procs()?.is_empty() {
                break;
            }
            if attempt + 1 == attempts {
                return Err(CgroupError::Busy {
                    path: handle.path(),
                    attempts,
                });
            }
            std::thread::sleep(self.teardown.delay_after(attempt));
        }

        for dir in handle.dirs() {
            self.remove(&dir)?;
        }
        tracing::info!(cgroup = %handle.relative.display(), "cgroup destroyed");
        Ok(())
    }

    fn remove(&self, dir: &Path) -> Result<(), CgroupError> {
        if !dir.exists() {
            return Ok(());
        }
        if !is_cgroupfs(dir) {
            return std::fs::remove_dir_all(dir).map_err(|source| CgroupError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
        let attempts = self.teardown.attempts.max(1);
        for attempt in 0..attempts {
            match remove_cgroup_tree(dir) {
                Ok(()) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt + 1 < attempts => {
                    std::thread::sleep(self.teardown.delay_after(attempt));
                }
                Err(e) if e.kind() == std::io::ErrorKind::ResourceBusy => {
                    return Err(CgroupError::Busy {
                        path: dir.to_path_buf(),
                        attempts,
                    });
                }
                Err(source) => {
                    return Err(CgroupError::Io {
                        path: dir.to_path_buf(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

fn is_cgroupfs(path: &Path) -> bool {
    use nix::sys::statfs::{CGROUP_SUPER_MAGIC, CGROUP2_SUPER_MAGIC, statfs};
    statfs(path).is_ok_and(|fs| {
        let kind = fs.filesystem_type();
        kind == CGROUP2_SUPER_MAGIC || kind == CGROUP_SUPER_MAGIC
    })
}

/// Control files on cgroupfs cannot be unlinked; only directories are
/// removed, children first.
fn remove_cgroup_tree(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_cgroup_tree(&entry.path())?;
        }
    }
    std::fs::remove_dir(dir)
}

fn create_dir(dir: &Path) -> Result<(), CgroupError> {
    std::fs::create_dir_all(dir).map_err(|source| CgroupError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

pub(crate) fn write_file(dir: &Path, name: &str, value: &str) -> Result<(), CgroupError> {
    let path = dir.join(name);
    std::fs::write(&path, value).map_err(|source| CgroupError::Io { path, source })
}

pub(crate) fn read_file(dir: &Path, name: &str) -> Result<Option<String>, CgroupError> {
    let path = dir.join(name);
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(Some(contents.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CgroupError::Io { path, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unified_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cgroup.controllers"),
            "cpuset cpu io memory pids\n",
        )
        .unwrap();
        dir
    }

    fn legacy_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for controller in v1::CONTROLLERS {
            std::fs::create_dir(dir.path().join(controller)).unwrap();
        }
        std::fs::write(dir.path().join("cpuset/cpuset.cpus"), "0-3").unwrap();
        std::fs::write(dir.path().join("cpuset/cpuset.mems"), "0").unwrap();
        dir
    }

    fn manager(root: &Path) -> CgroupManager {
        CgroupManager::new(root, "runcell", RetryPolicy::once())
    }

    fn half_cpu_100m() -> ResourceLimits {
        ResourceLimits {
            cpu_quota: Some(50_000),
            cpu_period: Some(100_000),
            memory_limit: Some(104_857_600),
            ..ResourceLimits::default()
        }
    }

    #[test]
    fn detects_hierarchy_layout() {
        let unified = unified_root();
        let legacy = legacy_root();
        let empty = tempfile::tempdir().unwrap();
        assert_eq!(detect(unified.path()).unwrap(), HierarchyMode::Unified);
        assert_eq!(detect(legacy.path()).unwrap(), HierarchyMode::Legacy);
        assert!(matches!(
            detect(empty.path()),
            Err(CgroupError::Unavailable { .. })
        ));
    }

    #[test]
    fn paths_resolve_under_parent_or_root() {
        let root = unified_root();
        let mgr = manager(root.path());
        assert_eq!(mgr.resolve_path("web", None).unwrap(), PathBuf::from("runcell/web"));
        assert_eq!(
            mgr.resolve_path("web", Some(Path::new("/custom/web"))).unwrap(),
            PathBuf::from("custom/web")
        );
        assert_eq!(
            mgr.resolve_path("web", Some(Path::new("nested/web"))).unwrap(),
            PathBuf::from("runcell/nested/web")
        );
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let root = unified_root();
        let mgr = manager(root.path());
        for path in ["/../etc", "../../x", "/"] {
            assert!(
                matches!(
                    mgr.resolve_path("web", Some(Path::new(path))),
                    Err(CgroupError::InvalidPath { .. })
                ),
                "{path}"
            );
        }
    }

    #[test]
    fn unified_create_writes_and_queries_limits() {
        let root = unified_root();
        let mgr = manager(root.path());
        let handle = mgr.create("web", None, &half_cpu_100m()).unwrap();

        let dir = root.path().join("runcell/web");
        assert_eq!(handle.path(), dir);
        assert_eq!(std::fs::read_to_string(dir.join("cpu.max")).unwrap(), "50000 100000");
        assert_eq!(std::fs::read_to_string(dir.join("memory.max")).unwrap(), "104857600");

        let read = mgr.query(&handle).unwrap();
        assert_eq!(read.cpu_quota, Some(50_000));
        assert_eq!(read.cpu_period, Some(100_000));
        assert_eq!(read.memory_limit, Some(104_857_600));
        assert_eq!(read.pids_limit, None);
    }

    #[test]
    fn unified_create_enables_controllers_in_ancestors() {
        let root = unified_root();
        let mgr = manager(root.path());
        let limits = ResourceLimits {
            pids_limit: Some(64),
            ..ResourceLimits::default()
        };
        let _ = mgr.create("web", None, &limits).unwrap();
        assert_eq!(
            std::fs::read_to_string(root.path().join("runcell/cgroup.subtree_control")).unwrap(),
            "+pids"
        );
        assert!(!root.path().join("runcell/web/cgroup.subtree_control").exists());
    }

    #[test]
    fn unlimited_values_read_back_as_none() {
        let root = unified_root();
        let mgr = manager(root.path());
        let limits = ResourceLimits {
            memory_limit: Some(-1),
            pids_limit: Some(-1),
            cpu_quota: Some(-1),
            ..ResourceLimits::default()
        };
        let handle = mgr.create("free", None, &limits).unwrap();
        assert_eq!(
            std::fs::read_to_string(handle.path().join("memory.max")).unwrap(),
            "max"
        );
        let read = mgr.query(&handle).unwrap();
        assert_eq!(read.memory_limit, None);
        assert_eq!(read.pids_limit, None);
        assert_eq!(read.cpu_quota, None);
    }

    #[test]
    fn create_is_idempotent() {
        let root = unified_root();
        let mgr = manager(root.path());
        let first = mgr.create("web", None, &half_cpu_100m()).unwrap();
        let second = mgr.create("web", None, &half_cpu_100m()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_controller_is_reported() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("cgroup.controllers"), "cpu memory").unwrap();
        let limits = ResourceLimits {
            pids_limit: Some(10),
            ..ResourceLimits::default()
        };
        let err = manager(root.path()).create("web", None, &limits).unwrap_err();
        assert!(
            matches!(&err, CgroupError::ControllerUnavailable { controller } if controller == "pids"),
            "{err}"
        );
        assert!(!root.path().join("runcell/web").exists());
    }

    #[test]
    fn conflicting_limits_are_rejected() {
        let cases = [
            ResourceLimits {
                memory_limit: Some(100),
                memory_reservation: Some(200),
                ..ResourceLimits::default()
            },
            ResourceLimits {
                memory_limit: Some(200),
                memory_swap: Some(100),
                ..ResourceLimits::default()
            },
            ResourceLimits {
                memory_swap: Some(100),
                ..ResourceLimits::default()
            },
            ResourceLimits {
                cpu_quota: Some(1000),
                cpu_period: Some(0),
                ..ResourceLimits::default()
            },
            ResourceLimits {
                pids_limit: Some(0),
                ..ResourceLimits::default()
            },
            ResourceLimits {
                io_weight: Some(5),
                ..ResourceLimits::default()
            },
        ];
        for limits in &cases {
            assert!(
                matches!(
                    validate_limits(limits),
                    Err(CgroupError::ConflictingLimits { .. })
                ),
                "{limits:?}"
            );
        }
        assert!(validate_limits(&half_cpu_100m()).is_ok());
    }

    #[test]
    fn legacy_create_spreads_limits_over_controllers() {
        let root = legacy_root();
        let mgr = manager(root.path());
        let limits = ResourceLimits {
            cpu_shares: Some(512),
            pids_limit: Some(32),
            io_weight: Some(300),
            ..half_cpu_100m()
        };
        let handle = mgr.create("db", None, &limits).unwrap();
        assert_eq!(handle.mode(), HierarchyMode::Legacy);
        let read = |path: &str| std::fs::read_to_string(root.path().join(path)).unwrap();
        assert_eq!(read("cpu/runcell/db/cpu.cfs_quota_us"), "50000");
        assert_eq!(read("cpu/runcell/db/cpu.cfs_period_us"), "100000");
        assert_eq!(read("memory/runcell/db/memory.limit_in_bytes"), "104857600");
        assert_eq!(read("pids/runcell/db/pids.max"), "32");
        assert_eq!(read("blkio/runcell/db/blkio.weight"), "300");
        assert_eq!(read("cpuset/runcell/cpuset.cpus"), "0-3");
        assert_eq!(read("cpuset/runcell/db/cpuset.mems"), "0");

        let queried = mgr.query(&handle).unwrap();
        assert_eq!(queried.cpu_shares, Some(512));
        assert_eq!(queried.io_weight, Some(300));
        assert_eq!(queried.memory_limit, Some(104_857_600));
    }

    #[test]
    fn processes_are_tracked_and_block_teardown() {
        let root = unified_root();
        let mgr = manager(root.path());
        let handle = mgr.create("web", None, &ResourceLimits::default()).unwrap();
        handle.add_process(4242).unwrap();
        assert_eq!(handle.procs().unwrap(), vec![4242]);
        assert!(matches!(
            mgr.destroy(&handle),
            Err(CgroupError::Busy { attempts: 1, .. })
        ));

        std::fs::write(handle.path().join("cgroup.procs"), "").unwrap();
        mgr.destroy(&handle).unwrap();
        assert!(!handle.path().exists());
        mgr.destroy(&handle).unwrap();
    }
}
