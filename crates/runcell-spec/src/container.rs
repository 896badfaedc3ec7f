//! The validated container specification.
//!
//! A [`ContainerSpec`] is built once by [`crate::bundle::load`] and never
//! mutated. Paths are absolute, relative bind sources are resolved against
//! the bundle, and resource limits are flattened into
//! [`ResourceLimits`]. Hooks stay in their [`oci_spec`] form.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use runcell_common::constants::DEFAULT_PATH;
use runcell_common::types::ResourceLimits;

use crate::config::{Hooks, LinuxNamespaceType};

/// Immutable description of one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// `ociVersion` declared by the bundle.
    pub oci_version: String,
    /// Absolute bundle directory.
    pub bundle: PathBuf,
    /// Absolute root filesystem directory.
    pub rootfs: PathBuf,
    /// Remount the root filesystem read-only after `pivot_root`.
    pub rootfs_readonly: bool,
    /// The user process.
    pub process: ProcessSpec,
    /// Hostname for a new UTS namespace.
    pub hostname: Option<String>,
    /// Mounts, in application order.
    pub mounts: Vec<MountSpec>,
    /// Namespaces, in the order they were declared.
    pub namespaces: Vec<NamespaceSpec>,
    /// Uid mappings for a new user namespace.
    pub uid_mappings: Vec<IdMapping>,
    /// Gid mappings for a new user namespace.
    pub gid_mappings: Vec<IdMapping>,
    /// Flattened cgroup limits.
    pub resources: ResourceLimits,
    /// Requested cgroup path, if any.
    pub cgroups_path: Option<String>,
    /// Propagation mode for the root mount.
    pub rootfs_propagation: Option<String>,
    /// Paths hidden from the container.
    pub masked_paths: Vec<PathBuf>,
    /// Paths remounted read-only.
    pub readonly_paths: Vec<PathBuf>,
    /// Kernel parameters written under `/proc/sys`.
    pub sysctl: BTreeMap<String, String>,
    /// Lifecycle hooks.
    pub hooks: Hooks,
    /// Bundle annotations, copied into the state document.
    pub annotations: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Namespace entry of the given type, if requested.
    #[must_use]
    pub fn namespace(&self, kind: LinuxNamespaceType) -> Option<&NamespaceSpec> {
        self.namespaces.iter().find(|ns| ns.kind == kind)
    }

    /// Whether a fresh namespace of this type is created (not joined).
    #[must_use]
    pub fn creates_namespace(&self, kind: LinuxNamespaceType) -> bool {
        self.namespace(kind).is_some_and(|ns| ns.path.is_none())
    }

    /// Path to a host file inside the bundle.
    #[must_use]
    pub fn bundle_file(&self, name: &str) -> PathBuf {
        self.bundle.join(name)
    }
}

/// The user process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Argument vector; never empty.
    pub args: Vec<String>,
    /// Environment in `KEY=value` form.
    pub env: Vec<String>,
    /// Absolute working directory inside the container.
    pub cwd: PathBuf,
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
    /// Supplementary groups.
    pub additional_gids: Vec<u32>,
    /// File creation mask.
    pub umask: Option<u32>,
    /// POSIX resource limits.
    pub rlimits: Vec<Rlimit>,
    /// Capability sets; `None` keeps whatever the init holds.
    pub capabilities: Option<Capabilities>,
    /// Set `PR_SET_NO_NEW_PRIVS` before exec.
    pub no_new_privileges: bool,
    /// OOM score adjustment.
    pub oom_score_adj: Option<i32>,
    /// Whether a terminal was requested.
    pub terminal: bool,
}

impl ProcessSpec {
    /// Value of an environment variable.
    #[must_use]
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(key, _)| *key == name)
                .map(|(_, value)| value)
        })
    }

    /// `PATH` used to resolve `args[0]`.
    #[must_use]
    pub fn search_path(&self) -> &str {
        self.env_var("PATH").unwrap_or(DEFAULT_PATH)
    }

    /// Program name (`args[0]`).
    #[must_use]
    pub fn program(&self) -> &str {
        self.args.first().map_or("", String::as_str)
    }
}

/// One mount, with its source resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Absolute path inside the container.
    pub destination: PathBuf,
    /// Source; absolute for bind mounts.
    pub source: Option<PathBuf>,
    /// Filesystem type.
    pub kind: Option<String>,
    /// `mount(8)` options.
    pub options: Vec<String>,
}

impl MountSpec {
    /// Whether this is a bind mount, by type or by option.
    #[must_use]
    pub fn is_bind(&self) -> bool {
        self.kind.as_deref() == Some("bind")
            || self.options.iter().any(|o| o == "bind" || o == "rbind")
    }

    /// Destination relative to the container root.
    #[must_use]
    pub fn relative_destination(&self) -> &Path {
        self.destination
            .strip_prefix("/")
            .unwrap_or(&self.destination)
    }
}

/// A namespace to create, or to join when `path` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSpec {
    /// Namespace type.
    pub kind: LinuxNamespaceType,
    /// Existing namespace to join.
    pub path: Option<PathBuf>,
}

/// User namespace id mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    /// First id inside the container.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of ids mapped.
    pub size: u32,
}

/// One `setrlimit(2)` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rlimit {
    /// Limit name, e.g. `RLIMIT_NOFILE`.
    pub kind: String,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

/// Capability sets by `CAP_*` name, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Bounding set.
    pub bounding: Vec<String>,
    /// Effective set.
    pub effective: Vec<String>,
    /// Inheritable set.
    pub inheritable: Vec<String>,
    /// Permitted set.
    pub permitted: Vec<String>,
    /// Ambient set.
    pub ambient: Vec<String>,
}
