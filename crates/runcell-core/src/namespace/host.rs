//! Host capability detection.

use std::collections::HashSet;
use std::path::Path;

use nix::unistd::{getegid, geteuid};

use runcell_spec::config::{LinuxNamespaceType, NamespaceName};

/// What the host and the calling process can do.
///
/// Detected once per command and injected into the engine, so tests can
/// describe any host they need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Effective uid of the runtime.
    pub euid: u32,
    /// Effective gid of the runtime.
    pub egid: u32,
    /// Namespace types the kernel exposes under `/proc/self/ns`.
    pub namespaces: HashSet<LinuxNamespaceType>,
}

impl HostCapabilities {
    /// Inspects the running kernel.
    #[must_use]
    pub fn detect() -> Self {
        Self::detect_in(Path::new("/proc/self/ns"))
    }

    /// Inspects a `/proc/<pid>/ns`-style directory.
    #[must_use]
    pub fn detect_in(ns_dir: &Path) -> Self {
        let namespaces = [
            LinuxNamespaceType::Pid,
            LinuxNamespaceType::Network,
            LinuxNamespaceType::Mount,
            LinuxNamespaceType::Ipc,
            LinuxNamespaceType::Uts,
            LinuxNamespaceType::User,
            LinuxNamespaceType::Cgroup,
            LinuxNamespaceType::Time,
        ]
        .into_iter()
        .filter(|kind| ns_dir.join(kind.proc_name()).exists())
        .collect();
        let caps = Self {
            euid: geteuid().as_raw(),
            egid: getegid().as_raw(),
            namespaces,
        };
        tracing::debug!(
            euid = caps.euid,
            namespaces = ?caps.namespaces.iter().map(|k| k.name()).collect::<Vec<_>>(),
            "host capabilities detected"
        );
        caps
    }

    /// Whether the runtime runs as root.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.euid == 0
    }

    /// Whether the kernel exposes this namespace type.
    #[must_use]
    pub fn supports(&self, kind: LinuxNamespaceType) -> bool {
        self.namespaces.contains(&kind)
    }
}
