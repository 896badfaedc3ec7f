//! Linux namespace management for container isolation.
//!
//! [`IsolationContext::plan`] turns the namespace list of a
//! [`ContainerSpec`] into an ordered sequence of steps. Joins open their
//! namespace file up front, so a bad path fails `create` before anything
//! is forked, and the descriptors are closed when the context drops.
//!
//! Steps are entered by the forked children only, in this order: user,
//! mount, UTS, IPC, network, cgroup, PID. The user namespace comes first
//! so the remaining namespaces are owned by it; PID comes last because it
//! only applies to the next child.

pub mod host;
pub mod mount;
pub mod user;
pub mod uts;

use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use nix::sched::{CloneFlags, setns, unshare};

use runcell_common::error::IsolationError;
use runcell_spec::ContainerSpec;
use runcell_spec::config::{LinuxNamespaceType, NamespaceName};
use runcell_spec::container::IdMapping;

pub use host::HostCapabilities;

/// Order in which namespaces are entered.
pub const ENTRY_ORDER: [LinuxNamespaceType; 7] = [
    LinuxNamespaceType::User,
    LinuxNamespaceType::Mount,
    LinuxNamespaceType::Uts,
    LinuxNamespaceType::Ipc,
    LinuxNamespaceType::Network,
    LinuxNamespaceType::Cgroup,
    LinuxNamespaceType::Pid,
];

/// `clone(2)` flag for a namespace type, if this runtime can enter it.
#[must_use]
pub const fn clone_flag(kind: LinuxNamespaceType) -> Option<CloneFlags> {
    match kind {
        LinuxNamespaceType::User => Some(CloneFlags::CLONE_NEWUSER),
        LinuxNamespaceType::Mount => Some(CloneFlags::CLONE_NEWNS),
        LinuxNamespaceType::Uts => Some(CloneFlags::CLONE_NEWUTS),
        LinuxNamespaceType::Ipc => Some(CloneFlags::CLONE_NEWIPC),
        LinuxNamespaceType::Network => Some(CloneFlags::CLONE_NEWNET),
        LinuxNamespaceType::Cgroup => Some(CloneFlags::CLONE_NEWCGROUP),
        LinuxNamespaceType::Pid => Some(CloneFlags::CLONE_NEWPID),
        LinuxNamespaceType::Time => None,
    }
}

/// One namespace operation.
#[derive(Debug)]
pub enum NamespaceStep {
    /// `unshare(2)` a fresh namespace.
    Create(LinuxNamespaceType),
    /// `setns(2)` into an existing namespace.
    Join {
        /// Namespace type.
        kind: LinuxNamespaceType,
        /// File the descriptor was opened from.
        path: PathBuf,
        /// Open namespace file.
        fd: OwnedFd,
    },
}

impl NamespaceStep {
    /// Namespace type of this step.
    #[must_use]
    pub const fn kind(&self) -> LinuxNamespaceType {
        match self {
            Self::Create(kind) | Self::Join { kind, .. } => *kind,
        }
    }

    /// Applies the step to the calling process.
    ///
    /// # Errors
    ///
    /// Returns [`IsolationError::EnterFailed`] or
    /// [`IsolationError::JoinFailed`] with the errno text.
    pub fn enter(&self) -> Result<(), IsolationError> {
        let kind = self.kind();
        let flag = clone_flag(kind).ok_or_else(|| IsolationError::Unsupported {
            kind: kind.name().to_string(),
        })?;
        match self {
            Self::Create(_) => {
                unshare(flag).map_err(|e| IsolationError::EnterFailed {
                    kind: kind.name().to_string(),
                    message: e.desc().to_string(),
                })?;
                tracing::debug!(kind = kind.name(), "namespace created");
            }
            Self::Join { path, fd, .. } => {
                setns(fd, flag).map_err(|e| IsolationError::JoinFailed {
                    kind: kind.name().to_string(),
                    path: path.clone(),
                    message: e.desc().to_string(),
                })?;
                tracing::debug!(kind = kind.name(), path = %path.display(), "namespace joined");
            }
        }
        Ok(())
    }
}

/// Ordered namespace steps plus the id mappings of a new user namespace.
#[derive(Debug)]
pub struct IsolationContext {
    steps: Vec<NamespaceStep>,
    uid_mappings: Vec<IdMapping>,
    gid_mappings: Vec<IdMapping>,
    rootless: bool,
}

impl IsolationContext {
    /// Plans the isolation requested by `spec` on this host.
    ///
    /// A new user namespace without explicit mappings maps container
    /// root to the caller's effective ids.
    ///
    /// # Errors
    ///
    /// Returns [`IsolationError::Unsupported`] for namespace types the host
    /// or this runtime cannot provide, [`IsolationError::InsufficientPrivilege`]
    /// when an unprivileged caller requests no user namespace, and
    /// [`IsolationError::JoinFailed`] when a namespace path cannot be opened.
    pub fn plan(spec: &ContainerSpec, host: &HostCapabilities) -> Result<Self, IsolationError> {
        for ns in &spec.namespaces {
            if clone_flag(ns.kind).is_none() || !host.supports(ns.kind) {
                return Err(IsolationError::Unsupported {
                    kind: ns.kind.name().to_string(),
                });
            }
        }
        let wants_user = spec.namespace(LinuxNamespaceType::User).is_some();
        if !host.is_root() && !wants_user {
            return Err(IsolationError::InsufficientPrivilege {
                message: format!(
                    "running as uid {} requires a user namespace in the bundle",
                    host.euid
                ),
            });
        }

        let mut steps = Vec::with_capacity(spec.namespaces.len());
        for kind in ENTRY_ORDER {
            let Some(ns) = spec.namespace(kind) else {
                continue;
            };
            let step = match &ns.path {
                None => NamespaceStep::Create(kind),
                Some(path) => {
                    let file = File::open(path).map_err(|e| IsolationError::JoinFailed {
                        kind: kind.name().to_string(),
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                    NamespaceStep::Join {
                        kind,
                        path: path.clone(),
                        fd: OwnedFd::from(file),
                    }
                }
            };
            steps.push(step);
        }

        let creates_user = spec.creates_namespace(LinuxNamespaceType::User);
        let (uid_mappings, gid_mappings) = if creates_user {
            (
                default_mapping(&spec.uid_mappings, host.euid),
                default_mapping(&spec.gid_mappings, host.egid),
            )
        } else {
            (Vec::new(), Vec::new())
        };

        tracing::debug!(
            steps = ?steps.iter().map(|s| s.kind().name()).collect::<Vec<_>>(),
            rootless = !host.is_root(),
            "isolation planned"
        );
        Ok(Self {
            steps,
            uid_mappings,
            gid_mappings,
            rootless: !host.is_root(),
        })
    }

    /// All steps, in entry order.
    #[must_use]
    pub fn steps(&self) -> &[NamespaceStep] {
        &self.steps
    }

    /// The user namespace step, if any. Always the first step.
    #[must_use]
    pub fn user_step(&self) -> Option<&NamespaceStep> {
        self.steps
            .first()
            .filter(|s| s.kind() == LinuxNamespaceType::User)
    }

    /// Every step after the user namespace.
    pub fn remaining_steps(&self) -> impl Iterator<Item = &NamespaceStep> {
        self.steps
            .iter()
            .filter(|s| s.kind() != LinuxNamespaceType::User)
    }

    /// Whether a fresh namespace of this type is created.
    #[must_use]
    pub fn creates(&self, kind: LinuxNamespaceType) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, NamespaceStep::Create(k) if *k == kind))
    }

    /// Uid mappings to write for a new user namespace.
    #[must_use]
    pub fn uid_mappings(&self) -> &[IdMapping] {
        &self.uid_mappings
    }

    /// Gid mappings to write for a new user namespace.
    #[must_use]
    pub fn gid_mappings(&self) -> &[IdMapping] {
        &self.gid_mappings
    }

    /// Whether the runtime itself is unprivileged.
    #[must_use]
    pub const fn is_rootless(&self) -> bool {
        self.rootless
    }
}

fn default_mapping(requested: &[IdMapping], host_id: u32) -> Vec<IdMapping> {
    if requested.is_empty() {
        vec![IdMapping {
            container_id: 0,
            host_id,
            size: 1,
        }]
    } else {
        requested.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::path::PathBuf;

    use runcell_common::types::ResourceLimits;
    use runcell_spec::container::{NamespaceSpec, ProcessSpec};
    use runcell_spec::config::Hooks;

    use super::*;

    fn spec(namespaces: &[(LinuxNamespaceType, Option<&str>)]) -> ContainerSpec {
        ContainerSpec {
            oci_version: "1.2.0".into(),
            bundle: PathBuf::from("/b"),
            rootfs: PathBuf::from("/b/rootfs"),
            rootfs_readonly: false,
            process: ProcessSpec {
                args: vec!["sh".into()],
                env: Vec::new(),
                cwd: PathBuf::from("/"),
                uid: 0,
                gid: 0,
                additional_gids: Vec::new(),
                umask: None,
                rlimits: Vec::new(),
                capabilities: None,
                no_new_privileges: false,
                oom_score_adj: None,
                terminal: false,
            },
            hostname: None,
            mounts: Vec::new(),
            namespaces: namespaces
                .iter()
                .map(|(kind, path)| NamespaceSpec {
                    kind: *kind,
                    path: path.map(PathBuf::from),
                })
                .collect(),
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            resources: ResourceLimits::default(),
            cgroups_path: None,
            rootfs_propagation: None,
            masked_paths: Vec::new(),
            readonly_paths: Vec::new(),
            sysctl: BTreeMap::new(),
            hooks: Hooks::default(),
            annotations: BTreeMap::new(),
        }
    }

    fn host(euid: u32) -> HostCapabilities {
        HostCapabilities {
            euid,
            egid: euid,
            namespaces: ENTRY_ORDER.iter().copied().collect::<HashSet<_>>(),
        }
    }

    #[test]
    fn steps_follow_entry_order() {
        let s = spec(&[
            (LinuxNamespaceType::Pid, None),
            (LinuxNamespaceType::Network, None),
            (LinuxNamespaceType::Mount, None),
            (LinuxNamespaceType::User, None),
        ]);
        let ctx = IsolationContext::plan(&s, &host(0)).unwrap();
        let kinds: Vec<_> = ctx.steps().iter().map(NamespaceStep::kind).collect();
        assert_eq!(
            kinds,
            vec![
                LinuxNamespaceType::User,
                LinuxNamespaceType::Mount,
                LinuxNamespaceType::Network,
                LinuxNamespaceType::Pid
            ]
        );
        assert!(ctx.user_step().is_some());
        assert_eq!(ctx.remaining_steps().count(), 3);
    }

    #[test]
    fn new_user_namespace_gets_default_root_mapping() {
        let s = spec(&[(LinuxNamespaceType::User, None), (LinuxNamespaceType::Mount, None)]);
        let ctx = IsolationContext::plan(&s, &host(1000)).unwrap();
        assert!(ctx.is_rootless());
        assert_eq!(ctx.uid_mappings()[0].host_id, 1000);
        assert_eq!(ctx.uid_mappings()[0].container_id, 0);
    }

    #[test]
    fn unprivileged_without_user_namespace_is_refused() {
        let s = spec(&[(LinuxNamespaceType::Mount, None)]);
        assert!(matches!(
            IsolationContext::plan(&s, &host(1000)),
            Err(IsolationError::InsufficientPrivilege { .. })
        ));
    }

    #[test]
    fn time_namespace_is_unsupported() {
        let s = spec(&[(LinuxNamespaceType::Mount, None), (LinuxNamespaceType::Time, None)]);
        assert!(matches!(
            IsolationContext::plan(&s, &host(0)),
            Err(IsolationError::Unsupported { kind }) if kind == "time"
        ));
    }

    #[test]
    fn kinds_missing_on_host_are_unsupported() {
        let mut h = host(0);
        let _ = h.namespaces.remove(&LinuxNamespaceType::Cgroup);
        let s = spec(&[(LinuxNamespaceType::Mount, None), (LinuxNamespaceType::Cgroup, None)]);
        assert!(matches!(
            IsolationContext::plan(&s, &h),
            Err(IsolationError::Unsupported { .. })
        ));
    }

    #[test]
    fn unreadable_join_path_fails_at_plan_time() {
        let s = spec(&[
            (LinuxNamespaceType::Mount, None),
            (LinuxNamespaceType::Network, Some("/nonexistent/netns/x")),
        ]);
        assert!(matches!(
            IsolationContext::plan(&s, &host(0)),
            Err(IsolationError::JoinFailed { .. })
        ));
    }

    #[test]
    fn join_holds_an_open_descriptor() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let s = spec(&[
            (LinuxNamespaceType::Mount, None),
            (LinuxNamespaceType::Network, Some(path.as_str())),
        ]);
        let ctx = IsolationContext::plan(&s, &host(0)).unwrap();
        assert!(ctx.creates(LinuxNamespaceType::Mount));
        assert!(!ctx.creates(LinuxNamespaceType::Network));
        assert!(matches!(
            &ctx.steps()[1],
            NamespaceStep::Join { kind: LinuxNamespaceType::Network, .. }
        ));
    }
}
