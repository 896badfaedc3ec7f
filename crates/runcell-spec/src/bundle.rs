//! OCI bundle loading.
//!
//! A bundle is a directory holding `config.json` and the root filesystem
//! it names. [`load`] reads both, checks the declared specification
//! version, enforces the semantic rules the schema cannot express, and
//! resolves relative paths against the bundle directory.
//! Reference: <https://github.com/opencontainers/runtime-spec/blob/main/bundle.md>

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use oci_spec::OciSpecError;
use oci_spec::runtime::{Linux, LinuxIdMapping, Mount, Process, Root};
use serde::Serialize;

use runcell_common::constants::{CONFIG_FILE, MAX_SUPPORTED_OCI_MINOR, SUPPORTED_OCI_MAJOR};
use runcell_common::error::SpecError;
use runcell_common::types::ResourceLimits;

use crate::config::{LinuxNamespaceType, LinuxResources, NamespaceName, Spec, wire_name};
use crate::container::{
    Capabilities, ContainerSpec, IdMapping, MountSpec, NamespaceSpec, ProcessSpec, Rlimit,
};
use crate::hooks;

/// A bundle directory with its parsed configuration.
#[derive(Debug, Clone)]
pub struct Bundle {
    path: PathBuf,
    config: Spec,
}

impl Bundle {
    /// Reads `config.json` from a bundle directory.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::BundleNotFound`] if the directory is missing,
    /// [`SpecError::ConfigNotFound`] if it has no `config.json`,
    /// [`SpecError::Read`] on I/O failure, and [`SpecError::Malformed`]
    /// when the document does not match the schema.
    pub fn open(path: &Path) -> Result<Self, SpecError> {
        if !path.is_dir() {
            return Err(SpecError::BundleNotFound {
                path: path.to_path_buf(),
            });
        }
        let path = path.canonicalize().map_err(|source| SpecError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config_path = path.join(CONFIG_FILE);
        if !config_path.is_file() {
            return Err(SpecError::ConfigNotFound { path });
        }
        let config = Spec::load(&config_path).map_err(|e| match e {
            OciSpecError::Io(source) => SpecError::Read {
                path: config_path.clone(),
                source,
            },
            OciSpecError::SerDe(source) => SpecError::Malformed { source },
            other => invalid(other.to_string()),
        })?;
        tracing::debug!(bundle = %path.display(), version = %config.version(), "parsed config.json");
        Ok(Self { path, config })
    }

    /// Absolute bundle directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed configuration, before validation.
    #[must_use]
    pub const fn config(&self) -> &Spec {
        &self.config
    }

    /// Validates the configuration and builds the immutable spec.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::UnsupportedVersion`] or [`SpecError::Invalid`].
    pub fn into_spec(self) -> Result<ContainerSpec, SpecError> {
        let Self { path, config } = self;
        check_version(config.version())?;
        let (root, process, linux) = validate(&config)?;

        let rootfs = resolve(&path, root.path());
        if !rootfs.is_dir() {
            return Err(invalid(format!(
                "root filesystem {} is missing or not a directory",
                rootfs.display()
            )));
        }

        let mounts = config
            .mounts()
            .iter()
            .flatten()
            .map(|m| mount_spec(&path, m))
            .collect();
        let namespaces = linux
            .namespaces()
            .iter()
            .flatten()
            .map(|ns| NamespaceSpec {
                kind: ns.typ(),
                path: ns.path().clone(),
            })
            .collect();

        let spec = ContainerSpec {
            oci_version: config.version().clone(),
            rootfs,
            rootfs_readonly: root.readonly().unwrap_or(false),
            process: process_spec(process),
            hostname: config.hostname().clone(),
            mounts,
            namespaces,
            uid_mappings: id_mappings(linux.uid_mappings().as_deref()),
            gid_mappings: id_mappings(linux.gid_mappings().as_deref()),
            resources: linux.resources().as_ref().map(flatten_resources).unwrap_or_default(),
            cgroups_path: linux
                .cgroups_path()
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .filter(|p| !p.is_empty()),
            rootfs_propagation: linux.rootfs_propagation().clone(),
            masked_paths: linux.masked_paths().iter().flatten().map(PathBuf::from).collect(),
            readonly_paths: linux.readonly_paths().iter().flatten().map(PathBuf::from).collect(),
            sysctl: linux
                .sysctl()
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            hooks: config.hooks().clone().unwrap_or_default(),
            annotations: config
                .annotations()
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            bundle: path,
        };
        Ok(spec)
    }
}

/// Loads and validates the bundle at `path`.
///
/// # Errors
///
/// Returns a [`SpecError`] describing the first problem found.
pub fn load(path: &Path) -> Result<ContainerSpec, SpecError> {
    Bundle::open(path)?.into_spec()
}

fn invalid(message: String) -> SpecError {
    SpecError::Invalid { message }
}

fn resolve(bundle: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        bundle.join(path)
    }
}

fn mount_spec(bundle: &Path, mount: &Mount) -> MountSpec {
    let mut spec = MountSpec {
        destination: mount.destination().clone(),
        source: None,
        kind: mount.typ().clone(),
        options: mount.options().clone().unwrap_or_default(),
    };
    spec.source = mount.source().as_ref().map(|src| {
        if spec.is_bind() {
            resolve(bundle, src)
        } else {
            src.clone()
        }
    });
    spec
}

fn process_spec(process: &Process) -> ProcessSpec {
    let user = process.user();
    ProcessSpec {
        args: process.args().clone().unwrap_or_default(),
        env: process.env().clone().unwrap_or_default(),
        cwd: process.cwd().clone(),
        uid: user.uid(),
        gid: user.gid(),
        additional_gids: user.additional_gids().clone().unwrap_or_default(),
        umask: user.umask(),
        rlimits: process
            .rlimits()
            .iter()
            .flatten()
            .filter_map(|r| {
                Some(Rlimit {
                    kind: wire_name(&r.typ())?,
                    soft: r.soft(),
                    hard: r.hard(),
                })
            })
            .collect(),
        capabilities: process.capabilities().as_ref().map(|caps| Capabilities {
            bounding: capability_names(caps.bounding()),
            effective: capability_names(caps.effective()),
            inheritable: capability_names(caps.inheritable()),
            permitted: capability_names(caps.permitted()),
            ambient: capability_names(caps.ambient()),
        }),
        no_new_privileges: process.no_new_privileges().unwrap_or(false),
        oom_score_adj: process.oom_score_adj(),
        terminal: process.terminal().unwrap_or(false),
    }
}

fn capability_names<T: Serialize>(set: &Option<HashSet<T>>) -> Vec<String> {
    let mut names: Vec<String> = set.iter().flatten().filter_map(wire_name).collect();
    names.sort_unstable();
    names
}

fn id_mappings(mappings: Option<&[LinuxIdMapping]>) -> Vec<IdMapping> {
    mappings
        .unwrap_or_default()
        .iter()
        .map(|m| IdMapping {
            container_id: m.container_id(),
            host_id: m.host_id(),
            size: m.size(),
        })
        .collect()
}

/// Accepts `1.x.y` with `x` up to the highest supported minor.
/// Pre-release suffixes such as `1.0.2-dev` are allowed.
fn check_version(version: &str) -> Result<(), SpecError> {
    let unsupported = || SpecError::UnsupportedVersion {
        version: version.to_string(),
    };
    let core = version.split(['-', '+']).next().unwrap_or_default();
    let parts: Vec<u64> = core
        .split('.')
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|_| unsupported())?;
    match parts.as_slice() {
        [major, minor, _patch]
            if *major == SUPPORTED_OCI_MAJOR && *minor <= MAX_SUPPORTED_OCI_MINOR =>
        {
            Ok(())
        }
        _ => Err(unsupported()),
    }
}

fn validate(config: &Spec) -> Result<(&Root, &Process, &Linux), SpecError> {
    let root = config
        .root()
        .as_ref()
        .ok_or_else(|| invalid("root is required".into()))?;
    if root.path().as_os_str().is_empty() {
        return Err(invalid("root.path must not be empty".into()));
    }
    let process = config
        .process()
        .as_ref()
        .ok_or_else(|| invalid("process is required".into()))?;
    if process.args().as_ref().is_none_or(Vec::is_empty) {
        return Err(invalid("process.args must not be empty".into()));
    }
    if !process.cwd().is_absolute() {
        return Err(invalid(format!(
            "process.cwd must be absolute: {}",
            process.cwd().display()
        )));
    }
    for (i, mount) in config.mounts().iter().flatten().enumerate() {
        if !mount.destination().is_absolute() {
            return Err(invalid(format!(
                "mounts[{i}].destination must be absolute: {}",
                mount.destination().display()
            )));
        }
    }
    if let Some(hooks) = config.hooks() {
        hooks::validate(hooks)?;
    }
    let Some(linux) = config.linux() else {
        return Err(no_mount_namespace());
    };
    validate_linux(linux)?;
    Ok((root, process, linux))
}

fn no_mount_namespace() -> SpecError {
    invalid("a mount namespace is required to pivot into the rootfs".into())
}

fn validate_linux(linux: &Linux) -> Result<(), SpecError> {
    let mut seen = HashSet::new();
    for ns in linux.namespaces().iter().flatten() {
        let kind = ns.typ();
        if !seen.insert(kind) {
            return Err(invalid(format!("namespace {} is listed twice", kind.name())));
        }
        if let Some(path) = ns.path()
            && !path.is_absolute()
        {
            return Err(invalid(format!(
                "namespace {} path must be absolute: {}",
                kind.name(),
                path.display()
            )));
        }
    }
    if !seen.contains(&LinuxNamespaceType::Mount) {
        return Err(no_mount_namespace());
    }
    let has_mappings = linux.uid_mappings().as_ref().is_some_and(|m| !m.is_empty())
        || linux.gid_mappings().as_ref().is_some_and(|m| !m.is_empty());
    if has_mappings && !seen.contains(&LinuxNamespaceType::User) {
        return Err(invalid(
            "uidMappings/gidMappings require a user namespace".into(),
        ));
    }
    for path in linux
        .masked_paths()
        .iter()
        .flatten()
        .chain(linux.readonly_paths().iter().flatten())
    {
        if !Path::new(path).is_absolute() {
            return Err(invalid(format!(
                "masked and read-only paths must be absolute: {path}"
            )));
        }
    }
    Ok(())
}

fn flatten_resources(res: &LinuxResources) -> ResourceLimits {
    let memory = res.memory().as_ref();
    let cpu = res.cpu().as_ref();
    ResourceLimits {
        cpu_shares: cpu.and_then(|c| c.shares()),
        cpu_quota: cpu.and_then(|c| c.quota()),
        cpu_period: cpu.and_then(|c| c.period()),
        cpuset_cpus: cpu.and_then(|c| c.cpus().clone()).filter(|s| !s.is_empty()),
        cpuset_mems: cpu.and_then(|c| c.mems().clone()).filter(|s| !s.is_empty()),
        memory_limit: memory.and_then(|m| m.limit()),
        memory_reservation: memory.and_then(|m| m.reservation()),
        memory_swap: memory.and_then(|m| m.swap()),
        pids_limit: res.pids().as_ref().map(|p| p.limit()),
        io_weight: res.block_io().as_ref().and_then(|b| b.weight()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    fn bundle_with(config: &str) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("rootfs")).unwrap();
        fs::write(dir.path().join(CONFIG_FILE), config).unwrap();
        dir
    }

    const VALID: &str = r#"{
        "ociVersion": "1.0.2-dev",
        "root": { "path": "rootfs", "readonly": true },
        "process": { "cwd": "/", "args": ["sh"], "env": ["PATH=/bin"] },
        "hostname": "box",
        "mounts": [
            { "destination": "/proc", "type": "proc", "source": "proc" },
            { "destination": "/data", "type": "bind", "source": "data", "options": ["rbind"] }
        ],
        "linux": {
            "namespaces": [ { "type": "pid" }, { "type": "mount" } ],
            "resources": { "cpu": { "quota": 50000, "period": 100000 }, "memory": { "limit": 104857600 } },
            "cgroupsPath": ""
        }
    }"#;

    #[test]
    fn valid_bundle_loads_and_resolves_paths() {
        let dir = bundle_with(VALID);
        let spec = load(dir.path()).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(spec.bundle, root);
        assert_eq!(spec.rootfs, root.join("rootfs"));
        assert!(spec.rootfs_readonly);
        assert_eq!(spec.mounts[0].source, Some(PathBuf::from("proc")));
        assert_eq!(spec.mounts[1].source, Some(root.join("data")));
        assert_eq!(spec.resources.cpu_quota, Some(50_000));
        assert_eq!(spec.resources.memory_limit, Some(104_857_600));
        assert_eq!(spec.cgroups_path, None);
        assert!(spec.creates_namespace(LinuxNamespaceType::Pid));
        assert!(!spec.creates_namespace(LinuxNamespaceType::Network));
    }

    #[test]
    fn missing_bundle_and_config_are_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(&dir.path().join("nope")),
            Err(SpecError::BundleNotFound { .. })
        ));
        assert!(matches!(
            load(dir.path()),
            Err(SpecError::ConfigNotFound { .. })
        ));
    }

    #[test]
    fn malformed_json_is_reported() {
        let dir = bundle_with("{ not json");
        assert!(matches!(load(dir.path()), Err(SpecError::Malformed { .. })));
        let dir = bundle_with(
            r#"{ "ociVersion": "1.2.0", "root": { "path": 7 }, "process": { "cwd": "/", "args": ["sh"] } }"#,
        );
        assert!(matches!(load(dir.path()), Err(SpecError::Malformed { .. })));
    }

    #[test]
    fn versions_outside_one_dot_two_are_rejected() {
        for ok in ["1.0.0", "1.1.0", "1.2.1", "1.0.2-dev"] {
            assert!(check_version(ok).is_ok(), "{ok}");
        }
        for bad in ["2.0.0", "1.3.0", "1.0", "one", "0.9.0", ""] {
            assert!(
                matches!(check_version(bad), Err(SpecError::UnsupportedVersion { .. })),
                "{bad}"
            );
        }
    }

    fn rejection(body: &str) -> String {
        let json = format!(r#"{{ "ociVersion": "1.2.0", "root": {{ "path": "rootfs" }}, {body} }}"#);
        let dir = bundle_with(&json);
        match load(dir.path()) {
            Err(SpecError::Invalid { message }) => message,
            other => panic!("expected an invalid configuration for {body}, got {other:?}"),
        }
    }

    #[test]
    fn semantic_violations_are_invalid() {
        let cases = [
            (
                r#""process": { "cwd": "relative", "args": ["sh"] }"#,
                "process.cwd must be absolute",
            ),
            (r#""process": { "cwd": "/", "args": [] }"#, "process.args"),
            (
                r#""process": { "cwd": "/", "args": ["sh"] }, "mounts": [ { "destination": "tmp" } ]"#,
                "mounts[0].destination",
            ),
            (
                r#""process": { "cwd": "/", "args": ["sh"] }, "hooks": { "poststart": [ { "path": "hook" } ] }"#,
                "poststart hook path",
            ),
            (
                r#""process": { "cwd": "/", "args": ["sh"] }, "linux": { "namespaces": [ { "type": "pid" } ] }"#,
                "mount namespace is required",
            ),
            (
                r#""process": { "cwd": "/", "args": ["sh"] }, "linux": { "namespaces": [ { "type": "mount" }, { "type": "network", "path": "netns" } ] }"#,
                "network path must be absolute",
            ),
            (
                r#""process": { "cwd": "/", "args": ["sh"] }, "linux": { "namespaces": [ { "type": "mount" } ], "maskedPaths": [ "proc/kcore" ] }"#,
                "must be absolute: proc/kcore",
            ),
        ];
        for (body, expected) in cases {
            let message = rejection(body);
            assert!(message.contains(expected), "{body}: {message}");
        }
    }

    #[test]
    fn duplicate_namespace_is_invalid() {
        let message = rejection(
            r#""process": { "cwd": "/", "args": ["sh"] }, "linux": { "namespaces": [ { "type": "mount" }, { "type": "pid" }, { "type": "pid" } ] }"#,
        );
        assert_eq!(message, "namespace pid is listed twice");
    }

    #[test]
    fn id_mappings_require_a_user_namespace() {
        let message = rejection(
            r#""process": { "cwd": "/", "args": ["sh"] }, "linux": { "namespaces": [ { "type": "mount" } ], "uidMappings": [ { "containerID": 0, "hostID": 1000, "size": 1 } ] }"#,
        );
        assert!(message.contains("require a user namespace"), "{message}");

        let dir = bundle_with(
            r#"{ "ociVersion": "1.2.0", "root": { "path": "rootfs" },
                 "process": { "cwd": "/", "args": ["sh"] },
                 "linux": { "namespaces": [ { "type": "mount" }, { "type": "user" } ],
                            "uidMappings": [ { "containerID": 0, "hostID": 1000, "size": 1 } ] } }"#,
        );
        let spec = load(dir.path()).unwrap();
        assert_eq!(
            spec.uid_mappings,
            vec![IdMapping {
                container_id: 0,
                host_id: 1000,
                size: 1
            }]
        );
    }

    #[test]
    fn missing_root_or_process_is_rejected() {
        let dir = bundle_with(
            r#"{ "ociVersion": "1.2.0", "process": { "cwd": "/", "args": ["sh"] }, "linux": { "namespaces": [ { "type": "mount" } ] } }"#,
        );
        assert!(load(dir.path()).is_err());
        let dir = bundle_with(
            r#"{ "ociVersion": "1.2.0", "root": { "path": "rootfs" }, "linux": { "namespaces": [ { "type": "mount" } ] } }"#,
        );
        assert!(load(dir.path()).is_err());
    }

    #[test]
    fn process_details_are_normalized() {
        let dir = bundle_with(
            r#"{ "ociVersion": "1.2.0", "root": { "path": "rootfs" },
                 "process": {
                     "cwd": "/srv", "args": ["app"], "noNewPrivileges": true,
                     "user": { "uid": 1000, "gid": 100, "additionalGids": [10] },
                     "rlimits": [ { "type": "RLIMIT_NOFILE", "soft": 1024, "hard": 4096 } ],
                     "capabilities": { "bounding": ["CAP_KILL", "CAP_CHOWN"] }
                 },
                 "linux": { "namespaces": [ { "type": "mount" } ], "sysctl": { "net.ipv4.ip_forward": "1" } } }"#,
        );
        let spec = load(dir.path()).unwrap();
        let process = &spec.process;
        assert_eq!((process.uid, process.gid), (1000, 100));
        assert_eq!(process.additional_gids, vec![10]);
        assert!(process.no_new_privileges);
        assert_eq!(
            process.rlimits,
            vec![Rlimit {
                kind: "RLIMIT_NOFILE".into(),
                soft: 1024,
                hard: 4096
            }]
        );
        let caps = process.capabilities.as_ref().unwrap();
        assert_eq!(caps.bounding, vec!["CAP_CHOWN".to_string(), "CAP_KILL".to_string()]);
        assert_eq!(spec.sysctl.get("net.ipv4.ip_forward").map(String::as_str), Some("1"));
    }

    #[test]
    fn missing_rootfs_is_invalid() {
        let dir = bundle_with(
            r#"{ "ociVersion": "1.2.0", "root": { "path": "elsewhere" }, "process": { "cwd": "/", "args": ["sh"] },
                 "linux": { "namespaces": [ { "type": "mount" } ] } }"#,
        );
        let err = load(dir.path()).unwrap_err();
        assert!(
            matches!(&err, SpecError::Invalid { message } if message.contains("root filesystem")),
            "{err}"
        );
    }
}
