//! OCI runtime configuration (`config.json`).
//!
//! The document itself is modelled by [`oci_spec::runtime`]; unknown
//! properties are ignored there, as the runtime specification requires.
//! This module re-exports the types the rest of the workspace names and
//! adds the lookups runcell needs on top of them.
//! Reference: <https://github.com/opencontainers/runtime-spec/blob/main/config.md>

use serde::Serialize;

pub use oci_spec::runtime::{
    Hook, HookBuilder, Hooks, HooksBuilder, LinuxNamespaceType, LinuxResources, Spec,
};

/// Kernel and `config.json` names of a namespace type.
pub trait NamespaceName {
    /// Name used in `config.json`.
    fn name(self) -> &'static str;

    /// Entry name under `/proc/<pid>/ns/`.
    fn proc_name(self) -> &'static str;
}

impl NamespaceName for LinuxNamespaceType {
    fn name(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Network => "network",
            Self::Mount => "mount",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::User => "user",
            Self::Cgroup => "cgroup",
            Self::Time => "time",
        }
    }

    fn proc_name(self) -> &'static str {
        match self {
            Self::Network => "net",
            Self::Mount => "mnt",
            other => other.name(),
        }
    }
}

/// The string a serde-named enum takes in `config.json`, such as
/// `CAP_CHOWN` or `RLIMIT_NOFILE`.
pub(crate) fn wire_name<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(name)) => Some(name),
        _ => None,
    }
}
