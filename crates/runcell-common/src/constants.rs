//! System-wide constants and default paths.

use std::path::PathBuf;

/// Application name used in diagnostics and default paths.
pub const APP_NAME: &str = "runcell";

/// OCI runtime specification version written into state documents.
pub const OCI_VERSION: &str = "1.2.0";

/// Major version of the OCI runtime specification accepted in `config.json`.
pub const SUPPORTED_OCI_MAJOR: u64 = 1;

/// Highest minor version of the OCI runtime specification accepted.
pub const MAX_SUPPORTED_OCI_MINOR: u64 = 2;

/// Bundle configuration file name.
pub const CONFIG_FILE: &str = "config.json";

/// State root used when running as root.
pub const SYSTEM_STATE_ROOT: &str = "/run/runcell";

/// Per-container state document.
pub const STATE_FILE: &str = "state.json";

/// Per-container lock file guarding read-modify-write of the state.
pub const LOCK_FILE: &str = "state.lock";

/// FIFO the container init blocks on until `start` releases it.
pub const EXEC_FIFO: &str = "exec.fifo";

/// Cgroup filesystem mount point.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Parent cgroup under which containers without an explicit path are placed.
pub const CGROUP_PARENT: &str = "runcell";

/// Maximum accepted container id length.
pub const MAX_ID_LEN: usize = 1024;

/// Default `PATH` used to resolve the container entrypoint when the
/// process environment does not provide one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Returns the default state root.
///
/// Root uses [`SYSTEM_STATE_ROOT`]; unprivileged users get
/// `$XDG_RUNTIME_DIR/runcell`, falling back to `/tmp/runcell-<uid>`.
pub fn default_state_root(euid: u32) -> PathBuf {
    if euid == 0 {
        return PathBuf::from(SYSTEM_STATE_ROOT);
    }
    std::env::var_os("XDG_RUNTIME_DIR").map_or_else(
        || PathBuf::from(format!("/tmp/{APP_NAME}-{euid}")),
        |dir| PathBuf::from(dir).join(APP_NAME),
    )
}
