//! Error taxonomy for the runcell workspace.
//!
//! Each component has its own error enum; [`RuntimeError`] unifies them
//! for the lifecycle engine and maps every failure to a distinct process
//! exit code and a one-line diagnostic.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Status;

/// Malformed or incompatible bundle. User-fixable, never retried.
#[derive(Debug, Error)]
pub enum SpecError {
    /// The bundle directory does not exist.
    #[error("bundle not found: {}", path.display())]
    BundleNotFound {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// The bundle has no `config.json`.
    #[error("config.json not found in bundle {}", path.display())]
    ConfigNotFound {
        /// Bundle directory.
        path: PathBuf,
    },

    /// Reading a bundle file failed.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// `config.json` does not match the runtime configuration schema.
    #[error("malformed config.json: {source}")]
    Malformed {
        /// Underlying parse error.
        #[from]
        source: serde_json::Error,
    },

    /// `ociVersion` names a specification version this runtime cannot honor.
    #[error("unsupported OCI version {version}")]
    UnsupportedVersion {
        /// Version string found in `config.json`.
        version: String,
    },

    /// The configuration parsed but violates a semantic rule.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// Description of the violation.
        message: String,
    },
}

/// Host privilege or capability problem while building isolation.
#[derive(Debug, Error)]
pub enum IsolationError {
    /// The host kernel (or this runtime) does not support a namespace type.
    #[error("namespace type {kind} is not supported on this host")]
    Unsupported {
        /// Namespace type name.
        kind: String,
    },

    /// The caller lacks the privilege the requested isolation needs.
    #[error("insufficient privilege: {message}")]
    InsufficientPrivilege {
        /// Description of the missing privilege.
        message: String,
    },

    /// Joining an existing namespace by path failed.
    #[error("failed to join {kind} namespace at {}: {message}", path.display())]
    JoinFailed {
        /// Namespace type name.
        kind: String,
        /// Namespace file that was opened or joined.
        path: PathBuf,
        /// Error text.
        message: String,
    },

    /// Creating a namespace with `unshare(2)` failed.
    #[error("failed to create {kind} namespace: {message}")]
    EnterFailed {
        /// Namespace type name.
        kind: String,
        /// Error text.
        message: String,
    },

    /// Writing uid/gid maps for a user namespace failed.
    #[error("failed to write id mapping {}: {source}", path.display())]
    IdMapping {
        /// Map file being written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A mount operation inside the container mount namespace failed.
    #[error("mount of {} failed: {message}", target.display())]
    Mount {
        /// Mount target.
        target: PathBuf,
        /// Error text.
        message: String,
    },

    /// Switching the root filesystem failed.
    #[error("pivot_root failed: {message}")]
    PivotRoot {
        /// Error text.
        message: String,
    },

    /// Any other in-container setup step (hostname, sysctl, credentials,
    /// capabilities, rlimits) failed.
    #[error("{step} failed: {message}")]
    Setup {
        /// Name of the failing step.
        step: &'static str,
        /// Error text.
        message: String,
    },
}

/// Resource-control group failure.
#[derive(Debug, Error)]
pub enum CgroupError {
    /// No cgroup hierarchy is mounted at the configured root.
    #[error("no cgroup hierarchy found at {}", root.display())]
    Unavailable {
        /// Configured cgroup root.
        root: PathBuf,
    },

    /// A limit needs a controller the host does not expose.
    #[error("cgroup controller {controller} is not available")]
    ControllerUnavailable {
        /// Controller name.
        controller: String,
    },

    /// The requested limits contradict each other.
    #[error("conflicting limits: {message}")]
    ConflictingLimits {
        /// Description of the conflict.
        message: String,
    },

    /// The cgroups path escapes the hierarchy or is otherwise unusable.
    #[error("invalid cgroup path: {path}")]
    InvalidPath {
        /// Offending path.
        path: String,
    },

    /// A control-file operation failed.
    #[error("cgroup I/O error at {}: {source}", path.display())]
    Io {
        /// Control file or directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Processes were still attached after every teardown attempt.
    #[error("cgroup {} still busy after {attempts} attempts", path.display())]
    Busy {
        /// Cgroup directory.
        path: PathBuf,
        /// Number of removal attempts made.
        attempts: u32,
    },
}

/// Failure launching or releasing the container process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// `fork(2)` failed.
    #[error("fork failed: {message}")]
    Fork {
        /// Error text.
        message: String,
    },

    /// The parent/child synchronisation channel broke or carried garbage.
    #[error("sync channel error: {message}")]
    Sync {
        /// Error text.
        message: String,
    },

    /// The container init reported a setup failure.
    #[error("container init setup failed: {message}")]
    Setup {
        /// Error text reported by the init.
        message: String,
    },

    /// The entrypoint could not be resolved inside the root filesystem.
    #[error("executable not found in container: {program}")]
    ExecNotFound {
        /// Program name from `process.args[0]`.
        program: String,
    },

    /// The container init is no longer alive.
    #[error("container init (pid {pid}) is not running")]
    NotRunning {
        /// Init pid.
        pid: i32,
    },

    /// Opening or writing the exec FIFO failed.
    #[error("exec fifo {}: {source}", path.display())]
    Fifo {
        /// FIFO path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A lifecycle hook failed or timed out.
    #[error("hook {hook} failed: {message}")]
    Hook {
        /// Hook path.
        hook: String,
        /// Error text.
        message: String,
    },

    /// Signal delivery failed.
    #[error("failed to signal pid {pid}: {message}")]
    Signal {
        /// Target pid.
        pid: i32,
        /// Error text.
        message: String,
    },
}

/// State file corruption or lock contention.
#[derive(Debug, Error)]
pub enum StateError {
    /// A state file operation failed.
    #[error("state I/O error at {}: {source}", path.display())]
    Io {
        /// State file or directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The state file exists but does not parse.
    #[error("corrupted state file {}: {message}", path.display())]
    Corrupted {
        /// State file.
        path: PathBuf,
        /// Parse error text.
        message: String,
    },

    /// The per-container lock stayed held through every retry.
    #[error("state lock {} held by another operation after {attempts} attempts", path.display())]
    Locked {
        /// Lock file.
        path: PathBuf,
        /// Number of acquisition attempts made.
        attempts: u32,
    },
}

/// Top-level error returned by lifecycle operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Bundle loading failed.
    #[error(transparent)]
    Spec(#[from] SpecError),

    /// Isolation setup failed.
    #[error(transparent)]
    Isolation(#[from] IsolationError),

    /// Cgroup management failed.
    #[error(transparent)]
    Cgroup(#[from] CgroupError),

    /// Process launch failed.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// State persistence failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// No state exists for the id.
    #[error("container {id} does not exist")]
    ContainerNotFound {
        /// Requested id.
        id: String,
    },

    /// `create` was called with an id that is already in use.
    #[error("container {id} already exists")]
    AlreadyExists {
        /// Requested id.
        id: String,
    },

    /// The operation is not allowed in the container's current status.
    #[error("cannot {operation} container {id} in status {status}")]
    InvalidTransition {
        /// Container id.
        id: String,
        /// Operation that was refused.
        operation: &'static str,
        /// Status the container was in.
        status: Status,
    },

    /// The id fails validation.
    #[error("invalid container id {id:?}: {reason}")]
    InvalidId {
        /// Rejected id.
        id: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl RuntimeError {
    /// Process exit code for this error.
    ///
    /// `1` is reserved for errors raised outside the runtime and `2` for
    /// command-line usage errors.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Spec(_) => 3,
            Self::Isolation(_) => 4,
            Self::ContainerNotFound { .. } => 5,
            Self::Cgroup(_) => 6,
            Self::Launch(_) => 7,
            Self::State(_) => 8,
            Self::AlreadyExists { .. } => 9,
            Self::InvalidTransition { .. } => 10,
            Self::InvalidId { .. } => 11,
        }
    }

    /// Short name of the component that failed, used in diagnostics.
    #[must_use]
    pub const fn component(&self) -> &'static str {
        match self {
            Self::Spec(_) => "spec",
            Self::Isolation(_) => "isolation",
            Self::Cgroup(_) => "cgroup",
            Self::Launch(_) => "launch",
            Self::State(_) => "state",
            Self::ContainerNotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::InvalidTransition { .. }
            | Self::InvalidId { .. } => "lifecycle",
        }
    }

    /// Whether retrying the same operation later could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Cgroup(CgroupError::Busy { .. }) | Self::State(StateError::Locked { .. })
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, RuntimeError>;
