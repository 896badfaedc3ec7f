//! Domain primitive types used across the runcell workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_ID_LEN;
use crate::error::RuntimeError;

/// Unique, validated identifier for a container instance.
///
/// Ids become directory names under the state root and cgroup path
/// components, so they are restricted to `[A-Za-z0-9][A-Za-z0-9_.-]*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Validates and wraps a container id.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidId`] if the id is empty, too long,
    /// or contains characters outside the allowed set.
    pub fn parse(id: impl Into<String>) -> Result<Self, RuntimeError> {
        let id = id.into();
        let reason = if id.is_empty() {
            Some("id is empty")
        } else if id.len() > MAX_ID_LEN {
            Some("id is too long")
        } else if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            Some("id must start with an ASCII letter or digit")
        } else if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            Some("id may only contain letters, digits, '_', '.' and '-'")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(RuntimeError::InvalidId {
                id,
                reason: reason.to_string(),
            }),
            None => Ok(Self(id)),
        }
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContainerId {
    type Error = RuntimeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl FromStr for ContainerId {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a container.
///
/// ```text
/// creating -> created -> running -> stopped -> deleted
///     \          \          \          \
///      `----------`----------`----------`--> failed -> deleted
/// ```
///
/// `created -> stopped` is also allowed: the init may die (or be killed)
/// before `start` releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Resources are being acquired by `create`.
    Creating,
    /// The init is parked on the exec FIFO, waiting for `start`.
    Created,
    /// The user process has been released.
    Running,
    /// The container process has exited.
    Stopped,
    /// A lifecycle operation failed; only `delete` leaves this state.
    Failed,
    /// The container has been removed. Terminal.
    Deleted,
}

impl Status {
    /// Returns the lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }

    /// Whether the state machine allows moving from `self` to `target`.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Creating, Self::Created)
                | (Self::Created, Self::Running | Self::Stopped)
                | (Self::Running, Self::Stopped)
                | (Self::Stopped | Self::Failed, Self::Deleted)
                | (
                    Self::Creating | Self::Created | Self::Running | Self::Stopped,
                    Self::Failed
                )
        )
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Whether a container in this status may still own a live process.
    #[must_use]
    pub const fn has_process(self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource limits for a container, in the units of the OCI runtime spec.
///
/// `-1` in the signed fields means "unlimited".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU shares (relative weight, cgroup v1 scale 2..=262144).
    pub cpu_shares: Option<u64>,
    /// CPU bandwidth quota in microseconds per period.
    pub cpu_quota: Option<i64>,
    /// CPU bandwidth period in microseconds.
    pub cpu_period: Option<u64>,
    /// CPUs the container may run on (cpuset list syntax).
    pub cpuset_cpus: Option<String>,
    /// Memory nodes the container may allocate from.
    pub cpuset_mems: Option<String>,
    /// Hard memory limit in bytes.
    pub memory_limit: Option<i64>,
    /// Soft memory limit in bytes.
    pub memory_reservation: Option<i64>,
    /// Memory plus swap limit in bytes.
    pub memory_swap: Option<i64>,
    /// Maximum number of tasks.
    pub pids_limit: Option<i64>,
    /// Block I/O weight (10..=1000, cgroup v1 scale).
    pub io_weight: Option<u16>,
}

impl ResourceLimits {
    /// Returns `true` when no limit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
