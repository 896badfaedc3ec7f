//! Persistent container record and the OCI state document.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use runcell_common::constants::OCI_VERSION;
use runcell_common::error::RuntimeError;
use runcell_common::types::{ContainerId, Status};

/// Everything the runtime remembers about one container.
///
/// Stored as `<state root>/<id>/state.json` and rewritten atomically on
/// every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// OCI runtime specification version of this document.
    pub oci_version: String,
    /// Container id.
    pub id: ContainerId,
    /// Lifecycle status.
    pub status: Status,
    /// Host pid of the container init.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Absolute bundle directory.
    pub bundle: PathBuf,
    /// Resolved root filesystem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,
    /// Bundle annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// When `create` began.
    pub created: DateTime<Utc>,
    /// When `start` released the init.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// When the exit was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Normalised exit status: the exit code, or `128 + signal`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Pid of the monitor that waits on the init.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_pid: Option<i32>,
    /// Cgroup path relative to the cgroup root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup_path: Option<PathBuf>,
}

impl ContainerState {
    /// Fresh record in the `creating` status.
    #[must_use]
    pub fn new(id: ContainerId, bundle: impl Into<PathBuf>) -> Self {
        Self {
            oci_version: OCI_VERSION.to_string(),
            id,
            status: Status::Creating,
            pid: None,
            bundle: bundle.into(),
            rootfs: None,
            annotations: BTreeMap::new(),
            created: Utc::now(),
            started: None,
            finished: None,
            exit_code: None,
            monitor_pid: None,
            cgroup_path: None,
        }
    }

    /// Moves to `target` if the state machine allows it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidTransition`] naming `operation`.
    pub fn transition(&mut self, target: Status, operation: &'static str) -> Result<(), RuntimeError> {
        if !self.status.can_transition_to(target) {
            return Err(RuntimeError::InvalidTransition {
                id: self.id.to_string(),
                operation,
                status: self.status,
            });
        }
        tracing::info!(id = %self.id, from = %self.status, to = %target, "status transition");
        self.status = target;
        match target {
            Status::Running => self.started = Some(Utc::now()),
            Status::Stopped | Status::Failed => self.finished = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Records an exit and moves to `stopped`.
    ///
    /// Returns `false`, leaving the record untouched, when the current
    /// status cannot stop (already stopped, failed, or still creating).
    pub fn record_exit(&mut self, exit_code: Option<i32>) -> bool {
        if self.transition(Status::Stopped, "stop").is_err() {
            return false;
        }
        self.exit_code = exit_code;
        true
    }

    /// Marks the record failed if it is not already terminal or failed.
    pub fn fail(&mut self) {
        if self.status.can_transition_to(Status::Failed) {
            let _ = self.transition(Status::Failed, "fail");
        }
    }

    /// The OCI state document for this record.
    #[must_use]
    pub fn oci_state(&self) -> OciState {
        OciState {
            oci_version: self.oci_version.clone(),
            id: self.id.to_string(),
            status: self.status,
            pid: self.pid.filter(|_| self.status.has_process()),
            bundle: self.bundle.clone(),
            annotations: self.annotations.clone(),
        }
    }
}

/// State document defined by the OCI runtime specification.
///
/// Printed by `state` and passed to hooks on stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciState {
    /// Specification version.
    pub oci_version: String,
    /// Container id.
    pub id: String,
    /// Lifecycle status.
    pub status: Status,
    /// Init pid while a process exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Absolute bundle directory.
    pub bundle: PathBuf,
    /// Bundle annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}
