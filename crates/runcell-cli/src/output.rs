//! Formatted output helpers for CLI commands.
//!
//! Provides the one-line error diagnostic, exit code mapping, and the
//! `list` table.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use runcell_common::error::RuntimeError;
use runcell_common::types::Status;
use runcell_runtime::container::ContainerState;

/// Exit code for failures raised outside the runtime.
pub const GENERIC_EXIT: u8 = 1;

/// Exit code for command-line usage errors.
pub const USAGE_EXIT: u8 = 2;

/// Formats `runcell: <component> error [container <id>]: <message>`.
#[must_use]
pub fn diagnostic(err: &anyhow::Error, id: Option<&str>) -> String {
    let Some(runtime) = err.downcast_ref::<RuntimeError>() else {
        return format!("runcell: error: {err:#}");
    };
    match id {
        Some(id) => format!("runcell: {} error [container {id}]: {runtime}", runtime.component()),
        None => format!("runcell: {} error: {runtime}", runtime.component()),
    }
}

/// Process exit code for a failed command.
#[must_use]
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<RuntimeError>()
        .and_then(|e| u8::try_from(e.exit_code()).ok())
        .unwrap_or(GENERIC_EXIT)
}

/// One row of `runcell list`.
#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    /// Container id.
    pub id: String,
    /// Init pid while the container has a process.
    pub pid: Option<i32>,
    /// Lifecycle status.
    pub status: Status,
    /// Bundle directory.
    pub bundle: PathBuf,
    /// When the container was created.
    pub created: DateTime<Utc>,
}

impl From<&ContainerState> for ListEntry {
    fn from(state: &ContainerState) -> Self {
        let doc = state.oci_state();
        Self {
            id: doc.id,
            pid: doc.pid,
            status: doc.status,
            bundle: doc.bundle,
            created: state.created,
        }
    }
}

/// Renders entries as aligned columns with a header.
#[must_use]
pub fn format_table(entries: &[ListEntry]) -> String {
    let width = entries.iter().map(|e| e.id.len()).max().unwrap_or(0).max(2);
    let mut out = format!(
        "{:<width$}  {:<8} {:<9} {:<20} {}\n",
        "ID", "PID", "STATUS", "CREATED", "BUNDLE"
    );
    for e in entries {
        out.push_str(&format!(
            "{:<width$}  {:<8} {:<9} {:<20} {}\n",
            e.id,
            e.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
            e.status.as_str(),
            e.created.format("%Y-%m-%dT%H:%M:%SZ"),
            e.bundle.display()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use runcell_common::error::{CgroupError, StateError};
    use runcell_common::types::ContainerId;

    #[test]
    fn diagnostic_names_component_and_container() {
        let err = anyhow::Error::from(RuntimeError::ContainerNotFound { id: "web".into() });
        let line = diagnostic(&err, Some("web"));
        assert!(line.starts_with("runcell: lifecycle error [container web]: "), "{line}");
        assert_eq!(exit_code(&err), 5);
    }

    #[test]
    fn diagnostic_without_container() {
        let err = anyhow::Error::from(RuntimeError::State(StateError::Locked {
            path: PathBuf::from("/run/runcell/web/state.lock"),
            attempts: 3,
        }));
        assert!(diagnostic(&err, None).starts_with("runcell: state error: "));
        assert_eq!(exit_code(&err), 8);
    }

    #[test]
    fn foreign_errors_are_generic() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(diagnostic(&err, Some("web")), "runcell: error: boom");
        assert_eq!(exit_code(&err), GENERIC_EXIT);
    }

    #[test]
    fn cgroup_errors_map_to_six() {
        let err = anyhow::Error::from(RuntimeError::Cgroup(CgroupError::Unavailable {
            root: PathBuf::from("/sys/fs/cgroup"),
        }));
        assert_eq!(exit_code(&err), 6);
    }

    #[test]
    fn invalid_id_is_not_reported_as_a_duplicate() {
        let invalid = anyhow::Error::from(ContainerId::parse("../etc").unwrap_err());
        let duplicate = anyhow::Error::from(RuntimeError::AlreadyExists { id: "web".into() });
        assert_eq!(exit_code(&invalid), 11);
        assert_eq!(exit_code(&duplicate), 9);
    }

    #[test]
    fn table_has_header_and_rows() {
        let entries = vec![ListEntry {
            id: "web".into(),
            pid: Some(42),
            status: Status::Running,
            bundle: PathBuf::from("/bundles/web"),
            created: DateTime::<Utc>::UNIX_EPOCH,
        }];
        let table = format_table(&entries);
        let mut lines = table.lines();
        assert!(lines.next().unwrap().starts_with("ID"));
        let row = lines.next().unwrap();
        assert!(row.contains("42"));
        assert!(row.contains("running"));
        assert!(row.contains("1970-01-01T00:00:00Z"));
    }
}
