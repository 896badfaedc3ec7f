//! UTS namespace: container hostname.

use nix::unistd::sethostname;

use runcell_common::error::IsolationError;

/// Sets the hostname of the calling process's UTS namespace.
///
/// # Errors
///
/// Returns [`IsolationError::Setup`] if `sethostname(2)` fails.
pub fn set_hostname(hostname: &str) -> Result<(), IsolationError> {
    sethostname(hostname).map_err(|e| IsolationError::Setup {
        step: "sethostname",
        message: format!("{hostname}: {}", e.desc()),
    })?;
    tracing::debug!(hostname, "hostname set");
    Ok(())
}
