//! Namespaced kernel parameters.

use std::collections::BTreeMap;
use std::path::PathBuf;

use runcell_common::error::IsolationError;

/// Path under `/proc/sys` for a dotted sysctl key.
///
/// # Errors
///
/// Returns [`IsolationError::Setup`] for empty keys or keys containing
/// path separators or empty segments.
pub fn path_for(key: &str) -> Result<PathBuf, IsolationError> {
    let valid = !key.is_empty()
        && !key.contains('/')
        && key.split('.').all(|part| !part.is_empty());
    if !valid {
        return Err(IsolationError::Setup {
            step: "sysctl",
            message: format!("invalid key {key:?}"),
        });
    }
    Ok(PathBuf::from("/proc/sys").join(key.replace('.', "/")))
}

/// Writes every parameter. Must run after `pivot_root`, with the
/// container's `/proc` mounted.
///
/// # Errors
///
/// Returns [`IsolationError::Setup`] naming the key that failed.
pub fn apply(params: &BTreeMap<String, String>) -> Result<(), IsolationError> {
    for (key, value) in params {
        let path = path_for(key)?;
        std::fs::write(&path, value).map_err(|e| IsolationError::Setup {
            step: "sysctl",
            message: format!("{key}={value}: {e}"),
        })?;
        tracing::debug!(%key, %value, "sysctl set");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_keys_map_to_proc_sys() {
        assert_eq!(
            path_for("net.ipv4.ip_forward").unwrap(),
            PathBuf::from("/proc/sys/net/ipv4/ip_forward")
        );
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for key in ["", "net..ipv4", "../../etc/passwd", "kernel."] {
            assert!(path_for(key).is_err(), "{key}");
        }
    }
}
