//! Mount namespace propagation.
//!
//! A fresh mount namespace starts as a copy of the host's, including its
//! shared peer groups. Until the root is made private (or slave), mounts
//! made for the container would leak back into the host.

use nix::mount::{MsFlags, mount};

use runcell_common::error::IsolationError;

/// Propagation flags for a `rootfsPropagation` value.
///
/// # Errors
///
/// Returns [`IsolationError::Mount`] for an unknown mode.
pub fn propagation_flags(mode: &str) -> Result<MsFlags, IsolationError> {
    let flags = match mode {
        "private" => MsFlags::MS_PRIVATE,
        "rprivate" => MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        "shared" => MsFlags::MS_SHARED,
        "rshared" => MsFlags::MS_SHARED | MsFlags::MS_REC,
        "slave" => MsFlags::MS_SLAVE,
        "rslave" => MsFlags::MS_SLAVE | MsFlags::MS_REC,
        "unbindable" => MsFlags::MS_UNBINDABLE,
        "runbindable" => MsFlags::MS_UNBINDABLE | MsFlags::MS_REC,
        other => {
            return Err(IsolationError::Mount {
                target: "/".into(),
                message: format!("unknown rootfs propagation {other:?}"),
            });
        }
    };
    Ok(flags)
}

/// Applies root mount propagation; `rprivate` when none is requested.
///
/// # Errors
///
/// Returns [`IsolationError::Mount`] if the remount fails.
pub fn set_root_propagation(mode: Option<&str>) -> Result<(), IsolationError> {
    let flags = propagation_flags(mode.unwrap_or("rprivate"))?;
    mount(None::<&str>, "/", None::<&str>, flags, None::<&str>).map_err(|e| {
        IsolationError::Mount {
            target: "/".into(),
            message: format!("setting propagation: {}", e.desc()),
        }
    })?;
    tracing::debug!(mode = mode.unwrap_or("rprivate"), "root propagation set");
    Ok(())
}
