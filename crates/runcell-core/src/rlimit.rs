//! POSIX resource limits and OOM score for the container process.

use nix::sys::resource::{Resource, setrlimit};

use runcell_common::error::IsolationError;
use runcell_spec::container::Rlimit;

/// Maps an `RLIMIT_*` name to the kernel resource.
#[must_use]
pub fn resource(name: &str) -> Option<Resource> {
    let resource = match name {
        "RLIMIT_AS" => Resource::RLIMIT_AS,
        "RLIMIT_CORE" => Resource::RLIMIT_CORE,
        "RLIMIT_CPU" => Resource::RLIMIT_CPU,
        "RLIMIT_DATA" => Resource::RLIMIT_DATA,
        "RLIMIT_FSIZE" => Resource::RLIMIT_FSIZE,
        "RLIMIT_LOCKS" => Resource::RLIMIT_LOCKS,
        "RLIMIT_MEMLOCK" => Resource::RLIMIT_MEMLOCK,
        "RLIMIT_MSGQUEUE" => Resource::RLIMIT_MSGQUEUE,
        "RLIMIT_NICE" => Resource::RLIMIT_NICE,
        "RLIMIT_NOFILE" => Resource::RLIMIT_NOFILE,
        "RLIMIT_NPROC" => Resource::RLIMIT_NPROC,
        "RLIMIT_RSS" => Resource::RLIMIT_RSS,
        "RLIMIT_RTPRIO" => Resource::RLIMIT_RTPRIO,
        "RLIMIT_RTTIME" => Resource::RLIMIT_RTTIME,
        "RLIMIT_SIGPENDING" => Resource::RLIMIT_SIGPENDING,
        "RLIMIT_STACK" => Resource::RLIMIT_STACK,
        _ => return None,
    };
    Some(resource)
}

/// Checks names and soft/hard ordering without applying anything.
///
/// # Errors
///
/// Returns [`IsolationError::Setup`] for an unknown name or a soft limit
/// above the hard limit.
pub fn validate(rlimits: &[Rlimit]) -> Result<(), IsolationError> {
    for limit in rlimits {
        if resource(&limit.kind).is_none() {
            return Err(IsolationError::Setup {
                step: "rlimits",
                message: format!("unknown resource limit {}", limit.kind),
            });
        }
        if limit.soft > limit.hard {
            return Err(IsolationError::Setup {
                step: "rlimits",
                message: format!(
                    "{}: soft limit {} exceeds hard limit {}",
                    limit.kind, limit.soft, limit.hard
                ),
            });
        }
    }
    Ok(())
}

/// Applies every limit to the calling process.
///
/// # Errors
///
/// Returns [`IsolationError::Setup`] if a name is unknown or
/// `setrlimit(2)` fails.
pub fn apply(rlimits: &[Rlimit]) -> Result<(), IsolationError> {
    validate(rlimits)?;
    for limit in rlimits {
        let Some(res) = resource(&limit.kind) else {
            continue;
        };
        setrlimit(res, limit.soft, limit.hard).map_err(|e| IsolationError::Setup {
            step: "rlimits",
            message: format!("{}: {}", limit.kind, e.desc()),
        })?;
    }
    Ok(())
}

/// Writes `/proc/self/oom_score_adj`.
///
/// # Errors
///
/// Returns [`IsolationError::Setup`] if the write fails.
pub fn set_oom_score_adj(score: i32) -> Result<(), IsolationError> {
    std::fs::write("/proc/self/oom_score_adj", score.to_string()).map_err(|e| {
        IsolationError::Setup {
            step: "oom_score_adj",
            message: e.to_string(),
        }
    })
}
