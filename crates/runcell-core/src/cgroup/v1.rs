//! Legacy (v1) hierarchies, one mount per controller.

use std::path::Path;

use runcell_common::error::CgroupError;
use runcell_common::types::ResourceLimits;

use super::{CgroupHandle, memory, read_file, write_file};

/// Controller directories this runtime manages under a v1 root.
pub const CONTROLLERS: [&str; 5] = ["cpu", "cpuset", "memory", "pids", "blkio"];

/// Maps a v2 controller name to its v1 directory.
#[must_use]
pub fn controller_dir(controller: &str) -> &str {
    match controller {
        "io" => "blkio",
        other => other,
    }
}

/// Copies `cpuset.cpus` and `cpuset.mems` down from the nearest ancestor
/// into every empty level. A v1 cpuset refuses tasks until both are set.
///
/// # Errors
///
/// Returns [`CgroupError::Io`] if a cpuset file cannot be copied.
pub fn inherit_cpuset(cpuset_root: &Path, relative: &Path) -> Result<(), CgroupError> {
    let mut parent = cpuset_root.to_path_buf();
    for component in relative.components() {
        let child = parent.join(component);
        for name in ["cpuset.cpus", "cpuset.mems"] {
            let current = read_file(&child, name)?.unwrap_or_default();
            if current.is_empty()
                && let Some(value) = read_file(&parent, name)?.filter(|v| !v.is_empty())
            {
                write_file(&child, name, &value)?;
            }
        }
        parent = child;
    }
    Ok(())
}

/// Writes every set limit into the controller directories of `handle`.
///
/// # Errors
///
/// Returns [`CgroupError::Io`] naming the first control file that failed.
pub fn apply(handle: &CgroupHandle, limits: &ResourceLimits) -> Result<(), CgroupError> {
    let cpu = handle.dir("cpu");
    if let Some(period) = limits.cpu_period {
        write_file(&cpu, "cpu.cfs_period_us", &period.to_string())?;
    }
    if let Some(quota) = limits.cpu_quota {
        let quota = if quota > 0 { quota } else { -1 };
        write_file(&cpu, "cpu.cfs_quota_us", &quota.to_string())?;
    }
    if let Some(shares) = limits.cpu_shares.filter(|s| *s > 0) {
        write_file(&cpu, "cpu.shares", &shares.to_string())?;
    }

    let cpuset = handle.dir("cpuset");
    if let Some(cpus) = &limits.cpuset_cpus {
        write_file(&cpuset, "cpuset.cpus", cpus)?;
    }
    if let Some(mems) = &limits.cpuset_mems {
        write_file(&cpuset, "cpuset.mems", mems)?;
    }

    let mem = handle.dir("memory");
    if let Some(limit) = limits.memory_limit {
        write_file(&mem, "memory.limit_in_bytes", &memory::format_limit_v1(limit))?;
    }
    if let Some(reservation) = limits.memory_reservation {
        write_file(
            &mem,
            "memory.soft_limit_in_bytes",
            &memory::format_limit_v1(reservation),
        )?;
    }
    if let Some(swap) = limits.memory_swap {
        write_file(&mem, "memory.memsw.limit_in_bytes", &memory::format_limit_v1(swap))?;
    }

    if let Some(pids) = limits.pids_limit {
        write_file(&handle.dir("pids"), "pids.max", &memory::format_limit(pids))?;
    }
    if let Some(weight) = limits.io_weight {
        write_file(&handle.dir("blkio"), "blkio.weight", &weight.to_string())?;
    }
    Ok(())
}

/// Reads limits back from the controller directories of `handle`.
///
/// # Errors
///
/// Returns [`CgroupError::Io`] if a present control file cannot be read.
pub fn query(handle: &CgroupHandle) -> Result<ResourceLimits, CgroupError> {
    let cpu = handle.dir("cpu");
    let cpuset = handle.dir("cpuset");
    let mem = handle.dir("memory");
    Ok(ResourceLimits {
        cpu_shares: read_file(&cpu, "cpu.shares")?.and_then(|v| v.parse().ok()),
        cpu_quota: read_file(&cpu, "cpu.cfs_quota_us")?
            .and_then(|v| v.parse().ok())
            .filter(|q: &i64| *q > 0),
        cpu_period: read_file(&cpu, "cpu.cfs_period_us")?.and_then(|v| v.parse().ok()),
        cpuset_cpus: read_file(&cpuset, "cpuset.cpus")?.filter(|s| !s.is_empty()),
        cpuset_mems: read_file(&cpuset, "cpuset.mems")?.filter(|s| !s.is_empty()),
        memory_limit: read_file(&mem, "memory.limit_in_bytes")?
            .and_then(|v| memory::parse_limit(&v)),
        memory_reservation: read_file(&mem, "memory.soft_limit_in_bytes")?
            .and_then(|v| memory::parse_limit(&v)),
        memory_swap: read_file(&mem, "memory.memsw.limit_in_bytes")?
            .and_then(|v| memory::parse_limit(&v)),
        pids_limit: read_file(&handle.dir("pids"), "pids.max")?
            .and_then(|v| memory::parse_limit(&v)),
        io_weight: read_file(&handle.dir("blkio"), "blkio.weight")?.and_then(|v| v.parse().ok()),
    })
}
