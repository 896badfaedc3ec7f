//! Unified (v2) hierarchy.

use std::collections::BTreeSet;
use std::path::Path;

use runcell_common::error::CgroupError;
use runcell_common::types::ResourceLimits;

use super::{cpu, io, memory, read_file, write_file};

/// Controllers listed in the root's `cgroup.controllers`.
///
/// # Errors
///
/// Returns [`CgroupError::Io`] if the file cannot be read.
pub fn available_controllers(root: &Path) -> Result<BTreeSet<String>, CgroupError> {
    Ok(read_file(root, "cgroup.controllers")?
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect())
}

/// Enables `controllers` in every ancestor between `root` and the leaf.
///
/// Failures are logged rather than returned: the ancestors may belong to
/// someone else, and a controller that is truly missing shows up when the
/// limit is written.
pub fn enable_controllers(root: &Path, relative: &Path, controllers: &[&str]) {
    if controllers.is_empty() {
        return;
    }
    let mut dir = root.to_path_buf();
    let ancestors: Vec<_> = relative.components().collect();
    for component in &ancestors[..ancestors.len().saturating_sub(1)] {
        enable_in(&dir, controllers);
        dir.push(component);
    }
    enable_in(&dir, controllers);
}

fn enable_in(dir: &Path, controllers: &[&str]) {
    for controller in controllers {
        if let Err(e) = write_file(dir, "cgroup.subtree_control", &format!("+{controller}")) {
            tracing::warn!(
                dir = %dir.display(),
                controller,
                error = %e,
                "could not enable controller"
            );
        }
    }
}

/// Writes every set limit into `dir`.
///
/// # Errors
///
/// Returns [`CgroupError::Io`] naming the first control file that failed.
pub fn apply(dir: &Path, limits: &ResourceLimits) -> Result<(), CgroupError> {
    if limits.cpu_quota.is_some() || limits.cpu_period.is_some() {
        write_file(
            dir,
            "cpu.max",
            &cpu::format_max(limits.cpu_quota, limits.cpu_period),
        )?;
    }
    if let Some(shares) = limits.cpu_shares.filter(|s| *s > 0) {
        write_file(dir, "cpu.weight", &cpu::weight_from_shares(shares).to_string())?;
    }
    if let Some(cpus) = &limits.cpuset_cpus {
        write_file(dir, "cpuset.cpus", cpus)?;
    }
    if let Some(mems) = &limits.cpuset_mems {
        write_file(dir, "cpuset.mems", mems)?;
    }
    if let Some(limit) = limits.memory_limit {
        write_file(dir, "memory.max", &memory::format_limit(limit))?;
    }
    if let Some(reservation) = limits.memory_reservation {
        write_file(dir, "memory.low", &memory::format_limit(reservation))?;
    }
    if let (Some(swap), Some(limit)) = (limits.memory_swap, limits.memory_limit) {
        write_file(dir, "memory.swap.max", &memory::swap_max_v2(swap, limit))?;
    }
    if let Some(pids) = limits.pids_limit {
        write_file(dir, "pids.max", &memory::format_limit(pids))?;
    }
    if let Some(weight) = limits.io_weight {
        write_file(dir, "io.weight", &io::weight_from_blkio(weight).to_string())?;
    }
    Ok(())
}

/// Reads limits back from `dir`.
///
/// Weights are not converted back to their v1 scale and read as `None`.
///
/// # Errors
///
/// Returns [`CgroupError::Io`] if a present control file cannot be read.
pub fn query(dir: &Path) -> Result<ResourceLimits, CgroupError> {
    let mut limits = ResourceLimits::default();
    if let Some(line) = read_file(dir, "cpu.max")? {
        let (quota, period) = cpu::parse_max(&line);
        limits.cpu_quota = quota;
        limits.cpu_period = period;
    }
    limits.cpuset_cpus = read_file(dir, "cpuset.cpus")?.filter(|s| !s.is_empty());
    limits.cpuset_mems = read_file(dir, "cpuset.mems")?.filter(|s| !s.is_empty());
    limits.memory_limit = read_file(dir, "memory.max")?.and_then(|v| memory::parse_limit(&v));
    limits.memory_reservation =
        read_file(dir, "memory.low")?.and_then(|v| memory::parse_limit(&v));
    if let Some(limit) = limits.memory_limit {
        limits.memory_swap = read_file(dir, "memory.swap.max")?
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|swap| swap.saturating_add(limit));
    }
    limits.pids_limit = read_file(dir, "pids.max")?.and_then(|v| memory::parse_limit(&v));
    Ok(limits)
}
