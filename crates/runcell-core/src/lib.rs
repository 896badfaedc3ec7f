//! # runcell-core
//!
//! Low-level Linux isolation primitives for the runcell runtime.
//!
//! - **Namespaces**: host capability detection and the ordered
//!   [`namespace::IsolationContext`] the launcher enters.
//! - **Filesystem**: rootfs preparation, spec mounts, masked and
//!   read-only paths, and `pivot_root`.
//! - **Cgroups**: one [`cgroup::CgroupManager`] over the legacy (v1) and
//!   unified (v2) hierarchies.
//! - **Process attributes**: capabilities, rlimits, and sysctls applied
//!   by the container init before it executes the user program.
//!
//! Every syscall wrapper returns a typed error from `runcell-common` and
//! documents its `unsafe` blocks with `// SAFETY:` comments. Functions that
//! change namespaces, mounts, or credentials act on the calling process
//! and are only meant to run in the forked container children.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

#[cfg(not(target_os = "linux"))]
compile_error!("runcell only supports Linux");

pub mod capability;
pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod rlimit;
pub mod sysctl;
