//! # runcell-spec
//!
//! Loads an OCI bundle (`config.json` plus a root filesystem) into an
//! immutable [`ContainerSpec`].
//!
//! - [`config`]: the OCI runtime configuration types from `oci-spec`.
//! - [`hooks`]: lifecycle hook entries.
//! - [`bundle`]: bundle lookup, version checks, validation, and path
//!   resolution.
//! - [`container`]: the validated, normalized specification consumed by the
//!   rest of the runtime.
//!
//! Loading is a pure parse: nothing on the host is modified.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod bundle;
pub mod config;
pub mod container;
pub mod hooks;

pub use bundle::{Bundle, load};
pub use container::ContainerSpec;
