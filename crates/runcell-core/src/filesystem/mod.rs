//! Filesystem setup for container isolation.
//!
//! Mount table preparation, default `/dev` population, and secure root
//! filesystem switching via `pivot_root(2)`.

pub mod devices;
pub mod mount;
pub mod pivot_root;
