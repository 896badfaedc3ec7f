//! # runcell-runtime
//!
//! Container lifecycle management for the runcell runtime.
//!
//! The [`engine::Engine`] drives the `creating → created → running →
//! stopped → deleted` state machine. It persists one
//! [`container::ContainerState`] per container through the
//! [`state::StateStore`], places containers in cgroups through
//! `runcell-core`, and hands process creation to a [`launcher::Launcher`].
//! The native launcher forks a per-container monitor that stays in the
//! host namespaces, reaps the container init and records its exit.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod engine;
pub mod hooks;
pub mod launcher;
pub mod mock;
pub mod reaper;
pub mod rollback;
pub mod signal;
pub mod state;
