//! Runtime configuration model.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for a runcell runtime instance.
///
/// One instance of the runtime owns one state root; every container it
/// manages keeps its state directory underneath it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Directory holding one sub-directory per container.
    pub state_root: PathBuf,
    /// Mount point of the cgroup filesystem.
    pub cgroup_root: PathBuf,
    /// Parent cgroup for containers without an explicit `cgroupsPath`.
    pub cgroup_parent: String,
    /// Backoff used when removing a cgroup that still has tasks.
    pub teardown_retry: RetryPolicy,
    /// Backoff used when a container's state lock is contended.
    pub lock_retry: RetryPolicy,
    /// How long `kill` waits for the container's processes to vanish.
    pub kill_timeout_ms: u64,
    /// Timeout applied to hooks that do not declare their own.
    pub default_hook_timeout_secs: Option<u32>,
}

impl RuntimeConfig {
    /// Builds the default configuration for the given effective uid.
    #[must_use]
    pub fn for_euid(euid: u32) -> Self {
        Self {
            state_root: constants::default_state_root(euid),
            ..Self::default()
        }
    }

    /// Returns the same configuration with another state root.
    #[must_use]
    pub fn with_state_root(mut self, state_root: impl Into<PathBuf>) -> Self {
        self.state_root = state_root.into();
        self
    }

    /// Returns the same configuration with another cgroup root.
    #[must_use]
    pub fn with_cgroup_root(mut self, cgroup_root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = cgroup_root.into();
        self
    }

    /// Kill wait timeout as a [`Duration`].
    #[must_use]
    pub const fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(constants::SYSTEM_STATE_ROOT),
            cgroup_root: PathBuf::from(constants::CGROUP_ROOT),
            cgroup_parent: constants::CGROUP_PARENT.to_string(),
            teardown_retry: RetryPolicy::default(),
            lock_retry: RetryPolicy {
                attempts: 50,
                initial_delay_ms: 5,
                max_delay_ms: 100,
            },
            kill_timeout_ms: 2_000,
            default_hook_timeout_secs: None,
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// A policy that tries once and never sleeps.
    #[must_use]
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay to sleep after the given zero-based failed attempt.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay_ms: 20,
            max_delay_ms: 500,
        }
    }
}
