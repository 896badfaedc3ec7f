//! Process creation behind a trait, so the engine can be exercised
//! without privileges.

mod init;
mod monitor;
pub mod native;
pub mod sync;

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;

use runcell_common::error::RuntimeError;
use runcell_common::types::{ContainerId, Status};
use runcell_core::cgroup::CgroupHandle;
use runcell_core::namespace::IsolationContext;
use runcell_spec::ContainerSpec;

use crate::container::{ContainerState, OciState};
use crate::state::StateStore;

pub use native::NativeLauncher;

/// Everything needed to bring a container up to the `created` barrier.
#[derive(Debug)]
pub struct LaunchRequest {
    /// Container id.
    pub id: ContainerId,
    /// Loaded bundle.
    pub spec: ContainerSpec,
    /// Planned namespaces; its descriptors close when the request drops.
    pub isolation: IsolationContext,
    /// Cgroup the init is attached to before it runs any setup.
    pub cgroup: CgroupHandle,
    /// FIFO the init blocks on until `start`.
    pub exec_fifo: PathBuf,
    /// Store the monitor records the exit status in.
    pub store: StateStore,
    /// The caller's state lock descriptor, closed in every child.
    pub lock_fd: Option<RawFd>,
    /// Timeout for hooks that declare none.
    pub hook_timeout: Option<u32>,
}

/// Processes produced by a successful launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launched {
    /// Host pid of the container init.
    pub pid: i32,
    /// Pid of the monitor waiting on the init.
    pub monitor_pid: i32,
}

/// Creates, releases and signals container processes.
pub trait Launcher: Send + Sync {
    /// Brings a container up to the point where its init waits for
    /// [`Launcher::release`]. No container process is left behind when
    /// this fails.
    ///
    /// # Errors
    ///
    /// Returns the isolation, launch or hook error that stopped setup.
    fn launch(&self, request: LaunchRequest) -> Result<Launched, RuntimeError>;

    /// Lets the init proceed to `execve`. Once this returns `Ok` the user
    /// program owns the container.
    ///
    /// # Errors
    ///
    /// Returns a launch error if the init is no longer waiting.
    fn release(&self, exec_fifo: &Path, pid: i32) -> Result<(), RuntimeError>;

    /// Delivers `signal` to `pid`, or to its process group when `group`
    /// is set.
    ///
    /// # Errors
    ///
    /// Returns [`runcell_common::error::LaunchError::Signal`] if delivery
    /// fails for a reason other than the process being gone.
    fn signal(&self, pid: i32, signal: Signal, group: bool) -> Result<(), RuntimeError>;

    /// Whether `pid` exists and has not exited.
    fn is_alive(&self, pid: i32) -> bool;

    /// Waits in the foreground until the monitor exits, forwarding the
    /// caller's signals to the init. Returns the container's exit code.
    ///
    /// # Errors
    ///
    /// Returns a launch error if the monitor cannot be waited on.
    fn wait(&self, launched: Launched) -> Result<i32, RuntimeError>;
}

impl LaunchRequest {
    /// State document handed to hooks that run before `created` is
    /// recorded.
    fn hook_state(&self, pid: i32, status: Status) -> OciState {
        let mut state = ContainerState::new(self.id.clone(), self.spec.bundle.clone());
        state.annotations.clone_from(&self.spec.annotations);
        let mut doc = state.oci_state();
        doc.status = status;
        doc.pid = Some(pid);
        doc
    }
}
