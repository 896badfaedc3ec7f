//! The per-container monitor.
//!
//! Forked by the runtime at `create`, the monitor leaves the caller's
//! session, becomes a child subreaper and stays in the host namespaces.
//! It drives the children through setup, reports the outcome to the
//! runtime, then blocks until the init exits and records the exit code.

use nix::sys::prctl;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork, setsid};

use runcell_common::config::RetryPolicy;
use runcell_common::error::{LaunchError, RuntimeError};
use runcell_common::types::Status;
use runcell_core::namespace::user;
use runcell_spec::config::LinuxNamespaceType;
use runcell_spec::hooks::HookPoint;

use super::LaunchRequest;
use super::init;
use super::sync::{Failure, MonitorReport, SyncChannel, SyncMessage};
use crate::{hooks, reaper};

/// The runtime may hold the state lock for the whole of `create`, `start`
/// or `delete`, so the exit is recorded with a much longer wait.
const EXIT_LOCK_RETRY: RetryPolicy = RetryPolicy {
    attempts: 600,
    initial_delay_ms: 5,
    max_delay_ms: 100,
};

/// Runs the monitor and returns its exit code.
pub(super) fn run(request: LaunchRequest, mut report: SyncChannel) -> i32 {
    if let Some(fd) = request.lock_fd {
        // SAFETY: closes this process's copy of the runtime's lock
        // descriptor, which nothing here uses. Closing (not unlocking)
        // keeps the runtime's flock intact.
        let _ = unsafe { libc::close(fd) };
    }
    let _ = reaper::unblock_all();
    let _ = setsid();
    if let Err(e) = prctl::set_child_subreaper(true) {
        tracing::warn!(error = %e, "cannot become child subreaper");
    }

    let (mut chan, child_chan) = match SyncChannel::pair() {
        Ok(pair) => pair,
        Err(e) => return fail(&mut report, &e.into()),
    };

    // SAFETY: the monitor is single-threaded; the child leaves through
    // `_exit`.
    let intermediate = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(chan);
            drop(report);
            let code = init::intermediate(&request, child_chan);
            // SAFETY: ends the forked intermediate without unwinding.
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            let err = LaunchError::Fork {
                message: e.desc().to_string(),
            };
            return fail(&mut report, &err.into());
        }
    };
    drop(child_chan);

    let mut init_pid = None;
    let pid = match setup(&request, &mut chan, intermediate, &mut init_pid) {
        Ok(pid) => pid,
        Err(e) => {
            if let Some(pid) = init_pid {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                let _ = waitpid(Pid::from_raw(pid), None);
            }
            let _ = kill(intermediate, Signal::SIGKILL);
            let _ = waitpid(intermediate, None);
            return fail(&mut report, &e);
        }
    };

    if let Err(e) = report.send(&MonitorReport::Created { pid }) {
        tracing::warn!(id = %request.id, error = %e, "runtime went away before create finished");
    }
    drop(report);
    drop(chan);

    let code = reaper::wait_exit(pid).unwrap_or_else(|e| {
        tracing::warn!(id = %request.id, pid, error = %e, "lost track of container init");
        255
    });
    record_exit(&request, pid, code);
    code
}

fn fail(report: &mut SyncChannel, err: &RuntimeError) -> i32 {
    tracing::debug!(error = %err, "container setup failed");
    let _ = report.send(&MonitorReport::Failed(Failure::from_error(err)));
    1
}

fn setup(
    request: &LaunchRequest,
    chan: &mut SyncChannel,
    intermediate: Pid,
    init_pid: &mut Option<i32>,
) -> Result<i32, RuntimeError> {
    let isolation = &request.isolation;
    if isolation.creates(LinuxNamespaceType::User) {
        chan.expect(&SyncMessage::MappingRequest)?;
        user::write_id_mappings(
            intermediate.as_raw(),
            isolation.uid_mappings(),
            isolation.gid_mappings(),
            isolation.is_rootless(),
        )?;
        chan.send(&SyncMessage::MappingDone)?;
    }

    let pid = match chan.recv_sync()? {
        SyncMessage::InitPid { pid } => pid,
        other => {
            return Err(LaunchError::Sync {
                message: format!("expected init pid, got {other:?}"),
            }
            .into());
        }
    };
    *init_pid = Some(pid);
    // Once the intermediate is gone the init is reparented here.
    let _ = reaper::wait_exit(intermediate.as_raw());

    request.cgroup.add_process(pid)?;
    chan.send(&SyncMessage::Attached { pid })?;

    chan.expect(&SyncMessage::MountsReady)?;
    hooks::run_hooks(
        &request.spec.hooks,
        HookPoint::CreateRuntime,
        &request.hook_state(pid, Status::Creating),
        request.hook_timeout,
    )?;
    chan.send(&SyncMessage::HooksDone)?;

    chan.expect(&SyncMessage::Ready)?;
    tracing::debug!(id = %request.id, pid, "container init parked on exec fifo");
    Ok(pid)
}

fn record_exit(request: &LaunchRequest, pid: i32, code: i32) {
    let store = request.store.clone().with_lock_retry(EXIT_LOCK_RETRY);
    let recorded = (|| -> Result<bool, RuntimeError> {
        let _lock = store.lock(&request.id)?;
        let mut state = store.load(&request.id)?;
        if state.pid != Some(pid) || !state.record_exit(Some(code)) {
            return Ok(false);
        }
        store.save(&state)?;
        Ok(true)
    })();
    match recorded {
        Ok(true) => tracing::info!(id = %request.id, pid, exit_code = code, "container exited"),
        Ok(false) => tracing::debug!(id = %request.id, pid, "exit already accounted for"),
        Err(RuntimeError::ContainerNotFound { .. }) => {
            tracing::debug!(id = %request.id, "container deleted before exit was recorded");
        }
        Err(e) => tracing::warn!(id = %request.id, error = %e, "failed to record exit"),
    }
}
