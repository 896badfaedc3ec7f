//! Fork-based launcher used outside tests.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork};

use runcell_common::error::{LaunchError, RuntimeError};

use super::sync::{MonitorReport, SyncChannel};
use super::{LaunchRequest, Launched, Launcher, monitor};
use crate::reaper;

/// Launches containers through a forked monitor process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLauncher;

impl NativeLauncher {
    /// Creates the launcher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Launcher for NativeLauncher {
    fn launch(&self, request: LaunchRequest) -> Result<Launched, RuntimeError> {
        let (mut from_monitor, to_runtime) = SyncChannel::pair()?;

        // SAFETY: the runtime is single-threaded while launching; the child
        // only runs the monitor and leaves through `_exit`.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(from_monitor);
                let code = monitor::run(request, to_runtime);
                // SAFETY: terminates the forked monitor without running the
                // parent's atexit handlers or destructors twice.
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(to_runtime);
                let id = request.id.clone();
                drop(request);
                let monitor_pid = child.as_raw();
                tracing::debug!(id = %id, monitor_pid, "monitor forked");

                match from_monitor.recv::<MonitorReport>() {
                    Ok(MonitorReport::Created { pid }) => Ok(Launched { pid, monitor_pid }),
                    Ok(MonitorReport::Failed(failure)) => {
                        let _ = waitpid(child, None);
                        Err(failure.into_error())
                    }
                    Err(e) => {
                        let _ = kill(child, Signal::SIGKILL);
                        let _ = waitpid(child, None);
                        Err(e.into())
                    }
                }
            }
            Err(e) => Err(LaunchError::Fork {
                message: e.desc().to_string(),
            }
            .into()),
        }
    }

    fn release(&self, exec_fifo: &Path, pid: i32) -> Result<(), RuntimeError> {
        let fifo_err = |source| LaunchError::Fifo {
            path: exec_fifo.to_path_buf(),
            source,
        };
        // Non-blocking so an init that died leaves ENXIO instead of a hang.
        let mut fifo = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(exec_fifo)
            .map_err(|e| {
                if e.raw_os_error() == Some(libc::ENXIO) {
                    LaunchError::NotRunning { pid }
                } else {
                    fifo_err(e)
                }
            })?;
        fifo.write_all(&[0]).map_err(fifo_err)?;
        tracing::debug!(pid, "exec fifo released");
        Ok(())
    }

    fn signal(&self, pid: i32, signal: Signal, group: bool) -> Result<(), RuntimeError> {
        let send = |target: i32| kill(Pid::from_raw(target), signal);
        let result = if group {
            send(-pid).or_else(|e| if e == Errno::ESRCH { send(pid) } else { Err(e) })
        } else {
            send(pid)
        };
        match result {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(LaunchError::Signal {
                pid,
                message: e.desc().to_string(),
            }
            .into()),
        }
    }

    fn is_alive(&self, pid: i32) -> bool {
        if kill(Pid::from_raw(pid), None).is_err() {
            return false;
        }
        // A zombie still accepts signal 0.
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return true;
        };
        stat.rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_none_or(|state| state != "Z" && state != "X")
    }

    fn wait(&self, launched: Launched) -> Result<i32, RuntimeError> {
        let code = reaper::forward_until_exit(launched.monitor_pid, |sig| {
            if let Err(e) = self.signal(launched.pid, sig, false) {
                tracing::warn!(pid = launched.pid, signal = %sig, error = %e, "forwarding failed");
            }
        })?;
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_without_reader_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("exec.fifo");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();
        assert!(matches!(
            NativeLauncher.release(&fifo, 99),
            Err(RuntimeError::Launch(LaunchError::NotRunning { pid: 99 }))
        ));
    }

    #[test]
    fn release_without_fifo_is_a_fifo_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            NativeLauncher.release(&dir.path().join("missing"), 99),
            Err(RuntimeError::Launch(LaunchError::Fifo { .. }))
        ));
    }

    #[test]
    fn liveness_of_self_and_reaped_child() {
        let me = i32::try_from(std::process::id()).unwrap();
        assert!(NativeLauncher.is_alive(me));

        let child = std::process::Command::new("/bin/true").spawn().unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        let _ = reaper::wait_exit(pid).unwrap();
        assert!(!NativeLauncher.is_alive(pid));
    }
}
