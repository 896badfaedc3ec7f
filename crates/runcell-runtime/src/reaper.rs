//! Exit reaping and foreground signal forwarding.

use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use runcell_common::error::LaunchError;

use crate::signal;

/// Blocks every signal on the calling thread until dropped.
///
/// Taken before a foreground container is created, so no `SIGCHLD` or
/// terminal signal is lost between fork and [`forward_until_exit`].
#[derive(Debug)]
pub struct SignalBlock {
    previous: SigSet,
}

impl SignalBlock {
    /// Blocks all signals, remembering the previous mask.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Setup`] if the mask cannot be changed.
    pub fn all() -> Result<Self, LaunchError> {
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), Some(&mut previous))
            .map_err(|e| LaunchError::Setup {
                message: format!("blocking signals: {}", e.desc()),
            })?;
        Ok(Self { previous })
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

/// Clears the signal mask inherited across `fork`.
///
/// # Errors
///
/// Returns the errno if the mask cannot be changed.
pub fn unblock_all() -> nix::Result<()> {
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
}

/// Blocks until `pid` exits and returns its normalised exit code.
///
/// # Errors
///
/// Returns [`LaunchError::NotRunning`] if `pid` is not a child of the
/// caller.
pub fn wait_exit(pid: i32) -> Result<i32, LaunchError> {
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(status) => {
                if let Some(code) = signal::exit_code(status) {
                    tracing::debug!(pid, code, "child exited");
                    return Ok(code);
                }
            }
            Err(Errno::EINTR) => {}
            Err(_) => return Err(LaunchError::NotRunning { pid }),
        }
    }
}

/// Waits for the monitor with every signal blocked, forwarding each
/// received signal through `forward` except `SIGCHLD`, `SIGURG` and
/// `SIGWINCH`. Returns the monitor's exit code, which is the container's.
///
/// The caller must hold a [`SignalBlock`].
///
/// # Errors
///
/// Returns [`LaunchError::NotRunning`] if the monitor is not a child of
/// the caller.
pub fn forward_until_exit<F>(monitor: i32, mut forward: F) -> Result<i32, LaunchError>
where
    F: FnMut(Signal),
{
    let waited = SigSet::all();
    loop {
        match waitpid(Pid::from_raw(monitor), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
            Ok(status) => {
                if let Some(code) = signal::exit_code(status) {
                    return Ok(code);
                }
            }
            Err(_) => return Err(LaunchError::NotRunning { pid: monitor }),
        }

        match waited.wait() {
            Ok(sig) if signal::is_local(sig) => {}
            Ok(sig) => {
                tracing::debug!(signal = %sig, "forwarding signal to container");
                forward(sig);
            }
            Err(e) => tracing::debug!(error = %e, "sigwait returned no signal"),
        }
    }
}
