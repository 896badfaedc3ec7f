//! In-memory launcher for exercising the engine without privileges.
//!
//! Fake processes get pids above the kernel's `PID_MAX_LIMIT`, so a signal
//! can never reach a real process. Their cgroup membership is written to
//! `cgroup.procs`, which only behaves as expected on a cgroup tree kept in
//! an ordinary directory.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::Signal;

use runcell_common::error::{LaunchError, RuntimeError};
use runcell_core::cgroup::CgroupHandle;

use crate::launcher::{LaunchRequest, Launched, Launcher};
use crate::signal;

const FIRST_PID: i32 = 5_000_000;

#[derive(Debug)]
struct FakeProcess {
    alive: bool,
    exit_code: Option<i32>,
    parent: Option<i32>,
    /// Init this process monitors.
    monitors: Option<i32>,
    cgroup: Option<CgroupHandle>,
    released: bool,
}

impl FakeProcess {
    fn new(parent: Option<i32>, cgroup: Option<CgroupHandle>) -> Self {
        Self {
            alive: true,
            exit_code: None,
            parent,
            monitors: None,
            cgroup,
            released: false,
        }
    }
}

/// Launcher whose processes only exist in a table.
#[derive(Debug)]
pub struct MockLauncher {
    procs: Mutex<HashMap<i32, FakeProcess>>,
    next_pid: AtomicI32,
    launch_failure: Mutex<Option<String>>,
    fail_release: AtomicBool,
    exit_code: AtomicI32,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self {
            procs: Mutex::new(HashMap::new()),
            next_pid: AtomicI32::new(FIRST_PID),
            launch_failure: Mutex::new(None),
            fail_release: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
        }
    }
}

impl MockLauncher {
    /// Creates a launcher whose launches succeed and whose programs exit 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following launch fail with `message`.
    pub fn fail_launch(&self, message: impl Into<String>) {
        if let Ok(mut failure) = self.launch_failure.lock() {
            *failure = Some(message.into());
        }
    }

    /// Makes every following release fail.
    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Exit code reported by [`Launcher::wait`] for a program that runs to
    /// completion.
    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    /// Lets the program behind `pid` exit on its own with `code`.
    ///
    /// # Errors
    ///
    /// Returns a launch error if the process table is poisoned or the
    /// cgroup cannot be rewritten.
    pub fn terminate(&self, pid: i32, code: i32) -> Result<(), RuntimeError> {
        let mut procs = self.procs()?;
        exit(&mut procs, pid, code)?;
        Ok(())
    }

    /// Forks a fake child of `parent` into the same cgroup.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::NotRunning`] if `parent` is not alive.
    pub fn spawn_descendant(&self, parent: i32) -> Result<i32, RuntimeError> {
        let mut procs = self.procs()?;
        let cgroup = match procs.get(&parent) {
            Some(process) if process.alive => process.cgroup.clone(),
            _ => return Err(LaunchError::NotRunning { pid: parent }.into()),
        };
        let pid = self.allocate();
        let _ = procs.insert(pid, FakeProcess::new(Some(parent), cgroup.clone()));
        if let Some(handle) = &cgroup {
            write_members(&procs, handle)?;
        }
        Ok(pid)
    }

    /// Whether `start` released the init behind `pid`.
    #[must_use]
    pub fn released(&self, pid: i32) -> bool {
        self.procs
            .lock()
            .is_ok_and(|procs| procs.get(&pid).is_some_and(|p| p.released))
    }

    /// Number of fake processes still alive.
    #[must_use]
    pub fn live_processes(&self) -> usize {
        self.procs
            .lock()
            .map_or(0, |procs| procs.values().filter(|p| p.alive && p.monitors.is_none()).count())
    }

    fn allocate(&self) -> i32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    fn procs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<i32, FakeProcess>>, LaunchError> {
        self.procs.lock().map_err(|_| LaunchError::Sync {
            message: "mutex poisoned".into(),
        })
    }
}

impl Launcher for MockLauncher {
    fn launch(&self, request: LaunchRequest) -> Result<Launched, RuntimeError> {
        let failure = self
            .launch_failure
            .lock()
            .map_err(|_| LaunchError::Sync {
                message: "mutex poisoned".into(),
            })?
            .clone();
        if let Some(message) = failure {
            return Err(LaunchError::Setup { message }.into());
        }
        if !request.exec_fifo.exists() {
            return Err(LaunchError::Fifo {
                path: request.exec_fifo.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }
            .into());
        }

        let mut procs = self.procs()?;
        let monitor_pid = self.allocate();
        let pid = self.allocate();
        let mut monitor = FakeProcess::new(None, None);
        monitor.monitors = Some(pid);
        let _ = procs.insert(monitor_pid, monitor);
        let _ = procs.insert(pid, FakeProcess::new(Some(monitor_pid), Some(request.cgroup.clone())));
        write_members(&procs, &request.cgroup)?;
        tracing::debug!(id = %request.id, pid, monitor_pid, "mock container launched");
        Ok(Launched { pid, monitor_pid })
    }

    fn release(&self, exec_fifo: &Path, pid: i32) -> Result<(), RuntimeError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(LaunchError::Setup {
                message: "release refused".into(),
            }
            .into());
        }
        let mut procs = self.procs()?;
        match procs.get_mut(&pid) {
            Some(process) if process.alive => {
                if !exec_fifo.exists() {
                    return Err(LaunchError::Fifo {
                        path: exec_fifo.to_path_buf(),
                        source: std::io::Error::from(std::io::ErrorKind::NotFound),
                    }
                    .into());
                }
                process.released = true;
                Ok(())
            }
            _ => Err(LaunchError::NotRunning { pid }.into()),
        }
    }

    fn signal(&self, pid: i32, sig: Signal, group: bool) -> Result<(), RuntimeError> {
        if matches!(
            sig,
            Signal::SIGCONT | Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
        ) || signal::is_local(sig)
        {
            return Ok(());
        }
        let mut procs = self.procs()?;
        let mut targets = vec![pid];
        if group {
            let mut i = 0;
            while let Some(&parent) = targets.get(i) {
                targets.extend(
                    procs
                        .iter()
                        .filter(|(_, p)| p.alive && p.parent == Some(parent))
                        .map(|(child, _)| *child),
                );
                i += 1;
            }
        }
        for target in targets {
            if procs.get(&target).is_some_and(|p| p.alive) {
                exit(&mut procs, target, signal::killed_by(sig))?;
            }
        }
        Ok(())
    }

    fn is_alive(&self, pid: i32) -> bool {
        let Ok(procs) = self.procs.lock() else {
            return false;
        };
        match procs.get(&pid) {
            Some(FakeProcess {
                monitors: Some(init), ..
            }) => procs.get(init).is_some_and(|p| p.alive),
            Some(process) => process.alive,
            None => false,
        }
    }

    fn wait(&self, launched: Launched) -> Result<i32, RuntimeError> {
        let mut procs = self.procs()?;
        if procs.get(&launched.pid).is_some_and(|p| p.alive) {
            let code = self.exit_code.load(Ordering::SeqCst);
            exit(&mut procs, launched.pid, code)?;
        }
        procs
            .get(&launched.pid)
            .and_then(|p| p.exit_code)
            .ok_or_else(|| LaunchError::NotRunning { pid: launched.monitor_pid }.into())
    }
}

fn exit(procs: &mut HashMap<i32, FakeProcess>, pid: i32, code: i32) -> Result<(), RuntimeError> {
    let Some(process) = procs.get_mut(&pid) else {
        return Ok(());
    };
    process.alive = false;
    process.exit_code = Some(code);
    if let Some(handle) = process.cgroup.clone() {
        write_members(procs, &handle)?;
    }
    Ok(())
}

/// Rewrites `cgroup.procs` with the live fake processes in `handle`.
fn write_members(procs: &HashMap<i32, FakeProcess>, handle: &CgroupHandle) -> Result<(), RuntimeError> {
    let mut members: Vec<i32> = procs
        .iter()
        .filter(|(_, p)| p.alive && p.cgroup.as_ref() == Some(handle))
        .map(|(pid, _)| *pid)
        .collect();
    members.sort_unstable();
    let contents = members.iter().map(i32::to_string).collect::<Vec<_>>().join("\n");
    for dir in handle.dirs() {
        if dir.is_dir() {
            std::fs::write(dir.join("cgroup.procs"), &contents).map_err(|e| LaunchError::Setup {
                message: format!("writing {}: {e}", dir.display()),
            })?;
        }
    }
    Ok(())
}
