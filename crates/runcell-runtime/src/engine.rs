//! Runtime engine that drives the container lifecycle.
//!
//! Every operation takes the container's state lock, reloads its record,
//! and persists each transition before returning. Process creation and
//! signalling go through the injected [`Launcher`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::sys::stat::Mode;

use runcell_common::config::RuntimeConfig;
use runcell_common::constants::EXEC_FIFO;
use runcell_common::error::{LaunchError, RuntimeError, StateError};
use runcell_common::types::{ContainerId, ResourceLimits, Status};
use runcell_core::cgroup::{CgroupHandle, CgroupManager};
use runcell_core::namespace::{HostCapabilities, IsolationContext};
use runcell_spec::hooks::HookPoint;

use crate::container::ContainerState;
use crate::hooks;
use crate::launcher::{LaunchRequest, Launched, Launcher, NativeLauncher};
use crate::reaper::SignalBlock;
use crate::rollback::Rollback;
use crate::signal;
use crate::state::{StateLock, StateStore};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Options for `create` and `run`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// File that receives the init's host pid once the container is created.
    pub pid_file: Option<PathBuf>,
}

/// The runtime engine that coordinates all container operations.
pub struct Engine {
    config: RuntimeConfig,
    store: StateStore,
    cgroups: CgroupManager,
    launcher: Arc<dyn Launcher>,
    host: HostCapabilities,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with the fork-based launcher and the detected host.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_parts(config, Arc::new(NativeLauncher::new()), HostCapabilities::detect())
    }

    /// Creates an engine from explicit parts.
    #[must_use]
    pub fn with_parts(config: RuntimeConfig, launcher: Arc<dyn Launcher>, host: HostCapabilities) -> Self {
        Self {
            store: StateStore::from_config(&config),
            cgroups: CgroupManager::from_config(&config),
            config,
            launcher,
            host,
        }
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Creates a container from the bundle at `bundle` and leaves its init
    /// waiting for [`Engine::start`].
    ///
    /// On failure every acquired resource is released and the record is
    /// kept as `failed` until it is deleted.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyExists`] if the id is taken, or the
    /// spec, isolation, cgroup, launch or state error that stopped creation.
    pub fn create(
        &self,
        id: &ContainerId,
        bundle: &Path,
        options: &CreateOptions,
    ) -> Result<ContainerState, RuntimeError> {
        let _ = self.store.reserve(id)?;
        let lock = match self.store.lock(id) {
            Ok(lock) => lock,
            Err(e) => {
                let _ = self.store.remove(id);
                return Err(e);
            }
        };

        let bundle = bundle.canonicalize().unwrap_or_else(|_| bundle.to_path_buf());
        let mut state = ContainerState::new(id.clone(), bundle);
        self.store.save(&state)?;
        tracing::info!(id = %id, bundle = %state.bundle.display(), "creating container");

        if let Err(e) = self.build(&mut state, &lock, options) {
            state.fail();
            if let Err(save_err) = self.store.save(&state) {
                tracing::warn!(id = %id, error = %save_err, "cannot record failed create");
            }
            tracing::error!(id = %id, error = %e, "create failed");
            return Err(e);
        }
        tracing::info!(id = %id, pid = ?state.pid, "container created");
        Ok(state)
    }

    fn build(
        &self,
        state: &mut ContainerState,
        lock: &StateLock,
        options: &CreateOptions,
    ) -> Result<(), RuntimeError> {
        let spec = runcell_spec::load(&state.bundle)?;
        state.bundle.clone_from(&spec.bundle);
        state.rootfs = Some(spec.rootfs.clone());
        state.annotations.clone_from(&spec.annotations);
        self.store.save(state)?;

        if spec.process.terminal {
            tracing::warn!(id = %state.id, "terminal requested; the container inherits the caller's stdio");
        }
        let isolation = IsolationContext::plan(&spec, &self.host)?;

        let mut rollback = Rollback::new();
        let handle = self.cgroups.create(
            state.id.as_str(),
            spec.cgroups_path.as_deref().map(Path::new),
            &spec.resources,
        )?;
        let cgroups = self.cgroups.clone();
        let created = handle.clone();
        rollback.push("destroy cgroup", move || Ok(cgroups.destroy(&created)?));
        state.cgroup_path = Some(handle.relative().to_path_buf());
        self.store.save(state)?;

        let exec_fifo = self.store.container_dir(&state.id).join(EXEC_FIFO);
        nix::unistd::mkfifo(&exec_fifo, Mode::from_bits_truncate(0o600)).map_err(|e| LaunchError::Fifo {
            path: exec_fifo.clone(),
            source: e.into(),
        })?;

        let launched = self.launcher.launch(LaunchRequest {
            id: state.id.clone(),
            spec,
            isolation,
            cgroup: handle,
            exec_fifo,
            store: self.store.clone(),
            lock_fd: Some(lock.as_raw_fd()),
            hook_timeout: self.config.default_hook_timeout_secs,
        })?;
        let launcher = Arc::clone(&self.launcher);
        rollback.push("kill init", move || launcher.signal(launched.pid, Signal::SIGKILL, true));

        state.pid = Some(launched.pid);
        state.monitor_pid = Some(launched.monitor_pid);
        state.transition(Status::Created, "create")?;
        self.store.save(state)?;
        if let Some(path) = &options.pid_file {
            write_pid_file(path, launched.pid)?;
        }
        rollback.commit();
        Ok(())
    }

    /// Releases a created container's init into the user program.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidTransition`] unless the container is
    /// `created`, and [`LaunchError::NotRunning`] (leaving it `failed`) if
    /// its init is gone.
    pub fn start(&self, id: &ContainerId) -> Result<ContainerState, RuntimeError> {
        let _lock = self.store.lock(id)?;
        let mut state = self.store.load(id)?;
        let pid = match (state.status, state.pid) {
            (Status::Created, Some(pid)) => pid,
            (status, _) => {
                return Err(RuntimeError::InvalidTransition {
                    id: id.to_string(),
                    operation: "start",
                    status,
                });
            }
        };

        let exec_fifo = self.store.container_dir(id).join(EXEC_FIFO);
        let mut rollback = Rollback::new();
        let launcher = Arc::clone(&self.launcher);
        rollback.push("kill init", move || launcher.signal(pid, Signal::SIGKILL, true));

        let released = if self.launcher.is_alive(pid) {
            self.launcher.release(&exec_fifo, pid)
        } else {
            Err(LaunchError::NotRunning { pid }.into())
        };
        if let Err(e) = released {
            rollback.unwind();
            state.fail();
            self.store.save(&state)?;
            tracing::error!(id = %id, pid, error = %e, "start failed");
            return Err(e);
        }
        rollback.seal();

        state.transition(Status::Running, "start")?;
        self.store.save(&state)?;
        if let Err(e) = std::fs::remove_file(&exec_fifo) {
            tracing::debug!(id = %id, error = %e, "exec fifo already gone");
        }
        tracing::info!(id = %id, pid, "container started");

        self.run_hooks(&state, HookPoint::Poststart);
        Ok(state)
    }

    /// Sends `sig` to the container's init process group.
    ///
    /// With `SIGKILL` or `all`, every process in the container's cgroup is
    /// signalled too and the call waits, up to the configured kill timeout,
    /// for them to disappear.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidTransition`] if the container has no
    /// process, or a launch error if delivery fails.
    pub fn kill(&self, id: &ContainerId, sig: Signal, all: bool) -> Result<(), RuntimeError> {
        let lock = self.store.lock(id)?;
        let mut state = self.store.load(id)?;
        if self.reconcile(&mut state) {
            self.store.save(&state)?;
        }
        let pid = match state.pid {
            Some(pid) if state.status.has_process() => pid,
            _ => {
                return Err(RuntimeError::InvalidTransition {
                    id: id.to_string(),
                    operation: "kill",
                    status: state.status,
                });
            }
        };
        let handle = self.cgroup_handle(&state)?;

        self.launcher.signal(pid, sig, true)?;
        tracing::info!(id = %id, pid, signal = %sig, "signal delivered");
        if sig == Signal::SIGKILL || all {
            if let Some(handle) = &handle {
                self.sweep(handle, sig)?;
            }
            drop(lock);
            if !self.wait_gone(pid, handle.as_ref(), sig == Signal::SIGKILL) {
                tracing::debug!(id = %id, "processes still present after kill timeout");
            }
        } else {
            drop(lock);
        }

        // The monitor records the exit itself unless it is gone too.
        let monitor_gone = state.monitor_pid.is_none_or(|m| !self.launcher.is_alive(m));
        if monitor_gone && !self.launcher.is_alive(pid) {
            let _lock = self.store.lock(id)?;
            let mut state = self.store.load(id)?;
            if state.pid == Some(pid) && state.record_exit(Some(signal::killed_by(sig))) {
                self.store.save(&state)?;
            }
        }
        Ok(())
    }

    /// Removes a container and everything it owns.
    ///
    /// Stopped, failed and created containers are deleted directly; a
    /// running one needs `force`, which kills it first.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ContainerNotFound`] if there is nothing to
    /// delete and [`RuntimeError::InvalidTransition`] for a running
    /// container without `force`.
    pub fn delete(&self, id: &ContainerId, force: bool) -> Result<(), RuntimeError> {
        let _lock = self.store.lock(id)?;
        let mut state = match self.store.load(id) {
            Ok(state) => state,
            Err(RuntimeError::ContainerNotFound { .. }) => {
                // Reserved, never recorded.
                self.store.remove(id)?;
                tracing::info!(id = %id, "removed empty container directory");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let _ = self.reconcile(&mut state);
        let handle = self.cgroup_handle(&state)?;

        if state.status.has_process() {
            if state.status == Status::Running && !force {
                return Err(RuntimeError::InvalidTransition {
                    id: id.to_string(),
                    operation: "delete",
                    status: state.status,
                });
            }
            if let Some(pid) = state.pid {
                self.launcher.signal(pid, Signal::SIGKILL, true)?;
                if let Some(handle) = &handle {
                    self.sweep(handle, Signal::SIGKILL)?;
                }
                if !self.wait_gone(pid, handle.as_ref(), true) {
                    tracing::warn!(id = %id, pid, "container processes outlived the kill timeout");
                }
            }
            let _ = state.record_exit(Some(signal::killed_by(Signal::SIGKILL)));
        }

        if state.pid.is_some() {
            self.run_hooks(&state, HookPoint::Poststop);
        }
        if let Some(handle) = &handle
            && let Err(e) = self.cgroups.destroy(handle)
        {
            tracing::warn!(id = %id, error = %e, "cgroup left behind");
        }
        self.store.remove(id)?;
        tracing::info!(id = %id, "container deleted");
        Ok(())
    }

    /// Current record of a container, reconciled with the processes that
    /// actually exist.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ContainerNotFound`] if the container does
    /// not exist, or a state error if its record cannot be read.
    pub fn state(&self, id: &ContainerId) -> Result<ContainerState, RuntimeError> {
        let _lock = self.store.lock(id)?;
        let mut state = self.store.load(id)?;
        if self.reconcile(&mut state) {
            self.store.save(&state)?;
        }
        Ok(state)
    }

    /// Every container under the state root, sorted by id.
    ///
    /// A container whose lock stays busy is listed from its last saved
    /// record.
    ///
    /// # Errors
    ///
    /// Returns a state error if the state root cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerState>, RuntimeError> {
        let mut states = Vec::new();
        for id in self.store.list()? {
            match self.state(&id) {
                Ok(state) => states.push(state),
                Err(RuntimeError::ContainerNotFound { .. }) => {}
                Err(RuntimeError::State(StateError::Locked { .. })) => {
                    if let Ok(state) = self.store.load(&id) {
                        states.push(state);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(states)
    }

    /// Limits currently applied to the container's cgroup.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidTransition`] if the container never
    /// got a cgroup, or a cgroup error if the control files cannot be read.
    pub fn limits(&self, id: &ContainerId) -> Result<ResourceLimits, RuntimeError> {
        let _lock = self.store.lock(id)?;
        let state = self.store.load(id)?;
        let Some(handle) = self.cgroup_handle(&state)? else {
            return Err(RuntimeError::InvalidTransition {
                id: id.to_string(),
                operation: "limits",
                status: state.status,
            });
        };
        Ok(self.cgroups.query(&handle)?)
    }

    /// Creates and starts a container, waits in the foreground for it to
    /// exit while forwarding signals, then deletes it.
    ///
    /// Returns the container's exit code.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing step; the container is deleted
    /// whenever it got past `create`.
    pub fn run(&self, id: &ContainerId, bundle: &Path, options: &CreateOptions) -> Result<i32, RuntimeError> {
        let _block = SignalBlock::all()?;
        let state = self.create(id, bundle, options)?;
        let (Some(pid), Some(monitor_pid)) = (state.pid, state.monitor_pid) else {
            return Err(LaunchError::Sync {
                message: "created container has no pid".into(),
            }
            .into());
        };

        if let Err(e) = self.start(id) {
            if let Err(delete_err) = self.delete(id, true) {
                tracing::warn!(id = %id, error = %delete_err, "cleanup after failed start");
            }
            return Err(e);
        }

        let exited = self.launcher.wait(Launched { pid, monitor_pid });
        if let Err(e) = self.delete(id, true) {
            tracing::warn!(id = %id, error = %e, "cleanup after exit");
        }
        let code = exited?;
        tracing::info!(id = %id, exit_code = code, "container exited");
        Ok(code)
    }

    /// Updates a record whose processes disappeared behind the runtime's
    /// back. Only valid while holding the container's lock.
    fn reconcile(&self, state: &mut ContainerState) -> bool {
        match state.status {
            // `create` holds the lock until it leaves `creating`.
            Status::Creating => {
                state.fail();
                true
            }
            Status::Created | Status::Running => {
                let alive = |pid: Option<i32>| pid.is_some_and(|p| self.launcher.is_alive(p));
                if alive(state.pid) || alive(state.monitor_pid) {
                    return false;
                }
                tracing::info!(id = %state.id, "container processes are gone");
                state.record_exit(state.exit_code)
            }
            _ => false,
        }
    }

    fn cgroup_handle(&self, state: &ContainerState) -> Result<Option<CgroupHandle>, RuntimeError> {
        Ok(state
            .cgroup_path
            .as_deref()
            .map(|path| self.cgroups.open(path))
            .transpose()?)
    }

    fn sweep(&self, handle: &CgroupHandle, sig: Signal) -> Result<(), RuntimeError> {
        for pid in handle.procs()? {
            self.launcher.signal(pid, sig, false)?;
        }
        Ok(())
    }

    /// Waits until the init is dead and the cgroup is empty, re-sweeping
    /// the cgroup when `resweep` is set to catch late forks.
    fn wait_gone(&self, pid: i32, handle: Option<&CgroupHandle>, resweep: bool) -> bool {
        let deadline = Instant::now() + self.config.kill_timeout();
        loop {
            let empty = handle.is_none_or(|h| h.procs().is_ok_and(|procs| procs.is_empty()));
            if empty && !self.launcher.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if resweep && let Some(handle) = handle {
                let _ = self.sweep(handle, Signal::SIGKILL);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn run_hooks(&self, state: &ContainerState, point: HookPoint) {
        let spec = match runcell_spec::load(&state.bundle) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(id = %state.id, %point, error = %e, "cannot reload bundle for hooks");
                return;
            }
        };
        let timeout = self.config.default_hook_timeout_secs;
        if let Err(e) = hooks::run_hooks(&spec.hooks, point, &state.oci_state(), timeout) {
            tracing::warn!(id = %state.id, %point, error = %e, "hooks failed");
        }
    }
}

fn write_pid_file(path: &Path, pid: i32) -> Result<(), StateError> {
    std::fs::write(path, pid.to_string()).map_err(|source| StateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::fs;

    use crate::mock::MockLauncher;

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: Engine,
        launcher: Arc<MockLauncher>,
        bundle: PathBuf,
    }

    fn fixture(config: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cgroup_root = dir.path().join("cgroup");
        fs::create_dir_all(&cgroup_root).unwrap();
        fs::write(cgroup_root.join("cgroup.controllers"), "cpuset cpu io memory pids").unwrap();
        let bundle = dir.path().join("bundle");
        fs::create_dir_all(bundle.join("rootfs")).unwrap();
        fs::write(bundle.join("config.json"), config).unwrap();

        let runtime = RuntimeConfig::default()
            .with_state_root(dir.path().join("state"))
            .with_cgroup_root(cgroup_root);
        let launcher = Arc::new(MockLauncher::new());
        let host = HostCapabilities {
            euid: 0,
            egid: 0,
            namespaces: HashSet::new(),
        };
        let engine = Engine::with_parts(runtime, launcher.clone(), host);
        Fixture {
            _dir: dir,
            engine,
            launcher,
            bundle,
        }
    }

    const CONFIG: &str = r#"{
        "ociVersion": "1.2.0",
        "root": {"path": "rootfs"},
        "process": {"args": ["/bin/true"], "cwd": "/"},
        "linux": {"namespaces": [{"type": "mount"}]}
    }"#;

    fn id(s: &str) -> ContainerId {
        ContainerId::parse(s).unwrap()
    }

    #[test]
    fn unsupported_namespace_fails_create_and_keeps_record() {
        let fx = fixture(CONFIG);
        let err = fx.engine.create(&id("c1"), &fx.bundle, &CreateOptions::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::Isolation(_)), "{err}");
        assert_eq!(fx.engine.state(&id("c1")).unwrap().status, Status::Failed);
        assert_eq!(fx.launcher.live_processes(), 0);
    }

    #[test]
    fn pid_file_holds_init_pid() {
        let mut fx = fixture(CONFIG);
        let _ = fx.engine.host.namespaces.insert(runcell_spec::config::LinuxNamespaceType::Mount);
        let pid_file = fx.bundle.join("init.pid");
        let options = CreateOptions {
            pid_file: Some(pid_file.clone()),
        };
        let state = fx.engine.create(&id("c1"), &fx.bundle, &options).unwrap();
        let written: i32 = fs::read_to_string(pid_file).unwrap().parse().unwrap();
        assert_eq!(Some(written), state.pid);
    }

    #[test]
    fn reconcile_stops_created_container_whose_init_died() {
        let mut fx = fixture(CONFIG);
        let _ = fx.engine.host.namespaces.insert(runcell_spec::config::LinuxNamespaceType::Mount);
        let state = fx.engine.create(&id("c1"), &fx.bundle, &CreateOptions::default()).unwrap();
        fx.launcher.terminate(state.pid.unwrap(), 0).unwrap();
        let state = fx.engine.state(&id("c1")).unwrap();
        assert_eq!(state.status, Status::Stopped);
        assert!(state.finished.is_some());
    }
}
