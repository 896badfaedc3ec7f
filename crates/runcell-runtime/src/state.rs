//! Per-container state directories and their locks.
//!
//! Layout under the state root:
//!
//! ```text
//! <root>/<id>/state.json   container record, rewritten atomically
//! <root>/<id>/state.lock   flock guarding read-modify-write
//! <root>/<id>/exec.fifo    create/start rendezvous, gone once started
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use runcell_common::config::{RetryPolicy, RuntimeConfig};
use runcell_common::constants::{LOCK_FILE, STATE_FILE};
use runcell_common::error::{RuntimeError, StateError};
use runcell_common::types::ContainerId;

use crate::container::ContainerState;

fn io_err(path: &Path, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Exclusive lock on one container's state.
///
/// Released when dropped.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw descriptor, for forked children that must close their copy
    /// without releasing the parent's lock.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Reads and writes container records under one state root.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    lock_retry: RetryPolicy,
}

impl StateStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, lock_retry: RetryPolicy) -> Self {
        Self {
            root: root.into(),
            lock_retry,
        }
    }

    /// Creates a store from runtime configuration.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.state_root.clone(), config.lock_retry)
    }

    /// Same store with a different lock retry policy.
    #[must_use]
    pub const fn with_lock_retry(mut self, lock_retry: RetryPolicy) -> Self {
        self.lock_retry = lock_retry;
        self
    }

    /// State root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one container.
    #[must_use]
    pub fn container_dir(&self, id: &ContainerId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Claims `id` by creating its directory.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyExists`] if another container holds
    /// the id, or a [`StateError::Io`] if the directory cannot be created.
    pub fn reserve(&self, id: &ContainerId) -> Result<PathBuf, RuntimeError> {
        std::fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;
        let dir = self.container_dir(id);
        match std::fs::create_dir(&dir) {
            Ok(()) => {
                tracing::debug!(id = %id, dir = %dir.display(), "container id reserved");
                Ok(dir)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RuntimeError::AlreadyExists { id: id.to_string() })
            }
            Err(e) => Err(io_err(&dir, e).into()),
        }
    }

    /// Takes the container's exclusive lock, retrying while it is held.
    ///
    /// After locking, the lock file is checked to still be the one in the
    /// container directory, so a caller that waited on a concurrent
    /// `delete` sees the container as gone.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ContainerNotFound`] if the container does
    /// not exist (or was deleted while waiting) and
    /// [`StateError::Locked`] if the lock stayed held through every retry.
    pub fn lock(&self, id: &ContainerId) -> Result<StateLock, RuntimeError> {
        let not_found = || RuntimeError::ContainerNotFound { id: id.to_string() };
        let path = self.container_dir(id).join(LOCK_FILE);
        let file = match OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(io_err(&path, e).into()),
        };

        let attempts = self.lock_retry.attempts.max(1);
        let mut attempt = 0;
        while file.try_lock_exclusive().is_err() {
            attempt += 1;
            if attempt >= attempts {
                return Err(StateError::Locked { path, attempts }.into());
            }
            std::thread::sleep(self.lock_retry.delay_after(attempt - 1));
        }

        let held = file.metadata().map_err(|e| io_err(&path, e))?;
        match std::fs::metadata(&path) {
            Ok(current) if current.ino() == held.ino() && current.dev() == held.dev() => {}
            _ => return Err(not_found()),
        }
        Ok(StateLock { file, path })
    }

    /// Reads a container record.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ContainerNotFound`] if no record exists and
    /// [`StateError::Corrupted`] if it does not parse.
    pub fn load(&self, id: &ContainerId) -> Result<ContainerState, RuntimeError> {
        let path = self.container_dir(id).join(STATE_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuntimeError::ContainerNotFound { id: id.to_string() });
            }
            Err(e) => return Err(io_err(&path, e).into()),
        };
        serde_json::from_slice(&data).map_err(|e| {
            StateError::Corrupted {
                path,
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Rewrites a container record atomically: temp file, `fsync`, rename.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if any step fails.
    pub fn save(&self, state: &ContainerState) -> Result<(), StateError> {
        let dir = self.container_dir(&state.id);
        let path = dir.join(STATE_FILE);
        let tmp = dir.join(format!(".{STATE_FILE}.{}", uuid::Uuid::new_v4()));

        let json = serde_json::to_vec_pretty(state).map_err(|e| StateError::Corrupted {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)?;
            File::open(&dir)?.sync_all()
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }
        tracing::debug!(id = %state.id, status = %state.status, "state saved");
        Ok(())
    }

    /// Removes the container directory.
    ///
    /// The directory is first renamed out of the way, so a caller blocked
    /// in [`StateStore::lock`] never sees a half-removed container.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the rename or removal fails.
    pub fn remove(&self, id: &ContainerId) -> Result<(), StateError> {
        let dir = self.container_dir(id);
        let doomed = self.root.join(format!(".{id}.deleted.{}", uuid::Uuid::new_v4()));
        match std::fs::rename(&dir, &doomed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(&dir, e)),
        }
        std::fs::remove_dir_all(&doomed).map_err(|e| io_err(&doomed, e))?;
        tracing::debug!(id = %id, "container directory removed");
        Ok(())
    }

    /// Ids of every container directory, sorted.
    ///
    /// Entries that are not valid ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the root exists but cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerId>, StateError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root, e)),
        };
        let mut ids: Vec<ContainerId> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter_map(|name| ContainerId::parse(name).ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use runcell_common::types::Status;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"), RetryPolicy::once());
        (dir, store)
    }

    fn id(s: &str) -> ContainerId {
        ContainerId::parse(s).unwrap()
    }

    #[test]
    fn reserve_is_exclusive() {
        let (_tmp, store) = store();
        let _ = store.reserve(&id("web")).unwrap();
        assert!(matches!(
            store.reserve(&id("web")),
            Err(RuntimeError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn save_then_load() {
        let (_tmp, store) = store();
        let _ = store.reserve(&id("web")).unwrap();
        let state = ContainerState::new(id("web"), "/bundle");
        store.save(&state).unwrap();
        assert_eq!(store.load(&id("web")).unwrap(), state);

        let leftovers: Vec<_> = std::fs::read_dir(store.container_dir(&id("web")))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_and_corrupted_records() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.load(&id("ghost")),
            Err(RuntimeError::ContainerNotFound { .. })
        ));
        let dir = store.reserve(&id("bad")).unwrap();
        std::fs::write(dir.join(STATE_FILE), "{ truncated").unwrap();
        assert!(matches!(
            store.load(&id("bad")),
            Err(RuntimeError::State(StateError::Corrupted { .. }))
        ));
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let (_tmp, store) = store();
        let _ = store.reserve(&id("web")).unwrap();
        let held = store.lock(&id("web")).unwrap();
        assert!(matches!(
            store.lock(&id("web")),
            Err(RuntimeError::State(StateError::Locked { attempts: 1, .. }))
        ));
        drop(held);
        let _again = store.lock(&id("web")).unwrap();
    }

    #[test]
    fn lock_on_missing_container_is_not_found() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.lock(&id("ghost")),
            Err(RuntimeError::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn remove_then_list() {
        let (_tmp, store) = store();
        for name in ["b", "a"] {
            let _ = store.reserve(&id(name)).unwrap();
            let mut state = ContainerState::new(id(name), "/bundle");
            state.status = Status::Stopped;
            store.save(&state).unwrap();
        }
        std::fs::write(store.root().join("stray-file"), "").unwrap();
        assert_eq!(store.list().unwrap(), vec![id("a"), id("b")]);

        store.remove(&id("a")).unwrap();
        store.remove(&id("a")).unwrap();
        assert_eq!(store.list().unwrap(), vec![id("b")]);
    }

    #[test]
    fn list_of_missing_root_is_empty() {
        let (_tmp, store) = store();
        assert!(store.list().unwrap().is_empty());
    }
}
