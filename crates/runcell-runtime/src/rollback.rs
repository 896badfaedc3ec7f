//! Undo stack for multi-step lifecycle operations.
//!
//! Each acquired resource pushes the action that releases it. Dropping the
//! stack unwinds it in reverse order, so an early `?` return releases
//! exactly what was acquired. [`Rollback::commit`] keeps everything once
//! the operation succeeded; [`Rollback::seal`] marks the point of no return
//! after which the container is live and must not be torn down.

use runcell_common::error::RuntimeError;

type Action = Box<dyn FnOnce() -> Result<(), RuntimeError> + Send>;

/// Reverse-order undo actions.
#[derive(Default)]
pub struct Rollback {
    actions: Vec<(&'static str, Action)>,
}

impl std::fmt::Debug for Rollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.actions.iter().map(|(name, _)| name))
            .finish()
    }
}

impl Rollback {
    /// Empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the undo action for a resource just acquired.
    pub fn push<F>(&mut self, name: &'static str, undo: F)
    where
        F: FnOnce() -> Result<(), RuntimeError> + Send + 'static,
    {
        self.actions.push((name, Box::new(undo)));
    }

    /// Number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether nothing would be undone.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Keeps every resource.
    pub fn commit(mut self) {
        self.actions.clear();
    }

    /// Passes the point of no return: the container now runs user code.
    pub fn seal(mut self) {
        tracing::debug!(pending = self.actions.len(), "point of no return passed");
        self.actions.clear();
    }

    /// Runs every action, newest first. Failures are logged and do not
    /// stop the remaining actions.
    pub fn unwind(mut self) {
        self.run();
    }

    fn run(&mut self) {
        while let Some((name, undo)) = self.actions.pop() {
            match undo() {
                Ok(()) => tracing::debug!(action = name, "rolled back"),
                Err(e) => tracing::warn!(action = name, error = %e, "rollback step failed"),
            }
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        self.run();
    }
}
