//! Named cancel groups.
//!
//! A recurring operation ("loadExpenses", "searchVendors") asks the registry
//! for a signal each time it starts. Starting it again cancels the previous
//! run's signal before the new one is handed out, so a slow earlier response
//! can never overwrite the result of a newer request.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::signal::{CancelController, CancelReason, CancelSignal};

/// Maps a group key to the controller of its current operation.
///
/// The lock is never held across an `.await` and listeners of a superseded
/// signal run after the lock is released.
#[derive(Debug, Default)]
pub struct CancelGroupRegistry {
    controllers: Mutex<HashMap<String, CancelController>>,
}

impl CancelGroupRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn controllers(&self) -> MutexGuard<'_, HashMap<String, CancelController>> {
        self.controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new operation under `key`.
    ///
    /// Any previous signal for `key` is cancelled with
    /// [`CancelReason::Superseded`] before this returns.
    pub fn begin(&self, key: &str) -> CancelSignal {
        debug_assert!(!key.is_empty(), "cancel group key must not be empty");

        let controller = CancelController::new();
        let signal = controller.signal();
        let previous = self.controllers().insert(key.to_string(), controller);

        if let Some(previous) = previous
            && previous.cancel(CancelReason::Superseded)
        {
            tracing::debug!(group = key, "Superseded in-flight operation");
        }
        signal
    }

    /// Abort the current operation under `key`, if any.
    ///
    /// Returns true if a pending operation was cancelled.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.controllers().remove(key);
        removed.is_some_and(|controller| controller.cancel(CancelReason::Aborted))
    }

    /// Abort every group. Used at teardown.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.controllers().drain().collect();
        let count = drained.len();
        for (_, controller) in drained {
            controller.cancel(CancelReason::Aborted);
        }
        if count > 0 {
            tracing::debug!(count, "Cancelled all operation groups");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.controllers().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controllers().is_empty()
    }
}
