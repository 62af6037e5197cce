//! Double-submission protection for UI actions.
//!
//! While a guarded action runs, its trigger is disabled and shows a busy
//! label; further activations are ignored. The trigger is restored when the
//! action finishes, fails, or its future is dropped mid-flight.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::notify::Notifier;
use crate::rejection::Rejection;

pub const DEFAULT_BUSY_LABEL: &str = "Saving...";

/// A clickable control: a button, a menu item, a keyboard shortcut.
pub trait Trigger: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn label(&self) -> String;
    fn set_label(&self, label: &str);
}

/// Result of one activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation<R> {
    Completed(R),
    /// The action failed; the failure was reported and absorbed.
    Failed,
    /// Another activation was still running.
    Ignored,
}

impl<R> Activation<R> {
    pub fn completed(self) -> Option<R> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Failed | Self::Ignored => None,
        }
    }
}

pub struct DoubleSubmitGuard<T, A> {
    trigger: T,
    action: A,
    notifier: Arc<dyn Notifier>,
    busy_label: String,
    busy: AtomicBool,
}

/// Bind `action` to `trigger`.
pub fn guard<T, A>(trigger: T, action: A, notifier: Arc<dyn Notifier>) -> DoubleSubmitGuard<T, A>
where
    T: Trigger,
{
    DoubleSubmitGuard {
        trigger,
        action,
        notifier,
        busy_label: DEFAULT_BUSY_LABEL.to_string(),
        busy: AtomicBool::new(false),
    }
}

impl<T, A> DoubleSubmitGuard<T, A>
where
    T: Trigger,
{
    #[must_use]
    pub fn with_busy_label(mut self, label: impl Into<String>) -> Self {
        self.busy_label = label.into();
        self
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn trigger(&self) -> &T {
        &self.trigger
    }

    /// Handle one activation of the trigger.
    pub async fn activate<Fut, R, E>(&self) -> Activation<R>
    where
        A: Fn() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<Rejection>,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Ignoring activation while busy");
            return Activation::Ignored;
        }

        let _restore = Restore::enter(&self.trigger, &self.busy, &self.busy_label);

        match (self.action)().await {
            Ok(value) => Activation::Completed(value),
            Err(e) => {
                let rejection: Rejection = e.into();
                if !rejection.is_cancellation() {
                    self.notifier.error("Error", rejection.message(), None);
                }
                Activation::Failed
            }
        }
    }
}

/// Puts the trigger back the way it was found.
struct Restore<'a, T: Trigger> {
    trigger: &'a T,
    busy: &'a AtomicBool,
    was_enabled: bool,
    label: String,
}

impl<'a, T: Trigger> Restore<'a, T> {
    fn enter(trigger: &'a T, busy: &'a AtomicBool, busy_label: &str) -> Self {
        let was_enabled = trigger.is_enabled();
        let label = trigger.label();
        trigger.set_enabled(false);
        trigger.set_label(busy_label);
        Self {
            trigger,
            busy,
            was_enabled,
            label,
        }
    }
}

impl<T: Trigger> Drop for Restore<'_, T> {
    fn drop(&mut self) {
        self.trigger.set_enabled(self.was_enabled);
        self.trigger.set_label(&self.label);
        self.busy.store(false, Ordering::SeqCst);
    }
}
