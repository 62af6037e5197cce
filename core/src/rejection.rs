//! Process-wide reporting of async failures nothing else handled.
//!
//! Failures travel over a single channel to one monitor task. The monitor
//! drops cancellations (they are expected control flow), rate-limits the
//! rest to one notification per [`REPORT_INTERVAL`], and considers every
//! received failure handled.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use ngm_types::take_chars;

use crate::notify::Notifier;

/// Minimum gap between two surfaced notifications.
pub const REPORT_INTERVAL: Duration = Duration::from_millis(5000);
/// Longest message shown to the user.
pub const MAX_MESSAGE_CHARS: usize = 100;

const NOTIFICATION_TITLE: &str = "Unexpected Error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    message: String,
    cancellation: bool,
}

impl Rejection {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cancellation: false,
        }
    }

    pub fn cancellation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cancellation: true,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        self.cancellation
    }
}

impl From<String> for Rejection {
    fn from(message: String) -> Self {
        Self::failure(message)
    }
}

impl From<&str> for Rejection {
    fn from(message: &str) -> Self {
        Self::failure(message)
    }
}

/// What the monitor did with one rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Cancellation; never shown.
    Ignored,
    /// Shown through the notifier.
    Reported,
    /// Logged only; a notification went out less than [`REPORT_INTERVAL`] ago.
    Suppressed,
}

pub struct RejectionMonitor {
    notifier: Arc<dyn Notifier>,
    last_report: Option<Instant>,
}

impl RejectionMonitor {
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            last_report: None,
        }
    }

    pub fn handle(&mut self, rejection: &Rejection) -> Disposition {
        if rejection.is_cancellation() {
            tracing::debug!(message = rejection.message(), "Ignoring cancelled operation");
            return Disposition::Ignored;
        }

        tracing::error!(message = rejection.message(), "Unhandled async failure");

        let now = Instant::now();
        if self
            .last_report
            .is_some_and(|last| now.duration_since(last) <= REPORT_INTERVAL)
        {
            return Disposition::Suppressed;
        }

        self.notifier.error(
            NOTIFICATION_TITLE,
            take_chars(rejection.message(), MAX_MESSAGE_CHARS),
            None,
        );
        self.last_report = Some(now);
        Disposition::Reported
    }

    /// Spawn the monitor task. Call once at startup, inside a tokio runtime.
    ///
    /// The task ends when every [`RejectionReporter`] clone is dropped.
    pub fn start(notifier: Arc<dyn Notifier>) -> (RejectionReporter, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Rejection>();
        let mut monitor = Self::new(notifier);
        let handle = tokio::spawn(async move {
            while let Some(rejection) = rx.recv().await {
                monitor.handle(&rejection);
            }
            tracing::debug!("Rejection monitor stopped");
        });
        (RejectionReporter { tx }, handle)
    }
}

/// Sending half of the monitor channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RejectionReporter {
    tx: mpsc::UnboundedSender<Rejection>,
}

impl RejectionReporter {
    pub fn report(&self, rejection: impl Into<Rejection>) {
        if self.tx.send(rejection.into()).is_err() {
            tracing::warn!("Rejection monitor is not running; dropping report");
        }
    }

    /// Run `task` in the background, forwarding its error or panic to the monitor.
    pub fn spawn<F, E>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Rejection> + Send + 'static,
    {
        let reporter = self.clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => reporter.report(e),
                Err(panic) => reporter.report(Rejection::failure(panic_message(panic.as_ref()))),
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "background task panicked".to_string()
    }
}
