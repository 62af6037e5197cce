//! Core primitives for the NGM request layer.
//!
//! Everything here is transport-agnostic; the HTTP executor in `ngm-client`
//! composes these pieces:
//!
//! - [`signal`] - one-shot cancellation signals and the any-of-N combinator
//! - [`cancel_group`] - named slots where starting an operation supersedes the previous one
//! - [`storage`] - the token/profile/permission key-value store
//! - [`session`] - bearer token decoding and the session guard
//! - [`submit_guard`] - double-submission protection for UI triggers
//! - [`rejection`] - process-wide reporting of unhandled async failures
//! - [`realtime`] - change-event dispatch to reconciliation actions
//!
//! Browser capabilities (toasts, navigation, buttons) are modeled as the
//! [`Notifier`], [`Navigator`] and [`Trigger`] traits and injected by the
//! application's startup routine.

pub mod cancel_group;
mod notify;
pub mod realtime;
pub mod rejection;
pub mod session;
pub mod signal;
pub mod storage;
pub mod submit_guard;

pub use cancel_group::CancelGroupRegistry;
pub use notify::{Navigator, Notifier, TracingNotifier};
pub use realtime::{ChangeDispatcher, ChangeEvent, ChangeKind, Reconcile};
pub use rejection::{Disposition, Rejection, RejectionMonitor, RejectionReporter};
pub use session::{Session, SessionError, SessionGuard, SessionState, TokenError, is_valid};
pub use signal::{CancelController, CancelReason, CancelSignal, TimerGuard, combine, deadline};
pub use storage::{FileTokenStore, MemoryTokenStore, StoreError, TokenStore};
pub use submit_guard::{Activation, DEFAULT_BUSY_LABEL, DoubleSubmitGuard, Trigger, guard};
