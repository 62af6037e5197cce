//! One-shot cancellation signals.
//!
//! A [`CancelController`] owns the right to fire; any number of
//! [`CancelSignal`] clones observe it. Each signal is a small state machine,
//! `Pending -> Fired(reason)`, that transitions at most once. The first
//! reason wins and every observer sees that same reason.
//!
//! [`combine`] derives a signal that fires when any of its inputs fires. The
//! derived signal attaches one listener per input and detaches all of them
//! as soon as it fires or is dropped, so long-lived inputs (a cancel group
//! that outlives many requests) do not accumulate listeners.
//!
//! [`deadline`] builds a signal that fires after a wall-clock budget. The
//! timer is released when the returned [`TimerGuard`] is dropped.

use std::fmt;
use std::mem;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Why a signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The wall-clock budget elapsed.
    Timeout { budget: Duration },
    /// A newer operation took over the same cancel group.
    Superseded,
    /// Cancelled explicitly by the caller.
    Aborted,
}

impl CancelReason {
    #[must_use]
    pub const fn is_timeout(self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

type ListenerId = u64;
type Listener = Box<dyn FnOnce(CancelReason) + Send>;

enum State {
    Pending {
        listeners: Vec<(ListenerId, Listener)>,
        next_id: ListenerId,
    },
    Fired(CancelReason),
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    /// Inputs a combined signal is attached to. Empty for plain signals.
    sources: Mutex<Vec<(Weak<Shared>, ListenerId)>>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Pending {
                listeners: Vec::new(),
                next_id: 0,
            }),
            notify: Notify::new(),
            sources: Mutex::new(Vec::new()),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reason(&self) -> Option<CancelReason> {
        match &*self.state() {
            State::Fired(reason) => Some(*reason),
            State::Pending { .. } => None,
        }
    }

    /// Transition to `Fired`. Returns false if already fired.
    ///
    /// Listeners run after the state lock is released.
    fn fire(&self, reason: CancelReason) -> bool {
        let mut state = self.state();
        if matches!(*state, State::Fired(_)) {
            return false;
        }
        let previous = mem::replace(&mut *state, State::Fired(reason));
        drop(state);

        self.notify.notify_waiters();
        if let State::Pending { listeners, .. } = previous {
            for (_, listener) in listeners {
                listener(reason);
            }
        }
        self.detach_sources();
        true
    }

    /// Attach `listener`, or hand back the reason if already fired.
    fn subscribe(&self, listener: Listener) -> Result<ListenerId, CancelReason> {
        match &mut *self.state() {
            State::Fired(reason) => Err(*reason),
            State::Pending { listeners, next_id } => {
                let id = *next_id;
                *next_id += 1;
                listeners.push((id, listener));
                Ok(id)
            }
        }
    }

    fn unsubscribe(&self, id: ListenerId) {
        if let State::Pending { listeners, .. } = &mut *self.state() {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    fn detach_sources(&self) {
        let sources = mem::take(&mut *self.sources.lock().unwrap_or_else(PoisonError::into_inner));
        for (source, id) in sources {
            if let Some(source) = source.upgrade() {
                source.unsubscribe(id);
            }
        }
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        match &*self.state() {
            State::Pending { listeners, .. } => listeners.len(),
            State::Fired(_) => 0,
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.detach_sources();
    }
}

/// Read side of a cancellation source. Cheap to clone.
#[derive(Clone)]
pub struct CancelSignal {
    shared: Arc<Shared>,
}

impl CancelSignal {
    /// A signal with no controller; it never fires.
    #[must_use]
    pub fn never() -> Self {
        Self {
            shared: Shared::new(),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.reason().is_some()
    }

    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.shared.reason()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }

    /// Whether both handles observe the same underlying signal.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Write side of a cancellation source.
#[derive(Clone)]
pub struct CancelController {
    shared: Arc<Shared>,
}

impl Default for CancelController {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Shared::new(),
        }
    }

    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fire the signal. Returns false if it had already fired; the original
    /// reason is kept in that case.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.shared.fire(reason)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.reason().is_some()
    }

    /// Fire with [`CancelReason::Timeout`] after `budget`, unless the guard is
    /// dropped first. Must be called within a tokio runtime.
    pub fn cancel_after(&self, budget: Duration) -> TimerGuard {
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            if controller.cancel(CancelReason::Timeout { budget }) {
                tracing::trace!(budget_ms = budget.as_millis(), "Deadline elapsed");
            }
        });
        TimerGuard { handle }
    }
}

impl fmt::Debug for CancelController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelController")
            .field("reason", &self.shared.reason())
            .finish()
    }
}

/// Owns a pending deadline timer; dropping it releases the timer.
#[derive(Debug)]
#[must_use = "dropping the guard releases the timer immediately"]
pub struct TimerGuard {
    handle: JoinHandle<()>,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A signal that fires with [`CancelReason::Timeout`] once `budget` elapses.
pub fn deadline(budget: Duration) -> (CancelSignal, TimerGuard) {
    let controller = CancelController::new();
    let guard = controller.cancel_after(budget);
    (controller.signal(), guard)
}

/// Derive a signal that fires as soon as any of `signals` fires.
///
/// If an input has already fired, the result is returned already fired with
/// that input's reason. An empty input list yields a signal that never fires.
#[must_use]
pub fn combine(signals: &[CancelSignal]) -> CancelSignal {
    let combined = Shared::new();

    if let Some(reason) = signals.iter().find_map(CancelSignal::reason) {
        combined.fire(reason);
        return CancelSignal { shared: combined };
    }

    for signal in signals {
        let target = Arc::downgrade(&combined);
        let listener: Listener = Box::new(move |reason| {
            if let Some(target) = target.upgrade() {
                target.fire(reason);
            }
        });
        match signal.shared.subscribe(listener) {
            Ok(id) => combined
                .sources
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((Arc::downgrade(&signal.shared), id)),
            Err(reason) => {
                combined.fire(reason);
                break;
            }
        }
    }

    // An input may have fired while we were still attaching to later ones.
    if combined.reason().is_some() {
        combined.detach_sources();
    }

    CancelSignal { shared: combined }
}
