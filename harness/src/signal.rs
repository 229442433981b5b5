//! One-shot readiness values that can be awaited by many tasks.

use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// The lifecycle of a [Signal].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// No value has been resolved yet.
    Pending,
    /// Resolved with a value that never changes.
    Resolved(u16),
    /// The [Signaler] was dropped before resolving.
    Abandoned,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Transition out of [State::Pending], waking every waiter if the transition happened.
    fn settle(&self, next: State) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if *state != State::Pending {
                return false;
            }
            *state = next;
        }
        self.notify.notify_waiters();
        true
    }
}

/// A value that is resolved at most once and observed by any number of waiters.
///
/// Waiters registered before and after resolution observe the same value. If the
/// [Signaler] is dropped without resolving (for example because the process output
/// closed), every waiter is released with `None`.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<Inner>,
}

/// Resolves the [Signal]s created alongside it.
pub struct Signaler {
    inner: Arc<Inner>,
}

impl Signaler {
    /// Create a new [Signaler] and the [Signal] it resolves.
    pub fn new() -> (Self, Signal) {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::Pending),
            notify: Notify::new(),
        });
        (
            Self {
                inner: inner.clone(),
            },
            Signal { inner },
        )
    }

    /// Resolve with `value`.
    ///
    /// Returns `false` (and leaves the stored value untouched) if already resolved.
    pub fn resolve(&self, value: u16) -> bool {
        self.inner.settle(State::Resolved(value))
    }

    /// Whether a value has been resolved.
    pub fn is_resolved(&self) -> bool {
        matches!(self.inner.state(), State::Resolved(_))
    }
}

impl Drop for Signaler {
    fn drop(&mut self) {
        self.inner.settle(State::Abandoned);
    }
}

impl Signal {
    /// Create a [Signal] that is already resolved with `value`.
    pub fn resolved(value: u16) -> Self {
        let (signaler, signal) = Signaler::new();
        signaler.resolve(value);
        signal
    }

    /// The resolved value, if any, without waiting.
    pub fn get(&self) -> Option<u16> {
        match self.inner.state() {
            State::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// Wait until resolved.
    ///
    /// Returns `None` if the [Signaler] was dropped before resolving.
    pub async fn wait(&self) -> Option<u16> {
        loop {
            // Register interest before checking the state so a concurrent
            // resolve cannot slip between the check and the wait.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.state() {
                State::Resolved(value) => return Some(value),
                State::Abandoned => return None,
                State::Pending => notified.await,
            }
        }
    }
}
