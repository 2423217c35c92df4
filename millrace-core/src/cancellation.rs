//! Cooperative cancellation.
//!
//! A [CancelToken] is handed to every blocking primitive at construction: ports select on
//! the token's signal channel next to their data channel, condition-variable based
//! primitives register a wake-up. Once cancelled, every blocked call returns with a
//! cancelled outcome, which is distinct from end-of-stream or a closed port.
use std::{
    convert::Infallible,
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
};

use indexmap::IndexMap;
use tracing::debug;

type WakeUp = Box<dyn Fn() + Send + Sync>;

struct Inner {
    cancelled: AtomicBool,
    // dropping the trigger disconnects `signal`, which wakes every selector waiting on it
    trigger: Mutex<Option<flume::Sender<Infallible>>>,
    signal: flume::Receiver<Infallible>,
    wake_ups: Mutex<IndexMap<u64, WakeUp>>,
    next_wake_up: AtomicU64,
    // entry in the parent's wake-ups, removed when the last clone of a child goes away
    parent: Mutex<Option<WakeUpRegistration>>,
}

/// Cloneable cancellation signal. All clones observe the same state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a new token, which is not cancelled
    pub fn new() -> Self {
        let (trigger, signal) = flume::bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
                wake_ups: Mutex::new(IndexMap::new()),
                next_wake_up: AtomicU64::new(0),
                parent: Mutex::new(None),
            }),
        }
    }

    /// Create a token which is cancelled whenever this token is cancelled, but which can
    /// also be cancelled on its own without affecting this token.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let weak: Weak<Inner> = Arc::downgrade(&child.inner);
        let registration = self.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                CancelToken { inner }.cancel();
            }
        });
        *child
            .inner
            .parent
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(registration);
        child
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Cancellation requested");
        // the locks are only held for take/drain, a poisoned lock still holds valid data
        drop(
            self.inner
                .trigger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let wake_ups = std::mem::take(
            &mut *self
                .inner
                .wake_ups
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for wake in wake_ups.into_values() {
            wake();
        }
    }

    /// True if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Channel which disconnects when the token is cancelled. Meant to be used in a
    /// [flume::Selector] next to the channel a call is blocking on.
    pub(crate) fn signal(&self) -> &flume::Receiver<Infallible> {
        &self.inner.signal
    }

    /// Register a function to run once when the token gets cancelled.
    /// If the token is already cancelled the function runs immediately.
    ///
    /// The function stays registered until the returned registration is dropped.
    pub(crate) fn on_cancel(&self, wake: impl Fn() + Send + Sync + 'static) -> WakeUpRegistration {
        {
            let mut wake_ups = self
                .inner
                .wake_ups
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.is_cancelled() {
                let id = self.inner.next_wake_up.fetch_add(1, Ordering::Relaxed);
                wake_ups.insert(id, Box::new(wake));
                return WakeUpRegistration {
                    token: Arc::downgrade(&self.inner),
                    id,
                };
            }
        }
        wake();
        WakeUpRegistration {
            token: Weak::new(),
            id: 0,
        }
    }

    /// Number of wake-ups currently waiting for cancellation
    #[cfg(test)]
    pub(crate) fn registered_wake_ups(&self) -> usize {
        self.inner
            .wake_ups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Keeps a wake-up registered with a [CancelToken]. Dropping it removes the wake-up.
#[must_use]
pub(crate) struct WakeUpRegistration {
    token: Weak<Inner>,
    id: u64,
}

impl Drop for WakeUpRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.token.upgrade() {
            // dropped outside the lock
            let _removed = inner
                .wake_ups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .shift_remove(&self.id);
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
