use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak},
    thread::{self, ThreadId},
};

use thiserror::Error;
use tracing::debug;

use crate::cancellation::{CancelToken, WakeUpRegistration};

/// Errors raised by shared container operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SharedError {
    /// Execution was cancelled while waiting
    #[error("Shared container operation cancelled")]
    Cancelled,
    /// The other side closed the container while this side was waiting on it
    #[error("The other side closed the shared container")]
    PeerClosed,
    /// The calling thread already holds the lock of this container
    #[error("Shared container locked twice from the same thread")]
    Reentrant,
    /// The producer tried to lock the container before setting an object
    #[error("No object was set on the shared container yet")]
    Empty,
    /// A thread panicked while holding the lock, the object may be inconsistent
    #[error("Shared container poisoned by a panic while locked")]
    Poisoned,
}

/// How strictly the "updated" / "processed" marks are enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeMode {
    /// Marks alternate: `mark_updated` waits until the previous round was processed and
    /// `mark_processed` waits until the current round was marked updated
    #[default]
    Strict,
    /// Marks never block, they only flip the flag and count rounds. The consumer may skip
    /// or see a version twice.
    Relaxed,
}

/// Handshake counters of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeStats {
    /// How often the producer marked the object updated
    pub rounds_published: u64,
    /// How often the consumer marked the object processed
    pub rounds_processed: u64,
}

#[derive(Debug)]
struct State {
    present: bool,
    updated: bool,
    held: Option<ThreadId>,
    producer_open: bool,
    consumer_open: bool,
    stats: HandshakeStats,
}

/// Synchronization part of a container, independent of the object type
struct Handshake {
    mode: HandshakeMode,
    state: Mutex<State>,
    changed: Condvar,
    cancel: CancelToken,
    // deregisters from the token once the container is gone
    _wake_up: WakeUpRegistration,
}

/// Holds the object once the producer set the first one
type Slot<T> = OnceLock<Mutex<T>>;

impl Handshake {
    fn lock(&self) -> Result<MutexGuard<'_, State>, SharedError> {
        self.state.lock().map_err(|_| SharedError::Poisoned)
    }

    /// Block until `ready` holds, cancellation or a peer closing (signalled by `ready`
    /// returning an error)
    fn wait_until<'a>(
        &'a self,
        mut state: MutexGuard<'a, State>,
        mut ready: impl FnMut(&State) -> Result<bool, SharedError>,
    ) -> Result<MutexGuard<'a, State>, SharedError> {
        loop {
            // checked under the lock, the cancel wake-up takes the lock before notifying
            if self.cancel.is_cancelled() {
                return Err(SharedError::Cancelled);
            }
            if ready(&state)? {
                return Ok(state);
            }
            state = self
                .changed
                .wait(state)
                .map_err(|_| SharedError::Poisoned)?;
        }
    }

    /// Wait for the lock to be free and take it for the current thread
    fn acquire(
        &self,
        mut ready: impl FnMut(&State) -> Result<bool, SharedError>,
    ) -> Result<(), SharedError> {
        let me = thread::current().id();
        let state = self.lock()?;
        let mut state = self.wait_until(state, |s| {
            if s.held == Some(me) {
                return Err(SharedError::Reentrant);
            }
            Ok(s.held.is_none() && ready(s)?)
        })?;
        state.held = Some(me);
        Ok(())
    }

    fn release(&self) {
        // must not fail, this runs in Drop
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.held = None;
        self.changed.notify_all();
    }

    fn stats(&self) -> HandshakeStats {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
    }
}

/// Open a shared container.
///
/// Returns the producer and consumer handle. The container lives until both handles are
/// closed or dropped. Every blocking call returns [SharedError::Cancelled] once `cancel`
/// is cancelled.
pub fn shared_container<T: Send + 'static>(
    mode: HandshakeMode,
    cancel: &CancelToken,
) -> (SharedProducer<T>, SharedConsumer<T>) {
    let handshake = Arc::new_cyclic(|weak: &Weak<Handshake>| {
        let weak = weak.clone();
        // waiters check the token under the state lock, taking it here avoids a lost wake-up
        let wake_up = cancel.on_cancel(move || {
            if let Some(handshake) = weak.upgrade() {
                let _state = handshake.state.lock().unwrap_or_else(PoisonError::into_inner);
                handshake.changed.notify_all();
            }
        });
        Handshake {
            mode,
            state: Mutex::new(State {
                present: false,
                updated: false,
                held: None,
                producer_open: true,
                consumer_open: true,
                stats: HandshakeStats::default(),
            }),
            changed: Condvar::new(),
            cancel: cancel.clone(),
            _wake_up: wake_up,
        }
    });
    let slot = Arc::new(OnceLock::new());
    (
        SharedProducer {
            handshake: Arc::clone(&handshake),
            slot: Arc::clone(&slot),
            closed: false,
        },
        SharedConsumer {
            handshake,
            slot,
            closed: false,
        },
    )
}

/// Exclusive access to the shared object, released on drop
struct Held<'a, T> {
    handshake: &'a Handshake,
    object: MutexGuard<'a, T>,
}

impl<'a, T> Held<'a, T> {
    /// Lock the object. Must be called with the handshake acquired, which is released
    /// again if the object is missing or poisoned.
    fn take(handshake: &'a Handshake, slot: &'a Slot<T>) -> Result<Self, SharedError> {
        let Some(object) = slot.get() else {
            handshake.release();
            return Err(SharedError::Empty);
        };
        match object.lock() {
            Ok(object) => Ok(Self { handshake, object }),
            Err(_) => {
                handshake.release();
                Err(SharedError::Poisoned)
            }
        }
    }
}

impl<T> Drop for Held<'_, T> {
    fn drop(&mut self) {
        self.handshake.release();
    }
}

/// Producer access to the shared object, allows in-place mutation.
/// Unlocks when dropped or on [SharedWriteGuard::unlock].
pub struct SharedWriteGuard<'a, T>(Held<'a, T>);

impl<T> SharedWriteGuard<'_, T> {
    /// Release exclusive access
    pub fn unlock(self) {}
}

impl<T> Deref for SharedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0.object
    }
}

impl<T> DerefMut for SharedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0.object
    }
}

/// Consumer access to the shared object, read only.
/// Unlocks when dropped or on [SharedReadGuard::unlock].
pub struct SharedReadGuard<'a, T>(Held<'a, T>);

impl<T> SharedReadGuard<'_, T> {
    /// Release exclusive access
    pub fn unlock(self) {}
}

impl<T> Deref for SharedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0.object
    }
}

/// Publishing side of a shared container
pub struct SharedProducer<T> {
    handshake: Arc<Handshake>,
    slot: Arc<Slot<T>>,
    closed: bool,
}

impl<T> SharedProducer<T> {
    /// Publish a new object, replacing any previous one. Waits while the consumer holds the
    /// lock. Does not mark the object updated.
    pub fn set(&mut self, object: T) -> Result<(), SharedError> {
        self.handshake.acquire(|_| Ok(true))?;
        match self.slot.set(Mutex::new(object)) {
            Ok(()) => self.handshake.release(),
            Err(fresh) => {
                let mut held = Held::take(&self.handshake, &self.slot)?;
                *held.object = fresh.into_inner().unwrap_or_else(PoisonError::into_inner);
            }
        }
        let mut state = self.handshake.lock()?;
        state.present = true;
        self.handshake.changed.notify_all();
        Ok(())
    }

    /// Lock the object for in-place mutation.
    ///
    /// Fails with [SharedError::Empty] if no object was set yet.
    pub fn get_and_lock(&mut self) -> Result<SharedWriteGuard<'_, T>, SharedError> {
        self.handshake.acquire(|s| {
            if s.present {
                Ok(true)
            } else {
                Err(SharedError::Empty)
            }
        })?;
        Held::take(&self.handshake, &self.slot).map(SharedWriteGuard)
    }

    /// Announce a new version of the object.
    ///
    /// In [HandshakeMode::Strict] this waits until the consumer processed the previous
    /// version.
    pub fn mark_updated(&mut self) -> Result<(), SharedError> {
        let state = self.handshake.lock()?;
        let mut state = match self.handshake.mode {
            HandshakeMode::Relaxed => state,
            HandshakeMode::Strict => self.handshake.wait_until(state, |s| {
                if !s.updated {
                    Ok(true)
                } else if !s.consumer_open {
                    Err(SharedError::PeerClosed)
                } else {
                    Ok(false)
                }
            })?,
        };
        state.updated = true;
        state.stats.rounds_published += 1;
        self.handshake.changed.notify_all();
        Ok(())
    }

    /// Handshake counters
    pub fn stats(&self) -> HandshakeStats {
        self.handshake.stats()
    }

    /// Handle to observe when both sides have closed the container
    pub fn completion(&self) -> HandoffCompletion {
        HandoffCompletion {
            handshake: Arc::clone(&self.handshake),
        }
    }

    /// Close the producing side. Idempotent, also happens on drop.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            close_side(&self.handshake, |s| s.producer_open = false);
        }
    }
}

impl<T> Drop for SharedProducer<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reading side of a shared container
pub struct SharedConsumer<T> {
    handshake: Arc<Handshake>,
    slot: Arc<Slot<T>>,
    closed: bool,
}

impl<T> SharedConsumer<T> {
    /// Lock the object for reading, waiting until the producer set one.
    ///
    /// Fails with [SharedError::PeerClosed] if the producer closed without ever setting an
    /// object.
    pub fn get_and_lock(&mut self) -> Result<SharedReadGuard<'_, T>, SharedError> {
        self.handshake.acquire(|s| {
            if s.present {
                Ok(true)
            } else if !s.producer_open {
                Err(SharedError::PeerClosed)
            } else {
                Ok(false)
            }
        })?;
        Held::take(&self.handshake, &self.slot).map(SharedReadGuard)
    }

    /// Acknowledge the current version.
    ///
    /// In [HandshakeMode::Strict] this waits until the producer marked a version updated.
    pub fn mark_processed(&mut self) -> Result<(), SharedError> {
        let state = self.handshake.lock()?;
        let mut state = match self.handshake.mode {
            HandshakeMode::Relaxed => state,
            HandshakeMode::Strict => self.handshake.wait_until(state, |s| {
                if s.updated {
                    Ok(true)
                } else if !s.producer_open {
                    Err(SharedError::PeerClosed)
                } else {
                    Ok(false)
                }
            })?,
        };
        state.updated = false;
        state.stats.rounds_processed += 1;
        self.handshake.changed.notify_all();
        Ok(())
    }

    /// Handshake counters
    pub fn stats(&self) -> HandshakeStats {
        self.handshake.stats()
    }

    /// Handle to observe when both sides have closed the container
    pub fn completion(&self) -> HandoffCompletion {
        HandoffCompletion {
            handshake: Arc::clone(&self.handshake),
        }
    }

    /// Close the consuming side. Idempotent, also happens on drop.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            close_side(&self.handshake, |s| s.consumer_open = false);
        }
    }
}

impl<T> Drop for SharedConsumer<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_side(handshake: &Handshake, close: impl FnOnce(&mut State)) {
    let mut state = handshake.state.lock().unwrap_or_else(PoisonError::into_inner);
    close(&mut state);
    if !state.producer_open && !state.consumer_open {
        debug!(stats = ?state.stats, "Shared container handoff complete");
    }
    handshake.changed.notify_all();
}

/// Tells whether both sides of a shared container have closed.
///
/// This is what an engine driving a pair of operators waits on to learn that the handoff
/// is done.
#[derive(Clone)]
pub struct HandoffCompletion {
    handshake: Arc<Handshake>,
}

impl HandoffCompletion {
    /// True once producer and consumer are both closed
    pub fn is_complete(&self) -> bool {
        let state = self
            .handshake
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        !state.producer_open && !state.consumer_open
    }

    /// Block until both sides are closed
    pub fn wait(&self) -> Result<HandshakeStats, SharedError> {
        let state = self.handshake.lock()?;
        let state = self
            .handshake
            .wait_until(state, |s| Ok(!s.producer_open && !s.consumer_open))?;
        Ok(state.stats)
    }
}

impl Debug for HandoffCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffCompletion")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn strict<T: Send + 'static>() -> (SharedProducer<T>, SharedConsumer<T>) {
        shared_container(HandshakeMode::Strict, &CancelToken::new())
    }

    /// The consumer sees the producer's in-place mutations on the very same object
    #[test]
    fn round_trip_with_mutation() {
        let (mut producer, mut consumer) = strict::<Vec<i32>>();
        producer.set(Vec::with_capacity(16)).unwrap();
        let address = producer.get_and_lock().unwrap().as_ptr();

        for round in 1..=3 {
            let mut guard = producer.get_and_lock().unwrap();
            guard.push(round);
            guard.unlock();
            producer.mark_updated().unwrap();

            let guard = consumer.get_and_lock().unwrap();
            assert_eq!(*guard, (1..=round).collect::<Vec<_>>());
            // never copied
            assert_eq!(guard.as_ptr(), address);
            guard.unlock();
            consumer.mark_processed().unwrap();
        }
        assert_eq!(
            producer.stats(),
            HandshakeStats {
                rounds_published: 3,
                rounds_processed: 3
            }
        );
    }

    /// In strict mode published and processed rounds never drift apart by more than one
    #[test]
    fn strict_alternation() {
        let (mut producer, mut consumer) = strict::<u64>();
        producer.set(0).unwrap();
        let rounds = 200;
        let producer_thread = thread::spawn(move || {
            for i in 1..=rounds {
                *producer.get_and_lock().unwrap() = i;
                producer.mark_updated().unwrap();
                let stats = producer.stats();
                assert!(stats.rounds_published - stats.rounds_processed <= 1);
            }
        });
        let mut last_seen = 0;
        for _ in 0..rounds {
            consumer.mark_processed().unwrap();
            let stats = consumer.stats();
            assert!(stats.rounds_published >= stats.rounds_processed);
            assert!(stats.rounds_published - stats.rounds_processed <= 1);
            let seen = *consumer.get_and_lock().unwrap();
            assert!(seen >= last_seen);
            last_seen = seen;
        }
        producer_thread.join().unwrap();
        assert_eq!(*consumer.get_and_lock().unwrap(), rounds);
    }

    #[test]
    fn strict_mark_updated_waits_for_processed() {
        let (mut producer, mut consumer) = strict::<i32>();
        producer.set(1).unwrap();
        producer.mark_updated().unwrap();
        let second = thread::spawn(move || producer.mark_updated());
        thread::sleep(Duration::from_millis(20));
        assert!(!second.is_finished());
        consumer.mark_processed().unwrap();
        assert_eq!(second.join().unwrap(), Ok(()));
    }

    #[test]
    fn strict_mark_processed_waits_for_updated() {
        let (mut producer, mut consumer) = strict::<i32>();
        producer.set(1).unwrap();
        let waiting = thread::spawn(move || consumer.mark_processed());
        thread::sleep(Duration::from_millis(20));
        assert!(!waiting.is_finished());
        producer.mark_updated().unwrap();
        assert_eq!(waiting.join().unwrap(), Ok(()));
    }

    /// Relaxed marks are counters only
    #[test]
    fn relaxed_marks_never_block() {
        let (mut producer, mut consumer) =
            shared_container::<i32>(HandshakeMode::Relaxed, &CancelToken::new());
        producer.set(1).unwrap();
        for _ in 0..5 {
            producer.mark_updated().unwrap();
        }
        consumer.mark_processed().unwrap();
        consumer.mark_processed().unwrap();
        assert_eq!(
            consumer.stats(),
            HandshakeStats {
                rounds_published: 5,
                rounds_processed: 2
            }
        );
    }

    #[test]
    fn consumer_waits_for_first_set() {
        let (mut producer, mut consumer) = strict::<String>();
        let reader = thread::spawn(move || consumer.get_and_lock().map(|g| g.clone()));
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());
        producer.set("hello".to_string()).unwrap();
        assert_eq!(reader.join().unwrap(), Ok("hello".to_string()));
    }

    #[test]
    fn cancel_unblocks_waiters() {
        let token = CancelToken::new();
        let (mut producer, mut consumer) =
            shared_container::<i32>(HandshakeMode::Strict, &token);
        let reader = thread::spawn(move || consumer.get_and_lock().map(|g| *g));
        producer.mark_updated().unwrap();
        let marker = thread::spawn(move || producer.mark_updated());
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(reader.join().unwrap(), Err(SharedError::Cancelled));
        assert_eq!(marker.join().unwrap(), Err(SharedError::Cancelled));
    }

    #[test]
    fn closed_peer_does_not_leave_waiters_hanging() {
        let (producer, mut consumer) = strict::<i32>();
        let reader = thread::spawn(move || consumer.get_and_lock().map(|g| *g));
        thread::sleep(Duration::from_millis(20));
        drop(producer);
        assert_eq!(reader.join().unwrap(), Err(SharedError::PeerClosed));

        let (mut producer, mut consumer) = strict::<i32>();
        producer.set(1).unwrap();
        producer.close();
        assert_eq!(consumer.mark_processed(), Err(SharedError::PeerClosed));
        // the last object stays readable
        assert_eq!(*consumer.get_and_lock().unwrap(), 1);
    }

    #[test]
    fn same_thread_lock_is_rejected() {
        let (mut producer, mut consumer) = strict::<i32>();
        producer.set(1).unwrap();
        let guard = producer.get_and_lock().unwrap();
        assert!(matches!(consumer.get_and_lock(), Err(SharedError::Reentrant)));
        drop(guard);
        assert_eq!(*consumer.get_and_lock().unwrap(), 1);
    }

    #[test]
    fn producer_lock_before_set_fails() {
        let (mut producer, mut consumer) = strict::<i32>();
        assert!(matches!(producer.get_and_lock(), Err(SharedError::Empty)));
        // the failed lock leaves the container usable
        producer.set(1).unwrap();
        assert_eq!(*producer.get_and_lock().unwrap(), 1);
        assert_eq!(*consumer.get_and_lock().unwrap(), 1);
    }

    /// A later set replaces the object behind the same lock
    #[test]
    fn set_replaces_object() {
        let (mut producer, mut consumer) = strict::<String>();
        producer.set("first".to_string()).unwrap();
        assert_eq!(*consumer.get_and_lock().unwrap(), "first");
        producer.set("second".to_string()).unwrap();
        producer.get_and_lock().unwrap().push('!');
        assert_eq!(*consumer.get_and_lock().unwrap(), "second!");
    }

    /// Containers stop listening for cancellation once both handles are gone
    #[test]
    fn dropped_container_deregisters_wake_up() {
        let token = CancelToken::new();
        for _ in 0..100 {
            let (mut producer, consumer) = shared_container::<i32>(HandshakeMode::Strict, &token);
            producer.set(1).unwrap();
            assert_eq!(token.registered_wake_ups(), 1);
            drop(producer);
            assert_eq!(token.registered_wake_ups(), 1);
            drop(consumer);
        }
        assert_eq!(token.registered_wake_ups(), 0);

        let (_producer, mut consumer) = shared_container::<i32>(HandshakeMode::Strict, &token);
        let reader = thread::spawn(move || consumer.get_and_lock().map(|g| *g));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(reader.join().unwrap(), Err(SharedError::Cancelled));
    }

    /// A panic while holding the lock releases it but poisons the object
    #[test]
    fn panic_while_locked_poisons() {
        let (mut producer, mut consumer) = strict::<i32>();
        producer.set(1).unwrap();
        let result = thread::spawn(move || {
            let mut guard = producer.get_and_lock().unwrap();
            *guard = 2;
            panic!("failing while locked");
        })
        .join();
        assert!(result.is_err());
        assert!(matches!(consumer.get_and_lock(), Err(SharedError::Poisoned)));
    }

    #[test]
    fn completion_after_both_sides_close() {
        let (producer, mut consumer) = strict::<i32>();
        let completion = producer.completion();
        assert!(!completion.is_complete());
        let waiter = {
            let completion = completion.clone();
            thread::spawn(move || completion.wait())
        };
        drop(producer);
        assert!(!completion.is_complete());
        consumer.close();
        consumer.close();
        assert!(completion.is_complete());
        assert!(waiter.join().unwrap().is_ok());
    }
}
