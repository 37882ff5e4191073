//! A thread-safe oneshot channel for handing a single value to a blocked thread.
//!
//! This is the wait handle behind [`Deferred::wait`](crate::deferred::Deferred::wait):
//! the waiting thread parks on a receiver while the completing thread delivers
//! the outcome through the sender.
//!
//! ## Channel Lifecycle
//!
//! 1. Pending: waiting for a value to be sent
//! 2. Ready: a value has been sent and is available for consumption
//! 3. Consumed: the value has been taken, or the sender was dropped without sending
//!
//! Dropping the sender without sending closes the channel, so a receiver never
//! waits for a value that can no longer arrive.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::ERR_POISONED_LOCK;

/// Creates a new oneshot channel, returning a sender and receiver pair.
pub fn channel<T>() -> (OneshotSender<T>, OneshotReceiver<T>) {
    let cell = Arc::new(OneshotCell::new(State::Pending));
    (OneshotSender(cell.clone()), OneshotReceiver(cell))
}

/// The sending half of a oneshot channel.
pub struct OneshotSender<T>(Arc<OneshotCell<T>>);

impl<T> OneshotSender<T> {
    /// Sends the value, waking up a blocked receiver.
    ///
    /// Returns `Err(value)` if the receiver side is already closed.
    pub fn send(self, value: T) -> Result<(), T> {
        self.0.set(value)
    }
}

impl<T> Drop for OneshotSender<T> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// The receiving half of a oneshot channel.
pub struct OneshotReceiver<T>(Arc<OneshotCell<T>>);

impl<T> OneshotReceiver<T> {
    /// Blocks until a value is received or the channel is closed.
    ///
    /// Returns `None` if the sender was dropped without sending.
    pub fn recv(self) -> Option<T> {
        self.0.wait()
    }
}

/// Shared state of the channel: the value slot and the condition variable
/// the receiver blocks on.
struct OneshotCell<T> {
    state: Mutex<State<T>>,
    condvar: Condvar,
}

impl<T> OneshotCell<T> {
    fn new(state: State<T>) -> OneshotCell<T> {
        OneshotCell {
            state: Mutex::new(state),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }

    fn set(&self, value: T) -> Result<(), T> {
        let res = self.lock().set(value);
        self.condvar.notify_all();
        res
    }

    /// Closes a channel that is still pending.
    fn cancel(&self) {
        self.lock().cancel();
        self.condvar.notify_all();
    }

    fn wait(&self) -> Option<T> {
        let guard = self.lock();
        self.condvar
            .wait_while(guard, |state| state.is_pending())
            .expect(ERR_POISONED_LOCK)
            .take()
    }
}

/// Internal state of the channel.
///
/// The state transitions are:
/// - `Pending` -> `Ready(T)` when a value is sent
/// - `Pending` -> `Consumed` when the sender is dropped
/// - `Ready(T)` -> `Consumed` when the value is taken
enum State<T> {
    Pending,
    Ready(T),
    Consumed,
}

impl<T> State<T> {
    fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }

    fn set(&mut self, value: T) -> Result<(), T> {
        match self {
            State::Pending => {
                *self = State::Ready(value);
                Ok(())
            }
            State::Ready(_) | State::Consumed => Err(value),
        }
    }

    /// Takes the value out, leaving the state consumed.
    fn take(&mut self) -> Option<T> {
        match std::mem::replace(self, State::Consumed) {
            State::Ready(value) => Some(value),
            State::Pending | State::Consumed => None,
        }
    }

    fn cancel(&mut self) {
        if self.is_pending() {
            *self = State::Consumed;
        }
    }
}
