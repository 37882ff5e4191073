//! A simple unbounded multi-producer, multi-consumer (MPMC) channel.
//!
//! This is the shared work queue of the [`ThreadPool`](crate::thread_pool::ThreadPool):
//! any thread appends without ever blocking, worker threads block on removal.
//! There is intentionally no bounded variant: the pool applies no backpressure.
//!
//! **Note**: This implementation should be replaced with `std::sync::mpmc` once it becomes
//! stabilized in the Rust standard library.

use std::collections::VecDeque;
use std::sync::mpsc::{RecvError, SendError, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::ERR_POISONED_LOCK;

/// Creates a new unbounded channel, returning the sender/receiver halves.
///
/// All data sent on the [`Sender`] will become available on the [`Receiver`] in
/// the same order as it was sent, and no [`send`] will block the calling thread.
/// [`recv`] will block until a message is available while there is at least one
/// [`Sender`] alive (including clones).
///
/// Both halves can be cloned. If all receivers are gone, [`send`] returns a
/// [`SendError`] with the message. If all senders are gone, [`recv`] drains the
/// buffer, then returns a [`RecvError`].
///
/// [`send`]: Sender::send
/// [`recv`]: Receiver::recv
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let queue = SimpleMpmcQueue::<T>::new();
    (Sender(queue.clone()), Receiver(queue))
}

/// The sending half of the [`channel`].
pub struct Sender<T>(SimpleMpmcQueue<T>);

impl<T> Sender<T> {
    /// Appends a value to the channel. Never blocks.
    ///
    /// Returns the value back if every receiver has been dropped.
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        self.0.enqueue(msg).map_err(SendError)
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.0.add_producer();
        Self(self.0.clone())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.0.drop_producer();
    }
}

/// The receiving half of the [`channel`].
/// Different threads can share this [`Receiver`] by cloning it.
pub struct Receiver<T>(SimpleMpmcQueue<T>);

impl<T> Receiver<T> {
    /// Blocks until a value is available, or until the channel is empty and
    /// every sender has been dropped.
    pub fn recv(&self) -> Result<T, RecvError> {
        self.0.dequeue()
    }

    /// Attempts to receive a value without blocking.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.0.try_dequeue()
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        self.0.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.0.add_consumer();
        Self(self.0.clone())
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.0.drop_consumer();
    }
}

/// A blocking, unbounded MPMC queue with producer and consumer accounting.
///
/// Cloning the handle does NOT register a producer or consumer; the
/// [`Sender`]/[`Receiver`] wrappers take care of that.
struct SimpleMpmcQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SimpleMpmcQueue<T> {
    fn clone(&self) -> Self {
        SimpleMpmcQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<T> SimpleMpmcQueue<T> {
    /// Creates a new queue with one producer and one consumer registered.
    fn new() -> Self {
        let inner = Inner {
            state: Mutex::new(InnerState {
                queue: VecDeque::new(),
                producers: 1,
                consumers: 1,
            }),
            not_empty: Condvar::new(),
        };

        SimpleMpmcQueue {
            inner: Arc::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InnerState<T>> {
        self.inner.state.lock().expect(ERR_POISONED_LOCK)
    }

    fn add_producer(&self) {
        let mut state = self.lock();
        assert!(
            state.producers != 0,
            "Attempt to add producer when the queue is half-closed"
        );
        state.producers += 1;
    }

    /// De-registers a producer.
    ///
    /// When the producer count reaches zero, the queue is "half-closed":
    /// consumers drain the remaining items and then observe disconnection.
    fn drop_producer(&self) {
        let mut state = self.lock();
        assert!(
            state.producers >= 1,
            "drop_producer is called more times than add_producer"
        );

        state.producers -= 1;
        if state.producers == 0 {
            // Wake up waiting consumers so they can observe the disconnect.
            self.inner.not_empty.notify_all();
        }
    }

    fn add_consumer(&self) {
        let mut state = self.lock();
        assert!(
            state.consumers > 0,
            "Attempt to add consumer when the queue is closed"
        );
        state.consumers += 1;
    }

    /// De-registers a consumer.
    ///
    /// When the consumer count reaches zero the queue is closed: remaining
    /// items are dropped and further enqueues fail.
    fn drop_consumer(&self) {
        let drained = {
            let mut state = self.lock();
            assert!(
                state.consumers > 0,
                "drop_consumer is called more times than add_consumer"
            );

            state.consumers -= 1;
            if state.consumers == 0 {
                std::mem::take(&mut state.queue)
            } else {
                VecDeque::new()
            }
        };
        // Items may own arbitrary state; drop them without holding the lock.
        drop(drained);
    }

    fn enqueue(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.consumers == 0 {
            return Err(item);
        }
        state.queue.push_back(item);

        // Drop the lock before notifying to reduce contention.
        drop(state);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    fn dequeue(&self) -> Result<T, RecvError> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Ok(item);
            }

            if state.producers == 0 {
                return Err(RecvError);
            }

            state = self.inner.not_empty.wait(state).expect(ERR_POISONED_LOCK);
        }
    }

    fn try_dequeue(&self) -> Result<T, TryRecvError> {
        let mut state = self.lock();
        if let Some(item) = state.queue.pop_front() {
            return Ok(item);
        }

        if state.producers == 0 {
            Err(TryRecvError::Disconnected)
        } else {
            Err(TryRecvError::Empty)
        }
    }
}

/// The state of the queue that is protected by the Mutex.
struct InnerState<T> {
    queue: VecDeque<T>,
    producers: usize,
    consumers: usize,
}

/// The shared core of the queue.
struct Inner<T> {
    state: Mutex<InnerState<T>>,
    not_empty: Condvar, // Signals consumers that an item has been added.
}
