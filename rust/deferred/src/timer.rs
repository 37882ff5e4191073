//! One-shot alarms driven by a dedicated timer thread.
//!
//! Pending alarms sit in a min-heap ordered by deadline. The timer thread sleeps
//! on a condition variable until the earliest deadline (or until an earlier alarm
//! is scheduled), so waiting for an alarm never spins and never occupies a pool
//! worker.
//!
//! Alarm callbacks run on the timer thread itself and must be short; anything
//! substantial belongs on the [`ThreadPool`](crate::thread_pool::ThreadPool).

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock},
    thread,
    time::{Duration, Instant},
};

use crate::{ERR_POISONED_LOCK, error::Failure};

type AlarmFn = Box<dyn FnOnce() + Send + 'static>;

/// A timer thread with its queue of pending alarms.
///
/// Dropping a `Timer` stops its thread; alarms that have not fired yet are
/// discarded. The [`global`](Self::global) timer is never dropped.
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Starts a new timer thread with the given name.
    pub fn new(name: impl Into<String>) -> Timer {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                alarms: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });

        let thread_inner = inner.clone();
        thread::Builder::new()
            .name(name.into())
            .spawn(move || thread_inner.run())
            .expect("spawn timer thread");

        Timer { inner }
    }

    /// Returns the process-wide timer, starting its thread on first use.
    pub fn global() -> &'static Timer {
        static TIMER: OnceLock<Timer> = OnceLock::new();
        TIMER.get_or_init(|| {
            log::debug!("starting global timer thread");
            Timer::new("deferred-timer")
        })
    }

    /// Arranges for `alarm` to be called once, after `after` has elapsed.
    ///
    /// Alarms with the same deadline fire in the order they were scheduled. A
    /// duration too large to be represented as a deadline never elapses: the
    /// alarm stays pending until the timer is dropped.
    pub fn schedule<F>(&self, after: Duration, alarm: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now().checked_add(after);
        let mut state = self.inner.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.alarms.push(Reverse(Alarm {
            deadline,
            seq,
            fire: Box::new(alarm),
        }));
        drop(state);

        // The new alarm may be earlier than the one the thread sleeps for.
        self.inner.changed.notify_one();
    }

    /// Number of alarms that have not fired yet.
    pub fn pending(&self) -> usize {
        self.inner.lock().alarms.len()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.inner.lock().shutdown = true;
        self.inner.changed.notify_one();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("pending", &self.pending())
            .finish()
    }
}

struct TimerInner {
    state: Mutex<TimerState>,
    changed: Condvar,
}

struct TimerState {
    alarms: BinaryHeap<Reverse<Alarm>>,
    next_seq: u64,
    shutdown: bool,
}

impl TimerInner {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }

    fn run(&self) {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                log::trace!("timer thread exiting, {} alarms dropped", state.alarms.len());
                return;
            }

            let now = Instant::now();
            match state.alarms.peek().and_then(|Reverse(alarm)| alarm.deadline) {
                None => {
                    state = self.changed.wait(state).expect(ERR_POISONED_LOCK);
                }
                Some(deadline) if deadline <= now => {
                    let Some(Reverse(alarm)) = state.alarms.pop() else {
                        continue;
                    };
                    drop(state);
                    alarm.fire();
                    state = self.lock();
                }
                Some(deadline) => {
                    state = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .expect(ERR_POISONED_LOCK)
                        .0;
                }
            }
        }
    }
}

struct Alarm {
    /// `None` for an alarm that never fires.
    deadline: Option<Instant>,
    seq: u64,
    fire: AlarmFn,
}

impl Alarm {
    fn fire(self) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(self.fire)) {
            log::error!("timer alarm panicked: {}", Failure::from_panic(payload));
        }
    }
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> Ordering {
        // Alarms without a deadline sort after every alarm that has one.
        (self.deadline.is_none(), self.deadline, self.seq).cmp(&(
            other.deadline.is_none(),
            other.deadline,
            other.seq,
        ))
    }
}
