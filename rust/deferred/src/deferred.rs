//! The deferred result: a single-assignment completion cell with at most one
//! continuation.
//!
//! A deferred result is created as a pair:
//!
//! - [`Completer`] is the producer side. It can be cloned and handed to whoever
//!   finishes the operation. The first completion wins; any further completion
//!   attempt fails with [`ErrorKind::AlreadyCompleted`](crate::error::ErrorKind::AlreadyCompleted).
//! - [`Deferred`] is the consumer side. It is not `Clone`, and every way of
//!   consuming it ([`continue_with`](Deferred::continue_with), [`chain`](Deferred::chain),
//!   [`wait`](Deferred::wait), [`join`](Deferred::join)) takes it by value. A
//!   deferred result therefore has a single subscriber.
//!
//! ## State machine
//!
//! Each instance is guarded by its own mutex. The only transition is
//! `Pending -> Completed`. Completing and attaching both run under that lock, so
//! "is it completed yet" and "store or dispatch the continuation" are observed
//! atomically: a continuation is never lost and never dispatched twice. The
//! actual dispatch happens after the lock is released.
//!
//! ## Continuations
//!
//! A continuation is one of a few tagged nodes rather than an arbitrary closure:
//!
//! - user callbacks always go through the [`ThreadPool`], under the ambient
//!   context captured when the callback was attached. They never run inline, not
//!   even when the antecedent is already completed at attach time;
//! - forwarding nodes move an outcome into another deferred result (this is how
//!   [`chain`](Deferred::chain) flattens nested results without nesting callbacks);
//! - delivery nodes hand the outcome to a thread blocked in [`wait`](Deferred::wait).
//!
//! Forwarding and delivery run no user code and happen on the completing thread,
//! without installing any ambient context. A completion follows forwarding nodes
//! in a loop, so nested chains never grow the call stack, and every hop that runs
//! user code starts afresh on a worker.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    ERR_POISONED_LOCK,
    context::{Context, capture_current_context},
    error::{Error, Failure, Outcome, Result, catch},
    oneshot::{self, OneshotSender},
    thread_pool::ThreadPool,
};

/// The consumer side of a deferred result.
pub struct Deferred<T> {
    cell: Arc<Cell<T>>,
}

/// The producer side of a deferred result.
pub struct Completer<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Deferred<T>
where
    T: Send + 'static,
{
    /// Creates a pending deferred result and the completer that finishes it.
    pub fn pending() -> (Completer<T>, Deferred<T>) {
        let cell = Arc::new(Cell::new(State::Pending(None)));
        (Completer { cell: cell.clone() }, Deferred { cell })
    }

    /// Creates a deferred result that has already completed successfully.
    pub fn ready(value: T) -> Deferred<T> {
        Self::completed(Ok(value))
    }

    /// Creates a deferred result that has already completed with `failure`.
    pub fn failed(failure: Failure) -> Deferred<T> {
        Self::completed(Err(failure))
    }

    fn completed(outcome: Outcome<T>) -> Deferred<T> {
        Deferred {
            cell: Arc::new(Cell::new(State::Completed(Some(outcome)))),
        }
    }

    /// Returns `true` once the deferred result has been completed, whether or
    /// not its outcome has been observed yet.
    pub fn is_completed(&self) -> bool {
        self.cell.is_completed()
    }

    /// Attaches a continuation and returns a deferred result for its outcome.
    ///
    /// `f` receives the outcome of this instance once it completes, and runs on
    /// the global [`ThreadPool`] under the ambient context current *now*, at
    /// attach time. The returned result completes with whatever `f` returns; if
    /// `f` panics, it completes with that panic as its failure.
    ///
    /// A failure of this instance is not propagated by itself: `f` decides,
    /// typically with `?` on the outcome it receives.
    pub fn continue_with<U, F>(self, f: F) -> Deferred<U>
    where
        F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
        U: Send + 'static,
    {
        let (completer, result) = Deferred::pending();
        self.on_complete(move |outcome| {
            completer.settle(catch(|| f(outcome)));
        });
        result
    }

    /// Attaches a continuation that itself produces a deferred result.
    ///
    /// The returned result completes only once the deferred result returned by
    /// `f` completes, with that inner outcome. If `f` fails or panics instead of
    /// returning an inner result, the returned result completes with that failure.
    pub fn chain<U, F>(self, f: F) -> Deferred<U>
    where
        F: FnOnce(Outcome<T>) -> Outcome<Deferred<U>> + Send + 'static,
        U: Send + 'static,
    {
        let (completer, result) = Deferred::pending();
        self.on_complete(move |outcome| match catch(|| f(outcome)) {
            Ok(inner) => inner.attach(Continuation::Forward(completer)),
            Err(failure) => completer.settle(Err(failure)),
        });
        result
    }

    /// Blocks the calling thread until this instance completes and returns its
    /// outcome.
    ///
    /// May be called from any thread, worker threads included. A worker blocked
    /// here is not available to run other work items in the meantime.
    ///
    /// If every [`Completer`] is dropped without completing, the outcome is a
    /// failure instead of waiting forever.
    pub fn wait(self) -> Outcome<T> {
        let (tx, rx) = oneshot::channel();
        self.attach(Continuation::Deliver(tx));
        rx.recv()
            .unwrap_or_else(|| Err(Failure::msg("deferred result abandoned before completion")))
    }

    /// Blocks until this instance completes and returns its value, re-raising
    /// the failure on the calling thread otherwise.
    ///
    /// # Panics
    ///
    /// Panics with the original panic payload if the operation panicked, or with
    /// the error message if it failed with an error.
    pub fn join(self) -> T {
        match self.wait() {
            Ok(value) => value,
            Err(failure) => failure.resume(),
        }
    }

    /// Attaches a plain callback without creating a result for it.
    pub(crate) fn on_complete<F>(self, f: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.attach(Continuation::Callback {
            f: Box::new(f),
            context: capture_current_context(),
        });
    }

    /// Stores `continuation`, or dispatches it right away if this instance has
    /// already completed.
    fn attach(self, continuation: Continuation<T>) {
        let mut state = self.cell.lock();
        match &mut *state {
            State::Pending(slot) => {
                debug_assert!(slot.is_none(), "deferred result has a single subscriber");
                *slot = Some(continuation);
            }
            State::Completed(outcome) => {
                // Only the single consumer takes the outcome, and it takes it here.
                if let Some(outcome) = outcome.take() {
                    drop(state);
                    continuation.dispatch(outcome);
                }
            }
        }
    }
}

impl<T> Completer<T>
where
    T: Send + 'static,
{
    /// Completes the deferred result successfully with `value`.
    pub fn complete_success(&self, value: T) -> Result<()> {
        self.complete(Ok(value))
    }

    /// Completes the deferred result with `failure`.
    pub fn complete_failure(&self, failure: Failure) -> Result<()> {
        self.complete(Err(failure))
    }

    /// Completes the deferred result with `outcome`.
    ///
    /// If a continuation is attached it is dispatched; otherwise the outcome is
    /// kept until one is attached. Fails with `AlreadyCompleted` if the deferred
    /// result has already been completed, leaving the first outcome in place.
    pub fn complete(&self, outcome: Outcome<T>) -> Result<()> {
        let Some((mut continuation, mut outcome)) = self.cell.complete(outcome)? else {
            return Ok(());
        };

        // Forwarding nodes are followed one cell at a time, so a chain nested
        // any number of levels deep completes without recursion.
        loop {
            match continuation {
                Continuation::Forward(target) => match target.cell.complete(outcome) {
                    Ok(Some(next)) => (continuation, outcome) = next,
                    Ok(None) => return Ok(()),
                    Err(err) => {
                        debug_assert!(false, "forwarding target completed twice: {err}");
                        return Ok(());
                    }
                },
                continuation => {
                    continuation.dispatch(outcome);
                    return Ok(());
                }
            }
        }
    }

    /// Returns `true` once the deferred result has been completed.
    pub fn is_completed(&self) -> bool {
        self.cell.is_completed()
    }

    /// Completes a deferred result this crate created and exclusively completes.
    pub(crate) fn settle(&self, outcome: Outcome<T>) {
        if let Err(err) = self.complete(outcome) {
            debug_assert!(false, "internal completer used twice: {err}");
        }
    }
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Completer {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("completed", &self.cell.is_completed())
            .finish()
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("completed", &self.cell.is_completed())
            .finish()
    }
}

/// Shared state of one deferred result.
struct Cell<T> {
    state: Mutex<State<T>>,
}

impl<T> Cell<T> {
    fn new(state: State<T>) -> Cell<T> {
        Cell {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }

    fn is_completed(&self) -> bool {
        matches!(*self.lock(), State::Completed(_))
    }

    /// Moves the cell to `Completed`.
    ///
    /// Returns the attached continuation together with the outcome it must
    /// receive, or `None` if the outcome was stored for a later subscriber.
    fn complete(&self, outcome: Outcome<T>) -> Result<Option<(Continuation<T>, Outcome<T>)>> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, State::Completed(None)) {
            State::Completed(previous) => {
                *state = State::Completed(previous);
                log::warn!("attempt to complete an already completed deferred result");
                Err(Error::already_completed())
            }
            State::Pending(None) => {
                *state = State::Completed(Some(outcome));
                Ok(None)
            }
            State::Pending(Some(continuation)) => Ok(Some((continuation, outcome))),
        }
    }
}

enum State<T> {
    /// Not completed; holds the continuation once one is attached.
    Pending(Option<Continuation<T>>),
    /// Completed; holds the outcome until the subscriber takes it.
    Completed(Option<Outcome<T>>),
}

type CallbackFn<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

enum Continuation<T> {
    /// User code, run on the pool under the context captured at attach time.
    Callback { f: CallbackFn<T>, context: Context },
    /// Completes another deferred result with the same outcome.
    Forward(Completer<T>),
    /// Hands the outcome to a blocked waiter.
    Deliver(OneshotSender<Outcome<T>>),
}

impl<T> Continuation<T>
where
    T: Send + 'static,
{
    fn dispatch(self, outcome: Outcome<T>) {
        match self {
            Continuation::Callback { f, context } => {
                log::trace!("dispatching continuation to the thread pool");
                ThreadPool::global().enqueue_with_context(move || f(outcome), Some(context));
            }
            Continuation::Forward(target) => target.settle(outcome),
            Continuation::Deliver(tx) => {
                // The waiter only goes away by unwinding; nothing left to notify then.
                let _ = tx.send(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Barrier,
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc,
        },
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{context::AmbientLocal, error::ErrorKind};

    fn current_thread_name() -> String {
        thread::current().name().unwrap_or_default().to_string()
    }

    #[test]
    fn test_complete_twice_fails() {
        let (completer, deferred) = Deferred::<u32>::pending();
        assert!(!completer.is_completed());
        completer.complete_success(1).unwrap();
        assert!(completer.is_completed());
        assert!(deferred.is_completed());

        let err = completer.complete_success(2).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AlreadyCompleted));
        let err = completer.clone().complete_failure(Failure::msg("late")).unwrap_err();
        assert!(err.is_already_completed());

        // The first outcome stays in place.
        assert_eq!(deferred.wait().unwrap(), 1);
    }

    #[test]
    fn test_complete_failure_then_success_fails() {
        let (completer, deferred) = Deferred::<()>::pending();
        completer.complete_failure(Failure::msg("first")).unwrap();
        assert!(completer.complete_success(()).unwrap_err().is_already_completed());
        assert_eq!(deferred.wait().unwrap_err().message(), "first");
    }

    #[test]
    fn test_complete_without_continuation_schedules_nothing() {
        let (completer, deferred) = Deferred::<u32>::pending();
        completer.complete_success(5).unwrap();
        drop(deferred);
        assert!(completer.is_completed());
    }

    #[test]
    fn test_ready_and_failed() {
        assert!(Deferred::ready(3).is_completed());
        assert_eq!(Deferred::ready(3).wait().unwrap(), 3);
        let failure = Deferred::<()>::failed(Failure::msg("nope")).wait().unwrap_err();
        assert_eq!(failure.message(), "nope");
    }

    #[test]
    fn test_continuation_attached_before_completion() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (completer, deferred) = Deferred::<u32>::pending();

        let r = runs.clone();
        let completed = Arc::new(AtomicBool::new(false));
        let c = completed.clone();
        let next = deferred.continue_with(move |outcome| {
            assert!(c.load(Ordering::SeqCst), "continuation ran before completion");
            r.fetch_add(1, Ordering::SeqCst);
            Ok(outcome? * 2)
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!next.is_completed());

        completed.store(true, Ordering::SeqCst);
        completer.complete_success(21).unwrap();
        assert_eq!(next.wait().unwrap(), 42);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_continuation_sees_attach_time_context() {
        let flow = Arc::new(AmbientLocal::<&'static str>::new());
        let (completer, deferred) = Deferred::<()>::pending();

        flow.set("attach");
        let f = flow.clone();
        let next = deferred.continue_with(move |_| Ok(f.get().map(|v| *v)));
        flow.set("complete");

        // Complete from a thread with its own, different ambient context.
        let f = flow.clone();
        thread::spawn(move || {
            f.set("completer thread");
            completer.complete_success(()).unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(next.wait().unwrap(), Some("attach"));
        flow.clear();
    }

    #[test]
    fn test_continuation_after_completion_is_asynchronous() {
        let deferred = Deferred::ready(());
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();

        let next = deferred.continue_with(move |_| {
            tx.send(thread::current().id()).unwrap();
            Ok(current_thread_name())
        });

        let ran_on = rx.recv().unwrap();
        assert_ne!(ran_on, caller);
        assert!(next.wait().unwrap().starts_with("deferred-worker-"));
    }

    #[test]
    fn test_continuation_does_not_block_attacher() {
        let deferred = Deferred::ready(());
        let (release_tx, release_rx) = mpsc::channel::<()>();

        // If the continuation ran inline, attaching would never return.
        let next = deferred.continue_with(move |_| {
            release_rx.recv().unwrap();
            Ok(())
        });
        release_tx.send(()).unwrap();
        next.wait().unwrap();
    }

    #[test]
    fn test_continuation_receives_failure() {
        let (completer, deferred) = Deferred::<u32>::pending();
        let next = deferred.continue_with(|outcome| Ok(outcome.is_err()));
        completer.complete_failure(Failure::msg("broken")).unwrap();
        // The continuation itself succeeded.
        assert!(next.wait().unwrap());
    }

    #[test]
    fn test_continuation_failure_propagates_with_question_mark() {
        let (completer, deferred) = Deferred::<u32>::pending();
        let next = deferred
            .continue_with(|outcome| Ok(outcome? + 1))
            .continue_with(|outcome| Ok(outcome? + 1));
        completer.complete_failure(Failure::msg("broken")).unwrap();
        assert_eq!(next.wait().unwrap_err().message(), "broken");
    }

    #[test]
    fn test_panicking_continuation_fails_result() {
        let next = Deferred::ready(0u32).continue_with(|outcome| {
            let zero = outcome?;
            if zero == 0 {
                panic!("continuation exploded");
            }
            Ok(zero)
        });
        let failure = next.wait().unwrap_err();
        assert!(failure.is_panic());
        assert_eq!(failure.message(), "continuation exploded");
    }

    #[test]
    fn test_chain_waits_for_inner() {
        let (inner_completer, inner) = Deferred::<&'static str>::pending();
        let (completer, deferred) = Deferred::<()>::pending();

        let (tx, rx) = mpsc::channel();
        let next = deferred.chain(move |outcome| {
            outcome?;
            tx.send(()).unwrap();
            Ok(inner)
        });
        completer.complete_success(()).unwrap();

        // The outer continuation ran, but the result still waits for the inner one.
        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!next.is_completed());

        inner_completer.complete_success("inner").unwrap();
        assert_eq!(next.wait().unwrap(), "inner");
    }

    #[test]
    fn test_chain_propagates_inner_failure() {
        let next = Deferred::ready(()).chain(|_| Ok(Deferred::<u8>::failed(Failure::msg("inner"))));
        assert_eq!(next.wait().unwrap_err().message(), "inner");
    }

    #[test]
    fn test_chain_callback_failure() {
        let next = Deferred::ready(()).chain::<u8, _>(|_| Err(Failure::msg("no inner")));
        assert_eq!(next.wait().unwrap_err().message(), "no inner");

        let next = Deferred::ready(()).chain::<u8, _>(|_| panic!("chain exploded"));
        let failure = next.wait().unwrap_err();
        assert!(failure.is_panic());
    }

    #[test]
    fn test_long_chains_do_not_grow_the_stack() {
        let mut deferred = Deferred::ready(0usize);
        for _ in 0..10_000 {
            deferred = deferred.chain(|outcome| Ok(Deferred::ready(outcome? + 1)));
        }
        assert_eq!(deferred.wait().unwrap(), 10_000);

        let (completer, head) = Deferred::pending();
        let mut deferred = head;
        for _ in 0..10_000 {
            deferred = deferred.continue_with(|outcome| Ok(outcome? + 1));
        }
        completer.complete_success(0usize).unwrap();
        assert_eq!(deferred.wait().unwrap(), 10_000);
    }

    #[test]
    fn test_deeply_nested_chains_do_not_grow_the_stack() {
        // Each level resumes with a deferred result that is itself chained.
        fn countdown(n: usize) -> Deferred<usize> {
            if n == 0 {
                return Deferred::ready(0);
            }
            Deferred::ready(()).chain(move |_| Ok(countdown(n - 1)))
        }

        assert_eq!(countdown(100_000).join(), 0);
    }

    #[test]
    fn test_nested_chain_forwards_failure() {
        fn countdown(n: usize) -> Deferred<usize> {
            if n == 0 {
                return Deferred::failed(Failure::msg("bottom"));
            }
            Deferred::ready(()).chain(move |_| Ok(countdown(n - 1)))
        }

        assert_eq!(countdown(1_000).wait().unwrap_err().message(), "bottom");
    }

    #[test]
    fn test_wait_blocks_until_completion() {
        let (completer, deferred) = Deferred::pending();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            completer.complete_success("late").unwrap();
        });
        assert_eq!(deferred.wait().unwrap(), "late");
    }

    #[test]
    fn test_wait_abandoned() {
        let (completer, deferred) = Deferred::<()>::pending();
        thread::spawn(move || drop(completer));
        let failure = deferred.wait().unwrap_err();
        assert!(failure.message().contains("abandoned"));
    }

    #[test]
    fn test_wait_from_worker_thread() {
        let (completer, deferred) = Deferred::<u32>::pending();
        let on_worker = Deferred::ready(()).continue_with(move |_| deferred.wait());
        completer.complete_success(9).unwrap();
        assert_eq!(on_worker.wait().unwrap(), 9);
    }

    #[test]
    fn test_join_returns_value() {
        assert_eq!(Deferred::ready(vec![1, 2]).join(), vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "original panic")]
    fn test_join_reraises_panic() {
        Deferred::ready(())
            .continue_with::<(), _>(|_| panic!("original panic"))
            .join();
    }

    #[test]
    #[should_panic(expected = "operation failed: plain error")]
    fn test_join_reraises_error() {
        Deferred::<()>::failed(Failure::msg("plain error")).join();
    }

    #[test]
    fn test_attach_and_complete_race() {
        const ROUNDS: usize = 500;
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..ROUNDS {
            let (completer, deferred) = Deferred::<()>::pending();
            let barrier = Arc::new(Barrier::new(2));

            let b = barrier.clone();
            let completing = thread::spawn(move || {
                b.wait();
                completer.complete_success(()).unwrap();
            });

            barrier.wait();
            let r = runs.clone();
            let next = deferred.continue_with(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

            completing.join().unwrap();
            next.wait().unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), ROUNDS);
    }

    #[test]
    fn test_concurrent_completers_only_one_wins() {
        let (completer, deferred) = Deferred::<usize>::pending();
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let completer = completer.clone();
                let wins = wins.clone();
                thread::spawn(move || {
                    if completer.complete_success(i).is_ok() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(deferred.wait().unwrap() < 8);
    }

    #[test]
    fn test_send_sync() {
        fn is_send_sync<T: Send + Sync>() {}
        is_send_sync::<Deferred<u32>>();
        is_send_sync::<Completer<String>>();
    }
}
