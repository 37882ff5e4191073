//! Operators that create and combine deferred results.
//!
//! - [`run`] / [`try_run`]: run a function on the global pool.
//! - [`delay`]: complete after a duration without occupying a worker.
//! - [`when_all`]: complete once every input has completed.
//! - [`iterate`]: drive a lazily produced sequence of deferred results one
//!   element at a time, which is how a sequential multi-step asynchronous
//!   procedure is expressed without blocking a thread between steps.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    deferred::{Completer, Deferred},
    error::{Outcome, catch},
    thread_pool::ThreadPool,
    timer::Timer,
};

/// Runs `f` on the global pool, under the caller's ambient context.
///
/// The result completes with the returned value, or with the panic as its
/// failure if `f` panics.
pub fn run<T, F>(f: F) -> Deferred<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    try_run(move || Ok(f()))
}

/// Like [`run`], for functions that can fail.
pub fn try_run<T, F>(f: F) -> Deferred<T>
where
    F: FnOnce() -> Outcome<T> + Send + 'static,
    T: Send + 'static,
{
    let (completer, result) = Deferred::pending();
    ThreadPool::global().enqueue(move || completer.settle(catch(f)));
    result
}

/// Returns a deferred result that completes successfully once `duration` has
/// elapsed.
///
/// The wait is driven by the global [`Timer`], so no pool worker is held. A zero
/// duration still completes asynchronously.
pub fn delay(duration: Duration) -> Deferred<()> {
    let (completer, result) = Deferred::pending();
    Timer::global().schedule(duration, move || completer.settle(Ok(())));
    result
}

/// Returns a deferred result that completes once every input has completed.
///
/// Completion order does not matter. Failures of individual inputs are not
/// aggregated: the combined result completes successfully even if some inputs
/// failed, and their failures are dropped. An empty input completes immediately.
pub fn when_all<T, I>(inputs: I) -> Deferred<()>
where
    I: IntoIterator<Item = Deferred<T>>,
    T: Send + 'static,
{
    let inputs: Vec<_> = inputs.into_iter().collect();
    if inputs.is_empty() {
        return Deferred::ready(());
    }

    let (completer, result) = Deferred::pending();
    let remaining = Arc::new(AtomicUsize::new(inputs.len()));
    for input in inputs {
        let remaining = remaining.clone();
        let completer = completer.clone();
        input.on_complete(move |_outcome| {
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                completer.settle(Ok(()));
            }
        });
    }
    result
}

/// Drives `sequence` one element at a time.
///
/// The first element is pulled on the calling thread. Each subsequent element is
/// pulled only after the previous one has completed, from a continuation on the
/// pool, so code producing the sequence (typically an iterator adapter or a
/// state machine implementing [`Iterator`]) resumes there, with the ambient
/// context it had when iteration started.
///
/// The result completes successfully once the sequence is exhausted. It completes
/// with a failure, and pulls no further elements, if an element completes with a
/// failure or pulling the next element panics.
pub fn iterate<T, I>(sequence: I) -> Deferred<()>
where
    I: IntoIterator<Item = Deferred<T>>,
    I::IntoIter: Send + 'static,
    T: Send + 'static,
{
    let (completer, result) = Deferred::pending();
    Iteration {
        iter: sequence.into_iter(),
        completer,
    }
    .advance();
    result
}

struct Iteration<I> {
    iter: I,
    completer: Completer<()>,
}

impl<I, T> Iteration<I>
where
    I: Iterator<Item = Deferred<T>> + Send + 'static,
    T: Send + 'static,
{
    fn advance(mut self) {
        match catch(|| Ok(self.iter.next())) {
            Ok(Some(element)) => element.on_complete(move |outcome| match outcome {
                Ok(_) => self.advance(),
                Err(failure) => self.completer.settle(Err(failure)),
            }),
            Ok(None) => self.completer.settle(Ok(())),
            Err(failure) => self.completer.settle(Err(failure)),
        }
    }
}
