//! Fixed-size worker pool draining one shared queue of work items.
//!
//! Every [`WorkItem`] pairs a callback with the ambient [`Context`] snapshot that
//! was current where the item was queued. A worker installs that snapshot for
//! exactly the duration of the callback, so code resumed on a worker observes
//! the ambient values of the code that scheduled it, never whatever the worker
//! happened to run before.
//!
//! The pool knows nothing about deferred results; it only runs opaque callbacks.

use crate::{
    context::{Context, capture_current_context, run_with_context},
    error::Failure,
    simple_mpmc::{Receiver, Sender},
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

/// A boxed function that can be executed by a worker thread.
type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// A callback paired with the context snapshot it must run under.
///
/// An absent snapshot means the callback runs without any context restoration.
pub struct WorkItem {
    task: TaskFn,
    context: Option<Context>,
}

impl WorkItem {
    pub fn new<F>(task: F, context: Option<Context>) -> WorkItem
    where
        F: FnOnce() + Send + 'static,
    {
        WorkItem {
            task: Box::new(task),
            context,
        }
    }

    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// Runs the callback on the current thread, inside its context snapshot if
    /// one is present.
    pub fn run(self) {
        match self.context {
            Some(context) => run_with_context(context, self.task),
            None => (self.task)(),
        }
    }
}

/// A simple thread pool for executing queued callbacks.
///
/// `ThreadPool` manages a fixed set of worker threads that take [`WorkItem`]s from
/// an unbounded multi-producer, multi-consumer queue. Queueing never blocks.
///
/// ## Cloning
///
/// All clones share the same workers and queue. Workers of a pool created with
/// [`new`](Self::new) exit once every clone is dropped and the queue is drained.
/// The [`global`](Self::global) pool lives for the whole process.
///
/// ## Panics in work items
///
/// A panic escaping a callback is caught by the worker, logged, and the worker
/// moves on to the next item. Callbacks queued by the deferred result layer
/// never panic out; they turn panics into failures of the corresponding result.
#[derive(Clone)]
pub struct ThreadPool {
    tx: Sender<WorkItem>,
    num_threads: usize,
}

impl ThreadPool {
    /// Creates a new `ThreadPool` with the specified number of worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `num_threads` is 0.
    pub fn new(num_threads: usize) -> Self {
        Self::with_thread_name(num_threads, |_| String::new())
    }

    /// Creates a new `ThreadPool` with the specified number of worker threads and custom
    /// thread names.
    ///
    /// The provided `thread_name` function is called for each thread with its index
    /// to generate a name. If it returns an empty string, that thread is left unnamed.
    ///
    /// # Panics
    ///
    /// Panics if `num_threads` is 0.
    pub fn with_thread_name(num_threads: usize, thread_name: impl Fn(usize) -> String) -> Self {
        assert_ne!(num_threads, 0);

        let (tx, rx) = crate::simple_mpmc::channel::<WorkItem>();
        for i in 0..num_threads {
            let rx = rx.clone();
            let mut builder = thread::Builder::new();
            let name = thread_name(i);
            if !name.is_empty() {
                builder = builder.name(name);
            }
            builder
                .spawn(move || Self::thread_fn(rx))
                .expect("spawn thread");
        }
        log::debug!("started thread pool with {num_threads} workers");

        ThreadPool { tx, num_threads }
    }

    /// Configures the size of the global `ThreadPool`.
    ///
    /// Must be called before the first call to [`global()`](Self::global) to take
    /// effect; later calls are ignored. Values less than 1 are clamped to 1.
    pub fn configure_global_pool_size(pool_size: usize) {
        GLOBAL_POOL_SIZE.configure(pool_size);
    }

    /// Returns the process-wide `ThreadPool` used by the deferred result layer.
    ///
    /// The pool is started on first use, is never resized and never stopped:
    /// its workers block indefinitely waiting for work. Its size is determined by
    /// [`global_pool_size()`](Self::global_pool_size).
    pub fn global() -> &'static ThreadPool {
        static POOL: OnceLock<ThreadPool> = OnceLock::new();
        POOL.get_or_init(|| {
            let size = Self::global_pool_size();
            log::debug!("starting global thread pool ({size} workers)");
            ThreadPool::with_thread_name(size, |i| format!("deferred-worker-{i}"))
        })
    }

    /// Returns the number of workers the global pool has (or will have once started):
    /// 1. a value previously set via [`configure_global_pool_size()`](Self::configure_global_pool_size), or
    /// 2. the available parallelism of the system, or
    /// 3. 8 if that cannot be determined.
    pub fn global_pool_size() -> usize {
        GLOBAL_POOL_SIZE.get()
    }

    /// Creates a new `ThreadPool` with one worker per logical CPU (8 if the CPU
    /// count cannot be determined).
    pub fn with_default_threads() -> Self {
        Self::new(default_parallelism())
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Queues `f` for execution under the ambient context of the calling thread.
    ///
    /// Never blocks: the queue is unbounded.
    pub fn enqueue<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue_with_context(f, Some(capture_current_context()));
    }

    /// Queues `f` for execution under an explicitly provided context snapshot.
    ///
    /// With `None` the callback runs without any context restoration.
    pub fn enqueue_with_context<F>(&self, f: F, context: Option<Context>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(WorkItem::new(f, context))
            .expect("must have listening worker threads");
    }
}

impl ThreadPool {
    /// Worker thread function: runs work items until the queue disconnects.
    fn thread_fn(rx: Receiver<WorkItem>) {
        while let Ok(item) = rx.recv() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| item.run())) {
                log::error!(
                    "work item panicked on {:?}: {}",
                    thread::current().name().unwrap_or("<unnamed>"),
                    Failure::from_panic(payload)
                );
            }
        }
        log::trace!("thread pool worker exiting");
    }
}

impl Default for ThreadPool {
    /// Equivalent to [`with_default_threads()`](Self::with_default_threads).
    fn default() -> Self {
        Self::with_default_threads()
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

fn default_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8)
}

static GLOBAL_POOL_SIZE: PoolSize = PoolSize::new();

/// A configurable worker count; 0 means "not configured".
struct PoolSize(AtomicUsize);

impl PoolSize {
    const fn new() -> PoolSize {
        PoolSize(AtomicUsize::new(0))
    }

    fn configure(&self, pool_size: usize) {
        self.0.store(pool_size.max(1), Ordering::SeqCst);
    }

    fn get(&self) -> usize {
        match self.0.load(Ordering::SeqCst) {
            0 => default_parallelism(),
            size => size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::AmbientLocal, oneshot};
    use std::{
        sync::{Arc, Mutex, mpsc},
        time::{Duration, Instant},
    };

    /// Runs `f` on `pool` and blocks until its result comes back.
    fn run_on<R, F>(pool: &ThreadPool, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        pool.enqueue(move || {
            let _ = tx.send(f());
        });
        rx.recv().expect("work item panicked")
    }

    #[test]
    fn test_new_thread_pool() {
        let pool = ThreadPool::new(2);
        assert_eq!(pool.num_threads(), 2);
        drop(pool);
    }

    #[test]
    #[should_panic]
    fn test_new_thread_pool_zero_threads() {
        ThreadPool::new(0);
    }

    #[test]
    fn test_default_pool_size() {
        let parallelism = thread::available_parallelism().map_or(8, |n| n.get());
        assert_eq!(ThreadPool::with_default_threads().num_threads(), parallelism);
        assert_eq!(ThreadPool::default().num_threads(), parallelism);
        assert_eq!(PoolSize::new().get(), parallelism);
    }

    #[test]
    fn test_pool_size_configuration() {
        let size = PoolSize::new();
        size.configure(3);
        assert_eq!(size.get(), 3);
        // Values below one are clamped.
        size.configure(0);
        assert_eq!(size.get(), 1);
    }

    #[test]
    fn test_global_pool_size_reflects_configuration() {
        // Reconfigure with the current value so the global pool keeps its size
        // no matter which test starts it.
        let current = ThreadPool::global_pool_size();
        assert!(current >= 1);
        ThreadPool::configure_global_pool_size(current);
        assert_eq!(ThreadPool::global_pool_size(), current);
    }

    #[test]
    fn test_run_simple_item() {
        let pool = ThreadPool::new(2);
        assert_eq!(run_on(&pool, || 42), 42);
    }

    #[test]
    fn test_enqueue_runs_every_item() {
        let pool = ThreadPool::new(4);
        let (tx, rx) = mpsc::channel();

        for i in 0..20 {
            let tx = tx.clone();
            pool.enqueue(move || tx.send(i).unwrap());
        }
        drop(tx);

        let mut seen: Vec<_> = rx.iter().collect();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_item_execution() {
        let pool = ThreadPool::new(4);
        let start_time = Instant::now();
        let sleep_duration = Duration::from_millis(50);
        let (tx, rx) = mpsc::channel();

        for _ in 0..4 {
            let tx = tx.clone();
            pool.enqueue(move || {
                thread::sleep(sleep_duration);
                tx.send(42).unwrap();
            });
        }
        drop(tx);

        assert_eq!(rx.iter().collect::<Vec<_>>(), vec![42; 4]);
        // Four workers run four sleeps side by side.
        assert!(start_time.elapsed() < sleep_duration * 3);
    }

    #[test]
    fn test_single_worker_is_fifo() {
        let pool = ThreadPool::new(1);
        let results = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let results = results.clone();
            pool.enqueue(move || results.lock().unwrap().push(i));
        }
        // Runs after every item queued before it.
        run_on(&pool, || ());

        assert_eq!(*results.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_thread_pool_clone() {
        let pool1 = ThreadPool::new(2);
        let pool2 = pool1.clone();

        assert_eq!(run_on(&pool1, || "from pool1"), "from pool1");
        assert_eq!(run_on(&pool2, || "from pool2"), "from pool2");
        assert_eq!(pool2.num_threads(), 2);
    }

    #[test]
    fn test_workers_exit_when_pool_dropped() {
        let pool = ThreadPool::new(2);
        let (tx, rx) = mpsc::channel::<()>();
        for _ in 0..2 {
            let tx = tx.clone();
            // Each worker keeps its sender until it exits.
            pool.enqueue(move || {
                thread_local! {
                    static KEEP: std::cell::RefCell<Option<mpsc::Sender<()>>> =
                        const { std::cell::RefCell::new(None) };
                }
                KEEP.with(|keep| *keep.borrow_mut() = Some(tx));
            });
        }
        drop(tx);
        drop(pool);

        // Every sender goes away once the queue is drained and the workers exit.
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_thread_names() {
        let pool = ThreadPool::with_thread_name(2, |i| format!("test-worker-{i}"));
        let name = run_on(&pool, || thread::current().name().map(str::to_string)).unwrap();
        assert!(name.starts_with("test-worker-"));
    }

    #[test]
    fn test_recursive_enqueue() {
        let pool = ThreadPool::new(2);
        let inner_pool = pool.clone();

        let value = run_on(&pool, move || run_on(&inner_pool, || 100) + 50);
        assert_eq!(value, 150);
    }

    #[test]
    fn test_panicking_item_does_not_kill_worker() {
        let pool = ThreadPool::new(1);
        pool.enqueue(|| panic!("bad work item"));
        assert_eq!(run_on(&pool, || 7), 7);
    }

    #[test]
    fn test_context_flows_to_worker() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AmbientLocal::<usize>::new());
        let (tx, rx) = mpsc::channel();

        for i in 0..10 {
            counter.set(i);
            let (counter, tx) = (counter.clone(), tx.clone());
            pool.enqueue(move || tx.send((i, counter.get().map(|v| *v))).unwrap());
        }
        counter.clear();
        drop(tx);

        let mut seen: Vec<_> = rx.iter().collect();
        seen.sort();
        assert_eq!(seen, (0..10).map(|i| (i, Some(i))).collect::<Vec<_>>());
    }

    #[test]
    fn test_context_does_not_leak_between_items() {
        let pool = ThreadPool::new(1);
        let counter = Arc::new(AmbientLocal::<usize>::new());
        let (tx, rx) = mpsc::channel();

        counter.set(5);
        let (c, t) = (counter.clone(), tx.clone());
        pool.enqueue(move || {
            t.send(c.get().map(|v| *v)).unwrap();
            // Changes made inside an item are scoped to that item.
            c.set(6);
            t.send(c.get().map(|v| *v)).unwrap();
        });
        counter.clear();

        let c = counter.clone();
        pool.enqueue_with_context(move || tx.send(c.get().map(|v| *v)).unwrap(), None);

        assert_eq!(rx.iter().collect::<Vec<_>>(), vec![Some(5), Some(6), None]);
    }

    #[test]
    fn test_work_item_run() {
        let counter = AmbientLocal::<&'static str>::new();
        counter.set("captured");
        let context = capture_current_context();
        counter.clear();

        let (tx, rx) = mpsc::channel();
        let item = WorkItem::new(
            move || tx.send(AmbientLocal::get(&counter).map(|v| *v)).unwrap(),
            Some(context),
        );
        assert!(item.context().is_some());
        item.run();
        assert_eq!(rx.recv().unwrap(), Some("captured"));
    }

    #[test]
    fn test_global_thread_pool() {
        let global1 = ThreadPool::global();
        let global2 = ThreadPool::global();
        assert!(std::ptr::eq(global1, global2));
        assert_eq!(global1.num_threads(), ThreadPool::global_pool_size());

        let name = run_on(global1, || thread::current().name().map(str::to_string));
        assert!(name.unwrap().starts_with("deferred-worker-"));
    }
}
