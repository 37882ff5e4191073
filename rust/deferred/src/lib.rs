//! Deferred results with continuations, executed on a shared worker pool.
//!
//! A [`Deferred`] is a placeholder for the outcome of an operation that finishes
//! later: either a value or a [`Failure`]. Work resumes when the outcome is
//! available by attaching a continuation, instead of blocking a thread on it.
//! Continuations run on the global [`ThreadPool`] and observe the ambient
//! [`context`] of the code that attached them.
//!
//! # Key Components
//!
//! ## Deferred Results
//!
//! - [`deferred`] - The single-assignment [`Deferred`] / [`Completer`] pair,
//!   continuations, chaining and blocking waits
//! - [`ops`] - [`run`], [`delay`], [`when_all`] and [`iterate`]
//!
//! ## Execution
//!
//! - [`thread_pool::ThreadPool`] - Fixed-size pool of workers draining a shared queue
//! - [`timer::Timer`] - Dedicated thread firing one-shot alarms, used by [`delay`]
//! - [`context`] - Ambient values that flow from the scheduling site into callbacks
//!
//! ## Communication Channels
//!
//! - [`oneshot`] - Single-value communication between threads
//! - [`simple_mpmc`] - Multi-producer, multi-consumer channels (temporary until
//!   `std::sync::mpmc` is stabilized)
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! let greeting = deferred::delay(Duration::from_millis(10))
//!     .continue_with(|outcome| {
//!         outcome?;
//!         Ok("A".to_string())
//!     })
//!     .continue_with(|outcome| Ok(outcome? + "2"));
//!
//! assert_eq!(greeting.join(), "A2");
//! ```

pub mod context;
pub mod deferred;
pub mod error;
pub mod oneshot;
pub mod ops;
pub mod simple_mpmc;
pub mod thread_pool;
pub mod timer;

pub use context::{AmbientLocal, Context, capture_current_context, run_with_context};
pub use deferred::{Completer, Deferred};
pub use error::{Error, ErrorKind, Failure, Outcome, Result};
pub use ops::{delay, iterate, run, try_run, when_all};
pub use thread_pool::ThreadPool;

pub(crate) const ERR_POISONED_LOCK: &str = "poisoned lock";
