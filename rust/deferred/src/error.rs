//! Error types of the deferred result primitive.
//!
//! Two channels exist:
//!
//! - [`Error`] (with its [`ErrorKind`]) is returned synchronously to the caller
//!   that misuses an instance, e.g. completing it twice.
//! - [`Failure`] is the value an operation fails *with*. It is captured where user
//!   code runs (a returned `Err` or a caught panic), stored on the corresponding
//!   deferred result, and only becomes visible to whoever observes that result.

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Mutex,
};

use thiserror::Error;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(Box<ErrorKind>);

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub type StdErrorBoxed = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of an asynchronous operation: the success value or the failure
/// it completed with.
pub type Outcome<T> = std::result::Result<T, Failure>;

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.0.as_ref()
    }

    pub fn into_kind(self) -> ErrorKind {
        *self.0
    }

    pub fn already_completed() -> Error {
        Error(ErrorKind::AlreadyCompleted.into())
    }

    pub fn operation_failure(failure: Failure) -> Error {
        Error(ErrorKind::OperationFailure { failure }.into())
    }

    pub fn is_already_completed(&self) -> bool {
        matches!(self.kind(), ErrorKind::AlreadyCompleted)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error(Box::new(kind))
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Error::operation_failure(failure)
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("deferred result is already completed")]
    AlreadyCompleted,

    #[error("operation failed: {failure}")]
    OperationFailure { failure: Failure },
}

/// The failure an asynchronous operation completed with.
///
/// A `Failure` is moved, never shared: a deferred result has a single consumer,
/// so exactly one place ends up owning it (a continuation, a blocking waiter, or
/// nobody, in which case it is dropped silently).
///
/// Any `std::error::Error + Send + Sync` converts into a `Failure`, so `?` works
/// inside callbacks returning [`Outcome`]. For this reason `Failure` itself does
/// not implement `std::error::Error`; wrap it in [`Error`] where one is needed.
pub enum Failure {
    /// User code panicked. The original payload is kept for [`Failure::resume`].
    Panic(PanicPayload),
    /// User code returned an error.
    Error(StdErrorBoxed),
}

impl Failure {
    /// Creates a failure carrying an ad-hoc message.
    pub fn msg(message: impl fmt::Display) -> Failure {
        Failure::Error(message.to_string().into())
    }

    /// Wraps a panic payload obtained from `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send + 'static>) -> Failure {
        Failure::Panic(PanicPayload::new(payload))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Failure::Panic(_))
    }

    /// Human readable description: the panic message, or the error's display text.
    pub fn message(&self) -> String {
        match self {
            Failure::Panic(payload) => payload.message().to_string(),
            Failure::Error(err) => err.to_string(),
        }
    }

    /// Returns the underlying error if this failure was produced by an error
    /// of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Failure::Panic(_) => None,
            Failure::Error(err) => err.downcast_ref::<E>(),
        }
    }

    /// Re-raises this failure on the current thread.
    ///
    /// A panic failure resumes unwinding with its original payload, so the
    /// re-raised panic is indistinguishable from the one that happened on the
    /// worker thread. An error failure panics with the error's message.
    pub fn resume(self) -> ! {
        match self {
            Failure::Panic(payload) => panic::resume_unwind(payload.into_inner()),
            Failure::Error(err) => panic!("operation failed: {err}"),
        }
    }
}

impl<E> From<E> for Failure
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Failure::Error(Box::new(err))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Panic(payload) => write!(f, "panicked: {}", payload.message()),
            Failure::Error(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Panic(payload) => f.debug_tuple("Panic").field(&payload.message()).finish(),
            Failure::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

/// Payload of a caught panic.
///
/// The payload is only `Send`; it sits behind a mutex so that `Failure` (and
/// therefore [`Error`]) stays `Sync`.
pub struct PanicPayload {
    message: String,
    payload: Mutex<Box<dyn Any + Send + 'static>>,
}

impl PanicPayload {
    fn new(payload: Box<dyn Any + Send + 'static>) -> PanicPayload {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        PanicPayload {
            message,
            payload: Mutex::new(payload),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn into_inner(self) -> Box<dyn Any + Send + 'static> {
        self.payload
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs user code, converting a panic into [`Failure::Panic`].
pub(crate) fn catch<T>(f: impl FnOnce() -> Outcome<T>) -> Outcome<T> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(Failure::from_panic(payload)))
}
