//! Ambient context that flows across asynchronous hops.
//!
//! Every thread has a *current* [`Context`]: an immutable map of ambient values,
//! read and written through typed [`AmbientLocal`] slots. Nothing crosses a
//! thread boundary on its own. Code that schedules work captures a snapshot
//! with [`capture_current_context`], carries it along with the work explicitly,
//! and the thread that eventually runs the work installs it for exactly the
//! duration of the call with [`run_with_context`].
//!
//! Snapshots are never mutated. [`AmbientLocal::set`] builds a new context and
//! makes it current, so a snapshot captured earlier keeps observing the values
//! it was captured with.

use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

type Value = Arc<dyn Any + Send + Sync>;

type Values = HashMap<u64, Value, ahash::RandomState>;

/// An immutable snapshot of ambient values.
///
/// Cloning is cheap: all clones share the same map.
#[derive(Clone, Default)]
pub struct Context(Option<Arc<Values>>);

impl Context {
    /// Returns a context without any values.
    pub const fn empty() -> Context {
        Context(None)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots holding a value in this snapshot.
    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, |values| values.len())
    }

    fn get(&self, slot: u64) -> Option<&Value> {
        self.0.as_ref().and_then(|values| values.get(&slot))
    }

    /// Returns a new snapshot equal to this one except for `slot`.
    fn with_value(&self, slot: u64, value: Option<Value>) -> Context {
        let mut values = self.0.as_deref().cloned().unwrap_or_default();
        match value {
            Some(value) => {
                values.insert(slot, value);
            }
            None => {
                values.remove(&slot);
            }
        }
        if values.is_empty() {
            Context(None)
        } else {
            Context(Some(Arc::new(values)))
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("len", &self.len()).finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Context> = const { RefCell::new(Context::empty()) };
}

/// Captures the ambient context of the calling thread.
pub fn capture_current_context() -> Context {
    CURRENT.with(|current| current.borrow().clone())
}

/// Runs `f` with `context` installed as the current ambient context.
///
/// The previous context is restored when `f` returns or unwinds, so nothing
/// installed here is visible to whatever the thread runs next.
pub fn run_with_context<R>(context: Context, f: impl FnOnce() -> R) -> R {
    let _scope = ContextScope::enter(context);
    f()
}

/// Replaces the current context and swaps the previous one back on drop.
struct ContextScope {
    previous: Option<Context>,
}

impl ContextScope {
    fn enter(context: Context) -> ContextScope {
        let previous = CURRENT.with(|current| current.replace(context));
        ContextScope {
            previous: Some(previous),
        }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // The replaced context is dropped outside of the borrow: dropping a
            // value may run arbitrary code that reads the ambient context.
            let _installed = CURRENT.try_with(|current| current.replace(previous));
        }
    }
}

static NEXT_SLOT: AtomicU64 = AtomicU64::new(0);

/// A typed slot in the ambient context.
///
/// Values set through a slot are visible to the setting thread immediately and
/// to every continuation or work item scheduled afterwards from it, whichever
/// worker thread ends up running them.
pub struct AmbientLocal<T> {
    slot: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AmbientLocal<T>
where
    T: Send + Sync + 'static,
{
    pub fn new() -> AmbientLocal<T> {
        AmbientLocal {
            slot: NEXT_SLOT.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }

    /// Returns the value of this slot in the current context.
    pub fn get(&self) -> Option<Arc<T>> {
        CURRENT.with(|current| self.get_in(&current.borrow()))
    }

    /// Returns the value of this slot in the given snapshot.
    pub fn get_in(&self, context: &Context) -> Option<Arc<T>> {
        context
            .get(self.slot)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Calls `f` with a reference to the current value of this slot.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let value = self.get();
        f(value.as_deref())
    }

    /// Sets the value of this slot in the current context.
    pub fn set(&self, value: T) {
        self.replace_current(Some(Arc::new(value)));
    }

    /// Removes the value of this slot from the current context.
    pub fn clear(&self) {
        self.replace_current(None);
    }

    fn replace_current(&self, value: Option<Value>) {
        let _previous = CURRENT.with(|current| {
            let next = current.borrow().with_value(self.slot, value);
            current.replace(next)
        });
    }
}

impl<T> Default for AmbientLocal<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for AmbientLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmbientLocal").field("slot", &self.slot).finish()
    }
}
