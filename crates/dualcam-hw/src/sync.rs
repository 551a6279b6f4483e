//! Small synchronization helpers shared by the session, lifecycle and
//! pipeline layers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Every value guarded in this crate stays structurally valid across a
/// panic, so poisoning carries no information we act on.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f`, logging instead of propagating a panic. Returns `false` if it panicked.
pub(crate) fn guarded(what: &str, f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            tracing::error!(listener = what, "listener panicked; continuing with the rest");
            false
        }
    }
}

/// Copy-on-write listener registry.
///
/// Dispatch iterates over a snapshot, so a listener may add or remove
/// listeners (itself included) from inside its own callback. Taking a
/// snapshot is a reference-count bump, not an allocation.
pub struct ListenerSet<T: ?Sized> {
    inner: Mutex<Arc<Vec<Arc<T>>>>,
}

impl<T: ?Sized> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Arc::new(Vec::new())),
        }
    }

    /// Register a listener. Adding the same `Arc` twice is a no-op, which keeps
    /// delivery at most once per event.
    pub fn add(&self, listener: Arc<T>) {
        let mut guard = lock(&self.inner);
        if guard.iter().any(|l| same(l, &listener)) {
            return;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
    }

    /// Deregister a listener. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<T>) -> bool {
        let mut guard = lock(&self.inner);
        if !guard.iter().any(|l| same(l, listener)) {
            return false;
        }
        let next: Vec<Arc<T>> = guard.iter().filter(|l| !same(l, listener)).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    /// Listeners in registration order, as of now.
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        Arc::clone(&lock(&self.inner))
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Compare data pointers only; vtable pointers for the same type may differ
// between codegen units.
fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}
