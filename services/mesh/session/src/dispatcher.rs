//! Name-keyed handler registry with synchronous fan-out.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Shared event handler.
///
/// Handlers compare by identity, so the same `Handler` value (or a clone of
/// it) is needed to unbind what was bound.
pub struct Handler<A: ?Sized>(Arc<dyn Fn(&A) + Send + Sync>);

impl<A: ?Sized> Handler<A> {
    /// Wrap a closure
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invoke the handler
    pub fn call(&self, args: &A) {
        (self.0)(args)
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<A: ?Sized> Clone for Handler<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A: ?Sized> fmt::Debug for Handler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler@{:p}", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Event dispatcher.
///
/// Handlers run on the triggering thread, in registration order, with no
/// internal lock held, so a handler may freely bind, unbind or trigger on the
/// same dispatcher.
pub struct EventDispatcher<A: ?Sized> {
    handlers: Mutex<HashMap<String, Vec<Handler<A>>>>,
}

impl<A: ?Sized> Default for EventDispatcher<A> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }
}

impl<A: ?Sized> EventDispatcher<A> {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Returns `false` if it was already bound.
    pub fn bind(&self, kind: &str, handler: Handler<A>) -> bool {
        let mut handlers = self.handlers.lock();
        let list = handlers.entry(kind.to_string()).or_default();
        if list.iter().any(|h| h.ptr_eq(&handler)) {
            return false;
        }
        list.push(handler);
        true
    }

    /// Remove one handler. Returns `true` if it was bound.
    pub fn unbind(&self, kind: &str, handler: &Handler<A>) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| !h.ptr_eq(handler));
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(kind);
        }
        removed
    }

    /// Remove every handler for `kind`, returning how many were bound.
    pub fn unbind_all(&self, kind: &str) -> usize {
        self.handlers
            .lock()
            .remove(kind)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Remove every handler of every type.
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }

    /// Invoke every handler bound to `kind`. Unbound types are a no-op.
    pub fn trigger(&self, kind: &str, args: &A) {
        let snapshot = match self.handlers.lock().get(kind) {
            Some(list) => list.clone(),
            None => return,
        };
        for handler in snapshot {
            handler.call(args);
        }
    }

    /// Whether anything is bound to `kind`.
    pub fn is_bound(&self, kind: &str) -> bool {
        self.handlers.lock().contains_key(kind)
    }

    /// Types with at least one handler.
    pub fn bound_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.lock().keys().cloned().collect();
        types.sort();
        types
    }
}
