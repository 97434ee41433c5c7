//! Listener lists and RAII subscriptions.
//!
//! Every observable piece of the local tree (slots, proxy maps, arrays, node
//! lifecycles) and every engine/history signal is a [`Listeners`] list.
//! Subscribing returns a [`Subscription`]; dropping it removes the callback.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

type Callback<T> = Rc<dyn Fn(&T)>;

struct ListenerSet<T> {
    next_id: Cell<u64>,
    callbacks: RefCell<Vec<(u64, Callback<T>)>>,
}

/// An ordered list of callbacks receiving `&T`.
///
/// Emission snapshots the list first, so callbacks may subscribe or drop
/// subscriptions (including their own) while being invoked.
pub struct Listeners<T: 'static> {
    inner: Rc<ListenerSet<T>>,
}

impl<T: 'static> Listeners<T> {
    /// Create an empty listener list.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ListenerSet {
                next_id: Cell::new(0),
                callbacks: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Register a callback. It stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + 'static,
    {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner
            .callbacks
            .borrow_mut()
            .push((id, Rc::new(callback)));

        let weak = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(set) = weak.upgrade() {
                set.callbacks.borrow_mut().retain(|(cb_id, _)| *cb_id != id);
            }
        })
    }

    /// Invoke every registered callback in registration order.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .inner
            .callbacks
            .borrow()
            .iter()
            .map(|(_, cb)| Rc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(value);
        }
    }

    /// Remove every callback.
    pub fn clear(&self) {
        self.inner.callbacks.borrow_mut().clear();
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.inner.callbacks.borrow().len()
    }

    /// Whether no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> std::fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.len())
            .finish()
    }
}

/// Handle returned by [`Listeners::subscribe`]. Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_subscribers_in_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let a = Rc::clone(&seen);
        let _s1 = listeners.subscribe(move |v| a.borrow_mut().push(("a", *v)));
        let b = Rc::clone(&seen);
        let _s2 = listeners.subscribe(move |v| b.borrow_mut().push(("b", *v)));

        listeners.emit(&7);
        assert_eq!(*seen.borrow(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let sub = listeners.subscribe(move |_| c.set(c.get() + 1));

        listeners.emit(&());
        drop(sub);
        listeners.emit(&());

        assert_eq!(count.get(), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_subscription_outliving_listeners_is_harmless() {
        let sub = {
            let listeners: Listeners<()> = Listeners::new();
            listeners.subscribe(|_| {})
        };
        sub.unsubscribe();
    }
}
