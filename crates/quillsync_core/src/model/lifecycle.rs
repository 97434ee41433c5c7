//! Attachment state shared by every node of the local tree.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use super::events::{Listeners, Subscription};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle flags of a node.
///
/// - `destroyed` is a latch: once the node detaches it never re-attaches,
///   so a late sub-model load can check it and back off.
/// - `loaded` flips once, when the node's sub-model has been wired in.
/// - `needed` flips once, when the host first asks for the node's content.
#[derive(Debug, Default)]
pub struct Lifecycle {
    destroyed: Cell<bool>,
    loaded: Cell<bool>,
    needed: Cell<bool>,
    on_destroy: Listeners<()>,
    on_needed: Listeners<()>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.get()
    }

    pub fn is_needed(&self) -> bool {
        self.needed.get()
    }

    /// Mark the node loaded. Returns `false` if it already was.
    pub fn mark_loaded(&self) -> bool {
        !self.loaded.replace(true)
    }

    /// Signal that the node's content is now needed (e.g. about to render).
    ///
    /// Fires the `needed` listeners the first time only.
    pub fn request_load(&self) {
        if self.destroyed.get() || self.needed.replace(true) {
            return;
        }
        self.on_needed.emit(&());
    }

    pub fn on_needed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&()) + 'static,
    {
        self.on_needed.subscribe(callback)
    }

    pub fn on_destroy<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&()) + 'static,
    {
        self.on_destroy.subscribe(callback)
    }

    /// Latch the node as destroyed. Returns `false` if it already was.
    pub(crate) fn destroy(&self) -> bool {
        if self.destroyed.replace(true) {
            return false;
        }
        self.on_destroy.emit(&());
        self.on_destroy.clear();
        self.on_needed.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_mark_loaded_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.mark_loaded());
        assert!(!lifecycle.mark_loaded());
        assert!(lifecycle.is_loaded());
    }

    #[test]
    fn test_request_load_fires_once() {
        let lifecycle = Lifecycle::new();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let _sub = lifecycle.on_needed(move |_| c.set(c.get() + 1));

        lifecycle.request_load();
        lifecycle.request_load();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_destroyed_node_ignores_load_requests() {
        let lifecycle = Lifecycle::new();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let _sub = lifecycle.on_needed(move |_| c.set(c.get() + 1));

        assert!(lifecycle.destroy());
        assert!(!lifecycle.destroy());
        lifecycle.request_load();
        assert_eq!(count.get(), 0);
        assert!(lifecycle.is_destroyed());
    }
}
