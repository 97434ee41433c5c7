//! Linear undo/redo over the root document.
//!
//! [`HistoryManager`] drives a [`DocUndo`] scoped to the root map and pairs
//! every undo step with the selection before and after the edit, so stepping
//! back restores where the cursor was before the change and stepping forward
//! where it was after.
//!
//! Entries are appended when a recorded transaction lands. The transaction
//! commits inside [`SyncEngine::flush`], so the "after" cursor is captured
//! once the flush finishes.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use super::engine::{CursorPosition, SyncEngine, UndoPolicy};
use super::registry::DocKey;
use super::undo::DocUndo;
use crate::config::HistoryConfig;
use crate::error::{CollabError, Result};
use crate::model::{Listeners, Subscription};

/// One undo step with its cursors.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Selection just before the edit
    pub before: Option<CursorPosition>,
    /// Selection right after the edit was written
    pub after: Option<CursorPosition>,
    /// Undo tracks the step spans, once per recorded transaction
    pub managers: Vec<DocKey>,
}

/// Listener lists shared by the history managers.
#[derive(Default)]
pub struct HistoryListeners {
    change: Listeners<()>,
    back: Listeners<()>,
    forward: Listeners<()>,
    push: Listeners<()>,
}

impl HistoryListeners {
    fn emit_change(&self) {
        self.change.emit(&());
    }

    pub(crate) fn emit_push(&self) {
        self.push.emit(&());
        self.emit_change();
    }

    pub(crate) fn emit_back(&self) {
        self.back.emit(&());
        self.emit_change();
    }

    pub(crate) fn emit_forward(&self) {
        self.forward.emit(&());
        self.emit_change();
    }

    pub(crate) fn emit_cleared(&self) {
        self.emit_change();
    }

    pub(crate) fn clear(&self) {
        self.change.clear();
        self.back.clear();
        self.forward.clear();
        self.push.clear();
    }
}

/// Common surface of [`HistoryManager`] and
/// [`MultiDocHistoryManager`](super::MultiDocHistoryManager).
pub trait History {
    fn can_back(&self) -> bool;

    fn can_forward(&self) -> bool;

    /// Undo one step. Returns `Ok(false)` when there is nothing to undo.
    fn back(&self) -> Result<bool>;

    /// Redo one step. Returns `Ok(false)` when there is nothing to redo.
    fn forward(&self) -> Result<bool>;

    fn clear(&self);

    fn destroy(&self);

    fn listeners(&self) -> &HistoryListeners;

    /// Fires after every push, step and clear.
    fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&()) + 'static,
        Self: Sized,
    {
        self.listeners().change.subscribe(callback)
    }

    fn on_back<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&()) + 'static,
        Self: Sized,
    {
        self.listeners().back.subscribe(callback)
    }

    fn on_forward<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&()) + 'static,
        Self: Sized,
    {
        self.listeners().forward.subscribe(callback)
    }

    fn on_push<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&()) + 'static,
        Self: Sized,
    {
        self.listeners().push.subscribe(callback)
    }
}

struct HistoryInner {
    engine: SyncEngine,
    undo: DocUndo,
    stack_size: usize,

    /// `entries[..index]` can be undone, `entries[index..]` redone
    entries: RefCell<VecDeque<HistoryEntry>>,
    index: Cell<usize>,

    /// Selection captured when the current batch of local changes began
    before: RefCell<Option<CursorPosition>>,
    /// Entries pushed during the running flush, still missing `after`
    unfinished: Cell<usize>,

    /// Policy this manager put on the engine, if any
    installed: RefCell<Option<UndoPolicy>>,

    listeners: HistoryListeners,
    subscriptions: RefCell<Vec<Subscription>>,
    destroyed: Cell<bool>,
}

/// Undo/redo of the root document with cursor restoration.
pub struct HistoryManager {
    inner: Rc<HistoryInner>,
}

impl HistoryManager {
    pub fn new(engine: &SyncEngine, config: &HistoryConfig) -> Result<Self> {
        let origin = engine
            .record_origin(DocKey::ROOT)
            .ok_or_else(|| CollabError::invariant("the root document is not tracked"))?;
        let stack_size = config.stack_size.max(1);
        let undo = DocUndo::new(
            &engine.root_doc(),
            DocKey::ROOT,
            &engine.root_map(),
            &origin,
            stack_size,
            &engine.navigation_origins(),
        );

        let inner = Rc::new(HistoryInner {
            engine: engine.clone(),
            undo,
            stack_size,
            entries: RefCell::new(VecDeque::new()),
            index: Cell::new(0),
            before: RefCell::new(None),
            unfinished: Cell::new(0),
            installed: RefCell::new(None),
            listeners: HistoryListeners::default(),
            subscriptions: RefCell::new(Vec::new()),
            destroyed: Cell::new(false),
        });

        let weak = Rc::downgrade(&inner);
        let before = engine.on_before_local_change(move |_| {
            if let Some(inner) = weak.upgrade() {
                let position = inner.engine.capture_selection();
                *inner.before.borrow_mut() = position;
            }
        });
        let weak = Rc::downgrade(&inner);
        let pushed = inner.undo.on_push(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.record_entry();
            }
        });
        let weak: Weak<HistoryInner> = Rc::downgrade(&inner);
        let flushed = engine.on_flushed(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.finish_entries();
            }
        });
        inner
            .subscriptions
            .borrow_mut()
            .extend([before, pushed, flushed]);

        log::debug!("[History] Tracking root document, stack size {}", inner.stack_size);
        Ok(Self { inner })
    }

    /// Number of entries, undoable and redoable.
    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries that can be undone.
    pub fn index(&self) -> usize {
        self.inner.index.get()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.inner.entries.borrow().iter().cloned().collect()
    }

    pub fn undo_depth(&self) -> usize {
        self.inner.undo.undo_depth()
    }

    /// Install `policy` on the engine. [`History::destroy`] puts the default
    /// back only while this policy is still the engine's.
    pub fn set_undo_policy(&self, policy: UndoPolicy) {
        self.inner.engine.set_undo_policy(policy.clone());
        *self.inner.installed.borrow_mut() = Some(policy);
    }
}

impl HistoryInner {
    fn record_entry(&self) {
        if self.destroyed.get() {
            return;
        }
        let before = self.before.borrow().clone();
        {
            let mut entries = self.entries.borrow_mut();
            entries.truncate(self.index.get());
            entries.push_back(HistoryEntry {
                before,
                after: None,
                managers: vec![DocKey::ROOT],
            });
            while entries.len() > self.stack_size {
                entries.pop_front();
                log::debug!("[History] Evicted oldest entry");
            }
            self.index.set(entries.len());
        }
        if self.undo.undo_depth() > self.stack_size {
            self.undo.evict_oldest();
        }
        self.unfinished.set(self.unfinished.get() + 1);
        self.listeners.emit_push();
    }

    fn finish_entries(&self) {
        let unfinished = self.unfinished.replace(0);
        if unfinished == 0 {
            return;
        }
        let after = self.engine.capture_selection();
        let mut entries = self.entries.borrow_mut();
        let len = entries.len();
        for entry in entries.iter_mut().skip(len.saturating_sub(unfinished)) {
            entry.after = after.clone();
        }
        drop(entries);
        self.undo.compact();
    }

    /// Write queued local changes so the step applies to the current tree.
    fn settle_pending(&self) -> Result<()> {
        if self.engine.has_pending_changes() {
            self.engine.flush()?;
        }
        Ok(())
    }
}

impl History for HistoryManager {
    fn can_back(&self) -> bool {
        !self.inner.destroyed.get() && self.inner.index.get() > 0 && self.inner.undo.can_undo()
    }

    fn can_forward(&self) -> bool {
        let inner = &self.inner;
        !inner.destroyed.get()
            && inner.index.get() < inner.entries.borrow().len()
            && inner.undo.can_redo()
    }

    fn back(&self) -> Result<bool> {
        if self.inner.destroyed.get() {
            return Ok(false);
        }
        self.inner.settle_pending()?;
        if !self.can_back() {
            return Ok(false);
        }
        let inner = &self.inner;
        let index = inner.index.get() - 1;
        let entry = inner.entries.borrow().get(index).cloned();
        inner.engine.navigate_history(|| inner.undo.undo())?;
        inner.undo.compact();
        inner.index.set(index);
        if let Some(entry) = entry {
            inner.engine.restore_selection(entry.before.as_ref());
        }
        log::debug!("[History] Back to {}", index);
        inner.listeners.emit_back();
        Ok(true)
    }

    fn forward(&self) -> Result<bool> {
        if self.inner.destroyed.get() {
            return Ok(false);
        }
        self.inner.settle_pending()?;
        if !self.can_forward() {
            return Ok(false);
        }
        let inner = &self.inner;
        let index = inner.index.get();
        let entry = inner.entries.borrow().get(index).cloned();
        inner.engine.navigate_history(|| inner.undo.redo())?;
        inner.undo.compact();
        inner.index.set(index + 1);
        if let Some(entry) = entry {
            inner.engine.restore_selection(entry.after.as_ref());
        }
        log::debug!("[History] Forward to {}", index + 1);
        inner.listeners.emit_forward();
        Ok(true)
    }

    /// Clear the undo track. The most recent entry is kept as a baseline.
    fn clear(&self) {
        let inner = &self.inner;
        inner.undo.clear();
        inner.undo.compact();
        {
            let mut entries = inner.entries.borrow_mut();
            while entries.len() > 1 {
                entries.pop_front();
            }
            inner.index.set(entries.len());
        }
        inner.unfinished.set(0);
        inner.listeners.emit_cleared();
    }

    fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.replace(true) {
            return;
        }
        let subscriptions = std::mem::take(&mut *inner.subscriptions.borrow_mut());
        drop(subscriptions);
        if let Some(installed) = inner.installed.borrow_mut().take() {
            if inner.engine.undo_policy().same_as(&installed) {
                inner.engine.reset_undo_policy();
            }
        }
        inner.undo.destroy();
        inner.entries.borrow_mut().clear();
        inner.index.set(0);
        inner.listeners.clear();
        log::debug!("[History] Destroyed");
    }

    fn listeners(&self) -> &HistoryListeners {
        &self.inner.listeners
    }
}

impl Drop for HistoryManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for HistoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryManager")
            .field("len", &self.len())
            .field("index", &self.index())
            .field("undo_depth", &self.undo_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::new_shared_doc;
    use crate::model::{Component, ProxyMap};
    use serde_json::json;

    fn create_history(stack_size: usize) -> (SyncEngine, Component, HistoryManager) {
        let engine = SyncEngine::new(new_shared_doc());
        let root = Component::new("page", ProxyMap::new());
        engine.bootstrap_root(&root).unwrap();
        let config = HistoryConfig {
            stack_size,
            ..HistoryConfig::default()
        };
        let history = HistoryManager::new(&engine, &config).unwrap();
        (engine, root, history)
    }

    fn edit(engine: &SyncEngine, root: &Component, key: &str, value: i64) {
        root.state().set(key, value);
        engine.flush().unwrap();
    }

    #[test]
    fn test_each_recorded_flush_is_an_entry() {
        let (engine, root, history) = create_history(10);
        edit(&engine, &root, "a", 1);
        edit(&engine, &root, "b", 2);

        assert_eq!(history.len(), 2);
        assert!(history.can_back());
        assert!(!history.can_forward());
    }

    #[test]
    fn test_back_and_forward_restore_state() {
        let (engine, root, history) = create_history(10);
        edit(&engine, &root, "a", 1);
        edit(&engine, &root, "a", 2);

        assert!(history.back().unwrap());
        assert_eq!(root.state().get("a").map(|v| v.to_json()), Some(json!(1)));
        assert!(history.forward().unwrap());
        assert_eq!(root.state().get("a").map(|v| v.to_json()), Some(json!(2)));
        assert_eq!(engine.stats().history_navigations, 2);
    }

    #[test]
    fn test_oldest_entries_are_evicted_first() {
        let (engine, root, history) = create_history(3);
        for (i, key) in ["e1", "e2", "e3", "e4"].iter().enumerate() {
            edit(&engine, &root, key, i as i64);
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.undo_depth(), 3);
        while history.back().unwrap() {}
        assert!(root.state().contains_key("e1"));
        assert!(!root.state().contains_key("e2"));
    }

    #[test]
    fn test_clear_keeps_latest_entry() {
        let (engine, root, history) = create_history(3);
        for key in ["e1", "e2", "e3", "e4"] {
            edit(&engine, &root, key, 0);
        }
        history.clear();

        assert_eq!(history.len(), 1);
        assert!(!history.can_back());
    }

    #[test]
    fn test_new_edit_drops_redo_entries() {
        let (engine, root, history) = create_history(10);
        edit(&engine, &root, "a", 1);
        edit(&engine, &root, "b", 2);
        history.back().unwrap();
        edit(&engine, &root, "c", 3);

        assert_eq!(history.len(), 2);
        assert!(!history.can_forward());
    }

    #[test]
    fn test_listeners_fire() {
        let (engine, root, history) = create_history(10);
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        let _push = history.on_push(move |_| l.borrow_mut().push("push"));
        let l = Rc::clone(&log);
        let _back = history.on_back(move |_| l.borrow_mut().push("back"));
        let l = Rc::clone(&log);
        let _forward = history.on_forward(move |_| l.borrow_mut().push("forward"));

        edit(&engine, &root, "a", 1);
        history.back().unwrap();
        history.forward().unwrap();

        assert_eq!(*log.borrow(), vec!["push", "back", "forward"]);
    }

    #[test]
    fn test_back_writes_queued_edit_first() {
        let (engine, root, history) = create_history(10);
        edit(&engine, &root, "a", 1);
        root.state().set("a", 2);
        assert!(engine.has_pending_changes());

        assert!(history.back().unwrap());
        assert!(!engine.has_pending_changes());
        assert_eq!(root.state().get("a").map(|v| v.to_json()), Some(json!(1)));
        assert!(history.back().unwrap());
        assert!(!root.state().contains_key("a"));
    }

    #[test]
    fn test_retained_undo_items_stay_bounded() {
        let (engine, root, history) = create_history(3);
        for i in 0..40 {
            edit(&engine, &root, "a", i);
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.undo_depth(), 3);
        assert!(history.inner.undo.retained_items() <= 6);
        while history.back().unwrap() {}
        assert_eq!(root.state().get("a").map(|v| v.to_json()), Some(json!(36)));
    }

    #[test]
    fn test_destroy_keeps_policy_installed_by_others() {
        let (engine, _root, history) = create_history(10);
        let first = UndoPolicy {
            capture_transaction: Rc::new(|_| false),
            ..UndoPolicy::default()
        };
        history.set_undo_policy(first);

        let other = UndoPolicy {
            delete_filter: Rc::new(|_| false),
            ..UndoPolicy::default()
        };
        engine.set_undo_policy(other.clone());
        history.destroy();
        assert!(engine.undo_policy().same_as(&other));
    }

    #[test]
    fn test_destroy_resets_own_policy() {
        let (engine, _root, history) = create_history(10);
        let policy = UndoPolicy {
            capture_transaction: Rc::new(|_| false),
            ..UndoPolicy::default()
        };
        history.set_undo_policy(policy.clone());
        history.destroy();
        assert!(!engine.undo_policy().same_as(&policy));
    }

    #[test]
    fn test_destroy_without_policy_leaves_engine_policy() {
        let (engine, _root, first) = create_history(10);
        let second = HistoryManager::new(&engine, &HistoryConfig::default()).unwrap();
        let policy = UndoPolicy {
            delete_filter: Rc::new(|_| false),
            ..UndoPolicy::default()
        };
        second.set_undo_policy(policy.clone());

        drop(first);
        assert!(engine.undo_policy().same_as(&policy));
    }

    #[test]
    fn test_destroy_stops_recording() {
        let (engine, root, history) = create_history(10);
        history.destroy();
        edit(&engine, &root, "a", 1);

        assert!(history.is_empty());
        assert!(!history.can_back());
        assert!(!history.back().unwrap());
    }
}
