//! Grouped undo/redo across the root document and its sub-documents.
//!
//! Every tracked document gets its own [`DocUndo`]. Recorded transactions on
//! any of them that land within one debounce window form a single step:
//!
//! ```text
//!            push                 push (within window)          poll() past deadline
//!   Idle ──────────► Collecting ─────────────────────► Collecting ──────────────────► Idle
//!                    {deadline,                        deadline refreshed,            step pushed
//!                     managers: [a],                   managers: [a, b]
//!                     before}
//! ```
//!
//! Time comes from an injected [`Clock`]; nothing fires on its own, so hosts
//! call [`MultiDocHistoryManager::poll`] from their event loop (tests use
//! [`ManualClock`]). Stepping back or forward closes an open group first.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use super::engine::{CursorPosition, DocScope, SubModelAdded, SyncEngine};
use super::history::{History, HistoryEntry, HistoryListeners};
use super::registry::DocKey;
use super::undo::DocUndo;
use crate::config::HistoryConfig;
use crate::error::{CollabError, Result};
use crate::model::Subscription;

/// Monotonic time source for the debounce window.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock advanced by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

/// Grouping state.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum GroupState {
    #[default]
    Idle,
    Collecting {
        /// The group closes once the clock reaches this instant
        deadline: Duration,
        /// Contributing tracks, once per recorded transaction
        managers: Vec<DocKey>,
        before: Option<CursorPosition>,
    },
}

impl GroupState {
    pub fn is_collecting(&self) -> bool {
        matches!(self, GroupState::Collecting { .. })
    }
}

struct MultiInner {
    weak_self: Weak<MultiInner>,
    engine: SyncEngine,
    clock: Rc<dyn Clock>,
    debounce: Duration,
    stack_size: usize,

    tracks: RefCell<IndexMap<DocKey, Rc<DocUndo>>>,
    track_subscriptions: RefCell<Vec<Subscription>>,

    /// `stack[..index]` can be undone, `stack[index..]` redone
    stack: RefCell<Vec<HistoryEntry>>,
    index: Cell<usize>,
    group: RefCell<GroupState>,

    /// Selection when the current batch of local changes began
    pending_before: RefCell<Option<CursorPosition>>,
    /// Selection after the latest flush of the open group
    latest_after: RefCell<Option<CursorPosition>>,

    listeners: HistoryListeners,
    subscriptions: RefCell<Vec<Subscription>>,
    destroyed: Cell<bool>,
}

/// One linear, debounced history over every tracked document.
pub struct MultiDocHistoryManager {
    inner: Rc<MultiInner>,
}

impl MultiDocHistoryManager {
    /// Manager using wall-clock time.
    pub fn new(engine: &SyncEngine, config: &HistoryConfig) -> Result<Self> {
        Self::with_clock(engine, config, Rc::new(SystemClock::new()))
    }

    pub fn with_clock(
        engine: &SyncEngine,
        config: &HistoryConfig,
        clock: Rc<dyn Clock>,
    ) -> Result<Self> {
        let inner = Rc::new_cyclic(|weak_self| MultiInner {
            weak_self: weak_self.clone(),
            engine: engine.clone(),
            clock,
            debounce: Duration::from_millis(config.debounce_ms),
            stack_size: config.stack_size.max(1),
            tracks: RefCell::new(IndexMap::new()),
            track_subscriptions: RefCell::new(Vec::new()),
            stack: RefCell::new(Vec::new()),
            index: Cell::new(0),
            group: RefCell::new(GroupState::Idle),
            pending_before: RefCell::new(None),
            latest_after: RefCell::new(None),
            listeners: HistoryListeners::default(),
            subscriptions: RefCell::new(Vec::new()),
            destroyed: Cell::new(false),
        });

        for key in engine.tracked_docs() {
            inner.track(key)?;
        }

        let weak = Rc::downgrade(&inner);
        let added = engine.on_sub_model_added(move |added: &SubModelAdded| {
            if let Some(inner) = weak.upgrade()
                && let Err(err) = inner.track(added.doc)
            {
                log::warn!("[MultiHistory] Could not track {}: {}", added.doc, err);
            }
        });
        let weak = Rc::downgrade(&inner);
        let before = engine.on_before_local_change(move |_| {
            if let Some(inner) = weak.upgrade()
                && !inner.group.borrow().is_collecting()
            {
                let position = inner.engine.capture_selection();
                *inner.pending_before.borrow_mut() = position;
            }
        });
        let weak = Rc::downgrade(&inner);
        let flushed = engine.on_flushed(move |summary| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if summary.recorded > 0 && inner.group.borrow().is_collecting() {
                let position = inner.engine.capture_selection();
                *inner.latest_after.borrow_mut() = position;
            }
            inner.compact_tracks();
        });
        inner
            .subscriptions
            .borrow_mut()
            .extend([added, before, flushed]);

        Ok(Self { inner })
    }

    /// Close the open group if its window has passed. Returns whether a step
    /// was pushed.
    pub fn poll(&self) -> bool {
        let pushed = self.inner.poll();
        self.inner.compact_tracks();
        pushed
    }

    /// Close the open group now, regardless of its deadline.
    pub fn commit_group(&self) -> bool {
        let pushed = self.inner.close_group();
        self.inner.compact_tracks();
        pushed
    }

    pub fn group_state(&self) -> GroupState {
        self.inner.group.borrow().clone()
    }

    /// Number of steps, undoable and redoable.
    pub fn len(&self) -> usize {
        self.inner.stack.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of steps that can be undone.
    pub fn index(&self) -> usize {
        self.inner.index.get()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.inner.stack.borrow().clone()
    }

    pub fn tracked_docs(&self) -> Vec<DocKey> {
        self.inner.tracks.borrow().keys().copied().collect()
    }

    /// Undo items still held by the tracks, reachable or not.
    pub fn retained_items(&self) -> usize {
        self.inner
            .tracks
            .borrow()
            .values()
            .map(|track| track.retained_items())
            .sum()
    }
}

impl MultiInner {
    fn track(&self, key: DocKey) -> Result<()> {
        if self.destroyed.get() || self.tracks.borrow().contains_key(&key) {
            return Ok(());
        }
        let (Some(doc), Some(scope), Some(origin)) = (
            self.engine.doc(key),
            self.engine.doc_scope(key),
            self.engine.record_origin(key),
        ) else {
            return Err(CollabError::invariant(format!(
                "{key} is not tracked by the engine"
            )));
        };
        let navigation = self.engine.navigation_origins();
        let undo = match &scope {
            DocScope::Map(map) => {
                DocUndo::new(&doc, key, map, &origin, self.stack_size, &navigation)
            }
            DocScope::Text(text) => {
                DocUndo::new(&doc, key, text, &origin, self.stack_size, &navigation)
            }
        };
        let weak = self.weak_self.clone();
        let pushed = undo.on_push(move |key| {
            if let Some(inner) = weak.upgrade() {
                inner.on_recorded(*key);
            }
        });
        self.track_subscriptions.borrow_mut().push(pushed);
        self.tracks.borrow_mut().insert(key, Rc::new(undo));
        log::debug!("[MultiHistory] Tracking {}", key);
        Ok(())
    }

    fn track_handles(&self, keys: &[DocKey]) -> Vec<Rc<DocUndo>> {
        let tracks = self.tracks.borrow();
        keys.iter()
            .filter_map(|key| tracks.get(key).cloned())
            .collect()
    }

    /// A recorded transaction landed on track `key`.
    fn on_recorded(&self, key: DocKey) {
        if self.destroyed.get() {
            return;
        }
        self.poll();
        let now = self.clock.now();

        let collecting = self.group.borrow().is_collecting();
        if !collecting {
            self.invalidate_branch();
            let before = self.pending_before.borrow_mut().take();
            *self.group.borrow_mut() = GroupState::Collecting {
                deadline: now + self.debounce,
                managers: vec![key],
                before,
            };
            log::debug!("[MultiHistory] Opened group on {}", key);
            return;
        }

        if let GroupState::Collecting {
            deadline, managers, ..
        } = &mut *self.group.borrow_mut()
        {
            managers.push(key);
            *deadline = now + self.debounce;
        }
    }

    /// Drop every step past the current index along with its redo data.
    fn invalidate_branch(&self) {
        let index = self.index.get();
        let dropped: Vec<HistoryEntry> = {
            let mut stack = self.stack.borrow_mut();
            if index >= stack.len() {
                return;
            }
            stack.drain(index..).collect()
        };
        log::debug!("[MultiHistory] Discarding {} redo step(s)", dropped.len());
        for entry in dropped {
            for track in self.track_handles(&entry.managers) {
                track.discard_redo();
            }
        }
    }

    /// Release undo items no step can reach. Must run outside transactions.
    fn compact_tracks(&self) {
        let tracks: Vec<_> = self.tracks.borrow().values().cloned().collect();
        for track in tracks {
            track.compact();
        }
    }

    /// Write queued local changes so the step applies to the current tree.
    fn settle_pending(&self) -> Result<()> {
        if self.engine.has_pending_changes() {
            self.engine.flush()?;
        }
        Ok(())
    }

    fn poll(&self) -> bool {
        let expired = match &*self.group.borrow() {
            GroupState::Collecting { deadline, .. } => self.clock.now() >= *deadline,
            GroupState::Idle => false,
        };
        expired && self.close_group()
    }

    fn close_group(&self) -> bool {
        let group = std::mem::take(&mut *self.group.borrow_mut());
        let GroupState::Collecting {
            managers, before, ..
        } = group
        else {
            return false;
        };
        let after = self.latest_after.borrow_mut().take();
        let evicted = {
            let mut stack = self.stack.borrow_mut();
            stack.push(HistoryEntry {
                before,
                after,
                managers,
            });
            let evicted = (stack.len() > self.stack_size).then(|| stack.remove(0));
            self.index.set(stack.len());
            evicted
        };
        if let Some(evicted) = evicted {
            log::debug!("[MultiHistory] Evicted oldest step");
            for track in self.track_handles(&evicted.managers) {
                track.evict_oldest();
            }
        }
        self.listeners.emit_push();
        true
    }
}

impl History for MultiDocHistoryManager {
    fn can_back(&self) -> bool {
        let inner = &self.inner;
        !inner.destroyed.get() && (inner.index.get() > 0 || inner.group.borrow().is_collecting())
    }

    fn can_forward(&self) -> bool {
        let inner = &self.inner;
        !inner.destroyed.get()
            && !inner.group.borrow().is_collecting()
            && inner.index.get() < inner.stack.borrow().len()
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
        inner.close_group();
        let Some(index) = inner.index.get().checked_sub(1) else {
            return Ok(false);
        };
        let entry = inner.stack.borrow()[index].clone();
        let tracks = inner.track_handles(&entry.managers);
        inner.engine.navigate_history(|| {
            for track in tracks.iter().rev() {
                track.undo();
            }
        })?;
        inner.compact_tracks();
        inner.index.set(index);
        inner.engine.restore_selection(entry.before.as_ref());
        log::debug!("[MultiHistory] Back to {}", index);
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
        let entry = inner.stack.borrow()[index].clone();
        let tracks = inner.track_handles(&entry.managers);
        inner.engine.navigate_history(|| {
            for track in &tracks {
                track.redo();
            }
        })?;
        inner.compact_tracks();
        inner.index.set(index + 1);
        inner.engine.restore_selection(entry.after.as_ref());
        log::debug!("[MultiHistory] Forward to {}", index + 1);
        inner.listeners.emit_forward();
        Ok(true)
    }

    fn clear(&self) {
        let inner = &self.inner;
        *inner.group.borrow_mut() = GroupState::Idle;
        inner.pending_before.borrow_mut().take();
        inner.latest_after.borrow_mut().take();
        inner.stack.borrow_mut().clear();
        inner.index.set(0);
        let tracks: Vec<_> = inner.tracks.borrow().values().cloned().collect();
        for track in tracks {
            track.clear();
            track.compact();
        }
        inner.listeners.emit_cleared();
    }

    fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.get() {
            return;
        }
        self.clear();
        inner.destroyed.set(true);
        let subscriptions = std::mem::take(&mut *inner.subscriptions.borrow_mut());
        drop(subscriptions);
        let subscriptions = std::mem::take(&mut *inner.track_subscriptions.borrow_mut());
        drop(subscriptions);
        let tracks = std::mem::take(&mut *inner.tracks.borrow_mut());
        for track in tracks.values() {
            track.destroy();
        }
        inner.listeners.clear();
        log::debug!("[MultiHistory] Destroyed");
    }

    fn listeners(&self) -> &HistoryListeners {
        &self.inner.listeners
    }
}

impl Drop for MultiDocHistoryManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for MultiDocHistoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiDocHistoryManager")
            .field("len", &self.len())
            .field("index", &self.index())
            .field("group", &self.inner.group.borrow())
            .field("tracks", &self.inner.tracks.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::new_shared_doc;
    use crate::model::{Component, ProxyMap};

    fn create_manager() -> (SyncEngine, Component, Rc<ManualClock>, MultiDocHistoryManager) {
        create_manager_with(10)
    }

    fn create_manager_with(
        stack_size: usize,
    ) -> (SyncEngine, Component, Rc<ManualClock>, MultiDocHistoryManager) {
        let engine = SyncEngine::new(new_shared_doc());
        let root = Component::new("page", ProxyMap::new());
        engine.bootstrap_root(&root).unwrap();
        let clock = Rc::new(ManualClock::new());
        let config = HistoryConfig {
            stack_size,
            debounce_ms: 500,
        };
        let manager = MultiDocHistoryManager::with_clock(&engine, &config, clock.clone()).unwrap();
        (engine, root, clock, manager)
    }

    fn edit(engine: &SyncEngine, root: &Component, key: &str, value: i64) {
        root.state().set(key, value);
        engine.flush().unwrap();
    }

    #[test]
    fn test_edits_within_window_form_one_step() {
        let (engine, root, clock, manager) = create_manager();
        edit(&engine, &root, "a", 1);
        clock.advance_ms(200);
        edit(&engine, &root, "b", 2);
        clock.advance_ms(400);

        assert!(!manager.poll());
        clock.advance_ms(100);
        assert!(manager.poll());
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.entries()[0].managers, vec![DocKey::ROOT, DocKey::ROOT]);

        assert!(manager.back().unwrap());
        assert!(root.state().is_empty());
    }

    #[test]
    fn test_expired_group_closes_on_next_edit() {
        let (engine, root, clock, manager) = create_manager();
        edit(&engine, &root, "a", 1);
        clock.advance_ms(600);
        edit(&engine, &root, "b", 2);

        assert_eq!(manager.len(), 1);
        assert!(manager.group_state().is_collecting());
    }

    #[test]
    fn test_back_closes_open_group() {
        let (engine, root, _clock, manager) = create_manager();
        edit(&engine, &root, "a", 1);

        assert!(manager.can_back());
        assert!(manager.back().unwrap());
        assert_eq!(manager.group_state(), GroupState::Idle);
        assert!(!root.state().contains_key("a"));
        assert!(manager.can_forward());
    }

    #[test]
    fn test_new_group_invalidates_forward_steps() {
        let (engine, root, clock, manager) = create_manager();
        edit(&engine, &root, "a", 1);
        manager.commit_group();
        clock.advance_ms(600);
        edit(&engine, &root, "b", 2);
        manager.commit_group();

        manager.back().unwrap();
        edit(&engine, &root, "c", 3);
        manager.commit_group();

        assert_eq!(manager.len(), 2);
        assert!(!manager.can_forward());
        assert!(!root.state().contains_key("b"));
    }

    #[test]
    fn test_oldest_groups_are_evicted() {
        let (engine, root, clock, manager) = create_manager_with(3);
        for (i, key) in ["e1", "e2", "e3", "e4", "e5"].iter().enumerate() {
            edit(&engine, &root, key, i as i64);
            clock.advance_ms(50);
            edit(&engine, &root, key, i as i64 + 10);
            manager.commit_group();
        }

        assert_eq!(manager.len(), 3);
        let mut steps = 0;
        while manager.back().unwrap() {
            steps += 1;
        }
        assert_eq!(steps, 3);
        assert!(root.state().contains_key("e1"));
        assert!(root.state().contains_key("e2"));
        assert!(!root.state().contains_key("e3"));
        assert!(!root.state().contains_key("e5"));
    }

    #[test]
    fn test_retained_undo_items_stay_bounded() {
        let (engine, root, _clock, manager) = create_manager_with(3);
        for i in 0..40 {
            edit(&engine, &root, "a", i);
            manager.commit_group();
        }

        assert_eq!(manager.len(), 3);
        assert!(manager.retained_items() <= 6);
        while manager.back().unwrap() {}
        assert_eq!(root.state().get("a").map(|v| v.to_json()), Some(serde_json::json!(36)));
    }

    #[test]
    fn test_back_writes_queued_edit_first() {
        let (engine, root, _clock, manager) = create_manager();
        edit(&engine, &root, "a", 1);
        manager.commit_group();
        root.state().set("b", 2);

        assert!(manager.back().unwrap());
        assert!(!engine.has_pending_changes());
        assert!(!root.state().contains_key("b"));
        assert!(root.state().contains_key("a"));
        assert!(manager.can_forward());
    }

    #[test]
    fn test_clear_resets_everything() {
        let (engine, root, _clock, manager) = create_manager();
        edit(&engine, &root, "a", 1);
        manager.commit_group();
        edit(&engine, &root, "b", 2);
        manager.clear();

        assert!(manager.is_empty());
        assert_eq!(manager.group_state(), GroupState::Idle);
        assert!(!manager.can_back());
    }
}
