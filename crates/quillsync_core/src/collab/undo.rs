//! One undo track per shared document.
//!
//! [`DocUndo`] wraps `yrs` [`UndoManager`]s scoped to one shared node and
//! tracking only the document's record origin, so silent and remote
//! transactions never become undo steps.
//!
//! The wrapped manager cannot drop its oldest item or clear only its redo
//! stack, both of which bounded linear history needs. The track therefore
//! keeps its own reachable depths, and spreads its items over generations of
//! managers: new items always land in the newest generation, a generation
//! that has recorded `capacity` items is retired in favor of a fresh one, and
//! [`DocUndo::compact`] clears and drops a retired generation once none of
//! its items is reachable. Evicted items stay in memory until their whole
//! generation goes, so a track retains at most about twice `capacity` undo
//! items plus its redo items.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::rc::{Rc, Weak};

use yrs::branch::{Branch, BranchPtr};
use yrs::undo::Options;
use yrs::{Doc, Origin, UndoManager};

use super::registry::DocKey;
use crate::model::{Listeners, Subscription};

/// Origins of the transactions undo tracks commit while stepping.
///
/// Shared between the engine and every track, so the engine can tell an
/// undo/redo transaction from a peer's.
#[derive(Debug, Clone, Default)]
pub struct NavigationOrigins(Rc<RefCell<HashSet<Origin>>>);

impl NavigationOrigins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, origin: &Origin) -> bool {
        self.0.borrow().contains(origin)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    fn insert(&self, origin: Origin) {
        self.0.borrow_mut().insert(origin);
    }

    fn remove(&self, origin: &Origin) {
        self.0.borrow_mut().remove(origin);
    }
}

struct Generation {
    manager: RefCell<UndoManager>,
    /// Origin of this manager's own undo/redo transactions
    origin: Origin,
    /// Reachable undo items
    undo: Cell<usize>,
    /// Reachable redo items
    redo: Cell<usize>,
    /// Items ever pushed
    recorded: Cell<usize>,
    _item_added: yrs::Subscription,
}

impl Generation {
    fn retained(&self) -> usize {
        let manager = self.manager.borrow();
        manager.undo_stack().len() + manager.redo_stack().len()
    }

    fn is_unreachable(&self) -> bool {
        self.undo.get() == 0 && self.redo.get() == 0
    }
}

struct Tracks {
    /// Oldest first; the last one records new items
    generations: RefCell<VecDeque<Rc<Generation>>>,
    navigating: Cell<bool>,
    pushed: Listeners<DocKey>,
}

impl Tracks {
    fn snapshot(&self) -> Vec<Rc<Generation>> {
        self.generations.borrow().iter().cloned().collect()
    }
}

/// Undo/redo track of one shared document.
pub struct DocUndo {
    doc: DocKey,
    handle: Doc,
    scope: BranchPtr,
    origin: String,
    capacity: usize,
    navigation: NavigationOrigins,
    tracks: Rc<Tracks>,
}

impl DocUndo {
    /// Track changes below `scope` made by transactions tagged `origin`.
    ///
    /// `capacity` is the number of items a generation records before it is
    /// retired; history managers pass their stack size.
    pub fn new<T: AsRef<Branch>>(
        doc: &Doc,
        key: DocKey,
        scope: &T,
        origin: &str,
        capacity: usize,
        navigation: &NavigationOrigins,
    ) -> Self {
        let track = Self {
            doc: key,
            handle: doc.clone(),
            scope: BranchPtr::from(scope.as_ref()),
            origin: origin.to_string(),
            capacity: capacity.max(1),
            navigation: navigation.clone(),
            tracks: Rc::new(Tracks {
                generations: RefCell::new(VecDeque::new()),
                navigating: Cell::new(false),
                pushed: Listeners::new(),
            }),
        };
        track.open_generation();
        track
    }

    pub fn doc(&self) -> DocKey {
        self.doc
    }

    /// Fires (inside the committing transaction) for every new undo item.
    pub fn on_push<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DocKey) + 'static,
    {
        self.tracks.pushed.subscribe(callback)
    }

    pub fn undo_depth(&self) -> usize {
        self.tracks.snapshot().iter().map(|g| g.undo.get()).sum()
    }

    pub fn redo_depth(&self) -> usize {
        self.tracks.snapshot().iter().map(|g| g.redo.get()).sum()
    }

    /// Undo and redo items held in memory, reachable or not.
    pub fn retained_items(&self) -> usize {
        self.tracks.snapshot().iter().map(|g| g.retained()).sum()
    }

    pub fn generations(&self) -> usize {
        self.tracks.generations.borrow().len()
    }

    pub fn can_undo(&self) -> bool {
        self.undo_generation().is_some()
    }

    pub fn can_redo(&self) -> bool {
        self.redo_generation().is_some()
    }

    /// Undo the most recent reachable item. Returns whether anything changed.
    pub fn undo(&self) -> bool {
        let Some(generation) = self.undo_generation() else {
            return false;
        };
        let changed = self.navigate(&generation, |manager| manager.undo_blocking());
        generation.undo.set(generation.undo.get() - 1);
        generation.redo.set(generation.redo.get() + 1);
        changed
    }

    pub fn redo(&self) -> bool {
        let Some(generation) = self.redo_generation() else {
            return false;
        };
        let changed = self.navigate(&generation, |manager| manager.redo_blocking());
        generation.redo.set(generation.redo.get() - 1);
        generation.undo.set(generation.undo.get() + 1);
        changed
    }

    /// Make the oldest reachable undo item unreachable.
    pub fn evict_oldest(&self) {
        let generations = self.tracks.snapshot();
        if let Some(generation) = generations.iter().find(|g| g.undo.get() > 0) {
            generation.undo.set(generation.undo.get() - 1);
        }
    }

    /// Make every redo item unreachable.
    pub fn discard_redo(&self) {
        for generation in self.tracks.snapshot() {
            generation.redo.set(0);
        }
    }

    /// Release memory held for unreachable items and retire a full
    /// generation. Must run outside of any transaction on the document.
    pub fn compact(&self) {
        let generations = self.tracks.snapshot();
        let Some((current, retired)) = generations.split_last() else {
            return;
        };
        for generation in retired.iter().filter(|g| g.is_unreachable()) {
            self.drop_generation(generation);
        }
        if current.is_unreachable() && current.retained() > 0 {
            current.manager.borrow_mut().clear();
            current.recorded.set(0);
            log::debug!("[DocUndo] Released unreachable items of {}", self.doc);
        } else if current.recorded.get() >= self.capacity {
            current
                .manager
                .borrow_mut()
                .exclude_origin(self.origin.as_str());
            self.open_generation();
            log::debug!("[DocUndo] Retired a full generation of {}", self.doc);
        }
    }

    /// Drop both stacks.
    pub fn clear(&self) {
        let generations = self.tracks.snapshot();
        let Some((current, retired)) = generations.split_last() else {
            return;
        };
        for generation in retired {
            self.drop_generation(generation);
        }
        current.manager.borrow_mut().clear();
        current.undo.set(0);
        current.redo.set(0);
        current.recorded.set(0);
    }

    /// Drop both stacks and every push listener, and stop tracking the
    /// record origin.
    pub fn destroy(&self) {
        self.clear();
        for generation in self.tracks.snapshot() {
            generation
                .manager
                .borrow_mut()
                .exclude_origin(self.origin.as_str());
            self.navigation.remove(&generation.origin);
        }
        self.tracks.pushed.clear();
    }

    fn undo_generation(&self) -> Option<Rc<Generation>> {
        self.tracks
            .snapshot()
            .into_iter()
            .rev()
            .find(|g| g.undo.get() > 0 && g.manager.borrow().can_undo())
    }

    fn redo_generation(&self) -> Option<Rc<Generation>> {
        self.tracks
            .snapshot()
            .into_iter()
            .find(|g| g.redo.get() > 0 && g.manager.borrow().can_redo())
    }

    fn open_generation(&self) {
        let mut options = Options::default();
        options.capture_timeout_millis = 0;
        let mut manager = UndoManager::with_options(&self.handle, options);
        manager.expand_scope(&self.scope);
        manager.include_origin(self.origin.as_str());
        let origin = manager.as_origin();

        let key = self.doc;
        let tracks = Rc::downgrade(&self.tracks);
        let generation = Rc::new_cyclic(|weak: &Weak<Generation>| {
            let this = weak.clone();
            let item_added = manager.observe_item_added(move |_txn, _event| {
                let (Some(tracks), Some(this)) = (tracks.upgrade(), this.upgrade()) else {
                    return;
                };
                if tracks.navigating.get() {
                    return;
                }
                this.undo.set(this.undo.get() + 1);
                this.recorded.set(this.recorded.get() + 1);
                for generation in tracks.generations.borrow().iter() {
                    generation.redo.set(0);
                }
                tracks.pushed.emit(&key);
            });
            Generation {
                manager: RefCell::new(manager),
                origin: origin.clone(),
                undo: Cell::new(0),
                redo: Cell::new(0),
                recorded: Cell::new(0),
                _item_added: item_added,
            }
        });
        self.navigation.insert(origin);
        self.tracks.generations.borrow_mut().push_back(generation);
    }

    fn drop_generation(&self, generation: &Rc<Generation>) {
        generation.manager.borrow_mut().clear();
        self.navigation.remove(&generation.origin);
        self.tracks
            .generations
            .borrow_mut()
            .retain(|g| !Rc::ptr_eq(g, generation));
    }

    fn navigate(
        &self,
        generation: &Generation,
        step: impl FnOnce(&mut UndoManager) -> bool,
    ) -> bool {
        self.tracks.navigating.set(true);
        let changed = step(&mut generation.manager.borrow_mut());
        self.tracks.navigating.set(false);
        changed
    }
}

impl std::fmt::Debug for DocUndo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocUndo")
            .field("doc", &self.doc)
            .field("undo_depth", &self.undo_depth())
            .field("redo_depth", &self.redo_depth())
            .field("generations", &self.generations())
            .finish()
    }
}
