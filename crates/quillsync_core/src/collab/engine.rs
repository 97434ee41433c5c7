//! The sync engine.
//!
//! [`SyncEngine`] keeps a local tree and a set of shared documents (the root
//! document plus one sub-document per loaded async node) in agreement:
//!
//! - **Local → shared.** Every bound node reports its changes to the engine,
//!   which queues them per document. [`SyncEngine::flush`] splits each queue
//!   into runs of equal `recordable` flag and writes every run in one
//!   transaction whose origin is the document's record origin (an undo step)
//!   or its silent origin (not undoable).
//! - **Shared → local.** A deep observer per document replays text, map and
//!   array deltas onto the bound local nodes with [`ChangeMeta::remote`],
//!   which the local listeners skip, so a replay never echoes back.
//!
//! At most one of flushing, applying a remote update and navigating history
//! runs at a time; [`Direction`] is entered through a guard and a nested
//! entry fails with [`CollabError::Reentrant`].
//!
//! # Example
//!
//! ```ignore
//! use quillsync_core::collab::{SyncEngine, new_shared_doc};
//! use quillsync_core::model::{Component, ContentType, ProxyMap, Slot};
//!
//! let engine = SyncEngine::new(new_shared_doc());
//! let root = Component::new("page", ProxyMap::new());
//! engine.bootstrap_root(&root)?;
//!
//! let title = Slot::new(vec![ContentType::Text]);
//! root.state().set("title", title.clone());
//! engine.flush()?;
//!
//! title.insert_text(0, "Hello", Default::default());
//! engine.flush()?;
//!
//! let update = engine.encode_state_as_update();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use indexmap::IndexMap;
use yrs::types::text::TextEvent;
use yrs::types::{Attrs, Change, Delta, EntryChange, Event, Events};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Assoc, DeepObservable, Doc, IndexedSequence, Map, MapRef, Out,
    ReadTxn, StateVector, StickyIndex, Text, TextRef, Transact, TransactionMut, Update,
};

use super::convert::{
    self, ConvertContext, STATE_KEY, attrs_to_formats, attrs_to_patch, attrs_to_slot_changes,
    decode_content, decode_entries, decode_items, decode_value, json_to_any, patch_to_attrs,
};
use super::host::{
    ComponentFactory, FormatRegistry, ImmediateScheduler, LocalSelection, NamedComponentFactory,
    Scheduler, SelectionBridge, SelectionSnapshot, StaticFormatRegistry,
};
use super::loader::{
    LocalBoxFuture, NonSubModelLoader, SubModelLoader, SubModelRequest, SubModelTarget,
};
use super::rebase::{self, Rebase};
use super::registry::{DocKey, SharedKey, SharedText, SlotRegistry};
use super::undo::NavigationOrigins;
use crate::config::SyncConfig;
use crate::error::{CollabError, Result};
use crate::model::{
    ArrayChange, ArrayEvent, ChangeMeta, Component, ContentKind, Lifecycle, Listeners, MapChange, MapEvent,
    NodeId, ProxyArray, ProxyMap, Slot, SlotChange, SlotContent, SlotEvent, Subscription,
    WeakProxyArray, WeakProxyMap, WeakSlot,
};

/// Origin of transactions applying updates received from peers.
pub const REMOTE_ORIGIN: &str = "quillsync:remote";

// ==================== Public types ====================

/// What the engine is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Idle,
    /// Writing queued local changes into shared documents
    Flushing,
    /// Replaying shared changes received from a peer
    ApplyingRemote,
    /// Replaying an undo or redo step
    NavigatingHistory,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Idle => "idle",
            Direction::Flushing => "flushing",
            Direction::ApplyingRemote => "applying-remote",
            Direction::NavigatingHistory => "navigating-history",
        }
    }
}

/// State of one document's pending-action queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueState {
    #[default]
    Idle,
    Buffering,
    Flushing,
}

/// A local change waiting to be written to a shared node.
#[derive(Clone)]
pub enum SharedOp {
    Slot { slot: WeakSlot, change: SlotChange },
    Map { map: WeakProxyMap, change: MapChange },
    Array { array: WeakProxyArray, change: ArrayChange },
}

impl SharedOp {
    /// Whether the op removes content.
    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            SharedOp::Slot {
                change: SlotChange::Delete { .. },
                ..
            } | SharedOp::Map {
                change: MapChange::PropDelete { .. },
                ..
            } | SharedOp::Array {
                change: ArrayChange::Delete { .. },
                ..
            }
        )
    }
}

impl std::fmt::Debug for SharedOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SharedOp::Slot { change, .. } => f.debug_tuple("Slot").field(change).finish(),
            SharedOp::Map { change, .. } => f.debug_tuple("Map").field(change).finish(),
            SharedOp::Array { change, .. } => f.debug_tuple("Array").field(change).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingAction {
    pub recordable: bool,
    pub op: SharedOp,
}

/// Passed to [`UndoPolicy::capture_transaction`] before a recordable run is
/// written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionInfo {
    pub doc: DocKey,
    /// Number of queued actions in the run
    pub actions: usize,
}

/// Predicates deciding what becomes an undo step.
///
/// Both default to accepting everything. A transaction the capture
/// predicate rejects is written with the silent origin; a delete the filter
/// rejects is written as non-recordable.
#[derive(Clone)]
pub struct UndoPolicy {
    pub capture_transaction: Rc<dyn Fn(&TransactionInfo) -> bool>,
    pub delete_filter: Rc<dyn Fn(&SharedOp) -> bool>,
}

impl Default for UndoPolicy {
    fn default() -> Self {
        Self {
            capture_transaction: Rc::new(|_| true),
            delete_filter: Rc::new(|_| true),
        }
    }
}

impl UndoPolicy {
    /// Whether both policies are the same installed predicates.
    pub fn same_as(&self, other: &UndoPolicy) -> bool {
        Rc::ptr_eq(&self.capture_transaction, &other.capture_transaction)
            && Rc::ptr_eq(&self.delete_filter, &other.delete_filter)
    }
}

impl std::fmt::Debug for UndoPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoPolicy").finish_non_exhaustive()
    }
}

/// One end of a selection, anchored to shared content.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorEndpoint {
    pub text: SharedKey,
    pub index: StickyIndex,
}

/// A selection that survives concurrent edits.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPosition {
    pub anchor: CursorEndpoint,
    pub focus: CursorEndpoint,
}

/// The shared node a tracked document is observed through.
#[derive(Debug, Clone)]
pub enum DocScope {
    /// Root map of the main document, or state map of a component sub-document
    Map(MapRef),
    /// Content text of a slot sub-document
    Text(TextRef),
}

/// Announcement of a newly wired sub-document.
#[derive(Debug, Clone)]
pub struct SubModelAdded {
    pub doc: DocKey,
    pub guid: String,
    /// Local node the sub-document backs
    pub node: NodeId,
    pub scope: DocScope,
}

/// Outcome of one [`SyncEngine::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub transactions: usize,
    /// Transactions written with a record origin
    pub recorded: usize,
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub flushes: u64,
    pub transactions: u64,
    pub remote_applies: u64,
    pub history_navigations: u64,
    pub rejected_reentries: u64,
}

/// Host collaborators and settings for a [`SyncEngine`].
#[derive(Clone)]
pub struct EngineOptions {
    pub config: SyncConfig,
    pub scheduler: Rc<dyn Scheduler>,
    pub formats: Rc<dyn FormatRegistry>,
    pub components: Rc<dyn ComponentFactory>,
    pub selection: Rc<dyn SelectionBridge>,
    pub loader: Rc<dyn SubModelLoader>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            config: SyncConfig::default(),
            scheduler: Rc::new(ImmediateScheduler),
            formats: Rc::new(StaticFormatRegistry::permissive()),
            components: Rc::new(NamedComponentFactory::permissive()),
            selection: Rc::new(LocalSelection::new()),
            loader: Rc::new(NonSubModelLoader),
        }
    }
}

impl EngineOptions {
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Rc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_formats(mut self, formats: Rc<dyn FormatRegistry>) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_components(mut self, components: Rc<dyn ComponentFactory>) -> Self {
        self.components = components;
        self
    }

    pub fn with_selection(mut self, selection: Rc<dyn SelectionBridge>) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_loader(mut self, loader: Rc<dyn SubModelLoader>) -> Self {
        self.loader = loader;
        self
    }
}

// ==================== Internal state ====================

struct TrackedDoc {
    doc: Doc,
    guid: Option<String>,
    scope: DocScope,
    record_origin: String,
    silent_origin: String,
    observer: Option<yrs::Subscription>,
}

#[derive(Default)]
struct DocQueue {
    state: QueueState,
    actions: Vec<PendingAction>,
}

#[derive(Clone)]
enum SharedNode {
    Map(MapRef),
    Array(ArrayRef),
    /// Wrapper text of a slot
    Wrapper(TextRef),
}

#[derive(Clone)]
struct Binding {
    key: SharedKey,
    shared: SharedNode,
}

#[derive(Clone)]
enum Bound {
    Map(WeakProxyMap),
    Array(WeakProxyArray),
    Wrapper(WeakSlot),
}

/// A queued op checked against live bindings, ready to write.
enum Resolved {
    Content { text: TextRef, change: SlotChange },
    Header { wrapper: TextRef, change: SlotChange },
    Map { map: MapRef, change: MapChange },
    Array { array: ArrayRef, change: ArrayChange },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnSource {
    /// Written by a flush or bootstrap of this engine
    Local,
    /// An undo or redo step of one of this engine's tracks
    History,
    /// A peer's update, or anything else committed on the document
    Remote,
}

struct DirectionGuard<'a> {
    direction: &'a Cell<Direction>,
}

impl Drop for DirectionGuard<'_> {
    fn drop(&mut self) {
        self.direction.set(Direction::Idle);
    }
}

struct EngineInner {
    weak_self: Weak<EngineInner>,
    config: SyncConfig,
    scheduler: Rc<dyn Scheduler>,
    formats: Rc<dyn FormatRegistry>,
    components: Rc<dyn ComponentFactory>,
    selection: Rc<dyn SelectionBridge>,
    loader: Rc<dyn SubModelLoader>,
    root_map: MapRef,
    root: RefCell<Option<Component>>,
    policy: RefCell<UndoPolicy>,
    navigation: NavigationOrigins,
    direction: Cell<Direction>,
    destroyed: Cell<bool>,
    stats: Cell<EngineStats>,

    docs: RefCell<IndexMap<DocKey, TrackedDoc>>,
    next_doc: Cell<u32>,
    queues: RefCell<IndexMap<DocKey, DocQueue>>,

    /// Slot ↔ content text
    registry: RefCell<SlotRegistry>,
    /// Shared node → local node
    bound: RefCell<HashMap<SharedKey, Bound>>,
    /// Local node → shared node
    shared_of: RefCell<HashMap<NodeId, Binding>>,
    /// Change and destroy listeners of bound nodes
    node_subs: RefCell<HashMap<NodeId, Vec<Subscription>>>,
    /// `needed`/destroy listeners of async nodes awaiting a load request
    load_subs: RefCell<HashMap<NodeId, Vec<Subscription>>>,

    requested: RefCell<HashSet<NodeId>>,
    pending_loads: RefCell<Vec<LocalBoxFuture<'static, Result<()>>>>,
    observer_error: RefCell<Option<CollabError>>,

    before_local_change: Listeners<()>,
    flushed: Listeners<FlushSummary>,
    sub_model_added: Listeners<SubModelAdded>,
}

// ==================== SyncEngine ====================

/// Handle to a sync engine. Clones share the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Rc<EngineInner>,
}

impl SyncEngine {
    /// Engine over `doc` with default collaborators.
    pub fn new(doc: Doc) -> Self {
        Self::with_options(doc, EngineOptions::default())
    }

    pub fn with_options(doc: Doc, options: EngineOptions) -> Self {
        let root_map = doc.get_or_insert_map(options.config.root_name.as_str());
        let inner = Rc::new_cyclic(|weak_self| EngineInner {
            weak_self: weak_self.clone(),
            config: options.config,
            scheduler: options.scheduler,
            formats: options.formats,
            components: options.components,
            selection: options.selection,
            loader: options.loader,
            root_map: root_map.clone(),
            root: RefCell::new(None),
            policy: RefCell::new(UndoPolicy::default()),
            navigation: NavigationOrigins::new(),
            direction: Cell::new(Direction::Idle),
            destroyed: Cell::new(false),
            stats: Cell::new(EngineStats::default()),
            docs: RefCell::new(IndexMap::new()),
            next_doc: Cell::new(0),
            queues: RefCell::new(IndexMap::new()),
            registry: RefCell::new(SlotRegistry::new()),
            bound: RefCell::new(HashMap::new()),
            shared_of: RefCell::new(HashMap::new()),
            node_subs: RefCell::new(HashMap::new()),
            load_subs: RefCell::new(HashMap::new()),
            requested: RefCell::new(HashSet::new()),
            pending_loads: RefCell::new(Vec::new()),
            observer_error: RefCell::new(None),
            before_local_change: Listeners::new(),
            flushed: Listeners::new(),
            sub_model_added: Listeners::new(),
        });
        let key = inner.register_doc(doc, None, DocScope::Map(root_map));
        inner.observe(key);
        Self { inner }
    }

    /// Connect the local root component to the shared root.
    ///
    /// When the shared root already holds a state the local state is cleared
    /// and rebuilt from it; otherwise the local root is written out in one
    /// non-recorded transaction. The root must be a synchronous component.
    pub fn bootstrap_root(&self, root: &Component) -> Result<()> {
        self.inner.bootstrap_root(root)
    }

    /// The root component passed to [`bootstrap_root`](Self::bootstrap_root).
    pub fn root(&self) -> Option<Component> {
        self.inner.root.borrow().clone()
    }

    /// Write every queued local change.
    ///
    /// Queues always end up empty and idle. The first error is returned
    /// after cleanup; transactions committed before it stay committed.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    /// Apply a v1 update from a peer to the root document.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<()> {
        self.inner.apply_remote_update(DocKey::ROOT, update)
    }

    /// Apply a v1 update from a peer to a tracked document.
    pub fn apply_remote_update_to(&self, doc: DocKey, update: &[u8]) -> Result<()> {
        self.inner.apply_remote_update(doc, update)
    }

    /// Full state of the root document as a v1 update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let doc = self.root_doc();
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// State vector of the root document.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let doc = self.root_doc();
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Changes of the root document a peer with `state_vector` is missing.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        let state_vector =
            StateVector::decode_v1(state_vector).map_err(|e| CollabError::Crdt(e.to_string()))?;
        let doc = self.root_doc();
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&state_vector))
    }

    /// Snapshot the editor selection as sticky positions.
    ///
    /// Returns `None` when there is no selection, an endpoint's slot is not
    /// bound to shared content, or the document is inside a transaction.
    pub fn capture_selection(&self) -> Option<CursorPosition> {
        self.inner.capture_selection()
    }

    /// Resolve `position` against the current content and hand it to the
    /// selection bridge. `None` clears the selection.
    ///
    /// Returns `false` (leaving the selection alone) when an endpoint no
    /// longer resolves.
    pub fn restore_selection(&self, position: Option<&CursorPosition>) -> bool {
        self.inner.restore_selection(position)
    }

    /// Drive every pending sub-model load to completion, including loads
    /// requested while settling. Returns the first failure.
    pub async fn settle(&self) -> Result<()> {
        let mut first_error = None;
        loop {
            let batch = std::mem::take(&mut *self.inner.pending_loads.borrow_mut());
            if batch.is_empty() {
                break;
            }
            for load in batch {
                if let Err(err) = load.await {
                    log::warn!("[SyncEngine] Sub-model load failed: {}", err);
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// [`settle`](Self::settle) on the current thread.
    pub fn settle_blocking(&self) -> Result<()> {
        futures_lite::future::block_on(self.settle())
    }

    pub fn has_pending_loads(&self) -> bool {
        !self.inner.pending_loads.borrow().is_empty()
    }

    /// Fires when the engine goes from no buffered changes to some.
    pub fn on_before_local_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&()) + 'static,
    {
        self.inner.before_local_change.subscribe(callback)
    }

    /// Fires after every flush that had something to write.
    pub fn on_flushed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&FlushSummary) + 'static,
    {
        self.inner.flushed.subscribe(callback)
    }

    pub fn on_sub_model_added<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SubModelAdded) + 'static,
    {
        self.inner.sub_model_added.subscribe(callback)
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.stats.get()
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction.get()
    }

    pub fn queue_state(&self, doc: DocKey) -> QueueState {
        self.inner
            .queues
            .borrow()
            .get(&doc)
            .map(|queue| queue.state)
            .unwrap_or_default()
    }

    /// Whether any document has queued local changes.
    pub fn has_pending_changes(&self) -> bool {
        self.inner.has_pending()
    }

    pub fn pending_actions(&self, doc: DocKey) -> usize {
        self.inner
            .queues
            .borrow()
            .get(&doc)
            .map_or(0, |queue| queue.actions.len())
    }

    pub fn root_doc(&self) -> Doc {
        // The root document is registered first and never removed.
        self.inner.docs.borrow()[0].doc.clone()
    }

    pub fn root_map(&self) -> MapRef {
        self.inner.root_map.clone()
    }

    pub fn doc(&self, key: DocKey) -> Option<Doc> {
        self.inner.doc_handle(key)
    }

    pub fn doc_scope(&self, key: DocKey) -> Option<DocScope> {
        self.inner
            .docs
            .borrow()
            .get(&key)
            .map(|tracked| tracked.scope.clone())
    }

    pub fn doc_key_for_guid(&self, guid: &str) -> Option<DocKey> {
        self.inner
            .docs
            .borrow()
            .iter()
            .find(|(_, tracked)| tracked.guid.as_deref() == Some(guid))
            .map(|(key, _)| *key)
    }

    /// Every tracked document, root first.
    pub fn tracked_docs(&self) -> Vec<DocKey> {
        self.inner.docs.borrow().keys().copied().collect()
    }

    /// Origin of the recordable transactions written to `doc`.
    pub fn record_origin(&self, doc: DocKey) -> Option<String> {
        self.inner
            .docs
            .borrow()
            .get(&doc)
            .map(|tracked| tracked.record_origin.clone())
    }

    /// The shared content text bound to `slot`.
    pub fn shared_text_for(&self, slot: &Slot) -> Option<SharedText> {
        self.inner.registry.borrow().text_for(slot)
    }

    pub fn slot_for_text(&self, key: &SharedKey) -> Option<Slot> {
        self.inner.registry.borrow().slot_for(key)
    }

    pub fn set_undo_policy(&self, policy: UndoPolicy) {
        *self.inner.policy.borrow_mut() = policy;
    }

    pub fn undo_policy(&self) -> UndoPolicy {
        self.inner.policy.borrow().clone()
    }

    /// Registry the undo tracks of this engine's documents record their
    /// stepping origins in.
    pub fn navigation_origins(&self) -> NavigationOrigins {
        self.inner.navigation.clone()
    }

    pub fn reset_undo_policy(&self) {
        self.set_undo_policy(UndoPolicy::default());
    }

    /// Stop syncing: drop observers, queues, bindings and pending loads.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    /// Run an undo/redo step with the engine navigating history, so its
    /// shared changes replay through
    /// [`Scheduler::apply_as_history_navigation`].
    pub(crate) fn navigate_history<R>(&self, step: impl FnOnce() -> R) -> Result<R> {
        self.inner.navigate_history(step)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("direction", &self.inner.direction.get())
            .field("docs", &self.inner.docs.borrow().len())
            .field("stats", &self.inner.stats.get())
            .finish()
    }
}

// ==================== Engine internals ====================

impl EngineInner {
    fn bump(&self, update: impl FnOnce(&mut EngineStats)) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }

    fn enter(&self, next: Direction) -> Result<DirectionGuard<'_>> {
        let active = self.direction.get();
        if active != Direction::Idle {
            self.bump(|stats| stats.rejected_reentries += 1);
            log::warn!(
                "[SyncEngine] Rejected {} while {}",
                next.as_str(),
                active.as_str()
            );
            return Err(CollabError::Reentrant {
                active: active.as_str(),
                attempted: next.as_str(),
            });
        }
        self.direction.set(next);
        Ok(DirectionGuard {
            direction: &self.direction,
        })
    }

    fn has_pending(&self) -> bool {
        self.queues
            .borrow()
            .values()
            .any(|queue| !queue.actions.is_empty())
    }

    fn take_observer_error(&self) -> Result<()> {
        match self.observer_error.borrow_mut().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ---------- documents ----------

    fn register_doc(&self, doc: Doc, guid: Option<String>, scope: DocScope) -> DocKey {
        let key = DocKey(self.next_doc.get());
        self.next_doc.set(key.0 + 1);
        log::debug!("[SyncEngine] Tracking {} (guid {:?})", key, guid);
        self.docs.borrow_mut().insert(
            key,
            TrackedDoc {
                doc,
                guid,
                scope,
                record_origin: format!("quillsync:record:{}", key.0),
                silent_origin: format!("quillsync:silent:{}", key.0),
                observer: None,
            },
        );
        key
    }

    fn observe(&self, key: DocKey) {
        let Some(scope) = self.docs.borrow().get(&key).map(|t| t.scope.clone()) else {
            return;
        };
        let weak = self.weak_self.clone();
        let callback = move |txn: &TransactionMut, events: &Events| {
            if let Some(engine) = weak.upgrade() {
                engine.on_shared_events(key, txn, events);
            }
        };
        let subscription = match scope {
            DocScope::Map(map) => map.observe_deep(callback),
            DocScope::Text(text) => text.observe_deep(callback),
        };
        if let Some(tracked) = self.docs.borrow_mut().get_mut(&key) {
            tracked.observer = Some(subscription);
        }
    }

    fn doc_handle(&self, key: DocKey) -> Option<Doc> {
        self.docs.borrow().get(&key).map(|tracked| tracked.doc.clone())
    }

    fn origins(&self, key: DocKey) -> Option<(Doc, String, String)> {
        self.docs.borrow().get(&key).map(|tracked| {
            (
                tracked.doc.clone(),
                tracked.record_origin.clone(),
                tracked.silent_origin.clone(),
            )
        })
    }

    fn root_origins(&self) -> Result<(Doc, String, String)> {
        self.origins(DocKey::ROOT)
            .ok_or_else(|| CollabError::invariant("the root document is not tracked"))
    }

    // ---------- bootstrap ----------

    fn bootstrap_root(&self, root: &Component) -> Result<()> {
        if root.kind() != ContentKind::Sync {
            return Err(CollabError::UnsupportedOperation {
                operation: "bootstrap_root",
                reason: "the root component must be synchronous".to_string(),
            });
        }
        let (doc, _, silent) = self.root_origins()?;
        let has_state = {
            let txn = doc.transact();
            self.root_map.get(&txn, STATE_KEY).is_some()
        };

        if has_state {
            log::debug!("[SyncEngine] Pulling root '{}' from the shared document", root.name());
            let _guard = self.enter(Direction::ApplyingRemote)?;
            let txn = doc.transact();
            self.pull_root_state(&txn, root)?;
        } else {
            log::debug!("[SyncEngine] Pushing root '{}' to the shared document", root.name());
            let mut names = Vec::new();
            convert::component_tree_names(root, &mut names);
            self.check_components(names)?;

            let _guard = self.enter(Direction::Flushing)?;
            {
                let mut txn = doc.transact_mut_with(silent.as_str());
                convert::write_component(self, &mut txn, DocKey::ROOT, &self.root_map, root);
            }
            self.bump(|stats| stats.transactions += 1);
        }
        *self.root.borrow_mut() = Some(root.clone());
        Ok(())
    }

    /// Replace the local root state with the shared one and bind it.
    fn pull_root_state<T: ReadTxn>(&self, txn: &T, root: &Component) -> Result<()> {
        let Some(Out::YMap(state)) = self.root_map.get(txn, STATE_KEY) else {
            return Err(CollabError::invariant("shared root has no state map"));
        };
        let entries = decode_entries(self, txn, DocKey::ROOT, &state)?;
        let local = root.state();
        let mut entries = Some(entries);
        self.scheduler.apply_as_remote_update(&mut || {
            local.clear_with(ChangeMeta::remote());
            for (key, value) in entries.take().into_iter().flatten() {
                local.apply(MapChange::PropSet { key, value }, ChangeMeta::remote());
            }
        });
        self.bind_map(DocKey::ROOT, &state, local);
        Ok(())
    }

    // ---------- local → shared ----------

    fn enqueue(&self, doc: DocKey, action: PendingAction) {
        let first = {
            let mut queues = self.queues.borrow_mut();
            let was_empty = queues.values().all(|queue| queue.actions.is_empty());
            let queue = queues.entry(doc).or_default();
            if queue.state == QueueState::Idle {
                queue.state = QueueState::Buffering;
            }
            queue.actions.push(action);
            was_empty
        };
        if first {
            self.before_local_change.emit(&());
        }
    }

    fn enqueue_slot(&self, slot: &Slot, event: &SlotEvent) {
        if event.meta.is_remote() || self.destroyed.get() {
            return;
        }
        let doc = match event.change {
            SlotChange::AttrSet { .. } | SlotChange::AttrDelete { .. } => self
                .shared_of
                .borrow()
                .get(&slot.id())
                .map(|binding| binding.key.doc),
            _ => self.registry.borrow().text_for(slot).map(|text| text.doc()),
        };
        let Some(doc) = doc else {
            log::debug!(
                "[SyncEngine] Slot {:?} has no shared counterpart yet, change not queued",
                slot.id()
            );
            return;
        };
        self.enqueue(
            doc,
            PendingAction {
                recordable: event.meta.recordable,
                op: SharedOp::Slot {
                    slot: slot.downgrade(),
                    change: event.change.clone(),
                },
            },
        );
    }

    fn enqueue_map(&self, map: &ProxyMap, event: &MapEvent) {
        if event.meta.is_remote() || self.destroyed.get() {
            return;
        }
        let doc = self.shared_of.borrow().get(&map.id()).map(|b| b.key.doc);
        let Some(doc) = doc else {
            log::debug!("[SyncEngine] Map {:?} is not bound, change not queued", map.id());
            return;
        };
        self.enqueue(
            doc,
            PendingAction {
                recordable: event.meta.recordable,
                op: SharedOp::Map {
                    map: map.downgrade(),
                    change: event.change.clone(),
                },
            },
        );
    }

    fn enqueue_array(&self, array: &ProxyArray, event: &ArrayEvent) {
        if event.meta.is_remote() || self.destroyed.get() {
            return;
        }
        let doc = self.shared_of.borrow().get(&array.id()).map(|b| b.key.doc);
        let Some(doc) = doc else {
            log::debug!("[SyncEngine] Array {:?} is not bound, change not queued", array.id());
            return;
        };
        self.enqueue(
            doc,
            PendingAction {
                recordable: event.meta.recordable,
                op: SharedOp::Array {
                    array: array.downgrade(),
                    change: event.change.clone(),
                },
            },
        );
    }

    fn flush(&self) -> Result<()> {
        let guard = self.enter(Direction::Flushing)?;
        let batches: Vec<(DocKey, Vec<PendingAction>)> = {
            let mut queues = self.queues.borrow_mut();
            queues
                .iter_mut()
                .filter(|(_, queue)| !queue.actions.is_empty())
                .map(|(key, queue)| {
                    queue.state = QueueState::Flushing;
                    (*key, std::mem::take(&mut queue.actions))
                })
                .collect()
        };
        if batches.is_empty() {
            return Ok(());
        }

        let mut summary = FlushSummary::default();
        let mut result = Ok(());
        for (doc, actions) in batches {
            if result.is_ok() {
                result = self.flush_doc(doc, actions, &mut summary);
            } else {
                log::warn!(
                    "[SyncEngine] Dropping {} queued action(s) for {} after an earlier failure",
                    actions.len(),
                    doc
                );
            }
        }
        for queue in self.queues.borrow_mut().values_mut() {
            queue.state = QueueState::Idle;
            queue.actions.clear();
        }
        drop(guard);

        self.bump(|stats| stats.flushes += 1);
        log::debug!(
            "[SyncEngine] Flushed {} transaction(s), {} recorded",
            summary.transactions,
            summary.recorded
        );
        self.flushed.emit(&summary);
        result
    }

    fn flush_doc(
        &self,
        doc: DocKey,
        actions: Vec<PendingAction>,
        summary: &mut FlushSummary,
    ) -> Result<()> {
        let Some((handle, record, silent)) = self.origins(doc) else {
            log::warn!("[SyncEngine] {} is no longer tracked, dropping its queue", doc);
            return Ok(());
        };
        let policy = self.policy.borrow().clone();
        let actions = actions
            .into_iter()
            .map(|mut action| {
                if action.recordable && action.op.is_delete() && !(policy.delete_filter)(&action.op)
                {
                    action.recordable = false;
                }
                action
            })
            .collect();

        for run in partition_runs(actions) {
            let recordable = run.first().is_some_and(|action| action.recordable);
            let tracked = recordable
                && (policy.capture_transaction)(&TransactionInfo {
                    doc,
                    actions: run.len(),
                });

            let mut resolved = Vec::with_capacity(run.len());
            for action in &run {
                if let Some(op) = self.resolve(doc, &action.op)? {
                    resolved.push(op);
                }
            }
            if resolved.is_empty() {
                continue;
            }

            let origin = if tracked { &record } else { &silent };
            {
                let mut txn = handle.transact_mut_with(origin.as_str());
                for op in resolved {
                    self.write(&mut txn, doc, op);
                }
            }
            summary.transactions += 1;
            if tracked {
                summary.recorded += 1;
            }
            self.bump(|stats| stats.transactions += 1);
        }
        Ok(())
    }

    fn check_components(&self, names: Vec<String>) -> Result<()> {
        match names
            .into_iter()
            .find(|name| !self.components.supports(name))
        {
            Some(name) => Err(CollabError::UnknownComponent(name)),
            None => Ok(()),
        }
    }

    /// Check a queued op against the live bindings. `None` means the target
    /// is gone and the op is skipped.
    fn resolve(&self, doc: DocKey, op: &SharedOp) -> Result<Option<Resolved>> {
        match op {
            SharedOp::Slot { slot, change } => {
                let Some(slot) = slot.upgrade().filter(|s| !s.lifecycle().is_destroyed()) else {
                    return Ok(None);
                };
                match change {
                    SlotChange::AttrSet { .. } | SlotChange::AttrDelete { .. } => {
                        let binding = self.shared_of.borrow().get(&slot.id()).cloned();
                        match binding {
                            Some(Binding {
                                key,
                                shared: SharedNode::Wrapper(wrapper),
                            }) if key.doc == doc => Ok(Some(Resolved::Header {
                                wrapper,
                                change: change.clone(),
                            })),
                            _ => Err(CollabError::invariant(format!(
                                "slot {:?} has no shared wrapper in {}",
                                slot.id(),
                                doc
                            ))),
                        }
                    }
                    _ => {
                        if let SlotChange::Insert {
                            content: SlotContent::Component(component),
                            ..
                        } = change
                        {
                            let mut names = Vec::new();
                            convert::component_tree_names(component, &mut names);
                            self.check_components(names)?;
                        }
                        let text = self.registry.borrow().text_for(&slot);
                        match text {
                            Some(text) if text.doc() == doc => Ok(Some(Resolved::Content {
                                text: text.text,
                                change: change.clone(),
                            })),
                            _ => Err(CollabError::invariant(format!(
                                "slot {:?} has no shared content in {}",
                                slot.id(),
                                doc
                            ))),
                        }
                    }
                }
            }
            SharedOp::Map { map, change } => {
                let Some(map) = map.upgrade().filter(|m| !m.lifecycle().is_destroyed()) else {
                    return Ok(None);
                };
                if let MapChange::PropSet { value, .. } = change {
                    let mut names = Vec::new();
                    convert::component_names(value, &mut names);
                    self.check_components(names)?;
                }
                let binding = self.shared_of.borrow().get(&map.id()).cloned();
                match binding {
                    Some(Binding {
                        key,
                        shared: SharedNode::Map(shared),
                    }) if key.doc == doc => Ok(Some(Resolved::Map {
                        map: shared,
                        change: change.clone(),
                    })),
                    _ => Err(CollabError::invariant(format!(
                        "map {:?} has no shared map in {}",
                        map.id(),
                        doc
                    ))),
                }
            }
            SharedOp::Array { array, change } => {
                let Some(array) = array.upgrade().filter(|a| !a.lifecycle().is_destroyed())
                else {
                    return Ok(None);
                };
                let mut names = Vec::new();
                match change {
                    ArrayChange::Insert { values, .. } => {
                        for value in values {
                            convert::component_names(value, &mut names);
                        }
                    }
                    ArrayChange::SetIndex { value, .. } => {
                        convert::component_names(value, &mut names);
                    }
                    ArrayChange::Delete { .. } => {}
                }
                self.check_components(names)?;
                let binding = self.shared_of.borrow().get(&array.id()).cloned();
                match binding {
                    Some(Binding {
                        key,
                        shared: SharedNode::Array(shared),
                    }) if key.doc == doc => Ok(Some(Resolved::Array {
                        array: shared,
                        change: change.clone(),
                    })),
                    _ => Err(CollabError::invariant(format!(
                        "array {:?} has no shared array in {}",
                        array.id(),
                        doc
                    ))),
                }
            }
        }
    }

    fn write(&self, txn: &mut TransactionMut, doc: DocKey, op: Resolved) {
        match op {
            Resolved::Content { text, change } => self.write_content(txn, doc, &text, change),
            Resolved::Header { wrapper, change } => write_header(txn, &wrapper, change),
            Resolved::Map { map, change } => match change {
                MapChange::PropSet { key, value } => {
                    convert::write_map_entry(self, txn, doc, &map, &key, &value);
                }
                MapChange::PropDelete { key } => {
                    map.remove(txn, &key);
                }
            },
            Resolved::Array { array, change } => self.write_array(txn, doc, &array, change),
        }
    }

    fn write_content(&self, txn: &mut TransactionMut, doc: DocKey, text: &TextRef, change: SlotChange) {
        let len = text.len(&*txn);
        match change {
            SlotChange::Insert {
                index,
                content,
                formats,
            } => {
                let index = clamp_index("text insert", index, len);
                convert::insert_content(self, txn, doc, text, index, &content, &formats);
            }
            SlotChange::Delete { index, count } => {
                if let Some((index, count)) = clamp_range("text delete", index, count, len) {
                    text.remove_range(txn, index, count);
                }
            }
            SlotChange::Retain {
                index,
                count,
                formats,
            } => {
                if let Some((index, count)) = clamp_range("text format", index, count, len) {
                    text.format(txn, index, count, patch_to_attrs(&formats));
                }
            }
            SlotChange::AttrSet { .. } | SlotChange::AttrDelete { .. } => {
                log::warn!("[SyncEngine] Attribute change routed to slot content, ignored");
            }
        }
    }

    fn write_array(&self, txn: &mut TransactionMut, doc: DocKey, array: &ArrayRef, change: ArrayChange) {
        let len = array.len(&*txn);
        match change {
            ArrayChange::Insert { index, values } => {
                let index = clamp_index("array insert", index, len);
                for (offset, value) in values.iter().enumerate() {
                    convert::write_array_item(self, txn, doc, array, index + offset as u32, value);
                }
            }
            ArrayChange::Delete { index, count } => {
                if let Some((index, count)) = clamp_range("array delete", index, count, len) {
                    array.remove_range(txn, index, count);
                }
            }
            ArrayChange::SetIndex { index, value } => {
                if index >= len {
                    log::warn!(
                        "[SyncEngine] array set at {} past length {}, appending",
                        index,
                        len
                    );
                    convert::write_array_item(self, txn, doc, array, len, &value);
                } else {
                    array.remove_range(txn, index, 1);
                    convert::write_array_item(self, txn, doc, array, index, &value);
                }
            }
        }
    }

    // ---------- shared → local ----------

    /// Who committed a transaction observed on `key`.
    fn classify(&self, key: DocKey, txn: &TransactionMut) -> TxnSource {
        let Some(origin) = txn.origin() else {
            return TxnSource::Remote;
        };
        if self.navigation.contains(origin) {
            return TxnSource::History;
        }
        let own = self.docs.borrow().get(&key).is_some_and(|tracked| {
            let origin = origin.as_ref();
            origin == tracked.record_origin.as_bytes() || origin == tracked.silent_origin.as_bytes()
        });
        if own {
            TxnSource::Local
        } else {
            TxnSource::Remote
        }
    }

    /// Take the direction for a transaction nobody entered it for, e.g. one
    /// committed directly on a tracked document.
    fn adopt(&self, next: Direction) -> Option<DirectionGuard<'_>> {
        if self.direction.get() != Direction::Idle {
            return None;
        }
        self.direction.set(next);
        Some(DirectionGuard {
            direction: &self.direction,
        })
    }

    fn on_shared_events(&self, key: DocKey, txn: &TransactionMut, events: &Events) {
        if self.destroyed.get() {
            return;
        }
        let mut result = Ok(());
        match self.classify(key, txn) {
            TxnSource::Local => return,
            TxnSource::History => {
                let _guard = self.adopt(Direction::NavigatingHistory);
                self.scheduler
                    .apply_as_history_navigation(&mut || result = self.replay(key, txn, events));
            }
            TxnSource::Remote => {
                let guard = self.adopt(Direction::ApplyingRemote);
                if guard.is_some() {
                    self.bump(|stats| stats.remote_applies += 1);
                }
                self.scheduler
                    .apply_as_remote_update(&mut || result = self.replay(key, txn, events));
            }
        }
        if let Err(err) = result {
            log::error!("[SyncEngine] Failed to replay shared changes of {}: {}", key, err);
            self.observer_error.borrow_mut().get_or_insert(err);
        }
    }

    fn replay(&self, key: DocKey, txn: &TransactionMut, events: &Events) -> Result<()> {
        for event in events.iter() {
            match event {
                Event::Text(event) => self.replay_text(key, txn, event)?,
                Event::Map(event) => self.replay_map(key, txn, event)?,
                Event::Array(event) => self.replay_array(key, txn, event)?,
                _ => log::debug!("[SyncEngine] Ignoring XML event in {}", key),
            }
        }
        Ok(())
    }

    fn replay_text(&self, key: DocKey, txn: &TransactionMut, event: &TextEvent) -> Result<()> {
        let shared_key = SharedKey::of(key, event.target());
        let content_slot = self.registry.borrow().slot_for(&shared_key);
        if let Some(slot) = content_slot {
            return self.replay_content(key, txn, &slot, event.delta(txn));
        }

        let bound = self.bound.borrow().get(&shared_key).cloned();
        match bound.as_ref() {
            Some(Bound::Wrapper(slot)) => {
                if let Some(slot) = slot.upgrade() {
                    self.replay_header(&slot, event.delta(txn));
                }
            }
            _ => log::debug!("[SyncEngine] Text event on an unbound text in {}", key),
        }
        Ok(())
    }

    fn replay_content(
        &self,
        key: DocKey,
        txn: &TransactionMut,
        slot: &Slot,
        deltas: &[Delta],
    ) -> Result<()> {
        let mut changes = Vec::new();
        let mut index = 0;
        for delta in deltas {
            match delta {
                Delta::Retain(count, attrs) => {
                    if let Some(attrs) = attrs {
                        let formats = attrs_to_patch(self.formats.as_ref(), attrs);
                        if !formats.is_empty() {
                            changes.push(SlotChange::Retain {
                                index,
                                count: *count,
                                formats,
                            });
                        }
                    }
                    index += count;
                }
                Delta::Inserted(value, attrs) => {
                    let content = decode_content(self, txn, key, value)?;
                    let formats = attrs_to_formats(self.formats.as_ref(), attrs.as_deref());
                    let width = content.width();
                    changes.push(SlotChange::Insert {
                        index,
                        content,
                        formats,
                    });
                    index += width;
                }
                Delta::Deleted(count) => changes.push(SlotChange::Delete {
                    index,
                    count: *count,
                }),
            }
        }

        let target = slot.downgrade();
        let changes = self.rebase_queue(
            key,
            changes,
            |op| match op {
                SharedOp::Slot { slot: queued, change }
                    if !matches!(
                        change,
                        SlotChange::AttrSet { .. } | SlotChange::AttrDelete { .. }
                    ) && queued.upgrade().is_some_and(|queued| queued.ptr_eq(slot)) =>
                {
                    Some(change.clone())
                }
                _ => None,
            },
            |change| SharedOp::Slot {
                slot: target.clone(),
                change,
            },
        );
        for change in changes {
            slot.apply(change, ChangeMeta::remote());
        }
        Ok(())
    }

    /// Transform the actions queued on `doc` for one node against
    /// `incoming` shared changes, and return `incoming` rebased onto the
    /// local node. `select` picks the node's queued changes out of the queue.
    fn rebase_queue<T: Rebase>(
        &self,
        doc: DocKey,
        incoming: Vec<T>,
        select: impl Fn(&SharedOp) -> Option<T>,
        rebuild: impl Fn(T) -> SharedOp,
    ) -> Vec<T> {
        let mut queues = self.queues.borrow_mut();
        let Some(queue) = queues.get_mut(&doc).filter(|queue| !queue.actions.is_empty()) else {
            return incoming;
        };
        let mut incoming = incoming;
        let mut rebased = Vec::with_capacity(queue.actions.len());
        let mut touched = 0;
        for action in std::mem::take(&mut queue.actions) {
            let Some(local) = select(&action.op) else {
                rebased.push(action);
                continue;
            };
            touched += 1;
            let (local, rest) = rebase::transform(vec![local], incoming);
            incoming = rest;
            rebased.extend(local.into_iter().map(|change| PendingAction {
                recordable: action.recordable,
                op: rebuild(change),
            }));
        }
        if touched > 0 {
            log::debug!(
                "[SyncEngine] Rebased {} queued action(s) of {} over a shared change",
                touched,
                doc
            );
        }
        if rebased.is_empty() {
            queue.state = QueueState::Idle;
        }
        queue.actions = rebased;
        incoming
    }

    /// Whether a local change to `key` of `map` is still queued.
    fn has_queued_entry(&self, doc: DocKey, map: &ProxyMap, key: &str) -> bool {
        self.queues.borrow().get(&doc).is_some_and(|queue| {
            queue.actions.iter().any(|action| match &action.op {
                SharedOp::Map { map: queued, change } => {
                    let name = match change {
                        MapChange::PropSet { key, .. } | MapChange::PropDelete { key } => key,
                    };
                    name == key && queued.upgrade().is_some_and(|queued| queued.ptr_eq(map))
                }
                _ => false,
            })
        })
    }

    fn replay_header(&self, slot: &Slot, deltas: &[Delta]) {
        for delta in deltas {
            match delta {
                Delta::Retain(_, Some(attrs)) => {
                    for change in attrs_to_slot_changes(self.formats.as_ref(), attrs) {
                        slot.apply(change, ChangeMeta::remote());
                    }
                }
                Delta::Retain(_, None) => {}
                _ => log::warn!(
                    "[SyncEngine] Structural change to the wrapper of slot {:?} ignored",
                    slot.id()
                ),
            }
        }
    }

    fn replay_map(
        &self,
        key: DocKey,
        txn: &TransactionMut,
        event: &yrs::types::map::MapEvent,
    ) -> Result<()> {
        let shared_key = SharedKey::of(key, event.target());
        let bound = self.bound.borrow().get(&shared_key).cloned();
        let map = match bound {
            Some(Bound::Map(map)) => map.upgrade(),
            _ => {
                if key == DocKey::ROOT && shared_key == SharedKey::of(key, &self.root_map) {
                    return self.replay_root(txn, event);
                }
                log::debug!("[SyncEngine] Map event on an unbound map in {}", key);
                None
            }
        };
        let Some(map) = map else {
            return Ok(());
        };

        let mut changes: Vec<_> = event.keys(txn).iter().collect();
        changes.sort_by(|a, b| a.0.cmp(b.0));
        for (name, change) in changes {
            if self.has_queued_entry(key, &map, name) {
                // The queued write lands after this one and wins.
                log::debug!("[SyncEngine] Keeping queued local value of '{}'", name);
                continue;
            }
            match change {
                EntryChange::Inserted(value) | EntryChange::Updated(_, value) => {
                    let value = decode_value(self, txn, key, value)?;
                    map.apply(
                        MapChange::PropSet {
                            key: name.to_string(),
                            value,
                        },
                        ChangeMeta::remote(),
                    );
                }
                EntryChange::Removed(_) => {
                    map.apply(
                        MapChange::PropDelete {
                            key: name.to_string(),
                        },
                        ChangeMeta::remote(),
                    );
                }
            }
        }
        Ok(())
    }

    /// The root entry itself changed, e.g. a concurrent bootstrap won.
    fn replay_root(&self, txn: &TransactionMut, event: &yrs::types::map::MapEvent) -> Result<()> {
        if !event.keys(txn).contains_key(STATE_KEY) {
            return Ok(());
        }
        let root = self.root.borrow().clone();
        match root {
            Some(root) => {
                log::debug!("[SyncEngine] Shared root state replaced, rebuilding local root");
                self.pull_root_state(txn, &root)
            }
            None => Ok(()),
        }
    }

    fn replay_array(
        &self,
        key: DocKey,
        txn: &TransactionMut,
        event: &yrs::types::array::ArrayEvent,
    ) -> Result<()> {
        let shared_key = SharedKey::of(key, event.target());
        let bound = self.bound.borrow().get(&shared_key).cloned();
        let Some(array) = (match bound {
            Some(Bound::Array(array)) => array.upgrade(),
            _ => None,
        }) else {
            log::debug!("[SyncEngine] Array event on an unbound array in {}", key);
            return Ok(());
        };

        let mut changes = Vec::new();
        let mut index = 0;
        for change in event.delta(txn) {
            match change {
                Change::Retain(count) => index += count,
                Change::Added(values) => {
                    let values = values
                        .iter()
                        .map(|value| decode_value(self, txn, key, value))
                        .collect::<Result<Vec<_>>>()?;
                    let count = values.len() as u32;
                    changes.push(ArrayChange::Insert { index, values });
                    index += count;
                }
                Change::Removed(count) => changes.push(ArrayChange::Delete {
                    index,
                    count: *count,
                }),
            }
        }

        let target = array.downgrade();
        let changes = self.rebase_queue(
            key,
            changes,
            |op| match op {
                SharedOp::Array {
                    array: queued,
                    change,
                } if queued.upgrade().is_some_and(|queued| queued.ptr_eq(&array)) => {
                    Some(change.clone())
                }
                _ => None,
            },
            |change| SharedOp::Array {
                array: target.clone(),
                change,
            },
        );
        for change in changes {
            array.apply(change, ChangeMeta::remote());
        }
        Ok(())
    }

    fn apply_remote_update(&self, key: DocKey, update: &[u8]) -> Result<()> {
        let doc = self
            .doc_handle(key)
            .ok_or_else(|| CollabError::invariant(format!("{key} is not tracked")))?;
        let update = Update::decode_v1(update).map_err(|e| CollabError::Crdt(e.to_string()))?;

        // Queued indexes were taken against the local tree before the update.
        let flushed = if self.has_pending() {
            self.flush()
        } else {
            Ok(())
        };

        let guard = self.enter(Direction::ApplyingRemote)?;
        log::debug!("[SyncEngine] Applying remote update to {}", key);
        let applied = {
            let mut txn = doc.transact_mut_with(REMOTE_ORIGIN);
            txn.apply_update(update)
                .map_err(|e| CollabError::Crdt(e.to_string()))
        };
        drop(guard);

        self.bump(|stats| stats.remote_applies += 1);
        flushed?;
        applied?;
        self.take_observer_error()
    }

    fn navigate_history<R>(&self, step: impl FnOnce() -> R) -> Result<R> {
        let guard = self.enter(Direction::NavigatingHistory)?;
        let value = step();
        drop(guard);
        self.bump(|stats| stats.history_navigations += 1);
        self.take_observer_error()?;
        Ok(value)
    }

    // ---------- selection ----------

    fn capture_selection(&self) -> Option<CursorPosition> {
        let selection = self.selection.selection()?;
        Some(CursorPosition {
            anchor: self.capture_endpoint(&selection.anchor_slot, selection.anchor_offset)?,
            focus: self.capture_endpoint(&selection.focus_slot, selection.focus_offset)?,
        })
    }

    fn capture_endpoint(&self, slot: &Slot, offset: u32) -> Option<CursorEndpoint> {
        let shared = self.registry.borrow().text_for(slot)?;
        let doc = self.doc_handle(shared.doc())?;
        let mut txn = doc.try_transact_mut().ok()?;
        let offset = offset.min(shared.text.len(&txn));
        let index = shared.text.sticky_index(&mut txn, offset, Assoc::After)?;
        Some(CursorEndpoint {
            text: shared.key,
            index,
        })
    }

    fn restore_selection(&self, position: Option<&CursorPosition>) -> bool {
        let Some(position) = position else {
            self.selection.set_selection(None);
            return true;
        };
        let anchor = self.resolve_endpoint(&position.anchor);
        let focus = self.resolve_endpoint(&position.focus);
        match (anchor, focus) {
            (Some((anchor_slot, anchor_offset)), Some((focus_slot, focus_offset))) => {
                self.selection.set_selection(Some(SelectionSnapshot {
                    anchor_slot,
                    anchor_offset,
                    focus_slot,
                    focus_offset,
                }));
                true
            }
            _ => {
                log::debug!("[SyncEngine] Selection no longer resolves, left unchanged");
                false
            }
        }
    }

    fn resolve_endpoint(&self, endpoint: &CursorEndpoint) -> Option<(Slot, u32)> {
        let slot = self.registry.borrow().slot_for(&endpoint.text)?;
        let doc = self.doc_handle(endpoint.text.doc)?;
        let txn = doc.try_transact().ok()?;
        let offset = endpoint.index.get_offset(&txn)?;
        Some((slot, offset.index))
    }

    // ---------- bindings ----------

    fn record_binding(&self, id: NodeId, key: SharedKey, shared: SharedNode, bound: Bound) {
        let previous = self
            .shared_of
            .borrow_mut()
            .insert(id, Binding { key: key.clone(), shared });
        let mut by_key = self.bound.borrow_mut();
        if let Some(previous) = previous
            && previous.key != key
        {
            by_key.remove(&previous.key);
        }
        by_key.insert(key, bound);
    }

    fn watch_destroy(&self, id: NodeId, lifecycle: &Lifecycle) -> Subscription {
        let weak = self.weak_self.clone();
        lifecycle.on_destroy(move |_| {
            if let Some(engine) = weak.upgrade() {
                engine.unbind(id);
            }
        })
    }

    fn set_node_subs(&self, id: NodeId, subs: Vec<Subscription>) {
        let previous = self.node_subs.borrow_mut().insert(id, subs);
        drop(previous);
    }

    fn unbind(&self, id: NodeId) {
        let binding = self.shared_of.borrow_mut().remove(&id);
        if let Some(binding) = binding {
            self.bound.borrow_mut().remove(&binding.key);
        }
        self.registry.borrow_mut().dissociate_id(id);
        self.requested.borrow_mut().remove(&id);
        let subs = self.node_subs.borrow_mut().remove(&id);
        drop(subs);
        let subs = self.load_subs.borrow_mut().remove(&id);
        drop(subs);
    }

    // ---------- sub-models ----------

    fn schedule_load(&self, target: SubModelTarget, request: SubModelRequest) {
        let id = target.id();
        if self.destroyed.get()
            || target.lifecycle().is_destroyed()
            || target.lifecycle().is_loaded()
        {
            return;
        }
        let fresh = self.requested.borrow_mut().insert(id);
        if !fresh {
            return;
        }
        let subs = self.load_subs.borrow_mut().remove(&id);
        drop(subs);

        log::debug!(
            "[SyncEngine] Requesting sub-model {:?} ({:?})",
            target.guid(),
            request
        );
        let load = match request {
            SubModelRequest::Create => self.loader.create_sub_model_for(&target),
            SubModelRequest::Load => self.loader.load_sub_model_for(&target),
        };
        let weak = self.weak_self.clone();
        let weak_target = target.downgrade();
        self.pending_loads.borrow_mut().push(Box::pin(async move {
            let result = load.await;
            let (Some(engine), Some(target)) = (weak.upgrade(), weak_target.upgrade()) else {
                return Ok(());
            };
            match result {
                Ok(doc) => engine.attach_sub_model(target, request, doc),
                Err(err) => {
                    engine.requested.borrow_mut().remove(&id);
                    Err(err)
                }
            }
        }));
    }

    fn attach_sub_model(
        &self,
        target: SubModelTarget,
        request: SubModelRequest,
        doc: Doc,
    ) -> Result<()> {
        if self.destroyed.get() {
            return Ok(());
        }
        if target.lifecycle().is_destroyed() {
            log::debug!(
                "[SyncEngine] Node {:?} was detached before its sub-model arrived",
                target.id()
            );
            return Ok(());
        }
        if !target.lifecycle().mark_loaded() {
            return Ok(());
        }
        let guid = target.guid().unwrap_or_default().to_string();

        let scope = match &target {
            SubModelTarget::Slot(_) => {
                DocScope::Text(doc.get_or_insert_text(self.config.content_text_name.as_str()))
            }
            SubModelTarget::Component(_) => {
                DocScope::Map(doc.get_or_insert_map(self.config.state_map_name.as_str()))
            }
        };
        let key = self.register_doc(doc.clone(), Some(guid.clone()), scope.clone());
        let (_, _, silent) = self
            .origins(key)
            .ok_or_else(|| CollabError::invariant(format!("{key} was not registered")))?;

        match (&target, &scope) {
            (SubModelTarget::Slot(slot), DocScope::Text(content)) => {
                match request {
                    SubModelRequest::Create => {
                        let _guard = self.enter(Direction::Flushing)?;
                        let mut txn = doc.transact_mut_with(silent.as_str());
                        convert::write_items(self, &mut txn, key, content, 0, &slot.items());
                    }
                    SubModelRequest::Load => {
                        let _guard = self.enter(Direction::ApplyingRemote)?;
                        let txn = doc.transact();
                        let items = decode_items(self, &txn, key, content)?;
                        let mut items = Some(items);
                        self.scheduler.apply_as_remote_update(&mut || {
                            let len = slot.len();
                            if len > 0 {
                                slot.apply(
                                    SlotChange::Delete { index: 0, count: len },
                                    ChangeMeta::remote(),
                                );
                            }
                            convert::append_items(slot, items.take().unwrap_or_default());
                        });
                    }
                }
                self.registry
                    .borrow_mut()
                    .associate(slot, SharedText::new(key, content.clone()));
            }
            (SubModelTarget::Component(component), DocScope::Map(state)) => match request {
                SubModelRequest::Create => {
                    let _guard = self.enter(Direction::Flushing)?;
                    let mut txn = doc.transact_mut_with(silent.as_str());
                    convert::fill_map(self, &mut txn, key, state, component.state());
                }
                SubModelRequest::Load => {
                    let _guard = self.enter(Direction::ApplyingRemote)?;
                    let txn = doc.transact();
                    let entries = decode_entries(self, &txn, key, state)?;
                    let local = component.state();
                    let mut entries = Some(entries);
                    self.scheduler.apply_as_remote_update(&mut || {
                        local.clear_with(ChangeMeta::remote());
                        for (name, value) in entries.take().into_iter().flatten() {
                            local.apply(
                                MapChange::PropSet { key: name, value },
                                ChangeMeta::remote(),
                            );
                        }
                    });
                    self.bind_map(key, state, local);
                }
            },
            _ => return Err(CollabError::invariant("sub-model scope does not match its node")),
        }
        self.observe(key);

        log::debug!("[SyncEngine] Sub-model {} attached as {}", guid, key);
        self.sub_model_added.emit(&SubModelAdded {
            doc: key,
            guid,
            node: target.id(),
            scope,
        });
        Ok(())
    }

    fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        log::debug!("[SyncEngine] Destroying engine");
        let node_subs = std::mem::take(&mut *self.node_subs.borrow_mut());
        drop(node_subs);
        let load_subs = std::mem::take(&mut *self.load_subs.borrow_mut());
        drop(load_subs);
        let loads = std::mem::take(&mut *self.pending_loads.borrow_mut());
        drop(loads);
        let observers: Vec<_> = self
            .docs
            .borrow_mut()
            .values_mut()
            .filter_map(|tracked| tracked.observer.take())
            .collect();
        drop(observers);

        self.queues.borrow_mut().clear();
        self.registry.borrow_mut().clear();
        self.bound.borrow_mut().clear();
        self.shared_of.borrow_mut().clear();
        self.requested.borrow_mut().clear();
        self.before_local_change.clear();
        self.flushed.clear();
        self.sub_model_added.clear();
        *self.root.borrow_mut() = None;
    }
}

impl ConvertContext for EngineInner {
    fn bind_map(&self, doc: DocKey, shared: &MapRef, local: &ProxyMap) {
        if local.lifecycle().is_destroyed() {
            return;
        }
        let id = local.id();
        self.record_binding(
            id,
            SharedKey::of(doc, shared),
            SharedNode::Map(shared.clone()),
            Bound::Map(local.downgrade()),
        );
        let weak = self.weak_self.clone();
        let node = local.downgrade();
        let changes = local.on_change(move |event| {
            if let (Some(engine), Some(map)) = (weak.upgrade(), node.upgrade()) {
                engine.enqueue_map(&map, event);
            }
        });
        let destroyed = self.watch_destroy(id, local.lifecycle());
        self.set_node_subs(id, vec![changes, destroyed]);
    }

    fn bind_array(&self, doc: DocKey, shared: &ArrayRef, local: &ProxyArray) {
        if local.lifecycle().is_destroyed() {
            return;
        }
        let id = local.id();
        self.record_binding(
            id,
            SharedKey::of(doc, shared),
            SharedNode::Array(shared.clone()),
            Bound::Array(local.downgrade()),
        );
        let weak = self.weak_self.clone();
        let node = local.downgrade();
        let changes = local.on_change(move |event| {
            if let (Some(engine), Some(array)) = (weak.upgrade(), node.upgrade()) {
                engine.enqueue_array(&array, event);
            }
        });
        let destroyed = self.watch_destroy(id, local.lifecycle());
        self.set_node_subs(id, vec![changes, destroyed]);
    }

    fn bind_slot(&self, doc: DocKey, wrapper: &TextRef, content: Option<&TextRef>, slot: &Slot) {
        if slot.lifecycle().is_destroyed() {
            return;
        }
        let id = slot.id();
        self.record_binding(
            id,
            SharedKey::of(doc, wrapper),
            SharedNode::Wrapper(wrapper.clone()),
            Bound::Wrapper(slot.downgrade()),
        );
        if let Some(content) = content {
            self.registry
                .borrow_mut()
                .associate(slot, SharedText::new(doc, content.clone()));
        }
        let weak = self.weak_self.clone();
        let node = slot.downgrade();
        let changes = slot.on_change(move |event| {
            if let (Some(engine), Some(slot)) = (weak.upgrade(), node.upgrade()) {
                engine.enqueue_slot(&slot, event);
            }
        });
        let destroyed = self.watch_destroy(id, slot.lifecycle());
        self.set_node_subs(id, vec![changes, destroyed]);
    }

    fn request_sub_model(&self, target: SubModelTarget, request: SubModelRequest) {
        if self.destroyed.get() {
            return;
        }
        match request {
            SubModelRequest::Create => self.schedule_load(target, request),
            SubModelRequest::Load if target.lifecycle().is_needed() => {
                self.schedule_load(target, request)
            }
            SubModelRequest::Load => {
                let id = target.id();
                let weak = self.weak_self.clone();
                let waiting = target.downgrade();
                let needed = target.lifecycle().on_needed(move |_| {
                    if let (Some(engine), Some(target)) = (weak.upgrade(), waiting.upgrade()) {
                        engine.schedule_load(target, SubModelRequest::Load);
                    }
                });
                let weak = self.weak_self.clone();
                let destroyed = target.lifecycle().on_destroy(move |_| {
                    if let Some(engine) = weak.upgrade() {
                        let subs = engine.load_subs.borrow_mut().remove(&id);
                        drop(subs);
                    }
                });
                let previous = self
                    .load_subs
                    .borrow_mut()
                    .insert(id, vec![needed, destroyed]);
                drop(previous);
            }
        }
    }

    fn formats(&self) -> &dyn FormatRegistry {
        self.formats.as_ref()
    }

    fn components(&self) -> &dyn ComponentFactory {
        self.components.as_ref()
    }
}

// ==================== Helpers ====================

/// Split actions into maximal runs of equal `recordable` flag, in order.
fn partition_runs(actions: Vec<PendingAction>) -> Vec<Vec<PendingAction>> {
    let mut runs: Vec<Vec<PendingAction>> = Vec::new();
    for action in actions {
        match runs.last_mut() {
            Some(run) if run[0].recordable == action.recordable => run.push(action),
            _ => runs.push(vec![action]),
        }
    }
    runs
}

fn clamp_index(what: &str, index: u32, len: u32) -> u32 {
    if index > len {
        log::warn!(
            "[SyncEngine] {} at {} past length {}, clamped",
            what,
            index,
            len
        );
        len
    } else {
        index
    }
}

fn clamp_range(what: &str, index: u32, count: u32, len: u32) -> Option<(u32, u32)> {
    let end = index.saturating_add(count);
    if end <= len {
        return Some((index, count)).filter(|(_, count)| *count > 0);
    }
    log::warn!(
        "[SyncEngine] {} of [{}, {}) past length {}, clamped",
        what,
        index,
        end,
        len
    );
    let index = index.min(len);
    let count = len - index;
    (count > 0).then_some((index, count))
}

fn write_header(txn: &mut TransactionMut, wrapper: &TextRef, change: SlotChange) {
    let (name, value) = match change {
        SlotChange::AttrSet { name, value } => (name, json_to_any(&value)),
        SlotChange::AttrDelete { name } => (name, Any::Null),
        _ => return,
    };
    if convert::is_reserved(&name) {
        log::warn!("[SyncEngine] Slot attribute '{}' shadows a header field, skipped", name);
        return;
    }
    let mut attrs = Attrs::new();
    attrs.insert(Arc::from(name.as_str()), value);
    wrapper.format(txn, 0, 1, attrs);
}
