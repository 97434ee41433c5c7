//! Integration tests for two-peer sync and collaborative history

use std::cell::Cell;
use std::rc::Rc;

use quillsync_core::collab::{
    DocKey, DocUndo, EngineOptions, GroupState, History, HistoryManager, LocalSelection,
    ManualClock, MemorySubModelLoader, MultiDocHistoryManager, Scheduler, SelectionBridge,
    SelectionSnapshot, SyncEngine, new_shared_doc,
};
use quillsync_core::config::HistoryConfig;
use quillsync_core::error::CollabError;
use quillsync_core::model::{Component, ContentType, FormatMap, FormatRange, ProxyMap, Slot};
use serde_json::json;
use yrs::updates::decoder::Decode;
use yrs::{GetString, Map, Out, Text, Transact, Update};

/// A peer: engine, local root and the collaborators tests poke at.
struct Peer {
    engine: SyncEngine,
    root: Component,
    selection: Rc<LocalSelection>,
    loader: Rc<MemorySubModelLoader>,
}

fn create_options(selection: &Rc<LocalSelection>, loader: &Rc<MemorySubModelLoader>) -> EngineOptions {
    EngineOptions::default()
        .with_selection(selection.clone())
        .with_loader(loader.clone())
}

/// A peer starting from an empty shared document.
fn create_peer() -> Peer {
    let selection = Rc::new(LocalSelection::new());
    let loader = Rc::new(MemorySubModelLoader::new());
    let engine = SyncEngine::with_options(new_shared_doc(), create_options(&selection, &loader));
    let root = Component::new("page", ProxyMap::new());
    engine.bootstrap_root(&root).unwrap();
    Peer {
        engine,
        root,
        selection,
        loader,
    }
}

/// A peer joining with the current state of `other`.
fn create_peer_from(other: &Peer) -> Peer {
    let doc = new_shared_doc();
    {
        let update = Update::decode_v1(&other.engine.encode_state_as_update()).unwrap();
        doc.transact_mut().apply_update(update).unwrap();
    }
    let selection = Rc::new(LocalSelection::new());
    let loader = Rc::new(MemorySubModelLoader::new());
    let engine = SyncEngine::with_options(doc, create_options(&selection, &loader));
    let root = Component::new("page", ProxyMap::new());
    engine.bootstrap_root(&root).unwrap();
    Peer {
        engine,
        root,
        selection,
        loader,
    }
}

/// Send `from`'s missing root changes to `to`.
fn sync(from: &Peer, to: &Peer) {
    let diff = from
        .engine
        .encode_diff(&to.engine.encode_state_vector())
        .unwrap();
    to.engine.apply_remote_update(&diff).unwrap();
}

fn slot_at(root: &Component, key: &str) -> Slot {
    root.state()
        .get(key)
        .and_then(|value| value.as_slot().cloned())
        .unwrap()
}

fn text_slot() -> Slot {
    Slot::new(vec![ContentType::Text, ContentType::InlineComponent])
}

/// Shared content of `slot` as a string.
fn shared_string(peer: &Peer, slot: &Slot) -> String {
    let shared = peer.engine.shared_text_for(slot).unwrap();
    let doc = peer.engine.doc(shared.doc()).unwrap();
    let txn = doc.transact();
    shared.text.get_string(&txn)
}

/// Counts replays per kind.
#[derive(Default)]
struct CountingScheduler {
    remote: Cell<usize>,
    history: Cell<usize>,
}

impl Scheduler for CountingScheduler {
    fn apply_as_remote_update(&self, apply: &mut dyn FnMut()) {
        self.remote.set(self.remote.get() + 1);
        apply();
    }

    fn apply_as_history_navigation(&self, apply: &mut dyn FnMut()) {
        self.history.set(self.history.get() + 1);
        apply();
    }
}

/// A peer holding "abc" in `body` and a second peer joined from it.
fn create_pair_with_body() -> (Peer, Peer, Slot, Slot) {
    let a = create_peer();
    let body = text_slot();
    body.insert_text(0, "abc", FormatMap::new());
    a.root.state().set("body", body.clone());
    a.engine.flush().unwrap();
    let b = create_peer_from(&a);
    let remote = slot_at(&b.root, "body");
    (a, b, body, remote)
}

fn bold() -> FormatMap {
    FormatMap::from([("bold".to_string(), json!(true))])
}

#[test]
fn test_text_round_trips_between_peers() {
    let a = create_peer();
    let body = text_slot();
    a.root.state().set("body", body.clone());
    a.engine.flush().unwrap();
    body.insert_text(0, "hi", FormatMap::new());
    body.format(0, 1, "bold", Some(json!(true)));
    a.engine.flush().unwrap();

    let b = create_peer_from(&a);
    let remote = slot_at(&b.root, "body");
    assert_eq!(remote.to_plain_text(), "hi");
    assert_eq!(
        remote.format_ranges("bold"),
        vec![FormatRange {
            start: 0,
            end: 1,
            value: json!(true)
        }]
    );

    remote.insert_text(2, "!", bold());
    b.engine.flush().unwrap();
    sync(&b, &a);

    assert_eq!(body.to_plain_text(), "hi!");
    assert_eq!(body.formats_at(2), bold());
    assert!(body.formats_at(1).is_empty());
}

#[test]
fn test_map_and_array_changes_reach_peer() {
    let a = create_peer();
    let b = create_peer_from(&a);

    a.root.state().set("title", "Draft");
    a.root.state().set("tags", quillsync_core::model::ProxyArray::from_values([json!("x")]));
    a.engine.flush().unwrap();
    sync(&a, &b);

    assert_eq!(b.root.state().get("title").map(|v| v.to_json()), Some(json!("Draft")));
    let tags = b.root.state().get("tags").unwrap();
    assert_eq!(tags.to_json(), json!(["x"]));

    tags.as_array().unwrap().push(json!("y"));
    a.root.state().remove("title");
    b.engine.flush().unwrap();
    a.engine.flush().unwrap();
    sync(&b, &a);
    sync(&a, &b);

    assert_eq!(a.root.state().to_json(), b.root.state().to_json());
    assert_eq!(a.root.state().to_json(), json!({"tags": ["x", "y"]}));
}

#[test]
fn test_remote_apply_does_not_echo() {
    let a = create_peer();
    let b = create_peer_from(&a);
    let body = text_slot();
    a.root.state().set("body", body.clone());
    a.engine.flush().unwrap();
    body.insert_text(0, "echo", FormatMap::new());
    a.engine.flush().unwrap();

    sync(&a, &b);
    let before = b.engine.stats();
    assert_eq!(b.engine.pending_actions(DocKey::ROOT), 0);
    b.engine.flush().unwrap();
    sync(&a, &b);

    let after = b.engine.stats();
    assert_eq!(after.transactions, before.transactions);
    assert_eq!(after.rejected_reentries, 0);
    assert_eq!(slot_at(&b.root, "body").to_plain_text(), "echo");
}

#[test]
fn test_concurrent_edits_converge() {
    let a = create_peer();
    let body = text_slot();
    body.insert_text(0, "ac", FormatMap::new());
    a.root.state().set("body", body.clone());
    a.engine.flush().unwrap();
    let b = create_peer_from(&a);
    let remote = slot_at(&b.root, "body");

    body.insert_text(1, "b", FormatMap::new());
    remote.insert_text(2, "d", FormatMap::new());
    a.engine.flush().unwrap();
    b.engine.flush().unwrap();
    sync(&a, &b);
    sync(&b, &a);

    assert_eq!(body.to_plain_text(), "abcd");
    assert_eq!(remote.to_plain_text(), "abcd");
}

#[test]
fn test_history_bound_and_clear() {
    let peer = create_peer();
    let config = HistoryConfig {
        stack_size: 3,
        ..HistoryConfig::default()
    };
    let history = HistoryManager::new(&peer.engine, &config).unwrap();
    let body = text_slot();
    peer.root.state().set("body", body.clone());
    peer.engine.flush().unwrap();
    history.clear();

    for chunk in ["1", "2", "3", "4"] {
        body.insert_text(body.len(), chunk, FormatMap::new());
        peer.engine.flush().unwrap();
    }
    assert_eq!(history.len(), 3);

    while history.back().unwrap() {}
    assert_eq!(body.to_plain_text(), "1");

    history.clear();
    assert_eq!(history.len(), 1);
    assert!(!history.can_back());
}

#[test]
fn test_undo_reverts_only_local_edits() {
    let a = create_peer();
    let body = text_slot();
    a.root.state().set("body", body.clone());
    a.engine.flush().unwrap();
    let b = create_peer_from(&a);
    let history = HistoryManager::new(&a.engine, &HistoryConfig::default()).unwrap();

    body.insert_text(0, "mine", FormatMap::new());
    a.engine.flush().unwrap();
    sync(&a, &b);
    slot_at(&b.root, "body").insert_text(0, "theirs ", FormatMap::new());
    b.engine.flush().unwrap();
    sync(&b, &a);
    assert_eq!(body.to_plain_text(), "theirs mine");

    assert!(history.back().unwrap());
    assert_eq!(body.to_plain_text(), "theirs ");
}

#[test]
fn test_history_restores_cursors() {
    let peer = create_peer();
    let history = HistoryManager::new(&peer.engine, &HistoryConfig::default()).unwrap();
    let body = text_slot();
    body.insert_text(0, "abc", FormatMap::new());
    peer.root.state().set("body", body.clone());
    peer.engine.flush().unwrap();

    peer.selection
        .set_selection(Some(SelectionSnapshot::caret(&body, 1)));
    body.insert_text(1, "XY", FormatMap::new());
    peer.selection
        .set_selection(Some(SelectionSnapshot::caret(&body, 3)));
    peer.engine.flush().unwrap();

    history.back().unwrap();
    assert_eq!(body.to_plain_text(), "abc");
    assert_eq!(
        peer.selection.selection(),
        Some(SelectionSnapshot::caret(&body, 1))
    );

    history.forward().unwrap();
    assert_eq!(body.to_plain_text(), "aXYbc");
    assert_eq!(
        peer.selection.selection(),
        Some(SelectionSnapshot::caret(&body, 3))
    );
}

#[test]
fn test_async_slot_content_lives_in_sub_document() {
    let peer = create_peer();
    let notes = Slot::new_async(vec![ContentType::Text]);
    notes.insert_text(0, "deep", FormatMap::new());
    peer.root.state().set("notes", notes.clone());
    peer.engine.flush().unwrap();
    assert!(peer.engine.has_pending_loads());

    peer.engine.settle_blocking().unwrap();

    assert!(notes.lifecycle().is_loaded());
    let guid = notes.sub_model_id().unwrap();
    let key = peer.engine.doc_key_for_guid(guid).unwrap();
    assert_eq!(peer.engine.shared_text_for(&notes).unwrap().doc(), key);
    assert!(peer.loader.get(guid).is_some());
}

#[test]
fn test_async_slot_loads_when_needed() {
    let a = create_peer();
    let notes = Slot::new_async(vec![ContentType::Text]);
    notes.insert_text(0, "deep", FormatMap::new());
    a.root.state().set("notes", notes.clone());
    a.engine.flush().unwrap();
    a.engine.settle_blocking().unwrap();
    let guid = notes.sub_model_id().unwrap().to_string();

    let b = create_peer_from(&a);
    b.loader.seed(&guid, a.loader.encode(&guid).unwrap());
    let remote = slot_at(&b.root, "notes");
    assert!(!b.engine.has_pending_loads());
    assert!(remote.is_empty());

    remote.lifecycle().request_load();
    b.engine.settle_blocking().unwrap();

    assert!(remote.lifecycle().is_loaded());
    assert_eq!(remote.to_plain_text(), "deep");
}

#[test]
fn test_detached_node_is_not_resurrected_by_late_load() {
    let a = create_peer();
    let notes = Slot::new_async(vec![ContentType::Text]);
    a.root.state().set("notes", notes.clone());
    a.engine.flush().unwrap();
    a.engine.settle_blocking().unwrap();
    let guid = notes.sub_model_id().unwrap().to_string();

    let b = create_peer_from(&a);
    b.loader.seed(&guid, a.loader.encode(&guid).unwrap());
    let remote = slot_at(&b.root, "notes");
    remote.lifecycle().request_load();
    b.root.state().remove("notes");
    b.engine.settle_blocking().unwrap();

    assert!(remote.lifecycle().is_destroyed());
    assert!(!remote.lifecycle().is_loaded());
    assert!(b.engine.doc_key_for_guid(&guid).is_none());
}

#[test]
fn test_missing_loader_fails_loudly() {
    let engine = SyncEngine::new(new_shared_doc());
    let root = Component::new("page", ProxyMap::new());
    engine.bootstrap_root(&root).unwrap();
    root.state()
        .set("notes", Slot::new_async(vec![ContentType::Text]));
    engine.flush().unwrap();

    let err = engine.settle_blocking().unwrap_err();
    assert!(matches!(
        err,
        CollabError::UnsupportedOperation {
            operation: "create_sub_model_for",
            ..
        }
    ));
}

#[test]
fn test_grouped_history_spans_documents() {
    let peer = create_peer();
    let notes = Slot::new_async(vec![ContentType::Text]);
    peer.root.state().set("notes", notes.clone());
    peer.engine.flush().unwrap();
    peer.engine.settle_blocking().unwrap();

    let clock = Rc::new(ManualClock::new());
    let history =
        MultiDocHistoryManager::with_clock(&peer.engine, &HistoryConfig::default(), clock.clone())
            .unwrap();
    assert_eq!(history.tracked_docs().len(), 2);

    peer.root.state().set("title", "Plan");
    peer.engine.flush().unwrap();
    clock.advance_ms(100);
    notes.insert_text(0, "todo", FormatMap::new());
    peer.engine.flush().unwrap();
    assert!(history.group_state().is_collecting());

    clock.advance_ms(500);
    assert!(history.poll());
    assert_eq!(history.len(), 1);
    assert_eq!(history.group_state(), GroupState::Idle);

    assert!(history.back().unwrap());
    assert!(!peer.root.state().contains_key("title"));
    assert!(notes.is_empty());

    assert!(history.forward().unwrap());
    assert_eq!(notes.to_plain_text(), "todo");
    assert!(peer.root.state().contains_key("title"));
}

#[test]
fn test_editing_after_back_discards_forward_steps() {
    let peer = create_peer();
    let clock = Rc::new(ManualClock::new());
    let history =
        MultiDocHistoryManager::with_clock(&peer.engine, &HistoryConfig::default(), clock.clone())
            .unwrap();

    for key in ["a", "b", "c"] {
        peer.root.state().set(key, true);
        peer.engine.flush().unwrap();
        clock.advance_ms(600);
        history.poll();
    }
    assert_eq!(history.len(), 3);

    history.back().unwrap();
    history.back().unwrap();
    assert!(history.can_forward());

    peer.root.state().set("d", true);
    peer.engine.flush().unwrap();
    clock.advance_ms(600);
    history.poll();

    assert_eq!(history.len(), 2);
    assert!(!history.can_forward());
    assert!(!history.forward().unwrap());
    assert_eq!(
        peer.root.state().keys(),
        vec!["a".to_string(), "d".to_string()]
    );
}

#[test]
fn test_queued_edit_survives_remote_update() {
    let (a, b, body, remote) = create_pair_with_body();
    body.insert_text(3, "X", FormatMap::new());
    assert!(a.engine.has_pending_changes());

    remote.insert_text(0, "123", FormatMap::new());
    b.engine.flush().unwrap();
    sync(&b, &a);
    a.engine.flush().unwrap();
    sync(&a, &b);

    assert_eq!(body.to_plain_text(), "123abcX");
    assert_eq!(shared_string(&a, &body), "123abcX");
    assert_eq!(remote.to_plain_text(), "123abcX");
    assert_eq!(shared_string(&b, &remote), "123abcX");
}

#[test]
fn test_queued_edit_is_rebased_over_foreign_transaction() {
    let (a, _b, body, _remote) = create_pair_with_body();
    body.insert_text(3, "X", FormatMap::new());
    body.delete(0, 1);
    assert_eq!(body.to_plain_text(), "bcX");

    let shared = a.engine.shared_text_for(&body).unwrap();
    {
        let doc = a.engine.root_doc();
        let mut txn = doc.transact_mut();
        shared.text.insert(&mut txn, 1, "12");
    }
    assert_eq!(body.to_plain_text(), "12bcX");
    assert!(a.engine.has_pending_changes());

    a.engine.flush().unwrap();
    assert_eq!(shared_string(&a, &body), "12bcX");
}

#[test]
fn test_queued_map_write_wins_over_foreign_transaction() {
    let a = create_peer();
    a.root.state().set("title", "Mine");
    {
        let doc = a.engine.root_doc();
        let mut txn = doc.transact_mut();
        let Some(Out::YMap(state)) = a.engine.root_map().get(&txn, "state") else {
            panic!("root state is not a map");
        };
        state.insert(&mut txn, "title", "Theirs");
        state.insert(&mut txn, "other", "kept");
    }

    assert_eq!(a.root.state().get("title").map(|v| v.to_json()), Some(json!("Mine")));
    assert_eq!(a.root.state().get("other").map(|v| v.to_json()), Some(json!("kept")));
    a.engine.flush().unwrap();

    let b = create_peer_from(&a);
    assert_eq!(b.root.state().get("title").map(|v| v.to_json()), Some(json!("Mine")));
    assert_eq!(a.root.state().to_json(), b.root.state().to_json());
}

#[test]
fn test_history_step_with_queued_edits_keeps_peers_equal() {
    let (a, b, body, remote) = create_pair_with_body();
    let history = HistoryManager::new(&a.engine, &HistoryConfig::default()).unwrap();
    body.insert_text(0, ">", FormatMap::new());
    a.engine.flush().unwrap();
    remote.insert_text(3, "!", FormatMap::new());
    b.engine.flush().unwrap();
    sync(&b, &a);

    body.insert_text(body.len(), "X", FormatMap::new());
    assert!(history.back().unwrap());
    assert_eq!(body.to_plain_text(), ">abc!");
    assert_eq!(shared_string(&a, &body), ">abc!");

    sync(&a, &b);
    assert_eq!(remote.to_plain_text(), ">abc!");
    assert_eq!(shared_string(&b, &remote), ">abc!");
}

#[test]
fn test_grouped_history_step_with_queued_edits_keeps_peers_equal() {
    let (a, b, body, remote) = create_pair_with_body();
    let clock = Rc::new(ManualClock::new());
    let history =
        MultiDocHistoryManager::with_clock(&a.engine, &HistoryConfig::default(), clock.clone())
            .unwrap();
    body.insert_text(3, "d", FormatMap::new());
    a.engine.flush().unwrap();
    clock.advance_ms(600);
    history.poll();

    remote.insert_text(2, "1", FormatMap::new());
    b.engine.flush().unwrap();
    body.insert_text(0, "0", FormatMap::new());
    sync(&b, &a);
    assert_eq!(body.to_plain_text(), "0ab1cd");
    assert_eq!(shared_string(&a, &body), "0ab1cd");

    assert!(history.back().unwrap());
    assert_eq!(body.to_plain_text(), "ab1cd");
    assert!(history.back().unwrap());
    assert_eq!(body.to_plain_text(), "ab1c");
    assert_eq!(shared_string(&a, &body), "ab1c");

    sync(&a, &b);
    assert_eq!(remote.to_plain_text(), "ab1c");
    assert_eq!(shared_string(&b, &remote), "ab1c");
}

#[test]
fn test_replays_are_routed_by_transaction_origin() {
    let scheduler = Rc::new(CountingScheduler::default());
    let engine = SyncEngine::with_options(
        new_shared_doc(),
        EngineOptions::default().with_scheduler(scheduler.clone()),
    );
    let root = Component::new("page", ProxyMap::new());
    engine.bootstrap_root(&root).unwrap();
    let history = HistoryManager::new(&engine, &HistoryConfig::default()).unwrap();

    let remote = scheduler.remote.get();
    root.state().set("a", 1);
    engine.flush().unwrap();
    assert_eq!((scheduler.remote.get(), scheduler.history.get()), (remote, 0));

    history.back().unwrap();
    assert_eq!((scheduler.remote.get(), scheduler.history.get()), (remote, 1));

    // A step taken outside the managers is still a history step.
    let origin = engine.record_origin(DocKey::ROOT).unwrap();
    let undo = DocUndo::new(
        &engine.root_doc(),
        DocKey::ROOT,
        &engine.root_map(),
        &origin,
        10,
        &engine.navigation_origins(),
    );
    root.state().set("b", 2);
    engine.flush().unwrap();
    assert!(undo.undo());
    assert!(!root.state().contains_key("b"));
    assert_eq!((scheduler.remote.get(), scheduler.history.get()), (remote, 2));

    let doc = new_shared_doc();
    {
        let update = Update::decode_v1(&engine.encode_state_as_update()).unwrap();
        doc.transact_mut().apply_update(update).unwrap();
    }
    let other = SyncEngine::new(doc);
    let other_root = Component::new("page", ProxyMap::new());
    other.bootstrap_root(&other_root).unwrap();
    other_root.state().set("c", 3);
    other.flush().unwrap();
    let diff = other.encode_diff(&engine.encode_state_vector()).unwrap();
    engine.apply_remote_update(&diff).unwrap();

    assert_eq!(root.state().get("c").map(|v| v.to_json()), Some(json!(3)));
    assert_eq!(scheduler.remote.get(), remote + 1);
    assert_eq!(scheduler.history.get(), 2);
}
