//! Sub-document creation and loading.
//!
//! Async slots and components keep their content in a separate shared
//! document identified by the node's sub-model id. The engine asks a
//! [`SubModelLoader`] to create one when a local async node is first synced
//! outward, and to load one when a remote async node is first needed.
//!
//! [`NonSubModelLoader`] is the default: it fails every request with
//! [`CollabError::UnsupportedOperation`], so a document using async nodes
//! without a loader configured fails loudly. [`MemorySubModelLoader`] keeps
//! sub-documents in memory.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::new_shared_doc;
use crate::error::{CollabError, Result};
use crate::model::{Component, Lifecycle, NodeId, Slot, WeakComponent, WeakSlot};

/// Boxed future without a `Send` bound; sub-documents are `Rc`-backed.
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// A node backed by a sub-document.
#[derive(Debug, Clone)]
pub enum SubModelTarget {
    Slot(Slot),
    Component(Component),
}

impl SubModelTarget {
    pub fn guid(&self) -> Option<&str> {
        match self {
            SubModelTarget::Slot(slot) => slot.sub_model_id(),
            SubModelTarget::Component(component) => component.sub_model_id(),
        }
    }

    pub fn id(&self) -> NodeId {
        match self {
            SubModelTarget::Slot(slot) => slot.id(),
            SubModelTarget::Component(component) => component.id(),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        match self {
            SubModelTarget::Slot(slot) => slot.lifecycle(),
            SubModelTarget::Component(component) => component.lifecycle(),
        }
    }

    pub fn downgrade(&self) -> WeakSubModelTarget {
        match self {
            SubModelTarget::Slot(slot) => WeakSubModelTarget::Slot(slot.downgrade()),
            SubModelTarget::Component(component) => {
                WeakSubModelTarget::Component(component.downgrade())
            }
        }
    }

    fn require_guid(&self, operation: &'static str) -> Result<String> {
        self.guid().map(str::to_string).ok_or_else(|| {
            CollabError::invariant(format!("{operation} called for a synchronous node"))
        })
    }
}

/// Non-owning [`SubModelTarget`], held while a load is in flight.
#[derive(Clone)]
pub enum WeakSubModelTarget {
    Slot(WeakSlot),
    Component(WeakComponent),
}

impl WeakSubModelTarget {
    pub fn upgrade(&self) -> Option<SubModelTarget> {
        match self {
            WeakSubModelTarget::Slot(slot) => slot.upgrade().map(SubModelTarget::Slot),
            WeakSubModelTarget::Component(component) => {
                component.upgrade().map(SubModelTarget::Component)
            }
        }
    }
}

/// Why a sub-document is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubModelRequest {
    /// The local peer authored the node; the sub-document is new.
    Create,
    /// A remote peer announced the node; the sub-document must be fetched.
    Load,
}

/// Strategy for creating and opening sub-documents.
///
/// Documents returned by the futures should be created with
/// [`new_shared_doc`] so offsets are measured in UTF-16 code units.
pub trait SubModelLoader {
    /// Create a brand-new sub-document for a locally authored node.
    fn create_sub_model_for(&self, target: &SubModelTarget) -> LocalBoxFuture<'static, Result<Doc>>;

    /// Open the sub-document a remote peer announced.
    fn load_sub_model_for(&self, target: &SubModelTarget) -> LocalBoxFuture<'static, Result<Doc>>;

    fn get_loaded_sub_model_for_slot(&self, slot: &Slot) -> Option<Doc>;

    fn get_loaded_sub_model_for_component(&self, component: &Component) -> Option<Doc>;
}

/// Loader for hosts without sub-document support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonSubModelLoader;

impl NonSubModelLoader {
    fn unsupported(operation: &'static str) -> LocalBoxFuture<'static, Result<Doc>> {
        Box::pin(async move {
            Err(CollabError::UnsupportedOperation {
                operation,
                reason: "no sub-model loader is configured, so async slots and components \
                         cannot be backed by sub-documents"
                    .to_string(),
            })
        })
    }
}

impl SubModelLoader for NonSubModelLoader {
    fn create_sub_model_for(&self, _target: &SubModelTarget) -> LocalBoxFuture<'static, Result<Doc>> {
        Self::unsupported("create_sub_model_for")
    }

    fn load_sub_model_for(&self, _target: &SubModelTarget) -> LocalBoxFuture<'static, Result<Doc>> {
        Self::unsupported("load_sub_model_for")
    }

    fn get_loaded_sub_model_for_slot(&self, _slot: &Slot) -> Option<Doc> {
        None
    }

    fn get_loaded_sub_model_for_component(&self, _component: &Component) -> Option<Doc> {
        None
    }
}

/// In-memory sub-document store.
///
/// Created documents are cached by sub-model id. Documents to be loaded can
/// be seeded with an encoded state (e.g. exported from another peer's
/// loader with [`MemorySubModelLoader::encode`]).
#[derive(Default)]
pub struct MemorySubModelLoader {
    /// Opened documents (guid -> doc)
    docs: RefCell<HashMap<String, Doc>>,

    /// States available for loading (guid -> v1 update)
    seeds: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemorySubModelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a sub-document state available for loading.
    pub fn seed(&self, guid: impl Into<String>, state: Vec<u8>) {
        self.seeds.borrow_mut().insert(guid.into(), state);
    }

    /// Encode the full state of an opened sub-document.
    pub fn encode(&self, guid: &str) -> Option<Vec<u8>> {
        let docs = self.docs.borrow();
        let doc = docs.get(guid)?;
        let txn = doc.transact();
        Some(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    pub fn get(&self, guid: &str) -> Option<Doc> {
        self.docs.borrow().get(guid).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.borrow().is_empty()
    }

    fn open_seeded(&self, guid: &str) -> Result<Doc> {
        if let Some(doc) = self.get(guid) {
            return Ok(doc);
        }
        let state = self
            .seeds
            .borrow()
            .get(guid)
            .cloned()
            .ok_or_else(|| CollabError::SubModelUnavailable {
                guid: guid.to_string(),
            })?;
        let update = Update::decode_v1(&state).map_err(|e| CollabError::Crdt(e.to_string()))?;
        let doc = new_shared_doc();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| CollabError::Crdt(e.to_string()))?;
        }
        self.docs.borrow_mut().insert(guid.to_string(), doc.clone());
        Ok(doc)
    }
}

impl std::fmt::Debug for MemorySubModelLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySubModelLoader")
            .field("docs", &self.docs.borrow().len())
            .field("seeds", &self.seeds.borrow().len())
            .finish()
    }
}

impl SubModelLoader for MemorySubModelLoader {
    fn create_sub_model_for(&self, target: &SubModelTarget) -> LocalBoxFuture<'static, Result<Doc>> {
        let result = target.require_guid("create_sub_model_for").map(|guid| {
            log::debug!("[MemorySubModelLoader] Creating sub-document {}", guid);
            let doc = new_shared_doc();
            self.docs.borrow_mut().insert(guid, doc.clone());
            doc
        });
        Box::pin(async move { result })
    }

    fn load_sub_model_for(&self, target: &SubModelTarget) -> LocalBoxFuture<'static, Result<Doc>> {
        let result = target
            .require_guid("load_sub_model_for")
            .and_then(|guid| self.open_seeded(&guid));
        Box::pin(async move { result })
    }

    fn get_loaded_sub_model_for_slot(&self, slot: &Slot) -> Option<Doc> {
        slot.sub_model_id().and_then(|guid| self.get(guid))
    }

    fn get_loaded_sub_model_for_component(&self, component: &Component) -> Option<Doc> {
        component.sub_model_id().and_then(|guid| self.get(guid))
    }
}

/// Export a document's state, e.g. to seed another peer's loader.
pub fn encode_doc(doc: &Doc) -> Vec<u8> {
    doc.transact()
        .encode_state_as_update_v1(&StateVector::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentType, ProxyMap};
    use futures_lite::future::block_on;
    use yrs::{GetString, Text};

    fn create_async_slot() -> SubModelTarget {
        SubModelTarget::Slot(Slot::new_async(vec![ContentType::Text]))
    }

    #[test]
    fn test_non_loader_fails_loudly() {
        let loader = NonSubModelLoader;
        let target = create_async_slot();

        let err = block_on(loader.create_sub_model_for(&target)).unwrap_err();
        assert!(matches!(
            err,
            CollabError::UnsupportedOperation {
                operation: "create_sub_model_for",
                ..
            }
        ));
        assert!(block_on(loader.load_sub_model_for(&target)).is_err());
    }

    #[test]
    fn test_memory_loader_caches_created_docs() {
        let loader = MemorySubModelLoader::new();
        let target = create_async_slot();

        let doc = block_on(loader.create_sub_model_for(&target)).unwrap();
        let SubModelTarget::Slot(slot) = &target else {
            unreachable!()
        };
        let cached = loader.get_loaded_sub_model_for_slot(slot).unwrap();
        assert_eq!(doc.guid(), cached.guid());
    }

    #[test]
    fn test_memory_loader_loads_seeded_state() {
        let source = new_shared_doc();
        let text = source.get_or_insert_text("content");
        text.insert(&mut source.transact_mut(), 0, "seeded");

        let target = create_async_slot();
        let guid = target.guid().unwrap().to_string();
        let loader = MemorySubModelLoader::new();
        loader.seed(&guid, encode_doc(&source));

        let doc = block_on(loader.load_sub_model_for(&target)).unwrap();
        let content = doc.get_or_insert_text("content");
        assert_eq!(content.get_string(&doc.transact()), "seeded");
    }

    #[test]
    fn test_missing_seed_is_reported() {
        let loader = MemorySubModelLoader::new();
        let target = SubModelTarget::Component(Component::new_async("table", ProxyMap::new()));

        let err = block_on(loader.load_sub_model_for(&target)).unwrap_err();
        assert!(matches!(err, CollabError::SubModelUnavailable { .. }));
    }
}
