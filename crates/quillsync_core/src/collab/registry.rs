//! Slot ↔ shared text association.
//!
//! The registry relates each attached [`Slot`] to the shared text holding its
//! content, in both directions. It owns neither side: slots are held weakly
//! and the text handles are plain `yrs` references.

use std::collections::HashMap;

use yrs::TextRef;
use yrs::branch::{Branch, BranchID};

use crate::model::{NodeId, Slot, WeakSlot};

/// Engine-assigned identity of a tracked shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey(pub(crate) u32);

impl DocKey {
    /// The main shared document.
    pub const ROOT: DocKey = DocKey(0);

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "doc:{}", self.0)
    }
}

/// Identity of a shared node within the tracked documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedKey {
    pub doc: DocKey,
    pub branch: BranchID,
}

impl SharedKey {
    pub fn of<T: AsRef<Branch>>(doc: DocKey, shared: &T) -> Self {
        Self {
            doc,
            branch: shared.as_ref().id(),
        }
    }
}

/// A shared text together with where it lives.
#[derive(Debug, Clone)]
pub struct SharedText {
    pub key: SharedKey,
    pub text: TextRef,
}

impl SharedText {
    pub fn new(doc: DocKey, text: TextRef) -> Self {
        Self {
            key: SharedKey::of(doc, &text),
            text,
        }
    }

    pub fn doc(&self) -> DocKey {
        self.key.doc
    }
}

/// Bidirectional, non-owning slot ↔ text relation.
#[derive(Default)]
pub struct SlotRegistry {
    by_slot: HashMap<NodeId, SharedText>,
    by_text: HashMap<SharedKey, (NodeId, WeakSlot)>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relate `slot` and `text`, replacing any previous association of
    /// either side.
    pub fn associate(&mut self, slot: &Slot, text: SharedText) {
        self.dissociate_slot(slot);
        self.dissociate_text(&text.key);
        self.by_text
            .insert(text.key.clone(), (slot.id(), slot.downgrade()));
        self.by_slot.insert(slot.id(), text);
    }

    pub fn text_for(&self, slot: &Slot) -> Option<SharedText> {
        self.text_for_id(slot.id())
    }

    pub fn text_for_id(&self, id: NodeId) -> Option<SharedText> {
        self.by_slot.get(&id).cloned()
    }

    /// The live slot associated with a text, if any.
    pub fn slot_for(&self, key: &SharedKey) -> Option<Slot> {
        self.by_text.get(key).and_then(|(_, slot)| slot.upgrade())
    }

    pub fn dissociate_slot(&mut self, slot: &Slot) -> Option<SharedText> {
        self.dissociate_id(slot.id())
    }

    pub fn dissociate_id(&mut self, id: NodeId) -> Option<SharedText> {
        let text = self.by_slot.remove(&id)?;
        self.by_text.remove(&text.key);
        Some(text)
    }

    pub fn dissociate_text(&mut self, key: &SharedKey) -> Option<NodeId> {
        let (id, _) = self.by_text.remove(key)?;
        self.by_slot.remove(&id);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.by_slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slot.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_slot.clear();
        self.by_text.clear();
    }
}

impl std::fmt::Debug for SlotRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRegistry")
            .field("len", &self.by_slot.len())
            .finish()
    }
}
