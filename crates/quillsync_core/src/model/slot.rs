//! Rich-text slots.
//!
//! A slot is an ordered run of items. Each item is either a character or an
//! embedded [`Component`] and carries its own format map; format ranges are
//! derived by merging adjacent items with equal values. Offsets are UTF-16
//! code units, and a component is one unit wide.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::change::{
    ChangeEvent, ChangeMeta, FormatMap, FormatPatch, SlotChange, SlotContent, SlotEvent,
};
use super::component::Component;
use super::events::{Listeners, Subscription};
use super::lifecycle::{Lifecycle, NodeId};
use super::proxy::ProxyMap;

/// Content a slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentType {
    Text,
    InlineComponent,
    BlockComponent,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::InlineComponent => "inlineComponent",
            ContentType::BlockComponent => "blockComponent",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "text" => Some(ContentType::Text),
            "inlineComponent" => Some(ContentType::InlineComponent),
            "blockComponent" => Some(ContentType::BlockComponent),
            _ => None,
        }
    }
}

/// Whether a node's content lives in the main shared document or in a
/// separately loaded sub-document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Sync,
    Async,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Sync => "sync",
            ContentKind::Async => "async",
        }
    }

    /// Parse the wire tag; anything but `"async"` is synchronous.
    pub fn from_tag(tag: &str) -> Self {
        if tag == "async" {
            ContentKind::Async
        } else {
            ContentKind::Sync
        }
    }
}

/// One unit (or one character) of slot content.
#[derive(Debug, Clone)]
pub enum ItemContent {
    Char(char),
    Component(Component),
}

impl ItemContent {
    fn width(&self) -> u32 {
        match self {
            ItemContent::Char(c) => c.len_utf16() as u32,
            ItemContent::Component(_) => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotItem {
    pub content: ItemContent,
    pub formats: FormatMap,
}

/// A maximal range `[start, end)` over which a format has one value.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatRange {
    pub start: u32,
    pub end: u32,
    pub value: Value,
}

#[derive(Default)]
struct SlotData {
    items: Vec<SlotItem>,
    attributes: BTreeMap<String, Value>,
}

impl SlotData {
    fn width(&self) -> u32 {
        self.items.iter().map(|item| item.content.width()).sum()
    }

    /// Item position of a UTF-16 offset, clamped to the end. An offset
    /// inside a surrogate pair resolves to the pair's character.
    fn position(&self, offset: u32) -> usize {
        let mut acc = 0u32;
        for (pos, item) in self.items.iter().enumerate() {
            if acc >= offset {
                return pos;
            }
            acc += item.content.width();
            if acc > offset {
                return pos;
            }
        }
        self.items.len()
    }
}

struct SlotInner {
    id: NodeId,
    kind: ContentKind,
    schema: Vec<ContentType>,
    sub_model_id: Option<String>,
    metadata: ProxyMap,
    data: RefCell<SlotData>,
    changes: Listeners<SlotEvent>,
    lifecycle: Lifecycle,
}

/// A rich-text container.
#[derive(Clone)]
pub struct Slot(Rc<SlotInner>);

/// Non-owning handle to a [`Slot`].
#[derive(Clone)]
pub struct WeakSlot(Weak<SlotInner>);

impl WeakSlot {
    pub fn upgrade(&self) -> Option<Slot> {
        self.0.upgrade().map(Slot)
    }
}

impl Slot {
    /// Create a synchronous slot.
    pub fn new(schema: Vec<ContentType>) -> Self {
        Self::from_parts(ContentKind::Sync, schema, None)
    }

    /// Create an asynchronous slot backed by a fresh sub-document identity.
    pub fn new_async(schema: Vec<ContentType>) -> Self {
        Self::from_parts(
            ContentKind::Async,
            schema,
            Some(uuid::Uuid::new_v4().to_string()),
        )
    }

    pub(crate) fn from_parts(
        kind: ContentKind,
        schema: Vec<ContentType>,
        sub_model_id: Option<String>,
    ) -> Self {
        Self(Rc::new(SlotInner {
            id: NodeId::next(),
            kind,
            schema,
            sub_model_id,
            metadata: ProxyMap::new(),
            data: RefCell::new(SlotData::default()),
            changes: Listeners::new(),
            lifecycle: Lifecycle::new(),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn kind(&self) -> ContentKind {
        self.0.kind
    }

    pub fn schema(&self) -> &[ContentType] {
        &self.0.schema
    }

    /// Identity of the backing sub-document (async slots only).
    pub fn sub_model_id(&self) -> Option<&str> {
        self.0.sub_model_id.as_deref()
    }

    /// Eagerly synced metadata of an async slot. Empty for sync slots.
    pub fn metadata(&self) -> &ProxyMap {
        &self.0.metadata
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.0.lifecycle
    }

    pub fn ptr_eq(&self, other: &Slot) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakSlot {
        WeakSlot(Rc::downgrade(&self.0))
    }

    // ==================== Queries ====================

    /// Length in UTF-16 code units.
    pub fn len(&self) -> u32 {
        self.0.data.borrow().width()
    }

    pub fn is_empty(&self) -> bool {
        self.0.data.borrow().items.is_empty()
    }

    /// The slot's characters, components omitted.
    pub fn to_plain_text(&self) -> String {
        self.0
            .data
            .borrow()
            .items
            .iter()
            .filter_map(|item| match item.content {
                ItemContent::Char(c) => Some(c),
                ItemContent::Component(_) => None,
            })
            .collect()
    }

    pub fn items(&self) -> Vec<SlotItem> {
        self.0.data.borrow().items.clone()
    }

    pub fn components(&self) -> Vec<Component> {
        self.0
            .data
            .borrow()
            .items
            .iter()
            .filter_map(|item| match &item.content {
                ItemContent::Component(component) => Some(component.clone()),
                ItemContent::Char(_) => None,
            })
            .collect()
    }

    /// Formats of the item starting at `offset`.
    pub fn formats_at(&self, offset: u32) -> FormatMap {
        let data = self.0.data.borrow();
        let pos = data.position(offset);
        data.items
            .get(pos)
            .map(|item| item.formats.clone())
            .unwrap_or_default()
    }

    /// Maximal ranges over which `name` has a single value.
    pub fn format_ranges(&self, name: &str) -> Vec<FormatRange> {
        let data = self.0.data.borrow();
        let mut ranges: Vec<FormatRange> = Vec::new();
        let mut offset = 0u32;
        for item in &data.items {
            let width = item.content.width();
            if let Some(value) = item.formats.get(name) {
                match ranges.last_mut() {
                    Some(last) if last.end == offset && &last.value == value => {
                        last.end = offset + width;
                    }
                    _ => ranges.push(FormatRange {
                        start: offset,
                        end: offset + width,
                        value: value.clone(),
                    }),
                }
            }
            offset += width;
        }
        ranges
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.0.data.borrow().attributes.get(name).cloned()
    }

    pub fn attributes(&self) -> BTreeMap<String, Value> {
        self.0.data.borrow().attributes.clone()
    }

    // ==================== Edits ====================

    pub fn insert_text(&self, index: u32, text: &str, formats: FormatMap) {
        self.apply(
            SlotChange::Insert {
                index,
                content: SlotContent::Text(text.to_string()),
                formats,
            },
            ChangeMeta::local(),
        );
    }

    pub fn insert_component(&self, index: u32, component: Component, formats: FormatMap) {
        self.apply(
            SlotChange::Insert {
                index,
                content: SlotContent::Component(component),
                formats,
            },
            ChangeMeta::local(),
        );
    }

    pub fn delete(&self, index: u32, count: u32) {
        self.apply(SlotChange::Delete { index, count }, ChangeMeta::local());
    }

    /// Apply (`Some`) or remove (`None`) one format over a range.
    pub fn format(&self, index: u32, count: u32, name: &str, value: Option<Value>) {
        let mut formats = FormatPatch::new();
        formats.insert(name.to_string(), value);
        self.apply(
            SlotChange::Retain {
                index,
                count,
                formats,
            },
            ChangeMeta::local(),
        );
    }

    pub fn set_attribute(&self, name: &str, value: Value) {
        self.apply(
            SlotChange::AttrSet {
                name: name.to_string(),
                value,
            },
            ChangeMeta::local(),
        );
    }

    pub fn remove_attribute(&self, name: &str) {
        self.apply(
            SlotChange::AttrDelete {
                name: name.to_string(),
            },
            ChangeMeta::local(),
        );
    }

    /// Delete all content and attributes.
    pub fn clear_with(&self, meta: ChangeMeta) {
        let len = self.len();
        if len > 0 {
            self.apply(SlotChange::Delete { index: 0, count: len }, meta);
        }
        for name in self.attributes().into_keys() {
            self.apply(SlotChange::AttrDelete { name }, meta);
        }
    }

    /// Apply a change action and emit it.
    ///
    /// Offsets past the end are clamped; the emitted action carries the
    /// effective range. No-op actions are not emitted.
    pub fn apply(&self, change: SlotChange, meta: ChangeMeta) {
        let mut detached = Vec::new();
        let effective = {
            let mut data = self.0.data.borrow_mut();
            let len = data.width();
            match change {
                SlotChange::Insert {
                    index,
                    content,
                    formats,
                } => {
                    let pos = data.position(index.min(len));
                    let new_items: Vec<SlotItem> = match &content {
                        SlotContent::Text(text) => text
                            .chars()
                            .map(|c| SlotItem {
                                content: ItemContent::Char(c),
                                formats: formats.clone(),
                            })
                            .collect(),
                        SlotContent::Component(component) => vec![SlotItem {
                            content: ItemContent::Component(component.clone()),
                            formats: formats.clone(),
                        }],
                    };
                    if new_items.is_empty() {
                        return;
                    }
                    let index: u32 = data.items[..pos]
                        .iter()
                        .map(|item| item.content.width())
                        .sum();
                    data.items.splice(pos..pos, new_items);
                    Some(SlotChange::Insert {
                        index,
                        content,
                        formats,
                    })
                }
                SlotChange::Delete { index, count } => {
                    let start = data.position(index.min(len));
                    let end = data.position(index.saturating_add(count).min(len));
                    if start >= end {
                        return;
                    }
                    let removed: Vec<SlotItem> = data.items.drain(start..end).collect();
                    let width = removed.iter().map(|item| item.content.width()).sum();
                    let index: u32 = data.items[..start]
                        .iter()
                        .map(|item| item.content.width())
                        .sum();
                    detached.extend(removed.into_iter().filter_map(|item| match item.content {
                        ItemContent::Component(component) => Some(component),
                        ItemContent::Char(_) => None,
                    }));
                    Some(SlotChange::Delete {
                        index,
                        count: width,
                    })
                }
                SlotChange::Retain {
                    index,
                    count,
                    formats,
                } => {
                    let start = data.position(index.min(len));
                    let end = data.position(index.saturating_add(count).min(len));
                    if start >= end || formats.is_empty() {
                        return;
                    }
                    for item in &mut data.items[start..end] {
                        for (name, value) in &formats {
                            match value {
                                Some(value) => {
                                    item.formats.insert(name.clone(), value.clone());
                                }
                                None => {
                                    item.formats.remove(name);
                                }
                            }
                        }
                    }
                    let index: u32 = data.items[..start]
                        .iter()
                        .map(|item| item.content.width())
                        .sum();
                    let count = data.items[start..end]
                        .iter()
                        .map(|item| item.content.width())
                        .sum();
                    Some(SlotChange::Retain {
                        index,
                        count,
                        formats,
                    })
                }
                SlotChange::AttrSet { name, value } => {
                    data.attributes.insert(name.clone(), value.clone());
                    Some(SlotChange::AttrSet { name, value })
                }
                SlotChange::AttrDelete { name } => data
                    .attributes
                    .remove(&name)
                    .map(|_| SlotChange::AttrDelete { name }),
            }
        };

        for component in detached {
            component.destroy();
        }
        if let Some(change) = effective {
            self.0.changes.emit(&ChangeEvent { change, meta });
        }
    }

    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SlotEvent) + 'static,
    {
        self.0.changes.subscribe(callback)
    }

    pub(crate) fn destroy(&self) {
        if !self.0.lifecycle.destroy() {
            return;
        }
        self.0.changes.clear();
        self.0.metadata.destroy();
        for component in self.components() {
            component.destroy();
        }
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("text", &self.to_plain_text())
            .finish_non_exhaustive()
    }
}
