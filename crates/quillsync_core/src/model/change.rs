//! Change actions emitted by the local tree.
//!
//! Indexes are absolute and measured in UTF-16 code units, the unit the
//! shared text uses, so an action can be replayed against the shared node
//! without re-deriving a retain prefix.

use std::collections::BTreeMap;

use serde_json::Value;

use super::component::Component;
use super::value::LocalValue;

/// Format name → value.
pub type FormatMap = BTreeMap<String, Value>;

/// Format name → value, where `None` removes the format.
pub type FormatPatch = BTreeMap<String, Option<Value>>;

/// Who produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// Produced by an ordinary editing operation on this peer.
    Local,
    /// Applied by the sync engine while replaying a shared-document event.
    Remote,
}

/// The change marker carried by every emitted change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeMeta {
    /// Producer of the change
    pub origin: ChangeOrigin,
    /// Whether the change should become an undo step
    pub recordable: bool,
}

impl ChangeMeta {
    /// A local, undoable edit.
    pub const fn local() -> Self {
        Self {
            origin: ChangeOrigin::Local,
            recordable: true,
        }
    }

    /// A local edit that must not become an undo step.
    pub const fn untracked() -> Self {
        Self {
            origin: ChangeOrigin::Local,
            recordable: false,
        }
    }

    /// A change replayed from the shared document.
    pub const fn remote() -> Self {
        Self {
            origin: ChangeOrigin::Remote,
            recordable: false,
        }
    }

    /// Whether the change was replayed from the shared document.
    pub fn is_remote(&self) -> bool {
        self.origin == ChangeOrigin::Remote
    }
}

impl Default for ChangeMeta {
    fn default() -> Self {
        Self::local()
    }
}

/// Content inserted into a slot.
#[derive(Debug, Clone)]
pub enum SlotContent {
    Text(String),
    Component(Component),
}

impl SlotContent {
    /// Width in UTF-16 code units (components count as one).
    pub fn width(&self) -> u32 {
        match self {
            SlotContent::Text(text) => text.encode_utf16().count() as u32,
            SlotContent::Component(_) => 1,
        }
    }
}

/// A slot content-change action.
#[derive(Debug, Clone)]
pub enum SlotChange {
    /// Apply or remove formats over `[index, index + count)`.
    Retain {
        index: u32,
        count: u32,
        formats: FormatPatch,
    },
    /// Insert text or an embedded component at `index`.
    Insert {
        index: u32,
        content: SlotContent,
        formats: FormatMap,
    },
    /// Delete `count` units starting at `index`.
    Delete { index: u32, count: u32 },
    /// Set a slot-level attribute.
    AttrSet { name: String, value: Value },
    /// Remove a slot-level attribute.
    AttrDelete { name: String },
}

/// A proxy map change action.
#[derive(Debug, Clone)]
pub enum MapChange {
    PropSet { key: String, value: LocalValue },
    PropDelete { key: String },
}

/// A proxy array change action.
#[derive(Debug, Clone)]
pub enum ArrayChange {
    Insert { index: u32, values: Vec<LocalValue> },
    Delete { index: u32, count: u32 },
    SetIndex { index: u32, value: LocalValue },
}

/// An emitted change together with its marker.
#[derive(Debug, Clone)]
pub struct ChangeEvent<C> {
    pub change: C,
    pub meta: ChangeMeta,
}

pub type SlotEvent = ChangeEvent<SlotChange>;
pub type MapEvent = ChangeEvent<MapChange>;
pub type ArrayEvent = ChangeEvent<ArrayChange>;
