//! Observable maps and arrays used for component state.
//!
//! Every mutation goes through `apply`, which mutates, detaches replaced
//! nodes and emits the action with its [`ChangeMeta`]. The convenience
//! setters use [`ChangeMeta::local`].

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde_json::Value;

use super::change::{ArrayChange, ArrayEvent, ChangeEvent, ChangeMeta, MapChange, MapEvent};
use super::events::{Listeners, Subscription};
use super::lifecycle::{Lifecycle, NodeId};
use super::value::LocalValue;

struct MapInner {
    id: NodeId,
    entries: RefCell<IndexMap<String, LocalValue>>,
    changes: Listeners<MapEvent>,
    lifecycle: Lifecycle,
}

/// An observable string-keyed map.
#[derive(Clone)]
pub struct ProxyMap(Rc<MapInner>);

/// Non-owning handle to a [`ProxyMap`].
#[derive(Clone)]
pub struct WeakProxyMap(Weak<MapInner>);

impl WeakProxyMap {
    pub fn upgrade(&self) -> Option<ProxyMap> {
        self.0.upgrade().map(ProxyMap)
    }
}

impl ProxyMap {
    pub fn new() -> Self {
        Self(Rc::new(MapInner {
            id: NodeId::next(),
            entries: RefCell::new(IndexMap::new()),
            changes: Listeners::new(),
            lifecycle: Lifecycle::new(),
        }))
    }

    /// Build a map without emitting changes.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<LocalValue>,
    {
        let map = Self::new();
        map.0.entries.borrow_mut().extend(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into())),
        );
        map
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.0.lifecycle
    }

    pub fn ptr_eq(&self, other: &ProxyMap) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakProxyMap {
        WeakProxyMap(Rc::downgrade(&self.0))
    }

    pub fn get(&self, key: &str) -> Option<LocalValue> {
        self.0.entries.borrow().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.entries.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.entries.borrow().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(String, LocalValue)> {
        self.0
            .entries
            .borrow()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<LocalValue>) {
        self.apply(
            MapChange::PropSet {
                key: key.into(),
                value: value.into(),
            },
            ChangeMeta::local(),
        );
    }

    pub fn remove(&self, key: &str) {
        self.apply(
            MapChange::PropDelete {
                key: key.to_string(),
            },
            ChangeMeta::local(),
        );
    }

    /// Remove every entry, emitting one `PropDelete` per key.
    pub fn clear_with(&self, meta: ChangeMeta) {
        for key in self.keys() {
            self.apply(MapChange::PropDelete { key }, meta);
        }
    }

    /// Apply a change action and emit it.
    pub fn apply(&self, change: MapChange, meta: ChangeMeta) {
        match &change {
            MapChange::PropSet { key, value } => {
                let previous = self
                    .0
                    .entries
                    .borrow_mut()
                    .insert(key.clone(), value.clone());
                if let Some(previous) = previous
                    && !previous.same_node(value)
                {
                    previous.detach();
                }
            }
            MapChange::PropDelete { key } => {
                let removed = self.0.entries.borrow_mut().shift_remove(key);
                match removed {
                    Some(removed) => removed.detach(),
                    None => return,
                }
            }
        }
        self.0.changes.emit(&ChangeEvent { change, meta });
    }

    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MapEvent) + 'static,
    {
        self.0.changes.subscribe(callback)
    }

    pub fn to_json(&self) -> Value {
        let object = self
            .0
            .entries
            .borrow()
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        Value::Object(object)
    }

    pub(crate) fn destroy(&self) {
        if !self.0.lifecycle.destroy() {
            return;
        }
        self.0.changes.clear();
        let values: Vec<LocalValue> = self.0.entries.borrow().values().cloned().collect();
        for value in values {
            value.detach();
        }
    }
}

impl Default for ProxyMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProxyMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyMap")
            .field("id", &self.0.id)
            .field("keys", &self.keys())
            .finish_non_exhaustive()
    }
}

struct ArrayInner {
    id: NodeId,
    items: RefCell<Vec<LocalValue>>,
    changes: Listeners<ArrayEvent>,
    lifecycle: Lifecycle,
}

/// An observable array.
#[derive(Clone)]
pub struct ProxyArray(Rc<ArrayInner>);

/// Non-owning handle to a [`ProxyArray`].
#[derive(Clone)]
pub struct WeakProxyArray(Weak<ArrayInner>);

impl WeakProxyArray {
    pub fn upgrade(&self) -> Option<ProxyArray> {
        self.0.upgrade().map(ProxyArray)
    }
}

impl ProxyArray {
    pub fn new() -> Self {
        Self(Rc::new(ArrayInner {
            id: NodeId::next(),
            items: RefCell::new(Vec::new()),
            changes: Listeners::new(),
            lifecycle: Lifecycle::new(),
        }))
    }

    /// Build an array without emitting changes.
    pub fn from_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<LocalValue>,
    {
        let array = Self::new();
        array
            .0
            .items
            .borrow_mut()
            .extend(values.into_iter().map(Into::into));
        array
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.0.lifecycle
    }

    pub fn ptr_eq(&self, other: &ProxyArray) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakProxyArray {
        WeakProxyArray(Rc::downgrade(&self.0))
    }

    pub fn get(&self, index: usize) -> Option<LocalValue> {
        self.0.items.borrow().get(index).cloned()
    }

    pub fn to_vec(&self) -> Vec<LocalValue> {
        self.0.items.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.0.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, value: impl Into<LocalValue>) {
        let index = self.len() as u32;
        self.insert(index, vec![value.into()]);
    }

    pub fn insert(&self, index: u32, values: Vec<LocalValue>) {
        self.apply(ArrayChange::Insert { index, values }, ChangeMeta::local());
    }

    pub fn remove(&self, index: u32, count: u32) {
        self.apply(ArrayChange::Delete { index, count }, ChangeMeta::local());
    }

    pub fn set(&self, index: u32, value: impl Into<LocalValue>) {
        self.apply(
            ArrayChange::SetIndex {
                index,
                value: value.into(),
            },
            ChangeMeta::local(),
        );
    }

    /// Apply a change action and emit it.
    ///
    /// Out-of-range indexes are clamped to the end; the emitted action
    /// carries the clamped index.
    pub fn apply(&self, change: ArrayChange, meta: ChangeMeta) {
        let change = {
            let mut items = self.0.items.borrow_mut();
            let len = items.len() as u32;
            match change {
                ArrayChange::Insert { index, values } => {
                    let index = index.min(len);
                    let at = index as usize;
                    items.splice(at..at, values.iter().cloned());
                    ArrayChange::Insert { index, values }
                }
                ArrayChange::Delete { index, count } => {
                    let start = index.min(len);
                    let end = index.saturating_add(count).min(len);
                    if start == end {
                        return;
                    }
                    let removed: Vec<LocalValue> =
                        items.drain(start as usize..end as usize).collect();
                    drop(items);
                    for value in &removed {
                        value.detach();
                    }
                    ArrayChange::Delete {
                        index: start,
                        count: end - start,
                    }
                }
                ArrayChange::SetIndex { index, value } => {
                    if index >= len {
                        items.push(value.clone());
                        ArrayChange::Insert {
                            index: len,
                            values: vec![value],
                        }
                    } else {
                        let previous = std::mem::replace(&mut items[index as usize], value.clone());
                        drop(items);
                        if !previous.same_node(&value) {
                            previous.detach();
                        }
                        ArrayChange::SetIndex { index, value }
                    }
                }
            }
        };
        self.0.changes.emit(&ChangeEvent { change, meta });
    }

    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ArrayEvent) + 'static,
    {
        self.0.changes.subscribe(callback)
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.0.items.borrow().iter().map(LocalValue::to_json).collect())
    }

    pub(crate) fn destroy(&self) {
        if !self.0.lifecycle.destroy() {
            return;
        }
        self.0.changes.clear();
        let values = self.to_vec();
        for value in values {
            value.detach();
        }
    }
}

impl Default for ProxyArray {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProxyArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyArray")
            .field("id", &self.0.id)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
