use serde_json::Value;

use super::proxy::{ProxyArray, ProxyMap};
use super::slot::Slot;

/// A value stored in a component's state, a proxy map or a proxy array.
///
/// This is the local half of the structural conversion: every variant maps to
/// exactly one shared representation (primitive → `Any`, map → `Map`,
/// array → `Array`, slot → `Text`).
#[derive(Debug, Clone)]
pub enum LocalValue {
    Primitive(Value),
    Map(ProxyMap),
    Array(ProxyArray),
    Slot(Slot),
}

impl LocalValue {
    pub fn as_primitive(&self) -> Option<&Value> {
        match self {
            LocalValue::Primitive(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ProxyMap> {
        match self {
            LocalValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ProxyArray> {
        match self {
            LocalValue::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_slot(&self) -> Option<&Slot> {
        match self {
            LocalValue::Slot(slot) => Some(slot),
            _ => None,
        }
    }

    /// Whether both values are the same node (or equal primitives).
    pub fn same_node(&self, other: &LocalValue) -> bool {
        match (self, other) {
            (LocalValue::Primitive(a), LocalValue::Primitive(b)) => a == b,
            (LocalValue::Map(a), LocalValue::Map(b)) => a.ptr_eq(b),
            (LocalValue::Array(a), LocalValue::Array(b)) => a.ptr_eq(b),
            (LocalValue::Slot(a), LocalValue::Slot(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Detach the value from the tree, latching every nested node destroyed.
    pub(crate) fn detach(&self) {
        match self {
            LocalValue::Primitive(_) => {}
            LocalValue::Map(map) => map.destroy(),
            LocalValue::Array(array) => array.destroy(),
            LocalValue::Slot(slot) => slot.destroy(),
        }
    }

    /// Plain JSON rendering, for debugging and assertions.
    pub fn to_json(&self) -> Value {
        match self {
            LocalValue::Primitive(value) => value.clone(),
            LocalValue::Map(map) => map.to_json(),
            LocalValue::Array(array) => array.to_json(),
            LocalValue::Slot(slot) => Value::String(slot.to_plain_text()),
        }
    }
}

impl From<Value> for LocalValue {
    fn from(value: Value) -> Self {
        LocalValue::Primitive(value)
    }
}

impl From<&str> for LocalValue {
    fn from(value: &str) -> Self {
        LocalValue::Primitive(Value::String(value.to_string()))
    }
}

impl From<String> for LocalValue {
    fn from(value: String) -> Self {
        LocalValue::Primitive(Value::String(value))
    }
}

impl From<bool> for LocalValue {
    fn from(value: bool) -> Self {
        LocalValue::Primitive(Value::Bool(value))
    }
}

impl From<f64> for LocalValue {
    fn from(value: f64) -> Self {
        LocalValue::Primitive(serde_json::json!(value))
    }
}

impl From<i64> for LocalValue {
    fn from(value: i64) -> Self {
        LocalValue::Primitive(Value::from(value))
    }
}

impl From<ProxyMap> for LocalValue {
    fn from(value: ProxyMap) -> Self {
        LocalValue::Map(value)
    }
}

impl From<ProxyArray> for LocalValue {
    fn from(value: ProxyArray) -> Self {
        LocalValue::Array(value)
    }
}

impl From<Slot> for LocalValue {
    fn from(value: Slot) -> Self {
        LocalValue::Slot(value)
    }
}
