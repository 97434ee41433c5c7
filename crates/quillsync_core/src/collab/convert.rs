//! Structural conversion between the local tree and shared types.
//!
//! Both directions are total over closed unions:
//!
//! | local                | shared                                  |
//! |----------------------|-----------------------------------------|
//! | `Primitive(Value)`   | `Any`                                   |
//! | `Map(ProxyMap)`      | `MapRef`                                |
//! | `Array(ProxyArray)`  | `ArrayRef`                              |
//! | `Slot(Slot)`         | wrapper `TextRef` (one embed + header)  |
//!
//! Components only appear as embeds inside slot content (and as the root),
//! encoded as a `MapRef` with `name`, `type` and either `state` or `guid`.
//!
//! Encoding runs inside an open transaction and never fails: everything that
//! can fail is checked before the transaction opens. Decoding reads through
//! the transaction that delivered the change and fails on shapes this crate
//! never writes.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use yrs::types::Attrs;
use yrs::types::text::YChange;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Map, MapPrelim, MapRef, Out, ReadTxn, Text, TextPrelim,
    TextRef, TransactionMut,
};

use super::host::{ComponentFactory, ComponentSpec, FormatRegistry};
use super::loader::{SubModelRequest, SubModelTarget};
use super::registry::DocKey;
use crate::error::{CollabError, Result};
use crate::model::{
    ChangeMeta, Component, ContentKind, ContentType, FormatMap, FormatPatch, ItemContent,
    LocalValue, MapChange, ProxyArray, ProxyMap, Slot, SlotChange, SlotContent, SlotItem,
};

/// Component map field holding the component name.
pub const NAME_KEY: &str = "name";
/// Component map / slot header field holding `"sync"` or `"async"`.
pub const TYPE_KEY: &str = "type";
/// Component map field holding the synchronous state map.
pub const STATE_KEY: &str = "state";
/// Sub-document identity of an async component or slot.
pub const GUID_KEY: &str = "guid";
/// Slot header field holding the accepted content types.
pub const SCHEMA_KEY: &str = "schema";

const RESERVED_SLOT_KEYS: [&str; 3] = [SCHEMA_KEY, TYPE_KEY, GUID_KEY];

pub(crate) fn is_reserved(key: &str) -> bool {
    RESERVED_SLOT_KEYS.iter().any(|reserved| *reserved == key)
}

/// What conversion needs from the engine: node binding, sub-model requests
/// and the host lookups.
pub(crate) trait ConvertContext {
    fn bind_map(&self, doc: DocKey, shared: &MapRef, local: &ProxyMap);
    fn bind_array(&self, doc: DocKey, shared: &ArrayRef, local: &ProxyArray);
    /// `content` is `None` for async slots until their sub-document loads.
    fn bind_slot(&self, doc: DocKey, wrapper: &TextRef, content: Option<&TextRef>, slot: &Slot);
    fn request_sub_model(&self, target: SubModelTarget, request: SubModelRequest);
    fn formats(&self) -> &dyn FormatRegistry;
    fn components(&self) -> &dyn ComponentFactory;
}

// ==================== Primitives ====================

/// Convert JSON to a shared primitive. Integers stay integers.
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => {
            let items: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(items.into())
        }
        Value::Object(entries) => {
            let entries: HashMap<String, Any> = entries
                .iter()
                .map(|(key, value)| (key.clone(), json_to_any(value)))
                .collect();
            Any::Map(Arc::new(entries))
        }
    }
}

/// Convert a shared primitive to JSON. Buffers become byte arrays.
pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), any_to_json(value)))
                .collect(),
        ),
    }
}

pub fn formats_to_attrs(formats: &FormatMap) -> Attrs {
    formats
        .iter()
        .map(|(key, value)| (Arc::from(key.as_str()), json_to_any(value)))
        .collect()
}

/// A patch where `None` becomes `Any::Null`, which removes the format.
pub fn patch_to_attrs(patch: &FormatPatch) -> Attrs {
    patch
        .iter()
        .map(|(key, value)| {
            let any = value.as_ref().map(json_to_any).unwrap_or(Any::Null);
            (Arc::from(key.as_str()), any)
        })
        .collect()
}

/// Formats of inserted content, translated through the registry.
pub fn attrs_to_formats(registry: &dyn FormatRegistry, attrs: Option<&Attrs>) -> FormatMap {
    let mut formats = FormatMap::new();
    for (key, value) in attrs.into_iter().flatten() {
        if matches!(value, Any::Null | Any::Undefined) {
            continue;
        }
        match registry.lookup_formatter(key) {
            Some(name) => {
                formats.insert(name, any_to_json(value));
            }
            None => log::debug!("[Convert] Dropping unknown format '{}'", key),
        }
    }
    formats
}

/// Format changes of a retain, translated through the registry.
pub fn attrs_to_patch(registry: &dyn FormatRegistry, attrs: &Attrs) -> FormatPatch {
    let mut patch = FormatPatch::new();
    for (key, value) in attrs {
        match registry.lookup_formatter(key) {
            Some(name) => {
                let value = match value {
                    Any::Null | Any::Undefined => None,
                    other => Some(any_to_json(other)),
                };
                patch.insert(name, value);
            }
            None => log::debug!("[Convert] Dropping unknown format '{}'", key),
        }
    }
    patch
}

/// Slot attribute changes carried by a header retain.
pub fn attrs_to_slot_changes(registry: &dyn FormatRegistry, attrs: &Attrs) -> Vec<SlotChange> {
    let mut changes = Vec::new();
    for (key, value) in attrs {
        if is_reserved(key) {
            continue;
        }
        let Some(name) = registry.lookup_attribute(key) else {
            log::debug!("[Convert] Dropping unknown attribute '{}'", key);
            continue;
        };
        changes.push(match value {
            Any::Null | Any::Undefined => SlotChange::AttrDelete { name },
            other => SlotChange::AttrSet {
                name,
                value: any_to_json(other),
            },
        });
    }
    changes
}

fn read_string<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<String> {
    match map.get(txn, key) {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    }
}

fn attr_string(attrs: &Attrs, key: &str) -> Option<String> {
    match attrs.get(key) {
        Some(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

// ==================== Local → shared ====================

fn slot_header(slot: &Slot) -> Attrs {
    let mut attrs = Attrs::new();
    let schema: Vec<Any> = slot
        .schema()
        .iter()
        .map(|content| Any::String(Arc::from(content.as_str())))
        .collect();
    attrs.insert(Arc::from(SCHEMA_KEY), Any::Array(schema.into()));
    attrs.insert(Arc::from(TYPE_KEY), Any::String(Arc::from(slot.kind().as_str())));
    if let Some(guid) = slot.sub_model_id() {
        attrs.insert(Arc::from(GUID_KEY), Any::String(Arc::from(guid)));
    }
    for (name, value) in slot.attributes() {
        if is_reserved(&name) {
            log::warn!("[Convert] Slot attribute '{}' shadows a header field, skipped", name);
            continue;
        }
        attrs.insert(Arc::from(name.as_str()), json_to_any(&value));
    }
    attrs
}

pub(crate) fn write_map_entry(
    ctx: &dyn ConvertContext,
    txn: &mut TransactionMut,
    doc: DocKey,
    map: &MapRef,
    key: &str,
    value: &LocalValue,
) {
    match value {
        LocalValue::Primitive(value) => {
            map.insert(txn, key, json_to_any(value));
        }
        LocalValue::Map(local) => {
            let shared = map.insert(txn, key, MapPrelim::default());
            fill_map(ctx, txn, doc, &shared, local);
        }
        LocalValue::Array(local) => {
            let shared = map.insert(txn, key, ArrayPrelim::default());
            fill_array(ctx, txn, doc, &shared, local);
        }
        LocalValue::Slot(slot) => {
            let wrapper = map.insert(txn, key, TextPrelim::new(""));
            fill_slot(ctx, txn, doc, &wrapper, slot);
        }
    }
}

pub(crate) fn write_array_item(
    ctx: &dyn ConvertContext,
    txn: &mut TransactionMut,
    doc: DocKey,
    array: &ArrayRef,
    index: u32,
    value: &LocalValue,
) {
    match value {
        LocalValue::Primitive(value) => {
            array.insert(txn, index, json_to_any(value));
        }
        LocalValue::Map(local) => {
            let shared = array.insert(txn, index, MapPrelim::default());
            fill_map(ctx, txn, doc, &shared, local);
        }
        LocalValue::Array(local) => {
            let shared = array.insert(txn, index, ArrayPrelim::default());
            fill_array(ctx, txn, doc, &shared, local);
        }
        LocalValue::Slot(slot) => {
            let wrapper = array.insert(txn, index, TextPrelim::new(""));
            fill_slot(ctx, txn, doc, &wrapper, slot);
        }
    }
}

/// Write every entry of `local` into the empty `shared` map and bind them.
pub(crate) fn fill_map(
    ctx: &dyn ConvertContext,
    txn: &mut TransactionMut,
    doc: DocKey,
    shared: &MapRef,
    local: &ProxyMap,
) {
    for (key, value) in local.entries() {
        write_map_entry(ctx, txn, doc, shared, &key, &value);
    }
    ctx.bind_map(doc, shared, local);
}

pub(crate) fn fill_array(
    ctx: &dyn ConvertContext,
    txn: &mut TransactionMut,
    doc: DocKey,
    shared: &ArrayRef,
    local: &ProxyArray,
) {
    for (index, value) in local.to_vec().iter().enumerate() {
        write_array_item(ctx, txn, doc, shared, index as u32, value);
    }
    ctx.bind_array(doc, shared, local);
}

/// Write a slot into an empty wrapper text.
pub(crate) fn fill_slot(
    ctx: &dyn ConvertContext,
    txn: &mut TransactionMut,
    doc: DocKey,
    wrapper: &TextRef,
    slot: &Slot,
) {
    let header = slot_header(slot);
    match slot.kind() {
        ContentKind::Sync => {
            let content = wrapper.insert_embed_with_attributes(txn, 0, TextPrelim::new(""), header);
            write_items(ctx, txn, doc, &content, 0, &slot.items());
            ctx.bind_slot(doc, wrapper, Some(&content), slot);
        }
        ContentKind::Async => {
            let metadata =
                wrapper.insert_embed_with_attributes(txn, 0, MapPrelim::default(), header);
            fill_map(ctx, txn, doc, &metadata, slot.metadata());
            ctx.bind_slot(doc, wrapper, None, slot);
            ctx.request_sub_model(SubModelTarget::Slot(slot.clone()), SubModelRequest::Create);
        }
    }
}

/// Write slot items into a content text, merging adjacent characters with
/// equal formats into one insert.
pub(crate) fn write_items(
    ctx: &dyn ConvertContext,
    txn: &mut TransactionMut,
    doc: DocKey,
    content: &TextRef,
    start: u32,
    items: &[SlotItem],
) {
    let mut offset = start;
    let mut run = String::new();
    let mut run_formats: Option<&FormatMap> = None;

    let flush_run = |txn: &mut TransactionMut, offset: &mut u32, run: &mut String, formats: &FormatMap| {
        if run.is_empty() {
            return;
        }
        content.insert_with_attributes(txn, *offset, run, formats_to_attrs(formats));
        *offset += run.encode_utf16().count() as u32;
        run.clear();
    };

    for item in items {
        match &item.content {
            ItemContent::Char(c) => {
                if let Some(formats) = run_formats
                    && formats != &item.formats
                {
                    flush_run(txn, &mut offset, &mut run, formats);
                }
                run_formats = Some(&item.formats);
                run.push(*c);
            }
            ItemContent::Component(component) => {
                if let Some(formats) = run_formats.take() {
                    flush_run(txn, &mut offset, &mut run, formats);
                }
                insert_component(ctx, txn, doc, content, offset, component, &item.formats);
                offset += 1;
            }
        }
    }
    if let Some(formats) = run_formats {
        flush_run(txn, &mut offset, &mut run, formats);
    }
}

/// Insert slot content at `index` of a content text.
pub(crate) fn insert_content(
    ctx: &dyn ConvertContext,
    txn: &mut TransactionMut,
    doc: DocKey,
    text: &TextRef,
    index: u32,
    content: &SlotContent,
    formats: &FormatMap,
) {
    match content {
        SlotContent::Text(chunk) => {
            text.insert_with_attributes(txn, index, chunk, formats_to_attrs(formats));
        }
        SlotContent::Component(component) => {
            insert_component(ctx, txn, doc, text, index, component, formats);
        }
    }
}

fn insert_component(
    ctx: &dyn ConvertContext,
    txn: &mut TransactionMut,
    doc: DocKey,
    text: &TextRef,
    index: u32,
    component: &Component,
    formats: &FormatMap,
) {
    let shared =
        text.insert_embed_with_attributes(txn, index, MapPrelim::default(), formats_to_attrs(formats));
    write_component(ctx, txn, doc, &shared, component);
}

/// Write a component's fields into an empty component map.
pub(crate) fn write_component(
    ctx: &dyn ConvertContext,
    txn: &mut TransactionMut,
    doc: DocKey,
    shared: &MapRef,
    component: &Component,
) {
    shared.insert(txn, NAME_KEY, component.name());
    shared.insert(txn, TYPE_KEY, component.kind().as_str());
    match (component.kind(), component.sub_model_id()) {
        (ContentKind::Async, Some(guid)) => {
            shared.insert(txn, GUID_KEY, guid);
            ctx.request_sub_model(
                SubModelTarget::Component(component.clone()),
                SubModelRequest::Create,
            );
        }
        _ => {
            let state = shared.insert(txn, STATE_KEY, MapPrelim::default());
            fill_map(ctx, txn, doc, &state, component.state());
        }
    }
}

/// Component names referenced by a value, for validation before a write.
pub(crate) fn component_names(value: &LocalValue, names: &mut Vec<String>) {
    match value {
        LocalValue::Primitive(_) => {}
        LocalValue::Map(map) => {
            for (_, value) in map.entries() {
                component_names(&value, names);
            }
        }
        LocalValue::Array(array) => {
            for value in array.to_vec() {
                component_names(&value, names);
            }
        }
        LocalValue::Slot(slot) => slot_component_names(slot, names),
    }
}

pub(crate) fn slot_component_names(slot: &Slot, names: &mut Vec<String>) {
    for component in slot.components() {
        component_tree_names(&component, names);
    }
}

pub(crate) fn component_tree_names(component: &Component, names: &mut Vec<String>) {
    names.push(component.name().to_string());
    for (_, value) in component.state().entries() {
        component_names(&value, names);
    }
}

// ==================== Shared → local ====================

pub(crate) fn decode_value<T: ReadTxn>(
    ctx: &dyn ConvertContext,
    txn: &T,
    doc: DocKey,
    value: &Out,
) -> Result<LocalValue> {
    match value {
        Out::Any(any) => Ok(LocalValue::Primitive(any_to_json(any))),
        Out::YMap(map) => Ok(LocalValue::Map(decode_map(ctx, txn, doc, map)?)),
        Out::YArray(array) => Ok(LocalValue::Array(decode_array(ctx, txn, doc, array)?)),
        Out::YText(wrapper) => Ok(LocalValue::Slot(decode_slot(ctx, txn, doc, wrapper)?)),
        other => Err(CollabError::invariant(format!(
            "unsupported shared value {other:?}"
        ))),
    }
}

pub(crate) fn decode_map<T: ReadTxn>(
    ctx: &dyn ConvertContext,
    txn: &T,
    doc: DocKey,
    shared: &MapRef,
) -> Result<ProxyMap> {
    let entries = decode_entries(ctx, txn, doc, shared)?;
    let local = ProxyMap::from_entries(entries);
    ctx.bind_map(doc, shared, &local);
    Ok(local)
}

/// Decode the entries of a shared map without binding the map itself.
pub(crate) fn decode_entries<T: ReadTxn>(
    ctx: &dyn ConvertContext,
    txn: &T,
    doc: DocKey,
    shared: &MapRef,
) -> Result<Vec<(String, LocalValue)>> {
    let mut entries = Vec::new();
    for (key, value) in shared.iter(txn) {
        entries.push((key.to_string(), decode_value(ctx, txn, doc, &value)?));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

pub(crate) fn decode_array<T: ReadTxn>(
    ctx: &dyn ConvertContext,
    txn: &T,
    doc: DocKey,
    shared: &ArrayRef,
) -> Result<ProxyArray> {
    let mut values = Vec::new();
    for value in shared.iter(txn) {
        values.push(decode_value(ctx, txn, doc, &value)?);
    }
    let local = ProxyArray::from_values(values);
    ctx.bind_array(doc, shared, &local);
    Ok(local)
}

/// Decode a wrapper text into a slot and bind it.
pub(crate) fn decode_slot<T: ReadTxn>(
    ctx: &dyn ConvertContext,
    txn: &T,
    doc: DocKey,
    wrapper: &TextRef,
) -> Result<Slot> {
    let mut chunks = wrapper.diff(txn, YChange::identity);
    if chunks.len() != 1 {
        return Err(CollabError::invariant(format!(
            "slot wrapper holds {} chunks, expected one embed",
            chunks.len()
        )));
    }
    let chunk = chunks.remove(0);
    let header = chunk.attributes.map(|attrs| *attrs).unwrap_or_default();

    let schema = match header.get(SCHEMA_KEY) {
        Some(Any::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Any::String(tag) => ContentType::from_tag(tag),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    let kind = attr_string(&header, TYPE_KEY)
        .map(|tag| ContentKind::from_tag(&tag))
        .unwrap_or_default();

    let slot = match (kind, chunk.insert) {
        (ContentKind::Sync, Out::YText(content)) => {
            let slot = Slot::from_parts(ContentKind::Sync, schema, None);
            read_content_into(ctx, txn, doc, &content, &slot)?;
            apply_header_attributes(ctx, &slot, &header);
            ctx.bind_slot(doc, wrapper, Some(&content), &slot);
            slot
        }
        (ContentKind::Async, Out::YMap(metadata)) => {
            let guid = attr_string(&header, GUID_KEY).ok_or_else(|| {
                CollabError::invariant("async slot header carries no sub-document id")
            })?;
            let slot = Slot::from_parts(ContentKind::Async, schema, Some(guid));
            for (key, value) in decode_entries(ctx, txn, doc, &metadata)? {
                slot.metadata()
                    .apply(MapChange::PropSet { key, value }, ChangeMeta::remote());
            }
            ctx.bind_map(doc, &metadata, slot.metadata());
            apply_header_attributes(ctx, &slot, &header);
            ctx.bind_slot(doc, wrapper, None, &slot);
            ctx.request_sub_model(SubModelTarget::Slot(slot.clone()), SubModelRequest::Load);
            slot
        }
        (ContentKind::Sync, _) => {
            return Err(CollabError::invariant(
                "sync slot wrapper is missing its content text",
            ));
        }
        (ContentKind::Async, _) => {
            return Err(CollabError::invariant(
                "async slot wrapper is missing its metadata map",
            ));
        }
    };
    Ok(slot)
}

fn apply_header_attributes(ctx: &dyn ConvertContext, slot: &Slot, header: &Attrs) {
    for change in attrs_to_slot_changes(ctx.formats(), header) {
        slot.apply(change, ChangeMeta::remote());
    }
}

/// Decode every chunk of a content text.
pub(crate) fn decode_items<T: ReadTxn>(
    ctx: &dyn ConvertContext,
    txn: &T,
    doc: DocKey,
    content: &TextRef,
) -> Result<Vec<(SlotContent, FormatMap)>> {
    content
        .diff(txn, YChange::identity)
        .into_iter()
        .map(|chunk| {
            let formats = attrs_to_formats(ctx.formats(), chunk.attributes.as_deref());
            Ok((decode_content(ctx, txn, doc, &chunk.insert)?, formats))
        })
        .collect()
}

/// Append decoded chunks to the end of `slot` as remote changes.
pub(crate) fn append_items(slot: &Slot, items: Vec<(SlotContent, FormatMap)>) {
    let mut index = slot.len();
    for (content, formats) in items {
        let width = content.width();
        slot.apply(
            SlotChange::Insert {
                index,
                content,
                formats,
            },
            ChangeMeta::remote(),
        );
        index += width;
    }
}

/// Append the content of a shared text to the end of `slot`.
pub(crate) fn read_content_into<T: ReadTxn>(
    ctx: &dyn ConvertContext,
    txn: &T,
    doc: DocKey,
    content: &TextRef,
    slot: &Slot,
) -> Result<()> {
    let items = decode_items(ctx, txn, doc, content)?;
    append_items(slot, items);
    Ok(())
}

/// Decode one inserted chunk of slot content.
pub(crate) fn decode_content<T: ReadTxn>(
    ctx: &dyn ConvertContext,
    txn: &T,
    doc: DocKey,
    insert: &Out,
) -> Result<SlotContent> {
    match insert {
        Out::Any(Any::String(chunk)) => Ok(SlotContent::Text(chunk.to_string())),
        Out::YMap(shared) => Ok(SlotContent::Component(decode_component(
            ctx, txn, doc, shared,
        )?)),
        other => Err(CollabError::invariant(format!(
            "unrecognized slot content {other:?}"
        ))),
    }
}

/// Decode a component map through the component factory.
pub(crate) fn decode_component<T: ReadTxn>(
    ctx: &dyn ConvertContext,
    txn: &T,
    doc: DocKey,
    shared: &MapRef,
) -> Result<Component> {
    let name = read_string(txn, shared, NAME_KEY)
        .ok_or_else(|| CollabError::invariant("component map has no name"))?;
    if !ctx.components().supports(&name) {
        return Err(CollabError::UnknownComponent(name));
    }
    let kind = read_string(txn, shared, TYPE_KEY)
        .map(|tag| ContentKind::from_tag(&tag))
        .unwrap_or_default();

    let (sub_model_id, state) = match kind {
        ContentKind::Sync => match shared.get(txn, STATE_KEY) {
            Some(Out::YMap(state)) => (None, decode_map(ctx, txn, doc, &state)?),
            _ => {
                return Err(CollabError::invariant(format!(
                    "component '{name}' has no state map"
                )));
            }
        },
        ContentKind::Async => {
            let guid = read_string(txn, shared, GUID_KEY).ok_or_else(|| {
                CollabError::invariant(format!("async component '{name}' has no sub-document id"))
            })?;
            (Some(guid), ProxyMap::new())
        }
    };

    let component = ctx.components().create_component(ComponentSpec {
        name,
        kind,
        sub_model_id,
        state,
    })?;
    if kind == ContentKind::Async {
        ctx.request_sub_model(
            SubModelTarget::Component(component.clone()),
            SubModelRequest::Load,
        );
    }
    Ok(component)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::host::{NamedComponentFactory, StaticFormatRegistry};
    use serde_json::json;
    use std::cell::RefCell;
    use yrs::{Doc, Transact};

    #[derive(Default)]
    struct RecordingContext {
        formats: StaticFormatRegistry,
        components: NamedComponentFactory,
        bound: RefCell<Vec<&'static str>>,
        requests: RefCell<Vec<(String, SubModelRequest)>>,
    }

    impl ConvertContext for RecordingContext {
        fn bind_map(&self, _doc: DocKey, _shared: &MapRef, _local: &ProxyMap) {
            self.bound.borrow_mut().push("map");
        }

        fn bind_array(&self, _doc: DocKey, _shared: &ArrayRef, _local: &ProxyArray) {
            self.bound.borrow_mut().push("array");
        }

        fn bind_slot(&self, _doc: DocKey, _w: &TextRef, _c: Option<&TextRef>, _slot: &Slot) {
            self.bound.borrow_mut().push("slot");
        }

        fn request_sub_model(&self, target: SubModelTarget, request: SubModelRequest) {
            self.requests
                .borrow_mut()
                .push((target.guid().unwrap_or_default().to_string(), request));
        }

        fn formats(&self) -> &dyn FormatRegistry {
            &self.formats
        }

        fn components(&self) -> &dyn ComponentFactory {
            &self.components
        }
    }

    fn create_rich_slot() -> Slot {
        let slot = Slot::new(vec![ContentType::Text, ContentType::InlineComponent]);
        let mut bold = FormatMap::new();
        bold.insert("bold".to_string(), json!(true));
        slot.insert_text(0, "A", bold);
        slot.insert_text(1, "B", FormatMap::new());
        let state = ProxyMap::from_entries([("src", json!("cat.png"))]);
        slot.insert_component(2, Component::new("image", state), FormatMap::new());
        slot.set_attribute("align", json!("left"));
        slot
    }

    #[test]
    fn test_json_any_round_trip_keeps_integers() {
        let value = json!({"n": 3, "f": 1.5, "list": [true, null, "x"]});
        assert_eq!(any_to_json(&json_to_any(&value)), value);
    }

    #[test]
    fn test_patch_to_attrs_nulls_removed_formats() {
        let mut patch = FormatPatch::new();
        patch.insert("bold".to_string(), None);
        patch.insert("italic".to_string(), Some(json!(true)));

        let attrs = patch_to_attrs(&patch);
        assert_eq!(attrs.get("bold"), Some(&Any::Null));
        assert_eq!(attrs.get("italic"), Some(&Any::Bool(true)));
    }

    #[test]
    fn test_unknown_formats_are_dropped() {
        let registry = StaticFormatRegistry::new().with_formatter("bold");
        let mut attrs = Attrs::new();
        attrs.insert(Arc::from("bold"), Any::Bool(true));
        attrs.insert(Arc::from("blink"), Any::Bool(true));

        let formats = attrs_to_formats(&registry, Some(&attrs));
        assert_eq!(formats.len(), 1);
        assert!(formats.contains_key("bold"));
    }

    #[test]
    fn test_slot_round_trip_through_shared_text() {
        let ctx = RecordingContext::default();
        let doc = Doc::new();
        let root = doc.get_or_insert_map("root");
        let slot = create_rich_slot();

        {
            let mut txn = doc.transact_mut();
            write_map_entry(&ctx, &mut txn, DocKey::ROOT, &root, "body", &LocalValue::Slot(slot));
        }

        let txn = doc.transact();
        let Some(Out::YText(wrapper)) = root.get(&txn, "body") else {
            panic!("slot was not written as a text");
        };
        let decoded = decode_slot(&ctx, &txn, DocKey::ROOT, &wrapper).unwrap();

        assert_eq!(decoded.to_plain_text(), "AB");
        assert_eq!(decoded.len(), 3);
        let bold = decoded.format_ranges("bold");
        assert_eq!(bold.len(), 1);
        assert_eq!((bold[0].start, bold[0].end), (0, 1));
        assert_eq!(decoded.attribute("align"), Some(json!("left")));
        let components = decoded.components();
        assert_eq!(components[0].name(), "image");
        assert_eq!(components[0].state().to_json(), json!({"src": "cat.png"}));
    }

    #[test]
    fn test_async_slot_requests_sub_model() {
        let ctx = RecordingContext::default();
        let doc = Doc::new();
        let root = doc.get_or_insert_map("root");
        let slot = Slot::new_async(vec![ContentType::Text]);
        slot.metadata().set("title", "notes");

        {
            let mut txn = doc.transact_mut();
            write_map_entry(
                &ctx,
                &mut txn,
                DocKey::ROOT,
                &root,
                "body",
                &LocalValue::Slot(slot.clone()),
            );
        }
        assert_eq!(
            ctx.requests.borrow()[0],
            (slot.sub_model_id().unwrap().to_string(), SubModelRequest::Create)
        );

        let txn = doc.transact();
        let Some(Out::YText(wrapper)) = root.get(&txn, "body") else {
            panic!("slot was not written as a text");
        };
        let decoded = decode_slot(&ctx, &txn, DocKey::ROOT, &wrapper).unwrap();
        assert_eq!(decoded.kind(), ContentKind::Async);
        assert_eq!(decoded.sub_model_id(), slot.sub_model_id());
        assert_eq!(decoded.metadata().to_json(), json!({"title": "notes"}));
        assert_eq!(ctx.requests.borrow()[1].1, SubModelRequest::Load);
    }

    #[test]
    fn test_malformed_wrapper_is_an_invariant_violation() {
        let ctx = RecordingContext::default();
        let doc = Doc::new();
        let root = doc.get_or_insert_map("root");
        {
            let mut txn = doc.transact_mut();
            let wrapper = root.insert(&mut txn, "body", TextPrelim::new(""));
            wrapper.insert(&mut txn, 0, "plain text, no embed");
        }

        let txn = doc.transact();
        let Some(Out::YText(wrapper)) = root.get(&txn, "body") else {
            panic!("missing wrapper");
        };
        let err = decode_slot(&ctx, &txn, DocKey::ROOT, &wrapper).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_unknown_component_name_fails_decoding() {
        let ctx = RecordingContext {
            components: NamedComponentFactory::new(["paragraph"]),
            ..Default::default()
        };
        let doc = Doc::new();
        let root = doc.get_or_insert_map("root");
        {
            let mut txn = doc.transact_mut();
            let shared = root.insert(&mut txn, "c", MapPrelim::default());
            write_component(
                &ctx,
                &mut txn,
                DocKey::ROOT,
                &shared,
                &Component::new("video", ProxyMap::new()),
            );
        }

        let txn = doc.transact();
        let Some(Out::YMap(shared)) = root.get(&txn, "c") else {
            panic!("missing component map");
        };
        assert!(matches!(
            decode_component(&ctx, &txn, DocKey::ROOT, &shared),
            Err(CollabError::UnknownComponent(name)) if name == "video"
        ));
    }
}
