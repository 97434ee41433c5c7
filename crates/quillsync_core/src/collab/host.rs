//! Collaborators supplied by the host editor.
//!
//! The engine never renders, never owns the selection and never decides what
//! a component name means. It reaches the host through these traits:
//!
//! - [`Scheduler`]: commit hook wrapped around every replay of shared changes
//! - [`FormatRegistry`]: maps wire-level format/attribute keys to local ones
//! - [`ComponentFactory`]: builds components from their shared description
//! - [`SelectionBridge`]: reads and writes the editor selection
//!
//! Each trait has a default implementation good enough for headless use
//! and tests.

use std::cell::RefCell;
use std::collections::HashSet;

use crate::error::{CollabError, Result};
use crate::model::{Component, ContentKind, ProxyMap, Slot};

// ==================== Scheduler ====================

/// Commit hook around local-tree mutations driven by the shared document.
pub trait Scheduler {
    /// Run `apply`, which replays a remote update onto the local tree.
    fn apply_as_remote_update(&self, apply: &mut dyn FnMut());

    /// Run `apply`, which replays an undo/redo step onto the local tree.
    fn apply_as_history_navigation(&self, apply: &mut dyn FnMut());
}

/// Runs every replay immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn apply_as_remote_update(&self, apply: &mut dyn FnMut()) {
        apply();
    }

    fn apply_as_history_navigation(&self, apply: &mut dyn FnMut()) {
        apply();
    }
}

// ==================== Formats ====================

/// Resolves wire-level keys to local format and attribute names.
///
/// Returning `None` drops the key during remote → local translation.
pub trait FormatRegistry {
    fn lookup_formatter(&self, key: &str) -> Option<String>;
    fn lookup_attribute(&self, key: &str) -> Option<String>;
}

/// A fixed set of known formats and attributes.
#[derive(Debug, Clone, Default)]
pub struct StaticFormatRegistry {
    formatters: Option<HashSet<String>>,
    attributes: Option<HashSet<String>>,
}

impl StaticFormatRegistry {
    /// Knows nothing until formats are added.
    pub fn new() -> Self {
        Self {
            formatters: Some(HashSet::new()),
            attributes: Some(HashSet::new()),
        }
    }

    /// Accepts every key unchanged.
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn with_formatter(mut self, name: impl Into<String>) -> Self {
        self.formatters
            .get_or_insert_with(HashSet::new)
            .insert(name.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes
            .get_or_insert_with(HashSet::new)
            .insert(name.into());
        self
    }

    fn lookup(known: &Option<HashSet<String>>, key: &str) -> Option<String> {
        match known {
            None => Some(key.to_string()),
            Some(set) if set.contains(key) => Some(key.to_string()),
            Some(_) => None,
        }
    }
}

impl FormatRegistry for StaticFormatRegistry {
    fn lookup_formatter(&self, key: &str) -> Option<String> {
        Self::lookup(&self.formatters, key)
    }

    fn lookup_attribute(&self, key: &str) -> Option<String> {
        Self::lookup(&self.attributes, key)
    }
}

// ==================== Components ====================

/// Shared description of a component, decoded before it is materialized.
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    pub name: String,
    pub kind: ContentKind,
    pub sub_model_id: Option<String>,
    /// Already-decoded state; the built component must adopt it.
    pub state: ProxyMap,
}

/// Builds local components by name.
pub trait ComponentFactory {
    /// Whether `name` can be materialized.
    fn supports(&self, name: &str) -> bool;

    fn create_component(&self, spec: ComponentSpec) -> Result<Component>;
}

/// Factory over a set of registered names (or any name, when permissive).
#[derive(Debug, Clone, Default)]
pub struct NamedComponentFactory {
    names: Option<HashSet<String>>,
}

impl NamedComponentFactory {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: Some(names.into_iter().map(Into::into).collect()),
        }
    }

    pub fn permissive() -> Self {
        Self::default()
    }
}

impl ComponentFactory for NamedComponentFactory {
    fn supports(&self, name: &str) -> bool {
        self.names.as_ref().is_none_or(|names| names.contains(name))
    }

    fn create_component(&self, spec: ComponentSpec) -> Result<Component> {
        if !self.supports(&spec.name) {
            return Err(CollabError::UnknownComponent(spec.name));
        }
        Ok(Component::from_parts(
            spec.name,
            spec.kind,
            spec.sub_model_id,
            spec.state,
        ))
    }
}

// ==================== Selection ====================

/// Editor selection as slot + offset endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionSnapshot {
    pub anchor_slot: Slot,
    pub anchor_offset: u32,
    pub focus_slot: Slot,
    pub focus_offset: u32,
}

impl SelectionSnapshot {
    /// A collapsed selection.
    pub fn caret(slot: &Slot, offset: u32) -> Self {
        Self {
            anchor_slot: slot.clone(),
            anchor_offset: offset,
            focus_slot: slot.clone(),
            focus_offset: offset,
        }
    }
}

pub trait SelectionBridge {
    fn selection(&self) -> Option<SelectionSnapshot>;
    fn set_selection(&self, selection: Option<SelectionSnapshot>);
}

/// Selection held in memory.
#[derive(Debug, Default)]
pub struct LocalSelection {
    current: RefCell<Option<SelectionSnapshot>>,
}

impl LocalSelection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionBridge for LocalSelection {
    fn selection(&self) -> Option<SelectionSnapshot> {
        self.current.borrow().clone()
    }

    fn set_selection(&self, selection: Option<SelectionSnapshot>) {
        *self.current.borrow_mut() = selection;
    }
}
