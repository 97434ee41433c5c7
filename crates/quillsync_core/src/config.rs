//! Configuration types for quillsync.
//!
//! This module provides the [`CollabConfig`] struct which stores the tunables
//! of the sync engine and the history managers. Configuration is plain serde
//! data and can be persisted as TOML:
//!
//! ```toml
//! [history]
//! stack_size = 100
//! debounce_ms = 500
//!
//! [sync]
//! root_name = "root"
//! ```
//!
//! Predicates that cannot be serialized (custom transaction capture and
//! delete filters) live in [`UndoPolicy`](crate::collab::UndoPolicy) and are
//! passed alongside the config.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default maximum number of undo entries kept by a history manager.
pub const DEFAULT_STACK_SIZE: usize = 500;

/// Default debounce window (milliseconds) for multi-document history grouping.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollabConfig {
    /// Undo/redo settings
    #[serde(default)]
    pub history: HistoryConfig,

    /// Shared document layout settings
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Undo/redo settings shared by both history managers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum number of entries; the oldest entry is evicted first.
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,

    /// Window within which edits across documents are grouped into one step.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

/// Names of the root-level shared types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root map holding the root component
    #[serde(default = "default_root_name")]
    pub root_name: String,

    /// Root text of a slot sub-document
    #[serde(default = "default_content_text_name")]
    pub content_text_name: String,

    /// Root map of a component sub-document
    #[serde(default = "default_state_map_name")]
    pub state_map_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root_name: default_root_name(),
            content_text_name: default_content_text_name(),
            state_map_name: default_state_map_name(),
        }
    }
}

fn default_root_name() -> String {
    "root".to_string()
}

fn default_content_text_name() -> String {
    "content".to_string()
}

fn default_state_map_name() -> String {
    "state".to_string()
}

impl CollabConfig {
    /// Parse a config from TOML. Missing sections fall back to defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Serialize the config to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Builder-style override of the history stack size.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.history.stack_size = stack_size;
        self
    }

    /// Builder-style override of the debounce window.
    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.history.debounce_ms = debounce_ms;
        self
    }
}
