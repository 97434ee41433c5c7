//! Bidirectional sync between a local rich-text document tree and a `yrs`
//! shared document, with collaborative undo/redo.
//!
//! The local tree ([`model`]) is made of components, slots of rich text, and
//! observable maps and arrays. [`collab::SyncEngine`] mirrors it into a
//! shared document so several peers can edit concurrently, and replays what
//! peers write back onto the tree. [`collab::HistoryManager`] and
//! [`collab::MultiDocHistoryManager`] provide undo/redo that restores the
//! cursor and only reverts this peer's own edits.
//!
//! ```ignore
//! use quillsync_core::collab::{History, HistoryManager, SyncEngine, new_shared_doc};
//! use quillsync_core::config::CollabConfig;
//! use quillsync_core::model::{Component, ProxyMap};
//!
//! let config = CollabConfig::default();
//! let engine = SyncEngine::new(new_shared_doc());
//! let root = Component::new("page", ProxyMap::new());
//! engine.bootstrap_root(&root)?;
//! let history = HistoryManager::new(&engine, &config.history)?;
//!
//! root.state().set("title", "Hello");
//! engine.flush()?;
//! history.back()?;
//! ```

/// Configuration options
pub mod config;

/// Error (common error types)
pub mod error;

/// Local document tree
pub mod model;

/// Shared-document sync and history
pub mod collab;

pub use collab::{
    History, HistoryManager, MultiDocHistoryManager, SubModelLoader, SyncEngine, new_shared_doc,
};
pub use config::CollabConfig;
pub use error::{CollabError, Result};
