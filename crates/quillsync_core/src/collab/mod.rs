//! Bidirectional synchronization between the local tree and `yrs` documents.
//!
//! ## Architecture
//!
//! ```text
//! local tree (model)                           shared documents (yrs)
//! ┌───────────────────┐  on_change   ┌───────────────┐  flush()  ┌──────────┐
//! │ Component / Slot  │ ───────────► │  SyncEngine   │ ────────► │ root doc │
//! │ ProxyMap / Array  │ ◄─────────── │ queue + guard │ ◄──────── │ sub-docs │
//! └───────────────────┘  Remote meta └───────────────┘  observe  └──────────┘
//!                                           │
//!                          HistoryManager / MultiDocHistoryManager
//! ```
//!
//! - [`SyncEngine`] binds local nodes to shared nodes, buffers local changes
//!   per document and writes them on [`SyncEngine::flush`], and replays
//!   shared changes onto the local tree.
//! - [`HistoryManager`] is linear undo/redo over the root document with
//!   cursor restoration.
//! - [`MultiDocHistoryManager`] groups edits across the root and every
//!   sub-document within a debounce window into one step.
//! - [`SubModelLoader`] creates and opens the sub-documents behind async
//!   slots and components.

pub mod convert;
pub mod engine;
pub mod history;
pub mod host;
pub mod loader;
pub mod multi_history;
mod rebase;
pub mod registry;
pub mod undo;

use yrs::{Doc, OffsetKind, Options};

pub use engine::{
    CursorEndpoint, CursorPosition, Direction, DocScope, EngineOptions, EngineStats,
    FlushSummary, PendingAction, QueueState, SharedOp, SubModelAdded, SyncEngine,
    TransactionInfo, UndoPolicy,
};
pub use history::{History, HistoryEntry, HistoryListeners, HistoryManager};
pub use host::{
    ComponentFactory, ComponentSpec, FormatRegistry, ImmediateScheduler, LocalSelection,
    NamedComponentFactory, Scheduler, SelectionBridge, SelectionSnapshot, StaticFormatRegistry,
};
pub use loader::{
    LocalBoxFuture, MemorySubModelLoader, NonSubModelLoader, SubModelLoader, SubModelRequest,
    SubModelTarget, WeakSubModelTarget, encode_doc,
};
pub use multi_history::{Clock, GroupState, ManualClock, MultiDocHistoryManager, SystemClock};
pub use registry::{DocKey, SharedKey, SharedText, SlotRegistry};
pub use undo::{DocUndo, NavigationOrigins};

/// Create a document whose text offsets are UTF-16 code units, the unit
/// slot offsets use.
pub fn new_shared_doc() -> Doc {
    Doc::with_options(Options {
        offset_kind: OffsetKind::Utf16,
        ..Options::default()
    })
}
