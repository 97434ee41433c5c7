//! The local document tree.
//!
//! Everything an editor renders from: a root [`Component`] whose state is a
//! [`ProxyMap`], holding primitives, nested maps and arrays, and rich-text
//! [`Slot`]s that can embed further components.
//!
//! ## Ownership
//!
//! Nodes are `Rc` handles. Detaching a node from its parent latches its
//! [`Lifecycle`] destroyed and drops its listeners; handles kept elsewhere
//! stay valid but inert.
//!
//! ## Change actions
//!
//! Every mutation emits a [`ChangeEvent`] carrying a [`ChangeMeta`], which
//! is how the sync engine tells user edits from replayed remote ones.

mod change;
mod component;
mod events;
mod lifecycle;
mod proxy;
pub mod slot;
mod value;

pub use change::{
    ArrayChange, ArrayEvent, ChangeEvent, ChangeMeta, ChangeOrigin, FormatMap, FormatPatch,
    MapChange, MapEvent, SlotChange, SlotContent, SlotEvent,
};
pub use component::{Component, WeakComponent};
pub use events::{Listeners, Subscription};
pub use lifecycle::{Lifecycle, NodeId};
pub use proxy::{ProxyArray, ProxyMap, WeakProxyArray, WeakProxyMap};
pub use slot::{ContentKind, ContentType, FormatRange, ItemContent, Slot, SlotItem, WeakSlot};
pub use value::LocalValue;
