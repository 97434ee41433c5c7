//! Named components: a state map plus an identity.

use std::rc::{Rc, Weak};

use super::lifecycle::{Lifecycle, NodeId};
use super::proxy::ProxyMap;
use super::slot::ContentKind;

struct ComponentInner {
    id: NodeId,
    name: String,
    kind: ContentKind,
    sub_model_id: Option<String>,
    state: ProxyMap,
    lifecycle: Lifecycle,
}

/// A named unit of content embedded in a slot (or the root of the tree).
///
/// A synchronous component keeps its state inside the main shared document.
/// An asynchronous one keeps it in a sub-document identified by
/// [`Component::sub_model_id`], loaded on demand.
#[derive(Clone)]
pub struct Component(Rc<ComponentInner>);

/// Non-owning handle to a [`Component`].
#[derive(Clone)]
pub struct WeakComponent(Weak<ComponentInner>);

impl WeakComponent {
    pub fn upgrade(&self) -> Option<Component> {
        self.0.upgrade().map(Component)
    }
}

impl Component {
    pub fn new(name: impl Into<String>, state: ProxyMap) -> Self {
        Self::from_parts(name.into(), ContentKind::Sync, None, state)
    }

    /// Create an asynchronous component with a fresh sub-document identity.
    pub fn new_async(name: impl Into<String>, state: ProxyMap) -> Self {
        Self::from_parts(
            name.into(),
            ContentKind::Async,
            Some(uuid::Uuid::new_v4().to_string()),
            state,
        )
    }

    pub(crate) fn from_parts(
        name: String,
        kind: ContentKind,
        sub_model_id: Option<String>,
        state: ProxyMap,
    ) -> Self {
        Self(Rc::new(ComponentInner {
            id: NodeId::next(),
            name,
            kind,
            sub_model_id,
            state,
            lifecycle: Lifecycle::new(),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> ContentKind {
        self.0.kind
    }

    pub fn sub_model_id(&self) -> Option<&str> {
        self.0.sub_model_id.as_deref()
    }

    pub fn state(&self) -> &ProxyMap {
        &self.0.state
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.0.lifecycle
    }

    pub fn ptr_eq(&self, other: &Component) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakComponent {
        WeakComponent(Rc::downgrade(&self.0))
    }

    pub(crate) fn destroy(&self) {
        if self.0.lifecycle.destroy() {
            self.0.state.destroy();
        }
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("kind", &self.0.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Slot;
    use crate::model::slot::ContentType;

    #[test]
    fn test_destroy_cascades_to_state() {
        let slot = Slot::new(vec![ContentType::Text]);
        let state = ProxyMap::new();
        state.set("caption", slot.clone());
        let component = Component::new("figure", state.clone());

        component.destroy();

        assert!(component.lifecycle().is_destroyed());
        assert!(state.lifecycle().is_destroyed());
        assert!(slot.lifecycle().is_destroyed());
    }

    #[test]
    fn test_async_component_identity() {
        let a = Component::new_async("table", ProxyMap::new());
        let b = Component::new_async("table", ProxyMap::new());
        assert_eq!(a.kind(), ContentKind::Async);
        assert_ne!(a.sub_model_id(), b.sub_model_id());
    }
}
