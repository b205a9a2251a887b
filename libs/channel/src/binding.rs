use std::collections::HashMap;

use tether_core::{ActorId, IdAllocator, Tag};

use crate::payload::Payload;
use crate::runtime::ActorHandle;

/// One interface a binding accepts, optionally with a tag override
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundType<I> {
    pub interface: I,
    pub tag: Option<Tag>,
}

impl<I> BoundType<I> {
    pub fn new(interface: I) -> Self {
        Self {
            interface,
            tag: None,
        }
    }

    /// Accept `interface` and stamp `tag` into every dispatched request
    pub fn tagged(interface: I, tag: Tag) -> Self {
        Self {
            interface,
            tag: Some(tag),
        }
    }

    pub fn is_tag_overridable(&self) -> bool {
        self.tag.is_some()
    }
}

impl<I> From<I> for BoundType<I> {
    fn from(interface: I) -> Self {
        Self::new(interface)
    }
}

/// A bound actor and the interfaces it may receive
pub struct BindingEntry<P: Payload> {
    actor_id: ActorId,
    handle: ActorHandle<P>,
    bound_types: HashMap<P::Interface, BoundType<P::Interface>>,
}

impl<P: Payload> BindingEntry<P> {
    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub fn handle(&self) -> &ActorHandle<P> {
        &self.handle
    }

    /// Capability matching a request's interface
    pub fn find_capability(&self, interface: P::Interface) -> Option<&BoundType<P::Interface>> {
        self.bound_types.get(&interface)
    }

    pub fn bound_types(&self) -> impl Iterator<Item = &BoundType<P::Interface>> {
        self.bound_types.values()
    }
}

/// Per-channel map from actor id to bound actor
///
/// Ids are handed out from 1 upward and never reused while the table lives.
/// One actor may be bound under several ids.
pub struct BindingTable<P: Payload> {
    entries: HashMap<ActorId, BindingEntry<P>>,
    ids: IdAllocator,
}

impl<P: Payload> Default for BindingTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Payload> BindingTable<P> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ids: IdAllocator::new("actor"),
        }
    }

    pub fn bind<T>(&mut self, handle: ActorHandle<P>, types: T) -> tether_core::Result<ActorId>
    where
        T: IntoIterator,
        T::Item: Into<BoundType<P::Interface>>,
    {
        let actor_id = self.ids.next_id()?;
        // the dispatch table is keyed by interface; a later duplicate wins
        let bound_types = types
            .into_iter()
            .map(Into::into)
            .map(|bound: BoundType<P::Interface>| (bound.interface, bound))
            .collect();
        self.entries.insert(
            actor_id,
            BindingEntry {
                actor_id,
                handle,
                bound_types,
            },
        );
        Ok(actor_id)
    }

    pub fn lookup(&self, actor_id: ActorId) -> Option<&BindingEntry<P>> {
        self.entries.get(&actor_id)
    }

    pub fn unbind(&mut self, actor_id: ActorId) -> Option<BindingEntry<P>> {
        self.entries.remove(&actor_id)
    }

    /// Lowest id under which `handle` is bound
    pub fn actor_id_of(&self, handle: &ActorHandle<P>) -> Option<ActorId> {
        self.entries
            .values()
            .filter(|entry| entry.handle.same_actor(handle))
            .map(|entry| entry.actor_id)
            .min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every binding, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
