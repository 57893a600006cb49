/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Lazy collection proxy for plural associations.
//!
//! A [`CollectionProxy`] is returned for every `has_many` field read. It
//! defers materializing the join range into record handles until first
//! access, caches that materialization behind [`Weak`] references so a
//! caller dropping every strong handle lets it be recomputed cheaply rather
//! than pinning memory forever, and tracks whether it has been appended to
//! since the last flush so [`crate::controller::Database::close`] knows
//! which proxies still need their ranges written back.

use std::rc::{Rc, Weak};
use std::sync::RwLock;

use crate::constants::{ClassTag, RodId};
use crate::join::JoinRange;

/// One element of a plural association: a record id, with a class tag
/// when the association is polymorphic. A `None` id represents an
/// explicit null slot (distinct from the collection simply being shorter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionElement {
    pub rod_id: Option<RodId>,
    pub class_tag: Option<ClassTag>,
}

/// A plural association's in-memory view: the persisted range it was
/// loaded from (if any), pending appended elements, and a weak
/// materialization cache.
pub struct CollectionProxy {
    persisted_range: Option<JoinRange>,
    pending: Vec<CollectionElement>,
    cache: RwLock<Weak<[CollectionElement]>>,
    dirty: bool,
}

impl Clone for CollectionProxy {
    /// The cache is snapshotted as whatever `Weak` it currently holds, not
    /// force-upgraded, so cloning never extends a materialization's
    /// lifetime.
    fn clone(&self) -> Self {
        Self {
            persisted_range: self.persisted_range,
            pending: self.pending.clone(),
            cache: RwLock::new(self.cache.read().unwrap().clone()),
            dirty: self.dirty,
        }
    }
}

impl CollectionProxy {
    /// A proxy over a freshly created (not yet persisted) association.
    pub fn empty() -> Self {
        Self {
            persisted_range: None,
            pending: Vec::new(),
            cache: RwLock::new(Weak::new()),
            dirty: false,
        }
    }

    /// A proxy over an association range read back from storage.
    pub fn from_persisted(range: JoinRange) -> Self {
        Self {
            persisted_range: Some(range),
            pending: Vec::new(),
            cache: RwLock::new(Weak::new()),
            dirty: false,
        }
    }

    pub fn persisted_range(&self) -> Option<JoinRange> {
        self.persisted_range
    }

    /// Append an element to the end of this collection. Invalidates the
    /// materialization cache and marks the proxy dirty so a subsequent
    /// close/flush knows to append a fresh join-area run.
    pub fn push(&mut self, element: CollectionElement) {
        self.pending.push(element);
        self.dirty = true;
        *self.cache.write().unwrap() = Weak::new();
    }

    /// Whether this proxy has pending elements not yet reflected in the
    /// owning record's `(count, offset)` slot.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag after the owner has appended `pending` to the
    /// join area and updated the record's inline range.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Elements appended since the last flush, draining the pending buffer.
    pub fn take_pending(&mut self) -> Vec<CollectionElement> {
        std::mem::take(&mut self.pending)
    }

    /// Materialize the full element list, combining whatever was loaded
    /// from storage (supplied by the caller via `loader`, since only the
    /// owning record store/join area know how to resolve the persisted
    /// range) with elements appended in this session. Returns a cheap
    /// `Rc` clone if a materialization is already cached and has not been
    /// invalidated by a subsequent `push`.
    pub fn materialize(&self, loader: impl FnOnce(JoinRange) -> Vec<CollectionElement>) -> Rc<[CollectionElement]> {
        if let Some(strong) = self.cache.read().unwrap().upgrade() {
            return strong;
        }
        let mut elements = match self.persisted_range {
            Some(range) => loader(range),
            None => Vec::new(),
        };
        elements.extend(self.pending.iter().copied());
        let materialized: Rc<[CollectionElement]> = Rc::from(elements);
        *self.cache.write().unwrap() = Rc::downgrade(&materialized);
        materialized
    }

    /// Number of elements without forcing materialization: persisted count
    /// (if known) plus pending appends.
    pub fn len_hint(&self, persisted_len: u32) -> u32 {
        persisted_len + self.pending.len() as u32
    }

    /// Element at position `i`, counting the persisted range first and the
    /// append buffer after it. `loader` is only invoked (via
    /// [`Self::materialize`]) when no cached materialization is live.
    pub fn get(&self, i: usize, loader: impl FnOnce(JoinRange) -> Vec<CollectionElement>) -> Option<CollectionElement> {
        self.materialize(loader).get(i).copied()
    }

    /// Every element's `rod_id`, in order, including pending appends. A
    /// `None` entry is an explicit null slot, not a gap.
    pub fn each_id(&self, loader: impl FnOnce(JoinRange) -> Vec<CollectionElement>) -> Vec<Option<RodId>> {
        self.materialize(loader).iter().map(|e| e.rod_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elem(id: u32) -> CollectionElement {
        CollectionElement {
            rod_id: Some(id),
            class_tag: None,
        }
    }

    #[test]
    fn push_marks_dirty_and_invalidates_cache() {
        let mut proxy = CollectionProxy::empty();
        assert!(!proxy.is_dirty());
        let _ = proxy.materialize(|_| vec![]);
        proxy.push(elem(1));
        assert!(proxy.is_dirty());
        let materialized = proxy.materialize(|_| vec![]);
        assert_eq!(materialized.len(), 1);
    }

    #[test]
    fn materialize_combines_persisted_and_pending() {
        let range = JoinRange { offset: 0, len: 2 };
        let mut proxy = CollectionProxy::from_persisted(range);
        proxy.push(elem(99));
        let loader = |r: JoinRange| (0..r.len).map(|i| elem(i + 1)).collect();
        let materialized = proxy.materialize(loader);
        assert_eq!(materialized.len(), 3);
        assert_eq!(materialized[2].rod_id, Some(99));
    }

    #[test]
    fn take_pending_drains_and_clears() {
        let mut proxy = CollectionProxy::empty();
        proxy.push(elem(1));
        proxy.push(elem(2));
        let drained = proxy.take_pending();
        assert_eq!(drained.len(), 2);
        assert!(proxy.take_pending().is_empty());
    }

    #[test]
    fn get_resolves_persisted_then_pending_by_index() {
        let range = JoinRange { offset: 0, len: 2 };
        let mut proxy = CollectionProxy::from_persisted(range);
        proxy.push(elem(99));
        let loader = |r: JoinRange| (0..r.len).map(|i| elem(i + 1)).collect();
        assert_eq!(proxy.get(0, loader).unwrap().rod_id, Some(1));
        assert_eq!(proxy.get(2, loader).unwrap().rod_id, Some(99));
        assert!(proxy.get(3, loader).is_none());
    }

    #[test]
    fn each_id_includes_appended_elements_in_order() {
        let mut proxy = CollectionProxy::empty();
        proxy.push(elem(1));
        proxy.push(elem(2));
        let ids = proxy.each_id(|_| vec![]);
        assert_eq!(ids, vec![Some(1), Some(2)]);
    }

    #[test]
    fn clone_snapshots_pending_without_upgrading_cache() {
        let mut proxy = CollectionProxy::empty();
        proxy.push(elem(1));
        let cloned = proxy.clone();
        assert_eq!(cloned.each_id(|_| vec![]), vec![Some(1)]);
        assert!(cloned.is_dirty());
    }

    #[test]
    fn cache_drops_when_no_strong_refs_remain() {
        let proxy = CollectionProxy::empty();
        {
            let materialized = proxy.materialize(|_| vec![]);
            assert_eq!(Rc::strong_count(&materialized), 1);
        }
        assert!(proxy.cache.read().unwrap().upgrade().is_none());
    }
}
