//! Reclaimable references to entries.

pub(crate) mod queue;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sdd::Shared;

use super::entry::Entry;
use queue::{ReclamationQueue, Reclaimed};

/// [`ReferenceKind`] decides how eagerly [`ReferenceMap::reclaim`](super::ReferenceMap::reclaim)
/// discards entries.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReferenceKind {
    /// Entries are discarded only under [`MemoryPressure::Critical`].
    #[default]
    Soft,

    /// Entries are discarded on every reclamation pass.
    Weak,
}

/// [`MemoryPressure`] is the level at which a reclamation pass runs.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MemoryPressure {
    /// Regular reclamation: only [`ReferenceKind::Weak`] entries are discarded.
    Normal,

    /// Memory is running out: every entry is discarded.
    Critical,
}

impl ReferenceKind {
    /// Returns `true` if entries of this kind are discarded under `pressure`.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::{MemoryPressure, ReferenceKind};
    ///
    /// assert!(ReferenceKind::Weak.is_reclaimable(MemoryPressure::Normal));
    /// assert!(!ReferenceKind::Soft.is_reclaimable(MemoryPressure::Normal));
    /// assert!(ReferenceKind::Soft.is_reclaimable(MemoryPressure::Critical));
    /// ```
    #[inline]
    #[must_use]
    pub const fn is_reclaimable(self, pressure: MemoryPressure) -> bool {
        matches!(
            (self, pressure),
            (Self::Weak, _) | (Self::Soft, MemoryPressure::Critical)
        )
    }
}

/// [`Reference`] is a link of a bucket chain that refers to an [`Entry`] without owning it.
///
/// The anchor keeps the entry alive on behalf of the map until the entry is released or
/// reclaimed; once the anchor is gone, the entry survives only as long as some
/// [`EntryRef`](super::EntryRef) refers to it.
pub(crate) struct Reference<K, V> {
    hash: u64,
    next: Option<Shared<Reference<K, V>>>,
    entry: Weak<Entry<K, V>>,
    anchor: Mutex<Option<Arc<Entry<K, V>>>>,
}

impl<K, V> Reference<K, V> {
    /// Returns the entry if it is neither reclaimed nor released.
    #[inline]
    pub(crate) fn get(&self) -> Option<Arc<Entry<K, V>>> {
        self.entry.upgrade().filter(|entry| !entry.is_enqueued())
    }

    /// Returns the hash value of the key.
    #[inline]
    pub(crate) const fn hash(&self) -> u64 {
        self.hash
    }

    /// Returns the next link in the chain.
    #[inline]
    pub(crate) fn next(&self) -> Option<&Reference<K, V>> {
        self.next.as_deref()
    }

    /// Returns a strong reference to the next link in the chain.
    #[inline]
    pub(crate) fn next_shared(&self) -> Option<Shared<Reference<K, V>>> {
        self.next.clone()
    }

    /// Marks the entry reclaimed, notifies the queue, and drops the anchor.
    pub(crate) fn release(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.enqueue();
        }
        drop(self.anchor.lock().take());
    }

    /// Drops the anchor unless the entry is strongly referenced elsewhere.
    ///
    /// Returns `true` if the anchor was dropped.
    #[inline]
    pub(crate) fn reclaim(&self) -> bool {
        let mut anchor = self.anchor.lock();
        if !anchor
            .as_ref()
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            return false;
        }
        let entry = anchor.take();
        drop(anchor);
        drop(entry);
        true
    }

    /// Anchors the entry again if it is still alive.
    ///
    /// An [`EntryRef`](super::EntryRef) may obtain the entry just before its anchor is dropped;
    /// a write through the map takes the entry back so the written value is not lost along
    /// with the handle.
    #[inline]
    pub(crate) fn retain(&self) {
        let mut anchor = self.anchor.lock();
        if anchor.is_none() {
            *anchor = self.get();
        }
    }
}

/// [`ReferenceManager`] creates [`Reference`] instances bound to a segment's
/// [`ReclamationQueue`].
pub(crate) struct ReferenceManager {
    queue: Arc<ReclamationQueue>,
}

impl ReferenceManager {
    /// Creates a new [`ReferenceManager`] with an empty queue.
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            queue: Arc::new(ReclamationQueue::default()),
        }
    }

    /// Creates a new [`Entry`] that reports to the queue of this manager.
    #[inline]
    pub(crate) fn create_entry<K: 'static, V: 'static>(
        &self,
        key: K,
        value: V,
        generation: u64,
    ) -> Arc<Entry<K, V>> {
        Arc::new(Entry::new(key, value, generation, Arc::downgrade(&self.queue)))
    }

    /// Creates an anchored [`Reference`] to `entry` in front of `next`.
    #[inline]
    pub(crate) fn create_reference<K, V>(
        &self,
        entry: Arc<Entry<K, V>>,
        hash: u64,
        next: Option<Shared<Reference<K, V>>>,
    ) -> Reference<K, V> {
        Reference {
            hash,
            next,
            entry: Arc::downgrade(&entry),
            anchor: Mutex::new(Some(entry)),
        }
    }

    /// Moves `reference` to `entry` in front of `next`, taking over its anchor.
    #[inline]
    pub(crate) fn relink<K, V>(
        &self,
        reference: &Reference<K, V>,
        entry: &Arc<Entry<K, V>>,
        next: Option<Shared<Reference<K, V>>>,
    ) -> Reference<K, V> {
        let anchor = reference.anchor.lock().take();
        Reference {
            hash: reference.hash,
            next,
            entry: Arc::downgrade(entry),
            anchor: Mutex::new(anchor),
        }
    }

    /// Polls a single pending notification.
    #[inline]
    pub(crate) fn poll_for_purge(&self) -> Option<Reclaimed> {
        self.queue.poll()
    }

    /// Returns `true` if a notification is pending.
    #[inline]
    pub(crate) fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn release_notifies_once() {
        let manager = ReferenceManager::new();
        let entry = manager.create_entry("key", 1, 7);
        let entry_id = entry.id();
        let reference = manager.create_reference(entry.clone(), 0, None);
        assert!(reference.get().is_some());

        reference.release();
        assert!(reference.get().is_none());
        assert_eq!(
            manager.poll_for_purge(),
            Some(Reclaimed {
                entry_id,
                generation: 7
            })
        );

        drop(entry);
        assert!(manager.poll_for_purge().is_none());
    }

    #[test]
    fn reclaim_drops_anchor() {
        let manager = ReferenceManager::new();
        let held = manager.create_entry(1, 1, 0);
        let held_reference = manager.create_reference(held.clone(), 1, None);
        let dropped_reference =
            manager.create_reference(manager.create_entry(2, 2, 0), 2, None);
        assert!(!manager.has_pending());

        assert!(!held_reference.reclaim());
        assert!(dropped_reference.reclaim());
        assert!(!dropped_reference.reclaim());

        assert!(held_reference.get().is_some());
        assert!(dropped_reference.get().is_none());
        assert!(manager.has_pending());
        assert!(manager.poll_for_purge().is_some());
        assert!(!manager.has_pending());

        drop(held);
        assert!(held_reference.get().is_some());
        assert!(held_reference.reclaim());
        assert!(held_reference.get().is_none());
        assert!(manager.poll_for_purge().is_some());
    }

    #[test]
    fn retain_restores_anchor() {
        let manager = ReferenceManager::new();
        let reference = manager.create_reference(manager.create_entry(1, 1, 0), 4, None);
        let Some(entry) = reference.get() else {
            unreachable!();
        };
        let relinked = manager.relink(&reference, &entry, None);
        reference.retain();
        drop(entry);
        drop(relinked);
        assert!(reference.get().is_some());

        assert!(reference.reclaim());
        assert!(reference.get().is_none());
        reference.retain();
        assert!(!reference.reclaim());
    }

    #[test]
    fn relink_moves_anchor() {
        let manager = ReferenceManager::new();
        let reference = manager.create_reference(manager.create_entry(1, 1, 0), 3, None);
        let Some(entry) = reference.get() else {
            unreachable!();
        };
        let relinked = manager.relink(&reference, &entry, None);
        drop(entry);
        assert_eq!(relinked.hash(), 3);
        assert!(!reference.reclaim());
        assert!(relinked.get().is_some());
        drop(reference);
        assert!(relinked.get().is_some());
        assert!(relinked.reclaim());
        assert!(relinked.get().is_none());
    }
}
