//! [`Entry`] is the key-value pair stored in a [`ReferenceMap`](super::ReferenceMap).

use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Weak};

use sdd::{AtomicShared, Guard, Shared, Tag};

use super::reference::queue::{ReclamationQueue, Reclaimed};

/// Source of unique entry identifiers.
static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(0);

/// [`Entry`] owns an immutable key and an atomically replaceable value.
///
/// When the last strong reference to an [`Entry`] is dropped, or when it is released by an
/// explicit removal, it notifies the [`ReclamationQueue`] of the segment that created it. It
/// notifies at most once.
pub(crate) struct Entry<K, V> {
    key: K,
    value: AtomicShared<V>,
    id: u64,
    generation: u64,
    enqueued: AtomicBool,
    queue: Weak<ReclamationQueue>,
}

/// [`EntryRef`] is a strong handle to an entry of a [`ReferenceMap`](super::ReferenceMap).
///
/// While an [`EntryRef`] is alive, the entry cannot be reclaimed by
/// [`ReferenceMap::reclaim`](super::ReferenceMap::reclaim); it may still be removed from the map
/// explicitly.
pub struct EntryRef<K, V> {
    entry: Arc<Entry<K, V>>,
}

impl<K: 'static, V: 'static> Entry<K, V> {
    /// Creates a new [`Entry`] reporting to `queue`.
    pub(crate) fn new(key: K, value: V, generation: u64, queue: Weak<ReclamationQueue>) -> Self {
        Self {
            key,
            value: AtomicShared::new(value),
            id: NEXT_ENTRY_ID.fetch_add(1, AcqRel),
            generation,
            enqueued: AtomicBool::new(false),
            queue,
        }
    }

    /// Replaces the value, returning the previous one.
    #[inline]
    pub(crate) fn set_value(&self, value: V) -> Option<Shared<V>> {
        self.value.swap((Some(Shared::new(value)), Tag::None), AcqRel).0
    }
}

impl<K, V> Entry<K, V> {
    /// Returns a reference to the key.
    #[inline]
    pub(crate) const fn key(&self) -> &K {
        &self.key
    }

    /// Returns a reference to the value that lives as long as `guard`.
    #[inline]
    pub(crate) fn value<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        self.value.load(Acquire, guard).as_ref()
    }

    /// Returns a strong reference to the value.
    #[inline]
    pub(crate) fn value_shared(&self, guard: &Guard) -> Option<Shared<V>> {
        self.value.get_shared(Acquire, guard)
    }

    /// Returns the unique identifier of the entry.
    #[inline]
    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` if the entry has been released or reclaimed.
    #[inline]
    pub(crate) fn is_enqueued(&self) -> bool {
        self.enqueued.load(Acquire)
    }

    /// Marks the entry reclaimed and notifies the queue unless it has already been notified.
    pub(crate) fn enqueue(&self) {
        if !self.enqueued.swap(true, AcqRel) {
            if let Some(queue) = self.queue.upgrade() {
                queue.push(Reclaimed {
                    entry_id: self.id,
                    generation: self.generation,
                });
            }
        }
    }
}

impl<K, V> Drop for Entry<K, V> {
    #[inline]
    fn drop(&mut self) {
        self.enqueue();
    }
}

impl<K, V> EntryRef<K, V> {
    /// Wraps a strong reference to an [`Entry`].
    #[inline]
    pub(crate) fn new(entry: Arc<Entry<K, V>>) -> Self {
        Self { entry }
    }

    /// Returns a reference to the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    /// assert_eq!(map.get_entry(&1).map(|e| *e.key()), Some(1));
    /// ```
    #[inline]
    pub fn key(&self) -> &K {
        self.entry.key()
    }

    /// Reads the current value with the supplied reader.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, String> = ReferenceMap::default();
    /// assert!(map.put(1, "one".to_string()).is_none());
    ///
    /// let entry = map.get_entry(&1).unwrap();
    /// assert_eq!(entry.read(|v| v.len()), Some(3));
    /// ```
    #[inline]
    pub fn read<R, F: FnOnce(&V) -> R>(&self, reader: F) -> Option<R> {
        let guard = Guard::new();
        self.entry.value(&guard).map(reader)
    }

    /// Returns a clone of the current value.
    #[inline]
    pub fn value(&self) -> Option<V>
    where
        V: Clone,
    {
        self.read(V::clone)
    }

    /// Replaces the value in place, returning the previous one.
    ///
    /// The map observes the new value immediately unless [`is_removed`](Self::is_removed)
    /// returns `true`.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    ///
    /// let entry = map.get_entry(&1).unwrap();
    /// assert_eq!(entry.set_value(11), Some(10));
    /// assert_eq!(map.get(&1), Some(11));
    /// ```
    #[inline]
    pub fn set_value(&self, value: V) -> Option<V>
    where
        K: 'static,
        V: 'static + Clone,
    {
        self.entry.set_value(value).map(|v| (*v).clone())
    }

    /// Returns `true` if the entry is no longer part of the map.
    ///
    /// This is the case once the entry was removed or the map was [cleared](crate::ReferenceMap::clear).
    #[inline]
    pub fn is_removed(&self) -> bool {
        self.entry.is_enqueued()
    }
}

impl<K, V> Clone for EntryRef<K, V> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
        }
    }
}

impl<K: Debug, V: Debug> Debug for EntryRef<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = Guard::new();
        f.debug_struct("EntryRef")
            .field("key", self.entry.key())
            .field("value", &self.entry.value(&guard))
            .finish()
    }
}

impl<K: Display, V: Display> Display for EntryRef<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = Guard::new();
        match self.entry.value(&guard) {
            Some(value) => write!(f, "{}={value}", self.entry.key()),
            None => write!(f, "{}=", self.entry.key()),
        }
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for EntryRef<K, V> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.entry, &other.entry) {
            return true;
        }
        let guard = Guard::new();
        self.entry.key() == other.entry.key()
            && self.entry.value(&guard) == other.entry.value(&guard)
    }
}

impl<K: Hash, V: Hash> Hash for EntryRef<K, V> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        let guard = Guard::new();
        self.entry.key().hash(state);
        self.entry.value(&guard).hash(state);
    }
}
