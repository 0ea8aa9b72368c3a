use std::sync::atomic::Ordering::{AcqRel, Acquire};

use sdd::{AtomicShared, Guard, Shared, Tag};

use crate::reference::Reference;

/// [`BucketArray`] is a fixed-length array of bucket chain heads.
///
/// The length is always a power of two. Chains are immutable once published; a slot is updated
/// by atomically swapping in a new head.
pub(crate) struct BucketArray<K, V> {
    buckets: Box<[AtomicShared<Reference<K, V>>]>,
}

impl<K, V> BucketArray<K, V> {
    /// Creates an empty [`BucketArray`] of the given length.
    pub(crate) fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        Self {
            buckets: (0..len).map(|_| AtomicShared::null()).collect(),
        }
    }

    /// Creates a [`BucketArray`] from the supplied chains.
    pub(crate) fn from_chains(chains: Vec<Option<Shared<Reference<K, V>>>>) -> Self {
        debug_assert!(chains.len().is_power_of_two());
        Self {
            buckets: chains
                .into_iter()
                .map(|head| head.map_or_else(AtomicShared::null, AtomicShared::from))
                .collect(),
        }
    }

    /// Returns the number of buckets.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Calculates the bucket index for the hash value.
    #[allow(clippy::cast_possible_truncation)] // Intended truncation.
    #[inline]
    pub(crate) fn index(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Returns the head of the chain at `index`.
    #[inline]
    pub(crate) fn head<'g>(&self, index: usize, guard: &'g Guard) -> Option<&'g Reference<K, V>> {
        self.buckets[index].load(Acquire, guard).as_ref()
    }

    /// Returns a strong reference to the head of the chain at `index`.
    #[inline]
    pub(crate) fn head_shared(&self, index: usize, guard: &Guard) -> Option<Shared<Reference<K, V>>> {
        self.buckets[index].get_shared(Acquire, guard)
    }

    /// Publishes a new head for the chain at `index`.
    ///
    /// Must be called while the segment lock is held.
    #[inline]
    pub(crate) fn publish(&self, index: usize, head: Option<Shared<Reference<K, V>>>) {
        drop(self.buckets[index].swap((head, Tag::None), AcqRel));
    }
}
