//! [`Segment`] is an independently locked shard of a [`ReferenceMap`](super::ReferenceMap).

pub(crate) mod bucket_array;

use std::collections::HashSet;
use std::ops::BitOr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use equivalent::Equivalent;
use log::{debug, trace};
use parking_lot::Mutex;
use sdd::{AtomicShared, Guard, Shared, Tag};

use crate::config::{resize_threshold, MAXIMUM_SEGMENT_SIZE};
use crate::entry::Entry;
use crate::reference::queue::Reclaimed;
use crate::reference::{Reference, ReferenceManager};
use bucket_array::BucketArray;

/// Whether a lookup may purge reclaimed entries first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Restructure {
    /// Purge reclaimed entries if any notification is pending.
    WhenNecessary,
    /// Never take the segment lock.
    Never,
}

/// [`TaskKey`] is the key a task looks up, either borrowed or owned by the task.
pub(crate) trait TaskKey<K> {
    /// Returns `true` if `key` is equivalent to the task key.
    fn matches(&self, key: &K) -> bool;
}

impl<K, Q> TaskKey<K> for &Q
where
    Q: Equivalent<K> + ?Sized,
{
    #[inline]
    fn matches(&self, key: &K) -> bool {
        Q::equivalent(self, key)
    }
}

/// [`OwnedKey`] hands the key back to the task so that it can be inserted.
pub(crate) struct OwnedKey<K>(pub(crate) K);

impl<K: Eq> TaskKey<K> for OwnedKey<K> {
    #[inline]
    fn matches(&self, key: &K) -> bool {
        self.0 == *key
    }
}

/// [`TaskOptions`] controls how [`Segment::do_task`] restructures the segment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct TaskOptions(u8);

impl TaskOptions {
    /// Restructure before running the task.
    pub(crate) const RESTRUCTURE_BEFORE: Self = Self(1);
    /// Restructure after running the task.
    pub(crate) const RESTRUCTURE_AFTER: Self = Self(1 << 1);
    /// Run the task without an entry, and without locking, if the segment is empty.
    pub(crate) const SKIP_IF_EMPTY: Self = Self(1 << 2);
    /// Allow restructuring to grow the bucket array.
    pub(crate) const RESIZE: Self = Self(1 << 3);

    /// Returns `true` if every option of `other` is set.
    #[inline]
    pub(crate) const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TaskOptions {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// [`Segment`] owns an array of [`Reference`] chains guarded by a single lock.
///
/// Readers load the bucket array and walk chains without locking; every modification of the
/// bucket array or `count` happens while `lock` is held.
pub(crate) struct Segment<K, V> {
    lock: Mutex<SegmentState>,
    buckets: AtomicShared<BucketArray<K, V>>,
    count: AtomicUsize,
    resize_threshold: AtomicUsize,
    initial_size: usize,
    load_factor: f32,
    reference_manager: ReferenceManager,
}

/// State only accessed while the segment lock is held.
struct SegmentState {
    /// Incremented by [`Segment::clear`] so that notifications of cleared entries are ignored.
    generation: u64,
}

/// [`EntryAdder`] inserts a new entry at the head of the chain found by [`Segment::do_task`].
pub(crate) struct EntryAdder<'s, K, V> {
    segment: &'s Segment<K, V>,
    array: &'s BucketArray<K, V>,
    index: usize,
    hash: u64,
    generation: u64,
    guard: &'s Guard,
}

impl<K: 'static, V: 'static> Segment<K, V> {
    /// Creates a new [`Segment`] with `initial_size` buckets.
    pub(crate) fn new(initial_size: usize, load_factor: f32) -> Self {
        Self {
            lock: Mutex::new(SegmentState { generation: 0 }),
            buckets: AtomicShared::new(BucketArray::new(initial_size)),
            count: AtomicUsize::new(0),
            resize_threshold: AtomicUsize::new(resize_threshold(initial_size, load_factor)),
            initial_size,
            load_factor,
            reference_manager: ReferenceManager::new(),
        }
    }

    /// Finds the [`Reference`] to the live entry of `key`.
    ///
    /// The lock is only acquired if `restructure` is [`Restructure::WhenNecessary`] and
    /// reclaimed entries are waiting to be purged.
    pub(crate) fn get_reference<'g, Q>(
        &self,
        key: &Q,
        hash: u64,
        restructure: Restructure,
        guard: &'g Guard,
    ) -> Option<&'g Reference<K, V>>
    where
        Q: Equivalent<K> + ?Sized,
    {
        if restructure == Restructure::WhenNecessary {
            self.restructure_if_necessary(false);
        }
        if self.count.load(Acquire) == 0 {
            return None;
        }
        let array = self.buckets.load(Acquire, guard).as_ref()?;
        Self::find_in_chain(array.head(array.index(hash), guard), &key, hash)
    }

    /// Runs `task` on the entry of `key` while the lock is held.
    ///
    /// `task` receives `key` back, the [`Reference`] and the live [`Entry`] if found, and an
    /// [`EntryAdder`] unless the task was skipped because the segment is empty.
    pub(crate) fn do_task<S, T, F>(&self, hash: u64, key: S, options: TaskOptions, task: F) -> T
    where
        S: TaskKey<K>,
        F: FnOnce(
            S,
            Option<&Reference<K, V>>,
            Option<&Entry<K, V>>,
            Option<EntryAdder<'_, K, V>>,
        ) -> T,
    {
        let resize = options.contains(TaskOptions::RESIZE);
        if options.contains(TaskOptions::RESTRUCTURE_BEFORE) {
            self.restructure_if_necessary(resize);
        }
        if options.contains(TaskOptions::SKIP_IF_EMPTY) && self.count.load(Acquire) == 0 {
            return task(key, None, None, None);
        }

        let result = {
            let state = self.lock.lock();
            let guard = Guard::new();
            if let Some(array) = self.buckets.load(Acquire, &guard).as_ref() {
                let index = array.index(hash);
                let reference = Self::find_in_chain(array.head(index, &guard), &key, hash);
                let entry = reference.and_then(Reference::get);
                let adder = EntryAdder {
                    segment: self,
                    array,
                    index,
                    hash,
                    generation: state.generation,
                    guard: &guard,
                };
                task(key, reference, entry.as_deref(), Some(adder))
            } else {
                task(key, None, None, None)
            }
        };

        if options.contains(TaskOptions::RESTRUCTURE_AFTER) {
            self.restructure_if_necessary(resize);
        }
        result
    }

    /// Purges reclaimed entries and grows the bucket array if needed.
    pub(crate) fn restructure_if_necessary(&self, allow_resize: bool) {
        let count = self.count.load(Acquire);
        let needs_resize =
            allow_resize && count > 0 && count >= self.resize_threshold.load(Relaxed);
        if !needs_resize && !self.reference_manager.has_pending() {
            return;
        }
        let reclaimed = self.reference_manager.poll_for_purge();
        if reclaimed.is_some() || needs_resize {
            self.restructure(allow_resize, reclaimed);
        }
    }

    /// Empties the segment.
    ///
    /// Every entry is released first, and its notification is discarded as stale by the next
    /// restructure since the generation changes.
    pub(crate) fn clear(&self) {
        if self.count.load(Acquire) == 0 {
            return;
        }
        let mut state = self.lock.lock();
        let guard = Guard::new();
        if let Some(array) = self.buckets.load(Acquire, &guard).as_ref() {
            for index in 0..array.len() {
                let mut current = array.head(index, &guard);
                while let Some(reference) = current {
                    reference.release();
                    current = reference.next();
                }
            }
        }
        let cleared = Shared::new(BucketArray::new(self.initial_size));
        drop(self.buckets.swap((Some(cleared), Tag::None), AcqRel));
        self.resize_threshold.store(
            resize_threshold(self.initial_size, self.load_factor),
            Relaxed,
        );
        self.count.store(0, Release);
        state.generation += 1;
        debug!(
            "segment cleared: {} buckets, generation {}",
            self.initial_size, state.generation
        );
    }

    /// Drops the anchor of every entry in the segment that is not held by an
    /// [`EntryRef`](crate::EntryRef).
    ///
    /// Returns the number of anchors dropped.
    pub(crate) fn reclaim(&self) -> usize {
        let _state = self.lock.lock();
        let guard = Guard::new();
        let Some(array) = self.buckets.load(Acquire, &guard).as_ref() else {
            return 0;
        };
        let mut reclaimed = 0;
        for index in 0..array.len() {
            let mut current = array.head(index, &guard);
            while let Some(reference) = current {
                if reference.reclaim() {
                    reclaimed += 1;
                }
                current = reference.next();
            }
        }
        reclaimed
    }

    /// Rebuilds every chain without the reclaimed entries, possibly doubling the bucket array.
    fn restructure(&self, allow_resize: bool, mut reclaimed: Option<Reclaimed>) {
        let state = self.lock.lock();
        let mut to_purge = HashSet::new();
        while let Some(notification) = reclaimed {
            if notification.generation == state.generation {
                to_purge.insert(notification.entry_id);
            }
            reclaimed = self.reference_manager.poll_for_purge();
        }

        let count_after_restructure = self.count.load(Acquire).saturating_sub(to_purge.len());
        let guard = Guard::new();
        let Some(array) = self.buckets.load(Acquire, &guard).as_ref() else {
            return;
        };
        let needs_resize = count_after_restructure > 0
            && count_after_restructure >= self.resize_threshold.load(Relaxed);
        let resizing = allow_resize && needs_resize && array.len() < MAXIMUM_SEGMENT_SIZE;
        let len = if resizing {
            array.len() << 1
        } else {
            array.len()
        };

        let mut chains: Vec<Option<Shared<Reference<K, V>>>> = vec![None; len];
        for index in 0..array.len() {
            let mut current = array.head(index, &guard);
            while let Some(reference) = current {
                if let Some(entry) = reference.get() {
                    if !to_purge.contains(&entry.id()) {
                        #[allow(clippy::cast_possible_truncation)] // Intended truncation.
                        let new_index = (reference.hash() as usize) & (len - 1);
                        let relinked = self.reference_manager.relink(
                            reference,
                            &entry,
                            chains[new_index].take(),
                        );
                        chains[new_index] = Some(Shared::new(relinked));
                    }
                }
                current = reference.next();
            }
        }

        if resizing {
            let resized = Shared::new(BucketArray::from_chains(chains));
            drop(self.buckets.swap((Some(resized), Tag::None), AcqRel));
            self.resize_threshold
                .store(resize_threshold(len, self.load_factor), Relaxed);
            debug!("segment resized: {len} buckets, {count_after_restructure} entries");
        } else {
            for (index, head) in chains.into_iter().enumerate() {
                array.publish(index, head);
            }
        }
        self.count.store(count_after_restructure, Release);
        if !to_purge.is_empty() {
            trace!("purged {} reclaimed entries", to_purge.len());
        }
        drop(state);
    }

    /// Walks the chain starting at `current` to find the live entry of `key`.
    fn find_in_chain<'g, S: TaskKey<K>>(
        mut current: Option<&'g Reference<K, V>>,
        key: &S,
        hash: u64,
    ) -> Option<&'g Reference<K, V>> {
        while let Some(reference) = current {
            if reference.hash() == hash {
                if let Some(entry) = reference.get() {
                    if key.matches(entry.key()) {
                        return Some(reference);
                    }
                }
            }
            current = reference.next();
        }
        None
    }
}

impl<K, V> Segment<K, V> {
    /// Returns the number of entries including reclaimed ones that have not been purged.
    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Acquire)
    }

    /// Returns the length of the current bucket array.
    #[inline]
    pub(crate) fn bucket_array_len(&self) -> usize {
        let guard = Guard::new();
        self.buckets
            .load(Acquire, &guard)
            .as_ref()
            .map_or(0, BucketArray::len)
    }

    /// Returns a strong reference to the current bucket array.
    #[inline]
    pub(crate) fn bucket_array(&self) -> Option<Shared<BucketArray<K, V>>> {
        self.buckets.get_shared(Acquire, &Guard::new())
    }
}

impl<K: 'static, V: 'static> EntryAdder<'_, K, V> {
    /// Inserts a new entry at the head of the chain.
    pub(crate) fn add(self, key: K, value: V) {
        let manager = &self.segment.reference_manager;
        let entry = manager.create_entry(key, value, self.generation);
        let head = self.array.head_shared(self.index, self.guard);
        let reference = manager.create_reference(entry, self.hash, head);
        self.array.publish(self.index, Some(Shared::new(reference)));
        self.segment.count.fetch_add(1, AcqRel);
    }
}
