//! [`ReferenceMap`] is a segmented concurrent hash map whose entries can be reclaimed.

use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};
use std::iter::FusedIterator;

use equivalent::Equivalent;
use log::{debug, trace};
use sdd::{Guard, Shared};

use super::config::Config;
use super::entry::{Entry, EntryRef};
use super::error::Error;
use super::reference::{MemoryPressure, Reference, ReferenceKind};
use super::segment::bucket_array::BucketArray;
use super::segment::{OwnedKey, Restructure, Segment, TaskOptions};

/// Segmented concurrent hash map that refers to its entries through soft or weak references.
///
/// [`ReferenceMap`] partitions its entries into a power-of-two number of segments, each with its
/// own lock and bucket array. Lookups never lock unless reclaimed entries are waiting to be
/// purged; modifications lock only the segment that the key maps to.
///
/// Entries are not owned by the map outright: each entry is held through a [`ReferenceKind`]
/// reference that [`ReferenceMap::reclaim`] may drop when memory runs low. A reclaimed entry
/// becomes invisible to every operation and is physically removed by the next write to its
/// segment or by [`ReferenceMap::purge_unreferenced_entries`]. An [`EntryRef`] handed out by the
/// map keeps its entry alive until the handle is dropped.
///
/// ## Notes
///
/// * [`ReferenceMap::len`] may count entries that have been reclaimed but not yet purged.
/// * Iteration visits a point-in-time snapshot of each segment; entries inserted or removed
///   concurrently may or may not be observed.
pub struct ReferenceMap<K, V, H = RandomState>
where
    H: BuildHasher,
{
    segments: Box<[Segment<K, V>]>,
    shift: u32,
    load_factor: f32,
    reference_kind: ReferenceKind,
    build_hasher: H,
}

/// [`Iter`] visits every live entry of a [`ReferenceMap`].
pub struct Iter<'m, K, V, H = RandomState>
where
    H: BuildHasher,
{
    map: &'m ReferenceMap<K, V, H>,
    segment_index: usize,
    bucket_index: usize,
    array: Option<Shared<BucketArray<K, V>>>,
    reference: Option<Shared<Reference<K, V>>>,
    last: Option<EntryRef<K, V>>,
}

/// [`EntrySet`] is a view of the entries of a [`ReferenceMap`] as key-value pairs.
pub struct EntrySet<'m, K, V, H = RandomState>
where
    H: BuildHasher,
{
    map: &'m ReferenceMap<K, V, H>,
}

impl<K: 'static, V: 'static, H: BuildHasher> ReferenceMap<K, V, H> {
    /// Creates an empty [`ReferenceMap`] with the given [`BuildHasher`].
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let map: ReferenceMap<u64, u32, RandomState> = ReferenceMap::with_hasher(RandomState::new());
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    pub fn with_hasher(build_hasher: H) -> Self {
        Self::from_config(Config::default(), build_hasher)
    }

    /// Creates an empty [`ReferenceMap`] with the given [`Config`] and [`BuildHasher`].
    ///
    /// # Errors
    ///
    /// Returns an error if the [`Config`] is invalid.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::{Config, Error, ReferenceMap};
    /// use std::collections::hash_map::RandomState;
    ///
    /// let config = Config::default().concurrency_level(0);
    /// let result: Result<ReferenceMap<u64, u32>, Error> =
    ///     ReferenceMap::with_config_and_hasher(config, RandomState::new());
    /// assert_eq!(result.err(), Some(Error::InvalidConcurrencyLevel));
    /// ```
    #[inline]
    pub fn with_config_and_hasher(config: Config, build_hasher: H) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::from_config(config, build_hasher))
    }

    /// Creates a [`ReferenceMap`] from a validated [`Config`].
    fn from_config(config: Config, build_hasher: H) -> Self {
        let shift = config.segment_shift();
        let segments_len = 1_usize << shift;
        let initial_size = config.initial_segment_size(segments_len);
        let segments = (0..segments_len)
            .map(|_| Segment::new(initial_size, config.load_factor))
            .collect();
        debug!(
            "reference map created: {segments_len} segments of {initial_size} buckets, {:?} references",
            config.reference_kind
        );
        Self {
            segments,
            shift,
            load_factor: config.load_factor,
            reference_kind: config.reference_kind,
            build_hasher,
        }
    }
}

impl<K: 'static, V: 'static> ReferenceMap<K, V, RandomState> {
    /// Creates an empty default [`ReferenceMap`].
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::new();
    /// assert_eq!(map.segments_len(), 16);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty [`ReferenceMap`] with at least `capacity` buckets in total.
    ///
    /// A segment grows once its entries exceed the load factor times its bucket count, so with
    /// the default load factor the map starts resizing at about three quarters of `capacity`.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::with_capacity(1024);
    /// assert!(map.capacity() >= 1024);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_config(
            Config::default().initial_capacity(capacity),
            RandomState::new(),
        )
    }

    /// Creates an empty [`ReferenceMap`] with the given [`Config`].
    ///
    /// # Errors
    ///
    /// Returns an error if the [`Config`] is invalid.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::{Config, Error, ReferenceMap};
    ///
    /// let result: Result<ReferenceMap<u64, u32>, Error> =
    ///     ReferenceMap::with_config(Config::default().load_factor(-1.0));
    /// assert_eq!(result.err(), Some(Error::InvalidLoadFactor(-1.0)));
    /// ```
    #[inline]
    pub fn with_config(config: Config) -> Result<Self, Error> {
        Self::with_config_and_hasher(config, RandomState::new())
    }
}

impl<K, V, H> ReferenceMap<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
    /// Returns a clone of the value associated with the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.get(&1).is_none());
    /// assert!(map.put(1, 10).is_none());
    /// assert_eq!(map.get(&1), Some(10));
    /// ```
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
        V: Clone,
    {
        self.read(key, |_, v| v.clone())
    }

    /// Returns a clone of the value associated with the key, or `default` if there is none.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert_eq!(map.get_or(&1, 7), 7);
    /// assert!(map.put(1, 10).is_none());
    /// assert_eq!(map.get_or(&1, 7), 10);
    /// ```
    #[inline]
    pub fn get_or<Q>(&self, key: &Q, default: V) -> V
    where
        Q: Equivalent<K> + Hash + ?Sized,
        V: Clone,
    {
        self.get(key).unwrap_or(default)
    }

    /// Reads the key and the value associated with the key without cloning them.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, String> = ReferenceMap::default();
    /// assert!(map.put(1, "one".to_string()).is_none());
    /// assert_eq!(map.read(&1, |_, v| v.len()), Some(3));
    /// ```
    #[inline]
    pub fn read<Q, R, F: FnOnce(&K, &V) -> R>(&self, key: &Q, reader: F) -> Option<R>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let hash = self.hash(key);
        let guard = Guard::new();
        let reference =
            self.segment(hash)
                .get_reference(key, hash, Restructure::WhenNecessary, &guard)?;
        let entry = reference.get()?;
        let value = entry.value(&guard)?;
        Some(reader(entry.key(), value))
    }

    /// Returns an [`EntryRef`] to the entry of the key.
    ///
    /// The entry is not reclaimed while the [`EntryRef`] is alive.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::{MemoryPressure, ReferenceMap};
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    ///
    /// let entry = map.get_entry(&1).unwrap();
    /// assert_eq!(map.reclaim(MemoryPressure::Critical), 0);
    /// assert_eq!(map.get(&1), Some(10));
    ///
    /// drop(entry);
    /// assert_eq!(map.reclaim(MemoryPressure::Critical), 1);
    /// assert!(map.get(&1).is_none());
    /// ```
    #[inline]
    pub fn get_entry<Q>(&self, key: &Q) -> Option<EntryRef<K, V>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let hash = self.hash(key);
        let guard = Guard::new();
        self.segment(hash)
            .get_reference(key, hash, Restructure::WhenNecessary, &guard)?
            .get()
            .map(EntryRef::new)
    }

    /// Returns `true` if the map contains a live entry for the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(!map.contains_key(&1));
    /// assert!(map.put(1, 0).is_none());
    /// assert!(map.contains_key(&1));
    /// ```
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.read(key, |_, _| ()).is_some()
    }

    /// Associates the value with the key, returning the previous value.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    /// assert_eq!(map.put(1, 11), Some(10));
    /// assert_eq!(map.get(&1), Some(11));
    /// ```
    #[inline]
    pub fn put(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        self.put_internal(key, value, true).map(|v| (*v).clone())
    }

    /// Associates the value with the key unless a live entry for the key exists.
    ///
    /// Returns the current value if the key was present.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put_if_absent(1, 10).is_none());
    /// assert_eq!(map.put_if_absent(1, 11), Some(10));
    /// assert_eq!(map.get(&1), Some(10));
    /// ```
    #[inline]
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        self.put_internal(key, value, false).map(|v| (*v).clone())
    }

    /// Removes the entry of the key, returning its value.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.remove(&1).is_none());
    /// assert!(map.put(1, 10).is_none());
    /// assert_eq!(map.remove(&1), Some(10));
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
        V: Clone,
    {
        self.remove_internal(key, |entry| entry.value_shared(&Guard::new()))
            .map(|v| (*v).clone())
    }

    /// Removes the entry of the key if its value equals `value`.
    ///
    /// Returns `true` if the entry was removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    /// assert!(!map.remove_if_eq(&1, &11));
    /// assert!(map.remove_if_eq(&1, &10));
    /// assert!(!map.contains_key(&1));
    /// ```
    #[inline]
    pub fn remove_if_eq<Q>(&self, key: &Q, value: &V) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
        V: PartialEq,
    {
        self.remove_internal(key, |entry| {
            let guard = Guard::new();
            (entry.value(&guard) == Some(value)).then_some(())
        })
        .is_some()
    }

    /// Replaces the value of an existing entry, returning the previous value.
    ///
    /// Nothing is inserted if the key is absent.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.replace(&1, 10).is_none());
    /// assert!(!map.contains_key(&1));
    ///
    /// assert!(map.put(1, 10).is_none());
    /// assert_eq!(map.replace(&1, 11), Some(10));
    /// assert_eq!(map.get(&1), Some(11));
    /// ```
    #[inline]
    pub fn replace<Q>(&self, key: &Q, value: V) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
        V: Clone,
    {
        let hash = self.hash(key);
        self.segment(hash)
            .do_task(
                hash,
                key,
                TaskOptions::RESTRUCTURE_BEFORE | TaskOptions::SKIP_IF_EMPTY,
                |_, reference, entry, _| {
                    let entry = entry?;
                    if let Some(reference) = reference {
                        reference.retain();
                    }
                    entry.set_value(value)
                },
            )
            .map(|v| (*v).clone())
    }

    /// Replaces the value of an existing entry if it equals `current`.
    ///
    /// Returns `true` if the value was replaced.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    /// assert!(!map.replace_if_eq(&1, &11, 12));
    /// assert!(map.replace_if_eq(&1, &10, 12));
    /// assert_eq!(map.get(&1), Some(12));
    /// ```
    #[inline]
    pub fn replace_if_eq<Q>(&self, key: &Q, current: &V, value: V) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
        V: PartialEq,
    {
        let hash = self.hash(key);
        self.segment(hash).do_task(
            hash,
            key,
            TaskOptions::RESTRUCTURE_BEFORE | TaskOptions::SKIP_IF_EMPTY,
            |_, reference, entry, _| {
                let Some(entry) = entry else {
                    return false;
                };
                let guard = Guard::new();
                if entry.value(&guard) != Some(current) {
                    return false;
                }
                if let Some(reference) = reference {
                    reference.retain();
                }
                drop(entry.set_value(value));
                true
            },
        )
    }

    /// Removes every entry.
    ///
    /// Segments are cleared one after another, so a concurrent reader may observe a partially
    /// cleared map.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    /// map.clear();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// Physically removes entries that have been reclaimed or released.
    ///
    /// This never grows a bucket array.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::{Config, MemoryPressure, ReferenceKind, ReferenceMap};
    ///
    /// let config = Config::default().reference_kind(ReferenceKind::Weak);
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::with_config(config).unwrap();
    /// assert!(map.put(1, 10).is_none());
    /// assert_eq!(map.reclaim(MemoryPressure::Normal), 1);
    /// assert_eq!(map.len(), 1);
    ///
    /// map.purge_unreferenced_entries();
    /// assert_eq!(map.len(), 0);
    /// ```
    #[inline]
    pub fn purge_unreferenced_entries(&self) {
        for segment in self.segments.iter() {
            segment.restructure_if_necessary(false);
        }
    }

    /// Runs a reclamation pass at the given [`MemoryPressure`].
    ///
    /// If the [`ReferenceKind`] of the map is reclaimable under `pressure`, the map gives up its
    /// hold on every entry that no [`EntryRef`] refers to, and those entries vanish immediately.
    /// Entries held by an [`EntryRef`] stay until a later pass. Returns the number of entries
    /// given up.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::{MemoryPressure, ReferenceMap};
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    ///
    /// assert_eq!(map.reclaim(MemoryPressure::Normal), 0);
    /// assert!(map.contains_key(&1));
    ///
    /// assert_eq!(map.reclaim(MemoryPressure::Critical), 1);
    /// assert!(!map.contains_key(&1));
    /// ```
    pub fn reclaim(&self, pressure: MemoryPressure) -> usize {
        if !self.reference_kind.is_reclaimable(pressure) {
            return 0;
        }
        let reclaimed: usize = self.segments.iter().map(Segment::reclaim).sum();
        trace!("reclaimed {reclaimed} entries under {pressure:?} memory pressure");
        reclaimed
    }

    /// Returns an [`EntrySet`] view of the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    ///
    /// let entries = map.entry_set();
    /// assert!(entries.contains(&1, &10));
    /// assert!(!entries.contains(&1, &11));
    /// assert_eq!(entries.len(), 1);
    /// ```
    #[inline]
    pub fn entry_set(&self) -> EntrySet<'_, K, V, H> {
        EntrySet { map: self }
    }

    /// Associates the value with the key, returning the replaced value.
    pub(crate) fn put_internal(&self, key: K, value: V, overwrite: bool) -> Option<Shared<V>> {
        let hash = self.hash(&key);
        self.segment(hash).do_task(
            hash,
            OwnedKey(key),
            TaskOptions::RESTRUCTURE_BEFORE | TaskOptions::RESIZE,
            |OwnedKey(key), reference, entry, adder| {
                if let Some(entry) = entry {
                    if overwrite {
                        if let Some(reference) = reference {
                            reference.retain();
                        }
                        return entry.set_value(value);
                    }
                    return entry.value_shared(&Guard::new());
                }
                if let Some(adder) = adder {
                    adder.add(key, value);
                }
                None
            },
        )
    }

    /// Releases the entry of the key if `condition` yields a result for it.
    fn remove_internal<Q, R, F>(&self, key: &Q, condition: F) -> Option<R>
    where
        Q: Equivalent<K> + Hash + ?Sized,
        F: FnOnce(&Entry<K, V>) -> Option<R>,
    {
        let hash = self.hash(key);
        self.segment(hash).do_task(
            hash,
            key,
            TaskOptions::RESTRUCTURE_AFTER | TaskOptions::SKIP_IF_EMPTY,
            |_, reference, entry, _| {
                let (reference, entry) = (reference?, entry?);
                let result = condition(entry)?;
                reference.release();
                Some(result)
            },
        )
    }
}

impl<K, V, H: BuildHasher> ReferenceMap<K, V, H> {
    /// Returns the number of entries.
    ///
    /// Entries that have been reclaimed but not yet purged are included.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    /// assert!(map.put(2, 20).is_none());
    /// assert_eq!(map.len(), 2);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::count).sum()
    }

    /// Returns `true` if every segment is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|segment| segment.count() == 0)
    }

    /// Returns the total number of buckets across all segments.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert_eq!(map.capacity(), 16);
    /// ```
    #[inline]
    pub fn capacity(&self) -> usize {
        self.segments.iter().map(Segment::bucket_array_len).sum()
    }

    /// Returns the number of segments.
    #[inline]
    pub fn segments_len(&self) -> usize {
        self.segments.len()
    }

    /// Returns the load factor.
    #[inline]
    pub const fn load_factor(&self) -> f32 {
        self.load_factor
    }

    /// Returns the [`ReferenceKind`] of the map.
    #[inline]
    pub const fn reference_kind(&self) -> ReferenceKind {
        self.reference_kind
    }

    /// Returns an [`Iter`] over the live entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    /// assert!(map.put(2, 20).is_none());
    ///
    /// let mut sum = 0;
    /// for entry in map.iter() {
    ///     sum += entry.value().unwrap();
    /// }
    /// assert_eq!(sum, 30);
    /// ```
    #[inline]
    pub fn iter(&self) -> Iter<'_, K, V, H> {
        Iter {
            map: self,
            segment_index: 0,
            bucket_index: 0,
            array: None,
            reference: None,
            last: None,
        }
    }

    /// Hashes the key and spreads the result over all 64 bits.
    #[inline]
    pub(crate) fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        spread(self.build_hasher.hash_one(key))
    }

    /// Returns the index of the segment that owns `hash`.
    #[allow(clippy::cast_possible_truncation)] // Intended truncation.
    #[inline]
    pub(crate) const fn segment_index(&self, hash: u64) -> usize {
        if self.shift == 0 {
            0
        } else {
            (hash >> (u64::BITS - self.shift)) as usize
        }
    }

    /// Returns the segment that owns `hash`.
    #[inline]
    fn segment(&self, hash: u64) -> &Segment<K, V> {
        &self.segments[self.segment_index(hash)]
    }
}

impl<K: 'static, V: 'static, H: BuildHasher + Default> Default for ReferenceMap<K, V, H> {
    /// Creates an empty default [`ReferenceMap`].
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert_eq!(map.capacity(), 16);
    /// ```
    #[inline]
    fn default() -> Self {
        Self::with_hasher(H::default())
    }
}

impl<K: Debug, V: Debug, H: BuildHasher> Debug for ReferenceMap<K, V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_map();
        for entry in self.iter() {
            entry.read(|v| {
                d.entry(entry.key(), v);
            });
        }
        d.finish()
    }
}

impl<K, V, H> PartialEq for ReferenceMap<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static + PartialEq,
    H: BuildHasher,
{
    /// Compares the live entries of both maps.
    fn eq(&self, other: &Self) -> bool {
        let mut len = 0;
        for entry in self.iter() {
            len += 1;
            let equal = entry
                .read(|v| other.read(entry.key(), |_, o| v == o) == Some(true))
                .unwrap_or(false);
            if !equal {
                return false;
            }
        }
        other.iter().count() == len
    }
}

impl<K, V, H> FromIterator<(K, V)> for ReferenceMap<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher + Default,
{
    #[inline]
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = Self::default();
        for (k, v) in iter {
            drop(map.put_internal(k, v, true));
        }
        map
    }
}

impl<K, V, H> Extend<(K, V)> for ReferenceMap<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
    #[inline]
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            drop(self.put_internal(k, v, true));
        }
    }
}

impl<'m, K, V, H: BuildHasher> IntoIterator for &'m ReferenceMap<K, V, H> {
    type Item = EntryRef<K, V>;
    type IntoIter = Iter<'m, K, V, H>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V, H: BuildHasher> Iter<'_, K, V, H> {
    /// Advances to the next link of any chain, loading the next segment when needed.
    fn advance(&mut self) -> Option<Shared<Reference<K, V>>> {
        if let Some(current) = self.reference.take() {
            self.reference = current.next_shared();
        }
        while self.reference.is_none() {
            let array_len = self.array.as_ref().map_or(0, |array| array.len());
            if self.bucket_index < array_len {
                self.reference = self
                    .array
                    .as_ref()
                    .and_then(|array| array.head_shared(self.bucket_index, &Guard::new()));
                self.bucket_index += 1;
            } else {
                let segment = self.map.segments.get(self.segment_index)?;
                self.array = segment.bucket_array();
                self.segment_index += 1;
                self.bucket_index = 0;
            }
        }
        self.reference.clone()
    }
}

impl<K, V, H> Iter<'_, K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
    /// Removes the entry of the key most recently returned by [`Iterator::next`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoElementToRemove`] if `next` has not returned an entry since the
    /// iterator was created or since the last call to `remove`.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::{Error, ReferenceMap};
    ///
    /// let map: ReferenceMap<u64, u32> = ReferenceMap::default();
    /// assert!(map.put(1, 10).is_none());
    ///
    /// let mut iter = map.iter();
    /// assert_eq!(iter.remove(), Err(Error::NoElementToRemove));
    /// assert!(iter.next().is_some());
    /// assert!(iter.remove().is_ok());
    /// assert_eq!(iter.remove(), Err(Error::NoElementToRemove));
    /// assert!(!map.contains_key(&1));
    /// ```
    pub fn remove(&mut self) -> Result<(), Error> {
        let last = self.last.take().ok_or(Error::NoElementToRemove)?;
        drop(self.map.remove_internal(last.key(), |_| Some(())));
        Ok(())
    }
}

impl<K, V, H: BuildHasher> Debug for Iter<'_, K, V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("segment_index", &self.segment_index)
            .field("bucket_index", &self.bucket_index)
            .finish()
    }
}

impl<K, V, H: BuildHasher> Iterator for Iter<'_, K, V, H> {
    type Item = EntryRef<K, V>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let reference = self.advance()?;
            if let Some(entry) = reference.get() {
                let entry = EntryRef::new(entry);
                self.last = Some(entry.clone());
                return Some(entry);
            }
        }
    }
}

impl<K, V, H: BuildHasher> FusedIterator for Iter<'_, K, V, H> {}

impl<'m, K, V, H> EntrySet<'m, K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
    /// Returns an [`Iter`] over the entries.
    #[inline]
    pub fn iter(&self) -> Iter<'m, K, V, H> {
        self.map.iter()
    }

    /// Returns `true` if the map associates `value` with the key.
    ///
    /// The lookup never purges reclaimed entries.
    #[inline]
    pub fn contains<Q>(&self, key: &Q, value: &V) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
        V: PartialEq,
    {
        let hash = self.map.hash(key);
        let guard = Guard::new();
        self.map
            .segment(hash)
            .get_reference(key, hash, Restructure::Never, &guard)
            .and_then(Reference::get)
            .is_some_and(|entry| entry.value(&guard) == Some(value))
    }

    /// Removes the entry of the key if its value equals `value`.
    #[inline]
    pub fn remove<Q>(&self, key: &Q, value: &V) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
        V: PartialEq,
    {
        self.map.remove_if_eq(key, value)
    }

    /// Returns the number of entries of the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the map is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Removes every entry of the map.
    #[inline]
    pub fn clear(&self) {
        self.map.clear();
    }
}

impl<K, V, H: BuildHasher> Debug for EntrySet<'_, K, V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntrySet")
            .field("segments_len", &self.map.segments_len())
            .finish()
    }
}

/// Applies a supplemental hash function to defend against poor quality hash functions.
///
/// The upper bits select the segment and the lower bits select the bucket, so both ends have to
/// be well mixed.
const fn spread(mut hash: u64) -> u64 {
    hash = (!hash).wrapping_add(hash << 21);
    hash ^= hash >> 24;
    hash = hash.wrapping_add(hash << 3).wrapping_add(hash << 8);
    hash ^= hash >> 14;
    hash = hash.wrapping_add(hash << 2).wrapping_add(hash << 4);
    hash ^= hash >> 28;
    hash.wrapping_add(hash << 31)
}
