//! [`Config`] describes how a [`ReferenceMap`](super::ReferenceMap) is laid out.

use super::{Error, ReferenceKind};

/// The initial capacity used by [`Config::default`].
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;

/// The load factor used by [`Config::default`].
pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;

/// The concurrency level used by [`Config::default`].
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 16;

/// The maximum number of segments.
pub const MAXIMUM_CONCURRENCY_LEVEL: usize = 1 << 16;

/// The maximum length of the bucket array of a single segment.
pub const MAXIMUM_SEGMENT_SIZE: usize = 1 << 30;

/// Construction parameters of a [`ReferenceMap`](super::ReferenceMap).
///
/// # Examples
///
/// ```
/// use refmap::{Config, ReferenceKind, ReferenceMap};
///
/// let config = Config::default()
///     .initial_capacity(1024)
///     .concurrency_level(4)
///     .reference_kind(ReferenceKind::Weak);
/// let map: ReferenceMap<u64, String> = ReferenceMap::with_config(config).unwrap();
///
/// assert_eq!(map.segments_len(), 4);
/// assert_eq!(map.reference_kind(), ReferenceKind::Weak);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    pub(crate) initial_capacity: usize,
    pub(crate) load_factor: f32,
    pub(crate) concurrency_level: usize,
    pub(crate) reference_kind: ReferenceKind,
}

impl Config {
    /// Sets the total number of buckets allocated up front, spread over the segments.
    #[inline]
    #[must_use]
    pub const fn initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// Sets the load factor; each segment grows once its entry count reaches
    /// `bucket array length * load_factor`.
    #[inline]
    #[must_use]
    pub const fn load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Sets the expected number of concurrently writing threads.
    ///
    /// The number of segments is the smallest power of two not less than the concurrency level,
    /// capped at [`MAXIMUM_CONCURRENCY_LEVEL`].
    #[inline]
    #[must_use]
    pub const fn concurrency_level(mut self, concurrency_level: usize) -> Self {
        self.concurrency_level = concurrency_level;
        self
    }

    /// Sets the [`ReferenceKind`] used for every entry.
    #[inline]
    #[must_use]
    pub const fn reference_kind(mut self, reference_kind: ReferenceKind) -> Self {
        self.reference_kind = reference_kind;
        self
    }

    /// Checks the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLoadFactor`] if the load factor is not a positive finite number,
    /// and [`Error::InvalidConcurrencyLevel`] if the concurrency level is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::{Config, Error};
    ///
    /// assert!(Config::default().validate().is_ok());
    /// assert_eq!(
    ///     Config::default().load_factor(0.0).validate(),
    ///     Err(Error::InvalidLoadFactor(0.0))
    /// );
    /// assert_eq!(
    ///     Config::default().concurrency_level(0).validate(),
    ///     Err(Error::InvalidConcurrencyLevel)
    /// );
    /// ```
    pub fn validate(&self) -> Result<(), Error> {
        if !self.load_factor.is_finite() || self.load_factor <= 0.0 {
            return Err(Error::InvalidLoadFactor(self.load_factor));
        }
        if self.concurrency_level == 0 {
            return Err(Error::InvalidConcurrencyLevel);
        }
        Ok(())
    }

    /// Returns the number of bits used to select a segment.
    #[inline]
    pub(crate) fn segment_shift(&self) -> u32 {
        calculate_shift(self.concurrency_level, MAXIMUM_CONCURRENCY_LEVEL)
    }

    /// Returns the initial bucket array length of each of `segments_len` segments.
    #[inline]
    pub(crate) fn initial_segment_size(&self, segments_len: usize) -> usize {
        let per_segment = self.initial_capacity.div_ceil(segments_len);
        1_usize << calculate_shift(per_segment, MAXIMUM_SEGMENT_SIZE)
    }
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            reference_kind: ReferenceKind::default(),
        }
    }
}

/// Returns the exponent of the smallest power of two that is not less than `minimum`, bounded by
/// `maximum`.
pub(crate) fn calculate_shift(minimum: usize, maximum: usize) -> u32 {
    let mut shift = 0;
    let mut value = 1_usize;
    while value < minimum && value < maximum {
        value <<= 1;
        shift += 1;
    }
    shift
}

/// Returns the entry count at which a bucket array of `len` should grow.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
#[allow(clippy::cast_sign_loss)]
#[inline]
pub(crate) fn resize_threshold(len: usize, load_factor: f32) -> usize {
    (len as f64 * f64::from(load_factor)) as usize
}
