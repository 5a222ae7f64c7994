//! Per-run membership filters.
//!
//! Every run may carry up to two filters sized from the configured
//! false-positive rate and the run's record count:
//!
//! - a **key filter** over every key in the run, consulted before any
//!   page is touched on point lookups, and
//! - a **tombstone filter** over `key ⧺ value` of each tombstone,
//!   consulted by the sampler's rejection check (`has_tombstone`) so
//!   most candidates skip the tombstone search entirely.
//!
//! Filters serialize to a run's filter segment verbatim via the
//! `bloomfilter` crate's slice form; a missing or empty segment decodes
//! to "no filter", which never excludes anything.

use bloomfilter::Bloom;
use thiserror::Error;

/// Errors raised while sizing or deserializing a filter.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The `bloomfilter` crate rejected the parameters or bytes.
    #[error("bloom filter error: {0}")]
    Bloom(String),
}

/// A membership filter over raw byte strings.
pub struct Filter {
    inner: Bloom<[u8]>,
}

impl Filter {
    /// Allocates a filter for `expected_items` entries at the target
    /// false-positive rate.
    ///
    /// `fpr` is clamped into `(0, 0.5]`; an expected count of zero is
    /// treated as one so empty runs still round-trip a valid segment.
    pub fn new(expected_items: usize, fpr: f64) -> Result<Self, FilterError> {
        let items = expected_items.max(1);
        let rate = fpr.clamp(f64::MIN_POSITIVE, 0.5);
        let inner =
            Bloom::new_for_fp_rate(items, rate).map_err(|e| FilterError::Bloom(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Records `item` as present.
    pub fn insert(&mut self, item: &[u8]) {
        self.inner.set(item);
    }

    /// Returns `false` only when `item` is definitely absent.
    pub fn maybe_contains(&self, item: &[u8]) -> bool {
        self.inner.check(item)
    }

    /// Serialized form for the run's filter segment.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.as_slice().to_vec()
    }

    /// Rebuilds a filter from a segment written by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FilterError> {
        let inner = Bloom::from_slice(bytes).map_err(|e| FilterError::Bloom(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Heap footprint in bytes.
    pub fn memory_utilization(&self) -> usize {
        self.inner.as_slice().len()
    }
}

/// Fingerprint for tombstone filters: the tombstone's key and value,
/// concatenated. Both widths are fixed, so the concatenation is
/// collision-free across `(key, value)` pairs.
pub fn tombstone_fingerprint(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + value.len());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}
