//! # Memtable Module
//!
//! The in-memory write buffer, in three variants behind one surface:
//!
//! - **Skiplist** — a lock-free ordered map keyed by `(key, timestamp)`;
//!   sample ranges materialize the exact key interval.
//! - **Unsorted** — an append-only slot array with a single atomic tail;
//!   sample ranges materialize by filtering the occupied prefix.
//! - **UnsortedRejection** — the same slot array, but sample ranges
//!   cover the whole occupied prefix `[0, tail)` and filtering is
//!   deferred to draw time (rejection sampling).
//!
//! ## Design Invariants
//!
//! - Capacity is a hard record count: `insert` returns `false` once the
//!   table is full, never evicts.
//! - The skiplist variant refuses duplicate `(key, timestamp)` pairs;
//!   the tree's monotone timestamps make collisions an API-misuse signal.
//! - A table with live pins cannot be truncated; `truncate` returns
//!   `false` ("try again later") and the caller re-attempts after the
//!   pins drop.
//! - Tag deletes never remove data: the skiplist flips an atomic flag
//!   on the stored entry, the unsorted variants set a bit in a sidecar
//!   [`Bitmap`]. Readers overlay the mark at decode time.
//! - Sample-range materialization includes tombstones and tag-deleted
//!   records; the sampler's rejection step is what thins them out.


use std::cmp::Ordering as CmpOrdering;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::bitmap::Bitmap;
use crate::schema::{KeyCmpFn, Record, RecordSchema};

// ------------------------------------------------------------------------------------------------
// Variant selection and lifecycle status
// ------------------------------------------------------------------------------------------------

/// Which memtable implementation a tree uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemtableType {
    /// Lock-free ordered map; ordered scans and tight sample ranges.
    Skiplist,
    /// Append-only array; ranges materialize by filtering.
    Unsorted,
    /// Append-only array; ranges defer filtering to draw time.
    UnsortedRejection,
}

/// Lifecycle states tracked by the tree's memtable pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemtableStatus {
    /// Accepting inserts.
    Active,
    /// Being drained into level 0 by the merge worker.
    Merging,
    /// Truncated and ready for reuse.
    Empty,
    /// Drained but kept alive because readers still hold pins.
    Retained,
}

// ------------------------------------------------------------------------------------------------
// Skiplist keys
// ------------------------------------------------------------------------------------------------

/// Ordered-map key: `(key bytes, timestamp)` under the caller's order.
struct MapKey {
    key: Vec<u8>,
    timestamp: u64,
    cmp: KeyCmpFn,
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for MapKey {}

impl PartialOrd for MapKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for MapKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.cmp)(&self.key, &other.key).then_with(|| self.timestamp.cmp(&other.timestamp))
    }
}

/// Stored payload for the skiplist variant.
///
/// The delete mark is atomic so tag deletes can flip it through the
/// shared map reference.
struct MapEntry {
    value: Vec<u8>,
    weight: f64,
    tombstone: bool,
    deleted: AtomicBool,
}

impl MapEntry {
    fn to_record(&self, key: &MapKey) -> Record {
        Record {
            key: key.key.clone(),
            value: self.value.clone(),
            weight: self.weight,
            timestamp: key.timestamp,
            tombstone: self.tombstone,
            deleted: self.deleted.load(Ordering::Relaxed),
        }
    }
}

struct SkiplistCore {
    map: SkipMap<MapKey, MapEntry>,
    count: AtomicUsize,
    tombstones: AtomicUsize,
}

// ------------------------------------------------------------------------------------------------
// Unsorted slot array
// ------------------------------------------------------------------------------------------------

/// One generation of the unsorted variant's storage.
///
/// `tail` reserves slots; each slot is written exactly once. A reader
/// racing a reservation may observe a reserved-but-unwritten slot —
/// [`SlotArray::slot`] reports it as absent and the sampler rejects it.
struct SlotArray {
    slots: Box<[OnceLock<Record>]>,
    tail: AtomicUsize,
    deleted: Bitmap,
    tombstones: AtomicUsize,
}

impl SlotArray {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| OnceLock::new()).collect(),
            tail: AtomicUsize::new(0),
            deleted: Bitmap::new(capacity),
            tombstones: AtomicUsize::new(0),
        }
    }

    fn occupied(&self) -> usize {
        self.tail.load(Ordering::Acquire).min(self.slots.len())
    }

    fn slot(&self, idx: usize) -> Option<Record> {
        let rec = self.slots.get(idx)?.get()?;
        let mut rec = rec.clone();
        rec.deleted = rec.deleted || self.deleted.get(idx);
        Some(rec)
    }
}

struct UnsortedCore {
    array: RwLock<Arc<SlotArray>>,
    rejection: bool,
}

impl UnsortedCore {
    fn current(&self) -> Arc<SlotArray> {
        match self.array.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

enum Variant {
    Skiplist(SkiplistCore),
    Unsorted(UnsortedCore),
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// The in-memory write buffer.
///
/// Thread-safe: concurrent inserters share the table through an `Arc`,
/// readers pin it via [`MemtablePin`] guards, and the merge worker
/// drains it through [`Memtable::sorted_scan`].
pub struct Memtable {
    variant: Variant,
    capacity: usize,
    schema: RecordSchema,
    pins: AtomicUsize,
    /// Set by the drain path; sealed tables refuse inserts.
    sealed: AtomicBool,
    /// Inserters currently between entry and commit; the drain waits
    /// for this to reach zero after sealing so no write straddles the
    /// scan.
    in_flight: AtomicUsize,
}

impl Memtable {
    /// Creates an empty table of the given variant and record capacity.
    pub fn new(kind: MemtableType, capacity: usize, schema: RecordSchema) -> Self {
        let variant = match kind {
            MemtableType::Skiplist => Variant::Skiplist(SkiplistCore {
                map: SkipMap::new(),
                count: AtomicUsize::new(0),
                tombstones: AtomicUsize::new(0),
            }),
            MemtableType::Unsorted | MemtableType::UnsortedRejection => {
                Variant::Unsorted(UnsortedCore {
                    array: RwLock::new(Arc::new(SlotArray::new(capacity))),
                    rejection: kind == MemtableType::UnsortedRejection,
                })
            }
        };
        Self {
            variant,
            capacity,
            schema,
            pins: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Record capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when the rejection-mode sample range applies.
    pub fn is_rejection(&self) -> bool {
        matches!(&self.variant, Variant::Unsorted(core) if core.rejection)
    }

    /// Current record count, tombstones included.
    pub fn record_count(&self) -> usize {
        match &self.variant {
            Variant::Skiplist(core) => core.count.load(Ordering::Acquire),
            Variant::Unsorted(core) => core.current().occupied(),
        }
    }

    /// Tombstones currently stored.
    pub fn tombstone_count(&self) -> usize {
        match &self.variant {
            Variant::Skiplist(core) => core.tombstones.load(Ordering::Acquire),
            Variant::Unsorted(core) => core.current().tombstones.load(Ordering::Acquire),
        }
    }

    /// True when no further insert can be accepted.
    pub fn is_full(&self) -> bool {
        self.record_count() >= self.capacity
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts a record.
    ///
    /// Returns `false` when the table is at capacity, sealed for a
    /// drain, or (skiplist) when an identical `(key, timestamp)`
    /// already exists.
    pub fn insert(&self, rec: Record) -> bool {
        // Register before checking the seal: the drain's barrier only
        // waits on inserters it can see.
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let accepted = if self.sealed.load(Ordering::Acquire) {
            false
        } else {
            self.insert_inner(rec)
        };
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        accepted
    }

    fn insert_inner(&self, rec: Record) -> bool {
        match &self.variant {
            Variant::Skiplist(core) => {
                // Reserve headroom before touching the map.
                loop {
                    let current = core.count.load(Ordering::Acquire);
                    if current >= self.capacity {
                        return false;
                    }
                    if core
                        .count
                        .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        break;
                    }
                }

                let map_key = MapKey {
                    key: rec.key.clone(),
                    timestamp: rec.timestamp,
                    cmp: self.schema.key_cmp,
                };
                if core.map.contains_key(&map_key) {
                    core.count.fetch_sub(1, Ordering::AcqRel);
                    return false;
                }

                if rec.tombstone {
                    core.tombstones.fetch_add(1, Ordering::AcqRel);
                }
                core.map.insert(
                    map_key,
                    MapEntry {
                        value: rec.value,
                        weight: rec.weight,
                        tombstone: rec.tombstone,
                        deleted: AtomicBool::new(rec.deleted),
                    },
                );
                true
            }

            Variant::Unsorted(core) => {
                let array = core.current();
                let idx = array.tail.fetch_add(1, Ordering::AcqRel);
                if idx >= array.slots.len() {
                    return false;
                }
                if rec.tombstone {
                    array.tombstones.fetch_add(1, Ordering::AcqRel);
                }
                // The reservation above makes this slot exclusively ours.
                let _ = array.slots[idx].set(rec);
                true
            }
        }
    }

    /// Marks the newest live `(key, value)` record with timestamp ≤ `time`
    /// as deleted, in place. Returns `true` iff a record was marked.
    pub fn tag_delete(&self, key: &[u8], value: &[u8], time: u64) -> bool {
        match &self.variant {
            Variant::Skiplist(core) => {
                let lower = self.bound_key(key, 0);
                let upper = self.bound_key(key, time);
                for entry in core
                    .map
                    .range((Bound::Included(lower), Bound::Included(upper)))
                    .rev()
                {
                    let stored = entry.value();
                    if !stored.tombstone
                        && stored.value == value
                        && !stored.deleted.swap(true, Ordering::AcqRel)
                    {
                        return true;
                    }
                }
                false
            }

            Variant::Unsorted(core) => {
                let array = core.current();
                let mut newest: Option<(usize, u64)> = None;
                for idx in 0..array.occupied() {
                    let Some(rec) = array.slot(idx) else { continue };
                    if rec.is_live()
                        && rec.timestamp <= time
                        && self.schema.cmp_keys(&rec.key, key) == CmpOrdering::Equal
                        && rec.value == value
                        && newest.is_none_or(|(_, ts)| rec.timestamp > ts)
                    {
                        newest = Some((idx, rec.timestamp));
                    }
                }
                match newest {
                    Some((idx, _)) => {
                        array.deleted.set(idx);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Returns the newest record for `key` with timestamp ≤ `time`.
    ///
    /// Tombstones are returned as-is; interpreting them is the tree's
    /// job (a tombstone here masks older levels).
    pub fn get(&self, key: &[u8], time: u64) -> Option<Record> {
        match &self.variant {
            Variant::Skiplist(core) => {
                let lower = self.bound_key(key, 0);
                let upper = self.bound_key(key, time);
                core.map
                    .range((Bound::Included(lower), Bound::Included(upper)))
                    .next_back()
                    .map(|entry| entry.value().to_record(entry.key()))
            }

            Variant::Unsorted(core) => {
                let array = core.current();
                let mut newest: Option<Record> = None;
                for idx in 0..array.occupied() {
                    let Some(rec) = array.slot(idx) else { continue };
                    if rec.timestamp <= time
                        && self.schema.cmp_keys(&rec.key, key) == CmpOrdering::Equal
                        && newest.as_ref().is_none_or(|n| rec.timestamp > n.timestamp)
                    {
                        newest = Some(rec);
                    }
                }
                newest
            }
        }
    }

    /// True iff a tombstone for `(key, value)` with timestamp ≤ `time`
    /// exists in this table.
    pub fn has_tombstone(&self, key: &[u8], value: &[u8], time: u64) -> bool {
        match &self.variant {
            Variant::Skiplist(core) => {
                let lower = self.bound_key(key, 0);
                let upper = self.bound_key(key, time);
                core.map
                    .range((Bound::Included(lower), Bound::Included(upper)))
                    .any(|entry| entry.value().tombstone && entry.value().value == value)
            }

            Variant::Unsorted(core) => {
                let array = core.current();
                (0..array.occupied()).any(|idx| {
                    array.slot(idx).is_some_and(|rec| {
                        rec.tombstone
                            && rec.timestamp <= time
                            && self.schema.cmp_keys(&rec.key, key) == CmpOrdering::Equal
                            && rec.value == value
                    })
                })
            }
        }
    }

    /// True iff a tombstone for `(key, value)` with timestamp ≥ `since`
    /// exists — i.e. one that masks a record written at `since`.
    pub fn has_masking_tombstone(&self, key: &[u8], value: &[u8], since: u64) -> bool {
        match &self.variant {
            Variant::Skiplist(core) => {
                let lower = self.bound_key(key, since);
                let upper = self.bound_key(key, u64::MAX);
                core.map
                    .range((Bound::Included(lower), Bound::Included(upper)))
                    .any(|entry| entry.value().tombstone && entry.value().value == value)
            }

            Variant::Unsorted(core) => {
                let array = core.current();
                (0..array.occupied()).any(|idx| {
                    array.slot(idx).is_some_and(|rec| {
                        rec.tombstone
                            && rec.timestamp >= since
                            && self.schema.cmp_keys(&rec.key, key) == CmpOrdering::Equal
                            && rec.value == value
                    })
                })
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Sampling support
    // --------------------------------------------------------------------------------------------

    /// Materializes every record whose key lies in `[lo, hi]`, including
    /// tombstones and tag-deleted records.
    ///
    /// Used by the skiplist and filter-mode unsorted variants; rejection
    /// mode skips this and samples the raw window instead.
    pub fn collect_range(&self, lo: &[u8], hi: &[u8]) -> Vec<Record> {
        match &self.variant {
            Variant::Skiplist(core) => {
                let lower = self.bound_key(lo, 0);
                let upper = self.bound_key(hi, u64::MAX);
                core.map
                    .range((Bound::Included(lower), Bound::Included(upper)))
                    .map(|entry| entry.value().to_record(entry.key()))
                    .collect()
            }

            Variant::Unsorted(core) => {
                let array = core.current();
                (0..array.occupied())
                    .filter_map(|idx| array.slot(idx))
                    .filter(|rec| self.schema.key_in_range(&rec.key, lo, hi))
                    .collect()
            }
        }
    }

    /// Rejection-mode candidate window: the number of reserved slots.
    ///
    /// The window over-counts (out-of-range keys, unwritten slots); the
    /// sampler rejects those draws.
    pub fn rejection_window(&self) -> usize {
        match &self.variant {
            Variant::Skiplist(_) => 0,
            Variant::Unsorted(core) => core.current().tail.load(Ordering::Acquire),
        }
    }

    /// Reads slot `idx` of the unsorted array; `None` for unwritten or
    /// out-of-range slots (a rejectable draw).
    pub fn slot(&self, idx: usize) -> Option<Record> {
        match &self.variant {
            Variant::Skiplist(_) => None,
            Variant::Unsorted(core) => core.current().slot(idx),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Merge support
    // --------------------------------------------------------------------------------------------

    /// Seals the table ahead of a drain: further inserts are refused,
    /// and this call returns only once every in-flight insert has
    /// committed, so a subsequent [`Self::sorted_scan`] sees a stable
    /// record set.
    pub fn seal_for_drain(&self) {
        self.sealed.store(true, Ordering::Release);
        while self.in_flight.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
    }

    /// Snapshot of the table's records sorted by `(key, timestamp)`.
    ///
    /// The merge worker feeds this into run construction; the unsorted
    /// variants pay their deferred sort here.
    pub fn sorted_scan(&self) -> Vec<Record> {
        match &self.variant {
            Variant::Skiplist(core) => core
                .map
                .iter()
                .map(|entry| entry.value().to_record(entry.key()))
                .collect(),

            Variant::Unsorted(core) => {
                let array = core.current();
                let mut records: Vec<Record> =
                    (0..array.occupied()).filter_map(|idx| array.slot(idx)).collect();
                records.sort_by(|a, b| self.schema.record_cmp(a, b));
                records
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Pins and truncation
    // --------------------------------------------------------------------------------------------

    /// Pins `table`, protecting it from truncation.
    pub fn pin(table: &Arc<Memtable>) -> MemtablePin {
        table.pins.fetch_add(1, Ordering::AcqRel);
        MemtablePin {
            table: Arc::clone(table),
        }
    }

    /// Current pin count.
    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// Drops all records.
    ///
    /// Returns `false` without touching anything while pins are held;
    /// the caller retries once the last pin drops.
    pub fn truncate(&self) -> bool {
        if self.pin_count() > 0 {
            return false;
        }

        match &self.variant {
            Variant::Skiplist(core) => {
                for entry in core.map.iter() {
                    entry.remove();
                }
                core.count.store(0, Ordering::Release);
                core.tombstones.store(0, Ordering::Release);
            }
            Variant::Unsorted(core) => {
                let fresh = Arc::new(SlotArray::new(self.capacity));
                match core.array.write() {
                    Ok(mut guard) => *guard = fresh,
                    Err(poisoned) => *poisoned.into_inner() = fresh,
                }
            }
        }
        self.sealed.store(false, Ordering::Release);
        true
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_utilization(&self) -> usize {
        let per_record = self.schema.record_len() + std::mem::size_of::<Record>();
        match &self.variant {
            Variant::Skiplist(_) => self.record_count() * per_record,
            Variant::Unsorted(core) => {
                let array = core.current();
                array.slots.len() * std::mem::size_of::<OnceLock<Record>>()
                    + array.occupied() * per_record
                    + array.deleted.memory_utilization()
            }
        }
    }

    fn bound_key(&self, key: &[u8], timestamp: u64) -> MapKey {
        MapKey {
            key: key.to_vec(),
            timestamp,
            cmp: self.schema.key_cmp,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// MemtablePin
// ------------------------------------------------------------------------------------------------

/// Scoped pin on a memtable; released on drop.
///
/// While any pin is alive, [`Memtable::truncate`] refuses to run, which
/// is what lets sample ranges read a draining table safely.
pub struct MemtablePin {
    table: Arc<Memtable>,
}

impl MemtablePin {
    /// The pinned table.
    pub fn table(&self) -> &Arc<Memtable> {
        &self.table
    }
}

impl Drop for MemtablePin {
    fn drop(&mut self) {
        self.table.pins.fetch_sub(1, Ordering::AcqRel);
    }
}
