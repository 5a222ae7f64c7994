//! Immutable sorted runs.
//!
//! A run is an immutable sequence of records sorted by `(key, timestamp)`.
//! Two residences share one surface:
//!
//! - [`DiskRun`] — an ISAM-style paged file: leaf pages of packed
//!   records plus a sparse index (first key of every leaf page), an
//!   optional key filter, an optional tombstone filter, and an optional
//!   alias table for weighted sampling.
//! - [`MemoryRun`] — the same structure held as a sorted vector, used
//!   by the tree's in-RAM levels before data spills to disk.
//!
//! # On-disk layout
//!
//! ```text
//! [page 0]            run metadata (encoded RunMeta + CRC32)
//! [pages 1..=L]       leaf pages: 16 B page header + packed records
//! [index segment]     encoded first-key list, one entry per leaf page
//! [filter segment]    key bloom filter bytes (optional)
//! [tfilter segment]   tombstone bloom filter bytes (optional)
//! [alias segment]     encoded alias table (weighted runs only)
//! ```
//!
//! Segments are raw byte blobs occupying whole pages; the metadata page
//! names each segment's first page and byte length. Page numbers are
//! allocated monotonically, so the file is append-only: leaves first,
//! then segments, and the metadata page (reserved up front) is filled
//! in last.
//!
//! ## Design Invariants
//!
//! - Immutable after publication — the single exception is the
//!   tag-delete flag flip, which rewrites one byte in place and
//!   invalidates the page's cache entry.
//! - `record_count == Σ per-page slot counts`; every leaf page's
//!   checksum is verified when the run is opened.
//! - The sparse index holds the **first** key of every leaf page;
//!   `lower_bound`/`upper_bound` binary-search it and finish with an
//!   in-page scan.

pub mod builder;
pub mod merge;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use memmap2::Mmap;
use thiserror::Error;

use crate::alias::AliasTable;
use crate::bitmap::Bitmap;
use crate::bloom::{Filter, FilterError, tombstone_fingerprint};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::pagestore::cache::ReadCache;
use crate::pagestore::{
    FileId, FileManager, PAGE_CAPACITY, PAGE_SIZE, PageBuf, PageId, PageStoreError, PagedFile, page,
};
use crate::schema::{Record, RecordSchema};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const RUN_MAGIC: [u8; 4] = *b"SRUN";
const RUN_VERSION: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while building, opening, or reading runs.
#[derive(Debug, Error)]
pub enum RunError {
    /// Paged-file or cache failure.
    #[error("page store error: {0}")]
    PageStore(#[from] PageStoreError),

    /// Metadata encode/decode failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Filter sizing or deserialization failure.
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// A run file's structure disagrees with its metadata.
    #[error("corrupted run: {0}")]
    Corrupted(String),
}

// ------------------------------------------------------------------------------------------------
// Shared construction context
// ------------------------------------------------------------------------------------------------

/// Everything run construction and lookup needs from the environment.
pub struct RunContext {
    /// File ownership and allocation.
    pub files: Arc<FileManager>,
    /// Pinning read cache for leaf pages.
    pub cache: Arc<ReadCache>,
    /// Record geometry and key order.
    pub schema: RecordSchema,
    /// Target false-positive rate for per-run filters.
    pub bloom_fpr: f64,
}

// ------------------------------------------------------------------------------------------------
// Run metadata (page 0)
// ------------------------------------------------------------------------------------------------

/// Location of one segment inside a run file.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SegmentHandle {
    /// First page of the segment; meaningless when `len == 0`.
    pub(crate) start_page: u32,
    /// Segment length in bytes; `0` means absent.
    pub(crate) len: u64,
}

impl Encode for SegmentHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.start_page.encode_to(buf)?;
        self.len.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SegmentHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (start_page, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (len, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { start_page, len }, off))
    }
}

/// Metadata page contents.
pub(crate) struct RunMeta {
    pub(crate) magic: [u8; 4],
    pub(crate) version: u32,
    pub(crate) record_count: u64,
    pub(crate) tombstone_count: u64,
    pub(crate) leaf_page_count: u32,
    pub(crate) first_leaf_page: u32,
    pub(crate) records_per_page: u32,
    pub(crate) weight_total: f64,
    pub(crate) min_key: Vec<u8>,
    pub(crate) max_key: Vec<u8>,
    pub(crate) index_seg: SegmentHandle,
    pub(crate) filter_seg: SegmentHandle,
    pub(crate) tombstone_filter_seg: SegmentHandle,
    pub(crate) alias_seg: SegmentHandle,
    pub(crate) crc: u32,
}

impl Encode for RunMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.record_count.encode_to(buf)?;
        self.tombstone_count.encode_to(buf)?;
        self.leaf_page_count.encode_to(buf)?;
        self.first_leaf_page.encode_to(buf)?;
        self.records_per_page.encode_to(buf)?;
        self.weight_total.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.index_seg.encode_to(buf)?;
        self.filter_seg.encode_to(buf)?;
        self.tombstone_filter_seg.encode_to(buf)?;
        self.alias_seg.encode_to(buf)?;
        self.crc.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for RunMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (record_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (tombstone_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (leaf_page_count, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (first_leaf_page, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (records_per_page, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (weight_total, n) = f64::decode_from(&buf[off..])?;
        off += n;
        let (min_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (max_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (index_seg, n) = SegmentHandle::decode_from(&buf[off..])?;
        off += n;
        let (filter_seg, n) = SegmentHandle::decode_from(&buf[off..])?;
        off += n;
        let (tombstone_filter_seg, n) = SegmentHandle::decode_from(&buf[off..])?;
        off += n;
        let (alias_seg, n) = SegmentHandle::decode_from(&buf[off..])?;
        off += n;
        let (crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                magic,
                version,
                record_count,
                tombstone_count,
                leaf_page_count,
                first_leaf_page,
                records_per_page,
                weight_total,
                min_key,
                max_key,
                index_seg,
                filter_seg,
                tombstone_filter_seg,
                alias_seg,
                crc,
            },
            off,
        ))
    }
}

impl RunMeta {
    /// CRC over the encoded metadata with the `crc` field zeroed.
    pub(crate) fn checksum(&self) -> Result<u32, EncodingError> {
        let zeroed = Self {
            magic: self.magic,
            version: self.version,
            record_count: self.record_count,
            tombstone_count: self.tombstone_count,
            leaf_page_count: self.leaf_page_count,
            first_leaf_page: self.first_leaf_page,
            records_per_page: self.records_per_page,
            weight_total: self.weight_total,
            min_key: self.min_key.clone(),
            max_key: self.max_key.clone(),
            index_seg: self.index_seg,
            filter_seg: self.filter_seg,
            tombstone_filter_seg: self.tombstone_filter_seg,
            alias_seg: self.alias_seg,
            crc: 0,
        };
        let bytes = encoding::encode_to_vec(&zeroed)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes);
        Ok(hasher.finalize())
    }
}

/// Records that fit on one leaf page for the given schema.
pub fn records_per_page(schema: &RecordSchema) -> usize {
    PAGE_CAPACITY / schema.record_len()
}

// ------------------------------------------------------------------------------------------------
// DiskRun
// ------------------------------------------------------------------------------------------------

/// An immutable ISAM run backed by one paged file.
pub struct DiskRun {
    file: Arc<PagedFile>,
    files: Arc<FileManager>,
    cache: Arc<ReadCache>,
    schema: RecordSchema,
    mmap: Mmap,
    /// Set when the owning level truncates; the backing file is removed
    /// once the last reader drops this run.
    defunct: std::sync::atomic::AtomicBool,
    /// Serializes tag-delete page rewrites; two flips on one page must
    /// not lose each other's bytes.
    tag_lock: std::sync::Mutex<()>,

    record_count: usize,
    tombstone_count: usize,
    leaf_page_count: u32,
    first_leaf_page: u32,
    records_per_page: usize,
    weight_total: f64,
    min_key: Vec<u8>,
    max_key: Vec<u8>,

    /// First key of every leaf page, in leaf order.
    index: Vec<Vec<u8>>,
    key_filter: Option<Filter>,
    tombstone_filter: Option<Filter>,
    alias: Option<AliasTable>,
}

impl DiskRun {
    /// Opens and fully verifies a run file.
    ///
    /// Decodes the metadata page, checks its CRC and magic, loads the
    /// sparse index and filter/alias segments from a read-only map, and
    /// verifies every leaf page checksum so scans can stream infallibly.
    pub fn open(file: Arc<PagedFile>, ctx: &RunContext) -> Result<Self, RunError> {
        let mut meta_page = [0u8; PAGE_SIZE];
        file.read_page(0, &mut meta_page)?;
        let (meta, _) = encoding::decode_from_slice::<RunMeta>(&meta_page)?;

        if meta.magic != RUN_MAGIC {
            return Err(RunError::Corrupted("run metadata magic mismatch".into()));
        }
        if meta.version != RUN_VERSION {
            return Err(RunError::Corrupted("run metadata version mismatch".into()));
        }
        if meta.crc != meta.checksum()? {
            return Err(RunError::Corrupted("run metadata checksum mismatch".into()));
        }

        let expected_rpp = records_per_page(&ctx.schema);
        if meta.records_per_page as usize != expected_rpp {
            return Err(RunError::Corrupted(format!(
                "run built for {} records per page, schema expects {expected_rpp}",
                meta.records_per_page
            )));
        }

        let std_file = std::fs::File::open(file.path()).map_err(PageStoreError::Io)?;
        // Safety: run files are immutable after construction (the one
        // in-place byte flip goes through write_page + invalidate) and
        // the map is read-only.
        let mmap = unsafe { Mmap::map(&std_file).map_err(PageStoreError::Io)? };

        let index_bytes = Self::segment_bytes(&mmap, meta.index_seg)?;
        let mut index = Vec::with_capacity(meta.leaf_page_count as usize);
        let (raw_index, _) = encoding::decode_vec::<Vec<u8>>(&index_bytes)?;
        index.extend(raw_index);
        if index.len() != meta.leaf_page_count as usize {
            return Err(RunError::Corrupted(format!(
                "sparse index has {} entries for {} leaf pages",
                index.len(),
                meta.leaf_page_count
            )));
        }

        let key_filter = Self::load_filter(&mmap, meta.filter_seg)?;
        let tombstone_filter = Self::load_filter(&mmap, meta.tombstone_filter_seg)?;

        let alias = if meta.alias_seg.len > 0 {
            let bytes = Self::segment_bytes(&mmap, meta.alias_seg)?;
            let (table, _) = AliasTable::decode_from(&bytes)?;
            Some(table)
        } else {
            None
        };

        let run = Self {
            file,
            files: Arc::clone(&ctx.files),
            cache: Arc::clone(&ctx.cache),
            schema: ctx.schema,
            mmap,
            defunct: std::sync::atomic::AtomicBool::new(false),
            tag_lock: std::sync::Mutex::new(()),
            record_count: meta.record_count as usize,
            tombstone_count: meta.tombstone_count as usize,
            leaf_page_count: meta.leaf_page_count,
            first_leaf_page: meta.first_leaf_page,
            records_per_page: meta.records_per_page as usize,
            weight_total: meta.weight_total,
            min_key: meta.min_key,
            max_key: meta.max_key,
            index,
            key_filter,
            tombstone_filter,
            alias,
        };

        run.verify_leaf_pages()?;
        Ok(run)
    }

    fn load_filter(mmap: &Mmap, seg: SegmentHandle) -> Result<Option<Filter>, RunError> {
        if seg.len == 0 {
            return Ok(None);
        }
        let bytes = Self::segment_bytes(mmap, seg)?;
        Ok(Some(Filter::from_bytes(&bytes)?))
    }

    fn segment_bytes(mmap: &Mmap, seg: SegmentHandle) -> Result<Vec<u8>, RunError> {
        let start = seg.start_page as usize * PAGE_SIZE;
        let end = start + seg.len as usize;
        if end > mmap.len() {
            return Err(RunError::Corrupted("segment extends past file end".into()));
        }
        Ok(mmap[start..end].to_vec())
    }

    fn verify_leaf_pages(&self) -> Result<(), RunError> {
        let mut total = 0usize;
        for rel in 0..self.leaf_page_count {
            let buf = self.leaf_page(rel)?;
            page::verify(buf)?;
            total += page::slot_count(buf) as usize;
        }
        if total != self.record_count {
            return Err(RunError::Corrupted(format!(
                "leaf pages hold {total} records, metadata claims {}",
                self.record_count
            )));
        }
        Ok(())
    }

    fn leaf_page(&self, rel: u32) -> Result<&PageBuf, RunError> {
        let start = (self.first_leaf_page + rel) as usize * PAGE_SIZE;
        let end = start + PAGE_SIZE;
        if rel >= self.leaf_page_count || end > self.mmap.len() {
            return Err(RunError::Corrupted(format!("leaf page {rel} out of range")));
        }
        let slice: &[u8] = &self.mmap[start..end];
        slice
            .try_into()
            .map_err(|_| RunError::Corrupted("leaf page slice conversion failed".into()))
    }

    /// Identifier of the backing file.
    pub fn file_id(&self) -> FileId {
        self.file.id()
    }

    /// Total records, tombstones included.
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Tombstone records in this run.
    pub fn tombstone_count(&self) -> usize {
        self.tombstone_count
    }

    /// Leaf page count.
    pub fn leaf_page_count(&self) -> u32 {
        self.leaf_page_count
    }

    /// Absolute page number of the first leaf page.
    pub fn first_leaf_page(&self) -> u32 {
        self.first_leaf_page
    }

    /// Records packed per leaf page.
    pub fn records_per_page(&self) -> usize {
        self.records_per_page
    }

    /// Smallest key in the run.
    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    /// Largest key in the run.
    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    /// Sum of live-record weights; `0.0` in unweighted runs.
    pub fn weight_total(&self) -> f64 {
        self.weight_total
    }

    // --------------------------------------------------------------------------------------------
    // Sparse-index search
    // --------------------------------------------------------------------------------------------

    /// First leaf page (relative) that may hold records with key ≥ `key`.
    pub fn lower_bound(&self, key: &[u8]) -> u32 {
        let ahead = self
            .index
            .partition_point(|fk| self.schema.cmp_keys(fk, key) == std::cmp::Ordering::Less);
        // The previous page starts below `key` and may still contain it.
        ahead.saturating_sub(1) as u32
    }

    /// Last leaf page (relative) that may hold records with key ≤ `key`.
    pub fn upper_bound(&self, key: &[u8]) -> u32 {
        let through = self
            .index
            .partition_point(|fk| self.schema.cmp_keys(fk, key) != std::cmp::Ordering::Greater);
        through.saturating_sub(1) as u32
    }

    /// Absolute page band `[start, stop]` intersecting `[lo, hi]`, or
    /// `None` when the run cannot contain the range.
    pub fn page_band(&self, lo: &[u8], hi: &[u8]) -> Option<(u32, u32)> {
        if self.record_count == 0
            || self.schema.cmp_keys(hi, &self.min_key) == std::cmp::Ordering::Less
            || self.schema.cmp_keys(lo, &self.max_key) == std::cmp::Ordering::Greater
        {
            return None;
        }
        let start = self.first_leaf_page + self.lower_bound(lo);
        let stop = self.first_leaf_page + self.upper_bound(hi);
        Some((start, stop))
    }

    /// Decodes slot `slot` of a pinned leaf frame.
    ///
    /// Returns `None` for slots past the page's record count — a
    /// rejectable draw, not an error.
    pub fn read_slot(&self, frame: &PageBuf, slot: usize) -> Option<Record> {
        if slot >= page::slot_count(frame) as usize {
            return None;
        }
        let range = page::slot_range(slot, self.schema.record_len())?;
        self.schema.decode_record(&frame[range])
    }

    // --------------------------------------------------------------------------------------------
    // Point lookups
    // --------------------------------------------------------------------------------------------

    /// Cheap filter check: can this run possibly contain `key`?
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        match &self.key_filter {
            Some(filter) => filter.maybe_contains(key),
            None => true,
        }
    }

    /// Cheap filter check for a tombstone on `(key, value)`.
    pub fn maybe_has_tombstone(&self, key: &[u8], value: &[u8]) -> bool {
        if self.tombstone_count == 0 {
            return false;
        }
        match &self.tombstone_filter {
            Some(filter) => filter.maybe_contains(&tombstone_fingerprint(key, value)),
            None => true,
        }
    }

    /// Newest record for `key` with timestamp ≤ `time` (tombstones included).
    pub fn get(&self, key: &[u8], time: u64) -> Result<Option<Record>, RunError> {
        self.search(key, time, |_| true)
    }

    /// Newest tombstone for `(key, value)` with timestamp ≤ `time`.
    pub fn get_tombstone(
        &self,
        key: &[u8],
        value: &[u8],
        time: u64,
    ) -> Result<Option<Record>, RunError> {
        if !self.maybe_has_tombstone(key, value) {
            return Ok(None);
        }
        self.search(key, time, |rec| rec.tombstone && rec.value == value)
    }

    fn search(
        &self,
        key: &[u8],
        time: u64,
        accept: impl Fn(&Record) -> bool,
    ) -> Result<Option<Record>, RunError> {
        if self.record_count == 0 || !self.key_in_bounds(key) || !self.maybe_contains(key) {
            return Ok(None);
        }

        let mut newest: Option<Record> = None;
        let mut rel = self.lower_bound(key);
        while rel < self.leaf_page_count {
            if rel as usize > 0
                && self.schema.cmp_keys(&self.index[rel as usize], key)
                    == std::cmp::Ordering::Greater
            {
                break;
            }

            let pid = PageId::new(self.file.id(), self.first_leaf_page + rel);
            let frame = self.cache.pin(pid)?;
            let mut past_key = false;
            for slot in 0..page::slot_count(&frame) as usize {
                let Some(rec) = self.read_slot(&frame, slot) else {
                    continue;
                };
                match self.schema.cmp_keys(&rec.key, key) {
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Greater => {
                        past_key = true;
                        break;
                    }
                    std::cmp::Ordering::Equal => {
                        if rec.timestamp <= time
                            && accept(&rec)
                            && newest.as_ref().is_none_or(|n| rec.timestamp >= n.timestamp)
                        {
                            newest = Some(rec);
                        }
                    }
                }
            }
            if past_key {
                break;
            }
            rel += 1;
        }
        Ok(newest)
    }

    fn key_in_bounds(&self, key: &[u8]) -> bool {
        self.schema.cmp_keys(key, &self.min_key) != std::cmp::Ordering::Less
            && self.schema.cmp_keys(key, &self.max_key) != std::cmp::Ordering::Greater
    }

    // --------------------------------------------------------------------------------------------
    // Sampling
    // --------------------------------------------------------------------------------------------

    /// Record at linear `offset` from the start of `start_page`
    /// (absolute), reusing `cached` when the offset lands on the same
    /// page as the previous call.
    pub fn sample_record(
        &self,
        start_page: u32,
        offset: usize,
        cached: &mut Option<crate::pagestore::cache::PinnedFrame>,
    ) -> Result<Option<Record>, RunError> {
        let page_no = start_page + (offset / self.records_per_page) as u32;
        let slot = offset % self.records_per_page;

        let rel = page_no.checked_sub(self.first_leaf_page);
        if rel.is_none_or(|r| r >= self.leaf_page_count) {
            return Ok(None);
        }

        let pid = PageId::new(self.file.id(), page_no);
        let reusable = cached.as_ref().is_some_and(|frame| frame.page_id() == pid);
        if !reusable {
            *cached = Some(self.cache.pin(pid)?);
        }
        let frame = cached.as_ref().ok_or_else(|| {
            RunError::Corrupted("pinned frame vanished during sample_record".into())
        })?;
        Ok(self.read_slot(frame, slot))
    }

    /// One weighted draw through the run's alias table.
    ///
    /// Returns `None` when the run was built unweighted.
    pub fn sample_weighted<R: rand::Rng>(
        &self,
        rng: &mut R,
        cached: &mut Option<crate::pagestore::cache::PinnedFrame>,
    ) -> Result<Option<Record>, RunError> {
        let Some(alias) = &self.alias else {
            return Ok(None);
        };
        let idx = alias.draw(rng);
        self.sample_record(self.first_leaf_page, idx, cached)
    }

    // --------------------------------------------------------------------------------------------
    // Tag delete
    // --------------------------------------------------------------------------------------------

    /// Flips the deleted flag of the newest live `(key, value)` record
    /// with timestamp ≤ `time`, rewriting its page in place.
    pub fn tag_delete(&self, key: &[u8], value: &[u8], time: u64) -> Result<bool, RunError> {
        if self.record_count == 0 || !self.key_in_bounds(key) || !self.maybe_contains(key) {
            return Ok(false);
        }

        let _guard = self
            .tag_lock
            .lock()
            .map_err(|_| RunError::Corrupted("tag-delete lock poisoned".into()))?;

        // Locate the newest live match from the read-only map.
        let mut target: Option<(u32, usize, u64)> = None;
        let mut rel = self.lower_bound(key);
        'pages: while rel < self.leaf_page_count {
            if rel as usize > 0
                && self.schema.cmp_keys(&self.index[rel as usize], key)
                    == std::cmp::Ordering::Greater
            {
                break;
            }
            let buf = self.leaf_page(rel)?;
            for slot in 0..page::slot_count(buf) as usize {
                let Some(rec) = self.read_slot(buf, slot) else {
                    continue;
                };
                match self.schema.cmp_keys(&rec.key, key) {
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Greater => break 'pages,
                    std::cmp::Ordering::Equal => {
                        if rec.is_live()
                            && rec.timestamp <= time
                            && rec.value == value
                            && target.is_none_or(|(_, _, ts)| rec.timestamp > ts)
                        {
                            target = Some((rel, slot, rec.timestamp));
                        }
                    }
                }
            }
            rel += 1;
        }

        let Some((rel, slot, _)) = target else {
            return Ok(false);
        };

        // Rewrite the flag byte through the paged file, then refresh
        // the cache copy.
        let abs = self.first_leaf_page + rel;
        let mut buf = [0u8; PAGE_SIZE];
        self.file.read_page(abs, &mut buf)?;
        let range = page::slot_range(slot, self.schema.record_len())
            .ok_or_else(|| RunError::Corrupted("tag-delete slot out of page bounds".into()))?;
        buf[range.start + self.schema.flags_offset()] |= crate::schema::FLAG_DELETED;
        page::seal(&mut buf);
        self.file.write_page(abs, &buf)?;
        self.cache.invalidate(PageId::new(self.file.id(), abs))?;
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Scans
    // --------------------------------------------------------------------------------------------

    /// Streams every record in order from the read-only map.
    ///
    /// Leaf checksums were verified at open, so iteration is infallible.
    pub fn scan(&self) -> DiskRunScan<'_> {
        DiskRunScan {
            run: self,
            rel: 0,
            slot: 0,
        }
    }

    /// Bytes held by auxiliary structures (index, filters, alias).
    pub fn memory_utilization(&self) -> usize {
        let index: usize = self.index.iter().map(|k| k.len()).sum();
        index
            + self.key_filter.as_ref().map_or(0, Filter::memory_utilization)
            + self
                .tombstone_filter
                .as_ref()
                .map_or(0, Filter::memory_utilization)
            + self.alias.as_ref().map_or(0, AliasTable::memory_utilization)
    }

    /// Marks the backing file for removal once the last reader drops
    /// this run. Called by the owning level on truncation.
    pub fn mark_defunct(&self) {
        self.defunct
            .store(true, std::sync::atomic::Ordering::Release);
    }
}

impl Drop for DiskRun {
    fn drop(&mut self) {
        if self.defunct.load(std::sync::atomic::Ordering::Acquire) {
            if let Err(err) = self.files.remove_file(self.file.id()) {
                tracing::error!(file = self.file.id().0, %err, "failed to remove defunct run file");
            }
        }
    }
}

/// Ordered record stream over a [`DiskRun`].
pub struct DiskRunScan<'a> {
    run: &'a DiskRun,
    rel: u32,
    slot: usize,
}

impl Iterator for DiskRunScan<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        while self.rel < self.run.leaf_page_count {
            let buf = self.run.leaf_page(self.rel).ok()?;
            if self.slot < page::slot_count(buf) as usize {
                let slot = self.slot;
                self.slot += 1;
                match self.run.read_slot(buf, slot) {
                    Some(rec) => return Some(rec),
                    None => continue,
                }
            }
            self.rel += 1;
            self.slot = 0;
        }
        None
    }
}

// ------------------------------------------------------------------------------------------------
// MemoryRun
// ------------------------------------------------------------------------------------------------

/// A run held entirely in memory, for the tree's in-RAM levels.
///
/// Same sorted-immutable contract as [`DiskRun`]; tag deletes go
/// through a sidecar [`Bitmap`] instead of a page rewrite.
pub struct MemoryRun {
    records: Vec<Record>,
    deleted: Bitmap,
    tombstone_count: usize,
    weight_total: f64,
    schema: RecordSchema,
    key_filter: Option<Filter>,
    tombstone_filter: Option<Filter>,
    alias: Option<AliasTable>,
}

impl MemoryRun {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        records: Vec<Record>,
        tombstone_count: usize,
        weight_total: f64,
        schema: RecordSchema,
        key_filter: Option<Filter>,
        tombstone_filter: Option<Filter>,
        alias: Option<AliasTable>,
    ) -> Self {
        let deleted = Bitmap::new(records.len());
        for (idx, rec) in records.iter().enumerate() {
            if rec.deleted {
                deleted.set(idx);
            }
        }
        Self {
            records,
            deleted,
            tombstone_count,
            weight_total,
            schema,
            key_filter,
            tombstone_filter,
            alias,
        }
    }

    /// Sum of live-record weights; `0.0` in unweighted runs.
    pub fn weight_total(&self) -> f64 {
        self.weight_total
    }

    /// Total records, tombstones included.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Tombstone records in this run.
    pub fn tombstone_count(&self) -> usize {
        self.tombstone_count
    }

    /// Smallest key (empty slice for an empty run).
    pub fn min_key(&self) -> &[u8] {
        self.records.first().map_or(&[], |r| &r.key)
    }

    /// Largest key (empty slice for an empty run).
    pub fn max_key(&self) -> &[u8] {
        self.records.last().map_or(&[], |r| &r.key)
    }

    /// Record at `idx` with the tag-delete overlay applied.
    pub fn record(&self, idx: usize) -> Option<Record> {
        let rec = self.records.get(idx)?;
        let mut rec = rec.clone();
        rec.deleted = rec.deleted || self.deleted.get(idx);
        Some(rec)
    }

    /// Index of the first record with key ≥ `key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.records
            .partition_point(|r| self.schema.cmp_keys(&r.key, key) == std::cmp::Ordering::Less)
    }

    /// Index just past the last record with key ≤ `key`.
    pub fn upper_bound(&self, key: &[u8]) -> usize {
        self.records
            .partition_point(|r| self.schema.cmp_keys(&r.key, key) != std::cmp::Ordering::Greater)
    }

    /// Inclusive index interval intersecting `[lo, hi]`, or `None`.
    pub fn index_band(&self, lo: &[u8], hi: &[u8]) -> Option<(usize, usize)> {
        let start = self.lower_bound(lo);
        let stop = self.upper_bound(hi);
        (start < stop).then(|| (start, stop - 1))
    }

    /// Filter check mirroring [`DiskRun::maybe_contains`].
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        match &self.key_filter {
            Some(filter) => filter.maybe_contains(key),
            None => true,
        }
    }

    /// Filter check mirroring [`DiskRun::maybe_has_tombstone`].
    pub fn maybe_has_tombstone(&self, key: &[u8], value: &[u8]) -> bool {
        if self.tombstone_count == 0 {
            return false;
        }
        match &self.tombstone_filter {
            Some(filter) => filter.maybe_contains(&tombstone_fingerprint(key, value)),
            None => true,
        }
    }

    /// Newest record for `key` with timestamp ≤ `time`.
    pub fn get(&self, key: &[u8], time: u64) -> Option<Record> {
        self.search(key, time, |_| true)
    }

    /// Newest tombstone for `(key, value)` with timestamp ≤ `time`.
    pub fn get_tombstone(&self, key: &[u8], value: &[u8], time: u64) -> Option<Record> {
        if !self.maybe_has_tombstone(key, value) {
            return None;
        }
        self.search(key, time, |rec| rec.tombstone && rec.value == value)
    }

    fn search(
        &self,
        key: &[u8],
        time: u64,
        accept: impl Fn(&Record) -> bool,
    ) -> Option<Record> {
        if !self.maybe_contains(key) {
            return None;
        }
        let start = self.lower_bound(key);
        let mut newest: Option<Record> = None;
        for idx in start..self.records.len() {
            let rec = self.record(idx)?;
            if self.schema.cmp_keys(&rec.key, key) != std::cmp::Ordering::Equal {
                break;
            }
            if rec.timestamp <= time
                && accept(&rec)
                && newest.as_ref().is_none_or(|n| rec.timestamp >= n.timestamp)
            {
                newest = Some(rec);
            }
        }
        newest
    }

    /// One weighted draw through the run's alias table.
    pub fn sample_weighted<R: rand::Rng>(&self, rng: &mut R) -> Option<Record> {
        let alias = self.alias.as_ref()?;
        self.record(alias.draw(rng))
    }

    /// Marks the newest live `(key, value)` record with timestamp ≤
    /// `time` as deleted via the sidecar bitmap.
    pub fn tag_delete(&self, key: &[u8], value: &[u8], time: u64) -> bool {
        let start = self.lower_bound(key);
        let mut target: Option<(usize, u64)> = None;
        for idx in start..self.records.len() {
            let Some(rec) = self.record(idx) else { break };
            if self.schema.cmp_keys(&rec.key, key) != std::cmp::Ordering::Equal {
                break;
            }
            if rec.is_live()
                && rec.timestamp <= time
                && rec.value == value
                && target.is_none_or(|(_, ts)| rec.timestamp > ts)
            {
                target = Some((idx, rec.timestamp));
            }
        }
        match target {
            Some((idx, _)) => {
                self.deleted.set(idx);
                true
            }
            None => false,
        }
    }

    /// Streams every record in order, with the delete overlay applied.
    pub fn scan(&self) -> impl Iterator<Item = Record> + '_ {
        (0..self.records.len()).filter_map(|idx| self.record(idx))
    }

    /// Bytes held by the records and auxiliary structures.
    pub fn memory_utilization(&self) -> usize {
        self.records.len() * (self.schema.record_len() + std::mem::size_of::<Record>())
            + self.deleted.memory_utilization()
            + self.key_filter.as_ref().map_or(0, Filter::memory_utilization)
            + self
                .tombstone_filter
                .as_ref()
                .map_or(0, Filter::memory_utilization)
            + self.alias.as_ref().map_or(0, AliasTable::memory_utilization)
    }
}

// ------------------------------------------------------------------------------------------------
// Run — the shared surface
// ------------------------------------------------------------------------------------------------

/// One immutable sorted run, wherever it lives.
pub enum Run {
    /// Held in RAM by an in-memory level.
    Memory(MemoryRun),
    /// Backed by an ISAM paged file.
    Disk(DiskRun),
}

impl Run {
    /// Total records, tombstones included.
    pub fn record_count(&self) -> usize {
        match self {
            Run::Memory(r) => r.record_count(),
            Run::Disk(r) => r.record_count(),
        }
    }

    /// Tombstone records.
    pub fn tombstone_count(&self) -> usize {
        match self {
            Run::Memory(r) => r.tombstone_count(),
            Run::Disk(r) => r.tombstone_count(),
        }
    }

    /// Smallest key.
    pub fn min_key(&self) -> &[u8] {
        match self {
            Run::Memory(r) => r.min_key(),
            Run::Disk(r) => r.min_key(),
        }
    }

    /// Largest key.
    pub fn max_key(&self) -> &[u8] {
        match self {
            Run::Memory(r) => r.max_key(),
            Run::Disk(r) => r.max_key(),
        }
    }

    /// True for RAM-resident runs.
    pub fn is_memory_resident(&self) -> bool {
        matches!(self, Run::Memory(_))
    }

    /// Backing file id, for disk runs.
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            Run::Memory(_) => None,
            Run::Disk(r) => Some(r.file_id()),
        }
    }

    /// Sum of live-record weights; `0.0` in unweighted runs.
    pub fn weight_total(&self) -> f64 {
        match self {
            Run::Memory(r) => r.weight_total(),
            Run::Disk(r) => r.weight_total(),
        }
    }

    /// One weighted draw through the run's alias table; `None` when the
    /// run was built unweighted.
    pub fn sample_weighted<R: rand::Rng>(
        &self,
        rng: &mut R,
        cached: &mut Option<crate::pagestore::cache::PinnedFrame>,
    ) -> Result<Option<Record>, RunError> {
        match self {
            Run::Memory(r) => Ok(r.sample_weighted(rng)),
            Run::Disk(r) => r.sample_weighted(rng, cached),
        }
    }

    /// Newest record for `key` with timestamp ≤ `time`.
    pub fn get(&self, key: &[u8], time: u64) -> Result<Option<Record>, RunError> {
        match self {
            Run::Memory(r) => Ok(r.get(key, time)),
            Run::Disk(r) => r.get(key, time),
        }
    }

    /// Newest tombstone for `(key, value)` with timestamp ≤ `time`.
    pub fn get_tombstone(
        &self,
        key: &[u8],
        value: &[u8],
        time: u64,
    ) -> Result<Option<Record>, RunError> {
        match self {
            Run::Memory(r) => Ok(r.get_tombstone(key, value, time)),
            Run::Disk(r) => r.get_tombstone(key, value, time),
        }
    }

    /// In-place tag delete; see the variant methods.
    pub fn tag_delete(&self, key: &[u8], value: &[u8], time: u64) -> Result<bool, RunError> {
        match self {
            Run::Memory(r) => Ok(r.tag_delete(key, value, time)),
            Run::Disk(r) => r.tag_delete(key, value, time),
        }
    }

    /// Ordered stream of every record.
    pub fn scan(&self) -> Box<dyn Iterator<Item = Record> + '_> {
        match self {
            Run::Memory(r) => Box::new(r.scan()),
            Run::Disk(r) => Box::new(r.scan()),
        }
    }

    /// Auxiliary-structure footprint in bytes.
    pub fn memory_utilization(&self) -> usize {
        match self {
            Run::Memory(r) => r.memory_utilization(),
            Run::Disk(r) => r.memory_utilization(),
        }
    }
}
