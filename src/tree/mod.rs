//! # LSM tree coordinator
//!
//! The top of the engine: a pool of memtables with a lifecycle state
//! machine, a vector of levels under one reader/writer lock, a
//! background merge worker, and the range-sampling hot path that stitches
//! every source into one weighted draw.
//!
//! ## Write path
//!
//! Inserts stamp a monotone timestamp and land in the ACTIVE memtable.
//! When it fills, the inserter flips it to MERGING, promotes an EMPTY
//! table to ACTIVE, and hands the full table to the merge worker. The
//! worker drains it through a sorted scan and runs the cascade:
//!
//! 1. find the shallowest level that can accept the incoming records
//!    (growing a new leaf level when none can);
//! 2. from that level back up, merge each level into the one below and
//!    truncate it;
//! 3. merge the drained memtable into level 0.
//!
//! The drained table becomes EMPTY, or RETAINED while readers still pin
//! it (a detached thread retries the truncation until the pins drop).
//!
//! ## Sample path
//!
//! `range_sample` enumerates a [`SampleRange`] per source, weights them
//! by candidate-position counts, builds an alias table, and draws:
//! disk draws gather into one batched pin round, memory draws resolve
//! inline, and every rejected candidate (tombstone, boundary overshoot,
//! tag-deleted, masked by a newer tombstone) enqueues a replacement.
//! If 5k attempts pass with nothing but rejections, the range is
//! declared empty.
//!
//! ## Concurrency Model
//!
//! - The level vector is behind one `RwLock`: readers snapshot `Arc`
//!   run handles and release it; only the merge worker takes the write
//!   side, so publication is atomic with respect to readers.
//! - Memtable status lives in a small mutex-guarded vector; the ACTIVE
//!   index is an atomic read by every insert.
//! - One merge runs at a time (`merge_pending` flag); triggering is a
//!   compare-and-swap, so duplicate triggers collapse.

pub mod catalog;

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};
use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::alias::AliasTable;
use crate::level::{Level, LevelError};
use crate::memtable::{Memtable, MemtableStatus, MemtableType};
use crate::pagestore::cache::ReadCache;
use crate::pagestore::{FileId, FileManager, PAGE_CAPACITY, PageId, PageStoreError, page};
use crate::run::builder::{BuildOptions, build_run};
use crate::run::{DiskRun, Run, RunContext, RunError};
use crate::sample::{Sample, SampleRange, SampleStats};
use crate::schema::{KeyCmpFn, Record, RecordSchema, lexicographic_cmp};
use crate::tree::catalog::{Catalog, CatalogError, CatalogLevel};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// How full levels make room for incoming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// One run per level; merges rewrite it.
    Leveling,
    /// Scale-factor runs per level; merges append, compactions push down.
    Tiering,
}

/// Complete tree configuration; see each field.
#[derive(Clone)]
pub struct TreeConfig {
    /// Records per memtable (> 0).
    pub memtable_capacity: usize,
    /// Capacity growth between consecutive levels (≥ 2).
    pub scale_factor: usize,
    /// Merge policy.
    pub policy: MergePolicy,
    /// Tombstone proportion that forces a level compaction, in `(0, 1]`.
    pub max_deleted_proportion: f64,
    /// Number of levels kept in RAM before spilling to disk (≥ 0).
    pub memory_levels: usize,
    /// Build per-run key and tombstone filters.
    pub bloom_filters: bool,
    /// Target false-positive rate for those filters.
    pub bloom_fpr: f64,
    /// Delete by in-place tagging instead of tombstone records.
    pub delete_tagging: bool,
    /// Memtable implementation.
    pub memtable_type: MemtableType,
    /// Key width in bytes.
    pub key_size: usize,
    /// Value width in bytes.
    pub value_size: usize,
    /// Weight width in bytes: 0 (unweighted) or 8 (weighted sampling).
    pub weight_size: usize,
    /// Page-cache frames.
    pub cache_frames: usize,
    /// Seed for the injected random source; fixed seeds make sampling
    /// deterministic in tests.
    pub rng_seed: u64,
    /// Total order over keys.
    pub key_cmp: KeyCmpFn,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            memtable_capacity: 4096,
            scale_factor: 6,
            policy: MergePolicy::Leveling,
            max_deleted_proportion: 1.0,
            memory_levels: 0,
            bloom_filters: true,
            bloom_fpr: 0.01,
            delete_tagging: false,
            memtable_type: MemtableType::Skiplist,
            key_size: 8,
            value_size: 8,
            weight_size: 0,
            cache_frames: 1024,
            rng_seed: 0,
            key_cmp: lexicographic_cmp,
        }
    }
}

impl TreeConfig {
    fn validate(&self) -> Result<(), TreeError> {
        if self.memtable_capacity == 0 {
            return Err(TreeError::Config("memtable_capacity must be > 0".into()));
        }
        if self.scale_factor < 2 {
            return Err(TreeError::Config("scale_factor must be >= 2".into()));
        }
        if !(self.max_deleted_proportion > 0.0 && self.max_deleted_proportion <= 1.0) {
            return Err(TreeError::Config(
                "max_deleted_proportion must be in (0, 1]".into(),
            ));
        }
        if self.key_size == 0 || self.value_size == 0 {
            return Err(TreeError::Config("key and value widths must be > 0".into()));
        }
        if self.weight_size != 0 && self.weight_size != 8 {
            return Err(TreeError::Config("weight_size must be 0 or 8".into()));
        }
        if !(self.bloom_fpr > 0.0 && self.bloom_fpr < 1.0) {
            return Err(TreeError::Config("bloom_fpr must be in (0, 1)".into()));
        }
        let schema = self.schema();
        if schema.record_len() > PAGE_CAPACITY {
            return Err(TreeError::Config(format!(
                "record length {} exceeds page payload {PAGE_CAPACITY}",
                schema.record_len()
            )));
        }
        if self.cache_frames == 0 {
            return Err(TreeError::Config("cache_frames must be > 0".into()));
        }
        Ok(())
    }

    fn schema(&self) -> RecordSchema {
        RecordSchema {
            key_size: self.key_size,
            value_size: self.value_size,
            weight_size: self.weight_size,
            key_cmp: self.key_cmp,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by tree operations.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A key or value did not match the schema's fixed widths.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No memtable could accept the insert in time; back off and retry.
    #[error("tree overloaded: no memtable available for inserts")]
    Overloaded,

    /// Page store failure.
    #[error("page store error: {0}")]
    PageStore(#[from] PageStoreError),

    /// Run failure.
    #[error("run error: {0}")]
    Run(#[from] RunError),

    /// Level merge failure.
    #[error("level error: {0}")]
    Level(#[from] LevelError),

    /// Catalog persistence failure.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Contract breach (poisoned lock, impossible state).
    #[error("invariant violation: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Merge worker plumbing
// ------------------------------------------------------------------------------------------------

enum MergeTask {
    /// Drain memtable `idx` into the levels.
    Drain(usize),
    /// Stop the worker.
    Shutdown,
}

/// Memtables in the pool. Two is the steady state: one fills while the
/// other drains.
const MEMTABLE_POOL: usize = 2;

/// Insert spin budget before surfacing [`TreeError::Overloaded`].
const INSERT_SPIN_LIMIT: usize = 2_000_000;

// ------------------------------------------------------------------------------------------------
// TreeInner
// ------------------------------------------------------------------------------------------------

struct TreeInner {
    config: TreeConfig,
    ctx: Arc<RunContext>,
    data_dir: PathBuf,

    tables: Vec<Arc<Memtable>>,
    table_status: Mutex<Vec<MemtableStatus>>,
    active_idx: AtomicIsize,

    levels: RwLock<Vec<Level>>,
    clock: AtomicU64,
    rec_count: AtomicU64,

    merge_pending: AtomicBool,
    merge_tx: Sender<MergeTask>,

    rng: Mutex<StdRng>,
}

impl TreeInner {
    fn status(&self) -> Result<MutexGuard<'_, Vec<MemtableStatus>>, TreeError> {
        self.table_status
            .lock()
            .map_err(|_| TreeError::Internal("memtable status lock poisoned".into()))
    }

    fn levels_read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<Level>>, TreeError> {
        self.levels
            .read()
            .map_err(|_| TreeError::Internal("level lock poisoned".into()))
    }

    fn levels_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<Level>>, TreeError> {
        self.levels
            .write()
            .map_err(|_| TreeError::Internal("level lock poisoned".into()))
    }

    fn rng(&self) -> Result<MutexGuard<'_, StdRng>, TreeError> {
        self.rng
            .lock()
            .map_err(|_| TreeError::Internal("rng lock poisoned".into()))
    }

    /// The current ACTIVE table, if any.
    fn active_table(&self) -> Option<(usize, &Arc<Memtable>)> {
        let idx = self.active_idx.load(Ordering::Acquire);
        if idx < 0 {
            return None;
        }
        let idx = idx as usize;
        self.tables.get(idx).map(|t| (idx, t))
    }

    /// Tables readers must consult: ACTIVE first, then MERGING.
    ///
    /// RETAINED tables are already published as runs, so including them
    /// would double-count.
    fn visible_tables(&self) -> Result<Vec<Arc<Memtable>>, TreeError> {
        let status = self.status()?;
        let mut out = Vec::with_capacity(MEMTABLE_POOL);
        for (idx, s) in status.iter().enumerate() {
            if *s == MemtableStatus::Active {
                out.push(Arc::clone(&self.tables[idx]));
            }
        }
        for (idx, s) in status.iter().enumerate() {
            if *s == MemtableStatus::Merging {
                out.push(Arc::clone(&self.tables[idx]));
            }
        }
        Ok(out)
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    fn write_record(&self, rec: Record) -> Result<(), TreeError> {
        let mut spins = 0usize;
        loop {
            if let Some((idx, table)) = self.active_table() {
                if table.insert(rec.clone()) {
                    self.rec_count.fetch_add(1, Ordering::Relaxed);
                    if table.is_full() {
                        self.trigger_merge(idx)?;
                    }
                    return Ok(());
                }
                // Full table: kick the merge and wait for the switch.
                self.trigger_merge(idx)?;
            }

            spins += 1;
            if spins > INSERT_SPIN_LIMIT {
                return Err(TreeError::Overloaded);
            }
            if spins % 64 == 0 {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Queues a drain of table `idx` if it is still ACTIVE and no merge
    /// is in flight.
    fn trigger_merge(&self, idx: usize) -> Result<(), TreeError> {
        {
            let status = self.status()?;
            if status[idx] != MemtableStatus::Active {
                return Ok(());
            }
        }
        if self
            .merge_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let still_active = { self.status()?[idx] == MemtableStatus::Active };
            if still_active {
                if self.merge_tx.send(MergeTask::Drain(idx)).is_err() {
                    self.merge_pending.store(false, Ordering::Release);
                    return Err(TreeError::Internal("merge worker is gone".into()));
                }
            } else {
                self.merge_pending.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Drains memtable `idx` into the levels. Runs on the merge worker
    /// (or the caller's thread for `flush`).
    fn merge_memtable(inner: &Arc<TreeInner>, idx: usize) -> Result<(), TreeError> {
        {
            let mut status = inner.status()?;
            if status[idx] != MemtableStatus::Active {
                return Ok(());
            }
            status[idx] = MemtableStatus::Merging;
            inner.active_idx.store(-1, Ordering::Release);
        }

        // Promote an EMPTY table so inserts resume while we drain.
        loop {
            {
                let mut status = inner.status()?;
                if let Some(j) = status.iter().position(|s| *s == MemtableStatus::Empty) {
                    status[j] = MemtableStatus::Active;
                    inner.active_idx.store(j as isize, Ordering::Release);
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let table = Arc::clone(&inner.tables[idx]);
        table.seal_for_drain();
        let records = table.sorted_scan();
        let incoming = records.len();

        if incoming > 0 {
            let mut levels = inner.levels_write()?;
            inner.cascade(&mut levels, records)?;
            debug!(
                drained = incoming,
                depth = levels.len(),
                "memtable merged into the tree"
            );
        }

        // Retire the drained table: EMPTY immediately, or RETAINED
        // until the last reader pin drops.
        {
            inner.status()?[idx] = MemtableStatus::Retained;
        }
        if table.truncate() {
            inner.status()?[idx] = MemtableStatus::Empty;
        } else {
            let inner = Arc::clone(inner);
            std::thread::spawn(move || {
                while !inner.tables[idx].truncate() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                if let Ok(mut status) = inner.table_status.lock() {
                    status[idx] = MemtableStatus::Empty;
                }
            });
        }
        Ok(())
    }

    /// The merge-down cascade over a drained, sorted record set.
    fn cascade(&self, levels: &mut Vec<Level>, records: Vec<Record>) -> Result<(), TreeError> {
        let incoming = records.len();

        let mut merge_idx = None;
        let mut need = incoming;
        for (i, level) in levels.iter().enumerate() {
            if level.can_merge_with(need) {
                merge_idx = Some(i);
                break;
            }
            need = level.record_count();
        }
        let merge_idx = match merge_idx {
            Some(i) => i,
            None => self.grow(levels),
        };

        let bottom = levels.len() - 1;
        for i in (1..=merge_idx).rev() {
            let (upper, lower) = levels.split_at_mut(i);
            lower[0].merge_with_level(&upper[i - 1], i == bottom)?;
            upper[i - 1].truncate();
        }
        levels[0].merge_with_sorted(records, bottom == 0)?;
        Ok(())
    }

    /// Appends a new leaf level sized from the current deepest one.
    fn grow(&self, levels: &mut Vec<Level>) -> usize {
        let scale = self.config.scale_factor;
        let record_capacity = match levels.last() {
            None => self.config.memtable_capacity * scale,
            Some(last) => last.record_capacity() * scale,
        };
        let run_capacity = match self.config.policy {
            MergePolicy::Leveling => 1,
            MergePolicy::Tiering => scale,
        };
        let memory_resident = levels.len() < self.config.memory_levels;

        info!(
            depth = levels.len(),
            record_capacity, run_capacity, memory_resident, "growing a new level"
        );
        levels.push(Level::new(
            run_capacity,
            record_capacity,
            Arc::clone(&self.ctx),
            self.config.max_deleted_proportion,
            self.config.bloom_filters,
            memory_resident,
        ));
        levels.len() - 1
    }

    // --------------------------------------------------------------------------------------------
    // Rejection checks
    // --------------------------------------------------------------------------------------------

    /// True iff a tombstone anywhere in the tree masks `rec` (same key
    /// and value, timestamp at or after the record's).
    fn tombstone_masks(&self, rec: &Record) -> Result<bool, TreeError> {
        for table in self.visible_tables()? {
            if table.has_masking_tombstone(&rec.key, &rec.value, rec.timestamp) {
                return Ok(true);
            }
        }
        let levels = self.levels_read()?;
        for level in levels.iter() {
            if let Some(tomb) = level.get_tombstone(&rec.key, &rec.value, u64::MAX)? {
                if tomb.timestamp >= rec.timestamp {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Accepts or rejects one sampled candidate.
    fn accept_sample(
        &self,
        rec: Option<Record>,
        lo: &[u8],
        hi: &[u8],
    ) -> Result<Option<Record>, TreeError> {
        let Some(rec) = rec else { return Ok(None) };
        if rec.tombstone || rec.deleted {
            return Ok(None);
        }
        if !self.ctx.schema.key_in_range(&rec.key, lo, hi) {
            return Ok(None);
        }
        if !self.config.delete_tagging && self.tombstone_masks(&rec)? {
            return Ok(None);
        }
        Ok(Some(rec))
    }

    /// One alias draw: memory draws bump their range's counter, disk
    /// draws enqueue a page for the next batch pin.
    fn enqueue_draw(
        &self,
        alias: &AliasTable,
        ranges: &[SampleRange],
        pending: &mut Vec<(usize, PageId)>,
        mem_counts: &mut [usize],
    ) -> Result<(), TreeError> {
        let mut rng = self.rng()?;
        let idx = alias.draw(&mut *rng);
        if ranges[idx].is_memory_resident() {
            mem_counts[idx] += 1;
        } else if let Some(pid) = ranges[idx].draw_page(&mut *rng) {
            pending.push((idx, pid));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// LsmTree — public handle
// ------------------------------------------------------------------------------------------------

/// The public tree handle.
///
/// Owns the background merge worker; dropping the handle shuts the
/// worker down (without flushing — call [`LsmTree::persist`] first for
/// durability).
pub struct LsmTree {
    inner: Arc<TreeInner>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl LsmTree {
    /// Creates a new, empty tree rooted at `path`.
    pub fn create(path: impl AsRef<Path>, config: TreeConfig) -> Result<Self, TreeError> {
        config.validate()?;
        Self::build(path.as_ref(), config, None)
    }

    /// Reopens a tree previously saved with [`LsmTree::persist`].
    pub fn reopen(path: impl AsRef<Path>, config: TreeConfig) -> Result<Self, TreeError> {
        config.validate()?;
        if !Catalog::exists(path.as_ref()) {
            return Err(TreeError::Catalog(CatalogError::Corrupted(
                "no catalog snapshot in the data directory".into(),
            )));
        }
        let catalog = Catalog::load(path.as_ref())?;
        Self::build(path.as_ref(), config, Some(catalog))
    }

    fn build(
        path: &Path,
        config: TreeConfig,
        catalog: Option<Catalog>,
    ) -> Result<Self, TreeError> {
        let files = Arc::new(FileManager::new(path)?);
        let cache = Arc::new(ReadCache::new(config.cache_frames, Arc::clone(&files)));
        let ctx = Arc::new(RunContext {
            files,
            cache,
            schema: config.schema(),
            bloom_fpr: config.bloom_fpr,
        });

        let tables: Vec<Arc<Memtable>> = (0..MEMTABLE_POOL)
            .map(|_| {
                Arc::new(Memtable::new(
                    config.memtable_type,
                    config.memtable_capacity,
                    ctx.schema,
                ))
            })
            .collect();
        let mut status = vec![MemtableStatus::Empty; MEMTABLE_POOL];
        status[0] = MemtableStatus::Active;

        let (merge_tx, merge_rx) = unbounded();

        let inner = Arc::new(TreeInner {
            rng: Mutex::new(StdRng::seed_from_u64(config.rng_seed)),
            config,
            ctx,
            data_dir: path.to_path_buf(),
            tables,
            table_status: Mutex::new(status),
            active_idx: AtomicIsize::new(0),
            levels: RwLock::new(Vec::new()),
            clock: AtomicU64::new(1),
            rec_count: AtomicU64::new(0),
            merge_pending: AtomicBool::new(false),
            merge_tx,
        });

        if let Some(catalog) = catalog {
            Self::restore(&inner, catalog)?;
        } else {
            info!(dir = %inner.data_dir.display(), "created empty tree");
        }

        let worker = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("sampledb-merge".into())
                .spawn(move || Self::merge_worker(inner, merge_rx))
                .map_err(|e| TreeError::Internal(format!("failed to spawn merge worker: {e}")))?
        };

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn merge_worker(inner: Arc<TreeInner>, rx: Receiver<MergeTask>) {
        for task in rx.iter() {
            match task {
                MergeTask::Drain(idx) => {
                    if let Err(err) = TreeInner::merge_memtable(&inner, idx) {
                        // The table stays MERGING: readable, never
                        // truncated, excluded from further merges.
                        error!(table = idx, %err, "memtable merge failed");
                    }
                    inner.merge_pending.store(false, Ordering::Release);
                }
                MergeTask::Shutdown => break,
            }
        }
    }

    fn restore(inner: &Arc<TreeInner>, catalog: Catalog) -> Result<(), TreeError> {
        inner.clock.store(catalog.clock, Ordering::Release);
        inner
            .rec_count
            .store(catalog.record_count, Ordering::Release);

        // Remove run files the catalog does not reference — leftovers
        // from merges or re-persists that raced the previous shutdown.
        let referenced: std::collections::HashSet<u32> = catalog
            .levels
            .iter()
            .flat_map(|l| l.files.iter().copied())
            .collect();
        for entry in std::fs::read_dir(&inner.data_dir).map_err(PageStoreError::from)? {
            let entry = entry.map_err(PageStoreError::from)?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|s| s.strip_prefix("run-"))
                .and_then(|s| s.strip_suffix(".pages"))
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if !referenced.contains(&id) {
                std::fs::remove_file(entry.path()).map_err(PageStoreError::from)?;
            }
        }

        let mut levels = Vec::with_capacity(catalog.levels.len());
        for meta in catalog.levels {
            let mut level = Level::new(
                meta.run_capacity as usize,
                meta.record_capacity as usize,
                Arc::clone(&inner.ctx),
                inner.config.max_deleted_proportion,
                inner.config.bloom_filters,
                meta.memory_resident,
            );
            for raw_id in meta.files {
                let file = inner.ctx.files.open_file(FileId(raw_id))?;
                let disk = DiskRun::open(file, &inner.ctx)?;
                if meta.memory_resident {
                    // Rebuild the RAM run and retire the spill file.
                    let expected = disk.record_count();
                    let run = build_run(
                        &inner.ctx,
                        vec![Box::new(disk.scan())],
                        &BuildOptions {
                            expected_records: expected,
                            bloom_filters: inner.config.bloom_filters,
                            purge_tombstones: false,
                            memory_resident: true,
                        },
                    )?;
                    disk.mark_defunct();
                    drop(disk);
                    level.emplace_run(Arc::new(run))?;
                } else {
                    level.emplace_run(Arc::new(Run::Disk(disk)))?;
                }
            }
            levels.push(level);
        }

        let depth = levels.len();
        *inner.levels_write()? = levels;
        info!(
            depth,
            records = catalog.record_count,
            "reopened tree from catalog"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts a record with unit weight.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), TreeError> {
        self.insert_weighted(key, value, 1.0)
    }

    /// Inserts a record with an explicit sampling weight.
    ///
    /// The weight only matters for trees configured with
    /// `weight_size == 8`; unweighted schemas store nothing and report
    /// `1.0` on read.
    pub fn insert_weighted(&self, key: &[u8], value: &[u8], weight: f64) -> Result<(), TreeError> {
        self.check_widths(key, value)?;
        if !(weight.is_finite() && weight >= 0.0) {
            return Err(TreeError::InvalidArgument(
                "weight must be finite and non-negative".into(),
            ));
        }
        let ts = self.inner.clock.fetch_add(1, Ordering::SeqCst);
        self.inner
            .write_record(Record::new(key.to_vec(), value.to_vec(), weight, ts))
    }

    /// Deletes `(key, value)`.
    ///
    /// In tombstone mode a cancelling record is written and `Ok(true)`
    /// returned. In tagging mode the live record is flag-flipped in
    /// place; `Ok(false)` means no live match was found.
    pub fn delete(&self, key: &[u8], value: &[u8]) -> Result<bool, TreeError> {
        self.check_widths(key, value)?;

        if self.inner.config.delete_tagging {
            let now = self.inner.clock.load(Ordering::SeqCst);
            for table in self.inner.visible_tables()? {
                if table.tag_delete(key, value, now) {
                    return Ok(true);
                }
            }
            let levels = self.inner.levels_read()?;
            for level in levels.iter() {
                if level.tag_delete(key, value, now)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        let ts = self.inner.clock.fetch_add(1, Ordering::SeqCst);
        self.inner
            .write_record(Record::new_tombstone(key.to_vec(), value.to_vec(), ts))?;
        Ok(true)
    }

    /// Replaces `(key, old_value)` with `(key, new_value)`.
    pub fn update(
        &self,
        key: &[u8],
        old_value: &[u8],
        new_value: &[u8],
    ) -> Result<bool, TreeError> {
        if !self.delete(key, old_value)? {
            return Ok(false);
        }
        self.insert(key, new_value)?;
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Newest record for `key` with timestamp ≤ `timestamp` (`None` =
    /// now). Tombstoned and tag-deleted keys read as absent.
    pub fn get(&self, key: &[u8], timestamp: Option<u64>) -> Result<Option<Record>, TreeError> {
        if key.len() != self.inner.config.key_size {
            return Err(TreeError::InvalidArgument("key width mismatch".into()));
        }
        let time = timestamp.unwrap_or(u64::MAX);

        for table in self.inner.visible_tables()? {
            if let Some(rec) = table.get(key, time) {
                if rec.tombstone || rec.deleted {
                    return Ok(None);
                }
                return Ok(Some(rec));
            }
        }

        let levels = self.inner.levels_read()?;
        for level in levels.iter() {
            if let Some(rec) = level.get(key, time)? {
                if rec.tombstone || rec.deleted {
                    return Ok(None);
                }
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    /// True iff a tombstone for `(key, value)` with timestamp ≤
    /// `timestamp` (`None` = now) exists anywhere in the tree.
    pub fn has_tombstone(
        &self,
        key: &[u8],
        value: &[u8],
        timestamp: Option<u64>,
    ) -> Result<bool, TreeError> {
        self.check_widths(key, value)?;
        let time = timestamp.unwrap_or(u64::MAX);

        for table in self.inner.visible_tables()? {
            if table.has_tombstone(key, value, time) {
                return Ok(true);
            }
        }
        let levels = self.inner.levels_read()?;
        for level in levels.iter() {
            if level.get_tombstone(key, value, time)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // --------------------------------------------------------------------------------------------
    // Range sampling
    // --------------------------------------------------------------------------------------------

    /// Draws `sample_size` records uniformly with replacement from the
    /// live records with keys in `[lo, hi]`.
    ///
    /// Returns `Ok(None)` when the range holds nothing sampleable (or
    /// `lo > hi`); `Ok(Some(vec![]))` for `sample_size == 0`.
    pub fn range_sample(
        &self,
        lo: &[u8],
        hi: &[u8],
        sample_size: usize,
    ) -> Result<Option<Vec<Record>>, TreeError> {
        let mut stats = SampleStats::default();
        self.range_sample_with_stats(lo, hi, sample_size, &mut stats)
    }

    /// [`range_sample`](Self::range_sample) with attempt/rejection
    /// counters reported through `stats`.
    pub fn range_sample_with_stats(
        &self,
        lo: &[u8],
        hi: &[u8],
        sample_size: usize,
        stats: &mut SampleStats,
    ) -> Result<Option<Vec<Record>>, TreeError> {
        *stats = SampleStats::default();

        if lo.len() != self.inner.config.key_size || hi.len() != self.inner.config.key_size {
            return Err(TreeError::InvalidArgument("key width mismatch".into()));
        }
        if self.inner.ctx.schema.cmp_keys(lo, hi) == std::cmp::Ordering::Greater {
            return Ok(None);
        }
        if sample_size == 0 {
            return Ok(Some(Vec::new()));
        }

        // 1. One sample range per source. Memtable ranges pin their
        //    table; run ranges hold their run alive via `Arc`.
        let mut ranges: Vec<SampleRange> = Vec::new();
        for table in self.inner.visible_tables()? {
            if table.is_rejection() {
                let window = table.rejection_window();
                if window > 0 {
                    ranges.push(SampleRange::MemtableRejection {
                        pin: Memtable::pin(&table),
                        window,
                    });
                }
            } else {
                let records = table.collect_range(lo, hi);
                if !records.is_empty() {
                    ranges.push(SampleRange::Memtable {
                        pin: Memtable::pin(&table),
                        records,
                    });
                }
            }
        }
        {
            let levels = self.inner.levels_read()?;
            for level in levels.iter() {
                for run in level.runs() {
                    match run.as_ref() {
                        Run::Memory(mem) => {
                            if let Some((start, stop)) = mem.index_band(lo, hi) {
                                ranges.push(SampleRange::MemoryRun {
                                    run: Arc::clone(run),
                                    start,
                                    stop,
                                });
                            }
                        }
                        Run::Disk(disk) => {
                            if let Some((start_page, stop_page)) = disk.page_band(lo, hi) {
                                ranges.push(SampleRange::DiskRun {
                                    run: Arc::clone(run),
                                    start_page,
                                    stop_page,
                                });
                            }
                        }
                    }
                }
            }
        }

        // 2–3. Weight by candidate positions and build the alias table.
        let lengths: Vec<usize> = ranges.iter().map(SampleRange::length).collect();
        let total: usize = lengths.iter().sum();
        if total == 0 {
            return Ok(None);
        }
        let weights: Vec<f64> = lengths.iter().map(|&l| l as f64 / total as f64).collect();
        let alias = AliasTable::build(&weights);

        // 4. Schedule the initial draws.
        let mut sample = Sample::new(sample_size);
        let mut pending: Vec<(usize, PageId)> = Vec::with_capacity(sample_size);
        let mut mem_counts = vec![0usize; ranges.len()];
        for _ in 0..sample_size {
            self.inner
                .enqueue_draw(&alias, &ranges, &mut pending, &mut mem_counts)?;
        }

        let mut attempts = 0usize;
        let mut rejections = 0usize;

        // A batch must never pin more frames than the cache can hold —
        // the rejection check pins pages of its own while the batch is
        // still held, so leave half the pool free.
        let max_batch = (self.inner.ctx.cache.capacity() / 2).max(1);

        // 5–7. Resolve draws, reject, replace, repeat.
        while !sample.is_full() {
            // One batched disk round.
            let take = pending.len().min(max_batch);
            let batch: Vec<(usize, PageId)> = pending.drain(..take).collect();
            if !batch.is_empty() {
                let ids: Vec<PageId> = batch.iter().map(|(_, pid)| *pid).collect();
                let frames = self.inner.ctx.cache.pin_batch(&ids)?;
                for ((range_idx, _), frame) in batch.iter().zip(frames.iter()) {
                    if sample.is_full() {
                        break;
                    }
                    attempts += 1;
                    // Draw over the page's formatted capacity, not its
                    // occupied slots: the range weighted pages × slots-
                    // per-page candidate positions, so empty slots must
                    // stay in the draw space and reject, or records on
                    // partial boundary pages would be oversampled.
                    let rec = {
                        let slots = page::max_slots(frame) as usize;
                        if slots == 0 {
                            None
                        } else {
                            let slot = {
                                let mut rng = self.inner.rng()?;
                                use rand::Rng;
                                rng.random_range(0..slots)
                            };
                            ranges[*range_idx]
                                .disk_run()
                                .and_then(|disk| disk.read_slot(frame, slot))
                        }
                    };
                    match self.inner.accept_sample(rec, lo, hi)? {
                        Some(rec) => sample.add(rec),
                        None => {
                            rejections += 1;
                            self.inner
                                .enqueue_draw(&alias, &ranges, &mut pending, &mut mem_counts)?;
                        }
                    }
                }
            }

            // Inline memory draws.
            for idx in 0..ranges.len() {
                let n = std::mem::take(&mut mem_counts[idx]);
                for _ in 0..n {
                    if sample.is_full() {
                        break;
                    }
                    attempts += 1;
                    let rec = {
                        let mut rng = self.inner.rng()?;
                        ranges[idx].draw_memory(&mut *rng)
                    };
                    match self.inner.accept_sample(rec, lo, hi)? {
                        Some(rec) => sample.add(rec),
                        None => {
                            rejections += 1;
                            self.inner
                                .enqueue_draw(&alias, &ranges, &mut pending, &mut mem_counts)?;
                        }
                    }
                }
            }

            if sample.is_full() {
                break;
            }

            // Anti-starvation: a range full of nothing but rejectable
            // positions must not spin forever.
            if attempts > 5 * sample_size && rejections == attempts {
                stats.attempts = attempts;
                stats.rejections = rejections;
                return Ok(None);
            }

            // Outstanding draws should always cover the deficit; top up
            // if a race drained them.
            if pending.is_empty() && mem_counts.iter().all(|&c| c == 0) {
                for _ in sample.len()..sample_size {
                    self.inner
                        .enqueue_draw(&alias, &ranges, &mut pending, &mut mem_counts)?;
                }
            }
        }

        stats.attempts = attempts;
        stats.rejections = rejections;
        Ok(Some(sample.into_records()))
    }

    /// Draws `sample_size` records from the whole tree with probability
    /// proportional to record weight.
    ///
    /// Requires a weighted schema (`weight_size == 8`): weighted runs
    /// carry persistent alias tables, and memtable contents get a
    /// transient one. Returns fewer records when the tree holds no
    /// positive weight.
    pub fn weighted_sample(&self, sample_size: usize) -> Result<Vec<Record>, TreeError> {
        if !self.inner.ctx.schema.weighted() {
            return Err(TreeError::InvalidArgument(
                "tree was not configured for weighted sampling (weight_size == 0)".into(),
            ));
        }

        enum Source {
            Table { records: Vec<Record>, alias: AliasTable },
            Run(Arc<Run>),
        }

        let mut sources = Vec::new();
        let mut totals = Vec::new();
        for table in self.inner.visible_tables()? {
            let records = table.sorted_scan();
            let weights: Vec<f64> = records
                .iter()
                .map(|r| if r.is_live() { r.weight } else { 0.0 })
                .collect();
            let total: f64 = weights.iter().sum();
            if total > 0.0 {
                sources.push(Source::Table {
                    records,
                    alias: AliasTable::build(&weights),
                });
                totals.push(total);
            }
        }
        {
            let levels = self.inner.levels_read()?;
            for level in levels.iter() {
                for run in level.runs() {
                    let total = run.weight_total();
                    if total > 0.0 {
                        sources.push(Source::Run(Arc::clone(run)));
                        totals.push(total);
                    }
                }
            }
        }

        if sources.is_empty() {
            return Ok(Vec::new());
        }
        let across = AliasTable::build(&totals);

        let mut out = Vec::with_capacity(sample_size);
        let mut cached = None;
        let mut attempts = 0usize;
        while out.len() < sample_size {
            attempts += 1;
            if attempts > 5 * sample_size + 100 {
                break;
            }
            let idx = {
                let mut rng = self.inner.rng()?;
                across.draw(&mut *rng)
            };
            let rec = match &sources[idx] {
                Source::Table { records, alias } => {
                    let mut rng = self.inner.rng()?;
                    records.get(alias.draw(&mut *rng)).cloned()
                }
                Source::Run(run) => {
                    let mut rng = self.inner.rng()?;
                    run.sample_weighted(&mut *rng, &mut cached)?
                }
            };
            if let Some(rec) = rec {
                if rec.is_live() {
                    out.push(rec);
                }
            }
        }
        Ok(out)
    }

    /// Every record currently reachable — memtables plus all runs.
    ///
    /// No global ordering and no version collapsing: superseded
    /// versions and tombstones all appear. Intended for verification
    /// and debugging, not the read path.
    pub fn scan_all(&self) -> Result<Vec<Record>, TreeError> {
        let mut out = Vec::new();
        for table in self.inner.visible_tables()? {
            out.extend(table.sorted_scan());
        }
        let levels = self.inner.levels_read()?;
        for level in levels.iter() {
            for run in level.runs() {
                out.extend(run.scan());
            }
        }
        Ok(out)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance and introspection
    // --------------------------------------------------------------------------------------------

    /// Synchronously drains the ACTIVE memtable into the levels.
    ///
    /// Waits for any in-flight background merge first.
    pub fn flush(&self) -> Result<(), TreeError> {
        while self
            .inner
            .merge_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::thread::sleep(Duration::from_millis(1));
        }

        let result = (|| {
            let idx = self.inner.active_idx.load(Ordering::Acquire);
            if idx >= 0 && self.inner.tables[idx as usize].record_count() > 0 {
                TreeInner::merge_memtable(&self.inner, idx as usize)?;
            }
            Ok(())
        })();
        self.inner.merge_pending.store(false, Ordering::Release);
        result
    }

    /// Flushes, spills in-memory levels, and writes the catalog
    /// snapshot so [`LsmTree::reopen`] can rebuild this tree.
    pub fn persist(&self) -> Result<(), TreeError> {
        self.flush()?;

        let levels = self.inner.levels_read()?;
        let mut catalog_levels = Vec::with_capacity(levels.len());
        for level in levels.iter() {
            let mut files = Vec::with_capacity(level.run_count());
            for run in level.runs() {
                match run.as_ref() {
                    Run::Disk(disk) => files.push(disk.file_id().0),
                    Run::Memory(mem) => {
                        // Spill the RAM run to its own file; reopen
                        // rebuilds it in memory and retires the spill.
                        let spilled = build_run(
                            &self.inner.ctx,
                            vec![Box::new(mem.scan())],
                            &BuildOptions {
                                expected_records: mem.record_count(),
                                bloom_filters: self.inner.config.bloom_filters,
                                purge_tombstones: false,
                                memory_resident: false,
                            },
                        )?;
                        if let Run::Disk(disk) = &spilled {
                            files.push(disk.file_id().0);
                        }
                    }
                }
            }
            catalog_levels.push(CatalogLevel {
                run_capacity: level.run_capacity() as u64,
                record_capacity: level.record_capacity() as u64,
                memory_resident: level.is_memory_resident(),
                files,
            });
        }

        Catalog {
            clock: self.inner.clock.load(Ordering::Acquire),
            record_count: self.inner.rec_count.load(Ordering::Acquire),
            levels: catalog_levels,
        }
        .save(&self.inner.data_dir)?;

        info!(dir = %self.inner.data_dir.display(), "persisted tree catalog");
        Ok(())
    }

    /// Number of levels (the deepest may be partially filled).
    pub fn depth(&self) -> usize {
        self.inner.levels_read().map(|l| l.len()).unwrap_or(0)
    }

    /// Total records in the tree, tombstones and masked versions
    /// included.
    pub fn record_count(&self) -> u64 {
        self.inner.rec_count.load(Ordering::Relaxed)
    }

    /// Records currently resident at level `idx`.
    pub fn level_record_count(&self, idx: usize) -> usize {
        self.inner
            .levels_read()
            .map(|l| l.get(idx).map_or(0, Level::record_count))
            .unwrap_or(0)
    }

    /// Bytes used by auxiliary structures across memtables and levels.
    pub fn memory_utilization(&self) -> usize {
        let mut total: usize = self.inner.tables.iter().map(|t| t.memory_utilization()).sum();
        if let Ok(levels) = self.inner.levels_read() {
            for (idx, level) in levels.iter().enumerate() {
                let util = level.memory_utilization();
                debug!(level = idx, bytes = util, "level auxiliary memory");
                total += util;
            }
        }
        total
    }

    /// The shared page cache, exposed for instrumentation (miss and
    /// I/O-time counters with resets).
    pub fn cache(&self) -> &ReadCache {
        &self.inner.ctx.cache
    }

    /// The record schema this tree was configured with.
    pub fn schema(&self) -> RecordSchema {
        self.inner.ctx.schema
    }

    fn check_widths(&self, key: &[u8], value: &[u8]) -> Result<(), TreeError> {
        if key.len() != self.inner.config.key_size {
            return Err(TreeError::InvalidArgument(format!(
                "key is {} bytes, schema expects {}",
                key.len(),
                self.inner.config.key_size
            )));
        }
        if value.len() != self.inner.config.value_size {
            return Err(TreeError::InvalidArgument(format!(
                "value is {} bytes, schema expects {}",
                value.len(),
                self.inner.config.value_size
            )));
        }
        Ok(())
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        let _ = self.inner.merge_tx.send(MergeTask::Shutdown);
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}
