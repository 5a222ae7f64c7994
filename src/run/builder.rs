//! Run construction from sorted record streams.
//!
//! [`build_run`] consumes any number of sorted inputs through the k-way
//! [`MergeIterator`](super::merge::MergeIterator), applies deduplication
//! (and, at the bottom level, tombstone cancellation), and emits one new
//! run — paged to disk or collected in memory — populating the sparse
//! index, the filters, and the alias table in a single pass.
//!
//! # Input Requirements
//!
//! - Every input iterator must be sorted by the schema's record order
//!   `(key asc, timestamp asc, tombstone first)`.
//! - `expected_records` sizes the filters; it is an upper bound, not a
//!   promise — cancellation legitimately shrinks the output.
//!
//! # Output Guarantees
//!
//! - Exact duplicates by `(key, timestamp, tombstone)` collapse to one.
//! - With `purge_tombstones`, a tombstone cancels the newest record
//!   carrying the same key and value with timestamp ≤ the tombstone's,
//!   and neither side is emitted; tag-deleted records are dropped too.
//! - Disk runs come back through [`DiskRun::open`], so every page
//!   checksum and metadata field is verified before the run is
//!   published.

use std::collections::VecDeque;
use std::iter::Peekable;
use std::sync::Arc;

use tracing::debug;

use super::merge::MergeIterator;
use super::{
    DiskRun, MemoryRun, Run, RunContext, RunError, RunMeta, SegmentHandle, records_per_page,
};
use crate::alias::AliasTable;
use crate::bloom::{Filter, tombstone_fingerprint};
use crate::encoding;
use crate::pagestore::{PAGE_SIZE, PageBuf, PagedFile, page};
use crate::schema::{Record, RecordSchema};

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Per-build switches; everything else comes from [`RunContext`].
pub struct BuildOptions {
    /// Upper bound on output records (sizes the filters).
    pub expected_records: usize,
    /// Build key / tombstone filters.
    pub bloom_filters: bool,
    /// Bottom-level semantics: cancel tombstone/record pairs and drop
    /// tag-deleted records instead of emitting them.
    pub purge_tombstones: bool,
    /// Collect the run in RAM instead of paging it out.
    pub memory_resident: bool,
}

// ------------------------------------------------------------------------------------------------
// Entry point
// ------------------------------------------------------------------------------------------------

/// Merges `inputs` into one new run.
pub fn build_run<'a>(
    ctx: &RunContext,
    inputs: Vec<Box<dyn Iterator<Item = Record> + 'a>>,
    opts: &BuildOptions,
) -> Result<Run, RunError> {
    let merged = MergeIterator::new(inputs, ctx.schema);
    let stream = GroupProcessor::new(merged, ctx.schema, opts.purge_tombstones);

    if opts.memory_resident {
        build_memory(ctx, stream, opts)
    } else {
        build_disk(ctx, stream, opts)
    }
}

fn build_memory(
    ctx: &RunContext,
    stream: impl Iterator<Item = Record>,
    opts: &BuildOptions,
) -> Result<Run, RunError> {
    let mut acc = Accumulator::new(ctx, opts)?;
    let mut records = Vec::with_capacity(opts.expected_records);
    for rec in stream {
        acc.observe(&rec);
        records.push(rec);
    }

    debug!(
        records = records.len(),
        tombstones = acc.tombstones,
        "built memory-resident run"
    );

    let tombstone_count = acc.tombstones;
    let weight_total = acc.weight_total;
    let (key_filter, tombstone_filter, alias) = acc.finish();
    Ok(Run::Memory(MemoryRun::from_parts(
        records,
        tombstone_count,
        weight_total,
        ctx.schema,
        key_filter,
        tombstone_filter,
        alias,
    )))
}

fn build_disk(
    ctx: &RunContext,
    stream: impl Iterator<Item = Record>,
    opts: &BuildOptions,
) -> Result<Run, RunError> {
    let file = ctx.files.create_file()?;
    let meta_page = file.allocate();
    debug_assert_eq!(meta_page, 0);

    let rpp = records_per_page(&ctx.schema);
    if rpp == 0 {
        return Err(RunError::Corrupted(
            "record length exceeds page payload capacity".into(),
        ));
    }

    let mut acc = Accumulator::new(ctx, opts)?;
    let mut writer = LeafWriter::new(&file, ctx.schema, rpp);

    for rec in stream {
        acc.observe(&rec);
        writer.push(&rec)?;
    }
    let (leaf_page_count, index) = writer.finish()?;

    // Segments land after the leaves; page numbers stay monotone.
    let mut index_bytes = Vec::new();
    encoding::encode_vec(&index, &mut index_bytes)?;
    let index_seg = write_segment(&file, &index_bytes)?;

    let record_count = acc.count;
    let tombstone_count = acc.tombstones;
    let weight_total = acc.weight_total;
    let min_key = acc.min_key.clone().unwrap_or_default();
    let max_key = acc.max_key.clone().unwrap_or_default();
    let (key_filter, tombstone_filter, alias) = acc.finish();

    let filter_seg = match &key_filter {
        Some(filter) => write_segment(&file, &filter.to_bytes())?,
        None => SegmentHandle::default(),
    };
    let tombstone_filter_seg = match &tombstone_filter {
        Some(filter) => write_segment(&file, &filter.to_bytes())?,
        None => SegmentHandle::default(),
    };
    let alias_seg = match &alias {
        Some(table) => write_segment(&file, &encoding::encode_to_vec(table)?)?,
        None => SegmentHandle::default(),
    };

    let mut meta = RunMeta {
        magic: super::RUN_MAGIC,
        version: super::RUN_VERSION,
        record_count: record_count as u64,
        tombstone_count: tombstone_count as u64,
        leaf_page_count,
        first_leaf_page: 1,
        records_per_page: rpp as u32,
        weight_total,
        min_key,
        max_key,
        index_seg,
        filter_seg,
        tombstone_filter_seg,
        alias_seg,
        crc: 0,
    };
    meta.crc = meta.checksum()?;

    let meta_bytes = encoding::encode_to_vec(&meta)?;
    if meta_bytes.len() > PAGE_SIZE {
        return Err(RunError::Corrupted(
            "run metadata does not fit its page".into(),
        ));
    }
    let mut meta_buf = [0u8; PAGE_SIZE];
    meta_buf[..meta_bytes.len()].copy_from_slice(&meta_bytes);
    file.write_page(meta_page, &meta_buf)?;
    file.sync()?;

    debug!(
        file = file.id().0,
        records = record_count,
        tombstones = tombstone_count,
        leaf_pages = leaf_page_count,
        "built disk run"
    );

    // Reopen through the verifying path so a published run is always a
    // validated run.
    DiskRun::open(Arc::clone(&file), ctx).map(Run::Disk)
}

// ------------------------------------------------------------------------------------------------
// Accumulator — statistics, filters, weights
// ------------------------------------------------------------------------------------------------

struct Accumulator {
    count: usize,
    tombstones: usize,
    weight_total: f64,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    key_filter: Option<Filter>,
    tombstone_filter: Option<Filter>,
    weights: Option<Vec<f64>>,
}

impl Accumulator {
    fn new(ctx: &RunContext, opts: &BuildOptions) -> Result<Self, RunError> {
        let (key_filter, tombstone_filter) = if opts.bloom_filters {
            (
                Some(Filter::new(opts.expected_records, ctx.bloom_fpr)?),
                Some(Filter::new(opts.expected_records, ctx.bloom_fpr)?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            count: 0,
            tombstones: 0,
            weight_total: 0.0,
            min_key: None,
            max_key: None,
            key_filter,
            tombstone_filter,
            weights: ctx.schema.weighted().then(Vec::new),
        })
    }

    fn observe(&mut self, rec: &Record) {
        self.count += 1;
        if rec.tombstone {
            self.tombstones += 1;
            if let Some(filter) = &mut self.tombstone_filter {
                filter.insert(&tombstone_fingerprint(&rec.key, &rec.value));
            }
        }
        if let Some(filter) = &mut self.key_filter {
            filter.insert(&rec.key);
        }
        if self.min_key.is_none() {
            self.min_key = Some(rec.key.clone());
        }
        self.max_key = Some(rec.key.clone());
        if let Some(weights) = &mut self.weights {
            let w = if rec.is_live() { rec.weight } else { 0.0 };
            weights.push(w);
            self.weight_total += w;
        }
    }

    fn finish(self) -> (Option<Filter>, Option<Filter>, Option<AliasTable>) {
        let tombstone_filter = (self.tombstones > 0).then_some(self.tombstone_filter).flatten();
        let alias = self
            .weights
            .filter(|w| !w.is_empty())
            .map(|w| AliasTable::build(&w));
        (self.key_filter, tombstone_filter, alias)
    }
}

// ------------------------------------------------------------------------------------------------
// LeafWriter — packs records into sealed pages
// ------------------------------------------------------------------------------------------------

struct LeafWriter<'f> {
    file: &'f PagedFile,
    schema: RecordSchema,
    rpp: usize,
    buf: PageBuf,
    slots: usize,
    first_key: Option<Vec<u8>>,
    pages: u32,
    index: Vec<Vec<u8>>,
}

impl<'f> LeafWriter<'f> {
    fn new(file: &'f PagedFile, schema: RecordSchema, rpp: usize) -> Self {
        let mut buf = [0u8; PAGE_SIZE];
        page::init(&mut buf, rpp as u16);
        Self {
            file,
            schema,
            rpp,
            buf,
            slots: 0,
            first_key: None,
            pages: 0,
            index: Vec::new(),
        }
    }

    fn push(&mut self, rec: &Record) -> Result<(), RunError> {
        if self.first_key.is_none() {
            self.first_key = Some(rec.key.clone());
        }

        let mut encoded = Vec::with_capacity(self.schema.record_len());
        self.schema.encode_record(rec, &mut encoded);
        let range = page::slot_range(self.slots, self.schema.record_len())
            .ok_or_else(|| RunError::Corrupted("leaf slot overflowed its page".into()))?;
        self.buf[range].copy_from_slice(&encoded);
        self.slots += 1;

        if self.slots == self.rpp {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RunError> {
        if self.slots == 0 {
            return Ok(());
        }
        page::set_slot_count(&mut self.buf, self.slots as u16);
        page::seal(&mut self.buf);
        let pno = self.file.allocate();
        self.file.write_page(pno, &self.buf)?;

        self.index.push(
            self.first_key
                .take()
                .ok_or_else(|| RunError::Corrupted("leaf page written without a first key".into()))?,
        );
        self.pages += 1;
        self.slots = 0;
        page::init(&mut self.buf, self.rpp as u16);
        Ok(())
    }

    fn finish(mut self) -> Result<(u32, Vec<Vec<u8>>), RunError> {
        self.flush()?;
        Ok((self.pages, self.index))
    }
}

/// Writes `bytes` across whole pages and returns their handle.
fn write_segment(file: &PagedFile, bytes: &[u8]) -> Result<SegmentHandle, RunError> {
    if bytes.is_empty() {
        return Ok(SegmentHandle::default());
    }
    let mut start_page = None;
    for chunk in bytes.chunks(PAGE_SIZE) {
        let pno = file.allocate();
        start_page.get_or_insert(pno);
        let mut buf = [0u8; PAGE_SIZE];
        buf[..chunk.len()].copy_from_slice(chunk);
        file.write_page(pno, &buf)?;
    }
    Ok(SegmentHandle {
        start_page: start_page.unwrap_or(0),
        len: bytes.len() as u64,
    })
}

// ------------------------------------------------------------------------------------------------
// GroupProcessor — dedup and tombstone cancellation
// ------------------------------------------------------------------------------------------------

/// Buffers one key group at a time, collapsing duplicates and (when
/// purging) cancelling tombstone/record pairs.
struct GroupProcessor<I: Iterator<Item = Record>> {
    input: Peekable<I>,
    schema: RecordSchema,
    purge: bool,
    pending: VecDeque<Record>,
}

impl<I: Iterator<Item = Record>> GroupProcessor<I> {
    fn new(input: I, schema: RecordSchema, purge: bool) -> Self {
        Self {
            input: input.peekable(),
            schema,
            purge,
            pending: VecDeque::new(),
        }
    }

    fn refill(&mut self) {
        let Some(first) = self.input.next() else {
            return;
        };
        let mut group = vec![first];
        while let Some(next) = self.input.peek() {
            if self.schema.cmp_keys(&next.key, &group[0].key) != std::cmp::Ordering::Equal {
                break;
            }
            // Unwrap safe: peek just succeeded.
            if let Some(rec) = self.input.next() {
                group.push(rec);
            }
        }
        self.process_group(group);
    }

    fn process_group(&mut self, group: Vec<Record>) {
        // Collapse exact (timestamp, tombstone) duplicates; the stream
        // is sorted, so duplicates are adjacent.
        let mut deduped: Vec<Record> = Vec::with_capacity(group.len());
        for rec in group {
            if deduped
                .last()
                .is_some_and(|prev| prev.timestamp == rec.timestamp && prev.tombstone == rec.tombstone)
            {
                continue;
            }
            deduped.push(rec);
        }

        if !self.purge {
            self.pending.extend(deduped);
            return;
        }

        // Bottom level: each tombstone cancels the newest matching
        // record at or before its timestamp; both disappear. Records
        // tag-deleted in place disappear here too.
        let mut dropped = vec![false; deduped.len()];
        for t_idx in 0..deduped.len() {
            if !deduped[t_idx].tombstone || dropped[t_idx] {
                continue;
            }
            let mut victim: Option<usize> = None;
            for (r_idx, rec) in deduped.iter().enumerate() {
                if !dropped[r_idx]
                    && !rec.tombstone
                    && rec.timestamp <= deduped[t_idx].timestamp
                    && rec.value == deduped[t_idx].value
                {
                    victim = Some(r_idx);
                }
            }
            if let Some(r_idx) = victim {
                dropped[r_idx] = true;
                dropped[t_idx] = true;
            }
        }

        for (idx, rec) in deduped.into_iter().enumerate() {
            if !dropped[idx] && !rec.deleted {
                self.pending.push_back(rec);
            }
        }
    }
}

impl<I: Iterator<Item = Record>> Iterator for GroupProcessor<I> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        while self.pending.is_empty() {
            let before = self.input.peek().is_some();
            if !before {
                return None;
            }
            self.refill();
        }
        self.pending.pop_front()
    }
}
