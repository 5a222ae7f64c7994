//! Sample ranges, sample results, and sampling statistics.
//!
//! A [`SampleRange`] names *where* one uniform candidate draw can come
//! from: a materialized memtable interval, the raw rejection window of
//! an unsorted memtable, an index band of a memory-resident run, or a
//! leaf-page band of a disk run. Its [`length`](SampleRange::length) is
//! the number of **candidate positions** — deliberately counting
//! tombstones, tag-deleted records, unwritten slots, and boundary-page
//! overshoot — because the global weighting across ranges must reflect
//! draw positions, and the rejection loop corrects the rest.
//!
//! Memory-resident ranges resolve draws inline; disk ranges resolve to
//! a [`PageId`] that the tree pins in a batch, one disk round per
//! rejection pass.

use std::sync::Arc;

use rand::Rng;

use crate::memtable::MemtablePin;
use crate::pagestore::PageId;
use crate::run::{DiskRun, Run};
use crate::schema::Record;

// ------------------------------------------------------------------------------------------------
// SampleRange
// ------------------------------------------------------------------------------------------------

/// One source of uniform candidate draws for a range-sample query.
pub enum SampleRange {
    /// Records materialized from a memtable (skiplist or filter-mode
    /// unsorted); the pin keeps the table from truncating mid-query.
    Memtable {
        /// Pin on the source table.
        pin: MemtablePin,
        /// Records with keys inside the query range.
        records: Vec<Record>,
    },

    /// Rejection-mode window over an unsorted memtable: draws address
    /// raw slots `[0, window)` and filter at draw time.
    MemtableRejection {
        /// Pin on the source table.
        pin: MemtablePin,
        /// Slot count reserved at range-creation time.
        window: usize,
    },

    /// Inclusive index interval of a memory-resident run.
    MemoryRun {
        /// The run (kept alive by this handle).
        run: Arc<Run>,
        /// First candidate index.
        start: usize,
        /// Last candidate index.
        stop: usize,
    },

    /// Inclusive leaf-page band of a disk run.
    DiskRun {
        /// The run (kept alive by this handle).
        run: Arc<Run>,
        /// First absolute page of the band.
        start_page: u32,
        /// Last absolute page of the band.
        stop_page: u32,
    },
}

impl SampleRange {
    /// Number of candidate positions (may exceed the live-record count).
    pub fn length(&self) -> usize {
        match self {
            SampleRange::Memtable { records, .. } => records.len(),
            SampleRange::MemtableRejection { window, .. } => *window,
            SampleRange::MemoryRun { start, stop, .. } => stop - start + 1,
            SampleRange::DiskRun {
                run,
                start_page,
                stop_page,
            } => {
                let pages = (stop_page - start_page + 1) as usize;
                match run.as_ref() {
                    Run::Disk(disk) => pages * disk.records_per_page(),
                    Run::Memory(_) => 0,
                }
            }
        }
    }

    /// True when draws resolve without touching the page store.
    pub fn is_memory_resident(&self) -> bool {
        !matches!(self, SampleRange::DiskRun { .. })
    }

    /// Resolves one uniform candidate from a memory-resident range.
    ///
    /// `None` is a rejectable draw (unwritten slot), not an error.
    /// Calling this on a disk range is a contract violation and returns
    /// `None`.
    pub fn draw_memory<R: Rng>(&self, rng: &mut R) -> Option<Record> {
        match self {
            SampleRange::Memtable { records, .. } => {
                if records.is_empty() {
                    return None;
                }
                records.get(rng.random_range(0..records.len())).cloned()
            }
            SampleRange::MemtableRejection { pin, window } => {
                if *window == 0 {
                    return None;
                }
                pin.table().slot(rng.random_range(0..*window))
            }
            SampleRange::MemoryRun { run, start, stop } => {
                let idx = rng.random_range(*start..=*stop);
                match run.as_ref() {
                    Run::Memory(mem) => mem.record(idx),
                    Run::Disk(_) => None,
                }
            }
            SampleRange::DiskRun { .. } => None,
        }
    }

    /// Resolves one uniform page draw from a disk range.
    pub fn draw_page<R: Rng>(&self, rng: &mut R) -> Option<PageId> {
        match self {
            SampleRange::DiskRun {
                run,
                start_page,
                stop_page,
            } => {
                let page = rng.random_range(*start_page..=*stop_page);
                let disk = match run.as_ref() {
                    Run::Disk(disk) => disk,
                    Run::Memory(_) => return None,
                };
                Some(PageId::new(disk.file_id(), page))
            }
            _ => None,
        }
    }

    /// The disk run behind a [`SampleRange::DiskRun`], if any.
    pub fn disk_run(&self) -> Option<&DiskRun> {
        match self {
            SampleRange::DiskRun { run, .. } => match run.as_ref() {
                Run::Disk(disk) => Some(disk),
                Run::Memory(_) => None,
            },
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Sample
// ------------------------------------------------------------------------------------------------

/// An accumulating range-sample result.
pub struct Sample {
    records: Vec<Record>,
    capacity: usize,
}

impl Sample {
    /// Creates an empty sample with room for `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds a record; ignored once the sample is full.
    pub fn add(&mut self, rec: Record) {
        if self.records.len() < self.capacity {
            self.records.push(rec);
        }
    }

    /// Records collected so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True before the first accepted draw.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True once `capacity` records were accepted.
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Consumes the sample into its records.
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

// ------------------------------------------------------------------------------------------------
// SampleStats
// ------------------------------------------------------------------------------------------------

/// Counters describing one range-sample execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleStats {
    /// Candidate draws attempted.
    pub attempts: usize,
    /// Draws rejected (invalid, tombstone, out of range, deleted).
    pub rejections: usize,
}
