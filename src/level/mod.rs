//! One level of the LSM hierarchy.
//!
//! A level owns between zero and `run_capacity` immutable runs plus a
//! record budget. `run_capacity == 1` is LEVELING (incoming data merges
//! with the resident run); `run_capacity > 1` is TIERING (incoming runs
//! are emplaced until the level fills and compacts downward). Levels
//! below the configured in-memory count build [`MemoryRun`]s; the rest
//! page out to [`DiskRun`]s.
//!
//! ## Design Invariants
//!
//! - `runs.len() <= run_capacity`; `record_count() <= record_capacity`
//!   except transiently on an empty LEVELING level that accepted an
//!   oversized merge (the cascade grows a deeper level next round).
//! - Runs are ordered oldest → newest; point lookups scan newest-first.
//! - A merge failure leaves the level untouched — new runs are built
//!   and verified before anything resident is replaced.
//! - Tombstone/record cancellation happens at the **bottom level
//!   only**; above it, tombstones and the records they mask both
//!   propagate so deeper versions stay masked. Merge entry points take
//!   a `bottom` flag carrying that context.
//! - After a merge, if `tombstones / records` exceeds the configured
//!   proportion the level immediately compacts itself: at the bottom
//!   the rewrite cancels matched tombstone/record pairs; above it the
//!   rewrite only collapses the resident runs, keeping every tombstone.
//!
//! [`MemoryRun`]: crate::run::MemoryRun
//! [`DiskRun`]: crate::run::DiskRun

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::run::builder::{BuildOptions, build_run};
use crate::run::{Run, RunContext, RunError};
use crate::schema::Record;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by level merges and lookups.
#[derive(Debug, Error)]
pub enum LevelError {
    /// Run construction or access failed.
    #[error("run error: {0}")]
    Run(#[from] RunError),

    /// The level cannot accept the merge without violating its budget.
    #[error("level at capacity: {0}")]
    CapacityExceeded(String),
}

// ------------------------------------------------------------------------------------------------
// Level
// ------------------------------------------------------------------------------------------------

/// A bounded, ordered collection of runs at one depth of the tree.
pub struct Level {
    run_capacity: usize,
    record_capacity: usize,
    max_deleted_proportion: f64,
    bloom_filters: bool,
    memory_resident: bool,
    ctx: Arc<RunContext>,
    runs: Vec<Arc<Run>>,
}

impl Level {
    /// Creates an empty level.
    ///
    /// `run_capacity` is 1 under LEVELING and the scale factor under
    /// TIERING; `memory_resident` levels build RAM runs.
    pub fn new(
        run_capacity: usize,
        record_capacity: usize,
        ctx: Arc<RunContext>,
        max_deleted_proportion: f64,
        bloom_filters: bool,
        memory_resident: bool,
    ) -> Self {
        Self {
            run_capacity,
            record_capacity,
            max_deleted_proportion,
            bloom_filters,
            memory_resident,
            ctx,
            runs: Vec::new(),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Capacity queries
    // --------------------------------------------------------------------------------------------

    /// Maximum runs this level can hold.
    pub fn run_capacity(&self) -> usize {
        self.run_capacity
    }

    /// Maximum records this level should hold.
    pub fn record_capacity(&self) -> usize {
        self.record_capacity
    }

    /// Current run count.
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Current record count across all runs, tombstones included.
    pub fn record_count(&self) -> usize {
        self.runs.iter().map(|r| r.record_count()).sum()
    }

    /// Tombstones across all runs.
    pub fn tombstone_count(&self) -> usize {
        self.runs.iter().map(|r| r.tombstone_count()).sum()
    }

    /// True when another run can be emplaced without merging.
    pub fn can_emplace_run(&self) -> bool {
        self.runs.len() < self.run_capacity
    }

    /// True when `incoming_records` can merge in without overflowing.
    ///
    /// Either a run slot is free, or (LEVELING) the resident run plus
    /// the incoming records still fit the record budget.
    pub fn can_merge_with(&self, incoming_records: usize) -> bool {
        if self.runs.len() < self.run_capacity {
            return true;
        }
        self.run_capacity == 1 && self.record_count() + incoming_records <= self.record_capacity
    }

    /// True for in-RAM levels.
    pub fn is_memory_resident(&self) -> bool {
        self.memory_resident
    }

    /// Snapshot of the level's runs, oldest first.
    pub fn runs(&self) -> &[Arc<Run>] {
        &self.runs
    }

    // --------------------------------------------------------------------------------------------
    // Merging
    // --------------------------------------------------------------------------------------------

    /// Places a pre-built run into the level.
    pub fn emplace_run(&mut self, run: Arc<Run>) -> Result<(), LevelError> {
        if !self.can_emplace_run() {
            return Err(LevelError::CapacityExceeded(format!(
                "no free run slot ({} of {})",
                self.runs.len(),
                self.run_capacity
            )));
        }
        self.runs.push(run);
        Ok(())
    }

    /// Merges every run on this level into one new run.
    ///
    /// The resident runs are left untouched; the caller decides what to
    /// truncate. With `purge`, matched tombstone/record pairs cancel.
    pub fn merge_runs(&self, purge: bool) -> Result<Run, LevelError> {
        let inputs: Vec<Box<dyn Iterator<Item = Record> + '_>> =
            self.runs.iter().map(|r| r.scan()).collect();
        let expected = self.record_count();
        Ok(build_run(
            &self.ctx,
            inputs,
            &BuildOptions {
                expected_records: expected,
                bloom_filters: self.bloom_filters,
                purge_tombstones: purge,
                memory_resident: self.memory_resident,
            },
        )?)
    }

    /// Merges the contents of `other` (the level above) into this one.
    ///
    /// TIERING (or an empty slot): `other`'s runs compact into one new
    /// run that is emplaced here. LEVELING: the resident run is rewritten
    /// together with `other`'s runs. `other` itself is not modified.
    ///
    /// `bottom` says whether this level is the deepest in the tree;
    /// only then do tombstones cancel the records they mask.
    pub fn merge_with_level(&mut self, other: &Level, bottom: bool) -> Result<(), LevelError> {
        let incoming = other.record_count();
        if !self.can_merge_with(incoming) {
            return Err(LevelError::CapacityExceeded(format!(
                "cannot accept {incoming} records from the level above"
            )));
        }

        if self.runs.len() < self.run_capacity {
            let inputs: Vec<Box<dyn Iterator<Item = Record> + '_>> =
                other.runs.iter().map(|r| r.scan()).collect();
            let run = build_run(
                &self.ctx,
                inputs,
                &BuildOptions {
                    expected_records: incoming,
                    bloom_filters: self.bloom_filters,
                    purge_tombstones: bottom,
                    memory_resident: self.memory_resident,
                },
            )?;
            self.runs.push(Arc::new(run));
        } else {
            let mut inputs: Vec<Box<dyn Iterator<Item = Record> + '_>> =
                self.runs.iter().map(|r| r.scan()).collect();
            inputs.extend(other.runs.iter().map(|r| r.scan()));
            let merged = build_run(
                &self.ctx,
                inputs,
                &BuildOptions {
                    expected_records: incoming + self.record_count(),
                    bloom_filters: self.bloom_filters,
                    purge_tombstones: bottom,
                    memory_resident: self.memory_resident,
                },
            )?;
            self.replace_runs(merged);
        }

        debug!(
            incoming,
            runs = self.runs.len(),
            records = self.record_count(),
            "merged level down"
        );
        self.maybe_compact_deletes(bottom)?;
        Ok(())
    }

    /// Merges an already-sorted record stream (a drained memtable) into
    /// this level.
    ///
    /// `bottom` carries the same deepest-level context as
    /// [`Self::merge_with_level`].
    pub fn merge_with_sorted(
        &mut self,
        records: Vec<Record>,
        bottom: bool,
    ) -> Result<(), LevelError> {
        let incoming = records.len();
        if !self.can_merge_with(incoming) {
            return Err(LevelError::CapacityExceeded(format!(
                "cannot accept {incoming} sorted records"
            )));
        }

        if self.runs.len() < self.run_capacity {
            let run = build_run(
                &self.ctx,
                vec![Box::new(records.into_iter())],
                &BuildOptions {
                    expected_records: incoming,
                    bloom_filters: self.bloom_filters,
                    purge_tombstones: bottom,
                    memory_resident: self.memory_resident,
                },
            )?;
            self.runs.push(Arc::new(run));
        } else {
            let mut inputs: Vec<Box<dyn Iterator<Item = Record> + '_>> =
                self.runs.iter().map(|r| r.scan()).collect();
            inputs.push(Box::new(records.into_iter()));
            let merged = build_run(
                &self.ctx,
                inputs,
                &BuildOptions {
                    expected_records: incoming + self.record_count(),
                    bloom_filters: self.bloom_filters,
                    purge_tombstones: bottom,
                    memory_resident: self.memory_resident,
                },
            )?;
            self.replace_runs(merged);
        }

        self.maybe_compact_deletes(bottom)?;
        Ok(())
    }

    /// Swaps every resident run for `merged`, retiring old disk files.
    fn replace_runs(&mut self, merged: Run) {
        for run in self.runs.drain(..) {
            if let Run::Disk(disk) = run.as_ref() {
                disk.mark_defunct();
            }
        }
        self.runs.push(Arc::new(merged));
    }

    /// Compacts the level when the deleted proportion crosses the
    /// configured threshold.
    ///
    /// At the bottom the rewrite cancels matched tombstone/record
    /// pairs. Above the bottom a tombstone may still mask a live record
    /// at a deeper level, so cancellation must wait: the rewrite only
    /// collapses multiple resident runs (and exact duplicates), keeping
    /// every tombstone in place.
    fn maybe_compact_deletes(&mut self, bottom: bool) -> Result<(), LevelError> {
        let records = self.record_count();
        if records == 0 {
            return Ok(());
        }
        let proportion = self.tombstone_count() as f64 / records as f64;
        if proportion <= self.max_deleted_proportion {
            return Ok(());
        }

        if !bottom && self.runs.len() <= 1 {
            // Nothing to collapse and nothing may cancel here; the
            // proportion resolves when this level merges down.
            debug!(
                proportion,
                threshold = self.max_deleted_proportion,
                "deleted proportion exceeded above the bottom, deferring to merge-down"
            );
            return Ok(());
        }

        info!(
            proportion,
            threshold = self.max_deleted_proportion,
            bottom,
            "deleted proportion exceeded, compacting level"
        );
        let merged = self.merge_runs(bottom)?;
        self.replace_runs(merged);
        Ok(())
    }

    /// Drops every run and retires their files.
    pub fn truncate(&mut self) {
        for run in self.runs.drain(..) {
            if let Run::Disk(disk) = run.as_ref() {
                disk.mark_defunct();
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Lookups
    // --------------------------------------------------------------------------------------------

    /// Newest record for `key` with timestamp ≤ `time`, searching runs
    /// newest-first.
    pub fn get(&self, key: &[u8], time: u64) -> Result<Option<Record>, LevelError> {
        for run in self.runs.iter().rev() {
            if let Some(rec) = run.get(key, time)? {
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    /// Newest tombstone for `(key, value)` with timestamp ≤ `time`.
    pub fn get_tombstone(
        &self,
        key: &[u8],
        value: &[u8],
        time: u64,
    ) -> Result<Option<Record>, LevelError> {
        for run in self.runs.iter().rev() {
            if let Some(rec) = run.get_tombstone(key, value, time)? {
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    /// Tag-deletes the newest matching live record on this level.
    pub fn tag_delete(&self, key: &[u8], value: &[u8], time: u64) -> Result<bool, LevelError> {
        for run in self.runs.iter().rev() {
            if run.tag_delete(key, value, time)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Ordered scan over the level's full contents.
    pub fn start_scan(&self) -> impl Iterator<Item = Record> + '_ {
        let inputs: Vec<Box<dyn Iterator<Item = Record> + '_>> =
            self.runs.iter().map(|r| r.scan()).collect();
        crate::run::merge::MergeIterator::new(inputs, self.ctx.schema)
    }

    /// Bytes held by the level's auxiliary structures (and, for memory
    /// levels, the records themselves).
    pub fn memory_utilization(&self) -> usize {
        self.runs.iter().map(|r| r.memory_utilization()).sum()
    }
}
