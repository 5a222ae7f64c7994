//! # SampleDB
//!
//! An embeddable storage engine built on a **Log-Structured Merge Tree
//! (LSM-tree)** and specialized for **independent range sampling (IRS)**:
//! given a key range `[lo, hi]` and a sample size `k`, draw `k` records
//! uniformly *with replacement* from the live records in that range —
//! concurrently with inserts, deletes, and background merges.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         LsmTree                           │
//! │  ┌────────────┐   ┌─────────────────┐  ┌───────────────┐  │
//! │  │  Active    │   │  Memory levels  │  │  Disk levels  │  │
//! │  │  memtable  │   │  (sorted runs)  │  │  (ISAM runs)  │  │
//! │  └─────┬──────┘   └────────┬────────┘  └──────┬────────┘  │
//! │        │  merge-down       │    cascade       │           │
//! │        └──────────►        └────────►         │           │
//! │                                               │           │
//! │  ┌────────────────────────────────────────────┘           │
//! │  │  Page store (LRU pin cache, batch pins)                │
//! │  └────────────────────────────────────────────────────────│
//! │                                                           │
//! │  range_sample: per-run sample ranges → alias table over   │
//! │  range lengths → batched page pins → rejection loop       │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`tree`] | Top-level coordinator — insert, delete, get, range sampling, merges |
//! | [`level`] | Bounded run collections with LEVELING / TIERING merge semantics |
//! | [`run`] | Immutable sorted runs (on-disk ISAM and memory-resident) |
//! | [`memtable`] | In-memory write buffer — skiplist, unsorted, and rejection variants |
//! | [`sample`] | Sample ranges, sample results, and sampling statistics |
//! | [`pagestore`] | Paged files plus a pinning LRU read cache |
//! | [`bloom`] | Per-run key and tombstone membership filters |
//! | [`alias`] | Walker's alias method for O(1) weighted draws |
//! | [`bitmap`] | Atomic bitset backing in-place tag deletes |
//! | [`schema`] | Fixed-width record layout and caller-supplied key ordering |
//! | [`encoding`] | Deterministic binary encoding for persisted metadata |
//!
//! ## Key Features
//!
//! - **Independent range sampling** — statistically independent draws
//!   weighted across every run touching the query range, corrected by
//!   rejection for tombstones, boundary pages, and deleted records.
//! - **Two merge policies** — LEVELING (one run per level) and TIERING
//!   (scale-factor runs per level), with a cascade that grows new levels
//!   on demand.
//! - **Two delete modes** — tombstone records, or in-place tag deletes
//!   that never write a new record.
//! - **Weighted sampling** — optional per-run alias tables over record
//!   weights, selected at build time through the schema.
//! - **Pinned page cache** — batch pins amortize one disk round per
//!   rejection pass; every pin is a scoped guard that releases on drop.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sampledb::tree::{LsmTree, TreeConfig};
//!
//! let config = TreeConfig {
//!     key_size: 8,
//!     value_size: 8,
//!     memtable_capacity: 1000,
//!     scale_factor: 6,
//!     ..TreeConfig::default()
//! };
//!
//! let tree = LsmTree::create("/tmp/my_db", config).unwrap();
//!
//! tree.insert(&1i64.to_be_bytes(), &10i64.to_be_bytes()).unwrap();
//! tree.insert(&2i64.to_be_bytes(), &20i64.to_be_bytes()).unwrap();
//!
//! let rec = tree.get(&2i64.to_be_bytes(), None).unwrap();
//! assert_eq!(rec.unwrap().value, 20i64.to_be_bytes());
//!
//! let sample = tree
//!     .range_sample(&1i64.to_be_bytes(), &2i64.to_be_bytes(), 16)
//!     .unwrap();
//! assert_eq!(sample.unwrap().len(), 16);
//! ```

pub mod alias;
pub mod bitmap;
pub mod bloom;
pub mod encoding;
pub mod level;
pub mod memtable;
pub mod pagestore;
pub mod run;
pub mod sample;
pub mod schema;
pub mod tree;
