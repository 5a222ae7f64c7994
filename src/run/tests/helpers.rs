// Shared builders for run tests.

use std::sync::Arc;

use tempfile::TempDir;

use crate::pagestore::FileManager;
use crate::pagestore::cache::ReadCache;
use crate::run::RunContext;
use crate::schema::{Record, RecordSchema, i64_key_cmp};

pub fn schema(weighted: bool) -> RecordSchema {
    RecordSchema {
        key_size: 8,
        value_size: 8,
        weight_size: if weighted { 8 } else { 0 },
        key_cmp: i64_key_cmp,
    }
}

pub fn context(tmp: &TempDir, weighted: bool) -> RunContext {
    let files = Arc::new(FileManager::new(tmp.path()).unwrap());
    let cache = Arc::new(ReadCache::new(64, Arc::clone(&files)));
    RunContext {
        files,
        cache,
        schema: schema(weighted),
        bloom_fpr: 0.01,
    }
}

pub fn rec(key: i64, val: i64, ts: u64) -> Record {
    Record::new(
        key.to_be_bytes().to_vec(),
        val.to_be_bytes().to_vec(),
        1.0,
        ts,
    )
}

pub fn weighted_rec(key: i64, weight: f64, ts: u64) -> Record {
    Record::new(key.to_be_bytes().to_vec(), vec![0; 8], weight, ts)
}

pub fn tomb(key: i64, val: i64, ts: u64) -> Record {
    Record::new_tombstone(key.to_be_bytes().to_vec(), val.to_be_bytes().to_vec(), ts)
}

pub fn key_of(rec: &Record) -> i64 {
    i64::from_be_bytes(rec.key.as_slice().try_into().unwrap())
}
