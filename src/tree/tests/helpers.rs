// Shared builders for tree tests.

use crate::memtable::MemtableType;
use crate::schema::i64_key_cmp;
use crate::tree::{LsmTree, MergePolicy, TreeConfig};
use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

pub fn init_tracing() {
    let _ = Subscriber::builder().with_max_level(Level::INFO).try_init();
}

/// Small-capacity i64/i64 config so merges happen quickly in tests.
pub fn small_config() -> TreeConfig {
    TreeConfig {
        memtable_capacity: 100,
        scale_factor: 4,
        policy: MergePolicy::Leveling,
        memtable_type: MemtableType::Skiplist,
        key_size: 8,
        value_size: 8,
        key_cmp: i64_key_cmp,
        rng_seed: 0,
        ..TreeConfig::default()
    }
}

pub fn open(tmp: &TempDir, config: TreeConfig) -> LsmTree {
    LsmTree::create(tmp.path(), config).unwrap()
}

pub fn key(k: i64) -> [u8; 8] {
    k.to_be_bytes()
}

pub fn put(tree: &LsmTree, k: i64, v: i64) {
    tree.insert(&key(k), &key(v)).unwrap();
}

pub fn get_val(tree: &LsmTree, k: i64) -> Option<i64> {
    tree.get(&key(k), None)
        .unwrap()
        .map(|rec| i64::from_be_bytes(rec.value.as_slice().try_into().unwrap()))
}

pub fn rec_key(rec: &crate::schema::Record) -> i64 {
    i64::from_be_bytes(rec.key.as_slice().try_into().unwrap())
}
