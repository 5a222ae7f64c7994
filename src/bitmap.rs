//! Atomic bitset backing in-place tag deletes.
//!
//! Memory-resident structures (the unsorted memtable's slot array and
//! memory-resident runs) are immutable once published, so the tag-delete
//! path cannot rewrite their records. Instead each carries one of these
//! bitmaps: bit `i` set means record `i` is deleted. Readers consult the
//! bitmap at draw/lookup time; writers flip bits with relaxed atomics —
//! a flag flip is idempotent and carries no ordering obligations.

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

/// A fixed-capacity, concurrently updatable bitset.
pub struct Bitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap covering `len` positions, all clear.
    pub fn new(len: usize) -> Self {
        let word_count = len.div_ceil(WORD_BITS);
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self { words, len }
    }

    /// Number of addressable positions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the bitmap covers zero positions.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets bit `idx`. Out-of-range indices are ignored.
    pub fn set(&self, idx: usize) {
        if idx < self.len {
            self.words[idx / WORD_BITS].fetch_or(1 << (idx % WORD_BITS), Ordering::Relaxed);
        }
    }

    /// Returns bit `idx`; out-of-range indices read as clear.
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        self.words[idx / WORD_BITS].load(Ordering::Relaxed) & (1 << (idx % WORD_BITS)) != 0
    }

    /// Number of set bits.
    pub fn count_set(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Heap footprint in bytes.
    pub fn memory_utilization(&self) -> usize {
        self.words.len() * std::mem::size_of::<AtomicU64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let bm = Bitmap::new(130);
        assert!(!bm.get(0));
        bm.set(0);
        bm.set(63);
        bm.set(64);
        bm.set(129);
        assert!(bm.get(0));
        assert!(bm.get(63));
        assert!(bm.get(64));
        assert!(bm.get(129));
        assert!(!bm.get(1));
        assert_eq!(bm.count_set(), 4);
    }

    #[test]
    fn test_out_of_range_is_inert() {
        let bm = Bitmap::new(10);
        bm.set(10);
        bm.set(1000);
        assert!(!bm.get(10));
        assert_eq!(bm.count_set(), 0);
    }

    #[test]
    fn test_set_is_idempotent() {
        let bm = Bitmap::new(8);
        bm.set(3);
        bm.set(3);
        assert_eq!(bm.count_set(), 1);
    }

    #[test]
    fn test_concurrent_sets() {
        use std::sync::Arc;

        let bm = Arc::new(Bitmap::new(4096));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let bm = Arc::clone(&bm);
                std::thread::spawn(move || {
                    for i in (t..4096).step_by(4) {
                        bm.set(i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(bm.count_set(), 4096);
    }
}
