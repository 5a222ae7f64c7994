//! Pinning LRU read cache over paged files.
//!
//! The cache holds a fixed number of page frames. [`ReadCache::pin`]
//! returns a [`PinnedFrame`] guard: while any guard for a page is alive
//! the frame cannot be evicted, and dropping the guard releases the pin
//! — there is no explicit unpin call to forget. Batch pins
//! ([`ReadCache::pin_batch`]) are how the sampler turns one rejection
//! round into one pass over the frame pool.
//!
//! Misses block: the faulting thread performs the read inside the cache
//! lock, and when every frame is pinned it waits on a condvar until a
//! pin drops. Each miss bumps `miss_count` and adds the read latency to
//! `io_time`; both counters reset independently so callers can bracket
//! a sampling pass.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::error;

use super::{FileManager, PAGE_SIZE, PageBuf, PageId, PageStoreError};

// ------------------------------------------------------------------------------------------------
// Frame bookkeeping
// ------------------------------------------------------------------------------------------------

struct Frame {
    page: PageId,
    data: Arc<PageBuf>,
    pins: usize,
    last_used: u64,
}

struct CacheInner {
    frames: Vec<Frame>,
    map: HashMap<PageId, usize>,
    tick: u64,
}

struct CacheShared {
    capacity: usize,
    inner: Mutex<CacheInner>,
    frame_freed: Condvar,
    miss_count: AtomicU64,
    io_time_ns: AtomicU64,
    files: Arc<FileManager>,
}

// ------------------------------------------------------------------------------------------------
// ReadCache
// ------------------------------------------------------------------------------------------------

/// Fixed-size pinning page cache shared by all readers of a tree.
pub struct ReadCache {
    shared: Arc<CacheShared>,
}

impl ReadCache {
    /// Creates a cache of `capacity` frames over `files`.
    pub fn new(capacity: usize, files: Arc<FileManager>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                capacity: capacity.max(1),
                inner: Mutex::new(CacheInner {
                    frames: Vec::new(),
                    map: HashMap::new(),
                    tick: 0,
                }),
                frame_freed: Condvar::new(),
                miss_count: AtomicU64::new(0),
                io_time_ns: AtomicU64::new(0),
                files: Arc::clone(&files),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheInner>, PageStoreError> {
        self.shared
            .inner
            .lock()
            .map_err(|_| PageStoreError::InvariantViolation("cache lock poisoned".into()))
    }

    /// Pins `page_id`, reading it from disk on a miss.
    ///
    /// Blocks while every frame is pinned by other readers.
    pub fn pin(&self, page_id: PageId) -> Result<PinnedFrame, PageStoreError> {
        let mut inner = self.lock()?;

        loop {
            inner.tick += 1;
            let tick = inner.tick;

            if let Some(&idx) = inner.map.get(&page_id) {
                let frame = &mut inner.frames[idx];
                frame.pins += 1;
                frame.last_used = tick;
                return Ok(PinnedFrame {
                    data: Arc::clone(&frame.data),
                    page: page_id,
                    shared: Arc::clone(&self.shared),
                });
            }

            // Miss: secure a frame slot, then fault the page in.
            let slot = if inner.frames.len() < self.shared.capacity {
                None
            } else {
                match Self::victim(&inner.frames) {
                    Some(v) => Some(v),
                    None => {
                        // Every frame pinned; wait for a pin to drop.
                        inner = self
                            .shared
                            .frame_freed
                            .wait(inner)
                            .map_err(|_| {
                                PageStoreError::InvariantViolation("cache lock poisoned".into())
                            })?;
                        continue;
                    }
                }
            };

            let data = Arc::new(self.fault_in(page_id)?);

            let idx = match slot {
                Some(victim) => {
                    let old = inner.frames[victim].page;
                    inner.map.remove(&old);
                    inner.frames[victim] = Frame {
                        page: page_id,
                        data: Arc::clone(&data),
                        pins: 1,
                        last_used: tick,
                    };
                    victim
                }
                None => {
                    inner.frames.push(Frame {
                        page: page_id,
                        data: Arc::clone(&data),
                        pins: 1,
                        last_used: tick,
                    });
                    inner.frames.len() - 1
                }
            };
            inner.map.insert(page_id, idx);

            return Ok(PinnedFrame {
                data,
                page: page_id,
                shared: Arc::clone(&self.shared),
            });
        }
    }

    /// Pins every page in `pages`, in order.
    ///
    /// On failure the already-acquired guards unpin as they drop.
    pub fn pin_batch(&self, pages: &[PageId]) -> Result<Vec<PinnedFrame>, PageStoreError> {
        let mut pinned = Vec::with_capacity(pages.len());
        for &page in pages {
            pinned.push(self.pin(page)?);
        }
        Ok(pinned)
    }

    /// Refreshes or drops the cached copy of `page_id` after an
    /// in-place write (tag delete).
    ///
    /// Unpinned frames are simply discarded. Pinned frames get fresh
    /// bytes swapped in; existing guards keep the snapshot they pinned.
    pub fn invalidate(&self, page_id: PageId) -> Result<(), PageStoreError> {
        let needs_refresh = {
            let mut inner = self.lock()?;
            match inner.map.get(&page_id).copied() {
                None => return Ok(()),
                Some(idx) if inner.frames[idx].pins == 0 => {
                    inner.map.remove(&page_id);
                    inner.frames[idx].last_used = 0;
                    inner.frames[idx].page = PageId::new(super::FileId(u32::MAX), u32::MAX);
                    false
                }
                Some(_) => true,
            }
        };

        if needs_refresh {
            let fresh = Arc::new(self.fault_in(page_id)?);
            let mut inner = self.lock()?;
            if let Some(&idx) = inner.map.get(&page_id) {
                inner.frames[idx].data = fresh;
            }
        }
        Ok(())
    }

    fn victim(frames: &[Frame]) -> Option<usize> {
        frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.pins == 0)
            .min_by_key(|(_, f)| f.last_used)
            .map(|(idx, _)| idx)
    }

    fn fault_in(&self, page_id: PageId) -> Result<PageBuf, PageStoreError> {
        let file = self.shared.files.get(page_id.file).ok_or_else(|| {
            PageStoreError::InvariantViolation(format!(
                "pin of page in unknown file {:?}",
                page_id.file
            ))
        })?;

        let start = Instant::now();
        let mut buf = [0u8; PAGE_SIZE];
        file.read_page(page_id.page, &mut buf)?;
        let elapsed = start.elapsed().as_nanos() as u64;

        self.shared.miss_count.fetch_add(1, Ordering::Relaxed);
        self.shared.io_time_ns.fetch_add(elapsed, Ordering::Relaxed);

        Ok(buf)
    }

    /// Total frames in the pool.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Cache misses since the last reset.
    pub fn miss_count(&self) -> u64 {
        self.shared.miss_count.load(Ordering::Relaxed)
    }

    /// Time spent in miss reads since the last reset.
    pub fn io_time(&self) -> Duration {
        Duration::from_nanos(self.shared.io_time_ns.load(Ordering::Relaxed))
    }

    /// Zeroes the miss counter.
    pub fn reset_miss_count(&self) {
        self.shared.miss_count.store(0, Ordering::Relaxed);
    }

    /// Zeroes the I/O timer.
    pub fn reset_io_time(&self) {
        self.shared.io_time_ns.store(0, Ordering::Relaxed);
    }
}

// ------------------------------------------------------------------------------------------------
// PinnedFrame
// ------------------------------------------------------------------------------------------------

/// Scoped pin on one cached page.
///
/// Dereferences to the page bytes. The pin is released when the guard
/// drops — on every exit path, including unwinds — so pins and unpins
/// always pair.
pub struct PinnedFrame {
    data: Arc<PageBuf>,
    page: PageId,
    shared: Arc<CacheShared>,
}

impl PinnedFrame {
    /// The pinned page's identity.
    pub fn page_id(&self) -> PageId {
        self.page
    }
}

impl Deref for PinnedFrame {
    type Target = PageBuf;

    fn deref(&self) -> &PageBuf {
        &self.data
    }
}

impl Drop for PinnedFrame {
    fn drop(&mut self) {
        let Ok(mut inner) = self.shared.inner.lock() else {
            return;
        };
        match inner.map.get(&self.page).copied() {
            Some(idx) if inner.frames[idx].pins > 0 => {
                inner.frames[idx].pins -= 1;
                if inner.frames[idx].pins == 0 {
                    self.shared.frame_freed.notify_one();
                }
            }
            _ => {
                // A pin must always find its frame; anything else means
                // the pairing contract was broken somewhere.
                error!(page = ?self.page, "unpin without a matching pinned frame");
                debug_assert!(false, "unpaired pin release");
            }
        }
    }
}
