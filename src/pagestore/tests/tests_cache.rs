#[cfg(test)]
mod tests {
    use crate::pagestore::cache::ReadCache;
    use crate::pagestore::{FileManager, PAGE_HEADER_LEN, PAGE_SIZE, PageId, page};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(pages: u32) -> (TempDir, Arc<FileManager>, crate::pagestore::FileId) {
        let tmp = TempDir::new().unwrap();
        let manager = Arc::new(FileManager::new(tmp.path()).unwrap());
        let file = manager.create_file().unwrap();
        for i in 0..pages {
            let pno = file.allocate();
            let mut buf = [0u8; PAGE_SIZE];
            page::init(&mut buf, 1);
            buf[PAGE_HEADER_LEN] = i as u8;
            page::seal(&mut buf);
            file.write_page(pno, &buf).unwrap();
        }
        let id = file.id();
        (tmp, manager, id)
    }

    #[test]
    fn test_pin_reads_correct_page() {
        let (_tmp, manager, fid) = setup(4);
        let cache = ReadCache::new(8, manager);

        for i in 0..4 {
            let frame = cache.pin(PageId::new(fid, i)).unwrap();
            assert_eq!(frame[PAGE_HEADER_LEN], i as u8);
        }
    }

    #[test]
    fn test_hits_do_not_count_as_misses() {
        let (_tmp, manager, fid) = setup(2);
        let cache = ReadCache::new(8, manager);

        let a = cache.pin(PageId::new(fid, 0)).unwrap();
        let b = cache.pin(PageId::new(fid, 0)).unwrap();
        drop((a, b));

        assert_eq!(cache.miss_count(), 1);
        assert!(cache.io_time().as_nanos() > 0);

        cache.reset_miss_count();
        cache.reset_io_time();
        assert_eq!(cache.miss_count(), 0);
        assert_eq!(cache.io_time().as_nanos(), 0);
    }

    #[test]
    fn test_lru_evicts_unpinned_only() {
        let (_tmp, manager, fid) = setup(4);
        let cache = ReadCache::new(2, manager);

        let pinned = cache.pin(PageId::new(fid, 0)).unwrap();
        let _evictable = cache.pin(PageId::new(fid, 1)).unwrap();
        drop(_evictable);

        // Page 2 must evict page 1 (page 0 is pinned).
        let _third = cache.pin(PageId::new(fid, 2)).unwrap();
        drop(_third);

        cache.reset_miss_count();
        let again = cache.pin(PageId::new(fid, 0)).unwrap();
        assert_eq!(cache.miss_count(), 0, "pinned page must stay resident");
        drop((pinned, again));

        let reread = cache.pin(PageId::new(fid, 1)).unwrap();
        assert_eq!(cache.miss_count(), 1, "evicted page must fault back in");
        drop(reread);
    }

    #[test]
    fn test_pin_batch_pins_all() {
        let (_tmp, manager, fid) = setup(6);
        let cache = ReadCache::new(8, manager);

        let ids: Vec<_> = (0..6).map(|i| PageId::new(fid, i)).collect();
        let frames = cache.pin_batch(&ids).unwrap();
        assert_eq!(frames.len(), 6);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame[PAGE_HEADER_LEN], i as u8);
        }
    }

    #[test]
    fn test_blocked_pin_wakes_on_unpin() {
        let (_tmp, manager, fid) = setup(3);
        let cache = Arc::new(ReadCache::new(2, manager));

        let a = cache.pin(PageId::new(fid, 0)).unwrap();
        let b = cache.pin(PageId::new(fid, 1)).unwrap();

        let waiter = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.pin(PageId::new(fid, 2)).unwrap().page_id())
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(a);
        let got = waiter.join().unwrap();
        assert_eq!(got.page, 2);
        drop(b);
    }

    #[test]
    fn test_invalidate_refreshes_bytes() {
        let (_tmp, manager, fid) = setup(1);
        let cache = ReadCache::new(4, Arc::clone(&manager));
        let pid = PageId::new(fid, 0);

        let before = cache.pin(pid).unwrap();
        assert_eq!(before[PAGE_HEADER_LEN], 0);
        drop(before);

        // Rewrite the page behind the cache, then invalidate.
        let file = manager.get(fid).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        file.read_page(0, &mut buf).unwrap();
        buf[PAGE_HEADER_LEN] = 0xEE;
        page::seal(&mut buf);
        file.write_page(0, &buf).unwrap();
        cache.invalidate(pid).unwrap();

        let after = cache.pin(pid).unwrap();
        assert_eq!(after[PAGE_HEADER_LEN], 0xEE);
    }
}
