#[cfg(test)]
mod tests {
    use crate::memtable::MemtableType;
    use crate::tree::tests::helpers::*;
    use crate::tree::{LsmTree, MergePolicy, TreeError};
    use tempfile::TempDir;

    #[test]
    fn test_insert_then_get() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = open(&tmp, small_config());

        put(&tree, 1, 10);
        put(&tree, 2, 20);
        put(&tree, 3, 30);

        assert_eq!(get_val(&tree, 2), Some(20));
        assert_eq!(get_val(&tree, 9), None);
        assert_eq!(tree.record_count(), 3);
    }

    #[test]
    fn test_newer_value_wins() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = open(&tmp, small_config());

        put(&tree, 7, 70);
        put(&tree, 7, 71);
        assert_eq!(get_val(&tree, 7), Some(71));

        // Still true after the data ages through merges.
        for k in 100..400 {
            put(&tree, k, k);
        }
        tree.flush().unwrap();
        assert_eq!(get_val(&tree, 7), Some(71));
    }

    #[test]
    fn test_get_survives_merges() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = open(&tmp, small_config());

        for k in 0..1000 {
            put(&tree, k, k * 2);
        }
        tree.flush().unwrap();

        assert!(tree.depth() >= 1);
        for probe in [0, 1, 99, 100, 500, 999] {
            assert_eq!(get_val(&tree, probe), Some(probe * 2), "key {probe}");
        }
    }

    #[test]
    fn test_tombstone_delete_masks_record() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = open(&tmp, small_config());

        put(&tree, 5, 50);
        assert!(tree.delete(&key(5), &key(50)).unwrap());
        assert_eq!(get_val(&tree, 5), None);
        assert!(tree.has_tombstone(&key(5), &key(50), None).unwrap());

        // Deleting is idempotent at the visibility level.
        assert!(tree.delete(&key(5), &key(50)).unwrap());
        assert_eq!(get_val(&tree, 5), None);
    }

    #[test]
    fn test_tombstone_masks_across_levels() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = open(&tmp, small_config());

        // Push the record into the levels, then delete from the memtable.
        for k in 0..200 {
            put(&tree, k, k);
        }
        tree.flush().unwrap();
        assert!(tree.delete(&key(42), &key(42)).unwrap());

        assert_eq!(get_val(&tree, 42), None);
        assert_eq!(get_val(&tree, 43), Some(43));
    }

    #[test]
    fn test_tag_delete_in_place() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut config = small_config();
        config.delete_tagging = true;
        let tree = open(&tmp, config);

        put(&tree, 1, 10);
        for k in 100..350 {
            put(&tree, k, k);
        }
        tree.flush().unwrap();

        // Record now lives in a run; tagging flips it there.
        assert!(tree.delete(&key(1), &key(10)).unwrap());
        assert_eq!(get_val(&tree, 1), None);

        // No tombstone record was written.
        assert!(!tree.has_tombstone(&key(1), &key(10), None).unwrap());
        assert!(!tree.delete(&key(1), &key(10)).unwrap(), "nothing live remains");
    }

    #[test]
    fn test_update_replaces_value() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = open(&tmp, small_config());

        put(&tree, 3, 30);
        assert!(tree.update(&key(3), &key(30), &key(31)).unwrap());
        assert_eq!(get_val(&tree, 3), Some(31));

        assert!(!tree.update(&key(9), &key(90), &key(91)).unwrap());
    }

    #[test]
    fn test_leveling_grows_levels() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut config = small_config();
        config.memtable_capacity = 100;
        config.scale_factor = 4;
        let tree = open(&tmp, config);

        // 100 * 4 = 400 records fit level 0; push well past it.
        for k in 0..2000 {
            put(&tree, k, k);
        }
        tree.flush().unwrap();

        assert!(tree.depth() >= 2, "depth {}", tree.depth());
        assert_eq!(tree.record_count(), 2000);
        for probe in [0, 399, 400, 1999] {
            assert_eq!(get_val(&tree, probe), Some(probe), "key {probe}");
        }
    }

    #[test]
    fn test_tiering_accumulates_runs() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut config = small_config();
        config.policy = MergePolicy::Tiering;
        let tree = open(&tmp, config);

        for k in 0..1000 {
            put(&tree, k, k);
        }
        tree.flush().unwrap();

        assert_eq!(tree.record_count(), 1000);
        for probe in [0, 250, 999] {
            assert_eq!(get_val(&tree, probe), Some(probe), "key {probe}");
        }
    }

    #[test]
    fn test_memory_levels_stay_resident() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut config = small_config();
        config.memory_levels = 1;
        let tree = open(&tmp, config);

        for k in 0..300 {
            put(&tree, k, k);
        }
        tree.flush().unwrap();

        assert!(tree.memory_utilization() > 0);
        assert_eq!(get_val(&tree, 150), Some(150));
    }

    #[test]
    fn test_unsorted_memtables_serve_reads() {
        init_tracing();
        for kind in [MemtableType::Unsorted, MemtableType::UnsortedRejection] {
            let tmp = TempDir::new().unwrap();
            let mut config = small_config();
            config.memtable_type = kind;
            let tree = open(&tmp, config);

            for k in 0..500 {
                put(&tree, k, k + 1);
            }
            tree.flush().unwrap();

            assert_eq!(get_val(&tree, 123), Some(124), "{kind:?}");
            assert_eq!(tree.record_count(), 500);
        }
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = open(&tmp, small_config());

        assert!(matches!(
            tree.insert(b"short", &key(1)),
            Err(TreeError::InvalidArgument(_))
        ));
        assert!(matches!(
            tree.get(b"short", None),
            Err(TreeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let tmp = TempDir::new().unwrap();

        let mut config = small_config();
        config.scale_factor = 1;
        assert!(matches!(
            LsmTree::create(tmp.path(), config),
            Err(TreeError::Config(_))
        ));

        let mut config = small_config();
        config.max_deleted_proportion = 0.0;
        assert!(matches!(
            LsmTree::create(tmp.path(), config),
            Err(TreeError::Config(_))
        ));

        let mut config = small_config();
        config.key_size = 5000;
        assert!(matches!(
            LsmTree::create(tmp.path(), config),
            Err(TreeError::Config(_))
        ));
    }

    #[test]
    fn test_concurrent_inserters() {
        use std::sync::Arc;

        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut config = small_config();
        config.memtable_capacity = 500;
        config.policy = MergePolicy::Tiering;
        let tree = Arc::new(open(&tmp, config));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tree = Arc::clone(&tree);
                std::thread::spawn(move || {
                    for i in 0..2_500i64 {
                        let k = (t as i64) * 1_000_000 + i;
                        tree.insert(&key(k), &key(k)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        tree.flush().unwrap();

        assert_eq!(tree.record_count(), 10_000);
        assert_eq!(get_val(&tree, 2_000_123), Some(2_000_123));
    }
}
