#[cfg(test)]
mod tests {
    use crate::level::{Level, LevelError};
    use crate::pagestore::FileManager;
    use crate::pagestore::cache::ReadCache;
    use crate::run::RunContext;
    use crate::schema::{Record, RecordSchema, i64_key_cmp};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context(tmp: &TempDir) -> Arc<RunContext> {
        let files = Arc::new(FileManager::new(tmp.path()).unwrap());
        let cache = Arc::new(ReadCache::new(64, Arc::clone(&files)));
        Arc::new(RunContext {
            files,
            cache,
            schema: RecordSchema {
                key_size: 8,
                value_size: 8,
                weight_size: 0,
                key_cmp: i64_key_cmp,
            },
            bloom_fpr: 0.01,
        })
    }

    fn records(range: std::ops::Range<i64>, ts_base: u64) -> Vec<Record> {
        range
            .clone()
            .map(|k| {
                Record::new(
                    k.to_be_bytes().to_vec(),
                    k.to_be_bytes().to_vec(),
                    1.0,
                    ts_base + (k - range.start) as u64,
                )
            })
            .collect()
    }

    fn leveling(ctx: &Arc<RunContext>, record_capacity: usize) -> Level {
        Level::new(1, record_capacity, Arc::clone(ctx), 1.0, true, false)
    }

    fn tiering(ctx: &Arc<RunContext>, runs: usize, record_capacity: usize) -> Level {
        Level::new(runs, record_capacity, Arc::clone(ctx), 1.0, true, false)
    }

    #[test]
    fn test_leveling_rewrites_single_run() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut level = leveling(&ctx, 1000);

        level.merge_with_sorted(records(0..100, 1), false).unwrap();
        assert_eq!(level.run_count(), 1);
        assert_eq!(level.record_count(), 100);

        level.merge_with_sorted(records(100..250, 101), false).unwrap();
        assert_eq!(level.run_count(), 1, "LEVELING keeps one run");
        assert_eq!(level.record_count(), 250);

        let got = level.get(&150i64.to_be_bytes(), u64::MAX).unwrap().unwrap();
        assert_eq!(got.value, 150i64.to_be_bytes());
    }

    #[test]
    fn test_tiering_emplaces_until_full() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut level = tiering(&ctx, 3, 10_000);

        for batch in 0..3 {
            let base = batch * 100;
            level
                .merge_with_sorted(records(base..base + 100, base as u64 + 1), false)
                .unwrap();
        }
        assert_eq!(level.run_count(), 3);
        assert!(!level.can_emplace_run());
        assert!(!level.can_merge_with(100));

        let err = level
            .merge_with_sorted(records(300..400, 301), false)
            .unwrap_err();
        assert!(matches!(err, LevelError::CapacityExceeded(_)));
        // Failure left the level untouched.
        assert_eq!(level.run_count(), 3);
        assert_eq!(level.record_count(), 300);
    }

    #[test]
    fn test_can_merge_with_respects_record_budget() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut level = leveling(&ctx, 150);

        level.merge_with_sorted(records(0..100, 1), false).unwrap();
        assert!(level.can_merge_with(50));
        assert!(!level.can_merge_with(51));
    }

    #[test]
    fn test_merge_with_level_drains_upper_contents() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);

        let mut upper = tiering(&ctx, 2, 1000);
        upper.merge_with_sorted(records(0..50, 1), false).unwrap();
        upper.merge_with_sorted(records(50..100, 51), false).unwrap();

        let mut lower = leveling(&ctx, 10_000);
        lower.merge_with_level(&upper, false).unwrap();

        // Source untouched; target holds everything in one run.
        assert_eq!(upper.run_count(), 2);
        assert_eq!(lower.run_count(), 1);
        assert_eq!(lower.record_count(), 100);
        let got = lower.get(&99i64.to_be_bytes(), u64::MAX).unwrap().unwrap();
        assert_eq!(got.value, 99i64.to_be_bytes());
    }

    #[test]
    fn test_newest_run_wins_lookups() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut level = tiering(&ctx, 2, 1000);

        let old = vec![Record::new(
            7i64.to_be_bytes().to_vec(),
            1i64.to_be_bytes().to_vec(),
            1.0,
            1,
        )];
        let new = vec![Record::new(
            7i64.to_be_bytes().to_vec(),
            2i64.to_be_bytes().to_vec(),
            1.0,
            2,
        )];
        level.merge_with_sorted(old, false).unwrap();
        level.merge_with_sorted(new, false).unwrap();

        let got = level.get(&7i64.to_be_bytes(), u64::MAX).unwrap().unwrap();
        assert_eq!(got.value, 2i64.to_be_bytes());
    }

    #[test]
    fn test_truncate_empties_level_and_files() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut level = leveling(&ctx, 1000);
        level.merge_with_sorted(records(0..100, 1), false).unwrap();

        let file_id = level.runs()[0].file_id().unwrap();
        assert!(ctx.files.get(file_id).is_some());

        level.truncate();
        assert_eq!(level.run_count(), 0);
        assert_eq!(level.record_count(), 0);
        assert!(
            ctx.files.get(file_id).is_none(),
            "defunct run file should be retired with its last reference"
        );
    }

    #[test]
    fn test_truncate_defers_file_removal_to_readers() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut level = leveling(&ctx, 1000);
        level.merge_with_sorted(records(0..100, 1), false).unwrap();

        let held = Arc::clone(&level.runs()[0]);
        let file_id = held.file_id().unwrap();

        level.truncate();
        // A reader still holds the run; the file must survive.
        assert!(ctx.files.get(file_id).is_some());
        assert_eq!(held.record_count(), 100);

        drop(held);
        assert!(ctx.files.get(file_id).is_none());
    }

    fn tombstones(range: std::ops::Range<i64>, ts_base: u64) -> Vec<Record> {
        range
            .clone()
            .map(|k| {
                Record::new_tombstone(
                    k.to_be_bytes().to_vec(),
                    k.to_be_bytes().to_vec(),
                    ts_base + (k - range.start) as u64,
                )
            })
            .collect()
    }

    #[test]
    fn test_deleted_proportion_compacts_bottom_level() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        // Threshold 0.2: 100 live + 40 matching tombstones is 0.4.
        // TIERING so the tombstone batch lands in its own run — the
        // emplace build cannot cancel across runs, only the guard's
        // whole-level rewrite can.
        let mut level = Level::new(3, 10_000, Arc::clone(&ctx), 0.2, true, false);

        level.merge_with_sorted(records(0..100, 1), true).unwrap();
        level.merge_with_sorted(tombstones(0..40, 200), true).unwrap();

        // The guard rewrote the bottom level: matched pairs cancelled.
        assert_eq!(level.run_count(), 1);
        assert_eq!(level.tombstone_count(), 0);
        assert_eq!(level.record_count(), 60);
        assert!(level.get(&10i64.to_be_bytes(), u64::MAX).unwrap().is_none());
        assert!(level.get(&50i64.to_be_bytes(), u64::MAX).unwrap().is_some());
    }

    #[test]
    fn test_deleted_proportion_above_bottom_collapses_without_cancelling() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut level = Level::new(3, 10_000, Arc::clone(&ctx), 0.2, true, false);

        level.merge_with_sorted(records(0..100, 1), false).unwrap();
        level
            .merge_with_sorted(tombstones(0..40, 200), false)
            .unwrap();

        // The guard only collapsed the runs: a tombstone here may still
        // mask a live record at a deeper level, so every one survives.
        assert_eq!(level.run_count(), 1);
        assert_eq!(level.tombstone_count(), 40);
        assert_eq!(level.record_count(), 140);

        // Masking stays intact: the newest entry for a cancelled-
        // looking key is its tombstone, not silence.
        let newest = level.get(&10i64.to_be_bytes(), u64::MAX).unwrap().unwrap();
        assert!(newest.tombstone);
    }

    #[test]
    fn test_deleted_proportion_above_bottom_defers_on_single_run() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        // LEVELING: the tombstones rewrite into the one resident run
        // (no cancellation above the bottom); with nothing left to
        // collapse the guard defers to the next merge-down.
        let mut level = Level::new(1, 10_000, Arc::clone(&ctx), 0.2, true, false);

        level.merge_with_sorted(records(0..100, 1), false).unwrap();
        level
            .merge_with_sorted(tombstones(0..40, 200), false)
            .unwrap();

        assert_eq!(level.run_count(), 1);
        assert_eq!(level.tombstone_count(), 40);
        assert_eq!(level.record_count(), 140);
    }

    #[test]
    fn test_memory_level_builds_memory_runs() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut level = Level::new(1, 1000, Arc::clone(&ctx), 1.0, true, true);

        level.merge_with_sorted(records(0..100, 1), false).unwrap();
        assert!(level.runs()[0].is_memory_resident());
        assert!(level.memory_utilization() > 0);

        let got = level.get(&42i64.to_be_bytes(), u64::MAX).unwrap().unwrap();
        assert_eq!(got.value, 42i64.to_be_bytes());
    }

    #[test]
    fn test_start_scan_merges_runs_in_order() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut level = tiering(&ctx, 2, 1000);
        level.merge_with_sorted(records(50..100, 51), false).unwrap();
        level.merge_with_sorted(records(0..50, 1), false).unwrap();

        let keys: Vec<i64> = level
            .start_scan()
            .map(|r| i64::from_be_bytes(r.key.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(keys, (0..100).collect::<Vec<_>>());
    }
}
