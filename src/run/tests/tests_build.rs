#[cfg(test)]
mod tests {
    use crate::run::builder::{BuildOptions, build_run};
    use crate::run::tests::helpers::*;
    use crate::run::{DiskRun, Run, records_per_page};
    use crate::schema::Record;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn opts(n: usize) -> BuildOptions {
        BuildOptions {
            expected_records: n,
            bloom_filters: true,
            purge_tombstones: false,
            memory_resident: false,
        }
    }

    #[test]
    fn test_disk_run_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, false);

        let records: Vec<Record> = (0..1000).map(|k| rec(k, k * 10, k as u64 + 1)).collect();
        let run = build_run(&ctx, vec![Box::new(records.clone().into_iter())], &opts(1000)).unwrap();

        assert_eq!(run.record_count(), 1000);
        assert_eq!(run.tombstone_count(), 0);
        assert_eq!(run.min_key(), 0i64.to_be_bytes());
        assert_eq!(run.max_key(), 999i64.to_be_bytes());

        let scanned: Vec<Record> = run.scan().collect();
        assert_eq!(scanned, records);
    }

    #[test]
    fn test_run_is_sorted_and_page_counts_agree() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, false);

        // Unsorted inputs are the merge iterator's job; feed two sorted halves.
        let evens: Vec<Record> = (0..500).map(|i| rec(i * 2, 0, 2 * i as u64 + 1)).collect();
        let odds: Vec<Record> = (0..500).map(|i| rec(i * 2 + 1, 0, 2 * i as u64 + 2)).collect();

        let run = build_run(
            &ctx,
            vec![Box::new(evens.into_iter()), Box::new(odds.into_iter())],
            &opts(1000),
        )
        .unwrap();

        let Run::Disk(disk) = &run else {
            panic!("expected a disk run")
        };
        let rpp = records_per_page(&ctx.schema);
        assert_eq!(
            disk.leaf_page_count() as usize,
            1000usize.div_ceil(rpp),
            "leaf pages should exactly cover the records"
        );

        let scanned: Vec<i64> = run.scan().map(|r| key_of(&r)).collect();
        let expected: Vec<i64> = (0..1000).collect();
        assert_eq!(scanned, expected);
    }

    #[test]
    fn test_reopen_after_build() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, false);

        let records: Vec<Record> = (0..100).map(|k| rec(k, k, k as u64 + 1)).collect();
        let run = build_run(&ctx, vec![Box::new(records.into_iter())], &opts(100)).unwrap();
        let file_id = run.file_id().unwrap();
        drop(run);

        let file = ctx.files.get(file_id).unwrap();
        let reopened = DiskRun::open(Arc::clone(&file), &ctx).unwrap();
        assert_eq!(reopened.record_count(), 100);
        assert_eq!(
            reopened.get(&42i64.to_be_bytes(), u64::MAX).unwrap().unwrap().value,
            42i64.to_be_bytes()
        );
    }

    #[test]
    fn test_duplicate_triples_collapse() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, false);

        let a = vec![rec(1, 10, 5), rec(2, 20, 6)];
        let b = vec![rec(1, 10, 5), rec(3, 30, 7)];
        let run = build_run(
            &ctx,
            vec![Box::new(a.into_iter()), Box::new(b.into_iter())],
            &opts(4),
        )
        .unwrap();

        assert_eq!(run.record_count(), 3);
    }

    #[test]
    fn test_purge_cancels_tombstone_record_pairs() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, false);

        let live = vec![rec(1, 10, 1), rec(2, 20, 2), rec(3, 30, 3)];
        let tombs = vec![tomb(2, 20, 5)];
        let run = build_run(
            &ctx,
            vec![Box::new(live.into_iter()), Box::new(tombs.into_iter())],
            &BuildOptions {
                expected_records: 4,
                bloom_filters: false,
                purge_tombstones: true,
                memory_resident: false,
            },
        )
        .unwrap();

        let keys: Vec<i64> = run.scan().map(|r| key_of(&r)).collect();
        assert_eq!(keys, vec![1, 3]);
        assert_eq!(run.tombstone_count(), 0);
    }

    #[test]
    fn test_purge_keeps_tombstone_without_match() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, false);

        // Tombstone for a value that never existed at this level must
        // survive (it may mask a record somewhere deeper that merges in
        // later).
        let run = build_run(
            &ctx,
            vec![Box::new(vec![rec(1, 10, 1), tomb(1, 99, 2)].into_iter())],
            &BuildOptions {
                expected_records: 2,
                bloom_filters: false,
                purge_tombstones: true,
                memory_resident: false,
            },
        )
        .unwrap();

        assert_eq!(run.record_count(), 2);
        assert_eq!(run.tombstone_count(), 1);
    }

    #[test]
    fn test_purge_drops_tag_deleted_records() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, false);

        let mut tagged = rec(2, 20, 2);
        tagged.deleted = true;
        let run = build_run(
            &ctx,
            vec![Box::new(vec![rec(1, 10, 1), tagged, rec(3, 30, 3)].into_iter())],
            &BuildOptions {
                expected_records: 3,
                bloom_filters: false,
                purge_tombstones: true,
                memory_resident: false,
            },
        )
        .unwrap();

        let keys: Vec<i64> = run.scan().map(|r| key_of(&r)).collect();
        assert_eq!(keys, vec![1, 3]);
    }

    #[test]
    fn test_memory_resident_build() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, false);

        let records: Vec<Record> = (0..50).map(|k| rec(k, k, k as u64 + 1)).collect();
        let run = build_run(
            &ctx,
            vec![Box::new(records.into_iter())],
            &BuildOptions {
                expected_records: 50,
                bloom_filters: true,
                purge_tombstones: false,
                memory_resident: true,
            },
        )
        .unwrap();

        assert!(run.is_memory_resident());
        assert!(run.file_id().is_none());
        assert_eq!(run.record_count(), 50);
        let keys: Vec<i64> = run.scan().map(|r| key_of(&r)).collect();
        assert_eq!(keys, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_build() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, false);

        let run = build_run(&ctx, vec![Box::new(std::iter::empty())], &opts(0)).unwrap();
        assert_eq!(run.record_count(), 0);
        assert_eq!(run.scan().count(), 0);
    }

    #[test]
    fn test_weighted_build_carries_alias() {
        use rand::SeedableRng;
        use rand::rngs::StdRng;
        use std::collections::HashMap;

        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, true);

        // Weights w_i = i over keys 1..=100.
        let records: Vec<Record> = (1..=100)
            .map(|k| weighted_rec(k, k as f64, k as u64))
            .collect();
        let run = build_run(&ctx, vec![Box::new(records.into_iter())], &opts(100)).unwrap();

        let Run::Disk(disk) = &run else {
            panic!("expected a disk run")
        };
        let mut rng = StdRng::seed_from_u64(0);
        let mut cached = None;
        let mut counts: HashMap<i64, usize> = HashMap::new();
        let draws = 100_000;
        for _ in 0..draws {
            let rec = disk.sample_weighted(&mut rng, &mut cached).unwrap().unwrap();
            *counts.entry(key_of(&rec)).or_default() += 1;
        }

        let total_weight: f64 = (1..=100).map(|k| k as f64).sum();
        for k in [1i64, 25, 50, 75, 100] {
            let expected = draws as f64 * k as f64 / total_weight;
            let got = *counts.get(&k).unwrap_or(&0) as f64;
            assert!(
                (got - expected).abs() < expected.mul_add(0.25, 20.0),
                "key {k}: {got} draws vs expected {expected}"
            );
        }
    }
}
