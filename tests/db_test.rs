use std::sync::Arc;
use std::time::{Duration, Instant};

use stratadb::{
    destroy_db, ColumnFamilyOptions, CompactionStyle, FifoCompactionOptions, FlushOptions,
    MemEnv, Options, PosixEnv, ReadOptions, StrataDb, U64AddOperator, WriteBatch, WriteOptions,
};

fn test_options() -> Options {
    // RUST_LOG-style visibility into background flush/compaction decisions.
    let _ = stderrlog::new().verbosity(1).init();
    Options {
        create_if_missing: true,
        ..Default::default()
    }
}

fn open_mem(env: &MemEnv, options: Options) -> StrataDb<MemEnv> {
    StrataDb::open(options, "db", env.clone()).unwrap()
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn basic_put_get_delete() {
    let env = MemEnv::new();
    let db = open_mem(&env, test_options());
    let wo = WriteOptions::default();
    let ro = ReadOptions::default();

    db.put(&wo, b"apple", b"red").unwrap();
    db.put(&wo, b"banana", b"yellow").unwrap();
    assert_eq!(db.get(&ro, b"apple").unwrap(), b"red");

    db.delete(&wo, b"apple").unwrap();
    assert!(db.get(&ro, b"apple").unwrap_err().is_not_found());

    let mut iter = db.new_iterator(&ro).unwrap();
    iter.seek_to_first();
    assert!(iter.valid());
    assert_eq!(iter.key(), b"banana");
    assert_eq!(iter.value(), b"yellow");
    iter.next();
    assert!(!iter.valid());
    iter.status().unwrap();
}

#[test]
fn crash_recovery_replays_synced_writes() {
    let env = MemEnv::new();
    {
        let db = open_mem(&env, test_options());
        let mut batch = WriteBatch::new();
        batch.put(b"k1", b"v1");
        batch.put(b"k2", b"v2");
        db.write(
            &WriteOptions {
                sync: true,
                ..Default::default()
            },
            batch,
        )
        .unwrap();
        // Dropped without any flush: recovery must come from the WAL.
    }

    let db = open_mem(&env, test_options());
    let ro = ReadOptions::default();
    assert_eq!(db.get(&ro, b"k1").unwrap(), b"v1");
    assert_eq!(db.get(&ro, b"k2").unwrap(), b"v2");

    let snapshot = db.get_snapshot();
    assert!(snapshot.sequence() >= 2);
    db.release_snapshot(snapshot);
}

#[test]
fn snapshot_isolation_and_compaction() {
    let env = MemEnv::new();
    let db = open_mem(&env, test_options());
    let wo = WriteOptions::default();
    let ro = ReadOptions::default();

    db.put(&wo, b"x", b"1").unwrap();
    let snapshot = db.get_snapshot();
    db.put(&wo, b"x", b"2").unwrap();

    assert_eq!(db.get(&ro, b"x").unwrap(), b"2");

    let snapshot_read = ReadOptions {
        snapshot: Some(snapshot.clone()),
        ..Default::default()
    };
    assert_eq!(db.get(&snapshot_read, b"x").unwrap(), b"1");

    db.release_snapshot(snapshot);

    // Repeated overwrite + flush + full compaction must not let the file
    // count grow without bound once snapshots are gone.
    for round in 0..5 {
        db.put(&wo, b"x", format!("{}", round + 3).as_bytes()).unwrap();
        db.flush(&FlushOptions { wait: true }).unwrap();
    }
    db.compact_range(None, None).unwrap();

    assert_eq!(db.get(&ro, b"x").unwrap(), b"7");
    let mut total_files = 0;
    for level in 0..7 {
        let prop = format!("stratadb.num-files-at-level{}", level);
        total_files += db
            .get_property(&prop)
            .unwrap()
            .parse::<usize>()
            .unwrap();
    }
    assert!(total_files <= 2, "{} files left after full compaction", total_files);
}

#[test]
fn level_compaction_keeps_keys_and_level1_disjoint() {
    let env = MemEnv::new();
    let mut options = test_options();
    options.level0_file_num_compaction_trigger = 2;
    options.max_mem_compaction_level = 0;
    let db = open_mem(&env, options);
    let wo = WriteOptions::default();
    let ro = ReadOptions::default();

    // Two flushed generations of the same 50,000 keys.
    for round in 0..2 {
        for i in 0..50_000u32 {
            db.put(
                &wo,
                format!("{:08}", i).as_bytes(),
                format!("value-{}-{}", round, i).as_bytes(),
            )
            .unwrap();
        }
        db.flush(&FlushOptions { wait: true }).unwrap();
    }

    wait_for("level-0 to drain", || {
        db.get_property("stratadb.num-files-at-level0")
            .unwrap()
            .parse::<usize>()
            .unwrap()
            <= 1
    });

    // Deeper levels picked up the data (disjointness at level >= 1 is
    // enforced internally on every version installation).
    let mut deeper = 0;
    for level in 1..7 {
        deeper += db
            .get_property(&format!("stratadb.num-files-at-level{}", level))
            .unwrap()
            .parse::<usize>()
            .unwrap();
    }
    assert!(deeper >= 1);

    for i in (0..50_000u32).step_by(997) {
        let value = db.get(&ro, format!("{:08}", i).as_bytes()).unwrap();
        assert_eq!(value, format!("value-1-{}", i).as_bytes());
    }
}

#[test]
fn batch_atomicity_across_reopen() {
    let env = MemEnv::new();
    {
        let db = open_mem(&env, test_options());
        db.put(&WriteOptions::default(), b"b", b"doomed").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"c", b"3");
        db.write(
            &WriteOptions {
                sync: true,
                ..Default::default()
            },
            batch,
        )
        .unwrap();
    }

    let db = open_mem(&env, test_options());
    let ro = ReadOptions::default();
    assert_eq!(db.get(&ro, b"a").unwrap(), b"1");
    assert!(db.get(&ro, b"b").unwrap_err().is_not_found());
    assert_eq!(db.get(&ro, b"c").unwrap(), b"3");
}

#[test]
fn iterator_is_stable_across_flush() {
    let env = MemEnv::new();
    let db = open_mem(&env, test_options());
    let wo = WriteOptions::default();

    for i in 0..100u32 {
        db.put(&wo, format!("key{:04}", i).as_bytes(), b"before").unwrap();
    }

    let mut iter = db.new_iterator(&ReadOptions::default()).unwrap();
    iter.seek_to_first();
    for _ in 0..50 {
        assert!(iter.valid());
        iter.next();
    }

    // Mutate and flush underneath the iterator.
    for i in 0..100u32 {
        db.put(&wo, format!("key{:04}", i).as_bytes(), b"after").unwrap();
    }
    db.flush(&FlushOptions { wait: true }).unwrap();

    let mut seen = 50;
    while iter.valid() {
        assert_eq!(
            iter.key(),
            format!("key{:04}", seen).as_bytes(),
            "iterator order changed by flush"
        );
        assert_eq!(iter.value(), b"before", "iterator saw a post-snapshot write");
        seen += 1;
        iter.next();
    }
    assert_eq!(seen, 100);
    iter.status().unwrap();
}

#[test]
fn reverse_iteration_matches_forward() {
    let env = MemEnv::new();
    let db = open_mem(&env, test_options());
    let wo = WriteOptions::default();

    for i in 0..50u32 {
        db.put(&wo, format!("key{:04}", i).as_bytes(), b"v").unwrap();
    }
    db.delete(&wo, b"key0025").unwrap();

    let mut iter = db.new_iterator(&ReadOptions::default()).unwrap();
    let mut forward = Vec::new();
    iter.seek_to_first();
    while iter.valid() {
        forward.push(iter.key().to_vec());
        iter.next();
    }
    assert_eq!(forward.len(), 49);

    let mut backward = Vec::new();
    iter.seek_to_last();
    while iter.valid() {
        backward.push(iter.key().to_vec());
        iter.prev();
    }
    backward.reverse();
    assert_eq!(forward, backward);

    // Direction changes mid-stream keep the position coherent.
    iter.seek(b"key0030");
    assert_eq!(iter.key(), b"key0030");
    iter.prev();
    assert_eq!(iter.key(), b"key0029");
    iter.next();
    assert_eq!(iter.key(), b"key0030");
}

#[test]
fn merge_operands_survive_flush_and_compaction() {
    let env = MemEnv::new();
    let mut options = test_options();
    options.cf.merge_operator = Some(Arc::new(U64AddOperator {}));
    let db = open_mem(&env, options);
    let wo = WriteOptions::default();
    let ro = ReadOptions::default();

    db.put(&wo, b"counter", &100u64.to_le_bytes()).unwrap();
    db.merge(&wo, b"counter", &20u64.to_le_bytes()).unwrap();
    db.flush(&FlushOptions { wait: true }).unwrap();
    db.merge(&wo, b"counter", &3u64.to_le_bytes()).unwrap();

    assert_eq!(db.get(&ro, b"counter").unwrap(), 123u64.to_le_bytes().to_vec());

    db.compact_range(None, None).unwrap();
    assert_eq!(db.get(&ro, b"counter").unwrap(), 123u64.to_le_bytes().to_vec());

    let mut iter = db.new_iterator(&ro).unwrap();
    iter.seek_to_first();
    assert!(iter.valid());
    assert_eq!(iter.key(), b"counter");
    assert_eq!(iter.value(), 123u64.to_le_bytes().to_vec());
}

#[test]
fn multi_get_reads_one_snapshot() {
    let env = MemEnv::new();
    let db = open_mem(&env, test_options());
    let wo = WriteOptions::default();

    db.put(&wo, b"a", b"1").unwrap();
    db.put(&wo, b"b", b"2").unwrap();

    let results = db.multi_get(&ReadOptions::default(), &[b"a", b"b", b"missing"]);
    assert_eq!(results[0].as_ref().unwrap(), b"1");
    assert_eq!(results[1].as_ref().unwrap(), b"2");
    assert!(results[2].as_ref().unwrap_err().is_not_found());
}

#[test]
fn column_families_share_wal_and_recover() {
    let env = MemEnv::new();
    {
        let db = open_mem(&env, test_options());
        let metrics = db
            .create_column_family("metrics", ColumnFamilyOptions::default())
            .unwrap();
        let wo = WriteOptions {
            sync: true,
            ..Default::default()
        };
        db.put(&wo, b"shared", b"default").unwrap();
        db.put_cf(&wo, &metrics, b"shared", b"metrics").unwrap();
    }

    let (db, handles) = StrataDb::open_with_column_families(
        test_options(),
        "db",
        env,
        vec![
            stratadb::ColumnFamilyDescriptor::new(
                stratadb::DEFAULT_COLUMN_FAMILY_NAME,
                ColumnFamilyOptions::default(),
            ),
            stratadb::ColumnFamilyDescriptor::new("metrics", ColumnFamilyOptions::default()),
        ],
    )
    .unwrap();
    let metrics = handles.iter().find(|h| h.name() == "metrics").unwrap();

    let ro = ReadOptions::default();
    assert_eq!(db.get(&ro, b"shared").unwrap(), b"default");
    assert_eq!(db.get_cf(&ro, metrics, b"shared").unwrap(), b"metrics");
}

#[test]
fn updates_since_streams_committed_batches() {
    let env = MemEnv::new();
    let db = open_mem(&env, test_options());
    let wo = WriteOptions::default();

    db.put(&wo, b"a", b"1").unwrap();
    db.put(&wo, b"b", b"2").unwrap();
    db.put(&wo, b"c", b"3").unwrap();

    let mut iter = db.get_updates_since(2).unwrap();
    let first = iter.next_batch().unwrap().unwrap();
    assert_eq!(first.sequence, 2);
    let second = iter.next_batch().unwrap().unwrap();
    assert_eq!(second.sequence, 3);
    assert!(iter.next_batch().unwrap().is_none());
}

#[test]
fn fifo_compaction_drops_oldest_files() {
    let env = MemEnv::new();
    let mut options = test_options();
    options.compaction_style = CompactionStyle::Fifo;
    options.compaction_options_fifo = FifoCompactionOptions {
        max_table_files_size: 20 * 1024,
    };
    let db = open_mem(&env, options);
    let wo = WriteOptions::default();

    for round in 0..6u32 {
        for i in 0..100u32 {
            db.put(
                &wo,
                format!("{}-{:04}", round, i).as_bytes(),
                &[b'x'; 100],
            )
            .unwrap();
        }
        db.flush(&FlushOptions { wait: true }).unwrap();
    }

    wait_for("fifo eviction", || {
        let files: usize = db
            .get_property("stratadb.num-files-at-level0")
            .unwrap()
            .parse()
            .unwrap();
        files < 6
    });

    // Newest round is always readable.
    assert!(db
        .get(&ReadOptions::default(), b"5-0099")
        .is_ok());
}

#[test]
fn approximate_sizes_grow_with_data() {
    let env = MemEnv::new();
    let db = open_mem(&env, test_options());
    let wo = WriteOptions::default();

    for i in 0..2000u32 {
        db.put(&wo, format!("{:06}", i).as_bytes(), &[b'v'; 200]).unwrap();
    }
    db.flush(&FlushOptions { wait: true }).unwrap();

    let sizes = db.get_approximate_sizes(&[
        (b"000000".as_slice(), b"001000".as_slice()),
        (b"001000".as_slice(), b"001010".as_slice()),
    ]);
    assert!(sizes[0] > sizes[1]);
    assert!(sizes[0] > 0);
}

#[test]
fn background_error_blocks_writes_not_reads() {
    // Exercised indirectly: a full disk is hard to fake through MemEnv, but
    // dropping a column family that a queued write targets must fail the
    // write cleanly without poisoning reads.
    let env = MemEnv::new();
    let db = open_mem(&env, test_options());
    let wo = WriteOptions::default();

    db.put(&wo, b"stable", b"yes").unwrap();
    let cf = db
        .create_column_family("ephemeral", ColumnFamilyOptions::default())
        .unwrap();
    db.drop_column_family(&cf).unwrap();

    let mut batch = WriteBatch::new();
    batch.put_cf(cf.id(), b"k", b"v");
    assert!(db.write(&wo, batch).is_err());

    let mut batch = WriteBatch::new();
    batch.put_cf(cf.id(), b"k", b"v");
    let ignore = WriteOptions {
        ignore_missing_column_families: true,
        ..Default::default()
    };
    db.write(&ignore, batch).unwrap();

    assert_eq!(db.get(&ReadOptions::default(), b"stable").unwrap(), b"yes");
}

#[test]
fn posix_env_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("db");
    let env = PosixEnv::default();

    {
        let db = StrataDb::open(test_options(), &path, env).unwrap();
        let wo = WriteOptions {
            sync: true,
            ..Default::default()
        };
        for i in 0..500u32 {
            db.put(&wo, format!("key{:05}", i).as_bytes(), b"disk").unwrap();
        }
        db.flush(&FlushOptions { wait: true }).unwrap();
    }

    {
        let db = StrataDb::open(test_options(), &path, env).unwrap();
        assert_eq!(
            db.get(&ReadOptions::default(), b"key00123").unwrap(),
            b"disk"
        );

        // The lock excludes a second opener while this one lives.
        assert!(StrataDb::open(test_options(), &path, env).is_err());
    }

    destroy_db(env, &Options::default(), &path).unwrap();
    assert!(StrataDb::open(Options::default(), &path, env).is_err());
}
