mod common;

use common::now_micros;
use std::time::Duration;
use test_log::test;
use value_store::{Config, Error, ValueStore};

fn compacting_config(path: &std::path::Path) -> Config {
    Config {
        value_cap: 50,
        checksum_interval: 64,
        // Floors to 48 + value_cap: roughly one value per file pair
        values_file_cap: 1,
        workers: 1,
        compaction_age_threshold: 1,
        background_interval: 3600,
        ..Config::default()
    }
    .path(path)
}

fn values_files(path: &std::path::Path) -> usize {
    std::fs::read_dir(path)
        .unwrap()
        .filter_map(|d| d.ok())
        .filter(|d| d.path().extension().is_some_and(|e| e == "values"))
        .count()
}

#[test]
fn compaction_unlinks_fully_stale_files() -> value_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ValueStore::open(compacting_config(dir.path()))?;

    let base = now_micros() - 3_600_000_000;
    for i in 0..5u64 {
        store.write(i, i, base + i, format!("first-{i}").as_bytes())?;
    }
    store.flush()?;
    assert!(values_files(dir.path()) >= 5);

    // Rewrite everything; the first round of files is now pure waste
    for i in 0..5u64 {
        store.write(i, i, base + 1_000 + i, format!("second-{i}").as_bytes())?;
    }
    store.flush()?;
    let before_compaction = values_files(dir.path());

    // Candidates must be older than the age threshold
    std::thread::sleep(Duration::from_millis(1_500));
    store.compaction_pass();

    assert!(values_files(dir.path()) < before_compaction);

    let mut value = Vec::new();
    for i in 0..5u64 {
        value.clear();
        assert_eq!(store.read(i, i, &mut value)?, base + 1_000 + i);
        assert_eq!(value, format!("second-{i}").as_bytes());
    }

    store.close()?;
    Ok(())
}

#[test]
fn compaction_rewrites_live_entries_from_mixed_files() -> value_store::Result<()> {
    let dir = tempfile::tempdir()?;
    // A larger cap so several values share one file
    let config = Config {
        values_file_cap: 400,
        ..compacting_config(dir.path())
    };
    let store = ValueStore::open(config)?;

    let base = now_micros() - 3_600_000_000;
    for i in 0..8u64 {
        store.write(i, i, base + i, format!("keep-or-kill-{i}").as_bytes())?;
    }
    store.flush()?;

    // Overwrite most entries so the shared files cross the waste threshold,
    // but leave a couple live
    for i in 0..6u64 {
        store.write(i, i, base + 1_000 + i, format!("rewritten-{i}").as_bytes())?;
    }
    store.flush()?;

    std::thread::sleep(Duration::from_millis(1_500));
    store.compaction_pass();

    let mut value = Vec::new();
    for i in 0..6u64 {
        value.clear();
        assert_eq!(store.read(i, i, &mut value)?, base + 1_000 + i);
        assert_eq!(value, format!("rewritten-{i}").as_bytes());
    }
    // The survivors were carried over by the compactor
    for i in 6..8u64 {
        value.clear();
        assert_eq!(store.read(i, i, &mut value)?, base + i);
        assert_eq!(value, format!("keep-or-kill-{i}").as_bytes());
    }

    store.close()?;
    Ok(())
}

#[test]
fn compacted_data_survives_restart() -> value_store::Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let store = ValueStore::open(compacting_config(dir.path()))?;
        let base = now_micros() - 3_600_000_000;
        for i in 0..5u64 {
            store.write(i, i, base + i, b"v1")?;
            store.write(i, i, base + 100 + i, b"v2")?;
        }
        store.flush()?;
        std::thread::sleep(Duration::from_millis(1_500));
        store.compaction_pass();
        store.close()?;
    }

    let store = ValueStore::open(compacting_config(dir.path()))?;
    let mut value = Vec::new();
    for i in 0..5u64 {
        value.clear();
        store.read(i, i, &mut value)?;
        assert_eq!(value, b"v2");
    }
    store.close()?;
    Ok(())
}

#[test]
fn tombstone_discard_forgets_expired_deletes() -> value_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        tombstone_age: 1,
        ..compacting_config(dir.path())
    };
    let store = ValueStore::open(config)?;

    let t = now_micros();
    store.write(1, 2, t - 1, b"short lived")?;
    store.delete(1, 2, t)?;

    // Young tombstones are kept so lagging replicas hear about the delete
    store.tombstone_discard_pass();
    let mut value = Vec::new();
    match store.read(1, 2, &mut value) {
        Err(Error::NotFound { timestamp_bits }) => {
            assert_eq!(timestamp_bits, (t << 8) | 1);
        }
        other => panic!("expected NotFound, got {other:?}"),
    }

    std::thread::sleep(Duration::from_millis(1_500));
    store.tombstone_discard_pass();

    // The marker is gone entirely: the key reads as never-existed
    match store.read(1, 2, &mut value) {
        Err(Error::NotFound { timestamp_bits }) => assert_eq!(timestamp_bits, 0),
        other => panic!("expected NotFound, got {other:?}"),
    }

    store.close()?;
    Ok(())
}
