use test_log::test;
use value_store::{Config, Error, ValueStore};

fn small_config(path: &std::path::Path) -> Config {
    Config {
        value_cap: 100,
        checksum_interval: 64,
        workers: 2,
        ..Config::default()
    }
    .path(path)
}

#[test]
fn write_then_read() -> value_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ValueStore::open(small_config(dir.path()))?;

    assert_eq!(store.write(1, 2, 3, b"testing")?, 0);

    let mut value = Vec::new();
    let micros = store.read(1, 2, &mut value)?;
    assert_eq!(micros, 3);
    assert_eq!(value, b"testing");

    assert_eq!(store.lookup(1, 2)?, (3, 7));

    store.close()?;
    Ok(())
}

#[test]
fn delete_shadows_and_reports_its_timestamp() -> value_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ValueStore::open(small_config(dir.path()))?;

    store.write(1, 2, 3, b"abc")?;
    assert_eq!(store.delete(1, 2, 3)?, 3);

    let mut value = Vec::new();
    match store.read(1, 2, &mut value) {
        Err(Error::NotFound { timestamp_bits }) => assert_eq!(timestamp_bits, 0x301),
        other => panic!("expected NotFound, got {other:?}"),
    }

    // A later write resurrects the key
    store.write(1, 2, 4, b"back")?;
    value.clear();
    assert_eq!(store.read(1, 2, &mut value)?, 4);
    assert_eq!(value, b"back");

    // A key never written reports timestamp 0
    match store.read(9, 9, &mut value) {
        Err(Error::NotFound { timestamp_bits }) => assert_eq!(timestamp_bits, 0),
        other => panic!("expected NotFound, got {other:?}"),
    }

    store.close()?;
    Ok(())
}

#[test]
fn older_write_is_a_noop() -> value_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ValueStore::open(small_config(dir.path()))?;

    store.write(7, 7, 10, b"new")?;
    assert_eq!(store.write(7, 7, 5, b"old")?, 10);

    let mut value = Vec::new();
    assert_eq!(store.read(7, 7, &mut value)?, 10);
    assert_eq!(value, b"new");

    store.close()?;
    Ok(())
}

#[test]
fn value_cap_boundary() -> value_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ValueStore::open(small_config(dir.path()))?;

    store.write(1, 1, 1, &[0u8; 100])?;
    assert!(matches!(
        store.write(1, 2, 1, &[0u8; 101]),
        Err(Error::ValueTooLarge)
    ));

    store.close()?;
    Ok(())
}

#[test]
fn disabled_writes_reject() -> value_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ValueStore::open(small_config(dir.path()))?;

    store.disable_writes();
    assert!(matches!(store.write(1, 1, 1, b"x"), Err(Error::Disabled)));
    assert!(matches!(store.delete(1, 1, 2), Err(Error::Disabled)));

    store.enable_writes();
    store.write(1, 1, 3, b"x")?;

    store.close()?;
    Ok(())
}

#[test]
fn concurrent_writers_resolve_by_timestamp() -> value_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ValueStore::open(small_config(dir.path()))?;

    std::thread::scope(|scope| {
        for t in 1..=8u64 {
            let store = store.clone();
            scope.spawn(move || {
                for micros in (t..100).step_by(8) {
                    store
                        .write(42, 42, micros, micros.to_string().as_bytes())
                        .expect("write");
                }
            });
        }
    });

    let mut value = Vec::new();
    assert_eq!(store.read(42, 42, &mut value)?, 99);
    assert_eq!(value, b"99");

    store.close()?;
    Ok(())
}

#[test]
fn close_is_idempotent() -> value_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ValueStore::open(small_config(dir.path()))?;
    store.write(1, 1, 1, b"x")?;
    store.close()?;
    store.close()?;
    Ok(())
}
