mod common;

use common::{now_micros, wait_for, Cluster, LoopbackRing};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;
use value_store::{Config, Error, ValueStore};

fn node_config(path: &std::path::Path) -> Config {
    Config {
        value_cap: 1024,
        checksum_interval: 256,
        workers: 2,
        // Background loops stay disabled; passes are triggered explicitly
        background_interval: 3600,
        ..Config::default()
    }
    .path(path)
}

fn two_nodes(
    cluster: &Arc<Cluster>,
    dir_a: &std::path::Path,
    dir_b: &std::path::Path,
) -> value_store::Result<(ValueStore, ValueStore)> {
    let a = ValueStore::open_with_ring(
        node_config(dir_a),
        Arc::new(LoopbackRing {
            node_id: 1,
            partition_bit_count: 2,
            responsible: true,
            cluster: cluster.clone(),
        }),
    )?;
    let b = ValueStore::open_with_ring(
        node_config(dir_b),
        Arc::new(LoopbackRing {
            node_id: 2,
            partition_bit_count: 2,
            responsible: true,
            cluster: cluster.clone(),
        }),
    )?;
    cluster.register(1, a.clone());
    cluster.register(2, b.clone());
    Ok((a, b))
}

#[test]
fn pull_pass_fetches_newer_copy() -> value_store::Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let cluster = Cluster::new();
    let (a, b) = two_nodes(&cluster, dir_a.path(), dir_b.path())?;

    // Both copies predate the replication-ignore-recent horizon
    let t_old = now_micros() - 3_600_000_000;
    let t_new = now_micros() - 1_800_000_000;
    a.write(7, 7, t_old, b"stale")?;
    b.write(7, 7, t_new, b"fresh")?;

    // A advertises its bloom; B answers with the copy A is missing
    a.out_pull_replication_pass();

    assert!(wait_for(Duration::from_secs(10), || {
        let mut value = Vec::new();
        matches!(a.read(7, 7, &mut value), Ok(t) if t == t_new && value == b"fresh")
    }));

    a.close()?;
    b.close()?;
    Ok(())
}

#[test]
fn pull_passes_converge_disjoint_sets() -> value_store::Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let cluster = Cluster::new();
    let (a, b) = two_nodes(&cluster, dir_a.path(), dir_b.path())?;

    let base = now_micros() - 3_600_000_000;
    for i in 0..50u64 {
        let key_a = i << 32;
        if i % 2 == 0 {
            a.write(key_a, i, base + i, format!("from-a-{i}").as_bytes())?;
        } else {
            b.write(key_a, i, base + i, format!("from-b-{i}").as_bytes())?;
        }
    }

    a.out_pull_replication_pass();
    b.out_pull_replication_pass();

    assert!(wait_for(Duration::from_secs(10), || {
        (0..50u64).all(|i| {
            let key_a = i << 32;
            let mut va = Vec::new();
            let mut vb = Vec::new();
            a.read(key_a, i, &mut va).is_ok()
                && b.read(key_a, i, &mut vb).is_ok()
                && va == vb
        })
    }));

    a.close()?;
    b.close()?;
    Ok(())
}

#[test]
fn tombstones_propagate_through_pull() -> value_store::Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let cluster = Cluster::new();
    let (a, b) = two_nodes(&cluster, dir_a.path(), dir_b.path())?;

    let t_write = now_micros() - 3_600_000_000;
    let t_delete = t_write + 1_000_000;
    a.write(3, 3, t_write, b"doomed")?;
    b.write(3, 3, t_write, b"doomed")?;
    b.delete(3, 3, t_delete)?;

    a.out_pull_replication_pass();

    assert!(wait_for(Duration::from_secs(10), || {
        let mut value = Vec::new();
        matches!(
            a.read(3, 3, &mut value),
            Err(Error::NotFound { timestamp_bits }) if timestamp_bits == (t_delete << 8) | 1
        )
    }));

    a.close()?;
    b.close()?;
    Ok(())
}

#[test]
fn push_pass_hands_off_unowned_keys() -> value_store::Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let cluster = Cluster::new();

    // A owns nothing; B is the responsible replica
    let a = ValueStore::open_with_ring(
        node_config(dir_a.path()),
        Arc::new(LoopbackRing {
            node_id: 1,
            partition_bit_count: 2,
            responsible: false,
            cluster: cluster.clone(),
        }),
    )?;
    let b = ValueStore::open_with_ring(
        node_config(dir_b.path()),
        Arc::new(LoopbackRing {
            node_id: 2,
            partition_bit_count: 2,
            responsible: true,
            cluster: cluster.clone(),
        }),
    )?;
    cluster.register(1, a.clone());
    cluster.register(2, b.clone());

    let t_old = now_micros() - 3_600_000_000;
    a.write(11, 12, t_old, b"belongs to b")?;

    a.out_push_replication_pass();

    assert!(wait_for(Duration::from_secs(10), || {
        let mut value = Vec::new();
        matches!(b.read(11, 12, &mut value), Ok(t) if t == t_old && value == b"belongs to b")
    }));

    a.close()?;
    b.close()?;
    Ok(())
}

#[test]
fn acked_keys_get_local_removal() -> value_store::Result<()> {
    let dir_a = tempfile::tempdir()?;
    let cluster = Cluster::new();
    let a = ValueStore::open_with_ring(
        node_config(dir_a.path()),
        Arc::new(LoopbackRing {
            node_id: 1,
            partition_bit_count: 2,
            responsible: false,
            cluster: cluster.clone(),
        }),
    )?;
    cluster.register(1, a.clone());

    let t = now_micros() - 3_600_000_000;
    a.write(20, 21, t, b"not mine")?;

    // The responsible replica confirms it holds the key
    let mut ack = vec![0u8; 8];
    ack.extend_from_slice(&20u64.to_be_bytes());
    ack.extend_from_slice(&21u64.to_be_bytes());
    ack.extend_from_slice(&(t << 8).to_be_bytes());
    a.receive_bulk_set_ack(&mut Cursor::new(&ack), ack.len() as u64)?;

    // The local copy is retired from reads and future replication
    assert!(wait_for(Duration::from_secs(5), || {
        let mut value = Vec::new();
        matches!(
            a.read(20, 21, &mut value),
            Err(Error::NotFound { timestamp_bits }) if timestamp_bits == (t << 8) | 2
        )
    }));

    a.close()?;
    Ok(())
}

#[test]
fn short_pull_replication_frame_is_rejected() -> value_store::Result<()> {
    let dir_a = tempfile::tempdir()?;
    let cluster = Cluster::new();
    let a = ValueStore::open_with_ring(
        node_config(dir_a.path()),
        Arc::new(LoopbackRing {
            node_id: 1,
            partition_bit_count: 2,
            responsible: true,
            cluster: cluster.clone(),
        }),
    )?;
    cluster.register(1, a.clone());

    // Claims a bloom body it does not deliver
    let bytes = vec![0u8; 30];
    let err = a
        .receive_pull_replication(&mut Cursor::new(&bytes), 200)
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

    a.close()?;
    Ok(())
}
