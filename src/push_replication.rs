//! Push replication: unsolicited hand-off of keys this node does not own.
//!
//! Writes can land on any node (clients, pull responses, ring changes), so
//! each pass walks the partitions this node is NOT responsible for and
//! bulk-sets the live entries to the responsible replicas. Keys already
//! acknowledged by a responsible replica carry a local-removal marker and
//! are skipped; each pass sends the first message-cap worth of keys per
//! sub-range, relying on acks to shrink the backlog between passes.

use crate::bulk_set::BULK_SET_MSG_ENTRY_HEADER_LEN;
use crate::ring::{Msg, MsgRing};
use crate::store::StoreInner;
use crate::timestamp::{self, DELETION, LOCAL_REMOVAL};
use crate::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One outbound push-replication pass
pub(crate) fn out_push_replication_pass(store: &Arc<StoreInner>, abort: &AtomicU32) {
    let (Some(ring), Some(_)) = (&store.ring, &store.bulk_set) else {
        return;
    };
    let begin = std::time::Instant::now();

    let ring_version = ring.version();
    let partition_bit_count = u32::from(ring.partition_bit_count()).min(32);
    let partition_max = (1u64 << partition_bit_count) - 1;
    let worker_max = store.config.out_push_replication_workers.max(1) as u64 - 1;
    // Each worker owns a slice of every partition's key range
    let partition_span = u64::MAX >> partition_bit_count;
    let worker_piece = (partition_span / (worker_max + 1)).max(1);

    std::thread::scope(|scope| {
        for worker in 0..=worker_max {
            let ring = ring.clone();
            scope.spawn(move || {
                let mut list: Vec<(u64, u64)> = Vec::new();
                let mut value_buf: Vec<u8> = Vec::new();
                let partition_begin = (partition_max + 1) / (worker_max + 1) * worker;
                let mut partition = partition_begin;
                loop {
                    if abort.load(Ordering::SeqCst) != 0 || ring.version() != ring_version {
                        break;
                    }
                    if !ring.responsible(partition as u32) {
                        push_partition_piece(
                            store,
                            &ring,
                            ring_version,
                            partition,
                            partition_bit_count,
                            worker,
                            worker_max,
                            worker_piece,
                            abort,
                            &mut list,
                            &mut value_buf,
                        );
                    }
                    partition += 1;
                    if partition > partition_max {
                        partition = 0;
                    }
                    if partition == partition_begin {
                        break;
                    }
                }
            });
        }
    });

    log::debug!("out push replication pass took {:?}", begin.elapsed());
}

#[allow(clippy::too_many_arguments)]
fn push_partition_piece(
    store: &StoreInner,
    ring: &Arc<dyn MsgRing>,
    ring_version: u64,
    partition: u64,
    partition_bit_count: u32,
    worker: u64,
    worker_max: u64,
    worker_piece: u64,
    abort: &AtomicU32,
    list: &mut Vec<(u64, u64)>,
    value_buf: &mut Vec<u8>,
) {
    let partition_on_left = if partition_bit_count == 0 {
        0
    } else {
        partition << (64 - partition_bit_count)
    };
    let range_begin = partition_on_left + worker_piece * worker;
    let range_end = if worker != worker_max {
        partition_on_left + worker_piece * (worker + 1) - 1
    } else if partition != partition_max_for(partition_bit_count) {
        ((partition + 1) << (64 - partition_bit_count)) - 1
    } else {
        u64::MAX
    };

    let now = timestamp::now();
    let cutoff = now.saturating_sub(timestamp::age_to_bits(u64::from(
        store.config.replication_ignore_recent,
    )));
    let tombstone_cutoff =
        now.saturating_sub(timestamp::age_to_bits(u64::from(store.config.tombstone_age)));

    // Gather the first message-cap worth of matching keys
    let mut available = store.config.out_bulk_set_msg_cap as i64;
    list.clear();
    store.loc_map.scan_callback(
        range_begin,
        range_end,
        0,
        LOCAL_REMOVAL,
        cutoff,
        u64::MAX,
        &mut |key_a, key_b, tsb, length| {
            let entry_len = BULK_SET_MSG_ENTRY_HEADER_LEN as i64 + i64::from(length);
            if tsb & DELETION == 0 || tsb >= tombstone_cutoff {
                list.push((key_a, key_b));
                available -= entry_len;
                if available < entry_len {
                    return false;
                }
            }
            true
        },
    );
    if list.is_empty() || abort.load(Ordering::SeqCst) != 0 || ring.version() != ring_version {
        return;
    }

    let Some(bulk_set) = &store.bulk_set else {
        return;
    };
    let Some(mut msg) = bulk_set.acquire_out() else {
        return;
    };
    for &(key_a, key_b) in list.iter() {
        value_buf.clear();
        let tsb = match store.read_raw(key_a, key_b, value_buf) {
            Ok(tsb) => tsb,
            // A tombstone still worth replicating, or a fully removed key
            Err(Error::NotFound { timestamp_bits }) if timestamp_bits != 0 => timestamp_bits,
            Err(_) => continue,
        };
        if tsb & LOCAL_REMOVAL == 0
            && tsb < cutoff
            && (tsb & DELETION == 0 || tsb >= tombstone_cutoff)
            && !msg.add(key_a, key_b, tsb, value_buf)
        {
            break;
        }
    }
    if msg.is_empty() {
        Box::new(msg).done();
    } else {
        ring.msg_to_other_replicas(
            partition as u32,
            Box::new(msg),
            store.config.out_push_replication_msg_timeout,
        );
    }
}

fn partition_max_for(partition_bit_count: u32) -> u64 {
    (1u64 << partition_bit_count) - 1
}
