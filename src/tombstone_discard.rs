//! Tombstone discard: dropping expired deletion markers from the index.
//!
//! A deletion marker has to outlive the replication horizon, otherwise a
//! lagging replica could resurrect the deleted value. Once older than
//! `tombstone_age` it (and any equally old local-removal marker) is removed
//! from the index in batches, pausing the scan between batches so the map is
//! never locked for long.

use crate::store::StoreInner;
use crate::timestamp::{self, DELETION, LOCAL_REMOVAL};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One tombstone discard pass
pub(crate) fn tombstone_discard_pass(store: &Arc<StoreInner>, abort: &AtomicU32) {
    let begin = std::time::Instant::now();
    let cutoff = timestamp::now()
        .saturating_sub(timestamp::age_to_bits(u64::from(store.config.tombstone_age)));
    let batch_size = store.config.tombstone_discard_batch_size.max(1);

    let mut discarded: u64 = 0;
    let mut expired: Vec<(u64, u64, u64)> = Vec::new();
    let mut start: u64 = 0;
    loop {
        if abort.load(Ordering::SeqCst) != 0 {
            break;
        }
        expired.clear();
        let (next_start, more) = store.loc_map.scan_callback(
            start,
            u64::MAX,
            0,
            0,
            cutoff,
            batch_size,
            &mut |key_a, key_b, tsb, _length| {
                if tsb & (DELETION | LOCAL_REMOVAL) != 0 {
                    expired.push((key_a, key_b, tsb));
                }
                true
            },
        );
        for &(key_a, key_b, tsb) in &expired {
            store.loc_map.remove(key_a, key_b, tsb);
        }
        discarded += expired.len() as u64;
        if !more {
            break;
        }
        start = next_start;
    }

    if discarded > 0 {
        log::debug!("discarded {discarded} expired tombstones in {:?}", begin.elapsed());
    }
}
