//! Compaction: reclaiming space from closed values files.
//!
//! A closed file becomes a candidate once it is old enough and enough of its
//! bytes are wasted: entries whose index location moved elsewhere, or
//! tombstones past the discard age. Compacting a file replays its still-live
//! entries through the normal write path; the index's monotonic set resolves
//! any race with concurrent writes, and the flusher's relocation moves the
//! pointers to the new file. The old pair is unlinked only after a flush
//! confirms nothing points at it anymore.
//!
//! Quarantined (checksum-failed) files are compacted unconditionally;
//! entries that cannot be read are marked for re-replication instead.

use crate::block::ValueBlock;
use crate::file::toc::read_records;
use crate::file::ValuesFile;
use crate::store::StoreInner;
use crate::timestamp::{self, DELETION, LOCAL_REMOVAL};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

struct FileStats {
    total_bytes: u64,
    stale_bytes: u64,
    total_records: u64,
    stale_records: u64,
}

impl FileStats {
    fn wasted_fraction(&self) -> f64 {
        if self.total_bytes > 0 {
            self.stale_bytes as f64 / self.total_bytes as f64
        } else if self.total_records > 0 && self.stale_records == self.total_records {
            // A file of nothing but dead tombstones is pure waste
            1.0
        } else {
            0.0
        }
    }
}

/// One compaction pass
pub(crate) fn compaction_pass(store: &Arc<StoreInner>, abort: &AtomicU32) {
    let begin = std::time::Instant::now();
    let candidates: Vec<Arc<ValuesFile>> = store
        .files
        .read()
        .expect("lock is poisoned")
        .iter()
        .filter(|f| f.is_closed())
        .cloned()
        .collect();

    let now_nano = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default();
    let age_floor_nano = i64::from(store.config.compaction_age_threshold) * 1_000_000_000;
    let workers = store.config.compaction_workers.max(1);

    std::thread::scope(|scope| {
        for worker in 0..workers {
            let candidates = &candidates;
            scope.spawn(move || {
                for file in candidates.iter().skip(worker).step_by(workers) {
                    if abort.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    let old_enough = now_nano - file.timestamp_nano() > age_floor_nano;
                    if !old_enough && !file.is_corrupt() {
                        continue;
                    }
                    let Ok(stats) = gather_stats(store, file) else {
                        continue;
                    };
                    if file.is_corrupt()
                        || stats.wasted_fraction() > store.config.compaction_threshold
                    {
                        if let Err(e) = compact_file(store, file, abort) {
                            log::error!(
                                "compaction of {} failed: {e}",
                                file.path().display()
                            );
                        }
                    }
                }
            });
        }
    });

    log::debug!("compaction pass took {:?}", begin.elapsed());
}

/// Walks the file's TOC, classifying each entry as live (index still points
/// into this file) or stale
fn gather_stats(store: &StoreInner, file: &Arc<ValuesFile>) -> crate::Result<FileStats> {
    let tombstone_cutoff = timestamp::now()
        .saturating_sub(timestamp::age_to_bits(u64::from(store.config.tombstone_age)));
    let mut stats = FileStats {
        total_bytes: 0,
        stale_bytes: 0,
        total_records: 0,
        stale_records: 0,
    };
    read_records(file.toc_path(), file_interval(store), &mut |e| {
        stats.total_records += 1;
        stats.total_bytes += u64::from(e.length);
        let (tsb, block_id, offset, _length) = store.loc_map.get(e.key_a, e.key_b);
        let moved = block_id != file.id() || offset != e.offset || tsb != e.timestamp_bits;
        let dead_tombstone = e.timestamp_bits & DELETION != 0 && e.timestamp_bits < tombstone_cutoff;
        if moved || dead_tombstone {
            stats.stale_records += 1;
            stats.stale_bytes += u64::from(e.length);
        }
    })?;
    Ok(stats)
}

fn compact_file(
    store: &Arc<StoreInner>,
    file: &Arc<ValuesFile>,
    abort: &AtomicU32,
) -> crate::Result<()> {
    log::info!("compacting {}", file.path().display());
    let tombstone_cutoff = timestamp::now()
        .saturating_sub(timestamp::age_to_bits(u64::from(store.config.tombstone_age)));

    let mut rewritten: u64 = 0;
    let mut value_buf: Vec<u8> = Vec::new();
    read_records(file.toc_path(), file_interval(store), &mut |e| {
        if abort.load(Ordering::SeqCst) != 0 {
            return;
        }
        let (tsb, block_id, offset, length) = store.loc_map.get(e.key_a, e.key_b);
        if block_id != file.id() || offset != e.offset || tsb != e.timestamp_bits {
            return; // superseded, nothing to carry over
        }
        if tsb & LOCAL_REMOVAL != 0 || (tsb & DELETION != 0 && tsb < tombstone_cutoff) {
            return; // dropped: discard passes own these
        }
        value_buf.clear();
        if length > 0 {
            if let Err(e2) = file.read(offset, length, &mut value_buf) {
                log::error!(
                    "unreadable entry during compaction of {}: {e2}",
                    file.path().display()
                );
                // Hide the entry locally; replication will restore it
                store
                    .loc_map
                    .set(e.key_a, e.key_b, tsb | LOCAL_REMOVAL, 0, 0, 0, false);
                return;
            }
        }
        match store.write_raw(e.key_a, e.key_b, tsb, &value_buf) {
            Ok(_) => rewritten += 1,
            Err(e2) => log::error!("compaction rewrite failed: {e2}"),
        }
    })?;

    if abort.load(Ordering::SeqCst) != 0 {
        return Ok(());
    }

    // Push the rewrites through the flusher so the relocations are applied,
    // then make sure nothing still points here before unlinking.
    store.flush_store()?;
    let mut remaining: u64 = 0;
    read_records(file.toc_path(), file_interval(store), &mut |e| {
        let (tsb, block_id, offset, _length) = store.loc_map.get(e.key_a, e.key_b);
        if block_id == file.id() && offset == e.offset && tsb == e.timestamp_bits {
            remaining += 1;
        }
    })?;
    if remaining > 0 {
        log::debug!(
            "{} entries still reference {}, leaving the pair for a later pass",
            remaining,
            file.path().display()
        );
        return Ok(());
    }

    store.drop_file(file)?;
    log::info!(
        "compacted {} ({rewritten} entries rewritten)",
        file.path().display()
    );
    Ok(())
}

fn file_interval(store: &StoreInner) -> u32 {
    store.config.checksum_interval
}
