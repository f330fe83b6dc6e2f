//! The key→location index.
//!
//! Maps a 128-bit key to the newest known (timestamp, block, offset, length)
//! tuple. The store only depends on the [`LocMap`] trait; the default
//! [`ValueLocMap`] shards a `BTreeMap` per slice of the keyspace so range
//! scans stay ordered while point operations spread across locks.

use std::collections::BTreeMap;
use std::sync::RwLock;

/// Number of internal shards (must be a power of two)
const SHARD_COUNT: usize = 64;
const SHARD_BITS: u32 = SHARD_COUNT.trailing_zeros();

/// Callback for [`LocMap::scan_callback`]; receives (keyA, keyB,
/// timestamp bits, length) and returns `false` to stop the scan.
pub type ScanFn<'a> = &'a mut dyn FnMut(u64, u64, u64, u32) -> bool;

/// Abstract key→location index consumed by the store.
///
/// All methods are safe under parallel callers. Scan callbacks are invoked
/// with internal locks held and must not call back into the map.
pub trait LocMap: Send + Sync {
    /// Monotonic insert: replaces the stored entry only if `timestamp_bits`
    /// is newer, or equal with `even_if_same_timestamp` set (used to relocate
    /// an entry without changing its logical timestamp).
    ///
    /// Returns the prior (timestamp bits, length); (0, 0) if absent.
    #[allow(clippy::too_many_arguments)]
    fn set(
        &self,
        key_a: u64,
        key_b: u64,
        timestamp_bits: u64,
        block_id: u32,
        offset: u32,
        length: u32,
        even_if_same_timestamp: bool,
    ) -> (u64, u32);

    /// Returns (timestamp bits, block, offset, length); all zero if absent.
    fn get(&self, key_a: u64, key_b: u64) -> (u64, u32, u32, u32);

    /// Invokes `cb` for every entry with `start <= keyA <= stop` whose
    /// timestamp bits contain all of `mask`, none of `not_mask`, and are
    /// below `cutoff` (pass `u64::MAX` for no cutoff).
    ///
    /// Stops early once `max` entries have been delivered and the next match
    /// is a different keyA, or when `cb` returns `false`. Returns
    /// `(next_start, more)`: `more` is `true` only for the `max` case, and
    /// resuming from `next_start` continues the scan.
    #[allow(clippy::too_many_arguments)]
    fn scan_callback(
        &self,
        start: u64,
        stop: u64,
        mask: u64,
        not_mask: u64,
        cutoff: u64,
        max: u64,
        cb: ScanFn<'_>,
    ) -> (u64, bool);

    /// Counts entries with `start <= keyA <= stop`, stopping once `ceiling`
    /// is reached (so the result is exact only below the ceiling).
    fn scan_count(&self, start: u64, stop: u64, ceiling: u64) -> u64;

    /// Removes the entry for the key if its timestamp bits still equal
    /// `timestamp_bits`.
    fn remove(&self, key_a: u64, key_b: u64, timestamp_bits: u64);
}

#[derive(Clone, Copy)]
struct Loc {
    timestamp_bits: u64,
    block_id: u32,
    offset: u32,
    length: u32,
}

type Shard = RwLock<BTreeMap<(u64, u64), Loc>>;

/// Default sharded in-memory location map
pub struct ValueLocMap {
    shards: Vec<Shard>,
}

impl Default for ValueLocMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueLocMap {
    /// Creates an empty location map
    #[must_use]
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        shards.resize_with(SHARD_COUNT, || RwLock::new(BTreeMap::new()));
        Self { shards }
    }

    fn shard_of(key_a: u64) -> usize {
        (key_a >> (64 - SHARD_BITS)) as usize
    }

    /// Total number of entries, markers included
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().expect("lock is poisoned").len())
            .sum()
    }

    /// Returns `true` if the map holds no entries at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocMap for ValueLocMap {
    fn set(
        &self,
        key_a: u64,
        key_b: u64,
        timestamp_bits: u64,
        block_id: u32,
        offset: u32,
        length: u32,
        even_if_same_timestamp: bool,
    ) -> (u64, u32) {
        let mut shard = self.shards[Self::shard_of(key_a)]
            .write()
            .expect("lock is poisoned");

        let slot = shard.entry((key_a, key_b));
        match slot {
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(Loc {
                    timestamp_bits,
                    block_id,
                    offset,
                    length,
                });
                (0, 0)
            }
            std::collections::btree_map::Entry::Occupied(mut o) => {
                let old = *o.get();
                let newer = timestamp_bits > old.timestamp_bits
                    || (even_if_same_timestamp && timestamp_bits == old.timestamp_bits);
                if newer {
                    o.insert(Loc {
                        timestamp_bits,
                        block_id,
                        offset,
                        length,
                    });
                }
                (old.timestamp_bits, old.length)
            }
        }
    }

    fn get(&self, key_a: u64, key_b: u64) -> (u64, u32, u32, u32) {
        let shard = self.shards[Self::shard_of(key_a)]
            .read()
            .expect("lock is poisoned");
        shard.get(&(key_a, key_b)).map_or((0, 0, 0, 0), |loc| {
            (loc.timestamp_bits, loc.block_id, loc.offset, loc.length)
        })
    }

    fn scan_callback(
        &self,
        start: u64,
        stop: u64,
        mask: u64,
        not_mask: u64,
        cutoff: u64,
        max: u64,
        cb: ScanFn<'_>,
    ) -> (u64, bool) {
        let mut delivered: u64 = 0;
        let mut last_key_a: u64 = start;

        for shard_idx in Self::shard_of(start)..=Self::shard_of(stop) {
            let shard = self.shards[shard_idx].read().expect("lock is poisoned");

            for (&(key_a, key_b), loc) in shard.range((start, 0)..=(stop, u64::MAX)) {
                let tsb = loc.timestamp_bits;
                if mask != 0 && tsb & mask != mask {
                    continue;
                }
                if tsb & not_mask != 0 {
                    continue;
                }
                if tsb >= cutoff {
                    continue;
                }
                if delivered >= max && key_a != last_key_a {
                    return (key_a, true);
                }
                if !cb(key_a, key_b, tsb, loc.length) {
                    return (key_a, false);
                }
                delivered += 1;
                last_key_a = key_a;
            }
        }

        (stop, false)
    }

    fn scan_count(&self, start: u64, stop: u64, ceiling: u64) -> u64 {
        let mut count: u64 = 0;
        for shard_idx in Self::shard_of(start)..=Self::shard_of(stop) {
            let shard = self.shards[shard_idx].read().expect("lock is poisoned");
            for _ in shard.range((start, 0)..=(stop, u64::MAX)) {
                count += 1;
                if count >= ceiling {
                    return count;
                }
            }
        }
        count
    }

    fn remove(&self, key_a: u64, key_b: u64, timestamp_bits: u64) {
        let mut shard = self.shards[Self::shard_of(key_a)]
            .write()
            .expect("lock is poisoned");
        if let Some(loc) = shard.get(&(key_a, key_b)) {
            if loc.timestamp_bits == timestamp_bits {
                shard.remove(&(key_a, key_b));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::{DELETION, LOCAL_REMOVAL};

    #[test]
    fn monotonic_set() {
        let m = ValueLocMap::new();
        assert_eq!(m.set(1, 2, 0x300, 1, 0, 7, false), (0, 0));
        // Older timestamp loses
        assert_eq!(m.set(1, 2, 0x200, 1, 50, 9, false), (0x300, 7));
        assert_eq!(m.get(1, 2), (0x300, 1, 0, 7));
        // Equal timestamp without the relocation flag is a no-op
        assert_eq!(m.set(1, 2, 0x300, 2, 60, 7, false), (0x300, 7));
        assert_eq!(m.get(1, 2), (0x300, 1, 0, 7));
        // Equal timestamp with the relocation flag moves the entry
        assert_eq!(m.set(1, 2, 0x300, 2, 60, 7, true), (0x300, 7));
        assert_eq!(m.get(1, 2), (0x300, 2, 60, 7));
        // Newer timestamp wins
        assert_eq!(m.set(1, 2, 0x400, 3, 0, 3, false), (0x300, 7));
        assert_eq!(m.get(1, 2), (0x400, 3, 0, 3));
    }

    #[test]
    fn get_absent() {
        let m = ValueLocMap::new();
        assert_eq!(m.get(9, 9), (0, 0, 0, 0));
    }

    #[test]
    fn scan_filters() {
        let m = ValueLocMap::new();
        m.set(10, 1, 0x100, 1, 0, 1, false);
        m.set(11, 1, 0x200 | DELETION, 1, 0, 0, false);
        m.set(12, 1, 0x300 | LOCAL_REMOVAL, 0, 0, 0, false);
        m.set(13, 1, 0x900, 1, 0, 4, false);

        // Everything except local removals, below a cutoff
        let mut seen = Vec::new();
        let mut collect = |a: u64, _b: u64, tsb: u64, _l: u32| {
            seen.push((a, tsb));
            true
        };
        m.scan_callback(0, u64::MAX, 0, LOCAL_REMOVAL, 0x800, u64::MAX, &mut collect);
        assert_eq!(seen, vec![(10, 0x100), (11, 0x200 | DELETION)]);

        // Only deletions
        let mut seen = Vec::new();
        m.scan_callback(0, u64::MAX, DELETION, 0, u64::MAX, u64::MAX, &mut |a, _, _, _| {
            seen.push(a);
            true
        });
        assert_eq!(seen, vec![11]);

        // Range bounds are inclusive on keyA
        let mut seen = Vec::new();
        m.scan_callback(11, 12, 0, 0, u64::MAX, u64::MAX, &mut |a, _, _, _| {
            seen.push(a);
            true
        });
        assert_eq!(seen, vec![11, 12]);
    }

    #[test]
    fn scan_batches_resume() {
        let m = ValueLocMap::new();
        for key_a in 0..10u64 {
            m.set(key_a, 0, 0x100, 1, 0, 1, false);
        }

        let mut seen = Vec::new();
        let (next, more) = m.scan_callback(0, u64::MAX, 0, 0, u64::MAX, 4, &mut |a, _, _, _| {
            seen.push(a);
            true
        });
        assert!(more);
        assert_eq!(seen.len(), 4);
        assert_eq!(next, 4);

        let (_, more) = m.scan_callback(next, u64::MAX, 0, 0, u64::MAX, 100, &mut |a, _, _, _| {
            seen.push(a);
            true
        });
        assert!(!more);
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn scan_count_ceiling() {
        let m = ValueLocMap::new();
        for key_a in 0..100u64 {
            m.set(key_a << 32, 0, 0x100, 1, 0, 1, false);
        }
        assert_eq!(m.scan_count(0, u64::MAX, 10), 10);
        assert_eq!(m.scan_count(0, u64::MAX, 1000), 100);
        assert_eq!(m.scan_count(0, 5 << 32, 1000), 6);
    }

    #[test]
    fn remove_checks_timestamp() {
        let m = ValueLocMap::new();
        m.set(1, 2, 0x300, 1, 0, 7, false);
        m.remove(1, 2, 0x200);
        assert_eq!(m.get(1, 2), (0x300, 1, 0, 7));
        m.remove(1, 2, 0x300);
        assert_eq!(m.get(1, 2), (0, 0, 0, 0));
    }
}
