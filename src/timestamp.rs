//! Timestamp-bits encoding.
//!
//! Every entry carries a 64-bit ordering word: the high 56 bits are
//! microseconds since the Unix epoch, the low 8 bits are utility bits.
//! Ordering is strictly numerical, so a later write (or a deletion at the
//! same microsecond, whose utility bit makes it larger) always wins.

use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for utility flags
pub const UTIL_BITS: u32 = 8;

/// Marks an entry as a deletion (tombstone); its value length is 0
pub const DELETION: u64 = 1;

/// Marks an entry as locally removed: hidden from reads and replication,
/// eligible for compaction once old enough
pub const LOCAL_REMOVAL: u64 = 1 << 1;

/// Converts microseconds since the epoch into timestamp bits (no flags set)
#[must_use]
pub fn from_micros(micros: u64) -> u64 {
    micros << UTIL_BITS
}

/// Strips the utility bits, returning microseconds since the epoch
#[must_use]
pub fn to_micros(timestamp_bits: u64) -> u64 {
    timestamp_bits >> UTIL_BITS
}

/// Current wall clock as timestamp bits (no flags set)
#[must_use]
pub fn now() -> u64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default();
    from_micros(micros)
}

/// The timestamp-bits equivalent of an age in seconds
#[must_use]
pub fn age_to_bits(seconds: u64) -> u64 {
    from_micros(seconds * 1_000_000)
}

/// Logical state of an index entry, decoded from its timestamp bits
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryState {
    /// No entry was ever recorded
    Absent,
    /// A live value
    Live,
    /// A deletion marker
    Tombstone,
    /// A local-removal marker; treated as "no entry" by reads
    Suppressed,
}

/// Decodes the logical state of an entry from its timestamp bits
#[must_use]
pub fn state(timestamp_bits: u64) -> EntryState {
    if timestamp_bits == 0 {
        EntryState::Absent
    } else if timestamp_bits & LOCAL_REMOVAL != 0 {
        EntryState::Suppressed
    } else if timestamp_bits & DELETION != 0 {
        EntryState::Tombstone
    } else {
        EntryState::Live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_round_trip() {
        assert_eq!(to_micros(from_micros(3)), 3);
        assert_eq!(from_micros(3), 0x300);
        assert_eq!(to_micros(0x300 | DELETION), 3);
    }

    #[test]
    fn deletion_orders_after_write_at_same_micro() {
        let write = from_micros(7);
        let delete = from_micros(7) | DELETION;
        assert!(delete > write);
    }

    #[test]
    fn entry_states() {
        assert_eq!(state(0), EntryState::Absent);
        assert_eq!(state(0x300), EntryState::Live);
        assert_eq!(state(0x300 | DELETION), EntryState::Tombstone);
        assert_eq!(state(0x300 | LOCAL_REMOVAL), EntryState::Suppressed);
        assert_eq!(
            state(0x300 | DELETION | LOCAL_REMOVAL),
            EntryState::Suppressed
        );
    }
}
