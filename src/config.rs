//! Value store configuration.
//!
//! `Config` is a plain value: fill in what you need (struct update syntax or
//! the chained setters) and hand it to [`ValueStore::open`]. Unset numeric
//! fields (zero) inherit their documented defaults. Every option can also be
//! supplied through the environment as `VALUESTORE_` plus the upper-snake
//! option name (e.g. `VALUESTORE_VALUE_CAP`); environment values take
//! precedence and are read once, when the store resolves the config.
//!
//! [`ValueStore::open`]: crate::ValueStore::open

use std::path::PathBuf;
use std::time::Duration;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Configuration for a [`ValueStore`](crate::ValueStore)
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Config {
    /// Directory for values files; also for TOC files unless `path_toc` is
    /// set. Defaults to the current directory.
    pub path: PathBuf,
    /// Directory for TOC files; defaults to `path`
    pub path_toc: Option<PathBuf>,
    /// Maximum bytes per value; default 4 MiB
    pub value_cap: u32,
    /// In-memory page size; floored to `value_cap + checksum_interval`
    pub page_size: u32,
    /// Payload bytes between 4-byte CRCs; default 65,532
    pub checksum_interval: u32,
    /// Parallelism for writers and background work; defaults to the number
    /// of CPUs
    pub workers: usize,
    /// Write pages per worker (minimum 2); default 3
    pub write_pages_per_worker: usize,
    /// Maximum bytes per values file; default and ceiling `u32::MAX`,
    /// floored to `48 + value_cap`
    pub values_file_cap: u64,
    /// Pooled read descriptors per values file; defaults to `workers`
    pub values_file_readers: usize,
    /// Index entries applied per batch during startup recovery; default
    /// 1,048,576
    pub recovery_batch_size: usize,
    /// Base seconds between background passes; default 60
    pub background_interval: u32,
    /// Seconds before a deletion marker may be discarded; default 14,400
    pub tombstone_age: u32,
    /// Seconds between tombstone discard passes; defaults to
    /// `background_interval`
    pub tombstone_discard_interval: u32,
    /// Index entries per discard batch; default 1,048,576
    pub tombstone_discard_batch_size: u64,
    /// Seconds a fresh write stays invisible to replication; default 60
    pub replication_ignore_recent: u32,
    /// Default ceiling for outgoing message sizes; default 16 MiB
    pub msg_cap: usize,
    /// Default patience for message pool acquisition and transport handoff;
    /// default 100 ms
    pub msg_timeout: Duration,

    /// Seconds between outgoing pull replication passes; defaults to
    /// `background_interval`
    pub out_pull_replication_interval: u32,
    /// Workers per outgoing pull replication pass; defaults to `workers`
    pub out_pull_replication_workers: usize,
    /// Outgoing pull messages buffered before producers block; default 128
    pub out_pull_replication_msgs: usize,
    /// Bloom filter capacity per sub-range; default 1,000,000
    pub out_pull_replication_bloom_n: u64,
    /// Bloom filter target false-positive rate; default 0.001
    pub out_pull_replication_bloom_p: f64,
    /// Patience for outgoing pull message handoff; defaults to `msg_timeout`
    pub out_pull_replication_msg_timeout: Duration,
    /// Inbound pull messages buffered before frames are dropped; default 128
    pub in_pull_replication_msgs: usize,
    /// Workers processing inbound pull messages; defaults to `workers`
    pub in_pull_replication_workers: usize,
    /// Patience acquiring an inbound pull message slot; defaults to
    /// `msg_timeout`
    pub in_pull_replication_msg_timeout: Duration,

    /// Seconds between outgoing push replication passes; defaults to
    /// `background_interval`
    pub out_push_replication_interval: u32,
    /// Workers per outgoing push replication pass; defaults to `workers`
    pub out_push_replication_workers: usize,
    /// Patience for outgoing push message handoff; defaults to `msg_timeout`
    pub out_push_replication_msg_timeout: Duration,

    /// Outgoing bulk-set messages buffered before producers block;
    /// default 128
    pub out_bulk_set_msgs: usize,
    /// Size cap per outgoing bulk-set message; defaults to `msg_cap`
    pub out_bulk_set_msg_cap: usize,
    /// Inbound bulk-set messages buffered before frames are dropped;
    /// default 128
    pub in_bulk_set_msgs: usize,
    /// Workers processing inbound bulk-sets; defaults to `workers`
    pub in_bulk_set_workers: usize,
    /// Patience acquiring an inbound bulk-set slot; defaults to
    /// `msg_timeout`
    pub in_bulk_set_msg_timeout: Duration,

    /// Outgoing bulk-set-ack messages buffered before producers block;
    /// default 128
    pub out_bulk_set_ack_msgs: usize,
    /// Size cap per outgoing bulk-set-ack message; defaults to `msg_cap`
    pub out_bulk_set_ack_msg_cap: usize,
    /// Inbound bulk-set-ack messages buffered before frames are dropped;
    /// default 128
    pub in_bulk_set_ack_msgs: usize,
    /// Workers processing inbound bulk-set-acks; defaults to `workers`
    pub in_bulk_set_ack_workers: usize,
    /// Patience acquiring an inbound bulk-set-ack slot; defaults to
    /// `msg_timeout`
    pub in_bulk_set_ack_msg_timeout: Duration,

    /// Seconds between compaction passes; defaults to `background_interval`
    pub compaction_interval: u32,
    /// Wasted-space fraction above which a file is compacted, in
    /// (0.01, 1.0); default 0.10
    pub compaction_threshold: f64,
    /// Seconds old a file must be before compaction considers it;
    /// default 300
    pub compaction_age_threshold: u32,
    /// Parallel file compactions per pass; default 1
    pub compaction_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            path_toc: None,
            value_cap: 0,
            page_size: 0,
            checksum_interval: 0,
            workers: 0,
            write_pages_per_worker: 0,
            values_file_cap: 0,
            values_file_readers: 0,
            recovery_batch_size: 0,
            background_interval: 0,
            tombstone_age: 0,
            tombstone_discard_interval: 0,
            tombstone_discard_batch_size: 0,
            replication_ignore_recent: 0,
            msg_cap: 0,
            msg_timeout: Duration::ZERO,
            out_pull_replication_interval: 0,
            out_pull_replication_workers: 0,
            out_pull_replication_msgs: 0,
            out_pull_replication_bloom_n: 0,
            out_pull_replication_bloom_p: 0.0,
            out_pull_replication_msg_timeout: Duration::ZERO,
            in_pull_replication_msgs: 0,
            in_pull_replication_workers: 0,
            in_pull_replication_msg_timeout: Duration::ZERO,
            out_push_replication_interval: 0,
            out_push_replication_workers: 0,
            out_push_replication_msg_timeout: Duration::ZERO,
            out_bulk_set_msgs: 0,
            out_bulk_set_msg_cap: 0,
            in_bulk_set_msgs: 0,
            in_bulk_set_workers: 0,
            in_bulk_set_msg_timeout: Duration::ZERO,
            out_bulk_set_ack_msgs: 0,
            out_bulk_set_ack_msg_cap: 0,
            in_bulk_set_ack_msgs: 0,
            in_bulk_set_ack_workers: 0,
            in_bulk_set_ack_msg_timeout: Duration::ZERO,
            compaction_interval: 0,
            compaction_threshold: 0.0,
            compaction_age_threshold: 0,
            compaction_workers: 0,
        }
    }
}

impl Config {
    /// Sets the values file directory
    #[must_use]
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = path.into();
        self
    }

    /// Sets a separate TOC file directory
    #[must_use]
    pub fn path_toc<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path_toc = Some(path.into());
        self
    }

    /// Sets the maximum value size in bytes
    #[must_use]
    pub fn value_cap(mut self, bytes: u32) -> Self {
        self.value_cap = bytes;
        self
    }

    /// Sets the in-memory page size in bytes
    #[must_use]
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the CRC spacing in bytes
    #[must_use]
    pub fn checksum_interval(mut self, bytes: u32) -> Self {
        self.checksum_interval = bytes;
        self
    }

    /// Sets the worker parallelism
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    /// Sets the maximum values file size in bytes
    #[must_use]
    pub fn values_file_cap(mut self, bytes: u64) -> Self {
        self.values_file_cap = bytes;
        self
    }

    /// Sets the base background pass interval in seconds
    #[must_use]
    pub fn background_interval(mut self, seconds: u32) -> Self {
        self.background_interval = seconds;
        self
    }

    /// Sets the tombstone age in seconds
    #[must_use]
    pub fn tombstone_age(mut self, seconds: u32) -> Self {
        self.tombstone_age = seconds;
        self
    }

    /// Applies the environment overlay, inheritance, and bounds.
    /// Called once by the store at open.
    pub(crate) fn resolve(mut self) -> Self {
        if let Some(path) = env_string("VALUESTORE_PATH") {
            self.path = PathBuf::from(path);
        }
        if let Some(path) = env_string("VALUESTORE_PATH_TOC") {
            self.path_toc = Some(PathBuf::from(path));
        }
        overlay_u32(&mut self.value_cap, "VALUESTORE_VALUE_CAP");
        overlay_u32(&mut self.page_size, "VALUESTORE_PAGE_SIZE");
        overlay_u32(&mut self.checksum_interval, "VALUESTORE_CHECKSUM_INTERVAL");
        overlay_usize(&mut self.workers, "VALUESTORE_WORKERS");
        overlay_usize(
            &mut self.write_pages_per_worker,
            "VALUESTORE_WRITE_PAGES_PER_WORKER",
        );
        overlay_u64(&mut self.values_file_cap, "VALUESTORE_VALUES_FILE_CAP");
        overlay_usize(
            &mut self.values_file_readers,
            "VALUESTORE_VALUES_FILE_READERS",
        );
        overlay_usize(
            &mut self.recovery_batch_size,
            "VALUESTORE_RECOVERY_BATCH_SIZE",
        );
        overlay_u32(&mut self.background_interval, "VALUESTORE_BACKGROUND_INTERVAL");
        overlay_u32(&mut self.tombstone_age, "VALUESTORE_TOMBSTONE_AGE");
        overlay_u32(
            &mut self.tombstone_discard_interval,
            "VALUESTORE_TOMBSTONE_DISCARD_INTERVAL",
        );
        overlay_u64(
            &mut self.tombstone_discard_batch_size,
            "VALUESTORE_TOMBSTONE_DISCARD_BATCH_SIZE",
        );
        overlay_u32(
            &mut self.replication_ignore_recent,
            "VALUESTORE_REPLICATION_IGNORE_RECENT",
        );
        overlay_usize(&mut self.msg_cap, "VALUESTORE_MSG_CAP");
        overlay_millis(&mut self.msg_timeout, "VALUESTORE_MSG_TIMEOUT");
        overlay_u32(
            &mut self.out_pull_replication_interval,
            "VALUESTORE_OUT_PULL_REPLICATION_INTERVAL",
        );
        overlay_usize(
            &mut self.out_pull_replication_workers,
            "VALUESTORE_OUT_PULL_REPLICATION_WORKERS",
        );
        overlay_usize(
            &mut self.out_pull_replication_msgs,
            "VALUESTORE_OUT_PULL_REPLICATION_MSGS",
        );
        overlay_u64(
            &mut self.out_pull_replication_bloom_n,
            "VALUESTORE_OUT_PULL_REPLICATION_BLOOM_N",
        );
        overlay_f64(
            &mut self.out_pull_replication_bloom_p,
            "VALUESTORE_OUT_PULL_REPLICATION_BLOOM_P",
        );
        overlay_millis(
            &mut self.out_pull_replication_msg_timeout,
            "VALUESTORE_OUT_PULL_REPLICATION_MSG_TIMEOUT",
        );
        overlay_usize(
            &mut self.in_pull_replication_msgs,
            "VALUESTORE_IN_PULL_REPLICATION_MSGS",
        );
        overlay_usize(
            &mut self.in_pull_replication_workers,
            "VALUESTORE_IN_PULL_REPLICATION_WORKERS",
        );
        overlay_millis(
            &mut self.in_pull_replication_msg_timeout,
            "VALUESTORE_IN_PULL_REPLICATION_MSG_TIMEOUT",
        );
        overlay_u32(
            &mut self.out_push_replication_interval,
            "VALUESTORE_OUT_PUSH_REPLICATION_INTERVAL",
        );
        overlay_usize(
            &mut self.out_push_replication_workers,
            "VALUESTORE_OUT_PUSH_REPLICATION_WORKERS",
        );
        overlay_millis(
            &mut self.out_push_replication_msg_timeout,
            "VALUESTORE_OUT_PUSH_REPLICATION_MSG_TIMEOUT",
        );
        overlay_usize(&mut self.out_bulk_set_msgs, "VALUESTORE_OUT_BULK_SET_MSGS");
        overlay_usize(
            &mut self.out_bulk_set_msg_cap,
            "VALUESTORE_OUT_BULK_SET_MSG_CAP",
        );
        overlay_usize(&mut self.in_bulk_set_msgs, "VALUESTORE_IN_BULK_SET_MSGS");
        overlay_usize(&mut self.in_bulk_set_workers, "VALUESTORE_IN_BULK_SET_WORKERS");
        overlay_millis(
            &mut self.in_bulk_set_msg_timeout,
            "VALUESTORE_IN_BULK_SET_MSG_TIMEOUT",
        );
        overlay_usize(
            &mut self.out_bulk_set_ack_msgs,
            "VALUESTORE_OUT_BULK_SET_ACK_MSGS",
        );
        overlay_usize(
            &mut self.out_bulk_set_ack_msg_cap,
            "VALUESTORE_OUT_BULK_SET_ACK_MSG_CAP",
        );
        overlay_usize(
            &mut self.in_bulk_set_ack_msgs,
            "VALUESTORE_IN_BULK_SET_ACK_MSGS",
        );
        overlay_usize(
            &mut self.in_bulk_set_ack_workers,
            "VALUESTORE_IN_BULK_SET_ACK_WORKERS",
        );
        overlay_millis(
            &mut self.in_bulk_set_ack_msg_timeout,
            "VALUESTORE_IN_BULK_SET_ACK_MSG_TIMEOUT",
        );
        overlay_u32(&mut self.compaction_interval, "VALUESTORE_COMPACTION_INTERVAL");
        overlay_f64(&mut self.compaction_threshold, "VALUESTORE_COMPACTION_THRESHOLD");
        overlay_u32(
            &mut self.compaction_age_threshold,
            "VALUESTORE_COMPACTION_AGE_THRESHOLD",
        );
        overlay_usize(&mut self.compaction_workers, "VALUESTORE_COMPACTION_WORKERS");

        // Inheritance and bounds
        if self.path_toc.is_none() {
            self.path_toc = Some(self.path.clone());
        }
        default_u32(&mut self.value_cap, (4 * MIB) as u32);
        default_u32(&mut self.checksum_interval, (64 * KIB - 4) as u32);
        default_u32(&mut self.page_size, (4 * MIB) as u32);
        // Each page must cover at least one full checksum span so every page
        // flush completes the previous span
        let page_floor = self
            .value_cap
            .saturating_add(self.checksum_interval)
            .max(64)
            .min(u32::MAX - 1);
        self.page_size = self.page_size.clamp(page_floor, u32::MAX - 1);
        if self.workers == 0 {
            self.workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        }
        default_usize(&mut self.write_pages_per_worker, 3);
        self.write_pages_per_worker = self.write_pages_per_worker.max(2);
        default_u64(&mut self.values_file_cap, u64::from(u32::MAX));
        self.values_file_cap = self
            .values_file_cap
            .clamp(48 + u64::from(self.value_cap), u64::from(u32::MAX));
        default_usize(&mut self.values_file_readers, self.workers);
        default_usize(&mut self.recovery_batch_size, 1024 * 1024);
        default_u32(&mut self.background_interval, 60);
        default_u32(&mut self.tombstone_age, 4 * 60 * 60);
        default_u32(&mut self.tombstone_discard_interval, self.background_interval);
        default_u64(&mut self.tombstone_discard_batch_size, 1024 * 1024);
        default_u32(&mut self.replication_ignore_recent, 60);
        default_usize(&mut self.msg_cap, (16 * MIB) as usize);
        default_duration(&mut self.msg_timeout, Duration::from_millis(100));

        default_u32(
            &mut self.out_pull_replication_interval,
            self.background_interval,
        );
        default_usize(&mut self.out_pull_replication_workers, self.workers);
        default_usize(&mut self.out_pull_replication_msgs, 128);
        default_u64(&mut self.out_pull_replication_bloom_n, 1_000_000);
        if self.out_pull_replication_bloom_p <= 0.0 {
            self.out_pull_replication_bloom_p = 0.001;
        }
        self.out_pull_replication_bloom_p = self.out_pull_replication_bloom_p.max(0.000_001);
        default_duration(&mut self.out_pull_replication_msg_timeout, self.msg_timeout);
        default_usize(&mut self.in_pull_replication_msgs, 128);
        default_usize(&mut self.in_pull_replication_workers, self.workers);
        default_duration(&mut self.in_pull_replication_msg_timeout, self.msg_timeout);

        default_u32(
            &mut self.out_push_replication_interval,
            self.background_interval,
        );
        default_usize(&mut self.out_push_replication_workers, self.workers);
        default_duration(&mut self.out_push_replication_msg_timeout, self.msg_timeout);

        default_usize(&mut self.out_bulk_set_msgs, 128);
        default_usize(&mut self.out_bulk_set_msg_cap, self.msg_cap);
        default_usize(&mut self.in_bulk_set_msgs, 128);
        default_usize(&mut self.in_bulk_set_workers, self.workers);
        default_duration(&mut self.in_bulk_set_msg_timeout, self.msg_timeout);

        default_usize(&mut self.out_bulk_set_ack_msgs, 128);
        default_usize(&mut self.out_bulk_set_ack_msg_cap, self.msg_cap);
        default_usize(&mut self.in_bulk_set_ack_msgs, 128);
        default_usize(&mut self.in_bulk_set_ack_workers, self.workers);
        default_duration(&mut self.in_bulk_set_ack_msg_timeout, self.msg_timeout);

        default_u32(&mut self.compaction_interval, self.background_interval);
        if self.compaction_threshold <= 0.01 || self.compaction_threshold >= 1.0 {
            self.compaction_threshold = 0.10;
        }
        default_u32(&mut self.compaction_age_threshold, 300);
        default_usize(&mut self.compaction_workers, 1);

        self
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn overlay_u32(field: &mut u32, name: &str) {
    if let Some(v) = env_string(name).and_then(|v| v.parse().ok()) {
        *field = v;
    }
}

fn overlay_u64(field: &mut u64, name: &str) {
    if let Some(v) = env_string(name).and_then(|v| v.parse().ok()) {
        *field = v;
    }
}

fn overlay_usize(field: &mut usize, name: &str) {
    if let Some(v) = env_string(name).and_then(|v| v.parse().ok()) {
        *field = v;
    }
}

fn overlay_f64(field: &mut f64, name: &str) {
    if let Some(v) = env_string(name).and_then(|v| v.parse().ok()) {
        *field = v;
    }
}

fn overlay_millis(field: &mut Duration, name: &str) {
    if let Some(v) = env_string(name).and_then(|v| v.parse().ok()) {
        *field = Duration::from_millis(v);
    }
}

fn default_u32(field: &mut u32, default: u32) {
    if *field == 0 {
        *field = default;
    }
}

fn default_u64(field: &mut u64, default: u64) {
    if *field == 0 {
        *field = default;
    }
}

fn default_usize(field: &mut usize, default: usize) {
    if *field == 0 {
        *field = default;
    }
}

fn default_duration(field: &mut Duration, default: Duration) {
    if field.is_zero() {
        *field = default;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default().resolve();
        assert_eq!(c.value_cap, 4 * 1024 * 1024);
        assert_eq!(c.checksum_interval, 65_532);
        assert_eq!(c.page_size, c.value_cap + c.checksum_interval);
        assert_eq!(c.values_file_cap, u64::from(u32::MAX));
        assert_eq!(c.tombstone_age, 14_400);
        assert_eq!(c.msg_timeout, Duration::from_millis(100));
        assert_eq!(c.in_bulk_set_msg_timeout, Duration::from_millis(100));
        assert_eq!(c.out_bulk_set_msg_cap, 16 * 1024 * 1024);
        assert!((c.compaction_threshold - 0.10).abs() < f64::EPSILON);
        assert_eq!(c.compaction_age_threshold, 300);
        assert!(c.write_pages_per_worker >= 2);
        assert_eq!(c.path_toc.as_deref(), Some(std::path::Path::new(".")));
    }

    #[test]
    fn inheritance_follows_overrides() {
        let c = Config {
            msg_cap: 1000,
            msg_timeout: Duration::from_millis(5),
            background_interval: 7,
            ..Config::default()
        }
        .resolve();
        assert_eq!(c.out_bulk_set_msg_cap, 1000);
        assert_eq!(c.out_bulk_set_ack_msg_cap, 1000);
        assert_eq!(c.in_bulk_set_msg_timeout, Duration::from_millis(5));
        assert_eq!(c.compaction_interval, 7);
        assert_eq!(c.out_pull_replication_interval, 7);
    }

    #[test]
    fn file_cap_floor() {
        let c = Config {
            value_cap: 100,
            values_file_cap: 10,
            ..Config::default()
        }
        .resolve();
        assert_eq!(c.values_file_cap, 148);
    }

    #[test]
    fn bad_compaction_threshold_resets() {
        let c = Config {
            compaction_threshold: 3.5,
            ..Config::default()
        }
        .resolve();
        assert!((c.compaction_threshold - 0.10).abs() < f64::EPSILON);
    }
}
