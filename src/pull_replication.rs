//! Pull replication: "send me what I'm missing".
//!
//! The outbound pass walks every partition this node is responsible for,
//! packs the live keys of a sub-range into a salted bloom filter, and ships
//! the filter to the other replicas. A receiving replica scans the same
//! range and bulk-sets back whatever the filter does not contain.
//!
//! Sub-ranges adapt to density: while a range holds more keys than the
//! filter's capacity, it is halved, keeping occupancy (and therefore the
//! false positive rate) in check.
//!
//! Wire layout: `nodeID(8) ringVersion(8) partition(4) cutoff(8)
//! rangeStart(8) rangeStop(8)` then the bloom filter body.

use crate::bloom::KtBloomFilter;
use crate::bulk_set::BULK_SET_MSG_ENTRY_HEADER_LEN;
use crate::config::Config;
use crate::ring::{drain_frame, Msg, MsgRing, MsgType};
use crate::store::{StoreInner, ValueStore};
use crate::timestamp::{self, DELETION, LOCAL_REMOVAL};
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{bounded, Receiver, Sender};
use rand::Rng;
use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

pub(crate) const PULL_REPLICATION_MSG_HEADER_LEN: usize = 44;
/// salt(2) k(2) num_bits(8)
const BLOOM_WIRE_HEADER_LEN: usize = 12;

/// A pooled pull-replication message
pub(crate) struct PullReplicationMsg {
    header: [u8; PULL_REPLICATION_MSG_HEADER_LEN],
    body: Vec<u8>,
    pool: Sender<PullReplicationMsg>,
}

impl PullReplicationMsg {
    fn new(pool: Sender<PullReplicationMsg>) -> Self {
        Self {
            header: [0; PULL_REPLICATION_MSG_HEADER_LEN],
            body: Vec::new(),
            pool,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fill(
        &mut self,
        node_id: u64,
        ring_version: u64,
        partition: u32,
        cutoff: u64,
        range_start: u64,
        range_stop: u64,
        bloom: &KtBloomFilter,
    ) {
        BigEndian::write_u64(&mut self.header[0..8], node_id);
        BigEndian::write_u64(&mut self.header[8..16], ring_version);
        BigEndian::write_u32(&mut self.header[16..20], partition);
        BigEndian::write_u64(&mut self.header[20..28], cutoff);
        BigEndian::write_u64(&mut self.header[28..36], range_start);
        BigEndian::write_u64(&mut self.header[36..44], range_stop);
        self.body.clear();
        bloom.write_to(&mut self.body).expect("vec write");
    }

    pub fn node_id(&self) -> u64 {
        BigEndian::read_u64(&self.header[0..8])
    }

    pub fn ring_version(&self) -> u64 {
        BigEndian::read_u64(&self.header[8..16])
    }

    pub fn partition(&self) -> u32 {
        BigEndian::read_u32(&self.header[16..20])
    }

    pub fn cutoff(&self) -> u64 {
        BigEndian::read_u64(&self.header[20..28])
    }

    pub fn range_start(&self) -> u64 {
        BigEndian::read_u64(&self.header[28..36])
    }

    pub fn range_stop(&self) -> u64 {
        BigEndian::read_u64(&self.header[36..44])
    }

    pub fn bloom(&self) -> std::io::Result<KtBloomFilter> {
        KtBloomFilter::read_from(&mut self.body.as_slice())
    }
}

impl Msg for PullReplicationMsg {
    fn msg_type(&self) -> MsgType {
        MsgType::PullReplication
    }

    fn msg_length(&self) -> u64 {
        (PULL_REPLICATION_MSG_HEADER_LEN + self.body.len()) as u64
    }

    fn write_content(&self, w: &mut dyn std::io::Write) -> std::io::Result<u64> {
        w.write_all(&self.header)?;
        w.write_all(&self.body)?;
        Ok(self.msg_length())
    }

    fn done(self: Box<Self>) {
        let pool = self.pool.clone();
        let _ = pool.send(*self);
    }
}

/// Channels, pools and the iteration salt for pull replication
pub(crate) struct PullReplicationState {
    pub in_msg_tx: Sender<PullReplicationMsg>,
    pub in_msg_rx: Receiver<PullReplicationMsg>,
    pub in_free_tx: Sender<PullReplicationMsg>,
    pub in_free_rx: Receiver<PullReplicationMsg>,
    pub out_free_rx: Receiver<PullReplicationMsg>,
    iteration: AtomicU32,
}

impl PullReplicationState {
    pub fn new(config: &Config) -> Self {
        let (in_msg_tx, in_msg_rx) = bounded(config.in_pull_replication_msgs);
        let (in_free_tx, in_free_rx) = bounded(config.in_pull_replication_msgs);
        for _ in 0..config.in_pull_replication_msgs {
            in_free_tx
                .send(PullReplicationMsg::new(in_free_tx.clone()))
                .expect("free pool cannot be full");
        }
        let (out_free_tx, out_free_rx) = bounded(config.out_pull_replication_msgs);
        for _ in 0..config.out_pull_replication_msgs {
            out_free_tx
                .send(PullReplicationMsg::new(out_free_tx.clone()))
                .expect("free pool cannot be full");
        }
        Self {
            in_msg_tx,
            in_msg_rx,
            in_free_tx,
            in_free_rx,
            out_free_rx,
            iteration: AtomicU32::new(rand::thread_rng().gen::<u16>().into()),
        }
    }

    /// Monotonically increasing per-pass salt, wrapping at 2^16
    fn next_iteration(&self) -> u16 {
        (self.iteration.fetch_add(1, Ordering::SeqCst) + 1) as u16
    }
}

impl ValueStore {
    /// Feeds an inbound pull-replication frame of `length` bytes; same
    /// dropping and EOF contract as [`ValueStore::receive_bulk_set`]
    pub fn receive_pull_replication(&self, r: &mut dyn Read, length: u64) -> std::io::Result<u64> {
        let Some(state) = &self.0.pull_replication else {
            return drain_frame(r, length);
        };
        let min = (PULL_REPLICATION_MSG_HEADER_LEN + BLOOM_WIRE_HEADER_LEN) as u64;
        if length < min
            || length - PULL_REPLICATION_MSG_HEADER_LEN as u64 > self.0.config.msg_cap as u64
        {
            return drain_frame(r, length);
        }
        let Ok(mut msg) = state
            .in_free_rx
            .recv_timeout(self.0.config.in_pull_replication_msg_timeout)
        else {
            log::debug!("no free inbound pull-replication message, dropping frame");
            return drain_frame(r, length);
        };

        if let Err(e) = r.read_exact(&mut msg.header) {
            let _ = state.in_free_tx.send(msg);
            return Err(e);
        }
        msg.body
            .resize((length - PULL_REPLICATION_MSG_HEADER_LEN as u64) as usize, 0);
        if let Err(e) = r.read_exact(&mut msg.body) {
            let _ = state.in_free_tx.send(msg);
            return Err(e);
        }

        state.in_msg_tx.send(msg).expect("inbound queue disconnected");
        Ok(length)
    }

    pub(crate) fn spawn_pull_replication_workers(&self) -> Vec<JoinHandle<()>> {
        let Some(state) = &self.0.pull_replication else {
            return Vec::new();
        };
        let mut handles = Vec::new();
        for i in 0..self.0.config.in_pull_replication_workers {
            let rx = state.in_msg_rx.clone();
            let free_tx = state.in_free_tx.clone();
            let weak = std::sync::Arc::downgrade(&self.0);
            let handle = std::thread::Builder::new()
                .name(format!("pull-replication-{i}"))
                .spawn(move || in_pull_replication_worker(&weak, &rx, &free_tx))
                .expect("failed to spawn pull-replication worker");
            handles.push(handle);
        }
        handles
    }
}

/// Responds to one inbound pull request: everything live in the range that
/// the requester's filter lacks goes back in a bulk-set
fn in_pull_replication_worker(
    weak: &Weak<StoreInner>,
    rx: &Receiver<PullReplicationMsg>,
    free_tx: &Sender<PullReplicationMsg>,
) {
    let mut keys: Vec<(u64, u64)> = Vec::new();
    let mut value_buf: Vec<u8> = Vec::new();
    loop {
        let msg = match rx.recv_timeout(std::time::Duration::from_millis(250)) {
            Ok(msg) => msg,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if weak.upgrade().map_or(true, |s| s.is_store_closed()) {
                    break;
                }
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };
        let Some(store) = weak.upgrade() else {
            break;
        };

        keys.clear();
        let cutoff = msg.cutoff();
        let requester = msg.node_id();
        let (range_start, range_stop) = (msg.range_start(), msg.range_stop());
        let tombstone_cutoff = timestamp::now()
            .saturating_sub(timestamp::age_to_bits(u64::from(store.config.tombstone_age)));
        let bloom = match msg.bloom() {
            Ok(bloom) => bloom,
            Err(e) => {
                log::debug!("undecodable pull-replication filter: {e}");
                let _ = free_tx.send(msg);
                continue;
            }
        };

        let mut budget = store.config.out_bulk_set_msg_cap as i64;
        store.loc_map.scan_callback(
            range_start,
            range_stop,
            0,
            LOCAL_REMOVAL,
            cutoff,
            u64::MAX,
            &mut |key_a, key_b, tsb, length| {
                if (tsb & DELETION == 0 || tsb >= tombstone_cutoff)
                    && !bloom.may_have(key_a, key_b, tsb)
                {
                    keys.push((key_a, key_b));
                    budget -= BULK_SET_MSG_ENTRY_HEADER_LEN as i64 + i64::from(length);
                    if budget <= 0 {
                        return false;
                    }
                }
                true
            },
        );
        let _ = free_tx.send(msg);

        if keys.is_empty() {
            continue;
        }
        let (Some(bulk_set), Some(ring)) = (&store.bulk_set, &store.ring) else {
            continue;
        };
        let Some(mut response) = bulk_set.acquire_out() else {
            continue;
        };
        response.set_responder_node_id(requester);
        for &(key_a, key_b) in &keys {
            value_buf.clear();
            match store.read_raw(key_a, key_b, &mut value_buf) {
                Ok(tsb) => {
                    if !response.add(key_a, key_b, tsb, &value_buf) {
                        break;
                    }
                }
                Err(Error::NotFound { timestamp_bits })
                    if timestamp_bits != 0 && timestamp_bits & LOCAL_REMOVAL == 0 =>
                {
                    // A tombstone the requester is missing
                    if !response.add(key_a, key_b, timestamp_bits, &[]) {
                        break;
                    }
                }
                Err(_) => {}
            }
        }
        if response.is_empty() {
            Box::new(response).done();
        } else {
            ring.msg_to_node(
                requester,
                Box::new(response),
                store.config.in_pull_replication_msg_timeout,
            );
        }
    }
}

fn partition_range(partition: u64, partition_bit_count: u32) -> (u64, u64) {
    if partition_bit_count == 0 {
        return (0, u64::MAX);
    }
    let shift = 64 - partition_bit_count;
    let start = partition << shift;
    (start, start | (u64::MAX >> partition_bit_count))
}

/// One outbound pull-replication pass
pub(crate) fn out_pull_replication_pass(store: &Arc<StoreInner>, abort: &AtomicU32) {
    let (Some(ring), Some(state)) = (&store.ring, &store.pull_replication) else {
        return;
    };
    let begin = std::time::Instant::now();

    let iteration = state.next_iteration();
    let ring_version = ring.version();
    let partition_bit_count = u32::from(ring.partition_bit_count()).min(32);
    let partitions = 1u64 << partition_bit_count;
    let workers = store.config.out_pull_replication_workers.max(1) as u64;
    let start_partition = rand::thread_rng().gen_range(0..partitions);

    std::thread::scope(|scope| {
        for worker in 0..workers {
            let ring = ring.clone();
            scope.spawn(move || {
                let mut bloom = KtBloomFilter::new(
                    store.config.out_pull_replication_bloom_n,
                    store.config.out_pull_replication_bloom_p,
                    iteration,
                );
                let mut stride = worker;
                while stride < partitions {
                    if abort.load(Ordering::SeqCst) != 0 || ring.version() != ring_version {
                        return;
                    }
                    let partition = (start_partition + stride) % partitions;
                    if ring.responsible(partition as u32) {
                        pull_partition(
                            store,
                            state,
                            &ring,
                            partition,
                            partition_bit_count,
                            iteration,
                            ring_version,
                            &mut bloom,
                            abort,
                        );
                    }
                    stride += workers;
                }
            });
        }
    });

    log::debug!(
        "out pull replication pass took {:?}",
        begin.elapsed()
    );
}

#[allow(clippy::too_many_arguments)]
fn pull_partition(
    store: &StoreInner,
    state: &PullReplicationState,
    ring: &Arc<dyn MsgRing>,
    partition: u64,
    partition_bit_count: u32,
    iteration: u16,
    ring_version: u64,
    bloom: &mut KtBloomFilter,
    abort: &AtomicU32,
) {
    let (start, stop) = partition_range(partition, partition_bit_count);
    let bloom_n = store.config.out_pull_replication_bloom_n;

    // Halve the sub-range until the filter can hold it
    let mut pull_size = if partition_bit_count == 0 {
        1u64 << 63
    } else {
        1u64 << (64 - partition_bit_count)
    };
    while pull_size > 1 && store.loc_map.scan_count(start, start + (pull_size - 1), bloom_n) >= bloom_n
    {
        pull_size /= 2;
    }

    let now = timestamp::now();
    let cutoff =
        now.saturating_sub(timestamp::age_to_bits(u64::from(store.config.replication_ignore_recent)));
    let tombstone_cutoff =
        now.saturating_sub(timestamp::age_to_bits(u64::from(store.config.tombstone_age)));

    let mut substart = start;
    let mut substop = start.wrapping_add(pull_size - 1);
    while abort.load(Ordering::SeqCst) == 0 && ring.version() == ring_version {
        bloom.reset(iteration);
        store.loc_map.scan_callback(
            substart,
            substop,
            0,
            LOCAL_REMOVAL,
            cutoff,
            u64::MAX,
            &mut |key_a, key_b, tsb, _length| {
                if tsb & DELETION == 0 || tsb >= tombstone_cutoff {
                    bloom.add(key_a, key_b, tsb);
                }
                true
            },
        );
        if abort.load(Ordering::SeqCst) != 0 {
            break;
        }

        let Ok(mut msg) = state.out_free_rx.recv() else {
            break;
        };
        msg.fill(
            ring.node_id(),
            ring_version,
            partition as u32,
            cutoff,
            substart,
            substop,
            bloom,
        );
        ring.msg_to_other_replicas(
            partition as u32,
            Box::new(msg),
            store.config.out_pull_replication_msg_timeout,
        );

        substart = substart.wrapping_add(pull_size);
        let (next_stop, wrapped) = substop.overflowing_add(pull_size);
        if wrapped || next_stop > stop {
            break;
        }
        substop = next_stop;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let (tx, _rx) = bounded(1);
        let mut msg = PullReplicationMsg::new(tx);
        let bloom = KtBloomFilter::new(100, 0.01, 9);
        msg.fill(77, 3, 12, 0xC0FFEE, 0x1000, 0x1fff, &bloom);
        assert_eq!(msg.node_id(), 77);
        assert_eq!(msg.ring_version(), 3);
        assert_eq!(msg.partition(), 12);
        assert_eq!(msg.range_start(), 0x1000);
        assert_eq!(msg.range_stop(), 0x1fff);
        assert_eq!(
            msg.msg_length() as usize,
            PULL_REPLICATION_MSG_HEADER_LEN + bloom.wire_len()
        );
        msg.bloom().unwrap();
    }

    #[test]
    fn partition_ranges_cover_keyspace() {
        assert_eq!(partition_range(0, 0), (0, u64::MAX));
        assert_eq!(partition_range(0, 2), (0, (1 << 62) - 1));
        assert_eq!(partition_range(3, 2), (3 << 62, u64::MAX));
        let (s2, e2) = partition_range(2, 2);
        assert_eq!(s2, 2 << 62);
        assert_eq!(e2, (3 << 62) - 1);
    }
}
