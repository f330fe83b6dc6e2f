//! Bulk-set-ack messages: "you can stop sending me these".
//!
//! Wire layout: an unused 8-byte header (0), then `keyA(8) keyB(8) tsb(8)`
//! triples. A node that pushed keys it is not responsible for receives acks
//! from the responsible replica and plants local-removal markers, hiding
//! those keys from future replication passes and freeing them for
//! compaction.

use crate::config::Config;
use crate::ring::{drain_frame, Msg, MsgType};
use crate::store::{StoreInner, ValueStore};
use crate::timestamp::LOCAL_REMOVAL;
use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::Read;
use std::sync::Weak;
use std::thread::JoinHandle;

pub(crate) const BULK_SET_ACK_MSG_HEADER_LEN: usize = 8;
pub(crate) const BULK_SET_ACK_MSG_ENTRY_LEN: usize = 24;

/// A pooled bulk-set-ack message
pub(crate) struct BulkSetAckMsg {
    header: [u8; BULK_SET_ACK_MSG_HEADER_LEN],
    body: Vec<u8>,
    cap: usize,
    pool: Sender<BulkSetAckMsg>,
}

impl BulkSetAckMsg {
    fn new(cap: usize, pool: Sender<BulkSetAckMsg>) -> Self {
        Self {
            header: [0; BULK_SET_ACK_MSG_HEADER_LEN],
            body: Vec::new(),
            cap,
            pool,
        }
    }

    pub fn clear(&mut self) {
        self.body.clear();
    }

    pub fn add(&mut self, key_a: u64, key_b: u64, timestamp_bits: u64) -> bool {
        let needed = BULK_SET_ACK_MSG_HEADER_LEN + self.body.len() + BULK_SET_ACK_MSG_ENTRY_LEN;
        if needed > self.cap {
            return false;
        }
        let mut entry = [0u8; BULK_SET_ACK_MSG_ENTRY_LEN];
        BigEndian::write_u64(&mut entry[0..8], key_a);
        BigEndian::write_u64(&mut entry[8..16], key_b);
        BigEndian::write_u64(&mut entry[16..24], timestamp_bits);
        self.body.extend_from_slice(&entry);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (u64, u64, u64)> + '_ {
        self.body.chunks_exact(BULK_SET_ACK_MSG_ENTRY_LEN).map(|c| {
            (
                BigEndian::read_u64(&c[0..8]),
                BigEndian::read_u64(&c[8..16]),
                BigEndian::read_u64(&c[16..24]),
            )
        })
    }
}

impl Msg for BulkSetAckMsg {
    fn msg_type(&self) -> MsgType {
        MsgType::BulkSetAck
    }

    fn msg_length(&self) -> u64 {
        (BULK_SET_ACK_MSG_HEADER_LEN + self.body.len()) as u64
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

/// Channels and pools for bulk-set-ack processing
pub(crate) struct BulkSetAckState {
    pub in_msg_tx: Sender<BulkSetAckMsg>,
    pub in_msg_rx: Receiver<BulkSetAckMsg>,
    pub in_free_tx: Sender<BulkSetAckMsg>,
    pub in_free_rx: Receiver<BulkSetAckMsg>,
    pub out_free_rx: Receiver<BulkSetAckMsg>,
}

impl BulkSetAckState {
    pub fn new(config: &Config) -> Self {
        let (in_msg_tx, in_msg_rx) = bounded(config.in_bulk_set_ack_msgs);
        let (in_free_tx, in_free_rx) = bounded(config.in_bulk_set_ack_msgs);
        for _ in 0..config.in_bulk_set_ack_msgs {
            in_free_tx
                .send(BulkSetAckMsg::new(config.msg_cap, in_free_tx.clone()))
                .expect("free pool cannot be full");
        }
        let (out_free_tx, out_free_rx) = bounded(config.out_bulk_set_ack_msgs);
        for _ in 0..config.out_bulk_set_ack_msgs {
            out_free_tx
                .send(BulkSetAckMsg::new(
                    config.out_bulk_set_ack_msg_cap,
                    out_free_tx.clone(),
                ))
                .expect("free pool cannot be full");
        }
        Self {
            in_msg_tx,
            in_msg_rx,
            in_free_tx,
            in_free_rx,
            out_free_rx,
        }
    }
}

impl ValueStore {
    /// Feeds an inbound bulk-set-ack frame of `length` bytes; same dropping
    /// and EOF contract as [`ValueStore::receive_bulk_set`]
    pub fn receive_bulk_set_ack(&self, r: &mut dyn Read, length: u64) -> std::io::Result<u64> {
        let Some(state) = &self.0.bulk_set_ack else {
            return drain_frame(r, length);
        };
        if length < BULK_SET_ACK_MSG_HEADER_LEN as u64
            || length - BULK_SET_ACK_MSG_HEADER_LEN as u64 > self.0.config.msg_cap as u64
        {
            return drain_frame(r, length);
        }
        let Ok(mut msg) = state
            .in_free_rx
            .recv_timeout(self.0.config.in_bulk_set_ack_msg_timeout)
        else {
            log::debug!("no free inbound bulk-set-ack message, dropping frame");
            return drain_frame(r, length);
        };

        msg.clear();
        if let Err(e) = r.read_exact(&mut msg.header) {
            let _ = state.in_free_tx.send(msg);
            return Err(e);
        }
        msg.body
            .resize((length - BULK_SET_ACK_MSG_HEADER_LEN as u64) as usize, 0);
        if let Err(e) = r.read_exact(&mut msg.body) {
            let _ = state.in_free_tx.send(msg);
            return Err(e);
        }

        state.in_msg_tx.send(msg).expect("inbound queue disconnected");
        Ok(length)
    }

    pub(crate) fn spawn_bulk_set_ack_workers(&self) -> Vec<JoinHandle<()>> {
        let Some(state) = &self.0.bulk_set_ack else {
            return Vec::new();
        };
        let mut handles = Vec::new();
        for i in 0..self.0.config.in_bulk_set_ack_workers {
            let rx = state.in_msg_rx.clone();
            let free_tx = state.in_free_tx.clone();
            let weak = std::sync::Arc::downgrade(&self.0);
            let handle = std::thread::Builder::new()
                .name(format!("bulk-set-ack-{i}"))
                .spawn(move || bulk_set_ack_worker(&weak, &rx, &free_tx))
                .expect("failed to spawn bulk-set-ack worker");
            handles.push(handle);
        }
        handles
    }
}

fn bulk_set_ack_worker(
    weak: &Weak<StoreInner>,
    rx: &Receiver<BulkSetAckMsg>,
    free_tx: &Sender<BulkSetAckMsg>,
) {
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
        for (key_a, key_b, timestamp_bits) in msg.entries() {
            store.apply_ack(key_a, key_b, timestamp_bits);
        }
        let _ = free_tx.send(msg);
    }
}

impl StoreInner {
    /// Applies one acked triple: if this node does not own the key's
    /// partition and its copy is at or below the acked timestamp, the entry
    /// is shadowed with a local-removal marker. Re-applying the same ack is
    /// a no-op.
    pub(crate) fn apply_ack(&self, key_a: u64, key_b: u64, timestamp_bits: u64) {
        if let Some(ring) = &self.ring {
            let partition = (key_a >> (64 - u32::from(ring.partition_bit_count()))) as u32;
            if ring.responsible(partition) {
                // Never suppress a copy this node is a replica for
                return;
            }
        }
        self.loc_map.set(
            key_a,
            key_b,
            timestamp_bits | LOCAL_REMOVAL,
            0,
            0,
            0,
            false,
        );
    }

    /// Ships acks for `entries` to `node_id`, splitting across messages at
    /// the configured cap
    pub(crate) fn send_bulk_set_acks(&self, node_id: u64, entries: &[(u64, u64, u64)]) {
        let (Some(state), Some(ring)) = (&self.bulk_set_ack, &self.ring) else {
            return;
        };
        let mut current: Option<BulkSetAckMsg> = None;
        for &(key_a, key_b, timestamp_bits) in entries {
            if current.is_none() {
                let Ok(mut msg) = state.out_free_rx.recv() else {
                    return;
                };
                msg.clear();
                current = Some(msg);
            }
            let msg = current.as_mut().expect("message was just acquired");
            if !msg.add(key_a, key_b, timestamp_bits) {
                let full = current.take().expect("message was just filled");
                ring.msg_to_node(
                    node_id,
                    Box::new(full),
                    self.config.in_bulk_set_ack_msg_timeout,
                );
                if let Ok(mut msg) = state.out_free_rx.recv() {
                    msg.clear();
                    msg.add(key_a, key_b, timestamp_bits);
                    current = Some(msg);
                }
            }
        }
        if let Some(msg) = current {
            if msg.is_empty() {
                Box::new(msg).done();
            } else {
                ring.msg_to_node(
                    node_id,
                    Box::new(msg),
                    self.config.in_bulk_set_ack_msg_timeout,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standalone_msg(cap: usize) -> BulkSetAckMsg {
        let (tx, _rx) = bounded(1);
        BulkSetAckMsg::new(cap, tx)
    }

    #[test]
    fn wire_layout() {
        let mut msg = standalone_msg(usize::MAX >> 1);
        assert!(msg.add(1, 2, 0x300));
        let mut wire = Vec::new();
        msg.write_content(&mut wire).unwrap();
        assert_eq!(
            wire,
            vec![
                0, 0, 0, 0, 0, 0, 0, 0, // unused header
                0, 0, 0, 0, 0, 0, 0, 1, // keyA
                0, 0, 0, 0, 0, 0, 0, 2, // keyB
                0, 0, 0, 0, 0, 0, 3, 0, // timestamp
            ]
        );
    }

    #[test]
    fn cap_is_honored() {
        let mut msg = standalone_msg(
            BULK_SET_ACK_MSG_HEADER_LEN + 2 * BULK_SET_ACK_MSG_ENTRY_LEN,
        );
        assert!(msg.add(1, 1, 0x100));
        assert!(msg.add(2, 2, 0x200));
        assert!(!msg.add(3, 3, 0x300));
        assert_eq!(msg.entries().count(), 2);
    }
}
