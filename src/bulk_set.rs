//! Bulk-set messages: batched writes shipped between replicas.
//!
//! Wire layout: an 8-byte responder-node-id header (0 = no ack requested),
//! then entries of `keyA(8) keyB(8) tsb(8) length(4) value(length)`.
//! Messages are pooled and size-capped; inbound frames that cannot get a
//! pool slot within the configured timeout are drained off the wire and
//! dropped without error.

use crate::config::Config;
use crate::ring::{drain_frame, Msg, MsgType};
use crate::store::ValueStore;
use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::Read;
use std::sync::Weak;
use std::thread::JoinHandle;

pub(crate) const BULK_SET_MSG_HEADER_LEN: usize = 8;
pub(crate) const BULK_SET_MSG_ENTRY_HEADER_LEN: usize = 28;

/// A pooled bulk-set message
pub(crate) struct BulkSetMsg {
    header: [u8; BULK_SET_MSG_HEADER_LEN],
    body: Vec<u8>,
    cap: usize,
    pool: Sender<BulkSetMsg>,
}

impl BulkSetMsg {
    fn new(cap: usize, pool: Sender<BulkSetMsg>) -> Self {
        Self {
            header: [0; BULK_SET_MSG_HEADER_LEN],
            body: Vec::new(),
            cap,
            pool,
        }
    }

    pub fn clear(&mut self) {
        self.header = [0; BULK_SET_MSG_HEADER_LEN];
        self.body.clear();
    }

    /// Node to send a bulk-set-ack to; 0 requests no ack
    pub fn responder_node_id(&self) -> u64 {
        BigEndian::read_u64(&self.header)
    }

    pub fn set_responder_node_id(&mut self, node_id: u64) {
        BigEndian::write_u64(&mut self.header, node_id);
    }

    /// Appends an entry if it fits under the message cap; `false` leaves the
    /// message unchanged
    pub fn add(&mut self, key_a: u64, key_b: u64, timestamp_bits: u64, value: &[u8]) -> bool {
        let needed = BULK_SET_MSG_HEADER_LEN
            + self.body.len()
            + BULK_SET_MSG_ENTRY_HEADER_LEN
            + value.len();
        if needed > self.cap {
            return false;
        }
        let mut entry_header = [0u8; BULK_SET_MSG_ENTRY_HEADER_LEN];
        BigEndian::write_u64(&mut entry_header[0..8], key_a);
        BigEndian::write_u64(&mut entry_header[8..16], key_b);
        BigEndian::write_u64(&mut entry_header[16..24], timestamp_bits);
        BigEndian::write_u32(&mut entry_header[24..28], value.len() as u32);
        self.body.extend_from_slice(&entry_header);
        self.body.extend_from_slice(value);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Iterates (keyA, keyB, tsb, value) entries; a truncated trailing entry
    /// is ignored
    pub fn entries(&self) -> impl Iterator<Item = (u64, u64, u64, &[u8])> + '_ {
        let body = self.body.as_slice();
        let mut pos = 0usize;
        std::iter::from_fn(move || {
            if body.len() - pos < BULK_SET_MSG_ENTRY_HEADER_LEN {
                return None;
            }
            let key_a = BigEndian::read_u64(&body[pos..]);
            let key_b = BigEndian::read_u64(&body[pos + 8..]);
            let tsb = BigEndian::read_u64(&body[pos + 16..]);
            let length = BigEndian::read_u32(&body[pos + 24..]) as usize;
            let value_start = pos + BULK_SET_MSG_ENTRY_HEADER_LEN;
            if body.len() - value_start < length {
                return None;
            }
            pos = value_start + length;
            Some((key_a, key_b, tsb, &body[value_start..pos]))
        })
    }
}

impl Msg for BulkSetMsg {
    fn msg_type(&self) -> MsgType {
        MsgType::BulkSet
    }

    fn msg_length(&self) -> u64 {
        (BULK_SET_MSG_HEADER_LEN + self.body.len()) as u64
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

/// Channels and pools for bulk-set processing
pub(crate) struct BulkSetState {
    pub in_msg_tx: Sender<BulkSetMsg>,
    pub in_msg_rx: Receiver<BulkSetMsg>,
    pub in_free_tx: Sender<BulkSetMsg>,
    pub in_free_rx: Receiver<BulkSetMsg>,
    pub out_free_rx: Receiver<BulkSetMsg>,
}

impl BulkSetState {
    pub fn new(config: &Config) -> Self {
        let (in_msg_tx, in_msg_rx) = bounded(config.in_bulk_set_msgs);
        let (in_free_tx, in_free_rx) = bounded(config.in_bulk_set_msgs);
        for _ in 0..config.in_bulk_set_msgs {
            in_free_tx
                .send(BulkSetMsg::new(config.msg_cap, in_free_tx.clone()))
                .expect("free pool cannot be full");
        }
        let (out_free_tx, out_free_rx) = bounded(config.out_bulk_set_msgs);
        for _ in 0..config.out_bulk_set_msgs {
            out_free_tx
                .send(BulkSetMsg::new(
                    config.out_bulk_set_msg_cap,
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

    /// Blocks until an outgoing message is free, then hands it over cleared
    pub fn acquire_out(&self) -> Option<BulkSetMsg> {
        let mut msg = self.out_free_rx.recv().ok()?;
        msg.clear();
        Some(msg)
    }
}

impl ValueStore {
    /// Feeds an inbound bulk-set frame of `length` bytes from the transport.
    ///
    /// Returns the bytes consumed. If no message slot frees up within
    /// `in_bulk_set_msg_timeout` the frame is drained and dropped without
    /// error; a frame shorter than `length` yields `UnexpectedEof`.
    pub fn receive_bulk_set(&self, r: &mut dyn Read, length: u64) -> std::io::Result<u64> {
        let Some(state) = &self.0.bulk_set else {
            return drain_frame(r, length);
        };
        if length < BULK_SET_MSG_HEADER_LEN as u64
            || length - BULK_SET_MSG_HEADER_LEN as u64 > self.0.config.msg_cap as u64
        {
            return drain_frame(r, length);
        }
        let Ok(mut msg) = state
            .in_free_rx
            .recv_timeout(self.0.config.in_bulk_set_msg_timeout)
        else {
            log::debug!("no free inbound bulk-set message, dropping frame");
            return drain_frame(r, length);
        };

        msg.clear();
        if let Err(e) = r.read_exact(&mut msg.header) {
            let _ = state.in_free_tx.send(msg);
            return Err(e);
        }
        msg.body
            .resize((length - BULK_SET_MSG_HEADER_LEN as u64) as usize, 0);
        if let Err(e) = r.read_exact(&mut msg.body) {
            let _ = state.in_free_tx.send(msg);
            return Err(e);
        }

        state.in_msg_tx.send(msg).expect("inbound queue disconnected");
        Ok(length)
    }

    pub(crate) fn spawn_bulk_set_workers(&self) -> Vec<JoinHandle<()>> {
        let Some(state) = &self.0.bulk_set else {
            return Vec::new();
        };
        let mut handles = Vec::new();
        for i in 0..self.0.config.in_bulk_set_workers {
            let rx = state.in_msg_rx.clone();
            let free_tx = state.in_free_tx.clone();
            let weak = std::sync::Arc::downgrade(&self.0);
            let handle = std::thread::Builder::new()
                .name(format!("bulk-set-{i}"))
                .spawn(move || bulk_set_worker(&weak, &rx, &free_tx))
                .expect("failed to spawn bulk-set worker");
            handles.push(handle);
        }
        handles
    }
}

fn bulk_set_worker(
    weak: &Weak<crate::store::StoreInner>,
    rx: &Receiver<BulkSetMsg>,
    free_tx: &Sender<BulkSetMsg>,
) {
    let mut acks: Vec<(u64, u64, u64)> = Vec::new();
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
        let responder = msg.responder_node_id();
        acks.clear();
        for (key_a, key_b, timestamp_bits, value) in msg.entries() {
            match store.write_raw(key_a, key_b, timestamp_bits, value) {
                // Accepted, or already at-or-above the presented timestamp:
                // either way the sender can stop sending this entry.
                Ok(_) => {
                    if responder != 0 {
                        acks.push((key_a, key_b, timestamp_bits));
                    }
                }
                Err(e) => {
                    log::debug!("inbound bulk-set entry rejected: {e}");
                }
            }
        }
        let _ = free_tx.send(msg);
        if responder != 0 && !acks.is_empty() {
            store.send_bulk_set_acks(responder, &acks);
        }
    }
}
