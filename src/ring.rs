//! The ring transport contract.
//!
//! The ring/membership service is an external collaborator: it knows which
//! partitions this node replicates, and it moves framed messages between
//! nodes. The store only depends on these traits; inbound frames are fed
//! back through the store's `receive_*` methods by whatever owns the ring.

use std::io::{Read, Write};
use std::time::Duration;

/// Kinds of messages the store exchanges over the ring
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum MsgType {
    /// A batch of writes, optionally requesting an ack
    BulkSet = 1,
    /// Confirmation triples for a previously received bulk-set
    BulkSetAck = 2,
    /// A bloom-filter request for missing keys in a range
    PullReplication = 3,
}

/// An outgoing message handed to the ring transport.
///
/// Messages are pooled: the transport must call [`Msg::done`] exactly once,
/// whether or not the message was actually sent, so the buffer returns to
/// its free list.
pub trait Msg: Send {
    /// The message kind, for transport-level framing
    fn msg_type(&self) -> MsgType;

    /// Total content length in bytes
    fn msg_length(&self) -> u64;

    /// Writes the message content; returns the number of bytes written
    fn write_content(&self, w: &mut dyn Write) -> std::io::Result<u64>;

    /// Returns the message to its pool
    fn done(self: Box<Self>);
}

/// Partition ownership plus message delivery, supplied by the ring service
pub trait MsgRing: Send + Sync {
    /// This node's ID
    fn node_id(&self) -> u64;

    /// Current ring version; passes abort when it moves
    fn version(&self) -> u64;

    /// Number of high keyA bits that select a partition
    fn partition_bit_count(&self) -> u8;

    /// Whether this node is one of the replicas for `partition`
    fn responsible(&self, partition: u32) -> bool;

    /// Sends to a specific node, best effort: if the message cannot be
    /// handed off within `timeout` it is dropped (and `done` called)
    fn msg_to_node(&self, node_id: u64, msg: Box<dyn Msg>, timeout: Duration);

    /// Sends to the other replicas of `partition`, best effort
    fn msg_to_other_replicas(&self, partition: u32, msg: Box<dyn Msg>, timeout: Duration);
}

/// Reads and discards `length` bytes of an inbound frame, reporting how many
/// were consumed; used when a message has to be dropped but the transport
/// stream must stay aligned
pub(crate) fn drain_frame(r: &mut dyn Read, length: u64) -> std::io::Result<u64> {
    let mut toss = [0u8; 64 * 1024];
    let mut consumed: u64 = 0;
    while consumed < length {
        let want = toss.len().min((length - consumed) as usize);
        let n = r.read(&mut toss[..want])?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        consumed += n as u64;
    }
    Ok(consumed)
}
