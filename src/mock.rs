use crate::ring::{Msg, MsgRing, MsgType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A captured outbound message
pub struct SentMsg {
    /// Destination: `Some(node_id)` for direct sends, `None` for
    /// other-replica fanout
    pub node_id: Option<u64>,
    /// Partition, for other-replica fanout
    pub partition: Option<u32>,
    /// Message kind
    pub msg_type: MsgType,
    /// Serialized content
    pub content: Vec<u8>,
}

/// Mock ring for tests: records every send and owns no peers
#[derive(Default)]
pub struct MockRing {
    node_id: u64,
    version: AtomicU64,
    partition_bit_count: u8,
    responsible_all: bool,
    /// Captured sends, in order
    pub sent: Mutex<Vec<SentMsg>>,
}

impl MockRing {
    /// A ring where the local node owns every partition
    #[must_use]
    pub fn new(node_id: u64, partition_bit_count: u8) -> Self {
        Self {
            node_id,
            version: AtomicU64::new(1),
            partition_bit_count,
            responsible_all: true,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// A ring where the local node owns nothing (push replication territory)
    #[must_use]
    pub fn new_unowned(node_id: u64, partition_bit_count: u8) -> Self {
        Self {
            responsible_all: false,
            ..Self::new(node_id, partition_bit_count)
        }
    }

    /// Bumps the ring version, as a membership change would
    pub fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn capture(&self, node_id: Option<u64>, partition: Option<u32>, msg: Box<dyn Msg>) {
        let mut content = Vec::new();
        let msg_type = msg.msg_type();
        msg.write_content(&mut content).expect("vec write");
        msg.done();
        self.sent.lock().expect("lock is poisoned").push(SentMsg {
            node_id,
            partition,
            msg_type,
            content,
        });
    }
}

impl MsgRing for MockRing {
    fn node_id(&self) -> u64 {
        self.node_id
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn partition_bit_count(&self) -> u8 {
        self.partition_bit_count
    }

    fn responsible(&self, _partition: u32) -> bool {
        self.responsible_all
    }

    fn msg_to_node(&self, node_id: u64, msg: Box<dyn Msg>, _timeout: Duration) {
        self.capture(Some(node_id), None, msg);
    }

    fn msg_to_other_replicas(&self, partition: u32, msg: Box<dyn Msg>, _timeout: Duration) {
        self.capture(None, Some(partition), msg);
    }
}
