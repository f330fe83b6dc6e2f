//! Test plumbing: an in-process ring that loops messages straight back into
//! the receiving store's inbound handlers.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use value_store::{Msg, MsgRing, MsgType, ValueStore};

/// The set of stores reachable through loopback rings
#[derive(Default)]
pub struct Cluster {
    stores: Mutex<HashMap<u64, ValueStore>>,
    version: AtomicU64,
}

impl Cluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stores: Mutex::new(HashMap::new()),
            version: AtomicU64::new(1),
        })
    }

    pub fn register(&self, node_id: u64, store: ValueStore) {
        self.stores
            .lock()
            .expect("lock is poisoned")
            .insert(node_id, store);
    }

    #[allow(unused)]
    pub fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn members(&self) -> Vec<(u64, ValueStore)> {
        self.stores
            .lock()
            .expect("lock is poisoned")
            .iter()
            .map(|(&id, s)| (id, s.clone()))
            .collect()
    }

    fn dispatch(store: &ValueStore, msg_type: MsgType, content: &[u8]) {
        let len = content.len() as u64;
        let mut cursor = Cursor::new(content);
        let _ = match msg_type {
            MsgType::BulkSet => store.receive_bulk_set(&mut cursor, len),
            MsgType::BulkSetAck => store.receive_bulk_set_ack(&mut cursor, len),
            MsgType::PullReplication => store.receive_pull_replication(&mut cursor, len),
        };
    }
}

/// One node's view of the cluster
pub struct LoopbackRing {
    pub node_id: u64,
    pub partition_bit_count: u8,
    /// Whether this node claims responsibility for every partition
    pub responsible: bool,
    pub cluster: Arc<Cluster>,
}

impl MsgRing for LoopbackRing {
    fn node_id(&self) -> u64 {
        self.node_id
    }

    fn version(&self) -> u64 {
        self.cluster.version.load(Ordering::SeqCst)
    }

    fn partition_bit_count(&self) -> u8 {
        self.partition_bit_count
    }

    fn responsible(&self, _partition: u32) -> bool {
        self.responsible
    }

    fn msg_to_node(&self, node_id: u64, msg: Box<dyn Msg>, _timeout: Duration) {
        let msg_type = msg.msg_type();
        let mut content = Vec::new();
        msg.write_content(&mut content).expect("vec write");
        msg.done();
        let target = self
            .cluster
            .stores
            .lock()
            .expect("lock is poisoned")
            .get(&node_id)
            .cloned();
        if let Some(store) = target {
            Cluster::dispatch(&store, msg_type, &content);
        }
    }

    fn msg_to_other_replicas(&self, _partition: u32, msg: Box<dyn Msg>, _timeout: Duration) {
        let msg_type = msg.msg_type();
        let mut content = Vec::new();
        msg.write_content(&mut content).expect("vec write");
        msg.done();
        for (id, store) in self.cluster.members() {
            if id != self.node_id {
                Cluster::dispatch(&store, msg_type, &content);
            }
        }
    }
}

/// Polls `cond` until it holds or `timeout` elapses
#[allow(unused)]
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[allow(unused)]
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_micros() as u64
}
