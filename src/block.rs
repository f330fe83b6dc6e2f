//! Value-location blocks.
//!
//! Every location stored in the index names a block by a 32-bit ID. ID 0 is
//! reserved; the low IDs are handed to the in-memory write pages at startup,
//! and everything above them is an on-disk values file.

use crate::Result;
use std::sync::{Arc, RwLock};

/// Identifies a value-location block (page or values file); 0 is reserved
pub type BlockId = u32;

/// A container of value bytes addressable by (offset, length)
pub(crate) trait ValueBlock: Send + Sync {
    /// The block's registered ID
    fn id(&self) -> BlockId;

    /// Creation timestamp in nanoseconds; `i64::MAX` for in-memory pages,
    /// so pages always sort after any file
    fn timestamp_nano(&self) -> i64;

    /// Appends `length` bytes starting at `offset` to `buf`
    fn read(&self, offset: u32, length: u32, buf: &mut Vec<u8>) -> Result<()>;
}

/// Registry of live blocks, indexed by ID
pub(crate) struct BlockRegistry {
    blocks: RwLock<Vec<Option<Arc<dyn ValueBlock>>>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        // Slot 0 stays empty, 0 means "no block"
        Self {
            blocks: RwLock::new(vec![None]),
        }
    }

    /// Registers a block and returns its ID
    pub fn register(&self, block: Arc<dyn ValueBlock>) -> BlockId {
        let mut blocks = self.blocks.write().expect("lock is poisoned");
        let id = blocks.len() as BlockId;
        blocks.push(Some(block));
        id
    }

    /// Reserves the next ID without storing a block yet; the caller installs
    /// it with [`Self::install`] once the block exists (blocks usually need
    /// their own ID at construction time)
    pub fn reserve(&self) -> BlockId {
        let mut blocks = self.blocks.write().expect("lock is poisoned");
        let id = blocks.len() as BlockId;
        blocks.push(None);
        id
    }

    /// Installs a block into a previously reserved slot
    pub fn install(&self, id: BlockId, block: Arc<dyn ValueBlock>) {
        let mut blocks = self.blocks.write().expect("lock is poisoned");
        let slot = blocks
            .get_mut(id as usize)
            .expect("block id was never reserved");
        *slot = Some(block);
    }

    /// Drops the block registered under `id`
    pub fn unregister(&self, id: BlockId) {
        let mut blocks = self.blocks.write().expect("lock is poisoned");
        if let Some(slot) = blocks.get_mut(id as usize) {
            *slot = None;
        }
    }

    pub fn get(&self, id: BlockId) -> Option<Arc<dyn ValueBlock>> {
        let blocks = self.blocks.read().expect("lock is poisoned");
        blocks.get(id as usize).and_then(Clone::clone)
    }
}
