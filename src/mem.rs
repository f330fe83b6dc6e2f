//! In-memory write pages.
//!
//! Incoming writes land in the active page until it cannot fit the next
//! value plus its table-of-contents overhead; the page is then handed to the
//! flusher and a fresh one is pulled from the pool. A page stays readable
//! (and registered as a block) while it is queued and flushed; it is cleared
//! and recycled only after every entry has been relocated to the values file.

use crate::block::{BlockId, ValueBlock};
use crate::file::toc::TOC_ENTRY_LEN;
use crate::{Error, Result};
use std::sync::RwLock;

/// A staged index entry, recorded alongside the value bytes so the flusher
/// can emit the TOC record and relocate the index without re-deriving it
#[derive(Clone, Copy, Debug)]
pub(crate) struct TocEntry {
    pub key_a: u64,
    pub key_b: u64,
    pub timestamp_bits: u64,
    pub offset: u32,
    pub length: u32,
}

struct MemInner {
    values: Vec<u8>,
    entries: Vec<TocEntry>,
}

/// A fixed-size in-memory value block
pub(crate) struct MemBlock {
    id: BlockId,
    page_size: u32,
    inner: RwLock<MemInner>,
}

impl MemBlock {
    pub fn new(id: BlockId, page_size: u32) -> Self {
        Self {
            id,
            page_size,
            inner: RwLock::new(MemInner {
                values: Vec::new(),
                entries: Vec::new(),
            }),
        }
    }

    /// Whether the page can take another value of `length` bytes along with
    /// its TOC overhead. An empty page always fits exactly one value, even an
    /// oversized one (the page-size floor normally prevents that case).
    pub fn fits(&self, length: usize) -> bool {
        let inner = self.inner.read().expect("lock is poisoned");
        if inner.entries.is_empty() {
            return true;
        }
        let needed = inner.values.len() + length + (inner.entries.len() + 1) * TOC_ENTRY_LEN;
        needed <= self.page_size as usize
    }

    /// Appends a value and stages its TOC entry; returns the page offset
    pub fn append(&self, key_a: u64, key_b: u64, timestamp_bits: u64, value: &[u8]) -> u32 {
        let mut inner = self.inner.write().expect("lock is poisoned");
        let offset = inner.values.len() as u32;
        inner.values.extend_from_slice(value);
        inner.entries.push(TocEntry {
            key_a,
            key_b,
            timestamp_bits,
            offset,
            length: value.len() as u32,
        });
        offset
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .expect("lock is poisoned")
            .entries
            .is_empty()
    }

    /// Runs `f` over the staged entries and value bytes without copying them
    pub fn with_contents<T>(&self, f: impl FnOnce(&[TocEntry], &[u8]) -> T) -> T {
        let inner = self.inner.read().expect("lock is poisoned");
        f(&inner.entries, &inner.values)
    }

    /// Empties the page for reuse; only valid once every entry has been
    /// relocated off this block
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("lock is poisoned");
        inner.values.clear();
        inner.entries.clear();
    }
}

impl ValueBlock for MemBlock {
    fn id(&self) -> BlockId {
        self.id
    }

    fn timestamp_nano(&self) -> i64 {
        i64::MAX
    }

    fn read(&self, offset: u32, length: u32, buf: &mut Vec<u8>) -> Result<()> {
        let inner = self.inner.read().expect("lock is poisoned");
        let start = offset as usize;
        let end = start + length as usize;
        // The range can be gone if the page was flushed and recycled between
        // the index lookup and this read; the caller re-verifies and retries.
        let bytes = inner.values.get(start..end).ok_or(Error::Corrupt)?;
        buf.extend_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read() {
        let page = MemBlock::new(1, 4096);
        let off_a = page.append(1, 2, 0x300, b"testing");
        let off_b = page.append(3, 4, 0x400, b"more");
        assert_eq!(off_a, 0);
        assert_eq!(off_b, 7);

        let mut buf = Vec::new();
        page.read(off_a, 7, &mut buf).unwrap();
        assert_eq!(buf, b"testing");

        buf.clear();
        page.read(off_b, 4, &mut buf).unwrap();
        assert_eq!(buf, b"more");

        assert!(page.read(100, 50, &mut buf).is_err());
    }

    #[test]
    fn fits_accounts_for_toc_overhead() {
        let page = MemBlock::new(1, 100);
        assert!(page.fits(1000)); // empty pages always take one value
        page.append(1, 1, 0x100, &[0u8; 30]);
        // 30 bytes + value + 2 * 32 bytes of TOC overhead must fit in 100
        assert!(page.fits(6));
        assert!(!page.fits(7));
    }

    #[test]
    fn clear_recycles() {
        let page = MemBlock::new(1, 4096);
        page.append(1, 2, 0x300, b"x");
        assert!(!page.is_empty());
        page.clear();
        assert!(page.is_empty());
        assert_eq!(page.append(5, 6, 0x500, b"fresh"), 0);
    }
}
