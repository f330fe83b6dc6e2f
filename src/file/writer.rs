//! Write side of a values/TOC file pair.

use super::{file_len_for, write_header, TailState, Trailer, ValuesFile};
use crate::block::{BlockId, BlockRegistry, ValueBlock};
use crate::file::toc::{encode_record, TOC_ENTRY_LEN};
use crate::mem::TocEntry;
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Appends payload bytes, emitting a CRC after every `interval` of them.
///
/// Payload accumulates in the shared [`TailState`] (where readers of the
/// open file can already serve it) and reaches the file on [`flush`]:
/// complete spans are written with their CRCs and only then does the
/// durable mark advance, so a reader never seeks to bytes the OS has not
/// seen yet.
///
/// [`flush`]: ChecksumWriter::flush
pub(crate) struct ChecksumWriter {
    file: BufWriter<File>,
    interval: u32,
    tail: Arc<Mutex<TailState>>,
}

impl ChecksumWriter {
    fn new(file: File, interval: u32, tail: Arc<Mutex<TailState>>) -> Self {
        Self {
            file: BufWriter::new(file),
            interval,
            tail,
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        self.tail
            .lock()
            .expect("lock is poisoned")
            .buf
            .extend_from_slice(bytes);
    }

    fn payload_len(&self) -> u64 {
        let tail = self.tail.lock().expect("lock is poisoned");
        tail.durable + tail.buf.len() as u64
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let interval = self.interval as usize;
        let mut tail = self.tail.lock().expect("lock is poisoned");
        let full = (tail.buf.len() / interval) * interval;
        for chunk in tail.buf[..full].chunks(interval) {
            self.file.write_all(chunk)?;
            self.file
                .write_all(&crc32fast::hash(chunk).to_be_bytes())?;
        }
        self.file.flush()?;
        if full > 0 {
            tail.buf.drain(..full);
            tail.durable += full as u64;
        }
        Ok(())
    }

    /// Flushes everything including the partial span and its CRC, writes the
    /// trailer and fsyncs
    fn finish(mut self, entry_count: u32) -> std::io::Result<()> {
        self.flush()?;
        let payload_len = {
            let mut tail = self.tail.lock().expect("lock is poisoned");
            if !tail.buf.is_empty() {
                self.file.write_all(&tail.buf)?;
                self.file
                    .write_all(&crc32fast::hash(&tail.buf).to_be_bytes())?;
                let n = tail.buf.len() as u64;
                tail.buf.clear();
                tail.durable += n;
            }
            tail.durable
        };
        Trailer {
            entry_count,
            payload_len,
        }
        .write_to(&mut self.file)?;
        self.file.flush()?;
        self.file.get_mut().sync_all()?;
        Ok(())
    }
}

/// Writer over one open values/TOC pair
pub(crate) struct FilePairWriter {
    values: ChecksumWriter,
    toc: ChecksumWriter,
    file: Arc<ValuesFile>,
    entry_count: u64,
    file_cap: u64,
}

impl FilePairWriter {
    /// Creates a fresh pair named by the current nanosecond timestamp and
    /// registers its read side under a new block ID
    pub fn create(
        path: &Path,
        path_toc: &Path,
        checksum_interval: u32,
        file_cap: u64,
        readers: usize,
        registry: &BlockRegistry,
    ) -> Result<(Self, BlockId)> {
        let mut nano = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        let (values_path, toc_path) = loop {
            let values_path = path.join(format!("{nano}.values"));
            let toc_path = path_toc.join(format!("{nano}.toc"));
            if !values_path.try_exists()? && !toc_path.try_exists()? {
                break (values_path, toc_path);
            }
            nano += 1;
        };
        log::debug!("opening values file pair {}", values_path.display());

        let mut values_file = create_for_append(&values_path)?;
        write_header(&mut values_file, nano)?;
        let mut toc_file = create_for_append(&toc_path)?;
        write_header(&mut toc_file, nano)?;

        let tail = Arc::new(Mutex::new(TailState::default()));
        let id = registry.reserve();
        let file = Arc::new(ValuesFile::open(
            id,
            nano,
            values_path,
            toc_path,
            checksum_interval,
            readers,
            tail.clone(),
            false,
        )?);
        registry.install(id, file.clone());

        Ok((
            Self {
                values: ChecksumWriter::new(values_file, checksum_interval, tail),
                toc: ChecksumWriter::new(
                    toc_file,
                    checksum_interval,
                    Arc::new(Mutex::new(TailState::default())),
                ),
                file,
                entry_count: 0,
                file_cap,
            },
            id,
        ))
    }

    pub fn block_id(&self) -> BlockId {
        self.file.id()
    }

    pub fn file(&self) -> &Arc<ValuesFile> {
        &self.file
    }

    /// Whether another value of `length` bytes fits under the file cap.
    /// An empty pair accepts one value regardless (the cap floor guarantees
    /// room for any value up to `value_cap`).
    pub fn has_room(&self, length: u32) -> bool {
        if self.entry_count == 0 {
            return true;
        }
        let interval = u64::from(self.values.interval);
        let values_len = file_len_for(self.values.payload_len() + u64::from(length), interval);
        let toc_len = file_len_for(self.toc.payload_len() + TOC_ENTRY_LEN as u64, interval);
        values_len <= self.file_cap && toc_len <= self.file_cap
    }

    /// Appends a value and its TOC record; returns the values payload offset
    pub fn append(&mut self, key_a: u64, key_b: u64, timestamp_bits: u64, value: &[u8]) -> u32 {
        let offset = self.values.payload_len() as u32;
        self.values.write(value);
        let record = encode_record(&TocEntry {
            key_a,
            key_b,
            timestamp_bits,
            offset,
            length: value.len() as u32,
        });
        self.toc.write(&record);
        self.entry_count += 1;
        offset
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.values.flush()?;
        self.toc.flush()
    }

    /// Finalizes both files (partial-span CRCs, trailers, fsync) and marks
    /// the read side closed
    pub fn close(self) -> std::io::Result<Arc<ValuesFile>> {
        let count = self.entry_count as u32;
        self.values.finish(count)?;
        self.toc.finish(count)?;
        self.file.mark_closed();
        log::debug!(
            "closed values file pair {} with {count} entries",
            self.file.path().display()
        );
        Ok(self.file)
    }
}

fn create_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create_new(true).write(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::HEADER_LEN;

    #[test]
    fn checksum_spans_and_tail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = BlockRegistry::new();
        let (mut writer, id) = FilePairWriter::create(
            dir.path(),
            dir.path(),
            8, // tiny interval so spans roll quickly
            u64::MAX,
            2,
            &registry,
        )?;
        assert_eq!(id, 1);

        let off_a = writer.append(1, 2, 0x300, b"0123456789");
        let off_b = writer.append(3, 4, 0x400, b"abc");
        assert_eq!(off_a, 0);
        assert_eq!(off_b, 10);
        writer.flush()?;

        // First span is durable, the rest is tail; both must be readable.
        let file = writer.file().clone();
        let mut buf = Vec::new();
        file.read(0, 10, &mut buf)?;
        assert_eq!(buf, b"0123456789");
        buf.clear();
        file.read(10, 3, &mut buf)?;
        assert_eq!(buf, b"abc");

        let file = writer.close()?;
        let mut buf = Vec::new();
        file.read(0, 13, &mut buf)?;
        assert_eq!(buf, b"0123456789abc");
        assert_eq!(file.payload_len(), 13);
        Ok(())
    }

    #[test]
    fn room_accounting() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = BlockRegistry::new();
        let interval = 64u64;
        // Cap sized for exactly one 5-byte value plus its TOC record
        let cap = file_len_for(5, interval).max(file_len_for(TOC_ENTRY_LEN as u64, interval));
        let (mut writer, _) =
            FilePairWriter::create(dir.path(), dir.path(), interval as u32, cap, 1, &registry)?;

        assert!(writer.has_room(5));
        writer.append(1, 2, 0x300, b"12345");
        assert!(!writer.has_room(1));
        writer.close()?;
        Ok(())
    }

    #[test]
    fn corrupt_span_detected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = BlockRegistry::new();
        let (mut writer, _) =
            FilePairWriter::create(dir.path(), dir.path(), 8, u64::MAX, 1, &registry)?;
        writer.append(1, 2, 0x300, b"0123456789");
        let file = writer.close()?;

        // Flip a payload byte behind the reader's back
        use std::io::{Seek, SeekFrom};
        let mut raw = OpenOptions::new().write(true).open(file.path())?;
        raw.seek(SeekFrom::Start(HEADER_LEN + 2))?;
        raw.write_all(b"X")?;
        raw.sync_all()?;

        let mut buf = Vec::new();
        assert!(matches!(
            file.read(0, 10, &mut buf),
            Err(crate::Error::Corrupt)
        ));
        Ok(())
    }
}
