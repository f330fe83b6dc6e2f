//! On-disk values/TOC file pairs.
//!
//! A pair shares one nanosecond creation timestamp, which is also its file
//! name stem. Both files carry a 16-byte header, a payload interleaved with
//! 4-byte CRCs every `checksum_interval` payload bytes, and a 16-byte
//! trailer recording the entry count and payload length.
//!
//! The values file payload is raw value bytes; the TOC payload is a stream
//! of fixed 32-byte records pointing into it. Index offsets are payload
//! offsets, so the position of payload byte `p` on disk is
//! `16 + p + 4 * (p / checksum_interval)`.

pub mod toc;
pub mod writer;

use crate::block::{BlockId, ValueBlock};
use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{Receiver, Sender};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const HEADER_LEN: u64 = 16;
pub(crate) const TRAILER_LEN: u64 = 16;
pub(crate) const HEADER_MAGIC: &[u8; 4] = b"VSTR";
pub(crate) const TRAILER_MAGIC: &[u8; 4] = b"TERM";
pub(crate) const FORMAT_VERSION: u32 = 1;

/// Payload bytes not yet covered by an on-disk CRC span, shared between the
/// pair writer and readers of the open file
#[derive(Default)]
pub(crate) struct TailState {
    /// Payload bytes durably spanned on disk
    pub durable: u64,
    /// Payload bytes accumulated since the last completed span
    pub buf: Vec<u8>,
}

/// Projected on-disk length of a file holding `payload` bytes once closed
pub(crate) fn file_len_for(payload: u64, interval: u64) -> u64 {
    HEADER_LEN + payload + 4 * payload.div_ceil(interval) + TRAILER_LEN
}

pub(crate) fn write_header<W: Write>(w: &mut W, timestamp_nano: i64) -> std::io::Result<()> {
    w.write_all(HEADER_MAGIC)?;
    w.write_u32::<BigEndian>(FORMAT_VERSION)?;
    w.write_i64::<BigEndian>(timestamp_nano)?;
    Ok(())
}

pub(crate) fn read_header<R: Read>(r: &mut R) -> Result<i64> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != HEADER_MAGIC {
        return Err(Error::Corrupt);
    }
    let version = r.read_u32::<BigEndian>()?;
    if version != FORMAT_VERSION {
        return Err(Error::InvalidVersion(version));
    }
    Ok(r.read_i64::<BigEndian>()?)
}

pub(crate) struct Trailer {
    pub entry_count: u32,
    pub payload_len: u64,
}

impl Trailer {
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(TRAILER_MAGIC)?;
        w.write_u32::<BigEndian>(self.entry_count)?;
        w.write_u64::<BigEndian>(self.payload_len)?;
        Ok(())
    }

    /// Reads the trailer from the end of `file`; `None` if the file was not
    /// cleanly closed
    pub fn read_from(file: &mut File) -> std::io::Result<Option<Self>> {
        let len = file.metadata()?.len();
        if len < HEADER_LEN + TRAILER_LEN {
            return Ok(None);
        }
        file.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != TRAILER_MAGIC {
            return Ok(None);
        }
        let entry_count = file.read_u32::<BigEndian>()?;
        let payload_len = file.read_u64::<BigEndian>()?;
        Ok(Some(Self {
            entry_count,
            payload_len,
        }))
    }
}

/// Read side of a values file: pooled descriptors and CRC-verified reads
pub(crate) struct ValuesFile {
    id: BlockId,
    timestamp_nano: i64,
    path: PathBuf,
    toc_path: PathBuf,
    checksum_interval: u32,
    tail: Arc<Mutex<TailState>>,
    reader_tx: Sender<File>,
    reader_rx: Receiver<File>,
    closed: AtomicBool,
    corrupt: AtomicBool,
}

impl ValuesFile {
    /// Opens the read side over an existing values file, with `readers`
    /// pooled descriptors
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: BlockId,
        timestamp_nano: i64,
        path: PathBuf,
        toc_path: PathBuf,
        checksum_interval: u32,
        readers: usize,
        tail: Arc<Mutex<TailState>>,
        closed: bool,
    ) -> Result<Self> {
        let (reader_tx, reader_rx) = crossbeam_channel::bounded(readers.max(1));
        for _ in 0..readers.max(1) {
            reader_tx
                .send(File::open(&path)?)
                .expect("reader pool cannot be full");
        }
        Ok(Self {
            id,
            timestamp_nano,
            path,
            toc_path,
            checksum_interval,
            tail,
            reader_tx,
            reader_rx,
            closed: AtomicBool::new(closed),
            corrupt: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn toc_path(&self) -> &PathBuf {
        &self.toc_path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::Acquire)
    }

    pub fn mark_corrupt(&self) {
        self.corrupt.store(true, Ordering::Release);
    }

    /// Total payload bytes written so far
    pub fn payload_len(&self) -> u64 {
        let tail = self.tail.lock().expect("lock is poisoned");
        tail.durable + tail.buf.len() as u64
    }

    /// Deletes both files of the pair
    pub fn unlink(&self) -> std::io::Result<()> {
        std::fs::remove_file(&self.path)?;
        std::fs::remove_file(&self.toc_path)?;
        Ok(())
    }

    fn read_spans(&self, start: u64, end: u64, durable: u64, buf: &mut Vec<u8>) -> Result<()> {
        let interval = u64::from(self.checksum_interval);
        let first_span = start / interval;
        let last_span = (end - 1) / interval;

        let mut file = self.reader_rx.recv().expect("reader pool disconnected");
        let result = (|| {
            let mut span_buf = vec![0u8; interval as usize + 4];
            for span in first_span..=last_span {
                let span_start = span * interval;
                let span_len = interval.min(durable - span_start) as usize;
                file.seek(SeekFrom::Start(HEADER_LEN + span * (interval + 4)))?;
                let chunk = &mut span_buf[..span_len + 4];
                file.read_exact(chunk)?;

                let stored = BigEndian::read_u32(&chunk[span_len..]);
                if crc32fast::hash(&chunk[..span_len]) != stored {
                    return Err(Error::Corrupt);
                }

                let copy_from = start.max(span_start) - span_start;
                let copy_to = end.min(span_start + span_len as u64) - span_start;
                buf.extend_from_slice(&chunk[copy_from as usize..copy_to as usize]);
            }
            Ok(())
        })();
        self.reader_tx.send(file).expect("reader pool disconnected");
        result
    }
}

impl ValueBlock for ValuesFile {
    fn id(&self) -> BlockId {
        self.id
    }

    fn timestamp_nano(&self) -> i64 {
        self.timestamp_nano
    }

    fn read(&self, offset: u32, length: u32, buf: &mut Vec<u8>) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let start = u64::from(offset);
        let end = start + u64::from(length);

        // Bytes past the durable mark are served from the shared tail.
        let (durable, tail_bytes) = {
            let tail = self.tail.lock().expect("lock is poisoned");
            if end > tail.durable {
                let have = tail.durable + tail.buf.len() as u64;
                if end > have {
                    // Stale index entry; the caller re-verifies and retries
                    return Err(Error::Corrupt);
                }
                let from = start.max(tail.durable) - tail.durable;
                let to = end - tail.durable;
                (
                    tail.durable,
                    tail.buf[from as usize..to as usize].to_vec(),
                )
            } else {
                (tail.durable, Vec::new())
            }
        };

        if start < durable {
            self.read_spans(start, end.min(durable), durable, buf)?;
        }
        buf.extend_from_slice(&tail_bytes);
        Ok(())
    }
}
