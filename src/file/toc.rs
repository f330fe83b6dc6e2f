//! TOC record codec and the recovery-time readers.
//!
//! Recovery trusts only what checksums confirm: records are parsed out of
//! CRC-verified spans, and a pair whose trailer is missing (crash) is
//! salvaged up to the last span that still verifies.

use super::{read_header, Trailer, HEADER_LEN};
use crate::mem::TocEntry;
use crate::Result;
use byteorder::{BigEndian, ByteOrder};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// keyA(8) keyB(8) tsb(8) offset(4) length(4)
pub(crate) const TOC_ENTRY_LEN: usize = 32;

pub(crate) fn encode_record(e: &TocEntry) -> [u8; TOC_ENTRY_LEN] {
    let mut buf = [0u8; TOC_ENTRY_LEN];
    BigEndian::write_u64(&mut buf[0..8], e.key_a);
    BigEndian::write_u64(&mut buf[8..16], e.key_b);
    BigEndian::write_u64(&mut buf[16..24], e.timestamp_bits);
    BigEndian::write_u32(&mut buf[24..28], e.offset);
    BigEndian::write_u32(&mut buf[28..32], e.length);
    buf
}

pub(crate) fn decode_record(buf: &[u8]) -> TocEntry {
    TocEntry {
        key_a: BigEndian::read_u64(&buf[0..8]),
        key_b: BigEndian::read_u64(&buf[8..16]),
        timestamp_bits: BigEndian::read_u64(&buf[16..24]),
        offset: BigEndian::read_u32(&buf[24..28]),
        length: BigEndian::read_u32(&buf[28..32]),
    }
}

/// Outcome of reading one TOC file
pub(crate) struct TocSummary {
    pub timestamp_nano: i64,
    /// False if the trailer was missing or a span failed verification and
    /// the file was salvaged instead of fully read
    pub clean: bool,
    pub entry_count: u64,
}

/// Reads every verifiable record of a TOC file in order
pub(crate) fn read_records(
    toc_path: &Path,
    checksum_interval: u32,
    cb: &mut dyn FnMut(TocEntry),
) -> Result<TocSummary> {
    let mut file = File::open(toc_path)?;
    let timestamp_nano = read_header(&mut file)?;
    let trailer = Trailer::read_from(&mut file)?;
    file.seek(SeekFrom::Start(HEADER_LEN))?;

    let interval = u64::from(checksum_interval);
    let mut clean = trailer.is_some();
    let payload_target = trailer.as_ref().map(|t| t.payload_len);

    let mut span_buf = vec![0u8; interval as usize + 4];
    let mut pending: Vec<u8> = Vec::new();
    let mut payload_read: u64 = 0;
    let mut entry_count: u64 = 0;

    loop {
        let span_len = match payload_target {
            Some(target) => {
                let remaining = target - payload_read;
                if remaining == 0 {
                    break;
                }
                interval.min(remaining) as usize
            }
            None => interval as usize,
        };

        let chunk = &mut span_buf[..span_len + 4];
        match file.read_exact(chunk) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Crash tail shorter than a full span; nothing verifiable left
                clean = false;
                break;
            }
            Err(e) => return Err(e.into()),
        }

        let stored = BigEndian::read_u32(&chunk[span_len..]);
        if crc32fast::hash(&chunk[..span_len]) != stored {
            log::warn!(
                "checksum mismatch in {} at payload offset {payload_read}, salvage stops here",
                toc_path.display()
            );
            clean = false;
            break;
        }

        payload_read += span_len as u64;
        pending.extend_from_slice(&chunk[..span_len]);
        while pending.len() >= TOC_ENTRY_LEN {
            cb(decode_record(&pending[..TOC_ENTRY_LEN]));
            pending.drain(..TOC_ENTRY_LEN);
            entry_count += 1;
        }
    }

    Ok(TocSummary {
        timestamp_nano,
        clean,
        entry_count,
    })
}

/// Determines how much values-file payload recovery may trust: the trailer's
/// payload length for a cleanly closed file, otherwise the bytes covered by
/// complete CRC spans
pub(crate) fn trusted_values_payload(values_path: &Path, checksum_interval: u32) -> Result<u64> {
    let mut file = File::open(values_path)?;
    read_header(&mut file)?;
    if let Some(trailer) = Trailer::read_from(&mut file)? {
        return Ok(trailer.payload_len);
    }
    let interval = u64::from(checksum_interval);
    let body = file.metadata()?.len().saturating_sub(HEADER_LEN);
    Ok(body / (interval + 4) * interval)
}

/// One recoverable values/TOC pair found on disk
pub(crate) struct DiscoveredPair {
    pub timestamp_nano: i64,
    pub values_path: PathBuf,
    pub toc_path: PathBuf,
}

/// Lists file pairs under the configured directories, oldest first
pub(crate) fn discover_pairs(path: &Path, path_toc: &Path) -> Result<Vec<DiscoveredPair>> {
    let mut pairs = Vec::new();
    for dirent in std::fs::read_dir(path_toc)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(stem) = name
            .to_str()
            .and_then(|n| n.strip_suffix(".toc"))
        else {
            continue;
        };
        let Ok(timestamp_nano) = stem.parse::<i64>() else {
            continue;
        };
        let values_path = path.join(format!("{timestamp_nano}.values"));
        if !values_path.try_exists()? {
            log::error!(
                "TOC file {} has no matching values file, skipping",
                dirent.path().display()
            );
            continue;
        }
        pairs.push(DiscoveredPair {
            timestamp_nano,
            values_path,
            toc_path: dirent.path(),
        });
    }
    pairs.sort_by_key(|p| p.timestamp_nano);
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRegistry;
    use crate::file::writer::FilePairWriter;

    #[test]
    fn records_round_trip_across_span_boundaries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = BlockRegistry::new();
        // 24-byte spans so every 32-byte record straddles a boundary
        let (mut writer, _) =
            FilePairWriter::create(dir.path(), dir.path(), 24, u64::MAX, 1, &registry)?;
        for i in 0..10u64 {
            writer.append(i, i + 100, 0x300 + (i << 8), b"v");
        }
        let file = writer.close()?;

        let mut seen = Vec::new();
        let summary = read_records(file.toc_path(), 24, &mut |e| seen.push(e))?;
        assert!(summary.clean);
        assert_eq!(summary.entry_count, 10);
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[3].key_a, 3);
        assert_eq!(seen[3].key_b, 103);
        assert_eq!(seen[3].offset, 3);
        assert_eq!(seen[3].length, 1);
        Ok(())
    }

    #[test]
    fn salvage_truncated_toc() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = BlockRegistry::new();
        let (mut writer, _) =
            FilePairWriter::create(dir.path(), dir.path(), 64, u64::MAX, 1, &registry)?;
        for i in 0..20u64 {
            writer.append(i, i, 0x300, b"v");
        }
        let file = writer.close()?;
        let toc_path = file.toc_path().clone();

        // Chop the trailer and part of the final span off, simulating a crash
        let len = std::fs::metadata(&toc_path)?.len();
        let f = std::fs::OpenOptions::new().write(true).open(&toc_path)?;
        f.set_len(len - 40)?;

        let mut seen = 0usize;
        let summary = read_records(&toc_path, 64, &mut |_| seen += 1)?;
        assert!(!summary.clean);
        // 20 records * 32 bytes = 640 payload = 10 complete 64-byte spans;
        // chopping 40 bytes kills the trailer (16) plus the last span's CRC
        // region, so at least one span of records must survive
        assert!(seen > 0 && seen < 20);
        assert_eq!(summary.entry_count as usize, seen);
        Ok(())
    }

    #[test]
    fn discover_sorted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = BlockRegistry::new();
        for _ in 0..3 {
            let (mut w, _) =
                FilePairWriter::create(dir.path(), dir.path(), 64, u64::MAX, 1, &registry)?;
            w.append(1, 1, 0x100, b"x");
            w.close()?;
        }
        let pairs = discover_pairs(dir.path(), dir.path())?;
        assert_eq!(pairs.len(), 3);
        assert!(pairs.windows(2).all(|w| w[0].timestamp_nano < w[1].timestamp_nano));
        Ok(())
    }
}
