//! Salted k-tuple bloom filter for pull replication.
//!
//! Membership is over the (keyA, keyB, timestamp bits) triple, so the same
//! key at a different timestamp is a different member and an outdated
//! replica still triggers a re-send. The per-pass iteration salt varies the
//! hash functions between passes: a key that collides into false positives
//! on one pass will be retried on the next.
//!
//! A bloom filter can prove absence but only suggest presence; the false
//! positive rate is tuned by the capacity N and target probability P.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV_BASIS_A: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_BASIS_B: u64 = 0x517c_c1b7_2722_0a95;

// Serialized filters cap out well below this; anything larger is a mangled
// frame, not a filter.
const MAX_WIRE_BITS_BYTES: usize = 128 * 1024 * 1024;

fn fnv1a_64(data: &[u8], basis: u64) -> u64 {
    let mut hash = basis;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A k-tuple bloom filter keyed by (keyA, keyB, timestamp bits)
pub(crate) struct KtBloomFilter {
    num_bits: u64,
    num_hashes: u16,
    salt: u16,
    bits: Vec<u8>,
}

impl KtBloomFilter {
    /// Sizes the filter for `n` expected members at false-positive rate `p`
    pub fn new(n: u64, p: f64, salt: u16) -> Self {
        let n = n.max(1) as f64;
        let p = p.clamp(0.000_001, 0.999_999);

        let m = (-n * p.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let num_bits = m.max(8);
        let k = ((num_bits as f64 / n) * std::f64::consts::LN_2).ceil() as u16;
        let num_hashes = k.max(1);

        Self {
            num_bits,
            num_hashes,
            salt,
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
        }
    }

    /// Clears every bit and installs the salt for the next pass
    pub fn reset(&mut self, salt: u16) {
        self.salt = salt;
        self.bits.fill(0);
    }

    fn hash_pair(&self, key_a: u64, key_b: u64, timestamp_bits: u64) -> (u64, u64) {
        let mut buf = [0u8; 26];
        BigEndian::write_u64(&mut buf[0..8], key_a);
        BigEndian::write_u64(&mut buf[8..16], key_b);
        BigEndian::write_u64(&mut buf[16..24], timestamp_bits);
        BigEndian::write_u16(&mut buf[24..26], self.salt);
        (fnv1a_64(&buf, FNV_BASIS_A), fnv1a_64(&buf, FNV_BASIS_B))
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u16) -> u64 {
        h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.num_bits
    }

    pub fn add(&mut self, key_a: u64, key_b: u64, timestamp_bits: u64) {
        let (h1, h2) = self.hash_pair(key_a, key_b, timestamp_bits);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// `false` means definitely absent; `true` means probably present
    pub fn may_have(&self, key_a: u64, key_b: u64, timestamp_bits: u64) -> bool {
        let (h1, h2) = self.hash_pair(key_a, key_b, timestamp_bits);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            if self.bits[(idx / 8) as usize] & (1 << (idx % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Wire size: salt(2) k(2) num_bits(8) bit bytes
    pub fn wire_len(&self) -> usize {
        12 + self.bits.len()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u16::<BigEndian>(self.salt)?;
        w.write_u16::<BigEndian>(self.num_hashes)?;
        w.write_u64::<BigEndian>(self.num_bits)?;
        w.write_all(&self.bits)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let salt = r.read_u16::<BigEndian>()?;
        let num_hashes = r.read_u16::<BigEndian>()?;
        let num_bits = r.read_u64::<BigEndian>()?;
        let byte_len = num_bits.div_ceil(8) as usize;
        if num_bits == 0 || byte_len > MAX_WIRE_BITS_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("implausible bloom filter of {num_bits} bits"),
            ));
        }
        let mut bits = vec![0u8; byte_len];
        r.read_exact(&mut bits)?;
        Ok(Self {
            num_bits,
            num_hashes: num_hashes.max(1),
            salt,
            bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership() {
        let mut f = KtBloomFilter::new(1000, 0.001, 7);
        f.add(1, 2, 0x300);
        assert!(f.may_have(1, 2, 0x300));
        // Same key at another timestamp is a different member
        assert!(!f.may_have(1, 2, 0x400));
        assert!(!f.may_have(9, 9, 0x300));
    }

    #[test]
    fn reset_clears() {
        let mut f = KtBloomFilter::new(100, 0.01, 1);
        f.add(5, 6, 0x100);
        f.reset(2);
        assert!(!f.may_have(5, 6, 0x100));
    }

    #[test]
    fn salt_changes_hashing() {
        let mut a = KtBloomFilter::new(100, 0.01, 1);
        let mut b = KtBloomFilter::new(100, 0.01, 2);
        a.add(5, 6, 0x100);
        b.add(5, 6, 0x100);
        assert_ne!(a.bits, b.bits);
    }

    #[test]
    fn wire_round_trip() {
        let mut f = KtBloomFilter::new(500, 0.01, 42);
        for i in 0..200u64 {
            f.add(i, i * 3, 0x100 + (i << 8));
        }
        let mut wire = Vec::new();
        f.write_to(&mut wire).unwrap();
        assert_eq!(wire.len(), f.wire_len());

        let g = KtBloomFilter::read_from(&mut wire.as_slice()).unwrap();
        for i in 0..200u64 {
            assert!(g.may_have(i, i * 3, 0x100 + (i << 8)));
        }
        assert!(!g.may_have(1000, 1, 0x100));
    }

    #[test]
    fn false_positive_rate_in_range() {
        let mut f = KtBloomFilter::new(10_000, 0.01, 0);
        for i in 0..10_000u64 {
            f.add(i, 0, 0x100);
        }
        let false_positives = (10_000..30_000u64)
            .filter(|&i| f.may_have(i, 0, 0x100))
            .count();
        // 1% target over 20k probes; allow generous slack
        assert!(false_positives < 600, "{false_positives}");
    }
}
