//! Bloom filters for skipping runs that definitely do not contain a key.
//!
//! Fixed-size bit array with k hash probes derived from two base hashes
//! (double hashing). A negative answer is authoritative; a positive answer
//! means "maybe present".

use serde::{Deserialize, Serialize};

/// Bits per expected key when sizing a filter.
const BITS_PER_KEY: usize = 10;
/// Number of hash probes.
const NUM_HASHES: u32 = 3;

/// A fixed-size bloom filter over string keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
    inserted: u64,
}

impl BloomFilter {
    /// Create a filter sized for roughly `expected_keys` insertions
    /// (m = 10·n bits, k = 3).
    pub fn with_capacity(expected_keys: usize) -> Self {
        let num_bits = expected_keys.max(1) * BITS_PER_KEY;
        let words = num_bits.div_ceil(64);
        Self {
            bits: vec![0u64; words],
            num_bits,
            num_hashes: NUM_HASHES,
            inserted: 0,
        }
    }

    /// Add a key to the filter.
    pub fn insert(&mut self, key: &str) {
        let (h1, h2) = Self::base_hashes(key);
        for i in 0..self.num_hashes {
            let bit = self.probe(h1, h2, i);
            self.bits[bit / 64] |= 1u64 << (bit % 64);
        }
        self.inserted += 1;
    }

    /// Membership test. `false` is authoritative, `true` means "maybe".
    pub fn may_contain(&self, key: &str) -> bool {
        let (h1, h2) = Self::base_hashes(key);
        (0..self.num_hashes).all(|i| {
            let bit = self.probe(h1, h2, i);
            self.bits[bit / 64] & (1u64 << (bit % 64)) != 0
        })
    }

    /// Expected false-positive rate given the number of inserted keys:
    /// `(1 - e^(-k·n/m))^k`.
    pub fn estimated_fp_rate(&self) -> f64 {
        let k = self.num_hashes as f64;
        let n = self.inserted as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Number of bits in the filter.
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Number of hash probes per key.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    fn probe(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }

    /// Two polynomial rolling hashes over the UTF-8 bytes; the second is a
    /// salted variant so the probes are independent.
    fn base_hashes(key: &str) -> (u64, u64) {
        let mut h1: u64 = 17;
        let mut h2: u64 = 0x9e37_79b9_7f4a_7c15;
        for b in key.bytes() {
            h1 = h1.wrapping_mul(31).wrapping_add(b as u64);
            h2 = h2.wrapping_mul(131).wrapping_add(b as u64 ^ 0x5a);
        }
        (h1, h2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_keys_are_found() {
        let mut filter = BloomFilter::with_capacity(100);
        for i in 0..100 {
            filter.insert(&format!("key:{i}"));
        }
        for i in 0..100 {
            assert!(filter.may_contain(&format!("key:{i}")));
        }
    }

    #[test]
    fn test_absent_keys_are_mostly_rejected() {
        let mut filter = BloomFilter::with_capacity(100);
        for i in 0..100 {
            filter.insert(&format!("key:{i}"));
        }
        let false_positives = (0..1_000)
            .filter(|i| filter.may_contain(&format!("other:{i}")))
            .count();
        // At 10 bits/key with k=3 the expected rate is a few percent.
        assert!(false_positives < 100, "too many false positives: {false_positives}");
    }

    #[test]
    fn test_empty_filter_rejects_everything() {
        let filter = BloomFilter::with_capacity(10);
        assert!(!filter.may_contain("anything"));
    }

    #[test]
    fn test_fp_rate_grows_with_inserts() {
        let mut filter = BloomFilter::with_capacity(10);
        assert_eq!(filter.estimated_fp_rate(), 0.0);
        for i in 0..10 {
            filter.insert(&format!("k{i}"));
        }
        let at_capacity = filter.estimated_fp_rate();
        assert!(at_capacity > 0.0 && at_capacity < 0.2);

        for i in 10..100 {
            filter.insert(&format!("k{i}"));
        }
        assert!(filter.estimated_fp_rate() > at_capacity);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut filter = BloomFilter::with_capacity(16);
        filter.insert("alpha");
        filter.insert("beta");

        let json = serde_json::to_vec(&filter).unwrap();
        let restored: BloomFilter = serde_json::from_slice(&json).unwrap();

        assert_eq!(restored.num_bits(), filter.num_bits());
        assert_eq!(restored.num_hashes(), filter.num_hashes());
        assert!(restored.may_contain("alpha"));
        assert!(restored.may_contain("beta"));
        assert!(!restored.may_contain("gamma"));
    }
}
