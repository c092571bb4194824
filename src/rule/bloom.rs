//! Bloom filter backend: one filter per list namespace, sized from the
//! rule count for a 0.0001 false-positive rate. Hits are probable only;
//! the store confirms them against the raw list file or a sqlite store.

use rustc_hash::FxHashMap;

use super::hashed::fnv1a64;
use super::{Presence, RuleBackend};
use crate::error::Result;

/// Target chance of a false positive forcing a confirm pass.
const BLOOM_RATE: f64 = 0.0001;

/// Plain bloom filter with double hashing derived from one FNV-1a pass.
pub(crate) struct Bloom {
    bits: Vec<u8>,
    nbits: u64,
    hashes: u32,
}

impl Bloom {
    /// Sizes the filter for `n` expected entries at false-positive rate
    /// `p` (`m = -n ln p / (ln 2)^2`, `k = (m / n) ln 2`).
    pub(crate) fn with_estimates(n: usize, p: f64) -> Self {
        let n = n.max(1) as f64;
        let m = (-n * p.ln() / (std::f64::consts::LN_2 * std::f64::consts::LN_2)).ceil();
        let nbits = (m as u64).max(64);
        let hashes = ((nbits as f64 / n) * std::f64::consts::LN_2).round().max(1.0) as u32;
        Self {
            bits: vec![0u8; nbits.div_ceil(8) as usize],
            nbits,
            hashes,
        }
    }

    fn positions(&self, text: &str) -> impl Iterator<Item = u64> + '_ {
        let hash = fnv1a64(text.as_bytes());
        let h1 = hash & 0xffff_ffff;
        let h2 = (hash >> 32) | 1;
        (0..u64::from(self.hashes)).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2))) % self.nbits)
    }

    /// Sets all bit positions; returns false when every bit was already
    /// set (the entry tests as present).
    pub(crate) fn insert(&mut self, text: &str) -> bool {
        let positions: Vec<u64> = self.positions(text).collect();
        let mut fresh = false;
        for pos in positions {
            let (byte, bit) = ((pos >> 3) as usize, pos & 7);
            if self.bits[byte] & (1 << bit) == 0 {
                fresh = true;
                self.bits[byte] |= 1 << bit;
            }
        }
        fresh
    }

    pub(crate) fn contains(&self, text: &str) -> bool {
        self.positions(text).all(|pos| {
            let (byte, bit) = ((pos >> 3) as usize, pos & 7);
            self.bits[byte] & (1 << bit) != 0
        })
    }
}

#[derive(Default)]
pub struct BloomBackend {
    filters: FxHashMap<String, Bloom>,
}

impl RuleBackend for BloomBackend {
    fn begin(&mut self, key: &str, expected: usize) -> Result<()> {
        self.filters
            .entry(key.to_string())
            .or_insert_with(|| Bloom::with_estimates(expected, BLOOM_RATE));
        Ok(())
    }

    fn insert(&mut self, key: &str, text: &str) -> Result<bool> {
        let filter = self
            .filters
            .entry(key.to_string())
            .or_insert_with(|| Bloom::with_estimates(1, BLOOM_RATE));
        Ok(filter.insert(text))
    }

    fn contains(&self, key: &str, candidate: &str) -> Result<Presence> {
        match self.filters.get(key) {
            Some(filter) if filter.contains(candidate) => Ok(Presence::Probable),
            _ => Ok(Presence::Absent),
        }
    }
}
