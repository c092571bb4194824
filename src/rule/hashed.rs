//! Hash-only backend: stores FNV-1a digests of normalized rule text
//! instead of the text itself. A fraction of the memory of the set
//! backend, with a small false-positive chance and no reportable match
//! data.

use rustc_hash::{FxHashMap, FxHashSet};

use super::{Presence, RuleBackend};
use crate::error::Result;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the raw bytes. Well distributed for short domain strings.
pub(crate) fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Clone, Copy)]
enum Width {
    Hash32,
    Hash64,
}

pub struct HashedBackend {
    width: Width,
    sets: FxHashMap<String, FxHashSet<u64>>,
}

impl HashedBackend {
    /// 64-bit digests (`hash` / `hash64`).
    pub fn wide() -> Self {
        Self {
            width: Width::Hash64,
            sets: FxHashMap::default(),
        }
    }

    /// 32-bit digests (`hash32`); half the memory, more collisions.
    pub fn narrow() -> Self {
        Self {
            width: Width::Hash32,
            sets: FxHashMap::default(),
        }
    }

    fn digest(&self, text: &str) -> u64 {
        let hash = fnv1a64(text.as_bytes());
        match self.width {
            Width::Hash64 => hash,
            Width::Hash32 => u64::from(hash as u32 ^ (hash >> 32) as u32),
        }
    }
}

impl RuleBackend for HashedBackend {
    fn begin(&mut self, key: &str, expected: usize) -> Result<()> {
        self.sets
            .entry(key.to_string())
            .or_insert_with(|| FxHashSet::with_capacity_and_hasher(expected, Default::default()));
        Ok(())
    }

    fn insert(&mut self, key: &str, text: &str) -> Result<bool> {
        let digest = self.digest(text);
        Ok(self.sets.entry(key.to_string()).or_default().insert(digest))
    }

    fn contains(&self, key: &str, candidate: &str) -> Result<Presence> {
        match self.sets.get(key) {
            Some(set) if set.contains(&self.digest(candidate)) => Ok(Presence::Probable),
            _ => Ok(Presence::Absent),
        }
    }
}
