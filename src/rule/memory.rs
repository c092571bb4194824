//! In-memory backend: one string set per list namespace. O(1) per
//! candidate, full match reporting.

use rustc_hash::{FxHashMap, FxHashSet};

use super::{Presence, RuleBackend};
use crate::error::Result;

#[derive(Default)]
pub struct MemoryBackend {
    sets: FxHashMap<String, FxHashSet<String>>,
}

impl RuleBackend for MemoryBackend {
    fn begin(&mut self, key: &str, expected: usize) -> Result<()> {
        self.sets
            .entry(key.to_string())
            .or_insert_with(|| FxHashSet::with_capacity_and_hasher(expected, Default::default()));
        Ok(())
    }

    fn insert(&mut self, key: &str, text: &str) -> Result<bool> {
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(text.to_string()))
    }

    fn contains(&self, key: &str, candidate: &str) -> Result<Presence> {
        match self.sets.get(key) {
            Some(set) if set.contains(candidate) => {
                Ok(Presence::Confirmed(candidate.to_string()))
            }
            _ => Ok(Presence::Absent),
        }
    }
}
