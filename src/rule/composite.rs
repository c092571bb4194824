//! Composite backend: an in-memory prefilter (bloom or hash) guarding a
//! sqlite confirm store. The prefilter keeps the hot path off disk; the
//! confirm pass removes false positives and restores match reporting.

use super::sqlite::SqliteBackend;
use super::{Presence, RuleBackend};
use crate::error::Result;

pub struct CompositeBackend {
    prefilter: Box<dyn RuleBackend>,
    confirm: SqliteBackend,
}

impl CompositeBackend {
    pub(crate) fn new(prefilter: Box<dyn RuleBackend>, confirm: SqliteBackend) -> Self {
        Self { prefilter, confirm }
    }
}

impl RuleBackend for CompositeBackend {
    fn begin(&mut self, key: &str, expected: usize) -> Result<()> {
        self.prefilter.begin(key, expected)?;
        self.confirm.begin(key, expected)
    }

    fn insert(&mut self, key: &str, text: &str) -> Result<bool> {
        self.prefilter.insert(key, text)?;
        // the confirm store decides deduplication
        self.confirm.insert(key, text)
    }

    fn contains(&self, key: &str, candidate: &str) -> Result<Presence> {
        match self.prefilter.contains(key, candidate)? {
            Presence::Absent => Ok(Presence::Absent),
            _ => self.confirm.contains(key, candidate),
        }
    }
}
