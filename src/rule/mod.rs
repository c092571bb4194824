//! Rule store: membership tests deciding whether a domain is allowed or
//! blocked for a set of consumer groups.
//!
//! Rules are loaded once at engine construction and the store is frozen;
//! the read path needs no synchronization. Several backends trade memory
//! for accuracy behind the same [`RuleStore`] contract.

pub mod bloom;
pub mod composite;
pub mod hashed;
pub mod memory;
pub mod sqlite;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use regex::Regex;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::error::{GudgeonError, Result};
use crate::util;

use self::bloom::BloomBackend;
use self::composite::CompositeBackend;
use self::hashed::HashedBackend;
use self::memory::MemoryBackend;
use self::sqlite::SqliteBackend;

/// Whether a list (and thus its rules) allows or blocks matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Allow,
    Block,
}

impl RuleKind {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("allow") {
            Self::Allow
        } else {
            Self::Block
        }
    }

    fn opposite(self) -> Self {
        match self {
            Self::Allow => Self::Block,
            Self::Block => Self::Allow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleVariant {
    Exact,
    Wildcard,
    Regex,
}

/// One parsed rule line. `kind` is inherited from the owning list and
/// inverted by a `!` prefix.
#[derive(Debug, Clone)]
pub struct Rule {
    text: String,
    kind: RuleKind,
    variant: RuleVariant,
}

impl Rule {
    /// Parses a raw list line. Returns `None` for comments, empty lines
    /// and lines that normalize to nothing.
    pub fn parse(line: &str, list_kind: RuleKind) -> Option<Rule> {
        let text = normalize_line(line)?;

        let (text, kind) = match text.strip_prefix('!') {
            Some(rest) => (rest.trim_start().to_string(), list_kind.opposite()),
            None => (text, list_kind),
        };
        if text.is_empty() {
            return None;
        }

        if text.len() > 2 && text.starts_with('/') && text.ends_with('/') {
            return Some(Rule {
                text: text[1..text.len() - 1].to_string(),
                kind,
                variant: RuleVariant::Regex,
            });
        }

        if let Some(root) = text.strip_prefix("*.") {
            return Some(Rule {
                text: root.to_string(),
                kind,
                variant: RuleVariant::Wildcard,
            });
        }

        Some(Rule {
            text,
            kind,
            variant: RuleVariant::Exact,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }
}

/// Normalizes a list line: strips `#`/`;` comments, drops a leading IP
/// token (hosts format) and lower-cases the remainder.
fn normalize_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
        return None;
    }
    let line = line
        .split(|c| c == '#' || c == ';')
        .next()
        .unwrap_or_default()
        .trim();

    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;
    let text = match tokens.next() {
        // hosts format: the first token is an address, the rule is the rest
        Some(second) => second,
        None => first,
    };
    Some(text.to_ascii_lowercase())
}

/// Identity and location of a list as seen by the store.
#[derive(Debug, Clone)]
pub struct ListMeta {
    /// Canonical `<group>/<name>` identity.
    pub canonical: String,
    pub kind: RuleKind,
    /// Raw text on disk, used by the bloom backend's linear confirm pass.
    pub path: Option<PathBuf>,
}

/// Reference to the list and rule text that produced a match. Absent for
/// backends that only keep hashes of the rule text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRef {
    pub list: String,
    pub rule: String,
}

/// Result of a membership test across a set of groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    None,
    Allow(Option<RuleRef>),
    Block(Option<RuleRef>),
}

impl Match {
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block(_))
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

/// Membership store contract. `load` ingests rules for one `(group, list)`
/// pair; lookups fan a domain out over its parent names, consulting allow
/// lists of every group before any block list.
pub trait RuleStore: Send + Sync {
    /// Returns the number of rules actually inserted (input minus
    /// duplicates rejected by the backend).
    fn load(&mut self, group: &str, rules: &[Rule], meta: &ListMeta) -> Result<u64>;

    fn is_match_any(&self, groups: &[String], domain: &str) -> Match;

    fn is_match(&self, group: &str, domain: &str) -> Match {
        self.is_match_any(std::slice::from_ref(&group.to_string()), domain)
    }
}

/// Builds a store from the `storage.rules` configuration string. Unknown
/// names fall back to `memory` with a warning.
pub fn create_store(kind: &str, db_path: Option<&Path>) -> Result<Box<dyn RuleStore>> {
    let store: Box<dyn RuleStore> = match kind.to_ascii_lowercase().as_str() {
        "memory" => Box::new(Store::new(MemoryBackend::default(), false)),
        "hash" | "hash64" => Box::new(Store::new(HashedBackend::wide(), false)),
        "hash32" => Box::new(Store::new(HashedBackend::narrow(), false)),
        "bloom" => Box::new(Store::new(BloomBackend::default(), true)),
        "sqlite" => Box::new(Store::new(SqliteBackend::open(db_path)?, false)),
        "bloom+sqlite" => Box::new(Store::new(
            CompositeBackend::new(Box::new(BloomBackend::default()), SqliteBackend::open(db_path)?),
            false,
        )),
        "hash+sqlite" | "hash64+sqlite" => Box::new(Store::new(
            CompositeBackend::new(Box::new(HashedBackend::wide()), SqliteBackend::open(db_path)?),
            false,
        )),
        "hash32+sqlite" => Box::new(Store::new(
            CompositeBackend::new(Box::new(HashedBackend::narrow()), SqliteBackend::open(db_path)?),
            false,
        )),
        other => {
            warn!("Unknown rule store '{}', defaulting to memory", other);
            Box::new(Store::new(MemoryBackend::default(), false))
        }
    };
    Ok(store)
}

/// Outcome of a backend membership probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Presence {
    Absent,
    /// The backend cannot rule the candidate out (hash or filter hit).
    Probable,
    /// Definite hit with the stored rule text.
    Confirmed(String),
}

/// Raw membership storage. Namespace keys separate exact and wildcard
/// entries per list; backends never interpret them.
pub(crate) trait RuleBackend: Send + Sync {
    /// Announces that up to `expected` entries follow for `key`. Backends
    /// that size structures up front (bloom) hook this.
    fn begin(&mut self, key: &str, expected: usize) -> Result<()>;

    /// Ok(true) when newly inserted, Ok(false) for duplicates.
    fn insert(&mut self, key: &str, text: &str) -> Result<bool>;

    fn contains(&self, key: &str, candidate: &str) -> Result<Presence>;
}

struct StoredList {
    canonical: String,
    exact_key: String,
    wild_key: String,
    path: Option<PathBuf>,
    regexes: Vec<(Regex, String)>,
}

impl StoredList {
    fn new(canonical: &str, negated: bool, path: Option<PathBuf>) -> Self {
        let suffix = if negated { "!" } else { "" };
        Self {
            canonical: canonical.to_string(),
            exact_key: format!("{canonical}{suffix}"),
            wild_key: format!("{canonical}{suffix}:w"),
            path,
            regexes: Vec::new(),
        }
    }
}

#[derive(Default)]
struct ListIndex {
    lists: Vec<StoredList>,
    // group -> list indices, per side
    allow: FxHashMap<String, Vec<usize>>,
    block: FxHashMap<String, Vec<usize>>,
}

impl ListIndex {
    fn side(&self, kind: RuleKind) -> &FxHashMap<String, Vec<usize>> {
        match kind {
            RuleKind::Allow => &self.allow,
            RuleKind::Block => &self.block,
        }
    }

    fn register(&mut self, group: &str, kind: RuleKind, list: StoredList) -> usize {
        let idx = match self
            .lists
            .iter()
            .position(|l| l.exact_key == list.exact_key)
        {
            Some(idx) => idx,
            None => {
                self.lists.push(list);
                self.lists.len() - 1
            }
        };
        let map = match kind {
            RuleKind::Allow => &mut self.allow,
            RuleKind::Block => &mut self.block,
        };
        let entries = map.entry(group.to_string()).or_default();
        if !entries.contains(&idx) {
            entries.push(idx);
        }
        idx
    }
}

/// Generic store driving the fan-out match over a [`RuleBackend`].
pub(crate) struct Store<B> {
    backend: B,
    index: ListIndex,
    /// Confirm probable hits by scanning the on-disk list file (bloom
    /// without an attached sqlite store).
    confirm_files: bool,
}

impl<B: RuleBackend> Store<B> {
    pub(crate) fn new(backend: B, confirm_files: bool) -> Self {
        Self {
            backend,
            index: ListIndex::default(),
            confirm_files,
        }
    }

    fn load_side(
        &mut self,
        group: &str,
        canonical: &str,
        kind: RuleKind,
        negated: bool,
        path: Option<&Path>,
        rules: &[&Rule],
    ) -> Result<u64> {
        if rules.is_empty() {
            return Ok(0);
        }
        let idx = self.index.register(
            group,
            kind,
            StoredList::new(canonical, negated, path.map(Path::to_path_buf)),
        );

        let exact_key = self.index.lists[idx].exact_key.clone();
        let wild_key = self.index.lists[idx].wild_key.clone();
        let exact_n = rules
            .iter()
            .filter(|r| r.variant == RuleVariant::Exact)
            .count();
        let wild_n = rules
            .iter()
            .filter(|r| r.variant == RuleVariant::Wildcard)
            .count();
        self.backend.begin(&exact_key, exact_n)?;
        self.backend.begin(&wild_key, wild_n)?;

        let mut count = 0u64;
        for rule in rules {
            match rule.variant {
                RuleVariant::Exact => {
                    if self.backend.insert(&exact_key, &rule.text)? {
                        count += 1;
                    }
                }
                RuleVariant::Wildcard => {
                    if self.backend.insert(&wild_key, &rule.text)? {
                        count += 1;
                    }
                }
                RuleVariant::Regex => {
                    let list = &mut self.index.lists[idx];
                    if list.regexes.iter().any(|(_, t)| t == &rule.text) {
                        continue;
                    }
                    let re = Regex::new(&format!("(?i)^(?:{})$", rule.text)).map_err(|e| {
                        GudgeonError::Load(format!(
                            "invalid regex rule '{}' in {}: {}",
                            rule.text, canonical, e
                        ))
                    })?;
                    list.regexes.push((re, rule.text.clone()));
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn probe(&self, list: &StoredList, key: &str, candidate: &str, wildcard: bool) -> Option<Option<RuleRef>> {
        match self.backend.contains(key, candidate) {
            Err(e) => {
                // fail-open on lookup errors
                warn!("Rule lookup failed for '{}' in {}: {}", candidate, list.canonical, e);
                None
            }
            Ok(Presence::Absent) => None,
            Ok(Presence::Confirmed(text)) => {
                let rule = if wildcard { format!("*.{text}") } else { text };
                Some(Some(RuleRef {
                    list: list.canonical.clone(),
                    rule,
                }))
            }
            Ok(Presence::Probable) => {
                if self.confirm_files {
                    if let Some(path) = &list.path {
                        return if file_contains(path, candidate, wildcard) {
                            let rule = if wildcard {
                                format!("*.{candidate}")
                            } else {
                                candidate.to_string()
                            };
                            Some(Some(RuleRef {
                                list: list.canonical.clone(),
                                rule,
                            }))
                        } else {
                            None
                        };
                    }
                }
                // hit without reportable match data
                Some(None)
            }
        }
    }

    fn check_list(
        &self,
        list: &StoredList,
        domain: &str,
        candidates: &[&str],
    ) -> Option<Option<RuleRef>> {
        for candidate in candidates {
            if let Some(hit) = self.probe(list, &list.exact_key, candidate, false) {
                return Some(hit);
            }
            // wildcards match strict subdomains only
            if *candidate != domain {
                if let Some(hit) = self.probe(list, &list.wild_key, candidate, true) {
                    return Some(hit);
                }
            }
        }
        for (re, text) in &list.regexes {
            if re.is_match(domain) {
                return Some(Some(RuleRef {
                    list: list.canonical.clone(),
                    rule: format!("/{text}/"),
                }));
            }
        }
        None
    }

    fn scan_side(&self, groups: &[String], domain: &str, candidates: &[&str], kind: RuleKind) -> Option<Option<RuleRef>> {
        let side = self.index.side(kind);
        for group in groups {
            let Some(indices) = side.get(group) else {
                continue;
            };
            for &idx in indices {
                if let Some(hit) = self.check_list(&self.index.lists[idx], domain, candidates) {
                    return Some(hit);
                }
            }
        }
        None
    }
}

impl<B: RuleBackend> RuleStore for Store<B> {
    fn load(&mut self, group: &str, rules: &[Rule], meta: &ListMeta) -> Result<u64> {
        let (own, negated): (Vec<&Rule>, Vec<&Rule>) =
            rules.iter().partition(|r| r.kind == meta.kind);

        let mut count = self.load_side(
            group,
            &meta.canonical,
            meta.kind,
            false,
            meta.path.as_deref(),
            &own,
        )?;
        count += self.load_side(
            group,
            &meta.canonical,
            meta.kind.opposite(),
            true,
            meta.path.as_deref(),
            &negated,
        )?;
        Ok(count)
    }

    fn is_match_any(&self, groups: &[String], domain: &str) -> Match {
        let domain = util::canonicalize(domain);
        let candidates = util::domain_list(&domain);

        // allow lists of every group win over any block list
        if let Some(hit) = self.scan_side(groups, &domain, &candidates, RuleKind::Allow) {
            return Match::Allow(hit);
        }
        if let Some(hit) = self.scan_side(groups, &domain, &candidates, RuleKind::Block) {
            return Match::Block(hit);
        }
        Match::None
    }
}

/// Linear confirm pass over the raw list file, used by the bloom backend
/// when no sqlite confirm store is attached. Lines are normalized the same
/// way as at load time.
fn file_contains(path: &Path, candidate: &str, wildcard: bool) -> bool {
    let Ok(file) = File::open(path) else {
        // can't open the file, treat the filter hit as a match
        return true;
    };
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let Ok(line) = line else {
            return false;
        };
        let Some(text) = normalize_line(&line) else {
            continue;
        };
        let text = text.strip_prefix('!').unwrap_or(&text);
        let hit = if wildcard {
            text.strip_prefix("*.").is_some_and(|root| root == candidate)
        } else {
            text == candidate
        };
        if hit {
            return true;
        }
    }
    false
}
