//! Sqlite backend: one indexed table per list namespace. Durable and
//! memory-free; slower than the in-memory backends but reports exact
//! match data and never false-positives.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashSet;

use super::hashed::fnv1a64;
use super::{Presence, RuleBackend};
use crate::error::{GudgeonError, Result};

pub struct SqliteBackend {
    conn: Mutex<Connection>,
    tables: FxHashSet<String>,
}

impl SqliteBackend {
    /// Opens the backing database, or an in-memory database when no path
    /// is configured (tests, cache-less setups).
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| GudgeonError::Load(format!("creating {parent:?}: {e}")))?;
                }
                Connection::open(path)
            }
            None => Connection::open_in_memory(),
        }
        .map_err(|e| GudgeonError::Load(format!("opening rule database: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        Ok(Self {
            conn: Mutex::new(conn),
            tables: FxHashSet::default(),
        })
    }

    /// Namespace keys contain `/` and `:`; tables are named from a
    /// sanitized form plus a digest to keep distinct keys distinct.
    fn table_name(key: &str) -> String {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("rules_{}_{:08x}", safe, fnv1a64(key.as_bytes()) as u32)
    }

    fn ensure_table(&mut self, key: &str) -> Result<String> {
        let table = Self::table_name(key);
        if self.tables.contains(&table) {
            return Ok(table);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("CREATE TABLE IF NOT EXISTS {table} (domain TEXT PRIMARY KEY) WITHOUT ROWID"),
            [],
        )
        .map_err(|e| GudgeonError::Load(format!("creating table for '{key}': {e}")))?;
        drop(conn);
        self.tables.insert(table.clone());
        Ok(table)
    }
}

impl RuleBackend for SqliteBackend {
    fn begin(&mut self, key: &str, _expected: usize) -> Result<()> {
        self.ensure_table(key)?;
        Ok(())
    }

    fn insert(&mut self, key: &str, text: &str) -> Result<bool> {
        let table = self.ensure_table(key)?;
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                &format!("INSERT OR IGNORE INTO {table} (domain) VALUES (?1)"),
                params![text],
            )
            .map_err(|e| GudgeonError::Load(format!("inserting into '{key}': {e}")))?;
        Ok(changed == 1)
    }

    fn contains(&self, key: &str, candidate: &str) -> Result<Presence> {
        let table = Self::table_name(key);
        if !self.tables.contains(&table) {
            return Ok(Presence::Absent);
        }
        let conn = self.conn.lock().unwrap();
        let found: Option<String> = conn
            .query_row(
                &format!("SELECT domain FROM {table} WHERE domain = ?1"),
                params![candidate],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| GudgeonError::Internal(format!("querying '{key}': {e}")))?;
        Ok(match found {
            Some(text) => Presence::Confirmed(text),
            None => Presence::Absent,
        })
    }
}
