use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::error::StorageError;
use crate::storage::keys::KeyRange;

/// Byte-keyed tables, one per entity family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Queues,
    Sets,
}

impl Family {
    fn table(self) -> &'static str {
        match self {
            Family::Queues => "queues",
            Family::Sets => "sets",
        }
    }
}

#[derive(Debug)]
enum Op {
    Put {
        family: Family,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        family: Family,
        key: Vec<u8>,
    },
    Take {
        family: Family,
        key: Vec<u8>,
    },
    Incr {
        name: String,
        delta: i64,
    },
}

/// Mutations applied together in one transaction.
#[derive(Debug, Default)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, family: Family, key: Vec<u8>, value: Vec<u8>) -> Self {
        self.ops.push(Op::Put { family, key, value });
        self
    }

    pub fn delete(mut self, family: Family, key: Vec<u8>) -> Self {
        self.ops.push(Op::Delete { family, key });
        self
    }

    /// Deletes `key`, aborting the whole batch if it is already gone.
    pub fn take(mut self, family: Family, key: Vec<u8>) -> Self {
        self.ops.push(Op::Take { family, key });
        self
    }

    pub fn incr(mut self, name: impl Into<String>, delta: i64) -> Self {
        self.ops.push(Op::Incr {
            name: name.into(),
            delta,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Row effects of a committed batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub created: u64,
    pub deleted: u64,
}

pub type Entry = (Vec<u8>, Vec<u8>);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queues (
  k BLOB PRIMARY KEY,
  v BLOB NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS sets (
  k BLOB PRIMARY KEY,
  v BLOB NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS counters (
  name TEXT PRIMARY KEY,
  value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#;

/// Ordered key-value engine on a single SQLite connection.
#[derive(Debug)]
pub struct Kv {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl Kv {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened sqlite store");
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Commits every op or none. Returns `None` when a `take` found its key
    /// missing, in which case nothing was written.
    pub fn write(&self, batch: Batch) -> Result<Option<Applied>, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut applied = Applied::default();
        for op in batch.ops {
            match op {
                Op::Put { family, key, value } => {
                    let table = family.table();
                    let inserted = tx.execute(
                        &format!("INSERT OR IGNORE INTO {table} (k, v) VALUES (?1, ?2)"),
                        params![key, value],
                    )?;
                    if inserted == 0 {
                        tx.execute(
                            &format!("UPDATE {table} SET v = ?2 WHERE k = ?1"),
                            params![key, value],
                        )?;
                    }
                    applied.created += inserted as u64;
                }
                Op::Delete { family, key } => {
                    let table = family.table();
                    let removed =
                        tx.execute(&format!("DELETE FROM {table} WHERE k = ?1"), params![key])?;
                    applied.deleted += removed as u64;
                }
                Op::Take { family, key } => {
                    let table = family.table();
                    let removed =
                        tx.execute(&format!("DELETE FROM {table} WHERE k = ?1"), params![key])?;
                    if removed == 0 {
                        return Ok(None);
                    }
                    applied.deleted += removed as u64;
                }
                Op::Incr { name, delta } => {
                    tx.execute(
                        "INSERT INTO counters (name, value) VALUES (?1, ?2)
                         ON CONFLICT(name) DO UPDATE SET value = value + excluded.value",
                        params![name, delta],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(Some(applied))
    }

    pub fn get(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                &format!("SELECT v FROM {} WHERE k = ?1", family.table()),
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Entries in key order, skipping `offset` and returning at most `limit`.
    pub fn scan(
        &self,
        family: Family,
        range: &KeyRange,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<Entry>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT k, v FROM {} WHERE k >= ?1 AND (?2 IS NULL OR k < ?2)
             ORDER BY k LIMIT ?3 OFFSET ?4",
            family.table()
        ))?;
        let limit = limit.map_or(-1, |limit| limit as i64);
        let rows = stmt.query_map(
            params![range.start, range.end, limit, offset as i64],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn first_in(&self, family: Family, range: &KeyRange) -> Result<Option<Entry>, StorageError> {
        Ok(self.scan(family, range, 0, Some(1))?.into_iter().next())
    }

    pub fn last_in(&self, family: Family, range: &KeyRange) -> Result<Option<Entry>, StorageError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!(
                    "SELECT k, v FROM {} WHERE k >= ?1 AND (?2 IS NULL OR k < ?2)
                     ORDER BY k DESC LIMIT 1",
                    family.table()
                ),
                params![range.start, range.end],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        Ok(entry)
    }

    /// Removes and returns the first entry in `range`.
    pub fn take_first(&self, family: Family, range: &KeyRange) -> Result<Option<Entry>, StorageError> {
        let table = family.table();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let entry = tx
            .query_row(
                &format!(
                    "SELECT k, v FROM {table} WHERE k >= ?1 AND (?2 IS NULL OR k < ?2)
                     ORDER BY k LIMIT 1"
                ),
                params![range.start, range.end],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        if let Some((key, _)) = &entry {
            tx.execute(&format!("DELETE FROM {table} WHERE k = ?1"), params![key])?;
        }
        tx.commit()?;
        Ok(entry)
    }

    /// Removes and returns every entry in `range`, in key order.
    pub fn take_range(&self, family: Family, range: &KeyRange) -> Result<Vec<Entry>, StorageError> {
        let table = family.table();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let entries = {
            let mut stmt = tx.prepare(&format!(
                "SELECT k, v FROM {table} WHERE k >= ?1 AND (?2 IS NULL OR k < ?2) ORDER BY k"
            ))?;
            let rows = stmt.query_map(params![range.start, range.end], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.execute(
            &format!("DELETE FROM {table} WHERE k >= ?1 AND (?2 IS NULL OR k < ?2)"),
            params![range.start, range.end],
        )?;
        tx.commit()?;
        Ok(entries)
    }

    pub fn count(&self, family: Family, range: &KeyRange) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE k >= ?1 AND (?2 IS NULL OR k < ?2)",
                family.table()
            ),
            params![range.start, range.end],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn delete_range(&self, family: Family, range: &KeyRange) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE k >= ?1 AND (?2 IS NULL OR k < ?2)",
                family.table()
            ),
            params![range.start, range.end],
        )?;
        Ok(removed as u64)
    }

    pub fn counter(&self, name: &str) -> Result<i64, StorageError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM counters WHERE name = ?1",
                params![name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    pub fn meta_put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn meta_delete(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM meta WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn meta_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM meta WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![prefix, prefix.chars().count() as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let keys = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Drops every row in every table.
    pub fn clear(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "DELETE FROM queues; DELETE FROM sets; DELETE FROM counters; DELETE FROM meta;",
        )?;
        Ok(())
    }

    /// Writes a consistent copy of the database to `dest`. The copy is taken
    /// from a WAL snapshot on a separate read-only connection, so writers
    /// are not blocked while it runs.
    pub fn backup_to(&self, dest: &Path) -> Result<(), StorageError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute("VACUUM INTO ?1", params![dest.to_string_lossy().into_owned()])?;
        Ok(())
    }
}
