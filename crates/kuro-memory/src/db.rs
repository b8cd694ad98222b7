//! [`MemoryDb`] – the single durable store shared by every memory component.
//!
//! One SQLite file in WAL mode, accessed through a small connection pool:
//!
//! * one **writer** connection behind a mutex. Every mutating operation takes
//!   the lock for exactly one `IMMEDIATE` transaction, so writers are
//!   serialised and no transaction ever spans two calls;
//! * a round-robin pool of **read-only** connections. Under WAL they never
//!   block on the writer.
//!
//! In-memory databases have no reader pool: every reader would be a separate,
//! empty database, so reads are routed through the writer instead.
//!
//! # Storage layout
//!
//! | table              | primary key                               |
//! |--------------------|-------------------------------------------|
//! | `memory_atoms`     | `(entity_id, dimension, context_hash)`    |
//! | `preferences`      | `key`                                     |
//! | `entity_relations` | `(from_entity, relation, to_entity)`      |
//!
//! Timestamps are stored as RFC-3339 UTC text. `entity_relations` is created
//! for forward compatibility and is not read or written by any component.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::info;

/// Default number of read-only connections for file-backed stores.
pub const DEFAULT_READ_POOL_SIZE: usize = 4;

const MAX_READ_POOL_SIZE: usize = 8;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from memory store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid timestamp '{value}': {reason}")]
    Timestamp { value: String, reason: String },
    #[error("{0} connection lock poisoned")]
    LockPoisoned(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryDb
// ─────────────────────────────────────────────────────────────────────────────

/// Pooled handle to the memory database. `Send + Sync`; share it as
/// `Arc<MemoryDb>`.
pub struct MemoryDb {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    path: Option<PathBuf>,
}

impl MemoryDb {
    /// Open (or create) a persistent store at `path` with the default reader
    /// pool size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_readers(path, DEFAULT_READ_POOL_SIZE)
    }

    /// Open (or create) a persistent store at `path` with `read_pool_size`
    /// read-only connections (clamped to `1..=8`).
    ///
    /// Missing parent directories are created. The schema is created if it
    /// does not exist yet; re-opening an existing file leaves it untouched.
    pub fn open_with_readers(
        path: impl AsRef<Path>,
        read_pool_size: usize,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(path)?;
        apply_pragmas(&writer)?;
        create_tables(&writer)?;

        // The writer stays open for the lifetime of the pool, which keeps the
        // -wal/-shm files around for the read-only connections.
        let size = read_pool_size.clamp(1, MAX_READ_POOL_SIZE);
        let mut readers = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            readers.push(Mutex::new(conn));
        }

        info!(path = %path.display(), readers = size, "opened memory store");
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a temporary in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let writer = Connection::open_in_memory()?;
        apply_pragmas(&writer)?;
        create_tables(&writer)?;
        Ok(Self {
            writer: Mutex::new(writer),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
            path: None,
        })
    }

    /// Create any missing tables. Safe to call any number of times.
    pub fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock_writer()?;
        create_tables(&conn)
    }

    /// Backing file, or `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of read-only connections (0 for in-memory stores).
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Run `f` inside one `IMMEDIATE` write transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    pub fn write<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` against a read connection (round-robin over the pool).
    pub fn read<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        if self.readers.is_empty() {
            let conn = self.lock_writer()?;
            return f(&conn);
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx]
            .lock()
            .map_err(|_| StoreError::LockPoisoned("reader"))?;
        f(&conn)
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.writer
            .lock()
            .map_err(|_| StoreError::LockPoisoned("writer"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Schema & pragmas
// ─────────────────────────────────────────────────────────────────────────────

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_atoms (
            entity_id    TEXT NOT NULL,
            dimension    TEXT NOT NULL,
            context_hash TEXT NOT NULL,
            magnitude    REAL NOT NULL,
            confidence   REAL NOT NULL,
            decay_rate   REAL NOT NULL,
            last_updated TEXT NOT NULL,
            PRIMARY KEY (entity_id, dimension, context_hash)
        );
        CREATE INDEX IF NOT EXISTS idx_memory_atoms_dimension
            ON memory_atoms (dimension);

        CREATE TABLE IF NOT EXISTS preferences (
            key        TEXT NOT NULL PRIMARY KEY,
            value      REAL NOT NULL,
            confidence REAL NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entity_relations (
            from_entity  TEXT NOT NULL,
            relation     TEXT NOT NULL,
            to_entity    TEXT NOT NULL,
            weight       REAL NOT NULL,
            last_updated TEXT NOT NULL,
            PRIMARY KEY (from_entity, relation, to_entity)
        );",
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Timestamp helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Timestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_sql(db: &MemoryDb) -> Vec<String> {
        db.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT sql FROM sqlite_master WHERE sql IS NOT NULL ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .unwrap()
    }

    #[test]
    fn in_memory_store_creates_all_tables() {
        let db = MemoryDb::open_in_memory().unwrap();
        let sql = schema_sql(&db).join("\n");
        assert!(sql.contains("memory_atoms"));
        assert!(sql.contains("preferences"));
        assert!(sql.contains("entity_relations"));
        assert_eq!(db.reader_count(), 0);
        assert!(db.path().is_none());
    }

    #[test]
    fn file_store_runs_in_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let db = MemoryDb::open(dir.path().join("kuro.db")).unwrap();
        let mode: String = db
            .write(|tx| Ok(tx.pragma_query_value(None, "journal_mode", |row| row.get(0))?))
            .unwrap();
        assert!(mode.eq_ignore_ascii_case("wal"));
        assert_eq!(db.reader_count(), DEFAULT_READ_POOL_SIZE);
    }

    #[test]
    fn open_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("kuro.db");
        MemoryDb::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn reader_pool_size_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let db = MemoryDb::open_with_readers(dir.path().join("a.db"), 64).unwrap();
        assert_eq!(db.reader_count(), MAX_READ_POOL_SIZE);
        let db = MemoryDb::open_with_readers(dir.path().join("b.db"), 0).unwrap();
        assert_eq!(db.reader_count(), 1);
    }

    #[test]
    fn schema_init_is_idempotent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kuro.db");

        let before = {
            let db = MemoryDb::open(&path).unwrap();
            db.write(|tx| {
                tx.execute(
                    "INSERT INTO preferences (key, value, confidence, updated_at)
                     VALUES ('tone', 0.1, 0.5, '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
            db.init_schema().unwrap();
            db.init_schema().unwrap();
            schema_sql(&db)
        };

        let db = MemoryDb::open(&path).unwrap();
        db.init_schema().unwrap();
        assert_eq!(schema_sql(&db), before);

        let count: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM preferences", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn failed_write_rolls_back() {
        let db = MemoryDb::open_in_memory().unwrap();
        let result: Result<(), StoreError> = db.write(|tx| {
            tx.execute(
                "INSERT INTO preferences (key, value, confidence, updated_at)
                 VALUES ('k', 1.0, 0.5, '2026-01-01T00:00:00Z')",
                [],
            )?;
            Err(StoreError::LockPoisoned("test"))
        });
        assert!(result.is_err());

        let count: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM preferences", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn timestamp_roundtrip_keeps_microseconds() {
        let ts = DateTime::parse_from_rfc3339("2026-03-01T12:30:45.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_ts(&format_ts(ts)).unwrap(), ts);
    }

    #[test]
    fn parse_ts_rejects_garbage() {
        let err = parse_ts("yesterday").unwrap_err();
        assert!(matches!(err, StoreError::Timestamp { .. }));
    }
}
