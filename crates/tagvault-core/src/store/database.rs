//! SQLite key/value storage layer for tagvault.
//!
//! Every bucket is a byte-ordered keyspace inside the `kv` table. Callers
//! only see the primitives the sync engine needs: transactions, point
//! `put`/`get`/`delete` and ordered prefix scans.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::errors::{VaultError, VaultResult};
use crate::store::schema;

/// Bucket names used across the crate.
pub mod buckets {
    /// Engine metadata such as resume counters.
    pub const META: &str = "meta";
    /// Remote content hash (32 bytes) -> remote hash id (8 bytes LE).
    pub const HASH_TO_ID: &str = "remote:hash->id";
    /// Composite `(hash id LE, tag id LE)` keys with empty values.
    pub const HASH_TAG: &str = "remote:hash:tag";
    /// Remote tag id (8 bytes LE) -> normalized tag text.
    pub const ID_TO_TAG: &str = "remote:id->tag";
    /// Local file id (8 bytes BE) -> JSON record.
    pub const RECORDS: &str = "records";
    /// Secondary content hash (32 bytes) -> local file id (8 bytes BE).
    pub const SHA256: &str = "sha256";
    /// Tag text -> concatenated local file ids (8 bytes BE each).
    pub const TAGS: &str = "tags";
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Helper: tilde expansion
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

/// Smallest byte string strictly greater than every key starting with
/// `prefix`, or `None` when no such bound exists (empty or all-`0xFF`).
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last != u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

pub fn encode_counter(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

pub fn decode_counter(raw: &[u8]) -> VaultResult<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| VaultError::Store(format!("counter has {} bytes, expected 8", raw.len())))?;
    Ok(u64::from_le_bytes(bytes))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the archive's SQLite file.
///
/// Cheap to clone; every operation opens its own connection so that the
/// caller never has to manage connection lifetime across threads.
#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Resolve `db_path`, create parent directories and bring the schema up
    /// to date.
    pub fn open(db_path: impl AsRef<Path>) -> VaultResult<Self> {
        let expanded = expand_tilde(&db_path.as_ref().to_string_lossy());
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(&expanded)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path: resolved };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open a new connection with the busy timeout applied.
    pub fn connect(&self) -> VaultResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Set WAL mode, create all tables, then run pending migrations.
    pub fn init_schema(&self) -> VaultResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    /// Run `f` inside a write transaction and commit if it succeeds.
    pub fn with_txn<T>(&self, f: impl FnOnce(&Txn<'_>) -> VaultResult<T>) -> VaultResult<T> {
        let mut conn = self.connect()?;
        let txn = Txn::begin_write(&mut conn)?;
        let out = f(&txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Run `f` inside a read transaction (a consistent snapshot).
    pub fn with_read_txn<T>(&self, f: impl FnOnce(&Txn<'_>) -> VaultResult<T>) -> VaultResult<T> {
        let mut conn = self.connect()?;
        let txn = Txn::begin(&mut conn)?;
        let out = f(&txn)?;
        txn.rollback()?;
        Ok(out)
    }

    pub fn get(&self, bucket: &str, key: &[u8]) -> VaultResult<Option<Vec<u8>>> {
        self.with_read_txn(|txn| txn.get(bucket, key))
    }

    /// Read a `u64` counter from the meta bucket, defaulting to 0.
    pub fn read_counter(&self, key: &str) -> VaultResult<u64> {
        match self.get(buckets::META, key.as_bytes())? {
            Some(raw) => decode_counter(&raw),
            None => Ok(0),
        }
    }

    /// Durably write a `u64` counter to the meta bucket.
    pub fn write_counter(&self, key: &str, value: u64) -> VaultResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA synchronous = FULL;")?;
        conn.execute(
            "INSERT INTO kv(bucket, key, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value;",
            params![buckets::META, key.as_bytes(), &encode_counter(value)[..]],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Txn
// ---------------------------------------------------------------------------

/// A transaction over the bucket store. Dropping it without `commit` rolls
/// back.
pub struct Txn<'c> {
    tx: rusqlite::Transaction<'c>,
}

impl<'c> Txn<'c> {
    /// Deferred transaction, suitable for reads.
    pub fn begin(conn: &'c mut Connection) -> VaultResult<Self> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        Ok(Self { tx })
    }

    /// Takes the write lock up front so the transaction never has to upgrade.
    pub fn begin_write(conn: &'c mut Connection) -> VaultResult<Self> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(Self { tx })
    }

    pub fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> VaultResult<()> {
        self.tx
            .prepare_cached(
                "INSERT INTO kv(bucket, key, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value;",
            )?
            .execute(params![bucket, key, value])?;
        Ok(())
    }

    pub fn get(&self, bucket: &str, key: &[u8]) -> VaultResult<Option<Vec<u8>>> {
        let value = self
            .tx
            .prepare_cached("SELECT value FROM kv WHERE bucket = ?1 AND key = ?2;")?
            .query_row(params![bucket, key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    pub fn delete(&self, bucket: &str, key: &[u8]) -> VaultResult<bool> {
        let removed = self
            .tx
            .prepare_cached("DELETE FROM kv WHERE bucket = ?1 AND key = ?2;")?
            .execute(params![bucket, key])?;
        Ok(removed > 0)
    }

    /// Visit every `(key, value)` in `bucket` whose key starts with `prefix`,
    /// in ascending byte order. `f` returning an error stops the scan.
    pub fn for_each_prefix<F>(&self, bucket: &str, prefix: &[u8], mut f: F) -> VaultResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> VaultResult<()>,
    {
        let upper = prefix_upper_bound(prefix);
        let mut stmt;
        let mut rows = match &upper {
            Some(upper) => {
                stmt = self.tx.prepare_cached(
                    "SELECT key, value FROM kv \
                     WHERE bucket = ?1 AND key >= ?2 AND key < ?3 ORDER BY key;",
                )?;
                stmt.query(params![bucket, prefix, upper])?
            }
            None => {
                stmt = self.tx.prepare_cached(
                    "SELECT key, value FROM kv WHERE bucket = ?1 AND key >= ?2 ORDER BY key;",
                )?;
                stmt.query(params![bucket, prefix])?
            }
        };
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            if !key.starts_with(prefix) {
                break;
            }
            f(&key, &value)?;
        }
        Ok(())
    }

    /// Collecting variant of [`Txn::for_each_prefix`].
    pub fn scan_prefix(&self, bucket: &str, prefix: &[u8]) -> VaultResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        self.for_each_prefix(bucket, prefix, |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            Ok(())
        })?;
        Ok(out)
    }

    pub fn commit(self) -> VaultResult<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> VaultResult<()> {
        self.tx.rollback()?;
        Ok(())
    }
}
