//! Batched bulk-load path into the bucket store.
//!
//! Durability is relaxed (`synchronous = OFF`) for the lifetime of the
//! loader and restored once in [`BulkLoader::finish`], which also forces a
//! full WAL checkpoint. The write transaction is opened by the first `put`
//! after a commit and committed every `batch_size` keys or on
//! [`BulkLoader::checkpoint`], so an idle loader holds no lock.

use rusqlite::{params, Connection};
use tracing::debug;

use crate::errors::VaultResult;
use crate::store::database::Store;

pub struct BulkLoader {
    conn: Connection,
    batch_size: usize,
    in_txn: bool,
    pending: usize,
    written: u64,
    checkpoints: u64,
}

impl BulkLoader {
    pub fn open(store: &Store, batch_size: usize) -> VaultResult<Self> {
        let conn = store.connect()?;
        conn.execute_batch("PRAGMA synchronous = OFF;")?;
        Ok(Self {
            conn,
            batch_size: batch_size.max(1),
            in_txn: false,
            pending: 0,
            written: 0,
            checkpoints: 0,
        })
    }

    pub fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> VaultResult<()> {
        if !self.in_txn {
            self.conn.execute_batch("BEGIN IMMEDIATE;")?;
            self.in_txn = true;
        }
        self.conn
            .prepare_cached(
                "INSERT INTO kv(bucket, key, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value;",
            )?
            .execute(params![bucket, key, value])?;
        self.pending += 1;
        self.written += 1;
        if self.pending >= self.batch_size {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Commit the open batch and release the write lock.
    pub fn checkpoint(&mut self) -> VaultResult<()> {
        if !self.in_txn {
            return Ok(());
        }
        self.conn.execute_batch("COMMIT;")?;
        self.in_txn = false;
        self.checkpoints += 1;
        debug!(
            keys = self.pending,
            total = self.written,
            batch = self.checkpoints,
            "bulk batch committed"
        );
        self.pending = 0;
        Ok(())
    }

    /// Keys written so far, committed or not.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Commit the final batch and force everything to stable storage.
    pub fn finish(mut self) -> VaultResult<u64> {
        self.checkpoint()?;
        self.conn.execute_batch("PRAGMA synchronous = FULL;")?;
        self.conn.execute_batch("PRAGMA wal_checkpoint(FULL);")?;
        debug!(total = self.written, "bulk load finished");
        Ok(self.written)
    }
}
