//! Applies decoded updates to the remote relations.
//!
//! Tag definitions are small and written straight through the bulk loader
//! in application order, committed at the end of each update so the write
//! lock is not held across fetches. Hash definitions and content pairs are
//! pushed into two external sorters and loaded in key order once the feed
//! is drained.

use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::Config;
use crate::errors::VaultResult;
use crate::models::{ContentUpdate, DefinitionUpdate, Update};
use crate::store::bulk::BulkLoader;
use crate::store::database::{buckets, Store};
use crate::sync::relations::{
    encode_hash_record, encode_id, encode_pair, split_hash_record, HASH_RECORD_WIDTH, PAIR_WIDTH,
};
use crate::sync::sorter::{ExternalSorter, DEFAULT_BUFFER_BYTES};

#[derive(Debug, Clone)]
pub struct CommitOptions {
    pub batch_size: usize,
    pub sort_buffer_bytes: usize,
    pub temp_dir: Option<PathBuf>,
}

impl CommitOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.commit_batch_size,
            sort_buffer_bytes: config.sort_buffer_bytes,
            temp_dir: config.temp_dir.clone(),
        }
    }
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            batch_size: 100_000,
            sort_buffer_bytes: DEFAULT_BUFFER_BYTES,
            temp_dir: None,
        }
    }
}

/// Rows written by one pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub updates: usize,
    pub tag_rows: u64,
    pub hash_rows: u64,
    pub pair_rows: u64,
}

pub struct CommitPipeline {
    loader: BulkLoader,
    hashes: ExternalSorter,
    pairs: ExternalSorter,
    stats: CommitStats,
}

impl CommitPipeline {
    pub fn open(store: &Store, options: &CommitOptions) -> VaultResult<Self> {
        let temp = options.temp_dir.as_deref();
        // Both sorters may fill up at once; split the budget between them.
        let per_sorter = (options.sort_buffer_bytes / 2).max(HASH_RECORD_WIDTH);
        Ok(Self {
            loader: BulkLoader::open(store, options.batch_size)?,
            hashes: ExternalSorter::new(HASH_RECORD_WIDTH, per_sorter, temp)?,
            pairs: ExternalSorter::new(PAIR_WIDTH, per_sorter, temp)?,
            stats: CommitStats::default(),
        })
    }

    pub fn apply(&mut self, update: &Update) -> VaultResult<()> {
        match update {
            Update::Definition(def) => self.apply_definition(def)?,
            Update::Content(content) => self.apply_content(content)?,
        }
        self.stats.updates += 1;
        Ok(())
    }

    fn apply_definition(&mut self, def: &DefinitionUpdate) -> VaultResult<()> {
        for (id, tag) in &def.tags {
            self.loader.put(buckets::ID_TO_TAG, &encode_id(*id), tag.as_bytes())?;
        }
        self.stats.tag_rows += def.tags.len() as u64;
        // Release the write lock before the next network fetch.
        self.loader.checkpoint()?;

        if !def.hashes.is_empty() {
            let mut buf = Vec::with_capacity(def.hashes.len() * HASH_RECORD_WIDTH);
            for (id, hash) in &def.hashes {
                buf.extend_from_slice(&encode_hash_record(hash, *id));
            }
            self.hashes.write_all(&buf)?;
        }
        Ok(())
    }

    fn apply_content(&mut self, content: &ContentUpdate) -> VaultResult<()> {
        let pairs: usize = content.rows.iter().map(|r| r.hash_ids.len()).sum();
        if pairs == 0 {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(pairs * PAIR_WIDTH);
        for row in &content.rows {
            for hash_id in &row.hash_ids {
                buf.extend_from_slice(&encode_pair(*hash_id, row.tag_id));
            }
        }
        self.pairs.write_all(&buf)?;
        Ok(())
    }

    /// Close both sorters into the store and make everything durable.
    pub fn finish(self) -> VaultResult<CommitStats> {
        let Self {
            mut loader,
            hashes,
            pairs,
            mut stats,
        } = self;
        debug!(
            hash_records = hashes.len(),
            hash_runs = hashes.runs(),
            pair_records = pairs.len(),
            pair_runs = pairs.runs(),
            "closing sorters"
        );

        stats.hash_rows = hashes.finish(|record| {
            let (hash, id) = split_hash_record(record)?;
            loader.put(buckets::HASH_TO_ID, hash, id)
        })?;
        stats.pair_rows = pairs.finish(|key| loader.put(buckets::HASH_TAG, key, &[]))?;

        let written = loader.finish()?;
        info!(
            updates = stats.updates,
            tag_rows = stats.tag_rows,
            hash_rows = stats.hash_rows,
            pair_rows = stats.pair_rows,
            keys = written,
            "relations loaded"
        );
        Ok(stats)
    }
}
