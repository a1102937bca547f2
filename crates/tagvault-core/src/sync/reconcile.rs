//! Merges remote tags into already-imported records.
//!
//! Every record with a secondary hash is looked up in the remote relations
//! and its tag set is extended with what was found. Only additions are made,
//! so a pass can be repeated at any time. Records are processed in batches;
//! each batch holds the archive's index lock and one write transaction, and
//! publishes its index changes before releasing the lock.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::archive::{record_key, Archive, Record, TagIndex};
use crate::errors::{VaultError, VaultResult};
use crate::models::{ContentHash, FileId, ReconcileStats, SyncPhase, SyncProgress};
use crate::store::database::buckets;
use crate::sync::relations::lookup_remote_tags;
use crate::sync::SyncProgressCallback;
use crate::tags;

pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Run one reconciliation pass over the whole archive.
///
/// Any failure aborts the pass with [`VaultError::Reconcile`], reporting how
/// many candidate records had been committed.
pub fn reconcile_tags(
    archive: &Archive,
    batch_size: usize,
    progress: &mut dyn SyncProgressCallback,
) -> VaultResult<ReconcileStats> {
    let candidates = collect_candidates(archive).map_err(|e| VaultError::Reconcile {
        processed: 0,
        total: 0,
        source: Box::new(e),
    })?;
    let total = candidates.len();
    info!(records = total, "reconciling remote tags");

    let mut stats = ReconcileStats::default();
    let mut processed = 0;
    progress.progress(SyncProgress {
        phase: SyncPhase::Reconciling,
        done: 0,
        total,
    });

    for batch in candidates.chunks(batch_size.max(1)) {
        reconcile_batch(archive, batch, &mut stats).map_err(|e| VaultError::Reconcile {
            processed,
            total,
            source: Box::new(e),
        })?;
        processed += batch.len();
        progress.progress(SyncProgress {
            phase: SyncPhase::Reconciling,
            done: processed,
            total,
        });
    }

    info!(
        examined = stats.examined,
        updated = stats.updated,
        tags_added = stats.tags_added,
        "reconciliation finished"
    );
    Ok(stats)
}

fn collect_candidates(archive: &Archive) -> VaultResult<Vec<(FileId, ContentHash)>> {
    let mut out = Vec::new();
    archive.iterate_records(|id, record| {
        if let Some(hash) = record.sha256_bytes()? {
            out.push((id, hash));
        }
        Ok(())
    })?;
    Ok(out)
}

fn reconcile_batch(
    archive: &Archive,
    batch: &[(FileId, ContentHash)],
    stats: &mut ReconcileStats,
) -> VaultResult<()> {
    let mut index = archive.write_index();
    let (staged, batch_stats) = archive.store().with_txn(|txn| {
        let mut batch_stats = ReconcileStats::default();
        let mut additions: BTreeMap<String, Vec<FileId>> = BTreeMap::new();

        for (id, hash) in batch {
            let key = record_key(*id);
            let Some(raw) = txn.get(buckets::RECORDS, &key)? else {
                debug!(id, "record removed before reconciliation");
                continue;
            };
            batch_stats.examined += 1;

            let remote = lookup_remote_tags(txn, hash)?;
            if remote.is_empty() {
                continue;
            }
            let mut record = Record::decode(&raw)?;
            let merged = tags::merge_tag_sets(&record.tags, &remote);
            let added: Vec<String> = merged
                .iter()
                .filter(|t| !record.tags.contains(*t))
                .cloned()
                .collect();
            if added.is_empty() {
                continue;
            }

            record.tags = merged;
            txn.put(buckets::RECORDS, &key, &record.encode()?)?;
            batch_stats.updated += 1;
            batch_stats.tags_added += added.len();
            for tag in added {
                additions.entry(tag).or_default().push(*id);
            }
        }

        let staged = index.stage(
            additions
                .iter()
                .flat_map(|(tag, ids)| ids.iter().map(move |id| (tag.as_str(), *id))),
        );
        TagIndex::persist(txn, &staged)?;
        Ok((staged, batch_stats))
    })?;
    index.apply(staged);
    drop(index);

    stats.examined += batch_stats.examined;
    stats.updated += batch_stats.updated;
    stats.tags_added += batch_stats.tags_added;
    Ok(())
}
