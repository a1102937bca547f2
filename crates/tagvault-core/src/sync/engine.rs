//! One complete tag repository sync.
//!
//! Order of a run: session, resume counter, metadata, ordered fetch into the
//! commit pipeline, durable relation load, counter advance, reconciliation.
//! The counter moves only after the relations are on stable storage, so a
//! failed run is re-fetched from the old counter and re-applied harmlessly.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::archive::Archive;
use crate::config::Config;
use crate::errors::{VaultError, VaultResult};
use crate::models::{SyncPhase, SyncProgress, SyncReport};
use crate::sync::commit::{CommitOptions, CommitPipeline};
use crate::sync::feed::TagFeed;
use crate::sync::pool::{fetch_ordered, FetchOptions};
use crate::sync::reconcile::reconcile_tags;
use crate::sync::{CancelToken, SyncProgressCallback};

pub struct SyncEngine<F: TagFeed> {
    feed: Arc<F>,
    archive: Arc<Archive>,
    config: Config,
    cancel: CancelToken,
}

impl<F: TagFeed + 'static> SyncEngine<F> {
    pub fn new(feed: F, archive: Arc<Archive>, config: Config) -> Self {
        Self {
            feed: Arc::new(feed),
            archive,
            config,
            cancel: CancelToken::new(),
        }
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    /// Token that stops the fetch phase of a running sync.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Pull every update published since the last successful run, load the
    /// relations and reconcile local records.
    ///
    /// Fetch and load failures are returned as [`VaultError::Aborted`] with
    /// the number of updates applied so far; reconciliation failures as
    /// [`VaultError::Reconcile`].
    pub fn sync_tag_repository(
        &self,
        progress: &mut dyn SyncProgressCallback,
    ) -> VaultResult<SyncReport> {
        let started = Instant::now();
        let store = self.archive.store();
        let counter_key = self.config.counter_key();

        let session = self.feed.get_session()?;
        let counter_before = store.read_counter(&counter_key)?;
        let meta = self.feed.get_repo_meta(&session, counter_before)?;
        info!(
            since = counter_before,
            updates = meta.count,
            blobs = meta.hashes.len(),
            "repository metadata fetched"
        );

        let mut report = SyncReport {
            counter_before,
            counter_after: counter_before,
            ..SyncReport::default()
        };

        if meta.count > 0 || !meta.hashes.is_empty() {
            let total = meta.hashes.len();
            let aborted = |applied: usize, e: VaultError| VaultError::Aborted {
                applied,
                total,
                source: Box::new(e),
            };

            let mut pipeline = CommitPipeline::open(store, &CommitOptions::from_config(&self.config))
                .map_err(|e| aborted(0, e))?;
            let mut applied = 0usize;
            fetch_ordered(
                Arc::clone(&self.feed),
                &session,
                &meta.hashes,
                &FetchOptions::from_config(&self.config),
                &self.cancel,
                |idx, update| {
                    pipeline.apply(&update)?;
                    applied = idx + 1;
                    progress.progress(SyncProgress {
                        phase: SyncPhase::Fetching,
                        done: applied,
                        total,
                    });
                    Ok(())
                },
            )
            .map_err(|e| {
                warn!(applied, total, error = %e, "sync aborted during fetch");
                aborted(applied, e)
            })?;

            progress.progress(SyncProgress {
                phase: SyncPhase::Loading,
                done: 0,
                total: 1,
            });
            let stats = pipeline.finish().map_err(|e| aborted(applied, e))?;
            progress.progress(SyncProgress {
                phase: SyncPhase::Loading,
                done: 1,
                total: 1,
            });

            let counter_after = counter_before + meta.count;
            store
                .write_counter(&counter_key, counter_after)
                .map_err(|e| aborted(applied, e))?;
            info!(from = counter_before, to = counter_after, "resume counter advanced");

            report.counter_after = counter_after;
            report.updates_applied = stats.updates;
            report.tag_rows = stats.tag_rows;
            report.hash_rows = stats.hash_rows;
            report.pair_rows = stats.pair_rows;
        }

        report.reconcile = reconcile_tags(&self.archive, self.config.reconcile_batch_size, progress)?;
        report.elapsed = started.elapsed();
        info!(
            updates = report.updates_applied,
            records_updated = report.reconcile.updated,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "tag repository sync finished"
        );
        Ok(report)
    }
}
